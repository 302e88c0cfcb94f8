//! The relational-algebra query tree.
//!
//! A directed graph with parent→child edges: the root is the final
//! result, leaves are relations. Node identity is the petgraph
//! `NodeIndex`, so two selections carrying identical conditions remain
//! distinct nodes. No back-pointers are stored; the head of a chain is
//! found by following incoming edges.

use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;

use petgraph::Direction;
use petgraph::stable_graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;

use crate::catalog::SiteId;
use crate::error::QueryError;
use crate::sql::Condition;

mod build;
mod localize;

pub use build::build_query_tree;
pub use localize::optimize_and_localize;

/// A leaf relation: a logical table before localization, a physical
/// fragment (or planned intermediate) afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationNode {
    pub name: String,
    pub localized: bool,
    pub site: Option<SiteId>,
}

impl RelationNode {
    pub fn logical(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            localized: false,
            site: None,
        }
    }

    pub fn localized(name: impl Into<String>, site: SiteId) -> Self {
        Self {
            name: name.into(),
            localized: true,
            site: Some(site),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionNode {
    pub condition: Condition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionNode {
    pub columns: Vec<String>,
    /// Grouping for the final projection; pushed-down projections carry
    /// columns only.
    pub group_by: Option<Vec<String>>,
    pub having: Option<Condition>,
}

impl ProjectionNode {
    pub fn columns_only(columns: Vec<String>) -> Self {
        Self {
            columns,
            group_by: None,
            having: None,
        }
    }
}

/// A join; `None` condition is a Cartesian product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinNode {
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeNode {
    Relation(RelationNode),
    Selection(SelectionNode),
    Projection(ProjectionNode),
    Join(JoinNode),
    Union,
}

impl Display for TreeNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TreeNode::Relation(relation) => {
                write!(f, "{}", relation.name)?;
                match relation.site {
                    Some(site) => write!(f, "@{site}"),
                    None => write!(f, "*"),
                }
            }
            TreeNode::Selection(selection) => write!(f, "σ{}", selection.condition),
            TreeNode::Projection(projection) => {
                write!(f, "π[{}]", projection.columns.join(", "))
            }
            TreeNode::Join(join) => match &join.condition {
                Some(condition) => write!(f, "⨝{condition}"),
                None => write!(f, "⨯"),
            },
            TreeNode::Union => write!(f, "∪"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryTree {
    graph: StableDiGraph<TreeNode, ()>,
}

impl QueryTree {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, index: NodeIndex) -> Result<&TreeNode, QueryError> {
        self.graph
            .node_weight(index)
            .ok_or_else(|| QueryError::plan("node vanished from the query tree"))
    }

    pub(crate) fn add_node(&mut self, node: TreeNode) -> NodeIndex {
        self.graph.add_node(node)
    }

    pub(crate) fn add_edge(&mut self, parent: NodeIndex, child: NodeIndex) {
        self.graph.add_edge(parent, child, ());
    }

    pub(crate) fn remove_node(&mut self, index: NodeIndex) {
        self.graph.remove_node(index);
    }

    pub(crate) fn remove_edge(&mut self, parent: NodeIndex, child: NodeIndex) {
        if let Some(edge) = self.graph.find_edge(parent, child) {
            self.graph.remove_edge(edge);
        }
    }

    /// Splice `node` between an existing `parent → child` edge.
    pub(crate) fn insert_between(&mut self, parent: NodeIndex, child: NodeIndex, node: NodeIndex) {
        self.remove_edge(parent, child);
        self.add_edge(parent, node);
        self.add_edge(node, child);
    }

    /// Remove a single-child node, reattaching its parents to the child.
    pub(crate) fn splice_out(&mut self, node: NodeIndex, child: NodeIndex) {
        for parent in self.parents(node) {
            self.add_edge(parent, child);
        }
        self.graph.remove_node(node);
    }

    /// The unique parent of a node, if any.
    pub fn parent(&self, index: NodeIndex) -> Option<NodeIndex> {
        self.parents(index).into_iter().next()
    }

    fn parents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut parents: Vec<_> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| edge.source())
            .collect();
        parents.reverse();
        parents
    }

    /// Children in edge-insertion order.
    pub fn children(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut children: Vec<_> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .map(|edge| edge.target())
            .collect();
        children.reverse();
        children
    }

    /// Follow incoming edges until a node without a parent: the current
    /// root of the chain `index` hangs under.
    pub fn head(&self, index: NodeIndex) -> NodeIndex {
        let mut current = index;
        while let Some(parent) = self.parent(current) {
            current = parent;
        }
        current
    }

    pub fn node_indices(&self) -> Vec<NodeIndex> {
        let mut indices: Vec<_> = self.graph.node_indices().collect();
        indices.sort();
        indices
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Nodes without outgoing edges, in index order.
    pub fn leaves(&self) -> Vec<NodeIndex> {
        self.node_indices()
            .into_iter()
            .filter(|&index| {
                self.graph
                    .edges_directed(index, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .collect()
    }

    pub fn roots(&self) -> Vec<NodeIndex> {
        self.node_indices()
            .into_iter()
            .filter(|&index| {
                self.graph
                    .edges_directed(index, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    /// Whether a node is a localized relation leaf, ready for execution.
    pub fn is_localized_leaf(&self, index: NodeIndex) -> bool {
        matches!(
            self.graph.node_weight(index),
            Some(TreeNode::Relation(relation)) if relation.localized
        ) && self.children(index).is_empty()
    }

    pub(crate) fn relation(&self, index: NodeIndex) -> Result<&RelationNode, QueryError> {
        match self.node(index)? {
            TreeNode::Relation(relation) => Ok(relation),
            other => Err(QueryError::plan(format!(
                "expected a relation node, found {other}"
            ))),
        }
    }

    /// An indented rendering of the tree, for logs and test failures.
    pub fn display(&self) -> String {
        fn walk(tree: &QueryTree, index: NodeIndex, depth: usize, out: &mut String) {
            if let Some(node) = tree.graph.node_weight(index) {
                out.push_str(&"  ".repeat(depth));
                out.push_str(&node.to_string());
                out.push('\n');
                for child in tree.children(index) {
                    walk(tree, child, depth + 1, out);
                }
            }
        }

        let mut out = String::new();
        for root in self.roots() {
            walk(self, root, 0, &mut out);
        }
        out
    }
}
