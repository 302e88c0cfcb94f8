//! Linearize a localized query tree into ordered operations.
//!
//! The tree is consumed bottom-up: a binary operator whose two children
//! are execution-ready leaves goes first (fetching the right operand
//! over when the sites differ), otherwise a unary operator with a ready
//! child. Each reduced subtree is replaced by a localized leaf named
//! after the step, until the root itself has been emitted.

use petgraph::stable_graph::NodeIndex;
use tracing::debug;

use super::OpKind;
use super::Operation;
use super::build_relation_name;
use super::component_relations;
use crate::catalog::SiteId;
use crate::error::QueryError;
use crate::query_tree::QueryTree;
use crate::query_tree::RelationNode;
use crate::query_tree::TreeNode;

/// The ordered operations and where the final intermediate lands.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub ops: Vec<Operation>,
    pub final_site: SiteId,
    pub final_relation: String,
}

pub fn plan_execution(tree: &mut QueryTree, qid: &str) -> Result<ExecutionPlan, QueryError> {
    let mut ops: Vec<Operation> = Vec::new();

    loop {
        let Some((children, parent)) = executable_nodes(tree)? else {
            return Err(QueryError::plan(
                "no actionable node found in the query tree",
            ));
        };

        match children.as_slice() {
            [left, right] => reduce_binary(tree, qid, &mut ops, *left, *right, parent)?,
            [only] => {
                if let Some(plan) = reduce_unary(tree, qid, &mut ops, *only, parent)? {
                    for op in &plan.ops {
                        debug!(%op, "planned");
                    }
                    return Ok(plan);
                }
            }
            _ => return Err(QueryError::plan("executable node with unexpected arity")),
        }
    }
}

/// Find the next reducible operator: binary operators over two ready
/// leaves take precedence over unary ones.
fn executable_nodes(
    tree: &QueryTree,
) -> Result<Option<(Vec<NodeIndex>, NodeIndex)>, QueryError> {
    for index in tree.node_indices() {
        if matches!(tree.node(index)?, TreeNode::Join(_) | TreeNode::Union) {
            let children = tree.children(index);
            if children.len() == 2
                && children.iter().all(|&child| tree.is_localized_leaf(child))
            {
                return Ok(Some((children, index)));
            }
        }
    }
    for index in tree.node_indices() {
        if matches!(
            tree.node(index)?,
            TreeNode::Selection(_) | TreeNode::Projection(_)
        ) {
            let children = tree.children(index);
            if children.len() == 1 && tree.is_localized_leaf(children[0]) {
                return Ok(Some((children, index)));
            }
        }
    }
    Ok(None)
}

fn leaf_relation(tree: &QueryTree, index: NodeIndex) -> Result<(String, SiteId), QueryError> {
    let relation = tree.relation(index)?;
    let site = relation
        .site
        .ok_or_else(|| QueryError::plan(format!("leaf `{}` has no site", relation.name)))?;
    Ok((relation.name.clone(), site))
}

fn reduce_binary(
    tree: &mut QueryTree,
    qid: &str,
    ops: &mut Vec<Operation>,
    left: NodeIndex,
    right: NodeIndex,
    parent: NodeIndex,
) -> Result<(), QueryError> {
    let (left_name, site) = leaf_relation(tree, left)?;
    let (right_name, right_site) = leaf_relation(tree, right)?;

    // Co-locate the right operand first when it lives elsewhere.
    let local_right = if right_site != site {
        let fetched = build_relation_name(qid, ops.len(), component_relations(&right_name));
        ops.push(Operation {
            site,
            kind: OpKind::Fetch {
                relation: right_name.clone(),
                source_site: right_site,
            },
            target: fetched.clone(),
        });
        fetched
    } else {
        right_name.clone()
    };

    let components = component_relations(&left_name)
        .into_iter()
        .chain(component_relations(&right_name));
    let target = build_relation_name(qid, ops.len(), components);

    let kind = match tree.node(parent)? {
        TreeNode::Union => OpKind::Union {
            left: left_name,
            right: local_right,
        },
        TreeNode::Join(join) => OpKind::Join {
            left: left_name,
            right: local_right,
            condition: join.condition.clone(),
        },
        other => {
            return Err(QueryError::plan(format!(
                "did not expect node {other} above two leaves"
            )));
        }
    };
    ops.push(Operation {
        site,
        kind,
        target: target.clone(),
    });

    let grandparent = tree
        .parent(parent)
        .ok_or_else(|| QueryError::plan("binary operator at the root of the query tree"))?;
    tree.remove_node(left);
    tree.remove_node(right);
    tree.remove_node(parent);
    let leaf = tree.add_node(TreeNode::Relation(RelationNode::localized(target, site)));
    tree.add_edge(grandparent, leaf);
    Ok(())
}

/// Reduce a selection or projection. Returns the finished plan when the
/// operator was the root.
fn reduce_unary(
    tree: &mut QueryTree,
    qid: &str,
    ops: &mut Vec<Operation>,
    child: NodeIndex,
    parent: NodeIndex,
) -> Result<Option<ExecutionPlan>, QueryError> {
    let (name, site) = leaf_relation(tree, child)?;
    let target = build_relation_name(qid, ops.len(), component_relations(&name));

    let kind = match tree.node(parent)? {
        TreeNode::Selection(selection) => OpKind::Select {
            relation: name,
            condition: selection.condition.clone(),
        },
        TreeNode::Projection(projection) => OpKind::Project {
            relation: name,
            columns: projection.columns.clone(),
            group_by: projection.group_by.clone(),
            having: projection.having.clone(),
        },
        other => {
            return Err(QueryError::plan(format!(
                "did not expect node {other} above a single leaf"
            )));
        }
    };
    ops.push(Operation {
        site,
        kind,
        target: target.clone(),
    });

    let grandparent = tree.parent(parent);
    tree.remove_node(child);
    tree.remove_node(parent);
    match grandparent {
        None => Ok(Some(ExecutionPlan {
            ops: std::mem::take(ops),
            final_site: site,
            final_relation: target,
        })),
        Some(grandparent) => {
            let leaf = tree.add_node(TreeNode::Relation(RelationNode::localized(target, site)));
            tree.add_edge(grandparent, leaf);
            Ok(None)
        }
    }
}
