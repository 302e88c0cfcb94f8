//! Build the naive query tree from a resolved SELECT.
//!
//! One relation leaf per FROM table; WHERE conjuncts are applied most
//! selective first (fewest referenced relations), turning bare
//! equalities across two relation chains into joins; a projection with
//! the requested column list caps the tree.

use indexmap::IndexMap;
use indexmap::IndexSet;
use petgraph::stable_graph::NodeIndex;
use tracing::debug;

use super::JoinNode;
use super::ProjectionNode;
use super::QueryTree;
use super::RelationNode;
use super::SelectionNode;
use super::TreeNode;
use crate::catalog::SystemCatalog;
use crate::error::QueryError;
use crate::sql::Comparison;
use crate::sql::ComparisonOp;
use crate::sql::Condition;
use crate::sql::SelectQuery;

pub fn build_query_tree(
    catalog: &SystemCatalog,
    query: &SelectQuery,
) -> Result<QueryTree, QueryError> {
    let mut tree = QueryTree::new();

    let mut relation_leaves = IndexMap::new();
    for table in &query.tables {
        if catalog.table_by_name(table).is_none() {
            return Err(QueryError::UnknownTable(table.clone()));
        }
        let leaf = tree.add_node(TreeNode::Relation(RelationNode::logical(table)));
        relation_leaves.insert(table.clone(), leaf);
    }

    let mut conjuncts: Vec<(Condition, IndexSet<String>)> = query
        .where_clause
        .as_ref()
        .map(|where_clause| {
            where_clause
                .conjuncts()
                .iter()
                .map(|condition| {
                    let relations = condition.referenced_relations(&query.tables);
                    (condition.clone(), relations)
                })
                .collect()
        })
        .unwrap_or_default();
    // Single-relation conditions first: they shrink inputs before any
    // join is formed. The sort is stable, so parse order breaks ties.
    conjuncts.sort_by_key(|(_, relations)| relations.len());

    for (condition, relations) in conjuncts {
        debug!(%condition, "processing conjunct");
        match relations.len() {
            0 => {
                return Err(QueryError::plan(format!(
                    "condition {condition} references no relation of the FROM list"
                )));
            }
            1 => {
                let leaf = leaf_of(&relation_leaves, &relations[0])?;
                let head = tree.head(leaf);
                let selection = tree.add_node(TreeNode::Selection(SelectionNode { condition }));
                tree.add_edge(selection, head);
            }
            _ => {
                let mut heads = IndexSet::new();
                for relation in &relations {
                    heads.insert(tree.head(leaf_of(&relation_leaves, relation)?));
                }

                if is_bare_equality(&condition) && heads.len() == 2 {
                    let join = tree.add_node(TreeNode::Join(JoinNode {
                        condition: Some(condition),
                    }));
                    for head in heads {
                        tree.add_edge(join, head);
                    }
                } else if heads.len() == 1 {
                    let selection = tree.add_node(TreeNode::Selection(SelectionNode { condition }));
                    tree.add_edge(selection, heads[0]);
                } else {
                    // No equijoin to exploit: Cartesian product of the
                    // chains, filtered above.
                    let join = tree.add_node(TreeNode::Join(JoinNode { condition: None }));
                    for head in heads {
                        tree.add_edge(join, head);
                    }
                    let selection = tree.add_node(TreeNode::Selection(SelectionNode { condition }));
                    tree.add_edge(selection, join);
                }
            }
        }
    }

    let heads: IndexSet<NodeIndex> = relation_leaves
        .values()
        .map(|&leaf| tree.head(leaf))
        .collect();
    if heads.len() != 1 {
        return Err(QueryError::plan(
            "query graph is disjoint: the WHERE clause does not connect every FROM table",
        ));
    }

    let projection = tree.add_node(TreeNode::Projection(ProjectionNode {
        columns: query.columns.clone(),
        group_by: query.group_by.clone(),
        having: query.having.clone(),
    }));
    tree.add_edge(projection, heads[0]);

    Ok(tree)
}

fn leaf_of(
    relation_leaves: &IndexMap<String, NodeIndex>,
    relation: &str,
) -> Result<NodeIndex, QueryError> {
    relation_leaves
        .get(relation)
        .copied()
        .ok_or_else(|| QueryError::plan(format!("unknown relation accessed: {relation}")))
}

fn is_bare_equality(condition: &Condition) -> bool {
    matches!(
        condition,
        Condition::Comparison(Comparison {
            op: ComparisonOp::Eq,
            ..
        })
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sql::parser::parse_select;

    fn tree_for(sql: &str) -> QueryTree {
        let catalog = SystemCatalog::chat();
        let query = parse_select(&catalog, sql).expect("parses");
        build_query_tree(&catalog, &query).expect("builds")
    }

    #[test]
    fn single_table_chain() {
        let tree = tree_for("SELECT name FROM \"group\" WHERE created_by = 1");
        assert_eq!(
            tree.display(),
            "π[group.name]\n  σ(group.created_by = 1)\n    group*\n"
        );
    }

    #[test]
    fn equality_across_two_relations_becomes_a_join() {
        let tree = tree_for(
            "SELECT U.name, M.content FROM message M, \"user\" U \
             WHERE M.\"group\" = 1 AND M.author = U.id",
        );
        let display = tree.display();
        assert!(
            display.contains("⨝(message.author = user.id)"),
            "{display}"
        );
        // The single-relation condition is applied below the join.
        assert!(display.contains("σ(message.group = 1)\n      message*"), "{display}");
    }

    #[test]
    fn all_relations_share_one_head() {
        let tree = tree_for(
            "SELECT G.name, M.content FROM \"group\" G, message M, group_member GM, \"user\" U \
             WHERE GM.\"user\" = 1 AND U.id = 1 AND GM.\"group\" = G.id \
             AND M.sent_at > U.last_seen AND M.\"group\" = G.id",
        );
        assert_eq!(tree.roots().len(), 1);
    }

    #[test]
    fn disjoint_query_graph_is_rejected() {
        let catalog = SystemCatalog::chat();
        let query = parse_select(
            &catalog,
            "SELECT U.name, G.name FROM \"user\" U, \"group\" G WHERE U.id = 1",
        )
        .expect("parses");
        let error = build_query_tree(&catalog, &query).expect_err("disjoint");
        assert!(matches!(error, QueryError::Plan(_)));
    }

    #[test]
    fn non_equality_cross_relation_condition_builds_cartesian_join() {
        let tree = tree_for(
            "SELECT U.name FROM \"user\" U, message M WHERE M.sent_at > U.last_seen",
        );
        let display = tree.display();
        assert!(display.contains("σ(message.sent_at > user.last_seen)\n    ⨯"), "{display}");
    }
}
