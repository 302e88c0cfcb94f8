//! Optimization and localization of the naive query tree.
//!
//! In order: column-use analysis, replacement of every logical relation
//! leaf by the subtree of its fragments (pruning fragments the query
//! cannot touch), selection push-down through unions and joins,
//! projection push-down above every fragment leaf, and collapse of
//! degenerate joins. Afterwards every leaf is a localized relation with
//! a site.

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
use crate::catalog::Fragment;
use crate::catalog::FragmentPredicate;
use crate::catalog::FragmentType;
use crate::catalog::SystemCatalog;
use crate::catalog::Table;
use crate::error::QueryError;
use crate::sql::Comparison;
use crate::sql::ComparisonOp;
use crate::sql::Condition;
use crate::sql::SelectQuery;
use crate::sql::column_parts;
use crate::sql::integer_literal;

/// Columns each logical relation contributes to the query, keyed by
/// table name, as bare column names.
type ColumnsUsed = IndexMap<String, IndexSet<String>>;

/// `table.column = <int>` facts from the top-level conjuncts, used to
/// prune horizontal fragments.
type EqualityFacts = IndexMap<(String, String), i64>;

pub fn optimize_and_localize(
    catalog: &SystemCatalog,
    tree: &mut QueryTree,
    query: &SelectQuery,
) -> Result<(), QueryError> {
    let logical_leaves: Vec<(String, NodeIndex)> = tree
        .leaves()
        .into_iter()
        .filter_map(|leaf| match tree.node(leaf) {
            Ok(TreeNode::Relation(relation)) if !relation.localized => {
                Some((relation.name.clone(), leaf))
            }
            _ => None,
        })
        .collect();

    let columns_used = columns_used_in_query(tree, &logical_leaves)?;
    let equality_facts = equality_facts(query);

    for (name, leaf) in &logical_leaves {
        localize_relation(catalog, tree, name, *leaf, &columns_used, &equality_facts)?;
        debug!(relation = %name, "localized:\n{}", tree.display());
    }

    push_selections(catalog, tree)?;
    push_projections(catalog, tree, &columns_used)?;
    collapse_degenerate_joins(tree)?;
    ensure_localized(tree)
}

/// Walk upward from each relation leaf, collecting every column an
/// ancestor selection, join, or projection references.
fn columns_used_in_query(
    tree: &QueryTree,
    leaves: &[(String, NodeIndex)],
) -> Result<ColumnsUsed, QueryError> {
    let mut used = ColumnsUsed::new();
    for (name, leaf) in leaves {
        let mut columns = IndexSet::new();
        let mut current = *leaf;
        while let Some(parent) = tree.parent(current) {
            current = parent;
            match tree.node(current)? {
                TreeNode::Selection(selection) => {
                    columns.extend(selection.condition.referenced_columns(name));
                }
                TreeNode::Join(join) => {
                    if let Some(condition) = &join.condition {
                        columns.extend(condition.referenced_columns(name));
                    }
                }
                TreeNode::Projection(projection) => {
                    let group_by = projection.group_by.iter().flatten();
                    for reference in projection.columns.iter().chain(group_by) {
                        if let Some((table, column)) = column_parts(reference) {
                            if table == name {
                                columns.insert(column.to_string());
                            }
                        }
                    }
                    if let Some(having) = &projection.having {
                        columns.extend(having.referenced_columns(name));
                    }
                }
                TreeNode::Relation(_) | TreeNode::Union => {}
            }
        }
        used.insert(name.clone(), columns);
    }
    Ok(used)
}

fn equality_facts(query: &SelectQuery) -> EqualityFacts {
    let mut facts = EqualityFacts::new();
    let Some(where_clause) = &query.where_clause else {
        return facts;
    };
    for conjunct in where_clause.conjuncts() {
        let Condition::Comparison(Comparison {
            lhs,
            op: ComparisonOp::Eq,
            rhs,
        }) = conjunct
        else {
            continue;
        };
        for (column_side, literal_side) in [(lhs, rhs), (rhs, lhs)] {
            if let (Some((table, column)), Some(value)) =
                (column_parts(column_side), integer_literal(literal_side))
            {
                facts.insert((table.to_string(), column.to_string()), value);
            }
        }
    }
    facts
}

/// Replace a logical relation leaf with the subtree over its fragments.
fn localize_relation(
    catalog: &SystemCatalog,
    tree: &mut QueryTree,
    name: &str,
    leaf: NodeIndex,
    columns_used: &ColumnsUsed,
    equality_facts: &EqualityFacts,
) -> Result<(), QueryError> {
    let table = catalog
        .table_by_name(name)
        .ok_or_else(|| QueryError::UnknownTable(name.to_string()))?;
    let fragments = catalog.fragments_of(table.id);
    if fragments.is_empty() {
        return Err(QueryError::catalog(format!(
            "table `{name}` has no fragments"
        )));
    }

    let subtree_root = match table.fragment_type {
        FragmentType::Unfragmented => localized_leaf(catalog, tree, fragments[0])?,
        FragmentType::Vertical => {
            let empty = IndexSet::new();
            let used = columns_used.get(name).unwrap_or(&empty);
            localize_vertical(catalog, tree, table, &fragments, used)?
        }
        FragmentType::Horizontal | FragmentType::DerivedHorizontal => {
            let kept = retained_horizontal_fragments(catalog, table, &fragments, equality_facts)?;
            let mut root = localized_leaf(catalog, tree, kept[0])?;
            for fragment in &kept[1..] {
                let union = tree.add_node(TreeNode::Union);
                let branch = localized_leaf(catalog, tree, fragment)?;
                tree.add_edge(union, root);
                tree.add_edge(union, branch);
                root = union;
            }
            root
        }
    };

    if let Some(parent) = tree.parent(leaf) {
        tree.add_edge(parent, subtree_root);
    }
    tree.remove_node(leaf);
    Ok(())
}

fn localized_leaf(
    catalog: &SystemCatalog,
    tree: &mut QueryTree,
    fragment: &Fragment,
) -> Result<NodeIndex, QueryError> {
    let site = catalog.site_of_fragment(fragment.id)?;
    Ok(tree.add_node(TreeNode::Relation(RelationNode::localized(
        fragment.name.clone(),
        site,
    ))))
}

/// A left-deep chain of primary-key equijoins over the fragments that
/// contribute at least one used column beyond the key.
fn localize_vertical(
    catalog: &SystemCatalog,
    tree: &mut QueryTree,
    table: &Table,
    fragments: &[&Fragment],
    used: &IndexSet<String>,
) -> Result<NodeIndex, QueryError> {
    let pk = catalog.primary_key_of(table.id)?.name.clone();
    let mut kept: Vec<&Fragment> = fragments
        .iter()
        .copied()
        .filter(|fragment| {
            SystemCatalog::vertical_columns(fragment)
                .iter()
                .any(|column| used.contains(column))
        })
        .collect();
    if kept.is_empty() {
        // Only the key is referenced; any single fragment can serve it.
        kept.push(fragments[0]);
    }

    let mut root = localized_leaf(catalog, tree, kept[0])?;
    for fragment in &kept[1..] {
        let branch = localized_leaf(catalog, tree, fragment)?;
        let join = tree.add_node(TreeNode::Join(JoinNode {
            condition: Some(Condition::comparison(
                format!("{}.{pk}", table.name),
                ComparisonOp::Eq,
                format!("{}.{pk}", fragment.name),
            )),
        }));
        tree.add_edge(join, root);
        tree.add_edge(join, branch);
        root = join;
    }
    Ok(root)
}

/// Drop horizontal fragments whose predicate contradicts an equality
/// fact of the query; derived-horizontal fragments inherit the parent
/// fragment's predicate through the foreign-key column.
fn retained_horizontal_fragments<'a>(
    catalog: &SystemCatalog,
    table: &Table,
    fragments: &[&'a Fragment],
    equality_facts: &EqualityFacts,
) -> Result<Vec<&'a Fragment>, QueryError> {
    let mut kept = Vec::new();
    for &fragment in fragments {
        let (predicate, column) = match table.fragment_type {
            FragmentType::Horizontal => {
                let predicate = FragmentPredicate::parse(&fragment.logic);
                let column = predicate.as_ref().map(|p| p.column().to_string());
                (predicate, column)
            }
            FragmentType::DerivedHorizontal => {
                let link = SystemCatalog::derived_link(fragment)?;
                let parent = catalog.fragment(link.parent_fragment)?;
                (FragmentPredicate::parse(&parent.logic), Some(link.fk_column))
            }
            _ => (None, None),
        };
        let keep = match (predicate, column) {
            (Some(predicate), Some(column)) => {
                match equality_facts.get(&(table.name.clone(), column)) {
                    Some(&value) => predicate.matches(value),
                    None => true,
                }
            }
            _ => true,
        };
        if keep {
            kept.push(fragment);
        } else {
            debug!(fragment = %fragment.name, "pruned by fragment predicate");
        }
    }
    if kept.is_empty() {
        kept.extend(fragments.iter().copied());
    }
    Ok(kept)
}

/// Push selections through unions (all branches) and into the join
/// branches that can evaluate them.
fn push_selections(catalog: &SystemCatalog, tree: &mut QueryTree) -> Result<(), QueryError> {
    let selections: Vec<NodeIndex> = tree
        .node_indices()
        .into_iter()
        .filter(|&index| matches!(tree.node(index), Ok(TreeNode::Selection(_))))
        .collect();
    for selection in selections {
        push_selection(catalog, tree, selection)?;
    }
    Ok(())
}

fn push_selection(
    catalog: &SystemCatalog,
    tree: &mut QueryTree,
    selection: NodeIndex,
) -> Result<(), QueryError> {
    let Some(parent) = tree.parent(selection) else {
        return Ok(());
    };
    let Some(child) = tree.children(selection).into_iter().next() else {
        return Ok(());
    };
    let TreeNode::Selection(SelectionNode { condition }) = tree.node(selection)?.clone() else {
        return Ok(());
    };

    let branches = tree.children(child);
    let targets: Vec<NodeIndex> = match tree.node(child)? {
        // A union needs the filter on every branch or none.
        TreeNode::Union => {
            let mut supported = Vec::new();
            for &branch in &branches {
                if condition_supported(catalog, tree, branch, &condition)? {
                    supported.push(branch);
                }
            }
            if supported.len() != branches.len() {
                return Ok(());
            }
            supported
        }
        // A join keeps its semantics when the filter lands on any branch
        // holding all referenced columns.
        TreeNode::Join(_) => {
            let mut supported = Vec::new();
            for &branch in &branches {
                if condition_supported(catalog, tree, branch, &condition)? {
                    supported.push(branch);
                }
            }
            if supported.is_empty() {
                return Ok(());
            }
            supported
        }
        _ => return Ok(()),
    };

    // Splice the selection out, then re-introduce it above each target.
    tree.remove_edge(selection, child);
    tree.remove_edge(parent, selection);
    tree.add_edge(parent, child);
    tree.remove_node(selection);

    for target in targets {
        let pushed = tree.add_node(TreeNode::Selection(SelectionNode {
            condition: condition.clone(),
        }));
        tree.insert_between(child, target, pushed);
        push_selection(catalog, tree, pushed)?;
    }
    Ok(())
}

/// Whether every column the condition references is available somewhere
/// in the subtree.
fn condition_supported(
    catalog: &SystemCatalog,
    tree: &QueryTree,
    subtree: NodeIndex,
    condition: &Condition,
) -> Result<bool, QueryError> {
    let available = available_columns(catalog, tree, subtree)?;
    for comparison in condition.comparisons() {
        for operand in [&comparison.lhs, &comparison.rhs] {
            if let Some((table, column)) = column_parts(operand) {
                if !available.contains(&(table.to_string(), column.to_string())) {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

fn available_columns(
    catalog: &SystemCatalog,
    tree: &QueryTree,
    subtree: NodeIndex,
) -> Result<IndexSet<(String, String)>, QueryError> {
    let mut available = IndexSet::new();
    match tree.node(subtree)? {
        TreeNode::Relation(relation) => {
            let Some(fragment) = catalog.fragment_by_name(&relation.name) else {
                return Ok(available);
            };
            let table = catalog.table(fragment.table)?;
            match table.fragment_type {
                FragmentType::Vertical => {
                    let pk = catalog.primary_key_of(table.id)?.name.clone();
                    for column in SystemCatalog::vertical_columns(fragment) {
                        available.insert((table.name.clone(), column));
                    }
                    available.insert((table.name.clone(), pk));
                }
                _ => {
                    for column in catalog.columns_of(table.id) {
                        available.insert((table.name.clone(), column.name.clone()));
                    }
                }
            }
        }
        _ => {
            for child in tree.children(subtree) {
                available.extend(available_columns(catalog, tree, child)?);
            }
        }
    }
    Ok(available)
}

/// Insert a projection above every fragment leaf keeping only the
/// columns the query can still need from it.
fn push_projections(
    catalog: &SystemCatalog,
    tree: &mut QueryTree,
    columns_used: &ColumnsUsed,
) -> Result<(), QueryError> {
    for leaf in tree.leaves() {
        let Ok(TreeNode::Relation(relation)) = tree.node(leaf) else {
            continue;
        };
        let Some(fragment) = catalog.fragment_by_name(&relation.name) else {
            continue;
        };
        let table = catalog.table(fragment.table)?;
        let empty = IndexSet::new();
        let used = columns_used.get(&table.name).unwrap_or(&empty);

        let columns: Vec<String> = match table.fragment_type {
            FragmentType::Vertical => {
                let fragment_columns = SystemCatalog::vertical_columns(fragment);
                let pk = catalog.primary_key_of(table.id)?.name.clone();
                let mut columns: Vec<String> = used
                    .iter()
                    .filter(|column| fragment_columns.contains(*column))
                    .cloned()
                    .collect();
                if !columns.contains(&pk) {
                    columns.push(pk);
                }
                columns
            }
            _ => used.iter().cloned().collect(),
        };
        if columns.is_empty() {
            continue;
        }

        let projection = tree.add_node(TreeNode::Projection(ProjectionNode::columns_only(columns)));
        match tree.parent(leaf) {
            Some(parent) => tree.insert_between(parent, leaf, projection),
            None => tree.add_edge(projection, leaf),
        }
    }
    Ok(())
}

/// Remove joins left with fewer than two children, promoting a single
/// child, until a fixed point.
fn collapse_degenerate_joins(tree: &mut QueryTree) -> Result<(), QueryError> {
    loop {
        let mut changed = false;
        for index in tree.node_indices() {
            let Ok(TreeNode::Join(_)) = tree.node(index) else {
                continue;
            };
            let children = tree.children(index);
            match children.len() {
                2 => {}
                1 => {
                    tree.splice_out(index, children[0]);
                    changed = true;
                }
                0 => {
                    tree.remove_node(index);
                    changed = true;
                }
                _ => {
                    return Err(QueryError::plan("join node with more than two children"));
                }
            }
        }
        if !changed {
            return Ok(());
        }
    }
}

fn ensure_localized(tree: &QueryTree) -> Result<(), QueryError> {
    for leaf in tree.leaves() {
        match tree.node(leaf)? {
            TreeNode::Relation(relation) if relation.localized && relation.site.is_some() => {}
            other => {
                return Err(QueryError::plan(format!(
                    "localization left a non-localized leaf: {other}"
                )));
            }
        }
    }
    Ok(())
}
