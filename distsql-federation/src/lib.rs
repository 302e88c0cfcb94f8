//! Query planning for a distributed relational engine over fragmented
//! tables.
//!
//! The pipeline turns a SQL string into an ordered list of site-local
//! operations:
//!
//! 1. [`sql::parser`] lowers a restricted SELECT/UPDATE dialect into a
//!    [`sql::SelectQuery`] (or an update shape consumed by two-phase
//!    commit), resolving every column reference against the
//!    [`catalog::SystemCatalog`].
//! 2. [`query_tree::build_query_tree`] turns the query into a relational
//!    algebra tree of selections, projections, joins and unions.
//! 3. [`query_tree::optimize_and_localize`] pushes selections and
//!    projections towards the leaves and replaces every logical relation
//!    with the subtree of its physical fragments.
//! 4. [`plan::plan_execution`] linearizes the localized tree into
//!    [`plan::Operation`]s tagged with the site that runs them.
//!
//! Everything in this crate is synchronous and side-effect free; the
//! sibling runtime crate owns the HTTP and database plumbing.

pub mod catalog;
pub mod error;
pub mod plan;
pub mod query_tree;
pub mod sql;

pub use error::QueryError;

use catalog::SystemCatalog;
use plan::ExecutionPlan;
use sql::SelectQuery;

/// Run the full planning pipeline for an already-parsed SELECT.
///
/// `qid` is the per-query identifier used as the prefix of every
/// intermediate relation name the plan creates.
pub fn plan_select(
    catalog: &SystemCatalog,
    query: &SelectQuery,
    qid: &str,
) -> Result<ExecutionPlan, QueryError> {
    let mut tree = query_tree::build_query_tree(catalog, query)?;
    query_tree::optimize_and_localize(catalog, &mut tree, query)?;
    plan::plan_execution(&mut tree, qid)
}
