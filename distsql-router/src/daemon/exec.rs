//! Handlers for `/exec/<verb>`, `/fetch/<relation>`, and
//! `/cleanup/<qid>`: each verb materializes its target as a new local
//! table via `CREATE TABLE ... AS SELECT`.

use axum::Json;
use axum::extract::Path;
use axum::extract::State;
use distsql_federation::sql::Condition;
use distsql_federation::sql::aggregate_parts;
use distsql_federation::sql::column_parts;
use itertools::Itertools;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::HandlerError;
use super::SharedState;
use crate::RouterError;
use crate::engine::quote_ident;
use crate::wire::ExecFetch;
use crate::wire::ExecJoin;
use crate::wire::ExecProject;
use crate::wire::ExecRename;
use crate::wire::ExecSelect;
use crate::wire::ExecUnion;
use crate::wire::Success;
use crate::wire::TableDump;

pub(super) async fn exec(
    State(state): State<SharedState>,
    Path(verb): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<Success>, HandlerError> {
    match verb.as_str() {
        "fetch" => run_fetch(&state, parse(payload)?).await?,
        "union" => run_union(&state, parse(payload)?).await?,
        "join" => run_join(&state, parse(payload)?).await?,
        "select" => run_select(&state, parse(payload)?).await?,
        "project" => run_project(&state, parse(payload)?).await?,
        "rename" => run_rename(&state, parse(payload)?).await?,
        other => {
            return Err(HandlerError::bad_request(format!("unknown action {other}")));
        }
    }
    Ok(Json(Success::ok()))
}

fn parse<T: DeserializeOwned>(payload: serde_json::Value) -> Result<T, HandlerError> {
    serde_json::from_value(payload).map_err(|error| HandlerError::bad_request(error.to_string()))
}

/// Pull a dump of the relation from the source site, substitute the
/// target name for the source identifier, and apply it locally.
async fn run_fetch(state: &SharedState, body: ExecFetch) -> Result<(), RouterError> {
    let source = state.catalog.site(body.site_id)?.clone();
    let dump = state.client.fetch_dump(&source, &body.relation_name).await?;
    let script = dump.table_sql.replace(
        &quote_ident(&body.relation_name),
        &quote_ident(&body.target_relation_name),
    );
    state.engine.execute(&script).await
}

async fn run_union(state: &SharedState, body: ExecUnion) -> Result<(), RouterError> {
    let sql = format!(
        "CREATE TABLE {} AS SELECT * FROM {} UNION SELECT * FROM {}",
        quote_ident(&body.target_relation_name),
        quote_ident(&body.relation1_name),
        quote_ident(&body.relation2_name),
    );
    debug!(%sql, "union");
    state.engine.execute(&sql).await
}

async fn run_join(state: &SharedState, body: ExecJoin) -> Result<(), HandlerError> {
    let left_columns = state.engine.table_columns(&body.relation1_name).await?;
    let right_columns = state.engine.table_columns(&body.relation2_name).await?;

    let shared: Vec<&String> = left_columns
        .iter()
        .filter(|column| right_columns.contains(column))
        .collect();
    if shared.len() > 1 {
        return Err(HandlerError::internal(format!(
            "one or more of these column names are ambiguous: {}",
            shared.iter().join(", ")
        )));
    }

    // Shared column kept once, qualified by the left relation.
    let mut select_list = Vec::new();
    for column in &left_columns {
        if shared.contains(&column) {
            select_list.push(format!(
                "{}.{}",
                quote_ident(&body.relation1_name),
                quote_ident(column)
            ));
        } else {
            select_list.push(quote_ident(column));
        }
    }
    for column in &right_columns {
        if !shared.contains(&column) {
            select_list.push(quote_ident(column));
        }
    }

    let context = JoinContext {
        left: &body.relation1_name,
        right: &body.relation2_name,
        left_columns: &left_columns,
        right_columns: &right_columns,
    };
    let on = match &body.join_condition {
        Some(condition) => condition_sql(condition, Some(&context)),
        None => "TRUE".to_string(),
    };
    let sql = format!(
        "CREATE TABLE {} AS SELECT {} FROM {} JOIN {} ON {on}",
        quote_ident(&body.target_relation_name),
        select_list.join(", "),
        quote_ident(&body.relation1_name),
        quote_ident(&body.relation2_name),
    );
    debug!(%sql, "join");
    Ok(state.engine.execute(&sql).await?)
}

async fn run_select(state: &SharedState, body: ExecSelect) -> Result<(), RouterError> {
    let sql = format!(
        "CREATE TABLE {} AS SELECT * FROM {} WHERE {}",
        quote_ident(&body.target_relation_name),
        quote_ident(&body.relation_name),
        condition_sql(&body.select_condition, None),
    );
    debug!(%sql, "select");
    state.engine.execute(&sql).await
}

async fn run_project(state: &SharedState, body: ExecProject) -> Result<(), RouterError> {
    let columns = body
        .project_columns
        .iter()
        .map(|column| rendered_column(column))
        .join(", ");
    let mut sql = format!(
        "CREATE TABLE {} AS SELECT {columns} FROM {}",
        quote_ident(&body.target_relation_name),
        quote_ident(&body.relation_name),
    );
    if let Some(group_by) = &body.group_by {
        let grouped = group_by
            .iter()
            .map(|column| rendered_column(column))
            .join(", ");
        sql.push_str(&format!(" GROUP BY {grouped}"));
        if let Some(having) = &body.having {
            sql.push_str(&format!(" HAVING {}", condition_sql(having, None)));
        }
    }
    debug!(%sql, "project");
    state.engine.execute(&sql).await
}

async fn run_rename(state: &SharedState, body: ExecRename) -> Result<(), RouterError> {
    let sql = format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(&body.old_name),
        quote_ident(&body.new_name),
    );
    state.engine.execute(&sql).await
}

pub(super) async fn fetch_relation(
    State(state): State<SharedState>,
    Path(relation): Path<String>,
) -> Result<Json<TableDump>, HandlerError> {
    let table_sql = state.engine.dump_table(&relation).await?;
    Ok(Json(TableDump { table_sql }))
}

pub(super) async fn cleanup(
    State(state): State<SharedState>,
    Path(qid): Path<String>,
) -> Result<Json<Success>, HandlerError> {
    for name in state.engine.table_names().await? {
        if name.starts_with(&qid) {
            debug!(relation = %name, "dropping intermediate");
            state
                .engine
                .execute(&format!("DROP TABLE {}", quote_ident(&name)))
                .await?;
        }
    }
    Ok(Json(Success::ok()))
}

/// Context for resolving which side of a join a condition operand
/// belongs to.
struct JoinContext<'a> {
    left: &'a str,
    right: &'a str,
    left_columns: &'a [String],
    right_columns: &'a [String],
}

/// Reduce a planner reference to the local column it names here:
/// `table.column` loses its logical table prefix, aggregates keep their
/// function, literals pass through untouched.
fn rendered_column(reference: &str) -> String {
    if let Some((func, inner)) = aggregate_parts(reference) {
        let column = match column_parts(inner) {
            Some((_, column)) => column,
            None => inner,
        };
        return format!("{func}({})", quote_ident(column));
    }
    if let Some((_, column)) = column_parts(reference) {
        return quote_ident(column);
    }
    if is_identifier(reference) {
        return quote_ident(reference);
    }
    reference.to_string()
}

/// The bare local column an operand names, if it names one.
fn bare_column(operand: &str) -> Option<&str> {
    let inner = match aggregate_parts(operand) {
        Some((_, inner)) => inner,
        None => operand,
    };
    match column_parts(inner) {
        Some((_, column)) => Some(column),
        None => is_identifier(inner).then_some(inner),
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Render a condition against local relations. With a join context,
/// operands are qualified by the relation that actually carries them;
/// a column compared against itself (the primary-key equijoin) is
/// qualified left-vs-right.
fn condition_sql(condition: &Condition, join: Option<&JoinContext<'_>>) -> String {
    match condition {
        Condition::Comparison(comparison) => {
            if let Some(context) = join {
                if let (Some(left), Some(right)) = (
                    bare_column(&comparison.lhs),
                    bare_column(&comparison.rhs),
                ) {
                    let qualified = |relation: &str, column: &str| {
                        format!("{}.{}", quote_ident(relation), quote_ident(column))
                    };
                    let left_owned = |column: &str| {
                        context.left_columns.iter().any(|c| c == column)
                    };
                    let right_owned = |column: &str| {
                        context.right_columns.iter().any(|c| c == column)
                    };
                    if left == right {
                        return format!(
                            "{} {} {}",
                            qualified(context.left, left),
                            comparison.op,
                            qualified(context.right, right),
                        );
                    }
                    if left_owned(left) && right_owned(right) {
                        return format!(
                            "{} {} {}",
                            qualified(context.left, left),
                            comparison.op,
                            qualified(context.right, right),
                        );
                    }
                    if right_owned(left) && left_owned(right) {
                        return format!(
                            "{} {} {}",
                            qualified(context.right, left),
                            comparison.op,
                            qualified(context.left, right),
                        );
                    }
                }
            }
            format!(
                "{} {} {}",
                rendered_column(&comparison.lhs),
                comparison.op,
                rendered_column(&comparison.rhs),
            )
        }
        Condition::And(children) => {
            let joined = children
                .iter()
                .map(|child| condition_sql(child, join))
                .join(" AND ");
            format!("({joined})")
        }
        Condition::Or(children) => {
            let joined = children
                .iter()
                .map(|child| condition_sql(child, join))
                .join(" OR ");
            format!("({joined})")
        }
    }
}
