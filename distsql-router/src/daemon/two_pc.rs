//! The two-phase-commit participant.
//!
//! Prepare stages the rewritten UPDATE against a shadow copy
//! `"<txid>_<table>"`; the global decision either swaps the shadow into
//! place or drops it. Votes and outcomes go to the append-only
//! participant log.

use axum::Json;
use axum::extract::State;
use distsql_federation::sql::Statement;
use distsql_federation::sql::parser::parse_statement;
use tracing::warn;

use super::HandlerError;
use super::SharedState;
use crate::RouterError;
use crate::engine::quote_ident;
use crate::two_pc::TxEvent;
use crate::wire::PrepareRequest;
use crate::wire::Success;
use crate::wire::TxidRequest;
use crate::wire::Vote;

pub(super) async fn prepare(
    State(state): State<SharedState>,
    Json(body): Json<PrepareRequest>,
) -> Result<String, HandlerError> {
    if !state.try_begin_write() {
        state.tx_log.append(&body.txid, TxEvent::Abort)?;
        return Ok(Vote::Abort.to_string());
    }

    match run_prepare(&state, &body).await {
        Ok(()) => {
            state.tx_log.append(&body.txid, TxEvent::VoteCommit)?;
            Ok(Vote::Commit.to_string())
        }
        Err(error) => {
            warn!(txid = %body.txid, %error, "prepare failed");
            state.end_write();
            state.tx_log.append(&body.txid, TxEvent::Abort)?;
            Ok(Vote::Abort.to_string())
        }
    }
}

async fn run_prepare(state: &SharedState, body: &PrepareRequest) -> Result<(), RouterError> {
    let Statement::Update(update) = parse_statement(&state.catalog, &body.sql)? else {
        return Err(RouterError::Engine(
            "only UPDATE statements can be prepared".to_string(),
        ));
    };
    let shadow = format!("{}_{}", body.txid, update.table());
    state
        .engine
        .execute(&format!(
            "CREATE TABLE {} AS SELECT * FROM {}",
            quote_ident(&shadow),
            quote_ident(update.table()),
        ))
        .await?;
    state.engine.execute(&update.with_table(&shadow)).await
}

pub(super) async fn global_commit(
    State(state): State<SharedState>,
    Json(body): Json<TxidRequest>,
) -> Result<Json<Success>, HandlerError> {
    state.end_write();
    let prefix = format!("{}_", body.txid);
    for name in state.engine.table_names().await? {
        let Some(target) = name.strip_prefix(&prefix) else {
            continue;
        };
        state
            .engine
            .execute(&format!("DROP TABLE {}", quote_ident(target)))
            .await?;
        state
            .engine
            .execute(&format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(&name),
                quote_ident(target),
            ))
            .await?;
    }
    state.tx_log.append(&body.txid, TxEvent::Commit)?;
    Ok(Json(Success::ok()))
}

pub(super) async fn global_abort(
    State(state): State<SharedState>,
    Json(body): Json<TxidRequest>,
) -> Result<Json<Success>, HandlerError> {
    state.end_write();
    for name in state.engine.table_names().await? {
        if name.starts_with(&body.txid) {
            state
                .engine
                .execute(&format!("DROP TABLE {}", quote_ident(&name)))
                .await?;
        }
    }
    state.tx_log.append(&body.txid, TxEvent::Abort)?;
    Ok(Json(Success::ok()))
}
