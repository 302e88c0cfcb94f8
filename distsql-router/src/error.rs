use distsql_federation::QueryError;
use distsql_federation::catalog::SiteId;
use thiserror::Error;

/// Runtime errors. All of these abort the statement being processed;
/// intermediates already materialized at remote sites are cleaned up
/// best-effort before the error surfaces.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The site did not answer `/ping`.
    #[error("site `{site}` is unreachable: {reason}")]
    SiteUnreachable { site: String, reason: String },

    /// A site answered an operation with a non-OK status.
    #[error("site {site} failed `{verb}`: {reason}")]
    SiteExec {
        site: SiteId,
        verb: String,
        reason: String,
    },

    /// The two-phase commit decided abort.
    #[error("transaction {txid} aborted: {reason}")]
    TransactionAbort { txid: String, reason: String },

    /// The local SQL engine rejected a statement.
    #[error("sql engine: {0}")]
    Engine(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl RouterError {
    pub(crate) fn engine(error: impl std::fmt::Display) -> Self {
        Self::Engine(error.to_string())
    }
}
