//! The per-site daemon: an HTTP service executing relational operations
//! against the local SQL engine, serving table dumps, cleaning up query
//! intermediates, and acting as a two-phase-commit participant.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use axum::Router;
use axum::extract::ConnectInfo;
use axum::extract::Request;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use distsql_federation::catalog::Site;
use distsql_federation::catalog::SystemCatalog;
use tracing::info;

use crate::RouterError;
use crate::client::SiteClient;
use crate::engine::SqlEngine;
use crate::two_pc::TxLog;

mod exec;
mod two_pc;

pub struct DaemonState {
    pub site: Site,
    pub catalog: SystemCatalog,
    pub engine: Arc<dyn SqlEngine>,
    pub client: SiteClient,
    pub tx_log: TxLog,
    /// Held from a successful prepare until the global decision; a
    /// prepare observing it votes abort.
    write_in_progress: AtomicBool,
}

impl DaemonState {
    pub fn new(
        site: Site,
        catalog: SystemCatalog,
        engine: Arc<dyn SqlEngine>,
        client: SiteClient,
        tx_log: TxLog,
    ) -> Self {
        Self {
            site,
            catalog,
            engine,
            client,
            tx_log,
            write_in_progress: AtomicBool::new(false),
        }
    }

    /// Claim the site for a write. `false` means another transaction is
    /// already prepared here.
    fn try_begin_write(&self) -> bool {
        !self.write_in_progress.swap(true, Ordering::SeqCst)
    }

    fn end_write(&self) {
        self.write_in_progress.store(false, Ordering::SeqCst);
    }
}

pub type SharedState = Arc<DaemonState>;

pub fn app(state: SharedState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/exec/{verb}", post(exec::exec))
        .route("/fetch/{relation}", get(exec::fetch_relation))
        .route("/cleanup/{qid}", post(exec::cleanup))
        .route("/2pc/prepare", post(two_pc::prepare))
        .route("/2pc/global-commit", post(two_pc::global_commit))
        .route("/2pc/global-abort", post(two_pc::global_abort))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .with_state(state)
}

pub async fn serve(state: SharedState, port: u16) -> Result<(), RouterError> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(site = %state.site.name, port, "site daemon listening");
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn ping() -> &'static str {
    "pong"
}

/// Shared-secret check. Loopback callers (the co-located originator
/// pulling its own result home) bypass it, as does the health check.
async fn authenticate(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    if request.uri().path() == "/ping" {
        return next.run(request).await;
    }
    let loopback = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(address)| address.ip().is_loopback())
        .unwrap_or(false);
    if loopback {
        return next.run(request).await;
    }
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some(state.site.password.as_str());
    if authorized {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, "wrong credentials provided").into_response()
    }
}

/// A handler failure rendered as a plain-text status response.
pub(crate) struct HandlerError {
    status: StatusCode,
    message: String,
}

impl HandlerError {
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl From<RouterError> for HandlerError {
    fn from(error: RouterError) -> Self {
        Self::internal(error.to_string())
    }
}
