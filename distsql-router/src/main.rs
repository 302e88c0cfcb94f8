use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use clap::Subcommand;
use distsql_federation::catalog::SystemCatalog;
use distsql_router::Configuration;
use distsql_router::client::SiteClient;
use distsql_router::daemon;
use distsql_router::daemon::DaemonState;
use distsql_router::engine::PostgresEngine;
use distsql_router::engine::SqlEngine;
use distsql_router::repl::Repl;
use distsql_router::two_pc::TxLog;
use tracing_subscriber::EnvFilter;

/// Distributed relational query engine over fragmented storage sites.
#[derive(Parser)]
#[command(name = "distsql-router")]
struct Cli {
    /// Name of this node in the system catalog.
    #[arg(long, env = "DISTSQL_SITE")]
    site: String,

    /// Port the site daemons listen on.
    #[arg(long, default_value_t = 12117)]
    port: u16,

    /// Database holding the fragments at every site.
    #[arg(long, default_value = "l117")]
    database: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the site daemon.
    Daemon,
    /// Interactive statement loop.
    Repl,
    /// Run a single statement and exit.
    Query { sql: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let configuration = Configuration {
        port: cli.port,
        database: cli.database,
        ..Configuration::default()
    };

    let catalog = SystemCatalog::chat();
    catalog.validate().context("system catalog")?;
    let site = catalog
        .site_by_name(&cli.site)
        .with_context(|| format!("site `{}` is not in the system catalog", cli.site))?
        .clone();
    let client = SiteClient::new(&configuration)?;
    let engine: Arc<dyn SqlEngine> = Arc::new(PostgresEngine::new(&site, &configuration.database));

    match cli.command {
        Command::Daemon => {
            let tx_log = TxLog::open(&configuration.participant_log)?;
            let state = Arc::new(DaemonState::new(site, catalog, engine, client, tx_log));
            daemon::serve(state, configuration.port).await?;
        }
        Command::Repl => {
            let repl = build_repl(catalog, configuration, site, client, engine)?;
            repl.run().await?;
        }
        Command::Query { sql } => {
            let repl = build_repl(catalog, configuration, site, client, engine)?;
            repl.dispatch(&sql).await?;
        }
    }
    Ok(())
}

fn build_repl(
    catalog: SystemCatalog,
    configuration: Configuration,
    site: distsql_federation::catalog::Site,
    client: SiteClient,
    engine: Arc<dyn SqlEngine>,
) -> anyhow::Result<Repl> {
    let coordinator_log = TxLog::open(&configuration.coordinator_log)?;
    Ok(Repl {
        catalog,
        configuration,
        site,
        client,
        engine,
        coordinator_log,
    })
}
