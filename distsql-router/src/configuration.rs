use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration shared by the daemon, the executor, and the
/// coordinator. The system catalog itself is compiled in; this covers
/// the deployment knobs around it.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// The well-known port every site daemon listens on.
    pub port: u16,
    /// Name of the database holding fragments at every site.
    pub database: String,
    /// Bound on every inter-site HTTP call. Exceeding it is treated
    /// like a non-OK response.
    pub http_timeout: Duration,
    pub coordinator_log: PathBuf,
    pub participant_log: PathBuf,
    pub history_file: PathBuf,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            port: 12117,
            database: "l117".to_string(),
            http_timeout: Duration::from_secs(10),
            coordinator_log: PathBuf::from("tx-coordinator.log"),
            participant_log: PathBuf::from("tx-participant.log"),
            history_file: PathBuf::from(".distsql_history"),
        }
    }
}
