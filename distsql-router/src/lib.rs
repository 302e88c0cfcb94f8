//! The distributed runtime around [`distsql_federation`]: an inter-site
//! HTTP client, the per-site daemon executing relational operations
//! against a local SQL engine, the plan executor, and the two-phase
//! commit coordinator for distributed updates.

pub mod client;
pub mod configuration;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod executor;
pub mod repl;
pub mod two_pc;
pub mod wire;

pub use configuration::Configuration;
pub use error::RouterError;
