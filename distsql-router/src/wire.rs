//! Bodies of the inter-site HTTP protocol.
//!
//! Field names are the wire contract shared by the executor, the
//! coordinator, and the daemon; conditions embed the JSON form defined
//! by [`distsql_federation::sql::Condition`].

use distsql_federation::catalog::SiteId;
use distsql_federation::sql::Condition;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecFetch {
    pub relation_name: String,
    pub site_id: SiteId,
    pub target_relation_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecUnion {
    pub relation1_name: String,
    pub relation2_name: String,
    pub target_relation_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecJoin {
    pub relation1_name: String,
    pub relation2_name: String,
    /// Absent for a Cartesian product.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_condition: Option<Condition>,
    pub target_relation_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSelect {
    pub relation_name: String,
    pub select_condition: Condition,
    pub target_relation_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecProject {
    pub relation_name: String,
    pub project_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub having: Option<Condition>,
    pub target_relation_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRename {
    pub old_name: String,
    pub new_name: String,
}

/// Response of `GET /fetch/<relation>`: a script sufficient to recreate
/// the relation elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDump {
    pub table_sql: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Success {
    pub success: bool,
}

impl Success {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub sql: String,
    pub txid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxidRequest {
    pub txid: String,
}

/// A participant's answer to `/2pc/prepare`, carried as a plain text
/// body.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum Vote {
    #[strum(serialize = "vote-commit")]
    Commit,
    #[strum(serialize = "vote-abort")]
    Abort,
}
