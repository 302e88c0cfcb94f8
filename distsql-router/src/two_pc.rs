//! The two-phase-commit coordinator and the shared transaction log.
//!
//! A distributed UPDATE touches every fragment of its table: the
//! coordinator rewrites the statement per fragment, collects prepare
//! votes from the owning sites, and drives the global decision. It
//! never decides commit when any prepare failed, timed out, or voted
//! abort.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use distsql_federation::QueryError;
use distsql_federation::catalog::Site;
use distsql_federation::catalog::SiteId;
use distsql_federation::catalog::SystemCatalog;
use distsql_federation::sql::UpdateStatement;
use parking_lot::Mutex;
use tracing::info;
use tracing::warn;

use crate::RouterError;
use crate::client::SiteClient;
use crate::wire::PrepareRequest;
use crate::wire::Vote;

/// Events recorded per `txid` in the coordinator and participant logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum TxEvent {
    #[strum(serialize = "begin_commit")]
    BeginCommit,
    #[strum(serialize = "vote-commit")]
    VoteCommit,
    #[strum(serialize = "abort")]
    Abort,
    #[strum(serialize = "commit")]
    Commit,
    #[strum(serialize = "failed")]
    Failed,
    #[strum(serialize = "end_of_transaction")]
    EndOfTransaction,
}

/// An append-only log of `"<txid>: <event>"` lines, flushed per entry.
pub struct TxLog {
    file: Mutex<File>,
}

impl TxLog {
    pub fn open(path: &Path) -> Result<Self, RouterError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn append(&self, txid: &str, event: TxEvent) -> Result<(), RouterError> {
        let mut file = self.file.lock();
        writeln!(file, "{txid}: {event}")?;
        file.flush()?;
        Ok(())
    }
}

/// A fresh transaction identifier, also the prefix of every shadow
/// table the transaction stages.
pub fn new_txid(site: SiteId) -> String {
    format!("t{:06x}s{site}", rand::random::<u32>() & 0x00ff_ffff)
}

pub struct Coordinator<'a> {
    catalog: &'a SystemCatalog,
    client: &'a SiteClient,
    log: &'a TxLog,
}

impl<'a> Coordinator<'a> {
    pub fn new(catalog: &'a SystemCatalog, client: &'a SiteClient, log: &'a TxLog) -> Self {
        Self {
            catalog,
            client,
            log,
        }
    }

    pub async fn execute_update(
        &self,
        update: &UpdateStatement,
        txid: &str,
    ) -> Result<(), RouterError> {
        let table = self
            .catalog
            .table_by_name(update.table())
            .ok_or_else(|| QueryError::UnknownTable(update.table().to_string()))?;
        let mut participants: Vec<(&Site, String)> = Vec::new();
        for fragment in self.catalog.fragments_of(table.id) {
            let site = self
                .catalog
                .site(self.catalog.site_of_fragment(fragment.id)?)?;
            participants.push((site, update.with_table(&fragment.name)));
        }

        self.log.append(txid, TxEvent::BeginCommit)?;

        let mut decide_commit = true;
        for (site, sql) in &participants {
            let request = PrepareRequest {
                sql: sql.clone(),
                txid: txid.to_string(),
            };
            let vote = async {
                self.client.ping(site).await?;
                self.client.prepare(site, &request).await
            }
            .await;
            match vote {
                Ok(Vote::Commit) => {}
                Ok(Vote::Abort) => {
                    warn!(txid, site = %site.name, "participant voted abort");
                    decide_commit = false;
                    break;
                }
                Err(error) => {
                    warn!(txid, site = %site.name, %error, "prepare did not complete");
                    decide_commit = false;
                    break;
                }
            }
        }

        if decide_commit {
            let mut delivery_failed = false;
            for (site, _) in &participants {
                if let Err(error) = self.client.global_commit(site, txid).await {
                    warn!(txid, site = %site.name, %error, "global-commit failed");
                    delivery_failed = true;
                }
            }
            if delivery_failed {
                self.log.append(txid, TxEvent::Failed)?;
                self.log.append(txid, TxEvent::EndOfTransaction)?;
                return Err(RouterError::TransactionAbort {
                    txid: txid.to_string(),
                    reason: "global-commit did not reach every participant".to_string(),
                });
            }
            info!(txid, "transaction committed");
            self.log.append(txid, TxEvent::Commit)?;
            self.log.append(txid, TxEvent::EndOfTransaction)?;
            Ok(())
        } else {
            for (site, _) in &participants {
                if let Err(error) = self.client.global_abort(site, txid).await {
                    warn!(txid, site = %site.name, %error, "global-abort failed");
                }
            }
            self.log.append(txid, TxEvent::Abort)?;
            self.log.append(txid, TxEvent::EndOfTransaction)?;
            Err(RouterError::TransactionAbort {
                txid: txid.to_string(),
                reason: "a participant voted abort or was unreachable".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn txids_carry_prefix_and_site() {
        let txid = new_txid(3);
        assert!(txid.starts_with('t'), "{txid}");
        assert!(txid.ends_with("s3"), "{txid}");
        assert!(!txid.contains('_'));
    }

    #[test]
    fn log_appends_one_line_per_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tx.log");
        let log = TxLog::open(&path).expect("opens");
        log.append("t1s1", TxEvent::BeginCommit).expect("appends");
        log.append("t1s1", TxEvent::Commit).expect("appends");
        log.append("t1s1", TxEvent::EndOfTransaction).expect("appends");
        let written = std::fs::read_to_string(&path).expect("reads");
        assert_eq!(
            written,
            "t1s1: begin_commit\nt1s1: commit\nt1s1: end_of_transaction\n"
        );
    }
}
