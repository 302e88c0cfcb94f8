//! The plan executor: dispatches each operation to its site in order,
//! pulls the final intermediate back to the originating site, reads the
//! rows locally, and cleans up every touched site whether the query
//! succeeded or failed.

use distsql_federation::catalog::Site;
use distsql_federation::catalog::SiteId;
use distsql_federation::catalog::SystemCatalog;
use distsql_federation::plan::ExecutionPlan;
use distsql_federation::plan::OpKind;
use distsql_federation::plan::Operation;
use indexmap::IndexSet;
use tracing::debug;
use tracing::warn;

use crate::RouterError;
use crate::client::SiteClient;
use crate::engine::QueryRows;
use crate::engine::SqlEngine;
use crate::engine::quote_ident;
use crate::wire::ExecFetch;
use crate::wire::ExecJoin;
use crate::wire::ExecProject;
use crate::wire::ExecRename;
use crate::wire::ExecSelect;
use crate::wire::ExecUnion;

/// A fresh query identifier: the prefix of every intermediate relation
/// the query materializes, at every site.
pub fn new_qid(site: SiteId) -> String {
    format!("q{:06x}s{site}", rand::random::<u32>() & 0x00ff_ffff)
}

pub struct PlanExecutor<'a> {
    catalog: &'a SystemCatalog,
    client: &'a SiteClient,
    local_site: &'a Site,
    local_engine: &'a dyn SqlEngine,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(
        catalog: &'a SystemCatalog,
        client: &'a SiteClient,
        local_site: &'a Site,
        local_engine: &'a dyn SqlEngine,
    ) -> Self {
        Self {
            catalog,
            client,
            local_site,
            local_engine,
        }
    }

    /// Run the plan to completion and return the result rows, truncated
    /// to `limit` locally. Intermediates are removed on every exit path.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        limit: Option<u64>,
        qid: &str,
    ) -> Result<QueryRows, RouterError> {
        let mut touched = IndexSet::new();
        let outcome = self.run(plan, qid, &mut touched).await;
        self.cleanup(&touched, qid).await;
        let mut rows = outcome?;
        if let Some(limit) = limit {
            rows.rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn run(
        &self,
        plan: &ExecutionPlan,
        qid: &str,
        touched: &mut IndexSet<SiteId>,
    ) -> Result<QueryRows, RouterError> {
        for op in &plan.ops {
            let site = self.catalog.site(op.site)?;
            if touched.insert(op.site) {
                self.client.ping(site).await?;
            }
            debug!(%op, "executing");
            self.dispatch(site, op).await?;
        }

        // Pull the final intermediate home and read it locally.
        let result_name = format!("{qid}-result");
        if touched.insert(self.local_site.id) {
            self.client.ping(self.local_site).await?;
        }
        self.client
            .exec(
                self.local_site,
                "fetch",
                &ExecFetch {
                    relation_name: plan.final_relation.clone(),
                    site_id: plan.final_site,
                    target_relation_name: result_name.clone(),
                },
            )
            .await?;
        self.local_engine
            .query_rows(&format!("SELECT * FROM {}", quote_ident(&result_name)))
            .await
    }

    async fn dispatch(&self, site: &Site, op: &Operation) -> Result<(), RouterError> {
        let verb = op.kind.verb();
        match &op.kind {
            OpKind::Fetch {
                relation,
                source_site,
            } => {
                self.client
                    .exec(
                        site,
                        verb,
                        &ExecFetch {
                            relation_name: relation.clone(),
                            site_id: *source_site,
                            target_relation_name: op.target.clone(),
                        },
                    )
                    .await
            }
            OpKind::Union { left, right } => {
                self.client
                    .exec(
                        site,
                        verb,
                        &ExecUnion {
                            relation1_name: left.clone(),
                            relation2_name: right.clone(),
                            target_relation_name: op.target.clone(),
                        },
                    )
                    .await
            }
            OpKind::Join {
                left,
                right,
                condition,
            } => {
                self.client
                    .exec(
                        site,
                        verb,
                        &ExecJoin {
                            relation1_name: left.clone(),
                            relation2_name: right.clone(),
                            join_condition: condition.clone(),
                            target_relation_name: op.target.clone(),
                        },
                    )
                    .await
            }
            OpKind::Select {
                relation,
                condition,
            } => {
                self.client
                    .exec(
                        site,
                        verb,
                        &ExecSelect {
                            relation_name: relation.clone(),
                            select_condition: condition.clone(),
                            target_relation_name: op.target.clone(),
                        },
                    )
                    .await
            }
            OpKind::Project {
                relation,
                columns,
                group_by,
                having,
            } => {
                self.client
                    .exec(
                        site,
                        verb,
                        &ExecProject {
                            relation_name: relation.clone(),
                            project_columns: columns.clone(),
                            group_by: group_by.clone(),
                            having: having.clone(),
                            target_relation_name: op.target.clone(),
                        },
                    )
                    .await
            }
            OpKind::Rename { from, to } => {
                self.client
                    .exec(
                        site,
                        verb,
                        &ExecRename {
                            old_name: from.clone(),
                            new_name: to.clone(),
                        },
                    )
                    .await
            }
        }
    }

    /// Best-effort `/cleanup/<qid>` at every site that received work.
    async fn cleanup(&self, touched: &IndexSet<SiteId>, qid: &str) {
        for &site_id in touched {
            let Ok(site) = self.catalog.site(site_id) else {
                continue;
            };
            if let Err(error) = self.client.cleanup(site, qid).await {
                warn!(site = site_id, qid, %error, "cleanup failed");
            }
        }
    }
}
