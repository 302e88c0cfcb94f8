//! The inter-site HTTP client.
//!
//! Every call is bounded by the configured timeout and carries the
//! target site's shared secret in `Authorization`. A failed `/ping` is
//! the one signal distinguishing an unreachable site from a site that
//! rejected the work.

use distsql_federation::catalog::Site;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::Configuration;
use crate::RouterError;
use crate::wire::PrepareRequest;
use crate::wire::Success;
use crate::wire::TableDump;
use crate::wire::TxidRequest;
use crate::wire::Vote;

#[derive(Debug, Clone)]
pub struct SiteClient {
    http: reqwest::Client,
    port: u16,
}

impl SiteClient {
    pub fn new(configuration: &Configuration) -> Result<Self, RouterError> {
        let http = reqwest::Client::builder()
            .timeout(configuration.http_timeout)
            .build()
            .map_err(|error| RouterError::Engine(error.to_string()))?;
        Ok(Self {
            http,
            port: configuration.port,
        })
    }

    fn url(&self, site: &Site, path: &str) -> String {
        format!("http://{}:{}{path}", site.ip, self.port)
    }

    /// Verify the site daemon is up. Failure is fatal for the statement
    /// being executed.
    pub async fn ping(&self, site: &Site) -> Result<(), RouterError> {
        let unreachable = |reason: String| RouterError::SiteUnreachable {
            site: site.name.clone(),
            reason,
        };
        let response = self
            .http
            .get(self.url(site, "/ping"))
            .send()
            .await
            .map_err(|error| unreachable(error.to_string()))?;
        if response.status() != StatusCode::OK {
            return Err(unreachable(format!("status {}", response.status())));
        }
        Ok(())
    }

    /// Run one plan operation at a site.
    pub async fn exec<B: Serialize>(
        &self,
        site: &Site,
        verb: &str,
        body: &B,
    ) -> Result<(), RouterError> {
        debug!(site = %site.name, verb, "dispatching operation");
        let _: Success = self.post_json(site, &format!("/exec/{verb}"), body, verb).await?;
        Ok(())
    }

    /// Pull the full dump of a relation from a site.
    pub async fn fetch_dump(&self, site: &Site, relation: &str) -> Result<TableDump, RouterError> {
        let response = self
            .http
            .get(self.url(site, &format!("/fetch/{relation}")))
            .header(reqwest::header::AUTHORIZATION, &site.password)
            .send()
            .await
            .map_err(|error| self.exec_error(site, "fetch", error.to_string()))?;
        self.read_json(site, "fetch", response).await
    }

    /// Drop every relation at the site whose name starts with `qid`.
    pub async fn cleanup(&self, site: &Site, qid: &str) -> Result<(), RouterError> {
        let _: Success = self
            .post_json(site, &format!("/cleanup/{qid}"), &serde_json::json!({}), "cleanup")
            .await?;
        Ok(())
    }

    pub async fn prepare(
        &self,
        site: &Site,
        request: &PrepareRequest,
    ) -> Result<Vote, RouterError> {
        let response = self
            .http
            .post(self.url(site, "/2pc/prepare"))
            .header(reqwest::header::AUTHORIZATION, &site.password)
            .json(request)
            .send()
            .await
            .map_err(|error| self.exec_error(site, "prepare", error.to_string()))?;
        if !response.status().is_success() {
            return Err(self.exec_error(
                site,
                "prepare",
                format!("status {}", response.status()),
            ));
        }
        let text = response
            .text()
            .await
            .map_err(|error| self.exec_error(site, "prepare", error.to_string()))?;
        text.trim()
            .parse()
            .map_err(|_| self.exec_error(site, "prepare", format!("unexpected vote `{text}`")))
    }

    pub async fn global_commit(&self, site: &Site, txid: &str) -> Result<(), RouterError> {
        let body = TxidRequest {
            txid: txid.to_string(),
        };
        let _: Success = self
            .post_json(site, "/2pc/global-commit", &body, "global-commit")
            .await?;
        Ok(())
    }

    pub async fn global_abort(&self, site: &Site, txid: &str) -> Result<(), RouterError> {
        let body = TxidRequest {
            txid: txid.to_string(),
        };
        let _: Success = self
            .post_json(site, "/2pc/global-abort", &body, "global-abort")
            .await?;
        Ok(())
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        site: &Site,
        path: &str,
        body: &B,
        verb: &str,
    ) -> Result<R, RouterError> {
        let response = self
            .http
            .post(self.url(site, path))
            .header(reqwest::header::AUTHORIZATION, &site.password)
            .json(body)
            .send()
            .await
            .map_err(|error| self.exec_error(site, verb, error.to_string()))?;
        self.read_json(site, verb, response).await
    }

    async fn read_json<R: DeserializeOwned>(
        &self,
        site: &Site,
        verb: &str,
        response: reqwest::Response,
    ) -> Result<R, RouterError> {
        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(self.exec_error(site, verb, format!("status {status}: {reason}")));
        }
        response
            .json()
            .await
            .map_err(|error| self.exec_error(site, verb, error.to_string()))
    }

    fn exec_error(&self, site: &Site, verb: &str, reason: String) -> RouterError {
        RouterError::SiteExec {
            site: site.id,
            verb: verb.to_string(),
            reason,
        }
    }
}
