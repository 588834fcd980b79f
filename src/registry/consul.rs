//! Reqwest-backed Consul agent driver.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::registry::{RegistryAgent, RegistryError, Result, ServiceInfo};

/// Per-call timeout for Consul agent requests.
const CONSUL_TIMEOUT_SECS: u64 = 5;

/// Consul agent HTTP driver.
///
/// With `dry_run` set, every mutation short-circuits to success and the
/// service listing reports empty; reads of the local state keep working so
/// a dry cycle still logs what it would have done.
pub struct ConsulAgent {
    base: String,
    token: String,
    dry_run: bool,
    client: reqwest::Client,
}

impl ConsulAgent {
    /// Create a driver against the given HTTP base URL.
    pub fn new(base: &str, token: &str, dry_run: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(CONSUL_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base: base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            dry_run,
            client,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, format!("{}{path}", self.base));
        if !self.token.is_empty() {
            builder = builder.header("X-Consul-Token", &self.token);
        }
        builder
    }

    async fn check_status(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                operation,
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl RegistryAgent for ConsulAgent {
    async fn register(&self, definition: &Map<String, Value>) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let response = self
            .request(reqwest::Method::PUT, "/v1/agent/service/register")
            .query(&[("replace-existing-checks", "true")])
            .json(definition)
            .send()
            .await?;
        Self::check_status("register", response).await?;
        Ok(())
    }

    async fn deregister(&self, id: &str, namespace: &str, partition: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let mut builder = self.request(
            reqwest::Method::PUT,
            &format!("/v1/agent/service/deregister/{id}"),
        );
        if !namespace.is_empty() {
            builder = builder.query(&[("ns", namespace)]);
        }
        if !partition.is_empty() {
            builder = builder.query(&[("partition", partition)]);
        }
        Self::check_status("deregister", builder.send().await?).await?;
        Ok(())
    }

    async fn pass_check(&self, check_id: &str, note: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let mut builder =
            self.request(reqwest::Method::PUT, &format!("/v1/agent/check/pass/{check_id}"));
        if !note.is_empty() {
            builder = builder.query(&[("note", note)]);
        }
        Self::check_status("pass-check", builder.send().await?).await?;
        Ok(())
    }

    async fn services(&self) -> Result<HashMap<String, ServiceInfo>> {
        if self.dry_run {
            return Ok(HashMap::new());
        }
        let response = self
            .request(reqwest::Method::GET, "/v1/agent/services")
            .send()
            .await?;
        let response = Self::check_status("services", response).await?;
        Ok(response.json().await?)
    }
}
