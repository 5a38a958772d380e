//! JSON-over-HTTP gateway to the analysis backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{
    CreateJobRequest, JobPage, ListQuery, LogEntry, RemoteTaskRecord, TaskGateway, WireTask,
};
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::task::BackendId;

#[derive(Debug, Deserialize)]
struct JobIdBody {
    id: u64,
}

#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| Error::Transport(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Self::new(config.base_url.clone(), config.request_timeout()?)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/jobs{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.url(path);
        debug!(%method, %url, "gateway request");
        self.client.request(method, url)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let body = body.trim();
        Err(Error::Remote(if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {body}")
        }))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.send(builder).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl TaskGateway for HttpGateway {
    async fn create_job(&self, request: &CreateJobRequest) -> Result<BackendId> {
        let body: JobIdBody = self
            .send_json(self.request(Method::POST, "").json(request))
            .await?;
        Ok(BackendId(body.id))
    }

    async fn list_jobs(&self, query: &ListQuery) -> Result<JobPage> {
        let mut params = vec![
            ("limit", query.limit.to_string()),
            ("offset", query.offset.to_string()),
        ];
        if let Some(status) = query.status {
            params.push(("status", status.as_str().to_string()));
        }
        let wire: Vec<WireTask> = self
            .send_json(self.request(Method::GET, "").query(&params))
            .await?;
        Ok(JobPage::from_wire(wire))
    }

    async fn get_job(&self, id: BackendId) -> Result<RemoteTaskRecord> {
        let wire: WireTask = self
            .send_json(self.request(Method::GET, &format!("/{id}")))
            .await?;
        RemoteTaskRecord::try_from(wire)
    }

    async fn stop_job(&self, id: BackendId) -> Result<()> {
        self.send(self.request(Method::POST, &format!("/{id}/stop")))
            .await?;
        Ok(())
    }

    async fn retry_job(&self, id: BackendId) -> Result<BackendId> {
        let body: JobIdBody = self
            .send_json(self.request(Method::POST, &format!("/{id}/retry")))
            .await?;
        Ok(BackendId(body.id))
    }

    async fn delete_job(&self, id: BackendId) -> Result<()> {
        self.send(self.request(Method::DELETE, &format!("/{id}")))
            .await?;
        Ok(())
    }

    async fn get_job_logs(&self, id: BackendId, limit: usize) -> Result<Vec<LogEntry>> {
        self.send_json(
            self.request(Method::GET, &format!("/{id}/logs"))
                .query(&[("limit", limit.to_string())]),
        )
        .await
    }
}
