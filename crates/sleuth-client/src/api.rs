use std::time::Duration;

use reqwest::StatusCode;
use sleuth_protocol::paths::{START_RESEARCH_PATH, download_path, status_path};
use sleuth_protocol::{
    ApiErrorBody, StartResearchRequest, StartResearchResponse, TaskId, TaskStatusSnapshot,
};
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Request/response side of the research backend.
#[allow(async_fn_in_trait)]
pub trait ResearchApi {
    /// Start a research run; resolves to the server-assigned task id.
    async fn start_research(&self, query: &str) -> ClientResult<TaskId>;

    /// Server-side snapshot of a task, used to resync after a reconnect.
    async fn task_status(&self, task_id: &str) -> ClientResult<TaskStatusSnapshot>;

    /// Plain-text report of a completed task.
    async fn download_report(&self, task_id: &str) -> ClientResult<String>;
}

/// `ResearchApi` over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpResearchApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpResearchApi {
    pub fn new(base_url: &str, timeout: Duration) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ClientError::Config {
                message: format!("failed to build http client: {err}"),
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl ResearchApi for HttpResearchApi {
    async fn start_research(&self, query: &str) -> ClientResult<TaskId> {
        let resp = self
            .http
            .post(self.url(START_RESEARCH_PATH))
            .json(&StartResearchRequest {
                query: query.to_string(),
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let detail = error_detail(resp).await;
            debug!(status, detail = %detail, "start request rejected");
            return Err(ClientError::StartRejected { status });
        }

        let body: StartResearchResponse = resp.json().await?;
        if body.task_id.is_empty() {
            return Err(ClientError::Protocol {
                message: "start response carried an empty task_id".to_string(),
            });
        }
        Ok(body.task_id)
    }

    async fn task_status(&self, task_id: &str) -> ClientResult<TaskStatusSnapshot> {
        let resp = self.http.get(self.url(&status_path(task_id))).send().await?;
        match resp.status() {
            status if status.is_success() => Ok(resp.json().await?),
            StatusCode::NOT_FOUND => Err(ClientError::TaskNotFound(task_id.to_string())),
            status => Err(ClientError::Protocol {
                message: format!(
                    "status request failed with {status}: {}",
                    error_detail(resp).await
                ),
            }),
        }
    }

    async fn download_report(&self, task_id: &str) -> ClientResult<String> {
        let resp = self
            .http
            .get(self.url(&download_path(task_id)))
            .send()
            .await?;
        match resp.status() {
            status if status.is_success() => Ok(resp.text().await?),
            StatusCode::NOT_FOUND => {
                if error_detail(resp).await.eq_ignore_ascii_case("task not found") {
                    Err(ClientError::TaskNotFound(task_id.to_string()))
                } else {
                    Err(ClientError::ReportUnavailable(task_id.to_string()))
                }
            }
            status => Err(ClientError::Protocol {
                message: format!(
                    "download request failed with {status}: {}",
                    error_detail(resp).await
                ),
            }),
        }
    }
}

/// Best-effort extraction of the `{"error": ...}` body.
async fn error_detail(resp: reqwest::Response) -> String {
    let text = resp.text().await.unwrap_or_default();
    serde_json::from_str::<ApiErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text)
}
