use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::types::{
    DropdownOption, DropdownRequest, ExecuteQueryRequest, ExecuteQueryResponse, QueryResult,
    SaveDashboardRequest, SavedDashboard,
};
use super::{DropdownBackend, DropdownParams, QueryExecutor};
use crate::config::{BackendConfig, RequestConfig};
use crate::error::{BackendError, BackendResult, SaveError, SaveResult};

/// Client for the dashboard/query backend HTTP API
#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    request_config: RequestConfig,
}

impl BackendClient {
    /// Create a new backend client
    pub fn new(config: &BackendConfig, request_config: RequestConfig) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(BackendError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_config,
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST with retries and exponential backoff.
    ///
    /// Client errors (4xx) are returned immediately.
    async fn post_with_retry<B, R>(&self, path: &str, body: &B) -> BackendResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);

        let mut last_error = None;
        let mut retries = 0;

        while retries <= self.request_config.max_retries {
            if retries > 0 {
                let delay = Duration::from_millis(
                    self.request_config.retry_delay_ms * (2_u64.pow(retries - 1)),
                );
                warn!(
                    path = %path,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "Retrying backend request"
                );
                tokio::time::sleep(delay).await;
            }

            let start = Instant::now();

            match self.execute_request(&url, body).await {
                Ok(response) => {
                    debug!(
                        path = %path,
                        latency_ms = start.elapsed().as_millis(),
                        "Backend request succeeded"
                    );
                    return Ok(response);
                }
                Err(e) if !e.is_retryable() => {
                    error!(path = %path, error = %e, "Backend request rejected");
                    return Err(e);
                }
                Err(e) => {
                    error!(
                        path = %path,
                        error = %e,
                        latency_ms = start.elapsed().as_millis(),
                        retry = retries,
                        "Backend request failed"
                    );
                    last_error = Some(e);
                    retries += 1;
                }
            }
        }

        Err(BackendError::Unavailable {
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
            retries,
        })
    }

    /// Execute a single request (internal)
    async fn execute_request<B, R>(&self, url: &str, body: &B) -> BackendResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let response = self
            .request(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(BackendError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse {
                message: format!("Failed to parse response: {}", e),
            })
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Key {}", key)),
            None => builder,
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout {
                timeout_ms: self.request_config.timeout_ms,
            }
        } else {
            BackendError::Http(e)
        }
    }

    /// Save dashboard changes.
    ///
    /// Sends the known version so the backend can reject concurrent edits.
    /// A 409 becomes [`SaveError::Conflict`], a 403 [`SaveError::PermissionDenied`];
    /// saves are never retried.
    pub async fn save_dashboard(
        &self,
        request: &SaveDashboardRequest,
    ) -> SaveResult<SavedDashboard> {
        let url = format!("{}/api/dashboards/{}", self.base_url, request.id);

        info!(dashboard_id = request.id, version = ?request.version, "Saving dashboard");

        let response = self
            .request(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| SaveError::Backend(self.map_send_error(e)))?;

        match response.status() {
            StatusCode::FORBIDDEN => {
                warn!(dashboard_id = request.id, "Dashboard save denied");
                Err(SaveError::PermissionDenied)
            }
            StatusCode::CONFLICT => {
                warn!(dashboard_id = request.id, "Dashboard save conflicted with another edit");
                Err(SaveError::Conflict {
                    resource: "dashboard".to_string(),
                })
            }
            status if !status.is_success() => {
                let message = response.text().await.unwrap_or_default();
                Err(SaveError::Backend(BackendError::Api {
                    status: status.as_u16(),
                    message,
                }))
            }
            _ => response.json().await.map_err(|e| {
                SaveError::Backend(BackendError::InvalidResponse {
                    message: format!("Failed to parse saved dashboard: {}", e),
                })
            }),
        }
    }
}

#[async_trait]
impl DropdownBackend for BackendClient {
    async fn fetch_associated_dropdown(
        &self,
        query_id: i64,
        dropdown_query_id: i64,
        parameters: DropdownParams,
    ) -> BackendResult<Vec<DropdownOption>> {
        let path = format!("/api/queries/{}/dropdowns/{}", query_id, dropdown_query_id);
        self.post_with_retry(&path, &DropdownRequest { parameters }).await
    }

    async fn fetch_dropdown(
        &self,
        id: i64,
        parameters: DropdownParams,
    ) -> BackendResult<Vec<DropdownOption>> {
        let path = format!("/api/queries/{}/dropdown", id);
        self.post_with_retry(&path, &DropdownRequest { parameters }).await
    }
}

#[async_trait]
impl QueryExecutor for BackendClient {
    async fn execute_query(
        &self,
        query_id: i64,
        request: ExecuteQueryRequest,
    ) -> BackendResult<QueryResult> {
        let path = format!("/api/queries/{}/results", query_id);
        let response: ExecuteQueryResponse = self.post_with_retry(&path, &request).await?;
        Ok(response.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let config = BackendConfig {
            base_url: "http://localhost:5000/".to_string(),
            api_key: Some("test_key".to_string()),
        };

        let client = BackendClient::new(&config, RequestConfig::default());
        assert!(client.is_ok());
        assert_eq!(client.unwrap().base_url(), "http://localhost:5000");
    }
}
