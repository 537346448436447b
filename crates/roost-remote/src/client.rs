//! HTTP implementation of the Panel contract.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use uuid::Uuid;

use crate::error::{RemoteError, Result};
use crate::types::*;
use crate::RemoteClient;

/// Pages requested per boot-listing call.
const PER_PAGE: u32 = 50;

/// Panel client over HTTPS with bearer authentication.
pub struct HttpClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
    max_attempts: u32,
}

impl HttpClient {
    /// Creates a client for the given Panel. `token_id` and `token` come
    /// from the node configuration and are never logged.
    #[must_use]
    pub fn new(base_url: &str, token_id: &str, token: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("roost/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: format!("Bearer {token_id}.{token}"),
            client,
            max_attempts: 3,
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/api/remote{path}", self.base_url);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut req = self
                .client
                .request(method.clone(), &url)
                .header(reqwest::header::AUTHORIZATION, &self.token)
                .header(reqwest::header::ACCEPT, "application/json");
            if let Some(body) = &body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(res) if res.status().is_success() => return Ok(res),
                Ok(res) => {
                    let status = res.status();
                    // Retry server-side failures, surface client errors.
                    if status.is_server_error() && attempt < self.max_attempts {
                        tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                        continue;
                    }
                    let message = res.text().await.unwrap_or_default();
                    return Err(api_error(status, message));
                }
                Err(err) if attempt < self.max_attempts => {
                    tracing::debug!(error = %err, url, attempt, "panel request failed, retrying");
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let res = self.request(Method::GET, path, None).await?;
        Ok(res.json::<T>().await?)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<()> {
        self.request(Method::POST, path, Some(body)).await?;
        Ok(())
    }
}

fn api_error(status: StatusCode, message: String) -> RemoteError {
    RemoteError::Api {
        status: status.as_u16(),
        message: if message.len() > 256 {
            format!("{}…", &message[..256])
        } else {
            message
        },
    }
}

#[derive(serde::Deserialize)]
struct PaginatedServers {
    data: Vec<RawServerData>,
    meta: Pagination,
}

#[async_trait]
impl RemoteClient for HttpClient {
    async fn get_servers(&self) -> Result<Vec<RawServerData>> {
        let mut servers = Vec::new();
        let mut page = 1u32;
        loop {
            let res: PaginatedServers = self
                .get_json(&format!("/servers?page={page}&per_page={PER_PAGE}"))
                .await?;
            servers.extend(res.data);
            if res.meta.current_page >= res.meta.last_page {
                break;
            }
            page += 1;
        }
        Ok(servers)
    }

    async fn get_server_configuration(&self, uuid: Uuid) -> Result<ServerConfigurationResponse> {
        self.get_json(&format!("/servers/{uuid}")).await
    }

    async fn get_installation_script(&self, uuid: Uuid) -> Result<InstallationScript> {
        self.get_json(&format!("/servers/{uuid}/install")).await
    }

    async fn set_installation_status(
        &self,
        uuid: Uuid,
        successful: bool,
        reinstall: bool,
    ) -> Result<()> {
        self.post(
            &format!("/servers/{uuid}/install"),
            json!({ "successful": successful, "reinstall": reinstall }),
        )
        .await
    }

    async fn set_transfer_status(&self, uuid: Uuid, successful: bool) -> Result<()> {
        let state = if successful { "success" } else { "failure" };
        self.post(&format!("/servers/{uuid}/transfer/{state}"), json!({}))
            .await
    }

    async fn get_backup_remote_upload_urls(
        &self,
        backup: Uuid,
        size: u64,
    ) -> Result<BackupRemoteUploadResponse> {
        self.get_json(&format!("/backups/{backup}?size={size}")).await
    }

    async fn set_backup_status(&self, backup: Uuid, data: &BackupRequest) -> Result<()> {
        self.post(
            &format!("/backups/{backup}"),
            serde_json::to_value(data)
                .map_err(|e| roost_error::CommonError::internal(e.to_string()))?,
        )
        .await
    }

    async fn send_restoration_status(&self, backup: Uuid, successful: bool) -> Result<()> {
        self.post(
            &format!("/backups/{backup}/restore"),
            json!({ "successful": successful }),
        )
        .await
    }

    async fn send_activity_logs(&self, activity: &[ActivityEvent]) -> Result<()> {
        self.post(
            "/activity",
            json!({
                "data": activity,
            }),
        )
        .await
    }
}
