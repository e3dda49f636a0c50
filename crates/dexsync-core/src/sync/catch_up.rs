//! Catch-up fetch of updates missed while the app was inactive.

use std::future::Future;

use reqwest::StatusCode;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::http_error::describe_failure;
use crate::models::{DeviceId, UpdateEnvelope};

/// Source of the updates recorded after a checkpoint
pub trait CatchUpSource: Send + Sync + 'static {
    /// Fetch every update since `since` (Unix ms).
    ///
    /// `Ok(None)` means the server has nothing newer.
    fn fetch_missed(
        &self,
        user_id: &str,
        device_id: &DeviceId,
        since: i64,
    ) -> impl Future<Output = Result<Option<UpdateEnvelope>>> + Send;
}

/// Catch-up client for `GET {events_base_url}/getUpdates`
#[derive(Clone)]
pub struct HttpCatchUpClient {
    endpoint: String,
    client: reqwest::Client,
    access_token: Option<String>,
}

impl std::fmt::Debug for HttpCatchUpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpCatchUpClient")
            .field("endpoint", &self.endpoint)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpCatchUpClient {
    pub fn new(config: &SyncConfig, access_token: Option<String>) -> Result<Self> {
        Ok(Self {
            endpoint: format!("{}/getUpdates", config.events_base_url),
            client: reqwest::Client::builder().build()?,
            access_token,
        })
    }

    fn request_url(&self, user_id: &str, device_id: &DeviceId, since: i64) -> String {
        format!(
            "{}?user_id={}&device_id={}&timestamp={since}",
            self.endpoint,
            urlencoding::encode(user_id),
            urlencoding::encode(device_id.as_str()),
        )
    }
}

impl CatchUpSource for HttpCatchUpClient {
    fn fetch_missed(
        &self,
        user_id: &str,
        device_id: &DeviceId,
        since: i64,
    ) -> impl Future<Output = Result<Option<UpdateEnvelope>>> + Send {
        let mut request = self
            .client
            .get(self.request_url(user_id, device_id, since))
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        async move {
            let response = request
                .send()
                .await
                .map_err(|error| Error::Network(format!("catch-up request failed: {error}")))?;

            let status = response.status();
            if status == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::Network(describe_failure(status, &body)));
            }

            let body = response
                .text()
                .await
                .map_err(|error| Error::Network(format!("failed to read catch-up body: {error}")))?;
            if body.trim().is_empty() {
                return Ok(None);
            }

            let envelope = UpdateEnvelope::parse(&body)?;
            Ok((!envelope.is_empty()).then_some(envelope))
        }
    }
}
