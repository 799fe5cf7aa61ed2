//! REST client for a PostgREST-compatible key-value table.
//!
//! Requests go to `{backend.url}/rest/v1/{table}` with the project API key
//! in both the `apikey` header and the bearer token. Row changes arrive
//! through the realtime WebSocket (see [`super::realtime`]) and are fanned
//! out to every [`ChangeFeed`] handed out by this client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, StatusCode};
use satchel_core::{KeyValueRecord, RemoteChange, RemoteError, SyncConfig};
use tokio::sync::broadcast;
use tracing::debug;

use super::realtime::{spawn_realtime, RealtimeHandle, RealtimeOptions};
use super::{ChangeFeed, RemoteStore};

const SELECT_COLUMNS: &str = "key,value,updated_at";

/// Remote store backed by a hosted REST API.
#[derive(Debug, Clone)]
pub struct RestRemoteStore {
    http: Client,
    endpoint: String,
    timeout: Duration,
    changes: broadcast::Sender<RemoteChange>,
}

impl RestRemoteStore {
    /// Build a client from configuration. Does not touch the network.
    pub fn new(config: &SyncConfig) -> Result<Self, RemoteError> {
        let mut headers = HeaderMap::new();
        let api_key = HeaderValue::from_str(&config.backend.api_key)
            .map_err(|e| RemoteError::request("configure", e))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.backend.api_key))
            .map_err(|e| RemoteError::request("configure", e))?;
        headers.insert("apikey", api_key);
        headers.insert(AUTHORIZATION, bearer);

        let timeout = config.request_timeout();
        let http = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::request("configure", e))?;

        let (changes, _rx) = broadcast::channel(config.change_feed_capacity);

        Ok(Self {
            http,
            endpoint: format!(
                "{}/rest/v1/{}",
                config.backend.url.trim_end_matches('/'),
                config.table
            ),
            timeout,
            changes,
        })
    }

    /// Table endpoint this client talks to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Connect the realtime WebSocket and publish its changes to this
    /// client's feeds. Returns `None` when realtime is disabled.
    pub fn start_realtime(&self, config: &SyncConfig) -> Option<RealtimeHandle> {
        if !config.realtime.enabled {
            debug!("Realtime disabled by configuration");
            return None;
        }
        let options = RealtimeOptions::from_config(config);
        Some(spawn_realtime(options, self.changes.clone()))
    }

    async fn send(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<reqwest::Response, RemoteError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout {
                    operation: operation.to_string(),
                    after: self.timeout,
                }
            } else {
                RemoteError::request(operation, e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(status_error(operation, status, message))
    }

    async fn select(
        &self,
        operation: &str,
        filter: Option<&str>,
    ) -> Result<Vec<KeyValueRecord>, RemoteError> {
        let mut query: Vec<(&str, String)> = vec![("select", SELECT_COLUMNS.to_string())];
        if let Some(key) = filter {
            query.push(("key", format!("eq.{}", key)));
            query.push(("limit", "1".to_string()));
        }
        let request = self.http.get(&self.endpoint).query(&query);
        let response = self.send(operation, request).await?;
        response
            .json::<Vec<KeyValueRecord>>()
            .await
            .map_err(|e| RemoteError::decode(operation, e))
    }
}

fn status_error(operation: &str, status: StatusCode, message: String) -> RemoteError {
    RemoteError::Status {
        operation: operation.to_string(),
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    async fn fetch_all(&self) -> Result<Vec<KeyValueRecord>, RemoteError> {
        self.select("fetch_all", None).await
    }

    async fn fetch_one(&self, key: &str) -> Result<Option<KeyValueRecord>, RemoteError> {
        let rows = self.select("fetch_one", Some(key)).await?;
        Ok(rows.into_iter().next())
    }

    async fn upsert(&self, record: &KeyValueRecord) -> Result<(), RemoteError> {
        let request = self
            .http
            .post(&self.endpoint)
            .query(&[("on_conflict", "key")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[record]);
        self.send("upsert", request).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        let request = self
            .http
            .delete(&self.endpoint)
            .query(&[("key", format!("eq.{}", key))]);
        self.send("delete", request).await?;
        Ok(())
    }

    fn subscribe_changes(&self) -> ChangeFeed {
        ChangeFeed::new(self.changes.subscribe())
    }
}
