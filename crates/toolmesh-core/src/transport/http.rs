//! Request/response HTTP client: one POST per envelope

use super::session::{self, RequestSender};
use super::status::{ClientStatus, StatusCell};
use super::TransportClient;
use crate::config::{ProviderConfig, TransportKind};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{CallToolResult, Envelope, Implementation, ToolDefinition};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Url};
use parking_lot::Mutex;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Client for providers answering each POST with the response envelope
pub struct HttpClient {
    name: String,
    url: Url,
    http: Client,
    timeout: Duration,
    status: StatusCell,
    /// Cancelled by `close` so that requests in flight fail
    closing: Mutex<CancellationToken>,
}

impl HttpClient {
    pub fn new(name: impl Into<String>, config: &ProviderConfig) -> MeshResult<Self> {
        let name = name.into();
        let url = Url::parse(&config.endpoint())
            .map_err(|e| MeshError::config(format!("provider '{}': invalid url: {}", name, e)))?;
        let http = build_http_client(&config.headers, "application/json")?;

        Ok(Self {
            name,
            url,
            http,
            timeout: config.request_timeout(),
            status: StatusCell::new(),
            closing: Mutex::new(CancellationToken::new()),
        })
    }

    /// POST one envelope; `None` when the body is empty
    async fn post(&self, envelope: &Envelope) -> MeshResult<Option<Envelope>> {
        let response = self
            .http
            .post(self.url.clone())
            .json(envelope)
            .send()
            .await
            .map_err(|e| self.send_failed(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MeshError::transport(format!("HTTP {}: {}", status, body)));
        }

        let body = response.bytes().await.map_err(|e| self.send_failed(e))?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let reply = serde_json::from_slice(&body)
            .map_err(|e| MeshError::protocol(format!("undecodable response: {}", e)))?;
        Ok(Some(reply))
    }

    fn send_failed(&self, err: reqwest::Error) -> MeshError {
        let err = MeshError::from(err);
        if err.is_transport_failure() && self.status.lost(err.to_string()) {
            warn!("Provider {} unreachable: {}", self.name, err);
        }
        err
    }
}

/// reqwest client with the provider's headers as defaults
pub(crate) fn build_http_client(
    headers: &std::collections::HashMap<String, String>,
    accept: &'static str,
) -> MeshResult<Client> {
    let mut header_map = HeaderMap::new();
    header_map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    header_map.insert(ACCEPT, HeaderValue::from_static(accept));

    for (key, value) in headers {
        let name = HeaderName::try_from(key.as_str())
            .map_err(|e| MeshError::config(format!("invalid header name '{}': {}", key, e)))?;
        let value = HeaderValue::try_from(value.as_str())
            .map_err(|e| MeshError::config(format!("invalid value for header '{}': {}", key, e)))?;
        header_map.insert(name, value);
    }

    Client::builder()
        .default_headers(header_map)
        .build()
        .map_err(|e| MeshError::connection(format!("Failed to create HTTP client: {}", e)))
}

#[async_trait]
impl RequestSender for HttpClient {
    async fn send_request(
        &self,
        cancel: &CancellationToken,
        request: Envelope,
    ) -> MeshResult<Envelope> {
        debug!(
            "POST {} {}",
            self.url,
            request.method.as_deref().unwrap_or_default()
        );
        let closing = self.closing.lock().clone();
        let reply = tokio::select! {
            reply = self.post(&request) => reply?,
            _ = cancel.cancelled() => return Err(MeshError::Cancelled),
            _ = closing.cancelled() => {
                return Err(MeshError::transport_closed("client closed"));
            }
            _ = tokio::time::sleep(self.timeout) => return Err(MeshError::timeout(self.timeout)),
        };

        let reply = reply.ok_or_else(|| MeshError::protocol("empty response body"))?;
        session::check_reply(&request, &reply)?;
        Ok(reply)
    }

    async fn send_notification(&self, notification: Envelope) -> MeshResult<()> {
        self.post(&notification).await.map(|_| ())
    }
}

#[async_trait]
impl TransportClient for HttpClient {
    #[instrument(skip(self, cancel), fields(provider = %self.name), level = "debug")]
    async fn initialize(&self, cancel: &CancellationToken) -> MeshResult<Implementation> {
        self.status.begin_connect()?;
        let outcome = session::handshake(self, cancel).await;
        self.status.settle(outcome)
    }

    #[instrument(skip(self, cancel), fields(provider = %self.name), level = "debug")]
    async fn list_tools(&self, cancel: &CancellationToken) -> MeshResult<Vec<ToolDefinition>> {
        self.status.ensure_connected()?;
        session::list_all_tools(self, cancel).await
    }

    #[instrument(skip(self, cancel, arguments), fields(provider = %self.name), level = "debug")]
    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: Value,
    ) -> MeshResult<CallToolResult> {
        self.status.ensure_connected()?;
        session::call_tool(self, cancel, name, arguments).await
    }

    async fn close(&self) -> MeshResult<()> {
        let closing = std::mem::take(&mut *self.closing.lock());
        closing.cancel();
        self.status.closed();
        debug!("HTTP client {} closed", self.name);
        Ok(())
    }

    fn status(&self) -> ClientStatus {
        self.status.get()
    }

    fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Http
    }
}
