//! Streaming client: responses over `text/event-stream`, requests via POST
//!
//! The stream is opened with a GET. Providers may announce where requests
//! go with an `endpoint` event; otherwise the POST URL is derived from the
//! stream URL. A POST reply that is itself the answer is used directly,
//! anything else is awaited on the stream.

use super::http::build_http_client;
use super::pending::PendingRequests;
use super::session::{self, RequestSender};
use super::status::{ClientStatus, StatusCell};
use super::TransportClient;
use crate::config::{ProviderConfig, TransportKind};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{
    CallToolResult, Envelope, Implementation, SseEvent, SseParser, ToolDefinition,
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use reqwest::header::ACCEPT;
use reqwest::{Client, Url};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How long connect waits for an `endpoint` event before deriving the URL
const ENDPOINT_WAIT: Duration = Duration::from_millis(500);

/// `…/sse` posts to `…/message`; any other URL posts to itself
pub fn derive_post_url(stream_url: &Url) -> Url {
    let mut url = stream_url.clone();
    if let Some(base) = stream_url.path().strip_suffix("/sse") {
        url.set_path(&format!("{}/message", base));
    }
    url
}

/// Client for providers speaking server-sent events
pub struct SseClient {
    name: String,
    stream_url: Url,
    post_url: Arc<RwLock<Url>>,
    http: Client,
    timeout: Duration,
    status: Arc<StatusCell>,
    pending: Arc<PendingRequests>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SseClient {
    pub fn new(name: impl Into<String>, config: &ProviderConfig) -> MeshResult<Self> {
        let name = name.into();
        let stream_url = Url::parse(&config.endpoint())
            .map_err(|e| MeshError::config(format!("provider '{}': invalid url: {}", name, e)))?;
        let http = build_http_client(&config.headers, "application/json, text/event-stream")?;

        Ok(Self {
            name,
            post_url: Arc::new(RwLock::new(derive_post_url(&stream_url))),
            stream_url,
            http,
            timeout: config.request_timeout(),
            status: Arc::new(StatusCell::new()),
            pending: Arc::new(PendingRequests::new()),
            reader_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Where requests are currently POSTed
    pub fn post_url(&self) -> Url {
        self.post_url.read().clone()
    }

    /// Responses that arrived after their caller stopped waiting
    pub fn late_responses(&self) -> u64 {
        self.pending.late_responses()
    }

    /// Open the event stream and start the reader task
    async fn open(&self) -> MeshResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::transport_closed("client is closed"));
        }

        let response = self
            .http
            .get(self.stream_url.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| {
                MeshError::connection(format!("Failed to open event stream: {}", e))
            })?;
        if !response.status().is_success() {
            return Err(MeshError::connection(format!(
                "Event stream rejected with status {}",
                response.status()
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = StreamReader {
            name: self.name.clone(),
            stream_url: self.stream_url.clone(),
            post_url: Arc::clone(&self.post_url),
            pending: Arc::clone(&self.pending),
            status: Arc::clone(&self.status),
            endpoint_tx: Some(endpoint_tx),
        };
        let task = tokio::spawn(reader.run(response.bytes_stream()));
        *self.reader_task.lock() = Some(task);

        match tokio::time::timeout(ENDPOINT_WAIT, endpoint_rx).await {
            Ok(Ok(url)) => debug!("Provider {} announced endpoint {}", self.name, url),
            _ => debug!(
                "No endpoint event from {}, posting to {}",
                self.name,
                self.post_url()
            ),
        }
        Ok(())
    }

    /// POST one envelope; the body is returned when it decodes as an envelope
    async fn post(&self, envelope: &Envelope) -> MeshResult<Option<Envelope>> {
        let response = self
            .http
            .post(self.post_url())
            .json(envelope)
            .send()
            .await
            .map_err(MeshError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MeshError::transport(format!("HTTP {}: {}", status, body)));
        }

        let body = response.bytes().await.map_err(MeshError::from)?;
        Ok(serde_json::from_slice::<Envelope>(&body).ok())
    }
}

/// State owned by the background stream task
struct StreamReader {
    name: String,
    stream_url: Url,
    post_url: Arc<RwLock<Url>>,
    pending: Arc<PendingRequests>,
    status: Arc<StatusCell>,
    endpoint_tx: Option<oneshot::Sender<Url>>,
}

impl StreamReader {
    async fn run<S, B>(mut self, body: S)
    where
        S: futures::Stream<Item = reqwest::Result<B>>,
        B: AsRef<[u8]>,
    {
        let mut body = std::pin::pin!(body);
        let mut parser = SseParser::new();
        let cause = loop {
            match body.next().await {
                Some(Ok(chunk)) => {
                    for event in parser.feed(chunk.as_ref()) {
                        self.handle(event);
                    }
                }
                Some(Err(e)) => break format!("event stream failed: {}", e),
                None => break "event stream ended".to_string(),
            }
        };

        info!("Provider {}: {}", self.name, cause);
        self.status.lost(cause);
        self.pending.fail_all();
    }

    fn handle(&mut self, event: SseEvent) {
        match event.event_type() {
            "endpoint" => match self.stream_url.join(event.data.trim()) {
                Ok(url) => {
                    *self.post_url.write() = url.clone();
                    if let Some(tx) = self.endpoint_tx.take() {
                        let _ = tx.send(url);
                    }
                }
                Err(e) => warn!("Provider {} sent a bad endpoint: {}", self.name, e),
            },
            "message" => match serde_json::from_str::<Envelope>(&event.data) {
                Ok(envelope) if envelope.is_response() => {
                    self.pending.resolve(envelope);
                }
                Ok(envelope) => debug!(
                    "Ignoring {} from provider {}",
                    envelope.method.as_deref().unwrap_or("message"),
                    self.name
                ),
                Err(e) => warn!("Undecodable event from provider {}: {}", self.name, e),
            },
            other => debug!("Ignoring '{}' event from provider {}", other, self.name),
        }
    }
}

#[async_trait]
impl RequestSender for SseClient {
    async fn send_request(
        &self,
        cancel: &CancellationToken,
        request: Envelope,
    ) -> MeshResult<Envelope> {
        let deadline = Instant::now() + self.timeout;
        let key = request
            .correlation_key()
            .ok_or_else(|| MeshError::protocol("request without id"))?;

        // Registered before the POST so a fast stream reply is not lost
        let waiter = self.pending.register(key)?;

        let direct = tokio::select! {
            reply = self.post(&request) => reply?,
            _ = cancel.cancelled() => return Err(MeshError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(MeshError::timeout(self.timeout)),
        };
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::transport_closed("client closed"));
        }
        if let Some(reply) = direct {
            if reply.is_response() && reply.correlation_key() == request.correlation_key() {
                return Ok(reply);
            }
        }

        waiter
            .wait(cancel, deadline.saturating_duration_since(Instant::now()))
            .await
    }

    async fn send_notification(&self, notification: Envelope) -> MeshResult<()> {
        self.post(&notification).await.map(|_| ())
    }
}

#[async_trait]
impl TransportClient for SseClient {
    #[instrument(skip(self, cancel), fields(provider = %self.name), level = "debug")]
    async fn initialize(&self, cancel: &CancellationToken) -> MeshResult<Implementation> {
        self.status.begin_connect()?;
        let outcome = match self.open().await {
            Ok(()) => session::handshake(self, cancel).await,
            Err(e) => Err(e),
        };
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
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.status.closed();
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        self.pending.fail_all();
        info!("Closed provider {}", self.name);
        Ok(())
    }

    fn status(&self) -> ClientStatus {
        self.status.get()
    }

    fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Sse
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    const CLOSE_STREAM: &str = "__close__";

    #[derive(Clone, Copy)]
    struct Behaviour {
        announce_endpoint: bool,
        reply_in_body: bool,
        /// Hold `tools/call` replies until this many are queued, then send
        /// them newest first; 0 answers at once
        hold_calls: usize,
    }

    /// Throwaway provider: one GET stream, POSTs answered per `Behaviour`
    struct TestProvider {
        url: String,
        events: mpsc::UnboundedSender<String>,
        posted_paths: Arc<Mutex<Vec<String>>>,
    }

    impl TestProvider {
        async fn start(behaviour: Behaviour) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (events_tx, events_rx) = mpsc::unbounded_channel::<String>();
            let events_rx = Arc::new(tokio::sync::Mutex::new(Some(events_rx)));
            let posted_paths = Arc::new(Mutex::new(Vec::new()));
            let held = Arc::new(Mutex::new(Vec::new()));

            let tx = events_tx.clone();
            let paths = Arc::clone(&posted_paths);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    tokio::spawn(serve_connection(
                        socket,
                        behaviour,
                        tx.clone(),
                        Arc::clone(&events_rx),
                        Arc::clone(&paths),
                        Arc::clone(&held),
                    ));
                }
            });

            Self {
                url: format!("http://{}/sse", addr),
                events: events_tx,
                posted_paths,
            }
        }

        fn client(&self) -> SseClient {
            let config = ProviderConfig::sse(&self.url).with_timeout(5);
            SseClient::new("stream", &config).unwrap()
        }
    }

    async fn read_request(socket: &mut TcpStream) -> Option<(String, String, Vec<u8>)> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.lines();
        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let path = request_line.next()?.to_string();
        let length = lines
            .filter_map(|l| l.split_once(':'))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let mut body = buf[header_end..].to_vec();
        while body.len() < length {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        Some((method, path, body))
    }

    fn answer(request: &Envelope) -> Option<Envelope> {
        if request.is_notification() {
            return None;
        }
        let result = match request.method.as_deref() {
            Some("initialize") => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "serverInfo": {"name": "stream-provider", "version": "0.3"}
            }),
            Some("tools/list") => json!({"tools": [{"name": "whois", "description": "Domain lookup"}]}),
            Some("tools/call") => {
                let domain = request.params.as_ref().unwrap()["arguments"]["domain"].clone();
                json!({"content": [{"type": "text", "text": format!("registrar of {}", domain.as_str().unwrap_or("?"))}]})
            }
            _ => return Some(Envelope::failure(
                request.id.clone(),
                crate::protocol::RpcError::method_not_found(),
            )),
        };
        Some(Envelope::success(request.id.clone(), result))
    }

    async fn serve_connection(
        mut socket: TcpStream,
        behaviour: Behaviour,
        events_tx: mpsc::UnboundedSender<String>,
        events_rx: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
        posted_paths: Arc<Mutex<Vec<String>>>,
        held: Arc<Mutex<Vec<String>>>,
    ) {
        let Some((method, path, body)) = read_request(&mut socket).await else {
            return;
        };

        if method == "GET" {
            let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\n\r\n";
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            let _ = socket.write_all(b": connected\n\n").await;
            if behaviour.announce_endpoint {
                let _ = socket
                    .write_all(b"event: endpoint\ndata: /rpc?session=abc\n\n")
                    .await;
            }
            let Some(mut rx) = events_rx.lock().await.take() else {
                return;
            };
            while let Some(data) = rx.recv().await {
                if data == CLOSE_STREAM {
                    break;
                }
                let frame = format!("event: message\ndata: {}\n\n", data);
                if socket.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
            }
            return;
        }

        posted_paths.lock().push(path);
        let request: Envelope = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(_) => {
                let _ = socket
                    .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
                return;
            }
        };

        let response = match answer(&request) {
            Some(reply) if behaviour.reply_in_body => {
                let body = serde_json::to_string(&reply).unwrap();
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                )
            }
            Some(reply) => {
                let frame = serde_json::to_string(&reply).unwrap();
                if behaviour.hold_calls > 0 && request.method.as_deref() == Some("tools/call") {
                    let mut held = held.lock();
                    held.push(frame);
                    if held.len() == behaviour.hold_calls {
                        for frame in held.drain(..).rev() {
                            let _ = events_tx.send(frame);
                        }
                    }
                } else {
                    let _ = events_tx.send(frame);
                }
                "HTTP/1.1 202 Accepted\r\nContent-Length: 8\r\nConnection: close\r\n\r\nAccepted".to_string()
            }
            None => "HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
        };
        let _ = socket.write_all(response.as_bytes()).await;
    }

    #[test]
    fn test_derive_post_url() {
        let url = Url::parse("http://host:9000/mcp/sse").unwrap();
        assert_eq!(derive_post_url(&url).as_str(), "http://host:9000/mcp/message");

        let url = Url::parse("http://host:9000/events?token=1").unwrap();
        assert_eq!(derive_post_url(&url).as_str(), "http://host:9000/events?token=1");
    }

    #[tokio::test]
    async fn test_replies_over_stream_with_derived_endpoint() {
        let provider = TestProvider::start(Behaviour {
            announce_endpoint: false,
            reply_in_body: false,
            hold_calls: 0,
        })
        .await;
        let client = provider.client();
        let cancel = CancellationToken::new();

        let info = client.initialize(&cancel).await.unwrap();
        assert_eq!(info.name, "stream-provider");
        assert!(client.is_connected());

        let result = client
            .call_tool(&cancel, "whois", json!({"domain": "example.org"}))
            .await
            .unwrap();
        assert_eq!(result.text_content(), "registrar of example.org");

        let paths = provider.posted_paths.lock().clone();
        assert!(paths.iter().all(|p| p == "/message"));
    }

    #[tokio::test]
    async fn test_endpoint_event_and_direct_body_reply() {
        let provider = TestProvider::start(Behaviour {
            announce_endpoint: true,
            reply_in_body: true,
            hold_calls: 0,
        })
        .await;
        let client = provider.client();
        let cancel = CancellationToken::new();

        client.initialize(&cancel).await.unwrap();
        assert_eq!(client.post_url().path(), "/rpc");
        assert_eq!(client.post_url().query(), Some("session=abc"));

        let tools = client.list_tools(&cancel).await.unwrap();
        assert_eq!(tools[0].name, "whois");

        let paths = provider.posted_paths.lock().clone();
        assert!(paths.iter().all(|p| p == "/rpc?session=abc"));
    }

    #[tokio::test]
    async fn test_stream_end_disconnects_and_fails_waiters() {
        let provider = TestProvider::start(Behaviour {
            announce_endpoint: false,
            reply_in_body: false,
            hold_calls: 0,
        })
        .await;
        let client = provider.client();
        let cancel = CancellationToken::new();
        client.initialize(&cancel).await.unwrap();

        provider.events.send(CLOSE_STREAM.to_string()).unwrap();
        for _ in 0..50 {
            if client.status() == ClientStatus::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(client.status(), ClientStatus::Disconnected);
        assert!(client.last_error().unwrap().contains("ended"));
        assert!(client.list_tools(&cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_rejected_stream_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = read_request(&mut socket).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            }
        });

        let config = ProviderConfig::sse(format!("http://{}/sse", addr));
        let client = SseClient::new("missing", &config).unwrap();
        let err = client.initialize(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, MeshError::Connection { .. }));
        assert_eq!(client.status(), ClientStatus::Error);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_out_of_order_replies_reach_their_callers() {
        let provider = TestProvider::start(Behaviour {
            announce_endpoint: false,
            reply_in_body: false,
            hold_calls: 2,
        })
        .await;
        let client = Arc::new(provider.client());
        client.initialize(&CancellationToken::new()).await.unwrap();

        let calls: Vec<_> = ["alpha.org", "beta.org"]
            .into_iter()
            .map(|domain| {
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    client
                        .call_tool(&CancellationToken::new(), "whois", json!({"domain": domain}))
                        .await
                })
            })
            .collect();

        let mut texts = Vec::new();
        for call in calls {
            texts.push(call.await.unwrap().unwrap().text_content());
        }
        assert_eq!(texts, vec!["registrar of alpha.org", "registrar of beta.org"]);
        assert_eq!(client.late_responses(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_call_in_flight() {
        // A single held call is never answered
        let provider = TestProvider::start(Behaviour {
            announce_endpoint: false,
            reply_in_body: false,
            hold_calls: 2,
        })
        .await;
        let client = Arc::new(provider.client());
        client.initialize(&CancellationToken::new()).await.unwrap();

        let call = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .call_tool(&CancellationToken::new(), "whois", json!({"domain": "x.org"}))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        client.close().await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, MeshError::TransportClosed { .. }), "{:?}", err);
        assert_eq!(client.status(), ClientStatus::Disconnected);
    }
}
