//! Subprocess client: newline-delimited envelopes over stdin/stdout
//!
//! One background task reads stdout and routes responses by id, so any
//! number of requests may be in flight at once. stderr is forwarded to the
//! log at debug level.

use super::pending::PendingRequests;
use super::session::{self, RequestSender};
use super::status::{ClientStatus, StatusCell};
use super::TransportClient;
use crate::config::{ProviderConfig, TransportKind};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{CallToolResult, Envelope, Implementation, ToolDefinition};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How long a child gets to exit after stdin closes
const CLOSE_GRACE: Duration = Duration::from_secs(5);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone)]
struct Launch {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

/// Client for providers running as a local child process
pub struct StdioClient {
    name: String,
    launch: Option<Launch>,
    timeout: Duration,
    status: Arc<StatusCell>,
    pending: Arc<PendingRequests>,
    writer: Mutex<Option<BoxedWriter>>,
    child: Mutex<Option<Child>>,
    preset_io: parking_lot::Mutex<Option<(BoxedReader, BoxedWriter)>>,
    reader_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl StdioClient {
    /// Client that spawns `config.command` on initialize
    pub fn new(name: impl Into<String>, config: &ProviderConfig) -> MeshResult<Self> {
        let name = name.into();
        let command = config
            .command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| MeshError::config(format!("provider '{}' requires command", name)))?;

        let launch = Launch {
            command,
            args: config.args.clone(),
            env: config.env.clone(),
        };
        Ok(Self::build(name, Some(launch), None, config.request_timeout()))
    }

    /// Client over already-open pipes instead of a child process
    pub fn with_io<R, W>(name: impl Into<String>, reader: R, writer: W, timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(
            name.into(),
            None,
            Some((Box::new(reader), Box::new(writer))),
            timeout,
        )
    }

    fn build(
        name: String,
        launch: Option<Launch>,
        preset_io: Option<(BoxedReader, BoxedWriter)>,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            launch,
            timeout,
            status: Arc::new(StatusCell::new()),
            pending: Arc::new(PendingRequests::new()),
            writer: Mutex::new(None),
            child: Mutex::new(None),
            preset_io: parking_lot::Mutex::new(preset_io),
            reader_task: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Responses that arrived after their caller stopped waiting
    pub fn late_responses(&self) -> u64 {
        self.pending.late_responses()
    }

    /// Spawn the child (or take the preset pipes) and start the reader
    async fn open(&self) -> MeshResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::transport_closed("client is closed"));
        }

        let preset = self.preset_io.lock().take();
        let (reader, writer): (BoxedReader, BoxedWriter) = match (preset, &self.launch) {
            (Some(io), _) => io,
            (None, Some(launch)) => self.spawn_child(launch).await?,
            (None, None) => {
                return Err(MeshError::connection("pipes were already consumed"));
            }
        };

        *self.writer.lock().await = Some(writer);
        let task = tokio::spawn(read_loop(
            self.name.clone(),
            reader,
            Arc::clone(&self.pending),
            Arc::clone(&self.status),
        ));
        *self.reader_task.lock() = Some(task);
        Ok(())
    }

    async fn spawn_child(&self, launch: &Launch) -> MeshResult<(BoxedReader, BoxedWriter)> {
        let mut cmd = Command::new(&launch.command);
        cmd.args(&launch.args)
            .envs(&launch.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            MeshError::connection(format!(
                "Failed to spawn provider '{}' ({}): {}",
                self.name, launch.command, e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MeshError::connection("Failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MeshError::connection("Failed to get stdout handle"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(self.name.clone(), stderr));
        }

        info!(
            "Spawned provider {} (pid {:?}): {} {}",
            self.name,
            child.id(),
            launch.command,
            launch.args.join(" ")
        );
        *self.child.lock().await = Some(child);
        Ok((Box::new(stdout), Box::new(stdin)))
    }

    async fn write_line(&self, envelope: &Envelope) -> MeshResult<()> {
        let mut line = serde_json::to_vec(envelope)?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| MeshError::transport_closed("stdin is closed"))?;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

async fn read_loop(
    name: String,
    reader: BoxedReader,
    pending: Arc<PendingRequests>,
    status: Arc<StatusCell>,
) {
    let mut lines = BufReader::new(reader).lines();
    let cause = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Envelope>(line) {
                    Ok(envelope) if envelope.is_response() => {
                        pending.resolve(envelope);
                    }
                    Ok(envelope) => debug!(
                        "Ignoring {} from provider {}",
                        envelope.method.as_deref().unwrap_or("message"),
                        name
                    ),
                    Err(e) => warn!("Undecodable line from provider {}: {}", name, e),
                }
            }
            Ok(None) => break "provider closed its output".to_string(),
            Err(e) => break format!("failed to read provider output: {}", e),
        }
    };

    info!("Provider {}: {}", name, cause);
    status.lost(cause);
    pending.fail_all();
}

async fn forward_stderr(name: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(provider = %name, "stderr: {}", line);
    }
}

#[async_trait]
impl RequestSender for StdioClient {
    async fn send_request(
        &self,
        cancel: &CancellationToken,
        request: Envelope,
    ) -> MeshResult<Envelope> {
        let key = request
            .correlation_key()
            .ok_or_else(|| MeshError::protocol("request without id"))?;
        let waiter = self.pending.register(key)?;
        self.write_line(&request).await?;
        waiter.wait(cancel, self.timeout).await
    }

    async fn send_notification(&self, notification: Envelope) -> MeshResult<()> {
        self.write_line(&notification).await
    }
}

#[async_trait]
impl TransportClient for StdioClient {
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

        // EOF on stdin asks the child to exit
        self.writer.lock().await.take();
        self.pending.fail_all();
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(Ok(exit)) => debug!("Provider {} exited: {}", self.name, exit),
                Ok(Err(e)) => warn!("Failed to wait for provider {}: {}", self.name, e),
                Err(_) => {
                    warn!("Provider {} did not exit, killing it", self.name);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill provider {}: {}", self.name, e);
                    }
                }
            }
        }

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
        TransportKind::Stdio
    }
}

impl Drop for StdioClient {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }
}
