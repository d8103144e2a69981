//! Newline-delimited JSON server loop

use super::Dispatcher;
use crate::error::MeshResult;
use crate::protocol::Envelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How long cancelled calls get to record their outcome on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Serve the dispatcher over a line-oriented byte stream
///
/// Every inbound line is handled on its own task, so a slow tool never
/// blocks other requests. Replies funnel through one writer task to keep
/// lines whole. Returns when the reader hits EOF (after in-flight calls
/// drain) or when `shutdown` fires. Tool calls are bound to `shutdown`, so
/// on shutdown they are cancelled and recorded as failed; anything still
/// running after a short grace period is aborted.
pub async fn serve_stdio<R, W>(
    dispatcher: Arc<Dispatcher>,
    reader: R,
    writer: W,
    shutdown: CancellationToken,
) -> MeshResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
    let writer_task = tokio::spawn(write_replies(writer, rx));

    let mut lines = BufReader::new(reader).lines();
    let mut in_flight = JoinSet::new();
    let mut outcome = Ok(());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, stopping server loop");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let dispatcher = Arc::clone(&dispatcher);
                    let tx = tx.clone();
                    let cancel = shutdown.child_token();
                    in_flight.spawn(async move {
                        let reply = dispatcher
                            .handle_message_cancellable(line.as_bytes(), &cancel)
                            .await;
                        if let Some(reply) = reply {
                            // Receiver only goes away when the writer failed
                            let _ = tx.send(reply);
                        }
                    });
                }
                Ok(None) => {
                    debug!("Input closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    outcome = Err(e.into());
                    break;
                }
            }
        }
        while in_flight.try_join_next().is_some() {}
    }

    if shutdown.is_cancelled() {
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            debug!("Aborting {} calls still in flight", in_flight.len());
            in_flight.abort_all();
        }
    }
    while in_flight.join_next().await.is_some() {}

    drop(tx);
    if let Err(e) = writer_task.await {
        error!("Writer task failed: {}", e);
    }
    outcome
}

async fn write_replies<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Envelope>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(reply) = rx.recv().await {
        let mut line = match serde_json::to_vec(&reply) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode reply: {}", e);
                continue;
            }
        };
        line.push(b'\n');

        if let Err(e) = writer.write_all(&line).await {
            error!("Failed to write reply: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("Failed to flush reply: {}", e);
            break;
        }
    }
}
