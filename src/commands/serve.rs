//! Serve the dispatcher over stdio

use super::connect_manager;
use anyhow::Result;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use toolmesh_core::dispatcher::serve_stdio;
use toolmesh_core::{
    CallToolResult, Dispatcher, MeshConfig, MeshError, ProviderManager, ToolDefinition,
    bridge_remote_tools, handler_fn,
};
use tracing::{info, warn};

/// Register the tools every server offers
pub fn register_builtins(dispatcher: &Dispatcher) {
    dispatcher.register_tool(
        ToolDefinition::new("echo", "Echo the single given argument back unchanged")
            .with_short_description("Echo a message")
            .with_input_schema(json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "Text to echo"}
                },
                "minProperties": 1,
                "maxProperties": 1
            })),
        handler_fn(|args: Value| async move {
            // Any single argument is echoed, whatever its key
            let value = args
                .as_object()
                .filter(|map| map.len() == 1)
                .and_then(|map| map.values().next())
                .ok_or_else(|| MeshError::invalid_params("echo takes exactly one argument"))?;
            let text = value.as_str().map_or_else(|| value.to_string(), str::to_string);
            Ok::<_, MeshError>(CallToolResult::text(text))
        }),
    );
}

/// Answer requests on stdin until EOF or Ctrl-C
pub async fn serve(config: &MeshConfig, local_only: bool) -> Result<()> {
    let dispatcher = Arc::new(Dispatcher::new(&config.server));
    register_builtins(&dispatcher);

    let shutdown = CancellationToken::new();
    let manager = if local_only {
        None
    } else {
        let manager = connect_manager(config).await?;
        bridge_remote_tools(&manager, &dispatcher, &shutdown).await?;
        manager.start_refresh_loop();
        tokio::spawn(rebridge_loop(
            Arc::clone(&manager),
            Arc::clone(&dispatcher),
            shutdown.clone(),
            manager.settings().refresh_interval(),
        ));
        Some(manager)
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted");
                shutdown.cancel();
            }
        });
    }

    info!(
        "Serving {} tools on stdio",
        dispatcher.list_tools().len()
    );
    let outcome = serve_stdio(
        Arc::clone(&dispatcher),
        tokio::io::stdin(),
        tokio::io::stdout(),
        shutdown.clone(),
    )
    .await;

    shutdown.cancel();
    if let Some(manager) = manager {
        manager.shutdown().await;
    }
    outcome?;
    Ok(())
}

/// Keep the bridged catalog in step with the providers
async fn rebridge_loop(
    manager: Arc<ProviderManager>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = bridge_remote_tools(&manager, &dispatcher, &shutdown).await {
            warn!("Failed to refresh bridged tools: {}", e);
        }
    }
}
