//! Integration tests: dispatcher, provider manager and transports together

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use toolmesh_core::dispatcher::serve_stdio;
use toolmesh_core::error::MeshResult;
use toolmesh_core::transport::StdioClient;
use toolmesh_core::{
    CallToolResult, ClientFactory, ClientStatus, Dispatcher, Envelope, ManagerSettings, MeshError,
    ProviderConfig, ProviderManager, ToolDefinition, TransportClient, bridge_remote_tools,
    handler_fn,
};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Provider dispatcher with a single `lookup` tool
fn intel_dispatcher() -> Arc<Dispatcher> {
    let dispatcher = Dispatcher::default();
    dispatcher.register_tool(
        ToolDefinition::new("lookup", "Resolve a host"),
        handler_fn(|args: Value| async move {
            let host = args["host"].as_str().unwrap_or("unknown").to_string();
            Ok::<_, MeshError>(CallToolResult::text(format!("{} -> 10.0.0.7", host)))
        }),
    );
    Arc::new(dispatcher)
}

/// Connects each provider to an in-process dispatcher over a duplex pipe
struct DuplexFactory {
    upstream: Arc<Dispatcher>,
}

impl ClientFactory for DuplexFactory {
    fn create(&self, name: &str, config: &ProviderConfig) -> MeshResult<Arc<dyn TransportClient>> {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_side);
        let (client_read, client_write) = tokio::io::split(client_side);

        tokio::spawn(serve_stdio(
            Arc::clone(&self.upstream),
            server_read,
            server_write,
            CancellationToken::new(),
        ));
        Ok(Arc::new(StdioClient::with_io(
            name,
            client_read,
            client_write,
            config.request_timeout(),
        )))
    }
}

fn settings() -> ManagerSettings {
    ManagerSettings {
        settle_delay_ms: 60_000,
        ..ManagerSettings::default()
    }
}

async fn intel_manager() -> Arc<ProviderManager> {
    let factory = Arc::new(DuplexFactory {
        upstream: intel_dispatcher(),
    });
    let manager = ProviderManager::with_factory(settings(), factory, None);
    manager
        .add_or_update_config("intel", ProviderConfig::stdio("intel-mcp", vec![]))
        .await
        .unwrap();
    assert!(manager.wait_for_connections(Duration::from_secs(5)).await);
    manager
}

fn call_envelope(id: &str, name: &str, arguments: Value) -> Envelope {
    Envelope::request(
        id,
        "tools/call",
        Some(json!({"name": name, "arguments": arguments})),
    )
}

#[tokio::test]
async fn test_bridged_tool_round_trip() {
    let manager = intel_manager().await;
    assert_eq!(manager.provider_status("intel"), Some(ClientStatus::Connected));

    let gateway = Dispatcher::default();
    let cancel = CancellationToken::new();
    assert_eq!(bridge_remote_tools(&manager, &gateway, &cancel).await.unwrap(), 1);
    assert!(gateway.has_tool("intel::lookup"));

    let reply = gateway
        .handle_envelope(call_envelope("1", "intel::lookup", json!({"host": "db01"})))
        .await
        .unwrap();
    let result = reply.result.unwrap();
    assert_eq!(result["content"][0]["text"], "db01 -> 10.0.0.7");

    // Both sides keep their own history
    assert_eq!(gateway.tool_stats()["intel::lookup"].success_calls, 1);
    assert_eq!(manager.tool_stats()["intel::lookup"].success_calls, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_removed_provider_is_unbridged() {
    let manager = intel_manager().await;
    let gateway = Dispatcher::default();
    gateway.register_tool(
        ToolDefinition::new("echo", "Local echo"),
        handler_fn(|_| async { Ok(CallToolResult::text("local")) }),
    );
    let cancel = CancellationToken::new();
    bridge_remote_tools(&manager, &gateway, &cancel).await.unwrap();

    manager.remove_config("intel").await.unwrap();
    assert_eq!(bridge_remote_tools(&manager, &gateway, &cancel).await.unwrap(), 0);

    let names: Vec<String> = gateway.list_tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["echo"]);
}

#[tokio::test]
async fn test_stopped_provider_call_is_unavailable() {
    let manager = intel_manager().await;
    manager.stop_client("intel").await.unwrap();

    let err = manager
        .call_tool(&CancellationToken::new(), "intel::lookup", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::ProviderUnavailable { .. }));
    assert_eq!(manager.get_tool_counts()["intel"], 1);
}

/// HTTP provider answering by method with the request id echoed
struct PingProvider;

impl Respond for PingProvider {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let envelope: Envelope = match serde_json::from_slice(&request.body) {
            Ok(envelope) => envelope,
            Err(_) => return ResponseTemplate::new(400),
        };
        if envelope.is_notification() {
            return ResponseTemplate::new(202);
        }
        let result = match envelope.method.as_deref() {
            Some("initialize") => json!({
                "protocolVersion": toolmesh_core::protocol::PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "pinger", "version": "0.9.0"}
            }),
            Some("tools/list") => json!({"tools": [{"name": "ping", "description": "ICMP ping"}]}),
            Some("tools/call") => json!({"content": [{"type": "text", "text": "pong"}]}),
            _ => json!({}),
        };
        ResponseTemplate::new(200).set_body_json(Envelope::success(envelope.id, result))
    }
}

#[tokio::test]
async fn test_http_provider_through_manager() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(PingProvider)
        .mount(&server)
        .await;

    let manager = ProviderManager::new(settings());
    manager
        .add_or_update_config("net", ProviderConfig::http(format!("{}/rpc", server.uri())))
        .await
        .unwrap();
    assert!(manager.wait_for_connections(Duration::from_secs(5)).await);

    let cancel = CancellationToken::new();
    let tools = manager.get_all_tools(&cancel).await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "net::ping");

    let result = manager.call_tool(&cancel, "net::ping", json!({})).await.unwrap();
    assert_eq!(result.text_content(), "pong");

    let stats = manager.get_stats();
    assert_eq!(stats.connected, 1);
    assert_eq!(stats.providers[0].tool_count, 1);

    manager.shutdown().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_http_provider_reports_error() {
    let manager = ProviderManager::new(settings());
    manager
        .add_or_update_config(
            "down",
            ProviderConfig::http("http://127.0.0.1:1/rpc").with_timeout(2),
        )
        .await
        .unwrap();
    assert!(manager.wait_for_connections(Duration::from_secs(10)).await);

    assert_eq!(manager.provider_status("down"), Some(ClientStatus::Error));
    assert!(manager.get_all_tools(&CancellationToken::new()).await.is_empty());
    let summary = &manager.get_stats().providers[0];
    assert!(summary.last_error.is_some());
}
