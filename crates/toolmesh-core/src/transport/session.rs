//! Protocol steps shared by every transport: handshake, listing, calls

use crate::error::{MeshError, MeshResult};
use crate::protocol::{
    CallToolParams, CallToolResult, Envelope, INITIALIZED_NOTIFICATION, Implementation,
    InitializeParams, InitializeResult, ListParams, ListToolsResult, Method, PROTOCOL_VERSION,
    RequestId, ToolDefinition,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on `tools/list` pages, guards against cursor loops
const MAX_LIST_PAGES: usize = 100;

/// Raw request/notification primitive implemented per transport
#[async_trait]
pub(crate) trait RequestSender: Send + Sync {
    /// Send a request and wait for its correlated response
    async fn send_request(&self, cancel: &CancellationToken, request: Envelope)
    -> MeshResult<Envelope>;

    /// Send a notification; nothing comes back
    async fn send_notification(&self, notification: Envelope) -> MeshResult<()>;
}

/// Build a request with a fresh id
pub(crate) fn new_request(method: &str, params: Option<Value>) -> Envelope {
    Envelope::request(RequestId::generate(), method, params)
}

/// Issue a request and unwrap its result payload
pub(crate) async fn request<S, T>(
    sender: &S,
    cancel: &CancellationToken,
    method: Method,
    params: Option<Value>,
) -> MeshResult<T>
where
    S: RequestSender + ?Sized,
    T: DeserializeOwned,
{
    let response = sender
        .send_request(cancel, new_request(method.as_str(), params))
        .await?;
    let value = response.into_result()?;
    serde_json::from_value(value)
        .map_err(|e| MeshError::protocol(format!("invalid {} result: {}", method, e)))
}

/// `initialize` followed by the initialized notification
pub(crate) async fn handshake<S>(sender: &S, cancel: &CancellationToken) -> MeshResult<Implementation>
where
    S: RequestSender + ?Sized,
{
    let params = InitializeParams {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: json!({}),
        client_info: Implementation::toolmesh(),
    };
    let result: InitializeResult = request(
        sender,
        cancel,
        Method::Initialize,
        Some(serde_json::to_value(&params)?),
    )
    .await?;

    if result.protocol_version != PROTOCOL_VERSION {
        warn!(
            "Server {} speaks protocol {}, expected {}",
            result.server_info.name, result.protocol_version, PROTOCOL_VERSION
        );
    }

    sender
        .send_notification(Envelope::notification(INITIALIZED_NOTIFICATION, None))
        .await?;
    debug!(
        "Handshake complete with {} {}",
        result.server_info.name, result.server_info.version
    );
    Ok(result.server_info)
}

/// Every page of `tools/list`
pub(crate) async fn list_all_tools<S>(
    sender: &S,
    cancel: &CancellationToken,
) -> MeshResult<Vec<ToolDefinition>>
where
    S: RequestSender + ?Sized,
{
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let params = serde_json::to_value(ListParams {
            cursor: cursor.take(),
        })?;
        let page: ListToolsResult = request(sender, cancel, Method::ToolsList, Some(params)).await?;
        tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }

    warn!("tools/list exceeded {} pages, truncating", MAX_LIST_PAGES);
    Ok(tools)
}

/// `tools/call`
pub(crate) async fn call_tool<S>(
    sender: &S,
    cancel: &CancellationToken,
    name: &str,
    arguments: Value,
) -> MeshResult<CallToolResult>
where
    S: RequestSender + ?Sized,
{
    let params = serde_json::to_value(CallToolParams {
        name: name.to_string(),
        arguments,
    })?;
    request(sender, cancel, Method::ToolsCall, Some(params)).await
}

/// Check that a reply answers the request it was read for
pub(crate) fn check_reply(request: &Envelope, reply: &Envelope) -> MeshResult<()> {
    if reply.correlation_key() != request.correlation_key() {
        return Err(MeshError::protocol(format!(
            "response id {:?} does not match request id {:?}",
            reply.correlation_key(),
            request.correlation_key()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays canned results in order and records what was sent
    struct Scripted {
        results: Mutex<VecDeque<Value>>,
        sent: Mutex<Vec<Envelope>>,
    }

    impl Scripted {
        fn new(results: Vec<Value>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RequestSender for Scripted {
        async fn send_request(
            &self,
            _cancel: &CancellationToken,
            request: Envelope,
        ) -> MeshResult<Envelope> {
            self.sent.lock().push(request.clone());
            let result = self
                .results
                .lock()
                .pop_front()
                .ok_or_else(|| MeshError::other("script exhausted"))?;
            Ok(Envelope::success(request.id, result))
        }

        async fn send_notification(&self, notification: Envelope) -> MeshResult<()> {
            self.sent.lock().push(notification);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handshake_sends_initialized_notification() {
        let sender = Scripted::new(vec![json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "serverInfo": {"name": "scanner", "version": "1.0"}
        })]);

        let info = handshake(&sender, &CancellationToken::new()).await.unwrap();
        assert_eq!(info.name, "scanner");

        let sent = sender.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].method.as_deref(), Some("initialize"));
        assert_eq!(sent[0].params.as_ref().unwrap()["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(sent[1].method.as_deref(), Some(INITIALIZED_NOTIFICATION));
        assert!(sent[1].is_notification());
    }

    #[tokio::test]
    async fn test_list_follows_cursor() {
        let sender = Scripted::new(vec![
            json!({"tools": [{"name": "a", "description": "first"}], "nextCursor": "p2"}),
            json!({"tools": [{"name": "b", "description": "second"}]}),
        ]);

        let tools = list_all_tools(&sender, &CancellationToken::new()).await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let sent = sender.sent.lock();
        assert_eq!(sent[1].params.as_ref().unwrap()["cursor"], "p2");
    }

    #[tokio::test]
    async fn test_remote_error_maps_to_rpc() {
        struct Failing;

        #[async_trait]
        impl RequestSender for Failing {
            async fn send_request(
                &self,
                _cancel: &CancellationToken,
                request: Envelope,
            ) -> MeshResult<Envelope> {
                Ok(Envelope::failure(
                    request.id,
                    crate::protocol::RpcError::new(-32601, "Tool not found"),
                ))
            }

            async fn send_notification(&self, _notification: Envelope) -> MeshResult<()> {
                Ok(())
            }
        }

        let err = call_tool(&Failing, &CancellationToken::new(), "ghost", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Rpc { code: -32601, .. }));
    }

    #[test]
    fn test_check_reply_rejects_mismatched_id() {
        let request = new_request("tools/list", None);
        let reply = Envelope::success(Some(RequestId::String("other".into())), json!({}));
        assert!(check_reply(&request, &reply).is_err());

        let good = Envelope::success(request.id.clone(), json!({}));
        assert!(check_reply(&request, &good).is_ok());
    }
}
