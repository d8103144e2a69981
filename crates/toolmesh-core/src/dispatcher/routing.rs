//! Envelope routing

use super::Dispatcher;
use crate::error::MeshError;
use crate::protocol::{
    CallToolParams, Content, Envelope, GetPromptParams, GetPromptResult, InitializeParams,
    InitializeResult, ListParams, ListToolsResult, Method, PROTOCOL_VERSION, Prompt,
    PromptMessage, PromptRole, ReadResourceParams, RpcError,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type RouteResult = Result<Value, RpcError>;

impl Dispatcher {
    /// Decode raw bytes and dispatch
    ///
    /// Undecodable input is answered with a parse error carrying a null id.
    pub async fn handle_message(&self, bytes: &[u8]) -> Option<Envelope> {
        self.handle_message_cancellable(bytes, &CancellationToken::new())
            .await
    }

    /// [`Self::handle_message`] with tool calls bound to `cancel`
    pub async fn handle_message_cancellable(
        &self,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Option<Envelope> {
        match serde_json::from_slice::<Envelope>(bytes) {
            Ok(envelope) => self.handle_envelope_cancellable(envelope, cancel).await,
            Err(e) => {
                warn!("Undecodable message: {}", e);
                Some(Envelope::failure(
                    None,
                    RpcError::parse_error().with_data(json!(e.to_string())),
                ))
            }
        }
    }

    /// Route one envelope; notifications yield `None`
    pub async fn handle_envelope(&self, envelope: Envelope) -> Option<Envelope> {
        self.handle_envelope_cancellable(envelope, &CancellationToken::new())
            .await
    }

    /// [`Self::handle_envelope`] with tool calls bound to `cancel`
    pub async fn handle_envelope_cancellable(
        &self,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Option<Envelope> {
        if envelope.is_notification() {
            debug!(
                "Notification {}",
                envelope.method.as_deref().unwrap_or("<none>")
            );
            return None;
        }

        let Envelope {
            id, method, params, ..
        } = envelope;

        let Some(name) = method else {
            return Some(Envelope::failure(id, RpcError::invalid_request()));
        };
        let Some(method) = Method::parse(&name) else {
            debug!("Unknown method {}", name);
            return Some(Envelope::failure(
                id,
                RpcError::method_not_found().with_data(json!({ "method": name })),
            ));
        };

        let params = params.unwrap_or(Value::Null);
        let routed = match method {
            Method::Initialize => self.on_initialize(params),
            Method::ToolsList => self.on_tools_list(params),
            Method::ToolsCall => self.on_tools_call(params, cancel).await,
            Method::PromptsList => self.on_prompts_list(),
            Method::PromptsGet => self.on_prompts_get(params),
            Method::ResourcesList => self.on_resources_list(),
            Method::ResourcesRead => self.on_resources_read(params),
            Method::SamplingRequest => self.on_sampling(params).await,
        };

        Some(match routed {
            Ok(result) => Envelope::success(id, result),
            Err(error) => Envelope::failure(id, error),
        })
    }

    fn on_initialize(&self, params: Value) -> RouteResult {
        match decode::<InitializeParams>(params) {
            Ok(init) => info!(
                "Client {} {} connected (protocol {})",
                init.client_info.name, init.client_info.version, init.protocol_version
            ),
            Err(_) => debug!("initialize without client info"),
        }

        encode(&InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({
                "tools": { "listChanged": false },
                "prompts": { "listChanged": false },
                "resources": { "subscribe": false, "listChanged": false },
            }),
            server_info: self.info.clone(),
        })
    }

    fn on_tools_list(&self, params: Value) -> RouteResult {
        let _: ListParams = decode_or_default(params)?;
        encode(&ListToolsResult {
            tools: self.list_tools(),
            next_cursor: None,
        })
    }

    async fn on_tools_call(&self, params: Value, cancel: &CancellationToken) -> RouteResult {
        let params: CallToolParams = decode(params)?;
        match self.call_tool(cancel, &params.name, params.arguments).await {
            Ok(outcome) => encode(&outcome.result),
            Err(MeshError::ToolNotFound { .. }) => Err(RpcError::new(
                RpcError::METHOD_NOT_FOUND,
                "Tool not found",
            )),
            Err(e) => Err(internal_error(&e)),
        }
    }

    fn on_prompts_list(&self) -> RouteResult {
        Ok(json!({ "prompts": self.registry.prompts() }))
    }

    fn on_prompts_get(&self, params: Value) -> RouteResult {
        let params: GetPromptParams = decode(params)?;
        let prompt = self.registry.prompt(&params.name).ok_or_else(|| {
            RpcError::new(
                RpcError::INVALID_PARAMS,
                format!("Prompt not found: {}", params.name),
            )
        })?;

        if let Some(missing) = prompt
            .arguments
            .iter()
            .find(|arg| arg.required && !params.arguments.contains_key(&arg.name))
        {
            return Err(RpcError::new(
                RpcError::INVALID_PARAMS,
                format!("Missing required argument: {}", missing.name),
            ));
        }

        encode(&GetPromptResult {
            description: prompt.description.clone(),
            messages: vec![PromptMessage {
                role: PromptRole::User,
                content: Content::text(render_prompt(&prompt, &params.arguments)),
            }],
        })
    }

    fn on_resources_list(&self) -> RouteResult {
        Ok(json!({ "resources": self.registry.resources() }))
    }

    fn on_resources_read(&self, params: Value) -> RouteResult {
        let params: ReadResourceParams = decode(params)?;
        let content = self.registry.read_resource(&params.uri).ok_or_else(|| {
            RpcError::new(
                RpcError::INVALID_PARAMS,
                format!("Resource not found: {}", params.uri),
            )
        })?;
        Ok(json!({ "contents": [content] }))
    }

    async fn on_sampling(&self, params: Value) -> RouteResult {
        let handler = self.sampling.read().clone();
        let Some(handler) = handler else {
            return Err(RpcError::new(
                RpcError::METHOD_NOT_FOUND,
                "Sampling not supported",
            ));
        };
        handler
            .create_message(params)
            .await
            .map_err(|e| internal_error(&e))
    }
}

/// Internal error carrying the stable code and the message
fn internal_error(err: &MeshError) -> RpcError {
    RpcError::internal_error().with_data(json!({
        "code": err.error_code(),
        "message": err.to_string(),
    }))
}

/// Substitute `{{name}}` placeholders
fn render_prompt(prompt: &Prompt, arguments: &HashMap<String, String>) -> String {
    let Some(template) = &prompt.template else {
        return prompt
            .description
            .clone()
            .unwrap_or_else(|| prompt.name.clone());
    };
    arguments
        .iter()
        .fold(template.clone(), |text, (key, value)| {
            text.replace(&format!("{{{{{}}}}}", key), value)
        })
}

fn decode<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params)
        .map_err(|e| RpcError::invalid_params().with_data(json!(e.to_string())))
}

/// Absent params decode as the empty object
fn decode_or_default<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    match params {
        Value::Null => decode(json!({})),
        other => decode(other),
    }
}

fn encode<T: Serialize>(value: &T) -> RouteResult {
    serde_json::to_value(value)
        .map_err(|e| RpcError::internal_error().with_data(json!(e.to_string())))
}
