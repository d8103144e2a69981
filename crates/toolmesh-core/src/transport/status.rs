//! Connection state machine shared by the clients

use crate::error::{MeshError, MeshResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Connection state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct State {
    status: ClientStatus,
    last_error: Option<String>,
}

/// Guarded status plus the retained failure cause
///
/// Allowed moves: disconnected -> connecting -> {connected, error},
/// connected -> disconnected, and anything -> disconnected on close.
#[derive(Debug)]
pub(crate) struct StatusCell {
    state: Mutex<State>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                status: ClientStatus::Disconnected,
                last_error: None,
            }),
        }
    }

    pub fn get(&self) -> ClientStatus {
        self.state.lock().status
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn begin_connect(&self) -> MeshResult<()> {
        let mut state = self.state.lock();
        match state.status {
            ClientStatus::Disconnected => {
                state.status = ClientStatus::Connecting;
                Ok(())
            }
            ClientStatus::Connecting | ClientStatus::Connected => {
                Err(MeshError::AlreadyInitialized)
            }
            ClientStatus::Error => Err(MeshError::connection(format!(
                "client failed earlier: {}",
                state.last_error.as_deref().unwrap_or("unknown error")
            ))),
        }
    }

    /// Finish a connect attempt with its outcome
    ///
    /// A close that raced the attempt wins: the outcome becomes a
    /// transport-closed error.
    pub fn settle<T>(&self, outcome: MeshResult<T>) -> MeshResult<T> {
        let mut state = self.state.lock();
        if state.status != ClientStatus::Connecting {
            return match outcome {
                Ok(_) => Err(MeshError::transport_closed("client closed during connect")),
                Err(e) => Err(e),
            };
        }
        match outcome {
            Ok(value) => {
                state.status = ClientStatus::Connected;
                state.last_error = None;
                Ok(value)
            }
            Err(e) => {
                state.status = ClientStatus::Error;
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Connected link went away
    pub fn lost(&self, cause: impl Into<String>) -> bool {
        let mut state = self.state.lock();
        if state.status != ClientStatus::Connected {
            return false;
        }
        let cause = cause.into();
        debug!("Connection lost: {}", cause);
        state.status = ClientStatus::Disconnected;
        state.last_error = Some(cause);
        true
    }

    pub fn closed(&self) {
        self.state.lock().status = ClientStatus::Disconnected;
    }

    /// Fail fast unless the handshake completed
    pub fn ensure_connected(&self) -> MeshResult<()> {
        let state = self.state.lock();
        match state.status {
            ClientStatus::Connected => Ok(()),
            other => Err(MeshError::connection(format!(
                "client is {}{}",
                other,
                state
                    .last_error
                    .as_deref()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            ))),
        }
    }
}
