/// Commands sent from a dataview to the server, and the transport seam.
///
/// Every round trip is one `Request`: a typed command plus the outbound
/// diff in the tag grammar. The command enum is serde-tagged so hosts that
/// wrap requests in JSON envelopes can do so directly.
use crate::record::RecId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which edge of the window a chunk extends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkDirection {
    /// Restart the window at the first row
    Top,
    /// Rows before the first loaded row
    Prev,
    /// Rows after the last loaded row
    Next,
    /// Restart the window at the last row
    Bottom,
}

/// Commands sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    /// Extend the window by one chunk
    FetchChunk {
        task_id: String,
        direction: ChunkDirection,
        /// Edge row the chunk is relative to
        anchor_id: Option<RecId>,
        chunk_size: usize,
    },

    /// Recompute the dependents of one field on the server
    Recompute {
        task_id: String,
        field: usize,
        rec_id: RecId,
    },

    /// Push pending changes without any other request
    Flush { task_id: String },
}

impl Command {
    pub fn task_id(&self) -> &str {
        match self {
            Command::FetchChunk { task_id, .. }
            | Command::Recompute { task_id, .. }
            | Command::Flush { task_id } => task_id,
        }
    }
}

/// One outbound round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    /// Outbound diff in the tag grammar
    pub payload: String,
}

impl Request {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}

/// Server answer: tag grammar to be applied to the dataview
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub payload: String,
}

impl Response {
    pub fn new(payload: impl Into<String>) -> Self {
        Response {
            payload: payload.into(),
        }
    }
}

/// A failed round trip, timeouts included.
#[derive(Debug, Clone, Error)]
#[error("transport failure: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        TransportError {
            message: message.into(),
        }
    }
}

/// A blocking request/response channel to the server.
///
/// Control does not return to the dataview until the round trip completes,
/// so implementations must not call back into the dataview that issued the
/// request.
pub trait Transport {
    fn send_and_await(&mut self, request: Request) -> Result<Response, TransportError>;
}

/// Transport of a dataview that is not connected. Every request fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct Disconnected;

impl Transport for Disconnected {
    fn send_and_await(&mut self, request: Request) -> Result<Response, TransportError> {
        Err(TransportError::new(format!(
            "no transport for task {}",
            request.command.task_id()
        )))
    }
}
