use thiserror::Error;

/// Errors surfaced by an RPC call.
///
/// `Transport` and `Closed` drive the client's reconnect loop (see
/// `client::Client::call`); `Protocol` and `Serde` are returned immediately
/// and never retried.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RpcError {
    pub(crate) fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}
