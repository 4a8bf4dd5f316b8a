//! Crate-wide error type.
//!
//! Gateway problems never cross the HTTP boundary directly: they surface
//! either as task failures or as an account being unavailable at selection
//! time. The binary entry point wraps everything in `anyhow` for context.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Transient gateway trouble: unexpected close, timeout, bad frame.
    #[error("gateway: {0}")]
    Gateway(String),

    /// The gateway session can no longer be resumed.
    #[error("session invalid: {0}")]
    SessionInvalid(String),

    /// The account was disabled (reconnect budget, verification lock).
    #[error("account {id} disabled: {reason}")]
    AccountDisabled { id: String, reason: String },

    /// Rejected at submission time.
    #[error("validation: {0}")]
    Validation(String),

    /// A task reached a failure state.
    #[error("task failed: {0}")]
    TaskFailure(String),

    #[error("store: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("transport: {0}")]
    Transport(String),

    #[error("config: {0}")]
    Config(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}
