//! Error types for the live view server.

use thiserror::Error;

/// Result type for live view operations.
pub type Result<T> = std::result::Result<T, LiveError>;

/// Errors that can occur while serving a live view.
#[derive(Debug, Error)]
pub enum LiveError {
    /// The connection could not be established.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The user mount callback failed; the connection is not established.
    #[error("mount failed: {0}")]
    Mount(#[source] anyhow::Error),

    /// Rendering the view failed.
    #[error("render failed: {0}")]
    Render(#[source] anyhow::Error),

    /// The session cookie could not be produced.
    #[error("session error: {0}")]
    Session(String),

    /// An inbound frame could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// The transport failed mid-session.
    #[error("transport error: {0}")]
    Transport(String),

    /// The client could not keep up with its queues.
    #[error("slow client")]
    SlowClient,
}
