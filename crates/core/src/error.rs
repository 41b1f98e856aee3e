//! Error types for the chat transport, realtime merge layer, and backend API.
//!
//! Each concern gets its own `thiserror` enum so callers can match on the
//! failure class. Protocol-level problems (malformed frames) never appear
//! here: the decoder drops them with a log line and the stream continues.

/// Errors produced by the chat stream transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A turn is already in flight for this chat; at most one is allowed.
    #[error("a turn is already in flight for this chat")]
    TurnInFlight,
    /// `send` was called with a turn whose role is not `user`.
    #[error("the trailing message of a send must have the user role")]
    NotUserTurn,
    /// `send` was called with a user turn that carries no text.
    #[error("the user turn contains no text parts")]
    EmptyTurn,
    /// The backend answered with a non-success status. The body is surfaced
    /// verbatim as the user-visible message.
    #[error("chat backend returned status {status}: {body}")]
    Http { status: u16, body: String },
    /// The request or stream read failed at the network level.
    #[error("network error: {0}")]
    Network(String),
    /// Resuming a dropped stream is deliberately unsupported; the caller
    /// must retry the full turn.
    #[error("reconnecting to a dropped stream is not supported")]
    ReconnectUnsupported,
}

/// Errors produced by the realtime merge layer.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// The initial fetch for a slice failed; no subscription is attempted.
    #[error("initial fetch failed: {0}")]
    Fetch(#[source] ApiError),
    /// A push subscription could not be established. Non-fatal: the slice
    /// simply never updates.
    #[error("push subscription failed: {0}")]
    Subscribe(String),
}

/// Errors produced by the backend REST collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("backend returned status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("could not decode response: {0}")]
    Decode(String),
}
