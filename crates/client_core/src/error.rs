use thiserror::Error;

/// Errors surfaced through the session facade. Nothing here is fatal to the
/// process; transport failures are additionally recovered by the reconnect
/// policy.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no credentials available; supply a token and user identity before connecting")]
    MissingCredentials,
    #[error("invalid server url: {0}")]
    InvalidServerUrl(String),
    #[error("not connected to the chat server")]
    NotConnected,
    #[error("websocket transport failed: {0}")]
    Transport(String),
}
