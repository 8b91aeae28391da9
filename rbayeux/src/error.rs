use crate::channel::ChannelError;
use crate::types::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum BayeuxError {
    #[error("invalid channel, {0}")]
    Channel(#[from] ChannelError),
    #[error("session already registered, {0}")]
    DuplicateSession(SessionId),
    #[error("unknown session, {0}")]
    UnknownSession(SessionId),
    #[error("session removed, {0}")]
    SessionRemoved(SessionId),
    #[error("local listener of {0} panicked, {1}")]
    ListenerPanic(SessionId, String),
    #[error("outbound queue full, {0}")]
    QueueFull(SessionId),
    #[error("json error, {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl From<String> for BayeuxError {
    #[inline]
    fn from(e: String) -> Self {
        BayeuxError::Msg(e)
    }
}

impl From<&str> for BayeuxError {
    #[inline]
    fn from(e: &str) -> Self {
        BayeuxError::Msg(e.to_string())
    }
}
