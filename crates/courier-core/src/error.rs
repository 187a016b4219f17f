use thiserror::Error;
use tracing::error;

/// Caller-visible failures. Create races, offline recipients and email
/// failures are absorbed inside the service and never show up here.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid participant: {0}")]
    InvalidParticipant(String),

    #[error("invalid conversation: {0}")]
    InvalidConversation(String),

    /// The message was kept as `failed`; the client may resend it as a new one.
    #[error("message failed to send: {0}")]
    InvalidMessage(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("action not permitted")]
    Forbidden,

    #[error("invalid or expired credential")]
    Unauthorized,

    #[error("storage unavailable, retry")]
    Storage,

    #[error("operation timed out, retry")]
    Timeout,
}

impl ChatError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage | Self::Timeout)
    }

    /// Stable identifier sent to real-time clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParticipant(_) => "invalid_participant",
            Self::InvalidConversation(_) => "invalid_conversation",
            Self::InvalidMessage(_) => "message_failed",
            Self::NotFound(_) => "not_found",
            Self::Forbidden => "forbidden",
            Self::Unauthorized => "unauthorized",
            Self::Storage => "storage_unavailable",
            Self::Timeout => "timeout",
        }
    }
}

/// Storage details are logged here and never reach the caller.
impl From<anyhow::Error> for ChatError {
    fn from(err: anyhow::Error) -> Self {
        error!("Storage failure: {:#}", err);
        Self::Storage
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(err: tokio::task::JoinError) -> Self {
        error!("Blocking storage task failed: {}", err);
        Self::Storage
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
