use crate::queue::ActionKind;
use crate::types::MessageId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// The backend refused the request (validation or business rule).
    #[error("{0}")]
    RemoteRejected(String),

    /// Network or transient backend failure.
    #[error("Service unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("{action} already in progress for message {message}")]
    AlreadyInProgress {
        action: ActionKind,
        message: MessageId,
    },

    /// Work finished after the session was closed.
    #[error("Chat session has been closed")]
    TeardownRace,

    #[error("Sign in to send messages")]
    NotAuthenticated,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Message {0} is not in the feed")]
    UnknownMessage(MessageId),

    #[error("Only public chats can be shared as stories")]
    NotShareable,
}

impl ChatError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::RemoteRejected(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::RemoteUnavailable(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_))
    }

    /// Whether a failed user action should reach the notification channel.
    pub fn should_notify(&self) -> bool {
        !matches!(self, Self::AlreadyInProgress { .. } | Self::TeardownRace)
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::unavailable(format!("malformed response: {err}"))
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
