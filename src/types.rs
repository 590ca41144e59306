use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }
    };
}

opaque_id!(MessageId);
opaque_id!(ChatId);
opaque_id!(CharacterId);
opaque_id!(StoryId);
opaque_id!(
    /// Opaque boundary marker for "load older" requests.
    PageCursor
);

/// Local-only id tying an optimistic entry to the record that confirms it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reaction {
    Like,
    Dislike,
}

impl Reaction {
    pub fn as_str(self) -> &'static str {
        match self {
            Reaction::Like => "like",
            Reaction::Dislike => "dislike",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    /// `None` means the human user wrote it.
    pub character_id: Option<CharacterId>,
    /// Empty while the character is still generating; never a real empty message.
    pub text: String,
    pub translation: Option<String>,
    pub reaction: Option<Reaction>,
    pub speech_url: Option<String>,
    /// Creation order key in microseconds, monotonic within a chat.
    pub created_at_us: u64,
    /// Correlation echoed back by stores that support it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<CorrelationId>,
}

impl Message {
    pub fn is_from_character(&self) -> bool {
        self.character_id.is_some()
    }

    pub fn is_generating(&self) -> bool {
        self.text.is_empty()
    }

    /// Text handed to speech synthesis: the translation wins when there is one.
    pub fn speech_text(&self) -> &str {
        self.translation.as_deref().unwrap_or(&self.text)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub chat_id: ChatId,
    pub character_id: CharacterId,
    #[serde(default)]
    pub is_public: bool,
}

/// One page of history, oldest message first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    pub messages: Vec<Message>,
    pub next_cursor: Option<PageCursor>,
    pub has_more: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    /// A message was created or changed.
    Upsert(Message),
    /// A message disappeared (deleted or purged by maintenance).
    Removed(MessageId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SendRequest {
    pub chat_id: ChatId,
    pub character_id: CharacterId,
    pub text: String,
    pub client_token: CorrelationId,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SendReceipt {
    pub message_id: Option<MessageId>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuthState {
    pub is_authenticated: bool,
    pub is_loading: bool,
}

impl AuthState {
    pub fn signed_in() -> Self {
        Self {
            is_authenticated: true,
            is_loading: false,
        }
    }

    pub fn can_send(&self) -> bool {
        self.is_authenticated && !self.is_loading
    }
}
