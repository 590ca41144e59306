//! Message store adapters
//!
//! The session core only talks to the backend through [`MessageStore`]. Two
//! implementations ship with the crate:
//!
//! - `memory` - in-process append-only log, used by tests and offline demos
//! - `http` - Convex-style deployment reached over `/api/query` and `/api/mutation`
//!
//! Adapters never retry; failures come back verbatim as
//! `ChatError::RemoteRejected` or `ChatError::RemoteUnavailable`.
mod http;
mod memory;

pub use http::HttpStore;
pub use memory::{InMemoryStore, ops};

use crate::error::ChatResult;
use crate::types::{
    CharacterId, ChatId, MessageId, Page, PageCursor, Reaction, SendReceipt, SendRequest,
    StoreEvent, StoryId,
};
use async_trait::async_trait;
use futures::stream::BoxStream;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages older than `cursor` (newest page when `None`), oldest first.
    async fn load_older_page(
        &self,
        chat_id: &ChatId,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> ChatResult<Page>;

    /// New and changed messages in arrival order. Dropping the stream releases it.
    fn subscribe_new(&self, chat_id: &ChatId) -> BoxStream<'static, StoreEvent>;

    async fn send_message(&self, request: SendRequest) -> ChatResult<SendReceipt>;

    async fn react(&self, message_id: &MessageId, reaction: Reaction) -> ChatResult<()>;

    async fn regenerate(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        character_id: &CharacterId,
    ) -> ChatResult<()>;

    async fn translate(&self, message_id: &MessageId, target_language: &str) -> ChatResult<()>;

    /// Returns the audio asset when the backend hands it back directly.
    async fn request_speech(
        &self,
        message_id: &MessageId,
        character_id: &CharacterId,
        text: &str,
    ) -> ChatResult<Option<String>>;

    async fn create_story(
        &self,
        character_id: &CharacterId,
        message_ids: &[MessageId],
    ) -> ChatResult<StoryId>;

    async fn remove_chat(&self, chat_id: &ChatId) -> ChatResult<()>;

    /// Ask the character to continue the conversation on its own.
    async fn autopilot(&self, chat_id: &ChatId, character_id: &CharacterId) -> ChatResult<()>;
}
