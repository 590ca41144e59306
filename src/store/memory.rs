use super::MessageStore;
use crate::error::{ChatError, ChatResult};
use crate::types::{
    CharacterId, ChatId, Message, MessageId, Page, PageCursor, Reaction, SendReceipt, SendRequest,
    StoreEvent, StoryId,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

const CLOCK_START_US: u64 = 1_700_000_000_000_000;

/// Operation names used by [`InMemoryStore::fail_next`] and [`InMemoryStore::calls`].
pub mod ops {
    pub const LOAD: &str = "load";
    pub const SEND: &str = "send";
    pub const REACT: &str = "react";
    pub const REGENERATE: &str = "regenerate";
    pub const TRANSLATE: &str = "translate";
    pub const SPEECH: &str = "speech";
    pub const STORY: &str = "story";
    pub const REMOVE_CHAT: &str = "remove_chat";
    pub const AUTOPILOT: &str = "autopilot";
}

/// Append-only chat log kept in process memory.
///
/// Besides serving as a store it can script failures, hold mutations in
/// flight, and count calls, which is what the session tests lean on.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    paused: watch::Sender<bool>,
}

struct Inner {
    logs: HashMap<ChatId, Vec<Message>>,
    subscribers: HashMap<ChatId, Vec<mpsc::UnboundedSender<StoreEvent>>>,
    failures: HashMap<&'static str, VecDeque<ChatError>>,
    calls: HashMap<&'static str, usize>,
    stories: Vec<(StoryId, CharacterId, Vec<MessageId>)>,
    next_id: u64,
    clock_us: u64,
    echo_client_tokens: bool,
    receipt_ids: bool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                logs: HashMap::new(),
                subscribers: HashMap::new(),
                failures: HashMap::new(),
                calls: HashMap::new(),
                stories: Vec::new(),
                next_id: 1,
                clock_us: CLOCK_START_US,
                echo_client_tokens: true,
                receipt_ids: true,
            }),
            paused,
        }
    }

    /// Behave like a backend that drops the client token on the floor.
    pub fn without_client_tokens(self) -> Self {
        self.lock().echo_client_tokens = false;
        self
    }

    /// Behave like a backend whose send mutation returns nothing.
    pub fn without_receipt_ids(self) -> Self {
        self.lock().receipt_ids = false;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message authored by the user (`character_id == None`) or a character.
    pub fn push_message(
        &self,
        chat_id: &ChatId,
        character_id: Option<&CharacterId>,
        text: &str,
    ) -> Message {
        let mut inner = self.lock();
        let message = inner.append(chat_id, character_id.cloned(), text.to_string(), None);
        inner.broadcast(chat_id, StoreEvent::Upsert(message.clone()));
        message
    }

    pub fn push_reply(&self, chat_id: &ChatId, character_id: &CharacterId, text: &str) -> Message {
        self.push_message(chat_id, Some(character_id), text)
    }

    /// Replace the text of a message, e.g. to finish a generating reply.
    pub fn update_text(&self, message_id: &MessageId, text: &str) -> ChatResult<Message> {
        self.lock().modify(message_id, |message| message.text = text.to_string())
    }

    /// Drop a message the way the nightly purge would.
    pub fn purge(&self, message_id: &MessageId) -> bool {
        let mut inner = self.lock();
        let Some(chat_id) = inner.chat_of(message_id) else {
            return false;
        };
        if let Some(log) = inner.logs.get_mut(&chat_id) {
            log.retain(|message| &message.id != message_id);
        }
        inner.broadcast(&chat_id, StoreEvent::Removed(message_id.clone()));
        true
    }

    /// Make the next call of `operation` fail with `error`.
    pub fn fail_next(&self, operation: &'static str, error: ChatError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Hold every mutation after it is counted until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn messages(&self, chat_id: &ChatId) -> Vec<Message> {
        self.lock().logs.get(chat_id).cloned().unwrap_or_default()
    }

    pub fn message(&self, message_id: &MessageId) -> Option<Message> {
        self.lock()
            .logs
            .values()
            .flat_map(|log| log.iter())
            .find(|message| &message.id == message_id)
            .cloned()
    }

    pub fn stories(&self) -> Vec<(StoryId, CharacterId, Vec<MessageId>)> {
        self.lock().stories.clone()
    }

    pub fn subscriber_count(&self, chat_id: &ChatId) -> usize {
        let mut inner = self.lock();
        match inner.subscribers.get_mut(chat_id) {
            Some(senders) => {
                senders.retain(|sender| !sender.is_closed());
                senders.len()
            }
            None => 0,
        }
    }

    /// Count the call, wait out a pause, then pop any scripted failure.
    async fn enter(&self, operation: &'static str) -> ChatResult<()> {
        *self.lock().calls.entry(operation).or_default() += 1;

        let mut paused = self.paused.subscribe();
        loop {
            let held = *paused.borrow_and_update();
            if !held || paused.changed().await.is_err() {
                break;
            }
        }

        match self
            .lock()
            .failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Inner {
    fn append(
        &mut self,
        chat_id: &ChatId,
        character_id: Option<CharacterId>,
        text: String,
        client_token: Option<crate::types::CorrelationId>,
    ) -> Message {
        let id = MessageId(format!("m{}", self.next_id));
        self.next_id += 1;
        self.clock_us += 1;
        let message = Message {
            id,
            chat_id: chat_id.clone(),
            character_id,
            text,
            translation: None,
            reaction: None,
            speech_url: None,
            created_at_us: self.clock_us,
            client_token,
        };
        self.logs
            .entry(chat_id.clone())
            .or_default()
            .push(message.clone());
        message
    }

    fn chat_of(&self, message_id: &MessageId) -> Option<ChatId> {
        self.logs.iter().find_map(|(chat_id, log)| {
            log.iter()
                .any(|message| &message.id == message_id)
                .then(|| chat_id.clone())
        })
    }

    fn modify(
        &mut self,
        message_id: &MessageId,
        change: impl FnOnce(&mut Message),
    ) -> ChatResult<Message> {
        let (chat_id, message) = self
            .logs
            .iter_mut()
            .find_map(|(chat_id, log)| {
                log.iter_mut()
                    .find(|message| &message.id == message_id)
                    .map(|message| (chat_id.clone(), message))
            })
            .ok_or_else(|| ChatError::rejected(format!("Message {message_id} not found")))?;
        change(message);
        let updated = message.clone();
        self.broadcast(&chat_id, StoreEvent::Upsert(updated.clone()));
        Ok(updated)
    }

    fn broadcast(&mut self, chat_id: &ChatId, event: StoreEvent) {
        if let Some(senders) = self.subscribers.get_mut(chat_id) {
            senders.retain(|sender| sender.unbounded_send(event.clone()).is_ok());
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn load_older_page(
        &self,
        chat_id: &ChatId,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> ChatResult<Page> {
        self.enter(ops::LOAD).await?;
        let boundary = match cursor {
            Some(cursor) => Some(
                cursor
                    .as_str()
                    .parse::<u64>()
                    .map_err(|_| ChatError::rejected(format!("Invalid cursor {cursor}")))?,
            ),
            None => None,
        };

        let inner = self.lock();
        let older: Vec<&Message> = inner
            .logs
            .get(chat_id)
            .map(|log| {
                log.iter()
                    .filter(|message| boundary.is_none_or(|b| message.created_at_us < b))
                    .collect()
            })
            .unwrap_or_default();

        let start = older.len().saturating_sub(limit.max(1));
        let messages: Vec<Message> = older[start..].iter().map(|m| (*m).clone()).collect();
        let next_cursor = messages
            .first()
            .map(|oldest| PageCursor(oldest.created_at_us.to_string()));

        Ok(Page {
            messages,
            next_cursor,
            has_more: start > 0,
        })
    }

    fn subscribe_new(&self, chat_id: &ChatId) -> BoxStream<'static, StoreEvent> {
        let (sender, receiver) = mpsc::unbounded();
        self.lock()
            .subscribers
            .entry(chat_id.clone())
            .or_default()
            .push(sender);
        receiver.boxed()
    }

    async fn send_message(&self, request: SendRequest) -> ChatResult<SendReceipt> {
        self.enter(ops::SEND).await?;
        let mut inner = self.lock();
        let token = inner.echo_client_tokens.then_some(request.client_token);
        let message = inner.append(&request.chat_id, None, request.text, token);
        inner.broadcast(&request.chat_id, StoreEvent::Upsert(message.clone()));
        Ok(SendReceipt {
            message_id: inner.receipt_ids.then_some(message.id),
        })
    }

    async fn react(&self, message_id: &MessageId, reaction: Reaction) -> ChatResult<()> {
        self.enter(ops::REACT).await?;
        self.lock()
            .modify(message_id, |message| message.reaction = Some(reaction))?;
        Ok(())
    }

    async fn regenerate(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        _character_id: &CharacterId,
    ) -> ChatResult<()> {
        self.enter(ops::REGENERATE).await?;
        let mut inner = self.lock();
        if inner.chat_of(message_id).as_ref() != Some(chat_id) {
            return Err(ChatError::rejected(format!(
                "Message {message_id} does not belong to chat {chat_id}"
            )));
        }
        inner.modify(message_id, |message| {
            message.text.clear();
            message.translation = None;
            message.speech_url = None;
        })?;
        Ok(())
    }

    async fn translate(&self, message_id: &MessageId, target_language: &str) -> ChatResult<()> {
        self.enter(ops::TRANSLATE).await?;
        let mut inner = self.lock();
        let language = target_language.to_string();
        let already = inner
            .logs
            .values()
            .flat_map(|log| log.iter())
            .find(|message| &message.id == message_id)
            .is_some_and(|message| message.translation.is_some());
        if already {
            return Err(ChatError::rejected("Message is already translated"));
        }
        inner.modify(message_id, |message| {
            message.translation = Some(format!("({language}) {}", message.text));
        })?;
        Ok(())
    }

    async fn request_speech(
        &self,
        message_id: &MessageId,
        _character_id: &CharacterId,
        _text: &str,
    ) -> ChatResult<Option<String>> {
        self.enter(ops::SPEECH).await?;
        let url = format!("memory://speech/{message_id}.mp3");
        let stored = url.clone();
        self.lock()
            .modify(message_id, |message| message.speech_url = Some(stored))?;
        Ok(Some(url))
    }

    async fn create_story(
        &self,
        character_id: &CharacterId,
        message_ids: &[MessageId],
    ) -> ChatResult<StoryId> {
        self.enter(ops::STORY).await?;
        let mut inner = self.lock();
        let story_id = StoryId(format!("story-{}", inner.stories.len() + 1));
        inner
            .stories
            .push((story_id.clone(), character_id.clone(), message_ids.to_vec()));
        Ok(story_id)
    }

    async fn remove_chat(&self, chat_id: &ChatId) -> ChatResult<()> {
        self.enter(ops::REMOVE_CHAT).await?;
        let mut inner = self.lock();
        let removed = inner.logs.remove(chat_id).unwrap_or_default();
        for message in removed {
            inner.broadcast(chat_id, StoreEvent::Removed(message.id));
        }
        Ok(())
    }

    async fn autopilot(&self, chat_id: &ChatId, character_id: &CharacterId) -> ChatResult<()> {
        self.enter(ops::AUTOPILOT).await?;
        let mut inner = self.lock();
        let message = inner.append(chat_id, Some(character_id.clone()), String::new(), None);
        inner.broadcast(chat_id, StoreEvent::Upsert(message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> ChatId {
        ChatId::from("chat-1")
    }

    #[tokio::test]
    async fn pages_walk_backwards_without_overlap() {
        let store = InMemoryStore::new();
        let character = CharacterId::from("c1");
        for i in 1..=7 {
            store.push_reply(&chat(), &character, &format!("msg {i}"));
        }

        let first = store.load_older_page(&chat(), None, 5).await.unwrap();
        let ids: Vec<_> = first.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m4", "m5", "m6", "m7"]);
        assert!(first.has_more);

        let second = store
            .load_older_page(&chat(), first.next_cursor.as_ref(), 5)
            .await
            .unwrap();
        let ids: Vec<_> = second.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert!(!second.has_more);
    }

    #[tokio::test]
    async fn send_echoes_token_and_notifies_subscribers() {
        let store = InMemoryStore::new();
        let mut events = store.subscribe_new(&chat());
        let receipt = store
            .send_message(SendRequest {
                chat_id: chat(),
                character_id: CharacterId::from("c1"),
                text: "hi".into(),
                client_token: crate::types::CorrelationId(9),
            })
            .await
            .unwrap();
        assert_eq!(receipt.message_id, Some(MessageId::from("m1")));

        match events.next().await {
            Some(StoreEvent::Upsert(message)) => {
                assert_eq!(message.text, "hi");
                assert_eq!(message.client_token, Some(crate::types::CorrelationId(9)));
                assert!(message.character_id.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn scripted_failure_is_consumed_once() {
        let store = InMemoryStore::new();
        let message = store.push_reply(&chat(), &CharacterId::from("c1"), "hello");
        store.fail_next(ops::REACT, ChatError::unavailable("offline"));

        let err = store.react(&message.id, Reaction::Like).await.unwrap_err();
        assert!(err.is_transient());
        store.react(&message.id, Reaction::Like).await.unwrap();
        assert_eq!(store.calls(ops::REACT), 2);
        assert_eq!(
            store.message(&message.id).unwrap().reaction,
            Some(Reaction::Like)
        );
    }

    #[tokio::test]
    async fn translating_twice_is_rejected() {
        let store = InMemoryStore::new();
        let message = store.push_reply(&chat(), &CharacterId::from("c1"), "bonjour");
        store.translate(&message.id, "English").await.unwrap();
        let err = store.translate(&message.id, "English").await.unwrap_err();
        assert_eq!(err, ChatError::rejected("Message is already translated"));
    }
}
