//! Chat session
//!
//! Glues the store, the optimistic queue, the feed and playback together for
//! one open chat. All state sits behind a single mutex that is never held
//! across an `.await`; every state change publishes exactly one
//! [`FeedSnapshot`] on the event channel.

use crate::config::SessionConfig;
use crate::error::{ChatError, ChatResult};
use crate::feed::{FeedAssembler, FeedSnapshot};
use crate::format;
use crate::playback::{PlaybackCommand, PlaybackCoordinator, Toggle};
use crate::queue::{OptimisticQueue, PendingAction};
use crate::store::MessageStore;
use crate::thinking::ThinkingIndicator;
use crate::types::{
    AuthState, ChatInfo, CorrelationId, MessageId, Reaction, SendRequest, StoreEvent, StoryId,
};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const UNEXPECTED_ERROR: &str = "Unexpected error occurred";
const STORY_CREATED: &str = "Story has been created.";
const CHAT_DELETED: &str = "Chat has been deleted.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A toast for the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            text: text.into(),
        }
    }

    pub fn from_error(err: &ChatError) -> Self {
        let level = if err.is_transient() {
            NoticeLevel::Warning
        } else {
            NoticeLevel::Error
        };
        let text = match err {
            ChatError::RemoteRejected(message) if message.trim().is_empty() => {
                UNEXPECTED_ERROR.to_string()
            }
            other => other.to_string(),
        };
        Self { level, text }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Feed(Arc<FeedSnapshot>),
    Notice(Notice),
    ScrollToBottom,
    Playback(PlaybackCommand),
    /// Current label of the thinking indicator.
    Thinking(String),
    Closed,
}

// ============================================
// Shared state
// ============================================

struct SessionState {
    feed: FeedAssembler,
    queue: OptimisticQueue,
    playback: PlaybackCoordinator,
    auth: AuthState,
    thinking: ThinkingIndicator,
    latest: Arc<FeedSnapshot>,
    closed: bool,
    subscription: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

struct Inner {
    store: Arc<dyn MessageStore>,
    info: ChatInfo,
    config: SessionConfig,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine; snapshots stay available through `snapshot()`.
        let _ = self.events.send(event);
    }

    fn emit_playback(&self, commands: Vec<PlaybackCommand>) {
        for command in commands {
            debug!(?command, "playback command");
            self.emit(SessionEvent::Playback(command));
        }
    }

    /// Render the current state and push it to listeners.
    fn publish(self: &Arc<Self>, state: &mut SessionState) {
        let (snapshot, scroll_to_bottom) = state.feed.snapshot(&state.queue, &state.playback);
        let snapshot = Arc::new(snapshot);
        state.latest = Arc::clone(&snapshot);
        let thinking = snapshot.is_thinking();
        self.emit(SessionEvent::Feed(snapshot));
        if scroll_to_bottom {
            self.emit(SessionEvent::ScrollToBottom);
        }

        if thinking && state.ticker.is_none() {
            state.thinking.reset();
            let ticker = tokio::spawn(run_ticker(Arc::downgrade(self), self.config.thinking_tick));
            state.ticker = Some(ticker);
        } else if !thinking && let Some(ticker) = state.ticker.take() {
            ticker.abort();
            state.thinking.reset();
        }
    }

    fn apply_store_event(self: &Arc<Self>, event: StoreEvent) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closed {
            return;
        }

        let mut commands = Vec::new();
        match &event {
            StoreEvent::Upsert(message) => commands.extend(state.playback.asset_arrived(message)),
            StoreEvent::Removed(message_id) => {
                commands.extend(state.playback.message_removed(message_id))
            }
        }
        let changed = state.feed.apply_event(event);
        if !changed && commands.is_empty() {
            return;
        }

        // Confirmation and the authoritative row land in the same snapshot.
        state.queue.reconcile(state.feed.remote());
        self.publish(state);
        self.emit_playback(commands);
    }

    /// Queue an action against a loaded message and show it right away.
    fn begin(
        self: &Arc<Self>,
        message_id: &MessageId,
        action: impl FnOnce(MessageId) -> PendingAction,
    ) -> ChatResult<CorrelationId> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(ChatError::TeardownRace);
        }
        if !state.feed.remote().contains(message_id) {
            return Err(ChatError::UnknownMessage(message_id.clone()));
        }
        let correlation = state
            .queue
            .submit(action(message_id.clone()), state.feed.remote())?;
        self.publish(state);
        Ok(correlation)
    }

    /// Resolve a queued action with the store's answer.
    fn settle(
        self: &Arc<Self>,
        correlation: CorrelationId,
        outcome: ChatResult<Option<MessageId>>,
    ) -> ChatResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(ChatError::TeardownRace);
        }
        match outcome {
            Ok(remote_id) => {
                state.queue.acknowledge(correlation, remote_id, None);
                state.queue.reconcile(state.feed.remote());
                self.publish(state);
                Ok(())
            }
            Err(err) => {
                warn!(%correlation, error = %err, "mutation failed");
                state.queue.reject(correlation);
                self.publish(state);
                Err(err)
            }
        }
    }

    fn ensure_open(&self) -> ChatResult<()> {
        if self.lock().closed {
            Err(ChatError::TeardownRace)
        } else {
            Ok(())
        }
    }

    fn notify(&self, notice: Notice) {
        if !self.lock().closed {
            self.emit(SessionEvent::Notice(notice));
        }
    }

    /// Surface a failed user action, then hand the result back.
    fn report<T>(&self, result: ChatResult<T>) -> ChatResult<T> {
        if let Err(err) = &result
            && err.should_notify()
        {
            self.notify(Notice::from_error(err));
        }
        result
    }
}

async fn run_subscription(inner: Weak<Inner>, mut events: BoxStream<'static, StoreEvent>) {
    while let Some(event) = events.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply_store_event(event);
    }
    debug!("subscription stream finished");
}

async fn run_ticker(inner: Weak<Inner>, tick: Duration) {
    let started = Instant::now();
    let mut interval = tokio::time::interval(tick);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut state = inner.lock();
        if state.closed || !state.latest.is_thinking() {
            state.thinking.reset();
            state.ticker = None;
            break;
        }
        let label = state.thinking.tick(started.elapsed());
        inner.emit(SessionEvent::Thinking(label));
    }
}

// ============================================
// Public handle
// ============================================

/// Handle to one open chat. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<Inner>,
}

impl ChatSession {
    /// Load the newest page and start following the chat.
    pub async fn open(
        store: Arc<dyn MessageStore>,
        info: ChatInfo,
        config: SessionConfig,
    ) -> ChatResult<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = Arc::new(Inner {
            store,
            state: Mutex::new(SessionState {
                feed: FeedAssembler::new(),
                queue: OptimisticQueue::new(),
                playback: PlaybackCoordinator::new(),
                auth: AuthState::default(),
                thinking: ThinkingIndicator::new(config.warmup_after),
                latest: Arc::new(FeedSnapshot::default()),
                closed: false,
                subscription: None,
                ticker: None,
            }),
            info,
            config,
            events,
        });

        // Subscribe before loading so nothing written in between is missed.
        let stream = inner.store.subscribe_new(&inner.info.chat_id);
        let page = inner
            .store
            .load_older_page(&inner.info.chat_id, None, inner.config.initial_num_items)
            .await?;

        {
            let mut guard = inner.lock();
            let state = &mut *guard;
            let loaded = state.feed.apply_page(page);
            inner.publish(state);
            info!(chat_id = %inner.info.chat_id, loaded, "chat session opened");
            state.subscription = Some(tokio::spawn(run_subscription(
                Arc::downgrade(&inner),
                stream,
            )));
        }

        Ok(Self { inner })
    }

    pub fn info(&self) -> &ChatInfo {
        &self.inner.info
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Arc<FeedSnapshot> {
        Arc::clone(&self.inner.lock().latest)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn set_auth(&self, auth: AuthState) {
        self.inner.lock().auth = auth;
    }

    pub fn can_send(&self) -> bool {
        let state = self.inner.lock();
        !state.closed && state.auth.can_send()
    }

    pub async fn send(&self, text: &str) -> ChatResult<()> {
        let result = self.try_send(text).await;
        self.inner.report(result)
    }

    async fn try_send(&self, text: &str) -> ChatResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let correlation = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if state.closed {
                return Err(ChatError::TeardownRace);
            }
            if !state.auth.can_send() {
                return Err(ChatError::NotAuthenticated);
            }
            state.feed.anchor_to_bottom();
            let correlation = state.queue.submit(
                PendingAction::Send {
                    chat_id: self.inner.info.chat_id.clone(),
                    text: text.to_string(),
                },
                state.feed.remote(),
            )?;
            self.inner.publish(state);
            correlation
        };

        let outcome = self
            .inner
            .store
            .send_message(SendRequest {
                chat_id: self.inner.info.chat_id.clone(),
                character_id: self.inner.info.character_id.clone(),
                text: text.to_string(),
                client_token: correlation,
            })
            .await
            .map(|receipt| receipt.message_id);
        self.inner.settle(correlation, outcome)
    }

    /// Set a reaction; choosing the current one again does nothing.
    pub async fn react(&self, message_id: &MessageId, reaction: Reaction) -> ChatResult<()> {
        let result = self.try_react(message_id, reaction).await;
        self.inner.report(result)
    }

    async fn try_react(&self, message_id: &MessageId, reaction: Reaction) -> ChatResult<()> {
        let current = {
            let state = self.inner.lock();
            if state.closed {
                return Err(ChatError::TeardownRace);
            }
            state
                .feed
                .remote()
                .get(message_id)
                .map(|message| message.reaction)
                .ok_or_else(|| ChatError::UnknownMessage(message_id.clone()))?
        };
        if current == Some(reaction) {
            return Ok(());
        }

        let correlation = self.inner.begin(message_id, |message_id| {
            PendingAction::Reaction {
                message_id,
                reaction,
            }
        })?;
        let outcome = self
            .inner
            .store
            .react(message_id, reaction)
            .await
            .map(|()| None);
        self.inner.settle(correlation, outcome)
    }

    /// A dislike asks for a better answer straight away.
    pub async fn dislike(&self, message_id: &MessageId) -> ChatResult<()> {
        self.react(message_id, Reaction::Dislike).await?;
        self.regenerate(message_id).await
    }

    pub async fn regenerate(&self, message_id: &MessageId) -> ChatResult<()> {
        let result = self.try_regenerate(message_id).await;
        self.inner.report(result)
    }

    async fn try_regenerate(&self, message_id: &MessageId) -> ChatResult<()> {
        let correlation = self
            .inner
            .begin(message_id, |message_id| PendingAction::Regenerate { message_id })?;
        let info = &self.inner.info;
        let outcome = self
            .inner
            .store
            .regenerate(&info.chat_id, message_id, &info.character_id)
            .await
            .map(|()| None);
        self.inner.settle(correlation, outcome)
    }

    pub async fn translate(&self, message_id: &MessageId) -> ChatResult<()> {
        let language = self.inner.config.target_language.clone();
        self.translate_to(message_id, &language).await
    }

    pub async fn translate_to(&self, message_id: &MessageId, language: &str) -> ChatResult<()> {
        let result = self.try_translate(message_id, language).await;
        self.inner.report(result)
    }

    async fn try_translate(&self, message_id: &MessageId, language: &str) -> ChatResult<()> {
        let correlation = self
            .inner
            .begin(message_id, |message_id| PendingAction::Translate { message_id })?;
        let outcome = self
            .inner
            .store
            .translate(message_id, language)
            .await
            .map(|()| None);
        self.inner.settle(correlation, outcome)
    }

    /// Play or stop a message's audio, synthesizing it first when needed.
    pub async fn toggle_speech(&self, message_id: &MessageId) -> ChatResult<()> {
        let result = self.try_toggle_speech(message_id).await;
        self.inner.report(result)
    }

    async fn try_toggle_speech(&self, message_id: &MessageId) -> ChatResult<()> {
        let (correlation, text) = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if state.closed {
                return Err(ChatError::TeardownRace);
            }
            let message = state
                .feed
                .remote()
                .get(message_id)
                .cloned()
                .ok_or_else(|| ChatError::UnknownMessage(message_id.clone()))?;

            match state.playback.toggle(&message) {
                Toggle::Stopped(commands) | Toggle::Started(commands) => {
                    self.inner.publish(state);
                    self.inner.emit_playback(commands);
                    return Ok(());
                }
                Toggle::Synthesize => {}
            }

            let action = PendingAction::Speech {
                message_id: message_id.clone(),
            };
            match state.queue.submit(action, state.feed.remote()) {
                Ok(correlation) => {
                    self.inner.publish(state);
                    (correlation, message.speech_text().to_string())
                }
                // The running synthesis will start playback when it lands.
                Err(ChatError::AlreadyInProgress { .. }) => return Ok(()),
                Err(err) => {
                    state.playback.synthesis_failed(message_id);
                    return Err(err);
                }
            }
        };

        let outcome = self
            .inner
            .store
            .request_speech(message_id, &self.inner.info.character_id, &text)
            .await;

        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(ChatError::TeardownRace);
        }
        match outcome {
            Ok(url) => {
                let commands = url
                    .as_deref()
                    .map(|url| state.playback.synthesis_succeeded(message_id, url))
                    .unwrap_or_default();
                state.queue.acknowledge(correlation, None, url);
                state.queue.reconcile(state.feed.remote());
                self.inner.publish(state);
                self.inner.emit_playback(commands);
                Ok(())
            }
            Err(err) => {
                warn!(%message_id, error = %err, "speech synthesis failed");
                state.queue.reject(correlation);
                state.playback.synthesis_failed(message_id);
                self.inner.publish(state);
                Err(err)
            }
        }
    }

    /// The audio element reported the end of playback.
    pub fn playback_ended(&self, message_id: &MessageId) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if !state.closed && state.playback.playback_ended(message_id) {
            self.inner.publish(state);
        }
    }

    /// Fetch the next older page, unless one is in flight or none is left.
    pub async fn load_older(&self) -> ChatResult<()> {
        let result = self.try_load_older().await;
        self.inner.report(result)
    }

    async fn try_load_older(&self) -> ChatResult<()> {
        let cursor = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if state.closed {
                return Err(ChatError::TeardownRace);
            }
            match state.feed.begin_load_older() {
                Some(cursor) => {
                    self.inner.publish(state);
                    cursor
                }
                None => return Ok(()),
            }
        };

        let page = self
            .inner
            .store
            .load_older_page(
                &self.inner.info.chat_id,
                cursor.as_ref(),
                self.inner.config.page_size,
            )
            .await;

        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(ChatError::TeardownRace);
        }
        match page {
            Ok(page) => {
                let inserted = state.feed.apply_page(page);
                debug!(inserted, "loaded older messages");
                state.queue.reconcile(state.feed.remote());
                self.inner.publish(state);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "loading older messages failed");
                state.feed.abort_load_older();
                self.inner.publish(state);
                Err(err)
            }
        }
    }

    pub fn on_manual_scroll(&self) {
        self.inner.lock().feed.on_manual_scroll();
    }

    /// Report whether the oldest rendered message is in the viewport.
    pub async fn on_oldest_visibility(&self, visible: bool) -> ChatResult<()> {
        let should_load = {
            let mut state = self.inner.lock();
            !state.closed && state.feed.on_oldest_visibility(visible)
        };
        if should_load {
            self.load_older().await
        } else {
            Ok(())
        }
    }

    /// Share the loaded conversation, minus the greeting, as a story.
    pub async fn create_story(&self) -> ChatResult<StoryId> {
        let result = self.try_create_story().await;
        self.inner.report(result)
    }

    async fn try_create_story(&self) -> ChatResult<StoryId> {
        if !self.inner.info.is_public {
            return Err(ChatError::NotShareable);
        }
        let message_ids = {
            let state = self.inner.lock();
            if state.closed {
                return Err(ChatError::TeardownRace);
            }
            format::story_message_ids(state.feed.remote().messages())
        };

        let story_id = self
            .inner
            .store
            .create_story(&self.inner.info.character_id, &message_ids)
            .await?;
        self.inner.ensure_open()?;
        info!(%story_id, shared = message_ids.len(), "story created");
        self.inner.notify(Notice::info(STORY_CREATED));
        Ok(story_id)
    }

    /// Delete the chat on the backend and close this session.
    pub async fn delete_chat(&self) -> ChatResult<()> {
        let result = self.try_delete_chat().await;
        self.inner.report(result)
    }

    async fn try_delete_chat(&self) -> ChatResult<()> {
        self.inner.ensure_open()?;
        self.inner.store.remove_chat(&self.inner.info.chat_id).await?;
        self.inner.ensure_open()?;
        self.inner.notify(Notice::info(CHAT_DELETED));
        self.close();
        Ok(())
    }

    /// Let the character continue the conversation on its own.
    pub async fn autopilot(&self) -> ChatResult<()> {
        let result = self.try_autopilot().await;
        self.inner.report(result)
    }

    async fn try_autopilot(&self) -> ChatResult<()> {
        self.inner.ensure_open()?;
        let info = &self.inner.info;
        self.inner
            .store
            .autopilot(&info.chat_id, &info.character_id)
            .await
    }

    /// Stop following the chat. Anything that completes afterwards is dropped.
    pub fn close(&self) {
        let (subscription, ticker, commands, discarded) = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let discarded = state.queue.discard_all();
            let commands = state.playback.stop_all();
            (
                state.subscription.take(),
                state.ticker.take(),
                commands,
                discarded,
            )
        };

        for handle in [subscription, ticker].into_iter().flatten() {
            handle.abort();
        }
        self.inner.emit_playback(commands);
        self.inner.emit(SessionEvent::Closed);
        info!(chat_id = %self.inner.info.chat_id, discarded, "chat session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_without_message_falls_back() {
        let notice = Notice::from_error(&ChatError::rejected(""));
        assert_eq!(notice.level, NoticeLevel::Error);
        assert_eq!(notice.text, UNEXPECTED_ERROR);
    }

    #[test]
    fn transient_failures_are_warnings() {
        let notice = Notice::from_error(&ChatError::unavailable("connection reset"));
        assert_eq!(notice.level, NoticeLevel::Warning);
        assert_eq!(notice.text, "Service unavailable: connection reset");
    }

    #[test]
    fn rejection_keeps_server_wording() {
        let notice = Notice::from_error(&ChatError::rejected("Not enough crystals."));
        assert_eq!(notice.text, "Not enough crystals.");
    }
}
