//! Feed assembly
//!
//! The feed is the ordered union of every loaded remote page and the
//! optimistic entries that have not been confirmed yet. Only this module
//! mutates the remote rows; everything else reads snapshots.

use crate::playback::PlaybackCoordinator;
use crate::queue::{OptimisticQueue, PendingAction};
use crate::types::{CorrelationId, Message, MessageId, Page, PageCursor, Reaction, StoreEvent};
use std::collections::HashMap;
use tracing::debug;

/// Remote messages kept sorted by `(created_at_us, id)` with an id index.
#[derive(Debug, Default, Clone)]
pub struct RemoteLog {
    messages: Vec<Message>,
    revisions: HashMap<MessageId, u64>,
    tokens: HashMap<CorrelationId, MessageId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upserted {
    Inserted,
    Updated,
    Unchanged,
}

impl RemoteLog {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        if !self.revisions.contains_key(id) {
            return None;
        }
        self.messages.iter().rev().find(|m| &m.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.revisions.contains_key(id)
    }

    /// Bumped every time a row is replaced with different content.
    pub fn revision(&self, id: &MessageId) -> u64 {
        self.revisions.get(id).copied().unwrap_or(0)
    }

    pub fn find_by_token(&self, token: CorrelationId) -> Option<&Message> {
        self.tokens.get(&token).and_then(|id| self.get(id))
    }

    pub fn oldest_created_at(&self) -> Option<u64> {
        self.messages.first().map(|m| m.created_at_us)
    }

    pub fn newest_created_at(&self) -> u64 {
        self.messages.last().map(|m| m.created_at_us).unwrap_or(0)
    }

    /// Merge an older page. Rows already present are skipped, never reordered.
    pub fn merge_page(&mut self, page: Vec<Message>) -> usize {
        let mut inserted = 0;
        for message in page {
            if self.contains(&message.id) {
                continue;
            }
            self.insert_sorted(message);
            inserted += 1;
        }
        inserted
    }

    pub fn upsert(&mut self, message: Message) -> Upserted {
        if !self.contains(&message.id) {
            self.insert_sorted(message);
            return Upserted::Inserted;
        }

        let Some(slot) = self.messages.iter_mut().find(|m| m.id == message.id) else {
            return Upserted::Unchanged;
        };
        if *slot == message {
            return Upserted::Unchanged;
        }
        // Stores that don't echo tokens must not erase one we already matched.
        let token = message.client_token.or(slot.client_token);
        let reordered = slot.created_at_us != message.created_at_us;
        *slot = Message {
            client_token: token,
            ..message
        };
        if let Some(token) = token {
            self.tokens.insert(token, slot.id.clone());
        }
        *self.revisions.entry(slot.id.clone()).or_insert(0) += 1;
        if reordered {
            self.messages.sort_by(order);
        }
        Upserted::Updated
    }

    pub fn remove(&mut self, id: &MessageId) -> bool {
        if self.revisions.remove(id).is_none() {
            return false;
        }
        self.messages.retain(|m| &m.id != id);
        self.tokens.retain(|_, mapped| mapped != id);
        true
    }

    fn insert_sorted(&mut self, message: Message) {
        let at = self
            .messages
            .partition_point(|existing| order(existing, &message).is_lt());
        self.revisions.insert(message.id.clone(), 1);
        if let Some(token) = message.client_token {
            self.tokens.insert(token, message.id.clone());
        }
        self.messages.insert(at, message);
    }
}

fn order(a: &Message, b: &Message) -> std::cmp::Ordering {
    a.created_at_us
        .cmp(&b.created_at_us)
        .then_with(|| a.id.cmp(&b.id))
}

/// One row handed to the rendering layer.
#[derive(Clone, Debug, PartialEq)]
pub struct FeedItem {
    pub message: Message,
    /// Set while the row is an unconfirmed send.
    pub provisional: Option<CorrelationId>,
    pub regenerating: bool,
    pub translating: bool,
    pub synthesizing: bool,
    pub reacting: bool,
    pub speaking: bool,
}

impl FeedItem {
    fn remote(message: Message) -> Self {
        Self {
            message,
            provisional: None,
            regenerating: false,
            translating: false,
            synthesizing: false,
            reacting: false,
            speaking: false,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.provisional.is_some()
    }

    pub fn is_generating(&self) -> bool {
        self.message.is_generating()
    }

    /// The action bar only exists for finished character replies.
    pub fn has_actions(&self) -> bool {
        self.message.is_from_character()
            && !self.is_provisional()
            && !self.is_generating()
            && !self.regenerating
    }

    pub fn can_react(&self, reaction: Reaction) -> bool {
        self.has_actions() && self.message.reaction != Some(reaction)
    }

    pub fn can_regenerate(&self) -> bool {
        self.has_actions()
    }

    pub fn can_translate(&self) -> bool {
        self.has_actions() && self.message.translation.is_none() && !self.translating
    }

    pub fn can_speak(&self) -> bool {
        self.has_actions() && !self.synthesizing
    }
}

/// Immutable view of the feed at one point in time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeedSnapshot {
    pub version: u64,
    pub items: Vec<FeedItem>,
    pub has_more: bool,
    pub loading_older: bool,
}

impl FeedSnapshot {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.message.id.as_str()).collect()
    }

    pub fn get(&self, id: &MessageId) -> Option<&FeedItem> {
        self.items.iter().find(|item| &item.message.id == id)
    }

    /// True while a reply is being generated or a send is unconfirmed.
    pub fn is_thinking(&self) -> bool {
        self.items
            .iter()
            .any(|item| item.is_provisional() || item.is_generating())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScrollState {
    /// Set by any manual scroll or wheel input, cleared when re-anchored.
    pub user_scrolled: bool,
    pub oldest_in_view: bool,
}

/// Owns the remote rows, the pagination cursor and the scroll policy.
#[derive(Debug, Default)]
pub struct FeedAssembler {
    remote: RemoteLog,
    cursor: Option<PageCursor>,
    has_more: bool,
    initial_loaded: bool,
    loading_older: bool,
    scroll: ScrollState,
    version: u64,
    rendered_len: usize,
    initial_anchored: bool,
}

impl FeedAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remote(&self) -> &RemoteLog {
        &self.remote
    }

    pub fn scroll(&self) -> ScrollState {
        self.scroll
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn initial_loaded(&self) -> bool {
        self.initial_loaded
    }

    /// Claim the next page load. Returns the cursor to load from, or `None`
    /// when nothing older exists or a load is already running.
    pub fn begin_load_older(&mut self) -> Option<Option<PageCursor>> {
        if self.loading_older || (self.initial_loaded && !self.has_more) {
            return None;
        }
        self.loading_older = true;
        Some(self.cursor.clone())
    }

    pub fn abort_load_older(&mut self) {
        self.loading_older = false;
    }

    /// Apply a page as a prefix of the feed.
    pub fn apply_page(&mut self, page: Page) -> usize {
        let inserted = self.remote.merge_page(page.messages);
        if page.next_cursor.is_some() || !page.has_more {
            self.cursor = page.next_cursor;
        }
        self.has_more = page.has_more;
        self.loading_older = false;
        self.initial_loaded = true;
        debug!(inserted, has_more = self.has_more, "applied history page");
        inserted
    }

    /// Apply a subscription delivery; returns whether the feed changed.
    pub fn apply_event(&mut self, event: StoreEvent) -> bool {
        match event {
            StoreEvent::Upsert(message) if self.behind_history(&message) => {
                debug!(message_id = %message.id, "upsert older than loaded history, left to pagination");
                false
            }
            StoreEvent::Upsert(message) => self.remote.upsert(message) != Upserted::Unchanged,
            StoreEvent::Removed(id) => self.remote.remove(&id),
        }
    }

    /// Unknown rows older than the oldest loaded one arrive through pages,
    /// otherwise the cursor and the feed would disagree.
    fn behind_history(&self, message: &Message) -> bool {
        self.has_more
            && !self.remote.contains(&message.id)
            && self
                .remote
                .oldest_created_at()
                .is_some_and(|oldest| message.created_at_us < oldest)
    }

    pub fn on_manual_scroll(&mut self) {
        self.scroll.user_scrolled = true;
    }

    pub fn anchor_to_bottom(&mut self) {
        self.scroll.user_scrolled = false;
    }

    /// Feed the visibility of the oldest rendered row. Returns true exactly
    /// when an older page should be requested: the row just entered the
    /// viewport, the user scrolled there manually, and more history exists.
    pub fn on_oldest_visibility(&mut self, visible: bool) -> bool {
        let entered = visible && !self.scroll.oldest_in_view;
        self.scroll.oldest_in_view = visible;
        entered
            && self.scroll.user_scrolled
            && self.initial_loaded
            && self.has_more
            && !self.loading_older
    }

    /// Build the next snapshot. Returns it together with whether the view
    /// should jump to the bottom.
    pub fn snapshot(
        &mut self,
        queue: &OptimisticQueue,
        playback: &PlaybackCoordinator,
    ) -> (FeedSnapshot, bool) {
        let mut items: Vec<FeedItem> = self
            .remote
            .messages()
            .iter()
            .cloned()
            .map(FeedItem::remote)
            .collect();

        for item in items.iter_mut() {
            let id = item.message.id.clone();
            for action in queue.overlays_for(&id) {
                match action {
                    PendingAction::Regenerate { .. } => {
                        item.regenerating = true;
                        item.message.text.clear();
                        item.message.translation = None;
                        item.message.speech_url = None;
                    }
                    PendingAction::Reaction { reaction, .. } => {
                        item.reacting = true;
                        item.message.reaction = Some(*reaction);
                    }
                    PendingAction::Translate { .. } => item.translating = true,
                    PendingAction::Speech { .. } => item.synthesizing = true,
                    PendingAction::Send { .. } => {}
                }
            }
            item.speaking = playback.is_speaking(&id);
        }

        let mut created_at = self.remote.newest_created_at();
        for entry in queue.pending_sends() {
            if let PendingAction::Send { chat_id, text } = &entry.action {
                created_at += 1;
                let mut item = FeedItem::remote(Message {
                    id: MessageId(entry.correlation.to_string()),
                    chat_id: chat_id.clone(),
                    character_id: None,
                    text: text.clone(),
                    translation: None,
                    reaction: None,
                    speech_url: None,
                    created_at_us: created_at,
                    client_token: Some(entry.correlation),
                });
                item.provisional = Some(entry.correlation);
                items.push(item);
            }
        }

        let grew = items.len() > self.rendered_len;
        // The first render with history anchors to the bottom no matter what.
        let first_render = self.initial_loaded && !self.initial_anchored;
        if first_render {
            self.initial_anchored = true;
        }
        let scroll_to_bottom = first_render || (grew && !self.scroll.user_scrolled);

        self.rendered_len = items.len();
        self.version += 1;
        let snapshot = FeedSnapshot {
            version: self.version,
            items,
            has_more: self.has_more,
            loading_older: self.loading_older,
        };
        (snapshot, scroll_to_bottom)
    }
}
