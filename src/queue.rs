//! Optimistic mutation queue
//!
//! Every user action becomes an [`OptimisticEntry`] that is visible in the
//! feed right away and walks `Pending -> Confirmed | Rejected`. Confirmed
//! entries disappear in the same update that shows the authoritative row.

use crate::error::{ChatError, ChatResult};
use crate::feed::RemoteLog;
use crate::types::{ChatId, CorrelationId, MessageId, Reaction};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Send,
    Regenerate,
    Reaction,
    Translate,
    Speech,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActionKind::Send => "Send",
            ActionKind::Regenerate => "Regeneration",
            ActionKind::Reaction => "Reaction",
            ActionKind::Translate => "Translation",
            ActionKind::Speech => "Speech",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PendingAction {
    Send { chat_id: ChatId, text: String },
    Regenerate { message_id: MessageId },
    Reaction { message_id: MessageId, reaction: Reaction },
    Translate { message_id: MessageId },
    Speech { message_id: MessageId },
}

impl PendingAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            PendingAction::Send { .. } => ActionKind::Send,
            PendingAction::Regenerate { .. } => ActionKind::Regenerate,
            PendingAction::Reaction { .. } => ActionKind::Reaction,
            PendingAction::Translate { .. } => ActionKind::Translate,
            PendingAction::Speech { .. } => ActionKind::Speech,
        }
    }

    /// The message an overlay applies to; sends have none.
    pub fn target(&self) -> Option<&MessageId> {
        match self {
            PendingAction::Send { .. } => None,
            PendingAction::Regenerate { message_id }
            | PendingAction::Reaction { message_id, .. }
            | PendingAction::Translate { message_id }
            | PendingAction::Speech { message_id } => Some(message_id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Confirmed,
    Rejected,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OptimisticEntry {
    pub correlation: CorrelationId,
    pub action: PendingAction,
    pub status: EntryStatus,
    acknowledged: bool,
    remote_id: Option<MessageId>,
    speech_url: Option<String>,
    text_at_submit: Option<String>,
    newest_at_submit: u64,
}

impl OptimisticEntry {
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn remote_id(&self) -> Option<&MessageId> {
        self.remote_id.as_ref()
    }

    /// The remote row that proves this entry landed, if it is there yet.
    fn confirmed_by<'a>(
        &self,
        remote: &'a RemoteLog,
        claimed: &HashSet<MessageId>,
    ) -> Option<&'a MessageId> {
        match &self.action {
            PendingAction::Send { text, .. } => {
                if let Some(message) = remote.find_by_token(self.correlation) {
                    return Some(&message.id);
                }
                if let Some(id) = &self.remote_id {
                    return remote.get(id).map(|message| &message.id);
                }
                // Stores that echo neither token nor id: the first new row we
                // wrote with the same text.
                remote
                    .messages()
                    .iter()
                    .find(|message| {
                        message.character_id.is_none()
                            && message.client_token.is_none()
                            && message.created_at_us > self.newest_at_submit
                            && &message.text == text
                            && !claimed.contains(&message.id)
                    })
                    .map(|message| &message.id)
            }
            // Other updates to the row (a reaction, say) leave the text alone.
            PendingAction::Regenerate { message_id } => remote
                .get(message_id)
                .filter(|message| {
                    self.acknowledged
                        && (message.text.is_empty()
                            || self.text_at_submit.as_ref() != Some(&message.text))
                })
                .map(|message| &message.id),
            PendingAction::Reaction {
                message_id,
                reaction,
            } => remote
                .get(message_id)
                .filter(|message| self.acknowledged && message.reaction == Some(*reaction))
                .map(|message| &message.id),
            PendingAction::Translate { message_id } => remote
                .get(message_id)
                .filter(|message| self.acknowledged && message.translation.is_some())
                .map(|message| &message.id),
            PendingAction::Speech { message_id } => remote
                .get(message_id)
                .filter(|message| {
                    self.acknowledged
                        && (self.speech_url.is_some() || message.speech_url.is_some())
                })
                .map(|message| &message.id),
        }
    }
}

/// Locally-initiated actions awaiting remote confirmation.
#[derive(Debug, Default)]
pub struct OptimisticQueue {
    next_correlation: u64,
    entries: Vec<OptimisticEntry>,
    claimed: HashSet<MessageId>,
}

impl OptimisticQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, correlation: CorrelationId) -> Option<&OptimisticEntry> {
        self.entries.iter().find(|e| e.correlation == correlation)
    }

    /// Queue an action, enforcing one regenerate, translate and speech
    /// request per message.
    pub fn submit(
        &mut self,
        action: PendingAction,
        remote: &RemoteLog,
    ) -> ChatResult<CorrelationId> {
        let kind = action.kind();
        if let Some(target) = action.target() {
            let exclusive = matches!(
                kind,
                ActionKind::Regenerate | ActionKind::Translate | ActionKind::Speech
            );
            let already_translated = kind == ActionKind::Translate
                && remote
                    .get(target)
                    .is_some_and(|message| message.translation.is_some());
            if (exclusive && self.is_in_progress(kind, target)) || already_translated {
                return Err(ChatError::AlreadyInProgress {
                    action: kind,
                    message: target.clone(),
                });
            }
        }

        self.next_correlation += 1;
        let correlation = CorrelationId(self.next_correlation);
        let text_at_submit = match &action {
            PendingAction::Regenerate { message_id } => {
                remote.get(message_id).map(|message| message.text.clone())
            }
            _ => None,
        };
        debug!(%correlation, ?kind, "optimistic entry queued");
        self.entries.push(OptimisticEntry {
            correlation,
            action,
            status: EntryStatus::Pending,
            acknowledged: false,
            remote_id: None,
            speech_url: None,
            text_at_submit,
            newest_at_submit: remote.newest_created_at(),
        });
        Ok(correlation)
    }

    pub fn is_in_progress(&self, kind: ActionKind, message_id: &MessageId) -> bool {
        self.entries
            .iter()
            .any(|e| e.action.kind() == kind && e.action.target() == Some(message_id))
    }

    /// Record the store's acknowledgement of a mutation.
    pub fn acknowledge(
        &mut self,
        correlation: CorrelationId,
        remote_id: Option<MessageId>,
        speech_url: Option<String>,
    ) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.correlation == correlation)
        else {
            return false;
        };
        entry.acknowledged = true;
        if remote_id.is_some() {
            entry.remote_id = remote_id;
        }
        if speech_url.is_some() {
            entry.speech_url = speech_url;
        }
        true
    }

    /// Retire every entry whose authoritative row is now present. Overlays
    /// whose target disappeared are dropped as well.
    pub fn reconcile(&mut self, remote: &RemoteLog) -> Vec<OptimisticEntry> {
        let mut retired = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());

        for mut entry in std::mem::take(&mut self.entries) {
            if let Some(target) = entry.action.target()
                && !remote.contains(target)
            {
                debug!(correlation = %entry.correlation, %target, "overlay target vanished");
                continue;
            }

            match entry.confirmed_by(remote, &self.claimed).cloned() {
                Some(confirmed) => {
                    if entry.action.kind() == ActionKind::Send {
                        self.claimed.insert(confirmed.clone());
                    }
                    debug!(correlation = %entry.correlation, message_id = %confirmed, "optimistic entry confirmed");
                    entry.status = EntryStatus::Confirmed;
                    retired.push(entry);
                }
                None => kept.push(entry),
            }
        }

        self.entries = kept;
        self.release_claims(remote);
        retired
    }

    /// Claims only matter to sends that could still match by text, and those
    /// look at rows newer than what existed when they were queued.
    fn release_claims(&mut self, remote: &RemoteLog) {
        let floor = self.pending_sends().map(|e| e.newest_at_submit).min();
        match floor {
            None => self.claimed.clear(),
            Some(floor) => self.claimed.retain(|id| {
                remote
                    .get(id)
                    .is_some_and(|message| message.created_at_us > floor)
            }),
        }
    }

    /// Drop a failed entry; the caller surfaces the error.
    pub fn reject(&mut self, correlation: CorrelationId) -> Option<OptimisticEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.correlation == correlation)?;
        let mut entry = self.entries.remove(index);
        entry.status = EntryStatus::Rejected;
        debug!(%correlation, "optimistic entry rejected");
        Some(entry)
    }

    /// Forget everything, e.g. when the chat view goes away.
    pub fn discard_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.claimed.clear();
        count
    }

    pub fn pending_sends(&self) -> impl Iterator<Item = &OptimisticEntry> {
        self.entries
            .iter()
            .filter(|e| e.action.kind() == ActionKind::Send)
    }

    pub fn has_pending_send(&self) -> bool {
        self.pending_sends().next().is_some()
    }

    pub fn overlays_for<'a>(
        &'a self,
        message_id: &'a MessageId,
    ) -> impl Iterator<Item = &'a PendingAction> + 'a {
        self.entries
            .iter()
            .map(|e| &e.action)
            .filter(move |action| action.target() == Some(message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CharacterId, Message};

    fn message(id: &str, at: u64, character: bool, text: &str) -> Message {
        Message {
            id: MessageId::from(id),
            chat_id: ChatId::from("chat"),
            character_id: character.then(|| CharacterId::from("c1")),
            text: text.to_string(),
            translation: None,
            reaction: None,
            speech_url: None,
            created_at_us: at,
            client_token: None,
        }
    }

    fn send(text: &str) -> PendingAction {
        PendingAction::Send {
            chat_id: ChatId::from("chat"),
            text: text.to_string(),
        }
    }

    fn log_with(messages: &[Message]) -> RemoteLog {
        let mut log = RemoteLog::default();
        log.merge_page(messages.to_vec());
        log
    }

    #[test]
    fn send_confirms_through_echoed_token() {
        let mut log = log_with(&[message("m1", 1, true, "hello")]);
        let mut queue = OptimisticQueue::new();
        let correlation = queue.submit(send("hi"), &log).unwrap();
        assert!(queue.reconcile(&log).is_empty());

        let mut echoed = message("m2", 2, false, "hi");
        echoed.client_token = Some(correlation);
        log.upsert(echoed);

        let retired = queue.reconcile(&log);
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].status, EntryStatus::Confirmed);
        assert!(queue.is_empty());
    }

    #[test]
    fn send_confirms_through_receipt_id() {
        let mut log = log_with(&[]);
        let mut queue = OptimisticQueue::new();
        let correlation = queue.submit(send("hi"), &log).unwrap();
        queue.acknowledge(correlation, Some(MessageId::from("m9")), None);
        // Same text from someone else's row must not confirm it.
        log.upsert(message("m8", 8, false, "hi"));
        assert!(queue.reconcile(&log).is_empty());
        log.upsert(message("m9", 9, false, "hi"));
        assert_eq!(queue.reconcile(&log).len(), 1);
    }

    #[test]
    fn identical_sends_claim_distinct_rows() {
        let mut log = log_with(&[message("m1", 1, true, "hello")]);
        let mut queue = OptimisticQueue::new();
        queue.submit(send("hi"), &log).unwrap();
        queue.submit(send("hi"), &log).unwrap();

        log.upsert(message("m2", 2, false, "hi"));
        assert_eq!(queue.reconcile(&log).len(), 1);
        assert_eq!(queue.len(), 1);
        // A later unrelated delivery must not let the second send steal m2.
        log.upsert(message("m3", 3, true, "reply"));
        assert!(queue.reconcile(&log).is_empty());

        log.upsert(message("m4", 4, false, "hi"));
        assert_eq!(queue.reconcile(&log).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn second_regenerate_is_refused_locally() {
        let log = log_with(&[message("m1", 1, true, "hello")]);
        let mut queue = OptimisticQueue::new();
        let target = MessageId::from("m1");
        queue
            .submit(
                PendingAction::Regenerate {
                    message_id: target.clone(),
                },
                &log,
            )
            .unwrap();
        let err = queue
            .submit(
                PendingAction::Regenerate {
                    message_id: target.clone(),
                },
                &log,
            )
            .unwrap_err();
        assert_eq!(
            err,
            ChatError::AlreadyInProgress {
                action: ActionKind::Regenerate,
                message: target,
            }
        );
    }

    #[test]
    fn translate_of_translated_message_is_refused() {
        let mut translated = message("m1", 1, true, "hola");
        translated.translation = Some("hello".into());
        let log = log_with(&[translated]);
        let mut queue = OptimisticQueue::new();
        let err = queue
            .submit(
                PendingAction::Translate {
                    message_id: MessageId::from("m1"),
                },
                &log,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::AlreadyInProgress {
                action: ActionKind::Translate,
                ..
            }
        ));
    }

    #[test]
    fn regenerate_waits_for_ack_and_new_text() {
        let mut log = log_with(&[message("m1", 1, true, "hello")]);
        let mut queue = OptimisticQueue::new();
        let correlation = queue
            .submit(
                PendingAction::Regenerate {
                    message_id: MessageId::from("m1"),
                },
                &log,
            )
            .unwrap();

        queue.acknowledge(correlation, None, None);
        assert!(queue.reconcile(&log).is_empty());

        log.upsert(message("m1", 1, true, ""));
        assert_eq!(queue.reconcile(&log).len(), 1);
    }

    #[test]
    fn reaction_update_does_not_confirm_regenerate() {
        let mut log = log_with(&[message("m1", 1, true, "hello")]);
        let mut queue = OptimisticQueue::new();
        let correlation = queue
            .submit(
                PendingAction::Regenerate {
                    message_id: MessageId::from("m1"),
                },
                &log,
            )
            .unwrap();
        queue.acknowledge(correlation, None, None);

        let mut disliked = message("m1", 1, true, "hello");
        disliked.reaction = Some(Reaction::Dislike);
        log.upsert(disliked);
        assert!(queue.reconcile(&log).is_empty());
        assert!(queue.is_in_progress(ActionKind::Regenerate, &MessageId::from("m1")));

        // Skipping the cleared state still confirms once the new answer lands.
        let mut answered = message("m1", 1, true, "a better answer");
        answered.reaction = Some(Reaction::Dislike);
        log.upsert(answered);
        assert_eq!(queue.reconcile(&log).len(), 1);
    }

    #[test]
    fn claims_are_released_once_no_send_can_match_them() {
        let mut log = log_with(&[message("m1", 1, true, "hello")]);
        let mut queue = OptimisticQueue::new();
        queue.submit(send("hi"), &log).unwrap();
        log.upsert(message("m2", 2, false, "hi"));
        assert_eq!(queue.reconcile(&log).len(), 1);
        assert!(queue.claimed.is_empty());

        queue.submit(send("hi"), &log).unwrap();
        queue.submit(send("hi"), &log).unwrap();
        log.upsert(message("m3", 3, false, "hi"));
        assert_eq!(queue.reconcile(&log).len(), 1);
        assert!(queue.claimed.contains(&MessageId::from("m3")));

        log.upsert(message("m4", 4, false, "hi"));
        assert_eq!(queue.reconcile(&log).len(), 1);
        assert!(queue.claimed.is_empty());
    }

    #[test]
    fn reaction_needs_matching_remote_state() {
        let mut log = log_with(&[message("m1", 1, true, "hello")]);
        let mut queue = OptimisticQueue::new();
        let correlation = queue
            .submit(
                PendingAction::Reaction {
                    message_id: MessageId::from("m1"),
                    reaction: Reaction::Like,
                },
                &log,
            )
            .unwrap();
        queue.acknowledge(correlation, None, None);
        assert!(queue.reconcile(&log).is_empty());

        let mut liked = message("m1", 1, true, "hello");
        liked.reaction = Some(Reaction::Like);
        log.upsert(liked);
        assert_eq!(queue.reconcile(&log).len(), 1);
    }

    #[test]
    fn overlays_on_removed_rows_are_dropped() {
        let mut log = log_with(&[message("m1", 1, true, "hello")]);
        let mut queue = OptimisticQueue::new();
        queue
            .submit(
                PendingAction::Translate {
                    message_id: MessageId::from("m1"),
                },
                &log,
            )
            .unwrap();
        log.remove(&MessageId::from("m1"));
        assert!(queue.reconcile(&log).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn reject_removes_entry_and_marks_it() {
        let log = log_with(&[]);
        let mut queue = OptimisticQueue::new();
        let correlation = queue.submit(send("hi"), &log).unwrap();
        let rejected = queue.reject(correlation).unwrap();
        assert_eq!(rejected.status, EntryStatus::Rejected);
        assert!(queue.is_empty());
        assert!(queue.reject(correlation).is_none());
    }
}
