use crate::types::{Message, MessageId};
use serde::{Deserialize, Serialize};

/// Instructions for whatever owns the audio element.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackCommand {
    Play { message_id: MessageId, url: String },
    Stop { message_id: MessageId },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Toggle {
    /// Playback (or a pending request for it) was switched off.
    Stopped(Vec<PlaybackCommand>),
    /// A cached asset started playing.
    Started(Vec<PlaybackCommand>),
    /// No asset yet; the caller must request synthesis first.
    Synthesize,
}

/// At most one active audio stream per chat.
///
/// `wanted` remembers the message the user most recently asked to hear so
/// that a synthesis finishing late cannot override a newer choice.
#[derive(Debug, Default)]
pub struct PlaybackCoordinator {
    active: Option<MessageId>,
    wanted: Option<MessageId>,
}

impl PlaybackCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&MessageId> {
        self.active.as_ref()
    }

    pub fn is_speaking(&self, message_id: &MessageId) -> bool {
        self.active.as_ref() == Some(message_id)
    }

    pub fn is_wanted(&self, message_id: &MessageId) -> bool {
        self.wanted.as_ref() == Some(message_id)
    }

    pub fn toggle(&mut self, message: &Message) -> Toggle {
        let id = &message.id;
        if self.is_speaking(id) {
            self.active = None;
            self.wanted = None;
            return Toggle::Stopped(vec![PlaybackCommand::Stop {
                message_id: id.clone(),
            }]);
        }
        if self.is_wanted(id) {
            // Switched off while synthesis is still running.
            self.wanted = None;
            return Toggle::Stopped(Vec::new());
        }
        match &message.speech_url {
            Some(url) => Toggle::Started(self.start(id, url)),
            None => {
                self.wanted = Some(id.clone());
                Toggle::Synthesize
            }
        }
    }

    pub fn synthesis_succeeded(&mut self, message_id: &MessageId, url: &str) -> Vec<PlaybackCommand> {
        if self.is_wanted(message_id) && !self.is_speaking(message_id) {
            self.start(message_id, url)
        } else {
            Vec::new()
        }
    }

    /// Revert to off; nothing was playing for this message yet.
    pub fn synthesis_failed(&mut self, message_id: &MessageId) {
        if self.is_wanted(message_id) {
            self.wanted = None;
        }
    }

    /// The asset showed up through the subscription instead of the mutation.
    pub fn asset_arrived(&mut self, message: &Message) -> Vec<PlaybackCommand> {
        match &message.speech_url {
            Some(url) => self.synthesis_succeeded(&message.id, url),
            None => Vec::new(),
        }
    }

    pub fn playback_ended(&mut self, message_id: &MessageId) -> bool {
        if !self.is_speaking(message_id) {
            return false;
        }
        self.active = None;
        self.wanted = None;
        true
    }

    pub fn message_removed(&mut self, message_id: &MessageId) -> Vec<PlaybackCommand> {
        self.synthesis_failed(message_id);
        if self.is_speaking(message_id) {
            self.active = None;
            return vec![PlaybackCommand::Stop {
                message_id: message_id.clone(),
            }];
        }
        Vec::new()
    }

    pub fn stop_all(&mut self) -> Vec<PlaybackCommand> {
        self.wanted = None;
        self.active
            .take()
            .map(|message_id| vec![PlaybackCommand::Stop { message_id }])
            .unwrap_or_default()
    }

    fn start(&mut self, message_id: &MessageId, url: &str) -> Vec<PlaybackCommand> {
        let mut commands = Vec::with_capacity(2);
        if let Some(previous) = self.active.take()
            && &previous != message_id
        {
            commands.push(PlaybackCommand::Stop {
                message_id: previous,
            });
        }
        self.active = Some(message_id.clone());
        self.wanted = Some(message_id.clone());
        commands.push(PlaybackCommand::Play {
            message_id: message_id.clone(),
            url: url.to_string(),
        });
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CharacterId, ChatId};

    fn message(id: &str, url: Option<&str>) -> Message {
        Message {
            id: MessageId::from(id),
            chat_id: ChatId::from("chat"),
            character_id: Some(CharacterId::from("c1")),
            text: "hello".into(),
            translation: None,
            reaction: None,
            speech_url: url.map(str::to_string),
            created_at_us: 1,
            client_token: None,
        }
    }

    #[test]
    fn starting_b_stops_a_first() {
        let mut playback = PlaybackCoordinator::new();
        let a = message("a", Some("a.mp3"));
        let b = message("b", Some("b.mp3"));
        playback.toggle(&a);

        assert_eq!(
            playback.toggle(&b),
            Toggle::Started(vec![
                PlaybackCommand::Stop {
                    message_id: MessageId::from("a")
                },
                PlaybackCommand::Play {
                    message_id: MessageId::from("b"),
                    url: "b.mp3".into()
                },
            ])
        );
        assert!(playback.is_speaking(&MessageId::from("b")));
        assert!(!playback.is_speaking(&MessageId::from("a")));
    }

    #[test]
    fn toggle_off_never_synthesizes() {
        let mut playback = PlaybackCoordinator::new();
        let a = message("a", Some("a.mp3"));
        playback.toggle(&a);
        assert_eq!(
            playback.toggle(&a),
            Toggle::Stopped(vec![PlaybackCommand::Stop {
                message_id: MessageId::from("a")
            }])
        );
        assert!(playback.active().is_none());
    }

    #[test]
    fn missing_asset_requests_synthesis_then_plays() {
        let mut playback = PlaybackCoordinator::new();
        let a = message("a", None);
        assert_eq!(playback.toggle(&a), Toggle::Synthesize);
        assert!(!playback.is_speaking(&a.id));

        let commands = playback.synthesis_succeeded(&a.id, "a.mp3");
        assert_eq!(
            commands,
            vec![PlaybackCommand::Play {
                message_id: a.id.clone(),
                url: "a.mp3".into()
            }]
        );
        assert!(playback.is_speaking(&a.id));
    }

    #[test]
    fn failed_synthesis_reverts_to_off() {
        let mut playback = PlaybackCoordinator::new();
        let a = message("a", None);
        playback.toggle(&a);
        playback.synthesis_failed(&a.id);
        assert!(!playback.is_wanted(&a.id));
        assert!(playback.synthesis_succeeded(&a.id, "late.mp3").is_empty());
    }

    #[test]
    fn superseded_synthesis_is_ignored() {
        let mut playback = PlaybackCoordinator::new();
        let a = message("a", None);
        let b = message("b", Some("b.mp3"));
        playback.toggle(&a);
        playback.toggle(&b);
        assert!(playback.synthesis_succeeded(&a.id, "a.mp3").is_empty());
        assert!(playback.is_speaking(&b.id));
    }

    #[test]
    fn ended_audio_clears_active_state() {
        let mut playback = PlaybackCoordinator::new();
        let a = message("a", Some("a.mp3"));
        playback.toggle(&a);
        assert!(playback.playback_ended(&a.id));
        assert!(!playback.playback_ended(&a.id));
        assert!(playback.stop_all().is_empty());
    }
}
