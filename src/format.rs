use crate::types::{CharacterId, Message, MessageId, StoryId};
use comrak::plugins::syntect::SyntectAdapter;
use comrak::{ComrakOptions, ComrakPlugins, markdown_to_html_with_plugins};
use once_cell::sync::Lazy;
use time::{OffsetDateTime, UtcOffset, format_description::FormatItem, macros::format_description};

const OUT_OF_CRYSTALS: &str = "Not enough crystals.";
const TOP_UP_LINK: &str = "[Crystal Top-up](/crystals)";
const USER_PLACEHOLDER: &str = "{{user}}";

const MESSAGE_TIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[hour repr:12 padding:zero]:[minute padding:zero] [period case:upper]");

static MARKDOWN_OPTIONS: Lazy<ComrakOptions> = Lazy::new(|| {
    let mut options = ComrakOptions::default();
    options.extension.table = true;
    options.extension.footnotes = true;
    options.extension.strikethrough = true;
    options.extension.tasklist = true;
    options.extension.autolink = true;
    // Replies come from a model; raw HTML in them stays escaped.
    options.render.unsafe_ = false;
    options
});

/// Markdown the user actually sees for a message.
///
/// A translation replaces the original text, an out-of-crystals notice gets
/// a top-up link, and `{{user}}` becomes the reader's name.
pub fn display_text(message: &Message, username: &str) -> String {
    let text = match &message.translation {
        Some(translation) => format!("\n{translation}"),
        None if message.text.starts_with(OUT_OF_CRYSTALS) => {
            format!("{} {TOP_UP_LINK}", message.text)
        }
        None => message.text.clone(),
    };
    text.replacen(USER_PLACEHOLDER, username, 1)
}

pub fn markdown_to_html(md: &str) -> String {
    let adapter = SyntectAdapter::new(Some("base16-ocean.dark"));
    let mut plugins = ComrakPlugins::default();
    plugins.render.codefence_syntax_highlighter = Some(&adapter);
    markdown_to_html_with_plugins(md, &MARKDOWN_OPTIONS, &plugins)
}

pub fn render_message(message: &Message, username: &str) -> String {
    markdown_to_html(&display_text(message, username))
}

/// Creation time as a short wall-clock label, in local time when known.
pub fn format_timestamp(created_at_us: u64) -> Option<String> {
    let nanos = i128::from(created_at_us) * 1_000;
    let mut datetime = OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()?;
    if let Ok(offset) = UtcOffset::current_local_offset() {
        datetime = datetime.to_offset(offset);
    }
    datetime.format(MESSAGE_TIME_FORMAT).ok()
}

/// Messages shared when a chat becomes a story: everything but the
/// character's opening greeting.
pub fn story_message_ids(messages: &[Message]) -> Vec<MessageId> {
    messages
        .iter()
        .skip(1)
        .map(|message| message.id.clone())
        .collect()
}

/// Where a freshly created story can be read.
pub fn story_path(character_id: &CharacterId, story_id: &StoryId) -> String {
    format!("/character/{character_id}/story/{story_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatId;

    fn message(text: &str) -> Message {
        Message {
            id: MessageId::from("m1"),
            chat_id: ChatId::from("chat"),
            character_id: Some(CharacterId::from("c1")),
            text: text.to_string(),
            translation: None,
            reaction: None,
            speech_url: None,
            created_at_us: 1_700_000_000_000_000,
            client_token: None,
        }
    }

    #[test]
    fn translation_replaces_text() {
        let mut msg = message("Bonjour");
        msg.translation = Some("Hello".into());
        assert_eq!(display_text(&msg, "You"), "\nHello");
    }

    #[test]
    fn crystal_notice_gets_top_up_link() {
        let msg = message("Not enough crystals. Please top up.");
        assert_eq!(
            display_text(&msg, "You"),
            "Not enough crystals. Please top up. [Crystal Top-up](/crystals)"
        );
    }

    #[test]
    fn user_placeholder_is_substituted_once() {
        let msg = message("Hi {{user}}, I'm glad {{user}} came");
        assert_eq!(
            display_text(&msg, "Ada"),
            "Hi Ada, I'm glad {{user}} came"
        );
    }

    #[test]
    fn markdown_renders_and_escapes_html() {
        let html = markdown_to_html("**bold** <script>x</script>");
        assert!(html.contains("<strong>bold</strong>"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn story_skips_greeting() {
        let mut first = message("greeting");
        first.id = MessageId::from("m1");
        let mut second = message("hi");
        second.id = MessageId::from("m2");
        assert_eq!(
            story_message_ids(&[first, second]),
            vec![MessageId::from("m2")]
        );
    }

    #[test]
    fn story_path_points_at_character_page() {
        assert_eq!(
            story_path(&CharacterId::from("c1"), &StoryId::from("s9")),
            "/character/c1/story/s9"
        );
    }

    #[test]
    fn timestamp_formats_as_clock_time() {
        let label = format_timestamp(1_700_000_000_000_000).unwrap();
        assert!(label.ends_with("AM") || label.ends_with("PM"));
        assert_eq!(label.len(), "00:00 AM".len());
    }
}
