use anyhow::{Context, Result, bail};
use companion::feed::FeedSnapshot;
use companion::format;
use companion::playback::PlaybackCommand;
use companion::types::{AuthState, CharacterId, ChatId, ChatInfo, MessageId, Reaction};
use companion::{ChatSession, Config, HttpStore, NoticeLevel, SessionEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{Receiver, error::RecvError};
use tracing::debug;

/// Defaults shipped with the binary
const BUNDLED_CONFIG: &str = include_str!("../assets/config.env");

const USAGE: &str = "usage: companion <chat-id> <character-id> [--public]";

fn load_dotenv() {
    // A local .env wins over the bundled defaults
    if dotenvy::dotenv().is_err() {
        debug!("no .env file found");
    }
    load_bundled_config();
}

fn load_bundled_config() {
    for line in BUNDLED_CONFIG.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            // Only set if not already set (allow env override)
            if std::env::var(key).is_err() {
                // SAFETY: We're setting env vars at startup before any threads are spawned
                unsafe {
                    std::env::set_var(key, value);
                }
            }
        }
    }
}

fn parse_args(args: &[String]) -> Result<ChatInfo> {
    let mut positional = Vec::new();
    let mut is_public = false;
    for arg in args {
        match arg.as_str() {
            "--public" => is_public = true,
            "-h" | "--help" => bail!(USAGE),
            flag if flag.starts_with("--") => bail!("unknown flag {flag}\n{USAGE}"),
            other => positional.push(other),
        }
    }
    let [chat_id, character_id] = positional.as_slice() else {
        bail!(USAGE);
    };
    Ok(ChatInfo {
        chat_id: ChatId::from(*chat_id),
        character_id: CharacterId::from(*character_id),
        is_public,
    })
}

// ============================================
// Commands
// ============================================

#[derive(Debug, PartialEq)]
enum Command {
    Send(String),
    More,
    Scroll,
    Like(usize),
    Dislike(usize),
    Regenerate(usize),
    Translate(usize),
    Speak(usize),
    Story,
    Continue,
    Delete,
    Quit,
}

fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Send(line.to_string()));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, Some(arg.trim())),
        None => (rest, None),
    };
    let position = || -> Result<usize> {
        let raw = arg.context("expected a message number")?;
        let n: usize = raw.parse().with_context(|| format!("not a number: {raw}"))?;
        if n == 0 {
            bail!("message numbers start at 1");
        }
        Ok(n)
    };

    Ok(match name {
        "more" => Command::More,
        "scroll" => Command::Scroll,
        "like" => Command::Like(position()?),
        "dislike" => Command::Dislike(position()?),
        "regen" => Command::Regenerate(position()?),
        "translate" => Command::Translate(position()?),
        "speak" => Command::Speak(position()?),
        "story" => Command::Story,
        "continue" => Command::Continue,
        "delete" => Command::Delete,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command /{other}"),
    })
}

fn message_at(session: &ChatSession, position: usize) -> Result<MessageId> {
    let snapshot = session.snapshot();
    let item = snapshot
        .items
        .get(position - 1)
        .with_context(|| format!("no message #{position}"))?;
    if item.is_provisional() {
        bail!("message #{position} has not been delivered yet");
    }
    Ok(item.message.id.clone())
}

async fn run_command(session: &ChatSession, command: Command) -> Result<()> {
    // Failures already reach the user as notices; the result only feeds the log.
    let outcome = match command {
        Command::Send(text) => session.send(&text).await,
        Command::More => {
            session.on_manual_scroll();
            session.load_older().await
        }
        Command::Scroll => {
            session.on_manual_scroll();
            Ok(())
        }
        Command::Like(n) => session.react(&message_at(session, n)?, Reaction::Like).await,
        Command::Dislike(n) => session.dislike(&message_at(session, n)?).await,
        Command::Regenerate(n) => session.regenerate(&message_at(session, n)?).await,
        Command::Translate(n) => session.translate(&message_at(session, n)?).await,
        Command::Speak(n) => session.toggle_speech(&message_at(session, n)?).await,
        Command::Story => session.create_story().await.map(|story_id| {
            println!(
                "story: {}",
                format::story_path(&session.info().character_id, &story_id)
            );
        }),
        Command::Continue => session.autopilot().await,
        Command::Delete => session.delete_chat().await,
        Command::Quit => return Ok(()),
    };
    if let Err(err) = outcome {
        debug!(error = %err, "command failed");
    }
    Ok(())
}

// ============================================
// Output
// ============================================

/// Prints rows that are new or changed since the last snapshot.
struct FeedPrinter {
    username: String,
    printed: HashMap<MessageId, String>,
    thinking: Option<String>,
}

impl FeedPrinter {
    fn new(username: String) -> Self {
        Self {
            username,
            printed: HashMap::new(),
            thinking: None,
        }
    }

    fn print_feed(&mut self, snapshot: &FeedSnapshot) {
        for (index, item) in snapshot.items.iter().enumerate() {
            let author = match &item.message.character_id {
                Some(_) => "character",
                None => self.username.as_str(),
            };
            let body = if item.is_generating() {
                "...".to_string()
            } else {
                format::display_text(&item.message, &self.username)
            };
            let time = format::format_timestamp(item.message.created_at_us).unwrap_or_default();
            let mut flags = String::new();
            if item.is_provisional() {
                flags.push_str(" (sending)");
            }
            if let Some(reaction) = item.message.reaction {
                flags.push_str(&format!(" [{}]", reaction.as_str()));
            }
            if item.speaking {
                flags.push_str(" [speaking]");
            }
            let line = format!("#{} {time} {author}: {}{flags}", index + 1, body.trim());
            if self.printed.get(&item.message.id) != Some(&line) {
                println!("{line}");
                self.printed.insert(item.message.id.clone(), line);
            }
        }
        if snapshot.has_more && snapshot.loading_older {
            println!("(loading older messages)");
        }
        if !snapshot.is_thinking() {
            self.thinking = None;
        }
    }

    fn print_thinking(&mut self, label: String) {
        let base = label.trim_end_matches('.').to_string();
        if self.thinking.as_ref() != Some(&base) {
            println!("{base}...");
            self.thinking = Some(base);
        }
    }
}

async fn print_events(mut events: Receiver<SessionEvent>, mut printer: FeedPrinter) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Feed(snapshot)) => printer.print_feed(&snapshot),
            Ok(SessionEvent::Notice(notice)) => {
                let level = match notice.level {
                    NoticeLevel::Info => "info",
                    NoticeLevel::Warning => "warning",
                    NoticeLevel::Error => "error",
                };
                println!("[{level}] {}", notice.text);
            }
            Ok(SessionEvent::Playback(PlaybackCommand::Play { message_id, url })) => {
                println!("playing {message_id}: {url}");
            }
            Ok(SessionEvent::Playback(PlaybackCommand::Stop { message_id })) => {
                println!("stopped {message_id}");
            }
            Ok(SessionEvent::Thinking(label)) => printer.print_thinking(label),
            Ok(SessionEvent::ScrollToBottom) => {}
            Ok(SessionEvent::Closed) | Err(RecvError::Closed) => break,
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "printer fell behind"),
        }
    }
}

async fn run(config: Config, info: ChatInfo) -> Result<()> {
    let store = Arc::new(HttpStore::new(&config.store));
    let authenticated = config.store.auth_token.is_some();
    let username = config.session.username.clone();

    let session = ChatSession::open(store, info, config.session)
        .await
        .context("failed to open chat")?;
    session.set_auth(AuthState {
        is_authenticated: authenticated,
        is_loading: false,
    });
    if !authenticated {
        println!("read-only: set CONVEX_AUTH_TOKEN to send messages");
    }

    let mut printer = FeedPrinter::new(username);
    printer.print_feed(&session.snapshot());
    let output = tokio::spawn(print_events(session.events(), printer));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => {
                if let Err(err) = run_command(&session, command).await {
                    println!("{err}");
                }
            }
            Err(err) => println!("{err}"),
        }
        if session.is_closed() {
            break;
        }
    }

    session.close();
    output.await.context("output task failed")?;
    Ok(())
}

fn main() -> Result<()> {
    load_dotenv();
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let info = parse_args(&args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(run(config, info))
}
