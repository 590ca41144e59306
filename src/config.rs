use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_INITIAL_ITEMS: usize = 5;
const DEFAULT_PAGE_SIZE: usize = 10;
const DEFAULT_POLL_MS: u64 = 1000;
const DEFAULT_SUBSCRIPTION_WINDOW: usize = 20;
const DEFAULT_TARGET_LANGUAGE: &str = "English";
const DEFAULT_USERNAME: &str = "You";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Knobs for a single chat view.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Messages fetched when the chat opens.
    pub initial_num_items: usize,
    /// Messages fetched by each "load more".
    pub page_size: usize,
    pub target_language: String,
    pub username: String,
    pub thinking_tick: Duration,
    pub warmup_after: Duration,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_num_items: DEFAULT_INITIAL_ITEMS,
            page_size: DEFAULT_PAGE_SIZE,
            target_language: DEFAULT_TARGET_LANGUAGE.to_string(),
            username: DEFAULT_USERNAME.to_string(),
            thinking_tick: Duration::from_millis(200),
            warmup_after: Duration::from_secs(3),
            event_capacity: 256,
        }
    }
}

/// Where the hosted backend lives and how to poll it.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub poll_interval: Duration,
    pub subscription_window: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub store: StoreConfig,
    pub session: SessionConfig,
    pub log_level: tracing::Level,
}

impl Config {
    /// Read configuration from the environment (after `.env` has been applied).
    pub fn from_env() -> Result<Self> {
        let base_url = env::var("CONVEX_URL")
            .context("CONVEX_URL is not set; point it at your deployment")?;
        let auth_token = env::var("CONVEX_AUTH_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());

        let store = StoreConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            poll_interval: Duration::from_millis(parse_var("CHAT_POLL_MS", DEFAULT_POLL_MS)?),
            subscription_window: parse_var("CHAT_SUBSCRIPTION_WINDOW", DEFAULT_SUBSCRIPTION_WINDOW)?
                .max(1),
        };

        let session = SessionConfig {
            initial_num_items: parse_var("CHAT_INITIAL_ITEMS", DEFAULT_INITIAL_ITEMS)?.max(1),
            page_size: parse_var("CHAT_PAGE_SIZE", DEFAULT_PAGE_SIZE)?.max(1),
            target_language: env::var("CHAT_TARGET_LANGUAGE")
                .unwrap_or_else(|_| DEFAULT_TARGET_LANGUAGE.to_string()),
            username: env::var("CHAT_USERNAME").unwrap_or_else(|_| DEFAULT_USERNAME.to_string()),
            ..SessionConfig::default()
        };

        let log_level = env::var("CHAT_LOG_LEVEL")
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
            .parse::<tracing::Level>()
            .map_err(|e| anyhow::anyhow!("invalid CHAT_LOG_LEVEL: {e}"))?;

        Ok(Self {
            store,
            session,
            log_level,
        })
    }
}

fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_defaults_match_chat_screen() {
        let config = SessionConfig::default();
        assert_eq!(config.initial_num_items, 5);
        assert_eq!(config.page_size, 10);
        assert_eq!(config.username, "You");
        assert_eq!(config.thinking_tick, Duration::from_millis(200));
        assert_eq!(config.warmup_after, Duration::from_secs(3));
    }

    #[test]
    fn parse_var_falls_back_when_unset() {
        let value: usize = parse_var("COMPANION_TEST_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }
}
