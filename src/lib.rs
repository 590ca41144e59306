//! Companion chat session core
//!
//! View-model for a character chat screen: an ordered, paginated feed with
//! optimistic mutations, per-message actions and single-stream audio playback.
//! Rendering lives elsewhere; it consumes [`session::SessionEvent`]s.

pub mod config;
pub mod error;
pub mod feed;
pub mod format;
pub mod playback;
pub mod queue;
pub mod session;
pub mod store;
pub mod thinking;
pub mod types;

pub use config::{Config, SessionConfig, StoreConfig};
pub use error::{ChatError, ChatResult};
pub use session::{ChatSession, Notice, NoticeLevel, SessionEvent};
pub use store::{HttpStore, InMemoryStore, MessageStore};
