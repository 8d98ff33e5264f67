// ABOUTME: Platform-side building blocks for the VK bot
// ABOUTME: Config, XDG paths, metrics, long-poll event model, record storage and dispatch traits

pub mod config;
pub mod events;
pub mod metrics;
pub mod paths;
pub mod store;
pub mod traits;

pub use config::Config;
pub use events::{parse_forwarded, ForwardedMessage, LongPollEvent, MessageEvent, MessageFlags};
pub use store::{Filter, MemoryStore, Record, RecordStore, SqliteStore};
pub use traits::Dispatcher;
