// ABOUTME: Root library module for the VK bot
// ABOUTME: Long-poll intake and message routing live here; API client and platform pieces are re-exported

pub mod longpoll;
pub mod router;

// Re-export platform modules from vkbot-core
pub use vkbot_core::config;
pub use vkbot_core::events;
pub use vkbot_core::metrics;
pub use vkbot_core::paths;
pub use vkbot_core::store;
pub use vkbot_core::traits;

// Re-export the API client crate for convenience
pub use vkbot_api as api;
