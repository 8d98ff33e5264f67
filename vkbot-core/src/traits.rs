// ABOUTME: Seams between the long-poll loop and whatever handles decoded updates.
// ABOUTME: Implementations must be Send + Sync; each event is dispatched on its own task.

use crate::events::LongPollEvent;
use async_trait::async_trait;

/// Receives every decoded long-poll update
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Returns true if the event was handled
    async fn dispatch(&self, event: LongPollEvent) -> bool;
}
