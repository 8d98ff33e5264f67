// ABOUTME: EventDispatchLoop - pulls update batches and hands each event to the dispatcher.
// ABOUTME: Every event runs on its own task so slow handlers never stall the next poll.

use super::session::{LongPollError, LongPollSession};
use std::sync::Arc;
use vkbot_core::metrics;
use vkbot_core::{Dispatcher, LongPollEvent};

pub struct EventDispatchLoop {
    session: LongPollSession,
    dispatcher: Arc<dyn Dispatcher>,
}

impl EventDispatchLoop {
    pub fn new(session: LongPollSession, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            session,
            dispatcher,
        }
    }

    pub fn session(&self) -> &LongPollSession {
        &self.session
    }

    /// Poll once and spawn a task per decoded event. Returns how many were spawned.
    pub async fn run_once(&mut self) -> Result<usize, LongPollError> {
        let updates = self.session.poll().await?;
        metrics::record_longpoll_events(updates.len());

        let mut spawned = 0;
        for raw in &updates {
            let Some(event) = LongPollEvent::decode(raw) else {
                tracing::debug!(update = %raw, "Skipping undecodable update");
                continue;
            };
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                let code = event.code();
                let handled = dispatcher.dispatch(event).await;
                tracing::trace!(code, handled, "Event dispatched");
            });
            spawned += 1;
        }
        Ok(spawned)
    }

    /// Run until the poll server becomes unreachable
    pub async fn run(mut self) -> Result<(), LongPollError> {
        tracing::info!("Listening for long-poll events");
        loop {
            self.run_once().await?;
        }
    }
}
