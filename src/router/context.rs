// ABOUTME: MessageContext handed to command handlers, plus the Replier seam used to answer.
// ABOUTME: Long answers are split into chunks that fit VK's message length limit.

use async_trait::async_trait;
use std::sync::Arc;
use vkbot_api::{ApiError, ClientPool, Params, WaitMode};
use vkbot_core::MessageEvent;

/// Longest text VK accepts in one message
pub const MAX_MESSAGE_LENGTH: usize = 3584;

/// Sends reply text to a peer
#[async_trait]
pub trait Replier: Send + Sync {
    /// Send every part, in order, from the same identity. Non-empty `forward`
    /// message ids are quoted under the last part.
    async fn reply(
        &self,
        peer_id: i64,
        parts: Vec<String>,
        forward: &[i64],
    ) -> Result<(), ApiError>;
}

#[async_trait]
impl Replier for ClientPool {
    async fn reply(
        &self,
        peer_id: i64,
        parts: Vec<String>,
        forward: &[i64],
    ) -> Result<(), ApiError> {
        let sender = self.default_sender("messages.send");
        let last = parts.len().saturating_sub(1);
        for (i, part) in parts.into_iter().enumerate() {
            let mut params = Params::new().with("peer_id", peer_id).with("message", part);
            if i == last && !forward.is_empty() {
                let ids: Vec<String> = forward.iter().map(|id| id.to_string()).collect();
                params.insert("forward_messages", ids.join(","));
            }
            self.call("messages.send", params, WaitMode::FireAndForget, Some(sender))
                .await?;
        }
        Ok(())
    }
}

/// Split text into pieces of at most `limit` characters
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(limit)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// One inbound message as a command handler sees it
#[derive(Clone)]
pub struct MessageContext {
    pub message: MessageEvent,
    /// Message text with any command prefix removed
    pub text: String,
    pub has_prefix: bool,
    forward_original: bool,
    replier: Arc<dyn Replier>,
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("message", &self.message)
            .field("text", &self.text)
            .field("has_prefix", &self.has_prefix)
            .field("forward_original", &self.forward_original)
            .finish()
    }
}

impl MessageContext {
    pub fn new(
        message: MessageEvent,
        text: String,
        has_prefix: bool,
        replier: Arc<dyn Replier>,
    ) -> Self {
        Self {
            message,
            text,
            has_prefix,
            forward_original: false,
            replier,
        }
    }

    /// Quote the triggering message under every `answer`
    pub fn forwarding_original(mut self, forward: bool) -> Self {
        self.forward_original = forward;
        self
    }

    /// First word of the text, lowercased
    pub fn command(&self) -> String {
        self.text
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_lowercase()
    }

    pub fn args(&self) -> Vec<&str> {
        self.text.split_whitespace().skip(1).collect()
    }

    /// Reply in the conversation the message came from
    pub async fn answer(&self, text: &str) -> Result<(), ApiError> {
        if self.forward_original {
            self.answer_forwarding(text, &[self.message.message_id]).await
        } else {
            self.send(text).await
        }
    }

    /// Reply and quote the given messages under the last part
    pub async fn answer_forwarding(
        &self,
        text: &str,
        message_ids: &[i64],
    ) -> Result<(), ApiError> {
        self.replier
            .reply(
                self.message.peer_id,
                split_message(text, MAX_MESSAGE_LENGTH),
                message_ids,
            )
            .await
    }

    /// Reply without quoting anything
    pub async fn send(&self, text: &str) -> Result<(), ApiError> {
        self.answer_forwarding(text, &[]).await
    }
}
