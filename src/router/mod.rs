// ABOUTME: Message router - the default Dispatcher for new-message events.
// ABOUTME: Applies outbox, blacklist, whitelist and flood filters, strips prefixes and runs the handler.

pub mod commands;
pub mod context;

pub use commands::{BuiltinCommands, CommandHandler};
pub use context::{split_message, MessageContext, Replier, MAX_MESSAGE_LENGTH};

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use vkbot_core::config::BotConfig;
use vkbot_core::metrics;
use vkbot_core::{Dispatcher, Filter, LongPollEvent, MessageEvent, RecordStore};

const ROLE_MODEL: &str = "role";
const USER_MODEL: &str = "user";

const REFERENCE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Five uppercase letters/digits identifying one handler fault in logs and chat
pub fn reference_code() -> String {
    let mut rng = rand::thread_rng();
    (0..5)
        .map(|_| REFERENCE_CHARSET[rng.gen_range(0..REFERENCE_CHARSET.len())] as char)
        .collect()
}

/// Write the configured admin, whitelist and blacklist roles into the store
pub async fn seed_roles(store: &dyn RecordStore, bot: &BotConfig) -> anyhow::Result<()> {
    let groups = [
        ("whitelisted", &bot.whitelist),
        ("blacklisted", &bot.blacklist),
        ("admin", &bot.admins),
    ];
    for (role, ids) in groups {
        for id in ids {
            store
                .get_or_create(ROLE_MODEL, &Filter::new().field("user_id", *id).field("role", role))
                .await?;
        }
    }
    tracing::info!(
        admins = bot.admins.len(),
        whitelist = bot.whitelist.len(),
        blacklist = bot.blacklist.len(),
        "Roles seeded"
    );
    Ok(())
}

pub struct MessageRouter {
    bot: BotConfig,
    store: Arc<dyn RecordStore>,
    replier: Arc<dyn Replier>,
    handler: Arc<dyn CommandHandler>,
    /// Held across the user record read-modify-write
    flood_guard: tokio::sync::Mutex<()>,
}

impl MessageRouter {
    pub fn new(
        bot: BotConfig,
        store: Arc<dyn RecordStore>,
        replier: Arc<dyn Replier>,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            bot,
            store,
            replier,
            handler,
            flood_guard: tokio::sync::Mutex::new(()),
        }
    }

    async fn has_role(&self, id: i64, role: &str) -> bool {
        match self
            .store
            .get(ROLE_MODEL, &Filter::new().field("user_id", id).field("role", role))
            .await
        {
            Ok(found) => found.is_some(),
            Err(e) => {
                tracing::warn!(user_id = id, role, error = %e, "Role lookup failed");
                false
            }
        }
    }

    async fn whitelist_active(&self) -> bool {
        self.store
            .count(ROLE_MODEL, &Filter::new().field("role", "whitelisted"))
            .await
            .map(|n| n > 0)
            .unwrap_or(false)
    }

    async fn notify(&self, peer_id: i64, text: &Option<String>) {
        if let Some(text) = text.as_deref().filter(|t| !t.is_empty()) {
            if let Err(e) = self.replier.reply(peer_id, vec![text.to_string()], &[]).await {
                tracing::warn!(peer_id, error = %e, "Failed to send notice");
            }
        }
    }

    /// Update the sender's last-message time. Returns true if the message arrived too soon.
    async fn is_flooding(&self, message: &MessageEvent) -> bool {
        let _guard = self.flood_guard.lock().await;
        let filter = Filter::new().field("user_id", message.user_id);
        let existing = match self.store.get(USER_MODEL, &filter).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!(user_id = message.user_id, error = %e, "User lookup failed");
                return false;
            }
        };

        let Some(mut user) = existing else {
            let mut fields = filter.to_fields();
            fields.insert("message_date".to_string(), json!(message.timestamp));
            if let Err(e) = self.store.create(USER_MODEL, fields).await {
                tracing::warn!(user_id = message.user_id, error = %e, "Failed to create user record");
            }
            return false;
        };

        if message.flags.outbox {
            return false;
        }

        let last = user.get_i64("message_date").unwrap_or(0);
        let interval = self.bot.flood_interval_secs as i64;
        user.set("message_date", message.timestamp);
        if let Err(e) = self.store.update(&user).await {
            tracing::warn!(user_id = message.user_id, error = %e, "Failed to update user record");
        }
        interval > 0 && message.timestamp - last <= interval
    }

    fn strip_prefix(&self, text: &str) -> (String, bool) {
        for prefix in &self.bot.prefixes {
            if let Some(rest) = text.strip_prefix(prefix.as_str()) {
                return (rest.trim_start().to_string(), true);
            }
        }
        (text.to_string(), false)
    }

    /// Run one new message through the filters and the handler
    pub async fn route(&self, message: MessageEvent) -> bool {
        if message.flags.outbox && !self.bot.read_out {
            return false;
        }

        if self.has_role(message.user_id, "blacklisted").await
            || self.has_role(message.peer_id, "blacklisted").await
        {
            tracing::debug!(user_id = message.user_id, "Ignoring blacklisted sender");
            self.notify(message.peer_id, &self.bot.blacklist_message).await;
            return false;
        }

        if self.whitelist_active().await
            && !self.has_role(message.user_id, "whitelisted").await
            && !self.has_role(message.peer_id, "whitelisted").await
        {
            tracing::debug!(user_id = message.user_id, "Ignoring sender outside whitelist");
            self.notify(message.peer_id, &self.bot.whitelist_message).await;
            return false;
        }

        if self.is_flooding(&message).await {
            tracing::debug!(user_id = message.user_id, "Dropping message inside flood interval");
            return false;
        }

        if self.bot.log_messages {
            tracing::info!(
                peer_id = message.peer_id,
                user_id = message.user_id,
                conference = message.is_conference(),
                text = %message.text,
                "Message received"
            );
        }

        let (text, has_prefix) = self.strip_prefix(&message.text);
        let ctx = MessageContext::new(message, text, has_prefix, Arc::clone(&self.replier))
            .forwarding_original(self.bot.forward_messages && !self.bot.read_out);
        let command = ctx.command();

        let handler = Arc::clone(&self.handler);
        let task_ctx = ctx.clone();
        let outcome = tokio::spawn(async move { handler.handle(&task_ctx).await }).await;

        let fault = match outcome {
            Ok(Ok(handled)) => return handled,
            Ok(Err(e)) => e.to_string(),
            Err(join_error) => join_error.to_string(),
        };

        let code = reference_code();
        metrics::record_dispatch_fault();
        tracing::error!(
            reference = %code,
            command = %command,
            peer_id = ctx.message.peer_id,
            user_id = ctx.message.user_id,
            text = %ctx.message.text,
            error = %fault,
            "Command handler failed"
        );
        let notice = format!(
            "{}.\nAn error occurred while running <{}>, please report it to the developer!",
            code, command
        );
        if let Err(e) = ctx.send(&notice).await {
            tracing::warn!(reference = %code, error = %e, "Failed to report handler fault");
        }
        true
    }
}

#[async_trait]
impl Dispatcher for MessageRouter {
    async fn dispatch(&self, event: LongPollEvent) -> bool {
        match event {
            LongPollEvent::NewMessage(message) => self.route(message).await,
            LongPollEvent::Other { code, .. } => {
                tracing::trace!(code, "Ignoring non-message update");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_code_shape() {
        for _ in 0..50 {
            let code = reference_code();
            assert_eq!(code.len(), 5);
            assert!(code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }
}
