// ABOUTME: CommandHandler seam and the built-in handler answering ping and help.
// ABOUTME: Handlers return Ok(true) when they consumed the message; errors become reference codes.

use super::context::MessageContext;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: &MessageContext) -> Result<bool>;
}

const HELP_TEXT: &str = "Available commands:\n\
    ping - check that the bot is alive\n\
    help - show this list";

/// Handler used when nothing else is plugged in
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinCommands;

#[async_trait]
impl CommandHandler for BuiltinCommands {
    async fn handle(&self, ctx: &MessageContext) -> Result<bool> {
        if !ctx.has_prefix {
            return Ok(false);
        }
        match ctx.command().as_str() {
            "ping" => {
                ctx.answer("pong").await?;
                Ok(true)
            }
            "help" => {
                ctx.answer(HELP_TEXT).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
