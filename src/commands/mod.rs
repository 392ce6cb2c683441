pub mod admin;
pub mod reminder;
pub mod roles;

use crate::error::BotError;
use crate::Context;

/// Commands below are all `guild_only`, but the id still arrives as an
/// `Option`; this keeps the unwrapping in one place.
pub(crate) fn guild_id(ctx: &Context<'_>) -> Result<u64, BotError> {
    ctx.guild_id()
        .map(|g| g.get())
        .ok_or_else(|| BotError::user("This command only works in a server."))
}

pub(crate) async fn reply_ephemeral(ctx: Context<'_>, text: impl Into<String>) -> Result<(), crate::Error> {
    ctx.send(
        poise::CreateReply::default()
            .content(text.into())
            .ephemeral(true),
    )
    .await?;
    Ok(())
}
