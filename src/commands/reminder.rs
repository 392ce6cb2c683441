use crate::commands::{guild_id, reply_ephemeral};
use crate::db::{parse_sqlite_utc, KIND_REMINDER};
use crate::error::BotError;
use crate::tasks::{schedule_reminder, ReminderPayload};
use crate::{Context, Error};
use chrono::Utc;

const MAX_REMINDER_DAYS: i64 = 365;

/// Personal reminders, delivered through the scheduled task queue.
#[poise::command(slash_command, guild_only, subcommands("set", "list", "cancel"))]
pub async fn reminder(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Set a reminder, e.g. `/reminder set 2h30m water the plants`.
#[poise::command(slash_command)]
async fn set(
    ctx: Context<'_>,
    #[description = "When, like `20m`, `2h30m` or `3days`"] duration: String,
    #[description = "What to be reminded of"] reason: String,
) -> Result<(), Error> {
    let guild = guild_id(&ctx)?;
    let delay = humantime::parse_duration(&duration)
        .map_err(|_| BotError::user(format!("I can't parse `{}` as a duration.", duration)))?;
    let delay = chrono::Duration::from_std(delay)
        .map_err(|_| BotError::user("That duration is too long."))?;
    if delay > chrono::Duration::days(MAX_REMINDER_DAYS) {
        return Err(BotError::user(format!(
            "Reminders can be at most {} days out.",
            MAX_REMINDER_DAYS
        ))
        .into());
    }

    let due = Utc::now() + delay;
    let payload = ReminderPayload {
        channel: ctx.channel_id().get(),
        user: ctx.author().id.get(),
        reason: reason.clone(),
    };
    let id = ctx
        .data()
        .shared
        .db
        .run_blocking(move |db| schedule_reminder(db, guild, &payload, due))
        .await?;

    reply_ephemeral(
        ctx,
        format!(
            "⏰ Reminder #{} set for <t:{}:f>: {}",
            id,
            due.timestamp(),
            reason
        ),
    )
    .await
}

/// List your pending reminders in this server.
#[poise::command(slash_command)]
async fn list(ctx: Context<'_>) -> Result<(), Error> {
    let guild = guild_id(&ctx)?;
    let author = ctx.author().id.get();

    let rows = ctx
        .data()
        .shared
        .db
        .run_blocking(move |db| db.list_tasks(guild, KIND_REMINDER))
        .await?;

    let mut lines = Vec::new();
    for row in rows {
        let Ok(payload) = serde_json::from_str::<ReminderPayload>(&row.payload) else {
            continue;
        };
        if payload.user != author {
            continue;
        }
        let due = parse_sqlite_utc(&row.process_after)
            .map(|dt| format!("<t:{}:f>", dt.timestamp()))
            .unwrap_or_else(|| row.process_after.clone());
        lines.push(format!("- #{} at {}: {}", row.id, due, payload.reason));
    }

    if lines.is_empty() {
        return reply_ephemeral(ctx, "You have no pending reminders here.").await;
    }
    reply_ephemeral(ctx, format!("Your reminders:\n{}", lines.join("\n"))).await
}

/// Cancel one of your reminders by its number.
#[poise::command(slash_command)]
async fn cancel(
    ctx: Context<'_>,
    #[description = "Reminder number from `/reminder list`"] id: i64,
) -> Result<(), Error> {
    let guild = guild_id(&ctx)?;
    let author = ctx.author().id.get();

    let row = ctx
        .data()
        .shared
        .db
        .run_blocking(move |db| db.get_task(id))
        .await?
        .filter(|row| row.guild_id == guild && row.kind == KIND_REMINDER);
    let owned = row
        .as_ref()
        .and_then(|row| serde_json::from_str::<ReminderPayload>(&row.payload).ok())
        .map(|payload| payload.user == author)
        .unwrap_or(false);
    if !owned {
        return Err(BotError::user(format!("Reminder #{} is not yours or no longer exists.", id)).into());
    }

    ctx.data()
        .shared
        .db
        .run_blocking(move |db| db.delete_task(id))
        .await?;
    reply_ephemeral(ctx, format!("🗑️ Reminder #{} cancelled.", id)).await
}
