use crate::audit::AuditActor;
use crate::plugin::EventFuture;
use crate::roles::{self, SELFROLE_CUSTOM_ID};
use crate::Data;
use chrono::Utc;
use serenity::all::{
    ChannelId, ComponentInteraction, ComponentInteractionDataKind, CreateInteractionResponse,
    CreateInteractionResponseMessage, FullEvent, Interaction, RoleId, UserId,
};
use serenity::client::Context as SerenityContext;
use serenity::model::guild::audit_log::{Action, MemberAction, MessageAction};
use tracing::{debug, error, warn};

/// Custom-id prefix of the ephemeral role dropdown shown to moderators.
pub const MODROLE_CUSTOM_ID_PREFIX: &str = "modrole:";

/// Listener of the role plugin: harvests message metrics for threshold
/// tracking and services the two role select menus.
pub fn roles_listener<'a>(
    ctx: &'a SerenityContext,
    event: &'a FullEvent,
    data: &'a Data,
) -> EventFuture<'a> {
    Box::pin(async move {
        match event {
            FullEvent::Message { new_message } => {
                harvest_metrics(data, new_message).await;
            }
            FullEvent::InteractionCreate {
                interaction: Interaction::Component(component),
            } => {
                if component.data.custom_id == SELFROLE_CUSTOM_ID {
                    if let Err(e) = handle_selfrole(ctx, component).await {
                        error!("Self-role interaction failed: {}", e);
                    }
                } else if let Some(target) = component
                    .data
                    .custom_id
                    .strip_prefix(MODROLE_CUSTOM_ID_PREFIX)
                {
                    if let Err(e) = handle_modrole(ctx, data, component, target).await {
                        error!("Mod role interaction failed: {}", e);
                    }
                }
            }
            _ => {}
        }
    })
}

async fn harvest_metrics(data: &Data, message: &serenity::all::Message) {
    if message.author.bot {
        return;
    }
    let Some(guild_id) = message.guild_id else {
        return;
    };
    if !data.serves_guild(guild_id.get()) {
        return;
    }

    let tracked = match data
        .shared
        .tracked_roles
        .tracked_roles(&data.shared.settings, guild_id.get())
    {
        Ok(tracked) => tracked,
        Err(e) => {
            warn!("Tracked role lookup failed for guild {}: {}", guild_id, e);
            return;
        }
    };
    if tracked.is_empty() {
        return;
    }

    let member_roles: Vec<u64> = message
        .member
        .as_ref()
        .map(|m| m.roles.iter().map(|r| r.get()).collect())
        .unwrap_or_default();
    if !roles::should_record_metrics(&member_roles, &tracked) {
        return;
    }

    let (guild, user) = (guild_id.get(), message.author.id.get());
    if let Err(e) = data
        .shared
        .db
        .run_blocking(move |db| db.record_message(guild, user, Utc::now()))
        .await
    {
        error!("Recording message metric failed: {}", e);
    }
}

async fn handle_selfrole(
    ctx: &SerenityContext,
    component: &ComponentInteraction,
) -> anyhow::Result<()> {
    let Some(member) = &component.member else {
        return respond_ephemeral(ctx, component, "This menu only works inside a server.").await;
    };
    let Some(role_id) = selected_value(component).and_then(|v| v.parse::<u64>().ok()) else {
        return respond_ephemeral(ctx, component, "Nothing selected.").await;
    };

    let role = RoleId::new(role_id);
    if member.roles.contains(&role) {
        member.remove_role(&ctx.http, role).await?;
        respond_ephemeral(ctx, component, &format!("Removed <@&{}> from you. 👋", role_id)).await
    } else {
        member.add_role(&ctx.http, role).await?;
        respond_ephemeral(ctx, component, &format!("Gave you <@&{}>. ✅", role_id)).await
    }
}

async fn handle_modrole(
    ctx: &SerenityContext,
    data: &Data,
    component: &ComponentInteraction,
    target: &str,
) -> anyhow::Result<()> {
    let Some(guild_id) = component.guild_id else {
        return respond_ephemeral(ctx, component, "This menu only works inside a server.").await;
    };
    let Ok(user_id) = target.parse::<u64>() else {
        return respond_ephemeral(ctx, component, "This menu has expired.").await;
    };
    let Some(role_id) = selected_value(component).and_then(|v| v.parse::<u64>().ok()) else {
        return respond_ephemeral(ctx, component, "Nothing selected.").await;
    };

    let member = guild_id.member(ctx, UserId::new(user_id)).await?;
    let joined_at = member
        .joined_at
        .and_then(|ts| chrono::DateTime::from_timestamp(ts.unix_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let (guild, user) = (guild_id.get(), user_id);
    let metrics = data
        .shared
        .db
        .run_blocking(move |db| db.get_metrics(guild, user))
        .await?;

    let eligibility = roles::check_eligibility(
        &data.shared.settings,
        guild,
        role_id,
        joined_at,
        &metrics,
        Utc::now(),
    )?;
    if !eligibility.eligible {
        let text = format!(
            "<@{}> does not qualify for <@&{}> yet:\n- {}",
            user_id,
            role_id,
            eligibility.reasons.join("\n- ")
        );
        return respond_ephemeral(ctx, component, &text).await;
    }

    member.add_role(&ctx.http, RoleId::new(role_id)).await?;
    let scheduled = roles::schedule_auto_removal(
        &data.shared.db,
        &data.shared.settings,
        guild,
        role_id,
        user_id,
        Utc::now(),
    )?;

    let text = match scheduled {
        Some(_) => format!(
            "Gave <@{}> the <@&{}> role. It will be removed automatically. ✅",
            user_id, role_id
        ),
        None => format!("Gave <@{}> the <@&{}> role. ✅", user_id, role_id),
    };
    respond_ephemeral(ctx, component, &text).await
}

fn selected_value(component: &ComponentInteraction) -> Option<&str> {
    match &component.data.kind {
        ComponentInteractionDataKind::StringSelect { values } => {
            values.first().map(String::as_str)
        }
        _ => None,
    }
}

async fn respond_ephemeral(
    ctx: &SerenityContext,
    component: &ComponentInteraction,
    text: &str,
) -> anyhow::Result<()> {
    let message = CreateInteractionResponseMessage::new()
        .content(text)
        .ephemeral(true);
    component
        .create_response(&ctx.http, CreateInteractionResponse::Message(message))
        .await?;
    Ok(())
}

/// Listener of the audit plugin: caches moderator attribution from audit log
/// entries and, when a delete or ban event arrives, waits out the grace
/// period before posting the correlated line to the guild's log channel.
pub fn audit_listener<'a>(
    ctx: &'a SerenityContext,
    event: &'a FullEvent,
    data: &'a Data,
) -> EventFuture<'a> {
    Box::pin(async move {
        match event {
            FullEvent::GuildAuditLogEntryCreate { entry, guild_id } => {
                if !data.serves_guild(guild_id.get()) {
                    return;
                }
                let actor = AuditActor {
                    actor_id: entry.user_id.get(),
                    reason: entry.reason.clone(),
                };
                match &entry.action {
                    Action::Message(MessageAction::Delete) => {
                        let Some(channel_id) = entry.options.as_ref().and_then(|o| o.channel_id)
                        else {
                            return;
                        };
                        let Some(author_id) = entry.target_id else {
                            return;
                        };
                        data.shared.audit.record_delete_audit(
                            guild_id.get(),
                            channel_id.get(),
                            author_id.get(),
                            actor,
                        );
                    }
                    Action::Member(MemberAction::BanAdd) => {
                        let Some(user_id) = entry.target_id else {
                            return;
                        };
                        data.shared
                            .audit
                            .record_ban_audit(guild_id.get(), user_id.get(), actor);
                    }
                    _ => {}
                }
            }
            FullEvent::MessageDelete {
                channel_id,
                deleted_message_id,
                guild_id: Some(guild_id),
            } => {
                if !data.serves_guild(guild_id.get()) {
                    return;
                }
                // The gateway delete carries no author; the message cache is
                // the only place it might still be known.
                let author_id = ctx
                    .cache
                    .message(*channel_id, *deleted_message_id)
                    .map(|m| m.author.id.get());

                // The correlation key needs the author, so an uncached
                // message is logged without actor details.
                let actor = match author_id {
                    Some(author_id) => {
                        data.shared
                            .audit
                            .correlate_delete(guild_id.get(), channel_id.get(), author_id)
                            .await
                    }
                    None => {
                        debug!(
                            "Deleted message {} in guild {} was not cached",
                            deleted_message_id, guild_id
                        );
                        None
                    }
                };
                let line = delete_log_line(channel_id.get(), author_id, actor.as_ref());
                post_guild_log(ctx, data, guild_id.get(), &line).await;
            }
            FullEvent::GuildBanAddition {
                guild_id,
                banned_user,
            } => {
                if !data.serves_guild(guild_id.get()) {
                    return;
                }
                let actor = data
                    .shared
                    .audit
                    .correlate_ban(guild_id.get(), banned_user.id.get())
                    .await;
                let line = match actor {
                    Some(actor) => format!(
                        "🔨 {} was banned by <@{}>{}",
                        banned_user.name,
                        actor.actor_id,
                        reason_suffix(&actor)
                    ),
                    None => format!("🔨 {} was banned (moderator unknown)", banned_user.name),
                };
                post_guild_log(ctx, data, guild_id.get(), &line).await;
            }
            _ => {}
        }
    })
}

fn delete_log_line(channel_id: u64, author_id: Option<u64>, actor: Option<&AuditActor>) -> String {
    let author = match author_id {
        Some(id) => format!("<@{}>", id),
        None => "an uncached author".to_string(),
    };
    match actor {
        Some(actor) => format!(
            "🗑️ Message from {} in <#{}> was deleted by <@{}>{}",
            author,
            channel_id,
            actor.actor_id,
            reason_suffix(actor)
        ),
        None => format!(
            "🗑️ Message from {} in <#{}> was deleted (author or unknown moderator)",
            author, channel_id
        ),
    }
}

fn reason_suffix(actor: &AuditActor) -> String {
    match &actor.reason {
        Some(reason) => format!(" (reason: {})", reason),
        None => String::new(),
    }
}

/// Post a moderation line to the guild's configured log channel, if logging
/// is enabled there.
async fn post_guild_log(ctx: &SerenityContext, data: &Data, guild_id: u64, text: &str) {
    let settings = &data.shared.settings;
    let enabled = match settings.get_bool(guild_id, "logs.enabled") {
        Ok(enabled) => enabled,
        Err(e) => {
            warn!("Log routing lookup failed for guild {}: {}", guild_id, e);
            return;
        }
    };
    if !enabled {
        return;
    }
    let channel = match settings.get_u64(guild_id, "logs.channel_id") {
        Ok(Some(channel)) => channel,
        Ok(None) => return,
        Err(e) => {
            warn!("Log channel lookup failed for guild {}: {}", guild_id, e);
            return;
        }
    };
    if let Err(e) = ChannelId::new(channel).say(&ctx.http, text).await {
        error!("Posting to log channel of guild {} failed: {}", guild_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_line_with_correlated_actor() {
        let actor = AuditActor {
            actor_id: 99,
            reason: Some("spam".to_string()),
        };
        let line = delete_log_line(5, Some(7), Some(&actor));
        assert_eq!(
            line,
            "🗑️ Message from <@7> in <#5> was deleted by <@99> (reason: spam)"
        );
    }

    #[test]
    fn test_delete_line_without_actor() {
        let line = delete_log_line(5, Some(7), None);
        assert!(line.contains("<@7>"));
        assert!(line.contains("unknown moderator"));
    }

    // An uncached message still produces a log line, just without names.
    #[test]
    fn test_delete_line_for_uncached_author() {
        let line = delete_log_line(5, None, None);
        assert_eq!(
            line,
            "🗑️ Message from an uncached author in <#5> was deleted (author or unknown moderator)"
        );
    }
}
