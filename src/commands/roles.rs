use crate::commands::{guild_id, reply_ephemeral};
use crate::error::BotError;
use crate::events::MODROLE_CUSTOM_ID_PREFIX;
use crate::roles::SELFROLE_CUSTOM_ID;
use crate::{Context, Error};
use serenity::all::{
    ActionRowComponent, ChannelId, CreateActionRow, CreateMessage, CreateSelectMenu,
    CreateSelectMenuKind, CreateSelectMenuOption, EditMessage, GetMessages, Message, Role, RoleId,
    User,
};

/// Offer a moderator the configured assignable roles for a user.
///
/// The actual assignment happens when the dropdown selection comes back.
#[poise::command(
    context_menu_command = "Assign Role",
    guild_only,
    required_permissions = "MANAGE_ROLES"
)]
pub async fn assign_role(ctx: Context<'_>, user: User) -> Result<(), Error> {
    let guild = guild_id(&ctx)?;
    let role_ids = ctx
        .data()
        .shared
        .settings
        .get_u64_list(guild, "roles.mod_add")?;
    if role_ids.is_empty() {
        return Err(BotError::user(
            "No assignable roles are configured. Set `roles.mod_add` first.",
        )
        .into());
    }

    // Cache refs cannot live across an await; collect the labels first.
    let options: Vec<CreateSelectMenuOption> = {
        let guild_ref = ctx.guild();
        role_ids
            .iter()
            .map(|id| {
                let label = guild_ref
                    .as_ref()
                    .and_then(|g| g.roles.get(&RoleId::new(*id)))
                    .map(|r| r.name.clone())
                    .unwrap_or_else(|| format!("role {}", id));
                CreateSelectMenuOption::new(label, id.to_string())
            })
            .collect()
    };

    let menu = CreateSelectMenu::new(
        format!("{}{}", MODROLE_CUSTOM_ID_PREFIX, user.id.get()),
        CreateSelectMenuKind::String { options },
    )
    .placeholder("Pick a role to assign")
    .min_values(1)
    .max_values(1);

    ctx.send(
        poise::CreateReply::default()
            .content(format!("Assign a role to <@{}>:", user.id.get()))
            .components(vec![CreateActionRow::SelectMenu(menu)])
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

/// Manage the self-service role menu of the current channel.
///
/// The posted menu message is the only storage: its option list is read
/// back and rewritten on every change.
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "MANAGE_ROLES",
    subcommands("add", "remove")
)]
pub async fn selfrole(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Offer a role in this channel's menu, creating the menu if needed.
#[poise::command(slash_command)]
async fn add(
    ctx: Context<'_>,
    #[description = "Role members may give themselves"] role: Role,
    #[description = "Label shown in the menu, defaults to the role name"] label: Option<String>,
) -> Result<(), Error> {
    let channel = ctx.channel_id();
    let existing = find_menu_message(&ctx, channel).await?;
    let mut options = existing.as_ref().map(menu_options).unwrap_or_default();

    let value = role.id.get().to_string();
    if options.iter().any(|(_, v)| *v == value) {
        return Err(BotError::user(format!("{} is already offered here.", role.name)).into());
    }
    options.push((label.unwrap_or_else(|| role.name.clone()), value));

    let row = menu_row(&options);
    match existing {
        Some(mut message) => {
            message
                .edit(ctx, EditMessage::new().components(vec![row]))
                .await?;
        }
        None => {
            let builder = CreateMessage::new()
                .content("Pick a role below to give it to yourself; pick it again to remove it.")
                .components(vec![row]);
            channel.send_message(ctx, builder).await?;
        }
    }
    reply_ephemeral(ctx, format!("✅ {} is now self-assignable here.", role.name)).await
}

/// Stop offering a role; the menu message disappears with its last option.
#[poise::command(slash_command)]
async fn remove(
    ctx: Context<'_>,
    #[description = "Role to remove from the menu"] role: Role,
) -> Result<(), Error> {
    let channel = ctx.channel_id();
    let Some(mut message) = find_menu_message(&ctx, channel).await? else {
        return Err(BotError::user("There is no role menu in this channel.").into());
    };

    let mut options = menu_options(&message);
    let value = role.id.get().to_string();
    let before = options.len();
    options.retain(|(_, v)| *v != value);
    if options.len() == before {
        return Err(BotError::user(format!("{} is not offered here.", role.name)).into());
    }

    if options.is_empty() {
        message.delete(ctx).await?;
    } else {
        message
            .edit(ctx, EditMessage::new().components(vec![menu_row(&options)]))
            .await?;
    }
    reply_ephemeral(ctx, format!("🗑️ {} removed from the menu.", role.name)).await
}

/// The menu message is the newest bot-authored message in the channel that
/// carries the self-role custom id.
async fn find_menu_message(
    ctx: &Context<'_>,
    channel: ChannelId,
) -> Result<Option<Message>, serenity::Error> {
    let bot_id = ctx.framework().bot_id;
    let messages = channel
        .messages(ctx.serenity_context(), GetMessages::new().limit(100))
        .await?;
    Ok(messages
        .into_iter()
        .find(|m| m.author.id == bot_id && !menu_options(m).is_empty()))
}

fn menu_options(message: &Message) -> Vec<(String, String)> {
    for row in &message.components {
        for component in &row.components {
            if let ActionRowComponent::SelectMenu(menu) = component {
                if menu.custom_id.as_deref() == Some(SELFROLE_CUSTOM_ID) {
                    return menu
                        .options
                        .iter()
                        .map(|o| (o.label.clone(), o.value.clone()))
                        .collect();
                }
            }
        }
    }
    Vec::new()
}

fn menu_row(options: &[(String, String)]) -> CreateActionRow {
    let options = options
        .iter()
        .map(|(label, value)| CreateSelectMenuOption::new(label, value))
        .collect();
    let menu = CreateSelectMenu::new(SELFROLE_CUSTOM_ID, CreateSelectMenuKind::String { options })
        .placeholder("Pick a role")
        .min_values(1)
        .max_values(1);
    CreateActionRow::SelectMenu(menu)
}
