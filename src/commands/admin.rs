use crate::commands::{guild_id, reply_ephemeral};
use crate::config::DISCORD_MESSAGE_LIMIT;
use crate::{Context, Error};
use serde_json::Value;

/// Guild administration.
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands("config")
)]
pub async fn admin(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Guild configuration management.
#[poise::command(
    slash_command,
    subcommands("get", "set", "append", "unset", "list", "reload")
)]
async fn config(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Values typed into the `value` option are JSON when they parse as JSON;
/// anything else is taken as a bare string so admins can skip the quotes.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Show a config value, including the inherited or built-in fallback.
#[poise::command(slash_command)]
async fn get(
    ctx: Context<'_>,
    #[description = "Config key, with `:specifier` where the key requires one"] key: String,
) -> Result<(), Error> {
    let guild = guild_id(&ctx)?;
    let text = match ctx.data().shared.settings.get(guild, &key)? {
        Some(value) => format!("`{}` = `{}`", key, value),
        None => format!("`{}` is not set.", key),
    };
    reply_ephemeral(ctx, text).await
}

/// Set a config value for this guild.
#[poise::command(slash_command)]
async fn set(
    ctx: Context<'_>,
    #[description = "Config key, with `:specifier` where the key requires one"] key: String,
    #[description = "New value (JSON, or a bare string)"] value: String,
) -> Result<(), Error> {
    let guild = guild_id(&ctx)?;
    let value = parse_value(&value);
    ctx.data().shared.settings.set(guild, &key, &value)?;
    reply_ephemeral(ctx, format!("✅ `{}` set to `{}`.", key, value)).await
}

/// Append an element to a list-typed config key.
#[poise::command(slash_command)]
async fn append(
    ctx: Context<'_>,
    #[description = "List-typed config key"] key: String,
    #[description = "Element to append (JSON, or a bare string)"] element: String,
) -> Result<(), Error> {
    let guild = guild_id(&ctx)?;
    let element = parse_value(&element);
    ctx.data().shared.settings.append(guild, &key, element)?;
    let current = ctx.data().shared.settings.get(guild, &key)?;
    reply_ephemeral(
        ctx,
        format!(
            "✅ `{}` is now `{}`.",
            key,
            current.unwrap_or(Value::Null)
        ),
    )
    .await
}

/// Remove this guild's value for a key, falling back to defaults.
#[poise::command(slash_command)]
async fn unset(
    ctx: Context<'_>,
    #[description = "Config key to clear"] key: String,
) -> Result<(), Error> {
    let guild = guild_id(&ctx)?;
    let text = if ctx.data().shared.settings.unset(guild, &key)? {
        format!("🗑️ `{}` cleared.", key)
    } else {
        format!("`{}` was not set for this server.", key)
    };
    reply_ephemeral(ctx, text).await
}

/// List every key explicitly set for this guild.
#[poise::command(slash_command)]
async fn list(ctx: Context<'_>) -> Result<(), Error> {
    let guild = guild_id(&ctx)?;
    let entries = ctx.data().shared.settings.list(guild)?;
    if entries.is_empty() {
        return reply_ephemeral(ctx, "No config values are set for this server.").await;
    }

    let mut text = String::from("Config values set for this server:\n");
    for (key, value) in entries {
        let line = format!("- `{}` = `{}`\n", key, value);
        if text.len() + line.len() > DISCORD_MESSAGE_LIMIT {
            text.push_str("- ...");
            break;
        }
        text.push_str(&line);
    }
    reply_ephemeral(ctx, text).await
}

/// Drop all cached config so edits made out of band take effect.
#[poise::command(slash_command)]
async fn reload(ctx: Context<'_>) -> Result<(), Error> {
    ctx.data().shared.settings.invalidate_all();
    reply_ephemeral(ctx, "♻️ Config caches cleared.").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_value_json_and_bare_strings() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("[1, 2]"), json!([1, 2]));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("\"quoted\""), json!("quoted"));
        // Not valid JSON: taken literally.
        assert_eq!(parse_value("general"), json!("general"));
    }
}
