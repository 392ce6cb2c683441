use crate::error::BotError;
use serde_json::{json, Value};
use std::sync::OnceLock;

/// Value shape a config key accepts. List types are validated elementwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingType {
    Bool,
    Int,
    Str,
    IntList,
    StrList,
    /// Arbitrary structured value.
    Json,
    /// List of arbitrary structured values.
    JsonList,
}

impl SettingType {
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            SettingType::IntList | SettingType::StrList | SettingType::JsonList
        )
    }

    fn element_valid(&self, value: &Value) -> bool {
        match self {
            SettingType::IntList => value.is_i64() || value.is_u64(),
            SettingType::StrList => value.is_string(),
            SettingType::JsonList => true,
            _ => false,
        }
    }

    /// An explicit null is always accepted: it shadows the guild-0 fallback.
    pub fn validate(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            SettingType::Bool => value.is_boolean(),
            SettingType::Int => value.is_i64() || value.is_u64(),
            SettingType::Str => value.is_string(),
            SettingType::Json => true,
            SettingType::IntList | SettingType::StrList | SettingType::JsonList => value
                .as_array()
                .map(|items| items.iter().all(|v| self.element_valid(v)))
                .unwrap_or(false),
        }
    }
}

/// Immutable declaration of one config key. The descriptor table is the
/// single source of truth for validation and specifier usage.
#[derive(Debug, Clone)]
pub struct KeyDescriptor {
    pub name: &'static str,
    pub ty: SettingType,
    pub has_specifier: bool,
    pub default: Option<Value>,
}

impl KeyDescriptor {
    fn plain(name: &'static str, ty: SettingType) -> Self {
        Self {
            name,
            ty,
            has_specifier: false,
            default: None,
        }
    }

    fn with_default(name: &'static str, ty: SettingType, default: Value) -> Self {
        Self {
            name,
            ty,
            has_specifier: false,
            default: Some(default),
        }
    }

    fn specified(name: &'static str, ty: SettingType) -> Self {
        Self {
            name,
            ty,
            has_specifier: true,
            default: None,
        }
    }
}

static REGISTRY: OnceLock<Vec<KeyDescriptor>> = OnceLock::new();

fn build_registry() -> Vec<KeyDescriptor> {
    use SettingType::*;
    vec![
        // Cooldowns
        KeyDescriptor::with_default("cooldown.exempt.channels", IntList, json!([])),
        KeyDescriptor::plain("cooldown.invocations", Int),
        KeyDescriptor::plain("cooldown.time_sec", Int),
        // Moderation log surface
        KeyDescriptor::with_default("logs.enabled", Bool, json!(false)),
        KeyDescriptor::plain("logs.channel_id", Int),
        // Profiles
        KeyDescriptor::plain("profile.birthday_channel", Int),
        // Role management
        KeyDescriptor::with_default("roles.no_pings", IntList, json!([])),
        KeyDescriptor::with_default("roles.mod_add", IntList, json!([])),
        KeyDescriptor::specified("roles.mod_add.remove_after_hours", Int),
        KeyDescriptor::specified("roles.mod_add.min_messages", Int),
        KeyDescriptor::specified("roles.mod_add.min_days_in_guild", Int),
        KeyDescriptor::specified("roles.mod_add.min_days_active", Int),
        // Text command templates
        KeyDescriptor::specified("text.template", JsonList),
        KeyDescriptor::specified("text.fragment", JsonList),
        // Chat features
        KeyDescriptor::with_default("chat.rb.enabled", Bool, json!(false)),
        KeyDescriptor::with_default("chat.rb.prompts", JsonList, json!([])),
        KeyDescriptor::with_default("chat.ai.enabled", Bool, json!(false)),
        KeyDescriptor::plain("chat.ai.roles", IntList),
        KeyDescriptor::with_default("chat.ai.prompts", StrList, json!([])),
        // Twitch online notifications
        KeyDescriptor::with_default("twitch.online_notif.enabled", Bool, json!(false)),
        KeyDescriptor::plain("twitch.online_notif.channel_id", Int),
        KeyDescriptor::with_default("twitch.online_notif.logins", StrList, json!([])),
        KeyDescriptor::plain("twitch.online_notif.team", Str),
        KeyDescriptor::with_default(
            "twitch.online_notif.title_template",
            Str,
            json!("$channel is now live playing $game!"),
        ),
        KeyDescriptor::plain("twitch.online_notif.image_url", Str),
        // Bluesky post notifications
        KeyDescriptor::with_default("bsky.post_notif.enabled", Bool, json!(false)),
        KeyDescriptor::plain("bsky.post_notif.channel_id", Int),
        KeyDescriptor::with_default("bsky.post_notif.handles", StrList, json!([])),
        KeyDescriptor::with_default(
            "bsky.post_notif.title_template",
            Str,
            json!("New post from $handle: $url"),
        ),
        // YouTube notifications
        KeyDescriptor::with_default("youtube.notif.enabled", Bool, json!(false)),
        KeyDescriptor::plain("youtube.notif.channel_id", Int),
        KeyDescriptor::with_default("youtube.notif.channels", StrList, json!([])),
        KeyDescriptor::with_default(
            "youtube.notif.title_template",
            Str,
            json!("$channel uploaded $title: $url"),
        ),
        // Misc surfaces
        KeyDescriptor::with_default("auto_unarchive.channels", IntList, json!([])),
        KeyDescriptor::plain("report.channel_id", Int),
        KeyDescriptor::plain("report.message", Str),
        // Secrets: one row per tenant, read only through get_secret_all.
        KeyDescriptor::plain("secret.discord.token", Str),
        KeyDescriptor::plain("secret.openai.apikey", Str),
        KeyDescriptor::plain("secret.twitch.client_id_secret", Str),
        KeyDescriptor::plain("secret.bsky.credentials", Str),
        KeyDescriptor::plain("secret.youtube.api_key", Str),
        KeyDescriptor::plain("secret.gemini.apikey", Str),
    ]
}

pub fn registry() -> &'static [KeyDescriptor] {
    REGISTRY.get_or_init(build_registry)
}

/// A dotted key split into its declared base and optional `:specifier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedKey<'a> {
    pub base: &'a str,
    pub specifier: Option<&'a str>,
}

pub fn parse_key(key: &str) -> ParsedKey<'_> {
    match key.split_once(':') {
        Some((base, specifier)) => ParsedKey {
            base,
            specifier: Some(specifier),
        },
        None => ParsedKey {
            base: key,
            specifier: None,
        },
    }
}

/// Resolve a key against the descriptor table, enforcing specifier presence.
pub fn descriptor_for(key: &str) -> Result<&'static KeyDescriptor, BotError> {
    let parsed = parse_key(key);
    let descriptor = registry()
        .iter()
        .find(|d| d.name == parsed.base)
        .ok_or_else(|| {
            BotError::ConfigKeyUsage(format!("unknown config key `{}`", parsed.base))
        })?;

    match (descriptor.has_specifier, parsed.specifier) {
        (true, None) => Err(BotError::ConfigKeyUsage(format!(
            "config key `{}` requires a `:specifier` suffix",
            parsed.base
        ))),
        (true, Some(s)) if s.is_empty() => Err(BotError::ConfigKeyUsage(format!(
            "config key `{}` requires a non-empty specifier",
            parsed.base
        ))),
        (false, Some(_)) => Err(BotError::ConfigKeyUsage(format!(
            "config key `{}` does not take a specifier",
            parsed.base
        ))),
        _ => Ok(descriptor),
    }
}
