use crate::db::{Database, MessageMetrics};
use crate::error::BotError;
use crate::settings::{ClearableCache, SettingsStore};
use crate::tasks::{schedule_remove_role, RemoveRolePayload};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Stable custom-id prefix identifying the persisted self-service role menu.
pub const SELFROLE_CUSTOM_ID: &str = "selfrole:menu";

const TRACKED_ROLE_TTL: Duration = Duration::from_secs(10 * 60);
const TRACKED_ROLE_CAPACITY: usize = 256;

/// Result of the mod-assignable eligibility predicate. Reasons are
/// human-readable and sent ephemerally when assignment is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eligibility {
    pub eligible: bool,
    pub reasons: Vec<String>,
}

fn threshold(settings: &SettingsStore, guild_id: u64, key: &str, role_id: u64) -> Result<u64, BotError> {
    Ok(settings
        .get_u64(guild_id, &format!("{}:{}", key, role_id))?
        .unwrap_or(0))
}

/// Check a candidate against a role's configured thresholds. Each missing
/// config defaults to 0, so an unconfigured role is always assignable.
pub fn check_eligibility(
    settings: &SettingsStore,
    guild_id: u64,
    role_id: u64,
    joined_at: DateTime<Utc>,
    metrics: &MessageMetrics,
    now: DateTime<Utc>,
) -> Result<Eligibility, BotError> {
    let min_days_in_guild = threshold(settings, guild_id, "roles.mod_add.min_days_in_guild", role_id)?;
    let min_messages = threshold(settings, guild_id, "roles.mod_add.min_messages", role_id)?;
    let min_days_active = threshold(settings, guild_id, "roles.mod_add.min_days_active", role_id)?;

    let mut reasons = Vec::new();

    let days_in_guild = now.signed_duration_since(joined_at).num_days().max(0) as u64;
    if days_in_guild < min_days_in_guild {
        reasons.push(format!(
            "has been a member for {} of the required {} days",
            days_in_guild, min_days_in_guild
        ));
    }
    if metrics.message_count < min_messages {
        reasons.push(format!(
            "has sent {} of the required {} messages",
            metrics.message_count, min_messages
        ));
    }
    if metrics.distinct_days < min_days_active {
        reasons.push(format!(
            "has been active on {} of the required {} distinct days",
            metrics.distinct_days, min_days_active
        ));
    }

    Ok(Eligibility {
        eligible: reasons.is_empty(),
        reasons,
    })
}

/// If the role is configured with `remove_after_hours > 0`, schedule a
/// REMOVE_ROLE task; the sweep performs the removal.
pub fn schedule_auto_removal(
    db: &Database,
    settings: &SettingsStore,
    guild_id: u64,
    role_id: u64,
    user_id: u64,
    now: DateTime<Utc>,
) -> Result<Option<i64>, BotError> {
    let hours = threshold(settings, guild_id, "roles.mod_add.remove_after_hours", role_id)?;
    if hours == 0 {
        return Ok(None);
    }
    let id = schedule_remove_role(
        db,
        guild_id,
        &RemoveRolePayload {
            role: role_id,
            user: user_id,
        },
        now + ChronoDuration::hours(hours as i64),
    )
    .map_err(BotError::Other)?;
    Ok(Some(id))
}

/// Per-guild cache of "tracked" roles: mod-addable roles whose thresholds
/// require message metrics. Registered with the settings store so a full
/// invalidation reaches it; otherwise TTL-bounded.
pub struct TrackedRoleCache {
    entries: Mutex<LruCache<u64, (Vec<u64>, Instant)>>,
    ttl: Duration,
}

impl Default for TrackedRoleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackedRoleCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(TRACKED_ROLE_CAPACITY).unwrap(),
            )),
            ttl: TRACKED_ROLE_TTL,
        }
    }

    pub fn tracked_roles(
        &self,
        settings: &SettingsStore,
        guild_id: u64,
    ) -> Result<Vec<u64>, BotError> {
        {
            let mut entries = self.entries.lock().unwrap();
            if let Some((roles, stored_at)) = entries.get(&guild_id) {
                if stored_at.elapsed() <= self.ttl {
                    return Ok(roles.clone());
                }
                entries.pop(&guild_id);
            }
        }

        let mut tracked = Vec::new();
        for role_id in settings.get_u64_list(guild_id, "roles.mod_add")? {
            let min_messages = threshold(settings, guild_id, "roles.mod_add.min_messages", role_id)?;
            let min_days_active =
                threshold(settings, guild_id, "roles.mod_add.min_days_active", role_id)?;
            if min_messages > 0 || min_days_active > 0 {
                tracked.push(role_id);
            }
        }

        self.entries
            .lock()
            .unwrap()
            .put(guild_id, (tracked.clone(), Instant::now()));
        Ok(tracked)
    }
}

impl ClearableCache for TrackedRoleCache {
    fn name(&self) -> &str {
        "tracked-roles"
    }

    fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// The counting upsert is skipped once a user already holds every tracked
/// role; the expensive write only pays off while a threshold can still be
/// crossed.
pub fn should_record_metrics(member_roles: &[u64], tracked_roles: &[u64]) -> bool {
    tracked_roles
        .iter()
        .any(|role| !member_roles.contains(role))
}
