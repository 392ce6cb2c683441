use crate::error::BotError;
use crate::settings::SettingsStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// How a cooldown counter is partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CooldownBucket {
    Guild,
    GuildUser,
}

/// Per-command cooldown declaration: `count` invocations per `interval_secs`.
#[derive(Debug, Clone, Copy)]
pub struct CooldownSpec {
    pub count: u32,
    pub interval_secs: u64,
    pub bucket: CooldownBucket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownVerdict {
    pub allowed: bool,
    /// Whole seconds until a token is available (ceiling), 0 when allowed.
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    guild_id: u64,
    user_id: Option<u64>,
    command_id: String,
}

struct BucketState {
    tokens: f64,
    updated: Instant,
}

/// Token-bucket state refills continuously at `count / interval` per second,
/// capped at `count`. In-memory only; restarts clear all buckets.
fn advance(tokens: f64, elapsed_secs: f64, spec: &CooldownSpec) -> f64 {
    let rate = spec.count as f64 / spec.interval_secs as f64;
    (tokens + elapsed_secs * rate).min(spec.count as f64)
}

fn consume(tokens: &mut f64, spec: &CooldownSpec) -> CooldownVerdict {
    if *tokens >= 1.0 {
        *tokens -= 1.0;
        CooldownVerdict {
            allowed: true,
            retry_after_secs: 0,
        }
    } else {
        let rate = spec.count as f64 / spec.interval_secs as f64;
        let wait = (1.0 - *tokens) / rate;
        CooldownVerdict {
            allowed: false,
            retry_after_secs: wait.ceil() as u64,
        }
    }
}

/// Per-(guild,user,command) rate limiter with per-guild exempt channels.
/// Process-wide so every client shares one set of buckets.
pub struct CooldownManager {
    settings: Arc<SettingsStore>,
    buckets: Mutex<HashMap<BucketKey, BucketState>>,
}

impl CooldownManager {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self {
            settings,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Check the bucket and consume a token on success. Invocations from a
    /// channel listed in `cooldown.exempt.channels` are always allowed and
    /// consume nothing.
    pub fn check_and_record(
        &self,
        guild_id: u64,
        user_id: u64,
        channel_id: u64,
        command_id: &str,
        spec: &CooldownSpec,
    ) -> Result<CooldownVerdict, BotError> {
        let exempt = self
            .settings
            .get_u64_list(guild_id, "cooldown.exempt.channels")?;
        if exempt.contains(&channel_id) {
            return Ok(CooldownVerdict {
                allowed: true,
                retry_after_secs: 0,
            });
        }

        let spec = self.effective_spec(guild_id, spec)?;
        let key = BucketKey {
            guild_id,
            user_id: match spec.bucket {
                CooldownBucket::Guild => None,
                CooldownBucket::GuildUser => Some(user_id),
            },
            command_id: command_id.to_string(),
        };

        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let state = buckets.entry(key).or_insert(BucketState {
            tokens: spec.count as f64,
            updated: now,
        });
        state.tokens = advance(
            state.tokens,
            now.duration_since(state.updated).as_secs_f64(),
            &spec,
        );
        state.updated = now;
        Ok(consume(&mut state.tokens, &spec))
    }

    /// Like `check_and_record` but maps a denial to `BotError::Cooldown` so
    /// command handlers can use `?`.
    pub fn enforce(
        &self,
        guild_id: u64,
        user_id: u64,
        channel_id: u64,
        command_id: &str,
        spec: &CooldownSpec,
    ) -> Result<(), BotError> {
        let verdict = self.check_and_record(guild_id, user_id, channel_id, command_id, spec)?;
        if verdict.allowed {
            Ok(())
        } else {
            Err(BotError::Cooldown {
                retry_after_secs: verdict.retry_after_secs,
            })
        }
    }

    /// Guild admins can override the declared count/interval through
    /// `cooldown.invocations` / `cooldown.time_sec`.
    fn effective_spec(&self, guild_id: u64, declared: &CooldownSpec) -> Result<CooldownSpec, BotError> {
        let count = self
            .settings
            .get_u64(guild_id, "cooldown.invocations")?
            .filter(|c| *c > 0)
            .map(|c| c as u32)
            .unwrap_or(declared.count);
        let interval_secs = self
            .settings
            .get_u64(guild_id, "cooldown.time_sec")?
            .filter(|s| *s > 0)
            .unwrap_or(declared.interval_secs);
        Ok(CooldownSpec {
            count,
            interval_secs,
            bucket: declared.bucket,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    fn manager() -> CooldownManager {
        let db = Database::new(":memory:").unwrap();
        db.execute_init().unwrap();
        CooldownManager::new(Arc::new(SettingsStore::new(db)))
    }

    fn spec_1_per_60() -> CooldownSpec {
        CooldownSpec {
            count: 1,
            interval_secs: 60,
            bucket: CooldownBucket::GuildUser,
        }
    }

    #[test]
    fn test_allow_then_deny() {
        let m = manager();
        let spec = spec_1_per_60();
        let first = m.check_and_record(1, 7, 556, "hug", &spec).unwrap();
        assert!(first.allowed);

        let second = m.check_and_record(1, 7, 556, "hug", &spec).unwrap();
        assert!(!second.allowed);
        // A full token must refill: just under one interval remains.
        assert!(second.retry_after_secs >= 59 && second.retry_after_secs <= 60);
    }

    #[test]
    fn test_exempt_channel_consumes_nothing() {
        let m = manager();
        m.settings
            .set(1, "cooldown.exempt.channels", &json!([555]))
            .unwrap();
        let spec = spec_1_per_60();

        // Unlimited in the exempt channel.
        assert!(m.check_and_record(1, 7, 555, "hug", &spec).unwrap().allowed);
        assert!(m.check_and_record(1, 7, 555, "hug", &spec).unwrap().allowed);

        // The bucket is untouched: one invocation elsewhere still succeeds.
        assert!(m.check_and_record(1, 7, 556, "hug", &spec).unwrap().allowed);
        assert!(!m.check_and_record(1, 7, 556, "hug", &spec).unwrap().allowed);
    }

    #[test]
    fn test_buckets_are_partitioned() {
        let m = manager();
        let spec = spec_1_per_60();
        assert!(m.check_and_record(1, 7, 1, "hug", &spec).unwrap().allowed);
        // Different user, different command, different guild: all fresh.
        assert!(m.check_and_record(1, 8, 1, "hug", &spec).unwrap().allowed);
        assert!(m.check_and_record(1, 7, 1, "pat", &spec).unwrap().allowed);
        assert!(m.check_and_record(2, 7, 1, "hug", &spec).unwrap().allowed);
    }

    #[test]
    fn test_guild_bucket_shared_across_users() {
        let m = manager();
        let spec = CooldownSpec {
            count: 1,
            interval_secs: 60,
            bucket: CooldownBucket::Guild,
        };
        assert!(m.check_and_record(1, 7, 1, "vote", &spec).unwrap().allowed);
        assert!(!m.check_and_record(1, 8, 1, "vote", &spec).unwrap().allowed);
    }

    #[test]
    fn test_guild_override_of_declared_spec() {
        let m = manager();
        m.settings.set(1, "cooldown.invocations", &json!(3)).unwrap();
        let spec = spec_1_per_60();
        assert!(m.check_and_record(1, 7, 1, "hug", &spec).unwrap().allowed);
        assert!(m.check_and_record(1, 7, 1, "hug", &spec).unwrap().allowed);
        assert!(m.check_and_record(1, 7, 1, "hug", &spec).unwrap().allowed);
        assert!(!m.check_and_record(1, 7, 1, "hug", &spec).unwrap().allowed);
    }

    #[test]
    fn test_enforce_maps_to_cooldown_error() {
        let m = manager();
        let spec = spec_1_per_60();
        m.enforce(1, 7, 1, "hug", &spec).unwrap();
        let err = m.enforce(1, 7, 1, "hug", &spec).unwrap_err();
        assert!(matches!(err, BotError::Cooldown { .. }));
    }

    #[test]
    fn test_refill_arithmetic() {
        let spec = CooldownSpec {
            count: 2,
            interval_secs: 10,
            bucket: CooldownBucket::GuildUser,
        };
        // Rate is 0.2 tokens/sec, capped at 2.
        assert!((advance(0.0, 5.0, &spec) - 1.0).abs() < 1e-9);
        assert!((advance(1.5, 100.0, &spec) - 2.0).abs() < 1e-9);

        let mut tokens = 0.5;
        let verdict = consume(&mut tokens, &spec);
        assert!(!verdict.allowed);
        // 0.5 tokens short at 0.2/sec -> 2.5s, ceiled to 3.
        assert_eq!(verdict.retry_after_secs, 3);

        let mut tokens = 1.0;
        let verdict = consume(&mut tokens, &spec);
        assert!(verdict.allowed);
        assert!(tokens.abs() < 1e-9);
    }
}
