pub mod keys;

use crate::db::Database;
use crate::error::BotError;
use lru::LruCache;
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub use keys::{descriptor_for, parse_key, KeyDescriptor, SettingType};

const CACHE_CAPACITY: usize = 1024;
const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// A downstream cache of derived config that can be flushed when the whole
/// store is invalidated. TTL-bounded, so mild staleness after a missed
/// targeted invalidation is tolerated.
pub trait ClearableCache: Send + Sync {
    fn name(&self) -> &str;
    fn clear(&self);
}

/// Cached result of one row lookup. `row: None` records a confirmed miss so
/// the fallback path is also cached.
struct CachedRow {
    row: Option<Value>,
    stored_at: Instant,
}

/// Typed, hierarchical, specifier-keyed configuration store with a
/// read-through LRU over the `config_entries` table. Process-wide: every
/// client shares one instance.
pub struct SettingsStore {
    db: Database,
    cache: Mutex<LruCache<(u64, String), CachedRow>>,
    derived: Mutex<Vec<Arc<dyn ClearableCache>>>,
    ttl: Duration,
}

impl SettingsStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
            derived: Mutex::new(Vec::new()),
            ttl: CACHE_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(db: Database, ttl: Duration) -> Self {
        let mut store = Self::new(db);
        store.ttl = ttl;
        store
    }

    /// Read one (guild, key) row through the cache. Distinguishes "no row"
    /// from "row holding null".
    fn cached_row(&self, guild_id: u64, key: &str) -> Result<Option<Value>, BotError> {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&(guild_id, key.to_string())) {
                if entry.stored_at.elapsed() <= self.ttl {
                    return Ok(entry.row.clone());
                }
                cache.pop(&(guild_id, key.to_string()));
            }
        }

        let raw = self.db.get_config(guild_id, key).map_err(BotError::Other)?;
        let row = match raw {
            Some(text) => Some(
                serde_json::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("corrupt config value at ({guild_id}, {key}): {e}"))?,
            ),
            None => None,
        };

        let mut cache = self.cache.lock().unwrap();
        cache.put(
            (guild_id, key.to_string()),
            CachedRow {
                row: row.clone(),
                stored_at: Instant::now(),
            },
        );
        Ok(row)
    }

    /// `get(guild, key)`: guild row, else guild-0 fallback, else the
    /// descriptor default. An explicit null row shadows the fallback and
    /// reads as unset.
    pub fn get(&self, guild_id: u64, key: &str) -> Result<Option<Value>, BotError> {
        let descriptor = descriptor_for(key)?;

        match self.cached_row(guild_id, key)? {
            Some(Value::Null) => return Ok(None),
            Some(value) => return Ok(Some(value)),
            None => {}
        }
        if guild_id != 0 {
            match self.cached_row(0, key)? {
                Some(Value::Null) => return Ok(None),
                Some(value) => return Ok(Some(value)),
                None => {}
            }
        }
        Ok(descriptor.default.clone())
    }

    pub fn set(&self, guild_id: u64, key: &str, value: &Value) -> Result<(), BotError> {
        let descriptor = descriptor_for(key)?;
        if !descriptor.ty.validate(value) {
            return Err(BotError::ConfigKeyUsage(format!(
                "value for `{}` does not match its declared type {:?}",
                key, descriptor.ty
            )));
        }
        let text = serde_json::to_string(value).map_err(|e| anyhow::anyhow!(e))?;
        self.db
            .set_config(guild_id, key, &text)
            .map_err(BotError::Other)?;
        self.invalidate(guild_id, key);
        Ok(())
    }

    /// Append one element to a list-typed key. Read-modify-write without a
    /// lock; a concurrent append can be lost (last writer wins).
    pub fn append(&self, guild_id: u64, key: &str, element: Value) -> Result<(), BotError> {
        let descriptor = descriptor_for(key)?;
        if !descriptor.ty.is_list() {
            return Err(BotError::ConfigKeyUsage(format!(
                "config key `{}` is not a list and cannot be appended to",
                key
            )));
        }
        let mut items = match self.get(guild_id, key)? {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(BotError::Other(anyhow::anyhow!(
                    "stored value for `{}` is not a list: {}",
                    key,
                    other
                )))
            }
            None => Vec::new(),
        };
        items.push(element);
        self.set(guild_id, key, &Value::Array(items))
    }

    pub fn unset(&self, guild_id: u64, key: &str) -> Result<bool, BotError> {
        descriptor_for(key)?;
        let deleted = self
            .db
            .delete_config(guild_id, key)
            .map_err(BotError::Other)?;
        self.invalidate(guild_id, key);
        Ok(deleted > 0)
    }

    pub fn list(&self, guild_id: u64) -> Result<Vec<(String, Value)>, BotError> {
        let rows = self.db.list_config(guild_id).map_err(BotError::Other)?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, text) in rows {
            let value = serde_json::from_str(&text)
                .map_err(|e| anyhow::anyhow!("corrupt config value at ({guild_id}, {key}): {e}"))?;
            out.push((key, value));
        }
        Ok(out)
    }

    /// Cross-guild read of one `secret.*` key. Skips the cache by design:
    /// secrets never linger in memory longer than the call that needs them.
    pub fn get_secret_all(&self, key: &str) -> Result<BTreeMap<u64, String>, BotError> {
        if !key.starts_with("secret.") {
            return Err(BotError::ConfigKeyUsage(format!(
                "`{}` is not a secret key",
                key
            )));
        }
        descriptor_for(key)?;
        let rows = self
            .db
            .get_config_all_guilds(key)
            .map_err(BotError::Other)?;
        let mut secrets = BTreeMap::new();
        for (guild_id, text) in rows {
            match serde_json::from_str::<Value>(&text) {
                Ok(Value::String(secret)) => {
                    secrets.insert(guild_id, secret);
                }
                Ok(Value::Null) => {}
                _ => warn!("Ignoring malformed secret `{}` for guild {}", key, guild_id),
            }
        }
        Ok(secrets)
    }

    pub fn invalidate(&self, guild_id: u64, key: &str) {
        let mut cache = self.cache.lock().unwrap();
        cache.pop(&(guild_id, key.to_string()));
    }

    /// Register a downstream cache of derived config so `invalidate_all`
    /// reaches it.
    pub fn register_cache(&self, cache: Arc<dyn ClearableCache>) {
        self.derived.lock().unwrap().push(cache);
    }

    /// Clear the base cache and every registered derived cache.
    pub fn invalidate_all(&self) {
        self.cache.lock().unwrap().clear();
        for cache in self.derived.lock().unwrap().iter() {
            debug!("Clearing derived config cache `{}`", cache.name());
            cache.clear();
        }
    }

    // --- Typed convenience readers ---

    pub fn get_bool(&self, guild_id: u64, key: &str) -> Result<bool, BotError> {
        Ok(self
            .get(guild_id, key)?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    pub fn get_u64(&self, guild_id: u64, key: &str) -> Result<Option<u64>, BotError> {
        Ok(self.get(guild_id, key)?.and_then(|v| v.as_u64()))
    }

    pub fn get_str(&self, guild_id: u64, key: &str) -> Result<Option<String>, BotError> {
        Ok(self
            .get(guild_id, key)?
            .and_then(|v| v.as_str().map(String::from)))
    }

    pub fn get_u64_list(&self, guild_id: u64, key: &str) -> Result<Vec<u64>, BotError> {
        Ok(self
            .get(guild_id, key)?
            .and_then(|v| {
                v.as_array()
                    .map(|items| items.iter().filter_map(|i| i.as_u64()).collect())
            })
            .unwrap_or_default())
    }

    pub fn get_str_list(&self, guild_id: u64, key: &str) -> Result<Vec<String>, BotError> {
        Ok(self
            .get(guild_id, key)?
            .and_then(|v| {
                v.as_array().map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.as_str().map(String::from))
                        .collect()
                })
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_store() -> SettingsStore {
        let db = Database::new(":memory:").unwrap();
        db.execute_init().unwrap();
        SettingsStore::new(db)
    }

    #[test]
    fn test_set_get_roundtrip() {
        let store = test_store();
        store.set(100, "logs.channel_id", &json!(999)).unwrap();
        assert_eq!(store.get(100, "logs.channel_id").unwrap(), Some(json!(999)));
        assert_eq!(store.get_u64(100, "logs.channel_id").unwrap(), Some(999));
    }

    #[test]
    fn test_fallback_to_guild_zero() {
        let store = test_store();
        store.set(0, "chat.rb.enabled", &json!(true)).unwrap();
        assert!(store.get_bool(200, "chat.rb.enabled").unwrap());
    }

    #[test]
    fn test_explicit_null_shadows_fallback() {
        let store = test_store();
        store.set(0, "logs.channel_id", &json!(42)).unwrap();
        store.set(200, "logs.channel_id", &Value::Null).unwrap();
        assert_eq!(store.get(200, "logs.channel_id").unwrap(), None);
        // Other guilds still see the fallback.
        assert_eq!(store.get(300, "logs.channel_id").unwrap(), Some(json!(42)));
    }

    #[test]
    fn test_descriptor_default_when_unset() {
        let store = test_store();
        assert!(!store.get_bool(5, "twitch.online_notif.enabled").unwrap());
        assert_eq!(
            store.get(5, "cooldown.exempt.channels").unwrap(),
            Some(json!([]))
        );
        assert_eq!(store.get(5, "logs.channel_id").unwrap(), None);
    }

    #[test]
    fn test_type_validation_on_set() {
        let store = test_store();
        let err = store.set(1, "logs.enabled", &json!("yes")).unwrap_err();
        assert!(matches!(err, BotError::ConfigKeyUsage(_)));
        let err = store
            .set(1, "cooldown.exempt.channels", &json!([1, "2"]))
            .unwrap_err();
        assert!(matches!(err, BotError::ConfigKeyUsage(_)));
    }

    #[test]
    fn test_specifier_enforced_on_get_and_set() {
        let store = test_store();
        assert!(matches!(
            store.get(1, "roles.mod_add.min_messages"),
            Err(BotError::ConfigKeyUsage(_))
        ));
        assert!(matches!(
            store.set(1, "logs.enabled:7", &json!(true)),
            Err(BotError::ConfigKeyUsage(_))
        ));
        store
            .set(1, "roles.mod_add.min_messages:123", &json!(50))
            .unwrap();
        assert_eq!(
            store.get_u64(1, "roles.mod_add.min_messages:123").unwrap(),
            Some(50)
        );
        // A different specifier is a different logical key.
        assert_eq!(
            store.get(1, "roles.mod_add.min_messages:124").unwrap(),
            None
        );
    }

    #[test]
    fn test_append() {
        let store = test_store();
        store
            .append(1, "cooldown.exempt.channels", json!(555))
            .unwrap();
        store
            .append(1, "cooldown.exempt.channels", json!(556))
            .unwrap();
        assert_eq!(
            store.get_u64_list(1, "cooldown.exempt.channels").unwrap(),
            vec![555, 556]
        );

        let err = store.append(1, "logs.enabled", json!(true)).unwrap_err();
        assert!(matches!(err, BotError::ConfigKeyUsage(_)));

        let err = store
            .append(1, "cooldown.exempt.channels", json!("not-an-int"))
            .unwrap_err();
        assert!(matches!(err, BotError::ConfigKeyUsage(_)));
    }

    #[test]
    fn test_cache_serves_stale_until_invalidated() {
        let store = test_store();
        store.set(1, "report.message", &json!("old")).unwrap();
        assert_eq!(
            store.get_str(1, "report.message").unwrap(),
            Some("old".to_string())
        );

        // A write that bypasses the store (e.g. another process sharing the
        // file) is invisible until the entry is invalidated.
        store.db.set_config(1, "report.message", "\"new\"").unwrap();
        assert_eq!(
            store.get_str(1, "report.message").unwrap(),
            Some("old".to_string())
        );

        store.invalidate(1, "report.message");
        assert_eq!(
            store.get_str(1, "report.message").unwrap(),
            Some("new".to_string())
        );
    }

    #[test]
    fn test_cache_ttl_expiry() {
        let db = Database::new(":memory:").unwrap();
        db.execute_init().unwrap();
        let store = SettingsStore::with_ttl(db, Duration::from_millis(0));

        store.set(1, "report.message", &json!("old")).unwrap();
        store.db.set_config(1, "report.message", "\"new\"").unwrap();
        // Zero TTL: every read goes to the database.
        assert_eq!(
            store.get_str(1, "report.message").unwrap(),
            Some("new".to_string())
        );
    }

    #[test]
    fn test_unset_removes_row() {
        let store = test_store();
        store.set(1, "report.message", &json!("hello")).unwrap();
        assert!(store.unset(1, "report.message").unwrap());
        assert!(!store.unset(1, "report.message").unwrap());
        assert_eq!(store.get(1, "report.message").unwrap(), None);
    }

    #[test]
    fn test_secret_all_bypasses_cache_and_other_keys_rejected() {
        let store = test_store();
        store
            .set(1, "secret.discord.token", &json!("tok-a"))
            .unwrap();
        store
            .set(2, "secret.discord.token", &json!("tok-b"))
            .unwrap();

        let secrets = store.get_secret_all("secret.discord.token").unwrap();
        assert_eq!(secrets.get(&1), Some(&"tok-a".to_string()));
        assert_eq!(secrets.get(&2), Some(&"tok-b".to_string()));

        // A direct db write is visible immediately: no cache in the path.
        store
            .db
            .set_config(1, "secret.discord.token", "\"tok-c\"")
            .unwrap();
        let secrets = store.get_secret_all("secret.discord.token").unwrap();
        assert_eq!(secrets.get(&1), Some(&"tok-c".to_string()));

        assert!(matches!(
            store.get_secret_all("logs.enabled"),
            Err(BotError::ConfigKeyUsage(_))
        ));
    }

    struct FlagCache {
        cleared: AtomicBool,
    }

    impl ClearableCache for FlagCache {
        fn name(&self) -> &str {
            "flag"
        }
        fn clear(&self) {
            self.cleared.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_invalidate_all_walks_registry() {
        let store = test_store();
        let flag = Arc::new(FlagCache {
            cleared: AtomicBool::new(false),
        });
        store.register_cache(flag.clone());

        // Targeted invalidation leaves derived caches alone.
        store.invalidate(1, "logs.enabled");
        assert!(!flag.cleared.load(Ordering::SeqCst));

        store.invalidate_all();
        assert!(flag.cleared.load(Ordering::SeqCst));
    }
}
