use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const AUDIT_TTL: Duration = Duration::from_secs(180);
const AUDIT_CAPACITY: usize = 256;

/// How long to wait after a platform event before looking for its audit
/// entry. The platform delivers the entry on its own schedule, usually
/// within a second or two.
pub const CORRELATION_GRACE: Duration = Duration::from_secs(2);

/// Actor details recovered from an audit-log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditActor {
    pub actor_id: u64,
    pub reason: Option<String>,
}

/// Bounded map whose entries expire after a TTL. Expired entries are dropped
/// lazily on access.
struct TtlMap<K: Eq + Hash + Clone> {
    entries: Mutex<LruCache<K, (AuditActor, Instant)>>,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone> TtlMap<K> {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
            ttl,
        }
    }

    fn insert(&self, key: K, value: AuditActor) {
        let mut entries = self.entries.lock().unwrap();
        entries.put(key, (value, Instant::now()));
    }

    fn get(&self, key: &K) -> Option<AuditActor> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((value, stored_at)) if stored_at.elapsed() <= self.ttl => Some(value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }
}

/// Bridges actor-less platform events (message delete, member ban) to the
/// audit-log entries that name the actor. Process-wide: entries recorded by
/// one client correlate events observed by another serving the same guild.
///
/// Delete keys deliberately drop the message id: the platform never says
/// which message an audit entry refers to, so "recent deletion in this
/// (guild, channel, author) tuple" is a best-effort match.
pub struct AuditCorrelator {
    delete_audits: TtlMap<(u64, u64, u64)>,
    ban_audits: TtlMap<(u64, u64)>,
}

impl Default for AuditCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditCorrelator {
    pub fn new() -> Self {
        Self {
            delete_audits: TtlMap::new(AUDIT_CAPACITY, AUDIT_TTL),
            ban_audits: TtlMap::new(AUDIT_CAPACITY, AUDIT_TTL),
        }
    }

    #[cfg(test)]
    fn with_ttl(ttl: Duration) -> Self {
        Self {
            delete_audits: TtlMap::new(AUDIT_CAPACITY, ttl),
            ban_audits: TtlMap::new(AUDIT_CAPACITY, ttl),
        }
    }

    pub fn record_delete_audit(
        &self,
        guild_id: u64,
        channel_id: u64,
        author_id: u64,
        actor: AuditActor,
    ) {
        self.delete_audits
            .insert((guild_id, channel_id, author_id), actor);
    }

    pub fn record_ban_audit(&self, guild_id: u64, user_id: u64, actor: AuditActor) {
        self.ban_audits.insert((guild_id, user_id), actor);
    }

    pub fn lookup_delete(&self, guild_id: u64, channel_id: u64, author_id: u64) -> Option<AuditActor> {
        self.delete_audits.get(&(guild_id, channel_id, author_id))
    }

    pub fn lookup_ban(&self, guild_id: u64, user_id: u64) -> Option<AuditActor> {
        self.ban_audits.get(&(guild_id, user_id))
    }

    /// Wait out the delivery grace period, then look for the audit entry
    /// matching a deletion in (guild, channel, author).
    pub async fn correlate_delete(
        &self,
        guild_id: u64,
        channel_id: u64,
        author_id: u64,
    ) -> Option<AuditActor> {
        sleep(CORRELATION_GRACE).await;
        self.lookup_delete(guild_id, channel_id, author_id)
    }

    pub async fn correlate_ban(&self, guild_id: u64, user_id: u64) -> Option<AuditActor> {
        sleep(CORRELATION_GRACE).await;
        self.lookup_ban(guild_id, user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(id: u64) -> AuditActor {
        AuditActor {
            actor_id: id,
            reason: Some("spam".to_string()),
        }
    }

    #[test]
    fn test_delete_hit_and_miss() {
        let correlator = AuditCorrelator::new();
        correlator.record_delete_audit(1, 2, 3, actor(99));

        assert_eq!(correlator.lookup_delete(1, 2, 3), Some(actor(99)));
        // Different author tuple: no match.
        assert_eq!(correlator.lookup_delete(1, 2, 4), None);
    }

    #[test]
    fn test_ban_keyed_by_guild_and_user() {
        let correlator = AuditCorrelator::new();
        correlator.record_ban_audit(1, 7, actor(99));
        assert_eq!(correlator.lookup_ban(1, 7), Some(actor(99)));
        assert_eq!(correlator.lookup_ban(2, 7), None);
    }

    #[test]
    fn test_expired_entry_does_not_enrich() {
        let correlator = AuditCorrelator::with_ttl(Duration::from_millis(0));
        correlator.record_delete_audit(1, 2, 3, actor(99));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(correlator.lookup_delete(1, 2, 3), None);
    }

    #[test]
    fn test_newer_entry_replaces_older() {
        let correlator = AuditCorrelator::new();
        correlator.record_delete_audit(1, 2, 3, actor(10));
        correlator.record_delete_audit(1, 2, 3, actor(11));
        assert_eq!(correlator.lookup_delete(1, 2, 3).unwrap().actor_id, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_correlate_waits_grace_period() {
        let correlator = std::sync::Arc::new(AuditCorrelator::new());

        let lookup = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.correlate_delete(1, 2, 3).await })
        };

        // The audit entry arrives 1.5s after the event: inside the grace
        // window, so the lookup still sees it.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        correlator.record_delete_audit(1, 2, 3, actor(99));

        let found = lookup.await.unwrap();
        assert_eq!(found, Some(actor(99)));
    }
}
