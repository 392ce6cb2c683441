pub mod bsky;
pub mod twitch;
pub mod youtube;

use crate::error::BotError;
use crate::settings::SettingsStore;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

/// Sentinel token recorded for a resource the latest fetch did not return.
/// Cannot collide with stream ids (numeric) or RFC3339 timestamps, so a
/// reappearance always reads as a change.
pub const OFFLINE_TOKEN: &str = "offline";

/// Outcome of comparing a resource's current token against poller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Never seen before process start: record silently, no notification.
    First,
    Unchanged,
    /// Token moved: emit exactly one notification.
    Changed,
}

/// Per-poller "last seen token" map. In-memory on purpose: losing it on
/// restart suppresses a thundering herd of "new post" notifications, at the
/// cost of missing changes that happen while the process is down.
#[derive(Default)]
pub struct FirstSeen {
    tokens: Mutex<HashMap<String, String>>,
}

impl FirstSeen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `token` for `resource` and report how it compares to the
    /// previous one.
    pub fn observe(&self, resource: &str, token: &str) -> Observation {
        let mut tokens = self.tokens.lock().unwrap();
        match tokens.insert(resource.to_string(), token.to_string()) {
            None => Observation::First,
            Some(previous) if previous == token => Observation::Unchanged,
            Some(_) => Observation::Changed,
        }
    }

    /// Record the offline sentinel without ever signaling a change; going
    /// offline is not an event, coming back is.
    pub fn mark_offline(&self, resource: &str) {
        let mut tokens = self.tokens.lock().unwrap();
        tokens.insert(resource.to_string(), OFFLINE_TOKEN.to_string());
    }

    pub fn last_token(&self, resource: &str) -> Option<String> {
        self.tokens.lock().unwrap().get(resource).cloned()
    }
}

/// Walk a client's enabled guilds and build `resource -> {subscribed guilds}`
/// from the poller's enabled flag and resource-list key. Resources are
/// normalized to lowercase so platform-side case differences collapse.
pub fn discover_subscriptions(
    settings: &SettingsStore,
    guilds: &[u64],
    enabled_key: &str,
    resources_key: &str,
) -> Result<BTreeMap<String, BTreeSet<u64>>, BotError> {
    let mut subscriptions: BTreeMap<String, BTreeSet<u64>> = BTreeMap::new();
    for &guild_id in guilds {
        if !settings.get_bool(guild_id, enabled_key)? {
            continue;
        }
        for resource in settings.get_str_list(guild_id, resources_key)? {
            subscriptions
                .entry(resource.to_lowercase())
                .or_default()
                .insert(guild_id);
        }
    }
    Ok(subscriptions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    #[test]
    fn test_first_seen_suppression_then_change() {
        let state = FirstSeen::new();
        // Scenario from the streaming feed: first fetch reports stream A.
        assert_eq!(state.observe("x", "A"), Observation::First);
        assert_eq!(state.observe("x", "A"), Observation::Unchanged);
        assert_eq!(state.observe("x", "B"), Observation::Changed);
        assert_eq!(state.observe("x", "B"), Observation::Unchanged);
    }

    #[test]
    fn test_offline_then_reappear_is_a_change() {
        let state = FirstSeen::new();
        assert_eq!(state.observe("x", "A"), Observation::First);
        state.mark_offline("x");
        assert_eq!(state.last_token("x").as_deref(), Some(OFFLINE_TOKEN));
        assert_eq!(state.observe("x", "A"), Observation::Changed);
    }

    #[test]
    fn test_resources_tracked_independently() {
        let state = FirstSeen::new();
        assert_eq!(state.observe("x", "A"), Observation::First);
        assert_eq!(state.observe("y", "A"), Observation::First);
        assert_eq!(state.observe("x", "B"), Observation::Changed);
        assert_eq!(state.observe("y", "A"), Observation::Unchanged);
    }

    #[test]
    fn test_discover_subscriptions() {
        let db = Database::new(":memory:").unwrap();
        db.execute_init().unwrap();
        let settings = SettingsStore::new(db);

        settings
            .set(1, "twitch.online_notif.enabled", &json!(true))
            .unwrap();
        settings
            .set(1, "twitch.online_notif.logins", &json!(["StreamerA", "streamerb"]))
            .unwrap();
        settings
            .set(2, "twitch.online_notif.enabled", &json!(true))
            .unwrap();
        settings
            .set(2, "twitch.online_notif.logins", &json!(["streamera"]))
            .unwrap();
        // Guild 3 lists logins but never enabled the feature.
        settings
            .set(3, "twitch.online_notif.logins", &json!(["streamerc"]))
            .unwrap();

        let subs = discover_subscriptions(
            &settings,
            &[1, 2, 3],
            "twitch.online_notif.enabled",
            "twitch.online_notif.logins",
        )
        .unwrap();

        assert_eq!(subs.len(), 2);
        assert_eq!(
            subs.get("streamera").unwrap(),
            &BTreeSet::from([1, 2])
        );
        assert_eq!(subs.get("streamerb").unwrap(), &BTreeSet::from([1]));
        assert!(!subs.contains_key("streamerc"));
    }

    #[test]
    fn test_discover_scoped_to_client_guilds() {
        let db = Database::new(":memory:").unwrap();
        db.execute_init().unwrap();
        let settings = SettingsStore::new(db);

        settings
            .set(9, "twitch.online_notif.enabled", &json!(true))
            .unwrap();
        settings
            .set(9, "twitch.online_notif.logins", &json!(["streamera"]))
            .unwrap();

        // Guild 9 belongs to another client's tenant set.
        let subs = discover_subscriptions(
            &settings,
            &[1, 2],
            "twitch.online_notif.enabled",
            "twitch.online_notif.logins",
        )
        .unwrap();
        assert!(subs.is_empty());
    }
}
