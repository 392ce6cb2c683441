pub mod audit;
pub mod commands;
pub mod config;
pub mod cooldown;
pub mod db;
pub mod error;
pub mod events;
pub mod feeds;
pub mod fleet;
pub mod plugin;
pub mod roles;
pub mod settings;
pub mod tasks;
pub mod template;

use crate::audit::AuditCorrelator;
use crate::cooldown::CooldownManager;
use crate::db::Database;
use crate::roles::TrackedRoleCache;
use crate::settings::SettingsStore;
use std::sync::Arc;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;

/// Process-wide singletons. Every hosted client shares one of these, so a
/// config write or a cooldown consumed through one client is visible to all.
pub struct Shared {
    pub config: config::Config,
    pub db: Database,
    pub settings: Arc<SettingsStore>,
    pub cooldowns: CooldownManager,
    pub audit: AuditCorrelator,
    pub tracked_roles: Arc<TrackedRoleCache>,
}

impl Shared {
    pub fn new(config: config::Config, db: Database) -> Arc<Self> {
        let settings = Arc::new(SettingsStore::new(db.clone()));
        let tracked_roles = Arc::new(TrackedRoleCache::new());
        settings.register_cache(tracked_roles.clone());
        Arc::new(Self {
            config,
            db,
            cooldowns: CooldownManager::new(settings.clone()),
            audit: AuditCorrelator::new(),
            tracked_roles,
            settings,
        })
    }
}

/// Custom user data passed to all command functions, one per hosted client.
pub struct Data {
    pub shared: Arc<Shared>,
    /// Guilds this client is provisioned for; tenants outside the list are
    /// ignored by every handler and periodic task.
    pub enabled_guilds: Vec<u64>,
    /// Command-declared cooldown specs, keyed by command name.
    pub cooldown_specs: std::collections::HashMap<String, cooldown::CooldownSpec>,
    /// Event listeners contributed by the installed plugins.
    pub event_handlers: Vec<plugin::EventHandlerFn>,
}

impl Data {
    pub fn serves_guild(&self, guild_id: u64) -> bool {
        self.enabled_guilds.contains(&guild_id)
    }
}
