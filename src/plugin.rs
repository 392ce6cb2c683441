use crate::cooldown::CooldownSpec;
use crate::{Data, Error, Shared};
use serenity::http::Http;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// Everything a periodic task needs from the client it is bound to.
#[derive(Clone)]
pub struct TaskContext {
    pub shared: Arc<Shared>,
    pub http: Arc<Http>,
    pub enabled_guilds: Vec<u64>,
}

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Declares a long-running periodic task. The factory is called once per
/// client the owning plugin is installed into; the returned future owns its
/// own tick loop and never resolves.
pub struct PeriodicTaskDecl {
    pub name: &'static str,
    pub make: Box<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>,
}

pub type EventFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Observes the raw platform event stream for one client.
pub type EventHandlerFn =
    for<'a> fn(&'a serenity::client::Context, &'a serenity::all::FullEvent, &'a Data) -> EventFuture<'a>;

/// A slash/context command contributed by a plugin, optionally restricted to
/// an explicit guild list and optionally rate limited.
pub struct PluginCommand {
    pub command: poise::Command<Data, Error>,
    /// None: available in every guild the client serves.
    pub guilds: Option<Vec<u64>>,
    pub cooldown: Option<CooldownSpec>,
}

impl PluginCommand {
    pub fn new(command: poise::Command<Data, Error>) -> Self {
        Self {
            command,
            guilds: None,
            cooldown: None,
        }
    }

    pub fn for_guilds(mut self, guilds: Vec<u64>) -> Self {
        self.guilds = Some(guilds);
        self
    }

    pub fn with_cooldown(mut self, spec: CooldownSpec) -> Self {
        self.cooldown = Some(spec);
        self
    }
}

/// A named feature unit: commands, periodic tasks and event listeners.
pub struct Plugin {
    pub name: &'static str,
    pub commands: Vec<PluginCommand>,
    pub tasks: Vec<PeriodicTaskDecl>,
    pub event_handlers: Vec<EventHandlerFn>,
}

impl Plugin {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            commands: Vec::new(),
            tasks: Vec::new(),
            event_handlers: Vec::new(),
        }
    }

    pub fn command(mut self, command: PluginCommand) -> Self {
        self.commands.push(command);
        self
    }

    pub fn task(mut self, task: PeriodicTaskDecl) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn on_event(mut self, handler: EventHandlerFn) -> Self {
        self.event_handlers.push(handler);
        self
    }
}

/// Plugins after installation into one client: commands filtered to the
/// client's tenant set, tasks and listeners collected for the fleet to wire.
pub struct AttachedPlugins {
    pub commands: Vec<poise::Command<Data, Error>>,
    pub cooldowns: HashMap<String, CooldownSpec>,
    pub tasks: Vec<PeriodicTaskDecl>,
    pub event_handlers: Vec<EventHandlerFn>,
}

/// Install plugins into a client. Commands declaring an explicit guild list
/// are kept only when that list intersects the client's enabled set; empty
/// intersections are dropped silently.
pub fn attach(plugins: Vec<Plugin>, enabled_guilds: &[u64]) -> AttachedPlugins {
    let mut attached = AttachedPlugins {
        commands: Vec::new(),
        cooldowns: HashMap::new(),
        tasks: Vec::new(),
        event_handlers: Vec::new(),
    };

    for plugin in plugins {
        for entry in plugin.commands {
            if let Some(declared) = &entry.guilds {
                if !declared.iter().any(|g| enabled_guilds.contains(g)) {
                    debug!(
                        "Dropping command `{}` from plugin `{}`: no declared guild served here",
                        entry.command.name, plugin.name
                    );
                    continue;
                }
            }
            if let Some(spec) = entry.cooldown {
                attached
                    .cooldowns
                    .insert(entry.command.name.clone(), spec);
            }
            attached.commands.push(entry.command);
        }
        attached.tasks.extend(plugin.tasks);
        attached.event_handlers.extend(plugin.event_handlers);
    }

    attached
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooldown::CooldownBucket;

    fn dummy_command(name: &str) -> poise::Command<Data, Error> {
        poise::Command {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_guild_list_intersection_filtering() {
        let plugin = Plugin::new("test")
            .command(PluginCommand::new(dummy_command("everywhere")))
            .command(PluginCommand::new(dummy_command("served")).for_guilds(vec![1, 9]))
            .command(PluginCommand::new(dummy_command("elsewhere")).for_guilds(vec![8, 9]));

        let attached = attach(vec![plugin], &[1, 2]);
        let names: Vec<_> = attached.commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["everywhere", "served"]);
    }

    #[test]
    fn test_cooldown_specs_collected_by_command_name() {
        let spec = CooldownSpec {
            count: 1,
            interval_secs: 60,
            bucket: CooldownBucket::GuildUser,
        };
        let plugin = Plugin::new("test")
            .command(PluginCommand::new(dummy_command("hug")).with_cooldown(spec))
            .command(PluginCommand::new(dummy_command("free")));

        let attached = attach(vec![plugin], &[1]);
        assert!(attached.cooldowns.contains_key("hug"));
        assert!(!attached.cooldowns.contains_key("free"));
    }

    #[test]
    fn test_tasks_and_listeners_survive_attach() {
        fn noop<'a>(
            _ctx: &'a serenity::client::Context,
            _event: &'a serenity::all::FullEvent,
            _data: &'a Data,
        ) -> EventFuture<'a> {
            Box::pin(async {})
        }

        let plugin = Plugin::new("test")
            .task(PeriodicTaskDecl {
                name: "tick",
                make: Box::new(|_| Box::pin(async {})),
            })
            .on_event(noop);

        let attached = attach(vec![plugin], &[1]);
        assert_eq!(attached.tasks.len(), 1);
        assert_eq!(attached.event_handlers.len(), 1);
    }
}
