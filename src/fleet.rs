use crate::cooldown::{CooldownBucket, CooldownSpec};
use crate::error::on_error;
use crate::feeds::bsky::BskyPoller;
use crate::feeds::twitch::TwitchPoller;
use crate::feeds::youtube::YoutubePoller;
use crate::plugin::{self, PeriodicTaskDecl, Plugin, PluginCommand, TaskContext};
use crate::tasks::{DiscordDispatcher, TaskEngine};
use crate::{commands, events, Context, Data, Error, Shared};
use serenity::all::GatewayIntents;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Invert the per-guild token map into one entry per distinct token, each
/// carrying the guilds it is provisioned for.
pub fn group_by_token(tokens: BTreeMap<u64, String>) -> BTreeMap<String, Vec<u64>> {
    let mut grouped: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for (guild_id, token) in tokens {
        grouped.entry(token).or_default().push(guild_id);
    }
    grouped
}

/// The stock plugin set. Called once per hosted client since commands are
/// not clonable across frameworks.
pub fn default_plugins() -> Vec<Plugin> {
    vec![
        Plugin::new("admin").command(PluginCommand::new(commands::admin::admin())),
        Plugin::new("reminders")
            .command(
                PluginCommand::new(commands::reminder::reminder()).with_cooldown(CooldownSpec {
                    count: 5,
                    interval_secs: 60,
                    bucket: CooldownBucket::GuildUser,
                }),
            )
            .task(PeriodicTaskDecl {
                name: "task-sweep",
                make: Box::new(|tc| {
                    Box::pin(async move {
                        let dispatcher = Arc::new(DiscordDispatcher::new(tc.http));
                        TaskEngine::new(tc.shared.db.clone(), dispatcher, tc.enabled_guilds)
                            .run()
                            .await;
                    })
                }),
            }),
        Plugin::new("roles")
            .command(PluginCommand::new(commands::roles::assign_role()))
            .command(PluginCommand::new(commands::roles::selfrole()))
            .on_event(events::roles_listener),
        Plugin::new("audit").on_event(events::audit_listener),
        Plugin::new("feeds")
            .task(PeriodicTaskDecl {
                name: "twitch-poller",
                make: Box::new(|tc| {
                    Box::pin(async move {
                        TwitchPoller::new(tc.shared.settings.clone(), tc.http, tc.enabled_guilds)
                            .run()
                            .await;
                    })
                }),
            })
            .task(PeriodicTaskDecl {
                name: "bsky-poller",
                make: Box::new(|tc| {
                    Box::pin(async move {
                        BskyPoller::new(tc.shared.settings.clone(), tc.http, tc.enabled_guilds)
                            .run()
                            .await;
                    })
                }),
            })
            .task(PeriodicTaskDecl {
                name: "youtube-poller",
                make: Box::new(|tc| {
                    Box::pin(async move {
                        YoutubePoller::new(tc.shared.settings.clone(), tc.http, tc.enabled_guilds)
                            .run()
                            .await;
                    })
                }),
            }),
    ]
}

/// Global command gate: tenant check plus the declared cooldown, if any.
async fn command_check(ctx: Context<'_>) -> Result<bool, Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(true);
    };
    let data = ctx.data();
    if !data.serves_guild(guild_id.get()) {
        return Ok(false);
    }
    if let Some(spec) = data.cooldown_specs.get(&ctx.command().name) {
        data.shared.cooldowns.enforce(
            guild_id.get(),
            ctx.author().id.get(),
            ctx.channel_id().get(),
            &ctx.command().name,
            spec,
        )?;
    }
    Ok(true)
}

async fn dispatch_event(
    ctx: &serenity::client::Context,
    event: &serenity::all::FullEvent,
    data: &Data,
) -> Result<(), Error> {
    for handler in &data.event_handlers {
        handler(ctx, event, data).await;
    }
    Ok(())
}

async fn build_client(
    shared: Arc<Shared>,
    token: &str,
    enabled_guilds: Vec<u64>,
    plugins: Vec<Plugin>,
) -> anyhow::Result<serenity::Client> {
    let attached = plugin::attach(plugins, &enabled_guilds);
    let cooldown_specs = attached.cooldowns;
    let event_handlers = attached.event_handlers;
    let tasks = attached.tasks;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: attached.commands,
            on_error: |err| Box::pin(on_error(err)),
            command_check: Some(|ctx| Box::pin(command_check(ctx))),
            event_handler: |ctx, event, _framework, data| Box::pin(dispatch_event(ctx, event, data)),
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                info!(
                    "Client `{}` is connected, serving {} guild(s)",
                    ready.user.name,
                    enabled_guilds.len()
                );

                let task_ctx = TaskContext {
                    shared: shared.clone(),
                    http: ctx.http.clone(),
                    enabled_guilds: enabled_guilds.clone(),
                };
                for task in tasks {
                    info!("Client `{}`: starting task `{}`", ready.user.name, task.name);
                    tokio::spawn((task.make)(task_ctx.clone()));
                }

                Ok(Data {
                    shared,
                    enabled_guilds,
                    cooldown_specs,
                    event_handlers,
                })
            })
        })
        .build();

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILD_MODERATION
        | GatewayIntents::MESSAGE_CONTENT;

    let client = serenity::Client::builder(token, intents)
        .framework(framework)
        .await?;
    Ok(client)
}

/// Drop clients that failed to build, logging each failure with the guild
/// set it would have served. One tenant's bad token must not take down the
/// rest of the fleet.
fn surviving_clients<T>(built: Vec<(Vec<u64>, anyhow::Result<T>)>) -> Vec<(Vec<u64>, T)> {
    built
        .into_iter()
        .filter_map(|(guilds, result)| match result {
            Ok(client) => Some((guilds, client)),
            Err(e) => {
                error!("Client for guilds {:?} failed to build: {:#}", guilds, e);
                None
            }
        })
        .collect()
}

/// Start one client per distinct token and run them until the last one
/// exits. A client that fails to build or drops its gateway is logged with
/// its guild set while the rest keep serving.
pub async fn run(shared: Arc<Shared>) -> anyhow::Result<()> {
    let tokens = shared
        .settings
        .get_secret_all("secret.discord.token")
        .map_err(|e| anyhow::anyhow!("reading client tokens: {e}"))?;
    let fleet = group_by_token(tokens);
    if fleet.is_empty() {
        anyhow::bail!("no client tokens configured (secret.discord.token)");
    }
    info!("Starting {} client(s)", fleet.len());

    let mut built = Vec::new();
    for (token, guilds) in fleet {
        let client = build_client(shared.clone(), &token, guilds.clone(), default_plugins()).await;
        built.push((guilds, client));
    }
    let surviving = surviving_clients(built);
    if surviving.is_empty() {
        anyhow::bail!("every client failed to build");
    }

    let mut clients = JoinSet::new();
    let mut shard_managers = Vec::new();
    for (guilds, mut client) in surviving {
        shard_managers.push(client.shard_manager.clone());
        clients.spawn(async move {
            let result = client.start().await;
            (guilds, result)
        });
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping all clients");
            for manager in &shard_managers {
                manager.shutdown_all().await;
            }
        }
    });

    while let Some(joined) = clients.join_next().await {
        match joined {
            Ok((guilds, Ok(()))) => info!("Client for guilds {:?} shut down", guilds),
            Ok((guilds, Err(e))) => error!("Client for guilds {:?} exited: {}", guilds, e),
            Err(e) => error!("Client task panicked: {}", e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_by_token_inverts_and_orders() {
        let mut tokens = BTreeMap::new();
        tokens.insert(3, "token-b".to_string());
        tokens.insert(1, "token-a".to_string());
        tokens.insert(2, "token-a".to_string());

        let grouped = group_by_token(tokens);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["token-a"], vec![1, 2]);
        assert_eq!(grouped["token-b"], vec![3]);
    }

    #[test]
    fn test_one_bad_client_does_not_sink_the_rest() {
        let built: Vec<(Vec<u64>, anyhow::Result<u32>)> = vec![
            (vec![1, 2], Ok(10)),
            (vec![3], Err(anyhow::anyhow!("bad token"))),
            (vec![4], Ok(11)),
        ];
        let surviving = surviving_clients(built);
        assert_eq!(surviving.len(), 2);
        assert_eq!(surviving[0], (vec![1, 2], 10));
        assert_eq!(surviving[1], (vec![4], 11));
    }

    fn assert_description_fits(command: &poise::Command<Data, Error>) {
        if let Some(description) = &command.description {
            assert!(
                description.chars().count() <= 100,
                "description of `{}` exceeds the platform limit: {}",
                command.name,
                description
            );
        }
        for sub in &command.subcommands {
            assert_description_fits(sub);
        }
    }

    // The platform caps slash-command descriptions at 100 characters; the
    // first doc paragraph of every command has to stay under it.
    #[test]
    fn test_command_descriptions_fit_the_platform_limit() {
        let attached = plugin::attach(default_plugins(), &[1]);
        for command in &attached.commands {
            assert_description_fits(command);
        }
    }

    #[test]
    fn test_default_plugins_cover_the_stock_commands() {
        let attached = plugin::attach(default_plugins(), &[1]);
        let names: Vec<_> = attached.commands.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"admin"));
        assert!(names.contains(&"reminder"));
        assert!(names.contains(&"selfrole"));
        // Three pollers plus the task sweep.
        assert_eq!(attached.tasks.len(), 4);
        assert_eq!(attached.event_handlers.len(), 2);
    }
}
