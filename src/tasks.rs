use crate::db::{fmt_utc, Database, TaskRow, KIND_REMINDER, KIND_REMOVE_ROLE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::all::{ChannelId, CreateAllowedMentions, CreateMessage, GuildId, RoleId, UserId};
use serenity::http::Http;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Sweep cadence. Drift up to one interval is acceptable by contract.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveRolePayload {
    pub role: u64,
    pub user: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderPayload {
    pub channel: u64,
    pub user: u64,
    pub reason: String,
}

pub fn schedule_remove_role(
    db: &Database,
    guild_id: u64,
    payload: &RemoveRolePayload,
    process_after: DateTime<Utc>,
) -> anyhow::Result<i64> {
    let payload = serde_json::to_string(payload)?;
    db.insert_task(guild_id, KIND_REMOVE_ROLE, &fmt_utc(process_after), &payload)
}

pub fn schedule_reminder(
    db: &Database,
    guild_id: u64,
    payload: &ReminderPayload,
    process_after: DateTime<Utc>,
) -> anyhow::Result<i64> {
    let payload = serde_json::to_string(payload)?;
    db.insert_task(guild_id, KIND_REMINDER, &fmt_utc(process_after), &payload)
}

/// Side effects a dispatched task performs against the platform.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn remove_role(&self, guild_id: u64, payload: &RemoveRolePayload) -> anyhow::Result<()>;
    async fn remind(&self, payload: &ReminderPayload) -> anyhow::Result<()>;
}

/// Production dispatcher backed by one client's HTTP handle.
pub struct DiscordDispatcher {
    http: Arc<Http>,
}

impl DiscordDispatcher {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TaskDispatcher for DiscordDispatcher {
    async fn remove_role(&self, guild_id: u64, payload: &RemoveRolePayload) -> anyhow::Result<()> {
        self.http
            .remove_member_role(
                GuildId::new(guild_id),
                UserId::new(payload.user),
                RoleId::new(payload.role),
                Some("Scheduled role removal"),
            )
            .await?;
        Ok(())
    }

    async fn remind(&self, payload: &ReminderPayload) -> anyhow::Result<()> {
        let content = format!("⏰ <@{}> Reminder: {}", payload.user, payload.reason);
        let allowed_mentions = CreateAllowedMentions::new().users(vec![UserId::new(payload.user)]);
        let builder = CreateMessage::new()
            .content(content)
            .allowed_mentions(allowed_mentions);
        ChannelId::new(payload.channel)
            .send_message(&self.http, builder)
            .await?;
        Ok(())
    }
}

/// Per-client sweep over the durable queue of future-dated work. Each sweep
/// selects every due row for the client's enabled guilds, dispatches them in
/// order, and deletes each row after its attempt. A handler failure is
/// logged and the row is deleted anyway: one attempt, no retry.
pub struct TaskEngine {
    db: Database,
    dispatcher: Arc<dyn TaskDispatcher>,
    enabled_guilds: Vec<u64>,
}

impl TaskEngine {
    pub fn new(db: Database, dispatcher: Arc<dyn TaskDispatcher>, enabled_guilds: Vec<u64>) -> Self {
        Self {
            db,
            dispatcher,
            enabled_guilds,
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            match self.sweep_once(Utc::now()).await {
                Ok(0) => debug!("Task sweep: nothing due"),
                Ok(n) => info!("Task sweep: dispatched {} tasks", n),
                // Typically a busy database; the next tick retries the batch.
                Err(e) => error!("Task sweep failed: {}", e),
            }
        }
    }

    /// Rows are deleted only after their dispatch attempt: a crash before a
    /// task's attempt leaves it for the next sweep (at least once), while a
    /// handler failure still deletes it (at most one attempt per row).
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let guilds = self.enabled_guilds.clone();
        let due = self
            .db
            .run_blocking(move |db| db.due_tasks(&guilds, &[KIND_REMOVE_ROLE, KIND_REMINDER], now))
            .await?;

        let count = due.len();
        for task in due {
            if let Err(e) = self.dispatch(&task).await {
                warn!(
                    "Task {} ({}) in guild {} failed and will not be retried: {}",
                    task.id, task.kind, task.guild_id, e
                );
            }
            let id = task.id;
            self.db.run_blocking(move |db| db.delete_task(id)).await?;
        }
        Ok(count)
    }

    async fn dispatch(&self, task: &TaskRow) -> anyhow::Result<()> {
        match task.kind.as_str() {
            KIND_REMOVE_ROLE => {
                let payload: RemoveRolePayload = serde_json::from_str(&task.payload)?;
                self.dispatcher.remove_role(task.guild_id, &payload).await
            }
            KIND_REMINDER => {
                let payload: ReminderPayload = serde_json::from_str(&task.payload)?;
                self.dispatcher.remind(&payload).await
            }
            other => anyhow::bail!("unknown task kind `{}`", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDispatcher {
        removed: Mutex<Vec<(u64, RemoveRolePayload)>>,
        reminded: Mutex<Vec<ReminderPayload>>,
        fail: bool,
    }

    #[async_trait]
    impl TaskDispatcher for RecordingDispatcher {
        async fn remove_role(
            &self,
            guild_id: u64,
            payload: &RemoveRolePayload,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("simulated platform failure");
            }
            self.removed.lock().unwrap().push((guild_id, payload.clone()));
            Ok(())
        }

        async fn remind(&self, payload: &ReminderPayload) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("simulated platform failure");
            }
            self.reminded.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn test_db() -> Database {
        let db = Database::new(":memory:").unwrap();
        db.execute_init().unwrap();
        db
    }

    #[tokio::test]
    async fn test_due_tasks_dispatch_and_disappear() {
        let db = test_db();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let now = Utc::now();

        let id = schedule_remove_role(
            &db,
            1,
            &RemoveRolePayload { role: 42, user: 7 },
            now - chrono::Duration::seconds(1),
        )
        .unwrap();

        let engine = TaskEngine::new(db.clone(), dispatcher.clone(), vec![1]);
        let dispatched = engine.sweep_once(now).await.unwrap();
        assert_eq!(dispatched, 1);

        let removed = dispatcher.removed.lock().unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, 1);
        assert_eq!(removed[0].1.role, 42);
        assert_eq!(removed[0].1.user, 7);
        drop(removed);

        assert!(db.get_task(id).unwrap().is_none());

        // A second sweep finds nothing: at-most-once.
        assert_eq!(engine.sweep_once(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_future_tasks_wait() {
        let db = test_db();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let now = Utc::now();

        let id = schedule_reminder(
            &db,
            1,
            &ReminderPayload {
                channel: 5,
                user: 7,
                reason: "stretch".to_string(),
            },
            now + chrono::Duration::minutes(10),
        )
        .unwrap();

        let engine = TaskEngine::new(db.clone(), dispatcher.clone(), vec![1]);
        assert_eq!(engine.sweep_once(now).await.unwrap(), 0);
        assert!(db.get_task(id).unwrap().is_some());

        // Once due, it goes out.
        let later = now + chrono::Duration::minutes(11);
        assert_eq!(engine.sweep_once(later).await.unwrap(), 1);
        assert_eq!(dispatcher.reminded.lock().unwrap()[0].reason, "stretch");
    }

    #[tokio::test]
    async fn test_handler_failure_still_deletes_row() {
        let db = test_db();
        let dispatcher = Arc::new(RecordingDispatcher {
            fail: true,
            ..Default::default()
        });
        let now = Utc::now();

        let id = schedule_remove_role(
            &db,
            1,
            &RemoveRolePayload { role: 42, user: 7 },
            now - chrono::Duration::seconds(1),
        )
        .unwrap();

        let engine = TaskEngine::new(db.clone(), dispatcher, vec![1]);
        engine.sweep_once(now).await.unwrap();
        assert!(db.get_task(id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_scoped_to_enabled_guilds() {
        let db = test_db();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let now = Utc::now();

        schedule_reminder(
            &db,
            2,
            &ReminderPayload {
                channel: 5,
                user: 7,
                reason: "other tenant".to_string(),
            },
            now - chrono::Duration::seconds(1),
        )
        .unwrap();

        // This client serves guild 1 only; guild 2's task is not its work.
        let engine = TaskEngine::new(db.clone(), dispatcher.clone(), vec![1]);
        assert_eq!(engine.sweep_once(now).await.unwrap(), 0);
        assert_eq!(db.list_tasks(2, KIND_REMINDER).unwrap().len(), 1);
    }

    #[test]
    fn test_payload_schema() {
        let payload: ReminderPayload =
            serde_json::from_str(r#"{"channel":5,"user":7,"reason":"hi"}"#).unwrap();
        assert_eq!(payload.channel, 5);
        let payload: RemoveRolePayload = serde_json::from_str(r#"{"role":42,"user":7}"#).unwrap();
        assert_eq!(payload.role, 42);
    }
}
