use chrono::{DateTime, NaiveDateTime, Utc};
use md5::{Digest, Md5};
use rusqlite::{Connection, OptionalExtension, Result};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub const KIND_REMOVE_ROLE: &str = "remove_role";
pub const KIND_REMINDER: &str = "reminder";

/// A future-dated work item leased by the scheduled-task sweep.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: i64,
    pub guild_id: u64,
    pub kind: String,
    pub process_after: String,
    pub payload: String,
}

/// Per-(guild,user) message activity counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetrics {
    pub message_count: u64,
    pub distinct_days: u64,
    pub last_distinct_day_boundary: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TuchEntry {
    pub user_id: u64,
    pub max: i64,
    pub total_value: i64,
    pub total_uses: i64,
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

pub fn fmt_utc(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn parse_sqlite_utc(ts: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S").ok()?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

/// Hex MD5 of the lowercased content with all non-word characters removed.
/// Used to deduplicate quotes that differ only in punctuation or case.
pub fn content_digest(content: &str) -> String {
    let normalized: String = content
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    let digest = Md5::digest(normalized.as_bytes());
    format!("{:x}", digest)
}

impl Database {
    pub fn new(database_url: &str) -> Result<Self> {
        let conn = Connection::open(database_url)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against this database on the blocking pool. Async call
    /// sites use this so the connection mutex is never held across an await.
    pub async fn run_blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let sql = "
            CREATE TABLE IF NOT EXISTS config_entries (
                guild_id INTEGER NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (guild_id, key)
            );

            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                timezone TEXT,
                bedtime TEXT,
                last_bedtime_notified DATETIME
            );

            CREATE TABLE IF NOT EXISTS guild_members (
                guild_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                profile_data TEXT,
                birthday_month INTEGER,
                birthday_day INTEGER,
                next_birthday_utc DATETIME,
                PRIMARY KEY (guild_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_members_birthday
                ON guild_members (guild_id, next_birthday_utc);

            CREATE TABLE IF NOT EXISTS message_metrics (
                guild_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                distinct_days INTEGER NOT NULL DEFAULT 0,
                last_distinct_day_boundary DATETIME,
                PRIMARY KEY (guild_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                guild_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                process_after DATETIME NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_due
                ON scheduled_tasks (guild_id, kind, process_after);

            CREATE TABLE IF NOT EXISTS quotes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                guild_id INTEGER NOT NULL,
                quoted_user_id INTEGER NOT NULL,
                added_by_user_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                content_digest TEXT NOT NULL,
                UNIQUE (guild_id, quoted_user_id, content_digest)
            );

            CREATE TABLE IF NOT EXISTS tuch_counters (
                guild_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                max INTEGER NOT NULL DEFAULT 0,
                total_value INTEGER NOT NULL DEFAULT 0,
                total_uses INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (guild_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_tuch_leaderboard
                ON tuch_counters (guild_id, max DESC);

            CREATE TABLE IF NOT EXISTS collection_edges (
                guild_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                target_user_id INTEGER NOT NULL,
                PRIMARY KEY (guild_id, user_id, target_user_id)
            );
        ";
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(sql)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    // --- Config entries ---

    pub fn get_config(&self, guild_id: u64, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM config_entries WHERE guild_id = ?1 AND key = ?2",
                (guild_id as i64, key),
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_config(&self, guild_id: u64, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO config_entries (guild_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(guild_id, key) DO UPDATE SET value = ?3",
            (guild_id as i64, key, value),
        )?;
        Ok(())
    }

    pub fn delete_config(&self, guild_id: u64, key: &str) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM config_entries WHERE guild_id = ?1 AND key = ?2",
            (guild_id as i64, key),
        )?;
        Ok(deleted)
    }

    pub fn list_config(&self, guild_id: u64) -> anyhow::Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM config_entries WHERE guild_id = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map([guild_id as i64], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// All guilds' values for one key. The secrets API is the only caller;
    /// it deliberately bypasses the settings cache.
    pub fn get_config_all_guilds(&self, key: &str) -> anyhow::Result<Vec<(u64, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT guild_id, value FROM config_entries WHERE key = ?1")?;
        let rows = stmt.query_map([key], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get(1)?))
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // --- Users ---

    pub fn set_user_timezone(&self, user_id: u64, timezone: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (user_id, timezone) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET timezone = ?2",
            (user_id as i64, timezone),
        )?;
        Ok(())
    }

    pub fn get_user_timezone(&self, user_id: u64) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let tz = conn
            .query_row(
                "SELECT timezone FROM users WHERE user_id = ?1",
                [user_id as i64],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(tz)
    }

    pub fn set_user_bedtime(&self, user_id: u64, bedtime: Option<&str>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (user_id, bedtime) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET bedtime = ?2",
            (user_id as i64, bedtime),
        )?;
        Ok(())
    }

    pub fn get_user_bedtime(&self, user_id: u64) -> anyhow::Result<Option<(String, Option<String>)>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT bedtime, last_bedtime_notified FROM users WHERE user_id = ?1",
                [user_id as i64],
                |row| Ok((row.get::<_, Option<String>>(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.and_then(|(bedtime, notified)| bedtime.map(|b| (b, notified))))
    }

    pub fn mark_bedtime_notified(&self, user_id: u64, at: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET last_bedtime_notified = ?2 WHERE user_id = ?1",
            (user_id as i64, at),
        )?;
        Ok(())
    }

    // --- Guild members ---

    pub fn set_member_birthday(
        &self,
        guild_id: u64,
        user_id: u64,
        month: u32,
        day: u32,
        next_birthday_utc: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO guild_members (guild_id, user_id, birthday_month, birthday_day, next_birthday_utc)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(guild_id, user_id) DO UPDATE
                 SET birthday_month = ?3, birthday_day = ?4, next_birthday_utc = ?5",
            (guild_id as i64, user_id as i64, month, day, next_birthday_utc),
        )?;
        Ok(())
    }

    /// Range scan over the (guild_id, next_birthday_utc) index.
    pub fn members_with_birthday_before(
        &self,
        guild_id: u64,
        cutoff: &str,
    ) -> anyhow::Result<Vec<u64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id FROM guild_members
             WHERE guild_id = ?1 AND next_birthday_utc IS NOT NULL AND next_birthday_utc <= ?2",
        )?;
        let rows = stmt.query_map((guild_id as i64, cutoff), |row| {
            Ok(row.get::<_, i64>(0)? as u64)
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn set_member_profile(
        &self,
        guild_id: u64,
        user_id: u64,
        profile_data: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO guild_members (guild_id, user_id, profile_data) VALUES (?1, ?2, ?3)
             ON CONFLICT(guild_id, user_id) DO UPDATE SET profile_data = ?3",
            (guild_id as i64, user_id as i64, profile_data),
        )?;
        Ok(())
    }

    pub fn get_member_profile(&self, guild_id: u64, user_id: u64) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let profile = conn
            .query_row(
                "SELECT profile_data FROM guild_members WHERE guild_id = ?1 AND user_id = ?2",
                (guild_id as i64, user_id as i64),
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(profile)
    }

    // --- Message metrics ---

    /// Counting upsert: message_count always increments; distinct_days
    /// increments only when more than 24h have passed since the last
    /// distinct-day boundary, which then moves to `now`. Atomic under the
    /// connection mutex.
    pub fn record_message(&self, guild_id: u64, user_id: u64, now: DateTime<Utc>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<Option<String>> = conn
            .query_row(
                "SELECT last_distinct_day_boundary FROM message_metrics
                 WHERE guild_id = ?1 AND user_id = ?2",
                (guild_id as i64, user_id as i64),
                |row| row.get(0),
            )
            .optional()?;

        let new_day = match existing {
            None => true,
            Some(None) => true,
            Some(Some(ref boundary)) => match parse_sqlite_utc(boundary) {
                Some(b) => now.signed_duration_since(b) > chrono::Duration::hours(24),
                None => true,
            },
        };

        if new_day {
            conn.execute(
                "INSERT INTO message_metrics
                     (guild_id, user_id, message_count, distinct_days, last_distinct_day_boundary)
                 VALUES (?1, ?2, 1, 1, ?3)
                 ON CONFLICT(guild_id, user_id) DO UPDATE SET
                     message_count = message_count + 1,
                     distinct_days = distinct_days + 1,
                     last_distinct_day_boundary = ?3",
                (guild_id as i64, user_id as i64, fmt_utc(now)),
            )?;
        } else {
            conn.execute(
                "UPDATE message_metrics SET message_count = message_count + 1
                 WHERE guild_id = ?1 AND user_id = ?2",
                (guild_id as i64, user_id as i64),
            )?;
        }
        Ok(())
    }

    pub fn get_metrics(&self, guild_id: u64, user_id: u64) -> anyhow::Result<MessageMetrics> {
        let conn = self.conn.lock().unwrap();
        let metrics = conn
            .query_row(
                "SELECT message_count, distinct_days, last_distinct_day_boundary
                 FROM message_metrics WHERE guild_id = ?1 AND user_id = ?2",
                (guild_id as i64, user_id as i64),
                |row| {
                    Ok(MessageMetrics {
                        message_count: row.get::<_, i64>(0)? as u64,
                        distinct_days: row.get::<_, i64>(1)? as u64,
                        last_distinct_day_boundary: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(metrics.unwrap_or_default())
    }

    // --- Scheduled tasks ---

    pub fn insert_task(
        &self,
        guild_id: u64,
        kind: &str,
        process_after: &str,
        payload: &str,
    ) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scheduled_tasks (guild_id, kind, process_after, payload)
             VALUES (?1, ?2, ?3, ?4)",
            (guild_id as i64, kind, process_after, payload),
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task(&self, id: i64) -> anyhow::Result<Option<TaskRow>> {
        let conn = self.conn.lock().unwrap();
        let task = conn
            .query_row(
                "SELECT id, guild_id, kind, process_after, payload
                 FROM scheduled_tasks WHERE id = ?1",
                [id],
                Self::task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    pub fn list_tasks(&self, guild_id: u64, kind: &str) -> anyhow::Result<Vec<TaskRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, guild_id, kind, process_after, payload FROM scheduled_tasks
             WHERE guild_id = ?1 AND kind = ?2 ORDER BY process_after",
        )?;
        let rows = stmt.query_map((guild_id as i64, kind), Self::task_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn delete_task(&self, id: i64) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", [id])?;
        Ok(deleted)
    }

    /// Due rows for a client's guild set. Rows stay in the table: the sweep
    /// deletes each one only after its dispatch attempt, so a crash before
    /// dispatch leaves the row for the next sweep. A guild belongs to
    /// exactly one client, so no other sweep races for these rows.
    pub fn due_tasks(
        &self,
        guild_ids: &[u64],
        kinds: &[&str],
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<TaskRow>> {
        if guild_ids.is_empty() || kinds.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();

        let guild_list = guild_ids
            .iter()
            .map(|g| (*g as i64).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let kind_list = kinds
            .iter()
            .map(|k| format!("'{}'", k))
            .collect::<Vec<_>>()
            .join(", ");
        // Ids are integers and kinds are compile-time constants, so inlining
        // them keeps the variadic IN clauses simple.
        let sql = format!(
            "SELECT id, guild_id, kind, process_after, payload FROM scheduled_tasks
             WHERE guild_id IN ({guild_list}) AND kind IN ({kind_list}) AND process_after <= ?1
             ORDER BY process_after"
        );

        let mut due = Vec::new();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([fmt_utc(now)], Self::task_from_row)?;
        for row in rows {
            due.push(row?);
        }
        Ok(due)
    }

    fn task_from_row(row: &rusqlite::Row<'_>) -> Result<TaskRow> {
        Ok(TaskRow {
            id: row.get(0)?,
            guild_id: row.get::<_, i64>(1)? as u64,
            kind: row.get(2)?,
            process_after: row.get(3)?,
            payload: row.get(4)?,
        })
    }

    // --- Quotes ---

    /// Returns the new quote id, or None when an equivalent quote (same
    /// guild, user and normalized content) already exists.
    pub fn add_quote(
        &self,
        guild_id: u64,
        quoted_user_id: u64,
        added_by_user_id: u64,
        content: &str,
    ) -> anyhow::Result<Option<i64>> {
        let digest = content_digest(content);
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO quotes
                 (guild_id, quoted_user_id, added_by_user_id, content, content_digest)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                guild_id as i64,
                quoted_user_id as i64,
                added_by_user_id as i64,
                content,
                digest,
            ),
        )?;
        if inserted == 0 {
            Ok(None)
        } else {
            Ok(Some(conn.last_insert_rowid()))
        }
    }

    pub fn random_quote(
        &self,
        guild_id: u64,
        quoted_user_id: Option<u64>,
    ) -> anyhow::Result<Option<(i64, u64, String)>> {
        let conn = self.conn.lock().unwrap();
        let row = match quoted_user_id {
            Some(user) => conn
                .query_row(
                    "SELECT id, quoted_user_id, content FROM quotes
                     WHERE guild_id = ?1 AND quoted_user_id = ?2
                     ORDER BY RANDOM() LIMIT 1",
                    (guild_id as i64, user as i64),
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get::<_, i64>(1)? as u64,
                            row.get(2)?,
                        ))
                    },
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT id, quoted_user_id, content FROM quotes
                     WHERE guild_id = ?1 ORDER BY RANDOM() LIMIT 1",
                    [guild_id as i64],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get::<_, i64>(1)? as u64,
                            row.get(2)?,
                        ))
                    },
                )
                .optional()?,
        };
        Ok(row)
    }

    pub fn quote_count(&self, guild_id: u64, quoted_user_id: u64) -> anyhow::Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM quotes WHERE guild_id = ?1 AND quoted_user_id = ?2",
            (guild_id as i64, quoted_user_id as i64),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // --- Tuch counters ---

    pub fn record_tuch(&self, guild_id: u64, user_id: u64, value: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tuch_counters (guild_id, user_id, max, total_value, total_uses)
             VALUES (?1, ?2, ?3, ?3, 1)
             ON CONFLICT(guild_id, user_id) DO UPDATE SET
                 max = MAX(max, ?3),
                 total_value = total_value + ?3,
                 total_uses = total_uses + 1",
            (guild_id as i64, user_id as i64, value),
        )?;
        Ok(())
    }

    pub fn tuch_leaderboard(&self, guild_id: u64, limit: usize) -> anyhow::Result<Vec<TuchEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, max, total_value, total_uses FROM tuch_counters
             WHERE guild_id = ?1 ORDER BY max DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map((guild_id as i64, limit as i64), |row| {
            Ok(TuchEntry {
                user_id: row.get::<_, i64>(0)? as u64,
                max: row.get(1)?,
                total_value: row.get(2)?,
                total_uses: row.get(3)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // --- Collection edges ---

    pub fn add_collection_edge(
        &self,
        guild_id: u64,
        user_id: u64,
        target_user_id: u64,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO collection_edges (guild_id, user_id, target_user_id)
             VALUES (?1, ?2, ?3)",
            (guild_id as i64, user_id as i64, target_user_id as i64),
        )?;
        Ok(inserted > 0)
    }

    pub fn remove_collection_edge(
        &self,
        guild_id: u64,
        user_id: u64,
        target_user_id: u64,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM collection_edges
             WHERE guild_id = ?1 AND user_id = ?2 AND target_user_id = ?3",
            (guild_id as i64, user_id as i64, target_user_id as i64),
        )?;
        Ok(deleted > 0)
    }

    pub fn list_collection(&self, guild_id: u64, user_id: u64) -> anyhow::Result<Vec<u64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT target_user_id FROM collection_edges
             WHERE guild_id = ?1 AND user_id = ?2",
        )?;
        let rows = stmt.query_map((guild_id as i64, user_id as i64), |row| {
            Ok(row.get::<_, i64>(0)? as u64)
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
