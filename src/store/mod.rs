//! Embedded persistence for accounts, tasks, users and banned words.
//!
//! Hot fields (`enable`, `disabled_reason`, task status) live in their own
//! columns so the selector and the HTTP layer can filter without touching
//! the JSON blob that carries the full record. Updates go through explicit
//! field masks: the masked fields of the stored JSON are overwritten
//! (last-writer-wins), everything else is left as persisted.

use std::sync::Mutex;

use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::account::DiscordAccount;
use crate::error::{ProxyError, Result};
use crate::task::{TaskInfo, TaskStatus};
use crate::utils::now_ms;

/// An API consumer known to the proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub name: String,
    pub token: String,
    pub status: String,
    pub is_white: bool,
    pub day_draw_limit: i64,
}

/// A persisted banned-word list entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BannedWord {
    pub id: String,
    pub words: Vec<String>,
    pub enable: bool,
}

/// Filter for task listing.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub statuses: Vec<TaskStatus>,
    pub instance_id: Option<String>,
    pub user_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl TaskQuery {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

pub trait Store: Send + Sync {
    fn save_account(&self, account: &DiscordAccount) -> Result<()>;
    fn get_account(&self, id: &str) -> Result<Option<DiscordAccount>>;
    fn list_accounts(&self) -> Result<Vec<DiscordAccount>>;
    /// Overwrite only the named serde fields of the stored record.
    fn update_account_fields(&self, account: &DiscordAccount, fields: &[&str]) -> Result<()>;
    fn delete_account(&self, id: &str) -> Result<()>;

    fn save_task(&self, task: &TaskInfo) -> Result<()>;
    fn get_task(&self, id: &str) -> Result<Option<TaskInfo>>;
    fn find_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskInfo>>;
    fn delete_task(&self, id: &str) -> Result<()>;

    fn save_user(&self, user: &User) -> Result<()>;
    fn get_user(&self, id: &str) -> Result<Option<User>>;

    fn save_banned_word(&self, entry: &BannedWord) -> Result<()>;
    fn list_banned_words(&self) -> Result<Vec<BannedWord>>;

    /// Increment a TTL'd counter and return the new value. Expired keys are
    /// purged opportunistically.
    fn incr_counter(&self, key: &str, ttl_secs: u64) -> Result<i64>;
    fn get_counter(&self, key: &str) -> Result<i64>;
}

/// SQLite-backed [`Store`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS account (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                enable INTEGER NOT NULL DEFAULT 1,
                disabled_reason TEXT,
                sort INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS task (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                action TEXT NOT NULL,
                instance_id TEXT,
                user_id TEXT,
                submit_time INTEGER NOT NULL DEFAULT 0,
                finish_time INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_status ON task(status);
            CREATE INDEX IF NOT EXISTS idx_task_instance ON task(instance_id);
            CREATE TABLE IF NOT EXISTS user (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS banned_word (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS counter (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Poisoning only happens if a holder panicked; propagating the data
        // is still sound for SQLite.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn enum_str<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_default()
}

impl Store for SqliteStore {
    fn save_account(&self, account: &DiscordAccount) -> Result<()> {
        let data = serde_json::to_string(account)?;
        self.lock().execute(
            "INSERT OR REPLACE INTO account (id, channel_id, enable, disabled_reason, sort, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                account.id,
                account.channel_id,
                account.enable,
                account.disabled_reason,
                account.sort,
                data
            ],
        )?;
        Ok(())
    }

    fn get_account(&self, id: &str) -> Result<Option<DiscordAccount>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT data FROM account WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => {
                let data: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    fn list_accounts(&self) -> Result<Vec<DiscordAccount>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT data FROM account ORDER BY sort, id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut accounts = Vec::new();
        for data in rows {
            accounts.push(serde_json::from_str(&data?)?);
        }
        Ok(accounts)
    }

    fn update_account_fields(&self, account: &DiscordAccount, fields: &[&str]) -> Result<()> {
        let conn = self.lock();
        let stored: String = {
            let mut stmt = conn.prepare("SELECT data FROM account WHERE id = ?1")?;
            let mut rows = stmt.query(params![account.id])?;
            match rows.next()? {
                Some(row) => row.get(0)?,
                None => {
                    return Err(ProxyError::Validation(format!(
                        "unknown account {}",
                        account.id
                    )))
                }
            }
        };

        let mut current: Value = serde_json::from_str(&stored)?;
        let fresh = serde_json::to_value(account)?;
        if let (Some(current_map), Some(fresh_map)) = (current.as_object_mut(), fresh.as_object())
        {
            for field in fields {
                if let Some(value) = fresh_map.get(*field) {
                    current_map.insert((*field).to_string(), value.clone());
                }
            }
        }

        let enable = current
            .get("enable")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let disabled_reason = current
            .get("disabled_reason")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        conn.execute(
            "UPDATE account SET enable = ?2, disabled_reason = ?3, data = ?4 WHERE id = ?1",
            params![account.id, enable, disabled_reason, current.to_string()],
        )?;
        Ok(())
    }

    fn delete_account(&self, id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM account WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn save_task(&self, task: &TaskInfo) -> Result<()> {
        let data = serde_json::to_string(task)?;
        self.lock().execute(
            "INSERT OR REPLACE INTO task
             (id, status, action, instance_id, user_id, submit_time, finish_time, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.id,
                enum_str(&task.status),
                enum_str(&task.action),
                task.instance_id,
                task.user_id,
                task.submit_time as i64,
                task.finish_time as i64,
                data
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Option<TaskInfo>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT data FROM task WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => {
                let data: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    fn find_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskInfo>> {
        let mut sql = String::from("SELECT data FROM task WHERE 1=1");
        let mut args: Vec<String> = Vec::new();

        if !query.statuses.is_empty() {
            let marks = vec!["?"; query.statuses.len()].join(",");
            sql.push_str(&format!(" AND status IN ({marks})"));
            args.extend(query.statuses.iter().map(enum_str));
        }
        if let Some(instance_id) = &query.instance_id {
            sql.push_str(" AND instance_id = ?");
            args.push(instance_id.clone());
        }
        if let Some(user_id) = &query.user_id {
            sql.push_str(" AND user_id = ?");
            args.push(user_id.clone());
        }
        sql.push_str(" ORDER BY submit_time DESC");
        let limit = if query.limit == 0 { 50 } else { query.limit };
        sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, query.offset));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            row.get::<_, String>(0)
        })?;
        let mut tasks = Vec::new();
        for data in rows {
            tasks.push(serde_json::from_str(&data?)?);
        }
        Ok(tasks)
    }

    fn delete_task(&self, id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM task WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn save_user(&self, user: &User) -> Result<()> {
        let data = serde_json::to_string(user)?;
        self.lock().execute(
            "INSERT OR REPLACE INTO user (id, data) VALUES (?1, ?2)",
            params![user.id, data],
        )?;
        Ok(())
    }

    fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT data FROM user WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => {
                let data: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    fn save_banned_word(&self, entry: &BannedWord) -> Result<()> {
        let data = serde_json::to_string(entry)?;
        self.lock().execute(
            "INSERT OR REPLACE INTO banned_word (id, data) VALUES (?1, ?2)",
            params![entry.id, data],
        )?;
        Ok(())
    }

    fn list_banned_words(&self) -> Result<Vec<BannedWord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT data FROM banned_word")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut entries = Vec::new();
        for data in rows {
            entries.push(serde_json::from_str(&data?)?);
        }
        Ok(entries)
    }

    fn incr_counter(&self, key: &str, ttl_secs: u64) -> Result<i64> {
        let now = (now_ms() / 1000) as i64;
        let conn = self.lock();
        conn.execute("DELETE FROM counter WHERE expires_at <= ?1", params![now])?;
        conn.execute(
            "INSERT INTO counter (key, value, expires_at) VALUES (?1, 1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = value + 1",
            params![key, now + ttl_secs as i64],
        )?;
        let value = conn.query_row(
            "SELECT value FROM counter WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    fn get_counter(&self, key: &str) -> Result<i64> {
        let now = (now_ms() / 1000) as i64;
        let conn = self.lock();
        let value = conn
            .query_row(
                "SELECT value FROM counter WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .unwrap_or(0);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BotType, TaskAction};

    fn account(id: &str) -> DiscordAccount {
        DiscordAccount {
            id: id.to_string(),
            channel_id: format!("chan-{id}"),
            guild_id: "guild".to_string(),
            user_token: "token".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn account_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_account(&account("a1")).unwrap();

        let loaded = store.get_account("a1").unwrap().expect("account exists");
        assert_eq!(loaded.channel_id, "chan-a1");
        assert!(loaded.enable);

        assert!(store.get_account("missing").unwrap().is_none());
    }

    #[test]
    fn field_mask_touches_only_named_fields() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_account(&account("a1")).unwrap();

        let mut changed = account("a1");
        changed.enable = false;
        changed.disabled_reason = Some("reconnect budget exceeded".to_string());
        changed.user_token = "SHOULD-NOT-PERSIST".to_string();
        store
            .update_account_fields(&changed, &["enable", "disabled_reason"])
            .unwrap();

        let loaded = store.get_account("a1").unwrap().unwrap();
        assert!(!loaded.enable);
        assert_eq!(
            loaded.disabled_reason.as_deref(),
            Some("reconnect budget exceeded")
        );
        // The unmasked token keeps its stored value.
        assert_eq!(loaded.user_token, "token");
    }

    #[test]
    fn update_unknown_account_fails() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .update_account_fields(&account("ghost"), &["enable"])
            .unwrap_err();
        assert!(matches!(err, ProxyError::Validation(_)));
    }

    #[test]
    fn task_round_trip_and_filtering() {
        let store = SqliteStore::in_memory().unwrap();

        let mut t1 = TaskInfo::new(TaskAction::Imagine, BotType::Mj, "cat");
        t1.instance_id = "chan-1".to_string();
        t1.mark_submitted();
        store.save_task(&t1).unwrap();

        let mut t2 = TaskInfo::new(TaskAction::Describe, BotType::Mj, "");
        t2.instance_id = "chan-2".to_string();
        t2.mark_submitted();
        t2.mark_in_progress();
        t2.mark_success();
        store.save_task(&t2).unwrap();

        let loaded = store.get_task(&t1.id).unwrap().expect("t1 exists");
        assert_eq!(loaded.prompt, "cat");
        assert_eq!(loaded.status, TaskStatus::Submitted);

        let successes = store
            .find_tasks(&TaskQuery {
                statuses: vec![TaskStatus::Success],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].id, t2.id);

        let by_instance = store
            .find_tasks(&TaskQuery {
                instance_id: Some("chan-1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_instance.len(), 1);
        assert_eq!(by_instance[0].id, t1.id);
    }

    #[test]
    fn counters_expire() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.incr_counter("banned:20260801:u1", 86400).unwrap(), 1);
        assert_eq!(store.incr_counter("banned:20260801:u1", 86400).unwrap(), 2);
        assert_eq!(store.get_counter("banned:20260801:u1").unwrap(), 2);

        // Zero TTL expires immediately; the next increment starts over.
        store.incr_counter("ephemeral", 0).unwrap();
        assert_eq!(store.incr_counter("ephemeral", 0).unwrap(), 1);
        assert_eq!(store.get_counter("ephemeral").unwrap(), 0);
    }
}
