//! SQLite backend for the state store.
//!
//! One table holds every state. Version checks and writes of an
//! [`OperationGroup`] run inside a single transaction, so a group either
//! commits completely or leaves the table untouched.

use super::{Conflicts, OperationGroup, State, StateStore, StoreResult};
use crate::types::now_millis;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

/// SQLite-backed [`StateStore`].
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Opens a SQLite database at the given path, creating the schema if needed.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Creates an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tracker_state (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                version INTEGER NOT NULL,
                modified_time INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lists every stored key starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key FROM tracker_state WHERE substr(key, 1, ?1) = ?2 ORDER BY key")?;
        let rows = stmt.query_map(params![prefix.len() as i64, prefix], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

fn read_state(conn: &Connection, key: &str) -> SqliteResult<Option<State>> {
    conn.query_row(
        "SELECT key, value, version, modified_time FROM tracker_state WHERE key = ?1",
        params![key],
        |row| {
            Ok(State {
                key: row.get(0)?,
                value: row.get(1)?,
                version: row.get(2)?,
                modified_time: row.get(3)?,
            })
        },
    )
    .optional()
}

fn insert_state(conn: &Connection, state: &State, now: i64) -> SqliteResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO tracker_state (key, value, version, modified_time) VALUES (?1, ?2, 0, ?3)",
        params![state.key, state.value, now],
    )?;
    Ok(inserted == 1)
}

fn update_state(conn: &Connection, state: &State, now: i64) -> SqliteResult<bool> {
    let updated = conn.execute(
        "UPDATE tracker_state SET value = ?1, version = version + 1, modified_time = ?2 \
         WHERE key = ?3 AND version = ?4",
        params![state.value, now, state.key, state.version],
    )?;
    Ok(updated == 1)
}

fn delete_state(conn: &Connection, state: &State) -> SqliteResult<bool> {
    let deleted = conn.execute(
        "DELETE FROM tracker_state WHERE key = ?1 AND version = ?2",
        params![state.key, state.version],
    )?;
    Ok(deleted == 1)
}

impl StateStore for SqliteStateStore {
    fn get(&self, keys: &[String]) -> StoreResult<HashMap<String, State>> {
        let conn = self.conn.lock();
        let mut states = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(state) = read_state(&conn, key)? {
                states.insert(key.clone(), state);
            }
        }
        Ok(states)
    }

    fn create(&self, states: Vec<State>) -> StoreResult<HashSet<String>> {
        let conn = self.conn.lock();
        let now = now_millis();
        let mut failed = HashSet::new();
        for state in states {
            if !insert_state(&conn, &state, now)? {
                failed.insert(state.key);
            }
        }
        Ok(failed)
    }

    fn update(&self, states: Vec<State>) -> StoreResult<Conflicts> {
        let conn = self.conn.lock();
        let now = now_millis();
        let mut conflicts = Conflicts::new();
        for state in states {
            if !update_state(&conn, &state, now)? {
                let current = read_state(&conn, &state.key)?;
                conflicts.insert(state.key, current);
            }
        }
        Ok(conflicts)
    }

    fn delete(&self, states: Vec<State>) -> StoreResult<HashMap<String, State>> {
        let conn = self.conn.lock();
        let mut failures = HashMap::new();
        for state in states {
            if !delete_state(&conn, &state)? {
                if let Some(current) = read_state(&conn, &state.key)? {
                    failures.insert(state.key, current);
                }
            }
        }
        Ok(failures)
    }

    fn execute(&self, group: OperationGroup) -> StoreResult<Conflicts> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = now_millis();
        let mut conflicts = Conflicts::new();

        for state in group.creates() {
            if !insert_state(&tx, state, now)? {
                conflicts.insert(state.key.clone(), read_state(&tx, &state.key)?);
            }
        }
        for state in group.updates() {
            if !update_state(&tx, state, now)? {
                conflicts.insert(state.key.clone(), read_state(&tx, &state.key)?);
            }
        }
        for state in group.deletes() {
            if !delete_state(&tx, state)? {
                if let Some(current) = read_state(&tx, &state.key)? {
                    conflicts.insert(state.key.clone(), Some(current));
                }
            }
        }

        if conflicts.is_empty() {
            tx.commit()?;
        } else {
            debug!(conflicts = conflicts.len(), "rolling back operation group");
            tx.rollback()?;
        }
        Ok(conflicts)
    }
}
