//! Durable, versioned key-value store contract.
//!
//! Every [`State`] carries an optimistic-concurrency version. A create stores
//! version `0`; a successful update or delete must present the version
//! currently stored, and an update stores `version + 1`. Mismatches are
//! reported back to the caller instead of being raised, so callers can fold
//! the fresh state into memory and retry on their own schedule.
//!
//! Two backends ship with the crate: [`InMemoryStateStore`] and
//! [`SqliteStateStore`].

mod memory;
mod sqlite;

pub use memory::InMemoryStateStore;
pub use sqlite::SqliteStateStore;

use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Store error type.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The backend could not serve the request
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;

/// Keys whose write was rejected, mapped to the state currently stored
/// (`None` when the key does not exist).
pub type Conflicts = HashMap<String, Option<State>>;

/// A versioned value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub key: String,
    pub value: Vec<u8>,
    pub version: i32,
    /// Epoch milliseconds of the last write, maintained by the store.
    pub modified_time: i64,
}

impl State {
    /// A state that has never been written.
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self::with_version(key, value, 0)
    }

    /// A state expected to replace the stored one at `version`.
    pub fn with_version(key: impl Into<String>, value: Vec<u8>, version: i32) -> Self {
        Self {
            key: key.into(),
            value,
            version,
            modified_time: 0,
        }
    }
}

/// A batch of writes applied all-or-nothing by [`StateStore::execute`].
#[derive(Debug, Clone, Default)]
pub struct OperationGroup {
    creates: Vec<State>,
    updates: Vec<State>,
    deletes: Vec<State>,
}

impl OperationGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, state: State) -> &mut Self {
        self.creates.push(state);
        self
    }

    pub fn update(&mut self, state: State) -> &mut Self {
        self.updates.push(state);
        self
    }

    pub fn delete(&mut self, state: State) -> &mut Self {
        self.deletes.push(state);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }

    pub fn creates(&self) -> &[State] {
        &self.creates
    }

    pub fn updates(&self) -> &[State] {
        &self.updates
    }

    pub fn deletes(&self) -> &[State] {
        &self.deletes
    }
}

/// A batch-oriented durable store with optimistic concurrency.
pub trait StateStore: Send + Sync {
    /// Fetch the states stored under `keys`. Missing keys are absent from the result.
    fn get(&self, keys: &[String]) -> StoreResult<HashMap<String, State>>;

    /// Insert new states. Returns the keys that already existed and were left untouched.
    fn create(&self, states: Vec<State>) -> StoreResult<HashSet<String>>;

    /// Replace states whose stored version matches. Returns the rejected keys
    /// with the state that is actually stored.
    fn update(&self, states: Vec<State>) -> StoreResult<Conflicts>;

    /// Delete states whose stored version matches. Deleting a missing key
    /// succeeds. Returns the rejected keys with the state that is actually stored.
    fn delete(&self, states: Vec<State>) -> StoreResult<HashMap<String, State>>;

    /// Apply every write in `group` or none of them. Returns the writes that
    /// prevented the group from applying; an empty map means it was committed.
    fn execute(&self, group: OperationGroup) -> StoreResult<Conflicts>;
}
