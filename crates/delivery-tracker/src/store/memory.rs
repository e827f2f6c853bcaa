//! In-memory state store.

use super::{Conflicts, OperationGroup, State, StateStore, StoreResult};
use crate::types::now_millis;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// A [`StateStore`] held entirely in memory.
///
/// Honors the same versioning rules as the SQLite backend. Useful for tests
/// and for embedding the tracker where durability is provided elsewhere.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: Mutex<HashMap<String, State>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.states.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn conflicts_of(stored: &HashMap<String, State>, group: &OperationGroup) -> Conflicts {
    let mut conflicts = Conflicts::new();
    for state in group.creates() {
        if let Some(current) = stored.get(&state.key) {
            conflicts.insert(state.key.clone(), Some(current.clone()));
        }
    }
    for state in group.updates() {
        match stored.get(&state.key) {
            Some(current) if current.version == state.version => {}
            current => {
                conflicts.insert(state.key.clone(), current.cloned());
            }
        }
    }
    for state in group.deletes() {
        if let Some(current) = stored.get(&state.key) {
            if current.version != state.version {
                conflicts.insert(state.key.clone(), Some(current.clone()));
            }
        }
    }
    conflicts
}

impl StateStore for InMemoryStateStore {
    fn get(&self, keys: &[String]) -> StoreResult<HashMap<String, State>> {
        let states = self.states.lock();
        Ok(keys
            .iter()
            .filter_map(|key| states.get(key).map(|state| (key.clone(), state.clone())))
            .collect())
    }

    fn create(&self, states: Vec<State>) -> StoreResult<HashSet<String>> {
        let mut stored = self.states.lock();
        let mut failed = HashSet::new();
        for mut state in states {
            if stored.contains_key(&state.key) {
                failed.insert(state.key);
                continue;
            }
            state.version = 0;
            state.modified_time = now_millis();
            stored.insert(state.key.clone(), state);
        }
        Ok(failed)
    }

    fn update(&self, states: Vec<State>) -> StoreResult<Conflicts> {
        let mut stored = self.states.lock();
        let mut conflicts = Conflicts::new();
        for mut state in states {
            match stored.get(&state.key) {
                Some(current) if current.version == state.version => {
                    state.version += 1;
                    state.modified_time = now_millis();
                    stored.insert(state.key.clone(), state);
                }
                current => {
                    conflicts.insert(state.key.clone(), current.cloned());
                }
            }
        }
        Ok(conflicts)
    }

    fn delete(&self, states: Vec<State>) -> StoreResult<HashMap<String, State>> {
        let mut stored = self.states.lock();
        let mut failures = HashMap::new();
        for state in states {
            match stored.get(&state.key) {
                Some(current) if current.version != state.version => {
                    failures.insert(state.key.clone(), current.clone());
                }
                Some(_) => {
                    stored.remove(&state.key);
                }
                None => {}
            }
        }
        Ok(failures)
    }

    fn execute(&self, group: OperationGroup) -> StoreResult<Conflicts> {
        let mut stored = self.states.lock();
        let conflicts = conflicts_of(&stored, &group);
        if !conflicts.is_empty() {
            return Ok(conflicts);
        }

        let now = now_millis();
        let OperationGroup {
            creates,
            updates,
            deletes,
        } = group;
        for mut state in creates {
            state.version = 0;
            state.modified_time = now;
            stored.insert(state.key.clone(), state);
        }
        for mut state in updates {
            state.version += 1;
            state.modified_time = now;
            stored.insert(state.key.clone(), state);
        }
        for state in deletes {
            stored.remove(&state.key);
        }
        Ok(Conflicts::new())
    }
}
