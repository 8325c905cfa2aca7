//! In-memory database with session-scoped staging.

use super::{Database, UnitOfWork};
use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type Tables = HashMap<String, BTreeMap<String, Value>>;

/// A database held in process memory.
///
/// Each session stages its writes privately; `commit` applies them under a
/// single write lock so other sessions never observe half a commit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    committed: Arc<RwLock<Tables>>,
    failing_commits: Arc<AtomicUsize>,
    failing_rollbacks: Arc<AtomicUsize>,
}

impl InMemoryDatabase {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the committed rows of a table, ordered by key.
    #[must_use]
    pub fn committed_rows(&self, table: &str) -> Vec<(String, Value)> {
        self.committed
            .read()
            .get(table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Returns one committed row.
    #[must_use]
    pub fn committed_row(&self, table: &str, key: &str) -> Option<Value> {
        self.committed.read().get(table).and_then(|rows| rows.get(key).cloned())
    }

    /// Makes the next `count` commits fail with [`StoreError::CommitFailed`].
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` rollbacks fail with [`StoreError::Backend`].
    pub fn fail_next_rollbacks(&self, count: usize) {
        self.failing_rollbacks.store(count, Ordering::SeqCst);
    }

    fn take_commit_failure(&self) -> bool {
        take_one(&self.failing_commits)
    }

    fn take_rollback_failure(&self) -> bool {
        take_one(&self.failing_rollbacks)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        Ok(Box::new(InMemorySession {
            database: self.clone(),
            staged: BTreeMap::new(),
        }))
    }
}

/// A session over an [`InMemoryDatabase`].
#[derive(Debug)]
struct InMemorySession {
    database: InMemoryDatabase,
    // `None` marks a staged delete.
    staged: BTreeMap<(String, String), Option<Value>>,
}

#[async_trait]
impl UnitOfWork for InMemorySession {
    async fn get_row(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError> {
        if let Some(staged) = self.staged.get(&(table.to_string(), key.to_string())) {
            return Ok(staged.clone());
        }
        Ok(self.database.committed_row(table, key))
    }

    async fn put_row(&mut self, table: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.staged
            .insert((table.to_string(), key.to_string()), Some(value));
        Ok(())
    }

    async fn delete_row(&mut self, table: &str, key: &str) -> Result<bool, StoreError> {
        let existed = self.get_row(table, key).await?.is_some();
        self.staged.insert((table.to_string(), key.to_string()), None);
        Ok(existed)
    }

    async fn scan(&self, table: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let mut rows: BTreeMap<String, Value> =
            self.database.committed_rows(table).into_iter().collect();
        for ((t, key), staged) in &self.staged {
            if t != table {
                continue;
            }
            match staged {
                Some(value) => {
                    rows.insert(key.clone(), value.clone());
                }
                None => {
                    rows.remove(key);
                }
            }
        }
        Ok(rows.into_iter().collect())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.database.take_commit_failure() {
            return Err(StoreError::CommitFailed("injected commit failure".to_string()));
        }
        let staged = std::mem::take(&mut self.staged);
        let mut tables = self.database.committed.write();
        for ((table, key), value) in staged {
            let rows = tables.entry(table).or_default();
            match value {
                Some(value) => {
                    rows.insert(key, value);
                }
                None => {
                    rows.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if self.database.take_rollback_failure() {
            return Err(StoreError::Backend("injected rollback failure".to_string()));
        }
        self.staged.clear();
        Ok(())
    }
}
