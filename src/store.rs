// Durable key -> JSON blob storage for the pipeline's own state.
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    ScheduledEntries,
    RateLimitCounters,
    RecentNotifications,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScheduledEntries => "scheduled_entries",
            Self::RateLimitCounters => "rate_limit_counters",
            Self::RecentNotifications => "recent_notifications",
        }
    }
}

#[trait_variant::make(StateStore: Send)]
pub trait LocalStateStore {
    async fn put(&self, table: Table, key: &str, value: &str) -> Result<(), StoreError>;
    async fn delete(&self, table: Table, key: &str) -> Result<(), StoreError>;
    // Rows come back ordered by key
    async fn load_all(&self, table: Table) -> Result<Vec<(String, String)>, StoreError>;
}

pub async fn put_json<K, T>(store: &K, table: Table, key: &str, value: &T) -> Result<(), StoreError>
where
    K: StateStore,
    T: Serialize,
{
    let json = serde_json::to_string(value)?;
    StateStore::put(store, table, key, &json).await
}

// Rows that no longer deserialize are skipped rather than failing the whole load
pub async fn load_json<K, T>(store: &K, table: Table) -> Result<Vec<(String, T)>, StoreError>
where
    K: StateStore,
    T: DeserializeOwned,
{
    let rows = StateStore::load_all(store, table).await?;
    let mut values = Vec::with_capacity(rows.len());
    for (key, json) in rows {
        match serde_json::from_str(&json) {
            Ok(value) => values.push((key, value)),
            Err(e) => warn!(table = table.as_str(), key = %key, error = %e, "Skipping unreadable row"),
        }
    }
    Ok(values)
}

/// In-process store for dev mode and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, BTreeMap<String, String>>>,
    unavailable: AtomicBool,
    unavailable_tables: Mutex<HashSet<Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Simulates an outage: every call fails until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    // Same as `set_unavailable`, limited to writes and reads of one table
    pub fn set_table_unavailable(&self, table: Table, unavailable: bool) {
        let mut tables = self.unavailable_tables.lock().unwrap_or_else(|e| e.into_inner());
        if unavailable {
            tables.insert(table);
        } else {
            tables.remove(&table);
        }
    }

    pub async fn len(&self, table: Table) -> usize {
        self.tables.read().await.get(&table).map_or(0, BTreeMap::len)
    }

    fn check_available(&self, table: Table) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        if self.unavailable_tables.lock().unwrap_or_else(|e| e.into_inner()).contains(&table) {
            return Err(StoreError::Unavailable(format!("{} switched off", table.as_str())));
        }
        Ok(())
    }
}

impl StateStore for MemoryStore {
    async fn put(&self, table: Table, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_available(table)?;
        self.tables
            .write()
            .await
            .entry(table)
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, table: Table, key: &str) -> Result<(), StoreError> {
        self.check_available(table)?;
        if let Some(rows) = self.tables.write().await.get_mut(&table) {
            rows.remove(key);
        }
        Ok(())
    }

    async fn load_all(&self, table: Table) -> Result<Vec<(String, String)>, StoreError> {
        self.check_available(table)?;
        Ok(self
            .tables
            .read()
            .await
            .get(&table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_put_load_delete() {
        let store = MemoryStore::new();
        put_json(&store, Table::RateLimitCounters, "b", &2u32).await.unwrap();
        put_json(&store, Table::RateLimitCounters, "a", &1u32).await.unwrap();
        put_json(&store, Table::ScheduledEntries, "a", &9u32).await.unwrap();

        let rows: Vec<(String, u32)> = load_json(&store, Table::RateLimitCounters).await.unwrap();
        assert_eq!(rows, vec![("a".to_string(), 1), ("b".to_string(), 2)]);

        StateStore::delete(&store, Table::RateLimitCounters, "a").await.unwrap();
        assert_eq!(store.len(Table::RateLimitCounters).await, 1);
        assert_eq!(store.len(Table::ScheduledEntries).await, 1);
    }

    #[tokio::test]
    async fn test_unreadable_rows_are_skipped() {
        let store = MemoryStore::new();
        StateStore::put(&store, Table::RecentNotifications, "1", "not json").await.unwrap();
        put_json(&store, Table::RecentNotifications, "2", &5u32).await.unwrap();

        let rows: Vec<(String, u32)> = load_json(&store, Table::RecentNotifications).await.unwrap();
        assert_eq!(rows, vec![("2".to_string(), 5)]);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(put_json(&store, Table::ScheduledEntries, "x", &1u32).await.is_err());
        store.set_unavailable(false);
        assert!(put_json(&store, Table::ScheduledEntries, "x", &1u32).await.is_ok());

        store.set_table_unavailable(Table::ScheduledEntries, true);
        assert!(put_json(&store, Table::ScheduledEntries, "y", &1u32).await.is_err());
        assert!(put_json(&store, Table::RecentNotifications, "y", &1u32).await.is_ok());
        store.set_table_unavailable(Table::ScheduledEntries, false);
        assert!(put_json(&store, Table::ScheduledEntries, "y", &1u32).await.is_ok());
    }
}
