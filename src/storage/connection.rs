//! Shared per-database session: typed reads and writes over one open handle,
//! plus the close-and-reopen migration that adds object stores.
//!
//! All callers of one database share a single [`Connection`] through the
//! [`ConnectionRegistry`](super::registry::ConnectionRegistry). A migration
//! swaps the underlying handle; operations arriving while that swap is in
//! flight wait for the fresh handle instead of racing it.

use std::cell::RefCell;
use std::rc::Rc;

use futures_channel::oneshot;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StorageError;

use super::{
    AccessMode, Cursor, Database, Index, Key, KeyRange, KeySpec, ObjectStore, StorageBackend,
    Transaction, UpgradeHook,
};

/// Field under which an index scan surfaces each record's primary key, so
/// callers can address the record afterwards.
pub const PRIMARY_KEY_FIELD: &str = "id";

enum SessionState<D> {
    Open(D),
    /// A migration holds the handle; queued waiters are woken when the
    /// database has been reopened (or the reopen failed for good).
    Reopening(Vec<oneshot::Sender<()>>),
    Closed,
}

/// A long-lived session with one named database.
pub struct Connection<B: StorageBackend> {
    backend: B,
    name: String,
    upgrade: UpgradeHook,
    state: RefCell<SessionState<B::Database>>,
}

impl<B: StorageBackend> Connection<B> {
    /// Opens `name` at its stored version, creating it (seeded with
    /// `default_stores`) when it does not exist yet.
    pub async fn open(
        backend: B,
        name: &str,
        upgrade: UpgradeHook,
        default_stores: &[String],
    ) -> Result<Self, StorageError> {
        let db = backend
            .open(name, None, Rc::clone(&upgrade), default_stores)
            .await?;
        log::info!("opened database {} at v{}", name, db.version());
        Ok(Self {
            backend,
            name: name.to_string(),
            upgrade,
            state: RefCell::new(SessionState::Open(db)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a migration is currently swapping the underlying handle.
    pub fn is_migrating(&self) -> bool {
        matches!(&*self.state.borrow(), SessionState::Reopening(_))
    }

    pub fn version(&self) -> Result<u32, StorageError> {
        match &*self.state.borrow() {
            SessionState::Open(db) => Ok(db.version()),
            SessionState::Reopening(_) => Err(self.reopening_error()),
            SessionState::Closed => Err(self.closed_error()),
        }
    }

    pub fn store_names(&self) -> Result<Vec<String>, StorageError> {
        match &*self.state.borrow() {
            SessionState::Open(db) => Ok(db.store_names()),
            SessionState::Reopening(_) => Err(self.reopening_error()),
            SessionState::Closed => Err(self.closed_error()),
        }
    }

    pub fn has_store(&self, store: &str) -> Result<bool, StorageError> {
        match &*self.state.borrow() {
            SessionState::Open(db) => Ok(db.has_store(store)),
            SessionState::Reopening(_) => Err(self.reopening_error()),
            SessionState::Closed => Err(self.closed_error()),
        }
    }

    /// Every record of `store`, in primary-key order.
    pub async fn scan<T: DeserializeOwned>(&self, store: &str) -> Result<Vec<T>, StorageError> {
        self.ready().await?;
        self.ensure_store(store)?;
        let txn = self.transaction(&[store], AccessMode::ReadOnly)?;
        let mut cursor = txn.store(store)?.open_cursor()?;
        let mut records = Vec::new();
        while let Some(entry) = cursor.next_entry().await? {
            records.push(serde_json::from_value(entry.value)?);
        }
        txn.done().await?;
        Ok(records)
    }

    /// Records of `store` whose indexed value falls in `range`, ordered by
    /// indexed value and then primary key. Each record gets its primary key
    /// written into its [`PRIMARY_KEY_FIELD`] before deserializing.
    pub async fn scan_index<T: DeserializeOwned>(
        &self,
        store: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Vec<T>, StorageError> {
        self.ready().await?;
        self.ensure_store(store)?;
        let txn = self.transaction(&[store], AccessMode::ReadOnly)?;
        let index = txn.store(store)?.index(index)?;
        let mut cursor = index.open_cursor(range)?;
        let mut records = Vec::new();
        while let Some(entry) = cursor.next_entry().await? {
            let mut value = entry.value;
            if let Some(object) = value.as_object_mut() {
                object.insert(PRIMARY_KEY_FIELD.to_string(), entry.primary_key.to_json());
            }
            records.push(serde_json::from_value(value)?);
        }
        txn.done().await?;
        Ok(records)
    }

    /// The record at `key`, or [`StorageError::NotFound`] when absent.
    pub async fn get<T: DeserializeOwned>(&self, store: &str, key: &Key) -> Result<T, StorageError> {
        self.ready().await?;
        self.ensure_store(store)?;
        let txn = self.transaction(&[store], AccessMode::ReadOnly)?;
        let value = txn.store(store)?.get(key).await?;
        txn.done().await?;
        let value = value.ok_or_else(|| StorageError::NotFound(key.clone()))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Inserts or overwrites one record, returning the key it landed under.
    pub async fn put<T: Serialize>(
        &self,
        store: &str,
        value: &T,
        key: KeySpec,
    ) -> Result<Key, StorageError> {
        self.ready().await?;
        self.ensure_store(store)?;
        let json = serde_json::to_value(value)?;
        let txn = self.transaction(&[store], AccessMode::ReadWrite)?;
        let stored_at = put_value(&txn.store(store)?, &json, &key).await?;
        txn.done().await?;
        Ok(stored_at)
    }

    /// Writes a batch of records within one transaction; either every write
    /// commits or none do. Returns the keys in entry order.
    pub async fn put_many<T: Serialize>(
        &self,
        store: &str,
        entries: &[(KeySpec, T)],
    ) -> Result<Vec<Key>, StorageError> {
        self.ready().await?;
        self.ensure_store(store)?;
        let txn = self.transaction(&[store], AccessMode::ReadWrite)?;
        let object_store = txn.store(store)?;
        let mut keys = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let json = serde_json::to_value(value)?;
            keys.push(put_value(&object_store, &json, key).await?);
        }
        txn.done().await?;
        Ok(keys)
    }

    /// Overwrites records at explicit keys, all within one transaction.
    pub async fn update_many<T: Serialize>(
        &self,
        store: &str,
        entries: &[(Key, T)],
    ) -> Result<(), StorageError> {
        self.ready().await?;
        self.ensure_store(store)?;
        let txn = self.transaction(&[store], AccessMode::ReadWrite)?;
        let object_store = txn.store(store)?;
        for (key, value) in entries {
            let json = serde_json::to_value(value)?;
            object_store.put(&json, Some(key)).await?;
        }
        txn.done().await?;
        Ok(())
    }

    /// Clears the store and writes `entries` within the same transaction,
    /// so readers never observe the store part-filled.
    pub async fn replace_all<T: Serialize>(
        &self,
        store: &str,
        entries: &[(KeySpec, T)],
    ) -> Result<(), StorageError> {
        self.ready().await?;
        self.ensure_store(store)?;
        let txn = self.transaction(&[store], AccessMode::ReadWrite)?;
        let object_store = txn.store(store)?;
        object_store.clear().await?;
        for (key, value) in entries {
            let json = serde_json::to_value(value)?;
            put_value(&object_store, &json, key).await?;
        }
        txn.done().await?;
        Ok(())
    }

    pub async fn count(&self, store: &str) -> Result<u32, StorageError> {
        self.ready().await?;
        self.ensure_store(store)?;
        let txn = self.transaction(&[store], AccessMode::ReadOnly)?;
        let count = txn.store(store)?.count().await?;
        txn.done().await?;
        Ok(count)
    }

    pub async fn clear(&self, store: &str) -> Result<(), StorageError> {
        self.ready().await?;
        self.ensure_store(store)?;
        let txn = self.transaction(&[store], AccessMode::ReadWrite)?;
        txn.store(store)?.clear().await?;
        txn.done().await
    }

    /// Removes the record at `key`; absent keys are not an error.
    pub async fn delete(&self, store: &str, key: &Key) -> Result<(), StorageError> {
        self.ready().await?;
        self.ensure_store(store)?;
        let txn = self.transaction(&[store], AccessMode::ReadWrite)?;
        txn.store(store)?.delete(key).await?;
        txn.done().await
    }

    /// Migrates the database to version + 1, handing `stores` to the upgrade
    /// hook for creation. The handle is closed and reopened; operations
    /// arriving meanwhile wait for the new handle.
    ///
    /// Fails with [`StorageError::MigrationBlocked`] while another handle to
    /// the same database is open elsewhere; the previous version is restored
    /// and the call can be retried once the competing handle closes.
    pub async fn add_stores(&self, stores: &[String]) -> Result<(), StorageError> {
        self.ready().await?;
        let (db, requested) = {
            let mut state = self.state.borrow_mut();
            match std::mem::replace(&mut *state, SessionState::Reopening(Vec::new())) {
                SessionState::Open(db) => {
                    let requested = db.version() + 1;
                    (db, requested)
                }
                other => {
                    *state = other;
                    return Err(StorageError::Unavailable(format!(
                        "connection to {} is busy",
                        self.name
                    )));
                }
            }
        };

        log::info!(
            "migrating {} to v{requested} to add stores {stores:?}",
            self.name
        );
        db.close();

        match self
            .backend
            .open(&self.name, Some(requested), Rc::clone(&self.upgrade), stores)
            .await
        {
            Ok(db) => {
                self.finish_reopen(SessionState::Open(db));
                Ok(())
            }
            Err(err) => {
                log::warn!(
                    "migration of {} to v{requested} failed: {err}; reopening previous version",
                    self.name
                );
                match self
                    .backend
                    .open(&self.name, None, Rc::clone(&self.upgrade), &[])
                    .await
                {
                    Ok(db) => self.finish_reopen(SessionState::Open(db)),
                    Err(reopen_err) => {
                        log::warn!(
                            "could not reopen {} after failed migration: {reopen_err}",
                            self.name
                        );
                        self.finish_reopen(SessionState::Closed);
                    }
                }
                Err(err)
            }
        }
    }

    /// Resolves once the connection holds an open handle, queuing behind any
    /// in-flight migration.
    async fn ready(&self) -> Result<(), StorageError> {
        loop {
            let waiter = {
                let mut state = self.state.borrow_mut();
                match &mut *state {
                    SessionState::Open(_) => return Ok(()),
                    SessionState::Reopening(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        rx
                    }
                    SessionState::Closed => return Err(self.closed_error()),
                }
            };
            // Either outcome means the migration settled; re-check the state.
            let _ = waiter.await;
        }
    }

    fn finish_reopen(&self, next: SessionState<B::Database>) {
        let waiters = {
            let mut state = self.state.borrow_mut();
            let waiters = match &mut *state {
                SessionState::Reopening(waiters) => std::mem::take(waiters),
                _ => Vec::new(),
            };
            *state = next;
            waiters
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    fn transaction(
        &self,
        stores: &[&str],
        mode: AccessMode,
    ) -> Result<<B::Database as Database>::Transaction, StorageError> {
        match &*self.state.borrow() {
            SessionState::Open(db) => db.transaction(stores, mode),
            SessionState::Reopening(_) => Err(self.reopening_error()),
            SessionState::Closed => Err(self.closed_error()),
        }
    }

    fn ensure_store(&self, store: &str) -> Result<(), StorageError> {
        if self.has_store(store)? {
            Ok(())
        } else {
            Err(StorageError::StoreNotFound(store.to_string()))
        }
    }

    fn reopening_error(&self) -> StorageError {
        StorageError::Unavailable(format!("database {} is reopening", self.name))
    }

    fn closed_error(&self) -> StorageError {
        StorageError::Unavailable(format!("connection to {} was lost", self.name))
    }
}

async fn put_value<S: ObjectStore>(
    store: &S,
    value: &serde_json::Value,
    key: &KeySpec,
) -> Result<Key, StorageError> {
    match key {
        KeySpec::Auto => store.put(value, None).await,
        KeySpec::Explicit(key) => store.put(value, Some(key)).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{IndexSpec, MemoryBackend, StoreSpec};
    use futures::executor::block_on;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u32>,
        name: String,
        #[serde(rename = "type")]
        kind: String,
    }

    impl Entry {
        fn new(name: &str, kind: &str) -> Self {
            Self {
                id: None,
                name: name.to_string(),
                kind: kind.to_string(),
            }
        }
    }

    fn hook() -> UpgradeHook {
        Rc::new(|editor, change| {
            for name in &change.new_stores {
                if editor.contains(name) {
                    continue;
                }
                editor.create_store(
                    &StoreSpec::new(name)
                        .with_auto_keys()
                        .with_index(IndexSpec::new("byType", "type")),
                )?;
            }
            Ok(())
        })
    }

    fn connect(stores: &[&str]) -> (MemoryBackend, Connection<MemoryBackend>) {
        let backend = MemoryBackend::new();
        let names: Vec<String> = stores.iter().map(|s| s.to_string()).collect();
        let connection =
            block_on(Connection::open(backend.clone(), "test", hook(), &names)).unwrap();
        (backend, connection)
    }

    #[test]
    fn test_put_then_get_round_trips() {
        let (_, connection) = connect(&["2024"]);
        block_on(async {
            let key = connection
                .put("2024", &Entry::new("rent", "Expense"), KeySpec::Auto)
                .await
                .unwrap();
            assert_eq!(key, Key::Int(1));
            let entry: Entry = connection.get("2024", &key).await.unwrap();
            assert_eq!(entry.name, "rent");
        });
    }

    #[test]
    fn test_get_missing_key_is_not_found() {
        let (_, connection) = connect(&["2024"]);
        let result: Result<Entry, _> = block_on(connection.get("2024", &Key::Int(42)));
        assert!(matches!(result, Err(StorageError::NotFound(Key::Int(42)))));
    }

    #[test]
    fn test_scan_returns_records_in_key_order() {
        let (_, connection) = connect(&["2024"]);
        block_on(async {
            connection
                .put("2024", &Entry::new("late", "a"), KeySpec::Explicit(Key::Int(9)))
                .await
                .unwrap();
            connection
                .put("2024", &Entry::new("early", "a"), KeySpec::Explicit(Key::Int(1)))
                .await
                .unwrap();
            let entries: Vec<Entry> = connection.scan("2024").await.unwrap();
            assert_eq!(entries[0].name, "early");
            assert_eq!(entries[1].name, "late");
        });
    }

    #[test]
    fn test_scan_index_recovers_primary_keys() {
        let (_, connection) = connect(&["2024"]);
        block_on(async {
            let entries = vec![
                (KeySpec::Auto, Entry::new("salary", "Income")),
                (KeySpec::Auto, Entry::new("rent", "Expense")),
                (KeySpec::Auto, Entry::new("food", "Expense")),
            ];
            let keys = connection.put_many("2024", &entries).await.unwrap();
            assert_eq!(keys, vec![Key::Int(1), Key::Int(2), Key::Int(3)]);

            let expenses: Vec<Entry> = connection
                .scan_index(
                    "2024",
                    "byType",
                    &KeyRange::Only(Key::Text("Expense".to_string())),
                )
                .await
                .unwrap();
            assert_eq!(expenses.len(), 2);
            assert_eq!(expenses[0].id, Some(2));
            assert_eq!(expenses[0].name, "rent");
            assert_eq!(expenses[1].id, Some(3));
            assert_eq!(expenses[1].name, "food");
        });
    }

    #[test]
    fn test_replace_all_swaps_store_contents() {
        let (_, connection) = connect(&["2024"]);
        block_on(async {
            connection
                .put("2024", &Entry::new("old", "a"), KeySpec::Auto)
                .await
                .unwrap();
            let replacement = vec![
                (KeySpec::Explicit(Key::Int(1)), Entry::new("one", "a")),
                (KeySpec::Explicit(Key::Int(2)), Entry::new("two", "a")),
            ];
            connection.replace_all("2024", &replacement).await.unwrap();

            let entries: Vec<Entry> = connection.scan("2024").await.unwrap();
            let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
            assert_eq!(names, vec!["one", "two"]);
            assert_eq!(connection.count("2024").await.unwrap(), 2);
        });
    }

    #[test]
    fn test_update_many_overwrites_at_keys() {
        let (_, connection) = connect(&["2024"]);
        block_on(async {
            connection
                .put("2024", &Entry::new("before", "a"), KeySpec::Explicit(Key::Int(5)))
                .await
                .unwrap();
            connection
                .update_many("2024", &[(Key::Int(5), Entry::new("after", "a"))])
                .await
                .unwrap();
            let entry: Entry = connection.get("2024", &Key::Int(5)).await.unwrap();
            assert_eq!(entry.name, "after");
        });
    }

    #[test]
    fn test_delete_and_clear() {
        let (_, connection) = connect(&["2024"]);
        block_on(async {
            let key = connection
                .put("2024", &Entry::new("gone", "a"), KeySpec::Auto)
                .await
                .unwrap();
            connection.delete("2024", &key).await.unwrap();
            let result: Result<Entry, _> = connection.get("2024", &key).await;
            assert!(matches!(result, Err(StorageError::NotFound(_))));

            connection
                .put("2024", &Entry::new("other", "a"), KeySpec::Auto)
                .await
                .unwrap();
            connection.clear("2024").await.unwrap();
            assert_eq!(connection.count("2024").await.unwrap(), 0);
        });
    }

    #[test]
    fn test_unknown_store_is_store_not_found() {
        let (_, connection) = connect(&["2024"]);
        let result: Result<Vec<Entry>, _> = block_on(connection.scan("2030"));
        assert!(matches!(result, Err(StorageError::StoreNotFound(name)) if name == "2030"));
    }

    #[test]
    fn test_add_stores_bumps_version_by_one_per_call() {
        let (_, connection) = connect(&["2024"]);
        block_on(async {
            assert_eq!(connection.version().unwrap(), 1);
            connection.add_stores(&["2025".to_string()]).await.unwrap();
            assert_eq!(connection.version().unwrap(), 2);
            assert!(connection.has_store("2024").unwrap());
            assert!(connection.has_store("2025").unwrap());

            connection.add_stores(&["2026".to_string()]).await.unwrap();
            assert_eq!(connection.version().unwrap(), 3);
            assert!(!connection.is_migrating());
        });
    }

    #[test]
    fn test_blocked_migration_restores_connection_and_can_retry() {
        let (backend, connection) = connect(&["2024"]);
        block_on(async {
            connection
                .put("2024", &Entry::new("kept", "a"), KeySpec::Auto)
                .await
                .unwrap();

            let competing = backend.open("test", None, hook(), &[]).await.unwrap();
            let result = connection.add_stores(&["2025".to_string()]).await;
            assert!(matches!(
                result,
                Err(StorageError::MigrationBlocked { requested: 2 })
            ));

            // The previous version came back and data survived.
            assert_eq!(connection.version().unwrap(), 1);
            let entries: Vec<Entry> = connection.scan("2024").await.unwrap();
            assert_eq!(entries.len(), 1);

            competing.close();
            connection.add_stores(&["2025".to_string()]).await.unwrap();
            assert_eq!(connection.version().unwrap(), 2);
            assert!(connection.has_store("2025").unwrap());
        });
    }
}
