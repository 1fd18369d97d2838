//! In-memory storage engine for native builds and tests.
//!
//! One engine state is shared across backend clones, so the close-and-reopen
//! sequence a migration performs observes the same data and version the
//! previous handle wrote. Transactions stage working copies of their scoped
//! stores and commit on [`Transaction::done`]; a transaction dropped without
//! `done` discards its staged writes. Overlapping read-write transactions
//! are not serialized: the last one committed wins per store.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::error::StorageError;

use super::{
    AccessMode, Cursor, CursorEntry, Database, Index, IndexSpec, Key, KeyRange, ObjectStore,
    SchemaEditor, StorageBackend, StoreSpec, Transaction, UpgradeHook, VersionChange,
};

/// Storage engine backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Rc<RefCell<EngineState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default)]
struct EngineState {
    databases: HashMap<String, StoredDatabase>,
}

#[derive(Clone, Default)]
struct StoredDatabase {
    version: u32,
    open_handles: u32,
    stores: BTreeMap<String, StoredStore>,
}

#[derive(Clone)]
struct StoredStore {
    auto_increment: bool,
    /// Next generator key. Starts at 1 and is never reset, so keys stay
    /// unique across the life of the store even after a clear.
    next_key: u32,
    indexes: Vec<IndexSpec>,
    records: BTreeMap<Key, serde_json::Value>,
}

impl StorageBackend for MemoryBackend {
    type Database = MemoryDatabase;

    async fn open(
        &self,
        name: &str,
        version: Option<u32>,
        upgrade: UpgradeHook,
        new_stores: &[String],
    ) -> Result<MemoryDatabase, StorageError> {
        if version == Some(0) {
            return Err(StorageError::Unavailable(
                "version 0 is not a valid database version".to_string(),
            ));
        }

        let mut state = self.state.borrow_mut();
        let stored_version = state.databases.get(name).map(|db| db.version);

        let upgrade_to = match (stored_version, version) {
            (None, requested) => Some((0, requested.unwrap_or(1))),
            (Some(current), Some(requested)) if requested > current => {
                let handles = state
                    .databases
                    .get(name)
                    .map(|db| db.open_handles)
                    .unwrap_or(0);
                if handles > 0 {
                    log::warn!(
                        "version bump of {name} to v{requested} blocked by {handles} open handle(s)"
                    );
                    return Err(StorageError::MigrationBlocked { requested });
                }
                Some((current, requested))
            }
            (Some(current), Some(requested)) if requested < current => {
                return Err(StorageError::Unavailable(format!(
                    "requested version {requested} of {name} is below stored version {current}"
                )));
            }
            _ => None,
        };

        if let Some((old_version, new_version)) = upgrade_to {
            // Upgrade a working copy; an error from the hook leaves the
            // stored database untouched.
            let mut working = state.databases.get(name).cloned().unwrap_or_default();
            let change = VersionChange {
                old_version,
                new_version,
                new_stores: new_stores.to_vec(),
            };
            let mut editor = MemorySchemaEditor {
                stores: &mut working.stores,
            };
            (upgrade)(&mut editor, &change)?;
            working.version = new_version;
            state.databases.insert(name.to_string(), working);
            log::debug!("upgraded database {name} from v{old_version} to v{new_version}");
        }

        let db = state.databases.get_mut(name).ok_or_else(|| {
            StorageError::Unavailable(format!("database {name} disappeared during open"))
        })?;
        db.open_handles += 1;
        Ok(MemoryDatabase {
            state: Rc::clone(&self.state),
            name: name.to_string(),
            version: db.version,
            store_names: db.stores.keys().cloned().collect(),
            closed: Cell::new(false),
        })
    }

    async fn delete_database(&self, name: &str) -> Result<(), StorageError> {
        self.state.borrow_mut().databases.remove(name);
        log::debug!("deleted database {name}");
        Ok(())
    }
}

struct MemorySchemaEditor<'a> {
    stores: &'a mut BTreeMap<String, StoredStore>,
}

impl SchemaEditor for MemorySchemaEditor<'_> {
    fn contains(&self, store: &str) -> bool {
        self.stores.contains_key(store)
    }

    fn create_store(&mut self, spec: &StoreSpec) -> Result<(), StorageError> {
        if self.stores.contains_key(&spec.name) {
            return Err(StorageError::WriteFailed(format!(
                "object store {} already exists",
                spec.name
            )));
        }
        self.stores.insert(
            spec.name.clone(),
            StoredStore {
                auto_increment: spec.auto_increment,
                next_key: 1,
                indexes: spec.indexes.clone(),
                records: BTreeMap::new(),
            },
        );
        Ok(())
    }
}

/// An open handle to an in-memory database. The schema it exposes is the one
/// current when it was opened.
pub struct MemoryDatabase {
    state: Rc<RefCell<EngineState>>,
    name: String,
    version: u32,
    store_names: Vec<String>,
    closed: Cell<bool>,
}

impl Database for MemoryDatabase {
    type Transaction = MemoryTransaction;

    fn name(&self) -> String {
        self.name.clone()
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn store_names(&self) -> Vec<String> {
        self.store_names.clone()
    }

    fn has_store(&self, name: &str) -> bool {
        self.store_names.iter().any(|store| store == name)
    }

    fn transaction(
        &self,
        stores: &[&str],
        mode: AccessMode,
    ) -> Result<MemoryTransaction, StorageError> {
        if self.closed.get() {
            return Err(StorageError::Unavailable(format!(
                "connection to {} is closed",
                self.name
            )));
        }
        let state = self.state.borrow();
        let db = state.databases.get(&self.name).ok_or_else(|| {
            StorageError::Unavailable(format!("database {} was deleted", self.name))
        })?;
        let mut staged = BTreeMap::new();
        for store in stores {
            let stored = db
                .stores
                .get(*store)
                .ok_or_else(|| StorageError::StoreNotFound((*store).to_string()))?;
            staged.insert((*store).to_string(), stored.clone());
        }
        Ok(MemoryTransaction {
            state: Rc::clone(&self.state),
            db_name: self.name.clone(),
            mode,
            staged: Rc::new(RefCell::new(staged)),
        })
    }

    fn close(&self) {
        if !self.closed.replace(true) {
            if let Some(db) = self.state.borrow_mut().databases.get_mut(&self.name) {
                db.open_handles = db.open_handles.saturating_sub(1);
            }
        }
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        self.close();
    }
}

/// A staged batch of reads and writes over scoped stores.
pub struct MemoryTransaction {
    state: Rc<RefCell<EngineState>>,
    db_name: String,
    mode: AccessMode,
    staged: Rc<RefCell<BTreeMap<String, StoredStore>>>,
}

impl Transaction for MemoryTransaction {
    type Store = MemoryObjectStore;

    fn store(&self, name: &str) -> Result<MemoryObjectStore, StorageError> {
        if !self.staged.borrow().contains_key(name) {
            return Err(StorageError::StoreNotFound(name.to_string()));
        }
        Ok(MemoryObjectStore {
            staged: Rc::clone(&self.staged),
            name: name.to_string(),
            mode: self.mode,
        })
    }

    async fn done(self) -> Result<(), StorageError> {
        if self.mode == AccessMode::ReadWrite {
            let staged = std::mem::take(&mut *self.staged.borrow_mut());
            let mut state = self.state.borrow_mut();
            let db = state.databases.get_mut(&self.db_name).ok_or_else(|| {
                StorageError::WriteFailed(format!(
                    "database {} was deleted mid-transaction",
                    self.db_name
                ))
            })?;
            for (name, store) in staged {
                db.stores.insert(name, store);
            }
        }
        Ok(())
    }
}

/// Record operations over one staged store.
pub struct MemoryObjectStore {
    staged: Rc<RefCell<BTreeMap<String, StoredStore>>>,
    name: String,
    mode: AccessMode,
}

impl MemoryObjectStore {
    fn ensure_writable(&self) -> Result<(), StorageError> {
        if self.mode == AccessMode::ReadOnly {
            return Err(StorageError::WriteFailed(format!(
                "object store {} is part of a read-only transaction",
                self.name
            )));
        }
        Ok(())
    }
}

impl ObjectStore for MemoryObjectStore {
    type Index = MemoryIndex;
    type Cursor = MemoryCursor;

    async fn get(&self, key: &Key) -> Result<Option<serde_json::Value>, StorageError> {
        let staged = self.staged.borrow();
        let store = staged
            .get(&self.name)
            .ok_or_else(|| StorageError::StoreNotFound(self.name.clone()))?;
        Ok(store.records.get(key).cloned())
    }

    async fn put(
        &self,
        value: &serde_json::Value,
        key: Option<&Key>,
    ) -> Result<Key, StorageError> {
        self.ensure_writable()?;
        let mut staged = self.staged.borrow_mut();
        let store = staged
            .get_mut(&self.name)
            .ok_or_else(|| StorageError::StoreNotFound(self.name.clone()))?;
        let key = match key {
            Some(key) => {
                // Explicit integer keys advance the generator past
                // themselves, matching IndexedDB's key generator.
                if let Key::Int(n) = key {
                    if *n >= store.next_key {
                        store.next_key = n + 1;
                    }
                }
                key.clone()
            }
            None => {
                if !store.auto_increment {
                    return Err(StorageError::WriteFailed(format!(
                        "object store {} has no key generator",
                        self.name
                    )));
                }
                let key = Key::Int(store.next_key);
                store.next_key += 1;
                key
            }
        };
        store.records.insert(key.clone(), value.clone());
        Ok(key)
    }

    async fn delete(&self, key: &Key) -> Result<(), StorageError> {
        self.ensure_writable()?;
        let mut staged = self.staged.borrow_mut();
        let store = staged
            .get_mut(&self.name)
            .ok_or_else(|| StorageError::StoreNotFound(self.name.clone()))?;
        store.records.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.ensure_writable()?;
        let mut staged = self.staged.borrow_mut();
        let store = staged
            .get_mut(&self.name)
            .ok_or_else(|| StorageError::StoreNotFound(self.name.clone()))?;
        // The key generator survives a clear.
        store.records.clear();
        Ok(())
    }

    async fn count(&self) -> Result<u32, StorageError> {
        let staged = self.staged.borrow();
        let store = staged
            .get(&self.name)
            .ok_or_else(|| StorageError::StoreNotFound(self.name.clone()))?;
        Ok(store.records.len() as u32)
    }

    fn open_cursor(&self) -> Result<MemoryCursor, StorageError> {
        let staged = self.staged.borrow();
        let store = staged
            .get(&self.name)
            .ok_or_else(|| StorageError::StoreNotFound(self.name.clone()))?;
        let entries: Vec<CursorEntry> = store
            .records
            .iter()
            .map(|(key, value)| CursorEntry {
                primary_key: key.clone(),
                value: value.clone(),
            })
            .collect();
        Ok(MemoryCursor {
            entries: entries.into_iter(),
        })
    }

    fn index(&self, name: &str) -> Result<MemoryIndex, StorageError> {
        let staged = self.staged.borrow();
        let store = staged
            .get(&self.name)
            .ok_or_else(|| StorageError::StoreNotFound(self.name.clone()))?;
        let spec = store
            .indexes
            .iter()
            .find(|index| index.name == name)
            .ok_or_else(|| StorageError::StoreNotFound(format!("{}.{}", self.name, name)))?;

        // Materialize (indexed value, entry) rows up front; the cursor then
        // filters and walks them in index order. Records without a keyable
        // value in the indexed field are skipped.
        let mut rows: Vec<(Key, CursorEntry)> = Vec::new();
        for (primary_key, value) in &store.records {
            let Some(index_key) = index_key_of(value, &spec.field) else {
                continue;
            };
            rows.push((
                index_key,
                CursorEntry {
                    primary_key: primary_key.clone(),
                    value: value.clone(),
                },
            ));
        }
        rows.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.primary_key.cmp(&b.1.primary_key))
        });
        Ok(MemoryIndex { rows })
    }
}

fn index_key_of(value: &serde_json::Value, field: &str) -> Option<Key> {
    match value.get(field)? {
        serde_json::Value::String(s) => Some(Key::Text(s.clone())),
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Key::Int),
        _ => None,
    }
}

/// A secondary index snapshot within one transaction.
pub struct MemoryIndex {
    rows: Vec<(Key, CursorEntry)>,
}

impl Index for MemoryIndex {
    type Cursor = MemoryCursor;

    fn open_cursor(&self, range: &KeyRange) -> Result<MemoryCursor, StorageError> {
        let entries: Vec<CursorEntry> = self
            .rows
            .iter()
            .filter(|(index_key, _)| range.contains(index_key))
            .map(|(_, entry)| entry.clone())
            .collect();
        Ok(MemoryCursor {
            entries: entries.into_iter(),
        })
    }
}

/// Cursor over a snapshot taken when it was opened.
pub struct MemoryCursor {
    entries: std::vec::IntoIter<CursorEntry>,
}

impl Cursor for MemoryCursor {
    async fn next_entry(&mut self) -> Result<Option<CursorEntry>, StorageError> {
        Ok(self.entries.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use serde_json::json;

    fn create_stores_hook() -> UpgradeHook {
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

    fn open(
        backend: &MemoryBackend,
        version: Option<u32>,
        stores: &[&str],
    ) -> Result<MemoryDatabase, StorageError> {
        let names: Vec<String> = stores.iter().map(|s| s.to_string()).collect();
        block_on(backend.open("test", version, create_stores_hook(), &names))
    }

    fn put(db: &MemoryDatabase, store: &str, value: serde_json::Value) -> Key {
        block_on(async {
            let txn = db.transaction(&[store], AccessMode::ReadWrite).unwrap();
            let key = txn.store(store).unwrap().put(&value, None).await.unwrap();
            txn.done().await.unwrap();
            key
        })
    }

    #[test]
    fn test_first_open_creates_database_at_v1_with_seed_stores() {
        let backend = MemoryBackend::new();
        let db = open(&backend, None, &["2024"]).unwrap();
        assert_eq!(db.version(), 1);
        assert_eq!(db.store_names(), vec!["2024".to_string()]);
        assert!(db.has_store("2024"));
        assert!(!db.has_store("2025"));
    }

    #[test]
    fn test_reopen_preserves_data_and_version() {
        let backend = MemoryBackend::new();
        let db = open(&backend, None, &["2024"]).unwrap();
        let key = put(&db, "2024", json!({"name": "rent"}));
        db.close();

        let db = open(&backend, None, &[]).unwrap();
        assert_eq!(db.version(), 1);
        let value = block_on(async {
            let txn = db.transaction(&["2024"], AccessMode::ReadOnly).unwrap();
            txn.store("2024").unwrap().get(&key).await.unwrap()
        });
        assert_eq!(value, Some(json!({"name": "rent"})));
    }

    #[test]
    fn test_version_below_stored_is_rejected() {
        let backend = MemoryBackend::new();
        let db = open(&backend, Some(3), &["2024"]).unwrap();
        db.close();
        let result = open(&backend, Some(2), &[]);
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
    }

    #[test]
    fn test_bump_with_live_handle_is_blocked() {
        let backend = MemoryBackend::new();
        let live = open(&backend, None, &["2024"]).unwrap();

        let result = open(&backend, Some(2), &["2025"]);
        assert!(matches!(
            result,
            Err(StorageError::MigrationBlocked { requested: 2 })
        ));

        live.close();
        let db = open(&backend, Some(2), &["2025"]).unwrap();
        assert_eq!(db.version(), 2);
        assert!(db.has_store("2024"));
        assert!(db.has_store("2025"));
    }

    #[test]
    fn test_dropped_transaction_discards_staged_writes() {
        let backend = MemoryBackend::new();
        let db = open(&backend, None, &["2024"]).unwrap();
        block_on(async {
            let txn = db.transaction(&["2024"], AccessMode::ReadWrite).unwrap();
            txn.store("2024")
                .unwrap()
                .put(&json!({"name": "dropped"}), None)
                .await
                .unwrap();
            drop(txn);

            let txn = db.transaction(&["2024"], AccessMode::ReadOnly).unwrap();
            assert_eq!(txn.store("2024").unwrap().count().await.unwrap(), 0);
        });
    }

    #[test]
    fn test_read_only_transaction_rejects_writes() {
        let backend = MemoryBackend::new();
        let db = open(&backend, None, &["2024"]).unwrap();
        let result = block_on(async {
            let txn = db.transaction(&["2024"], AccessMode::ReadOnly).unwrap();
            txn.store("2024").unwrap().put(&json!({}), None).await
        });
        assert!(matches!(result, Err(StorageError::WriteFailed(_))));
    }

    #[test]
    fn test_auto_keys_continue_after_clear_and_explicit_puts() {
        let backend = MemoryBackend::new();
        let db = open(&backend, None, &["2024"]).unwrap();

        assert_eq!(put(&db, "2024", json!({"n": 1})), Key::Int(1));
        assert_eq!(put(&db, "2024", json!({"n": 2})), Key::Int(2));

        block_on(async {
            let txn = db.transaction(&["2024"], AccessMode::ReadWrite).unwrap();
            let store = txn.store("2024").unwrap();
            store.clear().await.unwrap();
            // Explicit key ahead of the generator pulls it forward.
            store
                .put(&json!({"n": 9}), Some(&Key::Int(9)))
                .await
                .unwrap();
            txn.done().await.unwrap();
        });

        assert_eq!(put(&db, "2024", json!({"n": 10})), Key::Int(10));
    }

    #[test]
    fn test_index_rows_sorted_and_filtered() {
        let backend = MemoryBackend::new();
        let db = open(&backend, None, &["2024"]).unwrap();
        put(&db, "2024", json!({"type": "Income", "name": "salary"}));
        put(&db, "2024", json!({"type": "Expense", "name": "rent"}));
        put(&db, "2024", json!({"type": "Expense", "name": "food"}));
        put(&db, "2024", json!({"name": "untyped"}));

        let entries = block_on(async {
            let txn = db.transaction(&["2024"], AccessMode::ReadOnly).unwrap();
            let store = txn.store("2024").unwrap();
            let index = store.index("byType").unwrap();
            let mut cursor = index
                .open_cursor(&KeyRange::Only(Key::Text("Expense".to_string())))
                .unwrap();
            let mut entries = Vec::new();
            while let Some(entry) = cursor.next_entry().await.unwrap() {
                entries.push(entry);
            }
            entries
        });

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].primary_key, Key::Int(2));
        assert_eq!(entries[0].value["name"], "rent");
        assert_eq!(entries[1].primary_key, Key::Int(3));
        assert_eq!(entries[1].value["name"], "food");
    }

    #[test]
    fn test_unknown_store_and_index_are_reported() {
        let backend = MemoryBackend::new();
        let db = open(&backend, None, &["2024"]).unwrap();

        assert!(matches!(
            db.transaction(&["2025"], AccessMode::ReadOnly),
            Err(StorageError::StoreNotFound(_))
        ));

        let result = block_on(async {
            let txn = db.transaction(&["2024"], AccessMode::ReadOnly).unwrap();
            txn.store("2024").unwrap().index("byMonth").map(|_| ())
        });
        assert!(matches!(result, Err(StorageError::StoreNotFound(_))));
    }

    #[test]
    fn test_upgrade_hook_error_abandons_upgrade() {
        let backend = MemoryBackend::new();
        let db = open(&backend, None, &["2024"]).unwrap();
        db.close();

        let failing: UpgradeHook = Rc::new(|_, _| {
            Err(StorageError::WriteFailed("schema change refused".to_string()))
        });
        let result = block_on(backend.open("test", Some(2), failing, &["2025".to_string()]));
        assert!(matches!(result, Err(StorageError::WriteFailed(_))));

        // The failed bump left the database at its previous version.
        let db = open(&backend, None, &[]).unwrap();
        assert_eq!(db.version(), 1);
        assert!(!db.has_store("2025"));
    }

    #[test]
    fn test_delete_database_removes_everything() {
        let backend = MemoryBackend::new();
        let db = open(&backend, None, &["2024"]).unwrap();
        put(&db, "2024", json!({"n": 1}));
        db.close();

        block_on(backend.delete_database("test")).unwrap();

        let db = open(&backend, None, &["2024"]).unwrap();
        assert_eq!(db.version(), 1);
        let count = block_on(async {
            let txn = db.transaction(&["2024"], AccessMode::ReadOnly).unwrap();
            txn.store("2024").unwrap().count().await.unwrap()
        });
        assert_eq!(count, 0);
    }
}
