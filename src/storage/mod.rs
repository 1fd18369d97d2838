//! Storage abstraction over a versioned, transactional object store.
//!
//! The traits here describe the substrate the rest of the crate runs on: a
//! named database holding named object stores, each store keyed by integers
//! or strings, with optional secondary indexes over record fields. Opening a
//! database at a version above the stored one fires an upgrade hook that may
//! add stores; that hook is the only place the schema can change.
//!
//! Two backends implement the traits: [`MemoryBackend`] for native builds
//! and tests, and `IndexedDbBackend` on wasm32, where the browser's
//! IndexedDB provides the durable engine.
//!
//! Note: these traits do not require `Send` bounds since WASM is
//! single-threaded and JS types cannot be sent between threads.

pub mod connection;
#[cfg(target_arch = "wasm32")]
pub mod indexed_db;
pub mod memory;
pub mod registry;

pub use connection::Connection;
#[cfg(target_arch = "wasm32")]
pub use indexed_db::IndexedDbBackend;
pub use memory::MemoryBackend;
pub use registry::{ConnectionRegistry, RegistryConfig};

use std::fmt;
use std::future::Future;
use std::rc::Rc;

use crate::error::StorageError;

/// A record key: a caller-supplied or generator-assigned integer, or a
/// string.
///
/// Variant order encodes the substrate's collation: integer keys sort before
/// string keys, matching IndexedDB key ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Int(u32),
    Text(String),
}

impl Key {
    /// The key as a JSON value, used when a primary key is written back onto
    /// a record yielded by an index scan.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Key::Int(n) => serde_json::Value::from(*n),
            Key::Text(s) => serde_json::Value::from(s.clone()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{}", n),
            Key::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Whether a write receives a generator-assigned key or an explicit one.
///
/// Callers always state their intent; the storage layer never infers a key
/// from the fields of the record being written.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySpec {
    /// Let the store's key generator assign the next integer key.
    Auto,
    /// Insert or overwrite at exactly this key.
    Explicit(Key),
}

/// Criterion for index scans: everything, a single key, or an inclusive
/// range.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyRange {
    All,
    Only(Key),
    /// Keys at or above the bound.
    From(Key),
    /// Keys at or below the bound.
    To(Key),
    /// Keys between the bounds, inclusive on both ends.
    Between(Key, Key),
}

impl KeyRange {
    pub fn contains(&self, key: &Key) -> bool {
        match self {
            KeyRange::All => true,
            KeyRange::Only(only) => key == only,
            KeyRange::From(lower) => key >= lower,
            KeyRange::To(upper) => key <= upper,
            KeyRange::Between(lower, upper) => key >= lower && key <= upper,
        }
    }
}

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Declarative shape of an object store created during an upgrade.
#[derive(Debug, Clone)]
pub struct StoreSpec {
    pub name: String,
    pub auto_increment: bool,
    pub indexes: Vec<IndexSpec>,
}

impl StoreSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    /// Keys for this store come from an increasing integer generator when
    /// the caller does not supply one.
    pub fn with_auto_keys(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }
}

/// A secondary index over one record field.
///
/// Non-unique: several records may share the indexed value. The index maps
/// each value to the keys of the records holding it, in primary-key order.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: String,
    pub field: String,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            unique: false,
        }
    }
}

/// What an upgrade hook is told about the version change it runs inside.
#[derive(Debug, Clone)]
pub struct VersionChange {
    pub old_version: u32,
    pub new_version: u32,
    /// Store names the caller asked to have created by this change.
    pub new_stores: Vec<String>,
}

/// Hook fired by [`StorageBackend::open`] when the requested version exceeds
/// the stored one (including the very first open of a database). Runs once
/// per version change, inside the upgrade transaction; on error the upgrade
/// is abandoned and nothing is committed.
pub type UpgradeHook = Rc<dyn Fn(&mut dyn SchemaEditor, &VersionChange) -> Result<(), StorageError>>;

/// Schema operations available only while an upgrade hook runs.
pub trait SchemaEditor {
    fn contains(&self, store: &str) -> bool;
    fn create_store(&mut self, spec: &StoreSpec) -> Result<(), StorageError>;
}

/// One entry yielded by a cursor walk.
#[derive(Debug, Clone)]
pub struct CursorEntry {
    pub primary_key: Key,
    pub value: serde_json::Value,
}

/// Entry point to a storage engine: opens and deletes named databases.
pub trait StorageBackend: Clone {
    type Database: Database;

    /// Opens `name`, requesting `version` (or the stored version, creating
    /// the database at version 1 when it does not exist yet). `upgrade` is
    /// fired with `new_stores` whenever the database is new or the requested
    /// version exceeds the stored one.
    ///
    /// A version bump while another handle to the same database is open
    /// fails with [`StorageError::MigrationBlocked`]; the caller must close
    /// the competing handle and retry.
    fn open(
        &self,
        name: &str,
        version: Option<u32>,
        upgrade: UpgradeHook,
        new_stores: &[String],
    ) -> impl Future<Output = Result<Self::Database, StorageError>>;

    /// Removes a database and everything in it.
    fn delete_database(&self, name: &str) -> impl Future<Output = Result<(), StorageError>>;
}

/// An open handle to one database.
///
/// Store names and the version are fixed for the life of the handle; a
/// migration closes the handle and opens a fresh one.
pub trait Database {
    type Transaction: Transaction;

    fn name(&self) -> String;
    fn version(&self) -> u32;
    fn store_names(&self) -> Vec<String>;
    fn has_store(&self, name: &str) -> bool;

    /// Starts a transaction scoped to `stores`. Every named store must exist
    /// in the current schema.
    fn transaction(&self, stores: &[&str], mode: AccessMode)
        -> Result<Self::Transaction, StorageError>;

    fn close(&self);
}

/// A transaction over one or more stores.
///
/// Operations within a transaction observe a consistent snapshot and commit
/// atomically as a unit when [`Transaction::done`] resolves.
pub trait Transaction {
    type Store: ObjectStore;

    /// A handle to one store in the transaction's scope.
    fn store(&self, name: &str) -> Result<Self::Store, StorageError>;

    /// Awaits durable completion of the whole batch.
    fn done(self) -> impl Future<Output = Result<(), StorageError>>;
}

/// Record operations on one store, valid for the life of its transaction.
pub trait ObjectStore {
    type Index: Index;
    type Cursor: Cursor;

    fn get(
        &self,
        key: &Key,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, StorageError>>;

    /// Inserts or overwrites a record, returning the key it was stored
    /// under. With `key: None` the store's generator assigns the next
    /// integer key.
    fn put(
        &self,
        value: &serde_json::Value,
        key: Option<&Key>,
    ) -> impl Future<Output = Result<Key, StorageError>>;

    /// Removes the record at `key`; succeeds whether or not one was there.
    fn delete(&self, key: &Key) -> impl Future<Output = Result<(), StorageError>>;

    fn clear(&self) -> impl Future<Output = Result<(), StorageError>>;

    fn count(&self) -> impl Future<Output = Result<u32, StorageError>>;

    /// A cursor over every record in key order.
    fn open_cursor(&self) -> Result<Self::Cursor, StorageError>;

    fn index(&self, name: &str) -> Result<Self::Index, StorageError>;
}

/// A secondary index attached to a store.
pub trait Index {
    type Cursor: Cursor;

    /// A cursor over the records matching `range`, ordered by indexed value
    /// and then by primary key.
    fn open_cursor(&self, range: &KeyRange) -> Result<Self::Cursor, StorageError>;
}

/// A walk over records; yields `None` once exhausted.
pub trait Cursor {
    fn next_entry(&mut self) -> impl Future<Output = Result<Option<CursorEntry>, StorageError>>;
}
