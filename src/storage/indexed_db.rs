//! IndexedDB storage engine for wasm32 builds.
//!
//! Maps the storage traits onto the web-sys IndexedDB bindings. Requests and
//! transactions are bridged to futures through oneshot channels wired into
//! their success and error handlers; handlers are unset and dropped once the
//! awaited event has fired. Values cross the JS boundary as JSON text.

use std::cell::RefCell;
use std::rc::Rc;

use wasm_bindgen::closure::Closure;
use wasm_bindgen::{JsCast, JsValue};
use web_sys::{
    IdbCursorWithValue, IdbDatabase, IdbIndexParameters, IdbKeyRange, IdbObjectStoreParameters,
    IdbOpenDbRequest, IdbRequest, IdbTransaction, IdbTransactionMode,
};

use crate::error::StorageError;

use super::{
    AccessMode, Cursor, CursorEntry, Database, Index, Key, KeyRange, ObjectStore, SchemaEditor,
    StorageBackend, StoreSpec, Transaction, UpgradeHook, VersionChange,
};

/// Storage engine backed by the browser's IndexedDB.
#[derive(Clone, Default)]
pub struct IndexedDbBackend;

impl IndexedDbBackend {
    pub fn new() -> Self {
        Self
    }
}

impl StorageBackend for IndexedDbBackend {
    type Database = IndexedDbDatabase;

    async fn open(
        &self,
        name: &str,
        version: Option<u32>,
        upgrade: UpgradeHook,
        new_stores: &[String],
    ) -> Result<IndexedDbDatabase, StorageError> {
        let factory = indexed_db_factory()?;
        let request = match version {
            Some(version) => factory.open_with_u32(name, version),
            None => factory.open(name),
        }
        .map_err(|e| StorageError::Unavailable(format!("failed to open {name}: {e:?}")))?;

        let db = wait_for_open(&request, upgrade, new_stores.to_vec()).await?;
        log::info!("opened IndexedDB {} v{}", db.name(), db.version() as u32);
        Ok(IndexedDbDatabase { db })
    }

    async fn delete_database(&self, name: &str) -> Result<(), StorageError> {
        let factory = indexed_db_factory()?;
        let request = factory
            .delete_database(name)
            .map_err(|e| StorageError::Unavailable(format!("failed to delete {name}: {e:?}")))?;
        wait_for_request(&request)
            .await
            .map_err(StorageError::Unavailable)?;
        log::info!("deleted IndexedDB {name}");
        Ok(())
    }
}

fn indexed_db_factory() -> Result<web_sys::IdbFactory, StorageError> {
    let window = web_sys::window()
        .ok_or_else(|| StorageError::Unavailable("no window object".to_string()))?;
    window
        .indexed_db()
        .map_err(|e| StorageError::Unavailable(format!("IndexedDB error: {e:?}")))?
        .ok_or_else(|| StorageError::Unavailable("IndexedDB not available".to_string()))
}

/// Schema access handed to upgrade hooks while a versionchange transaction
/// is running.
struct IdbSchemaEditor<'a> {
    db: &'a IdbDatabase,
}

impl SchemaEditor for IdbSchemaEditor<'_> {
    fn contains(&self, store: &str) -> bool {
        self.db.object_store_names().contains(store)
    }

    fn create_store(&mut self, spec: &StoreSpec) -> Result<(), StorageError> {
        let params = IdbObjectStoreParameters::new();
        params.set_auto_increment(spec.auto_increment);
        let store = self
            .db
            .create_object_store_with_optional_parameters(&spec.name, &params)
            .map_err(|e| {
                StorageError::WriteFailed(format!(
                    "failed to create object store {}: {e:?}",
                    spec.name
                ))
            })?;
        for index in &spec.indexes {
            let index_params = IdbIndexParameters::new();
            index_params.set_unique(index.unique);
            store
                .create_index_with_str_and_optional_parameters(
                    &index.name,
                    &index.field,
                    &index_params,
                )
                .map_err(|e| {
                    StorageError::WriteFailed(format!(
                        "failed to create index {}: {e:?}",
                        index.name
                    ))
                })?;
        }
        log::info!("created object store {}", spec.name);
        Ok(())
    }
}

/// An open IndexedDB handle.
pub struct IndexedDbDatabase {
    db: IdbDatabase,
}

impl Database for IndexedDbDatabase {
    type Transaction = IndexedDbTransaction;

    fn name(&self) -> String {
        self.db.name()
    }

    fn version(&self) -> u32 {
        self.db.version() as u32
    }

    fn store_names(&self) -> Vec<String> {
        let list = self.db.object_store_names();
        let mut names = Vec::with_capacity(list.length() as usize);
        for i in 0..list.length() {
            if let Some(name) = list.item(i) {
                names.push(name);
            }
        }
        names
    }

    fn has_store(&self, name: &str) -> bool {
        self.db.object_store_names().contains(name)
    }

    fn transaction(
        &self,
        stores: &[&str],
        mode: AccessMode,
    ) -> Result<IndexedDbTransaction, StorageError> {
        let scope = js_sys::Array::new();
        for store in stores {
            scope.push(&JsValue::from_str(store));
        }
        let txn = self
            .db
            .transaction_with_str_sequence_and_mode(&scope, idb_mode(mode))
            .map_err(|e| transaction_error(stores, &e))?;
        Ok(IndexedDbTransaction { txn })
    }

    fn close(&self) {
        self.db.close();
    }
}

fn idb_mode(mode: AccessMode) -> IdbTransactionMode {
    match mode {
        AccessMode::ReadOnly => IdbTransactionMode::Readonly,
        AccessMode::ReadWrite => IdbTransactionMode::Readwrite,
    }
}

fn transaction_error(stores: &[&str], err: &JsValue) -> StorageError {
    if let Some(exception) = err.dyn_ref::<web_sys::DomException>() {
        if exception.name() == "NotFoundError" {
            return StorageError::StoreNotFound(stores.join(", "));
        }
    }
    StorageError::Unavailable(format!("failed to start transaction: {err:?}"))
}

/// One IndexedDB transaction, scoped at creation.
pub struct IndexedDbTransaction {
    txn: IdbTransaction,
}

impl Transaction for IndexedDbTransaction {
    type Store = IndexedDbObjectStore;

    fn store(&self, name: &str) -> Result<IndexedDbObjectStore, StorageError> {
        let store = self
            .txn
            .object_store(name)
            .map_err(|_| StorageError::StoreNotFound(name.to_string()))?;
        Ok(IndexedDbObjectStore { store })
    }

    async fn done(self) -> Result<(), StorageError> {
        wait_for_transaction(&self.txn)
            .await
            .map_err(StorageError::WriteFailed)
    }
}

/// Record operations over one store within a transaction.
pub struct IndexedDbObjectStore {
    store: web_sys::IdbObjectStore,
}

impl ObjectStore for IndexedDbObjectStore {
    type Index = IndexedDbIndex;
    type Cursor = IndexedDbCursor;

    async fn get(&self, key: &Key) -> Result<Option<serde_json::Value>, StorageError> {
        let request = self
            .store
            .get(&key_to_js(key))
            .map_err(|e| StorageError::Unavailable(format!("get failed: {e:?}")))?;
        let result = wait_for_request(&request)
            .await
            .map_err(StorageError::Unavailable)?;
        if result.is_undefined() || result.is_null() {
            return Ok(None);
        }
        js_to_value(&result).map(Some)
    }

    async fn put(
        &self,
        value: &serde_json::Value,
        key: Option<&Key>,
    ) -> Result<Key, StorageError> {
        let js = value_to_js(value)?;
        let request = match key {
            Some(key) => self.store.put_with_key(&js, &key_to_js(key)),
            None => self.store.put(&js),
        }
        .map_err(|e| StorageError::WriteFailed(format!("put failed: {e:?}")))?;
        let result = wait_for_request(&request)
            .await
            .map_err(StorageError::WriteFailed)?;
        js_to_key(&result)
    }

    async fn delete(&self, key: &Key) -> Result<(), StorageError> {
        let request = self
            .store
            .delete(&key_to_js(key))
            .map_err(|e| StorageError::WriteFailed(format!("delete failed: {e:?}")))?;
        wait_for_request(&request)
            .await
            .map_err(StorageError::WriteFailed)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let request = self
            .store
            .clear()
            .map_err(|e| StorageError::WriteFailed(format!("clear failed: {e:?}")))?;
        wait_for_request(&request)
            .await
            .map_err(StorageError::WriteFailed)?;
        Ok(())
    }

    async fn count(&self) -> Result<u32, StorageError> {
        let request = self
            .store
            .count()
            .map_err(|e| StorageError::Unavailable(format!("count failed: {e:?}")))?;
        let result = wait_for_request(&request)
            .await
            .map_err(StorageError::Unavailable)?;
        Ok(result.as_f64().unwrap_or(0.0) as u32)
    }

    fn open_cursor(&self) -> Result<IndexedDbCursor, StorageError> {
        let request = self
            .store
            .open_cursor()
            .map_err(|e| StorageError::Unavailable(format!("cursor failed: {e:?}")))?;
        Ok(IndexedDbCursor::new(request))
    }

    fn index(&self, name: &str) -> Result<IndexedDbIndex, StorageError> {
        let index = self.store.index(name).map_err(|_| {
            StorageError::StoreNotFound(format!("{}.{}", self.store.name(), name))
        })?;
        Ok(IndexedDbIndex { index })
    }
}

/// A secondary index within a transaction.
pub struct IndexedDbIndex {
    index: web_sys::IdbIndex,
}

impl Index for IndexedDbIndex {
    type Cursor = IndexedDbCursor;

    fn open_cursor(&self, range: &KeyRange) -> Result<IndexedDbCursor, StorageError> {
        let request = match key_range_to_js(range)? {
            Some(js_range) => self.index.open_cursor_with_range(&js_range),
            None => self.index.open_cursor(),
        }
        .map_err(|e| StorageError::Unavailable(format!("index cursor failed: {e:?}")))?;
        Ok(IndexedDbCursor::new(request))
    }
}

/// Walks an IndexedDB cursor one success event at a time: each advance
/// re-awaits the same request, which fires again per entry until the cursor
/// reports null.
pub struct IndexedDbCursor {
    request: IdbRequest,
    cursor: Option<IdbCursorWithValue>,
    finished: bool,
}

impl IndexedDbCursor {
    fn new(request: IdbRequest) -> Self {
        Self {
            request,
            cursor: None,
            finished: false,
        }
    }
}

impl Cursor for IndexedDbCursor {
    async fn next_entry(&mut self) -> Result<Option<CursorEntry>, StorageError> {
        if self.finished {
            return Ok(None);
        }
        if let Some(cursor) = &self.cursor {
            cursor
                .continue_()
                .map_err(|e| StorageError::Unavailable(format!("cursor advance failed: {e:?}")))?;
        }
        let result = wait_for_request(&self.request)
            .await
            .map_err(StorageError::Unavailable)?;
        if result.is_undefined() || result.is_null() {
            self.finished = true;
            self.cursor = None;
            return Ok(None);
        }
        let cursor: IdbCursorWithValue = result.dyn_into().map_err(|_| {
            StorageError::Unavailable("cursor request yielded a non-cursor".to_string())
        })?;
        let primary_key = cursor
            .primary_key()
            .map_err(|e| StorageError::Unavailable(format!("cursor key failed: {e:?}")))
            .and_then(|key| js_to_key(&key))?;
        let value = cursor
            .value()
            .map_err(|e| StorageError::Unavailable(format!("cursor value failed: {e:?}")))
            .and_then(|value| js_to_value(&value))?;
        self.cursor = Some(cursor);
        Ok(Some(CursorEntry { primary_key, value }))
    }
}

// ============================================================================
// JS boundary conversions
// ============================================================================

fn key_to_js(key: &Key) -> JsValue {
    match key {
        Key::Int(n) => JsValue::from_f64(f64::from(*n)),
        Key::Text(s) => JsValue::from_str(s),
    }
}

fn js_to_key(js: &JsValue) -> Result<Key, StorageError> {
    if let Some(n) = js.as_f64() {
        if n.fract() == 0.0 && n >= 0.0 && n <= f64::from(u32::MAX) {
            return Ok(Key::Int(n as u32));
        }
        return Err(StorageError::Serialization(format!(
            "unsupported numeric key {n}"
        )));
    }
    if let Some(s) = js.as_string() {
        return Ok(Key::Text(s));
    }
    Err(StorageError::Serialization(
        "unsupported key type".to_string(),
    ))
}

fn key_range_to_js(range: &KeyRange) -> Result<Option<JsValue>, StorageError> {
    let invalid = |e: JsValue| StorageError::Unavailable(format!("invalid key range: {e:?}"));
    Ok(match range {
        KeyRange::All => None,
        KeyRange::Only(key) => Some(IdbKeyRange::only(&key_to_js(key)).map_err(invalid)?.into()),
        KeyRange::From(key) => Some(
            IdbKeyRange::lower_bound(&key_to_js(key))
                .map_err(invalid)?
                .into(),
        ),
        KeyRange::To(key) => Some(
            IdbKeyRange::upper_bound(&key_to_js(key))
                .map_err(invalid)?
                .into(),
        ),
        KeyRange::Between(lower, upper) => Some(
            IdbKeyRange::bound(&key_to_js(lower), &key_to_js(upper))
                .map_err(invalid)?
                .into(),
        ),
    })
}

fn value_to_js(value: &serde_json::Value) -> Result<JsValue, StorageError> {
    js_sys::JSON::parse(&value.to_string())
        .map_err(|e| StorageError::Serialization(format!("failed to build JS value: {e:?}")))
}

fn js_to_value(js: &JsValue) -> Result<serde_json::Value, StorageError> {
    let json = js_sys::JSON::stringify(js)
        .map_err(|e| StorageError::Serialization(format!("failed to stringify value: {e:?}")))?
        .as_string()
        .ok_or_else(|| StorageError::Serialization("value did not stringify".to_string()))?;
    serde_json::from_str(&json).map_err(StorageError::from)
}

// ============================================================================
// Event-to-future bridges
// ============================================================================

/// Waits for an open request, running the upgrade hook if a versionchange
/// fires. A hook error aborts the upgrade and is surfaced instead of the
/// request outcome; a blocked event resolves to `MigrationBlocked`.
async fn wait_for_open(
    request: &IdbOpenDbRequest,
    upgrade: UpgradeHook,
    new_stores: Vec<String>,
) -> Result<IdbDatabase, StorageError> {
    let (tx, rx) = futures_channel::oneshot::channel::<Result<JsValue, StorageError>>();
    let tx = Rc::new(RefCell::new(Some(tx)));
    let upgrade_error: Rc<RefCell<Option<StorageError>>> = Rc::new(RefCell::new(None));

    let error_slot = upgrade_error.clone();
    let onupgradeneeded = Closure::wrap(Box::new(move |event: web_sys::IdbVersionChangeEvent| {
        let request: IdbRequest = event
            .target()
            .unwrap()
            .dyn_into()
            .expect("Expected IdbRequest");
        let db: IdbDatabase = request.result().unwrap().dyn_into().unwrap();

        let change = VersionChange {
            old_version: event.old_version() as u32,
            new_version: event.new_version().unwrap_or(0.0) as u32,
            new_stores: new_stores.clone(),
        };
        log::info!(
            "upgrading IndexedDB {} from v{} to v{}",
            db.name(),
            change.old_version,
            change.new_version
        );

        let mut editor = IdbSchemaEditor { db: &db };
        if let Err(err) = (upgrade)(&mut editor, &change) {
            // Roll the version change back; the open request then fails and
            // the recorded error is surfaced in its place.
            if let Some(txn) = request.transaction() {
                let _ = txn.abort();
            }
            *error_slot.borrow_mut() = Some(err);
        }
    }) as Box<dyn FnMut(_)>);

    let tx_blocked = tx.clone();
    let onblocked = Closure::wrap(Box::new(move |event: web_sys::IdbVersionChangeEvent| {
        let requested = event.new_version().unwrap_or(0.0) as u32;
        if let Some(tx) = tx_blocked.borrow_mut().take() {
            let _ = tx.send(Err(StorageError::MigrationBlocked { requested }));
        }
    }) as Box<dyn FnMut(_)>);

    let tx_success = tx.clone();
    let onsuccess = Closure::wrap(Box::new(move |event: web_sys::Event| {
        let request: IdbRequest = event
            .target()
            .unwrap()
            .dyn_into()
            .expect("Expected IdbRequest");
        let result = request.result().unwrap_or(JsValue::UNDEFINED);
        if let Some(tx) = tx_success.borrow_mut().take() {
            let _ = tx.send(Ok(result));
        }
    }) as Box<dyn FnMut(_)>);

    let tx_error = tx;
    let onerror = Closure::wrap(Box::new(move |event: web_sys::Event| {
        let request: IdbRequest = event
            .target()
            .unwrap()
            .dyn_into()
            .expect("Expected IdbRequest");
        let message = request
            .error()
            .ok()
            .flatten()
            .map(|e| e.message())
            .unwrap_or_else(|| "unknown error".to_string());
        if let Some(tx) = tx_error.borrow_mut().take() {
            let _ = tx.send(Err(StorageError::Unavailable(message)));
        }
    }) as Box<dyn FnMut(_)>);

    request.set_onupgradeneeded(Some(onupgradeneeded.as_ref().unchecked_ref()));
    request.set_onblocked(Some(onblocked.as_ref().unchecked_ref()));
    request.set_onsuccess(Some(onsuccess.as_ref().unchecked_ref()));
    request.set_onerror(Some(onerror.as_ref().unchecked_ref()));

    let outcome = rx
        .await
        .map_err(|_| StorageError::Unavailable("open request dropped".to_string()));

    request.set_onupgradeneeded(None);
    request.set_onblocked(None);
    request.set_onsuccess(None);
    request.set_onerror(None);

    drop(onupgradeneeded);
    drop(onblocked);
    drop(onsuccess);
    drop(onerror);

    if let Some(err) = upgrade_error.borrow_mut().take() {
        // The abort normally fails the request; if the open succeeded
        // anyway, release the handle before reporting.
        if let Ok(Ok(value)) = &outcome {
            if let Ok(db) = value.clone().dyn_into::<IdbDatabase>() {
                db.close();
            }
        }
        return Err(err);
    }

    outcome??
        .dyn_into::<IdbDatabase>()
        .map_err(|_| StorageError::Unavailable("open did not produce a database".to_string()))
}

/// Waits for an IDB request to complete.
async fn wait_for_request(request: &IdbRequest) -> Result<JsValue, String> {
    let (tx, rx) = futures_channel::oneshot::channel::<Result<JsValue, String>>();
    let tx = Rc::new(RefCell::new(Some(tx)));

    let tx_success = tx.clone();
    let onsuccess = Closure::wrap(Box::new(move |event: web_sys::Event| {
        let request: IdbRequest = event
            .target()
            .unwrap()
            .dyn_into()
            .expect("Expected IdbRequest");
        let result = request.result().unwrap_or(JsValue::UNDEFINED);
        if let Some(tx) = tx_success.borrow_mut().take() {
            let _ = tx.send(Ok(result));
        }
    }) as Box<dyn FnMut(_)>);

    let tx_error = tx;
    let onerror = Closure::wrap(Box::new(move |event: web_sys::Event| {
        let request: IdbRequest = event
            .target()
            .unwrap()
            .dyn_into()
            .expect("Expected IdbRequest");
        let error_msg = request
            .error()
            .ok()
            .flatten()
            .map(|e| e.message())
            .unwrap_or_else(|| "unknown error".to_string());
        if let Some(tx) = tx_error.borrow_mut().take() {
            let _ = tx.send(Err(error_msg));
        }
    }) as Box<dyn FnMut(_)>);

    request.set_onsuccess(Some(onsuccess.as_ref().unchecked_ref()));
    request.set_onerror(Some(onerror.as_ref().unchecked_ref()));

    let result = rx.await.map_err(|_| "channel closed".to_string())?;

    request.set_onsuccess(None);
    request.set_onerror(None);

    drop(onsuccess);
    drop(onerror);

    result
}

/// Waits for an IDB transaction to complete.
async fn wait_for_transaction(txn: &IdbTransaction) -> Result<(), String> {
    let (sender, rx) = futures_channel::oneshot::channel::<Result<(), String>>();
    let sender = Rc::new(RefCell::new(Some(sender)));

    let tx_complete = sender.clone();
    let oncomplete = Closure::wrap(Box::new(move |_: web_sys::Event| {
        if let Some(tx) = tx_complete.borrow_mut().take() {
            let _ = tx.send(Ok(()));
        }
    }) as Box<dyn FnMut(_)>);

    let tx_error = sender;
    let onerror = Closure::wrap(Box::new(move |_event: web_sys::Event| {
        // Getting the specific error out is complex with web-sys; a generic
        // message has to do.
        if let Some(tx) = tx_error.borrow_mut().take() {
            let _ = tx.send(Err("transaction failed to complete".to_string()));
        }
    }) as Box<dyn FnMut(_)>);

    txn.set_oncomplete(Some(oncomplete.as_ref().unchecked_ref()));
    txn.set_onerror(Some(onerror.as_ref().unchecked_ref()));

    let result = rx.await.map_err(|_| "channel closed".to_string())?;

    txn.set_oncomplete(None);
    txn.set_onerror(None);

    drop(oncomplete);
    drop(onerror);

    result
}
