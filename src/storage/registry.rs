//! One connection per database name.
//!
//! The registry owns the only shared mutable table in the crate: database
//! name to connection. `acquire` is idempotent; concurrent callers racing
//! the first open of a name queue behind a single backend open and all
//! receive the same connection.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use chrono::Datelike;
use futures_channel::oneshot;

use crate::error::StorageError;

use super::{Connection, StorageBackend, UpgradeHook};

/// Registry-wide settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Stores seeded into a database created by its first open.
    pub default_stores: Vec<String>,
}

impl Default for RegistryConfig {
    /// Seeds brand-new databases with one store named after the current
    /// year.
    fn default() -> Self {
        Self {
            default_stores: vec![chrono::Local::now().year().to_string()],
        }
    }
}

impl RegistryConfig {
    pub fn with_default_stores(default_stores: Vec<String>) -> Self {
        Self { default_stores }
    }
}

enum RegistryEntry<B: StorageBackend> {
    Ready(Rc<Connection<B>>),
    /// First open in flight; queued callers are handed its outcome.
    Pending(Vec<oneshot::Sender<Result<Rc<Connection<B>>, StorageError>>>),
}

/// Process-wide table of open connections, one per database name.
pub struct ConnectionRegistry<B: StorageBackend> {
    backend: B,
    config: RegistryConfig,
    entries: RefCell<HashMap<String, RegistryEntry<B>>>,
}

impl<B: StorageBackend> ConnectionRegistry<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, RegistryConfig::default())
    }

    pub fn with_config(backend: B, config: RegistryConfig) -> Self {
        Self {
            backend,
            config,
            entries: RefCell::new(HashMap::new()),
        }
    }

    /// The shared connection for `name`, opening the database on first use.
    ///
    /// `upgrade` takes effect only for the call that actually performs the
    /// open; once a connection exists it, and its hook, are reused as-is.
    /// A failed first open leaves no entry behind, so a later call retries.
    pub async fn acquire(
        &self,
        name: &str,
        upgrade: UpgradeHook,
    ) -> Result<Rc<Connection<B>>, StorageError> {
        let waiter = {
            let mut entries = self.entries.borrow_mut();
            match entries.get_mut(name) {
                Some(RegistryEntry::Ready(connection)) => return Ok(Rc::clone(connection)),
                Some(RegistryEntry::Pending(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    entries.insert(name.to_string(), RegistryEntry::Pending(Vec::new()));
                    None
                }
            }
        };

        if let Some(waiter) = waiter {
            return waiter.await.map_err(|_| {
                StorageError::Unavailable(format!("first open of {name} was abandoned"))
            })?;
        }

        let result = Connection::open(
            self.backend.clone(),
            name,
            upgrade,
            &self.config.default_stores,
        )
        .await
        .map(Rc::new);

        let waiters = {
            let mut entries = self.entries.borrow_mut();
            let waiters = match entries.remove(name) {
                Some(RegistryEntry::Pending(waiters)) => waiters,
                _ => Vec::new(),
            };
            if let Ok(connection) = &result {
                entries.insert(name.to_string(), RegistryEntry::Ready(Rc::clone(connection)));
            }
            waiters
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }
}
