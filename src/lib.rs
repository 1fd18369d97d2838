//! Browser-side persistence core for a personal finance planning widget.
//!
//! Three layers stack up here:
//!
//! - [`storage`]: a versioned, transactional object-store abstraction with
//!   an in-memory engine for native builds and tests, and an IndexedDB
//!   engine on wasm32.
//! - [`storage::ConnectionRegistry`] and [`storage::Connection`]: one shared
//!   handle per database name, typed record operations, and the
//!   close-and-reopen migration that adds object stores at version + 1.
//! - [`planning`]: per-year caches of planning statements, lazily seeded
//!   from a template or carried forward from an earlier year, with an
//!   indexed query for expense categories.

pub mod error;
pub mod planning;
pub mod storage;

pub use error::StorageError;
