//! Per-year planning cache: typed statement operations over one object
//! store, lazily seeded from a template the first time the store turns up
//! empty.

use std::rc::Rc;

use crate::error::StorageError;
use crate::planning::model::{Category, Statement, StatementKind};
use crate::planning::template::TemplateSource;
use crate::storage::{
    Connection, IndexSpec, Key, KeyRange, KeySpec, StorageBackend, StoreSpec, UpgradeHook,
};

/// Name of the secondary index over the statement `type` field.
pub const BY_TYPE_INDEX: &str = "byType";
/// Record field that index maps.
pub const TYPE_FIELD: &str = "type";

/// Upgrade hook for planning databases: every store named in a version
/// change is created with generator-assigned integer keys and the non-unique
/// [`BY_TYPE_INDEX`] index.
pub fn planning_upgrade_hook() -> UpgradeHook {
    Rc::new(|editor, change| {
        for name in &change.new_stores {
            if editor.contains(name) {
                continue;
            }
            editor.create_store(
                &StoreSpec::new(name)
                    .with_auto_keys()
                    .with_index(IndexSpec::new(BY_TYPE_INDEX, TYPE_FIELD)),
            )?;
        }
        Ok(())
    })
}

/// Statement storage for one year.
///
/// A lightweight view over the shared database connection; cloning it does
/// not open anything.
#[derive(Clone)]
pub struct PlanningCache<B: StorageBackend> {
    year: i32,
    store_name: String,
    connection: Rc<Connection<B>>,
    template: Rc<dyn TemplateSource>,
    template_uri: String,
}

impl<B: StorageBackend> PlanningCache<B> {
    pub fn new(
        year: i32,
        connection: Rc<Connection<B>>,
        template: Rc<dyn TemplateSource>,
        template_uri: impl Into<String>,
    ) -> Self {
        Self {
            year,
            store_name: year.to_string(),
            connection,
            template,
            template_uri: template_uri.into(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    /// Seeds the store from the template if it holds no records yet; a store
    /// with any statement in it is left exactly as found. Nothing is written
    /// until the template has fetched and parsed, so a failed fetch leaves
    /// the store empty and a later call can try again.
    pub async fn init(&self) -> Result<(), StorageError> {
        if self.connection.count(&self.store_name).await? > 0 {
            return Ok(());
        }
        let bytes = self.template.fetch(&self.template_uri).await?;
        let statements: Vec<Statement> = serde_json::from_slice(&bytes).map_err(|err| {
            StorageError::SeedFetchFailed(format!("template did not parse: {err}"))
        })?;
        log::info!(
            "seeding store {} with {} template statements",
            self.store_name,
            statements.len()
        );
        self.connection
            .put_many(&self.store_name, &keyed(statements))
            .await?;
        Ok(())
    }

    /// Every statement of the year, in key order.
    pub async fn read_all(&self) -> Result<Vec<Statement>, StorageError> {
        self.connection.scan(&self.store_name).await
    }

    /// Categories of all expense statements, flattened in statement order.
    /// Each statement comes off the index with its key filled back in.
    pub async fn read_expense_categories(&self) -> Result<Vec<Category>, StorageError> {
        let range = KeyRange::Only(Key::Text(StatementKind::Expense.as_str().to_string()));
        let expenses: Vec<Statement> = self
            .connection
            .scan_index(&self.store_name, BY_TYPE_INDEX, &range)
            .await?;
        Ok(expenses
            .into_iter()
            .flat_map(|statement| statement.categories)
            .collect())
    }

    /// The statement stored at `key`.
    pub async fn read(&self, key: u32) -> Result<Statement, StorageError> {
        self.connection.get(&self.store_name, &Key::Int(key)).await
    }

    /// Inserts or overwrites the statement at `key`.
    pub async fn update(&self, key: u32, statement: &Statement) -> Result<(), StorageError> {
        self.connection
            .put(&self.store_name, statement, KeySpec::Explicit(Key::Int(key)))
            .await?;
        Ok(())
    }

    /// Removes the statement at `key`.
    pub async fn delete(&self, key: u32) -> Result<(), StorageError> {
        self.connection.delete(&self.store_name, &Key::Int(key)).await
    }

    /// Replaces the whole year with `statements` in one transaction.
    pub async fn update_all(&self, statements: Vec<Statement>) -> Result<(), StorageError> {
        self.connection
            .replace_all(&self.store_name, &keyed(statements))
            .await
    }

    pub async fn count(&self) -> Result<u32, StorageError> {
        self.connection.count(&self.store_name).await
    }
}

/// Pairs each statement with its storage key: the carried id when present,
/// otherwise a generator-assigned one. The choice is made here, explicitly;
/// the storage layer never infers keys from record fields.
fn keyed(statements: Vec<Statement>) -> Vec<(KeySpec, Statement)> {
    statements
        .into_iter()
        .map(|statement| {
            let key = match statement.id {
                Some(id) => KeySpec::Explicit(Key::Int(id)),
                None => KeySpec::Auto,
            };
            (key, statement)
        })
        .collect()
}
