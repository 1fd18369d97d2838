//! Discovers the per-year stores of a planning database and hands out one
//! cache per year.

use std::rc::Rc;

use futures_util::future;

use crate::error::StorageError;
use crate::planning::cache::{planning_upgrade_hook, PlanningCache};
use crate::planning::template::TemplateSource;
use crate::storage::{Connection, ConnectionRegistry, StorageBackend};

/// How far [`PlanningDirectory::for_year`] looks back for an earlier year to
/// carry statements forward from.
const LOOKBACK_YEARS: i32 = 10;

/// Settings for a planning directory.
#[derive(Debug, Clone)]
pub struct PlanningConfig {
    pub database_name: String,
    pub template_uri: String,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            database_name: "Planning".to_string(),
            template_uri: "/planning.json".to_string(),
        }
    }
}

impl PlanningConfig {
    pub fn new(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            ..Self::default()
        }
    }

    pub fn with_template_uri(mut self, uri: impl Into<String>) -> Self {
        self.template_uri = uri.into();
        self
    }
}

/// Entry point to the planning data of one database.
pub struct PlanningDirectory<B: StorageBackend> {
    registry: Rc<ConnectionRegistry<B>>,
    template: Rc<dyn TemplateSource>,
    config: PlanningConfig,
}

impl<B: StorageBackend> PlanningDirectory<B> {
    pub fn new(registry: Rc<ConnectionRegistry<B>>, template: Rc<dyn TemplateSource>) -> Self {
        Self {
            registry,
            template,
            config: PlanningConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PlanningConfig) -> Self {
        self.config = config;
        self
    }

    /// One initialized cache per existing year store, oldest first. Stores
    /// whose names are not years are skipped. The first seeding failure
    /// fails the whole load; no partial directory is returned.
    pub async fn get_all(&self) -> Result<Vec<PlanningCache<B>>, StorageError> {
        let connection = self
            .registry
            .acquire(&self.config.database_name, planning_upgrade_hook())
            .await?;
        let mut caches = Vec::new();
        for store in connection.store_names()? {
            match store.parse::<i32>() {
                Ok(year) => caches.push(self.cache(year, &connection)),
                Err(_) => log::warn!("skipping object store {store}: name is not a year"),
            }
        }
        future::try_join_all(caches.iter().map(|cache| cache.init())).await?;
        Ok(caches)
    }

    /// The cache for `year`, creating and populating its store if needed:
    /// first by carrying the most recent earlier year within
    /// [`LOOKBACK_YEARS`] forward, otherwise from the template.
    pub async fn for_year(&self, year: i32) -> Result<PlanningCache<B>, StorageError> {
        let connection = self
            .registry
            .acquire(&self.config.database_name, planning_upgrade_hook())
            .await?;
        let known = connection.store_names()?;
        let store = year.to_string();
        if !known.contains(&store) {
            connection.add_stores(&[store]).await?;
        }

        let cache = self.cache(year, &connection);
        if cache.count().await? == 0 {
            if let Some(past) = most_recent_prior_year(&known, year) {
                let statements = self.cache(past, &connection).read_all().await?;
                if !statements.is_empty() {
                    log::info!(
                        "carrying {} statements forward from {past} into {year}",
                        statements.len()
                    );
                    cache.update_all(statements).await?;
                }
            }
            // Still empty when no earlier year had anything to carry over.
            cache.init().await?;
        }
        Ok(cache)
    }

    fn cache(&self, year: i32, connection: &Rc<Connection<B>>) -> PlanningCache<B> {
        PlanningCache::new(
            year,
            Rc::clone(connection),
            Rc::clone(&self.template),
            self.config.template_uri.clone(),
        )
    }
}

/// Latest year before `year` with an existing store, within the lookback
/// window.
fn most_recent_prior_year(stores: &[String], year: i32) -> Option<i32> {
    (year - LOOKBACK_YEARS..year)
        .rev()
        .find(|past| stores.contains(&past.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::model::StatementKind;
    use crate::planning::template::StaticTemplateSource;
    use crate::storage::{MemoryBackend, RegistryConfig};
    use futures::executor::block_on;

    fn directory_over(stores: &[&str]) -> PlanningDirectory<MemoryBackend> {
        let registry = Rc::new(ConnectionRegistry::with_config(
            MemoryBackend::new(),
            RegistryConfig::with_default_stores(stores.iter().map(|s| s.to_string()).collect()),
        ));
        PlanningDirectory::new(registry, Rc::new(StaticTemplateSource::bundled()))
    }

    #[test]
    fn test_get_all_builds_one_seeded_cache_per_year_store() {
        let directory = directory_over(&["2023", "2024"]);
        block_on(async {
            let caches = directory.get_all().await.unwrap();
            let years: Vec<i32> = caches.iter().map(|c| c.year()).collect();
            assert_eq!(years, vec![2023, 2024]);
            for cache in &caches {
                assert_eq!(cache.count().await.unwrap(), 3);
            }
        });
    }

    #[test]
    fn test_get_all_skips_stores_not_named_after_years() {
        let directory = directory_over(&["2024", "meta"]);
        block_on(async {
            let caches = directory.get_all().await.unwrap();
            assert_eq!(caches.len(), 1);
            assert_eq!(caches[0].year(), 2024);
        });
    }

    #[test]
    fn test_for_year_adds_missing_store_and_seeds_from_template() {
        let directory = directory_over(&["2024"]);
        block_on(async {
            let cache = directory.for_year(2030).await.unwrap();
            assert_eq!(cache.count().await.unwrap(), 3);
            assert_eq!(cache.read(1).await.unwrap().name, "Monthly Income");

            // The store was added by a single version bump.
            let connection = directory
                .registry
                .acquire("Planning", planning_upgrade_hook())
                .await
                .unwrap();
            assert_eq!(connection.version().unwrap(), 2);
            assert!(connection.has_store("2030").unwrap());
        });
    }

    #[test]
    fn test_for_year_carries_most_recent_prior_year_forward() {
        let directory = directory_over(&["2024"]);
        block_on(async {
            let past = directory.for_year(2024).await.unwrap();
            let mut statement = past.read(2).await.unwrap();
            statement.name = "Adjusted Expenses".to_string();
            past.update(2, &statement).await.unwrap();

            let cache = directory.for_year(2026).await.unwrap();
            assert_eq!(cache.count().await.unwrap(), 3);
            assert_eq!(cache.read(2).await.unwrap().name, "Adjusted Expenses");

            // The source year is untouched.
            assert_eq!(past.count().await.unwrap(), 3);
            assert_eq!(past.read(2).await.unwrap().name, "Adjusted Expenses");
        });
    }

    #[test]
    fn test_for_year_falls_back_to_template_beyond_lookback() {
        let directory = directory_over(&["2010"]);
        block_on(async {
            let old = directory.for_year(2010).await.unwrap();
            let mut statement = old.read(2).await.unwrap();
            statement.name = "Ancient Expenses".to_string();
            old.update(2, &statement).await.unwrap();

            // 2010 is eleven years before 2021, one past the window.
            let cache = directory.for_year(2021).await.unwrap();
            assert_eq!(cache.read(2).await.unwrap().name, "Monthly Expenses");
        });
    }

    #[test]
    fn test_for_year_reuses_populated_store_as_is() {
        let directory = directory_over(&["2024"]);
        block_on(async {
            let first = directory.for_year(2024).await.unwrap();
            first.delete(3).await.unwrap();

            let again = directory.for_year(2024).await.unwrap();
            assert_eq!(again.count().await.unwrap(), 2);

            let connection = directory
                .registry
                .acquire("Planning", planning_upgrade_hook())
                .await
                .unwrap();
            assert_eq!(connection.version().unwrap(), 1);
        });
    }

    #[test]
    fn test_empty_prior_year_does_not_block_template_seed() {
        let directory = directory_over(&["2024", "2025"]);
        block_on(async {
            // 2024 exists but holds nothing, so 2025 falls back to the
            // template instead of copying an empty year.
            let cache = directory.for_year(2025).await.unwrap();
            assert_eq!(cache.count().await.unwrap(), 3);
        });
    }

    #[test]
    fn test_statement_kinds_survive_the_carry_forward() {
        let directory = directory_over(&["2024"]);
        block_on(async {
            directory.for_year(2024).await.unwrap();
            let cache = directory.for_year(2025).await.unwrap();
            let statements = cache.read_all().await.unwrap();
            let kinds: Vec<StatementKind> = statements.iter().map(|s| s.kind).collect();
            assert_eq!(
                kinds,
                vec![
                    StatementKind::Income,
                    StatementKind::Expense,
                    StatementKind::Saving,
                ]
            );
        });
    }

    #[test]
    fn test_carried_statements_keep_their_keys() {
        let directory = directory_over(&["2024"]);
        block_on(async {
            directory.for_year(2024).await.unwrap();
            let cache = directory.for_year(2025).await.unwrap();
            let expenses = cache.read_expense_categories().await.unwrap();
            assert!(!expenses.is_empty());
            // Template ids 1 through 3 carried over as explicit keys.
            assert!(cache.read(1).await.is_ok());
            assert!(cache.read(3).await.is_ok());
        });
    }
}
