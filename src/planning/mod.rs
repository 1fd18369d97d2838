//! Per-year planning data over the storage layer.
//!
//! ## Layout
//!
//! One database holds one object store per year, each keyed by a generator
//! and indexed on the statement `type` field:
//!
//! ```text
//! IndexedDB "Planning"
//! ├── 2023   - planning statements, byType index
//! ├── 2024   - planning statements, byType index
//! └── ...
//! ```
//!
//! ### Key Types
//! - `Statement`: top-level record (income, expense or saving plan)
//! - `Category` / `Goal`: nested budget structure inside a statement
//! - `PlanningCache`: typed operations over one year's store
//! - `PlanningDirectory`: discovers years and lazily creates new ones
//!
//! A store that has never held a statement is seeded on first use: from the
//! most recent earlier year when one exists, otherwise from a template
//! fetched through [`TemplateSource`].

pub mod cache;
pub mod directory;
pub mod model;
pub mod template;

pub use cache::{planning_upgrade_hook, PlanningCache, BY_TYPE_INDEX, TYPE_FIELD};
pub use directory::{PlanningConfig, PlanningDirectory};
pub use model::{Category, Goal, Statement, StatementKind};
#[cfg(target_arch = "wasm32")]
pub use template::FetchTemplateSource;
pub use template::{StaticTemplateSource, TemplateSource};
