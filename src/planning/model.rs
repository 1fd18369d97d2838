//! Planning domain records: statements, their categories, and goals.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The three statement classes. Serialized into each record's `type` field,
/// which the yearly stores index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatementKind {
    Income,
    Expense,
    Saving,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Income => "Income",
            StatementKind::Expense => "Expense",
            StatementKind::Saving => "Saving",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A planning statement, the top-level record of a yearly store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// Storage key of the statement. `None` until stored under a
    /// generator-assigned key; index scans fill it back in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StatementKind,
    #[serde(default)]
    pub categories: Vec<Category>,
}

impl Statement {
    pub fn new(name: impl Into<String>, kind: StatementKind) -> Self {
        Self {
            id: None,
            name: name.into(),
            kind,
            categories: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_categories(mut self, categories: Vec<Category>) -> Self {
        self.categories = categories;
        self
    }
}

/// A named group of goals within a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub goals: Vec<Goal>,
}

impl Category {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            goals: Vec::new(),
        }
    }

    pub fn with_goals(mut self, goals: Vec<Goal>) -> Self {
        self.goals = goals;
        self
    }
}

/// A budget goal. The daily, monthly and yearly figures are related by
/// `daily * 30` and `daily * 365`; keeping them consistent is the caller's
/// job, storage never enforces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub name: String,
    pub daily: f64,
    pub monthly: f64,
    pub yearly: f64,
}

impl Goal {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        daily: f64,
        monthly: f64,
        yearly: f64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            daily,
            monthly,
            yearly,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_statement_kind_serializes_into_type_field() {
        let statement = Statement::new("Monthly Expenses", StatementKind::Expense);
        let value = serde_json::to_value(&statement).unwrap();
        assert_eq!(value["type"], "Expense");
        // An unassigned id never reaches storage.
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_statement_with_id_round_trips() {
        let statement = Statement::new("Monthly Income", StatementKind::Income).with_id(3);
        let value = serde_json::to_value(&statement).unwrap();
        assert_eq!(value["id"], 3);
        let back: Statement = serde_json::from_value(value).unwrap();
        assert_eq!(back, statement);
    }

    #[test]
    fn test_missing_collections_default_to_empty() {
        let statement: Statement = serde_json::from_value(json!({
            "name": "Savings Plan",
            "type": "Saving",
        }))
        .unwrap();
        assert_eq!(statement.id, None);
        assert!(statement.categories.is_empty());

        let category: Category = serde_json::from_value(json!({
            "id": "funds",
            "name": "Funds",
        }))
        .unwrap();
        assert!(category.goals.is_empty());
    }

    #[test]
    fn test_kind_display_matches_indexed_value() {
        assert_eq!(StatementKind::Income.to_string(), "Income");
        assert_eq!(StatementKind::Expense.as_str(), "Expense");
        assert_eq!(StatementKind::Saving.as_str(), "Saving");
    }
}
