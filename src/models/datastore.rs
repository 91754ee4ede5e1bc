//! Whole-state and partial-state views of the store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Record;

/// The full application state: every schema table with its records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Datastore {
    tables: BTreeMap<String, Vec<Record>>,
}

impl Datastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: impl Into<String>, records: Vec<Record>) {
        self.tables.insert(table.into(), records);
    }

    /// Records of `table`, empty when the table is absent.
    pub fn table(&self, table: &str) -> &[Record] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &[Record])> {
        self.tables
            .iter()
            .map(|(name, records)| (name.as_str(), records.as_slice()))
    }

    pub fn record_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

/// Pending change for one table: a single record or a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TableUpdate {
    Many(Vec<Record>),
    One(Record),
}

impl TableUpdate {
    pub fn into_records(self) -> Vec<Record> {
        match self {
            TableUpdate::Many(records) => records,
            TableUpdate::One(record) => vec![record],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TableUpdate::Many(records) => records.len(),
            TableUpdate::One(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A subset of the application state handed to autosave.
///
/// Merging is shallow: a later update for a table replaces the earlier one.
pub type PartialState = BTreeMap<String, TableUpdate>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_update_accepts_object_or_array() {
        let state: PartialState = serde_json::from_value(json!({
            "users": [{ "id": "u1" }, { "id": "u2" }],
            "settings": { "id": "app", "theme": "dark" }
        }))
        .unwrap();

        assert_eq!(state["users"].len(), 2);
        assert!(matches!(state["settings"], TableUpdate::One(_)));
        assert_eq!(state["settings"].clone().into_records()[0].id(), Some("app"));
    }

    #[test]
    fn test_missing_table_reads_empty() {
        let mut datastore = Datastore::new();
        datastore.insert("users", vec![Record::new("u1")]);
        assert_eq!(datastore.table("users").len(), 1);
        assert!(datastore.table("locations").is_empty());
        assert_eq!(datastore.record_count(), 1);
    }
}
