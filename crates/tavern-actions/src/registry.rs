// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-session table ownership.

use std::collections::HashMap;

use tavern_table::Table;
use uuid::Uuid;

/// Owns every table of one session, addressable by id or by name.
#[derive(Debug, Default)]
pub struct TableRegistry {
    tables: HashMap<Uuid, Table>,
    by_name: HashMap<String, Uuid>,
}

impl TableRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a table, replacing any previous table of the same name.
    pub fn insert(&mut self, table: Table) -> Uuid {
        let table_id = table.table_id;
        if let Some(old_id) = self.by_name.insert(table.name.clone(), table_id) {
            self.tables.remove(&old_id);
        }
        self.tables.insert(table_id, table);
        table_id
    }

    /// Look up by id.
    pub fn get(&self, table_id: &Uuid) -> Option<&Table> {
        self.tables.get(table_id)
    }

    /// Mutable lookup by id.
    pub fn get_mut(&mut self, table_id: &Uuid) -> Option<&mut Table> {
        self.tables.get_mut(table_id)
    }

    /// Look up by display name.
    pub fn get_by_name(&self, name: &str) -> Option<&Table> {
        self.by_name.get(name).and_then(|id| self.tables.get(id))
    }

    /// Resolve a name to an id.
    pub fn id_for_name(&self, name: &str) -> Option<Uuid> {
        self.by_name.get(name).copied()
    }

    /// Remove a table by id.
    pub fn remove(&mut self, table_id: &Uuid) -> Option<Table> {
        let table = self.tables.remove(table_id)?;
        self.by_name.remove(&table.name);
        Some(table)
    }

    /// Table names in insertion-independent sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Iterate all tables.
    pub fn iter(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Mutable iteration over all tables.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Table> {
        self.tables.values_mut()
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the registry holds no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Drop every table.
    pub fn clear(&mut self) {
        self.tables.clear();
        self.by_name.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup_by_both_keys() {
        let mut registry = TableRegistry::new();
        let id = registry.insert(Table::new("demo", 10, 10).unwrap());
        assert!(registry.get(&id).is_some());
        assert_eq!(registry.get_by_name("demo").unwrap().table_id, id);
        assert_eq!(registry.names(), vec!["demo".to_string()]);
    }

    #[test]
    fn same_name_replaces() {
        let mut registry = TableRegistry::new();
        let first = registry.insert(Table::new("demo", 10, 10).unwrap());
        let second = registry.insert(Table::new("demo", 30, 30).unwrap());
        assert_ne!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_by_name("demo").unwrap().width, 30);
        assert!(registry.get(&first).is_none());
    }

    #[test]
    fn remove_clears_name_index() {
        let mut registry = TableRegistry::new();
        let id = registry.insert(Table::new("demo", 10, 10).unwrap());
        registry.remove(&id).unwrap();
        assert!(registry.get_by_name("demo").is_none());
        assert!(registry.is_empty());
    }
}
