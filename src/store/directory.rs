//! Hierarchical table view over entry names.
//!
//! A table is any prefix of entry names ending at a `/`. Tables carry no
//! state of their own: they exist exactly while some entry lives under them.

use super::{Entry, EntryStore, Value};
use std::collections::BTreeSet;

pub const PATH_SEPARATOR: char = '/';

/// Normalize a table path to the prefix its entries share
fn table_prefix(path: &str) -> String {
    if path.is_empty() || path.ends_with(PATH_SEPARATOR) {
        path.to_string()
    } else {
        format!("{}{}", path, PATH_SEPARATOR)
    }
}

/// Immediate child tables of `prefix`, as full prefixes ending in `/`
pub fn list_tables(store: &EntryStore, prefix: &str) -> BTreeSet<String> {
    let prefix = table_prefix(prefix);
    store
        .names()
        .into_iter()
        .filter_map(|name| {
            let rest = name.strip_prefix(prefix.as_str())?;
            let end = rest.find(PATH_SEPARATOR)?;
            Some(format!("{}{}", prefix, &rest[..=end]))
        })
        .collect()
}

/// Full names of entries directly inside `prefix`
pub fn list_entries(store: &EntryStore, prefix: &str) -> BTreeSet<String> {
    let prefix = table_prefix(prefix);
    store
        .names()
        .into_iter()
        .filter(|name| {
            name.strip_prefix(prefix.as_str())
                .map(|rest| !rest.is_empty() && !rest.contains(PATH_SEPARATOR))
                .unwrap_or(false)
        })
        .collect()
}

/// A named view of one table
pub struct Table<'a> {
    store: &'a EntryStore,
    prefix: String,
}

impl<'a> Table<'a> {
    pub fn new(store: &'a EntryStore, path: &str) -> Self {
        Self {
            store,
            prefix: table_prefix(path),
        }
    }

    /// Prefix shared by every entry in this table
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn path_for(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn get(&self, key: &str) -> Option<Entry> {
        self.store.get(&self.path_for(key))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.store.contains(&self.path_for(key))
    }

    pub fn set_value(&self, key: &str, value: impl Into<Value>) -> u64 {
        self.store.set_value(&self.path_for(key), value)
    }

    pub fn set_default(&self, key: &str, value: impl Into<Value>) -> bool {
        self.store.set_default(&self.path_for(key), value)
    }

    /// Keys of entries directly in this table
    pub fn keys(&self) -> BTreeSet<String> {
        list_entries(self.store, &self.prefix)
            .into_iter()
            .map(|name| name[self.prefix.len()..].to_string())
            .collect()
    }

    /// Names of the child tables
    pub fn sub_tables(&self) -> BTreeSet<String> {
        list_tables(self.store, &self.prefix)
            .into_iter()
            .map(|child| child[self.prefix.len()..child.len() - 1].to_string())
            .collect()
    }

    pub fn sub_table(&self, name: &str) -> Table<'a> {
        Table::new(self.store, &self.path_for(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Writer;

    fn demo_store() -> EntryStore {
        let store = EntryStore::new(0);
        store.set_value("/datatable/x", 5.0);
        store.set_value("/datatable/y", 25.0);
        store.set_value("/datatable/nested/z", 1.0);
        store.set_value("/SmartDashboard/Compressor Enabled", true);
        store
    }

    #[test]
    fn lists_immediate_children() {
        let store = demo_store();
        let tables: Vec<String> = list_tables(&store, "/").into_iter().collect();
        assert_eq!(tables, vec!["/SmartDashboard/", "/datatable/"]);

        let nested: Vec<String> = list_tables(&store, "/datatable").into_iter().collect();
        assert_eq!(nested, vec!["/datatable/nested/"]);

        let entries: Vec<String> = list_entries(&store, "/datatable/").into_iter().collect();
        assert_eq!(entries, vec!["/datatable/x", "/datatable/y"]);
    }

    #[test]
    fn tables_vanish_with_their_last_entry() {
        let store = demo_store();
        store.delete("/datatable/nested/z", Writer::Local);
        assert!(list_tables(&store, "/datatable").is_empty());

        store.delete("/SmartDashboard/Compressor Enabled", Writer::Local);
        let tables: Vec<String> = list_tables(&store, "/").into_iter().collect();
        assert_eq!(tables, vec!["/datatable/"]);
    }

    #[test]
    fn table_view() {
        let store = demo_store();
        let table = store.table("/datatable");
        assert_eq!(table.path_for("x"), "/datatable/x");
        assert_eq!(table.get("x").map(|e| e.value), Some(Value::Double(5.0)));

        let keys: Vec<String> = table.keys().into_iter().collect();
        assert_eq!(keys, vec!["x", "y"]);
        let subs: Vec<String> = table.sub_tables().into_iter().collect();
        assert_eq!(subs, vec!["nested"]);

        assert!(table.sub_table("nested").contains_key("z"));
        assert!(!table.set_default("x", 0.0));
        table.set_value("test", 10.0);
        assert!(store.contains("/datatable/test"));
    }
}
