use std::collections::HashMap;

use crate::value::Value;

/// String-keyed value map used for the globals table and the intern set.
pub struct Table {
    entries: HashMap<String, Value>,
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: HashMap::new(),
        }
    }

    /// Returns the previous value when the key was already present.
    pub fn insert(&mut self, key: String, value: Value) -> Option<Value> {
        self.entries.insert(key, value)
    }

    pub fn find(&self, key: &str) -> Option<Value> {
        self.entries.get(key).copied()
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Used by the collector to drop weak intern entries.
    pub fn retain(&mut self, keep: impl FnMut(&String, &mut Value) -> bool) {
        self.entries.retain(keep);
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{as_number, make_number_value};

    #[test]
    fn insert_reports_previous_entry() {
        let mut table = Table::new();
        assert!(table.insert("x".to_string(), make_number_value(1.0)).is_none());
        let previous = table.insert("x".to_string(), make_number_value(2.0));
        assert_eq!(previous.map(|value| as_number(&value)), Some(1.0));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn find_misses_return_none() {
        let table = Table::new();
        assert!(table.find("missing").is_none());
    }
}
