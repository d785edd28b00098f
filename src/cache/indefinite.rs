//! Unbounded statement cache: every prepared statement is kept until the
//! connection closes.

use std::collections::HashMap;
use std::sync::Arc;

use super::StatementCell;

#[derive(Debug, Default)]
pub(crate) struct IndefiniteCache {
    entries: HashMap<String, StatementCell>,
}

impl IndefiniteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(&mut self, sql: &str) -> StatementCell {
        if let Some(cell) = self.entries.get(sql) {
            return Arc::clone(cell);
        }
        let cell = StatementCell::default();
        self.entries
            .insert(sql.to_string(), Arc::clone(&cell));
        cell
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_sql_shares_one_cell() {
        let mut cache = IndefiniteCache::new();
        let a = cache.get_or_insert("SELECT 1");
        let b = cache.get_or_insert("SELECT 1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn grows_without_bound() {
        let mut cache = IndefiniteCache::new();
        for i in 0..1000 {
            cache.get_or_insert(&format!("SELECT {i}"));
        }
        assert_eq!(cache.len(), 1000);
    }
}
