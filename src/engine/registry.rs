//! File-name → SSTable registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::sstable::SSTable;

/// Every live SSTable, keyed by its on-disk file name.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    tables: HashMap<String, Arc<SSTable>>,
}

impl Registry {
    pub fn insert(&mut self, table: Arc<SSTable>) -> Option<Arc<SSTable>> {
        self.tables.insert(table.name().to_string(), table)
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<SSTable>> {
        self.tables.remove(name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }

    /// All tables, newest (highest sequence number) first.
    pub fn snapshot(&self) -> Vec<Arc<SSTable>> {
        let mut tables: Vec<_> = self.tables.values().cloned().collect();
        tables.sort_by_key(|t| std::cmp::Reverse(t.seq()));
        tables
    }

    /// Highest sequence number in use.
    pub fn max_seq(&self) -> Option<u64> {
        self.tables.values().map(|t| t.seq()).max()
    }
}
