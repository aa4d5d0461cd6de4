//! Record index - ordered records plus a key to position map.

use crate::Record;
use std::collections::HashMap;

/// Ordered record sequence with a key index.
///
/// Invariants:
/// - every key in the map points at the record carrying that key
/// - `total()` equals the number of records
#[derive(Debug, Clone, Default)]
pub struct RecordIndex {
    records: Vec<Record>,
    keys: HashMap<String, usize>,
}

impl RecordIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn total(&self) -> usize {
        self.records.len()
    }

    /// Check if the index holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Position of a key.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.keys.get(key).copied()
    }

    /// Check if a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Get a record by key.
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.position(key).map(|i| &self.records[i])
    }

    /// Get a mutable record by key.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Record> {
        let i = self.position(key)?;
        self.records.get_mut(i)
    }

    /// Get a record by position.
    pub fn at(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    /// Records in `[start, start + offset)`, clipped to the sequence.
    pub fn slice(&self, start: usize, offset: usize) -> &[Record] {
        let start = start.min(self.records.len());
        let end = start.saturating_add(offset).min(self.records.len());
        &self.records[start..end]
    }

    /// All records in order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Key to position map.
    pub fn keys(&self) -> &HashMap<String, usize> {
        &self.keys
    }

    /// Insert a record, replacing any record with the same key in place.
    ///
    /// Returns the record's position.
    pub fn upsert(&mut self, record: Record) -> usize {
        match self.position(&record.key) {
            Some(i) => {
                self.records[i] = record;
                i
            }
            None => {
                let i = self.records.len();
                self.keys.insert(record.key.clone(), i);
                self.records.push(record);
                i
            }
        }
    }

    /// Remove a record by key, shifting later positions down.
    pub fn remove(&mut self, key: &str) -> Option<Record> {
        let i = self.keys.remove(key)?;
        let record = self.records.remove(i);
        for position in self.keys.values_mut() {
            if *position > i {
                *position -= 1;
            }
        }
        Some(record)
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        self.records.clear();
        self.keys.clear();
    }

    /// Rebuild the key map in sequence order.
    ///
    /// With `renumber`, numeric keys are rewritten to their position so that
    /// auto-assigned keys stay dense after deletions.
    pub fn reindex(&mut self, renumber: bool) {
        self.keys.clear();
        for (i, record) in self.records.iter_mut().enumerate() {
            if renumber && is_numeric(&record.key) {
                record.key = i.to_string();
            }
            self.keys.insert(record.key.clone(), i);
        }
    }

    /// Replace the contents wholesale.
    pub(crate) fn replace(&mut self, records: Vec<Record>) {
        self.records = records;
        self.reindex(false);
    }
}

/// True if a key is an auto-assigned numeric key.
pub fn is_numeric(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(keys: &[&str]) -> RecordIndex {
        let mut index = RecordIndex::new();
        for key in keys {
            index.upsert(Record::empty(*key));
        }
        index
    }

    fn assert_consistent(index: &RecordIndex) {
        assert_eq!(index.keys().len(), index.total());
        for (key, &i) in index.keys() {
            assert_eq!(&index.records()[i].key, key);
        }
    }

    #[test]
    fn upsert_appends_and_replaces() {
        let mut index = index_of(&["a", "b"]);
        assert_eq!(index.total(), 2);

        let i = index.upsert(Record::empty("a"));
        assert_eq!(i, 0);
        assert_eq!(index.total(), 2);
        assert_consistent(&index);
    }

    #[test]
    fn remove_shifts_positions() {
        let mut index = index_of(&["a", "b", "c", "d"]);

        let removed = index.remove("b").unwrap();
        assert_eq!(removed.key, "b");
        assert_eq!(index.position("c"), Some(1));
        assert_eq!(index.position("d"), Some(2));
        assert!(index.remove("b").is_none());
        assert_consistent(&index);
    }

    #[test]
    fn reindex_renumbers_numeric_keys() {
        let mut index = index_of(&["0", "1", "2", "named"]);
        index.remove("0");
        index.reindex(true);

        let keys: Vec<_> = index.records().iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["0", "1", "named"]);
        assert_consistent(&index);
    }

    #[test]
    fn reindex_keeps_keys_without_renumber() {
        let mut index = index_of(&["10", "20"]);
        index.reindex(false);
        assert_eq!(index.position("20"), Some(1));
    }

    #[test]
    fn slice_clips() {
        let index = index_of(&["a", "b", "c"]);
        assert_eq!(index.slice(1, 10).len(), 2);
        assert_eq!(index.slice(5, 2).len(), 0);
        assert_eq!(index.slice(0, 2)[1].key, "b");
    }

    #[test]
    fn numeric_keys() {
        assert!(is_numeric("42"));
        assert!(!is_numeric(""));
        assert!(!is_numeric("4a"));
        assert!(!is_numeric("-1"));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_reindex_idempotent(
                keys in prop::collection::vec("[a-c0-9]{1,3}", 0..30),
                removals in prop::collection::vec(0usize..30, 0..10),
                renumber in any::<bool>(),
            ) {
                let mut index = RecordIndex::new();
                for key in &keys {
                    index.upsert(Record::empty(key.clone()));
                }
                for r in removals {
                    if let Some(key) = index.at(r).map(|rec| rec.key.clone()) {
                        index.remove(&key);
                    }
                }

                index.reindex(renumber);
                let first = index.keys().clone();
                index.reindex(renumber);

                prop_assert_eq!(&first, index.keys());
                prop_assert_eq!(index.keys().len(), index.total());
            }

            #[test]
            fn prop_removals_keep_map_valid(
                count in 1usize..40,
                removals in prop::collection::vec(0usize..40, 0..20),
            ) {
                let mut index = RecordIndex::new();
                for i in 0..count {
                    index.upsert(Record::empty(format!("k{}", i)));
                }
                for r in removals {
                    index.remove(&format!("k{}", r));
                }

                for (key, &i) in index.keys() {
                    prop_assert_eq!(&index.records()[i].key, key);
                }
                prop_assert_eq!(index.keys().len(), index.total());
            }
        }
    }
}
