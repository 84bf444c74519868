//! Sequential id-to-file mapping.
//!
//! In sequential mode every index entry has a fixed size, so the slot of an
//! id is computable once we know which file the id lives in and the first id
//! of that file. The map is a sorted vector of `(first-id, file-id)` pairs,
//! pushed at every rotation, resolved by binary search.

use cairn_types::FileId;

/// One mapping point: `first` is the first sequential id stored in `file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqMapping {
    pub first: u32,
    pub file: FileId,
}

/// Sorted id-to-file map of one sequential namespace.
#[derive(Debug, Default)]
pub struct SeqMap {
    entries: Vec<SeqMapping>,
}

impl SeqMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers `first` as the first id of `file`. Ids are pushed in
    /// ascending order (rotation is monotonic).
    pub fn push(&mut self, first: u32, file: FileId) {
        tracing::debug!(id = first, file = %file, "index seq: mapping id to file");
        debug_assert!(
            self.entries.last().is_none_or(|last| first >= last.first),
            "seq map must be pushed in ascending id order"
        );
        self.entries.push(SeqMapping { first, file });
    }

    /// Finds the mapping covering `id`: the last entry whose `first` is not
    /// greater than `id`. Ids below the first mapping resolve to it anyway,
    /// matching the permissive lookup of the on-disk slot (which then fails
    /// key validation).
    ///
    /// Returns `None` only when the map is empty, which cannot happen on a
    /// loaded index (the loader seeds `(0, 0)`).
    pub fn resolve(&self, id: u32) -> Option<SeqMapping> {
        if self.entries.is_empty() {
            return None;
        }

        let at = self.entries.partition_point(|m| m.first <= id);
        let mapping = self.entries[at.saturating_sub(1)];
        tracing::debug!(id, file = %mapping.file, "index: seqmap resolved");
        Some(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_resolves_nothing() {
        assert_eq!(SeqMap::new().resolve(0), None);
    }

    #[test]
    fn resolve_picks_the_covering_file() {
        let mut map = SeqMap::new();
        map.push(0, FileId::new(0));
        map.push(100, FileId::new(1));
        map.push(250, FileId::new(2));

        assert_eq!(map.resolve(0).unwrap().file, FileId::new(0));
        assert_eq!(map.resolve(99).unwrap().file, FileId::new(0));
        assert_eq!(map.resolve(100).unwrap().file, FileId::new(1));
        assert_eq!(map.resolve(249).unwrap().file, FileId::new(1));
        assert_eq!(map.resolve(250).unwrap().file, FileId::new(2));
        assert_eq!(map.resolve(u32::MAX).unwrap().file, FileId::new(2));
    }

    #[test]
    fn repeated_first_ids_prefer_the_latest_file() {
        // a rotation without any inserts in between maps the same first id
        // to a newer file; the newest mapping must win
        let mut map = SeqMap::new();
        map.push(0, FileId::new(0));
        map.push(10, FileId::new(1));
        map.push(10, FileId::new(2));

        assert_eq!(map.resolve(10).unwrap().file, FileId::new(2));
        assert_eq!(map.resolve(11).unwrap().file, FileId::new(2));
    }
}
