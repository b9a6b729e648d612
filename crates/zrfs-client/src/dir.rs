use std::collections::VecDeque;

use zrfs_proto::DirEntry;

/// A directory listing, read in full when opened.
///
/// Iterating yields the remaining entries in server order; `.` and `..`
/// are never included.
#[derive(Debug, Clone)]
pub struct Dir {
    path: String,
    entries: VecDeque<DirEntry>,
}

impl Dir {
    pub(crate) fn new(path: &str, entries: Vec<DirEntry>) -> Self {
        Self {
            path: path.to_string(),
            entries: entries.into(),
        }
    }

    /// The path this listing was read from.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Entries not yet consumed, in server order.
    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    /// Number of entries not yet consumed.
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }

    /// Full path of an entry of this directory.
    pub fn child_path(&self, entry: &DirEntry) -> String {
        format!("{}/{}", self.path.trim_end_matches('/'), entry.name)
    }
}

impl Iterator for Dir {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        self.entries.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.entries.len(), Some(self.entries.len()))
    }
}

impl ExactSizeIterator for Dir {}
