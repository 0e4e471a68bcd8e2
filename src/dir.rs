//! Directory clusters
//!
//! A directory's storage is a cluster chain like any file's; this module
//! edits one cluster's worth of 32-byte slots at a time. The buffer is
//! transient: an operation loads the cluster, edits it in memory and writes
//! the whole cluster back.
//!
//! Delete policy: removing slot `k` writes the local tombstone 0x5E when any
//! later slot in the cluster is non-terminal, and 0x00 otherwise. That keeps
//! the "scan stops at 0x00" invariant intact while leaving every freed slot
//! reusable.

use alloc::vec::Vec;
use core::fmt;

use crate::entry::DirEntry;
use crate::{
    DIRENT_SIZE, DIR_ENTRY_LAST_AND_UNUSED, DIR_ENTRY_LOCAL_UNUSED, DIR_ENTRY_UNUSED,
    SHORT_NAME_LEN,
};

/// On-disk name of the `.` entry.
pub const DOT_NAME: [u8; SHORT_NAME_LEN] = *b".          ";
/// On-disk name of the `..` entry.
pub const DOTDOT_NAME: [u8; SHORT_NAME_LEN] = *b"..         ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirError {
    NotFound,
    NotADirectory,
    IsADirectory,
    AlreadyExists,
    /// No reusable slot left in the directory cluster.
    DirFull,
    /// rmdir target still holds entries besides `.` and `..`.
    NotEmpty,
}

impl fmt::Display for DirError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirError::NotFound => write!(f, "no such file or directory"),
            DirError::NotADirectory => write!(f, "not a directory"),
            DirError::IsADirectory => write!(f, "is a directory"),
            DirError::AlreadyExists => write!(f, "name already exists"),
            DirError::DirFull => write!(f, "directory is full"),
            DirError::NotEmpty => write!(f, "directory is not empty"),
        }
    }
}

/// One directory cluster, loaded for editing.
pub struct DirBuffer {
    cluster: u32,
    bytes: Vec<u8>,
}

impl DirBuffer {
    pub fn new(cluster: u32, bytes: Vec<u8>) -> Self {
        assert!(bytes.len() % DIRENT_SIZE == 0);
        Self { cluster, bytes }
    }

    pub fn cluster(&self) -> u32 {
        self.cluster
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn entry_cnt(&self) -> usize {
        self.bytes.len() / DIRENT_SIZE
    }

    pub fn entry(&self, index: usize) -> DirEntry {
        DirEntry::new_from_bytes(&self.bytes[index * DIRENT_SIZE..(index + 1) * DIRENT_SIZE])
    }

    pub fn set_entry(&mut self, index: usize, entry: &DirEntry) {
        self.bytes[index * DIRENT_SIZE..(index + 1) * DIRENT_SIZE]
            .copy_from_slice(entry.as_bytes());
    }

    fn marker(&self, index: usize) -> u8 {
        self.bytes[index * DIRENT_SIZE]
    }

    /// Every valid entry with its slot index, in slot order.
    pub fn entries(&self) -> impl Iterator<Item = (usize, DirEntry)> + '_ {
        (0..self.entry_cnt())
            .map(|index| (index, self.entry(index)))
            .filter(|(_, entry)| entry.is_valid())
    }

    /// Whole-cluster lookup by normalized short name. The scan does not stop
    /// at a 0x00 marker, so a create also collides with names the end-of-
    /// directory scan would no longer reach.
    pub fn find(&self, name: &[u8; SHORT_NAME_LEN]) -> Option<(usize, DirEntry)> {
        self.entries().find(|(_, entry)| entry.name_bytes() == *name)
    }

    /// First reusable slot: never used, deleted, or locally tombstoned.
    pub fn allocate_slot(&self) -> Option<usize> {
        (0..self.entry_cnt()).find(|&index| {
            matches!(
                self.marker(index),
                DIR_ENTRY_LAST_AND_UNUSED | DIR_ENTRY_UNUSED | DIR_ENTRY_LOCAL_UNUSED
            )
        })
    }

    /// Tombstone slot `index` per the delete policy.
    pub fn remove(&mut self, index: usize) {
        let tail_in_use = (index + 1..self.entry_cnt())
            .any(|later| self.marker(later) != DIR_ENTRY_LAST_AND_UNUSED);
        let marker = if tail_in_use {
            DIR_ENTRY_LOCAL_UNUSED
        } else {
            DIR_ENTRY_LAST_AND_UNUSED
        };
        self.bytes[index * DIRENT_SIZE] = marker;
    }

    /// True when nothing but `.` and `..` is left.
    pub fn is_empty_dir(&self) -> bool {
        self.entries().all(|(_, entry)| {
            let name = entry.name_bytes();
            name == DOT_NAME || name == DOTDOT_NAME
        })
    }

    /// First cluster recorded in this cluster's `..` entry; 0 encodes "the
    /// parent is the root directory".
    pub fn parent_cluster(&self) -> u32 {
        self.entry(1).first_cluster()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use crate::entry::EntryKind;
    use crate::{short_name, ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_LONG_NAME};

    fn buffer_with(names: &[&str]) -> DirBuffer {
        let mut dir = DirBuffer::new(2, vec![0u8; 512]);
        for (index, name) in names.iter().enumerate() {
            dir.set_entry(index, &DirEntry::new(&short_name(name), ATTR_ARCHIVE, 0));
        }
        dir
    }

    #[test]
    fn find_compares_normalized_names() {
        let dir = buffer_with(&["ALPHA", "BETA.TXT"]);
        let (index, entry) = dir.find(&short_name("beta.txt")).unwrap();
        assert_eq!(index, 1);
        assert_eq!(entry.name(), "BETA.TXT");
        assert!(dir.find(&short_name("GAMMA")).is_none());
    }

    #[test]
    fn find_scans_past_a_terminator() {
        let mut dir = DirBuffer::new(2, vec![0u8; 512]);
        // slot 0 stays 0x00, the entry sits behind it
        dir.set_entry(3, &DirEntry::new(&short_name("HIDDEN"), ATTR_ARCHIVE, 0));
        assert_eq!(dir.find(&short_name("HIDDEN")).unwrap().0, 3);
    }

    #[test]
    fn long_name_fragments_are_skipped() {
        let mut dir = buffer_with(&["REAL"]);
        dir.set_entry(1, &DirEntry::new(&short_name("FAKE"), ATTR_LONG_NAME, 0));
        assert_eq!(dir.entries().count(), 1);
        assert!(dir.find(&short_name("FAKE")).is_none());
    }

    #[test]
    fn removing_with_live_tail_leaves_a_local_tombstone() {
        let mut dir = buffer_with(&["A", "B"]);
        dir.remove(0);
        assert_eq!(dir.entry(0).marker(), DIR_ENTRY_LOCAL_UNUSED);
        assert_eq!(dir.entry(0).kind(), EntryKind::Tombstone);
        // B must still be reachable
        assert!(dir.find(&short_name("B")).is_some());
    }

    #[test]
    fn removing_the_last_entry_writes_a_terminator() {
        let mut dir = buffer_with(&["A", "B"]);
        dir.remove(1);
        assert_eq!(dir.entry(1).marker(), DIR_ENTRY_LAST_AND_UNUSED);
    }

    #[test]
    fn tombstoned_slots_are_reusable() {
        let mut dir = buffer_with(&["A", "B"]);
        dir.remove(0);
        assert_eq!(dir.allocate_slot(), Some(0));

        let mut deleted = dir.entry(1);
        deleted.set_marker(DIR_ENTRY_UNUSED);
        dir.set_entry(1, &deleted);
        dir.set_entry(0, &DirEntry::new(&short_name("C"), ATTR_ARCHIVE, 0));
        assert_eq!(dir.allocate_slot(), Some(1));
    }

    #[test]
    fn emptiness_ignores_dot_and_dotdot() {
        let mut dir = DirBuffer::new(5, vec![0u8; 512]);
        dir.set_entry(0, &DirEntry::new(&DOT_NAME, ATTR_DIRECTORY, 5));
        dir.set_entry(1, &DirEntry::new(&DOTDOT_NAME, ATTR_DIRECTORY, 0));
        assert!(dir.is_empty_dir());

        dir.set_entry(2, &DirEntry::new(&short_name("X"), ATTR_ARCHIVE, 0));
        assert!(!dir.is_empty_dir());
    }

    #[test]
    fn parent_cluster_reads_the_dotdot_entry() {
        let mut dir = DirBuffer::new(9, vec![0u8; 512]);
        dir.set_entry(0, &DirEntry::new(&DOT_NAME, ATTR_DIRECTORY, 9));
        dir.set_entry(1, &DirEntry::new(&DOTDOT_NAME, ATTR_DIRECTORY, 4));
        assert_eq!(dir.parent_cluster(), 4);
    }
}
