// Copyright (c) 2025 Vigil and contributors

// SPDX-License-Identifier: MIT
// Third-party contributions licensed under DCO

// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:

// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NON-INFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

// ----------------------------------------------------------------------------

//! Directory tree.

use ahash::HashMap;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::Result;
use crate::event::EventList;

mod entry;

pub use entry::DirEntry;
use entry::Reader;

// ----------------------------------------------------------------------------
// Statics
// ----------------------------------------------------------------------------

/// Directory tree cache.
///
/// Process-wide interning of live trees by root path, so multiple
/// subscriptions to the same root share one tree. The cache holds weak
/// references and watchers hold strong ones - when the last watcher drops,
/// the tree is destroyed and its slot is cleared by the destructor hook.
static CACHE: LazyLock<Mutex<HashMap<PathBuf, Weak<DirTree>>>> =
    LazyLock::new(|| Mutex::new(HashMap::default()));

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Directory tree.
///
/// An in-memory snapshot of the filesystem subtree below one root: a mapping
/// from absolute path to [`DirEntry`], persistable to disk and diffable
/// against another tree. The root itself is never stored as an entry, and
/// every stored path starts with the root plus a separator. A mutex guards
/// all mutation and any iteration that could race with it.
#[derive(Debug)]
pub struct DirTree {
    /// Watched root path.
    root: PathBuf,
    /// Whether removing a directory also removes all descendants.
    recursive_remove: bool,
    /// Guarded entry state.
    state: Mutex<State>,
}

// ----------------------------------------------------------------------------

/// Guarded tree state.
#[derive(Debug, Default)]
struct State {
    /// Entries by absolute path.
    entries: BTreeMap<PathBuf, DirEntry>,
    /// Whether a full scan has populated the tree.
    is_complete: bool,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl DirTree {
    /// Returns the shared tree for the given root.
    ///
    /// Returns the live tree if any subscription still holds one, or interns
    /// a new, incomplete tree otherwise. Note that the removal policy is
    /// fixed by whoever interns the tree first.
    #[must_use]
    pub fn get_cached(root: &Path, recursive_remove: bool) -> Arc<Self> {
        let mut cache = lock(&CACHE);

        if let Some(tree) = cache.get(root).and_then(Weak::upgrade) {
            return tree;
        }

        let tree = Arc::new(Self {
            root: root.to_path_buf(),
            recursive_remove,
            state: Mutex::new(State::default()),
        });
        cache.insert(root.to_path_buf(), Arc::downgrade(&tree));
        tree
    }

    /// Loads a tree from serialized snapshot text.
    ///
    /// A snapshot that does not even start with an entry count is treated as
    /// empty, matching what earlier versions wrote for empty trees.
    pub fn load(root: &Path, reader: &mut impl Read) -> Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let mut entries = BTreeMap::new();
        let mut reader = Reader::new(&data);
        if let Ok(count) = reader.number() {
            for _ in 0..count {
                if reader.is_empty() {
                    break;
                }
                let entry = DirEntry::read(&mut reader)?;
                entries.insert(entry.path.clone(), entry);
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            recursive_remove: true,
            state: Mutex::new(State { entries, is_complete: true }),
        })
    }

    /// Returns the root path.
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Checks whether a full scan has populated the tree.
    pub(crate) fn is_complete(&self) -> bool {
        self.lock().is_complete
    }

    /// Marks the tree as populated.
    pub(crate) fn set_complete(&self) {
        self.lock().is_complete = true;
    }

    /// Inserts or replaces an entry, returning the stored record.
    pub fn add(
        &self,
        path: &Path,
        ino: Option<u64>,
        mtime: u64,
        is_dir: bool,
        file_id: Option<&str>,
    ) -> DirEntry {
        let entry = DirEntry::new(path.to_path_buf(), ino, mtime, is_dir, file_id);
        self.lock().entries.insert(path.to_path_buf(), entry.clone());
        entry
    }

    /// Updates an entry, returning the stored record.
    ///
    /// The modification time always overwrites, while identity fields only
    /// overwrite when the new value is known.
    pub fn update(
        &self,
        path: &Path,
        ino: Option<u64>,
        mtime: u64,
        file_id: Option<&str>,
    ) -> Option<DirEntry> {
        let mut state = self.lock();
        let entry = state.entries.get_mut(path)?;

        entry.mtime = mtime;
        if ino.is_some() {
            entry.ino = ino;
        }
        if let Some(file_id) = file_id {
            entry.file_id = Some(file_id.to_string());
        }
        Some(entry.clone())
    }

    /// Removes an entry.
    ///
    /// If the entry is a directory and the removal policy is recursive,
    /// every descendant entry is removed along with it.
    pub fn remove(&self, path: &Path) {
        let mut state = self.lock();

        if self.recursive_remove && state.entries.get(path).is_some_and(|entry| entry.is_dir) {
            // Path ordering keeps a directory's descendants contiguous
            // right behind it, so a bounded range scan finds them all
            let descendants: Vec<PathBuf> = state
                .entries
                .range(path.to_path_buf()..)
                .map(|(path, _)| path)
                .take_while(|candidate| candidate.starts_with(path))
                .cloned()
                .collect();
            for descendant in descendants {
                state.entries.remove(&descendant);
            }
        }

        state.entries.remove(path);
    }

    /// Returns the entry for the given path.
    #[must_use]
    pub fn find(&self, path: &Path) -> Option<DirEntry> {
        self.lock().entries.get(path).cloned()
    }

    /// Returns the entry with the given inode identifier.
    #[must_use]
    pub fn find_by_ino(&self, ino: u64) -> Option<DirEntry> {
        find_by_ino(&self.lock().entries, ino)
    }

    /// Returns the entry with the given file identifier.
    #[must_use]
    pub fn find_by_file_id(&self, file_id: &str) -> Option<DirEntry> {
        find_by_file_id(&self.lock().entries, file_id)
    }

    /// Returns a copy of all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<DirEntry> {
        self.lock().entries.values().cloned().collect()
    }

    /// Writes the tree as serialized snapshot text.
    pub fn write(&self, writer: &mut impl Write) -> Result {
        let state = self.lock();

        write!(writer, "{}\n", state.entries.len())?;
        for entry in state.entries.values() {
            entry.write(writer)?;
        }
        Ok(())
    }

    /// Computes the events that reconcile a prior tree with this one.
    ///
    /// Entries are matched by identity first - file identifier when present,
    /// inode otherwise - with a path-keyed fallback, so documents are traced
    /// across renames. Both tree locks are held for the duration, always in
    /// the same order: self, then prior.
    pub fn get_changes(&self, prior: &DirTree, events: &EventList) {
        let state = self.lock();
        let mut prior_state = prior.lock();

        for entry in state.entries.values() {
            let Some(found) = identify(&prior_state.entries, entry) else {
                // No identity match, so fall back to the path: an unknown
                // path is a creation, a known one with a different mtime
                // is a modification of a file we cannot trace further
                match prior_state.entries.get(&entry.path) {
                    None => {
                        events.create(
                            &entry.path,
                            entry.is_dir,
                            entry.ino,
                            entry.file_id.as_deref(),
                        );
                    }
                    Some(prev) => {
                        if prev.mtime != entry.mtime && !prev.is_dir && !entry.is_dir {
                            events.update(&entry.path, entry.ino, entry.file_id.as_deref());
                        }
                    }
                }
                continue;
            };

            if found.is_dir != entry.is_dir {
                // Same identity, different kind - the object was replaced
                events.remove(&found.path, found.is_dir, found.ino, found.file_id.as_deref());
                events.create(&entry.path, entry.is_dir, entry.ino, entry.file_id.as_deref());
            } else if found.path != entry.path {
                // The rename coalescer expects the source path to already
                // be present in the log, so a synthetic create precedes it
                events.create(&found.path, found.is_dir, found.ino, found.file_id.as_deref());
                events.rename(
                    &found.path,
                    &entry.path,
                    entry.is_dir,
                    entry.ino,
                    entry.file_id.as_deref(),
                );

                if found.is_dir {
                    rebase(&mut prior_state.entries, &found.path, &entry.path);
                }
            } else if !entry.is_dir && found.mtime != entry.mtime {
                events.update(&entry.path, entry.ino, entry.file_id.as_deref());
            }
        }

        // Whatever remains unmatched in the prior tree is gone. Entries
        // without any identity fall back to path presence, as they would
        // otherwise read as removed even though they still exist.
        for prev in prior_state.entries.values() {
            let alive = match (&prev.file_id, prev.ino) {
                (Some(file_id), _) => find_by_file_id(&state.entries, file_id).is_some(),
                (None, Some(ino)) => find_by_ino(&state.entries, ino).is_some(),
                (None, None) => state.entries.contains_key(&prev.path),
            };
            if !alive {
                events.remove(&prev.path, prev.is_dir, prev.ino, prev.file_id.as_deref());
            }
        }
    }

    /// Locks the tree state, ignoring poisoning.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl Drop for DirTree {
    /// Clears the cache slot of a destroyed tree.
    fn drop(&mut self) {
        let mut cache = lock(&CACHE);

        // The slot may already hold a newer tree for the same root when a
        // fresh intern raced this drop, so only dead slots are cleared
        if cache.get(&self.root).is_some_and(|slot| slot.upgrade().is_none()) {
            cache.remove(&self.root);
        }
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Locks a cache map, ignoring poisoning.
fn lock<K, V>(cache: &Mutex<HashMap<K, V>>) -> MutexGuard<'_, HashMap<K, V>> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the identity match for the given entry, if any.
fn identify(entries: &BTreeMap<PathBuf, DirEntry>, entry: &DirEntry) -> Option<DirEntry> {
    match (&entry.file_id, entry.ino) {
        (Some(file_id), _) => find_by_file_id(entries, file_id),
        (None, Some(ino)) => find_by_ino(entries, ino),
        (None, None) => None,
    }
}

/// Returns the entry with the given inode identifier.
fn find_by_ino(entries: &BTreeMap<PathBuf, DirEntry>, ino: u64) -> Option<DirEntry> {
    entries.values().find(|entry| entry.ino == Some(ino)).cloned()
}

/// Returns the entry with the given file identifier.
fn find_by_file_id(entries: &BTreeMap<PathBuf, DirEntry>, file_id: &str) -> Option<DirEntry> {
    entries
        .values()
        .find(|entry| entry.file_id.as_deref() == Some(file_id))
        .cloned()
}

/// Rewrites all descendants of a renamed directory to its new path.
///
/// Descendants are re-keyed in place so they do not read as removed in the
/// reconciliation pass that follows.
fn rebase(entries: &mut BTreeMap<PathBuf, DirEntry>, from: &Path, to: &Path) {
    let descendants: Vec<PathBuf> = entries
        .range(from.to_path_buf()..)
        .map(|(path, _)| path)
        .take_while(|candidate| candidate.starts_with(from))
        .filter(|candidate| *candidate != from)
        .cloned()
        .collect();

    for descendant in descendants {
        if let Some(mut entry) = entries.remove(&descendant) {
            let tail = descendant.strip_prefix(from).expect("invariant");
            entry.path = to.join(tail);
            entries.insert(entry.path.clone(), entry);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn tree(root: &str, recursive_remove: bool) -> DirTree {
        DirTree {
            root: PathBuf::from(root),
            recursive_remove,
            state: Mutex::new(State::default()),
        }
    }

    #[test]
    fn add_find_remove() {
        let tree = tree("/root", true);
        tree.add(Path::new("/root/doc"), Some(1), 10, false, None);

        assert!(tree.find(Path::new("/root/doc")).is_some());
        assert_eq!(tree.find_by_ino(1).unwrap().path, PathBuf::from("/root/doc"));

        tree.remove(Path::new("/root/doc"));
        assert!(tree.find(Path::new("/root/doc")).is_none());
    }

    #[test]
    fn update_keeps_unknown_identity() {
        let tree = tree("/root", true);
        tree.add(Path::new("/root/doc"), Some(1), 10, false, Some("5-1"));

        let entry = tree.update(Path::new("/root/doc"), None, 20, None).unwrap();
        assert_eq!(entry.mtime, 20);
        assert_eq!(entry.ino, Some(1));
        assert_eq!(entry.file_id.as_deref(), Some("5-1"));
    }

    #[test]
    fn recursive_remove_erases_descendants() {
        let tree = tree("/root", true);
        tree.add(Path::new("/root/sub"), Some(1), 1, true, None);
        tree.add(Path::new("/root/sub/doc"), Some(2), 1, false, None);
        tree.add(Path::new("/root/subsequent"), Some(3), 1, false, None);

        tree.remove(Path::new("/root/sub"));
        assert!(tree.find(Path::new("/root/sub/doc")).is_none());
        // A sibling sharing the name as a prefix is not a descendant
        assert!(tree.find(Path::new("/root/subsequent")).is_some());
    }

    #[test]
    fn non_recursive_remove_keeps_descendants() {
        let tree = tree("/root", false);
        tree.add(Path::new("/root/sub"), Some(1), 1, true, None);
        tree.add(Path::new("/root/sub/doc"), Some(2), 1, false, None);

        tree.remove(Path::new("/root/sub"));
        assert!(tree.find(Path::new("/root/sub/doc")).is_some());
    }

    #[test]
    fn snapshot_roundtrip() {
        let before = tree("/root", true);
        before.add(Path::new("/root/doc"), Some(1), 10, false, None);
        before.add(Path::new("/root/sub"), Some(2), 20, true, Some("5-2"));

        let mut buffer = Vec::new();
        before.write(&mut buffer).unwrap();

        let after = DirTree::load(Path::new("/root"), &mut buffer.as_slice()).unwrap();
        assert_eq!(after.entries(), before.entries());
        assert!(after.is_complete());
    }

    #[test]
    fn load_accepts_empty_snapshot() {
        let tree = DirTree::load(Path::new("/root"), &mut std::io::empty()).unwrap();
        assert!(tree.entries().is_empty());
    }

    #[test]
    fn changes_detects_create_update_remove() {
        let prior = tree("/root", true);
        prior.add(Path::new("/root/stale"), Some(1), 10, false, None);
        prior.add(Path::new("/root/doc"), Some(2), 10, false, None);

        let current = tree("/root", true);
        current.add(Path::new("/root/doc"), Some(2), 30, false, None);
        current.add(Path::new("/root/fresh"), Some(3), 10, false, None);

        let events = EventList::new();
        current.get_changes(&prior, &events);

        let events = events.events();
        assert_eq!(events.len(), 3);
        for event in &events {
            match event.path().to_str().unwrap() {
                "/root/doc" => assert_eq!(event.event_type(), EventType::Update),
                "/root/fresh" => assert_eq!(event.event_type(), EventType::Create),
                "/root/stale" => assert_eq!(event.event_type(), EventType::Delete),
                path => panic!("unexpected event for {path}"),
            }
        }
    }

    #[test]
    fn changes_detects_rename_by_ino() {
        let prior = tree("/root", true);
        prior.add(Path::new("/root/before"), Some(1), 10, false, None);

        let current = tree("/root", true);
        current.add(Path::new("/root/after"), Some(1), 10, false, None);

        let events = EventList::new();
        current.get_changes(&prior, &events);

        let events = events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), EventType::Rename);
        assert_eq!(events[0].path(), Path::new("/root/after"));
        assert_eq!(events[0].old_path(), Some(Path::new("/root/before")));
    }

    #[test]
    fn changes_prefers_file_id_over_ino() {
        let prior = tree("/root", true);
        prior.add(Path::new("/root/before"), Some(1), 10, false, Some("5-9"));

        let current = tree("/root", true);
        // The inode changed, but the file identifier proves identity
        current.add(Path::new("/root/after"), Some(2), 10, false, Some("5-9"));

        let events = EventList::new();
        current.get_changes(&prior, &events);

        let events = events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), EventType::Rename);
    }

    #[test]
    fn changes_renames_directory_without_descendant_noise() {
        let prior = tree("/root", true);
        prior.add(Path::new("/root/old"), Some(1), 10, true, None);
        prior.add(Path::new("/root/old/doc"), Some(2), 10, false, None);
        prior.add(Path::new("/root/old/sub"), Some(3), 10, true, None);
        prior.add(Path::new("/root/old/sub/deep"), Some(4), 10, false, None);

        let current = tree("/root", true);
        current.add(Path::new("/root/new"), Some(1), 10, true, None);
        current.add(Path::new("/root/new/doc"), Some(2), 10, false, None);
        current.add(Path::new("/root/new/sub"), Some(3), 10, true, None);
        current.add(Path::new("/root/new/sub/deep"), Some(4), 10, false, None);

        let events = EventList::new();
        current.get_changes(&prior, &events);

        // Only the directory itself is reported, descendants move with it
        let events = events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), EventType::Rename);
        assert_eq!(events[0].path(), Path::new("/root/new"));
        assert_eq!(events[0].old_path(), Some(Path::new("/root/old")));
    }

    #[test]
    fn changes_reports_kind_flip_as_remove_and_create() {
        let prior = tree("/root", true);
        prior.add(Path::new("/root/doc"), Some(1), 10, false, None);

        let current = tree("/root", true);
        current.add(Path::new("/root/doc"), Some(1), 20, true, None);

        let events = EventList::new();
        current.get_changes(&prior, &events);

        // Removal and creation on the same path coalesce into an update
        let events = events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), EventType::Update);
        assert_eq!(events[0].kind(), crate::event::Kind::Directory);
    }

    #[test]
    fn changes_keeps_identityless_entry_alive_by_path() {
        let prior = tree("/root", true);
        prior.add(Path::new("/root/doc"), None, 10, false, None);

        let current = tree("/root", true);
        current.add(Path::new("/root/doc"), None, 10, false, None);

        let events = EventList::new();
        current.get_changes(&prior, &events);
        assert!(events.is_empty());
    }

    #[test]
    fn changes_without_differences_is_empty() {
        let prior = tree("/root", true);
        prior.add(Path::new("/root/doc"), Some(1), 10, false, None);

        let current = tree("/root", true);
        current.add(Path::new("/root/doc"), Some(1), 10, false, None);

        let events = EventList::new();
        current.get_changes(&prior, &events);
        assert!(events.is_empty());
    }

    #[test]
    fn cache_shares_and_clears() {
        let root = PathBuf::from("/vigil-test-cache-root");
        let first = DirTree::get_cached(&root, true);
        let second = DirTree::get_cached(&root, true);
        assert!(Arc::ptr_eq(&first, &second));

        drop(first);
        drop(second);

        // The slot was cleared, so the next request interns a fresh tree
        let third = DirTree::get_cached(&root, true);
        assert!(!third.is_complete());
    }
}
