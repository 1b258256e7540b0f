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

//! Brute-force backend.

use std::fs::{File, Metadata};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::event::EventType;
use crate::tree::{DirEntry, DirTree};
use crate::watcher::Watcher;

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Brute-force backend.
///
/// The portable fallback: it has no kernel channel and cannot stream
/// changes, but it reads trees by recursive walking, which also underlies
/// snapshot mode on every platform. The native backends reuse the free
/// functions below for everything that is not subscription handling.
#[derive(Debug)]
pub(crate) struct BruteForceBackend {
    /// Backend mutex.
    mutex: Mutex<()>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl BruteForceBackend {
    /// Creates a brute-force backend.
    pub(crate) fn new() -> Self {
        Self { mutex: Mutex::new(()) }
    }

    /// Rejects the subscription, as there is nothing to stream from.
    pub(crate) fn subscribe(&self, watcher: &Arc<Watcher>) -> Result {
        let _guard = self.lock();
        Err(Error::watcher(
            watcher.dir(),
            "brute-force backend cannot stream changes",
        ))
    }

    /// Detaches a watcher, which never holds any backend state here.
    pub(crate) fn unsubscribe(&self, _watcher: &Arc<Watcher>) -> Result {
        Ok(())
    }

    /// Logs a creation for every entry below the root.
    pub(crate) fn scan(&self, watcher: &Watcher) -> Result {
        let _guard = self.lock();
        scan(watcher)
    }

    /// Materializes the current tree to disk.
    pub(crate) fn write_snapshot(&self, watcher: &Watcher, snapshot_path: &Path) -> Result {
        let _guard = self.lock();
        write_snapshot(watcher, snapshot_path)
    }

    /// Logs the events that reconcile a snapshot with the current tree.
    pub(crate) fn get_events_since(&self, watcher: &Watcher, snapshot_path: &Path) -> Result {
        let _guard = self.lock();
        get_events_since(watcher, snapshot_path)
    }

    /// Applies an externally observed change to the cached tree.
    pub(crate) fn update_snapshot(
        &self,
        watcher: &Watcher,
        delta: &DirEntry,
        change: EventType,
    ) -> Result {
        let _guard = self.lock();
        update_snapshot(watcher, delta, change)
    }

    /// Locks the backend, ignoring poisoning.
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Returns the shared tree for a watcher, reading it when needed.
///
/// The tree cache keeps trees alive only while someone holds them, so a
/// snapshot operation without a live subscription reads a fresh tree, while
/// one with a live subscription reuses the kernel-maintained state.
pub(crate) fn tree_for(
    watcher: &Watcher,
    should_read: bool,
    recursive_remove: bool,
) -> Result<Arc<DirTree>> {
    let tree = DirTree::get_cached(watcher.dir(), recursive_remove);
    if should_read && !tree.is_complete() {
        read_tree(watcher, &tree)?;
        tree.set_complete();
    }
    Ok(tree)
}

/// Populates a tree by recursively walking the watched root.
///
/// Symbolic links are recorded as themselves and never followed. Ignored
/// subtrees are pruned from the walk entirely, so their contents never
/// enter the tree.
pub(crate) fn read_tree(watcher: &Watcher, tree: &DirTree) -> Result {
    let walk = WalkDir::new(watcher.dir())
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|item| !watcher.is_ignored(item.path()));

    for item in walk {
        let item = item?;
        let metadata = item.metadata()?;
        tree.add(
            item.path(),
            inode(&metadata),
            mtime_nanos(&metadata),
            item.file_type().is_dir(),
            file_identity(item.path()).as_deref(),
        );
    }
    Ok(())
}

/// Logs a creation for every entry below the root.
pub(crate) fn scan(watcher: &Watcher) -> Result {
    let tree = tree_for(watcher, true, true)?;
    for entry in tree.entries() {
        if !watcher.is_ignored(&entry.path) {
            watcher.events().create(
                &entry.path,
                entry.is_dir,
                entry.ino,
                entry.file_id.as_deref(),
            );
        }
    }
    Ok(())
}

/// Materializes the current tree to disk.
pub(crate) fn write_snapshot(watcher: &Watcher, snapshot_path: &Path) -> Result {
    let tree = tree_for(watcher, true, true)?;
    let mut writer = BufWriter::new(File::create(snapshot_path)?);
    tree.write(&mut writer)?;
    writer.flush()?;
    Ok(())
}

/// Logs the events that reconcile a snapshot with the current tree.
pub(crate) fn get_events_since(watcher: &Watcher, snapshot_path: &Path) -> Result {
    let mut file = File::open(snapshot_path)?;
    let snapshot = DirTree::load(watcher.dir(), &mut file)?;

    let tree = tree_for(watcher, true, true)?;
    tree.get_changes(&snapshot, watcher.events());
    Ok(())
}

/// Applies an externally observed change to the cached tree.
///
/// This lets a caller that performed filesystem operations itself keep the
/// live tree current, so a later snapshot write reflects them. Without a
/// live subscription the cached tree is empty and the change is moot.
pub(crate) fn update_snapshot(watcher: &Watcher, delta: &DirEntry, change: EventType) -> Result {
    let tree = DirTree::get_cached(watcher.dir(), true);

    match change {
        EventType::Create | EventType::Update => match tree.find(&delta.path) {
            None => {
                tree.add(
                    &delta.path,
                    delta.ino,
                    delta.mtime,
                    delta.is_dir,
                    delta.file_id.as_deref(),
                );
            }
            Some(found) if found.is_dir == delta.is_dir => {
                tree.update(&delta.path, delta.ino, delta.mtime, delta.file_id.as_deref());
            }
            Some(_) => {
                // The object was replaced with the other kind
                tree.remove(&delta.path);
                tree.add(
                    &delta.path,
                    delta.ino,
                    delta.mtime,
                    delta.is_dir,
                    delta.file_id.as_deref(),
                );
            }
        },
        EventType::Delete => tree.remove(&delta.path),
        // Renames reach the tree as the creation of their target
        EventType::Rename => {}
    }
    Ok(())
}

// ----------------------------------------------------------------------------

/// Returns the modification time in nanoseconds since the epoch.
#[cfg(unix)]
pub(crate) fn mtime_nanos(metadata: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;

    let secs = u64::try_from(metadata.mtime()).unwrap_or(0);
    secs.saturating_mul(1_000_000_000) + u64::try_from(metadata.mtime_nsec()).unwrap_or(0)
}

/// Returns the modification time in nanoseconds since the epoch.
#[cfg(not(unix))]
pub(crate) fn mtime_nanos(metadata: &Metadata) -> u64 {
    use std::time::UNIX_EPOCH;

    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |duration| u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
}

/// Returns the inode identifier.
#[cfg(unix)]
pub(crate) fn inode(metadata: &Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;

    Some(metadata.ino())
}

/// Returns the inode identifier.
#[cfg(not(unix))]
pub(crate) fn inode(_metadata: &Metadata) -> Option<u64> {
    None
}

/// Returns the textual file identifier.
///
/// The low-resolution variant is much cheaper to obtain and stable enough
/// for identity tracking within one volume generation.
#[cfg(windows)]
pub(crate) fn file_identity(path: &Path) -> Option<String> {
    use file_id::FileId;

    match file_id::get_low_res_file_id(path).ok()? {
        FileId::LowRes { volume_serial_number, file_index } => {
            Some(format!("{volume_serial_number}-{file_index}"))
        }
        FileId::HighRes { volume_serial_number, file_id } => {
            Some(format!("{volume_serial_number}-{file_id}"))
        }
        FileId::Inode { device_id, inode_number } => {
            Some(format!("{device_id}-{inode_number}"))
        }
    }
}

/// Returns the textual file identifier.
#[cfg(not(windows))]
pub(crate) fn file_identity(_path: &Path) -> Option<String> {
    None
}
