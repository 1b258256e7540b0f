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

//! File event and event log.

use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

// ----------------------------------------------------------------------------
// Enums
// ----------------------------------------------------------------------------

/// File kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    /// File or symbolic link.
    File,
    /// Directory.
    Directory,
}

// ----------------------------------------------------------------------------

/// Logical event type.
///
/// The type is not stored but derived from the event's state: an event that
/// carries an old path and is neither created nor deleted is a rename, and
/// an event with no flags at all is an update. This is what allows the log
/// to fuse physical notifications by just toggling flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Path came into existence.
    Create,
    /// Path contents or attributes changed.
    Update,
    /// Path was removed.
    Delete,
    /// Path moved from another location.
    Rename,
}

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// File event.
///
/// One logical document event affecting a single path. The event log below
/// upholds that at most one event per path is alive at any time, so an event
/// always describes the net effect of everything that happened to its path
/// since the last delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// Absolute path.
    path: PathBuf,
    /// Source path, for renames.
    old_path: Option<PathBuf>,
    /// Inode identifier, if known.
    ino: Option<u64>,
    /// Textual file identifier, if known.
    file_id: Option<String>,
    /// Whether the path is a directory.
    is_dir: bool,
    /// Whether the path came into existence.
    is_created: bool,
    /// Whether the path was removed.
    is_deleted: bool,
}

// ----------------------------------------------------------------------------

/// File event log.
///
/// An ordered, path-keyed log of logical events for one subscription. Every
/// operation coalesces against the event already present for the path, so
/// rapid physical notification sequences collapse into the single logical
/// event that best describes the net effect. All methods lock the log for
/// the duration of a single coalescing decision.
#[derive(Debug, Default)]
pub struct EventList {
    /// Logged events.
    events: Mutex<Vec<Event>>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Event {
    /// Creates an event.
    fn new(path: PathBuf, is_dir: bool, ino: Option<u64>, file_id: Option<&str>) -> Self {
        Self {
            path,
            old_path: None,
            ino,
            file_id: file_id.map(String::from),
            is_dir,
            is_created: false,
            is_deleted: false,
        }
    }

    /// Returns the path of the event.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the source path, present only for renames.
    #[must_use]
    pub fn old_path(&self) -> Option<&Path> {
        if self.is_renamed() {
            self.old_path.as_deref()
        } else {
            None
        }
    }

    /// Returns the inode identifier, if known.
    #[inline]
    #[must_use]
    pub fn ino(&self) -> Option<u64> {
        self.ino
    }

    /// Returns the textual file identifier, if known.
    #[inline]
    #[must_use]
    pub fn file_id(&self) -> Option<&str> {
        self.file_id.as_deref()
    }

    /// Returns the file kind of the event.
    #[must_use]
    pub fn kind(&self) -> Kind {
        if self.is_dir {
            Kind::Directory
        } else {
            Kind::File
        }
    }

    /// Returns the logical event type.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        if self.is_renamed() {
            EventType::Rename
        } else if self.is_created {
            EventType::Create
        } else if self.is_deleted {
            EventType::Delete
        } else {
            EventType::Update
        }
    }

    /// Checks whether the event is a rename.
    fn is_renamed(&self) -> bool {
        !self.is_created && !self.is_deleted && self.old_path.is_some()
    }
}

// ----------------------------------------------------------------------------

impl EventList {
    /// Creates an event log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs a creation.
    ///
    /// A creation landing on a deleted event clears the deletion instead of
    /// setting the created flag - a path that was rapidly removed and then
    /// recreated reads as an update of the surviving document.
    pub fn create(&self, path: &Path, is_dir: bool, ino: Option<u64>, file_id: Option<&str>) {
        let mut events = self.lock();
        let event = Self::upsert(&mut events, path, is_dir, ino, file_id);
        if event.is_deleted {
            event.is_deleted = false;
        } else {
            event.is_created = true;
        }
    }

    /// Logs a modification.
    ///
    /// The flagless default state of an event is an update, so this only
    /// refreshes the identity fields of whatever is already logged.
    pub fn update(&self, path: &Path, ino: Option<u64>, file_id: Option<&str>) {
        let mut events = self.lock();
        Self::upsert(&mut events, path, false, ino, file_id);
    }

    /// Logs a removal.
    ///
    /// A removal landing on a created event erases the event entirely - a
    /// path that was rapidly created and removed again never surfaces.
    pub fn remove(&self, path: &Path, is_dir: bool, ino: Option<u64>, file_id: Option<&str>) {
        let mut events = self.lock();
        let event = Self::upsert(&mut events, path, is_dir, ino, file_id);
        if event.is_created {
            Self::erase(&mut events, path);
        } else {
            event.is_deleted = true;
        }
    }

    /// Logs a rename.
    ///
    /// An event already present at the target path receives removal
    /// semantics first, as the rename overwrote it. An event present at the
    /// source path is consumed, so consecutive renames of the same document
    /// collapse into one rename from the first source to the last target.
    /// Without a source event, the rename lands as-is, except on a deleted
    /// target event, whose deletion it clears into an update.
    pub fn rename(
        &self,
        old_path: &Path,
        new_path: &Path,
        is_dir: bool,
        ino: Option<u64>,
        file_id: Option<&str>,
    ) {
        let mut events = self.lock();

        // The rename overwrote whatever the target path held, so an event
        // at the target is either erased (it was created in this batch) or
        // marked deleted, exactly like a removal
        if let Some(index) = Self::position(&events, new_path) {
            if events[index].is_created {
                events.remove(index);
            } else {
                events[index].is_deleted = true;
            }
        }

        if let Some(index) = Self::position(&events, old_path) {
            let prior = events.remove(index);

            // A tombstone may survive the overwrite handling above. The
            // rename supersedes it - one event per path must hold.
            Self::erase(&mut events, new_path);

            // Consume the source event, preserving its identity fields
            // where the arguments are sentinels and chaining its source
            // path so rename sequences collapse end to end
            let mut event = Event::new(
                new_path.to_path_buf(),
                is_dir,
                ino.or(prior.ino),
                file_id.or(prior.file_id.as_deref()),
            );
            event.old_path = Some(match prior.old_path {
                Some(path) => path,
                None => old_path.to_path_buf(),
            });
            events.push(event);
        } else {
            let event = Self::upsert(&mut events, new_path, is_dir, ino, file_id);
            if event.is_deleted {
                // Moved over a tombstone - the target was observably
                // replaced, which reads as an update of the survivor
                event.is_deleted = false;
            } else {
                event.is_created = false;
                event.old_path = Some(old_path.to_path_buf());
            }
        }
    }

    /// Returns a copy of all logged events.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.lock().clone()
    }

    /// Takes all logged events, leaving the log empty.
    #[must_use]
    pub fn drain(&self) -> Vec<Event> {
        mem::take(&mut *self.lock())
    }

    /// Clears the log.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Returns the number of logged events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Checks whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Locks the log, ignoring poisoning.
    ///
    /// Coalescing never unwinds while holding the lock, and even if a
    /// consumer panic poisoned it, the log content is still consistent.
    fn lock(&self) -> MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finds or inserts the event for the given path.
    ///
    /// Identity fields only overwrite when the new value is known, while
    /// the kind always overwrites.
    fn upsert<'a>(
        events: &'a mut Vec<Event>,
        path: &Path,
        is_dir: bool,
        ino: Option<u64>,
        file_id: Option<&str>,
    ) -> &'a mut Event {
        let index = match Self::position(events, path) {
            Some(index) => index,
            None => {
                events.push(Event::new(path.to_path_buf(), is_dir, ino, file_id));
                events.len() - 1
            }
        };

        let event = &mut events[index];
        if let Some(ino) = ino {
            event.ino = Some(ino);
        }
        if let Some(file_id) = file_id {
            event.file_id = Some(file_id.to_string());
        }
        event.is_dir = is_dir;
        event
    }

    /// Returns the position of the event for the given path.
    fn position(events: &[Event], path: &Path) -> Option<usize> {
        events.iter().position(|event| event.path == path)
    }

    /// Erases the event for the given path, if any.
    fn erase(events: &mut Vec<Event>, path: &Path) {
        events.retain(|event| event.path != path);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
