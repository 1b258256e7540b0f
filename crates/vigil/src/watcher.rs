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

//! File watcher.

use ahash::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::Driver;
use crate::error::{Error, Result};
use crate::event::{Event, EventList};

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// File watcher.
///
/// The state of one subscription: the watched root, the set of ignored
/// paths, the owned event log, and the consumer callback. Multiple watchers
/// may exist for the same root - they share the cached directory tree, but
/// each logs and delivers its own events.
pub struct Watcher {
    /// Watched root path.
    dir: PathBuf,
    /// Ignored paths.
    ignore: HashSet<PathBuf>,
    /// Owned event log.
    events: EventList,
    /// Consumer callback.
    callback: Mutex<Option<Callback>>,
}

// ----------------------------------------------------------------------------

/// Subscription handle.
///
/// Keeps the watcher and its backend alive. Dropping the handle unsubscribes
/// synchronously, and dropping the last handle on a backend blocks until the
/// backend's watcher thread has exited.
pub struct Subscription {
    /// Subscribed watcher.
    watcher: Option<Arc<Watcher>>,
    /// Serving driver.
    driver: Arc<Driver>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Watcher {
    /// Creates a file watcher.
    pub(crate) fn new(
        dir: PathBuf,
        ignore: HashSet<PathBuf>,
        callback: Option<Callback>,
    ) -> Self {
        Self {
            dir,
            ignore,
            events: EventList::new(),
            callback: Mutex::new(callback),
        }
    }

    /// Returns the watched root path.
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the event log.
    #[inline]
    pub(crate) fn events(&self) -> &EventList {
        &self.events
    }

    /// Checks whether the given path is ignored.
    ///
    /// A path equal to or below any ignore entry is elided. This is checked
    /// at the earliest point in every backend, so ignored paths never reach
    /// the tree or the event log.
    pub(crate) fn is_ignored(&self, path: &Path) -> bool {
        self.ignore.iter().any(|prefix| path.starts_with(prefix))
    }

    /// Delivers the logged events to the consumer and clears the log.
    ///
    /// Empty batches are not delivered, as everything a watcher observed
    /// since the last delivery may have coalesced away or been ignored.
    pub(crate) fn notify(&self) {
        let events = self.events.drain();
        if events.is_empty() {
            return;
        }

        if let Some(callback) = self.lock().as_mut() {
            callback(Ok(events));
        }
    }

    /// Delivers a one-shot failure to the consumer.
    ///
    /// The callback is taken, so a failed subscription never observes
    /// another batch. The caller must resubscribe.
    pub(crate) fn notify_error(&self, error: Error) {
        if let Some(mut callback) = self.lock().take() {
            callback(Err(error));
        }
    }

    /// Locks the callback, ignoring poisoning.
    fn lock(&self) -> MutexGuard<'_, Option<Callback>> {
        self.callback.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------

impl Subscription {
    /// Creates a subscription handle.
    pub(crate) fn new(watcher: Arc<Watcher>, driver: Arc<Driver>) -> Self {
        Self { watcher: Some(watcher), driver }
    }

    /// Ends the subscription, releasing all kernel resources.
    ///
    /// # Errors
    ///
    /// Errors returned by the backend while detaching the watcher are
    /// forwarded. The subscription is finished either way.
    pub fn unsubscribe(mut self) -> Result {
        self.finish()
    }

    /// Detaches the watcher from the backend, at most once.
    fn finish(&mut self) -> Result {
        match self.watcher.take() {
            Some(watcher) => self.driver.unsubscribe(&watcher),
            None => Ok(()),
        }
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl Drop for Subscription {
    /// Unsubscribes when the handle is dropped.
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

// ----------------------------------------------------------------------------

impl fmt::Debug for Watcher {
    /// Formats the file watcher for debugging.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("dir", &self.dir)
            .field("ignore", &self.ignore)
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------

impl fmt::Debug for Subscription {
    /// Formats the subscription for debugging.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("dir", &self.watcher.as_ref().map(|watcher| watcher.dir()))
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Type aliases
// ----------------------------------------------------------------------------

/// Consumer callback.
///
/// Receives either a batch of coalesced events in observation order, or a
/// one-shot watcher error that terminates the subscription.
pub(crate) type Callback = Box<dyn FnMut(Result<Vec<Event>>) + Send>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn watcher(ignore: &[&str]) -> Watcher {
        Watcher::new(
            PathBuf::from("/root"),
            ignore.iter().map(|path| PathBuf::from(*path)).collect(),
            None,
        )
    }

    #[test]
    fn ignores_equal_and_nested_paths() {
        let watcher = watcher(&["/root/skip"]);
        assert!(watcher.is_ignored(Path::new("/root/skip")));
        assert!(watcher.is_ignored(Path::new("/root/skip/deep/doc")));
        assert!(!watcher.is_ignored(Path::new("/root/skipped")));
        assert!(!watcher.is_ignored(Path::new("/root/doc")));
    }

    #[test]
    fn empty_ignore_set_ignores_nothing() {
        let watcher = watcher(&[]);
        assert!(!watcher.is_ignored(Path::new("/root/doc")));
    }
}
