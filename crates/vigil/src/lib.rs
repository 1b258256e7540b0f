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

//! Recursive filesystem change notification.
//!
//! Given a root directory, this crate reports the sequence of logical
//! document events - create, update, delete, rename - affecting any file,
//! directory or symbolic link below that root, identifying each affected
//! object by path, kind, and a stable inode-style identifier.
//!
//! Two complementary modes are supported: a long-lived [`subscribe`]
//! subscription that streams coalesced event batches to a consumer, and a
//! snapshot mode that persists a tree state to disk via [`write_snapshot`]
//! and later computes the events that would reconcile it with the current
//! on-disk state via [`get_events_since`].
//!
//! # Examples
//!
//! ``` no_run
//! # use std::error::Error;
//! # fn main() -> Result<(), Box<dyn Error>> {
//! use vigil::Options;
//!
//! // Subscribe and print event batches as they arrive
//! let subscription = vigil::subscribe(
//!     ".",
//!     |batch| println!("{batch:?}"),
//!     Options::new(),
//! )?;
//!
//! // Stop watching
//! subscription.unsubscribe()?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]

use ahash::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod backend;
pub mod error;
pub mod event;
pub mod tree;
pub mod watcher;

pub use backend::Backend;
pub use error::{Error, Result};
pub use event::{Event, EventType, Kind};
pub use tree::{DirEntry, DirTree};
pub use watcher::Subscription;

use backend::Driver;
use watcher::Watcher;

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Watch options.
///
/// Selects the backend serving an operation and the set of ignored paths.
/// Any path equal to or below an ignore entry is suppressed at the earliest
/// point - it never enters the tree, the event log, or a snapshot.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Requested backend.
    backend: Option<Backend>,
    /// Ignored paths.
    ignore: Vec<PathBuf>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Options {
    /// Creates watch options with the platform defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the backend.
    ///
    /// Backends that are unavailable on the running platform resolve to the
    /// platform default.
    #[must_use]
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Sets the ignored paths.
    ///
    /// Entries are expected to be absolute paths below the watched root.
    #[must_use]
    pub fn ignore<T>(mut self, paths: T) -> Self
    where
        T: IntoIterator,
        T::Item: Into<PathBuf>,
    {
        self.ignore = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the ignored paths as a set.
    fn ignore_set(&self) -> HashSet<PathBuf> {
        self.ignore.iter().cloned().collect()
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Starts a subscription on the given root directory.
///
/// The callback receives batches of coalesced events in observation order,
/// or a one-shot [`Error::Watcher`] when the subscription dies - after
/// which no further batches arrive and the caller must resubscribe.
///
/// # Errors
///
/// Returns [`Error::Watcher`] when the root is missing, not a directory,
/// or a kernel watch cannot be installed.
pub fn subscribe<P, F>(dir: P, callback: F, options: Options) -> Result<Subscription>
where
    P: AsRef<Path>,
    F: FnMut(Result<Vec<Event>>) + Send + 'static,
{
    let dir = resolve_root(dir.as_ref())?;
    let watcher = Arc::new(Watcher::new(
        dir,
        options.ignore_set(),
        Some(Box::new(callback)),
    ));

    let driver = Driver::shared(options.backend.unwrap_or_default())?;
    driver.subscribe(&watcher)?;
    Ok(Subscription::new(watcher, driver))
}

/// Returns a creation event for every entry below the given root.
///
/// The root itself is not reported.
pub fn scan<P>(dir: P, options: Options) -> Result<Vec<Event>>
where
    P: AsRef<Path>,
{
    let dir = resolve_root(dir.as_ref())?;
    let watcher = Arc::new(Watcher::new(dir, options.ignore_set(), None));

    let driver = Driver::shared(options.backend.unwrap_or_default())?;
    driver.scan(&watcher)?;
    Ok(watcher.events().drain())
}

/// Persists the current tree state of the given root to disk.
pub fn write_snapshot<P, S>(dir: P, snapshot_path: S, options: Options) -> Result
where
    P: AsRef<Path>,
    S: AsRef<Path>,
{
    let dir = resolve_root(dir.as_ref())?;
    let watcher = Arc::new(Watcher::new(dir, options.ignore_set(), None));

    let driver = Driver::shared(options.backend.unwrap_or_default())?;
    driver.write_snapshot(&watcher, snapshot_path.as_ref())
}

/// Returns the events that reconcile a snapshot with the current state.
///
/// Objects are traced by identity across renames, so a document that moved
/// while nobody was watching comes back as a single rename event.
pub fn get_events_since<P, S>(dir: P, snapshot_path: S, options: Options) -> Result<Vec<Event>>
where
    P: AsRef<Path>,
    S: AsRef<Path>,
{
    let dir = resolve_root(dir.as_ref())?;
    let watcher = Arc::new(Watcher::new(dir, options.ignore_set(), None));

    let driver = Driver::shared(options.backend.unwrap_or_default())?;
    driver.get_events_since(&watcher, snapshot_path.as_ref())?;
    Ok(watcher.events().drain())
}

/// Applies an externally observed change to the cached tree of a root.
///
/// This keeps the live tree current when the caller performs filesystem
/// operations itself, so a later [`write_snapshot`] reflects them without
/// waiting for the kernel to deliver the corresponding notifications.
/// Renames are expected as the creation of their target path.
pub fn update_snapshot<P>(
    dir: P,
    delta: &DirEntry,
    change: EventType,
    options: Options,
) -> Result
where
    P: AsRef<Path>,
{
    let dir = resolve_root(dir.as_ref())?;
    let watcher = Arc::new(Watcher::new(dir, options.ignore_set(), None));

    let driver = Driver::shared(options.backend.unwrap_or_default())?;
    driver.update_snapshot(&watcher, delta, change)
}

// ----------------------------------------------------------------------------

/// Resolves a root directory.
///
/// Symbolic links in the root path are resolved here, once - symbolic links
/// below the root are never followed.
fn resolve_root(dir: &Path) -> Result<PathBuf> {
    let root = fs::canonicalize(dir)
        .map_err(|error| Error::watcher(dir, format!("cannot resolve root: {error}")))?;

    let metadata = fs::metadata(&root)
        .map_err(|error| Error::watcher(dir, format!("cannot resolve root: {error}")))?;
    if !metadata.is_dir() {
        return Err(Error::watcher(dir, "root is not a directory"));
    }
    Ok(root)
}
