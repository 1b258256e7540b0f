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

//! Watch backends.

use ahash::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::Result;
use crate::event::EventType;
use crate::tree::DirEntry;
use crate::watcher::Watcher;

mod brute_force;
#[cfg(target_os = "linux")]
mod inotify;

use brute_force::BruteForceBackend;
#[cfg(target_os = "linux")]
use inotify::InotifyBackend;

// ----------------------------------------------------------------------------
// Statics
// ----------------------------------------------------------------------------

/// Driver registry.
///
/// Process-wide interning of live drivers by backend, so all subscriptions
/// on one backend share its watcher thread. The registry holds weak
/// references - dropping the last subscription shuts the driver down.
static REGISTRY: LazyLock<Mutex<HashMap<Backend, Weak<Driver>>>> =
    LazyLock::new(|| Mutex::new(HashMap::default()));

// ----------------------------------------------------------------------------
// Enums
// ----------------------------------------------------------------------------

/// Watch backend.
///
/// Backends that are not available on the running platform resolve to the
/// platform default, so callers can request by name without caring where
/// they run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    /// FSEvents, the macOS kernel channel.
    FsEvents,
    /// Inotify, the Linux kernel channel.
    Inotify,
    /// ReadDirectoryChangesW, the Windows kernel channel.
    Windows,
    /// Recursive scanning, available everywhere.
    BruteForce,
}

// ----------------------------------------------------------------------------

/// Watch driver.
///
/// The live instance behind a backend. A sum type with uniform operations
/// is all the polymorphism the engine needs - one dispatch at API entry.
#[derive(Debug)]
pub(crate) enum Driver {
    /// Inotify driver.
    #[cfg(target_os = "linux")]
    Inotify(InotifyBackend),
    /// Brute-force driver.
    BruteForce(BruteForceBackend),
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Backend {
    /// Parses a backend name.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil::backend::Backend;
    ///
    /// // Parse backend name
    /// assert_eq!(Backend::parse("brute-force"), Some(Backend::BruteForce));
    /// assert_eq!(Backend::parse("watchman"), None);
    /// ```
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "fs-events" => Some(Backend::FsEvents),
            "inotify" => Some(Backend::Inotify),
            "windows" => Some(Backend::Windows),
            "brute-force" => Some(Backend::BruteForce),
            _ => None,
        }
    }

    /// Returns the backend name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Backend::FsEvents => "fs-events",
            Backend::Inotify => "inotify",
            Backend::Windows => "windows",
            Backend::BruteForce => "brute-force",
        }
    }

    /// Resolves the backend to one available on the running platform.
    #[must_use]
    pub fn resolve(self) -> Self {
        match self {
            Backend::BruteForce => Backend::BruteForce,
            #[cfg(target_os = "linux")]
            _ => Backend::Inotify,
            #[cfg(not(target_os = "linux"))]
            _ => Backend::BruteForce,
        }
    }
}

// ----------------------------------------------------------------------------

impl Driver {
    /// Returns the shared driver for the given backend.
    ///
    /// Returns the live driver if any subscription still holds one, or
    /// interns a freshly started one otherwise.
    pub(crate) fn shared(backend: Backend) -> Result<Arc<Self>> {
        let backend = backend.resolve();
        let mut registry = lock(&REGISTRY);

        if let Some(driver) = registry.get(&backend).and_then(Weak::upgrade) {
            return Ok(driver);
        }

        let driver = Arc::new(match backend {
            #[cfg(target_os = "linux")]
            Backend::Inotify => Driver::Inotify(InotifyBackend::new()?),
            _ => Driver::BruteForce(BruteForceBackend::new()),
        });
        registry.insert(backend, Arc::downgrade(&driver));
        Ok(driver)
    }

    /// Starts delivering events for a watcher.
    pub(crate) fn subscribe(&self, watcher: &Arc<Watcher>) -> Result {
        match self {
            #[cfg(target_os = "linux")]
            Driver::Inotify(backend) => backend.subscribe(watcher),
            Driver::BruteForce(backend) => backend.subscribe(watcher),
        }
    }

    /// Stops delivering events for a watcher.
    pub(crate) fn unsubscribe(&self, watcher: &Arc<Watcher>) -> Result {
        match self {
            #[cfg(target_os = "linux")]
            Driver::Inotify(backend) => backend.unsubscribe(watcher),
            Driver::BruteForce(backend) => backend.unsubscribe(watcher),
        }
    }

    /// Logs a creation for every entry below the root.
    pub(crate) fn scan(&self, watcher: &Watcher) -> Result {
        match self {
            #[cfg(target_os = "linux")]
            Driver::Inotify(backend) => backend.scan(watcher),
            Driver::BruteForce(backend) => backend.scan(watcher),
        }
    }

    /// Materializes the current tree to disk.
    pub(crate) fn write_snapshot(&self, watcher: &Watcher, snapshot_path: &Path) -> Result {
        match self {
            #[cfg(target_os = "linux")]
            Driver::Inotify(backend) => backend.write_snapshot(watcher, snapshot_path),
            Driver::BruteForce(backend) => backend.write_snapshot(watcher, snapshot_path),
        }
    }

    /// Logs the events that reconcile a snapshot with the current tree.
    pub(crate) fn get_events_since(&self, watcher: &Watcher, snapshot_path: &Path) -> Result {
        match self {
            #[cfg(target_os = "linux")]
            Driver::Inotify(backend) => backend.get_events_since(watcher, snapshot_path),
            Driver::BruteForce(backend) => backend.get_events_since(watcher, snapshot_path),
        }
    }

    /// Applies an externally observed change to the cached tree.
    pub(crate) fn update_snapshot(
        &self,
        watcher: &Watcher,
        delta: &DirEntry,
        change: EventType,
    ) -> Result {
        match self {
            #[cfg(target_os = "linux")]
            Driver::Inotify(backend) => backend.update_snapshot(watcher, delta, change),
            Driver::BruteForce(backend) => backend.update_snapshot(watcher, delta, change),
        }
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl Default for Backend {
    /// Returns the best native backend for the running platform.
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Backend::Inotify
    }

    /// Returns the best native backend for the running platform.
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Backend::BruteForce
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Locks the registry, ignoring poisoning.
fn lock<K, V>(registry: &Mutex<HashMap<K, V>>) -> MutexGuard<'_, HashMap<K, V>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
