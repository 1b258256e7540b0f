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

//! Inotify backend.

use ahash::HashMap;
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd;
use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};
use std::{fmt, fs};
use tracing::{debug, trace, warn};

use super::brute_force;
use crate::error::{Error, Result};
use crate::event::EventType;
use crate::tree::{DirEntry, DirTree};
use crate::watcher::Watcher;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Poll interval in milliseconds.
///
/// The watcher thread blocks on the inotify descriptor and the shutdown
/// pipe, and wakes up at this interval regardless, so it can never miss a
/// shutdown indefinitely even if the pipe write is lost.
const POLL_INTERVAL: u16 = 500;

/// Time after which an unmatched pending move expires.
const MOVE_TIMEOUT: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Inotify backend.
///
/// The native Linux driver. Inotify watches are per-directory, so the
/// backend installs one watch for every directory below each subscribed
/// root and keeps installing them as directories appear. A dedicated thread
/// drains the kernel queue and maintains the shared trees and per-watcher
/// event logs; dropping the backend shuts that thread down synchronously.
pub(crate) struct InotifyBackend {
    /// Guarded backend state.
    shared: Arc<Mutex<Shared>>,
    /// Write end of the shutdown pipe.
    pipe: OwnedFd,
    /// Join handle for the watcher thread.
    thread: Option<JoinHandle<()>>,
}

// ----------------------------------------------------------------------------

/// Guarded backend state.
///
/// This is the coarsest lock in the engine: it serializes subscription
/// changes against per-event processing, and thereby orders tree updates
/// and event log appends.
struct Shared {
    /// Watch registration handle.
    watches: Watches,
    /// Subscriptions by watch descriptor.
    ///
    /// A single descriptor may serve several watchers that share a root,
    /// which is why this is a multimap.
    subscriptions: HashMap<WatchDescriptor, Vec<Subscription>>,
    /// Pending moves by event cookie.
    pending_moves: HashMap<u32, PendingMove>,
}

// ----------------------------------------------------------------------------

/// Inotify subscription.
///
/// One watched directory on behalf of one watcher.
#[derive(Clone)]
struct Subscription {
    /// Shared directory tree.
    tree: Arc<DirTree>,
    /// Watched directory path.
    path: PathBuf,
    /// Subscribed watcher.
    watcher: Arc<Watcher>,
}

// ----------------------------------------------------------------------------

/// Pending move.
///
/// The source half of a kernel move pair, kept until its destination half
/// arrives or the pair times out. Matching pairs is only needed to rewrite
/// subscription paths when a directory moved - the event log never records
/// a kernel move pair as a rename.
struct PendingMove {
    /// When the source half was observed.
    at: Instant,
    /// Source path.
    path: PathBuf,
}

// ----------------------------------------------------------------------------

/// Read buffer for the inotify descriptor.
///
/// Kernel records require event alignment, which a plain byte array does
/// not guarantee.
#[repr(align(4))]
struct Buffer([u8; 8192]);

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl InotifyBackend {
    /// Creates an inotify backend and starts its watcher thread.
    pub(crate) fn new() -> Result<Self> {
        let inotify = Inotify::init()?;
        let (pipe_read, pipe_write) =
            unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).map_err(io::Error::from)?;

        let shared = Arc::new(Mutex::new(Shared {
            watches: inotify.watches(),
            subscriptions: HashMap::default(),
            pending_moves: HashMap::default(),
        }));

        // We deliberately use unwrap here, as the capability to spawn threads
        // is a fundamental requirement of the backend
        let thread = {
            let shared = Arc::clone(&shared);
            Builder::new()
                .name(String::from("vigil/inotify"))
                .spawn(move || run(inotify, &pipe_read, &shared))
                .unwrap()
        };

        Ok(Self { shared, pipe: pipe_write, thread: Some(thread) })
    }

    /// Starts delivering events for a watcher.
    ///
    /// Walks the cached tree and installs a watch on the root and on every
    /// directory below it. A failing installation detaches the watcher
    /// again and surfaces as a watcher error.
    pub(crate) fn subscribe(&self, watcher: &Arc<Watcher>) -> Result {
        let mut shared = self.lock();
        let tree = brute_force::tree_for(watcher, true, true)?;

        let mut paths = vec![watcher.dir().to_path_buf()];
        paths.extend(
            tree.entries()
                .into_iter()
                .filter(|entry| entry.is_dir)
                .map(|entry| entry.path),
        );

        for path in paths {
            if let Err(error) = watch_dir(&mut shared, watcher, &tree, &path) {
                let _ = unsubscribe(&mut shared, watcher);
                return Err(Error::watcher(
                    &path,
                    format!("inotify watch installation failed: {error}"),
                ));
            }
        }
        Ok(())
    }

    /// Stops delivering events for a watcher and releases kernel resources.
    pub(crate) fn unsubscribe(&self, watcher: &Arc<Watcher>) -> Result {
        let mut shared = self.lock();
        unsubscribe(&mut shared, watcher)
    }

    /// Logs a creation for every entry below the root.
    pub(crate) fn scan(&self, watcher: &Watcher) -> Result {
        let _guard = self.lock();
        brute_force::scan(watcher)
    }

    /// Materializes the current tree to disk.
    pub(crate) fn write_snapshot(&self, watcher: &Watcher, snapshot_path: &Path) -> Result {
        let _guard = self.lock();
        brute_force::write_snapshot(watcher, snapshot_path)
    }

    /// Logs the events that reconcile a snapshot with the current tree.
    pub(crate) fn get_events_since(&self, watcher: &Watcher, snapshot_path: &Path) -> Result {
        let _guard = self.lock();
        brute_force::get_events_since(watcher, snapshot_path)
    }

    /// Applies an externally observed change to the cached tree.
    pub(crate) fn update_snapshot(
        &self,
        watcher: &Watcher,
        delta: &DirEntry,
        change: EventType,
    ) -> Result {
        let _guard = self.lock();
        brute_force::update_snapshot(watcher, delta, change)
    }

    /// Locks the backend state, ignoring poisoning.
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl Drop for InotifyBackend {
    /// Shuts the watcher thread down and blocks until it has exited.
    fn drop(&mut self) {
        let _ = unistd::write(&self.pipe, b"x");
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ----------------------------------------------------------------------------

impl fmt::Debug for InotifyBackend {
    /// Formats the backend for debugging.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InotifyBackend")
            .field("subscriptions", &self.lock().subscriptions.len())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Returns the watch mask for directories.
///
/// `ONLYDIR` and `DONT_FOLLOW` keep watches off files and symbolic link
/// targets, and `EXCL_UNLINK` stops events for already unlinked children.
fn watch_mask() -> WatchMask {
    WatchMask::ATTRIB
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MODIFY
        | WatchMask::MOVE_SELF
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::DONT_FOLLOW
        | WatchMask::ONLYDIR
        | WatchMask::EXCL_UNLINK
}

/// Installs a watch on a directory for the given watcher.
fn watch_dir(
    shared: &mut Shared,
    watcher: &Arc<Watcher>,
    tree: &Arc<DirTree>,
    path: &Path,
) -> io::Result<()> {
    let wd = shared.watches.add(path, watch_mask())?;
    shared.subscriptions.entry(wd).or_default().push(Subscription {
        tree: Arc::clone(tree),
        path: path.to_path_buf(),
        watcher: Arc::clone(watcher),
    });
    Ok(())
}

/// Detaches a watcher from all of its subscriptions.
///
/// Watch descriptors that no longer serve any watcher are removed from the
/// kernel. Removal can fail when the kernel already dropped the watch on
/// its own, which is reported but does not stop the detachment.
fn unsubscribe(shared: &mut Shared, watcher: &Arc<Watcher>) -> Result {
    let Shared { watches, subscriptions, .. } = shared;

    let mut failed = None;
    subscriptions.retain(|wd, subs| {
        let before = subs.len();
        subs.retain(|sub| !Arc::ptr_eq(&sub.watcher, watcher));
        if subs.is_empty() && before > 0 {
            if let Err(error) = watches.remove(wd.clone()) {
                failed.get_or_insert(error);
            }
            false
        } else {
            !subs.is_empty()
        }
    });

    match failed {
        Some(error) => Err(Error::watcher(
            watcher.dir(),
            format!("unable to remove watch: {error}"),
        )),
        None => Ok(()),
    }
}

/// Runs the watcher thread.
///
/// Polls the inotify descriptor together with the shutdown pipe. Errors on
/// the kernel channel complete every live watcher's callback with a watcher
/// error and terminate the thread - no recovery is attempted here.
fn run(mut inotify: Inotify, pipe: &OwnedFd, shared: &Arc<Mutex<Shared>>) {
    let mut buffer = Buffer([0; 8192]);

    loop {
        let (shutdown, ready) = {
            let mut fds = [
                PollFd::new(pipe.as_fd(), PollFlags::POLLIN),
                PollFd::new(inotify.as_fd(), PollFlags::POLLIN),
            ];

            match poll(&mut fds, PollTimeout::from(POLL_INTERVAL)) {
                Ok(_) => (signalled(&fds[0]), signalled(&fds[1])),
                Err(Errno::EINTR) => (false, false),
                Err(errno) => {
                    fail(shared, &io::Error::from(errno));
                    return;
                }
            }
        };

        if shutdown {
            break;
        }
        if ready {
            if let Err(error) = drain(&mut inotify, &mut buffer.0, shared) {
                fail(shared, &error);
                return;
            }
        }
    }
}

/// Checks whether a polled descriptor signalled readiness.
fn signalled(fd: &PollFd) -> bool {
    fd.revents().is_some_and(|revents| !revents.is_empty())
}

/// Drains the kernel queue and notifies every touched watcher once.
fn drain(inotify: &mut Inotify, buffer: &mut [u8], shared: &Arc<Mutex<Shared>>) -> io::Result<()> {
    let mut touched: Vec<Arc<Watcher>> = Vec::new();

    loop {
        let events = match inotify.read_events(buffer) {
            Ok(events) => events,
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
            Err(error) => return Err(error),
        };

        let now = Instant::now();
        for event in events {
            if event.mask.contains(EventMask::Q_OVERFLOW) {
                // The kernel dropped notifications. Consumers that need
                // certainty can rescan; see the scan operation.
                debug!("inotify queue overflowed, notifications lost");
                continue;
            }
            handle_event(shared, &event, now, &mut touched);
        }
    }

    // Expire source halves of moves whose destination never showed up,
    // i.e. files that were moved outside of all watched roots
    {
        let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
        let before = shared.pending_moves.len();
        shared.pending_moves.retain(|_, pending| pending.at.elapsed() < MOVE_TIMEOUT);
        if shared.pending_moves.len() < before {
            trace!("expired {} pending moves", before - shared.pending_moves.len());
        }
    }

    for watcher in touched {
        watcher.notify();
    }
    Ok(())
}

/// Handles one kernel record for every subscription on its descriptor.
fn handle_event(
    shared: &Arc<Mutex<Shared>>,
    event: &inotify::Event<&OsStr>,
    now: Instant,
    touched: &mut Vec<Arc<Watcher>>,
) {
    let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);

    let Some(subscriptions) = shared.subscriptions.get(&event.wd).cloned() else {
        return;
    };

    for subscription in &subscriptions {
        if handle_subscription(&mut shared, subscription, event, now) {
            let watcher = &subscription.watcher;
            if !touched.iter().any(|known| Arc::ptr_eq(known, watcher)) {
                touched.push(Arc::clone(watcher));
            }
        }
    }
}

/// Handles one kernel record for one subscription.
///
/// Returns whether the subscription's watcher was touched and should be
/// notified at the end of the drain.
fn handle_subscription(
    shared: &mut Shared,
    subscription: &Subscription,
    event: &inotify::Event<&OsStr>,
    now: Instant,
) -> bool {
    let watcher = &subscription.watcher;
    let tree = &subscription.tree;

    let mut path = subscription.path.clone();
    if let Some(name) = event.name {
        path.push(name);
    }
    let hint_dir = event.mask.contains(EventMask::ISDIR);

    // Ignored paths are dropped at the earliest point, before they can
    // reach the tree or the event log
    if watcher.is_ignored(&path) {
        return false;
    }

    if event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
        // lstat, as symbolic links are recorded as themselves - we could
        // not watch their targets anyway
        let metadata = fs::symlink_metadata(&path).ok();
        let ino = metadata.as_ref().and_then(brute_force::inode);
        let mtime = metadata.as_ref().map_or(0, brute_force::mtime_nanos);
        let is_dir = metadata.as_ref().map_or(hint_dir, |metadata| metadata.is_dir());

        let entry = tree.add(&path, ino, mtime, is_dir, None);

        // A matching pending move makes this the destination half of a
        // move pair. The log still records a creation - pairing exists
        // only to keep subscription paths of moved directories current.
        if let Some(pending) = shared.pending_moves.remove(&event.cookie) {
            if entry.is_dir {
                for subs in shared.subscriptions.values_mut() {
                    for sub in subs.iter_mut() {
                        if sub.path == pending.path {
                            sub.path = path.clone();
                        } else if let Ok(tail) = sub.path.strip_prefix(&pending.path) {
                            sub.path = path.join(tail);
                        }
                    }
                }
            }
        }

        watcher.events().create(&path, is_dir, ino, None);

        if entry.is_dir {
            if let Err(error) = watch_dir(shared, watcher, tree, &path) {
                // The directory may already be gone again
                trace!("unable to watch '{}': {error}", path.display());
                tree.remove(&path);
                return false;
            }
        }
        true
    } else if event.mask.intersects(EventMask::MODIFY | EventMask::ATTRIB) {
        let metadata = fs::metadata(&path).ok();
        let ino = metadata.as_ref().and_then(brute_force::inode);

        watcher.events().update(&path, ino, None);
        if let Some(metadata) = metadata {
            tree.update(&path, ino, brute_force::mtime_nanos(&metadata), None);
        }
        true
    } else if event.mask.intersects(
        EventMask::DELETE | EventMask::DELETE_SELF | EventMask::MOVED_FROM | EventMask::MOVE_SELF,
    ) {
        let is_self = event
            .mask
            .intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF);

        // Self events for anything but the watch root are covered by the
        // parent directory's own notification
        if is_self && path != watcher.dir() {
            return false;
        }

        if event.mask.contains(EventMask::MOVED_FROM) {
            shared
                .pending_moves
                .insert(event.cookie, PendingMove { at: now, path: path.clone() });
        }

        // A vanished directory takes its subscriptions with it. Self
        // events never carry the directory hint, hence the extra check.
        if is_self || hint_dir {
            for subs in shared.subscriptions.values_mut() {
                subs.retain(|sub| sub.path != path);
            }
            shared.subscriptions.retain(|_, subs| !subs.is_empty());
        }

        let entry = tree.find(&path);
        let ino = entry.as_ref().and_then(|entry| entry.ino);
        let file_id = entry.as_ref().and_then(|entry| entry.file_id.clone());

        watcher
            .events()
            .remove(&path, is_self || hint_dir, ino, file_id.as_deref());
        tree.remove(&path);
        true
    } else {
        // Unknown or administrative flags are transient and dropped
        trace!("dropping inotify record {:?} for '{}'", event.mask, path.display());
        false
    }
}

/// Completes every live watcher's callback with a watcher error.
///
/// Called when the kernel channel is lost. The thread terminates right
/// after, so the subscriptions can never recover - consumers have to
/// resubscribe.
fn fail(shared: &Arc<Mutex<Shared>>, error: &io::Error) {
    warn!("inotify channel lost: {error}");

    let watchers: Vec<Arc<Watcher>> = {
        let shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared
            .subscriptions
            .values()
            .flatten()
            .map(|sub| Arc::clone(&sub.watcher))
            .collect()
    };

    // Delivery happens outside the lock, as a consumer may well call back
    // into the engine when it learns that its subscription died
    for watcher in watchers {
        watcher.notify_error(Error::watcher(
            watcher.dir(),
            format!("kernel channel lost: {error}"),
        ));
    }
}
