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

//! Scan and snapshot integration tests, running on every platform.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use vigil::{Backend, DirEntry, DirTree, Error, EventType, Kind, Options};

/// Forces the portable backend, which every platform must support.
fn options() -> Options {
    Options::new().backend(Backend::BruteForce)
}

/// Creates a scratch root, resolved the same way the engine resolves it.
fn scratch() -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let root = temp.path().canonicalize().unwrap();
    (temp, root)
}

#[test]
fn scan_reports_every_entry_except_the_root() {
    let (_temp, root) = scratch();
    fs::write(root.join("doc"), b"one").unwrap();
    fs::create_dir(root.join("sub")).unwrap();
    fs::write(root.join("sub/nested"), b"two").unwrap();

    let mut events = vigil::scan(&root, options()).unwrap();
    events.sort_by(|a, b| a.path().cmp(b.path()));

    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|event| event.event_type() == EventType::Create));
    assert!(events.iter().all(|event| event.path() != root));

    assert_eq!(events[0].path(), root.join("doc"));
    assert_eq!(events[0].kind(), Kind::File);
    assert_eq!(events[1].path(), root.join("sub"));
    assert_eq!(events[1].kind(), Kind::Directory);
    assert_eq!(events[2].path(), root.join("sub/nested"));
}

#[test]
fn scan_skips_ignored_subtrees() {
    let (_temp, root) = scratch();
    fs::write(root.join("doc"), b"one").unwrap();
    fs::create_dir(root.join("skip")).unwrap();
    fs::write(root.join("skip/nested"), b"two").unwrap();

    let events =
        vigil::scan(&root, options().ignore([root.join("skip")])).unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path(), root.join("doc"));
}

#[test]
fn snapshot_roundtrip_yields_no_events() {
    let (_temp, root) = scratch();
    fs::write(root.join("doc"), b"one").unwrap();
    fs::create_dir(root.join("sub")).unwrap();
    fs::write(root.join("sub/nested"), b"two").unwrap();

    let snapshot = root.join("snapshot.txt");
    vigil::write_snapshot(&root, &snapshot, options().ignore([snapshot.clone()])).unwrap();

    let events =
        vigil::get_events_since(&root, &snapshot, options().ignore([snapshot.clone()])).unwrap();
    assert!(events.is_empty(), "unexpected events: {events:?}");
}

#[test]
fn snapshot_detects_offline_rename() {
    let (_temp, root) = scratch();
    let outside = TempDir::new().unwrap();
    let snapshot = outside.path().join("snapshot.txt");

    fs::write(root.join("before"), b"doc").unwrap();
    vigil::write_snapshot(&root, &snapshot, options()).unwrap();

    fs::rename(root.join("before"), root.join("after")).unwrap();

    let events = vigil::get_events_since(&root, &snapshot, options()).unwrap();
    assert_eq!(events.len(), 1, "unexpected events: {events:?}");
    assert_eq!(events[0].event_type(), EventType::Rename);
    assert_eq!(events[0].path(), root.join("after"));
    assert_eq!(events[0].old_path(), Some(root.join("before").as_path()));
}

#[test]
fn snapshot_detects_create_update_and_delete() {
    let (_temp, root) = scratch();
    let outside = TempDir::new().unwrap();
    let snapshot = outside.path().join("snapshot.txt");

    fs::write(root.join("changed"), b"one").unwrap();
    fs::write(root.join("removed"), b"two").unwrap();
    vigil::write_snapshot(&root, &snapshot, options()).unwrap();

    // Let the modification time move past the snapshot resolution, and
    // create the new file before removing the old one, so the freed inode
    // cannot be reused and read as a rename
    thread::sleep(Duration::from_millis(50));
    fs::write(root.join("changed"), b"three").unwrap();
    fs::write(root.join("added"), b"four").unwrap();
    fs::remove_file(root.join("removed")).unwrap();

    let events = vigil::get_events_since(&root, &snapshot, options()).unwrap();
    assert_eq!(events.len(), 3, "unexpected events: {events:?}");

    for event in &events {
        let expected = match event.path().strip_prefix(&root).unwrap().to_str() {
            Some("changed") => EventType::Update,
            Some("added") => EventType::Create,
            Some("removed") => EventType::Delete,
            _ => panic!("unexpected event: {event:?}"),
        };
        assert_eq!(event.event_type(), expected);
    }
}

#[test]
fn snapshot_renamed_directory_carries_descendants() {
    let (_temp, root) = scratch();
    let outside = TempDir::new().unwrap();
    let snapshot = outside.path().join("snapshot.txt");

    fs::create_dir(root.join("old")).unwrap();
    fs::write(root.join("old/doc"), b"one").unwrap();
    fs::create_dir(root.join("old/sub")).unwrap();
    fs::write(root.join("old/sub/deep"), b"two").unwrap();
    vigil::write_snapshot(&root, &snapshot, options()).unwrap();

    fs::rename(root.join("old"), root.join("new")).unwrap();

    let events = vigil::get_events_since(&root, &snapshot, options()).unwrap();
    assert_eq!(events.len(), 1, "unexpected events: {events:?}");
    assert_eq!(events[0].event_type(), EventType::Rename);
    assert_eq!(events[0].path(), root.join("new"));
    assert_eq!(events[0].old_path(), Some(root.join("old").as_path()));
}

#[test]
fn snapshot_read_errors_surface() {
    let (_temp, root) = scratch();
    let result = vigil::get_events_since(&root, root.join("absent.txt"), options());
    assert!(matches!(result, Err(Error::Io(_))));
}

#[test]
fn subscriptions_are_unsupported_on_brute_force() {
    let (_temp, root) = scratch();
    let result = vigil::subscribe(&root, |_batch| {}, options());
    assert!(matches!(result, Err(Error::Watcher(_))));
}

#[test]
fn subscribing_to_a_missing_root_fails() {
    let (_temp, root) = scratch();
    let result = vigil::subscribe(root.join("absent"), |_batch| {}, options());
    assert!(matches!(result, Err(Error::Watcher(_))));
}

#[test]
fn update_snapshot_applies_to_the_live_tree() {
    let (_temp, root) = scratch();

    // Hold the tree the way a live subscription would, so the applied
    // changes have somewhere to land
    let tree = DirTree::get_cached(&root, true);

    let delta = DirEntry::new(root.join("ghost"), Some(9), 1, false, None);
    vigil::update_snapshot(&root, &delta, EventType::Create, options()).unwrap();
    assert!(tree.find(&root.join("ghost")).is_some());

    let delta = DirEntry::new(root.join("ghost"), Some(9), 2, false, None);
    vigil::update_snapshot(&root, &delta, EventType::Update, options()).unwrap();
    assert_eq!(tree.find(&root.join("ghost")).unwrap().mtime, 2);

    vigil::update_snapshot(&root, &delta, EventType::Delete, options()).unwrap();
    assert!(tree.find(&root.join("ghost")).is_none());
}
