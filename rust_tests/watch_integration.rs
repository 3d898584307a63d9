//! Integration tests for the filesystem watcher: directory-level
//! watches, coalescing, and the editor replace-and-rename pattern.

use assay::poller::Poller;
use assay::watch::FsWatcher;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Poll the watcher's readiness fd until a non-empty batch arrives.
fn drain_within(watcher: &mut FsWatcher, timeout: Duration) -> Vec<PathBuf> {
    let mut poller: Poller<u8> = Poller::new().unwrap();
    poller.register(watcher, 0).unwrap();
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Vec::new();
        }
        let ready = poller.wait(Some(remaining.as_millis().min(60_000) as u16)).unwrap();
        if ready.is_empty() {
            continue;
        }
        let changed = watcher.drain();
        if !changed.is_empty() {
            return changed;
        }
    }
}

#[test]
fn write_to_a_watched_path_signals_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mod.py");
    fs::write(&path, "x = 1\n").unwrap();

    let mut watcher = FsWatcher::new().unwrap();
    watcher.add_paths([path.clone()]);

    fs::write(&path, "x = 2\n").unwrap();
    let changed = drain_within(&mut watcher, Duration::from_secs(5));
    assert!(
        changed.iter().any(|p| p.ends_with("mod.py")),
        "expected mod.py in {changed:?}"
    );
}

#[test]
fn editor_rename_pattern_coalesces_to_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mod.py");
    fs::write(&path, "x = 1\n").unwrap();

    let mut watcher = FsWatcher::new().unwrap();
    watcher.add_paths([path.clone()]);

    // the classic editor pattern: write a backup, rename into place
    let scratch = dir.path().join("mod.py~");
    fs::write(&scratch, "x = 2\n").unwrap();
    fs::rename(&scratch, &path).unwrap();

    let changed = drain_within(&mut watcher, Duration::from_secs(5));
    // exactly one interesting path: the backup name was noise
    assert_eq!(changed.len(), 1, "got {changed:?}");
    assert!(changed[0].ends_with("mod.py"));
}

#[test]
fn sibling_files_in_a_watched_directory_are_reported() {
    // a new source file can shadow a dotted name, so the directory
    // watch must surface it even though it was never registered
    let dir = tempfile::tempdir().unwrap();
    let registered = dir.path().join("known.py");
    fs::write(&registered, "").unwrap();

    let mut watcher = FsWatcher::new().unwrap();
    watcher.add_paths([registered]);

    fs::write(dir.path().join("shadow.py"), "").unwrap();
    let changed = drain_within(&mut watcher, Duration::from_secs(5));
    assert!(changed.iter().any(|p| p.ends_with("shadow.py")));
}

#[test]
fn editor_noise_never_wakes_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let registered = dir.path().join("known.py");
    fs::write(&registered, "").unwrap();

    let mut watcher = FsWatcher::new().unwrap();
    watcher.add_paths([registered]);

    fs::write(dir.path().join(".#known.py"), "lock").unwrap();
    fs::write(dir.path().join("known.py~"), "backup").unwrap();
    fs::write(dir.path().join(".hidden.swp"), "swap").unwrap();

    let changed = drain_within(&mut watcher, Duration::from_millis(700));
    assert!(changed.is_empty(), "noise leaked through: {changed:?}");
}

#[test]
fn draining_clears_the_signal_until_the_next_change() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mod.py");
    fs::write(&path, "").unwrap();

    let mut watcher = FsWatcher::new().unwrap();
    watcher.add_paths([path.clone()]);

    fs::write(&path, "x = 1\n").unwrap();
    let first = drain_within(&mut watcher, Duration::from_secs(5));
    assert!(!first.is_empty());

    // level-triggered: quiet after the drain
    let second = drain_within(&mut watcher, Duration::from_millis(500));
    assert!(second.is_empty(), "stale signal: {second:?}");

    fs::write(&path, "x = 2\n").unwrap();
    let third = drain_within(&mut watcher, Duration::from_secs(5));
    assert!(!third.is_empty());
}
