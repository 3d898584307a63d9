//! Filesystem watching for the coordinator's readiness loop.
//!
//! Watches are attached to the directory of each registered path so
//! replace-and-rename editor patterns are caught. Change events are
//! coalesced behind a self-pipe: the read end turning readable means
//! "at least one relevant change occurred", and draining the batch
//! clears the signal.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cadence of the stat-polling fallback.
const POLL_CADENCE: Duration = Duration::from_millis(500);

/// Editor droppings that must not trigger a test cycle.
fn is_interesting(filename: &str) -> bool {
    !(filename.starts_with('.') || filename.starts_with(".#") || filename.ends_with('~'))
}

fn interesting_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(is_interesting)
        .unwrap_or(false)
}

pub struct FsWatcher {
    watcher: Box<dyn Watcher>,
    rx: Receiver<notify::Result<Event>>,
    signal_r: File,
    /// Directory → number of registered paths inside it.
    dirs: HashMap<PathBuf, usize>,
    paths: HashSet<PathBuf>,
}

impl FsWatcher {
    pub fn new() -> Result<Self> {
        let (tx, rx) = unbounded();
        let (signal_r, signal_w) = nix::unistd::pipe().context("signal pipe failed")?;
        for fd in [&signal_r, &signal_w] {
            unsafe {
                let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
                libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        let signal_r = File::from(signal_r);
        let signal_w = File::from(signal_w);

        let watcher: Box<dyn Watcher> =
            match RecommendedWatcher::new(handler(tx.clone(), signal_w.try_clone()?), Config::default()) {
                Ok(w) => Box::new(w),
                Err(e) => {
                    eprintln!("[watch] OS notification unavailable ({e}); polling every 500ms");
                    let poll = PollWatcher::new(
                        handler(tx, signal_w),
                        Config::default().with_poll_interval(POLL_CADENCE),
                    )
                    .context("poll watcher failed")?;
                    Box::new(poll)
                }
            };

        Ok(Self {
            watcher,
            rx,
            signal_r,
            dirs: HashMap::new(),
            paths: HashSet::new(),
        })
    }

    /// Watch the directory of every given file path. Paths already
    /// registered are no-ops.
    pub fn add_paths<I>(&mut self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        for path in paths {
            if !self.paths.insert(path.clone()) {
                continue;
            }
            let dir = match path.parent() {
                Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let count = self.dirs.entry(dir.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                if let Err(e) = self.watcher.watch(&dir, RecursiveMode::NonRecursive) {
                    eprintln!("[watch] cannot watch {}: {e}", dir.display());
                }
            }
        }
    }

    /// Forget file paths; the last registered path of a directory
    /// releases the directory watch.
    pub fn remove_paths<I>(&mut self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        for path in paths {
            if !self.paths.remove(&path) {
                continue;
            }
            let dir = match path.parent() {
                Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
                _ => PathBuf::from("."),
            };
            if let Some(count) = self.dirs.get_mut(&dir) {
                *count -= 1;
                if *count == 0 {
                    self.dirs.remove(&dir);
                    let _ = self.watcher.unwatch(&dir);
                }
            }
        }
    }

    pub fn watches(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    /// Collect the batch of changed paths accumulated since the last
    /// drain, clearing the readiness signal. Noise is filtered here.
    pub fn drain(&mut self) -> Vec<PathBuf> {
        let mut junk = [0u8; 256];
        while matches!(self.signal_r.read(&mut junk), Ok(n) if n > 0) {}

        let mut changed = Vec::new();
        while let Ok(result) = self.rx.try_recv() {
            let event = match result {
                Ok(event) => event,
                Err(_) => continue,
            };
            if matches!(event.kind, EventKind::Access(_)) {
                continue;
            }
            for path in event.paths {
                if interesting_path(&path) {
                    changed.push(path);
                }
            }
        }
        changed.sort();
        changed.dedup();
        changed
    }
}

impl AsFd for FsWatcher {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.signal_r.as_fd()
    }
}

fn handler(
    tx: Sender<notify::Result<Event>>,
    mut signal_w: File,
) -> impl FnMut(notify::Result<Event>) + Send + 'static {
    move |result| {
        let _ = tx.send(result);
        // A full pipe already means the signal is pending.
        let _ = signal_w.write(&[1u8]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn editor_noise_is_filtered() {
        assert!(!is_interesting("mod.py~"));
        assert!(!is_interesting(".#mod.py"));
        assert!(!is_interesting(".mod.py.swp"));
        assert!(is_interesting("mod.py"));
        assert!(is_interesting("conf.py"));
    }

    #[test]
    fn duplicate_registration_is_a_noop() {
        let mut watcher = FsWatcher::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.py");
        std::fs::write(&path, "x = 1\n").unwrap();
        watcher.add_paths([path.clone(), path.clone()]);
        watcher.add_paths([path.clone()]);
        assert_eq!(watcher.dirs.get(dir.path()), Some(&1));
        assert!(watcher.watches(&path));
    }

    #[test]
    fn last_removal_releases_the_directory_watch() {
        let mut watcher = FsWatcher::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let one = dir.path().join("one.py");
        let two = dir.path().join("two.py");
        std::fs::write(&one, "").unwrap();
        std::fs::write(&two, "").unwrap();
        watcher.add_paths([one.clone(), two.clone()]);
        assert_eq!(watcher.dirs.get(dir.path()), Some(&2));
        watcher.remove_paths([one]);
        assert_eq!(watcher.dirs.get(dir.path()), Some(&1));
        watcher.remove_paths([two]);
        assert!(watcher.dirs.get(dir.path()).is_none());
    }

    #[test]
    fn drain_on_quiet_watcher_is_empty() {
        let mut watcher = FsWatcher::new().unwrap();
        assert!(watcher.drain().is_empty());
    }
}
