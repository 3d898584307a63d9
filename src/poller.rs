//! Thin adapter over epoll that hands back caller-chosen tokens
//! instead of raw file descriptors. Interrupted waits are retried.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::collections::HashMap;
use std::hash::Hash;
use std::os::fd::{AsFd, AsRawFd};

pub struct Poller<T> {
    epoll: Epoll,
    tokens: HashMap<u64, T>,
}

impl<T: Copy + Eq + Hash> Poller<T> {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("epoll_create failed")?;
        Ok(Self {
            epoll,
            tokens: HashMap::new(),
        })
    }

    /// Watch `source` for readability. Registering an object twice
    /// merely rebinds its token.
    pub fn register<F: AsFd>(&mut self, source: &F, token: T) -> Result<()> {
        let fd = source.as_fd().as_raw_fd() as u64;
        let mut event = EpollEvent::new(EpollFlags::EPOLLIN, fd);
        if self.tokens.insert(fd, token).is_some() {
            self.epoll
                .modify(source.as_fd(), &mut event)
                .context("epoll_ctl MOD failed")?;
        } else {
            self.epoll
                .add(source.as_fd(), event)
                .context("epoll_ctl ADD failed")?;
        }
        Ok(())
    }

    /// Stop watching `source`. Unregistering an unknown object is a
    /// programming error.
    pub fn unregister<F: AsFd>(&mut self, source: &F) -> Result<()> {
        let fd = source.as_fd().as_raw_fd() as u64;
        if self.tokens.remove(&fd).is_none() {
            panic!("poller: unregistering fd {fd} that was never registered");
        }
        self.epoll
            .delete(source.as_fd())
            .context("epoll_ctl DEL failed")?;
        Ok(())
    }

    /// Block until at least one registered object is readable,
    /// yielding `(token, flags)` pairs. A `None` timeout blocks
    /// indefinitely; signal interruptions are transparently retried.
    pub fn wait(&mut self, timeout_ms: Option<u16>) -> Result<Vec<(T, EpollFlags)>> {
        let timeout = match timeout_ms {
            Some(ms) => EpollTimeout::from(ms),
            None => EpollTimeout::NONE,
        };
        let mut events = [EpollEvent::empty(); 32];
        loop {
            match self.epoll.wait(&mut events, timeout) {
                Ok(n) => {
                    let ready = events[..n]
                        .iter()
                        .filter_map(|ev| {
                            self.tokens.get(&ev.data()).map(|t| (*t, ev.events()))
                        })
                        .collect();
                    return Ok(ready);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("epoll_wait failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::OwnedFd;

    fn pipe_pair() -> (OwnedFd, File) {
        let (r, w) = nix::unistd::pipe().unwrap();
        (r, File::from(w))
    }

    #[test]
    fn readable_pipe_yields_its_token() {
        let (r, mut w) = pipe_pair();
        let mut poller: Poller<u32> = Poller::new().unwrap();
        poller.register(&r, 7).unwrap();
        w.write_all(b"x").unwrap();
        let ready = poller.wait(Some(1000)).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, 7);
        assert!(ready[0].1.contains(EpollFlags::EPOLLIN));
    }

    #[test]
    fn register_is_idempotent() {
        let (r, mut w) = pipe_pair();
        let mut poller: Poller<u32> = Poller::new().unwrap();
        poller.register(&r, 1).unwrap();
        poller.register(&r, 2).unwrap();
        w.write_all(b"x").unwrap();
        let ready = poller.wait(Some(1000)).unwrap();
        assert_eq!(ready, vec![(2, EpollFlags::EPOLLIN)]);
    }

    #[test]
    fn timeout_returns_empty_batch() {
        let (r, _w) = pipe_pair();
        let mut poller: Poller<u32> = Poller::new().unwrap();
        poller.register(&r, 1).unwrap();
        let ready = poller.wait(Some(10)).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    #[should_panic(expected = "never registered")]
    fn unregistering_unknown_fd_panics() {
        let (r, _w) = pipe_pair();
        let mut poller: Poller<u32> = Poller::new().unwrap();
        let _ = poller.unregister(&r);
    }

    #[test]
    fn unregistered_fd_stops_reporting() {
        let (r, mut w) = pipe_pair();
        let (r2, mut w2) = pipe_pair();
        let mut poller: Poller<u32> = Poller::new().unwrap();
        poller.register(&r, 1).unwrap();
        poller.register(&r2, 2).unwrap();
        poller.unregister(&r).unwrap();
        w.write_all(b"x").unwrap();
        w2.write_all(b"y").unwrap();
        let ready = poller.wait(Some(1000)).unwrap();
        assert_eq!(ready, vec![(2, EpollFlags::EPOLLIN)]);
    }
}
