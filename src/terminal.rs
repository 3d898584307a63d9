//! Terminal control: keystrokes, not whole lines.
//!
//! Echo and canonical line interpretation go off, reads become
//! single-character and non-blocking so queued keystrokes stay
//! visible to the readiness loop, and the prior mode is restored on
//! every exit path through Drop.

use anyhow::{Context, Result};
use nix::sys::termios::{
    tcgetattr, tcsetattr, LocalFlags, SetArg, SpecialCharacterIndices, Termios,
};
use std::io;

pub struct TerminalGuard {
    interactive: bool,
    saved_termios: Option<Termios>,
    saved_flags: libc::c_int,
}

impl TerminalGuard {
    /// Acquire the terminal if `enable` is set and stdin/stdout are
    /// both ttys; otherwise the guard is inert.
    pub fn new(enable: bool) -> Result<Self> {
        let interactive =
            enable && unsafe { libc::isatty(0) == 1 } && unsafe { libc::isatty(1) == 1 };
        if !interactive {
            return Ok(Self {
                interactive: false,
                saved_termios: None,
                saved_flags: 0,
            });
        }

        let stdin = io::stdin();
        let saved = tcgetattr(&stdin).context("tcgetattr on stdin failed")?;

        let saved_flags = unsafe { libc::fcntl(0, libc::F_GETFL) };
        unsafe { libc::fcntl(0, libc::F_SETFL, saved_flags | libc::O_NONBLOCK) };

        let mut mode = saved.clone();
        // Ctrl-C arrives as byte 0x03 and quits through the normal path.
        mode.local_flags &= !(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG);
        mode.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        mode.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        tcsetattr(&stdin, SetArg::TCSAFLUSH, &mode).context("tcsetattr on stdin failed")?;

        Ok(Self {
            interactive: true,
            saved_termios: Some(saved),
            saved_flags,
        })
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Read whatever keystrokes are already queued, without blocking.
    pub fn read_keys(&self) -> Vec<u8> {
        if !self.interactive {
            return Vec::new();
        }
        let mut keys = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
            keys.extend_from_slice(&buf[..n as usize]);
        }
        keys
    }

    /// Throw away any bytes already queued in the OS input buffer.
    pub fn drain_input(&self) {
        let _ = self.read_keys();
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if !self.interactive {
            return;
        }
        unsafe { libc::fcntl(0, libc::F_SETFL, self.saved_flags) };
        if let Some(ref saved) = self.saved_termios {
            let _ = tcsetattr(&io::stdin(), SetArg::TCSAFLUSH, saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_is_inert_without_a_tty() {
        // The test harness runs without a controlling terminal on
        // stdin, so acquisition must quietly do nothing.
        let guard = TerminalGuard::new(true).unwrap();
        if !guard.interactive {
            assert!(guard.read_keys().is_empty());
        }
    }

    #[test]
    fn disabled_guard_never_touches_the_tty() {
        let guard = TerminalGuard::new(false).unwrap();
        assert!(!guard.is_interactive());
        guard.drain_input();
    }
}
