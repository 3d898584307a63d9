//! Coordinator-side handle for one worker: a long-lived preloader
//! process plus the transient children forked on top of it.
//!
//! Three pipes connect the coordinator to whichever process is on
//! top of the stack: command (down), result (up, framed records) and
//! sync (up, one byte per reaped child). A child is cancelled with
//! SIGKILL only — user code may swallow anything catchable — and the
//! coordinator must not issue another command until the sync byte
//! proves the pipes carry no torn bytes.

use crate::preloader;
use crate::protocol::{
    encode_frame, Command, FrameDecoder, ImportEvent, ModuleName, Response, SYNC_BYTE,
};
use crate::runtime::RuntimeFactory;
use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, pipe, setpgid, ForkResult, Pid};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::process;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Dead,
}

/// What one readiness-triggered read produced.
pub enum Chunk {
    Records(Vec<Response>),
    /// EOF on the result pipe: the preloader itself is gone.
    PreloaderGone,
}

pub struct Worker {
    /// Position 0 is the preloader; higher positions are transient
    /// forked children, at most one of which is serving.
    pids: Vec<Pid>,
    cmd_w: File,
    res_r: File,
    sync_r: File,
    decoder: FrameDecoder,
    state: WorkerState,
    current: Option<ModuleName>,
}

impl Worker {
    /// Fork the preloader. The child builds its runtime from the
    /// factory and serves commands until the coordinator goes away.
    pub fn spawn(factory: &RuntimeFactory) -> Result<Self> {
        let (cmd_r, cmd_w) = pipe().context("command pipe failed")?;
        let (res_r, res_w) = pipe().context("result pipe failed")?;
        let (sync_r, sync_w) = pipe().context("sync pipe failed")?;
        // coordinator-side ends must not leak through a re-exec
        for fd in [&cmd_w, &res_r, &sync_r] {
            set_cloexec(fd);
        }

        match unsafe { fork() }.context("fork of preloader failed")? {
            ForkResult::Child => {
                drop(cmd_w);
                drop(res_r);
                drop(sync_r);
                unsafe {
                    // no orphan outlives the coordinator
                    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
                }
                // own process group: keyboard interrupts stay with
                // the coordinator
                let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
                let runtime = factory();
                let status = match preloader::serve(
                    File::from(cmd_r),
                    File::from(res_w),
                    File::from(sync_w),
                    runtime,
                ) {
                    Ok(()) => 0,
                    Err(e) => {
                        eprintln!("[worker] {e:#}");
                        1
                    }
                };
                process::exit(status);
            }
            ForkResult::Parent { child } => {
                drop(cmd_r);
                drop(res_w);
                drop(sync_w);
                Ok(Self {
                    pids: vec![child],
                    cmd_w: File::from(cmd_w),
                    res_r: File::from(res_r),
                    sync_r: File::from(sync_r),
                    decoder: FrameDecoder::new(),
                    state: WorkerState::Idle,
                    current: None,
                })
            }
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn current_module(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn pid_stack(&self) -> &[Pid] {
        &self.pids
    }

    pub fn result_fd(&self) -> &File {
        &self.res_r
    }

    pub fn sync_fd(&self) -> &File {
        &self.sync_r
    }

    fn send(&mut self, command: &Command) -> Result<()> {
        let frame = encode_frame(command).context("command encode failed")?;
        self.cmd_w
            .write_all(&frame)
            .context("command pipe write failed")?;
        Ok(())
    }

    /// Block until one complete record arrives.
    fn read_response_blocking(&mut self) -> Result<Response> {
        loop {
            if let Some(response) = self.decoder.next_response()? {
                return Ok(response);
            }
            let mut buf = [0u8; 4096];
            let n = self
                .res_r
                .read(&mut buf)
                .context("result pipe read failed")?;
            if n == 0 {
                self.state = WorkerState::Dead;
                bail!("preloader closed the result pipe");
            }
            self.decoder.feed(&buf[..n]);
        }
    }

    /// Push a new child on top of the stack.
    pub fn push(&mut self) -> Result<()> {
        self.send(&Command::Fork)?;
        match self.read_response_blocking()? {
            Response::Forked(pid) => {
                self.pids.push(Pid::from_raw(pid));
                Ok(())
            }
            other => bail!("expected Forked, got {other:?}"),
        }
    }

    /// Have the serving child import `order`, returning its trace.
    pub fn preload(
        &mut self,
        order: &[ModuleName],
    ) -> Result<(Vec<ImportEvent>, Vec<(ModuleName, PathBuf)>)> {
        self.send(&Command::Preload(order.to_vec()))?;
        match self.read_response_blocking()? {
            Response::Preloaded { events, paths } => Ok((events, paths)),
            other => bail!("expected Preloaded, got {other:?}"),
        }
    }

    /// Fork a test child and set it running `module`.
    pub fn dispatch(&mut self, module: &str, verbose: bool) -> Result<()> {
        debug_assert_eq!(self.state, WorkerState::Idle);
        self.push()?;
        self.send(&Command::RunTests {
            module: module.to_string(),
            verbose,
        })?;
        self.state = WorkerState::Running;
        self.current = Some(module.to_string());
        Ok(())
    }

    /// One readiness-triggered read of the result pipe, decoded into
    /// however many complete records arrived.
    pub fn read_chunk(&mut self) -> Result<Chunk> {
        let mut buf = [0u8; 4096];
        let n = self
            .res_r
            .read(&mut buf)
            .context("result pipe read failed")?;
        if n == 0 {
            self.state = WorkerState::Dead;
            return Ok(Chunk::PreloaderGone);
        }
        self.decoder.feed(&buf[..n]);
        let mut records = Vec::new();
        while let Some(response) = self.decoder.next_response()? {
            records.push(response);
        }
        Ok(Chunk::Records(records))
    }

    /// Called after EndOfStream: consume the death acknowledgement
    /// and return to Idle.
    pub fn finish_stream(&mut self) -> Result<()> {
        self.await_sync_byte()?;
        self.pids.pop();
        self.decoder.clear();
        self.state = WorkerState::Idle;
        self.current = None;
        Ok(())
    }

    /// Kill the serving child and resynchronise. Any bytes of a torn
    /// record are discarded; the worker comes back Idle.
    pub fn abort(&mut self) -> Result<()> {
        let pid = match self.pids.last() {
            Some(pid) if self.pids.len() > 1 => *pid,
            _ => bail!("abort with no child on the stack"),
        };
        let _ = kill(pid, Signal::SIGKILL);
        self.await_sync_byte()?;
        self.discard_result_bytes();
        self.pids.pop();
        self.state = WorkerState::Idle;
        self.current = None;
        Ok(())
    }

    /// Nonblocking probe of the sync pipe. `true` means a child died
    /// and was reaped while we thought it was still streaming.
    pub fn try_consume_sync(&mut self) -> bool {
        let fd = self.sync_r.as_raw_fd();
        let mut byte = [0u8; 1];
        let n = unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            let n = libc::read(fd, byte.as_mut_ptr() as *mut libc::c_void, 1);
            libc::fcntl(fd, libc::F_SETFL, flags);
            n
        };
        n == 1
    }

    /// After an unexpected death: decode what survived, drop the
    /// child from the stack and return to Idle. The caller decides
    /// whether the stream actually completed.
    pub fn recover(&mut self) -> Result<Vec<Response>> {
        let mut records = Vec::new();
        self.feed_available();
        while let Some(response) = self.decoder.next_response()? {
            records.push(response);
        }
        self.decoder.clear();
        self.pids.pop();
        self.state = WorkerState::Idle;
        self.current = None;
        Ok(records)
    }

    /// Kill everything on the stack, top first.
    pub fn close(&mut self) {
        while let Some(pid) = self.pids.pop() {
            let _ = kill(pid, Signal::SIGKILL);
        }
        self.state = WorkerState::Dead;
        self.current = None;
    }

    fn await_sync_byte(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        self.sync_r
            .read_exact(&mut byte)
            .context("sync pipe read failed")?;
        if byte[0] != SYNC_BYTE {
            bail!("unexpected byte {:#x} on sync pipe", byte[0]);
        }
        Ok(())
    }

    fn feed_available(&mut self) {
        let fd = self.res_r.as_raw_fd();
        let mut buf = [0u8; 4096];
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            loop {
                let n = libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
                if n <= 0 {
                    break;
                }
                self.decoder.feed(&buf[..n as usize]);
            }
            libc::fcntl(fd, libc::F_SETFL, flags);
        }
    }

    fn discard_result_bytes(&mut self) {
        self.feed_available();
        self.decoder.clear();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.state != WorkerState::Dead {
            self.close();
        }
    }
}

fn set_cloexec(fd: &OwnedFd) {
    unsafe {
        libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
    }
}
