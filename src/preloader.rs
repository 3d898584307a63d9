//! The process side of a Worker: a command loop run by whichever
//! process currently sits on top of the fork stack.
//!
//! On `Fork` the serving process forks; the child answers with its
//! pid and takes over the conversation while the parent blocks in
//! waitpid. When the child dies — EndOfStream sent or SIGKILL from
//! the coordinator — the parent reaps it, throws away any command
//! bytes the child never consumed, and writes one byte on the sync
//! pipe. That byte is the coordinator's licence to trust the pipes
//! again.

use crate::protocol::{encode_frame, Command, ImportEvent, Response, SYNC_BYTE};
use crate::runner;
use crate::runtime::Runtime;
use anyhow::{Context, Result};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, getpid, ForkResult};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::process;

/// Serve commands until the coordinator closes the command pipe.
/// Runs in the preloader process and, transitively, in every child
/// it forks.
pub fn serve(
    mut cmd_r: File,
    mut res_w: File,
    mut sync_w: File,
    mut runtime: Box<dyn Runtime>,
) -> Result<()> {
    loop {
        let command = match read_command(&mut cmd_r)? {
            Some(command) => command,
            None => return Ok(()), // coordinator hung up
        };
        match command {
            Command::Preload(names) => {
                let mut events = Vec::with_capacity(names.len());
                for name in &names {
                    let loaded = match runtime.import(name) {
                        Ok(delta) => delta,
                        // non-fatal: recorded as an empty loaded-set
                        Err(_) => BTreeSet::new(),
                    };
                    events.push(ImportEvent {
                        requested: name.clone(),
                        loaded,
                    });
                }
                let paths = runtime.module_paths();
                write_frame(&mut res_w, &Response::Preloaded { events, paths })?;
            }
            Command::Fork => match unsafe { fork() }.context("fork failed")? {
                ForkResult::Child => {
                    unsafe {
                        // the switch does not survive fork; re-arm it
                        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
                    }
                    write_frame(&mut res_w, &Response::Forked(getpid().as_raw()))?;
                    // fall through: this child now serves the loop
                }
                ForkResult::Parent { child } => {
                    let _ = waitpid(child, None);
                    // a killed child may have left an unread command behind
                    drain_pending(&cmd_r);
                    sync_w
                        .write_all(&[SYNC_BYTE])
                        .context("sync pipe write failed")?;
                }
            },
            Command::RunTests { module, verbose } => {
                runner::run_module(runtime.as_mut(), &module, verbose, &mut |record| {
                    write_frame(&mut res_w, &record)
                })?;
                write_frame(&mut res_w, &Response::Paths(runtime.module_paths()))?;
                write_frame(&mut res_w, &Response::EndOfStream)?;
                process::exit(0);
            }
        }
    }
}

/// Blocking read of one framed command. `None` on clean EOF at a
/// frame boundary.
fn read_command(cmd_r: &mut File) -> Result<Option<Command>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = cmd_r
            .read(&mut len_buf[filled..])
            .context("command pipe read failed")?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            anyhow::bail!("command pipe closed mid-frame");
        }
        filled += n;
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    cmd_r
        .read_exact(&mut payload)
        .context("command pipe closed mid-frame")?;
    Ok(Some(
        bincode::deserialize(&payload).context("undecodable command")?,
    ))
}

fn write_frame(res_w: &mut File, response: &Response) -> Result<()> {
    let frame = encode_frame(response).context("response encode failed")?;
    res_w
        .write_all(&frame)
        .context("result pipe write failed")?;
    Ok(())
}

/// Discard whatever is sitting unread in the command pipe.
fn drain_pending(cmd_r: &File) {
    let fd = cmd_r.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        let mut junk = [0u8; 4096];
        while libc::read(fd, junk.as_mut_ptr() as *mut libc::c_void, junk.len()) > 0 {}
        libc::fcntl(fd, libc::F_SETFL, flags);
    }
}
