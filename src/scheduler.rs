//! The coordinator: one single-threaded readiness loop multiplexing
//! workers, the filesystem watcher and the keyboard.
//!
//! Each cycle pushes a fresh child on every worker, preloads the
//! learned import order there, streams the work queue through the
//! pool, folds every loaded path into the watcher and the cycle
//! fingerprint, then pops the children so the preloaders stay
//! pristine. Between cycles the loop sleeps in the poller until a
//! relevant filesystem change invalidates the warm state.

use crate::discovery::{search, Target, SOURCE_EXTENSION};
use crate::imports::{improve_order, merge_discovered};
use crate::poller::Poller;
use crate::protocol::{FailKind, Failure, ImportEvent, ModuleName, Response};
use crate::reporter::{KeyAction, Reporter};
use crate::runtime::RuntimeFactory;
use crate::terminal::TerminalGuard;
use crate::watch::FsWatcher;
use crate::worker::{Chunk, Worker, WorkerState};
use anyhow::{bail, Result};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::PathBuf;

/// How a session ended; Restart asks main to re-exec the tool.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    Quit { failures: usize },
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Token {
    Stdin,
    Result(usize),
    Sync(usize),
    Watch,
}

pub struct Scheduler<'a> {
    factory: &'a RuntimeFactory,
    targets: Vec<Target>,
    terminal: &'a TerminalGuard,
    workers: Vec<Worker>,
    watcher: FsWatcher,
    poller: Poller<Token>,
    reporter: Reporter,
    import_order: Vec<ModuleName>,
    /// Paths loaded during the current cycle; decides which fs
    /// events invalidate the warm state.
    fingerprint: BTreeSet<PathBuf>,
    own_exe: Option<PathBuf>,
    batch: bool,
    verbose: bool,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        factory: &'a RuntimeFactory,
        targets: Vec<Target>,
        terminal: &'a TerminalGuard,
        batch: bool,
        verbose: bool,
    ) -> Result<Self> {
        let modules = discover_modules(&targets);
        let count = num_cpus::get().min(modules.len().max(1)).max(1);
        eprintln!("[scheduler] starting {count} workers");

        let mut workers = Vec::with_capacity(count);
        let mut poller = Poller::new()?;
        for i in 0..count {
            let worker = Worker::spawn(factory)?;
            poller.register(worker.result_fd(), Token::Result(i))?;
            poller.register(worker.sync_fd(), Token::Sync(i))?;
            workers.push(worker);
        }

        let mut watcher = FsWatcher::new()?;
        poller.register(&watcher, Token::Watch)?;
        if terminal.is_interactive() {
            poller.register(&std::io::stdin(), Token::Stdin)?;
            terminal.drain_input();
        }

        // a change to the tool's own executable restarts the session
        let own_exe = std::env::current_exe().ok();
        if let Some(exe) = &own_exe {
            watcher.add_paths([exe.clone()]);
        }

        Ok(Self {
            factory,
            targets,
            terminal,
            workers,
            watcher,
            poller,
            reporter: Reporter::to_stdout(batch),
            import_order: Vec::new(),
            fingerprint: BTreeSet::new(),
            own_exe,
            batch,
            verbose,
        })
    }

    pub fn run(&mut self) -> Result<SessionEnd> {
        loop {
            let modules = discover_modules(&self.targets);
            merge_discovered(&mut self.import_order, &modules);
            self.fingerprint.clear();

            // warm state: a fresh child per worker holds this
            // cycle's imports, so the preloaders never go stale
            let mut trace: Option<Vec<ImportEvent>> = None;
            for i in 0..self.workers.len() {
                if self.workers[i].pid_stack().len() == 1 {
                    self.workers[i].push()?;
                }
                let (events, paths) = self.workers[i].preload(&self.import_order)?;
                if trace.is_none() {
                    trace = Some(events);
                }
                self.absorb_paths(paths);
            }

            self.reporter.start_cycle();
            let mut queue: VecDeque<ModuleName> = modules.iter().cloned().collect();
            for i in 0..self.workers.len() {
                match queue.pop_front() {
                    Some(module) => self.workers[i].dispatch(&module, self.verbose)?,
                    None => break,
                }
            }

            let mut invalidated = false;
            while self
                .workers
                .iter()
                .any(|w| w.state() == WorkerState::Running)
            {
                for (token, _flags) in self.poller.wait(None)? {
                    match token {
                        Token::Result(i) => self.on_result_readable(i, &mut queue)?,
                        Token::Sync(i) => self.on_sync_readable(i, &mut queue)?,
                        Token::Stdin => match self.on_keys() {
                            Some(KeyAction::Quit) => {
                                return Ok(SessionEnd::Quit {
                                    failures: self.reporter.failure_count(),
                                })
                            }
                            Some(KeyAction::Restart) => return Ok(SessionEnd::Restart),
                            None => {}
                        },
                        Token::Watch => {
                            if self.on_watch(&mut invalidated)? {
                                return Ok(SessionEnd::Restart);
                            }
                        }
                    }
                }
            }

            self.reporter.summarize();

            // install the next cycle's import order before anything
            // else happens
            if let Some(events) = trace {
                self.import_order = improve_order(&events);
                merge_discovered(&mut self.import_order, &modules);
            }

            for worker in &mut self.workers {
                if worker.pid_stack().len() > 1 {
                    worker.abort()?;
                }
            }

            if self.batch {
                return Ok(SessionEnd::Quit {
                    failures: self.reporter.failure_count(),
                });
            }

            while !invalidated {
                for (token, _flags) in self.poller.wait(None)? {
                    match token {
                        Token::Watch => {
                            if self.on_watch(&mut invalidated)? {
                                return Ok(SessionEnd::Restart);
                            }
                        }
                        Token::Stdin => match self.on_keys() {
                            Some(KeyAction::Quit) => {
                                return Ok(SessionEnd::Quit {
                                    failures: self.reporter.failure_count(),
                                })
                            }
                            Some(KeyAction::Restart) => return Ok(SessionEnd::Restart),
                            None => {}
                        },
                        Token::Result(i) => {
                            // quiescent workers only speak when dying
                            if let Chunk::PreloaderGone = self.workers[i].read_chunk()? {
                                self.replace_worker(i, false)?;
                            }
                        }
                        Token::Sync(i) => {
                            let _ = self.workers[i].try_consume_sync();
                        }
                    }
                }
            }
        }
    }

    fn on_result_readable(&mut self, i: usize, queue: &mut VecDeque<ModuleName>) -> Result<()> {
        match self.workers[i].read_chunk()? {
            Chunk::PreloaderGone => {
                if let Some(module) = self.workers[i].current_module().map(str::to_string) {
                    queue.push_front(module);
                }
                self.replace_worker(i, true)?;
                self.dispatch_next(i, queue)?;
            }
            Chunk::Records(records) => {
                let mut finished = false;
                for record in records {
                    finished |= self.handle_record(record)?;
                }
                if finished {
                    self.workers[i].finish_stream()?;
                    self.dispatch_next(i, queue)?;
                }
            }
        }
        Ok(())
    }

    /// A sync byte while a stream is unfinished means the child was
    /// killed out from under us. Decode what survived before
    /// deciding: the natural-completion byte may simply have raced
    /// the EndOfStream record through the poller.
    fn on_sync_readable(&mut self, i: usize, queue: &mut VecDeque<ModuleName>) -> Result<()> {
        if self.workers[i].state() != WorkerState::Running {
            let _ = self.workers[i].try_consume_sync();
            return Ok(());
        }
        if !self.workers[i].try_consume_sync() {
            return Ok(());
        }
        let module = self.workers[i]
            .current_module()
            .unwrap_or("<unknown>")
            .to_string();
        let records = self.workers[i].recover()?;
        let mut finished = false;
        for record in records {
            finished |= self.handle_record(record)?;
        }
        if !finished {
            self.reporter.report_fail(crash_failure(&module));
        }
        self.dispatch_next(i, queue)?;
        Ok(())
    }

    /// Returns true when the record closed the stream.
    fn handle_record(&mut self, record: Response) -> Result<bool> {
        match record {
            Response::Pass => self.reporter.report_pass(),
            Response::PassNamed(name) => self.reporter.report_pass_named(&name),
            Response::Fail(failure) => self.reporter.report_fail(failure),
            Response::Paths(paths) => self.absorb_paths(paths),
            Response::EndOfStream => return Ok(true),
            other => bail!("unexpected record from worker: {other:?}"),
        }
        Ok(false)
    }

    fn dispatch_next(&mut self, i: usize, queue: &mut VecDeque<ModuleName>) -> Result<()> {
        if self.workers[i].state() == WorkerState::Idle {
            if let Some(module) = queue.pop_front() {
                self.workers[i].dispatch(&module, self.verbose)?;
            }
        }
        Ok(())
    }

    /// Returns true when the tool's own source changed.
    fn on_watch(&mut self, invalidated: &mut bool) -> Result<bool> {
        let changed = self.watcher.drain();
        if changed.is_empty() {
            return Ok(false);
        }
        if let Some(exe) = &self.own_exe {
            if changed.iter().any(|path| path == exe) {
                eprintln!("[scheduler] own executable changed; restarting");
                return Ok(true);
            }
        }
        if self.is_relevant(&changed) {
            *invalidated = true;
        }
        Ok(false)
    }

    /// Conservative invalidation: anything loaded last cycle, or a
    /// source file landing where loaded modules live (a potential
    /// dotted-name shadow).
    fn is_relevant(&self, changed: &[PathBuf]) -> bool {
        let dirs: HashSet<&std::path::Path> = self
            .fingerprint
            .iter()
            .filter_map(|p| p.parent())
            .collect();
        changed.iter().any(|path| {
            self.fingerprint.contains(path)
                || (path.extension().and_then(|e| e.to_str()) == Some(SOURCE_EXTENSION)
                    && path.parent().map(|d| dirs.contains(d)).unwrap_or(false))
        })
    }

    fn absorb_paths(&mut self, paths: Vec<(ModuleName, PathBuf)>) {
        let paths: Vec<PathBuf> = paths.into_iter().map(|(_, path)| path).collect();
        self.fingerprint.extend(paths.iter().cloned());
        self.watcher.add_paths(paths);
    }

    fn on_keys(&mut self) -> Option<KeyAction> {
        for byte in self.terminal.read_keys() {
            if let Some(action) = self.reporter.process_keystroke(byte) {
                return Some(action);
            }
        }
        None
    }

    /// A dead preloader (taxonomy: the long-lived process died) is
    /// replaced wholesale and, mid-cycle, re-warmed.
    fn replace_worker(&mut self, i: usize, warm: bool) -> Result<()> {
        eprintln!("[scheduler] preloader of worker {i} died; spawning a replacement");
        self.poller.unregister(self.workers[i].result_fd())?;
        self.poller.unregister(self.workers[i].sync_fd())?;
        self.workers[i].close();

        let mut replacement = Worker::spawn(self.factory)?;
        if warm {
            replacement.push()?;
            let (_events, paths) = replacement.preload(&self.import_order)?;
            self.absorb_paths(paths);
        }
        self.poller.register(replacement.result_fd(), Token::Result(i))?;
        self.poller.register(replacement.sync_fd(), Token::Sync(i))?;
        self.workers[i] = replacement;
        Ok(())
    }
}

/// Expand every command-line target, first occurrence winning.
pub fn discover_modules(targets: &[Target]) -> Vec<ModuleName> {
    let mut seen = HashSet::new();
    let mut modules = Vec::new();
    for target in targets {
        for module in search(target) {
            if seen.insert(module.clone()) {
                modules.push(module);
            }
        }
    }
    modules
}

fn crash_failure(module: &str) -> Failure {
    Failure {
        kind: FailKind::Exception,
        name: "WorkerCrash".to_string(),
        message: format!("worker child died while running {module:?} without finishing its stream"),
        frames: Vec::new(),
        stdout: String::new(),
        stderr: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_modules_deduplicates_across_targets() {
        let targets = vec![
            Target {
                root: None,
                name: "alpha".to_string(),
            },
            Target {
                root: None,
                name: "beta".to_string(),
            },
            Target {
                root: None,
                name: "alpha".to_string(),
            },
        ];
        assert_eq!(discover_modules(&targets), ["alpha", "beta"]);
    }

    #[test]
    fn crash_failure_names_the_module() {
        let failure = crash_failure("pkg.tests");
        assert_eq!(failure.kind, FailKind::Exception);
        assert!(failure.message.contains("pkg.tests"));
    }
}
