//! Test execution inside a forked child.
//!
//! Given a target module, enumerate its tests by the `test_` prefix
//! convention, feed each one the cartesian product of its fixtures,
//! classify every invocation into a Pass or Fail record, and capture
//! per-test stdout/stderr along the way.

use crate::protocol::{FailKind, Failure, Frame, Response};
use crate::runtime::{Fixture, Outcome, Rerun, Runtime, TestDef, Value};
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Callables whose names begin with this prefix are tests.
pub const TEST_PREFIX: &str = "test_";

/// Run every test of `module`, pushing one record per invocation
/// through `emit`. Import trouble produces a single synthesized Fail
/// covering the module.
pub fn run_module(
    runtime: &mut dyn Runtime,
    module: &str,
    verbose: bool,
    emit: &mut dyn FnMut(Response) -> Result<()>,
) -> Result<()> {
    if let Err(e) = runtime.import(module) {
        emit(Response::Fail(Failure {
            kind: FailKind::Setup,
            name: e.name,
            message: e.message,
            frames: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
        }))?;
        return Ok(());
    }

    let exports = match runtime.exports(module) {
        Some(exports) => exports,
        None => {
            emit(Response::Fail(Failure {
                kind: FailKind::Setup,
                name: "ImportError".to_string(),
                message: format!("module {module:?} exposes no tests"),
                frames: Vec::new(),
                stdout: String::new(),
                stderr: String::new(),
            }))?;
            return Ok(());
        }
    };

    let mut tests: Vec<TestDef> = exports
        .tests
        .iter()
        .filter(|t| t.name.starts_with(TEST_PREFIX))
        .cloned()
        .collect();
    tests.sort_by(|a, b| a.name.cmp(&b.name));

    let module_path = runtime
        .module_paths()
        .into_iter()
        .find(|(name, _)| name == module)
        .map(|(_, path)| path.display().to_string())
        .unwrap_or_else(|| format!("<{module}>"));

    let mut capture = OutputCapture::install()?;
    for test in &tests {
        let argument_sets = match build_argument_sets(&test.params, &exports.fixtures) {
            Ok(sets) => sets,
            Err(message) => {
                let (stdout, stderr) = capture.take()?;
                emit(Response::Fail(Failure {
                    kind: FailKind::Setup,
                    name: "Failure".to_string(),
                    message,
                    frames: vec![test_frame(&module_path, test)],
                    stdout,
                    stderr,
                }))?;
                continue;
            }
        };
        for args in argument_sets {
            let outcome = catch_unwind(AssertUnwindSafe(|| (test.body)(&args)));
            let (stdout, stderr) = capture.take()?;
            let record = classify(runtime, module, &module_path, test, &args, outcome, verbose);
            let record = match record {
                Response::Fail(mut failure) => {
                    failure.stdout = stdout;
                    failure.stderr = stderr;
                    Response::Fail(failure)
                }
                other => other,
            };
            emit(record)?;
        }
    }
    Ok(())
}

/// Yield all combinations of the fixtures named by `params`, the
/// rightmost parameter varying fastest.
fn build_argument_sets(
    params: &[String],
    fixtures: &BTreeMap<String, Fixture>,
) -> std::result::Result<Vec<Vec<Value>>, String> {
    if params.is_empty() {
        return Ok(vec![Vec::new()]);
    }
    let mut lists = Vec::with_capacity(params.len());
    for name in params {
        let fixture = fixtures
            .get(name)
            .ok_or_else(|| format!("no such fixture {name:?}"))?;
        lists.push(fixture.materialize());
    }
    let mut combos: Vec<Vec<Value>> = vec![Vec::new()];
    for list in &lists {
        let mut next = Vec::with_capacity(combos.len() * list.len());
        for combo in &combos {
            for value in list {
                let mut extended = combo.clone();
                extended.push(value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }
    Ok(combos)
}

fn classify(
    runtime: &mut dyn Runtime,
    module: &str,
    module_path: &str,
    test: &TestDef,
    args: &[Value],
    outcome: std::thread::Result<Outcome>,
    verbose: bool,
) -> Response {
    match outcome {
        Ok(Outcome::Pass) => {
            if verbose {
                Response::PassNamed(named(test, args))
            } else {
                Response::Pass
            }
        }
        Ok(Outcome::AssertFail { message }) => {
            let message = match message {
                Some(text) => text,
                None => match runtime.enrich_assertion(module, &test.name, args) {
                    Rerun::Message(text) => text,
                    Rerun::PassedOnRerun => {
                        "assertion passed when it was rerun".to_string()
                    }
                    Rerun::FailedDifferently(text) => {
                        format!("assertion failed differently when rerun: {text}")
                    }
                    Rerun::Unavailable => String::new(),
                },
            };
            Response::Fail(Failure {
                kind: FailKind::Assertion,
                name: "AssertionError".to_string(),
                message,
                frames: add_args(vec![test_frame(module_path, test)], args),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
        Ok(Outcome::Raise {
            name,
            message,
            frames,
        }) => {
            let frames = if frames.is_empty() {
                vec![test_frame(module_path, test)]
            } else {
                frames
            };
            Response::Fail(Failure {
                kind: FailKind::Exception,
                name,
                message,
                frames: add_args(frames, args),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
        Err(payload) => {
            let message = if let Some(text) = payload.downcast_ref::<&str>() {
                text.to_string()
            } else if let Some(text) = payload.downcast_ref::<String>() {
                text.clone()
            } else {
                "test body panicked".to_string()
            };
            Response::Fail(Failure {
                kind: FailKind::Exception,
                name: "Panic".to_string(),
                message,
                frames: add_args(vec![test_frame(module_path, test)], args),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }
}

fn test_frame(module_path: &str, test: &TestDef) -> Frame {
    Frame {
        path: module_path.to_string(),
        line: test.line,
        function: test.name.clone(),
        source: test.source.clone(),
    }
}

fn named(test: &TestDef, args: &[Value]) -> String {
    if args.is_empty() {
        test.name.clone()
    } else {
        let rendered: Vec<String> = args.iter().map(|v| v.to_string()).collect();
        format!("{}({})", test.name, rendered.join(", "))
    }
}

/// Rewrite the innermost frame to show the test's arguments.
fn add_args(mut frames: Vec<Frame>, args: &[Value]) -> Vec<Frame> {
    if args.is_empty() {
        return frames;
    }
    if let Some(last) = frames.last_mut() {
        let rendered: Vec<String> = args.iter().map(|v| v.to_string()).collect();
        last.function = format!("{}({})", last.function, rendered.join(", "));
    }
    frames
}

/// Redirects the child's stdout/stderr into anonymous memory files
/// so each test's output can be read back and cleared. Restored on
/// drop.
pub struct OutputCapture {
    out_fd: RawFd,
    err_fd: RawFd,
    saved_out: RawFd,
    saved_err: RawFd,
}

impl OutputCapture {
    pub fn install() -> Result<Self> {
        let out_fd = create_memfd("assay_stdout")?;
        let err_fd = create_memfd("assay_stderr")?;
        let saved_out = unsafe { libc::dup(libc::STDOUT_FILENO) };
        let saved_err = unsafe { libc::dup(libc::STDERR_FILENO) };
        if saved_out < 0 || saved_err < 0 {
            return Err(anyhow!("dup failed: {}", std::io::Error::last_os_error()));
        }
        unsafe {
            if libc::dup2(out_fd, libc::STDOUT_FILENO) < 0
                || libc::dup2(err_fd, libc::STDERR_FILENO) < 0
            {
                return Err(anyhow!("dup2 failed: {}", std::io::Error::last_os_error()));
            }
        }
        Ok(Self {
            out_fd,
            err_fd,
            saved_out,
            saved_err,
        })
    }

    /// Read and clear both captured streams.
    pub fn take(&mut self) -> Result<(String, String)> {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
        Ok((read_and_clear(self.out_fd)?, read_and_clear(self.err_fd)?))
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        unsafe {
            libc::dup2(self.saved_out, libc::STDOUT_FILENO);
            libc::dup2(self.saved_err, libc::STDERR_FILENO);
            libc::close(self.saved_out);
            libc::close(self.saved_err);
            libc::close(self.out_fd);
            libc::close(self.err_fd);
        }
    }
}

/// Anonymous memory file; inherited offsets let dup2'd writers and
/// this reader share position.
fn create_memfd(name: &str) -> Result<RawFd> {
    let c_name = std::ffi::CString::new(name)?;
    let fd = unsafe { libc::syscall(libc::SYS_memfd_create, c_name.as_ptr(), 0) as RawFd };
    if fd < 0 {
        Err(anyhow!(
            "memfd_create failed: {}",
            std::io::Error::last_os_error()
        ))
    } else {
        Ok(fd)
    }
}

fn read_and_clear(fd: RawFd) -> Result<String> {
    let dup_fd = unsafe { libc::dup(fd) };
    if dup_fd < 0 {
        return Err(anyhow!("dup failed: {}", std::io::Error::last_os_error()));
    }
    let mut file = unsafe { File::from_raw_fd(dup_fd) };
    file.seek(SeekFrom::Start(0))?;
    let mut content = String::new();
    let _ = file.read_to_string(&mut content);
    // rewind the shared offset and empty the file for the next test
    unsafe {
        libc::lseek(fd, 0, libc::SEEK_SET);
        libc::ftruncate(fd, 0);
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ModuleDef, StaticRuntime};
    use crate::samples::sample_world;
    use std::sync::Mutex;

    // run_module redirects the process's stdout/stderr while it
    // captures; hold this across every call so parallel test threads
    // never overlap their redirections.
    static CAPTURE_LOCK: Mutex<()> = Mutex::new(());

    fn collect(runtime: &mut dyn Runtime, module: &str) -> Vec<Response> {
        let _guard = CAPTURE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut records = Vec::new();
        run_module(runtime, module, false, &mut |r| {
            records.push(r);
            Ok(())
        })
        .unwrap();
        records
    }

    #[test]
    fn single_passing_test_yields_one_pass() {
        let mut rt = sample_world();
        let records = collect(&mut rt, "quartz");
        assert_eq!(records, vec![Response::Pass]);
    }

    #[test]
    fn fixture_product_runs_in_order() {
        let mut rt = sample_world();
        let records = collect(&mut rt, "fixtures");
        // test_fix2 over [0,1,2,3]: fails only on 2
        let fix2: Vec<bool> = records[..4]
            .iter()
            .map(|r| matches!(r, Response::Pass))
            .collect();
        assert_eq!(fix2, [true, true, false, true]);
        // test_pairs: letters x numbers, all passing
        assert_eq!(records.len(), 8);
        assert!(records[4..].iter().all(|r| matches!(r, Response::Pass)));
    }

    #[test]
    fn bare_assertion_is_enriched_by_rerun() {
        let mut rt = sample_world();
        let records = collect(&mut rt, "failing");
        match &records[0] {
            Response::Fail(failure) => {
                assert_eq!(failure.kind, FailKind::Assertion);
                assert_eq!(failure.name, "AssertionError");
                assert!(failure.message.starts_with("BUT"));
            }
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn parameterised_failure_names_the_argument() {
        let mut rt = sample_world();
        let records = collect(&mut rt, "fixtures");
        match &records[2] {
            Response::Fail(failure) => {
                assert_eq!(failure.frames.last().unwrap().function, "test_fix2(2)");
            }
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn import_error_synthesizes_one_setup_failure() {
        let mut rt = sample_world();
        let records = collect(&mut rt, "broken_import");
        assert_eq!(records.len(), 1);
        match &records[0] {
            Response::Fail(failure) => {
                assert_eq!(failure.kind, FailKind::Setup);
                assert_eq!(failure.name, "SyntaxError");
            }
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn missing_fixture_is_a_setup_failure() {
        let mut rt = StaticRuntime::new(vec![ModuleDef::new("lonely").test(TestDef {
            name: "test_needs".to_string(),
            params: vec!["ghost".to_string()],
            line: 1,
            source: "assert ghost".to_string(),
            body: |_| Outcome::Pass,
            detail: None,
        })]);
        let records = collect(&mut rt, "lonely");
        match &records[0] {
            Response::Fail(failure) => {
                assert_eq!(failure.kind, FailKind::Setup);
                assert!(failure.message.contains("no such fixture"));
            }
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn verbose_mode_names_passing_tests() {
        let _guard = CAPTURE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut rt = sample_world();
        let mut records = Vec::new();
        run_module(&mut rt, "quartz", true, &mut |r| {
            records.push(r);
            Ok(())
        })
        .unwrap();
        assert_eq!(records, vec![Response::PassNamed("test_clock".to_string())]);
    }

    #[test]
    fn cartesian_product_varies_rightmost_fastest() {
        let mut fixtures = BTreeMap::new();
        fixtures.insert(
            "f1".to_string(),
            Fixture::Values(vec![Value::Str("A".into()), Value::Str("B".into())]),
        );
        fixtures.insert(
            "f2".to_string(),
            Fixture::Values(vec![Value::Str("x".into()), Value::Str("y".into())]),
        );
        let sets =
            build_argument_sets(&["f1".to_string(), "f2".to_string()], &fixtures).unwrap();
        let rendered: Vec<String> = sets
            .iter()
            .map(|args| {
                args.iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .collect();
        assert_eq!(rendered, ["\"A\"\"x\"", "\"A\"\"y\"", "\"B\"\"x\"", "\"B\"\"y\""]);
    }
}
