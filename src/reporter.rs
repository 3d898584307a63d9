//! Display test results and respond to user keystrokes.

use crate::protocol::Failure;
use std::time::Instant;

const HELP_HINT: &str = "Press ? for help";
const HELP_MESSAGE: &str = "
 [j] Next exception
 [k] Previous exception
 [r] Restart Assay
 [q] Quit Assay
 [?] Help (this summary)
";

fn black(text: &str) -> String {
    format!("\x1b[1;30m{text}\x1b[0m")
}

fn red(text: &str) -> String {
    format!("\x1b[1;31m{text}\x1b[0m")
}

fn green(text: &str) -> String {
    format!("\x1b[1;32m{text}\x1b[0m")
}

fn yellow(text: &str) -> String {
    format!("\x1b[1;33m{text}\x1b[0m")
}

fn blue(text: &str) -> String {
    format!("\x1b[1;35m{text}\x1b[0m")
}

/// What a keystroke asks the coordinator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Quit,
    Restart,
}

pub struct Reporter {
    write_callback: Box<dyn FnMut(&str)>,
    letters: Vec<char>,
    failures: Vec<Failure>,
    failure_index: usize,
    column: usize,
    period: usize,
    batch: bool,
    t0: Instant,
}

impl Reporter {
    pub fn new(batch: bool, write_callback: Box<dyn FnMut(&str)>) -> Self {
        Self {
            write_callback,
            letters: Vec::new(),
            failures: Vec::new(),
            failure_index: 0,
            column: 0,
            period: 78 - HELP_HINT.len(),
            batch,
            t0: Instant::now(),
        }
    }

    /// Writes to stdout, flushing per call so progress dots appear
    /// as they happen.
    pub fn to_stdout(batch: bool) -> Self {
        Self::new(
            batch,
            Box::new(|s| {
                use std::io::Write;
                let mut out = std::io::stdout();
                let _ = out.write_all(s.as_bytes());
                let _ = out.flush();
            }),
        )
    }

    /// Forget the previous cycle's stream.
    pub fn start_cycle(&mut self) {
        self.letters.clear();
        self.failures.clear();
        self.failure_index = 0;
        self.column = 0;
        self.t0 = Instant::now();
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Write out `s`, keeping track of the cursor column. Each
    /// colour wrap adds eleven invisible characters.
    fn write(&mut self, s: &str) {
        (self.write_callback)(s);
        let tracked = match s.rfind('\r') {
            Some(i) => {
                self.column = 0;
                &s[i + 1..]
            }
            None => s,
        };
        let escapes = tracked.matches('\x1b').count();
        self.column += tracked.chars().count() - escapes / 2 * 11;
    }

    pub fn report_pass(&mut self) {
        self.letters.push('.');
        if self.batch {
            self.write(".");
            return;
        }
        if !self.failures.is_empty() && self.column >= self.period {
            self.write_failure_count();
        }
        self.write(".");
    }

    pub fn report_pass_named(&mut self, name: &str) {
        self.letters.push('.');
        self.write(&format!("{name}\n"));
    }

    pub fn report_fail(&mut self, failure: Failure) {
        let letter = failure.kind.letter();
        self.letters.push(letter);
        if self.batch {
            self.failures.push(failure);
            self.write(&letter.to_string());
            return;
        }
        if self.failures.is_empty() {
            self.print_failure(&failure);
            self.write(&format!(
                "{}{}\r",
                " ".repeat(79 - HELP_HINT.len()),
                black(HELP_HINT)
            ));
        }
        self.failures.push(failure);
        self.write_failure_count();
        self.write(&letter.to_string());
    }

    fn write_failure_count(&mut self) {
        let message = format!(
            "Viewing {} of {} errors ",
            self.failure_index + 1,
            self.failures.len()
        );
        self.write(&format!("\r{}", black(&message)));
    }

    /// The end-of-cycle tally.
    pub fn summarize(&mut self) {
        let dt = self.t0.elapsed().as_secs_f64();
        let failures = self.failures.len();
        let total = self.letters.len();
        let tally = if failures > 0 {
            red(&format!("\r{failures} of {total} tests failed"))
        } else {
            green(&format!("\nAll {total} tests passed"))
        };
        self.write(&format!("{tally} in {dt:.2} seconds \n"));
    }

    /// `None` means the keystroke was fully handled here.
    pub fn process_keystroke(&mut self, keystroke: u8) -> Option<KeyAction> {
        match keystroke {
            b'q' | 0x03 => return Some(KeyAction::Quit),
            b'r' => return Some(KeyAction::Restart),
            b'?' => self.write(HELP_MESSAGE),
            b'j' => {
                if self.failure_index + 1 < self.failures.len() {
                    self.failure_index += 1;
                    self.reprint_current_failure();
                }
            }
            b'k' => {
                if self.failure_index > 0 {
                    self.failure_index -= 1;
                    self.reprint_current_failure();
                }
            }
            _ => {}
        }
        None
    }

    fn reprint_current_failure(&mut self) {
        let failure = self.failures[self.failure_index].clone();
        self.print_failure(&failure);
        self.write(&format!(
            "{}{}\r",
            " ".repeat(79 - HELP_HINT.len()),
            black(HELP_HINT)
        ));
        self.write_failure_count();
    }

    fn print_failure(&mut self, failure: &Failure) {
        let mut text = String::from("\n");
        let out = failure.stdout.trim_end();
        let err = failure.stderr.trim_end();
        if !out.is_empty() {
            text.push_str(&format!("{:-^72}\n", " stdout "));
            text.push_str(&green(out));
            text.push('\n');
        }
        if !err.is_empty() {
            text.push_str(&format!("{:-^72}\n", " stderr "));
            text.push_str(&yellow(err));
            text.push('\n');
        }
        if !out.is_empty() || !err.is_empty() {
            text.push_str(&"-".repeat(72));
            text.push('\n');
        }
        for frame in &failure.frames {
            let location = format!("  {} line {} in", frame.path, frame.line);
            let function = &frame.function;
            if location.len() + function.len() > 78 {
                text.push_str(&format!("{location}\n  {function}\n"));
            } else {
                text.push_str(&format!("{location} {function}\n"));
            }
            let indented = frame.source.replace('\n', "\n    ");
            text.push_str(&blue(&format!("    {indented}")));
            text.push('\n');
        }
        let line = if failure.message.is_empty() {
            failure.name.clone()
        } else {
            format!("{}: {}", failure.name, failure.message)
        };
        text.push_str(&red(&line));
        text.push_str("\n\n");
        self.write(&text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FailKind, Frame};
    use std::sync::{Arc, Mutex};

    fn capture() -> (Arc<Mutex<String>>, Reporter) {
        let buffer = Arc::new(Mutex::new(String::new()));
        let sink = buffer.clone();
        let reporter = Reporter::new(
            false,
            Box::new(move |s| sink.lock().unwrap().push_str(s)),
        );
        (buffer, reporter)
    }

    fn strip_ansi(s: &str) -> String {
        let mut out = String::new();
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            if c == '\x1b' {
                for d in chars.by_ref() {
                    if d == 'm' {
                        break;
                    }
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    fn failure(name: &str) -> Failure {
        Failure {
            kind: FailKind::Exception,
            name: name.to_string(),
            message: "went wrong".to_string(),
            frames: vec![Frame {
                path: "m.py".to_string(),
                line: 3,
                function: "test_it".to_string(),
                source: "assert it()".to_string(),
            }],
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    #[test]
    fn all_passed_tally() {
        let (buffer, mut reporter) = capture();
        for _ in 0..3 {
            reporter.report_pass();
        }
        reporter.summarize();
        let text = strip_ansi(&buffer.lock().unwrap());
        assert!(text.contains("All 3 tests passed"));
    }

    #[test]
    fn failure_tally_counts_both_kinds() {
        let (buffer, mut reporter) = capture();
        reporter.report_pass();
        reporter.report_fail(failure("ValueError"));
        reporter.summarize();
        let text = strip_ansi(&buffer.lock().unwrap());
        assert!(text.contains("1 of 2 tests failed"), "got: {text}");
    }

    #[test]
    fn first_failure_is_printed_immediately() {
        let (buffer, mut reporter) = capture();
        reporter.report_fail(failure("KeyError"));
        let text = strip_ansi(&buffer.lock().unwrap());
        assert!(text.contains("KeyError: went wrong"));
        assert!(text.contains("m.py line 3 in test_it"));
        assert!(text.contains("Press ? for help"));
    }

    #[test]
    fn captured_output_gets_banners() {
        let (buffer, mut reporter) = capture();
        let mut f = failure("AssertionError");
        f.stdout = "ker-pow\n".to_string();
        f.stderr = "kaboom\n".to_string();
        reporter.report_fail(f);
        let text = strip_ansi(&buffer.lock().unwrap());
        assert!(text.contains(" stdout "));
        assert!(text.contains("ker-pow"));
        assert!(text.contains(" stderr "));
        assert!(text.contains("kaboom"));
    }

    #[test]
    fn j_and_k_walk_the_failure_list() {
        let (buffer, mut reporter) = capture();
        reporter.report_fail(failure("First"));
        reporter.report_fail(failure("Second"));
        buffer.lock().unwrap().clear();

        assert_eq!(reporter.process_keystroke(b'j'), None);
        let text = strip_ansi(&buffer.lock().unwrap());
        assert!(text.contains("Second: went wrong"));
        assert!(text.contains("Viewing 2 of 2 errors"));

        buffer.lock().unwrap().clear();
        assert_eq!(reporter.process_keystroke(b'k'), None);
        let text = strip_ansi(&buffer.lock().unwrap());
        assert!(text.contains("First: went wrong"));
        assert!(text.contains("Viewing 1 of 2 errors"));
    }

    #[test]
    fn j_at_the_end_is_silent() {
        let (buffer, mut reporter) = capture();
        reporter.report_fail(failure("Only"));
        buffer.lock().unwrap().clear();
        reporter.process_keystroke(b'j');
        assert!(buffer.lock().unwrap().is_empty());
    }

    #[test]
    fn quit_restart_and_interrupt_keys() {
        let (_buffer, mut reporter) = capture();
        assert_eq!(reporter.process_keystroke(b'q'), Some(KeyAction::Quit));
        assert_eq!(reporter.process_keystroke(0x03), Some(KeyAction::Quit));
        assert_eq!(reporter.process_keystroke(b'r'), Some(KeyAction::Restart));
        assert_eq!(reporter.process_keystroke(b'x'), None);
    }

    #[test]
    fn help_key_prints_the_summary() {
        let (buffer, mut reporter) = capture();
        reporter.process_keystroke(b'?');
        let text = buffer.lock().unwrap();
        assert!(text.contains("[j] Next exception"));
        assert!(text.contains("[q] Quit Assay"));
    }

    #[test]
    fn batch_mode_renders_bare_letters() {
        let buffer = Arc::new(Mutex::new(String::new()));
        let sink = buffer.clone();
        let mut reporter = Reporter::new(
            true,
            Box::new(move |s| sink.lock().unwrap().push_str(s)),
        );
        reporter.report_pass();
        reporter.report_fail(failure("E"));
        reporter.report_pass();
        let text = buffer.lock().unwrap();
        assert_eq!(&*text, ".E.");
    }

    #[test]
    fn empty_message_prints_name_alone() {
        let (buffer, mut reporter) = capture();
        let mut f = failure("AssertionError");
        f.message = String::new();
        reporter.report_fail(f);
        let text = strip_ansi(&buffer.lock().unwrap());
        assert!(text.contains("AssertionError\n"));
        assert!(!text.contains("AssertionError:"));
    }
}
