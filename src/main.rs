use anyhow::Result;
use assay::config::{self, Cli, EX_FAILURES, EX_SOFTWARE, EX_USAGE};
use assay::discovery::{interpret_argument, Target};
use assay::environment;
use assay::runtime::RuntimeFactory;
use assay::samples;
use assay::scheduler::{Scheduler, SessionEnd};
use assay::terminal::TerminalGuard;

fn main() {
    let cli = config::parse();

    // The language runtime must not litter the tree with cached
    // bytecode; when the variable was absent we re-exec once.
    if let Err(e) = environment::ensure_bytecode_suppressed() {
        eprintln!("[assay] {e:#}");
        std::process::exit(EX_SOFTWARE);
    }

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("[assay] {e:#}");
            std::process::exit(EX_SOFTWARE);
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let mut targets: Vec<Target> = Vec::with_capacity(cli.names.len());
    for name in &cli.names {
        match interpret_argument(name) {
            Ok(target) => targets.push(target),
            Err(e) => {
                eprintln!("assay: {e}");
                return Ok(EX_USAGE);
            }
        }
    }

    // The registration-table runtime stands in for a real language
    // integration; the worker core is generic over the factory.
    let factory: RuntimeFactory = Box::new(|| Box::new(samples::sample_world()));

    let terminal = TerminalGuard::new(!cli.batch)?;
    // without a controlling terminal there is nothing to watch the
    // keyboard for: run one cycle and report, as --batch would
    let batch = cli.batch || !terminal.is_interactive();
    let mut scheduler = Scheduler::new(&factory, targets, &terminal, batch, cli.verbose)?;
    let end = scheduler.run()?;
    drop(scheduler);
    drop(terminal);

    match end {
        SessionEnd::Quit { failures } => {
            if batch && failures > 0 {
                Ok(EX_FAILURES)
            } else {
                // interactive quit exits clean regardless of tally
                Ok(0)
            }
        }
        SessionEnd::Restart => Err(environment::restart_in_place()),
    }
}
