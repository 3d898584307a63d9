//! One full batch cycle of the coordinator over the sample world.

use assay::discovery::Target;
use assay::runtime::RuntimeFactory;
use assay::samples::{sample_modules, sample_world};
use assay::scheduler::{discover_modules, Scheduler, SessionEnd};
use assay::terminal::TerminalGuard;

fn targets() -> Vec<Target> {
    sample_modules()
        .into_iter()
        .map(|name| Target { root: None, name })
        .collect()
}

#[test]
fn batch_cycle_tallies_every_sample_failure() {
    let factory: RuntimeFactory = Box::new(|| Box::new(sample_world()));
    let terminal = TerminalGuard::new(false).unwrap();
    let mut scheduler = Scheduler::new(&factory, targets(), &terminal, true, false).unwrap();
    let end = scheduler.run().unwrap();

    // failing, erroring, printing, fixtures (fix2 == 2) and the
    // broken import each contribute exactly one failure
    assert_eq!(end, SessionEnd::Quit { failures: 5 });
}

#[test]
fn verbose_batch_cycle_reaches_the_same_tally() {
    let factory: RuntimeFactory = Box::new(|| Box::new(sample_world()));
    let terminal = TerminalGuard::new(false).unwrap();
    let mut scheduler = Scheduler::new(&factory, targets(), &terminal, true, true).unwrap();
    let end = scheduler.run().unwrap();
    assert_eq!(end, SessionEnd::Quit { failures: 5 });
}

#[test]
fn all_passing_queue_reports_zero_failures() {
    let factory: RuntimeFactory = Box::new(|| Box::new(sample_world()));
    let terminal = TerminalGuard::new(false).unwrap();
    let passing = vec![
        Target {
            root: None,
            name: "quartz".to_string(),
        },
        Target {
            root: None,
            name: "omega".to_string(),
        },
    ];
    let mut scheduler = Scheduler::new(&factory, passing, &terminal, true, false).unwrap();
    let end = scheduler.run().unwrap();
    assert_eq!(end, SessionEnd::Quit { failures: 0 });
}

#[test]
fn unknown_module_fails_its_slot_but_not_the_run() {
    let factory: RuntimeFactory = Box::new(|| Box::new(sample_world()));
    let terminal = TerminalGuard::new(false).unwrap();
    let mixed = vec![
        Target {
            root: None,
            name: "quartz".to_string(),
        },
        Target {
            root: None,
            name: "does.not.exist".to_string(),
        },
    ];
    let mut scheduler = Scheduler::new(&factory, mixed, &terminal, true, false).unwrap();
    let end = scheduler.run().unwrap();
    assert_eq!(end, SessionEnd::Quit { failures: 1 });
}

#[test]
fn discovery_expands_targets_in_order() {
    let modules = discover_modules(&targets());
    assert_eq!(modules, sample_modules());
}
