//! A canned world of test modules.
//!
//! Used by the test suite and wired up as the default runtime of the
//! shipped binary; a real language integration replaces this with
//! its own `Runtime`.

use crate::protocol::Frame;
use crate::runtime::{Fixture, ModuleDef, Outcome, Rerun, StaticRuntime, TestDef, Value};

fn passing(_args: &[Value]) -> Outcome {
    Outcome::Pass
}

fn failing_math(_args: &[Value]) -> Outcome {
    Outcome::AssertFail { message: None }
}

fn failing_math_detail(_args: &[Value]) -> Rerun {
    Rerun::Message("BUT 2\n   != 3".to_string())
}

fn raising(_args: &[Value]) -> Outcome {
    Outcome::Raise {
        name: "ValueError".to_string(),
        message: "twelve is greater than ten".to_string(),
        frames: vec![Frame {
            path: "erroring.py".to_string(),
            line: 4,
            function: "test_valueerror".to_string(),
            source: "raise ValueError('twelve is greater than ten')".to_string(),
        }],
    }
}

fn noisy_then_failing(_args: &[Value]) -> Outcome {
    println!("ker-pow");
    eprintln!("kaboom");
    Outcome::AssertFail {
        message: Some("noise precedes failure".to_string()),
    }
}

fn fixture_not_two(args: &[Value]) -> Outcome {
    match &args[0] {
        Value::Int(2) => Outcome::AssertFail { message: None },
        _ => Outcome::Pass,
    }
}

fn fixture_not_two_detail(args: &[Value]) -> Rerun {
    Rerun::Message(format!("BUT {}\n   == 2", args[0]))
}

fn pair_sum(args: &[Value]) -> Outcome {
    // every (letter, number) combination passes; exercises ordering
    match (&args[0], &args[1]) {
        (Value::Str(_), Value::Int(_)) => Outcome::Pass,
        _ => Outcome::Raise {
            name: "TypeError".to_string(),
            message: "unexpected fixture types".to_string(),
            frames: vec![],
        },
    }
}

fn letters() -> Vec<Value> {
    vec![Value::Str("a".to_string()), Value::Str("b".to_string())]
}

fn hang_forever(_args: &[Value]) -> Outcome {
    loop {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
}

/// The full sample registry.
pub fn sample_world() -> StaticRuntime {
    StaticRuntime::new(vec![
        ModuleDef::new("quartz").path("/samples/quartz.py").test(TestDef {
            name: "test_clock".to_string(),
            params: vec![],
            line: 3,
            source: "assert tick() == 'tock'".to_string(),
            body: passing,
            detail: None,
        }),
        ModuleDef::new("alpha").path("/samples/alpha.py"),
        ModuleDef::new("beta").path("/samples/beta.py"),
        ModuleDef::new("omega")
            .path("/samples/omega.py")
            .imports(&["alpha", "beta"])
            .test(TestDef {
                name: "test_linked".to_string(),
                params: vec![],
                line: 6,
                source: "assert alpha.kind == beta.kind".to_string(),
                body: passing,
                detail: None,
            }),
        ModuleDef::new("failing").path("/samples/failing.py").test(TestDef {
            name: "test_math".to_string(),
            params: vec![],
            line: 1,
            source: "assert 1 + 1 == 3".to_string(),
            body: failing_math,
            detail: Some(failing_math_detail),
        }),
        ModuleDef::new("erroring").path("/samples/erroring.py").test(TestDef {
            name: "test_valueerror".to_string(),
            params: vec![],
            line: 4,
            source: "raise ValueError('twelve is greater than ten')".to_string(),
            body: raising,
            detail: None,
        }),
        ModuleDef::new("printing").path("/samples/printing.py").test(TestDef {
            name: "test_shouting".to_string(),
            params: vec![],
            line: 2,
            source: "assert quiet()".to_string(),
            body: noisy_then_failing,
            detail: None,
        }),
        ModuleDef::new("fixtures")
            .path("/samples/fixtures.py")
            .fixture(
                "fix2",
                Fixture::Values(vec![
                    Value::Int(0),
                    Value::Int(1),
                    Value::Int(2),
                    Value::Int(3),
                ]),
            )
            .fixture("letter", Fixture::Thunk(letters))
            .fixture("number", Fixture::Values(vec![Value::Int(1), Value::Int(2)]))
            .test(TestDef {
                name: "test_fix2".to_string(),
                params: vec!["fix2".to_string()],
                line: 5,
                source: "assert fix2 != 2".to_string(),
                body: fixture_not_two,
                detail: Some(fixture_not_two_detail),
            })
            .test(TestDef {
                name: "test_pairs".to_string(),
                params: vec!["letter".to_string(), "number".to_string()],
                line: 9,
                source: "assert label(letter, number)".to_string(),
                body: pair_sum,
                detail: None,
            }),
        ModuleDef::new("broken_import")
            .path("/samples/broken_import.py")
            .broken("invalid syntax (broken_import.py, line 2)"),
        // runs test_early first (sorted order), then wedges; exists
        // so kill/resync paths can be exercised mid-stream
        ModuleDef::new("hanging")
            .path("/samples/hanging.py")
            .test(TestDef {
                name: "test_early".to_string(),
                params: vec![],
                line: 1,
                source: "assert dawn()".to_string(),
                body: passing,
                detail: None,
            })
            .test(TestDef {
                name: "test_forever".to_string(),
                params: vec![],
                line: 5,
                source: "while True: sleep()".to_string(),
                body: hang_forever,
                detail: None,
            }),
    ])
}

/// Modules of the sample world that a full run is expected to cover.
/// The hanging module is left out; it exists for kill/resync tests.
pub fn sample_modules() -> Vec<String> {
    [
        "quartz",
        "omega",
        "failing",
        "erroring",
        "printing",
        "fixtures",
        "broken_import",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
