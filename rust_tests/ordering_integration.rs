//! Integration tests for the import-order learning algorithm.

use assay::imports::{improve_order, merge_discovered};
use assay::protocol::ImportEvent;
use assay::runtime::Runtime;
use assay::samples::sample_world;

#[test]
fn plain_sequence_is_stable() {
    let events = vec![
        ImportEvent::new("A", &["A"]),
        ImportEvent::new("B", &["B"]),
        ImportEvent::new("D", &["C", "D"]),
        ImportEvent::new("C", &[]),
        ImportEvent::new("E", &["E"]),
    ];
    assert_eq!(improve_order(&events), ["A", "B", "C", "D", "E"]);
}

#[test]
fn main_module_first_gets_reordered() {
    let events = vec![
        ImportEvent::new("E", &["A", "B", "C", "D", "E"]),
        ImportEvent::new("A", &[]),
        ImportEvent::new("B", &[]),
        ImportEvent::new("C", &[]),
        ImportEvent::new("D", &[]),
    ];
    assert_eq!(improve_order(&events), ["A", "B", "C", "D", "E"]);
}

#[test]
fn unseen_modules_are_discovered() {
    let events = vec![
        ImportEvent::new("A", &["A"]),
        ImportEvent::new("B", &["B", "X"]),
        ImportEvent::new("C", &["C"]),
        ImportEvent::new("D", &["D", "Y", "Z"]),
        ImportEvent::new("E", &["E"]),
    ];
    assert_eq!(
        improve_order(&events),
        ["A", "X", "B", "C", "Y", "Z", "D", "E"]
    );
}

/// Replay the learner against a live runtime until the order stops
/// changing: from a cold start the fixed point arrives within two
/// cycles.
#[test]
fn order_reaches_a_fixed_point_quickly() {
    let discovered = vec!["omega".to_string(), "quartz".to_string()];
    let mut order: Vec<String> = Vec::new();
    merge_discovered(&mut order, &discovered);

    let mut previous = order.clone();
    let mut converged_after = None;
    for cycle in 1..=4 {
        let mut runtime = sample_world();
        let mut events = Vec::new();
        for name in &order {
            let loaded = runtime.import(name).unwrap_or_default();
            events.push(ImportEvent {
                requested: name.clone(),
                loaded,
            });
        }
        order = improve_order(&events);
        merge_discovered(&mut order, &discovered);
        if order == previous {
            converged_after = Some(cycle);
            break;
        }
        previous = order.clone();
    }
    let k = converged_after.expect("import order never reached a fixed point");
    assert!(k <= 2, "took {k} cycles to converge");
    // dependencies land before the module that pulls them in
    let alpha = order.iter().position(|m| m == "alpha").unwrap();
    let omega = order.iter().position(|m| m == "omega").unwrap();
    assert!(alpha < omega);
}

#[test]
fn learner_applied_to_its_own_stable_output_is_identity() {
    let events = vec![
        ImportEvent::new("D", &["C", "D"]),
        ImportEvent::new("C", &[]),
        ImportEvent::new("A", &["A", "X"]),
    ];
    let first = improve_order(&events);
    let replay: Vec<ImportEvent> = first
        .iter()
        .map(|name| ImportEvent::new(name, &[name.as_str()]))
        .collect();
    assert_eq!(improve_order(&replay), first);
}

#[test]
fn mutually_importing_modules_settle_into_one_order() {
    let events = vec![
        ImportEvent::new("ring_a", &["ring_a", "ring_b"]),
        ImportEvent::new("ring_b", &[]),
    ];
    let order = improve_order(&events);
    assert_eq!(order.len(), 2);
    let replay: Vec<ImportEvent> = vec![
        ImportEvent::new(&order[0], &[&order[0], &order[1]]),
        ImportEvent::new(&order[1], &[]),
    ];
    let again = improve_order(&replay);
    assert_eq!(again.len(), 2);
}
