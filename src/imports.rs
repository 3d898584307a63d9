//! The change-tracking module ordering algorithm.
//!
//! Each cycle the preload of a worker yields a trace of import
//! events; this module turns that trace into the next cycle's
//! preload order, moving every module in front of the module that
//! actually imported it so the warm state converges.

use crate::protocol::{ImportEvent, ModuleName};
use std::collections::{HashMap, HashSet};

/// Given the import events of the last slate of imports, return a
/// new import order.
///
/// Walking the events in reverse, each event contributes first the
/// module that caused the requested module to be loaded (if any),
/// then the requested module, then its loaded-set sorted by
/// descending name; duplicates keep their first appended position
/// and the accumulated list is reversed at the end. The effect is
/// that newly discovered modules are inserted just before the
/// module that imports them.
pub fn improve_order(events: &[ImportEvent]) -> Vec<ModuleName> {
    let mut imported_by: HashMap<&str, &str> = HashMap::new();
    for event in events {
        for name in &event.loaded {
            if name != &event.requested {
                imported_by.insert(name, &event.requested);
            }
        }
    }

    // first occurrence wins while appending
    let mut already_appended: HashSet<&str> = HashSet::new();
    let mut new_order: Vec<&str> = Vec::new();

    for event in events.iter().rev() {
        if let Some(&importer) = imported_by.get(event.requested.as_str()) {
            if already_appended.insert(importer) {
                new_order.push(importer);
            }
        }
        if already_appended.insert(&event.requested) {
            new_order.push(&event.requested);
        }
        let mut loaded: Vec<&str> = event.loaded.iter().map(|s| s.as_str()).collect();
        loaded.sort_unstable_by(|a, b| b.cmp(a));
        for name in loaded {
            if already_appended.insert(name) {
                new_order.push(name);
            }
        }
    }

    new_order.reverse();
    new_order.into_iter().map(|s| s.to_string()).collect()
}

/// Append any module of `discovered` that the learned order does not
/// know about yet, preserving the learned prefix.
pub fn merge_discovered(order: &mut Vec<ModuleName>, discovered: &[ModuleName]) {
    let known: HashSet<&str> = order.iter().map(|s| s.as_str()).collect();
    let missing: Vec<ModuleName> = discovered
        .iter()
        .filter(|name| !known.contains(name.as_str()))
        .cloned()
        .collect();
    order.extend(missing);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Module B imports A, C imports B, et cetera, while X, Y and Z
    // are not part of the chain.

    fn order(events: &[ImportEvent]) -> Vec<String> {
        improve_order(events)
    }

    #[test]
    fn stability_when_nothing_is_wrong() {
        let events = vec![
            ImportEvent::new("A", &["A"]),
            ImportEvent::new("B", &["B"]),
            ImportEvent::new("C", &["C"]),
            ImportEvent::new("D", &["D"]),
            ImportEvent::new("E", &["E"]),
        ];
        assert_eq!(order(&events), ["A", "B", "C", "D", "E"]);
    }

    #[test]
    fn simple_swap() {
        let events = vec![
            ImportEvent::new("A", &["A"]),
            ImportEvent::new("B", &["B"]),
            ImportEvent::new("D", &["C", "D"]),
            ImportEvent::new("C", &[]),
            ImportEvent::new("E", &["E"]),
        ];
        assert_eq!(order(&events), ["A", "B", "C", "D", "E"]);
    }

    #[test]
    fn importing_main_module_first() {
        let events = vec![
            ImportEvent::new("E", &["A", "B", "C", "D", "E"]),
            ImportEvent::new("A", &[]),
            ImportEvent::new("B", &[]),
            ImportEvent::new("C", &[]),
            ImportEvent::new("D", &[]),
        ];
        assert_eq!(order(&events), ["A", "B", "C", "D", "E"]);
    }

    #[test]
    fn discovery_of_unrequested_modules() {
        let events = vec![
            ImportEvent::new("A", &["A"]),
            ImportEvent::new("B", &["B", "X"]),
            ImportEvent::new("C", &["C"]),
            ImportEvent::new("D", &["D", "Y", "Z"]),
            ImportEvent::new("E", &["E"]),
        ];
        assert_eq!(order(&events), ["A", "X", "B", "C", "Y", "Z", "D", "E"]);
    }

    #[test]
    fn causal_predecessor_is_ordered_first() {
        let events = vec![
            ImportEvent::new("D", &["C", "D"]),
            ImportEvent::new("C", &[]),
        ];
        let new_order = order(&events);
        let c = new_order.iter().position(|m| m == "C").unwrap();
        let d = new_order.iter().position(|m| m == "D").unwrap();
        assert!(c < d);
    }

    #[test]
    fn no_module_appears_twice() {
        let events = vec![
            ImportEvent::new("E", &["A", "B", "C", "D", "E"]),
            ImportEvent::new("A", &["A", "B"]),
            ImportEvent::new("B", &["B"]),
            ImportEvent::new("C", &["B", "C"]),
            ImportEvent::new("D", &[]),
        ];
        let new_order = order(&events);
        let mut seen = std::collections::HashSet::new();
        for name in &new_order {
            assert!(seen.insert(name.clone()), "duplicate {name} in {new_order:?}");
        }
    }

    #[test]
    fn cyclic_imports_are_not_rejected() {
        // A and B import each other; any order containing both is legal.
        let events = vec![
            ImportEvent::new("A", &["A", "B"]),
            ImportEvent::new("B", &["A", "B"]),
        ];
        let new_order = order(&events);
        assert!(new_order.contains(&"A".to_string()));
        assert!(new_order.contains(&"B".to_string()));
        assert_eq!(new_order.len(), 2);
    }

    #[test]
    fn idempotent_on_stable_trace() {
        let events = vec![
            ImportEvent::new("A", &["A"]),
            ImportEvent::new("X", &["X"]),
            ImportEvent::new("B", &["B"]),
            ImportEvent::new("C", &["C"]),
        ];
        let first = order(&events);
        let replay: Vec<ImportEvent> = first
            .iter()
            .map(|name| ImportEvent::new(name, &[name.as_str()]))
            .collect();
        assert_eq!(order(&replay), first);
    }

    #[test]
    fn merge_appends_only_unknown_modules() {
        let mut learned = vec!["A".to_string(), "B".to_string()];
        merge_discovered(
            &mut learned,
            &["B".to_string(), "C".to_string(), "A".to_string()],
        );
        assert_eq!(learned, ["A", "B", "C"]);
    }
}
