//! Graph Invariant Tests
//!
//! Property-based checks of ancestor-depth maintenance and ancestor
//! filtering over randomly generated archives.

use lineage_core::*;
use proptest::prelude::*;
use proptest::strategy::Strategy;
use std::collections::BTreeSet;

/// Node `i` is a domain when `i < domains`; every other node links to the
/// earlier nodes picked by `choices[i]`.
fn build(domains: usize, choices: &[Vec<usize>]) -> Graph {
    let graph = Graph::new();
    for i in 0..domains {
        graph.add_domain(&format!("n{}", i), Properties::new()).unwrap();
    }
    for (i, picks) in choices.iter().enumerate().map(|(i, p)| (i + domains, p)) {
        let mut parents: BTreeSet<usize> = picks.iter().map(|p| p % i).collect();
        if parents.is_empty() {
            parents.insert(i % domains);
        }
        let names: Vec<String> = parents.iter().map(|p| format!("n{}", p)).collect();
        let links: Vec<(ParentLink, &str)> = parents
            .iter()
            .zip(names.iter())
            .map(|(p, name)| {
                let link = if *p < domains { ParentLink::Domain } else { ParentLink::Structural };
                (link, name.as_str())
            })
            .collect();
        graph
            .add_node(&format!("n{}", i), properties([("rank", i as i64)]), &links)
            .unwrap();
    }
    graph
}

fn archive_strategy() -> impl Strategy<Value = (usize, Vec<Vec<usize>>)> {
    (
        1usize..4,
        prop::collection::vec(prop::collection::vec(any::<usize>(), 0..3), 1..25),
    )
}

fn depth_map_strategy() -> impl Strategy<Value = AncestorDepths> {
    prop::collection::btree_map("[a-e]", 1u32..10, 0..5)
}

proptest! {
    #[test]
    fn prop_immediate_parents_at_distance_one((domains, choices) in archive_strategy()) {
        let graph = build(domains, &choices);
        for node in graph.nodes() {
            for parent in node.immediate_parents() {
                prop_assert_eq!(node.ancestors.get(parent), Some(&1));
            }
        }
    }

    #[test]
    fn prop_distances_are_shortest((domains, choices) in archive_strategy()) {
        let graph = build(domains, &choices);
        for node in graph.nodes() {
            for (ancestor, distance) in &node.ancestors {
                let via_parents = node
                    .immediate_parents()
                    .filter_map(|p| {
                        if p == ancestor {
                            return Some(1);
                        }
                        graph.get(p).unwrap()?.ancestors.get(ancestor).map(|d| d + 1)
                    })
                    .min();
                prop_assert_eq!(via_parents, Some(*distance));
            }
        }
    }

    #[test]
    fn prop_domains_have_no_ancestors((domains, choices) in archive_strategy()) {
        let graph = build(domains, &choices);
        for node in graph.nodes().iter().filter(|n| n.is_domain) {
            prop_assert!(node.ancestors.is_empty());
            prop_assert_eq!(node.level(), 1);
        }
    }

    #[test]
    fn prop_merge_never_increases_distance(old in depth_map_strategy(), new in depth_map_strategy()) {
        let merged = merge_depths(&old, &new);
        for (id, d) in &old {
            prop_assert!(merged[id] <= *d);
        }
        for (id, d) in &new {
            prop_assert!(merged[id] <= *d);
        }
        prop_assert_eq!(merged.len(), old.keys().chain(new.keys()).collect::<BTreeSet<_>>().len());
    }

    #[test]
    fn prop_relinking_keeps_depths_minimal((domains, choices) in archive_strategy()) {
        let graph = build(domains, &choices);
        let last = format!("n{}", domains + choices.len() - 1);
        let before = graph.get(&last).unwrap().unwrap().ancestors;

        graph.link_parent(&last, ParentLink::Domain, "n0").unwrap();
        let after = graph.get(&last).unwrap().unwrap().ancestors;
        for (id, d) in &before {
            prop_assert!(after[id] <= *d);
        }
        prop_assert_eq!(after.get("n0"), Some(&1));
    }

    #[test]
    fn prop_relinking_interior_reaches_descendants(
        (domains, choices) in archive_strategy(),
        pick in any::<usize>(),
    ) {
        let graph = build(domains, &choices);
        let target = format!("n{}", domains + pick % choices.len());
        graph.add_domain("extra", Properties::new()).unwrap();
        graph.link_parent(&target, ParentLink::Domain, "extra").unwrap();

        for node in graph.nodes() {
            if node.id == target || node.has_ancestor(&target) {
                prop_assert!(node.has_ancestor("extra"), "{} lost the new root", node.id);
            }
            // Every recorded distance is still the shortest one through a parent
            for (ancestor, distance) in &node.ancestors {
                let via_parents = node
                    .immediate_parents()
                    .filter_map(|p| {
                        if p == ancestor {
                            return Some(1);
                        }
                        graph.get(p).unwrap()?.ancestors.get(ancestor).map(|d| d + 1)
                    })
                    .min();
                prop_assert_eq!(via_parents, Some(*distance));
            }
        }
    }

    #[test]
    fn prop_check_ancestor_idempotent(
        (domains, choices) in archive_strategy(),
        start_mask in any::<u8>(),
    ) {
        let graph = build(domains, &choices);
        let mut start_ids: Vec<String> = (0..domains)
            .filter(|i| start_mask & (1 << i) != 0)
            .map(|i| format!("n{}", i))
            .collect();
        if start_ids.is_empty() {
            start_ids.push("n0".to_string());
        }
        let start = StageResult::from_paths(start_ids.clone());

        let hits: Vec<NodeHit> = graph.nodes().iter().map(NodeHit::from).collect();
        let mut once = StageResult::from_hits(hits);
        start.check_ancestor(&graph, &mut once).unwrap();
        let mut twice = once.clone();
        start.check_ancestor(&graph, &mut twice).unwrap();
        prop_assert_eq!(&once.node_ids, &twice.node_ids);

        // Survivors are exactly the start members and their descendants
        for node in graph.nodes() {
            let expected = start_ids.contains(&node.id)
                || start_ids.iter().any(|s| node.has_ancestor(s));
            prop_assert_eq!(once.node_ids.contains(&node.id), expected);
        }
    }
}
