//! Property tests for packing, tree transforms and the ordering contract.

use framestat_runtime::message::{
    compare_by_duration, pack_call_count_duration, unpack_call_count, unpack_duration,
};
use framestat_runtime::{RawStatStackNode, StatMessage, StatName, StatOperation};
use proptest::prelude::*;

#[derive(Clone, Debug)]
struct Spec {
    name: u8,
    calls: u32,
    duration: u32,
    children: Vec<Spec>,
}

fn spec() -> impl Strategy<Value = Spec> {
    let leaf = (0u8..8, 1u32..20, 0u32..1_000_000).prop_map(|(name, calls, duration)| Spec {
        name,
        calls,
        duration,
        children: Vec::new(),
    });
    leaf.prop_recursive(4, 40, 5, |inner| {
        (0u8..8, 1u32..20, 0u32..1_000_000, prop::collection::vec(inner, 0..5)).prop_map(
            |(name, calls, duration, children)| Spec {
                name,
                calls,
                duration,
                children,
            },
        )
    })
}

fn stat_name(index: u8) -> StatName {
    // Dotted names so name folders have something to group.
    StatName::new(&format!("prop.{}.n{index}", index % 3))
}

fn build(spec: &Spec) -> RawStatStackNode {
    let mut node = RawStatStackNode::new(StatMessage::packed(
        stat_name(spec.name),
        StatOperation::Set,
        spec.calls,
        spec.duration,
    ));
    for child in &spec.children {
        let built = build(child);
        node.children.insert(built.meta.name, built);
    }
    node
}

fn tree(specs: &[Spec]) -> RawStatStackNode {
    let mut root = RawStatStackNode::new_root();
    for spec in specs {
        let built = build(spec);
        root.children.insert(built.meta.name, built);
    }
    root
}

fn total_leaf_time(node: &RawStatStackNode) -> i64 {
    if node.children.is_empty() {
        node.meta.duration() as i64
    } else {
        node.children.values().map(total_leaf_time).sum()
    }
}

proptest! {
    #[test]
    fn packed_halves_are_independent(calls in any::<u32>(), duration in any::<u32>()) {
        let packed = pack_call_count_duration(calls, duration);
        prop_assert_eq!(unpack_call_count(packed), calls);
        prop_assert_eq!(unpack_duration(packed), duration);
    }

    #[test]
    fn encoded_tree_uncondenses_to_itself(specs in prop::collection::vec(spec(), 0..4)) {
        let root = tree(&specs);
        let mut encoded = Vec::new();
        root.encode(&mut encoded);
        let rebuilt = RawStatStackNode::uncondense(&encoded, None, None);
        prop_assert_eq!(rebuilt, root);
    }

    #[test]
    fn merging_a_tree_with_itself_then_halving_is_identity(
        specs in prop::collection::vec(spec(), 1..4)
    ) {
        let root = tree(&specs);
        let mut merged = root.clone();
        merged.merge_add(&root);
        merged.divide(2);
        prop_assert_eq!(merged, root);
    }

    #[test]
    fn merge_max_never_lowers_a_value(
        a in prop::collection::vec(spec(), 1..3),
        b in prop::collection::vec(spec(), 1..3),
    ) {
        let left = tree(&a);
        let mut merged = left.clone();
        merged.merge_max(&tree(&b));
        for (name, node) in &left.children {
            let after = &merged.children[name];
            prop_assert!(after.meta.duration() >= node.meta.duration());
            prop_assert!(after.meta.call_count() >= node.meta.call_count());
        }
    }

    #[test]
    fn name_hierarchy_is_idempotent_and_keeps_leaf_time(
        specs in prop::collection::vec(spec(), 1..4)
    ) {
        let mut once = tree(&specs);
        let leaf_time = total_leaf_time(&once);
        once.add_name_hierarchy();
        let mut twice = once.clone();
        twice.add_name_hierarchy();
        prop_assert_eq!(&twice, &once);
        prop_assert_eq!(total_leaf_time(&once), leaf_time);
    }

    #[test]
    fn duration_order_is_total_and_descending(
        items in prop::collection::vec((0u8..8, 1u32..5, 0u32..50), 0..20)
    ) {
        let mut stats: Vec<StatMessage> = items
            .iter()
            .map(|(name, calls, duration)| {
                StatMessage::packed(stat_name(*name), StatOperation::Set, *calls, *duration)
            })
            .collect();
        framestat_runtime::message::sort_by_duration(&mut stats);
        for pair in stats.windows(2) {
            prop_assert!(compare_by_duration(&pair[0], &pair[1]).is_le());
            prop_assert!(pair[0].duration() >= pair[1].duration());
        }
    }
}
