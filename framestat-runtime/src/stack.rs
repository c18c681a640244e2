//! Call-stack trees rebuilt from condensed message sequences.
//!
//! A frame's cycle stats are stored as a flat sequence of
//! `ChildrenStart` / `Leaf` / `ChildrenEnd` records (see `encode`). This
//! module turns such a sequence back into a tree, and provides the tree
//! transforms used by dumps and multi-frame summaries: merging, averaging,
//! culling, `Self` nodes and name folders.
//!
//! Children are keyed by name in an `IndexMap`, so encoding visits them in
//! the order they were first seen.

use indexmap::IndexMap;
use indexmap::map::Entry;

use crate::message::{StatMessage, StatOperation, StatValue, pack_call_count_duration};
use crate::name::{NAME_FOLDER_PREFIX, StatName, short_name_of, well_known};

/// Non-stack stats accumulated while walking a frame, keyed by name.
pub type NonStackStats = IndexMap<StatName, StatMessage>;

/// Per-record predicate applied while walking a frame.
pub trait StatFilter {
    fn keep(&self, item: &StatMessage) -> bool;
}

impl<F: Fn(&StatMessage) -> bool> StatFilter for F {
    fn keep(&self, item: &StatMessage) -> bool {
        self(item)
    }
}

pub(crate) fn keeps(filter: Option<&dyn StatFilter>, item: &StatMessage) -> bool {
    filter.is_none_or(|f| f.keep(item))
}

/// Fold an accumulating record into the non-stack map.
///
/// Records without a numeric payload and non-accumulating operations are
/// ignored.
pub fn add_non_stack_stat(out: &mut NonStackStats, item: &StatMessage, op: StatOperation) {
    if !op.is_accumulating() || !matches!(item.value, StatValue::Int64(_) | StatValue::Double(_)) {
        return;
    }
    let entry = out.entry(item.name).or_insert_with(|| {
        let mut first = *item;
        first.op = StatOperation::Set;
        first.clear();
        first
    });
    entry.accumulate(item, Some(op));
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawStatStackNode {
    pub meta: StatMessage,
    pub children: IndexMap<StatName, RawStatStackNode>,
}

impl Default for RawStatStackNode {
    fn default() -> Self {
        Self::new_root()
    }
}

impl RawStatStackNode {
    pub fn new(meta: StatMessage) -> Self {
        Self {
            meta,
            children: IndexMap::new(),
        }
    }

    /// Synthetic `ThreadRoot` node with no value.
    pub fn new_root() -> Self {
        Self::new(StatMessage::new(
            well_known().thread_root,
            StatOperation::Set,
            crate::message::StatFlags::DUMMY_ALWAYS_ONE,
            StatValue::None,
        ))
    }

    /// Rebuild a tree from a condensed sequence.
    ///
    /// Records rejected by `filter` are skipped. Accumulating records that
    /// are not part of the stack are folded into `non_stack`, if given.
    pub fn uncondense(
        messages: &[StatMessage],
        filter: Option<&dyn StatFilter>,
        non_stack: Option<&mut NonStackStats>,
    ) -> Self {
        let mut root = Self::new_root();
        let mut scratch = NonStackStats::new();
        let non_stack = non_stack.unwrap_or(&mut scratch);
        root.uncondense_children(&mut messages.iter(), filter, non_stack);
        root
    }

    fn uncondense_children(
        &mut self,
        items: &mut std::slice::Iter<'_, StatMessage>,
        filter: Option<&dyn StatFilter>,
        non_stack: &mut NonStackStats,
    ) {
        let thread_root = well_known().thread_root;
        while let Some(item) = items.next() {
            if !keeps(filter, item) {
                continue;
            }
            match item.op {
                StatOperation::ChildrenStart | StatOperation::ChildrenEnd | StatOperation::Leaf
                    if item.name == thread_root => {}
                StatOperation::ChildrenStart => {
                    self.accumulate_child(item)
                        .uncondense_children(items, filter, non_stack);
                }
                StatOperation::ChildrenEnd => {
                    assert_eq!(
                        item.name, self.meta.name,
                        "unbalanced ChildrenEnd for {}",
                        item.name
                    );
                    return;
                }
                StatOperation::Leaf => {
                    self.accumulate_child(item);
                }
                op if op.is_accumulating() => add_non_stack_stat(non_stack, item, op),
                _ => {}
            }
        }
    }

    /// Find or create the child named like `item` and add `item` into it.
    pub(crate) fn accumulate_child(&mut self, item: &StatMessage) -> &mut RawStatStackNode {
        match self.children.entry(item.name) {
            Entry::Occupied(entry) => {
                let child = entry.into_mut();
                child.meta.accumulate(item, Some(StatOperation::Add));
                child
            }
            Entry::Vacant(entry) => {
                let mut meta = *item;
                meta.op = StatOperation::Set;
                entry.insert(RawStatStackNode::new(meta))
            }
        }
    }

    /// Emit the tree depth-first: `ChildrenStart`, children, `ChildrenEnd`
    /// for inner nodes, `Leaf` for leaves.
    pub fn encode(&self, out: &mut Vec<StatMessage>) {
        let mut item = self.meta;
        if self.children.is_empty() {
            item.op = StatOperation::Leaf;
            out.push(item);
            return;
        }
        item.op = StatOperation::ChildrenStart;
        out.push(item);
        for child in self.children.values() {
            child.encode(out);
        }
        item.op = StatOperation::ChildrenEnd;
        out.push(item);
    }

    pub fn merge_add(&mut self, other: &RawStatStackNode) {
        self.merge(other, StatOperation::Add);
    }

    pub fn merge_max(&mut self, other: &RawStatStackNode) {
        self.merge(other, StatOperation::MaxVal);
    }

    fn merge(&mut self, other: &RawStatStackNode, op: StatOperation) {
        if !matches!(self.meta.value, StatValue::None | StatValue::Name(_)) {
            self.meta.accumulate(&other.meta, Some(op));
        }
        for (name, other_child) in &other.children {
            match self.children.get_mut(name) {
                Some(child) => child.merge(other_child, op),
                None => {
                    self.children.insert(*name, other_child.clone());
                }
            }
        }
    }

    pub fn divide(&mut self, div: u32) {
        if matches!(self.meta.value, StatValue::Int64(_) | StatValue::Double(_)) {
            self.meta.divide(div);
        }
        for child in self.children.values_mut() {
            child.divide(div);
        }
    }

    /// Sum of the children's durations, in cycles.
    pub fn child_cycles(&self) -> i64 {
        self.children
            .values()
            .map(|c| c.meta.duration() as i64)
            .sum()
    }

    /// Fold children shorter than `min_cycles` into an `OtherChildren` node.
    ///
    /// A node with a single short child keeps it but loses that child's
    /// subtree instead.
    pub fn cull_by_cycles(&mut self, min_cycles: i64) {
        let num_children = self.children.len();
        let mut culled = Vec::new();
        for (name, child) in self.children.iter_mut() {
            if (child.meta.duration() as i64) < min_cycles {
                if num_children > 1 {
                    culled.push(*name);
                } else {
                    child.children.clear();
                }
            } else {
                child.cull_by_cycles(min_cycles);
            }
        }
        if culled.is_empty() {
            return;
        }
        let other_name = well_known().other_children;
        let mut other: Option<RawStatStackNode> = self.children.shift_remove(&other_name);
        if let Some(existing) = other.as_mut()
            && !culled.contains(&other_name)
        {
            existing.cull_by_cycles(min_cycles);
        }
        for name in culled {
            if name == other_name {
                continue;
            }
            let Some(child) = self.children.shift_remove(&name) else {
                continue;
            };
            if !child.meta.is_packed() {
                continue;
            }
            let bucket = other.get_or_insert_with(|| {
                let mut meta = child.meta;
                meta.name = other_name;
                meta.op = StatOperation::Set;
                meta.clear();
                RawStatStackNode::new(meta)
            });
            bucket
                .meta
                .accumulate_renamed(&child.meta, Some(StatOperation::Add));
        }
        if let Some(bucket) = other {
            self.children.insert(other_name, bucket);
        }
    }

    /// Keep `levels` levels below this node.
    pub fn cull_by_depth(&mut self, levels: u32) {
        if levels == 0 {
            self.children.clear();
            return;
        }
        for child in self.children.values_mut() {
            child.cull_by_depth(levels - 1);
        }
    }

    /// Add a `Self` child holding the time not covered by the children.
    pub fn add_self(&mut self) {
        if self.meta.is_packed() && !self.children.is_empty() {
            let self_time = self.meta.duration() as i64 - self.child_cycles();
            if self_time > 0 {
                let name = well_known().self_;
                let mut meta = self.meta;
                meta.name = name;
                meta.op = StatOperation::Set;
                meta.value = StatValue::Int64(pack_call_count_duration(
                    self.meta.call_count(),
                    self_time as u32,
                ));
                self.children.insert(name, RawStatStackNode::new(meta));
            }
        }
        for child in self.children.values_mut() {
            child.add_self();
        }
    }

    /// Group siblings whose short names share a `.`/`/` separated prefix
    /// under `NameFolder//prefix..` nodes carrying the group's total.
    ///
    /// Applying it twice gives the same tree as applying it once.
    pub fn add_name_hierarchy(&mut self) {
        let depth = folder_depth(self.meta.name.as_str());
        self.add_name_hierarchy_at(depth);
    }

    fn add_name_hierarchy_at(&mut self, depth: usize) {
        if self.children.len() < 2 || !self.meta.is_packed() {
            for child in self.children.values_mut() {
                child.add_name_hierarchy();
            }
            return;
        }

        let mut entries: Vec<(Vec<&'static str>, RawStatStackNode)> = self
            .children
            .drain(..)
            .map(|(_, child)| (name_parts(&child), child))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let (parts, mut nodes): (Vec<_>, Vec<_>) =
            entries.into_iter().map(|(p, n)| (p, Some(n))).unzip();

        let mut start = 0;
        while start < parts.len() {
            let max_parts = parts[start].len();
            let mut run = 1;
            if max_parts > depth + 1 {
                while start + run < parts.len() {
                    let test = &parts[start + run];
                    if test.len() <= depth + 1 || test[depth] != parts[start][depth] {
                        break;
                    }
                    run += 1;
                }
            }

            if run < 2 {
                if let Some(mut node) = nodes[start].take() {
                    node.add_name_hierarchy();
                    self.children.insert(node.meta.name, node);
                }
                start += 1;
                continue;
            }

            let mut common = max_parts - 1;
            for test in &parts[start + 1..start + run] {
                common = common.min(test.len() - 1);
                if let Some(d) = (depth..common).find(|&d| test[d] != parts[start][d]) {
                    common = d;
                }
            }

            let mut folder_name = String::from(NAME_FOLDER_PREFIX);
            for part in &parts[start][..common] {
                folder_name.push_str(part);
                folder_name.push('.');
            }
            folder_name.push_str("..");

            let mut folder: Option<RawStatStackNode> = None;
            for slot in &mut nodes[start..start + run] {
                let Some(child) = slot.take() else { continue };
                let folder = folder.get_or_insert_with(|| {
                    let mut meta = child.meta;
                    meta.name = StatName::new(&folder_name);
                    meta.op = StatOperation::Set;
                    meta.clear();
                    RawStatStackNode::new(meta)
                });
                folder
                    .meta
                    .accumulate_renamed(&child.meta, Some(StatOperation::Add));
                folder.children.insert(child.meta.name, child);
            }
            if let Some(mut folder) = folder {
                folder.add_name_hierarchy_at(common);
                self.children.insert(folder.meta.name, folder);
            }
            start += run;
        }
    }

    /// Number of nodes in the tree, this one included.
    pub fn node_count(&self) -> usize {
        1 + self.children.values().map(|c| c.node_count()).sum::<usize>()
    }
}

fn name_parts(node: &RawStatStackNode) -> Vec<&'static str> {
    let raw = node.meta.name.as_str();
    if !node.meta.is_packed() || raw.starts_with(NAME_FOLDER_PREFIX) {
        return vec![raw];
    }
    let parts: Vec<&'static str> = short_name_of(raw)
        .split(['.', '/'])
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() { vec![raw] } else { parts }
}

/// Prefix depth encoded in a folder name (`NameFolder//a.b..` is 2).
fn folder_depth(name: &str) -> usize {
    let Some(rest) = name.strip_prefix(NAME_FOLDER_PREFIX) else {
        return 0;
    };
    let rest = rest.strip_suffix("..").unwrap_or(rest);
    rest.split('.').filter(|p| !p.is_empty()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(name: &str, calls: u32, duration: u32) -> RawStatStackNode {
        RawStatStackNode::new(StatMessage::packed(
            StatName::new(name),
            StatOperation::Set,
            calls,
            duration,
        ))
    }

    fn with_children(mut parent: RawStatStackNode, children: Vec<RawStatStackNode>) -> RawStatStackNode {
        for child in children {
            parent.children.insert(child.meta.name, child);
        }
        parent
    }

    fn sample_tree() -> RawStatStackNode {
        let thread = with_children(
            node("GameThread", 1, 1000),
            vec![
                with_children(node("Tick", 1, 600), vec![node("Physics", 2, 400)]),
                node("Render", 1, 300),
            ],
        );
        with_children(RawStatStackNode::new_root(), vec![thread])
    }

    #[test]
    fn encode_then_uncondense_rebuilds_tree() {
        let tree = sample_tree();
        let mut encoded = Vec::new();
        tree.encode(&mut encoded);
        assert_eq!(encoded.first().map(|m| m.op), Some(StatOperation::ChildrenStart));
        assert_eq!(encoded.last().map(|m| m.op), Some(StatOperation::ChildrenEnd));
        let rebuilt = RawStatStackNode::uncondense(&encoded, None, None);
        assert_eq!(rebuilt, tree);
    }

    #[test]
    fn uncondense_accumulates_repeated_children() {
        let a = StatName::new("repeat_a");
        let messages = vec![
            StatMessage::packed(a, StatOperation::Leaf, 1, 10),
            StatMessage::packed(a, StatOperation::Leaf, 1, 15),
        ];
        let tree = RawStatStackNode::uncondense(&messages, None, None);
        let child = &tree.children[&a];
        assert_eq!(child.meta.call_count(), 2);
        assert_eq!(child.meta.duration(), 25);
        assert_eq!(child.meta.op, StatOperation::Set);
    }

    #[test]
    fn uncondense_collects_non_stack_stats() {
        let counter = StatName::new("uncondense_counter");
        let flags = crate::message::StatFlags::DUMMY_ALWAYS_ONE;
        let messages = vec![
            StatMessage::new(counter, StatOperation::Set, flags, StatValue::Int64(5)),
            StatMessage::new(counter, StatOperation::Add, flags, StatValue::Int64(3)),
        ];
        let mut non_stack = NonStackStats::new();
        let tree = RawStatStackNode::uncondense(&messages, None, Some(&mut non_stack));
        assert!(tree.children.is_empty());
        assert_eq!(non_stack[&counter].value, StatValue::Int64(8));
    }

    #[test]
    fn uncondense_respects_filter() {
        let mut encoded = Vec::new();
        sample_tree().encode(&mut encoded);
        let physics = StatName::new("Physics");
        let filter = |m: &StatMessage| m.name != physics;
        let tree = RawStatStackNode::uncondense(&encoded, Some(&filter as &dyn StatFilter), None);
        let tick = &tree.children[&StatName::new("GameThread")].children[&StatName::new("Tick")];
        assert!(tick.children.is_empty());
    }

    #[test]
    #[should_panic(expected = "unbalanced ChildrenEnd")]
    fn mismatched_children_end_panics() {
        let messages = vec![
            StatMessage::packed(StatName::new("open_a"), StatOperation::ChildrenStart, 1, 10),
            StatMessage::packed(StatName::new("close_b"), StatOperation::ChildrenEnd, 1, 10),
        ];
        RawStatStackNode::uncondense(&messages, None, None);
    }

    #[test]
    fn merge_add_then_divide_restores_values() {
        let tree = sample_tree();
        let mut sum = tree.clone();
        sum.merge_add(&tree);
        let thread = &sum.children[&StatName::new("GameThread")];
        assert_eq!(thread.meta.duration(), 2000);
        assert_eq!(thread.meta.call_count(), 2);
        sum.divide(2);
        assert_eq!(sum, tree);
    }

    #[test]
    fn merge_adds_missing_branches() {
        let mut a = with_children(node("merge_parent", 1, 100), vec![node("merge_x", 1, 50)]);
        let b = with_children(node("merge_parent", 1, 100), vec![node("merge_y", 1, 20)]);
        a.merge_add(&b);
        assert_eq!(a.children.len(), 2);
        assert_eq!(a.meta.duration(), 200);
    }

    #[test]
    fn merge_max_takes_larger_fields() {
        let mut a = with_children(node("mm_parent", 1, 100), vec![node("mm_x", 3, 50)]);
        let b = with_children(node("mm_parent", 2, 80), vec![node("mm_x", 1, 70)]);
        a.merge_max(&b);
        assert_eq!(a.meta.call_count(), 2);
        assert_eq!(a.meta.duration(), 100);
        let x = &a.children[&StatName::new("mm_x")];
        assert_eq!((x.meta.call_count(), x.meta.duration()), (3, 70));
    }

    #[test]
    fn cull_by_cycles_buckets_short_children() {
        let mut parent = with_children(
            node("cull_parent", 1, 1000),
            vec![node("cull_big", 1, 800), node("cull_s1", 1, 30), node("cull_s2", 2, 20)],
        );
        let before = parent.child_cycles();
        parent.cull_by_cycles(100);
        assert_eq!(parent.children.len(), 2);
        let other = &parent.children[&StatName::new(crate::name::OTHER_CHILDREN)];
        assert_eq!(other.meta.duration(), 50);
        assert_eq!(other.meta.call_count(), 3);
        assert!(parent.child_cycles() <= before);
    }

    #[test]
    fn cull_by_cycles_single_child_drops_its_subtree() {
        let mut parent = with_children(
            node("single_parent", 1, 1000),
            vec![with_children(node("single_child", 1, 10), vec![node("grandchild", 1, 5)])],
        );
        parent.cull_by_cycles(100);
        let child = &parent.children[&StatName::new("single_child")];
        assert!(child.children.is_empty());
        assert!(!parent.children.contains_key(&StatName::new(crate::name::OTHER_CHILDREN)));
    }

    #[test]
    fn cull_by_depth_truncates() {
        let mut tree = sample_tree();
        tree.cull_by_depth(2);
        let thread = &tree.children[&StatName::new("GameThread")];
        let tick = &thread.children[&StatName::new("Tick")];
        assert!(tick.children.is_empty());
        assert_eq!(thread.children.len(), 2);
    }

    #[test]
    fn add_self_records_uncovered_time() {
        let mut tree = sample_tree();
        tree.add_self();
        let thread = &tree.children[&StatName::new("GameThread")];
        let own = &thread.children[&StatName::new(crate::name::SELF_NAME)];
        assert_eq!(own.meta.duration(), 100);
        assert_eq!(own.meta.call_count(), 1);
        let render = &thread.children[&StatName::new("Render")];
        assert!(render.children.is_empty(), "leaves get no Self child");
    }

    #[test]
    fn add_self_skips_fully_covered_nodes() {
        let mut parent = with_children(node("covered", 1, 100), vec![node("covered_child", 1, 100)]);
        parent.add_self();
        assert_eq!(parent.children.len(), 1);
    }

    #[test]
    fn name_hierarchy_groups_common_prefixes() {
        let mut parent = with_children(
            node("hier_parent", 1, 1000),
            vec![
                node("Anim.Update.Bones", 1, 100),
                node("Anim.Update.Curves", 1, 50),
                node("Anim.Blend", 1, 25),
                node("Audio", 1, 10),
            ],
        );
        parent.add_name_hierarchy();
        let folder = &parent.children[&StatName::new("NameFolder//Anim...")];
        assert_eq!(folder.meta.duration(), 175);
        assert_eq!(folder.meta.call_count(), 3);
        let inner = &folder.children[&StatName::new("NameFolder//Anim.Update...")];
        assert_eq!(inner.meta.duration(), 150);
        assert!(parent.children.contains_key(&StatName::new("Audio")));
        assert_eq!(parent.child_cycles(), 185);
    }

    #[test]
    fn name_hierarchy_is_idempotent() {
        let mut once = with_children(
            node("idem_parent", 1, 1000),
            vec![
                node("Net/Send/Packets", 1, 100),
                node("Net/Send/Acks", 1, 50),
                node("Net/Recv", 1, 25),
                node("Script.Tick", 1, 10),
                node("Script.Gc", 1, 5),
            ],
        );
        once.add_name_hierarchy();
        let mut twice = once.clone();
        twice.add_name_hierarchy();
        assert_eq!(twice, once);
    }

    #[test]
    fn folder_depth_counts_prefix_parts() {
        assert_eq!(folder_depth("NameFolder//a.b.."), 2);
        assert_eq!(folder_depth("NameFolder//a.."), 1);
        assert_eq!(folder_depth("Tick"), 0);
    }
}
