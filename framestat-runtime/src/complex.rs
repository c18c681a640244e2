//! Multi-frame stack trees with sum, average and max per node.
//!
//! Feed one `RawStatStackNode` per frame into `merge_add_and_max`, then
//! `divide` by the frame count to fill the averages. Exclusive values come
//! from each node's `Self` child (see `RawStatStackNode::add_self`).

use indexmap::IndexMap;

use crate::message::{StatMessage, StatOperation, StatValue};
use crate::name::{StatName, well_known};
use crate::stack::RawStatStackNode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComplexField {
    IncSum = 0,
    IncAve = 1,
    IncMax = 2,
    ExcAve = 3,
    ExcMax = 4,
}

const FIELD_COUNT: usize = 5;

/// A stat carrying several values of the same type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ComplexStatMessage {
    template: StatMessage,
    values: [StatValue; FIELD_COUNT],
}

impl ComplexStatMessage {
    /// All fields start at zero of `meta`'s data type.
    pub fn new(meta: &StatMessage) -> Self {
        let mut template = *meta;
        template.op = StatOperation::Set;
        template.clear();
        Self {
            template,
            values: [template.value; FIELD_COUNT],
        }
    }

    pub fn name(&self) -> StatName {
        self.template.name
    }

    /// The field as a plain record, for accessors and accumulation.
    pub fn field(&self, field: ComplexField) -> StatMessage {
        let mut message = self.template;
        message.value = self.values[field as usize];
        message
    }

    pub fn value(&self, field: ComplexField) -> StatValue {
        self.values[field as usize]
    }

    pub fn duration(&self, field: ComplexField) -> u32 {
        self.field(field).duration()
    }

    pub fn call_count(&self, field: ComplexField) -> u32 {
        self.field(field).call_count()
    }

    fn accumulate_field(&mut self, field: ComplexField, item: &StatMessage, op: StatOperation) {
        let mut message = self.field(field);
        message.accumulate_renamed(item, Some(op));
        self.values[field as usize] = message.value;
    }

    /// IncSum += item, IncMax = max(IncMax, item).
    pub fn merge_add_and_max(&mut self, item: &StatMessage) {
        if matches!(self.template.value, StatValue::None | StatValue::Name(_)) {
            return;
        }
        self.accumulate_field(ComplexField::IncSum, item, StatOperation::Add);
        self.accumulate_field(ComplexField::IncMax, item, StatOperation::MaxVal);
    }

    /// IncAve = IncSum / div.
    pub fn divide(&mut self, div: u32) {
        if matches!(self.template.value, StatValue::None | StatValue::Name(_)) {
            return;
        }
        let mut average = self.field(ComplexField::IncSum);
        average.divide(div);
        self.values[ComplexField::IncAve as usize] = average.value;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComplexRawStatStackNode {
    pub complex: ComplexStatMessage,
    pub children: IndexMap<StatName, ComplexRawStatStackNode>,
}

impl ComplexRawStatStackNode {
    /// Same shape as `raw`, all values zero.
    pub fn from_raw(raw: &RawStatStackNode) -> Self {
        Self {
            complex: ComplexStatMessage::new(&raw.meta),
            children: raw
                .children
                .iter()
                .map(|(name, child)| (*name, Self::from_raw(child)))
                .collect(),
        }
    }

    pub fn merge_add_and_max(&mut self, raw: &RawStatStackNode) {
        self.complex.merge_add_and_max(&raw.meta);
        for (name, raw_child) in &raw.children {
            self.children
                .entry(*name)
                .or_insert_with(|| Self::from_raw_shallow(raw_child))
                .merge_add_and_max(raw_child);
        }
    }

    fn from_raw_shallow(raw: &RawStatStackNode) -> Self {
        Self {
            complex: ComplexStatMessage::new(&raw.meta),
            children: IndexMap::new(),
        }
    }

    pub fn divide(&mut self, div: u32) {
        self.complex.divide(div);
        for child in self.children.values_mut() {
            child.divide(div);
        }
    }

    /// Drop children whose average inclusive time is below `min_cycles`.
    pub fn cull_by_cycles(&mut self, min_cycles: i64) {
        self.children
            .retain(|_, child| child.complex.duration(ComplexField::IncAve) as i64 >= min_cycles);
        for child in self.children.values_mut() {
            child.cull_by_cycles(min_cycles);
        }
    }

    pub fn cull_by_depth(&mut self, levels: u32) {
        if levels == 0 {
            self.children.clear();
            return;
        }
        for child in self.children.values_mut() {
            child.cull_by_depth(levels - 1);
        }
    }

    /// ExcAve/ExcMax of a node are the IncAve/IncMax of its `Self` child.
    pub fn copy_exclusives_from_self(&mut self) {
        if self.children.is_empty() {
            return;
        }
        if let Some(own) = self.children.get(&well_known().self_) {
            let ave = own.complex.value(ComplexField::IncAve);
            let max = own.complex.value(ComplexField::IncMax);
            self.complex.values[ComplexField::ExcAve as usize] = ave;
            self.complex.values[ComplexField::ExcMax as usize] = max;
        }
        for child in self.children.values_mut() {
            child.copy_exclusives_from_self();
        }
    }
}
