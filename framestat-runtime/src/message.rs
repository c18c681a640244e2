//! Named-value stat records.
//!
//! A `StatMessage` is one record flowing from a producer thread to the stats
//! thread: a name, an operation, a flag set and a typed payload. Cycle stats
//! that have been paired into calls carry a packed `(call_count, duration)`
//! pair in a single `i64`: call count in the upper 32 bits, duration (raw
//! cycles) in the lower 32. Arithmetic on packed values is field-wise and
//! saturating, so one half never bleeds into the other.

use std::cmp::Ordering;
use std::collections::HashMap;

use bitflags::bitflags;

use crate::name::StatName;

/// Payload type. Encoded as 3 bits in the info word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    None = 1,
    Int64 = 2,
    Double = 3,
    Name = 4,
    Ptr = 5,
}

impl DataType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(DataType::None),
            2 => Some(DataType::Int64),
            3 => Some(DataType::Double),
            4 => Some(DataType::Name),
            5 => Some(DataType::Ptr),
            _ => None,
        }
    }
}

/// What a record asks the stats thread to do. Encoded as 4 bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatOperation {
    Invalid = 0,
    SetLongName = 1,
    AdvanceFrameGameThread = 2,
    AdvanceFrameRenderThread = 3,
    CycleScopeStart = 4,
    CycleScopeEnd = 5,
    SpecialMessageMarker = 6,
    Set = 7,
    Clear = 8,
    Add = 9,
    Subtract = 10,
    ChildrenStart = 11,
    ChildrenEnd = 12,
    Leaf = 13,
    MaxVal = 14,
    Memory = 15,
}

impl StatOperation {
    pub fn from_bits(bits: u8) -> Self {
        use StatOperation::*;
        match bits {
            1 => SetLongName,
            2 => AdvanceFrameGameThread,
            3 => AdvanceFrameRenderThread,
            4 => CycleScopeStart,
            5 => CycleScopeEnd,
            6 => SpecialMessageMarker,
            7 => Set,
            8 => Clear,
            9 => Add,
            10 => Subtract,
            11 => ChildrenStart,
            12 => ChildrenEnd,
            13 => Leaf,
            14 => MaxVal,
            15 => Memory,
            _ => Invalid,
        }
    }

    /// Operations that only make sense inside a call stack.
    pub fn is_scope(self) -> bool {
        matches!(
            self,
            StatOperation::CycleScopeStart
                | StatOperation::CycleScopeEnd
                | StatOperation::ChildrenStart
                | StatOperation::ChildrenEnd
                | StatOperation::Leaf
                | StatOperation::AdvanceFrameGameThread
                | StatOperation::AdvanceFrameRenderThread
        )
    }

    /// Operations that fold into a running value.
    pub fn is_accumulating(self) -> bool {
        matches!(
            self,
            StatOperation::Set
                | StatOperation::Clear
                | StatOperation::Add
                | StatOperation::Subtract
                | StatOperation::MaxVal
        )
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct StatFlags: u8 {
        const DUMMY_ALWAYS_ONE = 0x01;
        const IS_CYCLE = 0x04;
        const IS_MEMORY = 0x08;
        const IS_PACKED_CALL_COUNT_AND_DURATION = 0x10;
        const SHOULD_CLEAR_EVERY_FRAME = 0x20;
        const SENDING_NAME = 0x40;
    }
}

impl StatFlags {
    pub fn cycle() -> Self {
        StatFlags::DUMMY_ALWAYS_ONE | StatFlags::IS_CYCLE | StatFlags::SHOULD_CLEAR_EVERY_FRAME
    }

    pub fn packed_cycle() -> Self {
        Self::cycle() | StatFlags::IS_PACKED_CALL_COUNT_AND_DURATION
    }
}

/// Typed payload. The variant is the record's data type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StatValue {
    None,
    Int64(i64),
    Double(f64),
    Name(StatName),
    Ptr(u64),
}

impl StatValue {
    pub fn data_type(&self) -> DataType {
        match self {
            StatValue::None => DataType::None,
            StatValue::Int64(_) => DataType::Int64,
            StatValue::Double(_) => DataType::Double,
            StatValue::Name(_) => DataType::Name,
            StatValue::Ptr(_) => DataType::Ptr,
        }
    }

    fn zero(data_type: DataType) -> Self {
        match data_type {
            DataType::None => StatValue::None,
            DataType::Int64 => StatValue::Int64(0),
            DataType::Double => StatValue::Double(0.0),
            DataType::Name => StatValue::Name(StatName::NONE),
            DataType::Ptr => StatValue::Ptr(0),
        }
    }
}

#[inline]
pub fn pack_call_count_duration(call_count: u32, duration: u32) -> i64 {
    ((call_count as i64) << 32) | duration as i64
}

#[inline]
pub fn unpack_call_count(packed: i64) -> u32 {
    (packed >> 32) as u32
}

#[inline]
pub fn unpack_duration(packed: i64) -> u32 {
    packed as u32
}

/// Payload of an event wait/trigger marker: event id in the upper half,
/// cycles in the lower.
#[inline]
pub fn pack_event(event_id: u32, cycles: u32) -> u64 {
    ((event_id as u64) << 32) | cycles as u64
}

const TYPE_SHIFT: u32 = 0;
const OP_SHIFT: u32 = 3;
const FLAGS_SHIFT: u32 = 7;

/// Info word written next to every name in the stream: 3 bits data type,
/// 4 bits operation, 8 bits flags.
pub fn pack_info(data_type: DataType, op: StatOperation, flags: StatFlags) -> u32 {
    ((data_type as u32) << TYPE_SHIFT) | ((op as u32) << OP_SHIFT) | ((flags.bits() as u32) << FLAGS_SHIFT)
}

pub fn unpack_info(info: u32) -> (Option<DataType>, StatOperation, StatFlags) {
    let data_type = DataType::from_bits(((info >> TYPE_SHIFT) & 0x7) as u8);
    let op = StatOperation::from_bits(((info >> OP_SHIFT) & 0xF) as u8);
    let flags = StatFlags::from_bits_truncate(((info >> FLAGS_SHIFT) & 0xFF) as u8);
    (data_type, op, flags)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatMessage {
    pub name: StatName,
    pub op: StatOperation,
    pub flags: StatFlags,
    pub value: StatValue,
}

impl StatMessage {
    pub fn new(name: StatName, op: StatOperation, flags: StatFlags, value: StatValue) -> Self {
        Self {
            name,
            op,
            flags,
            value,
        }
    }

    pub fn cycle_scope_start(name: StatName, cycles: i64) -> Self {
        Self::new(
            name,
            StatOperation::CycleScopeStart,
            StatFlags::cycle(),
            StatValue::Int64(cycles),
        )
    }

    pub fn cycle_scope_end(name: StatName, cycles: i64) -> Self {
        Self::new(
            name,
            StatOperation::CycleScopeEnd,
            StatFlags::cycle(),
            StatValue::Int64(cycles),
        )
    }

    /// A paired call record: `call_count` calls totalling `duration` cycles.
    pub fn packed(name: StatName, op: StatOperation, call_count: u32, duration: u32) -> Self {
        Self::new(
            name,
            op,
            StatFlags::packed_cycle(),
            StatValue::Int64(pack_call_count_duration(call_count, duration)),
        )
    }

    pub fn advance_frame(op: StatOperation, frame: i64) -> Self {
        debug_assert!(matches!(
            op,
            StatOperation::AdvanceFrameGameThread | StatOperation::AdvanceFrameRenderThread
        ));
        Self::new(
            crate::name::well_known().advance_frame,
            op,
            StatFlags::DUMMY_ALWAYS_ONE | StatFlags::SHOULD_CLEAR_EVERY_FRAME,
            StatValue::Int64(frame),
        )
    }

    /// Combine a matched start/end pair into one call.
    pub fn compute_call(start: &StatMessage, end: &StatMessage) -> Self {
        let cycles = end.i64_value().saturating_sub(start.i64_value());
        let duration = cycles.clamp(0, u32::MAX as i64) as u32;
        let mut call = *start;
        call.op = StatOperation::Set;
        call.flags |= StatFlags::IS_PACKED_CALL_COUNT_AND_DURATION;
        call.value = StatValue::Int64(pack_call_count_duration(1, duration));
        call
    }

    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }

    pub fn is_packed(&self) -> bool {
        self.flags
            .contains(StatFlags::IS_PACKED_CALL_COUNT_AND_DURATION)
    }

    pub fn is_cycle(&self) -> bool {
        self.flags.contains(StatFlags::IS_CYCLE)
    }

    pub fn should_clear_every_frame(&self) -> bool {
        self.flags.contains(StatFlags::SHOULD_CLEAR_EVERY_FRAME)
    }

    pub fn info_bits(&self) -> u32 {
        pack_info(self.data_type(), self.op, self.flags)
    }

    pub fn i64_value(&self) -> i64 {
        match self.value {
            StatValue::Int64(v) => v,
            _ => 0,
        }
    }

    pub fn f64_value(&self) -> f64 {
        match self.value {
            StatValue::Double(v) => v,
            StatValue::Int64(v) => v as f64,
            _ => 0.0,
        }
    }

    pub fn ptr_value(&self) -> u64 {
        match self.value {
            StatValue::Ptr(v) => v,
            _ => 0,
        }
    }

    /// Call count of a packed record; zero otherwise.
    pub fn call_count(&self) -> u32 {
        if self.is_packed() {
            unpack_call_count(self.i64_value())
        } else {
            0
        }
    }

    /// Duration in cycles: the packed duration, or the raw value of an
    /// unpacked cycle stat.
    pub fn duration(&self) -> u32 {
        if self.is_packed() {
            unpack_duration(self.i64_value())
        } else if self.is_cycle() {
            self.i64_value().clamp(0, u32::MAX as i64) as u32
        } else {
            0
        }
    }

    /// Reset the payload to zero, keeping the data type.
    pub fn clear(&mut self) {
        self.value = StatValue::zero(self.data_type());
    }

    /// Fold `item` into `self` with `op` (or the item's own operation).
    ///
    /// Panics when the names, data types or packing differ.
    pub fn accumulate(&mut self, item: &StatMessage, op: Option<StatOperation>) {
        assert_eq!(
            self.name, item.name,
            "accumulating {} into {}",
            item.name, self.name
        );
        self.accumulate_renamed(item, op);
    }

    /// Like `accumulate`, but `item` may carry a different name (folder and
    /// bucket nodes).
    pub fn accumulate_renamed(&mut self, item: &StatMessage, op: Option<StatOperation>) {
        assert_eq!(
            self.data_type(),
            item.data_type(),
            "data type mismatch accumulating {} into {}",
            item.name,
            self.name
        );
        assert_eq!(
            self.is_packed(),
            item.is_packed(),
            "packing mismatch accumulating {} into {}",
            item.name,
            self.name
        );
        let op = op.unwrap_or(item.op);
        let packed = self.is_packed();
        match (&mut self.value, item.value) {
            (StatValue::Int64(dest), StatValue::Int64(other)) => {
                *dest = accumulate_i64(*dest, other, op, packed);
            }
            (StatValue::Double(dest), StatValue::Double(other)) => {
                *dest = accumulate_f64(*dest, other, op);
            }
            _ => {}
        }
    }

    /// Divide the payload by `div` (frame averaging).
    pub fn divide(&mut self, div: u32) {
        assert!(div > 0, "dividing {} by zero", self.name);
        let packed = self.is_packed();
        let cycle = self.is_cycle();
        self.value = match self.value {
            StatValue::Int64(v) if packed => {
                let half = div / 2;
                let calls = ((unpack_call_count(v) as u64 + half as u64) / div as u64) as u32;
                let duration = ((unpack_duration(v) as u64 + half as u64) / div as u64) as u32;
                StatValue::Int64(pack_call_count_duration(calls, duration))
            }
            StatValue::Int64(v) if cycle => {
                let div = div as i64;
                StatValue::Int64(v.saturating_add(div - 1) / div)
            }
            StatValue::Int64(v) => StatValue::Double(v as f64 / div as f64),
            StatValue::Double(v) => StatValue::Double(v / div as f64),
            other => other,
        };
    }
}

fn accumulate_i64(dest: i64, other: i64, op: StatOperation, packed: bool) -> i64 {
    match op {
        StatOperation::Set => other,
        StatOperation::Clear => 0,
        StatOperation::Add if packed => pack_call_count_duration(
            unpack_call_count(dest).saturating_add(unpack_call_count(other)),
            unpack_duration(dest).saturating_add(unpack_duration(other)),
        ),
        StatOperation::Add => dest.saturating_add(other),
        // Subtract never touches the call count.
        StatOperation::Subtract if packed => pack_call_count_duration(
            unpack_call_count(dest),
            unpack_duration(dest).saturating_sub(unpack_duration(other)),
        ),
        StatOperation::Subtract => dest.saturating_sub(other),
        StatOperation::MaxVal if packed => pack_call_count_duration(
            unpack_call_count(dest).max(unpack_call_count(other)),
            unpack_duration(dest).max(unpack_duration(other)),
        ),
        StatOperation::MaxVal => dest.max(other),
        StatOperation::Memory => dest,
        other => panic!("cannot accumulate int64 with {other:?}"),
    }
}

fn accumulate_f64(dest: f64, other: f64, op: StatOperation) -> f64 {
    match op {
        StatOperation::Set => other,
        StatOperation::Clear => 0.0,
        StatOperation::Add => dest + other,
        StatOperation::Subtract => dest - other,
        StatOperation::MaxVal => dest.max(other),
        StatOperation::Memory => dest,
        other => panic!("cannot accumulate double with {other:?}"),
    }
}

/// Add every record of `src` into `dest`, matching by name.
pub fn add_merge_stat_array(dest: &mut Vec<StatMessage>, src: &[StatMessage]) {
    merge_stat_array(dest, src, StatOperation::Add);
}

/// Max every record of `src` into `dest`, matching by name.
pub fn max_merge_stat_array(dest: &mut Vec<StatMessage>, src: &[StatMessage]) {
    merge_stat_array(dest, src, StatOperation::MaxVal);
}

fn merge_stat_array(dest: &mut Vec<StatMessage>, src: &[StatMessage], op: StatOperation) {
    let mut positions: HashMap<StatName, usize> = dest
        .iter()
        .enumerate()
        .map(|(i, m)| (m.name, i))
        .collect();
    for item in src {
        if matches!(item.value, StatValue::None | StatValue::Name(_)) {
            continue;
        }
        match positions.get(&item.name) {
            Some(&i) => dest[i].accumulate(item, Some(op)),
            None => {
                positions.insert(item.name, dest.len());
                let mut copy = *item;
                copy.op = StatOperation::Set;
                dest.push(copy);
            }
        }
    }
}

pub fn divide_stat_array(stats: &mut [StatMessage], div: u32) {
    for stat in stats {
        if matches!(stat.value, StatValue::Int64(_) | StatValue::Double(_)) {
            stat.divide(div);
        }
    }
}

/// Order by inclusive duration descending, then call count descending,
/// then name ascending.
pub fn sort_by_duration(stats: &mut [StatMessage]) {
    stats.sort_by(compare_by_duration);
}

pub fn compare_by_duration(a: &StatMessage, b: &StatMessage) -> Ordering {
    duration_key(b)
        .total_cmp(&duration_key(a))
        .then_with(|| b.call_count().cmp(&a.call_count()))
        .then_with(|| a.name.cmp(&b.name))
}

fn duration_key(m: &StatMessage) -> f64 {
    if m.is_packed() || m.is_cycle() {
        m.duration() as f64
    } else {
        m.f64_value()
    }
}

/// Order by group, then short name.
pub fn sort_by_group(stats: &mut [StatMessage]) {
    stats.sort_by(|a, b| {
        let ga = crate::name::group_name_of(a.name.as_str()).unwrap_or("");
        let gb = crate::name::group_name_of(b.name.as_str()).unwrap_or("");
        ga.cmp(gb).then_with(|| {
            crate::name::short_name_of(a.name.as_str())
                .cmp(crate::name::short_name_of(b.name.as_str()))
        })
    });
}
