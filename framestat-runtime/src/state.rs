//! Frame reconstruction and history on the stats thread.
//!
//! Producers send packets whose frame is only tentative: game and renderer
//! packets get their frame from the advance-frame markers seen so far, and
//! the renderer usually lags the game thread by a frame or more.
//! `StatsThreadState` files packets by frame, waits until every counted
//! thread type has moved past a frame, then folds the frame's non-clearing
//! stats, marks it good or bad, and tells listeners about it.
//!
//! Frame lifecycle:
//!
//! ```text
//! Pending -> Complete -> Good (broadcast) -> Evicted
//!                     -> Bad               -> Evicted
//! ```
//!
//! A frame is Bad when the producer flagged it (negative marker), when the
//! counter skipped over it, or when no game-thread packet arrived for it.
//! Once the newest finished frame is more than `history_frames` ahead, a
//! frame is dropped from every per-frame structure in one step.
//!
//! The state is `Send` but not `Sync`: it belongs to the one stats thread.
//! Condensed frames and event history are caches filled in lazily through
//! `&self` queries, hence the `RefCell`s.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc;

use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use crate::config::StatsConfig;
use crate::error::{Result, StatsError};
use crate::message::{
    StatFlags, StatMessage, StatOperation, StatValue, pack_call_count_duration, sort_by_duration,
};
use crate::name::{
    GAME_THREAD, RENDER_THREAD, StatName, long_name, parse_thread_id, thread_description,
    well_known,
};
use crate::packet::{PacketArray, StatPacket, ThreadType};
use crate::stack::{NonStackStats, RawStatStackNode, StatFilter, add_non_stack_stat, keeps};

/// Callback run on the stats thread for every newly valid frame.
pub type NewFrameListener = Box<dyn FnMut(i64, &StatsThreadState) + Send>;

/// Callback receiving packets while raw stats are active.
pub type RawPacketListener = Box<dyn FnMut(&StatPacket) + Send>;

/// Per-thread aggregates keyed by thread name.
pub type ThreadBreakdown = IndexMap<StatName, Vec<StatMessage>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An advance-frame marker's value.
///
/// Producers flag the frame they are leaving as bad by sending the new
/// frame number negated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameAdvance {
    pub frame: i64,
    pub previous_bad: bool,
}

impl FrameAdvance {
    pub fn decode(value: i64) -> Self {
        Self {
            frame: value.saturating_abs(),
            previous_bad: value < 0,
        }
    }

    pub fn encode(self) -> i64 {
        if self.previous_bad {
            -self.frame
        } else {
            self.frame
        }
    }
}

/// A wait/trigger pair on one event id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventData {
    pub wait_stack: Vec<StatName>,
    pub trigger_stack: Vec<StatName>,
    pub wait_cycles: Option<u32>,
    pub trigger_cycles: Option<u32>,
    pub frame: i64,
}

impl EventData {
    pub fn has_valid_stacks(&self) -> bool {
        !self.wait_stack.is_empty() && !self.trigger_stack.is_empty()
    }

    /// Cycles between the wait and the trigger, when both were seen.
    pub fn duration(&self) -> u32 {
        match (self.wait_cycles, self.trigger_cycles) {
            (Some(wait), Some(trigger)) => trigger.saturating_sub(wait),
            _ => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageUsage {
    /// Messages currently held in history.
    pub current: usize,
    pub max: usize,
    pub total: u64,
}

/// Frames present in each per-frame structure.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetainedFrames {
    pub history: Vec<i64>,
    pub condensed: Vec<i64>,
    pub good: Vec<i64>,
    pub bad: Vec<i64>,
    pub events: Vec<i64>,
}

pub struct StatsThreadState {
    history_frames: i64,
    frame_slop: i64,
    enabled: bool,

    current_game_frame: i64,
    current_render_frame: i64,
    render_thread_seen: bool,
    last_full_frame_meta_and_non_frame: i64,
    last_full_frame_processed: i64,

    history: BTreeMap<i64, PacketArray>,
    good_frames: BTreeSet<i64>,
    bad_frames: BTreeSet<i64>,
    condensed_stack_history: RefCell<BTreeMap<i64, Arc<[StatMessage]>>>,
    events_history: RefCell<HashMap<u32, EventData>>,

    not_cleared_every_frame: IndexMap<StatName, StatMessage>,
    short_name_to_long_name: IndexMap<StatName, StatMessage>,
    groups: BTreeMap<StatName, BTreeSet<StatName>>,
    threads: BTreeMap<u32, StatName>,
    warned_threads: RefCell<HashSet<u32>>,

    listeners: Vec<(ListenerId, NewFrameListener)>,
    next_listener_id: u64,
    subscribers: Vec<mpsc::Sender<i64>>,

    raw_stats_active: bool,
    raw_listener: Option<RawPacketListener>,
    startup_raw_packets: Vec<StatPacket>,

    find_memory_extensive_stats: bool,
    usage: MessageUsage,
}

impl StatsThreadState {
    pub fn new(config: &StatsConfig) -> Self {
        Self {
            history_frames: config.history_frames as i64,
            frame_slop: config.frame_slop,
            enabled: true,
            current_game_frame: 1,
            current_render_frame: 1,
            render_thread_seen: false,
            last_full_frame_meta_and_non_frame: 0,
            last_full_frame_processed: 0,
            history: BTreeMap::new(),
            good_frames: BTreeSet::new(),
            bad_frames: BTreeSet::new(),
            condensed_stack_history: RefCell::new(BTreeMap::new()),
            events_history: RefCell::new(HashMap::new()),
            not_cleared_every_frame: IndexMap::new(),
            short_name_to_long_name: IndexMap::new(),
            groups: BTreeMap::new(),
            threads: BTreeMap::new(),
            warned_threads: RefCell::new(HashSet::new()),
            listeners: Vec::new(),
            next_listener_id: 0,
            subscribers: Vec::new(),
            raw_stats_active: false,
            raw_listener: None,
            startup_raw_packets: Vec::new(),
            find_memory_extensive_stats: false,
            usage: MessageUsage::default(),
        }
    }

    /// State fed from a capture file instead of live producers. Frames
    /// arrive already condensed and are never evicted.
    pub fn for_loading() -> Self {
        let mut state = Self::new(&StatsConfig::default());
        state.history_frames = i64::MAX;
        state
    }

    pub fn history_frames(&self) -> i64 {
        self.history_frames
    }

    pub fn current_game_frame(&self) -> i64 {
        self.current_game_frame
    }

    pub fn current_render_frame(&self) -> i64 {
        self.current_render_frame
    }

    pub fn last_full_frame_processed(&self) -> i64 {
        self.last_full_frame_processed
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disabling drops all frame data and the stat registries; packets
    /// received while disabled are discarded without advancing frames.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.clear_frames();
        }
    }

    fn clear_frames(&mut self) {
        self.not_cleared_every_frame.clear();
        self.short_name_to_long_name.clear();
        self.groups.clear();
        self.history.clear();
        self.good_frames.clear();
        self.bad_frames.clear();
        self.condensed_stack_history.get_mut().clear();
        self.events_history.get_mut().clear();
        self.usage.current = 0;
    }

    /// Assign frames and ingest a batch of packets; returns the frames that
    /// became valid.
    pub fn process_packets(&mut self, mut packets: PacketArray) -> Vec<i64> {
        if !self.enabled {
            self.clear_frames();
            return Vec::new();
        }
        self.scan_for_advance(&mut packets);
        if self.raw_stats_active {
            self.process_raw_stats(packets);
            return Vec::new();
        }
        self.add_to_history_and_empty(packets)
    }

    /// Assign game and renderer packets their thread type's current frame,
    /// then apply the advance markers each packet carries.
    pub fn scan_for_advance(&mut self, packets: &mut PacketArray) {
        for packet in &mut packets.packets {
            match packet.thread_type {
                ThreadType::Game => packet.frame = self.current_game_frame,
                ThreadType::Renderer => {
                    self.render_thread_seen = true;
                    packet.frame = self.current_render_frame;
                }
                ThreadType::Other => {}
            }
            for item in &packet.messages {
                match item.op {
                    StatOperation::AdvanceFrameGameThread => {
                        self.advance(ThreadType::Game, FrameAdvance::decode(item.i64_value()));
                    }
                    StatOperation::AdvanceFrameRenderThread => {
                        self.render_thread_seen = true;
                        self.advance(ThreadType::Renderer, FrameAdvance::decode(item.i64_value()));
                    }
                    _ => {}
                }
            }
        }
    }

    fn advance(&mut self, thread: ThreadType, advance: FrameAdvance) {
        if advance.previous_bad {
            self.bad_frames.insert(advance.frame - 1);
        }
        let slop = self.frame_slop;
        let current = match thread {
            ThreadType::Renderer => &mut self.current_render_frame,
            _ => &mut self.current_game_frame,
        };
        if advance.frame <= *current {
            warn!(
                ?thread,
                frame = advance.frame,
                current = *current,
                "ignoring advance to a frame that is not ahead"
            );
            return;
        }
        let from = *current;
        *current = advance.frame;
        if from > slop && advance.frame > from + 1 {
            warn!(
                ?thread,
                from,
                to = advance.frame,
                "frame counter skipped; marking skipped frames bad"
            );
            self.bad_frames.extend(from + 1..advance.frame);
        }
    }

    /// Newest frame every counted thread type has moved past.
    pub fn latest_finished_frame(&self) -> i64 {
        let frontier = if self.render_thread_seen {
            self.current_game_frame.min(self.current_render_frame)
        } else {
            self.current_game_frame
        };
        frontier - 1
    }

    /// File packets under their frames and complete every frame that can
    /// be completed.
    pub fn add_to_history_and_empty(&mut self, packets: PacketArray) -> Vec<i64> {
        if !self.enabled {
            self.clear_frames();
            return Vec::new();
        }

        for mut packet in packets {
            self.usage.total += packet.messages.len() as u64;
            self.extract_metadata(&mut packet.messages);
            if packet.frame <= self.last_full_frame_meta_and_non_frame {
                debug!(
                    frame = packet.frame,
                    thread_id = packet.thread_id,
                    "late packet for a completed frame"
                );
                self.process_non_frame_stats(&mut packet.messages, None);
            }
            self.history.entry(packet.frame).or_default().push(packet);
        }

        let latest_finished = self.latest_finished_frame();
        while self.last_full_frame_meta_and_non_frame < latest_finished {
            let frame = self.last_full_frame_meta_and_non_frame + 1;
            self.complete_frame(frame);
            self.last_full_frame_meta_and_non_frame = frame;
        }

        let ready = self.broadcast_ready_frames();
        self.evict(latest_finished.saturating_sub(self.history_frames));
        self.update_usage();
        ready
    }

    fn complete_frame(&mut self, frame: i64) {
        let Some(mut frame_packets) = self.history.remove(&frame) else {
            debug!(frame, "no packets for frame");
            return;
        };
        let mut found = HashSet::new();
        for packet in &mut frame_packets.packets {
            self.process_non_frame_stats(&mut packet.messages, Some(&mut found));
        }

        let game_header = frame_packets
            .iter()
            .find(|p| p.thread_type == ThreadType::Game)
            .map(StatPacket::clone_header);
        match game_header {
            Some(mut header) if !self.bad_frames.contains(&frame) => {
                header.messages = self
                    .not_cleared_every_frame
                    .iter()
                    .filter(|(name, _)| !found.contains(*name))
                    .map(|(_, stat)| *stat)
                    .collect();
                frame_packets.push(header);
                self.good_frames.insert(frame);
            }
            Some(_) => debug!(frame, "bad frame"),
            None => {
                debug!(frame, "no game thread packet; frame is not valid");
            }
        }

        if self.find_memory_extensive_stats {
            log_memory_extensive_stats(frame, &frame_packets);
        }
        self.history.insert(frame, frame_packets);
    }

    fn broadcast_ready_frames(&mut self) -> Vec<i64> {
        let (Some(oldest), Some(latest)) = (self.oldest_valid_frame(), self.latest_valid_frame())
        else {
            return Vec::new();
        };
        let first = oldest.max(self.last_full_frame_processed + 1);
        let ready: Vec<i64> = (first..=latest).filter(|f| self.is_frame_valid(*f)).collect();
        if latest > self.last_full_frame_processed {
            self.last_full_frame_processed = latest;
        }
        for &frame in &ready {
            debug!(frame, "new frame");
            self.notify_new_frame(frame);
        }
        ready
    }

    fn notify_new_frame(&mut self, frame: i64) {
        let mut listeners = std::mem::take(&mut self.listeners);
        for (_, listener) in listeners.iter_mut() {
            listener(frame, self);
        }
        self.listeners = listeners;
        self.subscribers.retain(|tx| tx.send(frame).is_ok());
    }

    /// Drop every frame older than `min_frame_to_keep` that has been fully
    /// processed, from all per-frame structures at once.
    fn evict(&mut self, min_frame_to_keep: i64) {
        let cutoff = min_frame_to_keep.min(self.last_full_frame_meta_and_non_frame + 1);
        self.history = self.history.split_off(&cutoff);
        self.good_frames = self.good_frames.split_off(&cutoff);
        self.bad_frames = self.bad_frames.split_off(&cutoff);
        let condensed = self.condensed_stack_history.get_mut();
        *condensed = condensed.split_off(&cutoff);
        self.events_history
            .get_mut()
            .retain(|_, event| event.frame >= cutoff);
    }

    fn update_usage(&mut self) {
        self.usage.current = self.history.values().map(PacketArray::message_count).sum();
        self.usage.max = self.usage.max.max(self.usage.current);
    }

    pub fn message_usage(&self) -> MessageUsage {
        self.usage
    }

    fn extract_metadata(&mut self, messages: &mut Vec<StatMessage>) {
        if !messages.iter().any(|m| m.op == StatOperation::SetLongName) {
            return;
        }
        messages.retain(|m| {
            if m.op == StatOperation::SetLongName {
                self.find_or_add_metadata(m);
                false
            } else {
                true
            }
        });
    }

    /// Register only the `SetLongName` records of `messages`.
    pub fn process_metadata_only(&mut self, messages: &[StatMessage]) {
        for item in messages {
            if item.op == StatOperation::SetLongName {
                self.find_or_add_metadata(item);
            }
        }
    }

    /// Register a stat's long name, group membership, thread id, and
    /// permanent accumulator.
    pub fn find_or_add_metadata(&mut self, item: &StatMessage) {
        let wk = well_known();
        let long = item.name;
        let short = long.short_name();
        if let Some(existing) = self.short_name_to_long_name.get(&short) {
            if existing.name != long || existing.data_type() != item.data_type() {
                warn!(
                    %short,
                    existing = %existing.name,
                    new = %long,
                    "metadata mismatch; keeping the first registration"
                );
            }
            return;
        }

        let mut meta = *item;
        meta.op = StatOperation::Set;
        meta.flags.remove(StatFlags::SENDING_NAME);
        meta.clear();
        self.short_name_to_long_name.insert(short, meta);

        let group = long.group_name();
        if let Some(group) = group {
            self.groups.entry(group).or_default().insert(short);
            if group == wk.threads_group
                && let Some(thread_id) = long.description().and_then(parse_thread_id)
            {
                self.threads.insert(thread_id, short);
            }
        }

        if !meta.should_clear_every_frame()
            && group != Some(wk.groups_group)
            && group != Some(wk.threads_group)
            && matches!(meta.value, StatValue::Int64(_) | StatValue::Double(_))
        {
            self.not_cleared_every_frame.insert(long, meta);
        }
    }

    pub fn short_name_to_long_name(&self) -> &IndexMap<StatName, StatMessage> {
        &self.short_name_to_long_name
    }

    pub fn groups(&self) -> &BTreeMap<StatName, BTreeSet<StatName>> {
        &self.groups
    }

    pub fn threads(&self) -> &BTreeMap<u32, StatName> {
        &self.threads
    }

    pub fn not_cleared_every_frame(&self) -> &IndexMap<StatName, StatMessage> {
        &self.not_cleared_every_frame
    }

    /// Fold records of stats that are not cleared every frame into their
    /// permanent totals, rewriting each record to the running total.
    ///
    /// Panics if such a record is used as a scope.
    pub fn process_non_frame_stats(
        &mut self,
        messages: &mut [StatMessage],
        mut found: Option<&mut HashSet<StatName>>,
    ) {
        for item in messages.iter_mut() {
            if item.should_clear_every_frame() {
                continue;
            }
            if item.op.is_scope() {
                panic!(
                    "stat {} is not cleared every frame but was sent as {:?}",
                    item.name, item.op
                );
            }
            if !item.op.is_accumulating() {
                continue;
            }
            let Some(total) = self.not_cleared_every_frame.get_mut(&item.name) else {
                error!(
                    stat = %item.name,
                    "stat has no metadata; its running total is lost"
                );
                continue;
            };
            total.accumulate(item, None);
            *item = *total;
            if let Some(found) = found.as_mut() {
                found.insert(item.name);
            }
        }
    }

    /// Zero the permanent totals of non-memory accumulators.
    pub fn reset_regular_stats(&mut self) {
        for stat in self.not_cleared_every_frame.values_mut() {
            if !stat.flags.contains(StatFlags::IS_MEMORY) {
                stat.clear();
            }
        }
    }

    /// Append zero-valued records for `enabled` short names missing from
    /// `dest`.
    pub fn add_missing_stats(&self, dest: &mut Vec<StatMessage>, enabled: &HashSet<StatName>) {
        let present: HashSet<StatName> = dest.iter().map(|m| m.name.short_name()).collect();
        for short in enabled {
            if present.contains(short) {
                continue;
            }
            if let Some(meta) = self.short_name_to_long_name.get(short) {
                let mut missing = *meta;
                if missing.is_cycle() && matches!(missing.value, StatValue::Int64(_)) {
                    missing.flags |= StatFlags::IS_PACKED_CALL_COUNT_AND_DURATION;
                }
                missing.clear();
                dest.push(missing);
            }
        }
    }

    pub fn is_frame_valid(&self, frame: i64) -> bool {
        self.good_frames.contains(&frame)
    }

    pub fn is_frame_bad(&self, frame: i64) -> bool {
        self.bad_frames.contains(&frame)
    }

    pub fn oldest_valid_frame(&self) -> Option<i64> {
        self.good_frames
            .iter()
            .copied()
            .find(|f| *f <= self.last_full_frame_meta_and_non_frame)
    }

    pub fn latest_valid_frame(&self) -> Option<i64> {
        self.good_frames
            .range(..=self.last_full_frame_meta_and_non_frame)
            .next_back()
            .copied()
    }

    /// Valid frames in ascending order.
    pub fn valid_frames(&self) -> Vec<i64> {
        self.good_frames
            .range(..=self.last_full_frame_meta_and_non_frame)
            .copied()
            .collect()
    }

    pub fn retained_frames(&self) -> RetainedFrames {
        let mut events: Vec<i64> = self
            .events_history
            .borrow()
            .values()
            .map(|e| e.frame)
            .collect();
        events.sort_unstable();
        events.dedup();
        RetainedFrames {
            history: self.history.keys().copied().collect(),
            condensed: self
                .condensed_stack_history
                .borrow()
                .keys()
                .copied()
                .collect(),
            good: self.good_frames.iter().copied().collect(),
            bad: self.bad_frames.iter().copied().collect(),
            events,
        }
    }

    pub fn frame_packets(&self, frame: i64) -> Option<&PacketArray> {
        self.history.get(&frame)
    }

    pub fn add_new_frame_listener(&mut self, listener: NewFrameListener) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_new_frame_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Receive each new valid frame number over a channel. The sender is
    /// dropped once the receiver goes away.
    pub fn subscribe(&mut self) -> mpsc::Receiver<i64> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Route packets to `listener` instead of the history. Packets that
    /// arrived before a listener was set are replayed to it first.
    pub fn set_raw_listener(&mut self, listener: Option<RawPacketListener>) {
        self.raw_listener = listener;
        if let Some(listener) = self.raw_listener.as_mut() {
            for packet in self.startup_raw_packets.drain(..) {
                listener(&packet);
            }
        }
    }

    pub fn set_raw_stats_active(&mut self, active: bool) {
        self.raw_stats_active = active;
        if !active {
            self.startup_raw_packets.clear();
        }
    }

    pub fn raw_stats_active(&self) -> bool {
        self.raw_stats_active
    }

    pub fn process_raw_stats(&mut self, packets: PacketArray) {
        for packet in packets {
            for item in &packet.messages {
                if item.op == StatOperation::SetLongName {
                    self.find_or_add_metadata(item);
                }
            }
            self.usage.total += packet.messages.len() as u64;
            match self.raw_listener.as_mut() {
                Some(listener) => listener(&packet),
                None => self.startup_raw_packets.push(packet),
            }
        }
    }

    pub fn toggle_find_memory_extensive_stats(&mut self) -> bool {
        self.find_memory_extensive_stats = !self.find_memory_extensive_stats;
        info!(
            enabled = self.find_memory_extensive_stats,
            "find memory extensive stats"
        );
        self.find_memory_extensive_stats
    }

    /// Message counts per stat for a frame, most frequent first.
    pub fn find_and_dump_memory_extensive_stats(&self, frame: i64) -> Vec<(StatName, usize)> {
        match self.history.get(&frame) {
            Some(packets) => log_memory_extensive_stats(frame, packets),
            None => Vec::new(),
        }
    }

    /// Last scope end minus first scope start, summed over the thread
    /// type's packets in `frame`.
    pub fn fast_thread_frame_time(&self, frame: i64, thread_type: ThreadType) -> i64 {
        self.fast_time(frame, |p| p.thread_type == thread_type)
    }

    pub fn fast_thread_frame_time_by_id(&self, frame: i64, thread_id: u32) -> i64 {
        self.fast_time(frame, |p| p.thread_id == thread_id)
    }

    fn fast_time(&self, frame: i64, pick: impl Fn(&StatPacket) -> bool) -> i64 {
        let Some(packets) = self.history.get(&frame) else {
            return 0;
        };
        packets
            .iter()
            .filter(|p| pick(p))
            .filter_map(|p| {
                let start = p
                    .messages
                    .iter()
                    .find(|m| m.op == StatOperation::CycleScopeStart)?;
                let end = p
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.op == StatOperation::CycleScopeEnd)?;
                Some((end.i64_value() - start.i64_value()).max(0))
            })
            .sum()
    }

    /// Seconds per cycle recorded with the frame, if the producer sent it.
    pub fn seconds_per_cycle(&self, frame: i64) -> Option<f64> {
        let wanted = well_known().seconds_per_cycle;
        let condensed = self.condensed_history(frame).ok()?;
        condensed
            .iter()
            .find(|m| m.name.short_name() == wanted && matches!(m.value, StatValue::Double(_)))
            .map(|m| m.f64_value())
    }

    fn thread_root_meta(&self, packet: &StatPacket) -> StatMessage {
        let short = match packet.thread_type {
            ThreadType::Game => GAME_THREAD.to_string(),
            ThreadType::Renderer => RENDER_THREAD.to_string(),
            ThreadType::Other => match self.threads.get(&packet.thread_id) {
                Some(name) => name.as_str().to_string(),
                None => {
                    if self.warned_threads.borrow_mut().insert(packet.thread_id) {
                        warn!(
                            thread_id = packet.thread_id,
                            "packet from a thread with no metadata"
                        );
                    }
                    format!("UnknownThread_{:x}", packet.thread_id)
                }
            },
        };
        let long = long_name(
            &short,
            Some(crate::name::THREADS_GROUP),
            Some(&thread_description(packet.thread_id)),
            None,
        );
        StatMessage::packed(StatName::new(&long), StatOperation::Set, 0, 0)
    }

    /// Build the frame's call tree from its raw packets: one child of the
    /// root per thread, scopes paired into calls.
    pub fn raw_stack_stats(
        &self,
        frame: i64,
        non_stack: Option<&mut NonStackStats>,
    ) -> RawStatStackNode {
        let mut root = RawStatStackNode::new_root();
        let mut scratch = NonStackStats::new();
        let non_stack = non_stack.unwrap_or(&mut scratch);
        let Some(packets) = self.history.get(&frame) else {
            return root;
        };
        let mut events = self.events_history.borrow_mut();
        for packet in packets {
            let meta = self.thread_root_meta(packet);
            let thread = root
                .children
                .entry(meta.name)
                .or_insert_with(|| RawStatStackNode::new(meta));
            let mut ctx = BuildContext {
                frame,
                path: vec![meta.name],
                non_stack: &mut *non_stack,
                events: &mut *events,
            };
            build_scope(thread, &mut packet.messages.iter(), &mut ctx, 0);
        }
        for thread in root.children.values_mut() {
            let total = thread.child_cycles().clamp(0, u32::MAX as i64) as u32;
            thread.meta.value = StatValue::Int64(pack_call_count_duration(1, total));
        }
        root
    }

    /// The frame as a flat sequence: both advance markers, the non-stack
    /// stats, then the encoded call tree.
    pub fn condense(&self, frame: i64) -> Vec<StatMessage> {
        let mut non_stack = NonStackStats::new();
        let root = self.raw_stack_stats(frame, Some(&mut non_stack));
        let mut out = Vec::with_capacity(2 + non_stack.len() + root.node_count() * 2);
        out.push(StatMessage::advance_frame(
            StatOperation::AdvanceFrameGameThread,
            frame,
        ));
        out.push(StatMessage::advance_frame(
            StatOperation::AdvanceFrameRenderThread,
            frame,
        ));
        out.extend(non_stack.values().copied());
        root.encode(&mut out);
        out
    }

    /// Condensed messages for a valid frame, computed on first request.
    pub fn condensed_history(&self, frame: i64) -> Result<Arc<[StatMessage]>> {
        if !self.is_frame_valid(frame) {
            return Err(StatsError::InvalidFrame(frame));
        }
        if let Some(cached) = self.condensed_stack_history.borrow().get(&frame) {
            return Ok(Arc::clone(cached));
        }
        let condensed: Arc<[StatMessage]> = self.condense(frame).into();
        self.condensed_stack_history
            .borrow_mut()
            .insert(frame, Arc::clone(&condensed));
        Ok(condensed)
    }

    pub fn uncondense_stack_stats(
        &self,
        frame: i64,
        filter: Option<&dyn StatFilter>,
        non_stack: Option<&mut NonStackStats>,
    ) -> Result<RawStatStackNode> {
        let condensed = self.condensed_history(frame)?;
        Ok(RawStatStackNode::uncondense(&condensed, filter, non_stack))
    }

    pub fn inclusive_aggregate_stack_stats(
        &self,
        frame: i64,
        filter: Option<&dyn StatFilter>,
        add_non_stack: bool,
        thread_breakdown: Option<&mut ThreadBreakdown>,
    ) -> Result<Vec<StatMessage>> {
        let condensed = self.condensed_history(frame)?;
        Ok(inclusive_aggregate(
            &condensed,
            filter,
            add_non_stack,
            thread_breakdown,
        ))
    }

    pub fn exclusive_aggregate_stack_stats(
        &self,
        frame: i64,
        filter: Option<&dyn StatFilter>,
        add_non_stack: bool,
    ) -> Result<Vec<StatMessage>> {
        let condensed = self.condensed_history(frame)?;
        Ok(exclusive_aggregate(&condensed, filter, add_non_stack))
    }

    /// Wait/trigger events recorded while building `frame`'s stack.
    pub fn events_for_frame(&self, frame: i64) -> Vec<(u32, EventData)> {
        let _ = self.condensed_history(frame);
        let mut events: Vec<(u32, EventData)> = self
            .events_history
            .borrow()
            .iter()
            .filter(|(_, e)| e.frame == frame)
            .map(|(id, e)| (*id, e.clone()))
            .collect();
        events.sort_by_key(|(id, _)| *id);
        events
    }

    /// Install an already-condensed frame (loaded captures).
    pub fn add_frame_from_condensed_messages(&mut self, frame: i64, mut messages: Vec<StatMessage>) {
        self.extract_metadata(&mut messages);
        self.usage.total += messages.len() as u64;
        self.condensed_stack_history
            .get_mut()
            .insert(frame, messages.into());
        self.good_frames.insert(frame);
        self.last_full_frame_meta_and_non_frame = self.last_full_frame_meta_and_non_frame.max(frame);
        self.last_full_frame_processed = self.last_full_frame_processed.max(frame);
        self.current_game_frame = self.current_game_frame.max(frame + 1);
        self.current_render_frame = self.current_render_frame.max(frame + 1);
        self.evict(frame.saturating_sub(self.history_frames));
    }
}

struct BuildContext<'a> {
    frame: i64,
    path: Vec<StatName>,
    non_stack: &'a mut NonStackStats,
    events: &'a mut HashMap<u32, EventData>,
}

impl BuildContext<'_> {
    fn record_event(&mut self, item: &StatMessage) {
        let wk = well_known();
        let short = item.name.short_name();
        let is_wait = short == wk.event_wait_with_id;
        if !is_wait && short != wk.event_trigger_with_id {
            return;
        }
        let payload = item.ptr_value();
        let event_id = (payload >> 32) as u32;
        let cycles = payload as u32;
        let event = self.events.entry(event_id).or_default();
        event.frame = self.frame;
        if is_wait {
            event.wait_stack = self.path.clone();
            event.wait_cycles = Some(cycles);
        } else {
            event.trigger_stack = self.path.clone();
            event.trigger_cycles = Some(cycles);
        }
    }
}

/// Walk one scope of a packet. Returns the matching scope end, or `None`
/// at a `ChildrenEnd` or the end of the packet.
fn build_scope(
    node: &mut RawStatStackNode,
    items: &mut std::slice::Iter<'_, StatMessage>,
    ctx: &mut BuildContext<'_>,
    depth: usize,
) -> Option<StatMessage> {
    let thread_root = well_known().thread_root;
    while let Some(item) = items.next() {
        match item.op {
            StatOperation::CycleScopeStart => {
                let child = node.children.entry(item.name).or_insert_with(|| {
                    let mut meta = *item;
                    meta.op = StatOperation::Set;
                    meta.flags |= StatFlags::IS_PACKED_CALL_COUNT_AND_DURATION;
                    meta.value = StatValue::Int64(0);
                    RawStatStackNode::new(meta)
                });
                ctx.path.push(item.name);
                let end = build_scope(child, items, ctx, depth + 1);
                ctx.path.pop();
                if let Some(end) = end {
                    let call = StatMessage::compute_call(item, &end);
                    child.meta.accumulate(&call, Some(StatOperation::Add));
                }
            }
            StatOperation::CycleScopeEnd => {
                if depth == 0 {
                    warn!(stat = %item.name, "scope end with no open scope");
                    continue;
                }
                if item.name != node.meta.name {
                    warn!(
                        stat = %item.name,
                        open = %node.meta.name,
                        "scope end does not match the open scope"
                    );
                }
                return Some(*item);
            }
            StatOperation::ChildrenStart if item.name != thread_root => {
                let child = node.accumulate_child(item);
                ctx.path.push(item.name);
                build_scope(child, items, ctx, depth + 1);
                ctx.path.pop();
                cover_children(child);
            }
            StatOperation::ChildrenEnd if item.name != thread_root => {
                if depth == 0 {
                    warn!(stat = %item.name, "children end with no open scope");
                    continue;
                }
                return None;
            }
            StatOperation::Leaf if item.name != thread_root => {
                node.accumulate_child(item);
            }
            StatOperation::SpecialMessageMarker => ctx.record_event(item),
            StatOperation::Memory => {}
            op if op.is_accumulating() => add_non_stack_stat(ctx.non_stack, item, op),
            _ => {}
        }
    }
    None
}

/// A pre-condensed scope is at least as long as its children.
fn cover_children(node: &mut RawStatStackNode) {
    if !node.meta.is_packed() {
        return;
    }
    let children = node.child_cycles().clamp(0, u32::MAX as i64) as u32;
    if node.meta.duration() < children {
        node.meta.value =
            StatValue::Int64(pack_call_count_duration(node.meta.call_count(), children));
    }
}

#[derive(Default)]
struct Timing {
    start_calls: u32,
    stop_calls: u32,
    recursion: u32,
}

fn cleared_packed(item: &StatMessage) -> StatMessage {
    let mut result = *item;
    result.op = StatOperation::Set;
    result.flags |= StatFlags::IS_PACKED_CALL_COUNT_AND_DURATION;
    result.clear();
    result
}

fn is_stack_record(item: &StatMessage) -> bool {
    matches!(
        item.op,
        StatOperation::ChildrenStart | StatOperation::ChildrenEnd | StatOperation::Leaf
    ) && item.is_cycle()
}

/// Inclusive time and call counts per stat for a condensed frame.
///
/// Recursive calls of a stat are counted once, at the outermost level.
/// With `thread_breakdown`, the same aggregate is also kept per thread.
pub fn inclusive_aggregate(
    condensed: &[StatMessage],
    filter: Option<&dyn StatFilter>,
    add_non_stack: bool,
    mut thread_breakdown: Option<&mut ThreadBreakdown>,
) -> Vec<StatMessage> {
    let mut totals: IndexMap<StatName, StatMessage> = IndexMap::new();
    let mut timing: HashMap<StatName, Timing> = HashMap::new();
    let mut per_thread: IndexMap<StatName, IndexMap<StatName, StatMessage>> = IndexMap::new();
    let mut current_thread: Option<StatName> = None;
    let mut depth = 0u32;

    for item in condensed {
        if is_stack_record(item) {
            if thread_breakdown.is_some() {
                match item.op {
                    StatOperation::ChildrenStart => {
                        if depth == 0 {
                            current_thread = Some(item.name);
                        }
                        depth += 1;
                    }
                    StatOperation::ChildrenEnd => {
                        depth = depth.saturating_sub(1);
                        if depth == 0 {
                            current_thread = None;
                        }
                    }
                    _ => {}
                }
            }
            if !keeps(filter, item) {
                continue;
            }
            let result = totals
                .entry(item.name)
                .or_insert_with(|| cleared_packed(item));
            let time = timing.entry(item.name).or_default();
            if item.op == StatOperation::ChildrenStart {
                time.start_calls += 1;
                time.recursion += 1;
                continue;
            }
            if item.op == StatOperation::ChildrenEnd {
                time.stop_calls += 1;
                time.recursion = time.recursion.saturating_sub(1);
            }
            if time.recursion == 0 {
                result.accumulate(item, Some(StatOperation::Add));
                if let Some(thread) = current_thread {
                    per_thread
                        .entry(thread)
                        .or_default()
                        .entry(item.name)
                        .or_insert_with(|| cleared_packed(item))
                        .accumulate(item, Some(StatOperation::Add));
                }
            }
        } else if add_non_stack && keeps(filter, item) {
            add_non_stack_stat(&mut totals, item, item.op);
        }
    }

    debug_assert!(
        timing.values().all(|t| t.start_calls >= t.stop_calls),
        "more ChildrenEnd than ChildrenStart records"
    );

    if let Some(out) = thread_breakdown.as_deref_mut() {
        for (thread, stats) in per_thread {
            let mut stats: Vec<StatMessage> = stats.into_values().collect();
            sort_by_duration(&mut stats);
            out.insert(thread, stats);
        }
    }
    let mut out: Vec<StatMessage> = totals.into_values().collect();
    sort_by_duration(&mut out);
    out
}

/// Exclusive (self) time per stat for a condensed frame: each call's
/// inclusive time minus its children's.
pub fn exclusive_aggregate(
    condensed: &[StatMessage],
    filter: Option<&dyn StatFilter>,
    add_non_stack: bool,
) -> Vec<StatMessage> {
    let mut totals: IndexMap<StatName, StatMessage> = IndexMap::new();
    let mut child_duration_stack: Vec<StatMessage> = Vec::new();

    for item in condensed {
        if is_stack_record(item) {
            let result = totals
                .entry(item.name)
                .or_insert_with(|| cleared_packed(item));
            match item.op {
                StatOperation::ChildrenStart => {
                    child_duration_stack.push(*item);
                    continue;
                }
                StatOperation::ChildrenEnd => {
                    if let Some(own) = child_duration_stack.pop() {
                        result.accumulate(&own, Some(StatOperation::Add));
                    }
                }
                _ => result.accumulate(item, Some(StatOperation::Add)),
            }
            if let Some(parent) = child_duration_stack.last_mut() {
                parent.accumulate_renamed(item, Some(StatOperation::Subtract));
            }
        } else if add_non_stack {
            add_non_stack_stat(&mut totals, item, item.op);
        }
    }

    let mut out: Vec<StatMessage> = totals
        .into_values()
        .filter(|m| keeps(filter, m))
        .collect();
    sort_by_duration(&mut out);
    out
}

fn log_memory_extensive_stats(frame: i64, packets: &PacketArray) -> Vec<(StatName, usize)> {
    let mut counts: HashMap<StatName, usize> = HashMap::new();
    let mut total = 0usize;
    for packet in packets {
        for item in &packet.messages {
            *counts.entry(item.name).or_default() += 1;
            total += 1;
        }
    }
    let mut counts: Vec<(StatName, usize)> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    info!(frame, total, "message counts");
    let mut shown = 0usize;
    for (name, count) in &counts {
        if shown * 10 >= total * 9 {
            break;
        }
        shown += count;
        info!(
            frame,
            stat = %name,
            count,
            percent = 100.0 * *count as f64 / total.max(1) as f64,
            "message count"
        );
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn game_packet(messages: Vec<StatMessage>) -> StatPacket {
        let mut packet = StatPacket::new(1, ThreadType::Game);
        packet.messages = messages;
        packet
    }

    fn advance(frame: i64) -> StatMessage {
        StatMessage::advance_frame(StatOperation::AdvanceFrameGameThread, frame)
    }

    fn scope(name: StatName, start: i64, end: i64) -> [StatMessage; 2] {
        [
            StatMessage::cycle_scope_start(name, start),
            StatMessage::cycle_scope_end(name, end),
        ]
    }

    fn state() -> StatsThreadState {
        StatsThreadState::new(&StatsConfig::default())
    }

    #[test]
    fn frame_advance_sign_marks_previous_bad() {
        assert_eq!(
            FrameAdvance::decode(-5),
            FrameAdvance {
                frame: 5,
                previous_bad: true
            }
        );
        assert_eq!(FrameAdvance::decode(-5).encode(), -5);
        assert_eq!(FrameAdvance::decode(7).encode(), 7);
    }

    #[test]
    fn frame_completes_after_advance() {
        let mut state = state();
        let tick = StatName::new("state_tick");
        let mut messages = scope(tick, 0, 100).to_vec();
        messages.push(advance(2));
        let ready = state.process_packets(vec![game_packet(messages)].into());
        assert_eq!(ready, vec![1]);
        assert!(state.is_frame_valid(1));
        assert_eq!(state.oldest_valid_frame(), Some(1));
        assert_eq!(state.latest_valid_frame(), Some(1));
    }

    #[test]
    fn frame_waits_for_renderer() {
        let mut state = state();
        let mut render = StatPacket::new(2, ThreadType::Renderer);
        render.messages = vec![StatMessage::cycle_scope_start(StatName::new("draw"), 0)];
        let ready = state.process_packets(vec![game_packet(vec![advance(2)]), render].into());
        assert!(ready.is_empty(), "renderer has not finished frame 1");

        let mut render = StatPacket::new(2, ThreadType::Renderer);
        render.messages = vec![StatMessage::advance_frame(
            StatOperation::AdvanceFrameRenderThread,
            2,
        )];
        let ready = state.process_packets(vec![render].into());
        assert_eq!(ready, vec![1]);
    }

    #[test]
    fn inclusive_aggregate_pairs_scopes() {
        let mut state = state();
        let a = StatName::new("incl_a");
        let b = StatName::new("incl_b");
        let messages = vec![
            StatMessage::cycle_scope_start(a, 0),
            StatMessage::cycle_scope_start(b, 10),
            StatMessage::cycle_scope_end(b, 110),
            StatMessage::cycle_scope_end(a, 150),
            advance(2),
        ];
        state.process_packets(vec![game_packet(messages)].into());

        let stats = state
            .inclusive_aggregate_stack_stats(1, None, false, None)
            .unwrap();
        let find = |n: StatName| stats.iter().find(|m| m.name == n).unwrap();
        assert_eq!(find(a).duration(), 150);
        assert_eq!(find(b).duration(), 100);
        assert_eq!(find(b).call_count(), 1);

        let exclusive = state.exclusive_aggregate_stack_stats(1, None, false).unwrap();
        let find = |n: StatName| exclusive.iter().find(|m| m.name == n).unwrap();
        assert_eq!(find(a).duration(), 50);
        assert_eq!(find(a).call_count(), 1);
        assert_eq!(find(b).duration(), 100);
    }

    #[test]
    fn recursion_counts_outermost_call_only() {
        let r = StatName::new("recursive");
        let mut root = RawStatStackNode::new_root();
        let mut outer = RawStatStackNode::new(StatMessage::packed(r, StatOperation::Set, 1, 100));
        let inner = RawStatStackNode::new(StatMessage::packed(r, StatOperation::Set, 1, 60));
        outer.children.insert(r, inner);
        root.children.insert(r, outer);
        let mut condensed = Vec::new();
        root.encode(&mut condensed);

        let stats = inclusive_aggregate(&condensed, None, false, None);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].duration(), 100);
    }

    #[test]
    fn thread_breakdown_splits_by_thread() {
        let mut state = state();
        let a = StatName::new("breakdown_a");
        let mut game = scope(a, 0, 40).to_vec();
        game.push(advance(2));
        let mut worker = StatPacket::new(9, ThreadType::Other);
        worker.frame = 1;
        worker.messages = scope(a, 0, 60).to_vec();
        state.process_packets(vec![worker, game_packet(game)].into());

        let mut breakdown = ThreadBreakdown::new();
        let stats = state
            .inclusive_aggregate_stack_stats(1, None, false, Some(&mut breakdown))
            .unwrap();
        let total = stats.iter().find(|m| m.name == a).unwrap();
        assert_eq!(total.duration(), 100);
        assert_eq!(breakdown.len(), 2);
        let mut per_thread: Vec<u32> = breakdown
            .values()
            .map(|s| s.iter().find(|m| m.name == a).unwrap().duration())
            .collect();
        per_thread.sort_unstable();
        assert_eq!(per_thread, vec![40, 60]);
    }

    #[test]
    fn non_clearing_stats_keep_running_totals() {
        let mut state = state();
        let long = StatName::new(&long_name("STAT_Loaded", Some("STATGROUP_Test"), None, None));
        let meta = StatMessage::new(
            long,
            StatOperation::SetLongName,
            StatFlags::DUMMY_ALWAYS_ONE,
            StatValue::Int64(0),
        );
        let add = |v| StatMessage::new(long, StatOperation::Add, StatFlags::DUMMY_ALWAYS_ONE, StatValue::Int64(v));

        state.process_packets(vec![game_packet(vec![meta, add(5), advance(2)])].into());
        state.process_packets(vec![game_packet(vec![add(3), advance(3)])].into());
        // Frame 3 sends nothing; the synthetic packet carries the total.
        state.process_packets(vec![game_packet(vec![advance(4)])].into());

        let mut non_stack = NonStackStats::new();
        state.uncondense_stack_stats(2, None, Some(&mut non_stack)).unwrap();
        assert_eq!(non_stack[&long].value, StatValue::Int64(8));

        let mut non_stack = NonStackStats::new();
        state.uncondense_stack_stats(3, None, Some(&mut non_stack)).unwrap();
        assert_eq!(non_stack[&long].value, StatValue::Int64(8));
    }

    #[test]
    fn non_clearing_stat_without_metadata_is_left_as_is() {
        let mut state = state();
        let name = StatName::new("no_metadata_total");
        let mut messages = vec![StatMessage::new(
            name,
            StatOperation::Add,
            StatFlags::DUMMY_ALWAYS_ONE,
            StatValue::Int64(4),
        )];
        state.process_non_frame_stats(&mut messages, None);
        assert_eq!(messages[0].op, StatOperation::Add);
        assert_eq!(messages[0].value, StatValue::Int64(4));
    }

    #[test]
    #[should_panic(expected = "not cleared every frame")]
    fn non_clearing_scope_panics() {
        let mut state = state();
        let mut messages = vec![StatMessage::new(
            StatName::new("bad_scope"),
            StatOperation::CycleScopeStart,
            StatFlags::DUMMY_ALWAYS_ONE | StatFlags::IS_CYCLE,
            StatValue::Int64(0),
        )];
        state.process_non_frame_stats(&mut messages, None);
    }

    #[test]
    fn metadata_registers_groups_and_threads() {
        let mut state = state();
        let thread = StatName::new(&long_name(
            "AsyncLoading",
            Some(crate::name::THREADS_GROUP),
            Some(&thread_description(0x42)),
            None,
        ));
        state.find_or_add_metadata(&StatMessage::new(
            thread,
            StatOperation::SetLongName,
            StatFlags::DUMMY_ALWAYS_ONE | StatFlags::SHOULD_CLEAR_EVERY_FRAME,
            StatValue::None,
        ));
        assert_eq!(state.threads().get(&0x42), Some(&StatName::new("AsyncLoading")));
        let group = StatName::new(crate::name::THREADS_GROUP);
        assert!(state.groups()[&group].contains(&StatName::new("AsyncLoading")));
        assert!(state.not_cleared_every_frame().is_empty());
    }

    #[test]
    fn events_record_wait_and_trigger_stacks() {
        let mut state = state();
        let wait_scope = StatName::new("event_waiter");
        let trigger_scope = StatName::new("event_trigger");
        let marker = |name: &str, cycles: u32| {
            StatMessage::new(
                StatName::new(name),
                StatOperation::SpecialMessageMarker,
                StatFlags::DUMMY_ALWAYS_ONE,
                StatValue::Ptr(crate::message::pack_event(7, cycles)),
            )
        };
        let messages = vec![
            StatMessage::cycle_scope_start(wait_scope, 0),
            marker(crate::name::EVENT_WAIT_WITH_ID, 100),
            StatMessage::cycle_scope_end(wait_scope, 10),
            StatMessage::cycle_scope_start(trigger_scope, 20),
            marker(crate::name::EVENT_TRIGGER_WITH_ID, 350),
            StatMessage::cycle_scope_end(trigger_scope, 30),
            advance(2),
        ];
        state.process_packets(vec![game_packet(messages)].into());
        let events = state.events_for_frame(1);
        assert_eq!(events.len(), 1);
        let (id, event) = &events[0];
        assert_eq!(*id, 7);
        assert!(event.has_valid_stacks());
        assert_eq!(event.wait_stack.last(), Some(&wait_scope));
        assert_eq!(event.trigger_stack.last(), Some(&trigger_scope));
        assert_eq!(event.duration(), 250);
    }

    #[test]
    fn fast_thread_frame_time_spans_first_start_to_last_end() {
        let mut state = state();
        let mut messages = scope(StatName::new("fast_a"), 100, 200).to_vec();
        messages.extend(scope(StatName::new("fast_b"), 250, 400));
        messages.push(advance(2));
        state.process_packets(vec![game_packet(messages)].into());
        assert_eq!(state.fast_thread_frame_time(1, ThreadType::Game), 300);
        assert_eq!(state.fast_thread_frame_time_by_id(1, 1), 300);
        assert_eq!(state.fast_thread_frame_time(1, ThreadType::Renderer), 0);
    }

    #[test]
    fn listeners_and_subscribers_see_frames_in_order() {
        let mut state = state();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = state.add_new_frame_listener(Box::new(move |frame: i64, state: &StatsThreadState| {
            assert!(state.is_frame_valid(frame));
            sink.lock().unwrap().push(frame);
        }));
        let rx = state.subscribe();
        for frame in 2..=4 {
            state.process_packets(vec![game_packet(vec![advance(frame)])].into());
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(state.remove_new_frame_listener(id));
        assert!(!state.remove_new_frame_listener(id));
    }

    #[test]
    fn disabled_state_drops_everything() {
        let mut state = state();
        state.process_packets(vec![game_packet(vec![advance(2)])].into());
        assert!(state.is_frame_valid(1));
        state.set_enabled(false);
        assert!(!state.is_frame_valid(1));
        let ready = state.process_packets(vec![game_packet(vec![advance(3)])].into());
        assert!(ready.is_empty());
        assert_eq!(state.retained_frames(), RetainedFrames::default());
        assert_eq!(state.current_game_frame(), 2);
    }

    #[test]
    fn disabling_clears_stat_registries() {
        let mut state = state();
        let total = StatName::new(&long_name("STAT_Total", Some("STATGROUP_Test"), None, None));
        state.process_metadata_only(&[StatMessage::new(
            total,
            StatOperation::SetLongName,
            StatFlags::DUMMY_ALWAYS_ONE,
            StatValue::Int64(0),
        )]);
        let add = StatMessage::new(
            total,
            StatOperation::Add,
            StatFlags::DUMMY_ALWAYS_ONE,
            StatValue::Int64(5),
        );
        state.process_packets(vec![game_packet(vec![add, advance(2)])].into());
        assert!(state.not_cleared_every_frame.contains_key(&total));
        assert!(!state.short_name_to_long_name.is_empty());
        assert!(!state.groups.is_empty());

        state.set_enabled(false);
        assert!(state.not_cleared_every_frame.is_empty());
        assert!(state.short_name_to_long_name.is_empty());
        assert!(state.groups.is_empty());
    }

    #[test]
    fn raw_packets_are_buffered_until_listener() {
        let mut state = state();
        state.set_raw_stats_active(true);
        state.process_packets(vec![game_packet(vec![advance(2)])].into());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        state.set_raw_listener(Some(Box::new(move |_packet: &StatPacket| {
            counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        })));
        assert_eq!(count.load(std::sync::atomic::Ordering::Relaxed), 1);
        state.process_packets(vec![game_packet(vec![advance(3)])].into());
        assert_eq!(count.load(std::sync::atomic::Ordering::Relaxed), 2);
        assert!(state.valid_frames().is_empty());
    }

    #[test]
    fn add_missing_stats_fills_zeroes() {
        let mut state = state();
        let long = StatName::new(&long_name("STAT_Missing", Some("STATGROUP_Test"), None, None));
        let mut meta = StatMessage::cycle_scope_start(long, 0);
        meta.op = StatOperation::SetLongName;
        state.find_or_add_metadata(&meta);

        let mut dest = Vec::new();
        let enabled: HashSet<StatName> = [StatName::new("STAT_Missing")].into_iter().collect();
        state.add_missing_stats(&mut dest, &enabled);
        assert_eq!(dest.len(), 1);
        assert!(dest[0].is_packed());
        assert_eq!(dest[0].duration(), 0);
    }

    #[test]
    fn memory_extensive_dump_counts_messages() {
        let mut state = state();
        let noisy = StatName::new("noisy");
        let mut messages = Vec::new();
        for i in 0..10 {
            messages.extend(scope(noisy, i * 10, i * 10 + 5));
        }
        messages.push(advance(2));
        state.process_packets(vec![game_packet(messages)].into());
        let counts = state.find_and_dump_memory_extensive_stats(1);
        assert_eq!(counts[0], (noisy, 20));
    }

    #[test]
    fn loaded_frames_are_valid_and_kept() {
        let mut state = StatsThreadState::for_loading();
        for frame in 1..=30 {
            state.add_frame_from_condensed_messages(
                frame,
                vec![StatMessage::advance_frame(
                    StatOperation::AdvanceFrameGameThread,
                    frame,
                )],
            );
        }
        assert_eq!(state.valid_frames().len(), 30);
        assert_eq!(state.oldest_valid_frame(), Some(1));
        assert_eq!(state.latest_valid_frame(), Some(30));
    }

    #[test]
    fn invalid_frame_query_is_an_error() {
        let state = state();
        assert!(matches!(
            state.condensed_history(3),
            Err(StatsError::InvalidFrame(3))
        ));
    }
}
