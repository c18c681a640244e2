//! Producer-side instrumentation with RAII scope guards.
//!
//! A `Collector` is the process-wide handle producers share: it declares
//! stats (sending their metadata to the stats thread once) and hands out
//! `ThreadStats`, the per-thread recorder. A `ThreadStats` appends records
//! to its current packet; `scope(name)` returns a `ScopeGuard` that emits
//! `CycleScopeStart` now and `CycleScopeEnd` on drop (on any exit path).
//!
//! Flush strategy: the game and render threads flush when they advance
//! their frame, other threads whenever their outermost scope closes. Any
//! unsent records are flushed when the `ThreadStats` is dropped.
//!
//! Thread-locality: a `ThreadStats` is `Send` but not `Sync`. Each thread
//! owns one and records a single call stack.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use tracing::debug;

use crate::message::{StatFlags, StatMessage, StatOperation, StatValue, pack_event};
use crate::name::{
    EVENT_TRIGGER_WITH_ID, EVENT_WAIT_WITH_ID, SECONDS_PER_CYCLE, StatName, THREADS_GROUP,
    long_name, thread_description,
};
use crate::packet::{StatPacket, ThreadType};
use crate::state::FrameAdvance;
use crate::thread::Command;

/// Group of the collector's own stats.
pub const ENGINE_GROUP: &str = "STATGROUP_Engine";

/// Process-wide thread ids, starting at 1.
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

struct Shared {
    tx: Mutex<mpsc::Sender<Command>>,
    enabled: AtomicBool,
    game_frame: AtomicI64,
    /// Flags each declared stat's records carry.
    declared: Mutex<HashMap<StatName, StatFlags>>,
    seconds_per_cycle: StatName,
}

/// Shared producer handle. Cheap to clone.
#[derive(Clone)]
pub struct Collector {
    shared: Arc<Shared>,
}

impl Collector {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        let seconds_per_cycle =
            StatName::new(&long_name(SECONDS_PER_CYCLE, Some(ENGINE_GROUP), None, None));
        let collector = Self {
            shared: Arc::new(Shared {
                tx: Mutex::new(tx),
                enabled: AtomicBool::new(true),
                game_frame: AtomicI64::new(1),
                declared: Mutex::new(HashMap::new()),
                seconds_per_cycle,
            }),
        };
        collector.declare(StatMessage::new(
            seconds_per_cycle,
            StatOperation::SetLongName,
            StatFlags::DUMMY_ALWAYS_ONE | StatFlags::SHOULD_CLEAR_EVERY_FRAME,
            StatValue::Double(0.0),
        ));
        collector
    }

    fn send(&self, command: Command) {
        let tx = self.shared.tx.lock().unwrap_or_else(|e| e.into_inner());
        if tx.send(command).is_err() {
            debug!("stats thread is gone; dropping records");
        }
    }

    pub(crate) fn send_packet(&self, packet: StatPacket) {
        if packet.messages.is_empty() {
            return;
        }
        self.send(Command::Packet(packet));
    }

    fn declare(&self, meta: StatMessage) -> StatName {
        let fresh = self
            .shared
            .declared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(meta.name, meta.flags)
            .is_none();
        if fresh {
            self.send(Command::Metadata(vec![meta]));
        }
        meta.name
    }

    /// Declare a timed scope. Returns the name to pass to `scope`.
    pub fn declare_cycle_stat(&self, short: &str, group: &str) -> StatName {
        self.declare(StatMessage::new(
            StatName::new(&long_name(short, Some(group), None, None)),
            StatOperation::SetLongName,
            StatFlags::cycle(),
            StatValue::Int64(0),
        ))
    }

    /// Declare an integer counter that starts from zero every frame.
    pub fn declare_counter(&self, short: &str, group: &str) -> StatName {
        self.declare(StatMessage::new(
            StatName::new(&long_name(short, Some(group), None, None)),
            StatOperation::SetLongName,
            StatFlags::DUMMY_ALWAYS_ONE | StatFlags::SHOULD_CLEAR_EVERY_FRAME,
            StatValue::Int64(0),
        ))
    }

    /// Declare a floating-point counter that starts from zero every frame.
    pub fn declare_float_counter(&self, short: &str, group: &str) -> StatName {
        self.declare(StatMessage::new(
            StatName::new(&long_name(short, Some(group), None, None)),
            StatOperation::SetLongName,
            StatFlags::DUMMY_ALWAYS_ONE | StatFlags::SHOULD_CLEAR_EVERY_FRAME,
            StatValue::Double(0.0),
        ))
    }

    /// Declare a counter whose value carries over between frames.
    pub fn declare_accumulator(&self, short: &str, group: &str) -> StatName {
        self.declare(StatMessage::new(
            StatName::new(&long_name(short, Some(group), None, None)),
            StatOperation::SetLongName,
            StatFlags::DUMMY_ALWAYS_ONE,
            StatValue::Int64(0),
        ))
    }

    /// Declare a memory counter carried over between frames.
    pub fn declare_memory(&self, short: &str, group: &str) -> StatName {
        self.declare(StatMessage::new(
            StatName::new(&long_name(short, Some(group), None, None)),
            StatOperation::SetLongName,
            StatFlags::DUMMY_ALWAYS_ONE | StatFlags::IS_MEMORY,
            StatValue::Int64(0),
        ))
    }

    /// A recorder for the calling thread. Other threads are registered
    /// under `name` so their stacks are labelled in dumps.
    pub fn thread_stats(&self, name: &str, thread_type: ThreadType) -> ThreadStats {
        let thread_id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        self.declare(StatMessage::new(
            StatName::new(&long_name(
                name,
                Some(THREADS_GROUP),
                Some(&thread_description(thread_id)),
                None,
            )),
            StatOperation::SetLongName,
            StatFlags::DUMMY_ALWAYS_ONE | StatFlags::SHOULD_CLEAR_EVERY_FRAME,
            StatValue::None,
        ));
        ThreadStats {
            collector: self.clone(),
            packet: RefCell::new(StatPacket::new(thread_id, thread_type)),
            depth: Cell::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }

    /// While disabled, recorders drop everything and the stats thread
    /// discards its history.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Relaxed);
        self.send(Command::With(Box::new(move |state| state.set_enabled(enabled))));
    }

    /// The frame the game thread is currently recording.
    pub fn current_game_frame(&self) -> i64 {
        self.shared.game_frame.load(Ordering::Acquire)
    }
}

/// Per-thread recorder.
pub struct ThreadStats {
    collector: Collector,
    packet: RefCell<StatPacket>,
    depth: Cell<u32>,
}

impl ThreadStats {
    pub fn thread_id(&self) -> u32 {
        self.packet.borrow().thread_id
    }

    pub fn thread_type(&self) -> ThreadType {
        self.packet.borrow().thread_type
    }

    fn push(&self, item: StatMessage) {
        if self.collector.is_enabled() {
            self.packet.borrow_mut().messages.push(item);
        }
    }

    /// Time a scope until the guard drops.
    pub fn scope(&self, name: StatName) -> ScopeGuard<'_> {
        if !self.collector.is_enabled() {
            return ScopeGuard {
                stats: self,
                name,
                active: false,
            };
        }
        self.depth.set(self.depth.get() + 1);
        self.push(StatMessage::cycle_scope_start(name, crate::tsc::cycles()));
        ScopeGuard {
            stats: self,
            name,
            active: true,
        }
    }

    fn counter(&self, name: StatName, op: StatOperation, value: StatValue) {
        let flags = self
            .collector
            .shared
            .declared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&name)
            .map(|flags| *flags - StatFlags::IS_CYCLE)
            .unwrap_or(StatFlags::DUMMY_ALWAYS_ONE | StatFlags::SHOULD_CLEAR_EVERY_FRAME);
        self.push(StatMessage::new(name, op, flags, value));
    }

    pub fn set(&self, name: StatName, value: i64) {
        self.counter(name, StatOperation::Set, StatValue::Int64(value));
    }

    pub fn add(&self, name: StatName, value: i64) {
        self.counter(name, StatOperation::Add, StatValue::Int64(value));
    }

    pub fn subtract(&self, name: StatName, value: i64) {
        self.counter(name, StatOperation::Subtract, StatValue::Int64(value));
    }

    pub fn max(&self, name: StatName, value: i64) {
        self.counter(name, StatOperation::MaxVal, StatValue::Int64(value));
    }

    pub fn set_f64(&self, name: StatName, value: f64) {
        self.counter(name, StatOperation::Set, StatValue::Double(value));
    }

    pub fn add_f64(&self, name: StatName, value: f64) {
        self.counter(name, StatOperation::Add, StatValue::Double(value));
    }

    fn event(&self, marker: &str, event_id: u32) {
        let cycles = crate::tsc::cycles() as u32;
        self.push(StatMessage::new(
            StatName::new(marker),
            StatOperation::SpecialMessageMarker,
            StatFlags::DUMMY_ALWAYS_ONE | StatFlags::SHOULD_CLEAR_EVERY_FRAME,
            StatValue::Ptr(pack_event(event_id, cycles)),
        ));
    }

    /// Mark the start of a wait on `event_id` at the current stack.
    pub fn event_wait(&self, event_id: u32) {
        self.event(EVENT_WAIT_WITH_ID, event_id);
    }

    /// Mark the trigger that ends a wait on `event_id`.
    pub fn event_trigger(&self, event_id: u32) {
        self.event(EVENT_TRIGGER_WITH_ID, event_id);
    }

    /// End the current game frame and begin `frame`. `previous_bad` flags
    /// the frame being left as unreliable.
    pub fn advance_frame(&self, frame: i64, previous_bad: bool) {
        self.set_f64(
            self.collector.shared.seconds_per_cycle,
            crate::tsc::seconds_per_cycle(),
        );
        self.push_advance(StatOperation::AdvanceFrameGameThread, frame, previous_bad);
        self.collector
            .shared
            .game_frame
            .store(frame, Ordering::Release);
        self.flush();
    }

    /// End the current render frame and begin `frame`.
    pub fn advance_render_frame(&self, frame: i64, previous_bad: bool) {
        self.push_advance(StatOperation::AdvanceFrameRenderThread, frame, previous_bad);
        self.flush();
    }

    fn push_advance(&self, op: StatOperation, frame: i64, previous_bad: bool) {
        let value = FrameAdvance {
            frame,
            previous_bad,
        }
        .encode();
        // Markers are sent even while disabled so frame numbering stays in
        // step once recording resumes.
        self.packet
            .borrow_mut()
            .messages
            .push(StatMessage::advance_frame(op, value));
    }

    /// Send the records gathered so far.
    pub fn flush(&self) {
        let mut packet = self.packet.borrow_mut();
        if packet.messages.is_empty() {
            return;
        }
        let mut out = packet.clone_header();
        std::mem::swap(&mut out.messages, &mut packet.messages);
        if out.thread_type == ThreadType::Other {
            out.frame = self.collector.current_game_frame();
        }
        out.broken_callstack = self.depth.get() > 0 && out.thread_type == ThreadType::Other;
        drop(packet);
        self.collector.send_packet(out);
    }
}

impl Drop for ThreadStats {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Emits `CycleScopeEnd` when dropped.
#[must_use = "dropping the guard immediately records an empty scope; bind it with `let _scope = ...`"]
pub struct ScopeGuard<'a> {
    stats: &'a ThreadStats,
    name: StatName,
    active: bool,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let stats = self.stats;
        stats.push(StatMessage::cycle_scope_end(self.name, crate::tsc::cycles()));
        let depth = stats.depth.get().saturating_sub(1);
        stats.depth.set(depth);
        if depth == 0 && stats.thread_type() == ThreadType::Other {
            stats.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (Collector, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel();
        (Collector::new(tx), rx)
    }

    fn drain(rx: &mpsc::Receiver<Command>) -> (Vec<StatMessage>, Vec<StatPacket>) {
        let mut metadata = Vec::new();
        let mut packets = Vec::new();
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::Metadata(messages) => metadata.extend(messages),
                Command::Packet(packet) => packets.push(packet),
                _ => {}
            }
        }
        (metadata, packets)
    }

    #[test]
    fn declarations_are_sent_once() {
        let (collector, rx) = collector();
        let a = collector.declare_cycle_stat("STAT_Once", "STATGROUP_Test");
        let b = collector.declare_cycle_stat("STAT_Once", "STATGROUP_Test");
        assert_eq!(a, b);
        assert_eq!(a.short_name().as_str(), "STAT_Once");
        let (metadata, _) = drain(&rx);
        let count = metadata.iter().filter(|m| m.name == a).count();
        assert_eq!(count, 1);
        assert!(metadata.iter().any(|m| m.name.short_name().as_str() == SECONDS_PER_CYCLE));
    }

    #[test]
    fn scopes_nest_and_other_threads_flush_at_depth_zero() {
        let (collector, rx) = collector();
        let outer = collector.declare_cycle_stat("STAT_Outer", "STATGROUP_Test");
        let inner = collector.declare_cycle_stat("STAT_Inner", "STATGROUP_Test");
        let worker = collector.thread_stats("Worker", ThreadType::Other);
        {
            let _outer = worker.scope(outer);
            {
                let _inner = worker.scope(inner);
            }
            assert!(drain(&rx).1.is_empty(), "flushed before the outer scope closed");
        }
        let (_, packets) = drain(&rx);
        assert_eq!(packets.len(), 1);
        let packet = &packets[0];
        assert_eq!(packet.thread_id, worker.thread_id());
        assert_eq!(packet.frame, 1);
        assert!(!packet.broken_callstack);
        let ops: Vec<_> = packet.messages.iter().map(|m| (m.name, m.op)).collect();
        assert_eq!(
            ops,
            vec![
                (outer, StatOperation::CycleScopeStart),
                (inner, StatOperation::CycleScopeStart),
                (inner, StatOperation::CycleScopeEnd),
                (outer, StatOperation::CycleScopeEnd),
            ]
        );
    }

    #[test]
    fn game_thread_flushes_on_advance_and_publishes_frame() {
        let (collector, rx) = collector();
        let tick = collector.declare_cycle_stat("STAT_Tick", "STATGROUP_Test");
        let game = collector.thread_stats(crate::name::GAME_THREAD, ThreadType::Game);
        {
            let _scope = game.scope(tick);
        }
        assert!(drain(&rx).1.is_empty());
        game.advance_frame(2, false);
        assert_eq!(collector.current_game_frame(), 2);
        let (_, packets) = drain(&rx);
        assert_eq!(packets.len(), 1);
        let last = packets[0].messages.last().unwrap();
        assert_eq!(last.op, StatOperation::AdvanceFrameGameThread);
        assert_eq!(FrameAdvance::decode(last.i64_value()).frame, 2);
        assert!(packets[0]
            .messages
            .iter()
            .any(|m| m.name.short_name().as_str() == SECONDS_PER_CYCLE));
    }

    #[test]
    fn counters_carry_declared_flags() {
        let (collector, rx) = collector();
        let total = collector.declare_accumulator("STAT_Total", "STATGROUP_Test");
        let per_frame = collector.declare_counter("STAT_PerFrame", "STATGROUP_Test");
        let worker = collector.thread_stats("Worker", ThreadType::Other);
        worker.add(total, 3);
        worker.set(per_frame, 7);
        worker.flush();
        let (_, packets) = drain(&rx);
        let messages = &packets[0].messages;
        assert!(!messages[0].should_clear_every_frame());
        assert_eq!(messages[0].op, StatOperation::Add);
        assert!(messages[1].should_clear_every_frame());
        assert_eq!(messages[1].i64_value(), 7);
    }

    #[test]
    fn events_pack_id_into_pointer() {
        let (collector, rx) = collector();
        let worker = collector.thread_stats("Worker", ThreadType::Other);
        worker.event_wait(42);
        worker.event_trigger(42);
        worker.flush();
        let (_, packets) = drain(&rx);
        let messages = &packets[0].messages;
        assert_eq!(messages[0].name.as_str(), EVENT_WAIT_WITH_ID);
        assert_eq!(messages[1].name.as_str(), EVENT_TRIGGER_WITH_ID);
        assert!(messages
            .iter()
            .all(|m| m.op == StatOperation::SpecialMessageMarker && m.ptr_value() >> 32 == 42));
    }

    #[test]
    fn disabled_records_only_frame_markers() {
        let (collector, rx) = collector();
        let tick = collector.declare_cycle_stat("STAT_Tick", "STATGROUP_Test");
        let game = collector.thread_stats(crate::name::GAME_THREAD, ThreadType::Game);
        collector.set_enabled(false);
        {
            let _scope = game.scope(tick);
        }
        game.add(tick, 1);
        game.advance_frame(2, false);
        let (_, packets) = drain(&rx);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].messages.len(), 1);
        assert_eq!(packets[0].messages[0].op, StatOperation::AdvanceFrameGameThread);
    }
}
