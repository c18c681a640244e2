//! Frame-based stats engine.
//!
//! Producer threads record scope timings and counters through a
//! [`Collector`]; a single [`StatsThread`] owns the [`StatsThreadState`],
//! reconstructs whole frames from the packets, and can stream them to a
//! capture file. Captures are read back with [`CaptureReader`].

#![allow(unsafe_code)]

pub mod capture;
pub mod codec;
mod collector;
pub mod complex;
mod config;
pub mod dump;
mod error;
pub mod message;
pub mod name;
pub mod packet;
pub mod stack;
pub mod state;
mod thread;
pub mod tsc;

pub use capture::{
    AsyncLoad, CaptureReader, CaptureSummary, CaptureVisitor, CaptureWriter, LoadResult,
    LoadedFrame, ReadStage,
};
pub use collector::{Collector, ENGINE_GROUP, ScopeGuard, ThreadStats};
pub use complex::{ComplexField, ComplexRawStatStackNode, ComplexStatMessage};
pub use config::{DEFAULT_HISTORY_FRAMES, StatsConfig};
pub use error::{Result, StatsError};
pub use message::{StatFlags, StatMessage, StatOperation, StatValue};
pub use name::StatName;
pub use packet::{PacketArray, StatPacket, ThreadType};
pub use stack::{NonStackStats, RawStatStackNode, StatFilter};
pub use state::{EventData, FrameAdvance, StatsThreadState, ThreadBreakdown};
pub use thread::StatsThread;
