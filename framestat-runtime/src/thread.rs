//! The stats thread: sole owner of `StatsThreadState`.
//!
//! Producers never touch the state. They send owned packets and metadata
//! down one channel; the stats thread drains it in batches, reconstructs
//! frames and, while a capture is running, writes every new frame to it.
//! Everything else (queries, capture control) is a command on the same
//! channel, so it is ordered with the packets sent before it.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::capture::{CaptureSummary, CaptureWriter};
use crate::collector::Collector;
use crate::config::StatsConfig;
use crate::error::{Result, StatsError};
use crate::message::StatMessage;
use crate::packet::{PacketArray, StatPacket, ThreadType};
use crate::state::StatsThreadState;

type StateFn = Box<dyn FnOnce(&mut StatsThreadState) + Send>;

pub(crate) enum Command {
    Packet(StatPacket),
    Metadata(Vec<StatMessage>),
    StartCapture {
        path: PathBuf,
        reply: mpsc::Sender<Result<()>>,
    },
    StopCapture {
        reply: mpsc::Sender<Result<Option<CaptureSummary>>>,
    },
    With(StateFn),
    Shutdown,
}

/// Upper bound on packets folded into one `process_packets` call.
const BATCH_LIMIT: usize = 256;

pub struct StatsThread {
    tx: mpsc::Sender<Command>,
    handle: Option<JoinHandle<StatsThreadState>>,
}

impl StatsThread {
    /// Spawn the stats thread. The returned collector is the producers'
    /// handle; clone it freely.
    pub fn start(config: StatsConfig) -> Result<(StatsThread, Collector)> {
        crate::tsc::ensure_calibrated();
        let (tx, rx) = mpsc::channel::<Command>();
        let thread_config = config.clone();
        let handle = thread::Builder::new()
            .name("framestat-stats".into())
            .spawn(move || stats_loop(thread_config, rx))?;
        let collector = Collector::new(tx.clone());
        Ok((
            StatsThread {
                tx,
                handle: Some(handle),
            },
            collector,
        ))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| StatsError::ThreadStopped)
    }

    /// Start writing frames to `path`; a `.fstatsraw` path records raw
    /// packets instead.
    pub fn start_capture(&self, path: &Path) -> Result<()> {
        let (reply, rx) = mpsc::channel();
        self.send(Command::StartCapture {
            path: path.to_path_buf(),
            reply,
        })?;
        rx.recv().map_err(|_| StatsError::ThreadStopped)?
    }

    /// Finalize the running capture, if any.
    pub fn stop_capture(&self) -> Result<Option<CaptureSummary>> {
        let (reply, rx) = mpsc::channel();
        self.send(Command::StopCapture { reply })?;
        rx.recv().map_err(|_| StatsError::ThreadStopped)?
    }

    /// Run `f` on the stats thread after every packet sent so far.
    pub fn with_state<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut StatsThreadState) -> R + Send + 'static,
    {
        let (reply, rx) = mpsc::channel();
        self.send(Command::With(Box::new(move |state| {
            let _ = reply.send(f(state));
        })))?;
        rx.recv().map_err(|_| StatsError::ThreadStopped)
    }

    /// Drain the queue, finalize any capture and hand back the state.
    pub fn shutdown(mut self) -> Result<StatsThreadState> {
        let _ = self.tx.send(Command::Shutdown);
        let handle = self.handle.take().ok_or(StatsError::ThreadStopped)?;
        handle.join().map_err(|_| StatsError::ThreadStopped)
    }
}

impl Drop for StatsThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(Command::Shutdown);
            let _ = handle.join();
        }
    }
}

struct Capture {
    writer: CaptureWriter,
}

impl Capture {
    fn write_frames(&mut self, state: &StatsThreadState, frames: &[i64]) -> Result<()> {
        for &frame in frames {
            self.writer.write_frame(state, frame)?;
        }
        Ok(())
    }
}

fn stats_loop(config: StatsConfig, rx: mpsc::Receiver<Command>) -> StatsThreadState {
    let mut state = StatsThreadState::new(&config);
    let mut capture: Option<Capture> = None;

    'outer: while let Ok(first) = rx.recv() {
        let mut batch = PacketArray::new();
        let mut next = Some(first);
        while let Some(command) = next.take() {
            match command {
                Command::Packet(packet) => {
                    batch.push(packet);
                    if batch.len() >= BATCH_LIMIT {
                        ingest(&mut state, &mut capture, std::mem::take(&mut batch));
                    }
                }
                other => {
                    ingest(&mut state, &mut capture, std::mem::take(&mut batch));
                    if !run_command(other, &mut state, &mut capture, &config) {
                        break 'outer;
                    }
                }
            }
            next = rx.try_recv().ok();
        }
        ingest(&mut state, &mut capture, batch);
    }

    if let Some(capture) = capture.take() {
        match capture.writer.stop() {
            Ok(summary) => debug!(path = %summary.path.display(), "capture finalized at shutdown"),
            Err(e) => error!("capture lost at shutdown: {e}"),
        }
    }
    state
}

fn ingest(state: &mut StatsThreadState, capture: &mut Option<Capture>, mut batch: PacketArray) {
    if batch.is_empty() {
        return;
    }
    if let Some(active) = capture.as_mut()
        && active.writer.is_raw()
    {
        state.scan_for_advance(&mut batch);
        for packet in &batch {
            if let Err(e) = active.writer.write_packet(packet) {
                error!("raw capture stopped: {e}");
                *capture = None;
                break;
            }
        }
        state.process_raw_stats(batch);
        return;
    }

    let frames = state.process_packets(batch);
    if let Some(active) = capture.as_mut()
        && let Err(e) = active.write_frames(state, &frames)
    {
        error!("capture stopped: {e}");
        *capture = None;
    }
}

/// Returns `false` on shutdown.
fn run_command(
    command: Command,
    state: &mut StatsThreadState,
    capture: &mut Option<Capture>,
    config: &StatsConfig,
) -> bool {
    match command {
        Command::Packet(_) => unreachable!("packets are batched by the caller"),
        Command::Metadata(messages) => {
            state.process_metadata_only(&messages);
            if let Some(active) = capture.as_mut()
                && active.writer.is_raw()
            {
                let mut packet = StatPacket::new(0, ThreadType::Other);
                packet.messages = messages;
                if let Err(e) = active.writer.write_packet(&packet) {
                    error!("raw capture stopped: {e}");
                    *capture = None;
                }
            }
        }
        Command::StartCapture { path, reply } => {
            let result = start_capture(state, capture, &path, config);
            let _ = reply.send(result);
        }
        Command::StopCapture { reply } => {
            state.set_raw_stats_active(false);
            let result = match capture.take() {
                Some(active) => active.writer.stop().map(Some),
                None => Ok(None),
            };
            let _ = reply.send(result);
        }
        Command::With(f) => f(state),
        Command::Shutdown => return false,
    }
    true
}

fn start_capture(
    state: &mut StatsThreadState,
    capture: &mut Option<Capture>,
    path: &Path,
    config: &StatsConfig,
) -> Result<()> {
    if let Some(previous) = capture.take() {
        previous.writer.stop()?;
    }
    let writer = CaptureWriter::start(path, config)?;
    if writer.is_raw() {
        state.set_raw_stats_active(true);
    }
    *capture = Some(Capture { writer });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ThreadType;

    #[test]
    fn with_state_sees_packets_sent_before_it() {
        let (thread, collector) = StatsThread::start(StatsConfig::default()).unwrap();
        let tick = collector.declare_cycle_stat("STAT_ThreadTick", "STATGROUP_Test");
        let game = collector.thread_stats("GameThread", ThreadType::Game);
        for frame in 2..=4 {
            {
                let _scope = game.scope(tick);
            }
            game.advance_frame(frame, false);
        }
        let valid = thread.with_state(|state| state.valid_frames()).unwrap();
        assert_eq!(valid, vec![1, 2, 3]);
        let state = thread.shutdown().unwrap();
        assert_eq!(state.latest_valid_frame(), Some(3));
    }

    #[test]
    fn stop_without_capture_is_none() {
        let (thread, _collector) = StatsThread::start(StatsConfig::default()).unwrap();
        assert_eq!(thread.stop_capture().unwrap(), None);
    }
}
