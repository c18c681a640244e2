//! Capture files: frames written to disk while the program runs, read back
//! for offline analysis.
//!
//! File layout:
//!
//! ```text
//! header (fixed size, rewritten on stop)
//! block*            envelope: metadata refresh, frame number, records
//! end marker
//! frame table       frame, offset, per-thread cycles
//! metadata table    SetLongName records
//! name table        index, string
//! ```
//!
//! Blocks are encoded on the caller's thread and handed to a writer thread
//! that compresses and appends them in order. A capture that was never
//! stopped has no tables; it is read block by block from the start, up to
//! the first damaged block.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::codec::{
    Endian, FieldReader, HEADER_SIZE, StatReader, StatWriter, StatsStreamHeader, read_envelope,
    write_end_marker, write_envelope,
};
use crate::config::StatsConfig;
use crate::error::{Result, StatsError};
use crate::message::{StatMessage, StatOperation};
use crate::name::{StatName, THREADS_GROUP, parse_thread_id};
use crate::packet::{StatPacket, ThreadType};
use crate::state::StatsThreadState;

pub const CONDENSED_EXTENSION: &str = "fstats";
pub const RAW_EXTENSION: &str = "fstatsraw";

/// Where a frame's block starts, and how long each thread ran in it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameTableEntry {
    pub frame: i64,
    pub offset: u64,
    pub thread_cycles: Vec<(u32, i64)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureSummary {
    pub path: PathBuf,
    pub blocks: usize,
    pub bytes: u64,
}

enum WriterMsg {
    Block {
        data: Vec<u8>,
        frame: i64,
        thread_cycles: Vec<(u32, i64)>,
    },
    Finish {
        metadata: Vec<u8>,
        metadata_count: u64,
        names: Vec<u8>,
        name_count: u64,
    },
}

/// Encode one block: new metadata, then the frame and its records.
pub fn encode_frame_block(
    writer: &mut StatWriter,
    metadata: &[StatMessage],
    frame: i64,
    messages: &[StatMessage],
) -> Vec<u8> {
    writer.write_messages(metadata);
    writer.write_i64(frame);
    writer.write_messages(messages);
    writer.take_buffer()
}

fn encode_packet_block(writer: &mut StatWriter, packet: &StatPacket) -> Vec<u8> {
    writer.write_messages(&[]);
    writer.write_i64(packet.frame);
    writer.write_u32(packet.thread_id);
    writer.write_u8(packet.thread_type as u8);
    writer.write_u8(packet.broken_callstack as u8);
    writer.write_messages(&packet.messages);
    writer.take_buffer()
}

/// Per-thread totals of a condensed frame, read off the thread nodes.
pub fn thread_cycles(condensed: &[StatMessage]) -> Vec<(u32, i64)> {
    let threads_group = StatName::new(THREADS_GROUP);
    let mut out: Vec<(u32, i64)> = Vec::new();
    for item in condensed {
        if !matches!(item.op, StatOperation::ChildrenStart | StatOperation::Leaf) {
            continue;
        }
        if item.name.group_name() != Some(threads_group) {
            continue;
        }
        let Some(thread_id) = item.name.description().and_then(parse_thread_id) else {
            continue;
        };
        match out.iter_mut().find(|(id, _)| *id == thread_id) {
            Some((_, cycles)) => *cycles += item.duration() as i64,
            None => out.push((thread_id, item.duration() as i64)),
        }
    }
    out
}

/// Streams frames (or raw packets) to a capture file.
pub struct CaptureWriter {
    path: PathBuf,
    is_raw: bool,
    writer: StatWriter,
    metadata: IndexMap<StatName, StatMessage>,
    metadata_sent: usize,
    blocks: usize,
    tx: Option<mpsc::Sender<WriterMsg>>,
    handle: Option<JoinHandle<io::Result<u64>>>,
}

impl CaptureWriter {
    /// Create the file, write a placeholder header and start the writer
    /// thread. The `.fstatsraw` extension selects a raw capture.
    pub fn start(path: &Path, config: &StatsConfig) -> Result<Self> {
        let is_raw = path.extension().is_some_and(|ext| ext == RAW_EXTENSION);
        let file = File::create(path).map_err(|source| StatsError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut out = BufWriter::new(file);
        let header = StatsStreamHeader::new(&config.platform, is_raw);
        header.write_to(&mut out)?;

        let (tx, rx) = mpsc::channel::<WriterMsg>();
        let compress = config.compress;
        let handle = thread::Builder::new()
            .name("framestat-capture".into())
            .spawn(move || write_loop(out, header, rx, compress))?;
        debug!(path = %path.display(), is_raw, "capture started");

        Ok(Self {
            path: path.to_path_buf(),
            is_raw,
            writer: StatWriter::new(),
            metadata: IndexMap::new(),
            metadata_sent: 0,
            blocks: 0,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_raw(&self) -> bool {
        self.is_raw
    }

    fn send(&mut self, msg: WriterMsg) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(StatsError::ThreadStopped)?;
        tx.send(msg).map_err(|_| StatsError::ThreadStopped)?;
        self.blocks += 1;
        Ok(())
    }

    /// Append a valid frame of `state`, preceded by any metadata not yet
    /// in the file.
    pub fn write_frame(&mut self, state: &StatsThreadState, frame: i64) -> Result<()> {
        let condensed = state.condensed_history(frame)?;
        for meta in state.short_name_to_long_name().values() {
            self.metadata.entry(meta.name).or_insert_with(|| {
                let mut record = *meta;
                record.op = StatOperation::SetLongName;
                record
            });
        }
        let fresh: Vec<StatMessage> = self.metadata.values().skip(self.metadata_sent).copied().collect();
        self.metadata_sent = self.metadata.len();

        let data = encode_frame_block(&mut self.writer, &fresh, frame, &condensed);
        self.send(WriterMsg::Block {
            data,
            frame,
            thread_cycles: thread_cycles(&condensed),
        })
    }

    /// Append one raw packet. Metadata it carries goes to the metadata
    /// table as well.
    pub fn write_packet(&mut self, packet: &StatPacket) -> Result<()> {
        for item in &packet.messages {
            if item.op == StatOperation::SetLongName {
                self.metadata.entry(item.name).or_insert(*item);
            }
        }
        let data = encode_packet_block(&mut self.writer, packet);
        self.send(WriterMsg::Block {
            data,
            frame: packet.frame,
            thread_cycles: Vec::new(),
        })
    }

    /// Write the tables, rewrite the header and close the file.
    pub fn stop(mut self) -> Result<CaptureSummary> {
        self.finish()
    }

    fn finish(&mut self) -> Result<CaptureSummary> {
        let Some(handle) = self.handle.take() else {
            return Err(StatsError::ThreadStopped);
        };
        let metadata: Vec<StatMessage> = self.metadata.values().copied().collect();
        let mut table_writer = StatWriter::new();
        table_writer.write_messages(&metadata);
        let metadata_bytes = table_writer.take_buffer();

        let mut indices: HashSet<u32> = self.writer.names_sent().clone();
        indices.extend(table_writer.names_sent());
        let mut indices: Vec<u32> = indices.into_iter().collect();
        indices.sort_unstable();
        let mut names = StatWriter::new();
        for index in &indices {
            if let Some(name) = StatName::from_index(*index) {
                names.write_u32(*index);
                names.write_string(name.as_str());
            }
        }

        if let Some(tx) = self.tx.take() {
            let _ = tx.send(WriterMsg::Finish {
                metadata: metadata_bytes,
                metadata_count: metadata.len() as u64,
                names: names.take_buffer(),
                name_count: indices.len() as u64,
            });
        }
        let bytes = match handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(StatsError::ThreadStopped),
        };
        debug!(path = %self.path.display(), blocks = self.blocks, bytes, "capture stopped");
        Ok(CaptureSummary {
            path: self.path.clone(),
            blocks: self.blocks,
            bytes,
        })
    }
}

impl Drop for CaptureWriter {
    fn drop(&mut self) {
        if self.handle.is_some()
            && let Err(e) = self.finish()
        {
            warn!(path = %self.path.display(), "capture not finalized: {e}");
        }
    }
}

/// Runs on the writer thread. After the first I/O error the remaining
/// blocks are drained unwritten; the file is closed either way.
fn write_loop(
    mut out: BufWriter<File>,
    mut header: StatsStreamHeader,
    rx: mpsc::Receiver<WriterMsg>,
    compress: bool,
) -> io::Result<u64> {
    let mut offset = HEADER_SIZE;
    let mut frame_table: Vec<FrameTableEntry> = Vec::new();
    let mut failed: Option<io::Error> = None;

    while let Ok(msg) = rx.recv() {
        match msg {
            WriterMsg::Block {
                data,
                frame,
                thread_cycles,
            } => {
                if failed.is_some() {
                    continue;
                }
                match write_envelope(&mut out, &data, compress) {
                    Ok(written) => {
                        frame_table.push(FrameTableEntry {
                            frame,
                            offset,
                            thread_cycles,
                        });
                        offset += written;
                    }
                    Err(e) => failed = Some(e),
                }
            }
            WriterMsg::Finish {
                metadata,
                metadata_count,
                names,
                name_count,
            } => {
                if let Some(e) = failed.take() {
                    return Err(e);
                }
                write_end_marker(&mut out)?;
                offset += 8;

                header.frame_table_offset = offset;
                let table = encode_frame_table(&frame_table);
                out.write_all(&table)?;
                offset += table.len() as u64;

                header.metadata_offset = offset;
                header.metadata_count = metadata_count;
                out.write_all(&metadata)?;
                offset += metadata.len() as u64;

                header.name_table_offset = offset;
                header.name_count = name_count;
                out.write_all(&names)?;
                offset += names.len() as u64;

                out.seek(SeekFrom::Start(0))?;
                header.write_to(&mut out)?;
                out.flush()?;
                return Ok(offset);
            }
        }
    }
    // Sender dropped without Finish.
    match failed {
        Some(e) => Err(e),
        None => {
            out.flush()?;
            Ok(offset)
        }
    }
}

fn encode_frame_table(entries: &[FrameTableEntry]) -> Vec<u8> {
    let mut w = StatWriter::new();
    w.write_u32(entries.len() as u32);
    for entry in entries {
        w.write_i64(entry.frame);
        w.write_u64(entry.offset);
        w.write_u32(entry.thread_cycles.len() as u32);
        for (thread_id, cycles) in &entry.thread_cycles {
            w.write_u32(*thread_id);
            w.write_i64(*cycles);
        }
    }
    w.take_buffer()
}

/// Progress through loading a capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadStage {
    Started = 0,
    ReadStats = 1,
    PreProcessStats = 2,
    ProcessStats = 3,
    PostProcessStats = 4,
    Finished = 5,
    Stopped = 6,
}

impl ReadStage {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ReadStage::ReadStats,
            2 => ReadStage::PreProcessStats,
            3 => ReadStage::ProcessStats,
            4 => ReadStage::PostProcessStats,
            5 => ReadStage::Finished,
            6 => ReadStage::Stopped,
            _ => ReadStage::Started,
        }
    }
}

/// Hooks run while a capture loads. Every method has a no-op default.
pub trait CaptureVisitor {
    fn on_stage(&mut self, _stage: ReadStage, _percent: u8) {}

    /// Called once every frame has been read.
    fn pre_process(&mut self, _state: &StatsThreadState) {}

    /// Called for each valid frame, oldest first.
    fn process_frame(&mut self, _state: &StatsThreadState, _frame: i64) {}

    fn post_process(&mut self, _state: &StatsThreadState) {}
}

impl CaptureVisitor for () {}

/// A decoded block of a condensed capture.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadedFrame {
    pub frame: i64,
    /// Metadata first seen in this block.
    pub metadata: Vec<StatMessage>,
    pub messages: Vec<StatMessage>,
}

pub struct CaptureReader {
    path: PathBuf,
    input: BufReader<File>,
    header: StatsStreamHeader,
    reader: StatReader,
    data_start: u64,
    file_len: u64,
    frame_table: Vec<FrameTableEntry>,
    metadata: Vec<StatMessage>,
    cancel: Arc<AtomicBool>,
}

impl CaptureReader {
    /// Open a capture and read its header, plus the tables of a finalized
    /// capture.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| StatsError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let file_len = file.metadata()?.len();
        let mut input = BufReader::new(file);
        let (header, endian) = StatsStreamHeader::read_from(&mut input)?;
        let data_start = if header.version == 0 { 4 } else { HEADER_SIZE };

        let mut reader = Self {
            path: path.to_path_buf(),
            input,
            header,
            reader: StatReader::new(endian),
            data_start,
            file_len,
            frame_table: Vec::new(),
            metadata: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        };
        if reader.header.is_finalized() {
            reader.load_tables()?;
        } else {
            debug!(path = %path.display(), "capture was not finalized; reading sequentially");
        }
        Ok(reader)
    }

    fn load_tables(&mut self) -> Result<()> {
        let endian = self.reader.endian();

        self.input.seek(SeekFrom::Start(self.header.name_table_offset))?;
        let mut names = HashMap::new();
        {
            let mut fields = FieldReader::new(&mut self.input, endian);
            for _ in 0..self.header.name_count {
                let index = fields.u32()?;
                let name = fields.string()?;
                names.insert(index, StatName::new(&name));
            }
        }
        self.reader.set_name_table(names);

        self.input.seek(SeekFrom::Start(self.header.metadata_offset))?;
        self.metadata = self.reader.read_messages(&mut self.input)?;

        self.input.seek(SeekFrom::Start(self.header.frame_table_offset))?;
        let mut fields = FieldReader::new(&mut self.input, endian);
        let count = fields.u32()?;
        let mut table = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let frame = fields.i64()?;
            let offset = fields.u64()?;
            let threads = fields.u32()?;
            let mut thread_cycles = Vec::with_capacity(threads as usize);
            for _ in 0..threads {
                thread_cycles.push((fields.u32()?, fields.i64()?));
            }
            table.push(FrameTableEntry {
                frame,
                offset,
                thread_cycles,
            });
        }
        self.frame_table = table;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &StatsStreamHeader {
        &self.header
    }

    pub fn is_raw(&self) -> bool {
        self.header.is_raw
    }

    /// Blocks listed in the frame table; `None` for unfinalized captures.
    pub fn num_frames(&self) -> Option<usize> {
        self.header
            .is_finalized()
            .then_some(self.frame_table.len())
    }

    pub fn frame_table(&self) -> &[FrameTableEntry] {
        &self.frame_table
    }

    /// Metadata table of a finalized capture.
    pub fn metadata(&self) -> &[StatMessage] {
        &self.metadata
    }

    /// Flag checked once per frame; setting it stops a load early.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Visit every block's bytes in order. `visit` returns `false` to stop.
    fn for_each_block(
        &mut self,
        mut visit: impl FnMut(&mut StatReader, Vec<u8>, u8) -> Result<bool>,
    ) -> Result<bool> {
        if self.header.is_finalized() {
            let offsets: Vec<u64> = self.frame_table.iter().map(|e| e.offset).collect();
            let total = offsets.len().max(1);
            for (i, offset) in offsets.into_iter().enumerate() {
                self.input.seek(SeekFrom::Start(offset))?;
                let Some(block) = read_envelope(&mut self.input, self.reader.endian())? else {
                    return Err(StatsError::Corrupt(format!(
                        "frame table points at the end marker (offset {offset})"
                    )));
                };
                let percent = (100 * (i + 1) / total) as u8;
                if !visit(&mut self.reader, block, percent)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        self.input.seek(SeekFrom::Start(self.data_start))?;
        loop {
            let block = match read_envelope(&mut self.input, self.reader.endian()) {
                Ok(Some(block)) => block,
                Ok(None) => return Ok(true),
                Err(e) => {
                    warn!(path = %self.path.display(), "capture ends in a damaged block: {e}");
                    return Ok(true);
                }
            };
            let position = self.input.stream_position()?;
            let percent = (100 * position / self.file_len.max(1)).min(100) as u8;
            if !visit(&mut self.reader, block, percent)? {
                return Ok(false);
            }
        }
    }

    /// Decode every frame block in file order. `on_frame` returns `false`
    /// to stop; the return value says whether the end was reached.
    pub fn frames(
        &mut self,
        mut on_frame: impl FnMut(LoadedFrame, u8) -> bool,
    ) -> Result<bool> {
        if self.header.is_raw {
            return Err(StatsError::RawCapture {
                path: self.path.clone(),
            });
        }
        let cancel = Arc::clone(&self.cancel);
        self.for_each_block(|reader, block, percent| {
            if cancel.load(Ordering::Relaxed) {
                return Ok(false);
            }
            let mut cursor = Cursor::new(block);
            let metadata = reader.read_messages(&mut cursor)?;
            let frame = reader.fields(&mut cursor).i64()?;
            let messages = reader.read_messages(&mut cursor)?;
            Ok(on_frame(
                LoadedFrame {
                    frame,
                    metadata,
                    messages,
                },
                percent,
            ))
        })
    }

    /// Load every frame into a fresh state and run `visitor` over it.
    ///
    /// Cancellation is not an error: the result is then
    /// `ReadStage::Stopped` with whatever was loaded so far.
    pub fn read_and_process(
        &mut self,
        visitor: &mut dyn CaptureVisitor,
    ) -> Result<(ReadStage, StatsThreadState)> {
        let mut state = StatsThreadState::for_loading();
        visitor.on_stage(ReadStage::Started, 0);
        state.process_metadata_only(&self.metadata);

        visitor.on_stage(ReadStage::ReadStats, 0);
        let completed = self.frames(|loaded, percent| {
            state.process_metadata_only(&loaded.metadata);
            state.add_frame_from_condensed_messages(loaded.frame, loaded.messages);
            visitor.on_stage(ReadStage::ReadStats, percent);
            true
        })?;
        if !completed {
            visitor.on_stage(ReadStage::Stopped, 0);
            return Ok((ReadStage::Stopped, state));
        }

        visitor.on_stage(ReadStage::PreProcessStats, 0);
        visitor.pre_process(&state);

        visitor.on_stage(ReadStage::ProcessStats, 0);
        let frames = state.valid_frames();
        let total = frames.len().max(1);
        for (i, frame) in frames.into_iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                visitor.on_stage(ReadStage::Stopped, 0);
                return Ok((ReadStage::Stopped, state));
            }
            visitor.process_frame(&state, frame);
            visitor.on_stage(ReadStage::ProcessStats, (100 * (i + 1) / total) as u8);
        }

        visitor.on_stage(ReadStage::PostProcessStats, 0);
        visitor.post_process(&state);
        visitor.on_stage(ReadStage::Finished, 100);
        Ok((ReadStage::Finished, state))
    }

    /// Load on a background thread. Progress and cancellation go through
    /// the returned handle.
    pub fn spawn<V>(mut self, mut visitor: V) -> Result<AsyncLoad<V>>
    where
        V: CaptureVisitor + Send + 'static,
    {
        let progress = Arc::new(Progress::default());
        let cancel = self.cancel_flag();
        let shared = Arc::clone(&progress);
        let handle = thread::Builder::new()
            .name("framestat-load".into())
            .spawn(move || -> Result<LoadResult<V>> {
                let mut tracked = Tracked {
                    inner: &mut visitor,
                    progress: &shared,
                };
                let (stage, state) = self.read_and_process(&mut tracked)?;
                Ok(LoadResult {
                    stage,
                    state,
                    visitor,
                })
            })?;
        Ok(AsyncLoad {
            handle,
            cancel,
            progress,
        })
    }

    /// Decode frames on a background thread and deliver them, in file
    /// order, over a channel. Decoding stops when the receiver is dropped.
    pub fn stream_frames(
        mut self,
    ) -> Result<(mpsc::Receiver<LoadedFrame>, JoinHandle<Result<ReadStage>>)> {
        if self.header.is_raw {
            return Err(StatsError::RawCapture { path: self.path });
        }
        let (tx, rx) = mpsc::sync_channel::<LoadedFrame>(16);
        let handle = thread::Builder::new()
            .name("framestat-stream".into())
            .spawn(move || -> Result<ReadStage> {
                let completed = self.frames(|loaded, _| tx.send(loaded).is_ok())?;
                Ok(if completed {
                    ReadStage::Finished
                } else {
                    ReadStage::Stopped
                })
            })?;
        Ok((rx, handle))
    }

    /// Every packet of a raw capture, in file order.
    pub fn read_raw_packets(&mut self) -> Result<Vec<StatPacket>> {
        if !self.header.is_raw {
            return Err(StatsError::NotRawCapture {
                path: self.path.clone(),
            });
        }
        let mut packets = Vec::new();
        self.for_each_block(|reader, block, _| {
            let mut cursor = Cursor::new(block);
            reader.read_messages(&mut cursor)?;
            let mut fields = reader.fields(&mut cursor);
            let frame = fields.i64()?;
            let thread_id = fields.u32()?;
            let thread_type = ThreadType::from_bits(fields.u8()?)
                .ok_or_else(|| StatsError::Corrupt("unknown thread type".into()))?;
            let broken_callstack = fields.u8()? != 0;
            let mut packet = StatPacket::new(thread_id, thread_type);
            packet.frame = frame;
            packet.broken_callstack = broken_callstack;
            packet.messages = reader.read_messages(&mut cursor)?;
            packets.push(packet);
            Ok(true)
        })?;
        Ok(packets)
    }
}

#[derive(Default)]
struct Progress {
    stage: AtomicU8,
    percent: AtomicU8,
}

struct Tracked<'a, V> {
    inner: &'a mut V,
    progress: &'a Progress,
}

impl<V: CaptureVisitor> CaptureVisitor for Tracked<'_, V> {
    fn on_stage(&mut self, stage: ReadStage, percent: u8) {
        self.progress.stage.store(stage as u8, Ordering::Relaxed);
        self.progress.percent.store(percent, Ordering::Relaxed);
        self.inner.on_stage(stage, percent);
    }

    fn pre_process(&mut self, state: &StatsThreadState) {
        self.inner.pre_process(state);
    }

    fn process_frame(&mut self, state: &StatsThreadState, frame: i64) {
        self.inner.process_frame(state, frame);
    }

    fn post_process(&mut self, state: &StatsThreadState) {
        self.inner.post_process(state);
    }
}

pub struct LoadResult<V> {
    pub stage: ReadStage,
    pub state: StatsThreadState,
    pub visitor: V,
}

/// A capture loading on a background thread.
pub struct AsyncLoad<V> {
    handle: JoinHandle<Result<LoadResult<V>>>,
    cancel: Arc<AtomicBool>,
    progress: Arc<Progress>,
}

impl<V> AsyncLoad<V> {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn progress(&self) -> (ReadStage, u8) {
        (
            ReadStage::from_u8(self.progress.stage.load(Ordering::Relaxed)),
            self.progress.percent.load(Ordering::Relaxed),
        )
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<LoadResult<V>> {
        self.handle.join().map_err(|_| StatsError::ThreadStopped)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::{long_name, thread_description};

    #[test]
    fn thread_cycles_reads_thread_nodes() {
        let thread = StatName::new(&long_name(
            "GameThread",
            Some(THREADS_GROUP),
            Some(&thread_description(0x1c)),
            None,
        ));
        let start = StatMessage::packed(thread, StatOperation::ChildrenStart, 1, 500);
        let child = StatMessage::packed(StatName::new("capture_child"), StatOperation::Leaf, 1, 400);
        let mut end = start;
        end.op = StatOperation::ChildrenEnd;
        assert_eq!(thread_cycles(&[start, child, end]), vec![(0x1c, 500)]);
    }

    #[test]
    fn raw_extension_selects_raw_capture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("cap.{RAW_EXTENSION}"));
        let writer = CaptureWriter::start(&path, &StatsConfig::default()).unwrap();
        assert!(writer.is_raw());
        writer.stop().unwrap();
        let reader = CaptureReader::open(&path).unwrap();
        assert!(reader.is_raw());
        assert_eq!(reader.num_frames(), Some(0));
    }

    #[test]
    fn condensed_reader_rejects_raw_capture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("cap.{RAW_EXTENSION}"));
        CaptureWriter::start(&path, &StatsConfig::default())
            .unwrap()
            .stop()
            .unwrap();
        let mut reader = CaptureReader::open(&path).unwrap();
        let err = reader.read_and_process(&mut ()).err().unwrap();
        assert!(matches!(err, StatsError::RawCapture { .. }), "got {err}");
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.fstats");
        let err = CaptureReader::open(&path).err().unwrap();
        assert!(err.to_string().contains("missing.fstats"), "got {err}");
    }
}
