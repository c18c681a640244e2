//! Byte encoding of stat records and capture headers.
//!
//! Every record is written as `i32 name index, u32 info bits, payload`. The
//! first time a writer session emits a name index it sets `SENDING_NAME`
//! in the info bits and follows them with the name string, so a reader can
//! rebuild the name table from the stream alone. Captures are written
//! little-endian; a reader detects the byte order from the magic.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use tracing::warn;

use crate::error::{Result, StatsError};
use crate::message::{DataType, StatFlags, StatMessage, StatValue, pack_info, unpack_info};
use crate::name::{StatName, well_known};

/// Magic of files written without a header (read sequentially).
pub const MAGIC_NO_HEADER: u32 = 0x7E1B_83C1;
pub const MAGIC_NO_HEADER_SWAPPED: u32 = MAGIC_NO_HEADER.swap_bytes();
pub const MAGIC: u32 = 0x1029_3847;
pub const MAGIC_SWAPPED: u32 = MAGIC.swap_bytes();

pub const VERSION: u32 = 6;
pub const MAX_PLATFORM_LEN: usize = 255;

/// Written twice in place of an envelope's sizes after the last frame.
pub const END_MARKER: i32 = 0xE5E5_E5E5_u32 as i32;

/// Bytes taken by a header on disk, platform padding included.
pub const HEADER_SIZE: u64 = 4 + 4 + 4 + MAX_PLATFORM_LEN as u64 + 8 * 5 + 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsStreamHeader {
    pub version: u32,
    pub platform: String,
    pub frame_table_offset: u64,
    pub name_table_offset: u64,
    pub name_count: u64,
    pub metadata_offset: u64,
    pub metadata_count: u64,
    pub is_raw: bool,
}

impl StatsStreamHeader {
    pub fn new(platform: &str, is_raw: bool) -> Self {
        Self {
            version: VERSION,
            platform: platform.to_string(),
            is_raw,
            ..Self::default()
        }
    }

    /// A header is final once the writer has stored all three tables.
    pub fn is_finalized(&self) -> bool {
        self.frame_table_offset != 0 && self.name_table_offset != 0 && self.metadata_offset != 0
    }

    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        let mut platform = self.platform.as_bytes();
        if platform.len() > MAX_PLATFORM_LEN {
            let mut cut = MAX_PLATFORM_LEN;
            while !self.platform.is_char_boundary(cut) {
                cut -= 1;
            }
            platform = &platform[..cut];
        }
        let mut padded = [0u8; MAX_PLATFORM_LEN];
        padded[..platform.len()].copy_from_slice(platform);

        out.write_all(&MAGIC.to_le_bytes())?;
        out.write_all(&self.version.to_le_bytes())?;
        out.write_all(&(platform.len() as u32).to_le_bytes())?;
        out.write_all(&padded)?;
        for value in [
            self.frame_table_offset,
            self.name_table_offset,
            self.name_count,
            self.metadata_offset,
            self.metadata_count,
        ] {
            out.write_all(&value.to_le_bytes())?;
        }
        out.write_all(&[self.is_raw as u8])
    }

    /// Read the magic and, if present, the header behind it.
    ///
    /// Legacy files have no header: they get a default one and are read
    /// sequentially from right after the magic.
    pub fn read_from(input: &mut impl Read) -> Result<(Self, Endian)> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        let (endian, has_header) = match u32::from_le_bytes(magic) {
            MAGIC => (Endian::Little, true),
            MAGIC_SWAPPED => (Endian::Big, true),
            MAGIC_NO_HEADER => (Endian::Little, false),
            MAGIC_NO_HEADER_SWAPPED => (Endian::Big, false),
            other => return Err(StatsError::BadMagic(other)),
        };
        if !has_header {
            return Ok((Self::default(), endian));
        }

        let mut fields = FieldReader::new(input, endian);
        let version = fields.u32()?;
        if version == 0 || version > VERSION {
            return Err(StatsError::UnsupportedVersion(version));
        }
        let platform_len = fields.u32()? as usize;
        if platform_len > MAX_PLATFORM_LEN {
            return Err(StatsError::Corrupt(format!(
                "platform name of {platform_len} bytes"
            )));
        }
        let mut padded = [0u8; MAX_PLATFORM_LEN];
        fields.input.read_exact(&mut padded)?;
        let platform = String::from_utf8_lossy(&padded[..platform_len]).into_owned();
        let header = Self {
            version,
            platform,
            frame_table_offset: fields.u64()?,
            name_table_offset: fields.u64()?,
            name_count: fields.u64()?,
            metadata_offset: fields.u64()?,
            metadata_count: fields.u64()?,
            is_raw: fields.u8()? != 0,
        };
        Ok((header, endian))
    }
}

/// Endian-aware primitive reads over any byte source.
pub struct FieldReader<'a, R: Read> {
    pub input: &'a mut R,
    endian: Endian,
}

macro_rules! read_field {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> io::Result<$ty> {
            let mut bytes = [0u8; std::mem::size_of::<$ty>()];
            self.input.read_exact(&mut bytes)?;
            Ok(match self.endian {
                Endian::Little => <$ty>::from_le_bytes(bytes),
                Endian::Big => <$ty>::from_be_bytes(bytes),
            })
        }
    };
}

impl<'a, R: Read> FieldReader<'a, R> {
    pub fn new(input: &'a mut R, endian: Endian) -> Self {
        Self { input, endian }
    }

    read_field!(u8, u8);
    read_field!(u32, u32);
    read_field!(i32, i32);
    read_field!(u64, u64);
    read_field!(i64, i64);
    read_field!(f64, f64);

    pub fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = read_len(&mut *self.input, len)?;
        String::from_utf8(bytes).map_err(|_| StatsError::Corrupt("name is not UTF-8".into()))
    }
}

/// Encodes records into an in-memory buffer, sending each name's string
/// once per session.
#[derive(Debug, Default)]
pub struct StatWriter {
    buf: Vec<u8>,
    names_sent: HashSet<u32>,
}

impl StatWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Hand out the bytes written so far; the name session continues.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn names_sent(&self) -> &HashSet<u32> {
        &self.names_sent
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_name(&mut self, name: StatName, info: u32) {
        let index = name.index();
        self.write_i32(index as i32);
        if self.names_sent.insert(index) {
            self.write_u32(info | ((StatFlags::SENDING_NAME.bits() as u32) << 7));
            self.write_string(name.as_str());
        } else {
            self.write_u32(info);
        }
    }

    pub fn write_message(&mut self, item: &StatMessage) {
        let mut flags = item.flags;
        flags.remove(StatFlags::SENDING_NAME);
        self.write_name(item.name, pack_info(item.data_type(), item.op, flags));
        match item.value {
            StatValue::None => {}
            StatValue::Int64(v) => self.write_i64(v),
            StatValue::Double(v) => self.write_f64(v),
            StatValue::Name(name) => self.write_name(name, 0),
            StatValue::Ptr(v) => self.write_u64(v),
        }
    }

    pub fn write_messages(&mut self, items: &[StatMessage]) {
        self.write_u32(items.len() as u32);
        for item in items {
            self.write_message(item);
        }
    }
}

/// Decodes records, translating stream name indices to local names.
pub struct StatReader {
    endian: Endian,
    names: HashMap<u32, StatName>,
    has_name_map: bool,
}

impl StatReader {
    pub fn new(endian: Endian) -> Self {
        Self {
            endian,
            names: HashMap::new(),
            has_name_map: false,
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Resolve indices through a table loaded up front; inline name
    /// strings are then skipped.
    pub fn set_name_table(&mut self, names: HashMap<u32, StatName>) {
        self.names = names;
        self.has_name_map = true;
    }

    pub fn fields<'a, R: Read>(&self, input: &'a mut R) -> FieldReader<'a, R> {
        FieldReader::new(input, self.endian)
    }

    /// Returns the name and the info bits it was written with.
    pub fn read_name(&mut self, input: &mut impl Read) -> Result<(StatName, u32)> {
        let mut fields = FieldReader::new(input, self.endian);
        let index = fields.i32()? as u32;
        let info = fields.u32()?;
        let (_, _, flags) = unpack_info(info);
        if flags.contains(StatFlags::SENDING_NAME) {
            let inline = fields.string()?;
            if !self.has_name_map {
                self.names.insert(index, StatName::new(&inline));
            }
        }
        let name = match self.names.get(&index) {
            Some(name) => *name,
            None => {
                warn!(index, "name index has no definition");
                well_known().unknown
            }
        };
        Ok((name, info))
    }

    pub fn read_message(&mut self, input: &mut impl Read) -> Result<StatMessage> {
        let (name, info) = self.read_name(input)?;
        let (data_type, op, mut flags) = unpack_info(info);
        flags.remove(StatFlags::SENDING_NAME);
        let value = match data_type {
            Some(DataType::None) => StatValue::None,
            Some(DataType::Int64) => StatValue::Int64(self.fields(input).i64()?),
            Some(DataType::Double) => StatValue::Double(self.fields(input).f64()?),
            Some(DataType::Name) => StatValue::Name(self.read_name(input)?.0),
            Some(DataType::Ptr) => StatValue::Ptr(self.fields(input).u64()?),
            None => {
                return Err(StatsError::Corrupt(format!(
                    "record {name} has an unknown data type (info {info:#x})"
                )));
            }
        };
        Ok(StatMessage::new(name, op, flags, value))
    }

    pub fn read_messages(&mut self, input: &mut impl Read) -> Result<Vec<StatMessage>> {
        let count = self.fields(input).u32()? as usize;
        let mut out = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            out.push(self.read_message(input)?);
        }
        Ok(out)
    }
}

/// Write a data block as `(compressed_size, uncompressed_size, bytes)`.
/// A compressed size of zero means the bytes are stored as-is.
pub fn write_envelope(out: &mut impl Write, data: &[u8], compress: bool) -> io::Result<u64> {
    let compressed = if compress {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        Some(encoder.finish()?).filter(|c| c.len() < data.len())
    } else {
        None
    };
    let (stored_size, body) = match &compressed {
        Some(c) => (c.len() as i32, c.as_slice()),
        None => (0, data),
    };
    out.write_all(&stored_size.to_le_bytes())?;
    out.write_all(&(data.len() as i32).to_le_bytes())?;
    out.write_all(body)?;
    Ok(8 + body.len() as u64)
}

pub fn write_end_marker(out: &mut impl Write) -> io::Result<()> {
    out.write_all(&END_MARKER.to_le_bytes())?;
    out.write_all(&END_MARKER.to_le_bytes())
}

/// Largest buffer reserved before the bytes behind a length field arrive.
const PREALLOC_LIMIT: usize = 1 << 20;

/// Read exactly `len` bytes. The buffer grows with the data actually
/// present, so a damaged length fails at end of input.
fn read_len<R: Read + ?Sized>(input: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(len.min(PREALLOC_LIMIT));
    input.take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes, found {}", bytes.len()),
        ));
    }
    Ok(bytes)
}

/// Read one envelope. `None` at the end marker or a clean end of input.
pub fn read_envelope(input: &mut impl Read, endian: Endian) -> Result<Option<Vec<u8>>> {
    let mut first = [0u8; 4];
    match input.read(&mut first)? {
        0 => return Ok(None),
        4 => {}
        n => input.read_exact(&mut first[n..])?,
    }
    let compressed_size = match endian {
        Endian::Little => i32::from_le_bytes(first),
        Endian::Big => i32::from_be_bytes(first),
    };
    let uncompressed_size = FieldReader::new(input, endian).i32()?;
    if compressed_size == END_MARKER && uncompressed_size == END_MARKER {
        return Ok(None);
    }
    if compressed_size < 0 || uncompressed_size < 0 {
        return Err(StatsError::Corrupt(format!(
            "bad block sizes {compressed_size}/{uncompressed_size}"
        )));
    }
    if compressed_size == 0 {
        return Ok(Some(read_len(input, uncompressed_size as usize)?));
    }
    let packed = read_len(input, compressed_size as usize)?;
    let expected = uncompressed_size as usize;
    let mut data = Vec::with_capacity(expected.min(PREALLOC_LIMIT));
    ZlibDecoder::new(packed.as_slice())
        .take(expected as u64 + 1)
        .read_to_end(&mut data)?;
    if data.len() != uncompressed_size as usize {
        return Err(StatsError::Corrupt(format!(
            "block inflated to {} bytes, expected {uncompressed_size}",
            data.len()
        )));
    }
    Ok(Some(data))
}
