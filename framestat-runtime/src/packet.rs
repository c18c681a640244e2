//! Per-thread message batches.

use crate::message::StatMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadType {
    Game = 0,
    Renderer = 1,
    Other = 2,
}

impl ThreadType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(ThreadType::Game),
            1 => Some(ThreadType::Renderer),
            2 => Some(ThreadType::Other),
            _ => None,
        }
    }
}

/// Records from one producer thread for one tentative frame.
///
/// Game and renderer packets get their frame assigned on the stats thread;
/// `Other` packets carry the frame the producer saw when it flushed.
#[derive(Clone, Debug)]
pub struct StatPacket {
    pub frame: i64,
    pub thread_id: u32,
    pub thread_type: ThreadType,
    pub broken_callstack: bool,
    pub messages: Vec<StatMessage>,
}

impl StatPacket {
    pub fn new(thread_id: u32, thread_type: ThreadType) -> Self {
        Self {
            frame: 0,
            thread_id,
            thread_type,
            broken_callstack: false,
            messages: Vec::new(),
        }
    }

    /// Same thread and frame, no messages.
    pub fn clone_header(&self) -> Self {
        Self {
            frame: self.frame,
            thread_id: self.thread_id,
            thread_type: self.thread_type,
            broken_callstack: self.broken_callstack,
            messages: Vec::new(),
        }
    }
}

/// Owns the packets filed under one frame.
#[derive(Clone, Debug, Default)]
pub struct PacketArray {
    pub packets: Vec<StatPacket>,
}

impl PacketArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: StatPacket) {
        self.packets.push(packet);
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StatPacket> {
        self.packets.iter()
    }

    pub fn message_count(&self) -> usize {
        self.packets.iter().map(|p| p.messages.len()).sum()
    }
}

impl From<Vec<StatPacket>> for PacketArray {
    fn from(packets: Vec<StatPacket>) -> Self {
        Self { packets }
    }
}

impl IntoIterator for PacketArray {
    type Item = StatPacket;
    type IntoIter = std::vec::IntoIter<StatPacket>;

    fn into_iter(self) -> Self::IntoIter {
        self.packets.into_iter()
    }
}

impl<'a> IntoIterator for &'a PacketArray {
    type Item = &'a StatPacket;
    type IntoIter = std::slice::Iter<'a, StatPacket>;

    fn into_iter(self) -> Self::IntoIter {
        self.packets.iter()
    }
}
