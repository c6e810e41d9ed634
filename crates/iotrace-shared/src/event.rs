//! Fixed-layout trace event records.
//!
//! Every record starts with an [`EventHeader`] followed by a variant-specific body. All fields
//! are little-endian and packed: the byte layout is spelled out here and never depends on how
//! the compiler lays out the Rust structs.
//!
//! ```text
//! header           type:u8 | sequence_id:u64 | timestamp_ns:u64 | total_size:u16   (19 bytes)
//! io body          lba:u64 | len:u32 | io_class:u32 | device_id:u32 | op:u8 | flags:u8
//! device body      device_id:u32 | device_size:u64 | device_name:[u8; 32]
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use bitflags::bitflags;
use std::fmt;
use thiserror::Error;

pub const HEADER_SIZE: usize = 19;
pub const IO_EVENT_SIZE: usize = HEADER_SIZE + 22;
pub const DEVICE_DESC_SIZE: usize = HEADER_SIZE + 44;
/// Largest record any producer can emit, used to size stack encode buffers.
pub const MAX_EVENT_SIZE: usize = DEVICE_DESC_SIZE;

/// Capacity of the device name field, terminator included.
pub const DEVICE_NAME_LEN: usize = 32;
pub const SECTOR_SHIFT: u32 = 9;

const TOTAL_SIZE_OFFSET: usize = 17;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record truncated: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unknown event type {0}")]
    UnknownEventType(u8),
    #[error("unknown I/O operation {0}")]
    UnknownOperation(u8),
    #[error("unknown I/O flag bits {0:#04x}")]
    UnknownFlags(u8),
    #[error("{event_type:?} record declares {declared} bytes, expected {expected}")]
    SizeMismatch {
        event_type: EventType,
        declared: usize,
        expected: usize,
    },
    #[error("device name is not valid UTF-8")]
    InvalidName,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("device name is {len} bytes, the field holds at most {max}")]
    TooLong { len: usize, max: usize },
    #[error("device name contains a NUL byte")]
    InteriorNul,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum EventType {
    DeviceDescriptor = 0,
    Io = 1,
}

impl EventType {
    /// Encoded size of a complete record of this type
    pub const fn record_size(self) -> usize {
        match self {
            EventType::DeviceDescriptor => DEVICE_DESC_SIZE,
            EventType::Io => IO_EVENT_SIZE,
        }
    }
}

impl TryFrom<u8> for EventType {
    type Error = DecodeError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(EventType::DeviceDescriptor),
            1 => Ok(EventType::Io),
            _ => Err(DecodeError::UnknownEventType(val)),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum Operation {
    Read = 0,
    Write = 1,
    Discard = 2,
}

impl TryFrom<u8> for Operation {
    type Error = DecodeError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(Operation::Read),
            1 => Ok(Operation::Write),
            2 => Ok(Operation::Discard),
            _ => Err(DecodeError::UnknownOperation(val)),
        }
    }
}

bitflags! {
    /// Request flags carried by an I/O event
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct IoFlags: u8 {
        /// Preflush of the device write cache
        const FLUSH = 1 << 0;
        /// Forced unit access
        const FUA = 1 << 1;
    }
}

/// Device name stored in a fixed, NUL-terminated field.
///
/// Names are never truncated: anything that does not leave room for the terminator is
/// rejected when the name is built.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceName {
    bytes: [u8; DEVICE_NAME_LEN],
}

impl DeviceName {
    pub fn new(name: &str) -> Result<Self, NameError> {
        let raw = name.as_bytes();
        if raw.len() >= DEVICE_NAME_LEN {
            return Err(NameError::TooLong {
                len: raw.len(),
                max: DEVICE_NAME_LEN - 1,
            });
        }
        if raw.contains(&0) {
            return Err(NameError::InteriorNul);
        }

        let mut bytes = [0u8; DEVICE_NAME_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self { bytes })
    }

    fn from_field(field: &[u8]) -> Result<Self, DecodeError> {
        let mut bytes = [0u8; DEVICE_NAME_LEN];
        bytes.copy_from_slice(field);

        let name = Self { bytes };
        std::str::from_utf8(name.raw()).map_err(|_| DecodeError::InvalidName)?;
        Ok(name)
    }

    fn raw(&self) -> &[u8] {
        let len = self
            .bytes
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(DEVICE_NAME_LEN);
        &self.bytes[..len]
    }

    pub fn as_str(&self) -> &str {
        // Validated as UTF-8 on construction and on decode
        std::str::from_utf8(self.raw()).unwrap_or_default()
    }

    pub fn as_field(&self) -> &[u8; DEVICE_NAME_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DeviceName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DeviceName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        DeviceName::new(&name).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub event_type: EventType,
    pub sequence_id: u64,
    pub timestamp_ns: u64,
    pub total_size: u16,
}

impl EventHeader {
    fn new(event_type: EventType, sequence_id: u64, timestamp_ns: u64) -> Self {
        Self {
            event_type,
            sequence_id,
            timestamp_ns,
            total_size: event_type.record_size() as u16,
        }
    }

    /// Read the declared record length without validating the rest of the header.
    ///
    /// Consumers use this to frame records before decoding them.
    pub fn record_len(header: &[u8; HEADER_SIZE]) -> usize {
        u16::from_le_bytes([header[TOTAL_SIZE_OFFSET], header[TOTAL_SIZE_OFFSET + 1]]) as usize
    }

    fn write(&self, w: &mut Writer<'_>) {
        w.put_u8(self.event_type as u8);
        w.put_u64(self.sequence_id);
        w.put_u64(self.timestamp_ns);
        w.put_u16(self.total_size);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes, HEADER_SIZE)?;
        let event_type = EventType::try_from(r.u8())?;
        let header = Self {
            event_type,
            sequence_id: r.u64(),
            timestamp_ns: r.u64(),
            total_size: r.u16(),
        };

        let expected = event_type.record_size();
        if header.total_size as usize != expected {
            return Err(DecodeError::SizeMismatch {
                event_type,
                declared: header.total_size as usize,
                expected,
            });
        }

        Ok(header)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoEvent {
    pub operation: Operation,
    pub flags: IoFlags,
    /// First sector of the request
    pub lba: u64,
    /// Request length in sectors
    pub len: u32,
    pub io_class: u32,
    pub device_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_id: u32,
    pub device_name: DeviceName,
    /// Device size in bytes
    pub device_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    Io(IoEvent),
    DeviceDescriptor(DeviceDescriptor),
}

impl EventPayload {
    pub const fn event_type(&self) -> EventType {
        match self {
            EventPayload::Io(_) => EventType::Io,
            EventPayload::DeviceDescriptor(_) => EventType::DeviceDescriptor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub header: EventHeader,
    pub payload: EventPayload,
}

impl Event {
    pub fn io(sequence_id: u64, timestamp_ns: u64, io: IoEvent) -> Self {
        Self {
            header: EventHeader::new(EventType::Io, sequence_id, timestamp_ns),
            payload: EventPayload::Io(io),
        }
    }

    pub fn device_descriptor(sequence_id: u64, timestamp_ns: u64, desc: DeviceDescriptor) -> Self {
        Self {
            header: EventHeader::new(EventType::DeviceDescriptor, sequence_id, timestamp_ns),
            payload: EventPayload::DeviceDescriptor(desc),
        }
    }

    pub fn sequence_id(&self) -> u64 {
        self.header.sequence_id
    }

    /// Size of the encoded record, set by the payload variant
    pub fn encoded_len(&self) -> usize {
        self.payload.event_type().record_size()
    }

    /// Encode into a stack buffer. Never allocates.
    ///
    /// The record type and size always come from the payload. Whatever `header` says about
    /// them is ignored, so the output is always decodable.
    pub fn encode(&self) -> EncodedEvent {
        let mut out = EncodedEvent {
            bytes: [0u8; MAX_EVENT_SIZE],
            len: self.encoded_len(),
        };

        let header = EventHeader::new(
            self.payload.event_type(),
            self.header.sequence_id,
            self.header.timestamp_ns,
        );
        let mut w = Writer::new(&mut out.bytes);
        header.write(&mut w);
        match &self.payload {
            EventPayload::Io(io) => {
                w.put_u64(io.lba);
                w.put_u32(io.len);
                w.put_u32(io.io_class);
                w.put_u32(io.device_id);
                w.put_u8(io.operation as u8);
                w.put_u8(io.flags.bits());
            }
            EventPayload::DeviceDescriptor(desc) => {
                w.put_u32(desc.device_id);
                w.put_u64(desc.device_size);
                w.put_bytes(desc.device_name.as_field());
            }
        }
        debug_assert_eq!(w.pos, out.len);

        out
    }

    /// Decode one record from the start of `bytes`. Trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let header = EventHeader::decode(bytes)?;
        let mut r = Reader::new(bytes, header.total_size as usize)?;
        r.skip(HEADER_SIZE);

        let payload = match header.event_type {
            EventType::Io => {
                let lba = r.u64();
                let len = r.u32();
                let io_class = r.u32();
                let device_id = r.u32();
                let operation = Operation::try_from(r.u8())?;
                let raw_flags = r.u8();
                let flags = IoFlags::from_bits(raw_flags).ok_or(DecodeError::UnknownFlags(raw_flags))?;
                EventPayload::Io(IoEvent {
                    operation,
                    flags,
                    lba,
                    len,
                    io_class,
                    device_id,
                })
            }
            EventType::DeviceDescriptor => {
                let device_id = r.u32();
                let device_size = r.u64();
                let device_name = DeviceName::from_field(r.bytes(DEVICE_NAME_LEN))?;
                EventPayload::DeviceDescriptor(DeviceDescriptor {
                    device_id,
                    device_name,
                    device_size,
                })
            }
        };

        Ok(Self { header, payload })
    }
}

/// An encoded record living on the stack
pub struct EncodedEvent {
    bytes: [u8; MAX_EVENT_SIZE],
    len: usize,
}

impl EncodedEvent {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn put_u8(&mut self, v: u8) {
        self.put_bytes(&[v]);
    }

    fn put_u16(&mut self, v: u16) {
        self.put_bytes(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.put_bytes(&v.to_le_bytes());
    }
}

/// Bounds are checked once in `new`, the accessors then index freely.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], needed: usize) -> Result<Self, DecodeError> {
        if buf.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                available: buf.len(),
            });
        }
        Ok(Self {
            buf: &buf[..needed],
            pos: 0,
        })
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N));
        out
    }

    fn u8(&mut self) -> u8 {
        self.array::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.array())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.array())
    }
}

mod assertions {
    use super::*;
    use static_assertions::{const_assert, const_assert_eq};

    // Wire sizes are part of the consumer contract
    const_assert_eq!(HEADER_SIZE, 1 + 8 + 8 + 2);
    const_assert_eq!(IO_EVENT_SIZE, 41);
    const_assert_eq!(DEVICE_DESC_SIZE, 63);
    const_assert!(MAX_EVENT_SIZE >= IO_EVENT_SIZE);
    const_assert!(MAX_EVENT_SIZE <= u16::MAX as usize);
}
