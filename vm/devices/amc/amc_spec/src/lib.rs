// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions for the AMC generic command queue (GCQ).
//!
//! The management controller firmware reads submission entries and writes
//! completion entries with the exact bit layout defined here. Every multi-byte
//! field is little endian. The structures in this crate are byte-exact and
//! must not change size.

#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub use packed_nums::*;

#[expect(non_camel_case_types)]
mod packed_nums {
    pub type u16_le = zerocopy::U16<zerocopy::LittleEndian>;
    pub type u32_le = zerocopy::U32<zerocopy::LittleEndian>;
    pub type u64_le = zerocopy::U64<zerocopy::LittleEndian>;
}

/// Defines a transparent newtype over an integer with named values. Unknown
/// values stay representable so that nothing read from the device is lost.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident($ty:ty) {
            $($(#[$vmeta:meta])* $variant:ident = $value:expr,)*
        }
    ) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout, FromBytes)]
        $vis struct $name(pub $ty);

        impl $name {
            $($(#[$vmeta])* pub const $variant: Self = Self($value);)*
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match *self {
                    $(Self::$variant => f.write_str(stringify!($variant)),)*
                    Self(v) => write!(f, concat!(stringify!($name), "({:#x})"), v),
                }
            }
        }
    };
}

/// Size of a submission queue slot.
pub const REQUEST_SLOT_SIZE: usize = 512;
/// Size of [`RequestHeader`].
pub const REQUEST_HEADER_SIZE: usize = 8;
/// Number of bytes written per request: the header plus the largest payload.
pub const REQUEST_ENTRY_SIZE: usize = 32;
/// Size of a completion queue slot, which holds one [`CompletionEntry`].
pub const COMPLETION_ENTRY_SIZE: usize = 16;
/// Largest payload a single request can carry.
pub const MAX_REQUEST_PAYLOAD: usize = REQUEST_SLOT_SIZE - REQUEST_HEADER_SIZE;
/// Size of the response payload copied out of a completion entry.
pub const RESPONSE_PAYLOAD_SIZE: usize = 8;

wire_enum! {
    /// Command opcodes understood by the controller.
    pub struct Opcode(u16) {
        DEVICE_BOOT = 0x0,
        HEARTBEAT = 0x2,
        EEPROM_READ_WRITE = 0x3,
        MODULE_READ_WRITE = 0x4,
        PDI_DOWNLOAD = 0xa,
        SENSOR = 0xc,
        PARTITION_COPY = 0xd,
        IDENTIFY = 0x202,
    }
}

wire_enum! {
    /// Result codes returned by the controller in a completion entry.
    pub struct AmcResult(u32) {
        SUCCESS = 0,
        FAILURE = 1,
        INVALID_VALUE = 2,
        GET_REQUEST_FAILED = 3,
        PROCESS_REQUEST_FAILED = 4,
        ALREADY_IN_PROGRESS = 5,
        INVALID_CONFIGURATION = 6,
    }
}

impl AmcResult {
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

wire_enum! {
    /// Result reported in the body of a sensor response.
    pub struct SensorResult(u32) {
        SUCCESS = 0,
        OPERATION_FAILED = 2,
        READ_STALE = 3,
        WRITE_ERROR = 4,
        INVALID_SENSOR_ID = 5,
    }
}

impl SensorResult {
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

wire_enum! {
    /// Sensor repository selector (`sid`).
    pub struct SensorRepo(u8) {
        GET_SIZE = 0,
        BOARD_INFO = 1,
        TEMPERATURE = 2,
        VOLTAGE = 3,
        CURRENT = 4,
        POWER = 5,
        TOTAL_POWER = 6,
        QSFP = 7,
        FPT = 8,
        ALL = 9,
    }
}

wire_enum! {
    /// Sensor API selector (`aid`).
    pub struct SensorApi(u8) {
        GET_SIZE = 1,
        GET_SDR = 2,
        GET_SINGLE_SDR = 3,
        ALL_SDR = 4,
    }
}

/// Submission queue entry header.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RequestHeader {
    pub opcode: u16,
    /// Number of payload bytes following the header.
    #[bits(15)]
    pub count: u16,
    /// Set by the producer on every new entry.
    pub new_entry: bool,
    pub cid: u16,
    /// Compute unit index, only meaningful for compute unit opcodes.
    #[bits(12)]
    pub cu_idx: u16,
    #[bits(4)]
    pub cu_domain: u8,
}

/// Completion queue entry header.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ResponseHeader {
    pub cid: u16,
    #[bits(14)]
    pub cstate: u16,
    /// The result field carries command specific information.
    pub specific: bool,
    pub new_entry: bool,
}

/// A completion queue entry.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CompletionEntry {
    pub header: u32_le,
    pub result: u32_le,
    pub reserved: u32_le,
    /// POSIX style return code; carries an [`AmcResult`].
    pub rcode: u32_le,
}

const_assert_eq!(size_of::<RequestHeader>(), REQUEST_HEADER_SIZE);
const_assert_eq!(size_of::<ResponseHeader>(), 4);
const_assert_eq!(size_of::<CompletionEntry>(), COMPLETION_ENTRY_SIZE);

impl CompletionEntry {
    pub fn new(header: ResponseHeader, payload: [u8; RESPONSE_PAYLOAD_SIZE], rcode: u32) -> Self {
        let [r0, r1, r2, r3, s0, s1, s2, s3] = payload;
        Self {
            header: header.into_bits().into(),
            result: u32_le::from_bytes([r0, r1, r2, r3]),
            reserved: u32_le::from_bytes([s0, s1, s2, s3]),
            rcode: rcode.into(),
        }
    }

    /// Decodes an entry from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Self::read_from_prefix(bytes)
            .map(|(entry, _)| entry)
            .map_err(|_| WireError::ShortRead {
                expected: COMPLETION_ENTRY_SIZE,
                actual: bytes.len(),
            })
    }

    pub fn response_header(&self) -> ResponseHeader {
        ResponseHeader::from_bits(self.header.get())
    }

    pub fn cid(&self) -> u16 {
        self.response_header().cid()
    }

    /// The response payload: the result and reserved words as raw bytes.
    pub fn payload(&self) -> [u8; RESPONSE_PAYLOAD_SIZE] {
        let mut payload = [0; RESPONSE_PAYLOAD_SIZE];
        payload.copy_from_slice(&self.as_bytes()[4..12]);
        payload
    }

    pub fn rcode(&self) -> u32 {
        self.rcode.get()
    }
}

/// Errors encoding or decoding GCQ entries.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("payload of {len} bytes does not fit a request slot")]
    InvalidPayload { len: usize },
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
}

/// Builds the bytes of a submission entry for `opcode` carrying `payload`.
///
/// The entry is zero padded to [`REQUEST_ENTRY_SIZE`].
pub fn encode_request(opcode: Opcode, cid: u16, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_REQUEST_PAYLOAD {
        return Err(WireError::InvalidPayload { len: payload.len() });
    }
    let count = u16::try_from(payload.len())
        .ok()
        .filter(|&count| count <= 0x7fff)
        .ok_or(WireError::InvalidPayload { len: payload.len() })?;

    let header = RequestHeader::new()
        .with_opcode(opcode.0)
        .with_count(count)
        .with_new_entry(true)
        .with_cid(cid);

    let len = REQUEST_ENTRY_SIZE.max(REQUEST_HEADER_SIZE + payload.len());
    let mut entry = Vec::with_capacity(len);
    entry.extend_from_slice(&header.into_bits().to_le_bytes());
    entry.extend_from_slice(payload);
    entry.resize(len, 0);
    Ok(entry)
}

/// Decodes the header at the start of a submission entry.
pub fn decode_request_header(bytes: &[u8]) -> Result<RequestHeader, WireError> {
    let raw: [u8; REQUEST_HEADER_SIZE] = bytes
        .get(..REQUEST_HEADER_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or(WireError::ShortRead {
            expected: REQUEST_HEADER_SIZE,
            actual: bytes.len(),
        })?;
    Ok(RequestHeader::from_bits(u64::from_le_bytes(raw)))
}

#[bitfield(u32)]
pub struct SensorSelector {
    pub aid: u8,
    pub sid: u8,
    #[bits(3)]
    pub addr_type: u8,
    pub sensor_id: u8,
    #[bits(5)]
    _reserved: u8,
}

/// Payload of [`Opcode::SENSOR`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SensorPayload {
    /// Shared memory address the controller writes the sensor data to.
    pub address: u64_le,
    pub size: u32_le,
    pub offset: u32_le,
    /// A [`SensorSelector`].
    pub selector: u32_le,
    pub pad: u32_le,
}

#[bitfield(u32)]
pub struct PartitionSelector {
    #[bits(4)]
    pub src_partition: u8,
    #[bits(4)]
    pub dest_partition: u8,
    #[bits(4)]
    pub partition_sel: u8,
    /// The image contains a flash partition table.
    pub update_fpt: bool,
    #[bits(19)]
    _reserved: u32,
}

#[bitfield(u16)]
pub struct ChunkInfo {
    pub last_chunk: bool,
    #[bits(15)]
    pub chunk: u16,
}

/// Payload shared by [`Opcode::PDI_DOWNLOAD`], [`Opcode::DEVICE_BOOT`] and
/// [`Opcode::PARTITION_COPY`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DataPayload {
    pub address: u64_le,
    pub size: u32_le,
    pub remain_size: u32_le,
    /// A [`PartitionSelector`].
    pub partition: u32_le,
    /// A [`ChunkInfo`].
    pub chunk: u16_le,
    /// Chunk size in KiB.
    pub chunk_size: u16_le,
}

#[bitfield(u32)]
pub struct EepromControl {
    pub write: bool,
    pub len: u8,
    pub offset: u8,
    #[bits(15)]
    _reserved: u16,
}

/// Payload of [`Opcode::EEPROM_READ_WRITE`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EepromPayload {
    pub address: u64_le,
    /// An [`EepromControl`].
    pub control: u32_le,
    pub pad: u32_le,
}

#[bitfield(u32)]
pub struct ModuleControl {
    pub write: bool,
    #[bits(31)]
    _reserved: u32,
}

/// Payload of [`Opcode::MODULE_READ_WRITE`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ModulePayload {
    pub address: u64_le,
    pub device_id: u8,
    pub page: u8,
    pub offset: u8,
    pub len: u8,
    /// A [`ModuleControl`].
    pub control: u32_le,
}

/// Payload of [`Opcode::HEARTBEAT`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HeartbeatPayload {
    pub request_id: u8,
}

const_assert_eq!(size_of::<SensorPayload>(), 24);
const_assert_eq!(size_of::<DataPayload>(), 24);
const_assert_eq!(size_of::<EepromPayload>(), 16);
const_assert_eq!(size_of::<ModulePayload>(), 16);
const_assert_eq!(size_of::<HeartbeatPayload>(), 1);
const_assert_eq!(REQUEST_HEADER_SIZE + size_of::<DataPayload>(), REQUEST_ENTRY_SIZE);

/// Response payload of [`Opcode::IDENTIFY`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IdentifyResponse {
    pub ver_major: u8,
    pub ver_minor: u8,
    pub ver_patch: u8,
    pub local_changes: u8,
    pub dev_commits: u16_le,
    /// GCQ protocol version.
    pub link_ver_major: u8,
    pub link_ver_minor: u8,
}

/// Response payload of [`Opcode::HEARTBEAT`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HeartbeatResponse {
    pub request_id: u32_le,
    pub reserved: u32_le,
}

/// Response payload of [`Opcode::SENSOR`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SensorResponse {
    pub result: u32_le,
    pub reserved: u32_le,
}

const_assert_eq!(size_of::<IdentifyResponse>(), RESPONSE_PAYLOAD_SIZE);
const_assert_eq!(size_of::<HeartbeatResponse>(), RESPONSE_PAYLOAD_SIZE);
const_assert_eq!(size_of::<SensorResponse>(), RESPONSE_PAYLOAD_SIZE);

/// Shared memory layout published by the controller.
pub mod shared_mem {
    use super::u32_le;
    use static_assertions::const_assert_eq;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    /// Value of [`PartitionTable::magic`] once the controller is up.
    pub const GCQ_MAGIC: u32 = 0x564d_5230;
    /// Size of the log window at the start of the data region.
    pub const LOG_WINDOW_SIZE: u64 = 1024 * 1024;
    /// Size of a single firmware log record.
    pub const LOG_RECORD_SIZE: usize = 96;
    /// Number of records in the firmware log ring.
    pub const LOG_MAX_RECORDS: u32 = 50;

    /// The partition table at offset zero of the payload region.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct PartitionTable {
        pub magic: u32_le,
        pub ring_buffer_off: u32_le,
        pub ring_buffer_len: u32_le,
        pub status_off: u32_le,
        pub status_len: u32_le,
        /// Index of the next log record the controller will write.
        pub log_msg_index: u32_le,
        pub log_msg_buf_off: u32_le,
        pub log_msg_buf_len: u32_le,
        pub data_start: u32_le,
        /// Offset of the last byte of the data region (inclusive).
        pub data_end: u32_le,
    }

    const_assert_eq!(size_of::<PartitionTable>(), 40);

    /// Byte offset of [`PartitionTable::log_msg_index`].
    pub const LOG_MSG_INDEX_OFFSET: u64 = 20;

    impl PartitionTable {
        /// Total size of the data region, including the log window.
        pub fn data_region_size(&self) -> u64 {
            (self.data_end.get() as u64 + 1).saturating_sub(self.data_start.get() as u64)
        }
    }
}
