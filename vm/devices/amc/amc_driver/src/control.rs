// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The command orchestrator.
//!
//! Each typed operation runs the same sequence: check that services are not
//! halted, take the shared window the operation needs, allocate a command id,
//! submit through the proxy, wait for the result, and decode it. The window
//! lease and the command id are scoped guards, so they are released on every
//! exit path.

use crate::cancel::CancelToken;
use crate::cid::CidAllocator;
use crate::cid::CidError;
use crate::cid::CidGuard;
use crate::cid::OwnerId;
use crate::proxy::CommandDescriptor;
use crate::proxy::DescriptorStatus;
use crate::proxy::ProxyEngine;
use crate::proxy::ProxyError;
use crate::sensor::SensorQuery;
use crate::window::WindowArbiter;
use crate::window::WindowError;
use crate::window::WindowKind;
use crate::window::WindowLease;
use amc_spec::AmcResult;
use amc_spec::ChunkInfo;
use amc_spec::DataPayload;
use amc_spec::EepromControl;
use amc_spec::EepromPayload;
use amc_spec::HeartbeatPayload;
use amc_spec::HeartbeatResponse;
use amc_spec::IdentifyResponse;
use amc_spec::ModuleControl;
use amc_spec::ModulePayload;
use amc_spec::Opcode;
use amc_spec::PartitionSelector;
use amc_spec::RESPONSE_PAYLOAD_SIZE;
use amc_spec::SensorPayload;
use amc_spec::SensorResponse;
use amc_spec::SensorResult;
use amc_spec::WireError;
use amc_transport::PayloadMemory;
use amc_transport::TransportError;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// Highest flash partition number.
pub const MAX_PARTITION: u8 = 15;
/// Image download chunk size in KiB.
pub const CHUNK_SIZE_KIB: u16 = 32;
/// Image download chunk size in bytes.
pub const CHUNK_SIZE: usize = CHUNK_SIZE_KIB as usize * 1024;
/// Longest EEPROM or module transfer.
pub const MAX_DEVICE_TRANSFER: usize = u8::MAX as usize;

/// A logical AMC operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Identify,
    Sensor,
    ImageDownload,
    BootSelect,
    PartitionCopy,
    Heartbeat,
    EepromReadWrite,
    ModuleReadWrite,
}

impl OperationKind {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Identify => Opcode::IDENTIFY,
            Self::Sensor => Opcode::SENSOR,
            Self::ImageDownload => Opcode::PDI_DOWNLOAD,
            Self::BootSelect => Opcode::DEVICE_BOOT,
            Self::PartitionCopy => Opcode::PARTITION_COPY,
            Self::Heartbeat => Opcode::HEARTBEAT,
            Self::EepromReadWrite => Opcode::EEPROM_READ_WRITE,
            Self::ModuleReadWrite => Opcode::MODULE_READ_WRITE,
        }
    }

    /// The shared window the operation exchanges data through, if any.
    pub fn window(&self) -> Option<WindowKind> {
        match self {
            Self::Sensor => Some(WindowKind::Log),
            Self::ImageDownload
            | Self::PartitionCopy
            | Self::EepromReadWrite
            | Self::ModuleReadWrite => Some(WindowKind::Data),
            Self::Identify | Self::Heartbeat | Self::BootSelect => None,
        }
    }

    pub fn timeout(&self, timeouts: &CommandTimeouts) -> Duration {
        match self {
            Self::ImageDownload => timeouts.download,
            Self::PartitionCopy => timeouts.partition_copy,
            Self::Heartbeat => timeouts.heartbeat,
            Self::Identify
            | Self::Sensor
            | Self::BootSelect
            | Self::EepromReadWrite
            | Self::ModuleReadWrite => timeouts.generic,
        }
    }

    /// Whether routine per-command logging is skipped.
    pub fn suppress_log(&self) -> bool {
        matches!(self, Self::Heartbeat)
    }
}

/// Per-operation response deadlines.
#[derive(Debug, Clone)]
pub struct CommandTimeouts {
    pub generic: Duration,
    pub download: Duration,
    pub partition_copy: Duration,
    pub heartbeat: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            generic: Duration::from_secs(30),
            download: Duration::from_secs(30),
            partition_copy: Duration::from_secs(60 * 60),
            heartbeat: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Error)]
pub enum AmcError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("request cannot be encoded")]
    InvalidPayload(#[source] WireError),
    #[error("amc service is busy")]
    Busy(#[source] BusyReason),
    #[error("failed to submit the request")]
    Io(#[source] ProxyError),
    #[error("{0:?} request timed out")]
    Timeout(OperationKind),
    #[error("interrupted")]
    Interrupted,
    #[error("{kind:?} request failed with {result:?}")]
    Protocol {
        kind: OperationKind,
        result: AmcResult,
    },
    #[error("sensor read failed with {0:?}")]
    Sensor(SensorResult),
    #[error("request of {requested} bytes exceeds the {available} byte window")]
    Exhausted { requested: u64, available: u64 },
    #[error("shared memory access failed")]
    Memory(#[source] TransportError),
}

#[derive(Debug, Error)]
pub enum BusyReason {
    #[error("services are halted")]
    Halted,
    #[error("no command id available")]
    CommandIds(#[source] CidError),
}

/// Firmware version reported by identify.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    /// The build has uncommitted changes.
    pub local_changes: bool,
    /// Commits since the release tag.
    pub dev_commits: u16,
}

/// The identify response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Identity {
    pub version: FirmwareVersion,
    /// GCQ protocol version as (major, minor).
    pub link_version: (u8, u8),
}

impl From<IdentifyResponse> for Identity {
    fn from(raw: IdentifyResponse) -> Self {
        Self {
            version: FirmwareVersion {
                major: raw.ver_major,
                minor: raw.ver_minor,
                patch: raw.ver_patch,
                local_changes: raw.local_changes != 0,
                dev_commits: raw.dev_commits.get(),
            },
            link_version: (raw.link_ver_major, raw.link_ver_minor),
        }
    }
}

/// Destination of an image download.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    Partition(u8),
    /// The flash partition table.
    Fpt,
}

/// One chunk of an image download.
#[derive(Debug, Copy, Clone)]
pub struct DownloadChunk<'a> {
    pub target: DownloadTarget,
    pub index: u16,
    pub last: bool,
    pub data: &'a [u8],
}

/// Addresses a page of a pluggable module (for example a QSFP cage).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ModuleAddress {
    pub device_id: u8,
    pub page: u8,
    pub offset: u8,
}

enum Transfer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Transfer<'_> {
    fn len(&self) -> usize {
        match self {
            Transfer::Read(buf) => buf.len(),
            Transfer::Write(data) => data.len(),
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, Transfer::Write(_))
    }
}

/// Issues typed commands to the management controller.
pub struct AmcControl {
    proxy: Arc<ProxyEngine>,
    memory: Arc<dyn PayloadMemory>,
    windows: WindowArbiter,
    cids: Arc<CidAllocator>,
    owner: OwnerId,
    timeouts: CommandTimeouts,
    halted: AtomicBool,
}

impl std::fmt::Debug for AmcControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmcControl")
            .field("owner", &self.owner)
            .field("halted", &self.is_halted())
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl AmcControl {
    /// Creates the orchestrator and binds it to `proxy`.
    ///
    /// Services start halted; call [`Self::resume_services`] once the
    /// controller is known to be ready.
    pub fn new(
        proxy: Arc<ProxyEngine>,
        memory: Arc<dyn PayloadMemory>,
        windows: WindowArbiter,
        cids: Arc<CidAllocator>,
        timeouts: CommandTimeouts,
    ) -> Result<Self, ProxyError> {
        proxy.bind_callback(Box::new(|_event, descriptor| descriptor.signal()))?;
        Ok(Self {
            proxy,
            memory,
            windows,
            cids,
            owner: OwnerId::new(),
            timeouts,
            halted: AtomicBool::new(true),
        })
    }

    pub fn proxy(&self) -> &ProxyEngine {
        &self.proxy
    }

    pub fn windows(&self) -> &WindowArbiter {
        &self.windows
    }

    pub fn memory(&self) -> &dyn PayloadMemory {
        self.memory.as_ref()
    }

    /// Rejects new commands until [`Self::resume_services`].
    pub fn stop_services(&self) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            tracing::info!("amc services stopped");
        }
    }

    /// Accepts commands again, after the card has been reset.
    pub fn resume_services(&self) {
        if self.halted.swap(false, Ordering::AcqRel) {
            tracing::info!("amc services resumed");
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn check_running(&self) -> Result<(), AmcError> {
        if self.is_halted() {
            return Err(AmcError::Busy(BusyReason::Halted));
        }
        Ok(())
    }

    fn acquire(
        &self,
        kind: WindowKind,
        cancel: &CancelToken,
    ) -> Result<WindowLease<'_>, AmcError> {
        self.windows
            .acquire(kind, cancel)
            .map_err(|WindowError::Cancelled(_)| AmcError::Interrupted)
    }

    /// Submits one command and waits for its response payload.
    fn execute(
        &self,
        kind: OperationKind,
        payload: &[u8],
        cancel: &CancelToken,
    ) -> Result<[u8; RESPONSE_PAYLOAD_SIZE], AmcError> {
        let cid = CidGuard::new(&self.cids, self.owner)
            .map_err(|err| AmcError::Busy(BusyReason::CommandIds(err)))?;
        let request = amc_spec::encode_request(kind.opcode(), cid.cid(), payload)
            .map_err(AmcError::InvalidPayload)?;

        let descriptor = CommandDescriptor::new(cid.cid(), kind, kind.timeout(&self.timeouts));
        self.proxy
            .submit(&descriptor, &request)
            .map_err(AmcError::Io)?;

        if !descriptor.wait(cancel) {
            self.proxy.abort(&descriptor);
            return Err(AmcError::Interrupted);
        }

        match descriptor.status() {
            DescriptorStatus::Completed => {}
            DescriptorStatus::TimedOut => return Err(AmcError::Timeout(kind)),
            DescriptorStatus::Pending | DescriptorStatus::Aborted => {
                return Err(AmcError::Interrupted);
            }
        }

        let result = AmcResult(descriptor.rcode());
        if !result.is_success() {
            if !kind.suppress_log() {
                tracing::error!(cid = cid.cid(), ?kind, ?result, "request failed");
            }
            return Err(AmcError::Protocol { kind, result });
        }
        Ok(descriptor.response())
    }

    /// Runs a command that moves `transfer` through its window.
    ///
    /// `check` validates the response before anything is copied back into a
    /// read buffer. Returns the response and the number of bytes transferred,
    /// which is capped to the window length.
    fn execute_transfer<P: IntoBytes + Immutable>(
        &self,
        kind: OperationKind,
        mut transfer: Transfer<'_>,
        cancel: &CancelToken,
        build: impl FnOnce(u64, u32) -> P,
        check: impl FnOnce(&[u8; RESPONSE_PAYLOAD_SIZE]) -> Result<(), AmcError>,
    ) -> Result<([u8; RESPONSE_PAYLOAD_SIZE], usize), AmcError> {
        self.check_running()?;
        let window = kind
            .window()
            .ok_or(AmcError::InvalidParameter("operation has no window"))?;
        let lease = self.acquire(window, cancel)?;

        let requested = transfer.len() as u64;
        let size = if requested > lease.len() {
            tracing::warn!(
                ?kind,
                requested,
                available = lease.len(),
                "request truncated to window"
            );
            lease.len() as usize
        } else {
            transfer.len()
        };
        let wire_size =
            u32::try_from(size).map_err(|_| AmcError::InvalidParameter("transfer too large"))?;

        if let Transfer::Write(data) = &transfer {
            self.memory
                .write_at(lease.base(), &data[..size])
                .map_err(AmcError::Memory)?;
        }

        let payload = build(lease.base(), wire_size);
        let response = self.execute(kind, payload.as_bytes(), cancel)?;
        check(&response)?;

        if let Transfer::Read(buf) = &mut transfer {
            self.memory
                .read_at(lease.base(), &mut buf[..size])
                .map_err(AmcError::Memory)?;
        }
        Ok((response, size))
    }

    /// Reads the controller firmware and protocol versions.
    pub fn identify(&self, cancel: &CancelToken) -> Result<Identity, AmcError> {
        self.check_running()?;
        let response = self.execute(OperationKind::Identify, &[], cancel)?;
        let raw: IdentifyResponse = zerocopy::transmute!(response);
        Ok(raw.into())
    }

    /// Sends a liveness probe and returns the echoed request id.
    pub fn heartbeat(&self, request_id: u8, cancel: &CancelToken) -> Result<u8, AmcError> {
        self.check_running()?;
        let payload = HeartbeatPayload { request_id };
        let response = self.execute(OperationKind::Heartbeat, payload.as_bytes(), cancel)?;
        let raw: HeartbeatResponse = zerocopy::transmute!(response);
        Ok(raw.request_id.get() as u8)
    }

    /// Reads sensor data into `buf`, returning the number of bytes read.
    pub fn read_sensor(
        &self,
        query: SensorQuery,
        buf: &mut [u8],
        cancel: &CancelToken,
    ) -> Result<usize, AmcError> {
        if buf.is_empty() {
            return Err(AmcError::InvalidParameter("empty sensor buffer"));
        }
        let selector = query.selector()?;
        let (_, size) = self.execute_transfer(
            OperationKind::Sensor,
            Transfer::Read(buf),
            cancel,
            |address, size| SensorPayload {
                address: address.into(),
                size: size.into(),
                selector: selector.into_bits().into(),
                ..FromZeros::new_zeroed()
            },
            |response| {
                let raw: SensorResponse = zerocopy::transmute!(*response);
                let result = SensorResult(raw.result.get());
                if !result.is_success() {
                    tracing::error!(?query, ?result, "sensor read failed");
                    return Err(AmcError::Sensor(result));
                }
                Ok(())
            },
        )?;
        Ok(size)
    }

    /// Writes one chunk of a flash image. Returns the bytes accepted.
    pub fn download_chunk(
        &self,
        chunk: &DownloadChunk<'_>,
        cancel: &CancelToken,
    ) -> Result<usize, AmcError> {
        if chunk.data.is_empty() {
            return Err(AmcError::InvalidParameter("empty chunk"));
        }
        let partition = match chunk.target {
            DownloadTarget::Partition(partition) => {
                PartitionSelector::new().with_partition_sel(check_partition(partition)?)
            }
            DownloadTarget::Fpt => PartitionSelector::new().with_update_fpt(true),
        };
        if chunk.index > 0x7fff {
            return Err(AmcError::InvalidParameter("chunk index out of range"));
        }
        let info = ChunkInfo::new()
            .with_last_chunk(chunk.last)
            .with_chunk(chunk.index);

        let (_, size) = self.execute_transfer(
            OperationKind::ImageDownload,
            Transfer::Write(chunk.data),
            cancel,
            |address, size| DataPayload {
                address: address.into(),
                size: size.into(),
                partition: partition.into_bits().into(),
                chunk: info.into_bits().into(),
                chunk_size: CHUNK_SIZE_KIB.into(),
                ..FromZeros::new_zeroed()
            },
            |_| Ok(()),
        )?;
        Ok(size)
    }

    /// Selects the partition the card boots from on the next reset.
    pub fn select_boot_partition(
        &self,
        partition: u8,
        cancel: &CancelToken,
    ) -> Result<(), AmcError> {
        let partition = check_partition(partition)?;
        self.check_running()?;
        let payload = DataPayload {
            partition: PartitionSelector::new()
                .with_partition_sel(partition)
                .into_bits()
                .into(),
            ..FromZeros::new_zeroed()
        };
        self.execute(OperationKind::BootSelect, payload.as_bytes(), cancel)?;
        Ok(())
    }

    /// Copies `size` bytes of partition `src` to partition `dest`.
    ///
    /// The controller stages the copy in the data window, which must hold the
    /// whole source partition.
    pub fn copy_partition(
        &self,
        src: u8,
        dest: u8,
        size: u64,
        cancel: &CancelToken,
    ) -> Result<(), AmcError> {
        let src = check_partition(src)?;
        let dest = check_partition(dest)?;
        if size == 0 {
            return Err(AmcError::InvalidParameter("empty partition copy"));
        }
        self.check_running()?;

        let lease = self.acquire(WindowKind::Data, cancel)?;
        if lease.len() < size {
            tracing::error!(
                requested = size,
                available = lease.len(),
                "partition copy does not fit the data window"
            );
            return Err(AmcError::Exhausted {
                requested: size,
                available: lease.len(),
            });
        }
        let size = u32::try_from(size)
            .map_err(|_| AmcError::InvalidParameter("partition copy too large"))?;

        let payload = DataPayload {
            address: lease.base().into(),
            size: size.into(),
            partition: PartitionSelector::new()
                .with_src_partition(src)
                .with_dest_partition(dest)
                .into_bits()
                .into(),
            ..FromZeros::new_zeroed()
        };
        self.execute(OperationKind::PartitionCopy, payload.as_bytes(), cancel)?;
        Ok(())
    }

    fn eeprom(
        &self,
        offset: u8,
        transfer: Transfer<'_>,
        cancel: &CancelToken,
    ) -> Result<usize, AmcError> {
        check_device_transfer(transfer.len())?;
        let write = transfer.is_write();
        let (_, size) = self.execute_transfer(
            OperationKind::EepromReadWrite,
            transfer,
            cancel,
            |address, size| EepromPayload {
                address: address.into(),
                control: EepromControl::new()
                    .with_write(write)
                    .with_len(size as u8)
                    .with_offset(offset)
                    .into_bits()
                    .into(),
                ..FromZeros::new_zeroed()
            },
            |_| Ok(()),
        )?;
        Ok(size)
    }

    /// Reads the board EEPROM starting at `offset`.
    pub fn eeprom_read(
        &self,
        offset: u8,
        buf: &mut [u8],
        cancel: &CancelToken,
    ) -> Result<usize, AmcError> {
        self.eeprom(offset, Transfer::Read(buf), cancel)
    }

    pub fn eeprom_write(
        &self,
        offset: u8,
        data: &[u8],
        cancel: &CancelToken,
    ) -> Result<usize, AmcError> {
        self.eeprom(offset, Transfer::Write(data), cancel)
    }

    fn module(
        &self,
        target: ModuleAddress,
        transfer: Transfer<'_>,
        cancel: &CancelToken,
    ) -> Result<usize, AmcError> {
        check_device_transfer(transfer.len())?;
        let write = transfer.is_write();
        let (_, size) = self.execute_transfer(
            OperationKind::ModuleReadWrite,
            transfer,
            cancel,
            |address, size| ModulePayload {
                address: address.into(),
                device_id: target.device_id,
                page: target.page,
                offset: target.offset,
                len: size as u8,
                control: ModuleControl::new().with_write(write).into_bits().into(),
            },
            |_| Ok(()),
        )?;
        Ok(size)
    }

    /// Reads from a pluggable module.
    pub fn module_read(
        &self,
        target: ModuleAddress,
        buf: &mut [u8],
        cancel: &CancelToken,
    ) -> Result<usize, AmcError> {
        self.module(target, Transfer::Read(buf), cancel)
    }

    pub fn module_write(
        &self,
        target: ModuleAddress,
        data: &[u8],
        cancel: &CancelToken,
    ) -> Result<usize, AmcError> {
        self.module(target, Transfer::Write(data), cancel)
    }
}

fn check_partition(partition: u8) -> Result<u8, AmcError> {
    if partition > MAX_PARTITION {
        return Err(AmcError::InvalidParameter("partition out of range"));
    }
    Ok(partition)
}

fn check_device_transfer(len: usize) -> Result<(), AmcError> {
    if len == 0 || len > MAX_DEVICE_TRANSFER {
        return Err(AmcError::InvalidParameter("transfer length must be 1 to 255"));
    }
    Ok(())
}
