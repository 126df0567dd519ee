// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process emulation of the AMC management controller, for testing the
//! host driver without hardware.
//!
//! The emulator services each request synchronously when it is written and
//! queues the completion, which becomes readable once the configured response
//! delay has elapsed. Faults can be injected per opcode or per chunk.

#![forbid(unsafe_code)]

use amc_spec::AmcResult;
use amc_spec::ChunkInfo;
use amc_spec::CompletionEntry;
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
use amc_spec::RequestHeader;
use amc_spec::ResponseHeader;
use amc_spec::SensorPayload;
use amc_spec::SensorSelector;
use amc_spec::shared_mem;
use amc_spec::shared_mem::PartitionTable;
use amc_transport::GcqTransport;
use amc_transport::PayloadMemory;
use amc_transport::TransportError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

const RING_BUFFER_OFFSET: u32 = 0x1000;
const STATUS_OFFSET: u32 = 0x2000;
const LOG_BUFFER_OFFSET: u32 = 0x3000;
const DATA_START: u32 = 0x1_0000;
const EEPROM_SIZE: usize = 256;
const MODULE_PAGE_SIZE: usize = 256;

/// Static properties of the emulated controller.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Firmware version as major, minor, patch.
    pub firmware_version: [u8; 3],
    pub dev_commits: u16,
    /// GCQ protocol version as major, minor.
    pub link_version: [u8; 2],
    /// Size of the payload memory region.
    pub memory_size: u32,
    /// Publish the partition table and status word at creation.
    pub ready: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            firmware_version: [1, 0, 0],
            dev_commits: 0,
            link_version: [1, 0],
            memory_size: 4 * 1024 * 1024,
            ready: true,
        }
    }
}

impl EmulatorConfig {
    pub fn identify_response(&self) -> IdentifyResponse {
        IdentifyResponse {
            ver_major: self.firmware_version[0],
            ver_minor: self.firmware_version[1],
            ver_patch: self.firmware_version[2],
            local_changes: 0,
            dev_commits: self.dev_commits.into(),
            link_ver_major: self.link_version[0],
            link_ver_minor: self.link_version[1],
        }
    }
}

/// Flash destination of a recorded download chunk.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FlashTarget {
    Partition(u8),
    Fpt,
}

/// A request as the controller received it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub header: RequestHeader,
    pub payload: Vec<u8>,
}

impl RecordedRequest {
    pub fn opcode(&self) -> Opcode {
        Opcode(self.header.opcode())
    }
}

/// A download chunk the controller accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedChunk {
    pub target: FlashTarget,
    pub index: u16,
    pub last: bool,
    pub data: Vec<u8>,
}

/// The emulated controller. Clones share state.
#[derive(Debug, Clone)]
pub struct EmulatedAmc {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: EmulatorConfig,
    memory: Mutex<Vec<u8>>,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    open: bool,
    completions: VecDeque<(Instant, CompletionEntry)>,
    requests: Vec<RecordedRequest>,
    chunks: Vec<RecordedChunk>,
    flash: HashMap<FlashTarget, Vec<u8>>,
    boot_partition: Option<u8>,
    copies: Vec<(u8, u8, u32)>,
    eeprom: Vec<u8>,
    modules: HashMap<(u8, u8), Vec<u8>>,
    log_index: u32,
    faults: Faults,
}

#[derive(Debug, Default)]
struct Faults {
    response_delay: Duration,
    drop_responses: bool,
    fail_open: bool,
    fail_close: bool,
    fail_writes: bool,
    forced_results: HashMap<Opcode, AmcResult>,
    heartbeat_echo_offset: u8,
    failed_chunks: Vec<u16>,
    sensor_result: u32,
}

impl EmulatedAmc {
    pub fn new(config: EmulatorConfig) -> Self {
        let amc = Self {
            inner: Arc::new(Inner {
                memory: Mutex::new(vec![0; config.memory_size as usize]),
                state: Mutex::new(State {
                    eeprom: vec![0; EEPROM_SIZE],
                    ..Default::default()
                }),
                config,
            }),
        };
        amc.write_partition_table();
        if amc.inner.config.ready {
            amc.set_ready(true);
        }
        amc
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> Arc<dyn GcqTransport> {
        self.inner.clone()
    }

    pub fn memory(&self) -> Arc<dyn PayloadMemory> {
        self.inner.clone()
    }

    pub fn partition_table(&self) -> PartitionTable {
        let config = &self.inner.config;
        PartitionTable {
            magic: shared_mem::GCQ_MAGIC.into(),
            ring_buffer_off: RING_BUFFER_OFFSET.into(),
            ring_buffer_len: (STATUS_OFFSET - RING_BUFFER_OFFSET).into(),
            status_off: STATUS_OFFSET.into(),
            status_len: 4u32.into(),
            log_msg_index: self.inner.state.lock().log_index.into(),
            log_msg_buf_off: LOG_BUFFER_OFFSET.into(),
            log_msg_buf_len: (shared_mem::LOG_RECORD_SIZE as u32 * shared_mem::LOG_MAX_RECORDS)
                .into(),
            data_start: DATA_START.into(),
            data_end: (config.memory_size - 1).into(),
        }
    }

    fn write_partition_table(&self) {
        let mut table = self.partition_table();
        table.magic = 0u32.into();
        self.inner.poke(0, table.as_bytes());
    }

    /// Publishes or withdraws the ready indication (magic and status word).
    pub fn set_ready(&self, ready: bool) {
        let (magic, status) = if ready {
            (shared_mem::GCQ_MAGIC, 1u32)
        } else {
            (0, 0)
        };
        self.inner.poke(0, &magic.to_le_bytes());
        self.inner
            .poke(STATUS_OFFSET as usize, &status.to_le_bytes());
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    pub fn set_response_delay(&self, delay: Duration) {
        self.inner.state.lock().faults.response_delay = delay;
    }

    /// Accepts requests without ever completing them.
    pub fn set_drop_responses(&self, drop: bool) {
        self.inner.state.lock().faults.drop_responses = drop;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.inner.state.lock().faults.fail_open = fail;
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.inner.state.lock().faults.fail_close = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.state.lock().faults.fail_writes = fail;
    }

    /// Completes every later `opcode` request with `result`.
    pub fn force_result(&self, opcode: Opcode, result: AmcResult) {
        self.inner
            .state
            .lock()
            .faults
            .forced_results
            .insert(opcode, result);
    }

    pub fn clear_forced_results(&self) {
        self.inner.state.lock().faults.forced_results.clear();
    }

    /// Heartbeats are echoed with `offset` added to the request id.
    pub fn set_heartbeat_echo_offset(&self, offset: u8) {
        self.inner.state.lock().faults.heartbeat_echo_offset = offset;
    }

    /// Fails the download of the chunk with index `index`.
    pub fn fail_chunk(&self, index: u16) {
        self.inner.state.lock().faults.failed_chunks.push(index);
    }

    /// Result reported in the sensor response body.
    pub fn set_sensor_result(&self, result: u32) {
        self.inner.state.lock().faults.sensor_result = result;
    }

    /// Queues a completion as if the controller had written it.
    pub fn inject_completion(&self, entry: CompletionEntry) {
        self.inner
            .state
            .lock()
            .completions
            .push_back((Instant::now(), entry));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.state.lock().requests.clone()
    }

    pub fn chunks(&self) -> Vec<RecordedChunk> {
        self.inner.state.lock().chunks.clone()
    }

    /// The contents of a flash target, as assembled from downloaded chunks.
    pub fn flash(&self, target: FlashTarget) -> Vec<u8> {
        self.inner
            .state
            .lock()
            .flash
            .get(&target)
            .cloned()
            .unwrap_or_default()
    }

    pub fn boot_partition(&self) -> Option<u8> {
        self.inner.state.lock().boot_partition
    }

    /// Partition copies as (source, destination, size).
    pub fn copies(&self) -> Vec<(u8, u8, u32)> {
        self.inner.state.lock().copies.clone()
    }

    /// Appends a firmware log record and advances the log index.
    pub fn push_log(&self, message: &str) {
        let mut state = self.inner.state.lock();
        let index = state.log_index % shared_mem::LOG_MAX_RECORDS;
        let mut record = [0u8; shared_mem::LOG_RECORD_SIZE];
        let len = message.len().min(record.len() - 1);
        record[..len].copy_from_slice(&message.as_bytes()[..len]);
        let offset = LOG_BUFFER_OFFSET as usize + index as usize * shared_mem::LOG_RECORD_SIZE;
        self.inner.poke(offset, &record);
        state.log_index = (index + 1) % shared_mem::LOG_MAX_RECORDS;
        self.inner.poke(
            shared_mem::LOG_MSG_INDEX_OFFSET as usize,
            &state.log_index.to_le_bytes(),
        );
    }

    /// Overwrites the published log index, valid or not.
    pub fn set_log_index(&self, index: u32) {
        self.inner.state.lock().log_index = index;
        self.inner
            .poke(shared_mem::LOG_MSG_INDEX_OFFSET as usize, &index.to_le_bytes());
    }
}

/// The bytes the emulator returns for a sensor read.
pub fn sensor_pattern(selector: SensorSelector, len: usize) -> Vec<u8> {
    let seed = selector
        .sid()
        .wrapping_mul(31)
        .wrapping_add(selector.aid().wrapping_mul(7))
        .wrapping_add(selector.sensor_id());
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

impl Inner {
    fn poke(&self, offset: usize, data: &[u8]) {
        let mut memory = self.memory.lock();
        if let Some(dst) = memory.get_mut(offset..offset + data.len()) {
            dst.copy_from_slice(data);
        }
    }

    fn peek(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        let memory = self.memory.lock();
        let offset = usize::try_from(offset).ok()?;
        memory.get(offset..offset.checked_add(len)?).map(|b| b.to_vec())
    }

    /// Services one request. Returns the response payload and return code.
    fn process(&self, state: &mut State, opcode: Opcode, payload: &[u8]) -> (u64, u32) {
        let ok = |response: &[u8]| {
            let mut raw = [0; RESPONSE_PAYLOAD_SIZE];
            raw[..response.len()].copy_from_slice(response);
            (u64::from_le_bytes(raw), AmcResult::SUCCESS.0)
        };
        let fail = |result: AmcResult| (0u64, result.0);

        match opcode {
            Opcode::IDENTIFY => ok(self.config.identify_response().as_bytes()),
            Opcode::HEARTBEAT => {
                let Ok((request, _)) = HeartbeatPayload::read_from_prefix(payload) else {
                    return fail(AmcResult::INVALID_VALUE);
                };
                let echo = request
                    .request_id
                    .wrapping_add(state.faults.heartbeat_echo_offset);
                let response = HeartbeatResponse {
                    request_id: (echo as u32).into(),
                    reserved: 0u32.into(),
                };
                ok(response.as_bytes())
            }
            Opcode::SENSOR => {
                let Ok((request, _)) = SensorPayload::read_from_prefix(payload) else {
                    return fail(AmcResult::INVALID_VALUE);
                };
                let selector = SensorSelector::from_bits(request.selector.get());
                let data = sensor_pattern(selector, request.size.get() as usize);
                self.poke(request.address.get() as usize, &data);
                ok(&state.faults.sensor_result.to_le_bytes())
            }
            Opcode::PDI_DOWNLOAD => {
                let Ok((request, _)) = DataPayload::read_from_prefix(payload) else {
                    return fail(AmcResult::INVALID_VALUE);
                };
                let selector = PartitionSelector::from_bits(request.partition.get());
                let chunk = ChunkInfo::from_bits(request.chunk.get());
                if state.faults.failed_chunks.contains(&chunk.chunk()) {
                    return fail(AmcResult::FAILURE);
                }
                let Some(data) = self.peek(request.address.get(), request.size.get() as usize)
                else {
                    return fail(AmcResult::INVALID_VALUE);
                };
                let target = if selector.update_fpt() {
                    FlashTarget::Fpt
                } else {
                    FlashTarget::Partition(selector.partition_sel())
                };
                let offset = chunk.chunk() as usize * request.chunk_size.get() as usize * 1024;
                let flash = state.flash.entry(target).or_default();
                if flash.len() < offset + data.len() {
                    flash.resize(offset + data.len(), 0xff);
                }
                flash[offset..offset + data.len()].copy_from_slice(&data);
                state.chunks.push(RecordedChunk {
                    target,
                    index: chunk.chunk(),
                    last: chunk.last_chunk(),
                    data,
                });
                ok(&[])
            }
            Opcode::DEVICE_BOOT => {
                let Ok((request, _)) = DataPayload::read_from_prefix(payload) else {
                    return fail(AmcResult::INVALID_VALUE);
                };
                let selector = PartitionSelector::from_bits(request.partition.get());
                state.boot_partition = Some(selector.partition_sel());
                ok(&[])
            }
            Opcode::PARTITION_COPY => {
                let Ok((request, _)) = DataPayload::read_from_prefix(payload) else {
                    return fail(AmcResult::INVALID_VALUE);
                };
                let selector = PartitionSelector::from_bits(request.partition.get());
                state.copies.push((
                    selector.src_partition(),
                    selector.dest_partition(),
                    request.size.get(),
                ));
                ok(&[])
            }
            Opcode::EEPROM_READ_WRITE => {
                let Ok((request, _)) = EepromPayload::read_from_prefix(payload) else {
                    return fail(AmcResult::INVALID_VALUE);
                };
                let control = EepromControl::from_bits(request.control.get());
                let start = control.offset() as usize;
                let end = start + control.len() as usize;
                if end > EEPROM_SIZE {
                    return fail(AmcResult::INVALID_VALUE);
                }
                let address = request.address.get();
                if control.write() {
                    let Some(data) = self.peek(address, end - start) else {
                        return fail(AmcResult::INVALID_VALUE);
                    };
                    state.eeprom[start..end].copy_from_slice(&data);
                } else {
                    self.poke(address as usize, &state.eeprom[start..end]);
                }
                ok(&[])
            }
            Opcode::MODULE_READ_WRITE => {
                let Ok((request, _)) = ModulePayload::read_from_prefix(payload) else {
                    return fail(AmcResult::INVALID_VALUE);
                };
                let control = ModuleControl::from_bits(request.control.get());
                let start = request.offset as usize;
                let end = start + request.len as usize;
                if end > MODULE_PAGE_SIZE {
                    return fail(AmcResult::INVALID_VALUE);
                }
                let address = request.address.get();
                let page = state
                    .modules
                    .entry((request.device_id, request.page))
                    .or_insert_with(|| vec![0; MODULE_PAGE_SIZE]);
                if control.write() {
                    let Some(data) = self.peek(address, end - start) else {
                        return fail(AmcResult::INVALID_VALUE);
                    };
                    page[start..end].copy_from_slice(&data);
                } else {
                    self.poke(address as usize, &page[start..end]);
                }
                ok(&[])
            }
            _ => fail(AmcResult::INVALID_VALUE),
        }
    }
}

impl GcqTransport for Inner {
    fn open(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.faults.fail_open {
            return Err(TransportError::Device(std::io::Error::other(
                "emulated open failure",
            )));
        }
        state.open = true;
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.open = false;
        if state.faults.fail_close {
            return Err(TransportError::Device(std::io::Error::other(
                "emulated close failure",
            )));
        }
        Ok(())
    }

    fn write(&self, _offset: u64, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if state.faults.fail_writes {
            return Err(TransportError::Device(std::io::Error::other(
                "emulated write failure",
            )));
        }

        let header = amc_spec::decode_request_header(data).map_err(|_| {
            TransportError::OutOfBounds {
                offset: 0,
                len: data.len(),
            }
        })?;
        let start = amc_spec::REQUEST_HEADER_SIZE;
        let end = (start + header.count() as usize).min(data.len());
        let payload = data[start..end].to_vec();
        state.requests.push(RecordedRequest {
            header,
            payload: payload.clone(),
        });

        let opcode = Opcode(header.opcode());
        if state.faults.drop_responses {
            tracing::trace!(cid = header.cid(), ?opcode, "dropping response");
            return Ok(());
        }

        let forced = state.faults.forced_results.get(&opcode).copied();
        let (response, rcode) = match forced {
            Some(result) => (0, result.0),
            None => self.process(&mut state, opcode, &payload),
        };
        let entry = CompletionEntry::new(
            ResponseHeader::new()
                .with_cid(header.cid())
                .with_new_entry(true),
            response.to_le_bytes(),
            rcode,
        );
        let ready_at = Instant::now() + state.faults.response_delay;
        state.completions.push_back((ready_at, entry));
        Ok(())
    }

    fn read(&self, _offset: u64, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        match state.completions.front() {
            Some((ready_at, _)) if *ready_at <= Instant::now() => {}
            _ => return Ok(0),
        }
        let Some((_, entry)) = state.completions.pop_front() else {
            return Ok(0);
        };
        let bytes = entry.as_bytes();
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(len)
    }
}

impl PayloadMemory for Inner {
    fn len(&self) -> u64 {
        self.memory.lock().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), TransportError> {
        let memory = self.memory.lock();
        amc_transport::check_bounds(memory.len() as u64, offset, buf.len())?;
        let offset = offset as usize;
        buf.copy_from_slice(&memory[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), TransportError> {
        let mut memory = self.memory.lock();
        amc_transport::check_bounds(memory.len() as u64, offset, data.len())?;
        let offset = offset as usize;
        memory[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}
