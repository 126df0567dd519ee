// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Relays the controller's firmware log into `tracing`.
//!
//! The controller writes NUL-terminated records into a ring in the payload
//! memory and publishes the index of the next record it will write. The relay
//! periodically emits every record between the last index it saw and the
//! published one.

use crate::cancel::CancelToken;
use amc_spec::shared_mem;
use amc_spec::shared_mem::PartitionTable;
use amc_transport::PayloadMemory;
use amc_transport::PayloadMemoryExt;
use amc_transport::TransportError;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LogRelayConfig {
    pub interval: Duration,
}

impl Default for LogRelayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// Reads new records out of the firmware log ring.
pub struct LogReader {
    memory: Arc<dyn PayloadMemory>,
    buf_offset: u64,
    next: u32,
    reported_invalid: bool,
}

impl std::fmt::Debug for LogReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReader")
            .field("buf_offset", &self.buf_offset)
            .field("next", &self.next)
            .finish()
    }
}

impl LogReader {
    pub fn new(memory: Arc<dyn PayloadMemory>, table: &PartitionTable) -> Self {
        Self {
            memory,
            buf_offset: table.log_msg_buf_off.get().into(),
            next: 0,
            reported_invalid: false,
        }
    }

    /// Passes each record published since the last call to `sink`.
    ///
    /// Returns the number of records read. Empty records are skipped.
    pub fn poll(&mut self, mut sink: impl FnMut(&str)) -> Result<usize, TransportError> {
        let current: u32 = self.memory.read_obj(shared_mem::LOG_MSG_INDEX_OFFSET)?;
        // An all-ones read means the card's memory went away under us.
        if current >= shared_mem::LOG_MAX_RECORDS {
            if !self.reported_invalid {
                self.reported_invalid = true;
                tracing::error!(index = current, "invalid firmware log index");
            }
            return Ok(0);
        }

        let mut count = 0;
        let mut record = [0u8; shared_mem::LOG_RECORD_SIZE];
        while self.next != current {
            let offset = self.buf_offset + u64::from(self.next) * shared_mem::LOG_RECORD_SIZE as u64;
            self.memory.read_at(offset, &mut record)?;
            if let Some(len) = record.iter().position(|&b| b == 0) {
                if len > 0 {
                    sink(&String::from_utf8_lossy(&record[..len]));
                }
            }
            count += 1;
            self.next = (self.next + 1) % shared_mem::LOG_MAX_RECORDS;
        }
        Ok(count)
    }
}

/// The background relay thread.
#[derive(Debug)]
pub struct LogRelay {
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl LogRelay {
    pub fn start(mut reader: LogReader, config: LogRelayConfig) -> std::io::Result<Self> {
        let cancel = CancelToken::new();
        let thread = thread::Builder::new().name("amc-log-relay".into()).spawn({
            let cancel = cancel.clone();
            move || {
                loop {
                    if let Err(err) = reader.poll(|message| {
                        tracing::info!(target: "amc_firmware", "{message}");
                    }) {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            "failed to read firmware log"
                        );
                    }
                    if !cancel.sleep(config.interval) {
                        break;
                    }
                }
            }
        })?;
        Ok(Self {
            cancel,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("log relay thread panicked");
            }
        }
    }
}

impl Drop for LogRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amc_emulated_mock::EmulatedAmc;
    use amc_emulated_mock::EmulatorConfig;

    fn collect(reader: &mut LogReader) -> Vec<String> {
        let mut messages = Vec::new();
        reader
            .poll(|message| messages.push(message.to_owned()))
            .unwrap();
        messages
    }

    #[test]
    fn reads_new_records() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        let mut reader = LogReader::new(amc.memory(), &amc.partition_table());
        assert!(collect(&mut reader).is_empty());

        amc.push_log("boot");
        amc.push_log("sensors up");
        assert_eq!(collect(&mut reader), ["boot", "sensors up"]);
        assert!(collect(&mut reader).is_empty());

        amc.push_log("ready");
        assert_eq!(collect(&mut reader), ["ready"]);
    }

    #[test]
    fn wraps_around_ring() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        let mut reader = LogReader::new(amc.memory(), &amc.partition_table());
        for i in 0..48 {
            amc.push_log(&format!("old {i}"));
        }
        assert_eq!(collect(&mut reader).len(), 48);

        for i in 0..4 {
            amc.push_log(&format!("new {i}"));
        }
        assert_eq!(collect(&mut reader), ["new 0", "new 1", "new 2", "new 3"]);
    }

    #[test]
    fn invalid_index_skipped() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        let mut reader = LogReader::new(amc.memory(), &amc.partition_table());
        amc.set_log_index(0xffff_ffff);
        assert_eq!(reader.poll(|_| panic!()).unwrap(), 0);
        amc.set_log_index(shared_mem::LOG_MAX_RECORDS);
        assert_eq!(reader.poll(|_| panic!()).unwrap(), 0);
        assert!(reader.reported_invalid);
    }

    #[test]
    fn relay_stops() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        amc.push_log("hello");
        let reader = LogReader::new(amc.memory(), &amc.partition_table());
        let mut relay = LogRelay::start(
            reader,
            LogRelayConfig {
                interval: Duration::from_millis(5),
            },
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        relay.stop();
    }
}
