// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Controller readiness probe and shared window layout.

use crate::cancel::CancelToken;
use crate::window::WindowRegion;
use amc_spec::shared_mem;
use amc_spec::shared_mem::PartitionTable;
use amc_transport::PayloadMemory;
use amc_transport::PayloadMemoryExt;
use amc_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ReadyConfig {
    pub retries: u32,
    /// Sleep before each attempt.
    pub interval: Duration,
}

impl Default for ReadyConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReadyError {
    #[error("controller not ready after {0} attempts")]
    NotReady(u32),
    #[error("readiness probe cancelled")]
    Cancelled,
    #[error("data region of {size:#x} bytes cannot hold the log window")]
    InvalidLayout { size: u64 },
    #[error("failed to read the partition table")]
    Memory(#[source] TransportError),
}

/// Waits for the controller to publish its partition table and report ready.
pub fn wait_for_ready(
    memory: &dyn PayloadMemory,
    config: &ReadyConfig,
    cancel: &CancelToken,
) -> Result<PartitionTable, ReadyError> {
    for attempt in 1..=config.retries {
        if !cancel.sleep(config.interval) {
            return Err(ReadyError::Cancelled);
        }

        let table: PartitionTable = memory.read_obj(0).map_err(ReadyError::Memory)?;
        if table.magic.get() != shared_mem::GCQ_MAGIC {
            tracing::debug!(attempt, magic = table.magic.get(), "partition table not published");
            continue;
        }
        let status_off = u64::from(table.status_off.get());
        if status_off + size_of::<u32>() as u64 > memory.len() {
            tracing::debug!(attempt, status_off, "status word outside payload memory");
            continue;
        }
        let status: u32 = memory.read_obj(status_off).map_err(ReadyError::Memory)?;
        if status != 0 {
            tracing::debug!(attempt, "controller ready");
            return Ok(table);
        }
        tracing::debug!(attempt, "controller status not ready");
    }
    Err(ReadyError::NotReady(config.retries))
}

/// Splits the data region into the log window and the data window.
///
/// The log window is the first megabyte of the region and the data window is
/// the rest.
pub fn window_layout(table: &PartitionTable) -> Result<(WindowRegion, WindowRegion), ReadyError> {
    let size = table.data_region_size();
    if size <= shared_mem::LOG_WINDOW_SIZE {
        return Err(ReadyError::InvalidLayout { size });
    }
    let base = u64::from(table.data_start.get());
    let log = WindowRegion {
        base,
        len: shared_mem::LOG_WINDOW_SIZE,
    };
    let data = WindowRegion {
        base: base + shared_mem::LOG_WINDOW_SIZE,
        len: size - shared_mem::LOG_WINDOW_SIZE,
    };
    Ok((log, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use amc_emulated_mock::EmulatedAmc;
    use amc_emulated_mock::EmulatorConfig;
    use std::thread;

    fn fast() -> ReadyConfig {
        ReadyConfig {
            retries: 5,
            interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn ready_controller() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        let table = wait_for_ready(amc.memory().as_ref(), &fast(), &CancelToken::new()).unwrap();
        assert_eq!(table.magic.get(), shared_mem::GCQ_MAGIC);
    }

    #[test]
    fn never_ready() {
        let amc = EmulatedAmc::new(EmulatorConfig {
            ready: false,
            ..Default::default()
        });
        assert!(matches!(
            wait_for_ready(amc.memory().as_ref(), &fast(), &CancelToken::new()),
            Err(ReadyError::NotReady(5))
        ));
    }

    #[test]
    fn bad_status_offset_is_not_ready() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        let memory = amc.memory();
        let mut table: PartitionTable = memory.read_obj(0).unwrap();
        table.status_off = (amc.config().memory_size - 2).into();
        memory.write_obj(0, &table).unwrap();

        assert!(matches!(
            wait_for_ready(memory.as_ref(), &fast(), &CancelToken::new()),
            Err(ReadyError::NotReady(5))
        ));
    }

    #[test]
    fn becomes_ready_while_waiting() {
        let amc = EmulatedAmc::new(EmulatorConfig {
            ready: false,
            ..Default::default()
        });
        let config = ReadyConfig {
            retries: 50,
            interval: Duration::from_millis(5),
        };
        let late = amc.clone();
        let publisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            late.set_ready(true);
        });
        wait_for_ready(amc.memory().as_ref(), &config, &CancelToken::new()).unwrap();
        publisher.join().unwrap();
    }

    #[test]
    fn layout_splits_data_region() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        let table = amc.partition_table();
        let (log, data) = window_layout(&table).unwrap();
        assert_eq!(log.base, u64::from(table.data_start.get()));
        assert_eq!(log.len, shared_mem::LOG_WINDOW_SIZE);
        assert_eq!(data.base, log.base + log.len);
        assert_eq!(log.len + data.len, table.data_region_size());
    }

    #[test]
    fn small_region_rejected() {
        let amc = EmulatedAmc::new(EmulatorConfig {
            memory_size: 0x10_0000,
            ..Default::default()
        });
        assert!(matches!(
            window_layout(&amc.partition_table()),
            Err(ReadyError::InvalidLayout { .. })
        ));
    }
}
