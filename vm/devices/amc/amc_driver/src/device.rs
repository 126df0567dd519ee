// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device bring-up and teardown.

use crate::cancel::CancelToken;
use crate::cid::CidAllocator;
use crate::control::AmcControl;
use crate::control::CommandTimeouts;
use crate::control::Identity;
use crate::heartbeat::EventCallback;
use crate::heartbeat::HeartbeatConfig;
use crate::heartbeat::HeartbeatMonitor;
use crate::heartbeat::HeartbeatState;
use crate::log_relay::LogReader;
use crate::log_relay::LogRelay;
use crate::log_relay::LogRelayConfig;
use crate::proxy::ProxyConfig;
use crate::proxy::ProxyEngine;
use crate::proxy::ProxyError;
use crate::ready;
use crate::ready::ReadyConfig;
use crate::window::WindowArbiter;
use amc_spec::shared_mem::PartitionTable;
use amc_transport::GcqTransport;
use amc_transport::PayloadMemory;
use anyhow::Context;
use std::sync::Arc;

/// Device configuration.
#[derive(Debug, Clone)]
pub struct AmcConfig {
    pub proxy: ProxyConfig,
    pub timeouts: CommandTimeouts,
    pub heartbeat: HeartbeatConfig,
    pub log_relay: LogRelayConfig,
    pub ready: ReadyConfig,
    /// The only GCQ protocol version the driver speaks.
    pub link_version: (u8, u8),
    /// Firmware (major, minor) the driver was built against. Any other
    /// version runs in compatibility mode.
    pub expected_firmware: (u8, u8),
}

impl Default for AmcConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            timeouts: CommandTimeouts::default(),
            heartbeat: HeartbeatConfig::default(),
            log_relay: LogRelayConfig::default(),
            ready: ReadyConfig::default(),
            link_version: (1, 0),
            expected_firmware: (1, 0),
        }
    }
}

/// A management controller that has been brought up.
///
/// Dropping the device shuts it down without draining outstanding commands;
/// call [`AmcDevice::shutdown`] to drain them.
#[derive(Debug)]
pub struct AmcDevice {
    control: Arc<AmcControl>,
    table: PartitionTable,
    identity: Identity,
    compat_mode: bool,
    heartbeat: Option<HeartbeatMonitor>,
    log_relay: Option<LogRelay>,
}

impl AmcDevice {
    /// Waits for the controller, opens the command queue, checks versions
    /// and starts the background monitors.
    ///
    /// Anything started before a failure is torn down again.
    pub fn new(
        transport: Arc<dyn GcqTransport>,
        memory: Arc<dyn PayloadMemory>,
        config: AmcConfig,
        events: EventCallback,
    ) -> anyhow::Result<Self> {
        let span = tracing::info_span!("amc_bring_up");
        let _enter = span.enter();
        let cancel = CancelToken::new();

        let table = ready::wait_for_ready(memory.as_ref(), &config.ready, &cancel)
            .context("controller did not become ready")?;
        let (log, data) =
            ready::window_layout(&table).context("invalid shared memory layout")?;
        tracing::debug!(
            log_base = log.base,
            data_base = data.base,
            data_len = data.len,
            "window layout"
        );

        let proxy =
            ProxyEngine::open(transport, config.proxy.clone()).context("failed to open the gcq")?;
        let control = Arc::new(
            AmcControl::new(
                Arc::new(proxy),
                memory.clone(),
                WindowArbiter::new(log, data),
                CidAllocator::global(),
                config.timeouts.clone(),
            )
            .context("failed to bind the proxy")?,
        );
        control.resume_services();

        let identity = control
            .identify(&cancel)
            .context("failed to identify the controller")?;
        if identity.link_version != config.link_version {
            anyhow::bail!(
                "unsupported gcq link version {}.{}, expected {}.{}",
                identity.link_version.0,
                identity.link_version.1,
                config.link_version.0,
                config.link_version.1
            );
        }

        let version = identity.version;
        tracing::info!(
            major = version.major,
            minor = version.minor,
            patch = version.patch,
            dev_commits = version.dev_commits,
            local_changes = version.local_changes,
            "amc firmware"
        );
        let compat_mode = (version.major, version.minor) != config.expected_firmware;
        if compat_mode {
            tracing::warn!(
                major = version.major,
                minor = version.minor,
                expected_major = config.expected_firmware.0,
                expected_minor = config.expected_firmware.1,
                "unexpected amc firmware version, running in compatibility mode"
            );
        }

        let mut device = Self {
            control,
            table,
            identity,
            compat_mode,
            heartbeat: None,
            log_relay: None,
        };
        if !compat_mode {
            device.heartbeat = Some(
                HeartbeatMonitor::start(device.control.clone(), config.heartbeat, events)
                    .context("failed to start the heartbeat monitor")?,
            );
            device.log_relay = Some(
                LogRelay::start(LogReader::new(memory, &table), config.log_relay)
                    .context("failed to start the log relay")?,
            );
        }
        Ok(device)
    }

    pub fn control(&self) -> &Arc<AmcControl> {
        &self.control
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn partition_table(&self) -> &PartitionTable {
        &self.table
    }

    /// Whether the firmware version differs from the expected one. The
    /// heartbeat monitor and log relay do not run in this mode.
    pub fn is_compat_mode(&self) -> bool {
        self.compat_mode
    }

    pub fn heartbeat_state(&self) -> Option<HeartbeatState> {
        self.heartbeat.as_ref().map(|monitor| monitor.state())
    }

    /// Stops the monitors, halts services and closes the command queue once
    /// every outstanding command has resolved.
    pub fn shutdown(&mut self) -> Result<(), ProxyError> {
        self.stop_monitors();
        self.control.stop_services();
        self.control.proxy().close()
    }

    fn stop_monitors(&mut self) {
        if let Some(mut heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        if let Some(mut relay) = self.log_relay.take() {
            relay.stop();
        }
    }
}

impl Drop for AmcDevice {
    fn drop(&mut self) {
        self.stop_monitors();
        self.control.stop_services();
    }
}
