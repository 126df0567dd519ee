// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host driver for the AMC management controller.
//!
//! Requests are posted to the controller's generic command queue (GCQ) by a
//! [`ProxyEngine`], which tracks in-flight commands and resolves them from a
//! poller thread. [`AmcControl`] layers typed operations on top, arbitrating
//! the shared payload windows and command ids. [`AmcDevice`] brings the whole
//! stack up and runs the heartbeat and firmware log monitors.

#![forbid(unsafe_code)]

mod cancel;
mod cid;
mod control;
mod device;
mod heartbeat;
mod log_relay;
mod program;
mod proxy;
mod ready;
mod sensor;
#[cfg(test)]
mod tests;
mod window;

pub use self::cancel::CancelToken;
pub use self::cid::CidAllocator;
pub use self::cid::CidError;
pub use self::cid::MAX_COMMAND_IDS;
pub use self::cid::OwnerId;
pub use self::control::AmcControl;
pub use self::control::AmcError;
pub use self::control::BusyReason;
pub use self::control::CHUNK_SIZE;
pub use self::control::CommandTimeouts;
pub use self::control::DownloadChunk;
pub use self::control::DownloadTarget;
pub use self::control::FirmwareVersion;
pub use self::control::Identity;
pub use self::control::MAX_PARTITION;
pub use self::control::ModuleAddress;
pub use self::control::OperationKind;
pub use self::device::AmcConfig;
pub use self::device::AmcDevice;
pub use self::heartbeat::AmcEvent;
pub use self::heartbeat::EventCallback;
pub use self::heartbeat::HeartbeatConfig;
pub use self::heartbeat::HeartbeatMonitor;
pub use self::heartbeat::HeartbeatState;
pub use self::log_relay::LogReader;
pub use self::log_relay::LogRelay;
pub use self::log_relay::LogRelayConfig;
pub use self::program::FPT_UPDATE_MAGIC;
pub use self::program::INVALID_BOOT_TAG;
pub use self::proxy::CommandDescriptor;
pub use self::proxy::DescriptorStatus;
pub use self::proxy::ProxyCallback;
pub use self::proxy::ProxyConfig;
pub use self::proxy::ProxyEngine;
pub use self::proxy::ProxyError;
pub use self::proxy::ProxyEvent;
pub use self::ready::ReadyConfig;
pub use self::ready::ReadyError;
pub use self::ready::wait_for_ready;
pub use self::ready::window_layout;
pub use self::sensor::CurrentSensor;
pub use self::sensor::SensorQuery;
pub use self::sensor::TemperatureSensor;
pub use self::sensor::VoltageSensor;
pub use self::window::WindowArbiter;
pub use self::window::WindowError;
pub use self::window::WindowKind;
pub use self::window::WindowLease;
pub use self::window::WindowRegion;
