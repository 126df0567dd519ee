// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end tests against the emulated controller, and shared test helpers.

#![cfg(test)]

use crate::AmcConfig;
use crate::AmcControl;
use crate::AmcDevice;
use crate::AmcError;
use crate::AmcEvent;
use crate::BusyReason;
use crate::CancelToken;
use crate::CidAllocator;
use crate::CommandTimeouts;
use crate::EventCallback;
use crate::HeartbeatConfig;
use crate::LogRelayConfig;
use crate::ProxyConfig;
use crate::ProxyEngine;
use crate::ReadyConfig;
use crate::SensorQuery;
use crate::TemperatureSensor;
use crate::WindowArbiter;
use crate::window_layout;
use amc_emulated_mock::EmulatedAmc;
use amc_emulated_mock::EmulatorConfig;
use amc_spec::Opcode;
use amc_spec::SensorPayload;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;
use zerocopy::FromBytes;

pub(crate) fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let targets = match std::env::var("RUST_LOG") {
            Ok(var) => var.parse().unwrap(),
            Err(_) => Targets::new().with_default(LevelFilter::DEBUG),
        };
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .with_thread_ids(true)
            .finish()
            .with(targets)
            .init();
    });
}

/// An orchestrator over `amc` with short proxy intervals, already resumed.
pub(crate) fn control(amc: &EmulatedAmc) -> AmcControl {
    init_tracing();
    let proxy = ProxyEngine::open(
        amc.transport(),
        ProxyConfig {
            poll_interval: Duration::from_millis(1),
            drain_interval: Duration::from_millis(10),
        },
    )
    .unwrap();
    let (log, data) = window_layout(&amc.partition_table()).unwrap();
    let control = AmcControl::new(
        Arc::new(proxy),
        amc.memory(),
        WindowArbiter::new(log, data),
        Arc::new(CidAllocator::new(crate::MAX_COMMAND_IDS)),
        CommandTimeouts {
            heartbeat: Duration::from_millis(100),
            ..Default::default()
        },
    )
    .unwrap();
    control.resume_services();
    control
}

/// Polls `condition` for up to five seconds.
pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn fast_config() -> AmcConfig {
    AmcConfig {
        proxy: ProxyConfig {
            poll_interval: Duration::from_millis(1),
            drain_interval: Duration::from_millis(10),
        },
        timeouts: CommandTimeouts {
            heartbeat: Duration::from_millis(100),
            ..Default::default()
        },
        heartbeat: HeartbeatConfig {
            interval: Duration::from_millis(5),
            fail_threshold: 3,
        },
        log_relay: LogRelayConfig {
            interval: Duration::from_millis(5),
        },
        ready: ReadyConfig {
            retries: 5,
            interval: Duration::from_millis(1),
        },
        ..Default::default()
    }
}

fn recorder() -> (EventCallback, Arc<Mutex<Vec<AmcEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let callback: EventCallback = Arc::new({
        let events = events.clone();
        move |event| events.lock().push(event)
    });
    (callback, events)
}

fn bring_up(amc: &EmulatedAmc) -> anyhow::Result<(AmcDevice, Arc<Mutex<Vec<AmcEvent>>>)> {
    init_tracing();
    let (callback, events) = recorder();
    let device = AmcDevice::new(amc.transport(), amc.memory(), fast_config(), callback)?;
    Ok((device, events))
}

#[test]
fn sensor_read_waits_for_log_window() {
    let amc = EmulatedAmc::new(EmulatorConfig::default());
    let control = Arc::new(control(&amc));
    let query = SensorQuery::Temperature(TemperatureSensor::Inlet);

    let lease = control
        .windows()
        .acquire_log(&CancelToken::new())
        .unwrap();
    let log_base = lease.base();
    let reader = thread::spawn({
        let control = control.clone();
        move || {
            let mut buf = [0u8; 64];
            control
                .read_sensor(query, &mut buf, &CancelToken::new())
                .map(|n| (n, buf))
        }
    });

    thread::sleep(Duration::from_millis(30));
    assert!(!reader.is_finished());
    assert!(amc.requests().is_empty());
    lease.release();

    let (n, buf) = reader.join().unwrap().unwrap();
    assert_eq!(n, 64);
    let expected = amc_emulated_mock::sensor_pattern(query.selector().unwrap(), 64);
    assert_eq!(buf.as_slice(), expected.as_slice());

    let requests = amc.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].opcode(), Opcode::SENSOR);
    let (payload, _) = SensorPayload::read_from_prefix(&requests[0].payload).unwrap();
    assert_eq!(payload.address.get(), log_base);
    assert_eq!(payload.size.get(), 64);
}

#[test]
fn data_and_log_windows_run_concurrently() {
    let amc = EmulatedAmc::new(EmulatorConfig::default());
    let control = Arc::new(control(&amc));
    amc.set_response_delay(Duration::from_millis(5));

    let workers: Vec<_> = (0..8u8)
        .map(|i| {
            let control = control.clone();
            thread::spawn(move || {
                let cancel = CancelToken::new();
                for _ in 0..5 {
                    if i % 2 == 0 {
                        let mut buf = [0; 32];
                        control
                            .read_sensor(SensorQuery::TotalPower, &mut buf, &cancel)
                            .unwrap();
                    } else {
                        control.eeprom_write(i * 16, &[i; 16], &cancel).unwrap();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(control.proxy().in_flight(), 0);
    assert!(control.windows().try_acquire_log().is_some());
    assert!(control.windows().try_acquire_data().is_some());
    let mut buf = [0; 16];
    control
        .eeprom_read(3 * 16, &mut buf, &CancelToken::new())
        .unwrap();
    assert_eq!(buf, [3; 16]);
}

#[test]
fn device_bring_up_and_shutdown() {
    let amc = EmulatedAmc::new(EmulatorConfig::default());
    amc.push_log("amc started");
    let (mut device, events) = bring_up(&amc).unwrap();

    assert!(!device.is_compat_mode());
    assert_eq!(device.identity().link_version, (1, 0));
    assert!(amc.is_open());
    assert!(wait_until(|| {
        device
            .heartbeat_state()
            .is_some_and(|state| state.probes >= 2)
    }));

    let mut buf = [0; 8];
    device
        .control()
        .eeprom_read(0, &mut buf, &CancelToken::new())
        .unwrap();

    device.shutdown().unwrap();
    assert!(!amc.is_open());
    assert!(device.control().is_halted());
    assert!(device.heartbeat_state().is_none());
    assert!(events.lock().is_empty());
}

#[test]
fn unexpected_firmware_runs_in_compat_mode() {
    let amc = EmulatedAmc::new(EmulatorConfig {
        firmware_version: [2, 1, 0],
        ..Default::default()
    });
    let (mut device, _) = bring_up(&amc).unwrap();
    assert!(device.is_compat_mode());
    assert!(device.heartbeat_state().is_none());
    assert_eq!(device.identity().version.major, 2);

    device
        .control()
        .eeprom_write(0, b"compat", &CancelToken::new())
        .unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(
        amc.requests()
            .iter()
            .all(|request| request.opcode() != Opcode::HEARTBEAT)
    );
    device.shutdown().unwrap();
}

#[test]
fn unsupported_link_version_fails() {
    let amc = EmulatedAmc::new(EmulatorConfig {
        link_version: [2, 0],
        ..Default::default()
    });
    let err = bring_up(&amc).unwrap_err();
    assert!(err.to_string().contains("link version"));
    assert!(!amc.is_open());
}

#[test]
fn controller_never_ready() {
    let amc = EmulatedAmc::new(EmulatorConfig {
        ready: false,
        ..Default::default()
    });
    let err = bring_up(&amc).unwrap_err();
    assert!(err.to_string().contains("did not become ready"));
    assert!(!amc.is_open());
    assert!(amc.requests().is_empty());
}

#[test]
fn dead_controller_halts_device() {
    let amc = EmulatedAmc::new(EmulatorConfig::default());
    let (mut device, events) = bring_up(&amc).unwrap();
    amc.set_heartbeat_echo_offset(7);

    assert!(wait_until(|| events.lock().contains(&AmcEvent::HeartbeatFatal)));
    thread::sleep(Duration::from_millis(30));
    let fatal = events
        .lock()
        .iter()
        .filter(|&&event| event == AmcEvent::HeartbeatFatal)
        .count();
    assert_eq!(fatal, 1);

    let control = device.control().clone();
    assert!(matches!(
        control.identify(&CancelToken::new()),
        Err(AmcError::Busy(BusyReason::Halted))
    ));

    // A hot reset brings the card back.
    control.resume_services();
    control.identify(&CancelToken::new()).unwrap();
    device.shutdown().unwrap();
}
