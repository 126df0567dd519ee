// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Controller liveness monitoring.
//!
//! A background thread probes the controller with heartbeat requests carrying
//! a rolling request id. Missed and mismatched responses are counted; once the
//! count reaches the threshold the monitor reports [`AmcEvent::HeartbeatFatal`]
//! a single time, halts the orchestrator, and stops probing.

use crate::cancel::CancelToken;
use crate::control::AmcControl;
use crate::control::AmcError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Consecutive failures that make the controller dead.
    pub fail_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            fail_threshold: 3,
        }
    }
}

/// Asynchronous controller events.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AmcEvent {
    /// A heartbeat got no response.
    HeartbeatExpired { failures: u32 },
    /// A heartbeat response echoed the wrong request id.
    HeartbeatValidationFailed {
        expected: u8,
        actual: u8,
        failures: u32,
    },
    /// The controller is considered dead. Raised once.
    HeartbeatFatal,
}

pub type EventCallback = Arc<dyn Fn(AmcEvent) + Send + Sync>;

/// A snapshot of the monitor.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatState {
    /// Request id of the most recent probe.
    pub last_request_id: u8,
    /// Probes sent so far.
    pub probes: u64,
    pub failures: u32,
    pub fatal: bool,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    state: Arc<Mutex<HeartbeatState>>,
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    pub fn start(
        control: Arc<AmcControl>,
        config: HeartbeatConfig,
        events: EventCallback,
    ) -> std::io::Result<Self> {
        let state = Arc::new(Mutex::new(HeartbeatState::default()));
        let cancel = CancelToken::new();
        let thread = thread::Builder::new().name("amc-heartbeat".into()).spawn({
            let worker = Worker {
                control,
                config,
                events,
                state: state.clone(),
                cancel: cancel.clone(),
            };
            move || worker.run()
        })?;
        Ok(Self {
            state,
            cancel,
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> HeartbeatState {
        *self.state.lock()
    }

    /// Stops the monitor and waits for its thread to exit.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    control: Arc<AmcControl>,
    config: HeartbeatConfig,
    events: EventCallback,
    state: Arc<Mutex<HeartbeatState>>,
    cancel: CancelToken,
}

impl Worker {
    fn run(self) {
        let mut request_id = 0u8;
        while self.cancel.sleep(self.config.interval) {
            let (failures, fatal) = {
                let state = self.state.lock();
                (state.failures, state.fatal)
            };
            if fatal {
                continue;
            }
            if failures >= self.config.fail_threshold {
                tracing::error!(failures, "heartbeat failed, controller is unresponsive");
                self.state.lock().fatal = true;
                self.control.stop_services();
                (self.events)(AmcEvent::HeartbeatFatal);
                continue;
            }
            if self.control.is_halted() {
                continue;
            }

            let result = self.control.heartbeat(request_id, &self.cancel);
            let event = {
                let mut state = self.state.lock();
                state.last_request_id = request_id;
                state.probes += 1;
                match result {
                    Ok(echo) if echo == request_id => {
                        state.failures = 0;
                        None
                    }
                    Ok(echo) => {
                        state.failures += 1;
                        tracing::warn!(
                            expected = request_id,
                            actual = echo,
                            failures = state.failures,
                            "heartbeat validation failed"
                        );
                        Some(AmcEvent::HeartbeatValidationFailed {
                            expected: request_id,
                            actual: echo,
                            failures: state.failures,
                        })
                    }
                    Err(AmcError::Interrupted) if self.cancel.is_cancelled() => break,
                    Err(err) => {
                        state.failures += 1;
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            failures = state.failures,
                            "heartbeat expired"
                        );
                        Some(AmcEvent::HeartbeatExpired {
                            failures: state.failures,
                        })
                    }
                }
            };
            if let Some(event) = event {
                (self.events)(event);
            }
            request_id = request_id.wrapping_add(1);
        }
        tracing::debug!("heartbeat monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::tests::control;
    use crate::tests::wait_until;
    use amc_emulated_mock::EmulatedAmc;
    use amc_emulated_mock::EmulatorConfig;

    fn fast() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(5),
            fail_threshold: 3,
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

    #[test]
    fn echoed_heartbeat_succeeds() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        let control = control(&amc);
        assert_eq!(control.heartbeat(5, &CancelToken::new()).unwrap(), 5);

        let (callback, events) = recorder();
        let mut monitor = HeartbeatMonitor::start(Arc::new(control), fast(), callback).unwrap();
        assert!(wait_until(|| monitor.state().probes >= 3));
        monitor.stop();

        let state = monitor.state();
        assert_eq!(state.failures, 0);
        assert!(!state.fatal);
        assert!(events.lock().is_empty());
    }

    #[test]
    fn success_resets_failures() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        amc.set_heartbeat_echo_offset(1);
        let control = Arc::new(control(&amc));
        let (callback, events) = recorder();
        let mut monitor = HeartbeatMonitor::start(
            control.clone(),
            HeartbeatConfig {
                fail_threshold: 1000,
                ..fast()
            },
            callback,
        )
        .unwrap();

        assert!(wait_until(|| monitor.state().failures >= 2));
        amc.set_heartbeat_echo_offset(0);
        assert!(wait_until(|| monitor.state().failures == 0));
        monitor.stop();

        assert!(!monitor.state().fatal);
        assert!(!control.is_halted());
        let events = events.lock();
        assert!(events.len() >= 2);
        assert!(events.iter().all(|event| matches!(
            event,
            AmcEvent::HeartbeatValidationFailed { .. }
        )));
    }

    #[test]
    fn wrong_echo_escalates_once() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        amc.set_heartbeat_echo_offset(1);
        let control = Arc::new(control(&amc));
        let (callback, events) = recorder();
        let mut monitor = HeartbeatMonitor::start(control.clone(), fast(), callback).unwrap();

        assert!(wait_until(|| monitor.state().fatal));
        // Later iterations neither probe nor raise again.
        thread::sleep(Duration::from_millis(50));
        monitor.stop();

        let events = events.lock().clone();
        assert_eq!(
            events,
            vec![
                AmcEvent::HeartbeatValidationFailed {
                    expected: 0,
                    actual: 1,
                    failures: 1
                },
                AmcEvent::HeartbeatValidationFailed {
                    expected: 1,
                    actual: 2,
                    failures: 2
                },
                AmcEvent::HeartbeatValidationFailed {
                    expected: 2,
                    actual: 3,
                    failures: 3
                },
                AmcEvent::HeartbeatFatal,
            ]
        );
        assert!(control.is_halted());
        assert_eq!(monitor.state().probes, 3);
    }

    #[test]
    fn missed_responses_expire() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        amc.set_drop_responses(true);
        let control = Arc::new(control(&amc));
        let (callback, events) = recorder();
        let mut monitor = HeartbeatMonitor::start(control.clone(), fast(), callback).unwrap();

        assert!(wait_until(|| monitor.state().fatal));
        monitor.stop();
        let events = events.lock().clone();
        assert_eq!(events[0], AmcEvent::HeartbeatExpired { failures: 1 });
        assert_eq!(events.last(), Some(&AmcEvent::HeartbeatFatal));
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn stop_is_prompt() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        let control = Arc::new(control(&amc));
        let (callback, _) = recorder();
        let mut monitor = HeartbeatMonitor::start(
            control,
            HeartbeatConfig {
                interval: Duration::from_secs(60),
                ..fast()
            },
            callback,
        )
        .unwrap();
        let start = std::time::Instant::now();
        monitor.stop();
        monitor.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
