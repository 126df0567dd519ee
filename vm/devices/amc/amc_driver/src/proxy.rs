// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The GCQ proxy engine.
//!
//! The proxy owns the transport and the table of in-flight commands. A poller
//! thread reads completion entries, matches them to in-flight commands by
//! command id, expires commands whose deadline has passed, and reports both
//! outcomes through a single bound callback.
//!
//! Every descriptor leaves the table exactly once: on completion, on timeout,
//! or on [`ProxyEngine::abort`]. Whichever path removes it under the table lock
//! owns its resolution.

use crate::cancel::CancelToken;
use crate::cancel::WAIT_SLICE;
use crate::control::OperationKind;
use amc_spec::COMPLETION_ENTRY_SIZE;
use amc_spec::CompletionEntry;
use amc_spec::RESPONSE_PAYLOAD_SIZE;
use amc_transport::GcqTransport;
use amc_transport::TransportError;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// Offset of the queue within the transport.
const QUEUE_OFFSET: u64 = 0;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Sleep between poller passes.
    pub poll_interval: Duration,
    /// Sleep between checks of the in-flight table while closing.
    pub drain_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            drain_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to open the transport")]
    TransportOpenFailed(#[source] TransportError),
    #[error("failed to start the completion poller")]
    AllocationFailed(#[source] std::io::Error),
    #[error("a callback is already bound")]
    CallbackAlreadyBound,
    #[error("no callback is bound")]
    CallbackNotBound,
    #[error("command id {0} is already in flight")]
    DuplicateCommandId(u16),
    #[error("failed to write the request")]
    WriteFailed(#[source] TransportError),
    #[error("the proxy is closed")]
    Closed,
    #[error("failed to close the transport")]
    TransportCloseFailed(#[source] TransportError),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    ResponseComplete,
    ResponseTimeout,
}

/// How a descriptor left the in-flight table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorStatus {
    Pending,
    Completed,
    TimedOut,
    Aborted,
}

/// The callback invoked from the poller thread. It must not block.
pub type ProxyCallback = Box<dyn Fn(ProxyEvent, &CommandDescriptor) + Send + Sync>;

/// An in-flight command.
#[derive(Debug)]
pub struct CommandDescriptor {
    cid: u16,
    kind: OperationKind,
    deadline: Instant,
    state: Mutex<DescriptorState>,
    signal: Condvar,
}

#[derive(Debug)]
struct DescriptorState {
    status: DescriptorStatus,
    response: [u8; RESPONSE_PAYLOAD_SIZE],
    rcode: u32,
    signaled: bool,
}

impl CommandDescriptor {
    pub fn new(cid: u16, kind: OperationKind, timeout: Duration) -> Arc<Self> {
        Self::with_deadline(cid, kind, Instant::now() + timeout)
    }

    pub fn with_deadline(cid: u16, kind: OperationKind, deadline: Instant) -> Arc<Self> {
        Arc::new(Self {
            cid,
            kind,
            deadline,
            state: Mutex::new(DescriptorState {
                status: DescriptorStatus::Pending,
                response: [0; RESPONSE_PAYLOAD_SIZE],
                rcode: 0,
                signaled: false,
            }),
            signal: Condvar::new(),
        })
    }

    pub fn cid(&self) -> u16 {
        self.cid
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Routine logging is skipped for this command.
    pub fn suppress_log(&self) -> bool {
        self.kind.suppress_log()
    }

    pub fn status(&self) -> DescriptorStatus {
        self.state.lock().status
    }

    pub fn is_timed_out(&self) -> bool {
        self.status() == DescriptorStatus::TimedOut
    }

    /// The raw response payload; zero until completion.
    pub fn response(&self) -> [u8; RESPONSE_PAYLOAD_SIZE] {
        self.state.lock().response
    }

    /// The controller return code; zero until completion.
    pub fn rcode(&self) -> u32 {
        self.state.lock().rcode
    }

    fn complete(&self, entry: &CompletionEntry) {
        let mut state = self.state.lock();
        state.response = entry.payload();
        state.rcode = entry.rcode();
        state.status = DescriptorStatus::Completed;
    }

    fn time_out(&self) {
        self.state.lock().status = DescriptorStatus::TimedOut;
    }

    fn abort(&self) {
        self.state.lock().status = DescriptorStatus::Aborted;
    }

    /// Fires the one-shot ready signal.
    pub fn signal(&self) {
        self.state.lock().signaled = true;
        self.signal.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    /// Blocks until [`Self::signal`] is called or `cancel` fires.
    ///
    /// Returns `false` if the wait was cancelled.
    pub fn wait(&self, cancel: &CancelToken) -> bool {
        let mut state = self.state.lock();
        while !state.signaled {
            if cancel.is_cancelled() {
                return false;
            }
            self.signal.wait_for(&mut state, WAIT_SLICE);
        }
        true
    }
}

/// The proxy engine.
pub struct ProxyEngine {
    inner: Arc<ProxyInner>,
    poller: Mutex<Option<JoinHandle<()>>>,
    drain_interval: Duration,
}

impl std::fmt::Debug for ProxyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyEngine")
            .field("in_flight", &self.in_flight())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

struct ProxyInner {
    transport: Arc<dyn GcqTransport>,
    table: Mutex<InFlight>,
    callback: OnceLock<ProxyCallback>,
    running: AtomicBool,
    closed: AtomicBool,
    poll_interval: Duration,
}

type InFlight = HashMap<u16, Arc<CommandDescriptor>>;

impl ProxyEngine {
    /// Opens `transport` and starts the poller thread.
    pub fn open(transport: Arc<dyn GcqTransport>, config: ProxyConfig) -> Result<Self, ProxyError> {
        transport.open().map_err(ProxyError::TransportOpenFailed)?;

        let inner = Arc::new(ProxyInner {
            transport: transport.clone(),
            table: Mutex::new(HashMap::new()),
            callback: OnceLock::new(),
            running: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            poll_interval: config.poll_interval,
        });

        let poller = thread::Builder::new().name("amc-gcq-poller".into()).spawn({
            let inner = inner.clone();
            move || inner.run()
        });

        let poller = match poller {
            Ok(poller) => poller,
            Err(err) => {
                if let Err(err) = transport.close() {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "failed to close transport after poller start failure"
                    );
                }
                return Err(ProxyError::AllocationFailed(err));
            }
        };

        tracing::debug!("gcq proxy opened");
        Ok(Self {
            inner,
            poller: Mutex::new(Some(poller)),
            drain_interval: config.drain_interval,
        })
    }

    /// Binds the completion callback. Only one callback may be bound.
    pub fn bind_callback(&self, callback: ProxyCallback) -> Result<(), ProxyError> {
        self.inner
            .callback
            .set(callback)
            .map_err(|_| ProxyError::CallbackAlreadyBound)
    }

    /// Writes `request` and links `descriptor` into the in-flight table.
    ///
    /// The table lock is held across the write so that the poller cannot see
    /// the completion before the descriptor is linked.
    pub fn submit(
        &self,
        descriptor: &Arc<CommandDescriptor>,
        request: &[u8],
    ) -> Result<(), ProxyError> {
        if self.inner.callback.get().is_none() {
            return Err(ProxyError::CallbackNotBound);
        }

        let cid = descriptor.cid();
        let mut table = self.inner.table.lock();
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ProxyError::Closed);
        }
        if table.contains_key(&cid) {
            return Err(ProxyError::DuplicateCommandId(cid));
        }
        self.inner
            .transport
            .write(QUEUE_OFFSET, request)
            .map_err(ProxyError::WriteFailed)?;
        table.insert(cid, descriptor.clone());
        drop(table);

        if !descriptor.suppress_log() {
            tracing::debug!(cid, kind = ?descriptor.kind(), "command submitted");
        }
        Ok(())
    }

    /// Unlinks `descriptor` without invoking the callback.
    ///
    /// Returns `false` if the descriptor was already resolved.
    pub fn abort(&self, descriptor: &Arc<CommandDescriptor>) -> bool {
        let mut table = self.inner.table.lock();
        let linked = table
            .get(&descriptor.cid())
            .is_some_and(|d| Arc::ptr_eq(d, descriptor));
        if linked {
            table.remove(&descriptor.cid());
            descriptor.abort();
            tracing::debug!(cid = descriptor.cid(), "command aborted");
        }
        linked
    }

    /// The number of commands in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.table.lock().len()
    }

    /// Waits for every in-flight command to resolve, stops the poller and
    /// closes the transport. Later calls do nothing.
    pub fn close(&self) -> Result<(), ProxyError> {
        {
            let _table = self.inner.table.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }

        loop {
            let pending = self.in_flight();
            if pending == 0 {
                break;
            }
            tracing::debug!(pending, "draining in-flight commands");
            thread::sleep(self.drain_interval);
            self.inner.sweep(Instant::now());
        }

        self.stop_poller();
        self.inner
            .transport
            .close()
            .map_err(ProxyError::TransportCloseFailed)?;
        tracing::debug!("gcq proxy closed");
        Ok(())
    }

    fn stop_poller(&self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(poller) = self.poller.lock().take() {
            if poller.join().is_err() {
                tracing::error!("gcq poller panicked");
            }
        }
    }
}

impl Drop for ProxyEngine {
    fn drop(&mut self) {
        self.stop_poller();
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.inner.transport.close() {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to close transport"
                );
            }
        }
    }
}

impl ProxyInner {
    fn run(&self) {
        let mut buf = [0; COMPLETION_ENTRY_SIZE];
        loop {
            let stopping = !self.running.load(Ordering::Acquire);
            while self.poll_completion(&mut buf) {}
            self.sweep(Instant::now());
            if stopping {
                break;
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Processes one completion entry. Returns `false` if none was pending.
    fn poll_completion(&self, buf: &mut [u8; COMPLETION_ENTRY_SIZE]) -> bool {
        let len = match self.transport.read(QUEUE_OFFSET, buf) {
            Ok(0) => return false,
            Ok(len) => len,
            Err(err) => {
                tracing::trace!(
                    error = &err as &dyn std::error::Error,
                    "completion read failed"
                );
                return false;
            }
        };

        let entry = match CompletionEntry::decode(&buf[..len.min(buf.len())]) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "dropping malformed completion"
                );
                return true;
            }
        };

        let cid = entry.cid();
        let descriptor = {
            let mut table = self.table.lock();
            table.remove(&cid).inspect(|descriptor| descriptor.complete(&entry))
        };

        match descriptor {
            Some(descriptor) => {
                if !descriptor.suppress_log() {
                    tracing::debug!(
                        cid,
                        kind = ?descriptor.kind(),
                        rcode = entry.rcode(),
                        "command complete"
                    );
                }
                self.notify(ProxyEvent::ResponseComplete, &descriptor);
            }
            None => {
                tracing::warn!(cid, "unexpected response");
            }
        }
        true
    }

    /// Expires every descriptor whose deadline is at or before `now`.
    fn sweep(&self, now: Instant) {
        let mut expired = Vec::new();
        self.table.lock().retain(|_, descriptor| {
            if descriptor.deadline() <= now {
                descriptor.time_out();
                expired.push(descriptor.clone());
                false
            } else {
                true
            }
        });

        for descriptor in expired {
            tracing::warn!(
                cid = descriptor.cid(),
                kind = ?descriptor.kind(),
                "command timed out"
            );
            self.notify(ProxyEvent::ResponseTimeout, &descriptor);
        }
    }

    fn notify(&self, event: ProxyEvent, descriptor: &CommandDescriptor) {
        match self.callback.get() {
            Some(callback) => callback(event, descriptor),
            None => tracing::error!(cid = descriptor.cid(), ?event, "no callback bound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amc_emulated_mock::EmulatedAmc;
    use amc_emulated_mock::EmulatorConfig;
    use amc_spec::Opcode;
    use amc_spec::encode_request;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> ProxyConfig {
        ProxyConfig {
            poll_interval: Duration::from_millis(1),
            drain_interval: Duration::from_millis(10),
        }
    }

    fn open(amc: &EmulatedAmc) -> ProxyEngine {
        ProxyEngine::open(amc.transport(), fast_config()).unwrap()
    }

    fn heartbeat(cid: u16, id: u8) -> Vec<u8> {
        encode_request(Opcode::HEARTBEAT, cid, &[id]).unwrap()
    }

    #[derive(Default)]
    struct Events {
        complete: AtomicUsize,
        timeout: AtomicUsize,
    }

    fn bind_counting(proxy: &ProxyEngine) -> Arc<Events> {
        let events = Arc::new(Events::default());
        proxy
            .bind_callback(Box::new({
                let events = events.clone();
                move |event, descriptor| {
                    match event {
                        ProxyEvent::ResponseComplete => &events.complete,
                        ProxyEvent::ResponseTimeout => &events.timeout,
                    }
                    .fetch_add(1, Ordering::SeqCst);
                    descriptor.signal();
                }
            }))
            .unwrap();
        events
    }

    #[test]
    fn completion_resolves_descriptor() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        let proxy = open(&amc);
        let events = bind_counting(&proxy);

        let descriptor =
            CommandDescriptor::new(3, OperationKind::Heartbeat, Duration::from_secs(5));
        proxy.submit(&descriptor, &heartbeat(3, 9)).unwrap();
        assert!(descriptor.wait(&CancelToken::new()));
        assert_eq!(descriptor.status(), DescriptorStatus::Completed);
        assert_eq!(descriptor.rcode(), 0);
        assert_eq!(descriptor.response()[0], 9);
        assert_eq!(events.complete.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.in_flight(), 0);
        proxy.close().unwrap();
    }

    #[test]
    fn second_bind_fails() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        let proxy = open(&amc);
        bind_counting(&proxy);
        assert!(matches!(
            proxy.bind_callback(Box::new(|_, _| {})),
            Err(ProxyError::CallbackAlreadyBound)
        ));
    }

    #[test]
    fn submit_requires_callback() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        let proxy = open(&amc);
        let descriptor =
            CommandDescriptor::new(0, OperationKind::Identify, Duration::from_secs(1));
        assert!(matches!(
            proxy.submit(&descriptor, &heartbeat(0, 0)),
            Err(ProxyError::CallbackNotBound)
        ));
    }

    #[test]
    fn duplicate_cid_rejected() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        amc.set_drop_responses(true);
        let proxy = open(&amc);
        bind_counting(&proxy);

        let first = CommandDescriptor::new(1, OperationKind::Heartbeat, Duration::from_secs(5));
        proxy.submit(&first, &heartbeat(1, 0)).unwrap();
        let second = CommandDescriptor::new(1, OperationKind::Heartbeat, Duration::from_secs(5));
        assert!(matches!(
            proxy.submit(&second, &heartbeat(1, 0)),
            Err(ProxyError::DuplicateCommandId(1))
        ));
        assert_eq!(amc.requests().len(), 1);
        assert!(proxy.abort(&first));
    }

    #[test]
    fn write_failure_leaves_table_empty() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        amc.set_fail_writes(true);
        let proxy = open(&amc);
        bind_counting(&proxy);

        let descriptor =
            CommandDescriptor::new(2, OperationKind::Heartbeat, Duration::from_secs(5));
        assert!(matches!(
            proxy.submit(&descriptor, &heartbeat(2, 0)),
            Err(ProxyError::WriteFailed(_))
        ));
        assert_eq!(proxy.in_flight(), 0);
    }

    #[test]
    fn open_failure_reported() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        amc.set_fail_open(true);
        assert!(matches!(
            ProxyEngine::open(amc.transport(), fast_config()),
            Err(ProxyError::TransportOpenFailed(_))
        ));
    }

    #[test]
    fn expired_descriptor_times_out() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        amc.set_drop_responses(true);
        let proxy = open(&amc);
        let events = bind_counting(&proxy);

        let descriptor =
            CommandDescriptor::new(4, OperationKind::Heartbeat, Duration::from_millis(20));
        proxy.submit(&descriptor, &heartbeat(4, 0)).unwrap();
        assert!(descriptor.wait(&CancelToken::new()));
        assert!(descriptor.is_timed_out());
        assert_eq!(events.timeout.load(Ordering::SeqCst), 1);
        assert_eq!(events.complete.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn abort_is_silent() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        amc.set_drop_responses(true);
        let proxy = open(&amc);
        let events = bind_counting(&proxy);

        let descriptor =
            CommandDescriptor::new(5, OperationKind::Heartbeat, Duration::from_millis(50));
        proxy.submit(&descriptor, &heartbeat(5, 0)).unwrap();
        assert!(proxy.abort(&descriptor));
        assert!(!proxy.abort(&descriptor));
        assert_eq!(descriptor.status(), DescriptorStatus::Aborted);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(events.timeout.load(Ordering::SeqCst), 0);
        assert_eq!(events.complete.load(Ordering::SeqCst), 0);
        assert!(!descriptor.is_signaled());
    }

    #[test]
    fn unexpected_response_dropped() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        let proxy = open(&amc);
        let events = bind_counting(&proxy);

        amc.inject_completion(CompletionEntry::new(
            amc_spec::ResponseHeader::new().with_cid(77),
            [0; RESPONSE_PAYLOAD_SIZE],
            0,
        ));
        let descriptor =
            CommandDescriptor::new(6, OperationKind::Heartbeat, Duration::from_secs(5));
        proxy.submit(&descriptor, &heartbeat(6, 1)).unwrap();
        assert!(descriptor.wait(&CancelToken::new()));
        assert_eq!(descriptor.status(), DescriptorStatus::Completed);
        assert_eq!(events.complete.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_drains_in_flight() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        amc.set_response_delay(Duration::from_millis(60));
        let proxy = open(&amc);
        let events = bind_counting(&proxy);

        let descriptors: Vec<_> = (0..3)
            .map(|cid| {
                let descriptor =
                    CommandDescriptor::new(cid, OperationKind::Heartbeat, Duration::from_secs(5));
                proxy.submit(&descriptor, &heartbeat(cid, 0)).unwrap();
                descriptor
            })
            .collect();

        proxy.close().unwrap();
        for descriptor in &descriptors {
            assert_eq!(descriptor.status(), DescriptorStatus::Completed);
            assert!(descriptor.is_signaled());
        }
        assert_eq!(events.complete.load(Ordering::SeqCst), 3);
        assert!(!amc.is_open());

        proxy.close().unwrap();
        let late = CommandDescriptor::new(9, OperationKind::Heartbeat, Duration::from_secs(5));
        assert!(matches!(
            proxy.submit(&late, &heartbeat(9, 0)),
            Err(ProxyError::Closed)
        ));
    }

    #[test]
    fn close_waits_for_timeouts() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        amc.set_drop_responses(true);
        let proxy = open(&amc);
        let events = bind_counting(&proxy);

        let descriptor =
            CommandDescriptor::new(4, OperationKind::Heartbeat, Duration::from_millis(40));
        proxy.submit(&descriptor, &heartbeat(4, 0)).unwrap();

        let start = Instant::now();
        proxy.close().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(descriptor.status(), DescriptorStatus::TimedOut);
        assert!(descriptor.is_timed_out());
        assert!(descriptor.is_signaled());
        assert_eq!(events.timeout.load(Ordering::SeqCst), 1);
        assert_eq!(events.complete.load(Ordering::SeqCst), 0);
        assert_eq!(proxy.in_flight(), 0);
        assert!(!amc.is_open());
    }

    #[test]
    fn close_reports_transport_failure() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        let proxy = open(&amc);
        bind_counting(&proxy);
        amc.set_fail_close(true);
        assert!(matches!(
            proxy.close(),
            Err(ProxyError::TransportCloseFailed(_))
        ));
        // The failed close still counts; nothing more is accepted.
        proxy.close().unwrap();
        let late = CommandDescriptor::new(1, OperationKind::Heartbeat, Duration::from_secs(5));
        assert!(matches!(
            proxy.submit(&late, &heartbeat(1, 0)),
            Err(ProxyError::Closed)
        ));
    }

    #[test]
    fn resolution_is_exactly_once() {
        let amc = EmulatedAmc::new(EmulatorConfig::default());
        let proxy = Arc::new(open(&amc));
        let events = bind_counting(&proxy);

        // A mix of commands that complete, time out and get aborted.
        amc.set_response_delay(Duration::from_millis(15));
        let threads: Vec<_> = (0..32u16)
            .map(|cid| {
                let proxy = proxy.clone();
                thread::spawn(move || {
                    let timeout = Duration::from_millis(5 + (cid as u64 % 4) * 10);
                    let descriptor =
                        CommandDescriptor::new(cid, OperationKind::Heartbeat, timeout);
                    proxy.submit(&descriptor, &heartbeat(cid, 0)).unwrap();
                    let cancel = CancelToken::new();
                    if cid % 5 == 0 {
                        cancel.cancel();
                    }
                    if !descriptor.wait(&cancel) {
                        proxy.abort(&descriptor);
                    }
                    descriptor
                })
            })
            .collect();

        let descriptors: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        proxy.close().unwrap();

        let mut signaled = 0;
        for descriptor in &descriptors {
            let status = descriptor.status();
            assert_ne!(status, DescriptorStatus::Pending);
            if status == DescriptorStatus::Aborted {
                assert!(!descriptor.is_signaled());
            } else {
                assert!(descriptor.is_signaled());
                signaled += 1;
            }
        }
        assert_eq!(
            events.complete.load(Ordering::SeqCst) + events.timeout.load(Ordering::SeqCst),
            signaled
        );
    }
}
