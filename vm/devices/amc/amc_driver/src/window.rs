// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Arbitration of the shared scratch windows.
//!
//! The controller reads request data from, and writes response data to, two
//! fixed regions of the payload memory. Each region serves one request at a
//! time; a [`WindowLease`] grants exclusive use until it is dropped.

use crate::cancel::CancelToken;
use crate::cancel::WAIT_SLICE;
use parking_lot::Condvar;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WindowKind {
    /// The small window used for sensor data.
    Log,
    /// The large window used for images and device reads and writes.
    Data,
}

/// Placement of a window within the payload memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WindowRegion {
    pub base: u64,
    pub len: u64,
}

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("wait for the {0:?} window was cancelled")]
    Cancelled(WindowKind),
}

#[derive(Debug)]
struct Window {
    kind: WindowKind,
    region: WindowRegion,
    busy: Mutex<bool>,
    cond: Condvar,
}

impl Window {
    fn new(kind: WindowKind, region: WindowRegion) -> Self {
        Self {
            kind,
            region,
            busy: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self, cancel: &CancelToken) -> Result<WindowLease<'_>, WindowError> {
        let mut busy = self.busy.lock();
        while *busy {
            if cancel.is_cancelled() {
                tracing::debug!(window = ?self.kind, "window acquire cancelled");
                return Err(WindowError::Cancelled(self.kind));
            }
            self.cond.wait_for(&mut busy, WAIT_SLICE);
        }
        *busy = true;
        Ok(WindowLease { window: self })
    }

    fn try_acquire(&self) -> Option<WindowLease<'_>> {
        let mut busy = self.busy.lock();
        if *busy {
            return None;
        }
        *busy = true;
        Some(WindowLease { window: self })
    }
}

/// The arbiter for the log and data windows.
#[derive(Debug)]
pub struct WindowArbiter {
    log: Window,
    data: Window,
}

impl WindowArbiter {
    pub fn new(log: WindowRegion, data: WindowRegion) -> Self {
        Self {
            log: Window::new(WindowKind::Log, log),
            data: Window::new(WindowKind::Data, data),
        }
    }

    fn window(&self, kind: WindowKind) -> &Window {
        match kind {
            WindowKind::Log => &self.log,
            WindowKind::Data => &self.data,
        }
    }

    pub fn region(&self, kind: WindowKind) -> WindowRegion {
        self.window(kind).region
    }

    /// Blocks until the `kind` window is free or `cancel` fires.
    pub fn acquire(
        &self,
        kind: WindowKind,
        cancel: &CancelToken,
    ) -> Result<WindowLease<'_>, WindowError> {
        self.window(kind).acquire(cancel)
    }

    pub fn acquire_log(&self, cancel: &CancelToken) -> Result<WindowLease<'_>, WindowError> {
        self.acquire(WindowKind::Log, cancel)
    }

    pub fn acquire_data(&self, cancel: &CancelToken) -> Result<WindowLease<'_>, WindowError> {
        self.acquire(WindowKind::Data, cancel)
    }

    /// Takes the `kind` window if it is free, without waiting.
    pub fn try_acquire(&self, kind: WindowKind) -> Option<WindowLease<'_>> {
        self.window(kind).try_acquire()
    }

    pub fn try_acquire_log(&self) -> Option<WindowLease<'_>> {
        self.try_acquire(WindowKind::Log)
    }

    pub fn try_acquire_data(&self) -> Option<WindowLease<'_>> {
        self.try_acquire(WindowKind::Data)
    }
}

/// Exclusive use of a window. The window is released when this is dropped.
#[must_use]
#[derive(Debug)]
pub struct WindowLease<'a> {
    window: &'a Window,
}

impl WindowLease<'_> {
    pub fn kind(&self) -> WindowKind {
        self.window.kind
    }

    /// Offset of the window within the payload memory.
    pub fn base(&self) -> u64 {
        self.window.region.base
    }

    pub fn len(&self) -> u64 {
        self.window.region.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn release(self) {}
}

impl Drop for WindowLease<'_> {
    fn drop(&mut self) {
        *self.window.busy.lock() = false;
        self.window.cond.notify_one();
    }
}
