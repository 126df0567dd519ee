// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces between the AMC driver and the memory it shares with the
//! management controller.
//!
//! [`GcqTransport`] moves submission and completion entries through the
//! command queue ring. [`PayloadMemory`] gives bounds-checked access to the
//! shared payload region that holds the partition table and the scratch
//! windows.

#![forbid(unsafe_code)]

use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// An error from the underlying transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not open")]
    NotOpen,
    #[error("access of {len} bytes at offset {offset:#x} is out of bounds")]
    OutOfBounds { offset: u64, len: usize },
    #[error("device error")]
    Device(#[source] std::io::Error),
}

/// The command queue transport.
pub trait GcqTransport: Send + Sync {
    /// Prepares the queue for use.
    fn open(&self) -> Result<(), TransportError>;

    /// Releases the queue. No request is written after this returns.
    fn close(&self) -> Result<(), TransportError>;

    /// Writes a submission entry.
    fn write(&self, offset: u64, data: &[u8]) -> Result<(), TransportError>;

    /// Reads the next completion entry into `buf`.
    ///
    /// Returns the number of bytes read, or zero if no completion is pending.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// The shared payload memory region.
pub trait PayloadMemory: Send + Sync {
    /// The size of the region in bytes.
    fn len(&self) -> u64;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), TransportError>;

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), TransportError>;
}

/// Typed accessors for [`PayloadMemory`].
pub trait PayloadMemoryExt: PayloadMemory {
    fn read_obj<T: FromBytes + IntoBytes>(&self, offset: u64) -> Result<T, TransportError> {
        let mut obj = <T as FromZeros>::new_zeroed();
        self.read_at(offset, obj.as_mut_bytes())?;
        Ok(obj)
    }

    fn write_obj<T: IntoBytes + Immutable + KnownLayout>(
        &self,
        offset: u64,
        obj: &T,
    ) -> Result<(), TransportError> {
        self.write_at(offset, obj.as_bytes())
    }
}

impl<T: PayloadMemory + ?Sized> PayloadMemoryExt for T {}

/// Checks that an access of `len` bytes at `offset` fits in a region of
/// `size` bytes.
pub fn check_bounds(size: u64, offset: u64, len: usize) -> Result<(), TransportError> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(TransportError::OutOfBounds { offset, len }),
    }
}
