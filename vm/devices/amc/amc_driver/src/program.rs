// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Flash image programming.
//!
//! A multi-chunk partition image is written with its boot tag invalidated
//! first: chunk 0 is replaced by [`INVALID_BOOT_TAG`], the remaining chunks
//! are written, and only then is chunk 0 rewritten with its real contents. A
//! download that fails part way therefore never leaves a bootable but
//! incomplete image behind.

use crate::cancel::CancelToken;
use crate::control::AmcControl;
use crate::control::AmcError;
use crate::control::CHUNK_SIZE;
use crate::control::DownloadChunk;
use crate::control::DownloadTarget;

/// Written over the first chunk while an image download is in progress.
pub const INVALID_BOOT_TAG: u32 = 0xffff_ffff;

/// Chunk indices are 15 bits wide.
const MAX_CHUNKS: usize = 0x8000;

/// Raw partition number that addresses the flash partition table.
pub const FPT_UPDATE_MAGIC: u32 = 0xaaaa_aaaa;

impl TryFrom<u32> for DownloadTarget {
    type Error = AmcError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            FPT_UPDATE_MAGIC => Ok(Self::Fpt),
            partition if partition <= crate::control::MAX_PARTITION as u32 => {
                Ok(Self::Partition(partition as u8))
            }
            _ => Err(AmcError::InvalidParameter("partition out of range")),
        }
    }
}

impl AmcControl {
    /// Writes `image` to flash partition `partition`.
    ///
    /// `progress` is called with the number of bytes accepted after each
    /// chunk.
    pub fn download_image(
        &self,
        image: &[u8],
        partition: u8,
        progress: impl FnMut(usize),
        cancel: &CancelToken,
    ) -> Result<(), AmcError> {
        self.download(image, DownloadTarget::Partition(partition), progress, cancel)
    }

    /// Writes a new flash partition table.
    pub fn update_fpt(
        &self,
        image: &[u8],
        progress: impl FnMut(usize),
        cancel: &CancelToken,
    ) -> Result<(), AmcError> {
        self.download(image, DownloadTarget::Fpt, progress, cancel)
    }

    fn download(
        &self,
        image: &[u8],
        target: DownloadTarget,
        mut progress: impl FnMut(usize),
        cancel: &CancelToken,
    ) -> Result<(), AmcError> {
        if image.is_empty() {
            return Err(AmcError::InvalidParameter("empty image"));
        }
        let chunks: Vec<&[u8]> = image.chunks(CHUNK_SIZE).collect();
        let count = chunks.len();
        if count > MAX_CHUNKS {
            return Err(AmcError::InvalidParameter("image too large"));
        }

        let rewrite_boot_tag = count > 1 && matches!(target, DownloadTarget::Partition(_));
        tracing::debug!(?target, size = image.len(), count, "downloading image");

        let result = self.write_chunks(target, &chunks, rewrite_boot_tag, &mut progress, cancel);
        if let Err(err) = &result {
            tracing::error!(
                ?target,
                error = err as &dyn std::error::Error,
                "image download failed"
            );
        }
        result
    }

    fn write_chunks(
        &self,
        target: DownloadTarget,
        chunks: &[&[u8]],
        rewrite_boot_tag: bool,
        progress: &mut impl FnMut(usize),
        cancel: &CancelToken,
    ) -> Result<(), AmcError> {
        let last_index = chunks.len() - 1;
        for (index, &data) in chunks.iter().enumerate() {
            if index == 0 && rewrite_boot_tag {
                tracing::debug!(?target, "invalidating boot tag");
                self.download_chunk(
                    &DownloadChunk {
                        target,
                        index: 0,
                        last: false,
                        data: &INVALID_BOOT_TAG.to_le_bytes(),
                    },
                    cancel,
                )?;
                continue;
            }

            let accepted = self.download_chunk(
                &DownloadChunk {
                    target,
                    index: index as u16,
                    last: !rewrite_boot_tag && index == last_index,
                    data,
                },
                cancel,
            )?;
            progress(accepted);
        }

        if rewrite_boot_tag {
            tracing::debug!(?target, "rewriting first chunk");
            let accepted = self.download_chunk(
                &DownloadChunk {
                    target,
                    index: 0,
                    last: true,
                    data: chunks[0],
                },
                cancel,
            )?;
            progress(accepted);
        }
        Ok(())
    }
}
