//! Incremental box reader.
//!
//! Turns arbitrarily split byte runs from an encoder pipe back into whole
//! top-level boxes. Bytes that do not yet form a complete box stay in the
//! residual buffer until the next run arrives.

use crate::boxes::{BoxHeader, Mp4Box};
use crate::{Error, Result};
use bytes::BytesMut;

/// Default upper bound for a single box (64 MiB).
pub const DEFAULT_MAX_BOX_SIZE: u64 = 64 * 1024 * 1024;

/// Reassembles complete boxes from a byte stream.
#[derive(Debug)]
pub struct BoxReader {
    residual: BytesMut,
    max_box_size: u64,
}

impl BoxReader {
    /// Create a reader with the default box size limit.
    pub fn new() -> Self {
        Self::with_max_box_size(DEFAULT_MAX_BOX_SIZE)
    }

    /// Create a reader that rejects boxes larger than `limit` bytes.
    pub fn with_max_box_size(limit: u64) -> Self {
        Self {
            residual: BytesMut::with_capacity(64 * 1024),
            max_box_size: limit,
        }
    }

    /// Append a run of bytes as delivered by the pipe.
    pub fn push(&mut self, run: &[u8]) {
        self.residual.extend_from_slice(run);
    }

    /// Take the next complete box off the front of the residual buffer.
    ///
    /// Returns `Ok(None)` when the buffered bytes end mid-header or mid-box.
    pub fn next_box(&mut self) -> Result<Option<Mp4Box>> {
        let Some(header) = BoxHeader::parse(&self.residual)? else {
            return Ok(None);
        };

        let too_large = || Error::BoxTooLarge {
            box_type: header.box_type,
            size: header.size,
            limit: self.max_box_size,
        };
        if header.size > self.max_box_size {
            return Err(too_large());
        }
        let size = usize::try_from(header.size).map_err(|_| too_large())?;

        if self.residual.len() < size {
            self.residual.reserve(size - self.residual.len());
            return Ok(None);
        }

        let data = self.residual.split_to(size).freeze();
        Ok(Some(Mp4Box { header, data }))
    }

    /// Number of bytes waiting for the rest of their box.
    pub fn buffered(&self) -> usize {
        self.residual.len()
    }

    /// Discard any partial box left when the pipe closes.
    ///
    /// Returns the number of bytes thrown away.
    pub fn finish(&mut self) -> usize {
        let discarded = self.residual.len();
        self.residual.clear();
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded partial box at end of stream");
        }
        discarded
    }
}

impl Default for BoxReader {
    fn default() -> Self {
        Self::new()
    }
}
