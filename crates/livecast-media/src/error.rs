//! Error types for livecast-media.

use crate::boxes::BoxType;
use thiserror::Error;

/// Result type for livecast-media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for livecast-media operations.
///
/// Every variant is a framing error: once returned, the byte stream can no
/// longer be trusted to land on a box boundary and the parser must be
/// recreated for the next encoder session.
#[derive(Debug, Error)]
pub enum Error {
    /// Box header declares a size smaller than the header itself.
    #[error("Invalid box size {size} for '{box_type}' (header is {header_size} bytes)")]
    InvalidBoxSize {
        box_type: BoxType,
        size: u64,
        header_size: u8,
    },

    /// Box header declares "extends to end of stream", which a live pipe cannot honour.
    #[error("Unbounded box '{0}' is not allowed in a live stream")]
    UnboundedBox(BoxType),

    /// Box header declares a size beyond the configured limit.
    #[error("Box '{box_type}' declares {size} bytes (limit: {limit})")]
    BoxTooLarge {
        box_type: BoxType,
        size: u64,
        limit: u64,
    },

    /// Boxes kept arriving without completing a segment.
    #[error("Unfinished segment holds {pending} bytes (limit: {limit})")]
    SegmentTooLarge { pending: usize, limit: usize },

    /// Boxes arrived in an order that cannot form a segment.
    #[error("Unexpected box '{found}': {reason}")]
    UnexpectedBox {
        found: BoxType,
        reason: &'static str,
    },
}

impl Error {
    /// Create an unexpected-box error.
    pub fn unexpected(found: BoxType, reason: &'static str) -> Self {
        Self::UnexpectedBox { found, reason }
    }
}
