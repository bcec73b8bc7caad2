//! Encoder output ingest.
//!
//! Reads the encoder's stdout, reassembles segments and hands them to the
//! [`Broadcaster`]. One call covers one encoder session.

use crate::broadcast::Broadcaster;
use crate::config::StreamConfig;
use livecast_media::{SegmentKind, SegmentParser};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Failed to read encoder output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed encoder output: {0}")]
    Framing(#[from] livecast_media::Error),
}

/// Limits applied while reading one encoder session.
#[derive(Debug, Clone, Copy)]
pub struct IngestSettings {
    pub max_box_size: u64,
    pub read_buffer_size: usize,
}

impl From<&StreamConfig> for IngestSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            max_box_size: config.max_box_size,
            read_buffer_size: config.read_buffer_size,
        }
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

/// What one encoder session produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub bytes_read: u64,
    pub init_segments: u64,
    pub media_segments: u64,
    /// Media segments that arrived before any init segment and were skipped.
    pub orphaned_segments: u64,
    /// Bytes of a partial segment left when the pipe closed.
    pub discarded_bytes: usize,
}

/// Read `reader` to EOF, publishing every complete segment.
///
/// Returns on EOF or on the first read or framing error. A framing error
/// means the byte stream can no longer be trusted; the caller should end the
/// encoder process.
///
/// Either way the encoder session is over when this returns: viewers of it
/// are disconnected and the cached init segment is dropped (see
/// [`Broadcaster::end_session`]).
pub async fn ingest<R>(
    reader: R,
    broadcaster: &Broadcaster,
    settings: IngestSettings,
) -> Result<IngestSummary, IngestError>
where
    R: AsyncRead + Unpin,
{
    let result = read_session(reader, broadcaster, settings).await;
    broadcaster.end_session();
    result
}

async fn read_session<R>(
    mut reader: R,
    broadcaster: &Broadcaster,
    settings: IngestSettings,
) -> Result<IngestSummary, IngestError>
where
    R: AsyncRead + Unpin,
{
    let mut parser = SegmentParser::with_max_box_size(settings.max_box_size);
    let mut buf = vec![0u8; settings.read_buffer_size.max(1)];
    let mut summary = IngestSummary::default();

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        summary.bytes_read += n as u64;

        for segment in parser.feed(&buf[..n])? {
            match segment.kind {
                SegmentKind::Init => {
                    summary.init_segments += 1;
                    broadcaster.set_init(segment);
                }
                SegmentKind::Media if summary.init_segments == 0 => {
                    summary.orphaned_segments += 1;
                    tracing::warn!(
                        bytes = segment.len(),
                        "Skipping media segment received before any init segment"
                    );
                }
                SegmentKind::Media => {
                    summary.media_segments += 1;
                    broadcaster.publish(segment);
                }
            }
        }
    }

    summary.discarded_bytes = parser.finish();
    if summary.discarded_bytes > 0 {
        tracing::warn!(
            discarded = summary.discarded_bytes,
            "Encoder output ended mid-segment"
        );
    }

    tracing::debug!(
        bytes = summary.bytes_read,
        media = summary.media_segments,
        "Encoder output ended"
    );
    Ok(summary)
}
