//! Livecast-Media: incremental fragmented-MP4 segmentation
//!
//! An encoder writing fragmented MP4 to a pipe produces an unstructured byte
//! stream. This crate turns that stream back into whole segments that can be
//! forwarded to players one at a time.
//!
//! # Modules
//!
//! - `boxes` - box type codes and header parsing (32- and 64-bit sizes)
//! - `reader` - residual-buffering reader that yields complete top-level boxes
//! - `segment` - groups boxes into init and media segments
//! - `fixtures` - synthetic streams for tests and benchmarks
//!
//! # Example
//!
//! ```
//! use livecast_media::{fixtures, SegmentKind, SegmentParser};
//!
//! let stream = fixtures::stream(2, 64);
//! let mut parser = SegmentParser::new();
//!
//! let mut segments = Vec::new();
//! for run in stream.chunks(10) {
//!     segments.extend(parser.feed(run).unwrap());
//! }
//!
//! assert_eq!(segments[0].kind, SegmentKind::Init);
//! assert_eq!(segments.len(), 3);
//! ```

pub mod boxes;
pub mod error;
pub mod fixtures;
pub mod reader;
pub mod segment;

pub use boxes::{BoxHeader, BoxType, Mp4Box};
pub use error::{Error, Result};
pub use reader::{BoxReader, DEFAULT_MAX_BOX_SIZE};
pub use segment::{Segment, SegmentClassifier, SegmentKind, SegmentParser};
