//! Segment classification and grouping.
//!
//! Top-level boxes are grouped into the two units a player can append:
//!
//! - **Init segment**: everything up to and including `moov` (normally
//!   `ftyp` + `moov`).
//! - **Media segment**: optional prefix boxes (`styp`, `sidx`, `prft`, `emsg`)
//!   followed by one `moof` + `mdat` pair.
//!
//! A segment is only emitted once its last box is complete, so a consumer
//! never sees a partial unit.

use crate::boxes::{BoxHeader, BoxRole, BoxType, ChildBoxes, Mp4Box};
use crate::reader::{BoxReader, DEFAULT_MAX_BOX_SIZE};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};

/// Kind of segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
#[cfg_attr(feature = "serialize", serde(rename_all = "lowercase"))]
pub enum SegmentKind {
    /// Format/metadata boxes, no samples.
    Init,
    /// Time-stamped audio/video samples.
    Media,
}

impl std::fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Media => write!(f, "media"),
        }
    }
}

/// A complete, independently dispatchable unit of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Position among segments of the same kind emitted by one parser, from 1.
    pub sequence: u64,
    /// Types of the top-level boxes in this segment, in stream order.
    pub box_types: Vec<BoxType>,
    /// Segment bytes, ready to write to a client.
    pub data: Bytes,
}

impl Segment {
    pub fn is_init(&self) -> bool {
        self.kind == SegmentKind::Init
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sequence number from the `mfhd` box of a media segment.
    pub fn fragment_sequence(&self) -> Option<u32> {
        if self.kind != SegmentKind::Media {
            return None;
        }
        let mut buf: &[u8] = &self.data;
        // Walk top-level boxes to the moof, then look for mfhd inside it.
        while let Ok(Some(header)) = BoxHeader::parse(buf) {
            let size = usize::try_from(header.size).ok()?;
            if size > buf.len() {
                return None;
            }
            if header.box_type == BoxType::MOOF {
                let payload = &buf[header.header_size as usize..size];
                let (_, mfhd) = ChildBoxes::new(payload).find(|(t, _)| *t == BoxType::MFHD)?;
                let seq = mfhd.get(4..8)?;
                return Some(u32::from_be_bytes([seq[0], seq[1], seq[2], seq[3]]));
            }
            buf = &buf[size..];
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    /// Nothing but filler pending.
    Idle,
    /// Init boxes seen, waiting for `moov`.
    Init,
    /// Prefix boxes seen, waiting for `moof`.
    Prefix,
    /// `moof` seen, waiting for `mdat`.
    Fragment,
}

/// Groups complete boxes into segments.
#[derive(Debug)]
pub struct SegmentClassifier {
    pending: Vec<Mp4Box>,
    pending_len: usize,
    max_pending: usize,
    group: Group,
    init_count: u64,
    media_count: u64,
}

impl SegmentClassifier {
    pub fn new() -> Self {
        Self::with_max_pending(pending_limit(DEFAULT_MAX_BOX_SIZE))
    }

    /// Create a classifier that fails once an unfinished segment holds more
    /// than `limit` bytes.
    pub fn with_max_pending(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            pending_len: 0,
            max_pending: limit,
            group: Group::Idle,
            init_count: 0,
            media_count: 0,
        }
    }

    /// Add one complete box; returns a segment when this box completes one.
    pub fn push_box(&mut self, mp4_box: Mp4Box) -> Result<Option<Segment>> {
        let box_type = mp4_box.box_type();

        match box_type.role() {
            BoxRole::Init => {
                if matches!(self.group, Group::Prefix | Group::Fragment) {
                    return Err(Error::unexpected(box_type, "init box inside an open fragment"));
                }
                self.group = Group::Init;
                self.hold(mp4_box)?;
                if box_type == BoxType::MOOV {
                    return Ok(Some(self.emit(SegmentKind::Init)));
                }
            }
            BoxRole::FragmentPrefix => match self.group {
                Group::Init => {
                    return Err(Error::unexpected(box_type, "fragment started before moov"));
                }
                Group::Fragment => {
                    return Err(Error::unexpected(box_type, "prefix box between moof and mdat"));
                }
                Group::Idle | Group::Prefix => {
                    self.group = Group::Prefix;
                    self.hold(mp4_box)?;
                }
            },
            BoxRole::FragmentHeader => match self.group {
                Group::Init => {
                    return Err(Error::unexpected(box_type, "fragment started before moov"));
                }
                Group::Fragment => {
                    return Err(Error::unexpected(box_type, "second moof before mdat"));
                }
                Group::Idle | Group::Prefix => {
                    self.group = Group::Fragment;
                    self.hold(mp4_box)?;
                }
            },
            BoxRole::FragmentPayload => {
                if self.group != Group::Fragment {
                    return Err(Error::unexpected(box_type, "mdat without a preceding moof"));
                }
                self.hold(mp4_box)?;
                return Ok(Some(self.emit(SegmentKind::Media)));
            }
            BoxRole::Trailer => {
                tracing::debug!(%box_type, "Ignoring trailer box");
            }
            BoxRole::Filler | BoxRole::Unknown => {
                self.hold(mp4_box)?;
            }
        }

        Ok(None)
    }

    /// Bytes held for a segment that has not completed yet.
    pub fn pending_bytes(&self) -> usize {
        self.pending_len
    }

    /// Drop the unfinished segment, returning how many bytes it held.
    pub fn reset(&mut self) -> usize {
        let discarded = self.pending_len;
        self.pending.clear();
        self.pending_len = 0;
        self.group = Group::Idle;
        discarded
    }

    fn hold(&mut self, mp4_box: Mp4Box) -> Result<()> {
        let pending = self.pending_len + mp4_box.data.len();
        if pending > self.max_pending {
            return Err(Error::SegmentTooLarge {
                pending,
                limit: self.max_pending,
            });
        }
        self.pending_len = pending;
        self.pending.push(mp4_box);
        Ok(())
    }

    fn emit(&mut self, kind: SegmentKind) -> Segment {
        let boxes = std::mem::take(&mut self.pending);
        self.pending_len = 0;
        self.group = Group::Idle;

        let sequence = match kind {
            SegmentKind::Init => {
                self.init_count += 1;
                self.init_count
            }
            SegmentKind::Media => {
                self.media_count += 1;
                self.media_count
            }
        };

        let box_types = boxes.iter().map(|b| b.box_type()).collect();
        let data = if boxes.len() == 1 {
            boxes[0].data.clone()
        } else {
            let total = boxes.iter().map(|b| b.data.len()).sum();
            let mut buf = BytesMut::with_capacity(total);
            for b in &boxes {
                buf.extend_from_slice(&b.data);
            }
            buf.freeze()
        };

        Segment {
            kind,
            sequence,
            box_types,
            data,
        }
    }
}

impl Default for SegmentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes an unfinished segment may hold: room for a `moof` and an `mdat` at
/// the box size limit.
fn pending_limit(max_box_size: u64) -> usize {
    usize::try_from(max_box_size.saturating_mul(2)).unwrap_or(usize::MAX)
}

/// Box reader and classifier combined: byte runs in, whole segments out.
#[derive(Debug, Default)]
pub struct SegmentParser {
    reader: BoxReader,
    classifier: SegmentClassifier,
}

impl SegmentParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a parser that rejects boxes larger than `limit` bytes, and
    /// segments larger than twice that.
    pub fn with_max_box_size(limit: u64) -> Self {
        Self {
            reader: BoxReader::with_max_box_size(limit),
            classifier: SegmentClassifier::with_max_pending(pending_limit(limit)),
        }
    }

    /// Feed one run of bytes and collect every segment it completes.
    pub fn feed(&mut self, run: &[u8]) -> Result<Vec<Segment>> {
        self.reader.push(run);

        let mut segments = Vec::new();
        while let Some(mp4_box) = self.reader.next_box()? {
            if let Some(segment) = self.classifier.push_box(mp4_box)? {
                segments.push(segment);
            }
        }
        Ok(segments)
    }

    /// End of stream: discard partial boxes and unfinished segments.
    ///
    /// Returns the number of bytes discarded.
    pub fn finish(&mut self) -> usize {
        self.reader.finish() + self.classifier.reset()
    }

    /// Bytes received but not yet part of an emitted segment.
    pub fn pending_bytes(&self) -> usize {
        self.reader.buffered() + self.classifier.pending_bytes()
    }
}
