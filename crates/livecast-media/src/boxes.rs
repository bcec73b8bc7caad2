//! ISO-BMFF box types and header parsing.

use crate::{Error, Result};
use bytes::Bytes;

/// Size of a compact box header (32-bit size + type).
pub const HEADER_SIZE: usize = 8;

/// Size of an extended box header (32-bit marker + type + 64-bit size).
pub const LARGE_HEADER_SIZE: usize = 16;

/// Four-character box type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxType(pub [u8; 4]);

impl BoxType {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const MOOV: Self = Self(*b"moov");
    pub const PDIN: Self = Self(*b"pdin");
    pub const META: Self = Self(*b"meta");
    pub const STYP: Self = Self(*b"styp");
    pub const SIDX: Self = Self(*b"sidx");
    pub const PRFT: Self = Self(*b"prft");
    pub const EMSG: Self = Self(*b"emsg");
    pub const MOOF: Self = Self(*b"moof");
    pub const MFHD: Self = Self(*b"mfhd");
    pub const MDAT: Self = Self(*b"mdat");
    pub const MFRA: Self = Self(*b"mfra");
    pub const FREE: Self = Self(*b"free");
    pub const SKIP: Self = Self(*b"skip");
    pub const UUID: Self = Self(*b"uuid");

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Get the 4-char code as a string.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }

    /// Which part of a live fMP4 stream this box belongs to.
    pub fn role(&self) -> BoxRole {
        match *self {
            Self::FTYP | Self::MOOV | Self::PDIN | Self::META => BoxRole::Init,
            Self::STYP | Self::SIDX | Self::PRFT | Self::EMSG => BoxRole::FragmentPrefix,
            Self::MOOF => BoxRole::FragmentHeader,
            Self::MDAT => BoxRole::FragmentPayload,
            Self::FREE | Self::SKIP | Self::UUID => BoxRole::Filler,
            Self::MFRA => BoxRole::Trailer,
            _ => BoxRole::Unknown,
        }
    }
}

impl std::fmt::Display for BoxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role of a top-level box within a live fragmented stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxRole {
    /// Format/metadata (ftyp, moov).
    Init,
    /// Optional boxes preceding a fragment (styp, sidx, prft, emsg).
    FragmentPrefix,
    /// Fragment header (moof).
    FragmentHeader,
    /// Fragment sample data (mdat).
    FragmentPayload,
    /// Padding that travels with whatever segment it sits in.
    Filler,
    /// Random-access index written at the end of a finished file.
    Trailer,
    /// Anything else; carried along with the surrounding segment.
    Unknown,
}

/// Parsed box header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    /// Box type code.
    pub box_type: BoxType,
    /// Box size including header.
    pub size: u64,
    /// Size of the header (8 or 16 bytes).
    pub header_size: u8,
}

impl BoxHeader {
    /// Parse a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a full header.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let size32 = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let box_type = BoxType([buf[4], buf[5], buf[6], buf[7]]);

        let (size, header_size) = match size32 {
            0 => return Err(Error::UnboundedBox(box_type)),
            1 => {
                if buf.len() < LARGE_HEADER_SIZE {
                    return Ok(None);
                }
                let mut large = [0u8; 8];
                large.copy_from_slice(&buf[8..16]);
                (u64::from_be_bytes(large), LARGE_HEADER_SIZE as u8)
            }
            n => (n as u64, HEADER_SIZE as u8),
        };

        if size < header_size as u64 {
            return Err(Error::InvalidBoxSize {
                box_type,
                size,
                header_size,
            });
        }

        Ok(Some(Self {
            box_type,
            size,
            header_size,
        }))
    }

    /// Get the payload size (size - header).
    pub fn payload_size(&self) -> u64 {
        self.size.saturating_sub(self.header_size as u64)
    }
}

/// A complete top-level box, header included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mp4Box {
    pub header: BoxHeader,
    /// Full box bytes (header + payload).
    pub data: Bytes,
}

impl Mp4Box {
    pub fn box_type(&self) -> BoxType {
        self.header.box_type
    }

    /// Box payload without the header.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.header.header_size as usize..]
    }

    /// Iterate the direct children of a container box.
    ///
    /// Stops at the first malformed child instead of failing; child layout
    /// is informational only and never affects segment boundaries.
    pub fn children(&self) -> ChildBoxes<'_> {
        ChildBoxes::new(self.payload())
    }
}

/// Iterator over child boxes of a container payload.
pub struct ChildBoxes<'a> {
    buf: &'a [u8],
}

impl<'a> ChildBoxes<'a> {
    /// Iterate boxes packed back to back in `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for ChildBoxes<'a> {
    type Item = (BoxType, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let header = BoxHeader::parse(self.buf).ok()??;
        let size = usize::try_from(header.size).ok()?;
        if size > self.buf.len() {
            return None;
        }
        let payload = &self.buf[header.header_size as usize..size];
        self.buf = &self.buf[size..];
        Some((header.box_type, payload))
    }
}
