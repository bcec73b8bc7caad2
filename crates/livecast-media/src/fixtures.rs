//! Synthetic fMP4 byte streams for tests and benchmarks.
//!
//! The boxes produced here are structurally valid at the top level (sizes,
//! types, `mfhd` sequence numbers) but carry placeholder sample data.

use bytes::{BufMut, BytesMut};

/// Write a box with a compact header.
pub fn write_box(buf: &mut BytesMut, box_type: &[u8; 4], payload: &[u8]) {
    buf.put_u32((8 + payload.len()) as u32);
    buf.put_slice(box_type);
    buf.put_slice(payload);
}

/// `ftyp` box with the brands a fragmenting encoder typically writes.
pub fn ftyp() -> Vec<u8> {
    let mut payload = BytesMut::new();
    payload.put_slice(b"isom"); // major brand
    payload.put_u32(0x200); // minor version
    for brand in [b"isom", b"iso6", b"iso2", b"avc1", b"mp41"] {
        payload.put_slice(brand);
    }

    let mut buf = BytesMut::new();
    write_box(&mut buf, b"ftyp", &payload);
    buf.to_vec()
}

/// Minimal `moov` box. `variant` changes the movie header so two encoder
/// sessions can be told apart.
pub fn moov(variant: u8) -> Vec<u8> {
    let mut mvhd = BytesMut::new();
    mvhd.put_u32(0); // version + flags
    mvhd.put_u32(0); // creation time
    mvhd.put_u32(0); // modification time
    mvhd.put_u32(1000); // timescale
    mvhd.put_u32(0); // duration (unknown for live)
    mvhd.put_u32(0x0001_0000); // rate 1.0
    mvhd.put_u16(0x0100); // volume 1.0
    mvhd.put_bytes(variant, 10);

    let mut mvex = BytesMut::new();
    write_box(&mut mvex, b"trex", &[0u8; 24]);

    let mut payload = BytesMut::new();
    write_box(&mut payload, b"mvhd", &mvhd);
    write_box(&mut payload, b"mvex", &mvex);

    let mut buf = BytesMut::new();
    write_box(&mut buf, b"moov", &payload);
    buf.to_vec()
}

/// Init segment (`ftyp` + `moov`) for encoder session 0.
pub fn init_segment() -> Vec<u8> {
    init_segment_variant(0)
}

/// Init segment for a given encoder session.
pub fn init_segment_variant(variant: u8) -> Vec<u8> {
    let mut out = ftyp();
    out.extend_from_slice(&moov(variant));
    out
}

/// `styp` box that some packagers emit ahead of each fragment.
pub fn styp() -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_box(&mut buf, b"styp", b"msdh\0\0\0\0msdhmsix");
    buf.to_vec()
}

/// Media segment (`moof` + `mdat`) whose `mfhd` carries `sequence` and whose
/// payload is `payload_len` bytes.
pub fn media_segment(sequence: u32, payload_len: usize) -> Vec<u8> {
    let mut mfhd = BytesMut::new();
    mfhd.put_u32(0); // version + flags
    mfhd.put_u32(sequence);

    let mut traf = BytesMut::new();
    write_box(&mut traf, b"tfhd", &[0, 2, 0, 0, 0, 0, 0, 1]);

    let mut moof = BytesMut::new();
    write_box(&mut moof, b"mfhd", &mfhd);
    write_box(&mut moof, b"traf", &traf);

    let mut buf = BytesMut::new();
    write_box(&mut buf, b"moof", &moof);
    write_box(&mut buf, b"mdat", &vec![sequence as u8; payload_len]);
    buf.to_vec()
}

/// `mdat` written with a 64-bit size header.
pub fn large_mdat(payload_len: usize) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32(1);
    buf.put_slice(b"mdat");
    buf.put_u64((16 + payload_len) as u64);
    buf.put_bytes(0xEE, payload_len);
    buf.to_vec()
}

/// Padding box.
pub fn free(len: usize) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_box(&mut buf, b"free", &vec![0u8; len]);
    buf.to_vec()
}

/// Full stream: init segment followed by media segments `1..=count`.
pub fn stream(count: u32, payload_len: usize) -> Vec<u8> {
    let mut out = init_segment();
    for seq in 1..=count {
        out.extend_from_slice(&media_segment(seq, payload_len));
    }
    out
}
