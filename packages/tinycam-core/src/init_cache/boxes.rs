//! ISO-BMFF-style box container parsing: `ftyp` + `moov` prefix detection.

/// Parses top-level boxes from the start of `buf` looking for a `moov` box
/// that completes after an `ftyp` box has been seen. Returns
/// `buf[0..end_of_moov]` once found.
///
/// Box header: 32-bit big-endian size, 4-byte ASCII type. `size == 1` means
/// a 64-bit extended size follows immediately. `size < 8` (and not the
/// extended-size escape) is malformed and terminates parsing for this feed.
pub(super) fn scan(buf: &[u8]) -> Option<Vec<u8>> {
    let mut offset = 0usize;
    let mut seen_ftyp = false;

    while offset + 8 <= buf.len() {
        let declared_size = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap());
        let box_type = &buf[offset + 4..offset + 8];

        let (header_len, body_len) = if declared_size == 1 {
            if offset + 16 > buf.len() {
                break; // extended size field not fully buffered yet
            }
            let ext = u64::from_be_bytes(buf[offset + 8..offset + 16].try_into().unwrap());
            if ext < 16 {
                break; // malformed
            }
            (16usize, ext as usize - 16)
        } else {
            if declared_size < 8 {
                break; // malformed per spec
            }
            (8usize, declared_size as usize - 8)
        };

        let box_end = offset + header_len + body_len;
        if box_end > buf.len() {
            break; // box not fully buffered yet
        }

        if box_type == b"ftyp" {
            seen_ftyp = true;
        } else if box_type == b"moov" && seen_ftyp {
            return Some(buf[0..box_end].to_vec());
        }

        offset = box_end;
    }

    None
}
