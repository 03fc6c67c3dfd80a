//! EBML-style cluster container parsing: header + first-cluster offsets.

/// Document header signature (EBML header ID).
const DOC_HEADER_SIG: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];
/// First cluster marker signature (Cluster element ID).
const CLUSTER_SIG: [u8; 4] = [0x1F, 0x43, 0xB6, 0x75];

/// Scans `buf` for the document-header and first-cluster signatures and
/// returns the init segment `buf[H..C]` once both are found with `C > H`.
pub(super) fn scan(buf: &[u8]) -> Option<Vec<u8>> {
    let header_offset = find(buf, &DOC_HEADER_SIG)?;
    let cluster_offset = find(&buf[header_offset..], &CLUSTER_SIG)
        .map(|rel| rel + header_offset)?;

    if cluster_offset > header_offset {
        Some(buf[header_offset..cluster_offset].to_vec())
    } else {
        None
    }
}

fn find(haystack: &[u8], needle: &[u8; 4]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
