//! `InitCache`: a byte ring holding the head of the encoder's output, plus
//! the published, immutable init-segment snapshot cut from it.
//!
//! Two parsers are selected by container kind: a cluster-delimited
//! (EBML-style) container and a box-based (ISO-BMFF-style) container. Both
//! are intentionally tiny and conservative - they refuse to interpret bytes
//! beyond the fixed head window and make no attempt to validate media
//! semantics.

mod boxes;
mod cluster;

use bytes::Bytes;
use parking_lot::Mutex;

/// Maximum number of head bytes the cache will buffer for init-segment
/// sniffing. Bytes beyond this cap are ignored for detection purposes; live
/// flow is unaffected since the same bytes are also handed to the
/// broadcaster independently.
pub const CAPACITY: usize = 2 * 1024 * 1024;

/// Which container family the encoder is expected to produce, selected by
/// codec family in `EncoderConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// EBML-style cluster container (e.g. WebM/Matroska).
    Cluster,
    /// ISO-BMFF-style fragmented box container (e.g. fragmented MP4).
    Box,
}

struct Inner {
    buf: Vec<u8>,
    snapshot: Option<Bytes>,
}

/// Scans the head of an encoder's byte stream to capture a replayable init
/// segment. Safe to share across threads: `feed` is called from the
/// supervisor's single read loop, `snapshot` is read by every subscribing
/// session.
pub struct InitCache {
    kind: ContainerKind,
    inner: Mutex<Inner>,
}

impl InitCache {
    /// Creates an empty cache for the given container kind.
    #[must_use]
    pub fn new(kind: ContainerKind) -> Self {
        Self {
            kind,
            inner: Mutex::new(Inner {
                buf: Vec::new(),
                snapshot: None,
            }),
        }
    }

    /// Appends `bytes` to the head buffer (up to `CAPACITY`) and re-runs the
    /// container parser, updating the snapshot at most once per `reset()`.
    pub fn feed(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.snapshot.is_some() {
            return; // already captured; nothing left to detect
        }

        if inner.buf.len() < CAPACITY {
            let room = CAPACITY - inner.buf.len();
            let take = room.min(bytes.len());
            inner.buf.extend_from_slice(&bytes[..take]);
        }

        let found = match self.kind {
            ContainerKind::Cluster => cluster::scan(&inner.buf),
            ContainerKind::Box => boxes::scan(&inner.buf),
        };

        if let Some(snapshot) = found {
            inner.snapshot = Some(Bytes::from(snapshot));
        }
    }

    /// Returns the current init-segment snapshot, empty until the relevant
    /// container prefix has been fully buffered.
    #[must_use]
    pub fn snapshot(&self) -> Bytes {
        self.inner
            .lock()
            .snapshot
            .clone()
            .unwrap_or_else(Bytes::new)
    }

    /// Returns `true` once a non-empty snapshot has been captured.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.lock().snapshot.is_some()
    }

    /// Clears all buffered bytes and the published snapshot. Called on
    /// every encoder restart.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.buf.clear();
        inner.snapshot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_cache_captures_spec_example() {
        let cache = InitCache::new(ContainerKind::Cluster);
        assert!(cache.snapshot().is_empty());

        cache.feed(&[
            0x00, 0xFF, 0x1A, 0x45, 0xDF, 0xA3, 0xAA, 0xBB, 0x1F, 0x43, 0xB6, 0x75, 0xCC,
        ]);

        assert_eq!(
            cache.snapshot().as_ref(),
            &[0x1A, 0x45, 0xDF, 0xA3, 0xAA, 0xBB]
        );
    }

    #[test]
    fn cluster_cache_stays_empty_until_both_markers_seen() {
        let cache = InitCache::new(ContainerKind::Cluster);
        cache.feed(&[0x1A, 0x45, 0xDF, 0xA3, 0x00, 0x00]);
        assert!(cache.snapshot().is_empty());

        cache.feed(&[0x1F, 0x43, 0xB6, 0x75]);
        assert!(!cache.snapshot().is_empty());
    }

    #[test]
    fn feed_can_be_split_across_multiple_calls() {
        let cache = InitCache::new(ContainerKind::Cluster);
        let whole: Vec<u8> = vec![
            0x00, 0x1A, 0x45, 0xDF, 0xA3, 0xAA, 0x1F, 0x43, 0xB6, 0x75,
        ];
        for chunk in whole.chunks(2) {
            cache.feed(chunk);
        }
        assert_eq!(cache.snapshot().as_ref(), &[0x1A, 0x45, 0xDF, 0xA3, 0xAA]);
    }

    #[test]
    fn reset_clears_buffer_and_snapshot() {
        let cache = InitCache::new(ContainerKind::Cluster);
        cache.feed(&[0x1A, 0x45, 0xDF, 0xA3, 0x1F, 0x43, 0xB6, 0x75]);
        assert!(!cache.snapshot().is_empty());

        cache.reset();
        assert!(cache.snapshot().is_empty());
        assert!(!cache.is_ready());
    }

    #[test]
    fn snapshot_never_exceeds_capacity_window() {
        let cache = InitCache::new(ContainerKind::Cluster);
        // Feed far more than CAPACITY bytes of noise with no valid markers.
        let noise = vec![0u8; CAPACITY + 4096];
        cache.feed(&noise);
        assert!(cache.snapshot().is_empty());
    }
}
