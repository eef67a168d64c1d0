//! Fragmentation and reassembly of datagram payloads.
//!
//! Every outbound payload is cut into slices of at most `fragment_size`
//! bytes, each carried in its own frame:
//!
//! `[msg_id:8][index:4][total:4][checksum:4][part:N]`
//!
//! - **msg_id**: random id shared by all fragments of one payload (little-endian u64)
//! - **index**: position of this fragment, `0..total` (little-endian u32)
//! - **total**: number of fragments of the payload (little-endian u32)
//! - **checksum**: CRC32C of `part`
//! - **part**: the payload slice
//!
//! Small payloads travel as a single fragment. On the receiving side a
//! [`Reassembler`] collects fragments per message id and releases the payload
//! once, the moment every index is present. Fragments may arrive out of order
//! or more than once. A frame declaring more fragments than the receiver's
//! bound is rejected before any buffer is allocated for it.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::membership::Member;
use crate::transport::{Transport, TransportError};

/// Header size: 8 (msg_id) + 4 (index) + 4 (total) + 4 (checksum) = 20 bytes.
pub const HEADER_SIZE: usize = 20;

/// Fragment frame errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    /// Not enough bytes for a header.
    #[error("frame too short: need {needed} bytes, have {have}")]
    TooShort {
        /// Minimum bytes required.
        needed: usize,
        /// Bytes available.
        have: usize,
    },

    /// The part does not match its checksum.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum from the header.
        expected: u32,
        /// Checksum computed over the part.
        actual: u32,
    },

    /// The index is outside `0..total`.
    #[error("invalid fragment index {index} of {total}")]
    InvalidIndex {
        /// The offending index.
        index: u32,
        /// Declared fragment count.
        total: u32,
    },

    /// The declared fragment count exceeds what this receiver accepts.
    #[error("too many fragments: {total} declared, at most {max} accepted")]
    TooManyFragments {
        /// Declared fragment count.
        total: u32,
        /// Receiver bound.
        max: u32,
    },

    /// Fragments of one message disagree on the fragment count.
    #[error("inconsistent fragment count: expected {expected}, got {got}")]
    InconsistentTotal {
        /// Count from the first fragment seen.
        expected: u32,
        /// Count from this fragment.
        got: u32,
    },
}

/// One slice of a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Id shared by every fragment of the payload.
    pub msg_id: u64,
    /// Position of this fragment.
    pub index: u32,
    /// Number of fragments of the payload.
    pub total: u32,
    /// The payload slice.
    pub part: Vec<u8>,
}

impl Fragment {
    /// Serialize into a frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.part.len());
        buf.extend_from_slice(&self.msg_id.to_le_bytes());
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.total.to_le_bytes());
        buf.extend_from_slice(&crc32c::crc32c(&self.part).to_le_bytes());
        buf.extend_from_slice(&self.part);
        buf
    }

    /// Parse and validate a frame.
    ///
    /// # Errors
    ///
    /// - `TooShort`: fewer than [`HEADER_SIZE`] bytes
    /// - `InvalidIndex`: `index >= total`
    /// - `ChecksumMismatch`: the part was corrupted
    pub fn decode(buf: &[u8]) -> Result<Self, FragmentError> {
        if buf.len() < HEADER_SIZE {
            return Err(FragmentError::TooShort {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }

        let msg_id = u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ]);
        let index = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let total = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let expected = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);

        if index >= total {
            return Err(FragmentError::InvalidIndex { index, total });
        }

        let part = &buf[HEADER_SIZE..];
        let actual = crc32c::crc32c(part);
        if actual != expected {
            return Err(FragmentError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            msg_id,
            index,
            total,
            part: part.to_vec(),
        })
    }
}

/// Cut `payload` into fragments of at most `fragment_size` bytes.
///
/// An empty payload yields one empty fragment.
pub fn split_payload(msg_id: u64, payload: &[u8], fragment_size: usize) -> Vec<Fragment> {
    let size = fragment_size.max(1);
    if payload.is_empty() {
        return vec![Fragment {
            msg_id,
            index: 0,
            total: 1,
            part: Vec::new(),
        }];
    }
    let total = payload.len().div_ceil(size) as u32;
    payload
        .chunks(size)
        .enumerate()
        .map(|(index, part)| Fragment {
            msg_id,
            index: index as u32,
            total,
            part: part.to_vec(),
        })
        .collect()
}

// ============================================================================
// Collector
// ============================================================================

/// Fragments of one payload received so far.
#[derive(Debug)]
pub struct FragmentCollector {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
    last_update: Duration,
}

impl FragmentCollector {
    /// A collector expecting `total` fragments.
    pub fn new(total: u32, now: Duration) -> Self {
        Self {
            parts: vec![None; total as usize],
            received: 0,
            last_update: now,
        }
    }

    /// Store a fragment. Storing an index twice is a no-op.
    ///
    /// Returns whether the fragment was new.
    pub fn add(&mut self, index: u32, part: Vec<u8>, now: Duration) -> Result<bool, FragmentError> {
        let total = self.parts.len() as u32;
        let slot = self
            .parts
            .get_mut(index as usize)
            .ok_or(FragmentError::InvalidIndex { index, total })?;
        self.last_update = now;
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(part);
        self.received += 1;
        Ok(true)
    }

    /// Whether every fragment is present.
    pub fn is_complete(&self) -> bool {
        self.received == self.parts.len()
    }

    /// Fragment count.
    pub fn total(&self) -> u32 {
        self.parts.len() as u32
    }

    /// Concatenate the parts in index order, if complete.
    pub fn assemble(self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let len = self.parts.iter().flatten().map(Vec::len).sum();
        let mut out = Vec::with_capacity(len);
        for part in self.parts.into_iter().flatten() {
            out.extend_from_slice(&part);
        }
        Some(out)
    }
}

// ============================================================================
// Reassembler
// ============================================================================

/// Receiving side of the fragmentation layer.
#[derive(Debug)]
pub struct Reassembler {
    collectors: HashMap<u64, FragmentCollector>,
    /// Recently completed ids and when they completed.
    completed: HashMap<u64, Duration>,
    timeout: Duration,
    max_fragments: u32,
}

impl Reassembler {
    /// Partial payloads idle for longer than `timeout` are dropped on
    /// [`expire`](Self::expire). Frames declaring more than `max_fragments`
    /// fragments are rejected before anything is allocated for them.
    pub fn new(timeout: Duration, max_fragments: u32) -> Self {
        Self {
            collectors: HashMap::new(),
            completed: HashMap::new(),
            timeout,
            max_fragments,
        }
    }

    /// Accept one frame. Returns the whole payload when this frame completes it.
    ///
    /// # Errors
    ///
    /// Decoding errors from [`Fragment::decode`], plus `TooManyFragments`
    /// and `InconsistentTotal`.
    pub fn accept(&mut self, frame: &[u8], now: Duration) -> Result<Option<Vec<u8>>, FragmentError> {
        let fragment = Fragment::decode(frame)?;
        let msg_id = fragment.msg_id;
        if fragment.total > self.max_fragments {
            return Err(FragmentError::TooManyFragments {
                total: fragment.total,
                max: self.max_fragments,
            });
        }

        if self.completed.contains_key(&msg_id) {
            trace!(fragment_msg = msg_id, index = fragment.index, "late duplicate fragment");
            return Ok(None);
        }

        let collector = self
            .collectors
            .entry(msg_id)
            .or_insert_with(|| FragmentCollector::new(fragment.total, now));
        if collector.total() != fragment.total {
            return Err(FragmentError::InconsistentTotal {
                expected: collector.total(),
                got: fragment.total,
            });
        }
        collector.add(fragment.index, fragment.part, now)?;

        if !collector.is_complete() {
            return Ok(None);
        }
        self.completed.insert(msg_id, now);
        Ok(self
            .collectors
            .remove(&msg_id)
            .and_then(FragmentCollector::assemble))
    }

    /// Drop idle partial payloads and forget old completions.
    ///
    /// Returns how many partial payloads were dropped.
    pub fn expire(&mut self, now: Duration) -> usize {
        let timeout = self.timeout;
        let before = self.collectors.len();
        self.collectors
            .retain(|_, c| now.saturating_sub(c.last_update) <= timeout);
        self.completed
            .retain(|_, done| now.saturating_sub(*done) <= timeout);
        let dropped = before - self.collectors.len();
        if dropped > 0 {
            debug!(dropped, "dropped incomplete payloads");
        }
        dropped
    }

    /// Number of partially received payloads.
    pub fn pending(&self) -> usize {
        self.collectors.len()
    }
}

// ============================================================================
// Transport wrapper
// ============================================================================

/// Transport wrapper that fragments every outbound payload.
pub struct FragmentingTransport<T> {
    inner: T,
    fragment_size: usize,
    rng: Mutex<StdRng>,
}

impl<T: Transport> FragmentingTransport<T> {
    /// Wrap `inner`, with fragment ids drawn from OS entropy.
    pub fn new(inner: T, fragment_size: usize) -> Self {
        Self::with_rng(inner, fragment_size, StdRng::from_os_rng())
    }

    /// Wrap `inner`, with fragment ids drawn from a seeded generator.
    pub fn seeded(inner: T, fragment_size: usize, seed: u64) -> Self {
        Self::with_rng(inner, fragment_size, StdRng::seed_from_u64(seed))
    }

    fn with_rng(inner: T, fragment_size: usize, rng: StdRng) -> Self {
        Self {
            inner,
            fragment_size,
            rng: Mutex::new(rng),
        }
    }

    fn next_id(&self) -> u64 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random()
    }
}

impl<T: Transport> Transport for FragmentingTransport<T> {
    fn send_to(&self, to: Member, bytes: &[u8]) -> Result<(), TransportError> {
        let fragments = split_payload(self.next_id(), bytes, self.fragment_size);
        if fragments.len() > 1 {
            trace!(to = %to, len = bytes.len(), fragments = fragments.len(), "fragmenting");
        }
        for fragment in &fragments {
            self.inner.send_to(to, &fragment.encode())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use std::net::SocketAddr;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_split_sizes() {
        let frags = split_payload(1, &payload(10), 4);
        let sizes: Vec<_> = frags.iter().map(|f| f.part.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(frags.iter().all(|f| f.total == 3));

        assert_eq!(split_payload(1, &payload(8), 4).len(), 2);
        let empty = split_payload(1, &[], 4);
        assert_eq!(empty.len(), 1);
        assert!(empty[0].part.is_empty());
    }

    #[test]
    fn test_frame_layout() {
        let frame = Fragment {
            msg_id: 0x0102,
            index: 1,
            total: 3,
            part: b"abc".to_vec(),
        }
        .encode();
        assert_eq!(frame.len(), HEADER_SIZE + 3);
        assert_eq!(&frame[0..8], &0x0102u64.to_le_bytes());
        assert_eq!(&frame[8..12], &1u32.to_le_bytes());
        assert_eq!(&frame[12..16], &3u32.to_le_bytes());
        assert_eq!(&frame[HEADER_SIZE..], b"abc");
    }

    #[test]
    fn test_corruption_detected() {
        let mut frame = split_payload(7, b"hello", 64)[0].encode();
        frame[HEADER_SIZE] ^= 0xFF;
        assert!(matches!(
            Fragment::decode(&frame),
            Err(FragmentError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_malformed_frames() {
        assert_eq!(
            Fragment::decode(&[0u8; 5]),
            Err(FragmentError::TooShort {
                needed: HEADER_SIZE,
                have: 5
            })
        );
        let frame = Fragment {
            msg_id: 1,
            index: 3,
            total: 3,
            part: vec![],
        }
        .encode();
        assert_eq!(
            Fragment::decode(&frame),
            Err(FragmentError::InvalidIndex { index: 3, total: 3 })
        );
    }

    #[test]
    fn test_duplicate_fragment_reassembles_once() {
        let original = payload(30);
        let frames: Vec<_> = split_payload(42, &original, 10)
            .iter()
            .map(Fragment::encode)
            .collect();
        let mut r = Reassembler::new(Duration::from_secs(30), 1_000);
        let now = Duration::ZERO;

        assert_eq!(r.accept(&frames[1], now), Ok(None));
        assert_eq!(r.accept(&frames[1], now), Ok(None));
        assert_eq!(r.accept(&frames[0], now), Ok(None));
        assert_eq!(r.accept(&frames[2], now), Ok(Some(original)));

        // late duplicates after completion are swallowed
        assert_eq!(r.accept(&frames[1], now), Ok(None));
        assert_eq!(r.accept(&frames[2], now), Ok(None));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_collector_counts_each_index_once() {
        let mut c = FragmentCollector::new(2, Duration::ZERO);
        assert_eq!(c.add(1, b"b".to_vec(), Duration::ZERO), Ok(true));
        assert_eq!(c.add(1, b"b".to_vec(), Duration::ZERO), Ok(false));
        assert!(!c.is_complete());
        assert!(c.add(5, vec![], Duration::ZERO).is_err());
        assert_eq!(c.add(0, b"a".to_vec(), Duration::ZERO), Ok(true));
        assert_eq!(c.assemble(), Some(b"ab".to_vec()));
    }

    #[test]
    fn test_inconsistent_total_rejected() {
        let mut r = Reassembler::new(Duration::from_secs(30), 1_000);
        let a = Fragment {
            msg_id: 9,
            index: 0,
            total: 2,
            part: vec![1],
        };
        let b = Fragment {
            msg_id: 9,
            index: 1,
            total: 3,
            part: vec![2],
        };
        assert_eq!(r.accept(&a.encode(), Duration::ZERO), Ok(None));
        assert_eq!(
            r.accept(&b.encode(), Duration::ZERO),
            Err(FragmentError::InconsistentTotal {
                expected: 2,
                got: 3
            })
        );
    }

    #[test]
    fn test_oversized_fragment_count_rejected() {
        let mut r = Reassembler::new(Duration::from_secs(30), 1_000);
        let huge = Fragment {
            msg_id: 3,
            index: 0,
            total: 20_000_000,
            part: vec![],
        };
        assert_eq!(
            r.accept(&huge.encode(), Duration::ZERO),
            Err(FragmentError::TooManyFragments {
                total: 20_000_000,
                max: 1_000
            })
        );
        assert_eq!(r.pending(), 0);

        // exactly at the bound is fine
        let edge = Fragment {
            total: 1_000,
            ..huge
        };
        assert_eq!(r.accept(&edge.encode(), Duration::ZERO), Ok(None));
        assert_eq!(r.pending(), 1);
    }

    #[test]
    fn test_idle_partial_payloads_expire() {
        let mut r = Reassembler::new(Duration::from_secs(30), 1_000);
        let frames = split_payload(5, &payload(20), 10);
        r.accept(&frames[0].encode(), Duration::ZERO).expect("valid frame");
        assert_eq!(r.expire(Duration::from_secs(30)), 0);
        assert_eq!(r.expire(Duration::from_secs(31)), 1);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_fragmenting_transport_roundtrip() {
        let recorder = RecordingTransport::new();
        let transport = FragmentingTransport::seeded(recorder.clone(), 16, 1);
        let to = Member::new(SocketAddr::from(([127, 0, 0, 1], 9)));
        let original = payload(100);

        transport.send_to(to, &original).expect("send");
        let frames = recorder.take_raw();
        assert_eq!(frames.len(), 7);
        assert!(frames.iter().all(|(dest, f)| *dest == to && f.len() <= HEADER_SIZE + 16));

        let mut r = Reassembler::new(Duration::from_secs(30), 1_000);
        let mut out = None;
        for (_, frame) in frames.iter().rev() {
            if let Some(p) = r.accept(frame, Duration::ZERO).expect("valid frame") {
                out = Some(p);
            }
        }
        assert_eq!(out, Some(original));
    }
}
