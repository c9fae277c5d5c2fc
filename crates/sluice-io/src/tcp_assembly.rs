//! TCP stream reassembly for the packet-capture consumer.
//!
//! A [`StreamBuffer`] holds the out-of-order segments of one direction of
//! one TCP session, sorted by sequence number with explicit 32-bit
//! wraparound handling, and releases the payload once the chain from the
//! head is gap-free.

use bytes::{Bytes, BytesMut};

/// Sequence numbers in the top sextile are "about to wrap"; numbers in
/// the bottom sextile sort after them while such a segment is pending.
const WRAP_HIGH: u32 = u32::MAX / 6 * 5;
const WRAP_LOW: u32 = u32::MAX / 6;

/// `true` when sequence `a` precedes `b` under wraparound ordering.
fn seq_before(a: u32, b: u32) -> bool {
    if a > WRAP_HIGH && b < WRAP_LOW {
        true
    } else if b > WRAP_HIGH && a < WRAP_LOW {
        false
    } else {
        a < b
    }
}

/// Hash a 4-tuple into the session key.
pub fn session_key(src: &std::net::SocketAddr, dst: &std::net::SocketAddr) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;
    let text = format!("{src}-{dst}");
    let mut hash = FNV_OFFSET;
    for byte in text.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

struct Segment {
    seq: u32,
    payload: Bytes,
}

/// Sorted segment list for one session.
pub struct StreamBuffer {
    segments: Vec<Segment>,
    /// Next expected sequence once something has been released;
    /// retransmissions of released data are dropped against this.
    expected: Option<u32>,
}

/// Linear scan below this size, binary search above.
const BINARY_SEARCH_THRESHOLD: usize = 10;

impl StreamBuffer {
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            expected: None,
        }
    }

    /// Prime the expected sequence from a SYN (payload starts at seq+1).
    pub fn start_at(&mut self, seq: u32) {
        self.expected = Some(seq);
        self.segments.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Insert one segment in sequence order. Duplicates and data already
    /// released are dropped.
    pub fn insert(&mut self, seq: u32, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        if let Some(expected) = self.expected {
            if seq_before(seq, expected) {
                return;
            }
        }

        let pos = if self.segments.len() > BINARY_SEARCH_THRESHOLD {
            self.segments
                .binary_search_by(|s| {
                    if s.seq == seq {
                        std::cmp::Ordering::Equal
                    } else if seq_before(s.seq, seq) {
                        std::cmp::Ordering::Less
                    } else {
                        std::cmp::Ordering::Greater
                    }
                })
                .map_or_else(|insert| Some(insert), |_| None)
        } else {
            let mut insert = self.segments.len();
            let mut duplicate = false;
            for (idx, segment) in self.segments.iter().enumerate() {
                if segment.seq == seq {
                    duplicate = true;
                    break;
                }
                if seq_before(seq, segment.seq) {
                    insert = idx;
                    break;
                }
            }
            (!duplicate).then_some(insert)
        };

        if let Some(pos) = pos {
            self.segments.insert(pos, Segment { seq, payload });
        }
    }

    /// Whether the chain from the head is gap-free, i.e. every segment
    /// ends exactly where the next one starts (and, once data has been
    /// released, the head continues at the expected sequence).
    pub fn is_complete(&self) -> bool {
        if self.segments.is_empty() {
            return false;
        }
        if let Some(expected) = self.expected {
            if self.segments[0].seq != expected {
                return false;
            }
        }
        self.segments.windows(2).all(|pair| {
            pair[0].seq.wrapping_add(pair[0].payload.len() as u32) == pair[1].seq
        })
    }

    /// Release the reassembled payload when complete, advancing the
    /// expected sequence past it.
    pub fn take_complete(&mut self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let mut out = BytesMut::with_capacity(
            self.segments.iter().map(|s| s.payload.len()).sum(),
        );
        for segment in &self.segments {
            out.extend_from_slice(&segment.payload);
        }
        let last = self.segments.last().expect("non-empty");
        self.expected = Some(last.seq.wrapping_add(last.payload.len() as u32));
        self.segments.clear();
        Some(out.freeze())
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(seq: u32, data: &str) -> (u32, Bytes) {
        (seq, Bytes::from(data.to_string()))
    }

    fn reassemble(segments: Vec<(u32, Bytes)>) -> Option<Vec<u8>> {
        let mut buffer = StreamBuffer::new();
        for (seq, payload) in segments {
            buffer.insert(seq, payload);
        }
        buffer.take_complete().map(|b| b.to_vec())
    }

    #[test]
    fn in_order_chain_completes() {
        let out = reassemble(vec![seg(100, "GET "), seg(104, "/ "), seg(106, "HTTP")]);
        assert_eq!(out.as_deref(), Some(b"GET / HTTP".as_ref()));
    }

    #[test]
    fn out_of_order_matches_in_order() {
        let out = reassemble(vec![seg(106, "HTTP"), seg(100, "GET "), seg(104, "/ ")]);
        assert_eq!(out.as_deref(), Some(b"GET / HTTP".as_ref()));
    }

    #[test]
    fn gap_blocks_until_missing_segment_arrives() {
        let mut buffer = StreamBuffer::new();
        buffer.insert(100, Bytes::from_static(b"GET "));
        buffer.insert(106, Bytes::from_static(b"HTTP"));
        assert!(!buffer.is_complete());
        assert!(buffer.take_complete().is_none());

        buffer.insert(104, Bytes::from_static(b"/ "));
        assert_eq!(
            buffer.take_complete().as_deref(),
            Some(b"GET / HTTP".as_ref())
        );
    }

    #[test]
    fn sequence_wraparound_orders_correctly() {
        // 4 bytes at the top of the space, continuing at 0 after wrap.
        let high = u32::MAX - 3;
        assert_eq!(high.wrapping_add(4), 0);

        // Arrival order puts the post-wrap segment first.
        let out = reassemble(vec![seg(0, "o world"), seg(high, "hell")]);
        assert_eq!(out.as_deref(), Some(b"hello world".as_ref()));

        let out = reassemble(vec![seg(high, "hell"), seg(0, "o world")]);
        assert_eq!(out.as_deref(), Some(b"hello world".as_ref()));
    }

    #[test]
    fn retransmissions_are_dropped() {
        let mut buffer = StreamBuffer::new();
        buffer.insert(100, Bytes::from_static(b"abc"));
        buffer.insert(100, Bytes::from_static(b"abc"));
        assert_eq!(buffer.take_complete().as_deref(), Some(b"abc".as_ref()));

        // Retransmission of released data is ignored.
        buffer.insert(100, Bytes::from_static(b"abc"));
        assert!(buffer.is_empty());
        buffer.insert(103, Bytes::from_static(b"def"));
        assert_eq!(buffer.take_complete().as_deref(), Some(b"def".as_ref()));
    }

    #[test]
    fn released_data_advances_the_expectation() {
        let mut buffer = StreamBuffer::new();
        buffer.start_at(500);
        buffer.insert(510, Bytes::from_static(b"later"));
        assert!(!buffer.is_complete());
        buffer.insert(500, Bytes::from_static(b"0123456789"));
        assert_eq!(
            buffer.take_complete().as_deref(),
            Some(b"0123456789later".as_ref())
        );
    }

    #[test]
    fn binary_search_insertion_path() {
        let mut buffer = StreamBuffer::new();
        // More than BINARY_SEARCH_THRESHOLD segments, inserted backwards.
        let chunks: Vec<(u32, String)> = (0..20u32)
            .map(|i| (100 + i * 2, format!("{:02}", i)))
            .collect();
        for (seq, data) in chunks.iter().rev() {
            buffer.insert(*seq, Bytes::from(data.clone()));
        }
        let expected: String = (0..20).map(|i| format!("{:02}", i)).collect();
        assert_eq!(
            buffer.take_complete().as_deref(),
            Some(expected.as_bytes())
        );
    }
}
