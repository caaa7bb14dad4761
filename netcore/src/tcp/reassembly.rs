//! Out-of-order segment queue.
//!
//! Received segments wait here, ordered by their first sequence number and free of overlap, until
//! the gap before them is filled. The queue never holds the same octet twice.
use std::collections::VecDeque;

use crate::wire::{TcpFlags, TcpRepr, TcpSeqNumber};

/// A received segment reduced to what the state machine needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Segment {
    pub seq: TcpSeqNumber,
    /// One past the last sequence number, counting SYN and FIN.
    pub end: TcpSeqNumber,
    pub ack: TcpSeqNumber,
    pub flags: TcpFlags,
    /// Urgent pointer relative to `seq`.
    pub urgent: u16,
    /// The offered window, already scaled.
    pub window: u32,
    pub data: Vec<u8>,
}

/// The reassembly queue of one connection.
#[derive(Clone, Debug, Default)]
pub(crate) struct Reassembly {
    segments: VecDeque<Segment>,
}

impl Segment {
    /// Extract a segment, scaling its window by `window_scale` unless it is a SYN.
    pub fn new(repr: &TcpRepr, payload: &[u8], window_scale: u8) -> Self {
        let window = if repr.flags.syn() {
            u32::from(repr.window_len)
        } else {
            u32::from(repr.window_len) << window_scale
        };

        Segment {
            seq: repr.seq_number,
            end: repr.seq_number + repr.sequence_len(),
            ack: repr.ack_number.unwrap_or_default(),
            flags: repr.flags,
            urgent: repr.urgent_at,
            window,
            data: payload.to_vec(),
        }
    }

    /// Whether the segment occupies no sequence space.
    pub fn is_empty(&self) -> bool {
        self.seq == self.end
    }

    /// Cut the segment down to the sequence range `[left, right)`.
    ///
    /// A segment entirely outside of the range loses its data and its SYN and FIN.
    pub fn trim(&mut self, left: TcpSeqNumber, right: TcpSeqNumber) {
        if self.end <= left || right <= self.seq {
            self.flags.set_syn(false);
            self.flags.set_fin(false);
            self.seq = self.end;
            self.data.clear();
            return;
        }

        if self.seq < left {
            let mut drop = left.distance_from(self.seq) as usize;
            let urgent = self.seq + usize::from(self.urgent);
            self.seq = left;

            if self.flags.syn() {
                self.flags.set_syn(false);
                drop -= 1;
            }

            if self.flags.urg() {
                if urgent < self.seq {
                    self.flags.set_urg(false);
                } else {
                    self.urgent = urgent.distance_from(left) as u16;
                }
            }

            let drop = drop.min(self.data.len());
            self.data.drain(..drop);
        }

        if self.end > right {
            let mut drop = self.end.distance_from(right) as usize;
            self.end = right;

            if self.flags.fin() {
                self.flags.set_fin(false);
                drop -= 1;
            }

            let keep = self.data.len().saturating_sub(drop);
            self.data.truncate(keep);
        }
    }
}

impl Reassembly {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Insert a segment, trimming it against its neighbours.
    ///
    /// Returns `true` if the segment did not simply extend an empty queue, which calls for an
    /// immediate acknowledgment.
    pub fn queue(&mut self, mut seg: Segment) -> bool {
        if self.segments.is_empty() {
            self.segments.push_back(seg);
            return false;
        }

        let pos = self.segments
            .iter()
            .position(|queued| seg.seq < queued.seq)
            .unwrap_or(self.segments.len());

        if pos > 0 {
            let prev_end = self.segments[pos - 1].end;
            if seg.seq < prev_end {
                if seg.end <= prev_end {
                    // Already entirely queued.
                    return false;
                }
                let end = seg.end;
                seg.trim(prev_end, end);
            }
        }

        // Remove successors the new segment covers, trim the new tail on partial overlap.
        while let Some(next) = self.segments.get(pos) {
            if next.end <= seg.end {
                self.segments.remove(pos);
                continue;
            }
            if next.seq < seg.end {
                if next.seq <= seg.seq {
                    return true;
                }
                let (start, cut) = (seg.seq, next.seq);
                seg.trim(start, cut);
            }
            break;
        }

        self.segments.insert(pos, seg);
        true
    }

    /// Take the head segment if it starts at or before `next`.
    ///
    /// Octets before `next` were delivered by an earlier copy and are cut off. Segments with
    /// nothing new are discarded on the way.
    pub fn pop_in_order(&mut self, next: TcpSeqNumber) -> Option<Segment> {
        loop {
            let head = self.segments.front()?;
            if head.seq > next {
                return None;
            }
            let mut seg = self.segments.pop_front()?;
            if seg.seq < next {
                let end = seg.end;
                seg.trim(next, end);
                if seg.is_empty() {
                    continue;
                }
            }
            return Some(seg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(seq: u32, data: &[u8]) -> Segment {
        let seq = TcpSeqNumber::from(seq);
        Segment {
            seq,
            end: seq + data.len(),
            ack: TcpSeqNumber::default(),
            flags: TcpFlags::ACK,
            urgent: 0,
            window: 0,
            data: data.to_vec(),
        }
    }

    fn drain(queue: &mut Reassembly, mut next: TcpSeqNumber) -> Vec<u8> {
        let mut stream = Vec::new();
        while let Some(seg) = queue.pop_in_order(next) {
            assert_eq!(seg.seq, next, "delivery must be contiguous");
            next = seg.end;
            stream.extend_from_slice(&seg.data);
        }
        stream
    }

    #[test]
    fn gap_is_filled_in_order() {
        let base = 0xffff_fff0;
        let mut queue = Reassembly::default();
        assert!(!queue.queue(segment(base, b"0123456789")));
        let mut stream = drain(&mut queue, TcpSeqNumber::from(base));
        assert_eq!(stream, b"0123456789");

        let next = TcpSeqNumber::from(base) + 10;
        assert!(queue.queue(segment(base.wrapping_add(20), b"klmnopqrst")) == false);
        assert!(drain(&mut queue, next).is_empty());
        assert!(queue.queue(segment(base.wrapping_add(10), b"abcdefghij")));
        stream.extend(drain(&mut queue, next));
        assert_eq!(stream, b"0123456789abcdefghijklmnopqrst");
        assert!(queue.is_empty());
    }

    #[test]
    fn duplicate_is_idempotent() {
        let mut once = Reassembly::default();
        let mut twice = Reassembly::default();
        let seg = segment(100, b"payload");
        let later = segment(120, b"later");

        once.queue(later.clone());
        once.queue(seg.clone());
        twice.queue(later.clone());
        twice.queue(seg.clone());
        twice.queue(seg.clone());
        twice.queue(later);

        assert_eq!(once.len(), twice.len());
        let start = TcpSeqNumber::from(100);
        assert_eq!(drain(&mut once, start), drain(&mut twice, start));

        // A copy of data already handed out yields nothing new.
        let mut queue = Reassembly::default();
        queue.queue(seg.clone());
        assert_eq!(drain(&mut queue, start), b"payload");
        queue.queue(seg);
        assert!(drain(&mut queue, start + 7).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn overlaps_are_trimmed() {
        let mut queue = Reassembly::default();
        queue.queue(segment(10, b"cdef"));
        // Overlaps the predecessor head and the successor tail.
        queue.queue(segment(0, b"abcdefghij"));
        assert_eq!(queue.len(), 1);
        queue.queue(segment(8, b"ijkl"));
        queue.queue(segment(20, b"uvwx"));
        // Partially overlaps the successor, its tail is cut.
        queue.queue(segment(18, b"stuv"));
        assert_eq!(queue.len(), 4);
        assert_eq!(drain(&mut queue, TcpSeqNumber::from(0)), b"abcdefghijkl");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn trim_drops_flags_outside() {
        let mut seg = segment(100, b"0123456789");
        seg.flags = TcpFlags::SYN | TcpFlags::FIN;
        seg.end = seg.end + 2;
        seg.trim(TcpSeqNumber::from(101), TcpSeqNumber::from(105));
        assert!(!seg.flags.syn());
        assert!(!seg.flags.fin());
        assert_eq!(seg.data, b"0123");
        assert_eq!(seg.end.distance_from(seg.seq), 4);

        let mut seg = segment(100, b"0123");
        seg.trim(TcpSeqNumber::from(200), TcpSeqNumber::from(300));
        assert!(seg.is_empty());
        assert!(seg.data.is_empty());
    }
}
