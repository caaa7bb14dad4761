//! Byte queues between the token front-end and the protocol engine.
use std::collections::VecDeque;

/// Below this many free octets, queued send tokens are not admitted.
pub const SOCK_BUFF_LOW_WATER: usize = 2 * 1024;

/// Default capacity of each direction.
pub const DEFAULT_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// The outbound byte queue.
///
/// Octets stay in the queue until the peer acknowledged them. The engine reads them in place for
/// transmission and retransmission and only [`trim`]s after an acknowledgement.
///
/// [`trim`]: #method.trim
#[derive(Debug, Clone)]
pub struct SendBuffer {
    data: VecDeque<u8>,
    high_water: usize,
    low_water: usize,
}

/// One received chunk with its count of leading urgent octets.
#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    /// Offset of the first unread octet.
    read: usize,
    /// Urgent octets remaining at the start of the unread part.
    urgent: usize,
}

/// The inbound byte queue.
///
/// Chunks keep the urgent tag with which they were appended so that a single read never mixes
/// urgent and normal data.
#[derive(Debug, Clone)]
pub struct RecvBuffer {
    entries: VecDeque<Entry>,
    size: usize,
    high_water: usize,
    low_water: usize,
}

impl SendBuffer {
    pub fn new(high_water: usize) -> Self {
        SendBuffer {
            data: VecDeque::new(),
            high_water,
            low_water: SOCK_BUFF_LOW_WATER,
        }
    }

    /// Octets currently queued, sent or not.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn set_high_water(&mut self, high_water: usize) {
        self.high_water = high_water;
    }

    pub fn low_water(&self) -> usize {
        self.low_water
    }

    /// Free space before reaching the high water mark, saturating at zero.
    pub fn free_space(&self) -> usize {
        self.high_water.saturating_sub(self.data.len())
    }

    /// Append octets to the tail.
    pub fn append(&mut self, data: &[u8]) {
        self.data.extend(data.iter().cloned());
    }

    /// Copy queued octets starting at `offset` without consuming them.
    ///
    /// Returns the number of octets copied, less than the buffer length if the queue ends first.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let available = self.data.len().saturating_sub(offset);
        let len = available.min(buf.len());
        for (dst, src) in buf[..len].iter_mut().zip(self.data.range(offset..offset + len)) {
            *dst = *src;
        }
        len
    }

    /// Drop octets past `len` from the tail, undoing an append that could not be sent.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Drop acknowledged octets from the head.
    pub fn trim(&mut self, count: usize) {
        let count = count.min(self.data.len());
        self.data.drain(..count);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl RecvBuffer {
    pub fn new(high_water: usize) -> Self {
        RecvBuffer {
            entries: VecDeque::new(),
            size: 0,
            high_water,
            low_water: 0,
        }
    }

    /// Octets not yet read by the application.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn set_high_water(&mut self, high_water: usize) {
        self.high_water = high_water;
    }

    pub fn low_water(&self) -> usize {
        self.low_water
    }

    /// Free space before reaching the high water mark, saturating at zero.
    pub fn free_space(&self) -> usize {
        self.high_water.saturating_sub(self.size)
    }

    /// Append one received chunk whose first `urgent` octets are out-of-band.
    pub fn append(&mut self, data: Vec<u8>, urgent: usize) {
        if data.is_empty() {
            return;
        }
        self.size += data.len();
        let urgent = urgent.min(data.len());
        self.entries.push_back(Entry { data, read: 0, urgent });
    }

    /// The length and urgency of the longest run deliverable in one read of at most `capacity`.
    ///
    /// A run starts at the head and is either only urgent octets or only normal octets. Normal
    /// data ends at the next chunk that starts with urgent octets.
    pub fn deliverable(&self, capacity: usize) -> (usize, bool) {
        let mut entries = self.entries.iter();
        let head = match entries.next() {
            Some(head) => head,
            None => return (0, false),
        };

        if head.urgent > 0 {
            let mut run = head.urgent;
            // A fully urgent chunk may continue into an urgent successor.
            if head.urgent == head.data.len() - head.read {
                for entry in entries {
                    if entry.urgent == 0 || run >= capacity {
                        break;
                    }
                    run += entry.urgent;
                    if entry.urgent < entry.data.len() {
                        break;
                    }
                }
            }
            return (run.min(capacity), true);
        }

        let mut run = head.data.len() - head.read;
        for entry in entries {
            if entry.urgent > 0 || run >= capacity {
                break;
            }
            run += entry.data.len();
        }
        (run.min(capacity), false)
    }

    /// Consume exactly `count` octets from the head into `out`.
    pub fn take(&mut self, mut count: usize, out: &mut Vec<u8>) {
        count = count.min(self.size);
        self.size -= count;
        while count > 0 {
            let head = match self.entries.front_mut() {
                Some(head) => head,
                None => break,
            };
            let available = head.data.len() - head.read;
            let step = available.min(count);
            out.extend_from_slice(&head.data[head.read..head.read + step]);
            head.read += step;
            head.urgent = head.urgent.saturating_sub(step);
            count -= step;
            if head.read == head.data.len() {
                self.entries.pop_front();
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.size = 0;
    }
}
