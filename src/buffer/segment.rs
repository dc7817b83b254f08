//! Fixed-capacity segment ring buffer
//!
//! Slots hold one RTP payload each, stamped with sequence number and a
//! millisecond clock reading. A slot becomes writable again only once the
//! consumer has drained it completely, so a full ring rejects writes
//! instead of overwriting undelivered media.

use once_cell::sync::Lazy;
use std::time::Instant;

use crate::error::Error;
use crate::{Result, RtpSequenceNumber};

// Process-wide epoch for segment timestamps; monotonic so recovery
// request ages and deposit times compare safely
static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since the process clock epoch
pub fn clock_millis() -> u64 {
    CLOCK_EPOCH.elapsed().as_millis() as u64
}

/// Circular buffer of timestamped byte segments
///
/// `head` is the next slot to drain, `tail` the next to fill. Both wrap
/// at the capacity. A slot with a non-zero byte count is occupied.
pub struct SegmentRingBuffer {
    /// Backing storage, `capacity` segments of `segment_size` bytes
    data: Vec<u8>,

    /// Sequence number per slot
    sequences: Vec<RtpSequenceNumber>,

    /// Deposit or request timestamp per slot, in clock millis
    timestamps: Vec<u64>,

    /// Undrained bytes per slot; zero means the slot is free
    byte_counts: Vec<usize>,

    /// Read offset within the head slot for partial drains
    offsets: Vec<usize>,

    /// Next slot to drain
    head: usize,

    /// Next slot to fill
    tail: usize,

    /// Segment capacity
    capacity: usize,

    /// Bytes per segment
    segment_size: usize,

    /// Undrained bytes across all slots
    total_bytes: usize,
}

impl SegmentRingBuffer {
    /// Create a ring of `capacity` segments of `segment_size` bytes each
    pub fn new(capacity: usize, segment_size: usize) -> Self {
        Self {
            data: vec![0; capacity * segment_size],
            sequences: vec![0; capacity],
            timestamps: vec![0; capacity],
            byte_counts: vec![0; capacity],
            offsets: vec![0; capacity],
            head: 0,
            tail: 0,
            capacity,
            segment_size,
            total_bytes: 0,
        }
    }

    /// Deposit a payload stamped with the current clock reading
    pub fn put(&mut self, sequence: RtpSequenceNumber, payload: &[u8]) -> Result<usize> {
        self.put_at(sequence, clock_millis(), payload)
    }

    /// Deposit a payload with an explicit timestamp
    ///
    /// Fails when the tail slot still holds undrained bytes.
    pub fn put_at(
        &mut self,
        sequence: RtpSequenceNumber,
        timestamp: u64,
        payload: &[u8],
    ) -> Result<usize> {
        if payload.is_empty() {
            return Ok(0);
        }
        if payload.len() > self.segment_size {
            return Err(Error::InvalidParameter(format!(
                "payload of {} bytes exceeds segment size {}",
                payload.len(),
                self.segment_size
            )));
        }
        if self.byte_counts[self.tail] != 0 {
            return Err(Error::BufferFull(format!(
                "segment {} not yet drained",
                self.tail
            )));
        }

        let start = self.tail * self.segment_size;
        self.data[start..start + payload.len()].copy_from_slice(payload);
        self.sequences[self.tail] = sequence;
        self.timestamps[self.tail] = timestamp;
        self.byte_counts[self.tail] = payload.len();
        self.offsets[self.tail] = 0;
        self.tail = (self.tail + 1) % self.capacity;
        self.total_bytes += payload.len();
        Ok(payload.len())
    }

    /// Drain bytes from the head segment into `out`
    ///
    /// Reads from one segment per call, so a short `out` leaves the rest
    /// of the segment for the next call. Returns 0 when the ring is
    /// empty. The head advances once its segment is fully drained.
    pub fn get(&mut self, out: &mut [u8]) -> usize {
        let available = self.byte_counts[self.head];
        if available == 0 || out.is_empty() {
            return 0;
        }

        let to_copy = available.min(out.len());
        let start = self.head * self.segment_size + self.offsets[self.head];
        out[..to_copy].copy_from_slice(&self.data[start..start + to_copy]);

        self.byte_counts[self.head] -= to_copy;
        self.offsets[self.head] += to_copy;
        self.total_bytes -= to_copy;

        if self.byte_counts[self.head] == 0 {
            self.sequences[self.head] = 0;
            self.timestamps[self.head] = 0;
            self.offsets[self.head] = 0;
            self.head = (self.head + 1) % self.capacity;
        }

        to_copy
    }

    /// Whether any slot holds undrained bytes
    pub fn has_data_available(&self) -> bool {
        self.total_bytes > 0
    }

    /// Sequence number of the head segment, if one is buffered
    pub fn head_sequence(&self) -> Option<RtpSequenceNumber> {
        if self.byte_counts[self.head] > 0 {
            Some(self.sequences[self.head])
        } else {
            None
        }
    }

    /// Timestamp of the head segment, if one is buffered
    pub fn head_timestamp(&self) -> Option<u64> {
        if self.byte_counts[self.head] > 0 {
            Some(self.timestamps[self.head])
        } else {
            None
        }
    }

    /// Undrained bytes across the whole ring
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Segment capacity of the ring
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clear every slot and rewind the indices
    pub fn reset(&mut self) {
        self.sequences.fill(0);
        self.timestamps.fill(0);
        self.byte_counts.fill(0);
        self.offsets.fill(0);
        self.head = 0;
        self.tail = 0;
        self.total_bytes = 0;
    }
}
