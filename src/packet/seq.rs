//! 16-bit RTP sequence number arithmetic
//!
//! Sequence numbers wrap at 65536, so ordering and distance need modular
//! arithmetic rather than plain comparison.

use crate::RtpSequenceNumber;

/// The sequence number following `seq`, wrapping at 65536
pub fn next_sequence(seq: RtpSequenceNumber) -> RtpSequenceNumber {
    seq.wrapping_add(1)
}

/// Forward distance from `from` to `to`, wrapping at 65536
///
/// `wrapped_distance(65534, 2) == 4`: the stream advanced over the
/// wraparound boundary by four packets.
pub fn wrapped_distance(from: RtpSequenceNumber, to: RtpSequenceNumber) -> u16 {
    to.wrapping_sub(from)
}

/// Whether `a` comes before `b` in wraparound order
///
/// Uses the serial-number rule: `a` precedes `b` when the forward
/// distance from `a` to `b` is less than half the sequence space.
pub fn sequence_precedes(a: RtpSequenceNumber, b: RtpSequenceNumber) -> bool {
    a != b && wrapped_distance(a, b) < 0x8000
}

/// Number of sequence steps taken to get from `last` to `current`,
/// computed in 32-bit arithmetic
///
/// An in-order packet yields 1; a gap of n lost packets yields n+1.
/// A duplicate of `last` yields 65536, which callers treat as an
/// unrecoverable discontinuity rather than a zero-length gap.
pub fn sequence_run_length(last: RtpSequenceNumber, current: RtpSequenceNumber) -> u32 {
    if current > last {
        (current - last) as u32
    } else {
        (65535 - last as u32) + current as u32 + 1
    }
}
