//! Stream payload buffering
//!
//! Each channel source owns one fixed-capacity segment ring buffer that
//! absorbs arrival jitter between the receive task and the consumer.

mod segment;

pub use segment::{clock_millis, SegmentRingBuffer};
