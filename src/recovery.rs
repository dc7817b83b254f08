//! Loss detection and recovery admission control
//!
//! Watches the live stream's sequence numbers, sizes each gap, and
//! decides whether the gap is worth requesting from the retransmission
//! server or large enough that recovery state should be abandoned.

use crate::packet::seq::sequence_run_length;
use crate::source::RECOVERY_BUFFER_CAPACITY;
use crate::RtpSequenceNumber;

/// Share of the recovery ring buffer a loss burst may claim
const ACCEPTABLE_LOSS_RATIO: f64 = 0.7;

/// Outcome of observing one live sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossDecision {
    /// The stream advanced by exactly one
    InOrder,

    /// A recoverable gap, request retransmission of `num_lost`
    /// sequences following `last_received`
    Request {
        last_received: RtpSequenceNumber,
        num_lost: u32,
    },

    /// The gap (plus anything already outstanding) exceeds what the
    /// recovery buffer could hold, all recovery state is abandoned
    Overflow { discarded: u32 },
}

/// Tracks live-stream continuity and bounds outstanding recovery
#[derive(Debug)]
pub struct RecoveryCoordinator {
    /// Last sequence number seen on the live stream
    last_sequence_received: Option<RtpSequenceNumber>,

    /// Sequences requested but not yet recovered or abandoned
    pending_loss: u32,

    /// Admission ceiling for `pending_loss` plus a new gap
    max_acceptable_loss: u32,
}

impl Default for RecoveryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryCoordinator {
    pub fn new() -> Self {
        Self {
            last_sequence_received: None,
            pending_loss: 0,
            max_acceptable_loss: (RECOVERY_BUFFER_CAPACITY as f64 * ACCEPTABLE_LOSS_RATIO) as u32,
        }
    }

    /// Sequences requested but not yet recovered
    pub fn loss_pending(&self) -> u32 {
        self.pending_loss
    }

    /// Observe the next live sequence number and classify the jump.
    ///
    /// The tracked position always advances to `sequence`, whatever the
    /// outcome. A repeated sequence number wraps the run length to a
    /// full cycle and therefore lands in the overflow branch.
    pub fn observe_sequence(&mut self, sequence: RtpSequenceNumber) -> LossDecision {
        let last = match self.last_sequence_received {
            Some(last) => last,
            None => {
                self.last_sequence_received = Some(sequence);
                return LossDecision::InOrder;
            }
        };
        self.last_sequence_received = Some(sequence);

        let run = sequence_run_length(last, sequence);
        if run <= 1 {
            return LossDecision::InOrder;
        }

        let num_lost = run - 1;
        if self.pending_loss + num_lost < self.max_acceptable_loss {
            self.pending_loss += num_lost;
            LossDecision::Request {
                last_received: last,
                num_lost,
            }
        } else {
            let discarded = self.pending_loss + num_lost;
            self.pending_loss = 0;
            LossDecision::Overflow { discarded }
        }
    }

    /// Advance the tracked position without any loss accounting, used
    /// while recovery is unavailable
    pub fn track_sequence(&mut self, sequence: RtpSequenceNumber) {
        self.last_sequence_received = Some(sequence);
    }

    /// Account one recovered sequence against the outstanding total
    pub fn note_recovered(&mut self) {
        self.pending_loss = self.pending_loss.saturating_sub(1);
    }

    /// Drop all outstanding recovery accounting
    pub fn reset(&mut self) {
        self.pending_loss = 0;
    }
}
