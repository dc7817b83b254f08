//! Generic NACK loss-run bundling
//!
//! A feedback entry covers up to 17 consecutive lost sequences: the PID
//! plus one bit per following sequence in the BLP mask. Loss runs longer
//! than that spill into further entries.

use crate::RtpSequenceNumber;

/// One (PID, BLP) pair of a generic NACK feedback message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackEntry {
    /// First lost sequence number of the group
    pub pid: RtpSequenceNumber,

    /// Bitmask of following losses; bit k set means `pid + k + 1` is
    /// also lost
    pub blp: u16,
}

impl NackEntry {
    /// All sequence numbers this entry requests, in wraparound order
    pub fn sequences(&self) -> impl Iterator<Item = RtpSequenceNumber> + '_ {
        let pid = self.pid;
        let blp = self.blp;
        std::iter::once(pid).chain(
            (0..16u16)
                .filter(move |shift| blp & (1 << shift) != 0)
                .map(move |shift| pid.wrapping_add(shift + 1)),
        )
    }
}

/// Bundle a run of `num_lost` sequences following `last_received` into
/// feedback entries
///
/// The first lost sequence is `last_received + 1`. Each entry consumes
/// the PID plus up to 16 mask bits before the next entry starts.
pub fn build_nack_entries(
    last_received: RtpSequenceNumber,
    num_lost: u32,
) -> Vec<NackEntry> {
    let mut entries = Vec::new();
    let mut remaining = num_lost;
    let mut consumed: u16 = 0;

    while remaining > 0 {
        consumed = consumed.wrapping_add(1);
        let pid = last_received.wrapping_add(consumed);
        remaining -= 1;

        let mut blp: u16 = 0;
        for shift in 0..16u16 {
            if remaining == 0 {
                break;
            }
            blp |= 1 << shift;
            consumed = consumed.wrapping_add(1);
            remaining -= 1;
        }

        entries.push(NackEntry { pid, blp });
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_loss() {
        let entries = build_nack_entries(99, 1);
        assert_eq!(entries, vec![NackEntry { pid: 100, blp: 0 }]);
    }

    #[test]
    fn test_full_entry() {
        // 17 losses fit exactly into one entry
        let entries = build_nack_entries(99, 17);
        assert_eq!(entries, vec![NackEntry { pid: 100, blp: 0xFFFF }]);
    }

    #[test]
    fn test_run_of_18_spills() {
        let entries = build_nack_entries(99, 18);
        assert_eq!(
            entries,
            vec![
                NackEntry { pid: 100, blp: 0xFFFF },
                NackEntry { pid: 117, blp: 0x0000 },
            ]
        );
    }

    #[test]
    fn test_run_of_20() {
        let entries = build_nack_entries(99, 20);
        assert_eq!(
            entries,
            vec![
                NackEntry { pid: 100, blp: 0xFFFF },
                NackEntry { pid: 117, blp: 0x0003 },
            ]
        );
    }

    #[test]
    fn test_partial_mask() {
        let entries = build_nack_entries(200, 5);
        assert_eq!(entries, vec![NackEntry { pid: 201, blp: 0x000F }]);
    }

    #[test]
    fn test_wraparound_pids() {
        let entries = build_nack_entries(65534, 3);
        assert_eq!(entries, vec![NackEntry { pid: 65535, blp: 0x0003 }]);

        let covered: Vec<u16> = entries[0].sequences().collect();
        assert_eq!(covered, vec![65535, 0, 1]);
    }

    #[test]
    fn test_sequences_cover_every_loss() {
        let entries = build_nack_entries(999, 20);
        let covered: Vec<u16> = entries
            .iter()
            .flat_map(|e| e.sequences())
            .collect();
        let expected: Vec<u16> = (1000..1020).collect();
        assert_eq!(covered, expected);
    }

    #[test]
    fn test_sequences_skip_clear_bits() {
        let entry = NackEntry { pid: 10, blp: 0b101 };
        let covered: Vec<u16> = entry.sequences().collect();
        assert_eq!(covered, vec![10, 11, 13]);
    }
}
