//! Sequence numbers travel on the wire as 16 bits to keep headers small, but the protocol
//!  logic works with 64-bit logical sequence numbers that never wrap. This module recovers
//!  the logical number from the truncated wire value, assuming the sender's live range spans
//!  less than half the 16-bit space at any time (the window sizes in use are orders of
//!  magnitude below that).

const WIRE_SPACE: u64 = 1 << 16;

/// upper bound (inclusive) of the bottom quarter of the wire space
const LOW_QUARTER_MAX: u16 = 0x3FFF;
/// lower bound (inclusive) of the top quarter of the wire space
const HIGH_QUARTER_MIN: u16 = 0xC000;

/// Widens truncated 16-bit wire sequence numbers back to the 64-bit values they were
///  truncated from.
///
/// Two bases are tracked: `low_base` applies to wire values in the bottom quarter of the
///  16-bit space, `high_base` to everything else. A top-quarter value arms a pending
///  rollover; the first bottom-quarter value afterwards adopts `high_base + 0x1_0000` as
///  the new low base. Computing the new base from `high_base` rather than incrementing
///  `low_base` means a stale retransmission near the boundary cannot roll the epoch twice.
///  Mid-range values re-align `high_base` and disarm the rollover.
pub struct SequenceNumberExtender {
    low_base: u64,
    high_base: u64,
    rollover_pending: bool,
}

impl Default for SequenceNumberExtender {
    fn default() -> Self {
        SequenceNumberExtender {
            low_base: 0,
            high_base: 0,
            rollover_pending: false,
        }
    }
}

impl SequenceNumberExtender {
    /// Maps a wire value to its logical 64-bit sequence number, updating epoch state as a
    ///  side effect. Values may arrive out of order; the result is only meaningful while
    ///  the caller keeps the live range narrower than half the wire space.
    pub fn extend(&mut self, wire: u16) -> u64 {
        if wire <= LOW_QUARTER_MAX {
            if self.rollover_pending {
                self.low_base = self.high_base + WIRE_SPACE;
                self.rollover_pending = false;
            }
            self.low_base + wire as u64
        } else if wire >= HIGH_QUARTER_MIN {
            self.rollover_pending = true;
            self.high_base + wire as u64
        } else {
            self.high_base = self.low_base;
            self.rollover_pending = false;
            self.low_base + wire as u64
        }
    }
}
