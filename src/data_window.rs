use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::{Duration, Instant};
use tracing::debug;

const HIST_SIZE: f32 = 4.0;
const RTT_GAIN: f32 = 1.0 / 8.0;
const DEVIATION_GAIN: f32 = 1.0 / 4.0;
/// number of initial samples that always feed the low-RTT average
const LOW_RTT_WARMUP_SAMPLES: u32 = 10;

/// One slot of a [DataWindow].
///
/// On the send side `sends`/`acks`/`sent_time`/`ack_time` drive retransmission and RTT
///  estimation; on the receive side `read`/`read_offset` track consumption by the
///  application.
pub struct DataRecord {
    pub payload: Bytes,
    pub sends: u32,
    pub acks: u32,
    pub read: bool,
    pub read_offset: usize,
    pub sent_time: Option<Instant>,
    pub ack_time: Option<Instant>,
}

impl DataRecord {
    fn new(payload: Bytes) -> DataRecord {
        DataRecord {
            payload,
            sends: 0,
            acks: 0,
            read: false,
            read_offset: 0,
            sent_time: None,
            ack_time: None,
        }
    }
}

/// A sliding window of data blocks indexed by logical sequence number, used both for data
///  being sent (tracking acks and round-trip times) and data being received (tracking
///  out-of-order arrival and consumption).
///
/// `window_start` only ever moves forward. All methods rely on external synchronization;
///  timestamps are passed in by the caller so tests control the clock.
pub struct DataWindow {
    window: FxHashMap<u64, DataRecord>,
    window_start: u64,
    window_size: usize,
    /// set/cleared incrementally when data is added/removed so readers need no scan
    readable_data: bool,
    srtt: f32,
    rttvar: f32,
    rto: f32,
    average_rtt: f32,
    average_low_rtt: f32,
    low_rtt_count: u32,
}

impl DataWindow {
    /// Panics if `size` is zero - that is a logic error, not a runtime condition.
    pub fn new(size: usize, start: u64) -> DataWindow {
        assert!(size >= 1, "window size must be > 0");
        DataWindow {
            window: FxHashMap::default(),
            window_start: start,
            window_size: size,
            readable_data: false,
            srtt: 0.0,
            rttvar: 0.0,
            rto: 0.0,
            average_rtt: 0.0,
            average_low_rtt: 0.0,
            low_rtt_count: 0,
        }
    }

    /// Adds a block to the window, returning the slot. A duplicate sequence number returns
    ///  the existing slot untouched. Panics on a sequence number below the window start -
    ///  callers must filter those out first.
    pub fn add(&mut self, seq: u64, payload: Bytes) -> &mut DataRecord {
        assert!(seq >= self.window_start,
                "block {} is below the window start {}", seq, self.window_start);

        if seq == self.window_start {
            self.readable_data = true;
        }

        if self.window.contains_key(&seq) {
            debug!("duplicate block seq={}, window start {}", seq, self.window_start);
        }
        self.window.entry(seq)
            .or_insert_with(|| DataRecord::new(payload))
    }

    pub fn get(&self, seq: u64) -> Option<&DataRecord> {
        self.window.get(&seq)
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut DataRecord> {
        self.window.get_mut(&seq)
    }

    pub fn window_start(&self) -> u64 {
        self.window_start
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Number of slots in use, not counting an already-read block at the window start.
    pub fn used_slots(&self) -> usize {
        let mut count = 0;
        for i in self.window_start..self.window_start + self.window_size as u64 + 3 {
            if let Some(rec) = self.window.get(&i) {
                if !rec.read || i != self.window_start {
                    count += 1;
                }
            }
        }
        count
    }

    /// Number of slots available. Blocks can run slightly past the nominal window, in
    ///  which case this saturates at zero.
    pub fn free_slots(&self) -> usize {
        self.window_size.saturating_sub(self.used_slots())
    }

    /// Removes the maximal acked prefix, advancing the window start over it. Each removed
    ///  payload is handed to `release`. Returns the number of blocks cleared.
    pub fn clear_acked_from_start(&mut self, mut release: impl FnMut(Bytes)) -> usize {
        let mut count = 0u64;
        for i in self.window_start..=self.window_start + self.window_size as u64 {
            let acked = self.window.get(&i).map(|rec| rec.acks > 0).unwrap_or(false);
            if !acked {
                break;
            }
            if let Some(rec) = self.window.remove(&i) {
                release(rec.payload);
                count += 1;
            }
        }
        self.window_start += count;
        count as usize
    }

    /// Number of acked blocks above the window start. A non-zero count hints that the
    ///  lowest block went missing, since it would have been cleared if it were acked.
    pub fn higher_acked_count(&self) -> usize {
        let mut count = 0;
        for i in self.window_start + 1..=self.window_start + self.window_size as u64 {
            if let Some(rec) = self.window.get(&i) {
                if rec.acks > 0 {
                    count += 1;
                }
            }
        }
        count
    }

    /// Whether the block at the window start has gone unacked for `multiple` times the
    ///  current RTO. See RFC 2988 for the underlying retransmission-timer model.
    pub fn appears_lost(&self, now: Instant, multiple: u32) -> bool {
        if self.rto < 1.0 {
            return false;
        }
        match self.window.get(&self.window_start) {
            Some(rec) if rec.acks < 1 => {
                match rec.sent_time {
                    Some(sent) => sent + self.rto_duration() * multiple < now,
                    None => false,
                }
            }
            _ => false,
        }
    }

    pub fn rto(&self) -> f32 {
        self.rto
    }

    pub fn rto_duration(&self) -> Duration {
        Duration::from_millis(self.rto as u64)
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rttvar(&self) -> f32 {
        self.rttvar
    }

    /// Rolling measure of the lowest round-trip times seen, in milliseconds.
    pub fn low_rtt(&self) -> f32 {
        self.average_low_rtt
    }

    /// Records an ack for a block, feeding the RTT estimators on a first ack of a block
    ///  that was sent exactly once (anything else makes the sample ambiguous).
    ///
    /// The estimator is the classic Jacobson/Karels one:
    ///  `delta = rtt - srtt; srtt += g*delta; rttvar += h*(|delta| - rttvar);
    ///   rto = srtt + 4*rttvar` with g = 1/8 and h = 1/4.
    pub fn ack(&mut self, seq: u64, now: Instant) {
        let Some(rec) = self.window.get_mut(&seq) else {
            return;
        };
        rec.acks += 1;
        rec.ack_time = Some(now);

        if rec.acks != 1 || rec.sends != 1 {
            return;
        }
        let Some(sent) = rec.sent_time else {
            return;
        };
        let rtt = (now - sent).as_secs_f32() * 1000.0;
        if rtt <= 0.0 {
            return;
        }

        let delta = rtt - self.srtt;
        if self.srtt <= 0.1 {
            self.srtt = delta;
        } else {
            self.srtt += RTT_GAIN * delta;
        }
        self.rttvar += DEVIATION_GAIN * (delta.abs() - self.rttvar);
        self.rto = self.srtt + 4.0 * self.rttvar + 0.5;

        if self.average_rtt == 0.0 {
            self.average_rtt = rtt;
        } else {
            self.average_rtt = (self.average_rtt * (HIST_SIZE - 1.0) + rtt) / HIST_SIZE;
        }

        // low-RTT average: every sample during warm-up, then only new lows
        if self.low_rtt_count < LOW_RTT_WARMUP_SAMPLES || rtt < self.average_low_rtt {
            if self.average_low_rtt == 0.0 {
                self.average_low_rtt = rtt;
            } else {
                self.average_low_rtt = (self.average_low_rtt * (HIST_SIZE - 1.0) + rtt) / HIST_SIZE;
            }
            self.low_rtt_count += 1;
        }
    }

    /// Marks every unacked block below the peer's advertised window start as acked - the
    ///  peer has moved past them, so the explicit acks were lost or are still in flight.
    ///  No RTT sample is taken; the ack time is synthesized from the current RTO.
    pub fn pseudo_ack_to(&mut self, peer_window_start: u64) {
        if peer_window_start <= self.window_start {
            return;
        }
        let rto = self.rto_duration();
        for i in self.window_start..peer_window_start {
            if let Some(rec) = self.window.get_mut(&i) {
                if rec.acks == 0 {
                    rec.acks += 1;
                    rec.ack_time = rec.sent_time.map(|sent| sent + rto);
                }
            }
        }
    }

    /// The unacked block that was sent the longest ago, if any. A block that was never
    ///  sent ranks older than any sent one; among those the lowest sequence number wins.
    pub fn oldest_unacked_seq(&self) -> Option<u64> {
        let mut oldest: Option<(u64, Option<Instant>)> = None;
        for i in self.window_start..=self.window_start + self.window_size as u64 {
            if let Some(rec) = self.window.get(&i) {
                if rec.acks != 0 {
                    continue;
                }
                let strictly_older = match (&oldest, rec.sent_time) {
                    (None, _) => true,
                    (Some((_, None)), _) => false,
                    (Some((_, Some(_))), None) => true,
                    (Some((_, Some(cur))), Some(sent)) => sent < *cur,
                };
                if strictly_older {
                    oldest = Some((i, rec.sent_time));
                }
            }
        }
        oldest.map(|(seq, _)| seq)
    }

    /// Whether at least one block can be read in order, i.e. no hole or unread gap sits
    ///  between the window start and the first unread block.
    pub fn has_readable_data(&self) -> bool {
        self.readable_data
    }

    /// The first unread block starting from the window start, stopping at the first hole.
    pub fn first_readable_mut(&mut self) -> Option<&mut DataRecord> {
        let mut found = None;
        for i in self.window_start..=self.window_start + self.window_size as u64 {
            match self.window.get(&i) {
                Some(rec) if rec.read => continue,
                Some(_) => {
                    found = Some(i);
                    break;
                }
                None => break,
            }
        }
        found.and_then(move |i| self.window.get_mut(&i))
    }

    /// Removes fully read blocks at the beginning of the window and advances over them,
    ///  re-deriving the readable flag from the block the scan stopped at. Returns the
    ///  window advancement.
    pub fn advance_over_read(&mut self) -> usize {
        let mut count = 0u64;
        for i in self.window_start..=self.window_start + self.window_size as u64 {
            match self.window.get(&i).map(|rec| rec.read) {
                Some(true) => {
                    self.window.remove(&i);
                    count += 1;
                }
                present => {
                    self.readable_data = present.is_some();
                    break;
                }
            }
        }
        self.window_start += count;
        count as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn filled(window: &mut DataWindow, seqs: &[u64]) {
        for &seq in seqs {
            window.add(seq, Bytes::from_static(b"x"));
        }
    }

    #[test]
    #[should_panic]
    fn test_add_below_window_start_panics() {
        let mut window = DataWindow::new(4, 10);
        window.add(9, Bytes::new());
    }

    #[test]
    fn test_duplicate_add_keeps_existing_record() {
        let mut window = DataWindow::new(4, 1);
        window.add(1, Bytes::from_static(b"first")).sends = 3;
        let rec = window.add(1, Bytes::from_static(b"second"));
        assert_eq!(3, rec.sends);
        assert_eq!(Bytes::from_static(b"first"), rec.payload);
    }

    #[test]
    fn test_used_and_free_slots() {
        let mut window = DataWindow::new(4, 1);
        assert_eq!(0, window.used_slots());
        assert_eq!(4, window.free_slots());

        filled(&mut window, &[1, 3]);
        assert_eq!(2, window.used_slots());
        assert_eq!(2, window.free_slots());

        // a read block at the window start does not occupy a slot
        window.get_mut(1).unwrap().read = true;
        assert_eq!(1, window.used_slots());
    }

    #[rstest]
    #[case::full_prefix(&[1, 2, 3], &[1, 2, 3], 3, 4)]
    #[case::hole_stops_clearing(&[1, 2, 4], &[1, 2, 4], 2, 3)]
    #[case::unacked_prefix(&[1, 2, 3], &[2, 3], 0, 1)]
    fn test_clear_acked_prefix(
        #[case] added: &[u64],
        #[case] acked: &[u64],
        #[case] expected_cleared: usize,
        #[case] expected_start: u64,
    ) {
        let mut window = DataWindow::new(4, 1);
        filled(&mut window, added);
        let now = Instant::now();
        for &seq in acked {
            window.get_mut(seq).unwrap().sent_time = Some(now);
            window.get_mut(seq).unwrap().sends = 1;
            window.ack(seq, now);
        }

        let mut released = 0;
        let cleared = window.clear_acked_from_start(|_| released += 1);
        assert_eq!(expected_cleared, cleared);
        assert_eq!(expected_cleared, released);
        assert_eq!(expected_start, window.window_start());
    }

    #[test]
    fn test_window_start_never_regresses() {
        let mut window = DataWindow::new(4, 1);
        filled(&mut window, &[1, 2]);
        let now = Instant::now();
        window.ack(1, now);
        window.ack(2, now);
        window.clear_acked_from_start(|_| {});
        assert_eq!(3, window.window_start());

        // a stale peer window start is ignored
        window.pseudo_ack_to(2);
        assert_eq!(3, window.window_start());
    }

    #[test]
    fn test_pseudo_ack_marks_blocks_below_peer_window_start() {
        let mut window = DataWindow::new(4, 1);
        filled(&mut window, &[1, 2, 3]);
        let now = Instant::now();
        for seq in 1..=3 {
            window.get_mut(seq).unwrap().sent_time = Some(now);
        }

        window.pseudo_ack_to(3);
        assert_eq!(1, window.get(1).unwrap().acks);
        assert_eq!(1, window.get(2).unwrap().acks);
        assert_eq!(0, window.get(3).unwrap().acks);
        assert_eq!(2, window.clear_acked_from_start(|_| {}));
    }

    #[test]
    fn test_higher_acked_count_excludes_window_start() {
        let mut window = DataWindow::new(4, 1);
        filled(&mut window, &[1, 2, 3]);
        let now = Instant::now();
        window.ack(2, now);
        window.ack(3, now);
        assert_eq!(2, window.higher_acked_count());
        // block 1 itself is unacked and not counted
        assert_eq!(Some(1), window.oldest_unacked_seq());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_rtt_estimation_and_rto_bound() {
        let mut window = DataWindow::new(8, 1);

        let samples = [100u64, 120, 80, 150, 95, 110];
        for (i, &sample) in samples.iter().enumerate() {
            let seq = i as u64 + 1;
            let rec = window.add(seq, Bytes::from_static(b"x"));
            rec.sends = 1;
            rec.sent_time = Some(Instant::now());

            tokio::time::advance(Duration::from_millis(sample)).await;
            window.ack(seq, Instant::now());
        }

        assert!(window.srtt() > 0.0);
        assert!(window.rttvar() > 0.0);
        // the RTO always leaves headroom above the smoothed estimate
        assert!(window.rto() >= window.srtt());
        assert!(window.low_rtt() > 0.0);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_rtt_sample_only_for_single_send_single_ack() {
        let mut window = DataWindow::new(4, 1);
        let rec = window.add(1, Bytes::from_static(b"x"));
        rec.sends = 2; // retransmitted - ack is ambiguous
        rec.sent_time = Some(Instant::now());

        tokio::time::advance(Duration::from_millis(100)).await;
        window.ack(1, Instant::now());
        assert_eq!(0.0, window.srtt());
        assert_eq!(0.0, window.rto());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_appears_lost() {
        let mut window = DataWindow::new(4, 1);

        // no RTT estimate yet, nothing can appear lost
        let rec = window.add(1, Bytes::from_static(b"x"));
        rec.sends = 1;
        rec.sent_time = Some(Instant::now());
        assert!(!window.appears_lost(Instant::now(), 1));

        // establish an RTT estimate with an acked block
        tokio::time::advance(Duration::from_millis(100)).await;
        window.ack(1, Instant::now());
        window.clear_acked_from_start(|_| {});

        let rec = window.add(2, Bytes::from_static(b"x"));
        rec.sends = 1;
        rec.sent_time = Some(Instant::now());
        assert!(!window.appears_lost(Instant::now(), 1));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(window.appears_lost(Instant::now(), 1));

        // acked blocks are never lost
        window.ack(2, Instant::now());
        assert!(!window.appears_lost(Instant::now(), 1));
    }

    #[test]
    fn test_readable_data_scenario() {
        let mut window = DataWindow::new(8, 1);

        // out of order arrival: 2 and 3 are buffered but not readable
        filled(&mut window, &[2, 3]);
        assert!(!window.has_readable_data());
        assert!(window.first_readable_mut().is_none());

        // the hole at 1 fills, everything up to 3 becomes readable
        filled(&mut window, &[1]);
        assert!(window.has_readable_data());

        for expected in 1..=3u64 {
            let rec = window.first_readable_mut().unwrap();
            assert_eq!(0, rec.read_offset);
            rec.read = true;
            let _ = expected;
        }
        assert!(window.first_readable_mut().is_none());

        assert_eq!(3, window.advance_over_read());
        assert_eq!(4, window.window_start());
        assert!(!window.has_readable_data());
    }

    #[test]
    fn test_advance_stops_at_unread_block() {
        let mut window = DataWindow::new(8, 1);
        filled(&mut window, &[1, 2, 3]);
        window.get_mut(1).unwrap().read = true;
        window.get_mut(3).unwrap().read = true;

        assert_eq!(1, window.advance_over_read());
        assert_eq!(2, window.window_start());
        // block 2 is present and unread, so there is still readable data
        assert!(window.has_readable_data());
    }

    #[test]
    fn test_oldest_unacked_prefers_earliest_send() {
        let mut window = DataWindow::new(4, 1);
        let base = Instant::now();
        filled(&mut window, &[1, 2, 3]);
        window.get_mut(1).unwrap().sent_time = Some(base + Duration::from_millis(50));
        window.get_mut(2).unwrap().sent_time = Some(base);
        window.get_mut(3).unwrap().sent_time = Some(base + Duration::from_millis(100));

        assert_eq!(Some(2), window.oldest_unacked_seq());
    }

    #[test]
    fn test_oldest_unacked_ranks_unsent_blocks_before_sent_ones() {
        let mut window = DataWindow::new(4, 1);
        filled(&mut window, &[1, 2, 3]);
        window.get_mut(2).unwrap().sent_time = Some(Instant::now());

        // 1 and 3 were never sent; the lowest of them outranks the sent block 2
        assert_eq!(Some(1), window.oldest_unacked_seq());
    }
}
