use tracing::trace;

use crate::data_window::DataWindow;

/// don't adjust sleep skipping until the window has moved past its warm-up
const MIN_START_WINDOW: u64 = 40;
/// receiver window space at or below this is considered low
const LOW_WINDOW_SPACE: i64 = 4;
/// cap on how many writes may go out back to back
const MAX_SKIP_LIMIT: i32 = 14;
/// failure rate below which throughput can be pushed further
const LOW_FAILURE_RATE: f32 = 3.0 / 100.0;
/// failure rate above which a resend timeout triggers backing off
const HIGH_FAILURE_RATE: f32 = 4.0 / 100.0;

/// Calculates and controls the timing of data writes.
///
/// The regulator aims for a steady state where neither side's window runs too far ahead:
///  the nominal inter-write sleep is a fraction of the round-trip time scaled by how full
///  the send window is, and an adaptive skip limit lets several writes go out back to back
///  while the measured RTT stays near its observed floor. Approaching a full receiver
///  window scales the sleep up to a whole retransmission timeout.
pub struct WriteRegulator {
    skip_count: i32,
    skip_limit: i32,
    limit_hit: bool,
    limit_count: u32,
    limit_reset: u32,
    zero_count: u32,
    tracker: FailureTracker,
}

impl WriteRegulator {
    pub fn new() -> WriteRegulator {
        WriteRegulator {
            skip_count: 0,
            skip_limit: 2,
            limit_hit: false,
            limit_count: 0,
            limit_reset: 200,
            zero_count: 0,
            tracker: FailureTracker::new(),
        }
    }

    /// Milliseconds to sleep before the next data write.
    pub fn sleep_time(&mut self, send_window: &DataWindow, receiver_window_space: i64) -> u64 {
        let used_slots = send_window.used_slots() as i64;
        let window_size = send_window.window_size() as i64;
        let window_start = send_window.window_start();

        let rto = send_window.rto() as i64;
        let srtt = send_window.srtt();
        let isrtt = srtt as i64;

        let real_rtt = isrtt;
        let low_rtt = send_window.low_rtt() as i64;
        let rtt = isrtt + 1;
        let base_wait = real_rtt.min(2000) / 4;

        let mut sleep_time = (used_slots + 1) * base_wait;
        let mut min_time = 0i64;
        let mut getting_slow = false;

        // spread sub-window sleeps fairly instead of always rounding down
        if sleep_time < window_size {
            let pct = sleep_time as f64 / window_size as f64;
            sleep_time = if rand::random::<f64>() < pct { 1 } else { 0 };
        } else {
            sleep_time /= window_size;
        }

        // scale up towards a full timeout as the room for writing approaches zero
        if receiver_window_space <= LOW_WINDOW_SPACE {
            let multiple = LOW_WINDOW_SPACE / receiver_window_space.max(1);
            sleep_time = (isrtt * multiple) / (LOW_WINDOW_SPACE + 1);
            if receiver_window_space <= LOW_WINDOW_SPACE / 2 {
                sleep_time = rto;
            }
            min_time = sleep_time;
        }

        trace!("sleep_time={} used={} rws={} rtt={} rto={} srtt={} skip_limit={} failure_rate={:.3}",
               sleep_time, used_slots, receiver_window_space, rtt, rto, srtt,
               self.skip_limit, self.tracker.failure_rate());

        if self.skip_limit < 1 {
            self.skip_limit = 1;
        }

        // target RTT ceiling given the apparent capacity: kick in early when the smoothed
        // RTT already sits well above its floor, late otherwise
        let max_rtt = if isrtt > (5 * low_rtt) / 2 {
            (low_rtt * 7) / 5
        } else {
            (low_rtt * 25) / 5
        };

        // at least two round trips per full window time
        let window_delay = (((base_wait * window_size) / self.skip_limit as i64) * 2) / 4;

        if rtt != 0 && base_wait != 0
            && receiver_window_space <= LOW_WINDOW_SPACE
            && (window_delay < rtt || rtt > max_rtt) {
            trace!("rtt elevated: window_start={} base_wait={} max_rtt={} window_delay={}",
                   window_start, base_wait, max_rtt, window_delay);

            if rtt > max_rtt || real_rtt > max_rtt {
                min_time = low_rtt / 4;
                self.skip_limit -= 1;
                getting_slow = true;
            }
        }

        if self.skip_limit < 1 {
            self.skip_limit = 1;
        }
        self.skip_count = (self.skip_count + 1) % self.skip_limit;

        if !self.limit_hit {
            // occasionally probe a higher skip limit to see if the link can handle it
            if self.skip_limit < MAX_SKIP_LIMIT
                && window_start % window_size as u64 == 0
                && !getting_slow
                && window_start > MIN_START_WINDOW
                && self.tracker.failure_rate() < LOW_FAILURE_RATE {
                self.skip_limit += 1;
                trace!("raising skip limit to {}", self.skip_limit);
            }
        } else {
            // wait before getting aggressive again
            self.limit_count += 1;
            if self.limit_count >= self.limit_reset {
                self.limit_count = 0;
                self.limit_hit = false;
            }
        }

        // skip the sleep entirely if the connection is keeping up
        if self.skip_count != 0 && rtt < max_rtt && receiver_window_space > LOW_WINDOW_SPACE {
            sleep_time = 0;
        }

        sleep_time.max(min_time).max(0) as u64
    }

    /// A resend became necessary: back off if the recent failure rate is too high. This is
    ///  rate limited so one clump of losses halves the skip limit only once.
    pub fn on_resend_timeout(&mut self) {
        if (!self.limit_hit || self.limit_count >= 10)
            && self.tracker.failure_rate() > HIGH_FAILURE_RATE {
            self.limit_hit = true;
            self.skip_limit /= 2;
            self.limit_count = 0;
            trace!("resend timeout, skip limit halved to {} at failure rate {:.3}",
                   self.skip_limit, self.tracker.failure_rate());
            self.tracker.clear_old_failures();
        }
    }

    /// The receiver's window hit zero.
    pub fn on_zero_window(&mut self) {
        self.zero_count += 1;
        if (!self.limit_hit || self.limit_count >= 10) && self.zero_count > 4 {
            self.zero_count = 0;
            trace!("repeated zero window, skip limit {}", self.skip_limit);
        }
    }

    pub fn on_send_success(&mut self) {
        self.tracker.add_success();
    }

    pub fn on_send_failure(&mut self) {
        self.tracker.add_failure();
    }

    #[cfg(test)]
    fn skip_limit(&self) -> i32 {
        self.skip_limit
    }
}

/// Rolling success/failure history of the last hundred sends.
struct FailureTracker {
    data: [u8; FailureTracker::HISTORY_SIZE],
    rollover: bool,
    index: usize,
}

impl FailureTracker {
    const HISTORY_SIZE: usize = 100;

    fn new() -> FailureTracker {
        FailureTracker {
            data: [0; FailureTracker::HISTORY_SIZE],
            rollover: false,
            index: 0,
        }
    }

    fn add_success(&mut self) {
        self.add(1);
    }

    fn add_failure(&mut self) {
        self.add(0);
    }

    fn add(&mut self, value: u8) {
        self.data[self.index] = value;
        self.index += 1;
        if self.index >= FailureTracker::HISTORY_SIZE - 1 {
            self.index = 0;
            self.rollover = true;
        }
    }

    /// Overwrite half the history with successes so a clump of failures clears quickly.
    fn clear_old_failures(&mut self) {
        for _ in 0..FailureTracker::HISTORY_SIZE / 2 {
            self.add_success();
        }
    }

    fn failure_rate(&self) -> f32 {
        let samples = if self.rollover { FailureTracker::HISTORY_SIZE } else { self.index };
        if samples == 0 {
            return 0.0;
        }
        let successes: u32 = self.data[..samples].iter().map(|&v| v as u32).sum();
        1.0 - successes as f32 / samples as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::time::{Duration, Instant};

    fn send_window_with_rtt(rtt_millis: u64) -> DataWindow {
        let mut window = DataWindow::new(20, 1);
        let base = Instant::now();
        let rec = window.add(1, Bytes::from_static(b"x"));
        rec.sends = 1;
        rec.sent_time = Some(base);
        window.ack(1, base + Duration::from_millis(rtt_millis));
        window.clear_acked_from_start(|_| {});
        window
    }

    #[test]
    fn test_failure_rate() {
        let mut tracker = FailureTracker::new();
        assert_eq!(0.0, tracker.failure_rate());

        for _ in 0..30 {
            tracker.add_success();
        }
        assert_eq!(0.0, tracker.failure_rate());

        for _ in 0..10 {
            tracker.add_failure();
        }
        let rate = tracker.failure_rate();
        assert!(rate > 0.2 && rate < 0.3);

        // padding the history with successes dilutes a clump of failures
        tracker.clear_old_failures();
        assert!(tracker.failure_rate() < rate);
    }

    #[test]
    fn test_zero_window_forces_full_timeout_sleep() {
        let window = send_window_with_rtt(200);
        let mut regulator = WriteRegulator::new();

        let sleep = regulator.sleep_time(&window, 0);
        // a closed receiver window means waiting a full RTO
        assert_eq!(window.rto() as u64, sleep);
    }

    #[test]
    fn test_open_window_allows_skipped_sleeps() {
        let window = send_window_with_rtt(200);
        let mut regulator = WriteRegulator::new();

        // with an empty send window and plenty of receiver space, the skip limit lets
        // every other write go out without sleeping
        let mut zero_sleeps = 0;
        for _ in 0..10 {
            if regulator.sleep_time(&window, 20) == 0 {
                zero_sleeps += 1;
            }
        }
        assert!(zero_sleeps >= 5);
    }

    #[test]
    fn test_resend_timeout_halves_skip_limit_only_on_high_failure_rate() {
        let mut regulator = WriteRegulator::new();
        for _ in 0..99 {
            regulator.on_send_success();
        }

        // clean history: no backoff
        regulator.on_resend_timeout();
        assert_eq!(2, regulator.skip_limit());

        for _ in 0..10 {
            regulator.on_send_failure();
        }
        regulator.on_resend_timeout();
        assert_eq!(1, regulator.skip_limit());

        // rate limited: the next timeout in the same clump does not halve again
        for _ in 0..10 {
            regulator.on_send_failure();
        }
        regulator.on_resend_timeout();
        assert_eq!(1, regulator.skip_limit());
    }

    #[test]
    fn test_sleep_time_never_negative_window_space() {
        let window = send_window_with_rtt(100);
        let mut regulator = WriteRegulator::new();

        // the adjusted receiver window space can run negative; the sleep must stay sane
        let sleep = regulator.sleep_time(&window, -3);
        assert!(sleep >= window.rto() as u64);
    }
}
