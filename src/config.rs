use std::time::Duration;

use anyhow::bail;

pub struct RudpConfig {
    /// Size of a single data chunk, i.e. the payload of one DATA message. Sized well below
    ///  typical path MTUs so a DATA message plus the surrounding transport's framing never
    ///  fragments.
    pub data_chunk_size: usize,

    /// Upper bound on the payload of an *inbound* DATA message. A peer sending more than
    ///  this is misbehaving and gets its connection closed.
    pub max_data_size: usize,

    /// Number of slots in both the send and the receive window.
    pub data_window_size: usize,

    /// How far beyond the advertised receive window an inbound sequence number may run
    ///  before the message is dropped. A small slack is accepted because window
    ///  advertisements are always slightly stale in flight.
    pub receive_write_ahead_slack: u64,

    /// Maximum number of times a data block is retransmitted before the connection is
    ///  closed as undeliverable.
    pub max_send_retries: u32,

    /// Interval between SYN retransmissions while connecting.
    pub syn_interval: Duration,

    /// Total time to keep trying to connect before giving up.
    pub max_connect_wait: Duration,

    /// An established connection over which no DATA or ACK has moved in either direction
    ///  for this long is closed.
    pub max_keepalive_lifetime: Duration,

    /// A connection that has received *nothing at all* for this long is considered dead.
    pub max_silent_lifetime: Duration,

    /// Idle time after which a KEEPALIVE is sent.
    pub keepalive_interval: Duration,

    /// Retransmission timeout used before any RTT measurement exists.
    pub default_rto: Duration,

    /// Whether the receive side may skip sending some ACKs when the inbound message rate
    ///  is steady.
    pub skip_acks: bool,

    /// Maximum number of consecutive ACKs that may be skipped.
    pub max_skipped_acks: u32,

    /// ACKs are only skipped while the current arrival rate exceeds the historic average
    ///  divided by this factor; any rate drop forces an ACK.
    pub skip_deviation: f32,

    /// Length of one arrival-rate measurement period.
    pub skip_period: Duration,

    /// Number of measurement periods kept for the arrival-rate average.
    pub skip_history: usize,
}

impl Default for RudpConfig {
    fn default() -> RudpConfig {
        RudpConfig {
            data_chunk_size: 512,
            max_data_size: 4096,
            data_window_size: 20,
            receive_write_ahead_slack: 5,
            max_send_retries: 8,
            syn_interval: Duration::from_millis(400),
            max_connect_wait: Duration::from_secs(20),
            max_keepalive_lifetime: Duration::from_secs(60),
            max_silent_lifetime: Duration::from_secs(20),
            keepalive_interval: Duration::from_millis(2500),
            default_rto: Duration::from_millis(400),
            skip_acks: true,
            max_skipped_acks: 5,
            skip_deviation: 1.3,
            skip_period: Duration::from_millis(500),
            skip_history: 10,
        }
    }
}

impl RudpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.data_window_size < 1 {
            bail!("data window must have at least one slot");
        }
        if self.data_chunk_size == 0 || self.data_chunk_size > self.max_data_size {
            bail!("data chunk size must be between 1 and the max data size");
        }
        if self.max_send_retries == 0 {
            bail!("at least one send retry is required");
        }
        if self.skip_history < 1 {
            bail!("ack skipping needs at least one history period");
        }
        if self.skip_deviation <= 1.0 {
            bail!("skip deviation must be greater than 1");
        }
        if self.syn_interval.is_zero() || self.keepalive_interval.is_zero() {
            bail!("timer intervals must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RudpConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_window() {
        let config = RudpConfig {
            data_window_size: 0,
            ..RudpConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_chunk_bigger_than_max() {
        let config = RudpConfig {
            data_chunk_size: 8192,
            max_data_size: 4096,
            ..RudpConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_degenerate_skip_deviation() {
        let config = RudpConfig {
            skip_deviation: 1.0,
            ..RudpConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
