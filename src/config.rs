use anyhow::bail;
use std::time::Duration;

/// Tunables of the transport. The defaults are chosen for local networks and
///  tests; a deployment across real links will mostly want to revisit the RTO
///  bounds and the buffer capacity.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity in bytes of each of the two per-connection ring buffers. The
    ///  receive buffer's free space is what gets advertised as the window, so
    ///  this doubles as the receive-flow window.
    pub buffer_capacity: usize,

    /// Upper bound on the payload carried by a single segment. There is no
    ///  MSS negotiation - both sides simply apply their own bound, and the
    ///  value must leave room for the header inside a UDP datagram.
    pub max_segment_payload: usize,

    /// Starting retransmission timeout, used until the first round-trip
    ///  sample arrives.
    pub rto_initial: Duration,
    pub rto_min: Duration,
    pub rto_max: Duration,

    /// Number of state transitions retained per connection.
    pub history_cap: usize,

    /// Wall-clock budget for an active open to reach ESTABLISHED.
    pub handshake_timeout: Duration,

    /// Number of not-yet-accepted connections a listener will hold.
    pub accept_backlog: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            buffer_capacity: 4096,
            max_segment_payload: 1000,
            rto_initial: Duration::from_secs(1),
            rto_min: Duration::from_millis(200),
            rto_max: Duration::from_secs(60),
            history_cap: 100,
            handshake_timeout: Duration::from_secs(5),
            accept_backlog: 10,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.buffer_capacity == 0 {
            bail!("buffer capacity must be greater than zero");
        }
        if self.max_segment_payload == 0 || self.max_segment_payload > u16::MAX as usize {
            bail!(
                "max segment payload must be in 1..={}, was {}",
                u16::MAX,
                self.max_segment_payload
            );
        }
        if self.rto_min.is_zero() || self.rto_min > self.rto_max {
            bail!("RTO bounds must satisfy 0 < rto_min <= rto_max");
        }
        if self.accept_backlog == 0 {
            bail!("accept backlog must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[rstest]
    #[case::zero_capacity(Config { buffer_capacity: 0, ..Config::default() })]
    #[case::zero_payload(Config { max_segment_payload: 0, ..Config::default() })]
    #[case::oversized_payload(Config { max_segment_payload: 100_000, ..Config::default() })]
    #[case::zero_rto_min(Config { rto_min: Duration::ZERO, ..Config::default() })]
    #[case::inverted_rto_bounds(Config { rto_min: Duration::from_secs(90), ..Config::default() })]
    #[case::zero_backlog(Config { accept_backlog: 0, ..Config::default() })]
    fn test_validate_rejects(#[case] config: Config) {
        assert!(config.validate().is_err());
    }
}
