//! Adaptive retransmission timeout per RFC 6298: an exponentially weighted
//!  round-trip estimate plus four times its mean deviation, clamped to
//!  configured bounds. Samples must only be fed for segments that were
//!  transmitted exactly once (Karn's algorithm) - the connection enforces that
//!  by dropping a segment's send timestamp when it retransmits it.

use std::time::Duration;

const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;
const K: u32 = 4;

#[derive(Debug)]
pub struct RtoEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    rto_min: Duration,
    rto_max: Duration,
}

impl RtoEstimator {
    pub fn new(rto_initial: Duration, rto_min: Duration, rto_max: Duration) -> RtoEstimator {
        RtoEstimator {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: rto_initial.clamp(rto_min, rto_max),
            rto_min,
            rto_max,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Feed one fresh round-trip measurement.
    pub fn on_sample(&mut self, rtt: Duration) {
        let srtt = match self.srtt {
            None => {
                self.rttvar = rtt / 2;
                rtt
            }
            Some(srtt) => {
                let deviation = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = self.rttvar.mul_f64(1.0 - BETA) + deviation.mul_f64(BETA);
                srtt.mul_f64(1.0 - ALPHA) + rtt.mul_f64(ALPHA)
            }
        };
        self.srtt = Some(srtt);

        // clock granularity is effectively zero here, so max(G, K*rttvar)
        //  reduces to K*rttvar
        self.rto = (srtt + K * self.rttvar).clamp(self.rto_min, self.rto_max);
    }

    /// Exponential backoff after a retransmission round, capped at the upper
    ///  bound.
    pub fn on_backoff(&mut self) {
        self.rto = (self.rto * 2).min(self.rto_max);
    }
}
