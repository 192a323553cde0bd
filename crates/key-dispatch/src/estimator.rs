//! Per-backend RTT smoothing and adaptive request timeout.
//!
//! Follows the TCP SRTT/RTTVAR recurrence (RFC 6298 with Linux's mdev/mdev_max
//! refinement): gain 1/8 on the smoothed RTT, 1/4 on the mean deviation — or
//! 1/32 when the sample undershoots `srtt - mdev`, so a lucky fast reply does
//! not collapse the deviation estimate. `rto = srtt + 4·rttvar`.
//!
//! The estimator also projects latency into a selection weight:
//! `reqs_per_sec = 1_000_000 / srtt`, so the weighted sampler prefers faster
//! backends without any explicit priority queue. A timeout divides the
//! projection by 4 and leaves the timing fields alone — a lost reply says
//! nothing about RTT.

/// Initial request timeout: 200 ms.
const INITIAL_RTO_US: u64 = 200_000;

/// Weight before the first measurement. Large enough that every new backend
/// is guaranteed to be tried, then replaced by the measured projection.
const INITIAL_REQS_PER_SEC: u64 = 100_000;

/// Floor for `mdev_max` on the first sample: 200 ms / 4.
const MDEV_MAX_FLOOR_US: u64 = 50_000;

/// Smoothed RTT state for one backend. All time fields are in microseconds.
#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    /// Smoothed RTT; 0 means no measurement yet.
    srtt: u64,
    /// Mean deviation of samples around `srtt`.
    mdev: u64,
    /// Running maximum of `mdev`.
    mdev_max: u64,
    /// Variance term feeding the RTO; ratcheted up by `mdev_max`.
    rttvar: u64,
    rto: u64,
    reqs_per_sec: u64,
}

impl SpeedEstimator {
    pub fn new() -> Self {
        Self {
            srtt: 0,
            mdev: 0,
            mdev_max: 0,
            rttvar: 0,
            rto: INITIAL_RTO_US,
            reqs_per_sec: INITIAL_REQS_PER_SEC,
        }
    }

    /// Fold in a measured round-trip time of `rtt_us` microseconds.
    pub fn update_rtt(&mut self, rtt_us: u64) {
        if self.srtt == 0 {
            let m = rtt_us.max(1);
            self.srtt = m;
            self.mdev = m / 2;
            self.mdev_max = (m / 2).max(MDEV_MAX_FLOOR_US);
            self.rttvar = self.mdev_max;
            // rto keeps its initial value until the second sample.
        } else {
            let err = rtt_us as i64 - self.srtt as i64;
            let new_srtt = ((self.srtt as i64 + err / 8).max(1)) as u64;

            let new_mdev = if (rtt_us as i64) < self.srtt as i64 - self.mdev as i64 {
                (31 * self.mdev + err.unsigned_abs()) / 32
            } else {
                (3 * self.mdev + err.unsigned_abs()) / 4
            };

            if new_mdev > self.mdev_max {
                self.mdev_max = new_mdev;
                if self.mdev_max > self.rttvar {
                    self.rttvar = self.mdev_max;
                }
            }

            self.srtt = new_srtt;
            self.mdev = new_mdev;
            self.rto = self.srtt + 4 * self.rttvar;
        }

        self.reqs_per_sec = 1_000_000 / self.srtt;
    }

    /// A request to this backend timed out. Rapidly decrease the estimate of
    /// how many requests per second it can absorb; the timing fields are left
    /// untouched.
    pub fn update_timeout(&mut self) {
        self.reqs_per_sec /= 4;
    }

    pub fn rto_us(&self) -> u64 {
        self.rto
    }

    pub fn reqs_per_sec(&self) -> u64 {
        self.reqs_per_sec
    }

    pub fn srtt_us(&self) -> u64 {
        self.srtt
    }
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let e = SpeedEstimator::new();
        assert_eq!(e.srtt_us(), 0);
        assert_eq!(e.rto_us(), 200_000);
        assert_eq!(e.reqs_per_sec(), 100_000);
    }

    #[test]
    fn test_first_sample() {
        let mut e = SpeedEstimator::new();
        e.update_rtt(1_000);
        assert_eq!(e.srtt_us(), 1_000);
        assert_eq!(e.mdev, 500);
        assert_eq!(e.mdev_max, 50_000);
        assert_eq!(e.rttvar, 50_000);
        // RTO only moves once the smoothing branch runs.
        assert_eq!(e.rto_us(), 200_000);
        assert_eq!(e.reqs_per_sec(), 1_000);
    }

    #[test]
    fn test_second_sample_recurrence() {
        let mut e = SpeedEstimator::new();
        e.update_rtt(1_000);
        e.update_rtt(1_200);

        // srtt = 1000 + (1200-1000)/8, mdev = (3*500 + 200)/4.
        assert_eq!(e.srtt_us(), 1_025);
        assert_eq!(e.mdev, 425);
        // new_mdev < mdev_max, so rttvar is unchanged.
        assert_eq!(e.rttvar, 50_000);
        assert_eq!(e.rto_us(), 1_025 + 4 * 50_000);
        assert_eq!(e.reqs_per_sec(), 1_000_000 / 1_025);
    }

    #[test]
    fn test_constant_input_convergence() {
        let mut e = SpeedEstimator::new();
        for _ in 0..200 {
            e.update_rtt(500);
        }
        // Constant samples drive srtt to the sample and mdev to zero.
        assert_eq!(e.srtt_us(), 500);
        assert_eq!(e.mdev, 0);
        assert_eq!(e.reqs_per_sec(), 2_000);
        // rttvar is ratcheted at the first-sample floor, so the RTO settles
        // at srtt + 4·mdev_max rather than collapsing to srtt.
        assert_eq!(e.rto_us(), 500 + 4 * 50_000);
    }

    #[test]
    fn test_timeout_decay() {
        let mut e = SpeedEstimator::new();
        assert_eq!(e.reqs_per_sec(), 100_000);
        e.update_timeout();
        e.update_timeout();
        e.update_timeout();
        assert_eq!(e.reqs_per_sec(), 1_562);
        // Timing state is untouched by timeouts.
        assert_eq!(e.srtt_us(), 0);
        assert_eq!(e.rto_us(), 200_000);
    }

    #[test]
    fn test_timeout_decays_to_zero() {
        let mut e = SpeedEstimator::new();
        for _ in 0..10 {
            e.update_timeout();
        }
        assert_eq!(e.reqs_per_sec(), 0);
    }

    #[test]
    fn test_measurement_after_timeout_restores_weight() {
        let mut e = SpeedEstimator::new();
        e.update_timeout();
        e.update_timeout();
        e.update_rtt(500);
        assert_eq!(e.reqs_per_sec(), 2_000);
    }

    #[test]
    fn test_undershoot_uses_slow_gain() {
        let mut e = SpeedEstimator::new();
        e.update_rtt(10_000);
        // Sample far below srtt - mdev: mdev moves with gain 1/32.
        e.update_rtt(1_000);
        // mdev = (31*5000 + 9000) / 32
        assert_eq!(e.mdev, (31 * 5_000 + 9_000) / 32);
    }
}
