//! RTT（往復遅延）推定
//!
//! RFC 6298 と同じ指数移動平均（α = 1/8, β = 1/4）で SRTT / RTTVAR を更新し、
//! 再送タイムアウトを `ceil(SRTT + 4 * RTTVAR)` を [50, 1000] ms に丸めて求める。

use serde::Serialize;

/// 再送タイムアウトの下限（ms）
pub const MIN_RTO: u64 = 50;
/// 再送タイムアウトの上限（ms）
pub const MAX_RTO: u64 = 1000;

/// これ以上の RTT サンプルは捨てる（相手プロセスが一時停止していた等）
const MAX_SAMPLE_MS: f64 = 5000.0;

const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RttEstimator {
    srtt: f64,
    rttvar: f64,
    hit: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            srtt: 1000.0,
            rttvar: 500.0,
            hit: false,
        }
    }

    /// RTT サンプルを 1 つ取り込む
    ///
    /// # 戻り値
    /// サンプルを採用したら `true`（5000 ms 以上は捨てる）
    pub fn observe(&mut self, sample_ms: f64) -> bool {
        if sample_ms >= MAX_SAMPLE_MS {
            return false;
        }

        if !self.hit {
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2.0;
            self.hit = true;
        } else {
            self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (self.srtt - sample_ms).abs();
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * sample_ms;
        }
        true
    }

    /// 再送タイムアウト（ms）
    pub fn timeout(&self) -> u64 {
        let rto = (self.srtt + 4.0 * self.rttvar).ceil() as u64;
        rto.clamp(MIN_RTO, MAX_RTO)
    }

    pub fn srtt(&self) -> f64 {
        self.srtt
    }

    pub fn rttvar(&self) -> f64 {
        self.rttvar
    }

    /// 1 度でもサンプルを採用したか
    pub fn has_sample(&self) -> bool {
        self.hit
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_timeout_is_capped() {
        let rtt = RttEstimator::new();
        assert_eq!(rtt.srtt(), 1000.0);
        assert_eq!(rtt.timeout(), MAX_RTO);
    }

    #[test]
    fn test_first_sample_seeds_estimate() {
        let mut rtt = RttEstimator::new();
        assert!(rtt.observe(80.0));
        assert_eq!(rtt.srtt(), 80.0);
        assert_eq!(rtt.rttvar(), 40.0);
        assert_eq!(rtt.timeout(), 240);
    }

    #[test]
    fn test_large_sample_is_ignored() {
        let mut rtt = RttEstimator::new();
        assert!(!rtt.observe(5000.0));
        assert!(!rtt.has_sample());
        assert!(rtt.observe(4999.0));
    }

    #[test]
    fn test_converges_to_constant_delay() {
        let mut rtt = RttEstimator::new();
        rtt.observe(300.0);
        for _ in 0..200 {
            rtt.observe(120.0);
            assert!((MIN_RTO..=MAX_RTO).contains(&rtt.timeout()));
        }
        assert!((rtt.srtt() - 120.0).abs() < 1.0, "srtt = {}", rtt.srtt());
        assert!(rtt.rttvar() < 1.0);
        // 分散がほぼ 0 でも下限 50 ms を割らない
        let mut fast = RttEstimator::new();
        for _ in 0..200 {
            fast.observe(2.0);
        }
        assert_eq!(fast.timeout(), MIN_RTO);
    }
}
