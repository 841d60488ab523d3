//! Configuration types.

use std::time::Duration;

/// Leasing engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lease grace applied when a provider does not supply one.
    pub default_grace: Duration,
    /// Upper bound on provider-supplied heartbeat grace.
    pub max_grace: Duration,
    /// How many candidate-selection rounds a claim attempts before
    /// giving up under contention.
    pub claim_retry_limit: usize,
    /// Pending candidates fetched per claim round.
    pub claim_batch_size: usize,
    /// Interval of the background reclaim sweep.
    pub sweep_interval: Duration,
    /// Expired leases reclaimed per sweep pass.
    pub reclaim_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_grace: Duration::from_secs(60),
            max_grace: Duration::from_secs(900), // 15 minutes
            claim_retry_limit: 3,
            claim_batch_size: 8,
            sweep_interval: Duration::from_secs(30),
            reclaim_batch_size: 64,
        }
    }
}

impl EngineConfig {
    /// Clamp a provider-supplied grace to the configured maximum.
    pub fn effective_grace(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(g) => g.min(self.max_grace),
            None => self.default_grace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grace_used_when_unspecified() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.effective_grace(None), cfg.default_grace);
    }

    #[test]
    fn requested_grace_is_capped() {
        let cfg = EngineConfig::default();
        let huge = Duration::from_secs(86_400);
        assert_eq!(cfg.effective_grace(Some(huge)), cfg.max_grace);

        let small = Duration::from_secs(5);
        assert_eq!(cfg.effective_grace(Some(small)), small);
    }
}
