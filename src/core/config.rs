use std::time::Duration;

/// Gateway core configuration
///
/// Tuning knobs for twin synchronization and identity scope refresh.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Minimum interval between cloud twin resyncs for the same client
    pub min_twin_sync_period: Duration,

    /// Period of the background identity scope refresh cycle
    pub identity_refresh_interval: Duration,

    /// Debounce window for on-demand scope refresh requests
    pub identity_refresh_delay: Duration,

    /// Number of stripes in each keyed lock table
    pub lock_stripes: usize,

    /// Tick interval of the reported-properties drain task
    pub reported_sync_interval: Duration,

    /// Delay before retrying a transiently failed reported-properties push
    pub reported_backoff: Duration,

    /// Deadline applied to every cloud call
    pub cloud_timeout: Duration,

    /// Grace period for draining in-flight work on shutdown
    pub shutdown_grace: Duration,

    /// Snapshot cadence of the file-backed store
    pub file_store_flush_interval: Duration,
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self {
            min_twin_sync_period: Duration::from_secs(120),
            identity_refresh_interval: Duration::from_secs(3600),
            identity_refresh_delay: Duration::from_secs(300),
            lock_stripes: 10,
            reported_sync_interval: Duration::from_secs(5),
            reported_backoff: Duration::from_secs(5),
            cloud_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            file_store_flush_interval: Duration::from_secs(30),
        }
    }

    /// Set the minimum twin resync period
    pub fn min_twin_sync_period(mut self, period: Duration) -> Self {
        self.min_twin_sync_period = period;
        self
    }

    /// Set the periodic scope refresh interval
    pub fn identity_refresh_interval(mut self, interval: Duration) -> Self {
        self.identity_refresh_interval = interval;
        self
    }

    /// Set the on-demand refresh debounce window
    pub fn identity_refresh_delay(mut self, delay: Duration) -> Self {
        self.identity_refresh_delay = delay;
        self
    }

    /// Set the keyed lock stripe count
    pub fn lock_stripes(mut self, stripes: usize) -> Self {
        self.lock_stripes = stripes;
        self
    }

    /// Set the reported-properties drain tick
    pub fn reported_sync_interval(mut self, interval: Duration) -> Self {
        self.reported_sync_interval = interval;
        self
    }

    /// Set the transient-failure retry backoff
    pub fn reported_backoff(mut self, backoff: Duration) -> Self {
        self.reported_backoff = backoff;
        self
    }

    /// Set the per-call cloud deadline
    pub fn cloud_timeout(mut self, timeout: Duration) -> Self {
        self.cloud_timeout = timeout;
        self
    }

    /// Set the shutdown drain grace period
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the file store snapshot cadence
    pub fn file_store_flush_interval(mut self, interval: Duration) -> Self {
        self.file_store_flush_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.lock_stripes == 0 {
            return Err("lock_stripes must be at least 1".to_string());
        }
        let intervals = [
            ("min_twin_sync_period", self.min_twin_sync_period),
            ("identity_refresh_interval", self.identity_refresh_interval),
            ("identity_refresh_delay", self.identity_refresh_delay),
            ("reported_sync_interval", self.reported_sync_interval),
            ("reported_backoff", self.reported_backoff),
            ("cloud_timeout", self.cloud_timeout),
            ("shutdown_grace", self.shutdown_grace),
            ("file_store_flush_interval", self.file_store_flush_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(format!("{} must be nonzero", name));
            }
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(GatewayConfig::new().validate().is_ok());
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(GatewayConfig::new().lock_stripes(0).validate().is_err());
        assert!(GatewayConfig::new()
            .cloud_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(GatewayConfig::new()
            .min_twin_sync_period(Duration::ZERO)
            .validate()
            .is_err());
        assert!(GatewayConfig::new()
            .identity_refresh_delay(Duration::ZERO)
            .validate()
            .is_err());
        assert!(GatewayConfig::new()
            .reported_backoff(Duration::ZERO)
            .validate()
            .is_err());
        assert!(GatewayConfig::new()
            .shutdown_grace(Duration::ZERO)
            .validate()
            .is_err());
        assert!(GatewayConfig::new()
            .file_store_flush_interval(Duration::ZERO)
            .validate()
            .is_err());
    }
}
