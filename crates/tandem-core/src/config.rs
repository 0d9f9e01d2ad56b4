//! Harness configuration.

use std::time::Duration;

/// Delay before a blocking probe signals the peer.
///
/// Tunable, not a correctness guarantee: contention that resolves slower than
/// this is masked by the probe.
pub const DEFAULT_PROBE_DELAY: Duration = Duration::from_millis(100);

/// Harness configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Delay before a blocking probe releases the peer
    pub probe_delay: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self { probe_delay: DEFAULT_PROBE_DELAY }
    }
}

impl HarnessConfig {
    /// Override the probe delay.
    #[must_use]
    pub fn with_probe_delay(mut self, probe_delay: Duration) -> Self {
        self.probe_delay = probe_delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_probe_delay_is_100ms() {
        assert_eq!(HarnessConfig::default().probe_delay, Duration::from_millis(100));
    }

    #[test]
    fn with_probe_delay_overrides() {
        let config = HarnessConfig::default().with_probe_delay(Duration::from_millis(5));
        assert_eq!(config.probe_delay, Duration::from_millis(5));
    }
}
