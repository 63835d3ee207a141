//! Tunable knobs for the kernel, mirroring `regionvm_gc::Configuration`'s role for the
//! collaborator crate.

use std::time::Duration;

/// Configuration shared by `Channel`, `ThreadRegistry`, and the interrupt-delivery path.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Numerator of the ratio applied to a dynamic channel's capacity when it grows.
    pub channel_growth_numerator: usize,
    /// Denominator of the growth ratio. Default 25/16.
    pub channel_growth_denominator: usize,
    /// Minimum number of additional slots a growth step must add, regardless of ratio.
    pub channel_min_growth: usize,
    /// Highest interrupt code a handler may be registered for. Mirrors `MAX_INTERRUPT`.
    pub max_interrupt_code: u32,
    /// Polling granularity for interruptible waits that fall back to polling because no native
    /// wakeup primitive observed the interrupt directly. The primary wakeup path is
    /// condvar-notified, not polled; this bounds the worst-case latency of the fallback.
    pub thread_poll_interval: Duration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            channel_growth_numerator: 25,
            channel_growth_denominator: 16,
            channel_min_growth: 2,
            max_interrupt_code: 63,
            thread_poll_interval: Duration::from_millis(10),
        }
    }
}

impl Configuration {
    /// Computes the next capacity for a dynamic channel currently holding `old` pair-slots.
    #[must_use]
    pub fn next_channel_capacity(&self, old: usize) -> usize {
        let grown = (old * self.channel_growth_numerator / self.channel_growth_denominator) | 1;
        (grown + 1).max(old + self.channel_min_growth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration() {
        let config = Configuration::default();
        assert_eq!(config.channel_growth_numerator, 25);
        assert_eq!(config.channel_growth_denominator, 16);
        assert_eq!(config.channel_min_growth, 2);
        assert_eq!(config.max_interrupt_code, 63);
    }

    #[test]
    fn growth_is_always_odd_plus_one_and_at_least_min_growth() {
        let config = Configuration::default();
        for old in [0usize, 1, 2, 3, 8, 16, 100] {
            let next = config.next_channel_capacity(old);
            assert!(next >= old + config.channel_min_growth);
        }
    }

    #[test]
    fn growth_example_matches_ratio() {
        let config = Configuration::default();
        // 16 * 25 / 16 = 25, | 1 = 25, + 1 = 26
        assert_eq!(config.next_channel_capacity(16), 26);
    }
}
