//! Configuration and statistics for the garbage-collector collaborator surface.

/// Configuration for the external collaborator.
///
/// None of these fields drive a collection cycle in this crate -- there is no collection cycle
/// here. They exist so a collector driver built against this surface has somewhere to read
/// hints from, and so `regionvm_rt`'s own [`Configuration`](https://docs.rs/regionvm_rt)
/// can forward a single, coherent set of knobs to both crates.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Number of threads a collector driver may use for tracing. A value of `0` means the driver
    /// should pick a default (typically 50% of available CPU cores).
    pub threads: usize,
    /// Allocation volume (bytes) after which a driver should consider starting a collection.
    pub allocation_threshold: usize,
}

impl Default for Configuration {
    /// Creates a default configuration.
    ///
    /// This sets `threads` to `0` (driver picks a default) and `allocation_threshold` to 8MB.
    fn default() -> Self {
        Self {
            threads: 0,
            allocation_threshold: 8 * 1024 * 1024,
        }
    }
}

/// Allocation statistics tracked by the root registry.
#[derive(Clone, Debug, Default)]
pub struct Statistics {
    pub objects_registered: usize,
    pub bytes_allocated: usize,
    pub roots_active: usize,
    pub finalizers_pending: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration() {
        let config = Configuration::default();
        assert_eq!(config.threads, 0);
        assert_eq!(config.allocation_threshold, 8 * 1024 * 1024);
    }

    #[test]
    fn default_statistics() {
        let stats = Statistics::default();
        assert_eq!(stats.objects_registered, 0);
        assert_eq!(stats.bytes_allocated, 0);
        assert_eq!(stats.roots_active, 0);
        assert_eq!(stats.finalizers_pending, 0);
    }
}
