//! Collector configuration

use crate::error::ConfigError;

/// Smallest number of regions a heap may consist of.
pub const MIN_HEAP_REGIONS: usize = 4;

/// Upper bound of the virtual heap range (64GB).
pub const MAX_HEAP_SIZE: usize = 1 << 36;

/// What happens to a region's storage once the region is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionReleasePolicy {
    /// Drop the storage immediately
    Release,
    /// Keep the storage on a bounded free list for reuse
    Retain,
}

/// G1 configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Region size in bytes, a power of two (default: 256KB)
    pub region_size: usize,
    /// Maximum heap size in bytes (default: 64MB)
    pub heap_size: usize,
    /// Share of the heap usable by eden regions, percent (default: 25)
    pub young_space_percent: u32,
    /// TLAB size in bytes, 0 disables TLABs (default: 4KB)
    pub tlab_size: usize,
    /// Minimum garbage share for an old region to be collected, percent (default: 95)
    pub region_garbage_rate_threshold: u32,
    /// Live share above which a young region is promoted in place, percent (default: 50)
    pub promotion_region_alive_rate: u32,
    /// Fragmentation below which a full GC skips a garbage-free region, percent (default: 1)
    pub full_gc_region_fragmentation_rate: u32,
    /// Size collections by the pause time goal (default: false)
    pub enable_pause_time_goal: bool,
    /// Maximum pause within one pause interval, ms (default: 10)
    pub max_gc_pause_ms: u64,
    /// Length of the pause interval, ms (default: 11)
    pub gc_pause_interval_ms: u64,
    /// Tenured occupancy that requests concurrent marking, percent (default: 45)
    pub initiating_occupancy_percent: u32,
    /// Tenured regions added to a mixed collection (default: 2)
    pub number_of_tenured_regions_at_mixed_collection: usize,
    /// Process dirty cards on a background thread (default: true)
    pub enable_concurrent_update_remset: bool,
    /// Cards the background thread waits for before processing a batch (default: 2)
    pub min_concurrent_cards_to_process: usize,
    /// Capacity of the shared dirty-card queue (default: 4096)
    pub card_queue_capacity: usize,
    /// Capacity of the per-mutator post-barrier ring (default: 256)
    pub post_barrier_buffer_size: usize,
    /// Parallel GC worker threads (default: 2)
    pub gc_workers_count: usize,
    /// Entries per marking task before work is split off (default: 256)
    pub marking_stack_split_threshold: usize,
    /// Count freed objects individually (default: false)
    pub track_freed_objects: bool,
    /// Follow explicit collections with concurrent marking (default: true)
    pub explicit_concurrent_gc_enabled: bool,
    /// Empty tenured regions kept for reuse (default: 8)
    pub empty_regions_retained_max: usize,
    /// What happens to freed region storage (default: Retain)
    pub region_release_policy: RegionReleasePolicy,
    /// Weight of the standard deviation in predictions (default: 0.5)
    pub predictor_confidence_factor: f64,
    /// Verify heap references after every pause (default: false)
    pub verify_after_gc: bool,
    /// Abort when heap verification fails (default: false)
    pub fail_on_heap_verification: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            region_size: 256 * 1024,
            heap_size: 64 * 1024 * 1024,
            young_space_percent: 25,
            tlab_size: 4 * 1024,
            region_garbage_rate_threshold: 95,
            promotion_region_alive_rate: 50,
            full_gc_region_fragmentation_rate: 1,
            enable_pause_time_goal: false,
            max_gc_pause_ms: 10,
            gc_pause_interval_ms: 11,
            initiating_occupancy_percent: 45,
            number_of_tenured_regions_at_mixed_collection: 2,
            enable_concurrent_update_remset: true,
            min_concurrent_cards_to_process: 2,
            card_queue_capacity: 4096,
            post_barrier_buffer_size: 256,
            gc_workers_count: 2,
            marking_stack_split_threshold: 256,
            track_freed_objects: false,
            explicit_concurrent_gc_enabled: true,
            empty_regions_retained_max: 8,
            region_release_policy: RegionReleasePolicy::Retain,
            predictor_confidence_factor: 0.5,
            verify_after_gc: false,
            fail_on_heap_verification: false,
        }
    }
}

impl GcConfig {
    /// Check that the options are consistent
    pub fn validate(&self) -> Result<(), ConfigError> {
        let region = self.region_size;
        if !region.is_power_of_two() || !(64 * 1024..=32 * 1024 * 1024).contains(&region) {
            return Err(ConfigError::RegionSize(region));
        }
        if self.heap_size > MAX_HEAP_SIZE {
            return Err(ConfigError::HeapTooLarge(self.heap_size));
        }
        if self.heap_size / region < MIN_HEAP_REGIONS {
            return Err(ConfigError::HeapTooSmall {
                heap: self.heap_size,
                region,
                min: MIN_HEAP_REGIONS,
            });
        }
        for (name, value) in [
            ("young_space_percent", self.young_space_percent),
            ("region_garbage_rate_threshold", self.region_garbage_rate_threshold),
            ("promotion_region_alive_rate", self.promotion_region_alive_rate),
            (
                "initiating_occupancy_percent",
                self.initiating_occupancy_percent,
            ),
            (
                "full_gc_region_fragmentation_rate",
                self.full_gc_region_fragmentation_rate,
            ),
        ] {
            if value > 100 {
                return Err(ConfigError::Percentage { name, value });
            }
        }
        if self.young_space_percent == 0 {
            return Err(ConfigError::Zero("young_space_percent"));
        }
        if self.tlab_size >= region {
            return Err(ConfigError::TlabSize {
                tlab: self.tlab_size,
                region,
            });
        }
        if self.gc_workers_count == 0 {
            return Err(ConfigError::Zero("gc_workers_count"));
        }
        if self.card_queue_capacity == 0 {
            return Err(ConfigError::Zero("card_queue_capacity"));
        }
        if self.post_barrier_buffer_size == 0 {
            return Err(ConfigError::Zero("post_barrier_buffer_size"));
        }
        if self.marking_stack_split_threshold == 0 {
            return Err(ConfigError::Zero("marking_stack_split_threshold"));
        }
        if self.enable_pause_time_goal && self.max_gc_pause_ms == 0 {
            return Err(ConfigError::Zero("max_gc_pause_ms"));
        }
        Ok(())
    }

    /// Number of regions in the heap
    pub fn region_count(&self) -> usize {
        self.heap_size / self.region_size
    }

    /// Upper bound on eden regions
    pub fn max_young_regions(&self) -> usize {
        let regions = self.region_count() * self.young_space_percent as usize / 100;
        regions.clamp(1, self.region_count() - 1)
    }

    /// `log2(region_size)`
    pub fn region_size_bits(&self) -> u32 {
        self.region_size.trailing_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = GcConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.region_count(), 256);
        assert_eq!(config.max_young_regions(), 64);
        assert_eq!(config.region_size_bits(), 18);
    }

    #[test]
    fn rejects_bad_region_size() {
        let config = GcConfig {
            region_size: 300 * 1024,
            ..GcConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::RegionSize(300 * 1024)));
    }

    #[test]
    fn rejects_tiny_heap() {
        let config = GcConfig {
            heap_size: 512 * 1024,
            ..GcConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HeapTooSmall { .. })
        ));
    }

    #[test]
    fn rejects_percentages_over_100() {
        let config = GcConfig {
            promotion_region_alive_rate: 120,
            ..GcConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Percentage {
                name: "promotion_region_alive_rate",
                value: 120
            })
        );
    }

    #[test]
    fn rejects_zero_workers() {
        let config = GcConfig {
            gc_workers_count: 0,
            ..GcConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("gc_workers_count")));
    }
}
