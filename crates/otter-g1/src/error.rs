//! Error types for otter-g1

use thiserror::Error;

/// Configuration rejected by [`GcConfig::validate`](crate::GcConfig::validate)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Region size is not a power of two or out of range
    #[error("region size {0} must be a power of two between 64KB and 32MB")]
    RegionSize(usize),

    /// Heap cannot hold the minimum number of regions
    #[error("heap size {heap} must hold at least {min} regions of {region} bytes")]
    HeapTooSmall {
        /// Configured heap size
        heap: usize,
        /// Configured region size
        region: usize,
        /// Minimum region count
        min: usize,
    },

    /// Heap does not fit in the addressable heap range
    #[error("heap size {0} exceeds the addressable heap range")]
    HeapTooLarge(usize),

    /// A percentage option is above 100
    #[error("{name} must be a percentage in 0..=100, got {value}")]
    Percentage {
        /// Option name
        name: &'static str,
        /// Offending value
        value: u32,
    },

    /// A count or capacity option is zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// TLAB does not fit into a region
    #[error("TLAB size {tlab} must be smaller than the region size {region}")]
    TlabSize {
        /// Configured TLAB size
        tlab: usize,
        /// Configured region size
        region: usize,
    },
}

/// Errors surfaced by the collector
#[derive(Error, Debug)]
pub enum GcError {
    /// The supplied configuration is invalid
    #[error("invalid GC configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Allocation failed even after a full collection
    #[error("out of memory: failed to allocate {0} bytes")]
    OutOfMemory(usize),

    /// A collector thread could not be started
    #[error("failed to spawn GC thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    /// Post-collection heap verification found broken references
    #[error("heap verification failed: {0} broken references")]
    HeapVerification(usize),

    /// The GC thread is gone and cannot accept tasks
    #[error("GC thread is not running")]
    ThreadStopped,
}

/// Result type for collector operations
pub type GcResult<T> = Result<T, GcError>;
