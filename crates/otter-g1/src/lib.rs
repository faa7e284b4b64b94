//! # Otter G1 Garbage Collector
//!
//! Generational, region-based, mostly-concurrent collector for Otter VM.
//!
//! ## Design
//!
//! - **Regions**: The heap is split into equal power-of-two regions; objects
//!   larger than a region get a humongous run of contiguous regions
//! - **Young generation**: Eden regions with thread-local allocation buffers,
//!   collected in every pause by evacuation or in-place promotion
//! - **Old generation**: Filled by evacuation; regions with the most garbage
//!   join mixed collections after concurrent marking
//! - **Remembered sets**: Card-granular sets of cross-region slots, kept
//!   current by a post-write barrier and a background worker
//! - **Concurrent marking**: Snapshot-at-the-beginning marking between an
//!   initial mark and a remark pause
//! - **Full collection**: Whole-heap marking followed by chunked compaction

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod address;
pub mod allocator;
pub mod analytics;
pub mod barrier;
pub mod bitmap;
pub mod card_table;
pub mod collection_set;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod evacuation;
pub mod g1;
pub mod gc_thread;
pub mod heap;
pub mod marker;
pub mod mutator;
pub mod object;
pub mod pause_tracker;
pub mod ref_update;
pub mod region;
pub mod region_space;
pub mod remset;
pub mod roots;
pub mod stats;
pub mod task;
pub mod update_remset;
pub mod verifier;
pub mod workers;

pub use address::Address;
pub use concurrent::{GcPhase, MutatorControl, NoopMutatorControl};
pub use config::{GcConfig, RegionReleasePolicy};
pub use error::{ConfigError, GcError, GcResult};
pub use g1::G1Gc;
pub use gc_thread::GcThread;
pub use heap::Heap;
pub use mutator::MutatorContext;
pub use object::{
    ClassId, ClassShape, DynamicLayout, LanguageKind, MarkWord, ObjectModel, ObjectShape,
    StaticLayout,
};
pub use region::{Region, RegionFlags};
pub use roots::{Handle, HandleTable, RootProvider, RootType};
pub use stats::{CycleRecord, GcListener, GcStats};
pub use task::{GcCollectionType, GcTask, GcTaskCause};
