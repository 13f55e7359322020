//! Cycle orchestration and concurrent tracing core for a region-based,
//! mostly-concurrent garbage collector.
//!
//! The crate owns the parts of the collector that decide *when* to collect and
//! *how hard*: a dedicated control-loop thread consuming trigger signals, a
//! pluggable heuristic deciding when a cycle should start and which regions it
//! should reclaim, a work-stealing concurrent marker, and the escalation
//! ladder (concurrent -> degenerated -> full) that keeps the collector correct
//! when concurrent work is outpaced by allocation.
//!
//! Everything the engine does not own - region allocation, root enumeration,
//! object copying, reference processing, mutator rendezvous - is consumed
//! through the collaborator traits in [`heap::collaborators`].

pub mod heap;
pub mod sync;
pub mod utils;

pub use heap::collector::Collector;
pub use heap::config::GcConfig;
pub use heap::{DegenPoint, GcCause, GcMode, ObjectRef};
pub use utils::{formatted_size, formatted_sizef};
