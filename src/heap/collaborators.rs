//! Interfaces to the services the engine consumes but does not own.
//!
//! The embedder supplies one implementation of each; together they stand in
//! for the region allocator, the root-scanning framework, the evacuation and
//! reference-update machinery, the weak-reference processor, the mutator
//! rendezvous, and telemetry. Marking bitmaps and object layout stay on the
//! embedder's side of the line: the engine only sees [`ObjectRef`]s.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::cancellation::CancellationToken;
use super::regions::{CollectionSet, FreeSetStatus, RegionData};
use super::{DegenPoint, GcCause, GcMode, ObjectRef};

/// Region/heap service: capacities, region snapshots, free-set management.
pub trait RegionHeap: Send + Sync {
    fn committed(&self) -> usize;
    fn min_capacity(&self) -> usize;
    fn max_capacity(&self) -> usize;
    fn soft_max_capacity(&self) -> usize;

    /// Bytes currently available for allocation in the free set.
    fn available(&self) -> usize;
    fn used(&self) -> usize;

    fn region_count(&self) -> usize;

    /// Workers the heap wants active for parallel phases right now.
    fn active_worker_count(&self) -> usize;

    /// Liveness snapshot of candidate regions, taken after marking.
    fn region_data(&self) -> Vec<RegionData>;

    /// Accepts the heuristic's chosen region list. Immediate-garbage regions
    /// in the set are reclaimed by the manager without evacuation.
    fn install_collection_set(&self, cset: &CollectionSet);

    /// Rebuild the free set after a cycle changed region states.
    fn rebuild_free_set(&self);

    fn free_set_status(&self) -> FreeSetStatus;

    /// Uncommit predicates for the controller's shrink service.
    fn is_empty_committed(&self, index: usize) -> bool;
    fn empty_time(&self, index: usize) -> Instant;

    /// Uncommit regions empty since before `shrink_before`, stopping once
    /// committed memory reaches `shrink_until`. Returns regions uncommitted.
    fn uncommit_empty_regions(&self, shrink_before: Instant, shrink_until: usize) -> usize;
}

/// Marking side of the object model. `try_mark` must be safe to race from
/// many workers and return true for exactly one caller per object per cycle.
pub trait ObjectGraph: Send + Sync {
    /// Forget all mark state; called at the start of every cycle.
    fn reset_marks(&self);

    fn try_mark(&self, obj: ObjectRef) -> bool;

    fn is_marked(&self, obj: ObjectRef) -> bool;

    /// Invoke `sink` for every reference held by `obj`.
    fn scan(&self, obj: ObjectRef, sink: &mut dyn FnMut(ObjectRef));
}

/// Enumerates stack/global/class-loader roots.
pub trait RootScanner: Send + Sync {
    /// Push every root into `sink`. `paused` tells the scanner whether the
    /// world is stopped (it may take cheaper paths when it is).
    fn scan_roots(&self, paused: bool, sink: &mut dyn FnMut(ObjectRef));

    /// Drop dead class/metadata entries; called inside the final-mark pause
    /// of cycles that opted into class unloading.
    fn unload_classes(&self) {}
}

/// Weak/soft reference processing.
pub trait ReferenceProcessor: Send + Sync {
    fn set_soft_reference_policy(&self, clear_all: bool);

    fn process_references(&self, is_alive: &dyn Fn(ObjectRef) -> bool);

    /// Discard partially discovered reference lists after a cycle was
    /// cancelled mid-mark.
    fn abandon_partial_discovery(&self);
}

/// Object forwarding, evacuation and reference updates; consumed as opaque
/// phase services. Each returns false when it observed cancellation (or, for
/// the stop-the-world variants, could not make progress).
pub trait Evacuator: Send + Sync {
    fn evacuate(&self, cset: &CollectionSet, concurrent: bool, token: &CancellationToken) -> bool;

    fn update_references(&self, concurrent: bool, token: &CancellationToken) -> bool;

    /// Full-GC backstop: compute new addresses, adjust pointers, copy, and
    /// rebuild free regions in one stop-the-world pass over marked objects.
    /// Returns false only when no memory could be reclaimed at all.
    fn mark_compact(&self) -> bool;
}

/// Cooperative rendezvous that brings all mutators to a stop.
pub trait Safepoint: Send + Sync {
    /// Blocks until every mutator is parked; returns how many were stopped.
    fn begin(&self) -> usize;

    fn end(&self);
}

/// Per-cycle record handed to the telemetry/policy recorder.
#[derive(Clone, Copy, Debug)]
pub struct CycleOutcome {
    pub id: u64,
    pub mode: GcMode,
    pub cause: GcCause,
    pub duration: Duration,
    /// Where the concurrent cycle degenerated, when mode is `Degenerated`.
    pub degen_point: Option<DegenPoint>,
    /// The degenerated cycle itself failed and a full GC ran in its place.
    pub upgraded_to_full: bool,
}

pub trait Telemetry: Send + Sync {
    fn record_cycle(&self, outcome: &CycleOutcome) {
        let _ = outcome;
    }

    /// Periodic counter refresh driven from the control loop.
    fn update_counters(&self) {}
}

/// The full collaborator set the collector is constructed with.
#[derive(Clone)]
pub struct Collaborators {
    pub heap: Arc<dyn RegionHeap>,
    pub graph: Arc<dyn ObjectGraph>,
    pub roots: Arc<dyn RootScanner>,
    pub refs: Arc<dyn ReferenceProcessor>,
    pub evac: Arc<dyn Evacuator>,
    pub safepoint: Arc<dyn Safepoint>,
    pub telemetry: Arc<dyn Telemetry>,
}
