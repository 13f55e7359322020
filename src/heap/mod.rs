use std::time::Instant;

pub mod cancellation;
pub mod collaborators;
pub mod collector;
pub mod concurrent_gc;
pub mod config;
pub mod controller;
pub mod degenerated_gc;
pub mod full_gc;
pub mod heuristics;
pub mod mark;
pub mod pacer;
pub mod regions;
pub mod satb;
pub mod shared_vars;

#[cfg(test)]
pub(crate) mod mock;

/// Opaque reference to a heap object, as handed out by the embedder's root
/// scanner and object graph. The engine never dereferences it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ObjectRef(pub usize);

impl ObjectRef {
    #[inline]
    pub fn addr(self) -> usize {
        self.0
    }
}

/// What asked for the cycle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum GcCause {
    /// A caller of `request_gc` asked for a collection outright.
    Explicit,
    /// Internally raised request (metadata pressure, diagnostics).
    Implicit,
    /// A mutator failed to allocate and is blocked until memory is reclaimed.
    AllocFailure,
    /// The heuristic or the guaranteed-interval timer fired.
    Periodic,
}

impl GcCause {
    pub fn is_requested(self) -> bool {
        matches!(self, GcCause::Explicit | GcCause::Implicit)
    }
}

impl std::fmt::Display for GcCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GcCause::Explicit => "Explicit GC request",
            GcCause::Implicit => "Implicit GC request",
            GcCause::AllocFailure => "Allocation failure",
            GcCause::Periodic => "Periodic trigger",
        };
        f.write_str(s)
    }
}

/// Collection mode chosen by the control loop for one cycle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum GcMode {
    None,
    Concurrent,
    Degenerated,
    Full,
}

/// The phase at which a concurrent cycle was cancelled. A degenerated cycle
/// re-enters the pipeline at this point and runs the remainder stop-the-world.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum DegenPoint {
    Unset,
    OutsideCycle,
    Mark,
    Evacuation,
    UpdateRefs,
}

impl std::fmt::Display for DegenPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DegenPoint::Unset => "<unset>",
            DegenPoint::OutsideCycle => "Outside of Cycle",
            DegenPoint::Mark => "Mark",
            DegenPoint::Evacuation => "Evacuation",
            DegenPoint::UpdateRefs => "Update References",
        };
        f.write_str(s)
    }
}

/// One end-to-end collection pass. Exactly one cycle is current at a time;
/// ids are handed out by the control loop and strictly increase.
#[derive(Clone, Copy, Debug)]
pub struct Cycle {
    pub id: u64,
    pub cause: GcCause,
    pub mode: GcMode,
    /// Treat softly-reachable optional data as collectible this cycle.
    pub clear_soft_refs: bool,
    /// Also attempt class/metadata unloading this cycle.
    pub unload_classes: bool,
}

/// Allocation that failed and is now waiting on the collector.
#[derive(Clone, Copy, Debug)]
pub struct AllocRequest {
    min_size: usize,
    requested_size: usize,
}

impl AllocRequest {
    pub const fn new(min_size: usize, requested_size: usize) -> Self {
        Self {
            min_size,
            requested_size,
        }
    }

    pub const fn size(&self) -> usize {
        self.requested_size
    }

    pub const fn min_size(&self) -> usize {
        self.min_size
    }
}

/// Scope timer for a stop-the-world phase; logs on drop.
pub struct PausePhase {
    name: &'static str,
    gc_id: u64,
    start: Instant,
}

impl PausePhase {
    pub fn new(name: &'static str, gc_id: u64) -> Self {
        Self {
            name,
            gc_id,
            start: Instant::now(),
        }
    }
}

impl Drop for PausePhase {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::info!(target: "gc", "GC({}) Pause {} {:.3}ms",
            self.gc_id, self.name, elapsed.as_micros() as f64 / 1000.0);
    }
}

/// Scope timer for a concurrent phase; logs on drop.
pub struct ConcurrentPhase {
    name: &'static str,
    gc_id: u64,
    start: Instant,
}

impl ConcurrentPhase {
    pub fn new(name: &'static str, gc_id: u64) -> Self {
        Self {
            name,
            gc_id,
            start: Instant::now(),
        }
    }
}

impl Drop for ConcurrentPhase {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::info!(target: "gc", "GC({}) Concurrent {} {:.3}ms",
            self.gc_id, self.name, elapsed.as_micros() as f64 / 1000.0);
    }
}
