use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use scoped_threadpool::Pool;

use crate::formatted_size;
use crate::sync::Monitor;

use super::cancellation::{CancelCause, CancellationToken};
use super::collaborators::{Collaborators, RegionHeap, RootScanner};
use super::config::GcConfig;
use super::controller::ControlThread;
use super::heuristics::{new_heuristics, HeapStats, Heuristics};
use super::mark::ConcurrentMark;
use super::pacer::Pacer;
use super::regions::CollectionSet;
use super::satb::SatbLog;
use super::shared_vars::SharedFlag;
use super::{AllocRequest, GcCause, ObjectRef};

/// Control-loop state machine states, exposed for observability.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ControllerPhase {
    Idle = 0,
    RunningNormal = 1,
    RunningDegenerated = 2,
    RunningFull = 3,
    Uncommitting = 4,
    ShuttingDown = 5,
}

/// Process-scoped sticky request flags, counters, and the monitors their
/// waiters block on. Constructed once at collector startup; flags are set by
/// mutator/API threads and cleared only by the control loop after the
/// corresponding cycle completes.
pub struct ControllerState {
    pub explicit_gc_requested: SharedFlag,
    pub implicit_gc_requested: SharedFlag,
    pub alloc_failure_pending: SharedFlag,
    pub graceful_shutdown: SharedFlag,
    pub heap_changed: SharedFlag,
    pub metaspace_oom: SharedFlag,

    gc_id: AtomicU64,
    allocs_seen: AtomicUsize,
    bytes_allocated_since_gc_start: AtomicUsize,
    phase: AtomicU8,

    pub alloc_failure_waiters: Monitor<()>,
    pub gc_waiters: Monitor<()>,
    /// The control loop sleeps here; notifying cuts its back-off short.
    pub wakeup: Monitor<()>,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            explicit_gc_requested: SharedFlag::new(),
            implicit_gc_requested: SharedFlag::new(),
            alloc_failure_pending: SharedFlag::new(),
            graceful_shutdown: SharedFlag::new(),
            heap_changed: SharedFlag::new(),
            metaspace_oom: SharedFlag::new(),
            gc_id: AtomicU64::new(0),
            allocs_seen: AtomicUsize::new(0),
            bytes_allocated_since_gc_start: AtomicUsize::new(0),
            phase: AtomicU8::new(ControllerPhase::Idle as u8),
            alloc_failure_waiters: Monitor::new(()),
            gc_waiters: Monitor::new(()),
            wakeup: Monitor::new(()),
        }
    }
}

/// The engine: owns policy, marking machinery, request plumbing and the
/// cancellation token, and talks to everything else through collaborator
/// traits. One instance per managed heap, shared behind an `Arc`.
pub struct Collector {
    config: GcConfig,
    collab: Collaborators,
    state: ControllerState,
    cancellation: CancellationToken,
    heuristics: Mutex<Box<dyn Heuristics>>,
    mark: ConcurrentMark,
    satb: SatbLog,
    pacer: Pacer,
    workers: Mutex<Pool>,
    /// Heap-wide lock taken around free-set mutation and status logging.
    heap_lock: Mutex<()>,
    current_cset: Mutex<CollectionSet>,
    mark_in_progress: SharedFlag,
}

impl Collector {
    pub fn new(mut config: GcConfig, collab: Collaborators) -> Arc<Collector> {
        config.normalize();

        let heuristics = new_heuristics(&config);
        let workers = Mutex::new(Pool::new(
            config.parallel_gc_threads.try_into().unwrap(),
        ));

        log::info!(target: "gc",
            "GC engine initialized: {} heuristics, {} parallel workers",
            heuristics.kind().name(),
            config.parallel_gc_threads
        );

        Arc::new(Collector {
            config,
            collab,
            state: ControllerState::new(),
            cancellation: CancellationToken::new(),
            heuristics: Mutex::new(heuristics),
            mark: ConcurrentMark::new(),
            satb: SatbLog::new(),
            pacer: Pacer::new(),
            workers,
            heap_lock: Mutex::new(()),
            current_cset: Mutex::new(CollectionSet::new()),
            mark_in_progress: SharedFlag::new(),
        })
    }

    /// Spawn the control-loop thread for this collector.
    pub fn start(self: &Arc<Self>) -> ControlThread {
        ControlThread::spawn(self.clone())
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn heuristics(&self) -> &Mutex<Box<dyn Heuristics>> {
        &self.heuristics
    }

    pub fn concurrent_mark(&self) -> &ConcurrentMark {
        &self.mark
    }

    pub fn satb_log(&self) -> &SatbLog {
        &self.satb
    }

    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    pub fn workers(&self) -> &Mutex<Pool> {
        &self.workers
    }

    pub fn heap_lock(&self) -> &Mutex<()> {
        &self.heap_lock
    }

    pub fn current_cset(&self) -> &Mutex<CollectionSet> {
        &self.current_cset
    }

    // ------------------------------------------------------------------
    // Cycle id

    pub fn current_gc_id(&self) -> u64 {
        self.state.gc_id.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_gc_id(&self) -> u64 {
        self.state.gc_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ------------------------------------------------------------------
    // Allocation bookkeeping

    /// Called by allocation paths after every successful allocation.
    pub fn report_allocation(&self, bytes: usize) {
        self.state.allocs_seen.fetch_add(bytes, Ordering::Relaxed);
        self.state
            .bytes_allocated_since_gc_start
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_allocated_since_gc_start(&self) -> usize {
        self.state
            .bytes_allocated_since_gc_start
            .load(Ordering::Relaxed)
    }

    pub(crate) fn reset_bytes_allocated_since_gc_start(&self) {
        self.state
            .bytes_allocated_since_gc_start
            .store(0, Ordering::Relaxed);
    }

    /// Bytes allocated since the previous control-loop iteration; exchanged
    /// to zero on read.
    pub(crate) fn take_allocs_seen(&self) -> usize {
        self.state.allocs_seen.swap(0, Ordering::Relaxed)
    }

    /// Throttle the calling allocation against the pacer's current budget.
    pub fn pace_for_alloc(&self, bytes: usize) {
        if self.config.pacing {
            self.pacer
                .pace_for_alloc(&self.config, self.pacer.epoch(), bytes);
        }
    }

    pub fn heap_stats(&self) -> HeapStats {
        HeapStats {
            max_capacity: self.collab.heap.max_capacity(),
            soft_max_capacity: self.collab.heap.soft_max_capacity(),
            available: self.collab.heap.available(),
            bytes_allocated_since_gc_start: self.bytes_allocated_since_gc_start(),
        }
    }

    // ------------------------------------------------------------------
    // Cancellation

    pub fn cancel_gc(&self, cause: CancelCause) {
        if self.cancellation.try_cancel(cause) {
            log::debug!(target: "gc", "GC cancelled: {:?}", cause);
        }
    }

    pub fn cancelled_gc(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    // ------------------------------------------------------------------
    // Marking state shared with write barriers

    pub(crate) fn set_mark_in_progress(&self, in_progress: bool) {
        self.mark_in_progress.set_cond(in_progress);
        self.satb.set_active(in_progress);
    }

    pub fn is_mark_in_progress(&self) -> bool {
        self.mark_in_progress.is_set()
    }

    /// Seed the mark queues from the embedder's roots.
    pub(crate) fn collect_roots(&self, paused: bool) {
        let graph = self.collab.graph.as_ref();
        let mark = &self.mark;
        self.collab
            .roots
            .scan_roots(paused, &mut |obj: ObjectRef| mark.seed(graph, obj));
    }

    // ------------------------------------------------------------------
    // Controller phase

    pub(crate) fn set_phase(&self, phase: ControllerPhase) {
        self.state.phase.store(phase as u8, Ordering::Release);
    }

    pub fn phase(&self) -> ControllerPhase {
        match self.state.phase.load(Ordering::Acquire) {
            0 => ControllerPhase::Idle,
            1 => ControllerPhase::RunningNormal,
            2 => ControllerPhase::RunningDegenerated,
            3 => ControllerPhase::RunningFull,
            4 => ControllerPhase::Uncommitting,
            _ => ControllerPhase::ShuttingDown,
        }
    }

    // ------------------------------------------------------------------
    // Public request API

    /// Request a collection and block until one full cycle has completed.
    /// A request that arrives while a cycle is already in flight is
    /// satisfied by the *next* completed cycle, not the in-flight one.
    pub fn request_gc(&self, cause: GcCause) {
        debug_assert!(cause.is_requested(), "use handle_alloc_failure for allocation failures");

        let flag = match cause {
            GcCause::Implicit => &self.state.implicit_gc_requested,
            _ => &self.state.explicit_gc_requested,
        };

        let mut ml = self.state.gc_waiters.lock();

        let mut current_gc_id = self.current_gc_id();
        let required_gc_id = current_gc_id + 1;

        while current_gc_id < required_gc_id {
            flag.set();
            self.state.wakeup.notify_all();

            ml.wait();

            current_gc_id = self.current_gc_id();
        }
    }

    /// A mutator failed to allocate: cancel any concurrent cycle so the
    /// controller can escalate, then block until that cycle completes.
    pub fn handle_alloc_failure(&self, req: AllocRequest) {
        if self.state.alloc_failure_pending.try_set() {
            log::info!(target: "gc",
                "Failed to allocate {}",
                formatted_size(req.size())
            );

            self.cancel_gc(CancelCause::AllocFailure);
            self.state.wakeup.notify_all();
        }

        let mut ml = self.state.alloc_failure_waiters.lock();
        while self.state.alloc_failure_pending.is_set() {
            ml.wait();
        }
    }

    /// Record metadata-space exhaustion; the next cycles will attempt class
    /// unloading until one succeeds.
    pub fn notify_metaspace_oom(&self) {
        if self.state.metaspace_oom.try_set() {
            log::info!(target: "gc", "Metaspace allocation failure recorded");
        }
    }

    /// Wake the control loop out of its exponential back-off because heap
    /// state changed (allocation burst, capacity adjustment).
    pub fn notify_heap_changed(&self) {
        if self.state.heap_changed.is_unset() {
            self.state.heap_changed.set();
        }
        self.state.wakeup.notify_all();
    }

    pub fn prepare_for_graceful_shutdown(&self) {
        self.state.graceful_shutdown.set();
        self.cancel_gc(CancelCause::Shutdown);
        self.state.wakeup.notify_all();
    }

    pub fn in_graceful_shutdown(&self) -> bool {
        self.state.graceful_shutdown.is_set()
    }

    // ------------------------------------------------------------------
    // Waiter notification; control loop only.

    /// Notify explicit/implicit requesters that a cycle finished on their
    /// behalf. Clearing the flags happens-after cycle completion.
    pub(crate) fn notify_gc_waiters(&self) {
        let ml = self.state.gc_waiters.lock();
        self.state.explicit_gc_requested.unset();
        self.state.implicit_gc_requested.unset();
        ml.notify_all();
    }

    /// Notify mutators blocked on allocation failure that GC finished.
    pub(crate) fn notify_alloc_failure_waiters(&self) {
        let ml = self.state.alloc_failure_waiters.lock();
        self.state.alloc_failure_pending.unset();
        ml.notify_all();
    }
}
