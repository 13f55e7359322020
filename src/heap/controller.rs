use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::collaborators::{CycleOutcome, RegionHeap, Telemetry};
use super::collector::{Collector, ControllerPhase};
use super::concurrent_gc::ConcurrentGC;
use super::degenerated_gc::DegeneratedGC;
use super::full_gc::FullGC;
use super::heuristics::Heuristics;
use super::shared_vars::SharedFlag;
use super::{Cycle, DegenPoint, GcCause, GcMode};

/// The collector's scheduler and state machine; one iteration = [`step`].
///
/// Kept separate from the thread wrapper so iterations can be driven
/// deterministically, without sleeps, from tests.
///
/// [`step`]: ControlLoop::step
pub struct ControlLoop {
    collector: Arc<Collector>,
    should_terminate: Arc<SharedFlag>,

    /// Where the last cancelled concurrent cycle stopped. Recorded once per
    /// cancellation and consumed by exactly one degenerated cycle; between
    /// those two events nothing may overwrite it.
    degen_point: DegenPoint,

    last_sleep_adjust: Instant,
    last_shrink_time: Instant,
    last_soft_max: usize,
}

impl ControlLoop {
    pub fn new(collector: Arc<Collector>) -> Self {
        let last_soft_max = collector.collaborators().heap.soft_max_capacity();

        Self {
            collector,
            should_terminate: Arc::new(SharedFlag::new()),
            degen_point: DegenPoint::Unset,
            last_sleep_adjust: Instant::now(),
            last_shrink_time: Instant::now(),
            last_soft_max,
        }
    }

    pub fn terminate_handle(&self) -> Arc<SharedFlag> {
        self.should_terminate.clone()
    }

    /// One control-loop iteration, minus the sleep. Returns the mode that
    /// was chosen for this iteration (`None` when the loop stayed idle).
    pub(crate) fn step(&mut self) -> GcMode {
        let collector = self.collector.clone();
        let config = collector.config();
        let state = collector.state();

        // Snapshot the sticky request flags and the allocation volume seen
        // since the previous iteration.
        let allocs_seen = collector.take_allocs_seen();
        let alloc_failure_pending = state.alloc_failure_pending.is_set();
        let explicit_requested = state.explicit_gc_requested.is_set();
        let implicit_requested = state.implicit_gc_requested.is_set();

        // A cancelled cycle with a recorded degeneration point needs the
        // same escalation treatment as an allocation failure, whichever
        // cause cancelled it.
        let degen_pending =
            collector.cancelled_gc() && self.degen_point > DegenPoint::OutsideCycle;

        let mut mode = GcMode::None;
        let mut cause = GcCause::Periodic;

        if alloc_failure_pending || degen_pending {
            cause = GcCause::AllocFailure;
            log::info!(target: "gc", "Trigger: Handle allocation failure");

            let should_degenerate = {
                let mut h = collector.heuristics().lock();
                h.record_allocation_failure_gc();
                h.should_degenerate_cycle(config)
            };

            mode = if should_degenerate {
                GcMode::Degenerated
            } else {
                GcMode::Full
            };
        } else if explicit_requested || implicit_requested {
            cause = if explicit_requested {
                GcCause::Explicit
            } else {
                GcCause::Implicit
            };
            log::info!(target: "gc", "Trigger: {}", cause);

            collector.heuristics().lock().record_requested_gc();

            mode = if config.explicit_gc_invokes_concurrent {
                GcMode::Concurrent
            } else {
                GcMode::Full
            };
        } else {
            let stats = collector.heap_stats();
            if collector.heuristics().lock().should_start_gc(config, &stats) {
                mode = GcMode::Concurrent;
            }
        }

        // Any of the request paths (and the always-clear configuration)
        // makes this cycle treat softly-reachable data as collectible.
        let clear_soft_refs = alloc_failure_pending
            || degen_pending
            || explicit_requested
            || implicit_requested
            || config.always_clear_soft_refs;

        if mode != GcMode::None {
            self.run_cycle(
                mode,
                cause,
                clear_soft_refs,
                alloc_failure_pending || degen_pending,
                explicit_requested || implicit_requested,
            );
        } else {
            // Idle iteration: let the pacer see the allocation volume so
            // mutators are throttled proportionally to heap pressure.
            if config.pacing && allocs_seen > 0 {
                collector.pacer().report_alloc(allocs_seen);
            }

            collector.collaborators().telemetry.update_counters();
        }

        self.service_uncommit_if_due(explicit_requested);

        mode
    }

    fn run_cycle(
        &mut self,
        mode: GcMode,
        cause: GcCause,
        clear_soft_refs: bool,
        alloc_failure_handled: bool,
        request_handled: bool,
    ) {
        let collector = self.collector.clone();
        let config = collector.config();
        let state = collector.state();

        let id = collector.bump_gc_id();
        let unload_classes = collector.heuristics().lock().should_unload_classes(
            config,
            id,
            state.metaspace_oom.is_set(),
        );

        let cycle = Cycle {
            id,
            cause,
            mode,
            clear_soft_refs,
            unload_classes,
        };

        collector.reset_bytes_allocated_since_gc_start();

        {
            let _hl = collector.heap_lock().lock();
            log::info!(target: "gc", "GC({}) {} ({:?}): {}",
                id, cause, mode, collector.collaborators().heap.free_set_status());
        }

        collector.heuristics().lock().record_cycle_start();

        let cycle_start = Instant::now();
        let mut completed_mode = GcMode::None;
        let mut degen_point_used = None;
        let mut upgraded_to_full = false;

        match mode {
            GcMode::Concurrent => {
                collector.set_phase(ControllerPhase::RunningNormal);
                let mut gc = ConcurrentGC::new(&collector, cycle);
                if gc.collect() {
                    let available = collector.collaborators().heap.available();
                    collector
                        .heuristics()
                        .lock()
                        .record_success_concurrent(config, available);
                    completed_mode = GcMode::Concurrent;
                } else {
                    debug_assert!(
                        self.degen_point <= DegenPoint::OutsideCycle,
                        "degeneration point already recorded"
                    );
                    self.degen_point = gc.degen_point();
                    log::info!(target: "gc",
                        "GC({}) Concurrent cycle cancelled at: {}", id, self.degen_point);
                }
            }
            GcMode::Degenerated => {
                collector.set_phase(ControllerPhase::RunningDegenerated);

                // Consume the recorded degeneration point.
                let point = self.degen_point;
                self.degen_point = DegenPoint::OutsideCycle;
                degen_point_used = Some(if point == DegenPoint::Unset {
                    DegenPoint::OutsideCycle
                } else {
                    point
                });

                let mut gc = DegeneratedGC::new(&collector, cycle, point);
                if gc.collect() {
                    collector
                        .heuristics()
                        .lock()
                        .record_success_degenerated(config);
                    completed_mode = GcMode::Degenerated;
                } else {
                    // A second allocation failure while resuming: the only
                    // move left is the full cycle, run before anyone waiting
                    // on this allocation failure is released.
                    log::info!(target: "gc",
                        "GC({}) Degenerated GC upgrading to Full GC", id);
                    upgraded_to_full = true;
                    collector.set_phase(ControllerPhase::RunningFull);
                    FullGC::new(&collector, cycle).collect();
                    collector.heuristics().lock().record_success_full(config);
                    completed_mode = GcMode::Full;
                }
            }
            GcMode::Full => {
                collector.set_phase(ControllerPhase::RunningFull);
                FullGC::new(&collector, cycle).collect();
                collector.heuristics().lock().record_success_full(config);
                completed_mode = GcMode::Full;
            }
            GcMode::None => unreachable!("run_cycle called without a mode"),
        }

        collector.set_phase(ControllerPhase::Idle);

        if completed_mode == GcMode::None {
            // Cancelled mid-flight; the escalation ladder picks this up on
            // the next iteration, and waiters stay blocked until a cycle
            // actually completes.
            return;
        }

        if request_handled {
            collector.notify_gc_waiters();
        }
        if alloc_failure_handled {
            collector.notify_alloc_failure_waiters();
        }

        collector.heuristics().lock().record_cycle_end();

        collector
            .collaborators()
            .telemetry
            .record_cycle(&CycleOutcome {
                id,
                mode: completed_mode,
                cause,
                duration: cycle_start.elapsed(),
                degen_point: degen_point_used,
                upgraded_to_full,
            });

        if cycle.unload_classes {
            state.metaspace_oom.unset();
        }

        if config.pacing {
            collector
                .pacer()
                .setup_for_idle(config, collector.collaborators().heap.max_capacity());
        }

        {
            let _hl = collector.heap_lock().lock();
            log::info!(target: "gc", "GC({}) done: {}",
                id, collector.collaborators().heap.free_set_status());
        }
    }

    fn service_uncommit_if_due(&mut self, explicit_requested: bool) {
        let collector = self.collector.clone();
        let config = collector.config();

        if !config.uncommit {
            return;
        }

        let heap = &collector.collaborators().heap;
        let current = Instant::now();

        let soft_max = heap.soft_max_capacity();
        let soft_max_changed = soft_max != self.last_soft_max;
        self.last_soft_max = soft_max;

        // Poll at a tenth of the uncommit delay so the lag stays small
        // without rescanning regions every iteration.
        let shrink_period = config.uncommit_delay as f64 / 1000.0 / 10.0;

        if explicit_requested
            || soft_max_changed
            || (current - self.last_shrink_time).as_secs_f64() > shrink_period
        {
            // Explicit requests and capacity changes shrink as much as
            // possible right away; the periodic path only touches regions
            // idle past the configured delay.
            let shrink_before = if explicit_requested || soft_max_changed {
                current
            } else {
                match current.checked_sub(Duration::from_millis(config.uncommit_delay)) {
                    Some(t) => t,
                    None => return,
                }
            };
            let shrink_until = heap.min_capacity();

            self.service_uncommit(shrink_before, shrink_until);
            self.last_shrink_time = current;
        }
    }

    fn service_uncommit(&self, shrink_before: Instant, shrink_until: usize) {
        let collector = &self.collector;
        let heap = &collector.collaborators().heap;

        if heap.committed() <= shrink_until {
            return;
        }

        // Scan first: most iterations have no work, and the scan avoids
        // taking the heap lock and spamming logs for nothing.
        let mut has_work = false;
        for i in 0..heap.region_count() {
            if heap.is_empty_committed(i) && heap.empty_time(i) < shrink_before {
                has_work = true;
                break;
            }
        }

        if has_work {
            collector.set_phase(ControllerPhase::Uncommitting);
            let count = heap.uncommit_empty_regions(shrink_before, shrink_until);
            collector.set_phase(ControllerPhase::Idle);

            if count > 0 {
                log::info!(target: "gc", "Uncommitted {} empty regions", count);
            }
        }
    }

    /// The long-lived service loop. Sleeps between iterations with an
    /// exponential back-off while idle; `notify_heap_changed` resets the
    /// back-off and wakes the sleep early.
    pub fn run_service(&mut self) {
        let collector = self.collector.clone();
        let config = collector.config();

        let mut sleep = config.control_interval_min;

        while !collector.in_graceful_shutdown() && !self.should_terminate.is_set() {
            self.step();

            let current = Instant::now();
            if collector.state().heap_changed.try_unset() {
                sleep = config.control_interval_min;
            } else if (current - self.last_sleep_adjust).as_millis() as u64
                > config.control_interval_adjust_period
            {
                self.last_sleep_adjust = current;
                sleep = config.control_interval_max.min(1.max(sleep * 2));
            }

            let mut guard = collector.state().wakeup.lock();
            guard.wait_for(Duration::from_millis(sleep));
        }

        // No further collections will run; release anything still blocked.
        collector.notify_gc_waiters();
        collector.notify_alloc_failure_waiters();
        collector.set_phase(ControllerPhase::ShuttingDown);

        // Keep idling until external teardown stops the thread.
        while !self.should_terminate.is_set() {
            let mut guard = collector.state().wakeup.lock();
            guard.wait_for(Duration::from_millis(10));
        }

        log::debug!(target: "gc", "Controller thread terminated");
    }
}

/// Owns the dedicated control-loop thread.
pub struct ControlThread {
    collector: Arc<Collector>,
    should_terminate: Arc<SharedFlag>,
    handle: Option<JoinHandle<()>>,
}

impl ControlThread {
    pub fn spawn(collector: Arc<Collector>) -> ControlThread {
        let mut control_loop = ControlLoop::new(collector.clone());
        let should_terminate = control_loop.terminate_handle();

        let handle = std::thread::spawn(move || control_loop.run_service());

        ControlThread {
            collector,
            should_terminate,
            handle: Some(handle),
        }
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Request graceful shutdown and join the loop thread.
    pub fn stop(&mut self) {
        self.collector.prepare_for_graceful_shutdown();
        self.should_terminate.set();
        self.collector.state().wakeup.notify_all();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ControlThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}
