use std::time::Instant;

use crate::formatted_size;

use super::collaborators::{
    Evacuator, ObjectGraph, ReferenceProcessor, RegionHeap, RootScanner, Safepoint,
};
use super::collector::Collector;
use super::heuristics::Heuristics;
use super::mark::MarkResult;
use super::{ConcurrentPhase, Cycle, DegenPoint, ObjectRef, PausePhase};

/// The normal cycle: concurrent marking bracketed by two short pauses, then
/// concurrent evacuation and reference updates. Every checkpoint samples the
/// shared cancellation token; on cancellation the cycle records where it was
/// and returns, leaving the remainder to the degenerated path.
pub struct ConcurrentGC<'a> {
    collector: &'a Collector,
    cycle: Cycle,
    degen_point: DegenPoint,
}

impl<'a> ConcurrentGC<'a> {
    pub fn new(collector: &'a Collector, cycle: Cycle) -> Self {
        Self {
            collector,
            cycle,
            degen_point: DegenPoint::Unset,
        }
    }

    pub fn degen_point(&self) -> DegenPoint {
        self.degen_point
    }

    fn check_cancellation_and_abort(&mut self, point: DegenPoint) -> bool {
        if self.collector.cancelled_gc() {
            self.degen_point = point;
            return true;
        }

        false
    }

    fn nworkers(&self) -> usize {
        self.collector
            .collaborators()
            .heap
            .active_worker_count()
            .clamp(1, self.collector.config().parallel_gc_threads)
    }

    pub fn collect(&mut self) -> bool {
        let start = Instant::now();
        let collector = self.collector;
        let config = collector.config();
        let collab = collector.collaborators();
        let heap = collab.heap.as_ref();
        let graph = collab.graph.as_ref();
        let id = self.cycle.id;
        let nworkers = self.nworkers();

        // Phase 1: init mark, stop-the-world.
        {
            let stopped = collab.safepoint.begin();
            log::debug!(target: "gc-safepoint",
                "stopped the world ({} thread(s)) in {} ms", stopped, start.elapsed().as_millis());

            let phase = PausePhase::new("Init Mark", id);
            graph.reset_marks();
            collab
                .refs
                .set_soft_reference_policy(self.cycle.clear_soft_refs);
            collector.collect_roots(true);
            collector.set_mark_in_progress(true);
            drop(phase);

            collab.safepoint.end();
        }

        if config.pacing {
            collector
                .pacer()
                .setup_for_mark(config, heap.available(), heap.max_capacity());
        }

        // Phase 2: concurrent mark.
        {
            let phase = ConcurrentPhase::new("Marking", id);
            let result = collector.concurrent_mark().mark_concurrent(
                &mut collector.workers().lock(),
                graph,
                collector.satb_log(),
                collector.token(),
                config.max_satb_flush_rounds,
                nworkers,
            );
            drop(phase);

            if result == MarkResult::Cancelled || self.check_cancellation_and_abort(DegenPoint::Mark)
            {
                self.degen_point = DegenPoint::Mark;
                // Partially discovered reference lists are garbage now.
                collab.refs.abandon_partial_discovery();
                return false;
            }
        }

        // Phase 3: final mark, stop-the-world. Flush the remaining log
        // entries, close out marking, and choose the collection set.
        {
            collab.safepoint.begin();
            let phase = PausePhase::new("Final Mark", id);

            collector.collect_roots(true);
            collector.concurrent_mark().finish_mark(
                &mut collector.workers().lock(),
                graph,
                collector.satb_log(),
                collector.token(),
                nworkers,
            );
            collector.set_mark_in_progress(false);

            collab
                .refs
                .process_references(&|obj: ObjectRef| graph.is_marked(obj));

            if self.cycle.unload_classes {
                collab.roots.unload_classes();
            }

            {
                let _hl = collector.heap_lock().lock();
                let mut candidates = heap.region_data();
                let mut cset = collector.current_cset().lock();
                collector.heuristics().lock().choose_collection_set(
                    config,
                    &mut cset,
                    &mut candidates,
                    heap.soft_max_capacity(),
                    heap.available(),
                );
                heap.install_collection_set(&cset);
            }

            drop(phase);
            collab.safepoint.end();
        }

        let cset_empty = collector.current_cset().lock().is_empty();

        if cset_empty {
            // All reclaimable garbage was immediately free-able; there is
            // nothing worth compacting, so skip evacuation and the
            // reference-update pass entirely.
            let immediate = collector.current_cset().lock().immediate_garbage();
            log::info!(target: "gc",
                "GC({}) Immediate garbage: {}, skipping evacuation", id, formatted_size(immediate));
        } else {
            // Phase 4: concurrent evacuation of the chosen set.
            {
                let cset = collector.current_cset().lock();

                if config.pacing {
                    collector
                        .pacer()
                        .setup_for_evac(config, cset.live_bytes(), heap.available());
                }

                let phase = ConcurrentPhase::new("Evacuation", id);
                let ok = collab.evac.evacuate(&cset, true, collector.token());
                drop(phase);

                if !ok || self.collector.cancelled_gc() {
                    self.degen_point = DegenPoint::Evacuation;
                    return false;
                }
            }

            // Phase 5: concurrent update of remaining references.
            {
                if config.pacing {
                    collector
                        .pacer()
                        .setup_for_update_refs(config, heap.used(), heap.available());
                }

                let phase = ConcurrentPhase::new("Update References", id);
                let ok = collab.evac.update_references(true, collector.token());
                drop(phase);

                if !ok || self.check_cancellation_and_abort(DegenPoint::UpdateRefs) {
                    self.degen_point = DegenPoint::UpdateRefs;
                    return false;
                }
            }
        }

        // Close out: rebuild the free set under the heap lock.
        {
            let _hl = collector.heap_lock().lock();
            heap.rebuild_free_set();
        }

        log::info!(target: "gc",
            "GC({}) Concurrent cycle done in {} ms ({})",
            id,
            start.elapsed().as_millis(),
            heap.free_set_status()
        );

        true
    }
}
