use std::time::Instant;

use super::collaborators::{
    Evacuator, ObjectGraph, ReferenceProcessor, RegionHeap, RootScanner, Safepoint,
};
use super::collector::Collector;
use super::{Cycle, ObjectRef, PausePhase};

/// The correctness backstop: one uninterruptible stop-the-world mark-compact.
/// No cancellation checks; it must always be able to reclaim memory no matter
/// what state the concurrent path left behind.
pub struct FullGC<'a> {
    collector: &'a Collector,
    cycle: Cycle,
}

impl<'a> FullGC<'a> {
    pub fn new(collector: &'a Collector, cycle: Cycle) -> Self {
        Self { collector, cycle }
    }

    fn nworkers(&self) -> usize {
        self.collector
            .collaborators()
            .heap
            .active_worker_count()
            .clamp(1, self.collector.config().parallel_gc_threads)
    }

    pub fn collect(&mut self) {
        let start = Instant::now();
        let collector = self.collector;
        let collab = collector.collaborators();
        let heap = collab.heap.as_ref();
        let graph = collab.graph.as_ref();
        let id = self.cycle.id;
        let nworkers = self.nworkers();

        let stopped = collab.safepoint.begin();
        log::debug!(target: "gc-safepoint",
            "stopped the world ({} thread(s)) in {} ms", stopped, start.elapsed().as_millis());

        collector.token().clear();

        // Whatever the concurrent path was doing is void: the world is
        // re-marked from scratch and the snapshot log has no meaning.
        collector.set_mark_in_progress(false);
        collector.satb_log().drain_discard();
        collector.current_cset().lock().clear();

        {
            // Phase 1: mark everything reachable. Full GC always treats
            // softly-reachable data as collectible.
            let phase = PausePhase::new("Full GC: Mark", id);
            collab.refs.set_soft_reference_policy(true);
            graph.reset_marks();
            collector.collect_roots(true);
            collector.concurrent_mark().finish_mark(
                &mut collector.workers().lock(),
                graph,
                collector.satb_log(),
                collector.token(),
                nworkers,
            );
            collab
                .refs
                .process_references(&|obj: ObjectRef| graph.is_marked(obj));

            if self.cycle.unload_classes {
                collab.roots.unload_classes();
            }
            drop(phase);
        }

        {
            // Phase 2-5: compute addresses, adjust pointers, copy objects,
            // rebuild free regions; one opaque collaborator pass.
            let phase = PausePhase::new("Full GC: Compact", id);
            let progress = collab.evac.mark_compact();
            drop(phase);

            if !progress {
                // No fallback remains below this one.
                log::error!(target: "gc",
                    "GC({}) Full GC reclaimed no memory; collector cannot make progress", id);
                panic!("Out of memory during Full GC");
            }
        }

        {
            let _hl = collector.heap_lock().lock();
            heap.rebuild_free_set();
        }

        collab.safepoint.end();

        log::info!(target: "gc",
            "GC({}) Full GC done in {} ms ({})",
            id,
            start.elapsed().as_millis(),
            heap.free_set_status()
        );
    }
}
