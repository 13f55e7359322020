use std::time::Instant;

use super::collaborators::{
    Evacuator, ObjectGraph, ReferenceProcessor, RegionHeap, RootScanner, Safepoint,
};
use super::collector::Collector;
use super::heuristics::Heuristics;
use super::{Cycle, DegenPoint, ObjectRef, PausePhase};

/// Stop-the-world continuation of a cancelled concurrent cycle.
///
/// The arms below form a Duff's-like device: they describe the whole cycle
/// but enter it at whichever phase the concurrent path had reached. Returns
/// false when the resumed cycle itself fails to make progress (a second
/// allocation failure while evacuating); the controller then escalates to a
/// full GC instead of retrying.
pub struct DegeneratedGC<'a> {
    collector: &'a Collector,
    cycle: Cycle,
    degen_point: DegenPoint,
}

impl<'a> DegeneratedGC<'a> {
    pub fn new(collector: &'a Collector, cycle: Cycle, degen_point: DegenPoint) -> Self {
        let degen_point = if degen_point == DegenPoint::Unset {
            DegenPoint::OutsideCycle
        } else {
            degen_point
        };

        Self {
            collector,
            cycle,
            degen_point,
        }
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

        let stopped = collab.safepoint.begin();
        log::debug!(target: "gc-safepoint",
            "stopped the world ({} thread(s)) in {} ms", stopped, start.elapsed().as_millis());
        log::info!(target: "gc",
            "GC({}) Degenerated GC resuming at: {}", id, self.degen_point);

        collector.token().clear();

        if self.degen_point == DegenPoint::OutsideCycle {
            // Degenerating from outside a cycle means the heap is in bad
            // shape with no concurrent progress to salvage; run the whole
            // cycle stop-the-world from scratch.
            let phase = PausePhase::new("Degenerated GC: Reset", id);
            graph.reset_marks();
            collab
                .refs
                .set_soft_reference_policy(self.cycle.clear_soft_refs);
            collector.collect_roots(true);
            collector.set_mark_in_progress(true);
            drop(phase);

            self.degen_point = DegenPoint::Mark;
        }

        if self.degen_point == DegenPoint::Mark {
            // Continue marking handed over from the concurrent phase; its
            // abandoned queue contents are still in the shared injector.
            if collector.is_mark_in_progress() {
                let phase = PausePhase::new("Degenerated GC: Finish Mark", id);
                collector.collect_roots(true);
                collector.concurrent_mark().finish_mark(
                    &mut collector.workers().lock(),
                    graph,
                    collector.satb_log(),
                    collector.token(),
                    nworkers,
                );
                collector.set_mark_in_progress(false);
                drop(phase);
            }

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

            self.degen_point = DegenPoint::Evacuation;
        }

        if self.degen_point == DegenPoint::Evacuation {
            let cset = collector.current_cset().lock();

            if !cset.is_empty() {
                let phase = PausePhase::new("Degenerated GC: Evacuation", id);
                let ok = collab.evac.evacuate(&cset, false, collector.token());
                drop(phase);

                if !ok {
                    log::info!(target: "gc",
                        "GC({}) Degenerated GC made no progress while evacuating", id);
                    collab.safepoint.end();
                    return false;
                }
            }

            self.degen_point = DegenPoint::UpdateRefs;
        }

        if self.degen_point == DegenPoint::UpdateRefs {
            let has_cset = !collector.current_cset().lock().is_empty();

            if has_cset {
                let phase = PausePhase::new("Degenerated GC: Update References", id);
                let ok = collab.evac.update_references(false, collector.token());
                drop(phase);

                if !ok {
                    log::info!(target: "gc",
                        "GC({}) Degenerated GC made no progress while updating references", id);
                    collab.safepoint.end();
                    return false;
                }
            }
        }

        {
            let _hl = collector.heap_lock().lock();
            heap.rebuild_free_set();
        }

        collab.safepoint.end();

        log::info!(target: "gc",
            "GC({}) Degenerated GC done in {} ms ({})",
            id,
            start.elapsed().as_millis(),
            heap.free_set_status()
        );

        true
    }
}
