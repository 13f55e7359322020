use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;
use scoped_threadpool::Pool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use super::cancellation::{CancelCause, CancellationToken};
use super::collaborators::ObjectGraph;
use super::satb::SatbLog;
use super::ObjectRef;

/// Termination consensus for the marking workers.
///
/// A worker that runs out of work decrements the shared count and briefly
/// parks; termination is reached only when every worker has decremented to
/// zero at the same time. A worker that finds new work in the meantime
/// re-increments, pulling everyone back into the drain loop.
pub struct Terminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    pub fn try_terminate(&self) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }

        if self.decrease_workers() {
            // reached 0, no need to wait
            return true;
        }

        thread::sleep(Duration::from_micros(1));
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::Relaxed) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Relaxed);

        loop {
            if nworkers == 0 {
                return true;
            }

            let result = self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );

            match result {
                Ok(_) => {
                    // Some peer still had work before we all hit zero; rejoin
                    // the drain loop.
                    return false;
                }

                Err(prev_nworkers) => {
                    nworkers = prev_nworkers;
                }
            }
        }
    }
}

/// Shared portion of the mark queues.
///
/// The per-worker deques are created for each drain pass and die with it; the
/// injector is the part that persists, so work abandoned on cancellation is
/// still there when the degenerated path restarts marking.
pub struct MarkQueueSet {
    injector: Injector<ObjectRef>,
}

impl MarkQueueSet {
    pub fn new() -> MarkQueueSet {
        MarkQueueSet {
            injector: Injector::new(),
        }
    }

    pub fn injector(&self) -> &Injector<ObjectRef> {
        &self.injector
    }

    pub fn is_empty(&self) -> bool {
        self.injector.is_empty()
    }
}

const SEGMENT_SIZE: usize = 64;

/// Private overflow buffer in front of a worker's deque; keeps the hottest
/// entries out of the concurrent structure.
struct Segment {
    data: Vec<ObjectRef>,
}

impl Segment {
    fn new() -> Segment {
        Segment {
            data: Vec::with_capacity(SEGMENT_SIZE),
        }
    }

    fn has_capacity(&self) -> bool {
        self.data.len() < SEGMENT_SIZE
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn push(&mut self, obj: ObjectRef) {
        debug_assert!(self.has_capacity());
        self.data.push(obj);
    }

    fn pop(&mut self) -> Option<ObjectRef> {
        self.data.pop()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// How often a busy worker re-samples the cancellation flag.
const CANCEL_CHECK_STRIDE: usize = 256;

pub struct MarkingTask<'a> {
    task_id: usize,
    local: Segment,
    worker: Worker<ObjectRef>,
    stealers: &'a [Stealer<ObjectRef>],
    injector: &'a Injector<ObjectRef>,
    terminator: &'a Terminator,
    marked: usize,
}

impl<'a> MarkingTask<'a> {
    pub fn new(
        task_id: usize,
        worker: Worker<ObjectRef>,
        stealers: &'a [Stealer<ObjectRef>],
        injector: &'a Injector<ObjectRef>,
        terminator: &'a Terminator,
    ) -> MarkingTask<'a> {
        MarkingTask {
            task_id,
            local: Segment::new(),
            worker,
            stealers,
            injector,
            terminator,
            marked: 0,
        }
    }

    fn pop(&mut self) -> Option<ObjectRef> {
        self.pop_local()
            .or_else(|| self.pop_worker())
            .or_else(|| self.pop_global())
            .or_else(|| self.steal())
    }

    fn pop_local(&mut self) -> Option<ObjectRef> {
        if self.local.is_empty() {
            return None;
        }

        self.local.pop()
    }

    fn pop_worker(&mut self) -> Option<ObjectRef> {
        self.worker.pop()
    }

    fn pop_global(&mut self) -> Option<ObjectRef> {
        loop {
            match self.injector.steal_batch_and_pop(&self.worker) {
                Steal::Empty => break,
                Steal::Success(value) => return Some(value),
                Steal::Retry => continue,
            }
        }

        None
    }

    fn steal(&mut self) -> Option<ObjectRef> {
        if self.stealers.len() == 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, self.stealers.len());

        for _ in 0..2 * self.stealers.len() {
            let mut stealer_id = self.task_id;

            while stealer_id == self.task_id {
                stealer_id = range.sample(&mut rng);
            }

            let stealer = &self.stealers[stealer_id];

            loop {
                match stealer.steal_batch_and_pop(&self.worker) {
                    Steal::Empty => break,
                    Steal::Success(obj) => return Some(obj),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// Periodically shed half of a fat local segment into the injector so
    /// idle peers have something to steal.
    fn defensive_push(&mut self) {
        self.marked += 1;

        if self.marked > 256 {
            if self.local.len() > 4 {
                let target_len = self.local.len() / 2;

                while self.local.len() > target_len {
                    if let Some(val) = self.local.pop() {
                        self.injector.push(val);
                    }
                }
            }

            self.marked = 0;
        }
    }

    fn push(&mut self, obj: ObjectRef) {
        if self.local.has_capacity() {
            self.local.push(obj);
            self.defensive_push();
        } else {
            self.worker.push(obj);
        }
    }

    /// Spill everything still queued back into the shared injector so a
    /// later stop-the-world pass can finish the drain.
    fn abandon(&mut self) {
        while let Some(obj) = self.local.pop() {
            self.injector.push(obj);
        }
        while let Some(obj) = self.worker.pop() {
            self.injector.push(obj);
        }
    }

    pub fn run(&mut self, graph: &dyn ObjectGraph, token: &CancellationToken, cancellable: bool) {
        let mut processed = 0usize;

        loop {
            if cancellable && processed % CANCEL_CHECK_STRIDE == 0 && token.is_cancelled() {
                self.abandon();
                break;
            }

            let obj = if let Some(obj) = self.pop() {
                obj
            } else if cancellable && token.is_cancelled() {
                self.abandon();
                break;
            } else {
                if self.terminator.try_terminate() {
                    break;
                }
                continue;
            };

            processed += 1;

            graph.scan(obj, &mut |referent| {
                if graph.try_mark(referent) {
                    self.push(referent);
                }
            });
        }
    }
}

/// Outcome of a concurrent drain.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MarkResult {
    /// All queues empty and the last SATB flush produced no new work.
    Complete,
    /// The shared token was cancelled (or the round budget ran out, which
    /// cancels it with `CancelCause::MarkBailout`).
    Cancelled,
}

/// Drives the parallel/concurrent tracing of the reachable object graph.
pub struct ConcurrentMark {
    queues: MarkQueueSet,
}

impl ConcurrentMark {
    pub fn new() -> Self {
        Self {
            queues: MarkQueueSet::new(),
        }
    }

    pub fn queues(&self) -> &MarkQueueSet {
        &self.queues
    }

    /// Mark `obj` and queue it for tracing if this is its first visit.
    pub fn seed(&self, graph: &dyn ObjectGraph, obj: ObjectRef) {
        if graph.try_mark(obj) {
            self.queues.injector().push(obj);
        }
    }

    /// One drain-to-termination pass over the queues.
    fn run_pass(
        &self,
        pool: &mut Pool,
        graph: &dyn ObjectGraph,
        token: &CancellationToken,
        cancellable: bool,
        nworkers: usize,
    ) {
        let nworkers = nworkers.max(1);
        let terminator = Terminator::new(nworkers);

        let workers: Vec<Worker<ObjectRef>> =
            (0..nworkers).map(|_| Worker::new_lifo()).collect();
        let stealers: Vec<Stealer<ObjectRef>> = workers.iter().map(|w| w.stealer()).collect();

        // Blocking call; the scope joins every task before returning.
        pool.scoped(|scope| {
            for (task_id, worker) in workers.into_iter().enumerate() {
                let stealers = &stealers;
                let terminator = &terminator;
                let injector = self.queues.injector();

                scope.execute(move || {
                    let mut task =
                        MarkingTask::new(task_id, worker, stealers, injector, terminator);
                    task.run(graph, token, cancellable);
                });
            }
        });
    }

    /// Concurrent marking: drain, flush the write-barrier log, and repeat
    /// until the flush yields no new work. The round budget bounds how long
    /// sustained mutation can keep the loop alive; exhausting it is treated
    /// exactly like a cancellation and forces the degenerated path.
    pub fn mark_concurrent(
        &self,
        pool: &mut Pool,
        graph: &dyn ObjectGraph,
        satb: &SatbLog,
        token: &CancellationToken,
        max_rounds: usize,
        nworkers: usize,
    ) -> MarkResult {
        let mut rounds = 0;

        loop {
            self.run_pass(pool, graph, token, true, nworkers);

            if token.is_cancelled() {
                return MarkResult::Cancelled;
            }

            let mut new_work = 0usize;
            let flushed = satb.drain_into(&mut |obj| {
                if graph.try_mark(obj) {
                    self.queues.injector().push(obj);
                    new_work += 1;
                }
            });

            if new_work == 0 {
                return MarkResult::Complete;
            }

            rounds += 1;
            log::debug!(target: "gc",
                "SATB flush round {}: {} entries, {} new", rounds, flushed, new_work);

            if rounds >= max_rounds {
                log::info!(target: "gc",
                    "Concurrent mark exhausted {} SATB flush rounds, cancelling", max_rounds);
                token.cancel(CancelCause::MarkBailout);
                return MarkResult::Cancelled;
            }
        }
    }

    /// Final drain with the world stopped: one last log flush, then a
    /// non-cancellable pass that is guaranteed to reach the fixed point
    /// because no concurrent mutation can occur.
    pub fn finish_mark(
        &self,
        pool: &mut Pool,
        graph: &dyn ObjectGraph,
        satb: &SatbLog,
        token: &CancellationToken,
        nworkers: usize,
    ) {
        satb.drain_into(&mut |obj| {
            if graph.try_mark(obj) {
                self.queues.injector().push(obj);
            }
        });

        self.run_pass(pool, graph, token, false, nworkers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::mock::MockGraph;
    use std::sync::Arc;

    fn chain_graph(n: usize) -> MockGraph {
        // 0 -> 1 -> 2 -> ... -> n-1
        let mut graph = MockGraph::new();
        for i in 0..n.saturating_sub(1) {
            graph.add_edge(ObjectRef(i), ObjectRef(i + 1));
        }
        graph
    }

    #[test]
    fn drain_reaches_fixed_point_on_static_graph() {
        let graph = {
            let mut g = chain_graph(500);
            // Cross edges exercise the marked-exactly-once path.
            g.add_edge(ObjectRef(0), ObjectRef(250));
            g.add_edge(ObjectRef(100), ObjectRef(400));
            g.add_edge(ObjectRef(400), ObjectRef(100));
            g
        };
        let graph = Arc::new(graph);

        let mut pool = Pool::new(4);
        let satb = SatbLog::new();
        let token = CancellationToken::new();
        let mark = ConcurrentMark::new();

        mark.seed(graph.as_ref(), ObjectRef(0));
        let result =
            mark.mark_concurrent(&mut pool, graph.as_ref(), &satb, &token, 8, 4);

        assert_eq!(result, MarkResult::Complete);
        assert!(mark.queues().is_empty());
        // Every object reachable from 0 is marked exactly once.
        assert_eq!(graph.marked_count(), 500);
        assert_eq!(graph.mark_attempt_successes(), 500);
    }

    #[test]
    fn unreachable_objects_stay_unmarked() {
        let mut g = MockGraph::new();
        g.add_edge(ObjectRef(1), ObjectRef(2));
        g.add_edge(ObjectRef(10), ObjectRef(11));
        let graph = Arc::new(g);

        let mut pool = Pool::new(2);
        let satb = SatbLog::new();
        let token = CancellationToken::new();
        let mark = ConcurrentMark::new();

        mark.seed(graph.as_ref(), ObjectRef(1));
        let result =
            mark.mark_concurrent(&mut pool, graph.as_ref(), &satb, &token, 4, 2);

        assert_eq!(result, MarkResult::Complete);
        assert_eq!(graph.marked_count(), 2);
        assert!(!graph.is_marked(ObjectRef(10)));
        assert!(!graph.is_marked(ObjectRef(11)));
    }

    #[test]
    fn satb_entries_extend_marking() {
        let mut g = MockGraph::new();
        g.add_edge(ObjectRef(1), ObjectRef(2));
        g.add_edge(ObjectRef(50), ObjectRef(51));
        let graph = Arc::new(g);

        let mut pool = Pool::new(2);
        let satb = SatbLog::new();
        satb.set_active(true);
        // A mutator recorded an overwritten reference before marking began.
        satb.enqueue(ObjectRef(50));

        let token = CancellationToken::new();
        let mark = ConcurrentMark::new();
        mark.seed(graph.as_ref(), ObjectRef(1));

        let result =
            mark.mark_concurrent(&mut pool, graph.as_ref(), &satb, &token, 4, 2);

        assert_eq!(result, MarkResult::Complete);
        assert!(graph.is_marked(ObjectRef(50)));
        assert!(graph.is_marked(ObjectRef(51)));
    }

    #[test]
    fn cancelled_mark_spills_work_for_later_drain() {
        let graph = Arc::new(chain_graph(2000));

        let mut pool = Pool::new(2);
        let satb = SatbLog::new();
        let token = CancellationToken::new();
        token.cancel(CancelCause::AllocFailure);

        let mark = ConcurrentMark::new();
        mark.seed(graph.as_ref(), ObjectRef(0));

        let result =
            mark.mark_concurrent(&mut pool, graph.as_ref(), &satb, &token, 4, 2);
        assert_eq!(result, MarkResult::Cancelled);

        // The degenerated path clears the token and finishes the drain.
        token.clear();
        mark.finish_mark(&mut pool, graph.as_ref(), &satb, &token, 2);

        assert!(mark.queues().is_empty());
        assert_eq!(graph.marked_count(), 2000);
    }
}
