//! In-memory collaborators used by the engine's own tests: a synthetic object
//! graph, a region-table heap model, a scripted evacuator, and counting stubs
//! for the remaining services.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::cancellation::{CancelCause, CancellationToken};
use super::collaborators::{
    Collaborators, CycleOutcome, Evacuator, ObjectGraph, ReferenceProcessor, RegionHeap,
    RootScanner, Safepoint, Telemetry,
};
use super::regions::{CollectionSet, FreeSetStatus, RegionData};
use super::ObjectRef;

pub struct MockGraph {
    edges: HashMap<ObjectRef, Vec<ObjectRef>>,
    marked: Mutex<HashSet<ObjectRef>>,
    successes: AtomicUsize,
}

impl MockGraph {
    pub fn new() -> Self {
        Self {
            edges: HashMap::new(),
            marked: Mutex::new(HashSet::new()),
            successes: AtomicUsize::new(0),
        }
    }

    pub fn add_edge(&mut self, from: ObjectRef, to: ObjectRef) {
        self.edges.entry(from).or_default().push(to);
        self.edges.entry(to).or_default();
    }

    pub fn try_mark(&self, obj: ObjectRef) -> bool {
        let newly = self.marked.lock().insert(obj);
        if newly {
            self.successes.fetch_add(1, Ordering::Relaxed);
        }
        newly
    }

    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        self.marked.lock().contains(&obj)
    }

    pub fn marked_count(&self) -> usize {
        self.marked.lock().len()
    }

    /// How many `try_mark` calls returned true; equals `marked_count` iff
    /// every object was marked exactly once.
    pub fn mark_attempt_successes(&self) -> usize {
        self.successes.load(Ordering::Relaxed)
    }
}

impl ObjectGraph for MockGraph {
    fn reset_marks(&self) {
        self.marked.lock().clear();
        self.successes.store(0, Ordering::Relaxed);
    }

    fn try_mark(&self, obj: ObjectRef) -> bool {
        MockGraph::try_mark(self, obj)
    }

    fn is_marked(&self, obj: ObjectRef) -> bool {
        MockGraph::is_marked(self, obj)
    }

    fn scan(&self, obj: ObjectRef, sink: &mut dyn FnMut(ObjectRef)) {
        if let Some(outgoing) = self.edges.get(&obj) {
            for r in outgoing {
                sink(*r);
            }
        }
    }
}

#[derive(Clone, Copy)]
pub struct MockRegion {
    pub empty_committed: bool,
    pub empty_since: Instant,
}

pub struct MockHeap {
    pub max_capacity: AtomicUsize,
    pub soft_max_capacity: AtomicUsize,
    pub min_capacity: AtomicUsize,
    pub committed: AtomicUsize,
    pub available: AtomicUsize,
    pub used: AtomicUsize,
    pub regions: Mutex<Vec<MockRegion>>,
    pub region_rows: Mutex<Vec<RegionData>>,
    pub installed_csets: Mutex<Vec<Vec<usize>>>,
    pub rebuilds: AtomicUsize,
    pub uncommits: AtomicUsize,
}

impl MockHeap {
    pub fn with_capacity(max: usize) -> Self {
        Self {
            max_capacity: AtomicUsize::new(max),
            soft_max_capacity: AtomicUsize::new(max),
            min_capacity: AtomicUsize::new(max / 10),
            committed: AtomicUsize::new(max),
            available: AtomicUsize::new(max),
            used: AtomicUsize::new(0),
            regions: Mutex::new(Vec::new()),
            region_rows: Mutex::new(Vec::new()),
            installed_csets: Mutex::new(Vec::new()),
            rebuilds: AtomicUsize::new(0),
            uncommits: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, bytes: usize) {
        self.available.store(bytes, Ordering::Relaxed);
    }

    pub fn set_region_rows(&self, rows: Vec<RegionData>) {
        *self.region_rows.lock() = rows;
    }
}

impl RegionHeap for MockHeap {
    fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    fn min_capacity(&self) -> usize {
        self.min_capacity.load(Ordering::Relaxed)
    }

    fn max_capacity(&self) -> usize {
        self.max_capacity.load(Ordering::Relaxed)
    }

    fn soft_max_capacity(&self) -> usize {
        self.soft_max_capacity.load(Ordering::Relaxed)
    }

    fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    fn active_worker_count(&self) -> usize {
        2
    }

    fn region_data(&self) -> Vec<RegionData> {
        self.region_rows.lock().clone()
    }

    fn install_collection_set(&self, cset: &CollectionSet) {
        self.installed_csets.lock().push(cset.regions().to_vec());
    }

    fn rebuild_free_set(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    fn free_set_status(&self) -> FreeSetStatus {
        FreeSetStatus {
            available: self.available(),
            used: self.used(),
            committed: self.committed(),
        }
    }

    fn is_empty_committed(&self, index: usize) -> bool {
        self.regions
            .lock()
            .get(index)
            .map_or(false, |r| r.empty_committed)
    }

    fn empty_time(&self, index: usize) -> Instant {
        self.regions
            .lock()
            .get(index)
            .map(|r| r.empty_since)
            .unwrap_or_else(Instant::now)
    }

    fn uncommit_empty_regions(&self, shrink_before: Instant, _shrink_until: usize) -> usize {
        let mut count = 0;
        for r in self.regions.lock().iter_mut() {
            if r.empty_committed && r.empty_since < shrink_before {
                r.empty_committed = false;
                count += 1;
            }
        }
        self.uncommits.fetch_add(count, Ordering::Relaxed);
        count
    }
}

pub struct MockRoots {
    pub roots: Mutex<Vec<ObjectRef>>,
    pub class_unloads: AtomicUsize,
}

impl MockRoots {
    pub fn new(roots: Vec<ObjectRef>) -> Self {
        Self {
            roots: Mutex::new(roots),
            class_unloads: AtomicUsize::new(0),
        }
    }
}

impl RootScanner for MockRoots {
    fn scan_roots(&self, _paused: bool, sink: &mut dyn FnMut(ObjectRef)) {
        for r in self.roots.lock().iter() {
            sink(*r);
        }
    }

    fn unload_classes(&self) {
        self.class_unloads.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct MockRefs {
    pub clear_soft: AtomicBool,
    pub processed: AtomicUsize,
    pub abandoned: AtomicUsize,
}

impl MockRefs {
    pub fn new() -> Self {
        Self {
            clear_soft: AtomicBool::new(false),
            processed: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
        }
    }
}

impl ReferenceProcessor for MockRefs {
    fn set_soft_reference_policy(&self, clear_all: bool) {
        self.clear_soft.store(clear_all, Ordering::Relaxed);
    }

    fn process_references(&self, _is_alive: &dyn Fn(ObjectRef) -> bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn abandon_partial_discovery(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }
}

/// Evacuator whose `evacuate`/`update_references` outcomes follow a script.
/// A scripted failure also cancels the token, the way a real evacuation
/// bails out when it runs out of to-space.
pub struct MockEvacuator {
    pub evac_script: Mutex<VecDeque<bool>>,
    pub update_script: Mutex<VecDeque<bool>>,
    pub evacuations: AtomicUsize,
    pub updates: AtomicUsize,
    pub compactions: AtomicUsize,
}

impl MockEvacuator {
    pub fn new() -> Self {
        Self {
            evac_script: Mutex::new(VecDeque::new()),
            update_script: Mutex::new(VecDeque::new()),
            evacuations: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            compactions: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_evacuations(&self, n: usize) {
        let mut script = self.evac_script.lock();
        for _ in 0..n {
            script.push_back(false);
        }
    }

    fn next(script: &Mutex<VecDeque<bool>>) -> bool {
        script.lock().pop_front().unwrap_or(true)
    }
}

impl Evacuator for MockEvacuator {
    fn evacuate(
        &self,
        _cset: &CollectionSet,
        _concurrent: bool,
        token: &CancellationToken,
    ) -> bool {
        self.evacuations.fetch_add(1, Ordering::Relaxed);
        let ok = Self::next(&self.evac_script);
        if !ok {
            token.cancel(CancelCause::AllocFailure);
        }
        ok
    }

    fn update_references(&self, _concurrent: bool, token: &CancellationToken) -> bool {
        self.updates.fetch_add(1, Ordering::Relaxed);
        let ok = Self::next(&self.update_script);
        if !ok {
            token.cancel(CancelCause::AllocFailure);
        }
        ok
    }

    fn mark_compact(&self) -> bool {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        true
    }
}

pub struct MockSafepoint {
    pub pauses: AtomicUsize,
    pub depth: AtomicUsize,
}

impl MockSafepoint {
    pub fn new() -> Self {
        Self {
            pauses: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
        }
    }
}

impl Safepoint for MockSafepoint {
    fn begin(&self) -> usize {
        self.pauses.fetch_add(1, Ordering::Relaxed);
        self.depth.fetch_add(1, Ordering::Relaxed);
        0
    }

    fn end(&self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct MockTelemetry {
    pub outcomes: Mutex<Vec<CycleOutcome>>,
}

impl MockTelemetry {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(Vec::new()),
        }
    }
}

impl Telemetry for MockTelemetry {
    fn record_cycle(&self, outcome: &CycleOutcome) {
        self.outcomes.lock().push(*outcome);
    }
}

/// A fully wired mock world plus typed handles onto the pieces tests poke.
pub struct MockWorld {
    pub heap: Arc<MockHeap>,
    pub graph: Arc<MockGraph>,
    pub roots: Arc<MockRoots>,
    pub refs: Arc<MockRefs>,
    pub evac: Arc<MockEvacuator>,
    pub safepoint: Arc<MockSafepoint>,
    pub telemetry: Arc<MockTelemetry>,
}

impl MockWorld {
    pub fn new(graph: MockGraph, roots: Vec<ObjectRef>, heap_capacity: usize) -> Self {
        Self {
            heap: Arc::new(MockHeap::with_capacity(heap_capacity)),
            graph: Arc::new(graph),
            roots: Arc::new(MockRoots::new(roots)),
            refs: Arc::new(MockRefs::new()),
            evac: Arc::new(MockEvacuator::new()),
            safepoint: Arc::new(MockSafepoint::new()),
            telemetry: Arc::new(MockTelemetry::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            heap: self.heap.clone(),
            graph: self.graph.clone(),
            roots: self.roots.clone(),
            refs: self.refs.clone(),
            evac: self.evac.clone(),
            safepoint: self.safepoint.clone(),
            telemetry: self.telemetry.clone(),
        }
    }
}
