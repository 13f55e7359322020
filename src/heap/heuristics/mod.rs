use std::time::{Duration, Instant};

use crate::formatted_size;
use crate::utils::number_seq::TruncatedSeq;

use super::config::{GcConfig, HeuristicKind};
use super::regions::{CollectionSet, RegionData};

pub mod adaptive;
pub mod aggressive;
pub mod compact;
pub mod static_;

pub const CONCURRENT_ADJUST: isize = -1; // recover from penalties
pub const DEGENERATED_PENALTY: isize = 10; // how much to penalize average GC duration history on Degenerated GC
pub const FULL_PENALTY: isize = 20; // how much to penalize average GC duration history on Full GC

/// Heap numbers the control loop samples before consulting the policy.
#[derive(Clone, Copy, Debug)]
pub struct HeapStats {
    pub max_capacity: usize,
    pub soft_max_capacity: usize,
    pub available: usize,
    pub bytes_allocated_since_gc_start: usize,
}

/// Mutable state every policy variant carries: cycle-duration history,
/// penalty accumulation, and streak counters feeding the escalation decision.
pub struct TriggerState {
    pub degenerated_cycles_in_a_row: usize,
    pub successful_cycles_in_a_row: usize,
    pub cycle_start: Instant,
    pub last_cycle_end: Instant,

    pub gc_times_learned: usize,
    pub gc_time_penalties: isize,
    pub gc_time_history: TruncatedSeq,
}

impl TriggerState {
    pub fn new(decay_factor: f64) -> Self {
        Self {
            degenerated_cycles_in_a_row: 0,
            successful_cycles_in_a_row: 0,
            cycle_start: Instant::now(),
            last_cycle_end: Instant::now(),
            gc_times_learned: 0,
            gc_time_penalties: 0,
            gc_time_history: TruncatedSeq::new(10, decay_factor),
        }
    }

    pub fn adjust_penalty(&mut self, step: isize) {
        self.gc_time_penalties = (self.gc_time_penalties + step).clamp(0, 100);
    }
}

/// Policy interface consulted by the control loop.
///
/// One instance lives for the collector's lifetime; all methods are called
/// from the control-loop thread only.
pub trait Heuristics: Send {
    fn kind(&self) -> HeuristicKind;

    fn state(&self) -> &TriggerState;
    fn state_mut(&mut self) -> &mut TriggerState;

    /// Consulted once per idle loop iteration when no explicit/implicit/
    /// allocation-failure trigger is pending.
    fn should_start_gc(&mut self, config: &GcConfig, heap: &HeapStats) -> bool {
        self.guaranteed_interval_trigger(config)
    }

    /// Consulted only when handling an allocation failure: degenerated if the
    /// recent history says stop-the-world completion is still likely to help,
    /// full otherwise.
    fn should_degenerate_cycle(&self, config: &GcConfig) -> bool {
        self.state().degenerated_cycles_in_a_row <= config.full_gc_threshold
    }

    /// Rank candidates and select a subset; regions arrive pre-sorted in
    /// garbage-first order. Overridden per variant.
    fn choose_collection_set_from_regiondata(
        &mut self,
        config: &GcConfig,
        cset: &mut CollectionSet,
        regions: &[RegionData],
        capacity: usize,
        actual_free: usize,
    );

    /// Common selection skeleton: split off immediate garbage, then hand the
    /// garbage-first-ordered remainder to the variant. When almost all
    /// reclaimable garbage sits in fully dead regions, compaction is not
    /// worth running and the set is left empty.
    fn choose_collection_set(
        &mut self,
        config: &GcConfig,
        cset: &mut CollectionSet,
        candidates: &mut Vec<RegionData>,
        capacity: usize,
        actual_free: usize,
    ) {
        cset.clear();

        let mut total_garbage = 0usize;
        candidates.retain(|r| {
            total_garbage += r.garbage_bytes;
            if !r.has_live() && r.garbage_bytes != 0 {
                cset.add_immediate(r);
                false
            } else {
                r.garbage_bytes != 0
            }
        });

        let immediate_percent = if total_garbage == 0 {
            0
        } else {
            cset.immediate_garbage() * 100 / total_garbage
        };

        if immediate_percent <= config.immediate_threshold {
            // Descending garbage, ascending index on ties, so the choice is
            // deterministic for equal inputs.
            candidates.sort_by(|a, b| {
                b.garbage_bytes
                    .cmp(&a.garbage_bytes)
                    .then(a.index.cmp(&b.index))
            });

            self.choose_collection_set_from_regiondata(config, cset, candidates, capacity, actual_free);
        }

        log::info!(target: "gc",
            "Collectable Garbage: {} immediate, {} in collection set ({} regions)",
            formatted_size(cset.immediate_garbage()),
            formatted_size(cset.garbage_bytes()),
            cset.count()
        );
    }

    fn record_cycle_start(&mut self) {
        self.state_mut().cycle_start = Instant::now();
    }

    fn record_cycle_end(&mut self) {
        self.state_mut().last_cycle_end = Instant::now();
    }

    fn time_since_last_gc(&self) -> Duration {
        self.state().cycle_start.elapsed()
    }

    fn record_success_concurrent(&mut self, _config: &GcConfig, _available: usize) {
        let t = self.time_since_last_gc().as_secs_f64();
        let state = self.state_mut();
        state.degenerated_cycles_in_a_row = 0;
        state.successful_cycles_in_a_row += 1;
        state.gc_time_history.add(t);
        state.gc_times_learned += 1;
        state.adjust_penalty(CONCURRENT_ADJUST);
    }

    fn record_success_degenerated(&mut self, _config: &GcConfig) {
        let state = self.state_mut();
        state.degenerated_cycles_in_a_row += 1;
        state.successful_cycles_in_a_row = 0;
        state.adjust_penalty(DEGENERATED_PENALTY);
    }

    fn record_success_full(&mut self, _config: &GcConfig) {
        let state = self.state_mut();
        state.degenerated_cycles_in_a_row = 0;
        state.successful_cycles_in_a_row += 1;
        state.adjust_penalty(FULL_PENALTY);
    }

    fn record_allocation_failure_gc(&mut self) {}

    /// An outright request usually means external state changed enough that
    /// the learned timings are stale; relearn them.
    fn record_requested_gc(&mut self) {
        self.state_mut().gc_times_learned = 0;
    }

    fn can_unload_classes(&self, config: &GcConfig) -> bool {
        config.class_unloading
    }

    fn should_unload_classes(&self, config: &GcConfig, gc_id: u64, metaspace_oom: bool) -> bool {
        if !self.can_unload_classes(config) {
            return false;
        }

        if metaspace_oom {
            return true;
        }

        let freq = config.class_unloading_frequency as u64;
        freq != 0 && gc_id % freq == 0
    }

    /// Shared periodic trigger: fire if nothing ran for the guaranteed
    /// interval.
    fn guaranteed_interval_trigger(&self, config: &GcConfig) -> bool {
        if config.guaranteed_gc_interval == 0 {
            return false;
        }

        let last_time_ms = self.state().last_cycle_end.elapsed().as_millis();
        if last_time_ms > config.guaranteed_gc_interval as u128 {
            log::info!(target: "gc",
                "Trigger: Time since last GC ({} ms) is larger than guaranteed interval ({} ms)",
                last_time_ms, config.guaranteed_gc_interval);
            return true;
        }

        false
    }
}

/// Configuration-time variant selection; the set is closed.
pub fn new_heuristics(config: &GcConfig) -> Box<dyn Heuristics> {
    match config.heuristic {
        HeuristicKind::Adaptive => Box::new(adaptive::AdaptiveHeuristics::new(config)),
        HeuristicKind::Static => Box::new(static_::StaticHeuristics::new(config)),
        HeuristicKind::Aggressive => Box::new(aggressive::AggressiveHeuristics::new(config)),
        HeuristicKind::Compact => Box::new(compact::CompactHeuristics::new(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn penalties_saturate() {
        let mut state = TriggerState::new(0.1);
        for _ in 0..20 {
            state.adjust_penalty(FULL_PENALTY);
        }
        assert_eq!(state.gc_time_penalties, 100);

        for _ in 0..300 {
            state.adjust_penalty(CONCURRENT_ADJUST);
        }
        assert_eq!(state.gc_time_penalties, 0);
    }

    #[test]
    fn degeneration_streak_drives_full_gc_choice() {
        let config = GcConfig::default();
        let mut h = new_heuristics(&config);

        assert!(h.should_degenerate_cycle(&config));
        for _ in 0..config.full_gc_threshold + 1 {
            h.record_success_degenerated(&config);
        }
        assert!(!h.should_degenerate_cycle(&config));

        h.record_success_full(&config);
        assert!(h.should_degenerate_cycle(&config));
    }

    #[test]
    fn class_unloading_follows_frequency_and_metaspace_pressure() {
        let mut config = GcConfig::default();
        config.class_unloading_frequency = 5;
        let h = new_heuristics(&config);

        assert!(h.should_unload_classes(&config, 5, false));
        assert!(!h.should_unload_classes(&config, 6, false));
        assert!(h.should_unload_classes(&config, 6, true));

        config.class_unloading = false;
        assert!(!h.should_unload_classes(&config, 5, true));
    }
}
