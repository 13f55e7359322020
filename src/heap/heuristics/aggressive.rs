use crate::heap::config::{GcConfig, HeuristicKind};
use crate::heap::regions::{CollectionSet, RegionData};

use super::{HeapStats, Heuristics, TriggerState};

/// Stress policy: collect continuously and evacuate everything with any
/// garbage. Useful for shaking out races, not for production throughput.
pub struct AggressiveHeuristics {
    state: TriggerState,
}

impl AggressiveHeuristics {
    pub fn new(config: &GcConfig) -> Self {
        log::info!(target: "gc", "Aggressive heuristics: GC runs back-to-back");
        Self {
            state: TriggerState::new(config.adaptive_decay_factor),
        }
    }
}

impl Heuristics for AggressiveHeuristics {
    fn kind(&self) -> HeuristicKind {
        HeuristicKind::Aggressive
    }

    fn state(&self) -> &TriggerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TriggerState {
        &mut self.state
    }

    fn should_start_gc(&mut self, _config: &GcConfig, _heap: &HeapStats) -> bool {
        true
    }

    fn choose_collection_set_from_regiondata(
        &mut self,
        _config: &GcConfig,
        cset: &mut CollectionSet,
        regions: &[RegionData],
        _capacity: usize,
        _actual_free: usize,
    ) {
        for r in regions {
            if r.garbage_bytes > 0 {
                cset.add_region(r);
            }
        }
    }

    fn should_unload_classes(&self, config: &GcConfig, _gc_id: u64, _metaspace_oom: bool) -> bool {
        self.can_unload_classes(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_starts_and_takes_everything() {
        let config = GcConfig::default();
        let mut h = AggressiveHeuristics::new(&config);

        let heap = HeapStats {
            max_capacity: 1000,
            soft_max_capacity: 1000,
            available: 1000,
            bytes_allocated_since_gc_start: 0,
        };
        assert!(h.should_start_gc(&config, &heap));

        let mut candidates = vec![
            RegionData {
                index: 0,
                size: 1000,
                live_bytes: 999,
                garbage_bytes: 1,
            },
            RegionData {
                index: 1,
                size: 1000,
                live_bytes: 1000,
                garbage_bytes: 0,
            },
        ];
        let mut cset = CollectionSet::new();
        h.choose_collection_set(&config, &mut cset, &mut candidates, 10_000, 5_000);

        assert_eq!(cset.regions(), &[0]);
    }
}
