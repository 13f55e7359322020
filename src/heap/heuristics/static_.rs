use crate::formatted_size;
use crate::heap::config::{GcConfig, HeuristicKind};
use crate::heap::regions::{CollectionSet, RegionData};

use super::{HeapStats, Heuristics, TriggerState};

/// Fixed-threshold policy: no learning, no statistics. Triggers on free
/// space and on allocation volume since the last cycle.
pub struct StaticHeuristics {
    state: TriggerState,
}

impl StaticHeuristics {
    pub fn new(config: &GcConfig) -> Self {
        Self {
            state: TriggerState::new(config.adaptive_decay_factor),
        }
    }
}

impl Heuristics for StaticHeuristics {
    fn kind(&self) -> HeuristicKind {
        HeuristicKind::Static
    }

    fn state(&self) -> &TriggerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TriggerState {
        &mut self.state
    }

    fn should_start_gc(&mut self, config: &GcConfig, heap: &HeapStats) -> bool {
        let max_capacity = heap.max_capacity;
        let available = heap.available;

        let min_threshold = max_capacity / 100 * config.min_free_threshold;

        if available < min_threshold {
            log::info!(target: "gc",
                "Trigger: Free ({}) is below minimum threshold ({})",
                formatted_size(available),
                formatted_size(min_threshold)
            );
            return true;
        }

        let threshold_bytes_allocated = max_capacity / 100 * config.allocation_threshold;
        let bytes_allocated = heap.bytes_allocated_since_gc_start;

        if config.allocation_threshold > 0 && bytes_allocated > threshold_bytes_allocated {
            log::info!(target: "gc",
                "Trigger: Allocated since last cycle ({}) is larger than allocation threshold ({})",
                formatted_size(bytes_allocated),
                formatted_size(threshold_bytes_allocated)
            );
            return true;
        }

        self.guaranteed_interval_trigger(config)
    }

    fn choose_collection_set_from_regiondata(
        &mut self,
        config: &GcConfig,
        cset: &mut CollectionSet,
        regions: &[RegionData],
        _capacity: usize,
        _actual_free: usize,
    ) {
        for r in regions {
            let threshold = r.size * config.garbage_threshold / 100;
            if r.garbage_bytes > threshold {
                cset.add_region(r);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_volume_trigger() {
        let mut config = GcConfig::default();
        config.allocation_threshold = 10;
        let mut h = StaticHeuristics::new(&config);

        let quiet = HeapStats {
            max_capacity: 1000,
            soft_max_capacity: 1000,
            available: 500,
            bytes_allocated_since_gc_start: 50,
        };
        assert!(!h.should_start_gc(&config, &quiet));

        let busy = HeapStats {
            bytes_allocated_since_gc_start: 200,
            ..quiet
        };
        assert!(h.should_start_gc(&config, &busy));
    }

    #[test]
    fn selection_takes_only_garbage_rich_regions() {
        let config = GcConfig::default();
        let mut h = StaticHeuristics::new(&config);

        let mut candidates = vec![
            RegionData {
                index: 0,
                size: 1000,
                live_bytes: 900,
                garbage_bytes: 100, // below the 25% threshold
            },
            RegionData {
                index: 1,
                size: 1000,
                live_bytes: 400,
                garbage_bytes: 600,
            },
        ];

        let mut cset = CollectionSet::new();
        h.choose_collection_set(&config, &mut cset, &mut candidates, 10_000, 5_000);

        assert_eq!(cset.regions(), &[1]);
    }
}
