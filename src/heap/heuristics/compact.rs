use crate::formatted_size;
use crate::heap::config::{GcConfig, HeuristicKind};
use crate::heap::regions::{CollectionSet, RegionData};

use super::{HeapStats, Heuristics, TriggerState};

/// Footprint-first policy: collect early, pack densely, give memory back to
/// the OS quickly. Config normalization pairs it with short uncommit delays
/// and a low per-region garbage threshold.
pub struct CompactHeuristics {
    state: TriggerState,
}

impl CompactHeuristics {
    pub fn new(config: &GcConfig) -> Self {
        Self {
            state: TriggerState::new(config.adaptive_decay_factor),
        }
    }
}

impl Heuristics for CompactHeuristics {
    fn kind(&self) -> HeuristicKind {
        HeuristicKind::Compact
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
        if config.allocation_threshold > 0
            && heap.bytes_allocated_since_gc_start > threshold_bytes_allocated
        {
            log::info!(target: "gc",
                "Trigger: Allocated since last cycle ({}) is larger than allocation threshold ({})",
                formatted_size(heap.bytes_allocated_since_gc_start),
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
        actual_free: usize,
    ) {
        // Evacuate everything above the (low) garbage threshold, but never
        // promise more live data than the free set can absorb.
        let mut cur_cset = 0usize;

        for r in regions {
            let threshold = r.size * config.garbage_threshold / 100;

            if r.garbage_bytes < threshold {
                break;
            }

            let new_cset = cur_cset + r.live_bytes;
            if new_cset > actual_free {
                break;
            }

            cset.add_region(r);
            cur_cset = new_cset;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_up_to_free_space() {
        let mut config = GcConfig::default();
        config.heuristic = HeuristicKind::Compact;
        config.normalize();
        let mut h = CompactHeuristics::new(&config);

        let mut candidates: Vec<RegionData> = (0..4)
            .map(|index| RegionData {
                index,
                size: 1000,
                live_bytes: 300,
                garbage_bytes: 700,
            })
            .collect();

        // Free space absorbs two regions' live bytes only.
        let mut cset = CollectionSet::new();
        h.choose_collection_set(&config, &mut cset, &mut candidates, 10_000, 700);

        assert_eq!(cset.regions(), &[0, 1]);
    }
}
