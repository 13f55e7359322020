use std::time::{Duration, Instant};

use crate::heap::config::{GcConfig, HeuristicKind};
use crate::heap::regions::{CollectionSet, RegionData};
use crate::utils::number_seq::TruncatedSeq;
use crate::{formatted_size, formatted_sizef};

use super::{HeapStats, Heuristics, TriggerState, CONCURRENT_ADJUST};

/// Which trigger signaled the most recent cycle. The cycle's outcome adjusts
/// the parameter belonging to the trigger that actually fired.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Trigger {
    Spike,
    Rate,
    Other,
}

// Margin/threshold adjustments applied on bad outcomes, in standard
// deviations.
pub const FULL_PENALTY_SD: f64 = 0.2;
pub const DEGENERATE_PENALTY_SD: f64 = 0.1;

// A successful concurrent cycle only adjusts the trigger parameters when the
// end-of-cycle available memory lands outside this z-score band.
pub const LOWEST_EXPECTED_AVAILABLE_AT_END: f64 = -0.5;
pub const HIGHEST_EXPECTED_AVAILABLE_AT_END: f64 = 0.5;

/// Smoothed estimate of the mutator allocation rate and its variance.
///
/// Samples are taken on every trigger check but only recorded once per
/// configured interval; the trigger consumes the moving average of averages,
/// which is far more stable than the raw instantaneous rate.
pub struct AllocationRate {
    last_sample_time: Instant,
    last_sample_value: usize,
    interval: Duration,
    rate: TruncatedSeq,
    rate_avg: TruncatedSeq,
}

impl AllocationRate {
    pub fn new(config: &GcConfig) -> Self {
        let samples = config.adaptive_sample_size_seconds * config.adaptive_sample_frequency_hz;
        Self {
            last_sample_time: Instant::now(),
            last_sample_value: 0,
            interval: Duration::from_millis(
                (1000.0 / config.adaptive_sample_frequency_hz as f64) as u64,
            ),
            rate: TruncatedSeq::new(samples, config.adaptive_decay_factor),
            rate_avg: TruncatedSeq::new(samples, config.adaptive_decay_factor),
        }
    }

    pub fn sample(&mut self, allocated: usize) -> f64 {
        self.sample_at(Instant::now(), allocated)
    }

    /// Explicit-timestamp variant; `allocated` is cumulative bytes since the
    /// last counter reset.
    pub fn sample_at(&mut self, now: Instant, allocated: usize) -> f64 {
        let mut rate = 0.0;

        if now.saturating_duration_since(self.last_sample_time) > self.interval {
            if allocated >= self.last_sample_value {
                rate = self.instantaneous_rate_at(now, allocated);

                self.rate.add(rate);
                self.rate_avg.add(self.rate.avg());
            }

            self.last_sample_time = now;
            self.last_sample_value = allocated;
        }

        rate
    }

    pub fn instantaneous_rate(&self, allocated: usize) -> f64 {
        self.instantaneous_rate_at(Instant::now(), allocated)
    }

    fn instantaneous_rate_at(&self, time: Instant, allocated: usize) -> f64 {
        let allocation_delta = allocated.saturating_sub(self.last_sample_value);
        let time_delta_sec = time
            .saturating_duration_since(self.last_sample_time)
            .as_secs_f64();

        if time_delta_sec > 0.0 {
            allocation_delta as f64 / time_delta_sec
        } else {
            0.0
        }
    }

    /// Rate estimate `sds` standard deviations above the average. Uses the
    /// deviation of the running average rather than of the raw samples; that
    /// is the statistic the average-of-averages sequence actually tracks.
    pub fn upper_bound(&self, sds: f64) -> f64 {
        self.rate.davg() + sds * self.rate_avg.dsd()
    }

    pub fn allocation_counter_reset(&mut self) {
        self.last_sample_time = Instant::now();
        self.last_sample_value = 0;
    }

    pub fn is_spiking(&self, rate: f64, threshold: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }

        let sd = self.rate.sd();

        if sd > 0.0 {
            // The rate may already be in the sample window; in practice the
            // bias does not matter.
            let z_score = (rate - self.rate.avg()) / sd;

            if z_score > threshold {
                return true;
            }
        }

        false
    }
}

fn saturate(value: f64, min: f64, max: f64) -> f64 {
    value.min(max).max(min)
}

/// The default policy: predicts heap depletion from observed cycle durations
/// and allocation rates, and reacts to allocation spikes, adjusting its own
/// confidence after every cycle outcome.
pub struct AdaptiveHeuristics {
    state: TriggerState,

    allocation_rate: AllocationRate,

    /// Margin of error, in standard deviations, added to the average cycle
    /// time and allocation rate. Larger values over-estimate how fast the
    /// mutators deplete the heap and so trigger concurrent cycles earlier.
    margin_of_error_sd: f64,

    /// Allocation-spike sensitivity, in standard deviations over the rate
    /// average. Lower values fire the spike trigger more readily.
    spike_threshold_sd: f64,

    /// Available memory observed at the end of recent cycles.
    available: TruncatedSeq,

    last_trigger: Trigger,
}

impl AdaptiveHeuristics {
    pub fn new(config: &GcConfig) -> Self {
        Self {
            state: TriggerState::new(config.adaptive_decay_factor),
            allocation_rate: AllocationRate::new(config),
            margin_of_error_sd: config.adaptive_initial_confidence,
            spike_threshold_sd: config.adaptive_initial_spike_threshold,
            available: TruncatedSeq::new(10, 0.3),
            last_trigger: Trigger::Other,
        }
    }

    pub fn margin_of_error_sd(&self) -> f64 {
        self.margin_of_error_sd
    }

    pub fn spike_threshold_sd(&self) -> f64 {
        self.spike_threshold_sd
    }

    pub fn allocation_rate(&mut self) -> &mut AllocationRate {
        &mut self.allocation_rate
    }

    fn adjust_margin_of_error(&mut self, config: &GcConfig, amount: f64) {
        self.margin_of_error_sd = saturate(
            self.margin_of_error_sd + amount,
            config.min_confidence,
            config.max_confidence,
        );
    }

    fn adjust_spike_threshold(&mut self, config: &GcConfig, amount: f64) {
        self.spike_threshold_sd = saturate(
            self.spike_threshold_sd + amount,
            config.min_confidence,
            config.max_confidence,
        );
    }

    fn adjust_last_trigger_parameters(&mut self, config: &GcConfig, amount: f64) {
        match self.last_trigger {
            Trigger::Rate => self.adjust_margin_of_error(config, amount),
            Trigger::Spike => self.adjust_spike_threshold(config, amount),
            Trigger::Other => (),
        }
    }
}

impl Heuristics for AdaptiveHeuristics {
    fn kind(&self) -> HeuristicKind {
        HeuristicKind::Adaptive
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
        let allocated = heap.bytes_allocated_since_gc_start;

        let rate = self.allocation_rate.sample(allocated);
        self.last_trigger = Trigger::Other;

        let min_threshold = max_capacity / 100 * config.min_free_threshold;

        if available < min_threshold {
            log::info!(target: "gc", "Trigger: Free ({}) is below minimum threshold ({})",
                formatted_size(available),
                formatted_size(min_threshold)
            );
            return true;
        }

        // While the duration history is still being learned, fall back to a
        // generous free threshold.
        let max_learn = config.learning_steps;
        if self.state.gc_times_learned < max_learn {
            let init_threshold = max_capacity / 100 * config.init_free_threshold;

            if available < init_threshold {
                log::info!(target: "gc",
                    "Trigger: Learning {} of {}. Free ({}) is below initial threshold ({})",
                    self.state.gc_times_learned + 1,
                    max_learn,
                    formatted_size(available),
                    formatted_size(init_threshold)
                );
                return true;
            }
        }

        // Allocation headroom is what remains after reserving room for
        // spikes and paying the accumulated degeneration penalties.
        let mut allocation_headroom = available;
        let spike_headroom = max_capacity / 100 * config.alloc_spike_factor;
        let penalties = max_capacity / 100 * self.state.gc_time_penalties as usize;

        allocation_headroom -= allocation_headroom.min(spike_headroom);
        allocation_headroom -= allocation_headroom.min(penalties);

        let avg_cycle_time = self.state.gc_time_history.davg()
            + self.margin_of_error_sd * self.state.gc_time_history.dsd();
        let avg_alloc_rate = self.allocation_rate.upper_bound(self.margin_of_error_sd);

        if avg_alloc_rate > 0.0 && avg_cycle_time > allocation_headroom as f64 / avg_alloc_rate {
            log::info!(target: "gc",
                "Trigger: Average GC time ({:.2} ms) is above the time for average allocation rate ({}B/s) to deplete free headroom ({}) (margin of error = {:.2})",
                avg_cycle_time * 1000.0,
                formatted_sizef(avg_alloc_rate),
                formatted_size(allocation_headroom),
                self.margin_of_error_sd
            );
            log::info!(target: "gc",
                "Free headroom: {} (free) - {} (spike) - {} (penalties) = {}",
                formatted_size(available),
                formatted_size(spike_headroom),
                formatted_size(penalties),
                formatted_size(allocation_headroom)
            );

            self.last_trigger = Trigger::Rate;
            return true;
        }

        let is_spiking = self.allocation_rate.is_spiking(rate, self.spike_threshold_sd);

        if is_spiking && avg_cycle_time > allocation_headroom as f64 / rate {
            log::info!(target: "gc",
                "Trigger: Average GC time ({:.2} ms) is above the time for instantaneous allocation rate ({}B/s) to deplete free headroom ({}) (spike threshold = {:.2})",
                avg_cycle_time * 1000.0,
                formatted_sizef(rate),
                formatted_size(allocation_headroom),
                self.spike_threshold_sd
            );

            self.last_trigger = Trigger::Spike;
            return true;
        }

        self.guaranteed_interval_trigger(config)
    }

    fn choose_collection_set_from_regiondata(
        &mut self,
        config: &GcConfig,
        cset: &mut CollectionSet,
        regions: &[RegionData],
        capacity: usize,
        actual_free: usize,
    ) {
        // Evacuation budget: the reserve fraction of the heap, discounted by
        // expected copying waste. Selection also honors a minimum amount of
        // garbage to recover when free space is already below target.
        let max_cset =
            (capacity as f64 / 100.0 * config.evac_reserve as f64 / config.evac_waste) as usize;
        let free_target = capacity / 100 * config.min_free_threshold + max_cset;
        let min_garbage = free_target.saturating_sub(actual_free);

        log::info!(target: "gc",
            "Adaptive CSet Selection. Target Free: {}, Actual Free: {}, Max Evacuation: {}, Min Garbage: {}",
            formatted_size(free_target),
            formatted_size(actual_free),
            formatted_size(max_cset),
            formatted_size(min_garbage)
        );

        let mut cur_cset = 0usize;
        let mut cur_garbage = 0usize;

        for r in regions {
            let garbage_threshold = r.size * config.garbage_threshold / 100;

            let new_cset = cur_cset + r.live_bytes;
            if new_cset > max_cset {
                break;
            }

            if cur_garbage > min_garbage && r.garbage_bytes < garbage_threshold {
                break;
            }

            cset.add_region(r);
            cur_cset = new_cset;
            cur_garbage += r.garbage_bytes;
        }
    }

    fn record_cycle_start(&mut self) {
        self.state.cycle_start = Instant::now();
        self.allocation_rate.allocation_counter_reset();
    }

    fn record_success_concurrent(&mut self, config: &GcConfig, available: usize) {
        let t = self.time_since_last_gc().as_secs_f64();
        self.state.degenerated_cycles_in_a_row = 0;
        self.state.successful_cycles_in_a_row += 1;
        self.state.gc_time_history.add(t);
        self.state.gc_times_learned += 1;
        self.state.adjust_penalty(CONCURRENT_ADJUST);

        self.available.add(available as f64);

        let mut z_score = 0.0;
        if self.available.sd() > 0.0 {
            z_score = (available as f64 - self.available.avg()) / self.available.sd();
        }

        log::debug!(target: "gc",
            "Available: {}, z-score={:.3}. Average available: {:.1} +/- {:.1}.",
            formatted_size(available),
            z_score,
            self.available.avg(),
            self.available.sd()
        );

        // A cycle that finished with unusually little memory left should make
        // the triggers fire earlier next time; one that finished with plenty
        // should relax them. The z-score of end-of-cycle availability gives
        // both the direction and a proportional magnitude, and stops moving
        // the parameters once the application stabilizes.
        if z_score < LOWEST_EXPECTED_AVAILABLE_AT_END || z_score > HIGHEST_EXPECTED_AVAILABLE_AT_END
        {
            // Negative z-score means below-average availability, hence the
            // sign flip; division attenuates the adjustment to an order of
            // magnitude below the degenerated/full penalties.
            self.adjust_last_trigger_parameters(config, z_score / -100.0);
        }
    }

    fn record_success_degenerated(&mut self, config: &GcConfig) {
        self.state.degenerated_cycles_in_a_row += 1;
        self.state.successful_cycles_in_a_row = 0;
        self.state.adjust_penalty(super::DEGENERATED_PENALTY);

        // Loosen the trigger that owned the failed cycle.
        self.adjust_last_trigger_parameters(config, DEGENERATE_PENALTY_SD);
    }

    fn record_success_full(&mut self, config: &GcConfig) {
        self.state.degenerated_cycles_in_a_row = 0;
        self.state.successful_cycles_in_a_row += 1;
        self.state.adjust_penalty(super::FULL_PENALTY);

        // Full GC means both triggers badly underestimated pressure.
        self.adjust_margin_of_error(config, FULL_PENALTY_SD);
        self.adjust_spike_threshold(config, FULL_PENALTY_SD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> GcConfig {
        GcConfig::default()
    }

    #[test]
    fn instantaneous_rate_from_two_samples() {
        // Heap with soft-max capacity C: samples (t=0, 0), (t=1s, C/2)
        // give a rate of C/2 bytes per second.
        let c = 1 << 30;
        let config = test_config();
        let mut rate = AllocationRate::new(&config);

        let t0 = Instant::now();
        rate.sample_at(t0 + Duration::from_millis(200), 0);
        let r = rate.sample_at(t0 + Duration::from_millis(1200), c / 2);

        assert!((r - (c / 2) as f64).abs() < (c / 2) as f64 * 0.001);
    }

    #[test]
    fn spike_detection_against_known_distribution() {
        let config = test_config();
        let mut rate = AllocationRate::new(&config);
        let t0 = Instant::now();

        // Cumulative allocation sampled at exact 1s intervals produces
        // rates [100, 100, 100, 100, 200]: mean 120, population sd 40.
        let mut cumulative = 0usize;
        for (i, delta) in [100usize, 100, 100, 100, 200].iter().enumerate() {
            cumulative += delta;
            rate.sample_at(t0 + Duration::from_secs(i as u64 + 1), cumulative);
        }

        // z = (300 - 120) / 40 = 4.5
        assert!(rate.is_spiking(300.0, 3.0));
        // z = (230 - 120) / 40 = 2.75
        assert!(!rate.is_spiking(230.0, 3.0));
        // Non-positive rates never spike.
        assert!(!rate.is_spiking(0.0, 3.0));
    }

    #[test]
    fn trigger_parameters_stay_within_confidence_bounds() {
        let config = test_config();
        let mut h = AdaptiveHeuristics::new(&config);

        // Degenerated/full outcomes push the parameters up; they must clamp.
        for _ in 0..100 {
            h.last_trigger = Trigger::Rate;
            h.record_success_degenerated(&config);
            h.record_success_full(&config);
            assert!(h.margin_of_error_sd() >= config.min_confidence);
            assert!(h.margin_of_error_sd() <= config.max_confidence);
            assert!(h.spike_threshold_sd() >= config.min_confidence);
            assert!(h.spike_threshold_sd() <= config.max_confidence);
        }
        assert_eq!(h.margin_of_error_sd(), config.max_confidence);

        // A long streak of tight concurrent successes pulls them down; the
        // lower clamp must hold as well.
        for i in 0..2000 {
            h.last_trigger = Trigger::Rate;
            // Alternate feast and famine so the z-score keeps leaving the
            // no-adjustment band.
            let available = if i % 2 == 0 { 0 } else { 1 << 30 };
            h.record_success_concurrent(&config, available);
            assert!(h.margin_of_error_sd() >= config.min_confidence);
            assert!(h.margin_of_error_sd() <= config.max_confidence);
            assert!(h.spike_threshold_sd() >= config.min_confidence);
            assert!(h.spike_threshold_sd() <= config.max_confidence);
        }
    }

    #[test]
    fn low_free_memory_triggers_immediately() {
        let config = test_config();
        let mut h = AdaptiveHeuristics::new(&config);

        let heap = HeapStats {
            max_capacity: 1000,
            soft_max_capacity: 1000,
            available: 10, // below min_free_threshold (10% of 1000)
            bytes_allocated_since_gc_start: 0,
        };
        assert!(h.should_start_gc(&config, &heap));
    }

    #[test]
    fn garbage_first_selection_respects_budget() {
        let config = test_config();
        let mut h = AdaptiveHeuristics::new(&config);

        // Garbage [10, 50, 5, 80]; the evacuation budget fits exactly the
        // two fattest regions' live bytes (920 + 950), so indices 3 then 1
        // are chosen, deterministically.
        let mut candidates: Vec<RegionData> = [10usize, 50, 5, 80]
            .iter()
            .enumerate()
            .map(|(index, &garbage_bytes)| RegionData {
                index,
                size: 1000,
                live_bytes: 1000 - garbage_bytes,
                garbage_bytes,
            })
            .collect();

        let capacity = 10_000;
        let actual_free = 500;
        let mut config = config;
        config.evac_reserve = 24; // max_cset = 2400 / 1.2 = 2000 bytes
        config.evac_waste = 1.2;

        let mut cset = CollectionSet::new();
        h.choose_collection_set(&config, &mut cset, &mut candidates, capacity, actual_free);

        assert_eq!(cset.regions(), &[3, 1]);
        assert_eq!(cset.garbage_bytes(), 130);
        assert_eq!(cset.live_bytes(), 1870);
    }

    #[test]
    fn selection_breaks_garbage_ties_by_index() {
        let config = test_config();
        let mut h = AdaptiveHeuristics::new(&config);

        let mut candidates: Vec<RegionData> = (0..4)
            .map(|index| RegionData {
                index,
                size: 1000,
                live_bytes: 100,
                garbage_bytes: 900,
            })
            .collect();
        candidates.reverse(); // input order must not matter

        let mut cset = CollectionSet::new();
        h.choose_collection_set(&config, &mut cset, &mut candidates, 100_000, 50_000);

        assert_eq!(cset.regions(), &[0, 1, 2, 3]);
    }

    #[test]
    fn fully_dead_regions_are_immediate() {
        let config = test_config();
        let mut h = AdaptiveHeuristics::new(&config);

        let mut candidates = vec![
            RegionData {
                index: 0,
                size: 1000,
                live_bytes: 0,
                garbage_bytes: 1000,
            },
            RegionData {
                index: 1,
                size: 1000,
                live_bytes: 0,
                garbage_bytes: 1000,
            },
        ];

        let mut cset = CollectionSet::new();
        h.choose_collection_set(&config, &mut cset, &mut candidates, 10_000, 5_000);

        // All garbage is immediately reclaimable: nothing to evacuate.
        assert!(cset.is_empty());
        assert_eq!(cset.immediate_regions(), &[0, 1]);
        assert_eq!(cset.immediate_garbage(), 2000);
    }
}
