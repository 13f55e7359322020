use std::fmt::Display;

/// Which trigger/collection-set policy drives the collector. A closed set,
/// chosen once at configuration time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeuristicKind {
    Adaptive,
    Static,
    Aggressive,
    Compact,
}

impl HeuristicKind {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "adaptive" => HeuristicKind::Adaptive,
            "static" => HeuristicKind::Static,
            "aggressive" => HeuristicKind::Aggressive,
            "compact" => HeuristicKind::Compact,
            _ => panic!("Unknown GC heuristic: {}", s),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HeuristicKind::Adaptive => "adaptive",
            HeuristicKind::Static => "static",
            HeuristicKind::Aggressive => "aggressive",
            HeuristicKind::Compact => "compact",
        }
    }
}

/// Tunables for the control loop, the trigger heuristics and the pacer.
///
/// Percentages are expressed as integer percent of the relevant capacity.
/// Construct with `GcConfig::default()`, adjust, then let the collector call
/// [`GcConfig::normalize`] to apply heuristic-specific overrides.
#[derive(Clone, Debug)]
pub struct GcConfig {
    pub heuristic: HeuristicKind,

    /// Worker threads used for parallel marking.
    pub parallel_gc_threads: usize,

    /// Control loop sleep bounds and back-off adjustment period, msecs.
    pub control_interval_min: u64,
    pub control_interval_max: u64,
    pub control_interval_adjust_period: u64,

    /// Uncommit committed-but-empty regions after they sat idle this long (msecs).
    pub uncommit: bool,
    pub uncommit_delay: u64,

    /// Start a cycle if none ran for this long (msecs); 0 disables.
    pub guaranteed_gc_interval: u64,

    /// Free-threshold triggers, percent of max capacity.
    pub min_free_threshold: usize,
    pub init_free_threshold: usize,

    /// Cycles to run on the initial threshold while duration history accrues.
    pub learning_steps: usize,

    /// Headroom reserved for allocation spikes, percent of max capacity.
    pub alloc_spike_factor: usize,

    /// Collection-set selection, percent values.
    pub immediate_threshold: usize,
    pub garbage_threshold: usize,
    pub evac_reserve: usize,
    /// Expected copying overhead during evacuation, as a factor.
    pub evac_waste: f64,

    /// Allocation-volume trigger for the static/compact policies, percent.
    pub allocation_threshold: usize,

    /// Degenerated cycles in a row tolerated before escalating to full GC.
    pub full_gc_threshold: usize,

    /// Bound on SATB flush rounds during concurrent marking.
    pub max_satb_flush_rounds: usize,

    /// Class/metadata unloading.
    pub class_unloading: bool,
    pub class_unloading_frequency: usize,

    pub always_clear_soft_refs: bool,
    pub explicit_gc_invokes_concurrent: bool,

    /// Allocation pacing.
    pub pacing: bool,
    pub pacing_max_delay: u64,
    pub pacing_idle_slack: usize,
    pub pacing_cycle_slack: usize,
    pub pacing_surcharge: f64,

    /// Adaptive trigger statistics.
    pub adaptive_sample_frequency_hz: usize,
    pub adaptive_sample_size_seconds: usize,
    pub adaptive_decay_factor: f64,
    pub adaptive_initial_confidence: f64,
    pub adaptive_initial_spike_threshold: f64,

    /// Clamp bounds (in standard deviations) for the adaptive trigger
    /// parameters; the policy cannot drift outside them.
    pub min_confidence: f64,
    pub max_confidence: f64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            heuristic: HeuristicKind::Adaptive,
            parallel_gc_threads: num_cpus::get().max(1),
            control_interval_min: 1,
            control_interval_max: 10,
            control_interval_adjust_period: 1000,
            uncommit: true,
            uncommit_delay: 5 * 60 * 1000,
            guaranteed_gc_interval: 5 * 60 * 1000,
            min_free_threshold: 10,
            init_free_threshold: 70,
            learning_steps: 5,
            alloc_spike_factor: 5,
            immediate_threshold: 90,
            garbage_threshold: 25,
            evac_reserve: 5,
            evac_waste: 1.2,
            allocation_threshold: 0,
            full_gc_threshold: 3,
            max_satb_flush_rounds: 8,
            class_unloading: true,
            class_unloading_frequency: 1,
            always_clear_soft_refs: false,
            explicit_gc_invokes_concurrent: true,
            pacing: true,
            pacing_max_delay: 10,
            pacing_idle_slack: 2,
            pacing_cycle_slack: 10,
            pacing_surcharge: 1.1,
            adaptive_sample_frequency_hz: 10,
            adaptive_sample_size_seconds: 10,
            adaptive_decay_factor: 0.1,
            adaptive_initial_confidence: 1.8,
            adaptive_initial_spike_threshold: 1.8,
            min_confidence: 0.319,
            max_confidence: 3.291,
        }
    }
}

/// Set `slot` to `desired`, logging when that tramples a non-default value
/// the user picked. Returns the effective value.
fn override_option<T>(name: &str, slot: &mut T, desired: T, default: T) -> T
where
    T: PartialEq + Display + Copy,
{
    if *slot != desired {
        if *slot != default {
            log::info!(target: "gc",
                "Heuristic overrides {}: {} -> {}", name, *slot, desired);
        }
        *slot = desired;
    }
    *slot
}

impl GcConfig {
    /// Apply per-heuristic overrides, the way each policy expects to run.
    pub fn normalize(&mut self) {
        let d = GcConfig::default();

        match self.heuristic {
            HeuristicKind::Adaptive => {}
            HeuristicKind::Static => {
                if self.allocation_threshold == 0 {
                    self.allocation_threshold = 10;
                }
            }
            HeuristicKind::Aggressive => {
                // Collect everything, all the time.
                override_option(
                    "garbage_threshold",
                    &mut self.garbage_threshold,
                    0,
                    d.garbage_threshold,
                );
                override_option(
                    "class_unloading_frequency",
                    &mut self.class_unloading_frequency,
                    1,
                    d.class_unloading_frequency,
                );
            }
            HeuristicKind::Compact => {
                override_option("uncommit", &mut self.uncommit, true, d.uncommit);
                override_option(
                    "uncommit_delay",
                    &mut self.uncommit_delay,
                    1000,
                    d.uncommit_delay,
                );
                override_option(
                    "guaranteed_gc_interval",
                    &mut self.guaranteed_gc_interval,
                    30_000,
                    d.guaranteed_gc_interval,
                );
                override_option(
                    "immediate_threshold",
                    &mut self.immediate_threshold,
                    100,
                    d.immediate_threshold,
                );
                override_option(
                    "garbage_threshold",
                    &mut self.garbage_threshold,
                    10,
                    d.garbage_threshold,
                );
                if self.allocation_threshold == 0 {
                    self.allocation_threshold = 10;
                }
            }
        }

        if self.parallel_gc_threads == 0 {
            self.parallel_gc_threads = 1;
        }

        if self.max_satb_flush_rounds == 0 {
            self.max_satb_flush_rounds = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_applies_compact_overrides() {
        let mut config = GcConfig {
            heuristic: HeuristicKind::Compact,
            ..Default::default()
        };
        config.normalize();

        assert!(config.uncommit);
        assert_eq!(config.uncommit_delay, 1000);
        assert_eq!(config.guaranteed_gc_interval, 30_000);
        assert_eq!(config.immediate_threshold, 100);
        assert_eq!(config.allocation_threshold, 10);
    }

    #[test]
    fn normalize_keeps_adaptive_defaults() {
        let mut config = GcConfig::default();
        let before = config.clone();
        config.normalize();

        assert_eq!(config.garbage_threshold, before.garbage_threshold);
        assert_eq!(config.uncommit_delay, before.uncommit_delay);
    }

    #[test]
    fn heuristic_kind_parses() {
        assert_eq!(HeuristicKind::from_str("Adaptive"), HeuristicKind::Adaptive);
        assert_eq!(HeuristicKind::from_str("compact"), HeuristicKind::Compact);
    }
}
