use std::sync::atomic::{AtomicIsize, Ordering};
use std::time::{Duration, Instant};

use atomic::Atomic;

use crate::formatted_size;
use crate::sync::Monitor;
use crate::utils::number_seq::TruncatedSeq;

use super::config::GcConfig;
use super::shared_vars::SharedFlag;

/// Allocation pacing: tax-and-spend.
///
/// GC phases provide credit proportional to their progress, allocating
/// threads spend it, and a thread whose claim cannot be covered stalls for a
/// bounded time instead of sprinting ahead of the collector.
pub struct Pacer {
    progress_history: Monitor<TruncatedSeq>,
    wait_monitor: Monitor<()>,
    need_notify_waiters: SharedFlag,
    epoch: AtomicIsize,
    tax_rate: Atomic<f64>,
    budget: AtomicIsize,
    progress: AtomicIsize,
}

impl Pacer {
    pub fn new() -> Self {
        Self {
            progress_history: Monitor::new(TruncatedSeq::new(5, 0.3)),
            wait_monitor: Monitor::new(()),
            need_notify_waiters: SharedFlag::new(),
            epoch: AtomicIsize::new(0),
            tax_rate: Atomic::new(0.0),
            budget: AtomicIsize::new(0),
            progress: AtomicIsize::new(-1),
        }
    }

    fn report_progress_internal(&self, bytes: usize) {
        self.progress.fetch_add(bytes as isize, Ordering::Relaxed);
    }

    fn add_budget(&self, bytes: usize) {
        let inc = bytes as isize;
        let new_budget = self.budget.fetch_add(inc, Ordering::Relaxed) + inc;

        // Replenished past zero: all pacing claims are satisfied. No locks
        // here; this runs on hot paths.
        if new_budget >= 0 && (new_budget - inc) < 0 {
            self.need_notify_waiters.try_set();
        }
    }

    pub fn report_alloc(&self, bytes: usize) {
        self.add_budget(bytes);
    }

    pub fn report_mark(&self, bytes: usize) {
        self.add_budget(bytes);
        self.report_progress_internal(bytes);
    }

    pub fn report_evac(&self, bytes: usize) {
        self.add_budget(bytes);
        self.report_progress_internal(bytes);
    }

    pub fn report_update_refs(&self, bytes: usize) {
        self.add_budget(bytes);
    }

    pub fn epoch(&self) -> isize {
        self.epoch.load(Ordering::Relaxed)
    }

    fn update_and_get_progress_history(&self, max_capacity: usize) -> usize {
        if self.progress.load(Ordering::Relaxed) < 0 {
            self.progress.store(0, Ordering::Relaxed);
            (max_capacity as f64 * 0.1) as usize
        } else {
            let mut history = self.progress_history.lock();
            history.add(self.progress.load(Ordering::Relaxed) as f64);
            self.progress.store(0, Ordering::Relaxed);
            history.avg() as usize
        }
    }

    fn restart_with(&self, non_taxable_bytes: usize, tax_rate: f64) {
        let initial = (non_taxable_bytes as f64 * tax_rate) as isize;
        self.budget.swap(initial, Ordering::Relaxed);
        self.tax_rate.store(tax_rate, Ordering::Relaxed);
        self.epoch.fetch_add(1, Ordering::Relaxed);

        self.need_notify_waiters.try_set();
    }

    pub fn setup_for_mark(&self, config: &GcConfig, free: usize, max_capacity: usize) {
        let live = self.update_and_get_progress_history(max_capacity);

        let non_taxable = free * config.pacing_cycle_slack / 100;
        let taxable = (free - non_taxable).max(1);

        let tax = (live as f64 / taxable as f64).max(1.0) * config.pacing_surcharge;

        self.restart_with(non_taxable, tax);

        log::info!(target: "gc",
            "Pacer for Mark. Expected Live: {}, Free: {}, Non-Taxable: {}, Alloc Tax Rate: {:.1}",
            formatted_size(live),
            formatted_size(free),
            formatted_size(non_taxable),
            tax
        );
    }

    pub fn setup_for_evac(&self, config: &GcConfig, to_evacuate: usize, free: usize) {
        let non_taxable = free * config.pacing_cycle_slack / 100;
        let taxable = (free - non_taxable).max(1);

        let tax = (to_evacuate as f64 / taxable as f64).max(1.0) * config.pacing_surcharge;

        self.restart_with(non_taxable, tax);

        log::info!(target: "gc",
            "Pacer for Evacuation. To-Evacuate: {}, Free: {}, Non-Taxable: {}, Alloc Tax Rate: {:.1}",
            formatted_size(to_evacuate),
            formatted_size(free),
            formatted_size(non_taxable),
            tax
        );
    }

    pub fn setup_for_update_refs(&self, config: &GcConfig, used: usize, free: usize) {
        let non_taxable = free * config.pacing_cycle_slack / 100;
        let taxable = (free - non_taxable).max(1);

        let tax = (used as f64 / taxable as f64).max(1.0) * config.pacing_surcharge;

        self.restart_with(non_taxable, tax);

        log::info!(target: "gc",
            "Pacer for Update Refs. Used: {}, Free: {}, Non-Taxable: {}, Alloc Tax Rate: {:.1}",
            formatted_size(used),
            formatted_size(free),
            formatted_size(non_taxable),
            tax
        );
    }

    pub fn setup_for_idle(&self, config: &GcConfig, max_capacity: usize) {
        let initial = max_capacity / 100 * config.pacing_idle_slack;
        let tax = 1.0;

        self.restart_with(initial, tax);

        log::info!(target: "gc",
            "Pacer for Idle. Initial: {}, Alloc Tax Rate: {:.1}",
            formatted_size(initial),
            tax
        );
    }

    pub fn claim_for_alloc(&self, bytes: usize, force: bool) -> bool {
        let tax = 1.0f64.max(bytes as f64 * self.tax_rate.load(Ordering::Relaxed)) as isize;

        let mut cur;
        loop {
            cur = self.budget.load(Ordering::Relaxed);

            if cur < tax && !force {
                return false;
            }

            match self.budget.compare_exchange_weak(
                cur,
                cur - tax,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break true,
                Err(_) => continue,
            }
        }
    }

    /// Allocation slow path: claim the tax, stalling for up to the
    /// configured delay when the budget is exhausted. `epoch` is the value
    /// observed when the allocation started; a pacer restarted since then
    /// no longer owes this claim anything.
    pub fn pace_for_alloc(&self, config: &GcConfig, epoch: isize, bytes: usize) {
        if self.epoch.load(Ordering::Relaxed) != epoch {
            return;
        }

        if self.claim_for_alloc(bytes, false) {
            return;
        }

        // Forcefully claim: the budget may go negative, and GC progress
        // replenishes it for this and subsequent allocations. Wait a bounded
        // time for the claim to be matched.
        self.claim_for_alloc(bytes, true);

        let start = Instant::now();
        let max = Duration::from_millis(config.pacing_max_delay);
        let mut total = Duration::from_millis(0);

        loop {
            let cur = if max > total {
                max - total
            } else {
                Duration::from_millis(1)
            };

            self.wait(cur);
            total = start.elapsed();

            if total > max || self.budget.load(Ordering::Relaxed) >= 0 {
                // Either the local time budget is spent (allocate anyway and
                // possibly trip a degenerated cycle later), or the claim was
                // replenished.
                break;
            }
        }
    }

    pub fn notify_waiters(&self) {
        if self.need_notify_waiters.try_unset() {
            self.wait_monitor.notify_all();
        }
    }

    fn wait(&self, time: Duration) {
        let mut locker = self.wait_monitor.lock();
        locker.wait_for(time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_spend_the_budget() {
        let config = GcConfig::default();
        let pacer = Pacer::new();
        pacer.setup_for_idle(&config, 1000);

        // Idle budget: 2% of capacity = 20 bytes at tax rate 1.0.
        assert!(pacer.claim_for_alloc(10, false));
        assert!(pacer.claim_for_alloc(10, false));
        assert!(!pacer.claim_for_alloc(10, false));

        // GC progress replenishes.
        pacer.report_mark(50);
        assert!(pacer.claim_for_alloc(10, false));
    }

    #[test]
    fn forced_claim_goes_negative() {
        let config = GcConfig::default();
        let pacer = Pacer::new();
        pacer.setup_for_idle(&config, 100);

        assert!(pacer.claim_for_alloc(1000, true));
        assert!(!pacer.claim_for_alloc(1, false));
    }

    #[test]
    fn epoch_change_skips_stale_pacing() {
        let config = GcConfig::default();
        let pacer = Pacer::new();
        pacer.setup_for_idle(&config, 100);
        let epoch = pacer.epoch();

        pacer.setup_for_idle(&config, 100);
        // Stale epoch: returns immediately without claiming.
        pacer.pace_for_alloc(&config, epoch, 1_000_000);
        assert!(pacer.claim_for_alloc(1, false));
    }
}
