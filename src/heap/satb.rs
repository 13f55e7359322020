use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

use super::shared_vars::SharedFlag;
use super::ObjectRef;

/// Global log of references recorded by mutator write barriers while
/// concurrent marking is in progress (the snapshot-at-the-beginning side of
/// the protocol).
///
/// Mutators enqueue; only the marker drains. The log accepts entries only
/// while marking is active so barriers outside a cycle stay cheap.
pub struct SatbLog {
    buffer: SegQueue<ObjectRef>,
    active: SharedFlag,
    enqueued: AtomicUsize,
}

impl SatbLog {
    pub fn new() -> Self {
        Self {
            buffer: SegQueue::new(),
            active: SharedFlag::new(),
            enqueued: AtomicUsize::new(0),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.set_cond(active);
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.is_set()
    }

    /// Called from the write-barrier slow path.
    #[inline]
    pub fn enqueue(&self, obj: ObjectRef) {
        if self.is_active() {
            self.buffer.push(obj);
            self.enqueued.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Move everything logged so far into `sink`; returns how many entries
    /// were flushed. Entries racing in during the drain are picked up by the
    /// next flush round.
    pub fn drain_into(&self, sink: &mut dyn FnMut(ObjectRef)) -> usize {
        let mut flushed = 0;
        while let Some(obj) = self.buffer.pop() {
            sink(obj);
            flushed += 1;
        }
        flushed
    }

    /// Throw the log away; used by the full-GC path, which re-marks the world
    /// from scratch and has no use for the snapshot.
    pub fn drain_discard(&self) -> usize {
        let mut dropped = 0;
        while self.buffer.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Total entries accepted since startup; diagnostic only.
    pub fn total_enqueued(&self) -> usize {
        self.enqueued.load(Ordering::Relaxed)
    }
}
