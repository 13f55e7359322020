use std::sync::atomic::{AtomicU8, Ordering};

pub type SharedValue = AtomicU8;

/// Sticky boolean shared between mutator threads and the control loop.
pub struct SharedFlag(SharedValue);

impl SharedFlag {
    pub const fn new() -> Self {
        Self(SharedValue::new(0))
    }

    pub fn set(&self) {
        self.0.store(1, Ordering::Release);
    }

    pub fn unset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) == 1
    }

    pub fn is_unset(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    pub fn set_cond(&self, c: bool) {
        if c {
            self.set();
        } else {
            self.unset();
        }
    }

    /// Returns true only for the caller that actually flipped the flag.
    pub fn try_set(&self) -> bool {
        if self.is_set() {
            return false;
        }

        self.0
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn try_unset(&self) -> bool {
        if self.is_unset() {
            return false;
        }

        self.0
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

/// Small shared enum cell, stored as a u8.
pub struct SharedEnumFlag(SharedValue);

impl SharedEnumFlag {
    pub const fn new() -> Self {
        Self(SharedValue::new(0))
    }

    pub fn set(&self, val: u8) {
        self.0.store(val, Ordering::Release);
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    pub fn cmpxchg(&self, old: u8, new: u8) -> u8 {
        match self
            .0
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(val) => val,
            Err(val) => val,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_set_is_exclusive() {
        let flag = SharedFlag::new();
        assert!(flag.try_set());
        assert!(!flag.try_set());
        assert!(flag.is_set());
        assert!(flag.try_unset());
        assert!(flag.is_unset());
        assert!(!flag.try_unset());
    }
}
