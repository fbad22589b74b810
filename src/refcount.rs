// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::sync::atomic::{AtomicU32, Ordering};

/* ---------------------------------------------------------------------------------------------- */

/// Explicit "users" count of a table object.
///
/// Memory is kept alive by `Arc`; this count instead tracks who may still *use* the object. Once it
/// reaches zero the object is dead and no new user can revive it, so a concurrent destroyer always
/// wins.
#[derive(Debug)]
pub struct RefCount(AtomicU32);

impl RefCount {
    pub fn new(initial: u32) -> RefCount {
        RefCount(AtomicU32::new(initial))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Takes a new user reference. The caller must already hold one, so the count cannot be zero.
    pub fn inc(&self) {
        let old = self.0.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old != 0, "refcount increment on a dead object");
    }

    /// Takes a new user reference unless the object is already dead.
    pub fn inc_not_zero(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drops a user reference. Returns `true` if this was the last one.
    pub fn dec(&self) -> bool {
        let old = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old != 0, "refcount underflow");
        old == 1
    }

    /// Drops a user reference, except that if exactly `last` references remain the count goes
    /// straight to zero instead. Returns `true` in that case: the caller must destroy the object.
    pub fn dec_or_kill_at(&self, last: u32) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            debug_assert!(current != 0, "refcount underflow");
            let (new, killed) = if current == last {
                (0, true)
            } else {
                (current - 1, false)
            };
            match self.0.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return killed,
                Err(actual) => current = actual,
            }
        }
    }

    /// Kills the object if `expected` is the only remaining reference.
    pub fn dec_if_last(&self, expected: u32) -> bool {
        self.0
            .compare_exchange(expected, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
