// SPDX-License-Identifier: MIT OR Apache-2.0

//! A mutex whose `lock` panics instead of returning an error on poison.
//!
//! Every critical section in this crate either completes or unwinds the whole process, so lock
//! holders never have to reason about a half-updated hwpt device list or IOAS hwpt list.

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::{self, Debug};
use std::sync::{Mutex as StdMutex, MutexGuard};

/* ---------------------------------------------------------------------------------------------- */

#[derive(Default)]
pub struct Mutex<T: ?Sized> {
    std: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Mutex<T> {
        Mutex {
            std: StdMutex::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<T> {
        match self.std.lock() {
            Ok(guard) => guard,
            Err(_) => panic!("mutex is poisoned"),
        }
    }
}

impl<T: ?Sized + Debug> Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.std, f)
    }
}

/* ---------------------------------------------------------------------------------------------- */
