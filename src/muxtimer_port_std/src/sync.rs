//! The lock used by the blocking operations
use muxtimer::IsrMutex;
use std::sync::{Condvar, Mutex, PoisonError};

/// A binary lock that blocks the host thread until released by the timer
/// thread.
#[derive(Debug, Default)]
pub struct StdMutex {
    locked: Mutex<bool>,
    cond: Condvar,
}

impl IsrMutex for StdMutex {
    fn new() -> Self {
        Self::default()
    }

    fn lock(&self) {
        // The protected state is a plain flag, so poisoning is harmless
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        while *locked {
            locked = self
                .cond
                .wait(locked)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *locked = true;
    }

    fn unlock(&self) {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        *locked = false;
        self.cond.notify_one();
    }
}
