//! Multiplexer state locking mechanism
use core::ops;
use tokenlock::UnsyncTokenLock;

use crate::{error::BadContextError, port::PortCpuLock};

pub(crate) struct CpuLockTag<P>(P);

/// The key that "unlocks" [`CpuLockCell`].
pub(crate) type CpuLockToken<P> = tokenlock::UnsyncSingletonToken<CpuLockTag<P>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub(crate) type CpuLockKeyhole<P> = tokenlock::SingletonTokenId<CpuLockTag<P>>;

/// Cell type that can be accessed by [`CpuLockToken`] (which can be obtained
/// by [`lock_cpu`]).
pub(crate) struct CpuLockCell<P, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<P>>);

impl<P, T> CpuLockCell<P, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::new(), x))
    }
}

impl<P, T> ops::Deref for CpuLockCell<P, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<P>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<P, T> ops::DerefMut for CpuLockCell<P, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Attempt to enter a CPU Lock state and get an RAII guard.
/// Return `BadContext` if CPU Lock is already active.
pub(crate) fn lock_cpu<P: PortCpuLock>(port: &P) -> Result<CpuLockGuard<'_, P>, BadContextError> {
    // Safety: `try_enter_cpu_lock` is only meant to be called by the
    //         multiplexer
    if unsafe { port.try_enter_cpu_lock() } {
        // Safety: We just entered a CPU Lock state. This also means there are
        //         no instances of `CpuLockGuard` existing at this point.
        Ok(unsafe { assume_cpu_lock(port) })
    } else {
        Err(BadContextError::BadContext)
    }
}

/// Assume a CPU Lock state and get `CpuLockGuard`.
///
/// # Safety
///
/// The system must be really in a CPU Lock state. There must be no instances of
/// `CpuLockGuard` existing at the point of the call.
unsafe fn assume_cpu_lock<P: PortCpuLock>(port: &P) -> CpuLockGuard<'_, P> {
    debug_assert!(port.is_cpu_lock_active());

    CpuLockGuard {
        port,
        // Safety: There are no other instances of `CpuLockToken`; this is
        //         upheld by the caller.
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// RAII guard for a CPU Lock state.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub(crate) struct CpuLockGuard<'a, P: PortCpuLock> {
    port: &'a P,
    token: CpuLockToken<P>,
}

impl<P: PortCpuLock> CpuLockGuard<'_, P> {
    /// Construct a [`CpuLockTokenRefMut`] by borrowing `self`.
    pub(crate) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, P> {
        self.token.borrow_mut()
    }
}

impl<P: PortCpuLock> Drop for CpuLockGuard<'_, P> {
    fn drop(&mut self) {
        // Safety: CPU Lock is currently active, and it's us (the multiplexer)
        // who are currently controlling the CPU Lock state
        unsafe {
            self.port.leave_cpu_lock();
        }
    }
}

impl<P: PortCpuLock> ops::Deref for CpuLockGuard<'_, P> {
    type Target = CpuLockToken<P>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<P: PortCpuLock> ops::DerefMut for CpuLockGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Borrowed version of [`CpuLockGuard`]. This is equivalent to
/// `&'a mut CpuLockGuard` but does not consume memory.
///
///  - Always prefer this over `&mut CpuLockGuard` in function parameters.
///  - When you pass `&'a mut _` to a function, the compiler automatically
///    reborrows it as `&'b mut _` so that the original `&'a mut _` remains
///    accessible after the function call. This does not happen with
///    `CpuLockTokenRefMut`. You have to call [`borrow_mut`] manually.
///
/// [`borrow_mut`]: tokenlock::UnsyncSingletonTokenRefMut::borrow_mut
pub(crate) type CpuLockTokenRefMut<'a, P> = tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<P>>;
