//! Timer entries
use core::{fmt, marker::PhantomPinned, ptr::NonNull};

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    port::PortCpuLock,
};

/// Timer callback function.
///
/// The callback function is called from the timer interrupt handler with CPU
/// Lock inactive. It must not block.
pub type TimerFn = fn(usize);

/// A callback function and the parameter it's called with.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Callback {
    /// The function called when the timer fires.
    pub func: TimerFn,
    /// The value passed to `func`.
    pub arg: usize,
}

impl Callback {
    #[inline]
    pub(crate) fn call(self) {
        (self.func)(self.arg)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Callback")
            .field("func", &(self.func as *const ()))
            .field("arg", &self.arg)
            .finish()
    }
}

/// A software timer.
///
/// `TimerEntry` is a `!Unpin` type. Once armed by [`TimerMux::set`] (or one of
/// its relatives), the `TimerEntry` must stay in the same memory location
/// until it fires or is removed by [`TimerMux::remove`]. Dropping isn't
/// allowed either. `TimerEntry::drop` can detect the violation of this
/// requirement and cause a panic.
///
/// An entry without a callback is never armed. Setting it is silently
/// ignored.
///
/// [`TimerMux::set`]: crate::TimerMux::set
/// [`TimerMux::remove`]: crate::TimerMux::remove
pub struct TimerEntry<P> {
    /// The entry's position in one of the multiplexer's lists.
    pub(crate) link: CpuLockCell<P, Link<P>>,

    pub(crate) callback: CpuLockCell<P, Option<Callback>>,

    /// Un-implement `Unpin`.
    _pin: PhantomPinned,
}

impl<P> TimerEntry<P> {
    /// Construct a `TimerEntry` with no callback. It must be given one with
    /// [`TimerMux::set_callback`] before it can be armed.
    ///
    /// [`TimerMux::set_callback`]: crate::TimerMux::set_callback
    pub const fn new() -> Self {
        Self {
            link: CpuLockCell::new(Link::UNLINKED),
            callback: CpuLockCell::new(None),
            _pin: PhantomPinned,
        }
    }

    /// Construct a `TimerEntry` that calls `func(arg)` when it fires.
    pub const fn with_callback(func: TimerFn, arg: usize) -> Self {
        Self {
            link: CpuLockCell::new(Link::UNLINKED),
            callback: CpuLockCell::new(Some(Callback { func, arg })),
            _pin: PhantomPinned,
        }
    }
}

impl<P> Default for TimerEntry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Drop for TimerEntry<P> {
    #[inline]
    fn drop(&mut self) {
        if self.link.get_mut().list.is_some() {
            // The entry is still referenced by one of the lists. Dropping
            // `self` now would leave a dangling pointer behind. We can't take
            // CPU Lock here to unlink it, so the owner of `TimerEntry` is
            // responsible for ensuring this does not happen.
            panic!("timer is still linked");
        }
    }
}

impl<P> fmt::Debug for TimerEntry<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerEntry").finish_non_exhaustive()
    }
}

/// Identifies the list a [`TimerEntry`] is currently linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListKind {
    /// Fires within the current period.
    Current,
    /// Fires in the next period. Only used when the counter spans 32 bits.
    Overflow,
    /// Fires in a later period.
    Long,
}

/// The intrusive link embedded in each [`TimerEntry`].
pub(crate) struct Link<P> {
    pub(crate) next: Option<TimerRef<P>>,
    /// The low 32 bits of the expiration time.
    pub(crate) target: u32,
    /// The value of the long counter at the period the entry fires in. Only
    /// meaningful in [`ListKind::Long`].
    pub(crate) long_target: u32,
    /// `None` iff the entry is unlinked.
    pub(crate) list: Option<ListKind>,
}

impl<P> Link<P> {
    pub(crate) const UNLINKED: Self = Self {
        next: None,
        target: 0,
        long_target: 0,
        list: None,
    };
}

impl<P> Clone for Link<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for Link<P> {}

impl<P> fmt::Debug for Link<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Link")
            .field("next", &self.next)
            .field("target", &self.target)
            .field("long_target", &self.long_target)
            .field("list", &self.list)
            .finish()
    }
}

/// A reference to a [`TimerEntry`].
pub(crate) struct TimerRef<P>(NonNull<TimerEntry<P>>);

// Safety: `TimerEntry` is `Send + Sync`
unsafe impl<P> Send for TimerRef<P> {}
unsafe impl<P> Sync for TimerRef<P> {}

impl<P> Clone for TimerRef<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for TimerRef<P> {}

impl<P> PartialEq for TimerRef<P> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<P> Eq for TimerRef<P> {}

impl<P> fmt::Debug for TimerRef<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TimerRef").field(&self.0).finish()
    }
}

impl<P: PortCpuLock> TimerRef<P> {
    /// Construct a `TimerRef` pointing to `timer`.
    ///
    /// # Safety
    ///
    /// `timer` must be pinned. `TimerEntry` is `!Unpin` and `TimerEntry::drop`
    /// ensures it's not dropped while it's still linked, so `*timer` will
    /// never be leaked while being referenced by a list.
    pub(crate) unsafe fn new(timer: &TimerEntry<P>) -> Self {
        Self(NonNull::from(timer))
    }

    #[inline]
    pub(crate) fn entry(&self) -> &TimerEntry<P> {
        // Safety: A `TimerRef` only exists while the pointee is linked or is
        //         being linked, so the pointee must be valid
        unsafe { self.0.as_ref() }
    }

    #[inline]
    pub(crate) fn link(self, lock: CpuLockTokenRefMut<'_, P>) -> Link<P> {
        self.entry().link.get(&*lock)
    }

    #[inline]
    pub(crate) fn set_link(self, mut lock: CpuLockTokenRefMut<'_, P>, link: Link<P>) {
        self.entry().link.replace(&mut *lock, link);
    }

    #[inline]
    pub(crate) fn target(self, lock: CpuLockTokenRefMut<'_, P>) -> u32 {
        self.link(lock).target
    }

    #[inline]
    pub(crate) fn next(self, lock: CpuLockTokenRefMut<'_, P>) -> Option<TimerRef<P>> {
        self.link(lock).next
    }

    #[inline]
    pub(crate) fn set_next(self, mut lock: CpuLockTokenRefMut<'_, P>, next: Option<TimerRef<P>>) {
        self.entry()
            .link
            .replace_with(&mut *lock, |link| Link { next, ..*link });
    }
}
