//! The timer multiplexer and its scheduling operations
use core::{
    fmt,
    pin::Pin,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{
    clock::Sample,
    entry::{Callback, ListKind, TimerEntry, TimerFn, TimerRef},
    error::{InitError, RemoveTimerError, SetTimerError},
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    list::{self, ListHead},
    Port,
};

#[doc = svgbobdoc::transform!(
/// Multiplexes any number of [`TimerEntry`]s onto the single compare channel
/// provided by `P`.
///
/// Pending entries are kept in three lists:
///
/// <center>
///
/// ```svgbob
///              .------.   .------.   .------.
///  "current"-->| t=40 |-->| t=95 |-->| t=95 |     fire in this period
///              '------'   '------'   '------'
///              .------.
/// "overflow"-->| t=12 |                           fire in the next period
///              '------'                           (32-bit counters only)
///              .------.   .------.
///     "long"-->| 1,7  |-->| 3,2  |                fire in a later period,
///              '------'   '------'                by (long_target, target)
/// ```
///
/// </center>
///
/// The compare channel is always programmed for the head of the current list
/// (minus [`PortTimer::OVERHEAD`]) or, if it's empty, for the last tick of the
/// period, at which point the interrupt handler moves the entries due in the
/// next period into the current list.
///
/// [`PortTimer::OVERHEAD`]: crate::PortTimer::OVERHEAD
)]
pub struct TimerMux<P> {
    pub(crate) port: P,

    /// The bits of the current period covered by [`PortTimer::MASK`].
    ///
    /// [`PortTimer::MASK`]: crate::PortTimer::MASK
    pub(crate) high_cnt: AtomicU32,

    /// The number of times the 32-bit time has wrapped around.
    pub(crate) long_cnt: AtomicU32,

    /// A counter value from the current period, read when the compare
    /// channel was last programmed. Only written with CPU Lock active. The
    /// counter reading below this value means the current period has ended.
    pub(crate) arm_sample: AtomicU32,

    pub(crate) current: ListHead<P>,
    pub(crate) overflow: ListHead<P>,
    pub(crate) long: ListHead<P>,

    initialized: CpuLockCell<P, bool>,
}

impl<P: Port> TimerMux<P> {
    /// Construct a `TimerMux`. The hardware isn't touched until [`Self::init`]
    /// is called.
    ///
    /// Fails at compile time if the port's profile is inconsistent.
    pub const fn new(port: P) -> Self {
        assert!(
            P::OVERHEAD < P::BACKOFF,
            "`OVERHEAD` must be less than `BACKOFF`"
        );
        assert!(
            (!P::MASK) & (!P::MASK).wrapping_add(1) == 0,
            "`MASK` must cover contiguous high-order bits"
        );
        assert!(
            P::BACKOFF < (!P::MASK) >> 1,
            "`BACKOFF` must be less than half a hardware period"
        );

        Self {
            port,
            high_cnt: AtomicU32::new(0),
            long_cnt: AtomicU32::new(0),
            arm_sample: AtomicU32::new(0),
            current: CpuLockCell::new(None),
            overflow: CpuLockCell::new(None),
            long: CpuLockCell::new(None),
            initialized: CpuLockCell::new(false),
        }
    }

    /// Get a reference to the port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Initialize the hardware timer and schedule the first end-of-period
    /// interrupt.
    pub fn init(&self) -> Result<(), InitError> {
        let mut lock = lock_cpu(&self.port)?;

        if self.initialized.replace(&mut *lock, true) {
            return Err(InitError::BadObjectState);
        }

        // Safety: CPU Lock active, and we are the only user of the hardware
        //         timer
        unsafe { self.port.init() };

        let now = self.read_raw();
        self.arm(lock.borrow_mut(), Self::PERIOD_END, now);

        log::debug!(
            "timer multiplexer initialized (mask = {:#010x}, backoff = {}, overhead = {})",
            P::MASK,
            P::BACKOFF,
            P::OVERHEAD,
        );
        Ok(())
    }

    /// Resume the hardware counter.
    pub fn start(&self) {
        // Safety: Only the multiplexer drives the hardware timer
        unsafe { self.port.start() };
    }

    /// Stop the hardware counter. Pending entries don't make progress until
    /// [`Self::start`] is called.
    pub fn stop(&self) {
        // Safety: Only the multiplexer drives the hardware timer
        unsafe { self.port.stop() };
    }

    /// Replace the callback of `timer`. If `timer` is pending, the new callback
    /// is called when it fires.
    pub fn set_callback(
        &self,
        timer: &TimerEntry<P>,
        func: TimerFn,
        arg: usize,
    ) -> Result<(), SetTimerError> {
        let mut lock = lock_cpu(&self.port)?;
        timer
            .callback
            .replace(&mut *lock, Some(Callback { func, arg }));
        Ok(())
    }

    /// Arm `timer` to fire `offset` microseconds from now.
    ///
    /// If `timer` is already pending, it's rescheduled. If `offset` is less
    /// than [`PortTimer::BACKOFF`], this method busy-waits and calls the
    /// callback before returning.
    ///
    /// [`PortTimer::BACKOFF`]: crate::PortTimer::BACKOFF
    pub fn set(&self, timer: Pin<&TimerEntry<P>>, offset: u32) -> Result<(), SetTimerError> {
        self.set_absolute(timer, self.now().wrapping_add(offset))
    }

    /// Arm `timer` to fire `long_offset * 2^32 + offset` microseconds from
    /// now.
    pub fn set64(
        &self,
        timer: Pin<&TimerEntry<P>>,
        offset: u32,
        long_offset: u32,
    ) -> Result<(), SetTimerError> {
        if long_offset == 0 {
            return self.set(timer, offset);
        }

        let mut lock = lock_cpu(&self.port)?;
        if timer.callback.read(&*lock).is_none() {
            log::trace!("set64: {:?} has no callback, ignoring", &*timer);
            return Ok(());
        }

        // Safety: `timer` is pinned
        let timer = unsafe { TimerRef::new(&*timer) };
        self.unlink(lock.borrow_mut(), timer);

        let sample = self.sample();
        let target = sample.now().wrapping_add(offset);
        let long_target = sample
            .long
            .wrapping_add(long_offset)
            .wrapping_add((target < offset) as u32);

        list::insert(
            lock.borrow_mut(),
            &self.long,
            ListKind::Long,
            timer,
            target,
            long_target,
        );
        log::trace!("set64: {timer:?} at ({long_target}, {target})");

        #[cfg(debug_assertions)]
        self.validate(lock.borrow_mut());
        Ok(())
    }

    /// Arm `timer` to fire when the 32-bit time reaches `target`.
    ///
    /// A `target` less than [`PortTimer::BACKOFF`] ahead is busy-waited for
    /// before returning. A `target` in the past is reached only after the
    /// 32-bit time wraps around.
    ///
    /// [`PortTimer::BACKOFF`]: crate::PortTimer::BACKOFF
    pub fn set_absolute(
        &self,
        timer: Pin<&TimerEntry<P>>,
        target: u32,
    ) -> Result<(), SetTimerError> {
        let mut lock = lock_cpu(&self.port)?;
        let Some(callback) = timer.callback.get(&*lock) else {
            log::trace!("set_absolute: {:?} has no callback, ignoring", &*timer);
            return Ok(());
        };

        // Safety: `timer` is pinned
        let timer = unsafe { TimerRef::new(&*timer) };
        self.unlink(lock.borrow_mut(), timer);

        let sample = self.sample();
        if target.wrapping_sub(sample.now()) < P::BACKOFF {
            // Too close for the interrupt to make it in time
            drop(lock);
            self.spin_until(target);
            callback.call();
            return Ok(());
        }

        self.link(lock.borrow_mut(), timer, target, sample);

        #[cfg(debug_assertions)]
        self.validate(lock.borrow_mut());
        Ok(())
    }

    /// Cancel `timer`. Returns `false` if it wasn't pending (e.g., because it
    /// has already fired).
    ///
    /// Once this method returns, the callback of `timer` won't be called
    /// unless it's armed again.
    pub fn remove(&self, timer: &TimerEntry<P>) -> Result<bool, RemoveTimerError> {
        let mut lock = lock_cpu(&self.port)?;

        // Safety: An unlinked `timer` is only compared by address. A linked
        //         `timer` has been pinned when it was armed.
        let timer = unsafe { TimerRef::new(timer) };
        let found = self.unlink(lock.borrow_mut(), timer);

        #[cfg(debug_assertions)]
        self.validate(lock.borrow_mut());
        Ok(found)
    }

    /// Put `timer` in the list appropriate for `target`.
    fn link(
        &self,
        mut lock: CpuLockTokenRefMut<'_, P>,
        timer: TimerRef<P>,
        target: u32,
        sample: Sample,
    ) {
        let now = sample.now();
        let in_this_period = (target & P::MASK) == sample.high && target >= now;

        let (kind, long_target) = if in_this_period {
            if !sample.rollover_pending {
                (ListKind::Current, 0)
            } else if P::MASK == 0 {
                // The interrupt handler hasn't started the period `now`
                // belongs to
                (ListKind::Overflow, 0)
            } else {
                (ListKind::Long, sample.long)
            }
        } else if P::MASK == 0 && !sample.rollover_pending {
            // `target < now`, so it's in the next wraparound
            (ListKind::Overflow, 0)
        } else {
            (ListKind::Long, sample.long.wrapping_add((target < now) as u32))
        };

        let head = self.list_head(kind);
        let is_new_head = list::insert(lock.borrow_mut(), head, kind, timer, target, long_target);
        log::trace!("set: {timer:?} at {target} into {kind:?} (now = {now})");

        if kind == ListKind::Current && is_new_head {
            self.arm(lock, target.wrapping_sub(P::OVERHEAD), sample.raw);
        }
    }

    /// Unlink `timer` from whichever list it's in, reprogramming the compare
    /// channel if it was the head of the current list.
    pub(crate) fn unlink(&self, mut lock: CpuLockTokenRefMut<'_, P>, timer: TimerRef<P>) -> bool {
        let Some(kind) = timer.link(lock.borrow_mut()).list else {
            return false;
        };

        let head = self.list_head(kind);
        let was_head = head.get(&*lock) == Some(timer);
        let found = list::unlink(lock.borrow_mut(), head, timer);
        debug_assert!(found, "{timer:?} is tagged with {kind:?} but isn't in it");

        if was_head && kind == ListKind::Current {
            self.rearm_for_head(lock);
        }
        found
    }

    /// Reprogram the compare channel for the current head after it has
    /// changed outside the interrupt handler.
    fn rearm_for_head(&self, mut lock: CpuLockTokenRefMut<'_, P>) {
        let now = self.read_raw();
        let reference = self.arm_sample.load(Ordering::Relaxed);

        if now < reference {
            // The period has ended; let the interrupt handler sort it out
            self.pend_interrupt();
            return;
        }

        match self.current.get(&*lock) {
            Some(head) => {
                let target = Self::mask(head.target(lock.borrow_mut()));
                if target.saturating_sub(now) > P::OVERHEAD {
                    self.arm(lock, target - P::OVERHEAD, now);
                } else {
                    self.pend_interrupt();
                }
            }
            None => self.arm(lock, Self::PERIOD_END, now),
        }
    }

    /// Program the compare channel for `value`, which was calculated when the
    /// counter read `now`. If the counter has already passed `value`, the
    /// interrupt is raised right away instead.
    pub(crate) fn arm(&self, _lock: CpuLockTokenRefMut<'_, P>, value: u32, now: u32) {
        let value = Self::mask(value);

        // Safety: CPU Lock active
        unsafe { self.port.set_absolute(value) };

        let sample = self.read_raw();

        // A sample taken after the counter wrapped would hide the end of the
        // period. `now` is known to be in the current period.
        let reference = if sample < now { now } else { sample };
        self.arm_sample.store(reference, Ordering::Release);

        if Self::mask(sample.wrapping_sub(now)) >= Self::mask(value.wrapping_sub(now)) {
            log::trace!("compare value {value} passed before it was programmed (now = {sample})");
            self.pend_interrupt();
        }
    }

    fn pend_interrupt(&self) {
        // Safety: Only the multiplexer drives the hardware timer
        unsafe { self.port.pend_interrupt() };
    }

    pub(crate) fn list_head(&self, kind: ListKind) -> &ListHead<P> {
        match kind {
            ListKind::Current => &self.current,
            ListKind::Overflow => &self.overflow,
            ListKind::Long => &self.long,
        }
    }

    /// Check the structural invariants of all lists.
    #[cfg(debug_assertions)]
    pub(crate) fn validate(&self, mut lock: CpuLockTokenRefMut<'_, P>) {
        for kind in [ListKind::Current, ListKind::Overflow, ListKind::Long] {
            list::validate(lock.borrow_mut(), self.list_head(kind), kind);
        }

        if P::MASK != 0 {
            assert!(
                self.overflow.get(&*lock).is_none(),
                "the overflow list is only used with 32-bit counters"
            );
        }
    }
}

impl<P> fmt::Debug for TimerMux<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerMux")
            .field("high_cnt", &self.high_cnt)
            .field("long_cnt", &self.long_cnt)
            .field("arm_sample", &self.arm_sample)
            .finish_non_exhaustive()
    }
}
