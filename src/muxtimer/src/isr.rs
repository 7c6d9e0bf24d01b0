//! The interrupt handler
//!
//! Each invocation is in one of two situations:
//!
//!  - The current list is empty and the period has ended (or is about to).
//!    The handler waits for the counter to wrap and *advances* to the next
//!    period: the period counts are incremented, the overflow list becomes the
//!    current list, and the entries of the long list that are due in the new
//!    period are merged into it.
//!
//!  - The head of the current list is about to expire. The handler fires
//!    every entry due within [`PortTimer::ISR_BACKOFF`], busy-waiting for the
//!    residual time of each.
//!
//! Firing callbacks takes time, so the handler may find itself in the next
//! period afterwards. It detects this by comparing the counter against the
//! *period reference*, the counter value read when the compare channel was
//! last programmed (or when the period was advanced). Because that value lies
//! in the current period, reading a smaller value means the counter has
//! wrapped. In that case every entry left in the current list is overdue; they
//! are fired and the period is advanced before looking at the new current
//! list.
//!
//! ```text
//!            reference        head                 PERIOD_END
//!  ─────────────┼─────────────┼────────────────────────┤ wrap ├──────
//!               │◀─ now is ──▶│                        │      │
//!               │ in period   │                        │  now < reference:
//!                                                         the period ended
//! ```
//!
//! [`PortTimer::ISR_BACKOFF`]: crate::PortTimer::ISR_BACKOFF
use core::sync::atomic::Ordering;

use crate::{
    entry::{ListKind, TimerRef},
    klock::{lock_cpu, CpuLockGuard, CpuLockTokenRefMut},
    list, Port, TimerMux,
};

impl<P: Port> TimerMux<P> {
    /// Entries due within this many ticks are fired in the same invocation.
    /// Anything beyond `OVERHEAD` would be missed by the compare channel.
    const ISR_THRESHOLD: u32 = if P::ISR_BACKOFF > P::OVERHEAD {
        P::ISR_BACKOFF
    } else {
        P::OVERHEAD + 1
    };

    /// The timer interrupt handler. The port must call this when the compare
    /// channel fires or when [`PortTimer::pend_interrupt`] was called.
    ///
    /// Callbacks are invoked from this method with CPU Lock inactive.
    ///
    /// [`PortTimer::pend_interrupt`]: crate::PortTimer::pend_interrupt
    pub fn handle_interrupt(&self) {
        // The interrupt handler can't run while CPU Lock is active
        let mut lock = lock_cpu(&self.port).unwrap();

        let mut reference = self.arm_sample.load(Ordering::Relaxed);
        let mut fired = 0usize;

        if self.current.get(&*lock).is_none() {
            let now = self.read_raw();
            if now != Self::PERIOD_END && now >= reference {
                // Nothing is due and the period hasn't ended. This can happen
                // after the head was removed.
                log::trace!("spurious interrupt (now = {now}, reference = {reference})");
                self.arm(lock.borrow_mut(), Self::PERIOD_END, now);
                return;
            }

            // Make sure the counter has arrived in the next period
            while self.read_raw() == Self::PERIOD_END {}
            reference = self.advance_period(lock.borrow_mut());
        }

        loop {
            // Fire the entries that are due or will be soon
            while let Some(head) = self.current.get(&*lock) {
                let target = Self::mask(head.target(lock.borrow_mut()));
                if self.time_left(target, reference) >= Self::ISR_THRESHOLD {
                    break;
                }

                // Make sure we don't fire too early
                while self.time_left(target, reference) != 0 {}

                lock = self.fire(lock, head);
                fired += 1;
            }

            let now = self.read_raw();
            if now < reference {
                // Firing the callbacks took long enough for the period to
                // end. Anything left in the current list was due in it.
                log::debug!("period ended while firing timers");
                while let Some(head) = self.current.get(&*lock) {
                    lock = self.fire(lock, head);
                    fired += 1;
                }
                reference = self.advance_period(lock.borrow_mut());
                continue;
            }

            let next = if let Some(head) = self.current.get(&*lock) {
                Self::mask(head.target(lock.borrow_mut())).wrapping_sub(P::OVERHEAD)
            } else if Self::mask(now.wrapping_add(Self::ISR_THRESHOLD)) < now {
                // The period ends too soon to take another interrupt. Wait
                // for the counter to wrap and advance.
                while self.read_raw() >= now {}
                reference = self.advance_period(lock.borrow_mut());
                continue;
            } else {
                Self::PERIOD_END
            };

            self.arm(lock.borrow_mut(), next, now);
            break;
        }

        log::trace!("interrupt handled, {fired} timer(s) fired");
    }

    /// Get the number of ticks until `target`, or zero if the counter has
    /// passed it.
    ///
    /// Remaining time is measured against the current counter value. Only if
    /// the counter reads below `reference` (i.e., it wrapped into the next
    /// period) is `target` considered passed regardless of its value.
    pub(crate) fn time_left(&self, target: u32, reference: u32) -> u32 {
        let now = self.read_raw();
        if now < reference {
            0
        } else {
            target.saturating_sub(now)
        }
    }

    /// Unlink `head` from the current list and call its callback with CPU
    /// Lock inactive.
    fn fire<'a>(&'a self, mut lock: CpuLockGuard<'a, P>, head: TimerRef<P>) -> CpuLockGuard<'a, P> {
        // Unlink before calling the callback so that the callback can re-arm
        // the entry
        let popped = list::pop_front(lock.borrow_mut(), &self.current);
        debug_assert_eq!(popped, Some(head));

        let callback = head.entry().callback.get(&*lock);
        drop(lock);

        // `head` may be reused or deallocated from this point
        if let Some(callback) = callback {
            callback.call();
        }

        // The callback can't return with CPU Lock active
        lock_cpu(&self.port).unwrap()
    }

    /// Move on to the next period. Returns the new period reference.
    fn advance_period(&self, mut lock: CpuLockTokenRefMut<'_, P>) -> u32 {
        debug_assert!(self.current.get(&*lock).is_none());

        let high = self
            .high_cnt
            .load(Ordering::Relaxed)
            .wrapping_add(Self::PERIOD_STEP);
        let long = self
            .long_cnt
            .load(Ordering::Relaxed)
            .wrapping_add((high == 0) as u32);

        let reference = self.read_raw();
        self.high_cnt.store(high, Ordering::Release);
        self.long_cnt.store(long, Ordering::Release);
        self.arm_sample.store(reference, Ordering::Release);

        // The entries due in the next 32-bit wraparound
        let overflow = self.overflow.replace(&mut *lock, None);
        list::retag(lock.borrow_mut(), overflow, ListKind::Current);

        // The entries of the long list due in this period
        let due = list::take_prefix(lock.borrow_mut(), &self.long, ListKind::Current, |link| {
            let due = link.long_target < long
                || (link.long_target == long && (link.target & P::MASK) <= high);
            if due && (link.long_target, link.target & P::MASK) != (long, high) {
                log::warn!(
                    "a timer due at ({}, {}) missed its period (now in ({long}, {high:#x}))",
                    link.long_target,
                    link.target,
                );
            }
            due
        });

        let current = list::merge(lock.borrow_mut(), overflow, due);
        self.current.replace(&mut *lock, current);

        log::trace!("advanced to period ({long}, {high:#x}), reference = {reference}");

        #[cfg(debug_assertions)]
        self.validate(lock);

        reference
    }
}
