//! Extends the hardware counter to 32 and 64 bits
//!
//! The hardware counter is `W` bits wide. The 32-bit logical time is the
//! counter value with the *high count* (the accumulated periods, always a
//! multiple of `2^W`) filling the bits covered by [`PortTimer::MASK`]. The
//! *long count* counts wraparounds of the 32-bit logical time and forms the
//! upper half of [`TimerMux::now64`].
//!
//! ```text
//!  63               32 31         W W-1           0
//! ┌───────────────────┬────────────┬──────────────┐
//! │     long count    │ high count │ raw counter  │
//! └───────────────────┴────────────┴──────────────┘
//!                      ╰── MASK ──╯
//! ```
//!
//! Both counts are only advanced by the interrupt handler at the end of each
//! period. Between the moment the counter wraps and the moment the handler
//! gets to run, the counts lag behind. [`Sample`] detects this by comparing
//! the counter against the value it had when the compare channel was last
//! programmed, which is always within the current period.
//!
//! [`PortTimer::MASK`]: crate::PortTimer::MASK
use core::sync::atomic::Ordering;

use crate::{Port, TimerMux};

/// A consistent snapshot of the hardware counter and the period counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sample {
    pub(crate) raw: u32,
    /// The high count of the period `raw` belongs to.
    pub(crate) high: u32,
    /// The long count of the period `raw` belongs to.
    pub(crate) long: u32,
    /// The counter has wrapped but the interrupt handler hasn't advanced the
    /// period yet. `high` and `long` are already corrected.
    pub(crate) rollover_pending: bool,
}

impl Sample {
    #[inline]
    pub(crate) fn now(&self) -> u32 {
        self.raw | self.high
    }

    #[inline]
    pub(crate) fn now64(&self) -> u64 {
        ((self.long as u64) << 32) | self.now() as u64
    }
}

/// Calendar time derived from [`TimerMux::now64`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timex {
    pub seconds: u32,
    pub microseconds: u32,
}

impl Timex {
    pub const fn from_micros(micros: u64) -> Self {
        Self {
            seconds: (micros / 1_000_000) as u32,
            microseconds: (micros % 1_000_000) as u32,
        }
    }
}

impl<P: Port> TimerMux<P> {
    /// The last tick of a period.
    pub(crate) const PERIOD_END: u32 = !P::MASK;

    /// The amount added to the high count by each period. Zero if the counter
    /// spans 32 bits.
    pub(crate) const PERIOD_STEP: u32 = (!P::MASK).wrapping_add(1);

    const HALF_PERIOD: u32 = (!P::MASK) >> 1;

    #[inline]
    pub(crate) const fn mask(value: u32) -> u32 {
        value & !P::MASK
    }

    #[inline]
    pub(crate) fn read_raw(&self) -> u32 {
        // Safety: `read` is callable from any context
        unsafe { self.port.read() }
    }

    /// Take a consistent snapshot of the counter and the period counts.
    ///
    /// The counts are read before and after the counter and the snapshot is
    /// retried if the interrupt handler changed them in between.
    pub(crate) fn sample(&self) -> Sample {
        loop {
            let high = self.high_cnt.load(Ordering::Acquire);
            let long = self.long_cnt.load(Ordering::Acquire);
            let reference = self.arm_sample.load(Ordering::Acquire);
            let raw = self.read_raw();

            if high != self.high_cnt.load(Ordering::Acquire)
                || long != self.long_cnt.load(Ordering::Acquire)
                || reference != self.arm_sample.load(Ordering::Acquire)
            {
                continue;
            }

            if raw >= reference {
                return Sample {
                    raw,
                    high,
                    long,
                    rollover_pending: false,
                };
            }

            let next_high = high.wrapping_add(Self::PERIOD_STEP);
            return Sample {
                raw,
                high: next_high,
                long: long.wrapping_add((next_high == 0) as u32),
                rollover_pending: true,
            };
        }
    }

    /// Get the current 32-bit time in microseconds.
    pub fn now(&self) -> u32 {
        self.sample().now()
    }

    /// Get the current 64-bit time in microseconds.
    ///
    /// The returned value never decreases.
    pub fn now64(&self) -> u64 {
        self.sample().now64()
    }

    /// Get the current time as seconds and microseconds.
    pub fn now_timex(&self) -> Timex {
        Timex::from_micros(self.now64())
    }

    /// Busy-wait for `offset` microseconds.
    ///
    /// `offset` must be less than the length of a hardware period.
    pub fn spin(&self, offset: u32) {
        let start = self.read_raw();
        while Self::mask(self.read_raw().wrapping_sub(start)) < offset {}
    }

    /// Busy-wait until the 32-bit time reaches `target`. Returns immediately
    /// if `target` is up to half a hardware period in the past.
    pub(crate) fn spin_until(&self, target: u32) {
        let start = self.read_raw();
        let delta = Self::mask(target.wrapping_sub(start));
        if delta > Self::HALF_PERIOD {
            return;
        }
        while Self::mask(self.read_raw().wrapping_sub(start)) < delta {}
    }
}
