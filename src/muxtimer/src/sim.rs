//! A deterministic port for testing
//!
//! The simulated counter advances by one tick every time it's read, so the
//! passage of time is entirely driven by the code under test. The compare
//! channel raises a pending flag when the counter steps onto the programmed
//! value; the interrupt is "taken" at the next counter read (or CPU Lock
//! release) where CPU Lock is inactive and the handler isn't already running.
use std::cell::{Cell, RefCell};

use crate::{IsrMutex, PortCpuLock, PortSync, PortTimer, TimerMux};

pub(crate) const BACKOFF: u32 = 30;
pub(crate) const OVERHEAD: u32 = 5;
pub(crate) const ISR_BACKOFF: u32 = 20;
/// The counter reads between a sleeper's wake-up and the end of
/// `usleep_until`: one by the interrupt handler after firing, one by re-arming
/// the compare channel and one by `now`.
pub(crate) const USLEEP_UNTIL_OVERHEAD: u32 = 3;

pub(crate) struct SimPort<const M: u32> {
    counter: Cell<u32>,
    /// The number of ticks elapsed since construction.
    ticks: Cell<u64>,
    compare: Cell<Option<u32>>,
    pending: Cell<bool>,
    running: Cell<bool>,
    cpu_lock: Cell<bool>,
    in_isr: Cell<bool>,
    /// Models interrupt latency. Pending interrupts aren't taken while set.
    held_off: Cell<bool>,
    interrupts: Cell<usize>,
    mux: Cell<Option<&'static TimerMux<Self>>>,
}

/// A 32-bit counter.
pub(crate) type Sim32 = SimPort<0>;

/// A 16-bit counter.
pub(crate) type Sim16 = SimPort<0xffff_0000>;

trait SimClock {
    fn idle(&self);
    fn ticks(&self) -> u64;
}

thread_local! {
    static CLOCK: Cell<Option<&'static dyn SimClock>> = Cell::new(None);
    static FIRED: RefCell<Vec<(usize, u64)>> = RefCell::new(Vec::new());
    static MAILBOX: RefCell<Vec<(usize, u32)>> = RefCell::new(Vec::new());
    static WOKEN: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

impl<const M: u32> SimPort<M> {
    pub(crate) fn new(counter: u32) -> Self {
        Self {
            counter: Cell::new(counter & !M),
            ticks: Cell::new(0),
            compare: Cell::new(None),
            pending: Cell::new(false),
            running: Cell::new(false),
            cpu_lock: Cell::new(false),
            in_isr: Cell::new(false),
            held_off: Cell::new(false),
            interrupts: Cell::new(0),
            mux: Cell::new(None),
        }
    }

    pub(crate) fn ticks(&self) -> u64 {
        self.ticks.get()
    }

    pub(crate) fn interrupts(&self) -> usize {
        self.interrupts.get()
    }

    /// Advance the counter by `ticks`, taking the interrupt every time the
    /// counter steps onto the compare value.
    pub(crate) fn advance(&self, ticks: u64) {
        self.advance_inner(ticks, false);
    }

    /// Like [`Self::advance`] but stops after taking an interrupt.
    fn advance_inner(&self, mut ticks: u64, until_interrupt: bool) {
        let interrupts = self.interrupts.get();
        while ticks > 0 && self.running.get() {
            let to_compare = match self.compare.get() {
                Some(value) => match value.wrapping_sub(self.counter.get()) & !M {
                    0 => u64::from(!M) + 1,
                    d => u64::from(d),
                },
                None => u64::MAX,
            };
            let step = ticks.min(to_compare);

            self.counter
                .set((u64::from(self.counter.get()) + step) as u32 & !M);
            self.ticks.set(self.ticks.get() + step);
            ticks -= step;

            if step == to_compare {
                self.pending.set(true);
            }
            self.dispatch();

            if until_interrupt && self.interrupts.get() != interrupts {
                return;
            }
        }
        self.dispatch();
    }

    /// Let the simulated time pass until `ticks()` reaches `until`.
    pub(crate) fn run_until(&self, until: u64) {
        while self.ticks() < until {
            self.advance(until - self.ticks());
        }
    }

    /// Hold off (or stop holding off) the interrupt.
    pub(crate) fn hold_off_interrupts(&self, held_off: bool) {
        self.held_off.set(held_off);
        self.dispatch();
    }

    fn dispatch(&self) {
        if !self.pending.get() || self.cpu_lock.get() || self.in_isr.get() || self.held_off.get()
        {
            return;
        }
        let Some(mux) = self.mux.get() else { return };

        self.pending.set(false);
        self.in_isr.set(true);
        self.interrupts.set(self.interrupts.get() + 1);
        mux.handle_interrupt();
        self.in_isr.set(false);
    }
}

impl<const M: u32> SimClock for SimPort<M> {
    fn idle(&self) {
        // The compare channel always fires at least once per period
        self.advance_inner(2 * (u64::from(!M) + 1), true);
    }

    fn ticks(&self) -> u64 {
        self.ticks.get()
    }
}

unsafe impl<const M: u32> PortTimer for SimPort<M> {
    const MASK: u32 = M;
    const BACKOFF: u32 = BACKOFF;
    const OVERHEAD: u32 = OVERHEAD;
    const ISR_BACKOFF: u32 = ISR_BACKOFF;
    const USLEEP_UNTIL_OVERHEAD: u32 = USLEEP_UNTIL_OVERHEAD;

    unsafe fn init(&self) {
        self.running.set(true);
    }

    unsafe fn start(&self) {
        self.running.set(true);
    }

    unsafe fn stop(&self) {
        self.running.set(false);
    }

    unsafe fn read(&self) -> u32 {
        self.advance(1);
        self.counter.get()
    }

    unsafe fn set_absolute(&self, value: u32) {
        assert_eq!(value & M, 0);
        self.compare.set(Some(value));
    }

    unsafe fn pend_interrupt(&self) {
        self.pending.set(true);
    }
}

unsafe impl<const M: u32> PortCpuLock for SimPort<M> {
    unsafe fn try_enter_cpu_lock(&self) -> bool {
        !self.cpu_lock.replace(true)
    }

    unsafe fn leave_cpu_lock(&self) {
        assert!(self.cpu_lock.replace(false));
        self.dispatch();
    }

    fn is_cpu_lock_active(&self) -> bool {
        self.cpu_lock.get()
    }
}

pub(crate) struct SimMutex {
    locked: Cell<bool>,
}

// Safety: The simulation runs on a single thread
unsafe impl Sync for SimMutex {}

impl IsrMutex for SimMutex {
    fn new() -> Self {
        Self {
            locked: Cell::new(false),
        }
    }

    fn lock(&self) {
        let mut idle_count = 0;
        while self.locked.get() {
            // Nothing else can release it on this thread but the interrupt
            idle();
            idle_count += 1;
            assert!(idle_count < 1 << 20, "deadlock");
        }
        self.locked.set(true);
    }

    fn unlock(&self) {
        self.locked.set(false);
    }
}

impl<const M: u32> PortSync for SimPort<M> {
    type Mutex = SimMutex;
    type Msg = u32;
    type ThreadId = usize;

    fn send_msg_int(msg: u32, target: usize) -> bool {
        MAILBOX.with(|m| m.borrow_mut().push((target, msg)));
        true
    }

    fn wakeup_thread(thread: usize) {
        WOKEN.with(|w| w.borrow_mut().push(thread));
    }
}

/// Construct a `TimerMux` on a new simulated counter starting at `counter`
/// and make it the current thread's clock.
pub(crate) fn new_mux<const M: u32>(counter: u32) -> &'static TimerMux<SimPort<M>> {
    let _ = env_logger::builder().is_test(true).try_init();

    let mux: &'static TimerMux<SimPort<M>> =
        Box::leak(Box::new(TimerMux::new(SimPort::new(counter))));
    mux.port().mux.set(Some(mux));
    let clock: &'static dyn SimClock = mux.port();
    CLOCK.with(|c| c.set(Some(clock)));
    FIRED.with(|f| f.borrow_mut().clear());
    MAILBOX.with(|m| m.borrow_mut().clear());
    WOKEN.with(|w| w.borrow_mut().clear());

    mux.init().unwrap();
    mux
}

fn idle() {
    CLOCK.with(|c| c.get().expect("no simulated clock").idle());
}

/// A timer callback that records `arg` and the time it was called at.
pub(crate) fn record(arg: usize) {
    let now = CLOCK.with(|c| c.get().expect("no simulated clock").ticks());
    log::trace!("fired {arg} at {now}");
    FIRED.with(|f| f.borrow_mut().push((arg, now)));
}

/// Take the list of `(arg, ticks)` recorded by [`record`].
pub(crate) fn take_fired() -> Vec<(usize, u64)> {
    FIRED.with(|f| std::mem::take(&mut *f.borrow_mut()))
}

pub(crate) fn take_mailbox() -> Vec<(usize, u32)> {
    MAILBOX.with(|m| std::mem::take(&mut *m.borrow_mut()))
}

pub(crate) fn take_woken() -> Vec<usize> {
    WOKEN.with(|w| std::mem::take(&mut *w.borrow_mut()))
}
