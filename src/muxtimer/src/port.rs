//! The interface between the multiplexer and the platform it runs on
//!
//! A port supplies three things: a free-running counter with one compare
//! channel ([`PortTimer`]), a way to mask the timer interrupt
//! ([`PortCpuLock`]), and the thread primitives used by the blocking API
//! ([`PortSync`]). Its interrupt handler must call
//! [`TimerMux::handle_interrupt`] when the compare channel fires.
//!
//! [`TimerMux::handle_interrupt`]: crate::TimerMux::handle_interrupt

/// Implemented by a port. Provides the hardware counter and its compare
/// channel.
///
/// The counter is `32 - MASK.count_ones()` bits wide. The bits covered by
/// [`Self::MASK`] always read as zero and are extended in software.
///
/// # Safety
///
/// These methods are only meant to be called by the multiplexer. `read` must
/// be callable from any context, including the interrupt handler and with CPU
/// Lock active.
pub unsafe trait PortTimer {
    /// The bits of a 32-bit timestamp that the hardware counter does not
    /// provide. Must be a contiguous run of high-order bits (or zero).
    const MASK: u32 = 0;

    /// Targets closer than this many ticks are handled by busy-waiting
    /// instead of through the interrupt.
    const BACKOFF: u32 = 30;

    /// The compare channel is programmed this many ticks ahead of a target to
    /// compensate for the interrupt latency. Must be less than
    /// [`Self::BACKOFF`].
    const OVERHEAD: u32 = 20;

    /// Within the interrupt handler, a timer due in less than this many ticks
    /// is busy-waited for and fired in the same invocation.
    const ISR_BACKOFF: u32 = 20;

    /// Ticks subtracted from the target of a periodic wake-up to compensate for
    /// the cost of the wake-up itself.
    ///
    /// Should equal the time from the armed deadline to the sleeper reading the
    /// counter. Any difference accumulates over consecutive
    /// [`TimerMux::usleep_until`] calls.
    ///
    /// [`TimerMux::usleep_until`]: crate::TimerMux::usleep_until
    const USLEEP_UNTIL_OVERHEAD: u32 = 10;

    /// Initialize the counter and the compare channel. The counter should be
    /// running when this method returns.
    unsafe fn init(&self);

    /// Resume the counter.
    unsafe fn start(&self) {}

    /// Stop the counter.
    unsafe fn stop(&self) {}

    /// Read the counter. The bits covered by [`Self::MASK`] must be zero.
    unsafe fn read(&self) -> u32;

    /// Program the compare channel to raise the interrupt when the counter
    /// reaches `value`. This replaces any previously programmed value.
    ///
    /// `value` never has a bit covered by [`Self::MASK`] set.
    unsafe fn set_absolute(&self, value: u32);

    /// Raise the timer interrupt as soon as possible, regardless of the
    /// compare channel. Used when the programmed value may already have been
    /// passed.
    unsafe fn pend_interrupt(&self);
}

/// Implemented by a port. Controls the masking of the timer interrupt.
///
/// # Safety
///
/// These methods are only meant to be called by the multiplexer. While CPU
/// Lock is active, [`TimerMux::handle_interrupt`] must not start executing
/// on any processor.
///
/// [`TimerMux::handle_interrupt`]: crate::TimerMux::handle_interrupt
pub unsafe trait PortCpuLock {
    /// Enter a CPU Lock state. Return `false` if CPU Lock is already active in
    /// the current context.
    unsafe fn try_enter_cpu_lock(&self) -> bool;

    /// Leave the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock(&self);

    /// Return a flag indicating whether a CPU Lock state is active in the
    /// current context.
    fn is_cpu_lock_active(&self) -> bool;
}

/// A binary lock that can be released from the timer interrupt handler.
///
/// The blocking operations create one on the stack, lock it, and then lock it
/// again. The second `lock` blocks the calling thread until a timer callback
/// calls `unlock`.
pub trait IsrMutex: Sync {
    /// Construct an unlocked instance.
    fn new() -> Self;

    /// Acquire the lock, blocking the calling thread until it's available.
    fn lock(&self);

    /// Release the lock. Must be callable from the timer interrupt handler.
    fn unlock(&self);
}

/// Implemented by a port. Provides the thread primitives used by
/// [`TimerMux::usleep`], [`TimerMux::set_msg`], and [`TimerMux::set_wakeup`].
///
/// [`TimerMux::usleep`]: crate::TimerMux::usleep
/// [`TimerMux::set_msg`]: crate::TimerMux::set_msg
/// [`TimerMux::set_wakeup`]: crate::TimerMux::set_wakeup
pub trait PortSync {
    /// The lock type used to block a thread until a timer fires.
    type Mutex: IsrMutex;

    /// A message delivered by [`TimerMux::set_msg`].
    ///
    /// [`TimerMux::set_msg`]: crate::TimerMux::set_msg
    type Msg: Clone + Send + Sync;

    /// Identifies a thread. Must round-trip through `usize` so that it can be
    /// carried as a callback argument.
    type ThreadId: Copy + Send + Sync + Into<usize> + From<usize>;

    /// Deliver `msg` to `target` without blocking. Called from the timer
    /// interrupt handler. Returns `false` if the message could not be
    /// delivered.
    fn send_msg_int(msg: Self::Msg, target: Self::ThreadId) -> bool;

    /// Make `thread` runnable if it is sleeping. Called from the timer
    /// interrupt handler.
    fn wakeup_thread(thread: Self::ThreadId);
}

/// The complete set of traits a port implements to host a
/// [`TimerMux`](crate::TimerMux).
pub trait Port: PortTimer + PortCpuLock + PortSync + Sized + 'static {}

impl<T: PortTimer + PortCpuLock + PortSync + Sized + 'static> Port for T {}
