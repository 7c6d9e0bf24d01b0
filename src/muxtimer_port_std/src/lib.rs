#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use muxtimer::{InitError, PortCpuLock, PortSync, PortTimer, TimerMux};
use once_cell::sync::OnceCell;
use spin::Mutex as SpinMutex;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

mod sync;
mod threading;

pub use self::{
    sync::StdMutex,
    threading::{
        current, receive, register_current_thread, sleep, try_receive,
        unregister_current_thread, Msg, ThreadId, MAILBOX_CAPACITY,
    },
};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate muxtimer;

/// A port with a 32-bit counter.
pub type StdPort32 = StdPort<0>;

/// A port with a 24-bit counter.
pub type StdPort24 = StdPort<0xff00_0000>;

/// A port with a 16-bit counter. Its counter wraps around every 65.536
/// milliseconds.
pub type StdPort16 = StdPort<0xffff_0000>;

/// A port running on a hosted environment.
///
/// The counter ticks every microsecond of the host's monotonic clock. Its
/// width is `32 - MASK.count_ones()` bits. The compare channel is emulated by
/// a host thread, which calls [`TimerMux::handle_interrupt`] when the deadline
/// passes. Use [`use_port!`] to instantiate the multiplexer and [`boot`] to
/// start it.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of `Port*`.
pub struct StdPort<const MASK: u32> {
    origin: OnceCell<Instant>,
    clock: SpinMutex<Clock>,
    /// Identifies the thread holding CPU Lock, or zero.
    cpu_lock_owner: AtomicUsize,
    timer_cmd_send: SpinMutex<Option<mpsc::Sender<TimerCmd>>>,
    timer_join_handle: SpinMutex<Option<JoinHandle<()>>>,
}

struct Clock {
    /// The total time the counter has been stopped.
    paused: Duration,
    stopped_at: Option<Instant>,
}

enum TimerCmd {
    SetCompare { at: Instant },
    Pend,
}

thread_local! {
    /// Its address identifies the current thread.
    static THREAD_TOKEN: u8 = 0;
}

fn thread_token() -> usize {
    THREAD_TOKEN.with(|t| t as *const u8 as usize)
}

/// Get the number of ticks after which the counter, currently reading `now`,
/// steps onto `value`.
fn compare_delay<const MASK: u32>(value: u32, now: u32) -> u64 {
    match value.wrapping_sub(now) & !MASK {
        // Only after a full period
        0 => u64::from(!MASK) + 1,
        delay => u64::from(delay),
    }
}

impl<const MASK: u32> StdPort<MASK> {
    pub const fn new() -> Self {
        Self {
            origin: OnceCell::new(),
            clock: SpinMutex::new(Clock {
                paused: Duration::ZERO,
                stopped_at: None,
            }),
            cpu_lock_owner: AtomicUsize::new(0),
            timer_cmd_send: SpinMutex::new(None),
            timer_join_handle: SpinMutex::new(None),
        }
    }

    fn elapsed(&self) -> Duration {
        let origin = *self.origin.get_or_init(Instant::now);
        let clock = self.clock.lock();
        let now = clock.stopped_at.unwrap_or_else(Instant::now);
        now.duration_since(origin).saturating_sub(clock.paused)
    }

    fn send_timer_cmd(&self, cmd: TimerCmd) {
        let timer_cmd_send = self.timer_cmd_send.lock();
        if let Some(timer_cmd_send) = &*timer_cmd_send {
            // The timer thread only exits after the sender is dropped
            let _ = timer_cmd_send.send(cmd);
        } else {
            log::warn!("the compare channel was used while the timer thread isn't running");
        }
    }
}

impl<const MASK: u32> Default for StdPort<MASK> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<const MASK: u32> PortTimer for StdPort<MASK> {
    const MASK: u32 = MASK;

    // Host threads take tens of microseconds to wake up
    const BACKOFF: u32 = 200;
    const OVERHEAD: u32 = 50;
    const ISR_BACKOFF: u32 = 100;
    const USLEEP_UNTIL_OVERHEAD: u32 = 10;

    unsafe fn init(&self) {
        let origin = self.origin.get_or_init(Instant::now);
        log::trace!("counter origin = {origin:?}");
    }

    unsafe fn start(&self) {
        let mut clock = self.clock.lock();
        if let Some(stopped_at) = clock.stopped_at.take() {
            clock.paused += stopped_at.elapsed();
        }
    }

    unsafe fn stop(&self) {
        self.clock.lock().stopped_at.get_or_insert_with(Instant::now);
    }

    unsafe fn read(&self) -> u32 {
        // Truncate the upper bits
        (self.elapsed().as_micros() as u32) & !MASK
    }

    unsafe fn set_absolute(&self, value: u32) {
        // Safety: `read` is callable from any context
        let now = unsafe { self.read() };
        let delay = compare_delay::<MASK>(value, now);
        log::trace!("set_absolute({value}) (now = {now}, delay = {delay})");

        let at = Instant::now() + Duration::from_micros(delay);
        self.send_timer_cmd(TimerCmd::SetCompare { at });
    }

    unsafe fn pend_interrupt(&self) {
        log::trace!("pend_interrupt");
        self.send_timer_cmd(TimerCmd::Pend);
    }
}

unsafe impl<const MASK: u32> PortCpuLock for StdPort<MASK> {
    unsafe fn try_enter_cpu_lock(&self) -> bool {
        let me = thread_token();
        if self.cpu_lock_owner.load(Ordering::Relaxed) == me {
            return false;
        }

        while self
            .cpu_lock_owner
            .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
        true
    }

    unsafe fn leave_cpu_lock(&self) {
        debug_assert_eq!(self.cpu_lock_owner.load(Ordering::Relaxed), thread_token());
        self.cpu_lock_owner.store(0, Ordering::Release);
    }

    fn is_cpu_lock_active(&self) -> bool {
        self.cpu_lock_owner.load(Ordering::Relaxed) == thread_token()
    }
}

impl<const MASK: u32> PortSync for StdPort<MASK> {
    type Mutex = StdMutex;
    type Msg = Msg;
    type ThreadId = ThreadId;

    fn send_msg_int(msg: Msg, target: ThreadId) -> bool {
        threading::send_msg_int(msg, target)
    }

    fn wakeup_thread(thread: ThreadId) {
        threading::wakeup(thread);
    }
}

/// Start the timer thread and initialize `mux`.
///
/// Returns `BadObjectState` if `mux` has already been booted.
pub fn boot<const MASK: u32>(mux: &'static TimerMux<StdPort<MASK>>) -> Result<(), InitError> {
    let port = mux.port();
    let mut timer_cmd_send_slot = port.timer_cmd_send.lock();
    if timer_cmd_send_slot.is_some() {
        return Err(InitError::BadObjectState);
    }

    let (timer_cmd_send, timer_cmd_recv) = mpsc::channel();
    log::trace!("starting the timer thread");
    let timer_join_handle = std::thread::spawn(move || {
        let mut next_deadline: Option<Instant> = None;
        loop {
            let recv_result = if let Some(next_deadline) = next_deadline {
                timer_cmd_recv.recv_timeout(next_deadline.saturating_duration_since(Instant::now()))
            } else {
                timer_cmd_recv
                    .recv()
                    .map_err(|_| mpsc::RecvTimeoutError::Disconnected)
            };
            match recv_result {
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    next_deadline = None;
                    mux.handle_interrupt();
                }
                Ok(TimerCmd::SetCompare { at }) => {
                    next_deadline = Some(at);
                }
                Ok(TimerCmd::Pend) => {
                    mux.handle_interrupt();
                }
            }
        }
    });
    *timer_cmd_send_slot = Some(timer_cmd_send);
    *port.timer_join_handle.lock() = Some(timer_join_handle);
    drop(timer_cmd_send_slot);

    mux.init()
}

/// Stop the timer thread. Pending timers will never fire after this.
pub fn shutdown<const MASK: u32>(mux: &TimerMux<StdPort<MASK>>) {
    let port = mux.port();

    // `timer_cmd_recv.recv` will return `Err(_)` when we drop the
    // corresponding sender (`timer_cmd_send`)
    log::trace!("stopping the timer thread");
    *port.timer_cmd_send.lock() = None;
    let timer_join_handle = port.timer_join_handle.lock().take();
    if let Some(timer_join_handle) = timer_join_handle {
        if let Err(e) = timer_join_handle.join() {
            // Propagate any panic that occured in the interrupt handler
            std::panic::resume_unwind(e);
        }
    }
    log::trace!("stopped the timer thread");
}

/// Define a static [`TimerMux`] hosted by the specified port.
///
/// ```
/// muxtimer_port_std::use_port!(static MUX: muxtimer_port_std::StdPort32);
///
/// muxtimer_port_std::boot(&MUX).unwrap();
/// MUX.usleep(1_000).unwrap();
/// ```
#[macro_export]
macro_rules! use_port {
    ($vis:vis static $Name:ident: $Port:ty) => {
        $vis static $Name: $crate::muxtimer::TimerMux<$Port> =
            $crate::muxtimer::TimerMux::new(<$Port>::new());
    };
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    use super::*;

    fn compare_delay_lands_on_value<const MASK: u32>(value: u32, now: u32) -> bool {
        let (value, now) = (value & !MASK, now & !MASK);
        let delay = compare_delay::<MASK>(value, now);
        delay > 0
            && delay <= u64::from(!MASK) + 1
            && (u64::from(now) + delay) as u32 & !MASK == value
    }

    #[quickcheck]
    fn compare_delay_32(value: u32, now: u32) -> bool {
        compare_delay_lands_on_value::<0>(value, now)
    }

    #[quickcheck]
    fn compare_delay_16(value: u32, now: u32) -> bool {
        compare_delay_lands_on_value::<0xffff_0000>(value, now)
    }

    #[test]
    fn compare_delay_full_period() {
        assert_eq!(compare_delay::<0xffff_0000>(5, 5), 0x1_0000);
        assert_eq!(compare_delay::<0xffff_0000>(5, 0xfffe), 7);
    }

    #[test]
    fn cpu_lock_is_per_thread() {
        let port = StdPort32::new();
        unsafe {
            assert!(port.try_enter_cpu_lock());
            assert!(port.is_cpu_lock_active());
            assert!(!port.try_enter_cpu_lock());
        }

        let port: &'static StdPort32 = Box::leak(Box::new(port));
        let jh = std::thread::spawn(move || {
            assert!(!port.is_cpu_lock_active());
            // Blocks until the main thread leaves CPU Lock
            unsafe { assert!(port.try_enter_cpu_lock()) };
            unsafe { port.leave_cpu_lock() };
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!jh.is_finished());
        unsafe { port.leave_cpu_lock() };
        jh.join().unwrap();
    }

    #[test]
    fn stopped_counter_doesnt_advance() {
        let port = StdPort16::new();
        unsafe {
            port.init();
            port.stop();
            let t = port.read();
            std::thread::sleep(Duration::from_millis(5));
            assert_eq!(port.read(), t);
            port.start();
            std::thread::sleep(Duration::from_millis(5));
            assert_ne!(port.read(), t);
            assert_eq!(port.read() & 0xffff_0000, 0);
        }
    }
}
