//! Blocking operations and interrupt-context notifications
use core::pin::Pin;

use crate::{
    entry::TimerEntry,
    error::{SetTimerError, SleepError},
    port::IsrMutex,
    Port, TimerMux,
};

fn unlock_mutex<M: IsrMutex>(arg: usize) {
    // Safety: `arg` was made from a `&M` by `sleep_with` and the `M` outlives
    //         the timer
    let mutex = unsafe { &*(arg as *const M) };
    mutex.unlock();
}

fn send_msg<P: Port>(arg: usize) {
    // Safety: `arg` was made from a pinned `&MsgTimer<P>` by `set_msg`, which
    //         stays alive while its entry is linked
    let msg_timer = unsafe { &*(arg as *const MsgTimer<P>) };
    if !P::send_msg_int(msg_timer.msg.clone(), msg_timer.target) {
        log::warn!("timer message could not be delivered");
    }
}

fn wakeup<P: Port>(arg: usize) {
    P::wakeup_thread(P::ThreadId::from(arg));
}

/// A timer that delivers a message to a thread when it fires.
///
/// Like [`TimerEntry`], a `MsgTimer` must stay in place while it's armed.
pub struct MsgTimer<P: Port> {
    entry: TimerEntry<P>,
    msg: P::Msg,
    target: P::ThreadId,
}

impl<P: Port> MsgTimer<P> {
    /// Construct a `MsgTimer` that sends `msg` to `target`.
    pub const fn new(msg: P::Msg, target: P::ThreadId) -> Self {
        Self {
            entry: TimerEntry::new(),
            msg,
            target,
        }
    }

    /// Get the underlying [`TimerEntry`], e.g., to pass it to
    /// [`TimerMux::remove`].
    pub fn entry(self: Pin<&Self>) -> Pin<&TimerEntry<P>> {
        // Safety: `entry` is structurally pinned
        unsafe { self.map_unchecked(|this| &this.entry) }
    }

    /// Get the message delivered when the timer fires.
    pub fn msg(&self) -> &P::Msg {
        &self.msg
    }

    /// Get the thread the message is sent to.
    pub fn target(&self) -> P::ThreadId {
        self.target
    }
}

impl<P: Port> TimerMux<P> {
    /// Block the calling thread for `offset` microseconds.
    pub fn usleep(&self, offset: u32) -> Result<(), SleepError> {
        self.sleep_with(|timer| self.set64(timer, offset, 0))
    }

    /// Block the calling thread for `offset` microseconds.
    pub fn usleep64(&self, offset: u64) -> Result<(), SleepError> {
        self.sleep_with(|timer| self.set64(timer, offset as u32, (offset >> 32) as u32))
    }

    /// Block the calling thread for `seconds` seconds.
    pub fn sleep(&self, seconds: u32) -> Result<(), SleepError> {
        self.usleep64(seconds as u64 * 1_000_000)
    }

    /// Block the calling thread for `nanoseconds` nanoseconds, rounded down to
    /// whole microseconds.
    pub fn nanosleep(&self, nanoseconds: u32) -> Result<(), SleepError> {
        self.usleep(nanoseconds / 1000)
    }

    /// Block the calling thread until `*last_wakeup + interval`, then update
    /// `*last_wakeup` to the current time.
    ///
    /// Calling this in a loop wakes the thread up every `interval`
    /// microseconds without accumulating the time spent between the calls. If
    /// the deadline has already passed, this method returns immediately.
    pub fn usleep_until(&self, last_wakeup: &mut u32, interval: u32) -> Result<(), SleepError> {
        if self.port.is_cpu_lock_active() {
            return Err(SleepError::BadContext);
        }

        let target = last_wakeup.wrapping_add(interval);
        let now = self.now();

        // Only a target between `*last_wakeup` and `now` (allowing for one
        // wraparound) has passed
        let in_future = if now < *last_wakeup {
            target < *last_wakeup && target > now
        } else {
            target < *last_wakeup || target > now
        };

        if in_future {
            let offset = target.wrapping_sub(now);
            if offset > P::BACKOFF + P::USLEEP_UNTIL_OVERHEAD + 1 {
                self.sleep_with(|timer| {
                    self.set_absolute(timer, target.wrapping_sub(P::USLEEP_UNTIL_OVERHEAD))
                })?;
            } else {
                self.spin_until(target);
            }
        }

        *last_wakeup = self.now();
        Ok(())
    }

    /// Arm `timer` to deliver its message `offset` microseconds from now.
    ///
    /// The message is sent with [`PortSync::send_msg_int`] from the interrupt
    /// handler.
    ///
    /// [`PortSync::send_msg_int`]: crate::PortSync::send_msg_int
    pub fn set_msg(&self, timer: Pin<&MsgTimer<P>>, offset: u32) -> Result<(), SetTimerError> {
        let arg = &*timer as *const MsgTimer<P> as usize;
        let entry = timer.entry();
        self.set_callback(&*entry, send_msg::<P>, arg)?;
        self.set(entry, offset)
    }

    /// Arm `timer` to wake up `thread` `offset` microseconds from now. This
    /// replaces the callback of `timer`.
    pub fn set_wakeup(
        &self,
        timer: Pin<&TimerEntry<P>>,
        offset: u32,
        thread: P::ThreadId,
    ) -> Result<(), SetTimerError> {
        self.set_callback(&*timer, wakeup::<P>, thread.into())?;
        self.set(timer, offset)
    }

    /// Arm a stack-allocated timer with `arm` and block until it fires.
    fn sleep_with(
        &self,
        arm: impl FnOnce(Pin<&TimerEntry<P>>) -> Result<(), SetTimerError>,
    ) -> Result<(), SleepError> {
        if self.port.is_cpu_lock_active() {
            return Err(SleepError::BadContext);
        }

        let mutex = <P::Mutex as IsrMutex>::new();
        let timer = TimerEntry::<P>::with_callback(
            unlock_mutex::<P::Mutex>,
            &mutex as *const P::Mutex as usize,
        );
        pin_utils::pin_mut!(timer);

        mutex.lock();
        arm(timer.as_ref()).map_err(|SetTimerError::BadContext| SleepError::BadContext)?;

        // Released by `unlock_mutex`
        mutex.lock();
        Ok(())
    }
}
