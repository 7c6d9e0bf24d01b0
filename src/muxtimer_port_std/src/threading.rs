//! Threads that can be targeted by timer messages and wake-ups
use once_cell::sync::Lazy;
use slab::Slab;
use spin::Mutex as SpinMutex;
use std::{cell::Cell, collections::VecDeque, thread::Thread};

/// The maximum number of messages that can be queued for a thread. Sending a
/// message to a thread with a full mailbox fails.
pub const MAILBOX_CAPACITY: usize = 16;

/// Identifies a thread registered by [`register_current_thread`].
///
/// The identifier is reused after the thread unregisters itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(usize);

impl From<usize> for ThreadId {
    fn from(x: usize) -> Self {
        Self(x)
    }
}

impl From<ThreadId> for usize {
    fn from(x: ThreadId) -> Self {
        x.0
    }
}

/// A message delivered by [`TimerMux::set_msg`].
///
/// [`TimerMux::set_msg`]: muxtimer::TimerMux::set_msg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Msg {
    pub kind: u16,
    pub value: u32,
}

struct ThreadSlot {
    thread: Thread,
    mailbox: VecDeque<Msg>,
    /// Set by [`wakeup`], cleared by [`sleep`].
    woken: bool,
}

static THREADS: Lazy<SpinMutex<Slab<ThreadSlot>>> = Lazy::new(|| SpinMutex::new(Slab::new()));

thread_local! {
    static CURRENT: Cell<Option<ThreadId>> = Cell::new(None);
}

/// Register the current thread so that it can receive messages and wake-ups.
/// Returns the existing identifier if it's already registered.
pub fn register_current_thread() -> ThreadId {
    if let Some(id) = current() {
        return id;
    }

    let id = ThreadId(THREADS.lock().insert(ThreadSlot {
        thread: std::thread::current(),
        mailbox: VecDeque::with_capacity(MAILBOX_CAPACITY),
        woken: false,
    }));
    CURRENT.with(|c| c.set(Some(id)));
    log::trace!("registered {:?} as {id:?}", std::thread::current().id());
    id
}

/// Unregister the current thread. Its pending messages are discarded.
pub fn unregister_current_thread() {
    if let Some(id) = CURRENT.with(|c| c.take()) {
        THREADS.lock().remove(id.0);
        log::trace!("unregistered {id:?}");
    }
}

/// Get the identifier of the current thread if it's registered.
pub fn current() -> Option<ThreadId> {
    CURRENT.with(|c| c.get())
}

fn expect_registered() -> ThreadId {
    current().expect("the current thread isn't registered")
}

/// Block the current thread until a message arrives.
///
/// # Panics
///
/// The current thread must be registered.
pub fn receive() -> Msg {
    loop {
        if let Some(msg) = try_receive() {
            return msg;
        }
        std::thread::park();
    }
}

/// Take the oldest message delivered to the current thread, if any.
///
/// # Panics
///
/// The current thread must be registered.
pub fn try_receive() -> Option<Msg> {
    let id = expect_registered();
    THREADS.lock()[id.0].mailbox.pop_front()
}

/// Block the current thread until another context calls
/// [`TimerMux::set_wakeup`] for it and the timer fires. Returns immediately if
/// a wake-up has arrived since the last call.
///
/// # Panics
///
/// The current thread must be registered.
///
/// [`TimerMux::set_wakeup`]: muxtimer::TimerMux::set_wakeup
pub fn sleep() {
    let id = expect_registered();
    loop {
        {
            let mut threads = THREADS.lock();
            let slot = &mut threads[id.0];
            if slot.woken {
                slot.woken = false;
                return;
            }
        }
        std::thread::park();
    }
}

pub(crate) fn send_msg_int(msg: Msg, target: ThreadId) -> bool {
    let mut threads = THREADS.lock();
    let Some(slot) = threads.get_mut(target.0) else {
        return false;
    };
    if slot.mailbox.len() >= MAILBOX_CAPACITY {
        return false;
    }
    slot.mailbox.push_back(msg);
    slot.thread.unpark();
    true
}

pub(crate) fn wakeup(thread: ThreadId) {
    let mut threads = THREADS.lock();
    if let Some(slot) = threads.get_mut(thread.0) {
        slot.woken = true;
        slot.thread.unpark();
    } else {
        log::warn!("wake-up for an unregistered thread {thread:?}");
    }
}
