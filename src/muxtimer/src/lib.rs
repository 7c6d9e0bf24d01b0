#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)

mod clock;
mod entry;
mod error;
mod isr;
mod klock;
mod list;
mod mux;
mod port;
mod sleep;

#[cfg(test)]
mod sim;

pub use self::{
    clock::Timex,
    entry::{Callback, TimerEntry, TimerFn},
    error::{InitError, RemoveTimerError, ResultCode, SetTimerError, SleepError},
    mux::TimerMux,
    port::{IsrMutex, Port, PortCpuLock, PortSync, PortTimer},
    sleep::MsgTimer,
};
