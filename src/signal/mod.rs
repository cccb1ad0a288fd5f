
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use rust_decimal::Decimal;

use crate::config;
use crate::error::{HcqError, Result};

/// Hook called between polls of [`Signal::wait`] with the time already
/// spent waiting, in milliseconds. Kernel-signal backends use this to
/// yield to the driver instead of burning the host core.
pub type SleepHook = Rc<dyn Fn(u64)>;

/// Shared-memory synchronization primitive: a 64-bit monotonic counter
/// plus a 64-bit raw device timestamp, both living at fixed addresses in
/// memory the device engines can reach.
///
/// The counter is monotonically non-decreasing over the life of a process;
/// readers only ever observe values actually written by hardware or by
/// explicit initialization. The device's own timeline signal additionally
/// carries the id of the device it linearizes.
#[derive(Clone)]
pub struct Signal {
    base_addr: u64,
    value_addr: u64,
    timestamp_addr: u64,
    timestamp_divider: Decimal,
    timeline_for: Option<u32>,
    sleep: Option<SleepHook>,
}

impl Signal {
    /// Maps the two 8-byte cells at `base_addr + value_off` and
    /// `base_addr + timestamp_off` and writes `value` into the value cell.
    ///
    /// # Safety
    ///
    /// Both cells must be valid, 8-byte aligned and device-shared, and the
    /// backing mapping must outlive the signal (and every clone of it).
    pub unsafe fn new(
        base_addr: u64,
        value: u64,
        timestamp_divider: Decimal,
        value_off: u64,
        timestamp_off: u64,
        timeline_for: Option<u32>,
    ) -> Self {
        let sig = Self {
            base_addr,
            value_addr: base_addr + value_off,
            timestamp_addr: base_addr + timestamp_off,
            timestamp_divider,
            timeline_for,
            sleep: None,
        };
        sig.set_value(value);
        sig
    }

    /// Installs the backend sleep hook used between wait polls.
    pub fn with_sleep_hook(mut self, hook: SleepHook) -> Self {
        self.sleep = Some(hook);
        self
    }

    fn value_cell(&self) -> &AtomicU64 {
        // Validity and alignment of the mapping are the constructor's
        // contract.
        unsafe { AtomicU64::from_ptr(self.value_addr as *mut u64) }
    }

    fn timestamp_cell(&self) -> &AtomicU64 {
        unsafe { AtomicU64::from_ptr(self.timestamp_addr as *mut u64) }
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    /// Address of the value cell, for backends encoding signal packets.
    pub fn value_addr(&self) -> u64 {
        self.value_addr
    }

    /// Address of the timestamp cell, for backends encoding timestamp
    /// packets.
    pub fn timestamp_addr(&self) -> u64 {
        self.timestamp_addr
    }

    /// The device this signal is the timeline of, if any.
    pub fn timeline_for(&self) -> Option<u32> {
        self.timeline_for
    }

    pub fn value(&self) -> u64 {
        self.value_cell().load(Ordering::Acquire)
    }

    pub fn set_value(&self, value: u64) {
        self.value_cell().store(value, Ordering::Release)
    }

    /// Raw device tick count last written by a timestamp command.
    pub fn timestamp_raw(&self) -> u64 {
        self.timestamp_cell().load(Ordering::Acquire)
    }

    /// Timestamp in microseconds: raw ticks divided by the divider, with
    /// exact decimal semantics.
    pub fn timestamp(&self) -> Decimal {
        Decimal::from(self.timestamp_raw()) / self.timestamp_divider
    }

    /// Polls until the counter reaches `value`.
    ///
    /// `timeout_ms` falls back to [`config::wait_timeout_ms`]. Between
    /// polls the sleep hook runs if one is installed; otherwise the first
    /// millisecond spins and later iterations yield the host thread.
    pub fn wait(&self, value: u64, timeout_ms: Option<u64>) -> Result<()> {
        let timeout_ms = timeout_ms.unwrap_or_else(config::wait_timeout_ms);
        let start = Instant::now();
        loop {
            if self.value() >= value {
                return Ok(());
            }
            let spent = start.elapsed().as_millis() as u64;
            if spent >= timeout_ms {
                return Err(HcqError::WaitTimeout {
                    expected: value,
                    observed: self.value(),
                    timeout_ms,
                });
            }
            match &self.sleep {
                Some(sleep) => sleep(spent),
                None if spent == 0 => std::hint::spin_loop(),
                None => std::thread::yield_now(),
            }
        }
    }
}
