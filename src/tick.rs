//! Millisecond time base, and blocking delays. Call `inc_tick` from the SysTick handler,
//! configured for a 1kHz rate. Drivers use it for their timeouts.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};

/// A timeout of this value never expires.
pub const MAX_DELAY: u32 = u32::MAX;

static TICK: AtomicU32 = AtomicU32::new(0);

/// Increment the tick by 1ms. Run this in the SysTick interrupt handler.
#[inline]
pub fn inc_tick() {
    TICK.fetch_add(1, Ordering::Relaxed);
}

/// Milliseconds since the tick started.
#[inline]
pub fn get_tick() -> u32 {
    TICK.load(Ordering::Relaxed)
}

/// Set the tick value directly; eg after waking from a low-power mode.
pub fn set_tick(ms: u32) {
    TICK.store(ms, Ordering::Relaxed);
}

/// True if `timeout` ms have passed since `start`. A timeout of 0 expires immediately;
/// `MAX_DELAY` never does.
pub fn timed_out(start: u32, timeout: u32) -> bool {
    if timeout == MAX_DELAY {
        return false;
    }
    timeout == 0 || get_tick().wrapping_sub(start) > timeout
}

/// Wait until `cond` returns true, or the timeout expires.
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool, timeout: u32) -> Result<()> {
    let start = get_tick();
    while !cond() {
        if timed_out(start, timeout) {
            return Err(Error::Timeout);
        }
    }
    Ok(())
}

/// Blocking delay, in milliseconds. Relies on the tick advancing.
pub fn delay_ms(ms: u32) {
    let start = get_tick();
    while get_tick().wrapping_sub(start) < ms {
        core::hint::spin_loop();
    }
}

/// Blocking delay, in microseconds. Uses a cycle count, so it doesn't need the tick.
/// `hclk` is the core clock speed, in Hz.
pub fn delay_us(us: u32, hclk: u32) {
    let cycles = (hclk / 1_000_000).max(1).saturating_mul(us);

    cfg_if::cfg_if! {
        if #[cfg(target_mcu)] {
            cortex_m::asm::delay(cycles);
        } else {
            // Host builds: there's no cycle counter to sync to.
            for _ in 0..cycles / 1_000 {
                core::hint::spin_loop();
            }
        }
    }
}

/// Tick-based delay provider.
pub struct Delay {
    /// Core clock speed, in Hz. Used for sub-millisecond delays.
    pub hclk: u32,
}

impl Delay {
    pub fn new(hclk: u32) -> Self {
        Self { hclk }
    }

    pub fn delay_ms(&mut self, ms: u32) {
        delay_ms(ms);
    }

    pub fn delay_us(&mut self, us: u32) {
        if us >= 1_000 {
            delay_ms(us / 1_000);
            delay_us(us % 1_000, self.hclk);
        } else {
            delay_us(us, self.hclk);
        }
    }
}

#[cfg(feature = "embedded_hal")]
impl embedded_hal::delay::DelayNs for Delay {
    fn delay_ns(&mut self, ns: u32) {
        Delay::delay_us(self, ns.div_ceil(1_000));
    }

    fn delay_us(&mut self, us: u32) {
        Delay::delay_us(self, us);
    }

    fn delay_ms(&mut self, ms: u32) {
        Delay::delay_ms(self, ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test: the tick is global, and tests run in parallel.
    #[test]
    fn tick_and_timeouts() {
        set_tick(100);
        inc_tick();
        assert_eq!(get_tick(), 101);

        assert!(timed_out(101, 0));
        assert!(!timed_out(101, 5));
        assert!(!timed_out(0, MAX_DELAY));

        set_tick(200);
        assert!(timed_out(101, 5));

        // Wraps cleanly.
        set_tick(3);
        assert!(timed_out(u32::MAX - 10, 5));
        assert!(!timed_out(u32::MAX - 1, 10));

        assert_eq!(wait_until(|| false, 0), Err(Error::Timeout));
        assert_eq!(wait_until(|| true, 0), Ok(()));

        delay_ms(0);
    }
}
