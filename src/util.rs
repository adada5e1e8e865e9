//! This is an internal module that contains utility functionality used by other modules.

use crate::error::{Error, Result};

/// Enables and resets peripheral clocks on various RCC registesr.
/// The first argument is a `apb1`, `ahb2` etc to specify the reg block. The second is something like
/// `tim1`, and the third is a `pac::RCC`.
macro_rules! rcc_en_reset {
    (ahb1, $periph:ident, $rcc:expr) => {
        paste::paste! {
            $rcc.ahb1enr().modify(|_, w| w.[<$periph en>]().set_bit());
            $rcc.ahb1rstr().modify(|_, w| w.[<$periph rst>]().set_bit());
            $rcc.ahb1rstr().modify(|_, w| w.[<$periph rst>]().clear_bit());
        }
    };
    (ahb2, $periph:ident, $rcc:expr) => {
        paste::paste! {
            $rcc.ahb2enr1().modify(|_, w| w.[<$periph en>]().set_bit());
            $rcc.ahb2rstr1().modify(|_, w| w.[<$periph rst>]().set_bit());
            $rcc.ahb2rstr1().modify(|_, w| w.[<$periph rst>]().clear_bit());
        }
    };
    (ahb3, $periph:ident, $rcc:expr) => {
        paste::paste! {
            $rcc.ahb3enr().modify(|_, w| w.[<$periph en>]().set_bit());
            $rcc.ahb3rstr().modify(|_, w| w.[<$periph rst>]().set_bit());
            $rcc.ahb3rstr().modify(|_, w| w.[<$periph rst>]().clear_bit());
        }
    };
    (apb1, $periph:ident, $rcc:expr) => {
        paste::paste! {
            $rcc.apb1enr1().modify(|_, w| w.[<$periph en>]().set_bit());
            $rcc.apb1rstr1().modify(|_, w| w.[<$periph rst>]().set_bit());
            $rcc.apb1rstr1().modify(|_, w| w.[<$periph rst>]().clear_bit());
        }
    };
    (apb2, $periph:ident, $rcc:expr) => {
        paste::paste! {
            $rcc.apb2enr().modify(|_, w| w.[<$periph en>]().set_bit());
            $rcc.apb2rstr().modify(|_, w| w.[<$periph rst>]().set_bit());
            $rcc.apb2rstr().modify(|_, w| w.[<$periph rst>]().clear_bit());
        }
    };
}

pub(crate) use rcc_en_reset;

/// Spins while `$cond` holds, running `$op` each pass. Returns `$err` from the enclosing
/// function after `MAX_ITERS` passes.
macro_rules! bounded_loop {
    ($cond:expr, $err:expr, $op:block) => {{
        let mut i: u32 = 0;
        while $cond {
            $op;
            i += 1;
            if i >= $crate::MAX_ITERS {
                return Err($err);
            }
        }
    }};
    ($cond:expr, $err:expr) => {{
        let mut i: u32 = 0;
        while $cond {
            i += 1;
            if i >= $crate::MAX_ITERS {
                return Err($err);
            }
        }
    }};
}

pub(crate) use bounded_loop;

/// Moves a handle's state from `from` to `to`. If it's in any other state, leaves it
/// alone and returns `Busy`.
pub(crate) fn check_update_state<S: Copy + PartialEq>(state: &mut S, from: S, to: S) -> Result<()> {
    if *state != from {
        return Err(Error::Busy);
    }
    *state = to;
    Ok(())
}

/// Like `check_update_state`, but accepts any of several source states.
pub(crate) fn check_update_state_any<S: Copy + PartialEq>(
    state: &mut S,
    from: &[S],
    to: S,
) -> Result<()> {
    if !from.contains(state) {
        return Err(Error::Busy);
    }
    *state = to;
    Ok(())
}

/// Returns `Busy` unless the state is one of `allowed`.
pub(crate) fn check_state<S: Copy + PartialEq>(state: S, allowed: &[S]) -> Result<()> {
    if allowed.contains(&state) {
        Ok(())
    } else {
        Err(Error::Busy)
    }
}

/// Packed DMA or FIFO transfer bookkeeping: a raw buffer pointer plus how many words of it
/// remain. Interrupt-driven transfers store one of these until completion.
#[derive(Clone, Copy)]
pub(crate) struct XferBuf<T> {
    pub ptr: *mut T,
    pub remaining: usize,
}

impl<T> XferBuf<T> {
    pub const fn empty() -> Self {
        Self {
            ptr: core::ptr::null_mut(),
            remaining: 0,
        }
    }

    /// Takes the next word and advances.
    ///
    /// # Safety
    /// `ptr` must point to at least `remaining` valid items.
    pub unsafe fn pop(&mut self) -> T
    where
        T: Copy,
    {
        unsafe {
            let v = self.ptr.read();
            self.ptr = self.ptr.add(1);
            self.remaining -= 1;
            v
        }
    }

    /// Stores a word and advances.
    ///
    /// # Safety
    /// `ptr` must point to at least `remaining` writable items.
    pub unsafe fn push(&mut self, v: T) {
        unsafe {
            self.ptr.write(v);
            self.ptr = self.ptr.add(1);
            self.remaining -= 1;
        }
    }
}

/// Builds a zeroed register block with a `'static` lifetime, for driving the HAL without
/// hardware.
#[cfg(test)]
pub(crate) fn fake<T>() -> &'static T {
    // PAC register blocks are `repr(C)` cells of plain integers; all-zeroes is a valid value.
    Box::leak(Box::new(unsafe { core::mem::zeroed::<T>() }))
}

/// Stores raw bits into any register, read-only ones included. Used to stand in for hardware
/// setting status flags.
#[cfg(test)]
pub(crate) fn poke<T>(reg: &T, bits: u32) {
    unsafe { (reg as *const T as *mut u32).write_volatile(bits) }
}

/// Sets bits in any register, leaving the others alone.
#[cfg(test)]
pub(crate) fn poke_set<T>(reg: &T, bits: u32) {
    poke(reg, peek(reg) | bits)
}

/// Reads raw bits from any register, write-only ones included.
#[cfg(test)]
pub(crate) fn peek<T>(reg: &T) -> u32 {
    unsafe { (reg as *const T as *const u32).read_volatile() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pac;

    #[derive(Clone, Copy, PartialEq, Debug)]
    enum S {
        A,
        B,
        C,
    }

    #[test]
    fn state_moves_only_from_expected() {
        let mut s = S::A;
        assert!(check_update_state(&mut s, S::A, S::B).is_ok());
        assert_eq!(s, S::B);

        assert_eq!(check_update_state(&mut s, S::A, S::C), Err(Error::Busy));
        assert_eq!(s, S::B);

        assert!(check_update_state_any(&mut s, &[S::A, S::B], S::C).is_ok());
        assert_eq!(s, S::C);
        assert!(check_state(s, &[S::A]).is_err());
    }

    #[test]
    fn rcc_enable_sets_bit_and_releases_reset() {
        let rcc: &pac::rcc::RegisterBlock = fake();
        rcc_en_reset!(apb2, sai1, rcc);
        assert!(rcc.apb2enr().read().sai1en().bit_is_set());
        assert_eq!(rcc.apb2rstr().read().bits(), 0);
    }

    fn spins(limit_hit: &mut u32) -> Result<()> {
        bounded_loop!(true, Error::RegisterUnchanged, {
            *limit_hit += 1;
        });
        Ok(())
    }

    #[test]
    fn bounded_loop_gives_up() {
        let mut n = 0;
        assert_eq!(spins(&mut n), Err(Error::RegisterUnchanged));
        assert_eq!(n, crate::MAX_ITERS);
    }

    #[test]
    fn xfer_buf_walks() {
        let mut data = [1u32, 2, 3];
        let mut b = XferBuf {
            ptr: data.as_mut_ptr(),
            remaining: 3,
        };
        unsafe {
            assert_eq!(b.pop(), 1);
            b.push(9);
        }
        assert_eq!(b.remaining, 1);
        assert_eq!(data[1], 9);
    }
}
