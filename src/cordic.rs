//! Support for the CORDIC co-processor, which computes trigonometric, hyperbolic, logarithm,
//! and square root functions in fixed point. See U5 RM, section 22.
//!
//! Arguments and results are passed as `u32` words, in q1.31 or packed q1.15 format. Use
//! `f32_to_q31` and related helpers to convert. If the width is q1.31, and the number of
//! arguments (or results) is two, each calculation uses two consecutive words of the buffer.
//! Otherwise, each calculation uses one.

use core::ops::Deref;

use num_traits::Float;

use crate::{
    dma::{self, DmaChannel, DmaEvent, DmaOptIt, DmaState},
    error::{Error, Result},
    pac,
    tick,
    util::{XferBuf, check_state, check_update_state, rcc_en_reset},
};

/// Dummy arguments written when flushing the argument registers.
const ARG_RESET_1: u32 = 0;
const ARG_RESET_2: u32 = 0x7FFF_FFFF;

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u32)]
/// CORDIC errors. The discriminants are the bits used in `last_error_codes`.
pub enum CordicError {
    /// A DMA transfer failed to start, or reported an error.
    Dma = 1 << 0,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// The function to calculate. Sets CSR field FUNC.
pub enum Function {
    Cosine = 0,
    Sine = 1,
    /// Phase of a vector, ie atan2.
    Phase = 2,
    /// Modulus of a vector.
    Modulus = 3,
    Arctangent = 4,
    HCosine = 5,
    HSine = 6,
    HArctangent = 7,
    NaturalLog = 8,
    SquareRoot = 9,
}

impl Function {
    fn from_bits(v: u8) -> Self {
        match v {
            0 => Self::Cosine,
            1 => Self::Sine,
            2 => Self::Phase,
            3 => Self::Modulus,
            4 => Self::Arctangent,
            5 => Self::HCosine,
            6 => Self::HSine,
            7 => Self::HArctangent,
            8 => Self::NaturalLog,
            _ => Self::SquareRoot,
        }
    }

    /// Whether a scale factor is allowed for this function. RM, table 186.
    fn scale_valid(&self, scale: u8) -> bool {
        match self {
            Self::Cosine | Self::Sine | Self::Phase | Self::Modulus => scale == 0,
            Self::Arctangent => scale <= 7,
            Self::HCosine | Self::HSine | Self::HArctangent => scale == 1,
            Self::NaturalLog => (1..=4).contains(&scale),
            Self::SquareRoot => scale <= 2,
        }
    }

    /// Square root converges in fewer iterations than the others.
    fn precision_valid(&self, precision: u8) -> bool {
        match self {
            Self::SquareRoot => (1..=3).contains(&precision),
            _ => (1..=6).contains(&precision),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
/// Number of 32-bit accesses to WDATA per calculation, or RDATA per result. Sets NARGS and NRES.
pub enum NbData {
    One,
    Two,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
/// Argument or result format. Sets ARGSIZE and RESSIZE.
pub enum Width {
    /// One value per 32-bit word.
    Q1_31,
    /// Two values packed per 32-bit word; the primary one in the low half.
    Q1_15,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
pub enum CordicState {
    Reset,
    Init,
    Idle,
    Active,
    Abort,
}

#[derive(Clone, Debug, PartialEq, defmt::Format)]
pub struct CordicConfig {
    pub function: Function,
    /// Scaling factor: arguments are multiplied by 2^-n, and results by 2^n. 0 - 7; allowed
    /// values depend on the function.
    pub scale: u8,
    pub nb_write: NbData,
    pub nb_read: NbData,
    pub width_in: Width,
    pub width_out: Width,
    /// Number of iterations, in multiples of 4. 1 - 6, or 1 - 3 for square root.
    pub precision: u8,
}

impl Default for CordicConfig {
    fn default() -> Self {
        Self {
            function: Function::Cosine,
            scale: 0,
            nb_write: NbData::One,
            nb_read: NbData::One,
            width_in: Width::Q1_31,
            width_out: Width::Q1_31,
            precision: 5,
        }
    }
}

/// Handlers run on transfer events. They default to doing nothing.
pub struct CordicCallbacks<R> {
    pub error: fn(&mut Cordic<R>),
    pub abort_cplt: fn(&mut Cordic<R>),
    pub write_cplt: fn(&mut Cordic<R>),
    pub write_half_cplt: fn(&mut Cordic<R>),
    pub read_half_cplt: fn(&mut Cordic<R>),
    pub calculate_cplt: fn(&mut Cordic<R>),
}

fn no_op<R>(_: &mut Cordic<R>) {}

impl<R> Default for CordicCallbacks<R> {
    fn default() -> Self {
        Self {
            error: no_op,
            abort_cplt: no_op,
            write_cplt: no_op,
            write_half_cplt: no_op,
            read_half_cplt: no_op,
            calculate_cplt: no_op,
        }
    }
}

/// Represents the CORDIC peripheral.
pub struct Cordic<R> {
    pub regs: R,
    state: CordicState,
    last_error_codes: u32,
    input: XferBuf<u32>,
    output: XferBuf<u32>,
    /// Calculations left to start, in interrupt mode.
    to_do: usize,
    /// Results left to read, in interrupt mode.
    to_get: usize,
    dma_in: Option<DmaChannel>,
    dma_out: Option<DmaChannel>,
    aborts_pending: u8,
    callbacks: CordicCallbacks<R>,
}

impl<R> Cordic<R>
where
    R: Deref<Target = pac::cordic::RegisterBlock>,
{
    /// Initialize the CORDIC peripheral, including enabling and resetting
    /// its RCC peripheral clock. Call `set_config` before using it.
    pub fn new(regs: R, rcc: &pac::rcc::RegisterBlock) -> Self {
        critical_section::with(|_| {
            rcc_en_reset!(ahb1, cordic, rcc);
        });

        Self {
            regs,
            state: CordicState::Init,
            last_error_codes: 0,
            input: XferBuf::empty(),
            output: XferBuf::empty(),
            to_do: 0,
            to_get: 0,
            dma_in: None,
            dma_out: None,
            aborts_pending: 0,
            callbacks: Default::default(),
        }
    }

    /// Apply a configuration. Returns `InvalidParam` if the scale or precision isn't supported
    /// by the function.
    pub fn set_config(&mut self, cfg: &CordicConfig) -> Result<()> {
        check_state(self.state, &[CordicState::Init, CordicState::Idle])?;

        if !cfg.function.scale_valid(cfg.scale) || !cfg.function.precision_valid(cfg.precision) {
            return Err(Error::InvalidParam);
        }

        self.reset_arguments();

        self.regs.csr().modify(|_, w| unsafe {
            w.func().bits(cfg.function as u8);
            w.precision().bits(cfg.precision);
            w.scale().bits(cfg.scale);
            w.nargs().bit(cfg.nb_write == NbData::Two);
            w.nres().bit(cfg.nb_read == NbData::Two);
            w.argsize().bit(cfg.width_in == Width::Q1_15);
            w.ressize().bit(cfg.width_out == Width::Q1_15)
        });

        self.state = CordicState::Idle;
        Ok(())
    }

    /// Read back the configuration from the CSR register.
    pub fn config(&self) -> CordicConfig {
        let csr = self.regs.csr().read();
        let nb = |set| if set { NbData::Two } else { NbData::One };
        let width = |set| if set { Width::Q1_15 } else { Width::Q1_31 };

        CordicConfig {
            function: Function::from_bits(csr.func().bits()),
            scale: csr.scale().bits(),
            nb_write: nb(csr.nargs().bit_is_set()),
            nb_read: nb(csr.nres().bit_is_set()),
            width_in: width(csr.argsize().bit_is_set()),
            width_out: width(csr.ressize().bit_is_set()),
            precision: csr.precision().bits(),
        }
    }

    /// Changing the function clears the argument registers.
    fn reset_arguments(&self) {
        let saved = self.regs.csr().read().bits();

        self.regs.csr().modify(|_, w| unsafe {
            w.func().bits(Function::Sine as u8);
            w.scale().bits(0);
            w.nargs().set_bit();
            w.nres().set_bit();
            w.argsize().clear_bit();
            w.ressize().clear_bit()
        });
        self.write_word(ARG_RESET_1);
        self.write_word(ARG_RESET_2);
        let _ = self.read_word();
        let _ = self.read_word();

        self.regs.csr().write(|w| unsafe { w.bits(saved) });
    }

    pub fn set_function(&mut self, function: Function) -> Result<()> {
        check_state(self.state, &[CordicState::Idle])?;
        self.reset_arguments();
        self.regs.csr().modify(|_, w| unsafe { w.func().bits(function as u8) });
        Ok(())
    }

    /// Set the number of iterations, in multiples of 4. Checked against the current function.
    pub fn set_precision(&mut self, precision: u8) -> Result<()> {
        check_state(self.state, &[CordicState::Idle])?;
        if !self.config().function.precision_valid(precision) {
            return Err(Error::InvalidParam);
        }
        self.regs.csr().modify(|_, w| unsafe { w.precision().bits(precision) });
        Ok(())
    }

    /// Set the scale factor. Checked against the current function.
    pub fn set_scale(&mut self, scale: u8) -> Result<()> {
        check_state(self.state, &[CordicState::Idle])?;
        if !self.config().function.scale_valid(scale) {
            return Err(Error::InvalidParam);
        }
        self.regs.csr().modify(|_, w| unsafe { w.scale().bits(scale) });
        Ok(())
    }

    pub fn set_nb_write(&mut self, nb: NbData) -> Result<()> {
        check_state(self.state, &[CordicState::Idle])?;
        self.regs.csr().modify(|_, w| w.nargs().bit(nb == NbData::Two));
        Ok(())
    }

    pub fn set_nb_read(&mut self, nb: NbData) -> Result<()> {
        check_state(self.state, &[CordicState::Idle])?;
        self.regs.csr().modify(|_, w| w.nres().bit(nb == NbData::Two));
        Ok(())
    }

    pub fn set_width_in(&mut self, width: Width) -> Result<()> {
        check_state(self.state, &[CordicState::Idle])?;
        self.regs.csr().modify(|_, w| w.argsize().bit(width == Width::Q1_15));
        Ok(())
    }

    pub fn set_width_out(&mut self, width: Width) -> Result<()> {
        check_state(self.state, &[CordicState::Idle])?;
        self.regs.csr().modify(|_, w| w.ressize().bit(width == Width::Q1_15));
        Ok(())
    }

    /// Words written per calculation.
    fn words_in(&self) -> usize {
        let csr = self.regs.csr().read();
        if csr.nargs().bit_is_set() && csr.argsize().bit_is_clear() {
            2
        } else {
            1
        }
    }

    /// Words read per result.
    fn words_out(&self) -> usize {
        let csr = self.regs.csr().read();
        if csr.nres().bit_is_set() && csr.ressize().bit_is_clear() {
            2
        } else {
            1
        }
    }

    /// Number of calculations an input buffer holds. Must be at least one.
    fn nb_writes(&self, input: &[u32]) -> Result<usize> {
        match input.len() / self.words_in() {
            0 => Err(Error::InvalidParam),
            n => Ok(n),
        }
    }

    /// Number of results an output buffer holds. Must be at least one.
    fn nb_reads(&self, output: &[u32]) -> Result<usize> {
        match output.len() / self.words_out() {
            0 => Err(Error::InvalidParam),
            n => Ok(n),
        }
    }

    /// Number of calculations for a paired input and output; the output must hold every result.
    fn nb_calculations(&self, input: &[u32], output: &[u32]) -> Result<usize> {
        let n = self.nb_writes(input)?;
        if self.nb_reads(output)? < n {
            return Err(Error::InvalidParam);
        }
        Ok(n)
    }

    fn write_word(&self, word: u32) {
        self.regs.wdata().write(|w| unsafe { w.arg().bits(word) });
    }

    fn read_word(&self) -> u32 {
        self.regs.rdata().read().res().bits()
    }

    fn write_set(&self, set: &[u32]) {
        for word in set {
            self.write_word(*word);
        }
    }

    fn read_set(&self, set: &mut [u32]) {
        for word in set {
            *word = self.read_word();
        }
    }

    /// Run a calculation for each argument set in `input`, polling for each result. The
    /// timeout, in ms, applies to each result.
    pub fn calculate(&mut self, input: &[u32], output: &mut [u32], timeout: u32) -> Result<()> {
        let n = self.nb_calculations(input, output)?;
        check_update_state(&mut self.state, CordicState::Idle, CordicState::Active)?;
        self.last_error_codes = 0;

        let (w_in, w_out) = (self.words_in(), self.words_out());
        let mut sets_in = input.chunks_exact(w_in).take(n);
        let mut sets_out = output.chunks_exact_mut(w_out);

        // The next calculation is queued before reading each result.
        if let Some(set) = sets_in.next() {
            self.write_set(set);
        }
        for set in sets_in {
            self.write_set(set);

            let regs = &self.regs;
            if let Err(e) = tick::wait_until(|| regs.csr().read().rrdy().bit_is_set(), timeout) {
                self.state = CordicState::Idle;
                return Err(e);
            }
            if let Some(out) = sets_out.next() {
                self.read_set(out);
            }
        }
        if let Some(out) = sets_out.next() {
            self.read_set(out);
        }

        self.state = CordicState::Idle;
        Ok(())
    }

    /// Like `calculate`, but doesn't poll RRDY: each read of RDATA stalls the bus until its
    /// result is ready. Fastest, but blocks other bus masters while it waits.
    pub fn calculate_zero_overhead(&mut self, input: &[u32], output: &mut [u32]) -> Result<()> {
        let n = self.nb_calculations(input, output)?;
        check_update_state(&mut self.state, CordicState::Idle, CordicState::Active)?;
        self.last_error_codes = 0;

        let (w_in, w_out) = (self.words_in(), self.words_out());
        let mut sets_in = input.chunks_exact(w_in).take(n);
        let mut sets_out = output.chunks_exact_mut(w_out);

        if let Some(set) = sets_in.next() {
            self.write_set(set);
        }
        for set in sets_in {
            self.write_set(set);
            if let Some(out) = sets_out.next() {
                self.read_set(out);
            }
        }
        if let Some(out) = sets_out.next() {
            self.read_set(out);
        }

        self.state = CordicState::Idle;
        Ok(())
    }

    /// Write argument sets, without reading results. The peripheral stays active; follow
    /// with `read`, `read_it` or `read_dma`.
    pub fn write(&mut self, input: &[u32], timeout: u32) -> Result<()> {
        let n = self.nb_writes(input)?;
        check_update_state(&mut self.state, CordicState::Idle, CordicState::Active)?;
        self.last_error_codes = 0;

        let start = tick::get_tick();
        for (i, set) in input.chunks_exact(self.words_in()).take(n).enumerate() {
            self.write_set(set);
            if i + 1 < n && tick::timed_out(start, timeout) {
                self.state = CordicState::Idle;
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    /// Read results of calculations started with a write. The timeout applies to each result.
    pub fn read(&mut self, output: &mut [u32], timeout: u32) -> Result<()> {
        let n = self.nb_reads(output)?;
        check_state(self.state, &[CordicState::Active])?;

        let w_out = self.words_out();
        for (i, set) in output.chunks_exact_mut(w_out).take(n).enumerate() {
            // The final result is read directly; RDATA stalls until it's ready.
            if i + 1 < n {
                let regs = &self.regs;
                if let Err(e) = tick::wait_until(|| regs.csr().read().rrdy().bit_is_set(), timeout) {
                    self.state = CordicState::Idle;
                    return Err(e);
                }
            }
            self.read_set(set);
        }

        self.state = CordicState::Idle;
        Ok(())
    }

    /// Pop one argument set from the stored input buffer into WDATA.
    unsafe fn write_next(&mut self) {
        for _ in 0..self.words_in() {
            let word = unsafe { self.input.pop() };
            self.write_word(word);
        }
    }

    /// Push one result set from RDATA into the stored output buffer.
    unsafe fn read_next(&mut self) {
        for _ in 0..self.words_out() {
            let word = self.read_word();
            unsafe { self.output.push(word) };
        }
    }

    /// Start calculations on each argument set in `input`, with results read in `irq_handler`.
    /// `calculate_cplt` runs once every result is in `output`.
    ///
    /// # Safety
    /// `input` and `output` must stay valid, and `output` must not be accessed, until the
    /// transfer completes or is aborted.
    pub unsafe fn calculate_it(&mut self, input: &[u32], output: &mut [u32]) -> Result<()> {
        let n = self.nb_calculations(input, output)?;
        check_update_state(&mut self.state, CordicState::Idle, CordicState::Active)?;
        self.last_error_codes = 0;

        self.input = XferBuf {
            ptr: input.as_ptr() as *mut u32,
            remaining: n * self.words_in(),
        };
        self.output = XferBuf {
            ptr: output.as_mut_ptr(),
            remaining: n * self.words_out(),
        };
        self.to_do = n - 1;
        self.to_get = n;

        self.regs.csr().modify(|_, w| w.ien().set_bit());
        unsafe { self.write_next() };
        Ok(())
    }

    /// Write argument sets, feeding each one in `irq_handler` once the previous result is
    /// ready. `write_cplt` runs after the last write.
    ///
    /// # Safety
    /// `input` must stay valid until the transfer completes or is aborted.
    pub unsafe fn write_it(&mut self, input: &[u32]) -> Result<()> {
        let n = self.nb_writes(input)?;
        check_update_state(&mut self.state, CordicState::Idle, CordicState::Active)?;
        self.last_error_codes = 0;

        self.input = XferBuf {
            ptr: input.as_ptr() as *mut u32,
            remaining: n * self.words_in(),
        };
        self.to_do = n - 1;
        self.to_get = 0;

        unsafe { self.write_next() };
        if self.to_do == 0 {
            (self.callbacks.write_cplt)(self);
        } else {
            self.regs.csr().modify(|_, w| w.ien().set_bit());
        }
        Ok(())
    }

    /// Read results in `irq_handler`, following a write. `calculate_cplt` runs once
    /// `output` is full.
    ///
    /// # Safety
    /// `output` must stay valid, and not be accessed, until the transfer completes or is aborted.
    pub unsafe fn read_it(&mut self, output: &mut [u32]) -> Result<()> {
        let n = self.nb_reads(output)?;
        check_state(self.state, &[CordicState::Active])?;

        self.output = XferBuf {
            ptr: output.as_mut_ptr(),
            remaining: n * self.words_out(),
        };
        self.to_get = n;

        self.regs.csr().modify(|_, w| w.ien().set_bit());
        Ok(())
    }

    /// Handle the CORDIC interrupt. Run this in the `CORDIC` ISR.
    pub fn irq_handler(&mut self) {
        let csr = self.regs.csr().read();
        if csr.ien().bit_is_clear() || csr.rrdy().bit_is_clear() {
            return;
        }

        if self.to_get > 0 {
            self.to_get -= 1;
            unsafe { self.read_next() };

            if self.to_do > 0 {
                self.to_do -= 1;
                unsafe { self.write_next() };
            }

            if self.to_get == 0 {
                self.regs.csr().modify(|_, w| w.ien().clear_bit());
                self.state = CordicState::Idle;
                (self.callbacks.calculate_cplt)(self);
            }
        } else if self.to_do > 0 {
            self.to_do -= 1;
            unsafe { self.write_next() };

            if self.to_do == 0 {
                self.regs.csr().modify(|_, w| w.ien().clear_bit());
                (self.callbacks.write_cplt)(self);
            }
        }
    }

    /// Set the channel that feeds WDATA. Configure it first, with the `CordicWrite` request,
    /// memory-to-peripheral, and 32-bit widths.
    pub fn set_write_dma(&mut self, ch: DmaChannel) -> Result<()> {
        check_state(self.state, &[CordicState::Init, CordicState::Idle])?;
        self.dma_in = Some(ch);
        Ok(())
    }

    /// Set the channel that drains RDATA. Configure it first, with the `CordicRead` request,
    /// peripheral-to-memory, and 32-bit widths.
    pub fn set_read_dma(&mut self, ch: DmaChannel) -> Result<()> {
        check_state(self.state, &[CordicState::Init, CordicState::Idle])?;
        self.dma_out = Some(ch);
        Ok(())
    }

    /// Start the input channel, and enable WDATA DMA requests.
    fn start_dma_in(&mut self, input: &[u32], n: usize, opt: DmaOptIt) -> Result<()> {
        let size = (n * self.words_in() * 4) as u32;
        let dst = dma::reg_addr(self.regs.wdata());
        let ch = self.dma_in.as_mut().ok_or(Error::InvalidParam)?;

        ch.start_periph_xfer_it_opt(input.as_ptr() as u32, dst, size, opt)?;
        self.regs.csr().modify(|_, w| w.dmawen().set_bit());
        Ok(())
    }

    /// Start the output channel, and enable RDATA DMA requests.
    fn start_dma_out(&mut self, output: &mut [u32], n: usize, opt: DmaOptIt) -> Result<()> {
        let size = (n * self.words_out() * 4) as u32;
        let src = dma::reg_addr(self.regs.rdata());
        let ch = self.dma_out.as_mut().ok_or(Error::InvalidParam)?;

        ch.start_periph_xfer_it_opt(src, output.as_mut_ptr() as u32, size, opt)?;
        self.regs.csr().modify(|_, w| w.dmaren().set_bit());
        Ok(())
    }

    /// Unwind a failed DMA start.
    fn dma_start_failed(&mut self, e: Error) -> Error {
        self.regs
            .csr()
            .modify(|_, w| w.dmaren().clear_bit().dmawen().clear_bit());
        for ch in [self.dma_in.as_mut(), self.dma_out.as_mut()].into_iter().flatten() {
            if ch.state() == DmaState::Active {
                // Reported through the channel's own error codes.
                let _ = ch.abort();
            }
        }
        self.last_error_codes |= CordicError::Dma as u32;
        self.state = CordicState::Idle;
        e
    }

    /// Calculate using DMA for both arguments and results. Both channels must be set.
    ///
    /// # Safety
    /// `input` and `output` must stay valid, and `output` must not be accessed, until the
    /// transfer completes or is aborted.
    pub unsafe fn calculate_dma(
        &mut self,
        input: &[u32],
        output: &mut [u32],
        opt: DmaOptIt,
    ) -> Result<()> {
        if self.dma_in.is_none() || self.dma_out.is_none() {
            return Err(Error::InvalidParam);
        }
        let n = self.nb_calculations(input, output)?;
        check_update_state(&mut self.state, CordicState::Idle, CordicState::Active)?;
        self.last_error_codes = 0;

        // Results channel first, so no result is missed.
        self.start_dma_out(output, n, opt)
            .and_then(|_| self.start_dma_in(input, n, opt))
            .map_err(|e| self.dma_start_failed(e))
    }

    /// Write argument sets using DMA. `write_cplt` runs when the channel completes.
    ///
    /// # Safety
    /// `input` must stay valid until the transfer completes or is aborted.
    pub unsafe fn write_dma(&mut self, input: &[u32], opt: DmaOptIt) -> Result<()> {
        if self.dma_in.is_none() {
            return Err(Error::InvalidParam);
        }
        let n = self.nb_writes(input)?;
        check_update_state(&mut self.state, CordicState::Idle, CordicState::Active)?;
        self.last_error_codes = 0;

        self.start_dma_in(input, n, opt)
            .map_err(|e| self.dma_start_failed(e))
    }

    /// Read results using DMA, following a write. `calculate_cplt` runs when the channel
    /// completes.
    ///
    /// # Safety
    /// `output` must stay valid, and not be accessed, until the transfer completes or is aborted.
    pub unsafe fn read_dma(&mut self, output: &mut [u32], opt: DmaOptIt) -> Result<()> {
        if self.dma_out.is_none() {
            return Err(Error::InvalidParam);
        }
        let n = self.nb_reads(output)?;
        check_state(self.state, &[CordicState::Active])?;

        self.start_dma_out(output, n, opt)
            .map_err(|e| self.dma_start_failed(e))
    }

    fn dma_error(&mut self) {
        self.last_error_codes |= CordicError::Dma as u32;
        self.state = CordicState::Idle;
        (self.callbacks.error)(self);
    }

    /// Run this in the ISR of the channel set with `set_write_dma`.
    pub fn dma_in_irq_handler(&mut self) {
        let Some(ch) = self.dma_in.as_mut() else {
            return;
        };
        let circular = ch.is_circular();
        let Some(event) = ch.irq_handler() else {
            return;
        };

        match event {
            DmaEvent::Complete => {
                if !circular {
                    self.to_do = 0;
                    self.regs.csr().modify(|_, w| w.dmawen().clear_bit());
                }
                (self.callbacks.write_cplt)(self);
            }
            DmaEvent::HalfComplete => (self.callbacks.write_half_cplt)(self),
            DmaEvent::Error(_) => self.dma_error(),
            DmaEvent::Aborted => {
                self.regs.csr().modify(|_, w| w.dmawen().clear_bit());
                self.abort_step();
            }
            DmaEvent::Suspended => (),
        }
    }

    /// Run this in the ISR of the channel set with `set_read_dma`.
    pub fn dma_out_irq_handler(&mut self) {
        let Some(ch) = self.dma_out.as_mut() else {
            return;
        };
        let circular = ch.is_circular();
        let Some(event) = ch.irq_handler() else {
            return;
        };

        match event {
            DmaEvent::Complete => {
                if !circular {
                    self.to_get = 0;
                    self.state = CordicState::Idle;
                    self.regs
                        .csr()
                        .modify(|_, w| w.dmaren().clear_bit().ien().clear_bit());
                }
                (self.callbacks.calculate_cplt)(self);
            }
            DmaEvent::HalfComplete => (self.callbacks.read_half_cplt)(self),
            DmaEvent::Error(_) => self.dma_error(),
            DmaEvent::Aborted => {
                self.regs.csr().modify(|_, w| w.dmaren().clear_bit());
                self.abort_step();
            }
            DmaEvent::Suspended => (),
        }
    }

    /// Stop any calculation in progress, blocking until its DMA channels stop.
    pub fn abort(&mut self) -> Result<()> {
        check_update_state(&mut self.state, CordicState::Active, CordicState::Abort)?;

        let csr = self.regs.csr().read();
        if csr.dmaren().bit_is_set() {
            self.regs.csr().modify(|_, w| w.dmaren().clear_bit());
            if let Some(ch) = self.dma_out.as_mut() {
                // A channel that already finished reports `NotActive`; nothing to undo.
                let _ = ch.abort();
            }
        }
        if csr.dmawen().bit_is_set() {
            self.regs.csr().modify(|_, w| w.dmawen().clear_bit());
            if let Some(ch) = self.dma_in.as_mut() {
                let _ = ch.abort();
            }
        }

        self.finish_abort();
        Ok(())
    }

    /// Stop any calculation in progress. DMA channels are stopped with interrupts; `abort_cplt`
    /// runs once the last one has. If no DMA is running, it runs before this returns.
    pub fn abort_it(&mut self) -> Result<()> {
        check_update_state(&mut self.state, CordicState::Active, CordicState::Abort)?;

        let csr = self.regs.csr().read();
        self.aborts_pending = 0;
        for (enabled, ch) in [
            (csr.dmaren().bit_is_set(), self.dma_out.as_mut()),
            (csr.dmawen().bit_is_set(), self.dma_in.as_mut()),
        ] {
            if let (true, Some(ch)) = (enabled, ch)
                && ch.state() == DmaState::Active
                && ch.abort_it().is_ok()
            {
                self.aborts_pending += 1;
            }
        }

        if self.aborts_pending == 0 {
            self.regs
                .csr()
                .modify(|_, w| w.dmaren().clear_bit().dmawen().clear_bit());
            self.finish_abort();
            (self.callbacks.abort_cplt)(self);
        }
        Ok(())
    }

    /// A DMA channel finished aborting.
    fn abort_step(&mut self) {
        if self.state != CordicState::Abort {
            return;
        }
        self.aborts_pending = self.aborts_pending.saturating_sub(1);
        if self.aborts_pending == 0 {
            self.finish_abort();
            (self.callbacks.abort_cplt)(self);
        }
    }

    fn finish_abort(&mut self) {
        self.regs.csr().modify(|_, w| w.ien().clear_bit());
        self.input = XferBuf::empty();
        self.output = XferBuf::empty();
        self.to_do = 0;
        self.to_get = 0;
        self.last_error_codes = 0;
        self.state = CordicState::Idle;
    }

    pub fn register_error_callback(&mut self, cb: fn(&mut Self)) -> Result<()> {
        check_state(self.state, &[CordicState::Init, CordicState::Idle])?;
        self.callbacks.error = cb;
        Ok(())
    }

    pub fn register_abort_cplt_callback(&mut self, cb: fn(&mut Self)) -> Result<()> {
        check_state(self.state, &[CordicState::Init, CordicState::Idle])?;
        self.callbacks.abort_cplt = cb;
        Ok(())
    }

    pub fn register_write_cplt_callback(&mut self, cb: fn(&mut Self)) -> Result<()> {
        check_state(self.state, &[CordicState::Init, CordicState::Idle])?;
        self.callbacks.write_cplt = cb;
        Ok(())
    }

    pub fn register_write_half_cplt_callback(&mut self, cb: fn(&mut Self)) -> Result<()> {
        check_state(self.state, &[CordicState::Init, CordicState::Idle])?;
        self.callbacks.write_half_cplt = cb;
        Ok(())
    }

    pub fn register_read_half_cplt_callback(&mut self, cb: fn(&mut Self)) -> Result<()> {
        check_state(self.state, &[CordicState::Init, CordicState::Idle])?;
        self.callbacks.read_half_cplt = cb;
        Ok(())
    }

    pub fn register_calculate_cplt_callback(&mut self, cb: fn(&mut Self)) -> Result<()> {
        check_state(self.state, &[CordicState::Init, CordicState::Idle])?;
        self.callbacks.calculate_cplt = cb;
        Ok(())
    }

    pub fn state(&self) -> CordicState {
        self.state
    }

    /// A bitmask of `CordicError` values.
    pub fn last_error_codes(&self) -> u32 {
        self.last_error_codes
    }

    /// Address of WDATA, for use as a DMA destination.
    pub fn write_address(&self) -> u32 {
        dma::reg_addr(self.regs.wdata())
    }

    /// Address of RDATA, for use as a DMA source.
    pub fn read_address(&self) -> u32 {
        dma::reg_addr(self.regs.rdata())
    }
}

const Q31_SCALE: f32 = 2_147_483_648.;
const Q15_SCALE: f32 = 32_768.;

/// Convert to q1.31, saturating outside [-1, 1).
pub fn f32_to_q31(v: f32) -> u32 {
    let scaled = Float::round(v * Q31_SCALE);
    if scaled >= Q31_SCALE {
        i32::MAX as u32
    } else if scaled <= -Q31_SCALE {
        i32::MIN as u32
    } else {
        scaled as i32 as u32
    }
}

pub fn q31_to_f32(v: u32) -> f32 {
    v as i32 as f32 / Q31_SCALE
}

/// Convert to q1.15, saturating outside [-1, 1). Pack two of these per word for 16-bit mode.
pub fn f32_to_q15(v: f32) -> u16 {
    let scaled = Float::round(v * Q15_SCALE);
    if scaled >= Q15_SCALE {
        i16::MAX as u16
    } else if scaled <= -Q15_SCALE {
        i16::MIN as u16
    } else {
        scaled as i16 as u16
    }
}

pub fn q15_to_f32(v: u16) -> f32 {
    v as i16 as f32 / Q15_SCALE
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::{
        dma::{ChannelCfg, DmaInput, DTEF, SUSPF, TCF, tests::fake_channel},
        util::{fake, peek, poke, poke_set},
    };

    type Regs = &'static pac::cordic::RegisterBlock;
    type GpdmaRegs = &'static pac::gpdma1::RegisterBlock;

    const RRDY: u32 = 1 << 31;

    fn setup(cfg: &CordicConfig) -> (Regs, Cordic<Regs>) {
        let regs: Regs = fake();
        let rcc: &pac::rcc::RegisterBlock = fake();
        let mut cordic = Cordic::new(regs, rcc);
        assert!(rcc.ahb1enr().read().cordicen().bit_is_set());
        assert_eq!(cordic.state(), CordicState::Init);

        cordic.set_config(cfg).unwrap();
        (regs, cordic)
    }

    fn sine_pairs() -> CordicConfig {
        CordicConfig {
            function: Function::Sine,
            nb_write: NbData::Two,
            nb_read: NbData::Two,
            ..Default::default()
        }
    }

    #[test]
    fn config_is_validated_and_applied() {
        let regs: Regs = fake();
        let mut cordic = Cordic::new(regs, fake());

        let bad_scale = CordicConfig {
            scale: 1,
            ..Default::default()
        };
        assert_eq!(cordic.set_config(&bad_scale), Err(Error::InvalidParam));

        let bad_ln = CordicConfig {
            function: Function::NaturalLog,
            scale: 0,
            ..Default::default()
        };
        assert_eq!(cordic.set_config(&bad_ln), Err(Error::InvalidParam));

        let bad_sqrt = CordicConfig {
            function: Function::SquareRoot,
            precision: 4,
            ..Default::default()
        };
        assert_eq!(cordic.set_config(&bad_sqrt), Err(Error::InvalidParam));
        assert_eq!(cordic.state(), CordicState::Init);

        let cfg = CordicConfig {
            function: Function::NaturalLog,
            scale: 3,
            nb_write: NbData::Two,
            width_out: Width::Q1_15,
            precision: 6,
            ..Default::default()
        };
        cordic.set_config(&cfg).unwrap();
        assert_eq!(cordic.state(), CordicState::Idle);
        assert_eq!(cordic.config(), cfg);
        // Flushed with the dummy arguments.
        assert_eq!(peek(regs.wdata()), ARG_RESET_2);

        assert_eq!(cordic.set_scale(0), Err(Error::InvalidParam));
        cordic.set_scale(4).unwrap();
        cordic.set_function(Function::Arctangent).unwrap();
        cordic.set_width_in(Width::Q1_15).unwrap();
        let cfg = cordic.config();
        assert_eq!(cfg.function, Function::Arctangent);
        assert_eq!(cfg.scale, 4);
        assert_eq!(cfg.width_in, Width::Q1_15);
    }

    #[test]
    fn calculate_polls_each_result() {
        let (regs, mut cordic) = setup(&sine_pairs());
        poke_set(regs.csr(), RRDY);
        poke(regs.rdata(), 0x1234);

        let input = [1, 2, 3, 4];
        let mut output = [0; 4];
        cordic.calculate(&input, &mut output, 10).unwrap();

        assert_eq!(output, [0x1234; 4]);
        assert_eq!(peek(regs.wdata()), 4);
        assert_eq!(cordic.state(), CordicState::Idle);

        // Too small for two results.
        let mut short = [0; 3];
        assert_eq!(
            cordic.calculate(&input, &mut short, 10),
            Err(Error::InvalidParam)
        );
        assert_eq!(cordic.calculate(&[1], &mut output, 10), Err(Error::InvalidParam));
    }

    #[test]
    fn calculate_times_out() {
        let (_regs, mut cordic) = setup(&CordicConfig::default());
        let mut output = [0; 2];

        assert_eq!(
            cordic.calculate(&[1, 2], &mut output, 0),
            Err(Error::Timeout)
        );
        assert_eq!(cordic.state(), CordicState::Idle);

        // A single calculation never waits.
        cordic.calculate_zero_overhead(&[1], &mut output).unwrap();
    }

    #[test]
    fn write_then_read() {
        let (regs, mut cordic) = setup(&CordicConfig::default());
        let mut output = [0; 3];
        assert_eq!(cordic.read(&mut output, 0), Err(Error::Busy));

        cordic.write(&[5], 0).unwrap();
        assert_eq!(cordic.state(), CordicState::Active);
        assert_eq!(cordic.set_precision(3), Err(Error::Busy));

        poke_set(regs.csr(), RRDY);
        poke(regs.rdata(), 77);
        cordic.read(&mut output, 0).unwrap();
        assert_eq!(output, [77; 3]);
        assert_eq!(cordic.state(), CordicState::Idle);
    }

    static CALC_DONE: AtomicU32 = AtomicU32::new(0);
    static ABORT_DONE: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn calculate_it_runs_in_isr() {
        let (regs, mut cordic) = setup(&CordicConfig::default());
        cordic
            .register_calculate_cplt_callback(|_| {
                CALC_DONE.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        let input = [10, 20, 30];
        let mut output = [0; 3];
        unsafe { cordic.calculate_it(&input, &mut output).unwrap() };
        assert!(regs.csr().read().ien().bit_is_set());
        assert_eq!(peek(regs.wdata()), 10);

        // Not ready yet.
        cordic.irq_handler();
        assert_eq!(cordic.state(), CordicState::Active);

        poke_set(regs.csr(), RRDY);
        for (i, result) in [100, 200, 300].into_iter().enumerate() {
            poke(regs.rdata(), result);
            cordic.irq_handler();
            if i < 2 {
                assert_eq!(peek(regs.wdata()), input[i + 1]);
            }
        }

        assert_eq!(output, [100, 200, 300]);
        assert_eq!(cordic.state(), CordicState::Idle);
        assert!(regs.csr().read().ien().bit_is_clear());
        assert_eq!(CALC_DONE.load(Ordering::Relaxed), 1);
    }

    static WRITE_DONE: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn write_it_then_read_it() {
        let (regs, mut cordic) = setup(&CordicConfig::default());
        cordic
            .register_write_cplt_callback(|_| {
                WRITE_DONE.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        let input = [1, 2];
        unsafe { cordic.write_it(&input).unwrap() };
        poke_set(regs.csr(), RRDY);
        cordic.irq_handler();
        assert_eq!(peek(regs.wdata()), 2);
        assert_eq!(WRITE_DONE.load(Ordering::Relaxed), 1);
        assert!(regs.csr().read().ien().bit_is_clear());
        assert_eq!(cordic.state(), CordicState::Active);

        let mut output = [0; 2];
        poke(regs.rdata(), 9);
        unsafe { cordic.read_it(&mut output).unwrap() };
        cordic.irq_handler();
        cordic.irq_handler();
        assert_eq!(output, [9, 9]);
        assert_eq!(cordic.state(), CordicState::Idle);
    }

    fn with_dma(cordic: &mut Cordic<Regs>) -> (GpdmaRegs, GpdmaRegs) {
        let (dma_in, ch_in) = fake_channel(
            0,
            &ChannelCfg {
                request: DmaInput::CordicWrite,
                ..Default::default()
            },
        );
        let (dma_out, ch_out) = fake_channel(
            1,
            &ChannelCfg {
                request: DmaInput::CordicRead,
                direction: dma::Direction::PeriphToMem,
                src_incr: false,
                dst_incr: true,
                ..Default::default()
            },
        );
        cordic.set_write_dma(ch_in).unwrap();
        cordic.set_read_dma(ch_out).unwrap();
        (dma_in, dma_out)
    }

    #[test]
    fn calculate_dma_needs_channels() {
        let (_regs, mut cordic) = setup(&CordicConfig::default());
        let mut output = [0; 4];
        assert_eq!(
            unsafe { cordic.calculate_dma(&[1, 2], &mut output, DmaOptIt::None) },
            Err(Error::InvalidParam)
        );
        assert_eq!(cordic.state(), CordicState::Idle);
    }

    static DMA_WRITE_DONE: AtomicU32 = AtomicU32::new(0);
    static DMA_CALC_DONE: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn calculate_dma_completes() {
        let (regs, mut cordic) = setup(&sine_pairs());
        let (dma_in, dma_out) = with_dma(&mut cordic);
        cordic
            .register_write_cplt_callback(|_| {
                DMA_WRITE_DONE.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        cordic
            .register_calculate_cplt_callback(|_| {
                DMA_CALC_DONE.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        let input = [1u32; 8];
        let mut output = [0u32; 8];
        unsafe {
            cordic
                .calculate_dma(&input, &mut output, DmaOptIt::HalfTransfer)
                .unwrap()
        };

        assert!(regs.csr().read().dmaren().bit_is_set());
        assert!(regs.csr().read().dmawen().bit_is_set());
        assert_eq!(dma_in.ch(0).sar().read().bits(), input.as_ptr() as u32);
        assert_eq!(dma_in.ch(0).dar().read().bits(), cordic.write_address());
        assert_eq!(dma_out.ch(1).sar().read().bits(), cordic.read_address());
        assert_eq!(dma_out.ch(1).br1().read().bndt().bits(), 32);

        poke(dma_in.ch(0).sr(), TCF);
        cordic.dma_in_irq_handler();
        assert!(regs.csr().read().dmawen().bit_is_clear());
        assert_eq!(DMA_WRITE_DONE.load(Ordering::Relaxed), 1);
        assert_eq!(cordic.state(), CordicState::Active);

        poke(dma_out.ch(1).sr(), TCF);
        cordic.dma_out_irq_handler();
        assert!(regs.csr().read().dmaren().bit_is_clear());
        assert_eq!(DMA_CALC_DONE.load(Ordering::Relaxed), 1);
        assert_eq!(cordic.state(), CordicState::Idle);
    }

    static DMA_ERRORS: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn dma_error_returns_to_idle() {
        let (_regs, mut cordic) = setup(&CordicConfig::default());
        let (_dma_in, dma_out) = with_dma(&mut cordic);
        cordic
            .register_error_callback(|_| {
                DMA_ERRORS.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        let mut output = [0u32; 2];
        unsafe {
            cordic
                .calculate_dma(&[1, 2], &mut output, DmaOptIt::None)
                .unwrap()
        };

        poke(dma_out.ch(1).sr(), DTEF);
        cordic.dma_out_irq_handler();
        assert_eq!(cordic.state(), CordicState::Idle);
        assert_eq!(cordic.last_error_codes(), CordicError::Dma as u32);
        assert_eq!(DMA_ERRORS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn blocking_abort_stops_dma() {
        let (regs, mut cordic) = setup(&CordicConfig::default());
        assert_eq!(cordic.abort(), Err(Error::Busy));
        let (dma_in, dma_out) = with_dma(&mut cordic);

        let mut output = [0u32; 2];
        unsafe {
            cordic
                .calculate_dma(&[1, 2], &mut output, DmaOptIt::None)
                .unwrap()
        };
        poke(dma_in.ch(0).sr(), SUSPF);
        poke(dma_out.ch(1).sr(), SUSPF);

        cordic.abort().unwrap();
        assert_eq!(cordic.state(), CordicState::Idle);
        assert!(regs.csr().read().dmaren().bit_is_clear());
        assert!(regs.csr().read().dmawen().bit_is_clear());
    }

    #[test]
    fn abort_it_waits_for_both_channels() {
        let (_regs, mut cordic) = setup(&CordicConfig::default());
        let (dma_in, dma_out) = with_dma(&mut cordic);
        cordic
            .register_abort_cplt_callback(|_| {
                ABORT_DONE.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        let mut output = [0u32; 2];
        unsafe {
            cordic
                .calculate_dma(&[1, 2], &mut output, DmaOptIt::None)
                .unwrap()
        };
        cordic.abort_it().unwrap();
        assert_eq!(cordic.state(), CordicState::Abort);

        poke(dma_out.ch(1).sr(), SUSPF);
        cordic.dma_out_irq_handler();
        assert_eq!(cordic.state(), CordicState::Abort);
        assert_eq!(ABORT_DONE.load(Ordering::Relaxed), 0);

        poke(dma_in.ch(0).sr(), SUSPF);
        cordic.dma_in_irq_handler();
        assert_eq!(cordic.state(), CordicState::Idle);
        assert_eq!(ABORT_DONE.load(Ordering::Relaxed), 1);
    }

    static IT_ABORT_DONE: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn abort_it_without_dma_completes_at_once() {
        let (regs, mut cordic) = setup(&CordicConfig::default());
        cordic
            .register_abort_cplt_callback(|_| {
                IT_ABORT_DONE.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        let mut output = [0u32; 2];
        unsafe { cordic.calculate_it(&[1, 2], &mut output).unwrap() };
        cordic.abort_it().unwrap();

        assert_eq!(cordic.state(), CordicState::Idle);
        assert!(regs.csr().read().ien().bit_is_clear());
        assert_eq!(IT_ABORT_DONE.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn fixed_point_conversions() {
        assert_eq!(f32_to_q31(0.5), 0x4000_0000);
        assert_eq!(f32_to_q31(-1.), 0x8000_0000);
        assert_eq!(f32_to_q31(1.), 0x7FFF_FFFF);
        assert_eq!(f32_to_q31(3.), 0x7FFF_FFFF);
        assert_eq!(q31_to_f32(0xC000_0000), -0.5);

        assert_eq!(f32_to_q15(0.25), 0x2000);
        assert_eq!(f32_to_q15(-2.), 0x8000);
        assert_eq!(q15_to_f32(0x4000), 0.5);
    }
}
