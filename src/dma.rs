//! Support for the General Purpose Direct Memory Access (GPDMA) controller. This module handles
//! initialization, channel configuration, and the transfer state machine of each channel.
//!
//! A `DmaChannel` is handed to a peripheral driver (eg `Sai::set_dma`), which starts and
//! aborts transfers on it. Call that driver's `*_dma_irq_handler` from the channel's ISR; it runs
//! `DmaChannel::irq_handler`, and acts on the returned `DmaEvent`.
//!
//! Only direct (block) transfers are supported; no linked lists. Circular mode is handled in
//! software, by re-arming the channel on each transfer complete interrupt.

use core::ops::Deref;

use crate::{
    error::{Error, Result},
    pac::{
        self, Interrupt,
        gpdma1::{CH, ch::sr},
    },
    tick,
    util::{check_state, check_update_state, rcc_en_reset},
};

/// Number of channels on GPDMA1. 0 - 11 are linear; 12 - 15 also support 2D addressing.
pub const NUM_CHANNELS: usize = 16;
const NUM_LINEAR_CHANNELS: usize = 12;

/// Maximum time to wait for a channel to suspend, in ms.
const SUSPEND_TIMEOUT: u32 = 5;

// Channel event flags, as laid out in SR and FCR.
pub(crate) const TCF: u32 = 1 << 8;
pub(crate) const HTF: u32 = 1 << 9;
pub(crate) const DTEF: u32 = 1 << 10;
pub(crate) const ULEF: u32 = 1 << 11;
pub(crate) const USEF: u32 = 1 << 12;
pub(crate) const SUSPF: u32 = 1 << 13;
pub(crate) const TOF: u32 = 1 << 14;

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u32)]
/// DMA errors. The discriminants are the bits used in `last_error_codes`.
pub enum DmaError {
    /// Data transfer error: a bus error on the source or destination.
    Transfer = 1 << 0,
    /// User setting error: eg a block size that isn't a multiple of the data width.
    UserSetting = 1 << 1,
    /// Trigger overrun
    TriggerOverrun = 1 << 2,
    /// Update link transfer error
    UpdateLink = 1 << 3,
    /// The channel didn't suspend in time.
    Timeout = 1 << 4,
    /// Abort was requested on a channel that's already idle.
    NotActive = 1 << 5,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// GPDMA1 hardware request sources; the REQSEL value. Only the peripherals this crate supports
/// are listed. See U5 RM, Table 137: "Programmed GPDMA1 request".
pub enum DmaInput {
    Dac1Ch1 = 2,
    Dac1Ch2 = 3,
    Tim6Up = 4,
    Tim7Up = 5,
    Sai1A = 36,
    Sai1B = 37,
    Sai2A = 38,
    Sai2B = 39,
    Tim1Ch1 = 42,
    Tim1Ch2 = 43,
    Tim1Ch3 = 44,
    Tim1Ch4 = 45,
    Tim1Up = 46,
    Tim1Trig = 47,
    Tim1Com = 48,
    Tim8Ch1 = 49,
    Tim8Ch2 = 50,
    Tim8Ch3 = 51,
    Tim8Ch4 = 52,
    Tim8Up = 53,
    Tim8Trig = 54,
    Tim8Com = 55,
    Tim2Ch1 = 56,
    Tim2Ch2 = 57,
    Tim2Ch3 = 58,
    Tim2Ch4 = 59,
    Tim2Up = 60,
    Tim3Ch1 = 61,
    Tim3Ch2 = 62,
    Tim3Ch3 = 63,
    Tim3Ch4 = 64,
    Tim3Up = 65,
    Tim3Trig = 66,
    Tim4Ch1 = 67,
    Tim4Ch2 = 68,
    Tim4Ch3 = 69,
    Tim4Ch4 = 70,
    Tim4Up = 71,
    Tim5Ch1 = 72,
    Tim5Ch2 = 73,
    Tim5Ch3 = 74,
    Tim5Ch4 = 75,
    Tim5Up = 76,
    Tim5Trig = 77,
    Tim15Ch1 = 78,
    Tim15Up = 79,
    Tim15Trig = 80,
    Tim15Com = 81,
    Tim16Ch1 = 82,
    Tim16Up = 83,
    Tim17Ch1 = 84,
    Tim17Up = 85,
    DcmiPssi = 86,
    CordicRead = 101,
    CordicWrite = 102,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// Channel priority. (CR PRIO field). Low-priority requests are weighted-round-robin
/// arbitrated; high-priority ones always win. Only write to this when the channel is disabled.
pub enum Priority {
    LowWeightLow = 0b00,
    LowWeightMid = 0b01,
    LowWeightHigh = 0b10,
    High = 0b11,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
pub enum Direction {
    /// Memory to peripheral. The request comes from the destination.
    MemToPeriph,
    /// Peripheral to memory. The request comes from the source.
    PeriphToMem,
    /// Software request: the channel runs as soon as it's enabled.
    MemToMem,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// Source and destination data width. The value is log2 of the width in bytes. (CTR1 SDW_LOG2
/// and DDW_LOG2 fields)
pub enum DataWidth {
    Bits8 = 0b00,
    Bits16 = 0b01,
    Bits32 = 0b10,
}

impl DataWidth {
    pub fn bytes(&self) -> u32 {
        1 << (*self as u32)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
pub enum DmaMode {
    Normal,
    /// Restart from the start of the buffer after each transfer complete.
    Circular,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
/// Selects the optional DMA interrupts, when starting an interrupt-driven transfer. Transfer
/// complete, data transfer error, update link error, and user setting error interrupts are
/// always enabled, except in `Silent`.
pub enum DmaOptIt {
    /// No optional interrupts.
    None,
    /// Half transfer interrupt.
    HalfTransfer,
    /// Half transfer and trigger overrun interrupts.
    Default,
    /// No interrupts at all. Only valid in circular mode; stop with a blocking abort.
    Silent,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
/// Which level `poll_for_xfer` waits for.
pub enum XferLevel {
    Full,
    Half,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
pub enum DmaState {
    Reset,
    Init,
    Idle,
    Active,
    Suspend,
    Abort,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
/// What happened on a channel, as reported by `DmaChannel::irq_handler`.
pub enum DmaEvent {
    HalfComplete,
    Complete,
    Suspended,
    Aborted,
    Error(DmaError),
}

/// This struct is used to pass common (non-peripheral and non-use-specific) data when configuring
/// a channel.
#[derive(Clone, Debug)]
pub struct ChannelCfg {
    /// The peripheral request the channel serves. Ignored for `MemToMem`.
    pub request: DmaInput,
    pub direction: Direction,
    pub src_width: DataWidth,
    pub dst_width: DataWidth,
    /// Whether we increment the source address on data word transfer.
    pub src_incr: bool,
    /// Whether we increment the destination address on data word transfer.
    pub dst_incr: bool,
    /// Channel priority compared to other channels. Defaults to low-priority, with a low weight.
    pub priority: Priority,
    /// Enable or disable circular DMA. If enabled, the transfer continues after reaching the end of
    /// the buffer, looping to the beginning. Defaults to normal.
    pub mode: DmaMode,
}

impl Default for ChannelCfg {
    fn default() -> Self {
        Self {
            request: DmaInput::Dac1Ch1,
            direction: Direction::MemToPeriph,
            src_width: DataWidth::Bits32,
            dst_width: DataWidth::Bits32,
            // Increment the buffer address, not the peripheral address.
            src_incr: true,
            dst_incr: false,
            priority: Priority::LowWeightLow,
            mode: DmaMode::Normal,
        }
    }
}

/// Represents the GPDMA1 peripheral. Hands out its channels.
pub struct Dma<R> {
    pub regs: R,
    taken: u16,
}

impl<R> Dma<R>
where
    R: Deref<Target = pac::gpdma1::RegisterBlock>,
{
    /// Initialize the DMA peripheral, including enabling and resetting
    /// its RCC peripheral clock.
    pub fn new(regs: R, rcc: &pac::rcc::RegisterBlock) -> Self {
        critical_section::with(|_| {
            rcc_en_reset!(ahb1, gpdma1, rcc);
        });

        Self { regs, taken: 0 }
    }

    /// Take a channel, 0 through 15. Returns `Busy` if it's already been taken, and not released.
    ///
    /// `R` must deref to the same register block for as long as the channel is in use; this
    /// holds for `pac::GPDMA1`, and for `&'static` blocks.
    pub fn channel(&mut self, n: u8) -> Result<DmaChannel> {
        if n as usize >= NUM_CHANNELS {
            return Err(Error::InvalidParam);
        }
        if self.taken & (1 << n) != 0 {
            return Err(Error::Busy);
        }
        self.taken |= 1 << n;

        let i = n as usize;
        // The 2D channels share the linear channels' layout, up to the linked-list register.
        let regs = if i < NUM_LINEAR_CHANNELS {
            self.regs.ch(i) as *const CH
        } else {
            self.regs.ch2d(i - NUM_LINEAR_CHANNELS) as *const _ as *const CH
        };

        Ok(DmaChannel {
            regs,
            num: n,
            state: DmaState::Init,
            mode: DmaMode::Normal,
            src_width: DataWidth::Bits32,
            last_error_codes: 0,
            src: 0,
            dst: 0,
            size_bytes: 0,
        })
    }

    /// Return a channel, so it can be taken again. It's reset first.
    pub fn release(&mut self, ch: DmaChannel) {
        ch.reset();
        ch.regs().cr().reset();
        self.taken &= !(1 << ch.num);
    }
}

/// A single GPDMA1 channel, and its transfer state.
pub struct DmaChannel {
    regs: *const CH,
    num: u8,
    state: DmaState,
    mode: DmaMode,
    src_width: DataWidth,
    last_error_codes: u32,
    // Kept to re-arm circular transfers.
    src: u32,
    dst: u32,
    size_bytes: u32,
}

// The channel's registers are only accessed through `&mut self`, or `&self` reads.
unsafe impl Send for DmaChannel {}

impl DmaChannel {
    fn regs(&self) -> &'static CH {
        unsafe { &*self.regs }
    }

    /// Configure the channel's transfer parameters. The channel must be idle.
    pub fn set_config(&mut self, cfg: &ChannelCfg) -> Result<()> {
        check_state(self.state, &[DmaState::Init, DmaState::Idle])?;
        let regs = self.regs();

        regs.tr1().write(|w| unsafe {
            w.sdw_log2().bits(cfg.src_width as u8);
            w.sinc().bit(cfg.src_incr);
            w.ddw_log2().bits(cfg.dst_width as u8);
            w.dinc().bit(cfg.dst_incr)
        });

        regs.tr2().write(|w| unsafe {
            match cfg.direction {
                Direction::MemToPeriph => w.reqsel().bits(cfg.request as u8).dreq().set_bit(),
                Direction::PeriphToMem => w.reqsel().bits(cfg.request as u8),
                Direction::MemToMem => w.swreq().set_bit(),
            }
        });

        regs.cr().modify(|_, w| unsafe { w.prio().bits(cfg.priority as u8) });

        self.mode = cfg.mode;
        self.src_width = cfg.src_width;
        self.state = DmaState::Idle;
        Ok(())
    }

    /// Start a transfer, without interrupts. Use `poll_for_xfer` to wait for it.
    pub fn start_periph_xfer(&mut self, src: u32, dst: u32, size_bytes: u32) -> Result<()> {
        self.check_size(size_bytes)?;
        check_update_state(&mut self.state, DmaState::Idle, DmaState::Active)?;
        self.last_error_codes = 0;

        self.start_xfer(src, dst, size_bytes, DmaOptIt::Silent);
        Ok(())
    }

    /// Start a transfer, with transfer complete and error interrupts enabled, and the optional
    /// interrupts selected by `opt`.
    pub fn start_periph_xfer_it_opt(
        &mut self,
        src: u32,
        dst: u32,
        size_bytes: u32,
        opt: DmaOptIt,
    ) -> Result<()> {
        self.check_size(size_bytes)?;
        if opt == DmaOptIt::Silent && self.mode != DmaMode::Circular {
            return Err(Error::InvalidParam);
        }
        check_update_state(&mut self.state, DmaState::Idle, DmaState::Active)?;
        self.last_error_codes = 0;

        self.start_xfer(src, dst, size_bytes, opt);
        Ok(())
    }

    fn check_size(&self, size_bytes: u32) -> Result<()> {
        if size_bytes == 0 || size_bytes > 0xFFFF || size_bytes % self.src_width.bytes() != 0 {
            return Err(Error::InvalidParam);
        }
        Ok(())
    }

    fn start_xfer(&mut self, src: u32, dst: u32, size_bytes: u32, opt: DmaOptIt) {
        self.src = src;
        self.dst = dst;
        self.size_bytes = size_bytes;

        let regs = self.regs();
        self.load_block();
        self.clear_all_flags();
        self.disable_interrupts();

        if opt != DmaOptIt::Silent {
            let half = matches!(opt, DmaOptIt::HalfTransfer | DmaOptIt::Default);
            let overrun = opt == DmaOptIt::Default;
            regs.cr().modify(|_, w| {
                w.tcie().set_bit();
                w.htie().bit(half);
                w.toie().bit(overrun);
                w.dteie().set_bit();
                w.uleie().set_bit();
                w.useie().set_bit()
            });
        }

        // No linked-list: a single block.
        regs.llr().reset();
        regs.cr().modify(|_, w| w.en().set_bit());
    }

    fn load_block(&self) {
        let regs = self.regs();
        regs.sar().write(|w| unsafe { w.sa().bits(self.src) });
        regs.dar().write(|w| unsafe { w.da().bits(self.dst) });
        regs.br1().write(|w| unsafe { w.bndt().bits(self.size_bytes as u16) });
    }

    /// Wait for a transfer started with `start_periph_xfer` to reach a level. Not valid in
    /// circular mode, for the full level.
    pub fn poll_for_xfer(&mut self, level: XferLevel, timeout: u32) -> Result<()> {
        check_state(self.state, &[DmaState::Active])?;
        if level == XferLevel::Full && self.mode == DmaMode::Circular {
            return Err(Error::InvalidParam);
        }

        let regs = self.regs();
        if regs.sr().read().tof().bit_is_set() {
            self.last_error_codes |= DmaError::TriggerOverrun as u32;
            regs.fcr().write(|w| w.tof().set_bit());
        }

        let reached = |sr: &sr::R| match level {
            XferLevel::Full => sr.tcf().bit_is_set(),
            XferLevel::Half => sr.htf().bit_is_set(),
        };

        let start = tick::get_tick();
        while !reached(&self.regs().sr().read()) {
            if tick::timed_out(start, timeout) {
                // The timeout is what we report; the abort's own failure, if any, is recorded.
                let _ = self.abort();
                return Err(Error::Timeout);
            }
        }

        let sr = self.regs().sr().read();
        let mut error = None;
        for (set, err) in [
            (sr.dtef().bit_is_set(), DmaError::Transfer),
            (sr.usef().bit_is_set(), DmaError::UserSetting),
            (sr.ulef().bit_is_set(), DmaError::UpdateLink),
        ] {
            if set {
                self.last_error_codes |= err as u32;
                if error.is_none() {
                    error = Some(err);
                }
            }
        }

        if let Some(e) = error {
            self.clear_all_flags();
            self.reset();
            self.state = DmaState::Idle;
            return Err(Error::DmaError(e));
        }

        match level {
            XferLevel::Half => {
                self.regs().fcr().write(|w| w.htf().set_bit());
            }
            XferLevel::Full => {
                self.regs().fcr().write(|w| w.tcf().set_bit().htf().set_bit());
                self.state = DmaState::Idle;
            }
        }

        Ok(())
    }

    /// Abort a transfer, blocking until the channel is suspended, then reset it.
    pub fn abort(&mut self) -> Result<()> {
        check_state(self.state, &[DmaState::Idle, DmaState::Active, DmaState::Suspend])?;
        if self.is_idle() {
            return Err(Error::DmaError(DmaError::NotActive));
        }

        self.state = DmaState::Abort;
        self.regs().cr().modify(|_, w| w.susp().set_bit());

        let start = tick::get_tick();
        while !self.regs().sr().read().suspf().bit_is_set() {
            if tick::timed_out(start, SUSPEND_TIMEOUT) {
                self.last_error_codes |= DmaError::Timeout as u32;
                if self.is_idle() {
                    self.reset();
                    self.state = DmaState::Idle;
                }
                return Err(Error::Timeout);
            }
        }

        self.reset();
        self.clear_all_flags();
        self.disable_interrupts();
        self.state = DmaState::Idle;
        Ok(())
    }

    /// Request an abort. It completes in `irq_handler`, which reports `DmaEvent::Aborted`.
    pub fn abort_it(&mut self) -> Result<()> {
        check_state(self.state, &[DmaState::Idle, DmaState::Active, DmaState::Suspend])?;
        if self.is_idle() {
            return Err(Error::DmaError(DmaError::NotActive));
        }

        self.state = DmaState::Abort;
        self.regs()
            .cr()
            .modify(|_, w| w.suspie().set_bit().susp().set_bit());
        Ok(())
    }

    /// Suspend an active transfer, blocking until the channel reports it.
    pub fn suspend(&mut self) -> Result<()> {
        check_state(self.state, &[DmaState::Active])?;
        if self.is_idle() {
            return Err(Error::DmaError(DmaError::NotActive));
        }

        self.state = DmaState::Suspend;
        self.regs().cr().modify(|_, w| w.susp().set_bit());

        tick::wait_until(
            || self.regs().sr().read().suspf().bit_is_set(),
            SUSPEND_TIMEOUT,
        )
    }

    /// Resume a suspended transfer.
    pub fn resume(&mut self) -> Result<()> {
        check_update_state(&mut self.state, DmaState::Suspend, DmaState::Active)?;
        self.regs().cr().modify(|_, w| w.susp().clear_bit());
        Ok(())
    }

    /// Handle the channel's interrupt. Clears the flags it acts on. Returns `None` if nothing
    /// enabled was pending.
    pub fn irq_handler(&mut self) -> Option<DmaEvent> {
        let regs = self.regs();
        // The interrupt enables in CR sit at the same positions as their flags in SR.
        let flags = regs.sr().read().bits() & regs.cr().read().bits();
        let pending = |flag: u32| flags & flag != 0;

        if pending(HTF) {
            regs.fcr().write(|w| w.htf().set_bit());

            if !pending(TCF) {
                return Some(DmaEvent::HalfComplete);
            }
        }

        if pending(TCF) {
            regs.fcr().write(|w| w.tcf().set_bit());

            if self.mode == DmaMode::Circular {
                self.load_block();
                regs.cr().modify(|_, w| w.en().set_bit());
            } else {
                regs.fcr().write(|w| w.htf().set_bit());
                self.disable_interrupts();
                self.state = DmaState::Idle;
            }
            return Some(DmaEvent::Complete);
        }

        if pending(SUSPF) {
            regs.fcr().write(|w| w.suspf().set_bit());

            if self.state == DmaState::Abort {
                self.reset();
                self.disable_interrupts();
                self.state = DmaState::Idle;
                return Some(DmaEvent::Aborted);
            }

            regs.cr().modify(|_, w| w.suspie().clear_bit());
            self.state = DmaState::Suspend;
            return Some(DmaEvent::Suspended);
        }

        let mut error = None;
        for (flag, err, fatal) in [
            (DTEF, DmaError::Transfer, true),
            (ULEF, DmaError::UpdateLink, true),
            (USEF, DmaError::UserSetting, true),
            (TOF, DmaError::TriggerOverrun, false),
        ] {
            if pending(flag) {
                self.last_error_codes |= err as u32;
                // Fatal errors take precedence over a trigger overrun.
                match error {
                    Some((_, true)) => (),
                    _ => error = Some((err, fatal)),
                }
            }
        }

        let (err, fatal) = error?;
        self.clear_all_flags();
        if fatal {
            self.reset();
            self.disable_interrupts();
            self.state = DmaState::Idle;
        }
        Some(DmaEvent::Error(err))
    }

    fn reset(&self) {
        self.regs().cr().modify(|_, w| w.reset().set_bit());
    }

    fn is_idle(&self) -> bool {
        self.regs().sr().read().idlef().bit_is_set()
    }

    fn clear_all_flags(&self) {
        self.regs()
            .fcr()
            .write(|w| unsafe { w.bits(TCF | HTF | DTEF | ULEF | USEF | SUSPF | TOF) });
    }

    fn disable_interrupts(&self) {
        self.regs().cr().modify(|_, w| {
            w.tcie().clear_bit();
            w.htie().clear_bit();
            w.dteie().clear_bit();
            w.uleie().clear_bit();
            w.useie().clear_bit();
            w.suspie().clear_bit();
            w.toie().clear_bit()
        });
    }

    pub fn state(&self) -> DmaState {
        self.state
    }

    /// A bitmask of `DmaError` values recorded since the last transfer started.
    pub fn last_error_codes(&self) -> u32 {
        self.last_error_codes
    }

    /// Bytes left to transfer in the current block.
    pub fn remaining_bytes(&self) -> u32 {
        self.regs().br1().read().bndt().bits() as u32
    }

    pub fn is_circular(&self) -> bool {
        self.mode == DmaMode::Circular
    }

    /// The channel number, 0 - 15.
    pub fn num(&self) -> u8 {
        self.num
    }

    /// The channel's NVIC interrupt line.
    pub fn interrupt(&self) -> Interrupt {
        // `num` is checked against `NUM_CHANNELS` when the channel is taken.
        channel_interrupt(self.num).unwrap_or(Interrupt::GPDMA1_CH0)
    }
}

/// The GPDMA1 interrupt line for a channel number.
pub fn channel_interrupt(n: u8) -> Option<Interrupt> {
    Some(match n {
        0 => Interrupt::GPDMA1_CH0,
        1 => Interrupt::GPDMA1_CH1,
        2 => Interrupt::GPDMA1_CH2,
        3 => Interrupt::GPDMA1_CH3,
        4 => Interrupt::GPDMA1_CH4,
        5 => Interrupt::GPDMA1_CH5,
        6 => Interrupt::GPDMA1_CH6,
        7 => Interrupt::GPDMA1_CH7,
        8 => Interrupt::GPDMA1_CH8,
        9 => Interrupt::GPDMA1_CH9,
        10 => Interrupt::GPDMA1_CH10,
        11 => Interrupt::GPDMA1_CH11,
        12 => Interrupt::GPDMA1_CH12,
        13 => Interrupt::GPDMA1_CH13,
        14 => Interrupt::GPDMA1_CH14,
        15 => Interrupt::GPDMA1_CH15,
        _ => return None,
    })
}

/// Address of a register, for use as a DMA source or destination.
pub(crate) fn reg_addr<T>(reg: &T) -> u32 {
    reg as *const T as usize as u32
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::util::{fake, peek, poke};

    type GpdmaRegs = pac::gpdma1::RegisterBlock;

    /// A DMA channel on a zeroed register block.
    pub(crate) fn fake_channel(n: u8, cfg: &ChannelCfg) -> (&'static GpdmaRegs, DmaChannel) {
        let regs: &'static GpdmaRegs = fake();
        let mut dma = Dma::new(regs, fake());
        let mut ch = dma.channel(n).unwrap();
        ch.set_config(cfg).unwrap();
        (regs, ch)
    }

    #[test]
    fn channels_are_taken_once() {
        let regs: &'static GpdmaRegs = fake();
        let rcc: &pac::rcc::RegisterBlock = fake();
        let mut dma = Dma::new(regs, rcc);
        assert!(rcc.ahb1enr().read().gpdma1en().bit_is_set());

        let ch = dma.channel(3).unwrap();
        assert_eq!(ch.state(), DmaState::Init);
        assert_eq!(ch.interrupt(), Interrupt::GPDMA1_CH3);
        assert_eq!(dma.channel(3).err(), Some(Error::Busy));
        assert_eq!(dma.channel(16).err(), Some(Error::InvalidParam));

        dma.release(ch);
        assert!(dma.channel(3).is_ok());
    }

    #[test]
    fn config_writes_transfer_registers() {
        let cfg = ChannelCfg {
            request: DmaInput::Sai1A,
            src_width: DataWidth::Bits16,
            dst_width: DataWidth::Bits16,
            priority: Priority::High,
            ..Default::default()
        };
        let (regs, _ch) = fake_channel(0, &cfg);
        let tr1 = regs.ch(0).tr1().read();
        let tr2 = regs.ch(0).tr2().read();

        assert_eq!(tr1.sdw_log2().bits(), 1);
        assert!(tr1.sinc().bit_is_set());
        assert!(!tr1.dinc().bit_is_set());
        assert_eq!(tr2.reqsel().bits(), 36);
        assert!(tr2.dreq().bit_is_set());
        assert_eq!(regs.ch(0).cr().read().prio().bits(), 0b11);
    }

    #[test]
    fn start_checks_size_and_state() {
        let cfg = ChannelCfg::default();
        let (regs, mut ch) = fake_channel(1, &cfg);

        assert_eq!(ch.start_periph_xfer(0x2000_0000, 0x4000_0000, 0), Err(Error::InvalidParam));
        assert_eq!(ch.start_periph_xfer(0x2000_0000, 0x4000_0000, 6), Err(Error::InvalidParam));
        assert_eq!(
            ch.start_periph_xfer(0x2000_0000, 0x4000_0000, 0x1_0000),
            Err(Error::InvalidParam)
        );

        ch.start_periph_xfer(0x2000_0000, 0x4000_0000, 64).unwrap();
        assert_eq!(ch.state(), DmaState::Active);
        let r = regs.ch(1);
        assert_eq!(r.sar().read().bits(), 0x2000_0000);
        assert_eq!(r.dar().read().bits(), 0x4000_0000);
        assert_eq!(r.br1().read().bndt().bits(), 64);
        assert!(r.cr().read().en().bit_is_set());
        assert!(!r.cr().read().tcie().bit_is_set());

        assert_eq!(ch.start_periph_xfer(0x2000_0000, 0x4000_0000, 64), Err(Error::Busy));
    }

    #[test]
    fn silent_needs_circular() {
        let (_, mut ch) = fake_channel(2, &ChannelCfg::default());
        assert_eq!(
            ch.start_periph_xfer_it_opt(0, 0, 4, DmaOptIt::Silent),
            Err(Error::InvalidParam)
        );
        assert_eq!(ch.state(), DmaState::Idle);
    }

    #[test]
    fn poll_completes_and_reports_errors() {
        let (regs, mut ch) = fake_channel(4, &ChannelCfg::default());
        let r = regs.ch(4);

        ch.start_periph_xfer(0, 0, 16).unwrap();
        poke(r.sr(), TCF);
        assert_eq!(ch.poll_for_xfer(XferLevel::Full, 10), Ok(()));
        assert_eq!(ch.state(), DmaState::Idle);

        ch.start_periph_xfer(0, 0, 16).unwrap();
        poke(r.sr(), TCF | DTEF);
        assert_eq!(
            ch.poll_for_xfer(XferLevel::Full, 10),
            Err(Error::DmaError(DmaError::Transfer))
        );
        assert_eq!(ch.last_error_codes(), DmaError::Transfer as u32);
        assert_eq!(ch.state(), DmaState::Idle);
        // RESET is write-only; the fake block keeps what was written.
        assert_ne!(peek(r.cr()) & 1 << 1, 0);
    }

    #[test]
    fn poll_timeout_aborts() {
        let (regs, mut ch) = fake_channel(5, &ChannelCfg::default());
        ch.start_periph_xfer(0, 0, 16).unwrap();
        // The channel suspends at once.
        poke(regs.ch(5).sr(), SUSPF);

        assert_eq!(ch.poll_for_xfer(XferLevel::Full, 0), Err(Error::Timeout));
        assert_eq!(ch.state(), DmaState::Idle);
    }

    #[test]
    fn abort_of_idle_channel_fails() {
        let (regs, mut ch) = fake_channel(6, &ChannelCfg::default());
        poke(regs.ch(6).sr(), 1);
        assert_eq!(ch.abort(), Err(Error::DmaError(DmaError::NotActive)));
        assert_eq!(ch.abort_it(), Err(Error::DmaError(DmaError::NotActive)));
    }

    #[test]
    fn abort_it_completes_in_isr() {
        let (regs, mut ch) = fake_channel(7, &ChannelCfg::default());
        let r = regs.ch(7);
        ch.start_periph_xfer_it_opt(0, 0, 32, DmaOptIt::Default).unwrap();
        assert!(r.cr().read().htie().bit_is_set());
        assert!(r.cr().read().toie().bit_is_set());

        ch.abort_it().unwrap();
        assert_eq!(ch.state(), DmaState::Abort);
        assert!(r.cr().read().susp().bit_is_set());

        poke(r.sr(), SUSPF);
        assert_eq!(ch.irq_handler(), Some(DmaEvent::Aborted));
        assert_eq!(ch.state(), DmaState::Idle);
        assert!(!r.cr().read().suspie().bit_is_set());
    }

    #[test]
    fn isr_reports_half_then_full() {
        let (regs, mut ch) = fake_channel(8, &ChannelCfg::default());
        let r = regs.ch(8);
        ch.start_periph_xfer_it_opt(0, 0, 32, DmaOptIt::HalfTransfer).unwrap();

        poke(r.sr(), HTF);
        assert_eq!(ch.irq_handler(), Some(DmaEvent::HalfComplete));
        assert_eq!(ch.state(), DmaState::Active);

        poke(r.sr(), HTF | TCF);
        assert_eq!(ch.irq_handler(), Some(DmaEvent::Complete));
        assert_eq!(ch.state(), DmaState::Idle);
        assert!(!r.cr().read().tcie().bit_is_set());

        // Nothing enabled now.
        assert_eq!(ch.irq_handler(), None);
    }

    #[test]
    fn circular_rearms_on_complete() {
        let cfg = ChannelCfg {
            mode: DmaMode::Circular,
            ..Default::default()
        };
        let (regs, mut ch) = fake_channel(9, &cfg);
        let r = regs.ch(9);
        ch.start_periph_xfer_it_opt(0x2000_0100, 0x4000_0000, 8, DmaOptIt::None)
            .unwrap();
        assert!(ch.is_circular());

        // Hardware counts down, and drops EN at the end of the block.
        r.br1().reset();
        r.cr().modify(|_, w| w.en().clear_bit());
        poke(r.sr(), TCF);

        assert_eq!(ch.irq_handler(), Some(DmaEvent::Complete));
        assert_eq!(ch.state(), DmaState::Active);
        assert_eq!(ch.remaining_bytes(), 8);
        assert!(r.cr().read().en().bit_is_set());
        assert!(r.cr().read().tcie().bit_is_set());
    }

    #[test]
    fn isr_errors() {
        let (regs, mut ch) = fake_channel(10, &ChannelCfg::default());
        let r = regs.ch(10);

        ch.start_periph_xfer_it_opt(0, 0, 32, DmaOptIt::Default).unwrap();
        poke(r.sr(), TOF);
        assert_eq!(
            ch.irq_handler(),
            Some(DmaEvent::Error(DmaError::TriggerOverrun))
        );
        // Not fatal.
        assert_eq!(ch.state(), DmaState::Active);

        poke(r.sr(), TOF | USEF);
        assert_eq!(ch.irq_handler(), Some(DmaEvent::Error(DmaError::UserSetting)));
        assert_eq!(ch.state(), DmaState::Idle);
        assert_eq!(
            ch.last_error_codes(),
            DmaError::TriggerOverrun as u32 | DmaError::UserSetting as u32
        );
    }

    #[test]
    fn suspend_and_resume() {
        let (regs, mut ch) = fake_channel(11, &ChannelCfg::default());
        let r = regs.ch(11);
        assert_eq!(ch.resume(), Err(Error::Busy));

        ch.start_periph_xfer(0, 0, 32).unwrap();
        poke(r.sr(), SUSPF);
        ch.suspend().unwrap();
        assert_eq!(ch.state(), DmaState::Suspend);

        ch.resume().unwrap();
        assert_eq!(ch.state(), DmaState::Active);
        assert!(!r.cr().read().susp().bit_is_set());
    }

    #[test]
    fn two_d_channels_use_the_extended_block() {
        let (regs, mut ch) = fake_channel(13, &ChannelCfg::default());
        ch.start_periph_xfer(0x2000_0000, 0x4000_0000, 12).unwrap();

        assert_eq!(regs.ch2d13().sar().read().bits(), 0x2000_0000);
        assert_eq!(regs.ch2d13().br1().read().bndt().bits(), 12);
        assert_eq!(ch.interrupt(), Interrupt::GPDMA1_CH13);
        assert_eq!(channel_interrupt(16), None);
    }
}
