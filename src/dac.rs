//! Support for the Digital to Analog Converter (DAC) peripheral. Both channels of DAC1 are
//! driven from one handle, either separately, or together in dual channel mode.
//!
//! Values can be written directly, generated by the wave generators, or streamed from memory
//! with DMA, on a software, timer, LPTIM or EXTI trigger.

use core::ops::Deref;

use crate::{
    dma::{self, DmaChannel, DmaEvent, DmaOptIt},
    error::{Error, Result},
    pac, tick,
    util::{check_state, check_update_state, rcc_en_reset},
};

/// Output startup time after setting EN. DS, tWAKEUP.
const STARTUP_US: u32 = 15;
/// Minimum time between calibration steps.
const TRIM_STEP_US: u32 = 50;
/// Time to wait for a sample time register write to complete, in ms.
const BWST_TIMEOUT: u32 = 1;
/// Startup waits are sized for the fastest core clock; slower clocks wait longer.
const MAX_HCLK: u32 = 160_000_000;
/// OTRIM is 5 bits.
const OTRIM_MAX: u32 = 31;

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u32)]
/// DAC errors. The discriminants are the bits used in `last_error_codes`.
pub enum DacError {
    /// DMA didn't supply data in time for a trigger.
    DmaUnderrun = 1 << 0,
    /// A DMA transfer failed to start, or reported an error.
    Dma = 1 << 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Select the channel
pub enum DacChannel {
    Ch1,
    Ch2,
}

impl DacChannel {
    fn idx(self) -> usize {
        self as usize
    }

    /// Index of this channel's fields, in registers shared by both channels.
    fn n(self) -> u8 {
        self as u8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// Data alignment; selects the data holding register written.
pub enum Alignment {
    /// 12-bit precision, right-aligned.
    R12 = 0,
    /// 12-bit precision, left-aligned.
    L12 = 1,
    /// Eight bit precision, right-aligned.
    R8 = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Select a trigger, used by some features.
pub enum Trigger {
    /// Convert as soon as a data holding register is written.
    None,
    /// Set by `trig_sw_conversion`.
    Software,
    Tim1Trgo,
    Tim2Trgo,
    Tim4Trgo,
    Tim5Trgo,
    Tim6Trgo,
    Tim7Trgo,
    Tim8Trgo,
    Tim15Trgo,
    Lptim1Ch1,
    Lptim3Ch1,
    /// Eg, for interrupts
    Exti9,
}

impl Trigger {
    /// TSEL value. None if triggering is disabled.
    pub fn bits(&self) -> Option<u8> {
        Some(match self {
            Self::None => return None,
            Self::Software => 0,
            Self::Tim1Trgo => 1,
            Self::Tim2Trgo => 2,
            Self::Tim4Trgo => 3,
            Self::Tim5Trgo => 4,
            Self::Tim6Trgo => 5,
            Self::Tim7Trgo => 6,
            Self::Tim8Trgo => 7,
            Self::Tim15Trgo => 8,
            Self::Lptim1Ch1 => 11,
            Self::Lptim3Ch1 => 12,
            Self::Exti9 => 13,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// High frequency interface mode. Sets MCR field HFSEL. Required when the AHB clock is
/// above 80Mhz.
pub enum HfMode {
    Disabled = 0,
    Above80Mhz = 1,
    Above160Mhz = 2,
}

/// The HFSEL setting for an AHB clock speed, in Hz.
pub fn optimum_frequency_mode(hclk: u32) -> HfMode {
    if hclk > 160_000_000 {
        HfMode::Above160Mhz
    } else if hclk > 80_000_000 {
        HfMode::Above80Mhz
    } else {
        HfMode::Disabled
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum OutputBuffer {
    /// Higher drive current, and higher consumption.
    Enabled,
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Where the output goes. The pin and on-chip paths actually connected also depend on the
/// output buffer, and sample and hold settings; see RM, table 297.
pub enum Connection {
    External,
    Internal,
    Both,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum SignFormat {
    Unsigned,
    /// Data is two's complement; the MSB is inverted before conversion.
    Signed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// Triangle amplitude, or noise LFSR mask. Sets CR field MAMP.
pub enum WaveAmplitude {
    A1 = 0,
    A3 = 1,
    A7 = 2,
    A15 = 3,
    A31 = 4,
    A63 = 5,
    A127 = 6,
    A255 = 7,
    A511 = 8,
    A1023 = 9,
    A2047 = 10,
    A4095 = 11,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum DacState {
    Reset,
    SeparateChannelConfigured,
    DualChannelConfigured,
    DualChannelActive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum ChannelState {
    Reset,
    Idle,
    Active,
    /// Streaming with a silent circular DMA transfer.
    ActiveSilent,
}

#[derive(Clone, Debug, defmt::Format)]
pub struct DacConfig {
    pub hf_mode: HfMode,
}

#[derive(Clone, Debug, defmt::Format)]
pub struct ChannelConfig {
    pub alignment: Alignment,
    pub trigger: Trigger,
    pub output_buffer: OutputBuffer,
    pub connection: Connection,
    pub sign_format: SignFormat,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            alignment: Alignment::R12,
            trigger: Trigger::None,
            output_buffer: OutputBuffer::Enabled,
            connection: Connection::External,
            sign_format: SignFormat::Unsigned,
        }
    }
}

#[derive(Clone, Debug, defmt::Format)]
pub struct DualChannelConfig {
    pub ch1: ChannelConfig,
    pub ch2: ChannelConfig,
    /// Alignment of the dual data holding register.
    pub alignment: Alignment,
    /// The channel whose DMA request feeds both channels.
    pub dma_requester: DacChannel,
}

/// Handlers run on transfer events. They default to doing nothing.
pub struct DacCallbacks<R> {
    pub error: fn(&mut Dac<R>),
    pub conv_cplt: fn(&mut Dac<R>, DacChannel),
    pub conv_half_cplt: fn(&mut Dac<R>, DacChannel),
    pub stop_cplt: fn(&mut Dac<R>, DacChannel),
    pub dual_conv_cplt: fn(&mut Dac<R>),
    pub dual_conv_half_cplt: fn(&mut Dac<R>),
    pub dual_stop_cplt: fn(&mut Dac<R>),
}

impl<R> Default for DacCallbacks<R> {
    fn default() -> Self {
        Self {
            error: |_| (),
            conv_cplt: |_, _| (),
            conv_half_cplt: |_, _| (),
            stop_cplt: |_, _| (),
            dual_conv_cplt: |_| (),
            dual_conv_half_cplt: |_| (),
            dual_stop_cplt: |_| (),
        }
    }
}

/// Represents a Digital to Analog Converter (DAC) peripheral.
pub struct Dac<R> {
    pub regs: R,
    state: DacState,
    ch_state: [ChannelState; 2],
    last_error_codes: [u32; 2],
    alignment: [Alignment; 2],
    dual_alignment: Alignment,
    dual_requester: DacChannel,
    dma: [Option<DmaChannel>; 2],
    callbacks: DacCallbacks<R>,
}

impl<R> Dac<R>
where
    R: Deref<Target = pac::dac1::RegisterBlock>,
{
    /// Initialize a DAC peripheral, including enabling and resetting
    /// its RCC peripheral clock. Both channels start idle, with 12-bit right alignment.
    pub fn new(regs: R, rcc: &pac::rcc::RegisterBlock) -> Self {
        critical_section::with(|_| {
            rcc_en_reset!(ahb3, dac1, rcc);
        });

        Self {
            regs,
            state: DacState::SeparateChannelConfigured,
            ch_state: [ChannelState::Idle; 2],
            last_error_codes: [0; 2],
            alignment: [Alignment::R12; 2],
            dual_alignment: Alignment::R12,
            dual_requester: DacChannel::Ch1,
            dma: [None, None],
            callbacks: Default::default(),
        }
    }

    /// Disable both channels.
    pub fn deinit(&mut self) {
        self.regs
            .cr()
            .modify(|_, w| w.en1().clear_bit().en2().clear_bit());
        self.ch_state = [ChannelState::Reset; 2];
        self.state = DacState::Reset;
    }

    fn check_channels_idle(&self) -> Result<()> {
        for s in self.ch_state {
            check_state(s, &[ChannelState::Reset, ChannelState::Idle])?;
        }
        Ok(())
    }

    pub fn set_config(&mut self, cfg: &DacConfig) -> Result<()> {
        check_state(
            self.state,
            &[DacState::SeparateChannelConfigured, DacState::DualChannelConfigured],
        )?;
        self.check_channels_idle()?;

        self.regs
            .mcr()
            .modify(|_, w| unsafe { w.hfsel().bits(cfg.hf_mode as u8) });
        Ok(())
    }

    /// Write trigger, buffer, connection and sign settings. Doesn't touch channel state.
    fn apply_channel_config(&mut self, ch: DacChannel, cfg: &ChannelConfig) {
        self.alignment[ch.idx()] = cfg.alignment;
        let n = ch.n();

        let (tsel, ten) = match cfg.trigger.bits() {
            Some(bits) => (bits, true),
            None => (0, false),
        };
        self.regs.cr().modify(|_, w| {
            w.cen(n).clear_bit().ten(n).bit(ten);
            match ch {
                DacChannel::Ch1 => unsafe { w.tsel1().bits(tsel) },
                DacChannel::Ch2 => unsafe { w.tsel2().bits(tsel) },
            }
        });

        // MODE bit 2 is sample and hold; it's set separately.
        let mut mode = self.regs.mcr().read().mode(n).bits() & 0b100;
        if cfg.output_buffer == OutputBuffer::Disabled {
            mode |= 0b010;
        }
        if cfg.connection != Connection::External {
            mode |= 0b001;
        }
        let signed = cfg.sign_format == SignFormat::Signed;
        self.regs
            .mcr()
            .modify(|_, w| unsafe { w.mode(n).bits(mode).sinformat(n).bit(signed) });
    }

    fn set_mode(&self, ch: DacChannel, f: impl FnOnce(u8) -> u8) {
        let n = ch.n();
        self.regs
            .mcr()
            .modify(|r, w| unsafe { w.mode(n).bits(f(r.mode(n).bits())) });
    }

    fn set_trim(&self, ch: DacChannel, trim: u32) {
        self.regs
            .ccr()
            .modify(|_, w| unsafe { w.otrim(ch.n()).bits(trim as u8) });
    }

    fn cal_flag(&self, ch: DacChannel) -> bool {
        self.regs.sr().read().cal_flag(ch.n()).bit_is_set()
    }

    /// Configure a channel for separate use.
    pub fn set_config_channel(&mut self, ch: DacChannel, cfg: &ChannelConfig) -> Result<()> {
        check_state(
            self.state,
            &[DacState::SeparateChannelConfigured, DacState::DualChannelConfigured],
        )?;
        check_state(
            self.ch_state[ch.idx()],
            &[ChannelState::Reset, ChannelState::Idle],
        )?;

        self.apply_channel_config(ch, cfg);

        self.state = DacState::SeparateChannelConfigured;
        self.ch_state[ch.idx()] = ChannelState::Idle;
        Ok(())
    }

    /// Configure both channels, to be started and stopped together.
    pub fn set_config_dual_channel(&mut self, cfg: &DualChannelConfig) -> Result<()> {
        check_state(
            self.state,
            &[DacState::SeparateChannelConfigured, DacState::DualChannelConfigured],
        )?;
        self.check_channels_idle()?;

        self.apply_channel_config(DacChannel::Ch1, &cfg.ch1);
        self.apply_channel_config(DacChannel::Ch2, &cfg.ch2);
        self.dual_alignment = cfg.alignment;
        self.dual_requester = cfg.dma_requester;

        self.state = DacState::DualChannelConfigured;
        self.ch_state = [ChannelState::Idle; 2];
        Ok(())
    }

    /// Set sample and hold timing, in LSI or LSE cycles. Sample time is 10 bits, hold time is 10
    /// bits, and refresh time is 8 bits; higher bits are ignored.
    pub fn set_config_sample_and_hold(
        &mut self,
        ch: DacChannel,
        sample: u32,
        hold: u32,
        refresh: u32,
    ) -> Result<()> {
        check_state(
            self.ch_state[ch.idx()],
            &[ChannelState::Reset, ChannelState::Idle],
        )?;

        // SHSR can only be written when BWST is clear.
        let n = ch.n();
        let regs = &self.regs;
        tick::wait_until(|| regs.sr().read().bwst(n).bit_is_clear(), BWST_TIMEOUT)?;

        self.regs
            .shsr(ch.idx())
            .write(|w| unsafe { w.tsample().bits((sample & 0x3FF) as u16) });
        self.regs
            .shhr()
            .modify(|_, w| unsafe { w.thold(n).bits((hold & 0x3FF) as u16) });
        self.regs
            .shrr()
            .modify(|_, w| unsafe { w.trefresh(n).bits((refresh & 0xFF) as u8) });
        Ok(())
    }

    /// Calibrate the output buffer offset, by binary search of the trim value. RM, section
    /// 32.4.13. `hclk` is the core clock speed, in Hz.
    pub fn calibrate_channel_buffer(&mut self, ch: DacChannel, hclk: u32) -> Result<()> {
        check_state(self.state, &[DacState::SeparateChannelConfigured])?;
        check_state(self.ch_state[ch.idx()], &[ChannelState::Idle])?;

        let n = ch.n();
        let buffer_off = self.regs.mcr().read().mode(n).bits() & 0b010;

        self.regs.cr().modify(|_, w| w.en(n).clear_bit());
        self.set_mode(ch, |m| m & !0b010);
        self.regs.cr().modify(|_, w| w.cen(n).set_bit());

        let mut trim = 0x10;
        let mut step = 0x08;
        while step != 0 {
            self.set_trim(ch, trim);
            tick::delay_us(TRIM_STEP_US, hclk);

            if self.cal_flag(ch) {
                trim -= step;
            } else {
                trim += step;
            }
            step >>= 1;
        }

        // The value found may be one step below the first one that flips the flag.
        self.set_trim(ch, trim);
        tick::delay_us(TRIM_STEP_US, hclk);
        if !self.cal_flag(ch) {
            if trim < OTRIM_MAX {
                trim += 1;
            }
            self.set_trim(ch, trim);
        }

        self.regs.cr().modify(|_, w| w.cen(n).clear_bit());
        self.set_mode(ch, |m| m | buffer_off);
        Ok(())
    }

    /// The output buffer trim value.
    pub fn calibration_value(&self, ch: DacChannel) -> u32 {
        self.regs.ccr().read().otrim(ch.n()).bits() as u32
    }

    /// Set the output buffer trim value directly; eg one saved from an earlier calibration.
    pub fn set_calibration_value(&mut self, ch: DacChannel, trim: u32) -> Result<()> {
        check_state(self.ch_state[ch.idx()], &[ChannelState::Idle])?;
        if trim > OTRIM_MAX {
            return Err(Error::InvalidParam);
        }
        self.set_trim(ch, trim);
        Ok(())
    }

    /// Enable a channel's output.
    pub fn start_channel(&mut self, ch: DacChannel) -> Result<()> {
        check_state(self.state, &[DacState::SeparateChannelConfigured])?;
        check_update_state(
            &mut self.ch_state[ch.idx()],
            ChannelState::Idle,
            ChannelState::Active,
        )?;
        self.last_error_codes[ch.idx()] = 0;

        self.regs.cr().modify(|_, w| w.en(ch.n()).set_bit());
        tick::delay_us(STARTUP_US, MAX_HCLK);
        Ok(())
    }

    pub fn stop_channel(&mut self, ch: DacChannel) -> Result<()> {
        check_update_state(
            &mut self.ch_state[ch.idx()],
            ChannelState::Active,
            ChannelState::Idle,
        )?;
        self.regs.cr().modify(|_, w| w.en(ch.n()).clear_bit());
        Ok(())
    }

    fn sw_trigger_selected(&self, ch: DacChannel) -> bool {
        let cr = self.regs.cr().read();
        let tsel = match ch {
            DacChannel::Ch1 => cr.tsel1().bits(),
            DacChannel::Ch2 => cr.tsel2().bits(),
        };
        cr.ten(ch.n()).bit_is_set() && tsel == 0
    }

    fn sw_trigger(&self, ch: DacChannel) {
        self.regs.swtrgr().write(|w| w.swtrig(ch.n()).set_bit());
    }

    /// Address of the data holding register for the channel's alignment.
    fn dhr_addr(&self, ch: DacChannel) -> u32 {
        let i = ch.idx();
        match self.alignment[i] {
            Alignment::R12 => dma::reg_addr(self.regs.dhr12r(i)),
            Alignment::L12 => dma::reg_addr(self.regs.dhr12l(i)),
            Alignment::R8 => dma::reg_addr(self.regs.dhr8r(i)),
        }
    }

    fn dual_dhr_addr(&self) -> u32 {
        match self.dual_alignment {
            Alignment::R12 => dma::reg_addr(self.regs.dhr12rd()),
            Alignment::L12 => dma::reg_addr(self.regs.dhr12ld()),
            Alignment::R8 => dma::reg_addr(self.regs.dhr8rd()),
        }
    }

    /// Start a conversion. The channel must be configured with `Trigger::Software`.
    pub fn trig_sw_conversion(&mut self, ch: DacChannel) -> Result<()> {
        check_state(self.state, &[DacState::SeparateChannelConfigured])?;
        if !self.sw_trigger_selected(ch) {
            return Err(Error::InvalidParam);
        }
        self.sw_trigger(ch);
        Ok(())
    }

    /// Start a conversion on each channel configured with `Trigger::Software`.
    pub fn trig_sw_conversion_dual(&mut self) -> Result<()> {
        check_state(
            self.state,
            &[DacState::DualChannelConfigured, DacState::DualChannelActive],
        )?;
        for ch in [DacChannel::Ch1, DacChannel::Ch2] {
            if self.sw_trigger_selected(ch) {
                self.sw_trigger(ch);
            }
        }
        Ok(())
    }

    /// Write the data holding register for the channel's alignment. In DMA double data mode,
    /// `data` holds two samples: the first in the low half-word.
    pub fn set_channel_data(&mut self, ch: DacChannel, data: u32) -> Result<()> {
        check_state(self.state, &[DacState::SeparateChannelConfigured])?;
        check_state(
            self.ch_state[ch.idx()],
            &[ChannelState::Idle, ChannelState::Active, ChannelState::ActiveSilent],
        )?;

        let double = self.regs.mcr().read().dmadouble(ch.n()).bit_is_set();
        // Outside double data mode, leave the second sample of the register alone.
        let merge = |old: u32| {
            if double {
                data
            } else {
                (old & !0xFFFF) | (data & 0xFFFF)
            }
        };

        let i = ch.idx();
        match self.alignment[i] {
            Alignment::R12 => {
                self.regs
                    .dhr12r(i)
                    .modify(|r, w| unsafe { w.bits(merge(r.bits())) });
            }
            Alignment::L12 => {
                self.regs
                    .dhr12l(i)
                    .modify(|r, w| unsafe { w.bits(merge(r.bits())) });
            }
            Alignment::R8 => {
                self.regs
                    .dhr8r(i)
                    .modify(|r, w| unsafe { w.bits(merge(r.bits())) });
            }
        }
        Ok(())
    }

    /// The value currently output.
    pub fn channel_data(&self, ch: DacChannel) -> u32 {
        self.regs.dor(ch.idx()).read().bits()
    }

    /// Set the DAC voltage. `volts` and `vref` are in Volts.
    pub fn set_voltage(&mut self, ch: DacChannel, volts: f32, vref: f32) -> Result<()> {
        if vref <= 0. {
            return Err(Error::InvalidParam);
        }
        let ratio = (volts / vref).clamp(0., 1.);
        let val = match self.alignment[ch.idx()] {
            Alignment::R8 => (ratio * 255.) as u32,
            Alignment::R12 => (ratio * 4_095.) as u32,
            Alignment::L12 => ((ratio * 4_095.) as u32) << 4,
        };

        self.set_channel_data(ch, val)
    }

    /// Enable both channels together.
    pub fn start_dual_channel(&mut self) -> Result<()> {
        check_update_state(
            &mut self.state,
            DacState::DualChannelConfigured,
            DacState::DualChannelActive,
        )?;
        self.ch_state = [ChannelState::Active; 2];
        self.last_error_codes = [0; 2];

        self.regs
            .cr()
            .modify(|_, w| w.en1().set_bit().en2().set_bit());
        tick::delay_us(STARTUP_US, MAX_HCLK);
        Ok(())
    }

    pub fn stop_dual_channel(&mut self) -> Result<()> {
        check_update_state(
            &mut self.state,
            DacState::DualChannelActive,
            DacState::DualChannelConfigured,
        )?;
        self.regs
            .cr()
            .modify(|_, w| w.en1().clear_bit().en2().clear_bit());
        self.ch_state = [ChannelState::Idle; 2];
        Ok(())
    }

    /// Write the dual data holding register: channel 1 in the low half-word, and channel 2 in
    /// the high one.
    pub fn set_dual_channel_data(&mut self, data: u32) -> Result<()> {
        check_state(
            self.state,
            &[DacState::DualChannelConfigured, DacState::DualChannelActive],
        )?;
        match self.dual_alignment {
            Alignment::R12 => {
                self.regs.dhr12rd().write(|w| unsafe { w.bits(data) });
            }
            Alignment::L12 => {
                self.regs.dhr12ld().write(|w| unsafe { w.bits(data) });
            }
            Alignment::R8 => {
                self.regs.dhr8rd().write(|w| unsafe { w.bits(data) });
            }
        }
        Ok(())
    }

    /// Values output by both channels: channel 1 in the low half-word.
    pub fn dual_channel_data(&self) -> u32 {
        self.regs.dor1().read().bits() | (self.regs.dor2().read().bits() << 16)
    }

    /// Set the DMA channel used by a DAC channel. Configure it first: memory-to-peripheral,
    /// with the `Dac1Ch1` or `Dac1Ch2` request.
    pub fn set_channel_dma(&mut self, ch: DacChannel, dma: DmaChannel) -> Result<()> {
        check_state(
            self.ch_state[ch.idx()],
            &[ChannelState::Reset, ChannelState::Idle],
        )?;
        self.dma[ch.idx()] = Some(dma);
        Ok(())
    }

    fn set_dma_requests(&self, ch: DacChannel, enable: bool) {
        let n = ch.n();
        self.regs
            .cr()
            .modify(|_, w| w.dmaen(n).bit(enable).dmaudrie(n).bit(enable));
    }

    /// Stream `data` to a channel with DMA, one word per trigger.
    ///
    /// # Safety
    /// `data` must stay valid until the stream is stopped, or the transfer completes.
    pub unsafe fn start_channel_dma<T>(
        &mut self,
        ch: DacChannel,
        data: &[T],
        opt: DmaOptIt,
    ) -> Result<()> {
        if data.is_empty() || self.dma[ch.idx()].is_none() {
            return Err(Error::InvalidParam);
        }
        check_state(self.state, &[DacState::SeparateChannelConfigured])?;
        let active = if opt == DmaOptIt::Silent {
            ChannelState::ActiveSilent
        } else {
            ChannelState::Active
        };
        check_update_state(&mut self.ch_state[ch.idx()], ChannelState::Idle, active)?;
        self.last_error_codes[ch.idx()] = 0;

        self.set_dma_requests(ch, true);

        let dst = self.dhr_addr(ch);
        let size = core::mem::size_of_val(data) as u32;
        let started = match self.dma[ch.idx()].as_mut() {
            Some(dma) => dma.start_periph_xfer_it_opt(data.as_ptr() as u32, dst, size, opt),
            None => Err(Error::InvalidParam),
        };

        if let Err(e) = started {
            self.set_dma_requests(ch, false);
            self.last_error_codes[ch.idx()] |= DacError::Dma as u32;
            self.ch_state[ch.idx()] = ChannelState::Idle;
            return Err(e);
        }

        self.regs.cr().modify(|_, w| w.en(ch.n()).set_bit());
        tick::delay_us(STARTUP_US, MAX_HCLK);
        Ok(())
    }

    /// Stop a DMA stream. Unless it was started silent, the stop completes in
    /// `dma_irq_handler`, with the `stop_cplt` callback.
    pub fn stop_channel_dma(&mut self, ch: DacChannel) -> Result<()> {
        check_state(
            self.ch_state[ch.idx()],
            &[ChannelState::Active, ChannelState::ActiveSilent],
        )?;

        self.set_dma_requests(ch, false);
        self.regs.cr().modify(|_, w| w.en(ch.n()).clear_bit());

        let silent = self.ch_state[ch.idx()] == ChannelState::ActiveSilent;
        let Some(dma) = self.dma[ch.idx()].as_mut() else {
            self.ch_state[ch.idx()] = ChannelState::Idle;
            return Ok(());
        };

        if silent {
            // A silent transfer has nothing to report; the channel is reset either way.
            let _ = dma.abort();
            self.ch_state[ch.idx()] = ChannelState::Idle;
        } else if dma.abort_it().is_err() {
            self.single_stop_complete(ch);
        }
        Ok(())
    }

    fn single_stop_complete(&mut self, ch: DacChannel) {
        self.state = DacState::SeparateChannelConfigured;
        self.ch_state[ch.idx()] = ChannelState::Idle;
        (self.callbacks.stop_cplt)(self, ch);
    }

    /// Stream `data` to both channels with the requester channel's DMA. Each word holds a
    /// sample for each channel, as in `set_dual_channel_data`.
    ///
    /// # Safety
    /// `data` must stay valid until the stream is stopped, or the transfer completes.
    pub unsafe fn start_dual_channel_dma<T>(&mut self, data: &[T], opt: DmaOptIt) -> Result<()> {
        let req = self.dual_requester;
        if data.is_empty() || self.dma[req.idx()].is_none() {
            return Err(Error::InvalidParam);
        }
        self.check_channels_idle()?;
        check_update_state(
            &mut self.state,
            DacState::DualChannelConfigured,
            DacState::DualChannelActive,
        )?;
        self.ch_state = if opt == DmaOptIt::Silent {
            [ChannelState::ActiveSilent; 2]
        } else {
            [ChannelState::Active; 2]
        };
        self.last_error_codes = [0; 2];

        self.set_dma_requests(req, true);

        let dst = self.dual_dhr_addr();
        let size = core::mem::size_of_val(data) as u32;
        let started = match self.dma[req.idx()].as_mut() {
            Some(dma) => dma.start_periph_xfer_it_opt(data.as_ptr() as u32, dst, size, opt),
            None => Err(Error::InvalidParam),
        };

        if let Err(e) = started {
            self.set_dma_requests(req, false);
            for code in self.last_error_codes.iter_mut() {
                *code |= DacError::Dma as u32;
            }
            self.ch_state = [ChannelState::Idle; 2];
            self.state = DacState::DualChannelConfigured;
            return Err(e);
        }

        self.regs
            .cr()
            .modify(|_, w| w.en1().set_bit().en2().set_bit());
        tick::delay_us(STARTUP_US, MAX_HCLK);
        Ok(())
    }

    /// Stop a dual channel DMA stream. Unless it was started silent, the stop completes in
    /// `dma_irq_handler`, with the `dual_stop_cplt` callback.
    pub fn stop_dual_channel_dma(&mut self) -> Result<()> {
        check_state(self.state, &[DacState::DualChannelActive])?;
        let req = self.dual_requester;

        self.set_dma_requests(req, false);
        self.regs
            .cr()
            .modify(|_, w| w.en1().clear_bit().en2().clear_bit());

        let silent = self.ch_state[0] == ChannelState::ActiveSilent;
        let Some(dma) = self.dma[req.idx()].as_mut() else {
            self.dual_stop_complete();
            return Ok(());
        };

        if silent {
            let _ = dma.abort();
            self.state = DacState::DualChannelConfigured;
            self.ch_state = [ChannelState::Idle; 2];
        } else if dma.abort_it().is_err() {
            self.dual_stop_complete();
        }
        Ok(())
    }

    fn dual_stop_complete(&mut self) {
        self.state = DacState::DualChannelConfigured;
        self.ch_state = [ChannelState::Idle; 2];
        (self.callbacks.dual_stop_cplt)(self);
    }

    /// Run this in the ISR of the DMA channel set for `ch`.
    pub fn dma_irq_handler(&mut self, ch: DacChannel) {
        let Some(dma) = self.dma[ch.idx()].as_mut() else {
            return;
        };
        let Some(event) = dma.irq_handler() else {
            return;
        };
        let dual = self.state == DacState::DualChannelActive && ch == self.dual_requester;

        match (event, dual) {
            (DmaEvent::Complete, false) => (self.callbacks.conv_cplt)(self, ch),
            (DmaEvent::Complete, true) => (self.callbacks.dual_conv_cplt)(self),
            (DmaEvent::HalfComplete, false) => (self.callbacks.conv_half_cplt)(self, ch),
            (DmaEvent::HalfComplete, true) => (self.callbacks.dual_conv_half_cplt)(self),
            (DmaEvent::Error(_), false) => {
                self.last_error_codes[ch.idx()] |= DacError::Dma as u32;
                (self.callbacks.error)(self);
            }
            (DmaEvent::Error(_), true) => {
                for code in self.last_error_codes.iter_mut() {
                    *code |= DacError::Dma as u32;
                }
                (self.callbacks.error)(self);
            }
            (DmaEvent::Aborted, false) => self.single_stop_complete(ch),
            (DmaEvent::Aborted, true) => self.dual_stop_complete(),
            (DmaEvent::Suspended, _) => (),
        }
    }

    /// Handle DMA underrun interrupts. Run this in the DAC ISR.
    pub fn irq_handler(&mut self) {
        for ch in [DacChannel::Ch1, DacChannel::Ch2] {
            let n = ch.n();
            if self.regs.cr().read().dmaudrie(n).bit_is_set()
                && self.regs.sr().read().dmaudr(n).bit_is_set()
            {
                // Write 1 to clear.
                self.regs.sr().write(|w| w.dmaudr(n).set_bit());
                self.regs.cr().modify(|_, w| w.dmaen(n).clear_bit());
                self.last_error_codes[ch.idx()] |= DacError::DmaUnderrun as u32;
                (self.callbacks.error)(self);
            }
        }
    }

    fn set_wave(&mut self, ch: DacChannel, wave: u8, amplitude: WaveAmplitude) -> Result<()> {
        // MAMP can't change while the channel's enabled.
        check_state(self.ch_state[ch.idx()], &[ChannelState::Idle])?;
        let n = ch.n();
        self.regs
            .cr()
            .modify(|_, w| unsafe { w.wave(n).bits(wave).mamp(n).bits(amplitude as u8) });
        Ok(())
    }

    /// Add a triangle wave to the channel's output, on each trigger.
    pub fn enable_triangle_wave(&mut self, ch: DacChannel, amplitude: WaveAmplitude) -> Result<()> {
        self.set_wave(ch, 0b10, amplitude)
    }

    /// Add LFSR noise to the channel's output, on each trigger.
    pub fn enable_noise_wave(&mut self, ch: DacChannel, amplitude: WaveAmplitude) -> Result<()> {
        self.set_wave(ch, 0b01, amplitude)
    }

    pub fn disable_wave(&mut self, ch: DacChannel) -> Result<()> {
        self.set_wave(ch, 0, WaveAmplitude::A1)
    }

    /// Enable sample and hold mode. Configure it with `set_config_sample_and_hold` first.
    pub fn enable_sample_and_hold(&mut self, ch: DacChannel) -> Result<()> {
        check_state(self.ch_state[ch.idx()], &[ChannelState::Idle])?;
        self.set_mode(ch, |m| m | 0b100);
        Ok(())
    }

    pub fn disable_sample_and_hold(&mut self, ch: DacChannel) -> Result<()> {
        check_state(self.ch_state[ch.idx()], &[ChannelState::Idle])?;
        self.set_mode(ch, |m| m & !0b100);
        Ok(())
    }

    /// Each DMA word then holds two samples, halving the DMA request rate.
    pub fn enable_dma_double_data_mode(&mut self, ch: DacChannel) -> Result<()> {
        check_state(self.ch_state[ch.idx()], &[ChannelState::Idle])?;
        self.regs
            .mcr()
            .modify(|_, w| w.dmadouble(ch.n()).set_bit());
        Ok(())
    }

    pub fn disable_dma_double_data_mode(&mut self, ch: DacChannel) -> Result<()> {
        check_state(self.ch_state[ch.idx()], &[ChannelState::Idle])?;
        self.regs
            .mcr()
            .modify(|_, w| w.dmadouble(ch.n()).clear_bit());
        Ok(())
    }

    /// Keep converting in Stop modes, on LPTIM or EXTI triggers.
    pub fn enable_autonomous_mode(&mut self) {
        self.regs.autocr().modify(|_, w| w.automode().set_bit());
    }

    pub fn disable_autonomous_mode(&mut self) {
        self.regs.autocr().modify(|_, w| w.automode().clear_bit());
    }

    pub fn register_error_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.error = cb;
    }

    pub fn register_conv_cplt_callback(&mut self, cb: fn(&mut Self, DacChannel)) {
        self.callbacks.conv_cplt = cb;
    }

    pub fn register_conv_half_cplt_callback(&mut self, cb: fn(&mut Self, DacChannel)) {
        self.callbacks.conv_half_cplt = cb;
    }

    pub fn register_stop_cplt_callback(&mut self, cb: fn(&mut Self, DacChannel)) {
        self.callbacks.stop_cplt = cb;
    }

    pub fn register_dual_conv_cplt_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.dual_conv_cplt = cb;
    }

    pub fn register_dual_conv_half_cplt_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.dual_conv_half_cplt = cb;
    }

    pub fn register_dual_stop_cplt_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.dual_stop_cplt = cb;
    }

    pub fn state(&self) -> DacState {
        self.state
    }

    pub fn channel_state(&self, ch: DacChannel) -> ChannelState {
        self.ch_state[ch.idx()]
    }

    /// A bitmask of `DacError` values for a channel.
    pub fn last_error_codes(&self, ch: DacChannel) -> u32 {
        self.last_error_codes[ch.idx()]
    }
}
