//! Provides support for timers. Includes initialization, the time base, output compare and
//! input capture channels, master/slave synchronization, break and dead time, and DMA.
//!
//! Covers TIM1 and TIM8 (advanced control), TIM2-5 (general purpose, 32-bit), TIM6 and TIM7
//! (basic), and TIM15-17. Low-power timers (LPTIM) are not supported.

use core::ops::Deref;

use num_traits::float::Float;
use paste::paste;

use crate::{
    dma::{self, DmaChannel, DmaEvent, DmaOptIt, DmaState},
    error::{Error, Result},
    pac,
    util::{check_state, check_update_state, rcc_en_reset},
};

// CCER bits of channel 1. Each channel's bits sit 4 above the previous channel's.
const CCER_CCE: u32 = 1 << 0;
const CCER_CCNE: u32 = 1 << 2;

/// CCxE bits of all channels.
const CCER_CCXE: u32 = channel_bits(CCER_CCE, 6);
/// CCxNE bits. Only channels 1 to 4 have complementary outputs.
const CCER_CCXNE: u32 = channel_bits(CCER_CCNE, 4);

const fn channel_bits(bit: u32, channels: usize) -> u32 {
    let mut v = 0;
    let mut i = 0;
    while i < channels {
        v |= bit << (4 * i);
        i += 1;
    }
    v
}

// CCMRx fields of an odd channel. The even channel's fields sit 8 bits higher.
const CCMR_CCS: u32 = 0b11;
const CCMR_OCFE: u32 = 1 << 2;
const CCMR_OCPE: u32 = 1 << 3;
const CCMR_OCM: u32 = 0b111 << 4;
const CCMR_OCM_3: u32 = 1 << 16;
const CCMR_ICPSC: u32 = 0b11 << 2;
const CCMR_ICF: u32 = 0b1111 << 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u32)]
/// Timer errors. The discriminants are the bits used in `last_error_codes`.
pub enum TimerError {
    Dma = 1 << 0,
    /// Used for when attempting to set a timer period that is out of range.
    ValueError = 1 << 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum TimerState {
    Reset,
    Init,
    Idle,
    Active,
    /// Running a circular DMA transfer, without interrupts.
    ActiveSilent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum ChannelState {
    Reset,
    OcIdle,
    OcActive,
    OcActiveSilent,
    IcIdle,
    IcActive,
    IcActiveSilent,
}

impl ChannelState {
    fn is_input(&self) -> bool {
        matches!(self, Self::IcIdle | Self::IcActive | Self::IcActiveSilent)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Timer instances. Sets the RCC enable bit, and which features are available.
pub enum TimerDevice {
    Tim1,
    Tim2,
    Tim3,
    Tim4,
    Tim5,
    Tim6,
    Tim7,
    Tim8,
    Tim15,
    Tim16,
    Tim17,
}

impl TimerDevice {
    /// Has break inputs, dead time, a main output enable, and a repetition counter.
    pub fn is_advanced(&self) -> bool {
        matches!(
            self,
            Self::Tim1 | Self::Tim8 | Self::Tim15 | Self::Tim16 | Self::Tim17
        )
    }

    pub fn has_break2(&self) -> bool {
        matches!(self, Self::Tim1 | Self::Tim8)
    }

    /// TIM2-5 have 32-bit counters; the rest 16-bit.
    pub fn is_32bit(&self) -> bool {
        matches!(self, Self::Tim2 | Self::Tim3 | Self::Tim4 | Self::Tim5)
    }

    pub fn num_channels(&self) -> usize {
        match self {
            Self::Tim1 | Self::Tim8 => 6,
            Self::Tim2 | Self::Tim3 | Self::Tim4 | Self::Tim5 => 4,
            Self::Tim15 => 2,
            Self::Tim16 | Self::Tim17 => 1,
            Self::Tim6 | Self::Tim7 => 0,
        }
    }
}

/// Timer channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum TimChannel {
    C1,
    C2,
    C3,
    C4,
    /// Output compare only; internal on TIM1 and TIM8.
    C5,
    C6,
}

impl TimChannel {
    pub fn idx(&self) -> usize {
        *self as usize
    }

    fn from_idx(i: usize) -> Self {
        match i {
            0 => Self::C1,
            1 => Self::C2,
            2 => Self::C3,
            3 => Self::C4,
            4 => Self::C5,
            _ => Self::C6,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Counting direction, and alignment. Sets CR1 DIR and CMS.
pub enum CounterMode {
    Up,
    Down,
    /// Center-aligned mode 1. The counter counts up and down alternatively. Output compare
    /// interrupt flags of channels configured in output are set only when the counter is
    /// counting down.
    CenterDown,
    /// Center-aligned mode 2. Output compare interrupt flags are set only when the counter is
    /// counting up.
    CenterUp,
    /// Center-aligned mode 3. Output compare interrupt flags are set both when the counter is
    /// counting up or down.
    CenterUpDown,
}

impl CounterMode {
    /// DIR and CMS values.
    fn bits(&self) -> (bool, u8) {
        match self {
            Self::Up => (false, 0b00),
            Self::Down => (true, 0b00),
            Self::CenterDown => (false, 0b01),
            Self::CenterUp => (false, 0b10),
            Self::CenterUpDown => (false, 0b11),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// Ratio between the timer clock and the dead-time and digital filter sampling clock.
pub enum ClockDivision {
    Div1 = 0b00,
    Div2 = 0b01,
    Div4 = 0b10,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct TimerConfig {
    pub prescaler: u16,
    /// Auto-reload value. Up to 16 bits, except on TIM2-5.
    pub period: u32,
    pub counter_mode: CounterMode,
    pub clock_division: ClockDivision,
    /// Update events are generated every `repetition_counter + 1` counter overflows. Advanced
    /// timers only.
    pub repetition_counter: u16,
    pub auto_reload_preload: bool,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            prescaler: 0,
            period: 0xFFFF,
            counter_mode: CounterMode::Up,
            clock_division: ClockDivision::Div1,
            repetition_counter: 0,
            auto_reload_preload: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Which events set the update interrupt flag, and DMA request. Sets CR1 URS.
pub enum UpdateSource {
    /// Counter overflow or underflow, UG, or a slave mode reset.
    Regular,
    /// Counter overflow or underflow only.
    CounterOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// See U5 RM, section 54.6.7. These bits define the behavior of the output reference signal
/// OC1REF from which OC1 and OC1N are derived. OC1REF is active high whereas OC1 and OC1N
/// active level depends on CC1P and CC1NP bits.
///
/// Frozen - The comparison between the output compare register TIMx_CCR1 and the counter
/// TIMx_CNT has no effect on the outputs. (this mode is used to generate a timing base).
///
/// PWM mode 1 - In upcounting, channel 1 is active as long as TIMx_CNT<TIMx_CCR1 else
/// inactive. In downcounting, channel 1 is inactive (OC1REF=‘0) as long as TIMx_CNT>TIMx_CCR1
/// else active (OC1REF=1).
///
/// Retriggerable OPM mode 1 - In up-counting mode, the channel is active until a trigger event
/// is detected (on TRGI signal). Then, a comparison is performed as in PWM mode 1 and the
/// channels becomes inactive again at the next update.
///
/// Combined PWM mode 1 - OC1REF has the same behavior as in PWM mode 1. OC1REFC is the logical
/// OR between OC1REF and OC2REF.
///
/// Asymmetric PWM mode 1 - OC1REF has the same behavior as in PWM mode 1. OC1REFC outputs
/// OC1REF when the counter is counting up, OC2REF when it is counting down.
pub enum OutputCompare {
    Frozen = 0b0000,
    Active = 0b0001,
    Inactive = 0b0010,
    Toggle = 0b0011,
    ForceInactive = 0b0100,
    ForceActive = 0b0101,
    Pwm1 = 0b0110,
    Pwm2 = 0b0111,
    RetriggerableOpmMode1 = 0b1000,
    RetriggerableOpmMode2 = 0b1001,
    CombinedPwm1 = 0b1100,
    CombinedPwm2 = 0b1101,
    AsymmetricPwm1 = 0b1110,
    AsymmetricPwm2 = 0b1111,
}

impl OutputCompare {
    /// The `OCxM` field is split into its low three bits, and a separate bit 3.
    fn left_bit(&self) -> bool {
        (*self as u8) & 0b1000 != 0
    }
}

/// Capture/Compare output polarity. Defaults to `ActiveHigh` in hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Output level when the main output is off. (CR2 OISx) Advanced timers only.
pub enum IdleState {
    Reset,
    Set,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct OcConfig {
    pub mode: OutputCompare,
    /// Compare value; the CCRx register.
    pub pulse: u32,
    pub polarity: Polarity,
    pub idle_state: IdleState,
    /// Load CCRx writes at the next update event, instead of immediately. Required for PWM.
    pub preload: bool,
    /// Fast mode: a trigger acts on the output as if a compare match occurred.
    pub fast: bool,
}

impl Default for OcConfig {
    fn default() -> Self {
        Self {
            mode: OutputCompare::Pwm1,
            pulse: 0,
            polarity: Polarity::ActiveHigh,
            idle_state: IdleState::Reset,
            preload: true,
            fast: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Input capture edge. Sets CCER CCxP and CCxNP.
pub enum IcPolarity {
    Rising,
    Falling,
    Both,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Which input a capture channel uses. It affects the TIMx_CCMRx register, CCxS fields.
pub enum IcSelection {
    /// TI1 for channel 1, TI2 for channel 2 etc.
    Direct = 0b01,
    /// The other input of the channel pair; eg TI2 for channel 1.
    Indirect = 0b10,
    /// The internal trigger, TRC.
    Trc = 0b11,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Capture once every 1, 2, 4, or 8 events.
pub enum IcPrescaler {
    Div1 = 0b00,
    Div2 = 0b01,
    Div4 = 0b10,
    Div8 = 0b11,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct IcConfig {
    pub polarity: IcPolarity,
    pub selection: IcSelection,
    pub prescaler: IcPrescaler,
    /// Input filter, 0 to 15. See the ICxF field description in the RM.
    pub filter: u8,
}

impl Default for IcConfig {
    fn default() -> Self {
        Self {
            polarity: IcPolarity::Rising,
            selection: IcSelection::Direct,
            prescaler: IcPrescaler::Div1,
            filter: 0,
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Master mode: the trigger output (TRGO) sent to slave timers and other peripherals.
pub enum Mms {
    Reset = 0b0000,
    Enable = 0b0001,
    Update = 0b0010,
    ComparePulse = 0b0011,
    Oc1Ref = 0b0100,
    Oc2Ref = 0b0101,
    Oc3Ref = 0b0110,
    Oc4Ref = 0b0111,
    EncoderClock = 0b1000,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Slave mode. Sets SMCR SMS.
pub enum SlaveMode {
    Disabled = 0b0000,
    Encoder1 = 0b0001,
    Encoder2 = 0b0010,
    Encoder3 = 0b0011,
    /// Rising edge of the trigger input reinitializes the counter.
    Reset = 0b0100,
    /// The counter runs while the trigger input is high.
    Gated = 0b0101,
    /// The counter starts on a rising edge of the trigger input.
    Trigger = 0b0110,
    ExternalClock1 = 0b0111,
    CombinedResetTrigger = 0b1000,
    CombinedGatedReset = 0b1001,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Trigger input of a slave timer. Sets SMCR TS. Internal trigger sources per timer are
/// listed in U5 RM, Table 491: "TIMx internal trigger connection".
pub enum TriggerSel {
    Itr0 = 0b00000,
    Itr1 = 0b00001,
    Itr2 = 0b00010,
    Itr3 = 0b00011,
    /// TI1 edge detector
    Ti1fEd = 0b00100,
    Ti1fp1 = 0b00101,
    Ti2fp2 = 0b00110,
    /// External trigger input
    Etrf = 0b00111,
    Itr4 = 0b01000,
    Itr5 = 0b01001,
    Itr6 = 0b01010,
    Itr7 = 0b01011,
    Itr8 = 0b01100,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct EventMask(pub u32);

impl EventMask {
    pub const UPDATE: Self = Self(1 << 0);
    pub const CC1: Self = Self(1 << 1);
    pub const CC2: Self = Self(1 << 2);
    pub const CC3: Self = Self(1 << 3);
    pub const CC4: Self = Self(1 << 4);
    pub const COMMUTATION: Self = Self(1 << 5);
    pub const TRIGGER: Self = Self(1 << 6);
    pub const BREAK: Self = Self(1 << 7);
    pub const BREAK2: Self = Self(1 << 8);
}

impl core::ops::BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum BreakInput {
    Break1,
    /// TIM1 and TIM8 only.
    Break2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum BreakPolarity {
    ActiveLow,
    ActiveHigh,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(usize)]
/// Timer DMA requests. Each uses its own DMA channel; see `set_dma`.
pub enum DmaRequest {
    Update = 0,
    Cc1 = 1,
    Cc2 = 2,
    Cc3 = 3,
    Cc4 = 4,
    Commutation = 5,
    Trigger = 6,
}

impl DmaRequest {
    fn for_channel(ch: TimChannel) -> Result<Self> {
        Ok(match ch {
            TimChannel::C1 => Self::Cc1,
            TimChannel::C2 => Self::Cc2,
            TimChannel::C3 => Self::Cc3,
            TimChannel::C4 => Self::Cc4,
            _ => return Err(Error::InvalidParam),
        })
    }
}

/// A timer's registers, viewed through the advanced timer layout. The other timer kinds
/// implement a subset of it, at the same offsets.
pub struct TimRegs(*const pac::tim1::RegisterBlock);

unsafe impl Send for TimRegs {}

impl Deref for TimRegs {
    type Target = pac::tim1::RegisterBlock;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.0 }
    }
}

/// Handlers run on timer events. They default to doing nothing.
pub struct TimerCallbacks<R> {
    pub error: fn(&mut Timer<R>),
    /// An update DMA transfer was stopped.
    pub stop: fn(&mut Timer<R>),
    /// A channel DMA transfer was stopped.
    pub channel_stop: fn(&mut Timer<R>, TimChannel),
    pub update: fn(&mut Timer<R>),
    pub update_half: fn(&mut Timer<R>),
    pub trigger: fn(&mut Timer<R>),
    pub trigger_half: fn(&mut Timer<R>),
    pub input_capture: fn(&mut Timer<R>, TimChannel),
    pub input_capture_half: fn(&mut Timer<R>, TimChannel),
    pub compare_match: fn(&mut Timer<R>, TimChannel),
    pub compare_match_half: fn(&mut Timer<R>, TimChannel),
    pub commutation: fn(&mut Timer<R>),
    pub commutation_half: fn(&mut Timer<R>),
    pub break1: fn(&mut Timer<R>),
    pub break2: fn(&mut Timer<R>),
    pub system_break: fn(&mut Timer<R>),
    pub encoder_index: fn(&mut Timer<R>),
    pub direction_change: fn(&mut Timer<R>),
    pub index_error: fn(&mut Timer<R>),
    pub transition_error: fn(&mut Timer<R>),
}

impl<R> Default for TimerCallbacks<R> {
    fn default() -> Self {
        Self {
            error: |_| (),
            stop: |_| (),
            channel_stop: |_, _| (),
            update: |_| (),
            update_half: |_| (),
            trigger: |_| (),
            trigger_half: |_| (),
            input_capture: |_, _| (),
            input_capture_half: |_, _| (),
            compare_match: |_, _| (),
            compare_match_half: |_, _| (),
            commutation: |_| (),
            commutation_half: |_| (),
            break1: |_| (),
            break2: |_| (),
            system_break: |_| (),
            encoder_index: |_| (),
            direction_change: |_| (),
            index_error: |_| (),
            transition_error: |_| (),
        }
    }
}

macro_rules! callback_setters {
    ($($name:ident: ($($arg:ty),*)),+ $(,)?) => {
        paste! {
            $(
                pub fn [<register_ $name _callback>](&mut self, cb: fn(&mut Self $(, $arg)*)) {
                    self.callbacks.$name = cb;
                }
            )+
        }
    };
}

/// Represents a timer peripheral.
pub struct Timer<R> {
    pub regs: R,
    device: TimerDevice,
    /// Associated timer clock speed in Hz.
    clock_speed: u32,
    state: TimerState,
    ch_state: [ChannelState; 6],
    last_error_codes: u32,
    dma: [Option<DmaChannel>; 7],
    callbacks: TimerCallbacks<R>,
}

impl<R> Timer<R>
where
    R: Deref<Target = pac::tim1::RegisterBlock>,
{
    /// Initialize a timer, including enabling and resetting its RCC peripheral clock. Writes
    /// the time base, then generates an update event to load it. `clock_speed` is the timer's
    /// kernel clock, in Hz.
    pub fn new(
        regs: R,
        device: TimerDevice,
        cfg: &TimerConfig,
        clock_speed: u32,
        rcc: &pac::rcc::RegisterBlock,
    ) -> Result<Self> {
        critical_section::with(|_| match device {
            TimerDevice::Tim1 => {
                rcc_en_reset!(apb2, tim1, rcc);
            }
            TimerDevice::Tim2 => {
                rcc_en_reset!(apb1, tim2, rcc);
            }
            TimerDevice::Tim3 => {
                rcc_en_reset!(apb1, tim3, rcc);
            }
            TimerDevice::Tim4 => {
                rcc_en_reset!(apb1, tim4, rcc);
            }
            TimerDevice::Tim5 => {
                rcc_en_reset!(apb1, tim5, rcc);
            }
            TimerDevice::Tim6 => {
                rcc_en_reset!(apb1, tim6, rcc);
            }
            TimerDevice::Tim7 => {
                rcc_en_reset!(apb1, tim7, rcc);
            }
            TimerDevice::Tim8 => {
                rcc_en_reset!(apb2, tim8, rcc);
            }
            TimerDevice::Tim15 => {
                rcc_en_reset!(apb2, tim15, rcc);
            }
            TimerDevice::Tim16 => {
                rcc_en_reset!(apb2, tim16, rcc);
            }
            TimerDevice::Tim17 => {
                rcc_en_reset!(apb2, tim17, rcc);
            }
        });

        let mut result = Self {
            regs,
            device,
            clock_speed,
            state: TimerState::Init,
            ch_state: [ChannelState::Reset; 6],
            last_error_codes: 0,
            dma: Default::default(),
            callbacks: Default::default(),
        };

        result.set_config(cfg)?;
        Ok(result)
    }

    fn set_config(&mut self, cfg: &TimerConfig) -> Result<()> {
        self.check_period(cfg.period)?;
        if cfg.repetition_counter != 0 && !self.device.is_advanced() {
            return Err(Error::InvalidParam);
        }

        let (dir, cms) = cfg.counter_mode.bits();
        self.regs.cr1().modify(|_, w| unsafe {
            w.dir().bit(dir);
            w.cms().bits(cms);
            w.ckd().bits(cfg.clock_division as u8);
            w.arpe().bit(cfg.auto_reload_preload)
        });
        self.write_arr(cfg.period);
        self.regs.psc().write(|w| w.psc().set(cfg.prescaler));
        if self.device.is_advanced() {
            self.regs
                .rcr()
                .write(|w| w.rep().set(cfg.repetition_counter));
        }

        // Trigger an update event to load the prescaler value to the clock.
        self.regs.egr().write(|w| w.ug().set_bit());
        // The above line raises an update event which will indicate that the timer is already
        // finished. Since this is not the case, it should be cleared.
        self.regs.sr().write(|w| w.uif().clear_bit());

        self.state = TimerState::Idle;
        Ok(())
    }

    fn check_period(&self, period: u32) -> Result<()> {
        if !self.device.is_32bit() && period > 0xFFFF {
            return Err(Error::InvalidParam);
        }
        Ok(())
    }

    fn write_arr(&self, arr: u32) {
        self.regs.arr().write(|w| unsafe { w.bits(arr) });
    }

    fn check_channel(&self, ch: TimChannel) -> Result<()> {
        if ch.idx() >= self.device.num_channels() {
            return Err(Error::InvalidParam);
        }
        Ok(())
    }

    /// Set the timer frequency, in Hz. Overrides the period and prescaler set in the
    /// constructor. If you use center-aligned mode, make sure to enter twice the freq you
    /// normally would.
    pub fn set_freq(&mut self, freq: f32) -> Result<()> {
        let (psc, arr) = calc_freq_vals(freq, self.clock_speed)?;

        self.write_arr(arr as u32);
        self.regs.psc().write(|w| w.psc().set(psc));
        Ok(())
    }

    /// Set the auto-reload register value. Used for adjusting frequency.
    pub fn set_period(&mut self, arr: u32) -> Result<()> {
        self.check_period(arr)?;
        self.write_arr(arr);
        Ok(())
    }

    /// Set the prescaler value. Used for adjusting frequency.
    pub fn set_prescaler(&mut self, psc: u16) {
        self.regs.psc().write(|w| w.psc().set(psc));
    }

    pub fn set_counter_mode(&mut self, mode: CounterMode) -> Result<()> {
        check_state(self.state, &[TimerState::Idle])?;
        let (dir, cms) = mode.bits();
        self.regs
            .cr1()
            .modify(|_, w| unsafe { w.dir().bit(dir).cms().bits(cms) });
        Ok(())
    }

    pub fn set_clock_division(&mut self, div: ClockDivision) {
        self.regs
            .cr1()
            .modify(|_, w| unsafe { w.ckd().bits(div as u8) });
    }

    pub fn set_repetition_counter(&mut self, rep: u16) -> Result<()> {
        if !self.device.is_advanced() {
            return Err(Error::InvalidParam);
        }
        self.regs.rcr().write(|w| w.rep().set(rep));
        Ok(())
    }

    pub fn set_counter(&mut self, value: u32) {
        self.regs.cnt().write(|w| unsafe { w.bits(value) });
    }

    /// Read the current counter value.
    pub fn counter(&self) -> u32 {
        self.regs.cnt().read().bits()
    }

    pub fn enable_update_generation(&mut self) {
        self.regs.cr1().modify(|_, w| w.udis().clear_bit());
    }

    pub fn disable_update_generation(&mut self) {
        self.regs.cr1().modify(|_, w| w.udis().set_bit());
    }

    pub fn set_update_source(&mut self, source: UpdateSource) {
        self.regs
            .cr1()
            .modify(|_, w| w.urs().bit(source == UpdateSource::CounterOnly));
    }

    /// Set auto reload preloader; useful when changing period and duty mid-run.
    pub fn enable_auto_reload_preload(&mut self) {
        self.regs.cr1().modify(|_, w| w.arpe().set_bit());
    }

    pub fn disable_auto_reload_preload(&mut self) {
        self.regs.cr1().modify(|_, w| w.arpe().clear_bit());
    }

    /// Stop the counter at the next update event.
    pub fn enable_one_pulse_mode(&mut self) {
        self.regs.cr1().modify(|_, w| w.opm().set_bit());
    }

    pub fn disable_one_pulse_mode(&mut self) {
        self.regs.cr1().modify(|_, w| w.opm().clear_bit());
    }

    /// Disable the counter, unless a channel still uses it.
    fn disable_counter(&self) {
        if self.regs.ccer().read().bits() & CCER_CCXE == 0 {
            self.regs.cr1().modify(|_, w| w.cen().clear_bit());
        }
    }

    fn enable_counter(&self) {
        self.regs.cr1().modify(|_, w| w.cen().set_bit());
    }

    /// Start the counter.
    pub fn start(&mut self) -> Result<()> {
        check_update_state(&mut self.state, TimerState::Idle, TimerState::Active)?;
        self.enable_counter();
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        check_update_state(&mut self.state, TimerState::Active, TimerState::Idle)?;
        self.disable_counter();
        Ok(())
    }

    /// Start the counter, with the update interrupt enabled. The `update` callback runs on
    /// each update event.
    pub fn start_it(&mut self) -> Result<()> {
        check_update_state(&mut self.state, TimerState::Idle, TimerState::Active)?;
        self.regs.dier().modify(|_, w| w.uie().set_bit());
        self.enable_counter();
        Ok(())
    }

    pub fn stop_it(&mut self) -> Result<()> {
        check_update_state(&mut self.state, TimerState::Active, TimerState::Idle)?;
        self.regs.dier().modify(|_, w| w.uie().clear_bit());
        self.disable_counter();
        Ok(())
    }

    /// Set the DMA channel that serves `req`. Configure it first, with the matching request
    /// (eg `DmaInput::Tim2Up`) and 32-bit data widths.
    pub fn set_dma(&mut self, req: DmaRequest, dma: DmaChannel) -> Result<()> {
        check_state(self.state, &[TimerState::Init, TimerState::Idle])?;
        self.dma[req as usize] = Some(dma);
        Ok(())
    }

    fn start_request_dma(&mut self, req: DmaRequest, src: u32, dst: u32, len: usize, opt: DmaOptIt) -> Result<()> {
        let Some(dma) = self.dma[req as usize].as_mut() else {
            return Err(Error::InvalidParam);
        };
        if let Err(e) = dma.start_periph_xfer_it_opt(src, dst, (len * 4) as u32, opt) {
            self.last_error_codes |= TimerError::Dma as u32;
            return Err(e);
        }
        self.set_request(req, true);
        Ok(())
    }

    /// Enable or disable a DMA request. (DIER UDE, CCxDE, COMDE, TDE)
    fn set_request(&self, req: DmaRequest, enable: bool) {
        self.regs.dier().modify(|_, w| match req {
            DmaRequest::Update => w.ude().bit(enable),
            DmaRequest::Commutation => w.comde().bit(enable),
            DmaRequest::Trigger => w.tde().bit(enable),
            _ => w.ccde(req as u8 - 1).bit(enable),
        });
    }

    fn dma_running(&self, req: DmaRequest) -> bool {
        self.dma[req as usize]
            .as_ref()
            .map(|d| matches!(d.state(), DmaState::Active | DmaState::Suspend))
            .unwrap_or(false)
    }

    /// Abort the DMA channel serving `req`. Blocking for silent transfers; otherwise the stop
    /// callback runs once the abort completes.
    fn abort_request_dma(&mut self, req: DmaRequest, silent: bool) -> Result<()> {
        self.set_request(req, false);
        if !self.dma_running(req) {
            self.dma_stopped(req);
            return Ok(());
        }
        let Some(dma) = self.dma[req as usize].as_mut() else {
            return Ok(());
        };

        if silent {
            let result = dma.abort();
            self.dma_stopped(req);
            return result;
        }
        if dma.abort_it().is_err() {
            // Already finished.
            self.dma_stopped(req);
        }
        Ok(())
    }

    fn dma_stopped(&mut self, req: DmaRequest) {
        match req {
            DmaRequest::Update => (self.callbacks.stop)(self),
            DmaRequest::Cc1 | DmaRequest::Cc2 | DmaRequest::Cc3 | DmaRequest::Cc4 => {
                let ch = TimChannel::from_idx(req as usize - 1);
                (self.callbacks.channel_stop)(self, ch);
            }
            _ => (),
        }
    }

    /// Start the counter, with the update DMA request writing `data` into ARR, one word per
    /// update event.
    ///
    /// # Safety
    /// `data` must stay valid until the transfer completes or is stopped.
    pub unsafe fn start_dma(&mut self, data: &[u32], opt: DmaOptIt) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidParam);
        }
        let active = if opt == DmaOptIt::Silent {
            TimerState::ActiveSilent
        } else {
            TimerState::Active
        };
        check_update_state(&mut self.state, TimerState::Idle, active)?;
        self.last_error_codes = 0;

        let dst = dma::reg_addr(self.regs.arr());
        if let Err(e) = self.start_request_dma(DmaRequest::Update, data.as_ptr() as u32, dst, data.len(), opt) {
            self.state = TimerState::Idle;
            return Err(e);
        }

        self.enable_counter();
        Ok(())
    }

    /// Stop the counter and the update DMA transfer. If the transfer's not silent, the
    /// `stop` callback runs from `dma_irq_handler` once the channel's aborted.
    pub fn stop_dma(&mut self) -> Result<()> {
        let silent = self.state == TimerState::ActiveSilent;
        check_state(self.state, &[TimerState::Active, TimerState::ActiveSilent])?;
        self.disable_counter();
        self.state = TimerState::Idle;
        self.abort_request_dma(DmaRequest::Update, silent)
    }

    /// Replace the `mask` bits of `ch`'s CCMR half with `bits`. Both use the odd channel
    /// layout.
    fn modify_ccmr(&self, ch: TimChannel, mask: u32, bits: u32) {
        let shift = 8 * (ch.idx() % 2);
        let merge = |r: u32| (r & !(mask << shift)) | (bits << shift);
        match ch {
            TimChannel::C1 | TimChannel::C2 => {
                self.regs
                    .ccmr1_output()
                    .modify(|r, w| unsafe { w.bits(merge(r.bits())) });
            }
            TimChannel::C3 | TimChannel::C4 => {
                self.regs
                    .ccmr2_output()
                    .modify(|r, w| unsafe { w.bits(merge(r.bits())) });
            }
            TimChannel::C5 | TimChannel::C6 => {
                self.regs
                    .ccmr3_output()
                    .modify(|r, w| unsafe { w.bits(merge(r.bits())) });
            }
        }
    }

    /// `ch`'s CCMR half, in the odd channel layout.
    fn read_ccmr(&self, ch: TimChannel) -> u32 {
        let r = match ch {
            TimChannel::C1 | TimChannel::C2 => self.regs.ccmr1_output().read().bits(),
            TimChannel::C3 | TimChannel::C4 => self.regs.ccmr2_output().read().bits(),
            TimChannel::C5 | TimChannel::C6 => self.regs.ccmr3_output().read().bits(),
        };
        r >> (8 * (ch.idx() % 2))
    }

    fn write_ccr(&self, ch: TimChannel, v: u32) {
        match ch {
            TimChannel::C5 => {
                self.regs.ccr5().modify(|_, w| w.ccr().set(v));
            }
            TimChannel::C6 => {
                self.regs.ccr6().write(|w| unsafe { w.bits(v) });
            }
            _ => {
                self.regs.ccr(ch.idx()).write(|w| unsafe { w.bits(v) });
            }
        }
    }

    fn read_ccr(&self, ch: TimChannel) -> u32 {
        match ch {
            TimChannel::C5 => self.regs.ccr5().read().ccr().bits(),
            TimChannel::C6 => self.regs.ccr6().read().bits(),
            _ => self.regs.ccr(ch.idx()).read().bits(),
        }
    }

    fn ccr_addr(&self, ch: TimChannel) -> u32 {
        match ch {
            TimChannel::C5 => dma::reg_addr(self.regs.ccr5()),
            TimChannel::C6 => dma::reg_addr(self.regs.ccr6()),
            _ => dma::reg_addr(self.regs.ccr(ch.idx())),
        }
    }

    /// Set a channel's CCxE bit.
    fn set_channel_enable(&self, ch: TimChannel, enable: bool) {
        self.regs
            .ccer()
            .modify(|_, w| w.cce(ch.idx() as u8).bit(enable));
    }

    /// Enable or disable a channel output. Advanced timers also need the main output enabled;
    /// it's cleared once no channel uses it.
    fn set_channel_output(&self, ch: TimChannel, enable: bool) {
        self.set_channel_enable(ch, enable);

        if self.device.is_advanced() {
            if enable {
                self.regs.bdtr().modify(|_, w| w.moe().set_bit());
            } else if self.regs.ccer().read().bits() & (CCER_CCXE | CCER_CCXNE) == 0 {
                self.regs.bdtr().modify(|_, w| w.moe().clear_bit());
            }
        }
    }

    /// Configure a channel as output compare. It must not be running.
    pub fn oc_set_config_channel(&mut self, ch: TimChannel, cfg: &OcConfig) -> Result<()> {
        self.check_channel(ch)?;
        check_state(
            self.ch_state[ch.idx()],
            &[ChannelState::Reset, ChannelState::OcIdle, ChannelState::IcIdle],
        )?;
        self.check_period(cfg.pulse)?;

        // CCxS is writable only when the channel is off.
        self.set_channel_enable(ch, false);

        let mode = cfg.mode as u32;
        let mut bits = ((mode & 0b111) << 4) & CCMR_OCM;
        if cfg.mode.left_bit() {
            bits |= CCMR_OCM_3;
        }
        if cfg.preload {
            bits |= CCMR_OCPE;
        }
        if cfg.fast {
            bits |= CCMR_OCFE;
        }
        self.modify_ccmr(
            ch,
            CCMR_CCS | CCMR_OCM | CCMR_OCM_3 | CCMR_OCPE | CCMR_OCFE,
            bits,
        );

        let n = ch.idx() as u8;
        self.regs
            .ccer()
            .modify(|_, w| w.ccp(n).bit(cfg.polarity == Polarity::ActiveLow));
        if self.device.is_advanced() {
            self.regs
                .cr2()
                .modify(|_, w| w.ois(n).bit(cfg.idle_state == IdleState::Set));
        }
        self.write_ccr(ch, cfg.pulse);

        self.ch_state[ch.idx()] = ChannelState::OcIdle;
        Ok(())
    }

    /// Set the compare value of an output channel. Divide by `period()` to find the portion
    /// of the duty cycle used, in PWM modes.
    pub fn oc_set_pulse(&mut self, ch: TimChannel, pulse: u32) -> Result<()> {
        self.check_channel(ch)?;
        self.check_period(pulse)?;
        self.write_ccr(ch, pulse);
        Ok(())
    }

    pub fn oc_start_channel(&mut self, ch: TimChannel) -> Result<()> {
        self.check_channel(ch)?;
        check_update_state(&mut self.ch_state[ch.idx()], ChannelState::OcIdle, ChannelState::OcActive)?;
        self.set_channel_output(ch, true);
        Ok(())
    }

    pub fn oc_stop_channel(&mut self, ch: TimChannel) -> Result<()> {
        self.check_channel(ch)?;
        check_update_state(&mut self.ch_state[ch.idx()], ChannelState::OcActive, ChannelState::OcIdle)?;
        self.set_channel_output(ch, false);
        Ok(())
    }

    /// Index of `ch`'s CCxIE bit. Channels 1 to 4 only.
    fn cc_it(ch: TimChannel) -> Result<u8> {
        if ch.idx() > 3 {
            return Err(Error::InvalidParam);
        }
        Ok(ch.idx() as u8)
    }

    fn set_cc_interrupt(&self, n: u8, enable: bool) {
        self.regs.dier().modify(|_, w| w.ccie(n).bit(enable));
    }

    /// Start an output channel, with its compare match interrupt. Channels 1 to 4.
    pub fn oc_start_channel_it(&mut self, ch: TimChannel) -> Result<()> {
        self.check_channel(ch)?;
        let ie = Self::cc_it(ch)?;
        check_update_state(&mut self.ch_state[ch.idx()], ChannelState::OcIdle, ChannelState::OcActive)?;
        self.set_cc_interrupt(ie, true);
        self.set_channel_output(ch, true);
        Ok(())
    }

    pub fn oc_stop_channel_it(&mut self, ch: TimChannel) -> Result<()> {
        self.check_channel(ch)?;
        let ie = Self::cc_it(ch)?;
        check_update_state(&mut self.ch_state[ch.idx()], ChannelState::OcActive, ChannelState::OcIdle)?;
        self.set_cc_interrupt(ie, false);
        self.set_channel_output(ch, false);
        Ok(())
    }

    /// Start an output channel, with its DMA request writing `data` into CCRx, one word per
    /// compare match.
    ///
    /// # Safety
    /// `data` must stay valid until the transfer completes or is stopped.
    pub unsafe fn oc_start_channel_dma(&mut self, ch: TimChannel, data: &[u32], opt: DmaOptIt) -> Result<()> {
        self.check_channel(ch)?;
        let req = DmaRequest::for_channel(ch)?;
        if data.is_empty() {
            return Err(Error::InvalidParam);
        }
        let active = if opt == DmaOptIt::Silent {
            ChannelState::OcActiveSilent
        } else {
            ChannelState::OcActive
        };
        check_update_state(&mut self.ch_state[ch.idx()], ChannelState::OcIdle, active)?;
        self.last_error_codes = 0;

        let dst = self.ccr_addr(ch);
        if let Err(e) = self.start_request_dma(req, data.as_ptr() as u32, dst, data.len(), opt) {
            self.ch_state[ch.idx()] = ChannelState::OcIdle;
            return Err(e);
        }
        self.set_channel_output(ch, true);
        Ok(())
    }

    pub fn oc_stop_channel_dma(&mut self, ch: TimChannel) -> Result<()> {
        self.check_channel(ch)?;
        let req = DmaRequest::for_channel(ch)?;
        let silent = self.ch_state[ch.idx()] == ChannelState::OcActiveSilent;
        check_state(
            self.ch_state[ch.idx()],
            &[ChannelState::OcActive, ChannelState::OcActiveSilent],
        )?;

        self.set_channel_output(ch, false);
        self.ch_state[ch.idx()] = ChannelState::OcIdle;
        self.abort_request_dma(req, silent)
    }

    /// Configure a channel as input capture. Channels 1 to 4.
    pub fn ic_set_config_channel(&mut self, ch: TimChannel, cfg: &IcConfig) -> Result<()> {
        self.check_channel(ch)?;
        if ch.idx() > 3 || cfg.filter > 15 {
            return Err(Error::InvalidParam);
        }
        check_state(
            self.ch_state[ch.idx()],
            &[ChannelState::Reset, ChannelState::OcIdle, ChannelState::IcIdle],
        )?;

        self.set_channel_enable(ch, false);
        let bits = cfg.selection as u32
            | ((cfg.prescaler as u32) << 2)
            | ((cfg.filter as u32) << 4);
        self.modify_ccmr(
            ch,
            CCMR_CCS | CCMR_ICPSC | CCMR_ICF | CCMR_OCM_3,
            bits,
        );

        let (p, np) = match cfg.polarity {
            IcPolarity::Rising => (false, false),
            IcPolarity::Falling => (true, false),
            IcPolarity::Both => (true, true),
        };
        let n = ch.idx() as u8;
        self.regs
            .ccer()
            .modify(|_, w| w.ccp(n).bit(p).ccnp(n).bit(np));

        self.ch_state[ch.idx()] = ChannelState::IcIdle;
        Ok(())
    }

    /// The last captured counter value.
    pub fn ic_read_captured_value(&self, ch: TimChannel) -> Result<u32> {
        self.check_channel(ch)?;
        Ok(self.read_ccr(ch))
    }

    pub fn ic_start_channel(&mut self, ch: TimChannel) -> Result<()> {
        self.check_channel(ch)?;
        check_update_state(&mut self.ch_state[ch.idx()], ChannelState::IcIdle, ChannelState::IcActive)?;
        self.set_channel_enable(ch, true);
        Ok(())
    }

    pub fn ic_stop_channel(&mut self, ch: TimChannel) -> Result<()> {
        self.check_channel(ch)?;
        check_update_state(&mut self.ch_state[ch.idx()], ChannelState::IcActive, ChannelState::IcIdle)?;
        self.set_channel_enable(ch, false);
        Ok(())
    }

    /// Start capturing, with the `input_capture` callback run on each capture.
    pub fn ic_start_channel_it(&mut self, ch: TimChannel) -> Result<()> {
        self.check_channel(ch)?;
        let ie = Self::cc_it(ch)?;
        check_update_state(&mut self.ch_state[ch.idx()], ChannelState::IcIdle, ChannelState::IcActive)?;
        self.set_cc_interrupt(ie, true);
        self.set_channel_enable(ch, true);
        Ok(())
    }

    pub fn ic_stop_channel_it(&mut self, ch: TimChannel) -> Result<()> {
        self.check_channel(ch)?;
        let ie = Self::cc_it(ch)?;
        check_update_state(&mut self.ch_state[ch.idx()], ChannelState::IcActive, ChannelState::IcIdle)?;
        self.set_cc_interrupt(ie, false);
        self.set_channel_enable(ch, false);
        Ok(())
    }

    /// Start capturing, with the channel's DMA request moving each captured value from CCRx
    /// into `buf`.
    ///
    /// # Safety
    /// `buf` must stay valid until the transfer completes or is stopped.
    pub unsafe fn ic_start_channel_dma(&mut self, ch: TimChannel, buf: &mut [u32], opt: DmaOptIt) -> Result<()> {
        self.check_channel(ch)?;
        let req = DmaRequest::for_channel(ch)?;
        if buf.is_empty() {
            return Err(Error::InvalidParam);
        }
        let active = if opt == DmaOptIt::Silent {
            ChannelState::IcActiveSilent
        } else {
            ChannelState::IcActive
        };
        check_update_state(&mut self.ch_state[ch.idx()], ChannelState::IcIdle, active)?;
        self.last_error_codes = 0;

        let src = self.ccr_addr(ch);
        if let Err(e) = self.start_request_dma(req, src, buf.as_mut_ptr() as u32, buf.len(), opt) {
            self.ch_state[ch.idx()] = ChannelState::IcIdle;
            return Err(e);
        }
        self.set_channel_enable(ch, true);
        Ok(())
    }

    pub fn ic_stop_channel_dma(&mut self, ch: TimChannel) -> Result<()> {
        self.check_channel(ch)?;
        let req = DmaRequest::for_channel(ch)?;
        let silent = self.ch_state[ch.idx()] == ChannelState::IcActiveSilent;
        check_state(
            self.ch_state[ch.idx()],
            &[ChannelState::IcActive, ChannelState::IcActiveSilent],
        )?;

        self.set_channel_enable(ch, false);
        self.ch_state[ch.idx()] = ChannelState::IcIdle;
        self.abort_request_dma(req, silent)
    }

    /// Write `data` to a block of timer registers on each `req` event, using the DMA burst
    /// interface. `base` is the first register's word offset from CR1 (eg 13 for CCR1), and
    /// `burst_len` the number of registers written per event, 1 to 18.
    ///
    /// # Safety
    /// `data` must stay valid until the transfer completes or is aborted.
    pub unsafe fn dma_burst_write(
        &mut self,
        req: DmaRequest,
        base: u8,
        burst_len: u8,
        data: &[u32],
        opt: DmaOptIt,
    ) -> Result<()> {
        if base > 31 || !(1..=18).contains(&burst_len) || data.is_empty() {
            return Err(Error::InvalidParam);
        }
        if self.dma_running(req) {
            return Err(Error::Busy);
        }

        self.regs
            .dcr()
            .write(|w| unsafe { w.dba().bits(base).dbl().bits(burst_len - 1) });
        let dst = dma::reg_addr(self.regs.dmar());
        self.start_request_dma(req, data.as_ptr() as u32, dst, data.len(), opt)
    }

    /// Stop a burst transfer, blocking until its DMA channel's aborted.
    pub fn dma_burst_stop(&mut self, req: DmaRequest) -> Result<()> {
        self.abort_request_dma(req, true)
    }

    /// Select the trigger output (TRGO) of a master timer.
    pub fn set_trigger_output(&mut self, mms: Mms) {
        let v = mms as u8;
        self.regs
            .cr2()
            .modify(|_, w| unsafe { w.mms().bits(v & 0b111).mms_3().bit(v >> 3 != 0) });
    }

    /// Configure this timer as a slave, driven by `trigger`.
    pub fn set_synchro_slave(&mut self, mode: SlaveMode, trigger: TriggerSel) -> Result<()> {
        check_state(self.state, &[TimerState::Idle])?;
        let sms = mode as u8;
        let ts = trigger as u8;
        self.regs.smcr().modify(|_, w| unsafe {
            w.sms().bits(sms & 0b111);
            w.sms_3().bit(sms >> 3 != 0);
            w.ts().bits(ts & 0b111);
            w.ts2().bits(ts >> 3)
        });
        Ok(())
    }

    /// Delay the trigger input, so master and slaves start in sync.
    pub fn enable_master_slave_mode(&mut self) {
        self.regs.smcr().modify(|_, w| w.msm().set_bit());
    }

    pub fn disable_master_slave_mode(&mut self) {
        self.regs.smcr().modify(|_, w| w.msm().clear_bit());
    }

    /// Generate events in software.
    pub fn generate_event(&mut self, events: EventMask) {
        self.regs.egr().write(|w| unsafe { w.bits(events.0 as u16) });
    }

    fn check_advanced(&self) -> Result<()> {
        if !self.device.is_advanced() {
            return Err(Error::InvalidParam);
        }
        Ok(())
    }

    /// Set the dead time inserted between complementary outputs. See the DTG field description
    /// in the RM for its encoding.
    pub fn set_deadtime(&mut self, dtg: u8) -> Result<()> {
        self.check_advanced()?;
        self.regs.bdtr().modify(|_, w| w.dtg().set(dtg));
        Ok(())
    }

    pub fn enable_main_output(&mut self) -> Result<()> {
        self.check_advanced()?;
        self.regs.bdtr().modify(|_, w| w.moe().set_bit());
        Ok(())
    }

    pub fn disable_main_output(&mut self) -> Result<()> {
        self.check_advanced()?;
        self.regs.bdtr().modify(|_, w| w.moe().clear_bit());
        Ok(())
    }

    /// Set MOE again at the next update event after a break clears.
    pub fn enable_automatic_output(&mut self) -> Result<()> {
        self.check_advanced()?;
        self.regs.bdtr().modify(|_, w| w.aoe().set_bit());
        Ok(())
    }

    pub fn break_enable_input(&mut self, input: BreakInput, polarity: BreakPolarity) -> Result<()> {
        self.check_advanced()?;
        let p = polarity == BreakPolarity::ActiveHigh;
        match input {
            BreakInput::Break1 => {
                self.regs
                    .bdtr()
                    .modify(|_, w| w.bke().set_bit().bkp().bit(p));
            }
            BreakInput::Break2 => {
                if !self.device.has_break2() {
                    return Err(Error::InvalidParam);
                }
                self.regs
                    .bdtr()
                    .modify(|_, w| w.bk2e().set_bit().bk2p().bit(p));
            }
        }
        Ok(())
    }

    pub fn break_disable_input(&mut self, input: BreakInput) -> Result<()> {
        self.check_advanced()?;
        match input {
            BreakInput::Break1 => {
                self.regs.bdtr().modify(|_, w| w.bke().clear_bit());
            }
            BreakInput::Break2 => {
                if !self.device.has_break2() {
                    return Err(Error::InvalidParam);
                }
                self.regs.bdtr().modify(|_, w| w.bk2e().clear_bit());
            }
        }
        Ok(())
    }

    /// Enable the break interrupt. It also covers break 2 and system break.
    pub fn enable_break_interrupt(&mut self) -> Result<()> {
        self.check_advanced()?;
        self.regs.dier().modify(|_, w| w.bie().set_bit());
        Ok(())
    }

    /// Enable the encoder interrupts: index, direction change, index error and transition
    /// error.
    pub fn enable_encoder_interrupts(&mut self) {
        self.regs.dier().modify(|_, w| {
            w.idxie()
                .set_bit()
                .dirie()
                .set_bit()
                .ierrie()
                .set_bit()
                .terrie()
                .set_bit()
        });
    }

    /// Handle timer interrupts. Run this in the timer's ISRs. Each enabled event that's
    /// pending is cleared, and its callback run: update, trigger, capture/compare channels,
    /// commutation, breaks, then encoder events.
    pub fn irq_handler(&mut self) {
        let sr = self.regs.sr().read();
        let dier = self.regs.dier().read();
        // Flags clear on writing 0; writing 1 leaves them as they are.

        if sr.uif().bit_is_set() && dier.uie().bit_is_set() {
            self.regs.sr().write(|w| w.uif().clear_bit());
            (self.callbacks.update)(self);
        }
        if sr.tif().bit_is_set() && dier.tie().bit_is_set() {
            self.regs.sr().write(|w| w.tif().clear_bit());
            (self.callbacks.trigger)(self);
        }

        for n in 0..4 {
            let ch = TimChannel::from_idx(n as usize);
            if sr.ccif(n).bit_is_set() && dier.ccie(n).bit_is_set() {
                self.regs.sr().write(|w| w.ccif(n).clear_bit());
                // CCxS selects whether the channel's an input.
                if self.read_ccmr(ch) & CCMR_CCS != 0 {
                    (self.callbacks.input_capture)(self, ch);
                } else {
                    (self.callbacks.compare_match)(self, ch);
                }
            }
        }
        // Channels 5 and 6 have no interrupt enable; they're checked with the others.
        let c5 = TimChannel::C5;
        if sr.cc5if().bit_is_set() && self.ch_state[c5.idx()] == ChannelState::OcActive {
            self.regs.sr().write(|w| w.cc5if().clear_bit());
            (self.callbacks.compare_match)(self, c5);
        }
        let c6 = TimChannel::C6;
        if sr.cc6if().bit_is_set() && self.ch_state[c6.idx()] == ChannelState::OcActive {
            self.regs.sr().write(|w| w.cc6if().clear_bit());
            (self.callbacks.compare_match)(self, c6);
        }

        if sr.comif().bit_is_set() && dier.comie().bit_is_set() {
            self.regs.sr().write(|w| w.comif().clear_bit());
            (self.callbacks.commutation)(self);
        }
        let bie = dier.bie().bit_is_set();
        if sr.bif().bit_is_set() && bie {
            self.regs.sr().write(|w| w.bif().clear_bit());
            (self.callbacks.break1)(self);
        }
        if sr.b2if().bit_is_set() && bie {
            self.regs.sr().write(|w| w.b2if().clear_bit());
            (self.callbacks.break2)(self);
        }
        if sr.sbif().bit_is_set() && bie {
            self.regs.sr().write(|w| w.sbif().clear_bit());
            (self.callbacks.system_break)(self);
        }
        if sr.idxf().bit_is_set() && dier.idxie().bit_is_set() {
            self.regs.sr().write(|w| w.idxf().clear_bit());
            (self.callbacks.encoder_index)(self);
        }
        if sr.dirf().bit_is_set() && dier.dirie().bit_is_set() {
            self.regs.sr().write(|w| w.dirf().clear_bit());
            (self.callbacks.direction_change)(self);
        }
        if sr.ierrf().bit_is_set() && dier.ierrie().bit_is_set() {
            self.regs.sr().write(|w| w.ierrf().clear_bit());
            (self.callbacks.index_error)(self);
        }
        if sr.terrf().bit_is_set() && dier.terrie().bit_is_set() {
            self.regs.sr().write(|w| w.terrf().clear_bit());
            (self.callbacks.transition_error)(self);
        }
    }

    /// Run this in the ISR of the DMA channel set for `req`.
    pub fn dma_irq_handler(&mut self, req: DmaRequest) {
        let Some(dma) = self.dma[req as usize].as_mut() else {
            return;
        };
        let circular = dma.is_circular();
        let Some(event) = dma.irq_handler() else {
            return;
        };

        match event {
            DmaEvent::Complete => {
                if !circular {
                    self.dma_finished(req);
                }
                self.dma_event(req, false);
            }
            DmaEvent::HalfComplete => self.dma_event(req, true),
            DmaEvent::Error(_) => {
                self.last_error_codes |= TimerError::Dma as u32;
                (self.callbacks.error)(self);
            }
            DmaEvent::Aborted => self.dma_stopped(req),
            DmaEvent::Suspended => (),
        }
    }

    /// A normal mode transfer finished: stop its requests, and return to idle.
    fn dma_finished(&mut self, req: DmaRequest) {
        self.set_request(req, false);
        match req {
            DmaRequest::Update => {
                if self.state == TimerState::Active {
                    self.state = TimerState::Idle;
                }
            }
            DmaRequest::Cc1 | DmaRequest::Cc2 | DmaRequest::Cc3 | DmaRequest::Cc4 => {
                let s = &mut self.ch_state[req as usize - 1];
                *s = match *s {
                    ChannelState::OcActive => ChannelState::OcIdle,
                    ChannelState::IcActive => ChannelState::IcIdle,
                    other => other,
                };
            }
            _ => (),
        }
    }

    fn dma_event(&mut self, req: DmaRequest, half: bool) {
        let cbs = &self.callbacks;
        match req {
            DmaRequest::Update => {
                let cb = if half { cbs.update_half } else { cbs.update };
                cb(self);
            }
            DmaRequest::Trigger => {
                let cb = if half { cbs.trigger_half } else { cbs.trigger };
                cb(self);
            }
            DmaRequest::Commutation => {
                let cb = if half { cbs.commutation_half } else { cbs.commutation };
                cb(self);
            }
            _ => {
                let ch = TimChannel::from_idx(req as usize - 1);
                let cb = match (self.ch_state[ch.idx()].is_input(), half) {
                    (true, false) => cbs.input_capture,
                    (true, true) => cbs.input_capture_half,
                    (false, false) => cbs.compare_match,
                    (false, true) => cbs.compare_match_half,
                };
                cb(self, ch);
            }
        }
    }

    callback_setters!(
        error: (),
        stop: (),
        channel_stop: (TimChannel),
        update: (),
        update_half: (),
        trigger: (),
        trigger_half: (),
        input_capture: (TimChannel),
        input_capture_half: (TimChannel),
        compare_match: (TimChannel),
        compare_match_half: (TimChannel),
        commutation: (),
        commutation_half: (),
        break1: (),
        break2: (),
        system_break: (),
        encoder_index: (),
        direction_change: (),
        index_error: (),
        transition_error: (),
    );

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn channel_state(&self, ch: TimChannel) -> ChannelState {
        self.ch_state[ch.idx()]
    }

    /// A bitmask of `TimerError` values.
    pub fn last_error_codes(&self) -> u32 {
        self.last_error_codes
    }

    /// The timer's kernel clock, in Hz.
    pub fn clock_freq(&self) -> u32 {
        self.clock_speed
    }

    /// The auto-reload value. This is the maximum duty, in PWM modes.
    pub fn period(&self) -> u32 {
        self.regs.arr().read().bits()
    }

    pub fn prescaler(&self) -> u16 {
        self.regs.psc().read().psc().bits()
    }

    pub fn device(&self) -> TimerDevice {
        self.device
    }
}

macro_rules! hal {
    ($tim:ident, $TIM:ident, $Dev:ident) => {
        impl Timer<TimRegs> {
            paste! {
                #[doc = "Initialize " $TIM ". See `new`."]
                pub fn [<new_ $tim>](
                    regs: pac::$TIM,
                    cfg: &TimerConfig,
                    clock_speed: u32,
                    rcc: &pac::rcc::RegisterBlock,
                ) -> Result<Self> {
                    let ptr: *const _ = &*regs;
                    Self::new(TimRegs(ptr.cast()), TimerDevice::$Dev, cfg, clock_speed, rcc)
                }
            }
        }
    };
}

hal!(tim1, TIM1, Tim1);
hal!(tim2, TIM2, Tim2);
hal!(tim3, TIM3, Tim3);
hal!(tim4, TIM4, Tim4);
hal!(tim5, TIM5, Tim5);
hal!(tim6, TIM6, Tim6);
hal!(tim7, TIM7, Tim7);
hal!(tim8, TIM8, Tim8);
hal!(tim15, TIM15, Tim15);
hal!(tim16, TIM16, Tim16);
hal!(tim17, TIM17, Tim17);

/// Calculate values required to set the timer frequency: `PSC` and `ARR`. This can be
/// used for initial timer setup, or changing the value later.
fn calc_freq_vals(freq: f32, clock_speed: u32) -> Result<(u16, u16)> {
    // `freq` and `clock_speed` are both in Hz.
    // (PSC+1)*(ARR+1) = TIMclk/Updatefrequency

    // There are many solutions; this one sets PSC and ARR equal to each other. It's
    // computationally easy, and doesn't limit the maximum period. There will usually be
    // solutions that have a smaller rounding error.
    if freq <= 0. {
        return Err(TimerError::ValueError.into());
    }

    let max_val = 65_535.;
    let rhs = clock_speed as f32 / freq;

    let arr = Float::round(Float::sqrt(rhs)) - 1.;
    if !(0. ..=max_val).contains(&arr) {
        return Err(TimerError::ValueError.into());
    }

    Ok((arr as u16, arr as u16))
}

#[cfg(feature = "embedded_hal")]
mod embedded_hal_impl {
    use embedded_hal::pwm::{ErrorType, SetDutyCycle};

    use super::*;

    /// One output compare channel of a timer, as a PWM output. Configure and start the channel
    /// first, in a PWM mode.
    pub struct PwmChannel<'a, R> {
        timer: &'a mut Timer<R>,
        channel: TimChannel,
    }

    impl<R> Timer<R>
    where
        R: Deref<Target = pac::tim1::RegisterBlock>,
    {
        pub fn pwm_channel(&mut self, channel: TimChannel) -> Result<PwmChannel<'_, R>> {
            self.check_channel(channel)?;
            Ok(PwmChannel {
                timer: self,
                channel,
            })
        }
    }

    impl<R> ErrorType for PwmChannel<'_, R> {
        type Error = crate::error::Error;
    }

    impl<R> SetDutyCycle for PwmChannel<'_, R>
    where
        R: Deref<Target = pac::tim1::RegisterBlock>,
    {
        fn max_duty_cycle(&self) -> u16 {
            self.timer.period().min(u16::MAX as u32) as u16
        }

        fn set_duty_cycle(&mut self, duty: u16) -> core::result::Result<(), Self::Error> {
            self.timer.oc_set_pulse(self.channel, duty as u32)
        }
    }
}

#[cfg(feature = "embedded_hal")]
pub use embedded_hal_impl::PwmChannel;

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::{
        dma::{ChannelCfg, DataWidth, Direction, DmaInput, DmaMode, SUSPF, TCF, tests::fake_channel},
        util::{fake, peek, poke},
    };

    type Regs = &'static pac::tim1::RegisterBlock;
    type GpdmaRegs = &'static pac::gpdma1::RegisterBlock;

    fn setup(device: TimerDevice, cfg: &TimerConfig) -> (Regs, Timer<Regs>) {
        let regs: Regs = fake();
        let timer = Timer::new(regs, device, cfg, 16_000_000, fake()).unwrap();
        assert_eq!(timer.state(), TimerState::Idle);
        (regs, timer)
    }

    fn with_dma(
        timer: &mut Timer<Regs>,
        req: DmaRequest,
        request: DmaInput,
        direction: Direction,
        mode: DmaMode,
    ) -> GpdmaRegs {
        let (dma_regs, ch) = fake_channel(
            1,
            &ChannelCfg {
                request,
                direction,
                src_width: DataWidth::Bits32,
                dst_width: DataWidth::Bits32,
                src_incr: direction == Direction::MemToPeriph,
                dst_incr: direction == Direction::PeriphToMem,
                mode,
                ..Default::default()
            },
        );
        timer.set_dma(req, ch).unwrap();
        dma_regs
    }

    #[test]
    fn time_base_is_written_and_loaded() {
        let regs: Regs = fake();
        let rcc: &pac::rcc::RegisterBlock = fake();
        let cfg = TimerConfig {
            prescaler: 15,
            period: 999,
            counter_mode: CounterMode::CenterUpDown,
            clock_division: ClockDivision::Div4,
            repetition_counter: 3,
            auto_reload_preload: true,
        };
        let timer = Timer::new(regs, TimerDevice::Tim1, &cfg, 16_000_000, rcc).unwrap();

        assert!(rcc.apb2enr().read().tim1en().bit_is_set());
        assert_eq!(regs.psc().read().bits(), 15);
        assert_eq!(regs.arr().read().bits(), 999);
        assert_eq!(regs.rcr().read().bits(), 3);
        assert_eq!(regs.cr1().read().cms().bits(), 0b11);
        assert_eq!(regs.cr1().read().ckd().bits(), 0b10);
        assert!(regs.cr1().read().arpe().bit_is_set());
        assert_eq!(peek(regs.egr()) & 1, 1);
        assert!(regs.sr().read().uif().bit_is_clear());
        assert_eq!(timer.period(), 999);
        assert_eq!(timer.prescaler(), 15);
        assert_eq!(timer.clock_freq(), 16_000_000);
    }

    #[test]
    fn period_width_and_repetition_checks() {
        let regs: Regs = fake();
        let cfg = TimerConfig {
            period: 0x1_0000,
            ..Default::default()
        };
        assert!(Timer::new(regs, TimerDevice::Tim3, &cfg, 1, fake()).is_ok());
        assert!(Timer::new(regs, TimerDevice::Tim16, &cfg, 1, fake()).is_err());

        let (_regs, mut timer) = setup(TimerDevice::Tim6, &TimerConfig::default());
        assert_eq!(timer.set_repetition_counter(2), Err(Error::InvalidParam));
        assert_eq!(timer.set_period(0x1_0000), Err(Error::InvalidParam));
        assert_eq!(
            timer.oc_start_channel(TimChannel::C1),
            Err(Error::InvalidParam)
        );
    }

    #[test]
    fn frequency_split() {
        assert_eq!(calc_freq_vals(1_000., 16_000_000), Ok((125, 125)));
        assert_eq!(
            calc_freq_vals(0.001, 16_000_000),
            Err(Error::TimerError(TimerError::ValueError))
        );
        assert_eq!(
            calc_freq_vals(0., 16_000_000),
            Err(Error::TimerError(TimerError::ValueError))
        );

        let (regs, mut timer) = setup(TimerDevice::Tim2, &TimerConfig::default());
        timer.set_freq(1_000.).unwrap();
        assert_eq!(regs.arr().read().bits(), 125);
        assert_eq!(regs.psc().read().bits(), 125);
    }

    #[test]
    fn ccer_enable_masks() {
        assert_eq!(CCER_CCXE, 0x11_1111);
        // Channels 5 and 6 have no complementary output.
        assert_eq!(CCER_CCXNE, 0x4444);

        let (regs, mut timer) = setup(TimerDevice::Tim1, &TimerConfig::default());
        // A complementary output left on keeps the main output enabled.
        poke(regs.ccer(), 1 << 6);
        timer
            .oc_set_config_channel(TimChannel::C1, &OcConfig::default())
            .unwrap();
        timer.oc_start_channel(TimChannel::C1).unwrap();
        timer.oc_stop_channel(TimChannel::C1).unwrap();
        assert!(regs.bdtr().read().moe().bit_is_set());
    }

    #[test]
    fn controls() {
        let (regs, mut timer) = setup(TimerDevice::Tim2, &TimerConfig::default());

        timer.set_counter_mode(CounterMode::Down).unwrap();
        assert!(regs.cr1().read().dir().bit_is_set());
        timer.disable_update_generation();
        assert!(regs.cr1().read().udis().bit_is_set());
        timer.enable_update_generation();
        assert!(regs.cr1().read().udis().bit_is_clear());
        timer.set_update_source(UpdateSource::CounterOnly);
        assert!(regs.cr1().read().urs().bit_is_set());
        timer.enable_one_pulse_mode();
        assert!(regs.cr1().read().opm().bit_is_set());
        timer.set_counter(42);
        assert_eq!(timer.counter(), 42);

        timer.generate_event(EventMask::UPDATE | EventMask::CC2);
        assert_eq!(peek(regs.egr()), 0b101);
    }

    #[test]
    fn start_stop_and_update_interrupt() {
        static UPDATES: AtomicU32 = AtomicU32::new(0);

        let (regs, mut timer) = setup(TimerDevice::Tim6, &TimerConfig::default());
        timer.register_update_callback(|_| {
            UPDATES.fetch_add(1, Ordering::Relaxed);
        });

        timer.start().unwrap();
        assert!(regs.cr1().read().cen().bit_is_set());
        assert_eq!(timer.start(), Err(Error::Busy));
        timer.stop().unwrap();
        assert!(regs.cr1().read().cen().bit_is_clear());

        timer.start_it().unwrap();
        assert!(regs.dier().read().uie().bit_is_set());
        poke(regs.sr(), 1 << 0);
        timer.irq_handler();
        assert_eq!(UPDATES.load(Ordering::Relaxed), 1);
        assert!(regs.sr().read().uif().bit_is_clear());

        timer.stop_it().unwrap();
        assert!(regs.dier().read().uie().bit_is_clear());
        assert_eq!(timer.state(), TimerState::Idle);
    }

    #[test]
    fn irq_handles_every_pending_source_in_order() {
        static ORDER: AtomicU32 = AtomicU32::new(0);

        let (regs, mut timer) = setup(TimerDevice::Tim1, &TimerConfig::default());
        // Record the call order as decimal digits.
        timer.register_update_callback(|_| {
            ORDER.store(ORDER.load(Ordering::Relaxed) * 10 + 1, Ordering::Relaxed);
        });
        timer.register_trigger_callback(|_| {
            ORDER.store(ORDER.load(Ordering::Relaxed) * 10 + 2, Ordering::Relaxed);
        });
        timer.register_break1_callback(|_| {
            ORDER.store(ORDER.load(Ordering::Relaxed) * 10 + 3, Ordering::Relaxed);
        });

        // UIE, TIE and BIE.
        poke(regs.dier(), (1 << 0) | (1 << 6) | (1 << 7));
        // UIF, COMIF, TIF and BIF. COMIF isn't enabled.
        poke(regs.sr(), (1 << 0) | (1 << 5) | (1 << 6) | (1 << 7));
        timer.irq_handler();

        assert_eq!(ORDER.load(Ordering::Relaxed), 123);
        // Flag writes leave the other flags untouched.
        let sr = regs.sr().read();
        assert!(sr.bif().bit_is_clear());
        assert!(sr.comif().bit_is_set());
    }

    #[test]
    fn output_compare_channels() {
        static MATCHES: AtomicU32 = AtomicU32::new(0);

        let (regs, mut timer) = setup(TimerDevice::Tim1, &TimerConfig::default());
        timer.register_compare_match_callback(|_, ch| {
            MATCHES.fetch_add(ch.idx() as u32 + 1, Ordering::Relaxed);
        });

        let cfg = OcConfig {
            mode: OutputCompare::AsymmetricPwm1,
            pulse: 300,
            polarity: Polarity::ActiveLow,
            idle_state: IdleState::Set,
            preload: true,
            fast: false,
        };
        timer.oc_set_config_channel(TimChannel::C2, &cfg).unwrap();
        assert_eq!(timer.channel_state(TimChannel::C2), ChannelState::OcIdle);

        // Channel 2 is the upper half of CCMR1.
        let ccmr1 = peek(regs.ccmr1_output());
        assert_eq!((ccmr1 >> 12) & 0b111, 0b110);
        assert_eq!((ccmr1 >> 24) & 1, 1);
        assert_eq!((ccmr1 >> 11) & 1, 1);
        assert_eq!(regs.ccr(1).read().bits(), 300);
        assert!(regs.ccer().read().ccp(1).bit_is_set());
        assert!(regs.cr2().read().ois(1).bit_is_set());

        timer.oc_start_channel_it(TimChannel::C2).unwrap();
        assert!(regs.ccer().read().cce(1).bit_is_set());
        assert!(regs.bdtr().read().moe().bit_is_set());
        assert!(regs.dier().read().ccie(1).bit_is_set());

        // CC2IF
        poke(regs.sr(), 1 << 2);
        timer.irq_handler();
        assert_eq!(MATCHES.load(Ordering::Relaxed), 2);

        timer.oc_set_pulse(TimChannel::C2, 500).unwrap();
        assert_eq!(regs.ccr(1).read().bits(), 500);
        assert_eq!(
            timer.oc_set_config_channel(TimChannel::C2, &cfg),
            Err(Error::Busy)
        );

        timer.oc_stop_channel_it(TimChannel::C2).unwrap();
        assert!(regs.bdtr().read().moe().bit_is_clear());
        assert!(regs.dier().read().ccie(1).bit_is_clear());
    }

    #[test]
    fn channel_5_uses_ccmr3() {
        let (regs, mut timer) = setup(TimerDevice::Tim8, &TimerConfig::default());
        timer
            .oc_set_config_channel(TimChannel::C5, &OcConfig::default())
            .unwrap();
        assert_eq!(
            (peek(regs.ccmr3_output()) >> 4) & 0b111,
            OutputCompare::Pwm1 as u32
        );
        assert_eq!(
            timer.oc_start_channel_it(TimChannel::C5),
            Err(Error::InvalidParam)
        );
        timer.oc_start_channel(TimChannel::C5).unwrap();
        assert!(regs.ccer().read().cce(4).bit_is_set());
    }

    #[test]
    fn input_capture() {
        static CAPTURES: AtomicU32 = AtomicU32::new(0);

        let (regs, mut timer) = setup(TimerDevice::Tim2, &TimerConfig::default());
        timer.register_input_capture_callback(|t, ch| {
            let v = t.ic_read_captured_value(ch).unwrap();
            CAPTURES.store(v, Ordering::Relaxed);
        });

        let cfg = IcConfig {
            polarity: IcPolarity::Both,
            selection: IcSelection::Direct,
            prescaler: IcPrescaler::Div4,
            filter: 3,
        };
        timer.ic_set_config_channel(TimChannel::C3, &cfg).unwrap();
        let ccmr2 = peek(regs.ccmr2_output());
        assert_eq!(ccmr2 & CCMR_CCS, 0b01);
        assert_eq!((ccmr2 & CCMR_ICPSC) >> 2, 0b10);
        assert_eq!((ccmr2 & CCMR_ICF) >> 4, 3);
        let ccer = regs.ccer().read();
        assert!(ccer.ccp(2).bit_is_set() && ccer.ccnp(2).bit_is_set());
        assert_eq!(
            timer.ic_set_config_channel(TimChannel::C5, &cfg),
            Err(Error::InvalidParam)
        );

        timer.ic_start_channel_it(TimChannel::C3).unwrap();
        poke(regs.ccr(2), 1234);
        // CC3IF
        poke(regs.sr(), 1 << 3);
        timer.irq_handler();
        assert_eq!(CAPTURES.load(Ordering::Relaxed), 1234);

        timer.ic_stop_channel_it(TimChannel::C3).unwrap();
        assert_eq!(timer.channel_state(TimChannel::C3), ChannelState::IcIdle);
    }

    #[test]
    fn update_dma_and_stop() {
        static UPDATES: AtomicU32 = AtomicU32::new(0);
        static STOPS: AtomicU32 = AtomicU32::new(0);

        let (regs, mut timer) = setup(TimerDevice::Tim2, &TimerConfig::default());
        let dma_regs = with_dma(
            &mut timer,
            DmaRequest::Update,
            DmaInput::Tim2Up,
            Direction::MemToPeriph,
            DmaMode::Circular,
        );
        timer.register_update_callback(|_| {
            UPDATES.fetch_add(1, Ordering::Relaxed);
        });
        timer.register_stop_callback(|_| {
            STOPS.fetch_add(1, Ordering::Relaxed);
        });

        let periods = [100u32, 200, 300, 400];
        unsafe { timer.start_dma(&periods, DmaOptIt::None).unwrap() };
        assert_eq!(timer.state(), TimerState::Active);
        assert!(regs.dier().read().ude().bit_is_set());
        assert!(regs.cr1().read().cen().bit_is_set());
        assert_eq!(
            dma_regs.ch(1).dar().read().bits(),
            dma::reg_addr(regs.arr())
        );

        poke(dma_regs.ch(1).sr(), TCF);
        timer.dma_irq_handler(DmaRequest::Update);
        assert_eq!(UPDATES.load(Ordering::Relaxed), 1);
        // Circular: still running.
        assert_eq!(timer.state(), TimerState::Active);

        timer.stop_dma().unwrap();
        assert_eq!(timer.state(), TimerState::Idle);
        assert!(regs.dier().read().ude().bit_is_clear());
        assert!(regs.cr1().read().cen().bit_is_clear());
        assert_eq!(STOPS.load(Ordering::Relaxed), 0);

        poke(dma_regs.ch(1).sr(), SUSPF);
        timer.dma_irq_handler(DmaRequest::Update);
        assert_eq!(STOPS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn silent_channel_dma_stops_blocking() {
        static STOPPED: AtomicU32 = AtomicU32::new(0);

        let (regs, mut timer) = setup(TimerDevice::Tim3, &TimerConfig::default());
        let dma_regs = with_dma(
            &mut timer,
            DmaRequest::Cc1,
            DmaInput::Tim3Ch1,
            Direction::MemToPeriph,
            DmaMode::Circular,
        );
        timer.register_channel_stop_callback(|_, ch| {
            STOPPED.store(ch.idx() as u32 + 1, Ordering::Relaxed);
        });

        timer
            .oc_set_config_channel(TimChannel::C1, &OcConfig::default())
            .unwrap();
        let pulses = [10u32, 20];
        unsafe {
            timer
                .oc_start_channel_dma(TimChannel::C1, &pulses, DmaOptIt::Silent)
                .unwrap()
        };
        assert_eq!(
            timer.channel_state(TimChannel::C1),
            ChannelState::OcActiveSilent
        );
        assert!(regs.dier().read().ccde(0).bit_is_set());
        assert_eq!(
            dma_regs.ch(1).dar().read().bits(),
            dma::reg_addr(regs.ccr(0))
        );

        poke(dma_regs.ch(1).sr(), SUSPF);
        timer.oc_stop_channel_dma(TimChannel::C1).unwrap();
        assert_eq!(timer.channel_state(TimChannel::C1), ChannelState::OcIdle);
        assert!(regs.dier().read().ccde(0).bit_is_clear());
        assert_eq!(STOPPED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn capture_dma_completes_to_idle() {
        static CAPTURES: AtomicU32 = AtomicU32::new(0);

        let (regs, mut timer) = setup(TimerDevice::Tim4, &TimerConfig::default());
        let dma_regs = with_dma(
            &mut timer,
            DmaRequest::Cc2,
            DmaInput::Tim4Ch2,
            Direction::PeriphToMem,
            DmaMode::Normal,
        );
        timer.register_input_capture_callback(|_, ch| {
            CAPTURES.store(ch.idx() as u32 + 1, Ordering::Relaxed);
        });

        timer
            .ic_set_config_channel(TimChannel::C2, &IcConfig::default())
            .unwrap();
        let mut buf = [0u32; 8];
        unsafe {
            timer
                .ic_start_channel_dma(TimChannel::C2, &mut buf, DmaOptIt::None)
                .unwrap()
        };
        assert_eq!(
            dma_regs.ch(1).sar().read().bits(),
            dma::reg_addr(regs.ccr(1))
        );

        poke(dma_regs.ch(1).sr(), TCF);
        timer.dma_irq_handler(DmaRequest::Cc2);
        assert_eq!(CAPTURES.load(Ordering::Relaxed), 2);
        assert_eq!(timer.channel_state(TimChannel::C2), ChannelState::IcIdle);
        assert!(regs.dier().read().ccde(1).bit_is_clear());
    }

    #[test]
    fn master_slave_and_break() {
        let (regs, mut timer) = setup(TimerDevice::Tim1, &TimerConfig::default());

        timer.set_trigger_output(Mms::EncoderClock);
        let cr2 = regs.cr2().read();
        assert_eq!(cr2.mms().bits(), 0);
        assert!(cr2.mms_3().bit_is_set());

        timer
            .set_synchro_slave(SlaveMode::CombinedGatedReset, TriggerSel::Itr8)
            .unwrap();
        let smcr = regs.smcr().read();
        assert_eq!(smcr.sms().bits(), 0b001);
        assert!(smcr.sms_3().bit_is_set());
        assert_eq!(smcr.ts().bits(), 0b100);
        assert_eq!(smcr.ts2().bits(), 0b01);
        timer.enable_master_slave_mode();
        assert!(regs.smcr().read().msm().bit_is_set());

        timer.set_deadtime(0x40).unwrap();
        assert_eq!(regs.bdtr().read().dtg().bits(), 0x40);
        timer
            .break_enable_input(BreakInput::Break2, BreakPolarity::ActiveHigh)
            .unwrap();
        let bdtr = regs.bdtr().read();
        assert!(bdtr.bk2e().bit_is_set() && bdtr.bk2p().bit_is_set());
        timer.enable_automatic_output().unwrap();
        assert!(regs.bdtr().read().aoe().bit_is_set());

        let (_regs, mut tim15) = setup(TimerDevice::Tim15, &TimerConfig::default());
        assert_eq!(
            tim15.break_enable_input(BreakInput::Break2, BreakPolarity::ActiveLow),
            Err(Error::InvalidParam)
        );
        assert!(tim15.break_enable_input(BreakInput::Break1, BreakPolarity::ActiveLow).is_ok());

        let (_regs, mut tim2) = setup(TimerDevice::Tim2, &TimerConfig::default());
        assert_eq!(tim2.enable_main_output(), Err(Error::InvalidParam));
    }

    #[cfg(feature = "embedded_hal")]
    #[test]
    fn pwm_duty_cycle() {
        use embedded_hal::pwm::SetDutyCycle;

        let (regs, mut timer) = setup(
            TimerDevice::Tim3,
            &TimerConfig {
                period: 1_000,
                ..Default::default()
            },
        );
        timer
            .oc_set_config_channel(TimChannel::C4, &OcConfig::default())
            .unwrap();
        let mut pwm = timer.pwm_channel(TimChannel::C4).unwrap();
        assert_eq!(pwm.max_duty_cycle(), 1_000);
        pwm.set_duty_cycle_percent(25).unwrap();
        assert_eq!(regs.ccr(3).read().bits(), 250);
    }
}
