//! Serial audio interface (SAI) support. Each `Sai` handle drives one audio sub-block (A or B)
//! of SAI1 or SAI2, as a transmitter or receiver.
//!
//! Transfers are blocking, interrupt-driven, or use a GPDMA1 channel. Samples are passed as byte
//! slices: 1 byte per sample for 8-bit data without companding, 2 bytes (little endian) for
//! sizes up to 16 bits, and 4 bytes otherwise.

use core::ops::Deref;

use crate::{
    dma::{self, DmaChannel, DmaEvent, DmaOptIt, DmaState},
    error::{Error, Result},
    pac::{
        self,
        sai1::{ACLRFR, ACR1, ACR2, ADR, AFRCR, AIM, ASLOTR, ASR},
    },
    tick,
    util::{XferBuf, check_state, check_update_state, rcc_en_reset},
};

/// Time for the block to disable, in ms.
pub const DEFAULT_TIMEOUT: u32 = 4;
/// Time for the FIFO to receive its first DMA data, in ms.
pub const LONG_TIMEOUT: u32 = 1_000;

const SPDIF_FRAME_LEN: u32 = 64;
const AC97_FRAME_LEN: u32 = 256;
const AC97_NUM_SLOTS: u8 = 13;

/// Left and right delay fields of one microphone pair, in PDMDLY.
const PDM_DELAY_MASK: u32 = 0x77;
const PDM_DELAY_OFFSET: u32 = 8;
const PDM_RIGHT_DELAY_OFFSET: u32 = 4;

// Interrupt bits, shared by IM, SR and CLRFR.
const OVRUDR: u32 = 1 << 0;
const MUTEDET: u32 = 1 << 1;
const WCKCFG: u32 = 1 << 2;
const FREQ: u32 = 1 << 3;
const CNRDY: u32 = 1 << 4;
const AFSDET: u32 = 1 << 5;
const LFSDET: u32 = 1 << 6;
const INT_ALL: u32 = 0x7F;

// FLVL values.
const FLVL_EMPTY: u8 = 0;
const FLVL_FULL: u8 = 5;

/// Offset of sub-block B's registers from sub-block A's.
const BLOCK_B_OFFSET: usize = 0x20;

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u32)]
/// SAI errors. The discriminants are the bits used in `last_error_codes`.
pub enum SaiError {
    /// A receiver got data while its FIFO was full.
    Overrun = 1 << 0,
    /// A transmitter's FIFO was empty when data was due.
    Underrun = 1 << 1,
    /// Anticipated frame synchronization detected. (Slave only)
    AfsDet = 1 << 2,
    /// Late frame synchronization detected. (Slave only)
    LfsDet = 1 << 3,
    /// AC'97 codec not ready.
    CnReady = 1 << 4,
    /// Wrong clock configuration.
    WckCfg = 1 << 5,
    Timeout = 1 << 6,
    Dma = 1 << 7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum SaiState {
    Reset,
    Init,
    Idle,
    TxActive,
    RxActive,
    TxPaused,
    RxPaused,
    Abort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Select which SAI device we're using. Used for RCC setup.
pub enum SaiDevice {
    One,
    #[cfg(sai2)]
    Two,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(usize)]
/// An audio sub-block. Each SAI has two, which can run independently, or share clocks.
pub enum SubBlock {
    A = 0,
    B = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// Specify the SAI mode. Sets xCR1 register, MODE field.
pub enum SaiMode {
    MasterTransmitter = 0b00,
    MasterReceiver = 0b01,
    SlaveTransmitter = 0b10,
    SlaveReceiver = 0b11,
}

impl SaiMode {
    pub fn is_rx(&self) -> bool {
        matches!(self, Self::MasterReceiver | Self::SlaveReceiver)
    }

    pub fn is_slave(&self) -> bool {
        matches!(self, Self::SlaveTransmitter | Self::SlaveReceiver)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// Specify the SAI protocol. Sets xCR1 register, PRTCFG field.
pub enum Protocol {
    /// Free protocol. Free protocol allows to use the powerful configuration of the audio block to
    /// address a specific audio protocol (such as I2S, LSB/MSB justified, TDM, PCM/DSP...) by setting
    /// most of the configuration register bits as well as frame configuration register.
    Free = 0b00,
    /// SPDIF protocol. Data size is 24 bits, with a 64-bit stereo frame.
    Spdif = 0b01,
    /// AC'97 protocol. 256-bit frames of 13 slots.
    Ac97 = 0b10,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// Specify the data size. Sets xCR1 register, DS field.
pub enum DataSize {
    /// 8 bits
    S8 = 0b010,
    /// 10 bits
    S10 = 0b011,
    /// 16 bits
    S16 = 0b100,
    /// 20 bits
    S20 = 0b101,
    /// 24 bits
    S24 = 0b110,
    /// 32 bits
    S32 = 0b111,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// The SCK edge data is sampled on. Transmitters drive data on the opposite edge.
pub enum ClockStrobe {
    FallingEdge,
    RisingEdge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// Set Audio sub-block synchronization. Sets xCR1 register, SYNCEN field.
pub enum SyncMode {
    /// Audio sub-block in asynchronous mode
    Async = 0b00,
    /// Audio sub-block is synchronous with the other internal audio sub-block. In this case, the audio
    /// sub-block must be configured in slave mode
    Internal = 0b01,
    /// Audio subblock is synchronous with an external SAI embedded peripheral. In this case the audio
    /// subblock should be configured in Slave mode.
    External = 0b10,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// Select mono or stereo mode. Sets xCR1 register, MONO field.
pub enum Mono {
    Stereo = 0,
    Mono = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// FIFO level at which the FREQ flag asserts. Sets xCR2 register, FTH field.
pub enum FifoThreshold {
    Empty = 0,
    Quarter = 1,
    Half = 2,
    ThreeQuarter = 3,
    Full = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Companding, for 8-bit telecom data. Sets xCR2 register, COMP and CPL fields.
pub enum Companding {
    None,
    /// µ-law, 1's complement
    ULaw,
    /// A-law, 1's complement
    ALaw,
    ULawTwosComplement,
    ALawTwosComplement,
}

impl Companding {
    /// COMP and CPL values.
    fn bits(&self) -> (u8, bool) {
        match self {
            Self::None => (0b00, false),
            Self::ULaw => (0b10, false),
            Self::ALaw => (0b11, false),
            Self::ULawTwosComplement => (0b10, true),
            Self::ALawTwosComplement => (0b11, true),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u32)]
/// Audio sampling frequency. With `MclkDiv`, the `mclk_div` config value is used directly;
/// otherwise the master clock divider is computed from the kernel clock.
pub enum AudioFrequency {
    MclkDiv = 0,
    F8k = 8_000,
    F11k = 11_025,
    F16k = 16_000,
    F22k = 22_050,
    F32k = 32_000,
    F44k = 44_100,
    F48k = 48_000,
    F96k = 96_000,
    F192k = 192_000,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Frame synchronization definition. Sets xFRCR register, FSDEF field.
pub enum FsSignal {
    /// FS is a start of frame signal.
    StartFrame,
    /// FS is a start of frame signal, and a channel side identification. (eg I2S)
    ChannelIdentification,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum FsPolarity {
    ActiveLow,
    ActiveHigh,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum FsOffset {
    /// FS is asserted on the first bit of slot 0.
    FirstBit,
    /// FS is asserted one bit before the first bit of slot 0.
    BeforeFirstBit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum SlotSize {
    /// Slot size is equivalent to the data size.
    DataSize = 0,
    S16 = 1,
    S32 = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct FrameCfg {
    /// Frame length, in bits: 8 to 256. For a master with MCKDIV in use, a power of 2.
    pub length: u16,
    /// Number of bits FS is active for: 1 to 128.
    pub active_length: u8,
    pub fs_definition: FsSignal,
    pub fs_polarity: FsPolarity,
    pub fs_offset: FsOffset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct SlotCfg {
    /// Position of the first data bit in each slot: 0 to 24.
    pub first_bit_offset: u8,
    pub size: SlotSize,
    /// 1 to 16.
    pub num_slots: u8,
    /// One bit per slot; set bits are active.
    pub active_slots: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Configuration of an audio sub-block. The default is an I2S-style 16-bit stereo master
/// transmitter, at 48kHz.
pub struct SaiConfig {
    pub mode: SaiMode,
    pub protocol: Protocol,
    pub data_size: DataSize,
    pub bit_order: BitOrder,
    pub clock_strobe: ClockStrobe,
    /// An audio subblock can be configured to operate synchronously with the second audio
    /// subblock in the same SAI. In this case, the bit clock and the frame synchronization signals
    /// are shared to reduce the number of external pins used for the communication.
    pub sync: SyncMode,
    pub mono: Mono,
    /// Drive the audio block outputs as soon as the configuration is written, instead of on
    /// enable.
    pub output_drive: bool,
    pub fifo_threshold: FifoThreshold,
    pub companding: Companding,
    pub audio_frequency: AudioFrequency,
    /// Master clock divider, 0 to 63. Used directly with `AudioFrequency::MclkDiv`.
    pub mclk_div: u8,
    /// Disable the master clock divider. (NODIV) The bit clock is then the kernel clock divided
    /// by MCKDIV.
    pub nodiv: bool,
    /// Output the master clock on MCLK. (MCKEN)
    pub mcken: bool,
    /// Master clock oversampling: MCLK is 512 × FS instead of 256 × FS. (OSR)
    pub oversampling: bool,
    /// SAI kernel clock speed, in Hz.
    pub kernel_clk: u32,
    pub frame: FrameCfg,
    pub slot: SlotCfg,
}

impl Default for SaiConfig {
    fn default() -> Self {
        Self {
            mode: SaiMode::MasterTransmitter,
            protocol: Protocol::Free,
            data_size: DataSize::S16,
            bit_order: BitOrder::MsbFirst,
            clock_strobe: ClockStrobe::FallingEdge,
            sync: SyncMode::Async,
            mono: Mono::Stereo,
            output_drive: false,
            fifo_threshold: FifoThreshold::Empty,
            companding: Companding::None,
            audio_frequency: AudioFrequency::F48k,
            mclk_div: 0,
            nodiv: false,
            mcken: false,
            oversampling: false,
            kernel_clk: 12_288_000,
            frame: FrameCfg {
                length: 32,
                active_length: 16,
                fs_definition: FsSignal::ChannelIdentification,
                fs_polarity: FsPolarity::ActiveLow,
                fs_offset: FsOffset::BeforeFirstBit,
            },
            slot: SlotCfg {
                first_bit_offset: 0,
                size: SlotSize::DataSize,
                num_slots: 2,
                active_slots: 0b11,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// Which sub-block exports its sync signals to the other SAI. Sets GCR register, SYNCOUT field.
pub enum SyncOut {
    Disabled = 0,
    BlockA = 1,
    BlockB = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// What a muted transmitter sends.
pub enum MuteValue {
    Zero,
    LastValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// PDM bitstream clock outputs.
pub enum PdmClocks {
    None,
    Clock1,
    Clock2,
    Both,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Delay lines for one microphone pair, in bitstream clock periods: 0 to 7 each.
pub struct PdmDelay {
    pub left: u8,
    pub right: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// FIFO fill level. (SR FLVL)
pub enum FifoLevel {
    Empty,
    /// Up to a quarter full.
    Quarter1,
    Quarter2,
    Quarter3,
    /// More than 3/4 full, but not full.
    Quarter4,
    Full,
}

/// Handlers run on transfer events. They default to doing nothing.
pub struct SaiCallbacks<R> {
    pub tx_cplt: fn(&mut Sai<R>),
    pub tx_half_cplt: fn(&mut Sai<R>),
    pub rx_cplt: fn(&mut Sai<R>),
    pub rx_half_cplt: fn(&mut Sai<R>),
    /// Rx mute detected.
    pub mute: fn(&mut Sai<R>),
    pub abort_cplt: fn(&mut Sai<R>),
    pub error: fn(&mut Sai<R>),
}

impl<R> Default for SaiCallbacks<R> {
    fn default() -> Self {
        Self {
            tx_cplt: |_| (),
            tx_half_cplt: |_| (),
            rx_cplt: |_| (),
            rx_half_cplt: |_| (),
            mute: |_| (),
            abort_cplt: |_| (),
            error: |_| (),
        }
    }
}

/// The registers of one audio sub-block. Both sub-blocks share a layout, so B's are reached
/// through A's register types.
#[derive(Clone, Copy)]
struct BlockRegs<'a> {
    regs: &'a pac::sai1::RegisterBlock,
    offset: usize,
}

impl<'a> BlockRegs<'a> {
    fn new(regs: &'a pac::sai1::RegisterBlock, block: SubBlock) -> Self {
        let offset = match block {
            SubBlock::A => 0,
            SubBlock::B => BLOCK_B_OFFSET,
        };
        Self { regs, offset }
    }

    fn reg<T>(self, a: &'a T) -> &'a T {
        unsafe { &*(a as *const T).byte_add(self.offset) }
    }

    fn cr1(self) -> &'a ACR1 {
        self.reg(self.regs.acr1())
    }

    fn cr2(self) -> &'a ACR2 {
        self.reg(self.regs.acr2())
    }

    fn frcr(self) -> &'a AFRCR {
        self.reg(self.regs.afrcr())
    }

    fn slotr(self) -> &'a ASLOTR {
        self.reg(self.regs.aslotr())
    }

    fn im(self) -> &'a AIM {
        self.reg(self.regs.aim())
    }

    fn sr(self) -> &'a ASR {
        self.reg(self.regs.asr())
    }

    fn clrfr(self) -> &'a ACLRFR {
        self.reg(self.regs.aclrfr())
    }

    fn dr(self) -> &'a ADR {
        self.reg(self.regs.adr())
    }

    fn enabled(self) -> bool {
        self.cr1().read().saiaen().bit_is_set()
    }

    fn set_dma_requests(self, enable: bool) {
        self.cr1().modify(|_, w| w.dmaen().bit(enable));
    }

    fn flush_fifo(self) {
        self.cr2().modify(|_, w| w.fflush().set_bit());
    }

    fn clear_flags(self, flags: u32) {
        self.clrfr().write(|w| unsafe { w.bits(flags) });
    }
}

/// Write one sample from `xfer` to the data register.
///
/// # Safety
/// `xfer` must have at least `bytes` items left.
unsafe fn write_sample(blk: BlockRegs, xfer: &mut XferBuf<u8>, bytes: usize) {
    let mut v = 0;
    for i in 0..bytes {
        v |= (unsafe { xfer.pop() } as u32) << (8 * i);
    }
    blk.dr().write(|w| unsafe { w.bits(v) });
}

/// Read one sample from the data register into `xfer`.
///
/// # Safety
/// `xfer` must have at least `bytes` writable items left.
unsafe fn read_sample(blk: BlockRegs, xfer: &mut XferBuf<u8>, bytes: usize) {
    let v = blk.dr().read().bits();
    for i in 0..bytes {
        unsafe { xfer.push((v >> (8 * i)) as u8) };
    }
}

fn pack_sample(sample: &[u8]) -> u32 {
    sample
        .iter()
        .enumerate()
        .fold(0, |v, (i, b)| v | (*b as u32) << (8 * i))
}

fn fifo_full(blk: BlockRegs) -> bool {
    blk.sr().read().flvl().bits() == FLVL_FULL
}

fn fifo_empty(blk: BlockRegs) -> bool {
    blk.sr().read().flvl().bits() == FLVL_EMPTY
}

/// Represents one audio sub-block of an SAI peripheral.
pub struct Sai<R> {
    pub regs: R,
    device: SaiDevice,
    block: SubBlock,
    state: SaiState,
    last_error_codes: u32,
    cfg: SaiConfig,
    /// Sample bytes left to move, for interrupt-driven transfers.
    xfer: XferBuf<u8>,
    /// Bytes per sample in the user buffer.
    sample_bytes: usize,
    dma: Option<DmaChannel>,
    /// The pending DMA abort was requested with `abort_it`, rather than by an error.
    abort_requested: bool,
    callbacks: SaiCallbacks<R>,
}

impl<R> Sai<R>
where
    R: Deref<Target = pac::sai1::RegisterBlock>,
{
    /// Initialize an SAI sub-block, including enabling and resetting its RCC peripheral clock,
    /// then write its configuration.
    pub fn new(
        regs: R,
        device: SaiDevice,
        block: SubBlock,
        cfg: &SaiConfig,
        rcc: &pac::rcc::RegisterBlock,
    ) -> Result<Self> {
        critical_section::with(|_| match device {
            SaiDevice::One => {
                rcc_en_reset!(apb2, sai1, rcc);
            }
            #[cfg(sai2)]
            SaiDevice::Two => {
                rcc_en_reset!(apb2, sai2, rcc);
            }
        });

        let mut result = Self {
            regs,
            device,
            block,
            state: SaiState::Init,
            last_error_codes: 0,
            cfg: *cfg,
            xfer: XferBuf::empty(),
            sample_bytes: 2,
            dma: None,
            abort_requested: false,
            callbacks: Default::default(),
        };

        result.set_config(cfg)?;
        Ok(result)
    }

    fn blk(&self) -> BlockRegs<'_> {
        BlockRegs::new(&self.regs, self.block)
    }

    /// Disable the sub-block, flush its FIFO, and return it to the reset state.
    pub fn deinit(&mut self) -> Result<()> {
        let blk = self.blk();
        blk.im().reset();
        blk.clear_flags(INT_ALL);
        let disabled = self.disable_block();
        self.blk().flush_fifo();
        self.state = SaiState::Reset;
        disabled
    }

    /// Write the configuration. Protocol presets apply: SPDIF forces 24-bit stereo data in a
    /// 64-bit frame, and AC'97 a 256-bit frame of 13 slots.
    pub fn set_config(&mut self, cfg: &SaiConfig) -> Result<()> {
        check_state(self.state, &[SaiState::Init, SaiState::Idle])?;

        let mut cfg = *cfg;
        match cfg.protocol {
            Protocol::Spdif => {
                cfg.data_size = DataSize::S24;
                cfg.frame.length = SPDIF_FRAME_LEN as u16;
                cfg.mono = Mono::Stereo;
            }
            Protocol::Ac97 => {
                cfg.frame.length = AC97_FRAME_LEN as u16;
                cfg.slot.num_slots = AC97_NUM_SLOTS;
            }
            Protocol::Free => (),
        }

        if !(8..=256).contains(&cfg.frame.length)
            || !(1..=128).contains(&cfg.frame.active_length)
            || cfg.slot.first_bit_offset > 24
            || !(1..=16).contains(&cfg.slot.num_slots)
            || cfg.mclk_div > 63
        {
            return Err(Error::InvalidParam);
        }
        let mckdiv = mclk_divider(&cfg)?;

        // Configuration registers can only be written with the block disabled.
        self.disable_block()?;

        // Transmitters drive on the edge opposite the strobe edge.
        let ckstr = if cfg.mode.is_rx() {
            cfg.clock_strobe == ClockStrobe::RisingEdge
        } else {
            cfg.clock_strobe == ClockStrobe::FallingEdge
        };

        let blk = self.blk();
        blk.cr1().write(|w| unsafe {
            w.mode().bits(cfg.mode as u8);
            w.prtcfg().bits(cfg.protocol as u8);
            w.ds().bits(cfg.data_size as u8);
            w.lsbfirst().bit(cfg.bit_order == BitOrder::LsbFirst);
            w.ckstr().bit(ckstr);
            w.syncen().bits(cfg.sync as u8);
            w.mono().bit(cfg.mono == Mono::Mono);
            w.outdriv().bit(cfg.output_drive);
            w.nodiv().bit(cfg.nodiv);
            w.mckdiv().bits(mckdiv);
            w.osr().bit(cfg.oversampling);
            w.mcken().bit(cfg.mcken)
        });

        let (comp, cpl) = cfg.companding.bits();
        blk.cr2().write(|w| unsafe {
            w.fth().bits(cfg.fifo_threshold as u8);
            w.comp().bits(comp);
            w.cpl().bit(cpl)
        });

        blk.frcr().write(|w| unsafe {
            w.frl().bits((cfg.frame.length - 1) as u8);
            w.fsall().bits(cfg.frame.active_length - 1);
            w.fsdef()
                .bit(cfg.frame.fs_definition == FsSignal::ChannelIdentification);
            w.fspol().bit(cfg.frame.fs_polarity == FsPolarity::ActiveHigh);
            w.fsoff().bit(cfg.frame.fs_offset == FsOffset::BeforeFirstBit)
        });

        blk.slotr().write(|w| unsafe {
            w.fboff().bits(cfg.slot.first_bit_offset);
            w.slotsz().bits(cfg.slot.size as u8);
            w.nbslot().bits(cfg.slot.num_slots - 1);
            w.sloten().bits(cfg.slot.active_slots)
        });

        self.sample_bytes = sample_bytes(&cfg);
        self.cfg = cfg;
        self.state = SaiState::Idle;
        Ok(())
    }

    /// The configuration in use, with protocol presets applied.
    pub fn config(&self) -> &SaiConfig {
        &self.cfg
    }

    /// Enable the sub-block. Transfer functions do this as needed.
    pub fn enable(&mut self) {
        self.blk().cr1().modify(|_, w| w.saiaen().set_bit());
    }

    /// Disable an audio subblock. See U5 RM, section 68.4.16.
    /// The SAI audio block can be disabled at any moment by clearing SAIEN bit in the SAI_xCR1
    /// register. All the already started frames are automatically completed before the SAI is stops
    /// working. SAIEN bit remains High until the SAI is completely switched-off at the end of the
    /// current audio frame transfer.
    /// If an audio block in the SAI operates synchronously with the other one, the one which is the
    /// master must be disabled first.
    fn disable_block(&self) -> Result<()> {
        let blk = self.blk();
        blk.cr1().modify(|_, w| w.saiaen().clear_bit());
        tick::wait_until(|| !blk.enabled(), DEFAULT_TIMEOUT)
    }

    /// Export this sub-block's sync signals to the other SAI, or stop doing so.
    pub fn set_sync_output(&mut self, out: SyncOut) -> Result<()> {
        check_state(self.state, &[SaiState::Init, SaiState::Idle])?;
        self.regs
            .gcr()
            .modify(|_, w| unsafe { w.syncout().bits(out as u8) });
        Ok(())
    }

    /// Select which external SAI sync signals are taken from, for `SyncMode::External`.
    pub fn set_sync_input(&mut self, input: u8) -> Result<()> {
        check_state(self.state, &[SaiState::Init, SaiState::Idle])?;
        if input > 3 {
            return Err(Error::InvalidParam);
        }
        self.regs
            .gcr()
            .modify(|_, w| unsafe { w.syncin().bits(input) });
        Ok(())
    }

    /// Mute a transmitter. It sends zeros, or repeats the last value.
    pub fn enable_tx_mute(&mut self, val: MuteValue) -> Result<()> {
        if self.cfg.mode.is_rx() {
            return Err(Error::InvalidParam);
        }
        self.blk().cr2().modify(|_, w| {
            w.mute()
                .set_bit()
                .muteval()
                .bit(val == MuteValue::LastValue)
        });
        Ok(())
    }

    pub fn disable_tx_mute(&mut self) -> Result<()> {
        if self.cfg.mode.is_rx() {
            return Err(Error::InvalidParam);
        }
        self.blk()
            .cr2()
            .modify(|_, w| w.mute().clear_bit().muteval().clear_bit());
        Ok(())
    }

    /// Call the `mute` callback after a receiver gets `counter` consecutive mute frames.
    pub fn enable_rx_mute_detection(&mut self, counter: u8) -> Result<()> {
        if !self.cfg.mode.is_rx() || counter > 63 {
            return Err(Error::InvalidParam);
        }
        let blk = self.blk();
        blk.cr2()
            .modify(|_, w| unsafe { w.mutecn().bits(counter) });
        blk.clrfr().write(|w| w.cmutedet().set_bit());
        blk.im().modify(|_, w| w.mutedetie().set_bit());
        Ok(())
    }

    pub fn disable_rx_mute_detection(&mut self) -> Result<()> {
        if !self.cfg.mode.is_rx() {
            return Err(Error::InvalidParam);
        }
        let blk = self.blk();
        blk.cr2().modify(|_, w| unsafe { w.mutecn().bits(0) });
        blk.im().modify(|_, w| w.mutedetie().clear_bit());
        blk.clrfr().write(|w| w.cmutedet().set_bit());
        Ok(())
    }

    pub fn set_fifo_threshold(&mut self, threshold: FifoThreshold) -> Result<()> {
        check_state(self.state, &[SaiState::Idle])?;
        self.blk()
            .cr2()
            .modify(|_, w| unsafe { w.fth().bits(threshold as u8) });
        self.cfg.fifo_threshold = threshold;
        Ok(())
    }

    pub fn set_companding(&mut self, companding: Companding) -> Result<()> {
        check_state(self.state, &[SaiState::Idle])?;
        let (comp, cpl) = companding.bits();
        self.blk()
            .cr2()
            .modify(|_, w| unsafe { w.comp().bits(comp).cpl().bit(cpl) });
        self.cfg.companding = companding;
        self.sample_bytes = sample_bytes(&self.cfg);
        Ok(())
    }

    /// Release the SD line (HI-Z) at the end of the last data bit of each inactive slot.
    /// Transmitters only.
    pub fn enable_tristate(&mut self) -> Result<()> {
        check_state(self.state, &[SaiState::Idle])?;
        if self.cfg.mode.is_rx() {
            return Err(Error::InvalidParam);
        }
        self.blk().cr2().modify(|_, w| w.tris().set_bit());
        Ok(())
    }

    pub fn disable_tristate(&mut self) -> Result<()> {
        check_state(self.state, &[SaiState::Idle])?;
        self.blk().cr2().modify(|_, w| w.tris().clear_bit());
        Ok(())
    }

    /// PDM is only available on SAI1, sub-block A.
    fn check_pdm(&self) -> Result<()> {
        if self.device != SaiDevice::One || self.block != SubBlock::A {
            return Err(Error::InvalidParam);
        }
        check_state(self.state, &[SaiState::Idle])
    }

    /// Enable the PDM interface, for 1 to 4 pairs of digital microphones. See U5 RM, section
    /// 68.4.11: "PDM interface".
    pub fn enable_pdm(&mut self, mic_pairs: u8, clocks: PdmClocks) -> Result<()> {
        self.check_pdm()?;
        if !(1..=4).contains(&mic_pairs) {
            return Err(Error::InvalidParam);
        }

        let (ck1, ck2) = match clocks {
            PdmClocks::None => (false, false),
            PdmClocks::Clock1 => (true, false),
            PdmClocks::Clock2 => (false, true),
            PdmClocks::Both => (true, true),
        };
        self.regs.pdmcr().write(|w| unsafe {
            w.micnbr()
                .bits(mic_pairs - 1)
                .cken1()
                .bit(ck1)
                .cken2()
                .bit(ck2)
        });
        self.regs.pdmcr().modify(|_, w| w.pdmen().set_bit());
        Ok(())
    }

    pub fn disable_pdm(&mut self) -> Result<()> {
        self.check_pdm()?;
        self.regs.pdmcr().modify(|_, w| w.pdmen().clear_bit());
        Ok(())
    }

    /// Set the delay lines of microphone pair `pair`, 1 to 4.
    pub fn set_pdm_delay(&mut self, pair: u8, delay: PdmDelay) -> Result<()> {
        if self.device != SaiDevice::One || self.block != SubBlock::A {
            return Err(Error::InvalidParam);
        }
        if !(1..=4).contains(&pair) || delay.left > 7 || delay.right > 7 {
            return Err(Error::InvalidParam);
        }

        let offset = PDM_DELAY_OFFSET * (pair as u32 - 1);
        let val = ((delay.right as u32) << PDM_RIGHT_DELAY_OFFSET) | delay.left as u32;
        self.regs.pdmdly().modify(|r, w| unsafe {
            w.bits((r.bits() & !(PDM_DELAY_MASK << offset)) | (val << offset))
        });
        Ok(())
    }

    /// The audio frequency the current divider produces, from a kernel clock in Hz.
    pub fn real_audio_frequency(&self, kernel_clk: u32) -> u32 {
        let cr1 = self.blk().cr1().read();
        let div = (cr1.mckdiv().bits() as u32).max(1);

        let freq = if cr1.nodiv().bit_is_set() {
            kernel_clk / (div * frame_len(&self.cfg))
        } else {
            let osr = if cr1.osr().bit_is_set() { 2 } else { 1 };
            kernel_clk / (div * osr * 256)
        };

        if self.cfg.protocol == Protocol::Spdif {
            freq >> 1
        } else {
            freq
        }
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len == 0 || len % self.sample_bytes != 0 {
            return Err(Error::InvalidParam);
        }
        Ok(())
    }

    /// Interrupts enabled during a transfer. `FREQ` drives interrupt-mode transfers only.
    fn it_mask(&self, it_mode: bool) -> u32 {
        let mut v = OVRUDR;
        if it_mode {
            v |= FREQ;
        }
        if self.cfg.protocol == Protocol::Ac97 && self.cfg.mode.is_rx() {
            v |= CNRDY;
        }
        if self.cfg.mode.is_slave() {
            v |= AFSDET | LFSDET;
        } else {
            v |= WCKCFG;
        }
        v
    }

    fn enable_interrupts(&self, it_mode: bool) {
        let mask = self.it_mask(it_mode);
        self.blk()
            .im()
            .modify(|r, w| unsafe { w.bits(r.bits() | mask) });
    }

    fn disable_interrupts(&self) {
        let mask = self.it_mask(true);
        self.blk()
            .im()
            .modify(|r, w| unsafe { w.bits(r.bits() & !mask) });
    }

    /// Write samples to the FIFO until it's full, or the transfer's out of data.
    fn fill_fifo(&mut self) {
        let blk = BlockRegs::new(&self.regs, self.block);
        while !fifo_full(blk) && self.xfer.remaining > 0 {
            unsafe { write_sample(blk, &mut self.xfer, self.sample_bytes) };
        }
    }

    /// Count 0, interrupts off, flags cleared, FIFO flushed, Idle.
    fn stop_transfer(&mut self) {
        self.xfer.remaining = 0;
        self.disable_interrupts();
        let blk = self.blk();
        blk.clear_flags(INT_ALL);
        blk.flush_fifo();
        self.state = SaiState::Idle;
    }

    fn timeout_stop(&mut self) -> Error {
        self.last_error_codes |= SaiError::Timeout as u32;
        self.blk().clear_flags(INT_ALL);
        // The transfer's failed regardless.
        let _ = self.disable_block();
        self.blk().flush_fifo();
        self.state = SaiState::Idle;
        Error::Timeout
    }

    /// Send samples, blocking until they're all in the FIFO. `timeout` is in ms, and bounds
    /// each wait for FIFO space.
    pub fn transmit(&mut self, data: &[u8], timeout: u32) -> Result<()> {
        self.check_len(data.len())?;
        check_update_state(&mut self.state, SaiState::Idle, SaiState::TxActive)?;
        self.last_error_codes = 0;

        let mut samples = data.chunks_exact(self.sample_bytes).peekable();
        let blk = BlockRegs::new(&self.regs, self.block);

        while !fifo_full(blk) {
            match samples.next() {
                Some(s) => {
                    blk.dr().write(|w| unsafe { w.bits(pack_sample(s)) });
                }
                None => break,
            }
        }
        if !blk.enabled() {
            blk.cr1().modify(|_, w| w.saiaen().set_bit());
        }

        let mut start = tick::get_tick();
        while samples.peek().is_some() {
            if !fifo_full(blk) {
                if let Some(s) = samples.next() {
                    blk.dr().write(|w| unsafe { w.bits(pack_sample(s)) });
                }
                start = tick::get_tick();
            } else if tick::timed_out(start, timeout) {
                return Err(self.timeout_stop());
            }
        }

        self.state = SaiState::Idle;
        Ok(())
    }

    /// Receive samples, blocking until `buf` is full. `timeout` is in ms, and bounds each wait
    /// for FIFO data.
    pub fn receive(&mut self, buf: &mut [u8], timeout: u32) -> Result<()> {
        self.check_len(buf.len())?;
        check_update_state(&mut self.state, SaiState::Idle, SaiState::RxActive)?;
        self.last_error_codes = 0;

        let bytes = self.sample_bytes;
        let blk = BlockRegs::new(&self.regs, self.block);
        if !blk.enabled() {
            blk.cr1().modify(|_, w| w.saiaen().set_bit());
        }

        let mut samples = buf.chunks_exact_mut(bytes).peekable();
        let mut start = tick::get_tick();
        while samples.peek().is_some() {
            if !fifo_empty(blk) {
                let v = blk.dr().read().bits();
                if let Some(s) = samples.next() {
                    for (i, b) in s.iter_mut().enumerate() {
                        *b = (v >> (8 * i)) as u8;
                    }
                }
                start = tick::get_tick();
            } else if tick::timed_out(start, timeout) {
                return Err(self.timeout_stop());
            }
        }

        self.state = SaiState::Idle;
        Ok(())
    }

    /// Send samples using interrupts. Completes in `irq_handler`, with the `tx_cplt` callback.
    ///
    /// # Safety
    /// `data` must stay valid until the transfer completes or is aborted.
    pub unsafe fn transmit_it(&mut self, data: &[u8]) -> Result<()> {
        self.check_len(data.len())?;
        check_update_state(&mut self.state, SaiState::Idle, SaiState::TxActive)?;
        self.last_error_codes = 0;

        // The buffer's only read from.
        self.xfer = XferBuf {
            ptr: data.as_ptr() as *mut u8,
            remaining: data.len(),
        };
        self.fill_fifo();

        self.enable_interrupts(true);
        self.enable();
        Ok(())
    }

    /// Receive samples using interrupts. Completes in `irq_handler`, with the `rx_cplt` callback.
    ///
    /// # Safety
    /// `buf` must stay valid until the transfer completes or is aborted.
    pub unsafe fn receive_it(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_len(buf.len())?;
        check_update_state(&mut self.state, SaiState::Idle, SaiState::RxActive)?;
        self.last_error_codes = 0;

        self.xfer = XferBuf {
            ptr: buf.as_mut_ptr(),
            remaining: buf.len(),
        };

        self.enable_interrupts(true);
        self.enable();
        Ok(())
    }

    fn tx_isr(&mut self) {
        if self.xfer.remaining == 0 {
            self.disable_interrupts();
            self.state = SaiState::Idle;
            (self.callbacks.tx_cplt)(self);
            return;
        }
        let blk = BlockRegs::new(&self.regs, self.block);
        unsafe { write_sample(blk, &mut self.xfer, self.sample_bytes) };
    }

    fn rx_isr(&mut self) {
        let blk = BlockRegs::new(&self.regs, self.block);
        if self.xfer.remaining > 0 {
            unsafe { read_sample(blk, &mut self.xfer, self.sample_bytes) };
        }
        if self.xfer.remaining == 0 {
            self.disable_interrupts();
            self.blk().clrfr().write(|w| w.covrudr().set_bit());
            self.state = SaiState::Idle;
            (self.callbacks.rx_cplt)(self);
        }
    }

    /// Set the DMA channel used for transfers. Configure it first, with this sub-block's request
    /// (eg `DmaInput::Sai1A`), a direction matching the block's mode, and data widths matching
    /// the sample size.
    pub fn set_dma(&mut self, dma: DmaChannel) -> Result<()> {
        check_state(self.state, &[SaiState::Init, SaiState::Idle])?;
        self.dma = Some(dma);
        Ok(())
    }

    /// Start the DMA channel, and route its requests. On failure, the handle's back to Idle.
    fn start_dma(&mut self, src: u32, dst: u32, len: usize, opt: DmaOptIt) -> Result<()> {
        let result = match self.dma.as_mut() {
            Some(dma) => dma.start_periph_xfer_it_opt(src, dst, len as u32, opt),
            None => Err(Error::InvalidParam),
        };
        if let Err(e) = result {
            self.last_error_codes |= SaiError::Dma as u32;
            self.state = SaiState::Idle;
            return Err(e);
        }

        self.enable_interrupts(false);
        self.blk().set_dma_requests(true);
        Ok(())
    }

    /// Send samples with DMA. Completes in `dma_irq_handler`, with the `tx_cplt` callback; or
    /// runs until aborted, if the channel is circular.
    ///
    /// To free the CPU and to optimize bus bandwidth, each SAI audio block has an independent
    /// DMA interface to read/write from/to the SAI_xDR register (to access the internal FIFO).
    /// There is one DMA channel per audio subblock supporting basic DMA request/acknowledge
    /// protocol.
    ///
    /// # Safety
    /// `data` must stay valid until the transfer completes or is aborted.
    pub unsafe fn transmit_dma(&mut self, data: &[u8], opt: DmaOptIt) -> Result<()> {
        self.check_len(data.len())?;
        if self.dma.is_none() {
            return Err(Error::InvalidParam);
        }
        check_update_state(&mut self.state, SaiState::Idle, SaiState::TxActive)?;
        self.last_error_codes = 0;
        self.xfer = XferBuf {
            ptr: data.as_ptr() as *mut u8,
            remaining: data.len(),
        };

        let dst = self.data_register_address();
        self.start_dma(data.as_ptr() as u32, dst, data.len(), opt)?;

        // Enable once the FIFO has data, so the first frame doesn't underrun.
        let blk = self.blk();
        if tick::wait_until(|| !fifo_empty(blk), LONG_TIMEOUT).is_err() {
            blk.set_dma_requests(false);
            self.disable_interrupts();
            return Err(self.timeout_stop());
        }

        self.enable();
        Ok(())
    }

    /// Receive samples with DMA. Completes in `dma_irq_handler`, with the `rx_cplt` callback;
    /// or runs until aborted, if the channel is circular.
    ///
    /// # Safety
    /// `buf` must stay valid until the transfer completes or is aborted.
    pub unsafe fn receive_dma(&mut self, buf: &mut [u8], opt: DmaOptIt) -> Result<()> {
        self.check_len(buf.len())?;
        if self.dma.is_none() {
            return Err(Error::InvalidParam);
        }
        check_update_state(&mut self.state, SaiState::Idle, SaiState::RxActive)?;
        self.last_error_codes = 0;
        self.xfer = XferBuf {
            ptr: buf.as_mut_ptr(),
            remaining: buf.len(),
        };

        let src = self.data_register_address();
        self.start_dma(src, buf.as_mut_ptr() as u32, buf.len(), opt)?;

        self.enable();
        Ok(())
    }

    /// Stop DMA requests. The transfer picks up where it left off on `resume_dma`.
    pub fn pause_dma(&mut self) -> Result<()> {
        let paused = match self.state {
            SaiState::TxActive => SaiState::TxPaused,
            SaiState::RxActive => SaiState::RxPaused,
            _ => return Err(Error::Busy),
        };
        self.blk().set_dma_requests(false);
        self.state = paused;
        Ok(())
    }

    pub fn resume_dma(&mut self) -> Result<()> {
        let active = match self.state {
            SaiState::TxPaused => SaiState::TxActive,
            SaiState::RxPaused => SaiState::RxActive,
            _ => return Err(Error::Busy),
        };
        let blk = self.blk();
        blk.set_dma_requests(true);
        if !blk.enabled() {
            blk.cr1().modify(|_, w| w.saiaen().set_bit());
        }
        self.state = active;
        Ok(())
    }

    fn check_abortable(&self) -> Result<()> {
        check_state(
            self.state,
            &[
                SaiState::TxActive,
                SaiState::RxActive,
                SaiState::TxPaused,
                SaiState::RxPaused,
            ],
        )
    }

    fn dma_running(&self) -> bool {
        self.dma
            .as_ref()
            .map(|d| matches!(d.state(), DmaState::Active | DmaState::Suspend))
            .unwrap_or(false)
    }

    /// Abort the transfer, blocking until the block and its DMA channel have stopped.
    pub fn abort(&mut self) -> Result<()> {
        self.check_abortable()?;
        self.state = SaiState::Abort;

        let disabled = self.disable_block();
        if disabled.is_err() {
            self.last_error_codes |= SaiError::Timeout as u32;
        }

        // A paused transfer has DMA requests off, but its channel is still running.
        self.blk().set_dma_requests(false);
        if self.dma_running() {
            let aborted = self.dma.as_mut().map(|d| d.abort());
            if let Some(Err(_)) = aborted {
                self.last_error_codes |= SaiError::Dma as u32;
            }
        }

        self.stop_transfer();
        disabled
    }

    /// Abort the transfer without blocking on the DMA channel. Completes with the `abort_cplt`
    /// callback; from `dma_irq_handler` if a DMA transfer was running, or before returning
    /// otherwise.
    pub fn abort_it(&mut self) -> Result<()> {
        self.check_abortable()?;
        self.state = SaiState::Abort;

        if self.disable_block().is_err() {
            self.last_error_codes |= SaiError::Timeout as u32;
        }

        if self.request_dma_abort(true) {
            return Ok(());
        }

        self.stop_transfer();
        (self.callbacks.abort_cplt)(self);
        Ok(())
    }

    /// Stop DMA requests, and start aborting the DMA channel if it's running. Returns `true` if
    /// the abort completes later, in `dma_irq_handler`.
    fn request_dma_abort(&mut self, requested: bool) -> bool {
        self.blk().set_dma_requests(false);
        if !self.dma_running() {
            return false;
        }
        self.abort_requested = requested;
        self.state = SaiState::Abort;
        match self.dma.as_mut() {
            Some(dma) => dma.abort_it().is_ok(),
            None => false,
        }
    }

    fn finish_dma_abort(&mut self) {
        // The block may already be off.
        let _ = self.disable_block();
        self.blk().set_dma_requests(false);
        self.stop_transfer();

        if self.abort_requested {
            self.abort_requested = false;
            (self.callbacks.abort_cplt)(self);
        }
    }

    /// Handle SAI interrupts. Run this in the SAI ISR. Handles one event per call, in this
    /// order: FIFO request, mute detection, overrun/underrun, frame sync errors, clock
    /// configuration error, then codec not ready.
    pub fn irq_handler(&mut self) {
        let blk = self.blk();
        let flags = blk.sr().read().bits() & blk.im().read().bits() & INT_ALL;
        let pending = |f: u32| flags & f != 0;

        if pending(FREQ) {
            match self.state {
                SaiState::TxActive => self.tx_isr(),
                SaiState::RxActive => self.rx_isr(),
                _ => (),
            }
        } else if pending(MUTEDET) {
            self.blk().clrfr().write(|w| w.cmutedet().set_bit());
            (self.callbacks.mute)(self);
        } else if pending(OVRUDR) {
            let e = if self.cfg.mode.is_rx() {
                SaiError::Overrun
            } else {
                SaiError::Underrun
            };
            self.last_error_codes |= e as u32;
            self.blk().clrfr().write(|w| w.covrudr().set_bit());
            (self.callbacks.error)(self);
        } else if pending(AFSDET | LFSDET) {
            if pending(AFSDET) {
                self.last_error_codes |= SaiError::AfsDet as u32;
            }
            if pending(LFSDET) {
                self.last_error_codes |= SaiError::LfsDet as u32;
            }
            self.blk()
                .clrfr()
                .write(|w| w.cafsdet().set_bit().clfsdet().set_bit());

            if !self.request_dma_abort(false) {
                let _ = self.disable_block();
                self.stop_transfer();
            }
            (self.callbacks.error)(self);
        } else if pending(WCKCFG) {
            self.last_error_codes |= SaiError::WckCfg as u32;
            self.blk().clrfr().write(|w| w.cwckcfg().set_bit());

            if !self.request_dma_abort(false) {
                self.disable_interrupts();
                self.blk().clear_flags(INT_ALL);
                self.xfer.remaining = 0;
                self.state = SaiState::Idle;
            }
            (self.callbacks.error)(self);
        } else if pending(CNRDY) {
            self.last_error_codes |= SaiError::CnReady as u32;
            self.blk().clrfr().write(|w| w.ccnrdy().set_bit());
            (self.callbacks.error)(self);
        }
    }

    /// Run this in the ISR of the DMA channel set with `set_dma`.
    pub fn dma_irq_handler(&mut self) {
        let Some(dma) = self.dma.as_mut() else {
            return;
        };
        let circular = dma.is_circular();
        let Some(event) = dma.irq_handler() else {
            return;
        };
        let rx = self.cfg.mode.is_rx();

        match event {
            DmaEvent::Complete => {
                if !circular {
                    self.xfer.remaining = 0;
                    self.blk().set_dma_requests(false);
                    self.disable_interrupts();
                    self.state = SaiState::Idle;
                }
                if rx {
                    (self.callbacks.rx_cplt)(self);
                } else {
                    (self.callbacks.tx_cplt)(self);
                }
            }
            DmaEvent::HalfComplete => {
                if rx {
                    (self.callbacks.rx_half_cplt)(self);
                } else {
                    (self.callbacks.tx_half_cplt)(self);
                }
            }
            DmaEvent::Error(_) => {
                self.last_error_codes |= SaiError::Dma as u32;
                self.blk().set_dma_requests(false);
                let _ = self.disable_block();
                self.state = SaiState::Idle;
                self.xfer.remaining = 0;
                (self.callbacks.error)(self);
            }
            DmaEvent::Aborted => self.finish_dma_abort(),
            DmaEvent::Suspended => (),
        }
    }

    pub fn register_tx_cplt_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.tx_cplt = cb;
    }

    pub fn register_tx_half_cplt_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.tx_half_cplt = cb;
    }

    pub fn register_rx_cplt_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.rx_cplt = cb;
    }

    pub fn register_rx_half_cplt_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.rx_half_cplt = cb;
    }

    pub fn register_mute_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.mute = cb;
    }

    pub fn register_abort_cplt_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.abort_cplt = cb;
    }

    pub fn register_error_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.error = cb;
    }

    pub fn state(&self) -> SaiState {
        self.state
    }

    /// A bitmask of `SaiError` values.
    pub fn last_error_codes(&self) -> u32 {
        self.last_error_codes
    }

    pub fn fifo_level(&self) -> FifoLevel {
        match self.blk().sr().read().flvl().bits() {
            0 => FifoLevel::Empty,
            1 => FifoLevel::Quarter1,
            2 => FifoLevel::Quarter2,
            3 => FifoLevel::Quarter3,
            4 => FifoLevel::Quarter4,
            _ => FifoLevel::Full,
        }
    }

    /// Address of the sub-block's data register; the DMA peripheral address.
    pub fn data_register_address(&self) -> u32 {
        dma::reg_addr(self.blk().dr())
    }
}

fn frame_len(cfg: &SaiConfig) -> u32 {
    match cfg.protocol {
        Protocol::Spdif => SPDIF_FRAME_LEN,
        Protocol::Ac97 => AC97_FRAME_LEN,
        Protocol::Free => cfg.frame.length as u32,
    }
}

fn sample_bytes(cfg: &SaiConfig) -> usize {
    match cfg.data_size {
        DataSize::S8 if cfg.companding == Companding::None => 1,
        DataSize::S8 | DataSize::S10 | DataSize::S16 => 2,
        _ => 4,
    }
}

/// Compute MCKDIV for the configured audio frequency. See U5 RM, section 68.4.8: "SAI clock
/// generator".
fn mclk_divider(cfg: &SaiConfig) -> Result<u8> {
    if cfg.audio_frequency == AudioFrequency::MclkDiv {
        return Ok(cfg.mclk_div);
    }

    // Scaled by 10, to round.
    let clk = cfg.kernel_clk as u64 * 10;
    let freq = cfg.audio_frequency as u64;
    let fs = if cfg.nodiv {
        clk / (freq * frame_len(cfg) as u64)
    } else {
        let osr = if cfg.oversampling { 2 } else { 1 };
        clk / (freq * osr * 256)
    };

    let mut div = fs / 10;
    if fs % 10 > 8 {
        div += 1;
    }
    if cfg.protocol == Protocol::Spdif {
        div >>= 1;
    }

    if div > 63 {
        return Err(Error::InvalidParam);
    }
    Ok(div as u8)
}

#[cfg(feature = "embedded_hal")]
mod embedded_io_impl {
    use embedded_io::{ErrorType, Read, ReadReady, Write, WriteReady};

    use super::*;

    impl<R> ErrorType for Sai<R> {
        type Error = crate::error::Error;
    }

    impl<R> Read for Sai<R>
    where
        R: Deref<Target = pac::sai1::RegisterBlock>,
    {
        /// Reads whole samples; `buf` is truncated to a multiple of the sample size.
        fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Self::Error> {
            let len = buf.len() - buf.len() % self.sample_bytes;
            if buf.is_empty() {
                return Ok(0);
            }
            if len == 0 {
                return Err(Error::InvalidParam);
            }
            self.receive(&mut buf[..len], LONG_TIMEOUT)?;
            Ok(len)
        }
    }

    impl<R> ReadReady for Sai<R>
    where
        R: Deref<Target = pac::sai1::RegisterBlock>,
    {
        fn read_ready(&mut self) -> core::result::Result<bool, Self::Error> {
            Ok(!fifo_empty(self.blk()))
        }
    }

    impl<R> Write for Sai<R>
    where
        R: Deref<Target = pac::sai1::RegisterBlock>,
    {
        fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, Self::Error> {
            let len = buf.len() - buf.len() % self.sample_bytes;
            if buf.is_empty() {
                return Ok(0);
            }
            if len == 0 {
                return Err(Error::InvalidParam);
            }
            self.transmit(&buf[..len], LONG_TIMEOUT)?;
            Ok(len)
        }

        fn flush(&mut self) -> core::result::Result<(), Self::Error> {
            let blk = self.blk();
            tick::wait_until(|| fifo_empty(blk), LONG_TIMEOUT)
        }
    }

    impl<R> WriteReady for Sai<R>
    where
        R: Deref<Target = pac::sai1::RegisterBlock>,
    {
        fn write_ready(&mut self) -> core::result::Result<bool, Self::Error> {
            Ok(!fifo_full(self.blk()))
        }
    }
}
