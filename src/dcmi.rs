//! Support for the Digital Camera Interface (DCMI). Captures parallel camera data into memory
//! with GPDMA1, in snapshot or continuous mode.
//!
//! Frames larger than one DMA block are captured in equal blocks; the DMA channel is re-armed
//! for each block in `dma_irq_handler`.

use core::ops::Deref;

use crate::{
    dma::{self, DmaChannel, DmaEvent, DmaOptIt},
    error::{Error, Result},
    pac, tick,
    util::{bounded_loop, check_state, check_update_state, check_update_state_any, rcc_en_reset},
};

/// Largest DMA block, in bytes.
const DMA_MAX_BLOCK: u32 = 0xFFFF;
/// Time for capture to stop at the end of the current frame, in ms.
pub const STOP_TIMEOUT: u32 = 1_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u32)]
/// DCMI errors. The discriminants are the bits used in `last_error_codes`.
pub enum DcmiError {
    /// Data arrived while the FIFO was full.
    Overrun = 1 << 0,
    /// Embedded synchronization codes arrived out of order.
    Sync = 1 << 1,
    Dma = 1 << 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum DcmiState {
    Reset,
    Init,
    Configured,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum PipeState {
    Reset,
    Idle,
    Active,
    Suspend,
    Abort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Embedded synchronization codes, or their unmask values. In an unmask, set bits are compared.
pub struct SyncCodes {
    pub frame_start: u8,
    pub line_start: u8,
    pub line_end: u8,
    pub frame_end: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum SyncMode {
    /// HSYNC and VSYNC signals.
    Hardware,
    /// Synchronization codes embedded in the data flow. (eg ITU-R BT.656)
    Embedded { codes: SyncCodes, unmask: SyncCodes },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Pixel clock edge data is captured on.
pub enum PixelClockPolarity {
    Falling,
    Rising,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Level of HSYNC or VSYNC during which data isn't valid.
pub enum SyncPolarity {
    ActiveLow,
    ActiveHigh,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// Frame capture rate control. Ignored in snapshot mode.
pub enum CaptureRate {
    All = 0,
    OneOfTwo = 1,
    OneOfFour = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// Bits captured per pixel clock.
pub enum BusWidth {
    Bits8 = 0,
    Bits10 = 1,
    Bits12 = 2,
    Bits14 = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct DcmiConfig {
    pub sync: SyncMode,
    pub pixel_clock: PixelClockPolarity,
    pub hsync: SyncPolarity,
    pub vsync: SyncPolarity,
    pub rate: CaptureRate,
    pub bus_width: BusWidth,
    /// Compressed data; no fixed number of data per line.
    pub jpeg: bool,
}

impl Default for DcmiConfig {
    fn default() -> Self {
        Self {
            sync: SyncMode::Hardware,
            pixel_clock: PixelClockPolarity::Falling,
            hsync: SyncPolarity::ActiveLow,
            vsync: SyncPolarity::ActiveLow,
            rate: CaptureRate::All,
            bus_width: BusWidth::Bits8,
            jpeg: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
/// Which received bytes are kept. (CR BSM)
pub enum ByteSelect {
    All = 0,
    OneOfTwo = 1,
    OneOfFour = 2,
    TwoOfFour = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Which received lines are kept. (CR LSM)
pub enum LineSelect {
    All,
    OneOfTwo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Whether byte or line selection starts with the first item received, or the second.
pub enum SelectStart {
    First,
    Second,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct PipeConfig {
    pub byte_select: ByteSelect,
    pub byte_start: SelectStart,
    pub line_select: LineSelect,
    pub line_start: SelectStart,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum CaptureMode {
    /// Capture frames until stopped.
    Continuous = 0,
    /// Capture a single frame.
    Snapshot = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
/// Optional interrupts, when starting a capture. Frame, VSYNC, overrun and sync error
/// interrupts are always enabled.
pub enum OptIt {
    None,
    /// End of line interrupt.
    Line,
}

#[derive(Clone, Copy, PartialEq)]
/// Why the DMA channel is being aborted; selects how the abort finishes.
enum AbortReason {
    Stop,
    Overrun,
    Sync,
}

/// Handlers run on capture events. They default to doing nothing.
pub struct DcmiCallbacks<R> {
    pub error: fn(&mut Dcmi<R>),
    pub pipe_error: fn(&mut Dcmi<R>),
    pub pipe_stop: fn(&mut Dcmi<R>),
    pub pipe_frame_event: fn(&mut Dcmi<R>),
    pub pipe_vsync_event: fn(&mut Dcmi<R>),
    pub pipe_line_event: fn(&mut Dcmi<R>),
}

impl<R> Default for DcmiCallbacks<R> {
    fn default() -> Self {
        Self {
            error: |_| (),
            pipe_error: |_| (),
            pipe_stop: |_| (),
            pipe_frame_event: |_| (),
            pipe_vsync_event: |_| (),
            pipe_line_event: |_| (),
        }
    }
}

/// Represents the DCMI peripheral.
pub struct Dcmi<R> {
    pub regs: R,
    state: DcmiState,
    pipe_state: PipeState,
    last_error_codes: u32,
    config: Option<DcmiConfig>,
    dma: Option<DmaChannel>,
    /// Start of the capture buffer.
    buf_addr: u32,
    /// Size of each DMA block, in bytes.
    xfer_size: u32,
    /// Blocks per frame, minus one.
    xfer_number: u32,
    /// Blocks left in the frame after the current one.
    xfer_count: u32,
    abort_reason: AbortReason,
    stop_timeout: u32,
    callbacks: DcmiCallbacks<R>,
}

impl<R> Dcmi<R>
where
    R: Deref<Target = pac::dcmi::RegisterBlock>,
{
    /// Initialize the DCMI peripheral, including enabling and resetting its RCC peripheral
    /// clock.
    pub fn new(regs: R, rcc: &pac::rcc::RegisterBlock) -> Self {
        critical_section::with(|_| {
            rcc_en_reset!(ahb2, dcmi_pssi, rcc);
        });

        Self {
            regs,
            state: DcmiState::Init,
            pipe_state: PipeState::Reset,
            last_error_codes: 0,
            config: None,
            dma: None,
            buf_addr: 0,
            xfer_size: 0,
            xfer_number: 0,
            xfer_count: 0,
            abort_reason: AbortReason::Stop,
            stop_timeout: STOP_TIMEOUT,
            callbacks: Default::default(),
        }
    }

    /// Stop capturing, disable the peripheral, and abort any DMA transfer.
    pub fn deinit(&mut self) -> Result<()> {
        self.regs.cr().modify(|_, w| w.capture().clear_bit());
        bounded_loop!(
            self.regs.cr().read().capture().bit_is_set(),
            Error::RegisterUnchanged
        );

        self.regs.cr().modify(|_, w| w.enable().clear_bit());
        self.regs.ier().reset();
        if let Some(dma) = self.dma.as_mut() {
            // Nothing to recover if the channel was already idle.
            let _ = dma.abort();
        }

        self.state = DcmiState::Reset;
        self.pipe_state = PipeState::Reset;
        Ok(())
    }

    pub fn set_config(&mut self, cfg: &DcmiConfig) -> Result<()> {
        check_state(self.state, &[DcmiState::Init, DcmiState::Configured])?;
        check_state(self.pipe_state, &[PipeState::Reset, PipeState::Idle])?;

        let embedded = matches!(cfg.sync, SyncMode::Embedded { .. });
        self.regs.cr().modify(|_, w| unsafe {
            w.ess().bit(embedded);
            w.pckpol().bit(cfg.pixel_clock == PixelClockPolarity::Rising);
            w.hspol().bit(cfg.hsync == SyncPolarity::ActiveHigh);
            w.vspol().bit(cfg.vsync == SyncPolarity::ActiveHigh);
            w.fcrc().bits(cfg.rate as u8);
            w.edm().bits(cfg.bus_width as u8);
            w.jpeg().bit(cfg.jpeg)
        });

        if let SyncMode::Embedded { codes, unmask } = cfg.sync {
            self.regs.escr().write(|w| unsafe {
                w.fsc().bits(codes.frame_start);
                w.lsc().bits(codes.line_start);
                w.lec().bits(codes.line_end);
                w.fec().bits(codes.frame_end)
            });
            self.regs.esur().write(|w| unsafe {
                w.fsu().bits(unmask.frame_start);
                w.lsu().bits(unmask.line_start);
                w.leu().bits(unmask.line_end);
                w.feu().bits(unmask.frame_end)
            });
        }

        self.config = Some(*cfg);
        self.state = DcmiState::Configured;
        self.pipe_state = PipeState::Idle;
        Ok(())
    }

    /// The configuration last set, if any.
    pub fn config(&self) -> Option<&DcmiConfig> {
        self.config.as_ref()
    }

    /// Select which bytes and lines of the data flow are captured.
    pub fn set_config_pipe(&mut self, cfg: &PipeConfig) -> Result<()> {
        check_state(self.pipe_state, &[PipeState::Idle])?;

        self.regs.cr().modify(|_, w| unsafe {
            w.bsm().bits(cfg.byte_select as u8);
            w.oebs().bit(cfg.byte_start == SelectStart::Second);
            w.lsm().bit(cfg.line_select == LineSelect::OneOfTwo);
            w.oels().bit(cfg.line_start == SelectStart::Second)
        });
        Ok(())
    }

    /// Set the crop window. `x` and `width` are in pixel clocks; `y` and `height` in lines.
    pub fn set_config_crop(&mut self, x: u32, y: u32, width: u32, height: u32) -> Result<()> {
        check_state(self.pipe_state, &[PipeState::Idle])?;
        if x > 0x3FFF
            || y > 0x1FFF
            || width == 0
            || width > 0x4000
            || height == 0
            || height > 0x4000
        {
            return Err(Error::InvalidParam);
        }

        self.regs
            .cwstrt()
            .write(|w| unsafe { w.hoffcnt().bits(x as u16).vst().bits(y as u16) });
        self.regs.cwsize().write(|w| unsafe {
            w.capcnt()
                .bits((width - 1) as u16)
                .vline()
                .bits((height - 1) as u16)
        });
        Ok(())
    }

    pub fn enable_crop(&mut self) -> Result<()> {
        check_state(self.pipe_state, &[PipeState::Idle])?;
        self.regs.cr().modify(|_, w| w.crop().set_bit());
        Ok(())
    }

    pub fn disable_crop(&mut self) -> Result<()> {
        check_state(self.pipe_state, &[PipeState::Idle])?;
        self.regs.cr().modify(|_, w| w.crop().clear_bit());
        Ok(())
    }

    pub fn is_enabled_crop(&self) -> bool {
        self.regs.cr().read().crop().bit_is_set()
    }

    /// Set the DMA channel that moves captured data. Configure it first: peripheral-to-memory,
    /// with the `DcmiPssi` request, 32-bit source width, and destination increment.
    pub fn set_dma(&mut self, dma: DmaChannel) -> Result<()> {
        check_state(self.pipe_state, &[PipeState::Reset, PipeState::Idle])?;
        self.dma = Some(dma);
        Ok(())
    }

    /// Start capturing into `dest`. If `dest` is larger than one DMA block, it's split into
    /// 2, 4, 8... equal blocks, and the DMA channel must be in normal mode.
    ///
    /// # Safety
    /// `dest` must stay valid until the capture completes or is stopped.
    pub unsafe fn start_pipe_dma(
        &mut self,
        mode: CaptureMode,
        dest: &mut [u32],
        opt: OptIt,
    ) -> Result<()> {
        let size = core::mem::size_of_val(dest) as u32;
        if size == 0 {
            return Err(Error::InvalidParam);
        }
        let Some(circular) = self.dma.as_ref().map(|d| d.is_circular()) else {
            return Err(Error::InvalidParam);
        };

        let mut xfer_size = size;
        let mut blocks = 1;
        while xfer_size > DMA_MAX_BLOCK {
            xfer_size /= 2;
            blocks *= 2;
        }
        if xfer_size * blocks != size || xfer_size % 4 != 0 || (blocks > 1 && circular) {
            return Err(Error::InvalidParam);
        }

        check_update_state(&mut self.pipe_state, PipeState::Idle, PipeState::Active)?;
        self.last_error_codes = 0;

        self.buf_addr = dest.as_mut_ptr() as u32;
        self.xfer_size = xfer_size;
        self.xfer_number = blocks - 1;
        self.xfer_count = self.xfer_number;

        self.regs.cr().modify(|_, w| {
            w.cm()
                .bit(mode == CaptureMode::Snapshot)
                .enable()
                .set_bit()
        });

        if let Err(e) = self.start_block(self.buf_addr) {
            self.regs.cr().modify(|_, w| w.enable().clear_bit());
            self.last_error_codes |= DcmiError::Dma as u32;
            self.pipe_state = PipeState::Idle;
            return Err(e);
        }

        self.clear_all_flags();
        self.regs.ier().write(|w| {
            w.frame_ie().set_bit();
            w.ovr_ie().set_bit();
            w.err_ie().set_bit();
            w.vsync_ie().set_bit();
            w.line_ie().bit(opt == OptIt::Line)
        });

        self.regs.cr().modify(|_, w| w.capture().set_bit());
        Ok(())
    }

    fn snapshot(&self) -> bool {
        self.regs.cr().read().cm().bit_is_set()
    }

    fn start_block(&mut self, addr: u32) -> Result<()> {
        let src = dma::reg_addr(self.regs.dr());
        match self.dma.as_mut() {
            Some(dma) => dma.start_periph_xfer_it_opt(src, addr, self.xfer_size, DmaOptIt::None),
            None => Err(Error::InvalidParam),
        }
    }

    fn clear_all_flags(&self) {
        self.regs.icr().write(|w| {
            w.frame_isc().set_bit();
            w.ovr_isc().set_bit();
            w.err_isc().set_bit();
            w.vsync_isc().set_bit();
            w.line_isc().set_bit()
        });
    }

    /// Stop capturing. Completes in `dma_irq_handler` with the `pipe_stop` callback, once the
    /// DMA channel is aborted; or immediately if it's already stopped. `timeout`, in ms, bounds
    /// the wait for the current frame to end.
    pub fn stop_pipe(&mut self, timeout: u32) -> Result<()> {
        check_update_state_any(
            &mut self.pipe_state,
            &[PipeState::Active, PipeState::Suspend],
            PipeState::Abort,
        )?;
        self.stop_timeout = timeout;
        self.regs.cr().modify(|_, w| w.capture().clear_bit());

        self.abort_dma(AbortReason::Stop);
        Ok(())
    }

    /// Abort the DMA transfer, finishing at once if there's nothing to abort.
    fn abort_dma(&mut self, reason: AbortReason) {
        self.abort_reason = reason;
        let requested = match self.dma.as_mut() {
            Some(dma) => dma.abort_it().is_ok(),
            None => false,
        };
        if !requested {
            self.finish_abort();
        }
    }

    fn finish_abort(&mut self) {
        match self.abort_reason {
            AbortReason::Stop => {
                // Capture stops at the end of the current frame. Disable regardless.
                let regs = &self.regs;
                let _ = tick::wait_until(
                    || regs.cr().read().capture().bit_is_clear(),
                    self.stop_timeout,
                );

                self.regs.cr().modify(|_, w| w.enable().clear_bit());
                self.pipe_state = PipeState::Idle;
                (self.callbacks.pipe_stop)(self);
            }
            AbortReason::Overrun => {
                self.regs.cr().modify(|_, w| w.enable().clear_bit());
                self.pipe_state = PipeState::Idle;
                (self.callbacks.pipe_error)(self);
            }
            AbortReason::Sync => {
                self.regs.cr().modify(|_, w| w.enable().clear_bit());
                self.pipe_state = PipeState::Idle;
                (self.callbacks.error)(self);
            }
        }
    }

    /// Pause capture at the end of the current frame.
    pub fn suspend_pipe(&mut self) -> Result<()> {
        check_state(self.pipe_state, &[PipeState::Active])?;

        self.regs.cr().modify(|_, w| w.capture().clear_bit());
        let regs = &self.regs;
        tick::wait_until(|| regs.cr().read().capture().bit_is_clear(), STOP_TIMEOUT)?;

        self.pipe_state = PipeState::Suspend;
        Ok(())
    }

    pub fn resume_pipe(&mut self) -> Result<()> {
        check_update_state(&mut self.pipe_state, PipeState::Suspend, PipeState::Active)?;
        self.regs.cr().modify(|_, w| w.capture().set_bit());
        Ok(())
    }

    /// Handle DCMI interrupts. Run this in the DCMI_PSSI ISR. Handles one event per call:
    /// frame, VSYNC, line, then errors.
    pub fn irq_handler(&mut self) {
        let mis = self.regs.mis().read();

        if mis.frame_mis().bit_is_set() {
            if self.snapshot() {
                self.regs.ier().modify(|_, w| {
                    w.line_ie().clear_bit();
                    w.vsync_ie().clear_bit();
                    w.ovr_ie().clear_bit();
                    w.err_ie().clear_bit()
                });
            }
            self.regs.ier().modify(|_, w| w.frame_ie().clear_bit());
            self.regs.icr().write(|w| w.frame_isc().set_bit());
            (self.callbacks.pipe_frame_event)(self);
            return;
        }

        if mis.vsync_mis().bit_is_set() {
            self.regs.icr().write(|w| w.vsync_isc().set_bit());
            self.xfer_count = self.xfer_number;
            (self.callbacks.pipe_vsync_event)(self);
            return;
        }

        if mis.line_mis().bit_is_set() {
            self.regs.icr().write(|w| w.line_isc().set_bit());
            (self.callbacks.pipe_line_event)(self);
            return;
        }

        let ovr = mis.ovr_mis().bit_is_set();
        if ovr || mis.err_mis().bit_is_set() {
            self.regs.ier().reset();
            self.clear_all_flags();

            if ovr {
                self.last_error_codes |= DcmiError::Overrun as u32;
                self.abort_dma(AbortReason::Overrun);
            } else {
                self.last_error_codes |= DcmiError::Sync as u32;
                // A sync error stops the DMA transfer too; `error` runs once it's aborted.
                self.abort_dma(AbortReason::Sync);
            }
        }
    }

    /// Run this in the ISR of the DMA channel set with `set_dma`.
    pub fn dma_irq_handler(&mut self) {
        let Some(dma) = self.dma.as_mut() else {
            return;
        };
        let circular = dma.is_circular();

        match dma.irq_handler() {
            Some(DmaEvent::Complete) => self.block_complete(circular),
            Some(DmaEvent::Error(_)) => {
                self.last_error_codes |= DcmiError::Dma as u32;
                self.regs.cr().modify(|_, w| w.enable().clear_bit());
                self.pipe_state = PipeState::Idle;
                (self.callbacks.pipe_error)(self);
            }
            Some(DmaEvent::Aborted) => self.finish_abort(),
            _ => (),
        }
    }

    /// Move on to the next block of the frame, or wrap to the start of the buffer.
    fn block_complete(&mut self, circular: bool) {
        if self.pipe_state != PipeState::Active {
            return;
        }

        let addr = if self.xfer_count == 0 {
            if self.snapshot() {
                self.pipe_state = PipeState::Idle;
                return;
            }
            self.xfer_count = self.xfer_number;
            self.regs.ier().modify(|_, w| w.frame_ie().set_bit());
            self.buf_addr
        } else {
            let block = self.xfer_number - self.xfer_count + 1;
            self.xfer_count -= 1;
            self.buf_addr.wrapping_add(block * self.xfer_size)
        };

        // A circular channel re-arms itself.
        if circular {
            return;
        }

        if self.start_block(addr).is_err() {
            self.last_error_codes |= DcmiError::Dma as u32;
            self.regs
                .cr()
                .modify(|_, w| w.enable().clear_bit().capture().clear_bit());
            self.pipe_state = PipeState::Idle;
            (self.callbacks.pipe_error)(self);
        }
    }

    /// Bytes left in the current DMA block.
    pub fn data_counter(&self) -> u32 {
        self.dma.as_ref().map(|d| d.remaining_bytes()).unwrap_or(0)
    }

    pub fn register_error_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.error = cb;
    }

    pub fn register_pipe_error_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.pipe_error = cb;
    }

    pub fn register_pipe_stop_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.pipe_stop = cb;
    }

    pub fn register_pipe_frame_event_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.pipe_frame_event = cb;
    }

    pub fn register_pipe_vsync_event_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.pipe_vsync_event = cb;
    }

    pub fn register_pipe_line_event_callback(&mut self, cb: fn(&mut Self)) {
        self.callbacks.pipe_line_event = cb;
    }

    pub fn state(&self) -> DcmiState {
        self.state
    }

    pub fn pipe_state(&self) -> PipeState {
        self.pipe_state
    }

    /// A bitmask of `DcmiError` values.
    pub fn last_error_codes(&self) -> u32 {
        self.last_error_codes
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::{
        dma::{
            ChannelCfg, DataWidth, Direction, DmaInput, DmaMode, SUSPF, TCF, tests::fake_channel,
        },
        util::{fake, peek, poke},
    };

    type Regs = &'static pac::dcmi::RegisterBlock;
    type GpdmaRegs = &'static pac::gpdma1::RegisterBlock;

    // Interrupt bits, shared by RIS, IER, MIS and ICR.
    const FRAME: u32 = 1 << 0;
    const OVR: u32 = 1 << 1;
    const ERR: u32 = 1 << 2;
    const VSYNC: u32 = 1 << 3;
    const LINE: u32 = 1 << 4;

    fn setup() -> (Regs, Dcmi<Regs>) {
        let regs: Regs = fake();
        let rcc: &pac::rcc::RegisterBlock = fake();
        let mut dcmi = Dcmi::new(regs, rcc);
        assert!(rcc.ahb2enr1().read().dcmi_pssien().bit_is_set());
        assert_eq!(dcmi.state(), DcmiState::Init);
        assert_eq!(dcmi.pipe_state(), PipeState::Reset);

        dcmi.set_config(&DcmiConfig::default()).unwrap();
        (regs, dcmi)
    }

    fn with_dma(dcmi: &mut Dcmi<Regs>, mode: DmaMode) -> GpdmaRegs {
        let (dma_regs, ch) = fake_channel(
            7,
            &ChannelCfg {
                request: DmaInput::DcmiPssi,
                direction: Direction::PeriphToMem,
                src_width: DataWidth::Bits32,
                dst_width: DataWidth::Bits32,
                src_incr: false,
                dst_incr: true,
                mode,
                ..Default::default()
            },
        );
        dcmi.set_dma(ch).unwrap();
        dma_regs
    }

    #[test]
    fn config_writes_control_and_codes() {
        let (regs, mut dcmi) = setup();
        let cfg = DcmiConfig {
            sync: SyncMode::Embedded {
                codes: SyncCodes {
                    frame_start: 0xFF,
                    line_start: 0x80,
                    line_end: 0x9D,
                    frame_end: 0xB6,
                },
                unmask: SyncCodes {
                    frame_start: 0xFF,
                    line_start: 0xFF,
                    line_end: 0xFF,
                    frame_end: 0xFF,
                },
            },
            pixel_clock: PixelClockPolarity::Rising,
            rate: CaptureRate::OneOfFour,
            bus_width: BusWidth::Bits10,
            ..Default::default()
        };
        dcmi.set_config(&cfg).unwrap();

        let cr = regs.cr().read();
        assert!(cr.ess().bit_is_set());
        assert!(cr.pckpol().bit_is_set());
        assert_eq!(cr.fcrc().bits(), 2);
        assert_eq!(cr.edm().bits(), 1);
        assert_eq!(regs.escr().read().bits(), 0xB69D_80FF);
        assert_eq!(regs.esur().read().bits(), 0xFFFF_FFFF);
        assert_eq!(dcmi.config(), Some(&cfg));
        assert_eq!(dcmi.state(), DcmiState::Configured);
        assert_eq!(dcmi.pipe_state(), PipeState::Idle);

        dcmi.set_config_pipe(&PipeConfig {
            byte_select: ByteSelect::OneOfTwo,
            byte_start: SelectStart::Second,
            line_select: LineSelect::OneOfTwo,
            line_start: SelectStart::First,
        })
        .unwrap();
        let cr = regs.cr().read();
        assert_eq!(cr.bsm().bits(), 1);
        assert!(cr.oebs().bit_is_set());
        assert!(cr.lsm().bit_is_set());
        assert!(cr.oels().bit_is_clear());
    }

    #[test]
    fn crop_window() {
        let (regs, mut dcmi) = setup();
        assert_eq!(dcmi.set_config_crop(0, 0, 0, 10), Err(Error::InvalidParam));

        dcmi.set_config_crop(8, 4, 640, 480).unwrap();
        assert_eq!(regs.cwstrt().read().hoffcnt().bits(), 8);
        assert_eq!(regs.cwstrt().read().vst().bits(), 4);
        assert_eq!(regs.cwsize().read().capcnt().bits(), 639);
        assert_eq!(regs.cwsize().read().vline().bits(), 479);

        dcmi.enable_crop().unwrap();
        assert!(dcmi.is_enabled_crop());
        dcmi.disable_crop().unwrap();
        assert!(!dcmi.is_enabled_crop());
    }

    #[test]
    fn large_snapshot_is_split_into_blocks() {
        let (regs, mut dcmi) = setup();
        let dma_regs = with_dma(&mut dcmi, DmaMode::Normal);
        let r = dma_regs.ch(7);

        // 128kB: four 32kB blocks.
        let mut frame = vec![0u32; 0x8000];
        let base = frame.as_mut_ptr() as u32;
        unsafe {
            dcmi.start_pipe_dma(CaptureMode::Snapshot, &mut frame, OptIt::Line)
                .unwrap()
        };
        assert_eq!(dcmi.pipe_state(), PipeState::Active);
        let cr = regs.cr().read();
        assert!(cr.cm().bit_is_set());
        assert!(cr.capture().bit_is_set());
        assert!(cr.enable().bit_is_set());
        assert!(regs.ier().read().line_ie().bit_is_set());
        assert!(regs.ier().read().frame_ie().bit_is_set());
        assert_eq!(r.sar().read().bits(), dma::reg_addr(regs.dr()));
        assert_eq!(r.dar().read().bits(), base);
        assert_eq!(r.br1().read().bndt().bits(), 0x8000);

        poke(r.sr(), TCF);
        for block in 1..4 {
            dcmi.dma_irq_handler();
            assert_eq!(r.dar().read().bits(), base.wrapping_add(block * 0x8000));
        }
        assert_eq!(dcmi.pipe_state(), PipeState::Active);

        // Last block: the snapshot is done.
        dcmi.dma_irq_handler();
        assert_eq!(dcmi.pipe_state(), PipeState::Idle);
    }

    #[test]
    fn continuous_capture_wraps_to_buffer_start() {
        let (regs, mut dcmi) = setup();
        let dma_regs = with_dma(&mut dcmi, DmaMode::Normal);
        let r = dma_regs.ch(7);

        // 64kB: two blocks.
        let mut frame = vec![0u32; 0x4000];
        let base = frame.as_mut_ptr() as u32;
        unsafe {
            dcmi.start_pipe_dma(CaptureMode::Continuous, &mut frame, OptIt::None)
                .unwrap()
        };
        assert!(regs.ier().read().line_ie().bit_is_clear());

        poke(r.sr(), TCF);
        dcmi.dma_irq_handler();
        assert_eq!(r.dar().read().bits(), base.wrapping_add(0x8000));

        regs.ier().modify(|_, w| w.frame_ie().clear_bit());
        dcmi.dma_irq_handler();
        assert_eq!(r.dar().read().bits(), base);
        assert!(regs.ier().read().frame_ie().bit_is_set());
        assert_eq!(dcmi.pipe_state(), PipeState::Active);
    }

    #[test]
    fn start_checks_buffer_and_dma() {
        let (_regs, mut dcmi) = setup();
        let mut frame = [0u32; 16];
        assert_eq!(
            unsafe { dcmi.start_pipe_dma(CaptureMode::Snapshot, &mut frame, OptIt::None) },
            Err(Error::InvalidParam)
        );

        with_dma(&mut dcmi, DmaMode::Circular);
        // Splitting needs a normal mode channel.
        let mut big = vec![0u32; 0x8000];
        assert_eq!(
            unsafe { dcmi.start_pipe_dma(CaptureMode::Continuous, &mut big, OptIt::None) },
            Err(Error::InvalidParam)
        );
        assert_eq!(dcmi.pipe_state(), PipeState::Idle);

        unsafe {
            dcmi.start_pipe_dma(CaptureMode::Continuous, &mut frame, OptIt::None)
                .unwrap()
        };
        assert_eq!(
            unsafe { dcmi.start_pipe_dma(CaptureMode::Continuous, &mut frame, OptIt::None) },
            Err(Error::Busy)
        );
    }

    static FRAMES: AtomicU32 = AtomicU32::new(0);
    static VSYNCS: AtomicU32 = AtomicU32::new(0);
    static LINES: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn irq_handles_one_event_in_order() {
        let (regs, mut dcmi) = setup();
        with_dma(&mut dcmi, DmaMode::Circular);
        dcmi.register_pipe_frame_event_callback(|_| {
            FRAMES.fetch_add(1, Ordering::Relaxed);
        });
        dcmi.register_pipe_vsync_event_callback(|_| {
            VSYNCS.fetch_add(1, Ordering::Relaxed);
        });
        dcmi.register_pipe_line_event_callback(|_| {
            LINES.fetch_add(1, Ordering::Relaxed);
        });

        let mut frame = [0u32; 64];
        unsafe {
            dcmi.start_pipe_dma(CaptureMode::Snapshot, &mut frame, OptIt::Line)
                .unwrap()
        };

        poke(regs.mis(), FRAME | VSYNC | LINE);
        dcmi.irq_handler();
        assert_eq!(FRAMES.load(Ordering::Relaxed), 1);
        assert_eq!(VSYNCS.load(Ordering::Relaxed), 0);
        // Snapshot: all interrupts are off after the frame.
        assert_eq!(regs.ier().read().bits(), 0);
        assert_eq!(peek(regs.icr()), FRAME);

        poke(regs.mis(), VSYNC | LINE);
        dcmi.irq_handler();
        assert_eq!(VSYNCS.load(Ordering::Relaxed), 1);
        assert_eq!(LINES.load(Ordering::Relaxed), 0);

        poke(regs.mis(), LINE);
        dcmi.irq_handler();
        assert_eq!(LINES.load(Ordering::Relaxed), 1);
    }

    static PIPE_ERRORS: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn overrun_aborts_dma_then_reports() {
        let (regs, mut dcmi) = setup();
        let dma_regs = with_dma(&mut dcmi, DmaMode::Circular);
        dcmi.register_pipe_error_callback(|_| {
            PIPE_ERRORS.fetch_add(1, Ordering::Relaxed);
        });

        let mut frame = [0u32; 64];
        unsafe {
            dcmi.start_pipe_dma(CaptureMode::Continuous, &mut frame, OptIt::None)
                .unwrap()
        };

        poke(regs.mis(), OVR);
        dcmi.irq_handler();
        assert_eq!(regs.ier().read().bits(), 0);
        assert_eq!(dcmi.last_error_codes(), DcmiError::Overrun as u32);
        // Waiting on the DMA abort.
        assert_eq!(PIPE_ERRORS.load(Ordering::Relaxed), 0);

        poke(dma_regs.ch(7).sr(), SUSPF);
        dcmi.dma_irq_handler();
        assert_eq!(PIPE_ERRORS.load(Ordering::Relaxed), 1);
        assert_eq!(dcmi.pipe_state(), PipeState::Idle);
        assert!(regs.cr().read().enable().bit_is_clear());
    }

    static SYNC_ERRORS: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn sync_error_without_dma_finishes_at_once() {
        let (regs, mut dcmi) = setup();
        dcmi.register_error_callback(|_| {
            SYNC_ERRORS.fetch_add(1, Ordering::Relaxed);
        });
        regs.cr().modify(|_, w| w.enable().set_bit());

        poke(regs.mis(), ERR);
        dcmi.irq_handler();
        assert_eq!(dcmi.last_error_codes(), DcmiError::Sync as u32);
        assert_eq!(SYNC_ERRORS.load(Ordering::Relaxed), 1);
        assert!(regs.cr().read().enable().bit_is_clear());
    }

    static DMA_SYNC_ERRORS: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn sync_error_reports_once_dma_is_aborted() {
        let (regs, mut dcmi) = setup();
        let dma_regs = with_dma(&mut dcmi, DmaMode::Circular);
        dcmi.register_error_callback(|_| {
            DMA_SYNC_ERRORS.fetch_add(1, Ordering::Relaxed);
        });

        let mut frame = [0u32; 64];
        unsafe {
            dcmi.start_pipe_dma(CaptureMode::Continuous, &mut frame, OptIt::None)
                .unwrap()
        };

        poke(regs.mis(), ERR);
        dcmi.irq_handler();
        assert_eq!(dcmi.last_error_codes(), DcmiError::Sync as u32);
        // The DMA channel is suspending; the error isn't reported yet.
        assert!(dma_regs.ch(7).cr().read().susp().bit_is_set());
        assert_eq!(DMA_SYNC_ERRORS.load(Ordering::Relaxed), 0);
        assert!(regs.cr().read().enable().bit_is_set());

        poke(dma_regs.ch(7).sr(), SUSPF);
        dcmi.dma_irq_handler();
        assert_eq!(DMA_SYNC_ERRORS.load(Ordering::Relaxed), 1);
        assert_eq!(dcmi.pipe_state(), PipeState::Idle);
        assert!(regs.cr().read().enable().bit_is_clear());
    }

    static STOPS: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn suspend_resume_and_stop() {
        let (regs, mut dcmi) = setup();
        let dma_regs = with_dma(&mut dcmi, DmaMode::Circular);
        dcmi.register_pipe_stop_callback(|_| {
            STOPS.fetch_add(1, Ordering::Relaxed);
        });

        let mut frame = [0u32; 64];
        unsafe {
            dcmi.start_pipe_dma(CaptureMode::Continuous, &mut frame, OptIt::None)
                .unwrap()
        };

        dcmi.suspend_pipe().unwrap();
        assert_eq!(dcmi.pipe_state(), PipeState::Suspend);
        assert!(regs.cr().read().capture().bit_is_clear());
        assert_eq!(dcmi.suspend_pipe(), Err(Error::Busy));

        dcmi.resume_pipe().unwrap();
        assert!(regs.cr().read().capture().bit_is_set());

        dcmi.stop_pipe(0).unwrap();
        assert_eq!(dcmi.pipe_state(), PipeState::Abort);
        assert!(regs.cr().read().capture().bit_is_clear());

        poke(dma_regs.ch(7).sr(), SUSPF);
        dcmi.dma_irq_handler();
        assert_eq!(STOPS.load(Ordering::Relaxed), 1);
        assert_eq!(dcmi.pipe_state(), PipeState::Idle);
        assert!(regs.cr().read().enable().bit_is_clear());
    }

    #[test]
    fn deinit_resets() {
        let (regs, mut dcmi) = setup();
        regs.cr().modify(|_, w| w.enable().set_bit());
        dcmi.deinit().unwrap();
        assert!(regs.cr().read().enable().bit_is_clear());
        assert_eq!(dcmi.state(), DcmiState::Reset);
        assert_eq!(dcmi.pipe_state(), PipeState::Reset);
        assert_eq!(dcmi.set_config(&DcmiConfig::default()), Err(Error::Busy));
    }
}
