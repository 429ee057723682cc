//! In-field firmware update and full panel initialization.
//!
//! The image is streamed in by the caller as chunk-aligned slices. Bytes are
//! staged in the controller's flash buffer with hardware register writes of
//! at most one DMA chunk each, then moved to flash by a DMA commit. A staged
//! batch survives across calls and is committed when it fills the flash
//! buffer, when the next byte would not be contiguous with it, or when the
//! image ends. The calibration region is never transmitted.

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::{Operation, SpiDevice};

use crate::op::*;

use super::{SpiError, StTouchpad, TpError};

/// Progress of a firmware update.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum UpdatePhase {
    /// No update running.
    #[default]
    Idle,
    /// Flash erased, image writes are accepted.
    Flashing,
    /// Image written, waiting for the full panel initialization to finish.
    Reinitializing {
        /// Polls done so far.
        polls: u32,
    },
}

/// Outcome of one [`StTouchpad::poll_full_init`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FullInitPoll {
    /// Not finished yet, poll again after the configured interval.
    Busy,
    /// Finished, the controller was re-initialized and scans again.
    Done,
}

#[derive(Copy, Clone, Debug)]
struct Batch {
    /// Image offset of the first staged byte.
    start: u32,
    /// Bytes staged so far.
    staged: u32,
}

impl Batch {
    fn end(&self) -> u32 {
        self.start + self.staged
    }
}

#[derive(Debug, Default)]
pub(super) struct UpdateState {
    phase: UpdatePhase,
    batch: Option<Batch>,
}

impl<TSPI, TRST, TINT, TDELAY, TSPIERR, TPINERR> StTouchpad<TSPI, TRST, TINT, TDELAY>
where
    TSPIERR: core::fmt::Debug,
    TPINERR: core::fmt::Debug,
    TSPI: SpiDevice<Error = TSPIERR>,
    TRST: OutputPin<Error = TPINERR>,
    TINT: InputPin<Error = TPINERR>,
    TDELAY: DelayNs,
{
    /// Progress of the firmware update.
    pub fn update_phase(&self) -> UpdatePhase {
        self.update.phase
    }

    /// Returns `true` while an update or the following re-initialization
    /// is running.
    pub fn is_updating(&self) -> bool {
        self.update.phase != UpdatePhase::Idle
    }

    /// Writes one slice of the firmware image at byte `offset`.
    ///
    /// The write at offset 0 stops scanning and erases the flash. The write
    /// reaching the image size commits what is staged and starts a full
    /// panel initialization; finish it with [`Self::poll_full_init`].
    ///
    /// A misaligned or out of range slice is rejected before any I/O. On any
    /// other failure the update is abandoned and must restart at offset 0.
    pub async fn update_write(
        &mut self,
        offset: u32,
        data: &[u8],
    ) -> Result<(), TpError<TSPIERR, TPINERR>> {
        log::info!("touchpad::update_write {offset:08x} {}", data.len());
        let layout = self.conf.flash;
        let end = u32::try_from(data.len())
            .ok()
            .and_then(|len| offset.checked_add(len))
            .ok_or(TpError::InvalidArgument)?;
        if offset % layout.dma_chunk_size != 0 || end > layout.image_size {
            return Err(TpError::InvalidArgument);
        }

        match self.update.phase {
            UpdatePhase::Reinitializing { .. } => return Err(TpError::Busy),
            UpdatePhase::Idle if offset != 0 => return Err(TpError::InvalidArgument),
            _ => {}
        }

        let result = self.write_image(offset, end, data).await;
        if let Err(err) = &result {
            log::error!("touchpad::update_write failed at {offset:08x}: {err:?}");
            self.update = UpdateState::default();
        }
        result
    }

    async fn write_image(
        &mut self,
        offset: u32,
        end: u32,
        data: &[u8],
    ) -> Result<(), TpError<TSPIERR, TPINERR>> {
        let layout = self.conf.flash;
        if offset == 0 {
            if let Err(err) = self.stop_scan().await {
                log::warn!("touchpad::update stop scan failed: {err:?}");
            }
            self.update = UpdateState::default();
            self.prepare_for_update().await?;
            self.update.phase = UpdatePhase::Flashing;
        }

        // Whatever falls into the calibration region is dropped.
        let segments = [
            (offset, end.min(layout.calibration_start)),
            (offset.max(layout.calibration_end), end),
        ];
        for (start, stop) in segments {
            if start < stop {
                let from = (start - offset) as usize;
                let to = (stop - offset) as usize;
                self.stage(start, &data[from..to]).await?;
            }
        }

        if end == layout.image_size {
            self.commit_batch().await?;
            log::info!("touchpad::update_write End update, wait for reset.");
            self.begin_full_init().await?;
        }
        Ok(())
    }

    async fn prepare_for_update(&mut self) -> Result<(), TpError<TSPIERR, TPINERR>> {
        self.write(&hwreg8_frame(REG_HOLD_CORE, 0x01)).await?;
        self.write(&hwreg8_frame(REG_FLASH_UNLOCK, 0x20)).await?;
        self.write(&hwreg8_frame(REG_FLASH_ERASE_UNLOCK, 0x03))
            .await?;

        self.write(&hwreg32_frame(REG_FLASH_ERASE_MASK, FLASH_ERASE_ALL_BUT_CX))
            .await?;
        self.write(&hwreg8_frame(REG_FLASH_ERASE_CTRL, 0x00)).await?;
        self.write(&hwreg8_frame(REG_FLASH_ERASE, 0xA0)).await?;
        self.wait_for_flash_ready(REG_FLASH_ERASE).await
    }

    /// Stages `bytes`, which start at image offset `start`.
    async fn stage(&mut self, start: u32, bytes: &[u8]) -> Result<(), TpError<TSPIERR, TPINERR>> {
        let layout = self.conf.flash;
        let mut pos = 0usize;
        while pos < bytes.len() {
            let at = start + pos as u32;
            if self.update.batch.is_some_and(|b| b.end() != at) {
                self.commit_batch().await?;
            }
            let batch = *self.update.batch.get_or_insert(Batch {
                start: at,
                staged: 0,
            });

            let room = (layout.flash_buffer_size - batch.staged) as usize;
            let len = (layout.dma_chunk_size as usize)
                .min(bytes.len() - pos)
                .min(room);
            self.write_chunk(FLASH_BUFFER_BASE + batch.staged, &bytes[pos..pos + len])
                .await?;
            pos += len;

            let staged = batch.staged + len as u32;
            self.update.batch = Some(Batch { staged, ..batch });
            if staged == layout.flash_buffer_size {
                self.commit_batch().await?;
            }
        }
        Ok(())
    }

    async fn write_chunk(&mut self, addr: u32, chunk: &[u8]) -> Result<(), TpError<TSPIERR, TPINERR>> {
        log::trace!("touchpad::write_chunk {addr:08x} {}", chunk.len());
        let a = addr.to_be_bytes();
        let header = [Command::WriteHwReg as u8, a[0], a[1], a[2], a[3]];
        let mut ops = [Operation::Write(&header), Operation::Write(chunk)];
        self.spi
            .transaction(&mut ops)
            .await
            .map_err(SpiError::Write)?;
        Ok(())
    }

    /// Moves the staged batch to flash. Does nothing if nothing is staged.
    async fn commit_batch(&mut self) -> Result<(), TpError<TSPIERR, TPINERR>> {
        let Some(batch) = self.update.batch.take() else {
            return Ok(());
        };
        if batch.staged == 0 {
            return Ok(());
        }
        log::debug!(
            "touchpad::commit {:08x} {} bytes",
            batch.start,
            batch.staged
        );
        let offset_words = (batch.start / 4) as u16;
        let words = batch.staged.div_ceil(4) as u16;
        self.write(&dma_config_frame(offset_words, words)).await?;
        self.write(&hwreg8_frame(REG_FLASH_DMA, 0xC0)).await?;
        self.wait_for_flash_ready(REG_FLASH_DMA).await
    }

    /// Polls a flash status register until its busy bit clears.
    ///
    /// Transport errors count as a failed attempt.
    async fn wait_for_flash_ready(&mut self, reg: u32) -> Result<(), TpError<TSPIERR, TPINERR>> {
        let policy = self.conf.flash_ready_poll;
        for _ in 0..policy.attempts {
            let mut status = [0u8; 1];
            match self.read(&flash_status_frame(reg), &mut status).await {
                Ok(()) if status[0] & FLASH_BUSY == 0 => return Ok(()),
                Ok(()) => {}
                Err(err) => log::trace!("touchpad::flash status read failed: {err:?}"),
            }
            self.sleep(policy.interval).await;
        }
        log::warn!("touchpad::flash {reg:08x} not ready");
        Err(TpError::Timeout)
    }

    /// Stops scanning, resets the controller and issues a full panel
    /// initialization. Finish it with [`Self::poll_full_init`].
    ///
    /// Refused with [`TpError::UpdateInProgress`] while a firmware update or
    /// a previous initialization is running.
    pub async fn start_full_init(&mut self) -> Result<(), TpError<TSPIERR, TPINERR>> {
        if self.is_updating() {
            log::warn!("touchpad::full_init refused, update in progress");
            return Err(TpError::UpdateInProgress);
        }
        self.begin_full_init().await
    }

    async fn begin_full_init(&mut self) -> Result<(), TpError<TSPIERR, TPINERR>> {
        if let Err(err) = self.stop_scan().await {
            log::warn!("touchpad::full_init stop scan failed: {err:?}");
        }
        self.update.phase = UpdatePhase::Idle;
        self.reset().await?;

        log::info!("Start full initialization");
        self.write(&FULL_PANEL_INIT).await?;
        self.update.phase = UpdatePhase::Reinitializing { polls: 0 };
        Ok(())
    }

    /// Checks once whether the full panel initialization finished.
    ///
    /// On completion the controller is brought up again with [`Self::init`].
    /// A transport error, or running out of the configured polls, ends the
    /// initialization with a failure.
    pub async fn poll_full_init(&mut self) -> Result<FullInitPoll, TpError<TSPIERR, TPINERR>> {
        let UpdatePhase::Reinitializing { polls } = self.update.phase else {
            return Err(TpError::InvalidArgument);
        };

        match self.check_command_echo(&FULL_PANEL_INIT).await {
            Ok(true) => {
                log::info!("Full panel initialization completed.");
                self.update.phase = UpdatePhase::Idle;
                self.init().await?;
                Ok(FullInitPoll::Done)
            }
            Ok(false) if polls + 1 < self.conf.full_init_poll.attempts => {
                self.update.phase = UpdatePhase::Reinitializing { polls: polls + 1 };
                Ok(FullInitPoll::Busy)
            }
            Ok(false) => {
                log::error!("Full panel initialization timed out");
                self.update.phase = UpdatePhase::Idle;
                Err(TpError::Timeout)
            }
            Err(err) => {
                log::error!("Full panel initialization failed: {err:?}");
                self.update.phase = UpdatePhase::Idle;
                Err(err)
            }
        }
    }

    async fn check_command_echo(&mut self, cmd: &[u8]) -> Result<bool, TpError<TSPIERR, TPINERR>> {
        let events = self.read_all_events().await?;
        Ok(events.iter().any(|e| e.is_echo_of(cmd)))
    }

    /// Runs an operator debug command.
    ///
    /// Only [`DEBUG_CMD_CALIBRATE`] is known; it starts a full panel
    /// initialization.
    pub async fn debug(&mut self, param: &[u8]) -> Result<(), TpError<TSPIERR, TPINERR>> {
        match param {
            [DEBUG_CMD_CALIBRATE] => self.start_full_init().await,
            _ => Err(TpError::InvalidArgument),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use embassy_futures::block_on;
    use std::vec::Vec;

    use super::*;
    use crate::conf::Config;
    use crate::sim::SimController;

    const CHUNK: usize = 32;

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    #[test]
    fn short_first_write_erases_and_stages_one_chunk() {
        let sim = SimController::new();
        let mut tp = sim.touchpad(Config::default());

        block_on(tp.update_write(0, &[0x5A; 16])).unwrap();

        assert_eq!(sim.erase_count(), 1);
        assert_eq!(sim.chunk_writes().len(), 1);
        assert_eq!(sim.chunk_writes()[0], (FLASH_BUFFER_BASE, std::vec![0x5A; 16]));
        assert_eq!(sim.commit_count(), 0);
        assert_eq!(tp.update_phase(), UpdatePhase::Flashing);
    }

    #[test]
    fn hold_and_unlock_precede_the_erase() {
        let sim = SimController::new();
        let mut tp = sim.touchpad(Config::default());
        block_on(tp.update_write(0, &[0; CHUNK])).unwrap();

        let writes = sim.writes();
        let pos = |frame: &[u8]| writes.iter().position(|w| w.as_slice() == frame).unwrap();
        let hold = pos(&hwreg8_frame(REG_HOLD_CORE, 0x01));
        let unlock = pos(&hwreg8_frame(REG_FLASH_UNLOCK, 0x20));
        let erase_unlock = pos(&hwreg8_frame(REG_FLASH_ERASE_UNLOCK, 0x03));
        let erase = pos(&hwreg8_frame(REG_FLASH_ERASE, 0xA0));
        assert!(hold < unlock && unlock < erase_unlock && erase_unlock < erase);
        // Scanning was stopped first.
        assert!(!tp.irq_enabled());
        assert!(!tp.state().active_scan);
    }

    #[test]
    fn misaligned_and_oversized_writes_do_no_io() {
        let sim = SimController::new();
        let mut tp = sim.touchpad(Config::default());

        assert!(matches!(
            block_on(tp.update_write(16, &[0; CHUNK])),
            Err(TpError::InvalidArgument)
        ));
        assert!(matches!(
            block_on(tp.update_write(128 * 1024 - 32, &[0; 64])),
            Err(TpError::InvalidArgument)
        ));
        // Continuing without a prior write at offset 0.
        assert!(matches!(
            block_on(tp.update_write(64, &[0; CHUNK])),
            Err(TpError::InvalidArgument)
        ));
        assert!(sim.writes().is_empty());
    }

    #[test]
    fn commit_fires_when_the_flash_buffer_is_full() {
        let sim = SimController::new();
        let conf = Config::default();
        let buffer = conf.flash.flash_buffer_size as usize;
        let mut tp = sim.touchpad(conf);
        let img = image(buffer + CHUNK);

        block_on(tp.update_write(0, &img[..buffer - CHUNK])).unwrap();
        assert_eq!(sim.commit_count(), 0);
        block_on(tp.update_write((buffer - CHUNK) as u32, &img[buffer - CHUNK..])).unwrap();
        assert_eq!(sim.commit_count(), 1);
        assert_eq!(
            sim.last_dma_config(),
            Some(dma_config_frame(0, (buffer / 4) as u16))
        );
        assert_eq!(sim.chunk_writes().len(), buffer / CHUNK + 1);
    }

    #[test]
    fn full_image_skips_calibration_and_lands_in_order() {
        let sim = SimController::new();
        let conf = Config::default();
        let layout = conf.flash;
        let mut tp = sim.touchpad(conf);
        let img = image(layout.image_size as usize);

        // Uneven slices, one of them straddling the calibration start.
        let cuts = [0usize, 4096, 0x1D000, 0x1E800, 0x1F000, 0x1F400];
        for (i, &from) in cuts.iter().enumerate() {
            let to = cuts.get(i + 1).copied().unwrap_or(img.len());
            block_on(tp.update_write(from as u32, &img[from..to])).unwrap();
        }

        let flash = sim.flash();
        for (i, (&got, &want)) in flash.iter().zip(img.iter()).enumerate() {
            if layout.is_calibration(i as u32) {
                assert_eq!(got, 0xFF, "calibration byte {i:#x} was written");
            } else {
                assert_eq!(got, want, "byte {i:#x}");
            }
        }
        for (addr, chunk) in sim.chunk_writes() {
            assert!(chunk.len() <= CHUNK);
            assert!(addr >= FLASH_BUFFER_BASE);
        }
        assert_eq!(
            tp.update_phase(),
            UpdatePhase::Reinitializing { polls: 0 }
        );
        assert!(sim.writes().iter().any(|w| w.as_slice() == FULL_PANEL_INIT));
    }

    #[test]
    fn flash_never_ready_times_out_and_abandons() {
        let sim = SimController::new();
        sim.set_flash_busy_polls(u32::MAX);
        let mut tp = sim.touchpad(Config::default());

        assert!(matches!(
            block_on(tp.update_write(0, &[0; CHUNK])),
            Err(TpError::Timeout)
        ));
        assert_eq!(sim.flash_status_reads(), 200);
        assert_eq!(tp.update_phase(), UpdatePhase::Idle);
    }

    #[test]
    fn flash_ready_retries_through_busy_polls() {
        let sim = SimController::new();
        sim.set_flash_busy_polls(3);
        let mut tp = sim.touchpad(Config::default());

        block_on(tp.update_write(0, &[0; CHUNK])).unwrap();
        assert_eq!(sim.flash_status_reads(), 4);
    }

    #[test]
    fn full_init_finishes_on_the_echo() {
        let sim = SimController::new();
        sim.with_system_info(3);
        let mut tp = sim.touchpad(Config::default());

        block_on(tp.debug(&[DEBUG_CMD_CALIBRATE])).unwrap();
        assert!(tp.is_updating());

        assert_eq!(block_on(tp.poll_full_init()).unwrap(), FullInitPoll::Busy);
        sim.push_burst(&[Event::Status(ReportEvent {
            report_type: STATUS_CMD_ECHO,
            info: [FULL_PANEL_INIT[0], FULL_PANEL_INIT[1], FULL_PANEL_INIT[2], 0],
        })]);
        assert_eq!(block_on(tp.poll_full_init()).unwrap(), FullInitPoll::Done);

        assert!(!tp.is_updating());
        assert!(tp.irq_enabled());
        assert!(tp.state().active_scan && tp.state().dome_switch);
        assert!(matches!(
            block_on(tp.poll_full_init()),
            Err(TpError::InvalidArgument)
        ));
    }

    #[test]
    fn full_init_poll_is_bounded() {
        let sim = SimController::new();
        let mut conf = Config::default();
        conf.full_init_poll.attempts = 3;
        let mut tp = sim.touchpad(conf);

        block_on(tp.start_full_init()).unwrap();
        assert_eq!(block_on(tp.poll_full_init()).unwrap(), FullInitPoll::Busy);
        assert_eq!(block_on(tp.poll_full_init()).unwrap(), FullInitPoll::Busy);
        assert!(matches!(block_on(tp.poll_full_init()), Err(TpError::Timeout)));
        assert!(!tp.is_updating());
    }

    #[test]
    fn full_init_transport_failure_is_terminal() {
        let sim = SimController::new();
        let mut tp = sim.touchpad(Config::default());

        block_on(tp.start_full_init()).unwrap();
        sim.fail_next_transfers(1);
        assert!(matches!(block_on(tp.poll_full_init()), Err(TpError::Spi(_))));
        assert_eq!(tp.update_phase(), UpdatePhase::Idle);
    }

    #[test]
    fn writes_during_reinitialization_are_busy() {
        let sim = SimController::new();
        let mut tp = sim.touchpad(Config::default());
        block_on(tp.start_full_init()).unwrap();
        assert!(matches!(
            block_on(tp.update_write(0, &[0; CHUNK])),
            Err(TpError::Busy)
        ));
    }

    #[test]
    fn calibrate_is_refused_while_flashing() {
        let sim = SimController::new();
        let mut tp = sim.touchpad(Config::default());
        let img = image(2 * CHUNK);

        block_on(tp.update_write(0, &img[..CHUNK])).unwrap();
        let sent = sim.writes().len();

        assert!(matches!(
            block_on(tp.debug(&[DEBUG_CMD_CALIBRATE])),
            Err(TpError::UpdateInProgress)
        ));
        assert!(matches!(
            block_on(tp.start_full_init()),
            Err(TpError::UpdateInProgress)
        ));
        assert_eq!(sim.writes().len(), sent);
        assert_eq!(tp.update_phase(), UpdatePhase::Flashing);

        // The update carries on where it was.
        block_on(tp.update_write(CHUNK as u32, &img[CHUNK..])).unwrap();
        assert_eq!(sim.erase_count(), 1);
        assert_eq!(sim.chunk_writes().len(), 2);
        assert_eq!(tp.update_phase(), UpdatePhase::Flashing);
    }

    #[test]
    fn calibrate_is_refused_while_reinitializing() {
        let sim = SimController::new();
        let mut tp = sim.touchpad(Config::default());
        block_on(tp.start_full_init()).unwrap();
        assert!(matches!(
            block_on(tp.debug(&[DEBUG_CMD_CALIBRATE])),
            Err(TpError::UpdateInProgress)
        ));
        assert_eq!(
            tp.update_phase(),
            UpdatePhase::Reinitializing { polls: 0 }
        );
    }

    #[test]
    fn unknown_debug_commands_are_rejected() {
        let sim = SimController::new();
        let mut tp = sim.touchpad(Config::default());
        assert!(matches!(block_on(tp.debug(&[0x42])), Err(TpError::InvalidArgument)));
        assert!(matches!(block_on(tp.debug(&[])), Err(TpError::InvalidArgument)));
        assert!(sim.writes().is_empty());
    }
}
