//! The core implementation of the touchpad driver.

mod err;
mod update;

use embassy_time::{Duration, Instant};
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::{Operation, SpiDevice};

use crate::conf::Config;
use crate::op::*;

pub use self::err::{PinError, SpiError, TpError};
pub use self::update::{FullInitPoll, UpdatePhase};

use self::update::UpdateState;

type Pins<TRST, TINT> = (TRST, TINT);

/// A wrapper around an ST touchpad controller.
pub struct StTouchpad<TSPI, TRST, TINT, TDELAY> {
    spi: TSPI,
    rst_pin: TRST,
    int_pin: TINT,
    delay: TDELAY,
    conf: Config,
    reports: ReportBuilder,
    state: SystemState,
    irq_enabled: bool,
    system_info: Option<SystemInfo>,
    update: UpdateState,
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
    /// Creates a new driver instance. Nothing is sent until [`Self::init`].
    ///
    /// # Arguments
    ///
    /// * `spi` - An asynchronous SPI device with the controller behind its chip select.
    /// * `pins` - A tuple containing the board GPIO lines: (RESET, INT).
    /// * `delay` - Delay provider used between polls.
    /// * `conf` - Driver configuration.
    pub fn new(spi: TSPI, pins: Pins<TRST, TINT>, delay: TDELAY, conf: Config) -> Self {
        let (rst_pin, int_pin) = pins;
        let reports = ReportBuilder::new(conf.logical_max_x, conf.logical_max_y);
        Self {
            spi,
            rst_pin,
            int_pin,
            delay,
            conf,
            reports,
            state: SystemState::default(),
            irq_enabled: false,
            system_info: None,
            update: UpdateState::default(),
        }
    }

    /// The configuration this driver was created with.
    pub fn config(&self) -> &Config {
        &self.conf
    }

    /// The device modes as last confirmed.
    pub fn state(&self) -> SystemState {
        self.state
    }

    /// Whether the controller interrupt line is enabled.
    pub fn irq_enabled(&self) -> bool {
        self.irq_enabled
    }

    /// The system info read by the last successful [`Self::read_system_info`].
    pub fn system_info(&self) -> Option<&SystemInfo> {
        self.system_info.as_ref()
    }

    /// Checks if the controller holds its interrupt line low.
    pub fn is_irq_pending(&mut self) -> Result<bool, TpError<TSPIERR, TPINERR>> {
        Ok(self.int_pin.is_low().map_err(PinError::Input)?)
    }

    /// Brings the controller up: reset handshake, system info, scan start.
    pub async fn init(&mut self) -> Result<(), TpError<TSPIERR, TPINERR>> {
        self.reset().await?;
        // The firmware loads the system info page on boot.
        if let Err(err) = self.read_system_info(false).await {
            log::warn!("touchpad::init no system info: {err:?}");
        }
        self.state = SystemState::default();
        self.start_scan().await
    }

    /// Pulses the reset line and waits for the controller-ready event.
    pub async fn reset(&mut self) -> Result<(), TpError<TSPIERR, TPINERR>> {
        self.rst_pin.set_low().map_err(PinError::Output)?;
        self.sleep(self.conf.reset_pulse).await;
        self.rst_pin.set_high().map_err(PinError::Output)?;

        let policy = self.conf.reset_poll;
        for _ in 0..policy.attempts {
            let events = self.read_all_events().await?;
            if events.contains(&Event::ControllerReady) {
                log::info!("Touchpad ready");
                return Ok(());
            }
            self.sleep(policy.interval).await;
        }
        log::warn!("Timeout waiting for controller ready.");
        Err(TpError::Timeout)
    }

    /// Reads and decodes one burst of events.
    ///
    /// Error reports are logged while decoding; a major one is returned as
    /// [`TpError::MajorFault`].
    pub async fn read_all_events(&mut self) -> Result<EventBurst, TpError<TSPIERR, TPINERR>> {
        let mut raw = [0u8; BURST_SIZE];
        self.read(&[Command::ReadAllEvents as u8], &mut raw).await?;
        decode_burst(&raw, self.conf.major_error_types).map_err(|report| TpError::MajorFault {
            report_type: report.report_type,
            info: report.info,
        })
    }

    /// Reads the SPI host buffer header.
    pub async fn read_buffer_header(&mut self) -> Result<BufferHeader, TpError<TSPIERR, TPINERR>> {
        let mut raw = [0u8; BUFFER_HEADER_LEN];
        self.read(&[Command::ReadSpiHostBuffer as u8, 0x00, 0x00], &mut raw)
            .await?;
        Ok(raw.into())
    }

    /// Acknowledges the host buffer, which releases the interrupt line.
    pub async fn send_ack(&mut self) -> Result<(), TpError<TSPIERR, TPINERR>> {
        self.write(&[Command::SpiHostBufferAck as u8]).await
    }

    /// Reads from host data memory.
    pub async fn read_host_data_memory(
        &mut self,
        addr: u16,
        result: &mut [u8],
    ) -> Result<(), TpError<TSPIERR, TPINERR>> {
        let [hi, lo] = addr.to_be_bytes();
        self.read(&[Command::ReadHostDataMemory as u8, hi, lo], result)
            .await
    }

    /// Makes the controller load page `mem_id` into host data memory.
    pub async fn load_host_data(&mut self, mem_id: u8) -> Result<(), TpError<TSPIERR, TPINERR>> {
        let header = self.read_host_data_header().await?;
        if header.holds(mem_id) {
            return Ok(());
        }
        let count = header.count;

        self.write(&system_frame(SystemCommand::LoadHostData, mem_id))
            .await?;

        let policy = self.conf.host_data_poll;
        for _ in 0..policy.attempts {
            let header = self.read_host_data_header().await?;
            if header.holds(mem_id) && header.count != count {
                return Ok(());
            }
            self.sleep(policy.interval).await;
        }
        Err(TpError::Timeout)
    }

    async fn read_host_data_header(
        &mut self,
    ) -> Result<HostDataHeader, TpError<TSPIERR, TPINERR>> {
        let mut raw = [0u8; HOST_DATA_HEADER_LEN];
        self.read_host_data_memory(0x0000, &mut raw).await?;
        Ok(raw.into())
    }

    /// Reads the system info page, reloading it first if `reload` is set.
    ///
    /// The result is cached and used to locate the heat map.
    pub async fn read_system_info(
        &mut self,
        reload: bool,
    ) -> Result<SystemInfo, TpError<TSPIERR, TPINERR>> {
        if reload {
            self.load_host_data(MEM_ID_SYSTEM_INFO).await?;
        }
        let mut raw = [0u8; SYSTEM_INFO_LEN];
        self.read_host_data_memory(0x0000, &mut raw).await?;

        let info = SystemInfo::parse(&raw).ok_or(TpError::Protocol)?;
        if !info.is_valid() {
            return Err(TpError::Protocol);
        }

        log::info!("chip0_id: {:02x}{:02x}", info.chip0_id[0], info.chip0_id[1]);
        log::info!("chip0_ver: {:04x}", info.chip0_ver);
        log::info!("scr_tx_len: {} scr_rx_len: {}", info.scr_tx_len, info.scr_rx_len);
        log::info!("release_info: {:04x}", info.release_info);

        self.system_info = Some(info);
        Ok(info)
    }

    /// Identification for the firmware updater.
    ///
    /// Falls back to fixed values when the system info cannot be read, which
    /// happens when the firmware is corrupted.
    pub async fn get_info(&mut self) -> TouchpadInfo {
        match self.read_system_info(true).await {
            Ok(info) => TouchpadInfo::from(&info),
            Err(err) => {
                log::warn!("touchpad::get_info failed: {err:?}");
                TouchpadInfo::fallback()
            }
        }
    }

    /// Moves the controller to the requested modes.
    ///
    /// Each step is committed only after its command was sent. The first
    /// failing command aborts the sequence; steps before it stay committed.
    pub async fn update_system_state(
        &mut self,
        request: &StateRequest,
    ) -> Result<(), TpError<TSPIERR, TPINERR>> {
        for step in plan(&self.state, request) {
            if let Some(frame) = step.frame() {
                self.write(&frame).await?;
            }
            step.apply(&mut self.state);
            log::debug!("touchpad::state {step:?}");
        }
        Ok(())
    }

    /// Enables or disables the controller interrupt line.
    pub async fn enable_interrupt(&mut self, enable: bool) -> Result<(), TpError<TSPIERR, TPINERR>> {
        if enable {
            self.irq_enabled = true;
        }
        let result = self
            .write(&system_frame(SystemCommand::InterruptEnable, enable as u8))
            .await;
        if !enable {
            self.irq_enabled = false;
        }
        result
    }

    /// Starts active scanning with dome-switch reporting.
    pub async fn start_scan(&mut self) -> Result<(), TpError<TSPIERR, TPINERR>> {
        self.update_system_state(&StateRequest::START_SCAN).await?;
        self.send_ack().await?;
        self.enable_interrupt(true).await
    }

    /// Stops scanning. The interrupt line is disabled even if the mode
    /// change fails.
    pub async fn stop_scan(&mut self) -> Result<(), TpError<TSPIERR, TPINERR>> {
        let result = self.update_system_state(&StateRequest::STOP_SCAN).await;
        let irq = self.enable_interrupt(false).await;
        result.and(irq)
    }

    /// Enables or disables the heat-map host buffer.
    pub async fn set_heat_map(&mut self, enable: bool) -> Result<(), TpError<TSPIERR, TPINERR>> {
        let request = if enable {
            StateRequest::HEAT_MAP_ON
        } else {
            StateRequest::HEAT_MAP_OFF
        };
        self.update_system_state(&request).await
    }

    /// Switches operator debug mode.
    pub async fn set_debug(&mut self, enable: bool) -> Result<(), TpError<TSPIERR, TPINERR>> {
        self.update_system_state(&StateRequest::debug(enable)).await
    }

    /// Reads the host buffer and builds a touch report.
    ///
    /// `timestamp` is the time of the interrupt edge. Returns `None` when no
    /// finger was reported and the dome switch did not change.
    pub async fn read_touch_report(
        &mut self,
        timestamp: Instant,
    ) -> Result<Option<TouchReport>, TpError<TSPIERR, TPINERR>> {
        let header = self.read_buffer_header().await?;
        let dome_changed = header.dome_switch_changed();
        if dome_changed {
            self.state.dome_switch_level = header.dome_switch_pressed();
        }

        let events = self.read_all_events().await?;
        Ok(self.reports.build(
            &events,
            self.state.dome_switch_level,
            dome_changed,
            timestamp,
        ))
    }

    /// Captures the heat map into `frame`, rescaled to 8 bits per pixel.
    /// `frame` should hold [`HEAT_MAP_FRAME_LEN`] bytes.
    ///
    /// Returns `false` for an empty frame. Fails with
    /// [`TpError::Unsupported`] when the firmware heat-map layout is unknown.
    pub async fn read_heat_map(
        &mut self,
        frame: &mut [u8],
    ) -> Result<bool, TpError<TSPIERR, TPINERR>> {
        let addr = self
            .system_info
            .as_ref()
            .and_then(SystemInfo::heat_map_addr)
            .ok_or(TpError::Unsupported)?;
        let [hi, lo] = addr.to_be_bytes();

        let mut raw = [0u8; HEAT_MAP_RAW_LEN];
        self.read(&[Command::ReadSpiHostBuffer as u8, hi, lo], &mut raw)
            .await?;
        Ok(rescale_frame(
            &raw,
            frame,
            self.conf.heat_map_bits_per_pixel,
            self.conf.heat_map_threshold,
        ))
    }

    async fn write(&mut self, cmd: &[u8]) -> Result<(), TpError<TSPIERR, TPINERR>> {
        log::trace!("touchpad::write {cmd:02x?}");
        self.spi.write(cmd).await.map_err(SpiError::Write)?;
        Ok(())
    }

    async fn read(&mut self, cmd: &[u8], result: &mut [u8]) -> Result<(), TpError<TSPIERR, TPINERR>> {
        let mut dummy = [0u8; DUMMY_BYTES];
        let mut ops = [
            Operation::Write(cmd),
            Operation::Read(&mut dummy),
            Operation::Read(result),
        ];
        self.spi
            .transaction(&mut ops)
            .await
            .map_err(SpiError::Transfer)?;
        Ok(())
    }

    async fn sleep(&mut self, duration: Duration) {
        self.delay.delay_us(duration.as_micros() as u32).await;
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use embassy_futures::block_on;
    use std::vec::Vec;

    use super::*;
    use crate::sim::SimController;

    fn started(sim: &SimController) -> crate::sim::SimTouchpad {
        sim.with_system_info(3);
        let mut tp = sim.touchpad(Config::default());
        block_on(tp.init()).unwrap();
        sim.clear_log();
        tp
    }

    fn finger(id: u8, x: u16, y: u16) -> PointerEvent {
        PointerEvent {
            touch_type: TouchType::Finger,
            touch_id: id,
            x,
            y,
            z: 10,
            minor: 1,
            major: 1,
            minor_high: 0,
            major_high: 0,
        }
    }

    #[test]
    fn init_starts_scanning() {
        let sim = SimController::new();
        sim.with_system_info(3);
        let mut tp = sim.touchpad(Config::default());
        block_on(tp.init()).unwrap();

        assert_eq!(
            sim.writes(),
            [
                std::vec![0xA2, 0x05, 0x02],
                std::vec![0xA0, 0x00, 0x01],
                std::vec![0xC0],
                std::vec![0xA4, 0x01, 0x01],
            ]
        );
        assert!(tp.irq_enabled());
        assert_eq!(tp.system_info().map(SystemInfo::chip_id), Some(0x3936));
    }

    #[test]
    fn silent_controller_times_out() {
        let sim = SimController::new();
        sim.mute_after_reset();
        let mut tp = sim.touchpad(Config::default());

        assert!(matches!(block_on(tp.reset()), Err(TpError::Timeout)));
        // 10 ms pulse, then 100 polls 10 ms apart.
        assert_eq!(sim.slept(), Duration::from_millis(10 + 100 * 10));
        assert!(!tp.irq_enabled());
    }

    #[test]
    fn repeated_state_request_is_silent() {
        let sim = SimController::new();
        let mut tp = started(&sim);

        block_on(tp.set_heat_map(true)).unwrap();
        let issued = sim.transactions().len();
        block_on(tp.set_heat_map(true)).unwrap();
        assert_eq!(sim.transactions().len(), issued);

        block_on(tp.start_scan()).unwrap();
        // Only the ack and the interrupt enable, no mode commands.
        assert_eq!(
            sim.writes()[issued..],
            [std::vec![0xC0], std::vec![0xA4, 0x01, 0x01]]
        );
    }

    #[test]
    fn heat_map_locks_the_scan_rate_after_the_feature_select() {
        let sim = SimController::new();
        let mut tp = started(&sim);

        block_on(tp.set_heat_map(true)).unwrap();
        assert_eq!(
            sim.writes(),
            [std::vec![0xA2, 0x05, 0x03], std::vec![0xA0, 0x03, 0x00]]
        );
    }

    #[test]
    fn failed_step_keeps_earlier_commits() {
        let sim = SimController::new();
        let mut tp = sim.touchpad(Config::default());
        sim.fail_write(&[0xA0, 0x00, 0x01]);

        assert!(matches!(block_on(tp.set_heat_map(true)), Err(TpError::Spi(_))));
        let state = tp.state();
        assert!(state.heat_map && state.dome_switch);
        assert!(!state.active_scan);
        // The lock never went out.
        assert_eq!(sim.writes(), [std::vec![0xA2, 0x05, 0x03]]);

        // Retrying only sends what is missing.
        block_on(tp.set_heat_map(true)).unwrap();
        assert_eq!(sim.writes()[1..], [std::vec![0xA0, 0x00, 0x01]]);
    }

    #[test]
    fn failed_scan_rate_lock_is_not_resent() {
        let sim = SimController::new();
        let mut tp = started(&sim);
        sim.fail_write(&[0xA0, 0x03, 0x00]);

        assert!(matches!(block_on(tp.set_heat_map(true)), Err(TpError::Spi(_))));
        let state = tp.state();
        assert!(state.heat_map && state.active_scan);
        assert_eq!(sim.writes(), [std::vec![0xA2, 0x05, 0x03]]);

        // The feature bits are committed, so nothing is left to send.
        let issued = sim.transactions().len();
        block_on(tp.set_heat_map(true)).unwrap();
        assert_eq!(sim.transactions().len(), issued);
    }

    #[test]
    fn stop_scan_disables_the_interrupt_even_on_failure() {
        let sim = SimController::new();
        let mut tp = started(&sim);
        sim.fail_write(&[0xA0, 0x00, 0x00]);

        assert!(block_on(tp.stop_scan()).is_err());
        assert!(!tp.irq_enabled());
        assert!(tp.state().active_scan);
        assert_eq!(sim.writes(), [std::vec![0xA4, 0x01, 0x00]]);
    }

    #[test]
    fn touch_report_carries_dome_switch_and_timestamp() {
        let sim = SimController::new();
        let mut tp = started(&sim);
        sim.set_buffer_header([0x04, 0, 0, 0, 0, 2, 0, 0]);
        sim.push_burst(&[
            Event::Enter(finger(0, 100, 100)),
            Event::Motion(finger(1, 200, 300)),
        ]);

        let report = block_on(tp.read_touch_report(Instant::from_micros(5_000)))
            .unwrap()
            .unwrap();
        assert!(report.button);
        assert!(tp.state().dome_switch_level);
        assert_eq!(report.count(), 2);
        assert_eq!(report.fingers[1].x, 3207 - 200);
        assert_eq!(report.fingers[1].y, 1783 - 300);
        assert_eq!(report.hid_timestamp(), 50);
        assert_eq!(sim.host_buffer_reads(), [0x0000]);
    }

    #[test]
    fn quiet_cycle_delivers_nothing() {
        let sim = SimController::new();
        let mut tp = started(&sim);
        let report = block_on(tp.read_touch_report(Instant::from_ticks(0))).unwrap();
        assert_eq!(report, None);
    }

    #[test]
    fn major_error_is_a_fault() {
        let sim = SimController::new();
        sim.with_system_info(3);
        let conf = Config {
            major_error_types: &[0x20],
            ..Config::default()
        };
        let mut tp = sim.touchpad(conf);
        block_on(tp.init()).unwrap();
        sim.push_burst(&[Event::Error(ReportEvent {
            report_type: 0x20,
            info: [0, 0, 0, 1],
        })]);

        assert!(matches!(
            block_on(tp.read_all_events()),
            Err(TpError::MajorFault {
                report_type: 0x20,
                ..
            })
        ));
    }

    #[test]
    fn heat_map_is_read_from_the_release_address() {
        let sim = SimController::new();
        let mut tp = started(&sim);
        let mut raw = [0u8; HEAT_MAP_RAW_LEN];
        raw[0..2].copy_from_slice(&1020i16.to_le_bytes());
        sim.set_heat_map(&raw);

        let mut frame = [0u8; HEAT_MAP_FRAME_LEN];
        assert!(block_on(tp.read_heat_map(&mut frame)).unwrap());
        assert_eq!(frame[0], 255);
        assert_eq!(sim.host_buffer_reads(), [0x0120]);

        sim.set_heat_map(&[0u8; HEAT_MAP_RAW_LEN]);
        assert!(!block_on(tp.read_heat_map(&mut frame)).unwrap());
    }

    #[test]
    fn unknown_release_cannot_stream() {
        let sim = SimController::new();
        sim.with_system_info(2);
        let mut tp = sim.touchpad(Config::default());
        block_on(tp.init()).unwrap();

        let mut frame = [0u8; HEAT_MAP_FRAME_LEN];
        assert!(matches!(
            block_on(tp.read_heat_map(&mut frame)),
            Err(TpError::Unsupported)
        ));
    }

    #[test]
    fn host_data_is_reloaded_only_when_missing() {
        let sim = SimController::new();
        let mut page = crate::sim::system_info_page(3);
        page[1] = 0x02;
        sim.set_host_page(page);
        let mut tp = sim.touchpad(Config::default());

        block_on(tp.load_host_data(MEM_ID_SYSTEM_INFO)).unwrap();
        assert_eq!(sim.writes(), [std::vec![0xA4, 0x06, 0x01]]);

        block_on(tp.load_host_data(MEM_ID_SYSTEM_INFO)).unwrap();
        assert_eq!(sim.writes().len(), 1);
    }

    #[test]
    fn get_info_reads_the_system_info() {
        let sim = SimController::new();
        sim.with_system_info(3);
        let mut tp = sim.touchpad(Config::default());

        let info = block_on(tp.get_info());
        assert_eq!(
            info,
            TouchpadInfo {
                vendor_id: ST_VENDOR_ID,
                chip_id: 0x3936,
                fw_version: 3,
                fw_checksum: 0xC0FF_EE00,
            }
        );
    }

    #[test]
    fn corrupted_firmware_reports_fallback_info() {
        let sim = SimController::new();
        let mut tp = sim.touchpad(Config::default());

        assert_eq!(block_on(tp.get_info()), TouchpadInfo::fallback());
        // The load was attempted and polled five times.
        assert_eq!(
            sim.writes()
                .iter()
                .filter(|w| w.as_slice() == [0xA4, 0x06, 0x01])
                .count(),
            1
        );
        assert_eq!(sim.slept(), Duration::from_millis(5 * 10));
    }

    #[test]
    fn acks_release_the_interrupt_line() {
        let sim = SimController::new();
        let mut tp = started(&sim);
        sim.raise_irq(2);

        let mut cycles = 0;
        while tp.is_irq_pending().unwrap() {
            block_on(tp.send_ack()).unwrap();
            cycles += 1;
        }
        assert_eq!(cycles, 2);
        let acks: Vec<_> = sim.writes().into_iter().filter(|w| w == &[0xC0]).collect();
        assert_eq!(acks.len(), 2);
    }

    #[test]
    fn unreadable_interrupt_line_is_an_input_error() {
        let sim = SimController::new();
        let mut tp = started(&sim);
        sim.raise_irq(1);
        sim.break_irq_line(true);

        let err = tp.is_irq_pending().unwrap_err();
        assert!(matches!(err, TpError::Pin(PinError::Input(_))));

        sim.break_irq_line(false);
        assert!(tp.is_irq_pending().unwrap());
    }
}
