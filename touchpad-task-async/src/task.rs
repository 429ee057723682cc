//! The touchpad task and the hooks feeding it.
//!
//! [`TouchpadEvents`] is the meeting point between interrupt handlers, USB
//! callbacks and the tasks. [`TouchpadTask`] owns the touch loop,
//! [`stream_heat_map`] drains captured frames on the streaming endpoint's
//! task and [`UpdateHandle`] is what the firmware updater calls into.

use embassy_futures::select::{select3, Either3};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex as AsyncMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant};
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::SpiDevice;
use st_touchpad_async::op::{render_row, TouchReport, TouchpadInfo, HEAT_MAP_ROWS};
use st_touchpad_async::{FullInitPoll, StTouchpad, TpError, UpdatePhase};

use crate::heatmap::{FrameProducer, HeatMapPacket, HeatMapStreamer, InterruptReport, IsoSink, Sent};

/// Capacity of the control request queue.
pub const REQUEST_QUEUE_DEPTH: usize = 4;

/// Delay before a rejected heat-map transfer is tried again.
pub const ISO_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// In debug mode only every this many captured frames is rendered.
pub const DEBUG_FRAME_INTERVAL: u32 = 37;

/// The driver, shared between the touch task and the update context.
pub type SharedTouchpad<M, TSPI, TRST, TINT, TDELAY> =
    AsyncMutex<M, StTouchpad<TSPI, TRST, TINT, TDELAY>>;

/// Control requests handled by the touch task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Resume scanning.
    PowerOn,
    /// Stop scanning.
    PowerOff,
    /// Enable or disable heat-map capture.
    HeatMap(bool),
    /// Enable or disable operator debug mode.
    Debug(bool),
    /// Run a full panel initialization.
    Calibrate,
    /// Reload and log the system info.
    Version,
}

/// The host chose an alternate setting the streaming interface lacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownAlternateSetting(pub u16);

/// Receives touch reports. Delivery is fire-and-forget.
pub trait ReportSink {
    /// Hands over one report.
    fn deliver(&mut self, report: &TouchReport);
}

impl<T: ReportSink + ?Sized> ReportSink for &mut T {
    fn deliver(&mut self, report: &TouchReport) {
        T::deliver(self, report)
    }
}

/// Wake-ups and requests shared by interrupt handlers and tasks.
pub struct TouchpadEvents<M: RawMutex> {
    irq: Signal<M, Instant>,
    requests: Channel<M, Request, REQUEST_QUEUE_DEPTH>,
    full_init: Signal<M, ()>,
    iso_ready: Signal<M, ()>,
    notify: Signal<M, InterruptReport>,
}

impl<M: RawMutex> Default for TouchpadEvents<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex> TouchpadEvents<M> {
    /// Creates the event hub; usable in a `static`.
    pub const fn new() -> Self {
        Self {
            irq: Signal::new(),
            requests: Channel::new(),
            full_init: Signal::new(),
            iso_ready: Signal::new(),
            notify: Signal::new(),
        }
    }

    /// Call from the falling-edge interrupt of the controller INT line.
    ///
    /// `at` becomes the timestamp of the reports read in this cycle.
    pub fn on_interrupt(&self, at: Instant) {
        self.irq.signal(at);
    }

    /// Queues a control request. Returns `false` if the queue is full.
    pub fn request(&self, request: Request) -> bool {
        if self.requests.try_send(request).is_err() {
            log::warn!("touchpad request {request:?} dropped, queue full");
            return false;
        }
        true
    }

    /// Call on USB power management changes.
    ///
    /// Suspending without remote wakeup stops scanning, anything else
    /// resumes it.
    pub fn on_usb_pm_change(&self, suspended: bool, remote_wakeup: bool) {
        if suspended && !remote_wakeup {
            self.request(Request::PowerOff);
        } else {
            self.request(Request::PowerOn);
        }
    }

    /// Call when the host selects an alternate setting of the heat-map
    /// interface: 1 streams, 0 stops.
    pub fn on_set_interface(&self, alternate_setting: u16) -> Result<(), UnknownAlternateSetting> {
        match alternate_setting {
            1 => self.request(Request::HeatMap(true)),
            0 => self.request(Request::HeatMap(false)),
            other => return Err(UnknownAlternateSetting(other)),
        };
        Ok(())
    }

    /// Call when the isochronous endpoint can take the next packet.
    pub fn on_iso_ready(&self) {
        self.iso_ready.signal(());
    }

    /// Waits for the next report for the interrupt endpoint.
    pub async fn next_interrupt_report(&self) -> InterruptReport {
        self.notify.wait().await
    }
}

/// The touch task: services interrupts and control requests.
pub struct TouchpadTask<'a, M: RawMutex, TSPI, TRST, TINT, TDELAY, D, S> {
    touchpad: &'a SharedTouchpad<M, TSPI, TRST, TINT, TDELAY>,
    events: &'a TouchpadEvents<M>,
    producer: FrameProducer<'a, M>,
    reports: S,
    delay: D,
    debug_frames: u32,
}

impl<'a, M, TSPI, TRST, TINT, TDELAY, TSPIERR, TPINERR, D, S>
    TouchpadTask<'a, M, TSPI, TRST, TINT, TDELAY, D, S>
where
    M: RawMutex,
    TSPIERR: core::fmt::Debug,
    TPINERR: core::fmt::Debug,
    TSPI: SpiDevice<Error = TSPIERR>,
    TRST: OutputPin<Error = TPINERR>,
    TINT: InputPin<Error = TPINERR>,
    TDELAY: DelayNs,
    D: DelayNs,
    S: ReportSink,
{
    /// Creates the task.
    ///
    /// # Arguments
    ///
    /// * `touchpad` - The shared driver.
    /// * `events` - The event hub the interrupt handlers signal.
    /// * `producer` - The capturing end of the heat-map frame ring.
    /// * `reports` - Where touch reports go.
    /// * `delay` - Delay provider for the full-init polls.
    pub fn new(
        touchpad: &'a SharedTouchpad<M, TSPI, TRST, TINT, TDELAY>,
        events: &'a TouchpadEvents<M>,
        producer: FrameProducer<'a, M>,
        reports: S,
        delay: D,
    ) -> Self {
        Self {
            touchpad,
            events,
            producer,
            reports,
            delay,
            debug_frames: 0,
        }
    }

    /// Brings the controller up, then handles events forever.
    pub async fn run(&mut self) -> ! {
        self.start().await;
        loop {
            self.step().await;
        }
    }

    /// Brings the controller up.
    pub async fn start(&mut self) {
        if let Err(err) = self.touchpad.lock().await.init().await {
            log::error!("touchpad init failed: {err:?}");
        }
    }

    /// Waits for one interrupt, full-init hand-over or request and handles
    /// it.
    pub async fn step(&mut self) {
        let events = self.events;
        match select3(
            events.irq.wait(),
            events.full_init.wait(),
            events.requests.receive(),
        )
        .await
        {
            Either3::First(at) => self.service_interrupt(at).await,
            Either3::Second(()) => self.finish_full_init().await,
            Either3::Third(request) => self.handle(request).await,
        }
    }

    async fn service_interrupt(&mut self, at: Instant) {
        let touchpad = self.touchpad;
        let mut tp = touchpad.lock().await;
        if !tp.irq_enabled() {
            return;
        }

        loop {
            match tp.is_irq_pending() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    log::warn!("touchpad interrupt line unreadable: {err:?}");
                    break;
                }
            }
            let result = if tp.state().heat_map {
                self.capture(&mut tp).await
            } else {
                match tp.read_touch_report(at).await {
                    Ok(Some(report)) => {
                        self.reports.deliver(&report);
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(err) => Err(err),
                }
            };
            if let Err(err) = result {
                match err {
                    TpError::MajorFault { .. } => log::error!("touchpad fault: {err:?}"),
                    _ => log::warn!("touchpad read failed: {err:?}"),
                }
            }
            if let Err(err) = tp.send_ack().await {
                log::warn!("touchpad ack failed: {err:?}");
                break;
            }
        }
    }

    async fn capture(
        &mut self,
        tp: &mut StTouchpad<TSPI, TRST, TINT, TDELAY>,
    ) -> Result<(), TpError<TSPIERR, TPINERR>> {
        if !self.producer.is_full() {
            let mut packet = HeatMapPacket::new();
            if tp.read_heat_map(packet.frame_mut()).await? {
                packet.set_button(tp.state().dome_switch_level);
                if tp.state().debug {
                    self.print_frame(&packet);
                } else {
                    self.producer.publish(&packet);
                }
            }
        }
        if self.producer.is_pending() {
            self.events.notify.signal(InterruptReport::frame_available(true));
        }
        Ok(())
    }

    fn print_frame(&mut self, packet: &HeatMapPacket) {
        let frame_no = self.debug_frames;
        self.debug_frames = self.debug_frames.wrapping_add(1);
        if frame_no % DEBUG_FRAME_INTERVAL != 0 {
            return;
        }
        log::info!("heat map frame {frame_no}");
        for row in 0..HEAT_MAP_ROWS {
            log::info!("|{}|", render_row(packet.frame(), row));
        }
    }

    async fn handle(&mut self, request: Request) {
        log::debug!("touchpad request {request:?}");
        match request {
            Request::PowerOn | Request::PowerOff => {
                let mut tp = self.touchpad.lock().await;
                if tp.is_updating() {
                    log::warn!("touchpad {request:?} ignored during update");
                    return;
                }
                let result = if request == Request::PowerOn {
                    tp.start_scan().await
                } else {
                    tp.stop_scan().await
                };
                if let Err(err) = result {
                    log::warn!("touchpad {request:?} failed: {err:?}");
                }
            }
            Request::HeatMap(enable) => {
                if let Err(err) = self.touchpad.lock().await.set_heat_map(enable).await {
                    log::warn!("touchpad heat map {enable} failed: {err:?}");
                }
            }
            Request::Debug(enable) => {
                if let Err(err) = self.touchpad.lock().await.set_debug(enable).await {
                    log::warn!("touchpad debug {enable} failed: {err:?}");
                }
            }
            Request::Version => {
                if let Err(err) = self.touchpad.lock().await.read_system_info(true).await {
                    log::warn!("touchpad version failed: {err:?}");
                }
            }
            Request::Calibrate => {
                match self.touchpad.lock().await.start_full_init().await {
                    Ok(()) => {}
                    Err(TpError::UpdateInProgress) => {
                        log::warn!("touchpad calibrate ignored during update");
                        return;
                    }
                    Err(err) => {
                        log::error!("Full panel initialization failed: {err:?}");
                        return;
                    }
                }
                self.finish_full_init().await;
            }
        }
    }

    /// Polls the full panel initialization until it ends, sleeping between
    /// polls with the driver unlocked.
    async fn finish_full_init(&mut self) {
        loop {
            let interval = {
                let tp = self.touchpad.lock().await;
                if !matches!(tp.update_phase(), UpdatePhase::Reinitializing { .. }) {
                    return;
                }
                tp.config().full_init_poll.interval
            };
            self.delay.delay_us(interval.as_micros() as u32).await;

            // Poll failures are logged by the driver.
            match self.touchpad.lock().await.poll_full_init().await {
                Ok(FullInitPoll::Busy) => {}
                Ok(FullInitPoll::Done) | Err(_) => return,
            }
        }
    }
}

/// Drains captured frames to `sink`, one transfer per endpoint wake-up.
pub async fn stream_heat_map<M, S, D>(
    streamer: &mut HeatMapStreamer<'_, M>,
    events: &TouchpadEvents<M>,
    sink: &mut S,
    delay: &mut D,
) -> !
where
    M: RawMutex,
    S: IsoSink,
    D: DelayNs,
{
    loop {
        events.iso_ready.wait().await;
        service_streamer(streamer, events, sink, delay).await;
    }
}

/// Sends one transfer if a frame is waiting, retrying every
/// [`ISO_RETRY_INTERVAL`] until the endpoint takes it.
pub async fn service_streamer<M, S, D>(
    streamer: &mut HeatMapStreamer<'_, M>,
    events: &TouchpadEvents<M>,
    sink: &mut S,
    delay: &mut D,
) where
    M: RawMutex,
    S: IsoSink,
    D: DelayNs,
{
    loop {
        match streamer.send_packet(sink) {
            Ok(Sent::Completed) => {
                if streamer.is_pending() {
                    events.notify.signal(streamer.report());
                }
                return;
            }
            Ok(Sent::Idle | Sent::Partial) => return,
            Err(err) => {
                log::trace!("heatmap transfer rejected: {err:?}");
                delay.delay_ms(ISO_RETRY_INTERVAL.as_millis() as u32).await;
            }
        }
    }
}

/// Entry points for the firmware updater.
pub struct UpdateHandle<'a, M: RawMutex, TSPI, TRST, TINT, TDELAY> {
    touchpad: &'a SharedTouchpad<M, TSPI, TRST, TINT, TDELAY>,
    events: &'a TouchpadEvents<M>,
}

impl<'a, M, TSPI, TRST, TINT, TDELAY, TSPIERR, TPINERR> UpdateHandle<'a, M, TSPI, TRST, TINT, TDELAY>
where
    M: RawMutex,
    TSPIERR: core::fmt::Debug,
    TPINERR: core::fmt::Debug,
    TSPI: SpiDevice<Error = TSPIERR>,
    TRST: OutputPin<Error = TPINERR>,
    TINT: InputPin<Error = TPINERR>,
    TDELAY: DelayNs,
{
    /// Creates a handle; the touch task must be running on `events`.
    pub fn new(
        touchpad: &'a SharedTouchpad<M, TSPI, TRST, TINT, TDELAY>,
        events: &'a TouchpadEvents<M>,
    ) -> Self {
        Self { touchpad, events }
    }

    /// Writes `data` at `offset` of the firmware image.
    ///
    /// The write that completes the image hands the re-initialization over
    /// to the touch task.
    pub async fn write(&self, offset: u32, data: &[u8]) -> Result<(), TpError<TSPIERR, TPINERR>> {
        let mut tp = self.touchpad.lock().await;
        tp.update_write(offset, data).await?;
        if matches!(tp.update_phase(), UpdatePhase::Reinitializing { .. }) {
            self.events.full_init.signal(());
        }
        Ok(())
    }

    /// Identification of the running firmware.
    pub async fn get_info(&self) -> TouchpadInfo {
        self.touchpad.lock().await.get_info().await
    }

    /// Runs a debug command; calibration completes on the touch task.
    pub async fn debug(&self, param: &[u8]) -> Result<(), TpError<TSPIERR, TPINERR>> {
        self.touchpad.lock().await.debug(param).await?;
        self.events.full_init.signal(());
        Ok(())
    }
}
