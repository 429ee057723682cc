//! An in-memory simulated controller.
//!
//! [`SimController`] hands out an SPI device, the reset and interrupt lines
//! and a delay provider that all share one simulated state. Every
//! transaction is recorded, reads are answered from configurable contents
//! (event bursts, host buffer header, heat map, host data page) and the
//! flash programming registers are modelled closely enough to rebuild the
//! flash contents an update produced.
//!
//! Requires `std`; meant for host-side tests only.

extern crate std;

use core::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec;
use std::vec::Vec;

use embassy_time::Duration;
use embedded_hal::digital;
use embedded_hal::spi::ErrorKind;
use embedded_hal_async::spi::Operation;

use crate::conf::{Config, FlashLayout};
use crate::op::*;
use crate::StTouchpad;

/// The driver wired to a simulated controller.
pub type SimTouchpad = StTouchpad<SimSpi, SimResetPin, SimIntPin, SimDelay>;

/// One recorded SPI transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Concatenation of every written byte.
    pub tx: Vec<u8>,
    /// Whether the transaction read a response.
    pub read: bool,
}

struct SimState {
    log: Vec<Transaction>,
    ready_pending: bool,
    answer_reset: bool,
    bursts: VecDeque<[u8; BURST_SIZE]>,
    buffer_header: [u8; BUFFER_HEADER_LEN],
    heat_map: Vec<u8>,
    host_buffer_reads: Vec<u16>,
    host_page: Option<[u8; SYSTEM_INFO_LEN]>,
    irq_cycles: u32,
    irq_line_broken: bool,
    acks: u32,
    fail_transfers: u32,
    fail_frames: Vec<Vec<u8>>,
    flash_busy_polls: u32,
    flash_status_reads: u32,
    staging: Vec<u8>,
    flash: Vec<u8>,
    calibration: (usize, usize),
    dma_config: Option<[u8; 12]>,
    erases: u32,
    commits: u32,
    slept_ns: u64,
}

impl SimState {
    fn respond(&mut self, tx: &[u8]) -> Vec<u8> {
        let mut rx = vec![0u8; DUMMY_BYTES];
        match tx.first().copied() {
            Some(op) if op == Command::ReadAllEvents as u8 => {
                if self.ready_pending {
                    self.ready_pending = false;
                    rx.extend_from_slice(&Event::ControllerReady.encode());
                } else if let Some(burst) = self.bursts.pop_front() {
                    rx.extend_from_slice(&burst);
                }
            }
            Some(op) if op == Command::ReadSpiHostBuffer as u8 => {
                let addr = u16::from_be_bytes([tx[1], tx[2]]);
                self.host_buffer_reads.push(addr);
                if addr == 0 {
                    rx.extend_from_slice(&self.buffer_header);
                } else {
                    rx.extend_from_slice(&self.heat_map);
                }
            }
            Some(op) if op == Command::ReadHostDataMemory as u8 => {
                if let Some(page) = &self.host_page {
                    rx.extend_from_slice(page);
                }
            }
            Some(op) if op == Command::ReadHwReg as u8 => {
                self.flash_status_reads += 1;
                if self.flash_busy_polls > 0 {
                    self.flash_busy_polls -= 1;
                    rx.push(FLASH_BUSY);
                } else {
                    rx.push(0x00);
                }
            }
            _ => {}
        }
        rx
    }

    fn execute(&mut self, tx: &[u8]) {
        match tx {
            [op] if *op == Command::SpiHostBufferAck as u8 => {
                self.acks += 1;
                self.irq_cycles = self.irq_cycles.saturating_sub(1);
            }
            [op, sub, mem_id] if *op == Command::WriteSystemCommand as u8
                && *sub == SystemCommand::LoadHostData as u8 =>
            {
                if let Some(page) = &mut self.host_page {
                    let count = u16::from_le_bytes([page[2], page[3]]).wrapping_add(1);
                    page[0] = HOST_DATA_MAGIC;
                    page[1] = *mem_id;
                    page[2..4].copy_from_slice(&count.to_le_bytes());
                }
            }
            [op, a0, a1, a2, a3, data @ ..] if *op == Command::WriteHwReg as u8 => {
                let addr = u32::from_be_bytes([*a0, *a1, *a2, *a3]);
                self.write_hwreg(addr, data);
            }
            _ => {}
        }
    }

    fn write_hwreg(&mut self, addr: u32, data: &[u8]) {
        if (FLASH_BUFFER_BASE..REG_HOLD_CORE).contains(&addr) {
            let at = (addr - FLASH_BUFFER_BASE) as usize;
            self.staging[at..at + data.len()].copy_from_slice(data);
        } else if addr == REG_FLASH_ERASE && data == [0xA0] {
            self.erases += 1;
            let (cx_start, cx_end) = self.calibration;
            for (i, b) in self.flash.iter_mut().enumerate() {
                if !(cx_start..cx_end).contains(&i) {
                    *b = 0xFF;
                }
            }
        } else if addr == REG_FLASH_DMA_CONFIG {
            let mut frame = [0u8; 12];
            frame[..5].copy_from_slice(&hwreg8_frame(addr, 0)[..5]);
            frame[5..5 + data.len()].copy_from_slice(data);
            self.dma_config = Some(frame);
        } else if addr == REG_FLASH_DMA && data == [0xC0] {
            if let Some(frame) = self.dma_config {
                let offset = u16::from_le_bytes([frame[7], frame[8]]) as usize * 4;
                let len = (u16::from_le_bytes([frame[9], frame[10]]) as usize + 1) * 4;
                let len = len.min(self.flash.len() - offset);
                self.flash[offset..offset + len].copy_from_slice(&self.staging[..len]);
                self.commits += 1;
            }
        }
    }
}

/// Handle to a simulated controller, used to script it and to inspect what
/// the driver did.
#[derive(Clone)]
pub struct SimController {
    state: Rc<RefCell<SimState>>,
}

impl Default for SimController {
    fn default() -> Self {
        Self::new()
    }
}

impl SimController {
    /// A controller with the default flash layout, blank flash and no
    /// queued events.
    pub fn new() -> Self {
        Self::with_layout(FlashLayout::default())
    }

    /// A controller whose flash matches `layout`.
    pub fn with_layout(layout: FlashLayout) -> Self {
        let state = SimState {
            log: Vec::new(),
            ready_pending: false,
            answer_reset: true,
            bursts: VecDeque::new(),
            buffer_header: [0x00, 0, 0, 0, 0, 0, 0, 1],
            heat_map: vec![0u8; HEAT_MAP_RAW_LEN],
            host_buffer_reads: Vec::new(),
            host_page: None,
            irq_cycles: 0,
            irq_line_broken: false,
            acks: 0,
            fail_transfers: 0,
            fail_frames: Vec::new(),
            flash_busy_polls: 0,
            flash_status_reads: 0,
            staging: vec![0u8; layout.flash_buffer_size as usize],
            flash: vec![0xFFu8; layout.image_size as usize],
            calibration: (
                layout.calibration_start as usize,
                layout.calibration_end as usize,
            ),
            dma_config: None,
            erases: 0,
            commits: 0,
            slept_ns: 0,
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Creates a driver talking to this controller.
    pub fn touchpad(&self, conf: Config) -> SimTouchpad {
        StTouchpad::new(
            SimSpi {
                state: self.state.clone(),
            },
            (
                SimResetPin {
                    state: self.state.clone(),
                },
                SimIntPin {
                    state: self.state.clone(),
                },
            ),
            SimDelay {
                state: self.state.clone(),
            },
            conf,
        )
    }

    /// Queues one event burst, returned by the next event read.
    pub fn push_burst(&self, events: &[Event]) {
        let mut raw = [0u8; BURST_SIZE];
        for (slot, event) in raw.chunks_exact_mut(EVENT_SIZE).zip(events) {
            slot.copy_from_slice(&event.encode());
        }
        self.state.borrow_mut().bursts.push_back(raw);
    }

    /// Sets the host buffer header returned from now on.
    pub fn set_buffer_header(&self, raw: [u8; BUFFER_HEADER_LEN]) {
        self.state.borrow_mut().buffer_header = raw;
    }

    /// Sets the raw heat map returned from now on.
    pub fn set_heat_map(&self, raw: &[u8; HEAT_MAP_RAW_LEN]) {
        self.state.borrow_mut().heat_map = raw.to_vec();
    }

    /// Sets the host data memory page.
    pub fn set_host_page(&self, page: [u8; SYSTEM_INFO_LEN]) {
        self.state.borrow_mut().host_page = Some(page);
    }

    /// Loads a valid system info page for firmware release `release`.
    pub fn with_system_info(&self, release: u64) {
        self.set_host_page(system_info_page(release));
    }

    /// Makes the controller stay silent after a reset.
    pub fn mute_after_reset(&self) {
        self.state.borrow_mut().answer_reset = false;
    }

    /// Holds the interrupt line low for the next `cycles` acknowledgements.
    pub fn raise_irq(&self, cycles: u32) {
        self.state.borrow_mut().irq_cycles = cycles;
    }

    /// Makes every read of the interrupt line fail while `broken`.
    pub fn break_irq_line(&self, broken: bool) {
        self.state.borrow_mut().irq_line_broken = broken;
    }

    /// Makes the next `count` reading transactions fail.
    pub fn fail_next_transfers(&self, count: u32) {
        self.state.borrow_mut().fail_transfers = count;
    }

    /// Makes the next write of exactly `frame` fail.
    pub fn fail_write(&self, frame: &[u8]) {
        self.state.borrow_mut().fail_frames.push(frame.to_vec());
    }

    /// Makes the next `polls` flash status reads answer busy.
    pub fn set_flash_busy_polls(&self, polls: u32) {
        self.state.borrow_mut().flash_busy_polls = polls;
    }

    /// Every successful transaction, in order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.borrow().log.clone()
    }

    /// The bytes of every successful write-only transaction, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state
            .borrow()
            .log
            .iter()
            .filter(|t| !t.read)
            .map(|t| t.tx.clone())
            .collect()
    }

    /// Forgets the recorded transactions.
    pub fn clear_log(&self) {
        self.state.borrow_mut().log.clear();
    }

    /// Writes into the flash staging buffer as `(device address, data)`.
    pub fn chunk_writes(&self) -> Vec<(u32, Vec<u8>)> {
        self.writes()
            .into_iter()
            .filter(|w| w.len() > 5 && w[0] == Command::WriteHwReg as u8)
            .filter_map(|w| {
                let addr = u32::from_be_bytes([w[1], w[2], w[3], w[4]]);
                (FLASH_BUFFER_BASE..REG_HOLD_CORE)
                    .contains(&addr)
                    .then(|| (addr, w[5..].to_vec()))
            })
            .collect()
    }

    /// Addresses of every host buffer read.
    pub fn host_buffer_reads(&self) -> Vec<u16> {
        self.state.borrow().host_buffer_reads.clone()
    }

    /// Number of host buffer acknowledgements.
    pub fn ack_count(&self) -> u32 {
        self.state.borrow().acks
    }

    /// Number of flash erases.
    pub fn erase_count(&self) -> u32 {
        self.state.borrow().erases
    }

    /// Number of DMA commits.
    pub fn commit_count(&self) -> u32 {
        self.state.borrow().commits
    }

    /// The last DMA configuration frame written.
    pub fn last_dma_config(&self) -> Option<[u8; 12]> {
        self.state.borrow().dma_config
    }

    /// Number of flash status reads.
    pub fn flash_status_reads(&self) -> u32 {
        self.state.borrow().flash_status_reads
    }

    /// Current flash contents.
    pub fn flash(&self) -> Vec<u8> {
        self.state.borrow().flash.clone()
    }

    /// Total time the driver asked to sleep.
    pub fn slept(&self) -> Duration {
        Duration::from_micros(self.state.borrow().slept_ns / 1000)
    }
}

/// Builds a valid system info page for firmware release `release`, with a
/// chip id of `0x3936`, a firmware CRC of `0xC0FFEE00` and an 18 x 25 screen.
pub fn system_info_page(release: u64) -> [u8; SYSTEM_INFO_LEN] {
    let mut page = [0u8; SYSTEM_INFO_LEN];
    page[0] = HOST_DATA_MAGIC;
    page[1] = MEM_ID_SYSTEM_INFO;
    page[10] = 0x39;
    page[11] = 0x36;
    page[48..56].copy_from_slice(&release.to_le_bytes());
    page[56..60].copy_from_slice(&0xC0FF_EE00u32.to_le_bytes());
    page[84] = HEAT_MAP_ROWS as u8;
    page[85] = HEAT_MAP_COLS as u8;
    page
}

/// The simulated SPI device.
pub struct SimSpi {
    state: Rc<RefCell<SimState>>,
}

impl embedded_hal::spi::ErrorType for SimSpi {
    type Error = ErrorKind;
}

impl embedded_hal_async::spi::SpiDevice for SimSpi {
    async fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), ErrorKind> {
        let mut state = self.state.borrow_mut();
        let reads = operations
            .iter()
            .any(|op| matches!(op, Operation::Read(_) | Operation::Transfer(..)));

        let mut tx = Vec::new();
        for op in operations.iter() {
            match op {
                Operation::Write(bytes) | Operation::Transfer(_, bytes) => {
                    tx.extend_from_slice(bytes)
                }
                _ => {}
            }
        }

        if reads && state.fail_transfers > 0 {
            state.fail_transfers -= 1;
            return Err(ErrorKind::Other);
        }
        if !reads {
            if let Some(pos) = state.fail_frames.iter().position(|f| *f == tx) {
                state.fail_frames.remove(pos);
                return Err(ErrorKind::Other);
            }
        }

        let rx = if reads { state.respond(&tx) } else { Vec::new() };
        let mut rx = rx.into_iter();
        for op in operations.iter_mut() {
            match op {
                Operation::Read(buf) | Operation::Transfer(buf, _) => {
                    for b in buf.iter_mut() {
                        *b = rx.next().unwrap_or(0);
                    }
                }
                _ => {}
            }
        }

        if !reads {
            state.execute(&tx);
        }
        state.log.push(Transaction { tx, read: reads });
        Ok(())
    }
}

/// The simulated reset line. A falling edge makes the controller report
/// ready on the next event read.
pub struct SimResetPin {
    state: Rc<RefCell<SimState>>,
}

impl digital::ErrorType for SimResetPin {
    type Error = digital::ErrorKind;
}

impl digital::OutputPin for SimResetPin {
    fn set_low(&mut self) -> Result<(), digital::ErrorKind> {
        let mut state = self.state.borrow_mut();
        state.ready_pending = state.answer_reset;
        state.bursts.clear();
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), digital::ErrorKind> {
        Ok(())
    }
}

/// The simulated interrupt line, low while cycles raised with
/// [`SimController::raise_irq`] are not acknowledged.
pub struct SimIntPin {
    state: Rc<RefCell<SimState>>,
}

impl SimIntPin {
    fn level_low(&self) -> Result<bool, digital::ErrorKind> {
        let state = self.state.borrow();
        if state.irq_line_broken {
            return Err(digital::ErrorKind::Other);
        }
        Ok(state.irq_cycles > 0)
    }
}

impl digital::ErrorType for SimIntPin {
    type Error = digital::ErrorKind;
}

impl digital::InputPin for SimIntPin {
    fn is_high(&mut self) -> Result<bool, digital::ErrorKind> {
        self.level_low().map(|low| !low)
    }

    fn is_low(&mut self) -> Result<bool, digital::ErrorKind> {
        self.level_low()
    }
}

/// A delay provider that returns immediately and accounts the time asked for.
pub struct SimDelay {
    state: Rc<RefCell<SimState>>,
}

impl embedded_hal_async::delay::DelayNs for SimDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.state.borrow_mut().slept_ns += ns as u64;
    }
}
