//! Command opcodes and fixed command frames.

/// Number of dummy bytes clocked out by the controller before every read
/// response.
pub const DUMMY_BYTES: usize = 1;

/// USB vendor identifier reported for ST controllers.
pub const ST_VENDOR_ID: u16 = 0x0483;

/// Chip identifier reported when the system info cannot be read.
pub const FALLBACK_CHIP_ID: u16 = 0x3936;

/// Controller command opcodes.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Read the whole event FIFO as one burst.
    ReadAllEvents = 0x87,
    /// Select a scan mode.
    WriteScanModeSelect = 0xA0,
    /// Enable or disable optional features.
    WriteFeatureSelect = 0xA2,
    /// Issue a system command.
    WriteSystemCommand = 0xA4,
    /// Read from host data memory.
    ReadHostDataMemory = 0xA6,
    /// Acknowledge the SPI host buffer, releasing the interrupt line.
    SpiHostBufferAck = 0xC0,
    /// Read from the SPI host buffer.
    ReadSpiHostBuffer = 0xC1,
    /// Write a hardware register (used by the update engine).
    WriteHwReg = 0xFA,
    /// Read a hardware register.
    ReadHwReg = 0xFB,
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> Self {
        cmd as u8
    }
}

/// Scan modes selectable with [`Command::WriteScanModeSelect`].
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScanMode {
    /// Multi-touch active scanning.
    Active = 0x00,
    /// Low power scanning.
    LowPower = 0x01,
    /// Tuning wizard.
    TuningWizard = 0x02,
    /// Locked scan rate, required to sustain heat-map throughput.
    Locked = 0x03,
}

/// Feature group addressed by [`Command::WriteFeatureSelect`].
pub const FEATURE_GROUP: u8 = 0x05;
/// Feature bit enabling the heat-map host buffer.
pub const FEATURE_HEAT_MAP: u8 = 1 << 0;
/// Feature bit enabling dome-switch reporting.
pub const FEATURE_DOME_SWITCH: u8 = 1 << 1;

/// System command sub-opcodes for [`Command::WriteSystemCommand`].
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SystemCommand {
    /// Full panel initialization (recalibration).
    FullPanelInit = 0x00,
    /// Enable or disable the interrupt line.
    InterruptEnable = 0x01,
    /// Load a page into host data memory.
    LoadHostData = 0x06,
}

/// Argument of [`SystemCommand::FullPanelInit`].
pub const FULL_PANEL_INIT_ARG: u8 = 0x03;

/// The full panel initialization frame. Its echo marks the end of the
/// initialization.
pub const FULL_PANEL_INIT: [u8; 3] = [
    Command::WriteSystemCommand as u8,
    SystemCommand::FullPanelInit as u8,
    FULL_PANEL_INIT_ARG,
];

/// Operator debug command: start a full panel initialization.
pub const DEBUG_CMD_CALIBRATE: u8 = 0x00;

/// Builds a scan mode select frame.
pub const fn scan_mode_frame(mode: ScanMode, value: u8) -> [u8; 3] {
    [Command::WriteScanModeSelect as u8, mode as u8, value]
}

/// Builds a feature select frame.
pub const fn feature_frame(heat_map: bool, dome_switch: bool) -> [u8; 3] {
    let mut features = 0;
    if heat_map {
        features |= FEATURE_HEAT_MAP;
    }
    if dome_switch {
        features |= FEATURE_DOME_SWITCH;
    }
    [Command::WriteFeatureSelect as u8, FEATURE_GROUP, features]
}

/// Builds a system command frame.
pub const fn system_frame(command: SystemCommand, arg: u8) -> [u8; 3] {
    [Command::WriteSystemCommand as u8, command as u8, arg]
}

/// Device address of the flash staging buffer filled by chunk writes.
pub const FLASH_BUFFER_BASE: u32 = 0x0010_0000;
/// Register holding the main core of the controller.
pub const REG_HOLD_CORE: u32 = 0x2000_0024;
/// Flash unlock register.
pub const REG_FLASH_UNLOCK: u32 = 0x2000_0025;
/// Flash erase unlock register.
pub const REG_FLASH_ERASE_UNLOCK: u32 = 0x2000_00DE;
/// Page mask of the erase operation.
pub const REG_FLASH_ERASE_MASK: u32 = 0x2000_0128;
/// Erase control register.
pub const REG_FLASH_ERASE_CTRL: u32 = 0x2000_006B;
/// Erase trigger register, also polled for erase completion.
pub const REG_FLASH_ERASE: u32 = 0x2000_006A;
/// DMA configuration register.
pub const REG_FLASH_DMA_CONFIG: u32 = 0x2000_0072;
/// DMA trigger register, also polled for DMA completion.
pub const REG_FLASH_DMA: u32 = 0x2000_0071;
/// Erase every page except the calibration pages.
pub const FLASH_ERASE_ALL_BUT_CX: u32 = 0xFFFF_FF83;
/// Busy bit of the flash status registers.
pub const FLASH_BUSY: u8 = 0x80;

/// Builds a hardware register write of one byte.
pub const fn hwreg8_frame(addr: u32, value: u8) -> [u8; 6] {
    let a = addr.to_be_bytes();
    [Command::WriteHwReg as u8, a[0], a[1], a[2], a[3], value]
}

/// Builds a hardware register write of one big-endian word.
pub const fn hwreg32_frame(addr: u32, value: u32) -> [u8; 9] {
    let a = addr.to_be_bytes();
    let v = value.to_be_bytes();
    [Command::WriteHwReg as u8, a[0], a[1], a[2], a[3], v[0], v[1], v[2], v[3]]
}

/// Builds the DMA configuration frame moving `words` words of the staging
/// buffer to flash word offset `offset_words`.
pub const fn dma_config_frame(offset_words: u16, words: u16) -> [u8; 12] {
    let a = REG_FLASH_DMA_CONFIG.to_be_bytes();
    let o = offset_words.to_le_bytes();
    let w = (words - 1).to_le_bytes();
    [
        Command::WriteHwReg as u8,
        a[0],
        a[1],
        a[2],
        a[3],
        0x00,
        0x00,
        o[0],
        o[1],
        w[0],
        w[1],
        0x00,
    ]
}

/// Builds a read of a flash status register.
pub const fn flash_status_frame(reg: u32) -> [u8; 5] {
    let a = reg.to_be_bytes();
    [Command::ReadHwReg as u8, a[0], a[1], a[2], a[3]]
}
