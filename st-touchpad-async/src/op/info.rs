//! Host buffer header, host data memory and system information layouts.

/// Magic byte at the start of every host data memory page.
pub const HOST_DATA_MAGIC: u8 = 0xA5;
/// Host data memory page holding the system information.
pub const MEM_ID_SYSTEM_INFO: u8 = 0x01;

/// Size of [`BufferHeader`] on the wire.
pub const BUFFER_HEADER_LEN: usize = 8;
/// Size of [`HostDataHeader`] on the wire.
pub const HOST_DATA_HEADER_LEN: usize = 4;
/// Size of the first part of the system info page.
pub const SYSTEM_INFO_PART_1_LEN: usize = 64;
/// Reserved bytes between the two parts of the system info page.
pub const SYSTEM_INFO_PART_1_RESERVED: usize = 16;
/// Size of the second part of the system info page.
pub const SYSTEM_INFO_PART_2_LEN: usize = 8;
/// Number of bytes read for the system info page.
pub const SYSTEM_INFO_LEN: usize =
    SYSTEM_INFO_PART_1_LEN + SYSTEM_INFO_PART_1_RESERVED + SYSTEM_INFO_PART_2_LEN;

/// Header flag: the dome switch changed since the last read.
pub const BUFFER_HEADER_DOME_SWITCH_CHANGED: u8 = 1 << 2;

/// Header of the SPI host buffer, read at the start of each touch cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferHeader {
    /// Header flags.
    pub flags: u8,
    /// Heat-map frames the host failed to read.
    pub heat_map_miss_count: u8,
    /// Events currently queued.
    pub event_count: u8,
    /// Events dropped since the last read.
    pub event_miss_count: u8,
    /// Raw dome-switch level. Inverted: `0` means pressed.
    pub dome_switch_level: u8,
}

impl BufferHeader {
    /// Returns `true` if the dome switch changed since the last read.
    pub fn dome_switch_changed(&self) -> bool {
        self.flags & BUFFER_HEADER_DOME_SWITCH_CHANGED != 0
    }

    /// Returns `true` if the dome switch is currently pressed.
    pub fn dome_switch_pressed(&self) -> bool {
        self.dome_switch_level == 0
    }
}

impl From<[u8; BUFFER_HEADER_LEN]> for BufferHeader {
    fn from(raw: [u8; BUFFER_HEADER_LEN]) -> Self {
        Self {
            flags: raw[0],
            heat_map_miss_count: raw[4],
            event_count: raw[5],
            event_miss_count: raw[6],
            dome_switch_level: raw[7],
        }
    }
}

/// Header of a host data memory page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HostDataHeader {
    /// Should be [`HOST_DATA_MAGIC`].
    pub magic: u8,
    /// Identifier of the loaded page.
    pub mem_id: u8,
    /// Counter bumped by the controller whenever a page is loaded.
    pub count: u16,
}

impl HostDataHeader {
    /// Returns `true` if the header is valid and describes page `mem_id`.
    pub fn holds(&self, mem_id: u8) -> bool {
        self.magic == HOST_DATA_MAGIC && self.mem_id == mem_id
    }
}

impl From<[u8; HOST_DATA_HEADER_LEN]> for HostDataHeader {
    fn from(raw: [u8; HOST_DATA_HEADER_LEN]) -> Self {
        Self {
            magic: raw[0],
            mem_id: raw[1],
            count: u16::from_le_bytes([raw[2], raw[3]]),
        }
    }
}

/// System information published by the controller firmware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SystemInfo {
    pub header: HostDataHeader,
    pub api_ver_rev: u16,
    pub api_ver_minor: u8,
    pub api_ver_major: u8,
    pub chip0_ver: u16,
    pub chip0_id: [u8; 2],
    pub chip1_ver: u16,
    pub chip1_id: u16,
    pub fw_ver: u16,
    pub svn_rev: u16,
    pub cfg_ver: u16,
    pub cfg_project_id: u16,
    pub cx_ver: u16,
    pub cx_project_id: u16,
    pub cfg_afe_ver: u8,
    pub cx_afe_ver: u8,
    pub panel_cfg_afe_ver: u8,
    pub protocol: u8,
    pub die_id: [u8; 16],
    pub release_info: u64,
    pub fw_crc: u32,
    pub cfg_crc: u32,
    pub scr_res_x: u16,
    pub scr_res_y: u16,
    pub scr_tx_len: u8,
    pub scr_rx_len: u8,
    pub key_len: u8,
    pub frc_len: u8,
}

struct Reader<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> u8 {
        let v = self.raw[self.pos];
        self.pos += 1;
        v
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes([self.u8(), self.u8()])
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes([self.u8(), self.u8(), self.u8(), self.u8()])
    }

    fn u64(&mut self) -> u64 {
        (self.u32() as u64) | ((self.u32() as u64) << 32)
    }

    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.raw[self.pos..self.pos + N]);
        self.pos += N;
        out
    }
}

impl SystemInfo {
    /// Parses a system info page. Returns `None` if the page is too short.
    ///
    /// The header is not validated here, see [`SystemInfo::is_valid`].
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < SYSTEM_INFO_LEN {
            return None;
        }
        let mut r = Reader { raw, pos: 0 };
        let header = HostDataHeader::from(r.bytes::<HOST_DATA_HEADER_LEN>());
        let mut info = Self {
            header,
            api_ver_rev: r.u16(),
            api_ver_minor: r.u8(),
            api_ver_major: r.u8(),
            chip0_ver: r.u16(),
            chip0_id: r.bytes(),
            chip1_ver: r.u16(),
            chip1_id: r.u16(),
            fw_ver: r.u16(),
            svn_rev: r.u16(),
            cfg_ver: r.u16(),
            cfg_project_id: r.u16(),
            cx_ver: r.u16(),
            cx_project_id: r.u16(),
            cfg_afe_ver: r.u8(),
            cx_afe_ver: r.u8(),
            panel_cfg_afe_ver: r.u8(),
            protocol: r.u8(),
            die_id: r.bytes(),
            release_info: r.u64(),
            fw_crc: r.u32(),
            cfg_crc: r.u32(),
            scr_res_x: 0,
            scr_res_y: 0,
            scr_tx_len: 0,
            scr_rx_len: 0,
            key_len: 0,
            frc_len: 0,
        };
        debug_assert_eq!(r.pos, SYSTEM_INFO_PART_1_LEN);

        r.pos += SYSTEM_INFO_PART_1_RESERVED;
        info.scr_res_x = r.u16();
        info.scr_res_y = r.u16();
        info.scr_tx_len = r.u8();
        info.scr_rx_len = r.u8();
        info.key_len = r.u8();
        info.frc_len = r.u8();
        Some(info)
    }

    /// Returns `true` if the page header identifies a system info page.
    pub fn is_valid(&self) -> bool {
        self.header.holds(MEM_ID_SYSTEM_INFO)
    }

    /// Chip identifier as a single word.
    pub fn chip_id(&self) -> u16 {
        u16::from_be_bytes(self.chip0_id)
    }

    /// Host buffer address of the heat-map image for this firmware, or `None`
    /// for a firmware release with an unknown layout.
    pub fn heat_map_addr(&self) -> Option<u16> {
        match self.release_info {
            0x1 => Some(0x0020),
            r if r >= 0x3 => Some(0x0120),
            _ => None,
        }
    }
}

/// Identification returned by the firmware update `get_info` entry point.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TouchpadInfo {
    /// USB vendor identifier.
    pub vendor_id: u16,
    /// Controller chip identifier.
    pub chip_id: u16,
    /// Firmware release.
    pub fw_version: u64,
    /// Firmware CRC.
    pub fw_checksum: u32,
}

impl TouchpadInfo {
    /// Values reported when the firmware is unreadable (e.g. corrupted).
    pub const fn fallback() -> Self {
        Self {
            vendor_id: crate::op::ST_VENDOR_ID,
            chip_id: crate::op::FALLBACK_CHIP_ID,
            fw_version: 0,
            fw_checksum: 0,
        }
    }
}

impl From<&SystemInfo> for TouchpadInfo {
    fn from(info: &SystemInfo) -> Self {
        Self {
            vendor_id: crate::op::ST_VENDOR_ID,
            chip_id: info.chip_id(),
            fw_version: info.release_info,
            fw_checksum: info.fw_crc,
        }
    }
}
