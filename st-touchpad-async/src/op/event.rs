//! Event records and burst decoding.

use heapless::Vec;

/// Size of one event record on the wire.
pub const EVENT_SIZE: usize = 8;
/// Number of event records returned by one [`crate::op::Command::ReadAllEvents`].
pub const MAX_EVENTS: usize = 32;
/// Size of one complete event burst.
pub const BURST_SIZE: usize = EVENT_SIZE * MAX_EVENTS;
/// Marker carried in the two low bits of every valid record.
pub const EVENT_MAGIC: u8 = 0x3;

/// Status report type echoing a previously issued command.
pub const STATUS_CMD_ECHO: u8 = 0x01;
/// Status report type signalling dropped frames.
pub const STATUS_FRAME_DROP: u8 = 0x03;
/// Status report type signalling a finished force calibration.
pub const STATUS_FORCE_CAL: u8 = 0x05;
/// Periodic beacon status report type.
pub const STATUS_BEACON: u8 = 0x09;

/// Event identifiers.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventId {
    /// The controller finished booting.
    ControllerReady = 0x0,
    /// A pointer appeared.
    EnterPointer = 0x1,
    /// A pointer moved.
    MotionPointer = 0x2,
    /// A pointer was lifted.
    LeavePointer = 0x3,
    /// A status report.
    StatusReport = 0x4,
    /// A user report.
    UserReport = 0x5,
    /// A debug report.
    DebugReport = 0xE,
    /// An error report.
    ErrorReport = 0xF,
}

impl TryFrom<u8> for EventId {
    type Error = u8;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            0x0 => Ok(Self::ControllerReady),
            0x1 => Ok(Self::EnterPointer),
            0x2 => Ok(Self::MotionPointer),
            0x3 => Ok(Self::LeavePointer),
            0x4 => Ok(Self::StatusReport),
            0x5 => Ok(Self::UserReport),
            0xE => Ok(Self::DebugReport),
            0xF => Ok(Self::ErrorReport),
            other => Err(other),
        }
    }
}

/// Kind of object reported by a pointer event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TouchType {
    /// Not a touch; ignored by the report builder.
    Invalid,
    /// A finger.
    Finger,
    /// A gloved finger.
    Glove,
    /// A stylus.
    Stylus,
    /// A palm.
    Palm,
    /// Any other type code.
    Other(u8),
}

impl From<u8> for TouchType {
    fn from(bits: u8) -> Self {
        match bits & 0x0F {
            0x0 => Self::Invalid,
            0x1 => Self::Finger,
            0x2 => Self::Glove,
            0x3 => Self::Stylus,
            0x4 => Self::Palm,
            other => Self::Other(other),
        }
    }
}

impl From<TouchType> for u8 {
    fn from(t: TouchType) -> Self {
        match t {
            TouchType::Invalid => 0x0,
            TouchType::Finger => 0x1,
            TouchType::Glove => 0x2,
            TouchType::Stylus => 0x3,
            TouchType::Palm => 0x4,
            TouchType::Other(bits) => bits & 0x0F,
        }
    }
}

/// Geometry carried by enter, motion and leave events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PointerEvent {
    /// Kind of touching object.
    pub touch_type: TouchType,
    /// Touch identifier (4 bits).
    pub touch_id: u8,
    /// Raw X position (12 bits, sensor origin).
    pub x: u16,
    /// Raw Y position (12 bits, sensor origin).
    pub y: u16,
    /// Raw pressure.
    pub z: u8,
    /// Low nibble of the minor axis.
    pub minor: u8,
    /// Low nibble of the major axis.
    pub major: u8,
    /// High bits of the minor axis.
    pub minor_high: u8,
    /// High bits of the major axis.
    pub major_high: u8,
}

/// Payload of status and error reports.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReportEvent {
    /// Report type code.
    pub report_type: u8,
    /// Report-specific information bytes.
    pub info: [u8; 4],
}

impl ReportEvent {
    /// The info bytes as one big-endian word, the way they are logged.
    pub fn info_word(&self) -> u32 {
        u32::from_be_bytes(self.info)
    }
}

/// A decoded event record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The controller is ready after a reset.
    ControllerReady,
    /// A pointer entered the surface.
    Enter(PointerEvent),
    /// A pointer moved.
    Motion(PointerEvent),
    /// A pointer left the surface.
    Leave(PointerEvent),
    /// A status report.
    Status(ReportEvent),
    /// An error report.
    Error(ReportEvent),
    /// A valid record of a kind the driver does not interpret.
    Other {
        /// Raw event identifier.
        id: u8,
    },
}

impl Event {
    /// Parses one record. Returns `None` when the magic marker is absent,
    /// which means there are no more valid records in the burst.
    pub fn parse(raw: &[u8; EVENT_SIZE]) -> Option<Self> {
        if raw[0] & 0x03 != EVENT_MAGIC {
            return None;
        }
        let major_high = (raw[0] >> 2) & 0x03;
        let id = raw[0] >> 4;

        let pointer = || PointerEvent {
            touch_type: TouchType::from(raw[1] & 0x0F),
            touch_id: raw[1] >> 4,
            x: raw[2] as u16 | ((raw[3] as u16 & 0x0F) << 8),
            y: (raw[3] >> 4) as u16 | ((raw[4] as u16) << 4),
            z: raw[5],
            minor: raw[6] & 0x0F,
            major: raw[6] >> 4,
            minor_high: raw[7] & 0x03,
            major_high,
        };
        let report = || ReportEvent {
            report_type: raw[1],
            info: [raw[2], raw[3], raw[4], raw[5]],
        };

        let event = match EventId::try_from(id) {
            Ok(EventId::ControllerReady) => Self::ControllerReady,
            Ok(EventId::EnterPointer) => Self::Enter(pointer()),
            Ok(EventId::MotionPointer) => Self::Motion(pointer()),
            Ok(EventId::LeavePointer) => Self::Leave(pointer()),
            Ok(EventId::StatusReport) => Self::Status(report()),
            Ok(EventId::ErrorReport) => Self::Error(report()),
            Ok(other) => Self::Other { id: other as u8 },
            Err(other) => Self::Other { id: other },
        };
        Some(event)
    }

    /// Encodes the event into its wire representation.
    pub fn encode(&self) -> [u8; EVENT_SIZE] {
        let mut raw = [0u8; EVENT_SIZE];
        let id = match self {
            Self::ControllerReady => EventId::ControllerReady as u8,
            Self::Enter(_) => EventId::EnterPointer as u8,
            Self::Motion(_) => EventId::MotionPointer as u8,
            Self::Leave(_) => EventId::LeavePointer as u8,
            Self::Status(_) => EventId::StatusReport as u8,
            Self::Error(_) => EventId::ErrorReport as u8,
            Self::Other { id } => *id & 0x0F,
        };
        raw[0] = EVENT_MAGIC | (id << 4);

        match self {
            Self::Enter(p) | Self::Motion(p) | Self::Leave(p) => {
                raw[0] |= (p.major_high & 0x03) << 2;
                raw[1] = u8::from(p.touch_type) | (p.touch_id << 4);
                raw[2] = p.x as u8;
                raw[3] = ((p.x >> 8) as u8 & 0x0F) | ((p.y as u8 & 0x0F) << 4);
                raw[4] = (p.y >> 4) as u8;
                raw[5] = p.z;
                raw[6] = (p.minor & 0x0F) | (p.major << 4);
                raw[7] = p.minor_high & 0x03;
            }
            Self::Status(r) | Self::Error(r) => {
                raw[1] = r.report_type;
                raw[2..6].copy_from_slice(&r.info);
            }
            Self::ControllerReady | Self::Other { .. } => {}
        }
        raw
    }

    /// Returns the pointer payload of enter, motion and leave events.
    pub fn pointer(&self) -> Option<&PointerEvent> {
        match self {
            Self::Enter(p) | Self::Motion(p) | Self::Leave(p) => Some(p),
            _ => None,
        }
    }

    /// Returns `true` if this is a command echo status report for `cmd`.
    ///
    /// At most the first four bytes of the command are compared.
    pub fn is_echo_of(&self, cmd: &[u8]) -> bool {
        match self {
            Self::Status(r) if r.report_type == STATUS_CMD_ECHO => {
                let len = cmd.len().min(r.info.len());
                r.info[..len] == cmd[..len]
            }
            _ => false,
        }
    }
}

/// The valid events of one burst, in wire order.
pub type EventBurst = Vec<Event, MAX_EVENTS>;

/// Severity of an error report.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Logged; the scan continues.
    Minor,
    /// The controller must be halted.
    Major,
}

/// Classifies an error report against the configured major error types.
pub fn classify_error(report: &ReportEvent, major_types: &[u8]) -> ErrorSeverity {
    if major_types.contains(&report.report_type) {
        ErrorSeverity::Major
    } else {
        ErrorSeverity::Minor
    }
}

/// Decodes a raw burst, stopping at the first record without the magic
/// marker.
///
/// Error reports are logged and classified as they are scanned. The first
/// major error aborts the decode and is returned as `Err`.
pub fn decode_burst(raw: &[u8], major_types: &[u8]) -> Result<EventBurst, ReportEvent> {
    let mut events = EventBurst::new();
    for record in raw.chunks_exact(EVENT_SIZE).take(MAX_EVENTS) {
        let mut bytes = [0u8; EVENT_SIZE];
        bytes.copy_from_slice(record);
        let Some(event) = Event::parse(&bytes) else {
            break;
        };

        if let Event::Error(report) = &event {
            log::warn!(
                "Touchpad error: {:x} {:x}",
                report.report_type,
                report.info_word()
            );
            if classify_error(report, major_types) == ErrorSeverity::Major {
                log::error!("Touchpad major error {:x}", report.report_type);
                return Err(*report);
            }
        }

        // Capacity equals the number of records taken above.
        let _ = events.push(event);
    }
    Ok(events)
}
