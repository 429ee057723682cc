//! Multi-finger touch reports built from pointer events.

use embassy_time::Instant;
use heapless::Vec;

use super::event::{Event, PointerEvent, TouchType};

/// Maximum number of simultaneous fingers in one report.
pub const MAX_FINGERS: usize = 5;

/// Resolution of [`TouchReport::hid_timestamp`], in microseconds.
pub const HID_TIMESTAMP_UNIT_US: u64 = 100;

/// One finger slot of a touch report.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Finger {
    /// The finger touches the surface.
    pub tip: bool,
    /// The finger is in range.
    pub inrange: bool,
    /// Touch identifier.
    pub id: u8,
    /// Pressure, 10 bits.
    pub pressure: u16,
    /// Width, 12 bits.
    pub width: u16,
    /// Height, 12 bits.
    pub height: u16,
    /// X position in reported coordinates.
    pub x: u16,
    /// Y position in reported coordinates.
    pub y: u16,
}

/// A complete multi-finger report handed to the report consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TouchReport {
    /// Finger slots, in event order.
    pub fingers: Vec<Finger, MAX_FINGERS>,
    /// Dome switch (button) state.
    pub button: bool,
    /// Time of the interrupt edge that triggered this report.
    pub timestamp: Instant,
}

impl TouchReport {
    /// Number of populated finger slots.
    pub fn count(&self) -> usize {
        self.fingers.len()
    }

    /// Timestamp in HID units, wrapping at 16 bits.
    pub fn hid_timestamp(&self) -> u16 {
        (self.timestamp.as_micros() / HID_TIMESTAMP_UNIT_US) as u16
    }
}

/// Folds decoded events into [`TouchReport`]s.
#[derive(Copy, Clone, Debug)]
pub struct ReportBuilder {
    logical_max_x: u16,
    logical_max_y: u16,
}

impl ReportBuilder {
    /// Creates a builder mirroring positions against the given logical maxima.
    pub const fn new(logical_max_x: u16, logical_max_y: u16) -> Self {
        Self {
            logical_max_x,
            logical_max_y,
        }
    }

    fn geometry(&self, p: &PointerEvent) -> Finger {
        Finger {
            tip: true,
            inrange: true,
            id: p.touch_id,
            // z is 8 bits, pressure is 10 bits
            pressure: (p.z as u16) << 2,
            // width and height are 12 bits, the sensor reports 6
            width: ((p.minor as u16) | ((p.minor_high as u16) << 4)) << 6,
            height: ((p.major as u16) | ((p.major_high as u16) << 4)) << 6,
            // sensor origin is mirrored on both axes
            x: self.logical_max_x.saturating_sub(p.x),
            y: self.logical_max_y.saturating_sub(p.y),
        }
    }

    /// Maps one event to a finger slot.
    ///
    /// Returns `None` for events that are not pointer events and for pointer
    /// events whose touch type is invalid. Leave events only carry the id so
    /// the consumer can match the lift-off.
    pub fn finger(&self, event: &Event) -> Option<Finger> {
        let p = event.pointer()?;
        if p.touch_type == TouchType::Invalid {
            return None;
        }
        match event {
            Event::Enter(_) | Event::Motion(_) => Some(self.geometry(p)),
            _ => Some(Finger {
                id: p.touch_id,
                ..Finger::default()
            }),
        }
    }

    /// Builds a report from one burst of events.
    ///
    /// Fingers beyond [`MAX_FINGERS`] are dropped. Returns `None` when there
    /// is nothing to deliver: no finger slot was filled and the dome switch
    /// did not change.
    pub fn build(
        &self,
        events: &[Event],
        button: bool,
        button_changed: bool,
        timestamp: Instant,
    ) -> Option<TouchReport> {
        let mut fingers = Vec::new();
        for finger in events.iter().filter_map(|e| self.finger(e)) {
            if fingers.push(finger).is_err() {
                log::trace!("touch report full, dropping finger {}", finger.id);
                break;
            }
        }

        if fingers.is_empty() && !button_changed {
            return None;
        }

        Some(TouchReport {
            fingers,
            button,
            timestamp,
        })
    }
}
