//! Device mode tracking and transition planning.
//!
//! [`plan`] is pure: it computes the ordered list of [`Step`]s needed to move
//! the controller from the tracked [`SystemState`] to a requested one. The
//! driver transmits the steps in order and commits each one with
//! [`Step::apply`] only after its command was sent.

use heapless::Vec;

use super::cmd::{feature_frame, scan_mode_frame, ScanMode};

/// Modes of the controller as last confirmed by the driver.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemState {
    /// Operator debug mode. Local only, never sent to the controller.
    pub debug: bool,
    /// Heat-map host buffer enabled.
    pub heat_map: bool,
    /// Dome-switch reporting enabled.
    pub dome_switch: bool,
    /// Active (multi-touch) scanning.
    pub active_scan: bool,
    /// Last reported dome-switch level, `true` when pressed.
    pub dome_switch_level: bool,
}

/// A partial state request. `None` fields keep their tracked value.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StateRequest {
    pub debug: Option<bool>,
    pub heat_map: Option<bool>,
    pub dome_switch: Option<bool>,
    pub active_scan: Option<bool>,
}

impl StateRequest {
    /// Start scanning with dome-switch reporting.
    pub const START_SCAN: Self = Self {
        debug: None,
        heat_map: None,
        dome_switch: Some(true),
        active_scan: Some(true),
    };

    /// Stop scanning.
    pub const STOP_SCAN: Self = Self {
        debug: None,
        heat_map: None,
        dome_switch: None,
        active_scan: Some(false),
    };

    /// Enable the heat map together with what it depends on.
    pub const HEAT_MAP_ON: Self = Self {
        debug: None,
        heat_map: Some(true),
        dome_switch: Some(true),
        active_scan: Some(true),
    };

    /// Disable the heat map only.
    pub const HEAT_MAP_OFF: Self = Self {
        debug: None,
        heat_map: Some(false),
        dome_switch: None,
        active_scan: None,
    };

    /// Toggle operator debug mode.
    pub const fn debug(enable: bool) -> Self {
        Self {
            debug: Some(enable),
            heat_map: None,
            dome_switch: None,
            active_scan: None,
        }
    }
}

impl SystemState {
    /// Returns the state reached once every field of `request` is applied.
    pub fn merge(&self, request: &StateRequest) -> Self {
        Self {
            debug: request.debug.unwrap_or(self.debug),
            heat_map: request.heat_map.unwrap_or(self.heat_map),
            dome_switch: request.dome_switch.unwrap_or(self.dome_switch),
            active_scan: request.active_scan.unwrap_or(self.active_scan),
            dome_switch_level: self.dome_switch_level,
        }
    }
}

/// One step of a state transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Switch debug mode.
    SetDebug(bool),
    /// Select the heat-map and dome-switch features with one command.
    SelectFeatures { heat_map: bool, dome_switch: bool },
    /// Start or stop active scanning.
    SetActiveScan(bool),
    /// Lock the scan rate. Sent after a feature select enabling the heat map.
    LockScanRate,
}

impl Step {
    /// Command frame to transmit, or `None` for a local-only step.
    pub fn frame(&self) -> Option<[u8; 3]> {
        match *self {
            Step::SetDebug(_) => None,
            Step::SelectFeatures {
                heat_map,
                dome_switch,
            } => Some(feature_frame(heat_map, dome_switch)),
            Step::SetActiveScan(on) => Some(scan_mode_frame(ScanMode::Active, on as u8)),
            Step::LockScanRate => Some(scan_mode_frame(ScanMode::Locked, 0x00)),
        }
    }

    /// Commits the step into the tracked state.
    pub fn apply(&self, state: &mut SystemState) {
        match *self {
            Step::SetDebug(on) => state.debug = on,
            Step::SelectFeatures {
                heat_map,
                dome_switch,
            } => {
                state.heat_map = heat_map;
                state.dome_switch = dome_switch;
            }
            Step::SetActiveScan(on) => state.active_scan = on,
            Step::LockScanRate => {}
        }
    }
}

/// Ordered steps of one transition.
pub type Plan = Vec<Step, 4>;

/// Computes the minimal ordered steps moving `current` to `current` merged
/// with `request`.
///
/// Groups are visited in dependency order: debug, then heat map and dome
/// switch, then active scan. A lock of the scan rate follows whenever the
/// feature select enables the heat map.
pub fn plan(current: &SystemState, request: &StateRequest) -> Plan {
    let target = current.merge(request);
    let mut steps = Plan::new();

    // At most four steps are ever produced.
    if target.debug != current.debug {
        let _ = steps.push(Step::SetDebug(target.debug));
    }
    if (target.heat_map, target.dome_switch) != (current.heat_map, current.dome_switch) {
        let _ = steps.push(Step::SelectFeatures {
            heat_map: target.heat_map,
            dome_switch: target.dome_switch,
        });
    }
    if target.active_scan != current.active_scan {
        let _ = steps.push(Step::SetActiveScan(target.active_scan));
    }
    if steps
        .iter()
        .any(|s| matches!(s, Step::SelectFeatures { heat_map: true, .. }))
    {
        let _ = steps.push(Step::LockScanRate);
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(state: &mut SystemState, request: &StateRequest) -> Plan {
        let steps = plan(state, request);
        for step in &steps {
            step.apply(state);
        }
        steps
    }

    #[test]
    fn same_request_twice_plans_nothing() {
        let mut state = SystemState::default();
        let first = run(&mut state, &StateRequest::START_SCAN);
        assert_eq!(
            first.as_slice(),
            &[
                Step::SelectFeatures {
                    heat_map: false,
                    dome_switch: true
                },
                Step::SetActiveScan(true),
            ]
        );
        assert!(run(&mut state, &StateRequest::START_SCAN).is_empty());
        assert_eq!(plan(&state, &StateRequest::default()).len(), 0);
    }

    #[test]
    fn heat_map_locks_scan_rate_last_and_once() {
        let mut state = SystemState::default();
        run(&mut state, &StateRequest::START_SCAN);

        let steps = run(&mut state, &StateRequest::HEAT_MAP_ON);
        assert_eq!(
            steps.as_slice(),
            &[
                Step::SelectFeatures {
                    heat_map: true,
                    dome_switch: true
                },
                Step::LockScanRate,
            ]
        );
        assert_eq!(steps[1].frame(), Some([0xA0, 0x03, 0x00]));
        assert!(state.heat_map && state.active_scan);

        assert!(run(&mut state, &StateRequest::HEAT_MAP_ON).is_empty());
    }

    #[test]
    fn heat_map_from_idle_orders_features_before_scan() {
        let mut state = SystemState::default();
        let steps = run(&mut state, &StateRequest::HEAT_MAP_ON);
        let frames: Vec<[u8; 3], 4> = steps.iter().filter_map(Step::frame).collect();
        assert_eq!(
            frames.as_slice(),
            &[[0xA2, 0x05, 0x03], [0xA0, 0x00, 0x01], [0xA0, 0x03, 0x00]]
        );
    }

    #[test]
    fn disabling_heat_map_does_not_lock() {
        let mut state = SystemState::default();
        run(&mut state, &StateRequest::HEAT_MAP_ON);
        let steps = run(&mut state, &StateRequest::HEAT_MAP_OFF);
        assert_eq!(
            steps.as_slice(),
            &[Step::SelectFeatures {
                heat_map: false,
                dome_switch: true
            }]
        );
        assert!(state.active_scan);
    }

    #[test]
    fn debug_is_local_and_first() {
        let mut state = SystemState::default();
        let request = StateRequest {
            debug: Some(true),
            active_scan: Some(true),
            ..StateRequest::default()
        };
        let steps = run(&mut state, &request);
        assert_eq!(steps[0], Step::SetDebug(true));
        assert_eq!(steps[0].frame(), None);
        assert!(state.debug);
    }

    #[test]
    fn dome_level_survives_merges() {
        let state = SystemState {
            dome_switch_level: true,
            ..SystemState::default()
        };
        assert!(state.merge(&StateRequest::STOP_SCAN).dome_switch_level);
    }
}
