//! Per-flow-mode control records.

use crate::event::StopAtKind;
use crate::sequencer::MachineState;
use crate::{Error, Result};

pub const FIRST_DROPS_THRESHOLD_DEFAULT: f64 = 0.0;
pub const LAST_DROPS_MINIMUM_TIME_DEFAULT: f64 = 3.0;

/// Stop-at limits, auto-tare, and drop thresholds for one flow mode.
///
/// A `None` limit means that stop condition is disabled; a limit the mode
/// does not support at all is rejected by the setters.
#[derive(Debug, Clone)]
pub struct ModeControl {
    mode: MachineState,
    pub disable_auto_tare: bool,
    stop_at_time: Option<f64>,
    stop_at_volume: Option<f64>,
    stop_at_weight: Option<f64>,
    pub profile_can_override_stop_limits: bool,
    pub profile_can_override_tank_temperature: bool,
    pub first_drops_threshold: Option<f64>,
    pub last_drops_minimum_time: Option<f64>,
    supports: ModeSupports,
}

#[derive(Debug, Clone, Copy)]
struct ModeSupports {
    time: bool,
    volume: bool,
    weight: bool,
    /// Time is a DE1-firmware concern for this mode, not ours.
    time_managed_by_de1: bool,
}

impl ModeControl {
    pub fn espresso() -> Self {
        Self {
            mode: MachineState::Espresso,
            disable_auto_tare: false,
            stop_at_time: None,
            stop_at_volume: None,
            stop_at_weight: None,
            profile_can_override_stop_limits: true,
            profile_can_override_tank_temperature: true,
            first_drops_threshold: Some(FIRST_DROPS_THRESHOLD_DEFAULT),
            last_drops_minimum_time: Some(LAST_DROPS_MINIMUM_TIME_DEFAULT),
            supports: ModeSupports {
                time: true,
                volume: true,
                weight: true,
                time_managed_by_de1: false,
            },
        }
    }

    pub fn steam() -> Self {
        Self {
            mode: MachineState::Steam,
            disable_auto_tare: true,
            stop_at_time: None,
            stop_at_volume: None,
            stop_at_weight: None,
            profile_can_override_stop_limits: false,
            profile_can_override_tank_temperature: false,
            first_drops_threshold: None,
            last_drops_minimum_time: None,
            supports: ModeSupports {
                time: true,
                volume: false,
                weight: false,
                time_managed_by_de1: true,
            },
        }
    }

    pub fn hot_water() -> Self {
        Self {
            mode: MachineState::HotWater,
            disable_auto_tare: false,
            stop_at_time: None,
            stop_at_volume: None,
            stop_at_weight: None,
            profile_can_override_stop_limits: false,
            profile_can_override_tank_temperature: false,
            first_drops_threshold: None,
            last_drops_minimum_time: None,
            supports: ModeSupports {
                time: true,
                volume: false,
                weight: true,
                time_managed_by_de1: false,
            },
        }
    }

    pub fn hot_water_rinse() -> Self {
        Self {
            mode: MachineState::HotWaterRinse,
            disable_auto_tare: true,
            stop_at_time: None,
            stop_at_volume: None,
            stop_at_weight: None,
            profile_can_override_stop_limits: false,
            profile_can_override_tank_temperature: false,
            first_drops_threshold: None,
            last_drops_minimum_time: None,
            supports: ModeSupports {
                time: true,
                volume: false,
                weight: false,
                time_managed_by_de1: false,
            },
        }
    }

    pub fn mode(&self) -> MachineState {
        self.mode
    }

    pub fn supports(&self, kind: StopAtKind) -> bool {
        match kind {
            StopAtKind::Time => self.supports.time,
            StopAtKind::Volume => self.supports.volume,
            StopAtKind::Weight => self.supports.weight,
        }
    }

    pub fn time_managed_by_de1(&self) -> bool {
        self.supports.time_managed_by_de1
    }

    pub fn stop_at(&self, kind: StopAtKind) -> Option<f64> {
        match kind {
            StopAtKind::Time => self.stop_at_time,
            StopAtKind::Volume => self.stop_at_volume,
            StopAtKind::Weight => self.stop_at_weight,
        }
    }

    pub fn set_stop_at(&mut self, kind: StopAtKind, value: Option<f64>) -> Result<()> {
        if !self.supports(kind) {
            return Err(Error::bad_request(format!(
                "{} does not support stop-at-{}",
                self.mode.name(),
                kind.as_str()
            )));
        }
        if kind == StopAtKind::Time && self.supports.time_managed_by_de1 {
            return Err(Error::UnsupportedStateTransition {
                reason: format!(
                    "stop-at-time for {} is managed by the DE1 itself",
                    self.mode.name()
                ),
            });
        }
        if let Some(v) = value
            && v < 0.0
        {
            return Err(Error::bad_request(format!(
                "stop-at-{} may not be negative ({v})",
                kind.as_str()
            )));
        }
        match kind {
            StopAtKind::Time => self.stop_at_time = value,
            StopAtKind::Volume => self.stop_at_volume = value,
            StopAtKind::Weight => self.stop_at_weight = value,
        }
        Ok(())
    }

    pub fn set_first_drops_threshold(&mut self, value: Option<f64>) -> Result<()> {
        if let Some(v) = value
            && !(0.0..=10.0).contains(&v)
        {
            return Err(Error::bad_request(format!(
                "first_drops_threshold not 0 <= {v} <= 10"
            )));
        }
        self.first_drops_threshold = value;
        Ok(())
    }

    pub fn set_last_drops_minimum_time(&mut self, value: Option<f64>) -> Result<()> {
        if let Some(v) = value
            && v < 0.0
        {
            return Err(Error::bad_request(format!(
                "last_drops_minimum_time less than zero ({v})"
            )));
        }
        self.last_drops_minimum_time = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn espresso_supports_all_three() {
        let mut c = ModeControl::espresso();
        c.set_stop_at(StopAtKind::Time, Some(25.0)).unwrap();
        c.set_stop_at(StopAtKind::Volume, Some(36.0)).unwrap();
        c.set_stop_at(StopAtKind::Weight, Some(36.0)).unwrap();
        assert_eq!(c.stop_at(StopAtKind::Weight), Some(36.0));
    }

    #[test]
    fn steam_time_is_de1_managed() {
        let mut c = ModeControl::steam();
        let err = c.set_stop_at(StopAtKind::Time, Some(60.0)).unwrap_err();
        assert_eq!(err.code(), "unsupported_state_transition");
        assert!(c.set_stop_at(StopAtKind::Weight, Some(10.0)).is_err());
    }

    #[test]
    fn hot_water_is_a_proper_subset() {
        let mut c = ModeControl::hot_water();
        assert!(c.set_stop_at(StopAtKind::Weight, Some(150.0)).is_ok());
        assert!(c.set_stop_at(StopAtKind::Volume, Some(150.0)).is_err());
    }

    #[test]
    fn threshold_bounds() {
        let mut c = ModeControl::espresso();
        assert!(c.set_first_drops_threshold(Some(11.0)).is_err());
        assert!(c.set_first_drops_threshold(Some(1.5)).is_ok());
        assert!(c.set_last_drops_minimum_time(Some(-1.0)).is_err());
    }
}
