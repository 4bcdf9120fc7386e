//! Semantic device state built up from telemetry frames

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named fields of a device snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateField {
    Soc,
    TotalInput,
    TotalOutput,
    AcOutput,
    DcOutput,
    UsbOutput,
    LedOutput,
    MaximumChargingCurrent,
    AcChargingUpperLimit,
    DischargeLowerLimit,
    AcSilentCharging,
    UsbStandbyTime,
    AcStandbyTime,
    DcStandbyTime,
    ScreenRestTime,
    StopChargeAfter,
    WholeMachineUnusedTime,
}

impl StateField {
    pub fn as_str(self) -> &'static str {
        match self {
            StateField::Soc => "soc",
            StateField::TotalInput => "totalInput",
            StateField::TotalOutput => "totalOutput",
            StateField::AcOutput => "acOutput",
            StateField::DcOutput => "dcOutput",
            StateField::UsbOutput => "usbOutput",
            StateField::LedOutput => "ledOutput",
            StateField::MaximumChargingCurrent => "maximumChargingCurrent",
            StateField::AcChargingUpperLimit => "acChargingUpperLimit",
            StateField::DischargeLowerLimit => "dischargeLowerLimit",
            StateField::AcSilentCharging => "acSilentCharging",
            StateField::UsbStandbyTime => "usbStandbyTime",
            StateField::AcStandbyTime => "acStandbyTime",
            StateField::DcStandbyTime => "dcStandbyTime",
            StateField::ScreenRestTime => "screenRestTime",
            StateField::StopChargeAfter => "stopChargeAfter",
            StateField::WholeMachineUnusedTime => "wholeMachineUnusedTime",
        }
    }

    /// Live power-flow readings, as opposed to switches and settings
    pub fn is_power_flow(self) -> bool {
        matches!(
            self,
            StateField::Soc | StateField::TotalInput | StateField::TotalOutput
        )
    }
}

impl fmt::Display for StateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field values carried by one or more frames; `None` means "not reported".
///
/// Limits are kept as transmitted, in tenths of a percent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReadings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soc: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_input: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_output: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ac_output: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dc_output: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usb_output: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub led_output: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_charging_current: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ac_charging_upper_limit: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discharge_lower_limit: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ac_silent_charging: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usb_standby_time: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ac_standby_time: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dc_standby_time: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_rest_time: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_charge_after: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whole_machine_unused_time: Option<u16>,
}

impl DeviceReadings {
    /// Overlay every reported field of `update`, keeping the rest
    pub fn merge(&mut self, update: &DeviceReadings) {
        fn overlay<T: Copy>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        overlay(&mut self.soc, update.soc);
        overlay(&mut self.total_input, update.total_input);
        overlay(&mut self.total_output, update.total_output);
        overlay(&mut self.ac_output, update.ac_output);
        overlay(&mut self.dc_output, update.dc_output);
        overlay(&mut self.usb_output, update.usb_output);
        overlay(&mut self.led_output, update.led_output);
        overlay(
            &mut self.maximum_charging_current,
            update.maximum_charging_current,
        );
        overlay(
            &mut self.ac_charging_upper_limit,
            update.ac_charging_upper_limit,
        );
        overlay(&mut self.discharge_lower_limit, update.discharge_lower_limit);
        overlay(&mut self.ac_silent_charging, update.ac_silent_charging);
        overlay(&mut self.usb_standby_time, update.usb_standby_time);
        overlay(&mut self.ac_standby_time, update.ac_standby_time);
        overlay(&mut self.dc_standby_time, update.dc_standby_time);
        overlay(&mut self.screen_rest_time, update.screen_rest_time);
        overlay(&mut self.stop_charge_after, update.stop_charge_after);
        overlay(
            &mut self.whole_machine_unused_time,
            update.whole_machine_unused_time,
        );
    }

    pub fn has(&self, field: StateField) -> bool {
        match field {
            StateField::Soc => self.soc.is_some(),
            StateField::TotalInput => self.total_input.is_some(),
            StateField::TotalOutput => self.total_output.is_some(),
            StateField::AcOutput => self.ac_output.is_some(),
            StateField::DcOutput => self.dc_output.is_some(),
            StateField::UsbOutput => self.usb_output.is_some(),
            StateField::LedOutput => self.led_output.is_some(),
            StateField::MaximumChargingCurrent => self.maximum_charging_current.is_some(),
            StateField::AcChargingUpperLimit => self.ac_charging_upper_limit.is_some(),
            StateField::DischargeLowerLimit => self.discharge_lower_limit.is_some(),
            StateField::AcSilentCharging => self.ac_silent_charging.is_some(),
            StateField::UsbStandbyTime => self.usb_standby_time.is_some(),
            StateField::AcStandbyTime => self.ac_standby_time.is_some(),
            StateField::DcStandbyTime => self.dc_standby_time.is_some(),
            StateField::ScreenRestTime => self.screen_rest_time.is_some(),
            StateField::StopChargeAfter => self.stop_charge_after.is_some(),
            StateField::WholeMachineUnusedTime => self.whole_machine_unused_time.is_some(),
        }
    }

    /// Boolean switch fields; `None` for non-boolean or unreported fields
    pub fn switch(&self, field: StateField) -> Option<bool> {
        match field {
            StateField::AcOutput => self.ac_output,
            StateField::DcOutput => self.dc_output,
            StateField::UsbOutput => self.usb_output,
            StateField::LedOutput => self.led_output,
            StateField::AcSilentCharging => self.ac_silent_charging,
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == DeviceReadings::default()
    }
}

/// Snapshot of one device: last known value of every field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    #[serde(flatten)]
    pub readings: DeviceReadings,
    /// Strictly increases with every applied non-empty update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl DeviceState {
    /// Apply an update received at `now`. Empty updates leave the state untouched.
    pub fn apply(&mut self, update: &StateUpdate, now: DateTime<Utc>) {
        if update.readings.is_empty() {
            return;
        }

        self.readings.merge(&update.readings);
        self.last_update = Some(match self.last_update {
            Some(previous) if now <= previous => previous + chrono::Duration::microseconds(1),
            _ => now,
        });
    }

    pub fn has(&self, field: StateField) -> bool {
        self.readings.has(field)
    }

    /// Fields from `required` this snapshot has not seen yet
    pub fn missing(&self, required: &[StateField]) -> Vec<StateField> {
        required
            .iter()
            .copied()
            .filter(|field| !self.has(*field))
            .collect()
    }
}

/// Partial update decoded from one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub device_id: String,
    pub readings: DeviceReadings,
}

impl StateUpdate {
    pub fn empty(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            readings: DeviceReadings::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Percentage to transmitted tenths, `None` on overflow
pub fn percent_to_raw(percent: u16) -> Option<u16> {
    percent.checked_mul(10)
}

/// Transmitted tenths to whole percent, rounded half up
pub fn raw_to_percent(raw: u16) -> u16 {
    ((u32::from(raw) + 5) / 10) as u16
}

/// State of charge in percent with one decimal, from the promille register
pub fn soc_from_raw(raw: u16) -> f64 {
    (f64::from(raw) / 1000.0 * 100.0 * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_scaling() {
        assert_eq!(percent_to_raw(85), Some(850));
        assert_eq!(raw_to_percent(850), 85);
        assert_eq!(raw_to_percent(847), 85);
        assert_eq!(raw_to_percent(844), 84);
        assert_eq!(percent_to_raw(7000), None);
        assert_eq!(soc_from_raw(923), 92.3);
        assert_eq!(soc_from_raw(1000), 100.0);
        assert_eq!(soc_from_raw(0), 0.0);
    }

    #[test]
    fn test_merge_keeps_unreported_fields() {
        let mut state = DeviceState::default();
        let first = StateUpdate {
            device_id: "AA".to_string(),
            readings: DeviceReadings {
                maximum_charging_current: Some(12),
                soc: Some(50.0),
                ..Default::default()
            },
        };
        state.apply(&first, at(100));

        let second = StateUpdate {
            device_id: "AA".to_string(),
            readings: DeviceReadings {
                soc: Some(51.5),
                ..Default::default()
            },
        };
        state.apply(&second, at(101));

        assert_eq!(state.readings.maximum_charging_current, Some(12));
        assert_eq!(state.readings.soc, Some(51.5));
        assert_eq!(state.last_update, Some(at(101)));
    }

    #[test]
    fn test_last_update_strictly_increases() {
        let mut state = DeviceState::default();
        let update = StateUpdate {
            device_id: "AA".to_string(),
            readings: DeviceReadings {
                ac_output: Some(true),
                ..Default::default()
            },
        };
        state.apply(&update, at(100));
        let first = state.last_update.unwrap();
        state.apply(&update, at(100));
        assert!(state.last_update.unwrap() > first);
    }

    #[test]
    fn test_empty_update_is_ignored() {
        let mut state = DeviceState::default();
        state.apply(&StateUpdate::empty("AA"), at(100));
        assert_eq!(state, DeviceState::default());
    }

    #[test]
    fn test_missing_fields() {
        let state = DeviceState {
            readings: DeviceReadings {
                ac_output: Some(true),
                ..Default::default()
            },
            last_update: None,
        };
        assert_eq!(
            state.missing(&[StateField::AcOutput, StateField::TotalOutput]),
            vec![StateField::TotalOutput]
        );
    }

    #[test]
    fn test_serializes_camel_case_snapshot() {
        let state = DeviceState {
            readings: DeviceReadings {
                soc: Some(92.3),
                ac_charging_upper_limit: Some(850),
                ..Default::default()
            },
            last_update: None,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["soc"], 92.3);
        assert_eq!(json["acChargingUpperLimit"], 850);
        assert!(json.get("dcOutput").is_none());
    }
}
