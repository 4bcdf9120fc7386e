//! What each command's confirming telemetry has to look like

use crate::protocol::{Command, DeviceState, StateField};
use std::time::Duration;

/// Tolerance, in tenths of a percent, when comparing a limit to its target
pub const LIMIT_TOLERANCE: i32 = 5;

/// Condition a device snapshot must meet to confirm a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// The output switch reports the requested position
    OutputIs(StateField, bool),
    /// A limit lies within [`LIMIT_TOLERANCE`] of the requested percentage
    LimitNear(StateField),
    /// The charging current equals the requested amperage
    CurrentEquals,
    /// A state of charge has been reported
    SocPresent,
}

impl Predicate {
    pub fn evaluate(&self, state: &DeviceState, expected: Option<u16>) -> bool {
        let readings = &state.readings;
        match *self {
            Predicate::OutputIs(field, on) => readings.switch(field) == Some(on),
            Predicate::LimitNear(field) => {
                let actual = match field {
                    StateField::AcChargingUpperLimit => readings.ac_charging_upper_limit,
                    StateField::DischargeLowerLimit => readings.discharge_lower_limit,
                    _ => None,
                };
                match (actual, expected) {
                    (Some(actual), Some(percent)) => {
                        (i32::from(actual) - i32::from(percent) * 10).abs() < LIMIT_TOLERANCE
                    }
                    _ => false,
                }
            }
            Predicate::CurrentEquals => match (readings.maximum_charging_current, expected) {
                (Some(actual), Some(expected)) => actual == expected,
                _ => false,
            },
            Predicate::SocPresent => readings.soc.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandExpectation {
    pub command: Command,
    /// Fields that must all be present before the predicate is checked
    pub fields: &'static [StateField],
    pub predicate: Predicate,
    pub max_wait: Duration,
}

use StateField::*;

const AC_FIELDS: &[StateField] = &[AcOutput, MaximumChargingCurrent, TotalOutput];
const DC_FIELDS: &[StateField] = &[DcOutput, MaximumChargingCurrent];
const USB_FIELDS: &[StateField] = &[UsbOutput, MaximumChargingCurrent];

const fn expect(
    command: Command,
    fields: &'static [StateField],
    predicate: Predicate,
    max_wait_ms: u64,
) -> CommandExpectation {
    CommandExpectation {
        command,
        fields,
        predicate,
        max_wait: Duration::from_millis(max_wait_ms),
    }
}

/// Commands absent here fall back to a generic wait
pub const EXPECTATIONS: &[CommandExpectation] = &[
    expect(Command::EnableAcOutput, AC_FIELDS, Predicate::OutputIs(AcOutput, true), 2000),
    expect(Command::DisableAcOutput, AC_FIELDS, Predicate::OutputIs(AcOutput, false), 2000),
    expect(Command::EnableDcOutput, DC_FIELDS, Predicate::OutputIs(DcOutput, true), 2000),
    expect(Command::DisableDcOutput, DC_FIELDS, Predicate::OutputIs(DcOutput, false), 2000),
    expect(Command::EnableUsbOutput, USB_FIELDS, Predicate::OutputIs(UsbOutput, true), 2000),
    expect(Command::DisableUsbOutput, USB_FIELDS, Predicate::OutputIs(UsbOutput, false), 2000),
    expect(
        Command::ChargeUpperLimit,
        &[AcChargingUpperLimit, MaximumChargingCurrent],
        Predicate::LimitNear(AcChargingUpperLimit),
        2500,
    ),
    expect(
        Command::DischargeLowerLimit,
        &[DischargeLowerLimit, MaximumChargingCurrent],
        Predicate::LimitNear(DischargeLowerLimit),
        2500,
    ),
    expect(
        Command::MaxChargeCurrent,
        &[MaximumChargingCurrent],
        Predicate::CurrentEquals,
        2000,
    ),
    expect(
        Command::RequestSettings,
        &[Soc, TotalInput, TotalOutput],
        Predicate::SocPresent,
        3000,
    ),
];

pub fn expectation_for(command: Command) -> Option<&'static CommandExpectation> {
    EXPECTATIONS.iter().find(|e| e.command == command)
}

/// Commands that change a stored setting rather than an output
pub fn is_settings_command(command: Command) -> bool {
    matches!(
        command,
        Command::ChargeUpperLimit
            | Command::DischargeLowerLimit
            | Command::MaxChargeCurrent
            | Command::StopChargeAfter
    )
}

pub fn is_output_command(command: Command) -> bool {
    command.output_target().is_some()
}
