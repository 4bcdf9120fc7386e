//! The closed set of commands the client will ever send
//!
//! Some registers brick the device when written with the wrong value, so the
//! only way to produce a request frame is through a [`Command`] variant. The
//! mapping from variant to frame lives in one table.

use super::modbus::{registers, SETTINGS_READ_COUNT};
use super::state::StateField;
use super::CommandRejected;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Whitelisted device commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    #[serde(rename = "REGRequestSettings")]
    RequestSettings,
    #[serde(rename = "REGMaxChargeCurrent")]
    MaxChargeCurrent,
    #[serde(rename = "REGChargeUpperLimit")]
    ChargeUpperLimit,
    #[serde(rename = "REGDischargeLowerLimit")]
    DischargeLowerLimit,
    #[serde(rename = "REGStopChargeAfter")]
    StopChargeAfter,
    #[serde(rename = "REGEnableUSBOutput")]
    EnableUsbOutput,
    #[serde(rename = "REGDisableUSBOutput")]
    DisableUsbOutput,
    #[serde(rename = "REGEnableDCOutput")]
    EnableDcOutput,
    #[serde(rename = "REGDisableDCOutput")]
    DisableDcOutput,
    #[serde(rename = "REGEnableACOutput")]
    EnableAcOutput,
    #[serde(rename = "REGDisableACOutput")]
    DisableAcOutput,
}

/// How a command turns into a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Holding register read of the settings block
    ReadSettings { count: u16 },
    /// Write of a constant value
    Fixed { register: u16, value: u16 },
    /// Write of the caller's value as-is
    Value { register: u16 },
    /// Write of a caller percentage, transmitted in tenths of a percent
    Percent { register: u16 },
}

struct CommandEntry {
    command: Command,
    name: &'static str,
    kind: CommandKind,
}

const COMMAND_TABLE: [CommandEntry; 11] = [
    CommandEntry {
        command: Command::RequestSettings,
        name: "REGRequestSettings",
        kind: CommandKind::ReadSettings {
            count: SETTINGS_READ_COUNT,
        },
    },
    CommandEntry {
        command: Command::MaxChargeCurrent,
        name: "REGMaxChargeCurrent",
        kind: CommandKind::Value {
            register: registers::MAX_CHARGE_CURRENT,
        },
    },
    CommandEntry {
        command: Command::ChargeUpperLimit,
        name: "REGChargeUpperLimit",
        kind: CommandKind::Percent {
            register: registers::CHARGE_UPPER_LIMIT,
        },
    },
    CommandEntry {
        command: Command::DischargeLowerLimit,
        name: "REGDischargeLowerLimit",
        kind: CommandKind::Percent {
            register: registers::DISCHARGE_LOWER_LIMIT,
        },
    },
    CommandEntry {
        command: Command::StopChargeAfter,
        name: "REGStopChargeAfter",
        kind: CommandKind::Value {
            register: registers::STOP_CHARGE_AFTER,
        },
    },
    CommandEntry {
        command: Command::EnableUsbOutput,
        name: "REGEnableUSBOutput",
        kind: CommandKind::Fixed {
            register: registers::USB_OUTPUT,
            value: 1,
        },
    },
    CommandEntry {
        command: Command::DisableUsbOutput,
        name: "REGDisableUSBOutput",
        kind: CommandKind::Fixed {
            register: registers::USB_OUTPUT,
            value: 0,
        },
    },
    CommandEntry {
        command: Command::EnableDcOutput,
        name: "REGEnableDCOutput",
        kind: CommandKind::Fixed {
            register: registers::DC_OUTPUT,
            value: 1,
        },
    },
    CommandEntry {
        command: Command::DisableDcOutput,
        name: "REGDisableDCOutput",
        kind: CommandKind::Fixed {
            register: registers::DC_OUTPUT,
            value: 0,
        },
    },
    CommandEntry {
        command: Command::EnableAcOutput,
        name: "REGEnableACOutput",
        kind: CommandKind::Fixed {
            register: registers::AC_OUTPUT,
            value: 1,
        },
    },
    CommandEntry {
        command: Command::DisableAcOutput,
        name: "REGDisableACOutput",
        kind: CommandKind::Fixed {
            register: registers::AC_OUTPUT,
            value: 0,
        },
    },
];

impl Command {
    pub const ALL: [Command; 11] = [
        Command::RequestSettings,
        Command::MaxChargeCurrent,
        Command::ChargeUpperLimit,
        Command::DischargeLowerLimit,
        Command::StopChargeAfter,
        Command::EnableUsbOutput,
        Command::DisableUsbOutput,
        Command::EnableDcOutput,
        Command::DisableDcOutput,
        Command::EnableAcOutput,
        Command::DisableAcOutput,
    ];

    fn entry(self) -> &'static CommandEntry {
        // Table order matches declaration order
        &COMMAND_TABLE[self as usize]
    }

    /// Wire name, e.g. `REGEnableACOutput`
    pub fn name(self) -> &'static str {
        self.entry().name
    }

    pub fn kind(self) -> CommandKind {
        self.entry().kind
    }

    /// Resolve a wire name, rejecting anything outside the whitelist
    pub fn from_name(name: &str) -> Result<Self, CommandRejected> {
        COMMAND_TABLE
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.command)
            .ok_or_else(|| CommandRejected::NotWhitelisted {
                name: name.to_string(),
            })
    }

    pub fn requires_value(self) -> bool {
        matches!(
            self.kind(),
            CommandKind::Value { .. } | CommandKind::Percent { .. }
        )
    }

    /// For output toggles, the boolean field it drives and its target value
    pub fn output_target(self) -> Option<(StateField, bool)> {
        match self {
            Command::EnableUsbOutput => Some((StateField::UsbOutput, true)),
            Command::DisableUsbOutput => Some((StateField::UsbOutput, false)),
            Command::EnableDcOutput => Some((StateField::DcOutput, true)),
            Command::DisableDcOutput => Some((StateField::DcOutput, false)),
            Command::EnableAcOutput => Some((StateField::AcOutput, true)),
            Command::DisableAcOutput => Some((StateField::AcOutput, false)),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Command {
    type Err = CommandRejected;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::from_name(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_table_order_matches_variants() {
        for command in Command::ALL {
            assert_eq!(command.entry().command, command);
        }
    }

    #[test]
    fn test_names_round_trip() {
        for command in Command::ALL {
            assert_eq!(Command::from_name(command.name()), Ok(command));
            assert_eq!(command.to_string(), command.name());
        }
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&Command::EnableAcOutput).unwrap();
        assert_eq!(json, "\"REGEnableACOutput\"");
        let parsed: Command = serde_json::from_str("\"REGChargeUpperLimit\"").unwrap();
        assert_eq!(parsed, Command::ChargeUpperLimit);
    }

    #[test]
    fn test_dangerous_registers_are_rejected() {
        for name in ["REGSleepTime", "REGAcSilentCharging", "regenableacoutput", "", "set_charging_current"] {
            assert_eq!(
                Command::from_name(name),
                Err(CommandRejected::NotWhitelisted {
                    name: name.to_string()
                })
            );
        }
    }

    #[test]
    fn test_requires_value() {
        let valued: Vec<_> = Command::ALL
            .into_iter()
            .filter(|c| c.requires_value())
            .collect();
        assert_eq!(
            valued,
            vec![
                Command::MaxChargeCurrent,
                Command::ChargeUpperLimit,
                Command::DischargeLowerLimit,
                Command::StopChargeAfter,
            ]
        );
    }

    proptest! {
        #[test]
        fn unknown_names_never_resolve(name in "[A-Za-z_]{0,24}") {
            let whitelisted = Command::ALL.iter().any(|c| c.name() == name);
            prop_assert_eq!(Command::from_name(&name).is_ok(), whitelisted);
        }
    }
}
