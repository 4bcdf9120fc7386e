//! Command encoding and telemetry decoding
//!
//! Both directions are pure. [`merge_frame`] is the whole inbound path from
//! `(topic, bytes, prior state)` to the next state, so the MQTT layer only has
//! to route frames to it.

use super::command::{Command, CommandKind};
use super::modbus::{self, bits, registers as reg};
use super::state::{percent_to_raw, soc_from_raw, DeviceReadings, DeviceState, StateUpdate};
use super::topics::{device_id_from_topic, TopicVariant};
use super::{CommandRejected, ProtocolError};
use chrono::{DateTime, Utc};

/// Register count of a complete telemetry or settings dump
pub const FULL_DUMP_REGISTERS: usize = 81;
/// Smallest dump that still reaches the state-of-charge register
pub const MIN_SOC_REGISTERS: usize = reg::STATE_OF_CHARGE + 1;
/// Smallest dump that reaches the charge upper limit register
pub const MIN_SETTINGS_REGISTERS: usize = reg::CHARGE_UPPER_LIMIT as usize + 1;

/// Build the request frame for a whitelisted command.
///
/// Percent commands take a whole percentage and transmit tenths.
pub fn encode(command: Command, value: Option<u16>) -> Result<Vec<u8>, CommandRejected> {
    let missing = || CommandRejected::MissingValue {
        command: command.name().to_string(),
    };

    let bytes = match command.kind() {
        CommandKind::ReadSettings { count } => modbus::read_registers(0, count),
        CommandKind::Fixed { register, value } => modbus::write_register(register, value),
        CommandKind::Value { register } => {
            modbus::write_register(register, value.ok_or_else(missing)?)
        }
        CommandKind::Percent { register } => {
            let percent = value.ok_or_else(missing)?;
            let raw = percent_to_raw(percent).ok_or(CommandRejected::OutOfRange {
                command: command.name().to_string(),
                value: percent,
                min: 0,
                max: 100,
            })?;
            modbus::write_register(register, raw)
        }
    };

    Ok(bytes)
}

/// Zero in these registers means "not reported"
fn nonzero(value: u16) -> Option<u16> {
    (value != 0).then_some(value)
}

fn decode_power_flow(registers: &[u16], readings: &mut DeviceReadings) {
    let mask = registers[reg::OUTPUT_BITMASK];

    readings.soc = Some(soc_from_raw(registers[reg::STATE_OF_CHARGE]));
    readings.total_input = Some(registers[reg::TOTAL_INPUT]);
    readings.total_output = Some(registers[reg::TOTAL_OUTPUT]);
    readings.usb_output = Some(modbus::bit_is_set(mask, bits::USB));
    readings.dc_output = Some(modbus::bit_is_set(mask, bits::DC));
    readings.ac_output = Some(modbus::bit_is_set(mask, bits::AC));
    readings.led_output = Some(modbus::bit_is_set(mask, bits::LED));
}

fn decode_settings(registers: &[u16], readings: &mut DeviceReadings) {
    let at = |index: usize| registers.get(index).copied();

    readings.maximum_charging_current = nonzero(registers[reg::MAX_CHARGE_CURRENT as usize]);
    readings.ac_silent_charging = at(reg::AC_SILENT_CHARGING).map(|v| v == 1);
    readings.usb_standby_time = at(reg::USB_STANDBY);
    readings.ac_standby_time = at(reg::AC_STANDBY);
    readings.dc_standby_time = at(reg::DC_STANDBY);
    readings.screen_rest_time = at(reg::SCREEN_REST);
    readings.stop_charge_after = at(reg::STOP_CHARGE_AFTER as usize);
    readings.discharge_lower_limit = at(reg::DISCHARGE_LOWER_LIMIT as usize);
    readings.ac_charging_upper_limit = at(reg::CHARGE_UPPER_LIMIT as usize).and_then(nonzero);
    readings.whole_machine_unused_time = at(reg::WHOLE_MACHINE_UNUSED);
}

/// Decode one inbound payload into the fields it reports.
///
/// Frames on non-response topics and frames too small to reach the state of
/// charge register produce an empty update.
pub fn decode(
    raw: &[u8],
    variant: &TopicVariant,
    device_id: &str,
) -> Result<StateUpdate, ProtocolError> {
    let registers = modbus::registers_from_payload(raw)?;
    let mut update = StateUpdate::empty(device_id);

    if !variant.is_response() {
        return Ok(update);
    }

    let count = registers.len();
    let readings = &mut update.readings;

    if count == FULL_DUMP_REGISTERS && variant.is_full_dump() {
        decode_power_flow(&registers, readings);
        decode_settings(&registers, readings);
    } else if count == FULL_DUMP_REGISTERS && *variant == TopicVariant::ClientData {
        decode_settings(&registers, readings);
    } else if count >= MIN_SOC_REGISTERS {
        readings.soc = Some(soc_from_raw(registers[reg::STATE_OF_CHARGE]));
        if count >= MIN_SETTINGS_REGISTERS {
            decode_settings(&registers, readings);
        }
    }

    Ok(update)
}

/// Fold one frame into the prior snapshot of the device it belongs to
pub fn merge_frame(
    prior: &DeviceState,
    topic: &str,
    raw: &[u8],
    now: DateTime<Utc>,
) -> Result<DeviceState, ProtocolError> {
    let device_id = device_id_from_topic(topic)?;
    let update = decode(raw, &TopicVariant::classify(topic), device_id)?;

    let mut next = prior.clone();
    next.apply(&update, now);
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::state::StateField;
    use crate::testing::frames::{frame_from_registers, full_dump, RegisterDump};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_encode_percent_command_transmits_tenths() {
        let bytes = encode(Command::ChargeUpperLimit, Some(85)).unwrap();
        assert_eq!(bytes, modbus::write_register(67, 850));
    }

    #[test]
    fn test_encode_fixed_commands() {
        assert_eq!(
            encode(Command::EnableAcOutput, None).unwrap(),
            modbus::write_register(26, 1)
        );
        assert_eq!(
            encode(Command::DisableUsbOutput, Some(99)).unwrap(),
            modbus::write_register(24, 0)
        );
        assert_eq!(
            encode(Command::RequestSettings, None).unwrap(),
            modbus::read_registers(0, 80)
        );
    }

    #[test]
    fn test_encode_value_command_requires_value() {
        assert_eq!(
            encode(Command::MaxChargeCurrent, None),
            Err(CommandRejected::MissingValue {
                command: "REGMaxChargeCurrent".to_string()
            })
        );
        assert_eq!(
            encode(Command::StopChargeAfter, Some(0)).unwrap(),
            modbus::write_register(63, 0)
        );
    }

    #[test]
    fn test_decode_short_frame() {
        let result = decode(&[0x11, 0x03, 0x00], &TopicVariant::State, "AA");
        assert!(matches!(result, Err(ProtocolError::FrameTooShort { len: 3, .. })));
    }

    #[test]
    fn test_decode_full_dump_bit_mapping() {
        let mut dump = RegisterDump::full();
        dump.set(41, 1 << 11).set(56, 923).set(6, 120).set(39, 300);
        let raw = frame_from_registers(dump.registers());

        let update = decode(&raw, &TopicVariant::Client04, "AA").unwrap();
        let r = &update.readings;
        assert_eq!(r.ac_output, Some(true));
        assert_eq!(r.dc_output, Some(false));
        assert_eq!(r.usb_output, Some(false));
        assert_eq!(r.soc, Some(92.3));
        assert_eq!(r.total_input, Some(120));
        assert_eq!(r.total_output, Some(300));

        dump.set(41, 1 << 9);
        let raw = frame_from_registers(dump.registers());
        let update = decode(&raw, &TopicVariant::State, "AA").unwrap();
        assert_eq!(update.readings.ac_output, Some(false));
        assert_eq!(update.readings.dc_output, Some(false));
        assert_eq!(update.readings.usb_output, Some(true));
    }

    #[test]
    fn test_decode_settings_block() {
        let raw = full_dump(|dump| {
            dump.set(20, 12)
                .set(57, 1)
                .set(63, 120)
                .set(66, 150)
                .set(67, 850)
                .set(68, 30);
        });

        let update = decode(&raw, &TopicVariant::ClientData, "AA").unwrap();
        let r = &update.readings;
        assert_eq!(r.maximum_charging_current, Some(12));
        assert_eq!(r.ac_silent_charging, Some(true));
        assert_eq!(r.stop_charge_after, Some(120));
        assert_eq!(r.discharge_lower_limit, Some(150));
        assert_eq!(r.ac_charging_upper_limit, Some(850));
        assert_eq!(r.whole_machine_unused_time, Some(30));
        // settings topic never reports power flow
        assert_eq!(r.soc, None);
        assert_eq!(r.ac_output, None);
    }

    #[test]
    fn test_zero_limits_policy() {
        let raw = full_dump(|dump| {
            dump.set(20, 0).set(66, 0).set(67, 0);
        });

        let update = decode(&raw, &TopicVariant::Client04, "AA").unwrap();
        assert_eq!(update.readings.maximum_charging_current, None);
        assert_eq!(update.readings.ac_charging_upper_limit, None);
        assert_eq!(update.readings.discharge_lower_limit, Some(0));
    }

    #[test]
    fn test_decode_partial_frames() {
        let raw = frame_from_registers(&vec![0; 60]);
        let update = decode(&raw, &TopicVariant::Client("05".into()), "AA").unwrap();
        assert_eq!(update.readings.soc, Some(0.0));
        assert!(!update.readings.has(StateField::MaximumChargingCurrent));

        let mut registers = vec![0; 70];
        registers[20] = 8;
        registers[67] = 900;
        let raw = frame_from_registers(&registers);
        let update = decode(&raw, &TopicVariant::ClientData, "AA").unwrap();
        assert_eq!(update.readings.maximum_charging_current, Some(8));
        assert_eq!(update.readings.ac_charging_upper_limit, Some(900));
        assert_eq!(update.readings.total_input, None);

        let raw = frame_from_registers(&vec![1; 40]);
        assert!(decode(&raw, &TopicVariant::State, "AA").unwrap().is_empty());
    }

    #[test]
    fn test_decode_ignores_non_response_topics() {
        let raw = full_dump(|dump| {
            dump.set(56, 500);
        });
        assert!(decode(&raw, &TopicVariant::Error, "AA").unwrap().is_empty());
        assert!(decode(&raw, &TopicVariant::Other, "AA").unwrap().is_empty());
    }

    #[test]
    fn test_merge_frame_preserves_unknown_fields() {
        let settings = full_dump(|dump| {
            dump.set(20, 15);
        });
        let state = merge_frame(
            &DeviceState::default(),
            "AA/device/response/client/data",
            &settings,
            now(),
        )
        .unwrap();
        assert_eq!(state.readings.maximum_charging_current, Some(15));

        let partial = frame_from_registers(&vec![0; 58]);
        let state = merge_frame(&state, "AA/device/response/client/05", &partial, now()).unwrap();
        assert_eq!(state.readings.maximum_charging_current, Some(15));
        assert_eq!(state.readings.soc, Some(0.0));
    }

    proptest! {
        #[test]
        fn decode_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..200)) {
            for variant in [TopicVariant::State, TopicVariant::ClientData, TopicVariant::Client("x".into())] {
                let _ = decode(&raw, &variant, "AA");
            }
        }

        #[test]
        fn soc_register_maps_to_percent(raw_soc in 0u16..=1000) {
            let raw = full_dump(|dump| { dump.set(56, raw_soc); });
            let update = decode(&raw, &TopicVariant::State, "AA").unwrap();
            let soc = update.readings.soc.unwrap();
            prop_assert!((soc - f64::from(raw_soc) / 10.0).abs() < 0.051);
        }
    }
}
