//! Modbus RTU framing as used inside the MQTT payloads
//!
//! Request frames are always eight bytes:
//! `[address, function, reg_hi, reg_lo, value_hi, value_lo, crc_hi, crc_lo]`.
//! Response payloads carry a six byte header followed by big-endian register
//! pairs.

use super::ProtocolError;

/// Bus address every power station answers on
pub const DEVICE_ADDRESS: u8 = 0x11;

pub const FN_READ_HOLDING: u8 = 0x03;
pub const FN_WRITE_SINGLE: u8 = 0x06;

/// Bytes stripped from every inbound payload before register repacking
pub const RESPONSE_HEADER_LEN: usize = 6;

/// Number of holding registers requested by the settings read
pub const SETTINGS_READ_COUNT: u16 = 80;

/// Register offsets, shared by the write map and the telemetry dump
pub mod registers {
    pub const TOTAL_INPUT: usize = 6;
    pub const MAX_CHARGE_CURRENT: u16 = 20;
    pub const USB_OUTPUT: u16 = 24;
    pub const DC_OUTPUT: u16 = 25;
    pub const AC_OUTPUT: u16 = 26;
    pub const TOTAL_OUTPUT: usize = 39;
    pub const OUTPUT_BITMASK: usize = 41;
    pub const STATE_OF_CHARGE: usize = 56;
    pub const AC_SILENT_CHARGING: usize = 57;
    pub const USB_STANDBY: usize = 59;
    pub const AC_STANDBY: usize = 60;
    pub const DC_STANDBY: usize = 61;
    pub const SCREEN_REST: usize = 62;
    pub const STOP_CHARGE_AFTER: u16 = 63;
    pub const DISCHARGE_LOWER_LIMIT: u16 = 66;
    pub const CHARGE_UPPER_LIMIT: u16 = 67;
    pub const WHOLE_MACHINE_UNUSED: usize = 68;
}

/// Bit positions inside the output bitmask register, counted from the LSB
pub mod bits {
    pub const LED: u16 = 3;
    pub const USB: u16 = 9;
    pub const DC: u16 = 10;
    pub const AC: u16 = 11;
}

/// CRC-16/MODBUS (init 0xFFFF, reflected polynomial 0xA001)
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF_u16, |mut crc, byte| {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
        crc
    })
}

fn frame(function: u8, register: u16, value: u16) -> Vec<u8> {
    let [reg_hi, reg_lo] = register.to_be_bytes();
    let [val_hi, val_lo] = value.to_be_bytes();
    let mut bytes = vec![DEVICE_ADDRESS, function, reg_hi, reg_lo, val_hi, val_lo];
    bytes.extend_from_slice(&crc16(&bytes).to_be_bytes());
    bytes
}

/// Single register write (function 0x06)
pub fn write_register(register: u16, value: u16) -> Vec<u8> {
    frame(FN_WRITE_SINGLE, register, value)
}

/// Holding register read (function 0x03) of `count` registers from `start`
pub fn read_registers(start: u16, count: u16) -> Vec<u8> {
    frame(FN_READ_HOLDING, start, count)
}

/// Combine a big-endian byte pair into one register value
pub fn high_low_to_int(high: u8, low: u8) -> u16 {
    u16::from_be_bytes([high, low])
}

/// Strip the response header and repack the body into registers.
///
/// A trailing odd byte is dropped.
pub fn registers_from_payload(raw: &[u8]) -> Result<Vec<u16>, ProtocolError> {
    if raw.len() < RESPONSE_HEADER_LEN {
        return Err(ProtocolError::FrameTooShort {
            len: raw.len(),
            min: RESPONSE_HEADER_LEN,
        });
    }

    Ok(raw[RESPONSE_HEADER_LEN..]
        .chunks_exact(2)
        .map(|pair| high_low_to_int(pair[0], pair[1]))
        .collect())
}

/// Whether `bit` (LSB-first) is set in `mask`
pub fn bit_is_set(mask: u16, bit: u16) -> bool {
    (mask >> bit) & 1 == 1
}
