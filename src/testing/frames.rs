//! Builders for device response frames

use crate::protocol::codec::FULL_DUMP_REGISTERS;
use crate::protocol::modbus::{DEVICE_ADDRESS, FN_READ_HOLDING};

/// Register bank of a simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDump {
    registers: Vec<u16>,
}

impl RegisterDump {
    /// All 81 registers of a full dump, zeroed
    pub fn full() -> Self {
        Self::with_len(FULL_DUMP_REGISTERS)
    }

    pub fn with_len(len: usize) -> Self {
        Self {
            registers: vec![0; len],
        }
    }

    pub fn set(&mut self, index: usize, value: u16) -> &mut Self {
        if index >= self.registers.len() {
            self.registers.resize(index + 1, 0);
        }
        self.registers[index] = value;
        self
    }

    pub fn registers(&self) -> &[u16] {
        &self.registers
    }

    pub fn to_frame(&self) -> Vec<u8> {
        frame_from_registers(&self.registers)
    }
}

/// Response frame: six header bytes, then big-endian register pairs
pub fn frame_from_registers(registers: &[u16]) -> Vec<u8> {
    let byte_count = (registers.len() * 2).min(usize::from(u16::MAX)) as u16;
    let mut frame = vec![
        DEVICE_ADDRESS,
        FN_READ_HOLDING,
        0x00,
        0x00,
        (byte_count >> 8) as u8,
        (byte_count & 0xFF) as u8,
    ];
    for value in registers {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    frame
}

/// Full-dump frame with whatever registers `edit` sets
pub fn full_dump(edit: impl FnOnce(&mut RegisterDump)) -> Vec<u8> {
    let mut dump = RegisterDump::full();
    edit(&mut dump);
    dump.to_frame()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::modbus::{registers_from_payload, RESPONSE_HEADER_LEN};

    #[test]
    fn test_frame_layout() {
        let frame = frame_from_registers(&[0x0102, 0xA0B0]);
        assert_eq!(frame.len(), RESPONSE_HEADER_LEN + 4);
        assert_eq!(&frame[RESPONSE_HEADER_LEN..], &[0x01, 0x02, 0xA0, 0xB0]);
        assert_eq!(registers_from_payload(&frame).unwrap(), vec![0x0102, 0xA0B0]);
    }

    #[test]
    fn test_full_dump_sets_registers() {
        let frame = full_dump(|dump| {
            dump.set(56, 500).set(80, 7);
        });
        let registers = registers_from_payload(&frame).unwrap();
        assert_eq!(registers.len(), FULL_DUMP_REGISTERS);
        assert_eq!(registers[56], 500);
        assert_eq!(registers[80], 7);
    }
}
