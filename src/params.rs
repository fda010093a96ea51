//! Calibration record stored in the device EEPROM.
//!
//! Layout (little-endian, starting at [`EEPROM_BASE`]):
//!
//! | offset | size | field                          |
//! |--------|------|--------------------------------|
//! | 0      | 2    | version, always [`PARAMS_MAGIC`] |
//! | 2      | 12   | low-endpoint coefficients, f32 |
//! | 14     | 12   | high-endpoint coefficients, f32 |

use crate::calibration::AnalogCalibration;

pub const PARAMS_MAGIC: u16 = 0xB0B2;
pub const EEPROM_BASE: u16 = 100;
pub const RECORD_LEN: usize = 2 + 6 * 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationRecord {
    pub version: u16,
    pub low: [f32; 3],
    pub high: [f32; 3],
}

impl CalibrationRecord {
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_calibration(calibration: &AnalogCalibration) -> Self {
        Self {
            version: PARAMS_MAGIC,
            low: calibration.low.map(|k| k as f32),
            high: calibration.high.map(|k| k as f32),
        }
    }

    /// Anything else is blank or foreign EEPROM content.
    pub fn is_valid(&self) -> bool {
        self.version == PARAMS_MAGIC
    }

    pub fn calibration(&self) -> AnalogCalibration {
        AnalogCalibration {
            low: self.low.map(f64::from),
            high: self.high.map(f64::from),
        }
    }

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut bytes = [0u8; RECORD_LEN];
        bytes[..2].copy_from_slice(&self.version.to_le_bytes());
        for (i, k) in self.low.iter().chain(self.high.iter()).enumerate() {
            let start = 2 + i * 4;
            bytes[start..start + 4].copy_from_slice(&k.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8; RECORD_LEN]) -> Self {
        let coefficient = |i: usize| {
            let start = 2 + i * 4;
            f32::from_le_bytes([
                bytes[start],
                bytes[start + 1],
                bytes[start + 2],
                bytes[start + 3],
            ])
        };
        Self {
            version: u16::from_le_bytes([bytes[0], bytes[1]]),
            low: [coefficient(0), coefficient(1), coefficient(2)],
            high: [coefficient(3), coefficient(4), coefficient(5)],
        }
    }
}
