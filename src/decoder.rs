//! Decoding of raw characteristic notifications into physical units.

use crate::error::PayloadFormatError;


/// Accelerometer sensitivity of the Polar IMU stream, in g per count.
pub const ACC_SENSITIVITY: f64 = 0.0024;
pub const STANDARD_GRAVITY: f64 = 9.80665;

pub const IMU_MIN_PAYLOAD_LEN: usize = 16;
const IMU_X_OFFSET: usize = 10;
const IMU_Y_OFFSET: usize = 12;
const IMU_Z_OFFSET: usize = 14;

const HR_FORMAT_U16: u8 = 0b0000_0001;


#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Acceleration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Reads the BPM out of a Heart Rate Measurement payload.
///
/// Bit 0 of the flag byte selects a little-endian u16 at offset 1,
/// otherwise the BPM is the single byte at offset 1.
pub fn decode_heart_rate(value: &[u8]) -> Result<u16, PayloadFormatError> {
    let Some(&flags) = value.first() else {
        return Err(PayloadFormatError::Empty);
    };

    if flags & HR_FORMAT_U16 != 0 {
        let bytes = value.get(1..3).ok_or(PayloadFormatError::TooShort {
            needed: 3,
            actual: value.len(),
        })?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    } else {
        let byte = value.get(1).ok_or(PayloadFormatError::TooShort {
            needed: 2,
            actual: value.len(),
        })?;
        Ok(u16::from(*byte))
    }
}

/// Reads the first accelerometer frame out of an IMU data payload, in m/s².
pub fn decode_imu(value: &[u8]) -> Result<Acceleration, PayloadFormatError> {
    if value.len() < IMU_MIN_PAYLOAD_LEN {
        return Err(PayloadFormatError::TooShort {
            needed: IMU_MIN_PAYLOAD_LEN,
            actual: value.len(),
        });
    }

    Ok(Acceleration {
        x: axis(value, IMU_X_OFFSET),
        y: axis(value, IMU_Y_OFFSET),
        z: axis(value, IMU_Z_OFFSET),
    })
}

fn axis(value: &[u8], offset: usize) -> f64 {
    let raw = i16::from_le_bytes([value[offset], value[offset + 1]]);
    f64::from(raw) * ACC_SENSITIVITY * STANDARD_GRAVITY
}
