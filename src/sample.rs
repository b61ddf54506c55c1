use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decoder::Acceleration;


/// Timestamp layout the backend stores (MySQL `DATETIME`, UTC).
pub const BACKEND_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stream {
    HeartRate,
    Imu,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingRate {
    #[default]
    Hz26,
    Hz200,
}

impl SamplingRate {
    pub fn hz(self) -> u16 {
        match self {
            SamplingRate::Hz26 => 26,
            SamplingRate::Hz200 => 200,
        }
    }

    /// Code carried in the IMU start command.
    pub fn command_code(self) -> u8 {
        match self {
            SamplingRate::Hz26 => 1,
            SamplingRate::Hz200 => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateSample {
    pub bpm: u16,
    pub timestamp_utc: DateTime<Utc>,
    pub device_id: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub acc_x: f64,
    pub acc_y: f64,
    pub acc_z: f64,
    pub sampling_rate: SamplingRate,
    pub device_id: String,
    pub timestamp_utc: DateTime<Utc>,
    pub note: Option<String>,
}

impl ImuSample {
    pub fn acceleration(&self) -> Acceleration {
        Acceleration { x: self.acc_x, y: self.acc_y, z: self.acc_z }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Sample {
    HeartRate(HeartRateSample),
    Imu(ImuSample),
}

impl Sample {
    pub fn device_id(&self) -> &str {
        match self {
            Sample::HeartRate(s) => &s.device_id,
            Sample::Imu(s) => &s.device_id,
        }
    }

    pub fn stream(&self) -> Stream {
        match self {
            Sample::HeartRate(_) => Stream::HeartRate,
            Sample::Imu(_) => Stream::Imu,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Sample::HeartRate(s) => s.timestamp_utc,
            Sample::Imu(s) => s.timestamp_utc,
        }
    }

    pub fn to_record(&self) -> SensorRecord {
        let mut record = SensorRecord {
            timestamp: self.timestamp().format(BACKEND_TIMESTAMP_FORMAT).to_string(),
            device_id: self.device_id().to_string(),
            bpm: None,
            acc_x: None,
            acc_y: None,
            acc_z: None,
            note: None,
            sampling_rate: None,
        };

        match self {
            Sample::HeartRate(s) => {
                record.bpm = Some(s.bpm);
                record.note = s.note.clone();
            }
            Sample::Imu(s) => {
                record.acc_x = Some(s.acc_x);
                record.acc_y = Some(s.acc_y);
                record.acc_z = Some(s.acc_z);
                record.sampling_rate = Some(s.sampling_rate.hz());
                record.note = s.note.clone();
            }
        }
        record
    }
}

/// Body of `POST /save-sensor-data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub timestamp: String,
    pub device_id: String,
    pub bpm: Option<u16>,
    pub acc_x: Option<f64>,
    pub acc_y: Option<f64>,
    pub acc_z: Option<f64>,
    pub note: Option<String>,
    pub sampling_rate: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateRow {
    #[serde(default)]
    pub id: Option<i64>,
    pub timestamp: String,
    pub device_id: String,
    pub bpm: Option<u16>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuRow {
    #[serde(default)]
    pub id: Option<i64>,
    pub timestamp: String,
    pub device_id: String,
    pub acc_x: Option<f64>,
    pub acc_y: Option<f64>,
    pub acc_z: Option<f64>,
    #[serde(default)]
    pub sampling_rate: Option<u16>,
    #[serde(default)]
    pub note: Option<String>,
}
