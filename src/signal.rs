use std::path::PathBuf;

use crate::decoder::Acceleration;
use crate::sample::{HeartRateRow, ImuRow, SamplingRate};


/// A named peripheral seen while scanning. `id` is the same key sessions use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    pub id: String,
    pub name: String,
}

/// Sent from the session manager to the dashboard.
#[derive(Debug, Clone)]
pub enum SessionSignal {
    ScanStarted,
    ScanStopped,
    DiscoveredPeripherals(Vec<DiscoveredPeripheral>),
    DevicePaired {
        id: String,
        name: String,
    },
    MeasuringChanged {
        id: String,
        measuring: bool,
        ready_for_export: bool,
    },
    HeartRate {
        id: String,
        bpm: u16,
    },
    Imu {
        id: String,
        acc: Acceleration,
    },
    DeviceDisconnected {
        id: String,
    },
    History {
        id: String,
        heart_rate: Vec<HeartRateRow>,
        imu: Vec<ImuRow>,
    },
    Exported {
        id: String,
        path: PathBuf,
    },
    Status(String),
}

/// Sent from the dashboard to the session manager.
#[derive(Debug, Clone)]
pub enum GuiSignal {
    StartScanning,
    StopScanning,
    ConnectDevice(DiscoveredPeripheral),
    StartMeasuring {
        id: String,
        rate: SamplingRate,
        note: Option<String>,
    },
    StopMeasuring(String),
    Disconnect(String),
    LoadHistory(String),
    ExportSelected {
        id: String,
        sensor_ids: Vec<String>,
        imu_ids: Vec<String>,
    },
    ExportAll(String),
}
