use std::collections::BTreeSet;

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral as PlatformPeripheral;
use futures::stream::BoxStream;
use futures::StreamExt;
use uuid::Uuid;

use crate::error::{Error, Result};


pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

pub const IMU_CONTROL_UUID: Uuid = Uuid::from_u128(0xfb005c81_02e7_f387_1cad_8acd2d8df0c8);
pub const IMU_DATA_UUID: Uuid = Uuid::from_u128(0xfb005c82_02e7_f387_1cad_8acd2d8df0c8);


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

/// The GATT operations a device session needs from a connected peripheral.
#[async_trait]
pub trait GattLink: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// Runs service discovery and returns the UUIDs of every characteristic found.
    async fn discover(&self) -> Result<BTreeSet<Uuid>>;

    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Notifications from every subscribed characteristic of the peripheral.
    async fn notifications(&self) -> Result<BoxStream<'static, Notification>>;

    async fn disconnect(&self) -> Result<()>;
}


pub struct BleLink {
    peripheral: PlatformPeripheral,
}

impl BleLink {
    pub fn new(peripheral: PlatformPeripheral) -> Self {
        BleLink { peripheral }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::ServiceDiscovery {
                device: self.peripheral.address().to_string(),
                reason: format!("characteristic {uuid} not found"),
            })
    }
}

#[async_trait]
impl GattLink for BleLink {
    async fn connect(&self) -> Result<()> {
        if !self.peripheral.is_connected().await? {
            self.peripheral.connect().await?;
        }
        Ok(())
    }

    async fn discover(&self) -> Result<BTreeSet<Uuid>> {
        self.peripheral.discover_services().await?;
        Ok(self.peripheral.characteristics().into_iter().map(|c| c.uuid).collect())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.write(&characteristic, data, WriteType::WithResponse).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Notification>> {
        let stream = self.peripheral.notifications().await?;
        Ok(stream
            .map(|data| Notification { uuid: data.uuid, value: data.value })
            .boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}


#[cfg(test)]
pub mod fake {
    //! In-memory link used by session and manager tests.

    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use futures::StreamExt;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    use super::{
        GattLink, Notification, HEART_RATE_MEASUREMENT_UUID, IMU_CONTROL_UUID, IMU_DATA_UUID,
    };
    use crate::error::{Error, Result};

    pub struct FakeLink {
        pub characteristics: BTreeSet<Uuid>,
        pub reject_connect: bool,
        pub reject_writes: AtomicBool,
        pub calls: Mutex<Vec<String>>,
        pub writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
        pub listeners: Mutex<usize>,
        tx: broadcast::Sender<Notification>,
    }

    impl FakeLink {
        pub fn polar() -> Self {
            Self::with_characteristics([
                HEART_RATE_MEASUREMENT_UUID,
                IMU_CONTROL_UUID,
                IMU_DATA_UUID,
            ])
        }

        pub fn with_characteristics(uuids: impl IntoIterator<Item = Uuid>) -> Self {
            let (tx, _) = broadcast::channel(64);
            FakeLink {
                characteristics: uuids.into_iter().collect(),
                reject_connect: false,
                reject_writes: AtomicBool::new(false),
                calls: Mutex::new(vec![]),
                writes: Mutex::new(vec![]),
                listeners: Mutex::new(0),
                tx,
            }
        }

        pub fn notify(&self, uuid: Uuid, value: &[u8]) -> usize {
            self.tx.send(Notification { uuid, value: value.to_vec() }).unwrap_or(0)
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl GattLink for FakeLink {
        async fn connect(&self) -> Result<()> {
            self.record("connect".into());
            if self.reject_connect {
                return Err(Error::Pairing { device: "fake".into(), reason: "rejected".into() });
            }
            Ok(())
        }

        async fn discover(&self) -> Result<BTreeSet<Uuid>> {
            self.record("discover".into());
            Ok(self.characteristics.clone())
        }

        async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
            self.record(format!("subscribe {characteristic}"));
            Ok(())
        }

        async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
            self.record(format!("unsubscribe {characteristic}"));
            Ok(())
        }

        async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
            self.record(format!("write {characteristic}"));
            if self.reject_writes.load(Ordering::SeqCst) {
                return Err(Error::Ble(btleplug::Error::NotConnected));
            }
            self.writes.lock().unwrap().push((characteristic, data.to_vec()));
            Ok(())
        }

        async fn notifications(&self) -> Result<BoxStream<'static, Notification>> {
            self.record("notifications".into());
            *self.listeners.lock().unwrap() += 1;
            let rx = self.tx.subscribe();
            Ok(stream::unfold(rx, |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(n) => return Some((n, rx)),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            })
            .boxed())
        }

        async fn disconnect(&self) -> Result<()> {
            self.record("disconnect".into());
            Ok(())
        }
    }
}
