use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::Notify;

use crate::backend::Backend;
use crate::error::Error;
use crate::offline::OfflineBuffer;
use crate::sample::Sample;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Buffered,
    Dropped,
}

/// Sends samples to the backend once, falling back to the offline buffer.
pub struct Uplink {
    backend: Arc<dyn Backend>,
    buffer: Arc<OfflineBuffer>,
    online: Arc<Notify>,
    offline: AtomicBool,
}

impl Uplink {
    pub fn new(backend: Arc<dyn Backend>, buffer: Arc<OfflineBuffer>, online: Arc<Notify>) -> Self {
        Uplink {
            backend,
            buffer,
            online,
            offline: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    pub async fn submit(&self, sample: Sample) -> Delivery {
        match self.backend.save_sensor_data(&sample.to_record()).await {
            Ok(()) => {
                if self.offline.swap(false, Ordering::AcqRel) {
                    info!("Backend reachable again");
                    self.online.notify_one();
                }
                Delivery::Delivered
            }
            Err(Error::Rejected { status, message }) => {
                let device = sample.device_id();
                error!("Backend rejected sample from {device} (HTTP {status}): {message}");
                Delivery::Dropped
            }
            Err(err) => {
                if !self.offline.swap(true, Ordering::AcqRel) {
                    warn!("Backend unreachable, buffering samples: {err}");
                }
                match self.buffer.enqueue(sample).await {
                    Ok(_) => Delivery::Buffered,
                    Err(err) => {
                        error!("Failed to buffer sample offline: {err}");
                        Delivery::Dropped
                    }
                }
            }
        }
    }

    /// Fire-and-forget variant of [`Uplink::submit`].
    pub fn spawn_submit(self: &Arc<Self>, sample: Sample) {
        let uplink = self.clone();
        tokio::spawn(async move {
            uplink.submit(sample).await;
        });
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::sample::HeartRateSample;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tempfile::TempDir;

    fn hr(secs: i64) -> Sample {
        Sample::HeartRate(HeartRateSample {
            bpm: 64,
            timestamp_utc: Utc.timestamp_opt(secs, 0).unwrap(),
            device_id: "Polar H10".into(),
            note: None,
        })
    }

    async fn setup(
        backend: Arc<FakeBackend>,
    ) -> (TempDir, Arc<OfflineBuffer>, Arc<Notify>, Uplink) {
        let dir = TempDir::new().unwrap();
        let buffer = Arc::new(OfflineBuffer::open(dir.path().join("q.json")).await.unwrap());
        let online = Arc::new(Notify::new());
        let uplink = Uplink::new(backend, buffer.clone(), online.clone());
        (dir, buffer, online, uplink)
    }

    #[tokio::test]
    async fn delivered_samples_are_not_buffered() {
        let backend = Arc::new(FakeBackend::default());
        let (_dir, buffer, _online, uplink) = setup(backend.clone()).await;

        assert_eq!(uplink.submit(hr(1)).await, Delivery::Delivered);
        assert!(buffer.is_empty().await);
        assert_eq!(backend.saved().len(), 1);
    }

    #[tokio::test]
    async fn failure_buffers_and_recovery_signals_online() {
        let backend = Arc::new(FakeBackend::failing_from(0));
        let (_dir, buffer, online, uplink) = setup(backend.clone()).await;

        assert_eq!(uplink.submit(hr(1)).await, Delivery::Buffered);
        assert_eq!(uplink.submit(hr(2)).await, Delivery::Buffered);
        assert!(uplink.is_offline());
        assert_eq!(buffer.len().await, 2);

        backend.set_online();
        assert_eq!(uplink.submit(hr(3)).await, Delivery::Delivered);
        assert!(!uplink.is_offline());
        tokio::time::timeout(Duration::from_millis(100), online.notified())
            .await
            .expect("online event");
    }

    #[tokio::test]
    async fn unwritable_queue_reports_dropped() {
        let backend = Arc::new(FakeBackend::failing_from(0));
        let dir = TempDir::new().unwrap();
        let parent = dir.path().join("data");
        let buffer = Arc::new(OfflineBuffer::open(parent.join("q.json")).await.unwrap());
        std::fs::write(&parent, b"").unwrap();
        let uplink = Uplink::new(backend, buffer.clone(), Arc::new(Notify::new()));

        assert_eq!(uplink.submit(hr(1)).await, Delivery::Dropped);
        assert_eq!(buffer.len().await, 0);
    }
}
