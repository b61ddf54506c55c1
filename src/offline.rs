//! Durable queue of samples the backend has not acknowledged yet.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::error::Result;
use crate::sample::Sample;


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueueEntry {
    pub sample: Sample,
    pub queued_at: DateTime<Utc>,
}

impl OfflineQueueEntry {
    fn same_reading(&self, sample: &Sample) -> bool {
        self.sample.device_id() == sample.device_id()
            && self.sample.stream() == sample.stream()
            && self.sample.timestamp() == sample.timestamp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub remaining: usize,
}


pub struct OfflineBuffer {
    path: PathBuf,
    entries: Mutex<Vec<OfflineQueueEntry>>,
    flushing: AtomicBool,
}

/// Clears the flushing flag when a flush ends, however it ends.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OfflineBuffer {
    /// Loads the queue stored at `path`. A missing file is an empty queue.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => vec![],
            Err(err) => return Err(err.into()),
        };

        let buffer = OfflineBuffer {
            path,
            entries: Mutex::new(entries),
            flushing: AtomicBool::new(false),
        };
        let pending = buffer.len().await;
        if pending > 0 {
            info!("{pending} offline samples waiting for delivery");
        }
        Ok(buffer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    #[cfg(test)]
    pub async fn entries(&self) -> Vec<OfflineQueueEntry> {
        self.entries.lock().await.clone()
    }

    /// Appends a sample unless it repeats the last queued reading.
    /// Returns whether the sample was queued.
    pub async fn enqueue(&self, sample: Sample) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if entries.last().is_some_and(|last| last.same_reading(&sample)) {
            debug!("Skipping duplicate offline sample for {}", sample.device_id());
            return Ok(false);
        }

        // Memory only changes once the file holds the new queue.
        let mut next = entries.clone();
        next.push(OfflineQueueEntry { sample, queued_at: Utc::now() });
        self.persist(&next).await?;
        *entries = next;
        Ok(true)
    }

    /// Delivers queued samples in order, stopping at the first failure.
    ///
    /// Returns `None` if another flush is already running.
    pub async fn flush(&self, backend: &dyn Backend) -> Result<Option<FlushReport>> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Offline flush already in progress");
            return Ok(None);
        }
        let _guard = FlushGuard(&self.flushing);

        // Deliver from a snapshot so enqueue is never blocked on the network.
        let pending = self.entries.lock().await.clone();
        if pending.is_empty() {
            return Ok(Some(FlushReport { delivered: 0, remaining: 0 }));
        }

        let mut delivered = 0;
        for entry in &pending {
            if let Err(err) = backend.save_sensor_data(&entry.sample.to_record()).await {
                warn!("Offline flush stopped after {delivered} of {}: {err}", pending.len());
                break;
            }
            delivered += 1;
        }

        // Only this flush removes entries, so the delivered ones are still at the front.
        let mut entries = self.entries.lock().await;
        if delivered > 0 {
            // If this write fails the delivered prefix stays queued and is sent again later.
            let rest = entries[delivered..].to_vec();
            self.persist(&rest).await?;
            *entries = rest;
            info!("Flushed {delivered} offline samples, {} remaining", entries.len());
        }
        Ok(Some(FlushReport { delivered, remaining: entries.len() }))
    }

    /// Flushes on every tick of `period` and whenever `online` is notified.
    pub async fn run_flush_loop(
        self: Arc<Self>,
        backend: Arc<dyn Backend>,
        online: Arc<Notify>,
        period: Duration,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {},
                _ = online.notified() => debug!("Backend reachable again, flushing"),
            }

            if let Err(err) = self.flush(backend.as_ref()).await {
                warn!("Failed to persist offline queue: {err}");
            }
        }
    }

    async fn persist(&self, entries: &[OfflineQueueEntry]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
