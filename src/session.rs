//! Per-device measurement session.
//!
//! A session exists from successful pairing until disconnect. It owns the
//! device's GATT link, the resolved characteristic handles and at most one
//! notification forwarding task. Sessions are only touched from the manager
//! task; the forwarding task just pushes raw payloads onto the manager's
//! channel.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::decoder::{decode_heart_rate, decode_imu};
use crate::error::{Error, PayloadFormatError, Result};
use crate::link::{
    GattLink, Notification, HEART_RATE_MEASUREMENT_UUID, IMU_CONTROL_UUID, IMU_DATA_UUID,
};
use crate::sample::{HeartRateSample, ImuSample, Sample, SamplingRate, Stream};


const IMU_START_COMMAND: [u8; 17] = [2, 2, 0, 1, 52, 0, 1, 1, 16, 0, 2, 1, 8, 0, 4, 1, 3];
const IMU_RATE_BYTE: usize = 7;

pub fn imu_start_command(rate: SamplingRate) -> [u8; 17] {
    let mut command = IMU_START_COMMAND;
    command[IMU_RATE_BYTE] = rate.command_code();
    command
}


/// Raw payload tagged with the session it came from.
#[derive(Debug, Clone)]
pub struct SessionNotification {
    pub session_id: String,
    pub received_at: DateTime<Utc>,
    pub notification: Notification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Characteristics {
    pub heart_rate: Uuid,
    pub imu_control: Uuid,
    pub imu_data: Uuid,
}

impl Characteristics {
    fn resolve(found: &BTreeSet<Uuid>) -> std::result::Result<Self, Uuid> {
        let pick = |uuid: Uuid| if found.contains(&uuid) { Ok(uuid) } else { Err(uuid) };
        Ok(Characteristics {
            heart_rate: pick(HEART_RATE_MEASUREMENT_UUID)?,
            imu_control: pick(IMU_CONTROL_UUID)?,
            imu_data: pick(IMU_DATA_UUID)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Paired,
    Measuring,
}


/// Lets through at most one sample per wall-clock second for each device and stream.
#[derive(Debug, Default)]
pub struct SecondDedup {
    last_second: HashMap<(String, Stream), i64>,
}

impl SecondDedup {
    pub fn admit(&mut self, device_id: &str, stream: Stream, now: DateTime<Utc>) -> bool {
        let second = now.timestamp();
        let key = (device_id.to_string(), stream);
        if self.last_second.get(&key) == Some(&second) {
            return false;
        }
        self.last_second.insert(key, second);
        true
    }

    pub fn clear(&mut self) {
        self.last_second.clear();
    }
}


pub struct DeviceSession {
    /// Stable platform id of the peripheral.
    id: String,
    /// Advertised name, used as the backend `device_id`.
    name: String,
    link: Arc<dyn GattLink>,
    characteristics: Option<Characteristics>,
    measuring: bool,
    ready_for_export: bool,
    subscription: Option<CancellationToken>,
    dedup: SecondDedup,
    note: Option<String>,
    sampling_rate: SamplingRate,
}

impl DeviceSession {
    /// Connects and resolves the heart-rate and IMU characteristics.
    pub async fn pair(
        id: impl Into<String>,
        name: impl Into<String>,
        link: Arc<dyn GattLink>,
        discovery_timeout: Duration,
    ) -> Result<Self> {
        let id = id.into();
        let name = name.into();

        info!("Connecting to {name}...");
        link.connect().await.map_err(|err| Error::Pairing {
            device: name.clone(),
            reason: err.to_string(),
        })?;

        info!("Discovering services of {name}...");
        let found = match tokio::time::timeout(discovery_timeout, link.discover()).await {
            Ok(Ok(found)) => found,
            Ok(Err(err)) => {
                let _ = link.disconnect().await;
                return Err(Error::ServiceDiscovery { device: name, reason: err.to_string() });
            }
            Err(_) => {
                let _ = link.disconnect().await;
                return Err(Error::ServiceDiscovery {
                    device: name,
                    reason: format!("timed out after {discovery_timeout:?}"),
                });
            }
        };

        let characteristics = match Characteristics::resolve(&found) {
            Ok(characteristics) => characteristics,
            Err(missing) => {
                let _ = link.disconnect().await;
                return Err(Error::ServiceDiscovery {
                    device: name,
                    reason: format!("characteristic {missing} not found"),
                });
            }
        };

        info!("Paired with {name}");
        Ok(DeviceSession {
            id,
            name,
            link,
            characteristics: Some(characteristics),
            measuring: false,
            ready_for_export: false,
            subscription: None,
            dedup: SecondDedup::default(),
            note: None,
            sampling_rate: SamplingRate::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        if self.measuring { SessionState::Measuring } else { SessionState::Paired }
    }

    pub fn ready_for_export(&self) -> bool {
        self.ready_for_export
    }

    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    /// Drops the characteristic handles, e.g. after the link went away underneath us.
    pub fn invalidate(&mut self) {
        if let Some(token) = self.subscription.take() {
            token.cancel();
        }
        self.characteristics = None;
        self.measuring = false;
    }

    /// Enables both notification streams and starts forwarding payloads into `sink`.
    ///
    /// Any earlier subscription is torn down first so each characteristic has
    /// exactly one listener.
    pub async fn start_measuring(
        &mut self,
        rate: SamplingRate,
        note: Option<String>,
        sink: UnboundedSender<SessionNotification>,
    ) -> Result<()> {
        let Some(characteristics) = self.characteristics else {
            warn!("Cannot start measuring on {}: session is stale", self.name);
            return Err(Error::StaleSession(self.name.clone()));
        };

        // From here until the new listener is up the session is back to Paired.
        self.teardown(&characteristics).await;
        self.measuring = false;

        let mut notifications = self.link.notifications().await?;
        let token = CancellationToken::new();
        let child = token.clone();
        let session_id = self.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    next = notifications.next() => {
                        let Some(notification) = next else { break; };
                        let forwarded = SessionNotification {
                            session_id: session_id.clone(),
                            received_at: Utc::now(),
                            notification,
                        };
                        if sink.send(forwarded).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Notification forwarding for {session_id} ended");
        });
        self.subscription = Some(token);

        let enabled = self.enable(&characteristics, rate).await;
        if let Err(err) = enabled {
            self.teardown(&characteristics).await;
            return Err(err);
        }

        self.sampling_rate = rate;
        self.note = note.filter(|n| !n.trim().is_empty());
        self.measuring = true;
        self.ready_for_export = false;
        self.dedup.clear();
        info!("Measuring on {} at {} Hz", self.name, rate.hz());
        Ok(())
    }

    async fn enable(&self, characteristics: &Characteristics, rate: SamplingRate) -> Result<()> {
        self.link.subscribe(characteristics.heart_rate).await?;
        self.link.write(characteristics.imu_control, &imu_start_command(rate)).await?;
        self.link.subscribe(characteristics.imu_data).await?;
        Ok(())
    }

    /// Cancels the forwarding task and disables notifications, ignoring link errors.
    async fn teardown(&mut self, characteristics: &Characteristics) {
        let Some(token) = self.subscription.take() else { return; };
        token.cancel();

        for uuid in [characteristics.heart_rate, characteristics.imu_data] {
            if let Err(err) = self.link.unsubscribe(uuid).await {
                warn!("Failed to unsubscribe {uuid} on {}: {err}", self.name);
            }
        }
    }

    pub async fn stop_measuring(&mut self) {
        if !self.measuring {
            return;
        }
        if let Some(characteristics) = self.characteristics {
            self.teardown(&characteristics).await;
        }
        self.measuring = false;
        self.ready_for_export = true;
        info!("Stopped measuring on {}", self.name);
    }

    pub async fn disconnect(mut self) -> Result<()> {
        self.stop_measuring().await;
        self.invalidate();
        self.link.disconnect().await?;
        info!("Disconnected from {}", self.name);
        Ok(())
    }

    /// Decodes a payload and applies the one-sample-per-second filter.
    ///
    /// `Ok(None)` means the payload was valid but suppressed, or arrived
    /// while the session was not measuring.
    pub fn handle_notification(
        &mut self,
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> std::result::Result<Option<Sample>, PayloadFormatError> {
        let Some(characteristics) = self.characteristics else { return Ok(None); };
        if !self.measuring {
            return Ok(None);
        }

        let sample = if notification.uuid == characteristics.heart_rate {
            let bpm = decode_heart_rate(&notification.value)?;
            Sample::HeartRate(HeartRateSample {
                bpm,
                timestamp_utc: now,
                device_id: self.name.clone(),
                note: self.note.clone(),
            })
        } else if notification.uuid == characteristics.imu_data {
            let acc = decode_imu(&notification.value)?;
            Sample::Imu(ImuSample {
                acc_x: acc.x,
                acc_y: acc.y,
                acc_z: acc.z,
                sampling_rate: self.sampling_rate,
                device_id: self.name.clone(),
                timestamp_utc: now,
                note: self.note.clone(),
            })
        } else {
            return Ok(None);
        };

        if !self.dedup.admit(&self.id, sample.stream(), now) {
            return Ok(None);
        }
        Ok(Some(sample))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::fake::FakeLink;
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn at(secs: i64, millis: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, millis * 1_000_000).unwrap()
    }

    fn hr(bpm: u8) -> Notification {
        Notification { uuid: HEART_RATE_MEASUREMENT_UUID, value: vec![0x00, bpm] }
    }

    fn imu(x: i16) -> Notification {
        let mut value = vec![0u8; 10];
        value.extend_from_slice(&x.to_le_bytes());
        value.extend_from_slice(&[0, 0, 0, 0]);
        Notification { uuid: IMU_DATA_UUID, value }
    }

    async fn paired(link: &Arc<FakeLink>) -> DeviceSession {
        DeviceSession::pair("AA:BB", "Polar H10 1", link.clone(), TIMEOUT).await.unwrap()
    }

    #[test]
    fn start_command_selects_rate() {
        assert_eq!(imu_start_command(SamplingRate::Hz26)[7], 1);
        assert_eq!(imu_start_command(SamplingRate::Hz200)[7], 2);
        assert_eq!(imu_start_command(SamplingRate::Hz200)[..7], IMU_START_COMMAND[..7]);
        assert_eq!(imu_start_command(SamplingRate::Hz200)[8..], IMU_START_COMMAND[8..]);
    }

    #[test]
    fn dedup_is_per_device_and_stream() {
        let mut dedup = SecondDedup::default();
        assert!(dedup.admit("a", Stream::HeartRate, at(10, 0)));
        assert!(!dedup.admit("a", Stream::HeartRate, at(10, 999)));
        assert!(dedup.admit("a", Stream::Imu, at(10, 500)));
        assert!(dedup.admit("b", Stream::HeartRate, at(10, 500)));
        assert!(dedup.admit("a", Stream::HeartRate, at(11, 0)));
    }

    #[tokio::test]
    async fn pair_rejected() {
        let mut link = FakeLink::polar();
        link.reject_connect = true;
        let result = DeviceSession::pair("id", "Polar", Arc::new(link), TIMEOUT).await;
        assert!(matches!(result, Err(Error::Pairing { .. })));
    }

    #[tokio::test]
    async fn pair_without_imu_service() {
        let link = Arc::new(FakeLink::with_characteristics([HEART_RATE_MEASUREMENT_UUID]));
        let result = DeviceSession::pair("id", "Polar", link.clone(), TIMEOUT).await;
        assert!(matches!(result, Err(Error::ServiceDiscovery { .. })));
        assert_eq!(link.calls().last().map(String::as_str), Some("disconnect"));
    }

    #[tokio::test]
    async fn start_writes_command_before_enabling_imu_data() {
        let link = Arc::new(FakeLink::polar());
        let mut session = paired(&link).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        session.start_measuring(SamplingRate::Hz200, Some("run".into()), tx).await.unwrap();

        assert_eq!(session.state(), SessionState::Measuring);
        assert_eq!(session.note(), Some("run"));
        let calls = link.calls();
        let write = calls.iter().position(|c| *c == format!("write {IMU_CONTROL_UUID}"));
        let imu_sub = calls.iter().position(|c| *c == format!("subscribe {IMU_DATA_UUID}"));
        let (write, imu_sub) = (write.unwrap(), imu_sub.unwrap());
        assert!(write < imu_sub);
        let writes = link.writes.lock().unwrap().clone();
        let command = imu_start_command(SamplingRate::Hz200).to_vec();
        assert_eq!(writes, vec![(IMU_CONTROL_UUID, command)]);
    }

    #[tokio::test]
    async fn restart_tears_down_previous_listener() {
        let link = Arc::new(FakeLink::polar());
        let mut session = paired(&link).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        session.start_measuring(SamplingRate::Hz26, None, tx.clone()).await.unwrap();
        session.start_measuring(SamplingRate::Hz26, None, tx).await.unwrap();

        let unsubscribes = link.calls().iter().filter(|c| c.starts_with("unsubscribe")).count();
        assert_eq!(unsubscribes, 2);
        assert_eq!(*link.listeners.lock().unwrap(), 2);

        // let the cancelled task observe its token
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(link.notify(HEART_RATE_MEASUREMENT_UUID, &[0, 60]), 1);

        let first = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.session_id, "AA:BB");
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn failed_restart_falls_back_to_paired() {
        let link = Arc::new(FakeLink::polar());
        let mut session = paired(&link).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        session.start_measuring(SamplingRate::Hz26, None, tx.clone()).await.unwrap();

        link.reject_writes.store(true, Ordering::SeqCst);
        let result = session.start_measuring(SamplingRate::Hz200, None, tx).await;

        assert!(matches!(result, Err(Error::Ble(_))));
        assert_eq!(session.state(), SessionState::Paired);
        assert!(session.handle_notification(&hr(70), at(3, 0)).unwrap().is_none());
        // old listener, the attempted one and its rollback
        let unsubscribes = link.calls().iter().filter(|c| c.starts_with("unsubscribe")).count();
        assert_eq!(unsubscribes, 4);
    }

    #[tokio::test]
    async fn notifications_are_deduplicated_per_second() {
        let link = Arc::new(FakeLink::polar());
        let mut session = paired(&link).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        session.start_measuring(SamplingRate::Hz26, Some("rest".into()), tx).await.unwrap();

        let first = session.handle_notification(&hr(75), at(100, 100)).unwrap();
        let second = session.handle_notification(&hr(76), at(100, 900)).unwrap();
        let imu_first = session.handle_notification(&imu(1000), at(100, 950)).unwrap();
        let third = session.handle_notification(&hr(77), at(101, 0)).unwrap();

        match first {
            Some(Sample::HeartRate(s)) => {
                assert_eq!(s.bpm, 75);
                assert_eq!(s.device_id, "Polar H10 1");
                assert_eq!(s.note.as_deref(), Some("rest"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(second.is_none());
        match imu_first {
            Some(Sample::Imu(s)) => {
                assert!((s.acc_x - 23.536).abs() < 1e-3);
                assert_eq!(s.sampling_rate, SamplingRate::Hz26);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn malformed_payload_does_not_consume_the_second() {
        let link = Arc::new(FakeLink::polar());
        let mut session = paired(&link).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        session.start_measuring(SamplingRate::Hz26, None, tx).await.unwrap();

        let short = Notification { uuid: IMU_DATA_UUID, value: vec![0; 8] };
        assert!(session.handle_notification(&short, at(5, 0)).is_err());
        assert!(session.handle_notification(&imu(1), at(5, 10)).unwrap().is_some());
    }

    #[tokio::test]
    async fn stop_marks_ready_for_export_and_ignores_late_payloads() {
        let link = Arc::new(FakeLink::polar());
        let mut session = paired(&link).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        session.start_measuring(SamplingRate::Hz26, None, tx).await.unwrap();

        session.stop_measuring().await;

        assert_eq!(session.state(), SessionState::Paired);
        assert!(session.ready_for_export());
        assert!(session.handle_notification(&hr(80), at(1, 0)).unwrap().is_none());
        assert!(link.calls().contains(&format!("unsubscribe {HEART_RATE_MEASUREMENT_UUID}")));
    }

    #[tokio::test]
    async fn stale_session_refuses_to_start() {
        let link = Arc::new(FakeLink::polar());
        let mut session = paired(&link).await;
        session.invalidate();
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = session.start_measuring(SamplingRate::Hz26, None, tx).await;
        assert!(matches!(result, Err(Error::StaleSession(_))));
        assert!(!link.calls().iter().any(|c| c.starts_with("subscribe")));
    }

    #[tokio::test]
    async fn disconnect_stops_first() {
        let link = Arc::new(FakeLink::polar());
        let mut session = paired(&link).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        session.start_measuring(SamplingRate::Hz26, None, tx).await.unwrap();

        session.disconnect().await.unwrap();

        let calls = link.calls();
        let unsub = calls.iter().position(|c| c.starts_with("unsubscribe")).unwrap();
        let disc = calls.iter().rposition(|c| c == "disconnect").unwrap();
        assert!(unsub < disc);
    }
}
