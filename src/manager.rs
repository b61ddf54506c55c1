use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral, PeripheralId};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::backend::HttpBackend;
use crate::link::{BleLink, GattLink};
use crate::sample::{HeartRateRow, ImuRow, Sample, SamplingRate};
use crate::session::{DeviceSession, SessionNotification, SessionState};
use crate::settings::Settings;
use crate::signal::{DiscoveredPeripheral, GuiSignal, SessionSignal};
use crate::uplink::Uplink;


const SCAN_REFRESH: Duration = Duration::from_secs(1);


/// Owns every active device session and drives them from one task.
pub struct SessionManager {
    tx_to_gui: UnboundedSender<SessionSignal>,
    rx_from_gui: UnboundedReceiver<GuiSignal>,
    tx_notifications: UnboundedSender<SessionNotification>,
    rx_notifications: UnboundedReceiver<SessionNotification>,
    sessions: HashMap<String, DeviceSession>,
    uplink: Arc<Uplink>,
    history: Arc<HttpBackend>,
    settings: Settings,
    adapter: Option<Adapter>,
    events: BoxStream<'static, CentralEvent>,
    scanning: bool,
}

impl SessionManager {
    pub fn new(
        tx_to_gui: UnboundedSender<SessionSignal>,
        rx_from_gui: UnboundedReceiver<GuiSignal>,
        uplink: Arc<Uplink>,
        history: Arc<HttpBackend>,
        settings: Settings,
    ) -> Self {
        let (tx_notifications, rx_notifications) = mpsc::unbounded_channel();
        SessionManager {
            tx_to_gui,
            rx_from_gui,
            tx_notifications,
            rx_notifications,
            sessions: HashMap::new(),
            uplink,
            history,
            settings,
            adapter: None,
            events: stream::pending().boxed(),
            scanning: false,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let mut scan_refresh = tokio::time::interval(SCAN_REFRESH);

        loop {
            tokio::select! {
                signal = self.rx_from_gui.recv() => {
                    let Some(signal) = signal else { break; };
                    self.handle_gui_signal(signal).await;
                }
                Some(forwarded) = self.rx_notifications.recv() => {
                    self.handle_notification(forwarded);
                }
                Some(event) = self.events.next() => {
                    self.handle_central_event(event).await;
                }
                _ = scan_refresh.tick(), if self.scanning => {
                    if let Err(err) = self.report_peripherals().await {
                        warn!("Listing peripherals failed: {err:#}");
                    }
                }
            }
        }

        info!("Dashboard closed, disconnecting {} devices", self.sessions.len());
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.disconnect(&id).await;
        }
        Ok(())
    }

    fn send(&self, signal: SessionSignal) {
        let _ = self.tx_to_gui.send(signal);
    }

    fn status(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.send(SessionSignal::Status(message));
    }

    pub async fn handle_gui_signal(&mut self, signal: GuiSignal) {
        match signal {
            GuiSignal::StartScanning => {
                if let Err(err) = self.start_scan().await {
                    error!("Scan failed: {err:#}");
                    self.send(SessionSignal::Status(format!("Scan failed: {err}")));
                }
            }
            GuiSignal::StopScanning => self.stop_scan().await,
            GuiSignal::ConnectDevice(target) => {
                let name = target.name.clone();
                if let Err(err) = self.pair(target).await {
                    error!("Pairing with {name} failed: {err:#}");
                    self.send(SessionSignal::Status(format!("Could not connect to {name}: {err}")));
                }
            }
            GuiSignal::StartMeasuring { id, rate, note } => {
                self.start_measuring(&id, rate, note).await
            }
            GuiSignal::StopMeasuring(id) => self.stop_measuring(&id).await,
            GuiSignal::Disconnect(id) => self.disconnect(&id).await,
            GuiSignal::LoadHistory(id) => self.load_history(&id),
            GuiSignal::ExportSelected { id, sensor_ids, imu_ids } => {
                self.export(&id, Some((sensor_ids, imu_ids)))
            }
            GuiSignal::ExportAll(id) => self.export(&id, None),
        }
    }

    async fn adapter(&mut self) -> Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no Bluetooth adapter found"))?;
        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("(unnamed)".to_string()));

        self.events = adapter.events().await?;
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    async fn start_scan(&mut self) -> Result<()> {
        let adapter = self.adapter().await?;
        adapter.start_scan(ScanFilter::default()).await?;
        self.scanning = true;
        self.send(SessionSignal::ScanStarted);
        Ok(())
    }

    async fn stop_scan(&mut self) {
        if !self.scanning {
            return;
        }
        self.scanning = false;
        if let Some(adapter) = &self.adapter {
            if let Err(err) = adapter.stop_scan().await {
                warn!("Stopping scan failed: {err}");
            }
        }
        self.send(SessionSignal::ScanStopped);
    }

    async fn report_peripherals(&mut self) -> Result<()> {
        let adapter = self.adapter().await?;
        let mut seen = vec![];
        for peripheral in adapter.peripherals().await? {
            let name = peripheral_name(&peripheral).await;
            seen.push((session_key(&peripheral.id()), name));
        }
        let listed = discovered(seen, &self.settings.device_name_prefix);
        self.send(SessionSignal::DiscoveredPeripherals(listed));
        Ok(())
    }

    async fn pair(&mut self, target: DiscoveredPeripheral) -> Result<()> {
        let adapter = self.adapter().await?;

        let mut found = None;
        for peripheral in adapter.peripherals().await? {
            if session_key(&peripheral.id()) == target.id {
                found = Some(peripheral);
                break;
            }
        }
        let peripheral = found.ok_or_else(|| anyhow!("{} is no longer advertising", target.name))?;
        let name = peripheral_name(&peripheral).await.unwrap_or(target.name);

        self.pair_link(target.id, name, Arc::new(BleLink::new(peripheral))).await
    }

    /// Pairs over an already chosen link unless a session with `id` exists.
    pub async fn pair_link(
        &mut self,
        id: String,
        name: String,
        link: Arc<dyn GattLink>,
    ) -> Result<()> {
        if self.sessions.contains_key(&id) {
            self.status(format!("{name} is already connected"));
            return Ok(());
        }

        // A scan running alongside service discovery slows pairing down on most stacks.
        self.stop_scan().await;

        let timeout = self.settings.discovery_timeout();
        let session = DeviceSession::pair(id, name, link, timeout).await?;
        self.insert_session(session);
        Ok(())
    }

    pub fn insert_session(&mut self, session: DeviceSession) {
        let id = session.id().to_string();
        self.send(SessionSignal::DevicePaired { id: id.clone(), name: session.name().to_string() });
        self.sessions.insert(id, session);
    }

    async fn start_measuring(&mut self, id: &str, rate: SamplingRate, note: Option<String>) {
        let sink = self.tx_notifications.clone();
        let Some(session) = self.sessions.get_mut(id) else {
            warn!("Start requested for unknown session {id}");
            return;
        };

        let failure = match session.start_measuring(rate, note, sink).await {
            Ok(()) => None,
            Err(err) => Some(format!("Could not start measuring on {}: {err}", session.name())),
        };
        // A failed restart has already dropped the old listener.
        let signal = SessionSignal::MeasuringChanged {
            id: id.to_string(),
            measuring: session.state() == SessionState::Measuring,
            ready_for_export: session.ready_for_export(),
        };
        self.send(signal);
        if let Some(message) = failure {
            error!("{message}");
            self.send(SessionSignal::Status(message));
        }
    }

    async fn stop_measuring(&mut self, id: &str) {
        let Some(session) = self.sessions.get_mut(id) else {
            warn!("Stop requested for unknown session {id}");
            return;
        };
        session.stop_measuring().await;
        let signal = SessionSignal::MeasuringChanged {
            id: id.to_string(),
            measuring: session.state() == SessionState::Measuring,
            ready_for_export: session.ready_for_export(),
        };
        self.send(signal);
    }

    async fn disconnect(&mut self, id: &str) {
        let Some(session) = self.sessions.remove(id) else { return; };
        let name = session.name().to_string();
        if let Err(err) = session.disconnect().await {
            warn!("Disconnecting {name} failed: {err}");
        }
        self.send(SessionSignal::DeviceDisconnected { id: id.to_string() });
    }

    async fn handle_central_event(&mut self, event: CentralEvent) {
        if let CentralEvent::DeviceDisconnected(peripheral_id) = event {
            let id = session_key(&peripheral_id);
            if let Some(mut session) = self.sessions.remove(&id) {
                warn!("Lost connection to {}", session.name());
                session.invalidate();
                self.send(SessionSignal::DeviceDisconnected { id });
            }
        }
    }

    pub fn handle_notification(&mut self, forwarded: SessionNotification) {
        let Some(session) = self.sessions.get_mut(&forwarded.session_id) else {
            debug!("Dropping notification for closed session {}", forwarded.session_id);
            return;
        };

        let decoded = session.handle_notification(&forwarded.notification, forwarded.received_at);
        let sample = match decoded {
            Ok(Some(sample)) => sample,
            Ok(None) => return,
            Err(err) => {
                warn!("Dropping payload from {}: {err}", session.name());
                return;
            }
        };

        let id = forwarded.session_id;
        match &sample {
            Sample::HeartRate(s) => self.send(SessionSignal::HeartRate { id, bpm: s.bpm }),
            Sample::Imu(s) => self.send(SessionSignal::Imu { id, acc: s.acceleration() }),
        }
        self.uplink.spawn_submit(sample);
    }

    fn device_name(&self, id: &str) -> Option<String> {
        self.sessions.get(id).map(|s| s.name().to_string())
    }

    fn load_history(&self, id: &str) {
        let Some(name) = self.device_name(id) else {
            warn!("History requested for unknown session {id}");
            return;
        };
        let history = self.history.clone();
        let tx = self.tx_to_gui.clone();
        let id = id.to_string();

        tokio::spawn(async move {
            let rows: crate::error::Result<(Vec<HeartRateRow>, Vec<ImuRow>)> = async {
                Ok((history.recent_heart_rate(&name).await?, history.recent_imu(&name).await?))
            }
            .await;
            let signal = match rows {
                Ok((heart_rate, imu)) => SessionSignal::History { id, heart_rate, imu },
                Err(err) => {
                    error!("Fetching history of {name} failed: {err}");
                    SessionSignal::Status(format!("No history for {name}: {err}"))
                }
            };
            let _ = tx.send(signal);
        });
    }

    /// Downloads a CSV export and writes it into the export directory.
    fn export(&self, id: &str, selection: Option<(Vec<String>, Vec<String>)>) {
        let Some(name) = self.device_name(id) else {
            warn!("Export requested for unknown session {id}");
            return;
        };
        let history = self.history.clone();
        let tx = self.tx_to_gui.clone();
        let dir = self.settings.export_dir();
        let id = id.to_string();

        tokio::spawn(async move {
            let (csv, file_name) = match &selection {
                Some((sensor_ids, imu_ids)) => (
                    history.download_selected_csv(&name, sensor_ids, imu_ids).await,
                    format!("selected_data_{}.csv", file_safe(&name)),
                ),
                None => (
                    history.download_csv(&name).await,
                    format!("sensor_data_{}.csv", file_safe(&name)),
                ),
            };

            let signal = match write_export(csv, dir.join(file_name)).await {
                Ok(path) => {
                    info!("Exported {name} to {}", path.display());
                    SessionSignal::Exported { id, path }
                }
                Err(err) => {
                    error!("Export of {name} failed: {err:#}");
                    SessionSignal::Status(format!("Export failed: {err}"))
                }
            };
            let _ = tx.send(signal);
        });
    }
}

async fn write_export(csv: crate::error::Result<String>, path: PathBuf) -> Result<PathBuf> {
    let csv = csv?;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(&path, csv).await?;
    Ok(path)
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Sessions and scan results are keyed by the platform peripheral id.
fn session_key(id: &PeripheralId) -> String {
    format!("{id:?}")
}

/// Named peripherals matching `prefix`, one entry per peripheral id.
fn discovered(
    seen: impl IntoIterator<Item = (String, Option<String>)>,
    prefix: &str,
) -> Vec<DiscoveredPeripheral> {
    let mut listed: Vec<DiscoveredPeripheral> = seen
        .into_iter()
        .filter_map(|(id, name)| Some(DiscoveredPeripheral { id, name: name? }))
        .filter(|p| p.name.starts_with(prefix))
        .collect();
    listed.sort_by(|a, b| (&a.name, &a.id).cmp(&(&b.name, &b.id)));
    listed.dedup_by(|a, b| a.id == b.id);
    listed
}

async fn peripheral_name(peripheral: &PlatformPeripheral) -> Option<String> {
    let Ok(Some(properties)) = peripheral.properties().await else { return None; };

    properties.local_name
}
