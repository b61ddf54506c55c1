use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use eframe::egui::{self, Color32, ScrollArea};
use log::{error, info};
use tokio::spawn;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

mod backend;
mod decoder;
mod error;
mod link;
mod manager;
mod offline;
mod sample;
mod session;
mod settings;
mod signal;
mod uplink;
mod widget;

use backend::{Backend, HttpBackend};
use decoder::Acceleration;
use manager::SessionManager;
use offline::OfflineBuffer;
use sample::{HeartRateRow, ImuRow, SamplingRate};
use settings::Settings;
use signal::{DiscoveredPeripheral, GuiSignal, SessionSignal};
use uplink::Uplink;

const MAX_FPS: f64 = 30.0;


#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let data_dir = settings::app_data_dir()?;
    let settings = Settings::load_or_reset(&settings::settings_path(&data_dir))?;
    info!("Backend at {}", settings.backend_url);

    let http = Arc::new(HttpBackend::new(&settings.backend_url)?);
    let buffer = Arc::new(OfflineBuffer::open(settings::offline_queue_path(&data_dir)).await?);
    info!("Offline queue at {}", buffer.path().display());
    let online = Arc::new(Notify::new());
    let uplink = Arc::new(Uplink::new(http.clone(), buffer.clone(), online.clone()));

    let shutdown = CancellationToken::new();
    let backend: Arc<dyn Backend> = http.clone();
    let flush_every = settings.flush_interval();
    spawn(buffer.clone().run_flush_loop(backend, online, flush_every, shutdown.clone()));

    let (tx_to_gui, rx_from_manager) = mpsc::unbounded_channel();
    let (tx_from_gui, rx_from_gui) = mpsc::unbounded_channel();

    let default_rate = settings.sampling_rate;
    let mut session_manager = SessionManager::new(tx_to_gui, rx_from_gui, uplink, http, settings);
    let manager_task = spawn(async move {
        if let Err(err) = session_manager.run().await {
            error!("Session manager stopped: {err:#}");
        }
    });

    let native_options = eframe::NativeOptions::default();
    let result = eframe::run_native(
        "pulsedash",
        native_options,
        Box::new(move |cc| {
            Ok(Box::new(Dashboard::new(cc, rx_from_manager, tx_from_gui, default_rate)))
        }),
    );
    if let Err(err) = result {
        error!("Dashboard failed: {err}");
    }

    // The dashboard dropped its sender, so the manager disconnects everything and returns.
    let _ = manager_task.await;
    shutdown.cancel();
    Ok(())
}


struct HistoryView {
    heart_rate: Vec<(HeartRateRow, bool)>,
    imu: Vec<(ImuRow, bool)>,
}

impl HistoryView {
    fn selection(&self) -> (Vec<String>, Vec<String>) {
        let sensor_ids = self
            .heart_rate
            .iter()
            .filter(|(_, on)| *on)
            .map(|(row, _)| row.timestamp.clone())
            .collect();
        let imu_ids = self
            .imu
            .iter()
            .filter(|(_, on)| *on)
            .map(|(row, _)| row.timestamp.clone())
            .collect();
        (sensor_ids, imu_ids)
    }
}

struct DeviceCard {
    id: String,
    name: String,
    heart_rate: Option<u16>,
    acc: Option<Acceleration>,
    measuring: bool,
    ready_for_export: bool,
    note: String,
    rate: SamplingRate,
    history: Option<HistoryView>,
}

struct Dashboard {
    rx_from_manager: UnboundedReceiver<SessionSignal>,
    tx_from_gui: UnboundedSender<GuiSignal>,
    frame_time: Duration,
    scanning: bool,
    peris: Vec<DiscoveredPeripheral>,
    devices: Vec<DeviceCard>,
    default_rate: SamplingRate,
    status: Option<String>,
}

impl Dashboard {
    fn new(
        _cc: &eframe::CreationContext<'_>,
        rx_from_manager: UnboundedReceiver<SessionSignal>,
        tx_from_gui: UnboundedSender<GuiSignal>,
        default_rate: SamplingRate,
    ) -> Self {
        Dashboard {
            rx_from_manager,
            tx_from_gui,
            frame_time: Duration::from_secs_f64(1.0 / MAX_FPS),
            scanning: false,
            peris: vec![],
            devices: vec![],
            default_rate,
            status: None,
        }
    }

    fn send(&self, signal: GuiSignal) {
        let _ = self.tx_from_gui.send(signal);
    }

    fn card(&mut self, id: &str) -> Option<&mut DeviceCard> {
        self.devices.iter_mut().find(|d| d.id == id)
    }

    fn read_channel(&mut self) {
        while let Ok(signal) = self.rx_from_manager.try_recv() {
            match signal {
                SessionSignal::ScanStarted => self.scanning = true,
                SessionSignal::ScanStopped => self.scanning = false,
                SessionSignal::DiscoveredPeripherals(peris) => self.peris = peris,
                SessionSignal::DevicePaired { id, name } => self.devices.push(DeviceCard {
                    id,
                    name,
                    heart_rate: None,
                    acc: None,
                    measuring: false,
                    ready_for_export: false,
                    note: String::new(),
                    rate: self.default_rate,
                    history: None,
                }),
                SessionSignal::MeasuringChanged { id, measuring, ready_for_export } => {
                    if let Some(card) = self.card(&id) {
                        card.measuring = measuring;
                        card.ready_for_export = ready_for_export;
                    }
                }
                SessionSignal::HeartRate { id, bpm } => {
                    if let Some(card) = self.card(&id) {
                        card.heart_rate = Some(bpm);
                    }
                }
                SessionSignal::Imu { id, acc } => {
                    if let Some(card) = self.card(&id) {
                        card.acc = Some(acc);
                    }
                }
                SessionSignal::DeviceDisconnected { id } => self.devices.retain(|d| d.id != id),
                SessionSignal::History { id, heart_rate, imu } => {
                    if let Some(card) = self.card(&id) {
                        card.history = Some(HistoryView {
                            heart_rate: heart_rate.into_iter().map(|r| (r, false)).collect(),
                            imu: imu.into_iter().map(|r| (r, false)).collect(),
                        });
                    }
                }
                SessionSignal::Exported { path, .. } => {
                    self.status = Some(format!("Saved {}", path.display()));
                }
                SessionSignal::Status(message) => self.status = Some(message),
            }
        }
    }

    fn device_card(ui: &mut egui::Ui, card: &mut DeviceCard, outbox: &mut Vec<GuiSignal>) {
        ui.add(widget::get_active_device_frame(&card.name, card.measuring));
        ui.add(widget::get_heart_rate_label(card.heart_rate));
        for line in widget::imu_lines(card.acc) {
            ui.add(widget::get_imu_label(line));
        }

        ui.horizontal(|ui| {
            ui.label("Note:");
            ui.add_enabled(!card.measuring, egui::TextEdit::singleline(&mut card.note));
            ui.radio_value(&mut card.rate, SamplingRate::Hz26, "26 Hz");
            ui.radio_value(&mut card.rate, SamplingRate::Hz200, "200 Hz");
        });

        ui.horizontal(|ui| {
            if card.measuring {
                if ui.add(widget::get_action_button("Stop", Color32::RED)).clicked() {
                    outbox.push(GuiSignal::StopMeasuring(card.id.clone()));
                }
            } else if ui.add(widget::get_action_button("Start", Color32::DARK_GREEN)).clicked() {
                let note = Some(card.note.trim().to_string()).filter(|n| !n.is_empty());
                let id = card.id.clone();
                outbox.push(GuiSignal::StartMeasuring { id, rate: card.rate, note });
            }
            if ui.add(widget::get_action_button("History", Color32::BLACK)).clicked() {
                outbox.push(GuiSignal::LoadHistory(card.id.clone()));
            }
            let export_all = widget::get_action_button("Export all", Color32::BLACK);
            if card.ready_for_export && ui.add(export_all).clicked() {
                outbox.push(GuiSignal::ExportAll(card.id.clone()));
            }
            if ui.add(widget::get_action_button("DC", Color32::RED)).clicked() {
                outbox.push(GuiSignal::Disconnect(card.id.clone()));
            }
        });

        if let Some(history) = &mut card.history {
            ui.collapsing("Heart Rate Data", |ui| {
                for (row, selected) in history.heart_rate.iter_mut() {
                    let bpm = row.bpm.map_or("-".to_string(), |b| b.to_string());
                    let note = row.note.as_deref().unwrap_or("");
                    ui.checkbox(selected, format!("{}  {bpm} BPM  {note}", row.timestamp));
                }
            });
            ui.collapsing("IMU Data", |ui| {
                for (row, selected) in history.imu.iter_mut() {
                    let axis = |v: Option<f64>| v.map_or("-".to_string(), |v| format!("{v:.2}"));
                    let rate = row.sampling_rate.map_or("-".to_string(), |r| r.to_string());
                    ui.checkbox(
                        selected,
                        format!(
                            "{}  X {} Y {} Z {}  {rate} Hz  {}",
                            row.timestamp,
                            axis(row.acc_x),
                            axis(row.acc_y),
                            axis(row.acc_z),
                            row.note.as_deref().unwrap_or("")
                        ),
                    );
                }
            });

            let (sensor_ids, imu_ids) = history.selection();
            let any = !sensor_ids.is_empty() || !imu_ids.is_empty();
            let download = widget::get_action_button("Download Selected Data", Color32::BLACK);
            if ui.add_enabled(any, download).clicked() {
                outbox.push(GuiSignal::ExportSelected { id: card.id.clone(), sensor_ids, imu_ids });
            }
        }
    }
}

impl eframe::App for Dashboard {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.read_channel();

        let mut outbox = vec![];
        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("Polar Sensor Data");

            let scan_text = if self.scanning { "Stop scan" } else { "Scan for sensors" };
            if ui.button(scan_text).clicked() {
                let toggle =
                    if self.scanning { GuiSignal::StopScanning } else { GuiSignal::StartScanning };
                outbox.push(toggle);
            }

            for device in &self.peris {
                let text = widget::peripheral_text(device, &self.peris);
                if ui.add(widget::get_device_button(&text)).clicked() {
                    outbox.push(GuiSignal::ConnectDevice(device.clone()));
                }
            }

            if let Some(status) = &self.status {
                ui.label(status.as_str());
            }

            ui.separator();
            ScrollArea::vertical().show(ui, |ui| {
                for card in self.devices.iter_mut() {
                    ui.group(|ui| Self::device_card(ui, card, &mut outbox));
                }
            });
        });

        for signal in outbox {
            self.send(signal);
        }

        ctx.request_repaint_after(self.frame_time);
    }
}
