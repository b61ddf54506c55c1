use eframe::egui::{Button, Color32, Label, RichText, Rounding};

use crate::decoder::Acceleration;
use crate::signal::DiscoveredPeripheral;


const NO_DATA: &str = "No Data";

pub fn heart_rate_text(heart_rate: Option<u16>) -> String {
    match heart_rate {
        Some(bpm) => format!("Heart Rate: {bpm} BPM"),
        None => format!("Heart Rate: {NO_DATA}"),
    }
}

pub fn imu_lines(acc: Option<Acceleration>) -> Vec<String> {
    match acc {
        Some(acc) => vec![
            format!("X: {:.2} m/s²", acc.x),
            format!("Y: {:.2} m/s²", acc.y),
            format!("Z: {:.2} m/s²", acc.z),
        ],
        None => vec![format!("Accelerometer: {NO_DATA}")],
    }
}

pub fn get_heart_rate_label(heart_rate: Option<u16>) -> Label {
    let live_hr_text = RichText::new(heart_rate_text(heart_rate))
        .color(Color32::RED)
        .background_color(Color32::WHITE)
        .size(28.0);

    Label::new(live_hr_text)
}

pub fn get_imu_label(line: String) -> Label {
    Label::new(RichText::new(line).size(16.0))
}

/// Button text for a scan result. Names shared by several peripherals get the id appended.
pub fn peripheral_text(
    peripheral: &DiscoveredPeripheral,
    listed: &[DiscoveredPeripheral],
) -> String {
    let shared = listed.iter().filter(|p| p.name == peripheral.name).count() > 1;
    if shared {
        format!("{} ({})", peripheral.name, peripheral.id)
    } else {
        peripheral.name.clone()
    }
}

pub fn get_device_button(device_name: &str) -> Button<'static> {
    let device_text = RichText::new(device_name)
        .color(Color32::WHITE)
        .size(20.0);

    Button::new(device_text)
        .fill(Color32::BLUE)
        .rounding(Rounding::same(8.0))
        .selected(false)
}

pub fn get_active_device_frame(device_name: &str, measuring: bool) -> Label {
    let background = if measuring { Color32::DARK_GREEN } else { Color32::RED };
    let device_text = RichText::new(device_name)
        .color(Color32::WHITE)
        .background_color(background)
        .size(20.0);

    Label::new(device_text)
}

pub fn get_action_button(text: &str, color: Color32) -> Button<'static> {
    let text = RichText::new(text)
        .color(color)
        .background_color(Color32::WHITE)
        .size(16.0);

    Button::new(text)
        .fill(Color32::BLUE)
        .rounding(Rounding::same(8.0))
}
