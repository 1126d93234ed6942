use crate::data_container::InstrumentCalibration;
use crate::peak_fit::DEFAULT_TEMPERATURE;
use home::home_dir;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// User settings persisted between sessions.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct SettingsContainer {
    pub calibration: InstrumentCalibration,
    pub reference_mode: bool,
    /// Sample temperature in degrees Celsius used for the reference shifts.
    pub calibration_temperature: f64,
    pub export_path: PathBuf,
    pub export_scans: bool,
    /// Depth label for the heat map title, `None` for a depth average.
    pub heatmap_depth: Option<f64>,
    pub event_queue_depth: usize,
}

impl SettingsContainer {
    pub fn new() -> SettingsContainer {
        SettingsContainer {
            calibration: InstrumentCalibration::default(),
            reference_mode: false,
            calibration_temperature: DEFAULT_TEMPERATURE,
            export_path: home_dir()
                .unwrap_or_else(|| PathBuf::from("/"))
                .join("brillouin_scans"),
            export_scans: true,
            heatmap_depth: None,
            event_queue_depth: 64,
        }
    }

    /// Replaces values that cannot have been written by this program.
    pub fn sanitize(&mut self) {
        if !self.calibration.is_valid() {
            log::warn!("stored calibration {} is invalid, using defaults", self.calibration);
            self.calibration = InstrumentCalibration::default();
        }
        if !self.calibration_temperature.is_finite() {
            self.calibration_temperature = DEFAULT_TEMPERATURE;
        }
        if self.event_queue_depth == 0 {
            self.event_queue_depth = 1;
        }
    }
}

impl Default for SettingsContainer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_restores_invalid_values() {
        let mut settings = SettingsContainer::new();
        settings.calibration = InstrumentCalibration { fsr: -1.0, sd: 0.1 };
        settings.calibration_temperature = f64::NAN;
        settings.event_queue_depth = 0;
        settings.sanitize();
        assert_eq!(settings.calibration, InstrumentCalibration::default());
        assert_eq!(settings.calibration_temperature, DEFAULT_TEMPERATURE);
        assert_eq!(settings.event_queue_depth, 1);
    }
}
