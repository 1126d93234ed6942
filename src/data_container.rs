//! This module defines the data structures shared between the acquisition worker, the scan
//! controller and the display layer: line profiles, Lorentzian fit results, the instrument
//! calibration, committed scan records and the spatial context published by the pupil detector.

use crate::error::{CalibrationError, StoreError};
use crate::math_tools::lorentzian;
use image::GrayImage;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Number of samples in the cropped window that is handed to the peak fitter.
pub const PROFILE_LENGTH: usize = 80;

/// One camera row cropped around the spectral peaks.
///
/// The samples are the raw 16-bit intensities; the profile is never modified after creation.
#[derive(Clone, Debug, PartialEq)]
pub struct LineProfile {
    samples: Array1<u16>,
}

impl LineProfile {
    pub fn new(samples: Array1<u16>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &Array1<u16> {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples converted to `f64` for fitting.
    pub fn intensities(&self) -> Vec<f64> {
        self.samples.iter().map(|&s| s as f64).collect()
    }

    /// Pixel axis of the profile, `0, 1, ..., len - 1`.
    pub fn pixel_axis(&self) -> Vec<f64> {
        (0..self.samples.len()).map(|i| i as f64).collect()
    }
}

/// Free spectral range and spectral dispersion of the spectrometer.
///
/// # Fields
/// - `fsr`: free spectral range in GHz.
/// - `sd`: spectral dispersion in GHz per pixel.
///
/// Both values are strictly positive. Use [`InstrumentCalibration::new`] or
/// [`InstrumentCalibration::parse`] to construct a validated calibration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstrumentCalibration {
    pub fsr: f64,
    pub sd: f64,
}

impl Default for InstrumentCalibration {
    fn default() -> Self {
        InstrumentCalibration { fsr: 16.5, sd: 0.14 }
    }
}

impl InstrumentCalibration {
    pub fn new(fsr: f64, sd: f64) -> Result<Self, CalibrationError> {
        if !(fsr.is_finite() && fsr > 0.0) {
            return Err(CalibrationError::NonPositive {
                field: "FSR",
                value: fsr,
            });
        }
        if !(sd.is_finite() && sd > 0.0) {
            return Err(CalibrationError::NonPositive {
                field: "SD",
                value: sd,
            });
        }
        Ok(InstrumentCalibration { fsr, sd })
    }

    /// Parses the free-text FSR and SD entries typed by the user.
    pub fn parse(fsr: &str, sd: &str) -> Result<Self, CalibrationError> {
        let fsr_value = fsr.trim().parse::<f64>().map_err(|_| CalibrationError::Parse {
            field: "FSR",
            value: fsr.to_string(),
        })?;
        let sd_value = sd.trim().parse::<f64>().map_err(|_| CalibrationError::Parse {
            field: "SD",
            value: sd.to_string(),
        })?;
        Self::new(fsr_value, sd_value)
    }

    pub fn is_valid(&self) -> bool {
        Self::new(self.fsr, self.sd).is_ok()
    }

    /// Brillouin shift in GHz for a separation of `delta` pixels between the two peaks.
    pub fn shift_from_separation(&self, delta: f64) -> f64 {
        (self.fsr - delta * self.sd) / 2.0
    }
}

impl Display for InstrumentCalibration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FSR = {:.4} GHz, SD = {:.5} GHz/px", self.fsr, self.sd)
    }
}

/// Which peak model a fit used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeakMode {
    /// Two Lorentzians, one per half of the profile. Used for sample measurements.
    TwoPeak,
    /// Four Lorentzians, one per quarter of the profile. Used with the reference sample.
    FourPeak,
}

impl Display for PeakMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PeakMode::TwoPeak => write!(f, "two-peak"),
            PeakMode::FourPeak => write!(f, "four-peak"),
        }
    }
}

/// Parameters of a single Lorentzian line.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LorentzianPeak {
    pub gamma: f64,
    pub center: f64,
    pub amplitude: f64,
}

impl LorentzianPeak {
    pub fn evaluate(&self, x: f64) -> f64 {
        lorentzian(x, self.gamma, self.center, self.amplitude)
    }
}

/// Result of a successful peak fit.
///
/// # Fields
/// - `mode`: the model that was fitted.
/// - `peaks`: fitted peaks, ordered by position along the profile.
/// - `baseline`: shared constant offset.
/// - `shift`: Brillouin shift in GHz.
/// - `iterations`: optimizer iterations spent.
#[derive(Clone, Debug, PartialEq)]
pub struct PeakFitResult {
    pub mode: PeakMode,
    pub peaks: Vec<LorentzianPeak>,
    pub baseline: f64,
    pub shift: f64,
    pub iterations: usize,
}

impl PeakFitResult {
    /// Value of the fitted model at pixel `x`.
    pub fn evaluate(&self, x: f64) -> f64 {
        self.baseline + self.peaks.iter().map(|p| p.evaluate(x)).sum::<f64>()
    }

    /// Fitted model sampled on the pixel axis of a profile with `len` samples.
    pub fn curve(&self, len: usize) -> Vec<f64> {
        (0..len).map(|i| self.evaluate(i as f64)).collect()
    }

    pub fn centers(&self) -> Vec<f64> {
        self.peaks.iter().map(|p| p.center).collect()
    }
}

/// Position of the scan spot and of the pupil center, both in camera pixels.
///
/// Either may be unknown while the pupil detector has not published a value yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpatialContext {
    pub scan_location: Option<[i64; 2]>,
    pub detected_center: Option<[i64; 2]>,
}

impl SpatialContext {
    /// Scan location relative to the detected center, if both are known.
    pub fn relative_coordinate(&self) -> Option<[i64; 2]> {
        match (self.scan_location, self.detected_center) {
            (Some(location), Some(center)) => {
                Some([location[0] - center[0], location[1] - center[1]])
            }
            _ => None,
        }
    }
}

/// A committed scan at one spatial location.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanRecord {
    pub location_id: u64,
    pub relative_coordinate: [i64; 2],
    /// `(stage position, shift)` pairs in visitation order.
    pub shift_profile: Vec<(i64, f64)>,
    pub image_stack: Vec<GrayImage>,
    pub start_position: i64,
    pub length: i64,
    pub num_steps: u32,
}

impl ScanRecord {
    /// Mean Brillouin shift over the stage positions of this scan.
    pub fn average_shift(&self) -> Result<f64, StoreError> {
        if self.shift_profile.is_empty() {
            return Err(StoreError::EmptyProfile(self.location_id));
        }
        let sum: f64 = self.shift_profile.iter().map(|(_, shift)| shift).sum();
        Ok(sum / self.shift_profile.len() as f64)
    }

    /// Coordinate as displayed to the user, with the image y-axis pointing up.
    pub fn display_coordinate(&self) -> [i64; 2] {
        [self.relative_coordinate[0], -self.relative_coordinate[1]]
    }

    pub fn table_row(&self) -> Result<ScanTableRow, StoreError> {
        Ok(ScanTableRow {
            display_coordinate: self.display_coordinate(),
            average_shift: self.average_shift()?,
            start_position: self.start_position,
            length: self.length,
            num_steps: self.num_steps,
            location_id: self.location_id,
        })
    }
}

/// One line of the table of scanned locations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanTableRow {
    pub display_coordinate: [i64; 2],
    pub average_shift: f64,
    pub start_position: i64,
    pub length: i64,
    pub num_steps: u32,
    pub location_id: u64,
}

impl Display for ScanTableRow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} ({}, {}) shift {:.4} GHz, start {}, length {}, {} steps",
            self.location_id,
            self.display_coordinate[0],
            self.display_coordinate[1],
            self.average_shift,
            self.start_position,
            self.length,
            self.num_steps
        )
    }
}
