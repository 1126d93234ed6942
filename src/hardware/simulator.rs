//! A camera and stage pair that stand in for the instrument.
//!
//! The camera renders a Stokes/anti-Stokes pair of Lorentzian lines whose separation follows a
//! Brillouin shift that varies with the stage position, so scans produce a non-trivial profile.
//! With the reference sample in the beam it renders the water and plastic lines instead, placed
//! so that a reference fit recovers the simulated calibration.

use super::{Camera, Stage};
use crate::data_container::InstrumentCalibration;
use crate::error::HardwareError;
use crate::frame::ROW_WIDTH;
use crate::math_tools::lorentzian;
use crate::peak_fit::{plastic_shift, water_shift, DEFAULT_TEMPERATURE};
use std::f64::consts::PI;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Readout defects the camera can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFault {
    /// A buffer whose length is not a whole number of rows.
    Truncated,
    /// An empty buffer.
    Empty,
    /// Baseline only, no spectral lines.
    Dark,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    pub rows: usize,
    pub spectrum_row: usize,
    pub center_column: f64,
    /// Calibration used to turn the simulated shift into a peak separation.
    pub calibration: InstrumentCalibration,
    pub base_shift: f64,
    pub shift_modulation: f64,
    /// Stage travel over which the shift goes through one full period.
    pub modulation_period: f64,
    pub gamma: f64,
    pub amplitude: f64,
    pub baseline: f64,
    pub exposure: Duration,
    pub travel: RangeInclusive<i64>,
    /// Temperature of the reference sample in degrees Celsius.
    pub reference_temperature: f64,
    /// Defects of the first frames read out, one entry per frame.
    pub leading_faults: Vec<FrameFault>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            rows: 16,
            spectrum_row: 8,
            center_column: 256.0,
            calibration: InstrumentCalibration::default(),
            base_shift: 5.1,
            shift_modulation: 0.3,
            modulation_period: 400.0,
            gamma: 3.0,
            amplitude: 6000.0,
            baseline: 300.0,
            exposure: Duration::ZERO,
            travel: -10_000..=10_000,
            reference_temperature: DEFAULT_TEMPERATURE,
            leading_faults: vec![],
        }
    }
}

impl SimulatorConfig {
    /// Brillouin shift of the simulated sample at a stage position.
    pub fn shift_at(&self, position: i64) -> f64 {
        self.base_shift
            + self.shift_modulation * (2.0 * PI * position as f64 / self.modulation_period).sin()
    }

    /// Pixel separation of a line pair with Brillouin shift `shift`.
    fn separation(&self, shift: f64) -> f64 {
        (self.calibration.fsr - 2.0 * shift) / self.calibration.sd
    }

    fn render(&self, line_pairs: &[f64]) -> Vec<u16> {
        let line: Vec<f64> = (0..ROW_WIDTH)
            .map(|c| {
                let x = c as f64;
                line_pairs
                    .iter()
                    .flat_map(|separation| {
                        [
                            self.center_column - separation / 2.0,
                            self.center_column + separation / 2.0,
                        ]
                    })
                    .map(|center| lorentzian(x, self.gamma, center, self.amplitude))
                    .sum()
            })
            .collect();

        let mut raw = Vec::with_capacity(self.rows * ROW_WIDTH);
        for row in 0..self.rows {
            let offset = row as f64 - self.spectrum_row as f64;
            let weight = (-0.5 * offset * offset).exp();
            raw.extend(line.iter().map(|v| {
                (self.baseline + weight * v)
                    .round()
                    .clamp(0.0, u16::MAX as f64) as u16
            }));
        }
        raw
    }

    /// Flat frame buffer as the camera would read it out at `position`.
    pub fn frame_at(&self, position: i64) -> Vec<u16> {
        self.render(&[self.separation(self.shift_at(position))])
    }

    /// Frame of the reference sample: water lines outside, plastic lines inside.
    ///
    /// The plastic pair sits one free spectral range away from the usual order, so its
    /// separation is `(2P - FSR) / SD`.
    pub fn reference_frame(&self) -> Vec<u16> {
        let water = self.separation(water_shift(self.reference_temperature));
        let plastic = (2.0 * plastic_shift(self.reference_temperature) - self.calibration.fsr)
            / self.calibration.sd;
        self.render(&[water, plastic])
    }

    fn faulty_frame(&self, fault: FrameFault) -> Vec<u16> {
        match fault {
            FrameFault::Truncated => vec![self.baseline as u16; ROW_WIDTH + ROW_WIDTH / 2],
            FrameFault::Empty => vec![],
            FrameFault::Dark => self.render(&[]),
        }
    }
}

/// Swaps the specimen in front of the simulated spectrometer. Clones share the same holder.
#[derive(Debug, Clone, Default)]
pub struct SpecimenHolder(Arc<AtomicBool>);

impl SpecimenHolder {
    pub fn insert_reference(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn insert_sample(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn holds_reference(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Builds a camera and a stage that share the stage position.
pub fn rig(config: SimulatorConfig) -> (SimulatedCamera, SimulatedStage) {
    let position = Arc::new(AtomicI64::new(0));
    let camera = SimulatedCamera {
        config: config.clone(),
        position: position.clone(),
        specimen: SpecimenHolder::default(),
        armed: false,
        frames_read: 0,
    };
    let stage = SimulatedStage {
        position,
        travel: config.travel,
        log: TravelLog::default(),
    };
    (camera, stage)
}

pub struct SimulatedCamera {
    config: SimulatorConfig,
    position: Arc<AtomicI64>,
    specimen: SpecimenHolder,
    armed: bool,
    frames_read: usize,
}

impl SimulatedCamera {
    pub fn specimen_holder(&self) -> SpecimenHolder {
        self.specimen.clone()
    }
}

impl Camera for SimulatedCamera {
    fn start_acquisition(&mut self) -> Result<(), HardwareError> {
        self.armed = true;
        Ok(())
    }

    fn read_data(&mut self) -> Result<Vec<u16>, HardwareError> {
        if !self.armed {
            return Err(HardwareError::Camera(
                "readout requested before the acquisition was started".to_string(),
            ));
        }
        if !self.config.exposure.is_zero() {
            thread::sleep(self.config.exposure);
        }
        self.armed = false;
        let fault = self.config.leading_faults.get(self.frames_read).copied();
        self.frames_read += 1;
        Ok(match fault {
            Some(fault) => self.config.faulty_frame(fault),
            None if self.specimen.holds_reference() => self.config.reference_frame(),
            None => self.config.frame_at(self.position.load(Ordering::Relaxed)),
        })
    }
}

/// Positions reached by a [`SimulatedStage`], shared so tests can inspect it after the stage has
/// been handed to a scan.
#[derive(Debug, Clone, Default)]
pub struct TravelLog(Arc<Mutex<Vec<i64>>>);

impl TravelLog {
    fn record(&self, position: i64) {
        if let Ok(mut positions) = self.0.lock() {
            positions.push(position);
        }
    }

    pub fn positions(&self) -> Vec<i64> {
        self.0.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

pub struct SimulatedStage {
    position: Arc<AtomicI64>,
    travel: RangeInclusive<i64>,
    log: TravelLog,
}

impl SimulatedStage {
    pub fn travel_log(&self) -> TravelLog {
        self.log.clone()
    }

    fn go_to(&mut self, target: i64) -> Result<(), HardwareError> {
        if !self.travel.contains(&target) {
            return Err(HardwareError::Stage(format!(
                "target {target} outside travel {}..={}",
                self.travel.start(),
                self.travel.end()
            )));
        }
        self.position.store(target, Ordering::Relaxed);
        self.log.record(target);
        Ok(())
    }
}

impl Stage for SimulatedStage {
    fn move_absolute(&mut self, position: i64) -> Result<(), HardwareError> {
        self.go_to(position)
    }

    fn move_relative(&mut self, delta: i64) -> Result<(), HardwareError> {
        self.go_to(self.position() + delta)
    }

    fn position(&self) -> i64 {
        self.position.load(Ordering::Relaxed)
    }
}
