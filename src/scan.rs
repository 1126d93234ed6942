//! Stage-driven scans: step the motor through evenly spaced positions, acquire and fit at each,
//! and commit the result for the current spatial location.

use crate::data_container::{InstrumentCalibration, ScanRecord, ScanTableRow, SpatialContext};
use crate::error::{ScanError, StoreError};
use crate::frame::FrameAcquirer;
use crate::hardware::{acquire, lock, SharedCamera, SharedStage};
use crate::peak_fit::PeakFitter;
use crate::store::SpatialResultStore;
use cancellable_loops::try_for_each_cancellable;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanParameters {
    pub start_position: i64,
    pub length: i64,
    pub num_steps: u32,
}

impl ScanParameters {
    /// Distance between positions, rounded down.
    pub fn step_size(&self) -> i64 {
        if self.num_steps == 0 {
            return 0;
        }
        self.length.div_euclid(self.num_steps as i64)
    }

    /// The `num_steps + 1` positions visited, in order.
    pub fn positions(&self) -> Vec<i64> {
        let step = self.step_size();
        (0..=self.num_steps as i64)
            .map(|i| self.start_position + i * step)
            .collect()
    }
}

/// Progress report for one visited position.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanStep {
    pub index: usize,
    pub position: i64,
    pub shift: Option<f64>,
    /// `false` if the shift came from the pixel separation because the fit failed.
    pub fitted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    pub parameters: ScanParameters,
    pub shift_profile: Vec<(i64, f64)>,
    pub image_stack: Vec<GrayImage>,
    /// Indices of positions whose frame had no usable profile.
    pub skipped_steps: Vec<usize>,
}

impl ScanOutcome {
    fn new(parameters: ScanParameters) -> Self {
        ScanOutcome {
            parameters,
            shift_profile: Vec::new(),
            image_stack: Vec::new(),
            skipped_steps: Vec::new(),
        }
    }

    pub fn into_record(self, location_id: u64, relative_coordinate: [i64; 2]) -> ScanRecord {
        ScanRecord {
            location_id,
            relative_coordinate,
            shift_profile: self.shift_profile,
            image_stack: self.image_stack,
            start_position: self.parameters.start_position,
            length: self.parameters.length,
            num_steps: self.parameters.num_steps,
        }
    }
}

pub struct ScanController {
    camera: SharedCamera,
    stage: SharedStage,
    acquirer: FrameAcquirer,
    fitter: PeakFitter,
}

impl ScanController {
    pub fn new(camera: SharedCamera, stage: SharedStage, acquirer: FrameAcquirer) -> Self {
        ScanController {
            camera,
            stage,
            acquirer,
            fitter: PeakFitter::default(),
        }
    }

    /// Runs a scan. Stage and camera stay locked until it returns.
    ///
    /// The calibration is re-read before every fit. Raising `abort_flag` stops the scan before
    /// the next position; the flag is cleared once the cancellation has been honoured.
    pub fn scan<F>(
        &self,
        parameters: &ScanParameters,
        calibration: &RwLock<InstrumentCalibration>,
        abort_flag: &AtomicBool,
        mut on_step: F,
    ) -> Result<ScanOutcome, ScanError>
    where
        F: FnMut(&ScanStep),
    {
        if parameters.num_steps == 0 {
            return Err(ScanError::NoSteps);
        }
        let mut stage = lock(&self.stage, "stage")?;
        let mut camera = lock(&self.camera, "camera")?;

        let positions = parameters.positions();
        let step_size = parameters.step_size();
        log::info!(
            "scanning {} positions from {} in steps of {}",
            positions.len(),
            parameters.start_position,
            step_size
        );

        let mut outcome = ScanOutcome::new(*parameters);
        let exit = try_for_each_cancellable(
            positions.iter().copied().enumerate(),
            abort_flag,
            |(index, position)| -> Result<(), ScanError> {
                if index == 0 {
                    stage.move_absolute(position)?;
                } else {
                    stage.move_relative(step_size)?;
                }
                let raw = acquire(&mut **camera)?;
                let calibration = *calibration.read().unwrap_or_else(PoisonError::into_inner);
                let step = self.measure(index, position, &raw, &calibration, &mut outcome);
                on_step(&step);
                Ok(())
            },
        )?;

        if exit.is_cancelled() {
            abort_flag.store(false, Ordering::Relaxed);
            log::warn!("scan cancelled after {} positions", exit.processed());
            return Err(ScanError::Cancelled {
                completed: exit.processed(),
                total: positions.len(),
            });
        }
        log::info!(
            "scan finished: {} shifts, {} skipped positions",
            outcome.shift_profile.len(),
            outcome.skipped_steps.len()
        );
        Ok(outcome)
    }

    fn measure(
        &self,
        index: usize,
        position: i64,
        raw: &[u16],
        calibration: &InstrumentCalibration,
        outcome: &mut ScanOutcome,
    ) -> ScanStep {
        let frame = match self.acquirer.scan_frame(raw) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("position {position}: {err}");
                outcome.image_stack.push(self.acquirer.blank_scan_display());
                outcome.skipped_steps.push(index);
                return ScanStep {
                    index,
                    position,
                    shift: None,
                    fitted: false,
                };
            }
        };
        if let Some(region) = &frame.region {
            log::trace!("position {position}: spectrum in row {}", region.row);
        }
        outcome.image_stack.push(frame.display);

        let (shift, fitted) = match frame.profile {
            Some(profile) => match self.fitter.fit_two_peak(&profile, calibration) {
                Ok(fit) => (Some(fit.shift), true),
                Err(err) => {
                    log::warn!("position {position}: {err}, using pixel separation");
                    (PeakFitter::coarse_shift(&profile, calibration), false)
                }
            },
            None => (None, false),
        };
        match shift {
            Some(shift) => outcome.shift_profile.push((position, shift)),
            None => outcome.skipped_steps.push(index),
        }
        ScanStep {
            index,
            position,
            shift,
            fitted,
        }
    }
}

/// Records `outcome` for the current location if both the scan location and the pupil center are
/// known. Returns the new table row, or `None` if the scan could not be placed. A scan without a
/// single shift is rejected and leaves the store untouched.
pub fn commit_scan(
    outcome: ScanOutcome,
    context: &SpatialContext,
    store: &mut SpatialResultStore,
) -> Result<Option<ScanTableRow>, StoreError> {
    let Some(relative_coordinate) = context.relative_coordinate() else {
        log::info!("scan location or pupil center unknown, scan not recorded");
        return Ok(None);
    };
    // the id is only taken once the record is stored
    let record = outcome.into_record(store.peek_location_id(), relative_coordinate);
    let row = record.table_row()?;
    store.record(record);
    Ok(Some(row))
}
