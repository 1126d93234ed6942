//! The background worker: continuous live acquisition and fitting, plus command handling
//! (calibration, spatial context, scans, heat maps) between frames.

use crate::config::{AcquisitionEvent, ConfigCommand, ThreadCommunication};
use crate::data_container::InstrumentCalibration;
use crate::error::HardwareError;
use crate::frame::FrameAcquirer;
use crate::hardware::{acquire, lock};
use crate::heatmap::HeatMapRenderer;
use crate::io::{export_scan, scan_export_dir};
use crate::peak_fit::{FitSettings, PeakFitter};
use crate::scan::{commit_scan, ScanController, ScanParameters};
use crate::settings::SettingsContainer;
use crossbeam_channel::{Sender, TrySendError};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

const HARDWARE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Publishes a live event, dropping it if the display is behind.
fn emit_live(event_tx: &Sender<AcquisitionEvent>, event: AcquisitionEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => log::trace!("display queue full, dropping live event"),
        Err(TrySendError::Disconnected(_)) => log::trace!("display receiver gone"),
    }
}

/// Publishes an event that must not be lost.
fn emit(event_tx: &Sender<AcquisitionEvent>, event: AcquisitionEvent) {
    if event_tx.send(event).is_err() {
        log::debug!("display receiver gone, event discarded");
    }
}

struct Worker {
    thread_communication: ThreadCommunication,
    settings: SettingsContainer,
    acquirer: FrameAcquirer,
    fitter: PeakFitter,
    renderer: HeatMapRenderer,
}

impl Worker {
    fn calibration(&self) -> InstrumentCalibration {
        match self.thread_communication.calibration_lock.read() {
            Ok(calibration) => *calibration,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_calibration(&mut self, calibration: InstrumentCalibration) {
        match self.thread_communication.calibration_lock.write() {
            Ok(mut write_guard) => *write_guard = calibration,
            Err(poisoned) => {
                log::warn!("calibration lock poisoned, overwriting");
                *poisoned.into_inner() = calibration;
            }
        }
        self.settings.calibration = calibration;
        log::info!("calibration set to {calibration}");
        emit(
            &self.thread_communication.event_tx,
            AcquisitionEvent::CalibrationUpdated(calibration),
        );
    }

    /// Returns `false` once a stop was requested.
    fn handle_command(&mut self, command: ConfigCommand) -> bool {
        match command {
            ConfigCommand::SetCalibrationText { fsr, sd } => {
                match InstrumentCalibration::parse(&fsr, &sd) {
                    Ok(calibration) => self.set_calibration(calibration),
                    Err(err) => log::warn!("calibration rejected: {err}"),
                }
            }
            ConfigCommand::SetReferenceMode(enabled) => {
                self.settings.reference_mode = enabled;
                log::info!("reference mode {}", if enabled { "on" } else { "off" });
            }
            ConfigCommand::SetCalibrationTemperature(temperature) => {
                if temperature.is_finite() {
                    self.settings.calibration_temperature = temperature;
                } else {
                    log::warn!("ignoring calibration temperature {temperature}");
                }
            }
            ConfigCommand::SetScanLocation(location) => {
                if let Ok(mut context) = self.thread_communication.context_lock.write() {
                    context.scan_location = location;
                }
            }
            ConfigCommand::SetDetectedCenter(center) => {
                if let Ok(mut context) = self.thread_communication.context_lock.write() {
                    context.detected_center = center;
                }
            }
            ConfigCommand::SetHeatMapDepth(depth) => self.settings.heatmap_depth = depth,
            ConfigCommand::RenderHeatMap => self.publish_heatmap(),
            ConfigCommand::Scan(parameters) => self.run_scan(parameters),
            ConfigCommand::Stop => {
                self.thread_communication
                    .stop_flag
                    .store(true, Ordering::Relaxed);
                return false;
            }
        }
        true
    }

    fn publish_heatmap(&self) {
        let points = match self.thread_communication.store_lock.read() {
            Ok(store) => store.all_points(),
            Err(_) => {
                log::error!("result store lock poisoned");
                return;
            }
        };
        let grid = self.renderer.plot(&points, self.settings.heatmap_depth);
        emit(
            &self.thread_communication.event_tx,
            AcquisitionEvent::HeatMapReady(grid),
        );
    }

    fn run_scan(&mut self, parameters: ScanParameters) {
        let tc = &self.thread_communication;
        let controller =
            ScanController::new(tc.camera_lock.clone(), tc.stage_lock.clone(), self.acquirer);
        let result = controller.scan(
            &parameters,
            &tc.calibration_lock,
            &tc.scan_abort_flag,
            |step| emit(&tc.event_tx, AcquisitionEvent::ScanStep(step.clone())),
        );
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                log::error!("scan failed: {err}");
                emit(&tc.event_tx, AcquisitionEvent::ScanFailed(err.to_string()));
                return;
            }
        };

        let export_dir = if self.settings.export_scans {
            let dir = scan_export_dir(&self.settings.export_path, parameters.start_position);
            match export_scan(&dir, &outcome) {
                Ok(()) => Some(dir),
                Err(err) => {
                    log::error!("exporting scan to {} failed: {err}", dir.display());
                    None
                }
            }
        } else {
            None
        };
        emit(
            &tc.event_tx,
            AcquisitionEvent::ScanFinished {
                parameters,
                shifts: outcome.shift_profile.clone(),
                export_dir,
            },
        );

        let context = match tc.context_lock.read() {
            Ok(context) => *context,
            Err(poisoned) => *poisoned.into_inner(),
        };
        let committed = match tc.store_lock.write() {
            Ok(mut store) => commit_scan(outcome, &context, &mut store),
            Err(_) => {
                log::error!("result store lock poisoned, scan not recorded");
                return;
            }
        };
        match committed {
            Ok(Some(row)) => {
                log::info!("recorded {row}");
                emit(&tc.event_tx, AcquisitionEvent::ScanCommitted(row));
                self.publish_heatmap();
            }
            Ok(None) => {}
            Err(err) => {
                log::warn!("scan not recorded: {err}");
                emit(&tc.event_tx, AcquisitionEvent::ScanFailed(err.to_string()));
            }
        }
    }

    /// One live iteration: acquire, crop, fit, publish.
    fn live_iteration(&mut self) {
        let tc = &self.thread_communication;
        let raw = lock(&tc.camera_lock, "camera").and_then(|mut camera| acquire(&mut **camera));
        let raw = match raw {
            Ok(raw) => raw,
            Err(err) => {
                log::error!("acquisition failed: {err}");
                if matches!(err, HardwareError::Poisoned(_)) {
                    tc.stop_flag.store(true, Ordering::Relaxed);
                } else {
                    thread::sleep(HARDWARE_RETRY_DELAY);
                }
                return;
            }
        };

        let live = match self.acquirer.live_frame(&raw) {
            Ok(Some(live)) => live,
            Ok(None) => {
                log::debug!("empty crop, frame skipped");
                return;
            }
            Err(err) => {
                log::warn!("frame skipped: {err}");
                return;
            }
        };

        log::trace!(
            "spectrum in row {} around column {} ({:?})",
            live.region.row,
            live.region.mid_column,
            live.region.columns
        );
        let calibration = self.calibration();
        let fit = self.fitter.process(
            live.profile,
            &calibration,
            FitSettings {
                reference_mode: self.settings.reference_mode,
                temperature: self.settings.calibration_temperature,
            },
        );
        let new_calibration = fit.calibration;
        emit_live(&self.thread_communication.event_tx, AcquisitionEvent::FitReady(fit));
        if let Some(calibration) = new_calibration {
            self.set_calibration(calibration);
        }
        emit_live(
            &self.thread_communication.event_tx,
            AcquisitionEvent::FrameReady(live.display),
        );
    }
}

/// Runs until the stop flag is raised or a [`ConfigCommand::Stop`] arrives.
pub fn main_thread(thread_communication: ThreadCommunication) {
    let settings = thread_communication.settings.clone();
    let mut worker = Worker {
        thread_communication,
        settings,
        acquirer: FrameAcquirer::default(),
        fitter: PeakFitter::default(),
        renderer: HeatMapRenderer::default(),
    };
    log::info!("acquisition thread started");

    'acquisition: loop {
        while let Ok(command) = worker.thread_communication.config_rx.try_recv() {
            if !worker.handle_command(command) {
                break 'acquisition;
            }
        }
        if worker.thread_communication.stop_flag.load(Ordering::Relaxed) {
            break;
        }
        worker.live_iteration();
    }

    log::info!("acquisition thread stopped");
    emit(&worker.thread_communication.event_tx, AcquisitionEvent::Stopped);
}
