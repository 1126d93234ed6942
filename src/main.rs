use crate::acquisition_thread::main_thread;
use crate::config::{AcquisitionEvent, ConfigCommand, ThreadCommunication};
use crate::hardware::simulator::{rig, SimulatorConfig};
use crate::io::save_heatmap_png;
use crate::scan::ScanParameters;
use crate::settings::SettingsContainer;
use crossbeam_channel::Sender;
use preferences::{AppInfo, Preferences};
use std::thread;

mod acquisition_thread;
mod config;
mod data_container;
mod error;
mod frame;
mod hardware;
mod heatmap;
mod interpolation;
mod io;
mod math_tools;
mod peak_fit;
mod scan;
mod settings;
mod store;

const APP_INFO: AppInfo = AppInfo {
    name: "Brillouin Explorer",
    author: "Brillouin Explorer developers",
};

const HEATMAP_SIZE: (u32, u32) = (760, 640);

/// Pupil-relative offsets visited by the demo session.
const DEMO_LOCATIONS: [[i64; 2]; 4] = [[-60, -40], [50, -30], [40, 55], [-45, 35]];

/// Depth label of the final heat map, in micrometres.
const DEMO_DEPTH: f64 = 20.0;

/// Reference fits allowed to fail before the demo keeps the current calibration.
const MAX_REFERENCE_ATTEMPTS: usize = 50;

fn load_settings(prefs_key: &str) -> SettingsContainer {
    let mut settings = SettingsContainer::new();
    let load_result = SettingsContainer::load(&APP_INFO, prefs_key);
    if let Ok(stored) = load_result {
        settings = stored;
    } else {
        // save default settings
        match settings.save(&APP_INFO, prefs_key) {
            Ok(_) => {}
            Err(err) => {
                log::error!("error in saving settings: {err:?}");
            }
        }
    }
    settings.sanitize();
    settings
}

fn scan_commands(pupil_center: [i64; 2]) -> Vec<ConfigCommand> {
    let mut commands = vec![ConfigCommand::SetDetectedCenter(Some(pupil_center))];
    for [dx, dy] in DEMO_LOCATIONS {
        commands.push(ConfigCommand::SetScanLocation(Some([
            pupil_center[0] + dx,
            pupil_center[1] - dy,
        ])));
        commands.push(ConfigCommand::Scan(ScanParameters {
            start_position: 0,
            length: 400,
            num_steps: 8,
        }));
    }
    commands.push(ConfigCommand::SetHeatMapDepth(Some(DEMO_DEPTH)));
    commands.push(ConfigCommand::RenderHeatMap);
    commands.push(ConfigCommand::Stop);
    commands
}

fn send_all(config_tx: &Sender<ConfigCommand>, commands: Vec<ConfigCommand>) {
    for command in commands {
        if let Err(err) = config_tx.send(command) {
            log::error!("error sending command to acquisition thread: {err:?}");
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
    log::info!(
        "{} v{} ({} on {})",
        APP_INFO.name,
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("GIT_BRANCH")
    );

    let prefs_key = "config/settings";
    let settings = load_settings(prefs_key);
    let export_path = settings.export_path.clone();

    let (camera, stage) = rig(SimulatorConfig::default());
    let holder = camera.specimen_holder();
    let travel_log = stage.travel_log();
    let thread_communication =
        ThreadCommunication::new(Box::new(camera), Box::new(stage), settings.clone());

    let worker_communication = thread_communication.clone();
    let worker = thread::spawn(move || {
        main_thread(worker_communication);
    });
    let config_tx = &thread_communication.config_tx;

    // FSR and SD may be given on the command line, in GHz and GHz per pixel
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let [fsr, sd] = args.as_slice() {
        send_all(
            config_tx,
            vec![ConfigCommand::SetCalibrationText {
                fsr: fsr.clone(),
                sd: sd.clone(),
            }],
        );
    }

    // calibrate on the reference sample first, then scan the specimen
    holder.insert_reference();
    send_all(
        config_tx,
        vec![
            ConfigCommand::SetCalibrationTemperature(settings.calibration_temperature),
            ConfigCommand::SetReferenceMode(true),
        ],
    );
    let mut referencing = true;
    let mut reference_attempts = 0usize;
    let pupil_center = [256, 256];

    let mut live_frames = 0usize;
    let mut heatmaps = 0usize;
    while let Ok(event) = thread_communication.event_rx.recv() {
        match event {
            AcquisitionEvent::FrameReady(_) => live_frames += 1,
            AcquisitionEvent::FitReady(fit) => {
                match &fit.result {
                    Ok(result) => log::debug!(
                        "live {} shift {:.3} GHz after {} iterations, {} values in history",
                        result.mode,
                        result.shift,
                        result.iterations,
                        fit.history.len()
                    ),
                    Err(err) => log::debug!("live fit failed: {err}"),
                }
                if referencing && fit.calibration.is_none() {
                    reference_attempts += 1;
                    if reference_attempts >= MAX_REFERENCE_ATTEMPTS {
                        log::warn!("no reference fit after {reference_attempts} frames");
                        referencing = false;
                        holder.insert_sample();
                        let mut commands = vec![ConfigCommand::SetReferenceMode(false)];
                        commands.extend(scan_commands(pupil_center));
                        send_all(config_tx, commands);
                    }
                }
            }
            AcquisitionEvent::CalibrationUpdated(calibration) => {
                log::info!("calibration now {calibration}");
                if referencing {
                    referencing = false;
                    holder.insert_sample();
                    let mut commands = vec![ConfigCommand::SetReferenceMode(false)];
                    commands.extend(scan_commands(pupil_center));
                    send_all(config_tx, commands);
                }
            }
            AcquisitionEvent::ScanStep(step) => log::debug!(
                "step {} at {}: {:?} ({})",
                step.index,
                step.position,
                step.shift,
                if step.fitted { "fitted" } else { "pixel separation" }
            ),
            AcquisitionEvent::ScanFinished {
                parameters,
                shifts,
                export_dir,
            } => {
                log::info!(
                    "scan from {} over {} finished with {} shifts",
                    parameters.start_position,
                    parameters.length,
                    shifts.len()
                );
                if let Some(dir) = export_dir {
                    log::info!("scan data in {}", dir.display());
                }
            }
            AcquisitionEvent::ScanFailed(err) => log::error!("scan failed: {err}"),
            AcquisitionEvent::ScanCommitted(row) => log::info!("recorded {row}"),
            AcquisitionEvent::HeatMapReady(grid) => {
                heatmaps += 1;
                let path = export_path.join(format!("heatmap_{heatmaps:02}.png"));
                match save_heatmap_png(&path, &grid, HEATMAP_SIZE) {
                    Ok(()) => log::info!("{} saved to {}", grid.title, path.display()),
                    Err(err) => log::error!("error saving heat map: {err}"),
                }
            }
            AcquisitionEvent::Stopped => break,
        }
    }
    log::info!(
        "{live_frames} live frames displayed, stage visited {} positions",
        travel_log.positions().len()
    );

    if worker.join().is_err() {
        log::error!("acquisition thread panicked");
    }

    if let Ok(store) = thread_communication.store_lock.read() {
        log::info!("{} locations recorded", store.len());
        for row in store.table() {
            println!("{row}");
        }
    }

    let mut settings = settings;
    if let Ok(calibration) = thread_communication.calibration_lock.read() {
        settings.calibration = *calibration;
    }
    if let Err(err) = settings.save(&APP_INFO, prefs_key) {
        log::error!("error in saving settings: {err:?}");
    }
}
