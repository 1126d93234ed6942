//! Messages and shared state between the acquisition worker and the rest of the program.

use crate::data_container::{InstrumentCalibration, ScanTableRow, SpatialContext};
use crate::hardware::{share_camera, share_stage, Camera, SharedCamera, SharedStage, Stage};
use crate::heatmap::HeatMapGrid;
use crate::peak_fit::LiveFit;
use crate::scan::{ScanParameters, ScanStep};
use crate::settings::SettingsContainer;
use crate::store::SpatialResultStore;
use crossbeam_channel::{Receiver, Sender};
use image::GrayImage;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

/// Commands for the acquisition worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigCommand {
    /// FSR and SD as typed by the user.
    SetCalibrationText { fsr: String, sd: String },
    SetReferenceMode(bool),
    SetCalibrationTemperature(f64),
    SetScanLocation(Option<[i64; 2]>),
    SetDetectedCenter(Option<[i64; 2]>),
    /// Depth label used by the next heat map.
    SetHeatMapDepth(Option<f64>),
    RenderHeatMap,
    Scan(ScanParameters),
    Stop,
}

/// Everything the worker publishes for display.
#[derive(Debug, Clone)]
pub enum AcquisitionEvent {
    FrameReady(GrayImage),
    FitReady(LiveFit),
    CalibrationUpdated(InstrumentCalibration),
    ScanStep(ScanStep),
    ScanFinished {
        parameters: ScanParameters,
        shifts: Vec<(i64, f64)>,
        export_dir: Option<PathBuf>,
    },
    ScanFailed(String),
    ScanCommitted(ScanTableRow),
    HeatMapReady(HeatMapGrid),
    Stopped,
}

#[derive(Clone)]
pub struct ThreadCommunication {
    pub camera_lock: SharedCamera,
    pub stage_lock: SharedStage,
    pub calibration_lock: Arc<RwLock<InstrumentCalibration>>,
    pub store_lock: Arc<RwLock<SpatialResultStore>>,
    pub context_lock: Arc<RwLock<SpatialContext>>,
    pub settings: SettingsContainer,
    pub stop_flag: Arc<AtomicBool>,
    pub scan_abort_flag: Arc<AtomicBool>,
    pub config_tx: Sender<ConfigCommand>,
    pub config_rx: Receiver<ConfigCommand>,
    pub event_tx: Sender<AcquisitionEvent>,
    pub event_rx: Receiver<AcquisitionEvent>,
}

impl ThreadCommunication {
    pub fn new(camera: Box<dyn Camera>, stage: Box<dyn Stage>, settings: SettingsContainer) -> Self {
        let (config_tx, config_rx): (Sender<ConfigCommand>, Receiver<ConfigCommand>) =
            crossbeam_channel::unbounded();
        let (event_tx, event_rx): (Sender<AcquisitionEvent>, Receiver<AcquisitionEvent>) =
            crossbeam_channel::bounded(settings.event_queue_depth.max(1));
        ThreadCommunication {
            camera_lock: share_camera(camera),
            stage_lock: share_stage(stage),
            calibration_lock: Arc::new(RwLock::new(settings.calibration)),
            store_lock: Arc::new(RwLock::new(SpatialResultStore::new())),
            context_lock: Arc::new(RwLock::new(SpatialContext::default())),
            settings,
            stop_flag: Arc::new(AtomicBool::new(false)),
            scan_abort_flag: Arc::new(AtomicBool::new(false)),
            config_tx,
            config_rx,
            event_tx,
            event_rx,
        }
    }
}
