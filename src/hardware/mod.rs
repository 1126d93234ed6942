//! Interfaces to the spectrograph camera and the translation stage.
//!
//! Both devices are shared between threads behind a [`Mutex`]; holding the guard is what makes an
//! acquisition (start + readout) or a whole scan exclusive.

pub mod simulator;

use crate::error::HardwareError;
use std::sync::{Arc, Mutex, MutexGuard};

pub trait Camera: Send {
    /// Arms the sensor for one exposure.
    fn start_acquisition(&mut self) -> Result<(), HardwareError>;

    /// Reads the flat buffer of the last exposure.
    fn read_data(&mut self) -> Result<Vec<u16>, HardwareError>;
}

pub trait Stage: Send {
    /// Moves to `position` in motor steps and blocks until the move is done.
    fn move_absolute(&mut self, position: i64) -> Result<(), HardwareError>;

    /// Moves by `delta` motor steps and blocks until the move is done.
    fn move_relative(&mut self, delta: i64) -> Result<(), HardwareError>;

    fn position(&self) -> i64;
}

pub type SharedCamera = Arc<Mutex<Box<dyn Camera>>>;
pub type SharedStage = Arc<Mutex<Box<dyn Stage>>>;

pub fn share_camera(camera: Box<dyn Camera>) -> SharedCamera {
    Arc::new(Mutex::new(camera))
}

pub fn share_stage(stage: Box<dyn Stage>) -> SharedStage {
    Arc::new(Mutex::new(stage))
}

/// Locks a device, mapping poisoning to a [`HardwareError`].
pub fn lock<'a, T: ?Sized>(
    device: &'a Mutex<T>,
    name: &'static str,
) -> Result<MutexGuard<'a, T>, HardwareError> {
    device.lock().map_err(|_| HardwareError::Poisoned(name))
}

/// One exposure: start followed by readout. The caller must hold the camera lock.
pub fn acquire(camera: &mut dyn Camera) -> Result<Vec<u16>, HardwareError> {
    camera.start_acquisition()?;
    camera.read_data()
}
