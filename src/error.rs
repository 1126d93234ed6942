use thiserror::Error;

/// Raised when a raw camera buffer cannot be laid out as rows.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error("raw buffer of {len} samples is not a multiple of the {row_width}-sample row width")]
    ShapeMismatch { len: usize, row_width: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("could not parse {field} from {value:?}")]
    Parse { field: &'static str, value: String },
    #[error("{field} must be strictly positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("line profile has {actual} samples, expected {expected}")]
    ProfileLength { expected: usize, actual: usize },
    #[error("no half-maximum crossing to the right of the peak at pixel {peak}")]
    NoHalfMaxCrossing { peak: usize },
    #[error("{points} samples cannot constrain {parameters} parameters")]
    Underdetermined { points: usize, parameters: usize },
    #[error("normal equations are singular")]
    SingularMatrix,
    #[error("fit did not converge within {iterations} iterations")]
    NotConverged { iterations: usize },
    #[error("fit produced non-finite parameters")]
    NonFinite,
    #[error("reference peaks give an invalid calibration: {0}")]
    InvalidCalibration(#[from] CalibrationError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    #[error("camera: {0}")]
    Camera(String),
    #[error("stage: {0}")]
    Stage(String),
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    #[error("a scan needs at least one step")]
    NoSteps,
    #[error("scan cancelled after {completed} of {total} positions")]
    Cancelled { completed: usize, total: usize },
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("no scan recorded for location {0}")]
    UnknownLocation(u64),
    #[error("location {0} has an empty shift profile")]
    EmptyProfile(u64),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Npz(#[from] ndarray_npy::WriteNpzError),
    #[error("nothing to export")]
    Empty,
    #[error("plotting failed: {0}")]
    Plot(String),
    #[error("image {index} is {width}x{height}, expected {expected_width}x{expected_height}")]
    InconsistentImage {
        index: usize,
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },
}
