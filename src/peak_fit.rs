//! Lorentzian peak fitting of line profiles.
//!
//! Sample measurements use a two-peak model (one Stokes/anti-Stokes pair across the two halves of
//! the profile) and yield a Brillouin shift through the current [`InstrumentCalibration`].
//! Reference measurements use a four-peak model (water and plastic lines in the four quarters of
//! the profile) and solve for a new calibration from the known reference shifts.

use crate::data_container::{
    InstrumentCalibration, LineProfile, LorentzianPeak, PeakFitResult, PeakMode, PROFILE_LENGTH,
};
use crate::error::FitError;
use crate::math_tools::{argmax, half_max_width, LevenbergMarquardt, LorentzianSum};
use std::collections::VecDeque;

pub const HISTORY_CAPACITY: usize = 20;
pub const DEFAULT_TEMPERATURE: f64 = 23.5;
const INITIAL_BASELINE: f64 = 100.0;
const REFERENCE_INITIAL_GAMMA: f64 = 1.0;

/// Brillouin shift of water in GHz at `temperature` degrees Celsius.
pub fn water_shift(temperature: f64) -> f64 {
    -5.219e-5 * temperature.powi(2) + 0.01312 * temperature + 4.836
}

/// Brillouin shift of the plastic reference in GHz at `temperature` degrees Celsius.
pub fn plastic_shift(temperature: f64) -> f64 {
    16.3291 - (-0.0005512 * temperature.powi(2) + 0.04333 * temperature + 6.019)
}

/// Solves FSR and SD from the four reference peak centers.
///
/// The outer pair (`x0_1`, `x0_4`) and the inner pair (`x0_2`, `x0_3`) belong to the two reference
/// materials, which gives two equations in the two unknowns:
///
/// `SD = (2P - 2W) / ((x0_4 - x0_1) + (x0_3 - x0_2))`
/// `FSR = 2P - SD * (x0_3 - x0_2)`
pub fn solve_reference_calibration(
    centers: [f64; 4],
    plastic: f64,
    water: f64,
) -> Result<InstrumentCalibration, FitError> {
    let [x0_1, x0_2, x0_3, x0_4] = centers;
    let sd = (2.0 * plastic - 2.0 * water) / ((x0_4 - x0_1) + (x0_3 - x0_2));
    let fsr = 2.0 * plastic - sd * (x0_3 - x0_2);
    Ok(InstrumentCalibration::new(fsr, sd)?)
}

/// The most recent Brillouin shifts, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct ShiftHistory {
    values: VecDeque<f64>,
    capacity: usize,
}

impl Default for ShiftHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

impl ShiftHistory {
    pub fn new(capacity: usize) -> Self {
        ShiftHistory {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a value, evicting the oldest one when full.
    pub fn push(&mut self, shift: f64) {
        if self.capacity == 0 {
            return;
        }
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(shift);
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }
}

/// How the live loop should fit the current frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitSettings {
    pub reference_mode: bool,
    pub temperature: f64,
}

impl Default for FitSettings {
    fn default() -> Self {
        FitSettings {
            reference_mode: false,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

/// Everything the display needs after one live fit.
#[derive(Debug, Clone)]
pub struct LiveFit {
    pub profile: LineProfile,
    pub result: Result<PeakFitResult, FitError>,
    /// Set when a reference fit produced a new calibration.
    pub calibration: Option<InstrumentCalibration>,
    /// Fitted model on the pixel axis of `profile`, for overlaying on the measured one.
    pub curve: Option<Vec<f64>>,
    pub history: Vec<f64>,
}

/// Fits line profiles and keeps the rolling history of live shifts.
#[derive(Debug, Clone, Default)]
pub struct PeakFitter {
    solver: LevenbergMarquardt,
    history: ShiftHistory,
}

struct Seed {
    center: f64,
    amplitude: f64,
    peak: usize,
}

fn seed(intensities: &[f64], range: std::ops::Range<usize>) -> Option<Seed> {
    let offset = range.start;
    let segment = &intensities[range];
    let local = argmax(segment)?;
    Some(Seed {
        center: (offset + local) as f64,
        amplitude: segment[local],
        peak: local,
    })
}

fn checked_intensities(profile: &LineProfile) -> Result<Vec<f64>, FitError> {
    if profile.len() != PROFILE_LENGTH {
        return Err(FitError::ProfileLength {
            expected: PROFILE_LENGTH,
            actual: profile.len(),
        });
    }
    Ok(profile.intensities())
}

fn peaks_from_params(params: &[f64], count: usize) -> Result<(Vec<LorentzianPeak>, f64), FitError> {
    if params.iter().any(|p| !p.is_finite()) {
        return Err(FitError::NonFinite);
    }
    let peaks = params[..3 * count]
        .chunks_exact(3)
        .map(|p| LorentzianPeak {
            gamma: p[0],
            center: p[1],
            amplitude: p[2],
        })
        .collect();
    Ok((peaks, params[3 * count]))
}

impl PeakFitter {
    pub fn new(solver: LevenbergMarquardt, history_capacity: usize) -> Self {
        PeakFitter {
            solver,
            history: ShiftHistory::new(history_capacity),
        }
    }

    /// Fits one Lorentzian per half of the profile and converts the peak separation to a shift.
    pub fn fit_two_peak(
        &self,
        profile: &LineProfile,
        calibration: &InstrumentCalibration,
    ) -> Result<PeakFitResult, FitError> {
        let intensities = checked_intensities(profile)?;
        let half = PROFILE_LENGTH / 2;
        let mut initial = Vec::with_capacity(7);
        for range in [0..half, half..PROFILE_LENGTH] {
            let offset = range.start;
            let segment = &intensities[range.clone()];
            let seed = seed(&intensities, range).ok_or(FitError::NoHalfMaxCrossing { peak: offset })?;
            let gamma = half_max_width(segment, seed.peak)
                .filter(|&w| w > 0)
                .ok_or(FitError::NoHalfMaxCrossing {
                    peak: offset + seed.peak,
                })?;
            initial.extend_from_slice(&[gamma as f64, seed.center, seed.amplitude]);
        }
        initial.push(INITIAL_BASELINE);

        let model = LorentzianSum { peaks: 2 };
        let solution = self
            .solver
            .fit(&model, &profile.pixel_axis(), &intensities, &initial)?;
        log::trace!(
            "two-peak fit: {} iterations, chi2 {:.4e}",
            solution.iterations,
            solution.chi2
        );
        let (peaks, baseline) = peaks_from_params(&solution.params, 2)?;
        let delta = peaks[1].center - peaks[0].center;
        Ok(PeakFitResult {
            mode: PeakMode::TwoPeak,
            shift: calibration.shift_from_separation(delta),
            peaks,
            baseline,
            iterations: solution.iterations,
        })
    }

    /// Fits one Lorentzian per quarter of a reference profile and solves for a new calibration.
    pub fn fit_four_peak(
        &self,
        profile: &LineProfile,
        temperature: f64,
    ) -> Result<(PeakFitResult, InstrumentCalibration), FitError> {
        let intensities = checked_intensities(profile)?;
        let quarter = PROFILE_LENGTH / 4;
        let mut initial = Vec::with_capacity(13);
        for q in 0..4 {
            let range = q * quarter..(q + 1) * quarter;
            let seed = seed(&intensities, range).ok_or(FitError::NoHalfMaxCrossing { peak: q * quarter })?;
            initial.extend_from_slice(&[REFERENCE_INITIAL_GAMMA, seed.center, seed.amplitude]);
        }
        initial.push(INITIAL_BASELINE);

        let model = LorentzianSum { peaks: 4 };
        let solution = self
            .solver
            .fit(&model, &profile.pixel_axis(), &intensities, &initial)?;
        log::trace!(
            "four-peak fit: {} iterations, chi2 {:.4e}",
            solution.iterations,
            solution.chi2
        );
        let (peaks, baseline) = peaks_from_params(&solution.params, 4)?;
        let centers = [peaks[0].center, peaks[1].center, peaks[2].center, peaks[3].center];
        let calibration = solve_reference_calibration(
            centers,
            plastic_shift(temperature),
            water_shift(temperature),
        )?;
        Ok((
            PeakFitResult {
                mode: PeakMode::FourPeak,
                // the outer pair is the water line; under the solved calibration this
                // reproduces the water shift and serves as a check of the fit
                shift: calibration.shift_from_separation(centers[3] - centers[0]),
                peaks,
                baseline,
                iterations: solution.iterations,
            },
            calibration,
        ))
    }

    /// Shift from the separation of the brightest pixel in each half, without fitting.
    pub fn coarse_shift(profile: &LineProfile, calibration: &InstrumentCalibration) -> Option<f64> {
        let intensities = profile.intensities();
        if intensities.len() < 2 {
            return None;
        }
        let half = intensities.len() / 2;
        let first = argmax(&intensities[..half])?;
        let second = argmax(&intensities[half..])? + half;
        Some(calibration.shift_from_separation((second - first) as f64))
    }

    /// Fits a live frame and appends its shift to the history.
    ///
    /// Failures are logged and returned in [`LiveFit::result`]. A sample frame whose fit failed
    /// still enters the history with its pixel-separation shift; reference frames never do.
    pub fn process(
        &mut self,
        profile: LineProfile,
        calibration: &InstrumentCalibration,
        settings: FitSettings,
    ) -> LiveFit {
        let (result, new_calibration) = if settings.reference_mode {
            match self.fit_four_peak(&profile, settings.temperature) {
                Ok((fit, calibration)) => (Ok(fit), Some(calibration)),
                Err(err) => (Err(err), None),
            }
        } else {
            (self.fit_two_peak(&profile, calibration), None)
        };

        match &result {
            Ok(fit) if fit.mode == PeakMode::TwoPeak => self.history.push(fit.shift),
            Ok(fit) => log::debug!("reference peaks at {:?}", fit.centers()),
            Err(err) if settings.reference_mode => {
                log::warn!("{} fit failed: {err}", PeakMode::FourPeak);
            }
            Err(err) => {
                let coarse = Self::coarse_shift(&profile, calibration);
                log::warn!("{} fit failed: {err}, history uses {coarse:?}", PeakMode::TwoPeak);
                if let Some(shift) = coarse {
                    self.history.push(shift);
                }
            }
        }

        let curve = result.as_ref().ok().map(|fit| fit.curve(profile.len()));
        LiveFit {
            profile,
            result,
            calibration: new_calibration,
            curve,
            history: self.history.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math_tools::FitModel;
    use approx::assert_relative_eq;
    use ndarray::Array1;

    fn synthetic_profile(params: &[f64], peaks: usize) -> LineProfile {
        let model = LorentzianSum { peaks };
        LineProfile::new(Array1::from_iter((0..PROFILE_LENGTH).map(|i| {
            model.value(i as f64, params).round().clamp(0.0, u16::MAX as f64) as u16
        })))
    }

    #[test]
    fn test_reference_shifts_at_room_temperature() {
        assert_relative_eq!(water_shift(DEFAULT_TEMPERATURE), 5.1155, epsilon = 1e-3);
        assert_relative_eq!(plastic_shift(DEFAULT_TEMPERATURE), 9.5962, epsilon = 1e-3);
    }

    #[test]
    fn test_two_peak_fit_recovers_centers() {
        let truth = [4.0, 15.3, 2000.0, 4.2, 58.7, 2100.0, 100.0];
        let profile = synthetic_profile(&truth, 2);
        let calibration = InstrumentCalibration::new(16.5, 0.14).unwrap();

        let fit = PeakFitter::default().fit_two_peak(&profile, &calibration).unwrap();
        assert_eq!(fit.mode, PeakMode::TwoPeak);
        assert_relative_eq!(fit.peaks[0].center, 15.3, epsilon = 0.02);
        assert_relative_eq!(fit.peaks[1].center, 58.7, epsilon = 0.02);
        assert_relative_eq!(fit.baseline, 100.0, epsilon = 2.0);
        let delta = fit.peaks[1].center - fit.peaks[0].center;
        assert_relative_eq!(fit.shift, (16.5 - delta * 0.14) / 2.0, epsilon = 1e-12);
        assert_relative_eq!(fit.shift, (16.5 - 43.4 * 0.14) / 2.0, epsilon = 5e-3);
    }

    #[test]
    fn test_two_peak_fit_without_half_max_crossing() {
        // a clean peak on the left, a ramp rising to the last pixel on the right
        let mut samples: Vec<u16> = (0..PROFILE_LENGTH)
            .map(|i| if i == 15 { 1000 } else { 100 })
            .collect();
        for (k, s) in samples[40..].iter_mut().enumerate() {
            *s = 100 + 20 * k as u16;
        }
        let profile = LineProfile::new(Array1::from(samples));
        let result = PeakFitter::default().fit_two_peak(&profile, &InstrumentCalibration::default());
        assert_eq!(result, Err(FitError::NoHalfMaxCrossing { peak: 79 }));
    }

    #[test]
    fn test_profile_of_wrong_length_is_rejected() {
        let profile = LineProfile::new(Array1::from(vec![0u16; 30]));
        assert_eq!(
            PeakFitter::default().fit_two_peak(&profile, &InstrumentCalibration::default()),
            Err(FitError::ProfileLength {
                expected: PROFILE_LENGTH,
                actual: 30
            })
        );
    }

    #[test]
    fn test_history_keeps_most_recent_values() {
        let mut history = ShiftHistory::new(HISTORY_CAPACITY);
        for i in 0..25 {
            history.push(i as f64);
        }
        let values = history.to_vec();
        assert_eq!(values.len(), HISTORY_CAPACITY);
        assert_eq!(values[0], 5.0);
        assert_eq!(values.last(), Some(&24.0));
    }

    #[test]
    fn test_failed_fit_enters_history_with_coarse_shift() {
        let calibration = InstrumentCalibration::default();
        let mut fitter = PeakFitter::default();

        let good = synthetic_profile(&[4.0, 17.5, 2000.0, 4.0, 62.5, 2000.0, 100.0], 2);
        let live = fitter.process(good, &calibration, FitSettings::default());
        let fitted = live.result.unwrap().shift;
        assert_eq!(live.history, vec![fitted]);
        let curve = live.curve.unwrap();
        assert_eq!(curve.len(), PROFILE_LENGTH);
        // the model peaks near the seeded centers
        assert!(curve[17] > curve[40] && curve[62] > curve[40]);

        let flat = LineProfile::new(Array1::from(vec![0u16; PROFILE_LENGTH]));
        let coarse = PeakFitter::coarse_shift(&flat, &calibration).unwrap();
        let live = fitter.process(flat, &calibration, FitSettings::default());
        assert!(live.result.is_err());
        assert_eq!(live.history, vec![fitted, coarse]);
        assert!(live.curve.is_none());
    }

    #[test]
    fn test_reference_calibration_equations() {
        let centers = [8.0, 27.0, 52.0, 70.0];
        let (plastic, water) = (9.6, 5.1);
        let calibration = solve_reference_calibration(centers, plastic, water).unwrap();
        let sd = (2.0 * plastic - 2.0 * water) / ((70.0 - 8.0) + (52.0 - 27.0));
        assert_relative_eq!(calibration.sd, sd, epsilon = 1e-12);
        assert_relative_eq!(calibration.fsr, 2.0 * plastic - sd * 25.0, epsilon = 1e-12);
    }

    #[test]
    fn test_reference_calibration_rejects_negative_dispersion() {
        let result = solve_reference_calibration([70.0, 52.0, 27.0, 8.0], 9.6, 5.1);
        assert!(matches!(result, Err(FitError::InvalidCalibration(_))));
    }

    #[test]
    fn test_four_peak_fit_updates_calibration() {
        let truth = [
            2.5, 8.4, 1500.0, 2.5, 27.1, 1500.0, 2.5, 51.6, 1500.0, 2.5, 70.2, 1500.0, 50.0,
        ];
        let profile = synthetic_profile(&truth, 4);
        let mut fitter = PeakFitter::default();
        let settings = FitSettings {
            reference_mode: true,
            temperature: DEFAULT_TEMPERATURE,
        };

        let live = fitter.process(profile, &InstrumentCalibration::default(), settings);
        let fit = live.result.unwrap();
        let calibration = live.calibration.unwrap();
        assert_eq!(fit.mode, PeakMode::FourPeak);
        for (fitted, expected) in fit.centers().iter().zip([8.4, 27.1, 51.6, 70.2]) {
            assert_relative_eq!(*fitted, expected, epsilon = 0.02);
        }

        let c = fit.centers();
        let p = plastic_shift(DEFAULT_TEMPERATURE);
        let w = water_shift(DEFAULT_TEMPERATURE);
        assert_relative_eq!(
            calibration.sd,
            (2.0 * p - 2.0 * w) / ((c[3] - c[0]) + (c[2] - c[1])),
            epsilon = 1e-12
        );
        assert_relative_eq!(calibration.fsr, 2.0 * p - calibration.sd * (c[2] - c[1]), epsilon = 1e-12);
        assert_relative_eq!(fit.shift, w, epsilon = 1e-9);
        // reference frames never enter the sample history
        assert!(live.history.is_empty());
    }

    #[test]
    fn test_coarse_shift_uses_brightest_pixels() {
        let mut samples = vec![100u16; PROFILE_LENGTH];
        samples[18] = 900;
        samples[61] = 900;
        let profile = LineProfile::new(Array1::from(samples));
        let calibration = InstrumentCalibration::new(16.0, 0.1).unwrap();
        assert_relative_eq!(
            PeakFitter::coarse_shift(&profile, &calibration).unwrap(),
            (16.0 - 43.0 * 0.1) / 2.0
        );
    }
}
