//! Numerical building blocks for the peak fitter: the Lorentzian line shape and its partial
//! derivatives, a Levenberg-Marquardt least-squares solver with analytic Jacobians, a small dense
//! linear solver and the index helpers used to seed the fits.

use crate::error::FitError;
use ndarray::{Array1, Array2};
use std::f64::consts::PI;

/// Evaluates a Lorentzian line.
///
/// `L(x) = 0.5 * gamma * amplitude / (pi * (x - x0)^2 + (0.5 * gamma)^2)`
///
/// # Arguments
/// - `x`: pixel position.
/// - `gamma`: width parameter.
/// - `x0`: center.
/// - `amplitude`: area-like amplitude; the peak height is `2 * amplitude / gamma`.
pub fn lorentzian(x: f64, gamma: f64, x0: f64, amplitude: f64) -> f64 {
    let half_gamma = 0.5 * gamma;
    half_gamma * amplitude / (PI * (x - x0).powi(2) + half_gamma * half_gamma)
}

/// Partial derivatives of [`lorentzian`] with respect to `(gamma, x0, amplitude)`.
pub fn lorentzian_gradient(x: f64, gamma: f64, x0: f64, amplitude: f64) -> [f64; 3] {
    let half_gamma = 0.5 * gamma;
    let dx = x - x0;
    let denominator = PI * dx * dx + half_gamma * half_gamma;
    let denominator_sq = denominator * denominator;
    let d_gamma =
        0.5 * amplitude / denominator - amplitude * half_gamma * half_gamma / denominator_sq;
    let d_x0 = 2.0 * PI * half_gamma * amplitude * dx / denominator_sq;
    let d_amplitude = half_gamma / denominator;
    [d_gamma, d_x0, d_amplitude]
}

/// A model that can be fitted with [`LevenbergMarquardt`].
pub trait FitModel {
    fn parameter_count(&self) -> usize;

    fn value(&self, x: f64, params: &[f64]) -> f64;

    /// Writes the partial derivatives at `x` into `gradient`, one entry per parameter.
    fn gradient(&self, x: f64, params: &[f64], gradient: &mut [f64]);
}

/// Sum of `peaks` Lorentzians sharing one constant baseline.
///
/// Parameters are laid out as `[gamma_1, x0_1, A_1, ..., gamma_n, x0_n, A_n, baseline]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LorentzianSum {
    pub peaks: usize,
}

impl FitModel for LorentzianSum {
    fn parameter_count(&self) -> usize {
        3 * self.peaks + 1
    }

    fn value(&self, x: f64, params: &[f64]) -> f64 {
        let baseline = params[3 * self.peaks];
        params[..3 * self.peaks]
            .chunks_exact(3)
            .map(|p| lorentzian(x, p[0], p[1], p[2]))
            .sum::<f64>()
            + baseline
    }

    fn gradient(&self, x: f64, params: &[f64], gradient: &mut [f64]) {
        for (p, g) in params[..3 * self.peaks]
            .chunks_exact(3)
            .zip(gradient.chunks_exact_mut(3))
        {
            g.copy_from_slice(&lorentzian_gradient(x, p[0], p[1], p[2]));
        }
        gradient[3 * self.peaks] = 1.0;
    }
}

/// Settings of the damped least-squares solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevenbergMarquardt {
    pub max_iterations: usize,
    /// Relative parameter change below which an accepted step ends the fit.
    pub step_tolerance: f64,
    /// Relative decrease of chi-squared below which an accepted step ends the fit.
    pub chi2_tolerance: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
    /// Damping above which no further decrease is possible and the current point is kept.
    pub max_lambda: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        LevenbergMarquardt {
            max_iterations: 400,
            step_tolerance: 1e-10,
            chi2_tolerance: 1e-12,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            max_lambda: 1e10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeastSquaresSolution {
    pub params: Vec<f64>,
    pub chi2: f64,
    pub iterations: usize,
}

impl LevenbergMarquardt {
    /// Minimizes the sum of squared residuals between `model` and the samples `(x, y)`.
    ///
    /// # Errors
    /// - [`FitError::Underdetermined`] if there are fewer samples than parameters.
    /// - [`FitError::SingularMatrix`] if the damped normal equations cannot be solved.
    /// - [`FitError::NonFinite`] if the starting point evaluates to a non-finite residual.
    /// - [`FitError::NotConverged`] if the iteration cap is hit.
    pub fn fit<M: FitModel>(
        &self,
        model: &M,
        x: &[f64],
        y: &[f64],
        initial: &[f64],
    ) -> Result<LeastSquaresSolution, FitError> {
        let n = model.parameter_count();
        let m = x.len().min(y.len());
        if initial.len() != n || m < n {
            return Err(FitError::Underdetermined {
                points: m,
                parameters: n,
            });
        }

        let mut params = initial.to_vec();
        let mut chi2 = chi_squared(model, x, y, &params);
        if !chi2.is_finite() {
            return Err(FitError::NonFinite);
        }
        let mut lambda = self.initial_lambda;
        let mut jacobian = Array2::<f64>::zeros((m, n));
        let mut residuals = Array1::<f64>::zeros(m);
        let mut gradient = vec![0.0; n];

        for iteration in 1..=self.max_iterations {
            for i in 0..m {
                residuals[i] = y[i] - model.value(x[i], &params);
                model.gradient(x[i], &params, &mut gradient);
                for (k, g) in gradient.iter().enumerate() {
                    jacobian[[i, k]] = *g;
                }
            }
            let jtj = jacobian.t().dot(&jacobian);
            let jtr = jacobian.t().dot(&residuals);

            loop {
                let mut damped = jtj.clone();
                for k in 0..n {
                    damped[[k, k]] += lambda * jtj[[k, k]].max(f64::EPSILON);
                }
                let step =
                    solve_linear_system(damped, jtr.clone()).ok_or(FitError::SingularMatrix)?;
                let trial: Vec<f64> = params.iter().zip(step.iter()).map(|(p, d)| p + d).collect();
                let trial_chi2 = chi_squared(model, x, y, &trial);

                if trial_chi2.is_finite() && trial_chi2 < chi2 {
                    let small_step = step
                        .iter()
                        .zip(&params)
                        .all(|(d, p)| d.abs() <= self.step_tolerance * (p.abs() + self.step_tolerance));
                    let small_gain = chi2 - trial_chi2 <= self.chi2_tolerance * chi2;
                    params = trial;
                    chi2 = trial_chi2;
                    lambda *= self.lambda_down;
                    if small_step || small_gain {
                        return Ok(LeastSquaresSolution {
                            params,
                            chi2,
                            iterations: iteration,
                        });
                    }
                    break;
                }

                lambda *= self.lambda_up;
                if lambda > self.max_lambda {
                    return Ok(LeastSquaresSolution {
                        params,
                        chi2,
                        iterations: iteration,
                    });
                }
            }
        }
        Err(FitError::NotConverged {
            iterations: self.max_iterations,
        })
    }
}

fn chi_squared<M: FitModel>(model: &M, x: &[f64], y: &[f64], params: &[f64]) -> f64 {
    x.iter()
        .zip(y)
        .map(|(&xi, &yi)| (yi - model.value(xi, params)).powi(2))
        .sum()
}

/// Solves `a * x = b` by Gaussian elimination with partial pivoting.
///
/// Returns `None` if a pivot vanishes.
pub fn solve_linear_system(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    if a.dim() != (n, n) {
        return None;
    }
    for col in 0..n {
        let pivot_row = (col..n).max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))?;
        let pivot = a[[pivot_row, col]];
        if !pivot.is_finite() || pivot.abs() < f64::MIN_POSITIVE {
            return None;
        }
        if pivot_row != col {
            for k in 0..n {
                a.swap([col, k], [pivot_row, k]);
            }
            b.swap(col, pivot_row);
        }
        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let mut sum = b[row];
        for k in row + 1..n {
            sum -= a[[row, k]] * x[k];
        }
        x[row] = sum / a[[row, row]];
    }
    Some(x)
}

/// Index of the first maximum.
pub fn argmax<T: PartialOrd + Copy>(values: &[T]) -> Option<usize> {
    let mut best: Option<(usize, T)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Full-width estimate of the peak at `peak`.
///
/// Walks right from the peak until a sample drops to or below half the peak value and returns
/// twice the number of steps taken. `None` if the profile ends first.
pub fn half_max_width(values: &[f64], peak: usize) -> Option<usize> {
    let half_max = *values.get(peak)? / 2.0;
    (0..values.len() - peak)
        .find(|&i| values[peak + i] <= half_max)
        .map(|i| 2 * i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_lorentzian_peak_height() {
        assert_relative_eq!(lorentzian(10.0, 4.0, 10.0, 2000.0), 1000.0, epsilon = 1e-9);
        assert!(lorentzian(12.0, 4.0, 10.0, 2000.0) < 1000.0);
    }

    #[test]
    fn test_lorentzian_gradient_matches_finite_differences() {
        let (x, gamma, x0, amplitude) = (12.3, 3.1, 11.0, 1500.0);
        let gradient = lorentzian_gradient(x, gamma, x0, amplitude);
        let h = 1e-6;
        let numeric = [
            (lorentzian(x, gamma + h, x0, amplitude) - lorentzian(x, gamma - h, x0, amplitude))
                / (2.0 * h),
            (lorentzian(x, gamma, x0 + h, amplitude) - lorentzian(x, gamma, x0 - h, amplitude))
                / (2.0 * h),
            (lorentzian(x, gamma, x0, amplitude + h) - lorentzian(x, gamma, x0, amplitude - h))
                / (2.0 * h),
        ];
        for (analytic, numeric) in gradient.iter().zip(numeric.iter()) {
            assert_relative_eq!(analytic, numeric, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_solve_linear_system() {
        let a = array![[2.0, 1.0, -1.0], [-3.0, -1.0, 2.0], [-2.0, 1.0, 2.0]];
        let b = array![8.0, -11.0, -3.0];
        let x = solve_linear_system(a, b).unwrap();
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 3.0, epsilon = 1e-12);
        assert_relative_eq!(x[2], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_solve_linear_system_singular() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(solve_linear_system(a, array![1.0, 2.0]).is_none());
    }

    #[test]
    fn test_levenberg_marquardt_recovers_single_lorentzian() {
        let model = LorentzianSum { peaks: 1 };
        let truth = [3.0, 20.4, 2500.0, 80.0];
        let x: Vec<f64> = (0..40).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|&xi| model.value(xi, &truth)).collect();
        let solution = LevenbergMarquardt::default()
            .fit(&model, &x, &y, &[2.0, 20.0, 1000.0, 100.0])
            .unwrap();
        for (fitted, expected) in solution.params.iter().zip(truth.iter()) {
            assert_relative_eq!(fitted, expected, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_levenberg_marquardt_underdetermined() {
        let model = LorentzianSum { peaks: 2 };
        let result = LevenbergMarquardt::default().fit(
            &model,
            &[0.0, 1.0],
            &[1.0, 2.0],
            &[1.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0],
        );
        assert_eq!(
            result,
            Err(FitError::Underdetermined {
                points: 2,
                parameters: 7
            })
        );
    }

    #[test]
    fn test_argmax_takes_first_maximum() {
        assert_eq!(argmax(&[1, 5, 3, 5]), Some(1));
        assert_eq!(argmax::<f64>(&[]), None);
    }

    #[test]
    fn test_half_max_width() {
        let values = [0.0, 10.0, 100.0, 70.0, 50.0, 20.0];
        assert_eq!(half_max_width(&values, 2), Some(4));
        let rising = [10.0, 20.0, 30.0];
        assert_eq!(half_max_width(&rising, 2), None);
    }
}
