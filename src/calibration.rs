//! Analog front end calibration.
//!
//! The converter window registers are set from the requested voltage window
//! through two affine maps, one per window endpoint:
//!
//! ```text
//! register = k0 + k1 * low_volts + k2 * high_volts
//! ```
//!
//! Calibration drives the generator with a known 0 V / 3.3 V square wave,
//! sweeps a grid of raw register settings, measures the voltage window each
//! setting really produces and refits both maps by least squares.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{storage::Owned, DVector, Dyn, OMatrix, Vector3, U3};
use polars::prelude::*;

/// Square wave high level used as the calibration reference.
pub const REFERENCE_VOLTAGE: f64 = 3.3;
/// Samples discarded at each end of both halves of the sorted capture.
const TRIM: usize = 10;

pub const LOW_COLUMN: &str = "low";
pub const HIGH_COLUMN: &str = "high";
pub const ANALOG_LOW_COLUMN: &str = "analog_low";
pub const ANALOG_HIGH_COLUMN: &str = "analog_high";

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("A {n}x{n} grid has too few points to fit")]
    GridTooSmall { n: usize },

    #[error("Failure to collect calibration data")]
    Data(#[from] PolarsError),
}

/// Coefficients of the low and high endpoint maps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalogCalibration {
    pub low: [f64; 3],
    pub high: [f64; 3],
}

impl AnalogCalibration {
    pub fn converter_lo(&self, low: f64, high: f64) -> f64 {
        analog_map(&self.low, low, high)
    }

    pub fn converter_hi(&self, low: f64, high: f64) -> f64 {
        analog_map(&self.high, low, high)
    }
}

pub fn analog_map(ks: &[f64; 3], low: f64, high: f64) -> f64 {
    ks[0] + ks[1] * low + ks[2] * high
}

/// One raw capture of the calibration sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    /// Raw converter low register setting.
    pub low: f64,
    /// Raw converter high register setting.
    pub high: f64,
    /// Measured voltage at the bottom of the converter range.
    pub analog_low: f64,
    /// Measured voltage at the top of the converter range.
    pub analog_high: f64,
}

/// `n` evenly spaced values from `start` to `stop` inclusive.
#[allow(clippy::cast_precision_loss)]
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Raw `(low, high)` register settings swept by calibration, low major.
pub fn calibration_grid(n: usize) -> Vec<(f64, f64)> {
    let highs = linspace(0.877, 0.6, n);
    linspace(0.063, 0.4, n)
        .into_iter()
        .flat_map(|low| highs.iter().map(move |&high| (low, high)))
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    values.iter().sum::<f64>() / n
}

/// Voltage window `(analog_low, analog_high)` seen by a raw capture of the
/// reference square wave.
///
/// The lower half of the sorted samples is the 0 V level and the upper half
/// the reference level; the trimmed mean of each half is robust against
/// edge samples. Returns `None` when the capture does not show two levels.
pub fn estimate_window(samples: &mut [f64]) -> Option<(f64, f64)> {
    let half = samples.len() / 2;
    if half <= 2 * TRIM {
        return None;
    }
    samples.sort_by(f64::total_cmp);
    let zero = mean(&samples[TRIM..half - TRIM]);
    let upper = samples.len() - (samples.len() + 1) / 2;
    let reference = mean(&samples[upper + TRIM..samples.len() - TRIM]);
    if reference <= zero {
        return None;
    }
    let range = REFERENCE_VOLTAGE / (reference - zero);
    let analog_low = -zero * range;
    Some((analog_low, analog_low + range))
}

/// `target = k0 + k1 * x_low + k2 * x_high` as a least squares problem.
struct AffineFit<'a> {
    ks: Vector3<f64>,
    x_low: &'a [f64],
    x_high: &'a [f64],
    target: &'a [f64],
}

impl LeastSquaresProblem<f64, Dyn, U3> for AffineFit<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U3>;
    type ParameterStorage = Owned<f64, U3>;

    fn set_params(&mut self, ks: &Vector3<f64>) {
        self.ks.copy_from(ks);
    }

    fn params(&self) -> Vector3<f64> {
        self.ks
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let ks = [self.ks[0], self.ks[1], self.ks[2]];
        Some(DVector::from_iterator(
            self.target.len(),
            self.target
                .iter()
                .zip(self.x_low.iter().zip(self.x_high))
                .map(|(y, (low, high))| y - analog_map(&ks, *low, *high)),
        ))
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U3>> {
        Some(OMatrix::<f64, Dyn, U3>::from_fn(self.target.len(), |row, col| {
            match col {
                0 => -1.0,
                1 => -self.x_low[row],
                _ => -self.x_high[row],
            }
        }))
    }
}

/// Fit one endpoint map, starting from `seed`.
///
/// `None` when the solver does not converge, an input is not finite, or
/// there are fewer points than coefficients.
pub fn fit_analog_map(
    seed: [f64; 3],
    x_low: &[f64],
    x_high: &[f64],
    target: &[f64],
) -> Option<[f64; 3]> {
    if target.len() < 3 || x_low.len() != target.len() || x_high.len() != target.len() {
        return None;
    }
    if !target.iter().chain(x_low).chain(x_high).all(|v| v.is_finite()) {
        return None;
    }
    let problem = AffineFit {
        ks: Vector3::from(seed),
        x_low,
        x_high,
        target,
    };
    let (problem, report) = LevenbergMarquardt::new().minimize(problem);
    log::debug!(
        "Fit finished after {} evaluations: {:?}",
        report.number_of_evaluations,
        report.termination
    );
    let ks = [problem.ks[0], problem.ks[1], problem.ks[2]];
    (report.termination.was_successful() && ks.iter().all(|k| k.is_finite())).then_some(ks)
}

/// Grid points as a frame with one column per [`GridPoint`] field.
pub fn grid_frame(points: &[GridPoint]) -> Result<DataFrame, PolarsError> {
    let column = |name: &str, f: fn(&GridPoint) -> f64| -> Column {
        let values: Vec<f64> = points.iter().map(f).collect();
        Series::new(name.into(), values).into()
    };
    DataFrame::new(vec![
        column(LOW_COLUMN, |p| p.low),
        column(HIGH_COLUMN, |p| p.high),
        column(ANALOG_LOW_COLUMN, |p| p.analog_low),
        column(ANALOG_HIGH_COLUMN, |p| p.analog_high),
    ])
}

fn column_values(df: &DataFrame, name: &str) -> Result<Vec<f64>, PolarsError> {
    Ok(df.column(name)?.f64()?.into_no_null_iter().collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationOutcome {
    pub low_fitted: bool,
    pub high_fitted: bool,
}

impl CalibrationOutcome {
    pub fn success(&self) -> bool {
        self.low_fitted && self.high_fitted
    }
}

/// Refit both endpoint maps from a grid frame.
///
/// An endpoint whose fit fails keeps its `current` coefficients.
pub fn fit_calibration(
    current: &AnalogCalibration,
    grid: &DataFrame,
) -> Result<(AnalogCalibration, CalibrationOutcome), CalibrationError> {
    let low = column_values(grid, LOW_COLUMN)?;
    let high = column_values(grid, HIGH_COLUMN)?;
    let analog_low = column_values(grid, ANALOG_LOW_COLUMN)?;
    let analog_high = column_values(grid, ANALOG_HIGH_COLUMN)?;

    let low_ks = fit_analog_map(current.low, &analog_low, &analog_high, &low);
    let high_ks = fit_analog_map(current.high, &analog_low, &analog_high, &high);

    let outcome = CalibrationOutcome {
        low_fitted: low_ks.is_some(),
        high_fitted: high_ks.is_some(),
    };
    let fitted = AnalogCalibration {
        low: low_ks.unwrap_or(current.low),
        high: high_ks.unwrap_or(current.high),
    };
    log::info!(
        "Calibration fit over {} points: low {:?} ({}), high {:?} ({})",
        grid.height(),
        fitted.low,
        if outcome.low_fitted { "fitted" } else { "kept" },
        fitted.high,
        if outcome.high_fitted { "fitted" } else { "kept" },
    );
    Ok((fitted, outcome))
}
