use std::collections::VecDeque;
use std::time::{Duration, Instant};

use argmin_math::{ArgminAdd, ArgminDot, ArgminMul, ArgminSub};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::errors::Result;
use crate::objective::StochasticDiffFunction;
use crate::optimize::{Minimizer, QnHistory};

/// How many trailing mini-batch gradients are averaged into each step.
const GRADIENT_MEMORY: usize = 10;

/// The final stochastic iterate together with the curvature history
/// harvested for a quasi-Newton warm start.
pub struct SgdOutcome {
    /// Weights after the last pass.
    pub x: Vec<f64>,
    /// Harvested update pairs and diagonal scaling.
    pub history: QnHistory,
}

/// Scaled stochastic gradient descent.
///
/// Each step moves against the mean of the last few mini-batch gradients,
/// scaled by `gain · τ/(τ+k)` with `τ = 5 · num_batches`. Batches are a
/// shuffled partition of the data, reshuffled every pass from the seeded
/// generator, so runs are reproducible and per-pass batch gradients sum to
/// the full-batch gradient.
pub struct SgdMinimizer {
    gain: f64,
    batch_size: usize,
    passes: usize,
    time_limit: Option<Duration>,
    seed: u64,
}

impl SgdMinimizer {
    /// Creates a minimizer with the given initial gain and batch size.
    #[must_use]
    pub fn new(gain: f64, batch_size: usize, passes: usize) -> Self {
        Self {
            gain,
            batch_size: batch_size.max(1),
            passes,
            time_limit: None,
            seed: 1,
        }
    }

    /// Caps the wall-clock time.
    #[must_use]
    pub const fn time_limit(mut self, limit: Option<Duration>) -> Self {
        self.time_limit = limit;
        self
    }

    /// Seeds the batch shuffler.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the learning gain.
    pub fn set_gain(&mut self, gain: f64) {
        self.gain = gain;
    }

    /// Sets the mini-batch size.
    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size.max(1);
    }

    /// Runs the stochastic passes and returns the final weights.
    ///
    /// # Errors
    ///
    /// Returns an error when the gradient cannot be evaluated at `initial`;
    /// later numeric failures end the run with the last safe weights.
    pub fn minimize<F: StochasticDiffFunction + ?Sized>(
        &mut self,
        function: &mut F,
        _tolerance: f64,
        initial: &[f64],
    ) -> Result<Vec<f64>> {
        Ok(self.minimize_harvesting(function, initial, 0)?.x)
    }

    /// Runs the stochastic passes, harvesting curvature pairs over the
    /// final `harvest` steps for a quasi-Newton handover.
    ///
    /// # Errors
    ///
    /// Returns an error when the gradient cannot be evaluated at `initial`.
    pub fn minimize_harvesting<F: StochasticDiffFunction + ?Sized>(
        &mut self,
        function: &mut F,
        initial: &[f64],
        harvest: usize,
    ) -> Result<SgdOutcome> {
        let mut history = QnHistory::new(harvest.max(1));
        let mut x = initial.to_vec();
        let data_size = function.data_dimension();
        if x.is_empty() || data_size == 0 {
            return Ok(SgdOutcome { x, history });
        }

        let batch_size = self.batch_size.min(data_size);
        let num_batches = data_size.div_ceil(batch_size);
        let tau = 5.0 * num_batches as f64;
        let total_steps = self.passes * num_batches;
        log::info!(
            "stochastic minimization: {} passes of {num_batches} batches of {batch_size}",
            self.passes
        );

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut indices: Vec<usize> = (0..data_size).collect();
        let mut gradient_window: VecDeque<Vec<f64>> = VecDeque::new();
        let start = Instant::now();
        let mut k = 0usize;
        let mut last_scaling = None;

        'passes: for pass in 0..self.passes {
            indices.shuffle(&mut rng);
            for batch in indices.chunks(batch_size) {
                let raw_gradient = match function.batch_gradient_at(&x, batch) {
                    Ok(g) => g,
                    Err(e) if k == 0 => return Err(e),
                    Err(e) => {
                        log::error!("stopping on evaluation failure: {e}");
                        break 'passes;
                    }
                };
                if gradient_window.len() == GRADIENT_MEMORY {
                    gradient_window.pop_front();
                }
                gradient_window.push_back(raw_gradient.clone());
                let smoothed = smooth(&gradient_window);

                let step_gain = self.gain * tau / (tau + k as f64);
                let new_x = x.sub(&smoothed.mul(&step_gain));
                if new_x.iter().any(|v| !v.is_finite()) {
                    log::error!("non-finite iterate at step {k}, stopping");
                    break 'passes;
                }

                if harvest > 0 && k + harvest >= total_steps {
                    match function.batch_gradient_at(&new_x, batch) {
                        Ok(new_gradient) => {
                            let s = new_x.sub(&x);
                            let y = new_gradient.sub(&raw_gradient);
                            let curvature: f64 = s.dot(&y);
                            let y_norm_sq: f64 = y.dot(&y);
                            if history.push(s, y) {
                                last_scaling = Some(curvature / y_norm_sq);
                            }
                        }
                        Err(e) => log::warn!("skipping curvature harvest at step {k}: {e}"),
                    }
                }

                x = new_x;
                k += 1;
                if let Some(limit) = self.time_limit {
                    if start.elapsed() >= limit {
                        log::info!("stopping on the wall-clock limit after {k} steps");
                        break 'passes;
                    }
                }
            }
            log::debug!("pass {pass} complete");
        }

        if let Some(scaling) = last_scaling {
            history.diag = Some(vec![scaling; x.len()]);
        }
        Ok(SgdOutcome { x, history })
    }

    /// Tunes the gain by binary search over `[low, high]`: each probe runs
    /// the minimizer under `budget` and the interval halves toward the
    /// probe with the best final objective value.
    ///
    /// # Errors
    ///
    /// Propagates evaluation failures from the trial runs.
    pub fn tune_gain<F: StochasticDiffFunction + ?Sized>(
        &mut self,
        function: &mut F,
        initial: &[f64],
        budget: Duration,
        mut low: f64,
        mut high: f64,
    ) -> Result<f64> {
        let saved_limit = self.time_limit;
        self.time_limit = Some(budget);
        let mut best = (low, f64::INFINITY);
        let mut probes = vec![high, low];
        for _ in 0..8 {
            let gain = probes.pop().unwrap_or_else(|| 0.5 * (low + high));
            self.gain = gain;
            let x = self.minimize(function, 1e-100, initial)?;
            let value = function.value_at(&x).unwrap_or(f64::INFINITY);
            log::info!("gain {gain:.3e} reached value {value:.6}");
            if value < best.1 {
                best = (gain, value);
            }
            if probes.is_empty() {
                let mid = 0.5 * (low + high);
                if best.0 <= mid {
                    high = mid;
                } else {
                    low = mid;
                }
                if high - low < 1e-3 * high.abs() {
                    break;
                }
            }
        }
        self.time_limit = saved_limit;
        self.gain = best.0;
        Ok(best.0)
    }

    /// Tunes the batch size by doubling while the budgeted objective value
    /// keeps improving.
    ///
    /// # Errors
    ///
    /// Propagates evaluation failures from the trial runs.
    pub fn tune_batch_size<F: StochasticDiffFunction + ?Sized>(
        &mut self,
        function: &mut F,
        initial: &[f64],
        budget: Duration,
    ) -> Result<usize> {
        let saved_limit = self.time_limit;
        self.time_limit = Some(budget);
        let mut best = (1, f64::INFINITY);
        let mut batch_size = 1;
        while batch_size <= function.data_dimension() {
            self.batch_size = batch_size;
            let x = self.minimize(function, 1e-100, initial)?;
            let value = function.value_at(&x).unwrap_or(f64::INFINITY);
            log::info!("batch size {batch_size} reached value {value:.6}");
            if value < best.1 {
                best = (batch_size, value);
            } else {
                break;
            }
            batch_size *= 2;
        }
        self.time_limit = saved_limit;
        self.batch_size = best.0;
        Ok(best.0)
    }
}

/// Pointwise mean of the gradients in the window.
fn smooth(window: &VecDeque<Vec<f64>>) -> Vec<f64> {
    let mut smoothed = vec![0.0; window[0].len()];
    for gradient in window {
        smoothed = smoothed.add(gradient);
    }
    smoothed.mul(&(1.0 / window.len() as f64))
}

impl<F: StochasticDiffFunction + ?Sized> Minimizer<F> for SgdMinimizer {
    fn minimize(&mut self, function: &mut F, tolerance: f64, initial: &[f64]) -> Result<Vec<f64>> {
        Self::minimize(self, function, tolerance, initial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Result;
    use crate::objective::DiffFunction;

    /// A sum of per-datum convex quadratics; the full objective has its
    /// minimum at the mean of the targets.
    struct BatchQuadratic {
        targets: Vec<Vec<f64>>,
    }

    impl BatchQuadratic {
        fn full_minimum(&self) -> Vec<f64> {
            let dimension = self.targets[0].len();
            let mut mean = vec![0.0; dimension];
            for t in &self.targets {
                for (m, v) in mean.iter_mut().zip(t) {
                    *m += v / self.targets.len() as f64;
                }
            }
            mean
        }
    }

    impl DiffFunction for BatchQuadratic {
        fn dimension(&self) -> usize {
            self.targets[0].len()
        }

        fn value_at(&mut self, x: &[f64]) -> Result<f64> {
            Ok(self
                .targets
                .iter()
                .map(|t| {
                    x.iter()
                        .zip(t)
                        .map(|(x, t)| 0.5 * (x - t) * (x - t))
                        .sum::<f64>()
                })
                .sum())
        }

        fn gradient_at(&mut self, x: &[f64]) -> Result<Vec<f64>> {
            let batch: Vec<usize> = (0..self.targets.len()).collect();
            self.batch_gradient_at(x, &batch)
        }
    }

    impl StochasticDiffFunction for BatchQuadratic {
        fn data_dimension(&self) -> usize {
            self.targets.len()
        }

        fn batch_gradient_at(&mut self, x: &[f64], batch: &[usize]) -> Result<Vec<f64>> {
            let mut gradient = vec![0.0; x.len()];
            for &i in batch {
                for (g, (x, t)) in gradient.iter_mut().zip(x.iter().zip(&self.targets[i])) {
                    *g += x - t;
                }
            }
            Ok(gradient)
        }
    }

    fn function() -> BatchQuadratic {
        BatchQuadratic {
            targets: vec![
                vec![1.0, 0.0],
                vec![3.0, 2.0],
                vec![2.0, -2.0],
                vec![0.0, 4.0],
            ],
        }
    }

    #[test]
    fn test_approaches_the_full_minimum() {
        let mut f = function();
        let target = f.full_minimum();
        let mut sgd = SgdMinimizer::new(0.2, 2, 200);
        let x = sgd.minimize(&mut f, 1e-8, &[0.0, 0.0]).unwrap();
        for (xi, ti) in x.iter().zip(&target) {
            assert!((xi - ti).abs() < 0.05, "{xi} vs {ti}");
        }
    }

    #[test]
    fn test_is_deterministic_under_a_seed() {
        let run = || {
            let mut f = function();
            let mut sgd = SgdMinimizer::new(0.2, 2, 20).seed(17);
            sgd.minimize(&mut f, 1e-8, &[0.0, 0.0]).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_harvest_produces_history() {
        let mut f = function();
        let mut sgd = SgdMinimizer::new(0.1, 2, 50);
        let outcome = sgd.minimize_harvesting(&mut f, &[0.0, 0.0], 5).unwrap();
        assert!(!outcome.history.is_empty());
        assert!(outcome.history.diag.is_some());
    }

    #[test]
    fn test_tuning_stays_in_bounds() {
        let mut f = function();
        let mut sgd = SgdMinimizer::new(0.1, 2, 5);
        let budget = Duration::from_millis(50);
        let gain = sgd.tune_gain(&mut f, &[0.0, 0.0], budget, 1e-3, 1.0).unwrap();
        assert!((1e-3..=1.0).contains(&gain));

        let batch_size = sgd.tune_batch_size(&mut f, &[0.0, 0.0], budget).unwrap();
        assert!(batch_size >= 1 && batch_size <= f.data_dimension());
    }

    #[test]
    fn test_empty_data_returns_initial() {
        struct Nothing;
        impl DiffFunction for Nothing {
            fn dimension(&self) -> usize {
                2
            }
            fn value_at(&mut self, _x: &[f64]) -> Result<f64> {
                Ok(0.0)
            }
            fn gradient_at(&mut self, _x: &[f64]) -> Result<Vec<f64>> {
                Ok(vec![0.0, 0.0])
            }
        }
        impl StochasticDiffFunction for Nothing {
            fn data_dimension(&self) -> usize {
                0
            }
            fn batch_gradient_at(&mut self, _x: &[f64], _batch: &[usize]) -> Result<Vec<f64>> {
                Ok(vec![0.0, 0.0])
            }
        }
        let mut sgd = SgdMinimizer::new(0.1, 2, 10);
        let x = sgd.minimize(&mut Nothing, 1e-8, &[1.0, 2.0]).unwrap();
        assert_eq!(vec![1.0, 2.0], x);
    }
}
