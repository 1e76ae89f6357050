use std::time::Duration;

use crate::errors::Result;
use crate::objective::StochasticDiffFunction;
use crate::optimize::{Minimizer, QnMinimizer, SgdMinimizer};

/// Stochastic warm start followed by quasi-Newton refinement.
///
/// The stochastic phase runs for `sgd_passes` passes and harvests step and
/// gradient differences plus a diagonal scaling over its final steps; the
/// quasi-Newton then starts with those history buffers already filled and
/// runs for `qn_passes` iterations.
pub struct SgdToQnMinimizer {
    gain: f64,
    batch_size: usize,
    sgd_passes: usize,
    qn_passes: u64,
    memory: usize,
    robust: bool,
    seed: u64,
    time_limit: Option<Duration>,
}

impl SgdToQnMinimizer {
    /// Creates a combined minimizer.
    #[must_use]
    pub fn new(gain: f64, batch_size: usize, sgd_passes: usize, qn_passes: u64) -> Self {
        Self {
            gain,
            batch_size,
            sgd_passes,
            qn_passes,
            memory: 10,
            robust: true,
            seed: 1,
            time_limit: None,
        }
    }

    /// Sets the quasi-Newton memory, which is also the number of curvature
    /// pairs harvested from the stochastic phase.
    #[must_use]
    pub const fn memory(mut self, memory: usize) -> Self {
        self.memory = memory;
        self
    }

    /// Enables or disables cautious curvature skipping in the quasi-Newton
    /// phase.
    #[must_use]
    pub const fn robust(mut self, robust: bool) -> Self {
        self.robust = robust;
        self
    }

    /// Seeds the stochastic phase.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Caps the combined wall-clock time; each phase gets what remains.
    #[must_use]
    pub const fn time_limit(mut self, limit: Option<Duration>) -> Self {
        self.time_limit = limit;
        self
    }

    /// Runs both phases and returns the refined weights.
    ///
    /// # Errors
    ///
    /// Returns an error when the function cannot be evaluated at `initial`.
    pub fn minimize<F: StochasticDiffFunction + ?Sized>(
        &mut self,
        function: &mut F,
        tolerance: f64,
        initial: &[f64],
    ) -> Result<Vec<f64>> {
        let start = std::time::Instant::now();
        let mut sgd = SgdMinimizer::new(self.gain, self.batch_size, self.sgd_passes)
            .seed(self.seed)
            .time_limit(self.time_limit);
        let outcome = sgd.minimize_harvesting(function, initial, self.memory)?;
        log::info!(
            "stochastic phase done, handing {} curvature pairs to the quasi-Newton",
            outcome.history.len()
        );

        let remaining = self.time_limit.map(|l| l.saturating_sub(start.elapsed()));
        let mut qn = QnMinimizer::new(self.memory)
            .robust(self.robust)
            .max_iterations(self.qn_passes)
            .time_limit(remaining);
        qn.minimize_with_history(function, tolerance, &outcome.x, outcome.history)
    }
}

impl<F: StochasticDiffFunction + ?Sized> Minimizer<F> for SgdToQnMinimizer {
    fn minimize(&mut self, function: &mut F, tolerance: f64, initial: &[f64]) -> Result<Vec<f64>> {
        Self::minimize(self, function, tolerance, initial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Result;
    use crate::objective::DiffFunction;

    struct BatchQuadratic {
        targets: Vec<Vec<f64>>,
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

    #[test]
    fn test_refines_to_the_full_minimum() {
        let mut f = BatchQuadratic {
            targets: vec![vec![2.0, -1.0], vec![4.0, 3.0], vec![0.0, 1.0]],
        };
        // full minimum is the mean of the targets
        let mut minimizer = SgdToQnMinimizer::new(0.1, 1, 20, 100).memory(5);
        let x = minimizer.minimize(&mut f, 1e-12, &[0.0, 0.0]).unwrap();
        assert!((x[0] - 2.0).abs() < 1e-5);
        assert!((x[1] - 1.0).abs() < 1e-5);
    }
}
