use std::collections::VecDeque;
use std::time::{Duration, Instant};

use argmin_math::{ArgminAdd, ArgminDot, ArgminL2Norm, ArgminMul, ArgminSub};

use crate::errors::{Result, SeqCrfError};
use crate::objective::DiffFunction;
use crate::optimize::Minimizer;

const ARMIJO_C1: f64 = 1e-4;
const BACKTRACK_RHO: f64 = 0.5;
const MAX_BACKTRACKS: usize = 60;

/// The limited-memory state of the quasi-Newton: recent step and gradient
/// differences plus an optional diagonal initial scaling.
///
/// A history harvested elsewhere (the stochastic phase of SGD-to-QN) can be
/// handed to [`QnMinimizer::minimize_with_history`] to warm-start the
/// search direction.
pub struct QnHistory {
    memory: usize,
    s_list: VecDeque<Vec<f64>>,
    y_list: VecDeque<Vec<f64>>,
    rho_list: VecDeque<f64>,
    /// Diagonal initial inverse-Hessian scaling; the usual `s·y / y·y`
    /// scalar is used when absent.
    pub diag: Option<Vec<f64>>,
}

impl QnHistory {
    /// Creates an empty history keeping up to `memory` update pairs.
    #[must_use]
    pub fn new(memory: usize) -> Self {
        Self {
            memory: memory.max(1),
            s_list: VecDeque::new(),
            y_list: VecDeque::new(),
            rho_list: VecDeque::new(),
            diag: None,
        }
    }

    /// Number of stored update pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.s_list.len()
    }

    /// Returns `true` if no update pair is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.s_list.is_empty()
    }

    /// Stores an update pair, evicting the oldest beyond the memory limit.
    /// Pairs with non-positive curvature are rejected.
    pub fn push(&mut self, s: Vec<f64>, y: Vec<f64>) -> bool {
        let sy: f64 = s.dot(&y);
        if sy <= 0.0 {
            return false;
        }
        if self.s_list.len() == self.memory {
            self.s_list.pop_front();
            self.y_list.pop_front();
            self.rho_list.pop_front();
        }
        self.rho_list.push_back(1.0 / sy);
        self.s_list.push_back(s);
        self.y_list.push_back(y);
        true
    }

    /// Drops all stored pairs and the diagonal.
    pub fn clear(&mut self) {
        self.s_list.clear();
        self.y_list.clear();
        self.rho_list.clear();
        self.diag = None;
    }

    /// Two-loop recursion: applies the implicit inverse Hessian to the
    /// gradient and negates, yielding the search direction.
    fn direction(&self, gradient: &[f64]) -> Vec<f64> {
        let mut q = gradient.to_vec();
        let k = self.s_list.len();
        let mut alphas = vec![0.0; k];
        for i in (0..k).rev() {
            let alpha = self.rho_list[i] * ArgminDot::<Vec<f64>, f64>::dot(&self.s_list[i], &q);
            q = q.sub(&self.y_list[i].mul(&alpha));
            alphas[i] = alpha;
        }
        if let Some(diag) = &self.diag {
            for (qi, di) in q.iter_mut().zip(diag) {
                *qi *= di;
            }
        } else if k > 0 {
            let y_last = &self.y_list[k - 1];
            let gamma: f64 = ArgminDot::<Vec<f64>, f64>::dot(&self.s_list[k - 1], y_last)
                / ArgminDot::<Vec<f64>, f64>::dot(y_last, y_last);
            q = q.mul(&gamma);
        }
        for i in 0..k {
            let beta = self.rho_list[i] * ArgminDot::<Vec<f64>, f64>::dot(&self.y_list[i], &q);
            q = q.add(&self.s_list[i].mul(&(alphas[i] - beta)));
        }
        q.mul(&-1.0)
    }
}

/// A limited-memory quasi-Newton (L-BFGS style) batch minimizer with an
/// Armijo backtracking line search.
///
/// Terminates on relative function-value tolerance, gradient norm, the
/// iteration cap, or the wall-clock limit, whichever fires first. A numeric
/// failure after the first evaluation ends the run with the best weights
/// seen so far.
pub struct QnMinimizer {
    memory: usize,
    robust: bool,
    max_iterations: u64,
    time_limit: Option<Duration>,
    monitor_interval: u64,
    monitor: Option<Box<dyn FnMut(u64, &[f64])>>,
}

impl QnMinimizer {
    /// Creates a minimizer keeping `memory` update pairs.
    #[must_use]
    pub fn new(memory: usize) -> Self {
        Self {
            memory: memory.max(1),
            robust: false,
            max_iterations: 1000,
            time_limit: None,
            monitor_interval: 0,
            monitor: None,
        }
    }

    /// Enables cautious curvature skipping: update pairs whose curvature is
    /// not safely positive are discarded.
    #[must_use]
    pub const fn robust(mut self, robust: bool) -> Self {
        self.robust = robust;
        self
    }

    /// Caps the number of iterations.
    #[must_use]
    pub const fn max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Caps the wall-clock time.
    #[must_use]
    pub const fn time_limit(mut self, limit: Option<Duration>) -> Self {
        self.time_limit = limit;
        self
    }

    /// Installs a callback invoked with the current iterate every
    /// `interval` iterations.
    #[must_use]
    pub fn monitor<M: FnMut(u64, &[f64]) + 'static>(mut self, interval: u64, monitor: M) -> Self {
        self.monitor_interval = interval;
        self.monitor = Some(Box::new(monitor));
        self
    }

    /// Minimizes from a fresh history.
    ///
    /// # Errors
    ///
    /// Returns an error when the function cannot be evaluated at `initial`.
    pub fn minimize<F: DiffFunction + ?Sized>(
        &mut self,
        function: &mut F,
        tolerance: f64,
        initial: &[f64],
    ) -> Result<Vec<f64>> {
        let history = QnHistory::new(self.memory);
        self.minimize_with_history(function, tolerance, initial, history)
    }

    /// Minimizes continuing from a pre-populated history, as handed over by
    /// the stochastic warm-start phase.
    ///
    /// # Errors
    ///
    /// Returns an error when the function cannot be evaluated at `initial`.
    pub fn minimize_with_history<F: DiffFunction + ?Sized>(
        &mut self,
        function: &mut F,
        tolerance: f64,
        initial: &[f64],
        mut history: QnHistory,
    ) -> Result<Vec<f64>> {
        if initial.is_empty() {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let mut x = initial.to_vec();
        let mut value = function.value_at(&x)?;
        let mut gradient = function.gradient_at(&x)?;
        let mut best_x = x.clone();
        let mut best_value = value;
        log::info!(
            "quasi-Newton minimization over {} variables, initial value {value:.6}",
            x.len()
        );

        for iteration in 0..self.max_iterations {
            if gradient.l2_norm() < tolerance * x.l2_norm().max(1.0) {
                log::info!("converged on gradient norm after {iteration} iterations");
                break;
            }

            let mut direction = history.direction(&gradient);
            if ArgminDot::<Vec<f64>, f64>::dot(&direction, &gradient) >= 0.0 {
                log::debug!("non-descent direction, restarting from steepest descent");
                history.clear();
                direction = gradient.mul(&-1.0);
            }

            let step = match self.line_search(function, &x, value, &gradient, &direction) {
                Ok(step) => step,
                Err(LineSearchFailure::NoProgress) => {
                    if history.is_empty() {
                        log::warn!("line search failed along steepest descent, stopping");
                        break;
                    }
                    history.clear();
                    continue;
                }
                Err(LineSearchFailure::Fatal(e)) => {
                    log::error!("stopping on evaluation failure: {e}");
                    return Ok(best_x);
                }
            };

            let new_x = x.add(&direction.mul(&step));
            let new_value = match function.value_at(&new_x) {
                Ok(v) => v,
                Err(e) => {
                    log::error!("stopping on evaluation failure: {e}");
                    return Ok(best_x);
                }
            };
            let new_gradient = match function.gradient_at(&new_x) {
                Ok(g) => g,
                Err(e) => {
                    log::error!("stopping on evaluation failure: {e}");
                    return Ok(best_x);
                }
            };

            let s = new_x.sub(&x);
            let y = new_gradient.sub(&gradient);
            let curvature: f64 = s.dot(&y);
            let cautious_floor = if self.robust {
                1e-10 * s.l2_norm() * y.l2_norm()
            } else {
                0.0
            };
            if curvature > cautious_floor {
                history.push(s, y);
            } else {
                log::debug!("skipping update pair with curvature {curvature:.3e}");
            }

            let improvement = value - new_value;
            x = new_x;
            gradient = new_gradient;
            value = new_value;
            if value < best_value {
                best_value = value;
                best_x.copy_from_slice(&x);
            }

            if self.monitor_interval > 0 && (iteration + 1) % self.monitor_interval == 0 {
                if let Some(monitor) = &mut self.monitor {
                    monitor(iteration + 1, &x);
                }
            }
            log::debug!("iteration {iteration}: value {value:.6}, step {step:.3e}");

            if improvement.abs() < tolerance * value.abs().max(1.0) {
                log::info!("converged on function value after {} iterations", iteration + 1);
                break;
            }
            if let Some(limit) = self.time_limit {
                if start.elapsed() >= limit {
                    log::info!("stopping on the wall-clock limit");
                    break;
                }
            }
        }
        Ok(best_x)
    }

    /// Backtracking line search under the Armijo condition. Evaluation
    /// failures along the ray shrink the step like a rejected point.
    fn line_search<F: DiffFunction + ?Sized>(
        &self,
        function: &mut F,
        x: &[f64],
        value: f64,
        gradient: &[f64],
        direction: &Vec<f64>,
    ) -> Result<f64, LineSearchFailure> {
        let slope: f64 = direction.dot(&gradient.to_vec());
        if slope >= 0.0 {
            // a zero gradient has no descent ray
            return Err(LineSearchFailure::NoProgress);
        }
        let norm = direction.l2_norm();
        let mut step = if norm > 1.0 { 1.0 / norm } else { 1.0 };
        for _ in 0..MAX_BACKTRACKS {
            let candidate = x.to_vec().add(&direction.mul(&step));
            match function.value_at(&candidate) {
                Ok(v) if v <= value + ARMIJO_C1 * step * slope => return Ok(step),
                Ok(_) => {}
                Err(SeqCrfError::Numeric(e)) => {
                    log::debug!("numeric failure during line search, shrinking: {e}");
                }
                Err(e) => return Err(LineSearchFailure::Fatal(e)),
            }
            step *= BACKTRACK_RHO;
        }
        Err(LineSearchFailure::NoProgress)
    }
}

enum LineSearchFailure {
    NoProgress,
    Fatal(SeqCrfError),
}

impl<F: DiffFunction + ?Sized> Minimizer<F> for QnMinimizer {
    fn minimize(&mut self, function: &mut F, tolerance: f64, initial: &[f64]) -> Result<Vec<f64>> {
        Self::minimize(self, function, tolerance, initial)
    }
}
