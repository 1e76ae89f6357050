//! Numerical minimizers for the training objective.
//!
//! [`QnMinimizer`] is a limited-memory quasi-Newton batch minimizer;
//! [`SgdMinimizer`] is a stochastic minimizer with a decaying gain schedule
//! and gradient smoothing; [`SgdToQnMinimizer`] chains the two, seeding the
//! quasi-Newton history from curvature pairs harvested during the
//! stochastic phase.

mod qn;
mod sgd;
mod sgd_to_qn;

pub use qn::{QnHistory, QnMinimizer};
pub use sgd::{SgdMinimizer, SgdOutcome};
pub use sgd_to_qn::SgdToQnMinimizer;

use crate::errors::Result;

/// Minimizes a differentiable function from an initial weight vector.
pub trait Minimizer<F: ?Sized> {
    /// Runs the minimizer until convergence at `tolerance` or until an
    /// iteration, pass, or wall-clock limit fires, returning the best
    /// weights seen.
    ///
    /// # Errors
    ///
    /// Returns an error when the function cannot be evaluated at the
    /// initial point; later numeric failures end the run with the last
    /// safe weights instead.
    fn minimize(&mut self, function: &mut F, tolerance: f64, initial: &[f64]) -> Result<Vec<f64>>;
}
