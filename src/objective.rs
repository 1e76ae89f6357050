use std::sync::Mutex;
use std::thread;

use bincode::{Decode, Encode};

use crate::clique_tree::CliqueTree;
use crate::datum::EncodedDocument;
use crate::errors::{Result, SeqCrfError};
use crate::index::Index;
use crate::label::LabelTuple;

/// A differentiable function of a flat weight vector.
///
/// Implementations cache the value and derivative of the last argument; the
/// cache is invalidated when any coordinate changes.
pub trait DiffFunction {
    /// Dimension of the weight vector.
    fn dimension(&self) -> usize;

    /// Function value at `x`.
    ///
    /// # Errors
    ///
    /// Returns a `Numeric` error if the value is not finite.
    fn value_at(&mut self, x: &[f64]) -> Result<f64>;

    /// Gradient at `x`.
    ///
    /// # Errors
    ///
    /// Returns a `Numeric` error if any coordinate is not finite.
    fn gradient_at(&mut self, x: &[f64]) -> Result<Vec<f64>>;
}

/// A differentiable function whose gradient can be estimated from a subset
/// of the underlying data.
pub trait StochasticDiffFunction: DiffFunction {
    /// Number of data items the function sums over.
    fn data_dimension(&self) -> usize;

    /// Mini-batch gradient at `x` over the data items in `batch`. The
    /// empirical counts and the regularizer are scaled by
    /// `batch.len() / data_dimension()` so batches that partition the data
    /// sum to the full gradient.
    ///
    /// # Errors
    ///
    /// Returns a `Numeric` error if any coordinate is not finite.
    fn batch_gradient_at(&mut self, x: &[f64], batch: &[usize]) -> Result<Vec<f64>>;
}

/// The weight penalty added to the negative log-likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Decode, Encode)]
pub enum Regularizer {
    /// No penalty.
    None,
    /// `Σ x² / 2σ²`.
    Quadratic,
    /// Quadratic within `|x| < ε`, linear outside.
    Huber,
    /// `Σ x⁴ / 2σ⁴`.
    Quartic,
}

struct Cache {
    x: Vec<f64>,
    value: f64,
    gradient: Vec<f64>,
}

/// Negative regularized log conditional likelihood of a training set, with
/// its gradient as expected minus empirical feature counts.
pub struct CrfObjective<'a> {
    docs: &'a [EncodedDocument],
    label_indices: &'a [Index<LabelTuple>],
    /// Clique order of each feature.
    feature_orders: &'a [usize],
    num_classes: usize,
    window: usize,
    background: usize,
    regularizer: Regularizer,
    sigma: f64,
    huber_epsilon: f64,
    n_threads: usize,
    /// Feature-label co-occurrence counts in the gold data.
    empirical: Vec<Vec<f64>>,
    dimension: usize,
    cache: Option<Cache>,
}

impl<'a> CrfObjective<'a> {
    /// Builds the objective and precomputes the empirical counts.
    ///
    /// # Errors
    ///
    /// Returns a `Data` error if a gold label window is missing from the
    /// label tuple index of its order.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        docs: &'a [EncodedDocument],
        label_indices: &'a [Index<LabelTuple>],
        feature_orders: &'a [usize],
        num_classes: usize,
        background: usize,
        regularizer: Regularizer,
        sigma: f64,
        huber_epsilon: f64,
        n_threads: usize,
    ) -> Result<Self> {
        if label_indices.is_empty() {
            return Err(SeqCrfError::data(
                "label tuple indices must cover at least order one",
            ));
        }
        let window = label_indices.len();
        let dimension = feature_orders
            .iter()
            .map(|&o| label_indices[o].len())
            .sum();
        let mut objective = Self {
            docs,
            label_indices,
            feature_orders,
            num_classes,
            window,
            background,
            regularizer,
            sigma,
            huber_epsilon,
            n_threads: n_threads.max(1),
            empirical: Vec::new(),
            dimension,
            cache: None,
        };
        objective.empirical = objective.empirical_counts()?;
        Ok(objective)
    }

    /// An all-zero table shaped like the ragged weights.
    fn empty_ragged(&self) -> Vec<Vec<f64>> {
        self.feature_orders
            .iter()
            .map(|&o| vec![0.0; self.label_indices[o].len()])
            .collect()
    }

    /// Unpacks a flat weight vector into the ragged per-feature table.
    pub fn to_ragged(&self, x: &[f64]) -> Vec<Vec<f64>> {
        debug_assert_eq!(x.len(), self.dimension);
        let mut ragged = Vec::with_capacity(self.feature_orders.len());
        let mut at = 0;
        for &order in self.feature_orders {
            let width = self.label_indices[order].len();
            ragged.push(x[at..at + width].to_vec());
            at += width;
        }
        ragged
    }

    /// Packs a ragged weight table into a flat vector.
    pub fn to_flat(ragged: &[Vec<f64>]) -> Vec<f64> {
        let mut flat = Vec::new();
        for row in ragged {
            flat.extend_from_slice(row);
        }
        flat
    }

    /// Counts gold feature-label co-occurrences, walking every position with
    /// the gold window left-padded by the background label.
    fn empirical_counts(&self) -> Result<Vec<Vec<f64>>> {
        let mut counts = self.empty_ragged();
        for doc in self.docs {
            let mut window_labels = vec![self.background; self.window];
            for (position, orders) in doc.data.iter().enumerate() {
                window_labels.rotate_left(1);
                window_labels[self.window - 1] = doc.labels[position];
                for (order, features) in orders.iter().enumerate() {
                    if features.is_empty() {
                        continue;
                    }
                    let tuple = LabelTuple::new(&window_labels[self.window - 1 - order..]);
                    let k = self.label_indices[order].index_of(&tuple).ok_or_else(|| {
                        SeqCrfError::data(format!(
                            "gold label window {tuple:?} is not in the order-{order} label index"
                        ))
                    })?;
                    for &f in features {
                        counts[f as usize][k] += 1.0;
                    }
                }
            }
        }
        Ok(counts)
    }

    /// Sums the gold log-likelihood and the expected feature counts over the
    /// documents in `batch`, distributing documents over a worker pool.
    fn accumulate(&self, weights: &[Vec<f64>], batch: &[usize]) -> Result<(f64, Vec<Vec<f64>>)> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        for &i in batch {
            sender.send(i).expect("channel is unbounded");
        }
        drop(sender);

        let log_prob_total = Mutex::new(0.0);
        let expected = Mutex::new(self.empty_ragged());
        let failure: Mutex<Option<SeqCrfError>> = Mutex::new(None);

        thread::scope(|scope| {
            for _ in 0..self.n_threads {
                scope.spawn(|| {
                    let mut local_log_prob = 0.0;
                    let mut local_expected = self.empty_ragged();
                    while let Ok(i) = receiver.try_recv() {
                        match self.document_statistics(weights, &self.docs[i], &mut local_expected)
                        {
                            Ok(log_prob) => local_log_prob += log_prob,
                            Err(e) => {
                                *failure.lock().expect("mutex is never poisoned") = Some(e);
                                return;
                            }
                        }
                    }
                    *log_prob_total.lock().expect("mutex is never poisoned") += local_log_prob;
                    let mut expected = expected.lock().expect("mutex is never poisoned");
                    for (row, local_row) in expected.iter_mut().zip(local_expected) {
                        for (e, l) in row.iter_mut().zip(local_row) {
                            *e += l;
                        }
                    }
                });
            }
        });

        if let Some(e) = failure.into_inner().expect("mutex is never poisoned") {
            return Err(e);
        }
        let log_prob = log_prob_total.into_inner().expect("mutex is never poisoned");
        if log_prob.is_nan() {
            return Err(SeqCrfError::numeric(
                "NaN log-likelihood in objective evaluation",
            ));
        }
        Ok((
            log_prob,
            expected.into_inner().expect("mutex is never poisoned"),
        ))
    }

    /// Gold log-likelihood of one document plus its expected counts.
    fn document_statistics(
        &self,
        weights: &[Vec<f64>],
        doc: &EncodedDocument,
        expected: &mut [Vec<f64>],
    ) -> Result<f64> {
        if doc.is_empty() {
            return Ok(0.0);
        }
        let tree = CliqueTree::calibrated(
            weights,
            &doc.data,
            self.label_indices,
            self.num_classes,
            self.background,
        )?;

        let mut given = vec![self.background; self.window - 1];
        let mut log_prob = 0.0;
        for (position, &label) in doc.labels.iter().enumerate() {
            let p = tree.cond_log_prob_given_previous(position, label, &given);
            if p.is_nan() {
                return Err(SeqCrfError::numeric(format!(
                    "NaN gold conditional at position {position}"
                )));
            }
            log_prob += p;
            if !given.is_empty() {
                given.rotate_left(1);
                let last = given.len() - 1;
                given[last] = label;
            }
        }

        for (position, orders) in doc.data.iter().enumerate() {
            for (order, features) in orders.iter().enumerate() {
                if features.is_empty() {
                    continue;
                }
                for (k, tuple) in self.label_indices[order].iter().enumerate() {
                    let p = tree.prob_labels(position, &tuple.labels());
                    for &f in features {
                        expected[f as usize][k] += p;
                    }
                }
            }
        }
        Ok(log_prob)
    }

    /// Adds the regularizer, scaled by `scale`, to the value and gradient.
    fn apply_regularizer(&self, x: &[f64], value: &mut f64, gradient: &mut [f64], scale: f64) {
        match self.regularizer {
            Regularizer::None => {}
            Regularizer::Quadratic => {
                let sigma_sq = self.sigma * self.sigma;
                for (w, g) in x.iter().zip(gradient.iter_mut()) {
                    *value += scale * w * w / 2.0 / sigma_sq;
                    *g += scale * w / sigma_sq;
                }
            }
            Regularizer::Huber => {
                let sigma_sq = self.sigma * self.sigma;
                let epsilon = self.huber_epsilon;
                for (w, g) in x.iter().zip(gradient.iter_mut()) {
                    let wabs = w.abs();
                    if wabs < epsilon {
                        *value += scale * w * w / 2.0 / epsilon / sigma_sq;
                        *g += scale * w / epsilon / sigma_sq;
                    } else {
                        *value += scale * (wabs - epsilon / 2.0) / sigma_sq;
                        *g += scale * w.signum() / sigma_sq;
                    }
                }
            }
            Regularizer::Quartic => {
                let sigma_qu = self.sigma.powi(4);
                for (w, g) in x.iter().zip(gradient.iter_mut()) {
                    *value += scale * w.powi(4) / 2.0 / sigma_qu;
                    *g += scale * w / sigma_qu;
                }
            }
        }
    }

    /// Full-batch value and gradient.
    fn calculate(&self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
        let weights = self.to_ragged(x);
        let batch: Vec<usize> = (0..self.docs.len()).collect();
        let (log_prob, expected) = self.accumulate(&weights, &batch)?;

        let mut value = -log_prob;
        let mut gradient = Vec::with_capacity(self.dimension);
        for (row, empirical_row) in expected.iter().zip(&self.empirical) {
            for (e, emp) in row.iter().zip(empirical_row) {
                gradient.push(e - emp);
            }
        }
        self.apply_regularizer(x, &mut value, &mut gradient, 1.0);

        if !value.is_finite() {
            return Err(SeqCrfError::numeric("non-finite objective value"));
        }
        Ok((value, gradient))
    }

    fn ensure(&mut self, x: &[f64]) -> Result<()> {
        if let Some(cache) = &self.cache {
            if cache.x == x {
                return Ok(());
            }
        }
        let (value, gradient) = self.calculate(x)?;
        self.cache = Some(Cache {
            x: x.to_vec(),
            value,
            gradient,
        });
        Ok(())
    }
}

impl DiffFunction for CrfObjective<'_> {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn value_at(&mut self, x: &[f64]) -> Result<f64> {
        self.ensure(x)?;
        Ok(self.cache.as_ref().expect("ensured").value)
    }

    fn gradient_at(&mut self, x: &[f64]) -> Result<Vec<f64>> {
        self.ensure(x)?;
        Ok(self.cache.as_ref().expect("ensured").gradient.clone())
    }
}

impl StochasticDiffFunction for CrfObjective<'_> {
    fn data_dimension(&self) -> usize {
        self.docs.len()
    }

    fn batch_gradient_at(&mut self, x: &[f64], batch: &[usize]) -> Result<Vec<f64>> {
        let weights = self.to_ragged(x);
        let (_, expected) = self.accumulate(&weights, batch)?;
        let batch_scale = batch.len() as f64 / self.docs.len() as f64;

        let mut gradient = Vec::with_capacity(self.dimension);
        for (row, empirical_row) in expected.iter().zip(&self.empirical) {
            for (e, emp) in row.iter().zip(empirical_row) {
                gradient.push(e - batch_scale * emp);
            }
        }
        let mut unused_value = 0.0;
        self.apply_regularizer(x, &mut unused_value, &mut gradient, batch_scale);

        if gradient.iter().any(|g| !g.is_finite()) {
            return Err(SeqCrfError::numeric("non-finite mini-batch gradient"));
        }
        Ok(gradient)
    }
}
