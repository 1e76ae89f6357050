use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::math;
use crate::sequence::SequenceModel;

/// A temperature sequence over Gibbs sweeps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoolingSchedule {
    /// Temperature falls linearly from 1 to 0 over the given number of
    /// sweeps.
    Linear {
        /// Number of sweeps.
        iterations: usize,
    },
    /// Temperature starts at `start` and is multiplied by `rate` each sweep.
    Exponential {
        /// Temperature of the first sweep.
        start: f64,
        /// Per-sweep decay factor.
        rate: f64,
        /// Number of sweeps.
        iterations: usize,
    },
    /// The same temperature for every sweep.
    Constant {
        /// The fixed temperature.
        temperature: f64,
        /// Number of sweeps.
        iterations: usize,
    },
}

impl CoolingSchedule {
    /// Number of sweeps the schedule covers.
    #[must_use]
    pub const fn iterations(&self) -> usize {
        match *self {
            Self::Linear { iterations }
            | Self::Exponential { iterations, .. }
            | Self::Constant { iterations, .. } => iterations,
        }
    }

    /// Temperature of sweep `i`.
    #[must_use]
    pub fn temperature(&self, i: usize) -> f64 {
        match *self {
            Self::Linear { iterations } => 1.0 - i as f64 / iterations as f64,
            Self::Exponential { start, rate, .. } => start * rate.powi(i as i32),
            Self::Constant { temperature, .. } => temperature,
        }
    }
}

/// A Gibbs sampler over sequence models.
///
/// Samples sequences from the distribution a [`SequenceModel`] defines, and
/// searches for the best sequence by simulated annealing. All randomness
/// comes from the seeded generator, so runs are reproducible.
pub struct GibbsSampler {
    rng: StdRng,
}

impl GibbsSampler {
    /// Creates a sampler from a seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draws a uniformly random extended sequence respecting each position's
    /// possible values.
    pub fn random_sequence<M: SequenceModel + ?Sized>(&mut self, model: &M) -> Vec<usize> {
        (0..model.padded_length())
            .map(|pos| {
                let values = model.possible_values(pos);
                values[self.rng.gen_range(0..values.len())]
            })
            .collect()
    }

    /// Anneals from `initial`, sweeping the sequence once per scheduled
    /// temperature, and returns the best-scoring sequence seen.
    pub fn find_best_using_annealing<M: SequenceModel + ?Sized>(
        &mut self,
        model: &M,
        schedule: &CoolingSchedule,
        initial: Vec<usize>,
    ) -> Vec<usize> {
        let mut sequence = initial;
        let mut best = sequence.clone();
        let mut best_score = model.score_of_sequence(&best);
        for i in 0..schedule.iterations() {
            let temperature = schedule.temperature(i);
            self.sample_sequence_forward(model, &mut sequence, temperature);
            let score = model.score_of_sequence(&sequence);
            if score > best_score {
                best_score = score;
                best.copy_from_slice(&sequence);
            }
        }
        best
    }

    /// Collects `num_samples` sequences, `sample_interval` full sweeps
    /// apart, starting from `initial`.
    pub fn collect_samples<M: SequenceModel + ?Sized>(
        &mut self,
        model: &M,
        num_samples: usize,
        sample_interval: usize,
        initial: &[usize],
    ) -> Vec<Vec<usize>> {
        let mut sequence = initial.to_vec();
        let mut samples = Vec::with_capacity(num_samples);
        for _ in 0..num_samples {
            for _ in 0..sample_interval.max(1) {
                self.sample_sequence_forward(model, &mut sequence, 1.0);
            }
            samples.push(sequence.clone());
        }
        samples
    }

    /// Collects samples and returns the best-scoring one.
    pub fn find_best_using_sampling<M: SequenceModel + ?Sized>(
        &mut self,
        model: &M,
        num_samples: usize,
        sample_interval: usize,
        initial: &[usize],
    ) -> Vec<usize> {
        let samples = self.collect_samples(model, num_samples, sample_interval, initial);
        let mut best = initial.to_vec();
        let mut best_score = f64::NEG_INFINITY;
        for sample in samples {
            let score = model.score_of_sequence(&sample);
            if score > best_score {
                best_score = score;
                best = sample;
            }
        }
        best
    }

    /// Resamples every position once, in order, at the given temperature.
    pub fn sample_sequence_forward<M: SequenceModel + ?Sized>(
        &mut self,
        model: &M,
        sequence: &mut [usize],
        temperature: f64,
    ) {
        for pos in 0..sequence.len() {
            self.sample_position(model, sequence, pos, temperature);
        }
    }

    /// Resamples one position from its conditional given the rest.
    ///
    /// Temperature warps the conditional: logits are divided by it, and at
    /// zero the draw degenerates to the argmax (smallest class id on ties).
    pub fn sample_position<M: SequenceModel + ?Sized>(
        &mut self,
        model: &M,
        sequence: &mut [usize],
        pos: usize,
        temperature: f64,
    ) {
        let values = model.possible_values(pos);
        if values.len() <= 1 {
            if let Some(&only) = values.first() {
                sequence[pos] = only;
            }
            return;
        }
        let mut distribution = model.scores_of(sequence, pos);
        if temperature == 0.0 {
            sequence[pos] = math::argmax(&distribution);
            return;
        }
        if temperature != 1.0 {
            for d in distribution.iter_mut() {
                *d /= temperature;
            }
        }
        math::log_normalize(&mut distribution);
        math::exp_in_place(&mut distribution);
        sequence[pos] = math::sample_from_distribution(&distribution, &mut self.rng);
    }
}
