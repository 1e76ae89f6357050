use std::fmt;
use std::str::FromStr;

use bincode::{Decode, Encode};

use crate::errors::{Result, SeqCrfError};
use crate::objective::Regularizer;

/// Inference used by `classify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Decode, Encode)]
pub enum InferenceKind {
    /// Exact Viterbi decoding.
    Viterbi,
    /// Beam search with `beam_size` states.
    Beam,
}

/// Annealing schedule used by Gibbs decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Decode, Encode)]
pub enum AnnealingKind {
    /// Temperature falls linearly from one to zero.
    Linear,
    /// Temperature decays by `annealing_rate` each sweep.
    Exponential,
}

/// Which minimizer drives training. Exactly one is active; selecting an
/// optimizer the engine does not carry is a configuration error at the
/// flag-parsing boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Decode, Encode)]
pub enum OptimizerKind {
    /// Batch quasi-Newton.
    QuasiNewton,
    /// Scaled stochastic gradient descent.
    Sgd,
    /// Stochastic warm start, then quasi-Newton.
    SgdToQn,
}

/// The entity-structure prior mixed into Gibbs decoding. The prior models
/// themselves are supplied by the caller; the selector is validated and
/// persisted with the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Decode, Encode)]
pub enum PriorKind {
    /// Decode from the CRF alone.
    None,
    /// A named-entity structure prior.
    Ner,
    /// The acquisitions-domain prior.
    Acquisitions,
    /// The seminars-domain prior.
    Seminars,
}

macro_rules! flag_enum_strings {
    ($ty:ident { $($variant:ident => $name:literal,)* }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let name = match self {
                    $(Self::$variant => $name,)*
                };
                f.write_str(name)
            }
        }

        impl FromStr for $ty {
            type Err = SeqCrfError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok(Self::$variant),)*
                    other => Err(SeqCrfError::config(format!(
                        concat!("unsupported ", stringify!($ty), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

flag_enum_strings!(InferenceKind {
    Viterbi => "viterbi",
    Beam => "beam",
});

flag_enum_strings!(AnnealingKind {
    Linear => "linear",
    Exponential => "exponential",
});

flag_enum_strings!(OptimizerKind {
    QuasiNewton => "qn",
    Sgd => "sgd",
    SgdToQn => "sgd-to-qn",
});

flag_enum_strings!(PriorKind {
    None => "none",
    Ner => "ner",
    Acquisitions => "acquisitions",
    Seminars => "seminars",
});

flag_enum_strings!(Regularizer {
    None => "none",
    Quadratic => "quadratic",
    Huber => "huber",
    Quartic => "quartic",
});

/// The configuration bag: every knob the engine honors, persisted with the
/// model.
#[derive(Debug, Clone, PartialEq, Decode, Encode)]
pub struct CrfConfig {
    /// Maximum clique order.
    pub window: usize,
    /// The not-an-entity label, also the left padding.
    pub background_symbol: String,
    /// Process sequences right to left internally.
    pub use_reverse: bool,
    /// Restrict label tuple indices to tuples seen in training.
    pub use_observed_sequences_only: bool,
    /// Drop features that co-occur with the background label only once.
    pub remove_background_singleton_features: bool,

    /// Decoder for `classify`.
    pub inference: InferenceKind,
    /// States kept per position under beam inference.
    pub beam_size: usize,
    /// Decode with Gibbs sampling instead of search.
    pub do_gibbs: bool,
    /// Gibbs sweeps per document.
    pub num_samples: usize,
    /// Cooling schedule for Gibbs decoding.
    pub annealing: AnnealingKind,
    /// Per-sweep decay under exponential cooling.
    pub annealing_rate: f64,
    /// Start Gibbs from the Viterbi sequence rather than a random one.
    pub init_viterbi: bool,
    /// Entity prior mixed in during Gibbs decoding.
    pub prior: PriorKind,

    /// Minimizer selection.
    pub optimizer: OptimizerKind,
    /// Quasi-Newton memory.
    pub qn_size: usize,
    /// Cautious curvature skipping in the quasi-Newton.
    pub use_robust_qn: bool,
    /// Stochastic passes (SGD and the warm phase of SGD-to-QN).
    pub sgd_passes: usize,
    /// Quasi-Newton iterations after the stochastic warm start.
    pub qn_passes: u64,
    /// Initial stochastic gain.
    pub initial_gain: f64,
    /// Mini-batch size.
    pub stochastic_batch_size: usize,

    /// Weight penalty.
    pub regularizer: Regularizer,
    /// Regularizer strength.
    pub sigma: f64,
    /// Huber threshold; required when the Huber regularizer is selected.
    pub huber_epsilon: Option<f64>,
    /// Convergence tolerance handed to the minimizer.
    pub tolerance: f64,

    /// Features whose weight range stays at or below this are pruned.
    pub feature_diff_thresh: f64,
    /// Prune-and-retrain cycles after the first training pass.
    pub num_times_prune_features: usize,
    /// Spill the feature index to a temp file while optimizing.
    pub save_feature_index_to_disk: bool,
    /// Path to a serialized initial weight vector.
    pub initial_weights: Option<String>,
    /// Invoke the interim monitor every this many iterations; zero disables.
    pub interim_output_freq: u64,
    /// Wall-clock budget for training, in seconds.
    pub time_limit_secs: Option<u64>,

    /// Seed for every stochastic component.
    pub seed: u64,
    /// Worker threads for objective evaluation.
    pub n_threads: usize,
}

impl Default for CrfConfig {
    fn default() -> Self {
        Self {
            window: 2,
            background_symbol: "O".to_string(),
            use_reverse: false,
            use_observed_sequences_only: false,
            remove_background_singleton_features: false,
            inference: InferenceKind::Viterbi,
            beam_size: 30,
            do_gibbs: false,
            num_samples: 100,
            annealing: AnnealingKind::Linear,
            annealing_rate: 0.9,
            init_viterbi: true,
            prior: PriorKind::None,
            optimizer: OptimizerKind::QuasiNewton,
            qn_size: 25,
            use_robust_qn: false,
            sgd_passes: 50,
            qn_passes: 20,
            initial_gain: 0.1,
            stochastic_batch_size: 15,
            regularizer: Regularizer::Quadratic,
            sigma: 1.0,
            huber_epsilon: None,
            tolerance: 1e-4,
            feature_diff_thresh: 0.0,
            num_times_prune_features: 0,
            save_feature_index_to_disk: false,
            initial_weights: None,
            interim_output_freq: 0,
            time_limit_secs: None,
            seed: 1,
            n_threads: 1,
        }
    }
}

impl CrfConfig {
    /// Rejects contradictory or unsupported settings.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error naming the offending flag.
    pub fn validate(&self) -> Result<()> {
        if self.window < 1 {
            return Err(SeqCrfError::config("window must be at least 1"));
        }
        if self.background_symbol.is_empty() {
            return Err(SeqCrfError::config("backgroundSymbol must be non-empty"));
        }
        if self.inference == InferenceKind::Beam && self.beam_size < 1 {
            return Err(SeqCrfError::config("beamSize must be at least 1"));
        }
        if self.regularizer == Regularizer::Huber && self.huber_epsilon.is_none() {
            return Err(SeqCrfError::config(
                "the Huber regularizer requires an epsilon",
            ));
        }
        if let Some(epsilon) = self.huber_epsilon {
            if epsilon <= 0.0 {
                return Err(SeqCrfError::config("epsilon must be positive"));
            }
        }
        if self.sigma <= 0.0 && self.regularizer != Regularizer::None {
            return Err(SeqCrfError::config("sigma must be positive"));
        }
        if self.do_gibbs && self.num_samples == 0 {
            return Err(SeqCrfError::config(
                "Gibbs decoding requires at least one sample",
            ));
        }
        if self.do_gibbs
            && self.annealing == AnnealingKind::Exponential
            && !(0.0 < self.annealing_rate && self.annealing_rate < 1.0)
        {
            return Err(SeqCrfError::config(
                "exponential annealing requires a rate in (0, 1)",
            ));
        }
        if self.qn_size == 0 {
            return Err(SeqCrfError::config("QNsize must be at least 1"));
        }
        if self.stochastic_batch_size == 0 {
            return Err(SeqCrfError::config(
                "stochasticBatchSize must be at least 1",
            ));
        }
        if self.n_threads == 0 {
            return Err(SeqCrfError::config("numThreads must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        CrfConfig::default().validate().unwrap();
    }

    #[test]
    fn test_huber_requires_epsilon() {
        let mut config = CrfConfig {
            regularizer: Regularizer::Huber,
            ..CrfConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SeqCrfError::Config(_))
        ));
        config.huber_epsilon = Some(0.25);
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let config = CrfConfig {
            window: 0,
            ..CrfConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flag_enum_round_trip() {
        for kind in [
            OptimizerKind::QuasiNewton,
            OptimizerKind::Sgd,
            OptimizerKind::SgdToQn,
        ] {
            assert_eq!(kind, kind.to_string().parse().unwrap());
        }
        assert!("smd".parse::<OptimizerKind>().is_err());
        assert_eq!(
            InferenceKind::Beam,
            "beam".parse::<InferenceKind>().unwrap()
        );
        assert_eq!(
            Regularizer::Quartic,
            "quartic".parse::<Regularizer>().unwrap()
        );
        assert!("ridge".parse::<Regularizer>().is_err());
    }
}
