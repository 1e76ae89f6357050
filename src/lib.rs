//! # seqcrf
//!
//! Higher-order linear-chain Conditional Random Fields for sequence
//! labeling, most prominently named-entity recognition over tokenized
//! text.
//!
//! The crate trains a model from gold-labeled token sequences and applies
//! it to new ones. Features are opaque strings produced by a caller-supplied
//! [`FeatureFactory`]; each feature parameterizes label cliques of one
//! order, up to the configured window. Inference runs forward-backward
//! message passing over a chain of log-space factor tables, and decoding is
//! exact Viterbi, beam search, k-best enumeration, or Gibbs sampling with
//! simulated annealing.
//!
//! ## Example
//!
//! ```rust
//! use seqcrf::{CrfClassifier, CrfConfig, FeatureFactory, Token};
//!
//! // A minimal factory: the word shape at the focus position.
//! struct ShapeFactory;
//!
//! impl FeatureFactory for ShapeFactory {
//!     fn clique_features(&self, tokens: &[Token], position: usize, order: usize) -> Vec<String> {
//!         if order != 0 {
//!             return Vec::new();
//!         }
//!         let caps = tokens[position].word.chars().next().is_some_and(char::is_uppercase);
//!         vec![if caps { "shape=caps" } else { "shape=lower" }.to_string()]
//!     }
//!
//!     fn identifier(&self) -> &str {
//!         "shape-factory"
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let training = vec![vec![
//!     Token::with_answer("John", "P"),
//!     Token::with_answer("runs", "O"),
//! ]];
//!
//! let mut classifier = CrfClassifier::new(CrfConfig::default(), ShapeFactory)?;
//! classifier.train(&training)?;
//!
//! let mut document = vec![Token::new("Mary"), Token::new("walks")];
//! classifier.classify(&mut document)?;
//! assert_eq!(Some("P".to_string()), document[0].answer);
//! assert_eq!(Some("O".to_string()), document[1].answer);
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod classifier;
mod clique_tree;
mod config;
mod datum;
mod errors;
mod factor;
mod index;
mod label;
mod math;
mod model_io;
mod objective;
mod sequence;

pub mod decode;
pub mod optimize;

#[cfg(test)]
mod test_utils;

pub use classifier::CrfClassifier;
pub use clique_tree::CliqueTree;
pub use config::{AnnealingKind, CrfConfig, InferenceKind, OptimizerKind, PriorKind};
pub use datum::{CrfDatum, Document, EncodedDocument, FeatureFactory, Token};
pub use errors::{Result, SeqCrfError};
pub use factor::FactorTable;
pub use index::Index;
pub use label::LabelTuple;
pub use objective::{CrfObjective, DiffFunction, Regularizer, StochasticDiffFunction};
pub use sequence::{CrfSearchModel, CrfSequenceModel, FactoredSequenceModel, SequenceModel};
