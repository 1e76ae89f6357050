use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use hashbrown::HashSet;

use crate::clique_tree::CliqueTree;
use crate::config::{AnnealingKind, CrfConfig, InferenceKind, OptimizerKind, PriorKind};
use crate::datum::{CrfDatum, Document, EncodedDocument, FeatureFactory, Token};
use crate::decode::{
    beam_best_sequence, k_best_sequences, viterbi_best_sequence, CoolingSchedule, GibbsSampler,
};
use crate::errors::{Result, SeqCrfError};
use crate::index::Index;
use crate::label::{all_labels, LabelTuple};
use crate::objective::CrfObjective;
use crate::optimize::{QnMinimizer, SgdMinimizer, SgdToQnMinimizer};
use crate::sequence::{CrfSearchModel, CrfSequenceModel, FactoredSequenceModel, SequenceModel};

/// The classifier façade: owns the indices, the weights, and the
/// configuration; trains from labeled documents and labels new ones.
pub struct CrfClassifier<F> {
    pub(crate) config: CrfConfig,
    pub(crate) factory: F,
    pub(crate) classes: Index<String>,
    pub(crate) features: Index<String>,
    pub(crate) label_indices: Vec<Index<LabelTuple>>,
    /// Clique order of each feature.
    pub(crate) feature_orders: Vec<usize>,
    /// Ragged weight table, one row per feature.
    pub(crate) weights: Vec<Vec<f64>>,
    pub(crate) known_lc_words: Vec<String>,
}

impl<F: FeatureFactory> CrfClassifier<F> {
    /// Creates an untrained classifier.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error for an invalid configuration.
    pub fn new(config: CrfConfig, factory: F) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            factory,
            classes: Index::new(),
            features: Index::new(),
            label_indices: Vec::new(),
            feature_orders: Vec::new(),
            weights: Vec::new(),
            known_lc_words: Vec::new(),
        })
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &CrfConfig {
        &self.config
    }

    /// The class index.
    #[must_use]
    pub fn classes(&self) -> &Index<String> {
        &self.classes
    }

    /// The feature index.
    #[must_use]
    pub fn features(&self) -> &Index<String> {
        &self.features
    }

    /// Id of the background class.
    #[must_use]
    pub fn background_id(&self) -> usize {
        self.classes
            .index_of(&self.config.background_symbol)
            .unwrap_or(0)
    }

    fn window(&self) -> usize {
        self.config.window
    }

    /// Extracts one position's features and its gold label window,
    /// left-padded with the background label.
    fn make_datum(&self, tokens: &[Token], position: usize) -> Result<CrfDatum> {
        let window = self.window();
        let mut features = Vec::with_capacity(window);
        for order in 0..window {
            features.push(self.factory.clique_features(tokens, position, order));
        }
        let background = self
            .classes
            .index_of(&self.config.background_symbol)
            .unwrap_or(0);
        let mut labels = vec![background; window];
        for (i, slot) in labels.iter_mut().enumerate() {
            let p = position + i + 1;
            if p >= window {
                let token = &tokens[p - window];
                let answer = token.answer.as_ref().ok_or_else(|| {
                    SeqCrfError::data(format!("token {:?} has no gold answer", token.word))
                })?;
                *slot = self.classes.index_of(answer).ok_or_else(|| {
                    SeqCrfError::data(format!("unknown gold class {answer:?}"))
                })?;
            }
        }
        Ok(CrfDatum {
            features,
            label: LabelTuple::new(&labels),
        })
    }

    /// Builds the class index, the per-order feature sets, the feature
    /// order map, and the label tuple indices from the training documents.
    fn build_indices(&mut self, docs: &[Document]) -> Result<()> {
        let window = self.window();
        self.classes = Index::new();
        self.classes
            .index_of_or_add(&self.config.background_symbol);
        for doc in docs {
            for token in doc {
                if let Some(answer) = &token.answer {
                    self.classes.index_of_or_add(answer);
                }
            }
        }

        let mut order_features: Vec<Index<String>> = (0..window).map(|_| Index::new()).collect();
        let mut observed_windows: Index<LabelTuple> = Index::new();
        let mut seen_background_once: [HashSet<String>; 2] =
            [HashSet::new(), HashSet::new()];
        let mut lc_words: HashSet<String> = HashSet::new();

        for doc in docs {
            for token in doc {
                if !token.word.is_empty() && token.word == token.word.to_lowercase() {
                    lc_words.insert(token.word.clone());
                }
            }
            for position in 0..doc.len() {
                let datum = self.make_datum(doc, position)?;
                observed_windows.index_of_or_add(&datum.label);
                for (order, features) in datum.features.iter().enumerate() {
                    let filtered = order < 2 && self.config.remove_background_singleton_features;
                    if !filtered {
                        for feature in features {
                            order_features[order].index_of_or_add(feature);
                        }
                        continue;
                    }
                    let mut answer = doc[position].answer.as_deref();
                    let mut background = answer == Some(self.config.background_symbol.as_str());
                    if order == 1 && position > 0 && background {
                        answer = doc[position - 1].answer.as_deref();
                        background = answer == Some(self.config.background_symbol.as_str());
                    }
                    if background {
                        // index a background feature only on its second sighting
                        for feature in features {
                            if order_features[order].contains(feature) {
                                continue;
                            }
                            if seen_background_once[order].remove(feature) {
                                order_features[order].index_of_or_add(feature);
                            } else {
                                seen_background_once[order].insert(feature.clone());
                            }
                        }
                    } else {
                        for feature in features {
                            seen_background_once[order].remove(feature);
                            order_features[order].index_of_or_add(feature);
                        }
                    }
                }
            }
        }

        self.features = Index::new();
        self.feature_orders = Vec::new();
        for (order, index) in order_features.iter().enumerate() {
            for feature in index.iter() {
                self.features.index_of_or_add(feature);
                self.feature_orders.push(order);
            }
        }

        let num_classes = self.classes.len();
        if self.config.use_observed_sequences_only {
            let mut label_indices: Vec<Index<LabelTuple>> =
                (0..window).map(|_| Index::new()).collect();
            for tuple in observed_windows.iter() {
                // every suffix of an observed window is observable
                let mut suffix = tuple.clone();
                label_indices[window - 1].index_of_or_add(&suffix);
                for order in (0..window.saturating_sub(1)).rev() {
                    suffix = suffix.one_smaller();
                    label_indices[order].index_of_or_add(&suffix);
                }
            }
            self.label_indices = label_indices;
        } else {
            self.label_indices = (1..=window)
                .map(|order| all_labels(order, num_classes))
                .collect();
        }

        let mut lc_words: Vec<String> = lc_words.into_iter().collect();
        lc_words.sort_unstable();
        self.known_lc_words = lc_words;

        log::info!(
            "indexed {} classes, {} features, window {}",
            self.classes.len(),
            self.features.len(),
            window
        );
        Ok(())
    }

    /// Translates a document into feature ids and class ids. Features
    /// missing from the index are silently dropped; in training mode a
    /// missing or unknown gold answer is a data error.
    fn encode_document(&self, tokens: &[Token], for_training: bool) -> Result<EncodedDocument> {
        let window = self.window();
        let background = self.background_id();
        let mut data = Vec::with_capacity(tokens.len());
        let mut labels = Vec::with_capacity(tokens.len());
        for position in 0..tokens.len() {
            let mut orders = Vec::with_capacity(window);
            for order in 0..window {
                let mut ids = Vec::new();
                for feature in self.factory.clique_features(tokens, position, order) {
                    if let Some(id) = self.features.index_of(&feature) {
                        ids.push(u32::try_from(id).expect("feature ids fit in u32"));
                    }
                }
                orders.push(ids);
            }
            data.push(orders);

            let label = match &tokens[position].answer {
                Some(answer) => match self.classes.index_of(answer) {
                    Some(id) => id,
                    None if for_training => {
                        return Err(SeqCrfError::data(format!(
                            "unknown gold class {answer:?}"
                        )))
                    }
                    None => background,
                },
                None if for_training => {
                    return Err(SeqCrfError::data(format!(
                        "token {:?} has no gold answer",
                        tokens[position].word
                    )))
                }
                None => background,
            };
            labels.push(label);
        }
        Ok(EncodedDocument { data, labels })
    }

    /// Trains the classifier: builds indices, minimizes the objective, and
    /// optionally prunes low-range features and retrains.
    ///
    /// # Errors
    ///
    /// Returns `Data` errors for unusable training documents, `Config` or
    /// `Format` errors for unusable initial weights, and surfaces fatal
    /// numeric failures from the optimizer.
    pub fn train(&mut self, docs: &[Document]) -> Result<()> {
        let reversed;
        let docs: &[Document] = if self.config.use_reverse {
            reversed = docs
                .iter()
                .map(|d| d.iter().rev().cloned().collect())
                .collect::<Vec<Document>>();
            &reversed
        } else {
            docs
        };

        self.build_indices(docs)?;

        for pass in 0..=self.config.num_times_prune_features {
            let encoded = docs
                .iter()
                .map(|d| self.encode_document(d, true))
                .collect::<Result<Vec<_>>>()?;

            let dimension: usize = self
                .feature_orders
                .iter()
                .map(|&o| self.label_indices[o].len())
                .sum();
            let initial = match (&self.config.initial_weights, pass) {
                (Some(path), 0) => load_initial_weights(Path::new(path), dimension)?,
                _ => vec![0.0; dimension],
            };
            log::info!("training pass {pass}: {dimension} weights");

            let spilled = if self.config.save_feature_index_to_disk {
                Some(self.spill_feature_index(pass)?)
            } else {
                None
            };
            let outcome = self.run_optimizer(&encoded, initial);
            if let Some(path) = spilled {
                self.restore_feature_index(&path)?;
            }
            let flat = outcome?;

            self.weights = self.unflatten(&flat);

            if pass != self.config.num_times_prune_features {
                let dropped = self.drop_features_below_threshold(self.config.feature_diff_thresh);
                log::info!(
                    "pruned {dropped} features with weight range at or below {}, retraining",
                    self.config.feature_diff_thresh
                );
            }
        }
        Ok(())
    }

    fn run_optimizer(&self, encoded: &[EncodedDocument], initial: Vec<f64>) -> Result<Vec<f64>> {
        let mut objective = CrfObjective::new(
            encoded,
            &self.label_indices,
            &self.feature_orders,
            self.classes.len(),
            self.background_id(),
            self.config.regularizer,
            self.config.sigma,
            self.config.huber_epsilon.unwrap_or(0.0),
            self.config.n_threads,
        )?;
        let time_limit = self.config.time_limit_secs.map(Duration::from_secs);
        let tolerance = self.config.tolerance;

        match self.config.optimizer {
            OptimizerKind::QuasiNewton => {
                let mut qn = QnMinimizer::new(self.config.qn_size)
                    .robust(self.config.use_robust_qn)
                    .time_limit(time_limit);
                if self.config.interim_output_freq > 0 {
                    qn = qn.monitor(self.config.interim_output_freq, |iteration, x| {
                        let norm: f64 = x.iter().map(|v| v * v).sum::<f64>().sqrt();
                        log::info!("iteration {iteration}: weight norm {norm:.6}");
                    });
                }
                qn.minimize(&mut objective, tolerance, &initial)
            }
            OptimizerKind::Sgd => SgdMinimizer::new(
                self.config.initial_gain,
                self.config.stochastic_batch_size,
                self.config.sgd_passes,
            )
            .seed(self.config.seed)
            .time_limit(time_limit)
            .minimize(&mut objective, tolerance, &initial),
            OptimizerKind::SgdToQn => SgdToQnMinimizer::new(
                self.config.initial_gain,
                self.config.stochastic_batch_size,
                self.config.sgd_passes,
                self.config.qn_passes,
            )
            .memory(self.config.qn_size)
            .robust(self.config.use_robust_qn)
            .seed(self.config.seed)
            .time_limit(time_limit)
            .minimize(&mut objective, tolerance, &initial),
        }
    }

    /// Unpacks a flat weight vector into the ragged per-feature table.
    fn unflatten(&self, flat: &[f64]) -> Vec<Vec<f64>> {
        let mut weights = Vec::with_capacity(self.feature_orders.len());
        let mut at = 0;
        for &order in &self.feature_orders {
            let width = self.label_indices[order].len();
            weights.push(flat[at..at + width].to_vec());
            at += width;
        }
        weights
    }

    /// Drops features whose weight range (max minus min over labels) does
    /// not exceed `threshold`, returning how many were dropped. The weight
    /// table is cleared; the caller retrains.
    fn drop_features_below_threshold(&mut self, threshold: f64) -> usize {
        let mut kept = Index::new();
        let mut kept_orders = Vec::new();
        for (f, feature) in self.features.iter().enumerate() {
            let row = &self.weights[f];
            let mut smallest = f64::INFINITY;
            let mut biggest = f64::NEG_INFINITY;
            for &w in row {
                smallest = smallest.min(w);
                biggest = biggest.max(w);
            }
            if biggest - smallest > threshold {
                kept.index_of_or_add(feature);
                kept_orders.push(self.feature_orders[f]);
            }
        }
        let dropped = self.features.len() - kept.len();
        self.features = kept;
        self.feature_orders = kept_orders;
        self.weights = Vec::new();
        dropped
    }

    fn spill_feature_index(&mut self, pass: usize) -> Result<PathBuf> {
        let path = std::env::temp_dir().join(format!(
            "seqcrf-features-{}-{pass}.tmp",
            std::process::id()
        ));
        log::info!("spilling the feature index to {}", path.display());
        let mut writer = BufWriter::new(File::create(&path)?);
        bincode::encode_into_std_write(&self.features, &mut writer, bincode::config::standard())
            .map_err(|e| SeqCrfError::format(format!("cannot spill feature index: {e}")))?;
        self.features = Index::new();
        Ok(path)
    }

    fn restore_feature_index(&mut self, path: &Path) -> Result<()> {
        let mut reader = BufReader::new(File::open(path)?);
        self.features = bincode::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| SeqCrfError::format(format!("cannot restore feature index: {e}")))?;
        let _ = std::fs::remove_file(path);
        Ok(())
    }

    /// Builds the calibrated clique tree for a document.
    ///
    /// # Errors
    ///
    /// Returns a `Data` error for an empty document.
    pub fn clique_tree(&self, doc: &Document) -> Result<CliqueTree> {
        let reversed;
        let tokens: &[Token] = if self.config.use_reverse {
            reversed = doc.iter().rev().cloned().collect::<Vec<Token>>();
            &reversed
        } else {
            doc
        };
        let encoded = self.encode_document(tokens, false)?;
        CliqueTree::calibrated(
            &self.weights,
            &encoded.data,
            &self.label_indices,
            self.classes.len(),
            self.background_id(),
        )
    }

    /// Labels a document in place with the configured decoder.
    ///
    /// An empty document is returned unchanged. Under `do_gibbs` the
    /// configuration must not name an entity prior; priors are caller
    /// objects and go through [`classify_gibbs`].
    ///
    /// [`classify_gibbs`]: CrfClassifier::classify_gibbs
    ///
    /// # Errors
    ///
    /// Returns a `Config` error when a prior is configured but not
    /// supplied.
    pub fn classify(&self, doc: &mut Document) -> Result<()> {
        if doc.is_empty() {
            return Ok(());
        }
        if self.config.do_gibbs {
            if self.config.prior != PriorKind::None {
                return Err(SeqCrfError::config(
                    "a prior sequence model must be supplied through classify_gibbs",
                ));
            }
            return self.classify_gibbs(doc, None);
        }
        let tree = self.clique_tree(doc)?;
        let model = CrfSearchModel::new(&tree);
        let extended = match self.config.inference {
            InferenceKind::Viterbi => viterbi_best_sequence(&model),
            InferenceKind::Beam => beam_best_sequence(&model, self.config.beam_size),
        };
        self.write_answers(doc, &extended[model.left_window()..]);
        Ok(())
    }

    /// Labels a document in place by Gibbs sampling with annealing,
    /// optionally factoring a caller-supplied prior sequence model into the
    /// sampling distribution.
    ///
    /// The prior must be built over the document in model orientation: with
    /// `use_reverse` set, over the reversed token order.
    ///
    /// # Errors
    ///
    /// Returns a `Data` error if the prior disagrees with the document.
    pub fn classify_gibbs(
        &self,
        doc: &mut Document,
        prior: Option<&dyn SequenceModel>,
    ) -> Result<()> {
        if doc.is_empty() {
            return Ok(());
        }
        let tree = self.clique_tree(doc)?;
        let crf_model = CrfSequenceModel::new(&tree);
        let factored;
        let model: &dyn SequenceModel = match prior {
            Some(prior) => {
                factored = FactoredSequenceModel::new(&crf_model, prior)?;
                &factored
            }
            None => &crf_model,
        };

        let mut sampler = GibbsSampler::new(self.config.seed);
        let initial = if self.config.init_viterbi {
            viterbi_best_sequence(&CrfSearchModel::new(&tree))
        } else {
            sampler.random_sequence(model)
        };
        let schedule = match self.config.annealing {
            AnnealingKind::Linear => CoolingSchedule::Linear {
                iterations: self.config.num_samples,
            },
            AnnealingKind::Exponential => CoolingSchedule::Exponential {
                start: 1.0,
                rate: self.config.annealing_rate,
                iterations: self.config.num_samples,
            },
        };
        let best = sampler.find_best_using_annealing(model, &schedule, initial);
        self.write_answers(doc, &best[model.left_window()..]);
        Ok(())
    }

    /// Writes decoded class ids back into the document, un-reversing when
    /// the model ran right to left.
    fn write_answers(&self, doc: &mut Document, labels: &[usize]) {
        debug_assert_eq!(doc.len(), labels.len());
        for (j, token) in doc.iter_mut().enumerate() {
            let label = if self.config.use_reverse {
                labels[labels.len() - 1 - j]
            } else {
                labels[j]
            };
            token.answer = self.classes.get(label).cloned();
        }
    }

    /// Per-position class marginals of a document. Empty documents yield an
    /// empty list.
    ///
    /// # Errors
    ///
    /// Surfaces calibration failures.
    pub fn marginals(&self, doc: &Document) -> Result<Vec<Vec<f64>>> {
        if doc.is_empty() {
            return Ok(Vec::new());
        }
        let tree = self.clique_tree(doc)?;
        let mut marginals: Vec<Vec<f64>> =
            (0..tree.length()).map(|j| tree.probs(j)).collect();
        if self.config.use_reverse {
            marginals.reverse();
        }
        Ok(marginals)
    }

    /// Joint marginals of consecutive label pairs: entry `i` is the matrix
    /// `p(label_i = a, label_{i+1} = b)` indexed `[a][b]`.
    ///
    /// # Errors
    ///
    /// Surfaces calibration failures.
    pub fn pair_marginals(&self, doc: &Document) -> Result<Vec<Vec<Vec<f64>>>> {
        if doc.len() < 2 {
            return Ok(Vec::new());
        }
        let tree = self.clique_tree(doc)?;
        let num_classes = self.classes.len();
        let mut pairs = Vec::with_capacity(tree.length() - 1);
        for i in 1..tree.length() {
            let mut matrix = vec![vec![0.0; num_classes]; num_classes];
            for (a, row) in matrix.iter_mut().enumerate() {
                for (b, cell) in row.iter_mut().enumerate() {
                    *cell = tree.prob_labels(i, &[a, b]);
                }
            }
            pairs.push(matrix);
        }
        if self.config.use_reverse {
            pairs.reverse();
            for matrix in pairs.iter_mut() {
                transpose(matrix);
            }
        }
        Ok(pairs)
    }

    /// Log conditional likelihood of a gold-labeled document.
    ///
    /// # Errors
    ///
    /// Returns a `Data` error for missing or unknown gold answers.
    pub fn score_of(&self, doc: &Document) -> Result<f64> {
        if doc.is_empty() {
            return Ok(0.0);
        }
        let reversed;
        let tokens: &[Token] = if self.config.use_reverse {
            reversed = doc.iter().rev().cloned().collect::<Vec<Token>>();
            &reversed
        } else {
            doc
        };
        let encoded = self.encode_document(tokens, true)?;
        let tree = CliqueTree::calibrated(
            &self.weights,
            &encoded.data,
            &self.label_indices,
            self.classes.len(),
            self.background_id(),
        )?;
        Ok(tree.score_of_sequence(&encoded.labels))
    }

    /// The `k` best label sequences of a document with their scores, best
    /// first.
    ///
    /// # Errors
    ///
    /// Surfaces calibration failures.
    pub fn k_best(&self, doc: &Document, k: usize) -> Result<Vec<(Vec<String>, f64)>> {
        if doc.is_empty() {
            return Ok(Vec::new());
        }
        let tree = self.clique_tree(doc)?;
        let model = CrfSearchModel::new(&tree);
        let sequences = k_best_sequences(&model, k);
        Ok(sequences
            .into_iter()
            .map(|(extended, score)| {
                let mut labels: Vec<String> = extended[model.left_window()..]
                    .iter()
                    .map(|&id| self.classes.get(id).cloned().unwrap_or_default())
                    .collect();
                if self.config.use_reverse {
                    labels.reverse();
                }
                (labels, score)
            })
            .collect())
    }
}

fn transpose(matrix: &mut [Vec<f64>]) {
    for a in 0..matrix.len() {
        for b in 0..a {
            let tmp = matrix[a][b];
            matrix[a][b] = matrix[b][a];
            matrix[b][a] = tmp;
        }
    }
}

fn load_initial_weights(path: &Path, dimension: usize) -> Result<Vec<f64>> {
    log::info!("reading initial weights from {}", path.display());
    let mut reader = BufReader::new(File::open(path)?);
    let weights: Vec<f64> =
        bincode::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| SeqCrfError::format(format!("bad initial weights file: {e}")))?;
    if weights.len() != dimension {
        return Err(SeqCrfError::format(format!(
            "initial weights have dimension {}, expected {dimension}",
            weights.len()
        )));
    }
    Ok(weights)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::objective::Regularizer;

    /// Word-shape features of order 0; nothing at higher orders.
    pub(crate) struct ShapeFactory;

    impl FeatureFactory for ShapeFactory {
        fn clique_features(&self, tokens: &[Token], position: usize, order: usize) -> Vec<String> {
            if order != 0 {
                return Vec::new();
            }
            let capitalized = tokens[position]
                .word
                .chars()
                .next()
                .is_some_and(char::is_uppercase);
            vec![if capitalized {
                "shape=caps".to_string()
            } else {
                "shape=lower".to_string()
            }]
        }

        fn identifier(&self) -> &str {
            "shape-factory"
        }
    }

    pub(crate) fn john_runs() -> Document {
        vec![
            Token::with_answer("John", "P"),
            Token::with_answer("runs", "O"),
        ]
    }

    pub(crate) fn trained_classifier(config: CrfConfig) -> CrfClassifier<ShapeFactory> {
        let mut classifier = CrfClassifier::new(config, ShapeFactory).unwrap();
        classifier.train(&[john_runs()]).unwrap();
        classifier
    }

    #[test]
    fn test_two_class_training_and_decoding() {
        let config = CrfConfig {
            sigma: 1.0,
            regularizer: Regularizer::Quadratic,
            ..CrfConfig::default()
        };
        let classifier = trained_classifier(config);

        let mut doc = vec![Token::new("John"), Token::new("runs")];
        classifier.classify(&mut doc).unwrap();
        assert_eq!(Some("P".to_string()), doc[0].answer);
        assert_eq!(Some("O".to_string()), doc[1].answer);

        let marginals = classifier.marginals(&doc).unwrap();
        let p_id = classifier.classes.index_of(&"P".to_string()).unwrap();
        let o_id = classifier.classes.index_of(&"O".to_string()).unwrap();
        assert!(marginals[0][p_id] > 0.5);
        assert!(marginals[1][o_id] > 0.5);
    }

    #[test]
    fn test_empty_document() {
        let classifier = trained_classifier(CrfConfig::default());
        let mut doc = Vec::new();
        classifier.classify(&mut doc).unwrap();
        assert!(doc.is_empty());
        assert!(classifier.marginals(&doc).unwrap().is_empty());
        assert!(classifier.pair_marginals(&doc).unwrap().is_empty());
        assert!(classifier.k_best(&doc, 3).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_prediction_features_are_dropped() {
        /// Word-identity features, so unseen words carry only unknown
        /// features at prediction time.
        struct WordFactory;
        impl FeatureFactory for WordFactory {
            fn clique_features(
                &self,
                tokens: &[Token],
                position: usize,
                order: usize,
            ) -> Vec<String> {
                if order == 0 {
                    vec![format!("word={}", tokens[position].word)]
                } else {
                    Vec::new()
                }
            }
            fn identifier(&self) -> &str {
                "word-factory"
            }
        }

        let mut classifier = CrfClassifier::new(CrfConfig::default(), WordFactory).unwrap();
        classifier.train(&[john_runs()]).unwrap();

        // every feature of this document is unknown to the model, so the
        // prediction falls back to the featureless distribution
        let mut doc = vec![Token::new("Alice"), Token::new("walks")];
        classifier.classify(&mut doc).unwrap();
        assert_eq!(Some("O".to_string()), doc[0].answer);
        assert_eq!(Some("O".to_string()), doc[1].answer);
        let marginals = classifier.marginals(&doc).unwrap();
        for row in marginals {
            let total: f64 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_feature_pruning_to_empty() {
        let config = CrfConfig {
            num_times_prune_features: 1,
            feature_diff_thresh: 1e6,
            ..CrfConfig::default()
        };
        let classifier = trained_classifier(config);
        assert!(classifier.features.is_empty());
        assert!(classifier.weights.is_empty());

        // the featureless model still labels without panicking
        let mut doc = vec![Token::new("John")];
        classifier.classify(&mut doc).unwrap();
        assert_eq!(Some("O".to_string()), doc[0].answer);
    }

    #[test]
    fn test_pruning_keeps_wide_range_features() {
        let config = CrfConfig {
            num_times_prune_features: 1,
            feature_diff_thresh: 0.0,
            ..CrfConfig::default()
        };
        let classifier = trained_classifier(config);
        // both shape features separate the classes, so both survive
        assert_eq!(2, classifier.features.len());
        let mut doc = vec![Token::new("John"), Token::new("runs")];
        classifier.classify(&mut doc).unwrap();
        assert_eq!(Some("P".to_string()), doc[0].answer);
    }

    #[test]
    fn test_gibbs_decoding_matches_viterbi_here() {
        let config = CrfConfig {
            do_gibbs: true,
            num_samples: 30,
            ..CrfConfig::default()
        };
        let classifier = trained_classifier(config);
        let mut doc = vec![Token::new("John"), Token::new("runs")];
        classifier.classify(&mut doc).unwrap();
        assert_eq!(Some("P".to_string()), doc[0].answer);
        assert_eq!(Some("O".to_string()), doc[1].answer);
    }

    #[test]
    fn test_beam_inference_matches_viterbi_here() {
        let config = CrfConfig {
            inference: InferenceKind::Beam,
            beam_size: 4,
            ..CrfConfig::default()
        };
        let classifier = trained_classifier(config);
        let mut doc = vec![Token::new("John"), Token::new("runs")];
        classifier.classify(&mut doc).unwrap();
        assert_eq!(Some("P".to_string()), doc[0].answer);
        assert_eq!(Some("O".to_string()), doc[1].answer);
    }

    #[test]
    fn test_use_reverse_round_trips_labels() {
        let config = CrfConfig {
            use_reverse: true,
            ..CrfConfig::default()
        };
        let classifier = trained_classifier(config);
        let mut doc = vec![Token::new("John"), Token::new("runs")];
        classifier.classify(&mut doc).unwrap();
        assert_eq!(Some("P".to_string()), doc[0].answer);
        assert_eq!(Some("O".to_string()), doc[1].answer);

        let marginals = classifier.marginals(&doc).unwrap();
        let p_id = classifier.classes.index_of(&"P".to_string()).unwrap();
        assert!(marginals[0][p_id] > 0.5);
    }

    #[test]
    fn test_k_best_agrees_with_classify() {
        let classifier = trained_classifier(CrfConfig::default());
        let mut doc = vec![Token::new("John"), Token::new("runs")];
        classifier.classify(&mut doc).unwrap();
        let k_best = classifier.k_best(&doc, 4).unwrap();
        assert_eq!(4, k_best.len());
        assert_eq!(
            vec!["P".to_string(), "O".to_string()],
            k_best[0].0
        );
        for pair in k_best.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn test_score_of_prefers_gold() {
        let classifier = trained_classifier(CrfConfig::default());
        let gold = john_runs();
        let wrong = vec![
            Token::with_answer("John", "O"),
            Token::with_answer("runs", "P"),
        ];
        assert!(classifier.score_of(&gold).unwrap() > classifier.score_of(&wrong).unwrap());
    }

    #[test]
    fn test_observed_sequences_only_trains_and_decodes() {
        let config = CrfConfig {
            use_observed_sequences_only: true,
            ..CrfConfig::default()
        };
        let classifier = trained_classifier(config);
        // observed windows: (O,P) at position 0 and (P,O) at position 1,
        // plus their suffixes
        assert_eq!(2, classifier.label_indices[1].len());
        assert_eq!(2, classifier.label_indices[0].len());

        let mut doc = vec![Token::new("John"), Token::new("runs")];
        classifier.classify(&mut doc).unwrap();
        assert_eq!(Some("P".to_string()), doc[0].answer);
        assert_eq!(Some("O".to_string()), doc[1].answer);
    }

    #[test]
    fn test_sgd_training_decodes_correctly() {
        let config = CrfConfig {
            optimizer: OptimizerKind::Sgd,
            sgd_passes: 300,
            stochastic_batch_size: 1,
            initial_gain: 0.5,
            ..CrfConfig::default()
        };
        let classifier = trained_classifier(config);
        let mut doc = vec![Token::new("John"), Token::new("runs")];
        classifier.classify(&mut doc).unwrap();
        assert_eq!(Some("P".to_string()), doc[0].answer);
        assert_eq!(Some("O".to_string()), doc[1].answer);
    }

    #[test]
    fn test_sgd_to_qn_training_decodes_correctly() {
        let config = CrfConfig {
            optimizer: OptimizerKind::SgdToQn,
            sgd_passes: 20,
            qn_passes: 100,
            stochastic_batch_size: 1,
            ..CrfConfig::default()
        };
        let classifier = trained_classifier(config);
        let mut doc = vec![Token::new("John"), Token::new("runs")];
        classifier.classify(&mut doc).unwrap();
        assert_eq!(Some("P".to_string()), doc[0].answer);
        assert_eq!(Some("O".to_string()), doc[1].answer);
    }

    #[test]
    fn test_gibbs_with_configured_prior_but_no_model_is_a_config_error() {
        let config = CrfConfig {
            do_gibbs: true,
            prior: PriorKind::Ner,
            ..CrfConfig::default()
        };
        let classifier = trained_classifier(config);
        let mut doc = vec![Token::new("John")];
        assert!(matches!(
            classifier.classify(&mut doc),
            Err(SeqCrfError::Config(_))
        ));
    }

    #[test]
    fn test_pair_marginals_rows_sum_to_position_marginals() {
        let classifier = trained_classifier(CrfConfig::default());
        let doc = vec![Token::new("John"), Token::new("runs")];
        let singles = classifier.marginals(&doc).unwrap();
        let pairs = classifier.pair_marginals(&doc).unwrap();
        assert_eq!(1, pairs.len());
        for b in 0..classifier.classes.len() {
            let total: f64 = (0..classifier.classes.len()).map(|a| pairs[0][a][b]).sum();
            assert!((total - singles[1][b]).abs() < 1e-9);
        }
    }
}
