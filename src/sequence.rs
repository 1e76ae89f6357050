use crate::clique_tree::CliqueTree;
use crate::errors::{Result, SeqCrfError};

/// A scoring interface over label sequences, spoken in extended positions:
/// every sequence carries `left_window()` padding slots before the first
/// token, pinned to the background label through [`possible_values`].
///
/// [`possible_values`]: SequenceModel::possible_values
pub trait SequenceModel {
    /// Number of token positions (padding excluded).
    fn length(&self) -> usize;

    /// Number of padding slots before the first token.
    fn left_window(&self) -> usize;

    /// Number of padding slots after the last token.
    fn right_window(&self) -> usize {
        0
    }

    /// Total number of extended positions.
    fn padded_length(&self) -> usize {
        self.length() + self.left_window() + self.right_window()
    }

    /// Class ids allowed at an extended position. Padding positions allow
    /// only the background label.
    fn possible_values(&self, position: usize) -> Vec<usize>;

    /// Unnormalized log score of each class at `position`, given the labels
    /// at the other positions of `sequence`.
    fn scores_of(&self, sequence: &[usize], position: usize) -> Vec<f64>;

    /// Unnormalized log score of the label `sequence` places at `position`.
    fn score_of(&self, sequence: &[usize], position: usize) -> f64 {
        self.scores_of(sequence, position)[sequence[position]]
    }

    /// Total log score of an extended sequence.
    fn score_of_sequence(&self, sequence: &[usize]) -> f64;
}

/// The clique tree exposed as a sequence model for Gibbs sampling: scores
/// are the pointwise sum of "this label given the previous window" and "the
/// next window given this label", which is the full conditional over the
/// label at a position given the rest of the sequence.
pub struct CrfSequenceModel<'a> {
    tree: &'a CliqueTree,
}

impl<'a> CrfSequenceModel<'a> {
    /// Wraps a calibrated clique tree.
    #[must_use]
    pub fn new(tree: &'a CliqueTree) -> Self {
        Self { tree }
    }
}

impl SequenceModel for CrfSequenceModel<'_> {
    fn length(&self) -> usize {
        self.tree.length()
    }

    fn left_window(&self) -> usize {
        self.tree.window() - 1
    }

    fn possible_values(&self, position: usize) -> Vec<usize> {
        if position < self.left_window() {
            vec![self.tree.background()]
        } else {
            (0..self.tree.num_classes()).collect()
        }
    }

    fn scores_of(&self, sequence: &[usize], position: usize) -> Vec<f64> {
        if position < self.left_window() {
            return vec![0.0; self.tree.num_classes()];
        }
        self.tree
            .scores_of(&sequence[self.left_window()..], position - self.left_window())
    }

    fn score_of_sequence(&self, sequence: &[usize]) -> f64 {
        self.tree.score_of_sequence(&sequence[self.left_window()..])
    }
}

/// The clique tree exposed as a sequence model for left-to-right search:
/// the score of a label depends only on the previous window, so summing
/// per-position scores along a sequence gives its log conditional
/// likelihood and dynamic programming over window states is exact.
pub struct CrfSearchModel<'a> {
    tree: &'a CliqueTree,
}

impl<'a> CrfSearchModel<'a> {
    /// Wraps a calibrated clique tree.
    #[must_use]
    pub fn new(tree: &'a CliqueTree) -> Self {
        Self { tree }
    }
}

impl SequenceModel for CrfSearchModel<'_> {
    fn length(&self) -> usize {
        self.tree.length()
    }

    fn left_window(&self) -> usize {
        self.tree.window() - 1
    }

    fn possible_values(&self, position: usize) -> Vec<usize> {
        if position < self.left_window() {
            vec![self.tree.background()]
        } else {
            (0..self.tree.num_classes()).collect()
        }
    }

    fn scores_of(&self, sequence: &[usize], position: usize) -> Vec<f64> {
        if position < self.left_window() {
            return vec![0.0; self.tree.num_classes()];
        }
        let previous = &sequence[position - self.left_window()..position];
        (0..self.tree.num_classes())
            .map(|label| {
                self.tree
                    .cond_log_prob_given_previous(position - self.left_window(), label, previous)
            })
            .collect()
    }

    fn score_of_sequence(&self, sequence: &[usize]) -> f64 {
        self.tree.score_of_sequence(&sequence[self.left_window()..])
    }
}

/// Sums the scores of two sequence models elementwise. Used to mix an
/// entity-structure prior into the CRF during Gibbs decoding; windows,
/// lengths, and possible values follow the first model.
pub struct FactoredSequenceModel<'a> {
    first: &'a dyn SequenceModel,
    second: &'a dyn SequenceModel,
}

impl<'a> FactoredSequenceModel<'a> {
    /// Combines two models over the same label set and sequence length.
    ///
    /// # Errors
    ///
    /// Returns a `Data` error if the models disagree on length or on the
    /// number of classes.
    pub fn new(first: &'a dyn SequenceModel, second: &'a dyn SequenceModel) -> Result<Self> {
        if first.length() != second.length() {
            return Err(SeqCrfError::data(
                "factored sequence models must have the same sequence length",
            ));
        }
        let pos = first.left_window();
        if first.possible_values(pos).len() != second.possible_values(second.left_window()).len() {
            return Err(SeqCrfError::data(
                "factored sequence models must have the same number of classes",
            ));
        }
        Ok(Self { first, second })
    }
}

impl SequenceModel for FactoredSequenceModel<'_> {
    fn length(&self) -> usize {
        self.first.length()
    }

    fn left_window(&self) -> usize {
        self.first.left_window()
    }

    fn possible_values(&self, position: usize) -> Vec<usize> {
        self.first.possible_values(position)
    }

    fn scores_of(&self, sequence: &[usize], position: usize) -> Vec<f64> {
        let mut scores = self.first.scores_of(sequence, position);
        for (s, t) in scores
            .iter_mut()
            .zip(self.second.scores_of(sequence, position))
        {
            *s += t;
        }
        scores
    }

    fn score_of_sequence(&self, sequence: &[usize]) -> f64 {
        self.first.score_of_sequence(sequence) + self.second.score_of_sequence(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clique_tree::CliqueTree;
    use crate::test_utils;

    fn fixture_tree() -> CliqueTree {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap()
    }

    #[test]
    fn test_padding_is_pinned_to_background() {
        let tree = fixture_tree();
        let model = CrfSequenceModel::new(&tree);
        assert_eq!(1, model.left_window());
        assert_eq!(4, model.padded_length());
        assert_eq!(vec![0], model.possible_values(0));
        assert_eq!(vec![0, 1], model.possible_values(1));
    }

    #[test]
    fn test_search_scores_sum_to_sequence_score() {
        let tree = fixture_tree();
        let model = CrfSearchModel::new(&tree);
        let sequence = vec![0, 1, 0, 1];
        let mut total = 0.0;
        for pos in model.left_window()..model.padded_length() {
            total += model.score_of(&sequence, pos);
        }
        assert!((total - model.score_of_sequence(&sequence)).abs() < 1e-9);
    }

    #[test]
    fn test_full_conditional_is_normalized_after_exp() {
        let tree = fixture_tree();
        let model = CrfSequenceModel::new(&tree);
        let sequence = vec![0, 1, 1, 0];
        for pos in model.left_window()..model.padded_length() {
            let mut scores = model.scores_of(&sequence, pos);
            crate::math::log_normalize(&mut scores);
            let total: f64 = scores.iter().map(|s| s.exp()).sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_factored_model_sums_scores() {
        let tree = fixture_tree();
        let a = CrfSequenceModel::new(&tree);
        let b = CrfSequenceModel::new(&tree);
        let factored = FactoredSequenceModel::new(&a, &b).unwrap();
        let sequence = vec![0, 1, 0, 1];
        for pos in 1..4 {
            let single = a.scores_of(&sequence, pos);
            let double = factored.scores_of(&sequence, pos);
            for (s, d) in single.iter().zip(&double) {
                assert!((2.0 * s - d).abs() < 1e-12);
            }
        }
        assert!(
            (2.0 * a.score_of_sequence(&sequence) - factored.score_of_sequence(&sequence)).abs()
                < 1e-12
        );
    }

    #[test]
    fn test_factored_model_rejects_length_mismatch() {
        let tree = fixture_tree();
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let short = CliqueTree::calibrated(&weights, &data[..2], &label_indices, 2, 0).unwrap();
        let a = CrfSequenceModel::new(&tree);
        let b = CrfSequenceModel::new(&short);
        assert!(FactoredSequenceModel::new(&a, &b).is_err());
    }
}
