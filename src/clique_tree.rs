use crate::errors::{Result, SeqCrfError};
use crate::factor::FactorTable;
use crate::index::Index;
use crate::label::LabelTuple;
use crate::math;

/// A chain of calibrated factor tables, one per token position, built by
/// forward-backward message passing.
///
/// After calibration every table carries the same total log-mass, the log
/// partition function, and the unnormalized log-probability of any label
/// window ending at position `j` can be read from `factor_tables[j]`.
#[derive(Debug)]
pub struct CliqueTree {
    factor_tables: Vec<FactorTable>,
    z: f64,
    window: usize,
    num_classes: usize,
    background: usize,
}

impl CliqueTree {
    /// Builds and calibrates the clique tree for one encoded document.
    ///
    /// `weights[f][k]` is the weight of feature `f` for the label tuple with
    /// id `k` in the label index of the feature's order. `data[j][o]` lists
    /// the features active at position `j` for clique order `o`.
    ///
    /// # Errors
    ///
    /// Returns a `Data` error for an empty document and a `Numeric` error if
    /// calibration produces NaN anywhere.
    pub fn calibrated(
        weights: &[Vec<f64>],
        data: &[Vec<Vec<u32>>],
        label_indices: &[Index<LabelTuple>],
        num_classes: usize,
        background: usize,
    ) -> Result<Self> {
        if data.is_empty() {
            return Err(SeqCrfError::data("cannot calibrate an empty document"));
        }
        if label_indices.is_empty() {
            return Err(SeqCrfError::data(
                "label tuple indices must cover at least order one",
            ));
        }
        let window = label_indices.len();

        let mut factor_tables: Vec<FactorTable> = data
            .iter()
            .map(|position| Self::position_factor(weights, position, label_indices, num_classes))
            .collect();

        // pin the virtual positions before the sequence start to the
        // background label, so every quantity read from the chain is
        // conditioned on the same left padding
        for (j, table) in factor_tables.iter_mut().enumerate().take(window - 1) {
            let pad = vec![background; window - 1 - j];
            table.condition_on_front(&pad);
        }

        let mut messages = Vec::with_capacity(data.len().saturating_sub(1));
        for j in 1..factor_tables.len() {
            let message = factor_tables[j - 1].sum_out_front();
            factor_tables[j].multiply_in_front(&message);
            messages.push(message);
        }

        for j in (0..factor_tables.len().saturating_sub(1)).rev() {
            let mut summed_out = factor_tables[j + 1].sum_out_end();
            summed_out.divide_by(&messages[j]);
            factor_tables[j].multiply_in_end(&summed_out);
        }

        for (j, table) in factor_tables.iter().enumerate() {
            if table.contains_nan() {
                return Err(SeqCrfError::numeric(format!(
                    "NaN in calibrated factor table at position {j}"
                )));
            }
        }

        let z = factor_tables[0].total_mass();
        Ok(Self {
            factor_tables,
            z,
            window,
            num_classes,
            background,
        })
    }

    /// Assembles the raw factor for one position: each clique order is
    /// filled from its features and embedded into the next wider table.
    fn position_factor(
        weights: &[Vec<f64>],
        position: &[Vec<u32>],
        label_indices: &[Index<LabelTuple>],
        num_classes: usize,
    ) -> FactorTable {
        let mut factor: Option<FactorTable> = None;
        for (order, features) in position.iter().enumerate() {
            let label_index = &label_indices[order];
            let mut table = FactorTable::new(num_classes, order + 1);
            for (k, tuple) in label_index.iter().enumerate() {
                let mut weight = 0.0;
                for &f in features {
                    weight += weights[f as usize][k];
                }
                table.set(&tuple.labels(), weight);
            }
            if let Some(smaller) = factor {
                table.multiply_in_end(&smaller);
            }
            factor = Some(table);
        }
        factor.expect("window must be at least one")
    }

    /// Number of token positions.
    #[inline(always)]
    #[must_use]
    pub fn length(&self) -> usize {
        self.factor_tables.len()
    }

    /// The clique width.
    #[inline(always)]
    #[must_use]
    pub const fn window(&self) -> usize {
        self.window
    }

    /// Number of classes per position.
    #[inline(always)]
    #[must_use]
    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Id of the background class used for left padding.
    #[inline(always)]
    #[must_use]
    pub const fn background(&self) -> usize {
        self.background
    }

    /// The log partition function.
    #[inline(always)]
    #[must_use]
    pub const fn total_mass(&self) -> f64 {
        self.z
    }

    #[cfg(test)]
    pub(crate) fn factor_table(&self, position: usize) -> &FactorTable {
        &self.factor_tables[position]
    }

    /// Normalized log marginal of `label` at `position`.
    #[must_use]
    pub fn log_prob(&self, position: usize, label: usize) -> f64 {
        self.factor_tables[position].unnormalized_log_prob_end(&[label]) - self.z
    }

    /// Normalized marginal of `label` at `position`.
    #[must_use]
    pub fn prob(&self, position: usize, label: usize) -> f64 {
        self.log_prob(position, label).exp()
    }

    /// Normalized marginals over all classes at `position`.
    #[must_use]
    pub fn probs(&self, position: usize) -> Vec<f64> {
        (0..self.num_classes)
            .map(|y| self.prob(position, y))
            .collect()
    }

    /// Normalized log marginal of a label window whose last element sits at
    /// `position`. Windows wider than the clique size are chained through
    /// conditionals.
    #[must_use]
    pub fn log_prob_labels(&self, position: usize, labels: &[usize]) -> f64 {
        if labels.len() < self.window {
            self.factor_tables[position].unnormalized_log_prob_end(labels) - self.z
        } else if labels.len() == self.window {
            self.factor_tables[position].unnormalized_log_prob(labels) - self.z
        } else {
            let mut first_position = position + self.window - labels.len();
            let mut p =
                self.factor_tables[first_position].unnormalized_log_prob(&labels[..self.window])
                    - self.z;
            let mut context = labels[1..self.window].to_vec();
            first_position += 1;
            for (i, &label) in labels.iter().enumerate().skip(self.window) {
                p += self
                    .cond_log_prob_given_previous(first_position + i - self.window, label, &context);
                if !context.is_empty() {
                    context.rotate_left(1);
                    let last = context.len() - 1;
                    context[last] = label;
                }
            }
            p
        }
    }

    /// Normalized marginal of a label window ending at `position`.
    #[must_use]
    pub fn prob_labels(&self, position: usize, labels: &[usize]) -> f64 {
        self.log_prob_labels(position, labels).exp()
    }

    /// Normalized log probability of `label` at `position` given the labels
    /// immediately before it. A context shorter than the clique width is
    /// handled by marginalizing the front of the table; a longer one is
    /// truncated to its last `window - 1` elements.
    #[must_use]
    pub fn cond_log_prob_given_previous(
        &self,
        position: usize,
        label: usize,
        prev_labels: &[usize],
    ) -> f64 {
        if prev_labels.len() + 1 == self.window {
            self.factor_tables[position].conditional_log_prob_given_previous(prev_labels, label)
        } else if prev_labels.len() + 1 < self.window {
            let mut table = self.factor_tables[position].sum_out_front();
            while table.window_size() > prev_labels.len() + 1 {
                table = table.sum_out_front();
            }
            table.conditional_log_prob_given_previous(prev_labels, label)
        } else {
            let start = prev_labels.len() + 1 - self.window;
            self.factor_tables[position]
                .conditional_log_prob_given_previous(&prev_labels[start..], label)
        }
    }

    /// Normalized log probability of `label` at `position` given the labels
    /// immediately after it. Contexts longer than the clique width are
    /// truncated to their first `window - 1` elements.
    #[must_use]
    pub fn cond_log_prob_given_next(
        &self,
        position: usize,
        label: usize,
        next_labels: &[usize],
    ) -> f64 {
        let take = next_labels.len().min(self.window - 1);
        let next = &next_labels[..take];
        let position = position + take;
        if take + 1 == self.window {
            self.factor_tables[position].conditional_log_prob_given_next(next, label)
        } else {
            let mut table = self.factor_tables[position].sum_out_front();
            while table.window_size() > take + 1 {
                table = table.sum_out_front();
            }
            table.conditional_log_prob_given_next(next, label)
        }
    }

    /// Log conditional likelihood of a full label sequence: the sum of
    /// per-position conditionals given the previous window, left-padded with
    /// the background label.
    #[must_use]
    pub fn score_of_sequence(&self, sequence: &[usize]) -> f64 {
        debug_assert_eq!(sequence.len(), self.length());
        let mut given = vec![self.background; self.window - 1];
        let mut log_prob = 0.0;
        for (i, &label) in sequence.iter().enumerate() {
            log_prob += self.cond_log_prob_given_previous(i, label, &given);
            if !given.is_empty() {
                given.rotate_left(1);
                let last = given.len() - 1;
                given[last] = label;
            }
        }
        log_prob
    }

    /// Unnormalized log conditional distribution over the label at
    /// `position`, given the values at every other position of `sequence`:
    /// the pointwise sum of "this given the previous window" and "the next
    /// window given this".
    #[must_use]
    pub fn scores_of(&self, sequence: &[usize], position: usize) -> Vec<f64> {
        assert!(position < self.length());
        let prev_length = self.window - 1;

        let mut prev = vec![self.background; prev_length + 1];
        for i in prev_length.saturating_sub(position)..prev_length {
            prev[i] = sequence[position + i - prev_length];
        }
        let mut this_given_prev = Vec::with_capacity(self.num_classes);
        for label in 0..self.num_classes {
            prev[prev_length] = label;
            this_given_prev.push(self.factor_tables[position].unnormalized_log_prob(&prev));
        }

        let next_length = prev_length.min(self.length() - position - 1);
        if next_length == 0 {
            return this_given_prev;
        }
        let next = &sequence[position + 1..position + 1 + next_length];
        let next_table = &self.factor_tables[position + next_length];
        let narrowed;
        let next_table = if next_length + 1 < self.window {
            let mut table = next_table.sum_out_front();
            while table.window_size() > next_length + 1 {
                table = table.sum_out_front();
            }
            narrowed = table;
            &narrowed
        } else {
            next_table
        };
        for (label, score) in this_given_prev.iter_mut().enumerate() {
            *score += next_table.unnormalized_conditional_log_prob_given_first(label, next);
        }
        this_given_prev
    }

    /// Normalized conditional distribution over the label at `position`
    /// given the rest of `sequence`.
    #[must_use]
    pub fn conditional_distribution(&self, sequence: &[usize], position: usize) -> Vec<f64> {
        let mut scores = self.scores_of(sequence, position);
        math::log_normalize(&mut scores);
        math::exp_in_place(&mut scores);
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    const TOL: f64 = 1e-9;

    #[test]
    fn test_log_z_closed_form_at_window_one() {
        // Two tokens, one feature per position, window 1:
        //   θ[f_caps] = [0, 2]  (O, P)
        //   θ[f_lower] = [3, 0]
        let weights = vec![vec![0.0, 2.0], vec![3.0, 0.0]];
        let label_indices = vec![crate::label::all_labels(1, 2)];
        let data = vec![vec![vec![0u32]], vec![vec![1u32]]];
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();

        let expected = (2f64.exp() + 0f64.exp()).ln() + (0f64.exp() + 3f64.exp()).ln();
        assert!((expected - tree.total_mass()).abs() < TOL);
    }

    #[test]
    fn test_all_tables_share_total_mass() {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();
        for j in 0..tree.length() {
            assert!((tree.factor_table(j).total_mass() - tree.total_mass()).abs() < TOL);
        }
    }

    #[test]
    fn test_position_marginals_sum_to_one() {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();
        for j in 0..tree.length() {
            let total: f64 = tree.probs(j).iter().sum();
            assert!((total - 1.0).abs() < TOL);
        }
    }

    #[test]
    fn test_marginals_match_brute_force() {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();
        let joint = test_utils::brute_force_joint(&weights, &data, 2, 0);

        for j in 0..tree.length() {
            for y in 0..2 {
                let mut mass = 0.0;
                for (labels, p) in &joint {
                    if labels[j] == y {
                        mass += p;
                    }
                }
                assert!((mass - tree.prob(j, y)).abs() < TOL);
            }
        }
    }

    #[test]
    fn test_pair_marginals_match_brute_force() {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();
        let joint = test_utils::brute_force_joint(&weights, &data, 2, 0);

        for j in 1..tree.length() {
            for a in 0..2 {
                for b in 0..2 {
                    let mut mass = 0.0;
                    for (labels, p) in &joint {
                        if labels[j - 1] == a && labels[j] == b {
                            mass += p;
                        }
                    }
                    assert!((mass - tree.prob_labels(j, &[a, b])).abs() < TOL);
                }
            }
        }
    }

    #[test]
    fn test_chain_rule_for_windows() {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();

        // p(y_1, y_2) = p(y_1) p(y_2 | y_1), read at position 2
        for a in 0..2 {
            for b in 0..2 {
                let joint = tree.log_prob_labels(2, &[a, b]);
                let chained = tree.log_prob(1, a) + tree.cond_log_prob_given_previous(2, b, &[a]);
                assert!((joint - chained).abs() < TOL);
            }
        }
    }

    #[test]
    fn test_wide_window_chains_through_conditionals() {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();
        let joint = test_utils::brute_force_joint(&weights, &data, 2, 0);

        // a window wider than the clique size: all three positions
        for a in 0..2 {
            for b in 0..2 {
                for c in 0..2 {
                    let mut mass = 0.0;
                    for (labels, p) in &joint {
                        if labels == &[a, b, c] {
                            mass += p;
                        }
                    }
                    assert!((mass - tree.prob_labels(2, &[a, b, c])).abs() < TOL);
                }
            }
        }
    }

    #[test]
    fn test_conditional_given_next_matches_brute_force() {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();
        let joint = test_utils::brute_force_joint(&weights, &data, 2, 0);

        for y in 0..2 {
            for next in 0..2 {
                let mut num = 0.0;
                let mut den = 0.0;
                for (labels, p) in &joint {
                    if labels[1] == next {
                        den += p;
                        if labels[0] == y {
                            num += p;
                        }
                    }
                }
                let expected = (num / den).ln();
                let got = tree.cond_log_prob_given_next(0, y, &[next]);
                assert!((expected - got).abs() < TOL);
            }
        }
    }

    #[test]
    fn test_score_of_sequence_is_normalized_over_sequences() {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();

        // conditioned on the background pad, scores over all sequences
        // exponentiate and sum to one
        let mut total = 0.0;
        for a in 0..2 {
            for b in 0..2 {
                for c in 0..2 {
                    total += tree.score_of_sequence(&[a, b, c]).exp();
                }
            }
        }
        assert!((total - 1.0).abs() < TOL);
    }

    #[test]
    fn test_conditional_distribution_sums_to_one() {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();
        for pos in 0..tree.length() {
            let dist = tree.conditional_distribution(&[0, 1, 0], pos);
            let total: f64 = dist.iter().sum();
            assert!((total - 1.0).abs() < TOL);
        }
    }

    #[test]
    fn test_empty_document_is_a_data_error() {
        let weights = vec![vec![0.0, 0.0]];
        let label_indices = vec![crate::label::all_labels(1, 2)];
        let result = CliqueTree::calibrated(&weights, &[], &label_indices, 2, 0);
        assert!(matches!(result, Err(SeqCrfError::Data(_))));
    }
}
