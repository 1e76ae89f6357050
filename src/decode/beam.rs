use crate::sequence::SequenceModel;

use super::viterbi;

/// Beam search: the Viterbi dynamic program with at most `beam_size` window
/// states kept per extended position, best scores first, ties broken toward
/// the smallest class id.
///
/// With `beam_size` at least the number of reachable window states the
/// search is exact and agrees with Viterbi.
#[must_use]
pub fn beam_best_sequence<M: SequenceModel + ?Sized>(model: &M, beam_size: usize) -> Vec<usize> {
    assert!(beam_size >= 1, "beam size must be at least one");
    let trellis = viterbi::build_trellis(model, beam_size);
    if trellis.is_empty() {
        return Vec::new();
    }
    viterbi::backtrack(&trellis, model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clique_tree::CliqueTree;
    use crate::decode::viterbi_best_sequence;
    use crate::sequence::CrfSearchModel;
    use crate::test_utils;

    #[test]
    fn test_full_beam_equals_viterbi() {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();
        let model = CrfSearchModel::new(&tree);

        // C^(W-1) = 2 states cover the whole trellis
        assert_eq!(viterbi_best_sequence(&model), beam_best_sequence(&model, 2));
        assert_eq!(viterbi_best_sequence(&model), beam_best_sequence(&model, 100));
    }

    #[test]
    fn test_narrow_beam_still_returns_a_sequence() {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();
        let model = CrfSearchModel::new(&tree);

        let decoded = beam_best_sequence(&model, 1);
        assert_eq!(4, decoded.len());
        for &tag in &decoded {
            assert!(tag < 2);
        }
    }
}
