use hashbrown::HashMap;

use crate::sequence::SequenceModel;

#[derive(Clone, Copy)]
struct Entry {
    score: f64,
    /// Index of the predecessor state in the previous level.
    back: usize,
    /// Rank of the predecessor entry inside that state.
    back_rank: usize,
    tag: usize,
}

struct KState {
    context: Vec<usize>,
    entries: Vec<Entry>,
}

/// Enumerates the `k` highest-scoring extended sequences, best first, by a
/// Viterbi dynamic program that keeps `k` back-pointers per window state.
///
/// Fewer than `k` sequences are returned when the label space is smaller.
/// For `k = 1` the single result is the Viterbi sequence.
#[must_use]
pub fn k_best_sequences<M: SequenceModel + ?Sized>(model: &M, k: usize) -> Vec<(Vec<usize>, f64)> {
    assert!(k >= 1, "k must be at least one");
    let left = model.left_window();
    if model.length() == 0 {
        return Vec::new();
    }
    let pad_length = model.padded_length();
    let background = model.possible_values(0)[0];

    let start = vec![KState {
        context: vec![background; left],
        entries: vec![Entry {
            score: 0.0,
            back: usize::MAX,
            back_rank: usize::MAX,
            tag: background,
        }],
    }];

    let mut levels: Vec<Vec<KState>> = Vec::with_capacity(pad_length - left);
    let mut buffer = vec![background; pad_length];
    for pos in left..pad_length {
        let mut states: Vec<KState> = Vec::new();
        let mut by_context: HashMap<Vec<usize>, usize> = HashMap::new();
        {
            let prev_states = levels.last().unwrap_or(&start);
            for (back, prev) in prev_states.iter().enumerate() {
                buffer[pos - left..pos].copy_from_slice(&prev.context);
                let scores = model.scores_of(&buffer, pos);
                for tag in model.possible_values(pos) {
                    let mut context = prev.context.clone();
                    if left > 0 {
                        context.rotate_left(1);
                        context[left - 1] = tag;
                    }
                    let state = match by_context.get(&context) {
                        Some(&i) => &mut states[i],
                        None => {
                            by_context.insert(context.clone(), states.len());
                            states.push(KState {
                                context,
                                entries: Vec::new(),
                            });
                            states.last_mut().expect("just pushed")
                        }
                    };
                    for (back_rank, prev_entry) in prev.entries.iter().enumerate() {
                        push_entry(
                            &mut state.entries,
                            Entry {
                                score: prev_entry.score + scores[tag],
                                back,
                                back_rank,
                                tag,
                            },
                            k,
                        );
                    }
                }
            }
        }
        levels.push(states);
    }

    // gather the k best endpoints over all final states
    let last = levels.last().expect("non-empty input");
    let mut endpoints: Vec<(usize, usize, f64)> = Vec::new();
    for (state, ks) in last.iter().enumerate() {
        for (rank, entry) in ks.entries.iter().enumerate() {
            endpoints.push((state, rank, entry.score));
        }
    }
    endpoints.sort_by(|a, b| b.2.partial_cmp(&a.2).expect("scores are never NaN"));
    endpoints.truncate(k);

    endpoints
        .into_iter()
        .map(|(state, rank, score)| {
            let mut tags = Vec::with_capacity(levels.len());
            let mut state = state;
            let mut rank = rank;
            for level in levels.iter().rev() {
                let entry = level[state].entries[rank];
                tags.push(entry.tag);
                state = entry.back;
                rank = entry.back_rank;
            }
            tags.reverse();
            let mut sequence = vec![background; left];
            sequence.extend(tags);
            (sequence, score)
        })
        .collect()
}

/// Keeps `entries` sorted best-first and at most `k` long; earlier arrivals
/// survive score ties, so the smallest class ids win.
fn push_entry(entries: &mut Vec<Entry>, entry: Entry, k: usize) {
    let at = entries
        .iter()
        .position(|e| e.score < entry.score)
        .unwrap_or(entries.len());
    if at < k {
        entries.insert(at, entry);
        entries.truncate(k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clique_tree::CliqueTree;
    use crate::decode::viterbi_best_sequence;
    use crate::sequence::CrfSearchModel;
    use crate::test_utils;

    #[test]
    fn test_one_best_equals_viterbi() {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();
        let model = CrfSearchModel::new(&tree);

        let k_best = k_best_sequences(&model, 1);
        assert_eq!(1, k_best.len());
        assert_eq!(viterbi_best_sequence(&model), k_best[0].0);
    }

    #[test]
    fn test_enumerates_all_sequences_in_score_order() {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();
        let model = CrfSearchModel::new(&tree);

        let k_best = k_best_sequences(&model, 8);
        assert_eq!(8, k_best.len());

        // scores are non-increasing and match the model's own scoring
        for pair in k_best.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
        for (sequence, score) in &k_best {
            assert!((model.score_of_sequence(sequence) - score).abs() < 1e-9);
        }

        // all eight labelings of three binary positions are distinct
        let mut sequences: Vec<_> = k_best.iter().map(|(s, _)| s.clone()).collect();
        sequences.sort();
        sequences.dedup();
        assert_eq!(8, sequences.len());
    }

    #[test]
    fn test_truncates_to_available_sequences() {
        let (weights, label_indices, data) = test_utils::window_two_fixture();
        let tree = CliqueTree::calibrated(&weights, &data, &label_indices, 2, 0).unwrap();
        let model = CrfSearchModel::new(&tree);
        assert_eq!(8, k_best_sequences(&model, 50).len());
    }
}
