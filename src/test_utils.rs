use crate::index::Index;
use crate::label::{all_labels, LabelTuple};

macro_rules! logsumexp {
    ( $($x:expr,)* ) => {
        {
            let mut y = f64::NEG_INFINITY;
            $(
                y = $crate::math::logsumexp(y, $x);
            )*
            y
        }
    };
    ( $($x:expr),* ) => {
        logsumexp!($( $x, )*)
    };
}

pub(crate) use logsumexp;

/// A two-class, window-2, three-token world.
///
/// Classes: O = 0, P = 1. Features 0 and 1 parameterize single labels,
/// features 2 and 3 parameterize label pairs (columns in the counting order
/// of `all_labels`):
///
///   position 0: f0, f2
///   position 1: f1, f2
///   position 2: f1, f2, f3
pub fn window_two_fixture() -> (Vec<Vec<f64>>, Vec<Index<LabelTuple>>, Vec<Vec<Vec<u32>>>) {
    let weights = vec![
        vec![0.5, -0.3],
        vec![0.1, 0.9],
        vec![0.2, -0.1, 0.4, 0.3],
        vec![-0.2, 0.6, 0.0, -0.5],
    ];
    let label_indices = vec![all_labels(1, 2), all_labels(2, 2)];
    let data = vec![
        vec![vec![0], vec![2]],
        vec![vec![1], vec![2]],
        vec![vec![1], vec![2, 3]],
    ];
    (weights, label_indices, data)
}

/// Exhaustive reference distribution over label sequences.
///
/// The clique at each position spans the previous `window - 1` labels;
/// positions before the first token carry the background label, matching
/// the padding the calibrated chain conditions on. Feature columns are
/// addressed by the packed tuple id, so this is only valid for label
/// indices built by `all_labels`.
pub fn brute_force_joint(
    weights: &[Vec<f64>],
    data: &[Vec<Vec<u32>>],
    num_classes: usize,
    background: usize,
) -> Vec<(Vec<usize>, f64)> {
    let length = data.len();
    let window = data[0].len();
    let pad = window - 1;
    let count = num_classes.pow(u32::try_from(length).unwrap());

    let mut scores = Vec::with_capacity(count);
    for id in 0..count {
        let mut padded = vec![background; pad];
        padded.extend(LabelTuple::unpack(id, length, num_classes).labels());
        let mut score = 0.0;
        for (j, position) in data.iter().enumerate() {
            for (order, features) in position.iter().enumerate() {
                let tuple = &padded[pad + j - order..=pad + j];
                let mut k = 0;
                for &l in tuple {
                    k = k * num_classes + l;
                }
                for &f in features {
                    score += weights[f as usize][k];
                }
            }
        }
        scores.push((padded[pad..].to_vec(), score));
    }

    let z: f64 = scores.iter().map(|(_, s)| s.exp()).sum();
    scores
        .into_iter()
        .map(|(labels, score)| (labels, score.exp() / z))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logsumexp_macro() {
        let expected = (1f64.exp() + 2f64.exp() + 3f64.exp()).ln();
        let result = logsumexp!(1.0, 2.0, 3.0);
        assert!((expected - result).abs() < 1e-12);
    }

    #[test]
    fn test_brute_force_joint_normalizes() {
        let (weights, _, data) = window_two_fixture();
        let joint = brute_force_joint(&weights, &data, 2, 0);
        assert_eq!(8, joint.len());
        let total: f64 = joint.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }
}
