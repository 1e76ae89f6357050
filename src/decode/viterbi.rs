use hashbrown::HashMap;

use crate::sequence::SequenceModel;

pub(super) struct State {
    /// Labels at the last `left_window` extended positions.
    pub(super) context: Vec<usize>,
    /// Label chosen at this position.
    pub(super) tag: usize,
    pub(super) score: f64,
    pub(super) back: usize,
}

/// Exact max-product dynamic program over extended positions.
///
/// States are the assignments of the trailing window; ties are broken
/// toward the smallest class id, so the result is deterministic. Returns
/// the extended sequence (padding included); empty input yields an empty
/// sequence.
#[must_use]
pub fn viterbi_best_sequence<M: SequenceModel + ?Sized>(model: &M) -> Vec<usize> {
    let trellis = build_trellis(model, usize::MAX);
    if trellis.is_empty() {
        return Vec::new();
    }
    backtrack(&trellis, model)
}

/// Builds one trellis level per scored position, keeping the best incoming
/// path per window state. `beam_size` bounds the states kept per level;
/// `usize::MAX` keeps them all.
pub(super) fn build_trellis<M: SequenceModel + ?Sized>(
    model: &M,
    beam_size: usize,
) -> Vec<Vec<State>> {
    let left = model.left_window();
    if model.length() == 0 {
        return Vec::new();
    }
    let pad_length = model.padded_length();
    let background = model.possible_values(0)[0];

    // one virtual start state carrying the forced padding assignment
    let start = vec![State {
        context: vec![background; left],
        tag: background,
        score: 0.0,
        back: usize::MAX,
    }];

    let mut levels: Vec<Vec<State>> = Vec::with_capacity(pad_length - left);
    let mut buffer = vec![background; pad_length];
    for pos in left..pad_length {
        let mut states: Vec<State> = Vec::new();
        let mut by_context: HashMap<Vec<usize>, usize> = HashMap::new();
        {
            let prev_states = levels.last().unwrap_or(&start);
            for (back, prev) in prev_states.iter().enumerate() {
                buffer[pos - left..pos].copy_from_slice(&prev.context);
                let scores = model.scores_of(&buffer, pos);
                for tag in model.possible_values(pos) {
                    let score = prev.score + scores[tag];
                    let mut context = prev.context.clone();
                    if left > 0 {
                        context.rotate_left(1);
                        context[left - 1] = tag;
                    }
                    match by_context.get(&context) {
                        Some(&i) if states[i].score >= score => {}
                        Some(&i) => {
                            states[i] = State {
                                context,
                                tag,
                                score,
                                back,
                            };
                        }
                        None => {
                            by_context.insert(context.clone(), states.len());
                            states.push(State {
                                context,
                                tag,
                                score,
                                back,
                            });
                        }
                    }
                }
            }
        }
        if states.len() > beam_size {
            prune_level(&mut states, beam_size);
        }
        levels.push(states);
    }
    levels
}

/// Keeps the `beam_size` best states; earlier (smaller-id) states survive
/// score ties.
fn prune_level(states: &mut Vec<State>, beam_size: usize) {
    let mut order: Vec<usize> = (0..states.len()).collect();
    order.sort_by(|&a, &b| {
        states[b]
            .score
            .partial_cmp(&states[a].score)
            .expect("scores are never NaN")
            .then(a.cmp(&b))
    });
    order.truncate(beam_size);
    order.sort_unstable();
    let old = std::mem::take(states);
    let mut next = order.iter().peekable();
    for (i, state) in old.into_iter().enumerate() {
        if next.peek() == Some(&&i) {
            next.next();
            states.push(state);
        }
    }
}

pub(super) fn backtrack<M: SequenceModel + ?Sized>(trellis: &[Vec<State>], model: &M) -> Vec<usize> {
    let left = model.left_window();
    let background = model.possible_values(0)[0];
    let last = trellis.last().expect("non-empty input");
    let mut best = 0;
    for (i, state) in last.iter().enumerate().skip(1) {
        if state.score > last[best].score {
            best = i;
        }
    }
    let mut tags = Vec::with_capacity(trellis.len());
    let mut index = best;
    for states in trellis.iter().rev() {
        tags.push(states[index].tag);
        index = states[index].back;
    }
    tags.reverse();
    let mut sequence = vec![background; left];
    sequence.extend(tags);
    sequence
}
