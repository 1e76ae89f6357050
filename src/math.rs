use rand::Rng;

#[inline(always)]
pub fn logsumexp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY && b == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if a > b {
        a + (b - a).exp().ln_1p()
    } else {
        b + (a - b).exp().ln_1p()
    }
}

/// Log-sum-exp over a slice with max shifting.
pub fn logsumexp_slice(xs: &[f64]) -> f64 {
    let max = xs.iter().fold(f64::NEG_INFINITY, |m, &x| m.max(x));
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let mut sum = 0.0;
    for &x in xs {
        sum += (x - max).exp();
    }
    max + sum.ln()
}

/// Shifts the slice so that `exp` of its entries sums to one.
pub fn log_normalize(xs: &mut [f64]) {
    let z = logsumexp_slice(xs);
    if z == f64::NEG_INFINITY {
        return;
    }
    for x in xs.iter_mut() {
        *x -= z;
    }
}

pub fn exp_in_place(xs: &mut [f64]) {
    for x in xs.iter_mut() {
        *x = x.exp();
    }
}

/// Index of the largest entry; the smallest index wins ties.
pub fn argmax(xs: &[f64]) -> usize {
    let mut best = 0;
    for (i, &x) in xs.iter().enumerate().skip(1) {
        if x > xs[best] {
            best = i;
        }
    }
    best
}

/// Draws an index from a normalized probability distribution.
pub fn sample_from_distribution<R: Rng>(probs: &[f64], rng: &mut R) -> usize {
    let r: f64 = rng.gen();
    let mut acc = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        acc += p;
        if r < acc {
            return i;
        }
    }
    probs.len() - 1
}
