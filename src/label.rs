use bincode::{Decode, Encode};

use crate::index::Index;

/// An immutable ordered tuple of class ids, at most the window wide.
///
/// The last element is the label at the clique's own position; earlier
/// elements are the labels to its left.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Decode, Encode)]
pub struct LabelTuple {
    labels: Vec<u32>,
}

impl LabelTuple {
    /// Creates a tuple from class ids.
    #[inline(always)]
    #[must_use]
    pub fn new(labels: &[usize]) -> Self {
        Self {
            labels: labels.iter().map(|&l| u32::try_from(l).unwrap()).collect(),
        }
    }

    /// Returns the tuple length.
    #[inline(always)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Returns `true` if the tuple is empty.
    #[inline(always)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Returns the class ids.
    #[inline(always)]
    #[must_use]
    pub fn labels(&self) -> Vec<usize> {
        self.labels.iter().map(|&l| l as usize).collect()
    }

    /// Returns the class id at `i`.
    #[inline(always)]
    #[must_use]
    pub fn label(&self, i: usize) -> usize {
        self.labels[i] as usize
    }

    /// Keeps the last `k` elements.
    #[must_use]
    pub fn suffix(&self, k: usize) -> Self {
        assert!(k <= self.labels.len());
        Self {
            labels: self.labels[self.labels.len() - k..].to_vec(),
        }
    }

    /// Drops the first element.
    #[must_use]
    pub fn one_smaller(&self) -> Self {
        self.suffix(self.labels.len() - 1)
    }

    /// Returns `true` if one tuple is a suffix of the other.
    #[must_use]
    pub fn extends(&self, other: &Self) -> bool {
        let (short, long) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        long.labels[long.len() - short.len()..] == short.labels[..]
    }

    /// Packs the tuple into its row-major integer id under `num_classes`,
    /// leftmost element most significant.
    #[must_use]
    pub fn packed(&self, num_classes: usize) -> usize {
        let mut id = 0;
        for &l in &self.labels {
            id = id * num_classes + l as usize;
        }
        id
    }

    /// Unpacks a row-major integer id into a tuple of the given length.
    #[must_use]
    pub fn unpack(mut id: usize, len: usize, num_classes: usize) -> Self {
        let mut labels = vec![0u32; len];
        for slot in labels.iter_mut().rev() {
            *slot = u32::try_from(id % num_classes).unwrap();
            id /= num_classes;
        }
        Self { labels }
    }
}

/// Enumerates every tuple of the given order over `num_classes` classes, in
/// counting order of the packed id.
#[must_use]
pub fn all_labels(order: usize, num_classes: usize) -> Index<LabelTuple> {
    let mut index = Index::new();
    let count = num_classes.pow(u32::try_from(order).unwrap());
    for id in 0..count {
        index.index_of_or_add(&LabelTuple::unpack(id, order, num_classes));
    }
    index
}
