use core::hash::Hash;

use bincode::{
    de::Decoder,
    enc::Encoder,
    error::{DecodeError, EncodeError},
    Decode, Encode,
};
use hashbrown::HashMap;

/// An insertion-ordered bijection between values and dense integer ids.
///
/// Ids are assigned in insertion order, start at zero, and are stable for
/// the lifetime of the index.
#[derive(Debug, Clone, Default)]
pub struct Index<T: Eq + Hash + Clone> {
    items: Vec<T>,
    ids: HashMap<T, usize>,
}

impl<T: Eq + Hash + Clone> Index<T> {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            ids: HashMap::new(),
        }
    }

    /// Returns the number of indexed values.
    #[inline(always)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the index has no value.
    #[inline(always)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the id of `value`, or `None` if it has not been indexed.
    #[inline(always)]
    #[must_use]
    pub fn index_of(&self, value: &T) -> Option<usize> {
        self.ids.get(value).copied()
    }

    /// Returns the id of `value`, inserting it if new.
    #[inline(always)]
    pub fn index_of_or_add(&mut self, value: &T) -> usize {
        if let Some(&id) = self.ids.get(value) {
            return id;
        }
        let id = self.items.len();
        self.items.push(value.clone());
        self.ids.insert(value.clone(), id);
        id
    }

    /// Returns the value with the given id.
    #[inline(always)]
    #[must_use]
    pub fn get(&self, id: usize) -> Option<&T> {
        self.items.get(id)
    }

    /// Returns `true` if `value` has been indexed.
    #[inline(always)]
    #[must_use]
    pub fn contains(&self, value: &T) -> bool {
        self.ids.contains_key(value)
    }

    /// Iterates over values in id order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Builds an index from values in order, dropping duplicates.
    pub fn from_iter<I: IntoIterator<Item = T>>(values: I) -> Self {
        let mut index = Self::new();
        for v in values {
            index.index_of_or_add(&v);
        }
        index
    }
}

impl<T: Eq + Hash + Clone + Encode> Encode for Index<T> {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        Encode::encode(&self.items, encoder)
    }
}

impl<Context, T: Eq + Hash + Clone + Decode<Context>> Decode<Context> for Index<T> {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let items: Vec<T> = Decode::decode(decoder)?;
        Ok(Self::from_iter(items))
    }
}
