use std::marker::PhantomData;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Vec wrapper that uses typed indexes.
///
/// Serializes as a plain sequence, so persisted collections stay readable
/// without any knowledge of the id types.
#[derive(Debug, Hash, PartialEq, Eq, Clone)]
pub struct IdVec<K, V> {
    vec: Vec<V>,
    _phantom: PhantomData<K>,
}

impl<K, V> Default for IdVec<K, V> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<K, V> IdVec<K, V> {
    /// Create a new `IdVec` backed by the given vec.
    fn new(vec: Vec<V>) -> Self {
        Self {
            vec,
            _phantom: PhantomData,
        }
    }

    /// Create a new `IdVec` with the given capacity.
    pub fn with_capacity(cap: usize) -> Self {
        Self::new(Vec::with_capacity(cap))
    }

    /// Get the current length
    #[inline]
    pub fn len(&self) -> usize {
        self.vec.len()
    }

    /// True if len == 0
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }

    /// Iterate through immutable references to values
    pub fn iter(&self) -> std::slice::Iter<'_, V> {
        self.vec.iter()
    }

    /// Iterate through mutable references to values
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, V> {
        self.vec.iter_mut()
    }

    /// View the values as a plain slice.
    pub fn as_slice(&self) -> &[V] {
        &self.vec
    }

    /// Drop every value at or after position `len`.
    pub fn truncate(&mut self, len: usize) {
        self.vec.truncate(len);
    }
}

impl<K: From<usize>, V> IdVec<K, V> {
    /// Push `v` into the underlying vec, and return an id that can be used to retrieve it later.
    #[inline]
    pub fn push(&mut self, v: V) -> K {
        let id = self.vec.len().into();
        self.vec.push(v);
        id
    }

    /// The id the next call to `push` will return.
    #[inline]
    pub fn next_id(&self) -> K {
        self.vec.len().into()
    }

    /// Iterate through (id, value) pairs.
    pub fn enumerate(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.vec.iter().enumerate().map(|(i, v)| (i.into(), v))
    }
}

impl<K: Into<usize>, V> IdVec<K, V> {
    /// Get the value with id `k`.
    #[inline]
    pub fn get(&self, k: K) -> &V {
        &self.vec[k.into()]
    }

    /// Get a mutable reference to value with id `k`.
    #[inline]
    pub fn get_mut(&mut self, k: K) -> &mut V {
        &mut self.vec[k.into()]
    }

    /// Get the value with id `k`, or `None` if `k` is out of range.
    #[inline]
    pub fn try_get(&self, k: K) -> Option<&V> {
        self.vec.get(k.into())
    }

    /// Get a mutable reference to the value with id `k`, or `None` if `k` is out of range.
    #[inline]
    pub fn try_get_mut(&mut self, k: K) -> Option<&mut V> {
        self.vec.get_mut(k.into())
    }
}

impl<K, V> From<Vec<V>> for IdVec<K, V> {
    fn from(vec: Vec<V>) -> Self {
        Self::new(vec)
    }
}

impl<K, V> From<IdVec<K, V>> for Vec<V> {
    fn from(ids: IdVec<K, V>) -> Self {
        ids.vec
    }
}

impl<'a, K, V> IntoIterator for &'a IdVec<K, V> {
    type Item = &'a V;
    type IntoIter = std::slice::Iter<'a, V>;
    fn into_iter(self) -> Self::IntoIter {
        self.vec.iter()
    }
}

impl<K, V: Serialize> Serialize for IdVec<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.vec.serialize(serializer)
    }
}

impl<'de, K, V: Deserialize<'de>> Deserialize<'de> for IdVec<K, V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::deserialize(deserializer).map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Id(u32);

    impl From<usize> for Id {
        fn from(v: usize) -> Self {
            Self(v as u32)
        }
    }

    impl From<Id> for usize {
        fn from(id: Id) -> usize {
            id.0 as usize
        }
    }

    #[test]
    fn push_returns_sequential_ids() {
        let mut v: IdVec<Id, &str> = IdVec::with_capacity(2);
        assert_eq!(v.next_id(), Id(0));
        assert_eq!(v.push("a"), Id(0));
        assert_eq!(v.push("b"), Id(1));
        assert_eq!(*v.get(Id(1)), "b");
        assert!(v.try_get(Id(2)).is_none());
        let pairs: Vec<_> = v.enumerate().collect();
        assert_eq!(pairs, vec![(Id(0), &"a"), (Id(1), &"b")]);
    }

    #[test]
    fn truncate_forgets_tail() {
        let mut v: IdVec<Id, u8> = vec![1, 2, 3].into();
        v.truncate(1);
        assert_eq!(v.as_slice(), &[1]);
        assert_eq!(v.next_id(), Id(1));
    }
}
