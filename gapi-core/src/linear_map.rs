use std::fmt;

/// A map backed by a vector of pairs, keeping keys in insertion order.
///
/// Lookups are linear, which beats hashing for the handful of resources a command stream touches
/// between two flush points. The insertion order makes iteration deterministic.
#[derive(Clone)]
pub(crate) struct LinearMap<K, V> {
    inner: Vec<(K, V)>,
}

impl<K, V> Default for LinearMap<K, V> {
    #[inline]
    fn default() -> Self {
        LinearMap::new()
    }
}

impl<K, V> LinearMap<K, V> {
    #[inline]
    pub(crate) const fn new() -> Self {
        LinearMap { inner: Vec::new() }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter().map(|(k, v)| (k, v))
    }

    #[inline]
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.inner.iter_mut().map(|(k, v)| (&*k, v))
    }

    /// Removes all entries but keeps the allocation, so that a recycled command stream doesn't
    /// reallocate.
    #[inline]
    pub(crate) fn clear(&mut self) {
        self.inner.clear();
    }
}

impl<K: Eq, V> LinearMap<K, V> {
    #[inline]
    pub(crate) fn get(&self, key: &K) -> Option<&V> {
        self.iter().find_map(|(k, v)| (k == key).then_some(v))
    }

    #[inline]
    pub(crate) fn get_or_insert_with(&mut self, key: K, f: impl FnOnce() -> V) -> &mut V {
        let index = match self.inner.iter().position(|(k, _)| *k == key) {
            Some(index) => index,
            None => {
                self.inner.push((key, f()));
                self.inner.len() - 1
            }
        };

        &mut self.inner[index].1
    }

    #[inline]
    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.inner.iter().any(|(k, _)| k == key)
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for LinearMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order() {
        let mut map = LinearMap::new();
        *map.get_or_insert_with(3, || 'c') = 'c';
        *map.get_or_insert_with(1, || 'a') = 'a';
        *map.get_or_insert_with(3, || 'x') = 'C';

        assert_eq!(map.len(), 2);
        assert_eq!(
            map.iter().map(|(&k, &v)| (k, v)).collect::<Vec<_>>(),
            [(3, 'C'), (1, 'a')],
        );
        assert!(map.contains_key(&1));
        assert_eq!(map.get(&2), None);

        map.clear();
        assert_eq!(map.len(), 0);
    }
}
