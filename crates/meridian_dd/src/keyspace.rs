//! Byte-string keys, half-open key ranges, and the boundary-map range
//! primitive used for the data-move map and the shard/team map.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type Key = Vec<u8>;

/// Half-open key range `[begin, end)`. Ranges are lexicographic and
/// end-exclusive.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    pub fn new(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.begin.as_slice() && key < self.end.as_slice()
    }

    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.is_empty() || (self.begin <= other.begin && other.end <= self.end)
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.begin < other.end && other.begin < self.end
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {})", fmt_key(&self.begin), fmt_key(&self.end))
    }
}

/// The full user keyspace governed by data distribution.
pub fn all_keys() -> KeyRange {
    KeyRange::new(Vec::new(), vec![0xff])
}

/// The first key sorting strictly after `key`.
pub fn key_after(key: &[u8]) -> Key {
    let mut out = key.to_vec();
    out.push(0);
    out
}

/// Render a key for log output: printable ASCII stays as-is, everything
/// else is hex-escaped.
pub fn fmt_key(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len());
    for &b in key {
        if (0x20..0x7f).contains(&b) && b != b'\\' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{b:02x}"));
        }
    }
    out
}

/// A map from key ranges to values, stored as boundaries: an entry at key
/// `k` holds the value for `[k, next boundary)`. The map always covers
/// `[begin, end)` completely; the entry at `end` is a terminal boundary
/// whose value is never observed.
#[derive(Clone)]
pub struct RangeMap<T> {
    map: BTreeMap<Key, T>,
    end: Key,
}

impl<T: Clone> RangeMap<T> {
    /// Create a map covering `bounds` with every key mapped to `default`.
    pub fn new(bounds: KeyRange, default: T) -> Self {
        let mut map = BTreeMap::new();
        map.insert(bounds.begin.clone(), default.clone());
        map.insert(bounds.end.clone(), default);
        Self {
            map,
            end: bounds.end,
        }
    }

    pub fn bounds(&self) -> KeyRange {
        let begin = self.map.keys().next().cloned().unwrap_or_default();
        KeyRange::new(begin, self.end.clone())
    }

    /// Value covering `key`.
    pub fn get(&self, key: &[u8]) -> &T {
        self.map
            .range(..=key.to_vec())
            .next_back()
            .map(|(_, v)| v)
            .expect("key below range map bounds")
    }

    /// Assign `value` to `[range.begin, range.end)`, splitting boundary
    /// entries so values outside the range are preserved.
    pub fn insert(&mut self, range: &KeyRange, value: T) {
        if range.is_empty() {
            return;
        }
        // Capture the value covering range.end before any mutation so the
        // suffix of a split entry keeps its old assignment.
        if range.end < self.end && !self.map.contains_key(&range.end) {
            let suffix = self.get(&range.end).clone();
            self.map.insert(range.end.clone(), suffix);
        }
        let interior: Vec<Key> = self
            .map
            .range(range.begin.clone()..range.end.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for k in interior {
            self.map.remove(&k);
        }
        self.map.insert(range.begin.clone(), value);
    }

    /// Iterate all `(range, value)` entries in key order.
    pub fn ranges(&self) -> impl Iterator<Item = (KeyRange, &T)> {
        self.map
            .iter()
            .zip(self.map.iter().skip(1))
            .map(|((begin, value), (end, _))| (KeyRange::new(begin.clone(), end.clone()), value))
    }

    /// Iterate the entries overlapping `range`, clamped to the map bounds.
    pub fn intersecting<'a>(
        &'a self,
        range: &KeyRange,
    ) -> impl Iterator<Item = (KeyRange, &'a T)> + 'a {
        let range = range.clone();
        self.ranges().filter(move |(r, _)| r.intersects(&range))
    }

    /// Reset every key in the bounds to `default`.
    pub fn clear(&mut self, default: T) {
        let bounds = self.bounds();
        self.map.clear();
        self.map.insert(bounds.begin, default.clone());
        self.map.insert(bounds.end, default);
    }

    pub fn boundary_count(&self) -> usize {
        self.map.len()
    }
}

impl<T: Clone + PartialEq> RangeMap<T> {
    /// Merge adjacent entries with equal values inside `range`.
    pub fn coalesce(&mut self, range: &KeyRange) {
        let keys: Vec<Key> = self
            .map
            .range(range.begin.clone()..=range.end.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            if k == self.end {
                continue;
            }
            let prev = self
                .map
                .range(..k.clone())
                .next_back()
                .map(|(pk, pv)| (pk.clone(), pv.clone()));
            if let Some((_, prev_value)) = prev {
                if self.map.get(&k) == Some(&prev_value) {
                    self.map.remove(&k);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges_of(map: &RangeMap<u32>) -> Vec<(KeyRange, u32)> {
        map.ranges().map(|(r, v)| (r, *v)).collect()
    }

    #[test]
    fn insert_splits_and_preserves_outside_values() {
        let mut map = RangeMap::new(all_keys(), 0u32);
        map.insert(&KeyRange::new(&b"b"[..], &b"m"[..]), 1);
        map.insert(&KeyRange::new(&b"d"[..], &b"f"[..]), 2);

        assert_eq!(*map.get(b"a"), 0);
        assert_eq!(*map.get(b"b"), 1);
        assert_eq!(*map.get(b"d"), 2);
        assert_eq!(*map.get(b"e"), 2);
        assert_eq!(*map.get(b"f"), 1);
        assert_eq!(*map.get(b"m"), 0);

        let got = ranges_of(&map);
        assert_eq!(got.len(), 5);
        assert_eq!(got[2], (KeyRange::new(&b"d"[..], &b"f"[..]), 2));
    }

    #[test]
    fn insert_overwrites_covered_boundaries() {
        let mut map = RangeMap::new(all_keys(), 0u32);
        map.insert(&KeyRange::new(&b"b"[..], &b"d"[..]), 1);
        map.insert(&KeyRange::new(&b"d"[..], &b"f"[..]), 2);
        map.insert(&KeyRange::new(&b"a"[..], &b"z"[..]), 3);

        assert_eq!(*map.get(b"c"), 3);
        assert_eq!(*map.get(b"e"), 3);
        assert_eq!(ranges_of(&map).len(), 3);
    }

    #[test]
    fn full_coverage_is_invariant() {
        let mut map = RangeMap::new(all_keys(), 0u32);
        map.insert(&KeyRange::new(&b"g"[..], &b"p"[..]), 7);
        let ranges = ranges_of(&map);
        assert_eq!(ranges.first().unwrap().0.begin, b"".to_vec());
        assert_eq!(ranges.last().unwrap().0.end, all_keys().end);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].0.end, pair[1].0.begin);
        }
    }

    #[test]
    fn coalesce_merges_equal_neighbors() {
        let mut map = RangeMap::new(all_keys(), 0u32);
        map.insert(&KeyRange::new(&b"b"[..], &b"d"[..]), 1);
        map.insert(&KeyRange::new(&b"d"[..], &b"f"[..]), 1);
        map.coalesce(&all_keys());
        let got = ranges_of(&map);
        assert_eq!(got.len(), 3);
        assert_eq!(got[1], (KeyRange::new(&b"b"[..], &b"f"[..]), 1));
    }

    #[test]
    fn intersecting_clamps_to_overlap() {
        let mut map = RangeMap::new(all_keys(), 0u32);
        map.insert(&KeyRange::new(&b"b"[..], &b"d"[..]), 1);
        map.insert(&KeyRange::new(&b"d"[..], &b"f"[..]), 2);
        let hits: Vec<u32> = map
            .intersecting(&KeyRange::new(&b"c"[..], &b"e"[..]))
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(hits, vec![1, 2]);
    }
}
