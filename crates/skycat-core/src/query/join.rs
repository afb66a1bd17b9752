//! Row matching through a cross-match link table.

use super::plan::JoinType;

/// Index pairs produced by [`table_join`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinMap {
    /// Row indices into the left (primary-aligned) side, ascending.
    pub left: Vec<usize>,
    /// Row indices into the right side. Meaningless where `is_null` is set.
    pub right: Vec<usize>,
    /// Set for outer-join rows with no match on the right.
    pub is_null: Vec<bool>,
}

impl JoinMap {
    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }
}

/// Sorted view of a key column for repeated exact lookups.
struct SortedKeys<'a> {
    keys: &'a [u64],
    order: Vec<usize>,
}

impl<'a> SortedKeys<'a> {
    fn new(keys: &'a [u64]) -> Self {
        let mut order: Vec<usize> = (0..keys.len()).collect();
        order.sort_by_key(|&i| keys[i]);
        Self { keys, order }
    }

    fn find(&self, key: u64) -> Option<usize> {
        let pos = self.order.partition_point(|&i| self.keys[i] < key);
        self.order
            .get(pos)
            .copied()
            .filter(|&i| self.keys[i] == key)
    }
}

/// Join `id1` (left keys) with `id2` (right keys) through link pairs
/// `(m1[k], m2[k])`.
///
/// Keys on each side are assumed unique. A link whose endpoints are not both
/// present is ignored. The result is stably ordered by left index; for
/// [`JoinType::Outer`] every left row missing from the links appears once
/// with `is_null` set.
pub fn table_join(id1: &[u64], id2: &[u64], m1: &[u64], m2: &[u64], join: JoinType) -> JoinMap {
    let left_keys = SortedKeys::new(id1);
    let right_keys = SortedKeys::new(id2);

    let mut pairs: Vec<(usize, usize, bool)> = m1
        .iter()
        .zip(m2)
        .filter_map(|(&a, &b)| Some((left_keys.find(a)?, right_keys.find(b)?, false)))
        .collect();

    if join == JoinType::Outer {
        let mut seen = vec![false; id1.len()];
        for &(l, _, _) in &pairs {
            seen[l] = true;
        }
        pairs.extend(
            seen.iter()
                .enumerate()
                .filter(|(_, s)| !**s)
                .map(|(l, _)| (l, 0, true)),
        );
    }

    pairs.sort_by_key(|&(l, _, _)| l);
    let mut out = JoinMap {
        left: Vec::with_capacity(pairs.len()),
        right: Vec::with_capacity(pairs.len()),
        is_null: Vec::with_capacity(pairs.len()),
    };
    for (l, r, null) in pairs {
        out.left.push(l);
        out.right.push(r);
        out.is_null.push(null);
    }
    out
}

/// For each needle, whether it occurs in `haystack`.
pub fn in_array(needles: &[u64], haystack: &[u64]) -> Vec<bool> {
    let mut sorted = haystack.to_vec();
    sorted.sort_unstable();
    needles
        .iter()
        .map(|n| sorted.binary_search(n).is_ok())
        .collect()
}
