// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Greedy, order-preserving assignment shared by every matching level.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use crate::arena::LinAllocator;

/// A scored candidate pairing of item `a` on the left with item `b` on the right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Candidate {
    pub(crate) a: u32,
    pub(crate) b: u32,
    /// Rank distance within the candidates' key group; smaller is closer.
    pub(crate) proximity: u32,
    pub(crate) score: f32,
}

/**
Candidate pairs between two sequences, restricted to items with equal keys.

Within one key group the `r`th item on the left is only paired with items whose rank
on the right is within `window` of `r`.  Returns `(a, b, proximity)`.
*/
pub(crate) fn keyed_pairs<K: Eq + Hash>(keys_a: &[K], keys_b: &[K], window: usize) -> Vec<(u32, u32, u32)> {
    let mut groups: HashMap<&K, (Vec<u32>, Vec<u32>)> = HashMap::new();
    for (i, key) in keys_a.iter().enumerate() {
        groups.entry(key).or_default().0.push(i as u32);
    }
    for (i, key) in keys_b.iter().enumerate() {
        if let Some(group) = groups.get_mut(key) {
            group.1.push(i as u32);
        }
    }
    let mut pairs = Vec::new();
    for (left, right) in groups.values() {
        if right.is_empty() {
            continue;
        }
        for (rank_a, &a) in left.iter().enumerate() {
            let low = rank_a.saturating_sub(window);
            let high = (rank_a + window).min(right.len() - 1);
            for (rank_b, &b) in right.iter().enumerate().take(high + 1).skip(low) {
                pairs.push((a, b, rank_a.abs_diff(rank_b) as u32));
            }
        }
    }
    pairs
}

/// Like [`keyed_pairs`], with every item in one group.
pub(crate) fn window_pairs(len_a: usize, len_b: usize, window: usize) -> Vec<(u32, u32, u32)> {
    let keys_a = vec![(); len_a];
    let keys_b = vec![(); len_b];
    keyed_pairs(&keys_a, &keys_b, window)
}

/**
Accepts candidates best-first, skipping any that reuse an item or would cross a pair
already accepted.

Candidates are ordered by score, then proximity, then position, so the outcome is
deterministic.  The result is sorted by `a` and strictly increasing in `b`.
*/
pub(crate) fn accept(
    scratch: &mut LinAllocator<Candidate>,
    candidates: impl IntoIterator<Item = Candidate>,
) -> Vec<(u32, u32)> {
    let mut scope = scratch.scope();
    for candidate in candidates {
        scope.alloc(candidate);
    }
    let sorted = scope.allocated_mut();
    sorted.sort_unstable_by(|x, y| {
        y.score
            .total_cmp(&x.score)
            .then(x.proximity.cmp(&y.proximity))
            .then(x.a.cmp(&y.a))
            .then(x.b.cmp(&y.b))
    });
    let mut accepted: BTreeMap<u32, u32> = BTreeMap::new();
    let mut used_b: BTreeMap<u32, u32> = BTreeMap::new();
    for candidate in scope.allocated() {
        if accepted.contains_key(&candidate.a) || used_b.contains_key(&candidate.b) {
            continue;
        }
        let before = accepted.range(..candidate.a).next_back();
        let after = accepted.range(candidate.a..).next();
        let crosses = before.is_some_and(|(_, &b)| b >= candidate.b)
            || after.is_some_and(|(_, &b)| b <= candidate.b);
        if crosses {
            continue;
        }
        accepted.insert(candidate.a, candidate.b);
        used_b.insert(candidate.b, candidate.a);
    }
    accepted.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(a: u32, b: u32, proximity: u32, score: f32) -> Candidate {
        Candidate {
            a,
            b,
            proximity,
            score,
        }
    }

    #[test]
    fn crossing_pairs_are_rejected() {
        let mut scratch = LinAllocator::new();
        let accepted = accept(
            &mut scratch,
            [
                candidate(0, 1, 1, 0.9),
                candidate(1, 0, 1, 0.8),
                candidate(1, 2, 1, 0.5),
            ],
        );
        assert_eq!(accepted, vec![(0, 1), (1, 2)]);
        assert!(scratch.is_empty());
    }

    #[test]
    fn ties_prefer_proximity() {
        let mut scratch = LinAllocator::new();
        let accepted = accept(
            &mut scratch,
            [
                candidate(0, 1, 1, 1.0),
                candidate(0, 0, 0, 1.0),
                candidate(1, 1, 0, 1.0),
            ],
        );
        assert_eq!(accepted, vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn keys_filter_and_window_limits() {
        let pairs = keyed_pairs(&['x', 'y', 'x'], &['x', 'x', 'z'], 0);
        let mut pairs = pairs;
        pairs.sort();
        // 'x' ranks 0,1 on the left pair with ranks 0,1 on the right only
        assert_eq!(pairs, vec![(0, 0, 0), (2, 1, 0)]);
        assert_eq!(window_pairs(3, 1, 1).len(), 2);
    }
}
