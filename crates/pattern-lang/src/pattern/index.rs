// Static interval index for address lookups
//
// Intervals are sorted by start and laid out as an implicit binary tree
// (node at index i has level = number of trailing one bits of i), each node
// storing the maximum end of its subtree. This is the layout used by
// cgranges; a point query visits O(log n + k) nodes.

use super::PatternId;

#[derive(Debug, Clone, Copy)]
struct Interval {
    start: u64,
    /// Exclusive
    end: u64,
    /// Maximum `end` in the subtree rooted here
    max: u64,
    id: PatternId,
}

#[derive(Debug, Clone, Default)]
pub struct IntervalIndex {
    items: Vec<Interval>,
    root_level: u32,
}

impl IntervalIndex {
    /// Build from `(start, end_exclusive, id)` triples
    pub fn build(ranges: impl IntoIterator<Item = (u64, u64, PatternId)>) -> Self {
        let mut items: Vec<Interval> = ranges
            .into_iter()
            .filter(|(start, end, _)| end > start)
            .map(|(start, end, id)| Interval {
                start,
                end,
                max: end,
                id,
            })
            .collect();
        items.sort_by_key(|iv| (iv.start, iv.id));
        let root_level = augment(&mut items);
        Self { items, root_level }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Ids of all intervals containing `point`, ordered by start
    pub fn query(&self, point: u64) -> Vec<PatternId> {
        let mut out = Vec::new();
        self.overlapping(point, point.saturating_add(1), &mut out);
        out
    }

    fn overlapping(&self, st: u64, en: u64, out: &mut Vec<PatternId>) {
        let n = self.items.len();
        if n == 0 {
            return;
        }
        // (node, level, left subtree done)
        let mut stack: Vec<(usize, u32, bool)> = Vec::with_capacity(64);
        stack.push(((1usize << self.root_level) - 1, self.root_level, false));
        while let Some((x, k, left_done)) = stack.pop() {
            if k <= 3 {
                // small subtree: scan it linearly
                let i0 = x >> k << k;
                let i1 = (i0 + (1usize << (k + 1)) - 1).min(n);
                for iv in self.items[i0.min(n)..i1].iter().take_while(|iv| iv.start < en) {
                    if st < iv.end {
                        out.push(iv.id);
                    }
                }
            } else if !left_done {
                let left = x - (1usize << (k - 1));
                stack.push((x, k, true));
                if left >= n || self.items[left].max > st {
                    stack.push((left, k - 1, false));
                }
            } else if x < n && self.items[x].start < en {
                if st < self.items[x].end {
                    out.push(self.items[x].id);
                }
                stack.push((x + (1usize << (k - 1)), k - 1, false));
            }
        }
    }
}

/// Fill in subtree maxima; returns the level of the root
fn augment(items: &mut [Interval]) -> u32 {
    let n = items.len();
    if n == 0 {
        return 0;
    }
    let mut last_i = 0;
    let mut last = 0;
    for i in (0..n).step_by(2) {
        last_i = i;
        items[i].max = items[i].end;
        last = items[i].max;
    }
    let mut k = 1u32;
    while (1usize << k) <= n {
        let x = 1usize << (k - 1);
        let i0 = (x << 1) - 1;
        let step = x << 2;
        let mut i = i0;
        while i < n {
            let el = items[i - x].max;
            let er = if i + x < n { items[i + x].max } else { last };
            items[i].max = items[i].end.max(el).max(er);
            i += step;
        }
        last_i = if (last_i >> k) & 1 == 1 { last_i - x } else { last_i + x };
        if last_i < n && items[last_i].max > last {
            last = items[last_i].max;
        }
        k += 1;
    }
    k - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(ranges: &[(u64, u64)], point: u64) -> Vec<u32> {
        let mut hits: Vec<u32> = ranges
            .iter()
            .enumerate()
            .filter(|(_, (s, e))| *s <= point && point < *e)
            .map(|(i, _)| i as u32)
            .collect();
        hits.sort();
        hits
    }

    fn ids(mut v: Vec<PatternId>) -> Vec<u32> {
        v.sort();
        v.into_iter().map(|id| id.0).collect()
    }

    #[test]
    fn test_empty_index() {
        let index = IntervalIndex::build(Vec::new());
        assert!(index.query(0).is_empty());
    }

    #[test]
    fn test_nested_ranges() {
        let ranges = [(0, 16), (0, 4), (4, 8), (8, 16), (12, 14)];
        let index = IntervalIndex::build(
            ranges
                .iter()
                .enumerate()
                .map(|(i, (s, e))| (*s, *e, PatternId(i as u32))),
        );
        assert_eq!(ids(index.query(13)), vec![0, 3, 4]);
        assert_eq!(ids(index.query(4)), vec![0, 2]);
        assert!(index.query(16).is_empty());
    }

    #[test]
    fn test_matches_linear_scan() {
        // pseudo-random but deterministic ranges, enough to exceed the linear-scan levels
        let mut seed = 0x2545F4914F6CDD1Du64;
        let mut ranges = Vec::new();
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let start = seed % 2000;
            let len = 1 + (seed >> 32) % 64;
            ranges.push((start, start + len));
        }
        let index = IntervalIndex::build(
            ranges
                .iter()
                .enumerate()
                .map(|(i, (s, e))| (*s, *e, PatternId(i as u32))),
        );
        for point in (0..2100).step_by(7) {
            assert_eq!(ids(index.query(point)), naive(&ranges, point), "point {}", point);
        }
    }

    #[test]
    fn test_zero_sized_ranges_skipped() {
        let index = IntervalIndex::build(vec![(5, 5, PatternId(0)), (5, 6, PatternId(1))]);
        assert_eq!(index.len(), 1);
        assert_eq!(ids(index.query(5)), vec![1]);
    }
}
