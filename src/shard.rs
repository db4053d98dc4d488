//! Static, coordination-free work partitioning.
//!
//! A worker owns every row whose id satisfies `id mod count = index`. The same
//! predicate is pushed into each store query, so workers never see each
//! other's rows and no lease or leader is needed.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Shard {
    index: u32,
    count: u32,
}

impl Shard {
    /// Build the shard for worker `index` out of `count`.
    ///
    /// `count` is clamped to at least one and `index` is folded into range, so
    /// a misconfigured pool degrades to overlapping work rather than gaps.
    pub fn new(index: usize, count: usize) -> Self {
        let count = count.max(1) as u32;
        Self {
            index: (index as u32) % count,
            count,
        }
    }

    /// The single shard that covers every row.
    pub fn whole() -> Self {
        Self::new(0, 1)
    }

    /// All shards of a pool of `count` workers.
    pub fn all(count: usize) -> impl Iterator<Item = Shard> {
        let count = count.max(1);
        (0..count).map(move |index| Shard::new(index, count))
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether row `id` belongs to this shard. Mirrors the SQL `id % count = index`
    /// predicate for the non-negative ids the store hands out.
    pub fn contains(&self, id: i64) -> bool {
        id.rem_euclid(self.count as i64) == self.index as i64
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_id_lands_in_exactly_one_shard() {
        for count in 1..=7 {
            for id in 0..200i64 {
                let owners = Shard::all(count).filter(|s| s.contains(id)).count();
                assert_eq!(owners, 1, "id {id} with {count} workers");
            }
        }
    }

    #[test]
    fn zero_workers_degrades_to_one() {
        let shard = Shard::new(3, 0);
        assert_eq!(shard.count(), 1);
        assert_eq!(shard.index(), 0);
        assert!(shard.contains(42));
    }

    #[test]
    fn display_shows_index_and_count() {
        assert_eq!(Shard::new(2, 5).to_string(), "2/5");
    }
}
