//! Per-worker sharding of the dataset.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Deterministic epoch-wise shuffling and strided sharding.
///
/// For epoch `e` every worker draws the same permutation from
/// `base_seed + e`; worker `r` of `W` then takes `perm[r], perm[r + W], ...`.
/// The shards are disjoint and together cover the dataset exactly once.  To
/// keep step counts equal, each shard is topped up by wrapping its own
/// indices until it holds `ceil(N / W)` entries.
#[derive(Debug, Clone)]
pub struct ShardSampler {
    len: usize,
    rank: usize,
    world_size: usize,
    base_seed: u64,
}

impl ShardSampler {
    pub fn new(len: usize, rank: usize, world_size: usize, base_seed: u64) -> Self {
        let world_size = world_size.max(1);
        Self { len, rank: rank.min(world_size - 1), world_size, base_seed }
    }

    /// The dataset permutation shared by every worker for `epoch`.
    pub fn permutation(&self, epoch: usize) -> Vec<usize> {
        let mut perm: Vec<usize> = (0..self.len).collect();
        let mut rng = StdRng::seed_from_u64(self.base_seed.wrapping_add(epoch as u64));
        perm.shuffle(&mut rng);
        perm
    }

    /// Strided slice of `perm` owned by `rank`.
    pub fn shard(perm: &[usize], rank: usize, world_size: usize) -> Vec<usize> {
        perm.iter().skip(rank).step_by(world_size.max(1)).copied().collect()
    }

    /// Number of indices every worker processes per epoch.
    pub fn shard_len(&self) -> usize {
        self.len.div_ceil(self.world_size)
    }

    /// This worker's indices for `epoch`, padded to [`Self::shard_len`].
    pub fn epoch_indices(&self, epoch: usize) -> Vec<usize> {
        let shard = Self::shard(&self.permutation(epoch), self.rank, self.world_size);
        if shard.is_empty() {
            return shard;
        }
        shard.iter().copied().cycle().take(self.shard_len()).collect()
    }

    pub fn batches_per_epoch(&self, batch_size: usize) -> usize {
        self.shard_len().div_ceil(batch_size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn shards_are_disjoint_and_exhaustive() {
        for (n, w) in [(10, 3), (7, 2), (4, 4), (100, 8), (5, 1)] {
            let perm = ShardSampler::new(n, 0, w, 7).permutation(2);
            let mut seen = BTreeSet::new();
            let mut total = 0;
            for r in 0..w {
                for idx in ShardSampler::shard(&perm, r, w) {
                    assert!(seen.insert(idx), "index {idx} assigned twice");
                    total += 1;
                }
            }
            assert_eq!(total, n);
            assert_eq!(seen, (0..n).collect::<BTreeSet<_>>());
        }
    }

    #[test]
    fn all_workers_agree_on_permutation() {
        let a = ShardSampler::new(50, 0, 4, 42).permutation(1);
        let b = ShardSampler::new(50, 3, 4, 42).permutation(1);
        assert_eq!(a, b);
    }

    #[test]
    fn epochs_reshuffle() {
        let s = ShardSampler::new(50, 0, 1, 42);
        assert_ne!(s.permutation(0), s.permutation(1));
        assert_eq!(s.permutation(3), ShardSampler::new(50, 0, 1, 42).permutation(3));
    }

    #[test]
    fn padded_shards_have_equal_length() {
        let lens: Vec<usize> = (0..3)
            .map(|r| ShardSampler::new(10, r, 3, 0).epoch_indices(0).len())
            .collect();
        assert_eq!(lens, vec![4, 4, 4]);
    }

    #[test]
    fn padding_repeats_own_indices_only() {
        let s = ShardSampler::new(10, 2, 3, 0);
        let own: BTreeSet<usize> =
            ShardSampler::shard(&s.permutation(0), 2, 3).into_iter().collect();
        let padded = s.epoch_indices(0);
        assert!(padded.iter().all(|i| own.contains(i)));
    }

    #[test]
    fn single_worker_sees_everything() {
        let s = ShardSampler::new(9, 0, 1, 1);
        let mut idx = s.epoch_indices(0);
        idx.sort_unstable();
        assert_eq!(idx, (0..9).collect::<Vec<_>>());
        assert_eq!(s.batches_per_epoch(4), 3);
    }
}
