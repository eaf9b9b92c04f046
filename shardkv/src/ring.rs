//! Consistent hash ring mapping keys to shards.
//!
//! Every shard contributes `virtual_nodes` points named `"{shard}:{i}"`. A
//! key belongs to the first point at or after its own hash, wrapping around
//! to the smallest point. The ring is rebuilt from scratch whenever
//! membership changes, so a rebalance may move any key, not only the keys
//! adjacent to the added or removed shard.

use std::{
    collections::BTreeMap,
    hash::Hasher,
};

use twox_hash::XxHash64;

use crate::ShardId;

pub const DEFAULT_VIRTUAL_NODES: usize = 3;

/// Hashes bytes onto the ring. Seeded so the result is stable across
/// processes and restarts.
pub fn ring_hash(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    hasher.finish()
}

/// One virtual node on the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingPoint {
    pub hash: u64,
    pub shard: ShardId,
}

#[derive(Debug, Clone, Default)]
pub struct ShardRing {
    points: BTreeMap<u64, ShardId>,
    shards: Vec<ShardId>,
    virtual_nodes: usize,
}

impl ShardRing {
    pub fn build<I, S>(shards: I, virtual_nodes: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ShardId>,
    {
        let virtual_nodes = virtual_nodes.max(1);
        let mut shards: Vec<ShardId> =
            shards.into_iter().map(Into::into).collect();
        shards.sort();
        shards.dedup();

        let mut points = BTreeMap::new();
        for shard in &shards {
            for i in 0..virtual_nodes {
                let hash = ring_hash(format!("{shard}:{i}").as_bytes());
                // on a (practically impossible) collision the smaller shard
                // id keeps the point, so the build stays deterministic
                points.entry(hash).or_insert_with(|| shard.clone());
            }
        }
        Self {
            points,
            shards,
            virtual_nodes,
        }
    }

    /// Shard owning `key`, or `None` for an empty ring.
    pub fn route(&self, key: &str) -> Option<&ShardId> {
        let hash = ring_hash(key.as_bytes());
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, shard)| shard)
    }

    /// Rebuilds the ring with `shard` added. Returns `None` if it is
    /// already a member.
    pub fn with_shard(&self, shard: &str) -> Option<Self> {
        if self.contains(shard) {
            return None;
        }
        let shards = self.shards.iter().cloned().chain([shard.to_string()]);
        Some(Self::build(shards, self.virtual_nodes))
    }

    /// Rebuilds the ring with `shard` removed. Returns `None` if it is not
    /// a member.
    pub fn without_shard(&self, shard: &str) -> Option<Self> {
        if !self.contains(shard) {
            return None;
        }
        let shards = self.shards.iter().filter(|s| s.as_str() != shard).cloned();
        Some(Self::build(shards, self.virtual_nodes))
    }

    pub fn contains(&self, shard: &str) -> bool {
        self.shards.iter().any(|s| s == shard)
    }

    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    pub fn points(&self) -> impl Iterator<Item = RingPoint> + '_ {
        self.points.iter().map(|(hash, shard)| RingPoint {
            hash: *hash,
            shard: shard.clone(),
        })
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::{distr::Alphanumeric, Rng};

    use super::*;

    fn three() -> ShardRing {
        ShardRing::build(["S1", "S2", "S3"], 3)
    }

    #[test]
    fn empty_ring_routes_nowhere() {
        let ring = ShardRing::build(Vec::<String>::new(), 3);
        assert!(ring.is_empty());
        assert_eq!(ring.route("a"), None);
    }

    #[test]
    fn points_are_sorted_and_complete() {
        let ring = three();
        let points: Vec<_> = ring.points().collect();
        assert_eq!(points.len(), 9);
        assert!(points.windows(2).all(|w| w[0].hash < w[1].hash));
    }

    #[test]
    fn routing_is_deterministic_across_rebuilds() {
        let a = three();
        let b = ShardRing::build(["S3", "S1", "S2", "S1"], 3);
        for i in 0..1000 {
            let key = format!("key-{i}");
            assert_eq!(a.route(&key), a.route(&key));
            assert_eq!(a.route(&key), b.route(&key));
        }
    }

    #[test]
    fn route_picks_first_point_at_or_after_hash_and_wraps() {
        let ring = three();
        let points: Vec<_> = ring.points().collect();
        for i in 0..500 {
            let key = format!("k{i}");
            let h = ring_hash(key.as_bytes());
            let expected = points
                .iter()
                .find(|p| p.hash >= h)
                .unwrap_or(&points[0]);
            assert_eq!(ring.route(&key), Some(&expected.shard));
        }
    }

    #[test]
    fn membership_changes_rebuild_the_ring() {
        let ring = three();
        assert!(ring.with_shard("S1").is_none());
        let grown = ring.with_shard("S4").unwrap();
        assert_eq!(grown.shards().len(), 4);
        assert_eq!(grown.points().count(), 12);
        let shrunk = grown.without_shard("S4").unwrap();
        for i in 0..200 {
            let key = format!("k{i}");
            assert_eq!(shrunk.route(&key), ring.route(&key));
        }
        assert!(shrunk.without_shard("S4").is_none());
    }

    #[test]
    fn keys_spread_over_all_shards() {
        let shards: Vec<String> = (0..4).map(|i| format!("shard-{i}")).collect();
        let ring = ShardRing::build(shards.clone(), 64);
        let mut rng = rand::rng();
        let samples = 100_000;
        let mut counts: HashMap<&ShardId, usize> = HashMap::new();
        for _ in 0..samples {
            let key: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(16)
                .map(char::from)
                .collect();
            *counts.entry(ring.route(&key).unwrap()).or_default() += 1;
        }
        let fair = samples / shards.len();
        for shard in &shards {
            let got = counts.get(shard).copied().unwrap_or(0);
            assert!(
                got > fair / 2 && got < fair * 3 / 2,
                "shard {shard} got {got} of {samples} keys"
            );
        }
    }

    #[test]
    fn three_virtual_nodes_reach_every_shard() {
        let ring = three();
        let mut seen = std::collections::HashSet::new();
        for i in 0..100_000 {
            seen.insert(ring.route(&format!("key-{i}")).unwrap().clone());
        }
        assert_eq!(seen.len(), 3);
    }
}
