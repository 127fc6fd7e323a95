//! Consistent-hash ring used by [`crate::StaticClusterView`].
//!
//! Each member contributes `virtual_nodes` points. A key is owned by the
//! member of the first point at or after the key's hash; backups are the next
//! distinct members clockwise. Adding or removing a member only moves the keys
//! adjacent to that member's points.

use std::hash::Hasher;

use twox_hash::XxHash64;

use crate::cluster::MemberId;

/// Default number of points per member.
pub const DEFAULT_VIRTUAL_NODES: usize = 64;

/// Seed shared by every node so that placement agrees cluster-wide.
const RING_SEED: u64 = 0x5e55_1047_0000_0001;

/// Immutable consistent-hash ring.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// Sorted `(point, member)` pairs.
    points: Vec<(u64, MemberId)>,
    /// Sorted, deduplicated members.
    members: Vec<MemberId>,
    virtual_nodes: usize,
}

impl HashRing {
    /// Build a ring. Duplicate members are collapsed; `virtual_nodes` is at least 1.
    pub fn new(members: impl IntoIterator<Item = MemberId>, virtual_nodes: usize) -> Self {
        let virtual_nodes = virtual_nodes.max(1);
        let mut members: Vec<MemberId> = members.into_iter().collect();
        members.sort();
        members.dedup();

        let mut points = Vec::with_capacity(members.len() * virtual_nodes);
        for member in &members {
            for vnode in 0..virtual_nodes {
                points.push((point_hash(member, vnode), member.clone()));
            }
        }
        points.sort();

        Self {
            points,
            members,
            virtual_nodes,
        }
    }

    /// Members on the ring, sorted.
    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the ring has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Points per member.
    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Owner of `key`, if the ring has any member.
    pub fn owner(&self, key: &str) -> Option<MemberId> {
        self.replicas(key, 1).into_iter().next()
    }

    /// The first `count` distinct members clockwise from `key`.
    ///
    /// Returns fewer than `count` members when the ring is smaller.
    pub fn replicas(&self, key: &str, count: usize) -> Vec<MemberId> {
        let want = count.min(self.members.len());
        if want == 0 {
            return Vec::new();
        }

        let hash = key_hash(key);
        let start = self.points.partition_point(|(point, _)| *point < hash);
        let mut replicas: Vec<MemberId> = Vec::with_capacity(want);
        for offset in 0..self.points.len() {
            let (_, member) = &self.points[(start + offset) % self.points.len()];
            if !replicas.contains(member) {
                replicas.push(member.clone());
                if replicas.len() == want {
                    break;
                }
            }
        }
        replicas
    }
}

fn key_hash(key: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(RING_SEED);
    hasher.write(key.as_bytes());
    hasher.finish()
}

fn point_hash(member: &MemberId, vnode: usize) -> u64 {
    let mut hasher = XxHash64::with_seed(RING_SEED);
    hasher.write(member.as_str().as_bytes());
    hasher.write(&(vnode as u64).to_le_bytes());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(names: &[&str]) -> HashRing {
        HashRing::new(names.iter().map(|n| MemberId::from(*n)), DEFAULT_VIRTUAL_NODES)
    }

    fn keys() -> Vec<String> {
        (0..500).map(|i| format!("session-{i}")).collect()
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = HashRing::default();
        assert!(ring.owner("session-1").is_none());
        assert!(ring.replicas("session-1", 3).is_empty());
    }

    #[test]
    fn test_placement_is_deterministic() {
        let a = ring(&["node-a", "node-b", "node-c"]);
        let b = ring(&["node-c", "node-a", "node-b", "node-a"]);

        for key in keys() {
            assert_eq!(a.replicas(&key, 2), b.replicas(&key, 2));
        }
    }

    #[test]
    fn test_replicas_are_distinct_and_bounded() {
        let ring = ring(&["node-a", "node-b"]);

        let replicas = ring.replicas("session-1", 5);

        assert_eq!(replicas.len(), 2);
        assert_ne!(replicas[0], replicas[1]);
        assert_eq!(ring.owner("session-1").as_ref(), replicas.first());
    }

    #[test]
    fn test_every_member_owns_something() {
        let ring = ring(&["node-a", "node-b", "node-c"]);
        let owners: std::collections::BTreeSet<MemberId> =
            keys().iter().filter_map(|k| ring.owner(k)).collect();
        assert_eq!(owners.len(), 3);
    }

    #[test]
    fn test_removing_member_only_moves_its_keys() {
        let before = ring(&["node-a", "node-b", "node-c"]);
        let after = ring(&["node-a", "node-c"]);

        for key in keys() {
            let old = before.owner(&key).unwrap();
            if old.as_str() != "node-b" {
                assert_eq!(after.owner(&key), Some(old), "key {key} moved");
            }
        }
    }

    #[test]
    fn test_added_member_takes_moved_keys() {
        let before = ring(&["node-a", "node-b"]);
        let after = ring(&["node-a", "node-b", "node-c"]);

        let mut moved = 0;
        for key in keys() {
            let old = before.owner(&key).unwrap();
            let new = after.owner(&key).unwrap();
            if old != new {
                assert_eq!(new.as_str(), "node-c");
                moved += 1;
            }
        }
        assert!(moved > 0);
    }
}
