//! Consistent-hash placement ring.
//!
//! Each member contributes a fixed number of virtual slots; a key is owned
//! by the first slot at or past its hash, walking the ring circularly. All
//! nodes in a cluster must derive identical placements, so the hash function
//! is a protocol constant: the first 32 bits of the MD5 digest.

use md5::{Digest, Md5};

use muninn_types::NodeId;

pub const DEFAULT_VIRTUAL_SLOTS: usize = 100;

/// 32-bit ring position of `input`: the first four digest bytes, big-endian
/// (equivalently, the first 8 hex characters of the MD5 hex digest).
pub fn hash32(input: &str) -> u32 {
    let digest = Md5::digest(input.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Sorted sequence of `(slot, node)` pairs.
///
/// Slot collisions are tolerated by keeping insertion order, so the
/// first-inserted node wins lookups on a contested slot. Removing a node
/// removes exactly its virtual slots, restoring the ring to its
/// pre-addition state.
#[derive(Debug, Clone)]
pub struct HashRing {
    slots: Vec<(u32, NodeId)>,
    virtual_slots: usize,
}

impl HashRing {
    pub fn new(virtual_slots: usize) -> Self {
        HashRing { slots: Vec::new(), virtual_slots: virtual_slots.max(1) }
    }

    pub fn add_node(&mut self, id: &str) {
        if self.contains(id) {
            return;
        }
        for i in 0..self.virtual_slots {
            let slot = hash32(&format!("{id}:{i}"));
            // partition_point keeps equal slots in insertion order.
            let at = self.slots.partition_point(|(s, _)| *s <= slot);
            self.slots.insert(at, (slot, id.to_string()));
        }
    }

    pub fn remove_node(&mut self, id: &str) {
        self.slots.retain(|(_, n)| n != id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.iter().any(|(_, n)| n == id)
    }

    /// Distinct member ids, in ring order of their first slot.
    pub fn members(&self) -> Vec<NodeId> {
        let mut seen = Vec::new();
        for (_, n) in &self.slots {
            if !seen.iter().any(|m: &NodeId| m == n) {
                seen.push(n.clone());
            }
        }
        seen
    }

    pub fn node_count(&self) -> usize {
        self.members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The node owning `key`, or `None` on an empty ring.
    pub fn primary_for(&self, key: &str) -> Option<NodeId> {
        self.replicas_for(key, 1).into_iter().next()
    }

    /// Up to `factor` distinct nodes for `key`, starting at the first slot
    /// at or past the key's hash and walking the ring circularly.
    /// Deterministic for a given membership.
    pub fn replicas_for(&self, key: &str, factor: usize) -> Vec<NodeId> {
        if self.slots.is_empty() || factor == 0 {
            return Vec::new();
        }
        let h = hash32(key);
        let start = self.slots.partition_point(|(s, _)| *s < h);
        let mut replicas: Vec<NodeId> = Vec::with_capacity(factor);
        for i in 0..self.slots.len() {
            let (_, node) = &self.slots[(start + i) % self.slots.len()];
            if !replicas.iter().any(|r| r == node) {
                replicas.push(node.clone());
                if replicas.len() == factor {
                    break;
                }
            }
        }
        replicas
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_SLOTS)
    }
}
