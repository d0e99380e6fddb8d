//! Cluster membership: who is alive, and a stream of add/remove deltas.
//!
//! The [`Registry`] trait is the engine's only view of coordination. The
//! production implementation ([`EtcdRegistry`]) binds registrations to a
//! session lease and watches the membership prefix, falling back to polling
//! whenever the watch is unavailable. [`MemRegistry`] provides the same
//! semantics in-process for tests and single-node deployments.

pub mod etcd;
pub mod mem;

use std::collections::HashMap;
use std::future::Future;

use tokio::sync::broadcast;

use muninn_types::{CacheError, NodeDescriptor, NodeId};

pub use etcd::{EtcdConfig, EtcdRegistry};
pub use mem::MemRegistry;

/// A membership delta delivered to subscribers.
///
/// Deltas are at-least-once: after a reconnect the full member list is
/// re-diffed, so a subscriber may see `Added` for a node it already knows.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Added { descriptor: NodeDescriptor },
    Removed { node_id: NodeId },
}

impl MembershipEvent {
    pub fn node_id(&self) -> &str {
        match self {
            MembershipEvent::Added { descriptor } => &descriptor.node_id,
            MembershipEvent::Removed { node_id } => node_id,
        }
    }
}

/// Membership registry: advertise self, observe the rest of the cluster.
pub trait Registry: Send + Sync + 'static {
    /// Announce the local node. The registration is session-bound: a crash
    /// or partition de-registers the node automatically at the coordination
    /// service. Any stale registration under the same node id is removed
    /// first.
    fn register(&self, descriptor: &NodeDescriptor)
        -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Explicit clean shutdown.
    fn unregister(&self, node_id: &str)
        -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Current snapshot of live members.
    fn members(&self)
        -> impl Future<Output = Result<HashMap<NodeId, NodeDescriptor>, CacheError>> + Send;

    /// Subscribe to membership deltas.
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Synthesize the events that turn `old` into `new`.
///
/// A member present in both but with a changed descriptor is re-announced as
/// `Added`; consumers treat adds as upserts.
pub fn diff_members(
    old: &HashMap<NodeId, NodeDescriptor>,
    new: &HashMap<NodeId, NodeDescriptor>,
) -> Vec<MembershipEvent> {
    let mut events = Vec::new();
    for (id, descriptor) in new {
        if old.get(id) != Some(descriptor) {
            events.push(MembershipEvent::Added { descriptor: descriptor.clone() });
        }
    }
    for id in old.keys() {
        if !new.contains_key(id) {
            events.push(MembershipEvent::Removed { node_id: id.clone() });
        }
    }
    events
}
