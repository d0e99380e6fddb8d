use std::time::Duration;

use muninn_types::NodeId;

/// Engine-level knobs. Peer retry policy and per-attempt deadlines live in
/// the transport configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub node_id: NodeId,
    /// Target replica count per key.
    pub replica_factor: usize,
    /// Virtual slots contributed to the ring per node.
    pub ring_virtual_slots: usize,
    /// Hard cap on a replicate/invalidate fan-out.
    pub fanout_deadline: Duration,
    /// Delay before the second replicate shot that covers peers which missed
    /// the first round.
    pub secondary_replicate_delay: Duration,
    pub secondary_invalidate_delay: Duration,
}

impl EngineConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        EngineConfig {
            node_id: node_id.into(),
            replica_factor: 3,
            ring_virtual_slots: muninn_ring::DEFAULT_VIRTUAL_SLOTS,
            fanout_deadline: Duration::from_secs(8),
            secondary_replicate_delay: Duration::from_secs(1),
            secondary_invalidate_delay: Duration::from_secs(2),
        }
    }
}
