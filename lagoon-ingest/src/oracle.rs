//! Cluster membership oracle.
//!
//! The oracle decides which replica leads each `(topic, partition)`. The
//! core never elects anybody; it only reacts to role signals. Signals are
//! delivered over watch channels, which naturally collapse transition
//! storms: an ingestor that wakes up late sees only the latest role.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use lagoon_core::{PartitionId, TopicName};
use tokio::sync::watch;
use tracing::info;

/// Role of a replica for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaRole {
    /// Consumes the version topic only.
    #[default]
    Follower,
    /// Consumes the upstream and re-produces into the version topic.
    Leader,
}

/// Source of role assignments for partition replicas.
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    /// Subscribes to role changes for a `(topic, partition)`.
    ///
    /// The receiver's current value is the role right now; changes arrive
    /// through the channel.
    async fn subscribe(&self, topic: &TopicName, partition: PartitionId)
        -> watch::Receiver<ReplicaRole>;
}

/// An oracle driven by explicit promote/demote calls.
///
/// Production deployments wire the cluster manager here; tests drive
/// failover scenarios by hand.
#[derive(Debug, Default)]
pub struct ManualMembership {
    assignments: Mutex<HashMap<(TopicName, PartitionId), watch::Sender<ReplicaRole>>>,
}

impl ManualMembership {
    /// Creates an oracle where every replica starts as a follower.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a role, signalling every subscribed ingestor.
    pub fn set_role(&self, topic: &TopicName, partition: PartitionId, role: ReplicaRole) {
        info!(topic = %topic, %partition, ?role, "assigning replica role");
        self.sender(topic, partition).send_replace(role);
    }

    /// Returns the currently assigned role.
    #[must_use]
    pub fn role(&self, topic: &TopicName, partition: PartitionId) -> ReplicaRole {
        *self.sender(topic, partition).borrow()
    }

    fn sender(&self, topic: &TopicName, partition: PartitionId) -> watch::Sender<ReplicaRole> {
        let mut assignments = self.assignments.lock().expect("oracle poisoned");
        assignments
            .entry((topic.clone(), partition))
            .or_insert_with(|| watch::channel(ReplicaRole::Follower).0)
            .clone()
    }
}

#[async_trait]
impl MembershipOracle for ManualMembership {
    async fn subscribe(
        &self,
        topic: &TopicName,
        partition: PartitionId,
    ) -> watch::Receiver<ReplicaRole> {
        self.sender(topic, partition).subscribe()
    }
}
