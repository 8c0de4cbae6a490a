//! Static cluster membership derived from the deployment naming convention.
//!
//! Replicas run as `<service>.<ordinal>` with ordinals `1..=cluster_size`;
//! the raft id of a member equals its ordinal.

use std::collections::BTreeMap;

use super::ConsensusError;

/// Membership of the consensus group as seen by one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLayout {
    /// Raft id of the local member.
    pub node_id: u64,
    /// Every member (including the local one), raft id -> peer address.
    pub peers: BTreeMap<u64, String>,
}

impl ClusterLayout {
    /// Derive the layout for member `slot` of a `cluster_size` group of
    /// `service` replicas whose peer listeners bind `peer_port`.
    pub fn derive(
        service: &str,
        cluster_size: u64,
        slot: u64,
        peer_port: u16,
    ) -> Result<Self, ConsensusError> {
        if service.is_empty() {
            return Err(ConsensusError::Layout("service name is empty".into()));
        }
        if cluster_size == 0 {
            return Err(ConsensusError::Layout("cluster size must be at least 1".into()));
        }
        if slot == 0 || slot > cluster_size {
            return Err(ConsensusError::Layout(format!(
                "task slot {slot} is outside 1..={cluster_size}"
            )));
        }

        let peers = (1..=cluster_size)
            .map(|ordinal| (ordinal, format!("{service}.{ordinal}:{peer_port}")))
            .collect();
        Ok(Self {
            node_id: slot,
            peers,
        })
    }

    /// A one-member group that seeds itself.
    pub fn single(addr: impl Into<String>) -> Self {
        Self {
            node_id: 1,
            peers: BTreeMap::from([(1, addr.into())]),
        }
    }

    /// Build a layout from explicit addresses.
    pub fn with_peers(node_id: u64, peers: BTreeMap<u64, String>) -> Result<Self, ConsensusError> {
        if !peers.contains_key(&node_id) {
            return Err(ConsensusError::Layout(format!(
                "member {node_id} is not part of the peer list"
            )));
        }
        Ok(Self { node_id, peers })
    }

    /// Raft ids of every voter, ascending.
    pub fn voters(&self) -> Vec<u64> {
        self.peers.keys().copied().collect()
    }

    /// Members other than the local one.
    pub fn remotes(&self) -> impl Iterator<Item = (u64, &str)> {
        self.peers
            .iter()
            .filter(move |(id, _)| **id != self.node_id)
            .map(|(id, addr)| (*id, addr.as_str()))
    }

    pub fn is_single(&self) -> bool {
        self.peers.len() == 1
    }

    /// Member name reported in logs, `<service>-<id>` style.
    pub fn member_name(&self, service: &str) -> String {
        format!("{service}-{}", self.node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_three_members() {
        let layout = ClusterLayout::derive("volmgr", 3, 2, 2380).unwrap();
        assert_eq!(layout.node_id, 2);
        assert_eq!(layout.voters(), vec![1, 2, 3]);
        assert_eq!(layout.peers[&1], "volmgr.1:2380");
        assert_eq!(layout.peers[&3], "volmgr.3:2380");

        let remotes: Vec<_> = layout.remotes().map(|(id, _)| id).collect();
        assert_eq!(remotes, vec![1, 3]);
        assert_eq!(layout.member_name("volmgr"), "volmgr-2");
    }

    #[test]
    fn slot_out_of_range_rejected() {
        assert!(matches!(
            ClusterLayout::derive("volmgr", 3, 4, 2380),
            Err(ConsensusError::Layout(_))
        ));
        assert!(matches!(
            ClusterLayout::derive("volmgr", 3, 0, 2380),
            Err(ConsensusError::Layout(_))
        ));
        assert!(matches!(
            ClusterLayout::derive("volmgr", 0, 1, 2380),
            Err(ConsensusError::Layout(_))
        ));
    }

    #[test]
    fn single_member_seeds_itself() {
        let layout = ClusterLayout::derive("volmgr", 1, 1, 2380).unwrap();
        assert!(layout.is_single());
        assert_eq!(layout.remotes().count(), 0);
    }

    #[test]
    fn explicit_peers_must_include_self() {
        let peers = BTreeMap::from([(1, "a:1".to_owned()), (2, "b:1".to_owned())]);
        assert!(ClusterLayout::with_peers(3, peers.clone()).is_err());
        assert!(ClusterLayout::with_peers(2, peers).is_ok());
    }
}
