//! Pure topology builders: from (group size, my index, radix) to the ordered
//! list of phases this member takes part in.

mod bruck;
mod pairwise;
mod recursive;
mod tree;

#[cfg(test)]
mod test_topo;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    api::{CollectiveKind, CollectiveType, HostId, MemberIndex, SmallVec},
    config::BuiltinConfig,
    error::Result,
};

pub use bruck::{bruck_phase_count, bruck_phases};
pub use pairwise::pairwise_phases;
pub use recursive::{power_of, recursive_phases};
pub use tree::{FaninKind, FanoutKind, TreeParams, tree_children, tree_parent, tree_phases};

/// Role of a member in one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanMethod {
    /// Send to every peer, nothing to receive.
    SendTerminal,
    /// Send a different block to every peer.
    ScatterTerminal,
    /// Receive from every peer, nothing to send.
    RecvTerminal,
    /// Receive from the parent, forward to every child.
    BcastWaypoint,
    /// Reduce into the local buffer from every peer.
    ReduceTerminal,
    /// Reduce from every child, forward the result to the parent.
    ReduceWaypoint,
    /// Exchange with every peer and reduce what arrives.
    ReduceRecursive,
    AlltoallBruck,
    AllgatherBruck,
    Pairwise,
}

impl PlanMethod {
    pub fn name(&self) -> &'static str {
        match self {
            PlanMethod::SendTerminal => "send_terminal",
            PlanMethod::ScatterTerminal => "scatter_terminal",
            PlanMethod::RecvTerminal => "recv_terminal",
            PlanMethod::BcastWaypoint => "bcast_waypoint",
            PlanMethod::ReduceTerminal => "reduce_terminal",
            PlanMethod::ReduceWaypoint => "reduce_waypoint",
            PlanMethod::ReduceRecursive => "reduce_recursive",
            PlanMethod::AlltoallBruck => "alltoall_bruck",
            PlanMethod::AllgatherBruck => "allgather_bruck",
            PlanMethod::Pairwise => "pairwise",
        }
    }
}

impl std::fmt::Display for PlanMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One phase as computed by a builder, before endpoints are connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseLayout {
    pub method: PlanMethod,
    pub step_index: u8,
    pub peers: SmallVec<MemberIndex>,
}

impl PhaseLayout {
    pub fn new(method: PlanMethod, step_index: u8, peers: SmallVec<MemberIndex>) -> Self {
        Self { method, step_index, peers }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopologyType {
    Recursive,
    AlltoallBruck,
    AllgatherBruck,
    Pairwise,
    TreeFanin,
    TreeFanout,
    TreeFaninFanout,
}

/// Whether the group spans several hosts and at least one host runs more than
/// one member. `hosts` maps member index to host; empty when unknown.
pub fn mixes_locality(hosts: &[HostId]) -> bool {
    let distinct: HashSet<HostId> = hosts.iter().copied().collect();
    distinct.len() > 1 && distinct.len() < hosts.len()
}

/// Recursive exchanges are only used for uniform placements; mixed groups go
/// through the fan-in/fan-out tree.
pub fn choose_topology(
    kind: CollectiveKind,
    group_size: usize,
    factor: usize,
    mixed_locality: bool,
) -> TopologyType {
    match kind {
        CollectiveKind::Bcast | CollectiveKind::Scatter => TopologyType::TreeFanout,
        CollectiveKind::Reduce | CollectiveKind::Gather => TopologyType::TreeFanin,
        CollectiveKind::Barrier | CollectiveKind::Allreduce => {
            if !mixed_locality && power_of(group_size, factor).is_some() {
                TopologyType::Recursive
            } else {
                TopologyType::TreeFaninFanout
            }
        }
        CollectiveKind::Alltoall => {
            if group_size.is_power_of_two() {
                TopologyType::AlltoallBruck
            } else {
                TopologyType::Pairwise
            }
        }
        CollectiveKind::Allgather => TopologyType::AllgatherBruck,
    }
}

/// Phases of `me` for a collective of type `coll_type` over `group_size` members.
pub fn build_layout(
    coll_type: &CollectiveType,
    group_size: usize,
    me: MemberIndex,
    mixed_locality: bool,
    config: &BuiltinConfig,
) -> Result<(TopologyType, Vec<PhaseLayout>)> {
    let topology =
        choose_topology(coll_type.kind, group_size, config.recursive_factor, mixed_locality);
    let tree = |fanin, fanout, radix| TreeParams {
        group_size,
        me,
        root: coll_type.root,
        radix,
        fanin,
        fanout,
    };
    let flat = group_size.max(2);
    let phases = match topology {
        TopologyType::Recursive => {
            recursive_phases(group_size, me, config.recursive_factor)?
        }
        TopologyType::AlltoallBruck => {
            bruck_phases(group_size, me, PlanMethod::AlltoallBruck)?
        }
        TopologyType::AllgatherBruck => {
            bruck_phases(group_size, me, PlanMethod::AllgatherBruck)?
        }
        TopologyType::Pairwise => pairwise_phases(group_size, me)?,
        TopologyType::TreeFanin => match coll_type.kind {
            CollectiveKind::Gather => tree_phases(&tree(Some(FaninKind::Gather), None, flat))?,
            _ => tree_phases(&tree(Some(FaninKind::Reduce), None, config.tree_radix))?,
        },
        TopologyType::TreeFanout => match coll_type.kind {
            CollectiveKind::Scatter => {
                tree_phases(&tree(None, Some(FanoutKind::Scatter), flat))?
            }
            _ => tree_phases(&tree(None, Some(FanoutKind::Bcast), config.tree_radix))?,
        },
        TopologyType::TreeFaninFanout => tree_phases(&tree(
            Some(FaninKind::Reduce),
            Some(FanoutKind::Bcast),
            config.tree_radix,
        ))?,
    };
    Ok((topology, phases))
}
