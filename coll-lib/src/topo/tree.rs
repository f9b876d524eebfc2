use smallvec::smallvec;

use crate::{
    api::{MemberIndex, SmallVec},
    error::{CollLibError, Result},
    topo::{PhaseLayout, PlanMethod},
};

/// What flows towards the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaninKind {
    Reduce,
    Gather,
}

/// What flows away from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutKind {
    Bcast,
    Scatter,
}

#[derive(Debug, Clone)]
pub struct TreeParams {
    pub group_size: usize,
    pub me: MemberIndex,
    pub root: MemberIndex,
    pub radix: usize,
    pub fanin: Option<FaninKind>,
    pub fanout: Option<FanoutKind>,
}

/// Parent of virtual rank `v` in the k-nomial tree rooted at 0: `v` with its
/// lowest non-zero base-`radix` digit cleared.
pub fn tree_parent(v: usize, radix: usize) -> Option<usize> {
    if v == 0 {
        return None;
    }
    let mut stride = 1;
    while (v / stride) % radix == 0 {
        stride *= radix;
    }
    Some(v - ((v / stride) % radix) * stride)
}

/// Children of virtual rank `v`, in increasing order.
pub fn tree_children(v: usize, radix: usize, n: usize) -> Vec<usize> {
    let mut children = Vec::new();
    let mut stride = 1;
    while stride < n {
        if (v / stride) % radix != 0 {
            break;
        }
        for j in 1..radix {
            let child = v + j * stride;
            if child >= n {
                break;
            }
            children.push(child);
        }
        stride = stride.saturating_mul(radix);
    }
    children
}

pub fn tree_phases(params: &TreeParams) -> Result<Vec<PhaseLayout>> {
    let TreeParams { group_size: n, me, root, radix, fanin, fanout } = *params;
    if radix < 2 {
        return Err(CollLibError::Config(format!("invalid tree radix {radix}")));
    }
    if n == 0 || me >= n || root >= n {
        return Err(CollLibError::Config(format!(
            "member {me} or root {root} outside group of {n}"
        )));
    }

    let real = |v: usize| (v + root) % n;
    let v = (me + n - root) % n;
    let parent = tree_parent(v, radix).map(real);
    let children: SmallVec<MemberIndex> =
        tree_children(v, radix, n).into_iter().map(real).collect();

    let mut phases = Vec::with_capacity(2);
    let mut step_index = 1;
    if let Some(kind) = fanin {
        let phase = match (parent, children.is_empty()) {
            (None, true) => None,
            (Some(p), true) => Some(PhaseLayout::new(
                PlanMethod::SendTerminal,
                step_index,
                smallvec![p],
            )),
            (Some(p), false) => {
                if kind == FaninKind::Gather {
                    return Err(CollLibError::Unsupported("gather waypoints"));
                }
                let mut peers = children.clone();
                peers.push(p);
                Some(PhaseLayout::new(PlanMethod::ReduceWaypoint, step_index, peers))
            }
            (None, false) => {
                let method = match kind {
                    FaninKind::Reduce => PlanMethod::ReduceTerminal,
                    FaninKind::Gather => PlanMethod::RecvTerminal,
                };
                Some(PhaseLayout::new(method, step_index, children.clone()))
            }
        };
        phases.extend(phase);
        step_index += 1;
    }
    if let Some(kind) = fanout {
        let phase = match (parent, children.is_empty()) {
            (None, true) => None,
            (Some(p), true) => Some(PhaseLayout::new(
                PlanMethod::RecvTerminal,
                step_index,
                smallvec![p],
            )),
            (Some(p), false) => {
                if kind == FanoutKind::Scatter {
                    return Err(CollLibError::Unsupported("scatter waypoints"));
                }
                let mut peers: SmallVec<MemberIndex> = smallvec![p];
                peers.extend(children.iter().copied());
                Some(PhaseLayout::new(PlanMethod::BcastWaypoint, step_index, peers))
            }
            (None, false) => {
                let method = match kind {
                    FanoutKind::Bcast => PlanMethod::SendTerminal,
                    FanoutKind::Scatter => PlanMethod::ScatterTerminal,
                };
                Some(PhaseLayout::new(method, step_index, children.clone()))
            }
        };
        phases.extend(phase);
    }
    Ok(phases)
}
