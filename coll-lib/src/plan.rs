use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::{
    api::{
        COLL_HEADER_LEN, CollectiveType, EndpointAttr, GroupId, IfaceFlags, IncastAlign,
        MemberIndex, SmallVec,
    },
    config::BuiltinConfig,
    error::{CollLibError, Result},
    interface::{Endpoint, Transport},
    topo::{PhaseLayout, PlanMethod, TopologyType, build_layout},
};

/// Stands for "no limit" in [`Thresholds`].
pub const UNLIMITED: usize = usize::MAX;

/// Payload size limits of one phase, captured when its endpoints are connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Thresholds {
    pub max_short_one: usize,
    pub max_short_max: usize,
    pub max_bcopy_one: usize,
    pub max_bcopy_max: usize,
    pub max_zcopy_one: usize,
}

impl Thresholds {
    pub fn from_attr(attr: &EndpointAttr, config: &BuiltinConfig, max_reg: usize) -> Self {
        let (mut max_short_one, max_short_max) = if attr.flags.contains(IfaceFlags::AM_SHORT)
        {
            (
                attr.max_short.saturating_sub(COLL_HEADER_LEN),
                config.short_max_tx.saturating_sub(COLL_HEADER_LEN),
            )
        } else {
            (0, 0)
        };
        if max_short_one > max_short_max {
            max_short_one = max_short_max.saturating_sub(COLL_HEADER_LEN);
        }

        let mut max_bcopy_one = attr.max_bcopy.saturating_sub(COLL_HEADER_LEN);
        let (max_bcopy_max, max_zcopy_one) =
            if max_reg > 0 && attr.flags.contains(IfaceFlags::AM_ZCOPY) {
                let max_bcopy_max = config.bcopy_max_tx.saturating_sub(COLL_HEADER_LEN);
                if max_bcopy_one > max_bcopy_max {
                    max_bcopy_one = max_bcopy_max.saturating_sub(COLL_HEADER_LEN);
                }
                let mut max_zcopy_one = attr.max_zcopy.saturating_sub(COLL_HEADER_LEN);
                if max_zcopy_one < max_bcopy_max {
                    max_zcopy_one = max_bcopy_max.saturating_sub(COLL_HEADER_LEN);
                }
                (max_bcopy_max, max_zcopy_one)
            } else {
                (UNLIMITED, UNLIMITED)
            };

        Self { max_short_one, max_short_max, max_bcopy_one, max_bcopy_max, max_zcopy_one }
    }

    pub fn short_supported(&self) -> bool {
        self.max_short_max > 0
    }
}

/// One connected phase of a [`Plan`].
pub struct Phase {
    pub method: PlanMethod,
    pub step_index: u8,
    pub peers: SmallVec<MemberIndex>,
    pub thresholds: Thresholds,
    pub incast: IncastAlign,
    pub batch_cnt: u32,
    pub max_reg: usize,
    pub(crate) eps: SmallVec<Arc<dyn Endpoint>>,
}

impl Phase {
    fn connect(
        layout: PhaseLayout,
        config: &BuiltinConfig,
        transport: &dyn Transport,
    ) -> Result<Self> {
        let eps = layout
            .peers
            .iter()
            .map(|&peer| transport.connect(peer))
            .collect::<Result<SmallVec<_>>>()?;
        let attr = eps
            .first()
            .map(|ep| ep.attr())
            .ok_or(CollLibError::InvalidParam("phase without peers"))?;
        let max_reg = transport.max_reg();
        Ok(Self {
            method: layout.method,
            step_index: layout.step_index,
            peers: layout.peers,
            thresholds: Thresholds::from_attr(&attr, config, max_reg),
            incast: attr.incast,
            batch_cnt: attr.batch_cnt.max(1),
            max_reg,
            eps,
        })
    }

    pub fn ep_cnt(&self) -> usize {
        self.eps.len()
    }
}

impl std::fmt::Debug for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("method", &self.method)
            .field("step_index", &self.step_index)
            .field("peers", &self.peers)
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

/// Immutable sequence of phases for one collective type, shared by every
/// operation built from it.
#[derive(Debug)]
pub struct Plan {
    pub group_id: GroupId,
    pub coll_type: CollectiveType,
    pub topology: TopologyType,
    pub group_size: usize,
    pub my_index: MemberIndex,
    pub phases: Vec<Phase>,
}

impl Plan {
    pub fn build(
        group_id: GroupId,
        group_size: usize,
        my_index: MemberIndex,
        mixed_locality: bool,
        coll_type: CollectiveType,
        config: &BuiltinConfig,
        transport: &dyn Transport,
    ) -> Result<Arc<Plan>> {
        if coll_type.root >= group_size {
            return Err(CollLibError::Config(format!(
                "root {} outside group of {group_size}",
                coll_type.root
            )));
        }
        let (topology, layouts) =
            build_layout(&coll_type, group_size, my_index, mixed_locality, config)?;
        let phases = layouts
            .into_iter()
            .map(|layout| Phase::connect(layout, config, transport))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            %group_id,
            kind = ?coll_type.kind,
            ?topology,
            phases = phases.len(),
            "Built collective plan"
        );
        Ok(Arc::new(Plan { group_id, coll_type, topology, group_size, my_index, phases }))
    }
}

fn fmt_limit(limit: usize) -> String {
    if limit == UNLIMITED { "inf".to_string() } else { limit.to_string() }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Plan {:?} root {} ({:?}) member {}/{} group {}",
            self.coll_type.kind,
            self.coll_type.root,
            self.topology,
            self.my_index,
            self.group_size,
            self.group_id
        )?;
        for phase in &self.phases {
            let t = &phase.thresholds;
            writeln!(
                f,
                "  step {} {:<16} peers {:?} short {}/{} bcopy {}/{} zcopy {}",
                phase.step_index,
                phase.method.name(),
                phase.peers.as_slice(),
                t.max_short_one,
                t.max_short_max,
                t.max_bcopy_one,
                fmt_limit(t.max_bcopy_max),
                fmt_limit(t.max_zcopy_one),
            )?;
        }
        Ok(())
    }
}
