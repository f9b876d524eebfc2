use std::sync::Arc;

use bytes::Bytes;
use dashmap::{DashMap, mapref::one::RefMut};
use tracing::{info, warn};

use crate::{
    api::{COLL_HEADER_LEN, CollHeader, GroupId, ZcopyCompletion},
    config::BuiltinConfig,
    error::{CollLibError, Result},
    group::{Group, GroupParams},
    interface::Reducer,
};

/// Entry point of the library: owns every group this process is a member of
/// and routes transport events to them.
pub struct CollEngine {
    config: Arc<BuiltinConfig>,
    reducer: Arc<dyn Reducer>,
    groups: DashMap<GroupId, Group>,
}

impl CollEngine {
    pub fn new(config: BuiltinConfig, reducer: Arc<dyn Reducer>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config: Arc::new(config), reducer, groups: DashMap::new() })
    }

    pub fn config(&self) -> &BuiltinConfig {
        &self.config
    }

    pub fn create_group(&self, params: GroupParams) -> Result<()> {
        let group_id = params.group_id;
        if self.groups.contains_key(&group_id) {
            return Err(CollLibError::Config(format!("group {group_id} already exists")));
        }
        let group = Group::new(params, Arc::clone(&self.config), Arc::clone(&self.reducer))?;
        self.groups.insert(group_id, group);
        Ok(())
    }

    pub fn destroy_group(&self, group_id: GroupId) -> Result<()> {
        let (_, group) = self
            .groups
            .remove(&group_id)
            .ok_or(CollLibError::InvalidParam("unknown group"))?;
        info!(%group_id, stats = ?group.stats(), "Destroying collective group");
        drop(group);
        Ok(())
    }

    /// Exclusive access to a group. Must not be held across calls into the
    /// engine for the same group.
    pub fn group(&self, group_id: GroupId) -> Result<RefMut<'_, GroupId, Group>> {
        self.groups
            .get_mut(&group_id)
            .ok_or(CollLibError::InvalidParam("unknown group"))
    }

    /// Active-message handler: `data` is the collective header followed by the
    /// payload.
    pub fn am_handler(&self, data: Bytes) -> Result<()> {
        let header = CollHeader::from_bytes(&data)?;
        let mut group = self.group(header.group_id()).inspect_err(|_| {
            warn!(%header, group_id = %header.group_id(), "Message for an unknown group");
        })?;
        group.handle_message(header, data.slice(COLL_HEADER_LEN..));
        Ok(())
    }

    /// Called by the transport when a zero-copy send finished locally.
    pub fn zcopy_completed(&self, comp: ZcopyCompletion, status: Result<()>) {
        match self.groups.get_mut(&comp.group_id) {
            Some(mut group) => group.zcopy_completed(comp.coll_id, status),
            None => warn!(group_id = %comp.group_id, "Zero-copy completion for an unknown group"),
        }
    }

    /// Retries blocked sends in every group.
    pub fn progress(&self) -> usize {
        self.groups.iter_mut().map(|mut group| group.progress()).sum()
    }
}
