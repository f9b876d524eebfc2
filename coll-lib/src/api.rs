//! Types used in public API

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CollLibError, Result};

pub type SmallVec<T> = ::smallvec::SmallVec<[T; 4]>;

/// Index of a member inside its group.
pub type MemberIndex = usize;

/// Identifies the host a member runs on.
pub type HostId = u32;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct GroupId(pub u16);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one collective invocation, shared by every member of the group.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct CollId(pub u8);

impl CollId {
    /// Next identifier in the 8-bit space. Zero is never handed out.
    pub fn next(self) -> CollId {
        match self.0.wrapping_add(1) {
            0 => CollId(1),
            id => CollId(id),
        }
    }
}

impl std::fmt::Display for CollId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of an operation cached inside a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId(pub u64);

pub const COLL_HEADER_LEN: usize = std::mem::size_of::<u64>();

/// The fixed 8-byte header carried by every collective message.
///
/// Layout (little endian word): bits 0..16 group id, 16..24 collective id,
/// 24..32 step index, 32..64 byte offset into the destination buffer.
/// The middle 16 bits form the "local id" used to match a message to the
/// step armed in a slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CollHeader(pub u64);

impl CollHeader {
    pub fn new(
        group_id: GroupId,
        coll_id: CollId,
        step_idx: u8,
        remote_offset: u32,
    ) -> Self {
        Self(
            group_id.0 as u64
                | (coll_id.0 as u64) << 16
                | (step_idx as u64) << 24
                | (remote_offset as u64) << 32,
        )
    }

    pub fn group_id(&self) -> GroupId {
        GroupId(self.0 as u16)
    }

    pub fn coll_id(&self) -> CollId {
        CollId((self.0 >> 16) as u8)
    }

    pub fn step_idx(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn local_id(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn remote_offset(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn to_bytes(&self) -> [u8; COLL_HEADER_LEN] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let word: [u8; COLL_HEADER_LEN] = data
            .get(..COLL_HEADER_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(CollLibError::InvalidParam("message shorter than header"))?;
        Ok(Self(u64::from_le_bytes(word)))
    }
}

/// Local id of a (collective, step) pair, as stored in [`CollHeader`].
pub fn local_id(coll_id: CollId, step_idx: u8) -> u16 {
    (step_idx as u16) << 8 | coll_id.0 as u16
}

impl std::fmt::Display for CollHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "COLLECTIVE [coll_id {} step_idx {} offset {}]",
            self.coll_id().0,
            self.step_idx(),
            self.remote_offset()
        )
    }
}

impl std::fmt::Debug for CollHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (group {})", self, self.group_id())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CollectiveModifiers: u16 {
        const SINGLE_SOURCE = 1 << 0;
        const SINGLE_DESTINATION = 1 << 1;
        const AGGREGATE = 1 << 2;
        const CONCATENATE = 1 << 3;
        const BARRIER = 1 << 4;
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum CollectiveKind {
    Barrier,
    Bcast,
    Scatter,
    Reduce,
    Gather,
    Allreduce,
    Alltoall,
    Allgather,
}

impl CollectiveKind {
    pub fn modifiers(&self) -> CollectiveModifiers {
        use CollectiveModifiers as M;
        match self {
            CollectiveKind::Barrier => M::AGGREGATE | M::BARRIER,
            CollectiveKind::Bcast | CollectiveKind::Scatter => M::SINGLE_SOURCE,
            CollectiveKind::Reduce => M::SINGLE_DESTINATION | M::AGGREGATE,
            CollectiveKind::Gather => M::SINGLE_DESTINATION,
            CollectiveKind::Allreduce => M::AGGREGATE,
            CollectiveKind::Alltoall => M::empty(),
            CollectiveKind::Allgather => M::CONCATENATE,
        }
    }

    /// Kinds whose send and receive buffers have the same size, the only ones
    /// accepting in-place operation.
    pub fn is_symmetric(&self) -> bool {
        matches!(
            self,
            CollectiveKind::Barrier
                | CollectiveKind::Bcast
                | CollectiveKind::Reduce
                | CollectiveKind::Allreduce
        )
    }
}

/// Key of the plan cache: what the collective does and who its root is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectiveType {
    pub kind: CollectiveKind,
    pub root: MemberIndex,
}

impl CollectiveType {
    pub fn modifiers(&self) -> CollectiveModifiers {
        self.kind.modifiers()
    }
}

/// Opaque datatype handle, interpreted only by the [`crate::Reducer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatatypeId(pub u64);

/// Opaque reduction operator handle, interpreted only by the [`crate::Reducer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReduceOpId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Datatype {
    /// Size of one element in bytes.
    pub len: usize,
    pub id: DatatypeId,
}

impl Datatype {
    pub fn new(len: usize, id: DatatypeId) -> Self {
        Self { len, id }
    }
}

/// Per-call parameters of a collective.
///
/// `count` is the number of elements contributed by one member (one block).
/// The buffers owned by the operation are sized from it according to the kind:
/// e.g. an alltoall member sends and receives `group_size` blocks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectiveParams {
    pub coll_type: CollectiveType,
    pub count: usize,
    pub datatype: Datatype,
    pub op: ReduceOpId,
    pub in_place: bool,
}

impl CollectiveParams {
    pub fn new(kind: CollectiveKind, count: usize, datatype: Datatype) -> Self {
        Self {
            coll_type: CollectiveType { kind, root: 0 },
            count,
            datatype,
            op: ReduceOpId(0),
            in_place: false,
        }
    }

    pub fn barrier() -> Self {
        Self::new(CollectiveKind::Barrier, 0, Datatype::new(0, DatatypeId(0)))
    }

    pub fn with_root(mut self, root: MemberIndex) -> Self {
        self.coll_type.root = root;
        self
    }

    pub fn with_op(mut self, op: ReduceOpId) -> Self {
        self.op = op;
        self
    }

    pub fn with_in_place(mut self, in_place: bool) -> Self {
        self.in_place = in_place;
        self
    }

    pub fn kind(&self) -> CollectiveKind {
        self.coll_type.kind
    }

    /// Bytes contributed by one member.
    pub fn block_length(&self) -> usize {
        self.count * self.datatype.len
    }

    /// Sizes of the (send, receive) buffers for a member of a group of `n`.
    pub fn buffer_lengths(&self, n: usize, me: MemberIndex) -> (usize, usize) {
        let blk = self.block_length();
        let is_root = me == self.coll_type.root;
        match self.kind() {
            CollectiveKind::Barrier
            | CollectiveKind::Bcast
            | CollectiveKind::Reduce
            | CollectiveKind::Allreduce => (blk, blk),
            CollectiveKind::Scatter => (if is_root { n * blk } else { 0 }, blk),
            CollectiveKind::Gather => (blk, if is_root { n * blk } else { 0 }),
            CollectiveKind::Alltoall => (n * blk, n * blk),
            CollectiveKind::Allgather => (blk, n * blk),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct IfaceFlags: u32 {
        const AM_SHORT = 1 << 0;
        const AM_BCOPY = 1 << 1;
        const AM_ZCOPY = 1 << 2;
    }
}

/// Layout of the contributions inside an incast (gather-style) message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IncastAlign {
    /// One contribution per message.
    #[default]
    None,
    /// Contributions start on 64-byte cache-line boundaries.
    Padded,
    /// Contributions are concatenated.
    Packed,
}

pub const INCAST_ALIGNMENT: usize = 64;

/// Capabilities of an endpoint, queried once when a plan is connected.
/// Sizes include the collective header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAttr {
    pub flags: IfaceFlags,
    pub max_short: usize,
    pub max_bcopy: usize,
    pub max_zcopy: usize,
    pub incast: IncastAlign,
    pub batch_cnt: u32,
}

impl Default for EndpointAttr {
    fn default() -> Self {
        Self {
            flags: IfaceFlags::AM_SHORT | IfaceFlags::AM_BCOPY | IfaceFlags::AM_ZCOPY,
            max_short: 128,
            max_bcopy: 8192,
            max_zcopy: 65536,
            incast: IncastAlign::None,
            batch_cnt: 1,
        }
    }
}

/// Handle of a registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemHandle(pub u64);

/// Token handed to the transport with every zero-copy send and returned
/// through [`crate::CollEngine::zcopy_completed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZcopyCompletion {
    pub group_id: GroupId,
    pub coll_id: CollId,
}

/// Handle of one started collective. Completed exactly once, with the same
/// status observed by every clone.
#[derive(Clone)]
pub struct CollRequest {
    coll_id: CollId,
    status: Arc<Mutex<Option<Result<()>>>>,
}

impl CollRequest {
    pub(crate) fn new(coll_id: CollId) -> Self {
        Self { coll_id, status: Arc::new(Mutex::new(None)) }
    }

    pub fn coll_id(&self) -> CollId {
        self.coll_id
    }

    pub fn is_completed(&self) -> bool {
        self.status.lock().is_some()
    }

    /// `None` while the collective is in flight.
    pub fn status(&self) -> Option<Result<()>> {
        self.status.lock().clone()
    }

    pub(crate) fn complete(&self, status: Result<()>) {
        let mut guard = self.status.lock();
        if guard.is_none() {
            *guard = Some(status);
        }
    }
}

impl std::fmt::Debug for CollRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollRequest")
            .field("coll_id", &self.coll_id)
            .field("status", &*self.status.lock())
            .finish()
    }
}
