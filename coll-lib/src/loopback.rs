//! In-process transport connecting the members of one group through channels.
//! Deterministic and single-threaded: nothing is delivered until
//! [`LoopbackCluster::deliver`] drains the queues.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender, unbounded};
use dashmap::mapref::one::RefMut;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    api::{
        COLL_HEADER_LEN, CollHeader, CollRequest, CollectiveParams, EndpointAttr, GroupId,
        MemHandle, MemberIndex, OpId, ZcopyCompletion,
    },
    config::BuiltinConfig,
    engine::CollEngine,
    error::{CollLibError, Result},
    group::{Group, GroupParams},
    interface::{Endpoint, Reducer, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SendMode {
    Short,
    Bcopy,
    Zcopy,
}

/// One message accepted by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub from: MemberIndex,
    pub to: MemberIndex,
    pub header: CollHeader,
    pub len: usize,
    pub mode: SendMode,
}

struct Queue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Queue<T> {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

pub struct LoopbackFabric {
    attr: EndpointAttr,
    max_reg: usize,
    inboxes: Vec<Queue<Bytes>>,
    completions: Vec<Queue<ZcopyCompletion>>,
    /// Send attempts made by each member so far.
    attempts: Vec<AtomicUsize>,
    /// (member, attempt) pairs that fail with back-pressure.
    faults: Mutex<Vec<(MemberIndex, usize)>>,
    sent: Mutex<Vec<SentMessage>>,
    next_memh: AtomicU64,
}

impl LoopbackFabric {
    pub fn new(member_count: usize, attr: EndpointAttr, max_reg: usize) -> Arc<Self> {
        Arc::new(Self {
            attr,
            max_reg,
            inboxes: (0..member_count).map(|_| Queue::new()).collect(),
            completions: (0..member_count).map(|_| Queue::new()).collect(),
            attempts: (0..member_count).map(|_| AtomicUsize::new(0)).collect(),
            faults: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            next_memh: AtomicU64::new(1),
        })
    }

    pub fn member_count(&self) -> usize {
        self.inboxes.len()
    }

    pub fn transport(self: &Arc<Self>, member: MemberIndex) -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport { fabric: Arc::clone(self), member })
    }

    /// Makes the `nth` next send attempt of `member` (0 = the very next one)
    /// fail with [`CollLibError::NoResource`].
    pub fn inject_no_resource(&self, member: MemberIndex, nth: usize) {
        let attempt = self.attempts[member].load(Ordering::Relaxed) + nth;
        self.faults.lock().push((member, attempt));
    }

    /// Every message accepted so far, in send order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    fn send(
        &self,
        from: MemberIndex,
        to: MemberIndex,
        mode: SendMode,
        header: CollHeader,
        payload: &[u8],
    ) -> Result<()> {
        let attempt = self.attempts[from].fetch_add(1, Ordering::Relaxed);
        {
            let mut faults = self.faults.lock();
            if let Some(pos) = faults.iter().position(|&f| f == (from, attempt)) {
                faults.swap_remove(pos);
                return Err(CollLibError::NoResource);
            }
        }
        let inbox = self
            .inboxes
            .get(to)
            .ok_or(CollLibError::Transport(format!("no member {to}")))?;
        let mut msg = BytesMut::with_capacity(COLL_HEADER_LEN + payload.len());
        msg.put_slice(&header.to_bytes());
        msg.put_slice(payload);
        inbox
            .tx
            .send(msg.freeze())
            .map_err(|e| CollLibError::Transport(e.to_string()))?;
        self.sent.lock().push(SentMessage { from, to, header, len: payload.len(), mode });
        Ok(())
    }
}

struct LoopbackTransport {
    fabric: Arc<LoopbackFabric>,
    member: MemberIndex,
}

impl Transport for LoopbackTransport {
    fn connect(&self, member: MemberIndex) -> Result<Arc<dyn Endpoint>> {
        if member >= self.fabric.member_count() {
            return Err(CollLibError::Transport(format!("no member {member}")));
        }
        Ok(Arc::new(LoopbackEndpoint {
            fabric: Arc::clone(&self.fabric),
            from: self.member,
            to: member,
        }))
    }

    fn max_reg(&self) -> usize {
        self.fabric.max_reg
    }

    fn mem_reg(&self, buffer: &[u8]) -> Result<MemHandle> {
        if buffer.len() > self.fabric.max_reg {
            return Err(CollLibError::Unsupported("region larger than max_reg"));
        }
        Ok(MemHandle(self.fabric.next_memh.fetch_add(1, Ordering::Relaxed)))
    }

    fn mem_dereg(&self, _memh: MemHandle) -> Result<()> {
        Ok(())
    }
}

struct LoopbackEndpoint {
    fabric: Arc<LoopbackFabric>,
    from: MemberIndex,
    to: MemberIndex,
}

impl LoopbackEndpoint {
    fn check_len(&self, len: usize, limit: usize) -> Result<()> {
        if COLL_HEADER_LEN + len > limit {
            return Err(CollLibError::InvalidParam("message exceeds the endpoint limit"));
        }
        Ok(())
    }
}

impl Endpoint for LoopbackEndpoint {
    fn attr(&self) -> EndpointAttr {
        self.fabric.attr
    }

    fn am_short(&self, header: CollHeader, payload: &[u8]) -> Result<()> {
        self.check_len(payload.len(), self.fabric.attr.max_short)?;
        self.fabric.send(self.from, self.to, SendMode::Short, header, payload)
    }

    fn am_bcopy(&self, header: CollHeader, payload: &[u8]) -> Result<usize> {
        self.check_len(payload.len(), self.fabric.attr.max_bcopy)?;
        self.fabric.send(self.from, self.to, SendMode::Bcopy, header, payload)?;
        Ok(payload.len())
    }

    fn am_zcopy(
        &self,
        header: CollHeader,
        payload: &[u8],
        _memh: MemHandle,
        comp: ZcopyCompletion,
    ) -> Result<()> {
        self.check_len(payload.len(), self.fabric.attr.max_zcopy)?;
        self.fabric.send(self.from, self.to, SendMode::Zcopy, header, payload)?;
        self.fabric.completions[self.from]
            .tx
            .send(comp)
            .map_err(|e| CollLibError::Transport(e.to_string()))
    }
}

/// One engine per member, all joined to the same group over one fabric.
pub struct LoopbackCluster {
    fabric: Arc<LoopbackFabric>,
    engines: Vec<CollEngine>,
    group_id: GroupId,
}

impl LoopbackCluster {
    pub fn new(
        member_count: usize,
        attr: EndpointAttr,
        max_reg: usize,
        config: BuiltinConfig,
        reducer: Arc<dyn Reducer>,
    ) -> Result<Self> {
        let fabric = LoopbackFabric::new(member_count, attr, max_reg);
        let group_id = GroupId(1);
        let engines = (0..member_count)
            .map(|member| {
                let engine = CollEngine::new(config.clone(), Arc::clone(&reducer))?;
                engine.create_group(GroupParams {
                    group_id,
                    member_count,
                    my_index: member,
                    member_hosts: Vec::new(),
                    transport: fabric.transport(member),
                })?;
                Ok(engine)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { fabric, engines, group_id })
    }

    pub fn fabric(&self) -> &Arc<LoopbackFabric> {
        &self.fabric
    }

    pub fn member_count(&self) -> usize {
        self.engines.len()
    }

    pub fn engine(&self, member: MemberIndex) -> &CollEngine {
        &self.engines[member]
    }

    pub fn group(&self, member: MemberIndex) -> Result<RefMut<'_, GroupId, Group>> {
        self.engines[member].group(self.group_id)
    }

    /// Creates the same collective on every member.
    pub fn create_all(&self, params: &CollectiveParams) -> Result<Vec<OpId>> {
        (0..self.member_count())
            .map(|member| self.group(member)?.collective_create(params.clone()))
            .collect()
    }

    pub fn start_all(&self, ops: &[OpId]) -> Result<Vec<CollRequest>> {
        ops.iter()
            .enumerate()
            .map(|(member, &op)| self.group(member)?.collective_start(op))
            .collect()
    }

    /// Hands every queued message and completion to its engine, then runs
    /// progress on every member. Returns the number of events delivered.
    pub fn deliver(&self) -> Result<usize> {
        let mut events = 0;
        for (member, engine) in self.engines.iter().enumerate() {
            while let Ok(msg) = self.fabric.inboxes[member].rx.try_recv() {
                engine.am_handler(msg)?;
                events += 1;
            }
            while let Ok(comp) = self.fabric.completions[member].rx.try_recv() {
                engine.zcopy_completed(comp, Ok(()));
                events += 1;
            }
        }
        for engine in &self.engines {
            events += engine.progress();
        }
        Ok(events)
    }

    /// Delivers until every request completed. Fails if that takes more than
    /// `max_rounds` rounds.
    pub fn run(&self, requests: &[CollRequest], max_rounds: usize) -> Result<usize> {
        for round in 0..max_rounds {
            if requests.iter().all(CollRequest::is_completed) {
                return Ok(round);
            }
            self.deliver()?;
        }
        if requests.iter().all(CollRequest::is_completed) {
            return Ok(max_rounds);
        }
        Err(CollLibError::Custom("collectives did not complete"))
    }
}
