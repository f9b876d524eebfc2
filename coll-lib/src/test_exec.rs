use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;
use parking_lot::Mutex;
use proptest::prelude::*;

use crate::{
    api::{
        CollHeader, CollId, CollectiveKind, CollectiveParams, EndpointAttr, GroupId, IfaceFlags,
        IncastAlign, MemHandle, MemberIndex,
    },
    config::BuiltinConfig,
    engine::CollEngine,
    error::{CollLibError, Result},
    group::GroupParams,
    interface::{Endpoint, MockEndpoint, MockTransport, Transport},
    op::{RecvStrategy, SelectorInput, StepFlags, select_recv_strategy, step_send_flags},
    plan::{Thresholds, UNLIMITED},
    reducer::{BasicDatatype, BasicOp, BasicReducer, i32_bytes, i32_values},
    topo::PlanMethod,
};

const GROUP: GroupId = GroupId(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sent {
    to: MemberIndex,
    step_idx: u8,
    offset: u32,
    len: usize,
}

/// Records what the mocked endpoints send; fails chosen attempts with
/// back-pressure.
#[derive(Default)]
struct Wire {
    sent: Mutex<Vec<Sent>>,
    attempts: AtomicUsize,
    fail_at: Mutex<Vec<usize>>,
}

impl Wire {
    fn send(&self, to: MemberIndex, header: CollHeader, payload: &[u8]) -> Result<usize> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut fail_at = self.fail_at.lock();
        if let Some(pos) = fail_at.iter().position(|&a| a == attempt) {
            fail_at.remove(pos);
            return Err(CollLibError::NoResource);
        }
        self.sent.lock().push(Sent {
            to,
            step_idx: header.step_idx(),
            offset: header.remote_offset(),
            len: payload.len(),
        });
        Ok(payload.len())
    }

    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }
}

fn mock_transport(attr: EndpointAttr, max_reg: usize, wire: &Arc<Wire>) -> Arc<dyn Transport> {
    limited_reg_transport(attr, max_reg, wire, usize::MAX)
}

/// Like [`mock_transport`], but only the first `registrations` calls to
/// `mem_reg` succeed.
fn limited_reg_transport(
    attr: EndpointAttr,
    max_reg: usize,
    wire: &Arc<Wire>,
    registrations: usize,
) -> Arc<dyn Transport> {
    let mut transport = MockTransport::new();
    let wire = Arc::clone(wire);
    transport.expect_connect().returning(move |to| {
        let mut ep = MockEndpoint::new();
        ep.expect_attr().return_const(attr);
        let w = Arc::clone(&wire);
        ep.expect_am_short().returning(move |h, p| w.send(to, h, p).map(|_| ()));
        let w = Arc::clone(&wire);
        ep.expect_am_bcopy().returning(move |h, p| w.send(to, h, p));
        let w = Arc::clone(&wire);
        ep.expect_am_zcopy().returning(move |h, p, _, _| w.send(to, h, p).map(|_| ()));
        Ok(Arc::new(ep) as Arc<dyn Endpoint>)
    });
    transport.expect_max_reg().return_const(max_reg);
    let calls = AtomicUsize::new(0);
    transport.expect_mem_reg().returning(move |_| {
        if calls.fetch_add(1, Ordering::SeqCst) < registrations {
            Ok(MemHandle(7))
        } else {
            Err(CollLibError::NoResource)
        }
    });
    transport.expect_mem_dereg().returning(|_| Ok(()));
    Arc::new(transport)
}

fn engine_with(
    config: BuiltinConfig,
    member_count: usize,
    my_index: MemberIndex,
    transport: Arc<dyn Transport>,
) -> CollEngine {
    let engine = CollEngine::new(config, Arc::new(BasicReducer)).unwrap();
    engine
        .create_group(GroupParams {
            group_id: GROUP,
            member_count,
            my_index,
            member_hosts: Vec::new(),
            transport,
        })
        .unwrap();
    engine
}

/// Buffered only, 64-byte fragments.
fn bcopy_attr() -> EndpointAttr {
    EndpointAttr { flags: IfaceFlags::AM_BCOPY, max_bcopy: 72, ..Default::default() }
}

fn i32_params(kind: CollectiveKind, count: usize) -> CollectiveParams {
    CollectiveParams::new(kind, count, BasicDatatype::I32.datatype()).with_op(BasicOp::Sum.id())
}

fn message(coll_id: CollId, step_idx: u8, offset: usize, values: &[i32]) -> (CollHeader, Bytes) {
    (
        CollHeader::new(GROUP, coll_id, step_idx, offset as u32),
        Bytes::from(i32_bytes(values)),
    )
}

/// The three fragments of a 40-element i32 message.
const FRAGMENTS: [(usize, usize); 3] = [(0, 16), (64, 16), (128, 8)];

#[test]
fn test_resume_after_backpressure_on_single_peer() {
    let wire = Arc::new(Wire::default());
    wire.fail_at.lock().push(1);
    let engine = engine_with(BuiltinConfig::default(), 2, 0, mock_transport(bcopy_attr(), 0, &wire));
    let mut group = engine.group(GROUP).unwrap();
    let op = group.collective_create(i32_params(CollectiveKind::Bcast, 40)).unwrap();
    group.send_buffer_mut(op).unwrap().copy_from_slice(&i32_bytes(&[3; 40]));

    let req = group.collective_start(op).unwrap();
    assert!(!req.is_completed());
    assert_eq!(wire.sent().len(), 1);

    assert_eq!(group.progress(), 1);
    assert_eq!(req.status(), Some(Ok(())));
    let offsets: Vec<_> = wire.sent().iter().map(|s| (s.offset, s.len)).collect();
    assert_eq!(offsets, vec![(0, 64), (64, 64), (128, 32)]);
    assert_eq!(group.progress(), 0);
}

fn recursive_config() -> BuiltinConfig {
    BuiltinConfig { recursive_factor: 5, ..Default::default() }
}

/// Sends of the first step of a 25-member recursive allreduce, optionally
/// blocking the given attempts.
fn first_step_sends(fail_at: &[usize]) -> Vec<Sent> {
    let wire = Arc::new(Wire::default());
    wire.fail_at.lock().extend_from_slice(fail_at);
    let engine = engine_with(recursive_config(), 25, 0, mock_transport(bcopy_attr(), 0, &wire));
    let mut group = engine.group(GROUP).unwrap();
    let op = group.collective_create(i32_params(CollectiveKind::Allreduce, 40)).unwrap();
    let req = group.collective_start(op).unwrap();
    for _ in 0..fail_at.len() {
        group.progress();
    }
    assert!(!req.is_completed());
    wire.sent()
}

#[test]
fn test_resume_after_backpressure_on_multi_peer() {
    let clean = first_step_sends(&[]);
    assert_eq!(clean.len(), 12);
    assert_eq!(
        clean.iter().map(|s| s.to).collect::<Vec<_>>(),
        vec![1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4]
    );
    // Second fragment to the third peer, then the retry of the last one.
    assert_eq!(first_step_sends(&[7]), clean);
    assert_eq!(first_step_sends(&[11, 12]), clean);
    assert_eq!(first_step_sends(&[0]), clean);
}

#[test]
fn test_pending_counter_buffered_exchange() {
    let wire = Arc::new(Wire::default());
    let engine = engine_with(recursive_config(), 25, 0, mock_transport(bcopy_attr(), 0, &wire));
    let mut group = engine.group(GROUP).unwrap();
    let op = group.collective_create(i32_params(CollectiveKind::Allreduce, 40)).unwrap();
    group.send_buffer_mut(op).unwrap().copy_from_slice(&i32_bytes(&[1; 40]));
    let req = group.collective_start(op).unwrap();
    let coll_id = req.coll_id();
    assert_eq!(wire.sent().len(), 12);

    // Early message of the second step: held until that step is armed.
    let (header, payload) = message(coll_id, 2, 0, &[1; 16]);
    group.handle_message(header, payload);
    assert_eq!(group.stats().messages_held, 1);

    let arrivals: Vec<_> = (0..4)
        .flat_map(|_| FRAGMENTS)
        .map(|(offset, count)| message(coll_id, 1, offset, &vec![1; count]))
        .collect();
    for (i, (header, payload)) in arrivals.into_iter().enumerate() {
        group.handle_message(header, payload);
        let expected = if i < 11 { 12 } else { 24 };
        assert_eq!(wire.sent().len(), expected, "after arrival {i}");
    }
    assert!(wire.sent()[12..].iter().all(|s| s.step_idx == 2));

    // One second-step message was replayed: eleven remain.
    let arrivals: Vec<_> = (0..4)
        .flat_map(|_| FRAGMENTS)
        .skip(1)
        .map(|(offset, count)| message(coll_id, 2, offset, &vec![1; count]))
        .collect();
    for (header, payload) in arrivals {
        assert!(!req.is_completed());
        group.handle_message(header, payload);
    }
    assert_eq!(req.status(), Some(Ok(())));
    assert_eq!(i32_values(group.recv_buffer(op).unwrap()), vec![9; 40]);
}

#[test]
fn test_pending_counter_zcopy_exchange() {
    let wire = Arc::new(Wire::default());
    let attr = EndpointAttr {
        flags: IfaceFlags::AM_BCOPY | IfaceFlags::AM_ZCOPY,
        max_bcopy: 72,
        max_zcopy: 72,
        ..Default::default()
    };
    let config = BuiltinConfig { bcopy_max_tx: 72, ..recursive_config() };
    let engine = engine_with(config, 25, 0, mock_transport(attr, 1 << 20, &wire));
    let mut group = engine.group(GROUP).unwrap();
    let op = group.collective_create(i32_params(CollectiveKind::Allreduce, 40)).unwrap();
    let first = &group.operation(op).unwrap().steps()[0];
    assert!(first.flags().contains(StepFlags::SEND_AM_ZCOPY | StepFlags::FRAGMENTED));
    assert_eq!(first.fragments(), 3);
    assert_eq!(first.recv_strategy(), RecvStrategy::ReduceMany(IncastAlign::None));

    let req = group.collective_start(op).unwrap();
    let coll_id = req.coll_id();
    assert_eq!(wire.sent().len(), 12);

    for _ in 0..4 {
        for (offset, count) in FRAGMENTS {
            let (header, payload) = message(coll_id, 1, offset, &vec![1; count]);
            group.handle_message(header, payload);
        }
    }
    assert_eq!(wire.sent().len(), 12);
    for i in 0..12 {
        group.zcopy_completed(coll_id, Ok(()));
        let expected = if i < 11 { 12 } else { 24 };
        assert_eq!(wire.sent().len(), expected, "after completion {i}");
    }

    // Completions of another collective are ignored.
    group.zcopy_completed(CollId(coll_id.0 + 1), Ok(()));
    assert!(!req.is_completed());
}

#[test]
fn test_incast_message_carries_batch() {
    for align in [IncastAlign::Padded, IncastAlign::Packed] {
        let wire = Arc::new(Wire::default());
        let attr = EndpointAttr { incast: align, batch_cnt: 2, ..Default::default() };
        let engine =
            engine_with(BuiltinConfig::default(), 3, 0, mock_transport(attr, 0, &wire));
        let mut group = engine.group(GROUP).unwrap();
        let op = group.collective_create(i32_params(CollectiveKind::Reduce, 4)).unwrap();
        group.send_buffer_mut(op).unwrap().copy_from_slice(&i32_bytes(&[1, 2, 3, 4]));
        let req = group.collective_start(op).unwrap();
        assert!(!req.is_completed());

        let mut payload = i32_bytes(&[10; 4]);
        if align == IncastAlign::Padded {
            payload.resize(64, 0);
        }
        payload.extend(i32_bytes(&[100; 4]));
        let header = CollHeader::new(GROUP, req.coll_id(), 1, 0);
        group.handle_message(header, Bytes::from(payload));

        assert_eq!(req.status(), Some(Ok(())), "{align:?}");
        assert_eq!(i32_values(group.recv_buffer(op).unwrap()), vec![111, 112, 113, 114]);
        assert!(wire.sent().is_empty());
    }
}

#[test]
fn test_member_hosts_steer_topology() {
    let wire = Arc::new(Wire::default());
    let engine = CollEngine::new(BuiltinConfig::default(), Arc::new(BasicReducer)).unwrap();
    let params = |member_hosts: Vec<u32>| GroupParams {
        group_id: GROUP,
        member_count: 8,
        my_index: 4,
        member_hosts,
        transport: mock_transport(bcopy_attr(), 0, &wire),
    };
    assert!(matches!(
        engine.create_group(params(vec![0, 1, 2])),
        Err(CollLibError::Config(_))
    ));

    engine.create_group(params(vec![0, 0, 0, 0, 1, 1, 1, 1])).unwrap();
    let mut group = engine.group(GROUP).unwrap();
    let coll = i32_params(CollectiveKind::Allreduce, 4);
    group.collective_create(coll.clone()).unwrap();
    let plan = group.plan(&coll.coll_type).unwrap();
    assert_eq!(plan.topology, crate::topo::TopologyType::TreeFaninFanout);
}

#[test]
fn test_fatal_send_error_fails_request() {
    let mut transport = MockTransport::new();
    transport.expect_connect().returning(|_| {
        let mut ep = MockEndpoint::new();
        ep.expect_attr().return_const(EndpointAttr::default());
        ep.expect_am_short()
            .returning(|_, _| Err(CollLibError::Transport("link down".to_string())));
        Ok(Arc::new(ep) as Arc<dyn Endpoint>)
    });
    transport.expect_max_reg().return_const(0usize);
    let engine = engine_with(BuiltinConfig::default(), 4, 0, Arc::new(transport));
    let mut group = engine.group(GROUP).unwrap();
    let op = group.collective_create(i32_params(CollectiveKind::Bcast, 4)).unwrap();
    let req = group.collective_start(op).unwrap();
    assert_eq!(
        req.status(),
        Some(Err(CollLibError::Transport("link down".to_string())))
    );
    assert!(!group.operation(op).unwrap().is_active());

    // The operation can be started again.
    let again = group.collective_start(op).unwrap();
    assert!(again.status().is_some_and(|s| s.is_err()));
}

fn thresholds(short: usize, bcopy: usize, zcopy: usize, bcopy_max: usize) -> Thresholds {
    Thresholds {
        max_short_one: short,
        max_short_max: if short > 0 { 2 * short } else { 0 },
        max_bcopy_one: bcopy,
        max_bcopy_max: bcopy_max,
        max_zcopy_one: zcopy,
    }
}

#[test]
fn test_send_mode_selection() {
    let t = thresholds(120, 1000, 4000, 2000);
    let flags = |len| step_send_flags(len, 4, &t, 1 << 20, true).unwrap();

    assert_eq!(flags(0).flags, StepFlags::SEND_AM_SHORT);
    assert_eq!(flags(120).flags, StepFlags::SEND_AM_SHORT);

    let short = flags(200);
    assert_eq!(short.flags, StepFlags::SEND_AM_SHORT | StepFlags::FRAGMENTED);
    assert_eq!((short.fragment_length, short.fragments), (120, 2));

    assert_eq!(flags(1000).flags, StepFlags::SEND_AM_BCOPY);
    let bcopy = flags(1800);
    assert_eq!(bcopy.flags, StepFlags::SEND_AM_BCOPY | StepFlags::FRAGMENTED);
    assert_eq!(bcopy.fragments, 2);

    assert_eq!(flags(3000).flags, StepFlags::SEND_AM_ZCOPY);
    let zcopy = flags(10_000);
    assert_eq!(zcopy.flags, StepFlags::SEND_AM_ZCOPY | StepFlags::FRAGMENTED);
    assert_eq!((zcopy.fragment_length, zcopy.fragments), (4000, 3));

    // Too large to register, or zero-copy not allowed: buffered.
    let big = step_send_flags(10_000, 4, &t, 5000, true).unwrap();
    assert_eq!(big.flags, StepFlags::SEND_AM_BCOPY | StepFlags::FRAGMENTED);
    let no_zcopy = step_send_flags(3000, 4, &t, 1 << 20, false).unwrap();
    assert_eq!(no_zcopy.flags, StepFlags::SEND_AM_BCOPY | StepFlags::FRAGMENTED);
}

#[test]
fn test_short_needs_single_fragment_room() {
    // Short fragments of zero bytes cannot carry data: use buffered sends.
    let t = Thresholds {
        max_short_one: 0,
        max_short_max: 248,
        max_bcopy_one: 1000,
        max_bcopy_max: UNLIMITED,
        max_zcopy_one: UNLIMITED,
    };
    let sizing = step_send_flags(16, 4, &t, 0, true).unwrap();
    assert_eq!(sizing.flags, StepFlags::SEND_AM_BCOPY);
    assert_eq!((sizing.fragment_length, sizing.fragments), (16, 1));
    assert_eq!(step_send_flags(0, 4, &t, 0, true).unwrap().flags, StepFlags::SEND_AM_BCOPY);
}

#[test]
fn test_zcopy_upgrade_is_all_or_nothing() {
    let wire = Arc::new(Wire::default());
    let attr = EndpointAttr {
        flags: IfaceFlags::AM_BCOPY | IfaceFlags::AM_ZCOPY,
        max_bcopy: 72,
        ..Default::default()
    };
    let config = BuiltinConfig { mem_reg_opt_cnt: 1, ..Default::default() };
    // Registers the send buffer of the first step, then fails on the receive
    // buffer the second step sends from.
    let engine = engine_with(config, 4, 0, limited_reg_transport(attr, 1 << 20, &wire, 1));
    let mut group = engine.group(GROUP).unwrap();
    let op = group.collective_create(i32_params(CollectiveKind::Allreduce, 40)).unwrap();
    let req = group.collective_start(op).unwrap();
    assert!(!req.is_completed());
    assert!(!wire.sent().is_empty());

    let steps = group.operation(op).unwrap().steps();
    assert_eq!(steps.len(), 2);
    for step in steps {
        assert!(step.flags().contains(StepFlags::SEND_AM_BCOPY));
        assert!(!step.flags().contains(StepFlags::SEND_AM_ZCOPY));
    }
}

#[test]
fn test_fragments_are_whole_elements() {
    let t = thresholds(0, 100, UNLIMITED, UNLIMITED);
    let sizing = step_send_flags(240, 24, &t, 0, true).unwrap();
    assert_eq!((sizing.fragment_length, sizing.fragments), (96, 3));
    assert!(matches!(
        step_send_flags(240, 128, &t, 0, true),
        Err(CollLibError::Unsupported(_))
    ));
}

proptest! {
    #[test]
    fn fragmentation_law(len in 1usize..20_000, dt_len in prop::sample::select(vec![1usize, 2, 4, 8])) {
        let len = len * dt_len;
        let t = thresholds(56, 1000, 4096, 8192);
        let sizing = step_send_flags(len, dt_len, &t, 1 << 20, true).unwrap();
        let frag = sizing.fragment_length;
        prop_assert!(frag > 0);
        prop_assert_eq!(frag % dt_len, 0);
        prop_assert_eq!(sizing.fragments, len.div_ceil(frag));
        let sizes: Vec<usize> = (0..sizing.fragments)
            .map(|i| frag.min(len - i * frag))
            .collect();
        prop_assert_eq!(sizes.iter().sum::<usize>(), len);
        prop_assert_eq!(*sizes.last().unwrap(), len - frag * (sizing.fragments - 1));
    }

    #[test]
    fn header_round_trip(group in any::<u16>(), coll in any::<u8>(), step in any::<u8>(), offset in any::<u32>()) {
        let header = CollHeader::new(GroupId(group), CollId(coll), step, offset);
        let decoded = CollHeader::from_bytes(&header.to_bytes()).unwrap();
        prop_assert_eq!(decoded.group_id(), GroupId(group));
        prop_assert_eq!(decoded.coll_id(), CollId(coll));
        prop_assert_eq!(decoded.step_idx(), step);
        prop_assert_eq!(decoded.remote_offset(), offset);
        prop_assert_eq!(decoded.local_id(), crate::api::local_id(CollId(coll), step));
    }
}

fn input(method: PlanMethod) -> SelectorInput {
    SelectorInput {
        method,
        fragmented: false,
        pipelined: false,
        single_msg: true,
        ep_cnt: 1,
        last_step: false,
        nonzero_length: true,
        zcopy: false,
        barrier: false,
        incast: IncastAlign::None,
    }
}

#[test]
fn test_selector_table() {
    use RecvStrategy as S;
    let select = |input: SelectorInput| select_recv_strategy(&input);

    let waypoint = SelectorInput { ep_cnt: 3, single_msg: false, ..input(PlanMethod::BcastWaypoint) };
    assert_eq!(select(waypoint), S::RecvOneThenSend);
    assert_eq!(select(SelectorInput { fragmented: true, ..waypoint }), S::Recv1ManyThenSendNonZcopy);
    assert_eq!(
        select(SelectorInput { fragmented: true, pipelined: true, ..waypoint }),
        S::RecvManyThenSendPipe
    );
    assert_eq!(select(SelectorInput { zcopy: true, ..waypoint }), S::Recv1ManyThenSendZcopy);
    let barrier = SelectorInput { nonzero_length: false, barrier: true, last_step: true, ..waypoint };
    assert_eq!(select(barrier), S::BarrierRecvOneThenSend);
    assert_eq!(select(SelectorInput { barrier: false, ..barrier }), S::WaitOneThenSend);
    // Nothing to forward: the zero-copy handler is never chosen.
    assert_eq!(select(SelectorInput { zcopy: true, ..barrier }), S::BarrierRecvOneThenSend);

    let reduce = SelectorInput { ep_cnt: 4, single_msg: false, ..input(PlanMethod::ReduceWaypoint) };
    let padded = SelectorInput { incast: IncastAlign::Padded, ..reduce };
    assert_eq!(select(padded), S::ReduceManyThenSendNonZcopy(IncastAlign::Padded));
    assert_eq!(select(SelectorInput { zcopy: true, ..reduce }), S::ReduceManyThenSendZcopy(IncastAlign::None));
    assert_eq!(select(SelectorInput { ep_cnt: 2, ..reduce }), S::ReduceOneThenSend);
    assert_eq!(select(SelectorInput { nonzero_length: false, ..reduce }), S::WaitManyThenSend);

    let exchange = input(PlanMethod::ReduceRecursive);
    assert_eq!(select(exchange), S::ReduceOne);
    assert_eq!(select(SelectorInput { zcopy: true, ..exchange }), S::ReduceMany(IncastAlign::None));
    let last_barrier =
        SelectorInput { nonzero_length: false, barrier: true, last_step: true, ..exchange };
    assert_eq!(select(last_barrier), S::BarrierOne);
    assert_eq!(select(SelectorInput { last_step: false, ..last_barrier }), S::WaitOne);

    let terminal = SelectorInput { single_msg: false, ep_cnt: 3, ..input(PlanMethod::ReduceTerminal) };
    assert_eq!(select(terminal), S::ReduceMany(IncastAlign::None));
    assert_eq!(
        select(SelectorInput { nonzero_length: false, barrier: true, ..terminal }),
        S::BarrierMany(IncastAlign::None)
    );
    assert_eq!(select(input(PlanMethod::Pairwise)), S::RecvOne);
    let fragmented = SelectorInput { fragmented: true, single_msg: false, ..input(PlanMethod::RecvTerminal) };
    assert_eq!(select(fragmented), S::RecvMany);
}
