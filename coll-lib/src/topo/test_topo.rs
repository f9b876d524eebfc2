use std::collections::HashSet;

use proptest::prelude::*;

use crate::{
    api::{CollectiveKind, CollectiveType},
    config::BuiltinConfig,
    error::CollLibError,
    topo::*,
};

fn methods(phases: &[PhaseLayout]) -> Vec<PlanMethod> {
    phases.iter().map(|p| p.method).collect()
}

#[test]
fn power_of_detection() {
    assert_eq!(power_of(1, 2), Some(0));
    assert_eq!(power_of(8, 2), Some(3));
    assert_eq!(power_of(25, 5), Some(2));
    assert_eq!(power_of(6, 2), None);
    assert_eq!(power_of(9, 2), None);
    assert_eq!(power_of(4, 1), None);
}

#[test]
fn recursive_doubling_peers() {
    let phases = recursive_phases(8, 5, 2).unwrap();
    let peers: Vec<_> = phases.iter().map(|p| p.peers[0]).collect();
    assert_eq!(peers, vec![4, 7, 1]);
    assert_eq!(
        phases.iter().map(|p| p.step_index).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[test]
fn recursive_rejects_non_power() {
    assert!(matches!(recursive_phases(6, 0, 2), Err(CollLibError::Config(_))));
    assert!(matches!(recursive_phases(9, 0, 2), Err(CollLibError::Config(_))));
}

#[test]
fn bruck_phase_counts() {
    assert_eq!(bruck_phase_count(1), 0);
    assert_eq!(bruck_phase_count(2), 1);
    assert_eq!(bruck_phase_count(5), 3);
    assert_eq!(bruck_phase_count(8), 3);
    assert_eq!(bruck_phase_count(9), 4);
}

#[test]
fn pairwise_peers() {
    let phases = pairwise_phases(5, 3).unwrap();
    assert_eq!(phases.len(), 1);
    assert_eq!(phases[0].peers.as_slice(), &[4, 0, 1, 2]);
    assert!(pairwise_phases(1, 0).unwrap().is_empty());
}

#[test]
fn knomial_tree_shape() {
    // radix 4 over 6 members: 0 -> {1, 2, 3, 4}, 4 -> {5}
    assert_eq!(tree_children(0, 4, 6), vec![1, 2, 3, 4]);
    assert_eq!(tree_children(4, 4, 6), vec![5]);
    assert!(tree_children(1, 4, 6).is_empty());
    assert_eq!(tree_parent(5, 4), Some(4));
    assert_eq!(tree_parent(4, 4), Some(0));
    assert_eq!(tree_parent(0, 4), None);
}

#[test]
fn fanin_fanout_roles() {
    let params = |me| TreeParams {
        group_size: 6,
        me,
        root: 0,
        radix: 4,
        fanin: Some(FaninKind::Reduce),
        fanout: Some(FanoutKind::Bcast),
    };

    let root = tree_phases(&params(0)).unwrap();
    assert_eq!(
        methods(&root),
        vec![PlanMethod::ReduceTerminal, PlanMethod::SendTerminal]
    );
    assert_eq!(root[0].peers.as_slice(), &[1, 2, 3, 4]);

    let waypoint = tree_phases(&params(4)).unwrap();
    assert_eq!(
        methods(&waypoint),
        vec![PlanMethod::ReduceWaypoint, PlanMethod::BcastWaypoint]
    );
    assert_eq!(waypoint[0].peers.as_slice(), &[5, 0]);
    assert_eq!(waypoint[1].peers.as_slice(), &[0, 5]);
    assert_eq!(waypoint[1].step_index, 2);

    let leaf = tree_phases(&params(5)).unwrap();
    assert_eq!(methods(&leaf), vec![PlanMethod::SendTerminal, PlanMethod::RecvTerminal]);
    assert_eq!(leaf[0].peers.as_slice(), &[4]);
}

#[test]
fn tree_rotates_around_root() {
    let params = TreeParams {
        group_size: 4,
        me: 2,
        root: 2,
        radix: 2,
        fanin: None,
        fanout: Some(FanoutKind::Bcast),
    };
    let phases = tree_phases(&params).unwrap();
    assert_eq!(methods(&phases), vec![PlanMethod::SendTerminal]);
    // virtual children 1 and 2 are members 3 and 0
    assert_eq!(phases[0].peers.as_slice(), &[3, 0]);
    assert_eq!(phases[0].step_index, 1);
}

#[test]
fn flat_scatter_and_gather() {
    let config = BuiltinConfig::default();
    let scatter = CollectiveType { kind: CollectiveKind::Scatter, root: 1 };
    let (topology, root) = build_layout(&scatter, 7, 1, false, &config).unwrap();
    assert_eq!(topology, TopologyType::TreeFanout);
    assert_eq!(methods(&root), vec![PlanMethod::ScatterTerminal]);
    assert_eq!(root[0].peers.len(), 6);

    let gather = CollectiveType { kind: CollectiveKind::Gather, root: 0 };
    let (_, leaf) = build_layout(&gather, 7, 5, false, &config).unwrap();
    assert_eq!(methods(&leaf), vec![PlanMethod::SendTerminal]);
    assert_eq!(leaf[0].peers.as_slice(), &[0]);
}

#[test]
fn topology_choice() {
    use CollectiveKind as K;
    assert_eq!(choose_topology(K::Allreduce, 8, 2, false), TopologyType::Recursive);
    assert_eq!(choose_topology(K::Allreduce, 6, 2, false), TopologyType::TreeFaninFanout);
    assert_eq!(choose_topology(K::Barrier, 9, 3, false), TopologyType::Recursive);
    assert_eq!(choose_topology(K::Bcast, 8, 2, false), TopologyType::TreeFanout);
    assert_eq!(choose_topology(K::Reduce, 8, 2, false), TopologyType::TreeFanin);
    assert_eq!(choose_topology(K::Alltoall, 8, 2, false), TopologyType::AlltoallBruck);
    assert_eq!(choose_topology(K::Alltoall, 6, 2, false), TopologyType::Pairwise);
    assert_eq!(choose_topology(K::Allgather, 6, 2, false), TopologyType::AllgatherBruck);
}

#[test]
fn mixed_locality_avoids_recursive() {
    assert!(!mixes_locality(&[]));
    assert!(!mixes_locality(&[0, 1, 2, 3]));
    assert!(!mixes_locality(&[7, 7, 7, 7]));
    assert!(mixes_locality(&[0, 0, 1, 1]));

    use CollectiveKind as K;
    assert_eq!(choose_topology(K::Allreduce, 8, 2, true), TopologyType::TreeFaninFanout);
    assert_eq!(choose_topology(K::Barrier, 4, 2, true), TopologyType::TreeFaninFanout);
    assert_eq!(choose_topology(K::Alltoall, 8, 2, true), TopologyType::AlltoallBruck);

    let config = BuiltinConfig::default();
    let allreduce = CollectiveType { kind: K::Allreduce, root: 0 };
    let hosts = [0, 0, 0, 0, 1, 1, 1, 1];
    let (topology, phases) =
        build_layout(&allreduce, 8, 4, mixes_locality(&hosts), &config).unwrap();
    assert_eq!(topology, TopologyType::TreeFaninFanout);
    assert_eq!(methods(&phases), vec![PlanMethod::ReduceWaypoint, PlanMethod::BcastWaypoint]);
}

#[test]
fn single_member_has_no_phases() {
    let config = BuiltinConfig::default();
    for kind in [CollectiveKind::Allreduce, CollectiveKind::Bcast, CollectiveKind::Alltoall]
    {
        let coll_type = CollectiveType { kind, root: 0 };
        let (_, phases) = build_layout(&coll_type, 1, 0, false, &config).unwrap();
        assert!(phases.is_empty());
    }
}

proptest! {
    #[test]
    fn recursive_peers_are_distinct(factor in 2usize..6, k in 0u32..4, seed in any::<usize>()) {
        let n = factor.pow(k);
        let me = seed % n;
        let phases = recursive_phases(n, me, factor).unwrap();
        prop_assert_eq!(phases.len(), k as usize);
        for phase in &phases {
            prop_assert_eq!(phase.peers.len(), factor - 1);
            let set: HashSet<_> = phase.peers.iter().copied().collect();
            prop_assert_eq!(set.len(), factor - 1);
            prop_assert!(!set.contains(&me));
            prop_assert!(phase.peers.iter().all(|&p| p < n));
        }
    }

    #[test]
    fn recursive_exchange_is_symmetric(factor in 2usize..5, k in 1u32..4, seed in any::<usize>()) {
        let n = factor.pow(k);
        let me = seed % n;
        let mine = recursive_phases(n, me, factor).unwrap();
        for (s, phase) in mine.iter().enumerate() {
            for &peer in &phase.peers {
                let theirs = recursive_phases(n, peer, factor).unwrap();
                prop_assert!(theirs[s].peers.contains(&me));
            }
        }
    }

    #[test]
    fn bruck_peer_law(n in 1usize..70, seed in any::<usize>()) {
        let me = seed % n;
        let phases = bruck_phases(n, me, PlanMethod::AlltoallBruck).unwrap();
        prop_assert_eq!(phases.len(), bruck_phase_count(n));
        for (k, phase) in phases.iter().enumerate() {
            prop_assert_eq!(phase.peers.as_slice(), &[(me + (1 << k)) % n]);
        }
    }

    #[test]
    fn tree_reaches_every_member_once(n in 1usize..80, radix in 2usize..6, root_seed in any::<usize>()) {
        let root = root_seed % n;
        let mut received = vec![0usize; n];
        let mut senders = vec![0usize; n];
        for me in 0..n {
            let params = TreeParams {
                group_size: n,
                me,
                root,
                radix,
                fanin: None,
                fanout: Some(FanoutKind::Bcast),
            };
            let phases = tree_phases(&params).unwrap();
            for phase in &phases {
                match phase.method {
                    PlanMethod::SendTerminal => {
                        for &p in &phase.peers { received[p] += 1; }
                    }
                    PlanMethod::BcastWaypoint => {
                        senders[me] += 1;
                        for &p in &phase.peers[1..] { received[p] += 1; }
                    }
                    PlanMethod::RecvTerminal => senders[me] += 1,
                    other => prop_assert!(false, "unexpected method {other}"),
                }
            }
        }
        for m in 0..n {
            let expected = usize::from(m != root);
            prop_assert_eq!(received[m], expected);
            prop_assert_eq!(senders[m], expected);
        }
    }
}
