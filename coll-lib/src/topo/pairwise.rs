use crate::{
    api::MemberIndex,
    error::{CollLibError, Result},
    topo::{PhaseLayout, PlanMethod},
};

/// A single phase exchanging with every other member, starting with the
/// next one so that no two members target the same peer at once.
pub fn pairwise_phases(n: usize, me: MemberIndex) -> Result<Vec<PhaseLayout>> {
    if me >= n {
        return Err(CollLibError::Config(format!("member {me} outside group of {n}")));
    }
    if n == 1 {
        return Ok(Vec::new());
    }
    let peers = (1..n).map(|i| (me + i) % n).collect();
    Ok(vec![PhaseLayout::new(PlanMethod::Pairwise, 1, peers)])
}
