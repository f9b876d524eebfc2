use smallvec::smallvec;

use crate::{
    api::MemberIndex,
    error::{CollLibError, Result},
    topo::{PhaseLayout, PlanMethod},
};

/// `ceil(log2(n))`.
pub fn bruck_phase_count(n: usize) -> usize {
    if n <= 1 { 0 } else { (usize::BITS - (n - 1).leading_zeros()) as usize }
}

/// Phase `k` sends to `(me + 2^k) mod n` and receives from `(me - 2^k) mod n`.
pub fn bruck_phases(
    n: usize,
    me: MemberIndex,
    method: PlanMethod,
) -> Result<Vec<PhaseLayout>> {
    if me >= n {
        return Err(CollLibError::Config(format!("member {me} outside group of {n}")));
    }
    if !matches!(method, PlanMethod::AlltoallBruck | PlanMethod::AllgatherBruck) {
        return Err(CollLibError::InvalidParam("not a Bruck method"));
    }
    Ok((0..bruck_phase_count(n))
        .map(|k| PhaseLayout::new(method, k as u8 + 1, smallvec![(me + (1 << k)) % n]))
        .collect())
}
