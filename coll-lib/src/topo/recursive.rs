use crate::{
    api::{MemberIndex, SmallVec},
    error::{CollLibError, Result},
    topo::{PhaseLayout, PlanMethod},
};

/// `Some(k)` when `n == factor^k`.
pub fn power_of(n: usize, factor: usize) -> Option<u32> {
    if factor < 2 || n == 0 {
        return None;
    }
    let mut k = 0;
    let mut value = 1usize;
    while value < n {
        value = value.checked_mul(factor)?;
        k += 1;
    }
    (value == n).then_some(k)
}

/// Recursive K-ing: `log_f(n)` phases. In phase `s` members are split into
/// blocks of `f^(s+1)` consecutive ranks; each member exchanges with the
/// `f - 1` members of its block that share every base-`f` digit but digit `s`.
pub fn recursive_phases(
    n: usize,
    me: MemberIndex,
    factor: usize,
) -> Result<Vec<PhaseLayout>> {
    if me >= n {
        return Err(CollLibError::Config(format!("member {me} outside group of {n}")));
    }
    let Some(steps) = power_of(n, factor) else {
        return Err(CollLibError::Config(format!(
            "group size {n} is not a power of the recursive factor {factor}"
        )));
    };

    let mut phases = Vec::with_capacity(steps as usize);
    let mut stride = 1;
    for s in 0..steps {
        let digit = (me / stride) % factor;
        let base = me - digit * stride;
        let peers: SmallVec<MemberIndex> = (0..factor)
            .filter(|&d| d != digit)
            .map(|d| base + d * stride)
            .collect();
        phases.push(PhaseLayout::new(PlanMethod::ReduceRecursive, s as u8 + 1, peers));
        stride *= factor;
    }
    Ok(phases)
}
