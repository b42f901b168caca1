//! Searches over monotonic functions of a block number.
//!
//! Both searches take fallible functions because in practice every
//! evaluation is a node round trip; an error aborts the search and is
//! returned as-is. Neither search checks monotonicity: a function that
//! violates it gives an unspecified (but terminating) result.
use anyhow::Result;

/// Which end of the final bracket an interpolation search returns when the
/// target value is not hit exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Endpoint with the smaller absolute residual; ties go to the lower end.
    Closest,
    /// Last point whose value is below the target.
    Lower,
    /// First point whose value is above the target.
    Upper,
}

/// A known point `(x, f(x))` bounding a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub x: u64,
    pub y: i64,
}

impl Probe {
    pub fn new(x: u64, y: i64) -> Self {
        Self { x, y }
    }
}

/// Result of [`interpolation_search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOutcome {
    pub x: u64,
    /// `f(x) - target`.
    pub residual: i64,
    pub evaluations: u32,
}

/// Binary search for the first point of a boolean step function.
///
/// `predicate` must be false on `[lower, x)` and true on `[x, upper]`. The
/// lower bound itself is never evaluated and is assumed false; the upper
/// bound is assumed true. Returns `x`.
pub fn find_first_true<F>(mut lower: u64, mut upper: u64, mut predicate: F) -> Result<u64>
where
    F: FnMut(u64) -> Result<bool>,
{
    while upper.saturating_sub(lower) > 1 {
        let mid = lower + (upper - lower) / 2;
        if predicate(mid)? {
            upper = mid;
        } else {
            lower = mid;
        }
    }
    Ok(upper)
}

/// Discrete interpolation search on a monotonic non-decreasing `f`.
///
/// `lo` and `hi` must bracket the target: `lo.y <= target <= hi.y`. Each
/// next evaluation is placed by linear interpolation between the bracket ends and
/// always lands strictly inside the bracket, so every evaluation shrinks it.
/// An exact hit returns immediately with a zero residual, including a
/// target equal to the endpoint `mode` prefers (`lo` for `Upper` and
/// `Closest`, `hi` for `Lower`); otherwise the search stops once the bracket
/// width is at most one and `mode` picks the endpoint.
pub fn interpolation_search<F>(
    target: i64,
    lo: Probe,
    hi: Probe,
    mode: Resolution,
    mut f: F,
) -> Result<SearchOutcome>
where
    F: FnMut(u64) -> Result<i64>,
{
    let exact = match mode {
        Resolution::Upper => (lo.y == target).then_some(lo),
        Resolution::Lower => (hi.y == target).then_some(hi),
        Resolution::Closest if lo.y == target => Some(lo),
        Resolution::Closest => (hi.y == target).then_some(hi),
    };
    if let Some(p) = exact {
        return Ok(SearchOutcome { x: p.x, residual: 0, evaluations: 0 });
    }

    let (mut lo, mut hi) = (lo, hi);
    let mut evaluations = 0u32;

    while hi.x.saturating_sub(lo.x) > 1 {
        let width = hi.x - lo.x;
        let proportion = if hi.y == lo.y {
            0.0
        } else {
            (target - lo.y) as f64 / (hi.y - lo.y) as f64
        };
        let step = ((proportion * width as f64).round() as i64).max(1) as u64;
        let x = (lo.x + step.min(width)).min(hi.x - 1);
        let y = f(x)?;
        evaluations += 1;

        if y == target {
            return Ok(SearchOutcome { x, residual: 0, evaluations });
        } else if y < target {
            lo = Probe::new(x, y);
        } else {
            hi = Probe::new(x, y);
        }
    }

    let pick = match mode {
        Resolution::Closest => {
            if hi.y - target >= target - lo.y {
                lo
            } else {
                hi
            }
        }
        Resolution::Lower => lo,
        Resolution::Upper => hi,
    };
    Ok(SearchOutcome { x: pick.x, residual: pick.y - target, evaluations })
}
