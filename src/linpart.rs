//! Deterministic contiguous-range partition of a global ID space.
//!
//! Given a total count and a number of ranks, rank `i` owns the half-open
//! range `[suggest_begin(t, p, i), suggest_end(t, p, i))`; even division with
//! the remainder handed to the lowest ranks. The rule is a pure function of
//! `(total, nparts, rank)` and needs no communication, which is what lets
//! ownership resolution bootstrap itself: the serving rank for an entity can
//! be computed from vertex identity alone, before any ownership exists.

use crate::dist::Remote;

/// First global ID owned by `rank`.
pub fn suggest_begin(total: u64, nparts: usize, rank: usize) -> u64 {
    debug_assert!(rank <= nparts);
    let p = nparts as u64;
    let quot = total / p;
    let rem = total % p;
    let r = rank as u64;
    quot * r + r.min(rem)
}

/// One past the last global ID owned by `rank`.
pub fn suggest_end(total: u64, nparts: usize, rank: usize) -> u64 {
    suggest_begin(total, nparts, rank + 1)
}

/// The rank whose range contains `global`. Consistent with [`suggest_begin`]
/// and [`suggest_end`] for every rank.
pub fn owner_of(total: u64, nparts: usize, global: u64) -> usize {
    debug_assert!(global < total);
    let p = nparts as u64;
    let quot = total / p;
    let rem = total % p;
    // The first `rem` ranks hold `quot + 1` IDs each.
    let fat_span = (quot + 1) * rem;
    let rank = if global < fat_span {
        global / (quot + 1)
    } else {
        rem + (global - fat_span) / quot
    };
    rank as usize
}

/// Map each global to its (owning rank, slot within that rank's range).
pub fn linear_owners(total: u64, nparts: usize, globals: &[u64]) -> Vec<Remote> {
    globals
        .iter()
        .map(|&g| {
            let rank = owner_of(total, nparts, g);
            Remote {
                rank: rank as u64,
                index: g - suggest_begin(total, nparts, rank),
            }
        })
        .collect()
}
