//! Canonical vertex ordering for derived entities.
//!
//! Two ranks that independently derive the same edge or face from their own
//! elements will generally store its vertices in different orders. Canonical
//! order is a pure function of the vertices' global numbers — smallest global
//! first, remaining slots following the deterministic traversal below — so
//! every representation of the same entity canonicalizes to the identical
//! global tuple, which is what lets the ownership resolver match copies
//! across ranks by tuple equality.
//!
//! A code is a `u8` packing `rotation << 1 | flip`: the dihedral transform
//! taking an entity's stored slot order into canonical order. Codes are
//! derived, never ground truth; they can be applied to any per-slot table
//! (vertex indices, globals, arbitrary payload) with [`align_slots`].
//!
//! Supported degrees: 2 (edges), 3 (triangles), 4 (quadrilaterals). For
//! degree 4 only dihedral relabelings are meaningful, which is exactly the
//! set of orders a quadrilateral use can exhibit.

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::error::MeshWeldError;

/// Pack a dihedral transform into a code.
#[inline]
pub const fn make_code(flipped: bool, rotation: usize) -> u8 {
    ((rotation as u8) << 1) | (flipped as u8)
}

/// Rotation component of a code.
#[inline]
pub const fn code_rotation(code: u8) -> usize {
    (code >> 1) as usize
}

/// Reflection component of a code.
#[inline]
pub const fn code_is_flipped(code: u8) -> bool {
    code & 1 == 1
}

/// Source slot that feeds canonical slot `slot` under `code`.
#[inline]
pub fn aligned_source(deg: usize, code: u8, slot: usize) -> usize {
    let rot = code_rotation(code);
    if code_is_flipped(code) {
        (rot + (deg - slot) % deg) % deg
    } else {
        (rot + slot) % deg
    }
}

/// The code canonicalizing one entity's global tuple: smallest global first,
/// then the neighbor with the smaller global (traversal direction), which
/// fixes the transform uniquely for distinct globals.
#[inline]
pub fn code_to_canonical(globals: &[u64]) -> u8 {
    let deg = globals.len();
    debug_assert!((2..=4).contains(&deg));
    let mut least = 0;
    for slot in 1..deg {
        if globals[slot] < globals[least] {
            least = slot;
        }
    }
    let forward = globals[(least + 1) % deg];
    let backward = globals[(least + deg - 1) % deg];
    make_code(backward < forward, least)
}

/// Apply `code` to one entity's slots.
pub fn align_slots<T: Copy>(deg: usize, code: u8, slots: &mut [T]) {
    debug_assert_eq!(slots.len(), deg);
    let mut tmp = [slots[0]; 4];
    tmp[..deg].copy_from_slice(slots);
    for slot in 0..deg {
        slots[slot] = tmp[aligned_source(deg, code, slot)];
    }
}

fn check_table(deg: usize, len: usize) -> Result<usize, MeshWeldError> {
    if !(2..=4).contains(&deg) {
        return Err(MeshWeldError::UnsupportedDegree(deg));
    }
    if len % deg != 0 {
        return Err(MeshWeldError::RaggedConnectivity { len, degree: deg });
    }
    Ok(len / deg)
}

/// Per-entity canonicalization codes for a flat global-number table.
pub fn codes_to_canonical(deg: usize, ent_globals: &[u64]) -> Result<Vec<u8>, MeshWeldError> {
    check_table(deg, ent_globals.len())?;
    #[cfg(feature = "rayon")]
    let codes = ent_globals
        .par_chunks_exact(deg)
        .map(code_to_canonical)
        .collect();
    #[cfg(not(feature = "rayon"))]
    let codes = ent_globals
        .chunks_exact(deg)
        .map(code_to_canonical)
        .collect();
    Ok(codes)
}

/// Apply per-entity codes to a flat per-slot table in place.
pub fn align_table_in_place<T: Copy + Send>(
    deg: usize,
    codes: &[u8],
    table: &mut [T],
) -> Result<(), MeshWeldError> {
    let nents = check_table(deg, table.len())?;
    if codes.len() != nents {
        return Err(MeshWeldError::CodeCountMismatch {
            ncodes: codes.len(),
            nents,
        });
    }
    #[cfg(feature = "rayon")]
    table
        .par_chunks_exact_mut(deg)
        .zip_eq(codes.par_iter())
        .for_each(|(slots, &code)| align_slots(deg, code, slots));
    #[cfg(not(feature = "rayon"))]
    for (slots, &code) in table.chunks_exact_mut(deg).zip(codes.iter()) {
        align_slots(deg, code, slots);
    }
    Ok(())
}

/// Search the dihedral group for the code carrying `stored` onto `seen`.
///
/// Used when reflecting element connectivity down onto already-enumerated
/// lower entities: the stored entity and the element's use of it hold the
/// same vertex set, and the returned code records the relative orientation.
pub fn code_between<T: Copy + Eq>(deg: usize, stored: &[T], seen: &[T]) -> Option<u8> {
    debug_assert_eq!(stored.len(), deg);
    debug_assert_eq!(seen.len(), deg);
    for rotation in 0..deg {
        for flipped in [false, true] {
            let code = make_code(flipped, rotation);
            if (0..deg).all(|slot| stored[aligned_source(deg, code, slot)] == seen[slot]) {
                return Some(code);
            }
        }
    }
    None
}
