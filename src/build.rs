//! Mesh assembly: derive entities dimension by dimension from element
//! connectivity, resolve cross-rank ownership, and attach global numbering.
//!
//! Entry points are [`build_from_elems2verts`] (distributed, with externally
//! assigned vertex globals) and [`build_from_elems_and_coords`] (serial
//! convenience). Per dimension the pipeline derives unique entities locally,
//! resolves owners when the partition allows duplication, and writes
//! connectivity, owners, and a `"global"` tag into the mesh container.

use std::sync::Arc;

use itertools::Itertools;
use log::debug;

use crate::canon;
use crate::comm::collective::reduce_and;
use crate::comm::Communicator;
use crate::dist::{Dist, Remotes};
use crate::element::{Family, VERT};
use crate::error::MeshWeldError;
use crate::mesh::{Adj, Mesh, Parting, TagData};
use crate::owners;

/// Enumerate the unique dimension-`low` entities derivable from
/// element-to-vertex connectivity, as a flat entity-to-vertex table.
///
/// Every element contributes one candidate per down-template row; candidates
/// are canonicalized by local vertex index, sorted lexicographically, and
/// deduplicated, so the result is a pure function of the local connectivity.
pub fn find_unique(
    ev2v: &[usize],
    family: Family,
    elem_dim: usize,
    low: usize,
) -> Result<Vec<usize>, MeshWeldError> {
    let elem_deg = family.degree(elem_dim, VERT)?;
    if ev2v.len() % elem_deg != 0 {
        return Err(MeshWeldError::RaggedConnectivity {
            len: ev2v.len(),
            degree: elem_deg,
        });
    }
    let template = family.down_template(elem_dim, low)?;
    let low_deg = family.degree(low, VERT)?;
    let mut uses: Vec<u64> = Vec::with_capacity(ev2v.len() / elem_deg * template.len() * low_deg);
    for elem_verts in ev2v.chunks_exact(elem_deg) {
        for row in &template {
            for &slot in row.iter() {
                uses.push(elem_verts[slot] as u64);
            }
        }
    }
    let codes = canon::codes_to_canonical(low_deg, &uses)?;
    canon::align_table_in_place(low_deg, &codes, &mut uses)?;
    Ok(uses
        .chunks_exact(low_deg)
        .sorted_unstable()
        .dedup()
        .flatten()
        .map(|&v| v as usize)
        .collect())
}

/// Map element-to-vertex connectivity onto already-enumerated lower entities:
/// for each element and template row, the index of the matching lower entity
/// and the alignment code relating its stored orientation to this use.
pub fn reflect_down<C: Communicator>(
    mesh: &Mesh<C>,
    ev2v: &[usize],
    elem_dim: usize,
    low: usize,
) -> Result<Adj, MeshWeldError> {
    let family = mesh.family();
    let elem_deg = family.degree(elem_dim, VERT)?;
    let low_deg = family.degree(low, VERT)?;
    let template = family.down_template(elem_dim, low)?;
    let lv2v = mesh.ask_verts_of(low)?;
    let (up_off, up_ents) = mesh.ask_up(low)?;

    let mut entries = Vec::with_capacity(ev2v.len() / elem_deg * template.len());
    let mut codes = Vec::with_capacity(entries.capacity());
    let mut use_verts = vec![0usize; low_deg];
    let mut use_sorted = vec![0usize; low_deg];
    let mut stored_sorted = vec![0usize; low_deg];
    for (elem, elem_verts) in ev2v.chunks_exact(elem_deg).enumerate() {
        for row in &template {
            for (slot, &elem_slot) in row.iter().enumerate() {
                use_verts[slot] = elem_verts[elem_slot];
            }
            use_sorted.copy_from_slice(&use_verts);
            use_sorted.sort_unstable();
            // Candidates: lower entities incident to the use's first vertex.
            let anchor = use_sorted[0];
            let found = up_ents[up_off[anchor]..up_off[anchor + 1]]
                .iter()
                .copied()
                .find(|&l| {
                    let stored = &lv2v[l * low_deg..(l + 1) * low_deg];
                    stored_sorted.copy_from_slice(stored);
                    stored_sorted.sort_unstable();
                    stored_sorted == use_sorted
                });
            let low_ent = found.ok_or(MeshWeldError::MissingDownEntity { elem, low_dim: low })?;
            let stored = &lv2v[low_ent * low_deg..(low_ent + 1) * low_deg];
            let code = canon::code_between(low_deg, stored, &use_verts).ok_or(
                MeshWeldError::UnalignableUse {
                    elem,
                    low_dim: low,
                    low: low_ent,
                },
            )?;
            entries.push(low_ent);
            codes.push(code);
        }
    }
    Ok(Adj { entries, codes })
}

/// Install entities of `dim` given their vertex connectivity, resolving
/// ownership and attaching a `"global"` tag. The distributed analogue of a
/// plain `set_ents`.
pub fn add_ents2verts<C: Communicator>(
    mesh: &mut Mesh<C>,
    dim: usize,
    mut ev2v: Vec<usize>,
    vert_globals: &[u64],
    elem_globals: Option<&[u64]>,
) -> Result<(), MeshWeldError> {
    let comm = Arc::clone(mesh.comm());
    let deg = mesh.family().degree(dim, VERT)?;
    if ev2v.len() % deg != 0 {
        return Err(MeshWeldError::RaggedConnectivity {
            len: ev2v.len(),
            degree: deg,
        });
    }
    let nents = ev2v.len() / deg;
    debug!(
        "add_ents rank {}/{}: dim {dim}, {nents} entities",
        comm.rank(),
        comm.size()
    );

    let mut resolved: Option<Remotes> = None;
    if comm.size() > 1 {
        resolved = Some(if mesh.could_be_shared(dim) {
            if dim == mesh.dim() {
                let globals = elem_globals.ok_or(MeshWeldError::MissingElemGlobals)?;
                owners::owners_from_globals(&comm, globals)?
            } else {
                owners::resolve_derived_copies(&comm, vert_globals, deg, &mut ev2v)?
            }
        } else {
            owners::identity_remotes(comm.as_ref(), nents)
        });
    }

    if dim == 1 {
        mesh.set_ents(dim, ev2v, None)?;
    } else {
        let down = reflect_down(mesh, &ev2v, dim, dim - 1)?;
        mesh.set_ents(dim, ev2v, Some(down))?;
    }

    if let Some(ents2owners) = resolved {
        let globals = match elem_globals {
            Some(globals) if dim == mesh.dim() => globals.to_vec(),
            _ => owners::globals_from_owners(&comm, &ents2owners)?,
        };
        mesh.set_owners(dim, ents2owners)?;
        mesh.add_tag(dim, "global", 1, TagData::U64(globals))?;
    } else {
        mesh.add_tag(dim, "global", 1, TagData::U64((0..nents as u64).collect()))?;
    }
    Ok(())
}

/// Install the vertex set with its externally assigned globals and, on more
/// than one rank, vertex owners.
pub fn build_verts_from_globals<C: Communicator>(
    mesh: &mut Mesh<C>,
    vert_globals: &[u64],
) -> Result<(), MeshWeldError> {
    let comm = Arc::clone(mesh.comm());
    mesh.set_verts(vert_globals.len());
    mesh.add_tag(VERT, "global", 1, TagData::U64(vert_globals.to_vec()))?;
    if comm.size() > 1 {
        let vert_owners = owners::owners_from_globals(&comm, vert_globals)?;
        mesh.set_owners(VERT, vert_owners)?;
    }
    Ok(())
}

/// Derive and install every dimension from 1 up to the element dimension,
/// then re-sort vertices if any rank's globals are unsorted.
pub fn build_ents_from_elems2verts<C: Communicator>(
    mesh: &mut Mesh<C>,
    ev2v: Vec<usize>,
    vert_globals: &[u64],
    elem_globals: Option<&[u64]>,
) -> Result<(), MeshWeldError> {
    let elem_dim = mesh.dim();
    for mdim in 1..elem_dim {
        let mv2v = find_unique(&ev2v, mesh.family(), elem_dim, mdim)?;
        add_ents2verts(mesh, mdim, mv2v, vert_globals, elem_globals)?;
    }
    add_ents2verts(mesh, elem_dim, ev2v, vert_globals, elem_globals)?;
    let sorted_locally = vert_globals.windows(2).all(|w| w[0] <= w[1]);
    if !reduce_and(mesh.comm().as_ref(), sorted_locally)? {
        reorder_by_globals(mesh)?;
    }
    Ok(())
}

/// Primary distributed entry point: build a mesh from partitioned
/// element-to-vertex connectivity and per-vertex global numbers.
pub fn build_from_elems2verts<C: Communicator>(
    comm: Arc<C>,
    family: Family,
    elem_dim: usize,
    ev2v: Vec<usize>,
    vert_globals: &[u64],
    elem_globals: Option<&[u64]>,
) -> Result<Mesh<C>, MeshWeldError> {
    let mut mesh = Mesh::new(comm, family, elem_dim, Parting::ElementBased);
    build_verts_from_globals(&mut mesh, vert_globals)?;
    build_ents_from_elems2verts(&mut mesh, ev2v, vert_globals, elem_globals)?;
    Ok(mesh)
}

/// Serial convenience entry point: globals are `0..nverts` and coordinates
/// (`elem_dim` scalars per vertex) are attached as a `"coordinates"` tag.
pub fn build_from_elems_and_coords<C: Communicator>(
    comm: Arc<C>,
    family: Family,
    elem_dim: usize,
    ev2v: Vec<usize>,
    coords: Vec<f64>,
) -> Result<Mesh<C>, MeshWeldError> {
    let nverts = coords.len() / elem_dim;
    let vert_globals: Vec<u64> = (0..nverts as u64).collect();
    let mut mesh = build_from_elems2verts(comm, family, elem_dim, ev2v, &vert_globals, None)?;
    mesh.add_tag(VERT, "coordinates", elem_dim, TagData::F64(coords))?;
    Ok(mesh)
}

/// Re-sort the local vertex array so globals ascend, permuting every
/// vertex-indexed table and repairing remote owner indices.
///
/// Several downstream algorithms assume locally monotone vertex globals;
/// this restores that invariant after a build whose caller supplied vertices
/// in arbitrary order. Collective when vertex owners exist.
pub fn reorder_by_globals<C: Communicator>(mesh: &mut Mesh<C>) -> Result<(), MeshWeldError> {
    let globals = mesh
        .globals_of(VERT)?
        .ok_or(MeshWeldError::MissingElemGlobals)?
        .to_vec();
    let n = globals.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&v| globals[v]);
    // perm[old] = new position.
    let mut perm = vec![0usize; n];
    for (new, &old) in order.iter().enumerate() {
        perm[old] = new;
    }
    debug!("reorder rank {}: permuting {n} vertices", mesh.comm().rank());
    mesh.permute_verts(&perm)?;

    // Copies still hold their owner's pre-permutation slot; every owner rank
    // serves its new index back through the owner distribution.
    let comm = Arc::clone(mesh.comm());
    if comm.size() > 1 {
        if let Some(owners) = mesh.owners(VERT)?.cloned() {
            let dist = Dist::new(Arc::clone(&comm), owners.clone(), n)?;
            let serv: Vec<u64> = dist
                .received_roots()
                .iter()
                .map(|&old| perm[old] as u64)
                .collect();
            let inv = dist.invert()?;
            let new_indices = inv.exchange(&serv, 1)?;
            let mut repaired = owners;
            for (owner, &index) in repaired.iter_mut().zip(new_indices.iter()) {
                owner.index = index;
            }
            mesh.set_owners(VERT, repaired)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;

    #[test]
    fn unique_edges_of_two_triangles() {
        // Triangles (0,1,2) and (1,3,2) share the edge {1,2}.
        let edges = find_unique(&[0, 1, 2, 1, 3, 2], Family::Simplex, 2, 1).unwrap();
        assert_eq!(edges.len(), 10);
        assert_eq!(edges, vec![0, 1, 0, 2, 1, 2, 1, 3, 2, 3]);
    }

    #[test]
    fn unique_entities_of_one_hex() {
        let hex: Vec<usize> = (0..8).collect();
        let edges = find_unique(&hex, Family::Hypercube, 3, 1).unwrap();
        assert_eq!(edges.len() / 2, 12);
        let quads = find_unique(&hex, Family::Hypercube, 3, 2).unwrap();
        assert_eq!(quads.len() / 4, 6);
    }

    #[test]
    fn unique_entities_of_one_tet() {
        let tet: Vec<usize> = (0..4).collect();
        assert_eq!(find_unique(&tet, Family::Simplex, 3, 1).unwrap().len() / 2, 6);
        assert_eq!(find_unique(&tet, Family::Simplex, 3, 2).unwrap().len() / 3, 4);
    }

    #[test]
    fn reflect_down_finds_every_use() {
        let comm = Arc::new(NoComm);
        let ev2v = vec![0usize, 1, 2, 1, 3, 2];
        let mesh =
            build_from_elems2verts(comm, Family::Simplex, 2, ev2v.clone(), &[0, 1, 2, 3], None)
                .unwrap();
        let down = mesh.ask_down(2).unwrap().unwrap();
        assert_eq!(down.entries.len(), 6);
        // The shared edge {1,2} (stored as (1,2)) appears in both elements.
        let edges = mesh.ask_verts_of(1).unwrap();
        let shared = edges
            .chunks_exact(2)
            .position(|e| e == [1, 2])
            .unwrap();
        assert_eq!(
            down.entries
                .iter()
                .filter(|&&l| l == shared)
                .count(),
            2
        );
        // Triangle 0 traverses it as (1,2), triangle 1 as (2,1).
        let use0 = down.entries[..3]
            .iter()
            .position(|&l| l == shared)
            .unwrap();
        let use1 = down.entries[3..]
            .iter()
            .position(|&l| l == shared)
            .unwrap();
        assert!(!canon::code_is_flipped(down.codes[use0]));
        assert!(canon::code_is_flipped(down.codes[3 + use1]));
    }

    #[test]
    fn serial_triangle_pair_build() {
        let comm = Arc::new(NoComm);
        let mesh = build_from_elems2verts(
            comm,
            Family::Simplex,
            2,
            vec![0, 1, 2, 1, 3, 2],
            &[0, 1, 2, 3],
            None,
        )
        .unwrap();
        assert_eq!(mesh.nents(0).unwrap(), 4);
        assert_eq!(mesh.nents(1).unwrap(), 5);
        assert_eq!(mesh.nents(2).unwrap(), 2);
        assert_eq!(
            mesh.globals_of(1).unwrap().unwrap(),
            &[0, 1, 2, 3, 4]
        );
        // Serial meshes carry no owners.
        assert!(mesh.owners(1).unwrap().is_none());
    }

    #[test]
    fn serial_coords_build() {
        let comm = Arc::new(NoComm);
        let mesh = build_from_elems_and_coords(
            comm,
            Family::Simplex,
            2,
            vec![0, 1, 2],
            vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
        )
        .unwrap();
        let tag = mesh.get_tag(VERT, "coordinates").unwrap().unwrap();
        assert_eq!(tag.ncomps, 2);
        assert_eq!(mesh.nents(1).unwrap(), 3);
    }
}
