//! Cross-process entity identity resolution.
//!
//! Each rank derives its own copies of edges and faces from its elements, so
//! a shared entity exists on every rank that touches it, with no global
//! identity and possibly different vertex orders. Resolution gives every
//! copy the same `(rank, index)` owner:
//!
//! 1. canonicalize connectivity by vertex globals ([`crate::canon`]),
//! 2. route every copy to the rank that linearly owns its smallest vertex
//!    global ([`crate::linpart`]) — a serving rank computable from vertex
//!    identity alone, with no prior ownership information,
//! 3. on the server, group copies by canonical global tuple and elect the
//!    minimum `(source rank, source index)` copy as owner,
//! 4. report the elected owner back to every copy through the inverse
//!    distribution.
//!
//! The election is an explicit reduction over each group, so the result
//! depends only on the set of participating copies, never on arrival order
//! or process count.

use std::sync::Arc;

use hashbrown::HashMap;
use log::{debug, trace};

use crate::canon;
use crate::comm::collective::{allgather, allreduce_max, exscan_sum};
use crate::comm::Communicator;
use crate::dist::{Dist, Remote, Remotes};
use crate::error::MeshWeldError;
use crate::linpart;

/// Each local entity owns itself.
pub fn identity_remotes<C: Communicator>(comm: &C, n: usize) -> Remotes {
    let rank = comm.rank();
    (0..n).map(|index| Remote::new(rank, index)).collect()
}

/// One past the largest global number on any rank; zero for a globally empty
/// set. Collective.
pub fn find_total_globals<C: Communicator>(
    comm: &C,
    globals: &[u64],
) -> Result<u64, MeshWeldError> {
    let local = globals.iter().max().map_or(0, |&m| m + 1);
    allreduce_max(comm, local)
}

/// Elect one owner per canonical key group on the serving rank.
///
/// `keys` holds `width` scalars per received record, in the distribution's
/// receive order. Within each root's fan, records with equal keys form one
/// entity; its owner is the minimum `(rank, index)` source. Copies of an
/// entity always target the same root (the linear owner of their smallest
/// vertex global), so grouping within roots is exhaustive.
fn elect_owners<C: Communicator>(dist: &Dist<C>, keys: &[u64], width: usize) -> Vec<Remote> {
    let sources = dist.sources();
    let fan = dist.roots_to_items();
    let mut owners = vec![Remote::new(0, 0); sources.len()];
    let mut group: HashMap<&[u64], Remote> = HashMap::new();
    for root in 0..dist.nroots() {
        let span = fan[root]..fan[root + 1];
        group.clear();
        for i in span.clone() {
            let key = &keys[i * width..(i + 1) * width];
            group
                .entry(key)
                .and_modify(|winner| *winner = (*winner).min(sources[i]))
                .or_insert(sources[i]);
        }
        for i in span {
            let key = &keys[i * width..(i + 1) * width];
            owners[i] = group[key];
        }
    }
    owners
}

/// Assign a single owner to every copy of entities identified by one global
/// number each (vertices, or elements with externally supplied globals).
/// Collective.
pub fn owners_from_globals<C: Communicator>(
    comm: &Arc<C>,
    globals: &[u64],
) -> Result<Remotes, MeshWeldError> {
    let total = find_total_globals(comm.as_ref(), globals)?;
    let nparts = comm.size();
    let dests = linpart::linear_owners(total, nparts, globals);
    let nroots = (linpart::suggest_end(total, nparts, comm.rank())
        - linpart::suggest_begin(total, nparts, comm.rank())) as usize;
    let dist = Dist::new(Arc::clone(comm), dests, nroots)?;
    let keys = dist.exchange(globals, 1)?;
    let serv_owners = elect_owners(&dist, &keys, 1);
    let inv = dist.invert()?;
    inv.exchange(&serv_owners, 1)
}

/// Resolve cross-process identity for derived entities of degree `deg`.
///
/// Canonicalizes `ev2v` in place (vertex order becomes the canonical order
/// implied by `vert_globals`) and returns one owner reference per entity, in
/// entity order. Collective; see the module docs for the algorithm.
pub fn resolve_derived_copies<C: Communicator>(
    comm: &Arc<C>,
    vert_globals: &[u64],
    deg: usize,
    ev2v: &mut [usize],
) -> Result<Remotes, MeshWeldError> {
    if !(2..=4).contains(&deg) {
        return Err(MeshWeldError::UnsupportedDegree(deg));
    }
    if ev2v.len() % deg != 0 {
        return Err(MeshWeldError::RaggedConnectivity {
            len: ev2v.len(),
            degree: deg,
        });
    }
    let nents = ev2v.len() / deg;
    let nverts = vert_globals.len();
    let mut ev2vg = Vec::with_capacity(ev2v.len());
    for &v in ev2v.iter() {
        let &g = vert_globals
            .get(v)
            .ok_or(MeshWeldError::VertexOutOfBounds { vertex: v, nverts })?;
        ev2vg.push(g);
    }

    let codes = canon::codes_to_canonical(deg, &ev2vg)?;
    canon::align_table_in_place(deg, &codes, ev2v)?;
    canon::align_table_in_place(deg, &codes, &mut ev2vg)?;

    // Serve each entity on the linear owner of its smallest vertex global,
    // which after alignment sits in slot 0.
    let first_globals: Vec<u64> = ev2vg.iter().step_by(deg).copied().collect();
    let total = find_total_globals(comm.as_ref(), vert_globals)?;
    let nparts = comm.size();
    let me = comm.rank();
    let dests = linpart::linear_owners(total, nparts, &first_globals);
    let nroots =
        (linpart::suggest_end(total, nparts, me) - linpart::suggest_begin(total, nparts, me))
            as usize;
    debug!(
        "resolve rank {me}/{nparts}: {nents} degree-{deg} copies, serving {nroots} linear slots of {total}"
    );

    let dist = Dist::new(Arc::clone(comm), dests, nroots)?;
    let serv_tuples = dist.exchange(&ev2vg, deg)?;
    let serv_owners = elect_owners(&dist, &serv_tuples, deg);
    trace!(
        "resolve rank {me}: {} received copies elected into owners",
        serv_owners.len()
    );
    let inv = dist.invert()?;
    inv.exchange(&serv_owners, 1)
}

/// Ownership-driven contiguous global numbering.
///
/// Owned entities (those whose owner reference points back at themselves)
/// get consecutive globals, offset by an exclusive scan of per-rank owned
/// counts; every copy then pulls its owner's global through the owner
/// distribution. Collective.
pub fn globals_from_owners<C: Communicator>(
    comm: &Arc<C>,
    owners: &[Remote],
) -> Result<Vec<u64>, MeshWeldError> {
    let me = comm.rank() as u64;
    let n = owners.len();
    let owned: Vec<bool> = owners
        .iter()
        .enumerate()
        .map(|(i, o)| o.rank == me && o.index == i as u64)
        .collect();
    let nowned = owned.iter().filter(|&&o| o).count() as u64;
    let offset = exscan_sum(comm.as_ref(), nowned)?;

    // Ordinals by prefix sum, not by a shared counter: the assignment must
    // not depend on traversal interleaving.
    let mut own_globals = vec![0u64; n];
    let mut ordinal = offset;
    for (i, &is_owned) in owned.iter().enumerate() {
        if is_owned {
            own_globals[i] = ordinal;
            ordinal += 1;
        }
    }

    let dist = Dist::new(Arc::clone(comm), owners.to_vec(), n)?;
    let roots = dist.received_roots();
    let mut serv_globals = Vec::with_capacity(roots.len());
    for (&root, source) in roots.iter().zip(dist.sources()) {
        if !owned[root] {
            // A copy claims an owner that does not own itself.
            return Err(MeshWeldError::CorruptOwner {
                rank: source.rank as usize,
                index: source.index as usize,
            });
        }
        serv_globals.push(own_globals[root]);
    }
    let inv = dist.invert()?;
    inv.exchange(&serv_globals, 1)
}

/// Per-rank count of owned entities; usable to audit a global numbering.
/// Collective.
pub fn count_owned<C: Communicator>(
    comm: &C,
    owners: &[Remote],
) -> Result<Vec<u64>, MeshWeldError> {
    let me = comm.rank() as u64;
    let nowned = owners
        .iter()
        .enumerate()
        .filter(|&(i, o)| o.rank == me && o.index == i as u64)
        .count() as u64;
    allgather(comm, nowned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{NoComm, RayonComm};
    use serial_test::serial;

    fn spawn_world<F>(size: usize, f: F) -> Vec<std::thread::JoinHandle<()>>
    where
        F: Fn(Arc<RayonComm>) + Send + Sync + Clone + 'static,
    {
        RayonComm::world(size)
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                std::thread::spawn(move || f(Arc::new(comm)))
            })
            .collect()
    }

    #[test]
    fn serial_resolution_is_identity_on_distinct_entities() {
        let comm = Arc::new(NoComm);
        let vert_globals = vec![0u64, 1, 2, 3];
        // Edges (1,0) and (2,3); the first is flipped by canonicalization.
        let mut ev2v = vec![1usize, 0, 2, 3];
        let owners = resolve_derived_copies(&comm, &vert_globals, 2, &mut ev2v).unwrap();
        assert_eq!(ev2v, vec![0, 1, 2, 3]);
        assert_eq!(owners, identity_remotes(comm.as_ref(), 2));
    }

    #[test]
    fn serial_duplicates_share_one_owner() {
        let comm = Arc::new(NoComm);
        let vert_globals = vec![5u64, 9, 7];
        // The same edge twice in opposite orders, plus a distinct one.
        let mut ev2v = vec![0usize, 1, 1, 0, 2, 1];
        let owners = resolve_derived_copies(&comm, &vert_globals, 2, &mut ev2v).unwrap();
        assert_eq!(owners[0], Remote::new(0, 0));
        assert_eq!(owners[1], Remote::new(0, 0));
        assert_eq!(owners[2], Remote::new(0, 2));
    }

    #[test]
    fn empty_resolution_returns_empty() {
        let comm = Arc::new(NoComm);
        let owners = resolve_derived_copies(&comm, &[], 2, &mut []).unwrap();
        assert!(owners.is_empty());
        assert_eq!(find_total_globals(comm.as_ref(), &[]).unwrap(), 0);
    }

    #[test]
    fn serial_globals_from_owners_counts_up() {
        let comm = Arc::new(NoComm);
        let owners = identity_remotes(comm.as_ref(), 3);
        assert_eq!(globals_from_owners(&comm, &owners).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    #[serial]
    fn shared_edge_elects_one_owner() {
        // A triangle on rank 0 whose edge (0, 1) is also independently
        // derived, reversed, on rank 1.
        let handles = spawn_world(2, |comm| {
            let me = comm.rank();
            let (vert_globals, mut ev2v) = if me == 0 {
                (vec![0u64, 1, 2], vec![0usize, 1])
            } else {
                // Rank 1 numbers the same two vertices in the other order.
                (vec![1u64, 0], vec![0usize, 1])
            };
            let owners =
                resolve_derived_copies(&comm, &vert_globals, 2, &mut ev2v).unwrap();
            // Both copies agree on the rank-0 copy.
            assert_eq!(owners, vec![Remote::new(0, 0)]);
            // Both connectivities end up canonical: global order (0, 1).
            if me == 1 {
                assert_eq!(ev2v, vec![1, 0]);
            } else {
                assert_eq!(ev2v, vec![0, 1]);
            }

            // Exactly one copy is owned; the owner's global is inherited by
            // the other.
            let globals = globals_from_owners(&comm, &owners).unwrap();
            assert_eq!(globals, vec![0]);
            let counts = count_owned(comm.as_ref(), &owners).unwrap();
            assert_eq!(counts, vec![1, 0]);
        });
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    #[serial]
    fn two_rank_empty_resolution_does_not_hang() {
        let handles = spawn_world(2, |comm| {
            let owners = resolve_derived_copies(&comm, &[], 2, &mut []).unwrap();
            assert!(owners.is_empty());
        });
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    #[serial]
    fn vertex_owners_from_globals() {
        let handles = spawn_world(2, |comm| {
            let me = comm.rank();
            // Globals 0..4; global 1 is shared by both ranks.
            let globals: Vec<u64> = if me == 0 { vec![0, 1, 2] } else { vec![1, 3] };
            let owners = owners_from_globals(&comm, &globals).unwrap();
            if me == 0 {
                assert_eq!(
                    owners,
                    vec![Remote::new(0, 0), Remote::new(0, 1), Remote::new(0, 2)]
                );
            } else {
                // The shared vertex belongs to rank 0, its lowest-rank copy.
                assert_eq!(owners, vec![Remote::new(0, 1), Remote::new(1, 1)]);
            }
        });
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn corrupt_owner_is_fatal() {
        let comm = Arc::new(NoComm);
        // Entity 0 claims entity 1 as owner, but entity 1 claims entity 0:
        // nobody owns themselves.
        let owners = vec![Remote::new(0, 1), Remote::new(0, 0)];
        let err = globals_from_owners(&comm, &owners).unwrap_err();
        assert!(matches!(err, MeshWeldError::CorruptOwner { .. }));
    }
}
