//! Lean mesh container: the surface the assembly orchestrator writes into.
//!
//! Per dimension it stores the entity count, entity-to-vertex connectivity,
//! a down-adjacency onto the next dimension below (with alignment codes),
//! owner references, and named per-entity tags. This is deliberately only
//! the interface the build core consumes: counts, `ask_verts_of`/`ask_up`
//! adjacency queries, tag get/set, owners, and communicator access.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::dist::Remotes;
use crate::element::{Family, VERT};
use crate::error::MeshWeldError;

/// How the mesh is partitioned across ranks; decides which dimensions can
/// hold duplicated entities.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parting {
    /// Elements are uniquely assigned; everything below them may be shared.
    ElementBased,
    /// Ghost layers exist; every dimension may be shared.
    Ghosted,
    /// Vertices are uniquely assigned; everything above them may be shared.
    VertexBased,
}

/// Fixed-width adjacency from entities of one dimension onto a lower one,
/// with per-use alignment codes (see [`crate::canon`]).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Adj {
    /// `deg` lower-entity indices per high entity, flattened.
    pub entries: Vec<usize>,
    /// One code per entry: orientation of the stored lower entity within the
    /// use. Empty for entity-to-vertex tables, where order itself encodes
    /// orientation.
    pub codes: Vec<u8>,
}

/// Tag payload; one value row of `ncomps` scalars per entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TagData {
    U64(Vec<u64>),
    F64(Vec<f64>),
}

impl TagData {
    fn len(&self) -> usize {
        match self {
            TagData::U64(v) => v.len(),
            TagData::F64(v) => v.len(),
        }
    }
}

/// A named per-entity array.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tag {
    pub ncomps: usize,
    pub data: TagData,
}

#[derive(Default)]
struct DimData {
    nents: usize,
    /// Entity-to-vertex connectivity, `degree(dim, VERT)` slots per entity.
    ents2verts: Vec<usize>,
    /// Down-adjacency onto `dim - 1`; only present for `dim >= 2`.
    down: Option<Adj>,
    owners: Option<Remotes>,
    tags: BTreeMap<String, Tag>,
}

/// The mesh under construction.
pub struct Mesh<C: Communicator> {
    comm: Arc<C>,
    family: Family,
    dim: usize,
    parting: Parting,
    dims: Vec<DimData>,
}

impl<C: Communicator> fmt::Debug for Mesh<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mesh")
            .field("family", &self.family)
            .field("dim", &self.dim)
            .field("parting", &self.parting)
            .field(
                "nents",
                &self.dims.iter().map(|d| d.nents).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl<C: Communicator> Mesh<C> {
    /// An empty mesh of the given family and element dimension.
    pub fn new(comm: Arc<C>, family: Family, dim: usize, parting: Parting) -> Self {
        let dims = (0..=dim).map(|_| DimData::default()).collect();
        Self {
            comm,
            family,
            dim,
            parting,
            dims,
        }
    }

    pub fn comm(&self) -> &Arc<C> {
        &self.comm
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Element dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn parting(&self) -> Parting {
        self.parting
    }

    fn dim_data(&self, dim: usize) -> Result<&DimData, MeshWeldError> {
        self.dims.get(dim).ok_or(MeshWeldError::DimOutOfRange {
            dim,
            mesh_dim: self.dim,
        })
    }

    fn dim_data_mut(&mut self, dim: usize) -> Result<&mut DimData, MeshWeldError> {
        let mesh_dim = self.dim;
        self.dims
            .get_mut(dim)
            .ok_or(MeshWeldError::DimOutOfRange { dim, mesh_dim })
    }

    /// Whether entities of `dim` may hold copies on more than one rank.
    pub fn could_be_shared(&self, dim: usize) -> bool {
        self.comm.size() > 1
            && match self.parting {
                Parting::ElementBased => dim < self.dim,
                Parting::Ghosted => true,
                Parting::VertexBased => dim > VERT,
            }
    }

    /// Number of local entities of `dim`.
    pub fn nents(&self, dim: usize) -> Result<usize, MeshWeldError> {
        Ok(self.dim_data(dim)?.nents)
    }

    /// Declare the local vertex set.
    pub fn set_verts(&mut self, nverts: usize) {
        self.dims[VERT].nents = nverts;
    }

    /// Install entities of `dim` from their vertex connectivity, plus (for
    /// `dim >= 2`) the aligned down-adjacency onto `dim - 1`.
    pub fn set_ents(
        &mut self,
        dim: usize,
        ents2verts: Vec<usize>,
        down: Option<Adj>,
    ) -> Result<(), MeshWeldError> {
        let deg = self.family.degree(dim, VERT)?;
        if ents2verts.len() % deg != 0 {
            return Err(MeshWeldError::RaggedConnectivity {
                len: ents2verts.len(),
                degree: deg,
            });
        }
        let nverts = self.dims[VERT].nents;
        if let Some(&bad) = ents2verts.iter().find(|&&v| v >= nverts) {
            return Err(MeshWeldError::VertexOutOfBounds { vertex: bad, nverts });
        }
        let nents = ents2verts.len() / deg;
        let data = self.dim_data_mut(dim)?;
        data.nents = nents;
        data.ents2verts = ents2verts;
        data.down = down;
        Ok(())
    }

    /// Entity-to-vertex connectivity of `dim`.
    pub fn ask_verts_of(&self, dim: usize) -> Result<&[usize], MeshWeldError> {
        Ok(&self.dim_data(dim)?.ents2verts)
    }

    /// Down-adjacency of `dim` onto `dim - 1` (present for `dim >= 2`).
    pub fn ask_down(&self, dim: usize) -> Result<Option<&Adj>, MeshWeldError> {
        Ok(self.dim_data(dim)?.down.as_ref())
    }

    /// Inverse fan of `ask_verts_of(dim)`: per-vertex offsets into a list of
    /// incident dimension-`dim` entities, each list sorted ascending.
    pub fn ask_up(&self, dim: usize) -> Result<(Vec<usize>, Vec<usize>), MeshWeldError> {
        let deg = self.family.degree(dim, VERT)?;
        let ents2verts = self.ask_verts_of(dim)?;
        let nverts = self.dims[VERT].nents;
        let mut offsets = vec![0usize; nverts + 1];
        for &v in ents2verts {
            offsets[v + 1] += 1;
        }
        for v in 0..nverts {
            offsets[v + 1] += offsets[v];
        }
        let mut fill = offsets.clone();
        let mut entries = vec![0usize; ents2verts.len()];
        // Entity index ascends with the scan, so each vertex's list is sorted.
        for (ent, verts) in ents2verts.chunks_exact(deg).enumerate() {
            for &v in verts {
                entries[fill[v]] = ent;
                fill[v] += 1;
            }
        }
        Ok((offsets, entries))
    }

    /// Record owner references for `dim`, one per local entity.
    pub fn set_owners(&mut self, dim: usize, owners: Remotes) -> Result<(), MeshWeldError> {
        let data = self.dim_data_mut(dim)?;
        if owners.len() != data.nents {
            return Err(MeshWeldError::OwnerCountMismatch {
                nowners: owners.len(),
                nents: data.nents,
            });
        }
        data.owners = Some(owners);
        Ok(())
    }

    pub fn owners(&self, dim: usize) -> Result<Option<&Remotes>, MeshWeldError> {
        Ok(self.dim_data(dim)?.owners.as_ref())
    }

    /// Attach a named per-entity tag, replacing any previous one.
    pub fn add_tag(
        &mut self,
        dim: usize,
        name: &str,
        ncomps: usize,
        data: TagData,
    ) -> Result<(), MeshWeldError> {
        let nents = self.dim_data(dim)?.nents;
        if data.len() != nents * ncomps {
            return Err(MeshWeldError::TagSizeMismatch {
                name: name.to_owned(),
                len: data.len(),
                nents,
                ncomps,
            });
        }
        self.dim_data_mut(dim)?
            .tags
            .insert(name.to_owned(), Tag { ncomps, data });
        Ok(())
    }

    pub fn get_tag(&self, dim: usize, name: &str) -> Result<Option<&Tag>, MeshWeldError> {
        Ok(self.dim_data(dim)?.tags.get(name))
    }

    /// The `"global"` tag of `dim` as a slice, if present.
    pub fn globals_of(&self, dim: usize) -> Result<Option<&[u64]>, MeshWeldError> {
        Ok(self.get_tag(dim, "global")?.and_then(|tag| match &tag.data {
            TagData::U64(v) => Some(v.as_slice()),
            TagData::F64(_) => None,
        }))
    }

    /// Iterate over the tag names of `dim`.
    pub fn tag_names(&self, dim: usize) -> Result<Vec<&str>, MeshWeldError> {
        Ok(self.dim_data(dim)?.tags.keys().map(String::as_str).collect())
    }

    /// Permute the vertex dimension: vertex `old` becomes `perm[old]`.
    /// Rewrites vertex-indexed tags, vertex owners, and every dimension's
    /// entity-to-vertex table. Owner *indices* on remote ranks are not
    /// repaired here; the orchestrator follows up with an owner-index
    /// exchange (see `build::reorder_by_globals`).
    pub(crate) fn permute_verts(&mut self, perm: &[usize]) -> Result<(), MeshWeldError> {
        let nverts = self.dims[VERT].nents;
        debug_assert_eq!(perm.len(), nverts);
        for data in &mut self.dims {
            for v in &mut data.ents2verts {
                *v = perm[*v];
            }
        }
        let vert_data = &mut self.dims[VERT];
        if let Some(owners) = &mut vert_data.owners {
            let mut permuted = owners.clone();
            for (old, &new) in perm.iter().enumerate() {
                permuted[new] = owners[old];
            }
            *owners = permuted;
        }
        for tag in vert_data.tags.values_mut() {
            let ncomps = tag.ncomps;
            match &mut tag.data {
                TagData::U64(v) => permute_rows(v, perm, ncomps),
                TagData::F64(v) => permute_rows(v, perm, ncomps),
            }
        }
        Ok(())
    }
}

fn permute_rows<T: Copy>(values: &mut [T], perm: &[usize], ncomps: usize) {
    let old = values.to_vec();
    for (i, &new) in perm.iter().enumerate() {
        values[new * ncomps..(new + 1) * ncomps]
            .copy_from_slice(&old[i * ncomps..(i + 1) * ncomps]);
    }
}
