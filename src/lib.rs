//! # mesh-weld
//!
//! mesh-weld builds the connectivity of a distributed unstructured mesh
//! (vertices, edges, faces, regions) from a partitioned elements-to-vertices
//! description, assigning a single deterministic, partition-independent owner
//! and global number to every derived entity. A shared edge or face is
//! re-derived independently on every rank that touches it, with inconsistent
//! local vertex orders and no global identity; the crate's job is to make all
//! of those copies agree.
//!
//! ## How it works
//! - [`canon`] canonicalizes entity vertex order as a pure function of vertex
//!   global numbers, so all copies of an entity carry the same tuple.
//! - [`linpart`] assigns contiguous ranges of the global ID space to ranks by
//!   pure arithmetic, giving every entity a serving rank computable with no
//!   prior ownership information.
//! - [`dist`] is the reusable many-to-many distribution: build once, exchange
//!   fixed-width payloads, invert to send results back to origin.
//! - [`owners`] routes every copy to its serving rank, elects the minimum
//!   `(rank, index)` copy per canonical tuple as owner, and reports it back.
//! - [`build`] orchestrates assembly dimension by dimension and attaches
//!   ownership-driven global numbering.
//!
//! ## Determinism
//! Resolution results depend only on the global topology and the set of
//! participating copies: received records are totally ordered by
//! `(root, rank, index)` and elections are explicit min-reductions, so
//! process count, message timing, and local array order cannot influence the
//! outcome.
//!
//! ## Communication backends
//! [`comm::NoComm`] for serial runs (and for proving a code path issues no
//! communication), [`comm::RayonComm`] for multi-rank worlds inside one
//! process (used heavily by the tests), and `comm::MpiComm` behind the
//! `mpi-support` feature for real distributed runs.

pub mod build;
pub mod canon;
pub mod comm;
pub mod dist;
pub mod element;
pub mod error;
pub mod linpart;
pub mod mesh;
pub mod owners;

/// A convenient prelude importing the most-used types and entry points.
pub mod prelude {
    pub use crate::build::{
        build_from_elems2verts, build_from_elems_and_coords, build_verts_from_globals,
    };
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::comm::{Communicator, NoComm, RayonComm, Wait};
    pub use crate::dist::{Dist, Remote, Remotes};
    pub use crate::element::{Family, VERT};
    pub use crate::error::MeshWeldError;
    pub use crate::mesh::{Adj, Mesh, Parting, Tag, TagData};
    pub use crate::owners::{owners_from_globals, resolve_derived_copies};
}
