//! Unified error type for mesh-weld public APIs.
//!
//! Every contract violation detected by the build core maps to one variant
//! here. All of them are fatal for the build in progress: a distributed mesh
//! construction either completes on every rank or aborts on every rank, so
//! callers are expected to treat any `Err` as terminal for the mesh object.

use thiserror::Error;

/// Unified error type for mesh-weld operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshWeldError {
    /// Entity-to-vertex table length is not a multiple of the entity degree.
    #[error("connectivity of length {len} is not a multiple of degree {degree}")]
    RaggedConnectivity { len: usize, degree: usize },
    /// Entity degree outside the supported 2..=4 range.
    #[error("unsupported entity degree {0} (expected 2, 3, or 4)")]
    UnsupportedDegree(usize),
    /// A local vertex index exceeds the local vertex count.
    #[error("vertex index {vertex} out of bounds for {nverts} local vertices")]
    VertexOutOfBounds { vertex: usize, nverts: usize },
    /// Per-entity code list does not match the entity count of a table.
    #[error("{ncodes} alignment codes for {nents} entities")]
    CodeCountMismatch { ncodes: usize, nents: usize },
    /// Payload length does not match `nitems * width`.
    #[error("payload of length {len} does not cover {nitems} items of width {width}")]
    PayloadSizeMismatch {
        len: usize,
        nitems: usize,
        width: usize,
    },
    /// A destination rank falls outside the communicator.
    #[error("destination rank {rank} outside communicator of size {size}")]
    RankOutOfBounds { rank: usize, size: usize },
    /// A received destination index exceeds the local root count.
    #[error("destination index {index} from rank {from} out of bounds for {nroots} local roots")]
    RootOutOfBounds {
        index: usize,
        from: usize,
        nroots: usize,
    },
    /// An owner reference points at a slot that is not owned on its rank.
    #[error("owner reference (rank {rank}, index {index}) is not locally owned on its rank")]
    CorruptOwner { rank: usize, index: usize },
    /// A point-to-point exchange with a neighbor failed or was truncated.
    #[error("communication with rank {neighbor} failed: {reason}")]
    CommError { neighbor: usize, reason: String },
    /// Unsupported (family, high dim, low dim) combination.
    #[error("no {family:?} topology for dimension {high} over dimension {low}")]
    UnsupportedTopology {
        family: crate::element::Family,
        high: usize,
        low: usize,
    },
    /// A derived use refers to a lower entity that was never enumerated.
    #[error("element {elem} uses a dimension-{low_dim} entity absent from the derived set")]
    MissingDownEntity { elem: usize, low_dim: usize },
    /// A derived use matches a lower entity as a set but under no dihedral code.
    #[error("element {elem} use of dimension-{low_dim} entity {low} aligns with no stored orientation")]
    UnalignableUse {
        elem: usize,
        low_dim: usize,
        low: usize,
    },
    /// Elements may be shared across ranks but no element globals were given.
    #[error("shared elements require externally supplied element globals")]
    MissingElemGlobals,
    /// An owner table has the wrong length for its dimension.
    #[error("{nowners} owner references for {nents} entities")]
    OwnerCountMismatch { nowners: usize, nents: usize },
    /// A per-entity tag array has the wrong length for its dimension.
    #[error("tag `{name}` has {len} values for {nents} entities of {ncomps} components")]
    TagSizeMismatch {
        name: String,
        len: usize,
        nents: usize,
        ncomps: usize,
    },
    /// Queried a dimension the mesh does not carry.
    #[error("dimension {dim} out of range for a {mesh_dim}-dimensional mesh")]
    DimOutOfRange { dim: usize, mesh_dim: usize },
}
