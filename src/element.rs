//! Element families and their per-dimension topology tables.
//!
//! A family fixes how many vertices an entity of each dimension carries and
//! which vertex slots of an element form each of its lower-dimensional
//! entities (the down-templates). Dimensions 1 through 3 are covered for both
//! the simplex family (edge, triangle, tetrahedron) and the hypercube family
//! (edge, quadrilateral, hexahedron).

use serde::{Deserialize, Serialize};

use crate::error::MeshWeldError;

/// Vertices are dimension zero everywhere in the build pipeline.
pub const VERT: usize = 0;

/// Element family of a mesh.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    Simplex,
    Hypercube,
}

const TRI_EDGE_VERTS: [[usize; 2]; 3] = [[0, 1], [1, 2], [2, 0]];
const TET_EDGE_VERTS: [[usize; 2]; 6] =
    [[0, 1], [1, 2], [2, 0], [0, 3], [1, 3], [2, 3]];
const TET_TRI_VERTS: [[usize; 3]; 4] = [[0, 2, 1], [0, 1, 3], [1, 2, 3], [2, 0, 3]];

const QUAD_EDGE_VERTS: [[usize; 2]; 4] = [[0, 1], [1, 2], [2, 3], [3, 0]];
const HEX_EDGE_VERTS: [[usize; 2]; 12] = [
    [0, 1],
    [1, 2],
    [2, 3],
    [3, 0],
    [0, 4],
    [1, 5],
    [2, 6],
    [3, 7],
    [4, 5],
    [5, 6],
    [6, 7],
    [7, 4],
];
const HEX_QUAD_VERTS: [[usize; 4]; 6] = [
    [0, 3, 2, 1],
    [0, 1, 5, 4],
    [1, 2, 6, 5],
    [2, 3, 7, 6],
    [3, 0, 4, 7],
    [4, 5, 6, 7],
];

impl Family {
    /// Number of dimension-`low` entities in (or vertices of, for `low == 0`)
    /// one dimension-`high` entity.
    pub fn degree(self, high: usize, low: usize) -> Result<usize, MeshWeldError> {
        let degree = match (self, high, low) {
            (_, d, l) if d == l => 1,
            (_, 1, VERT) => 2,
            (Family::Simplex, 2, VERT) => 3,
            (Family::Simplex, 2, 1) => 3,
            (Family::Simplex, 3, VERT) => 4,
            (Family::Simplex, 3, 1) => 6,
            (Family::Simplex, 3, 2) => 4,
            (Family::Hypercube, 2, VERT) => 4,
            (Family::Hypercube, 2, 1) => 4,
            (Family::Hypercube, 3, VERT) => 8,
            (Family::Hypercube, 3, 1) => 12,
            (Family::Hypercube, 3, 2) => 6,
            _ => {
                return Err(MeshWeldError::UnsupportedTopology {
                    family: self,
                    high,
                    low,
                })
            }
        };
        Ok(degree)
    }

    /// Vertex-slot template of each dimension-`low` entity within a
    /// dimension-`high` element: `template[which][slot]` is an element vertex
    /// slot.
    pub fn down_template(
        self,
        high: usize,
        low: usize,
    ) -> Result<Vec<&'static [usize]>, MeshWeldError> {
        let rows: Vec<&'static [usize]> = match (self, high, low) {
            (Family::Simplex, 2, 1) => TRI_EDGE_VERTS.iter().map(|r| &r[..]).collect(),
            (Family::Simplex, 3, 1) => TET_EDGE_VERTS.iter().map(|r| &r[..]).collect(),
            (Family::Simplex, 3, 2) => TET_TRI_VERTS.iter().map(|r| &r[..]).collect(),
            (Family::Hypercube, 2, 1) => QUAD_EDGE_VERTS.iter().map(|r| &r[..]).collect(),
            (Family::Hypercube, 3, 1) => HEX_EDGE_VERTS.iter().map(|r| &r[..]).collect(),
            (Family::Hypercube, 3, 2) => HEX_QUAD_VERTS.iter().map(|r| &r[..]).collect(),
            _ => {
                return Err(MeshWeldError::UnsupportedTopology {
                    family: self,
                    high,
                    low,
                })
            }
        };
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrees_match_templates() {
        for family in [Family::Simplex, Family::Hypercube] {
            for high in 2..=3 {
                for low in 1..high {
                    let rows = family.down_template(high, low).unwrap();
                    assert_eq!(rows.len(), family.degree(high, low).unwrap());
                    let slot_deg = family.degree(low, VERT).unwrap();
                    assert!(rows.iter().all(|r| r.len() == slot_deg));
                }
            }
        }
    }

    #[test]
    fn vertex_degrees() {
        assert_eq!(Family::Simplex.degree(3, VERT).unwrap(), 4);
        assert_eq!(Family::Hypercube.degree(3, VERT).unwrap(), 8);
        assert_eq!(Family::Simplex.degree(1, VERT).unwrap(), 2);
        assert!(Family::Simplex.degree(4, VERT).is_err());
    }

    #[test]
    fn templates_cover_all_element_vertices() {
        let rows = Family::Hypercube.down_template(3, 1).unwrap();
        let mut seen = [false; 8];
        for row in rows {
            for &slot in row {
                seen[slot] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }
}
