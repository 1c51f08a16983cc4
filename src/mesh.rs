//! The mesh partition seen by operators.
//!
//! Operators only need entity counts, global numbering, a little connectivity and
//! centroids (for diagnostic output). [`MeshPartition`] captures exactly that;
//! [`PartitionedMesh`] is a plain, explicitly stored implementation.
use crate::entity::{EntityKind, ParallelType};
use crate::error::{OperatorError, Result};
use nalgebra::Point3;

pub mod procedural;

/// The slice of a distributed mesh held by one process.
///
/// Local entity indices are ordered with all owned entities first, followed by ghosts.
pub trait MeshPartition {
    /// Spatial dimension of the mesh.
    fn dim(&self) -> usize;

    fn num_entities(&self, kind: EntityKind, ptype: ParallelType) -> usize;

    /// Total number of entities of the given kind across all partitions.
    fn num_global_entities(&self, kind: EntityKind) -> usize;

    fn global_id(&self, kind: EntityKind, local: usize) -> usize;

    fn cell_faces(&self, cell: usize) -> &[usize];

    /// Cells adjacent to a face, owned and ghost.
    fn face_cells(&self, face: usize) -> &[usize];

    /// Index of the boundary-face entity attached to a face, if the face lies on the boundary.
    fn face_boundary_index(&self, face: usize) -> Option<usize>;

    fn centroid(&self, kind: EntityKind, local: usize) -> Point3<f64>;
}

/// Entities of one kind: owned first, then ghosts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitySet {
    pub num_owned: usize,
    pub num_global: usize,
    pub global_ids: Vec<usize>,
    /// Either empty or one centroid per entity.
    pub centroids: Vec<Point3<f64>>,
}

impl EntitySet {
    /// A set of `n` owned entities numbered `0..n`.
    pub fn owned(n: usize) -> Self {
        Self {
            num_owned: n,
            num_global: n,
            global_ids: (0..n).collect(),
            centroids: Vec::new(),
        }
    }

    pub fn with_centroids(self, centroids: Vec<Point3<f64>>) -> Self {
        Self { centroids, ..self }
    }

    fn num_all(&self) -> usize {
        self.global_ids.len()
    }
}

/// Raw ingredients of a [`PartitionedMesh`].
#[derive(Debug, Clone, Default)]
pub struct MeshParts {
    pub dim: usize,
    pub cells: EntitySet,
    pub faces: EntitySet,
    pub nodes: EntitySet,
    pub edges: EntitySet,
    pub boundary_faces: EntitySet,
    /// Faces of every (owned and ghost) cell.
    pub cell_faces: Vec<Vec<usize>>,
    /// Parent face of every boundary face.
    pub boundary_face_parents: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct PartitionedMesh {
    dim: usize,
    entities: [EntitySet; 5],
    cell_faces: Vec<Vec<usize>>,
    face_cells: Vec<Vec<usize>>,
    face_boundary: Vec<Option<usize>>,
}

impl PartitionedMesh {
    pub fn try_from_parts(parts: MeshParts) -> Result<Self> {
        let MeshParts {
            dim,
            cells,
            faces,
            nodes,
            edges,
            boundary_faces,
            cell_faces,
            boundary_face_parents,
        } = parts;

        let entities = [cells, faces, nodes, edges, boundary_faces];
        for kind in EntityKind::ALL {
            let set = &entities[kind.index()];
            if set.num_owned > set.num_all() {
                return Err(OperatorError::structural(format!(
                    "{} owned {} entities exceed the {} stored",
                    set.num_owned,
                    kind,
                    set.num_all()
                )));
            }
            if !set.centroids.is_empty() && set.centroids.len() != set.num_all() {
                return Err(OperatorError::structural(format!(
                    "got {} centroids for {} {} entities",
                    set.centroids.len(),
                    set.num_all(),
                    kind
                )));
            }
            if let Some(gid) = set.global_ids.iter().find(|gid| **gid >= set.num_global) {
                return Err(OperatorError::structural(format!(
                    "global id {} of a {} entity is out of range (global count {})",
                    gid, kind, set.num_global
                )));
            }
        }

        let num_cells = entities[EntityKind::Cell.index()].num_all();
        let num_faces = entities[EntityKind::Face.index()].num_all();
        let num_bnd_faces = entities[EntityKind::BoundaryFace.index()].num_all();

        if cell_faces.len() != num_cells {
            return Err(OperatorError::structural(format!(
                "cell-face connectivity has {} entries for {} cells",
                cell_faces.len(),
                num_cells
            )));
        }
        if boundary_face_parents.len() != num_bnd_faces {
            return Err(OperatorError::structural(format!(
                "{} boundary face parents given for {} boundary faces",
                boundary_face_parents.len(),
                num_bnd_faces
            )));
        }

        let mut face_cells = vec![Vec::new(); num_faces];
        for (c, faces) in cell_faces.iter().enumerate() {
            for &f in faces {
                let adjacent = face_cells.get_mut(f).ok_or_else(|| {
                    OperatorError::structural(format!("cell {} references face {} out of {}", c, f, num_faces))
                })?;
                adjacent.push(c);
            }
        }

        let mut face_boundary = vec![None; num_faces];
        for (b, &f) in boundary_face_parents.iter().enumerate() {
            let slot = face_boundary.get_mut(f).ok_or_else(|| {
                OperatorError::structural(format!("boundary face {} references face {} out of {}", b, f, num_faces))
            })?;
            *slot = Some(b);
        }

        Ok(Self {
            dim,
            entities,
            cell_faces,
            face_cells,
            face_boundary,
        })
    }

    fn set(&self, kind: EntityKind) -> &EntitySet {
        &self.entities[kind.index()]
    }
}

impl MeshPartition for PartitionedMesh {
    fn dim(&self) -> usize {
        self.dim
    }

    fn num_entities(&self, kind: EntityKind, ptype: ParallelType) -> usize {
        let set = self.set(kind);
        match ptype {
            ParallelType::Owned => set.num_owned,
            ParallelType::All => set.num_all(),
        }
    }

    fn num_global_entities(&self, kind: EntityKind) -> usize {
        self.set(kind).num_global
    }

    fn global_id(&self, kind: EntityKind, local: usize) -> usize {
        self.set(kind).global_ids[local]
    }

    fn cell_faces(&self, cell: usize) -> &[usize] {
        &self.cell_faces[cell]
    }

    fn face_cells(&self, face: usize) -> &[usize] {
        &self.face_cells[face]
    }

    fn face_boundary_index(&self, face: usize) -> Option<usize> {
        self.face_boundary[face]
    }

    fn centroid(&self, kind: EntityKind, local: usize) -> Point3<f64> {
        self.set(kind)
            .centroids
            .get(local)
            .copied()
            .unwrap_or_else(Point3::origin)
    }
}

/// Restriction of operators to a lower-dimensional surface made of mesh faces.
///
/// Surface cells are faces of the parent mesh; surface faces connect neighboring
/// surface cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceEmbedding {
    cell_parent_faces: Vec<usize>,
    num_owned_cells: usize,
    face_cells: Vec<Vec<usize>>,
    num_owned_faces: usize,
}

impl SurfaceEmbedding {
    pub fn try_new(
        mesh: &dyn MeshPartition,
        cell_parent_faces: Vec<usize>,
        num_owned_cells: usize,
        face_cells: Vec<Vec<usize>>,
        num_owned_faces: usize,
    ) -> Result<Self> {
        let num_parent_faces = mesh.num_entities(EntityKind::Face, ParallelType::All);
        if num_owned_cells > cell_parent_faces.len() || num_owned_faces > face_cells.len() {
            return Err(OperatorError::structural(
                "surface embedding has more owned entities than stored entities",
            ));
        }
        if let Some(f) = cell_parent_faces.iter().find(|f| **f >= num_parent_faces) {
            return Err(OperatorError::structural(format!(
                "surface cell parent face {} is out of range ({} faces)",
                f, num_parent_faces
            )));
        }
        for cells in &face_cells {
            if let Some(c) = cells.iter().find(|c| **c >= cell_parent_faces.len()) {
                return Err(OperatorError::structural(format!(
                    "surface face references surface cell {} out of {}",
                    c,
                    cell_parent_faces.len()
                )));
            }
        }
        Ok(Self {
            cell_parent_faces,
            num_owned_cells,
            face_cells,
            num_owned_faces,
        })
    }

    pub fn num_cells(&self, ptype: ParallelType) -> usize {
        match ptype {
            ParallelType::Owned => self.num_owned_cells,
            ParallelType::All => self.cell_parent_faces.len(),
        }
    }

    pub fn num_faces(&self, ptype: ParallelType) -> usize {
        match ptype {
            ParallelType::Owned => self.num_owned_faces,
            ParallelType::All => self.face_cells.len(),
        }
    }

    pub fn parent_face(&self, surface_cell: usize) -> usize {
        self.cell_parent_faces[surface_cell]
    }

    pub fn face_cells(&self, surface_face: usize) -> &[usize] {
        &self.face_cells[surface_face]
    }
}
