//! Local operator blocks.
//!
//! An [`Op`] stores one small dense matrix (or a diagonal) per entity it iterates over,
//! together with tables mapping each local row and column to a `(component, entity, dof)`
//! triple of the enclosing operator's unknown space.
use crate::entity::{EntityKind, ParallelType};
use crate::error::{OperatorError, Result};
use crate::mesh::{MeshPartition, SurfaceEmbedding};
use crate::schema::Schema;
use crate::space::CompositeVector;
use eyre::WrapErr;
use nalgebra::{DMatrix, DMatrixViewMut, DVector, DVectorViewMut};
use std::fmt;

/// The closed set of local block layouts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Diagonal coupling of cell unknowns.
    CellCell,
    /// Face-face coupling assembled cell by cell.
    CellFace,
    /// Coupled face and cell unknowns of a cell, faces first.
    CellFaceCell,
    /// Cell-cell coupling assembled face by face.
    FaceCell,
    /// Like [`OpKind::FaceCell`], with an extra boundary-face unknown on boundary faces.
    FaceCellBndFace,
    /// Diagonal on the parent faces of surface cells.
    SurfaceCellSurfaceCell,
    /// Coupling of the parent faces of the surface cells adjacent to a surface face.
    SurfaceFaceSurfaceCell,
}

impl OpKind {
    pub fn is_diagonal(&self) -> bool {
        matches!(self, Self::CellCell | Self::SurfaceCellSurfaceCell)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CellCell => "CellCell",
            Self::CellFace => "CellFace",
            Self::CellFaceCell => "CellFaceCell",
            Self::FaceCell => "FaceCell",
            Self::FaceCellBndFace => "FaceCellBndFace",
            Self::SurfaceCellSurfaceCell => "SurfaceCellSurfaceCell",
            Self::SurfaceFaceSurfaceCell => "SurfaceFaceSurfaceCell",
        };
        write!(f, "{}", name)
    }
}

/// A local row or column of a block.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LocalDof {
    /// Index into the block's row (or column) component names.
    pub slot: usize,
    /// Local index of the entity in the component's space.
    pub entity: usize,
    pub dof: usize,
}

impl LocalDof {
    pub fn new(slot: usize, entity: usize, dof: usize) -> Self {
        Self { slot, entity, dof }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpData {
    Local(Vec<DMatrix<f64>>),
    Diagonal(Vec<DVector<f64>>),
}

impl OpData {
    fn fill_zero(&mut self) {
        match self {
            Self::Local(matrices) => matrices.iter_mut().for_each(|m| m.fill(0.0)),
            Self::Diagonal(diagonals) => diagonals.iter_mut().for_each(|d| d.fill(0.0)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Op {
    kind: OpKind,
    name: String,
    schema_row: Schema,
    schema_col: Schema,
    row_components: Vec<String>,
    col_components: Vec<String>,
    rows: Vec<Vec<LocalDof>>,
    cols: Vec<Vec<LocalDof>>,
    data: OpData,
    vectors: Vec<DVector<f64>>,
    shadow: Option<OpData>,
    revision: u64,
}

impl Op {
    #[allow(clippy::too_many_arguments)]
    fn from_tables(
        kind: OpKind,
        name: impl Into<String>,
        schema_row: Schema,
        schema_col: Schema,
        row_components: Vec<String>,
        col_components: Vec<String>,
        rows: Vec<Vec<LocalDof>>,
        cols: Vec<Vec<LocalDof>>,
    ) -> Self {
        debug_assert_eq!(rows.len(), cols.len());
        let data = if kind.is_diagonal() {
            OpData::Diagonal(rows.iter().map(|r| DVector::zeros(r.len())).collect())
        } else {
            OpData::Local(
                rows.iter()
                    .zip(&cols)
                    .map(|(r, c)| DMatrix::zeros(r.len(), c.len()))
                    .collect(),
            )
        };
        let vectors = rows.iter().map(|r| DVector::zeros(r.len())).collect();
        Self {
            kind,
            name: name.into(),
            schema_row,
            schema_col,
            row_components,
            col_components,
            rows,
            cols,
            data,
            vectors,
            shadow: None,
            revision: 0,
        }
    }

    fn square(kind: OpKind, name: impl Into<String>, schema: Schema, components: Vec<String>, rows: Vec<Vec<LocalDof>>) -> Self {
        Self::from_tables(kind, name, schema.clone(), schema, components.clone(), components, rows.clone(), rows)
    }

    /// Diagonal block with `num_dofs` unknowns per owned cell.
    pub fn cell_cell(name: impl Into<String>, mesh: &dyn MeshPartition, cell_component: &str, num_dofs: usize) -> Self {
        let ncells = mesh.num_entities(EntityKind::Cell, ParallelType::Owned);
        let rows = (0..ncells)
            .map(|c| (0..num_dofs).map(|d| LocalDof::new(0, c, d)).collect())
            .collect();
        let schema = Schema::init(EntityKind::Cell, EntityKind::Cell, num_dofs);
        Self::square(OpKind::CellCell, name, schema, vec![cell_component.to_string()], rows)
    }

    /// Face-face matrix on every owned cell.
    pub fn cell_face(name: impl Into<String>, mesh: &dyn MeshPartition, face_component: &str) -> Self {
        let ncells = mesh.num_entities(EntityKind::Cell, ParallelType::Owned);
        let rows = (0..ncells)
            .map(|c| {
                mesh.cell_faces(c)
                    .iter()
                    .map(|f| LocalDof::new(0, *f, 0))
                    .collect()
            })
            .collect();
        let schema = Schema::init(EntityKind::Cell, EntityKind::Face, 1);
        Self::square(OpKind::CellFace, name, schema, vec![face_component.to_string()], rows)
    }

    /// Mixed face and cell matrix on every owned cell: the faces of the cell, followed
    /// by `cell_dofs` cell unknowns.
    pub fn cell_face_cell(
        name: impl Into<String>,
        mesh: &dyn MeshPartition,
        face_component: &str,
        cell_component: &str,
        cell_dofs: usize,
    ) -> Self {
        let ncells = mesh.num_entities(EntityKind::Cell, ParallelType::Owned);
        let rows = (0..ncells)
            .map(|c| {
                let faces = mesh.cell_faces(c).iter().map(|f| LocalDof::new(0, *f, 0));
                let cells = (0..cell_dofs).map(|d| LocalDof::new(1, c, d));
                faces.chain(cells).collect()
            })
            .collect();
        let schema = Schema::new(EntityKind::Cell)
            .with_item(EntityKind::Face, 1)
            .with_item(EntityKind::Cell, cell_dofs);
        let components = vec![face_component.to_string(), cell_component.to_string()];
        Self::square(OpKind::CellFaceCell, name, schema, components, rows)
    }

    /// Cell-cell matrix on every owned face, over the cells adjacent to the face.
    pub fn face_cell(name: impl Into<String>, mesh: &dyn MeshPartition, cell_component: &str) -> Self {
        let nfaces = mesh.num_entities(EntityKind::Face, ParallelType::Owned);
        let rows = (0..nfaces)
            .map(|f| {
                mesh.face_cells(f)
                    .iter()
                    .map(|c| LocalDof::new(0, *c, 0))
                    .collect()
            })
            .collect();
        let schema = Schema::init(EntityKind::Face, EntityKind::Cell, 1);
        Self::square(OpKind::FaceCell, name, schema, vec![cell_component.to_string()], rows)
    }

    /// Like [`Op::face_cell`], with the boundary-face unknown appended on boundary faces.
    pub fn face_cell_bnd_face(
        name: impl Into<String>,
        mesh: &dyn MeshPartition,
        cell_component: &str,
        boundary_component: &str,
    ) -> Self {
        let nfaces = mesh.num_entities(EntityKind::Face, ParallelType::Owned);
        let rows = (0..nfaces)
            .map(|f| {
                let cells = mesh.face_cells(f).iter().map(|c| LocalDof::new(0, *c, 0));
                let boundary = mesh.face_boundary_index(f).map(|b| LocalDof::new(1, b, 0));
                cells.chain(boundary).collect()
            })
            .collect();
        let schema = Schema::new(EntityKind::Face)
            .with_item(EntityKind::Cell, 1)
            .with_item(EntityKind::BoundaryFace, 1);
        let components = vec![cell_component.to_string(), boundary_component.to_string()];
        Self::square(OpKind::FaceCellBndFace, name, schema, components, rows)
    }

    /// Diagonal on the parent face of every owned surface cell.
    pub fn surface_cell_surface_cell(name: impl Into<String>, surface: &SurfaceEmbedding, face_component: &str) -> Self {
        let rows = (0..surface.num_cells(ParallelType::Owned))
            .map(|s| vec![LocalDof::new(0, surface.parent_face(s), 0)])
            .collect();
        let schema = Schema::init(EntityKind::Cell, EntityKind::Face, 1);
        Self::square(OpKind::SurfaceCellSurfaceCell, name, schema, vec![face_component.to_string()], rows)
    }

    /// Matrix on every owned surface face, over the parent faces of the adjacent surface cells.
    pub fn surface_face_surface_cell(name: impl Into<String>, surface: &SurfaceEmbedding, face_component: &str) -> Self {
        let rows = (0..surface.num_faces(ParallelType::Owned))
            .map(|sf| {
                surface
                    .face_cells(sf)
                    .iter()
                    .map(|s| LocalDof::new(0, surface.parent_face(*s), 0))
                    .collect()
            })
            .collect();
        let schema = Schema::init(EntityKind::Face, EntityKind::Face, 1);
        Self::square(OpKind::SurfaceFaceSurfaceCell, name, schema, vec![face_component.to_string()], rows)
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema_row(&self) -> &Schema {
        &self.schema_row
    }

    pub fn schema_col(&self) -> &Schema {
        &self.schema_col
    }

    /// `name(kind): row schema x col schema`, as used in diagnostics.
    pub fn schema_string(&self) -> String {
        format!("{}({}): {} x {}", self.name, self.kind, self.schema_row, self.schema_col)
    }

    pub fn row_components(&self) -> &[String] {
        &self.row_components
    }

    pub fn col_components(&self) -> &[String] {
        &self.col_components
    }

    pub fn num_entities(&self) -> usize {
        self.rows.len()
    }

    pub fn row_dofs(&self, entity: usize) -> &[LocalDof] {
        &self.rows[entity]
    }

    pub fn col_dofs(&self, entity: usize) -> &[LocalDof] {
        &self.cols[entity]
    }

    pub fn data(&self) -> &OpData {
        &self.data
    }

    /// Counter bumped by every mutable access to the local matrices.
    ///
    /// Local vectors are not tracked, since they never enter an assembled matrix.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    fn check_entity(&self, entity: usize) -> Result<(usize, usize)> {
        match (self.rows.get(entity), self.cols.get(entity)) {
            (Some(rows), Some(cols)) => Ok((rows.len(), cols.len())),
            _ => Err(OperatorError::structural(format!(
                "entity {} is out of range for block `{}` with {} entities",
                entity,
                self.name,
                self.rows.len()
            ))),
        }
    }

    pub fn local_matrix(&self, entity: usize) -> Option<&DMatrix<f64>> {
        match &self.data {
            OpData::Local(matrices) => matrices.get(entity),
            OpData::Diagonal(_) => None,
        }
    }

    pub fn local_matrix_mut(&mut self, entity: usize) -> Option<&mut DMatrix<f64>> {
        self.touch();
        match &mut self.data {
            OpData::Local(matrices) => matrices.get_mut(entity),
            OpData::Diagonal(_) => None,
        }
    }

    pub fn local_diagonal(&self, entity: usize) -> Option<&DVector<f64>> {
        match &self.data {
            OpData::Diagonal(diagonals) => diagonals.get(entity),
            OpData::Local(_) => None,
        }
    }

    pub fn local_diagonal_mut(&mut self, entity: usize) -> Option<&mut DVector<f64>> {
        self.touch();
        match &mut self.data {
            OpData::Diagonal(diagonals) => diagonals.get_mut(entity),
            OpData::Local(_) => None,
        }
    }

    /// The local block of an entity as a dense matrix, for either storage.
    pub fn dense_local_matrix(&self, entity: usize) -> Option<DMatrix<f64>> {
        match &self.data {
            OpData::Local(matrices) => matrices.get(entity).cloned(),
            OpData::Diagonal(diagonals) => diagonals.get(entity).map(|d| DMatrix::from_diagonal(d)),
        }
    }

    pub fn set_local_matrix(&mut self, entity: usize, matrix: DMatrix<f64>) -> Result<()> {
        let expected = self.check_entity(entity)?;
        if self.kind.is_diagonal() {
            return Err(OperatorError::structural(format!(
                "{} blocks store diagonals, not local matrices",
                self.kind
            )));
        }
        if matrix.shape() != expected {
            return Err(OperatorError::structural(format!(
                "local matrix of entity {} has shape {:?}, expected {:?}",
                entity,
                matrix.shape(),
                expected
            )));
        }
        if let Some(slot) = self.local_matrix_mut(entity) {
            *slot = matrix;
        }
        Ok(())
    }

    pub fn set_local_diagonal(&mut self, entity: usize, diagonal: DVector<f64>) -> Result<()> {
        let (expected, _) = self.check_entity(entity)?;
        if !self.kind.is_diagonal() {
            return Err(OperatorError::structural(format!(
                "{} blocks store local matrices, not diagonals",
                self.kind
            )));
        }
        if diagonal.len() != expected {
            return Err(OperatorError::structural(format!(
                "local diagonal of entity {} has length {}, expected {}",
                entity,
                diagonal.len(),
                expected
            )));
        }
        if let Some(slot) = self.local_diagonal_mut(entity) {
            *slot = diagonal;
        }
        Ok(())
    }

    /// Overwrites every local matrix through a callback.
    ///
    /// Diagonal blocks are presented as `n x 1` matrices.
    pub fn fill_local_matrices(
        &mut self,
        mut f: impl FnMut(usize, DMatrixViewMut<f64>) -> eyre::Result<()>,
    ) -> eyre::Result<()> {
        self.touch();
        match &mut self.data {
            OpData::Local(matrices) => {
                for (e, m) in matrices.iter_mut().enumerate() {
                    f(e, DMatrixViewMut::from(m)).wrap_err_with(|| format!("failed to fill local matrix {}", e))?;
                }
            }
            OpData::Diagonal(diagonals) => {
                for (e, d) in diagonals.iter_mut().enumerate() {
                    let n = d.len();
                    let view = DMatrixViewMut::from_slice(d.as_mut_slice(), n, 1);
                    f(e, view).wrap_err_with(|| format!("failed to fill local diagonal {}", e))?;
                }
            }
        }
        Ok(())
    }

    pub fn local_vector(&self, entity: usize) -> &DVector<f64> {
        &self.vectors[entity]
    }

    pub fn local_vector_mut(&mut self, entity: usize) -> DVectorViewMut<f64> {
        DVectorViewMut::from(&mut self.vectors[entity])
    }

    pub fn set_local_vector(&mut self, entity: usize, vector: DVector<f64>) -> Result<()> {
        let (expected, _) = self.check_entity(entity)?;
        if vector.len() != expected {
            return Err(OperatorError::structural(format!(
                "local vector of entity {} has length {}, expected {}",
                entity,
                vector.len(),
                expected
            )));
        }
        self.vectors[entity] = vector;
        Ok(())
    }

    pub fn local_vectors(&self) -> &[DVector<f64>] {
        &self.vectors
    }

    /// Clears local matrices and local vectors.
    pub fn zero(&mut self) {
        self.touch();
        self.data.fill_zero();
        self.vectors.iter_mut().for_each(|v| v.fill(0.0));
    }

    pub fn rescale(&mut self, factor: f64) {
        self.touch();
        match &mut self.data {
            OpData::Local(matrices) => matrices.iter_mut().for_each(|m| m.scale_mut(factor)),
            OpData::Diagonal(diagonals) => diagonals.iter_mut().for_each(|d| d.scale_mut(factor)),
        }
    }

    /// Scales every local row by the weight stored at that row's unknown.
    ///
    /// Ghost values of `weights` must be current.
    pub fn rescale_by(&mut self, weights: &CompositeVector) -> Result<()> {
        let slots = self
            .row_components
            .iter()
            .map(|name| {
                weights.space().index_of(name).ok_or_else(|| OperatorError::MissingComponent {
                    block: 0,
                    component: name.clone(),
                    dof: 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let weight = |dof: &LocalDof| weights.data(slots[dof.slot])[(dof.dof, dof.entity)];
        self.touch();

        match &mut self.data {
            OpData::Local(matrices) => {
                for (m, rows) in matrices.iter_mut().zip(&self.rows) {
                    for (i, dof) in rows.iter().enumerate() {
                        m.row_mut(i).scale_mut(weight(dof));
                    }
                }
            }
            OpData::Diagonal(diagonals) => {
                for (d, rows) in diagonals.iter_mut().zip(&self.rows) {
                    for (i, dof) in rows.iter().enumerate() {
                        d[i] *= weight(dof);
                    }
                }
            }
        }
        Ok(())
    }

    /// Stores a copy of the current local matrices.
    pub fn save_shadow(&mut self) {
        self.shadow = Some(self.data.clone());
    }

    /// Restores the local matrices saved by [`Op::save_shadow`]. Returns `false` if
    /// there was nothing to restore.
    pub fn restore_shadow(&mut self) -> bool {
        match &self.shadow {
            Some(shadow) => {
                self.data.clone_from(shadow);
                self.revision = self.revision.wrapping_add(1);
                true
            }
            None => false,
        }
    }

    pub fn has_shadow(&self) -> bool {
        self.shadow.is_some()
    }

    pub fn clear_shadow(&mut self) {
        self.shadow = None;
    }
}
