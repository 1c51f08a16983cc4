//! Elimination of cell unknowns from face-cell systems.
//!
//! For every owned cell the contributions of all `CellFaceCell` and `CellCell` blocks
//! are gathered into one local system, ordered faces first:
//!
//! ```text
//! [ A_FF  A_FE ] [ x_F ]
//! [ A_EF  A_EE ] [ x_E ]
//! ```
//!
//! and the local Schur complement `S = A_FF - A_FE A_EE^{-1} A_EF` is accumulated into
//! a matrix over face unknowns only. The LU factors of `A_EE` are kept so that cell
//! values can be recovered from a face solution.
use super::dispatch::{self, GlobalDofs};
use super::Counters;
use crate::dof_map::DofMap;
use crate::entity::{EntityKind, ParallelType};
use crate::error::{OperatorError, Result};
use crate::graph::{GraphBuilder, MatrixAssembler};
use crate::inverse::InverseService;
use crate::op::{LocalDof, Op, OpData, OpKind};
use crate::schema::Schema;
use crate::space::{CompositeVector, UnknownSpace};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut, Dyn, LU};
use parking_lot::RwLock;
use rayon::prelude::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct CellElimination {
    cell: usize,
    faces: Vec<usize>,
    a_ee: LU<f64, Dyn, Dyn>,
    a_fe: DMatrix<f64>,
    a_ef: DMatrix<f64>,
}

/// The local system of one cell, before elimination.
#[derive(Debug, Clone)]
struct CellSystem {
    faces: Vec<usize>,
    num_cell_dofs: usize,
    matrix: DMatrix<f64>,
}

impl CellSystem {
    fn new(faces: Vec<usize>, num_cell_dofs: usize) -> Self {
        let n = faces.len() + num_cell_dofs;
        Self {
            faces,
            num_cell_dofs,
            matrix: DMatrix::zeros(n, n),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SchurElimination {
    face_component: String,
    cell_component: String,
    num_cell_dofs: usize,
    num_owned_cells: usize,
    face_space: Arc<UnknownSpace>,
    cells: Vec<CellElimination>,
}

impl SchurElimination {
    /// Picks the face and cell components of `space`, which must contain exactly one of each.
    pub(crate) fn new(space: &UnknownSpace) -> Result<Self> {
        let unique = |kind: EntityKind| {
            let mut candidates = space.components().iter().filter(|c| c.kind() == kind);
            match (candidates.next(), candidates.next()) {
                (Some(c), None) => Ok(c),
                _ => Err(OperatorError::structural(format!(
                    "face-cell Schur complement needs exactly one {} component",
                    kind
                ))),
            }
        };
        let face = unique(EntityKind::Face)?;
        let cell = unique(EntityKind::Cell)?;
        if face.num_dofs() != 1 {
            return Err(OperatorError::structural(format!(
                "face component `{}` must have a single dof, got {}",
                face.name(),
                face.num_dofs()
            )));
        }
        if space.components().len() != 2 {
            return Err(OperatorError::structural(
                "face-cell Schur complement expects a space with only face and cell components",
            ));
        }
        let face_space = space.subspace(&[face.name()])?;
        Ok(Self {
            face_component: face.name().to_string(),
            cell_component: cell.name().to_string(),
            num_cell_dofs: cell.num_dofs(),
            num_owned_cells: cell.num_entities(ParallelType::Owned),
            face_space: Arc::new(face_space),
            cells: Vec::new(),
        })
    }

    pub(crate) fn face_space(&self) -> &Arc<UnknownSpace> {
        &self.face_space
    }

    pub(crate) fn invalidate(&mut self) {
        self.cells.clear();
    }

    fn slot_of(&self, op: &Op, name: &str) -> Option<usize> {
        op.row_components().iter().position(|c| c == name)
    }

    pub(crate) fn symbolic_assemble_op(
        &self,
        op: &Op,
        schema_row: &Schema,
        schema_col: &Schema,
        face_map: &DofMap,
        graph: &mut GraphBuilder,
    ) -> Result<()> {
        match op.kind() {
            OpKind::CellFaceCell => {
                dispatch::check_schema(op, schema_row, schema_col)?;
                let face_slot = self.slot_of(op, &self.face_component).ok_or_else(|| dispatch::mismatch(op, schema_row))?;
                let faces = GlobalDofs::new(&[self.face_component.clone()], face_map)?;
                let mut face_dofs = Vec::new();
                let mut indices = Vec::new();
                for e in 0..op.num_entities() {
                    face_dofs.clear();
                    face_dofs.extend(
                        op.row_dofs(e)
                            .iter()
                            .filter(|dof| dof.slot == face_slot)
                            .map(|dof| LocalDof::new(0, dof.entity, dof.dof)),
                    );
                    faces.indices(&face_dofs, &mut indices)?;
                    graph.insert_block(&indices, &indices)?;
                }
                Ok(())
            }
            // Cell diagonals are eliminated entirely and leave no trace in the face matrix
            OpKind::CellCell => dispatch::check_schema(op, schema_row, schema_col),
            OpKind::CellFace | OpKind::SurfaceCellSurfaceCell | OpKind::SurfaceFaceSurfaceCell => {
                dispatch::check_schema(op, schema_row, schema_col)?;
                dispatch::symbolic_assemble_op(op, face_map, face_map, graph)
            }
            OpKind::FaceCell | OpKind::FaceCellBndFace => Err(dispatch::mismatch(op, schema_row)),
        }
    }

    /// Assembles the face matrix and refreshes the per-cell eliminations.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn numeric_assemble(
        &mut self,
        ops: &[Arc<RwLock<Op>>],
        schema_row: &Schema,
        schema_col: &Schema,
        face_map: &DofMap,
        matrix: &mut nalgebra_sparse::CsrMatrix<f64>,
        assembler: &mut MatrixAssembler,
        counters: &Counters,
    ) -> Result<()> {
        self.cells.clear();
        let mut systems: Vec<Option<CellSystem>> = vec![None; self.num_owned_cells];

        // Face layouts are fixed by the coupled blocks, so those go first
        for op in ops {
            let op = op.read();
            match op.kind() {
                OpKind::CellFaceCell => {
                    dispatch::check_schema(&op, schema_row, schema_col)?;
                    self.gather_coupled(&op, schema_row, &mut systems)?;
                }
                OpKind::CellCell => {}
                OpKind::CellFace | OpKind::SurfaceCellSurfaceCell | OpKind::SurfaceFaceSurfaceCell => {
                    dispatch::check_schema(&op, schema_row, schema_col)?;
                    dispatch::numeric_assemble_op(&op, face_map, face_map, matrix, assembler)?;
                }
                OpKind::FaceCell | OpKind::FaceCellBndFace => return Err(dispatch::mismatch(&op, schema_row)),
            }
        }
        for op in ops {
            let op = op.read();
            if op.kind() == OpKind::CellCell {
                dispatch::check_schema(&op, schema_row, schema_col)?;
                self.gather_diagonal(&op, schema_row, &mut systems)?;
            }
        }

        let results: Vec<(usize, Option<(CellElimination, DMatrix<f64>)>)> = systems
            .into_par_iter()
            .enumerate()
            .filter_map(|(cell, system)| system.map(|system| (cell, eliminate(cell, system))))
            .collect();

        let total = results.len();
        let failed: Vec<usize> = results
            .iter()
            .filter(|(_, r)| r.is_none())
            .map(|(cell, _)| *cell)
            .collect();
        counters.factorizations_ok.fetch_add(total - failed.len(), Ordering::Relaxed);
        counters.factorizations_failed.fetch_add(failed.len(), Ordering::Relaxed);
        for cell in &failed {
            warn!("singular local cell block in Schur elimination at cell {}", cell);
        }
        if let Some(&entity) = failed.first() {
            return Err(OperatorError::NumericFailure {
                failed: failed.len(),
                total,
                entity,
            });
        }

        let faces = GlobalDofs::new(&[self.face_component.clone()], face_map)?;
        let mut face_dofs = Vec::new();
        let mut indices = Vec::new();
        for (_, result) in results {
            if let Some((elimination, schur)) = result {
                face_dofs.clear();
                face_dofs.extend(elimination.faces.iter().map(|f| LocalDof::new(0, *f, 0)));
                faces.indices(&face_dofs, &mut indices)?;
                assembler.add_local_matrix(matrix, &indices, &indices, &schur)?;
                self.cells.push(elimination);
            }
        }
        debug!(
            "Schur elimination: {} cells eliminated, {} cell dofs each",
            self.cells.len(),
            self.num_cell_dofs
        );
        Ok(())
    }

    fn gather_coupled(&self, op: &Op, schema_row: &Schema, systems: &mut [Option<CellSystem>]) -> Result<()> {
        let face_slot = self.slot_of(op, &self.face_component).ok_or_else(|| dispatch::mismatch(op, schema_row))?;
        let cell_slot = self.slot_of(op, &self.cell_component).ok_or_else(|| dispatch::mismatch(op, schema_row))?;
        let local = match op.data() {
            OpData::Local(matrices) => matrices,
            OpData::Diagonal(_) => return Err(OperatorError::structural("coupled block stores a diagonal")),
        };

        let mut positions = Vec::new();
        for e in 0..op.num_entities() {
            let dofs = op.row_dofs(e);
            let cell = dofs
                .iter()
                .find(|dof| dof.slot == cell_slot)
                .map(|dof| dof.entity)
                .ok_or_else(|| OperatorError::structural(format!("coupled block entity {} has no cell unknown", e)))?;
            let system = systems
                .get_mut(cell)
                .ok_or_else(|| OperatorError::structural(format!("cell {} is not owned", cell)))?
                .get_or_insert_with(|| {
                    let faces = dofs
                        .iter()
                        .filter(|dof| dof.slot == face_slot)
                        .map(|dof| dof.entity)
                        .collect();
                    CellSystem::new(faces, self.num_cell_dofs)
                });

            positions.clear();
            for dof in dofs {
                let position = if dof.slot == face_slot {
                    system.faces.iter().position(|f| *f == dof.entity)
                } else if dof.slot == cell_slot && dof.entity == cell && dof.dof < system.num_cell_dofs {
                    Some(system.faces.len() + dof.dof)
                } else {
                    None
                };
                positions.push(position.ok_or_else(|| {
                    OperatorError::structural(format!(
                        "unknown (slot {}, entity {}) does not belong to the system of cell {}",
                        dof.slot, dof.entity, cell
                    ))
                })?);
            }

            let a = &local[e];
            for (i, pi) in positions.iter().enumerate() {
                for (j, pj) in positions.iter().enumerate() {
                    system.matrix[(*pi, *pj)] += a[(i, j)];
                }
            }
        }
        Ok(())
    }

    fn gather_diagonal(&self, op: &Op, schema_row: &Schema, systems: &mut [Option<CellSystem>]) -> Result<()> {
        let cell_slot = self.slot_of(op, &self.cell_component).ok_or_else(|| dispatch::mismatch(op, schema_row))?;
        for e in 0..op.num_entities() {
            let diagonal = op
                .local_diagonal(e)
                .ok_or_else(|| OperatorError::structural("cell block stores local matrices"))?;
            for (dof, d) in op.row_dofs(e).iter().zip(diagonal.iter()) {
                if dof.slot != cell_slot {
                    return Err(dispatch::mismatch(op, schema_row));
                }
                let system = systems
                    .get_mut(dof.entity)
                    .ok_or_else(|| OperatorError::structural(format!("cell {} is not owned", dof.entity)))?
                    .get_or_insert_with(|| CellSystem::new(Vec::new(), self.num_cell_dofs));
                let k = system.faces.len() + dof.dof;
                system.matrix[(k, k)] += *d;
            }
        }
        Ok(())
    }

    /// `y = A^{-1} x` through the face system.
    pub(crate) fn apply_inverse(
        &self,
        inverse: &dyn InverseService,
        face_map: &DofMap,
        x: &CompositeVector,
        y: &mut CompositeVector,
    ) -> Result<()> {
        let missing = |name: &str| OperatorError::MissingComponent {
            block: 0,
            component: name.to_string(),
            dof: 0,
        };
        let x_face = x.space().index_of(&self.face_component).ok_or_else(|| missing(&self.face_component))?;
        let x_cell = x.space().index_of(&self.cell_component).ok_or_else(|| missing(&self.cell_component))?;
        let y_face = y.space().index_of(&self.face_component).ok_or_else(|| missing(&self.face_component))?;
        let y_cell = y.space().index_of(&self.cell_component).ok_or_else(|| missing(&self.cell_component))?;
        let nc = self.num_cell_dofs;

        // Reduced right-hand side: t_F = x_F - A_FE A_EE^{-1} x_E
        let mut t = x.clone();
        t.put_scalar_ghosted(0.0);
        for elimination in &self.cells {
            let x_e = x.data(x_cell).view((0, elimination.cell), (nc, 1)).clone_owned();
            let w = elimination
                .a_ee
                .solve(&x_e)
                .ok_or_else(|| singular_at(elimination.cell))?;
            let correction = &elimination.a_fe * w;
            let t_faces = t.data_mut(x_face);
            for (k, face) in elimination.faces.iter().enumerate() {
                t_faces[(0, *face)] -= correction[(k, 0)];
            }
        }
        t.gather_ghosted_to_owned();

        let mut sv_x = DVector::zeros(face_map.num_global());
        let mut sv_y = DVector::zeros(face_map.num_global());
        face_map.copy_to_super_vector(0, &t, &mut sv_x)?;
        inverse
            .apply_inverse(DVectorView::from(&sv_x), DVectorViewMut::from(&mut sv_y))
            .map_err(OperatorError::Inverse)?;
        face_map.copy_from_super_vector(0, &sv_y, y)?;
        y.scatter_owned_to_ghosted();

        // Back substitution: x_E = A_EE^{-1} (x_E - A_EF y_F)
        for elimination in &self.cells {
            let y_f = DMatrix::from_iterator(
                elimination.faces.len(),
                1,
                elimination.faces.iter().map(|f| y.data(y_face)[(0, *f)]),
            );
            let rhs = x.data(x_cell).view((0, elimination.cell), (nc, 1)) - &elimination.a_ef * y_f;
            let y_e = elimination
                .a_ee
                .solve(&rhs)
                .ok_or_else(|| singular_at(elimination.cell))?;
            y.data_mut(y_cell)
                .view_mut((0, elimination.cell), (nc, 1))
                .copy_from(&y_e);
        }
        y.scatter_owned_to_ghosted();
        Ok(())
    }
}

fn singular_at(cell: usize) -> OperatorError {
    OperatorError::NumericFailure {
        failed: 1,
        total: 1,
        entity: cell,
    }
}

/// Factors `A_EE` and forms the local Schur complement. Returns `None` for singular blocks.
fn eliminate(cell: usize, system: CellSystem) -> Option<(CellElimination, DMatrix<f64>)> {
    let nf = system.faces.len();
    let nc = system.num_cell_dofs;
    let a = &system.matrix;

    let a_ee = a.view((nf, nf), (nc, nc)).clone_owned();
    if !a_ee.iter().all(|v| v.is_finite()) {
        return None;
    }
    let scale = a_ee.amax();
    let lu = a_ee.lu();
    if lu.u().diagonal().iter().any(|d| d.abs() <= f64::EPSILON * scale) {
        return None;
    }

    let a_fe = a.view((0, nf), (nf, nc)).clone_owned();
    let a_ef = a.view((nf, 0), (nc, nf)).clone_owned();
    let inv_a_ef = lu.solve(&a_ef)?;
    let schur = a.view((0, 0), (nf, nf)) - &a_fe * inv_a_ef;
    if !schur.iter().all(|v| v.is_finite()) {
        return None;
    }

    let elimination = CellElimination {
        cell,
        faces: system.faces,
        a_ee: lu,
        a_fe,
        a_ef,
    };
    Some((elimination, schur))
}
