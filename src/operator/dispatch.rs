//! Per-kind dispatch of the block hooks used by a standard operator.
//!
//! Every hook switches on [`OpKind`] explicitly. Diagonal kinds go through the
//! diagonal paths, all others through the dense local-matrix paths.
use crate::dof_map::DofMap;
use crate::error::{OperatorError, Result};
use crate::graph::{GraphBuilder, MatrixAssembler};
use crate::op::{LocalDof, Op, OpData, OpKind};
use crate::schema::Schema;
use crate::space::{CompositeVector, UnknownSpace};
use nalgebra::{DVector, DVectorView};
use nalgebra_sparse::CsrMatrix;

/// Fails unless the block's row and column items are covered by the operator's schemas.
pub(crate) fn check_schema(op: &Op, row: &Schema, col: &Schema) -> Result<()> {
    if !op.schema_row().is_subset_of(row) {
        return Err(OperatorError::SchemaMismatch {
            op: op.schema_row().to_string(),
            operator: row.to_string(),
        });
    }
    if !op.schema_col().is_subset_of(col) {
        return Err(OperatorError::SchemaMismatch {
            op: op.schema_col().to_string(),
            operator: col.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn mismatch(op: &Op, row: &Schema) -> OperatorError {
    OperatorError::SchemaMismatch {
        op: op.schema_row().to_string(),
        operator: row.to_string(),
    }
}

/// Component index in `space` of every slot name.
pub(crate) fn resolve_slots(names: &[String], space: &UnknownSpace) -> Result<Vec<usize>> {
    names
        .iter()
        .map(|name| {
            space.index_of(name).ok_or_else(|| OperatorError::MissingComponent {
                block: 0,
                component: name.clone(),
                dof: 0,
            })
        })
        .collect()
}

fn out_of_range(dof: &LocalDof) -> OperatorError {
    OperatorError::structural(format!(
        "local dof (slot {}, entity {}, dof {}) is outside the unknown space",
        dof.slot, dof.entity, dof.dof
    ))
}

/// Reads the values at a list of local dofs.
pub(crate) fn gather_local(
    x: &CompositeVector,
    slots: &[usize],
    dofs: &[LocalDof],
    out: &mut DVector<f64>,
) -> Result<()> {
    out.resize_vertically_mut(dofs.len(), 0.0);
    for (k, dof) in dofs.iter().enumerate() {
        out[k] = *x
            .data(slots[dof.slot])
            .get((dof.dof, dof.entity))
            .ok_or_else(|| out_of_range(dof))?;
    }
    Ok(())
}

/// Adds `alpha * values` into a list of local dofs.
pub(crate) fn scatter_add_local(
    y: &mut CompositeVector,
    slots: &[usize],
    dofs: &[LocalDof],
    alpha: f64,
    values: DVectorView<f64>,
) -> Result<()> {
    for (dof, v) in dofs.iter().zip(values.iter()) {
        *y.data_mut(slots[dof.slot])
            .get_mut((dof.dof, dof.entity))
            .ok_or_else(|| out_of_range(dof))? += alpha * *v;
    }
    Ok(())
}

/// Translates local dofs of a block into global indices of a [`DofMap`].
pub(crate) struct GlobalDofs<'a> {
    map: &'a DofMap,
    // slot -> dof -> key index
    keys: Vec<Vec<usize>>,
}

impl<'a> GlobalDofs<'a> {
    pub(crate) fn new(names: &[String], map: &'a DofMap) -> Result<Self> {
        let space = map
            .blocks()
            .first()
            .ok_or_else(|| OperatorError::configuration("dof map has no blocks"))?;
        let keys = names
            .iter()
            .map(|name| {
                let component = space.component(name).ok_or_else(|| OperatorError::MissingComponent {
                    block: 0,
                    component: name.clone(),
                    dof: 0,
                })?;
                (0..component.num_dofs())
                    .map(|dof| map.key_index(0, name, dof))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { map, keys })
    }

    pub(crate) fn indices(&self, dofs: &[LocalDof], out: &mut Vec<usize>) -> Result<()> {
        out.clear();
        for dof in dofs {
            let key = self
                .keys
                .get(dof.slot)
                .and_then(|keys| keys.get(dof.dof))
                .ok_or_else(|| out_of_range(dof))?;
            let index = self
                .map
                .key_indices(*key)
                .get(dof.entity)
                .ok_or_else(|| out_of_range(dof))?;
            out.push(*index);
        }
        Ok(())
    }
}

/// `y += A_op x` for one block.
pub(crate) fn apply_op(op: &Op, x: &CompositeVector, y: &mut CompositeVector) -> Result<()> {
    let row_slots = resolve_slots(op.row_components(), y.space())?;
    let col_slots = resolve_slots(op.col_components(), x.space())?;
    match op.kind() {
        OpKind::CellCell | OpKind::SurfaceCellSurfaceCell => apply_diagonal(op, &row_slots, &col_slots, x, y),
        OpKind::CellFace
        | OpKind::CellFaceCell
        | OpKind::FaceCell
        | OpKind::FaceCellBndFace
        | OpKind::SurfaceFaceSurfaceCell => apply_local(op, &row_slots, &col_slots, x, y),
    }
}

fn apply_local(
    op: &Op,
    row_slots: &[usize],
    col_slots: &[usize],
    x: &CompositeVector,
    y: &mut CompositeVector,
) -> Result<()> {
    let mut x_local = DVector::zeros(0);
    let mut y_local = DVector::zeros(0);
    for e in 0..op.num_entities() {
        let a = op
            .local_matrix(e)
            .ok_or_else(|| OperatorError::structural(format!("{} block has no local matrices", op.kind())))?;
        gather_local(x, col_slots, op.col_dofs(e), &mut x_local)?;
        y_local.resize_vertically_mut(a.nrows(), 0.0);
        y_local.gemv(1.0, a, &x_local, 0.0);
        scatter_add_local(y, row_slots, op.row_dofs(e), 1.0, DVectorView::from(&y_local))?;
    }
    Ok(())
}

fn apply_diagonal(
    op: &Op,
    row_slots: &[usize],
    col_slots: &[usize],
    x: &CompositeVector,
    y: &mut CompositeVector,
) -> Result<()> {
    let mut x_local = DVector::zeros(0);
    for e in 0..op.num_entities() {
        let d = op
            .local_diagonal(e)
            .ok_or_else(|| OperatorError::structural(format!("{} block has no local diagonal", op.kind())))?;
        gather_local(x, col_slots, op.col_dofs(e), &mut x_local)?;
        x_local.component_mul_assign(d);
        scatter_add_local(y, row_slots, op.row_dofs(e), 1.0, DVectorView::from(&x_local))?;
    }
    Ok(())
}

/// Inserts the global index pairs touched by one block.
pub(crate) fn symbolic_assemble_op(
    op: &Op,
    row_map: &DofMap,
    col_map: &DofMap,
    graph: &mut GraphBuilder,
) -> Result<()> {
    let rows = GlobalDofs::new(op.row_components(), row_map)?;
    let cols = GlobalDofs::new(op.col_components(), col_map)?;
    let mut row_indices = Vec::new();
    let mut col_indices = Vec::new();
    for e in 0..op.num_entities() {
        rows.indices(op.row_dofs(e), &mut row_indices)?;
        cols.indices(op.col_dofs(e), &mut col_indices)?;
        match op.kind() {
            OpKind::CellCell | OpKind::SurfaceCellSurfaceCell => {
                for (&i, &j) in row_indices.iter().zip(&col_indices) {
                    graph.insert(i, j)?;
                }
            }
            OpKind::CellFace
            | OpKind::CellFaceCell
            | OpKind::FaceCell
            | OpKind::FaceCellBndFace
            | OpKind::SurfaceFaceSurfaceCell => graph.insert_block(&row_indices, &col_indices)?,
        }
    }
    Ok(())
}

/// Adds the values of one block into an assembled matrix.
pub(crate) fn numeric_assemble_op(
    op: &Op,
    row_map: &DofMap,
    col_map: &DofMap,
    matrix: &mut CsrMatrix<f64>,
    assembler: &mut MatrixAssembler,
) -> Result<()> {
    let rows = GlobalDofs::new(op.row_components(), row_map)?;
    let cols = GlobalDofs::new(op.col_components(), col_map)?;
    let mut row_indices = Vec::new();
    let mut col_indices = Vec::new();
    for e in 0..op.num_entities() {
        rows.indices(op.row_dofs(e), &mut row_indices)?;
        cols.indices(op.col_dofs(e), &mut col_indices)?;
        match (op.kind(), op.data()) {
            (OpKind::CellCell | OpKind::SurfaceCellSurfaceCell, OpData::Diagonal(diagonals)) => {
                assembler.add_local_diagonal(matrix, &row_indices, &col_indices, DVectorView::from(&diagonals[e]))?
            }
            (
                OpKind::CellFace
                | OpKind::CellFaceCell
                | OpKind::FaceCell
                | OpKind::FaceCellBndFace
                | OpKind::SurfaceFaceSurfaceCell,
                OpData::Local(matrices),
            ) => assembler.add_local_matrix(matrix, &row_indices, &col_indices, &matrices[e])?,
            (kind, _) => {
                return Err(OperatorError::structural(format!(
                    "{} block has inconsistent local storage",
                    kind
                )))
            }
        }
    }
    Ok(())
}

/// Adds the diagonal of every local matrix into the row unknowns.
pub(crate) fn sum_local_diag(op: &Op, diag: &mut CompositeVector) -> Result<()> {
    let slots = resolve_slots(op.row_components(), diag.space())?;
    let mut values = DVector::zeros(0);
    for e in 0..op.num_entities() {
        match op.data() {
            OpData::Diagonal(diagonals) => values.clone_from(&diagonals[e]),
            OpData::Local(matrices) => values = matrices[e].diagonal(),
        }
        let n = values.len();
        scatter_add_local(diag, &slots, &op.row_dofs(e)[..n], 1.0, DVectorView::from(&values))?;
    }
    Ok(())
}

/// Adds the local right-hand-side vectors into the row unknowns.
pub(crate) fn assemble_local_vectors(op: &Op, rhs: &mut CompositeVector) -> Result<()> {
    let slots = resolve_slots(op.row_components(), rhs.space())?;
    for e in 0..op.num_entities() {
        scatter_add_local(rhs, &slots, op.row_dofs(e), 1.0, DVectorView::from(op.local_vector(e)))?;
    }
    Ok(())
}
