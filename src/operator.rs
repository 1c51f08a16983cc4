//! Global operators built from local blocks.
//!
//! An [`Operator`] holds an ordered list of [`Op`]s acting between two unknown spaces.
//! It can be applied matrix-free, assembled into a CSR matrix in two phases (symbolic,
//! then numeric), and inverted through an [`InverseService`].
//!
//! The face-cell Schur flavor, created with [`Operator::face_cell_schur`], applies
//! exactly like a standard operator but assembles and inverts only the face system,
//! eliminating cell unknowns cell by cell.
use crate::config::{InverseParameters, OperatorParameters};
use crate::dof_map::DofMap;
use crate::entity::EntityKind;
use crate::error::{OperatorError, Result};
use crate::graph::{add_diagonal_shift, GraphBuilder, MatrixAssembler};
use crate::inverse::{create_inverse, InverseService};
use crate::io;
use crate::op::Op;
use crate::schema::{MatchRule, Schema};
use crate::space::{CompositeVector, UnknownSpace};
use log::{debug, info};
use nalgebra::{DVector, DVectorView, DVectorViewMut};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op as Transpose;
use nalgebra_sparse::CsrMatrix;
use parking_lot::{Mutex, RwLock};
use std::borrow::Cow;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

mod dispatch;
mod schur;

use schur::SchurElimination;

/// A block that may be shared between operators.
pub type SharedOp = Arc<RwLock<Op>>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct OpProperties {
    /// Read-only blocks are left untouched by [`Operator::zero`].
    pub read_only: bool,
}

impl OpProperties {
    pub fn read_only() -> Self {
        Self { read_only: true }
    }
}

/// How [`Operator::apply`] treats the existing contents of the output.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ApplyMode {
    /// `y = A x`. Owned and ghost values are cleared first.
    Overwrite,
    /// `y = y + A x`. Only ghost values are cleared first.
    Accumulate,
    /// `y = s y + A x`. Owned values are scaled and ghost values cleared first.
    ScaleAndAccumulate(f64),
}

impl From<f64> for ApplyMode {
    fn from(scale: f64) -> Self {
        if scale == 0.0 {
            Self::Overwrite
        } else if scale == 1.0 {
            Self::Accumulate
        } else {
            Self::ScaleAndAccumulate(scale)
        }
    }
}

/// Progress of an operator towards a usable inverse.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InverseState {
    Unconfigured,
    /// Inverse parameters are set.
    Configured,
    /// The matrix structure is built and handed to the inverse service.
    StructureBuilt,
    /// Numeric values are assembled and factorized.
    NumericReady,
}

/// Per-operator counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct OperatorStatistics {
    pub apply_calls: usize,
    pub apply_inverse_calls: usize,
    pub factorizations_ok: usize,
    pub factorizations_failed: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) apply_calls: AtomicUsize,
    pub(crate) apply_inverse_calls: AtomicUsize,
    pub(crate) factorizations_ok: AtomicUsize,
    pub(crate) factorizations_failed: AtomicUsize,
}

#[derive(Debug)]
enum Flavor {
    Standard,
    FaceCellSchur(SchurElimination),
}

#[derive(Debug)]
pub struct Operator {
    name: String,
    flavor: Flavor,
    row_space: Arc<UnknownSpace>,
    col_space: Arc<UnknownSpace>,
    schema_row: Schema,
    schema_col: Schema,
    ops: Vec<SharedOp>,
    properties: Vec<OpProperties>,
    rhs: CompositeVector,
    diagonal_shift: f64,
    row_map: Option<Arc<DofMap>>,
    col_map: Option<Arc<DofMap>>,
    matrix: Option<CsrMatrix<f64>>,
    /// Block revisions captured by the last numeric assembly.
    assembled_revisions: Option<Vec<u64>>,
    assembler: MatrixAssembler,
    /// Column vector with refreshed ghost values, reused across applications.
    ghosted_x: Mutex<Option<CompositeVector>>,
    inverse_parameters: Option<InverseParameters>,
    inverse: Option<Box<dyn InverseService>>,
    state: InverseState,
    counters: Counters,
}

impl Operator {
    /// A square operator on `space`.
    pub fn new(name: impl Into<String>, space: Arc<UnknownSpace>, parameters: &OperatorParameters) -> Result<Self> {
        Self::with_spaces(name, Arc::clone(&space), space, parameters)
    }

    /// An operator mapping `col_space` to `row_space`.
    pub fn with_spaces(
        name: impl Into<String>,
        row_space: Arc<UnknownSpace>,
        col_space: Arc<UnknownSpace>,
        parameters: &OperatorParameters,
    ) -> Result<Self> {
        Self::build(name.into(), Flavor::Standard, row_space, col_space, parameters)
    }

    /// A square operator on a space with one face and one cell component, which
    /// eliminates the cell unknowns when assembled or inverted.
    ///
    /// A diagonal shift is rejected: it would apply to the face system only, while the
    /// eliminated cell blocks stay unshifted.
    pub fn face_cell_schur(
        name: impl Into<String>,
        space: Arc<UnknownSpace>,
        parameters: &OperatorParameters,
    ) -> Result<Self> {
        let name = name.into();
        if parameters.diagonal_shift != 0.0 {
            return Err(OperatorError::configuration(format!(
                "Schur operator `{}` does not support a diagonal shift, got {}",
                name, parameters.diagonal_shift
            )));
        }
        let elimination = SchurElimination::new(&space)?;
        Self::build(
            name,
            Flavor::FaceCellSchur(elimination),
            Arc::clone(&space),
            space,
            parameters,
        )
    }

    fn build(
        name: String,
        flavor: Flavor,
        row_space: Arc<UnknownSpace>,
        col_space: Arc<UnknownSpace>,
        parameters: &OperatorParameters,
    ) -> Result<Self> {
        if !parameters.diagonal_shift.is_finite() {
            return Err(OperatorError::configuration(format!(
                "diagonal shift of operator `{}` must be finite",
                name
            )));
        }
        let mut operator = Self {
            schema_row: Schema::from_space(EntityKind::Cell, &row_space),
            schema_col: Schema::from_space(EntityKind::Cell, &col_space),
            rhs: CompositeVector::new(Arc::clone(&row_space)),
            name,
            flavor,
            row_space,
            col_space,
            ops: Vec::new(),
            properties: Vec::new(),
            diagonal_shift: parameters.diagonal_shift,
            row_map: None,
            col_map: None,
            matrix: None,
            assembled_revisions: None,
            assembler: MatrixAssembler::default(),
            ghosted_x: Mutex::new(None),
            inverse_parameters: None,
            inverse: None,
            state: InverseState::Unconfigured,
            counters: Counters::default(),
        };
        if let Some(inverse) = &parameters.inverse {
            operator.set_inverse_parameters(inverse.clone())?;
        }
        Ok(operator)
    }

    /// A face-cell Schur operator sharing the blocks of this operator as read-only blocks.
    pub fn schur_from(&self, name: impl Into<String>, parameters: &OperatorParameters) -> Result<Self> {
        if !Arc::ptr_eq(&self.row_space, &self.col_space) && !self.row_space.is_compatible(&self.col_space) {
            return Err(OperatorError::structural("Schur complement requires a square operator"));
        }
        let mut schur = Self::face_cell_schur(name, Arc::clone(&self.row_space), parameters)?;
        for op in &self.ops {
            schur.push_shared_op(Arc::clone(op), OpProperties::read_only());
        }
        Ok(schur)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_schur_complement(&self) -> bool {
        matches!(self.flavor, Flavor::FaceCellSchur(_))
    }

    pub fn row_space(&self) -> &Arc<UnknownSpace> {
        &self.row_space
    }

    pub fn col_space(&self) -> &Arc<UnknownSpace> {
        &self.col_space
    }

    pub fn schema_row(&self) -> &Schema {
        &self.schema_row
    }

    pub fn schema_col(&self) -> &Schema {
        &self.schema_col
    }

    pub fn diagonal_shift(&self) -> f64 {
        self.diagonal_shift
    }

    /// The inverse state, demoted to [`InverseState::StructureBuilt`] when a block
    /// changed after the inverse was computed, possibly through another operator
    /// sharing it.
    pub fn inverse_state(&self) -> InverseState {
        if self.state == InverseState::NumericReady && !self.values_current() {
            InverseState::StructureBuilt
        } else {
            self.state
        }
    }

    pub fn inverse_parameters(&self) -> Option<&InverseParameters> {
        self.inverse_parameters.as_ref()
    }

    pub fn rhs(&self) -> &CompositeVector {
        &self.rhs
    }

    pub fn rhs_mut(&mut self) -> &mut CompositeVector {
        &mut self.rhs
    }

    /// The assembled matrix, once symbolic assembly has run.
    pub fn matrix(&self) -> Option<&CsrMatrix<f64>> {
        self.matrix.as_ref()
    }

    pub fn row_dof_map(&self) -> Option<&DofMap> {
        self.row_map.as_deref()
    }

    pub fn col_dof_map(&self) -> Option<&DofMap> {
        self.col_map.as_deref()
    }

    pub fn ops(&self) -> &[SharedOp] {
        &self.ops
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn op(&self, index: usize) -> Option<&SharedOp> {
        self.ops.get(index)
    }

    pub fn op_properties(&self, index: usize) -> Option<OpProperties> {
        self.properties.get(index).copied()
    }

    /// Registers a block with default properties and returns its index.
    pub fn push_op(&mut self, op: Op) -> usize {
        self.push_op_with(op, OpProperties::default())
    }

    pub fn push_op_with(&mut self, op: Op, properties: OpProperties) -> usize {
        self.push_shared_op(Arc::new(RwLock::new(op)), properties)
    }

    pub fn push_shared_op(&mut self, op: SharedOp, properties: OpProperties) -> usize {
        self.invalidate_structure();
        self.ops.push(op);
        self.properties.push(properties);
        self.ops.len() - 1
    }

    /// Appends blocks with default properties.
    pub fn extend_ops(&mut self, ops: impl IntoIterator<Item = SharedOp>) {
        for op in ops {
            self.push_shared_op(op, OpProperties::default());
        }
    }

    /// A new block list invalidates the assembled structure.
    fn invalidate_structure(&mut self) {
        if self.matrix.take().is_some() {
            debug!("operator `{}`: block list changed, dropping assembled structure", self.name);
        }
        self.row_map = None;
        self.col_map = None;
        self.assembled_revisions = None;
        self.inverse = None;
        if let Flavor::FaceCellSchur(elimination) = &mut self.flavor {
            elimination.invalidate();
        }
        self.state = self.state.min(InverseState::Configured);
    }

    /// Whether the blocks still hold the values of the last numeric assembly.
    fn values_current(&self) -> bool {
        match &self.assembled_revisions {
            Some(revisions) => {
                revisions.len() == self.ops.len()
                    && revisions
                        .iter()
                        .zip(&self.ops)
                        .all(|(revision, op)| *revision == op.read().revision())
            }
            None => false,
        }
    }

    /// Numeric values changed, so any factorization is stale.
    fn invalidate_numeric(&mut self) {
        if self.state == InverseState::NumericReady {
            self.state = InverseState::StructureBuilt;
        }
    }

    /// Index of the first block whose schemas match under `rule`.
    ///
    /// With `fatal`, a missing block is an error rather than `None`.
    pub fn find_matrix_op(
        &self,
        schema_row: &Schema,
        schema_col: &Schema,
        rule: MatchRule,
        fatal: bool,
    ) -> Result<Option<usize>> {
        let found = self.ops.iter().position(|op| {
            let op = op.read();
            op.schema_row().matches_with(schema_row, rule) && op.schema_col().matches_with(schema_col, rule)
        });
        match found {
            None if fatal => Err(OperatorError::configuration(format!(
                "operator `{}` has no block matching {} x {}",
                self.name, schema_row, schema_col
            ))),
            found => Ok(found),
        }
    }

    fn check_vector(&self, v: &CompositeVector, space: &Arc<UnknownSpace>, what: &str) -> Result<()> {
        if Arc::ptr_eq(v.space(), space) || v.space().is_compatible(space) {
            Ok(())
        } else {
            Err(OperatorError::structural(format!(
                "{} vector does not live on the {} space of operator `{}`",
                what, what, self.name
            )))
        }
    }

    /// Matrix-free `y = A x` with the treatment of `y` given by `mode`.
    ///
    /// Ghost values of `x` are refreshed in an internal buffer, so concurrent
    /// applications of one operator on a space with ghosts run one at a time. Ghost
    /// contributions to `y` are summed into their owners.
    pub fn apply(&self, x: &CompositeVector, y: &mut CompositeVector, mode: impl Into<ApplyMode>) -> Result<()> {
        self.check_vector(x, &self.col_space, "column")?;
        self.check_vector(y, &self.row_space, "row")?;

        let mut guard;
        let x = if self.col_space.has_ghosts() {
            guard = self.ghosted_x.lock();
            let buffer = guard.get_or_insert_with(|| CompositeVector::new(Arc::clone(&self.col_space)));
            buffer.copy_owned_from(x);
            buffer.scatter_owned_to_ghosted();
            &*buffer
        } else {
            x
        };

        match mode.into() {
            ApplyMode::Overwrite => y.put_scalar_owned_and_ghosted(0.0),
            ApplyMode::Accumulate => y.put_scalar_ghosted(0.0),
            ApplyMode::ScaleAndAccumulate(scale) => {
                y.scale_owned(scale);
                y.put_scalar_ghosted(0.0);
            }
        }

        for op in &self.ops {
            let op = op.read();
            dispatch::check_schema(&op, &self.schema_row, &self.schema_col)?;
            dispatch::apply_op(&op, x, y)?;
        }

        y.gather_ghosted_to_owned();
        self.counters.apply_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// `y = A x` through the assembled matrix.
    ///
    /// For a Schur operator this applies the assembled face system to the face unknowns.
    pub fn apply_assembled(&self, x: &CompositeVector, y: &mut CompositeVector, mode: impl Into<ApplyMode>) -> Result<()> {
        let (matrix, row_map, col_map) = self.assembled()?;
        if !self.values_current() {
            return Err(OperatorError::configuration(format!(
                "assembled matrix of operator `{}` does not hold the current block values",
                self.name
            )));
        }
        let mut sv_x = DVector::zeros(col_map.num_global());
        let mut sv_y = DVector::zeros(row_map.num_global());
        col_map.copy_to_super_vector(0, x, &mut sv_x)?;
        spmm_csr_dense(0.0, &mut sv_y, 1.0, Transpose::NoOp(matrix), Transpose::NoOp(&sv_x));

        match mode.into() {
            ApplyMode::Overwrite => {
                y.put_scalar_owned_and_ghosted(0.0);
            }
            ApplyMode::Accumulate => {}
            ApplyMode::ScaleAndAccumulate(scale) => y.scale_owned(scale),
        }
        row_map.add_from_super_vector(0, &sv_y, y)
    }

    fn assembled(&self) -> Result<(&CsrMatrix<f64>, &DofMap, &DofMap)> {
        match (&self.matrix, &self.row_map, &self.col_map) {
            (Some(matrix), Some(row_map), Some(col_map)) => Ok((matrix, row_map, col_map)),
            _ => Err(OperatorError::configuration(format!(
                "operator `{}` has not been assembled",
                self.name
            ))),
        }
    }

    /// Writes owned values of `x` into a vector in the global numbering of the row map.
    pub fn copy_to_super_vector(&self, x: &CompositeVector, sv: &mut DVector<f64>) -> Result<()> {
        let (_, row_map, _) = self.assembled()?;
        row_map.copy_to_super_vector(0, x, sv)
    }

    /// Adds a vector in the global numbering of the row map into the owned values of `y`.
    pub fn add_from_super_vector(&self, sv: &DVector<f64>, y: &mut CompositeVector) -> Result<()> {
        let (_, row_map, _) = self.assembled()?;
        row_map.add_from_super_vector(0, sv, y)
    }

    /// `r = f - A u`, or `r = r + f - A u` when `zero` is false.
    pub fn compute_residual(&self, u: &CompositeVector, r: &mut CompositeVector, zero: bool) -> Result<()> {
        if zero {
            self.apply(u, r, ApplyMode::Overwrite)?;
        } else {
            self.apply(u, r, ApplyMode::ScaleAndAccumulate(-1.0))?;
        }
        r.update(1.0, &self.rhs, -1.0);
        Ok(())
    }

    /// `r = A u - f`, or `r = r + A u - f` when `zero` is false.
    pub fn compute_negative_residual(&self, u: &CompositeVector, r: &mut CompositeVector, zero: bool) -> Result<()> {
        if zero {
            self.apply(u, r, ApplyMode::Overwrite)?;
        } else {
            self.apply(u, r, ApplyMode::Accumulate)?;
        }
        r.update(-1.0, &self.rhs, 1.0);
        Ok(())
    }

    /// Adds the owned values of every matching component of `source` to the right-hand side.
    ///
    /// The source must already be multiplied by cell volumes.
    pub fn update_rhs(&mut self, source: &CompositeVector, volume_included: bool) -> Result<()> {
        if !volume_included {
            return Err(OperatorError::Precondition(format!(
                "operator `{}` expects sources that already include cell volumes",
                self.name
            )));
        }
        for component in self.row_space.components() {
            if let (Some(src), Some(mut dst)) = (source.owned_view(component.name()), self.rhs.owned_view_mut(component.name())) {
                if src.shape() != dst.shape() {
                    return Err(OperatorError::structural(format!(
                        "source component `{}` does not match the right-hand side layout",
                        component.name()
                    )));
                }
                dst += src;
            }
        }
        Ok(())
    }

    /// Adds the local vectors of all blocks into the right-hand side.
    pub fn assemble_local_vectors(&mut self) -> Result<()> {
        self.rhs.put_scalar_ghosted(0.0);
        for op in &self.ops {
            let op = op.read();
            dispatch::check_schema(&op, &self.schema_row, &self.schema_col)?;
            dispatch::assemble_local_vectors(&op, &mut self.rhs)?;
        }
        self.rhs.gather_ghosted_to_owned();
        Ok(())
    }

    /// Clears the right-hand side and every block not flagged read-only.
    pub fn zero(&mut self) {
        self.rhs.put_scalar_owned_and_ghosted(0.0);
        for (op, properties) in self.ops.iter().zip(&self.properties) {
            if !properties.read_only {
                op.write().zero();
            }
        }
        self.invalidate_numeric();
    }

    pub fn rescale(&mut self, factor: f64) {
        for op in &self.ops {
            op.write().rescale(factor);
        }
        self.invalidate_numeric();
    }

    pub fn rescale_op(&mut self, index: usize, factor: f64) -> Result<()> {
        self.op_or_err(index)?.write().rescale(factor);
        self.invalidate_numeric();
        Ok(())
    }

    /// Scales the rows of every block by per-entity weights.
    pub fn rescale_by(&mut self, weights: &CompositeVector) -> Result<()> {
        let weights = Self::with_ghosts(weights);
        for op in &self.ops {
            op.write().rescale_by(&weights)?;
        }
        self.invalidate_numeric();
        Ok(())
    }

    pub fn rescale_op_by(&mut self, index: usize, weights: &CompositeVector) -> Result<()> {
        let weights = Self::with_ghosts(weights);
        self.op_or_err(index)?.write().rescale_by(&weights)?;
        self.invalidate_numeric();
        Ok(())
    }

    fn with_ghosts(v: &CompositeVector) -> Cow<CompositeVector> {
        if v.space().has_ghosts() {
            let mut v = v.clone();
            v.scatter_owned_to_ghosted();
            Cow::Owned(v)
        } else {
            Cow::Borrowed(v)
        }
    }

    fn op_or_err(&self, index: usize) -> Result<&SharedOp> {
        self.ops.get(index).ok_or_else(|| {
            OperatorError::configuration(format!(
                "operator `{}` has {} blocks, index {} is out of range",
                self.name,
                self.ops.len(),
                index
            ))
        })
    }

    /// Sum of the diagonals of all local matrices, with ghost contributions gathered.
    pub fn local_diag_copy(&self) -> Result<CompositeVector> {
        let mut diag = CompositeVector::new(Arc::clone(&self.row_space));
        for op in &self.ops {
            let op = op.read();
            dispatch::check_schema(&op, &self.schema_row, &self.schema_col)?;
            dispatch::sum_local_diag(&op, &mut diag)?;
        }
        diag.gather_ghosted_to_owned();
        Ok(diag)
    }

    fn assembly_spaces(&self) -> (Arc<UnknownSpace>, Arc<UnknownSpace>) {
        match &self.flavor {
            Flavor::Standard => (Arc::clone(&self.row_space), Arc::clone(&self.col_space)),
            Flavor::FaceCellSchur(elimination) => {
                (Arc::clone(elimination.face_space()), Arc::clone(elimination.face_space()))
            }
        }
    }

    /// Builds the dof maps and the sparsity pattern of the assembled matrix.
    pub fn symbolic_assemble_matrix(&mut self) -> Result<()> {
        let (row_space, col_space) = self.assembly_spaces();
        let row_map = Arc::new(DofMap::new(Arc::clone(&row_space)));
        let col_map = if Arc::ptr_eq(&row_space, &col_space) {
            Arc::clone(&row_map)
        } else {
            Arc::new(DofMap::new(col_space))
        };

        let mut graph = GraphBuilder::new(row_map.num_global(), col_map.num_global());
        for op in &self.ops {
            let op = op.read();
            match &self.flavor {
                Flavor::Standard => {
                    dispatch::check_schema(&op, &self.schema_row, &self.schema_col)?;
                    dispatch::symbolic_assemble_op(&op, &row_map, &col_map, &mut graph)?;
                }
                Flavor::FaceCellSchur(elimination) => {
                    elimination.symbolic_assemble_op(&op, &self.schema_row, &self.schema_col, &row_map, &mut graph)?
                }
            }
        }
        if self.diagonal_shift != 0.0 {
            graph.insert_diagonal();
        }

        let pattern = graph.build()?;
        let nnz = pattern.nnz();
        let matrix = CsrMatrix::try_from_pattern_and_values(pattern, vec![0.0; nnz])
            .map_err(|err| OperatorError::structural(format!("failed to allocate matrix: {}", err)))?;
        debug!(
            "operator `{}`: symbolic assembly, {}x{} with {} nonzeros",
            self.name,
            matrix.nrows(),
            matrix.ncols(),
            nnz
        );

        self.matrix = Some(matrix);
        self.row_map = Some(row_map);
        self.col_map = Some(col_map);
        self.assembled_revisions = None;
        self.inverse = None;
        self.state = self.state.min(InverseState::Configured);
        Ok(())
    }

    /// Fills the assembled matrix from the current local values, building the
    /// structure first if needed.
    pub fn assemble_matrix(&mut self) -> Result<()> {
        if self.matrix.is_none() {
            self.symbolic_assemble_matrix()?;
        }
        let (matrix, row_map, col_map) = match (&mut self.matrix, &self.row_map, &self.col_map) {
            (Some(matrix), Some(row_map), Some(col_map)) => (matrix, row_map, col_map),
            _ => return Err(OperatorError::structural("symbolic assembly left no matrix")),
        };

        matrix.values_mut().fill(0.0);
        self.assembled_revisions = None;
        let revisions: Vec<u64> = self.ops.iter().map(|op| op.read().revision()).collect();
        match &mut self.flavor {
            Flavor::Standard => {
                for op in &self.ops {
                    let op = op.read();
                    dispatch::check_schema(&op, &self.schema_row, &self.schema_col)?;
                    dispatch::numeric_assemble_op(&op, row_map, col_map, matrix, &mut self.assembler)?;
                }
            }
            Flavor::FaceCellSchur(elimination) => elimination.numeric_assemble(
                &self.ops,
                &self.schema_row,
                &self.schema_col,
                row_map,
                matrix,
                &mut self.assembler,
                &self.counters,
            )?,
        }
        if self.diagonal_shift != 0.0 {
            add_diagonal_shift(matrix, self.diagonal_shift)?;
        }
        debug!(
            "operator `{}`: numeric assembly of {} blocks, {} nonzeros",
            self.name,
            self.ops.len(),
            matrix.nnz()
        );
        self.assembled_revisions = Some(revisions);
        self.invalidate_numeric();
        Ok(())
    }

    /// Configures the inverse. Any previously built inverse is discarded.
    pub fn set_inverse_parameters(&mut self, parameters: InverseParameters) -> Result<()> {
        if !(parameters.tolerance > 0.0) {
            return Err(OperatorError::configuration(format!(
                "inverse tolerance of operator `{}` must be positive, got {}",
                self.name, parameters.tolerance
            )));
        }
        info!(
            "operator `{}`: inverse configured ({:?}, {:?} preconditioner)",
            self.name, parameters.method, parameters.preconditioner
        );
        self.inverse_parameters = Some(parameters);
        self.inverse = None;
        self.state = InverseState::Configured;
        Ok(())
    }

    /// Builds the matrix structure and the structural state of the inverse service.
    pub fn initialize_inverse(&mut self) -> Result<()> {
        let parameters = match (&self.state, &self.inverse_parameters) {
            (InverseState::Unconfigured, _) | (_, None) => {
                return Err(OperatorError::configuration(format!(
                    "inverse parameters of operator `{}` have not been set",
                    self.name
                )))
            }
            (_, Some(parameters)) => parameters.clone(),
        };

        self.symbolic_assemble_matrix()?;
        let mut inverse = create_inverse(&parameters);
        let (matrix, _, _) = self.assembled()?;
        inverse
            .initialize_structure(matrix.pattern())
            .map_err(OperatorError::Inverse)?;
        debug!("operator `{}`: {} inverse structure built", self.name, inverse.name());

        self.inverse = Some(inverse);
        self.state = InverseState::StructureBuilt;
        Ok(())
    }

    /// Assembles the matrix and computes the numeric inverse, initializing the
    /// structure first if needed.
    pub fn compute_inverse(&mut self) -> Result<()> {
        match self.state {
            InverseState::Unconfigured | InverseState::Configured => self.initialize_inverse()?,
            InverseState::StructureBuilt | InverseState::NumericReady => {}
        }
        self.assemble_matrix()?;

        let matrix = self
            .matrix
            .as_ref()
            .ok_or_else(|| OperatorError::structural("numeric assembly left no matrix"))?;
        let inverse = self.inverse.as_mut().ok_or_else(|| OperatorError::MissingInverse {
            operator: self.name.clone(),
        })?;
        inverse.compute_numeric(matrix).map_err(OperatorError::Inverse)?;
        debug!("operator `{}`: {} inverse computed", self.name, inverse.name());

        self.state = InverseState::NumericReady;
        Ok(())
    }

    /// `y = A^{-1} x` through the inverse service.
    pub fn apply_inverse(&self, x: &CompositeVector, y: &mut CompositeVector) -> Result<()> {
        let inverse = self.inverse.as_deref().ok_or_else(|| OperatorError::MissingInverse {
            operator: self.name.clone(),
        })?;
        if self.state != InverseState::NumericReady {
            return Err(OperatorError::configuration(format!(
                "inverse of operator `{}` has not been computed",
                self.name
            )));
        }
        if !self.values_current() {
            return Err(OperatorError::configuration(format!(
                "blocks of operator `{}` changed since its inverse was computed",
                self.name
            )));
        }
        self.check_vector(x, &self.row_space, "row")?;
        self.check_vector(y, &self.col_space, "column")?;
        let (_, row_map, col_map) = self.assembled()?;
        self.counters.apply_inverse_calls.fetch_add(1, Ordering::Relaxed);

        match &self.flavor {
            Flavor::Standard => {
                let mut sv_x = DVector::zeros(row_map.num_global());
                let mut sv_y = DVector::zeros(col_map.num_global());
                row_map.copy_to_super_vector(0, x, &mut sv_x)?;
                inverse
                    .apply_inverse(DVectorView::from(&sv_x), DVectorViewMut::from(&mut sv_y))
                    .map_err(OperatorError::Inverse)?;
                col_map.copy_from_super_vector(0, &sv_y, y)
            }
            Flavor::FaceCellSchur(elimination) => elimination.apply_inverse(inverse, row_map, x, y),
        }
    }

    /// One line per block: its schema string, flagged when read-only.
    pub fn diagnostics(&self) -> String {
        let mut out = format!("{}: {} x {}\n", self.name, self.schema_row, self.schema_col);
        for (op, properties) in self.ops.iter().zip(&self.properties) {
            let suffix = if properties.read_only { " (read-only)" } else { "" };
            out.push_str(&format!("  {}{}\n", op.read().schema_string(), suffix));
        }
        out
    }

    /// Writes the assembled matrix to `<base>.dat` and the dof table to `<base>_map.dat`.
    pub fn write_matrix(&self, base: impl AsRef<Path>) -> Result<()> {
        let (matrix, row_map, _) = self.assembled()?;
        let base = base.as_ref();
        io::write_matrix_market(io::with_suffix(base, ".dat"), matrix)?;
        io::write_dof_table(io::with_suffix(base, "_map.dat"), row_map)?;
        Ok(())
    }

    pub fn statistics(&self) -> OperatorStatistics {
        OperatorStatistics {
            apply_calls: self.counters.apply_calls.load(Ordering::Relaxed),
            apply_inverse_calls: self.counters.apply_inverse_calls.load(Ordering::Relaxed),
            factorizations_ok: self.counters.factorizations_ok.load(Ordering::Relaxed),
            factorizations_failed: self.counters.factorizations_failed.load(Ordering::Relaxed),
        }
    }

    pub fn reset_statistics(&self) {
        self.counters.apply_calls.store(0, Ordering::Relaxed);
        self.counters.apply_inverse_calls.store(0, Ordering::Relaxed);
        self.counters.factorizations_ok.store(0, Ordering::Relaxed);
        self.counters.factorizations_failed.store(0, Ordering::Relaxed);
    }
}
