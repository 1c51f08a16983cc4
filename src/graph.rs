//! Sparse graph construction (symbolic phase) and value accumulation (numeric phase).
use crate::error::{OperatorError, Result};
use nalgebra::{DMatrix, DVectorView};
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::CsrMatrix;
use std::collections::BTreeSet;

/// Collects the nonzero positions of a global matrix.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    nrows: usize,
    ncols: usize,
    // Each entry is stored exactly once, so overlapping local blocks cost nothing extra
    // once the pattern is compressed
    entries: BTreeSet<(usize, usize)>,
}

impl GraphBuilder {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            entries: BTreeSet::new(),
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, i: usize, j: usize) -> bool {
        self.entries.contains(&(i, j))
    }

    pub fn insert(&mut self, i: usize, j: usize) -> Result<()> {
        if i >= self.nrows || j >= self.ncols {
            return Err(OperatorError::structural(format!(
                "graph entry ({}, {}) is outside a {}x{} matrix",
                i, j, self.nrows, self.ncols
            )));
        }
        self.entries.insert((i, j));
        Ok(())
    }

    /// Inserts the dense block `rows x cols`.
    pub fn insert_block(&mut self, rows: &[usize], cols: &[usize]) -> Result<()> {
        for &i in rows {
            for &j in cols {
                self.insert(i, j)?;
            }
        }
        Ok(())
    }

    /// Inserts every diagonal entry of the leading square part.
    pub fn insert_diagonal(&mut self) {
        for i in 0..self.nrows.min(self.ncols) {
            self.entries.insert((i, i));
        }
    }

    /// Compresses the collected entries into a CSR sparsity pattern.
    pub fn build(self) -> Result<SparsityPattern> {
        let num_rows = self.nrows;
        let mut offsets = Vec::with_capacity(num_rows + 1);
        let mut column_indices = Vec::with_capacity(self.entries.len());

        offsets.push(0);
        for (i, j) in self.entries {
            while i + 1 > offsets.len() {
                // Run in a loop so that consecutive empty rows are handled
                offsets.push(column_indices.len());
            }
            column_indices.push(j);
        }

        // Fill out the remaining offsets if the last rows are empty
        while offsets.len() < (num_rows + 1) {
            offsets.push(column_indices.len());
        }

        SparsityPattern::try_from_offsets_and_indices(num_rows, self.ncols, offsets, column_indices)
            .map_err(|err| OperatorError::structural(format!("invalid sparsity pattern: {}", err)))
    }
}

/// Accumulates local matrices into a CSR matrix with a fixed pattern.
#[derive(Debug, Clone, Default)]
pub struct MatrixAssembler {
    // Buffer reused between local matrices
    permutation: Vec<usize>,
}

impl MatrixAssembler {
    /// Adds `local` to the entries `(rows[i], cols[j])` of `csr`.
    ///
    /// Repeated global indices within `rows` or `cols` are summed. Every target entry
    /// must be present in the pattern of `csr`.
    pub fn add_local_matrix(
        &mut self,
        csr: &mut CsrMatrix<f64>,
        rows: &[usize],
        cols: &[usize],
        local: &DMatrix<f64>,
    ) -> Result<()> {
        assert_eq!(local.shape(), (rows.len(), cols.len()));

        self.permutation.clear();
        self.permutation.extend(0..cols.len());
        self.permutation.sort_unstable_by_key(|k| cols[*k]);

        for (local_row, &global_row) in rows.iter().enumerate() {
            if global_row >= csr.nrows() {
                return Err(OperatorError::structural(format!(
                    "row {} is outside the assembled matrix",
                    global_row
                )));
            }
            let mut csr_row = csr.row_mut(global_row);
            let (column_indices, values) = csr_row.cols_and_values_mut();

            // Columns are visited in increasing order, so the search never has to go back
            let mut offset = 0;
            for &k in &self.permutation {
                let global_col = cols[k];
                let found = column_indices[offset..]
                    .iter()
                    .position(|c| *c == global_col)
                    .ok_or_else(|| {
                        OperatorError::structural(format!(
                            "entry ({}, {}) is missing from the sparsity pattern",
                            global_row, global_col
                        ))
                    })?;
                offset += found;
                values[offset] += local[(local_row, k)];
            }
        }
        Ok(())
    }

    /// Adds `diagonal[k]` to the entry `(rows[k], cols[k])`.
    pub fn add_local_diagonal(
        &mut self,
        csr: &mut CsrMatrix<f64>,
        rows: &[usize],
        cols: &[usize],
        diagonal: DVectorView<f64>,
    ) -> Result<()> {
        assert_eq!(rows.len(), diagonal.len());
        assert_eq!(cols.len(), diagonal.len());
        for ((&i, &j), d) in rows.iter().zip(cols).zip(diagonal.iter()) {
            add_to_entry(csr, i, j, *d)?;
        }
        Ok(())
    }
}

/// Adds `shift` to every diagonal entry.
pub fn add_diagonal_shift(csr: &mut CsrMatrix<f64>, shift: f64) -> Result<()> {
    for i in 0..csr.nrows().min(csr.ncols()) {
        add_to_entry(csr, i, i, shift)?;
    }
    Ok(())
}

fn add_to_entry(csr: &mut CsrMatrix<f64>, i: usize, j: usize, value: f64) -> Result<()> {
    if i >= csr.nrows() {
        return Err(OperatorError::structural(format!("row {} is outside the assembled matrix", i)));
    }
    let mut row = csr.row_mut(i);
    let (column_indices, values) = row.cols_and_values_mut();
    let k = column_indices.binary_search(&j).map_err(|_| {
        OperatorError::structural(format!("entry ({}, {}) is missing from the sparsity pattern", i, j))
    })?;
    values[k] += value;
    Ok(())
}
