//! Diagnostic export of assembled operators.
use crate::dof_map::DofMap;
use crate::error::{OperatorError, Result};
use nalgebra::Scalar;
use nalgebra_sparse::CsrMatrix;
use std::fmt::LowerExp;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Appends `suffix` to the file name of `base`, e.g. `out/A` -> `out/A_map.dat`.
pub fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Writes a matrix in Matrix Market coordinate format.
pub fn write_matrix_market<T: Scalar + LowerExp>(path: impl AsRef<Path>, matrix: &CsrMatrix<T>) -> std::io::Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "%%MatrixMarket matrix coordinate real general")?;
    writeln!(writer, "{} {} {}", matrix.nrows(), matrix.ncols(), matrix.nnz())?;

    for (i, j, v) in matrix.triplet_iter() {
        // Indices have to be stored as 1-based
        writeln!(writer, "{} {} {:.e}", i + 1, j + 1, v)?;
    }
    writer.flush()
}

/// Writes one line per owned dof: `component:dof local_id entity_gid dof_gid x y z`.
pub fn write_dof_table(path: impl AsRef<Path>, map: &DofMap) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "# component local_id entity_gid dof_gid x y z")?;
    for key in map.keys() {
        let component = map
            .blocks()
            .get(key.block)
            .and_then(|space| space.component(&key.component))
            .ok_or_else(|| OperatorError::MissingComponent {
                block: key.block,
                component: key.component.clone(),
                dof: key.dof,
            })?;
        let indices = map.owned_indices(key.block, &key.component, key.dof)?;
        for (local, dof_gid) in indices.iter().enumerate() {
            let p = component.centroid(local);
            writeln!(
                writer,
                "{}:{} {} {} {} {:e} {:e} {:e}",
                key.component,
                key.dof,
                local,
                component.global_id(local),
                dof_gid,
                p.x,
                p.y,
                p.z
            )?;
        }
    }
    writer.flush()?;
    Ok(())
}
