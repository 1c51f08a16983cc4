//! Error types for operator construction, assembly and inversion.
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Coarse classification of an [`OperatorError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    SchemaMismatch,
    Structural,
    NumericFailure,
    Precondition,
    Inverse,
    Io,
}

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("no component `{component}` with dof {dof} is registered in block {block}")]
    MissingComponent {
        block: usize,
        component: String,
        dof: usize,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("operator `{operator}` did not initialize a preconditioner")]
    MissingInverse { operator: String },
    #[error("Schemas mismatch: {op} != {operator}")]
    SchemaMismatch { op: String, operator: String },
    #[error("structural error: {0}")]
    Structural(String),
    #[error("local elimination failed on {failed} of {total} entities (first failure at entity {entity})")]
    NumericFailure {
        failed: usize,
        total: usize,
        entity: usize,
    },
    #[error("precondition violated: {0}")]
    Precondition(String),
    #[error("inverse service failed: {0:#}")]
    Inverse(eyre::Report),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OperatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingComponent { .. } | Self::Configuration(_) | Self::MissingInverse { .. } => {
                ErrorKind::Configuration
            }
            Self::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Self::Structural(_) => ErrorKind::Structural,
            Self::NumericFailure { .. } => ErrorKind::NumericFailure,
            Self::Precondition(_) => ErrorKind::Precondition,
            Self::Inverse(_) => ErrorKind::Inverse,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn structural(msg: impl Into<String>) -> Self {
        Self::Structural(msg.into())
    }

    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
