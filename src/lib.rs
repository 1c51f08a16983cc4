//! Assembly of discrete operators from per-entity local blocks.
//!
//! Local dense blocks ([`op::Op`]) produced by a mimetic or mixed discretization are
//! collected in a global [`operator::Operator`], which can apply them matrix-free,
//! assemble them into a sparse matrix over a global dof numbering ([`dof_map`]) and
//! invert the result through a pluggable [`inverse::InverseService`]. Face-cell
//! systems can be reduced to faces only by eliminating cell unknowns locally.

pub mod config;
pub mod dof_map;
pub mod entity;
pub mod error;
pub mod graph;
pub mod inverse;
pub mod io;
pub mod mesh;
pub mod op;
pub mod operator;
pub mod schema;
pub mod space;

pub use error::{ErrorKind, OperatorError, Result};

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;
