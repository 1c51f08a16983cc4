use serde::{Deserialize, Serialize};
use std::fmt;

/// A category of mesh entity that can carry degrees of freedom.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Cell,
    Face,
    Node,
    Edge,
    BoundaryFace,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Cell,
        EntityKind::Face,
        EntityKind::Node,
        EntityKind::Edge,
        EntityKind::BoundaryFace,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cell => "cell",
            Self::Face => "face",
            Self::Node => "node",
            Self::Edge => "edge",
            Self::BoundaryFace => "boundary_face",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Cell => 0,
            Self::Face => 1,
            Self::Node => 2,
            Self::Edge => 3,
            Self::BoundaryFace => 4,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Selects owned entities only, or owned entities followed by ghosts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ParallelType {
    Owned,
    All,
}
