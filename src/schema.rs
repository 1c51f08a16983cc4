//! Compact descriptions of the unknown layout touched by a local block.
use crate::entity::EntityKind;
use crate::space::UnknownSpace;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The entity a block iterates over, and the `(entity kind, dofs per entity)` items
/// of the unknowns it touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    base: EntityKind,
    items: Vec<(EntityKind, usize)>,
}

/// How [`Schema`]s are compared when searching for a block.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MatchRule {
    Exact,
    /// The candidate's items are a subset of the requested items.
    Subset,
    /// The candidate's items are a superset of the requested items.
    Superset,
}

impl Schema {
    pub fn new(base: EntityKind) -> Self {
        Self {
            base,
            items: Vec::new(),
        }
    }

    /// A schema with a single item.
    pub fn init(base: EntityKind, kind: EntityKind, num_dofs: usize) -> Self {
        Self::new(base).with_item(kind, num_dofs)
    }

    /// Appends an item. Items are kept in insertion order.
    pub fn with_item(mut self, kind: EntityKind, num_dofs: usize) -> Self {
        self.items.push((kind, num_dofs));
        self
    }

    /// The schema summarizing all components of a space.
    pub fn from_space(base: EntityKind, space: &UnknownSpace) -> Self {
        space
            .components()
            .iter()
            .fold(Self::new(base), |schema, c| schema.with_item(c.kind(), c.num_dofs()))
    }

    pub fn base(&self) -> EntityKind {
        self.base
    }

    pub fn items(&self) -> &[(EntityKind, usize)] {
        &self.items
    }

    /// Total number of dofs on entities of the given kind (0 if absent).
    pub fn size(&self, kind: EntityKind) -> usize {
        self.items
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, n)| n)
            .sum()
    }

    /// Exact equality on base and item composition.
    pub fn matches(&self, other: &Schema) -> bool {
        self == other
    }

    /// Whether every item of `self` also appears in `other`.
    pub fn is_subset_of(&self, other: &Schema) -> bool {
        self.items.iter().all(|item| other.items.contains(item))
    }

    pub fn matches_with(&self, other: &Schema, rule: MatchRule) -> bool {
        match rule {
            MatchRule::Exact => self.matches(other),
            MatchRule::Subset => self.base == other.base && self.is_subset_of(other),
            MatchRule::Superset => self.base == other.base && other.is_subset_of(self),
        }
    }

    /// A string identifying the schema, e.g. `cell[face:1,cell:1]`.
    pub fn create_unique_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.base)?;
        for (i, (kind, n)) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", kind, n)?;
        }
        write!(f, "]")
    }
}
