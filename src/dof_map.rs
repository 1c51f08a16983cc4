//! Global numbering of the scalar degrees of freedom of one or more unknown spaces.
//!
//! Every `(block, component, dof)` key receives a contiguous range of global indices
//! `[offset, offset + num_global(kind))`, in input order. The global index of the dof
//! on a given entity is `offset + global_id(entity)`, so ghost entities observe the
//! same index as their owner without any communication.
//!
//! The local ("super vector") numbering places the owned dofs of all keys first,
//! key-major, followed by the ghost dofs in the same key order.
use crate::entity::ParallelType;
use crate::error::{OperatorError, Result};
use crate::space::{CompositeVector, UnknownSpace};
use nalgebra::DVector;
use std::ops::Range;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DofKey {
    pub block: usize,
    pub component: String,
    pub dof: usize,
}

#[derive(Debug, Clone)]
struct DofEntry {
    key: DofKey,
    /// Index of the component within its block's space.
    component: usize,
    global_offset: usize,
    num_global: usize,
    owned_offset: usize,
    ghost_offset: usize,
    num_owned: usize,
    /// Global indices of owned entities, followed by ghosts.
    indices: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct DofMap {
    blocks: Vec<Arc<UnknownSpace>>,
    entries: Vec<DofEntry>,
    num_owned: usize,
    num_ghosted: usize,
    num_global: usize,
}

impl DofMap {
    pub fn new(space: Arc<UnknownSpace>) -> Self {
        Self::build(vec![space])
    }

    pub fn build(blocks: Vec<Arc<UnknownSpace>>) -> Self {
        let mut entries = Vec::new();
        let mut global_offset = 0;
        let mut owned_offset = 0;
        for (block, space) in blocks.iter().enumerate() {
            for (c, component) in space.components().iter().enumerate() {
                for dof in 0..component.num_dofs() {
                    let indices = component
                        .global_ids()
                        .iter()
                        .map(|gid| global_offset + gid)
                        .collect();
                    let num_owned = component.num_entities(ParallelType::Owned);
                    entries.push(DofEntry {
                        key: DofKey {
                            block,
                            component: component.name().to_string(),
                            dof,
                        },
                        component: c,
                        global_offset,
                        num_global: component.num_global(),
                        owned_offset,
                        ghost_offset: 0,
                        num_owned,
                        indices,
                    });
                    global_offset += component.num_global();
                    owned_offset += num_owned;
                }
            }
        }

        let num_owned = owned_offset;
        let mut ghost_offset = num_owned;
        for entry in &mut entries {
            entry.ghost_offset = ghost_offset;
            ghost_offset += entry.indices.len() - entry.num_owned;
        }

        Self {
            blocks,
            entries,
            num_owned,
            num_ghosted: ghost_offset,
            num_global: global_offset,
        }
    }

    pub fn blocks(&self) -> &[Arc<UnknownSpace>] {
        &self.blocks
    }

    pub fn num_owned(&self) -> usize {
        self.num_owned
    }

    /// Number of owned plus ghost dofs.
    pub fn num_ghosted(&self) -> usize {
        self.num_ghosted
    }

    pub fn num_global(&self) -> usize {
        self.num_global
    }

    pub fn keys(&self) -> impl Iterator<Item = &DofKey> {
        self.entries.iter().map(|e| &e.key)
    }

    /// Position of a key in registration order.
    pub fn key_index(&self, block: usize, component: &str, dof: usize) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| e.key.block == block && e.key.dof == dof && e.key.component == component)
            .ok_or_else(|| OperatorError::MissingComponent {
                block,
                component: component.to_string(),
                dof,
            })
    }

    fn entry(&self, block: usize, component: &str, dof: usize) -> Result<&DofEntry> {
        self.key_index(block, component, dof).map(|k| &self.entries[k])
    }

    /// Global index of the dof `key` on a local entity (owned or ghost).
    pub fn global_index(&self, key: usize, entity: usize) -> usize {
        self.entries[key].indices[entity]
    }

    /// Global indices of a key on all local entities, owned first.
    pub fn key_indices(&self, key: usize) -> &[usize] {
        &self.entries[key].indices
    }

    pub fn owned_indices(&self, block: usize, component: &str, dof: usize) -> Result<&[usize]> {
        let entry = self.entry(block, component, dof)?;
        Ok(&entry.indices[..entry.num_owned])
    }

    /// Global indices of owned entities followed by ghosts.
    pub fn ghosted_indices(&self, block: usize, component: &str, dof: usize) -> Result<&[usize]> {
        Ok(&self.entry(block, component, dof)?.indices)
    }

    /// Super-vector positions of the owned dofs of a key.
    pub fn owned_range(&self, block: usize, component: &str, dof: usize) -> Result<Range<usize>> {
        let entry = self.entry(block, component, dof)?;
        Ok(entry.owned_offset..entry.owned_offset + entry.num_owned)
    }

    /// Super-vector positions of the ghost dofs of a key.
    pub fn ghost_range(&self, block: usize, component: &str, dof: usize) -> Result<Range<usize>> {
        let entry = self.entry(block, component, dof)?;
        let num_ghosts = entry.indices.len() - entry.num_owned;
        Ok(entry.ghost_offset..entry.ghost_offset + num_ghosts)
    }

    pub fn global_range(&self, block: usize, component: &str, dof: usize) -> Result<Range<usize>> {
        let entry = self.entry(block, component, dof)?;
        Ok(entry.global_offset..entry.global_offset + entry.num_global)
    }

    /// Writes the owned values of `x` into a vector in global numbering.
    ///
    /// Positions not owned by this partition are left untouched.
    pub fn copy_to_super_vector(&self, block: usize, x: &CompositeVector, sv: &mut DVector<f64>) -> Result<()> {
        assert_eq!(sv.len(), self.num_global, "super vector must have the global dimension");
        self.visit_owned(block, x.space(), |entry, c| {
            let values = x.data(c);
            for (entity, gi) in entry.indices[..entry.num_owned].iter().enumerate() {
                sv[*gi] = values[(entry.key.dof, entity)];
            }
        })
    }

    /// Overwrites the owned values of `x` from a vector in global numbering.
    pub fn copy_from_super_vector(&self, block: usize, sv: &DVector<f64>, x: &mut CompositeVector) -> Result<()> {
        assert_eq!(sv.len(), self.num_global, "super vector must have the global dimension");
        let space = Arc::clone(x.space());
        self.visit_owned(block, &space, |entry, c| {
            let values = x.data_mut(c);
            for (entity, gi) in entry.indices[..entry.num_owned].iter().enumerate() {
                values[(entry.key.dof, entity)] = sv[*gi];
            }
        })
    }

    /// Adds a vector in global numbering into the owned values of `x`.
    pub fn add_from_super_vector(&self, block: usize, sv: &DVector<f64>, x: &mut CompositeVector) -> Result<()> {
        assert_eq!(sv.len(), self.num_global, "super vector must have the global dimension");
        let space = Arc::clone(x.space());
        self.visit_owned(block, &space, |entry, c| {
            let values = x.data_mut(c);
            for (entity, gi) in entry.indices[..entry.num_owned].iter().enumerate() {
                values[(entry.key.dof, entity)] += sv[*gi];
            }
        })
    }

    /// Calls `f` for every key of `block`, with the index of the matching component in `space`.
    fn visit_owned(&self, block: usize, space: &UnknownSpace, mut f: impl FnMut(&DofEntry, usize)) -> Result<()> {
        let block_space = self
            .blocks
            .get(block)
            .ok_or_else(|| OperatorError::configuration(format!("no block {} in dof map", block)))?;
        for entry in self.entries.iter().filter(|e| e.key.block == block) {
            let component = &block_space.components()[entry.component];
            let c = space
                .index_of(component.name())
                .ok_or_else(|| OperatorError::MissingComponent {
                    block,
                    component: component.name().to_string(),
                    dof: entry.key.dof,
                })?;
            let target = &space.components()[c];
            if target.num_entities(ParallelType::Owned) != entry.num_owned || target.num_dofs() <= entry.key.dof {
                return Err(OperatorError::structural(format!(
                    "component `{}` of the vector does not match the dof map layout",
                    component.name()
                )));
            }
            f(entry, c);
        }
        Ok(())
    }
}
