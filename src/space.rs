//! Unknown spaces and the composite vectors that live on them.
//!
//! An [`UnknownSpace`] is an ordered set of named components, each bound to an entity
//! kind with a fixed number of dofs per entity. A [`CompositeVector`] stores one
//! `num_dofs x num_entities` matrix per component, with owned entities in the leading
//! columns and ghosts in the trailing ones.
//!
//! Ghost entities are halo copies of entities held in the same address space. They are
//! resolved to their owning column through global ids when the space is built, which
//! makes [`CompositeVector::scatter_owned_to_ghosted`] and
//! [`CompositeVector::gather_ghosted_to_owned`] the only places a distributed
//! exchange would have to be plugged in.
use crate::entity::{EntityKind, ParallelType};
use crate::error::{OperatorError, Result};
use crate::mesh::MeshPartition;
use itertools::izip;
use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut, Point3};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Declaration of one component of an [`UnknownSpace`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub kind: EntityKind,
    pub num_dofs: usize,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, kind: EntityKind, num_dofs: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            num_dofs,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    spec: ComponentSpec,
    num_owned: usize,
    num_global: usize,
    global_ids: Vec<usize>,
    /// Owning local index of every ghost entity.
    ghost_owners: Vec<usize>,
    centroids: Vec<Point3<f64>>,
}

impl Component {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn kind(&self) -> EntityKind {
        self.spec.kind
    }

    pub fn num_dofs(&self) -> usize {
        self.spec.num_dofs
    }

    pub fn spec(&self) -> &ComponentSpec {
        &self.spec
    }

    pub fn num_entities(&self, ptype: ParallelType) -> usize {
        match ptype {
            ParallelType::Owned => self.num_owned,
            ParallelType::All => self.global_ids.len(),
        }
    }

    pub fn num_global(&self) -> usize {
        self.num_global
    }

    pub fn global_ids(&self) -> &[usize] {
        &self.global_ids
    }

    pub fn global_id(&self, local: usize) -> usize {
        self.global_ids[local]
    }

    pub fn ghost_owner(&self, ghost: usize) -> usize {
        self.ghost_owners[ghost - self.num_owned]
    }

    pub fn centroid(&self, local: usize) -> Point3<f64> {
        self.centroids[local]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnknownSpace {
    components: Vec<Component>,
}

impl UnknownSpace {
    pub fn try_new(mesh: &dyn MeshPartition, specs: Vec<ComponentSpec>) -> Result<Self> {
        let mut components: Vec<Component> = Vec::with_capacity(specs.len());
        for spec in specs {
            if components.iter().any(|c| c.name() == spec.name) {
                return Err(OperatorError::structural(format!("duplicate component `{}`", spec.name)));
            }
            if spec.num_dofs == 0 {
                return Err(OperatorError::structural(format!("component `{}` has no dofs", spec.name)));
            }

            let num_owned = mesh.num_entities(spec.kind, ParallelType::Owned);
            let num_all = mesh.num_entities(spec.kind, ParallelType::All);
            let global_ids: Vec<_> = (0..num_all).map(|i| mesh.global_id(spec.kind, i)).collect();
            let owner_of: FxHashMap<usize, usize> = global_ids[..num_owned]
                .iter()
                .enumerate()
                .map(|(local, gid)| (*gid, local))
                .collect();
            let ghost_owners = global_ids[num_owned..]
                .iter()
                .map(|gid| {
                    owner_of.get(gid).copied().ok_or_else(|| {
                        OperatorError::structural(format!(
                            "ghost {} entity with global id {} has no owned counterpart (component `{}`)",
                            spec.kind, gid, spec.name
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let centroids = (0..num_all).map(|i| mesh.centroid(spec.kind, i)).collect();

            components.push(Component {
                num_owned,
                num_global: mesh.num_global_entities(spec.kind),
                global_ids,
                ghost_owners,
                centroids,
                spec,
            });
        }
        Ok(Self { components })
    }

    /// Restricts the space to the named components, in the given order.
    pub fn subspace(&self, names: &[&str]) -> Result<Self> {
        let components = names
            .iter()
            .map(|name| {
                self.component(name).cloned().ok_or_else(|| OperatorError::MissingComponent {
                    block: 0,
                    component: name.to_string(),
                    dof: 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { components })
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name() == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.components.iter().position(|c| c.name() == name)
    }

    pub fn has_component(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn has_ghosts(&self) -> bool {
        self.components
            .iter()
            .any(|c| c.num_entities(ParallelType::All) > c.num_owned)
    }

    /// Number of scalar dofs over all components.
    pub fn num_dofs(&self, ptype: ParallelType) -> usize {
        self.components
            .iter()
            .map(|c| c.num_dofs() * c.num_entities(ptype))
            .sum()
    }

    /// Whether vectors on the two spaces have identical layouts.
    pub fn is_compatible(&self, other: &UnknownSpace) -> bool {
        self.components.len() == other.components.len()
            && self
                .components
                .iter()
                .zip(&other.components)
                .all(|(a, b)| a.spec == b.spec && a.global_ids == b.global_ids && a.num_owned == b.num_owned)
    }
}

/// A vector with one block of values per component of an [`UnknownSpace`].
#[derive(Debug, Clone)]
pub struct CompositeVector {
    space: Arc<UnknownSpace>,
    data: Vec<DMatrix<f64>>,
}

impl CompositeVector {
    pub fn new(space: Arc<UnknownSpace>) -> Self {
        let data = space
            .components()
            .iter()
            .map(|c| DMatrix::zeros(c.num_dofs(), c.num_entities(ParallelType::All)))
            .collect();
        Self { space, data }
    }

    pub fn space(&self) -> &Arc<UnknownSpace> {
        &self.space
    }

    pub fn has_component(&self, name: &str) -> bool {
        self.space.has_component(name)
    }

    /// Owned and ghost values of a component.
    pub fn component(&self, name: &str) -> Option<&DMatrix<f64>> {
        self.space.index_of(name).map(|i| &self.data[i])
    }

    pub fn component_mut(&mut self, name: &str) -> Option<&mut DMatrix<f64>> {
        self.space.index_of(name).map(move |i| &mut self.data[i])
    }

    pub fn owned_view(&self, name: &str) -> Option<DMatrixView<f64>> {
        let i = self.space.index_of(name)?;
        let n = self.space.components()[i].num_entities(ParallelType::Owned);
        Some(self.data[i].columns(0, n))
    }

    pub fn owned_view_mut(&mut self, name: &str) -> Option<DMatrixViewMut<f64>> {
        let i = self.space.index_of(name)?;
        let n = self.space.components()[i].num_entities(ParallelType::Owned);
        Some(self.data[i].columns_mut(0, n))
    }

    pub(crate) fn data(&self, component: usize) -> &DMatrix<f64> {
        &self.data[component]
    }

    pub(crate) fn data_mut(&mut self, component: usize) -> &mut DMatrix<f64> {
        &mut self.data[component]
    }

    /// Copies owned values into the ghost copies.
    pub fn scatter_owned_to_ghosted(&mut self) {
        for (component, values) in self.space.components().iter().zip(&mut self.data) {
            for ghost in component.num_owned..values.ncols() {
                let owner = component.ghost_owner(ghost);
                let owned = values.column(owner).clone_owned();
                values.column_mut(ghost).copy_from(&owned);
            }
        }
    }

    /// Adds ghost values into their owners. Ghost values are left untouched.
    pub fn gather_ghosted_to_owned(&mut self) {
        for (component, values) in self.space.components().iter().zip(&mut self.data) {
            for ghost in component.num_owned..values.ncols() {
                let owner = component.ghost_owner(ghost);
                let contribution = values.column(ghost).clone_owned();
                let mut owned = values.column_mut(owner);
                owned += &contribution;
            }
        }
    }

    pub fn put_scalar(&mut self, value: f64) {
        for (component, values) in self.space.components().iter().zip(&mut self.data) {
            values.columns_mut(0, component.num_owned).fill(value);
        }
    }

    pub fn put_scalar_owned_and_ghosted(&mut self, value: f64) {
        for values in &mut self.data {
            values.fill(value);
        }
    }

    pub fn put_scalar_ghosted(&mut self, value: f64) {
        for (component, values) in self.space.components().iter().zip(&mut self.data) {
            let n = values.ncols() - component.num_owned;
            values.columns_mut(component.num_owned, n).fill(value);
        }
    }

    pub fn scale_owned(&mut self, factor: f64) {
        for (component, values) in self.space.components().iter().zip(&mut self.data) {
            values.columns_mut(0, component.num_owned).scale_mut(factor);
        }
    }

    /// Copies the owned values of `other`. Ghost values are left untouched.
    pub fn copy_owned_from(&mut self, other: &CompositeVector) {
        self.assert_compatible(other);
        for (component, values, other_values) in izip!(self.space.components(), &mut self.data, &other.data) {
            let n = component.num_owned;
            values.columns_mut(0, n).copy_from(&other_values.columns(0, n));
        }
    }

    /// `self = alpha * other + beta * self` on owned values.
    pub fn update(&mut self, alpha: f64, other: &CompositeVector, beta: f64) {
        self.assert_compatible(other);
        for (component, values, other_values) in izip!(self.space.components(), &mut self.data, &other.data) {
            let n = component.num_owned;
            let mut target = values.columns_mut(0, n);
            target.scale_mut(beta);
            target += other_values.columns(0, n) * alpha;
        }
    }

    /// Dot product over owned values.
    pub fn dot(&self, other: &CompositeVector) -> f64 {
        self.assert_compatible(other);
        izip!(self.space.components(), &self.data, &other.data)
            .map(|(component, a, b)| {
                let n = component.num_owned;
                a.columns(0, n).dot(&b.columns(0, n))
            })
            .sum()
    }

    pub fn norm2(&self) -> f64 {
        self.dot(self).sqrt()
    }

    /// Largest absolute owned value.
    pub fn norm_inf(&self) -> f64 {
        self.space
            .components()
            .iter()
            .zip(&self.data)
            .map(|(component, values)| values.columns(0, component.num_owned).amax())
            .fold(0.0, f64::max)
    }

    fn assert_compatible(&self, other: &CompositeVector) {
        assert!(
            Arc::ptr_eq(&self.space, &other.space) || self.space.is_compatible(&other.space),
            "composite vectors live on incompatible spaces"
        );
    }
}
