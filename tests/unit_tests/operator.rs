use crate::{accumulation_op, diffusion_op, face_cell_space, face_mass, matrix_free_dense, owned_values, sample_vector};
use matrixcompare::assert_matrix_eq;
use mfd_operators::config::{InverseMethod, InverseParameters, OperatorParameters};
use mfd_operators::entity::{EntityKind, ParallelType};
use mfd_operators::mesh::procedural::{create_periodic_rectangular_mesh, create_rectangular_mesh};
use mfd_operators::mesh::{MeshPartition, PartitionedMesh, SurfaceEmbedding};
use mfd_operators::op::Op;
use mfd_operators::operator::{ApplyMode, InverseState, OpProperties, Operator, OperatorStatistics};
use mfd_operators::schema::{MatchRule, Schema};
use mfd_operators::space::{ComponentSpec, CompositeVector, UnknownSpace};
use mfd_operators::{ErrorKind, OperatorError};
use nalgebra::{DMatrix, DVector};
use parking_lot::RwLock;
use proptest::prelude::*;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn mesh(nx: usize, ny: usize, periodic: bool) -> PartitionedMesh {
    if periodic {
        create_periodic_rectangular_mesh(nx, ny, [1.0, 1.0])
    } else {
        create_rectangular_mesh(nx, ny, [1.0, 1.0])
    }
}

fn diffusion_operator(mesh: &PartitionedMesh, parameters: &OperatorParameters) -> Operator {
    let mut operator = Operator::new("diffusion", face_cell_space(mesh), parameters).unwrap();
    operator.push_op(diffusion_op(mesh));
    operator.push_op(accumulation_op(mesh, 1.0));
    operator
}

fn dense_lu() -> OperatorParameters {
    OperatorParameters {
        inverse: Some(InverseParameters::default().with_method(InverseMethod::DenseLu)),
        ..Default::default()
    }
}

proptest! {
    #[test]
    fn matrix_free_apply_matches_assembled_matrix(
        nx in 1usize..5,
        ny in 1usize..4,
        periodic in any::<bool>(),
        shift in prop_oneof![Just(0.0), 0.1..2.0],
    ) {
        let mesh = mesh(nx, ny, periodic);
        let parameters = OperatorParameters { diagonal_shift: shift, ..Default::default() };
        let mut operator = diffusion_operator(&mesh, &parameters);
        operator.assemble_matrix().unwrap();

        let map = operator.row_dof_map().unwrap();
        let mut matrix_free = matrix_free_dense(&operator, map);
        for i in 0..map.num_global() {
            matrix_free[(i, i)] += shift;
        }
        let assembled = DMatrix::from(operator.matrix().unwrap());
        assert_matrix_eq!(assembled, matrix_free, comp = abs, tol = 1e-12);
    }
}

#[test]
fn sparsity_pattern_covers_every_local_entry() {
    let mesh = mesh(3, 2, true);
    let mut operator = diffusion_operator(&mesh, &Default::default());
    operator.symbolic_assemble_matrix().unwrap();
    let map = operator.row_dof_map().unwrap();
    let matrix = operator.matrix().unwrap();
    let dense_pattern = {
        let mut ones = matrix.clone();
        ones.values_mut().fill(1.0);
        DMatrix::from(&ones)
    };

    let op = operator.op(0).unwrap().read();
    for e in 0..op.num_entities() {
        let globals: Vec<usize> = op
            .row_dofs(e)
            .iter()
            .map(|dof| {
                let key = map.key_index(0, &op.row_components()[dof.slot], dof.dof).unwrap();
                map.global_index(key, dof.entity)
            })
            .collect();
        for &i in &globals {
            for &j in &globals {
                assert_eq!(dense_pattern[(i, j)], 1.0, "missing entry ({}, {})", i, j);
            }
        }
    }
    // Two faces, or a face and a cell, that share no cell are never coupled
    assert!(matrix.nnz() < map.num_global() * map.num_global());
}

#[test]
fn apply_modes_treat_the_output_differently() {
    let mesh = mesh(2, 2, true);
    let operator = diffusion_operator(&mesh, &Default::default());
    let space = operator.row_space().clone();
    let x = sample_vector(&space, 1);

    let mut ax = CompositeVector::new(space.clone());
    operator.apply(&x, &mut ax, ApplyMode::Overwrite).unwrap();
    let ax = owned_values(&ax);

    let mut y = CompositeVector::new(space.clone());
    y.put_scalar_owned_and_ghosted(5.0);
    operator.apply(&x, &mut y, ApplyMode::Overwrite).unwrap();
    assert_matrix_eq!(owned_values(&y), ax, comp = abs, tol = 1e-13);

    y.put_scalar_owned_and_ghosted(5.0);
    operator.apply(&x, &mut y, ApplyMode::Accumulate).unwrap();
    assert_matrix_eq!(owned_values(&y), ax.add_scalar(5.0), comp = abs, tol = 1e-13);

    y.put_scalar_owned_and_ghosted(5.0);
    operator.apply(&x, &mut y, ApplyMode::ScaleAndAccumulate(2.0)).unwrap();
    assert_matrix_eq!(owned_values(&y), ax.add_scalar(10.0), comp = abs, tol = 1e-13);

    assert_eq!(ApplyMode::from(0.0), ApplyMode::Overwrite);
    assert_eq!(ApplyMode::from(1.0), ApplyMode::Accumulate);
    assert_eq!(ApplyMode::from(-1.0), ApplyMode::ScaleAndAccumulate(-1.0));
}

#[test]
fn apply_is_additive_over_blocks() {
    let mesh = mesh(3, 2, false);
    let space = face_cell_space(&mesh);
    let diffusion = Arc::new(RwLock::new(diffusion_op(&mesh)));
    let accumulation = Arc::new(RwLock::new(accumulation_op(&mesh, 2.0)));

    let mut both = Operator::new("both", space.clone(), &Default::default()).unwrap();
    both.extend_ops([diffusion.clone(), accumulation.clone()]);
    let mut first = Operator::new("first", space.clone(), &Default::default()).unwrap();
    first.push_shared_op(diffusion, OpProperties::default());
    let mut second = Operator::new("second", space.clone(), &Default::default()).unwrap();
    second.push_shared_op(accumulation, OpProperties::default());

    let x = sample_vector(&space, 7);
    let mut y = CompositeVector::new(space.clone());
    let mut z = CompositeVector::new(space.clone());
    both.apply(&x, &mut y, 0.0).unwrap();
    first.apply(&x, &mut z, 0.0).unwrap();
    second.apply(&x, &mut z, 1.0).unwrap();
    assert_matrix_eq!(owned_values(&y), owned_values(&z), comp = abs, tol = 1e-13);
}

#[test]
fn reassembly_is_bit_identical() {
    let mesh = mesh(3, 3, true);
    let parameters = OperatorParameters {
        diagonal_shift: 0.3,
        ..Default::default()
    };
    let mut operator = diffusion_operator(&mesh, &parameters);
    operator.assemble_matrix().unwrap();
    let first = operator.matrix().unwrap().clone();
    operator.assemble_matrix().unwrap();
    assert_eq!(operator.matrix().unwrap().values(), first.values());
    assert_eq!(operator.matrix().unwrap().pattern(), first.pattern());
}

#[test]
fn residuals_accumulate_when_not_zeroed() {
    let mesh = mesh(2, 2, false);
    let mut operator = diffusion_operator(&mesh, &Default::default());
    let space = operator.row_space().clone();
    let u = sample_vector(&space, 2);
    let f = sample_vector(&space, 3);
    operator.update_rhs(&f, true).unwrap();

    let mut au = CompositeVector::new(space.clone());
    operator.apply(&u, &mut au, 0.0).unwrap();
    let au = owned_values(&au);
    let f = owned_values(&f);

    let mut r = CompositeVector::new(space.clone());
    operator.compute_residual(&u, &mut r, true).unwrap();
    assert_matrix_eq!(owned_values(&r), &f - &au, comp = abs, tol = 1e-13);

    r.put_scalar(1.0);
    operator.compute_residual(&u, &mut r, false).unwrap();
    assert_matrix_eq!(owned_values(&r), (&f - &au).add_scalar(1.0), comp = abs, tol = 1e-13);

    operator.compute_negative_residual(&u, &mut r, true).unwrap();
    assert_matrix_eq!(owned_values(&r), &au - &f, comp = abs, tol = 1e-13);

    r.put_scalar(1.0);
    operator.compute_negative_residual(&u, &mut r, false).unwrap();
    assert_matrix_eq!(owned_values(&r), (&au - &f).add_scalar(1.0), comp = abs, tol = 1e-13);
}

#[test]
fn update_rhs_requires_volume_weighted_sources() {
    let mesh = mesh(2, 2, false);
    let mut operator = diffusion_operator(&mesh, &Default::default());
    let mut source = CompositeVector::new(operator.row_space().clone());
    source.put_scalar(1.0);
    let err = operator.update_rhs(&source, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert_eq!(operator.rhs().norm_inf(), 0.0);

    operator.update_rhs(&source, true).unwrap();
    operator.update_rhs(&source, true).unwrap();
    assert_eq!(operator.rhs().norm_inf(), 2.0);
}

#[test]
fn local_vectors_are_summed_into_the_rhs() {
    let mesh = mesh(2, 1, false);
    let mut operator = diffusion_operator(&mesh, &Default::default());
    {
        let mut op = operator.op(0).unwrap().write();
        for c in 0..op.num_entities() {
            op.local_vector_mut(c).fill(1.0);
        }
    }
    operator.assemble_local_vectors().unwrap();
    let faces = operator.rhs().component("face").unwrap();
    // Face 1 is shared by both cells
    assert_eq!(faces[(0, 1)], 2.0);
    assert_eq!(faces[(0, 0)], 1.0);
    assert_eq!(operator.rhs().component("cell").unwrap()[(0, 1)], 1.0);
}

#[test]
fn zero_skips_read_only_blocks() {
    let mesh = mesh(2, 2, false);
    let space = face_cell_space(&mesh);
    let mut operator = Operator::new("A", space.clone(), &Default::default()).unwrap();
    operator.push_op_with(diffusion_op(&mesh), OpProperties::read_only());
    operator.push_op(accumulation_op(&mesh, 1.0));
    operator.rhs_mut().put_scalar(4.0);

    let before = operator.op(0).unwrap().read().data().clone();
    operator.zero();
    assert_eq!(operator.op(0).unwrap().read().data(), &before);
    assert_eq!(operator.op(1).unwrap().read().local_diagonal(3).unwrap()[0], 0.0);
    assert_eq!(operator.rhs().norm_inf(), 0.0);
    assert_eq!(operator.op_properties(0), Some(OpProperties::read_only()));
    assert!(operator.diagnostics().contains("(read-only)"));
}

#[test]
fn rescaling_scales_applied_values() {
    let mesh = mesh(3, 2, true);
    let mut operator = diffusion_operator(&mesh, &Default::default());
    let space = operator.row_space().clone();
    let x = sample_vector(&space, 4);
    let mut reference = CompositeVector::new(space.clone());
    operator.apply(&x, &mut reference, 0.0).unwrap();

    // Positive weights, with stale ghost values that must not be used
    let mut weights = sample_vector(&space, 9);
    for component in space.components() {
        let mut owned = weights.owned_view_mut(component.name()).unwrap();
        owned.apply(|w| *w = 1.5 + *w);
    }
    operator.rescale_by(&weights).unwrap();
    let mut y = CompositeVector::new(space.clone());
    operator.apply(&x, &mut y, 0.0).unwrap();
    let expected = owned_values(&reference).component_mul(&owned_values(&weights));
    assert_matrix_eq!(owned_values(&y), expected, comp = abs, tol = 1e-12);

    operator.rescale(2.0);
    operator.apply(&x, &mut y, 0.0).unwrap();
    assert_matrix_eq!(owned_values(&y), &expected * 2.0, comp = abs, tol = 1e-12);

    operator.rescale_op(1, 0.0).unwrap();
    assert_eq!(operator.rescale_op(5, 1.0).unwrap_err().kind(), ErrorKind::Configuration);
}

#[test]
fn local_diag_copy_sums_block_diagonals() {
    let mesh = mesh(2, 1, false);
    let operator = diffusion_operator(&mesh, &Default::default());
    let diag = operator.local_diag_copy().unwrap();

    let map_space = operator.row_space();
    let mut x = CompositeVector::new(map_space.clone());
    let mut y = CompositeVector::new(map_space.clone());
    // The diagonal of the operator is recovered column by column
    x.component_mut("cell").unwrap()[(0, 1)] = 1.0;
    operator.apply(&x, &mut y, 0.0).unwrap();
    assert_eq!(diag.component("cell").unwrap()[(0, 1)], y.component("cell").unwrap()[(0, 1)]);

    let shared_face_diag = face_mass(0, 4)[(1, 1)] + face_mass(1, 4)[(3, 3)];
    assert!((diag.component("face").unwrap()[(0, 1)] - shared_face_diag).abs() < 1e-14);
}

#[test]
fn blocks_outside_the_operator_schema_are_rejected() {
    let mesh = mesh(2, 2, false);
    let faces = Arc::new(
        UnknownSpace::try_new(&mesh, vec![ComponentSpec::new("face", EntityKind::Face, 1)]).unwrap(),
    );
    let mut operator = Operator::new("faces", faces.clone(), &Default::default()).unwrap();
    operator.push_op(Op::cell_cell("storage", &mesh, "cell", 1));
    let x = CompositeVector::new(faces.clone());
    let mut y = CompositeVector::new(faces);
    let err = operator.apply(&x, &mut y, 0.0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    assert_eq!(err.to_string(), "Schemas mismatch: cell[cell:1] != cell[face:1]");
    assert_eq!(operator.symbolic_assemble_matrix().unwrap_err().kind(), ErrorKind::SchemaMismatch);
}

#[test]
fn blocks_on_unknown_components_are_rejected() {
    let mesh = mesh(2, 2, false);
    let space = face_cell_space(&mesh);
    let mut operator = Operator::new("A", space.clone(), &Default::default()).unwrap();
    operator.push_op(Op::cell_cell("storage", &mesh, "temperature", 1));
    let x = CompositeVector::new(space.clone());
    let mut y = CompositeVector::new(space);
    let err = operator.apply(&x, &mut y, 0.0).unwrap_err();
    assert!(matches!(err, OperatorError::MissingComponent { .. }));
    assert_eq!(operator.assemble_matrix().unwrap_err().kind(), ErrorKind::Configuration);
}

#[test]
fn vectors_on_other_spaces_are_rejected() {
    let mesh = mesh(2, 2, false);
    let operator = diffusion_operator(&mesh, &Default::default());
    let faces = Arc::new(operator.row_space().subspace(&["face"]).unwrap());
    let x = CompositeVector::new(faces);
    let mut y = CompositeVector::new(operator.row_space().clone());
    assert_eq!(operator.apply(&x, &mut y, 0.0).unwrap_err().kind(), ErrorKind::Structural);
}

#[test]
fn find_matrix_op_uses_match_rules() {
    let mesh = mesh(2, 2, false);
    let operator = diffusion_operator(&mesh, &Default::default());
    let mixed = Schema::new(EntityKind::Cell)
        .with_item(EntityKind::Face, 1)
        .with_item(EntityKind::Cell, 1);
    let cells = Schema::init(EntityKind::Cell, EntityKind::Cell, 1);

    assert_eq!(operator.find_matrix_op(&mixed, &mixed, MatchRule::Exact, false).unwrap(), Some(0));
    assert_eq!(operator.find_matrix_op(&cells, &cells, MatchRule::Exact, false).unwrap(), Some(1));
    assert_eq!(operator.find_matrix_op(&cells, &cells, MatchRule::Superset, false).unwrap(), Some(0));
    let faces = Schema::init(EntityKind::Face, EntityKind::Face, 1);
    assert_eq!(operator.find_matrix_op(&faces, &faces, MatchRule::Subset, false).unwrap(), None);
    let err = operator.find_matrix_op(&faces, &faces, MatchRule::Exact, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn inverse_lifecycle_is_enforced() {
    let mesh = mesh(2, 2, false);
    let mut operator = diffusion_operator(&mesh, &Default::default());
    let space = operator.row_space().clone();
    let x = sample_vector(&space, 5);
    let mut y = CompositeVector::new(space.clone());

    assert_eq!(operator.inverse_state(), InverseState::Unconfigured);
    let err = operator.apply_inverse(&x, &mut y).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(matches!(err, OperatorError::MissingInverse { .. }));
    assert_eq!(operator.initialize_inverse().unwrap_err().kind(), ErrorKind::Configuration);
    assert_eq!(operator.compute_inverse().unwrap_err().kind(), ErrorKind::Configuration);

    operator
        .set_inverse_parameters(InverseParameters::default().with_method(InverseMethod::Cholesky))
        .unwrap();
    assert_eq!(operator.inverse_state(), InverseState::Configured);
    assert!(operator.apply_inverse(&x, &mut y).is_err());

    // Computing the inverse initializes the structure on its own
    operator.compute_inverse().unwrap();
    assert_eq!(operator.inverse_state(), InverseState::NumericReady);
    operator.apply_inverse(&x, &mut y).unwrap();

    // A x recovers the input
    let mut ay = CompositeVector::new(space.clone());
    operator.apply(&y, &mut ay, 0.0).unwrap();
    assert_matrix_eq!(owned_values(&ay), owned_values(&x), comp = abs, tol = 1e-10);

    // Changed values make the factorization stale until it is recomputed
    operator.rescale(2.0);
    assert_eq!(operator.inverse_state(), InverseState::StructureBuilt);
    assert_eq!(operator.apply_inverse(&x, &mut y).unwrap_err().kind(), ErrorKind::Configuration);
    operator.compute_inverse().unwrap();
    operator.apply_inverse(&x, &mut y).unwrap();

    // A new block invalidates the structure
    operator.push_op(accumulation_op(&mesh, 1.0));
    assert_eq!(operator.inverse_state(), InverseState::Configured);
    assert!(operator.matrix().is_none());
    operator.initialize_inverse().unwrap();
    assert_eq!(operator.inverse_state(), InverseState::StructureBuilt);
}

proptest! {
    #[test]
    fn every_inverse_method_solves_the_assembled_system(
        nx in 1usize..4,
        ny in 1usize..4,
        periodic in any::<bool>(),
        method in prop_oneof![Just(InverseMethod::Pcg), Just(InverseMethod::Cholesky), Just(InverseMethod::DenseLu)],
        seed in 0u64..100,
    ) {
        let mesh = mesh(nx, ny, periodic);
        let parameters = OperatorParameters {
            inverse: Some(InverseParameters { tolerance: 1e-12, ..InverseParameters::default().with_method(method) }),
            ..Default::default()
        };
        let mut operator = diffusion_operator(&mesh, &parameters);
        operator.compute_inverse().unwrap();

        let space = operator.row_space().clone();
        let x = sample_vector(&space, seed);
        let mut y = CompositeVector::new(space.clone());
        operator.apply_inverse(&x, &mut y).unwrap();
        let mut ay = CompositeVector::new(space.clone());
        operator.apply(&y, &mut ay, 0.0).unwrap();
        assert_matrix_eq!(owned_values(&ay), owned_values(&x), comp = abs, tol = 1e-8);
    }
}

#[test]
fn apply_assembled_matches_apply() {
    let mesh = mesh(3, 2, true);
    let mut operator = diffusion_operator(&mesh, &Default::default());
    let space = operator.row_space().clone();
    let x = sample_vector(&space, 8);
    let mut y = CompositeVector::new(space.clone());
    assert_eq!(operator.apply_assembled(&x, &mut y, 0.0).unwrap_err().kind(), ErrorKind::Configuration);

    operator.assemble_matrix().unwrap();
    operator.apply_assembled(&x, &mut y, 0.0).unwrap();
    let mut z = CompositeVector::new(space.clone());
    operator.apply(&x, &mut z, 0.0).unwrap();
    assert_matrix_eq!(owned_values(&y), owned_values(&z), comp = abs, tol = 1e-12);

    let mut sv = DVector::zeros(operator.row_dof_map().unwrap().num_global());
    operator.copy_to_super_vector(&x, &mut sv).unwrap();
    let mut w = CompositeVector::new(space.clone());
    operator.add_from_super_vector(&sv, &mut w).unwrap();
    assert_eq!(owned_values(&w), owned_values(&x));
}

#[test]
fn face_based_blocks_assemble_like_they_apply() {
    let mesh = mesh(3, 2, false);
    let specs = vec![
        ComponentSpec::new("cell", EntityKind::Cell, 1),
        ComponentSpec::new("bnd", EntityKind::BoundaryFace, 1),
    ];
    let space = Arc::new(UnknownSpace::try_new(&mesh, specs).unwrap());
    let mut operator = Operator::new("tpfa", space, &Default::default()).unwrap();

    let mut flux = Op::face_cell_bnd_face("flux", &mesh, "cell", "bnd");
    // Two-point fluxes between the cells of a face, or between a cell and its boundary face
    flux.fill_local_matrices(|f, mut a| {
        let t = 1.0 + f as f64;
        a.fill(-t);
        a.fill_diagonal(t);
        Ok(())
    })
    .unwrap();
    operator.push_op(flux);
    let mut cells = Op::face_cell("exchange", &mesh, "cell");
    cells.fill_local_matrices(|_, mut a| {
        a.fill_diagonal(0.5);
        Ok(())
    })
    .unwrap();
    operator.push_op(cells);

    operator.assemble_matrix().unwrap();
    let map = operator.row_dof_map().unwrap();
    let matrix_free = matrix_free_dense(&operator, map);
    assert_matrix_eq!(DMatrix::from(operator.matrix().unwrap()), matrix_free, comp = abs, tol = 1e-13);
}

#[test]
fn surface_blocks_assemble_like_they_apply() {
    let mesh = mesh(3, 1, false);
    let faces = Arc::new(
        UnknownSpace::try_new(&mesh, vec![ComponentSpec::new("face", EntityKind::Face, 1)]).unwrap(),
    );
    // The bottom faces form a line of three surface cells
    let bottom: Vec<usize> = (0..3).map(|i| mesh.cell_faces(i)[0]).collect();
    let surface = SurfaceEmbedding::try_new(&mesh, bottom, 3, vec![vec![0, 1], vec![1, 2]], 2).unwrap();

    let mut storage = Op::surface_cell_surface_cell("storage", &surface, "face");
    storage
        .fill_local_matrices(|s, mut d| {
            d.fill(1.0 + s as f64);
            Ok(())
        })
        .unwrap();
    let mut flux = Op::surface_face_surface_cell("flux", &surface, "face");
    flux.fill_local_matrices(|_, mut a| {
        a.copy_from(&nalgebra::dmatrix![1.0, -1.0; -1.0, 1.0]);
        Ok(())
    })
    .unwrap();

    let mut operator = Operator::new("surface", faces, &Default::default()).unwrap();
    operator.push_op(storage);
    operator.push_op(flux);
    operator.assemble_matrix().unwrap();

    let map = operator.row_dof_map().unwrap();
    let matrix_free = matrix_free_dense(&operator, map);
    let assembled = DMatrix::from(operator.matrix().unwrap());
    assert_matrix_eq!(assembled, matrix_free, comp = abs, tol = 1e-13);
    // Middle surface cell: storage 2, plus two unit fluxes
    let middle = mesh.cell_faces(1)[0];
    assert_eq!(assembled[(middle, middle)], 4.0);
    assert_eq!(operator.matrix().unwrap().nnz(), 3 + 4);
}

#[test]
fn statistics_count_applications() {
    let mesh = mesh(2, 2, false);
    let mut operator = diffusion_operator(&mesh, &dense_lu());
    let space = operator.row_space().clone();
    let x = sample_vector(&space, 1);
    let mut y = CompositeVector::new(space);
    operator.apply(&x, &mut y, 0.0).unwrap();
    operator.apply(&x, &mut y, 1.0).unwrap();
    operator.compute_inverse().unwrap();
    operator.apply_inverse(&x, &mut y).unwrap();

    let statistics = operator.statistics();
    assert_eq!(statistics.apply_calls, 2);
    assert_eq!(statistics.apply_inverse_calls, 1);
    operator.reset_statistics();
    assert_eq!(operator.statistics(), OperatorStatistics::default());
}

#[test]
fn write_matrix_exports_matrix_and_dof_table() {
    let mesh = mesh(2, 1, false);
    let mut operator = diffusion_operator(&mesh, &Default::default());
    let output_dir = Path::new("data/unit_tests/operator/write_matrix");
    fs::create_dir_all(output_dir).unwrap();
    let base = output_dir.join("diffusion");
    assert_eq!(operator.write_matrix(&base).unwrap_err().kind(), ErrorKind::Configuration);

    operator.assemble_matrix().unwrap();
    operator.write_matrix(&base).unwrap();

    let matrix = fs::read_to_string(output_dir.join("diffusion.dat")).unwrap();
    let mut lines = matrix.lines();
    assert_eq!(lines.next(), Some("%%MatrixMarket matrix coordinate real general"));
    let nnz = operator.matrix().unwrap().nnz();
    assert_eq!(lines.next(), Some(format!("9 9 {}", nnz).as_str()));
    assert_eq!(lines.count(), nnz);

    let table = fs::read_to_string(output_dir.join("diffusion_map.dat")).unwrap();
    let rows: Vec<&str> = table.lines().skip(1).collect();
    assert_eq!(rows.len(), 9);
    assert!(rows[0].starts_with("face:0 0 0 0 "));
    assert!(rows[8].starts_with("cell:0 1 1 8 "));
    let owned_cells = mesh.num_entities(EntityKind::Cell, ParallelType::Owned);
    assert_eq!(rows.iter().filter(|r| r.starts_with("cell:0")).count(), owned_cells);
}

#[test]
fn apply_assembled_requires_current_block_values() {
    let mesh = mesh(3, 2, true);
    let mut operator = diffusion_operator(&mesh, &Default::default());
    let space = operator.row_space().clone();
    let x = sample_vector(&space, 2);
    let mut y = CompositeVector::new(space.clone());
    operator.assemble_matrix().unwrap();
    operator.apply_assembled(&x, &mut y, 0.0).unwrap();

    // Edited through the shared handle, bypassing the operator
    operator.op(0).unwrap().write().rescale(3.0);
    assert_eq!(operator.apply_assembled(&x, &mut y, 0.0).unwrap_err().kind(), ErrorKind::Configuration);

    operator.assemble_matrix().unwrap();
    operator.apply_assembled(&x, &mut y, 0.0).unwrap();
    let mut z = CompositeVector::new(space);
    operator.apply(&x, &mut z, 0.0).unwrap();
    assert_matrix_eq!(owned_values(&y), owned_values(&z), comp = abs, tol = 1e-12);
}

#[test]
fn repeated_applications_refresh_ghost_values() {
    let mesh = mesh(3, 2, true);
    let operator = diffusion_operator(&mesh, &Default::default());
    let space = operator.row_space().clone();
    assert!(space.has_ghosts());
    let x = sample_vector(&space, 4);
    let mut first = CompositeVector::new(space.clone());
    operator.apply(&x, &mut first, 0.0).unwrap();

    let zero = CompositeVector::new(space.clone());
    let mut y = CompositeVector::new(space.clone());
    operator.apply(&zero, &mut y, 0.0).unwrap();
    assert_eq!(y.norm_inf(), 0.0);

    operator.apply(&x, &mut y, 0.0).unwrap();
    assert_eq!(owned_values(&y), owned_values(&first));
}
