//! Procedurally generated structured meshes.
use crate::entity::EntityKind;
use crate::mesh::{EntitySet, MeshParts, MeshPartition, PartitionedMesh};
use nalgebra::Point3;

/// Creates a structured mesh of `nx * ny` axis-aligned quadrilaterals covering
/// `[0, lx] x [0, ly]`, with every entity owned.
///
/// Cell `(i, j)` has index `i + nx * j` and faces ordered bottom, right, top, left.
/// Faces normal to the x-axis come first (`i + (nx + 1) * j`), followed by faces
/// normal to the y-axis.
pub fn create_rectangular_mesh(nx: usize, ny: usize, size: [f64; 2]) -> PartitionedMesh {
    build_rectangular(nx, ny, size, false)
}

/// Like [`create_rectangular_mesh`], but periodic in x.
///
/// The faces on the right edge are stored as ghosts of the faces on the left edge,
/// so every cell in the last column references ghost faces. Nodes are not identified
/// across the seam.
pub fn create_periodic_rectangular_mesh(nx: usize, ny: usize, size: [f64; 2]) -> PartitionedMesh {
    build_rectangular(nx, ny, size, true)
}

fn build_rectangular(nx: usize, ny: usize, size: [f64; 2], periodic_x: bool) -> PartitionedMesh {
    assert!(nx > 0 && ny > 0, "mesh must have at least one cell in each direction");
    let [lx, ly] = size;
    let hx = lx / nx as f64;
    let hy = ly / ny as f64;

    let num_x_faces_owned = if periodic_x { nx * ny } else { (nx + 1) * ny };
    let num_y_faces = nx * (ny + 1);
    let num_ghost_faces = if periodic_x { ny } else { 0 };

    // Local index of the x-face at column i (0..=nx), row j
    let x_face = |i: usize, j: usize| -> usize {
        if periodic_x {
            if i == nx {
                num_x_faces_owned + num_y_faces + j
            } else {
                i + nx * j
            }
        } else {
            i + (nx + 1) * j
        }
    };
    let y_face = |i: usize, j: usize| -> usize { num_x_faces_owned + i + nx * j };

    let num_faces_owned = num_x_faces_owned + num_y_faces;
    let num_faces_all = num_faces_owned + num_ghost_faces;
    let mut face_gids: Vec<usize> = (0..num_faces_owned).collect();
    face_gids.extend((0..num_ghost_faces).map(|j| x_face(0, j)));

    let mut face_centroids = vec![Point3::origin(); num_faces_all];
    for j in 0..ny {
        for i in 0..=nx {
            face_centroids[x_face(i, j)] = Point3::new(i as f64 * hx, (j as f64 + 0.5) * hy, 0.0);
        }
    }
    for j in 0..=ny {
        for i in 0..nx {
            face_centroids[y_face(i, j)] = Point3::new((i as f64 + 0.5) * hx, j as f64 * hy, 0.0);
        }
    }

    let num_cells = nx * ny;
    let mut cell_faces = Vec::with_capacity(num_cells);
    let mut cell_centroids = Vec::with_capacity(num_cells);
    for j in 0..ny {
        for i in 0..nx {
            cell_faces.push(vec![y_face(i, j), x_face(i + 1, j), y_face(i, j + 1), x_face(i, j)]);
            cell_centroids.push(Point3::new((i as f64 + 0.5) * hx, (j as f64 + 0.5) * hy, 0.0));
        }
    }

    let num_nodes = (nx + 1) * (ny + 1);
    let node_centroids = (0..num_nodes)
        .map(|n| Point3::new((n % (nx + 1)) as f64 * hx, (n / (nx + 1)) as f64 * hy, 0.0))
        .collect();

    let mut boundary_face_parents = Vec::new();
    if !periodic_x {
        for j in 0..ny {
            boundary_face_parents.push(x_face(0, j));
            boundary_face_parents.push(x_face(nx, j));
        }
    }
    for i in 0..nx {
        boundary_face_parents.push(y_face(i, 0));
        boundary_face_parents.push(y_face(i, ny));
    }
    boundary_face_parents.sort_unstable();
    let boundary_centroids = boundary_face_parents
        .iter()
        .map(|f| face_centroids[*f])
        .collect();

    let parts = MeshParts {
        dim: 2,
        cells: EntitySet::owned(num_cells).with_centroids(cell_centroids),
        faces: EntitySet {
            num_owned: num_faces_owned,
            num_global: num_faces_owned,
            global_ids: face_gids,
            centroids: face_centroids,
        },
        nodes: EntitySet::owned(num_nodes).with_centroids(node_centroids),
        edges: EntitySet::owned(0),
        boundary_faces: EntitySet::owned(boundary_face_parents.len()).with_centroids(boundary_centroids),
        cell_faces,
        boundary_face_parents,
    };

    // The generated connectivity is consistent by construction
    match PartitionedMesh::try_from_parts(parts) {
        Ok(mesh) => {
            debug_assert_eq!(mesh.num_global_entities(EntityKind::Cell), num_cells);
            mesh
        }
        Err(err) => unreachable!("procedural mesh is inconsistent: {}", err),
    }
}
