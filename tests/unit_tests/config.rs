use crate::face_cell_space;
use mfd_operators::config::{InverseMethod, InverseParameters, OperatorParameters, PreconditionerKind};
use mfd_operators::mesh::procedural::create_rectangular_mesh;
use mfd_operators::operator::{InverseState, Operator};
use mfd_operators::ErrorKind;

#[test]
fn empty_json_gives_defaults() {
    let parameters: OperatorParameters = serde_json::from_str("{}").unwrap();
    assert_eq!(parameters, OperatorParameters::default());
    assert_eq!(parameters.diagonal_shift, 0.0);
    assert!(parameters.inverse.is_none());
}

#[test]
fn partial_inverse_json_fills_in_defaults() {
    let json = r#"{ "diagonal_shift": 0.5, "inverse": { "method": "cholesky" } }"#;
    let parameters: OperatorParameters = serde_json::from_str(json).unwrap();
    assert_eq!(parameters.diagonal_shift, 0.5);
    let inverse = parameters.inverse.unwrap();
    assert_eq!(inverse.method, InverseMethod::Cholesky);
    assert_eq!(inverse.preconditioner, PreconditionerKind::Jacobi);
    assert_eq!(inverse.tolerance, 1e-10);
    assert_eq!(inverse.max_iterations, None);
}

#[test]
fn unknown_method_is_rejected() {
    let json = r#"{ "inverse": { "method": "multigrid" } }"#;
    assert!(serde_json::from_str::<OperatorParameters>(json).is_err());
}

#[test]
fn inverse_parameters_at_construction_configure_the_operator() {
    let mesh = create_rectangular_mesh(2, 2, [1.0, 1.0]);
    let parameters = OperatorParameters {
        inverse: Some(InverseParameters::default().with_method(InverseMethod::DenseLu)),
        ..Default::default()
    };
    let operator = Operator::new("A", face_cell_space(&mesh), &parameters).unwrap();
    assert_eq!(operator.inverse_state(), InverseState::Configured);
    assert_eq!(operator.inverse_parameters().unwrap().method, InverseMethod::DenseLu);
}

#[test]
fn invalid_parameters_are_configuration_errors() {
    let mesh = create_rectangular_mesh(2, 2, [1.0, 1.0]);
    let space = face_cell_space(&mesh);

    let shift = OperatorParameters {
        diagonal_shift: f64::NAN,
        ..Default::default()
    };
    let err = Operator::new("A", space.clone(), &shift).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let tolerance = OperatorParameters {
        inverse: Some(InverseParameters {
            tolerance: 0.0,
            ..Default::default()
        }),
        ..Default::default()
    };
    let err = Operator::new("A", space, &tolerance).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
