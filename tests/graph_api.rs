use diffgraph::autograd::GRAD_FUNCTION;
use diffgraph::ops::{Activation, Conv2dConfig, Op};
use diffgraph::runtime::CpuBackend;
use diffgraph::tensor::{Precision, TensorHandle};
use diffgraph::{Graph, GraphError};
use std::collections::HashMap;

fn vector(values: &[f64]) -> TensorHandle {
    TensorHandle::from_shape_vec(&[1, values.len()], values.to_vec(), Precision::F64).unwrap()
}

#[test]
fn sigmoid_forward_matches_reference() {
    let data = [-1.5, 0.0, 0.25, 3.0];
    let mut g = Graph::with_precision(Precision::F64);
    let input = g.add_variable("in", Some(vector(&data))).unwrap();
    let out = g.unary(Op::Sigmoid, Some("out"), input).unwrap();
    let result = g.execute(&CpuBackend::new()).unwrap();

    let expected: Vec<f64> = data.iter().map(|x| 1.0 / (1.0 + (-x).exp())).collect();
    assert_eq!(result["out"].to_vec(), expected);
    assert_eq!(g.variable(out).unwrap().tensor().unwrap().shape(), &[1, 4]);
}

#[test]
fn backward_ones_seed_gives_sigmoid_slope() {
    let data = [-1.5, 0.0, 0.25, 3.0];
    let mut g = Graph::with_precision(Precision::F64);
    let input = g.add_variable("in", Some(vector(&data))).unwrap();
    let out = g.unary(Op::Sigmoid, None, input).unwrap();
    let kernels = CpuBackend::new();
    g.execute(&kernels).unwrap();
    let result = g
        .exec_backward(&kernels, out, TensorHandle::ones(&[1, 4], Precision::F64))
        .unwrap();

    assert!(g.function(GRAD_FUNCTION).unwrap().contains("in-grad"));
    for (&x, &grad) in data.iter().zip(result["in-grad"].to_vec().iter()) {
        let s = 1.0 / (1.0 + (-x).exp());
        assert!((grad - s * (1.0 - s)).abs() < 1e-12);
    }
}

#[test]
fn backward_before_forward_is_unresolved() {
    let mut g = Graph::new();
    let input = g.add_variable("in", Some(TensorHandle::ones(&[1, 4], Precision::F32))).unwrap();
    let out = g.unary(Op::Tanh, Some("out"), input).unwrap();
    let err = g
        .build_backward(out, TensorHandle::ones(&[1, 4], Precision::F32))
        .unwrap_err();
    assert!(matches!(err, GraphError::UnresolvedInput { ref variable, .. } if variable == "out"));
    assert!(g.function(GRAD_FUNCTION).is_none());
}

#[test]
fn rebuilding_backward_replaces_gradient_graph() {
    let mut g = Graph::with_precision(Precision::F64);
    let x = g.add_variable("x", Some(TensorHandle::scalar(3.0, Precision::F64))).unwrap();
    let y = g.unary(Op::Square, Some("y"), x).unwrap();
    let kernels = CpuBackend::new();
    g.execute(&kernels).unwrap();

    g.exec_backward(&kernels, y, TensorHandle::scalar(1.0, Precision::F64)).unwrap();
    assert_eq!(g.gradient("x").unwrap().to_vec(), vec![6.0]);
    let first_size = g.function(GRAD_FUNCTION).unwrap().variable_count();

    g.exec_backward(&kernels, y, TensorHandle::scalar(0.5, Precision::F64)).unwrap();
    assert_eq!(g.gradient("x").unwrap().to_vec(), vec![3.0]);
    assert_eq!(g.function(GRAD_FUNCTION).unwrap().variable_count(), first_size);
}

#[test]
fn external_gradient_shape_is_checked() {
    let mut g = Graph::with_precision(Precision::F64);
    let x = g.add_variable("x", Some(TensorHandle::ones(&[2, 2], Precision::F64))).unwrap();
    let y = g.unary(Op::Exp, Some("y"), x).unwrap();
    g.execute(&CpuBackend::new()).unwrap();
    let err = g
        .build_backward(y, TensorHandle::ones(&[4], Precision::F64))
        .unwrap_err();
    assert!(matches!(err, GraphError::GradientShape { ref variable, .. } if variable == "y"));
}

#[test]
fn construction_errors_leave_graph_untouched() {
    let mut g = Graph::new();
    let a = g.add_variable("a", None).unwrap();
    let b = g.add_variable("b", None).unwrap();
    let c = g.binary(Op::Add, Some("c"), a, b).unwrap();
    let before = (g.variable_count(), g.operation_count());

    assert_eq!(g.add_variable("a", None), Err(GraphError::DuplicateName("a".to_string())));
    assert!(matches!(g.apply(Op::Add, None, &[a]), Err(GraphError::Arity { .. })));
    assert!(matches!(g.unary(Op::Exp, Some("c"), a), Err(GraphError::DuplicateName(_))));
    // c = a + b, then a = exp(c) closes a loop
    assert!(matches!(g.add_operation(Op::Exp, &[c], &[a]), Err(GraphError::Cycle { .. })));
    assert!(matches!(
        g.add_operation(Op::Negate, &[a], &[c]),
        Err(GraphError::ProducerConflict { .. })
    ));
    assert!(matches!(
        g.unary(Op::Pow { exponent: f64::INFINITY }, None, a),
        Err(GraphError::InvalidAttribute { .. })
    ));

    assert_eq!((g.variable_count(), g.operation_count()), before);
    assert!(g.contains("c"));
}

#[test]
fn unbound_leaf_names_its_consumer() {
    let mut g = Graph::new();
    let a = g.add_variable("a", Some(TensorHandle::ones(&[2], Precision::F32))).unwrap();
    let b = g.add_variable("b", None).unwrap();
    g.binary(Op::Multiply, Some("c"), a, b).unwrap();
    let err = g.execute(&CpuBackend::new()).unwrap_err();
    match err {
        GraphError::UnresolvedInput { variable, needed_by } => {
            assert_eq!(variable, "b");
            assert!(needed_by.starts_with("multiply"), "{}", needed_by);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(g.tensor("c").is_none());
}

#[test]
fn explicit_operation_with_existing_outputs() {
    let mut g = Graph::with_precision(Precision::F64);
    let x = g.add_variable("x", Some(vector(&[1.0, 2.0]))).unwrap();
    let w = g.add_variable("w", Some(vector(&[3.0, 4.0]))).unwrap();
    let y = g.add_variable("y", None).unwrap();
    // consumer registered before its producer
    let z = g.unary(Op::Negate, Some("z"), y).unwrap();
    g.add_operation(Op::Multiply, &[x, w], &[y]).unwrap();

    let order = g.topological_order().unwrap();
    assert_eq!(order.len(), 2);
    assert_eq!(g.operation(order[0]).unwrap().op(), &Op::Multiply);
    g.execute(&CpuBackend::new()).unwrap();
    assert_eq!(g.variable(z).unwrap().tensor().unwrap().to_vec(), vec![-3.0, -8.0]);
}

#[test]
fn repeated_execution_is_deterministic() {
    let build = || {
        let mut g = Graph::with_precision(Precision::F64);
        let x = g.add_variable("x", Some(vector(&[0.3, -0.7, 1.1]))).unwrap();
        let s = g.unary(Op::Softmax, None, x).unwrap();
        let t = g.unary(Op::Tanh, None, x).unwrap();
        let y = g.binary(Op::Multiply, Some("y"), s, t).unwrap();
        g.unary(Op::Sum, Some("total"), y).unwrap();
        g
    };
    let kernels = CpuBackend::new();
    let mut first = build();
    let mut second = build();
    let a = first.execute(&kernels).unwrap();
    let b = second.execute(&kernels).unwrap();
    assert_eq!(a, b);
    assert_eq!(first.execute(&kernels).unwrap(), a);
    assert_eq!(first.topological_order().unwrap(), second.topological_order().unwrap());
}

#[test]
fn anonymous_outputs_get_variant_names() {
    let mut g = Graph::new();
    let x = g.add_variable("x", None).unwrap();
    let a = g.unary(Op::Exp, None, x).unwrap();
    let b = g.unary(Op::Exp, None, x).unwrap();
    let a_name = g.variable(a).unwrap().name().to_string();
    let b_name = g.variable(b).unwrap().name().to_string();
    assert_ne!(a_name, b_name);
    assert!(a_name.starts_with("exp_"));
}

#[test]
fn activation_factory_by_name() {
    let mut g = Graph::with_precision(Precision::F64);
    let x = g.add_variable("x", Some(vector(&[-2.0, 0.5]))).unwrap();

    let relu: Activation = "ReLU".parse().unwrap();
    let leaky: Activation = "leaky_relu".parse().unwrap();
    let same = Activation::Identity.apply(&mut g, Some("unused"), x).unwrap();
    assert_eq!(same, x);
    assert!(!g.contains("unused"));

    relu.apply(&mut g, Some("r"), x).unwrap();
    leaky.apply(&mut g, Some("l"), x).unwrap();
    let out = g.execute(&CpuBackend::new()).unwrap();
    assert_eq!(out["r"].to_vec(), vec![0.0, 0.5]);
    assert_eq!(out["l"].to_vec(), vec![-0.02, 0.5]);

    assert_eq!("Swish".parse::<Activation>().unwrap(), Activation::Swish);
    assert!("no-such-thing".parse::<Activation>().is_err());
}

#[test]
fn unsupported_activations_fail_at_construction() {
    let mut g = Graph::new();
    let x = g.add_variable("x", None).unwrap();
    let unsupported: Vec<Activation> = Activation::ALL
        .iter()
        .copied()
        .filter(|a| a.op().is_err())
        .collect();
    assert!(!unsupported.is_empty());
    for activation in unsupported {
        let err = activation.apply(&mut g, None, x).unwrap_err();
        assert!(matches!(err, GraphError::UnsupportedOperation { .. }));
    }
    assert_eq!(g.operation_count(), 0);
}

#[test]
fn f32_graph_rounds_every_result() {
    let mut g = Graph::new();
    let x = g.add_variable("x", Some(TensorHandle::scalar(0.1, Precision::F64))).unwrap();
    let y = g.unary(Op::Scale { factor: 3.0 }, Some("y"), x).unwrap();
    g.execute(&CpuBackend::new()).unwrap();
    let value = g.variable(y).unwrap().tensor().unwrap().to_vec()[0];
    assert_eq!(value, ((0.1f32 as f64) * 3.0) as f32 as f64);
    assert_eq!(g.variable(y).unwrap().tensor().unwrap().precision(), Precision::F32);
}

#[test]
fn conv_weights_bound_through_placeholders() {
    let mut g = Graph::with_precision(Precision::F64);
    let x = g
        .add_variable("x", Some(TensorHandle::ones(&[1, 1, 3, 3], Precision::F64)))
        .unwrap();
    let w = g.add_variable("w", None).unwrap();
    let cfg = Conv2dConfig::default();
    g.apply(Op::Conv2d(cfg), Some("y"), &[x, w]).unwrap();

    let mut placeholders = HashMap::new();
    placeholders.insert(
        "w".to_string(),
        TensorHandle::from_shape_vec(&[1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0], Precision::F64).unwrap(),
    );
    let out = g.execute_with(&CpuBackend::new(), &placeholders).unwrap();
    assert_eq!(out["y"].shape(), &[1, 1, 2, 2]);
    assert_eq!(out["y"].to_vec(), vec![10.0; 4]);

    let conv = g.operations().find(|n| matches!(n.op(), Op::Conv2d(_))).unwrap();
    let cfg = conv.op().conv_config().unwrap();
    assert!(cfg.materialized);
    assert_eq!((cfg.kernel_h, cfg.kernel_w), (2, 2));

    // materialization runs once; the bound weights are kept afterwards
    let again = g.execute(&CpuBackend::new()).unwrap();
    assert_eq!(again["y"], out["y"]);
}

#[test]
fn conv_without_weights_is_missing_array() {
    let mut g = Graph::new();
    let x = g.add_variable("x", Some(TensorHandle::ones(&[1, 1, 3, 3], Precision::F32))).unwrap();
    let w = g.add_variable("w", None).unwrap();
    g.apply(Op::Conv2d(Conv2dConfig::new((2, 2))), Some("y"), &[x, w]).unwrap();
    assert_eq!(
        g.execute(&CpuBackend::new()).unwrap_err(),
        GraphError::MissingArray("w".to_string())
    );
}

#[test]
fn independent_graphs_execute_on_separate_threads() {
    let handles: Vec<_> = (0..4)
        .map(|i| {
            std::thread::spawn(move || {
                let mut g = Graph::with_precision(Precision::F64);
                let x = g
                    .add_variable("x", Some(TensorHandle::scalar(i as f64, Precision::F64)))
                    .unwrap();
                let sq = g.binary(Op::Multiply, None, x, x).unwrap();
                let y = g.binary(Op::Add, Some("y"), x, sq).unwrap();
                let kernels = CpuBackend::new();
                g.execute(&kernels).unwrap();
                g.exec_backward(&kernels, y, TensorHandle::scalar(1.0, Precision::F64))
                    .unwrap();
                g.gradient("x").unwrap().to_vec()[0]
            })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), 1.0 + 2.0 * i as f64);
    }
}
