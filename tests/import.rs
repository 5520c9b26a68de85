use diffgraph::import::{AttrValue, ExternalFormat, ExternalGraph, ExternalNode, ImportRegistry};
use diffgraph::ops::Op;
use diffgraph::runtime::CpuBackend;
use diffgraph::tensor::{DataFormat, Precision, TensorHandle, WeightFormat};
use diffgraph::{Graph, GraphError};
use std::collections::HashMap;

fn ints(values: &[i64]) -> AttrValue {
    AttrValue::Ints(values.to_vec())
}

fn text(value: &str) -> AttrValue {
    AttrValue::Str(value.to_string())
}

fn ramp(shape: &[usize], scale: f64) -> TensorHandle {
    let n: usize = shape.iter().product();
    let values = (0..n).map(|i| ((i * 37 % 17) as f64 - 8.0) * scale).collect();
    TensorHandle::from_shape_vec(shape, values, Precision::F64).unwrap()
}

fn conv_of(graph: &Graph) -> diffgraph::ops::Conv2dConfig {
    graph
        .operations()
        .find_map(|node| node.op().conv_config().cloned())
        .expect("graph holds a convolution")
}

#[test]
fn tensorflow_and_onnx_convolutions_agree() {
    let x_nchw = ramp(&[1, 2, 5, 5], 0.1);
    let w_oihw = ramp(&[3, 2, 3, 3], 0.05);
    let kernels = CpuBackend::new();

    let mut onnx_tensors = HashMap::new();
    onnx_tensors.insert("x".to_string(), x_nchw.clone());
    onnx_tensors.insert("w".to_string(), w_oihw.clone());
    let onnx_nodes = [ExternalNode::new("conv", "Conv", &["x", "w"])
        .with_attr("auto_pad", text("SAME_UPPER"))
        .with_attr("strides", ints(&[1, 1]))
        .with_outputs(&["y"])];
    let mut onnx = Graph::with_precision(Precision::F64);
    onnx.import_with(&ImportRegistry::default(), ExternalFormat::Onnx, &onnx_nodes, &onnx_tensors)
        .unwrap();

    let mut tf_tensors = HashMap::new();
    tf_tensors.insert("x".to_string(), x_nchw.permuted(&[0, 2, 3, 1]).unwrap());
    tf_tensors.insert("w".to_string(), w_oihw.permuted(&[2, 3, 1, 0]).unwrap());
    let tf_nodes = [ExternalNode::new("y", "Conv2D", &["x", "w"])
        .with_attr("strides", ints(&[1, 1, 1, 1]))
        .with_attr("padding", text("SAME"))];
    let mut tf = Graph::with_precision(Precision::F64);
    tf.import_with(&ImportRegistry::default(), ExternalFormat::TensorFlow, &tf_nodes, &tf_tensors)
        .unwrap();

    // weights were permuted into the canonical layout during import
    assert_eq!(tf.tensor("w").unwrap(), &w_oihw);
    let tf_cfg = conv_of(&tf);
    assert_eq!(tf_cfg.weight_format, WeightFormat::Oihw);
    assert_eq!(tf_cfg.data_format, DataFormat::Nhwc);
    assert_eq!((tf_cfg.kernel_h, tf_cfg.kernel_w), (3, 3));
    let onnx_cfg = conv_of(&onnx);
    assert_eq!((onnx_cfg.kernel_h, onnx_cfg.kernel_w), (3, 3));
    assert!(onnx_cfg.same_mode && tf_cfg.same_mode);

    let onnx_out = onnx.execute(&kernels).unwrap();
    let tf_out = tf.execute(&kernels).unwrap();
    assert_eq!(onnx_out["y"].shape(), &[1, 3, 5, 5]);
    assert_eq!(tf_out["y"].shape(), &[1, 5, 5, 3]);
    let tf_as_nchw = tf_out["y"].permuted(&[0, 3, 1, 2]).unwrap();
    for (a, b) in onnx_out["y"].to_vec().iter().zip(tf_as_nchw.to_vec().iter()) {
        assert!((a - b).abs() < 1e-12, "{} vs {}", a, b);
    }
}

#[test]
fn nchw_tensorflow_config_matches_onnx() {
    let w_oihw = ramp(&[2, 1, 2, 2], 0.5);
    let mut tf_tensors = HashMap::new();
    tf_tensors.insert("w".to_string(), w_oihw.permuted(&[2, 3, 1, 0]).unwrap());
    let mut onnx_tensors = HashMap::new();
    onnx_tensors.insert("w".to_string(), w_oihw);

    let mut tf = Graph::new();
    tf.import_with(
        &ImportRegistry::default(),
        ExternalFormat::TensorFlow,
        &[ExternalNode::new("y", "Conv2D", &["x", "w"])
            .with_attr("data_format", text("NCHW"))
            .with_attr("strides", ints(&[1, 1, 2, 1]))
            .with_attr("padding", text("VALID"))],
        &tf_tensors,
    )
    .unwrap();
    let mut onnx = Graph::new();
    onnx.import_with(
        &ImportRegistry::default(),
        ExternalFormat::Onnx,
        &[ExternalNode::new("y", "Conv", &["x", "w"]).with_attr("strides", ints(&[2, 1]))],
        &onnx_tensors,
    )
    .unwrap();

    assert_eq!(conv_of(&tf), conv_of(&onnx));
    assert!(!conv_of(&tf).materialized);
}

#[test]
fn unsupported_node_aborts_whole_import() {
    let mut g = Graph::new();
    g.add_variable("existing", None).unwrap();
    let nodes = [
        ExternalNode::new("a", "Relu", &["x"]),
        ExternalNode::new("b", "Sigmoid", &["a"]),
        ExternalNode::new("c", "FusedBatchNormV3", &["b"]),
    ];
    let err = g.import_from_external(ExternalFormat::TensorFlow, &nodes).unwrap_err();
    match err {
        GraphError::UnsupportedOperation { op, .. } => assert!(op.contains("FusedBatchNormV3")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(g.variable_count(), 1);
    assert_eq!(g.operation_count(), 0);
    assert!(!g.contains("a"));
}

#[test]
fn missing_required_attribute_names_it() {
    let mut g = Graph::new();
    let node = ExternalNode::new("conv", "Conv2D", &["x", "w"]).with_attr("padding", text("SAME"));
    let err = g.import_from_external(ExternalFormat::TensorFlow, &[node]).unwrap_err();
    assert_eq!(
        err,
        GraphError::MissingAttribute {
            op: "conv (Conv2D)".to_string(),
            attribute: "strides".to_string(),
        }
    );
}

#[test]
fn leaky_relu_default_slope_depends_on_format() {
    let input = TensorHandle::from_shape_vec(&[2], vec![-1.0, 2.0], Precision::F64).unwrap();
    let mut tensors = HashMap::new();
    tensors.insert("x".to_string(), input);

    let mut outputs = Vec::new();
    for format in [ExternalFormat::TensorFlow, ExternalFormat::Onnx] {
        let mut g = Graph::with_precision(Precision::F64);
        g.import_with(
            &ImportRegistry::default(),
            format,
            &[ExternalNode::new("y", "LeakyRelu", &["x"])],
            &tensors,
        )
        .unwrap();
        outputs.push(g.execute(&CpuBackend::new()).unwrap()["y"].to_vec());
    }
    assert_eq!(outputs[0], vec![-0.2, 2.0]);
    assert_eq!(outputs[1], vec![-0.01, 2.0]);
}

#[test]
fn imported_graph_is_differentiable() {
    let doc = r#"{
        "nodes": [
            {"name": "mm", "op_type": "MatMul", "inputs": ["x", "w"], "outputs": ["h"]},
            {"name": "act", "op_type": "Tanh", "inputs": ["h"], "outputs": ["y"]}
        ],
        "tensors": {
            "x": {"shape": [1, 2], "data": [0.5, -1.0]},
            "w": {"shape": [2, 2], "data": [1.0, 2.0, 3.0, 4.0]}
        }
    }"#;
    let external: ExternalGraph = serde_json::from_str(doc).unwrap();
    let mut g = Graph::with_precision(Precision::F64);
    let tensors = external.tensor_handles(g.precision()).unwrap();
    g.import_with(&ImportRegistry::default(), ExternalFormat::Onnx, &external.nodes, &tensors)
        .unwrap();

    let kernels = CpuBackend::new();
    g.execute(&kernels).unwrap();
    let y = g.id_of("y").unwrap();
    g.exec_backward(&kernels, y, TensorHandle::ones(&[1, 2], Precision::F64))
        .unwrap();

    // h = [-2.5, -3.0]; dL/dx = (1 - tanh(h)^2) @ w^T
    let slope: Vec<f64> = [-2.5f64, -3.0].iter().map(|h| 1.0 - h.tanh().powi(2)).collect();
    let expected = [slope[0] + 2.0 * slope[1], 3.0 * slope[0] + 4.0 * slope[1]];
    let grad = g.gradient("x").unwrap().to_vec();
    for (a, b) in grad.iter().zip(expected.iter()) {
        assert!((a - b).abs() < 1e-12);
    }
    assert_eq!(g.gradient("w").unwrap().shape(), &[2, 2]);
}

#[test]
fn import_extends_an_existing_graph() {
    let mut g = Graph::with_precision(Precision::F64);
    let x = g
        .add_variable("x", Some(TensorHandle::scalar(4.0, Precision::F64)))
        .unwrap();
    g.unary(Op::Sqrt, Some("root"), x).unwrap();
    g.import_from_external(
        ExternalFormat::TensorFlow,
        &[ExternalNode::new("out", "Mul", &["root", "x"])],
    )
    .unwrap();
    assert_eq!(g.execute(&CpuBackend::new()).unwrap()["out"].to_vec(), vec![8.0]);
}

#[test]
fn registry_lists_and_extends_mappings() {
    let mut registry = ImportRegistry::default();
    assert!(registry.op_types(ExternalFormat::TensorFlow).contains(&"Conv2D"));
    assert!(registry.lookup(ExternalFormat::Onnx, "Square").is_none());

    registry.register(
        ExternalFormat::Onnx,
        "HardTanh",
        diffgraph::ops::OpKind::HardTanh,
        diffgraph::import::plain,
    );
    let mut g = Graph::with_precision(Precision::F64);
    let mut tensors = HashMap::new();
    tensors.insert(
        "x".to_string(),
        TensorHandle::from_shape_vec(&[3], vec![-3.0, 0.5, 2.0], Precision::F64).unwrap(),
    );
    g.import_with(&registry, ExternalFormat::Onnx, &[ExternalNode::new("y", "HardTanh", &["x"])], &tensors)
        .unwrap();
    assert_eq!(g.execute(&CpuBackend::new()).unwrap()["y"].to_vec(), vec![-1.0, 0.5, 1.0]);
}

#[test]
fn later_import_reuses_canonical_weights() {
    let x = ramp(&[1, 4, 4, 2], 0.1);
    let w_oihw = ramp(&[3, 2, 2, 2], 0.05);
    let mut tensors = HashMap::new();
    tensors.insert("x".to_string(), x);
    tensors.insert("w".to_string(), w_oihw.permuted(&[2, 3, 1, 0]).unwrap());
    let conv = |name: &str| {
        ExternalNode::new(name, "Conv2D", &["x", "w"])
            .with_attr("strides", ints(&[1, 1, 1, 1]))
            .with_attr("padding", text("VALID"))
    };

    let mut g = Graph::with_precision(Precision::F64);
    g.import_with(&ImportRegistry::default(), ExternalFormat::TensorFlow, &[conv("y1")], &tensors)
        .unwrap();
    let kernels = CpuBackend::new();
    let first = g.execute(&kernels).unwrap();

    g.import_with(&ImportRegistry::default(), ExternalFormat::TensorFlow, &[conv("y2")], &tensors)
        .unwrap();
    let second = g.execute(&kernels).unwrap();
    assert_eq!(g.tensor("w").unwrap(), &w_oihw);
    assert_eq!(second["y1"], first["y1"]);
    assert_eq!(second["y2"], first["y1"]);
}

#[test]
fn oversized_dilation_is_invalid() {
    let mut g = Graph::new();
    let node = ExternalNode::new("c", "Conv", &["x", "w"])
        .with_attr("kernel_shape", ints(&[3, 3]))
        .with_attr("dilations", ints(&[i64::MAX, 1]));
    let err = g.import_from_external(ExternalFormat::Onnx, &[node]).unwrap_err();
    assert!(matches!(err, GraphError::InvalidAttribute { ref attribute, .. } if attribute == "dilations"));
    assert_eq!(g.variable_count(), 0);

    // kernel size only known once the weights are seen
    let mut tensors = HashMap::new();
    tensors.insert("w".to_string(), ramp(&[1, 1, 2, 2], 1.0));
    let node = ExternalNode::new("c", "Conv", &["x", "w"]).with_attr("dilations", ints(&[1, i64::MAX]));
    let mut g = Graph::new();
    let err = g
        .import_with(&ImportRegistry::default(), ExternalFormat::Onnx, &[node], &tensors)
        .unwrap_err();
    assert!(matches!(err, GraphError::InvalidAttribute { ref attribute, .. } if attribute == "dilations"));

    let mut g = Graph::new();
    let x = g.add_variable("x", Some(ramp(&[1, 1, 3, 3], 1.0))).unwrap();
    let w = g.add_variable("w", Some(ramp(&[1, 1, 2, 2], 1.0))).unwrap();
    let cfg = diffgraph::ops::Conv2dConfig::default().with_dilation((usize::MAX, 1));
    g.apply(Op::Conv2d(cfg), Some("y"), &[x, w]).unwrap();
    let err = g.execute(&CpuBackend::new()).unwrap_err();
    assert!(matches!(err, GraphError::InvalidAttribute { ref attribute, .. } if attribute == "dilations"));
}
