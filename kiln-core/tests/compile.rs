use kiln_core::{
    graph::Attrs, CompileOptions, DType, Error, Graph, GraphBuilder, GraphCompiler, HostBuffer,
    OpRegistry, Program, Scope, Target,
};

fn compile(graph: &mut Graph) -> kiln_core::Result<Program> {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = OpRegistry::with_builtins();
    GraphCompiler::new(&registry, Target::host(), CompileOptions::default()).build(graph)
}

fn assert_close(got: &[f64], want: &[f64]) {
    assert_eq!(got.len(), want.len());
    for (a, b) in got.iter().zip(want) {
        assert!((a - b).abs() <= 1e-5 * b.abs().max(1.0), "{got:?} != {want:?}");
    }
}

#[test]
fn softmax_denominator_runs_end_to_end() {
    let mut b = GraphBuilder::new("softmax");
    let x = b.input("x", &[2, 3], DType::F32);
    let m = b.reduce_max(x, &[1], false).unwrap();
    let bm = b.broadcast_to(m, &[2, 3], &[0]).unwrap();
    let d = b.sub(x, bm).unwrap();
    let e = b.exp(d).unwrap();
    let s = b.reduce_sum(e, &[1], false).unwrap();
    b.output(s).unwrap();
    let mut graph = b.build();
    let out = graph.data(s).unwrap().name.clone();
    let program = compile(&mut graph).unwrap();

    let mut scope = Scope::new();
    scope.set(
        "x",
        HostBuffer::from_vec(DType::F32, &[2, 3], vec![1., 2., 3., 4., 5., 6.]).unwrap(),
    );
    program.execute(&mut scope).unwrap();

    let denom = (-2f64).exp() + (-1f64).exp() + 1.0;
    assert_close(&scope.get(&out).unwrap().borrow().data, &[denom, denom]);
    for name in &program.internal {
        assert!(!scope.contains(name), "`{name}` leaked into the scope");
    }
}

#[test]
fn keep_dim_reduction_over_two_axes() {
    let mut b = GraphBuilder::new("sum_hw");
    let x = b.input("x", &[2, 3, 4], DType::F32);
    let s = b.reduce_sum(x, &[1, 2], true).unwrap();
    b.output(s).unwrap();
    let mut graph = b.build();
    let out = graph.data(s).unwrap().name.clone();
    let program = compile(&mut graph).unwrap();

    let mut scope = Scope::new();
    scope.set(
        "x",
        HostBuffer::from_vec(DType::F32, &[2, 3, 4], (0..24).map(|v| v as f64).collect()).unwrap(),
    );
    program.execute(&mut scope).unwrap();
    let result = scope.get(&out).unwrap();
    assert_eq!(result.borrow().shape, vec![2, 1, 1]);
    assert_close(&result.borrow().data, &[66.0, 210.0]);
}

#[test]
fn matmul_with_epilogue_runs_end_to_end() {
    let mut b = GraphBuilder::new("linear");
    let a = b.input("A", &[2, 3], DType::F32);
    let w = b.input("W", &[3, 2], DType::F32);
    let c = b.matmul(a, w).unwrap();
    let r = b.relu(c).unwrap();
    b.output(r).unwrap();
    let mut graph = b.build();
    let out = graph.data(r).unwrap().name.clone();
    let program = compile(&mut graph).unwrap();

    let mut scope = Scope::new();
    scope.set(
        "A",
        HostBuffer::from_vec(DType::F32, &[2, 3], vec![1., 2., 3., -1., -2., -3.]).unwrap(),
    );
    scope.set(
        "W",
        HostBuffer::from_vec(DType::F32, &[3, 2], vec![1., 0., 0., 1., 1., 1.]).unwrap(),
    );
    program.execute(&mut scope).unwrap();
    // rows: [4, 5] and [-4, -5] before relu
    assert_close(&scope.get(&out).unwrap().borrow().data, &[4., 5., 0., 0.]);
}

#[test]
fn opaque_operator_gets_its_own_function() {
    let mut b = GraphBuilder::new("prefix");
    let x = b.input("x", &[2, 4], DType::F32);
    let r = b.relu(x).unwrap();
    let c = b.cumsum(r, 1).unwrap();
    b.output(c).unwrap();
    let mut graph = b.build();
    let out = graph.data(c).unwrap().name.clone();
    let program = compile(&mut graph).unwrap();
    assert_eq!(program.instructions.len(), 2);

    let mut scope = Scope::new();
    scope.set(
        "x",
        HostBuffer::from_vec(DType::F32, &[2, 4], vec![1., -1., 2., 3., -5., 1., 1., 1.]).unwrap(),
    );
    program.execute(&mut scope).unwrap();
    assert_close(
        &scope.get(&out).unwrap().borrow().data,
        &[1., 1., 3., 6., 0., 1., 2., 3.],
    );
}

#[test]
fn unregistered_operator_fails_lowering() {
    let mut b = GraphBuilder::new("custom");
    let x = b.input("x", &[4], DType::F32);
    let y = b.op("softplus", &[x], Attrs::new(), &[vec![4]]).unwrap();
    b.output(y[0]).unwrap();
    let err = compile(&mut b.build()).unwrap_err();
    match err.root() {
        Error::Lowering { node, source, .. } => {
            assert_eq!(node, "softplus_0");
            assert!(matches!(source.root(), Error::UnregisteredOp(op) if op == "softplus"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn missing_input_is_a_runtime_error() {
    let mut b = GraphBuilder::new("relu");
    let x = b.input("x", &[4], DType::F32);
    let r = b.relu(x).unwrap();
    b.output(r).unwrap();
    let program = compile(&mut b.build()).unwrap();
    assert!(matches!(
        program.execute(&mut Scope::new()),
        Err(Error::Runtime(_))
    ));
}
