use criterion::{criterion_group, criterion_main, Criterion};
use kiln_core::{
    CompileOptions, DType, Graph, GraphBuilder, GraphCompiler, HostBuffer, OpRegistry, Scope,
    Target,
};

fn mlp(batch: usize, hidden: usize) -> Graph {
    let mut b = GraphBuilder::new("mlp");
    let x = b.input("x", &[batch, hidden], DType::F32);
    let w0 = b.input("w0", &[hidden, hidden], DType::F32);
    let w1 = b.input("w1", &[hidden, hidden], DType::F32);
    let h = b.matmul(x, w0).unwrap();
    let h = b.relu(h).unwrap();
    let y = b.matmul(h, w1).unwrap();
    let m = b.reduce_max(y, &[1], false).unwrap();
    let m = b.broadcast_to(m, &[batch, hidden], &[0]).unwrap();
    let d = b.sub(y, m).unwrap();
    let e = b.exp(d).unwrap();
    let s = b.reduce_sum(e, &[1], false).unwrap();
    b.output(s).unwrap();
    b.build()
}

fn bench_compile_mlp(c: &mut Criterion) {
    let registry = OpRegistry::with_builtins();
    let compiler = GraphCompiler::new(&registry, Target::host(), CompileOptions::default());
    c.bench_function("compile_mlp_64", |bencher| {
        bencher.iter(|| {
            let mut graph = mlp(16, 64);
            compiler.build(&mut graph).unwrap()
        });
    });
}

fn bench_compile_mlp_nvgpu(c: &mut Criterion) {
    let registry = OpRegistry::with_builtins();
    let compiler = GraphCompiler::new(&registry, Target::nvgpu(), CompileOptions::default());
    c.bench_function("compile_mlp_64_nvgpu", |bencher| {
        bencher.iter(|| {
            let mut graph = mlp(16, 64);
            compiler.build(&mut graph).unwrap()
        });
    });
}

fn bench_execute_mlp(c: &mut Criterion) {
    const BATCH: usize = 4;
    const HIDDEN: usize = 32;
    let registry = OpRegistry::with_builtins();
    let mut graph = mlp(BATCH, HIDDEN);
    let program = GraphCompiler::new(&registry, Target::host(), CompileOptions::default())
        .build(&mut graph)
        .unwrap();
    let fill = |shape: &[usize]| {
        let n: usize = shape.iter().product();
        HostBuffer::from_vec(DType::F32, shape, (0..n).map(|v| (v % 7) as f64 * 0.1).collect())
            .unwrap()
    };
    c.bench_function("execute_mlp_32", |bencher| {
        bencher.iter(|| {
            let mut scope = Scope::new();
            scope.set("x", fill(&[BATCH, HIDDEN]));
            scope.set("w0", fill(&[HIDDEN, HIDDEN]));
            scope.set("w1", fill(&[HIDDEN, HIDDEN]));
            program.execute(&mut scope).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_compile_mlp,
    bench_compile_mlp_nvgpu,
    bench_execute_mlp
);
criterion_main!(benches);
