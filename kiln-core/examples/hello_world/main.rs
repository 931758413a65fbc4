use kiln_core::{
    codegen::{CodeGenC, OutputKind},
    CompileOptions, DType, GraphBuilder, GraphCompiler, HostBuffer, OpRegistry, Scope, Target,
};

fn main() -> kiln_core::Result<()> {
    env_logger::init();

    let mut b = GraphBuilder::new("hello");
    let x = b.input("x", &[3, 4], DType::F32);
    let y = b.input("y", &[3, 4], DType::F32);
    let s = b.add(x, y)?;
    let r = b.relu(s)?;
    let t = b.reduce_sum(r, &[1], false)?;
    b.output(t)?;
    let mut graph = b.build();
    let out = graph.data(t).map(|d| d.name.clone()).unwrap_or_default();

    let registry = OpRegistry::with_builtins();
    let program =
        GraphCompiler::new(&registry, Target::host(), CompileOptions::default()).build(&mut graph)?;
    println!("{}", CodeGenC::default().compile(&program.module, OutputKind::Header)?);
    println!("{}", program.source);

    let mut scope = Scope::new();
    scope.set("x", HostBuffer::from_vec(DType::F32, &[3, 4], vec![1.0; 12])?);
    scope.set("y", HostBuffer::from_vec(DType::F32, &[3, 4], vec![-0.5; 12])?);
    program.execute(&mut scope)?;
    if let Some(buf) = scope.get(&out) {
        dbg!(&buf.borrow().data);
    }
    Ok(())
}
