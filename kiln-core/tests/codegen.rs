use kiln_core::{
    codegen::{CodeGenC, OutputKind},
    CompileOptions, DType, Graph, GraphBuilder, GraphCompiler, OpRegistry, Program, Target,
};

fn compile(graph: &mut Graph, fuse_multiply_add: bool) -> Program {
    let registry = OpRegistry::with_builtins();
    let options = CompileOptions {
        fuse_multiply_add,
        ..CompileOptions::default()
    };
    GraphCompiler::new(&registry, Target::host(), options)
        .build(graph)
        .unwrap()
}

#[test]
fn add_is_one_loop_pair() {
    let mut b = GraphBuilder::new("add");
    let x = b.input("A", &[100, 20], DType::F32);
    let y = b.input("B", &[100, 20], DType::F32);
    let c = b.add(x, y).unwrap();
    b.output(c).unwrap();
    let program = compile(&mut b.build(), true);

    let src = &program.source;
    assert_eq!(src.matches("for (").count(), 2);
    assert!(src.contains("for (int32_t i = 0; i < 100; i += 1) {"));
    assert!(src.contains("for (int32_t j = 0; j < 20; j += 1) {"));
    assert!(src.contains("var_0[((20 * i) + j)] = (A[((20 * i) + j)] + B[((20 * i) + j)]);"));
    assert!(!src.contains("kiln_buffer_malloc"));
    assert_eq!(program.instructions.len(), 1);
    assert_eq!(program.instructions[0].inputs, vec!["A", "B"]);
    assert_eq!(program.instructions[0].outputs, vec!["var_0"]);
}

#[test]
fn matmul_initializes_then_accumulates() {
    let mut b = GraphBuilder::new("matmul");
    let x = b.input("A", &[100, 20], DType::F32);
    let y = b.input("B", &[20, 50], DType::F32);
    let c = b.matmul(x, y).unwrap();
    b.output(c).unwrap();
    let program = compile(&mut b.build(), false);

    let src = &program.source;
    assert_eq!(src.matches("for (int32_t i = 0; i < 100; i += 1) {").count(), 2);
    assert_eq!(src.matches("for (int32_t j = 0; j < 50; j += 1) {").count(), 2);
    assert_eq!(src.matches("for (").count(), 5);
    let init = src
        .find("var_0__reduce_init[((50 * i) + j)] = 0.0f;")
        .unwrap();
    let rk = src.find("for (int32_t rk = 0; rk < 20; rk += 1) {").unwrap();
    assert!(init < rk);
    assert!(src.contains(
        "var_0[((50 * i) + j)] = (var_0[((50 * i) + j)] + (A[((20 * i) + rk)] * B[((50 * rk) + j)]));"
    ));
    // the initialization nest writes the output buffer itself
    assert!(src.contains("float* var_0__reduce_init = ((float*)(_var_0->memory));"));
    assert!(!src.contains("kiln_buffer_malloc"));
}

#[test]
fn matmul_accumulation_collapses_to_fma() {
    let mut b = GraphBuilder::new("matmul");
    let x = b.input("A", &[8, 4], DType::F32);
    let y = b.input("B", &[4, 6], DType::F32);
    let c = b.matmul(x, y).unwrap();
    b.output(c).unwrap();
    let program = compile(&mut b.build(), true);
    assert!(program
        .source
        .contains("var_0[((6 * i) + j)] = fma(A[((4 * i) + rk)], B[((6 * rk) + j)], var_0[((6 * i) + j)]);"));
}

#[test]
fn temporary_is_allocated_once_around_its_uses() {
    let mut b = GraphBuilder::new("lifetime");
    let x = b.input("x", &[4, 6], DType::F32);
    let e = b.exp(x).unwrap();
    let t = b.transpose(e, &[1, 0]).unwrap();
    let r = b.reshape(e, &[6, 4]).unwrap();
    let s = b.add(t, r).unwrap();
    b.output(s).unwrap();
    let program = compile(&mut b.build(), true);

    let src = &program.source;
    assert_eq!(program.instructions.len(), 1);
    assert_eq!(src.matches("kiln_buffer_malloc").count(), 1);
    assert_eq!(src.matches("kiln_buffer_free").count(), 1);
    let malloc = src.find("kiln_buffer_malloc").unwrap();
    let free = src.find("kiln_buffer_free").unwrap();
    let first_loop = src.find("for (").unwrap();
    let last_loop_end = src.rfind("};").unwrap();
    assert!(malloc < first_loop);
    assert!(last_loop_end < free);
}

#[test]
fn header_lists_every_function() {
    let mut b = GraphBuilder::new("two_groups");
    let x = b.input("x", &[4, 8], DType::F32);
    let r = b.relu(x).unwrap();
    let c = b.cumsum(r, 1).unwrap();
    b.output(c).unwrap();
    let program = compile(&mut b.build(), true);

    let header = CodeGenC::default()
        .compile(&program.module, OutputKind::Header)
        .unwrap();
    assert!(header.starts_with("#ifndef _TWO_GROUPS_KILN_H_\n#define _TWO_GROUPS_KILN_H_\n"));
    for instr in &program.instructions {
        assert!(header.contains(&format!(
            "void {}(void* _args, int32_t num_args);",
            instr.function
        )));
    }
    assert!(header.ends_with("#endif  // _TWO_GROUPS_KILN_H_\n"));
}
