use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mcg::ast::{Ast, AstExp, CallSite, Decl, PipelineDecl, SourceLoc, StageDecl};
use mcg::pipeline::{compile, CompileOptions};
use mcg::types::TypeTable;
use std::path::Path;

// Scaling generators. Every generated document resolves without errors.

/// `P` calls `n` aliased copies of `S`, each bound to the previous one's output.
fn flat_chain(n: usize) -> (Ast, CallSite) {
    let mut pipeline = PipelineDecl::new("P").input("x", "int").output("y", "int");
    for i in 0..n {
        let input = if i == 0 {
            AstExp::self_ref("x")
        } else {
            AstExp::call_ref(format!("S{}", i - 1), "y")
        };
        pipeline = pipeline.call(CallSite::new("S").alias(format!("S{}", i)).bind("x", input));
    }
    pipeline = pipeline.ret("y", AstExp::call_ref(format!("S{}", n - 1), "y"));
    let decls = vec![
        Decl::Stage(StageDecl::new("S").input("x", "int").output("y", "int")),
        Decl::Pipeline(pipeline),
    ];
    let ast = Ast::new(TypeTable::new(), decls).expect("flat chain must be valid");
    (ast, CallSite::new("P").bind("x", AstExp::int(1)))
}

/// `P` map-calls `S` over a literal array of `n` elements.
fn mapped_literal(n: usize) -> (Ast, CallSite) {
    let pipeline = PipelineDecl::new("P")
        .input("xs", "int[]")
        .output("ys", "int[]")
        .call(CallSite::new("S").mapped().bind(
            "x",
            AstExp::split(AstExp::self_ref("xs"), SourceLoc::new("p.mro", 3)),
        ))
        .ret("ys", AstExp::call_ref("S", "y"));
    let decls = vec![
        Decl::Stage(StageDecl::new("S").input("x", "int").output("y", "int")),
        Decl::Pipeline(pipeline),
    ];
    let ast = Ast::new(TypeTable::new(), decls).expect("mapped pipeline must be valid");
    let xs = AstExp::array((0..n as i64).map(AstExp::int));
    (ast, CallSite::new("P").bind("xs", xs))
}

fn fixture(name: &str) -> Vec<u8> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    std::fs::read(path).expect("fixture must exist")
}

// KPI: call graph construction and resolution as the call count grows.
fn bench_kpi_flat_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/flat_scaling");
    for n in [1usize, 10, 50, 200] {
        let (ast, call) = flat_chain(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let (graph, result) = mcg::build_call_graph(black_box(&ast), "", &call);
                assert!(result.is_ok());
                black_box(graph);
            });
        });
    }
    group.finish();
}

// KPI: static fork expansion as the mapped array grows.
fn bench_kpi_mapped_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/mapped_scaling");
    for n in [1usize, 16, 256, 1024] {
        let (ast, call) = mapped_literal(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let (graph, result) = mcg::build_call_graph(black_box(&ast), "", &call);
                assert!(result.is_ok());
                black_box(graph);
            });
        });
    }
    group.finish();
}

// KPI: end-to-end latency (parse -> resolve -> JSON -> fingerprint) on fixtures.
fn bench_kpi_full_compile_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/full_compile_latency");
    let opts = CompileOptions::default();
    for name in ["single_stage", "mapped_literal", "nested_static", "unknown_length"] {
        let input = fixture(&format!("{}.json", name));
        group.bench_with_input(BenchmarkId::from_parameter(name), &input, |b, input| {
            b.iter(|| {
                let compiled = compile(black_box(input), &opts).expect("fixture must resolve");
                black_box(compiled.provenance);
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_kpi_flat_scaling,
    bench_kpi_mapped_scaling,
    bench_kpi_full_compile_latency
);
criterion_main!(benches);
