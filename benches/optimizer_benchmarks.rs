//! Performance benchmarks for the trace optimizer
//!
//! Run with: cargo bench
//!
//! Traces are generated so their length can be scaled.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::fmt::Write;
use tracejit::{optimize_loop, parse, OptimizerConfig};

/// A loop of `n` arithmetic steps, each guarded by a bounds check
fn arithmetic_loop(n: usize) -> String {
    let mut text = String::from("[i0, i1]\n");
    let mut last = 0;
    for k in 0..n {
        let (sum, cmp) = (2 + 2 * k, 3 + 2 * k);
        let _ = writeln!(text, "i{} = int_add(i{}, i1)", sum, last);
        let _ = writeln!(text, "i{} = int_lt(i{}, 1000000)", cmp, sum);
        let _ = writeln!(text, "guard_true(i{}) [i{}]", cmp, sum);
        last = sum;
    }
    let _ = writeln!(text, "jump(i{}, i1)", last);
    text
}

/// A loop that allocates and reads back `n` short-lived structs
fn allocation_loop(n: usize) -> String {
    let mut text = String::from(
        "descr nodesize = size()\ndescr valuedescr = field(node, int)\n[i0]\n",
    );
    let mut last = 0;
    for k in 0..n {
        let (p, v) = (1 + 2 * k, 2 + 2 * k);
        let _ = writeln!(text, "p{} = new(descr=nodesize)", p);
        let _ = writeln!(text, "setfield_gc(p{}, i{}, descr=valuedescr)", p, last);
        let _ = writeln!(text, "i{} = getfield_gc(p{}, descr=valuedescr)", v, p);
        last = v;
    }
    let _ = writeln!(text, "jump(i{})", last);
    text
}

fn bench_parse(c: &mut Criterion) {
    let text = arithmetic_loop(200);
    c.bench_function("parse_200_steps", |b| b.iter(|| parse(black_box(&text)).unwrap()));
}

fn bench_optimize(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimize");
    for (name, generate) in [
        ("arithmetic", arithmetic_loop as fn(usize) -> String),
        ("allocation", allocation_loop),
    ] {
        for size in [10usize, 100, 500] {
            let (trace, _) = parse(&generate(size)).unwrap();
            group.throughput(Throughput::Elements(trace.ops.len() as u64));
            for passes in ["intbounds:rewrite:virtualize:string:pure:heap", "all"] {
                let config = OptimizerConfig::with_passes(passes);
                let id = format!("{}/{}", name, if passes == "all" { "unrolled" } else { "linear" });
                group.bench_with_input(BenchmarkId::new(id, size), &trace, |b, trace| {
                    b.iter(|| {
                        let mut trace = trace.clone();
                        optimize_loop(&mut trace, &config).unwrap();
                        black_box(trace)
                    })
                });
            }
        }
    }
    group.finish();
}

criterion_group!(benches, bench_parse, bench_optimize);
criterion_main!(benches);
