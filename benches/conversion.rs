//! Conversion and call benchmarks
//!
//! Measures the cost of moving values across the interpreter boundary.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pyshim::{Interpreter, ToPython, Value};
use tempfile::TempDir;

fn bench_scalars(c: &mut Criterion) {
    let py = Interpreter::initialize().unwrap();
    let mut group = c.benchmark_group("scalars");

    group.bench_function("int", |b| {
        b.iter(|| Value::Int(black_box(42)).to_object(&py).unwrap().extract::<i64>().unwrap())
    });
    group.bench_function("str", |b| {
        b.iter(|| black_box("héllo wörld").to_python(&py).unwrap().extract::<String>().unwrap())
    });

    group.finish();
}

fn bench_lists(c: &mut Criterion) {
    let py = Interpreter::initialize().unwrap();
    let mut group = c.benchmark_group("lists");

    for size in [10usize, 100, 1000] {
        let items: Vec<i64> = (0..size as i64).collect();
        group.bench_with_input(BenchmarkId::new("encode_decode", size), &items, |b, items| {
            b.iter(|| items.to_python(&py).unwrap().to_value().unwrap())
        });
    }

    group.finish();
}

fn bench_calls(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("shim_bench.py"), "def add(a, b):\n    return a + b\n").unwrap();

    let py = Interpreter::initialize().unwrap();
    let module = py.import("shim_bench", Some(dir.path())).unwrap();
    let args = [Value::Int(1), Value::Int(2)];

    c.bench_function("call_module_function", |b| {
        b.iter(|| module.call("add", Some(black_box(&args))).unwrap())
    });
}

criterion_group!(benches, bench_scalars, bench_lists, bench_calls);
criterion_main!(benches);
