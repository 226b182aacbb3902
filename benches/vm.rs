//! Benchmarks for the bytecode VM.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ternlang::Vm;

const FIB: &str = "var fib = nil \
                   fib = fn (n) { if (n < 2) { return n } fib(n - 1) + fib(n - 2) } \
                   fib(15)";

const COUNTER_LOOP: &str = "class Counter { new() { _n = 0 } inc() { _n = _n + 1 } get() { _n } } \
                            var c = Counter.new() \
                            var i = 0 \
                            while (i < 1000) { c.inc() i = i + 1 } \
                            c.get()";

const FIBER_PING_PONG: &str = "var f = Fiber.new(fn { var i = 0 while (i < 500) { Fiber.yield(i) i = i + 1 } }) \
                               var total = 0 \
                               var i = 0 \
                               while (i < 500) { total = total + f.call() i = i + 1 } \
                               total";

fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile_counter", |b| {
        b.iter(|| ternlang::check("bench", black_box(COUNTER_LOOP)))
    });
}

fn bench_run(c: &mut Criterion) {
    c.bench_function("run_fib_15", |b| {
        b.iter(|| Vm::new().interpret("bench", black_box(FIB)))
    });
    c.bench_function("run_counter_loop", |b| {
        b.iter(|| Vm::new().interpret("bench", black_box(COUNTER_LOOP)))
    });
    c.bench_function("run_fiber_ping_pong", |b| {
        b.iter(|| Vm::new().interpret("bench", black_box(FIBER_PING_PONG)))
    });
}

criterion_group!(benches, bench_compile, bench_run);
criterion_main!(benches);
