//! Engine throughput: plain fast chains vs the Gerbicz-checked variant
//! (the check should cost a few percent, not tens).

use criterion::{criterion_group, criterion_main, Criterion};
use rug::Integer;

use primeprove::exp::FastExp;
use primeprove::gw::GwState;
use primeprove::input::InputNum;
use primeprove::state::TaskState;
use primeprove::strong::StrongCheckExp;
use primeprove::task::{reset_abort, Task, TaskContext};

fn bench_fast_exp(c: &mut Criterion) {
    let input = InputNum::parse("3*2^2000+1").unwrap();
    let exp = Integer::from(&*input.value() - 1u32);
    c.bench_function("fast_exp_2000", |b| {
        b.iter(|| {
            reset_abort();
            let mut gw = GwState::setup(&input, 100).unwrap();
            let mut task = FastExp::new(exp.clone());
            task.init(&mut gw, None, 5, None).unwrap();
            task.run(&mut gw, &TaskContext::default()).unwrap();
            task.result().unwrap()
        })
    });
}

fn bench_gerbicz_exp(c: &mut Criterion) {
    let input = InputNum::parse("3*2^2000+1").unwrap();
    c.bench_function("gerbicz_exp_2000", |b| {
        b.iter(|| {
            reset_abort();
            let mut gw = GwState::setup(&input, 100).unwrap();
            let mut task = StrongCheckExp::gerbicz(Integer::from(2u32), 2000, 4, None, None);
            task.init(&mut gw, None, None, 0, None).unwrap();
            task.init_state(TaskState::Value {
                iteration: 0,
                x: Integer::from(5u32),
            });
            task.run(&mut gw, &TaskContext::default()).unwrap();
            task.result().unwrap()
        })
    });
}

criterion_group!(benches, bench_fast_exp, bench_gerbicz_exp);
criterion_main!(benches);
