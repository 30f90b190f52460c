//! Run with:
//!   cargo bench --bench dispatch

use std::{io, rc::Rc};

use bytecode::{BytecodeBuilder, ImageWriter, IrepDesc, Op};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use vm::{ObjectSystem, Status, SystemAllocator, Vm, VmConfig};

/// `i = 0; while i < n; i += 1; end; i`
fn counting_loop(n: i32) -> Vec<u8> {
    let mut desc = IrepDesc::new(1, 5, Vec::new());
    let mut b = BytecodeBuilder::new();
    b.load_int(1, 0);
    let top = b.current_offset();
    b.op_ab(Op::AddI, 1, 1);
    b.mov(2, 1);
    b.load_int(3, n);
    b.op_a(Op::Lt, 2);
    b.jump_back_if(2, top);
    b.ret(1);
    desc.code = b.into_bytes();
    ImageWriter::new().write(&desc)
}

/// `def f(x); x + 1; end` called `n` times in a loop.
fn send_loop(n: i32) -> Vec<u8> {
    let mut desc = IrepDesc::new(1, 6, Vec::new());

    let mut m = BytecodeBuilder::new();
    m.enter(1, 0, false);
    m.op_ab(Op::AddI, 1, 1);
    m.ret(1);
    let f = desc.add_child(IrepDesc::new(2, 3, m.into_bytes()));
    let name = desc.sym("f");

    let mut b = BytecodeBuilder::new();
    b.op_a(Op::TClass, 1);
    b.op_ab(Op::Method, 2, f);
    b.op_ab(Op::Def, 1, name);
    b.load_int(1, 0);
    let top = b.current_offset();
    b.load_self(2);
    b.mov(3, 1);
    b.send(2, name, 1);
    b.mov(1, 2);
    b.load_int(3, n);
    b.op_a(Op::Lt, 2);
    b.jump_back_if(2, top);
    b.ret(1);
    desc.code = b.into_bytes();
    ImageWriter::new().write(&desc)
}

fn run_case(c: &mut Criterion, name: &str, image: Vec<u8>) {
    let image: Rc<[u8]> = image.into();
    let system = ObjectSystem::with(Rc::new(SystemAllocator::new()), Box::new(io::sink()));
    let mut vm = Vm::open_with(system, VmConfig::default());

    c.bench_function(name, |b| {
        b.iter(|| {
            vm.load(image.clone()).expect("load");
            let status = vm.run().expect("run");
            assert_eq!(status, Status::Halted);
            black_box(vm.result());
            vm.end();
        })
    });
}

fn bench_dispatch(c: &mut Criterion) {
    run_case(c, "counting_loop_10k", counting_loop(10_000));
    run_case(c, "send_loop_10k", send_loop(10_000));
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
