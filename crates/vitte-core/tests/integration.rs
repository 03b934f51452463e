//! End-to-end dispatch-loop tests: hand-assembled bytecode run through
//! a real `Vm`, exercising tail calls, upvalue capture/closing,
//! delimited continuations, and the collector — the things unit tests
//! inside each module can't see across module boundaries.

use std::rc::Rc;

use vitte_core::bytecode::chunk::{ConstValue, FunctionProto};
use vitte_core::bytecode::{ArithOp, Chunk, CmpOp, Op};
use vitte_core::interpreter::{Vm, VmLimits};
use vitte_core::object::{
    ClosureObj, FunctionObj, Obj, PromptTagId, PromptTagObj, QualifierSignature, UpvalueDesc,
};
use vitte_core::preempt::PreemptConfig;
use vitte_core::value::Value;

fn make_vm() -> Vm {
    Vm::new(VmLimits::default(), PreemptConfig::default())
}

/// Allocates a `Function`+`Closure` pair for `chunk` and returns the
/// closure as a callable `Value`, bypassing `Op::Closure` (which only
/// resolves prototypes out of an *already-running* chunk's own const
/// pool) for chunks a test wants to call directly from the host.
fn alloc_closure(vm: &mut Vm, chunk: Chunk, arity: u8, max_regs: u16) -> Value {
    let function = vm.heap_mut().alloc(Obj::Function(FunctionObj {
        arity,
        max_regs,
        chunk: Rc::new(chunk),
        name: None,
        module_name: None,
        upvalue_descriptors: Vec::new(),
        param_qualifiers: Vec::new(),
        qualifier_signature: QualifierSignature::AllNormalNoRefs,
    }));
    let closure = vm.heap_mut().alloc(Obj::Closure(ClosureObj { function, upvalues: Vec::new() }));
    Value::object(closure)
}

/// `fact(n, acc)` via `TailCallSelf`: no frame growth across the
/// recursion. `TailCallSelf` remaps its new argument registers from
/// r1.. (not r0..) onto r0.., so the loop body stages the next (n,
/// acc) pair into r1/r2 before issuing it.
#[test]
fn tail_recursive_factorial_does_not_grow_the_frame_stack() {
    let mut vm = make_vm();
    let mut chunk = Chunk::new();
    chunk.push_op(Op::CmpRI { op: CmpOp::Le, dst: 2, lhs: 0, imm: 1 }, 1);
    chunk.push_op(Op::JumpIfFalse { cond: 2, offset: 2 }, 1);
    chunk.push_op(Op::Return { src: 1 }, 1);
    chunk.push_op(Op::ArithRR { op: ArithOp::Mul, dst: 4, lhs: 1, rhs: 0 }, 2);
    chunk.push_op(Op::ArithRI { op: ArithOp::Sub, dst: 3, lhs: 0, imm: 1 }, 2);
    chunk.push_op(Op::Move { dst: 1, src: 3 }, 2);
    chunk.push_op(Op::Move { dst: 2, src: 4 }, 2);
    chunk.push_op(Op::TailCallSelf { argc: 2 }, 2);

    let fact = alloc_closure(&mut vm, chunk, 2, 5);
    let result = vm.call(fact, &[Value::number(5.0), Value::number(1.0)]).expect("call succeeds");
    assert_eq!(result.as_number(), Some(120.0));
    assert_eq!(vm.frame_depth(), 0);
}

/// A zero-arity `make_counter` closes over a local and returns an
/// inner closure that increments and writes back through the upvalue
/// on each call. `do_return` closes upvalues from the returning
/// frame's base automatically, so the capture survives `make_counter`
/// itself returning.
#[test]
fn closure_captures_and_mutates_an_upvalue_across_calls() {
    let mut vm = make_vm();

    let mut step_chunk = Chunk::new();
    step_chunk.push_op(Op::GetUpvalue { dst: 0, up: 0 }, 1);
    step_chunk.push_op(Op::ArithRI { op: ArithOp::Add, dst: 0, lhs: 0, imm: 1 }, 1);
    step_chunk.push_op(Op::SetUpvalue { up: 0, src: 0 }, 1);
    step_chunk.push_op(Op::Return { src: 0 }, 1);

    let step_proto = FunctionProto {
        name: "step".to_owned(),
        arity: 0,
        max_regs: 1,
        upvalue_descriptors: vec![UpvalueDesc::Local(0)],
        chunk: Box::new(step_chunk),
    };

    let mut outer_chunk = Chunk::new();
    let k_zero = outer_chunk.consts.push_number(0.0);
    let k_step = outer_chunk.consts.push_function(step_proto);
    outer_chunk.push_op(Op::LoadConst { dst: 0, k: k_zero }, 1);
    outer_chunk.push_op(Op::Closure { dst: 1, func: u32::from(k_step) }, 1);
    outer_chunk.push_op(Op::Return { src: 1 }, 1);

    let make_counter = alloc_closure(&mut vm, outer_chunk, 0, 2);
    let counter = vm.call(make_counter, &[]).expect("make_counter call succeeds");

    assert_eq!(vm.call(counter, &[]).unwrap().as_number(), Some(1.0));
    assert_eq!(vm.call(counter, &[]).unwrap().as_number(), Some(2.0));
    assert_eq!(vm.call(counter, &[]).unwrap().as_number(), Some(3.0));
}

/// `abort` unwinds straight past every frame up to (and discarding)
/// the matching `push_prompt`, delivering its value where the
/// prompt-guarded call's result would otherwise have gone.
#[test]
fn abort_unwinds_to_the_matching_prompt() {
    let mut vm = make_vm();
    let tag_handle = vm.heap_mut().alloc(Obj::PromptTag(PromptTagObj { id: PromptTagId(0), name: None }));
    let tag = Value::object(tag_handle);

    let mut aborter_chunk = Chunk::new();
    aborter_chunk.push_op(Op::Abort { tag: 0, value: 1 }, 1);
    let aborter = alloc_closure(&mut vm, aborter_chunk, 2, 2);

    let mut runner_chunk = Chunk::new();
    let k_aborter = runner_chunk.consts.push_function(closure_to_proto(&vm, aborter, "aborter"));
    let k_ninety_nine = runner_chunk.consts.push_number(99.0);
    runner_chunk.push_op(Op::PushPrompt { tag: 0 }, 1);
    runner_chunk.push_op(Op::Closure { dst: 1, func: u32::from(k_aborter) }, 1);
    runner_chunk.push_op(Op::Move { dst: 2, src: 0 }, 1);
    runner_chunk.push_op(Op::LoadConst { dst: 3, k: k_ninety_nine }, 1);
    runner_chunk.push_op(Op::Call { callee: 1, argc: 2 }, 1);
    runner_chunk.push_op(Op::Return { src: 1 }, 1);

    let runner = alloc_closure(&mut vm, runner_chunk, 1, 4);
    let result = vm.call(runner, &[tag]).expect("abort unwinds cleanly, not an error");
    assert_eq!(result.as_number(), Some(99.0));
}

/// `shift` captures the continuation up to the prompt and invokes the
/// handler with it immediately; the handler here resumes it with a
/// value, which must land in the captured frame's own `dst` register
/// and let it carry on from the instruction right after `shift` (not
/// re-run `shift` itself).
#[test]
fn shift_resume_delivers_the_resume_value_to_the_captured_frame() {
    let mut vm = make_vm();
    let tag_handle = vm.heap_mut().alloc(Obj::PromptTag(PromptTagObj { id: PromptTagId(0), name: None }));
    let tag = Value::object(tag_handle);

    let mut handler_chunk = Chunk::new();
    let k_resume_value = handler_chunk.consts.push_number(42.0);
    handler_chunk.push_op(Op::LoadConst { dst: 1, k: k_resume_value }, 1);
    handler_chunk.push_op(Op::Resume { dst: 2, cont: 0, value: 1 }, 1);
    handler_chunk.push_op(Op::ReturnNull, 1);
    let handler = alloc_closure(&mut vm, handler_chunk, 1, 3);

    let mut shifter_chunk = Chunk::new();
    let k_handler = shifter_chunk.consts.push_function(closure_to_proto(&vm, handler, "handler"));
    let k_result_name = shifter_chunk.consts.push_string("shift_result");
    shifter_chunk.push_op(Op::Closure { dst: 1, func: u32::from(k_handler) }, 1);
    shifter_chunk.push_op(Op::Shift { dst: 2, tag: 0, handler: 1 }, 1);
    shifter_chunk.push_op(Op::ArithRI { op: ArithOp::Add, dst: 3, lhs: 2, imm: 1 }, 2);
    shifter_chunk.push_op(Op::SetGlobal { name: k_result_name, src: 3 }, 2);
    shifter_chunk.push_op(Op::ReturnNull, 2);

    let mut runner_chunk = Chunk::new();
    let k_shifter = runner_chunk.consts.push_function(closure_to_proto(&vm, alloc_closure(&mut vm, shifter_chunk, 1, 4), "shifter"));
    runner_chunk.push_op(Op::PushPrompt { tag: 0 }, 1);
    runner_chunk.push_op(Op::Closure { dst: 1, func: u32::from(k_shifter) }, 1);
    runner_chunk.push_op(Op::Move { dst: 2, src: 0 }, 1);
    runner_chunk.push_op(Op::Call { callee: 1, argc: 1 }, 1);
    runner_chunk.push_op(Op::ReturnNull, 1);

    let runner = alloc_closure(&mut vm, runner_chunk, 1, 3);
    vm.call(runner, &[tag]).expect("shift/resume runs to completion");
    assert_eq!(vm.get_global("shift_result").and_then(|v| v.as_number()), Some(43.0));
}

/// Allocates 200 short-lived lists, keeping only the last one rooted;
/// an explicit collection must reclaim exactly the other 199 and leave
/// the survivor's contents intact.
#[test]
fn garbage_collection_reclaims_unrooted_lists_and_keeps_rooted_ones() {
    let mut vm = make_vm();

    let mut maker_chunk = Chunk::new();
    let k_one = maker_chunk.consts.push_number(1.0);
    let k_two = maker_chunk.consts.push_number(2.0);
    maker_chunk.push_op(Op::NewList { dst: 0 }, 1);
    maker_chunk.push_op(Op::LoadConst { dst: 1, k: k_one }, 1);
    maker_chunk.push_op(Op::ListAppend { list: 0, value: 1 }, 1);
    maker_chunk.push_op(Op::LoadConst { dst: 1, k: k_two }, 1);
    maker_chunk.push_op(Op::ListAppend { list: 0, value: 1 }, 1);
    maker_chunk.push_op(Op::Return { src: 0 }, 1);

    let make_list = alloc_closure(&mut vm, maker_chunk, 0, 2);
    vm.set_global("make_list", make_list);

    let mut survivor = Value::null();
    for _ in 0..200 {
        survivor = vm.call(make_list, &[]).expect("make_list call succeeds");
    }
    vm.push_temp_root(survivor);

    let freed = vm.collect_garbage();
    assert_eq!(freed, 199);
    assert_eq!(vm.heap().live_handles().count(), 3); // make_list's Function + Closure, plus the survivor List

    let survivor_handle = survivor.as_object().expect("survivor is a list object");
    match vm.heap().get(survivor_handle) {
        Obj::List(l) => assert_eq!(l.0.iter().filter_map(|v| v.as_number()).collect::<Vec<_>>(), vec![1.0, 2.0]),
        other => panic!("expected a surviving list, got {}", other.type_name()),
    }

    assert_eq!(vm.pop_temp_root(), Some(survivor));
}

/// Builds a `FunctionProto` that mirrors an already-allocated closure,
/// so a caller can re-embed it as a nested-function constant without
/// hand-duplicating its chunk.
fn closure_to_proto(vm: &Vm, closure: Value, name: &str) -> FunctionProto {
    let closure_h = closure.as_object().expect("closure_to_proto: not an object");
    let (function_h, _) = match vm.heap().get(closure_h) {
        Obj::Closure(c) => (c.function, ()),
        _ => panic!("closure_to_proto: not a closure"),
    };
    match vm.heap().get(function_h) {
        Obj::Function(f) => FunctionProto {
            name: name.to_owned(),
            arity: f.arity,
            max_regs: f.max_regs,
            upvalue_descriptors: f.upvalue_descriptors.clone(),
            chunk: Box::new((*f.chunk).clone()),
        },
        _ => panic!("closure_to_proto: not a function"),
    }
}

#[allow(dead_code)]
fn assert_const_value_is_function(v: &ConstValue) -> bool {
    matches!(v, ConstValue::Function(_))
}
