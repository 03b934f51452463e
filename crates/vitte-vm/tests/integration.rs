//! Host-facing scenarios: registering natives under a textual
//! signature and calling them from running bytecode, dispatcher
//! overload resolution, and forcing a collection through the
//! embedder-level facade rather than the execution core directly.

use vitte_core::bytecode::Chunk;
use vitte_core::{Op, Value, Vm as CoreVm};
use vitte_vm::Vm;

fn native_double(_vm: &mut CoreVm, args: &[Value]) -> Value {
    Value::number(args[0].as_number().unwrap_or(0.0) * 2.0)
}

/// A native registered through `register_native`'s textual signature
/// is just another global the bytecode can `GetGlobal`/`Call` like any
/// closure.
#[test]
fn native_function_is_callable_from_running_bytecode() {
    let mut vm = Vm::new();
    vm.register_native("double(val n)", native_double).expect("signature parses");

    let mut chunk = Chunk::new();
    let k_name = chunk.consts.push_string("double");
    chunk.push_op(Op::GetGlobal { dst: 1, name: k_name }, 1);
    chunk.push_op(Op::Move { dst: 2, src: 0 }, 1);
    chunk.push_op(Op::Call { callee: 1, argc: 1 }, 1);
    chunk.push_op(Op::Return { src: 1 }, 1);

    let closure = vm.load_chunk("main", 1, 3, chunk);
    let result = vm.call(closure, &[Value::number(21.0)]).expect("call succeeds");
    assert_eq!(result.as_number(), Some(42.0));
}

/// `dispatcher_add_overload` selects by argument count at call time,
/// so the same dispatcher value dispatches to different closures
/// depending on how many arguments the caller passes.
#[test]
fn dispatcher_selects_overload_by_arity() {
    let mut vm = Vm::new();

    let mut zero_arg_chunk = Chunk::new();
    let k_none = zero_arg_chunk.consts.push_string("none");
    zero_arg_chunk.push_op(Op::LoadConst { dst: 0, k: k_none }, 1);
    zero_arg_chunk.push_op(Op::Return { src: 0 }, 1);
    let zero_arg_overload = vm.load_chunk("combine/0", 0, 1, zero_arg_chunk);

    let mut one_arg_chunk = Chunk::new();
    one_arg_chunk.push_op(Op::ArithRR { op: vitte_core::bytecode::ArithOp::Add, dst: 1, lhs: 0, rhs: 0 }, 1);
    one_arg_chunk.push_op(Op::Return { src: 1 }, 1);
    let one_arg_overload = vm.load_chunk("combine/1", 1, 2, one_arg_chunk);

    let dispatcher = vm.new_dispatcher("combine");
    vm.dispatcher_add_overload(dispatcher, 0, zero_arg_overload).unwrap();
    vm.dispatcher_add_overload(dispatcher, 1, one_arg_overload).unwrap();

    let none_result = vm.call(dispatcher, &[]).expect("zero-arg overload runs");
    assert_eq!(vm.as_str(none_result), Some("none"));

    let doubled = vm.call(dispatcher, &[Value::number(5.0)]).expect("one-arg overload runs");
    assert_eq!(doubled.as_number(), Some(10.0));
}

/// A struct instance kept alive through a global survives an explicit
/// `collect_garbage` even while many short-lived lists are allocated
/// and dropped around it.
#[test]
fn collect_garbage_reclaims_churn_around_a_rooted_struct() {
    let mut vm = Vm::new();
    let schema = vm.register_struct_schema("Counter", &["value"]);
    let counter = vm.new_struct_instance(schema).expect("schema has fields");
    vm.struct_set_field(counter, "value", Value::number(0.0)).unwrap();
    vm.set_global("counter", counter);

    for i in 0..50 {
        let scratch = vm.new_list();
        vm.list_push(scratch, Value::number(i as f64)).unwrap();
        // `scratch` is dropped here: nothing roots it past this iteration.
    }

    let freed = vm.collect_garbage();
    assert_eq!(freed, 50);
    assert_eq!(vm.struct_get_field(counter, "value").unwrap().as_number(), Some(0.0));
}
