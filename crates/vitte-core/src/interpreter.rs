//! interpreter.rs — The register-machine dispatch loop (spec §4.3
//! "Interpreter").
//!
//! `Vm` owns everything the loop touches: the value stack (shared by
//! every frame, register `r` of the top frame is
//! `stack[frame.stack_base + r]`), the call-frame stack, the heap,
//! the open-upvalue chain, the prompt stack, and the global table.
//! `run` drives frames until the outermost one returns or a runtime
//! error unwinds the whole call stack.

use ahash::AHashMap;

use crate::bytecode::opcode::Op;
use crate::error::{BoundsKind, ControlEffectKind, RuntimeError, VmError, VmResult};
use crate::frame::{CallFrame, TraceFrame};
use crate::gc::{self, Trace};
use crate::heap::Heap;
use crate::native::NativeSignature;
use crate::object::{
    ClosureObj, DispatcherObj, EnumTypeId, FunctionObj, HeapHandle, ListObj, MapObj, Obj,
    PromptTagId, PromptTagObj, Qualifier, QualifierSignature, ReferenceKind, ReferenceObj,
    StringObj, StructInstanceObj, UpvalueDesc,
};
use crate::preempt::{Preempt, PreemptConfig};
use crate::prompt::{self, PromptEntry, PromptStack};
use crate::upvalue::OpenUpvalues;
use crate::value::Value;

/// Capacity limits enforced at runtime (spec §5 "Resource model").
#[derive(Debug, Clone, Copy)]
pub struct VmLimits {
    pub stack_capacity: usize,
    pub frame_capacity: usize,
    pub prompt_capacity: usize,
    pub resume_capacity: usize,
    pub initial_next_gc: usize,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            stack_capacity: 64 * 1024,
            frame_capacity: 4 * 1024,
            prompt_capacity: 1024,
            resume_capacity: 256,
            initial_next_gc: 1 << 20,
        }
    }
}

/// The register-machine VM: one instance, one call stack (spec §5
/// Non-goal: no multi-threaded sharing of a single instance).
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: OpenUpvalues,
    prompts: PromptStack,
    globals: AHashMap<String, Value>,
    natives: AHashMap<String, HeapHandle>,
    next_enum_type_id: u16,
    temp_roots: Vec<Value>,
    preempt: Preempt,
    limits: VmLimits,
    resume_depth: usize,
}

impl Vm {
    pub fn new(limits: VmLimits, preempt_config: PreemptConfig) -> Self {
        Self {
            heap: Heap::new(limits.initial_next_gc),
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: OpenUpvalues::new(),
            prompts: PromptStack::new(),
            globals: AHashMap::new(),
            natives: AHashMap::new(),
            next_enum_type_id: 0,
            temp_roots: Vec::new(),
            preempt: Preempt::new(preempt_config),
            limits,
            resume_depth: 0,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn intern(&mut self, s: &str) -> HeapHandle {
        self.heap.intern(s)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_owned(), value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).copied()
    }

    /// Pushes a value the collector must treat as a root for the
    /// duration of a host call, independent of the VM stack (spec §6
    /// "temp-root stack", used while a native builds up a composite
    /// value argument by argument).
    pub fn push_temp_root(&mut self, v: Value) {
        self.temp_roots.push(v);
    }

    pub fn pop_temp_root(&mut self) -> Option<Value> {
        self.temp_roots.pop()
    }

    pub fn enable_preemption(&mut self) {
        self.preempt.enable();
    }

    pub fn disable_preemption(&mut self) {
        self.preempt.disable();
    }

    pub fn set_preempt_timeslice(&mut self, ticks: u64) {
        self.preempt.set_timeslice(ticks);
    }

    pub fn request_preempt(&mut self) {
        self.preempt.request();
    }

    pub fn register_native(
        &mut self,
        sig: &NativeSignature,
        func: crate::object::NativeFn,
    ) -> HeapHandle {
        let name_handle = self.heap.intern(&sig.name);
        let handle = self.heap.alloc(Obj::NativeFunction(crate::object::NativeFunctionObj {
            name: name_handle,
            arity: sig.arity(),
            qualifiers: sig.qualifiers(),
            qualifier_signature: sig.signature_shape(),
            func,
        }));
        self.natives.insert(sig.name.clone(), handle);
        self.globals.insert(sig.name.clone(), Value::object(handle));
        handle
    }

    pub fn next_enum_type_id(&mut self) -> EnumTypeId {
        let id = EnumTypeId(self.next_enum_type_id);
        self.next_enum_type_id += 1;
        id
    }

    /// Invokes `closure_or_native` with `args`, running to completion
    /// (spec §6 "call"). Intended for host-initiated calls into VM
    /// code, not for recursive calls from within the dispatch loop.
    pub fn call(&mut self, callable: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let (return_slot, frame_floor) = self.begin_call(callable, args)?;
        if self.frames.len() > frame_floor {
            self.run_until_frame(frame_floor)?;
        }
        Ok(self.finish_call(return_slot))
    }

    /// Starts a call without draining it: pushes the return slot and,
    /// for a closure, its frame. Pairs with `run_slice`/`finish_call`
    /// for hosts that want to bound execution by a preemption budget
    /// instead of running to completion in one go (spec §4.9).
    pub fn begin_call(&mut self, callable: Value, args: &[Value]) -> Result<(usize, usize), RuntimeError> {
        let return_slot = self.stack.len();
        self.stack.push(Value::null());
        let frame_floor = self.frames.len();
        self.do_call(callable, args, return_slot)
            .map_err(|e| self.wrap_error(e))?;
        Ok((return_slot, frame_floor))
    }

    /// Runs instructions until the frame stack drains to `floor` or a
    /// safe point is reached where `should_yield()` holds, whichever
    /// comes first. Returns `Ok(true)` if it fully drained. On a
    /// yield, frames and the stack are left exactly as they were, so a
    /// later `run_slice` call resumes seamlessly; the host is expected
    /// to call `reset_preempt` before doing so.
    pub fn run_slice(&mut self, floor: usize) -> Result<bool, RuntimeError> {
        loop {
            if self.frames.len() <= floor {
                return Ok(true);
            }
            if self.preempt.should_yield() {
                return Ok(false);
            }
            if let Err(kind) = self.step() {
                let err = self.wrap_error(kind);
                self.frames.truncate(floor);
                return Err(err);
            }
        }
    }

    /// Reads back the result of a call begun with `begin_call` once
    /// its frames have fully drained, truncating the stack behind it.
    pub fn finish_call(&mut self, return_slot: usize) -> Value {
        let result = self.stack[return_slot];
        self.stack.truncate(return_slot);
        result
    }

    pub fn should_yield(&self) -> bool {
        self.preempt.should_yield()
    }

    pub fn reset_preempt(&mut self) {
        self.preempt.reset();
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    fn wrap_error(&self, kind: VmError) -> RuntimeError {
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|f| TraceFrame {
                function_name: self.closure_name(f.closure),
                line: f.chunk.line_for(f.ip as usize).unwrap_or(0),
            })
            .collect();
        RuntimeError::new(kind, trace)
    }

    fn closure_name(&self, closure: HeapHandle) -> String {
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => return "<?>".to_owned(),
        };
        match self.heap.get(function) {
            Obj::Function(f) => f
                .name
                .map(|h| self.obj_string(h).to_owned())
                .unwrap_or_else(|| "<anonymous>".to_owned()),
            _ => "<?>".to_owned(),
        }
    }

    fn obj_string(&self, handle: HeapHandle) -> &str {
        match self.heap.get(handle) {
            Obj::String(s) => s.as_str(),
            _ => "<not-a-string>",
        }
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Runs one collection cycle unconditionally, bypassing the
    /// `next_gc` threshold. Hosts can call this at their own safe
    /// points (e.g. between top-level statements) instead of waiting
    /// for allocation pressure to trigger one.
    pub fn collect_garbage(&mut self) -> usize {
        // `gc::collect` takes `&dyn Trace`, which would need to borrow
        // all of `self` immutably while `&mut self.heap` is held.
        // Snapshotting the roots first keeps the two borrows disjoint.
        let snapshot = RootSnapshot { roots: self.roots(), root_values: self.root_values() };
        gc::collect(&mut self.heap, &snapshot)
    }

    fn reg(&self, r: u8) -> Value {
        let base = self.frames.last().expect("reg: no active frame").stack_base;
        self.stack[base + r as usize]
    }

    fn set_reg(&mut self, r: u8, v: Value) {
        let base = self.frames.last().expect("set_reg: no active frame").stack_base;
        self.stack[base + r as usize] = v;
    }

    fn fetch(&self) -> Op {
        let frame = self.frames.last().expect("fetch: no active frame");
        frame.chunk.ops[frame.ip as usize]
    }

    fn advance(&mut self) {
        self.frames.last_mut().expect("advance: no active frame").ip += 1;
    }

    fn jump(&mut self, offset: i32) {
        let frame = self.frames.last_mut().expect("jump: no active frame");
        frame.ip = (frame.ip as i64 + offset as i64) as u32;
    }

    fn numeric_binop(&self, a: Value, b: Value) -> VmResult<(f64, f64)> {
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => Ok((x, y)),
            _ => Err(VmError::Type("arithmetic operand is not a number".into())),
        }
    }

    fn apply_arith(&self, op: crate::bytecode::opcode::ArithOp, x: f64, y: f64) -> f64 {
        use crate::bytecode::opcode::ArithOp::*;
        match op {
            Add => x + y,
            Sub => x - y,
            Mul => x * y,
            Div => x / y,
            Mod => x % y,
        }
    }

    fn apply_bit(&self, op: crate::bytecode::opcode::BitOp, x: f64, y: f64) -> VmResult<f64> {
        use crate::bytecode::opcode::BitOp::*;
        let xi = x as i64;
        let yi = y as i64;
        let r = match op {
            And => xi & yi,
            Or => xi | yi,
            Xor => xi ^ yi,
            Shl => xi << (yi & 63),
            Shr => xi >> (yi & 63),
        };
        Ok(r as f64)
    }

    fn compare(&self, op: crate::bytecode::opcode::CmpOp, a: Value, b: Value) -> VmResult<bool> {
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            let ord = x.partial_cmp(&y).unwrap_or(core::cmp::Ordering::Greater);
            return Ok(op.eval(ord, x == y));
        }
        use crate::bytecode::opcode::CmpOp::*;
        match op {
            Eq => Ok(a == b),
            Ne => Ok(a != b),
            _ => Err(VmError::Type("ordering comparison on non-numeric operands".into())),
        }
    }

    /// Executes one host-level call and, if it pushed VM frames
    /// (i.e. it was a closure, not a native), runs them to completion
    /// before returning.
    fn run_until_frame(&mut self, floor: usize) -> Result<(), RuntimeError> {
        loop {
            if self.frames.len() <= floor {
                return Ok(());
            }
            if let Err(kind) = self.step() {
                let err = self.wrap_error(kind);
                self.frames.truncate(floor);
                return Err(err);
            }
        }
    }

    /// Dispatches exactly one instruction.
    fn step(&mut self) -> VmResult<()> {
        self.preempt.tick();
        let op = self.fetch();
        match op {
            Op::Nop => self.advance(),

            Op::Return { src } => {
                let v = self.reg(src);
                self.do_return(v)?;
            }
            Op::ReturnNull => {
                self.do_return(Value::null())?;
            }

            Op::Move { dst, src } => {
                self.set_reg(dst, self.reg(src));
                self.advance();
            }
            Op::LoadConst { dst, k } => {
                let v = self.load_const(k)?;
                self.set_reg(dst, v);
                self.advance();
            }
            Op::LoadNull { dst } => {
                self.set_reg(dst, Value::null());
                self.advance();
            }
            Op::LoadTrue { dst } => {
                self.set_reg(dst, Value::bool(true));
                self.advance();
            }
            Op::LoadFalse { dst } => {
                self.set_reg(dst, Value::bool(false));
                self.advance();
            }

            Op::ArithRR { op, dst, lhs, rhs } => {
                let (x, y) = self.numeric_binop(self.reg(lhs), self.reg(rhs))?;
                self.set_reg(dst, Value::number(self.apply_arith(op, x, y)));
                self.advance();
            }
            Op::ArithRI { op, dst, lhs, imm } => {
                let (x, _) = self.numeric_binop(self.reg(lhs), Value::number(0.0))?;
                self.set_reg(dst, Value::number(self.apply_arith(op, x, f64::from(imm))));
                self.advance();
            }
            Op::ArithRL { op, dst, lhs, lit } => {
                let (x, _) = self.numeric_binop(self.reg(lhs), Value::number(0.0))?;
                self.set_reg(dst, Value::number(self.apply_arith(op, x, lit)));
                self.advance();
            }

            Op::BitRR { op, dst, lhs, rhs } => {
                let (x, y) = self.numeric_binop(self.reg(lhs), self.reg(rhs))?;
                self.set_reg(dst, Value::number(self.apply_bit(op, x, y)?));
                self.advance();
            }

            Op::Neg { dst, src } => {
                let x = self.reg(src).as_number().ok_or_else(|| {
                    VmError::Type("neg: operand is not a number".into())
                })?;
                self.set_reg(dst, Value::number(-x));
                self.advance();
            }
            Op::Not { dst, src } => {
                let v = self.reg(src);
                self.set_reg(dst, Value::bool(!v.is_truthy()));
                self.advance();
            }
            Op::BitNot { dst, src } => {
                let x = self.reg(src).as_number().ok_or_else(|| {
                    VmError::Type("bnot: operand is not a number".into())
                })?;
                self.set_reg(dst, Value::number(!(x as i64) as f64));
                self.advance();
            }

            Op::CmpRR { op, dst, lhs, rhs } => {
                let r = self.compare(op, self.reg(lhs), self.reg(rhs))?;
                self.set_reg(dst, Value::bool(r));
                self.advance();
            }
            Op::CmpRI { op, dst, lhs, imm } => {
                let r = self.compare(op, self.reg(lhs), Value::number(f64::from(imm)))?;
                self.set_reg(dst, Value::bool(r));
                self.advance();
            }
            Op::CmpRL { op, dst, lhs, lit } => {
                let r = self.compare(op, self.reg(lhs), Value::number(lit))?;
                self.set_reg(dst, Value::bool(r));
                self.advance();
            }

            Op::Jump { offset } => self.jump(offset),
            Op::JumpIfFalse { cond, offset } => {
                if !self.reg(cond).is_truthy() {
                    self.jump(offset);
                } else {
                    self.advance();
                }
            }
            Op::JumpIfTrue { cond, offset } => {
                if self.reg(cond).is_truthy() {
                    self.jump(offset);
                } else {
                    self.advance();
                }
            }

            Op::BranchCmpRR { op, lhs, rhs, offset } => {
                if self.compare(op, self.reg(lhs), self.reg(rhs))? {
                    self.jump(offset);
                } else {
                    self.advance();
                }
            }
            Op::BranchCmpRI { op, lhs, imm, offset } => {
                if self.compare(op, self.reg(lhs), Value::number(f64::from(imm)))? {
                    self.jump(offset);
                } else {
                    self.advance();
                }
            }
            Op::BranchCmpRL { op, lhs, lit, offset } => {
                if self.compare(op, self.reg(lhs), Value::number(lit))? {
                    self.jump(offset);
                } else {
                    self.advance();
                }
            }

            Op::GetGlobal { dst, name } | Op::GetGlobalCached { dst, slot: name } => {
                let key = self.const_string(name)?;
                let v = self
                    .globals
                    .get(&key)
                    .copied()
                    .ok_or_else(|| VmError::Undefined(key.clone()))?;
                self.set_reg(dst, v);
                self.advance();
            }
            Op::SetGlobal { name, src } | Op::SetGlobalCached { slot: name, src } => {
                let key = self.const_string(name)?;
                let v = self.reg(src);
                self.globals.insert(key, v);
                self.advance();
            }
            Op::SlotSetGlobal { slot, src } => {
                let key = self.const_string(slot)?;
                let v = self.reg(src);
                self.globals.insert(key, v);
                self.advance();
            }

            Op::Closure { dst, func } => {
                let v = self.make_closure(func)?;
                self.set_reg(dst, v);
                self.advance();
            }
            Op::GetUpvalue { dst, up } | Op::SlotGetUpvalue { dst, up } => {
                let v = self.read_upvalue(up)?;
                self.set_reg(dst, v);
                self.advance();
            }
            Op::SetUpvalue { up, src } | Op::SlotSetUpvalue { up, src } => {
                let v = self.reg(src);
                self.write_upvalue(up, v)?;
                self.advance();
            }
            Op::CloseUpvalue { at } => {
                let base = self.frames.last().unwrap().stack_base;
                let addr = base + at as usize;
                self.open_upvalues.close_from(&mut self.heap, &self.stack, addr);
                self.advance();
            }
            Op::CloseFrameUpvalues => {
                let base = self.frames.last().unwrap().stack_base;
                self.open_upvalues.close_from(&mut self.heap, &self.stack, base);
                self.advance();
            }

            Op::Call { callee, argc } => {
                self.do_dispatched_call(callee, argc, false, false)?;
            }
            Op::TailCall { callee, argc } => {
                self.do_dispatched_call(callee, argc, true, false)?;
            }
            Op::TailCallSelf { argc } => {
                self.do_self_tail_call(argc)?;
            }
            Op::SmartTailCall { callee, argc } => {
                self.do_dispatched_call(callee, argc, true, true)?;
            }

            Op::NewList { dst } => {
                let h = self.heap.alloc(Obj::List(crate::object::ListObj(Vec::new())));
                self.set_reg(dst, Value::object(h));
                self.advance();
            }
            Op::ListAppend { list, value } => {
                let v = self.reg(value);
                let h = self.reg(list).as_object().ok_or_else(|| {
                    VmError::Type("lappend: target is not a list".into())
                })?;
                match self.heap.get_mut(h) {
                    Obj::List(l) => l.0.push(v),
                    _ => return Err(VmError::Type("lappend: target is not a list".into())),
                }
                self.advance();
            }
            Op::ListSpread { list, iterable } => {
                let src_h = self.reg(iterable).as_object().ok_or_else(|| {
                    VmError::Type("lspread: source is not a list".into())
                })?;
                let items = match self.heap.get(src_h) {
                    Obj::List(l) => l.0.clone(),
                    _ => return Err(VmError::Type("lspread: source is not a list".into())),
                };
                let dst_h = self.reg(list).as_object().ok_or_else(|| {
                    VmError::Type("lspread: target is not a list".into())
                })?;
                match self.heap.get_mut(dst_h) {
                    Obj::List(l) => l.0.extend(items),
                    _ => return Err(VmError::Type("lspread: target is not a list".into())),
                }
                self.advance();
            }
            Op::ListGet { dst, list, index } => {
                let h = self.reg(list).as_object().ok_or_else(|| {
                    VmError::Type("lget: target is not a list".into())
                })?;
                let idx = self.reg(index).as_number().unwrap_or(-1.0) as i64;
                let v = match self.heap.get(h) {
                    Obj::List(l) => {
                        let len = l.0.len();
                        if idx < 0 || idx as usize >= len {
                            return Err(VmError::Bounds(BoundsKind::ListIndex { index: idx, len }));
                        }
                        l.0[idx as usize]
                    }
                    _ => return Err(VmError::Type("lget: target is not a list".into())),
                };
                self.set_reg(dst, v);
                self.advance();
            }
            Op::ListSet { list, index, value } => {
                let h = self.reg(list).as_object().ok_or_else(|| {
                    VmError::Type("lset: target is not a list".into())
                })?;
                let idx = self.reg(index).as_number().unwrap_or(-1.0) as i64;
                let v = self.reg(value);
                match self.heap.get_mut(h) {
                    Obj::List(l) => {
                        let len = l.0.len();
                        if idx < 0 || idx as usize >= len {
                            return Err(VmError::Bounds(BoundsKind::ListIndex { index: idx, len }));
                        }
                        l.0[idx as usize] = v;
                    }
                    _ => return Err(VmError::Type("lset: target is not a list".into())),
                }
                self.advance();
            }

            Op::NewMap { dst } => {
                let h = self.heap.alloc(Obj::Map(MapObj(Vec::new())));
                self.set_reg(dst, Value::object(h));
                self.advance();
            }
            Op::MapSet { map, key, value } => {
                let k = self.reg(key);
                let v = self.reg(value);
                let h = self.reg(map).as_object().ok_or_else(|| {
                    VmError::Type("mset: target is not a map".into())
                })?;
                match self.heap.get_mut(h) {
                    Obj::Map(m) => m.set(k, v),
                    _ => return Err(VmError::Type("mset: target is not a map".into())),
                }
                self.advance();
            }
            Op::MapSpread { map, iterable } => {
                let src_h = self.reg(iterable).as_object().ok_or_else(|| {
                    VmError::Type("mspread: source is not a map".into())
                })?;
                let entries = match self.heap.get(src_h) {
                    Obj::Map(m) => m.snapshot(),
                    _ => return Err(VmError::Type("mspread: source is not a map".into())),
                };
                let dst_h = self.reg(map).as_object().ok_or_else(|| {
                    VmError::Type("mspread: target is not a map".into())
                })?;
                match self.heap.get_mut(dst_h) {
                    Obj::Map(m) => {
                        for (k, v) in entries {
                            m.set(k, v);
                        }
                    }
                    _ => return Err(VmError::Type("mspread: target is not a map".into())),
                }
                self.advance();
            }
            Op::MapGet { dst, map, key } => {
                let k = self.reg(key);
                let h = self.reg(map).as_object().ok_or_else(|| {
                    VmError::Type("mget: target is not a map".into())
                })?;
                let v = match self.heap.get(h) {
                    Obj::Map(m) => m.get(k).unwrap_or_else(Value::null),
                    _ => return Err(VmError::Type("mget: target is not a map".into())),
                };
                self.set_reg(dst, v);
                self.advance();
            }

            Op::NewStruct { dst, schema } => {
                let schema_h = self.load_const_handle(schema)?;
                let field_count = match self.heap.get(schema_h) {
                    Obj::StructSchema(s) => s.fields.len(),
                    _ => return Err(VmError::Type("newstruct: not a struct schema".into())),
                };
                let h = self.heap.alloc(Obj::StructInstance(StructInstanceObj {
                    schema: schema_h,
                    fields: vec![Value::null(); field_count],
                }));
                self.set_reg(dst, Value::object(h));
                self.advance();
            }
            Op::StructGetField { dst, instance, field } => {
                let inst_h = self.reg(instance).as_object().ok_or_else(|| {
                    VmError::Type("sfget: not a struct instance".into())
                })?;
                let field_name = self.const_string(field)?;
                let v = self.struct_field(inst_h, &field_name, |fields, idx| fields[idx])?;
                self.set_reg(dst, v);
                self.advance();
            }
            Op::StructSetField { instance, field, value } => {
                let inst_h = self.reg(instance).as_object().ok_or_else(|| {
                    VmError::Type("sfset: not a struct instance".into())
                })?;
                let field_name = self.const_string(field)?;
                let v = self.reg(value);
                self.struct_field(inst_h, &field_name, |fields, idx| {
                    fields[idx] = v;
                    v
                })?;
                self.advance();
            }

            Op::NewDispatcher { dst, name } => {
                let name_str = self.const_string(name)?;
                let name_h = self.heap.intern(&name_str);
                let h = self.heap.alloc(Obj::Dispatcher(DispatcherObj {
                    name: name_h,
                    by_arity: Vec::new(),
                }));
                self.set_reg(dst, Value::object(h));
                self.advance();
            }

            Op::MakeRef { dst, target } => {
                let base = self.frames.last().unwrap().stack_base;
                let h = self
                    .heap
                    .alloc(Obj::Reference(ReferenceObj(ReferenceKind::Local(base + target as usize))));
                self.set_reg(dst, Value::object(h));
                self.advance();
            }
            Op::SlotMakeRef { dst, target } => {
                let base = self.frames.last().unwrap().stack_base;
                let h = self
                    .heap
                    .alloc(Obj::Reference(ReferenceObj(ReferenceKind::Local(base + target as usize))));
                self.set_reg(dst, Value::object(h));
                self.advance();
            }
            Op::MakeGlobalRef { dst, name } => {
                let key = self.const_string(name)?;
                let name_h = self.heap.intern(&key);
                let h = self
                    .heap
                    .alloc(Obj::Reference(ReferenceObj(ReferenceKind::Global(name_h))));
                self.set_reg(dst, Value::object(h));
                self.advance();
            }
            Op::MakeIndexRef { dst, container, index } => {
                let c = self.reg(container);
                let i = self.reg(index);
                let h = self
                    .heap
                    .alloc(Obj::Reference(ReferenceObj(ReferenceKind::Index(c, i))));
                self.set_reg(dst, Value::object(h));
                self.advance();
            }
            Op::MakePropertyRef { dst, container, key } => {
                let c = self.reg(container);
                let k = self.reg(key);
                let h = self
                    .heap
                    .alloc(Obj::Reference(ReferenceObj(ReferenceKind::Property(c, k))));
                self.set_reg(dst, Value::object(h));
                self.advance();
            }
            Op::DerefGet { dst, r } => {
                let v = self.deref_get(self.reg(r))?;
                self.set_reg(dst, v);
                self.advance();
            }
            Op::DerefSet { r, value } | Op::SlotDerefSet { r, value } => {
                let v = self.reg(value);
                self.deref_set(self.reg(r), v)?;
                self.advance();
            }

            Op::IncDec { kind, dst, src } => {
                use crate::bytecode::opcode::IncDecKind::*;
                let x = self.reg(src).as_number().ok_or_else(|| {
                    VmError::Type("inc/dec: operand is not a number".into())
                })?;
                let (new_val, result) = match kind {
                    PreInc => (x + 1.0, x + 1.0),
                    PreDec => (x - 1.0, x - 1.0),
                    PostInc => (x + 1.0, x),
                    PostDec => (x - 1.0, x),
                };
                self.set_reg(src, Value::number(new_val));
                self.set_reg(dst, Value::number(result));
                self.advance();
            }

            Op::TypeOf { dst, src } => {
                let v = self.reg(src);
                let name = self.type_name_of(v);
                let h = self.heap.intern(name);
                self.set_reg(dst, Value::object(h));
                self.advance();
            }

            Op::Print { src } => {
                let v = self.reg(src);
                #[cfg(feature = "tracing")]
                tracing::info!(?v, "print");
                #[cfg(not(feature = "tracing"))]
                let _ = v;
                self.advance();
            }

            Op::PushPrompt { tag } => {
                let v = self.reg(tag);
                let id = self.prompt_tag_id(v)?;
                let tag_handle = v.as_object().expect("prompt_tag_id already validated this is an object");
                if self.prompts.len() >= self.limits.prompt_capacity {
                    return Err(VmError::Bounds(BoundsKind::PromptOverflow {
                        capacity: self.limits.prompt_capacity,
                    }));
                }
                self.prompts.push(id, tag_handle, self.frames.len(), self.stack.len());
                self.advance();
            }
            Op::PopPrompt => {
                self.prompts.pop();
                self.advance();
            }

            Op::Capture { dst, tag } => {
                // Advance first: the captured frame's saved ip must
                // point past this instruction, so a later `resume`
                // continues after `capture` instead of re-running it.
                self.advance();
                self.do_capture(dst, tag)?;
            }
            Op::Resume { dst, cont, value } => {
                self.advance();
                self.do_resume(dst, cont, value)?;
            }
            Op::Abort { tag, value } => {
                self.do_abort(tag, value)?;
            }
            Op::Shift { dst, tag, handler } => {
                self.advance();
                self.do_shift(dst, tag, handler)?;
            }
        }
        Ok(())
    }

    fn load_const(&mut self, k: u16) -> VmResult<Value> {
        let frame = self.frames.last().expect("load_const: no active frame");
        match frame.chunk.consts.get(k) {
            Some(crate::bytecode::chunk::ConstValue::Number(n)) => Ok(Value::number(*n)),
            Some(crate::bytecode::chunk::ConstValue::Str(s)) => {
                let s = s.clone();
                Ok(Value::object(self.heap.intern(&s)))
            }
            Some(crate::bytecode::chunk::ConstValue::Function(_)) => {
                Err(VmError::Type("LOAD_CONST cannot load a function prototype directly; use CLOSURE".into()))
            }
            None => Err(VmError::Fatal(format!("constant index {k} out of range"))),
        }
    }

    fn const_string(&self, k: u16) -> VmResult<String> {
        let frame = self.frames.last().expect("const_string: no active frame");
        match frame.chunk.consts.get(k) {
            Some(crate::bytecode::chunk::ConstValue::Str(s)) => Ok(s.clone()),
            _ => Err(VmError::Fatal(format!("constant {k} is not a string"))),
        }
    }

    fn load_const_handle(&mut self, k: u16) -> VmResult<HeapHandle> {
        // Struct/enum schema constants are registered globally by name
        // at load time (see `vitte-vm`'s chunk-lifecycle ops); here we
        // resolve by the constant's interned string naming the schema.
        let name = self.const_string(k)?;
        self.globals
            .get(&name)
            .and_then(|v| v.as_object())
            .ok_or_else(|| VmError::Undefined(name))
    }

    fn struct_field<R>(
        &mut self,
        instance: HeapHandle,
        field_name: &str,
        f: impl FnOnce(&mut [Value], usize) -> R,
    ) -> VmResult<R> {
        let schema_h = match self.heap.get(instance) {
            Obj::StructInstance(i) => i.schema,
            _ => return Err(VmError::Type("not a struct instance".into())),
        };
        let idx = match self.heap.get(schema_h) {
            Obj::StructSchema(s) => s
                .fields
                .iter()
                .position(|&h| self.obj_string(h) == field_name)
                .ok_or_else(|| VmError::Undefined(field_name.to_owned()))?,
            _ => return Err(VmError::Fatal("struct instance's schema handle is invalid".into())),
        };
        match self.heap.get_mut(instance) {
            Obj::StructInstance(i) => Ok(f(&mut i.fields, idx)),
            _ => unreachable!(),
        }
    }

    fn type_name_of(&self, v: Value) -> &'static str {
        if v.is_null() {
            "null"
        } else if v.is_bool() {
            "bool"
        } else if v.is_number() {
            "number"
        } else if v.is_enum() {
            "enum"
        } else if let Some(h) = v.as_object() {
            self.heap.get(h).type_name()
        } else {
            "unknown"
        }
    }

    fn make_closure(&mut self, func_idx: u32) -> VmResult<Value> {
        let proto = {
            let frame = self.frames.last().expect("make_closure: no active frame");
            match frame.chunk.consts.get(func_idx as u16) {
                Some(crate::bytecode::chunk::ConstValue::Function(p)) => p.clone(),
                _ => return Err(VmError::Fatal(format!("constant {func_idx} is not a function prototype"))),
            }
        };

        let name_h = self.heap.intern(&proto.name);
        let descs = proto.upvalue_descriptors.clone();
        let function_h = self.heap.alloc(Obj::Function(FunctionObj {
            arity: proto.arity,
            max_regs: proto.max_regs,
            chunk: std::rc::Rc::new((*proto.chunk).clone()),
            name: Some(name_h),
            module_name: None,
            upvalue_descriptors: descs.clone(),
            param_qualifiers: Vec::new(),
            qualifier_signature: QualifierSignature::AllNormalNoRefs,
        }));

        let base = self.frames.last().unwrap().stack_base;
        let mut upvalues = Vec::with_capacity(descs.len());
        for desc in descs {
            let h = match desc {
                UpvalueDesc::Local(slot) => {
                    self.open_upvalues.find_or_open(&mut self.heap, base + slot as usize)
                }
                UpvalueDesc::Upvalue(idx) => {
                    let closure = self.frames.last().unwrap().closure;
                    match self.heap.get(closure) {
                        Obj::Closure(c) => c.upvalues[idx as usize],
                        _ => return Err(VmError::Fatal("enclosing closure handle is invalid".into())),
                    }
                }
            };
            upvalues.push(h);
        }

        let closure_h = self.heap.alloc(Obj::Closure(ClosureObj { function: function_h, upvalues }));
        Ok(Value::object(closure_h))
    }

    fn read_upvalue(&self, idx: u16) -> VmResult<Value> {
        let closure = self.frames.last().expect("read_upvalue: no active frame").closure;
        let up_h = match self.heap.get(closure) {
            Obj::Closure(c) => c.upvalues[idx as usize],
            _ => return Err(VmError::Fatal("read_upvalue: active closure handle is invalid".into())),
        };
        match self.heap.get(up_h) {
            Obj::Upvalue(u) => Ok(match u.state {
                crate::object::UpvalueState::Open(addr) => self.stack[addr],
                crate::object::UpvalueState::Closed(v) => v,
            }),
            _ => Err(VmError::Fatal("upvalue handle is invalid".into())),
        }
    }

    fn write_upvalue(&mut self, idx: u16, v: Value) -> VmResult<()> {
        let closure = self.frames.last().expect("write_upvalue: no active frame").closure;
        let up_h = match self.heap.get(closure) {
            Obj::Closure(c) => c.upvalues[idx as usize],
            _ => return Err(VmError::Fatal("write_upvalue: active closure handle is invalid".into())),
        };
        let addr_if_open = match self.heap.get(up_h) {
            Obj::Upvalue(u) => match u.state {
                crate::object::UpvalueState::Open(addr) => Some(addr),
                crate::object::UpvalueState::Closed(_) => None,
            },
            _ => return Err(VmError::Fatal("upvalue handle is invalid".into())),
        };
        match addr_if_open {
            Some(addr) => self.stack[addr] = v,
            None => {
                if let Obj::Upvalue(u) = self.heap.get_mut(up_h) {
                    u.state = crate::object::UpvalueState::Closed(v);
                }
            }
        }
        Ok(())
    }

    fn deref_get(&self, r: Value) -> VmResult<Value> {
        let h = r.as_object().ok_or_else(|| VmError::Type("deref: not a reference".into()))?;
        match self.heap.get(h) {
            Obj::Reference(ReferenceObj(kind)) => match kind {
                ReferenceKind::Local(addr) => Ok(self.stack[*addr]),
                ReferenceKind::Global(name_h) => {
                    let name = self.obj_string(*name_h).to_owned();
                    self.globals.get(&name).copied().ok_or(VmError::Undefined(name))
                }
                ReferenceKind::Upvalue(up_h) => match self.heap.get(*up_h) {
                    Obj::Upvalue(u) => Ok(match u.state {
                        crate::object::UpvalueState::Open(addr) => self.stack[addr],
                        crate::object::UpvalueState::Closed(v) => v,
                    }),
                    _ => Err(VmError::Fatal("upvalue handle is invalid".into())),
                },
                ReferenceKind::Index(container, index) => self.index_get(*container, *index),
                ReferenceKind::Property(container, key) => self.property_get(*container, *key),
            },
            _ => Err(VmError::Type("deref: not a reference".into())),
        }
    }

    fn deref_set(&mut self, r: Value, v: Value) -> VmResult<()> {
        let h = r.as_object().ok_or_else(|| VmError::Type("deref: not a reference".into()))?;
        let kind = match self.heap.get(h) {
            Obj::Reference(ReferenceObj(kind)) => kind.clone_for_write(),
            _ => return Err(VmError::Type("deref: not a reference".into())),
        };
        match kind {
            ReferenceKind::Local(addr) => self.stack[addr] = v,
            ReferenceKind::Global(name_h) => {
                let name = self.obj_string(name_h).to_owned();
                self.globals.insert(name, v);
            }
            ReferenceKind::Upvalue(up_h) => {
                let addr_if_open = match self.heap.get(up_h) {
                    Obj::Upvalue(u) => match u.state {
                        crate::object::UpvalueState::Open(addr) => Some(addr),
                        crate::object::UpvalueState::Closed(_) => None,
                    },
                    _ => return Err(VmError::Fatal("upvalue handle is invalid".into())),
                };
                match addr_if_open {
                    Some(addr) => self.stack[addr] = v,
                    None => {
                        if let Obj::Upvalue(u) = self.heap.get_mut(up_h) {
                            u.state = crate::object::UpvalueState::Closed(v);
                        }
                    }
                }
            }
            ReferenceKind::Index(container, index) => self.index_set(container, index, v)?,
            ReferenceKind::Property(container, key) => self.property_set(container, key, v)?,
        }
        Ok(())
    }

    fn index_get(&self, container: Value, index: Value) -> VmResult<Value> {
        let h = container.as_object().ok_or_else(|| VmError::Type("index: not a list".into()))?;
        let idx = index.as_number().unwrap_or(-1.0) as i64;
        match self.heap.get(h) {
            Obj::List(l) => {
                let len = l.0.len();
                if idx < 0 || idx as usize >= len {
                    return Err(VmError::Bounds(BoundsKind::ListIndex { index: idx, len }));
                }
                Ok(l.0[idx as usize])
            }
            Obj::Map(m) => Ok(m.get(index).unwrap_or_else(Value::null)),
            _ => Err(VmError::Type("index: not a list or map".into())),
        }
    }

    fn index_set(&mut self, container: Value, index: Value, v: Value) -> VmResult<()> {
        let h = container.as_object().ok_or_else(|| VmError::Type("index: not a list".into()))?;
        let idx = index.as_number().unwrap_or(-1.0) as i64;
        match self.heap.get_mut(h) {
            Obj::List(l) => {
                let len = l.0.len();
                if idx < 0 || idx as usize >= len {
                    return Err(VmError::Bounds(BoundsKind::ListIndex { index: idx, len }));
                }
                l.0[idx as usize] = v;
                Ok(())
            }
            Obj::Map(m) => {
                m.set(index, v);
                Ok(())
            }
            _ => Err(VmError::Type("index: not a list or map".into())),
        }
    }

    fn property_get(&self, container: Value, key: Value) -> VmResult<Value> {
        let h = container.as_object().ok_or_else(|| VmError::Type("property: not a struct".into()))?;
        let key_h = key.as_object().ok_or_else(|| VmError::Type("property: key is not a string".into()))?;
        let name = self.obj_string(key_h).to_owned();
        self.struct_field_ref(h, &name)
    }

    fn property_set(&mut self, container: Value, key: Value, v: Value) -> VmResult<()> {
        let h = container.as_object().ok_or_else(|| VmError::Type("property: not a struct".into()))?;
        let key_h = key.as_object().ok_or_else(|| VmError::Type("property: key is not a string".into()))?;
        let name = self.obj_string(key_h).to_owned();
        self.struct_field(h, &name, |fields, idx| fields[idx] = v)
    }

    fn struct_field_ref(&self, instance: HeapHandle, field_name: &str) -> VmResult<Value> {
        let schema_h = match self.heap.get(instance) {
            Obj::StructInstance(i) => i.schema,
            _ => return Err(VmError::Type("not a struct instance".into())),
        };
        let idx = match self.heap.get(schema_h) {
            Obj::StructSchema(s) => s
                .fields
                .iter()
                .position(|&h| self.obj_string(h) == field_name)
                .ok_or_else(|| VmError::Undefined(field_name.to_owned()))?,
            _ => return Err(VmError::Fatal("struct instance's schema handle is invalid".into())),
        };
        match self.heap.get(instance) {
            Obj::StructInstance(i) => Ok(i.fields[idx]),
            _ => unreachable!(),
        }
    }

    fn prompt_tag_id(&self, v: Value) -> VmResult<PromptTagId> {
        let h = v.as_object().ok_or_else(|| VmError::Type("not a prompt tag".into()))?;
        match self.heap.get(h) {
            Obj::PromptTag(PromptTagObj { id, .. }) => Ok(*id),
            _ => Err(VmError::Type("not a prompt tag".into())),
        }
    }

    fn do_return(&mut self, v: Value) -> VmResult<()> {
        let frame = self.frames.pop().expect("do_return: no active frame to return from");
        self.open_upvalues.close_from(&mut self.heap, &self.stack, frame.stack_base);
        self.stack.truncate(frame.stack_base);
        if self.frames.is_empty() {
            self.stack.resize(frame.return_slot + 1, Value::null());
        }
        self.stack[frame.return_slot] = v;
        self.maybe_collect();
        Ok(())
    }

    fn gather_args(&self, callee: u8, argc: u8) -> Vec<Value> {
        let base = self.frames.last().unwrap().stack_base;
        (1..=argc).map(|i| self.stack[base + callee as usize + i as usize]).collect()
    }

    /// A `typeof`-qualified argument's substituted value: the runtime
    /// type name of whatever sits in the register, as an interned string.
    fn value_type_name(&self, v: Value) -> &'static str {
        if v.is_null() {
            "Null"
        } else if v.is_bool() {
            "Bool"
        } else if v.is_number() {
            "Number"
        } else if v.is_enum() {
            "Enum"
        } else if let Some(h) = v.as_object() {
            self.heap.get(h).type_name()
        } else {
            "Value"
        }
    }

    /// A `clone`-qualified argument's substituted value: a fresh heap
    /// allocation holding a shallow copy of the source object, or the
    /// value itself unchanged when it isn't a clonable heap object.
    fn shallow_clone(&mut self, v: Value) -> Value {
        let Some(h) = v.as_object() else { return v };
        let cloned = match self.heap.get(h) {
            Obj::List(l) => Obj::List(ListObj(l.0.clone())),
            Obj::Map(m) => Obj::Map(MapObj(m.0.clone())),
            Obj::String(s) => {
                Obj::String(StringObj { bytes: s.bytes.clone(), hash: s.hash, char_len: s.char_len })
            }
            _ => return v,
        };
        Value::object(self.heap.alloc(cloned))
    }

    /// Builds a native call's argument vector by applying each
    /// parameter's qualifier to its register (spec §4.8): `ref`/`slot`
    /// box a reference to the register's own stack slot, `val` follows
    /// through an existing reference if the register happens to hold
    /// one, `clone` shallow-copies, and `typeof` substitutes the
    /// argument's runtime type name.
    fn gather_args_qualified(
        &mut self,
        base: usize,
        callee: u8,
        argc: u8,
        qualifiers: &[Qualifier],
    ) -> VmResult<Vec<Value>> {
        let mut out = Vec::with_capacity(argc as usize);
        for i in 0..argc as usize {
            let addr = base + callee as usize + 1 + i;
            let raw = self.stack[addr];
            let qualifier = qualifiers.get(i).copied().unwrap_or(Qualifier::Val);
            let materialized = match qualifier {
                Qualifier::Val => match raw.as_object() {
                    Some(h) if matches!(self.heap.get(h), Obj::Reference(_)) => self.deref_get(raw)?,
                    _ => raw,
                },
                Qualifier::Ref | Qualifier::Slot => {
                    let handle = self.heap.alloc(Obj::Reference(ReferenceObj(ReferenceKind::Local(addr))));
                    Value::object(handle)
                }
                Qualifier::Clone => self.shallow_clone(raw),
                Qualifier::TypeOf => {
                    let name = self.value_type_name(raw);
                    Value::object(self.heap.intern(name))
                }
            };
            out.push(materialized);
        }
        Ok(out)
    }

    /// Picks plain register values for a closure call or an all-`val`
    /// native, and qualifier-materialized ones for any native whose
    /// signature asks for something else.
    fn gather_call_args(&mut self, base: usize, callee: u8, argc: u8, callee_val: Value) -> VmResult<Vec<Value>> {
        let qualifiers = match callee_val.as_object().map(|h| self.heap.get(h)) {
            Some(Obj::NativeFunction(nf)) if nf.qualifier_signature != QualifierSignature::AllNormal => {
                Some(nf.qualifiers.clone())
            }
            _ => None,
        };
        match qualifiers {
            Some(qualifiers) => self.gather_args_qualified(base, callee, argc, &qualifiers),
            None => Ok(self.gather_args(callee, argc)),
        }
    }

    fn do_dispatched_call(&mut self, callee: u8, argc: u8, tail: bool, smart: bool) -> VmResult<()> {
        let base = self.frames.last().unwrap().stack_base;
        let callee_val = self.stack[base + callee as usize];
        let args = self.gather_call_args(base, callee, argc, callee_val)?;
        let return_slot = base + callee as usize;

        if tail {
            let reuse_current = smart
                && callee_val
                    .as_object()
                    .map(|h| self.heap.get(h).type_name() == "Closure")
                    .unwrap_or(false);
            let _ = reuse_current; // smart selection currently degrades to a plain tail call
            let frame = self.frames.pop().expect("tail call with no active frame");
            self.open_upvalues.close_from(&mut self.heap, &self.stack, frame.stack_base);
            self.stack.truncate(frame.stack_base);
            let outer_return_slot = frame.return_slot;
            self.do_call(callee_val, &args, outer_return_slot)?;
        } else {
            // Advance the *caller* before dispatching: for a closure callee,
            // `do_call` pushes a new frame, after which `frames.last_mut()`
            // is the callee, not the caller. Advancing first means the
            // caller's saved `ip` already points past this `Call` by the
            // time it's resumed on return.
            self.advance();
            self.do_call(callee_val, &args, return_slot)?;
        }
        Ok(())
    }

    fn do_self_tail_call(&mut self, argc: u8) -> VmResult<()> {
        let frame = self.frames.last().unwrap();
        let base = frame.stack_base;
        let closure = frame.closure;
        let args: Vec<Value> = (0..argc).map(|i| self.stack[base + 1 + i as usize]).collect();
        let max_regs = match self.heap.get(closure) {
            Obj::Closure(c) => match self.heap.get(c.function) {
                Obj::Function(f) => f.max_regs,
                _ => return Err(VmError::Fatal("self-tail-call: function handle invalid".into())),
            },
            _ => return Err(VmError::Fatal("self-tail-call: closure handle invalid".into())),
        };
        self.open_upvalues.close_from(&mut self.heap, &self.stack, base);
        self.stack.truncate(base);
        self.stack.resize(base + max_regs as usize, Value::null());
        for (i, a) in args.into_iter().enumerate() {
            self.stack[base + i] = a;
        }
        let frame = self.frames.last_mut().unwrap();
        frame.ip = 0;
        Ok(())
    }

    fn do_call(&mut self, callee: Value, args: &[Value], return_slot: usize) -> VmResult<()> {
        let handle = callee
            .as_object()
            .ok_or_else(|| VmError::Type("call target is not callable".into()))?;
        match self.heap.get(handle) {
            Obj::Closure(c) => {
                let function_handle = c.function;
                let (chunk, arity, max_regs) = match self.heap.get(function_handle) {
                    Obj::Function(f) => (f.chunk.clone(), f.arity, f.max_regs),
                    _ => return Err(VmError::Fatal("closure points to a non-function".into())),
                };
                if args.len() != arity as usize {
                    return Err(VmError::Arity { expected: arity, got: args.len() as u8 });
                }
                if self.frames.len() >= self.limits.frame_capacity {
                    return Err(VmError::Bounds(BoundsKind::FrameOverflow {
                        capacity: self.limits.frame_capacity,
                    }));
                }
                let stack_base = self.stack.len();
                if stack_base + max_regs as usize > self.limits.stack_capacity {
                    return Err(VmError::Bounds(BoundsKind::StackOverflow {
                        capacity: self.limits.stack_capacity,
                    }));
                }
                self.stack.resize(stack_base + max_regs as usize, Value::null());
                for (i, a) in args.iter().enumerate() {
                    self.stack[stack_base + i] = *a;
                }
                self.frames.push(CallFrame::new(handle, chunk, stack_base, return_slot));
                Ok(())
            }
            Obj::NativeFunction(nf) => {
                if args.len() != nf.arity as usize {
                    return Err(VmError::Arity { expected: nf.arity, got: args.len() as u8 });
                }
                let func = nf.func;
                let result = func(self, args);
                if self.stack.len() <= return_slot {
                    self.stack.resize(return_slot + 1, Value::null());
                }
                if !result.is_control_transfer() {
                    self.stack[return_slot] = result;
                }
                Ok(())
            }
            Obj::NativeClosure(nc) => {
                let func = nc.func;
                let ctx = nc.context;
                let result = func(self, ctx, args);
                if self.stack.len() <= return_slot {
                    self.stack.resize(return_slot + 1, Value::null());
                }
                if !result.is_control_transfer() {
                    self.stack[return_slot] = result;
                }
                Ok(())
            }
            Obj::Dispatcher(d) => {
                let chosen = d
                    .by_arity
                    .get(args.len())
                    .copied()
                    .flatten()
                    .ok_or_else(|| VmError::Arity { expected: 0, got: args.len() as u8 })?;
                self.do_call(Value::object(chosen), args, return_slot)
            }
            other => Err(VmError::Type(format!("value of type {} is not callable", other.type_name()))),
        }
    }

    /// The frame whose `return_slot` receives whatever capture/abort/
    /// shift delivers: normally the first frame pushed after the
    /// prompt (so the delivered value lands in the register where that
    /// call's result was headed), but when capture/shift/abort run in
    /// the very frame that pushed the prompt — no intervening call —
    /// there is no such frame yet, so it falls back to the prompt-
    /// pushing frame's own `return_slot` (one level further out, in
    /// its caller's window).
    fn prompt_boundary(&self, entry: &PromptEntry) -> usize {
        entry.frame_index.min(self.frames.len().saturating_sub(1))
    }

    fn do_capture(&mut self, dst: u8, tag: u8) -> VmResult<()> {
        let base = self.frames.last().unwrap().stack_base;
        let tag_id = self.prompt_tag_id(self.stack[base + tag as usize])?;
        let entry = self
            .prompts
            .find_innermost(tag_id)
            .ok_or(VmError::ControlEffect(ControlEffectKind::MissingPrompt(tag_id)))?;
        let deliver_slot = self.frames[self.prompt_boundary(&entry)].return_slot;
        let resume_slot = base + dst as usize;
        let pos = self.prompts.position_innermost(tag_id).unwrap();
        self.prompts.truncate(pos);
        let cont_obj = prompt::capture_slice(&mut self.frames, &mut self.stack, entry, resume_slot);
        let handle = self.heap.alloc(Obj::Continuation(cont_obj));
        if self.stack.len() <= deliver_slot {
            self.stack.resize(deliver_slot + 1, Value::null());
        }
        self.stack[deliver_slot] = Value::object(handle);
        Ok(())
    }

    fn do_abort(&mut self, tag: u8, value: u8) -> VmResult<()> {
        let base = self.frames.last().unwrap().stack_base;
        let tag_id = self.prompt_tag_id(self.stack[base + tag as usize])?;
        let value_v = self.stack[base + value as usize];
        let entry = self
            .prompts
            .find_innermost(tag_id)
            .ok_or(VmError::ControlEffect(ControlEffectKind::MissingPrompt(tag_id)))?;
        let boundary = self.prompt_boundary(&entry);
        let deliver_slot = self.frames[boundary].return_slot;
        self.open_upvalues.close_from(&mut self.heap, &self.stack, entry.stack_base);
        self.frames.truncate(boundary);
        self.stack.truncate(entry.stack_base);
        let pos = self.prompts.position_innermost(tag_id).unwrap();
        self.prompts.truncate(pos);
        if self.stack.len() <= deliver_slot {
            self.stack.resize(deliver_slot + 1, Value::null());
        }
        self.stack[deliver_slot] = value_v;
        Ok(())
    }

    fn do_resume(&mut self, _dst: u8, cont: u8, value: u8) -> VmResult<()> {
        let base = self.frames.last().unwrap().stack_base;
        let cont_val = self.stack[base + cont as usize];
        let value_v = self.stack[base + value as usize];
        let handle = cont_val
            .as_object()
            .ok_or_else(|| VmError::Type("resume: not a continuation".into()))?;

        if self.resume_depth >= self.limits.resume_capacity {
            return Err(VmError::Bounds(BoundsKind::ResumeOverflow {
                capacity: self.limits.resume_capacity,
            }));
        }

        let (tag, tag_handle) = match self.heap.get(handle) {
            Obj::Continuation(c) => (c.prompt_tag, c.prompt_tag_handle),
            _ => return Err(VmError::Type("resume: handle is not a continuation".into())),
        };
        let frame_floor = self.frames.len();
        let stack_floor = self.stack.len();
        {
            let cont = match self.heap.get_mut(handle) {
                Obj::Continuation(c) => c,
                _ => unreachable!(),
            };
            prompt::splice_resume(&mut self.frames, &mut self.stack, cont, value_v)
                .map_err(VmError::ControlEffect)?;
        }
        self.prompts.push(tag, tag_handle, frame_floor, stack_floor);
        self.resume_depth += 1;
        Ok(())
    }

    fn do_shift(&mut self, dst: u8, tag: u8, handler: u8) -> VmResult<()> {
        let base = self.frames.last().unwrap().stack_base;
        let tag_id = self.prompt_tag_id(self.stack[base + tag as usize])?;
        let handler_val = self.stack[base + handler as usize];
        let entry = self
            .prompts
            .find_innermost(tag_id)
            .ok_or(VmError::ControlEffect(ControlEffectKind::MissingPrompt(tag_id)))?;
        let deliver_slot = self.frames[self.prompt_boundary(&entry)].return_slot;
        let resume_slot = base + dst as usize;
        let pos = self.prompts.position_innermost(tag_id).unwrap();
        self.prompts.truncate(pos);
        let cont_obj = prompt::capture_slice(&mut self.frames, &mut self.stack, entry, resume_slot);
        let cont_handle = self.heap.alloc(Obj::Continuation(cont_obj));
        self.do_call(handler_val, &[Value::object(cont_handle)], deliver_slot)
    }
}

impl Trace for Vm {
    fn roots(&self) -> Vec<HeapHandle> {
        let mut roots: Vec<HeapHandle> = self.frames.iter().map(|f| f.closure).collect();
        roots.extend(self.natives.values().copied());
        roots.extend(self.prompts.tag_handles());
        roots
    }

    fn root_values(&self) -> Vec<Value> {
        let mut values = self.stack.clone();
        values.extend(self.globals.values().copied());
        values.extend(self.temp_roots.iter().copied());
        values
    }
}

/// An owned copy of one `Trace` query, used so `collect_garbage` can
/// hand `gc::collect` a root set without holding a borrow of `self`
/// alongside `&mut self.heap`.
struct RootSnapshot {
    roots: Vec<HeapHandle>,
    root_values: Vec<Value>,
}

impl Trace for RootSnapshot {
    fn roots(&self) -> Vec<HeapHandle> {
        self.roots.clone()
    }

    fn root_values(&self) -> Vec<Value> {
        self.root_values.clone()
    }
}

impl ReferenceKind {
    fn clone_for_write(&self) -> ReferenceKind {
        match self {
            ReferenceKind::Local(a) => ReferenceKind::Local(*a),
            ReferenceKind::Global(h) => ReferenceKind::Global(*h),
            ReferenceKind::Upvalue(h) => ReferenceKind::Upvalue(*h),
            ReferenceKind::Index(c, i) => ReferenceKind::Index(*c, *i),
            ReferenceKind::Property(c, k) => ReferenceKind::Property(*c, *k),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::chunk::Chunk;
    use crate::bytecode::opcode::{ArithOp, Op};
    use crate::object::{FunctionObj, QualifierSignature};
    use std::rc::Rc;

    fn make_vm() -> Vm {
        Vm::new(VmLimits::default(), PreemptConfig::default())
    }

    fn make_closure_for(vm: &mut Vm, chunk: Chunk, arity: u8, max_regs: u16) -> Value {
        let function_h = vm.heap.alloc(Obj::Function(FunctionObj {
            arity,
            max_regs,
            chunk: Rc::new(chunk),
            name: None,
            module_name: None,
            upvalue_descriptors: Vec::new(),
            param_qualifiers: Vec::new(),
            qualifier_signature: QualifierSignature::AllNormalNoRefs,
        }));
        let closure_h = vm.heap.alloc(Obj::Closure(ClosureObj { function: function_h, upvalues: Vec::new() }));
        Value::object(closure_h)
    }

    #[test]
    fn simple_arithmetic_and_return() {
        let mut vm = make_vm();
        let mut chunk = Chunk::new();
        let k = chunk.consts.push_number(2.0);
        chunk.push_op(Op::LoadConst { dst: 0, k }, 1);
        chunk.push_op(Op::ArithRR { op: ArithOp::Add, dst: 1, lhs: 0, rhs: 0 }, 1);
        chunk.push_op(Op::Return { src: 1 }, 1);
        let closure = make_closure_for(&mut vm, chunk, 0, 2);
        let result = vm.call(closure, &[]).expect("call should succeed");
        assert_eq!(result.as_number(), Some(4.0));
    }

    #[test]
    fn undefined_global_is_an_error() {
        let mut vm = make_vm();
        let mut chunk = Chunk::new();
        let name = chunk.consts.push_string("missing");
        chunk.push_op(Op::GetGlobal { dst: 0, name }, 1);
        chunk.push_op(Op::Return { src: 0 }, 1);
        let closure = make_closure_for(&mut vm, chunk, 0, 1);
        let err = vm.call(closure, &[]).unwrap_err();
        assert_eq!(err.kind, VmError::Undefined("missing".into()));
    }

    #[test]
    fn list_bounds_violation_is_reported() {
        let mut vm = make_vm();
        let mut chunk = Chunk::new();
        chunk.push_op(Op::NewList { dst: 0 }, 1);
        let idx = chunk.consts.push_number(0.0);
        chunk.push_op(Op::LoadConst { dst: 1, k: idx }, 1);
        chunk.push_op(Op::ListGet { dst: 2, list: 0, index: 1 }, 1);
        chunk.push_op(Op::Return { src: 2 }, 1);
        let closure = make_closure_for(&mut vm, chunk, 0, 3);
        let err = vm.call(closure, &[]).unwrap_err();
        assert_eq!(err.kind, VmError::Bounds(BoundsKind::ListIndex { index: 0, len: 0 }));
    }
}
