//! vitte-vm — Host embedding surface for the Vitte VM.
//!
//! `vitte-core` is the execution engine: value model, heap, GC,
//! bytecode, and the register interpreter, with no I/O of its own.
//! This crate is what an embedder actually links against: VM
//! lifecycle and configuration ([`Vm`], [`VmConfig`]), native-function
//! registration, convenience constructors/inspectors for lists, maps,
//! structs, enums and references, the temp-root stack facade, chunk
//! (de)serialization, and `call`/`callv`. It is the only place that
//! touches `std::io` or wall-clock time; everything fallible returns
//! `anyhow::Result`, matching the teacher's own mini-VM.
//!
//! ### Example
//!
//! ```no_run
//! use vitte_vm::Vm;
//!
//! let mut vm = Vm::new();
//! let list = vm.new_list();
//! vm.list_push(list, vitte_core::Value::number(1.0)).unwrap();
//! assert_eq!(vm.list_len(list).unwrap(), 1);
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![cfg_attr(not(debug_assertions), warn(missing_docs))]

use std::any::Any;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};

use vitte_core::bytecode::Chunk;
use vitte_core::interpreter::Vm as CoreVm;
use vitte_core::interpreter::VmLimits;
pub use vitte_core::object::{Finalizer, GetHook, NativeClosureFn, NativeFn, SetHook};
use vitte_core::object::{
    ClosureObj, DispatcherObj, EnumSchemaObj, FunctionObj, HeapHandle, ListObj, MapObj,
    NativeClosureObj, NativeContextObj, NativeReferenceObj, Obj, PromptTagId, PromptTagObj,
    QualifierSignature, ReferenceKind, ReferenceObj, StructInstanceObj, StructSchemaObj,
    UpvalueState,
};
use vitte_core::preempt::PreemptConfig;
pub use vitte_core::{ChunkLoadError, HeapHandle as Handle, Obj as Object, RuntimeError, Value, VmError};

/// Construction-time limits and preemption defaults, mirroring the
/// core's `VmLimits`/`PreemptConfig` but collected into a single
/// builder-ish config struct (teacher idiom: `VmOptions`).
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    pub stack_capacity: usize,
    pub frame_capacity: usize,
    pub prompt_capacity: usize,
    pub resume_capacity: usize,
    pub initial_next_gc: usize,
    pub preempt_enabled: bool,
    pub preempt_timeslice: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        let limits = VmLimits::default();
        let preempt = PreemptConfig::default();
        Self {
            stack_capacity: limits.stack_capacity,
            frame_capacity: limits.frame_capacity,
            prompt_capacity: limits.prompt_capacity,
            resume_capacity: limits.resume_capacity,
            initial_next_gc: limits.initial_next_gc,
            preempt_enabled: preempt.enabled,
            preempt_timeslice: preempt.timeslice,
        }
    }
}

impl VmConfig {
    pub fn with_stack_capacity(mut self, n: usize) -> Self {
        self.stack_capacity = n;
        self
    }
    pub fn with_frame_capacity(mut self, n: usize) -> Self {
        self.frame_capacity = n;
        self
    }
    pub fn with_prompt_capacity(mut self, n: usize) -> Self {
        self.prompt_capacity = n;
        self
    }
    pub fn with_resume_capacity(mut self, n: usize) -> Self {
        self.resume_capacity = n;
        self
    }
    pub fn with_preemption(mut self, enabled: bool, timeslice: u64) -> Self {
        self.preempt_enabled = enabled;
        self.preempt_timeslice = timeslice;
        self
    }

    fn into_parts(self) -> (VmLimits, PreemptConfig) {
        (
            VmLimits {
                stack_capacity: self.stack_capacity,
                frame_capacity: self.frame_capacity,
                prompt_capacity: self.prompt_capacity,
                resume_capacity: self.resume_capacity,
                initial_next_gc: self.initial_next_gc,
            },
            PreemptConfig { enabled: self.preempt_enabled, timeslice: self.preempt_timeslice },
        )
    }
}

/// Bookkeeping for a call split across `begin_call`/`resume_call`
/// (cooperative preemption).
#[derive(Debug, Clone, Copy)]
struct PendingCall {
    return_slot: usize,
    frame_floor: usize,
}

/// The host-facing VM handle. Wraps `vitte_core::interpreter::Vm` and
/// adds everything an embedder needs that isn't part of the execution
/// core itself.
pub struct Vm {
    core: CoreVm,
    config: VmConfig,
    next_prompt_tag_id: u32,
    pending_call: Option<PendingCall>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let (limits, preempt) = config.into_parts();
        Self { core: CoreVm::new(limits, preempt), config, next_prompt_tag_id: 0, pending_call: None }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Escape hatch to the execution core for callers that need an
    /// operation this surface doesn't wrap yet.
    pub fn core(&self) -> &CoreVm {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut CoreVm {
        &mut self.core
    }

    fn obj_str(&self, h: HeapHandle) -> &str {
        match self.core.heap().get(h) {
            Obj::String(s) => s.as_str(),
            _ => "<not-a-string>",
        }
    }

    // ---- globals -------------------------------------------------------

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.core.set_global(name, value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.core.get_global(name)
    }

    // ---- natives ---------------------------------------------------------

    /// Registers a native function under a textual signature, e.g.
    /// `"push(ref list, val item)"`.
    pub fn register_native(&mut self, signature: &str, func: NativeFn) -> Result<HeapHandle> {
        let sig = vitte_core::native::parse_signature(signature)?;
        Ok(self.core.register_native(&sig, func))
    }

    pub fn define_native_context(&mut self, user_data: Box<dyn Any>, finalizer: Option<Finalizer>) -> HeapHandle {
        self.core.heap_mut().alloc(Obj::NativeContext(NativeContextObj { user_data, finalizer }))
    }

    pub fn define_native_closure(&mut self, name: &str, context: HeapHandle, func: NativeClosureFn) -> Value {
        let h = self.core.heap_mut().alloc(Obj::NativeClosure(NativeClosureObj { context, func }));
        let v = Value::object(h);
        self.core.set_global(name, v);
        v
    }

    pub fn define_native_reference(&mut self, context: HeapHandle, get: GetHook, set: SetHook) -> Value {
        let h = self.core.heap_mut().alloc(Obj::NativeReference(NativeReferenceObj { context, get, set }));
        Value::object(h)
    }

    /// Registers `print`/`clock_ms`, mirroring the teacher's own
    /// `install_stdlib` — a minimal convenience surface for tests and
    /// quick embedding, not a real standard library.
    pub fn install_stdlib(&mut self) -> Result<()> {
        self.register_native("print(val message)", native_print)?;
        self.register_native("clock_ms()", native_clock_ms)?;
        Ok(())
    }

    // ---- value construction / inspection --------------------------------

    pub fn new_string(&mut self, s: &str) -> Value {
        Value::object(self.core.intern(s))
    }

    pub fn as_str(&self, v: Value) -> Option<&str> {
        let h = v.as_object()?;
        match self.core.heap().get(h) {
            Obj::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn new_list(&mut self) -> Value {
        let h = self.core.heap_mut().alloc(Obj::List(ListObj(Vec::new())));
        Value::object(h)
    }

    pub fn new_list_from(&mut self, items: &[Value]) -> Value {
        let h = self.core.heap_mut().alloc(Obj::List(ListObj(items.to_vec())));
        Value::object(h)
    }

    fn as_list_mut(&mut self, list: Value) -> Result<&mut ListObj> {
        let h = list.as_object().context("expected a list value")?;
        match self.core.heap_mut().get_mut(h) {
            Obj::List(l) => Ok(l),
            other => bail!("expected a list value, got {}", other.type_name()),
        }
    }

    fn as_list(&self, list: Value) -> Result<&ListObj> {
        let h = list.as_object().context("expected a list value")?;
        match self.core.heap().get(h) {
            Obj::List(l) => Ok(l),
            other => bail!("expected a list value, got {}", other.type_name()),
        }
    }

    pub fn list_push(&mut self, list: Value, item: Value) -> Result<()> {
        self.as_list_mut(list)?.0.push(item);
        Ok(())
    }

    pub fn list_len(&self, list: Value) -> Result<usize> {
        Ok(self.as_list(list)?.0.len())
    }

    pub fn list_get(&self, list: Value, index: usize) -> Result<Value> {
        let l = self.as_list(list)?;
        l.0.get(index).copied().with_context(|| format!("list index {index} out of bounds (len {})", l.0.len()))
    }

    pub fn list_set(&mut self, list: Value, index: usize, v: Value) -> Result<()> {
        let l = self.as_list_mut(list)?;
        let len = l.0.len();
        let slot = l.0.get_mut(index).with_context(|| format!("list index {index} out of bounds (len {len})"))?;
        *slot = v;
        Ok(())
    }

    pub fn new_map(&mut self) -> Value {
        let h = self.core.heap_mut().alloc(Obj::Map(MapObj(Vec::new())));
        Value::object(h)
    }

    fn as_map_mut(&mut self, map: Value) -> Result<&mut MapObj> {
        let h = map.as_object().context("expected a map value")?;
        match self.core.heap_mut().get_mut(h) {
            Obj::Map(m) => Ok(m),
            other => bail!("expected a map value, got {}", other.type_name()),
        }
    }

    fn as_map(&self, map: Value) -> Result<&MapObj> {
        let h = map.as_object().context("expected a map value")?;
        match self.core.heap().get(h) {
            Obj::Map(m) => Ok(m),
            other => bail!("expected a map value, got {}", other.type_name()),
        }
    }

    pub fn map_set(&mut self, map: Value, key: Value, value: Value) -> Result<()> {
        self.as_map_mut(map)?.set(key, value);
        Ok(())
    }

    pub fn map_get(&self, map: Value, key: Value) -> Result<Option<Value>> {
        Ok(self.as_map(map)?.get(key))
    }

    pub fn map_has(&self, map: Value, key: Value) -> Result<bool> {
        Ok(self.as_map(map)?.has(key))
    }

    pub fn map_delete(&mut self, map: Value, key: Value) -> Result<bool> {
        Ok(self.as_map_mut(map)?.delete(key))
    }

    // ---- structs -----------------------------------------------------------

    /// Registers a struct schema and binds it to `name` as a global;
    /// struct-literal opcodes resolve their schema by looking up this
    /// same global name at load time.
    pub fn register_struct_schema(&mut self, name: &str, fields: &[&str]) -> Value {
        let name_h = self.core.intern(name);
        let field_handles: Vec<HeapHandle> = fields.iter().map(|f| self.core.intern(f)).collect();
        let h = self.core.heap_mut().alloc(Obj::StructSchema(StructSchemaObj { name: name_h, fields: field_handles }));
        let v = Value::object(h);
        self.core.set_global(name, v);
        v
    }

    pub fn new_struct_instance(&mut self, schema: Value) -> Result<Value> {
        let schema_h = schema.as_object().context("expected a struct schema value")?;
        let field_count = match self.core.heap().get(schema_h) {
            Obj::StructSchema(s) => s.fields.len(),
            other => bail!("expected a struct schema, got {}", other.type_name()),
        };
        let h = self.core.heap_mut().alloc(Obj::StructInstance(StructInstanceObj {
            schema: schema_h,
            fields: vec![Value::null(); field_count],
        }));
        Ok(Value::object(h))
    }

    fn struct_field_index(&self, instance: HeapHandle, field: &str) -> Result<usize> {
        let schema_h = match self.core.heap().get(instance) {
            Obj::StructInstance(i) => i.schema,
            other => bail!("expected a struct instance, got {}", other.type_name()),
        };
        match self.core.heap().get(schema_h) {
            Obj::StructSchema(s) => s
                .fields
                .iter()
                .position(|&h| self.obj_str(h) == field)
                .with_context(|| format!("struct has no field {field:?}")),
            _ => bail!("struct instance's schema handle is invalid"),
        }
    }

    pub fn struct_get_field(&self, instance: Value, field: &str) -> Result<Value> {
        let h = instance.as_object().context("expected a struct instance value")?;
        let idx = self.struct_field_index(h, field)?;
        match self.core.heap().get(h) {
            Obj::StructInstance(i) => Ok(i.fields[idx]),
            _ => unreachable!(),
        }
    }

    pub fn struct_set_field(&mut self, instance: Value, field: &str, value: Value) -> Result<()> {
        let h = instance.as_object().context("expected a struct instance value")?;
        let idx = self.struct_field_index(h, field)?;
        match self.core.heap_mut().get_mut(h) {
            Obj::StructInstance(i) => {
                i.fields[idx] = value;
                Ok(())
            }
            _ => unreachable!(),
        }
    }

    // ---- enums ---------------------------------------------------------

    pub fn register_enum_schema(&mut self, name: &str, variants: &[&str]) -> Value {
        let type_id = self.core.next_enum_type_id();
        let name_h = self.core.intern(name);
        let variant_handles: Vec<HeapHandle> = variants.iter().map(|v| self.core.intern(v)).collect();
        let h = self.core.heap_mut().alloc(Obj::EnumSchema(EnumSchemaObj { name: name_h, type_id, variants: variant_handles }));
        let v = Value::object(h);
        self.core.set_global(name, v);
        v
    }

    pub fn new_enum_value(&self, schema: Value, variant_name: &str) -> Result<Value> {
        let h = schema.as_object().context("expected an enum schema value")?;
        match self.core.heap().get(h) {
            Obj::EnumSchema(e) => {
                let idx = e
                    .variants
                    .iter()
                    .position(|&vh| self.obj_str(vh) == variant_name)
                    .with_context(|| format!("enum has no variant {variant_name:?}"))?;
                Ok(Value::enum_value(e.type_id, idx as u16))
            }
            other => bail!("expected an enum schema, got {}", other.type_name()),
        }
    }

    // ---- prompt tags and dispatchers ------------------------------------

    pub fn new_prompt_tag(&mut self, name: Option<&str>) -> Value {
        let id = PromptTagId(self.next_prompt_tag_id);
        self.next_prompt_tag_id += 1;
        let name_h = name.map(|n| self.core.intern(n));
        let h = self.core.heap_mut().alloc(Obj::PromptTag(PromptTagObj { id, name: name_h }));
        Value::object(h)
    }

    pub fn new_dispatcher(&mut self, name: &str) -> Value {
        let name_h = self.core.intern(name);
        let h = self.core.heap_mut().alloc(Obj::Dispatcher(DispatcherObj { name: name_h, by_arity: Vec::new() }));
        Value::object(h)
    }

    pub fn dispatcher_add_overload(&mut self, dispatcher: Value, arity: usize, callable: Value) -> Result<()> {
        let d_h = dispatcher.as_object().context("expected a dispatcher value")?;
        let c_h = callable.as_object().context("expected a callable value")?;
        match self.core.heap_mut().get_mut(d_h) {
            Obj::Dispatcher(d) => {
                if d.by_arity.len() <= arity {
                    d.by_arity.resize(arity + 1, None);
                }
                d.by_arity[arity] = Some(c_h);
                Ok(())
            }
            other => bail!("expected a dispatcher, got {}", other.type_name()),
        }
    }

    // ---- references ------------------------------------------------------

    pub fn make_global_ref(&mut self, name: &str) -> Value {
        let name_h = self.core.intern(name);
        let h = self.core.heap_mut().alloc(Obj::Reference(ReferenceObj(ReferenceKind::Global(name_h))));
        Value::object(h)
    }

    pub fn make_index_ref(&mut self, container: Value, index: Value) -> Value {
        let h = self.core.heap_mut().alloc(Obj::Reference(ReferenceObj(ReferenceKind::Index(container, index))));
        Value::object(h)
    }

    pub fn make_property_ref(&mut self, container: Value, key: Value) -> Value {
        let h = self.core.heap_mut().alloc(Obj::Reference(ReferenceObj(ReferenceKind::Property(container, key))));
        Value::object(h)
    }

    /// Dereferences `r`. `ReferenceKind::Local` can't be resolved from
    /// outside a running frame (the host has no stack slot to read),
    /// so that variant is rejected here rather than on the
    /// interpreter's own hot path. An `Upvalue` reference only
    /// resolves once its upvalue has closed.
    pub fn deref_get(&self, r: Value) -> Result<Value> {
        let h = r.as_object().context("expected a reference value")?;
        match self.core.heap().get(h) {
            Obj::Reference(ReferenceObj(kind)) => match kind {
                ReferenceKind::Local(_) => bail!("cannot dereference a stack-local reference from the host"),
                ReferenceKind::Global(name_h) => {
                    let name = self.obj_str(*name_h).to_owned();
                    self.core.get_global(&name).with_context(|| format!("undefined global {name:?}"))
                }
                ReferenceKind::Upvalue(up_h) => match self.core.heap().get(*up_h) {
                    Obj::Upvalue(u) => match u.state {
                        UpvalueState::Closed(v) => Ok(v),
                        UpvalueState::Open(_) => bail!("cannot dereference a still-open upvalue from the host"),
                    },
                    _ => bail!("upvalue handle is invalid"),
                },
                ReferenceKind::Index(container, index) => self.index_get(*container, *index),
                ReferenceKind::Property(container, key) => self.property_get(*container, *key),
            },
            other => bail!("expected a reference, got {}", other.type_name()),
        }
    }

    pub fn deref_set(&mut self, r: Value, v: Value) -> Result<()> {
        let h = r.as_object().context("expected a reference value")?;
        let kind = match self.core.heap().get(h) {
            Obj::Reference(ReferenceObj(kind)) => clone_reference_kind(kind),
            other => bail!("expected a reference, got {}", other.type_name()),
        };
        match kind {
            ReferenceKind::Local(_) => bail!("cannot dereference a stack-local reference from the host"),
            ReferenceKind::Global(name_h) => {
                let name = self.obj_str(name_h).to_owned();
                self.core.set_global(&name, v);
                Ok(())
            }
            ReferenceKind::Upvalue(up_h) => match self.core.heap_mut().get_mut(up_h) {
                Obj::Upvalue(u) => match u.state {
                    UpvalueState::Closed(_) => {
                        u.state = UpvalueState::Closed(v);
                        Ok(())
                    }
                    UpvalueState::Open(_) => bail!("cannot dereference a still-open upvalue from the host"),
                },
                _ => bail!("upvalue handle is invalid"),
            },
            ReferenceKind::Index(container, index) => self.index_set(container, index, v),
            ReferenceKind::Property(container, key) => self.property_set(container, key, v),
        }
    }

    fn index_get(&self, container: Value, index: Value) -> Result<Value> {
        match container.as_object().map(|h| self.core.heap().get(h)) {
            Some(Obj::List(l)) => {
                let idx = index.as_number().unwrap_or(-1.0) as i64;
                if idx < 0 || idx as usize >= l.0.len() {
                    bail!("list index {idx} out of bounds (len {})", l.0.len());
                }
                Ok(l.0[idx as usize])
            }
            Some(Obj::Map(m)) => Ok(m.get(index).unwrap_or_else(Value::null)),
            _ => bail!("expected a list or map value"),
        }
    }

    fn index_set(&mut self, container: Value, index: Value, v: Value) -> Result<()> {
        let h = container.as_object().context("expected a list or map value")?;
        let idx = index.as_number().unwrap_or(-1.0) as i64;
        match self.core.heap_mut().get_mut(h) {
            Obj::List(l) => {
                if idx < 0 || idx as usize >= l.0.len() {
                    bail!("list index {idx} out of bounds (len {})", l.0.len());
                }
                l.0[idx as usize] = v;
                Ok(())
            }
            Obj::Map(m) => {
                m.set(index, v);
                Ok(())
            }
            _ => bail!("expected a list or map value"),
        }
    }

    fn property_get(&self, container: Value, key: Value) -> Result<Value> {
        let h = container.as_object().context("expected a struct instance value")?;
        let key_h = key.as_object().context("property key must be a string")?;
        let name = self.obj_str(key_h).to_owned();
        self.struct_get_field(Value::object(h), &name)
    }

    fn property_set(&mut self, container: Value, key: Value, v: Value) -> Result<()> {
        let h = container.as_object().context("expected a struct instance value")?;
        let key_h = key.as_object().context("property key must be a string")?;
        let name = self.obj_str(key_h).to_owned();
        self.struct_set_field(Value::object(h), &name, v)
    }

    // ---- temp roots --------------------------------------------------------

    pub fn push_temp_root(&mut self, v: Value) {
        self.core.push_temp_root(v);
    }

    pub fn pop_temp_root(&mut self) -> Option<Value> {
        self.core.pop_temp_root()
    }

    /// Forces a collection cycle now rather than waiting for the
    /// core's own allocation-pressure threshold. Returns the number of
    /// objects freed.
    pub fn collect_garbage(&mut self) -> usize {
        self.core.collect_garbage()
    }

    /// Roots `v` for the duration of `f`, guaranteeing it's popped
    /// even if `f` returns early (used while a native builds up a
    /// composite value argument by argument, where an intervening
    /// allocation could otherwise trigger a collection).
    pub fn with_temp_root<R>(&mut self, v: Value, f: impl FnOnce(&mut Self) -> R) -> R {
        self.push_temp_root(v);
        let result = f(self);
        self.pop_temp_root();
        result
    }

    // ---- chunk lifecycle ----------------------------------------------------

    /// Wraps `chunk` as a zero-upvalue top-level function and returns
    /// the resulting closure value, ready for `call`/`run_chunk`.
    pub fn load_chunk(&mut self, name: &str, arity: u8, max_regs: u16, chunk: Chunk) -> Value {
        let name_h = self.core.intern(name);
        let function_h = self.core.heap_mut().alloc(Obj::Function(FunctionObj {
            arity,
            max_regs,
            chunk: std::rc::Rc::new(chunk),
            name: Some(name_h),
            module_name: None,
            upvalue_descriptors: Vec::new(),
            param_qualifiers: Vec::new(),
            qualifier_signature: QualifierSignature::AllNormalNoRefs,
        }));
        let closure_h = self.core.heap_mut().alloc(Obj::Closure(ClosureObj { function: function_h, upvalues: Vec::new() }));
        Value::object(closure_h)
    }

    pub fn serialize_chunk(&self, chunk: &Chunk) -> Result<Vec<u8>> {
        Ok(chunk.to_bytes()?)
    }

    pub fn deserialize_chunk(&self, bytes: &[u8]) -> Result<Chunk> {
        Ok(Chunk::from_bytes(bytes)?)
    }

    /// Loads and immediately calls a zero-argument top-level chunk.
    pub fn run_chunk(&mut self, name: &str, max_regs: u16, chunk: Chunk) -> Result<Value> {
        let closure = self.load_chunk(name, 0, max_regs, chunk);
        self.call(closure, &[])
    }

    // ---- calls -------------------------------------------------------------

    pub fn call(&mut self, callable: Value, args: &[Value]) -> Result<Value> {
        Ok(self.core.call(callable, args)?)
    }

    pub fn callv(&mut self, callable: Value, args: impl IntoIterator<Item = Value>) -> Result<Value> {
        let args: Vec<Value> = args.into_iter().collect();
        self.call(callable, &args)
    }

    // ---- cooperative preemption ---------------------------------------------

    pub fn enable_preemption(&mut self) {
        self.core.enable_preemption();
    }

    pub fn disable_preemption(&mut self) {
        self.core.disable_preemption();
    }

    pub fn set_preempt_timeslice(&mut self, ticks: u64) {
        self.core.set_preempt_timeslice(ticks);
    }

    pub fn request_preempt(&mut self) {
        self.core.request_preempt();
    }

    /// Starts a call without running it to completion. Pair with
    /// `resume_call` to drain it one timeslice at a time, giving
    /// control back to the host between slices instead of blocking
    /// until the whole call tree returns.
    pub fn begin_call(&mut self, callable: Value, args: &[Value]) -> Result<()> {
        if self.pending_call.is_some() {
            bail!("a call is already pending; drain it with resume_call first");
        }
        let (return_slot, frame_floor) = self.core.begin_call(callable, args)?;
        self.pending_call = Some(PendingCall { return_slot, frame_floor });
        Ok(())
    }

    /// Runs the pending call for up to one timeslice. Returns
    /// `Some(value)` once it completes, or `None` if it yielded (call
    /// again to keep going).
    pub fn resume_call(&mut self) -> Result<Option<Value>> {
        let pending = self.pending_call.context("no call is pending")?;
        let done = self.core.run_slice(pending.frame_floor)?;
        if done {
            let v = self.core.finish_call(pending.return_slot);
            self.pending_call = None;
            Ok(Some(v))
        } else {
            self.core.reset_preempt();
            Ok(None)
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn clone_reference_kind(kind: &ReferenceKind) -> ReferenceKind {
    match kind {
        ReferenceKind::Local(a) => ReferenceKind::Local(*a),
        ReferenceKind::Global(h) => ReferenceKind::Global(*h),
        ReferenceKind::Upvalue(h) => ReferenceKind::Upvalue(*h),
        ReferenceKind::Index(c, i) => ReferenceKind::Index(*c, *i),
        ReferenceKind::Property(c, k) => ReferenceKind::Property(*c, *k),
    }
}

fn display_value(vm: &CoreVm, v: Value) -> String {
    if let Some(n) = v.as_number() {
        n.to_string()
    } else if v.is_null() {
        "null".to_owned()
    } else if let Some(b) = v.as_bool() {
        b.to_string()
    } else if let Some(h) = v.as_object() {
        match vm.heap().get(h) {
            Obj::String(s) => s.as_str().to_owned(),
            other => format!("<{}>", other.type_name()),
        }
    } else {
        "<?>".to_owned()
    }
}

fn native_print(vm: &mut CoreVm, args: &[Value]) -> Value {
    let rendered: Vec<String> = args.iter().map(|&v| display_value(vm, v)).collect();
    println!("{}", rendered.join(" "));
    Value::null()
}

fn native_clock_ms(_vm: &mut CoreVm, _args: &[Value]) -> Value {
    let ms = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as f64).unwrap_or(0.0);
    Value::number(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_roundtrip() {
        let mut vm = Vm::new();
        let list = vm.new_list();
        vm.list_push(list, Value::number(1.0)).unwrap();
        vm.list_push(list, Value::number(2.0)).unwrap();
        assert_eq!(vm.list_len(list).unwrap(), 2);
        assert_eq!(vm.list_get(list, 1).unwrap().as_number(), Some(2.0));
        assert!(vm.list_get(list, 5).is_err());
    }

    #[test]
    fn map_roundtrip() {
        let mut vm = Vm::new();
        let map = vm.new_map();
        let key = vm.new_string("x");
        vm.map_set(map, key, Value::number(42.0)).unwrap();
        assert_eq!(vm.map_get(map, key).unwrap().and_then(|v| v.as_number()), Some(42.0));
        assert!(vm.map_has(map, key).unwrap());
        assert!(vm.map_delete(map, key).unwrap());
        assert!(!vm.map_has(map, key).unwrap());
    }

    #[test]
    fn struct_schema_and_instance() {
        let mut vm = Vm::new();
        let schema = vm.register_struct_schema("Point", &["x", "y"]);
        let instance = vm.new_struct_instance(schema).unwrap();
        vm.struct_set_field(instance, "x", Value::number(3.0)).unwrap();
        vm.struct_set_field(instance, "y", Value::number(4.0)).unwrap();
        assert_eq!(vm.struct_get_field(instance, "x").unwrap().as_number(), Some(3.0));
        assert!(vm.struct_get_field(instance, "z").is_err());
    }

    #[test]
    fn enum_schema_and_value() {
        let mut vm = Vm::new();
        let schema = vm.register_enum_schema("Color", &["Red", "Green", "Blue"]);
        let v = vm.new_enum_value(schema, "Green").unwrap();
        assert_eq!(v.as_enum().map(|(_, variant)| variant), Some(1));
        assert!(vm.new_enum_value(schema, "Purple").is_err());
    }

    #[test]
    fn global_ref_roundtrips_through_deref() {
        let mut vm = Vm::new();
        vm.set_global("answer", Value::number(41.0));
        let r = vm.make_global_ref("answer");
        assert_eq!(vm.deref_get(r).unwrap().as_number(), Some(41.0));
        vm.deref_set(r, Value::number(42.0)).unwrap();
        assert_eq!(vm.get_global("answer").unwrap().as_number(), Some(42.0));
    }

    #[test]
    fn chunk_roundtrips_through_bytes() {
        let vm = Vm::new();
        let mut chunk = Chunk::new();
        let k = chunk.consts.push_number(7.0);
        chunk.push_op(vitte_core::Op::LoadConst { dst: 0, k }, 1);
        chunk.push_op(vitte_core::Op::Return { src: 0 }, 1);
        let bytes = vm.serialize_chunk(&chunk).unwrap();
        let back = vm.deserialize_chunk(&bytes).unwrap();
        assert_eq!(back.ops, chunk.ops);
    }

    #[test]
    fn run_chunk_executes_top_level_code() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        let k = chunk.consts.push_number(10.0);
        chunk.push_op(vitte_core::Op::LoadConst { dst: 0, k }, 1);
        chunk.push_op(vitte_core::Op::Return { src: 0 }, 1);
        let result = vm.run_chunk("main", 1, chunk).unwrap();
        assert_eq!(result.as_number(), Some(10.0));
    }

    #[test]
    fn incremental_call_drains_across_slices() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        let k = chunk.consts.push_number(5.0);
        chunk.push_op(vitte_core::Op::LoadConst { dst: 0, k }, 1);
        chunk.push_op(vitte_core::Op::Return { src: 0 }, 1);
        let closure = vm.load_chunk("main", 0, 1, chunk);
        vm.begin_call(closure, &[]).unwrap();
        let mut result = None;
        for _ in 0..10 {
            if let Some(v) = vm.resume_call().unwrap() {
                result = Some(v);
                break;
            }
        }
        assert_eq!(result.and_then(|v| v.as_number()), Some(5.0));
    }

    #[test]
    fn stdlib_print_and_clock_are_registered() {
        let mut vm = Vm::new();
        vm.install_stdlib().unwrap();
        assert!(vm.get_global("print").is_some());
        assert!(vm.get_global("clock_ms").is_some());
    }
}
