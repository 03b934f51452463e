//! object.rs — Heap object model (spec §3 "Heap object", §4.2).
//!
//! Every heap allocation in the spec "begins with a header
//! `{type_tag, is_marked, next}`... `next` links the object into a
//! VM-wide singly-linked 'all objects' list." We keep the *meaning*
//! of that invariant (every live object is reachable and sweepable)
//! but implement it as a slab (`Heap`, in `heap.rs`) rather than an
//! intrusive linked list of raw pointers: slots double as the "all
//! objects" list (sweep walks the slab), and a `HeapHandle` (a plain
//! index) stands in for what would otherwise be a raw pointer. This
//! is exactly the strategy Design Notes §9 asks for ("represent these
//! as indices into a relocatable vector, not raw pointers"), and it
//! is what keeps this crate `#![forbid(unsafe_code)]`.

use std::any::Any;
use std::rc::Rc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::bytecode::chunk::Chunk;
use crate::frame::CallFrame;
use crate::value::Value;

/// An index into `Heap`'s object slab. Stable across GC cycles (a
/// freed slot is tombstoned, never reused while anything could still
/// reference its old index — see `heap.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapHandle(pub u32);

/// Identity of an enum schema; monotonically assigned (`VmState::next_enum_type_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnumTypeId(pub u16);

/// Identity of a prompt tag; monotonically assigned, compared by id
/// (not by `HeapHandle`) so a tag value can be copied freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromptTagId(pub u32);

/// A per-parameter or per-variable binding modifier (spec glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qualifier {
    Ref,
    Val,
    Slot,
    Clone,
    TypeOf,
}

/// Precomputed at compile time so the hot call path can skip
/// per-parameter qualifier processing when nothing unusual is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualifierSignature {
    AllNormalNoRefs,
    AllNormal,
    HasQualifiers,
}

/// How a `CLOSURE` instruction's upvalue descriptor should be resolved:
/// either from the *enclosing* frame's local slot, or from the
/// enclosing closure's own upvalue array (chained capture).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UpvalueDesc {
    Local(u16),
    Upvalue(u16),
}

/// A native function bound into value calls (spec §4.8).
pub type NativeFn = fn(&mut crate::interpreter::Vm, &[Value]) -> Value;
/// A native closure's trampoline: receives its bound context's handle.
pub type NativeClosureFn = fn(&mut crate::interpreter::Vm, HeapHandle, &[Value]) -> Value;
/// Finalizer invoked by the GC when a `NativeContext` becomes unreachable.
pub type Finalizer = Box<dyn FnMut(&mut dyn Any)>;
/// `NativeReference` get/set hooks over a field offset into a context's user data.
pub type GetHook = fn(&dyn Any) -> Value;
pub type SetHook = fn(&mut dyn Any, Value);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationState {
    Valid,
    Consumed,
    Invalid,
}

/// Immutable, interned byte string (spec §3 "String", §4.2).
pub struct StringObj {
    pub bytes: Box<[u8]>,
    pub hash: u64,
    pub char_len: u32,
}

impl StringObj {
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).expect("interned strings are valid UTF-8")
    }
}

/// FNV-1a-style hash, matching the spec's description of the string hash.
pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut h = OFFSET_BASIS;
    for &b in bytes {
        h ^= u64::from(b);
        h = h.wrapping_mul(PRIME);
    }
    h
}

pub struct FunctionObj {
    pub arity: u8,
    pub max_regs: u16,
    pub chunk: Rc<Chunk>,
    pub name: Option<HeapHandle>,
    pub module_name: Option<HeapHandle>,
    pub upvalue_descriptors: Vec<UpvalueDesc>,
    pub param_qualifiers: Vec<Qualifier>,
    pub qualifier_signature: QualifierSignature,
}

pub struct ClosureObj {
    pub function: HeapHandle,
    pub upvalues: Vec<HeapHandle>,
}

/// Open → closed lifecycle (spec §3 "Upvalue", §4.6).
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// `location` aliases a live stack slot (absolute stack index).
    Open(usize),
    /// The slot's value has been copied out; the upvalue now owns it.
    Closed(Value),
}

pub struct UpvalueObj {
    pub state: UpvalueState,
    /// Next entry in the VM-wide open-upvalue list, ordered by
    /// descending stack address. Only meaningful while `Open`.
    pub next_open: Option<HeapHandle>,
}

pub struct NativeFunctionObj {
    pub name: HeapHandle,
    pub arity: u8,
    pub qualifiers: Vec<Qualifier>,
    /// Precomputed from `qualifiers` at registration time so the call
    /// path can skip per-parameter qualifier materialization when
    /// every parameter is a plain `val`.
    pub qualifier_signature: QualifierSignature,
    pub func: NativeFn,
}

pub struct NativeContextObj {
    pub user_data: Box<dyn Any>,
    pub finalizer: Option<Finalizer>,
}

pub struct NativeClosureObj {
    pub context: HeapHandle,
    pub func: NativeClosureFn,
}

pub struct NativeReferenceObj {
    pub context: HeapHandle,
    pub get: GetHook,
    pub set: SetHook,
}

pub struct ListObj(pub Vec<Value>);

/// Linear assoc list rather than a hash map: `Value`'s NaN-boxed keys
/// are not uniformly hashable (an `f64` key would need bit-pattern
/// hashing, and mixing it with string/object keys cheaply isn't worth
/// the complexity here), and the corpus scenarios never exercise map
/// sizes where this matters. `forEach` below copies the key list
/// before iterating so callback-driven mutation of the map can't
/// invalidate the walk.
pub struct MapObj(pub Vec<(Value, Value)>);

impl MapObj {
    pub fn get(&self, key: Value) -> Option<Value> {
        self.0.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    pub fn set(&mut self, key: Value, value: Value) {
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.0.push((key, value));
        }
    }

    pub fn has(&self, key: Value) -> bool {
        self.0.iter().any(|(k, _)| *k == key)
    }

    pub fn delete(&mut self, key: Value) -> bool {
        if let Some(i) = self.0.iter().position(|(k, _)| *k == key) {
            self.0.remove(i);
            true
        } else {
            false
        }
    }

    /// Snapshot-safe iteration: returns the entries present *at call
    /// time*, regardless of subsequent mutation by the callback.
    pub fn snapshot(&self) -> Vec<(Value, Value)> {
        self.0.clone()
    }
}

/// Selects a native overload by arity at call time.
pub struct DispatcherObj {
    pub name: HeapHandle,
    pub by_arity: Vec<Option<HeapHandle>>,
}

/// A first-class "pointer to a value location" (spec §4.5 "References and deref").
pub enum ReferenceKind {
    Local(usize),
    Global(HeapHandle),
    Index(Value, Value),
    Property(Value, Value),
    Upvalue(HeapHandle),
}

pub struct ReferenceObj(pub ReferenceKind);

pub struct StructSchemaObj {
    pub name: HeapHandle,
    pub fields: Vec<HeapHandle>,
}

pub struct StructInstanceObj {
    pub schema: HeapHandle,
    pub fields: Vec<Value>,
}

pub struct EnumSchemaObj {
    pub name: HeapHandle,
    pub type_id: EnumTypeId,
    pub variants: Vec<HeapHandle>,
}

pub struct PromptTagObj {
    pub id: PromptTagId,
    pub name: Option<HeapHandle>,
}

/// A suspended computation up to a prompt (spec §3 "Continuation", §4.7).
pub struct ContinuationObj {
    pub frames: Vec<CallFrame>,
    pub stack: Vec<Value>,
    pub stack_base_offset: usize,
    pub saved_ip: u32,
    pub saved_chunk: Rc<Chunk>,
    pub prompt_tag: PromptTagId,
    /// The `PromptTag` heap object this continuation was captured
    /// under, so it can be re-rooted onto the prompt stack (and kept
    /// marked in the meantime) when this continuation is resumed.
    pub prompt_tag_handle: HeapHandle,
    pub state: ContinuationState,
    pub return_slot: usize,
}

/// The tagged union of every heap-allocated kind (spec §3 "Heap object").
pub enum Obj {
    String(StringObj),
    Int64(i64),
    Function(FunctionObj),
    NativeFunction(NativeFunctionObj),
    NativeContext(NativeContextObj),
    NativeClosure(NativeClosureObj),
    NativeReference(NativeReferenceObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    List(ListObj),
    Map(MapObj),
    Dispatcher(DispatcherObj),
    Reference(ReferenceObj),
    StructSchema(StructSchemaObj),
    StructInstance(StructInstanceObj),
    EnumSchema(EnumSchemaObj),
    PromptTag(PromptTagObj),
    Continuation(ContinuationObj),
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "String",
            Obj::Int64(_) => "Int64",
            Obj::Function(_) => "Function",
            Obj::NativeFunction(_) => "NativeFunction",
            Obj::NativeContext(_) => "NativeContext",
            Obj::NativeClosure(_) => "NativeClosure",
            Obj::NativeReference(_) => "NativeReference",
            Obj::Closure(_) => "Closure",
            Obj::Upvalue(_) => "Upvalue",
            Obj::List(_) => "List",
            Obj::Map(_) => "Map",
            Obj::Dispatcher(_) => "Dispatcher",
            Obj::Reference(_) => "Reference",
            Obj::StructSchema(_) => "StructSchema",
            Obj::StructInstance(_) => "StructInstance",
            Obj::EnumSchema(_) => "EnumSchema",
            Obj::PromptTag(_) => "PromptTag",
            Obj::Continuation(_) => "Continuation",
        }
    }
}
