//! gc.rs — Tracing mark-sweep collector (spec §4.2 "Garbage
//! collector").
//!
//! Four phases, run synchronously at a safe point between
//! instructions (never concurrently with interpretation, per the
//! spec's Non-goal on incremental/concurrent collection):
//!   1. mark roots (VM stack, call-frame closures, globals, open
//!      upvalues, prompt stack, temp-root stack)
//!   2. blacken the gray stack until empty (trace each object's
//!      out-edges, pushing newly-marked objects back on)
//!   3. drop dead entries from the weak string table
//!   4. sweep: free every unmarked slot, running finalizers
//!
//! `Heap::mark` returns `true` only the first time an object is
//! marked, which is what keeps the gray stack from growing forever on
//! a cyclic graph.

use crate::heap::Heap;
use crate::object::{HeapHandle, Obj};
use crate::value::Value;

/// Anything that can enumerate its GC roots and darken an object
/// graph. The interpreter implements this by walking its stack, call
/// frames, globals, open-upvalue list, prompt stack, and temp-root
/// stack.
pub trait Trace {
    fn roots(&self) -> Vec<HeapHandle>;
    fn root_values(&self) -> Vec<Value>;
}

/// Runs one full collection cycle against `heap`, using `trace` to
/// obtain the root set. Returns the number of objects freed.
pub fn collect(heap: &mut Heap, trace: &dyn Trace) -> usize {
    heap.unmark_all();

    let mut gray: Vec<HeapHandle> = Vec::new();
    for h in trace.roots() {
        if heap.mark(h) {
            gray.push(h);
        }
    }
    for v in trace.root_values() {
        if let Some(h) = v.as_object() {
            if heap.mark(h) {
                gray.push(h);
            }
        }
    }

    while let Some(handle) = gray.pop() {
        blacken(heap, handle, &mut gray);
    }

    let before = heap.live_handles().count();
    heap.sweep(|obj| finalize(obj));
    let after = heap.live_handles().count();
    heap.grow_threshold();
    before.saturating_sub(after)
}

fn mark_value(heap: &mut Heap, v: Value, gray: &mut Vec<HeapHandle>) {
    if let Some(h) = v.as_object() {
        if heap.mark(h) {
            gray.push(h);
        }
    }
}

/// Traces one object's direct out-edges, marking anything newly
/// reached and pushing it onto the gray stack.
fn blacken(heap: &mut Heap, handle: HeapHandle, gray: &mut Vec<HeapHandle>) {
    // Obj cannot be borrowed mutably (heap.mark) while also borrowed
    // immutably for its fields, so collect child handles/values first.
    let (child_handles, child_values): (Vec<HeapHandle>, Vec<Value>) = match heap.get(handle) {
        Obj::String(_) | Obj::Int64(_) | Obj::PromptTag(_) => (Vec::new(), Vec::new()),
        Obj::Function(f) => {
            let mut hs = Vec::new();
            hs.extend(f.name);
            hs.extend(f.module_name);
            (hs, Vec::new())
        }
        Obj::NativeFunction(nf) => (vec![nf.name], Vec::new()),
        Obj::NativeContext(_) => (Vec::new(), Vec::new()),
        Obj::NativeClosure(nc) => (vec![nc.context], Vec::new()),
        Obj::NativeReference(nr) => (vec![nr.context], Vec::new()),
        Obj::Closure(c) => {
            let mut hs = vec![c.function];
            hs.extend(c.upvalues.iter().copied());
            (hs, Vec::new())
        }
        Obj::Upvalue(u) => match u.state {
            crate::object::UpvalueState::Open(_) => (Vec::new(), Vec::new()),
            crate::object::UpvalueState::Closed(v) => (Vec::new(), vec![v]),
        },
        Obj::List(l) => (Vec::new(), l.0.clone()),
        Obj::Map(m) => {
            let mut vs = Vec::with_capacity(m.0.len() * 2);
            for (k, v) in &m.0 {
                vs.push(*k);
                vs.push(*v);
            }
            (Vec::new(), vs)
        }
        Obj::Dispatcher(d) => {
            let mut hs = vec![d.name];
            hs.extend(d.by_arity.iter().flatten().copied());
            (hs, Vec::new())
        }
        Obj::Reference(r) => match &r.0 {
            crate::object::ReferenceKind::Local(_) => (Vec::new(), Vec::new()),
            crate::object::ReferenceKind::Global(h) => (vec![*h], Vec::new()),
            crate::object::ReferenceKind::Upvalue(h) => (vec![*h], Vec::new()),
            crate::object::ReferenceKind::Index(container, index) => {
                (Vec::new(), vec![*container, *index])
            }
            crate::object::ReferenceKind::Property(container, key) => {
                (Vec::new(), vec![*container, *key])
            }
        },
        Obj::StructSchema(s) => {
            let mut hs = vec![s.name];
            hs.extend(s.fields.iter().copied());
            (hs, Vec::new())
        }
        Obj::StructInstance(i) => (vec![i.schema], i.fields.clone()),
        Obj::EnumSchema(e) => {
            let mut hs = vec![e.name];
            hs.extend(e.variants.iter().copied());
            (hs, Vec::new())
        }
        Obj::Continuation(c) => {
            let mut hs = c.frames.iter().map(|f| f.closure).collect::<Vec<_>>();
            hs.push(c.prompt_tag_handle);
            (hs, c.stack.clone())
        }
    };

    for h in child_handles {
        if heap.mark(h) {
            gray.push(h);
        }
    }
    for v in child_values {
        mark_value(heap, v, gray);
    }
}

/// Per-type finalization run once, right before an unreachable
/// object's slot is reclaimed (spec §4.2 "finalizers").
fn finalize(obj: &mut Obj) {
    if let Obj::NativeContext(ctx) = obj {
        if let Some(mut finalizer) = ctx.finalizer.take() {
            finalizer(&mut *ctx.user_data);
        }
    }
    // Function/Continuation/Closure/etc. release their owned data
    // (Rc<Chunk>, Vec<Value>, ...) through ordinary `Drop` once the
    // slot is overwritten by `Heap::sweep` — no bespoke finalizer
    // needed for them.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::object::{ClosureObj, FunctionObj, Obj, QualifierSignature};

    struct FixedRoots(Vec<HeapHandle>);
    impl Trace for FixedRoots {
        fn roots(&self) -> Vec<HeapHandle> {
            self.0.clone()
        }
        fn root_values(&self) -> Vec<Value> {
            Vec::new()
        }
    }

    #[test]
    fn unreferenced_cycle_is_collected() {
        let mut heap = Heap::new(1 << 20);
        // Two lists referencing each other, reachable from nothing.
        let a = heap.alloc(Obj::List(crate::object::ListObj(Vec::new())));
        let b = heap.alloc(Obj::List(crate::object::ListObj(Vec::new())));
        if let Obj::List(l) = heap.get_mut(a) {
            l.0.push(Value::object(b));
        }
        if let Obj::List(l) = heap.get_mut(b) {
            l.0.push(Value::object(a));
        }
        let freed = collect(&mut heap, &FixedRoots(Vec::new()));
        assert_eq!(freed, 2);
        assert_eq!(heap.live_handles().count(), 0);
    }

    #[test]
    fn rooted_closure_keeps_its_function_alive() {
        use std::rc::Rc;
        let mut heap = Heap::new(1 << 20);
        let chunk = Rc::new(crate::bytecode::chunk::Chunk::new());
        let func = heap.alloc(Obj::Function(FunctionObj {
            arity: 0,
            max_regs: 1,
            chunk,
            name: None,
            module_name: None,
            upvalue_descriptors: Vec::new(),
            param_qualifiers: Vec::new(),
            qualifier_signature: QualifierSignature::AllNormalNoRefs,
        }));
        let closure = heap.alloc(Obj::Closure(ClosureObj { function: func, upvalues: Vec::new() }));
        let freed = collect(&mut heap, &FixedRoots(vec![closure]));
        assert_eq!(freed, 0);
        assert!(heap.is_marked(func));
        assert!(heap.is_marked(closure));
    }
}
