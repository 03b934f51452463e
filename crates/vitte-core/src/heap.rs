//! heap.rs — Object slab, allocation accounting, and the weak string
//! intern table (spec §3 "Heap object", §4.2).
//!
//! The spec's allocator is `reallocate(ptr, old_size, new_size)`
//! tracking `bytesAllocated`/`nextGC` and threading new objects onto
//! a VM-wide intrusive list. Here `Heap` *is* that list: it's a `Vec`
//! of slots, each either `Live(Obj)` or `Free` (tombstoned after a
//! sweep collects it), and allocation accounting keys off each
//! object's approximate size rather than raw byte counts, since we
//! never call the allocator directly for individual objects.

use ahash::AHashMap;

use crate::object::{fnv1a_hash, HeapHandle, Obj, StringObj};

/// Growth factor applied to `next_gc` after each collection (spec
/// §4.2 "GROW_FACTOR").
pub const GROW_FACTOR: usize = 2;

enum Slot {
    Live { obj: Obj, marked: bool },
    Free,
}

/// Rough per-kind weight used for GC-pressure accounting. Not a byte-
/// accurate sizeof: it only needs to grow roughly with live data so
/// `next_gc` backs off under real allocation pressure.
fn approx_size(obj: &Obj) -> usize {
    match obj {
        Obj::String(s) => 32 + s.bytes.len(),
        Obj::Int64(_) => 16,
        Obj::Function(_) => 64,
        Obj::NativeFunction(_) => 48,
        Obj::NativeContext(_) => 48,
        Obj::NativeClosure(_) => 32,
        Obj::NativeReference(_) => 32,
        Obj::Closure(c) => 32 + c.upvalues.len() * 8,
        Obj::Upvalue(_) => 24,
        Obj::List(l) => 24 + l.0.len() * 8,
        Obj::Map(m) => 24 + m.0.len() * 16,
        Obj::Dispatcher(d) => 24 + d.by_arity.len() * 8,
        Obj::Reference(_) => 32,
        Obj::StructSchema(s) => 32 + s.fields.len() * 8,
        Obj::StructInstance(i) => 24 + i.fields.len() * 8,
        Obj::EnumSchema(e) => 32 + e.variants.len() * 8,
        Obj::PromptTag(_) => 24,
        Obj::Continuation(c) => 64 + c.frames.len() * 48 + c.stack.len() * 8,
    }
}

/// The object slab plus the weak string-interning table (spec §4.2
/// "stringTable is a weak map: keys are never traced as roots").
pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    /// String interning table: hash -> candidate handles sharing that
    /// hash bucket. Entries are dropped during sweep for strings that
    /// turned out to be unreachable (see `gc.rs`); the table itself is
    /// never traced as a root.
    strings: AHashMap<u64, Vec<HeapHandle>>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
}

impl Heap {
    pub fn new(initial_next_gc: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            strings: AHashMap::new(),
            bytes_allocated: 0,
            next_gc: initial_next_gc,
        }
    }

    /// Allocates `obj`, returning its handle. Accounting is updated
    /// immediately; GC is triggered by the caller (the interpreter),
    /// which checks `should_collect()` at safe points.
    pub fn alloc(&mut self, obj: Obj) -> HeapHandle {
        self.bytes_allocated += approx_size(&obj);
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Slot::Live { obj, marked: false };
            HeapHandle(idx)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot::Live { obj, marked: false });
            HeapHandle(idx)
        }
    }

    /// Interns `s`: returns a handle to an existing equal string if
    /// one is live, else allocates a new `StringObj` and records it
    /// in the weak table.
    pub fn intern(&mut self, s: &str) -> HeapHandle {
        let hash = fnv1a_hash(s.as_bytes());
        if let Some(candidates) = self.strings.get(&hash) {
            for &h in candidates {
                if let Slot::Live { obj: Obj::String(so), .. } = &self.slots[h.0 as usize] {
                    if so.as_str() == s {
                        return h;
                    }
                }
            }
        }
        let handle = self.alloc(Obj::String(StringObj {
            bytes: s.as_bytes().to_vec().into_boxed_slice(),
            hash,
            char_len: s.chars().count() as u32,
        }));
        self.strings.entry(hash).or_default().push(handle);
        handle
    }

    pub fn get(&self, handle: HeapHandle) -> &Obj {
        match &self.slots[handle.0 as usize] {
            Slot::Live { obj, .. } => obj,
            Slot::Free => panic!("Heap::get: handle {:?} refers to a freed slot", handle),
        }
    }

    pub fn get_mut(&mut self, handle: HeapHandle) -> &mut Obj {
        match &mut self.slots[handle.0 as usize] {
            Slot::Live { obj, .. } => obj,
            Slot::Free => panic!("Heap::get_mut: handle {:?} refers to a freed slot", handle),
        }
    }

    pub fn is_marked(&self, handle: HeapHandle) -> bool {
        matches!(self.slots[handle.0 as usize], Slot::Live { marked: true, .. })
    }

    pub fn mark(&mut self, handle: HeapHandle) -> bool {
        match &mut self.slots[handle.0 as usize] {
            Slot::Live { marked, .. } => {
                let was_marked = *marked;
                *marked = true;
                !was_marked
            }
            Slot::Free => false,
        }
    }

    pub fn unmark_all(&mut self) {
        for slot in &mut self.slots {
            if let Slot::Live { marked, .. } = slot {
                *marked = false;
            }
        }
    }

    /// Frees every unmarked live slot, running `on_free` for its
    /// object first (finalization), and drops the string table's
    /// entries for any freed string.
    pub fn sweep(&mut self, mut on_free: impl FnMut(&mut Obj)) {
        for idx in 0..self.slots.len() {
            let should_free = matches!(self.slots[idx], Slot::Live { marked: false, .. });
            if should_free {
                if let Slot::Live { obj, .. } = &mut self.slots[idx] {
                    on_free(obj);
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(approx_size(obj));
                }
                self.slots[idx] = Slot::Free;
                self.free_list.push(idx as u32);
            }
        }
        self.strings.retain(|_, handles| {
            handles.retain(|h| matches!(self.slots[h.0 as usize], Slot::Live { .. }));
            !handles.is_empty()
        });
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    pub fn grow_threshold(&mut self) {
        self.next_gc = self.bytes_allocated.saturating_mul(GROW_FACTOR).max(1024);
    }

    pub fn live_handles(&self) -> impl Iterator<Item = HeapHandle> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Live { .. } => Some(HeapHandle(i as u32)),
            Slot::Free => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedupes_equal_strings() {
        let mut heap = Heap::new(1 << 20);
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn sweep_frees_unmarked_and_keeps_marked() {
        let mut heap = Heap::new(1 << 20);
        let keep = heap.alloc(Obj::Int64(1));
        let drop_me = heap.alloc(Obj::Int64(2));
        heap.mark(keep);
        let mut finalized = Vec::new();
        heap.sweep(|obj| {
            if let Obj::Int64(n) = obj {
                finalized.push(*n);
            }
        });
        assert_eq!(finalized, vec![2]);
        assert!(heap.is_marked(keep)); // sweep doesn't clear marks; unmark_all does, before the next mark phase
        assert_eq!(heap.live_handles().collect::<Vec<_>>(), vec![keep]);
        let _ = drop_me;
    }

    #[test]
    fn freed_slots_are_recycled() {
        let mut heap = Heap::new(1 << 20);
        let a = heap.alloc(Obj::Int64(1));
        heap.sweep(|_| {});
        let b = heap.alloc(Obj::Int64(2));
        assert_eq!(a, b);
    }
}
