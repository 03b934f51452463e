//! upvalue.rs — VM-wide open-upvalue bookkeeping (spec §3 "Upvalue",
//! §4.6 "CLOSURE, CLOSE_UPVALUE, CLOSE_FRAME_UPVALUES").
//!
//! Open upvalues form a singly-linked list, ordered by descending
//! stack address, so that closing a range of the stack (on frame
//! return, or `CLOSE_UPVALUE`) only has to walk as far as the
//! addresses being closed before stopping.

use crate::heap::Heap;
use crate::object::{HeapHandle, Obj, UpvalueObj, UpvalueState};
use crate::value::Value;

/// Head of the VM-wide open-upvalue chain.
#[derive(Default)]
pub struct OpenUpvalues {
    head: Option<HeapHandle>,
}

impl OpenUpvalues {
    pub fn new() -> Self {
        Self::default()
    }

    fn stack_addr(heap: &Heap, handle: HeapHandle) -> usize {
        match heap.get(handle) {
            Obj::Upvalue(UpvalueObj { state: UpvalueState::Open(addr), .. }) => *addr,
            _ => unreachable!("OpenUpvalues only ever links Open upvalues"),
        }
    }

    /// Finds (or creates) the open upvalue aliasing `stack_slot`,
    /// inserting it into the list at the position that keeps
    /// addresses in descending order.
    pub fn find_or_open(&mut self, heap: &mut Heap, stack_slot: usize) -> HeapHandle {
        let mut prev: Option<HeapHandle> = None;
        let mut cursor = self.head;

        while let Some(h) = cursor {
            let addr = Self::stack_addr(heap, h);
            if addr == stack_slot {
                return h;
            }
            if addr < stack_slot {
                break;
            }
            prev = Some(h);
            cursor = match heap.get(h) {
                Obj::Upvalue(u) => u.next_open,
                _ => unreachable!(),
            };
        }

        let fresh = heap.alloc(Obj::Upvalue(UpvalueObj {
            state: UpvalueState::Open(stack_slot),
            next_open: cursor,
        }));

        match prev {
            Some(p) => {
                if let Obj::Upvalue(u) = heap.get_mut(p) {
                    u.next_open = Some(fresh);
                }
            }
            None => self.head = Some(fresh),
        }
        fresh
    }

    /// Closes every open upvalue whose stack address is `>= floor`,
    /// copying the stack's current value into each and unlinking it
    /// from the open-upvalue chain. Used both by `CLOSE_UPVALUE`
    /// (floor = one slot) and on frame return (floor = frame base).
    pub fn close_from(&mut self, heap: &mut Heap, stack: &[Value], floor: usize) {
        let mut prev: Option<HeapHandle> = None;
        let mut cursor = self.head;

        while let Some(h) = cursor {
            let addr = Self::stack_addr(heap, h);
            if addr < floor {
                break;
            }
            let next = match heap.get(h) {
                Obj::Upvalue(u) => u.next_open,
                _ => unreachable!(),
            };

            if let Obj::Upvalue(u) = heap.get_mut(h) {
                u.state = UpvalueState::Closed(stack[addr]);
                u.next_open = None;
            }

            match prev {
                Some(p) => {
                    if let Obj::Upvalue(u) = heap.get_mut(p) {
                        u.next_open = next;
                    }
                }
                None => self.head = next,
            }
            cursor = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn opens_are_ordered_by_descending_address_and_deduplicated() {
        let mut heap = Heap::new(1 << 20);
        let mut chain = OpenUpvalues::new();
        let a = chain.find_or_open(&mut heap, 5);
        let b = chain.find_or_open(&mut heap, 2);
        let a_again = chain.find_or_open(&mut heap, 5);
        assert_eq!(a, a_again);
        assert_ne!(a, b);
    }

    #[test]
    fn close_from_captures_current_value_and_unlinks() {
        let mut heap = Heap::new(1 << 20);
        let mut chain = OpenUpvalues::new();
        let stack = vec![Value::number(0.0), Value::number(1.0), Value::number(42.0)];
        let h = chain.find_or_open(&mut heap, 2);
        chain.close_from(&mut heap, &stack, 1);
        match heap.get(h) {
            Obj::Upvalue(u) => match u.state {
                UpvalueState::Closed(v) => assert_eq!(v.as_number(), Some(42.0)),
                UpvalueState::Open(_) => panic!("expected closed"),
            },
            _ => panic!("expected upvalue"),
        }
        assert!(chain.head.is_none());
    }
}
