//! The object heap and its mark-and-sweep collector.
//!
//! The heap tracks every allocated object in one list. A collection marks
//! everything reachable from the VM's roots, then sweeps: unmarked objects
//! have their interior edges cleared — emptying containers, dropping fiber
//! state, closing upvalues — which breaks every reference cycle, so the
//! reference-counted cells free as the last handles drop. The trigger
//! threshold is re-derived after each pass as 1.5x the surviving count.

use std::cell::Cell;
use std::rc::Rc;

use crate::vm::value::{Method, Obj, ObjKind, ObjRef, UpvalueState, Value};

/// Floor for the collection threshold; below this the heap never collects.
pub const INITIAL_GC_THRESHOLD: usize = 1024;

/// Owns the list of all live heap objects plus the pin stack for objects
/// under construction in native code.
pub struct Heap {
    objects: Vec<ObjRef>,
    pinned: Vec<ObjRef>,
    next_gc: usize,
    collections: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            pinned: Vec::new(),
            next_gc: INITIAL_GC_THRESHOLD,
            collections: 0,
        }
    }

    /// Allocate a new object. Allocation itself never collects; callers on
    /// the runtime path check `should_collect` first, while compile-time
    /// allocations (constants, functions) land unconditionally.
    pub fn allocate(&mut self, kind: ObjKind) -> ObjRef {
        let obj = Rc::new(Obj {
            mark: Cell::new(false),
            kind,
        });
        self.objects.push(obj.clone());
        obj
    }

    pub fn should_collect(&self) -> bool {
        self.objects.len() >= self.next_gc
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// How many collection passes have run.
    pub fn collections(&self) -> usize {
        self.collections
    }

    /// Keep an object alive across allocations while it is reachable only
    /// from native locals. Balance with `unpin`.
    pub fn pin(&mut self, obj: ObjRef) {
        self.pinned.push(obj);
    }

    pub fn unpin(&mut self) {
        self.pinned.pop();
    }

    /// Mark the pin stack; called by the VM alongside its other roots.
    pub fn mark_pinned(&self) {
        for obj in &self.pinned {
            mark_object(obj);
        }
    }

    /// Free everything unmarked, clear survivors' marks, and retune the
    /// threshold. Returns the number of surviving objects.
    pub fn sweep(&mut self) -> usize {
        for obj in &self.objects {
            if !obj.mark.get() {
                clear_interior(obj);
            }
        }
        self.objects.retain(|obj| obj.mark.get());
        for obj in &self.objects {
            obj.mark.set(false);
        }

        let survivors = self.objects.len();
        self.next_gc = (survivors + survivors / 2).max(INITIAL_GC_THRESHOLD);
        self.collections += 1;
        survivors
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Mark a value's object, if it has one.
pub fn mark_value(value: &Value) {
    if let Value::Obj(obj) = value {
        mark_object(obj);
    }
}

/// Mark an object and everything it references.
pub fn mark_object(obj: &ObjRef) {
    if obj.mark.get() {
        return;
    }
    obj.mark.set(true);

    match &obj.kind {
        ObjKind::Str(_) | ObjKind::Range(_) => {}
        ObjKind::Fn(function) => {
            for constant in &function.chunk.constants {
                mark_value(constant);
            }
        }
        ObjKind::Closure(closure) => {
            mark_object(&closure.function);
            for upvalue in &closure.upvalues {
                mark_object(upvalue);
            }
        }
        ObjKind::Upvalue(state) => match &*state.borrow() {
            // An open upvalue aliases a slot of its owning fiber; keeping
            // the fiber alive keeps the slot alive.
            UpvalueState::Open { fiber, .. } => mark_object(fiber),
            UpvalueState::Closed(value) => mark_value(value),
        },
        ObjKind::Class(class) => {
            if let Some(superclass) = &class.superclass {
                mark_object(superclass);
            }
            if let Some(metaclass) = &class.metaclass {
                mark_object(metaclass);
            }
            for method in class.methods.borrow().iter() {
                if let Method::Block(closure) = method {
                    mark_object(closure);
                }
            }
        }
        ObjKind::Instance(instance) => {
            mark_object(&instance.class);
            for field in instance.fields.borrow().iter() {
                mark_value(field);
            }
        }
        ObjKind::List(elements) => {
            for element in elements.borrow().iter() {
                mark_value(element);
            }
        }
        ObjKind::Map(map) => {
            for (key, value) in map.borrow().iter() {
                mark_value(&key.0);
                mark_value(value);
            }
        }
        ObjKind::Fiber(fiber) => {
            let fiber = fiber.borrow();
            for value in &fiber.stack {
                mark_value(value);
            }
            for frame in &fiber.frames {
                mark_object(&frame.closure);
            }
            for upvalue in &fiber.open_upvalues {
                mark_object(upvalue);
            }
            if let Some(caller) = &fiber.caller {
                mark_object(caller);
            }
            if let Some(error) = &fiber.error {
                mark_value(error);
            }
        }
    }
}

/// Drop an unreachable object's outgoing edges so reference cycles cannot
/// keep dead object groups alive.
fn clear_interior(obj: &ObjRef) {
    match &obj.kind {
        ObjKind::List(elements) => elements.borrow_mut().clear(),
        ObjKind::Map(map) => map.borrow_mut().clear(),
        ObjKind::Instance(instance) => instance.fields.borrow_mut().clear(),
        ObjKind::Class(class) => class.methods.borrow_mut().clear(),
        ObjKind::Upvalue(state) => *state.borrow_mut() = UpvalueState::Closed(Value::Nil),
        ObjKind::Fiber(fiber) => {
            let mut fiber = fiber.borrow_mut();
            fiber.stack.clear();
            fiber.frames.clear();
            fiber.open_upvalues.clear();
            fiber.caller = None;
            fiber.error = None;
        }
        ObjKind::Str(_) | ObjKind::Fn(_) | ObjKind::Closure(_) | ObjKind::Range(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::StrObj;
    use std::cell::RefCell;

    #[test]
    fn test_sweep_frees_unmarked() {
        let mut heap = Heap::new();
        let kept = heap.allocate(ObjKind::Str(StrObj::new("kept")));
        let _dropped = heap.allocate(ObjKind::Str(StrObj::new("dropped")));
        assert_eq!(heap.object_count(), 2);

        mark_object(&kept);
        let survivors = heap.sweep();

        assert_eq!(survivors, 1);
        assert_eq!(heap.object_count(), 1);
        // Survivors are unmarked again for the next cycle.
        assert!(!kept.mark.get());
    }

    #[test]
    fn test_sweep_clears_unreached_containers() {
        let mut heap = Heap::new();
        let inner = heap.allocate(ObjKind::Str(StrObj::new("x")));
        let list = heap.allocate(ObjKind::List(RefCell::new(vec![Value::Obj(inner)])));

        heap.sweep();

        // The list handle we still hold survives as an Rc, but its interior
        // was cleared when the heap let go of it.
        assert_eq!(heap.object_count(), 0);
        assert!(list.as_list().map(|l| l.borrow().is_empty()).unwrap_or(false));
    }

    #[test]
    fn test_pinned_objects_survive() {
        let mut heap = Heap::new();
        let pinned = heap.allocate(ObjKind::List(RefCell::new(vec![Value::Num(1.0)])));
        heap.pin(pinned.clone());

        heap.mark_pinned();
        let survivors = heap.sweep();

        assert_eq!(survivors, 1);
        assert_eq!(pinned.as_list().map(|l| l.borrow().len()), Some(1));
        heap.unpin();
    }

    #[test]
    fn test_marking_reaches_through_lists() {
        let mut heap = Heap::new();
        let leaf = heap.allocate(ObjKind::Str(StrObj::new("leaf")));
        let list = heap.allocate(ObjKind::List(RefCell::new(vec![Value::Obj(leaf.clone())])));

        mark_object(&list);
        let survivors = heap.sweep();

        assert_eq!(survivors, 2);
        assert_eq!(leaf.as_str().map(|s| s.value.as_str()), Some("leaf"));
    }

    #[test]
    fn test_threshold_retunes_after_sweep() {
        let mut heap = Heap::new();
        for _ in 0..INITIAL_GC_THRESHOLD {
            heap.allocate(ObjKind::Str(StrObj::new("x")));
        }
        assert!(heap.should_collect());
        heap.sweep();
        // Nothing survived, so the threshold falls back to the floor.
        assert!(!heap.should_collect());
        assert_eq!(heap.collections(), 1);
    }
}
