//! Mark-and-sweep heap for the karst VM.
//!
//! # Architecture
//!
//! The [`Heap`] is the single allocator for every tagged heap object.  It is
//! a stop-the-world mark-and-sweep collector:
//!
//! 1. **Mark phase** — starting from the roots the VM supplies (value stack,
//!    globals, registered foreign functions, the last-pop register),
//!    recursively set the mark bit in each reachable object's header.
//! 2. **Sweep phase** — walk the allocation list; free unmarked objects whose
//!    header says the GC manages them; clear mark bits on survivors.
//!
//! Objects allocated with `gc = false` (compile-time literals such as string
//! and quoted-list constants) are never swept; they live until the heap is
//! dropped.
//!
//! Collections are triggered by the VM between instruction steps once the
//! approximate live byte count crosses a threshold that doubles after each
//! cycle.

use crate::value::{
    Cons, Foreign, ForeignFn, Function, Namespace, ObjHeader, Str, Table, Upvalue, UpvalueSlot,
    Value, TAG_CONS, TAG_FOREIGN, TAG_FUNC, TAG_NAMESPACE, TAG_STRING, TAG_TABLE,
};
use std::cell::RefCell;
use std::collections::HashMap;

// ─────────────────────────────────────────────────────────────────────────────
// Heap
// ─────────────────────────────────────────────────────────────────────────────

/// The garbage-collected heap.  Owns every allocation it hands out.
pub struct Heap {
    /// Every live allocation, tagged.  Swept entries are removed and freed.
    objects: Vec<Value>,
    /// Approximate live bytes.
    bytes_allocated: usize,
    /// Run a collection once `bytes_allocated` exceeds this.
    gc_threshold: usize,
    /// Completed GC cycles, for tests and debugging.
    pub cycles: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Initial collection threshold (1 MiB).
    const INITIAL_THRESHOLD: usize = 1024 * 1024;

    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            bytes_allocated: 0,
            gc_threshold: Self::INITIAL_THRESHOLD,
            cycles: 0,
        }
    }

    // ── Allocation ───────────────────────────────────────────────────────────

    /// Allocate a cons cell.
    pub fn alloc_cons(&mut self, head: Value, tail: Value, gc: bool) -> Value {
        let boxed = Box::new(Cons {
            header: ObjHeader::new(gc),
            head,
            tail,
        });
        self.finish_alloc(Box::into_raw(boxed), TAG_CONS)
    }

    /// Allocate a string.
    pub fn alloc_string(&mut self, text: impl Into<String>, gc: bool) -> Value {
        let text = text.into();
        let boxed = Box::new(Str {
            header: ObjHeader::new(gc),
            len: text.len() as u32,
            text,
        });
        self.finish_alloc(Box::into_raw(boxed), TAG_STRING)
    }

    /// Allocate an empty table.
    pub fn alloc_table(&mut self, gc: bool) -> Value {
        let boxed = Box::new(Table {
            header: ObjHeader::new(gc),
            contents: RefCell::new(HashMap::new()),
        });
        self.finish_alloc(Box::into_raw(boxed), TAG_TABLE)
    }

    /// Allocate an empty namespace.
    pub fn alloc_namespace(&mut self, gc: bool) -> Value {
        let boxed = Box::new(Namespace {
            header: ObjHeader::new(gc),
            contents: RefCell::new(HashMap::new()),
        });
        self.finish_alloc(Box::into_raw(boxed), TAG_NAMESPACE)
    }

    /// Allocate a closure over the given stub id.
    pub fn alloc_function(
        &mut self,
        stub: u16,
        upvals: Vec<UpvalueSlot>,
        init_vals: Vec<Value>,
        gc: bool,
    ) -> Value {
        let boxed = Box::new(Function {
            header: ObjHeader::new(gc),
            stub,
            upvals,
            init_vals,
        });
        self.finish_alloc(Box::into_raw(boxed), TAG_FUNC)
    }

    /// Allocate a foreign-function value.
    pub fn alloc_foreign(
        &mut self,
        name: impl Into<String>,
        min_args: u8,
        var_args: bool,
        func: ForeignFn,
        gc: bool,
    ) -> Value {
        let boxed = Box::new(Foreign {
            header: ObjHeader::new(gc),
            name: name.into(),
            min_args,
            var_args,
            func,
        });
        self.finish_alloc(Box::into_raw(boxed), TAG_FOREIGN)
    }

    /// Patch the header's self-reference, record the allocation, and return
    /// the tagged value.
    fn finish_alloc<T>(&mut self, ptr: *mut T, tag: u64) -> Value {
        // SAFETY: ptr came from Box::into_raw of a live allocation whose
        // layout begins with ObjHeader, and align(32) zeroes the tag bits.
        let v = unsafe {
            let v = Value::from_obj_ptr(ptr as *mut u8, tag);
            (*(ptr as *mut ObjHeader)).tagged = v;
            v
        };
        self.objects.push(v);
        self.bytes_allocated += Self::object_size(v);
        v
    }

    /// Approximate payload size of an allocation.
    fn object_size(v: Value) -> usize {
        // SAFETY: called only on values this heap allocated and not yet freed.
        unsafe {
            match v.tag() {
                TAG_CONS => std::mem::size_of::<Cons>(),
                TAG_STRING => std::mem::size_of::<Str>() + v.as_string().text.capacity(),
                TAG_TABLE => {
                    std::mem::size_of::<Table>()
                        + v.as_table().contents.borrow().capacity()
                            * 2
                            * std::mem::size_of::<Value>()
                }
                TAG_NAMESPACE => {
                    std::mem::size_of::<Namespace>()
                        + v.as_namespace().contents.borrow().capacity()
                            * 2
                            * std::mem::size_of::<Value>()
                }
                TAG_FUNC => {
                    std::mem::size_of::<Function>()
                        + v.as_function().upvals.capacity() * std::mem::size_of::<UpvalueSlot>()
                }
                TAG_FOREIGN => std::mem::size_of::<Foreign>() + v.as_foreign().name.capacity(),
                _ => 0,
            }
        }
    }

    // ── Marking ──────────────────────────────────────────────────────────────

    /// Mark a value as reachable and recursively trace its children.
    ///
    /// Safe to call on any value; non-heap tags are ignored.  The mark bit is
    /// set before recursing, so cyclic structures terminate.
    pub fn mark_value(&self, v: Value) {
        // SAFETY: roots and traced children are live by construction — the
        // sweep only frees objects nothing reachable points at.
        let Some(header) = (unsafe { v.obj_header() }) else {
            return;
        };
        if header.mark.get() {
            return;
        }
        header.mark.set(true);

        // SAFETY: as above; tags are trusted because this heap created them.
        unsafe {
            match v.tag() {
                TAG_CONS => {
                    let c = v.as_cons();
                    self.mark_value(c.head);
                    self.mark_value(c.tail);
                }
                TAG_TABLE => {
                    for (k, val) in v.as_table().contents.borrow().iter() {
                        self.mark_value(*k);
                        self.mark_value(*val);
                    }
                }
                TAG_NAMESPACE => {
                    for val in v.as_namespace().contents.borrow().values() {
                        self.mark_value(*val);
                    }
                }
                TAG_FUNC => {
                    let f = v.as_function();
                    for slot in &f.upvals {
                        if let Upvalue::Closed(val) = &*slot.borrow() {
                            self.mark_value(*val);
                        }
                        // Open slots point into the stack, which is a root.
                    }
                    for val in &f.init_vals {
                        self.mark_value(*val);
                    }
                }
                // Strings and foreign functions have no value children.
                _ => {}
            }
        }
    }

    // ── Collection ───────────────────────────────────────────────────────────

    /// Run a full GC cycle.  `mark_roots` must call [`Heap::mark_value`] on
    /// every live root.
    pub fn collect<F>(&mut self, mark_roots: F)
    where
        F: FnOnce(&Heap),
    {
        mark_roots(self);
        self.sweep();
        self.gc_threshold = (self.bytes_allocated * 2).max(Self::INITIAL_THRESHOLD);
        self.cycles += 1;
    }

    fn sweep(&mut self) {
        let mut kept = Vec::with_capacity(self.objects.len());
        let mut live_bytes = 0usize;
        for v in std::mem::take(&mut self.objects) {
            // SAFETY: every list entry is a live allocation of this heap.
            let (gc, marked) = unsafe {
                let h = v.obj_header().unwrap_or_else(|| {
                    unreachable!("heap allocation list holds only heap values")
                });
                (h.gc, h.mark.get())
            };
            if !gc || marked {
                // SAFETY: as above.
                unsafe {
                    if let Some(h) = v.obj_header() {
                        h.mark.set(false);
                    }
                }
                live_bytes += Self::object_size(v);
                kept.push(v);
            } else {
                // SAFETY: unreachable and GC-managed; nothing can observe it.
                unsafe { Self::free(v) };
            }
        }
        self.objects = kept;
        self.bytes_allocated = live_bytes;
    }

    /// Free one allocation.
    ///
    /// # Safety
    /// `v` must be an allocation of this heap that is not referenced anywhere.
    unsafe fn free(v: Value) {
        let ptr = (v.raw() & !0xf) as *mut u8;
        // SAFETY: ptr was produced by Box::into_raw with the matching type.
        unsafe {
            match v.tag() {
                TAG_CONS => drop(Box::from_raw(ptr as *mut Cons)),
                TAG_STRING => drop(Box::from_raw(ptr as *mut Str)),
                TAG_TABLE => drop(Box::from_raw(ptr as *mut Table)),
                TAG_NAMESPACE => drop(Box::from_raw(ptr as *mut Namespace)),
                TAG_FUNC => drop(Box::from_raw(ptr as *mut Function)),
                TAG_FOREIGN => drop(Box::from_raw(ptr as *mut Foreign)),
                _ => {}
            }
        }
    }

    // ── Introspection ────────────────────────────────────────────────────────

    /// Approximate live bytes.
    #[inline]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live allocations (for tests).
    #[inline]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// `true` once the threshold is crossed.
    #[inline]
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated >= self.gc_threshold
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("objects", &self.objects.len())
            .field("bytes_allocated", &self.bytes_allocated)
            .field("gc_threshold", &self.gc_threshold)
            .field("cycles", &self.cycles)
            .finish()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for v in std::mem::take(&mut self.objects) {
            // SAFETY: the heap owns every allocation; nothing outlives it.
            unsafe { Self::free(v) };
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{V_EMPTY, V_NULL};

    #[test]
    fn test_alloc_and_deref() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("hello", true);
        assert!(s.is_string());
        // SAFETY: just allocated, not collected.
        assert_eq!(unsafe { s.as_string() }.text, "hello");
        assert_eq!(unsafe { s.as_string() }.len, 5);
    }

    #[test]
    fn test_header_points_back_at_value() {
        let mut heap = Heap::new();
        let c = heap.alloc_cons(V_NULL, V_EMPTY, true);
        // SAFETY: alive.
        let header = unsafe { c.obj_header() }.unwrap();
        assert_eq!(header.tagged.raw(), c.raw());
        assert!(!header.mark.get(), "mark bit starts false");
        assert!(header.gc);
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = Heap::new();
        let kept = heap.alloc_cons(Value::number(1.0), V_EMPTY, true);
        let _dropped = heap.alloc_cons(Value::number(2.0), V_EMPTY, true);
        assert_eq!(heap.object_count(), 2);

        heap.collect(|h| h.mark_value(kept));

        assert_eq!(heap.cycles, 1);
        assert_eq!(heap.object_count(), 1);
        // SAFETY: kept was a root.
        assert_eq!(unsafe { kept.as_cons() }.head.as_num(), 1.0);
    }

    #[test]
    fn test_collect_keeps_non_gc_literals() {
        let mut heap = Heap::new();
        let literal = heap.alloc_string("constant", false);
        heap.collect(|_| {}); // no roots at all
        assert_eq!(heap.object_count(), 1);
        // SAFETY: gc=false objects survive every sweep.
        assert_eq!(unsafe { literal.as_string() }.text, "constant");
    }

    #[test]
    fn test_mark_traces_cons_chain() {
        let mut heap = Heap::new();
        let inner = heap.alloc_string("deep", true);
        let chain = heap.alloc_cons(inner, V_EMPTY, true);
        heap.collect(|h| h.mark_value(chain));
        assert_eq!(heap.object_count(), 2, "string is reachable via the cons");
    }

    #[test]
    fn test_mark_handles_cycles() {
        let mut heap = Heap::new();
        let t = heap.alloc_table(true);
        // SAFETY: t is alive.
        unsafe { t.as_table() }
            .contents
            .borrow_mut()
            .insert(Value::number(1.0), t);
        heap.collect(|h| h.mark_value(t));
        assert_eq!(heap.object_count(), 1);
    }
}
