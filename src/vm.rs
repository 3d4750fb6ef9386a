//! The karst virtual machine.
//!
//! A **stack-based interpreter** over the flat [`Bytecode`] array.  The VM
//! owns one fixed-capacity value stack, one instruction pointer, and a stack
//! of [`CallFrame`]s; the innermost frame's `bp`/`sp` delimit the live region
//! of the value stack.
//!
//! # Call discipline
//!
//! `OP_CALL n` finds the callee at depth `n`; a closure call extends the
//! frame chain with `bp = caller_bp + caller_sp − n`, so the callee sees its
//! arguments as the first `n` slots of its own frame, and jumps to the
//! stub's code address.  `OP_RETURN` closes the frame's open upvalues, pops
//! the frame, removes the arguments and the callee from the parent frame,
//! pushes the return value and jumps to the recorded return address.
//!
//! # Upvalues
//!
//! Each frame keeps the list of upvalue slots it has opened, keyed by
//! absolute stack position (opening is idempotent per position).  `OP_CLOSE n`
//! drops `n` slots and materialises every open upvalue at or above the new
//! stack top; a returning or unwinding frame closes all of its upvalues.
//! Slots are shared `Rc` cells, so every closure capturing the same variable
//! observes the same mutations, before and after the close.
//!
//! # GC integration
//!
//! Between instruction steps the VM triggers [`Heap::collect`] once the heap
//! crosses its threshold, rooting the live stack region, the globals
//! namespace, frame callers, the last-pop register, and registered foreign
//! functions.

use crate::ast::AstNode;
use crate::builtins;
use crate::bytecode::{instr_width, Bytecode, Op};
use crate::compiler::Compiler;
use crate::gc::Heap;
use crate::token::SourceLoc;
use crate::value::{
    ForeignFn, SymbolId, SymbolTable, Upvalue, UpvalueSlot, Value, V_NULL,
};
use crate::EvalError;
use std::cell::RefCell;
use std::rc::Rc;

/// Fixed capacity of the value stack.
pub const STACK_SIZE: usize = 1 << 14;

type VmResult<T> = Result<T, EvalError>;

// ─────────────────────────────────────────────────────────────────────────────
// Call frames
// ─────────────────────────────────────────────────────────────────────────────

/// One open upvalue of a frame, keyed by absolute stack position.
struct OpenUpvalue {
    pos: usize,
    slot: UpvalueSlot,
}

/// Per-invocation record.  The base frame (top level) has no caller.
struct CallFrame {
    /// Bytecode address to resume at after `OP_RETURN`.
    ret_addr: u32,
    /// Index into the value stack where this frame's slot 0 lives.
    bp: usize,
    /// The closure being executed, `None` at top level.
    caller: Option<Value>,
    /// Arguments this frame was entered with.
    num_args: u8,
    /// Stack positions in use within this frame.
    sp: usize,
    /// Upvalue slots still pointing into this frame's stack region.
    open_upvals: Vec<OpenUpvalue>,
}

impl CallFrame {
    fn base() -> Self {
        CallFrame {
            ret_addr: 0,
            bp: 0,
            caller: None,
            num_args: 0,
            sp: 0,
            open_upvals: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Vm
// ─────────────────────────────────────────────────────────────────────────────

/// The karst virtual machine.  Owns the bytecode module it executes, the
/// heap, the value stack and the frame chain.
///
/// The compiler writes into the same [`Bytecode`] the VM reads; the handoff
/// is quiescent — [`Vm::compile_node`] finishes a top-level form before
/// [`Vm::execute`] runs it.
pub struct Vm {
    code: Bytecode,
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    ip: u32,
    /// The globals namespace (a `gc = false` heap object rooted here).
    globals: Value,
    /// Last-popped value, surfaced to the REPL.
    lp: Value,
    /// Registered foreign-function values; GC roots.
    foreign: Vec<Value>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Create a VM with the standard builtins registered.
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let globals = heap.alloc_namespace(false);
        let mut vm = Vm {
            code: Bytecode::new(),
            heap,
            stack: vec![V_NULL; STACK_SIZE],
            frames: vec![CallFrame::base()],
            ip: 0,
            globals,
            lp: V_NULL,
            foreign: Vec::new(),
        };
        builtins::register_all(&mut vm);
        vm
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn symbols(&self) -> &SymbolTable {
        &self.code.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.code.symbols
    }

    pub fn code(&self) -> &Bytecode {
        &self.code
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The value most recently consumed by `OP_POP` — the result of the last
    /// completed top-level form.
    pub fn last_pop(&self) -> Value {
        self.lp
    }

    /// Read a global by name (non-interning).
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let sym = self.code.symbols.find(name)?;
        // SAFETY: the globals namespace is rooted for the VM's lifetime.
        unsafe { self.globals.as_namespace() }.get(sym)
    }

    /// Bind a global by name.
    pub fn set_global(&mut self, name: &str, v: Value) {
        let sym = self.code.intern(name);
        // SAFETY: as above.
        unsafe { self.globals.as_namespace() }.set(sym, v);
    }

    /// Register a foreign function as a global.  The value is retained as a
    /// GC root for the VM's lifetime.
    pub fn add_foreign(&mut self, name: &str, min_args: u8, var_args: bool, func: ForeignFn) {
        let sym = self.code.intern(name);
        let v = self.heap.alloc_foreign(name, min_args, var_args, func, false);
        // SAFETY: the globals namespace is rooted for the VM's lifetime.
        unsafe { self.globals.as_namespace() }.set(sym, v);
        self.foreign.push(v);
    }

    // ── Compilation entry ────────────────────────────────────────────────────

    /// Compile one top-level form onto the end of the bytecode array.
    ///
    /// On a compile error the array is rolled back to its previous size so a
    /// later [`Vm::execute`] never runs a half-emitted form.
    pub fn compile_node(&mut self, node: &AstNode) -> VmResult<()> {
        let start = self.code.size();
        let result = {
            let Self {
                code, heap, globals, ..
            } = self;
            Compiler::new(code, heap, *globals).compile_expr(node)
        };
        if result.is_err() {
            self.code.truncate(start);
        }
        result
    }

    // ── Execution loop ───────────────────────────────────────────────────────

    /// Run from the current instruction pointer to the end of the bytecode.
    ///
    /// On error the frame chain is unwound (open upvalues closed, frames
    /// released) and the remaining code of the aborted form is skipped, so
    /// the VM stays usable.
    pub fn execute(&mut self) -> VmResult<()> {
        while self.ip < self.code.size() {
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            if let Err(e) = self.step() {
                self.unwind();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Decode and execute a single instruction.
    fn step(&mut self) -> VmResult<()> {
        let byte = self.code.read_byte(self.ip);
        let op = Op::try_from(byte)
            .map_err(|b| self.interp_err(format!("unrecognized opcode {b:#04x}")))?;

        // An instruction that transfers control sets `jump`; everything else
        // advances by its own width.
        let mut jump: Option<u32> = None;

        match op {
            Op::Nop => {}
            Op::Pop => {
                self.lp = self.pop()?;
            }
            Op::Local => {
                let slot = self.code.read_byte(self.ip + 1);
                let v = self.local(slot)?;
                self.push(v)?;
            }
            Op::SetLocal => {
                let slot = self.code.read_byte(self.ip + 1);
                let v = self.pop()?;
                self.set_local(slot, v)?;
            }
            Op::Copy => {
                let depth = self.code.read_byte(self.ip + 1);
                let v = self.peek(depth as usize)?;
                self.push(v)?;
            }
            Op::Upvalue => {
                let id = self.code.read_byte(self.ip + 1);
                let slot = self.upvalue_slot(id)?;
                let v = slot.borrow().get(&self.stack);
                self.push(v)?;
            }
            Op::SetUpvalue => {
                let id = self.code.read_byte(self.ip + 1);
                let slot = self.upvalue_slot(id)?;
                let v = self.pop()?;
                slot.borrow_mut().set(&mut self.stack, v);
            }
            Op::Closure => {
                self.op_closure()?;
            }
            Op::Close => {
                let n = self.code.read_byte(self.ip + 1) as usize;
                self.close_upvalues(n)?;
            }
            Op::Global => {
                let name = self.pop()?;
                let sym = self.global_key(name)?;
                // SAFETY: globals namespace is rooted.
                let found = unsafe { self.globals.as_namespace() }.get(sym);
                match found {
                    Some(v) => self.push(v)?,
                    None => {
                        let rendered = self.code.symbols.name(sym).to_string();
                        return Err(self.interp_err(format!("unbound global `{rendered}`")));
                    }
                }
            }
            Op::SetGlobal => {
                let value = self.pop()?;
                // The name stays on the stack.
                let name = self.peek(0)?;
                let sym = self.global_key_interning(name)?;
                // SAFETY: globals namespace is rooted.
                unsafe { self.globals.as_namespace() }.set(sym, value);
            }
            Op::Const => {
                let id = self.code.read_short(self.ip + 1);
                let constant = self.code.get_constant(id);
                match constant {
                    Some(v) => self.push(v)?,
                    None => return Err(self.rt_err(format!("unknown constant id {id}"))),
                }
            }
            Op::Null => self.push(V_NULL)?,
            Op::False => self.push(crate::value::V_FALSE)?,
            Op::True => self.push(crate::value::V_TRUE)?,
            Op::ObjGet => {
                let key = self.pop()?;
                let obj = self.pop()?;
                let v = self.obj_get(obj, key)?;
                self.push(v)?;
            }
            Op::ObjSet => {
                let value = self.pop()?;
                let key = self.pop()?;
                let obj = self.pop()?;
                self.obj_set(obj, key, value)?;
                self.push(value)?;
            }
            Op::Module | Op::Import | Op::Apply => {
                return Err(self.interp_err(format!("opcode {op:?} is reserved")));
            }
            Op::Jump => {
                jump = Some(self.jump_target()?);
            }
            Op::CJump => {
                let v = self.pop()?;
                if !v.is_truthy() {
                    jump = Some(self.jump_target()?);
                }
            }
            Op::Call => {
                let argc = self.code.read_byte(self.ip + 1);
                jump = self.op_call(argc)?;
            }
            Op::Return => {
                jump = Some(self.op_return()?);
            }
        }

        match jump {
            Some(addr) => self.ip = addr,
            None => self.ip += instr_width(op),
        }
        Ok(())
    }

    /// Resolve a relative jump operand against the current instruction.
    fn jump_target(&self) -> VmResult<u32> {
        let offset = self.code.read_short(self.ip + 1) as i16;
        let target = self.ip as i64 + 3 + offset as i64;
        if target < 0 {
            return Err(self.rt_err("jump target out of bounds"));
        }
        Ok(target as u32)
    }

    // ── Calls and returns ────────────────────────────────────────────────────

    fn op_call(&mut self, argc: u8) -> VmResult<Option<u32>> {
        let argc_us = argc as usize;
        // The callee sits below the arguments.
        let callee = self.peek(argc_us)?;

        if callee.is_function() {
            // SAFETY: the callee is on the stack, hence alive.
            let stub_id = unsafe { callee.as_function() }.stub;
            let stub = self
                .code
                .function(stub_id)
                .ok_or_else(|| self.rt_err(format!("unknown function id {stub_id}")))?;
            let required = stub.required() as usize;
            let positional = stub.positional.len();
            let var_list = stub.var_list;
            let addr = stub.addr;
            if argc_us < required {
                return Err(self.interp_err(format!(
                    "too few arguments in function call: expected {required}, got {argc}"
                )));
            }
            if !var_list && argc_us > positional {
                return Err(self.interp_err(format!(
                    "too many arguments in function call: expected {positional}, got {argc}"
                )));
            }
            let (bp, sp) = {
                let f = self.frame();
                (f.bp, f.sp)
            };
            self.frames.push(CallFrame {
                ret_addr: self.ip + 2,
                bp: bp + sp - argc_us,
                caller: Some(callee),
                num_args: argc,
                sp: argc_us,
                open_upvals: Vec::new(),
            });
            Ok(Some(addr))
        } else if callee.is_foreign() {
            // SAFETY: as above.
            let (min_args, var_args, func) = {
                let f = unsafe { callee.as_foreign() };
                (f.min_args as usize, f.var_args, f.func)
            };
            if argc_us < min_args {
                return Err(self.interp_err(format!(
                    "too few arguments to foreign function: expected {min_args}, got {argc}"
                )));
            }
            if !var_args && argc_us > min_args {
                return Err(self.interp_err(format!(
                    "too many arguments to foreign function: expected {min_args}, got {argc}"
                )));
            }
            let (bp, sp) = {
                let f = self.frame();
                (f.bp, f.sp)
            };
            // Values are one word; copying the argument window keeps the
            // foreign call free to use the VM handle.
            let args: Vec<Value> = self.stack[bp + sp - argc_us..bp + sp].to_vec();
            let result = func(self, &args)?;
            self.pop_times(argc_us + 1)?;
            self.push(result)?;
            Ok(None)
        } else {
            Err(self.interp_err(format!(
                "attempt to call a value of type {}",
                callee.type_name()
            )))
        }
    }

    fn op_return(&mut self) -> VmResult<u32> {
        if self.frames.len() == 1 {
            return Err(self.interp_err("return instruction at top level"));
        }
        let v = self.pop()?;
        // Everything this frame captured migrates to the heap.
        {
            let Self { frames, stack, .. } = self;
            let frame = frames.last_mut().unwrap();
            for u in frame.open_upvals.drain(..) {
                u.slot.borrow_mut().close(stack);
            }
            frame.sp = 0;
        }
        let frame = self.frames.pop().unwrap();
        // Drop the arguments and the callee from the parent frame.
        self.pop_times(frame.num_args as usize + 1)?;
        self.push(v)?;
        Ok(frame.ret_addr)
    }

    // ── Closures and upvalues ────────────────────────────────────────────────

    fn op_closure(&mut self) -> VmResult<()> {
        let id = self.code.read_short(self.ip + 1);
        let descs = match self.code.function(id) {
            Some(stub) => stub.upvals.clone(),
            None => return Err(self.rt_err(format!("unknown function id {id}"))),
        };
        let mut upvals = Vec::with_capacity(descs.len());
        for desc in descs {
            let slot = if desc.direct {
                let (bp, sp) = {
                    let f = self.frame();
                    (f.bp, f.sp)
                };
                if desc.slot as usize >= sp {
                    return Err(self.rt_err("upvalue capture outside the current frame"));
                }
                self.open_upvalue(bp + desc.slot as usize)
            } else {
                self.upvalue_slot(desc.slot)?
            };
            upvals.push(slot);
        }
        let v = self.heap.alloc_function(id, upvals, Vec::new(), true);
        self.push(v)
    }

    /// Obtain or create the shared slot for an open upvalue at an absolute
    /// stack position.  Idempotent per position within a frame.
    fn open_upvalue(&mut self, pos: usize) -> UpvalueSlot {
        let frame = self.frames.last_mut().unwrap();
        if let Some(u) = frame.open_upvals.iter().find(|u| u.pos == pos) {
            return u.slot.clone();
        }
        let slot: UpvalueSlot = Rc::new(RefCell::new(Upvalue::Open(pos)));
        frame.open_upvals.push(OpenUpvalue {
            pos,
            slot: slot.clone(),
        });
        slot
    }

    /// The current closure's upvalue slot by id.
    fn upvalue_slot(&self, id: u8) -> VmResult<UpvalueSlot> {
        let caller = self
            .frame()
            .caller
            .ok_or_else(|| self.interp_err("upvalue access outside a function"))?;
        // SAFETY: the executing closure is rooted by its frame.
        let func = unsafe { caller.as_function() };
        func.upvals
            .get(id as usize)
            .cloned()
            .ok_or_else(|| self.interp_err(format!("nonexistent upvalue {id}")))
    }

    /// `OP_CLOSE n`: drop n stack slots, materialising every upvalue that
    /// still points at or above the new stack top.
    fn close_upvalues(&mut self, n: usize) -> VmResult<()> {
        if self.frame().sp < n {
            return Err(self.rt_err("close below the frame base"));
        }
        let Self { frames, stack, .. } = self;
        let frame = frames.last_mut().unwrap();
        let new_sp = frame.sp - n;
        let boundary = frame.bp + new_sp;
        frame.open_upvals.retain(|u| {
            if u.pos >= boundary {
                u.slot.borrow_mut().close(stack);
                false
            } else {
                true
            }
        });
        frame.sp = new_sp;
        Ok(())
    }

    // ── Globals and objects ──────────────────────────────────────────────────

    /// Resolve an `OP_GLOBAL` operand to a symbol id (non-interning).
    fn global_key(&self, name: Value) -> VmResult<SymbolId> {
        if name.is_symbol() {
            return Ok(name.sym_id());
        }
        if name.is_string() {
            // SAFETY: popped from the stack, hence alive.
            let text = unsafe { name.as_string() };
            return self
                .code
                .symbols
                .find(&text.text)
                .ok_or_else(|| self.interp_err(format!("unbound global `{}`", text.text)));
        }
        Err(self.interp_err(format!(
            "global name must be a symbol or string, got {}",
            name.type_name()
        )))
    }

    /// As [`Vm::global_key`], but interns unknown string names (used by
    /// `OP_SET_GLOBAL`, which creates bindings).
    fn global_key_interning(&mut self, name: Value) -> VmResult<SymbolId> {
        if name.is_symbol() {
            return Ok(name.sym_id());
        }
        if name.is_string() {
            // SAFETY: on the stack, hence alive.
            let text = unsafe { name.as_string() }.text.clone();
            return Ok(self.code.intern(&text));
        }
        Err(self.interp_err(format!(
            "global name must be a symbol or string, got {}",
            name.type_name()
        )))
    }

    pub(crate) fn obj_get(&self, obj: Value, key: Value) -> VmResult<Value> {
        if obj.is_table() {
            // SAFETY: popped from the stack, hence alive.
            let t = unsafe { obj.as_table() };
            return Ok(t.contents.borrow().get(&key).copied().unwrap_or(V_NULL));
        }
        if obj.is_namespace() {
            if !key.is_symbol() {
                return Err(self.interp_err("namespace keys must be symbols"));
            }
            // SAFETY: as above.
            let ns = unsafe { obj.as_namespace() };
            return Ok(ns.get(key.sym_id()).unwrap_or(V_NULL));
        }
        Err(self.interp_err(format!(
            "cannot read a property of a {}",
            obj.type_name()
        )))
    }

    pub(crate) fn obj_set(&mut self, obj: Value, key: Value, value: Value) -> VmResult<()> {
        if obj.is_table() {
            // SAFETY: popped from the stack, hence alive.
            let t = unsafe { obj.as_table() };
            t.contents.borrow_mut().insert(key, value);
            return Ok(());
        }
        if obj.is_namespace() {
            if !key.is_symbol() {
                return Err(self.interp_err("namespace keys must be symbols"));
            }
            // SAFETY: as above.
            unsafe { obj.as_namespace() }.set(key.sym_id(), value);
            return Ok(());
        }
        Err(self.interp_err(format!(
            "cannot set a property of a {}",
            obj.type_name()
        )))
    }

    // ── Stack primitives ─────────────────────────────────────────────────────

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn push(&mut self, v: Value) -> VmResult<()> {
        let (bp, sp) = {
            let f = self.frame();
            (f.bp, f.sp)
        };
        if bp + sp >= STACK_SIZE {
            return Err(self.rt_err("stack exhausted"));
        }
        self.stack[bp + sp] = v;
        self.frames.last_mut().unwrap().sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> VmResult<Value> {
        let (bp, sp) = {
            let f = self.frame();
            (f.bp, f.sp)
        };
        if sp == 0 {
            return Err(self.rt_err("pop on an empty call frame"));
        }
        self.frames.last_mut().unwrap().sp = sp - 1;
        Ok(self.stack[bp + sp - 1])
    }

    fn pop_times(&mut self, n: usize) -> VmResult<()> {
        if self.frame().sp < n {
            return Err(self.rt_err("pop below the frame base"));
        }
        self.frames.last_mut().unwrap().sp -= n;
        Ok(())
    }

    fn peek(&self, depth: usize) -> VmResult<Value> {
        let f = self.frame();
        if f.sp <= depth {
            return Err(self.rt_err("peek out of stack bounds"));
        }
        Ok(self.stack[f.bp + f.sp - 1 - depth])
    }

    fn local(&self, slot: u8) -> VmResult<Value> {
        let f = self.frame();
        if f.sp <= slot as usize {
            return Err(self.rt_err("local access outside the current frame"));
        }
        Ok(self.stack[f.bp + slot as usize])
    }

    fn set_local(&mut self, slot: u8, v: Value) -> VmResult<()> {
        let f = self.frame();
        if f.sp <= slot as usize {
            return Err(self.rt_err("local access outside the current frame"));
        }
        let pos = f.bp + slot as usize;
        self.stack[pos] = v;
        Ok(())
    }

    // ── Unwinding and GC ─────────────────────────────────────────────────────

    /// Release every frame above the base, closing open upvalues so no slot
    /// is left pointing at dead stack, then skip the rest of the aborted
    /// form's code.
    fn unwind(&mut self) {
        let Self { frames, stack, .. } = self;
        while frames.len() > 1 {
            let frame = frames.last_mut().unwrap();
            for u in frame.open_upvals.drain(..) {
                u.slot.borrow_mut().close(stack);
            }
            frames.pop();
        }
        let base = frames.last_mut().unwrap();
        for u in base.open_upvals.drain(..) {
            u.slot.borrow_mut().close(stack);
        }
        base.sp = 0;
        self.ip = self.code.size();
    }

    fn collect_garbage(&mut self) {
        let Self {
            heap,
            stack,
            frames,
            globals,
            lp,
            foreign,
            ..
        } = self;
        let top = frames.last().map(|f| f.bp + f.sp).unwrap_or(0);
        heap.collect(|h| {
            for v in &stack[..top] {
                h.mark_value(*v);
            }
            h.mark_value(*globals);
            h.mark_value(*lp);
            for v in foreign.iter() {
                h.mark_value(*v);
            }
            for frame in frames.iter() {
                if let Some(caller) = frame.caller {
                    h.mark_value(caller);
                }
                for u in &frame.open_upvals {
                    if let Upvalue::Closed(v) = &*u.slot.borrow() {
                        h.mark_value(*v);
                    }
                }
            }
        });
    }

    // ── Error helpers ────────────────────────────────────────────────────────

    /// The source location of the current instruction, from the source map.
    fn here(&self) -> SourceLoc {
        self.code
            .location_of(self.ip)
            .unwrap_or_else(SourceLoc::unknown)
    }

    fn rt_err(&self, message: impl Into<String>) -> EvalError {
        EvalError::runtime(message, self.here())
    }

    fn interp_err(&self, message: impl Into<String>) -> EvalError {
        EvalError::interpreter(message, self.here())
    }

    /// Raise an interpreter error from foreign code, stamped with the
    /// current source location.
    pub fn error(&self, message: impl Into<String>) -> EvalError {
        self.interp_err(message)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{display_value, V_FALSE, V_TRUE};
    use crate::{eval, KarstError, Subsystem};

    fn eval_ok(src: &str) -> (Vm, Value) {
        let mut vm = Vm::new();
        let v = eval(&mut vm, src, "test").expect("eval failed");
        (vm, v)
    }

    fn eval_err(src: &str) -> EvalError {
        let mut vm = Vm::new();
        match eval(&mut vm, src, "test") {
            Err(KarstError::Eval(e)) => e,
            other => panic!("expected an eval error, got {other:?}"),
        }
    }

    fn assert_num(src: &str, expected: f64) {
        let (_vm, v) = eval_ok(src);
        assert!(v.is_num(), "{src} produced {v:?}");
        assert_eq!(v.as_num(), expected, "{src}");
    }

    // ── Literals round-trip through the last-pop register ────────────────────

    #[test]
    fn test_literal_atoms_round_trip() {
        assert_num("42", 42.0);
        let (_vm, v) = eval_ok("true");
        assert_eq!(v.raw(), V_TRUE.raw());
        let (_vm, v) = eval_ok("false");
        assert_eq!(v.raw(), V_FALSE.raw());
        let (_vm, v) = eval_ok("null");
        assert!(v.is_null());
        let (vm, v) = eval_ok("\"hello\"");
        assert_eq!(display_value(v, vm.symbols()), "\"hello\"");
    }

    // ── def / do ─────────────────────────────────────────────────────────────

    #[test]
    fn test_def_binds_global_and_do_reads_it() {
        let (vm, v) = eval_ok("(def x 3) (do x)");
        assert_eq!(v.as_num(), 3.0);
        assert_eq!(vm.get_global("x").unwrap().as_num(), 3.0);
    }

    #[test]
    fn test_def_evaluates_to_null() {
        let (_vm, v) = eval_ok("(def x 3)");
        assert!(v.is_null());
    }

    #[test]
    fn test_empty_do_is_null() {
        let (_vm, v) = eval_ok("(do)");
        assert!(v.is_null());
    }

    #[test]
    fn test_do_sequences_left_to_right() {
        assert_num("(def x 1) (do (set! x 2) (set! x (+ x 10)) x)", 12.0);
    }

    // ── if ───────────────────────────────────────────────────────────────────

    #[test]
    fn test_if_branches() {
        assert_num("(if true 10 20)", 10.0);
        assert_num("(if false 10 20)", 20.0);
        assert_num("(if null 10 20)", 20.0);
        // Every non-null non-false value is truthy, including 0 and ().
        assert_num("(if 0 10 20)", 10.0);
        assert_num("(if '() 10 20)", 10.0);
    }

    #[test]
    fn test_if_evaluates_exactly_one_branch() {
        let (vm, _v) = eval_ok(
            "(def hits 0)
             (defn bump (tag) (set! hits (+ hits 1)))
             (if true (bump 1) (bump 2))",
        );
        assert_eq!(vm.get_global("hits").unwrap().as_num(), 1.0);
    }

    // ── and / or ─────────────────────────────────────────────────────────────

    #[test]
    fn test_and_yields_determining_operand() {
        assert_num("(and true 1 2)", 2.0);
        let (_vm, v) = eval_ok("(and 1 false 2)");
        assert_eq!(v.raw(), V_FALSE.raw());
        let (_vm, v) = eval_ok("(and)");
        assert_eq!(v.raw(), V_TRUE.raw());
    }

    #[test]
    fn test_or_yields_determining_operand() {
        assert_num("(or false null 7)", 7.0);
        let (_vm, v) = eval_ok("(or false false)");
        assert_eq!(v.raw(), V_FALSE.raw());
        let (_vm, v) = eval_ok("(or)");
        assert_eq!(v.raw(), V_FALSE.raw());
    }

    fn tick(vm: &mut Vm, _args: &[Value]) -> Result<Value, EvalError> {
        let n = vm.get_global("ticks").map(|v| v.as_num()).unwrap_or(0.0);
        vm.set_global("ticks", Value::number(n + 1.0));
        Ok(V_TRUE)
    }

    #[test]
    fn test_short_circuits_are_observable_via_foreign_calls() {
        let mut vm = Vm::new();
        vm.add_foreign("tick!", 0, false, tick);
        eval(&mut vm, "(def ticks 0) (and false (tick!))", "test").unwrap();
        assert_eq!(vm.get_global("ticks").unwrap().as_num(), 0.0);
        eval(&mut vm, "(and true (tick!))", "test").unwrap();
        assert_eq!(vm.get_global("ticks").unwrap().as_num(), 1.0);
        eval(&mut vm, "(or 7 (tick!))", "test").unwrap();
        assert_eq!(vm.get_global("ticks").unwrap().as_num(), 1.0);
        eval(&mut vm, "(or false (tick!))", "test").unwrap();
        assert_eq!(vm.get_global("ticks").unwrap().as_num(), 2.0);
    }

    // ── let ──────────────────────────────────────────────────────────────────

    #[test]
    fn test_let_binds_and_yields_body() {
        assert_num("(let x 1 y 2 (do x))", 1.0);
        assert_num("(let x 1 y 2 (+ x y))", 3.0);
    }

    #[test]
    fn test_let_without_body_is_null() {
        let (_vm, v) = eval_ok("(let x 1 y 2)");
        assert!(v.is_null());
    }

    #[test]
    fn test_let_restores_stack_depth() {
        let (vm, _v) = eval_ok("(let a 1 b 2 c 3 (+ a (+ b c)))");
        assert_eq!(vm.frames.last().unwrap().sp, 0);
        assert_eq!(vm.frames.len(), 1);
    }

    #[test]
    fn test_let_shadows_outer_binding() {
        assert_num("(let x 1 (let x 2 x))", 2.0);
    }

    // ── Functions and closures ───────────────────────────────────────────────

    #[test]
    fn test_function_call_and_return() {
        assert_num("((fn (a b) (+ a b)) 3 4)", 7.0);
        assert_num("(defn add3 (a b c) (+ a (+ b c))) (add3 1 2 3)", 6.0);
    }

    #[test]
    fn test_nested_calls_restore_frames() {
        let (vm, v) = eval_ok("(defn twice (f x) (f (f x))) (twice (fn (n) (* n 2)) 3)");
        assert_eq!(v.as_num(), 12.0);
        assert_eq!(vm.frames.len(), 1);
        assert_eq!(vm.frames[0].sp, 0);
    }

    #[test]
    fn test_closure_captures_let_binding_after_scope_exit() {
        assert_num("(def f (let x 7 (fn () x))) (f)", 7.0);
    }

    #[test]
    fn test_closure_captures_parameter_after_return() {
        assert_num("(defn make (x) (fn () x)) (def f (make 9)) (f)", 9.0);
    }

    #[test]
    fn test_two_closures_share_one_upvalue_cell() {
        let src = "(def cell (let n 0 (list (fn () n) (fn (v) (set! n v)))))
                   (def get-n (head cell))
                   (def set-n (head (tail cell)))
                   (set-n 42)
                   (get-n)";
        assert_num(src, 42.0);
    }

    #[test]
    fn test_sharing_survives_frame_closure() {
        // The binding frame is long gone by the time the writes happen.
        let src = "(defn make-counter ()
                     (let n 0
                       (list (fn () (set! n (+ n 1))) (fn () n))))
                   (def c (make-counter))
                   ((head c)) ((head c)) ((head c))
                   ((head (tail c)))";
        assert_num(src, 3.0);
    }

    #[test]
    fn test_distinct_instantiations_get_distinct_cells() {
        let src = "(defn make-counter ()
                     (let n 0
                       (fn () (set! n (+ n 1)) n)))
                   (def a (make-counter))
                   (def b (make-counter))
                   (a) (a)
                   (b)";
        assert_num(src, 1.0);
    }

    #[test]
    fn test_chained_capture_through_two_levels() {
        assert_num("((((fn (x) (fn () (fn () x))) 5)))", 5.0);
    }

    #[test]
    fn test_recursion_via_globals() {
        assert_num(
            "(defn fact (n) (if (< n 2) 1 (* n (fact (- n 1))))) (fact 10)",
            3628800.0,
        );
    }

    // ── Errors ───────────────────────────────────────────────────────────────

    #[test]
    fn test_calling_a_non_function_is_an_interpreter_error() {
        let err = eval_err("(3 4)");
        assert_eq!(err.subsystem, Subsystem::Interpreter);
        assert!(err.message.contains("call"));
        assert_eq!(err.loc.line, 1, "source location must be populated");
        assert_eq!(&*err.loc.file, "test");
    }

    #[test]
    fn test_closure_arity_errors() {
        let err = eval_err("((fn (x) x))");
        assert_eq!(err.subsystem, Subsystem::Interpreter);
        assert!(err.message.contains("too few"));
        let err = eval_err("((fn () 1) 2)");
        assert!(err.message.contains("too many"));
    }

    #[test]
    fn test_foreign_arity_errors() {
        let err = eval_err("(cons 1)");
        assert_eq!(err.subsystem, Subsystem::Interpreter);
        assert!(err.message.contains("too few"));
    }

    #[test]
    fn test_unbound_global_is_a_name_error() {
        let err = eval_err("nope");
        assert_eq!(err.subsystem, Subsystem::Interpreter);
        assert!(err.message.contains("unbound global `nope`"));
    }

    #[test]
    fn test_return_at_top_level_errors() {
        let mut vm = Vm::new();
        vm.code.write_op(Op::Return);
        let err = vm.execute().unwrap_err();
        assert_eq!(err.subsystem, Subsystem::Interpreter);
        assert!(err.message.contains("top level"));
    }

    #[test]
    fn test_reserved_opcodes_error() {
        let mut vm = Vm::new();
        vm.code.write_op(Op::Apply);
        vm.code.write_byte(0);
        let err = vm.execute().unwrap_err();
        assert!(err.message.contains("reserved"));
    }

    #[test]
    fn test_stack_exhaustion_is_a_runtime_error_and_recoverable() {
        let mut vm = Vm::new();
        let err = match eval(&mut vm, "(defn spin (n) (spin (+ n 1))) (spin 0)", "test") {
            Err(KarstError::Eval(e)) => e,
            other => panic!("expected stack exhaustion, got {other:?}"),
        };
        assert_eq!(err.subsystem, Subsystem::Runtime);
        assert!(err.message.contains("stack exhausted"));
        // The unwind must leave a usable machine behind.
        assert_eq!(vm.frames.len(), 1);
        assert_eq!(vm.frames[0].sp, 0);
        let v = eval(&mut vm, "(+ 1 2)", "test").unwrap();
        assert_eq!(v.as_num(), 3.0);
    }

    // ── Stack discipline ─────────────────────────────────────────────────────

    #[test]
    fn test_every_form_leaves_the_stack_at_base_depth() {
        let forms = [
            "42",
            "(def q 1)",
            "(if true 1 2)",
            "(and 1 2 3)",
            "(or false 2)",
            "(let x 1 y 2 (+ x y))",
            "((fn (x) x) 9)",
            "'(1 2 3)",
            "(set! q 5)",
        ];
        let mut vm = Vm::new();
        for form in forms {
            eval(&mut vm, form, "test").unwrap();
            assert_eq!(vm.frames.len(), 1, "{form} left extra frames");
            assert_eq!(vm.frames[0].sp, 0, "{form} left stack residue");
        }
    }

    #[test]
    fn test_cjump_pops_exactly_once_on_both_branches() {
        let mut vm = Vm::new();
        for src in ["(if true 1 2)", "(if false 1 2)"] {
            eval(&mut vm, src, "test").unwrap();
            assert_eq!(vm.frames[0].sp, 0, "{src}");
        }
    }

    // ── Globals opcode details ───────────────────────────────────────────────

    #[test]
    fn test_set_global_leaves_name_on_stack() {
        // Raw emission: Const(sym) Const(num) SetGlobal — the symbol must
        // survive on top of the stack afterwards.
        let mut vm = Vm::new();
        let sym = vm.code.intern("g");
        let name_id = vm.code.sym_const(sym);
        let val_id = vm.code.num_const(5.0);
        vm.code.write_op(Op::Const);
        vm.code.write_short(name_id);
        vm.code.write_op(Op::Const);
        vm.code.write_short(val_id);
        vm.code.write_op(Op::SetGlobal);
        vm.execute().unwrap();
        assert_eq!(vm.frames[0].sp, 1);
        assert!(vm.stack[0].is_symbol());
        assert_eq!(vm.stack[0].sym_id(), sym);
        assert_eq!(vm.get_global("g").unwrap().as_num(), 5.0);
    }

    // ── Quote ────────────────────────────────────────────────────────────────

    #[test]
    fn test_quote_produces_list_values() {
        let (vm, v) = eval_ok("'(1 2 3)");
        assert_eq!(display_value(v, vm.symbols()), "(1 2 3)");
        let (vm, v) = eval_ok("'sym");
        assert_eq!(display_value(v, vm.symbols()), "sym");
        let (_vm, v) = eval_ok("'()");
        assert!(v.is_empty());
    }

    #[test]
    fn test_compile_error_rolls_back_partial_emission() {
        let mut vm = Vm::new();
        // The def's name constant is emitted before the bad value errors out.
        let err = eval(&mut vm, "(def x (quasiquote y))", "test");
        assert!(matches!(err, Err(KarstError::Eval(_))));
        // Nothing half-compiled may run on the next eval.
        let v = eval(&mut vm, "(+ 1 2)", "test").unwrap();
        assert_eq!(v.as_num(), 3.0);
        assert_eq!(vm.frames[0].sp, 0);
    }

    // ── GC under execution ───────────────────────────────────────────────────

    #[test]
    fn test_collection_preserves_reachable_values() {
        let mut vm = Vm::new();
        eval(
            &mut vm,
            "(def keep (cons 1 (cons 2 '()))) (def f (let n 5 (fn () n)))",
            "test",
        )
        .unwrap();
        vm.collect_garbage();
        let v = eval(&mut vm, "(head keep)", "test").unwrap();
        assert_eq!(v.as_num(), 1.0);
        let v = eval(&mut vm, "(f)", "test").unwrap();
        assert_eq!(v.as_num(), 5.0);
    }
}
