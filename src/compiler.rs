//! Single-pass s-expression-to-bytecode compiler.
//!
//! The compiler walks [`AstNode`]s and emits directly into a [`Bytecode`]
//! module.  There is no intermediate representation: every form is lowered
//! the moment it is seen, with forward jumps backpatched.
//!
//! # Scope model
//!
//! Lexical scopes form a stack of [`Scope`]s.  Each scope maps symbol ids to
//! frame-relative stack slots, records the compile-time stack pointer `sp`
//! (inherited from its parent on creation), and — at function boundaries —
//! points at the stub being compiled.  Resolving a name walks the stack
//! outward, counting how many function boundaries it crosses; one or more
//! crossings synthesise a chain of upvalue descriptors on the intervening
//! stubs.
//!
//! # Dispatch
//!
//! Lists dispatch on their head symbol: special forms go to dedicated
//! emitters, everything else compiles as a call (callee, then arguments
//! left-to-right, then `OP_CALL argc`).  Reserved-but-unimplemented form
//! names are compile errors rather than silently compiling as calls.
//!
//! Compilation stops at the first error; there is no recovery pass.

use std::collections::HashMap;

use crate::ast::{AstKind, AstNode};
use crate::bytecode::{Bytecode, Op};
use crate::gc::Heap;
use crate::token::SourceLoc;
use crate::value::{SymbolId, Value, V_EMPTY};
use crate::EvalError;

type CResult<T> = Result<T, EvalError>;

/// Names the compiler recognises as special-form heads.  Any of these that
/// lacks an emitter is a compile error when it appears in head position.
const RESERVED_FORMS: &[&str] = &[
    "and",
    "or",
    "def",
    "defmacro",
    "defn",
    "do",
    "dot",
    "dollar-fn",
    "if",
    "import",
    "fn",
    "let",
    "letfn",
    "quasiquote",
    "quote",
    "unquote",
    "unquote-splicing",
    "set!",
    "with",
];

// ─────────────────────────────────────────────────────────────────────────────
// Scopes
// ─────────────────────────────────────────────────────────────────────────────

/// One lexical scope.
struct Scope {
    /// Locally bound names → frame-relative stack slot.
    vars: HashMap<SymbolId, u8>,
    /// The stub under compilation, set only at function boundaries.
    func: Option<u16>,
    /// Compile-time stack pointer: where the next value pushed at runtime
    /// will land, relative to the frame base.
    sp: u16,
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiler
// ─────────────────────────────────────────────────────────────────────────────

/// The karst bytecode compiler.  One instance compiles one top-level form;
/// globals and interned symbols persist in the [`Bytecode`] it writes to.
pub struct Compiler<'a> {
    code: &'a mut Bytecode,
    heap: &'a mut Heap,
    /// The namespace new function stubs are defined in.
    globals: Value,
    scopes: Vec<Scope>,
}

impl<'a> Compiler<'a> {
    pub fn new(code: &'a mut Bytecode, heap: &'a mut Heap, globals: Value) -> Self {
        Self {
            code,
            heap,
            globals,
            scopes: vec![Scope {
                vars: HashMap::new(),
                func: None,
                sp: 0,
            }],
        }
    }

    /// Compile one top-level expression followed by the `OP_POP` that parks
    /// its value in the VM's last-pop register.
    pub fn compile_expr(&mut self, node: &AstNode) -> CResult<()> {
        self.compile_subexpr(node)?;
        self.emit(Op::Pop);
        self.dec_sp(1);
        Ok(())
    }

    // ── Stack-pointer bookkeeping ────────────────────────────────────────────

    fn sp(&self) -> u16 {
        self.scopes.last().unwrap().sp
    }

    fn inc_sp(&mut self) {
        self.scopes.last_mut().unwrap().sp += 1;
    }

    fn dec_sp(&mut self, n: u16) {
        self.scopes.last_mut().unwrap().sp -= n;
    }

    fn set_sp(&mut self, sp: u16) {
        self.scopes.last_mut().unwrap().sp = sp;
    }

    // ── Emission helpers ─────────────────────────────────────────────────────

    fn emit(&mut self, op: Op) {
        self.code.write_op(op);
    }

    fn emit_u8(&mut self, op: Op, operand: u8) {
        self.code.write_op(op);
        self.code.write_byte(operand);
    }

    fn emit_u16(&mut self, op: Op, operand: u16) {
        self.code.write_op(op);
        self.code.write_short(operand);
    }

    /// Emit a jump with a placeholder displacement; returns the address of
    /// the operand for later patching.
    fn emit_jump(&mut self, op: Op) -> u32 {
        self.code.write_op(op);
        let at = self.code.size();
        self.code.write_short(0);
        at
    }

    /// Patch a jump operand so the instruction lands at the current write
    /// position.
    fn patch_jump(&mut self, operand_addr: u32, loc: &SourceLoc) -> CResult<()> {
        // Target = instr + 3 + offset, and the operand sits at instr + 1.
        let offset = self.code.size() as i64 - operand_addr as i64 - 2;
        if offset > i16::MAX as i64 || offset < i16::MIN as i64 {
            return Err(self.err("jump displacement out of range", loc));
        }
        self.code.patch_short(operand_addr, offset as i16 as u16);
        Ok(())
    }

    fn err(&self, message: impl Into<String>, loc: &SourceLoc) -> EvalError {
        EvalError::compiler(message, loc.clone())
    }

    // ── Local resolution ─────────────────────────────────────────────────────

    /// Find a bound name, walking outward.  Returns the slot and the number
    /// of function boundaries crossed on the way to it.
    fn find_local(&self, sym: SymbolId) -> Option<(u8, u32)> {
        let mut levels = 0u32;
        for scope in self.scopes.iter().rev() {
            if let Some(&slot) = scope.vars.get(&sym) {
                return Some((slot, levels));
            }
            if scope.func.is_some() {
                levels += 1;
            }
        }
        None
    }

    /// Synthesise the upvalue chain for a capture that crosses `levels`
    /// function boundaries, returning the upvalue id on the innermost stub.
    fn add_upvalue(&mut self, levels: u32, pos: u8) -> u8 {
        self.add_upvalue_from(self.scopes.len() - 1, levels, pos)
    }

    fn add_upvalue_from(&mut self, top: usize, levels: u32, pos: u8) -> u8 {
        // The innermost function scope at or below `top`.
        let fi = (0..=top)
            .rev()
            .find(|&i| self.scopes[i].func.is_some())
            .unwrap();
        let stub_id = self.scopes[fi].func.unwrap();
        if levels == 1 {
            // Direct capture of a slot in the frame enclosing this function.
            self.code.function_mut(stub_id).unwrap().get_upvalue(pos, true)
        } else {
            // Route through the next enclosing function's upvalue array.
            let outer = self.add_upvalue_from(fi - 1, levels - 1, pos);
            self.code
                .function_mut(stub_id)
                .unwrap()
                .get_upvalue(outer, false)
        }
    }

    /// Emit a variable reference.
    fn compile_var(&mut self, sym: SymbolId) {
        match self.find_local(sym) {
            Some((slot, 0)) => self.emit_u8(Op::Local, slot),
            Some((slot, levels)) => {
                let id = self.add_upvalue(levels, slot);
                self.emit_u8(Op::Upvalue, id);
            }
            None => {
                let id = self.code.sym_const(sym);
                self.emit_u16(Op::Const, id);
                self.emit(Op::Global);
            }
        }
        self.inc_sp();
    }

    // ── Expression dispatch ──────────────────────────────────────────────────

    fn compile_subexpr(&mut self, node: &AstNode) -> CResult<()> {
        self.code.set_loc(node.loc.clone());
        match &node.kind {
            AstKind::Number(n) => {
                let id = self.code.num_const(*n);
                self.emit_u16(Op::Const, id);
                self.inc_sp();
                Ok(())
            }
            AstKind::Str(s) => {
                let v = self.heap.alloc_string(s.clone(), false);
                let id = self.code.add_constant(v);
                self.emit_u16(Op::Const, id);
                self.inc_sp();
                Ok(())
            }
            AstKind::Symbol(sym) => {
                let singleton = match self.code.symbols.name(*sym) {
                    "null" => Some(Op::Null),
                    "true" => Some(Op::True),
                    "false" => Some(Op::False),
                    _ => None,
                };
                match singleton {
                    Some(op) => {
                        self.emit(op);
                        self.inc_sp();
                    }
                    None => self.compile_var(*sym),
                }
                Ok(())
            }
            AstKind::List(items) => self.compile_list(items, &node.loc),
        }
    }

    fn compile_list(&mut self, items: &[AstNode], loc: &SourceLoc) -> CResult<()> {
        if items.is_empty() {
            return Err(self.err("encountered empty list", loc));
        }
        if let Some(head) = items[0].as_symbol() {
            let name = self.code.symbols.name(head).to_string();
            match name.as_str() {
                "and" => return self.compile_and(items, loc),
                "or" => return self.compile_or(items, loc),
                "def" => return self.compile_def(items, loc),
                "defn" => return self.compile_defn(items, loc),
                "do" => return self.compile_do(items),
                "fn" => return self.compile_fn(items, loc),
                "if" => return self.compile_if(items, loc),
                "let" => return self.compile_let(items, loc),
                "quote" => return self.compile_quote(items, loc),
                "set!" => return self.compile_set(items, loc),
                _ if RESERVED_FORMS.contains(&name.as_str()) => {
                    return Err(self.err(
                        format!("special form `{name}` is not implemented"),
                        &items[0].loc,
                    ));
                }
                _ => {}
            }
        }
        self.compile_call(items, loc)
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    /// Callee, then each argument left-to-right, then `OP_CALL argc`.
    fn compile_call(&mut self, items: &[AstNode], loc: &SourceLoc) -> CResult<()> {
        let base_sp = self.sp();
        for item in items {
            self.compile_subexpr(item)?;
        }
        let argc = items.len() - 1;
        if argc > 255 {
            return Err(self.err("function call with more than 255 arguments", loc));
        }
        self.emit_u8(Op::Call, argc as u8);
        // Arguments and the callee are consumed; one result is pushed.
        self.set_sp(base_sp + 1);
        Ok(())
    }

    // ── Special forms ────────────────────────────────────────────────────────

    /// `(and e1 … en)` — short-circuits on the first falsy operand and
    /// yields the determining operand itself (`true` for the empty form).
    fn compile_and(&mut self, items: &[AstNode], loc: &SourceLoc) -> CResult<()> {
        let args = &items[1..];
        if args.is_empty() {
            self.emit(Op::True);
            self.inc_sp();
            return Ok(());
        }
        let mut patches = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            self.compile_subexpr(arg)?;
            if i < args.len() - 1 {
                // Duplicate for the test; a falsy value short-circuits with
                // the original left on the stack.
                self.emit_u8(Op::Copy, 0);
                self.inc_sp();
                patches.push(self.emit_jump(Op::CJump));
                self.dec_sp(1);
                self.emit(Op::Pop);
                self.dec_sp(1);
            }
        }
        for patch in patches {
            self.patch_jump(patch, loc)?;
        }
        Ok(())
    }

    /// `(or e1 … en)` — short-circuits on the first truthy operand and
    /// yields it (`false` for the empty form).
    fn compile_or(&mut self, items: &[AstNode], loc: &SourceLoc) -> CResult<()> {
        let args = &items[1..];
        if args.is_empty() {
            self.emit(Op::False);
            self.inc_sp();
            return Ok(());
        }
        let mut patches = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            self.compile_subexpr(arg)?;
            if i < args.len() - 1 {
                self.emit_u8(Op::Copy, 0);
                self.inc_sp();
                // Falsy: hop over the exit jump to the pop-and-continue path.
                self.emit(Op::CJump);
                self.code.write_short(3);
                self.dec_sp(1);
                patches.push(self.emit_jump(Op::Jump));
                self.emit(Op::Pop);
                self.dec_sp(1);
            }
        }
        for patch in patches {
            self.patch_jump(patch, loc)?;
        }
        Ok(())
    }

    /// `(def name value)` — binds a global; the form's value is null.
    fn compile_def(&mut self, items: &[AstNode], loc: &SourceLoc) -> CResult<()> {
        if items.len() != 3 {
            return Err(self.err("wrong number of arguments to def", loc));
        }
        let sym = items[1]
            .as_symbol()
            .ok_or_else(|| self.err("first argument to def must be a symbol", &items[1].loc))?;
        let id = self.code.sym_const(sym);
        self.emit_u16(Op::Const, id);
        self.inc_sp();
        self.compile_subexpr(&items[2])?;
        self.emit(Op::SetGlobal);
        self.dec_sp(1);
        // SET_GLOBAL leaves the name; discard it so the form is stack-neutral.
        self.emit(Op::Pop);
        self.dec_sp(1);
        self.emit(Op::Null);
        self.inc_sp();
        Ok(())
    }

    /// `(defn name (params) body…)` — sugar for `(def name (fn …))`.
    fn compile_defn(&mut self, items: &[AstNode], loc: &SourceLoc) -> CResult<()> {
        if items.len() < 3 {
            return Err(self.err("wrong number of arguments to defn", loc));
        }
        let sym = items[1]
            .as_symbol()
            .ok_or_else(|| self.err("first argument to defn must be a symbol", &items[1].loc))?;
        let id = self.code.sym_const(sym);
        self.emit_u16(Op::Const, id);
        self.inc_sp();
        self.compile_fn_body(&items[2], &items[3..], loc)?;
        self.emit(Op::SetGlobal);
        self.dec_sp(1);
        self.emit(Op::Pop);
        self.dec_sp(1);
        self.emit(Op::Null);
        self.inc_sp();
        Ok(())
    }

    /// `(do e1 … en)` — evaluates in order, yields the last value (null when
    /// empty).
    fn compile_do(&mut self, items: &[AstNode]) -> CResult<()> {
        if items.len() == 1 {
            self.emit(Op::Null);
            self.inc_sp();
            return Ok(());
        }
        for item in &items[1..items.len() - 1] {
            self.compile_subexpr(item)?;
            self.emit(Op::Pop);
            self.dec_sp(1);
        }
        self.compile_subexpr(&items[items.len() - 1])
    }

    /// `(if c t e)` — exactly one branch executes.
    fn compile_if(&mut self, items: &[AstNode], loc: &SourceLoc) -> CResult<()> {
        if items.len() != 4 {
            return Err(self.err("wrong number of arguments to if", loc));
        }
        self.compile_subexpr(&items[1])?;
        let else_jump = self.emit_jump(Op::CJump);
        self.dec_sp(1);
        self.compile_subexpr(&items[2])?;
        let end_jump = self.emit_jump(Op::Jump);
        // Only one of the branches runs, so count a single push.
        self.dec_sp(1);
        self.patch_jump(else_jump, loc)?;
        self.compile_subexpr(&items[3])?;
        self.patch_jump(end_jump, loc)?;
        Ok(())
    }

    /// `(let n1 v1 … nk vk body?)` — bindings in pairs, an optional trailing
    /// body expression.
    ///
    /// A hidden result slot is reserved *below* the bindings; every binding
    /// slot is null-initialised before its init expression runs so recursive
    /// references observe null.  After the body, the result is stored down
    /// into the hidden slot and `OP_CLOSE k` drops the bindings, closing any
    /// captured upvalues.  The form is stack-neutral but for its value.
    fn compile_let(&mut self, items: &[AstNode], loc: &SourceLoc) -> CResult<()> {
        let args = &items[1..];
        let has_body = args.len() % 2 == 1;
        let pairs = if has_body {
            &args[..args.len() - 1]
        } else {
            args
        };
        let body = if has_body { args.last() } else { None };
        let bindings = pairs.len() / 2;
        if bindings > 255 {
            return Err(self.err("too many bindings in let", loc));
        }

        let base_sp = self.sp();
        if base_sp > 255 {
            return Err(self.err("too many locals", loc));
        }
        // Hidden result slot.
        let res_slot = base_sp as u8;
        self.emit(Op::Null);
        self.inc_sp();

        let outer_sp = self.sp();
        self.scopes.push(Scope {
            vars: HashMap::new(),
            func: None,
            sp: outer_sp,
        });

        for pair in pairs.chunks(2) {
            let sym = pair[0]
                .as_symbol()
                .ok_or_else(|| self.err("names in let must be symbols", &pair[0].loc))?;
            if self.sp() > 255 {
                return Err(self.err("too many locals", &pair[0].loc));
            }
            let slot = self.sp() as u8;
            // Reserve the slot with null before the init expression runs.
            self.emit(Op::Null);
            self.inc_sp();
            self.scopes.last_mut().unwrap().vars.insert(sym, slot);
            self.compile_subexpr(&pair[1])?;
            self.emit_u8(Op::SetLocal, slot);
            self.dec_sp(1);
        }

        if let Some(body) = body {
            self.compile_subexpr(body)?;
            self.emit_u8(Op::SetLocal, res_slot);
            self.dec_sp(1);
        }

        if bindings > 0 {
            self.emit_u8(Op::Close, bindings as u8);
            self.dec_sp(bindings as u16);
        }

        self.scopes.pop();
        self.set_sp(base_sp + 1);
        Ok(())
    }

    /// `(fn (p1 … pn) body…)` — a closure literal.
    fn compile_fn(&mut self, items: &[AstNode], loc: &SourceLoc) -> CResult<()> {
        if items.len() < 2 {
            return Err(self.err("fn requires a parameter list", loc));
        }
        self.compile_fn_body(&items[1], &items[2..], loc)
    }

    /// Shared emitter for `fn` and `defn`: jump over the body, register the
    /// stub at the body's address, compile the body in a fresh
    /// function-boundary scope, and instantiate the closure.
    fn compile_fn_body(
        &mut self,
        params_node: &AstNode,
        body: &[AstNode],
        loc: &SourceLoc,
    ) -> CResult<()> {
        let param_nodes = params_node
            .as_list()
            .ok_or_else(|| self.err("fn parameters must be a list of symbols", &params_node.loc))?;
        let mut params = Vec::with_capacity(param_nodes.len());
        for p in param_nodes {
            let sym = p
                .as_symbol()
                .ok_or_else(|| self.err("fn parameters must be symbols", &p.loc))?;
            params.push(sym);
        }
        if params.len() > 255 {
            return Err(self.err("function with more than 255 parameters", loc));
        }
        let arity = params.len();

        // The body is compiled inline; control flow hops over it.
        let over = self.emit_jump(Op::Jump);
        let stub_id = self.code.add_function(params.clone(), self.globals);

        let mut vars = HashMap::new();
        for (slot, &sym) in params.iter().enumerate() {
            vars.insert(sym, slot as u8);
        }
        self.scopes.push(Scope {
            vars,
            func: Some(stub_id),
            sp: arity as u16,
        });

        if body.is_empty() {
            self.emit(Op::Null);
            self.inc_sp();
        } else {
            for item in &body[..body.len() - 1] {
                self.compile_subexpr(item)?;
                self.emit(Op::Pop);
                self.dec_sp(1);
            }
            self.compile_subexpr(&body[body.len() - 1])?;
        }
        self.emit(Op::Return);
        self.scopes.pop();

        self.patch_jump(over, loc)?;
        self.emit_u16(Op::Closure, stub_id);
        self.inc_sp();
        Ok(())
    }

    /// `(set! name value)` — assignment through the same resolution path as
    /// a read; the form's value is null.
    fn compile_set(&mut self, items: &[AstNode], loc: &SourceLoc) -> CResult<()> {
        if items.len() != 3 {
            return Err(self.err("wrong number of arguments to set!", loc));
        }
        let sym = items[1]
            .as_symbol()
            .ok_or_else(|| self.err("first argument to set! must be a symbol", &items[1].loc))?;
        match self.find_local(sym) {
            Some((slot, 0)) => {
                self.compile_subexpr(&items[2])?;
                self.emit_u8(Op::SetLocal, slot);
                self.dec_sp(1);
            }
            Some((slot, levels)) => {
                let id = self.add_upvalue(levels, slot);
                self.compile_subexpr(&items[2])?;
                self.emit_u8(Op::SetUpvalue, id);
                self.dec_sp(1);
            }
            None => {
                let id = self.code.sym_const(sym);
                self.emit_u16(Op::Const, id);
                self.inc_sp();
                self.compile_subexpr(&items[2])?;
                self.emit(Op::SetGlobal);
                self.dec_sp(1);
                self.emit(Op::Pop);
                self.dec_sp(1);
            }
        }
        self.emit(Op::Null);
        self.inc_sp();
        Ok(())
    }

    /// `(quote datum)` — the datum becomes a constant built at compile time.
    fn compile_quote(&mut self, items: &[AstNode], loc: &SourceLoc) -> CResult<()> {
        if items.len() != 2 {
            return Err(self.err("wrong number of arguments to quote", loc));
        }
        let v = self.quote_datum(&items[1]);
        let id = self.code.add_constant(v);
        self.emit_u16(Op::Const, id);
        self.inc_sp();
        Ok(())
    }

    /// Convert an AST datum to a value.  Heap parts are allocated with
    /// `gc = false`: they are compile-time literals owned by the heap until
    /// it drops.
    fn quote_datum(&mut self, node: &AstNode) -> Value {
        match &node.kind {
            AstKind::Number(n) => Value::number(*n),
            AstKind::Str(s) => self.heap.alloc_string(s.clone(), false),
            AstKind::Symbol(sym) => Value::symbol(*sym),
            AstKind::List(items) => {
                let mut tail = V_EMPTY;
                for item in items.iter().rev() {
                    let head = self.quote_datum(item);
                    tail = self.heap.alloc_cons(head, tail, false);
                }
                tail
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_source;
    use crate::value::V_NULL;

    /// Compile one source form into a fresh bytecode module.
    fn compile_one(src: &str) -> (Bytecode, Heap) {
        let mut code = Bytecode::new();
        let mut heap = Heap::new();
        let nodes = parse_source(src, "test", &mut code.symbols).expect("parse");
        assert_eq!(nodes.len(), 1);
        let mut c = Compiler::new(&mut code, &mut heap, V_NULL);
        c.compile_expr(&nodes[0]).expect("compile");
        assert_eq!(c.sp(), 0, "top-level form must be stack-neutral");
        (code, heap)
    }

    fn compile_err(src: &str) -> EvalError {
        let mut code = Bytecode::new();
        let mut heap = Heap::new();
        let nodes = parse_source(src, "test", &mut code.symbols).expect("parse");
        let mut c = Compiler::new(&mut code, &mut heap, V_NULL);
        nodes
            .iter()
            .try_for_each(|n| c.compile_expr(n))
            .expect_err("expected a compile error")
    }

    #[test]
    fn test_number_compiles_to_const_pop() {
        let (code, _heap) = compile_one("42");
        assert_eq!(code.read_byte(0), Op::Const as u8);
        assert_eq!(code.read_byte(3), Op::Pop as u8);
        assert_eq!(code.get_constant(0).unwrap().as_num(), 42.0);
    }

    #[test]
    fn test_singleton_symbols_use_dedicated_ops() {
        let (code, _heap) = compile_one("true");
        assert_eq!(code.read_byte(0), Op::True as u8);
        let (code, _heap) = compile_one("null");
        assert_eq!(code.read_byte(0), Op::Null as u8);
    }

    #[test]
    fn test_unbound_symbol_compiles_to_global_load() {
        let (code, _heap) = compile_one("x");
        assert_eq!(code.read_byte(0), Op::Const as u8);
        assert_eq!(code.read_byte(3), Op::Global as u8);
        assert!(code.get_constant(0).unwrap().is_symbol());
    }

    #[test]
    fn test_call_emits_argc() {
        let (code, _heap) = compile_one("(f 1 2 3)");
        // Callee load is Const+Global (4 bytes), then three Consts (9 bytes).
        assert_eq!(code.read_byte(13), Op::Call as u8);
        assert_eq!(code.read_byte(14), 3);
    }

    #[test]
    fn test_empty_list_is_a_compile_error() {
        let err = compile_err("()");
        assert_eq!(err.subsystem, crate::Subsystem::Compiler);
        assert!(err.message.contains("empty list"));
    }

    #[test]
    fn test_def_arity_errors() {
        assert!(compile_err("(def)").message.contains("def"));
        assert!(compile_err("(def x)").message.contains("def"));
        assert!(compile_err("(def x 1 2)").message.contains("def"));
        assert!(compile_err("(def 3 1)").message.contains("symbol"));
    }

    #[test]
    fn test_if_arity_error() {
        assert!(compile_err("(if true 1)").message.contains("if"));
    }

    #[test]
    fn test_let_requires_symbol_names() {
        assert!(compile_err("(let 3 1)").message.contains("symbols"));
    }

    #[test]
    fn test_reserved_forms_refuse_to_compile_as_calls() {
        for form in ["quasiquote", "defmacro", "with", "import", "letfn"] {
            let err = compile_err(&format!("({form} x)"));
            assert!(
                err.message.contains(form),
                "error for {form} should name the form: {}",
                err.message
            );
        }
    }

    #[test]
    fn test_call_with_256_arguments_is_an_error() {
        let args: Vec<String> = (0..256).map(|i| i.to_string()).collect();
        let src = format!("(f {})", args.join(" "));
        let err = compile_err(&src);
        assert!(err.message.contains("255"));
    }

    #[test]
    fn test_fn_registers_stub_with_params() {
        let (code, _heap) = compile_one("(fn (a b) a)");
        assert_eq!(code.num_functions(), 1);
        let stub = code.function(0).unwrap();
        assert_eq!(stub.positional.len(), 2);
        assert_eq!(stub.required(), 2);
        assert_eq!(stub.num_upvals(), 0);
        // The body starts after the initial 3-byte jump.
        assert_eq!(stub.addr, 3);
    }

    #[test]
    fn test_direct_upvalue_capture() {
        let (code, _heap) = compile_one("(fn (x) (fn () x))");
        assert_eq!(code.num_functions(), 2);
        let outer = code.function(0).unwrap();
        let inner = code.function(1).unwrap();
        assert_eq!(outer.num_upvals(), 0);
        assert_eq!(inner.num_upvals(), 1);
        assert_eq!(inner.upvals[0].slot, 0);
        assert!(inner.upvals[0].direct);
    }

    #[test]
    fn test_chained_upvalue_capture() {
        let (code, _heap) = compile_one("(fn (x) (fn () (fn () x)))");
        assert_eq!(code.num_functions(), 3);
        let mid = code.function(1).unwrap();
        let innermost = code.function(2).unwrap();
        // The middle function captures x directly from its parent frame…
        assert_eq!(mid.num_upvals(), 1);
        assert!(mid.upvals[0].direct);
        assert_eq!(mid.upvals[0].slot, 0);
        // …and the innermost routes through the middle one's upvalue 0.
        assert_eq!(innermost.num_upvals(), 1);
        assert!(!innermost.upvals[0].direct);
        assert_eq!(innermost.upvals[0].slot, 0);
    }

    #[test]
    fn test_upvalue_registration_is_shared_for_repeat_references() {
        let (code, _heap) = compile_one("(fn (x) (fn () (and x x)))");
        let inner = code.function(1).unwrap();
        assert_eq!(inner.num_upvals(), 1, "same capture registers once");
    }

    #[test]
    fn test_let_is_stack_neutral_at_compile_time() {
        // Checked by the sp assertion inside compile_one.
        compile_one("(let x 1 y 2 (do x))");
        compile_one("(let x 1)");
        compile_one("(let)");
    }

    #[test]
    fn test_let_emits_close_for_bindings() {
        let (code, _heap) = compile_one("(let x 1 x)");
        let mut found_close = false;
        let mut addr = 0u32;
        while addr < code.size() {
            let (text, w) = code.disassemble_instruction(addr);
            if text.starts_with("Close") {
                found_close = true;
            }
            addr += w;
        }
        assert!(found_close, "let with bindings must emit OP_CLOSE");
    }

    #[test]
    fn test_quote_builds_cons_constant() {
        let (code, _heap) = compile_one("'(1 2)");
        let v = code.get_constant(0).unwrap();
        assert!(v.is_cons());
        // SAFETY: the heap owning the literal is still alive.
        let cell = unsafe { v.as_cons() };
        assert_eq!(cell.head.as_num(), 1.0);
        let next = unsafe { cell.tail.as_cons() };
        assert_eq!(next.head.as_num(), 2.0);
        assert!(next.tail.is_empty());
        // Quoted literals are caller-owned, not GC-managed.
        let header = unsafe { v.obj_header() }.unwrap();
        assert!(!header.gc);
    }

    #[test]
    fn test_quote_symbol() {
        let (code, _heap) = compile_one("'foo");
        let v = code.get_constant(0).unwrap();
        assert!(v.is_symbol());
        assert_eq!(code.symbols.name(v.sym_id()), "foo");
    }

    #[test]
    fn test_source_locations_reach_the_map() {
        let (code, _heap) = compile_one("(def x\n  3)");
        let loc = code.location_of(0).unwrap();
        assert_eq!(loc.line, 1);
    }
}
