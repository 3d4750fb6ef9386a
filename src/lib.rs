//! The karst language runtime library.
//!
//! karst is a small dynamically typed Lisp: source text is read into
//! s-expressions, compiled in a single pass to linear bytecode, and executed
//! on a stack-based virtual machine with upvalue-captured closures.
//!
//! The pipeline:
//!
//! 1. **Lexer** (`lexer`) — tokenises source text into a flat `Vec<Token>`.
//! 2. **Parser** (`parser`) — reads tokens into [`ast::AstNode`]s, interning
//!    symbols as it goes.
//! 3. **Values** (`value`) — the tagged 64-bit [`Value`] and heap object
//!    shapes.
//! 4. **GC** (`gc`) — mark-and-sweep [`gc::Heap`] owning every allocation.
//! 5. **Bytecode** (`bytecode`) — opcodes, the byte array, constant pool,
//!    function stubs, and the source map.
//! 6. **Compiler** (`compiler`) — lowers s-expressions into bytecode.
//! 7. **Builtins** (`builtins`) — foreign (Rust) functions exposed as
//!    globals.
//! 8. **VM** (`vm`) — the stack machine that executes the bytecode.
//!
//! # Entry point
//!
//! ```rust,ignore
//! use karst::run_source;
//! let rendered = run_source("(def x 3) (+ x 4)", "demo.k")?;
//! assert_eq!(rendered, "7");
//! ```

// ─────────────────────────────────────────────────────────────────────────────
// Modules
// ─────────────────────────────────────────────────────────────────────────────

pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod gc;
pub mod lexer;
pub mod parser;
pub mod token;
pub mod value;
pub mod vm;

use crate::lexer::LexError;
use crate::parser::ParseError;
use crate::token::SourceLoc;
use crate::value::SymbolTable;

pub use crate::value::Value;
pub use crate::vm::Vm;

// ─────────────────────────────────────────────────────────────────────────────
// Diagnostics
// ─────────────────────────────────────────────────────────────────────────────

/// Which part of the runtime raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    /// Malformed source reaching the compiler (arity of special forms, empty
    /// lists, non-symbol binding names, …).
    Compiler,
    /// Semantic errors during execution (calling a non-function, bad arity,
    /// unknown globals or upvalues).
    Interpreter,
    /// Mechanical limits of the machine (stack exhaustion, frame underflow,
    /// unknown constants).
    Runtime,
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subsystem::Compiler => write!(f, "compiler"),
            Subsystem::Interpreter => write!(f, "interpreter"),
            Subsystem::Runtime => write!(f, "runtime"),
        }
    }
}

/// A compile- or run-time error: subsystem tag, message, and the source
/// location it originated at (from the AST node at compile time, from the
/// bytecode source map at run time).
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{subsystem}] error at {loc}: {message}")]
pub struct EvalError {
    pub subsystem: Subsystem,
    pub message: String,
    pub loc: SourceLoc,
}

impl EvalError {
    pub fn compiler(message: impl Into<String>, loc: SourceLoc) -> Self {
        Self {
            subsystem: Subsystem::Compiler,
            message: message.into(),
            loc,
        }
    }

    pub fn interpreter(message: impl Into<String>, loc: SourceLoc) -> Self {
        Self {
            subsystem: Subsystem::Interpreter,
            message: message.into(),
            loc,
        }
    }

    pub fn runtime(message: impl Into<String>, loc: SourceLoc) -> Self {
        Self {
            subsystem: Subsystem::Runtime,
            message: message.into(),
            loc,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Unified error type
// ─────────────────────────────────────────────────────────────────────────────

/// The unified error type for the whole pipeline.  Each variant wraps the
/// errors of one stage so callers can handle them uniformly or match on the
/// stage.
#[derive(Debug, thiserror::Error)]
pub enum KarstError {
    /// One or more lexical errors.
    #[error("Lex error at {}: {}", .0.first().map(|e| e.loc.to_string()).unwrap_or_default(), .0.iter().map(|e| e.message.clone()).collect::<Vec<_>>().join("; "))]
    Lex(Vec<LexError>),

    /// One or more parse errors.
    #[error("Parse error at {}: {}", .0.first().map(|e| e.loc.to_string()).unwrap_or_default(), .0.iter().map(|e| e.message.clone()).collect::<Vec<_>>().join("; "))]
    Parse(Vec<ParseError>),

    /// A compile- or run-time error.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// An I/O error (reading a script file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shorthand result type for all karst operations.
pub type KarstResult<T> = Result<T, KarstError>;

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Lex and parse a source string, interning symbols into `symbols`.
///
/// Lex errors take precedence over parse errors when both occur.
pub fn parse_source(
    src: &str,
    file: &str,
    symbols: &mut SymbolTable,
) -> KarstResult<Vec<ast::AstNode>> {
    let (tokens, lex_errors) = lexer::lex(src, file);
    if !lex_errors.is_empty() {
        return Err(KarstError::Lex(lex_errors));
    }
    let (nodes, parse_errors) = parser::parse_tokens(tokens, symbols);
    if !parse_errors.is_empty() {
        return Err(KarstError::Parse(parse_errors));
    }
    Ok(nodes)
}

/// Compile and execute `src` on an existing VM, one top-level form at a time
/// (the compiler finishes each form before the VM runs it).
///
/// Returns the value of the last form, read from the VM's last-pop register.
pub fn eval(vm: &mut Vm, src: &str, file: &str) -> KarstResult<Value> {
    let nodes = {
        let symbols = vm.symbols_mut();
        parse_source(src, file, symbols)?
    };
    for node in &nodes {
        vm.compile_node(node)?;
        vm.execute()?;
    }
    Ok(vm.last_pop())
}

/// Full pipeline on a fresh VM: lex → parse → compile → run.
///
/// `file` is used only for error messages.  Returns the rendered value of
/// the last top-level form.
pub fn run_source(src: &str, file: &str) -> KarstResult<String> {
    let mut vm = Vm::new();
    let result = eval(&mut vm, src, file)?;
    Ok(value::display_value(result, vm.symbols()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_source_smoke() {
        assert_eq!(run_source("(def x 3) x", "t").unwrap(), "3");
    }

    #[test]
    fn test_lex_errors_surface_first() {
        let err = run_source("\"oops", "t").unwrap_err();
        assert!(matches!(err, KarstError::Lex(_)));
    }

    #[test]
    fn test_parse_errors_surface() {
        let err = run_source("(def x", "t").unwrap_err();
        assert!(matches!(err, KarstError::Parse(_)));
    }

    #[test]
    fn test_eval_error_formatting() {
        let err = EvalError::interpreter("boom", SourceLoc::unknown());
        assert_eq!(
            err.to_string(),
            "[interpreter] error at <unknown>:0:0: boom"
        );
    }
}
