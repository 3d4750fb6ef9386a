//! Foreign (Rust) built-in functions for the karst VM.
//!
//! [`register_all`] installs the standard set into a [`Vm`].  Each builtin is
//! a plain Rust function with the signature
//! `fn(&mut Vm, &[Value]) -> Result<Value, EvalError>`; the VM checks the
//! registered arity before invoking it.  Arithmetic and comparison live here
//! rather than in the opcode set — the machine only knows about data
//! movement, control flow and calls.
//!
//! | Group | Functions |
//! |-------|-----------|
//! | Arithmetic | `+`, `-`, `*`, `/`, `mod`, `pow`, `abs`, `floor`, `ceil`, `log` |
//! | Comparison | `=`, `<`, `<=`, `>`, `>=`, `not` |
//! | Lists | `list`, `cons`, `head`, `tail`, `empty?`, `list?` |
//! | Tables | `table`, `get`, `put!`, `has?`, `keys` |
//! | Strings | `str`, `str-len` |
//! | Symbols | `gensym`, `intern` |
//! | Predicates | `number?`, `string?`, `symbol?`, `fn?`, `table?`, `null?`, `bool?` |
//! | I/O | `print`, `println` |

use crate::value::{display_value, Value, V_EMPTY, V_FALSE, V_NULL, V_TRUE};
use crate::vm::Vm;
use crate::EvalError;

type BResult = Result<Value, EvalError>;

// ─────────────────────────────────────────────────────────────────────────────
// Registration entry point
// ─────────────────────────────────────────────────────────────────────────────

/// Register every built-in foreign function into `vm` as a global.
pub fn register_all(vm: &mut Vm) {
    // ── Arithmetic ───────────────────────────────────────────────────────────
    vm.add_foreign("+", 0, true, num_add);
    vm.add_foreign("-", 1, true, num_sub);
    vm.add_foreign("*", 0, true, num_mul);
    vm.add_foreign("/", 1, true, num_div);
    vm.add_foreign("mod", 2, false, num_mod);
    vm.add_foreign("pow", 2, false, num_pow);
    vm.add_foreign("abs", 1, false, num_abs);
    vm.add_foreign("floor", 1, false, num_floor);
    vm.add_foreign("ceil", 1, false, num_ceil);
    vm.add_foreign("log", 1, false, num_log);

    // ── Comparison / logic ───────────────────────────────────────────────────
    vm.add_foreign("=", 2, true, cmp_eq);
    vm.add_foreign("<", 2, true, cmp_lt);
    vm.add_foreign("<=", 2, true, cmp_le);
    vm.add_foreign(">", 2, true, cmp_gt);
    vm.add_foreign(">=", 2, true, cmp_ge);
    vm.add_foreign("not", 1, false, logic_not);

    // ── Lists ────────────────────────────────────────────────────────────────
    vm.add_foreign("list", 0, true, list_new);
    vm.add_foreign("cons", 2, false, list_cons);
    vm.add_foreign("head", 1, false, list_head);
    vm.add_foreign("tail", 1, false, list_tail);
    vm.add_foreign("empty?", 1, false, list_is_empty);
    vm.add_foreign("list?", 1, false, list_is_list);

    // ── Tables ───────────────────────────────────────────────────────────────
    vm.add_foreign("table", 0, false, table_new);
    vm.add_foreign("get", 2, false, table_get);
    vm.add_foreign("put!", 3, false, table_put);
    vm.add_foreign("has?", 2, false, table_has);
    vm.add_foreign("keys", 1, false, table_keys);

    // ── Strings ──────────────────────────────────────────────────────────────
    vm.add_foreign("str", 0, true, str_concat);
    vm.add_foreign("str-len", 1, false, str_len);

    // ── Symbols ──────────────────────────────────────────────────────────────
    vm.add_foreign("gensym", 0, false, sym_gensym);
    vm.add_foreign("intern", 1, false, sym_intern);

    // ── Predicates ───────────────────────────────────────────────────────────
    vm.add_foreign("number?", 1, false, is_number);
    vm.add_foreign("string?", 1, false, is_string);
    vm.add_foreign("symbol?", 1, false, is_symbol);
    vm.add_foreign("fn?", 1, false, is_fn);
    vm.add_foreign("table?", 1, false, is_table);
    vm.add_foreign("null?", 1, false, is_null);
    vm.add_foreign("bool?", 1, false, is_bool);

    // ── I/O ──────────────────────────────────────────────────────────────────
    vm.add_foreign("print", 0, true, io_print);
    vm.add_foreign("println", 0, true, io_println);
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn want_num(vm: &Vm, v: Value, who: &str) -> Result<f64, EvalError> {
    if v.is_num() {
        Ok(v.as_num())
    } else {
        Err(vm.error(format!("`{who}` expects numbers, got {}", v.type_name())))
    }
}

/// Render a value the way `print` does: strings without quotes, everything
/// else as the REPL shows it.
fn print_form(vm: &Vm, v: Value) -> String {
    if v.is_string() {
        // SAFETY: the argument is on the stack, hence alive.
        unsafe { v.as_string() }.text.clone()
    } else {
        display_value(v, vm.symbols())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Arithmetic
// ─────────────────────────────────────────────────────────────────────────────

fn num_add(vm: &mut Vm, args: &[Value]) -> BResult {
    let mut acc = 0.0;
    for &v in args {
        acc += want_num(vm, v, "+")?;
    }
    Ok(Value::number(acc))
}

fn num_sub(vm: &mut Vm, args: &[Value]) -> BResult {
    let first = want_num(vm, args[0], "-")?;
    if args.len() == 1 {
        return Ok(Value::number(-first));
    }
    let mut acc = first;
    for &v in &args[1..] {
        acc -= want_num(vm, v, "-")?;
    }
    Ok(Value::number(acc))
}

fn num_mul(vm: &mut Vm, args: &[Value]) -> BResult {
    let mut acc = 1.0;
    for &v in args {
        acc *= want_num(vm, v, "*")?;
    }
    Ok(Value::number(acc))
}

fn num_div(vm: &mut Vm, args: &[Value]) -> BResult {
    let first = want_num(vm, args[0], "/")?;
    if args.len() == 1 {
        return Ok(Value::number(1.0 / first));
    }
    let mut acc = first;
    for &v in &args[1..] {
        acc /= want_num(vm, v, "/")?;
    }
    Ok(Value::number(acc))
}

fn num_mod(vm: &mut Vm, args: &[Value]) -> BResult {
    let a = want_num(vm, args[0], "mod")?;
    let b = want_num(vm, args[1], "mod")?;
    if b == 0.0 {
        return Err(vm.error("modulus by zero"));
    }
    Ok(Value::number(a.rem_euclid(b)))
}

fn num_pow(vm: &mut Vm, args: &[Value]) -> BResult {
    let a = want_num(vm, args[0], "pow")?;
    let b = want_num(vm, args[1], "pow")?;
    Ok(Value::number(a.powf(b)))
}

fn num_abs(vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(Value::number(want_num(vm, args[0], "abs")?.abs()))
}

fn num_floor(vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(Value::number(want_num(vm, args[0], "floor")?.floor()))
}

fn num_ceil(vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(Value::number(want_num(vm, args[0], "ceil")?.ceil()))
}

fn num_log(vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(Value::number(want_num(vm, args[0], "log")?.ln()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Comparison / logic
// ─────────────────────────────────────────────────────────────────────────────

fn cmp_eq(_vm: &mut Vm, args: &[Value]) -> BResult {
    let all_equal = args.windows(2).all(|w| w[0] == w[1]);
    Ok(Value::boolean(all_equal))
}

fn cmp_chain(
    vm: &mut Vm,
    args: &[Value],
    who: &str,
    ok: impl Fn(f64, f64) -> bool,
) -> BResult {
    for w in args.windows(2) {
        let a = want_num(vm, w[0], who)?;
        let b = want_num(vm, w[1], who)?;
        if !ok(a, b) {
            return Ok(V_FALSE);
        }
    }
    Ok(V_TRUE)
}

fn cmp_lt(vm: &mut Vm, args: &[Value]) -> BResult {
    cmp_chain(vm, args, "<", |a, b| a < b)
}

fn cmp_le(vm: &mut Vm, args: &[Value]) -> BResult {
    cmp_chain(vm, args, "<=", |a, b| a <= b)
}

fn cmp_gt(vm: &mut Vm, args: &[Value]) -> BResult {
    cmp_chain(vm, args, ">", |a, b| a > b)
}

fn cmp_ge(vm: &mut Vm, args: &[Value]) -> BResult {
    cmp_chain(vm, args, ">=", |a, b| a >= b)
}

fn logic_not(_vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(Value::boolean(!args[0].is_truthy()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Lists
// ─────────────────────────────────────────────────────────────────────────────

fn list_new(vm: &mut Vm, args: &[Value]) -> BResult {
    let mut acc = V_EMPTY;
    for &v in args.iter().rev() {
        acc = vm.heap_mut().alloc_cons(v, acc, true);
    }
    Ok(acc)
}

fn list_cons(vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(vm.heap_mut().alloc_cons(args[0], args[1], true))
}

fn list_head(vm: &mut Vm, args: &[Value]) -> BResult {
    if args[0].is_cons() {
        // SAFETY: the argument is on the stack, hence alive.
        Ok(unsafe { args[0].as_cons() }.head)
    } else {
        Err(vm.error(format!("`head` expects a cons, got {}", args[0].type_name())))
    }
}

fn list_tail(vm: &mut Vm, args: &[Value]) -> BResult {
    if args[0].is_cons() {
        // SAFETY: as above.
        Ok(unsafe { args[0].as_cons() }.tail)
    } else if args[0].is_empty() {
        Ok(V_EMPTY)
    } else {
        Err(vm.error(format!("`tail` expects a list, got {}", args[0].type_name())))
    }
}

fn list_is_empty(_vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(Value::boolean(args[0].is_empty()))
}

fn list_is_list(_vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(Value::boolean(args[0].is_cons() || args[0].is_empty()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tables
// ─────────────────────────────────────────────────────────────────────────────

fn table_new(vm: &mut Vm, _args: &[Value]) -> BResult {
    Ok(vm.heap_mut().alloc_table(true))
}

fn table_get(vm: &mut Vm, args: &[Value]) -> BResult {
    vm.obj_get(args[0], args[1])
}

fn table_put(vm: &mut Vm, args: &[Value]) -> BResult {
    vm.obj_set(args[0], args[1], args[2])?;
    Ok(args[2])
}

fn table_has(vm: &mut Vm, args: &[Value]) -> BResult {
    if args[0].is_table() {
        // SAFETY: on the stack, hence alive.
        let t = unsafe { args[0].as_table() };
        Ok(Value::boolean(t.contents.borrow().contains_key(&args[1])))
    } else {
        Err(vm.error(format!("`has?` expects a table, got {}", args[0].type_name())))
    }
}

fn table_keys(vm: &mut Vm, args: &[Value]) -> BResult {
    if !args[0].is_table() {
        return Err(vm.error(format!("`keys` expects a table, got {}", args[0].type_name())));
    }
    // SAFETY: on the stack, hence alive.
    let keys: Vec<Value> = unsafe { args[0].as_table() }
        .contents
        .borrow()
        .keys()
        .copied()
        .collect();
    let mut acc = V_EMPTY;
    for k in keys.into_iter().rev() {
        acc = vm.heap_mut().alloc_cons(k, acc, true);
    }
    Ok(acc)
}

// ─────────────────────────────────────────────────────────────────────────────
// Strings
// ─────────────────────────────────────────────────────────────────────────────

fn str_concat(vm: &mut Vm, args: &[Value]) -> BResult {
    let mut buf = String::new();
    for &v in args {
        buf.push_str(&print_form(vm, v));
    }
    Ok(vm.heap_mut().alloc_string(buf, true))
}

fn str_len(vm: &mut Vm, args: &[Value]) -> BResult {
    if args[0].is_string() {
        // SAFETY: on the stack, hence alive.
        Ok(Value::number(unsafe { args[0].as_string() }.len as f64))
    } else {
        Err(vm.error(format!(
            "`str-len` expects a string, got {}",
            args[0].type_name()
        )))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Symbols
// ─────────────────────────────────────────────────────────────────────────────

fn sym_gensym(vm: &mut Vm, _args: &[Value]) -> BResult {
    let id = vm.symbols_mut().gensym();
    Ok(Value::symbol(id))
}

fn sym_intern(vm: &mut Vm, args: &[Value]) -> BResult {
    if args[0].is_string() {
        // SAFETY: on the stack, hence alive.
        let name = unsafe { args[0].as_string() }.text.clone();
        let id = vm.symbols_mut().intern(&name);
        Ok(Value::symbol(id))
    } else {
        Err(vm.error(format!(
            "`intern` expects a string, got {}",
            args[0].type_name()
        )))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Predicates
// ─────────────────────────────────────────────────────────────────────────────

fn is_number(_vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(Value::boolean(args[0].is_num()))
}

fn is_string(_vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(Value::boolean(args[0].is_string()))
}

fn is_symbol(_vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(Value::boolean(args[0].is_symbol()))
}

fn is_fn(_vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(Value::boolean(args[0].is_function() || args[0].is_foreign()))
}

fn is_table(_vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(Value::boolean(args[0].is_table()))
}

fn is_null(_vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(Value::boolean(args[0].is_null()))
}

fn is_bool(_vm: &mut Vm, args: &[Value]) -> BResult {
    Ok(Value::boolean(args[0].is_bool()))
}

// ─────────────────────────────────────────────────────────────────────────────
// I/O
// ─────────────────────────────────────────────────────────────────────────────

fn io_print(vm: &mut Vm, args: &[Value]) -> BResult {
    let parts: Vec<String> = args.iter().map(|&v| print_form(vm, v)).collect();
    print!("{}", parts.join(" "));
    Ok(V_NULL)
}

fn io_println(vm: &mut Vm, args: &[Value]) -> BResult {
    let parts: Vec<String> = args.iter().map(|&v| print_form(vm, v)).collect();
    println!("{}", parts.join(" "));
    Ok(V_NULL)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::value::display_value;
    use crate::{eval, KarstError, Subsystem, Vm};

    fn run(src: &str) -> String {
        let mut vm = Vm::new();
        let v = eval(&mut vm, src, "test").expect("eval failed");
        display_value(v, vm.symbols())
    }

    fn run_err(src: &str) -> crate::EvalError {
        let mut vm = Vm::new();
        match eval(&mut vm, src, "test") {
            Err(KarstError::Eval(e)) => e,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run("(+ 1 2 3)"), "6");
        assert_eq!(run("(+)"), "0");
        assert_eq!(run("(- 10 3 2)"), "5");
        assert_eq!(run("(- 4)"), "-4");
        assert_eq!(run("(* 2 3 4)"), "24");
        assert_eq!(run("(*)"), "1");
        assert_eq!(run("(/ 10 4)"), "2.5");
        assert_eq!(run("(mod 7 3)"), "1");
        assert_eq!(run("(mod -1 3)"), "2");
        assert_eq!(run("(pow 2 10)"), "1024");
        assert_eq!(run("(abs -3)"), "3");
        assert_eq!(run("(floor 2.7)"), "2");
        assert_eq!(run("(ceil 2.1)"), "3");
    }

    #[test]
    fn test_arithmetic_type_errors() {
        let err = run_err("(+ 1 \"two\")");
        assert_eq!(err.subsystem, Subsystem::Interpreter);
        assert!(err.message.contains("expects numbers"));
    }

    #[test]
    fn test_modulus_by_zero_errors() {
        assert!(run_err("(mod 1 0)").message.contains("modulus by zero"));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(run("(= 1 1 1)"), "true");
        assert_eq!(run("(= 1 2)"), "false");
        assert_eq!(run("(= \"a\" \"a\")"), "true");
        assert_eq!(run("(< 1 2 3)"), "true");
        assert_eq!(run("(< 1 3 2)"), "false");
        assert_eq!(run("(<= 1 1)"), "true");
        assert_eq!(run("(> 3 2 1)"), "true");
        assert_eq!(run("(>= 2 3)"), "false");
        assert_eq!(run("(not false)"), "true");
        assert_eq!(run("(not 0)"), "false");
    }

    #[test]
    fn test_structural_equality_on_lists() {
        assert_eq!(run("(= (list 1 2) (list 1 2))"), "true");
        assert_eq!(run("(= (list 1 2) (list 1 3))"), "false");
        assert_eq!(run("(= '(1 2) (list 1 2))"), "true");
    }

    #[test]
    fn test_list_primitives() {
        assert_eq!(run("(list 1 2 3)"), "(1 2 3)");
        assert_eq!(run("(list)"), "()");
        assert_eq!(run("(cons 1 '())"), "(1)");
        assert_eq!(run("(cons 1 2)"), "(1 . 2)");
        assert_eq!(run("(head (list 1 2))"), "1");
        assert_eq!(run("(tail (list 1 2))"), "(2)");
        assert_eq!(run("(tail '())"), "()");
        assert_eq!(run("(empty? '())"), "true");
        assert_eq!(run("(empty? (list 1))"), "false");
        assert_eq!(run("(list? (list 1))"), "true");
        assert_eq!(run("(list? 3)"), "false");
    }

    #[test]
    fn test_head_of_empty_errors() {
        assert!(run_err("(head '())").message.contains("head"));
    }

    #[test]
    fn test_tables() {
        let src = "(def t (table))
                   (put! t 'k 5)
                   (get t 'k)";
        assert_eq!(run(src), "5");
        assert_eq!(run("(def t (table)) (get t 'missing)"), "null");
        assert_eq!(run("(def t (table)) (put! t 1 2) (has? t 1)"), "true");
        assert_eq!(run("(def t (table)) (has? t 1)"), "false");
        assert_eq!(run("(def t (table)) (put! t \"a\" 1) (keys t)"), "(\"a\")");
    }

    #[test]
    fn test_table_keys_use_value_equality() {
        // Two structurally equal strings hit the same table entry.
        let src = "(def t (table))
                   (put! t (str \"a\" \"b\") 1)
                   (get t \"ab\")";
        assert_eq!(run(src), "1");
    }

    #[test]
    fn test_strings() {
        assert_eq!(run("(str \"a\" 1 \"b\")"), "\"a1b\"");
        assert_eq!(run("(str-len \"abc\")"), "3");
    }

    #[test]
    fn test_symbols() {
        assert_eq!(run("(= (gensym) (gensym))"), "false");
        assert_eq!(run("(= (intern \"x\") 'x)"), "true");
    }

    #[test]
    fn test_predicates() {
        assert_eq!(run("(number? 1)"), "true");
        assert_eq!(run("(number? \"1\")"), "false");
        assert_eq!(run("(string? \"s\")"), "true");
        assert_eq!(run("(symbol? 'a)"), "true");
        assert_eq!(run("(fn? (fn () 1))"), "true");
        assert_eq!(run("(fn? head)"), "true");
        assert_eq!(run("(table? (table))"), "true");
        assert_eq!(run("(null? null)"), "true");
        assert_eq!(run("(bool? false)"), "true");
        assert_eq!(run("(bool? null)"), "false");
    }

    #[test]
    fn test_builtins_compose_with_user_functions() {
        let src = "(defn map-list (f xs)
                     (if (empty? xs)
                         '()
                         (cons (f (head xs)) (map-list f (tail xs)))))
                   (map-list (fn (x) (* x x)) (list 1 2 3 4))";
        assert_eq!(run(src), "(1 4 9 16)");
    }
}
