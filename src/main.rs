//! The karst command-line driver: run a script file, or start a REPL.

use anyhow::Context;
use karst::value::display_value;
use karst::{eval, Vm};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    match args.next() {
        Some(path) => run_file(&path),
        None => repl(),
    }
}

fn run_file(path: &str) -> anyhow::Result<()> {
    let src = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let mut vm = Vm::new();
    if let Err(e) = eval(&mut vm, &src, path) {
        eprintln!("{e}");
        std::process::exit(1);
    }
    Ok(())
}

fn repl() -> anyhow::Result<()> {
    println!("karst repl — ctrl-d to exit");
    let mut editor = DefaultEditor::new()?;
    let mut vm = Vm::new();
    loop {
        match editor.readline(">> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                editor.add_history_entry(&line)?;
                // Each line compiles onto the same module and runs in the
                // same VM, so definitions accumulate across inputs.
                match eval(&mut vm, &line, "repl") {
                    Ok(v) => println!("{}", display_value(v, vm.symbols())),
                    Err(e) => eprintln!("{e}"),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
