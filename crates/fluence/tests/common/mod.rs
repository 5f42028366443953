//! Shared helpers for the integration suite.
#![allow(dead_code)] // each test binary uses a subset of these helpers

use fluence::{CollectStringPrint, Config, Interpreter, Object, ScriptedLines, VmStatus};

/// Compiles and runs a program, panicking on any failure.
pub fn run(source: &str) -> Interpreter {
    let mut interp = Interpreter::new();
    interp.compile(source, "test.fl").unwrap_or_else(|diag| panic!("compile failed:\n{diag}"));
    let status = interp
        .run_until_done()
        .unwrap_or_else(|diag| panic!("run failed:\n{diag}"));
    assert_eq!(status, VmStatus::Completed);
    interp
}

/// Compiles and runs with a custom configuration and scripted input,
/// returning the interpreter and everything it printed.
pub fn run_with(source: &str, config: Config, input: &str) -> (Interpreter, String) {
    let mut interp = Interpreter::with_config(config);
    interp.compile(source, "test.fl").unwrap_or_else(|diag| panic!("compile failed:\n{diag}"));
    let mut out = CollectStringPrint::new();
    let mut lines = ScriptedLines::new(input);
    let status = interp
        .run_with_io(&mut out, &mut lines)
        .unwrap_or_else(|diag| panic!("run failed:\n{diag}"));
    assert_eq!(status, VmStatus::Completed);
    let output = out.take();
    (interp, output)
}

/// Runs a program and returns the `result` global.
pub fn result_of(source: &str) -> Object {
    let interp = run(source);
    interp
        .get_global("result")
        .expect("program must define a `result` global")
}
