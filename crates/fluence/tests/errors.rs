//! Failure taxonomy: lex, parse, and runtime diagnostics, plus throw/catch
//! recovery and the cooperative stop/timeout machinery.

mod common;

use std::time::Duration;

use common::result_of;
use fluence::{Config, ErrorKind, Interpreter, Object, Phase, VmStatus};
use pretty_assertions::assert_eq;

fn compile_err(source: &str) -> fluence::Diagnostic {
    let mut interp = Interpreter::new();
    *interp.compile(source, "test.fl").expect_err("compilation must fail")
}

fn run_err(source: &str) -> fluence::Diagnostic {
    let mut interp = Interpreter::new();
    interp.compile(source, "test.fl").unwrap_or_else(|diag| panic!("compile failed:\n{diag}"));
    *interp.run_until_done().expect_err("run must fail")
}

#[test]
fn unterminated_string_is_a_lex_error() {
    let diag = compile_err("x = \"abc");
    assert_eq!(diag.phase, Phase::Lex);
    assert!(diag.message.contains("unterminated"));
    let loc = diag.loc.expect("lex errors carry a location");
    assert_eq!(loc.line, 1);
    assert!(diag.source_line.is_some());
}

#[test]
fn invalid_escape_is_a_lex_error() {
    let diag = compile_err(r#"x = "\q";"#);
    assert_eq!(diag.phase, Phase::Lex);
    assert!(diag.message.contains("escape"));
}

#[test]
fn unexpected_token_is_a_parse_error() {
    let diag = compile_err("x = ;");
    assert_eq!(diag.phase, Phase::Parse);
    assert!(diag.loc.is_some());
    assert!(diag.source_line.is_some());
}

#[test]
fn redefinition_is_reported_from_the_pre_scan() {
    let diag = compile_err("func f(a) => a;\nfunc f(b) => b;");
    assert_eq!(diag.phase, Phase::Parse);
    assert!(diag.message.contains("redefinition"));
}

#[test]
fn solid_bindings_reject_assignment() {
    let diag = compile_err("solid LIMIT = 10;\nLIMIT = 11;");
    assert_eq!(diag.phase, Phase::Parse);
    assert!(diag.message.contains("solid"));
}

#[test]
fn unknown_variable_at_runtime() {
    let diag = run_err("result = missing;");
    assert_eq!(diag.phase, Phase::Runtime);
    assert_eq!(diag.kind, Some(ErrorKind::UnknownVariable));
    assert!(diag.last_instruction.is_some());
    assert!(!diag.trace.is_empty());
}

#[test]
fn wrong_arity_elaborates_near_misses() {
    let source = r"
        func greet(name) => name;
        greet(1, 2);
    ";
    let diag = run_err(source);
    assert_eq!(diag.kind, Some(ErrorKind::ArityMismatch));
    assert!(diag.hints.iter().any(|h| h.contains("greet")), "hints: {:?}", diag.hints);
}

#[test]
fn division_by_zero() {
    let diag = run_err("result = 1 / (1 - 1);");
    assert_eq!(diag.kind, Some(ErrorKind::DivisionByZero));
}

#[test]
fn out_of_range_index_faults_while_element_at_yields_nil() {
    let diag = run_err("list = [1]; x = list[5];");
    assert_eq!(diag.kind, Some(ErrorKind::IndexOutOfRange));

    assert_eq!(result_of("list = [1]; result = list.element_at(5);"), Object::Nil);
}

#[test]
fn negative_index_faults() {
    let diag = run_err("list = [1]; x = list[0 - 1];");
    assert_eq!(diag.kind, Some(ErrorKind::IndexOutOfRange));
}

#[test]
fn descending_range_iteration_faults() {
    let diag = run_err("for i in 5..1 { x = i; }");
    assert_eq!(diag.kind, Some(ErrorKind::TypeMismatch));
}

#[test]
fn throw_without_handler_faults_with_script_exception() {
    let diag = run_err(r#"throw "boom";"#);
    assert_eq!(diag.kind, Some(ErrorKind::ScriptException));
    assert!(diag.message.contains("boom"));
}

#[test]
fn try_catch_recovers_thrown_values() {
    let source = r#"
        r = nil;
        try {
            throw "boom";
            r = "unreachable";
        } catch err {
            r = err;
        }
        result = r;
    "#;
    assert_eq!(result_of(source), Object::Str("boom".to_owned()));
}

#[test]
fn try_catch_recovers_runtime_errors() {
    let source = r"
        r = nil;
        try {
            r = 1 / (2 - 2);
        } catch err {
            r = err.message;
        }
        result = r;
    ";
    assert_eq!(result_of(source), Object::Str("division by zero".to_owned()));
}

#[test]
fn unwinding_crosses_frames() {
    let source = r#"
        func explode() => { throw "deep"; }
        func middle() => { explode(); return nil; }
        r = nil;
        try { middle(); } catch err { r = err; }
        result = r;
    "#;
    assert_eq!(result_of(source), Object::Str("deep".to_owned()));
}

#[test]
fn recursion_limit_is_enforced() {
    let source = r"
        func f(n) => f(n + 1) + 1;
        f(0);
    ";
    let diag = run_err(source);
    assert_eq!(diag.kind, Some(ErrorKind::RecursionLimit));
}

#[test]
fn request_stop_halts_at_the_next_check() {
    let mut interp = Interpreter::new();
    interp.compile("loop { }", "test.fl").expect("compiles");
    interp.request_stop();
    let diag = interp.run_until_done().expect_err("stop surfaces as an error");
    assert_eq!(diag.kind, Some(ErrorKind::Stopped));
    assert_eq!(interp.status(), VmStatus::Stopped);
}

#[test]
fn timeout_stops_execution() {
    let config = Config::default().default_timeout(Duration::from_millis(30));
    let mut interp = Interpreter::with_config(config);
    interp.compile("loop { x = 1; }", "test.fl").expect("compiles");
    let diag = interp.run_until_done().expect_err("deadline expires");
    assert_eq!(diag.kind, Some(ErrorKind::Timeout));
    assert_eq!(interp.status(), VmStatus::Stopped);
}

#[test]
fn faulted_diagnostics_snapshot_the_frame() {
    let source = r"
        func crash(a, b) => {
            local = a + b;
            return local / (b - b);
        }
        crash(4, 2);
    ";
    let diag = run_err(source);
    assert_eq!(diag.kind, Some(ErrorKind::DivisionByZero));
    // Trace runs from the top level into `crash`.
    assert!(diag.trace.len() >= 2, "trace: {:?}", diag.trace);
    assert_eq!(diag.trace.last().expect("innermost frame").function, "crash");
    // Parameters appear by name in the locals snapshot.
    assert!(diag.locals.iter().any(|(name, value)| name == "a" && value == "4"));
    assert!(diag.locals.iter().any(|(name, value)| name == "b" && value == "2"));
}
