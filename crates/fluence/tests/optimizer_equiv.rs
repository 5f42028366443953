//! Parse-then-optimize preserves behavior: programs produce identical
//! output and globals with the optimizer on and off.

mod common;

use common::run_with;
use fluence::{Config, Object};
use pretty_assertions::assert_eq;

fn both_ways(source: &str, input: &str) -> ((Option<Object>, String), (Option<Object>, String)) {
    let (on, on_out) = run_with(source, Config::default().optimize_bytecode(true), input);
    let (off, off_out) = run_with(source, Config::default().optimize_bytecode(false), input);
    ((on.get_global("result"), on_out), (off.get_global("result"), off_out))
}

fn assert_equivalent(source: &str) {
    let (on, off) = both_ways(source, "");
    assert_eq!(on, off, "optimizer changed behavior for:\n{source}");
}

#[test]
fn arithmetic_and_strength_reduction() {
    assert_equivalent(
        r"
        x = 13;
        a = x * 8;
        b = x / 4;
        c = x % 8;
        d = x ** 2;
        e = 10 % 2;
        result = [a, b, c, d, e];
        ",
    );
}

#[test]
fn negative_dividends_survive_strength_reduction() {
    assert_equivalent(
        r"
        x = 0 - 13;
        result = [x / 4, x % 8, x * 4];
        ",
    );
}

#[test]
fn float_operands_survive_strength_reduction() {
    assert_equivalent(
        r"
        x = 13.5;
        result = [x * 8, x / 4, x + 1];
        ",
    );
}

#[test]
fn branching_and_loops() {
    assert_equivalent(
        r"
        total = 0;
        for i in 1..20 {
            if i % 2 == 0 { total += i; }
            else { total -= 1; }
        }
        n = 0;
        while n < 5 { n += 1; }
        result = [total, n];
        ",
    );
}

#[test]
fn string_heavy_programs() {
    assert_equivalent(
        r#"
        s = "a";
        3 times { s = s + "b"; }
        t = "x" + 1;
        result = [s, t];
        "#,
    );
}

#[test]
fn calls_and_tail_positions() {
    assert_equivalent(
        r"
        func dec(n) => n - 1;
        func count(n) => n == 0 ? 0 : count(dec(n));
        result = count(50);
        ",
    );
}

#[test]
fn printed_output_matches() {
    let source = r#"
        for i in 1..3 { printl(f"line {i}"); }
    "#;
    let (on, off) = both_ways(source, "");
    assert_eq!(on.1, off.1);
    assert_eq!(on.1, "line 1\nline 2\nline 3\n");
}

#[test]
fn optimized_code_is_shorter() {
    let source = r"
        x = 2 + 3;
        y = x * 8;
        result = y % 2;
    ";
    let mut on = fluence::Interpreter::with_config(Config::default().optimize_bytecode(true));
    on.compile(source, "test.fl").expect("compiles");
    let mut off = fluence::Interpreter::with_config(Config::default().optimize_bytecode(false));
    off.compile(source, "test.fl").expect("compiles");
    let on_len = on.disassemble().expect("code").lines().count();
    let off_len = off.disassemble().expect("code").lines().count();
    assert!(on_len < off_len, "expected shorter code: {on_len} vs {off_len}");
}
