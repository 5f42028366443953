//! End-to-end scenarios: whole programs compiled and run, with the `result`
//! global inspected afterwards.

mod common;

use common::{result_of, run_with};
use fluence::{Config, Object};
use pretty_assertions::assert_eq;

#[test]
fn strength_reduced_modulo() {
    assert_eq!(result_of("result = 10 % 2;"), Object::Int(0));
}

#[test]
fn float_math() {
    assert_eq!(result_of("result = 5.0 / 2.0;"), Object::Double(2.5));
}

#[test]
fn string_concat() {
    assert_eq!(
        result_of(r#"result = "Hello" + " World";"#),
        Object::Str("Hello World".to_owned())
    );
}

#[test]
fn struct_direct_init() {
    let source = r"
        struct Vec2 { x; y; }
        result = nil;
        func Main() => {
            v = Vec2 { x: 10, y: 20 };
            result = v.x + v.y;
        }
    ";
    assert_eq!(result_of(source), Object::Int(30));
}

#[test]
fn range_for_loop() {
    let source = r"
        sum = 0;
        for i in 1..4 { sum += i; }
        result = sum;
    ";
    assert_eq!(result_of(source), Object::Int(10));
}

#[test]
fn lambda_reducer() {
    let source = r"
        list = [1..5];
        result = list |>>= (0, (acc, n) => acc + n);
    ";
    assert_eq!(result_of(source), Object::Int(15));
}

#[test]
fn collective_and() {
    let source = r"
        a = 10; b = 10; c = 5;
        r1 = a, b <==| 10;
        r2 = a, b, c <==| 10;
        result = r1 && !r2;
    ";
    assert_eq!(result_of(source), Object::Bool(true));
}

#[test]
fn unique_chain_assign() {
    let source = r"
        counter = 0;
        increment = () => { counter += 1; return counter; };
        a, b <2!| increment();
        result = a + b;
    ";
    assert_eq!(result_of(source), Object::Int(3));
}

#[test]
fn match_expression() {
    let source = r"
        val = 2;
        result = match val { 1 -> 10; 2 -> 20; rest -> 0; };
    ";
    assert_eq!(result_of(source), Object::Int(20));
}

#[test]
fn calculator_end_to_end() {
    let source = r#"
        a = to_int(readl());
        b = to_int(readl());
        op = readl();
        result = match op {
            "+" -> a + b
            "-" -> a - b
            "*" -> a * b
            rest -> nil
        };
        printl(f"Result: {result}");
    "#;
    let (interp, output) = run_with(source, Config::default(), "3\n4\n+\n");
    assert_eq!(output, "Result: 7\n");
    assert_eq!(interp.get_global("result"), Some(Object::Int(7)));
}

#[test]
fn guard_chain() {
    let source = r"
        a = 1; b = 2; c = 3;
        success <??| a < b, b < c;
        fail <??| a < b, b > c;
        result = success && !fail;
    ";
    assert_eq!(result_of(source), Object::Bool(true));
}

#[test]
fn truthiness_is_nil_and_false_only() {
    assert_eq!(result_of("result = nil ? 1 : 2;"), Object::Int(2));
    assert_eq!(result_of("result = false ? 1 : 2;"), Object::Int(2));
    assert_eq!(result_of("result = 0 ? 1 : 2;"), Object::Int(1));
    assert_eq!(result_of(r#"result = "" ? 1 : 2;"#), Object::Int(1));
}

#[test]
fn shadowing_leaves_outer_binding_alone() {
    let source = r"
        x = 1;
        func f(x) => { x = 99; return x; }
        r = f(5);
        result = [r, x];
    ";
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Int(99), Object::Int(1)])
    );
}

#[test]
fn functions_assign_enclosing_globals() {
    let source = r"
        result = nil;
        func Main() => { result = 42; }
    ";
    assert_eq!(result_of(source), Object::Int(42));
}

#[test]
fn numeric_promotion_ladder() {
    assert_eq!(result_of("result = 1 + 2;"), Object::Int(3));
    assert_eq!(result_of("result = 1 + 5000000000;"), Object::Long(5_000_000_001));
    assert_eq!(result_of("result = 1 + 0.5;"), Object::Double(1.5));
    assert_eq!(result_of("result = 7 / 2;"), Object::Int(3));
    assert_eq!(result_of("result = 2 ** 10;"), Object::Int(1024));
    assert_eq!(result_of("result = 2.0 ** 2;"), Object::Double(4.0));
}

#[test]
fn forward_references_resolve_in_any_order() {
    let source = r"
        result = nil;
        func Main() => { result = late(20); }
        func late(n) => n + early(n);
        func early(n) => n + 2;
    ";
    assert_eq!(result_of(source), Object::Int(42));
}

#[test]
fn fstring_interpolation() {
    let source = r#"
        name = "world";
        n = 6;
        result = f"hello {name}, {n * 7}!";
    "#;
    assert_eq!(result_of(source), Object::Str("hello world, 42!".to_owned()));
}

#[test]
fn recursion_works_and_is_bounded() {
    let source = r"
        func fib(n) => n < 2 ? n : fib(n - 1) + fib(n - 2);
        result = fib(15);
    ";
    assert_eq!(result_of(source), Object::Int(610));
}
