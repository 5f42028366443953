//! Coverage for the pipeline operator set: pipes, assignment families,
//! collective comparisons, the dot family, and the loop forms.

mod common;

use common::{result_of, run};
use fluence::Object;
use pretty_assertions::assert_eq;

#[test]
fn pipe_with_placeholder() {
    let source = r"
        func double(n) => n * 2;
        result = 5 |> double(_) |> double(_);
    ";
    assert_eq!(result_of(source), Object::Int(20));
}

#[test]
fn pipe_with_implicit_placeholder() {
    let source = r"
        func double(n) => n * 2;
        result = 21 |> double;
    ";
    assert_eq!(result_of(source), Object::Int(42));
}

#[test]
fn pipe_placeholder_in_expression_stage() {
    assert_eq!(result_of("result = 10 |> _ + 5 |> _ * 2;"), Object::Int(30));
}

#[test]
fn optional_pipe_short_circuits_on_nil() {
    let source = r"
        func double(n) => n * 2;
        a = nil |? double(_);
        b = 4 |? double(_);
        result = [a, b];
    ";
    assert_eq!(result_of(source), Object::List(vec![Object::Nil, Object::Int(8)]));
}

#[test]
fn guard_pipe_short_circuits_on_false() {
    let source = r"
        func double(n) => n * 2;
        a = false |?? double(_);
        b = 4 |?? double(_);
        result = [a, b];
    ";
    assert_eq!(result_of(source), Object::List(vec![Object::Bool(false), Object::Int(8)]));
}

#[test]
fn map_pipe() {
    assert_eq!(
        result_of("result = [1, 2, 3] |>> _ * 2;"),
        Object::List(vec![Object::Int(2), Object::Int(4), Object::Int(6)])
    );
}

#[test]
fn scan_pipe_collects_intermediates() {
    assert_eq!(
        result_of("result = [1, 2, 3] |~> (0, (acc, n) => acc + n);"),
        Object::List(vec![Object::Int(1), Object::Int(3), Object::Int(6)])
    );
}

#[test]
fn composition_builds_a_callable() {
    let source = r"
        func inc(n) => n + 1;
        func double(n) => n * 2;
        h = inc ~> double;
        result = h(5);
    ";
    assert_eq!(result_of(source), Object::Int(12));
}

#[test]
fn sequential_assign() {
    let source = r"
        a, b, c <~| 1, 2, 3;
        result = [a, b, c];
    ";
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Int(1), Object::Int(2), Object::Int(3)])
    );
}

#[test]
fn sequential_assign_skips_nil() {
    let source = r"
        a = 7;
        a, b <~?| nil, 5;
        result = [a, b];
    ";
    assert_eq!(result_of(source), Object::List(vec![Object::Int(7), Object::Int(5)]));
}

#[test]
fn chain_assign_all() {
    let source = r"
        a, b, c <| 9;
        result = [a, b, c];
    ";
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Int(9), Object::Int(9), Object::Int(9)])
    );
}

#[test]
fn chunked_chain_assign() {
    let source = r"
        a, b, c, d <2| 1, 2;
        result = [a, b, c, d];
    ";
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Int(1), Object::Int(1), Object::Int(2), Object::Int(2)])
    );
}

#[test]
fn optional_chain_assign_gates_on_nil() {
    let source = r"
        a = 1; b = 2;
        a, b <2?| nil;
        c, d <2?| 5;
        result = [a, b, c, d];
    ";
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Int(1), Object::Int(2), Object::Int(5), Object::Int(5)])
    );
}

#[test]
fn collective_comparisons() {
    let source = r"
        a = 1; b = 5;
        both_small = a, b <<| 10;
        any_is_one = a, b <||==| 1;
        none_large = a, b <>| 0;
        result = both_small && any_is_one && none_large;
    ";
    assert_eq!(result_of(source), Object::Bool(true));
}

#[test]
fn guard_or_chain() {
    let source = r"
        r <||??| false, 5;
        result = r;
    ";
    assert_eq!(result_of(source), Object::Int(5));
}

#[test]
fn dot_and_or() {
    let source = r"
        x = true; y = 7; z = false;
        a = x.and(y);
        b = z.or(y);
        c = x.and(z, y);
        result = [a, b, c];
    ";
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Int(7), Object::Int(7), Object::Bool(false)])
    );
}

#[test]
fn dot_increment_and_parallel_op_assign() {
    let source = r"
        a = 1; b = 2;
        .++(a, b);
        c = 10; d = 20;
        c, d .+= 5;
        result = [a, b, c, d];
    ";
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Int(2), Object::Int(3), Object::Int(15), Object::Int(25)])
    );
}

#[test]
fn broadcast_applies_template_per_value() {
    let source = r"
        total = 0;
        func add(n) => { total += n; return total; }
        add(_) <| 1, 2, 3;
        result = total;
    ";
    assert_eq!(result_of(source), Object::Int(6));
}

#[test]
fn swap_and_flip() {
    let source = r"
        a = 1; b = 2;
        a >< b;
        t = true;
        t!!;
        result = [a, b, t];
    ";
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Int(2), Object::Int(1), Object::Bool(false)])
    );
}

#[test]
fn postfix_increment_decrement() {
    let source = r"
        i = 5;
        old = i++;
        j = 5;
        j--;
        result = [old, i, j];
    ";
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Int(5), Object::Int(6), Object::Int(4)])
    );
}

#[test]
fn both_ternary_forms() {
    let source = r"
        c = true;
        a = c ? 1 : 2;
        b = c ?: 3, 4;
        result = [a, b];
    ";
    assert_eq!(result_of(source), Object::List(vec![Object::Int(1), Object::Int(3)]));
}

#[test]
fn train_statement_sequence() {
    let source = r"
        ->> a = 1 ->> b = a + 1 ->> c = b + 1 <<-
        result = c;
    ";
    assert_eq!(result_of(source), Object::Int(3));
}

#[test]
fn times_loops() {
    let source = r"
        count = 0;
        3 times { count += 1; }
        sum = 0;
        4 times as i { sum += i; }
        result = [count, sum];
    ";
    assert_eq!(result_of(source), Object::List(vec![Object::Int(3), Object::Int(6)]));
}

#[test]
fn unless_and_until() {
    let source = r"
        r = 0;
        unless false { r = 1; }
        n = 0;
        until n >= 3 { n += 1; }
        result = [r, n];
    ";
    assert_eq!(result_of(source), Object::List(vec![Object::Int(1), Object::Int(3)]));
}

#[test]
fn c_style_for() {
    let source = r"
        sum = 0;
        for i = 0; i < 5; i++ { sum += i; }
        result = sum;
    ";
    assert_eq!(result_of(source), Object::Int(10));
}

#[test]
fn break_and_continue() {
    let source = r"
        sum = 0;
        for i in 1..10 {
            if i == 3 { continue; }
            if i > 5 { break; }
            sum += i;
        }
        result = sum;
    ";
    // 1 + 2 + 4 + 5
    assert_eq!(result_of(source), Object::Int(12));
}

#[test]
fn match_colon_form_falls_through_until_break() {
    let source = r"
        trace = 0;
        val = 1;
        match val {
            1:
                trace += 1;
            2:
                trace += 10;
                break;
            rest:
                trace += 100;
        }
        result = trace;
    ";
    // Case 1 falls through into case 2, which breaks before `rest`.
    assert_eq!(result_of(source), Object::Int(11));
}

#[test]
fn match_patterns_can_be_comma_lists() {
    let source = r#"
        func classify(n) => match n { 1, 2 -> "small"; rest -> "big"; };
        result = [classify(2), classify(9)];
    "#;
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Str("small".to_owned()), Object::Str("big".to_owned())])
    );
}

#[test]
fn logical_operators_keep_operand_semantics() {
    let source = r#"
        a = nil || "fallback";
        b = 5 && 7;
        c = false && 7;
        result = [a, b, c];
    "#;
    assert_eq!(
        result_of(source),
        Object::List(vec![
            Object::Str("fallback".to_owned()),
            Object::Int(7),
            Object::Bool(false),
        ])
    );
}

#[test]
fn list_and_string_indexing() {
    let source = r#"
        list = [10, 20, 30];
        list[1] = 21;
        word = "abc";
        result = [list[1], word[0]];
    "#;
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Int(21), Object::Char('a')])
    );
}

#[test]
fn builtin_methods() {
    let source = r#"
        list = [1, 2];
        list.push(3);
        a = list.length();
        b = list.element_at(99);
        c = "Hello".upper();
        d = (1..4).length();
        result = [a, b, c, d];
    "#;
    assert_eq!(
        result_of(source),
        Object::List(vec![
            Object::Int(3),
            Object::Nil,
            Object::Str("HELLO".to_owned()),
            Object::Int(4),
        ])
    );
}

#[test]
fn iterators_are_fresh_per_loop() {
    let source = r"
        list = [1, 2, 3];
        first = 0;
        second = 0;
        for x in list { first += x; }
        for x in list { second += x; }
        result = [first, second];
    ";
    let expected = Object::List(vec![Object::Int(6), Object::Int(6)]);
    assert_eq!(result_of(source), expected);
}

#[test]
fn nested_loops_with_labelless_break() {
    let source = r"
        hits = 0;
        for i in 1..3 {
            for j in 1..3 {
                if j == 2 { break; }
                hits += 1;
            }
        }
        result = hits;
    ";
    assert_eq!(result_of(source), Object::Int(3));
}

#[test]
fn hash_if_blocks_gate_on_symbols() {
    use fluence::Config;

    let source = r"
        x = 0;
        #IF DEBUG { x = 1 }
        result = x;
    ";
    let (with_symbol, _) = common::run_with(source, Config::default().compilation_symbol("DEBUG"), "");
    assert_eq!(with_symbol.get_global("result"), Some(Object::Int(1)));

    let without = run(source);
    assert_eq!(without.get_global("result"), Some(Object::Int(0)));
}
