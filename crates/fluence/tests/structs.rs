//! Structs, enums, traits, namespaces, methods, and by-ref parameters.

mod common;

use common::result_of;
use fluence::Object;
use pretty_assertions::assert_eq;

#[test]
fn struct_defaults_and_literal_overrides() {
    let source = r#"
        struct Point { x = 1; y = 2; label; }
        p = Point { y: 20 };
        result = [p.x, p.y, p.label];
    "#;
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Int(1), Object::Int(20), Object::Nil])
    );
}

#[test]
fn methods_mutate_their_receiver() {
    let source = r"
        struct Counter {
            count = 0
            func bump() => { self.count += 1; return self.count; }
            func bump_by(n) => { self.count += n; return self.count; }
        }
        c = Counter { };
        c.bump();
        c.bump_by(10);
        result = c.count;
    ";
    assert_eq!(result_of(source), Object::Int(11));
}

#[test]
fn instances_share_by_reference() {
    let source = r"
        struct Box { value; }
        a = Box { value: 1 };
        b = a;
        b.value = 5;
        result = a.value;
    ";
    assert_eq!(result_of(source), Object::Int(5));
}

#[test]
fn method_references_bind_their_receiver() {
    let source = r"
        struct Greeter {
            n = 41
            func value() => self.n + 1
        }
        g = Greeter { };
        m = g.value;
        result = m();
    ";
    assert_eq!(result_of(source), Object::Int(42));
}

#[test]
fn struct_statics_are_readonly_globals() {
    let source = r"
        struct Circle {
            solid TWO_PI = 6
        }
        result = Circle.TWO_PI * 2;
    ";
    assert_eq!(result_of(source), Object::Int(12));
}

#[test]
fn enums_assign_sequential_integers() {
    let source = r"
        enum Color { Red, Green, Blue }
        result = [Color.Red, Color.Green, Color.Blue];
    ";
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Int(0), Object::Int(1), Object::Int(2)])
    );
}

#[test]
fn traits_supply_defaults_and_enforce_requirements() {
    let source = r#"
        trait Greet {
            greeting = "hi"
            func greet()
            func loud() => { return "LOUD"; }
        }
        struct English impl Greet {
            func greet() => { return self.greeting; }
        }
        e = English { };
        result = [e.greet(), e.loud()];
    "#;
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Str("hi".to_owned()), Object::Str("LOUD".to_owned())])
    );
}

#[test]
fn missing_trait_requirement_is_a_parse_error() {
    let source = r"
        trait Named { func name() }
        struct Ghost impl Named { }
    ";
    let mut interp = fluence::Interpreter::new();
    let err = interp.compile(source, "test.fl").expect_err("must fail");
    assert!(err.message.contains("Named"), "unexpected message: {}", err.message);
}

#[test]
fn namespaces_resolve_with_use_or_qualified_access() {
    let source = r"
        space Math {
            func double(x) => x * 2
            solid BASE = 10
        }
        qualified = Math.double(5);
        use Math
        bare = double(6);
        result = [qualified, bare, Math.BASE];
    ";
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Int(10), Object::Int(12), Object::Int(10)])
    );
}

#[test]
fn by_ref_parameters_write_through() {
    let source = r"
        func bump(ref x) => { x = x + 1; }
        n = 5;
        bump(n);
        bump(n);
        result = n;
    ";
    assert_eq!(result_of(source), Object::Int(7));
}

#[test]
fn by_ref_locals_write_through() {
    let source = r"
        func bump(ref x) => { x = x + 10; }
        result = nil;
        func Main() => {
            local = 1;
            bump(local);
            result = local;
        }
    ";
    assert_eq!(result_of(source), Object::Int(11));
}

#[test]
fn overloads_by_arity_coexist() {
    let source = r"
        func pad(s) => s + 1;
        func pad(s, n) => s + n;
        result = [pad(1), pad(1, 10)];
    ";
    assert_eq!(
        result_of(source),
        Object::List(vec![Object::Int(2), Object::Int(11)])
    );
}

#[test]
fn lambdas_capture_nothing_but_read_globals() {
    let source = r"
        base = 10;
        f = (n) => n + base;
        result = f(5);
    ";
    assert_eq!(result_of(source), Object::Int(15));
}

#[test]
fn instances_in_lists_stay_live_across_gc_pressure() {
    let source = r#"
        struct Node { tag; }
        keep = [];
        for i in 1..50 {
            n = Node { tag: i };
            keep.push(n);
            junk = "x" + to_string(i) + "y";
        }
        result = keep.length();
    "#;
    assert_eq!(result_of(source), Object::Int(50));
}
