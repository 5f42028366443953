//! The embedding surface: library registration, globals access, stepping,
//! and host I/O hooks.

use std::cell::Cell;
use std::rc::Rc;

use fluence::{CollectStringPrint, Interpreter, Object, ScriptedLines, VmStatus};
use pretty_assertions::assert_eq;

#[test]
fn registered_functions_are_callable() {
    let mut interp = Interpreter::new();
    interp
        .library(None)
        .expect("not running")
        .add_function("double", 1, |_ctx, args| match args[0] {
            Object::Int(v) => Ok(Object::Int(v * 2)),
            _ => Err("double expects an int".to_owned()),
        })
        .expect("fresh name");
    interp.compile("result = double(21);", "embed.fl").expect("compiles");
    interp.run_until_done().expect("runs");
    assert_eq!(interp.get_global("result"), Some(Object::Int(42)));
}

#[test]
fn namespaced_registration_respects_use() {
    let mut interp = Interpreter::new();
    interp
        .library(Some("Host"))
        .expect("not running")
        .add_function("triple", 1, |_ctx, args| {
            let n = args[0].as_i64().ok_or("triple expects an int")?;
            Ok(Object::Long(n * 3))
        })
        .expect("fresh name");
    let source = r"
        qualified = Host.triple(3);
        use Host
        result = triple(4) + qualified;
    ";
    interp.compile(source, "embed.fl").expect("compiles");
    interp.run_until_done().expect("runs");
    // `triple` returns longs, and long + long stays long.
    assert_eq!(interp.get_global("result"), Some(Object::Long(21)));
}

#[test]
fn host_functions_reach_the_print_hook() {
    let mut interp = Interpreter::new();
    interp
        .library(None)
        .expect("not running")
        .add_function("banner", 1, |ctx, args| {
            ctx.println(&format!("== {} ==", args[0]));
            Ok(Object::Nil)
        })
        .expect("fresh name");
    interp.compile(r#"banner("hi");"#, "embed.fl").expect("compiles");
    let mut out = CollectStringPrint::new();
    let mut input = ScriptedLines::new("");
    interp.run_with_io(&mut out, &mut input).expect("runs");
    assert_eq!(out.output(), "== hi ==\n");
}

#[test]
fn global_constants_and_struct_constants() {
    let mut interp = Interpreter::new();
    {
        let mut lib = interp.library(Some("Phys")).expect("not running");
        lib.add_global_constant("LIGHT", &Object::Int(299)).expect("fresh");
        lib.add_struct("Units").expect("fresh");
        lib.add_constant_to_struct("Units", "KILO", &Object::Int(1000)).expect("fresh");
        lib.add_function_to_struct("Units", "scale", 1, |_ctx, args| {
            let n = args.last().and_then(Object::as_i64).ok_or("scale expects an int")?;
            Ok(Object::Long(n * 1000))
        })
        .expect("fresh");
    }
    let source = r"
        use Phys
        result = LIGHT + Units.KILO;
    ";
    interp.compile(source, "embed.fl").expect("compiles");
    interp.run_until_done().expect("runs");
    assert_eq!(interp.get_global("result"), Some(Object::Int(1299)));
}

#[test]
fn constants_are_readonly_from_scripts() {
    let mut interp = Interpreter::new();
    interp
        .library(None)
        .expect("not running")
        .add_global_constant("VERSION", &Object::Str("1.0".to_owned()))
        .expect("fresh");
    let err = interp.compile(r#"VERSION = "2.0";"#, "embed.fl").expect_err("readonly");
    assert!(err.message.contains("solid"), "message: {}", err.message);
}

#[test]
fn get_and_set_global_round_trip() {
    let mut interp = Interpreter::new();
    interp
        .compile("x = 1; list = [1, 2, [3]];", "embed.fl")
        .expect("compiles");
    interp.run_until_done().expect("runs");

    assert_eq!(interp.get_global("x"), Some(Object::Int(1)));
    assert_eq!(
        interp.get_global("list"),
        Some(Object::List(vec![
            Object::Int(1),
            Object::Int(2),
            Object::List(vec![Object::Int(3)]),
        ]))
    );

    interp.set_global("x", &Object::Str("swapped".to_owned())).expect("known global");
    assert_eq!(interp.get_global("x"), Some(Object::Str("swapped".to_owned())));
    assert_eq!(interp.get_global("no_such_global"), None);
}

#[test]
fn stepping_suspends_and_resumes() {
    let mut interp = Interpreter::new();
    let source = r"
        total = 0;
        for i in 1..100 { total += i; }
        result = total;
    ";
    interp.compile(source, "embed.fl").expect("compiles");

    let mut steps = 0usize;
    loop {
        let status = interp.step(25).expect("no faults");
        steps += 1;
        match status {
            VmStatus::Suspended => {
                assert!(steps < 10_000, "stepping never finished");
            }
            VmStatus::Completed => break,
            other => panic!("unexpected status {other}"),
        }
    }
    assert!(steps > 1, "a 100-iteration loop should outlast one 25-instruction slice");
    assert_eq!(interp.get_global("result"), Some(Object::Int(5050)));
}

#[test]
fn intrinsics_can_signal_recoverable_errors() {
    let mut interp = Interpreter::new();
    interp
        .compile(r#"result = to_int("not a number");"#, "embed.fl")
        .expect("compiles");
    interp.run_until_done().expect("recoverable errors do not fault");
    assert_eq!(interp.get_global("result"), Some(Object::Nil));
    assert!(
        interp.last_intrinsic_message().is_some_and(|m| m.contains("not a number")),
        "message: {:?}",
        interp.last_intrinsic_message()
    );
}

#[test]
fn host_closures_can_carry_state() {
    let calls = Rc::new(Cell::new(0));
    let seen = Rc::clone(&calls);
    let mut interp = Interpreter::new();
    interp
        .library(None)
        .expect("not running")
        .add_function("tick", 0, move |_ctx, _args| {
            seen.set(seen.get() + 1);
            Ok(Object::Int(seen.get()))
        })
        .expect("fresh name");
    interp
        .compile("tick(); tick(); result = tick();", "embed.fl")
        .expect("compiles");
    interp.run_until_done().expect("runs");
    assert_eq!(calls.get(), 3);
    assert_eq!(interp.get_global("result"), Some(Object::Int(3)));
}

#[test]
fn scripted_input_reaches_readl() {
    let mut interp = Interpreter::new();
    interp
        .compile("a = readl(); b = readl(); eof = readl(); result = [a, b, eof];", "embed.fl")
        .expect("compiles");
    let mut out = CollectStringPrint::new();
    let mut input = ScriptedLines::new("first\nsecond\n");
    interp.run_with_io(&mut out, &mut input).expect("runs");
    assert_eq!(
        interp.get_global("result"),
        Some(Object::List(vec![
            Object::Str("first".to_owned()),
            Object::Str("second".to_owned()),
            Object::Nil,
        ]))
    );
}
