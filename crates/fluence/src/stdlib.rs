//! Native delegates: the intrinsic plumbing, the built-in method tables for
//! strings, lists, chars, and ranges, and the core console/conversion
//! intrinsics every program gets.
//!
//! The core set is deliberately small (the full standard libraries are host
//! collaborators); it exists so the language is usable stand-alone and so the
//! embedding registration path is exercised from day one.

use crate::error::{ErrorKind, RunError, RunResult};
use crate::heap::{Heap, HeapData};
use crate::intern::{Interns, StringId, mangle};
use crate::io::{LineReader, PrintWriter};
use crate::scope::{FunctionDecl, FunctionId, IntrinsicId, ScopeId, Scopes};
use crate::value::{Value, display_value, string_slice, values_equal};
use crate::vm::{ExecEnv, Machine};

/// Host-side view the VM hands to a native delegate.
pub struct NativeCtx<'a> {
    pub(crate) heap: &'a mut Heap,
    pub(crate) interns: &'a mut Interns,
    pub(crate) out: &'a mut dyn PrintWriter,
    pub(crate) input: &'a mut dyn LineReader,
    /// Recoverable-error channel: set a message and return nil instead of
    /// failing the program.
    pub(crate) message: &'a mut Option<String>,
}

impl NativeCtx<'_> {
    /// Formats any value the way `printl` would.
    #[must_use]
    pub fn display(&self, value: Value) -> String {
        display_value(value, self.heap, self.interns)
    }

    /// Builds a string value (interned when short).
    pub fn new_string(&mut self, text: &str) -> Value {
        if text.len() <= crate::intern::RUNTIME_INTERN_CAP {
            Value::Str(self.interns.intern(text))
        } else {
            self.heap.alloc_str(text)
        }
    }

    /// Copies out the text of a string value.
    #[must_use]
    pub fn str_of(&self, value: Value) -> Option<String> {
        string_slice(value, self.heap, self.interns).map(str::to_owned)
    }

    /// Records a recoverable intrinsic error and returns nil.
    pub fn recoverable(&mut self, message: impl Into<String>) -> Value {
        *self.message = Some(message.into());
        Value::Nil
    }
}

/// A registered native delegate.
pub(crate) type IntrinsicFn = Box<dyn Fn(&mut NativeCtx<'_>, &[Value]) -> RunResult<Value>>;

pub(crate) struct Intrinsic {
    pub mangled: StringId,
    pub arity: u8,
    pub func: IntrinsicFn,
}

impl std::fmt::Debug for Intrinsic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Intrinsic")
            .field("mangled", &self.mangled)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// Registers a native delegate as a callable symbol in `scope`.
pub(crate) fn register_intrinsic(
    scopes: &mut Scopes,
    interns: &mut Interns,
    intrinsics: &mut Vec<Intrinsic>,
    scope: ScopeId,
    name: &str,
    arity: u8,
    func: IntrinsicFn,
) -> Result<FunctionId, String> {
    let mangled = interns.intern(&mangle(name, usize::from(arity)));
    let base = interns.intern(name);
    let iid = IntrinsicId::new(intrinsics.len());
    intrinsics.push(Intrinsic { mangled, arity, func });
    let decl = FunctionDecl {
        mangled,
        base_name: base,
        arity,
        params: smallvec::SmallVec::new(),
        by_ref: 0,
        start: 0,
        end: 0,
        scope,
        registers: 0,
        is_lambda: false,
        intrinsic: Some(iid),
        owner: None,
    };
    scopes
        .declare_function(scope, decl)
        .map_err(|_| format!("`{name}` with arity {arity} is already registered"))
}

/// Registers the always-available console and conversion intrinsics into the
/// global scope.
pub(crate) fn register_core(scopes: &mut Scopes, interns: &mut Interns, intrinsics: &mut Vec<Intrinsic>) {
    let global = crate::scope::GLOBAL_SCOPE;
    let mut add = |name: &str, arity: u8, func: IntrinsicFn| {
        register_intrinsic(scopes, interns, intrinsics, global, name, arity, func)
            .expect("core intrinsic registration cannot collide");
    };

    add(
        "printl",
        1,
        Box::new(|ctx, args| {
            let text = ctx.display(args[0]);
            ctx.out.stdout_write(&text);
            ctx.out.stdout_push('\n');
            Ok(Value::Nil)
        }),
    );
    add(
        "printl",
        0,
        Box::new(|ctx, _args| {
            ctx.out.stdout_push('\n');
            Ok(Value::Nil)
        }),
    );
    add(
        "print",
        1,
        Box::new(|ctx, args| {
            let text = ctx.display(args[0]);
            ctx.out.stdout_write(&text);
            Ok(Value::Nil)
        }),
    );
    add(
        "readl",
        0,
        Box::new(|ctx, _args| match ctx.input.read_line() {
            Some(line) => Ok(ctx.new_string(&line)),
            None => Ok(Value::Nil),
        }),
    );
    add(
        "to_string",
        1,
        Box::new(|ctx, args| {
            let text = ctx.display(args[0]);
            Ok(ctx.new_string(&text))
        }),
    );
    add(
        "to_int",
        1,
        Box::new(|ctx, args| match args[0] {
            Value::Int(_) | Value::Long(_) => Ok(args[0]),
            Value::Float(v) => Ok(Value::Int(v as i32)),
            Value::Double(v) => Ok(Value::Long(v as i64).narrowed()),
            Value::Char(c) => Ok(Value::Int(
                i32::try_from(c.to_digit(10).map_or(u32::from(c), |d| d)).unwrap_or(0),
            )),
            other => {
                let Some(text) = ctx.str_of(other) else {
                    return Err(RunError::type_mismatch("to_int expects a number or string"));
                };
                match text.trim().parse::<i64>() {
                    Ok(value) => Ok(Value::Long(value).narrowed()),
                    Err(_) => Ok(ctx.recoverable(format!("`{text}` is not an integer"))),
                }
            }
        }),
    );
    add(
        "to_float",
        1,
        Box::new(|ctx, args| match args[0] {
            Value::Int(v) => Ok(Value::Double(f64::from(v))),
            Value::Long(v) => Ok(Value::Double(v as f64)),
            Value::Float(v) => Ok(Value::Double(f64::from(v))),
            Value::Double(_) => Ok(args[0]),
            other => {
                let Some(text) = ctx.str_of(other) else {
                    return Err(RunError::type_mismatch("to_float expects a number or string"));
                };
                match text.trim().parse::<f64>() {
                    Ok(value) => Ok(Value::Double(value)),
                    Err(_) => Ok(ctx.recoverable(format!("`{text}` is not a number"))),
                }
            }
        }),
    );
    add(
        "typeof",
        1,
        Box::new(|ctx, args| {
            let name = args[0].type_name(ctx.heap);
            Ok(ctx.new_string(name))
        }),
    );
}

/// Widens or narrows helper for intrinsic results.
trait Narrowed {
    fn narrowed(self) -> Self;
}

impl Narrowed for Value {
    fn narrowed(self) -> Self {
        match self {
            Self::Long(v) => i32::try_from(v).map_or(self, Self::Int),
            _ => self,
        }
    }
}

/// Intrinsic method dispatch for built-in object types. `args[0]` is the
/// receiver.
pub(crate) fn builtin_method(
    machine: &mut Machine,
    env: &mut ExecEnv<'_>,
    name: &str,
    args: &[Value],
) -> RunResult<Value> {
    let receiver = args[0];
    let argc = args.len() - 1;

    // List methods.
    if let Value::Ref(id) = receiver
        && matches!(machine.heap.get(id), HeapData::List(_))
    {
        return list_method(machine, env, id, name, argc, args);
    }
    // Range methods.
    if let Value::Ref(id) = receiver
        && let HeapData::Range { start, end } = machine.heap.get(id)
    {
        let (start, end) = (*start, *end);
        return match (name, argc) {
            ("length", 0) => Ok(Value::Long(end.saturating_sub(start).saturating_add(1).max(0)).narrowed()),
            ("start", 0) => Ok(Value::Long(start).narrowed()),
            ("end", 0) => Ok(Value::Long(end).narrowed()),
            _ => Err(no_method("range", name, argc)),
        };
    }
    // String methods.
    if string_slice(receiver, &machine.heap, env.interns).is_some() {
        return string_method(machine, env, receiver, name, argc, args);
    }
    // Char methods.
    if let Value::Char(c) = receiver {
        return match (name, argc) {
            ("to_int", 0) => Ok(Value::Int(i32::try_from(u32::from(c)).unwrap_or(0))),
            ("is_digit", 0) => Ok(Value::Bool(c.is_ascii_digit())),
            ("upper", 0) => Ok(Value::Char(c.to_ascii_uppercase())),
            ("lower", 0) => Ok(Value::Char(c.to_ascii_lowercase())),
            _ => Err(no_method("char", name, argc)),
        };
    }

    Err(no_method(receiver.type_name(&machine.heap), name, argc))
}

fn no_method(type_name: &str, method: &str, argc: usize) -> RunError {
    RunError::new(
        ErrorKind::UnknownVariable,
        format!("{type_name} has no method `{method}` taking {argc} argument(s)"),
    )
}

fn list_method(
    machine: &mut Machine,
    env: &mut ExecEnv<'_>,
    id: crate::heap::HeapId,
    name: &str,
    argc: usize,
    args: &[Value],
) -> RunResult<Value> {
    match (name, argc) {
        ("push", 1) => {
            let HeapData::List(items) = machine.heap.get_mut(id) else {
                unreachable!("receiver checked as list");
            };
            items.push(args[1]);
            Ok(args[0])
        }
        ("pop", 0) => {
            let HeapData::List(items) = machine.heap.get_mut(id) else {
                unreachable!("receiver checked as list");
            };
            Ok(items.pop().unwrap_or(Value::Nil))
        }
        ("length" | "size", 0) => {
            let HeapData::List(items) = machine.heap.get(id) else {
                unreachable!("receiver checked as list");
            };
            Ok(Value::Long(items.len() as i64).narrowed())
        }
        // Out-of-bounds reads yield nil here, unlike `[]` indexing.
        ("element_at", 1) => {
            let index = args[1]
                .as_integer()
                .ok_or_else(|| RunError::type_mismatch("element_at expects an integer index"))?;
            let HeapData::List(items) = machine.heap.get(id) else {
                unreachable!("receiver checked as list");
            };
            if index < 0 {
                return Ok(Value::Nil);
            }
            Ok(usize::try_from(index)
                .ok()
                .and_then(|i| items.get(i).copied())
                .unwrap_or(Value::Nil))
        }
        ("contains", 1) => {
            let HeapData::List(items) = machine.heap.get(id) else {
                unreachable!("receiver checked as list");
            };
            let found = items
                .iter()
                .any(|&item| values_equal(item, args[1], &machine.heap, env.interns));
            Ok(Value::Bool(found))
        }
        ("clear", 0) => {
            let HeapData::List(items) = machine.heap.get_mut(id) else {
                unreachable!("receiver checked as list");
            };
            items.clear();
            Ok(args[0])
        }
        _ => Err(no_method("list", name, argc)),
    }
}

fn string_method(
    machine: &mut Machine,
    env: &mut ExecEnv<'_>,
    receiver: Value,
    name: &str,
    argc: usize,
    args: &[Value],
) -> RunResult<Value> {
    let text = string_slice(receiver, &machine.heap, env.interns)
        .expect("receiver checked as string")
        .to_owned();
    match (name, argc) {
        ("length", 0) => Ok(Value::Long(text.chars().count() as i64).narrowed()),
        ("upper", 0) => {
            let upper = text.to_uppercase();
            Ok(machine.make_string(env, upper))
        }
        ("lower", 0) => {
            let lower = text.to_lowercase();
            Ok(machine.make_string(env, lower))
        }
        ("trim", 0) => {
            let trimmed = text.trim().to_owned();
            Ok(machine.make_string(env, trimmed))
        }
        ("contains", 1) => {
            let needle = string_slice(args[1], &machine.heap, env.interns)
                .ok_or_else(|| RunError::type_mismatch("contains expects a string"))?;
            Ok(Value::Bool(text.contains(needle)))
        }
        ("split", 1) => {
            let separator = string_slice(args[1], &machine.heap, env.interns)
                .ok_or_else(|| RunError::type_mismatch("split expects a string separator"))?
                .to_owned();
            let pieces: Vec<String> = text.split(&separator).map(str::to_owned).collect();
            let mut items = Vec::with_capacity(pieces.len());
            for piece in pieces {
                items.push(machine.make_string(env, piece));
            }
            let id = machine.heap.alloc(HeapData::List(items));
            Ok(Value::Ref(id))
        }
        _ => Err(no_method("string", name, argc)),
    }
}
