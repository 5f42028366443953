//! Value operations behind the arithmetic, collection, field, and iterator
//! opcodes.

use super::{ExecEnv, Machine};
use crate::bytecode::Opcode;
use crate::error::{ErrorKind, RunError, RunResult};
use crate::heap::{HeapData, IterState};
use crate::intern::{RUNTIME_INTERN_CAP, StringId};
use crate::scope::Symbol;
use crate::value::{CmpOp, Value, compare_values, string_slice, values_equal};

/// Unary numeric negation.
pub(super) fn negate(a: Value) -> RunResult<Value> {
    match a {
        Value::Int(v) => Ok(Value::Int(v.wrapping_neg())),
        Value::Long(v) => Ok(Value::Long(v.wrapping_neg())),
        Value::Float(v) => Ok(Value::Float(-v)),
        Value::Double(v) => Ok(Value::Double(-v)),
        _ => Err(RunError::type_mismatch("unary `-` requires a number")),
    }
}

fn integer_operands(a: Value, b: Value, what: &str) -> RunResult<(i64, i64, bool)> {
    match (a.as_integer(), b.as_integer()) {
        (Some(x), Some(y)) => {
            let both_int32 = matches!((a, b), (Value::Int(_), Value::Int(_)));
            Ok((x, y, both_int32))
        }
        _ => Err(RunError::type_mismatch(format!("{what} requires integer operands"))),
    }
}

fn narrow(value: i64, both_int32: bool) -> Value {
    if both_int32
        && let Ok(small) = i32::try_from(value)
    {
        return Value::Int(small);
    }
    Value::Long(value)
}

/// Binary bitwise and shift operations on integers.
///
/// The optimizer strength-reduces `Div`/`Mod` by power-of-two constants into
/// `Shr`/`BitAnd` without knowing the dividend's numeric kind, so a float
/// left operand keeps the arithmetic meaning of those rewrites: `Shr` divides
/// by `2^n`, `BitAnd` takes the modulus `mask + 1`, `Shl` multiplies.
pub(super) fn bitwise(op: Opcode, a: Value, b: Value) -> RunResult<Value> {
    if matches!(a, Value::Float(_) | Value::Double(_)) {
        let x = a.as_f64().expect("checked float");
        let Some(y) = b.as_integer() else {
            return Err(RunError::type_mismatch("bitwise operation requires integer operands"));
        };
        let result = match op {
            Opcode::Shr => x / (1u64 << (y & 63)) as f64,
            Opcode::Shl => x * (1u64 << (y & 63)) as f64,
            Opcode::BitAnd => x % (y + 1) as f64,
            _ => return Err(RunError::type_mismatch("bitwise operation requires integer operands")),
        };
        return Ok(match a {
            Value::Float(_) => Value::Float(result as f32),
            _ => Value::Double(result),
        });
    }
    let (x, y, both_int32) = integer_operands(a, b, "bitwise operation")?;
    let result = match op {
        // Negative left operands keep truncated-remainder semantics for
        // low-bit masks so the strength-reduced modulo matches plain `Mod`.
        Opcode::BitAnd => {
            if x < 0 && y > 0 && (y + 1).count_ones() == 1 {
                x.wrapping_rem(y + 1)
            } else {
                x & y
            }
        }
        Opcode::BitOr => x | y,
        Opcode::BitXor => x ^ y,
        Opcode::Shl => x.wrapping_shl(u32::try_from(y & 63).expect("masked shift fits")),
        // Truncated division for negatives: this opcode is reached only
        // through the divide-by-power-of-two rewrite, never from source.
        Opcode::Shr => {
            if x < 0 {
                x.wrapping_div(1i64 << (y & 63))
            } else {
                x.wrapping_shr(u32::try_from(y & 63).expect("masked shift fits"))
            }
        }
        _ => unreachable!("not a bitwise opcode: {op:?}"),
    };
    Ok(narrow(result, both_int32))
}

pub(super) fn bit_not(a: Value) -> RunResult<Value> {
    match a {
        Value::Int(v) => Ok(Value::Int(!v)),
        Value::Long(v) => Ok(Value::Long(!v)),
        _ => Err(RunError::type_mismatch("bitwise not requires an integer")),
    }
}

/// Strength-reduced multiply by a power of two.
pub(super) fn mul_pow2(a: Value, shift: u32) -> RunResult<Value> {
    match a {
        Value::Int(v) => {
            let wide = i64::from(v) << shift;
            Ok(i32::try_from(wide).map_or(Value::Long(wide), Value::Int))
        }
        Value::Long(v) => Ok(Value::Long(v.wrapping_shl(shift))),
        Value::Float(v) => Ok(Value::Float(v * (1u64 << shift) as f32)),
        Value::Double(v) => Ok(Value::Double(v * (1u64 << shift) as f64)),
        _ => Err(RunError::type_mismatch("multiplication requires a number")),
    }
}

impl Machine {
    /// `Add`: numeric addition, or string concatenation when either operand
    /// is a string or char. Short results intern opportunistically.
    pub(super) fn add_values(&mut self, env: &mut ExecEnv<'_>, a: Value, b: Value) -> RunResult<Value> {
        if a.is_number() && b.is_number() {
            return crate::value::numeric_binary(crate::value::ArithOp::Add, a, b);
        }
        let a_stringish = matches!(a, Value::Char(_)) || string_slice(a, &self.heap, env.interns).is_some();
        let b_stringish = matches!(b, Value::Char(_)) || string_slice(b, &self.heap, env.interns).is_some();
        if a_stringish || b_stringish {
            let mut out = String::new();
            crate::value::write_value(&mut out, a, &self.heap, env.interns);
            crate::value::write_value(&mut out, b, &self.heap, env.interns);
            return Ok(self.make_string(env, out));
        }
        Err(RunError::type_mismatch(format!(
            "cannot add {} and {}",
            a.type_name(&self.heap),
            b.type_name(&self.heap)
        )))
    }

    /// Allocates a runtime string, interning short ones.
    pub(crate) fn make_string(&mut self, env: &mut ExecEnv<'_>, text: String) -> Value {
        if text.len() <= RUNTIME_INTERN_CAP {
            Value::Str(env.interns.intern(&text))
        } else {
            self.heap.alloc_str(text)
        }
    }

    pub(super) fn cmp_holds(&self, env: &ExecEnv<'_>, op: CmpOp, a: Value, b: Value) -> RunResult<bool> {
        match op {
            CmpOp::Eq => Ok(values_equal(a, b, &self.heap, env.interns)),
            CmpOp::Neq => Ok(!values_equal(a, b, &self.heap, env.interns)),
            _ => {
                let ordering = compare_values(a, b, &self.heap, env.interns).ok_or_else(|| {
                    RunError::type_mismatch(format!(
                        "cannot order {} and {}",
                        a.type_name(&self.heap),
                        b.type_name(&self.heap)
                    ))
                })?;
                Ok(match op {
                    CmpOp::Lt => ordering.is_lt(),
                    CmpOp::Le => ordering.is_le(),
                    CmpOp::Gt => ordering.is_gt(),
                    CmpOp::Ge => ordering.is_ge(),
                    CmpOp::Eq | CmpOp::Neq => unreachable!("handled above"),
                })
            }
        }
    }

    /// Deferred name lookup for identifiers the parser could not resolve.
    pub(super) fn load_global_named(
        &mut self,
        env: &mut ExecEnv<'_>,
        frame: &super::Frame,
        name: StringId,
    ) -> RunResult<Value> {
        let scope = env.scopes.functions[frame.func.index()].scope;
        match env.scopes.resolve(scope, name) {
            Some(Symbol::Var(var)) => Ok(self.read_global(var.slot as usize)),
            Some(Symbol::Func(fid)) => {
                let id = self.heap.alloc(HeapData::Function(fid));
                Ok(Value::Ref(id))
            }
            _ => Err(self.unknown_variable(env, scope, name)),
        }
    }

    /// Builds an `UnknownVariable` error elaborated with near-miss
    /// signatures of same-base-name callables.
    pub(super) fn unknown_variable(
        &self,
        env: &ExecEnv<'_>,
        scope: crate::scope::ScopeId,
        name: StringId,
    ) -> RunError {
        let base = crate::intern::demangle(env.interns.get(name)).to_owned();
        let mut hints = Vec::new();
        if let Some(base_id) = env.interns.lookup(&base) {
            for fid in env.scopes.overloads_of(scope, base_id) {
                let decl = &env.scopes.functions[fid.index()];
                let params: Vec<&str> = decl.params.iter().map(|&p| env.interns.get(p)).collect();
                hints.push(format!("{base}({}) takes {} argument(s)", params.join(", "), decl.arity));
            }
        }
        RunError::with_hints(
            ErrorKind::UnknownVariable,
            format!("`{base}` is not defined"),
            hints,
        )
    }

    pub(super) fn load_field(&mut self, env: &mut ExecEnv<'_>, obj: Value, name: StringId) -> RunResult<Value> {
        let Value::Ref(id) = obj else {
            return Err(RunError::type_mismatch(format!(
                "{} has no field `{}`",
                obj.type_name(&self.heap),
                env.interns.get(name)
            )));
        };
        match self.heap.get(id) {
            HeapData::Instance(instance) => {
                if let Some(&value) = instance.fields.get(&name) {
                    return Ok(value);
                }
                // Method-reference fallback: `v.method` without a call.
                let sid = instance.struct_id;
                let strukt = &env.scopes.structs[sid.index()];
                let method = strukt
                    .methods
                    .values()
                    .copied()
                    .find(|&fid| env.scopes.functions[fid.index()].base_name == name);
                match method {
                    Some(fid) => {
                        let bound = self.heap.alloc(HeapData::BoundMethod { receiver: obj, func: fid });
                        Ok(Value::Ref(bound))
                    }
                    None => Err(RunError::unknown_variable(format!(
                        "`{}` has no field or method `{}`",
                        env.interns.get(strukt.name),
                        env.interns.get(name)
                    ))),
                }
            }
            HeapData::Wrapper(wrapper) => wrapper.fields.get(&name).copied().ok_or_else(|| {
                RunError::unknown_variable(format!("wrapper has no field `{}`", env.interns.get(name)))
            }),
            HeapData::Exception { message, payload } => {
                // Exposed for `catch` handlers.
                let text = env.interns.get(name);
                match text {
                    "message" => {
                        let message = message.clone();
                        Ok(self.make_string(env, message))
                    }
                    "value" => Ok(payload.unwrap_or(Value::Nil)),
                    _ => Err(RunError::unknown_variable(format!("exception has no field `{text}`"))),
                }
            }
            _ => Err(RunError::type_mismatch(format!(
                "{} has no fields",
                Value::Ref(id).type_name(&self.heap)
            ))),
        }
    }

    pub(super) fn store_field(
        &mut self,
        env: &mut ExecEnv<'_>,
        obj: Value,
        name: StringId,
        value: Value,
    ) -> RunResult<()> {
        let Value::Ref(id) = obj else {
            return Err(RunError::type_mismatch(format!(
                "{} has no fields",
                obj.type_name(&self.heap)
            )));
        };
        match self.heap.get_mut(id) {
            HeapData::Instance(instance) => match instance.fields.get_mut(&name) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(RunError::unknown_variable(format!(
                    "instance has no field `{}`",
                    env.interns.get(name)
                ))),
            },
            HeapData::Wrapper(wrapper) => {
                wrapper.fields.insert(name, value);
                Ok(())
            }
            _ => Err(RunError::type_mismatch("value has no fields")),
        }
    }

    pub(super) fn load_index(&mut self, env: &mut ExecEnv<'_>, obj: Value, index: Value) -> RunResult<Value> {
        let idx = index
            .as_integer()
            .ok_or_else(|| RunError::type_mismatch("index must be an integer"))?;
        if idx < 0 {
            return Err(RunError::index_out_of_range(format!("negative index {idx}")));
        }
        let idx = usize::try_from(idx).expect("non-negative index");
        if let Value::Ref(id) = obj
            && let HeapData::List(items) = self.heap.get(id)
        {
            return items
                .get(idx)
                .copied()
                .ok_or_else(|| RunError::index_out_of_range(format!("index {idx} out of range (length {})", items.len())));
        }
        if let Some(text) = string_slice(obj, &self.heap, env.interns) {
            return text
                .chars()
                .nth(idx)
                .map(Value::Char)
                .ok_or_else(|| RunError::index_out_of_range(format!("index {idx} out of range for string")));
        }
        Err(RunError::type_mismatch(format!(
            "{} is not indexable",
            obj.type_name(&self.heap)
        )))
    }

    pub(super) fn store_index(
        &mut self,
        _env: &mut ExecEnv<'_>,
        obj: Value,
        index: Value,
        value: Value,
    ) -> RunResult<()> {
        let idx = index
            .as_integer()
            .ok_or_else(|| RunError::type_mismatch("index must be an integer"))?;
        if idx < 0 {
            return Err(RunError::index_out_of_range(format!("negative index {idx}")));
        }
        let idx = usize::try_from(idx).expect("non-negative index");
        if let Value::Ref(id) = obj
            && let HeapData::List(items) = self.heap.get_mut(id)
        {
            let len = items.len();
            return match items.get_mut(idx) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(RunError::index_out_of_range(format!(
                    "index {idx} out of range (length {len})"
                ))),
            };
        }
        Err(RunError::type_mismatch("only lists support indexed assignment"))
    }

    pub(super) fn list_push(&mut self, list: Value, value: Value) -> RunResult<()> {
        if let Value::Ref(id) = list
            && let HeapData::List(items) = self.heap.get_mut(id)
        {
            items.push(value);
            return Ok(());
        }
        Err(RunError::type_mismatch("cannot append to a non-list"))
    }

    pub(super) fn new_range(&mut self, start: Value, end: Value) -> RunResult<Value> {
        let (Some(start), Some(end)) = (start.as_integer(), end.as_integer()) else {
            return Err(RunError::type_mismatch("range bounds must be integers"));
        };
        let id = self.heap.alloc(HeapData::Range { start, end });
        Ok(Value::Ref(id))
    }

    /// `NewIterator`: a non-restartable cursor over a list or range.
    pub(super) fn new_iterator(&mut self, source: Value) -> RunResult<Value> {
        let state = match source {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::List(_) => IterState::List {
                    list: id,
                    index: 0,
                    done: false,
                },
                HeapData::Range { start, end } => {
                    if start > end {
                        return Err(RunError::type_mismatch(format!(
                            "cannot iterate descending range {start}..{end}"
                        )));
                    }
                    IterState::Range {
                        current: *start,
                        end: *end,
                        done: false,
                    }
                }
                HeapData::Iter(_) => return Ok(source),
                _ => {
                    return Err(RunError::type_mismatch(format!(
                        "{} is not iterable",
                        source.type_name(&self.heap)
                    )));
                }
            },
            _ => {
                return Err(RunError::type_mismatch(format!(
                    "{} is not iterable",
                    source.type_name(&self.heap)
                )));
            }
        };
        let id = self.heap.alloc(HeapData::Iter(state));
        Ok(Value::Ref(id))
    }

    /// Advances an iterator; `None` means exhausted (and the iterator stays
    /// exhausted until re-initialized).
    pub(super) fn iterator_next(&mut self, iter: Value) -> RunResult<Option<Value>> {
        let Value::Ref(id) = iter else {
            return Err(RunError::type_mismatch("IteratorNext on a non-iterator"));
        };
        // Read list length first to keep the borrow short.
        let list_len = match self.heap.get(id) {
            HeapData::Iter(IterState::List { list, .. }) => {
                let list = *list;
                match self.heap.get(list) {
                    HeapData::List(items) => Some(items.len()),
                    _ => return Err(RunError::type_mismatch("iterator source is not a list")),
                }
            }
            HeapData::Iter(IterState::Range { .. }) => None,
            _ => return Err(RunError::type_mismatch("IteratorNext on a non-iterator")),
        };

        let HeapData::Iter(state) = self.heap.get_mut(id) else {
            unreachable!("checked above");
        };
        match state {
            IterState::List { list, index, done } => {
                let len = list_len.expect("list length read above");
                if *done || *index >= len {
                    *done = true;
                    return Ok(None);
                }
                let at = *index;
                *index += 1;
                let list = *list;
                let HeapData::List(items) = self.heap.get(list) else {
                    unreachable!("checked above");
                };
                Ok(Some(items[at]))
            }
            IterState::Range { current, end, done } => {
                if *done || *current > *end {
                    *done = true;
                    return Ok(None);
                }
                let value = *current;
                *current += 1;
                Ok(Some(
                    i32::try_from(value).map_or(Value::Long(value), Value::Int),
                ))
            }
        }
    }

    pub(super) fn bind_method(&mut self, env: &mut ExecEnv<'_>, receiver: Value, name: StringId) -> RunResult<Value> {
        if let Value::Ref(id) = receiver
            && let HeapData::Instance(instance) = self.heap.get(id)
        {
            let strukt = &env.scopes.structs[instance.struct_id.index()];
            let method = strukt
                .methods
                .values()
                .copied()
                .find(|&fid| env.scopes.functions[fid.index()].base_name == name);
            if let Some(fid) = method {
                let bound = self.heap.alloc(HeapData::BoundMethod {
                    receiver,
                    func: fid,
                });
                return Ok(Value::Ref(bound));
            }
        }
        Err(RunError::unknown_variable(format!(
            "no method `{}` to bind",
            env.interns.get(name)
        )))
    }

    /// Promotes a local slot to a shared cell for by-ref argument passing.
    pub(super) fn promote_local_to_cell(&mut self, base: usize, slot: usize) -> Value {
        let current = self.locals[base + slot];
        if let Value::Ref(id) = current
            && matches!(self.heap.get(id), HeapData::Cell(_))
        {
            return current;
        }
        let cell = Value::Ref(self.heap.alloc(HeapData::Cell(current)));
        self.locals[base + slot] = cell;
        cell
    }

    pub(super) fn promote_global_to_cell(&mut self, slot: usize) -> Value {
        let current = self.globals[slot];
        if let Value::Ref(id) = current
            && matches!(self.heap.get(id), HeapData::Cell(_))
        {
            return current;
        }
        let cell = Value::Ref(self.heap.alloc(HeapData::Cell(current)));
        self.globals[slot] = cell;
        cell
    }
}

