//! Peephole optimizer: pattern-driven rewriting over the finalized
//! instruction list.
//!
//! Each pass scans a small window, rewriting in place and marking
//! instructions for deletion; deletions are compacted and every branch target
//! re-linked before the next pass. Passes repeat to fixed point (bounded).
//!
//! A fusion window never extends across an incoming control-flow edge: only
//! the first instruction of a window may be a jump target, so compaction can
//! remap any target to the first surviving instruction at or after it.

use ahash::AHashSet;

use super::{Code, Instruction, Opcode, Operand};
use crate::value::{ArithOp, CmpOp, Value, numeric_binary};

/// Upper bound on optimize iterations; real programs converge in two or
/// three.
const MAX_PASSES: usize = 10;

/// Rewrites `code` in place and returns the old-to-new index map so callers
/// can re-link function start/end addresses.
///
/// `entry_points` are extra addresses that must survive as remappable
/// boundaries (function starts and ends).
pub(crate) fn optimize(code: &mut Code, entry_points: &[usize]) -> Vec<usize> {
    let mut total_map: Vec<usize> = (0..code.instrs.len()).collect();
    let mut entries: Vec<usize> = entry_points.to_vec();

    for _ in 0..MAX_PASSES {
        let targets = collect_targets(&code.instrs, &entries);
        let mut changed = peephole_pass(code, &targets);
        changed |= thread_jumps(&mut code.instrs);

        let (kept, pass_map) = compact(code);
        if kept < pass_map.len() {
            changed = true;
        }
        for slot in &mut total_map {
            *slot = pass_map[*slot];
        }
        for entry in &mut entries {
            *entry = pass_map[*entry];
        }

        if !changed {
            break;
        }
    }
    total_map
}

/// Marker for instructions deleted by the current pass.
fn tombstone() -> Instruction {
    // `Pop` never carries operands; a poisoned line marks the tombstone.
    let mut instr = Instruction::new(Opcode::Pop);
    instr.line = u32::MAX;
    instr
}

fn is_tombstone(instr: &Instruction) -> bool {
    instr.op == Opcode::Pop && instr.line == u32::MAX
}

fn collect_targets(instrs: &[Instruction], entries: &[usize]) -> AHashSet<usize> {
    let mut targets: AHashSet<usize> = instrs.iter().filter_map(Instruction::jump_target).collect();
    targets.extend(entries.iter().copied());
    targets
}

/// Slot of a local load in any of its forms.
fn load_slot(instr: &Instruction) -> Option<u16> {
    match instr.op {
        Opcode::LoadLocal => Some(u16::try_from(instr.lhs.as_int()).expect("local slot fits u16")),
        Opcode::LoadLocal0 => Some(0),
        Opcode::LoadLocal1 => Some(1),
        Opcode::LoadLocal2 => Some(2),
        Opcode::LoadLocal3 => Some(3),
        _ => None,
    }
}

fn store_slot(instr: &Instruction) -> Option<u16> {
    match instr.op {
        Opcode::StoreLocal => Some(u16::try_from(instr.lhs.as_int()).expect("local slot fits u16")),
        _ => None,
    }
}

fn const_of<'a>(code: &'a Code, instr: &Instruction) -> Option<Value> {
    match instr.op {
        Opcode::LoadConst => Some(code.constant(instr.lhs.as_const())),
        _ => None,
    }
}

fn arith_of(op: Opcode) -> Option<ArithOp> {
    Some(match op {
        Opcode::Add => ArithOp::Add,
        Opcode::Sub => ArithOp::Sub,
        Opcode::Mul => ArithOp::Mul,
        Opcode::Div => ArithOp::Div,
        Opcode::Mod => ArithOp::Mod,
        Opcode::Pow => ArithOp::Pow,
        _ => return None,
    })
}

fn cmp_of(op: Opcode) -> Option<CmpOp> {
    Some(match op {
        Opcode::Eq => CmpOp::Eq,
        Opcode::Neq => CmpOp::Neq,
        Opcode::Lt => CmpOp::Lt,
        Opcode::Le => CmpOp::Le,
        Opcode::Gt => CmpOp::Gt,
        Opcode::Ge => CmpOp::Ge,
        _ => return None,
    })
}

/// Constant comparison over pool immediates. Interning is total at compile
/// time, so string ids compare by identity.
fn fold_cmp(op: CmpOp, a: Value, b: Value) -> Option<bool> {
    let ordering = if a.is_number() && b.is_number() {
        match (a.as_integer(), b.as_integer()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?)?,
        }
    } else {
        match (a, b) {
            (Value::Bool(x), Value::Bool(y)) => {
                return match op {
                    CmpOp::Eq => Some(x == y),
                    CmpOp::Neq => Some(x != y),
                    _ => None,
                };
            }
            (Value::Str(x), Value::Str(y)) => {
                return match op {
                    CmpOp::Eq => Some(x == y),
                    CmpOp::Neq => Some(x != y),
                    _ => None,
                };
            }
            (Value::Char(x), Value::Char(y)) => x.cmp(&y),
            _ => return None,
        }
    };
    Some(match op {
        CmpOp::Eq => ordering.is_eq(),
        CmpOp::Neq => !ordering.is_eq(),
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Le => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::Ge => ordering.is_ge(),
    })
}

/// A load with no side effects, safe to drop when immediately popped.
fn is_pure_load(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::LoadConst
            | Opcode::LoadLocal
            | Opcode::LoadLocal0
            | Opcode::LoadLocal1
            | Opcode::LoadLocal2
            | Opcode::LoadLocal3
            | Opcode::LoadGlobal
            | Opcode::Dup
    )
}

fn peephole_pass(code: &mut Code, targets: &AHashSet<usize>) -> bool {
    let mut changed = false;
    let len = code.instrs.len();
    let mut i = 0;

    while i < len {
        if is_tombstone(&code.instrs[i]) {
            i += 1;
            continue;
        }
        let free2 = i + 1 < len && !targets.contains(&(i + 1)) && !is_tombstone(&code.instrs[i + 1]);
        let free3 = free2 && i + 2 < len && !targets.contains(&(i + 2)) && !is_tombstone(&code.instrs[i + 2]);

        // Constant folding: LoadConst a; LoadConst b; <pure binop>.
        if free3
            && let (Some(a), Some(b)) = (const_of(code, &code.instrs[i]), const_of(code, &code.instrs[i + 1]))
        {
            let third = code.instrs[i + 2].op;
            if let Some(op) = arith_of(third)
                && let Ok(folded) = numeric_binary(op, a, b)
            {
                let id = add_const(code, folded);
                code.instrs[i].op = Opcode::LoadConst;
                code.instrs[i].lhs = Operand::Const(id);
                code.instrs[i + 1] = tombstone();
                code.instrs[i + 2] = tombstone();
                changed = true;
                i += 3;
                continue;
            }
            if let Some(op) = cmp_of(third)
                && let Some(result) = fold_cmp(op, a, b)
            {
                let id = add_const(code, Value::Bool(result));
                code.instrs[i].op = Opcode::LoadConst;
                code.instrs[i].lhs = Operand::Const(id);
                code.instrs[i + 1] = tombstone();
                code.instrs[i + 2] = tombstone();
                changed = true;
                i += 3;
                continue;
            }
        }

        // EqConstBranch fusion: LoadConst c; Eq; JumpIfFalse L.
        if free3
            && let Some(c) = const_of(code, &code.instrs[i])
            && code.instrs[i + 1].op == Opcode::Eq
            && code.instrs[i + 2].op == Opcode::JumpIfFalse
        {
            let target = code.instrs[i + 2].lhs;
            let id = add_const(code, c);
            code.instrs[i].op = Opcode::EqConstBranch;
            code.instrs[i].lhs = Operand::Const(id);
            code.instrs[i].rhs = target;
            code.instrs[i + 1] = tombstone();
            code.instrs[i + 2] = tombstone();
            changed = true;
            i += 3;
            continue;
        }

        // Strength reduction on a constant right operand.
        if free2
            && let Some(c) = const_of(code, &code.instrs[i])
            && let Some(k) = c.as_integer()
        {
            let next = code.instrs[i + 1].op;
            match next {
                Opcode::Mul if k > 0 && k.count_ones() == 1 => {
                    code.instrs[i].op = Opcode::MulPow2Shift;
                    code.instrs[i].lhs = Operand::Int(i64::from(k.trailing_zeros()));
                    code.instrs[i + 1] = tombstone();
                    changed = true;
                    i += 2;
                    continue;
                }
                Opcode::Div if k > 0 && k.count_ones() == 1 => {
                    let id = add_const(code, Value::Int(i32::try_from(k.trailing_zeros()).expect("shift fits i32")));
                    code.instrs[i].lhs = Operand::Const(id);
                    code.instrs[i + 1].op = Opcode::Shr;
                    changed = true;
                    i += 2;
                    continue;
                }
                Opcode::Mod if k > 0 && k.count_ones() == 1 => {
                    let mask = k - 1;
                    let id = add_const(code, Value::Int(i32::try_from(mask).unwrap_or(i32::MAX)));
                    code.instrs[i].lhs = Operand::Const(id);
                    code.instrs[i + 1].op = Opcode::BitAnd;
                    changed = true;
                    i += 2;
                    continue;
                }
                Opcode::Pow if k == 2 => {
                    code.instrs[i].op = Opcode::Dup;
                    code.instrs[i].lhs = Operand::None;
                    code.instrs[i + 1].op = Opcode::Mul;
                    changed = true;
                    i += 2;
                    continue;
                }
                // `AddIntConst` mirrors `Add` exactly (including string
                // concatenation), so the fusion is always safe. `Sub` is
                // left alone: folding `x - k` into an addition would turn a
                // type error on string operands into a concatenation.
                Opcode::Add => {
                    code.instrs[i].op = Opcode::AddIntConst;
                    code.instrs[i].lhs = Operand::Int(k);
                    code.instrs[i + 1] = tombstone();
                    changed = true;
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }

        // Compare-then-branch fusion.
        if free2
            && let Some(cmp) = cmp_of(code.instrs[i].op)
        {
            match code.instrs[i + 1].op {
                Opcode::JumpIfFalse => {
                    let target = code.instrs[i + 1].lhs;
                    code.instrs[i].op = Opcode::BranchCmp;
                    code.instrs[i].lhs = Operand::Int(cmp.negate().code());
                    code.instrs[i].rhs = target;
                    code.instrs[i + 1] = tombstone();
                    changed = true;
                    i += 2;
                    continue;
                }
                Opcode::JumpIfTrue => {
                    let target = code.instrs[i + 1].lhs;
                    code.instrs[i].op = Opcode::BranchCmp;
                    code.instrs[i].lhs = Operand::Int(cmp.code());
                    code.instrs[i].rhs = target;
                    code.instrs[i + 1] = tombstone();
                    changed = true;
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }

        // IncLocal fusion: LoadLocal x; AddIntConst 1; StoreLocal x.
        if free3
            && let Some(slot) = load_slot(&code.instrs[i])
            && code.instrs[i + 1].op == Opcode::AddIntConst
            && code.instrs[i + 1].lhs.as_int() == 1
            && store_slot(&code.instrs[i + 2]) == Some(slot)
        {
            code.instrs[i].op = Opcode::IncLocal;
            code.instrs[i].lhs = Operand::Int(i64::from(slot));
            code.instrs[i + 1] = tombstone();
            code.instrs[i + 2] = tombstone();
            changed = true;
            i += 3;
            continue;
        }

        // Redundant store/load: StoreLocal x; LoadLocal x -> Dup; StoreLocal x.
        if free2
            && let Some(slot) = store_slot(&code.instrs[i])
            && load_slot(&code.instrs[i + 1]) == Some(slot)
        {
            code.instrs[i].op = Opcode::Dup;
            code.instrs[i].lhs = Operand::None;
            code.instrs[i + 1].op = Opcode::StoreLocal;
            code.instrs[i + 1].lhs = Operand::Int(i64::from(slot));
            changed = true;
            i += 2;
            continue;
        }

        // Mirrored moves: Move a<-b; Move b<-a, second is redundant.
        if free2
            && code.instrs[i].op == Opcode::Move
            && code.instrs[i + 1].op == Opcode::Move
            && code.instrs[i].lhs == code.instrs[i + 1].rhs
            && code.instrs[i].rhs == code.instrs[i + 1].lhs
        {
            code.instrs[i + 1] = tombstone();
            changed = true;
            i += 2;
            continue;
        }

        // Pure load immediately popped.
        if free2 && is_pure_load(code.instrs[i].op) && code.instrs[i + 1].op == Opcode::Pop {
            code.instrs[i] = tombstone();
            code.instrs[i + 1] = tombstone();
            changed = true;
            i += 2;
            continue;
        }

        // Dead store: a store whose slot is overwritten before any read,
        // within a straight-line window.
        if let Some(slot) = store_slot(&code.instrs[i])
            && dead_store(&code.instrs, targets, i, slot)
        {
            code.instrs[i].op = Opcode::Pop;
            code.instrs[i].lhs = Operand::None;
            changed = true;
            i += 1;
            continue;
        }

        // Call in tail position.
        if free2 && code.instrs[i].op == Opcode::Call && code.instrs[i + 1].op == Opcode::Return {
            code.instrs[i].op = Opcode::TailCall;
            changed = true;
            i += 2;
            continue;
        }

        // Short-form local accessors.
        if code.instrs[i].op == Opcode::LoadLocal {
            let slot = code.instrs[i].lhs.as_int();
            let short = match slot {
                0 => Some(Opcode::LoadLocal0),
                1 => Some(Opcode::LoadLocal1),
                2 => Some(Opcode::LoadLocal2),
                3 => Some(Opcode::LoadLocal3),
                _ => None,
            };
            if let Some(op) = short {
                code.instrs[i].op = op;
                code.instrs[i].lhs = Operand::None;
                changed = true;
            }
        }

        i += 1;
    }
    changed
}

/// True when the value stored at `index` into `slot` is overwritten before
/// any possible read. The scan is strictly straight-line: any branch, call,
/// incoming edge, or by-ref promotion aborts it.
fn dead_store(instrs: &[Instruction], targets: &AHashSet<usize>, index: usize, slot: u16) -> bool {
    for (offset, instr) in instrs.iter().enumerate().skip(index + 1) {
        if targets.contains(&offset) || is_tombstone(instr) {
            return false;
        }
        if load_slot(instr) == Some(slot) {
            return false;
        }
        if store_slot(instr) == Some(slot) {
            return true;
        }
        match instr.op {
            // Reads the slot implicitly.
            Opcode::IncLocal | Opcode::Move | Opcode::IteratorNext | Opcode::LoadRefLocal | Opcode::NilSlot => {
                return false;
            }
            // Control flow or calls end the window.
            Opcode::Jump
            | Opcode::JumpIfFalse
            | Opcode::JumpIfTrue
            | Opcode::JumpIfNil
            | Opcode::JumpIfNotNil
            | Opcode::BranchCmp
            | Opcode::EqConstBranch
            | Opcode::Call
            | Opcode::TailCall
            | Opcode::CallIntrinsic
            | Opcode::CallMethod
            | Opcode::Return
            | Opcode::LeaveFrame
            | Opcode::Throw
            | Opcode::TryEnter
            | Opcode::TryLeave
            | Opcode::EnterFrame => return false,
            _ => {}
        }
    }
    false
}

/// Jump threading: a branch whose target is an unconditional `Jump` follows
/// the chain (bounded against cycles). Also deletes jumps to the next
/// instruction.
fn thread_jumps(instrs: &mut [Instruction]) -> bool {
    let mut changed = false;
    for i in 0..instrs.len() {
        let Some(mut target) = instrs[i].jump_target() else {
            continue;
        };
        let mut hops = 0;
        while hops < 16 && target < instrs.len() && instrs[target].op == Opcode::Jump {
            let next = instrs[target].lhs.as_usize();
            if next == target {
                break;
            }
            target = next;
            hops += 1;
        }
        if hops > 0 {
            instrs[i].set_jump_target(target);
            changed = true;
        }
        if instrs[i].op == Opcode::Jump && instrs[i].jump_target() == Some(i + 1) {
            instrs[i] = tombstone();
            changed = true;
        }
    }
    changed
}

/// Drops tombstones and re-links every branch target. Returns the surviving
/// instruction count and the old-to-new index map (deleted instructions map
/// to the next survivor).
fn compact(code: &mut Code) -> (usize, Vec<usize>) {
    let old = std::mem::take(&mut code.instrs);
    let mut map = vec![0usize; old.len() + 1];
    let mut kept = Vec::with_capacity(old.len());

    for (index, instr) in old.into_iter().enumerate() {
        map[index] = kept.len();
        if !is_tombstone(&instr) {
            kept.push(instr);
        }
    }
    // A deleted instruction's entry already forwards to the next survivor;
    // the sentinel slot handles jumps recorded at one-past-the-end.
    let last = map.len() - 1;
    map[last] = kept.len();

    for instr in &mut kept {
        if let Some(target) = instr.jump_target() {
            instr.set_jump_target(map[target.min(map.len() - 1)]);
        }
    }

    let count = kept.len();
    code.instrs = kept;
    (count, map)
}

fn add_const(code: &mut Code, value: Value) -> u32 {
    // Linear probe is fine here: pools are small and folding is rare.
    for (index, &existing) in code.consts.iter().enumerate() {
        if values_identical(existing, value) {
            return u32::try_from(index).expect("constant pool fits u32");
        }
    }
    let id = u32::try_from(code.consts.len()).expect("constant pool fits u32");
    code.consts.push(value);
    id
}

/// Bit-level identity for pool constants (floats by bit pattern).
fn values_identical(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        (Value::Double(x), Value::Double(y)) => x.to_bits() == y.to_bits(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::CodeBuilder;

    fn build(f: impl FnOnce(&mut CodeBuilder)) -> Code {
        let mut builder = CodeBuilder::new();
        f(&mut builder);
        Code {
            instrs: builder.instrs,
            consts: builder.consts,
        }
    }

    fn ops(code: &Code) -> Vec<Opcode> {
        code.instrs.iter().map(|i| i.op).collect()
    }

    #[test]
    fn folds_constants() {
        let mut code = build(|b| {
            b.emit_const(Value::Int(10));
            b.emit_const(Value::Int(2));
            b.emit(Opcode::Mod);
            b.emit(Opcode::Return);
        });
        optimize(&mut code, &[]);
        assert_eq!(ops(&code), vec![Opcode::LoadConst, Opcode::Return]);
        assert_eq!(code.constant(code.instrs[0].lhs.as_const()), Value::Int(0));
    }

    #[test]
    fn fuses_compare_and_branch() {
        let mut code = build(|b| {
            b.emit_load_local(0);
            b.emit_load_local(1);
            b.emit(Opcode::Lt);
            let jump = b.emit_jump(Opcode::JumpIfFalse);
            b.emit(Opcode::Pop);
            b.patch_jump(jump);
            b.emit(Opcode::Return);
        });
        optimize(&mut code, &[]);
        let branch = code.instrs.iter().find(|i| i.op == Opcode::BranchCmp).expect("fused branch");
        assert_eq!(CmpOp::from_code(branch.lhs.as_int()), CmpOp::Ge);
    }

    #[test]
    fn strength_reduces_mul_by_pow2() {
        let mut code = build(|b| {
            b.emit_load_local(0);
            b.emit_const(Value::Int(8));
            b.emit(Opcode::Mul);
            b.emit(Opcode::Return);
        });
        optimize(&mut code, &[]);
        let shift = code.instrs.iter().find(|i| i.op == Opcode::MulPow2Shift).expect("shift");
        assert_eq!(shift.lhs.as_int(), 3);
    }

    #[test]
    fn rewrites_pow_two_as_self_multiply() {
        let mut code = build(|b| {
            b.emit_load_local(0);
            b.emit_const(Value::Int(2));
            b.emit(Opcode::Pow);
            b.emit(Opcode::Return);
        });
        optimize(&mut code, &[]);
        assert_eq!(ops(&code), vec![Opcode::LoadLocal0, Opcode::Dup, Opcode::Mul, Opcode::Return]);
    }

    #[test]
    fn threads_jump_chains_and_relinks() {
        let mut code = build(|b| {
            let first = b.emit_jump(Opcode::Jump); // -> jump at 1
            let second = b.emit_jump(Opcode::Jump); // -> return
            b.emit(Opcode::Return);
            b.patch_jump_to(first, 1);
            b.patch_jump_to(second, 2);
        });
        optimize(&mut code, &[]);
        // Both jumps collapse onto the return.
        assert_eq!(code.instrs[0].jump_target(), Some(code.instrs.len() - 1));
    }

    #[test]
    fn does_not_fuse_across_jump_targets() {
        let mut code = build(|b| {
            let jump = b.emit_jump(Opcode::Jump);
            b.emit_const(Value::Int(1));
            b.patch_jump(jump); // target lands on the second LoadConst
            b.emit_const(Value::Int(2));
            b.emit(Opcode::Add);
            b.emit(Opcode::Return);
        });
        optimize(&mut code, &[]);
        // The Add survives: folding would have swallowed a jump target.
        assert!(ops(&code).contains(&Opcode::Add));
    }

    #[test]
    fn fuses_inc_local() {
        let mut code = build(|b| {
            b.emit_load_local(2);
            b.emit_const(Value::Int(1));
            b.emit(Opcode::Add);
            b.emit_store_local(2);
            b.emit(Opcode::Return);
        });
        optimize(&mut code, &[]);
        assert_eq!(ops(&code), vec![Opcode::IncLocal, Opcode::Return]);
        assert_eq!(code.instrs[0].lhs.as_int(), 2);
    }

    #[test]
    fn rewrites_tail_calls() {
        let mut code = build(|b| {
            let name = crate::intern::StringId::from_index(0);
            b.emit2(Opcode::Call, Operand::Str(name), Operand::Int(0));
            b.emit(Opcode::Return);
        });
        optimize(&mut code, &[]);
        assert_eq!(ops(&code), vec![Opcode::TailCall, Opcode::Return]);
    }

    #[test]
    fn entry_points_are_remapped() {
        let mut code = build(|b| {
            b.emit_const(Value::Int(1));
            b.emit(Opcode::Pop);
            b.emit1(Opcode::EnterFrame, Operand::Int(0));
            b.emit_const(Value::Nil);
            b.emit(Opcode::Return);
        });
        let map = optimize(&mut code, &[2]);
        // The dead load/pop pair before the function start is deleted.
        assert_eq!(map[2], 0);
        assert_eq!(code.instrs[map[2]].op, Opcode::EnterFrame);
    }
}
