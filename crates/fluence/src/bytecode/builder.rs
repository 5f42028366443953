//! Builder for emitting instructions during the single parse pass.
//!
//! `CodeBuilder` appends to the growable instruction vector, stamps each
//! instruction with the current source location, manages forward jumps with
//! patch labels, and dedupes the literal constant pool.

use ahash::AHashMap;

use super::{Instruction, Opcode, Operand};
use crate::value::Value;

/// Label for a forward jump that needs patching.
///
/// Stores the index of the emitted jump instruction. Pass it to
/// [`CodeBuilder::patch_jump`] once the target location is known.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JumpLabel(pub usize);

/// Hashable identity of a pool constant (floats by bit pattern).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    Nil,
    Bool(bool),
    Int(i32),
    Long(i64),
    F32(u32),
    F64(u64),
    Char(char),
    Str(crate::intern::StringId),
}

impl ConstKey {
    fn of(value: Value) -> Self {
        match value {
            Value::Nil => Self::Nil,
            Value::Bool(b) => Self::Bool(b),
            Value::Int(v) => Self::Int(v),
            Value::Long(v) => Self::Long(v),
            Value::Float(v) => Self::F32(v.to_bits()),
            Value::Double(v) => Self::F64(v.to_bits()),
            Value::Char(c) => Self::Char(c),
            Value::Str(id) => Self::Str(id),
            Value::Ref(_) => unreachable!("heap values cannot enter the constant pool"),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CodeBuilder {
    pub instrs: Vec<Instruction>,
    pub consts: Vec<Value>,
    const_ids: AHashMap<ConstKey, u32>,
    line: u32,
    column: u32,
    file_index: u16,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source location stamped onto subsequently emitted
    /// instructions.
    pub fn set_location(&mut self, line: u32, column: u32, file_index: u16) {
        self.line = line;
        self.column = column;
        self.file_index = file_index;
    }

    /// Index of the next instruction to be emitted.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.instrs.len()
    }

    fn push(&mut self, mut instr: Instruction) -> usize {
        instr.line = self.line;
        instr.column = self.column;
        instr.file_index = self.file_index;
        let index = self.instrs.len();
        self.instrs.push(instr);
        index
    }

    /// Emits a no-operand instruction, returning its index.
    pub fn emit(&mut self, op: Opcode) -> usize {
        self.push(Instruction::new(op))
    }

    pub fn emit1(&mut self, op: Opcode, lhs: Operand) -> usize {
        let mut instr = Instruction::new(op);
        instr.lhs = lhs;
        self.push(instr)
    }

    pub fn emit2(&mut self, op: Opcode, lhs: Operand, rhs: Operand) -> usize {
        let mut instr = Instruction::new(op);
        instr.lhs = lhs;
        instr.rhs = rhs;
        self.push(instr)
    }

    pub fn emit3(&mut self, op: Opcode, lhs: Operand, rhs: Operand, rhs2: Operand) -> usize {
        let mut instr = Instruction::new(op);
        instr.lhs = lhs;
        instr.rhs = rhs;
        instr.rhs2 = rhs2;
        self.push(instr)
    }

    /// Emits `LoadConst` for a pooled value.
    pub fn emit_const(&mut self, value: Value) -> usize {
        let id = self.add_const(value);
        self.emit1(Opcode::LoadConst, Operand::Const(id))
    }

    /// Emits a local load, preferring the short-form opcodes for slots 0-3.
    pub fn emit_load_local(&mut self, slot: u16) -> usize {
        match slot {
            0 => self.emit(Opcode::LoadLocal0),
            1 => self.emit(Opcode::LoadLocal1),
            2 => self.emit(Opcode::LoadLocal2),
            3 => self.emit(Opcode::LoadLocal3),
            _ => self.emit1(Opcode::LoadLocal, Operand::Int(i64::from(slot))),
        }
    }

    pub fn emit_store_local(&mut self, slot: u16) -> usize {
        self.emit1(Opcode::StoreLocal, Operand::Int(i64::from(slot)))
    }

    /// Emits a forward jump with a placeholder target.
    #[must_use]
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        let index = self.emit1(op, Operand::Int(0));
        JumpLabel(index)
    }

    /// Emits a fused compare-and-branch with a placeholder target.
    #[must_use]
    pub fn emit_branch_cmp(&mut self, cmp_code: i64) -> JumpLabel {
        let index = self.emit2(Opcode::BranchCmp, Operand::Int(cmp_code), Operand::Int(0));
        JumpLabel(index)
    }

    /// Patches a forward jump to land on the next emitted instruction.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.instrs.len();
        self.instrs[label.0].set_jump_target(target);
    }

    /// Patches a forward jump to an explicit target.
    pub fn patch_jump_to(&mut self, label: JumpLabel, target: usize) {
        self.instrs[label.0].set_jump_target(target);
    }

    /// Emits a backward jump to a known target.
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize) -> usize {
        self.emit1(op, Operand::Int(i64::try_from(target).expect("jump target fits i64")))
    }

    /// Adds a constant to the pool, returning its index. Identical constants
    /// share one slot (floats compare by bit pattern).
    pub fn add_const(&mut self, value: Value) -> u32 {
        let key = ConstKey::of(value);
        if let Some(&id) = self.const_ids.get(&key) {
            return id;
        }
        let id = u32::try_from(self.consts.len()).expect("constant pool exceeds u32");
        self.consts.push(value);
        self.const_ids.insert(key, id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_tracks_location() {
        let mut builder = CodeBuilder::new();
        builder.set_location(3, 7, 1);
        let index = builder.emit(Opcode::Add);
        assert_eq!(builder.instrs[index].line, 3);
        assert_eq!(builder.instrs[index].column, 7);
        assert_eq!(builder.instrs[index].file_index, 1);
    }

    #[test]
    fn forward_jump_patches_to_next_instruction() {
        let mut builder = CodeBuilder::new();
        let jump = builder.emit_jump(Opcode::JumpIfFalse);
        builder.emit(Opcode::Pop);
        builder.patch_jump(jump);
        builder.emit(Opcode::Return);
        assert_eq!(builder.instrs[jump.0].jump_target(), Some(2));
    }

    #[test]
    fn constants_dedupe() {
        let mut builder = CodeBuilder::new();
        let a = builder.add_const(Value::Int(42));
        let b = builder.add_const(Value::Int(42));
        let c = builder.add_const(Value::Double(42.0));
        assert_eq!(a, b);
        assert_ne!(a, c);
        // -0.0 and 0.0 are distinct constants (bit-pattern identity).
        let zero = builder.add_const(Value::Double(0.0));
        let neg_zero = builder.add_const(Value::Double(-0.0));
        assert_ne!(zero, neg_zero);
    }

    #[test]
    fn short_form_locals() {
        let mut builder = CodeBuilder::new();
        builder.emit_load_local(0);
        builder.emit_load_local(2);
        builder.emit_load_local(9);
        assert_eq!(builder.instrs[0].op, Opcode::LoadLocal0);
        assert_eq!(builder.instrs[1].op, Opcode::LoadLocal2);
        assert_eq!(builder.instrs[2].op, Opcode::LoadLocal);
    }
}
