//! The bytecode virtual machine.
//!
//! A dispatch-loop interpreter over the fixed-width instruction vector. The
//! operand stack is one contiguous array shared by every frame; locals live
//! in a second contiguous array partitioned per frame by its `EnterFrame`
//! register count. The hot loop keeps a copy of the current frame and syncs
//! it back whenever the frame stack changes (calls, returns, unwinding).
//!
//! Interrupt checks (host stop flag, execution deadline) happen at every
//! branch and call, plus every `SectionGlobal` marker; the deadline samples
//! the monotonic clock only once per check window to keep the loop tight.

mod call;
mod ops;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::bytecode::{Code, Opcode};
use crate::diagnostic::Diagnostic;
use crate::error::{ErrorKind, RunError, RunResult};
use crate::heap::{Heap, HeapData};
use crate::intern::Interns;
use crate::io::{LineReader, PrintWriter};
use crate::parser::SourceFile;
use crate::scope::{FunctionId, IntrinsicId, Scopes};
use crate::stdlib::Intrinsic;
use crate::tracer::VmTracer;
use crate::value::{ArithOp, CmpOp, Value, compare_values, numeric_binary, values_equal};

/// Everything the machine borrows from the compiled program and host for one
/// run slice.
pub(crate) struct ExecEnv<'a> {
    pub code: &'a Code,
    pub scopes: &'a Scopes,
    pub interns: &'a mut Interns,
    pub intrinsics: &'a [Intrinsic],
    pub sources: &'a [SourceFile],
    pub out: &'a mut dyn PrintWriter,
    pub input: &'a mut dyn LineReader,
    pub tracer: &'a mut dyn VmTracer,
}

/// VM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum VmStatus {
    Ready,
    Running,
    /// Paused by a `step(n)` budget; state remains valid.
    Suspended,
    Completed,
    Faulted,
    Stopped,
}

/// One call-stack record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    pub ip: usize,
    pub stack_base: usize,
    pub locals_base: usize,
    pub func: FunctionId,
}

/// An active `try` region.
#[derive(Debug, Clone, Copy)]
struct TryHandler {
    frame_index: usize,
    handler: usize,
    stack_depth: usize,
}

/// Call-site inline cache entry, invalidated by bumping the machine's
/// version on intrinsic registration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InlineCache {
    pub key: crate::intern::StringId,
    pub target: CacheTarget,
    pub version: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum CacheTarget {
    Func(FunctionId),
    Intrinsic(IntrinsicId),
}

/// Call-stack depth limit.
const MAX_FRAMES: usize = 1000;
/// Deadline sampling interval (interrupt checks between clock reads).
const TIMEOUT_SAMPLE_MASK: u32 = 1023;

pub(crate) struct Machine {
    pub heap: Heap,
    pub globals: Vec<Value>,
    pub stack: Vec<Value>,
    pub locals: Vec<Value>,
    pub frames: Vec<Frame>,
    pub status: VmStatus,
    stop_flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
    try_stack: Vec<TryHandler>,
    /// Call-site caches keyed by instruction index.
    caches: AHashMap<usize, InlineCache>,
    pub cache_version: u32,
    /// Arguments in flight between a call and its `EnterFrame`.
    pending_args: SmallVec<[Value; 8]>,
    check_counter: u32,
    /// Message recorded by an intrinsic signalling a recoverable error.
    pub intrinsic_message: Option<String>,
    entry: FunctionId,
}

impl Machine {
    pub fn new(entry: FunctionId, global_count: u32, stop_flag: Arc<AtomicBool>) -> Self {
        Self {
            heap: Heap::new(),
            globals: vec![Value::Nil; global_count as usize],
            stack: Vec::with_capacity(256),
            locals: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            status: VmStatus::Ready,
            stop_flag,
            deadline: None,
            try_stack: Vec::new(),
            caches: AHashMap::new(),
            cache_version: 0,
            pending_args: SmallVec::new(),
            check_counter: 0,
            intrinsic_message: None,
            entry,
        }
    }

    pub fn status(&self) -> VmStatus {
        self.status
    }

    /// Invalidate every inline cache (intrinsic registration).
    pub fn bump_cache_version(&mut self) {
        self.cache_version = self.cache_version.wrapping_add(1);
    }

    #[inline]
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    #[inline]
    fn peek_top(&self) -> Value {
        *self.stack.last().expect("operand stack underflow")
    }

    /// Reads a local slot, dereferencing a by-ref cell.
    #[inline]
    fn read_slot(&self, base: usize, slot: usize) -> Value {
        let value = self.locals[base + slot];
        if let Value::Ref(id) = value
            && let HeapData::Cell(inner) = self.heap.get(id)
        {
            return *inner;
        }
        value
    }

    /// Writes a local slot, writing through a by-ref cell.
    #[inline]
    fn write_slot(&mut self, base: usize, slot: usize, value: Value) {
        let current = self.locals[base + slot];
        if let Value::Ref(id) = current
            && matches!(self.heap.get(id), HeapData::Cell(_))
        {
            *self.heap.get_mut(id) = HeapData::Cell(value);
            return;
        }
        self.locals[base + slot] = value;
    }

    fn read_global(&self, slot: usize) -> Value {
        let value = self.globals[slot];
        if let Value::Ref(id) = value
            && let HeapData::Cell(inner) = self.heap.get(id)
        {
            return *inner;
        }
        value
    }

    fn write_global(&mut self, slot: usize, value: Value) {
        let current = self.globals[slot];
        if let Value::Ref(id) = current
            && matches!(self.heap.get(id), HeapData::Cell(_))
        {
            *self.heap.get_mut(id) = HeapData::Cell(value);
            return;
        }
        self.globals[slot] = value;
    }

    /// Stop/timeout check, called at every branch and call.
    #[inline]
    fn check_interrupt(&mut self) -> RunResult<()> {
        if self.stop_flag.load(Ordering::Relaxed) {
            return Err(RunError::new(ErrorKind::Stopped, "execution stopped by host"));
        }
        self.check_counter = self.check_counter.wrapping_add(1);
        if self.check_counter & TIMEOUT_SAMPLE_MASK == 0 {
            self.check_deadline()?;
        }
        Ok(())
    }

    fn check_deadline(&self) -> RunResult<()> {
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(RunError::new(ErrorKind::Timeout, "execution deadline expired"));
        }
        Ok(())
    }

    /// Mark-and-sweep over every root the VM holds.
    fn collect_garbage(&mut self) {
        let roots = self
            .globals
            .iter()
            .chain(self.stack.iter())
            .chain(self.locals.iter())
            .chain(self.pending_args.iter())
            .copied()
            .collect::<Vec<_>>();
        self.heap.collect(roots);
    }

    /// Runs until completion, fault, stop, or an exhausted instruction
    /// budget (`Suspended`). Returns the formatted diagnostic on fault.
    pub fn run(
        &mut self,
        env: &mut ExecEnv<'_>,
        budget: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<VmStatus, Box<Diagnostic>> {
        match self.status {
            VmStatus::Ready => {
                let decl = &env.scopes.functions[self.entry.index()];
                self.frames.push(Frame {
                    ip: decl.start,
                    stack_base: 0,
                    locals_base: 0,
                    func: self.entry,
                });
                self.deadline = timeout.map(|t| Instant::now() + t);
                self.status = VmStatus::Running;
            }
            VmStatus::Suspended => self.status = VmStatus::Running,
            VmStatus::Running | VmStatus::Completed | VmStatus::Faulted | VmStatus::Stopped => {
                return Ok(self.status);
            }
        }

        let mut executed = 0usize;
        let mut frame = *self.frames.last().expect("entry frame");
        loop {
            if let Some(max) = budget
                && executed >= max
            {
                self.frames.last_mut().expect("frame").ip = frame.ip;
                self.status = VmStatus::Suspended;
                return Ok(self.status);
            }
            executed += 1;

            if self.heap.wants_collect() {
                self.collect_garbage();
            }

            let ip = frame.ip;
            let instr = env.code.instrs[ip];
            frame.ip += 1;
            env.tracer
                .on_instruction(ip, instr.op, self.stack.len() - frame.stack_base, self.frames.len());

            let step = self.dispatch(env, &mut frame, ip, instr);
            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished) => {
                    self.status = VmStatus::Completed;
                    return Ok(self.status);
                }
                Err(err) => {
                    if matches!(err.kind, ErrorKind::Stopped | ErrorKind::Timeout) {
                        self.frames.last_mut().expect("frame").ip = frame.ip;
                        self.status = VmStatus::Stopped;
                        return Err(Box::new(self.build_diagnostic(env, &err, ip)));
                    }
                    env.tracer.on_throw(&err.message);
                    match self.unwind(env, &err, &mut frame) {
                        Ok(()) => {}
                        Err(diag) => {
                            self.status = VmStatus::Faulted;
                            return Err(Box::new(diag));
                        }
                    }
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        env: &mut ExecEnv<'_>,
        frame: &mut Frame,
        ip: usize,
        instr: crate::bytecode::Instruction,
    ) -> RunResult<Flow> {
        match instr.op {
            Opcode::LoadConst => {
                self.push(env.code.constant(instr.lhs.as_const()));
            }
            Opcode::LoadLocal => {
                let value = self.read_slot(frame.locals_base, instr.lhs.as_usize());
                self.push(value);
            }
            Opcode::LoadLocal0 => {
                let value = self.read_slot(frame.locals_base, 0);
                self.push(value);
            }
            Opcode::LoadLocal1 => {
                let value = self.read_slot(frame.locals_base, 1);
                self.push(value);
            }
            Opcode::LoadLocal2 => {
                let value = self.read_slot(frame.locals_base, 2);
                self.push(value);
            }
            Opcode::LoadLocal3 => {
                let value = self.read_slot(frame.locals_base, 3);
                self.push(value);
            }
            Opcode::StoreLocal => {
                let value = self.pop();
                self.write_slot(frame.locals_base, instr.lhs.as_usize(), value);
            }
            Opcode::LoadGlobal => {
                let value = self.read_global(instr.lhs.as_usize());
                self.push(value);
            }
            Opcode::StoreGlobal => {
                let value = self.pop();
                self.write_global(instr.lhs.as_usize(), value);
            }
            Opcode::LoadGlobalNamed => {
                let value = self.load_global_named(env, frame, instr.lhs.as_str())?;
                self.push(value);
            }
            Opcode::LoadField => {
                let obj = self.pop();
                let value = self.load_field(env, obj, instr.lhs.as_str())?;
                self.push(value);
            }
            Opcode::StoreField => {
                let value = self.pop();
                let obj = self.pop();
                self.store_field(env, obj, instr.lhs.as_str(), value)?;
            }
            Opcode::LoadIndex => {
                let index = self.pop();
                let obj = self.pop();
                let value = self.load_index(env, obj, index)?;
                self.push(value);
            }
            Opcode::StoreIndex => {
                let value = self.pop();
                let index = self.pop();
                let obj = self.pop();
                self.store_index(env, obj, index, value)?;
            }
            Opcode::Move => {
                let value = self.read_slot(frame.locals_base, instr.rhs.as_usize());
                self.write_slot(frame.locals_base, instr.lhs.as_usize(), value);
            }
            Opcode::NilSlot => {
                self.write_slot(frame.locals_base, instr.lhs.as_usize(), Value::Nil);
            }
            Opcode::LoadRefLocal => {
                let cell = self.promote_local_to_cell(frame.locals_base, instr.lhs.as_usize());
                self.push(cell);
            }
            Opcode::LoadRefGlobal => {
                let cell = self.promote_global_to_cell(instr.lhs.as_usize());
                self.push(cell);
            }
            Opcode::Pop => {
                self.pop();
            }
            Opcode::Dup => {
                let top = self.peek_top();
                self.push(top);
            }

            Opcode::Add => {
                let b = self.pop();
                let a = self.pop();
                let value = self.add_values(env, a, b)?;
                self.push(value);
            }
            Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Pow => {
                let b = self.pop();
                let a = self.pop();
                let op = match instr.op {
                    Opcode::Sub => ArithOp::Sub,
                    Opcode::Mul => ArithOp::Mul,
                    Opcode::Div => ArithOp::Div,
                    Opcode::Mod => ArithOp::Mod,
                    _ => ArithOp::Pow,
                };
                self.push(numeric_binary(op, a, b)?);
            }
            Opcode::Neg => {
                let a = self.pop();
                self.push(ops::negate(a)?);
            }
            Opcode::Inc => {
                let a = self.pop();
                self.push(numeric_binary(ArithOp::Add, a, Value::Int(1))?);
            }
            Opcode::Dec => {
                let a = self.pop();
                self.push(numeric_binary(ArithOp::Sub, a, Value::Int(1))?);
            }

            Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor | Opcode::Shl | Opcode::Shr => {
                let b = self.pop();
                let a = self.pop();
                self.push(ops::bitwise(instr.op, a, b)?);
            }
            Opcode::BitNot => {
                let a = self.pop();
                self.push(ops::bit_not(a)?);
            }

            Opcode::Eq | Opcode::Neq => {
                let b = self.pop();
                let a = self.pop();
                let equal = values_equal(a, b, &self.heap, env.interns);
                self.push(Value::Bool(if instr.op == Opcode::Eq { equal } else { !equal }));
            }
            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                let b = self.pop();
                let a = self.pop();
                let ordering = compare_values(a, b, &self.heap, env.interns).ok_or_else(|| {
                    RunError::type_mismatch(format!(
                        "cannot order {} and {}",
                        a.type_name(&self.heap),
                        b.type_name(&self.heap)
                    ))
                })?;
                let result = match instr.op {
                    Opcode::Lt => ordering.is_lt(),
                    Opcode::Le => ordering.is_le(),
                    Opcode::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                };
                self.push(Value::Bool(result));
            }

            Opcode::And => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a.is_truthy() && b.is_truthy()));
            }
            Opcode::Or => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a.is_truthy() || b.is_truthy()));
            }
            Opcode::Not => {
                let a = self.pop();
                self.push(Value::Bool(!a.is_truthy()));
            }
            Opcode::Truthy => {
                let a = self.pop();
                self.push(Value::Bool(a.is_truthy()));
            }

            Opcode::Jump => {
                self.check_interrupt()?;
                frame.ip = instr.lhs.as_usize();
            }
            Opcode::JumpIfFalse => {
                self.check_interrupt()?;
                if !self.pop().is_truthy() {
                    frame.ip = instr.lhs.as_usize();
                }
            }
            Opcode::JumpIfTrue => {
                self.check_interrupt()?;
                if self.pop().is_truthy() {
                    frame.ip = instr.lhs.as_usize();
                }
            }
            Opcode::JumpIfNil => {
                self.check_interrupt()?;
                if self.pop().is_nil() {
                    frame.ip = instr.lhs.as_usize();
                }
            }
            Opcode::JumpIfNotNil => {
                self.check_interrupt()?;
                if !self.pop().is_nil() {
                    frame.ip = instr.lhs.as_usize();
                }
            }
            Opcode::BranchCmp => {
                self.check_interrupt()?;
                let b = self.pop();
                let a = self.pop();
                if self.cmp_holds(env, CmpOp::from_code(instr.lhs.as_int()), a, b)? {
                    frame.ip = instr.rhs.as_usize();
                }
            }
            Opcode::EqConstBranch => {
                self.check_interrupt()?;
                let a = self.pop();
                let c = env.code.constant(instr.lhs.as_const());
                if !values_equal(a, c, &self.heap, env.interns) {
                    frame.ip = instr.rhs.as_usize();
                }
            }

            Opcode::Call | Opcode::TailCall => {
                self.check_interrupt()?;
                self.op_call(env, frame, ip, &instr, instr.op == Opcode::TailCall)?;
            }
            Opcode::CallIntrinsic => {
                self.check_interrupt()?;
                let iid = IntrinsicId::new(instr.lhs.as_usize());
                let argc = instr.rhs.as_usize();
                self.invoke_intrinsic(env, iid, argc)?;
            }
            Opcode::CallMethod => {
                self.check_interrupt()?;
                self.op_call_method(env, frame, &instr)?;
            }
            Opcode::Return => {
                let result = self.pop();
                let finished = self.pop_frame(frame);
                if finished {
                    return Ok(Flow::Finished);
                }
                self.push(result);
                env.tracer.on_return(self.frames.len());
            }
            Opcode::EnterFrame => {
                let registers = instr.lhs.as_usize();
                self.locals.resize(frame.locals_base + registers, Value::Nil);
                let args = std::mem::take(&mut self.pending_args);
                for (slot, value) in args.into_iter().enumerate() {
                    self.locals[frame.locals_base + slot] = value;
                }
            }
            Opcode::LeaveFrame => {
                let finished = self.pop_frame(frame);
                if finished {
                    return Ok(Flow::Finished);
                }
                env.tracer.on_return(self.frames.len());
            }

            Opcode::NewList => {
                let count = instr.lhs.as_usize();
                let start = self.stack.len() - count;
                let items: Vec<Value> = self.stack.drain(start..).collect();
                let id = self.heap.alloc(HeapData::List(items));
                self.push(Value::Ref(id));
            }
            Opcode::ListPush => {
                let value = self.pop();
                let list = self.pop();
                self.list_push(list, value)?;
            }
            Opcode::NewRange => {
                let end = self.pop();
                let start = self.pop();
                let value = self.new_range(start, end)?;
                self.push(value);
            }
            Opcode::NewInstance => {
                self.op_new_instance(env, frame, &instr)?;
            }
            Opcode::NewIterator => {
                let source = self.pop();
                let value = self.new_iterator(source)?;
                self.push(value);
            }
            Opcode::IteratorNext => {
                let iter = self.read_slot(frame.locals_base, instr.lhs.as_usize());
                match self.iterator_next(iter)? {
                    Some(value) => {
                        self.write_slot(frame.locals_base, instr.rhs.as_usize(), value);
                    }
                    None => {
                        self.check_interrupt()?;
                        frame.ip = instr.rhs2.as_usize();
                    }
                }
            }
            Opcode::BindMethod => {
                let receiver = self.pop();
                let value = self.bind_method(env, receiver, instr.lhs.as_str())?;
                self.push(value);
            }
            Opcode::NewFunction => {
                let fid = FunctionId::new(instr.lhs.as_usize());
                let id = self.heap.alloc(HeapData::Function(fid));
                self.push(Value::Ref(id));
            }

            Opcode::AddIntConst => {
                let a = self.pop();
                let k = instr.lhs.as_int();
                let kv = i32::try_from(k).map_or(Value::Long(k), Value::Int);
                let value = self.add_values(env, a, kv)?;
                self.push(value);
            }
            Opcode::MulPow2Shift => {
                let a = self.pop();
                self.push(ops::mul_pow2(a, u32::try_from(instr.lhs.as_int()).expect("shift fits u32"))?);
            }
            Opcode::IncLocal => {
                // Mirrors the LoadLocal/AddIntConst/StoreLocal sequence it
                // replaces, string concatenation included.
                let slot = instr.lhs.as_usize();
                let value = self.read_slot(frame.locals_base, slot);
                let incremented = self.add_values(env, value, Value::Int(1))?;
                self.write_slot(frame.locals_base, slot, incremented);
            }

            Opcode::Throw => {
                let value = self.pop();
                let message = crate::value::display_value(value, &self.heap, env.interns);
                return Err(RunError::thrown(message, Some(value)));
            }
            Opcode::TryEnter => {
                self.try_stack.push(TryHandler {
                    frame_index: self.frames.len() - 1,
                    handler: instr.lhs.as_usize(),
                    stack_depth: self.stack.len(),
                });
            }
            Opcode::TryLeave => {
                self.try_stack.pop();
            }
            Opcode::SectionGlobal => {
                self.check_deadline()?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Pops the current frame, truncating its stack and locals regions.
    /// Returns true when the entry frame was popped (program finished).
    fn pop_frame(&mut self, frame: &mut Frame) -> bool {
        let done = *self.frames.last().expect("active frame");
        self.frames.pop();
        self.stack.truncate(done.stack_base);
        self.locals.truncate(done.locals_base);
        while let Some(handler) = self.try_stack.last() {
            if handler.frame_index >= self.frames.len() {
                self.try_stack.pop();
            } else {
                break;
            }
        }
        if self.frames.is_empty() {
            return true;
        }
        *frame = *self.frames.last().expect("caller frame");
        false
    }

    /// Unwinds to the nearest `try` handler, or converts the error into a
    /// faulted diagnostic.
    fn unwind(&mut self, env: &mut ExecEnv<'_>, err: &RunError, frame: &mut Frame) -> Result<(), Diagnostic> {
        let fault_ip = frame.ip.saturating_sub(1);
        let Some(handler) = self.try_stack.pop() else {
            return Err(self.build_diagnostic(env, err, fault_ip));
        };

        while self.frames.len() - 1 > handler.frame_index {
            let popped = *self.frames.last().expect("unwind frame");
            self.frames.pop();
            self.stack.truncate(popped.stack_base);
            self.locals.truncate(popped.locals_base);
        }
        self.stack.truncate(handler.stack_depth);

        let exception = match err.payload {
            Some(value) => value,
            None => {
                let id = self.heap.alloc(HeapData::Exception {
                    message: err.message.clone(),
                    payload: None,
                });
                Value::Ref(id)
            }
        };
        self.push(exception);
        let index = self.frames.len() - 1;
        self.frames[index].ip = handler.handler;
        *frame = self.frames[index];
        Ok(())
    }
}

/// Outcome of one dispatched instruction.
enum Flow {
    Continue,
    Finished,
}
