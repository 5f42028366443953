//! Call protocol: symbolic call resolution with inline caches, frame push,
//! method dispatch, intrinsic invocation, and fault elaboration.

use smallvec::SmallVec;

use super::{CacheTarget, ExecEnv, Frame, InlineCache, MAX_FRAMES, Machine, VmStatus};
use crate::bytecode::Instruction;
use crate::diagnostic::{CodeLoc, Diagnostic, Phase, StackFrame};
use crate::error::{ErrorKind, RunError, RunResult};
use crate::heap::HeapData;
use crate::intern::{StringId, demangle, mangle};
use crate::scope::{FunctionId, IntrinsicId, ScopeId, Symbol};
use crate::stdlib::{self, NativeCtx};
use crate::value::{Value, display_value};

impl Machine {
    /// `Call` / `TailCall`: resolve the mangled name, then enter the frame
    /// (or invoke the native delegate).
    ///
    /// Resolution order: parser-resolved target, inline cache, scope-chain
    /// lookup, then a callable value held in the hinted (or same-named)
    /// variable. Misses refill the cache; a resolution that lands on a
    /// callable value is left uncached since the variable can be rebound.
    pub(super) fn op_call(
        &mut self,
        env: &mut ExecEnv<'_>,
        frame: &mut Frame,
        ip: usize,
        instr: &Instruction,
        tail: bool,
    ) -> RunResult<()> {
        let mangled = instr.lhs.as_str();
        let argc = instr.rhs.as_usize();
        let direct = instr.rhs2.as_int();
        let scope = env.scopes.functions[frame.func.index()].scope;

        let target = if direct >= 0 {
            let fid = FunctionId::new(usize::try_from(direct).expect("checked non-negative"));
            match env.scopes.functions[fid.index()].intrinsic {
                Some(iid) => CacheTarget::Intrinsic(iid),
                None => CacheTarget::Func(fid),
            }
        } else if let Some(cache) = self.caches.get(&ip)
            && cache.version == self.cache_version
            && cache.key == mangled
        {
            cache.target
        } else {
            match env.scopes.resolve(scope, mangled) {
                Some(Symbol::Func(fid)) => {
                    let target = match env.scopes.functions[fid.index()].intrinsic {
                        Some(iid) => CacheTarget::Intrinsic(iid),
                        None => CacheTarget::Func(fid),
                    };
                    self.caches.insert(
                        ip,
                        InlineCache {
                            key: mangled,
                            target,
                            version: self.cache_version,
                        },
                    );
                    target
                }
                _ => {
                    // Callable value in a variable: the parser's slot hint,
                    // or a global with the base name.
                    let hint = instr.rhs3.as_int();
                    let value = if hint >= 0 {
                        let slot = usize::try_from(hint >> 1).expect("hint slot fits");
                        if hint & 1 == 1 {
                            Some(self.read_global(slot))
                        } else {
                            Some(self.read_slot(frame.locals_base, slot))
                        }
                    } else {
                        let base = demangle(env.interns.get(mangled)).to_owned();
                        env.interns
                            .lookup(&base)
                            .and_then(|base_id| env.scopes.resolve(scope, base_id))
                            .and_then(|symbol| match symbol {
                                Symbol::Var(var) => Some(self.read_global(var.slot as usize)),
                                _ => None,
                            })
                    };
                    match value {
                        Some(value) if !value.is_nil() => {
                            return self.call_value(env, frame, value, argc, tail);
                        }
                        _ => return Err(self.unresolved_call(env, scope, mangled, argc)),
                    }
                }
            }
        };

        match target {
            CacheTarget::Intrinsic(iid) => self.invoke_intrinsic(env, iid, argc),
            CacheTarget::Func(fid) => self.push_callee_frame(env, frame, fid, argc, None, tail),
        }
    }

    /// Calls a `Function` or `BoundMethod` value.
    fn call_value(
        &mut self,
        env: &mut ExecEnv<'_>,
        frame: &mut Frame,
        value: Value,
        argc: usize,
        tail: bool,
    ) -> RunResult<()> {
        let Value::Ref(id) = value else {
            return Err(RunError::type_mismatch(format!(
                "{} is not callable",
                value.type_name(&self.heap)
            )));
        };
        match *self.heap.get(id) {
            HeapData::Function(fid) => match env.scopes.functions[fid.index()].intrinsic {
                Some(iid) => self.invoke_intrinsic(env, iid, argc),
                None => self.push_callee_frame(env, frame, fid, argc, None, tail),
            },
            HeapData::BoundMethod { receiver, func } => {
                self.push_callee_frame(env, frame, func, argc, Some(receiver), tail)
            }
            _ => Err(RunError::type_mismatch(format!(
                "{} is not callable",
                value.type_name(&self.heap)
            ))),
        }
    }

    /// Pops arguments, checks arity and recursion depth, and enters the
    /// callee's frame. A tail call replaces the current frame instead of
    /// stacking a new one.
    fn push_callee_frame(
        &mut self,
        env: &mut ExecEnv<'_>,
        frame: &mut Frame,
        fid: FunctionId,
        argc: usize,
        receiver: Option<Value>,
        tail: bool,
    ) -> RunResult<()> {
        let decl = &env.scopes.functions[fid.index()];
        if usize::from(decl.arity) != argc {
            return Err(RunError::arity_mismatch(format!(
                "{} takes {} argument(s), got {argc}",
                env.interns.get(decl.base_name),
                decl.arity
            )));
        }
        if !tail && self.frames.len() >= MAX_FRAMES {
            return Err(RunError::new(ErrorKind::RecursionLimit, "call stack depth limit reached"));
        }

        let start = self.stack.len() - argc;
        self.pending_args.clear();
        if let Some(receiver) = receiver {
            self.pending_args.push(receiver);
        }
        self.pending_args.extend(self.stack.drain(start..));

        let entry_ip = decl.start;
        let name = env.interns.get(decl.base_name).to_owned();
        if tail {
            // Reuse this frame's stack and locals regions. Handlers opened
            // by the replaced frame die with it.
            let current = *self.frames.last().expect("active frame");
            self.stack.truncate(current.stack_base);
            self.locals.truncate(current.locals_base);
            let index = self.frames.len() - 1;
            self.drop_handlers_at_or_above(index);
            self.frames[index] = Frame {
                ip: entry_ip,
                stack_base: current.stack_base,
                locals_base: current.locals_base,
                func: fid,
            };
            *frame = self.frames[index];
        } else {
            let index = self.frames.len() - 1;
            self.frames[index].ip = frame.ip;
            let new_frame = Frame {
                ip: entry_ip,
                stack_base: self.stack.len(),
                locals_base: self.locals.len(),
                func: fid,
            };
            self.frames.push(new_frame);
            *frame = new_frame;
        }
        env.tracer.on_call(&name, self.frames.len());
        Ok(())
    }

    /// Invokes a native delegate with (ctx, args); no frame is pushed.
    pub(super) fn invoke_intrinsic(&mut self, env: &mut ExecEnv<'_>, iid: IntrinsicId, argc: usize) -> RunResult<()> {
        let intrinsics = env.intrinsics;
        let intrinsic = &intrinsics[iid.index()];
        if usize::from(intrinsic.arity) != argc {
            return Err(RunError::arity_mismatch(format!(
                "{} takes {} argument(s), got {argc}",
                demangle(env.interns.get(intrinsic.mangled)),
                intrinsic.arity
            )));
        }
        let start = self.stack.len() - argc;
        let args: SmallVec<[Value; 8]> = self.stack.drain(start..).collect();
        let mut ctx = NativeCtx {
            heap: &mut self.heap,
            interns: &mut *env.interns,
            out: &mut *env.out,
            input: &mut *env.input,
            message: &mut self.intrinsic_message,
        };
        let result = (intrinsic.func)(&mut ctx, &args)?;
        self.push(result);
        Ok(())
    }

    /// `CallMethod`: receiver-based dispatch through the struct method
    /// table, then struct static intrinsics, then the built-in method table
    /// of strings, lists, chars, ranges, and wrappers.
    pub(super) fn op_call_method(
        &mut self,
        env: &mut ExecEnv<'_>,
        frame: &mut Frame,
        instr: &Instruction,
    ) -> RunResult<()> {
        let name = instr.lhs.as_str();
        let argc = instr.rhs.as_usize();
        let receiver = self.stack[self.stack.len() - 1 - argc];

        if let Value::Ref(id) = receiver {
            match self.heap.get(id) {
                HeapData::Instance(instance) => {
                    let sid = instance.struct_id;
                    let mangled = {
                        let base = env.interns.get(name).to_owned();
                        env.interns.intern(&mangle(&base, argc))
                    };
                    let strukt = &env.scopes.structs[sid.index()];
                    if let Some(&fid) = strukt.methods.get(&mangled) {
                        let start = self.stack.len() - argc;
                        let args: SmallVec<[Value; 8]> = self.stack.drain(start..).collect();
                        self.pop(); // receiver
                        for arg in args {
                            self.push(arg);
                        }
                        return self.push_callee_frame(env, frame, fid, argc, Some(receiver), false);
                    }
                    if let Some(&iid) = strukt.static_intrinsics.get(&mangled) {
                        // Native struct methods receive the receiver as the
                        // leading argument.
                        return self.invoke_method_intrinsic(env, iid, argc);
                    }
                    return Err(self.unknown_method(env, sid, name, argc));
                }
                HeapData::Wrapper(wrapper) => {
                    if let Some(&iid) = wrapper.methods.get(&name) {
                        return self.invoke_method_intrinsic(env, iid, argc);
                    }
                    return Err(RunError::unknown_variable(format!(
                        "wrapper has no method `{}`",
                        env.interns.get(name)
                    )));
                }
                _ => {}
            }
        }

        // Built-in object methods.
        let start = self.stack.len() - argc - 1;
        let args: SmallVec<[Value; 8]> = self.stack.drain(start..).collect();
        let base = env.interns.get(name).to_owned();
        let result = stdlib::builtin_method(self, env, &base, &args)?;
        self.push(result);
        Ok(())
    }

    /// Invokes a receiver-first native method: the receiver below the
    /// arguments joins them as `args[0]`.
    fn invoke_method_intrinsic(&mut self, env: &mut ExecEnv<'_>, iid: IntrinsicId, argc: usize) -> RunResult<()> {
        let start = self.stack.len() - argc - 1;
        let args: SmallVec<[Value; 8]> = self.stack.drain(start..).collect();
        let intrinsics = env.intrinsics;
        let intrinsic = &intrinsics[iid.index()];
        let mut ctx = NativeCtx {
            heap: &mut self.heap,
            interns: &mut *env.interns,
            out: &mut *env.out,
            input: &mut *env.input,
            message: &mut self.intrinsic_message,
        };
        let result = (intrinsic.func)(&mut ctx, &args)?;
        self.push(result);
        Ok(())
    }

    /// `NewInstance`: blueprint fields default to nil, then the hidden
    /// defaults initializer (when present) runs against the new instance.
    pub(super) fn op_new_instance(
        &mut self,
        env: &mut ExecEnv<'_>,
        frame: &mut Frame,
        instr: &Instruction,
    ) -> RunResult<()> {
        let sid = crate::scope::StructId::new(instr.lhs.as_usize());
        let strukt = &env.scopes.structs[sid.index()];
        let fields = strukt.field_names.iter().map(|&name| (name, Value::Nil)).collect();
        let instance = crate::heap::Instance {
            struct_id: sid,
            name: strukt.name,
            fields,
        };
        let defaults_fn = strukt.defaults_fn;
        let id = self.heap.alloc(HeapData::Instance(instance));
        self.push(Value::Ref(id));

        if let Some(dfid) = defaults_fn {
            // The initializer ends in LeaveFrame, so the instance pushed
            // above is still the statement's result afterwards.
            self.push(Value::Ref(id));
            self.push_callee_frame(env, frame, dfid, 1, None, false)?;
        }
        Ok(())
    }

    /// Missing-method error with near-miss arity hints.
    fn unknown_method(&self, env: &ExecEnv<'_>, sid: crate::scope::StructId, name: StringId, argc: usize) -> RunError {
        let strukt = &env.scopes.structs[sid.index()];
        let mut hints = Vec::new();
        for &fid in strukt.methods.values() {
            let decl = &env.scopes.functions[fid.index()];
            if decl.base_name == name {
                hints.push(format!(
                    "{}.{} takes {} argument(s)",
                    env.interns.get(strukt.name),
                    env.interns.get(name),
                    decl.arity
                ));
            }
        }
        let kind = if hints.is_empty() {
            ErrorKind::UnknownVariable
        } else {
            ErrorKind::ArityMismatch
        };
        RunError::with_hints(
            kind,
            format!(
                "`{}` has no method `{}` taking {argc} argument(s)",
                env.interns.get(strukt.name),
                env.interns.get(name)
            ),
            hints,
        )
    }

    /// Unresolved-call error: `UnknownVariable`, upgraded to
    /// `ArityMismatch` when a same-base-name overload exists.
    fn unresolved_call(&self, env: &ExecEnv<'_>, scope: ScopeId, mangled: StringId, argc: usize) -> RunError {
        let base = demangle(env.interns.get(mangled)).to_owned();
        let mut hints = Vec::new();
        if let Some(base_id) = env.interns.lookup(&base) {
            for fid in env.scopes.overloads_of(scope, base_id) {
                let decl = &env.scopes.functions[fid.index()];
                hints.push(format!("{base} accepts {} argument(s)", decl.arity));
            }
        }
        let kind = if hints.is_empty() {
            ErrorKind::UnknownVariable
        } else {
            ErrorKind::ArityMismatch
        };
        RunError::with_hints(
            kind,
            format!("no callable `{base}` taking {argc} argument(s)"),
            hints,
        )
    }

    // ==================================================================
    // Fault elaboration
    // ==================================================================

    /// Builds the user-facing diagnostic for an unhandled runtime error:
    /// site, last instruction, locals and operand-stack snapshots, call
    /// trace, and the error's own hints.
    pub(super) fn build_diagnostic(&mut self, env: &mut ExecEnv<'_>, err: &RunError, fault_ip: usize) -> Diagnostic {
        let instr = env.code.instrs.get(fault_ip);
        let loc = instr.map(|i| self.code_loc(env, i));
        let source_line = instr.and_then(|i| {
            env.sources
                .get(usize::from(i.file_index))
                .and_then(|s| s.text.lines().nth(i.line.saturating_sub(1) as usize))
                .map(str::to_owned)
        });

        let mut trace = Vec::new();
        let last = self.frames.len().saturating_sub(1);
        for (index, f) in self.frames.iter().enumerate() {
            let decl = &env.scopes.functions[f.func.index()];
            let at = if index == last { fault_ip } else { f.ip.saturating_sub(1) };
            let frame_loc = env
                .code
                .instrs
                .get(at)
                .map_or_else(|| self.fallback_loc(env), |i| self.code_loc(env, i));
            trace.push(StackFrame {
                function: demangle(env.interns.get(decl.base_name)).to_owned(),
                loc: frame_loc,
            });
        }

        let mut locals = Vec::new();
        let mut operand_stack = Vec::new();
        if let Some(f) = self.frames.last() {
            let decl = &env.scopes.functions[f.func.index()];
            for slot in 0..usize::from(decl.registers) {
                let name = decl
                    .params
                    .get(slot)
                    .map_or_else(|| format!("r{slot}"), |&p| env.interns.get(p).to_owned());
                let value = self
                    .locals
                    .get(f.locals_base + slot)
                    .copied()
                    .unwrap_or(Value::Nil);
                locals.push((name, display_value(value, &self.heap, env.interns)));
            }
            for &value in &self.stack[f.stack_base.min(self.stack.len())..] {
                operand_stack.push(display_value(value, &self.heap, env.interns));
            }
        }

        Diagnostic {
            phase: Phase::Runtime,
            kind: Some(err.kind),
            message: err.message.clone(),
            loc,
            source_line,
            last_instruction: instr.map(|_| env.code.fmt_instruction(fault_ip, env.interns)),
            locals,
            operand_stack,
            trace,
            hints: err.hints.clone(),
        }
    }

    fn code_loc(&self, env: &ExecEnv<'_>, instr: &Instruction) -> CodeLoc {
        CodeLoc {
            file: env
                .sources
                .get(usize::from(instr.file_index))
                .map_or_else(|| "<source>".to_owned(), |s| s.name.clone()),
            line: instr.line,
            column: instr.column,
        }
    }

    fn fallback_loc(&self, env: &ExecEnv<'_>) -> CodeLoc {
        CodeLoc {
            file: env.sources.first().map_or_else(|| "<source>".to_owned(), |s| s.name.clone()),
            line: 0,
            column: 0,
        }
    }

    /// Current status helper used by the embedding layer to refuse
    /// registration while running.
    pub(crate) fn is_running(&self) -> bool {
        matches!(self.status, VmStatus::Running | VmStatus::Suspended)
    }

    pub(super) fn drop_handlers_at_or_above(&mut self, frame_index: usize) {
        while let Some(handler) = self.try_stack.last() {
            if handler.frame_index >= frame_index {
                self.try_stack.pop();
            } else {
                break;
            }
        }
    }
}
