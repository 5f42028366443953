//! Public interface for compiling and running Fluence code.
//!
//! [`Interpreter`] owns the whole pipeline: sources go through the lexer and
//! single-pass parser into a frozen code vector (optionally peephole
//! optimized), and the embedded [`Machine`] executes it against the host's
//! I/O hooks. [`LibraryBuilder`] is the embedding surface for registering
//! native callables and constants before compilation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ahash::AHashSet;

use crate::bytecode::{Code, optimizer};
use crate::diagnostic::Diagnostic;
use crate::error::{ErrorKind, RunError};
use crate::heap::{Heap, HeapData};
use crate::intern::Interns;
use crate::io::{LineReader, PrintWriter, StdLineReader, StdPrint};
use crate::object::Object;
use crate::parser::{ParseOptions, SourceFile, parse_program};
use crate::scope::{GLOBAL_SCOPE, ScopeId, Scopes, StructDecl, Symbol};
use crate::stdlib::{self, Intrinsic, IntrinsicFn, NativeCtx};
use crate::tracer::{NoopTracer, VmTracer};
use crate::value::Value;
use crate::vm::{ExecEnv, Machine, VmStatus};

/// Interpreter configuration flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Run the peephole optimizer over freshly parsed code (default on).
    pub optimize_bytecode: bool,
    /// Emit the `SectionGlobal` marker between body and setup (test hook).
    pub emit_section_global: bool,
    /// Execution deadline; `None` means unbounded.
    pub default_timeout: Option<Duration>,
    /// Symbols enabling `#IF SYM { … }` blocks.
    pub compilation_symbols: AHashSet<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            optimize_bytecode: true,
            emit_section_global: true,
            default_timeout: None,
            compilation_symbols: AHashSet::new(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn optimize_bytecode(mut self, enabled: bool) -> Self {
        self.optimize_bytecode = enabled;
        self
    }

    #[must_use]
    pub fn emit_section_global(mut self, enabled: bool) -> Self {
        self.emit_section_global = enabled;
        self
    }

    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn compilation_symbol(mut self, symbol: &str) -> Self {
        self.compilation_symbols.insert(symbol.to_owned());
        self
    }
}

/// The embeddable interpreter: compile once, then run, step, and inspect.
pub struct Interpreter {
    config: Config,
    scopes: Scopes,
    interns: Interns,
    intrinsics: Vec<Intrinsic>,
    sources: Vec<SourceFile>,
    code: Option<Code>,
    machine: Option<Machine>,
    /// Initial values for globals registered through the embedding API
    /// before compilation, applied when the machine is created.
    global_inits: Vec<(u32, Value)>,
    stop_flag: Arc<AtomicBool>,
    tracer: Box<dyn VmTracer>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    /// Creates an interpreter with the default configuration and the core
    /// console/conversion intrinsics registered.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    #[must_use]
    pub fn with_config(config: Config) -> Self {
        let mut scopes = Scopes::new();
        let mut interns = Interns::new();
        let mut intrinsics = Vec::new();
        stdlib::register_core(&mut scopes, &mut interns, &mut intrinsics);
        Self {
            config,
            scopes,
            interns,
            intrinsics,
            sources: Vec::new(),
            code: None,
            machine: None,
            global_inits: Vec::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            tracer: Box::new(NoopTracer),
        }
    }

    /// Compiles a single source text.
    pub fn compile(&mut self, source: &str, name: &str) -> Result<(), Box<Diagnostic>> {
        self.compile_files(vec![SourceFile {
            name: name.to_owned(),
            text: source.to_owned(),
        }])
    }

    /// Compiles several named sources as one program unit.
    pub fn compile_files(&mut self, files: Vec<SourceFile>) -> Result<(), Box<Diagnostic>> {
        let options = ParseOptions {
            emit_section_global: self.config.emit_section_global,
            symbols: self.config.compilation_symbols.clone(),
        };
        let compiled = parse_program(&files, &mut self.interns, &mut self.scopes, &options).map_err(Box::new)?;
        self.sources = files;

        let mut code = compiled.code;
        if self.config.optimize_bytecode {
            let mut entry_points = Vec::with_capacity(self.scopes.functions.len() * 2);
            for decl in &self.scopes.functions {
                if decl.intrinsic.is_none() {
                    entry_points.push(decl.start);
                    entry_points.push(decl.end);
                }
            }
            let map = optimizer::optimize(&mut code, &entry_points);
            for decl in &mut self.scopes.functions {
                if decl.intrinsic.is_none() {
                    decl.start = map[decl.start];
                    decl.end = map[decl.end];
                }
            }
        }
        self.code = Some(code);

        let mut machine = Machine::new(compiled.entry, self.scopes.global_count, Arc::clone(&self.stop_flag));
        for &(slot, value) in &self.global_inits {
            machine.globals[slot as usize] = value;
        }
        self.machine = Some(machine);
        Ok(())
    }

    fn exec(
        &mut self,
        budget: Option<usize>,
        out: &mut dyn PrintWriter,
        input: &mut dyn LineReader,
    ) -> Result<VmStatus, Box<Diagnostic>> {
        let code = self.code.as_ref().ok_or_else(|| {
            Box::new(Diagnostic::parse("no program compiled", None, None))
        })?;
        let machine = self.machine.as_mut().expect("machine exists after compile");
        let mut env = ExecEnv {
            code,
            scopes: &self.scopes,
            interns: &mut self.interns,
            intrinsics: &self.intrinsics,
            sources: &self.sources,
            out,
            input,
            tracer: &mut *self.tracer,
        };
        machine.run(&mut env, budget, self.config.default_timeout)
    }

    /// Runs the compiled program to completion with standard I/O.
    pub fn run_until_done(&mut self) -> Result<VmStatus, Box<Diagnostic>> {
        self.exec(None, &mut StdPrint, &mut StdLineReader)
    }

    /// Runs to completion against custom I/O hooks.
    pub fn run_with_io(
        &mut self,
        out: &mut dyn PrintWriter,
        input: &mut dyn LineReader,
    ) -> Result<VmStatus, Box<Diagnostic>> {
        self.exec(None, out, input)
    }

    /// Executes at most `n` instructions; returns `Suspended` when the
    /// budget runs out with the program still in flight.
    pub fn step(&mut self, n: usize) -> Result<VmStatus, Box<Diagnostic>> {
        self.exec(Some(n), &mut StdPrint, &mut StdLineReader)
    }

    /// `step` against custom I/O hooks.
    pub fn step_with_io(
        &mut self,
        n: usize,
        out: &mut dyn PrintWriter,
        input: &mut dyn LineReader,
    ) -> Result<VmStatus, Box<Diagnostic>> {
        self.exec(Some(n), out, input)
    }

    /// Requests a cooperative stop; the VM honors it at the next branch or
    /// call check.
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    /// Sets the execution deadline for subsequent runs.
    pub fn timeout(&mut self, duration: Duration) {
        self.config.default_timeout = Some(duration);
    }

    #[must_use]
    pub fn status(&self) -> VmStatus {
        self.machine.as_ref().map_or(VmStatus::Ready, Machine::status)
    }

    /// Reads a global by name as a host object.
    #[must_use]
    pub fn get_global(&self, name: &str) -> Option<Object> {
        let machine = self.machine.as_ref()?;
        let id = self.interns.lookup(name)?;
        match self.scopes.resolve(GLOBAL_SCOPE, id)? {
            Symbol::Var(var) => {
                let value = machine.globals[var.slot as usize];
                Some(value_to_object(value, &machine.heap, &self.interns, 0))
            }
            _ => None,
        }
    }

    /// Writes a global by name.
    pub fn set_global(&mut self, name: &str, object: &Object) -> Result<(), String> {
        let machine = self.machine.as_mut().ok_or("no program compiled")?;
        let id = self.interns.lookup(name).ok_or_else(|| format!("unknown global `{name}`"))?;
        match self.scopes.resolve(GLOBAL_SCOPE, id) {
            Some(Symbol::Var(var)) => {
                let value = object_to_value(object, &mut machine.heap, &mut self.interns);
                machine.globals[var.slot as usize] = value;
                Ok(())
            }
            _ => Err(format!("unknown global `{name}`")),
        }
    }

    /// Message recorded by the last intrinsic that signalled a recoverable
    /// error, if any.
    #[must_use]
    pub fn last_intrinsic_message(&self) -> Option<&str> {
        self.machine.as_ref()?.intrinsic_message.as_deref()
    }

    /// Replaces the execution tracer.
    pub fn set_tracer(&mut self, tracer: Box<dyn VmTracer>) {
        self.tracer = tracer;
    }

    /// Textual dump of the compiled instruction vector.
    #[must_use]
    pub fn disassemble(&self) -> Option<String> {
        self.code.as_ref().map(|code| code.disassemble(&self.interns))
    }

    /// Opens the library builder rooted at a namespace scope (`None` roots
    /// at the global scope). Registration is only legal while the VM is not
    /// running.
    pub fn library(&mut self, namespace: Option<&str>) -> Result<LibraryBuilder<'_>, String> {
        if self.machine.as_ref().is_some_and(Machine::is_running) {
            return Err("cannot register libraries while the VM is running".to_owned());
        }
        let scope = match namespace {
            None => GLOBAL_SCOPE,
            Some(name) => {
                let id = self.interns.intern(name);
                match self.scopes.resolve_local(GLOBAL_SCOPE, id) {
                    Some(Symbol::Namespace(ns)) => ns,
                    Some(_) => return Err(format!("`{name}` is already bound to a non-namespace symbol")),
                    None => {
                        let ns = self.scopes.new_scope(GLOBAL_SCOPE, Some(id));
                        self.scopes
                            .declare(GLOBAL_SCOPE, id, Symbol::Namespace(ns))
                            .expect("absence checked");
                        ns
                    }
                }
            }
        };
        Ok(LibraryBuilder { interp: self, scope })
    }

    /// Registers a single native function (shorthand over [`Self::library`]).
    pub fn register_intrinsic<F>(
        &mut self,
        namespace: Option<&str>,
        name: &str,
        arity: u8,
        func: F,
    ) -> Result<(), String>
    where
        F: Fn(&mut HostCtx<'_, '_>, &[Object]) -> Result<Object, String> + 'static,
    {
        self.library(namespace)?.add_function(name, arity, func)?;
        Ok(())
    }
}

/// Registration handle rooted at one namespace scope.
///
/// Native callables registered here become ordinary symbols: scripts call
/// them like any function, and the VM dispatches to the delegate without
/// pushing a frame.
pub struct LibraryBuilder<'a> {
    interp: &'a mut Interpreter,
    scope: ScopeId,
}

impl LibraryBuilder<'_> {
    /// Registers a named native function with a fixed arity.
    pub fn add_function<F>(&mut self, name: &str, arity: u8, func: F) -> Result<&mut Self, String>
    where
        F: Fn(&mut HostCtx<'_, '_>, &[Object]) -> Result<Object, String> + 'static,
    {
        let wrapped = wrap_host_fn(func);
        stdlib::register_intrinsic(
            &mut self.interp.scopes,
            &mut self.interp.interns,
            &mut self.interp.intrinsics,
            self.scope,
            name,
            arity,
            wrapped,
        )?;
        self.invalidate_caches();
        Ok(self)
    }

    /// Registers a primitive constant (number, string, char, bool, nil) as
    /// a readonly global in this namespace.
    pub fn add_global_constant(&mut self, name: &str, value: &Object) -> Result<&mut Self, String> {
        let converted = primitive_to_value(value, &mut self.interp.interns)
            .ok_or("global constants must be primitives (number, string, char, bool, nil)")?;
        let id = self.interp.interns.intern(name);
        let slot = self
            .interp
            .scopes
            .declare_global_var(self.scope, id, true)
            .map_err(|_| format!("`{name}` is already declared"))?;
        self.interp.global_inits.push((slot, converted));
        if let Some(machine) = self.interp.machine.as_mut() {
            machine.globals[slot as usize] = converted;
        }
        Ok(self)
    }

    /// Declares an empty host-backed struct.
    pub fn add_struct(&mut self, name: &str) -> Result<&mut Self, String> {
        let id = self.interp.interns.intern(name);
        let struct_scope = self.interp.scopes.new_scope(self.scope, Some(id));
        let sid = crate::scope::StructId::new(self.interp.scopes.structs.len());
        self.interp.scopes.structs.push(StructDecl {
            name: id,
            scope: struct_scope,
            field_names: Vec::new(),
            defaults_fn: None,
            statics: ahash::AHashMap::new(),
            methods: ahash::AHashMap::new(),
            static_intrinsics: ahash::AHashMap::new(),
            traits: Vec::new(),
        });
        self.interp
            .scopes
            .declare(self.scope, id, Symbol::Struct(sid))
            .map_err(|_| format!("`{name}` is already declared"))?;
        Ok(self)
    }

    /// Registers a native method on a struct. The delegate receives the
    /// instance as its leading argument.
    pub fn add_function_to_struct<F>(
        &mut self,
        struct_name: &str,
        name: &str,
        arity: u8,
        func: F,
    ) -> Result<&mut Self, String>
    where
        F: Fn(&mut HostCtx<'_, '_>, &[Object]) -> Result<Object, String> + 'static,
    {
        let sid = self.find_struct(struct_name)?;
        let mangled = {
            let mangled = crate::intern::mangle(name, usize::from(arity));
            self.interp.interns.intern(&mangled)
        };
        let iid = crate::scope::IntrinsicId::new(self.interp.intrinsics.len());
        self.interp.intrinsics.push(Intrinsic {
            mangled,
            arity,
            func: wrap_host_fn(func),
        });
        let strukt = &mut self.interp.scopes.structs[sid.index()];
        if strukt.static_intrinsics.insert(mangled, iid).is_some() {
            return Err(format!("`{struct_name}.{name}` with arity {arity} is already registered"));
        }
        self.invalidate_caches();
        Ok(self)
    }

    /// Registers a primitive constant accessible as `Struct.NAME`.
    pub fn add_constant_to_struct(&mut self, struct_name: &str, name: &str, value: &Object) -> Result<&mut Self, String> {
        let sid = self.find_struct(struct_name)?;
        let converted = primitive_to_value(value, &mut self.interp.interns)
            .ok_or("struct constants must be primitives (number, string, char, bool, nil)")?;
        let id = self.interp.interns.intern(name);
        let slot = self.interp.scopes.alloc_global_slot();
        let strukt = &mut self.interp.scopes.structs[sid.index()];
        if strukt.statics.insert(id, slot).is_some() {
            return Err(format!("`{struct_name}.{name}` is already registered"));
        }
        self.interp.global_inits.push((slot, converted));
        if let Some(machine) = self.interp.machine.as_mut() {
            if machine.globals.len() <= slot as usize {
                machine.globals.resize(slot as usize + 1, Value::Nil);
            }
            machine.globals[slot as usize] = converted;
        }
        Ok(self)
    }

    fn find_struct(&mut self, name: &str) -> Result<crate::scope::StructId, String> {
        let id = self.interp.interns.intern(name);
        match self.interp.scopes.resolve(self.scope, id) {
            Some(Symbol::Struct(sid)) => Ok(sid),
            _ => Err(format!("unknown struct `{name}`")),
        }
    }

    fn invalidate_caches(&mut self) {
        if let Some(machine) = self.interp.machine.as_mut() {
            machine.bump_cache_version();
        }
    }
}

/// Host-facing context handed to registered native functions.
pub struct HostCtx<'a, 'b> {
    ctx: &'a mut NativeCtx<'b>,
}

impl HostCtx<'_, '_> {
    /// Writes text through the VM's print hook.
    pub fn print(&mut self, text: &str) {
        self.ctx.out.stdout_write(text);
    }

    /// Writes a line through the VM's print hook.
    pub fn println(&mut self, text: &str) {
        self.ctx.out.stdout_write(text);
        self.ctx.out.stdout_push('\n');
    }

    /// Reads a line from the VM's input hook.
    pub fn read_line(&mut self) -> Option<String> {
        self.ctx.input.read_line()
    }

    /// Records a recoverable error message on the VM; the call should then
    /// return `Object::Nil`.
    pub fn recoverable(&mut self, message: &str) {
        let _ = self.ctx.recoverable(message);
    }
}

fn wrap_host_fn<F>(func: F) -> IntrinsicFn
where
    F: Fn(&mut HostCtx<'_, '_>, &[Object]) -> Result<Object, String> + 'static,
{
    Box::new(move |ctx, args| {
        let objects: Vec<Object> = args
            .iter()
            .map(|&value| value_to_object(value, ctx.heap, ctx.interns, 0))
            .collect();
        let result = {
            let mut host = HostCtx { ctx: &mut *ctx };
            func(&mut host, &objects)
        };
        match result {
            Ok(object) => Ok(object_to_value(&object, ctx.heap, ctx.interns)),
            Err(message) => Err(RunError::new(ErrorKind::NonSpecific, message)),
        }
    })
}

/// Guard against cyclic object graphs when deep-converting.
const MAX_CONVERT_DEPTH: u32 = 32;

pub(crate) fn value_to_object(value: Value, heap: &Heap, interns: &Interns, depth: u32) -> Object {
    match value {
        Value::Nil => Object::Nil,
        Value::Bool(v) => Object::Bool(v),
        Value::Int(v) => Object::Int(v),
        Value::Long(v) => Object::Long(v),
        Value::Float(v) => Object::Float(v),
        Value::Double(v) => Object::Double(v),
        Value::Char(c) => Object::Char(c),
        Value::Str(id) => Object::Str(interns.get(id).to_owned()),
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => Object::Str(s.clone()),
            HeapData::List(items) => {
                if depth >= MAX_CONVERT_DEPTH {
                    return Object::Opaque("<cyclic list>".to_owned());
                }
                Object::List(
                    items
                        .iter()
                        .map(|&item| value_to_object(item, heap, interns, depth + 1))
                        .collect(),
                )
            }
            HeapData::Range { start, end } => Object::Range(*start, *end),
            HeapData::Cell(inner) => value_to_object(*inner, heap, interns, depth + 1),
            _ => Object::Opaque(crate::value::display_value(value, heap, interns)),
        },
    }
}

pub(crate) fn object_to_value(object: &Object, heap: &mut Heap, interns: &mut Interns) -> Value {
    match object {
        Object::Nil => Value::Nil,
        Object::Bool(v) => Value::Bool(*v),
        Object::Int(v) => Value::Int(*v),
        Object::Long(v) => Value::Long(*v),
        Object::Float(v) => Value::Float(*v),
        Object::Double(v) => Value::Double(*v),
        Object::Char(c) => Value::Char(*c),
        Object::Str(s) => {
            if s.len() <= crate::intern::RUNTIME_INTERN_CAP {
                Value::Str(interns.intern(s))
            } else {
                heap.alloc_str(s.clone())
            }
        }
        Object::List(items) => {
            let values: Vec<Value> = items.iter().map(|item| object_to_value(item, heap, interns)).collect();
            Value::Ref(heap.alloc(HeapData::List(values)))
        }
        Object::Range(start, end) => Value::Ref(heap.alloc(HeapData::Range {
            start: *start,
            end: *end,
        })),
        Object::Opaque(text) => {
            if text.len() <= crate::intern::RUNTIME_INTERN_CAP {
                Value::Str(interns.intern(text))
            } else {
                heap.alloc_str(text.clone())
            }
        }
    }
}

fn primitive_to_value(object: &Object, interns: &mut Interns) -> Option<Value> {
    match object {
        Object::Nil => Some(Value::Nil),
        Object::Bool(v) => Some(Value::Bool(*v)),
        Object::Int(v) => Some(Value::Int(*v)),
        Object::Long(v) => Some(Value::Long(*v)),
        Object::Float(v) => Some(Value::Float(*v)),
        Object::Double(v) => Some(Value::Double(*v)),
        Object::Char(c) => Some(Value::Char(*c)),
        Object::Str(s) => Some(Value::Str(interns.intern(s))),
        Object::List(_) | Object::Range(..) | Object::Opaque(_) => None,
    }
}
