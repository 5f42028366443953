//! Single-pass recursive-descent parser and bytecode emitter.
//!
//! The parser consumes the token stream once, populating the scope tree and
//! appending instructions to the code vector as it goes; there is no AST.
//! Forward references resolve through a lightweight pre-scan that registers
//! every top-level function, struct, enum, trait, and namespace symbol before
//! emission starts. Anything the parser still cannot resolve statically
//! (calls into structs, callables held in variables) is emitted as a symbolic
//! call the VM resolves at first execution and caches.
//!
//! Some operator lowerings need to see source text more than once (the
//! unique-assignment family re-evaluates its right-hand side per target,
//! broadcast re-applies a call template per element). The cursor keeps the
//! whole token vector, so those lowerings save a position and replay a token
//! range instead of building a tree.

use ahash::AHashSet;
use smallvec::SmallVec;

use crate::bytecode::builder::{CodeBuilder, JumpLabel};
use crate::bytecode::{Code, Opcode, Operand};
use crate::diagnostic::{CodeLoc, Diagnostic};
use crate::intern::{Interns, StringId, mangle};
use crate::lexer::{Lexer, Literal, Token, TokenKind, TokenRange, unescape_fstring_chunk};
use crate::scope::{
    EnumDecl, FunctionDecl, FunctionId, GLOBAL_SCOPE, Scopes, StructDecl, StructId, Symbol, TraitDecl, TraitId,
    ScopeId,
};
use crate::value::{CmpOp, Value};

/// A named source unit to compile.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub text: String,
}

/// Parse-time configuration, a slice of the interpreter `Config`.
#[derive(Debug, Default)]
pub(crate) struct ParseOptions {
    /// Emit the `SectionGlobal` marker between the top-level body and setup.
    pub emit_section_global: bool,
    /// Symbols enabling `#IF SYM { … }` blocks.
    pub symbols: AHashSet<String>,
}

/// Output of a successful parse: the unoptimized code vector plus the entry
/// function (the implicit top-level body).
#[derive(Debug)]
pub(crate) struct Compiled {
    pub code: Code,
    pub entry: FunctionId,
}

/// Internal parse failure, converted to a [`Diagnostic`] at the boundary.
#[derive(Debug, Clone)]
struct PError {
    message: String,
    line: u32,
    column: u32,
    file_index: u16,
}

type PResult<T> = Result<T, PError>;

/// Cursor over the lexed token vector with save/restore for speculative
/// parses and replays.
struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl Cursor {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.next();
            return true;
        }
        false
    }

    fn save(&self) -> usize {
        self.pos
    }

    fn restore(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn skip_eols(&mut self) {
        while self.check(TokenKind::Eol) {
            self.next();
        }
    }
}

/// One local slot binding inside a function context.
#[derive(Debug, Clone, Copy)]
struct LocalVar {
    name: StringId,
    slot: u16,
    depth: u16,
}

/// Loop or match context for `break`/`continue` patching.
struct BreakCtx {
    /// True for loops (continue allowed), false for colon-form match.
    is_loop: bool,
    continue_target: Option<usize>,
    break_jumps: Vec<JumpLabel>,
    continue_jumps: Vec<JumpLabel>,
}

/// Per-function emission state.
struct FuncCtx {
    decl: FunctionId,
    scope: ScopeId,
    owner: Option<StructId>,
    locals: Vec<LocalVar>,
    next_slot: u16,
    max_slots: u16,
    depth: u16,
    breaks: Vec<BreakCtx>,
    enter_frame_at: usize,
}

impl FuncCtx {
    fn alloc_slot(&mut self) -> u16 {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.max_slots = self.max_slots.max(self.next_slot);
        slot
    }
}

/// Resolved assignment head for simple targets.
#[derive(Debug, Clone, Copy)]
enum PathHead {
    Name(StringId),
    SelfRef,
}

/// One postfix accessor in an assignment target path.
#[derive(Debug, Clone, Copy)]
enum Accessor {
    Field(StringId),
    Index(TokenRange),
}

/// A parsed (but unemitted) assignment target.
#[derive(Debug, Clone)]
struct Target {
    head: PathHead,
    accessors: SmallVec<[Accessor; 2]>,
    line: u32,
    column: u32,
}

pub(crate) struct Parser<'a> {
    cursor: Cursor,
    b: CodeBuilder,
    scopes: &'a mut Scopes,
    interns: &'a mut Interns,
    sources: &'a [SourceFile],
    options: &'a ParseOptions,
    funcs: Vec<FuncCtx>,
    /// Slot the pipe placeholder `_` resolves to, when inside a stage.
    placeholder: Option<u16>,
    /// Declaration scope for the statement being parsed (global or a
    /// namespace pushed by `space`).
    decl_scope: ScopeId,
    /// Collective-comparison speculation is only legal at statement roots
    /// and assignment right-hand sides, never inside argument lists.
    collective_ok: bool,
    /// Guards replay recursion (broadcast templates, unique assigns).
    replay_depth: u32,
    underscore: StringId,
    lambda_base: StringId,
}

/// Parses every source file into one code vector, returning the entry
/// function. `scopes` may already contain intrinsic registrations from the
/// embedding API; parsed symbols land next to them.
pub(crate) fn parse_program(
    sources: &[SourceFile],
    interns: &mut Interns,
    scopes: &mut Scopes,
    options: &ParseOptions,
) -> Result<Compiled, Diagnostic> {
    let mut tokens: Vec<Token> = Vec::new();
    for (file_index, source) in sources.iter().enumerate() {
        let index = u16::try_from(file_index).expect("more than 65535 source files");
        let lexer = Lexer::new(&source.text, index);
        let mut file_tokens = lexer.tokenize().map_err(|err| {
            Diagnostic::lex(
                err.message,
                CodeLoc {
                    file: source.name.clone(),
                    line: err.line,
                    column: err.column,
                },
                err.excerpt,
            )
        })?;
        // Drop the per-file Eof; files join at a statement boundary.
        file_tokens.pop();
        tokens.extend(file_tokens);
        tokens.push(synthetic_eol(index));
    }
    tokens.push(Token {
        kind: TokenKind::Eof,
        text: "".into(),
        literal: None,
        line: 0,
        column: 0,
        file_index: 0,
    });

    let underscore = interns.intern("_");
    let lambda_base = interns.intern("<lambda>");
    let mut parser = Parser {
        cursor: Cursor { tokens, pos: 0 },
        b: CodeBuilder::new(),
        scopes,
        interns,
        sources,
        options,
        funcs: Vec::new(),
        placeholder: None,
        decl_scope: GLOBAL_SCOPE,
        collective_ok: false,
        replay_depth: 0,
        underscore,
        lambda_base,
    };
    parser.run().map_err(|err| parser.to_diagnostic(err))
}

fn synthetic_eol(file_index: u16) -> Token {
    Token {
        kind: TokenKind::Eol,
        text: "\n".into(),
        literal: None,
        line: 0,
        column: 0,
        file_index,
    }
}

impl<'a> Parser<'a> {
    // ==================================================================
    // Driver, errors, and small helpers
    // ==================================================================

    fn run(&mut self) -> PResult<Compiled> {
        self.pre_scan()?;

        let main_base = self.interns.intern("<main>");
        let main_mangled = self.interns.intern(&mangle("<main>", 0));
        let entry = FunctionId::new(self.scopes.functions.len());
        self.scopes.functions.push(FunctionDecl {
            mangled: main_mangled,
            base_name: main_base,
            arity: 0,
            params: SmallVec::new(),
            by_ref: 0,
            start: 0,
            end: 0,
            scope: GLOBAL_SCOPE,
            registers: 0,
            is_lambda: false,
            intrinsic: None,
            owner: None,
        });

        let enter_frame_at = self.b.emit1(Opcode::EnterFrame, Operand::Int(0));
        self.funcs.push(FuncCtx {
            decl: entry,
            scope: GLOBAL_SCOPE,
            owner: None,
            locals: Vec::new(),
            next_slot: 0,
            max_slots: 0,
            depth: 0,
            breaks: Vec::new(),
            enter_frame_at,
        });

        loop {
            self.cursor.skip_eols();
            if self.cursor.check(TokenKind::Eof) {
                break;
            }
            self.parse_statement()?;
        }

        if self.options.emit_section_global {
            self.b.emit(Opcode::SectionGlobal);
        }
        // Run `Main()` after top-level setup when the program declares one.
        let main_call = self.interns.intern(&mangle("Main", 0));
        if let Some(Symbol::Func(_)) = self.scopes.resolve(GLOBAL_SCOPE, main_call) {
            self.b.emit3(
                Opcode::Call,
                Operand::Str(main_call),
                Operand::Int(0),
                Operand::Int(-1),
            );
            self.b.emit(Opcode::Pop);
        }
        self.b.emit_const(Value::Nil);
        let end = self.b.emit(Opcode::Return);

        let ctx = self.funcs.pop().expect("entry context");
        self.b.instrs[ctx.enter_frame_at].lhs = Operand::Int(i64::from(ctx.max_slots));
        let decl = self.scopes.function_mut(entry);
        decl.start = 0;
        decl.end = end;
        decl.registers = ctx.max_slots;

        Ok(Compiled {
            code: Code {
                instrs: std::mem::take(&mut self.b.instrs),
                consts: std::mem::take(&mut self.b.consts),
            },
            entry,
        })
    }

    fn err_at(&self, token: &Token, message: impl Into<String>) -> PError {
        PError {
            message: message.into(),
            line: token.line,
            column: token.column,
            file_index: token.file_index,
        }
    }

    fn err_here(&self, message: impl Into<String>) -> PError {
        self.err_at(self.cursor.peek(), message)
    }

    fn unexpected(&self, expected: &str) -> PError {
        let token = self.cursor.peek();
        let text: &str = &token.text;
        let kind: &'static str = token.kind.into();
        if text.is_empty() {
            self.err_at(token, format!("unexpected {kind}, expected {expected}"))
        } else {
            self.err_at(token, format!("unexpected {kind} `{text}`, expected {expected}"))
        }
    }

    fn to_diagnostic(&self, err: PError) -> Diagnostic {
        let file = self
            .sources
            .get(err.file_index as usize)
            .map_or_else(|| "<source>".to_owned(), |s| s.name.clone());
        let source_line = self
            .sources
            .get(err.file_index as usize)
            .and_then(|s| s.text.lines().nth(err.line.saturating_sub(1) as usize))
            .map(str::to_owned);
        Diagnostic::parse(
            err.message,
            Some(CodeLoc {
                file,
                line: err.line,
                column: err.column,
            }),
            source_line,
        )
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> PResult<Token> {
        if self.cursor.check(kind) {
            return Ok(self.cursor.next());
        }
        Err(self.unexpected(expected))
    }

    /// Accepts an end-of-statement boundary: `Eol`, `}`/`Eof` lookahead, or a
    /// train connector.
    fn expect_stmt_end(&mut self) -> PResult<()> {
        if self.cursor.eat(TokenKind::Eol) {
            return Ok(());
        }
        match self.cursor.peek_kind() {
            TokenKind::RBrace | TokenKind::Eof | TokenKind::Train | TokenKind::TrainEnd => Ok(()),
            _ => Err(self.unexpected("end of statement")),
        }
    }

    fn set_loc(&mut self, token: &Token) {
        self.b.set_location(token.line, token.column, token.file_index);
    }

    fn intern_token(&mut self, token: &Token) -> StringId {
        self.interns.intern(&token.text)
    }

    fn ctx(&mut self) -> &mut FuncCtx {
        self.funcs.last_mut().expect("function context")
    }

    fn ctx_ref(&self) -> &FuncCtx {
        self.funcs.last().expect("function context")
    }

    fn current_scope(&self) -> ScopeId {
        self.ctx_ref().scope
    }

    fn alloc_temp(&mut self) -> u16 {
        self.ctx().alloc_slot()
    }

    fn begin_scope(&mut self) {
        self.ctx().depth += 1;
    }

    fn end_scope(&mut self) {
        let ctx = self.ctx();
        ctx.depth -= 1;
        let depth = ctx.depth;
        ctx.locals.retain(|local| local.depth <= depth);
    }

    fn find_local(&self, name: StringId) -> Option<u16> {
        self.ctx_ref()
            .locals
            .iter()
            .rev()
            .find(|local| local.name == name)
            .map(|local| local.slot)
    }

    fn declare_local(&mut self, name: StringId) -> u16 {
        let slot = self.ctx().alloc_slot();
        let depth = self.ctx_ref().depth;
        self.ctx().locals.push(LocalVar { name, slot, depth });
        slot
    }

    /// Binds a name to an existing slot (reducer lambda parameters).
    fn bind_local_alias(&mut self, name: StringId, slot: u16) {
        let depth = self.ctx_ref().depth;
        self.ctx().locals.push(LocalVar { name, slot, depth });
    }

    /// True while emitting the implicit top-level body.
    fn at_top_level(&self) -> bool {
        self.funcs.len() == 1
    }

    // ==================================================================
    // Pre-scan: register top-level symbols for forward references
    // ==================================================================

    /// Walks the raw token stream registering every top-level `func`,
    /// `struct`, `enum`, `trait`, and `space` symbol (with arity for
    /// callables) so that declaration order never matters. Redefinitions are
    /// all collected before failing.
    fn pre_scan(&mut self) -> PResult<()> {
        let mut errors: Vec<PError> = Vec::new();
        let mut depth: u32 = 0;
        // Stack of (namespace scope, brace depth it closes at).
        let mut scope_stack: Vec<(ScopeId, u32)> = Vec::new();
        let mut pos = 0usize;

        let last = self.cursor.tokens.len() - 1;
        while pos < self.cursor.tokens.len() {
            let kind = self.cursor.tokens[pos].kind;
            let decl_scope = scope_stack.last().map_or(GLOBAL_SCOPE, |&(scope, _)| scope);
            let at_decl_level = depth == scope_stack.len() as u32;
            match kind {
                TokenKind::LBrace => {
                    depth += 1;
                    pos += 1;
                }
                TokenKind::RBrace => {
                    depth = depth.saturating_sub(1);
                    if let Some(&(_, close)) = scope_stack.last()
                        && depth < close
                    {
                        scope_stack.pop();
                    }
                    pos += 1;
                }
                TokenKind::Space if at_decl_level => {
                    // `space NAME {` opens a namespace scope.
                    if self.cursor.tokens[(pos + 1).min(last)].kind == TokenKind::Ident
                        && self.cursor.tokens[(pos + 2).min(last)].kind == TokenKind::LBrace
                    {
                        let name = self.interns.intern(&self.cursor.tokens[pos + 1].text);
                        let ns = match self.scopes.resolve_local(decl_scope, name) {
                            Some(Symbol::Namespace(existing)) => existing,
                            Some(_) => {
                                errors.push(self.err_at(
                                    &self.cursor.tokens[pos + 1],
                                    format!("redefinition of `{}`", self.cursor.tokens[pos + 1].text),
                                ));
                                pos += 3;
                                depth += 1;
                                continue;
                            }
                            None => {
                                let ns = self.scopes.new_scope(decl_scope, Some(name));
                                self.scopes
                                    .declare(decl_scope, name, Symbol::Namespace(ns))
                                    .expect("absence checked");
                                ns
                            }
                        };
                        depth += 1;
                        scope_stack.push((ns, depth));
                        pos += 3;
                    } else {
                        pos += 1;
                    }
                }
                TokenKind::Func if at_decl_level => {
                    pos += 1;
                    if let Err(err) = self.pre_scan_func(&mut pos, decl_scope) {
                        errors.push(err);
                    }
                }
                TokenKind::Struct if at_decl_level => {
                    pos += 1;
                    if let Err(err) = self.pre_scan_struct(&mut pos, decl_scope) {
                        errors.push(err);
                    }
                }
                TokenKind::Enum if at_decl_level => {
                    pos += 1;
                    if let Err(err) = self.pre_scan_enum(&mut pos, decl_scope) {
                        errors.push(err);
                    }
                }
                TokenKind::Ident if at_decl_level && &*self.cursor.tokens[pos].text == "trait" => {
                    if self.cursor.tokens[(pos + 1).min(last)].kind == TokenKind::Ident
                        && self.cursor.tokens[(pos + 2).min(last)].kind == TokenKind::LBrace
                    {
                        let name_token = self.cursor.tokens[pos + 1].clone();
                        let name = self.interns.intern(&name_token.text);
                        let id = TraitId::new(self.scopes.traits.len());
                        self.scopes.traits.push(TraitDecl {
                            name,
                            required_fields: Vec::new(),
                            required_funcs: Vec::new(),
                            default_methods: ahash::AHashMap::new(),
                            default_fields: Vec::new(),
                        });
                        if self.scopes.declare(decl_scope, name, Symbol::Trait(id)).is_err() {
                            errors.push(self.err_at(&name_token, format!("redefinition of `{}`", name_token.text)));
                        }
                        pos += 2;
                    } else {
                        pos += 1;
                    }
                }
                _ => pos += 1,
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => {
                // Surface the first site; fold the rest into the message.
                let mut first = errors.remove(0);
                for err in &errors {
                    first.message.push_str(&format!("; also at {}:{}: {}", err.line, err.column, err.message));
                }
                Err(first)
            }
        }
    }

    /// Registers one `func NAME(params)` header during pre-scan. `pos` sits
    /// on the name token.
    fn pre_scan_func(&mut self, pos: &mut usize, scope: ScopeId) -> PResult<()> {
        let tokens = &self.cursor.tokens;
        if tokens[*pos].kind != TokenKind::Ident {
            return Ok(()); // the real parse reports the malformed header
        }
        let name_token = tokens[*pos].clone();
        *pos += 1;
        if tokens[*pos].kind != TokenKind::LParen {
            return Ok(());
        }
        *pos += 1;
        let mut params: SmallVec<[StringId; 4]> = SmallVec::new();
        let mut by_ref: u32 = 0;
        loop {
            match self.cursor.tokens[*pos].kind {
                TokenKind::RParen => {
                    *pos += 1;
                    break;
                }
                TokenKind::Comma | TokenKind::Eol => *pos += 1,
                TokenKind::Ref => {
                    if params.len() < 32 {
                        by_ref |= 1 << params.len();
                    }
                    *pos += 1;
                }
                TokenKind::Ident => {
                    let id = self.interns.intern(&self.cursor.tokens[*pos].text);
                    params.push(id);
                    *pos += 1;
                }
                _ => return Ok(()), // malformed; real parse reports it
            }
        }

        let base = self.interns.intern(&name_token.text);
        let mangled = self.interns.intern(&mangle(&name_token.text, params.len()));
        let arity = u8::try_from(params.len()).map_err(|_| self.err_at(&name_token, "too many parameters"))?;
        let decl = FunctionDecl {
            mangled,
            base_name: base,
            arity,
            params,
            by_ref,
            start: 0,
            end: 0,
            scope,
            registers: 0,
            is_lambda: false,
            intrinsic: None,
            owner: None,
        };
        if self.scopes.declare_function(scope, decl).is_err() {
            return Err(self.err_at(
                &name_token,
                format!("redefinition of `{}` with arity {arity}", name_token.text),
            ));
        }
        Ok(())
    }

    fn pre_scan_struct(&mut self, pos: &mut usize, scope: ScopeId) -> PResult<()> {
        let tokens = &self.cursor.tokens;
        if tokens[*pos].kind != TokenKind::Ident {
            return Ok(());
        }
        let name_token = tokens[*pos].clone();
        let name = self.interns.intern(&name_token.text);
        let struct_scope = self.scopes.new_scope(scope, Some(name));
        let id = StructId::new(self.scopes.structs.len());
        self.scopes.structs.push(StructDecl {
            name,
            scope: struct_scope,
            field_names: Vec::new(),
            defaults_fn: None,
            statics: ahash::AHashMap::new(),
            methods: ahash::AHashMap::new(),
            static_intrinsics: ahash::AHashMap::new(),
            traits: Vec::new(),
        });
        if self.scopes.declare(scope, name, Symbol::Struct(id)).is_err() {
            return Err(self.err_at(&name_token, format!("redefinition of `{}`", name_token.text)));
        }
        *pos += 1;
        Ok(())
    }

    fn pre_scan_enum(&mut self, pos: &mut usize, scope: ScopeId) -> PResult<()> {
        if self.cursor.tokens[*pos].kind != TokenKind::Ident {
            return Ok(());
        }
        let name_token = self.cursor.tokens[*pos].clone();
        let name = self.interns.intern(&name_token.text);
        *pos += 1;
        if self.cursor.tokens[*pos].kind != TokenKind::LBrace {
            return Ok(());
        }
        *pos += 1;
        let mut variants = indexmap::IndexMap::new();
        let mut next = 0i32;
        loop {
            match self.cursor.tokens[*pos].kind {
                TokenKind::RBrace => {
                    *pos += 1;
                    break;
                }
                TokenKind::Comma | TokenKind::Eol => *pos += 1,
                TokenKind::Ident => {
                    let id = self.interns.intern(&self.cursor.tokens[*pos].text);
                    if variants.insert(id, next).is_some() {
                        return Err(self.err_at(
                            &self.cursor.tokens[*pos],
                            format!("duplicate enum variant `{}`", self.cursor.tokens[*pos].text),
                        ));
                    }
                    next += 1;
                    *pos += 1;
                }
                _ => {
                    return Err(self.err_at(&self.cursor.tokens[*pos], "malformed enum body"));
                }
            }
        }
        let id = crate::scope::EnumId::new(self.scopes.enums.len());
        self.scopes.enums.push(EnumDecl { name, variants });
        if self.scopes.declare(scope, name, Symbol::Enum(id)).is_err() {
            return Err(self.err_at(&name_token, format!("redefinition of `{}`", name_token.text)));
        }
        Ok(())
    }

    // ==================================================================
    // Statements
    // ==================================================================

    fn parse_statement(&mut self) -> PResult<()> {
        let token = self.cursor.peek().clone();
        self.set_loc(&token);
        match token.kind {
            TokenKind::Func => self.parse_func_decl(),
            TokenKind::Struct => self.parse_struct_decl(),
            TokenKind::Enum => self.parse_enum_decl(),
            TokenKind::Space => self.parse_space(),
            TokenKind::Use => self.parse_use(),
            TokenKind::Solid => self.parse_solid(),
            TokenKind::If => self.parse_if(),
            TokenKind::Unless => self.parse_conditional(true),
            TokenKind::While => self.parse_while(false),
            TokenKind::Until => self.parse_while(true),
            TokenKind::Loop => self.parse_infinite_loop(),
            TokenKind::For => self.parse_for(),
            TokenKind::Return => self.parse_return(),
            TokenKind::Break => self.parse_break(),
            TokenKind::Continue => self.parse_continue(),
            TokenKind::Throw => self.parse_throw(),
            TokenKind::Train => self.parse_train(),
            TokenKind::HashIf => self.parse_hash_if(),
            TokenKind::DotInc => self.parse_dot_incdec(true),
            TokenKind::DotDec => self.parse_dot_incdec(false),
            TokenKind::Match => self.parse_match_any(),
            TokenKind::LBrace => self.parse_block(),
            TokenKind::Ident
                if &*token.text == "trait"
                    && self.cursor.peek_at(1).kind == TokenKind::Ident
                    && self.cursor.peek_at(2).kind == TokenKind::LBrace =>
            {
                self.parse_trait_decl()
            }
            TokenKind::Ident if &*token.text == "try" && self.cursor.peek_at(1).kind == TokenKind::LBrace => {
                self.parse_try()
            }
            _ => {
                self.parse_assign_core()?;
                self.expect_stmt_end()
            }
        }
    }

    fn parse_block(&mut self) -> PResult<()> {
        self.expect(TokenKind::LBrace, "`{`")?;
        self.begin_scope();
        loop {
            self.cursor.skip_eols();
            if self.cursor.check(TokenKind::RBrace) || self.cursor.check(TokenKind::Eof) {
                break;
            }
            self.parse_statement()?;
        }
        self.expect(TokenKind::RBrace, "`}`")?;
        self.end_scope();
        Ok(())
    }

    fn parse_if(&mut self) -> PResult<()> {
        self.cursor.next();
        self.parse_condition()?;
        let skip = self.b.emit_jump(Opcode::JumpIfFalse);
        self.parse_block()?;

        let saved = self.cursor.save();
        self.cursor.skip_eols();
        if self.cursor.eat(TokenKind::Else) {
            let done = self.b.emit_jump(Opcode::Jump);
            self.b.patch_jump(skip);
            if self.cursor.check(TokenKind::If) {
                self.parse_if()?;
            } else if self.cursor.check(TokenKind::Unless) {
                self.parse_conditional(true)?;
            } else {
                self.parse_block()?;
            }
            self.b.patch_jump(done);
        } else {
            self.cursor.restore(saved);
            self.b.patch_jump(skip);
        }
        Ok(())
    }

    /// `unless cond { … } [else { … }]`: `if` with the branch inverted.
    fn parse_conditional(&mut self, inverted: bool) -> PResult<()> {
        self.cursor.next();
        self.parse_condition()?;
        let skip = self
            .b
            .emit_jump(if inverted { Opcode::JumpIfTrue } else { Opcode::JumpIfFalse });
        self.parse_block()?;

        let saved = self.cursor.save();
        self.cursor.skip_eols();
        if self.cursor.eat(TokenKind::Else) {
            let done = self.b.emit_jump(Opcode::Jump);
            self.b.patch_jump(skip);
            self.parse_block()?;
            self.b.patch_jump(done);
        } else {
            self.cursor.restore(saved);
            self.b.patch_jump(skip);
        }
        Ok(())
    }

    /// Statement-root condition: collective comparisons are legal here.
    fn parse_condition(&mut self) -> PResult<()> {
        let prev = self.collective_ok;
        self.collective_ok = true;
        let result = self.parse_expression();
        self.collective_ok = prev;
        result
    }

    fn parse_while(&mut self, inverted: bool) -> PResult<()> {
        self.cursor.next();
        let cond_start = self.b.current_offset();
        self.parse_condition()?;
        let exit = self
            .b
            .emit_jump(if inverted { Opcode::JumpIfTrue } else { Opcode::JumpIfFalse });

        self.ctx().breaks.push(BreakCtx {
            is_loop: true,
            continue_target: Some(cond_start),
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });
        self.parse_block()?;
        self.b.emit_jump_to(Opcode::Jump, cond_start);
        self.b.patch_jump(exit);
        self.finish_break_ctx(None);
        Ok(())
    }

    fn parse_infinite_loop(&mut self) -> PResult<()> {
        self.cursor.next();
        let start = self.b.current_offset();
        self.ctx().breaks.push(BreakCtx {
            is_loop: true,
            continue_target: Some(start),
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });
        self.parse_block()?;
        self.b.emit_jump_to(Opcode::Jump, start);
        self.finish_break_ctx(None);
        Ok(())
    }

    /// Pops the innermost break context, patching breaks to the current
    /// offset and deferred continues to `continue_to` (or the recorded
    /// target).
    fn finish_break_ctx(&mut self, continue_to: Option<usize>) {
        let ctx = self.ctx().breaks.pop().expect("break context");
        for jump in ctx.break_jumps {
            self.b.patch_jump(jump);
        }
        if let Some(target) = continue_to.or(ctx.continue_target) {
            for jump in ctx.continue_jumps {
                self.b.patch_jump_to(jump, target);
            }
        }
    }

    fn parse_for(&mut self) -> PResult<()> {
        self.cursor.next();
        if self.cursor.check(TokenKind::Ident) && self.cursor.peek_at(1).kind == TokenKind::In {
            return self.parse_for_in();
        }
        self.parse_for_c_style()
    }

    fn parse_for_in(&mut self) -> PResult<()> {
        let name_token = self.expect(TokenKind::Ident, "loop variable")?;
        let name = self.intern_token(&name_token);
        self.expect(TokenKind::In, "`in`")?;
        self.parse_expression()?;

        self.begin_scope();
        self.b.emit(Opcode::NewIterator);
        let iter_slot = self.alloc_temp();
        self.b.emit_store_local(iter_slot);
        let var_slot = self.declare_local(name);

        let loop_start = self.b.emit3(
            Opcode::IteratorNext,
            Operand::Int(i64::from(iter_slot)),
            Operand::Int(i64::from(var_slot)),
            Operand::Int(0),
        );
        self.ctx().breaks.push(BreakCtx {
            is_loop: true,
            continue_target: Some(loop_start),
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });
        self.parse_block()?;
        self.b.emit_jump_to(Opcode::Jump, loop_start);
        let done = self.b.current_offset();
        self.b.instrs[loop_start].set_jump_target(done);
        self.finish_break_ctx(None);
        self.end_scope();
        Ok(())
    }

    fn parse_for_c_style(&mut self) -> PResult<()> {
        self.begin_scope();
        self.parse_assign_core()?;
        self.expect(TokenKind::Eol, "`;` after for-loop initializer")?;

        let cond_start = self.b.current_offset();
        self.parse_expression()?;
        let exit = self.b.emit_jump(Opcode::JumpIfFalse);
        self.expect(TokenKind::Eol, "`;` after for-loop condition")?;

        let incr_range = self.scan_until_lbrace()?;
        self.cursor.restore(incr_range.end);

        self.ctx().breaks.push(BreakCtx {
            is_loop: true,
            continue_target: None,
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });
        self.parse_block()?;

        let incr_at = self.b.current_offset();
        self.replay_statement(incr_range)?;
        self.b.emit_jump_to(Opcode::Jump, cond_start);
        self.b.patch_jump(exit);
        self.finish_break_ctx(Some(incr_at));
        self.end_scope();
        Ok(())
    }

    /// Scans from the cursor to the `{` opening the loop body, returning the
    /// covered token range (exclusive of the brace) without consuming it.
    fn scan_until_lbrace(&mut self) -> PResult<TokenRange> {
        let start = self.cursor.save();
        let mut pos = start;
        let mut depth = 0u32;
        loop {
            match self.cursor.tokens[pos].kind {
                TokenKind::LParen | TokenKind::LBracket => depth += 1,
                TokenKind::RParen | TokenKind::RBracket => depth = depth.saturating_sub(1),
                TokenKind::LBrace if depth == 0 => return Ok(TokenRange { start, end: pos }),
                TokenKind::Eof => return Err(self.err_here("expected `{` to open loop body")),
                _ => {}
            }
            pos += 1;
        }
    }

    /// Re-parses a saved token range as a statement core (no terminator).
    fn replay_statement(&mut self, range: TokenRange) -> PResult<()> {
        let saved = self.cursor.save();
        self.cursor.restore(range.start);
        self.replay_depth += 1;
        if self.replay_depth > 64 {
            return Err(self.err_here("replay nesting too deep"));
        }
        let result = self.parse_assign_core();
        self.replay_depth -= 1;
        self.cursor.restore(saved);
        result
    }

    /// Re-parses a saved token range as an expression.
    fn replay_expression(&mut self, range: TokenRange) -> PResult<()> {
        let saved = self.cursor.save();
        self.cursor.restore(range.start);
        self.replay_depth += 1;
        if self.replay_depth > 64 {
            return Err(self.err_here("replay nesting too deep"));
        }
        let result = self.parse_expression();
        self.replay_depth -= 1;
        if result.is_ok() && self.cursor.save() != range.end {
            let token = self.cursor.peek().clone();
            self.cursor.restore(saved);
            return Err(self.err_at(&token, "unexpected token in replayed expression"));
        }
        self.cursor.restore(saved);
        result
    }

    fn parse_return(&mut self) -> PResult<()> {
        self.cursor.next();
        if matches!(self.cursor.peek_kind(), TokenKind::Eol | TokenKind::RBrace | TokenKind::Eof) {
            self.b.emit_const(Value::Nil);
        } else {
            self.parse_expression()?;
        }
        self.b.emit(Opcode::Return);
        self.expect_stmt_end()
    }

    fn parse_break(&mut self) -> PResult<()> {
        let token = self.cursor.next();
        if self.ctx_ref().breaks.is_empty() {
            return Err(self.err_at(&token, "`break` outside loop or match"));
        }
        let jump = self.b.emit_jump(Opcode::Jump);
        self.ctx().breaks.last_mut().expect("checked non-empty").break_jumps.push(jump);
        self.expect_stmt_end()
    }

    fn parse_continue(&mut self) -> PResult<()> {
        let token = self.cursor.next();
        let target = {
            let ctx = self.ctx_ref();
            let Some(index) = ctx.breaks.iter().rposition(|b| b.is_loop) else {
                return Err(self.err_at(&token, "`continue` outside loop"));
            };
            (index, ctx.breaks[index].continue_target)
        };
        match target.1 {
            Some(at) => {
                self.b.emit_jump_to(Opcode::Jump, at);
            }
            None => {
                let jump = self.b.emit_jump(Opcode::Jump);
                self.ctx().breaks[target.0].continue_jumps.push(jump);
            }
        }
        self.expect_stmt_end()
    }

    fn parse_throw(&mut self) -> PResult<()> {
        self.cursor.next();
        self.parse_expression()?;
        self.b.emit(Opcode::Throw);
        self.expect_stmt_end()
    }

    /// `try { … } catch err { … }` over the VM's unwind machinery.
    fn parse_try(&mut self) -> PResult<()> {
        self.cursor.next(); // `try`
        let enter = self.b.emit_jump(Opcode::TryEnter);
        self.parse_block()?;
        self.b.emit(Opcode::TryLeave);
        let done = self.b.emit_jump(Opcode::Jump);

        self.b.patch_jump(enter);
        self.cursor.skip_eols();
        let catch = self.expect(TokenKind::Ident, "`catch`")?;
        if &*catch.text != "catch" {
            return Err(self.err_at(&catch, "expected `catch` after try block"));
        }
        let name_token = self.expect(TokenKind::Ident, "exception variable")?;
        let name = self.intern_token(&name_token);
        self.begin_scope();
        let slot = self.declare_local(name);
        self.b.emit_store_local(slot);
        self.parse_block()?;
        self.end_scope();
        self.b.patch_jump(done);
        Ok(())
    }

    fn parse_hash_if(&mut self) -> PResult<()> {
        self.cursor.next();
        let symbol = self.expect(TokenKind::Ident, "compilation symbol")?;
        if self.options.symbols.contains(&*symbol.text) {
            return self.parse_block();
        }
        // Symbol absent: skip the balanced block textually.
        self.expect(TokenKind::LBrace, "`{`")?;
        let mut depth = 1u32;
        while depth > 0 {
            match self.cursor.next().kind {
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => depth -= 1,
                TokenKind::Eof => return Err(self.err_here("unbalanced braces in #IF block")),
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_use(&mut self) -> PResult<()> {
        self.cursor.next();
        let name_token = self.expect(TokenKind::Ident, "namespace name")?;
        let name = self.intern_token(&name_token);
        match self.scopes.resolve(self.current_scope(), name) {
            Some(Symbol::Namespace(ns)) => {
                let scope = self.current_scope();
                let uses = &mut self.scopes.scope_mut(scope).uses;
                if !uses.contains(&ns) {
                    uses.push(ns);
                }
                self.expect_stmt_end()
            }
            _ => Err(self.err_at(&name_token, format!("unknown namespace `{}`", name_token.text))),
        }
    }

    fn parse_space(&mut self) -> PResult<()> {
        self.cursor.next();
        let name_token = self.expect(TokenKind::Ident, "namespace name")?;
        let name = self.intern_token(&name_token);
        let Some(Symbol::Namespace(ns)) = self.scopes.resolve_local(self.decl_scope, name) else {
            return Err(self.err_at(&name_token, "namespace was not registered by the pre-scan"));
        };
        self.expect(TokenKind::LBrace, "`{`")?;
        let outer = self.decl_scope;
        self.decl_scope = ns;
        loop {
            self.cursor.skip_eols();
            if self.cursor.check(TokenKind::RBrace) || self.cursor.check(TokenKind::Eof) {
                break;
            }
            self.parse_statement()?;
        }
        self.expect(TokenKind::RBrace, "`}`")?;
        self.decl_scope = outer;
        Ok(())
    }

    fn parse_solid(&mut self) -> PResult<()> {
        self.cursor.next();
        let name_token = self.expect(TokenKind::Ident, "constant name")?;
        let name = self.intern_token(&name_token);
        self.expect(TokenKind::Assign, "`=`")?;
        self.parse_expression()?;
        let slot = self
            .scopes
            .declare_global_var(self.decl_scope, name, true)
            .map_err(|_| self.err_at(&name_token, format!("redefinition of `{}`", name_token.text)))?;
        self.b
            .emit2(Opcode::StoreGlobal, Operand::Int(i64::from(slot)), Operand::Str(name));
        self.expect_stmt_end()
    }

    fn parse_dot_incdec(&mut self, increment: bool) -> PResult<()> {
        self.cursor.next(); // `.++(` / `.--(`
        loop {
            let name_token = self.expect(TokenKind::Ident, "variable name")?;
            let name = self.intern_token(&name_token);
            self.emit_var_load(name, &name_token)?;
            self.b.emit_const(Value::Int(1));
            self.b.emit(if increment { Opcode::Add } else { Opcode::Sub });
            self.emit_var_store(name, &name_token)?;
            if !self.cursor.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        self.expect_stmt_end()
    }

    fn parse_train(&mut self) -> PResult<()> {
        self.cursor.next(); // leading `->>`
        loop {
            self.cursor.skip_eols();
            self.parse_statement()?;
            self.cursor.skip_eols();
            if self.cursor.eat(TokenKind::TrainEnd) {
                break;
            }
            self.expect(TokenKind::Train, "`->>` or `<<-`")?;
        }
        self.expect_stmt_end()
    }

    // ==================================================================
    // Declarations: functions, structs, traits, enums
    // ==================================================================

    /// Parses a `func` header, returning `(name token, params, by_ref)`.
    fn parse_func_header(&mut self) -> PResult<(Token, SmallVec<[StringId; 4]>, u32)> {
        let name_token = self.expect(TokenKind::Ident, "function name")?;
        self.expect(TokenKind::LParen, "`(`")?;
        let mut params: SmallVec<[StringId; 4]> = SmallVec::new();
        let mut by_ref = 0u32;
        self.cursor.skip_eols();
        if !self.cursor.check(TokenKind::RParen) {
            loop {
                self.cursor.skip_eols();
                if self.cursor.eat(TokenKind::Ref) {
                    if params.len() < 32 {
                        by_ref |= 1 << params.len();
                    }
                }
                let param = self.expect(TokenKind::Ident, "parameter name")?;
                params.push(self.intern_token(&param));
                self.cursor.skip_eols();
                if !self.cursor.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        Ok((name_token, params, by_ref))
    }

    /// Top-level or namespace `func` declaration. The symbol normally exists
    /// from the pre-scan; function statements nested inside other bodies
    /// declare fresh.
    fn parse_func_decl(&mut self) -> PResult<()> {
        self.cursor.next();
        let (name_token, params, by_ref) = self.parse_func_header()?;
        let mangled = self.interns.intern(&mangle(&name_token.text, params.len()));

        let fid = match self.scopes.resolve_local(self.decl_scope, mangled) {
            Some(Symbol::Func(fid)) if self.scopes.function(fid).start == 0 => fid,
            Some(Symbol::Func(_)) | Some(_) if self.at_top_level() => {
                return Err(self.err_at(
                    &name_token,
                    format!("redefinition of `{}` with arity {}", name_token.text, params.len()),
                ));
            }
            _ => {
                let base = self.intern_token(&name_token);
                let arity = u8::try_from(params.len()).map_err(|_| self.err_at(&name_token, "too many parameters"))?;
                let decl = FunctionDecl {
                    mangled,
                    base_name: base,
                    arity,
                    params: params.clone(),
                    by_ref,
                    start: 0,
                    end: 0,
                    scope: self.decl_scope,
                    registers: 0,
                    is_lambda: false,
                    intrinsic: None,
                    owner: None,
                };
                self.scopes.declare_function(self.decl_scope, decl).map_err(|_| {
                    self.err_at(
                        &name_token,
                        format!("redefinition of `{}` with arity {}", name_token.text, params.len()),
                    )
                })?
            }
        };
        self.parse_function_body(fid, false)?;
        self.expect_stmt_end()
    }

    /// Emits a function body inline, bracketed by `EnterFrame`/`Return` and
    /// jumped over by the surrounding code. Patches the declaration's
    /// addresses and register count.
    fn parse_function_body(&mut self, fid: FunctionId, with_self: bool) -> PResult<()> {
        let over = self.b.emit_jump(Opcode::Jump);
        let start = self.b.current_offset();
        let enter_frame_at = self.b.emit1(Opcode::EnterFrame, Operand::Int(0));

        let (scope, owner, params) = {
            let decl = self.scopes.function(fid);
            (decl.scope, decl.owner, decl.params.clone())
        };
        self.funcs.push(FuncCtx {
            decl: fid,
            scope,
            owner,
            locals: Vec::new(),
            next_slot: 0,
            max_slots: 0,
            depth: 0,
            breaks: Vec::new(),
            enter_frame_at,
        });
        if with_self {
            let self_name = self.interns.intern("self");
            self.declare_local(self_name);
        }
        for &param in &params {
            self.declare_local(param);
        }

        self.expect(TokenKind::FatArrow, "`=>`")?;
        if self.cursor.check(TokenKind::LBrace) {
            self.parse_block()?;
            self.b.emit_const(Value::Nil);
        } else {
            self.parse_expression()?;
        }
        let end = self.b.emit(Opcode::Return);

        let ctx = self.funcs.pop().expect("function context");
        self.b.instrs[ctx.enter_frame_at].lhs = Operand::Int(i64::from(ctx.max_slots));
        let decl = self.scopes.function_mut(fid);
        decl.start = start;
        decl.end = end;
        decl.registers = ctx.max_slots;
        self.b.patch_jump(over);
        Ok(())
    }

    fn parse_struct_decl(&mut self) -> PResult<()> {
        self.cursor.next();
        let name_token = self.expect(TokenKind::Ident, "struct name")?;
        let name = self.intern_token(&name_token);
        let Some(Symbol::Struct(sid)) = self.scopes.resolve_local(self.decl_scope, name) else {
            return Err(self.err_at(&name_token, "struct was not registered by the pre-scan"));
        };
        let struct_scope = self.scopes.strukt(sid).scope;

        let mut trait_ids: Vec<TraitId> = Vec::new();
        if self.cursor.eat(TokenKind::Impl) {
            loop {
                let trait_token = self.expect(TokenKind::Ident, "trait name")?;
                let trait_name = self.intern_token(&trait_token);
                match self.scopes.resolve(self.decl_scope, trait_name) {
                    Some(Symbol::Trait(tid)) => trait_ids.push(tid),
                    _ => return Err(self.err_at(&trait_token, format!("unknown trait `{}`", trait_token.text))),
                }
                if !self.cursor.eat(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.expect(TokenKind::LBrace, "`{`")?;
        let mut defaults: Vec<(StringId, TokenRange)> = Vec::new();
        loop {
            self.cursor.skip_eols();
            match self.cursor.peek_kind() {
                TokenKind::RBrace => break,
                TokenKind::Func => {
                    self.cursor.next();
                    let (m_token, m_params, m_by_ref) = self.parse_func_header()?;
                    let m_base = self.intern_token(&m_token);
                    let m_mangled = self.interns.intern(&mangle(&m_token.text, m_params.len()));
                    let arity =
                        u8::try_from(m_params.len()).map_err(|_| self.err_at(&m_token, "too many parameters"))?;
                    let decl = FunctionDecl {
                        mangled: m_mangled,
                        base_name: m_base,
                        arity,
                        params: m_params,
                        by_ref: m_by_ref,
                        start: 0,
                        end: 0,
                        scope: struct_scope,
                        registers: 0,
                        is_lambda: false,
                        intrinsic: None,
                        owner: Some(sid),
                    };
                    let fid = self.scopes.declare_function(struct_scope, decl).map_err(|_| {
                        self.err_at(&m_token, format!("redefinition of method `{}`", m_token.text))
                    })?;
                    self.scopes.strukt_mut(sid).methods.insert(m_mangled, fid);
                    self.parse_function_body(fid, true)?;
                }
                TokenKind::Solid => {
                    self.cursor.next();
                    let s_token = self.expect(TokenKind::Ident, "static name")?;
                    let s_name = self.intern_token(&s_token);
                    self.expect(TokenKind::Assign, "`=`")?;
                    self.parse_expression()?;
                    let slot = self.scopes.alloc_global_slot();
                    self.b
                        .emit2(Opcode::StoreGlobal, Operand::Int(i64::from(slot)), Operand::Str(s_name));
                    if self.scopes.strukt_mut(sid).statics.insert(s_name, slot).is_some() {
                        return Err(self.err_at(&s_token, format!("redefinition of static `{}`", s_token.text)));
                    }
                }
                TokenKind::Ident => {
                    let f_token = self.cursor.next();
                    let f_name = self.intern_token(&f_token);
                    if self.scopes.strukt(sid).field_names.contains(&f_name) {
                        return Err(self.err_at(&f_token, format!("duplicate field `{}`", f_token.text)));
                    }
                    if self.cursor.eat(TokenKind::Assign) {
                        let range = self.scan_expression_extent()?;
                        self.cursor.restore(range.end);
                        defaults.push((f_name, range));
                    }
                    self.scopes.strukt_mut(sid).field_names.push(f_name);
                }
                _ => return Err(self.unexpected("struct member")),
            }
        }
        self.expect(TokenKind::RBrace, "`}`")?;

        // Trait conformance: absorb defaults, check requirements.
        for tid in trait_ids {
            let (required_fields, required_funcs, default_fields, default_methods) = {
                let t = self.scopes.trait_decl(tid);
                (
                    t.required_fields.clone(),
                    t.required_funcs.clone(),
                    t.default_fields.clone(),
                    t.default_methods.clone(),
                )
            };
            for field in required_fields {
                if !self.scopes.strukt(sid).field_names.contains(&field) {
                    let trait_name = self.interns.get(self.scopes.trait_decl(tid).name).to_owned();
                    let field_name = self.interns.get(field).to_owned();
                    return Err(self.err_at(
                        &name_token,
                        format!("struct `{}` is missing field `{field_name}` required by trait `{trait_name}`", name_token.text),
                    ));
                }
            }
            for (field, range) in default_fields {
                if !self.scopes.strukt(sid).field_names.contains(&field) {
                    self.scopes.strukt_mut(sid).field_names.push(field);
                    defaults.push((field, range));
                }
            }
            for (base, arity) in required_funcs {
                let mangled = {
                    let base_str = self.interns.get(base).to_owned();
                    self.interns.intern(&mangle(&base_str, arity as usize))
                };
                if self.scopes.strukt(sid).methods.contains_key(&mangled) {
                    continue;
                }
                if let Some(&default_fid) = default_methods.get(&mangled) {
                    self.scopes.strukt_mut(sid).methods.insert(mangled, default_fid);
                    self.scopes
                        .declare(struct_scope, mangled, Symbol::Func(default_fid))
                        .ok();
                    continue;
                }
                let trait_name = self.interns.get(self.scopes.trait_decl(tid).name).to_owned();
                let base_str = self.interns.get(base).to_owned();
                return Err(self.err_at(
                    &name_token,
                    format!(
                        "struct `{}` is missing `{base_str}` (arity {arity}) required by trait `{trait_name}`",
                        name_token.text
                    ),
                ));
            }
            self.scopes.strukt_mut(sid).traits.push(tid);
        }

        if !defaults.is_empty() {
            let fid = self.emit_defaults_initializer(sid, struct_scope, &defaults)?;
            self.scopes.strukt_mut(sid).defaults_fn = Some(fid);
        }
        Ok(())
    }

    /// Hidden initializer storing default field values into a fresh instance
    /// passed in slot 0. Ends with `LeaveFrame`: callers keep their own copy
    /// of the instance on the stack and expect no pushed result.
    fn emit_defaults_initializer(
        &mut self,
        sid: StructId,
        struct_scope: ScopeId,
        defaults: &[(StringId, TokenRange)],
    ) -> PResult<FunctionId> {
        let base = self.interns.intern("<defaults>");
        let struct_name = self.scopes.strukt(sid).name;
        let mangled = {
            let name_str = self.interns.get(struct_name).to_owned();
            self.interns.intern(&mangle(&format!("<defaults:{name_str}>"), 1))
        };
        let fid = FunctionId::new(self.scopes.functions.len());
        self.scopes.functions.push(FunctionDecl {
            mangled,
            base_name: base,
            arity: 1,
            params: SmallVec::new(),
            by_ref: 0,
            start: 0,
            end: 0,
            scope: struct_scope,
            registers: 0,
            is_lambda: false,
            intrinsic: None,
            owner: Some(sid),
        });

        let over = self.b.emit_jump(Opcode::Jump);
        let start = self.b.current_offset();
        let enter_frame_at = self.b.emit1(Opcode::EnterFrame, Operand::Int(0));
        self.funcs.push(FuncCtx {
            decl: fid,
            scope: struct_scope,
            owner: Some(sid),
            locals: Vec::new(),
            next_slot: 0,
            max_slots: 0,
            depth: 0,
            breaks: Vec::new(),
            enter_frame_at,
        });
        let self_name = self.interns.intern("self");
        self.declare_local(self_name);

        for &(field, range) in defaults {
            self.b.emit_load_local(0);
            self.replay_expression(range)?;
            self.b.emit1(Opcode::StoreField, Operand::Str(field));
        }
        let end = self.b.emit(Opcode::LeaveFrame);

        let ctx = self.funcs.pop().expect("defaults context");
        self.b.instrs[ctx.enter_frame_at].lhs = Operand::Int(i64::from(ctx.max_slots));
        let decl = self.scopes.function_mut(fid);
        decl.start = start;
        decl.end = end;
        decl.registers = ctx.max_slots;
        self.b.patch_jump(over);
        Ok(fid)
    }

    fn parse_trait_decl(&mut self) -> PResult<()> {
        self.cursor.next(); // `trait`
        let name_token = self.expect(TokenKind::Ident, "trait name")?;
        let name = self.intern_token(&name_token);
        let Some(Symbol::Trait(tid)) = self.scopes.resolve_local(self.decl_scope, name) else {
            return Err(self.err_at(&name_token, "trait was not registered by the pre-scan"));
        };

        self.expect(TokenKind::LBrace, "`{`")?;
        loop {
            self.cursor.skip_eols();
            match self.cursor.peek_kind() {
                TokenKind::RBrace => break,
                TokenKind::Func => {
                    self.cursor.next();
                    let (m_token, m_params, m_by_ref) = self.parse_func_header()?;
                    let m_base = self.intern_token(&m_token);
                    let arity =
                        u8::try_from(m_params.len()).map_err(|_| self.err_at(&m_token, "too many parameters"))?;
                    if self.cursor.check(TokenKind::FatArrow) {
                        // Default implementation, compiled once and shared.
                        let m_mangled = self.interns.intern(&mangle(&m_token.text, m_params.len()));
                        let fid = FunctionId::new(self.scopes.functions.len());
                        self.scopes.functions.push(FunctionDecl {
                            mangled: m_mangled,
                            base_name: m_base,
                            arity,
                            params: m_params,
                            by_ref: m_by_ref,
                            start: 0,
                            end: 0,
                            scope: self.decl_scope,
                            registers: 0,
                            is_lambda: false,
                            intrinsic: None,
                            owner: None,
                        });
                        self.parse_function_body(fid, true)?;
                        self.scopes.traits[tid.index()].default_methods.insert(m_mangled, fid);
                    } else {
                        self.scopes.traits[tid.index()].required_funcs.push((m_base, arity));
                    }
                }
                TokenKind::Ident => {
                    let f_token = self.cursor.next();
                    let f_name = self.intern_token(&f_token);
                    if self.cursor.eat(TokenKind::Assign) {
                        let range = self.scan_expression_extent()?;
                        self.cursor.restore(range.end);
                        self.scopes.traits[tid.index()].default_fields.push((f_name, range));
                    } else {
                        self.scopes.traits[tid.index()].required_fields.push(f_name);
                    }
                }
                _ => return Err(self.unexpected("trait member")),
            }
        }
        self.expect(TokenKind::RBrace, "`}`")?;
        Ok(())
    }

    fn parse_enum_decl(&mut self) -> PResult<()> {
        // Fully registered during pre-scan; skip the body.
        self.cursor.next();
        self.expect(TokenKind::Ident, "enum name")?;
        self.expect(TokenKind::LBrace, "`{`")?;
        let mut depth = 1u32;
        while depth > 0 {
            match self.cursor.next().kind {
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => depth -= 1,
                TokenKind::Eof => return Err(self.err_here("unterminated enum body")),
                _ => {}
            }
        }
        Ok(())
    }

    /// Scans an expression's token extent (to `Eol`, `,`, or a closing
    /// delimiter at depth zero) without consuming it.
    fn scan_expression_extent(&mut self) -> PResult<TokenRange> {
        let start = self.cursor.save();
        let mut pos = start;
        let mut depth = 0u32;
        loop {
            match self.cursor.tokens[pos].kind {
                TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => depth += 1,
                TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace if depth == 0 => {
                    return Ok(TokenRange { start, end: pos });
                }
                TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => depth -= 1,
                TokenKind::Eol | TokenKind::Eof if depth == 0 => return Ok(TokenRange { start, end: pos }),
                TokenKind::Comma if depth == 0 => return Ok(TokenRange { start, end: pos }),
                TokenKind::Eof => return Err(self.err_here("unterminated expression")),
                _ => {}
            }
            pos += 1;
        }
    }

    // ==================================================================
    // Assignment statements and the chain/guard/broadcast lowerings
    // ==================================================================

    fn parse_assign_core(&mut self) -> PResult<()> {
        let save = self.cursor.save();
        if let Some((targets, op)) = self.try_parse_targets() {
            return self.dispatch_assign(&targets, &op);
        }
        self.cursor.restore(save);
        if self.try_parse_broadcast()? {
            return Ok(());
        }
        self.cursor.restore(save);

        let prev = self.collective_ok;
        self.collective_ok = true;
        let result = self.parse_expression();
        self.collective_ok = prev;
        result?;
        if self.cursor.check(TokenKind::Times) {
            return self.parse_times_loop();
        }
        self.b.emit(Opcode::Pop);
        Ok(())
    }

    fn is_assign_family(kind: TokenKind) -> bool {
        matches!(
            kind,
            TokenKind::Assign
                | TokenKind::PlusEq
                | TokenKind::MinusEq
                | TokenKind::StarEq
                | TokenKind::SlashEq
                | TokenKind::PercentEq
                | TokenKind::AmpEq
                | TokenKind::SeqAssign
                | TokenKind::SeqAssignNil
                | TokenKind::ChainAssignAll
                | TokenKind::ChainAssignN
                | TokenKind::OptionalAssignN
                | TokenKind::UniqueChainAssignN
                | TokenKind::OptionalUniqueAssignN
                | TokenKind::GuardAnd
                | TokenKind::GuardOr
                | TokenKind::DotPlusEq
                | TokenKind::DotMinusEq
                | TokenKind::DotStarEq
                | TokenKind::DotSlashEq
                | TokenKind::DotPercentEq
                | TokenKind::Swap
        )
    }

    /// Speculatively parses a comma-separated assignment-target list followed
    /// by an assignment-family operator. Consumes nothing useful on `None`
    /// (the caller restores the cursor).
    fn try_parse_targets(&mut self) -> Option<(Vec<Target>, Token)> {
        let mut targets = Vec::new();
        loop {
            let target = self.try_parse_one_target()?;
            targets.push(target);
            if !self.cursor.eat(TokenKind::Comma) {
                break;
            }
        }
        if Self::is_assign_family(self.cursor.peek_kind()) {
            let op = self.cursor.next();
            return Some((targets, op));
        }
        None
    }

    fn try_parse_one_target(&mut self) -> Option<Target> {
        let token = self.cursor.peek().clone();
        let head = match token.kind {
            TokenKind::Ident => {
                self.cursor.next();
                PathHead::Name(self.interns.intern(&token.text))
            }
            TokenKind::SelfKw => {
                self.cursor.next();
                PathHead::SelfRef
            }
            _ => return None,
        };
        let mut accessors: SmallVec<[Accessor; 2]> = SmallVec::new();
        loop {
            if self.cursor.check(TokenKind::Dot) && self.cursor.peek_at(1).kind == TokenKind::Ident {
                self.cursor.next();
                let field = self.cursor.next();
                accessors.push(Accessor::Field(self.interns.intern(&field.text)));
            } else if self.cursor.check(TokenKind::LBracket) {
                self.cursor.next();
                let start = self.cursor.save();
                let mut depth = 1u32;
                loop {
                    match self.cursor.peek_kind() {
                        TokenKind::LBracket => depth += 1,
                        TokenKind::RBracket => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        TokenKind::Eof | TokenKind::Eol => return None,
                        _ => {}
                    }
                    self.cursor.next();
                }
                let end = self.cursor.save();
                self.cursor.next(); // closing `]`
                accessors.push(Accessor::Index(TokenRange { start, end }));
            } else {
                break;
            }
        }
        Some(Target {
            head,
            accessors,
            line: token.line,
            column: token.column,
        })
    }

    fn dispatch_assign(&mut self, targets: &[Target], op: &Token) -> PResult<()> {
        self.b.set_location(op.line, op.column, op.file_index);
        match op.kind {
            TokenKind::Assign => {
                if targets.len() != 1 {
                    return Err(self.err_at(op, "`=` takes one target; use `<~|` for sequential assignment"));
                }
                self.parse_assign_rhs()?;
                self.store_target(&targets[0])
            }
            TokenKind::PlusEq
            | TokenKind::MinusEq
            | TokenKind::StarEq
            | TokenKind::SlashEq
            | TokenKind::PercentEq
            | TokenKind::AmpEq => {
                if targets.len() != 1 {
                    return Err(self.err_at(op, "compound assignment takes one target"));
                }
                let binop = Self::compound_op(op.kind);
                self.emit_compound_assign(&targets[0], binop)
            }
            TokenKind::Swap => {
                if targets.len() != 1 {
                    return Err(self.err_at(op, "`><` swaps exactly two variables"));
                }
                let Some(second) = self.try_parse_one_target() else {
                    return Err(self.err_here("expected variable after `><`"));
                };
                self.emit_target_load(&targets[0])?;
                self.emit_target_load(&second)?;
                self.store_target(&targets[0])?;
                self.store_target(&second)
            }
            TokenKind::SeqAssign => self.emit_sequential_assign(targets, false),
            TokenKind::SeqAssignNil => self.emit_sequential_assign(targets, true),
            TokenKind::ChainAssignAll => {
                self.emit_chain_assign(targets, targets.len(), false, false, op)
            }
            TokenKind::ChainAssignN => {
                self.emit_chain_assign(targets, op.count() as usize, false, false, op)
            }
            TokenKind::OptionalAssignN => {
                self.emit_chain_assign(targets, op.count() as usize, true, false, op)
            }
            TokenKind::UniqueChainAssignN => {
                self.emit_chain_assign(targets, op.count() as usize, false, true, op)
            }
            TokenKind::OptionalUniqueAssignN => {
                self.emit_chain_assign(targets, op.count() as usize, true, true, op)
            }
            TokenKind::GuardAnd => self.emit_guard_chain(targets, op, Opcode::JumpIfFalse),
            TokenKind::GuardOr => self.emit_guard_chain(targets, op, Opcode::JumpIfTrue),
            TokenKind::DotPlusEq
            | TokenKind::DotMinusEq
            | TokenKind::DotStarEq
            | TokenKind::DotSlashEq
            | TokenKind::DotPercentEq => {
                let binop = Self::compound_op(op.kind);
                self.emit_parallel_op_assign(targets, binop)
            }
            _ => unreachable!("dispatch_assign on non-assignment token {:?}", op.kind),
        }
    }

    fn compound_op(kind: TokenKind) -> Opcode {
        match kind {
            TokenKind::PlusEq | TokenKind::DotPlusEq => Opcode::Add,
            TokenKind::MinusEq | TokenKind::DotMinusEq => Opcode::Sub,
            TokenKind::StarEq | TokenKind::DotStarEq => Opcode::Mul,
            TokenKind::SlashEq | TokenKind::DotSlashEq => Opcode::Div,
            TokenKind::PercentEq | TokenKind::DotPercentEq => Opcode::Mod,
            TokenKind::AmpEq => Opcode::BitAnd,
            _ => unreachable!("not a compound assignment: {kind:?}"),
        }
    }

    /// Assignment right-hand sides allow collective comparisons.
    fn parse_assign_rhs(&mut self) -> PResult<()> {
        let prev = self.collective_ok;
        self.collective_ok = true;
        let result = self.parse_expression();
        self.collective_ok = prev;
        result
    }

    /// `a1, …, aN <~| e1, …, eN`: pairwise sequential assignment. The nil
    /// variant skips a target when its expression evaluates to nil.
    fn emit_sequential_assign(&mut self, targets: &[Target], skip_nil: bool) -> PResult<()> {
        for (index, target) in targets.iter().enumerate() {
            if index > 0 {
                self.expect(TokenKind::Comma, "`,` between assignment values")?;
            }
            if skip_nil {
                self.predeclare_target(target)?;
            }
            self.parse_expression()?;
            if skip_nil {
                self.b.emit(Opcode::Dup);
                let skip = self.b.emit_jump(Opcode::JumpIfNil);
                self.store_target(target)?;
                let done = self.b.emit_jump(Opcode::Jump);
                self.b.patch_jump(skip);
                self.b.emit(Opcode::Pop);
                self.b.patch_jump(done);
            } else {
                self.store_target(target)?;
            }
        }
        if self.cursor.check(TokenKind::Comma) {
            return Err(self.err_here("more values than assignment targets"));
        }
        Ok(())
    }

    /// The `<n|` family: each right-hand-side chunk covers `n` targets.
    /// `unique` re-evaluates the chunk expression once per target;
    /// `optional` gates each store on the value being non-nil.
    fn emit_chain_assign(
        &mut self,
        targets: &[Target],
        chunk: usize,
        optional: bool,
        unique: bool,
        op: &Token,
    ) -> PResult<()> {
        if chunk == 0 {
            return Err(self.err_at(op, "chain-assignment chunk size must be positive"));
        }
        if targets.len() % chunk != 0 {
            return Err(self.err_at(
                op,
                format!("{} targets cannot be split into chunks of {chunk}", targets.len()),
            ));
        }
        if optional {
            for target in targets {
                self.predeclare_target(target)?;
            }
        }
        let chunks = targets.len() / chunk;
        for index in 0..chunks {
            if index > 0 {
                self.expect(TokenKind::Comma, "`,` between assignment values")?;
            }
            let group = &targets[index * chunk..(index + 1) * chunk];
            if unique {
                let range = self.scan_expression_extent()?;
                self.cursor.restore(range.end);
                for target in group {
                    self.replay_expression(range)?;
                    if optional {
                        self.b.emit(Opcode::Dup);
                        let skip = self.b.emit_jump(Opcode::JumpIfNil);
                        self.store_target(target)?;
                        let done = self.b.emit_jump(Opcode::Jump);
                        self.b.patch_jump(skip);
                        self.b.emit(Opcode::Pop);
                        self.b.patch_jump(done);
                    } else {
                        self.store_target(target)?;
                    }
                }
            } else {
                self.parse_expression()?;
                if optional {
                    // A nil value skips the whole chunk.
                    self.b.emit(Opcode::Dup);
                    let skip = self.b.emit_jump(Opcode::JumpIfNil);
                    for (i, target) in group.iter().enumerate() {
                        if i + 1 < group.len() {
                            self.b.emit(Opcode::Dup);
                        }
                        self.store_target(target)?;
                    }
                    let done = self.b.emit_jump(Opcode::Jump);
                    self.b.patch_jump(skip);
                    self.b.emit(Opcode::Pop);
                    self.b.patch_jump(done);
                } else {
                    for (i, target) in group.iter().enumerate() {
                        if i + 1 < group.len() {
                            self.b.emit(Opcode::Dup);
                        }
                        self.store_target(target)?;
                    }
                }
            }
        }
        if self.cursor.check(TokenKind::Comma) {
            return Err(self.err_here("more values than assignment chunks"));
        }
        Ok(())
    }

    /// `var <??| e1, e2, …` lowers to `var = e1 && e2 && …` with
    /// short-circuit (the `<||??|` form uses `||`).
    fn emit_guard_chain(&mut self, targets: &[Target], op: &Token, short_circuit: Opcode) -> PResult<()> {
        if targets.len() != 1 {
            return Err(self.err_at(op, "guard chains take one target"));
        }
        let mut done_jumps: Vec<JumpLabel> = Vec::new();
        loop {
            self.parse_expression()?;
            if !self.cursor.check(TokenKind::Comma) {
                break;
            }
            self.cursor.next();
            self.b.emit(Opcode::Dup);
            done_jumps.push(self.b.emit_jump(short_circuit));
            self.b.emit(Opcode::Pop);
        }
        for jump in done_jumps {
            self.b.patch_jump(jump);
        }
        self.store_target(&targets[0])
    }

    /// `a, b .+= v`: N parallel op-assigns of one value.
    fn emit_parallel_op_assign(&mut self, targets: &[Target], binop: Opcode) -> PResult<()> {
        self.parse_expression()?;
        let tmp = self.alloc_temp();
        self.b.emit_store_local(tmp);
        for target in targets {
            self.emit_target_load(target)?;
            self.b.emit_load_local(tmp);
            self.b.emit(binop);
            self.store_target(target)?;
        }
        Ok(())
    }

    /// `f(_) <| a, b, c`: applies a call template once per value. Returns
    /// false (consuming nothing) when the statement is not a broadcast.
    fn try_parse_broadcast(&mut self) -> PResult<bool> {
        // Template shape: ident (.ident)* ( … ) <|
        if !self.cursor.check(TokenKind::Ident) {
            return Ok(false);
        }
        let start = self.cursor.save();
        let mut pos = start + 1;
        while self.cursor.tokens[pos].kind == TokenKind::Dot
            && self.cursor.tokens[pos + 1].kind == TokenKind::Ident
        {
            pos += 2;
        }
        if self.cursor.tokens[pos].kind != TokenKind::LParen {
            return Ok(false);
        }
        pos += 1;
        let mut depth = 1u32;
        let mut saw_placeholder = false;
        while depth > 0 {
            match self.cursor.tokens[pos].kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => depth -= 1,
                TokenKind::Ident if &*self.cursor.tokens[pos].text == "_" => saw_placeholder = true,
                TokenKind::Eof | TokenKind::Eol => return Ok(false),
                _ => {}
            }
            pos += 1;
        }
        if !saw_placeholder || self.cursor.tokens[pos].kind != TokenKind::ChainAssignAll {
            return Ok(false);
        }
        let template = TokenRange { start, end: pos };
        self.cursor.restore(pos + 1); // past `<|`

        let tmp = self.alloc_temp();
        let outer_placeholder = self.placeholder;
        loop {
            self.parse_expression()?;
            self.b.emit_store_local(tmp);
            self.placeholder = Some(tmp);
            self.replay_expression(template)?;
            self.placeholder = outer_placeholder;
            self.b.emit(Opcode::Pop);
            if !self.cursor.eat(TokenKind::Comma) {
                break;
            }
        }
        Ok(true)
    }

    /// `N times { }` / `N times as i { }`. The count is already on the
    /// stack when this is called.
    fn parse_times_loop(&mut self) -> PResult<()> {
        self.cursor.next(); // `times`
        self.begin_scope();
        let count = self.alloc_temp();
        self.b.emit_store_local(count);
        let counter = self.alloc_temp();
        self.b.emit_const(Value::Int(0));
        self.b.emit_store_local(counter);

        let bound_var = if self.cursor.eat(TokenKind::As) {
            let name_token = self.expect(TokenKind::Ident, "counter variable")?;
            let name = self.intern_token(&name_token);
            Some(self.declare_local(name))
        } else {
            None
        };

        let cond_start = self.b.current_offset();
        self.b.emit_load_local(counter);
        self.b.emit_load_local(count);
        self.b.emit(Opcode::Lt);
        let exit = self.b.emit_jump(Opcode::JumpIfFalse);
        if let Some(slot) = bound_var {
            self.b.emit2(
                Opcode::Move,
                Operand::Int(i64::from(slot)),
                Operand::Int(i64::from(counter)),
            );
        }

        let incr_holder: Vec<JumpLabel> = Vec::new();
        self.ctx().breaks.push(BreakCtx {
            is_loop: true,
            continue_target: None,
            break_jumps: Vec::new(),
            continue_jumps: incr_holder,
        });
        self.parse_block()?;
        let incr_at = self.b.current_offset();
        self.b.emit1(Opcode::IncLocal, Operand::Int(i64::from(counter)));
        self.b.emit_jump_to(Opcode::Jump, cond_start);
        self.b.patch_jump(exit);
        self.finish_break_ctx(Some(incr_at));
        self.end_scope();
        Ok(())
    }

    // ==================================================================
    // Target emission
    // ==================================================================

    /// Pushes the current value of a target.
    fn emit_target_load(&mut self, target: &Target) -> PResult<()> {
        let token = self.target_token(target);
        match target.head {
            PathHead::Name(name) => self.emit_var_load(name, &token)?,
            PathHead::SelfRef => self.emit_self_load(&token)?,
        }
        for accessor in &target.accessors {
            match *accessor {
                Accessor::Field(field) => {
                    self.b.emit1(Opcode::LoadField, Operand::Str(field));
                }
                Accessor::Index(range) => {
                    self.replay_expression(range)?;
                    self.b.emit(Opcode::LoadIndex);
                }
            }
        }
        Ok(())
    }

    /// Stores the stack top into a target.
    fn store_target(&mut self, target: &Target) -> PResult<()> {
        let token = self.target_token(target);
        if target.accessors.is_empty() {
            return match target.head {
                PathHead::Name(name) => self.emit_var_store(name, &token),
                PathHead::SelfRef => Err(self.err_at(&token, "cannot assign to `self`")),
            };
        }

        // Spill the value, emit the object path, store through the last
        // accessor.
        let tmp = self.alloc_temp();
        self.b.emit_store_local(tmp);
        match target.head {
            PathHead::Name(name) => self.emit_var_load(name, &token)?,
            PathHead::SelfRef => self.emit_self_load(&token)?,
        }
        let (last, prefix) = target.accessors.split_last().expect("non-empty accessors");
        for accessor in prefix {
            match *accessor {
                Accessor::Field(field) => {
                    self.b.emit1(Opcode::LoadField, Operand::Str(field));
                }
                Accessor::Index(range) => {
                    self.replay_expression(range)?;
                    self.b.emit(Opcode::LoadIndex);
                }
            }
        }
        match *last {
            Accessor::Field(field) => {
                self.b.emit_load_local(tmp);
                self.b.emit1(Opcode::StoreField, Operand::Str(field));
            }
            Accessor::Index(range) => {
                self.replay_expression(range)?;
                self.b.emit_load_local(tmp);
                self.b.emit(Opcode::StoreIndex);
            }
        }
        Ok(())
    }

    /// Compound assignment `target op= rhs` for every target shape.
    fn emit_compound_assign(&mut self, target: &Target, binop: Opcode) -> PResult<()> {
        let token = self.target_token(target);
        if target.accessors.is_empty() {
            let PathHead::Name(name) = target.head else {
                return Err(self.err_at(&token, "cannot assign to `self`"));
            };
            self.emit_var_load(name, &token)?;
            self.parse_assign_rhs()?;
            self.b.emit(binop);
            return self.emit_var_store(name, &token);
        }

        let (last, prefix) = target.accessors.split_last().expect("non-empty accessors");
        // Object (and index) are evaluated once and reused via temps.
        match target.head {
            PathHead::Name(name) => self.emit_var_load(name, &token)?,
            PathHead::SelfRef => self.emit_self_load(&token)?,
        }
        for accessor in prefix {
            match *accessor {
                Accessor::Field(field) => {
                    self.b.emit1(Opcode::LoadField, Operand::Str(field));
                }
                Accessor::Index(range) => {
                    self.replay_expression(range)?;
                    self.b.emit(Opcode::LoadIndex);
                }
            }
        }
        match *last {
            Accessor::Field(field) => {
                self.b.emit(Opcode::Dup);
                self.b.emit1(Opcode::LoadField, Operand::Str(field));
                self.parse_assign_rhs()?;
                self.b.emit(binop);
                self.b.emit1(Opcode::StoreField, Operand::Str(field));
            }
            Accessor::Index(range) => {
                let obj = self.alloc_temp();
                self.b.emit_store_local(obj);
                self.replay_expression(range)?;
                let idx = self.alloc_temp();
                self.b.emit_store_local(idx);
                self.b.emit_load_local(obj);
                self.b.emit_load_local(idx);
                self.b.emit_load_local(obj);
                self.b.emit_load_local(idx);
                self.b.emit(Opcode::LoadIndex);
                self.parse_assign_rhs()?;
                self.b.emit(binop);
                self.b.emit(Opcode::StoreIndex);
            }
        }
        Ok(())
    }

    /// Ensures an optional-assignment target exists before its gated store,
    /// so a skipped assignment still leaves a nil binding.
    fn predeclare_target(&mut self, target: &Target) -> PResult<()> {
        if !target.accessors.is_empty() {
            return Ok(());
        }
        let PathHead::Name(name) = target.head else {
            return Ok(());
        };
        if self.find_local(name).is_some() || self.scopes.resolve(self.current_scope(), name).is_some() {
            return Ok(());
        }
        if self.at_top_level() && self.ctx_ref().depth == 0 {
            let token = self.target_token(target);
            self.scopes
                .declare_global_var(self.decl_scope, name, false)
                .map_err(|_| self.err_at(&token, "redefinition"))?;
        } else {
            let slot = self.declare_local(name);
            self.b.emit1(Opcode::NilSlot, Operand::Int(i64::from(slot)));
        }
        Ok(())
    }

    fn target_token(&self, target: &Target) -> Token {
        Token {
            kind: TokenKind::Ident,
            text: "".into(),
            literal: None,
            line: target.line,
            column: target.column,
            file_index: 0,
        }
    }

    fn emit_self_load(&mut self, token: &Token) -> PResult<()> {
        // Methods and trait defaults carry the receiver as a local named
        // `self` in slot 0.
        let self_name = self.interns.intern("self");
        match self.find_local(self_name) {
            Some(slot) => {
                self.b.emit_load_local(slot);
                Ok(())
            }
            None => Err(self.err_at(token, "`self` outside a struct method")),
        }
    }

    /// Loads a simple variable (local, then scope chain, then deferred).
    fn emit_var_load(&mut self, name: StringId, token: &Token) -> PResult<()> {
        if name == self.underscore {
            let Some(slot) = self.placeholder else {
                return Err(self.err_at(token, "`_` is only meaningful inside a pipe stage"));
            };
            self.b.emit_load_local(slot);
            return Ok(());
        }
        if let Some(slot) = self.find_local(name) {
            self.b.emit_load_local(slot);
            return Ok(());
        }
        match self.scopes.resolve(self.current_scope(), name) {
            Some(Symbol::Var(var)) => {
                self.b.emit2(
                    Opcode::LoadGlobal,
                    Operand::Int(i64::from(var.slot)),
                    Operand::Str(name),
                );
                Ok(())
            }
            Some(Symbol::Func(fid)) => {
                self.b
                    .emit1(Opcode::NewFunction, Operand::Int(i64::try_from(fid.index()).expect("fits")));
                Ok(())
            }
            _ => {
                self.b.emit1(Opcode::LoadGlobalNamed, Operand::Str(name));
                Ok(())
            }
        }
    }

    /// Stores the stack top into a simple variable, declaring it on first
    /// assignment (global at the top level, local inside functions/blocks).
    fn emit_var_store(&mut self, name: StringId, token: &Token) -> PResult<()> {
        if name == self.underscore {
            return Err(self.err_at(token, "cannot assign to `_`"));
        }
        if let Some(slot) = self.find_local(name) {
            self.b.emit_store_local(slot);
            return Ok(());
        }
        match self.scopes.resolve(self.current_scope(), name) {
            Some(Symbol::Var(var)) => {
                if var.readonly {
                    return Err(self.err_at(token, "cannot assign to a `solid` binding"));
                }
                self.b.emit2(
                    Opcode::StoreGlobal,
                    Operand::Int(i64::from(var.slot)),
                    Operand::Str(name),
                );
                Ok(())
            }
            Some(_) => Err(self.err_at(token, "name is already bound to a declaration")),
            None => {
                if self.at_top_level() && self.ctx_ref().depth == 0 {
                    let slot = self
                        .scopes
                        .declare_global_var(self.decl_scope, name, false)
                        .map_err(|_| self.err_at(token, "redefinition"))?;
                    self.b.emit2(
                        Opcode::StoreGlobal,
                        Operand::Int(i64::from(slot)),
                        Operand::Str(name),
                    );
                } else {
                    let slot = self.declare_local(name);
                    self.b.emit_store_local(slot);
                }
                Ok(())
            }
        }
    }

    // ==================================================================
    // Expressions: precedence tiers
    // ==================================================================

    fn parse_expression(&mut self) -> PResult<()> {
        self.parse_pipe()
    }

    fn parse_pipe(&mut self) -> PResult<()> {
        if !self.try_parse_composition()? {
            self.parse_ternary()?;
        }
        loop {
            match self.cursor.peek_kind() {
                TokenKind::PipeOp => {
                    self.cursor.next();
                    let tmp = self.alloc_temp();
                    self.b.emit_store_local(tmp);
                    self.emit_pipe_stage(tmp)?;
                }
                TokenKind::OptPipe => {
                    // Short-circuit the stage when the value is nil.
                    self.cursor.next();
                    let tmp = self.alloc_temp();
                    self.b.emit_store_local(tmp);
                    self.b.emit_load_local(tmp);
                    let nil_case = self.b.emit_jump(Opcode::JumpIfNil);
                    self.emit_pipe_stage(tmp)?;
                    let done = self.b.emit_jump(Opcode::Jump);
                    self.b.patch_jump(nil_case);
                    self.b.emit_const(Value::Nil);
                    self.b.patch_jump(done);
                }
                TokenKind::GuardPipe => {
                    // Short-circuit the stage when the value is falsy.
                    self.cursor.next();
                    let tmp = self.alloc_temp();
                    self.b.emit_store_local(tmp);
                    self.b.emit_load_local(tmp);
                    let falsy_case = self.b.emit_jump(Opcode::JumpIfFalse);
                    self.emit_pipe_stage(tmp)?;
                    let done = self.b.emit_jump(Opcode::Jump);
                    self.b.patch_jump(falsy_case);
                    self.b.emit_load_local(tmp);
                    self.b.patch_jump(done);
                }
                TokenKind::MapPipe => self.emit_map_pipe()?,
                TokenKind::ReducePipe => self.emit_reduce_pipe(false)?,
                TokenKind::ScanPipe => self.emit_reduce_pipe(true)?,
                _ => return Ok(()),
            }
        }
    }

    /// `f ~> g` composes callable references into a synthesized
    /// single-parameter lambda equivalent to `(x) => g(f(x))`.
    fn try_parse_composition(&mut self) -> PResult<bool> {
        if !self.cursor.check(TokenKind::Ident) || self.cursor.peek_at(1).kind != TokenKind::Compose {
            return Ok(false);
        }
        let head = self.cursor.peek().clone();
        let mut names: Vec<String> = Vec::new();
        let mut pos = self.cursor.save();
        loop {
            if self.cursor.tokens[pos].kind != TokenKind::Ident {
                return Err(self.err_at(&head, "composition operands must be callable references"));
            }
            names.push(self.cursor.tokens[pos].text.to_string());
            pos += 1;
            if self.cursor.tokens[pos].kind != TokenKind::Compose {
                break;
            }
            pos += 1;
        }
        self.cursor.restore(pos);

        let fid = self.emit_synthetic_function(1, &head, |parser| {
            parser.b.emit_load_local(0);
            for name in &names {
                parser.emit_call_resolved(name, 1, &head)?;
            }
            Ok(())
        })?;
        self.b
            .emit1(Opcode::NewFunction, Operand::Int(i64::try_from(fid.index()).expect("fits")));
        Ok(true)
    }

    /// `c ? t : e` and `c ?: t, e`.
    fn parse_ternary(&mut self) -> PResult<()> {
        self.parse_or()?;
        match self.cursor.peek_kind() {
            TokenKind::Question => {
                self.cursor.next();
                let else_case = self.b.emit_jump(Opcode::JumpIfFalse);
                self.parse_ternary()?;
                let done = self.b.emit_jump(Opcode::Jump);
                self.expect(TokenKind::Colon, "`:` in ternary")?;
                self.b.patch_jump(else_case);
                self.parse_ternary()?;
                self.b.patch_jump(done);
            }
            TokenKind::QuestionColon => {
                self.cursor.next();
                let else_case = self.b.emit_jump(Opcode::JumpIfFalse);
                self.parse_ternary()?;
                let done = self.b.emit_jump(Opcode::Jump);
                self.expect(TokenKind::Comma, "`,` in `?:` ternary")?;
                self.b.patch_jump(else_case);
                self.parse_ternary()?;
                self.b.patch_jump(done);
            }
            _ => {}
        }
        Ok(())
    }

    /// `||` with operand-preserving short-circuit.
    fn parse_or(&mut self) -> PResult<()> {
        self.parse_and()?;
        let mut done: Vec<JumpLabel> = Vec::new();
        while self.cursor.eat(TokenKind::OrOr) {
            self.b.emit(Opcode::Dup);
            done.push(self.b.emit_jump(Opcode::JumpIfTrue));
            self.b.emit(Opcode::Pop);
            self.parse_and()?;
        }
        for jump in done {
            self.b.patch_jump(jump);
        }
        Ok(())
    }

    fn parse_and(&mut self) -> PResult<()> {
        self.parse_equality()?;
        let mut done: Vec<JumpLabel> = Vec::new();
        while self.cursor.eat(TokenKind::AndAnd) {
            self.b.emit(Opcode::Dup);
            done.push(self.b.emit_jump(Opcode::JumpIfFalse));
            self.b.emit(Opcode::Pop);
            self.parse_equality()?;
        }
        for jump in done {
            self.b.patch_jump(jump);
        }
        Ok(())
    }

    fn parse_equality(&mut self) -> PResult<()> {
        self.parse_collective()?;
        loop {
            match self.cursor.peek_kind() {
                TokenKind::EqEq => {
                    self.cursor.next();
                    self.parse_collective()?;
                    self.b.emit(Opcode::Eq);
                }
                TokenKind::NotEq => {
                    self.cursor.next();
                    self.parse_collective()?;
                    self.b.emit(Opcode::Neq);
                }
                TokenKind::Is => {
                    self.cursor.next();
                    let negated = self.cursor.eat(TokenKind::Not);
                    self.parse_collective()?;
                    self.b.emit(if negated { Opcode::Neq } else { Opcode::Eq });
                }
                _ => return Ok(()),
            }
        }
    }

    /// `v1, …, vN <OP| value`: conjunction (or `<||OP|` disjunction) of
    /// pairwise comparisons, short-circuiting. Only speculated at statement
    /// roots, assignment right-hand sides, and inside parentheses.
    fn parse_collective(&mut self) -> PResult<()> {
        if self.collective_ok
            && self.cursor.check(TokenKind::Ident)
            && let Some((count, op_kind)) = self.scan_collective_shape()
        {
            return self.emit_collective(count, op_kind);
        }
        self.parse_range()
    }

    /// Token-level shape check: `ident (, ident)* <OP|`.
    fn scan_collective_shape(&self) -> Option<(usize, TokenKind)> {
        let mut pos = self.cursor.save();
        let mut count = 0usize;
        loop {
            if self.cursor.tokens[pos].kind != TokenKind::Ident {
                return None;
            }
            count += 1;
            pos += 1;
            match self.cursor.tokens[pos].kind {
                TokenKind::Comma => pos += 1,
                kind if Self::collective_cmp(kind).is_some() => return Some((count, kind)),
                _ => return None,
            }
        }
    }

    fn collective_cmp(kind: TokenKind) -> Option<(CmpOp, bool)> {
        Some(match kind {
            TokenKind::CollEq => (CmpOp::Eq, false),
            TokenKind::CollNeq => (CmpOp::Neq, false),
            TokenKind::CollLt => (CmpOp::Lt, false),
            TokenKind::CollLe => (CmpOp::Le, false),
            TokenKind::CollGt => (CmpOp::Gt, false),
            TokenKind::CollGe => (CmpOp::Ge, false),
            TokenKind::CollOrEq => (CmpOp::Eq, true),
            TokenKind::CollOrNeq => (CmpOp::Neq, true),
            TokenKind::CollOrLt => (CmpOp::Lt, true),
            TokenKind::CollOrLe => (CmpOp::Le, true),
            TokenKind::CollOrGt => (CmpOp::Gt, true),
            TokenKind::CollOrGe => (CmpOp::Ge, true),
            _ => return None,
        })
    }

    fn emit_collective(&mut self, count: usize, op_kind: TokenKind) -> PResult<()> {
        let (cmp, disjunction) = Self::collective_cmp(op_kind).expect("shape-checked");
        let mut names: Vec<(StringId, Token)> = Vec::with_capacity(count);
        for index in 0..count {
            if index > 0 {
                self.expect(TokenKind::Comma, "`,`")?;
            }
            let token = self.expect(TokenKind::Ident, "variable")?;
            let name = self.intern_token(&token);
            names.push((name, token));
        }
        self.cursor.next(); // the collective operator

        // The compared value evaluates once.
        let prev = self.collective_ok;
        self.collective_ok = false;
        let value = self.parse_range();
        self.collective_ok = prev;
        value?;
        let tmp = self.alloc_temp();
        self.b.emit_store_local(tmp);

        let cmp_opcode = match cmp {
            CmpOp::Eq => Opcode::Eq,
            CmpOp::Neq => Opcode::Neq,
            CmpOp::Lt => Opcode::Lt,
            CmpOp::Le => Opcode::Le,
            CmpOp::Gt => Opcode::Gt,
            CmpOp::Ge => Opcode::Ge,
        };
        let mut short: Vec<JumpLabel> = Vec::new();
        let last = names.len() - 1;
        for (index, (name, token)) in names.clone().into_iter().enumerate() {
            self.emit_var_load(name, &token)?;
            self.b.emit_load_local(tmp);
            self.b.emit(cmp_opcode);
            if index < last {
                short.push(
                    self.b
                        .emit_jump(if disjunction { Opcode::JumpIfTrue } else { Opcode::JumpIfFalse }),
                );
            }
        }
        let done = self.b.emit_jump(Opcode::Jump);
        for jump in short {
            self.b.patch_jump(jump);
        }
        self.b.emit_const(Value::Bool(disjunction));
        self.b.patch_jump(done);
        Ok(())
    }

    fn parse_range(&mut self) -> PResult<()> {
        self.parse_relational()?;
        if self.cursor.eat(TokenKind::DotDot) {
            self.parse_relational()?;
            self.b.emit(Opcode::NewRange);
        }
        Ok(())
    }

    fn parse_relational(&mut self) -> PResult<()> {
        self.parse_additive()?;
        loop {
            let op = match self.cursor.peek_kind() {
                TokenKind::Less => Opcode::Lt,
                TokenKind::LessEq => Opcode::Le,
                TokenKind::Greater => Opcode::Gt,
                TokenKind::GreaterEq => Opcode::Ge,
                _ => return Ok(()),
            };
            self.cursor.next();
            self.parse_additive()?;
            self.b.emit(op);
        }
    }

    fn parse_additive(&mut self) -> PResult<()> {
        self.parse_multiplicative()?;
        loop {
            let op = match self.cursor.peek_kind() {
                TokenKind::Plus => Opcode::Add,
                TokenKind::Minus => Opcode::Sub,
                _ => return Ok(()),
            };
            self.cursor.next();
            self.parse_multiplicative()?;
            self.b.emit(op);
        }
    }

    fn parse_multiplicative(&mut self) -> PResult<()> {
        self.parse_exponent()?;
        loop {
            // `&` is the only surface bitwise operator; a bare `|` lexes as
            // its own token but is not an expression operator.
            let op = match self.cursor.peek_kind() {
                TokenKind::Star => Opcode::Mul,
                TokenKind::Slash => Opcode::Div,
                TokenKind::Percent => Opcode::Mod,
                TokenKind::Amp => Opcode::BitAnd,
                _ => return Ok(()),
            };
            self.cursor.next();
            self.parse_exponent()?;
            self.b.emit(op);
        }
    }

    fn parse_exponent(&mut self) -> PResult<()> {
        self.parse_unary()?;
        if self.cursor.eat(TokenKind::Power) {
            // Right-associative.
            self.parse_exponent()?;
            self.b.emit(Opcode::Pow);
        }
        Ok(())
    }

    fn parse_unary(&mut self) -> PResult<()> {
        match self.cursor.peek_kind() {
            TokenKind::Minus => {
                let minus = self.cursor.next();
                if self.cursor.check(TokenKind::Number) {
                    let token = self.cursor.next();
                    let value = Self::negated_literal(&token)
                        .ok_or_else(|| self.err_at(&minus, "invalid numeric literal"))?;
                    self.b.emit_const(value);
                    return Ok(());
                }
                self.parse_unary()?;
                self.b.emit(Opcode::Neg);
                Ok(())
            }
            TokenKind::Bang | TokenKind::Not => {
                self.cursor.next();
                self.parse_unary()?;
                self.b.emit(Opcode::Not);
                Ok(())
            }
            _ => self.parse_postfix(),
        }
    }

    fn negated_literal(token: &Token) -> Option<Value> {
        match token.literal.as_ref()? {
            Literal::Int(v) => Some(Value::Int(-v)),
            Literal::Long(v) => Some(Value::Long(-v)),
            Literal::Float(v) => Some(Value::Float(-v)),
            Literal::Double(v) => Some(Value::Double(-v)),
            _ => None,
        }
    }

    // ==================================================================
    // Postfix, primary, and calls
    // ==================================================================

    fn parse_postfix(&mut self) -> PResult<()> {
        let was_self = match self.cursor.peek_kind() {
            TokenKind::Ident => {
                self.parse_ident_head()?;
                false
            }
            TokenKind::SelfKw => {
                let token = self.cursor.next();
                self.emit_self_load(&token)?;
                true
            }
            _ => {
                self.parse_primary()?;
                false
            }
        };
        self.parse_postfix_ops(was_self)
    }

    fn parse_postfix_ops(&mut self, mut was_self: bool) -> PResult<()> {
        loop {
            match self.cursor.peek_kind() {
                TokenKind::Dot if self.cursor.peek_at(1).kind == TokenKind::Ident => {
                    self.cursor.next();
                    let name_token = self.cursor.next();
                    let name = self.intern_token(&name_token);
                    if self.cursor.check(TokenKind::LParen) {
                        let argc = self.parse_call_args_plain()?;
                        self.b.emit2(
                            Opcode::CallMethod,
                            Operand::Str(name),
                            Operand::Int(i64::try_from(argc).expect("argc fits")),
                        );
                    } else if was_self && self.owner_method_base(name) {
                        // Method reference on the receiver, bound statically.
                        self.b.emit1(Opcode::BindMethod, Operand::Str(name));
                    } else {
                        self.b.emit1(Opcode::LoadField, Operand::Str(name));
                    }
                }
                TokenKind::LBracket => {
                    self.cursor.next();
                    self.parse_paren_free_expression()?;
                    self.expect(TokenKind::RBracket, "`]`")?;
                    self.b.emit(Opcode::LoadIndex);
                }
                TokenKind::DotAnd => self.emit_dot_logical(Opcode::JumpIfFalse)?,
                TokenKind::DotOr => self.emit_dot_logical(Opcode::JumpIfTrue)?,
                _ => return Ok(()),
            }
            was_self = false;
        }
    }

    /// `x.and(a, b, …)` / `x.or(…)`: N-ary short-circuit fold including the
    /// receiver.
    fn emit_dot_logical(&mut self, short_circuit: Opcode) -> PResult<()> {
        self.cursor.next(); // `.and(` / `.or(`
        let mut done: Vec<JumpLabel> = Vec::new();
        loop {
            self.b.emit(Opcode::Dup);
            done.push(self.b.emit_jump(short_circuit));
            self.b.emit(Opcode::Pop);
            self.parse_paren_free_expression()?;
            if !self.cursor.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        for jump in done {
            self.b.patch_jump(jump);
        }
        Ok(())
    }

    /// True when the current method owner declares a method with this base
    /// name (any arity).
    fn owner_method_base(&self, name: StringId) -> bool {
        let Some(sid) = self.ctx_ref().owner else {
            return false;
        };
        let strukt = self.scopes.strukt(sid);
        strukt
            .methods
            .values()
            .any(|&fid| self.scopes.function(fid).base_name == name)
    }

    /// Identifier-headed expressions: placeholder, postfix var mutations,
    /// calls, struct literals, enum/namespace/struct member access, or a
    /// plain variable load.
    fn parse_ident_head(&mut self) -> PResult<()> {
        let token = self.cursor.next();
        let name = self.intern_token(&token);

        if name == self.underscore {
            return self.emit_var_load(name, &token);
        }

        match self.cursor.peek_kind() {
            // x++ / x-- yield the value before mutation.
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let op = self.cursor.next();
                self.emit_var_load(name, &token)?;
                self.emit_var_load(name, &token)?;
                self.b
                    .emit(if op.kind == TokenKind::PlusPlus { Opcode::Inc } else { Opcode::Dec });
                return self.emit_var_store(name, &token);
            }
            // x!! flips the boolean in place, yielding the new value.
            TokenKind::Flip => {
                self.cursor.next();
                self.emit_var_load(name, &token)?;
                self.b.emit(Opcode::Not);
                self.b.emit(Opcode::Dup);
                return self.emit_var_store(name, &token);
            }
            TokenKind::LParen => {
                return self.emit_call_with_args(&token.text.clone(), &token);
            }
            _ => {}
        }

        match self.scopes.resolve(self.current_scope(), name) {
            Some(Symbol::Struct(sid)) => self.parse_struct_member_or_literal(sid, &token),
            Some(Symbol::Enum(eid)) => {
                self.expect(TokenKind::Dot, "`.` after enum name")?;
                let variant_token = self.expect(TokenKind::Ident, "enum variant")?;
                let variant = self.intern_token(&variant_token);
                match self.scopes.enum_decl(eid).variants.get(&variant) {
                    Some(&value) => {
                        self.b.emit_const(Value::Int(value));
                        Ok(())
                    }
                    None => Err(self.err_at(
                        &variant_token,
                        format!("unknown variant `{}` of enum `{}`", variant_token.text, token.text),
                    )),
                }
            }
            Some(Symbol::Namespace(ns)) => self.parse_namespace_member(ns, &token),
            _ => self.emit_var_load(name, &token),
        }
    }

    /// `Vec2 { x: 10 }` literal, `Vec2.STATIC`, or an error.
    fn parse_struct_member_or_literal(&mut self, sid: StructId, token: &Token) -> PResult<()> {
        if self.cursor.check(TokenKind::LBrace) {
            return self.parse_struct_literal(sid, token);
        }
        if self.cursor.check(TokenKind::Dot) && self.cursor.peek_at(1).kind == TokenKind::Ident {
            self.cursor.next();
            let member_token = self.cursor.next();
            let member = self.intern_token(&member_token);
            if let Some(&slot) = self.scopes.strukt(sid).statics.get(&member) {
                self.b.emit2(
                    Opcode::LoadGlobal,
                    Operand::Int(i64::from(slot)),
                    Operand::Str(member),
                );
                return Ok(());
            }
            return Err(self.err_at(
                &member_token,
                format!("`{}` has no static member `{}`", token.text, member_token.text),
            ));
        }
        Err(self.err_at(token, format!("struct `{}` used as a value", token.text)))
    }

    fn parse_struct_literal(&mut self, sid: StructId, token: &Token) -> PResult<()> {
        self.expect(TokenKind::LBrace, "`{`")?;
        let name = self.scopes.strukt(sid).name;
        self.b.emit2(
            Opcode::NewInstance,
            Operand::Int(i64::try_from(sid.index()).expect("fits")),
            Operand::Str(name),
        );
        self.cursor.skip_eols();
        if !self.cursor.check(TokenKind::RBrace) {
            loop {
                self.cursor.skip_eols();
                let field_token = self.expect(TokenKind::Ident, "field name")?;
                let field = self.intern_token(&field_token);
                if !self.scopes.strukt(sid).field_names.contains(&field) {
                    return Err(self.err_at(
                        &field_token,
                        format!("struct `{}` has no field `{}`", token.text, field_token.text),
                    ));
                }
                self.expect(TokenKind::Colon, "`:`")?;
                self.b.emit(Opcode::Dup);
                self.parse_paren_free_expression()?;
                self.b.emit1(Opcode::StoreField, Operand::Str(field));
                self.cursor.skip_eols();
                if !self.cursor.eat(TokenKind::Comma) {
                    break;
                }
                self.cursor.skip_eols();
                if self.cursor.check(TokenKind::RBrace) {
                    break;
                }
            }
        }
        self.cursor.skip_eols();
        self.expect(TokenKind::RBrace, "`}`")?;
        Ok(())
    }

    /// `NS.member` access: calls, variables, nested namespaces, enums,
    /// struct statics.
    fn parse_namespace_member(&mut self, ns: ScopeId, ns_token: &Token) -> PResult<()> {
        let mut scope = ns;
        loop {
            self.expect(TokenKind::Dot, "`.` after namespace name")?;
            let member_token = self.expect(TokenKind::Ident, "namespace member")?;
            let member = self.intern_token(&member_token);
            if self.cursor.check(TokenKind::LParen) {
                return self.emit_call_with_args_in(&member_token.text.clone(), &member_token, scope);
            }
            match self.scopes.resolve_local(scope, member) {
                Some(Symbol::Var(var)) => {
                    self.b.emit2(
                        Opcode::LoadGlobal,
                        Operand::Int(i64::from(var.slot)),
                        Operand::Str(member),
                    );
                    return Ok(());
                }
                Some(Symbol::Namespace(inner)) => {
                    scope = inner;
                }
                Some(Symbol::Struct(sid)) => return self.parse_struct_member_or_literal(sid, &member_token),
                Some(Symbol::Enum(eid)) => {
                    self.expect(TokenKind::Dot, "`.` after enum name")?;
                    let variant_token = self.expect(TokenKind::Ident, "enum variant")?;
                    let variant = self.intern_token(&variant_token);
                    match self.scopes.enum_decl(eid).variants.get(&variant) {
                        Some(&value) => {
                            self.b.emit_const(Value::Int(value));
                            return Ok(());
                        }
                        None => {
                            return Err(self.err_at(&variant_token, "unknown enum variant"));
                        }
                    }
                }
                Some(Symbol::Func(fid)) => {
                    self.b
                        .emit1(Opcode::NewFunction, Operand::Int(i64::try_from(fid.index()).expect("fits")));
                    return Ok(());
                }
                Some(Symbol::Trait(_)) | None => {
                    return Err(self.err_at(
                        &member_token,
                        format!("`{}` has no member `{}`", ns_token.text, member_token.text),
                    ));
                }
            }
        }
    }

    // ==================================================================
    // Calls
    // ==================================================================

    /// Counts top-level arguments of the call whose `(` is the current
    /// token, without consuming anything.
    fn scan_call_argc(&self) -> PResult<usize> {
        let mut pos = self.cursor.save() + 1; // past `(`
        if self.cursor.tokens[pos].kind == TokenKind::RParen {
            return Ok(0);
        }
        let mut depth = 1u32;
        let mut argc = 1usize;
        loop {
            match self.cursor.tokens[pos].kind {
                TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => depth += 1,
                TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(argc);
                    }
                }
                TokenKind::Comma if depth == 1 => argc += 1,
                TokenKind::Eof => return Err(self.err_here("unterminated argument list")),
                _ => {}
            }
            pos += 1;
        }
    }

    /// Emits a named call: arguments (honoring the callee's by-ref
    /// parameters when statically resolvable), then the call instruction.
    fn emit_call_with_args(&mut self, base: &str, token: &Token) -> PResult<()> {
        let scope = self.current_scope();
        self.emit_call_with_args_in(base, token, scope)
    }

    fn emit_call_with_args_in(&mut self, base: &str, token: &Token, scope: ScopeId) -> PResult<()> {
        let argc = self.scan_call_argc()?;
        let mangled = self.interns.intern(&mangle(base, argc));
        let resolved = match self.scopes.resolve(scope, mangled) {
            Some(Symbol::Func(fid)) => Some(fid),
            _ => None,
        };
        let by_ref = resolved.map_or(0u32, |fid| self.scopes.function(fid).by_ref);

        self.expect(TokenKind::LParen, "`(`")?;
        self.cursor.skip_eols();
        for index in 0..argc {
            if index > 0 {
                self.expect(TokenKind::Comma, "`,`")?;
                self.cursor.skip_eols();
            }
            if index < 32 && by_ref & (1 << index) != 0 {
                self.emit_ref_arg()?;
            } else {
                self.parse_paren_free_expression()?;
            }
            self.cursor.skip_eols();
        }
        self.expect(TokenKind::RParen, "`)`")?;

        self.emit_call_instruction(base, mangled, argc, resolved, token);
        Ok(())
    }

    /// A by-ref argument must be a simple variable; its slot is promoted to
    /// a shared cell.
    fn emit_ref_arg(&mut self) -> PResult<()> {
        let token = self.expect(TokenKind::Ident, "variable (by-ref argument)")?;
        let name = self.intern_token(&token);
        if let Some(slot) = self.find_local(name) {
            self.b.emit1(Opcode::LoadRefLocal, Operand::Int(i64::from(slot)));
            return Ok(());
        }
        match self.scopes.resolve(self.current_scope(), name) {
            Some(Symbol::Var(var)) => {
                self.b.emit2(
                    Opcode::LoadRefGlobal,
                    Operand::Int(i64::from(var.slot)),
                    Operand::Str(name),
                );
                Ok(())
            }
            _ => Err(self.err_at(&token, "by-ref argument must be a declared variable")),
        }
    }

    /// Emits a call by name with arguments already on the stack.
    fn emit_call_resolved(&mut self, base: &str, argc: usize, token: &Token) -> PResult<()> {
        let mangled = self.interns.intern(&mangle(base, argc));
        let resolved = match self.scopes.resolve(self.current_scope(), mangled) {
            Some(Symbol::Func(fid)) => Some(fid),
            _ => None,
        };
        self.emit_call_instruction(base, mangled, argc, resolved, token);
        Ok(())
    }

    fn emit_call_instruction(
        &mut self,
        base: &str,
        mangled: StringId,
        argc: usize,
        resolved: Option<FunctionId>,
        token: &Token,
    ) {
        self.b.set_location(token.line, token.column, token.file_index);
        if let Some(fid) = resolved
            && let Some(iid) = self.scopes.function(fid).intrinsic
        {
            self.b.emit3(
                Opcode::CallIntrinsic,
                Operand::Int(i64::try_from(iid.index()).expect("fits")),
                Operand::Int(i64::try_from(argc).expect("argc fits")),
                Operand::Str(mangled),
            );
            return;
        }

        // Variable hint for callables held in locals or globals, encoded as
        // (slot << 1) | is_global; -1 when absent.
        let base_id = self.interns.intern(base);
        let hint = if let Some(slot) = self.find_local(base_id) {
            i64::from(slot) << 1
        } else if let Some(Symbol::Var(var)) = self.scopes.resolve(self.current_scope(), base_id) {
            (i64::from(var.slot) << 1) | 1
        } else {
            -1
        };
        let direct = resolved.map_or(-1i64, |fid| i64::try_from(fid.index()).expect("fits"));
        let mut instr = crate::bytecode::Instruction::new(Opcode::Call);
        instr.lhs = Operand::Str(mangled);
        instr.rhs = Operand::Int(i64::try_from(argc).expect("argc fits"));
        instr.rhs2 = Operand::Int(direct);
        instr.rhs3 = Operand::Int(hint);
        instr.line = token.line;
        instr.column = token.column;
        instr.file_index = token.file_index;
        self.b.instrs.push(instr);
    }

    /// Parses a method-call argument list (no by-ref support), returning the
    /// argument count.
    fn parse_call_args_plain(&mut self) -> PResult<usize> {
        self.expect(TokenKind::LParen, "`(`")?;
        self.cursor.skip_eols();
        let mut argc = 0usize;
        if !self.cursor.check(TokenKind::RParen) {
            loop {
                self.parse_paren_free_expression()?;
                argc += 1;
                self.cursor.skip_eols();
                if !self.cursor.eat(TokenKind::Comma) {
                    break;
                }
                self.cursor.skip_eols();
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        Ok(argc)
    }

    /// Expression in an argument-like position: collectives off.
    fn parse_paren_free_expression(&mut self) -> PResult<()> {
        let prev = self.collective_ok;
        self.collective_ok = false;
        let result = self.parse_expression();
        self.collective_ok = prev;
        result
    }

    // ==================================================================
    // Primary expressions
    // ==================================================================

    fn parse_primary(&mut self) -> PResult<()> {
        let token = self.cursor.peek().clone();
        match token.kind {
            TokenKind::Number | TokenKind::CharLit => {
                self.cursor.next();
                let value = Self::literal_value(&token).ok_or_else(|| self.err_at(&token, "invalid literal"))?;
                self.b.emit_const(value);
                Ok(())
            }
            TokenKind::Str => {
                self.cursor.next();
                let Some(Literal::Str(text)) = token.literal.as_ref() else {
                    return Err(self.err_at(&token, "string literal missing its payload"));
                };
                let id = self.interns.intern(text);
                self.b.emit_const(Value::Str(id));
                Ok(())
            }
            TokenKind::FStr => {
                self.cursor.next();
                self.emit_fstring(&token)
            }
            TokenKind::True => {
                self.cursor.next();
                self.b.emit_const(Value::Bool(true));
                Ok(())
            }
            TokenKind::False => {
                self.cursor.next();
                self.b.emit_const(Value::Bool(false));
                Ok(())
            }
            TokenKind::Nil => {
                self.cursor.next();
                self.b.emit_const(Value::Nil);
                Ok(())
            }
            TokenKind::LParen => {
                if self.lambda_follows() {
                    return self.parse_lambda();
                }
                self.cursor.next();
                self.cursor.skip_eols();
                let prev = self.collective_ok;
                self.collective_ok = true;
                let result = self.parse_expression();
                self.collective_ok = prev;
                result?;
                self.cursor.skip_eols();
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(())
            }
            TokenKind::LBracket => self.parse_list_literal(),
            TokenKind::Match => self.parse_match_expression(),
            _ => Err(self.unexpected("an expression")),
        }
    }

    fn literal_value(token: &Token) -> Option<Value> {
        match token.literal.as_ref()? {
            Literal::Int(v) => Some(Value::Int(*v)),
            Literal::Long(v) => Some(Value::Long(*v)),
            Literal::Float(v) => Some(Value::Float(*v)),
            Literal::Double(v) => Some(Value::Double(*v)),
            Literal::Char(c) => Some(Value::Char(*c)),
            _ => None,
        }
    }

    /// Looks ahead from a `(` for the `) =>` of a lambda.
    fn lambda_follows(&self) -> bool {
        let mut pos = self.cursor.save() + 1;
        let mut depth = 1u32;
        loop {
            match self.cursor.tokens[pos].kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        return self.cursor.tokens[pos + 1].kind == TokenKind::FatArrow;
                    }
                }
                TokenKind::Eof | TokenKind::Eol => return false,
                _ => {}
            }
            pos += 1;
        }
    }

    /// `(params) => expr-or-block` produces a `Function` value.
    fn parse_lambda(&mut self) -> PResult<()> {
        let open = self.cursor.next(); // `(`
        let mut params: SmallVec<[StringId; 4]> = SmallVec::new();
        let mut by_ref = 0u32;
        if !self.cursor.check(TokenKind::RParen) {
            loop {
                if self.cursor.eat(TokenKind::Ref) {
                    if params.len() < 32 {
                        by_ref |= 1 << params.len();
                    }
                }
                let param = self.expect(TokenKind::Ident, "parameter name")?;
                params.push(self.intern_token(&param));
                if !self.cursor.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;

        let arity = u8::try_from(params.len()).map_err(|_| self.err_at(&open, "too many parameters"))?;
        let mangled = {
            let n = self.scopes.functions.len();
            self.interns.intern(&mangle(&format!("<lambda:{n}>"), params.len()))
        };
        let fid = FunctionId::new(self.scopes.functions.len());
        self.scopes.functions.push(FunctionDecl {
            mangled,
            base_name: self.lambda_base,
            arity,
            params,
            by_ref,
            start: 0,
            end: 0,
            scope: self.current_scope(),
            registers: 0,
            is_lambda: true,
            intrinsic: None,
            owner: None,
        });
        self.parse_function_body(fid, false)?;
        self.b
            .emit1(Opcode::NewFunction, Operand::Int(i64::try_from(fid.index()).expect("fits")));
        Ok(())
    }

    /// Emits a function whose body is synthesized by `body` instead of
    /// parsed (composition lambdas).
    fn emit_synthetic_function(
        &mut self,
        arity: u8,
        token: &Token,
        body: impl FnOnce(&mut Self) -> PResult<()>,
    ) -> PResult<FunctionId> {
        let mangled = {
            let n = self.scopes.functions.len();
            self.interns.intern(&mangle(&format!("<compose:{n}>"), arity as usize))
        };
        let fid = FunctionId::new(self.scopes.functions.len());
        self.scopes.functions.push(FunctionDecl {
            mangled,
            base_name: self.lambda_base,
            arity,
            params: SmallVec::new(),
            by_ref: 0,
            start: 0,
            end: 0,
            scope: self.current_scope(),
            registers: 0,
            is_lambda: true,
            intrinsic: None,
            owner: None,
        });

        self.b.set_location(token.line, token.column, token.file_index);
        let over = self.b.emit_jump(Opcode::Jump);
        let start = self.b.current_offset();
        let enter_frame_at = self.b.emit1(Opcode::EnterFrame, Operand::Int(0));
        self.funcs.push(FuncCtx {
            decl: fid,
            scope: self.current_scope(),
            owner: None,
            locals: Vec::new(),
            next_slot: 0,
            max_slots: 0,
            depth: 0,
            breaks: Vec::new(),
            enter_frame_at,
        });
        for _ in 0..arity {
            self.alloc_temp();
        }
        body(self)?;
        let end = self.b.emit(Opcode::Return);

        let ctx = self.funcs.pop().expect("synthetic context");
        self.b.instrs[ctx.enter_frame_at].lhs = Operand::Int(i64::from(ctx.max_slots));
        let decl = self.scopes.function_mut(fid);
        decl.start = start;
        decl.end = end;
        decl.registers = ctx.max_slots;
        self.b.patch_jump(over);
        Ok(fid)
    }

    /// `[a, b, c]` list literal; `[range]` expands the range into a list.
    fn parse_list_literal(&mut self) -> PResult<()> {
        self.cursor.next(); // `[`
        self.cursor.skip_eols();
        if self.cursor.eat(TokenKind::RBracket) {
            self.b.emit1(Opcode::NewList, Operand::Int(0));
            return Ok(());
        }
        if self.range_list_follows() {
            self.parse_paren_free_expression()?;
            self.cursor.skip_eols();
            self.expect(TokenKind::RBracket, "`]`")?;
            self.emit_range_to_list();
            return Ok(());
        }
        let mut count = 0i64;
        loop {
            self.parse_paren_free_expression()?;
            count += 1;
            self.cursor.skip_eols();
            if !self.cursor.eat(TokenKind::Comma) {
                break;
            }
            self.cursor.skip_eols();
        }
        self.expect(TokenKind::RBracket, "`]`")?;
        self.b.emit1(Opcode::NewList, Operand::Int(count));
        Ok(())
    }

    /// True when the bracketed expression is a lone range (`[1..5]`).
    fn range_list_follows(&self) -> bool {
        let mut pos = self.cursor.save();
        let mut depth = 1u32;
        let mut saw_range = false;
        loop {
            match self.cursor.tokens[pos].kind {
                TokenKind::LBracket | TokenKind::LParen => depth += 1,
                TokenKind::RBracket | TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        return saw_range;
                    }
                }
                TokenKind::DotDot if depth == 1 => saw_range = true,
                TokenKind::Comma if depth == 1 => return false,
                TokenKind::Eof => return false,
                _ => {}
            }
            pos += 1;
        }
    }

    /// Drains the range on the stack into a fresh list.
    fn emit_range_to_list(&mut self) {
        self.b.emit(Opcode::NewIterator);
        let iter_slot = self.alloc_temp();
        self.b.emit_store_local(iter_slot);
        self.b.emit1(Opcode::NewList, Operand::Int(0));
        let list_slot = self.alloc_temp();
        self.b.emit_store_local(list_slot);
        let element = self.alloc_temp();

        let loop_start = self.b.emit3(
            Opcode::IteratorNext,
            Operand::Int(i64::from(iter_slot)),
            Operand::Int(i64::from(element)),
            Operand::Int(0),
        );
        self.b.emit_load_local(list_slot);
        self.b.emit_load_local(element);
        self.b.emit(Opcode::ListPush);
        self.b.emit_jump_to(Opcode::Jump, loop_start);
        let done = self.b.current_offset();
        self.b.instrs[loop_start].set_jump_target(done);
        self.b.emit_load_local(list_slot);
    }

    // ==================================================================
    // F-strings
    // ==================================================================

    /// Expands an f-string body into concatenation of literal chunks and
    /// `to_string(expr)` pieces, using a nested sub-lexer per `{…}` span.
    fn emit_fstring(&mut self, token: &Token) -> PResult<()> {
        let Some(Literal::FBody(body)) = token.literal.clone() else {
            return Err(self.err_at(token, "f-string literal missing its payload"));
        };

        enum Part {
            Lit(String),
            Expr(String),
        }
        let mut parts: Vec<Part> = Vec::new();
        let mut literal = String::new();
        let mut chars = body.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '{' {
                if !literal.is_empty() {
                    parts.push(Part::Lit(std::mem::take(&mut literal)));
                }
                let mut expr = String::new();
                let mut depth = 1u32;
                for inner in chars.by_ref() {
                    match inner {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    if depth > 0 {
                        expr.push(inner);
                    }
                }
                if depth != 0 {
                    return Err(self.err_at(token, "unbalanced `{` in f-string"));
                }
                parts.push(Part::Expr(expr));
            } else {
                literal.push(c);
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Lit(literal));
        }

        if parts.is_empty() {
            let id = self.interns.intern("");
            self.b.emit_const(Value::Str(id));
            return Ok(());
        }

        for (index, part) in parts.iter().enumerate() {
            match part {
                Part::Lit(text) => {
                    let unescaped = unescape_fstring_chunk(text);
                    let id = self.interns.intern(&unescaped);
                    self.b.emit_const(Value::Str(id));
                }
                Part::Expr(text) => {
                    self.parse_embedded_expression(text, token)?;
                    self.emit_call_resolved("to_string", 1, token)?;
                }
            }
            if index > 0 {
                self.b.emit(Opcode::Add);
            }
        }
        Ok(())
    }

    /// Lexes and parses an embedded expression string (f-string span) with a
    /// temporary cursor swap.
    fn parse_embedded_expression(&mut self, text: &str, token: &Token) -> PResult<()> {
        let lexer = Lexer::new(text, token.file_index);
        let sub_tokens = lexer.tokenize().map_err(|err| PError {
            message: format!("in f-string expression: {}", err.message),
            line: token.line,
            column: token.column,
            file_index: token.file_index,
        })?;
        let saved = std::mem::replace(
            &mut self.cursor,
            Cursor {
                tokens: sub_tokens,
                pos: 0,
            },
        );
        let result = self.parse_expression().and_then(|()| {
            self.cursor.skip_eols();
            if self.cursor.check(TokenKind::Eof) {
                Ok(())
            } else {
                Err(self.err_at(token, "unexpected trailing tokens in f-string expression"))
            }
        });
        self.cursor = saved;
        result
    }

    // ==================================================================
    // Pipe stages
    // ==================================================================

    /// Scans the extent of the current pipe stage (or standalone
    /// sub-expression) without consuming it.
    fn scan_stage_extent(&self) -> usize {
        let mut pos = self.cursor.save();
        let mut depth = 0u32;
        loop {
            match self.cursor.tokens[pos].kind {
                TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => depth += 1,
                TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                    if depth == 0 {
                        return pos;
                    }
                    depth -= 1;
                }
                TokenKind::PipeOp
                | TokenKind::OptPipe
                | TokenKind::GuardPipe
                | TokenKind::MapPipe
                | TokenKind::ReducePipe
                | TokenKind::ScanPipe
                | TokenKind::Comma
                | TokenKind::Eol
                | TokenKind::Eof
                    if depth == 0 =>
                {
                    return pos;
                }
                _ => {}
            }
            pos += 1;
        }
    }

    /// Emits one pipe stage. A stage containing `_` is an ordinary
    /// expression with the placeholder bound to the piped value; a bare
    /// callable reference becomes an arity-1 call on it.
    fn emit_pipe_stage(&mut self, tmp: u16) -> PResult<()> {
        let extent = self.scan_stage_extent();
        let has_placeholder = (self.cursor.save()..extent).any(|pos| {
            let t = &self.cursor.tokens[pos];
            t.kind == TokenKind::Ident && &*t.text == "_"
        });

        if has_placeholder {
            let outer = self.placeholder;
            self.placeholder = Some(tmp);
            let result = self.parse_ternary();
            self.placeholder = outer;
            return result;
        }

        // Implicit placeholder: `x |> f` calls f(x); `x |> obj.method`
        // calls obj.method(x).
        let head = self.expect(TokenKind::Ident, "pipe stage")?;
        if self.cursor.check(TokenKind::Dot) && self.cursor.peek_at(1).kind == TokenKind::Ident {
            self.cursor.next();
            let method_token = self.cursor.next();
            let method = self.intern_token(&method_token);
            let head_name = self.intern_token(&head);
            self.emit_var_load(head_name, &head)?;
            self.b.emit_load_local(tmp);
            self.b.emit2(Opcode::CallMethod, Operand::Str(method), Operand::Int(1));
            return Ok(());
        }
        self.b.emit_load_local(tmp);
        self.emit_call_resolved(&head.text.clone(), 1, &head)
    }

    /// `source |>> expr-in-_`: map into a fresh list.
    fn emit_map_pipe(&mut self) -> PResult<()> {
        self.cursor.next();
        self.b.emit(Opcode::NewIterator);
        let iter_slot = self.alloc_temp();
        self.b.emit_store_local(iter_slot);
        self.b.emit1(Opcode::NewList, Operand::Int(0));
        let list_slot = self.alloc_temp();
        self.b.emit_store_local(list_slot);
        let element = self.alloc_temp();

        let loop_start = self.b.emit3(
            Opcode::IteratorNext,
            Operand::Int(i64::from(iter_slot)),
            Operand::Int(i64::from(element)),
            Operand::Int(0),
        );
        self.b.emit_load_local(list_slot);
        let outer = self.placeholder;
        self.placeholder = Some(element);
        let body = self.parse_ternary();
        self.placeholder = outer;
        body?;
        self.b.emit(Opcode::ListPush);
        self.b.emit_jump_to(Opcode::Jump, loop_start);
        let done = self.b.current_offset();
        self.b.instrs[loop_start].set_jump_target(done);
        self.b.emit_load_local(list_slot);
        Ok(())
    }

    /// `source |>>= (init, (acc, el) => body)` and the scan variant, which
    /// additionally collects every intermediate accumulator.
    fn emit_reduce_pipe(&mut self, scan: bool) -> PResult<()> {
        self.cursor.next();
        self.expect(TokenKind::LParen, "`(` after reducer pipe")?;

        // Seed must be a compile-time constant.
        let negative = self.cursor.eat(TokenKind::Minus);
        let seed_token = self.cursor.next();
        let mut seed = match seed_token.kind {
            TokenKind::Number | TokenKind::CharLit => {
                Self::literal_value(&seed_token).ok_or_else(|| self.err_at(&seed_token, "invalid literal"))?
            }
            TokenKind::Str => {
                let Some(Literal::Str(text)) = seed_token.literal.as_ref() else {
                    return Err(self.err_at(&seed_token, "invalid literal"));
                };
                Value::Str(self.interns.intern(text))
            }
            TokenKind::True => Value::Bool(true),
            TokenKind::False => Value::Bool(false),
            TokenKind::Nil => Value::Nil,
            _ => return Err(self.err_at(&seed_token, "reducer seed must be a literal constant")),
        };
        if negative {
            seed = Self::negate_value(seed).ok_or_else(|| self.err_at(&seed_token, "reducer seed must be numeric"))?;
        }
        self.expect(TokenKind::Comma, "`,` after reducer seed")?;

        self.expect(TokenKind::LParen, "`(` opening reducer parameters")?;
        let acc_token = self.expect(TokenKind::Ident, "accumulator parameter")?;
        let acc_name = self.intern_token(&acc_token);
        self.expect(TokenKind::Comma, "`,`")?;
        let el_token = self.expect(TokenKind::Ident, "element parameter")?;
        let el_name = self.intern_token(&el_token);
        self.expect(TokenKind::RParen, "`)`")?;
        self.expect(TokenKind::FatArrow, "`=>`")?;

        self.b.emit(Opcode::NewIterator);
        let iter_slot = self.alloc_temp();
        self.b.emit_store_local(iter_slot);
        let acc_slot = self.alloc_temp();
        self.b.emit_const(seed);
        self.b.emit_store_local(acc_slot);
        let list_slot = if scan {
            let slot = self.alloc_temp();
            self.b.emit1(Opcode::NewList, Operand::Int(0));
            self.b.emit_store_local(slot);
            Some(slot)
        } else {
            None
        };
        let element = self.alloc_temp();

        let loop_start = self.b.emit3(
            Opcode::IteratorNext,
            Operand::Int(i64::from(iter_slot)),
            Operand::Int(i64::from(element)),
            Operand::Int(0),
        );
        self.begin_scope();
        self.bind_local_alias(acc_name, acc_slot);
        self.bind_local_alias(el_name, element);
        let body = self.parse_ternary();
        self.end_scope();
        body?;
        self.b.emit_store_local(acc_slot);
        if let Some(slot) = list_slot {
            self.b.emit_load_local(slot);
            self.b.emit_load_local(acc_slot);
            self.b.emit(Opcode::ListPush);
        }
        self.b.emit_jump_to(Opcode::Jump, loop_start);
        let done = self.b.current_offset();
        self.b.instrs[loop_start].set_jump_target(done);
        match list_slot {
            Some(slot) => self.b.emit_load_local(slot),
            None => self.b.emit_load_local(acc_slot),
        };
        self.expect(TokenKind::RParen, "`)` closing reducer")?;
        Ok(())
    }

    fn negate_value(value: Value) -> Option<Value> {
        match value {
            Value::Int(v) => Some(Value::Int(-v)),
            Value::Long(v) => Some(Value::Long(-v)),
            Value::Float(v) => Some(Value::Float(-v)),
            Value::Double(v) => Some(Value::Double(-v)),
            _ => None,
        }
    }

    // ==================================================================
    // Match
    // ==================================================================

    /// Statement-position `match`: the colon form compiles to a fallthrough
    /// switch; the arrow form is an expression whose value is discarded.
    fn parse_match_any(&mut self) -> PResult<()> {
        if self.colon_form_follows() {
            self.parse_match_colon()?;
            return Ok(());
        }
        self.parse_expression()?;
        self.b.emit(Opcode::Pop);
        self.expect_stmt_end()
    }

    /// Distinguishes the two match forms by the first `->` or `:` one brace
    /// level inside the body.
    fn colon_form_follows(&self) -> bool {
        let mut pos = self.cursor.save();
        let mut depth = 0u32;
        // Find the opening brace of the match body.
        loop {
            match self.cursor.tokens[pos].kind {
                TokenKind::LBrace if depth == 0 => break,
                TokenKind::LParen | TokenKind::LBracket => depth += 1,
                TokenKind::RParen | TokenKind::RBracket => depth = depth.saturating_sub(1),
                TokenKind::Eof | TokenKind::Eol => return false,
                _ => {}
            }
            pos += 1;
        }
        pos += 1;
        let mut inner_depth = 0u32;
        loop {
            match self.cursor.tokens[pos].kind {
                TokenKind::Arrow if inner_depth == 0 => return false,
                TokenKind::Colon if inner_depth == 0 => return true,
                TokenKind::LBrace | TokenKind::LParen | TokenKind::LBracket => inner_depth += 1,
                TokenKind::RBrace if inner_depth == 0 => return false,
                TokenKind::RBrace | TokenKind::RParen | TokenKind::RBracket => inner_depth -= 1,
                TokenKind::Eof => return false,
                _ => {}
            }
            pos += 1;
        }
    }

    /// Arrow-form `match` expression: a branch cascade yielding a value;
    /// `rest` always matches; no match at all yields nil.
    fn parse_match_expression(&mut self) -> PResult<()> {
        self.cursor.next(); // `match`
        self.parse_paren_free_expression()?;
        let tmp = self.alloc_temp();
        self.b.emit_store_local(tmp);
        self.expect(TokenKind::LBrace, "`{`")?;

        let mut end_jumps: Vec<JumpLabel> = Vec::new();
        let mut had_rest = false;
        loop {
            self.cursor.skip_eols();
            if self.cursor.check(TokenKind::RBrace) {
                break;
            }
            if self.cursor.eat(TokenKind::Rest) {
                self.expect(TokenKind::Arrow, "`->`")?;
                self.parse_paren_free_expression()?;
                end_jumps.push(self.b.emit_jump(Opcode::Jump));
                had_rest = true;
            } else {
                let mut hits: Vec<JumpLabel> = Vec::new();
                loop {
                    self.b.emit_load_local(tmp);
                    self.parse_paren_free_expression()?;
                    self.b.emit(Opcode::Eq);
                    if self.cursor.eat(TokenKind::Comma) {
                        hits.push(self.b.emit_jump(Opcode::JumpIfTrue));
                    } else {
                        break;
                    }
                }
                let miss = self.b.emit_jump(Opcode::JumpIfFalse);
                for hit in hits {
                    self.b.patch_jump(hit);
                }
                self.expect(TokenKind::Arrow, "`->`")?;
                self.parse_paren_free_expression()?;
                end_jumps.push(self.b.emit_jump(Opcode::Jump));
                self.b.patch_jump(miss);
            }
            if !self.cursor.eat(TokenKind::Eol) {
                break;
            }
        }
        self.cursor.skip_eols();
        self.expect(TokenKind::RBrace, "`}`")?;
        if !had_rest {
            self.b.emit_const(Value::Nil);
        }
        for jump in end_jumps {
            self.b.patch_jump(jump);
        }
        Ok(())
    }

    /// Colon-form `match` statement: tests jump into sequentially laid-out
    /// bodies that fall through until `break`.
    fn parse_match_colon(&mut self) -> PResult<()> {
        self.cursor.next(); // `match`
        self.parse_paren_free_expression()?;
        let tmp = self.alloc_temp();
        self.b.emit_store_local(tmp);
        self.expect(TokenKind::LBrace, "`{`")?;

        // First pass: scan the arms (pattern token ranges + body ranges).
        struct Arm {
            patterns: Vec<TokenRange>,
            is_rest: bool,
            body: TokenRange,
        }
        let mut arms: Vec<Arm> = Vec::new();
        loop {
            self.cursor.skip_eols();
            if self.cursor.check(TokenKind::RBrace) {
                break;
            }
            let (patterns, is_rest) = self.scan_case_label()?;
            let body_start = self.cursor.save();
            let body_end = self.scan_case_body_extent();
            self.cursor.restore(body_end);
            arms.push(Arm {
                patterns,
                is_rest,
                body: TokenRange {
                    start: body_start,
                    end: body_end,
                },
            });
        }
        self.expect(TokenKind::RBrace, "`}`")?;

        // Tests jump forward into the bodies.
        let mut body_entries: Vec<Vec<JumpLabel>> = Vec::with_capacity(arms.len());
        for arm in &arms {
            let mut entries = Vec::new();
            if arm.is_rest {
                entries.push(self.b.emit_jump(Opcode::Jump));
            } else {
                for &pattern in &arm.patterns {
                    self.b.emit_load_local(tmp);
                    self.replay_expression(pattern)?;
                    self.b.emit(Opcode::Eq);
                    entries.push(self.b.emit_jump(Opcode::JumpIfTrue));
                }
            }
            body_entries.push(entries);
        }
        let no_match = self.b.emit_jump(Opcode::Jump);

        self.ctx().breaks.push(BreakCtx {
            is_loop: false,
            continue_target: None,
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });
        for (arm, entries) in arms.iter().zip(body_entries) {
            for entry in entries {
                self.b.patch_jump(entry);
            }
            self.replay_statements(arm.body)?;
        }
        self.b.patch_jump(no_match);
        self.finish_break_ctx(None);
        Ok(())
    }

    /// Scans a colon-form case label: `pattern (, pattern)* :` or `rest :`.
    fn scan_case_label(&mut self) -> PResult<(Vec<TokenRange>, bool)> {
        if self.cursor.eat(TokenKind::Rest) {
            self.expect(TokenKind::Colon, "`:` after `rest`")?;
            return Ok((Vec::new(), true));
        }
        let mut patterns = Vec::new();
        loop {
            let start = self.cursor.save();
            loop {
                match self.cursor.peek_kind() {
                    TokenKind::Colon | TokenKind::Comma => break,
                    TokenKind::Eol | TokenKind::Eof | TokenKind::LBrace => {
                        return Err(self.err_here("expected `:` after match pattern"));
                    }
                    _ => {
                        self.cursor.next();
                    }
                }
            }
            patterns.push(TokenRange {
                start,
                end: self.cursor.save(),
            });
            if self.cursor.eat(TokenKind::Comma) {
                continue;
            }
            self.expect(TokenKind::Colon, "`:`")?;
            return Ok((patterns, false));
        }
    }

    /// Extent of a colon-form case body: up to the next case label or the
    /// closing brace at depth zero.
    fn scan_case_body_extent(&self) -> usize {
        let mut pos = self.cursor.save();
        let mut depth = 0u32;
        let mut at_line_start = false;
        loop {
            let kind = self.cursor.tokens[pos].kind;
            match kind {
                TokenKind::LBrace | TokenKind::LParen | TokenKind::LBracket => depth += 1,
                TokenKind::RBrace if depth == 0 => return pos,
                TokenKind::RBrace | TokenKind::RParen | TokenKind::RBracket => depth -= 1,
                TokenKind::Eol if depth == 0 => at_line_start = true,
                TokenKind::Eof => return pos,
                TokenKind::Rest if depth == 0 && at_line_start => {
                    if self.cursor.tokens[pos + 1].kind == TokenKind::Colon {
                        return pos;
                    }
                    at_line_start = false;
                }
                _ if depth == 0 && at_line_start => {
                    if self.looks_like_case_label(pos) {
                        return pos;
                    }
                    at_line_start = false;
                }
                _ => {}
            }
            pos += 1;
        }
    }

    /// Heuristic for a case-label line: simple pattern tokens followed by a
    /// `:` before the line ends.
    fn looks_like_case_label(&self, mut pos: usize) -> bool {
        loop {
            match self.cursor.tokens[pos].kind {
                TokenKind::Colon => return true,
                TokenKind::Number
                | TokenKind::Str
                | TokenKind::CharLit
                | TokenKind::True
                | TokenKind::False
                | TokenKind::Nil
                | TokenKind::Ident
                | TokenKind::Dot
                | TokenKind::Comma
                | TokenKind::Minus => pos += 1,
                _ => return false,
            }
        }
    }

    /// Replays a token range as a statement sequence.
    fn replay_statements(&mut self, range: TokenRange) -> PResult<()> {
        let saved = self.cursor.save();
        self.cursor.restore(range.start);
        self.replay_depth += 1;
        if self.replay_depth > 64 {
            return Err(self.err_here("replay nesting too deep"));
        }
        let mut result = Ok(());
        loop {
            self.cursor.skip_eols();
            if self.cursor.save() >= range.end {
                break;
            }
            if let Err(err) = self.parse_statement() {
                result = Err(err);
                break;
            }
        }
        self.replay_depth -= 1;
        self.cursor.restore(saved);
        result
    }
}
