//! Lexical scopes, symbols, and the compile-time registries behind them.
//!
//! Scopes form a tree held in an arena and addressed by `ScopeId` indices
//! (child scopes keep a parent back-reference; indices keep the tree free of
//! ownership cycles). A scope owns a symbol table keyed by interned name:
//! mangled `base__arity` names for callables, plain names for everything
//! else. Function, struct, trait, and enum declarations live in flat
//! registries so instructions and heap objects can refer to them by id.
//!
//! The tables are populated during parsing and read-only afterwards; the VM
//! walks the same chains to resolve symbolic calls at first execution.

use ahash::AHashMap;
use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::intern::StringId;
use crate::lexer::TokenRange;

macro_rules! registry_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(u32);

        impl $name {
            #[inline]
            pub(crate) fn new(index: usize) -> Self {
                Self(u32::try_from(index).expect("registry index exceeds u32"))
            }

            #[inline]
            pub(crate) fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

registry_id!(
    /// Index of a scope in the scope arena.
    ScopeId
);
registry_id!(
    /// Index of a function declaration.
    FunctionId
);
registry_id!(
    /// Index of a struct declaration.
    StructId
);
registry_id!(
    /// Index of a trait declaration.
    TraitId
);
registry_id!(
    /// Index of an enum declaration.
    EnumId
);
registry_id!(
    /// Index of a registered native delegate.
    IntrinsicId
);

/// The root scope created by [`Scopes::new`].
pub(crate) const GLOBAL_SCOPE: ScopeId = ScopeId(0);

/// A variable symbol. All non-slot variables (top level and namespaces) are
/// backed by a slot in the VM's globals vector.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VarSymbol {
    pub slot: u32,
    /// `solid` variables reject reassignment at parse time.
    pub readonly: bool,
}

/// A compile-time entity stored in a scope.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Symbol {
    Var(VarSymbol),
    Func(FunctionId),
    Struct(StructId),
    Trait(TraitId),
    Enum(EnumId),
    Namespace(ScopeId),
}

/// One lexical scope: symbol table, parent link, optional name, and the
/// namespaces pulled in by `use`.
#[derive(Debug, Default)]
pub(crate) struct Scope {
    pub name: Option<StringId>,
    pub parent: Option<ScopeId>,
    pub symbols: AHashMap<StringId, Symbol>,
    pub uses: Vec<ScopeId>,
    /// Demangled base name to overload set, for arity-mismatch hints.
    pub by_base: AHashMap<StringId, SmallVec<[FunctionId; 2]>>,
}

/// A function or method declaration.
///
/// `start`/`end` bracket the body in the code vector (`EnterFrame` ..
/// `Return`); they are patched in once the body is emitted, so a pre-scanned
/// forward reference is complete by the time anything can call it.
#[derive(Debug)]
pub(crate) struct FunctionDecl {
    pub mangled: StringId,
    pub base_name: StringId,
    pub arity: u8,
    pub params: SmallVec<[StringId; 4]>,
    /// Bitmask over parameter positions declared `ref`.
    pub by_ref: u32,
    pub start: usize,
    pub end: usize,
    /// Scope the body resolves names against.
    pub scope: ScopeId,
    /// Local slots the frame needs (parameters included).
    pub registers: u16,
    pub is_lambda: bool,
    /// Native delegate for intrinsic-bodied functions.
    pub intrinsic: Option<IntrinsicId>,
    pub owner: Option<StructId>,
}

/// A struct declaration: fields, methods, statics, traits.
#[derive(Debug)]
pub(crate) struct StructDecl {
    pub name: StringId,
    pub scope: ScopeId,
    pub field_names: Vec<StringId>,
    /// Hidden initializer that stores default field values into a fresh
    /// instance (slot 0). `None` when every field defaults to nil.
    pub defaults_fn: Option<FunctionId>,
    /// Static (`solid`) member name to its backing global slot.
    pub statics: AHashMap<StringId, u32>,
    /// Mangled method name to declaration.
    pub methods: AHashMap<StringId, FunctionId>,
    /// Mangled name to native delegate, registered by the embedding API.
    pub static_intrinsics: AHashMap<StringId, IntrinsicId>,
    pub traits: Vec<TraitId>,
}

/// A trait declaration. Default field values are kept as token ranges and
/// replayed into each implementing struct's defaults initializer.
#[derive(Debug)]
pub(crate) struct TraitDecl {
    pub name: StringId,
    pub required_fields: Vec<StringId>,
    /// Required signatures as (base name, arity).
    pub required_funcs: Vec<(StringId, u8)>,
    /// Mangled name to compiled default method body.
    pub default_methods: AHashMap<StringId, FunctionId>,
    pub default_fields: Vec<(StringId, TokenRange)>,
}

/// An enum declaration. Variants map to sequential integers from 0.
#[derive(Debug)]
pub(crate) struct EnumDecl {
    pub name: StringId,
    pub variants: IndexMap<StringId, i32>,
}

/// The scope arena plus all declaration registries for a compiled program.
#[derive(Debug)]
pub(crate) struct Scopes {
    pub scopes: Vec<Scope>,
    pub functions: Vec<FunctionDecl>,
    pub structs: Vec<StructDecl>,
    pub traits: Vec<TraitDecl>,
    pub enums: Vec<EnumDecl>,
    /// Number of global slots the VM must allocate.
    pub global_count: u32,
}

impl Scopes {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::default()],
            functions: Vec::new(),
            structs: Vec::new(),
            traits: Vec::new(),
            enums: Vec::new(),
            global_count: 0,
        }
    }

    pub fn new_scope(&mut self, parent: ScopeId, name: Option<StringId>) -> ScopeId {
        let id = ScopeId::new(self.scopes.len());
        self.scopes.push(Scope {
            name,
            parent: Some(parent),
            ..Scope::default()
        });
        id
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.index()]
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.index()]
    }

    /// Declares a symbol in a scope. Fails (returning the existing symbol)
    /// when the name is already bound there.
    pub fn declare(&mut self, scope: ScopeId, name: StringId, symbol: Symbol) -> Result<(), Symbol> {
        let table = &mut self.scopes[scope.index()].symbols;
        if let Some(&existing) = table.get(&name) {
            return Err(existing);
        }
        table.insert(name, symbol);
        Ok(())
    }

    /// Declares a function symbol and indexes it under its base name for
    /// arity hints.
    pub fn declare_function(&mut self, scope: ScopeId, decl: FunctionDecl) -> Result<FunctionId, Symbol> {
        let id = FunctionId::new(self.functions.len());
        let mangled = decl.mangled;
        let base = decl.base_name;
        self.declare(scope, mangled, Symbol::Func(id))?;
        self.scopes[scope.index()].by_base.entry(base).or_default().push(id);
        self.functions.push(decl);
        Ok(id)
    }

    /// Allocates a fresh global slot and declares a variable for it.
    pub fn declare_global_var(&mut self, scope: ScopeId, name: StringId, readonly: bool) -> Result<u32, Symbol> {
        let slot = self.global_count;
        self.declare(scope, name, Symbol::Var(VarSymbol { slot, readonly }))?;
        self.global_count += 1;
        Ok(slot)
    }

    /// Allocates a global slot without a symbol (hidden statics).
    pub fn alloc_global_slot(&mut self) -> u32 {
        let slot = self.global_count;
        self.global_count += 1;
        slot
    }

    /// Looks a name up in one scope only (no parent walk, no `use`s).
    pub fn resolve_local(&self, scope: ScopeId, name: StringId) -> Option<Symbol> {
        self.scopes[scope.index()].symbols.get(&name).copied()
    }

    /// Chained lookup: the scope itself, then its `use`d namespaces, then the
    /// parent chain with the same rule at each level.
    pub fn resolve(&self, scope: ScopeId, name: StringId) -> Option<Symbol> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = &self.scopes[id.index()];
            if let Some(&symbol) = s.symbols.get(&name) {
                return Some(symbol);
            }
            for &used in &s.uses {
                if let Some(&symbol) = self.scopes[used.index()].symbols.get(&name) {
                    return Some(symbol);
                }
            }
            current = s.parent;
        }
        None
    }

    /// Collects every overload of `base` reachable from `scope`, for the
    /// arity-mismatch elaboration.
    pub fn overloads_of(&self, scope: ScopeId, base: StringId) -> Vec<FunctionId> {
        let mut out = Vec::new();
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = &self.scopes[id.index()];
            if let Some(set) = s.by_base.get(&base) {
                out.extend(set.iter().copied());
            }
            for &used in &s.uses {
                if let Some(set) = self.scopes[used.index()].by_base.get(&base) {
                    out.extend(set.iter().copied());
                }
            }
            current = s.parent;
        }
        out
    }

    pub fn function(&self, id: FunctionId) -> &FunctionDecl {
        &self.functions[id.index()]
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut FunctionDecl {
        &mut self.functions[id.index()]
    }

    pub fn strukt(&self, id: StructId) -> &StructDecl {
        &self.structs[id.index()]
    }

    pub fn strukt_mut(&mut self, id: StructId) -> &mut StructDecl {
        &mut self.structs[id.index()]
    }

    pub fn trait_decl(&self, id: TraitId) -> &TraitDecl {
        &self.traits[id.index()]
    }

    pub fn enum_decl(&self, id: EnumId) -> &EnumDecl {
        &self.enums[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interns;

    #[test]
    fn declare_rejects_redefinition() {
        let mut interns = Interns::new();
        let mut scopes = Scopes::new();
        let name = interns.intern("x");
        scopes
            .declare_global_var(GLOBAL_SCOPE, name, false)
            .expect("first declaration succeeds");
        assert!(scopes.declare_global_var(GLOBAL_SCOPE, name, false).is_err());
    }

    #[test]
    fn resolve_walks_parent_chain() {
        let mut interns = Interns::new();
        let mut scopes = Scopes::new();
        let name = interns.intern("outer");
        scopes.declare_global_var(GLOBAL_SCOPE, name, false).unwrap();
        let child = scopes.new_scope(GLOBAL_SCOPE, None);
        assert!(scopes.resolve_local(child, name).is_none());
        assert!(matches!(scopes.resolve(child, name), Some(Symbol::Var(_))));
    }

    #[test]
    fn resolve_consults_used_namespaces() {
        let mut interns = Interns::new();
        let mut scopes = Scopes::new();
        let ns_name = interns.intern("Math");
        let ns = scopes.new_scope(GLOBAL_SCOPE, Some(ns_name));
        let pi = interns.intern("pi");
        scopes.declare_global_var(ns, pi, true).unwrap();

        let site = scopes.new_scope(GLOBAL_SCOPE, None);
        assert!(scopes.resolve(site, pi).is_none());
        scopes.scope_mut(site).uses.push(ns);
        assert!(matches!(scopes.resolve(site, pi), Some(Symbol::Var(_))));
    }
}
