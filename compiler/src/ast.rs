// ast.rs — Parsed and type-checked declarations consumed by call graph resolution
//
// The grammar and type checker live upstream; this module is the boundary
// they hand over. Everything here derives `Deserialize` so a checked AST can
// arrive as a JSON document.
//
// Preconditions: the producer has type-checked every binding.
// Postconditions: `Ast::new` rejects duplicate callable names and registers
//   one implicit struct per callable describing its outputs.
// Failure modes: `ResolveError::DuplicateCallable`, `ResolveError::UnknownType`.
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ResolveError;
use crate::types::{StructDecl, StructMember, TypeId, TypeLookup, TypeTable};

// ── Locations ───────────────────────────────────────────────────────────────

/// File and line of a construct. Orders by file, then line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceLoc {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
}

impl SourceLoc {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        SourceLoc {
            file: file.into(),
            line,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.file.is_empty() && self.line == 0
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

// ── Expressions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AstExp {
    Null,
    Bool {
        value: bool,
    },
    Int {
        value: i64,
    },
    Float {
        value: f64,
    },
    String {
        value: String,
    },
    Array {
        #[serde(default)]
        items: Vec<AstExp>,
    },
    /// Typed-map or untyped dictionary literal.
    Map {
        #[serde(default)]
        entries: BTreeMap<String, AstExp>,
    },
    Struct {
        #[serde(default)]
        fields: BTreeMap<String, AstExp>,
    },
    /// `self.id.output`: an input parameter of the enclosing pipeline.
    #[serde(rename = "self")]
    SelfRef {
        id: String,
        #[serde(default)]
        output: String,
    },
    /// `CALL.output`: an output of a sibling call.
    #[serde(rename = "ref")]
    CallRef {
        id: String,
        #[serde(default)]
        output: String,
    },
    Split {
        value: Box<AstExp>,
        #[serde(default)]
        loc: SourceLoc,
    },
}

impl AstExp {
    pub fn int(value: i64) -> Self {
        AstExp::Int { value }
    }

    pub fn bool(value: bool) -> Self {
        AstExp::Bool { value }
    }

    pub fn string(value: impl Into<String>) -> Self {
        AstExp::String {
            value: value.into(),
        }
    }

    pub fn array(items: impl IntoIterator<Item = AstExp>) -> Self {
        AstExp::Array {
            items: items.into_iter().collect(),
        }
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, AstExp)>) -> Self {
        AstExp::Map {
            entries: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn structure<K: Into<String>>(fields: impl IntoIterator<Item = (K, AstExp)>) -> Self {
        AstExp::Struct {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn self_ref(id: impl Into<String>) -> Self {
        AstExp::SelfRef {
            id: id.into(),
            output: String::new(),
        }
    }

    pub fn call_ref(id: impl Into<String>, output: impl Into<String>) -> Self {
        AstExp::CallRef {
            id: id.into(),
            output: output.into(),
        }
    }

    pub fn split(value: AstExp, loc: SourceLoc) -> Self {
        AstExp::Split {
            value: Box::new(value),
            loc,
        }
    }

    /// Builds a literal from plain JSON. Objects become dictionaries.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => AstExp::Null,
            Value::Bool(b) => AstExp::bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => AstExp::int(i),
                None => AstExp::Float {
                    value: n.as_f64().unwrap_or_default(),
                },
            },
            Value::String(s) => AstExp::string(s.clone()),
            Value::Array(items) => AstExp::array(items.iter().map(AstExp::from_json)),
            Value::Object(obj) => {
                AstExp::map(obj.iter().map(|(k, v)| (k.clone(), AstExp::from_json(v))))
            }
        }
    }
}

// ── Calls ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindStm {
    pub id: String,
    pub exp: AstExp,
    #[serde(default)]
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Modifiers {
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub preflight: bool,
    #[serde(default)]
    pub volatile: bool,
    /// The `disabled` binding of `using(...)`.
    #[serde(default)]
    pub disabled: Option<AstExp>,
}

/// `[map] call DEC_ID as ID(bindings) using(modifiers)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSite {
    /// Call alias; defaults to `dec_id`.
    #[serde(default)]
    pub id: String,
    pub dec_id: String,
    #[serde(default)]
    pub mapped: bool,
    #[serde(default)]
    pub bindings: Vec<BindStm>,
    #[serde(default)]
    pub modifiers: Modifiers,
    #[serde(default)]
    pub loc: SourceLoc,
}

impl CallSite {
    pub fn new(dec_id: impl Into<String>) -> Self {
        let dec_id = dec_id.into();
        CallSite {
            id: dec_id.clone(),
            dec_id,
            mapped: false,
            bindings: Vec::new(),
            modifiers: Modifiers::default(),
            loc: SourceLoc::default(),
        }
    }

    pub fn alias(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn mapped(mut self) -> Self {
        self.mapped = true;
        self
    }

    pub fn bind(mut self, id: impl Into<String>, exp: AstExp) -> Self {
        self.bindings.push(BindStm {
            id: id.into(),
            exp,
            loc: self.loc.clone(),
        });
        self
    }

    pub fn disabled(mut self, exp: AstExp) -> Self {
        self.modifiers.disabled = Some(exp);
        self
    }

    pub fn at(mut self, loc: SourceLoc) -> Self {
        self.loc = loc;
        self
    }

    pub fn binding(&self, id: &str) -> Option<&BindStm> {
        self.bindings.iter().find(|b| b.id == id)
    }

    fn normalize(&mut self) {
        if self.id.is_empty() {
            self.id = self.dec_id.clone();
        }
    }
}

// ── Declarations ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub id: String,
    pub tname: TypeId,
}

impl Param {
    pub fn new(id: impl Into<String>, tname: &str) -> Self {
        Param {
            id: id.into(),
            // Callers building declarations in code pass literal type names.
            tname: tname.parse().unwrap_or_else(|_| TypeId::new(tname)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDecl {
    pub id: String,
    #[serde(default)]
    pub in_params: Vec<Param>,
    #[serde(default)]
    pub out_params: Vec<Param>,
    /// Output parameters kept after the pipeline completes.
    #[serde(default)]
    pub retain: Vec<String>,
    #[serde(default)]
    pub loc: SourceLoc,
}

impl StageDecl {
    pub fn new(id: impl Into<String>) -> Self {
        StageDecl {
            id: id.into(),
            in_params: Vec::new(),
            out_params: Vec::new(),
            retain: Vec::new(),
            loc: SourceLoc::default(),
        }
    }

    pub fn input(mut self, id: &str, tname: &str) -> Self {
        self.in_params.push(Param::new(id, tname));
        self
    }

    pub fn output(mut self, id: &str, tname: &str) -> Self {
        self.out_params.push(Param::new(id, tname));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDecl {
    pub id: String,
    #[serde(default)]
    pub in_params: Vec<Param>,
    #[serde(default)]
    pub out_params: Vec<Param>,
    #[serde(default)]
    pub calls: Vec<CallSite>,
    #[serde(default)]
    pub returns: Vec<BindStm>,
    #[serde(default)]
    pub retain: Vec<AstExp>,
    #[serde(default)]
    pub loc: SourceLoc,
}

impl PipelineDecl {
    pub fn new(id: impl Into<String>) -> Self {
        PipelineDecl {
            id: id.into(),
            in_params: Vec::new(),
            out_params: Vec::new(),
            calls: Vec::new(),
            returns: Vec::new(),
            retain: Vec::new(),
            loc: SourceLoc::default(),
        }
    }

    pub fn input(mut self, id: &str, tname: &str) -> Self {
        self.in_params.push(Param::new(id, tname));
        self
    }

    pub fn output(mut self, id: &str, tname: &str) -> Self {
        self.out_params.push(Param::new(id, tname));
        self
    }

    pub fn call(mut self, call: CallSite) -> Self {
        self.calls.push(call);
        self
    }

    pub fn ret(mut self, id: impl Into<String>, exp: AstExp) -> Self {
        self.returns.push(BindStm {
            id: id.into(),
            exp,
            loc: SourceLoc::default(),
        });
        self
    }

    pub fn retain(mut self, exp: AstExp) -> Self {
        self.retain.push(exp);
        self
    }

    /// The single-call pipeline standing in for a top-level stage call.
    pub fn wrapping(stage: &StageDecl, call: &CallSite) -> Self {
        PipelineDecl {
            id: stage.id.clone(),
            in_params: stage.in_params.clone(),
            out_params: stage.out_params.clone(),
            calls: vec![call.clone()],
            returns: stage
                .out_params
                .iter()
                .map(|p| BindStm {
                    id: p.id.clone(),
                    exp: AstExp::call_ref(call.id.clone(), p.id.clone()),
                    loc: call.loc.clone(),
                })
                .collect(),
            retain: Vec::new(),
            loc: stage.loc.clone(),
        }
    }
}

/// A declared stage or pipeline.
#[derive(Debug, Clone)]
pub enum Callable {
    Stage(Arc<StageDecl>),
    Pipeline(Arc<PipelineDecl>),
}

impl Callable {
    pub fn id(&self) -> &str {
        match self {
            Callable::Stage(s) => &s.id,
            Callable::Pipeline(p) => &p.id,
        }
    }

    pub fn in_params(&self) -> &[Param] {
        match self {
            Callable::Stage(s) => &s.in_params,
            Callable::Pipeline(p) => &p.in_params,
        }
    }

    pub fn out_params(&self) -> &[Param] {
        match self {
            Callable::Stage(s) => &s.out_params,
            Callable::Pipeline(p) => &p.out_params,
        }
    }

    pub fn in_param(&self, id: &str) -> Option<&Param> {
        self.in_params().iter().find(|p| p.id == id)
    }

    pub fn out_param(&self, id: &str) -> Option<&Param> {
        self.out_params().iter().find(|p| p.id == id)
    }
}

// ── Program ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Ast {
    callables: BTreeMap<String, Callable>,
    types: TypeTable,
}

impl Ast {
    pub fn new(mut types: TypeTable, decls: impl IntoIterator<Item = Decl>) -> Result<Self, ResolveError> {
        let mut callables = BTreeMap::new();
        for decl in decls {
            let callable = decl.into_callable();
            let id = callable.id().to_string();
            if callables.contains_key(&id) || types.struct_decl(&id).is_some() {
                return Err(ResolveError::DuplicateCallable(id));
            }
            types.add_struct(StructDecl {
                id: id.clone(),
                members: callable
                    .out_params()
                    .iter()
                    .map(|p| StructMember {
                        id: p.id.clone(),
                        tname: p.tname.clone(),
                    })
                    .collect(),
            });
            callables.insert(id, callable);
        }
        types.check()?;
        Ok(Ast { callables, types })
    }

    pub fn callable(&self, id: &str) -> Option<&Callable> {
        self.callables.get(id)
    }

    pub fn callables(&self) -> impl Iterator<Item = &Callable> {
        self.callables.values()
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }
}

/// Owned declaration as it appears in a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decl {
    Stage(StageDecl),
    Pipeline(PipelineDecl),
}

impl Decl {
    fn into_callable(self) -> Callable {
        match self {
            Decl::Stage(s) => Callable::Stage(Arc::new(s)),
            Decl::Pipeline(mut p) => {
                p.calls.iter_mut().for_each(CallSite::normalize);
                Callable::Pipeline(Arc::new(p))
            }
        }
    }
}

/// An AST plus the top-level call, as read from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub structs: Vec<StructDecl>,
    #[serde(default)]
    pub file_types: Vec<String>,
    #[serde(default)]
    pub callables: Vec<Decl>,
    pub call: CallSite,
}

impl Document {
    pub fn into_ast(self) -> Result<(Ast, CallSite), ResolveError> {
        let mut types = TypeTable::new();
        for name in self.file_types {
            types.add_file_type(name);
        }
        for s in self.structs {
            types.add_struct(s);
        }
        let ast = Ast::new(types, self.callables)?;
        let mut call = self.call;
        call.normalize();
        Ok((ast, call))
    }
}
