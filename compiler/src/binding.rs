// binding.rs — Binding-path projection, reference substitution and literal filtering
//
// `Projector::project` navigates a dotted path through an expression while
// applying a fork map: the concrete (or still unknown) index chosen for each
// fork root. References absorb fork indices, splits with a concrete index
// select one element, merges over a statically known source are expanded
// into literal collections, and disable wrappers project value and control
// together.
//
// Preconditions: every `SourceId` in the expression belongs to `sources`.
// Postconditions: inputs are never mutated; unchanged subtrees are returned
//   as the original allocation.
// Failure modes: `ResolveError` for missing names, bad paths, bad indices and
//   shape conflicts; `ResolveError::Internal` for unexpandable merges.
// Side effects: may allocate sources or grow source sets in `sources`.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::ast::AstExp;
use crate::disable::make_disabled;
use crate::error::{ErrorList, ResolveError};
use crate::exp::{CollectionIndex, Exp, ForkMap, MapExp, MapKind, MergeExp, RefExp, SplitExp};
use crate::id::{NodeId, SourceId};
use crate::source::{MapSource, SourceArena};
use crate::types::{binding_type, CallMode, TypeId, TypeLookup};

/// A fully substituted binding and its declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBinding {
    pub exp: Exp,
    pub tid: TypeId,
}

impl ResolvedBinding {
    pub fn new(exp: Exp, tid: TypeId) -> Self {
        ResolvedBinding { exp, tid }
    }

    pub fn null() -> Self {
        ResolvedBinding::new(Exp::Null, TypeId::null())
    }
}

pub type BindingMap = BTreeMap<String, ResolvedBinding>;

/// Names visible to a binding: the enclosing pipeline's inputs (`self`) and
/// the outputs of calls resolved before it.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'s> {
    pub inputs: Option<&'s BindingMap>,
    pub calls: &'s BindingMap,
}

fn split_path(path: &str) -> (&str, &str) {
    match path.split_once('.') {
        Some((head, rest)) => (head, rest),
        None => (path, ""),
    }
}

fn join_path(base: &str, path: &str) -> String {
    match (base.is_empty(), path.is_empty()) {
        (_, true) => base.to_string(),
        (true, false) => path.to_string(),
        (false, false) => format!("{base}.{path}"),
    }
}

/// Turn collected errors into a result, aborting on internal ones.
fn finish<T>(value: T, errors: Vec<ResolveError>) -> Result<T, ResolveError> {
    let mut list = ErrorList::new();
    for e in errors {
        list.push(e)?;
    }
    list.into_result().map(|()| value)
}

pub struct Projector<'a> {
    pub sources: &'a mut SourceArena,
    pub types: &'a dyn TypeLookup,
}

impl<'a> Projector<'a> {
    pub fn new(sources: &'a mut SourceArena, types: &'a dyn TypeLookup) -> Self {
        Projector { sources, types }
    }

    // ── Projection ──────────────────────────────────────────────────────────

    pub fn project(&mut self, exp: &Exp, path: &str, fork: &ForkMap) -> Result<Exp, ResolveError> {
        match exp {
            Exp::Null => Ok(Exp::Null),
            Exp::Bool(_) | Exp::Int(_) | Exp::Float(_) | Exp::String(_) => {
                if path.is_empty() {
                    Ok(exp.clone())
                } else {
                    Err(ResolveError::BindingWithinScalar(exp.kind_name()))
                }
            }
            Exp::Map(m) if m.kind == MapKind::Struct && !path.is_empty() => {
                let (head, rest) = split_path(path);
                let member = m
                    .entries
                    .get(head)
                    .ok_or_else(|| ResolveError::NoElement(head.to_string()))?;
                self.project(member, rest, fork)
            }
            Exp::Array(_) | Exp::Map(_) => self.project_children(exp, path, fork),
            Exp::Ref(r) => self.project_ref(r, exp, path, fork),
            Exp::Split(s) => self.project_split(s, exp, path, fork),
            Exp::Merge(m) => self.project_merge(m, exp, path, fork),
            Exp::Disabled(d) => {
                let inner = self.project(&d.value, path, fork)?;
                let control = Exp::Ref(d.disabled.clone());
                let control = self.project_ref(&d.disabled, &control, "", fork)?;
                make_disabled(&control, inner, Some(d))
            }
        }
    }

    fn project_children(&mut self, exp: &Exp, path: &str, fork: &ForkMap) -> Result<Exp, ResolveError> {
        let mut errors = Vec::new();
        let out = exp.map_children(|e| {
            self.project(e, path, fork).unwrap_or_else(|err| {
                errors.push(err);
                e.clone()
            })
        });
        finish(out, errors)
    }

    fn project_ref(
        &mut self,
        r: &Arc<RefExp>,
        exp: &Exp,
        path: &str,
        fork: &ForkMap,
    ) -> Result<Exp, ResolveError> {
        let forks = self.update_forks(&r.forks, fork)?;
        if path.is_empty() && forks.is_none() {
            return Ok(exp.clone());
        }
        let mut updated = (**r).clone();
        updated.output_id = join_path(&r.output_id, path);
        if let Some(forks) = forks {
            updated.forks = forks;
        }
        Ok(Exp::reference(updated))
    }

    /// Apply `fork` to the fork indices a reference already carries.
    ///
    /// Only dimensions the reference forks on are touched. Returns `None`
    /// when nothing changes.
    fn update_forks(&mut self, own: &ForkMap, fork: &ForkMap) -> Result<Option<ForkMap>, ResolveError> {
        let mut out: Option<ForkMap> = None;
        for (node, want) in fork {
            let Some(have) = own.get(node) else {
                continue;
            };
            let replacement = match (have, want) {
                (CollectionIndex::Unknown(a), CollectionIndex::Unknown(b)) => {
                    match self.sources.merge(Some(*a), Some(*b))? {
                        Some(m) if m != *a => Some(CollectionIndex::Unknown(m)),
                        _ => None,
                    }
                }
                (CollectionIndex::Unknown(_), concrete) => Some(concrete.clone()),
                (_, CollectionIndex::Unknown(_)) => None,
                (a, b) if a == b => None,
                (a, b) => {
                    return Err(ResolveError::InconsistentIndex(a.to_string(), b.to_string()));
                }
            };
            if let Some(idx) = replacement {
                out.get_or_insert_with(|| own.clone()).insert(*node, idx);
            }
        }
        Ok(out)
    }

    fn split_is_empty(&self, s: &SplitExp) -> bool {
        match &s.value {
            Exp::Null => true,
            Exp::Array(items) => items.is_empty(),
            Exp::Map(m) => m.kind == MapKind::Dict && m.entries.is_empty(),
            Exp::Split(inner) => self.split_is_empty(inner),
            _ => false,
        }
    }

    fn project_split(
        &mut self,
        s: &Arc<SplitExp>,
        exp: &Exp,
        path: &str,
        fork: &ForkMap,
    ) -> Result<Exp, ResolveError> {
        if self.split_is_empty(s) {
            return Ok(Exp::Null);
        }
        let extended;
        let fork = match fork.get(&s.owner) {
            None => {
                let mut f = fork.clone();
                f.insert(s.owner, CollectionIndex::Unknown(s.source));
                extended = f;
                &extended
            }
            Some(i) if !i.is_unknown() => {
                if let Some(elem) = self.element_of(&s.value, i, false)? {
                    return self.project(&elem, path, fork);
                }
                fork
            }
            Some(_) => fork,
        };
        let index = fork.get(&s.owner).filter(|i| !i.is_unknown()).cloned();

        let value = self.project(&s.value, path, fork)?;
        let mut source = s.source;
        let value = match &value {
            Exp::Null => return Ok(Exp::Null),
            Exp::Merge(m) => {
                if let Some(i) = &index {
                    let mut f = fork.clone();
                    f.insert(m.owner, i.clone());
                    return self.project(&m.value, "", &f);
                }
                let over = self
                    .sources
                    .merge(Some(m.merge_over), Some(source))?
                    .unwrap_or(source);
                source = over;
                if over == m.merge_over {
                    value.clone()
                } else {
                    Exp::Merge(Arc::new(MergeExp {
                        merge_over: over,
                        ..(**m).clone()
                    }))
                }
            }
            Exp::Array(items) => {
                let fits = self.sources.known_length(source)
                    && self.sources.call_mode(source) == CallMode::Array
                    && self.sources.array_len(source) == items.len();
                if !fits {
                    source = self.sources.source_for_value(&value, CallMode::Array);
                }
                value.clone()
            }
            Exp::Map(d) if d.kind == MapKind::Dict => {
                let fits = self.sources.known_length(source)
                    && self.sources.call_mode(source) == CallMode::Map
                    && self.sources.keys(source).iter().eq(d.entries.keys());
                if !fits {
                    source = self.sources.source_for_value(&value, CallMode::Map);
                }
                value.clone()
            }
            Exp::Ref(r) if r.forks.contains_key(&s.owner) => return Ok(value.clone()),
            Exp::Split(inner) => {
                if !self.sources.known_length(source) {
                    source = if self.sources.known_length(inner.source) {
                        inner.source
                    } else {
                        let mode = self.sources.call_mode(s.source);
                        self.sources.source_for_value(&value, mode)
                    };
                }
                value.clone()
            }
            _ => value.clone(),
        };

        if let Some(i) = &index {
            if let Some(elem) = self.element_of(&value, i, true)? {
                return Ok(elem);
            }
            if let Exp::Ref(r) = &value {
                let mut selected = (**r).clone();
                selected.index.push(i.clone());
                return Ok(Exp::reference(selected));
            }
        }
        if value.same(&s.value) && source == s.source {
            return Ok(exp.clone());
        }
        Ok(Exp::Split(Arc::new(SplitExp {
            value,
            owner: s.owner,
            source,
            loc: s.loc.clone(),
        })))
    }

    /// Select element `i` of a literal collection. `None` when `value` is
    /// not something an index can be applied to statically.
    fn element_of(
        &mut self,
        value: &Exp,
        i: &CollectionIndex,
        descend: bool,
    ) -> Result<Option<Exp>, ResolveError> {
        match (value, i) {
            (Exp::Array(items), CollectionIndex::Array(n)) => items
                .get(*n)
                .cloned()
                .map(Some)
                .ok_or(ResolveError::IndexOutOfRange {
                    index: *n,
                    len: items.len(),
                }),
            (Exp::Array(_), CollectionIndex::Key(_)) => Err(ResolveError::IndexMode {
                index: CallMode::Map,
                collection: "array",
            }),
            (Exp::Map(m), CollectionIndex::Key(k)) if m.kind == MapKind::Dict => m
                .entries
                .get(k)
                .cloned()
                .map(Some)
                .ok_or_else(|| ResolveError::KeyNotFound(k.clone())),
            (Exp::Map(m), CollectionIndex::Array(_)) if m.kind == MapKind::Dict => {
                Err(ResolveError::IndexMode {
                    index: CallMode::Array,
                    collection: "map",
                })
            }
            (Exp::Split(sp), _) if descend => self.invert_split(sp, i),
            _ => Ok(None),
        }
    }

    /// Push an index for an outer dimension through a split of known shape,
    /// selecting it from every element.
    fn invert_split(&mut self, sp: &Arc<SplitExp>, i: &CollectionIndex) -> Result<Option<Exp>, ResolveError> {
        if !self.sources.known_length(sp.source) {
            return Ok(None);
        }
        let value = match &sp.value {
            Exp::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    match self.element_of(item, i, true)? {
                        Some(e) => out.push(e),
                        None => return Ok(None),
                    }
                }
                Exp::array(out)
            }
            Exp::Map(m) if m.kind == MapKind::Dict => {
                let mut out = BTreeMap::new();
                for (k, item) in &m.entries {
                    match self.element_of(item, i, true)? {
                        Some(e) => {
                            out.insert(k.clone(), e);
                        }
                        None => return Ok(None),
                    }
                }
                Exp::dict(out)
            }
            _ => return Ok(None),
        };
        Ok(Some(Exp::Split(Arc::new(SplitExp {
            value,
            owner: sp.owner,
            source: sp.source,
            loc: sp.loc.clone(),
        }))))
    }

    fn project_merge(
        &mut self,
        m: &Arc<MergeExp>,
        exp: &Exp,
        path: &str,
        fork: &ForkMap,
    ) -> Result<Exp, ResolveError> {
        let value = self.project(&m.value, path, fork)?;
        if fork.get(&m.owner).is_some_and(|i| !i.is_unknown()) {
            return Ok(value);
        }
        let source = self.source_for_fork(m.merge_over, fork)?;
        if !self.sources.known_length(source) {
            if value.same(&m.value) {
                return Ok(exp.clone());
            }
            return Ok(Exp::Merge(Arc::new(MergeExp {
                value,
                ..(**m).clone()
            })));
        }
        self.expand_merge(m.owner, &value, source, fork)
    }

    /// Materialize one element per fork of a known-length source.
    fn expand_merge(
        &mut self,
        owner: NodeId,
        value: &Exp,
        source: SourceId,
        fork: &ForkMap,
    ) -> Result<Exp, ResolveError> {
        let mode = self.sources.call_mode(source);
        trace!(%owner, %source, %mode, "expanding merge");
        let mut errors = Vec::new();
        let out = match mode {
            CallMode::Array => {
                let len = self.sources.array_len(source);
                if len == 0 {
                    return Ok(Exp::Null);
                }
                let mut items = Vec::with_capacity(len);
                for i in 0..len {
                    let mut f = fork.clone();
                    f.insert(owner, CollectionIndex::Array(i));
                    match self.project(value, "", &f) {
                        Ok(e) => items.push(e),
                        Err(e) => {
                            errors.push(e);
                            items.push(Exp::Null);
                        }
                    }
                }
                Exp::array(items)
            }
            CallMode::Map => {
                let keys: Vec<String> = self.sources.keys(source).iter().cloned().collect();
                if keys.is_empty() {
                    return Ok(Exp::Null);
                }
                let mut entries = BTreeMap::new();
                for k in keys {
                    let mut f = fork.clone();
                    f.insert(owner, CollectionIndex::Key(k.clone()));
                    match self.project(value, "", &f) {
                        Ok(e) => {
                            entries.insert(k, e);
                        }
                        Err(e) => errors.push(e),
                    }
                }
                Exp::dict(entries)
            }
            CallMode::Null => Exp::Null,
            other => {
                return Err(ResolveError::internal(format!(
                    "cannot expand merge over {other} source"
                )));
            }
        };
        finish(out, errors)
    }

    /// The source for one fork of `src`, which may become known once outer
    /// fork indices are fixed.
    pub fn source_for_fork(&mut self, src: SourceId, fork: &ForkMap) -> Result<SourceId, ResolveError> {
        if self.sources.known_length(src) {
            return Ok(src);
        }
        let master = self.sources.master(src);
        match self.sources.get(master).clone() {
            MapSource::Reference { reference, mode } => {
                match self.project(&Exp::Ref(reference.clone()), "", fork)? {
                    Exp::Ref(r) if Arc::ptr_eq(&r, &reference) => Ok(src),
                    Exp::Ref(r) => Ok(self.sources.reference(&r, mode)),
                    other => Ok(self.sources.source_for_value(&other, mode)),
                }
            }
            MapSource::Nested { value, mode } => {
                let projected = self.project(&value, "", fork)?;
                if projected.same(&value) {
                    return Ok(src);
                }
                Ok(self.sources.source_for_value(&projected, mode))
            }
            _ => Ok(src),
        }
    }

    // ── Substitution ────────────────────────────────────────────────────────

    /// Resolve a syntactic expression in `scope`. Splits are owned by `owner`.
    ///
    /// Returns the expression and its type: the referenced binding's type
    /// for references, `tid` otherwise.
    pub fn resolve_exp(
        &mut self,
        ast: &AstExp,
        tid: &TypeId,
        owner: NodeId,
        scope: Scope<'_>,
    ) -> Result<(Exp, TypeId), ResolveError> {
        let exp = match ast {
            AstExp::Null => Exp::Null,
            AstExp::Bool { value } => Exp::Bool(*value),
            AstExp::Int { value } => Exp::Int(*value),
            AstExp::Float { value } => Exp::Float(*value),
            AstExp::String { value } => Exp::string(value),
            AstExp::Array { items } => {
                let elem = tid.element().unwrap_or_else(|| tid.clone());
                let mut errors = Vec::new();
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match self.resolve_exp(item, &elem, owner, scope) {
                        Ok((e, _)) => out.push(e),
                        Err(e) => errors.push(e),
                    }
                }
                finish(Exp::array(out), errors)?
            }
            AstExp::Map { entries } => {
                let elem = tid.element().unwrap_or_else(|| tid.clone());
                let mut errors = Vec::new();
                let mut out = BTreeMap::new();
                for (k, v) in entries {
                    match self.resolve_exp(v, &elem, owner, scope) {
                        Ok((e, _)) => {
                            out.insert(k.clone(), e);
                        }
                        Err(e) => errors.push(e.context(format!("key {k}"))),
                    }
                }
                finish(Exp::dict(out), errors)?
            }
            AstExp::Struct { fields } => {
                let decl = self.types.struct_decl(&tid.tname).cloned();
                let mut errors = Vec::new();
                let mut out = BTreeMap::new();
                for (k, v) in fields {
                    let member = decl
                        .as_ref()
                        .and_then(|d| d.member(k))
                        .map_or_else(|| TypeId::new("map"), |m| m.tname.clone());
                    match self.resolve_exp(v, &member, owner, scope) {
                        Ok((e, _)) => {
                            out.insert(k.clone(), e);
                        }
                        Err(e) => errors.push(e.context(format!("member {k}"))),
                    }
                }
                finish(Exp::structure(out), errors)?
            }
            AstExp::SelfRef { id, output } => {
                let binding = scope
                    .inputs
                    .and_then(|inputs| inputs.get(id))
                    .ok_or_else(|| ResolveError::UnknownParameter(id.clone()))?;
                return self.dereference(binding, output);
            }
            AstExp::CallRef { id, output } => {
                let binding = scope
                    .calls
                    .get(id)
                    .ok_or_else(|| ResolveError::UnknownCall(id.clone()))?;
                return self.dereference(binding, output);
            }
            AstExp::Split { value, loc } => {
                let (inner, inner_tid) = self.resolve_exp(value, tid, owner, scope)?;
                let mode = match &inner {
                    Exp::Array(_) => CallMode::Array,
                    Exp::Map(m) if m.kind == MapKind::Dict => CallMode::Map,
                    _ => inner_tid.call_mode(),
                };
                let source = self.sources.source_for_value(&inner, mode);
                Exp::Split(Arc::new(SplitExp {
                    value: inner,
                    owner,
                    source,
                    loc: loc.clone(),
                }))
            }
        };
        Ok((exp, tid.clone()))
    }

    fn dereference(&mut self, binding: &ResolvedBinding, path: &str) -> Result<(Exp, TypeId), ResolveError> {
        let exp = self.project(&binding.exp, path, &ForkMap::new())?;
        let tid = binding_type(path, &binding.tid, self.types)?;
        Ok((exp, tid))
    }

    /// Resolve one argument against its declared type.
    pub fn resolve_binding(
        &mut self,
        ast: &AstExp,
        tid: &TypeId,
        owner: NodeId,
        scope: Scope<'_>,
    ) -> Result<ResolvedBinding, ResolveError> {
        let (exp, found) = self.resolve_exp(ast, tid, owner, scope)?;
        // Null outputs of disabled calls carry the undimensioned callable type.
        if !exp.is_null() && matches!(ast, AstExp::SelfRef { .. } | AstExp::CallRef { .. }) {
            self.check_assignable(tid, &found)?;
        }
        let exp = self.filter(&exp, tid)?;
        Ok(ResolvedBinding::new(exp, tid.clone()))
    }

    fn check_assignable(&self, expected: &TypeId, found: &TypeId) -> Result<(), ResolveError> {
        let want = self
            .types
            .get(expected)
            .ok_or_else(|| ResolveError::UnknownType(expected.to_string()))?;
        let Some(have) = self.types.get(found) else {
            return Ok(());
        };
        if want.is_assignable_from(have.as_ref(), self.types) {
            Ok(())
        } else {
            Err(ResolveError::NotAssignable {
                expected: expected.clone(),
                found: found.clone(),
            })
        }
    }

    // ── Filtering ───────────────────────────────────────────────────────────

    /// Reduce struct literals to their declared members and check literal
    /// leaves against `tid`. References pass through untouched.
    pub fn filter(&mut self, exp: &Exp, tid: &TypeId) -> Result<Exp, ResolveError> {
        match exp {
            Exp::Ref(_) => Ok(exp.clone()),
            Exp::Split(s) => {
                let outer = tid.add_dim(self.sources.call_mode(s.source))?;
                let value = self.filter(&s.value, &outer)?;
                if value.same(&s.value) {
                    return Ok(exp.clone());
                }
                Ok(Exp::Split(Arc::new(SplitExp {
                    value,
                    ..(**s).clone()
                })))
            }
            Exp::Merge(m) => {
                let inner = tid.element().unwrap_or_else(|| tid.clone());
                let value = self.filter(&m.value, &inner)?;
                if value.same(&m.value) {
                    return Ok(exp.clone());
                }
                Ok(Exp::Merge(Arc::new(MergeExp {
                    value,
                    ..(**m).clone()
                })))
            }
            Exp::Disabled(d) => {
                let value = self.filter(&d.value, tid)?;
                if value.same(&d.value) {
                    return Ok(exp.clone());
                }
                make_disabled(&Exp::Ref(d.disabled.clone()), value, None)
            }
            Exp::Array(_) if tid.call_mode() == CallMode::Array => {
                let elem = tid.element().unwrap_or_else(|| tid.clone());
                self.filter_children(exp, &elem)
            }
            Exp::Map(m) if tid.call_mode() == CallMode::Map => {
                let elem = tid.element().unwrap_or_else(|| tid.clone());
                let filtered = self.filter_children(exp, &elem)?;
                if m.kind == MapKind::Dict {
                    return Ok(filtered);
                }
                let Exp::Map(fm) = &filtered else {
                    return Ok(filtered);
                };
                Ok(Exp::dict(fm.entries.clone()))
            }
            Exp::Map(m) if tid.call_mode() == CallMode::Single => {
                match self.types.struct_decl(&tid.tname).cloned() {
                    Some(decl) => {
                        let mut out = BTreeMap::new();
                        let mut changed = m.kind != MapKind::Struct || m.entries.len() != decl.members.len();
                        for member in &decl.members {
                            let v = m
                                .entries
                                .get(&member.id)
                                .ok_or_else(|| ResolveError::MissingMember(member.id.clone()))?;
                            let f = self
                                .filter(v, &member.tname)
                                .map_err(|e| e.context(format!("member {}", member.id)))?;
                            changed |= !f.same(v);
                            out.insert(member.id.clone(), f);
                        }
                        if !changed {
                            return Ok(exp.clone());
                        }
                        Ok(Exp::Map(Arc::new(MapExp {
                            kind: MapKind::Struct,
                            entries: out,
                        })))
                    }
                    None if tid.tname == "map" => Ok(exp.clone()),
                    None => self.check_leaf(exp, tid),
                }
            }
            _ => self.check_leaf(exp, tid),
        }
    }

    fn filter_children(&mut self, exp: &Exp, elem: &TypeId) -> Result<Exp, ResolveError> {
        let mut errors = Vec::new();
        let out = exp.map_children(|e| {
            self.filter(e, elem).unwrap_or_else(|err| {
                errors.push(err);
                e.clone()
            })
        });
        finish(out, errors)
    }

    /// Check a literal the structural walk could not descend into.
    fn check_leaf(&mut self, exp: &Exp, tid: &TypeId) -> Result<Exp, ResolveError> {
        let Some(json) = exp.to_literal_json() else {
            return Ok(exp.clone());
        };
        let ty = self
            .types
            .get(tid)
            .ok_or_else(|| ResolveError::UnknownType(tid.to_string()))?;
        let outcome = ty.filter_literal(&json, self.types);
        if outcome.fatal {
            return Err(ResolveError::LiteralType {
                ty: tid.clone(),
                message: outcome.error.unwrap_or_default(),
            });
        }
        if outcome.value == json {
            Ok(exp.clone())
        } else {
            Ok(Exp::from_literal_json(&outcome.value, tid, self.types))
        }
    }
}
