// exp.rs — Resolved expression model
//
// Expressions are immutable values with `Arc` payloads. A rewrite that
// changes nothing hands back the original (same allocation), so `same`
// detects "unchanged" in O(1) and subtrees stay shared between bindings.
//
// Preconditions: none.
// Postconditions: no operation here mutates an existing expression.
// Failure modes: none.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::ast::SourceLoc;
use crate::id::{NodeId, SourceId};
use crate::types::{CallMode, TypeId, TypeLookup};

// ── Indices ─────────────────────────────────────────────────────────────────

/// Position within one fork dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CollectionIndex {
    Array(usize),
    Key(String),
    /// Not known until run time; carries the dimension's source.
    Unknown(SourceId),
}

impl CollectionIndex {
    pub fn is_unknown(&self) -> bool {
        matches!(self, CollectionIndex::Unknown(_))
    }

    pub fn mode(&self) -> CallMode {
        match self {
            CollectionIndex::Array(_) => CallMode::Array,
            CollectionIndex::Key(_) => CallMode::Map,
            CollectionIndex::Unknown(_) => CallMode::Unknown,
        }
    }
}

impl fmt::Display for CollectionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionIndex::Array(i) => write!(f, "{i}"),
            CollectionIndex::Key(k) => write!(f, "{k:?}"),
            CollectionIndex::Unknown(s) => write!(f, "?{s}"),
        }
    }
}

/// Fork index per fork-root node.
pub type ForkMap = BTreeMap<NodeId, CollectionIndex>;

// ── Expressions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    Struct,
    Dict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapExp {
    pub kind: MapKind,
    pub entries: BTreeMap<String, Exp>,
}

/// An output of a stage, possibly indexed per fork.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefExp {
    /// Fully-qualified id of the producing stage.
    pub id: String,
    /// Dotted path into the stage's output struct.
    pub output_id: String,
    pub forks: ForkMap,
    /// Element selection applied after `output_id`.
    pub index: Vec<CollectionIndex>,
}

impl RefExp {
    pub fn new(id: impl Into<String>, output_id: impl Into<String>) -> Self {
        RefExp {
            id: id.into(),
            output_id: output_id.into(),
            forks: ForkMap::new(),
            index: Vec::new(),
        }
    }

    /// `id.output_id`, or just `id` for the whole output.
    pub fn target(&self) -> String {
        if self.output_id.is_empty() {
            self.id.clone()
        } else {
            format!("{}.{}", self.id, self.output_id)
        }
    }

    /// Interning key; structurally equal references share it.
    pub fn key(&self) -> String {
        let mut s = self.target();
        for i in &self.index {
            s.push_str(&format!("[{i}]"));
        }
        if !self.forks.is_empty() {
            s.push('{');
            for (n, i) in &self.forks {
                s.push_str(&format!("{n}={i};"));
            }
            s.push('}');
        }
        s
    }

    pub fn has_unknown_fork(&self) -> bool {
        self.forks.values().any(CollectionIndex::is_unknown)
    }
}

/// A collection being mapped over by `owner`.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitExp {
    pub value: Exp,
    pub owner: NodeId,
    pub source: SourceId,
    pub loc: SourceLoc,
}

/// Per-fork values of `owner` recombined into a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeExp {
    pub value: Exp,
    pub owner: NodeId,
    pub merge_over: SourceId,
    /// A stage that forks on `owner`, for run-time expansion.
    pub fork_node: Option<Arc<RefExp>>,
}

/// `value`, or null at run time when `disabled` is true.
#[derive(Debug, Clone, PartialEq)]
pub struct DisabledExp {
    pub value: Exp,
    pub disabled: Arc<RefExp>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Exp {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Arc<str>),
    Array(Arc<Vec<Exp>>),
    Map(Arc<MapExp>),
    Ref(Arc<RefExp>),
    Split(Arc<SplitExp>),
    Merge(Arc<MergeExp>),
    Disabled(Arc<DisabledExp>),
}

impl Exp {
    pub fn string(s: &str) -> Self {
        Exp::String(Arc::from(s))
    }

    pub fn array(items: Vec<Exp>) -> Self {
        Exp::Array(Arc::new(items))
    }

    pub fn dict(entries: BTreeMap<String, Exp>) -> Self {
        Exp::Map(Arc::new(MapExp {
            kind: MapKind::Dict,
            entries,
        }))
    }

    pub fn structure(entries: BTreeMap<String, Exp>) -> Self {
        Exp::Map(Arc::new(MapExp {
            kind: MapKind::Struct,
            entries,
        }))
    }

    pub fn reference(r: RefExp) -> Self {
        Exp::Ref(Arc::new(r))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Exp::Null => "null",
            Exp::Bool(_) => "boolean",
            Exp::Int(_) => "int",
            Exp::Float(_) => "float",
            Exp::String(_) => "string",
            Exp::Array(_) => "array",
            Exp::Map(m) if m.kind == MapKind::Struct => "struct",
            Exp::Map(_) => "map",
            Exp::Ref(_) => "reference",
            Exp::Split(_) => "split",
            Exp::Merge(_) => "merge",
            Exp::Disabled(d) => d.value.kind_name(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Exp::Null)
    }

    /// Identity for composite payloads, value equality for scalars.
    pub fn same(&self, other: &Exp) -> bool {
        match (self, other) {
            (Exp::Null, Exp::Null) => true,
            (Exp::Bool(a), Exp::Bool(b)) => a == b,
            (Exp::Int(a), Exp::Int(b)) => a == b,
            (Exp::Float(a), Exp::Float(b)) => a.to_bits() == b.to_bits(),
            (Exp::String(a), Exp::String(b)) => Arc::ptr_eq(a, b),
            (Exp::Array(a), Exp::Array(b)) => Arc::ptr_eq(a, b),
            (Exp::Map(a), Exp::Map(b)) => Arc::ptr_eq(a, b),
            (Exp::Ref(a), Exp::Ref(b)) => Arc::ptr_eq(a, b),
            (Exp::Split(a), Exp::Split(b)) => Arc::ptr_eq(a, b),
            (Exp::Merge(a), Exp::Merge(b)) => Arc::ptr_eq(a, b),
            (Exp::Disabled(a), Exp::Disabled(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// True when the expression contains no reference, split, merge or
    /// disable wrapper.
    pub fn is_literal(&self) -> bool {
        match self {
            Exp::Ref(_) | Exp::Split(_) | Exp::Merge(_) | Exp::Disabled(_) => false,
            Exp::Array(items) => items.iter().all(Exp::is_literal),
            Exp::Map(m) => m.entries.values().all(Exp::is_literal),
            _ => true,
        }
    }

    /// Plain JSON for literal expressions.
    pub fn to_literal_json(&self) -> Option<serde_json::Value> {
        use serde_json::Value;
        Some(match self {
            Exp::Null => Value::Null,
            Exp::Bool(b) => Value::Bool(*b),
            Exp::Int(i) => Value::from(*i),
            Exp::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Exp::String(s) => Value::String(s.to_string()),
            Exp::Array(items) => Value::Array(
                items
                    .iter()
                    .map(Exp::to_literal_json)
                    .collect::<Option<Vec<_>>>()?,
            ),
            Exp::Map(m) => {
                let mut obj = serde_json::Map::new();
                for (k, v) in &m.entries {
                    obj.insert(k.clone(), v.to_literal_json()?);
                }
                Value::Object(obj)
            }
            Exp::Ref(_) | Exp::Split(_) | Exp::Merge(_) | Exp::Disabled(_) => return None,
        })
    }

    /// Rebuild a literal from JSON, typing objects as structs or dicts by `tid`.
    pub fn from_literal_json(value: &serde_json::Value, tid: &TypeId, lookup: &dyn TypeLookup) -> Exp {
        use serde_json::Value;
        match value {
            Value::Null => Exp::Null,
            Value::Bool(b) => Exp::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) if tid.tname != "float" => Exp::Int(i),
                _ => Exp::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => Exp::string(s),
            Value::Array(items) => {
                let elem = tid.element().unwrap_or_else(|| tid.clone());
                Exp::array(
                    items
                        .iter()
                        .map(|v| Exp::from_literal_json(v, &elem, lookup))
                        .collect(),
                )
            }
            Value::Object(obj) => {
                let decl = match tid.call_mode() {
                    CallMode::Single => lookup.struct_decl(&tid.tname),
                    _ => None,
                };
                let entries = obj.iter().map(|(k, v)| {
                    let member = match decl {
                        Some(d) => d
                            .member(k)
                            .map_or_else(|| TypeId::new("map"), |m| m.tname.clone()),
                        None => tid.element().unwrap_or_else(|| tid.clone()),
                    };
                    (k.clone(), Exp::from_literal_json(v, &member, lookup))
                });
                Exp::Map(Arc::new(MapExp {
                    kind: if decl.is_some() {
                        MapKind::Struct
                    } else {
                        MapKind::Dict
                    },
                    entries: entries.collect(),
                }))
            }
        }
    }

    /// Every reference in the expression, including inside splits and merges
    /// and the controls of disable wrappers.
    pub fn refs(&self) -> Vec<Arc<RefExp>> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs(&self, out: &mut Vec<Arc<RefExp>>) {
        match self {
            Exp::Ref(r) => out.push(r.clone()),
            Exp::Array(items) => items.iter().for_each(|e| e.collect_refs(out)),
            Exp::Map(m) => m.entries.values().for_each(|e| e.collect_refs(out)),
            Exp::Split(s) => s.value.collect_refs(out),
            Exp::Merge(m) => m.value.collect_refs(out),
            Exp::Disabled(d) => {
                d.value.collect_refs(out);
                out.push(d.disabled.clone());
            }
            _ => {}
        }
    }

    /// Nodes this expression is split over.
    ///
    /// Split owners and unknown reference fork indices count. A merge removes
    /// its owner unless the owner was already present outside it.
    pub fn split_owners(&self, owners: &mut BTreeSet<NodeId>) {
        match self {
            Exp::Split(s) => {
                owners.insert(s.owner);
                s.value.split_owners(owners);
            }
            Exp::Merge(m) => {
                let had = owners.contains(&m.owner);
                m.value.split_owners(owners);
                if !had {
                    owners.remove(&m.owner);
                }
            }
            Exp::Ref(r) => unknown_forks(r, owners),
            Exp::Disabled(d) => {
                d.value.split_owners(owners);
                unknown_forks(&d.disabled, owners);
            }
            Exp::Array(items) => items.iter().for_each(|e| e.split_owners(owners)),
            Exp::Map(m) => m.entries.values().for_each(|e| e.split_owners(owners)),
            _ => {}
        }
    }

    /// Splits owned by `owner`, as (location, value, source).
    pub fn splits_owned_by(&self, owner: NodeId, out: &mut Vec<(SourceLoc, Exp, SourceId)>) {
        match self {
            Exp::Split(s) => {
                if s.owner == owner {
                    out.push((s.loc.clone(), s.value.clone(), s.source));
                }
                s.value.splits_owned_by(owner, out);
            }
            Exp::Merge(m) => m.value.splits_owned_by(owner, out),
            Exp::Disabled(d) => d.value.splits_owned_by(owner, out),
            Exp::Array(items) => items.iter().for_each(|e| e.splits_owned_by(owner, out)),
            Exp::Map(m) => m.entries.values().for_each(|e| e.splits_owned_by(owner, out)),
            _ => {}
        }
    }

    /// Copy with every split owned by `owner` re-pointed at `source`.
    pub fn with_split_source(&self, owner: NodeId, source: SourceId) -> Exp {
        match self {
            Exp::Split(s) => {
                let value = s.value.with_split_source(owner, source);
                let src = if s.owner == owner { source } else { s.source };
                if value.same(&s.value) && src == s.source {
                    return self.clone();
                }
                Exp::Split(Arc::new(SplitExp {
                    value,
                    owner: s.owner,
                    source: src,
                    loc: s.loc.clone(),
                }))
            }
            Exp::Merge(m) => {
                let value = m.value.with_split_source(owner, source);
                if value.same(&m.value) {
                    return self.clone();
                }
                Exp::Merge(Arc::new(MergeExp {
                    value,
                    ..(**m).clone()
                }))
            }
            _ => self.map_children(|e| e.with_split_source(owner, source)),
        }
    }

    /// Rebuild arrays, maps and disable wrappers from rewritten children,
    /// keeping the original allocation when no child changed.
    pub fn map_children(&self, mut f: impl FnMut(&Exp) -> Exp) -> Exp {
        match self {
            Exp::Array(items) => {
                let mapped: Vec<Exp> = items.iter().map(&mut f).collect();
                if mapped.iter().zip(items.iter()).all(|(a, b)| a.same(b)) {
                    self.clone()
                } else {
                    Exp::array(mapped)
                }
            }
            Exp::Map(m) => {
                let mapped: BTreeMap<String, Exp> =
                    m.entries.iter().map(|(k, v)| (k.clone(), f(v))).collect();
                if mapped
                    .values()
                    .zip(m.entries.values())
                    .all(|(a, b)| a.same(b))
                {
                    self.clone()
                } else {
                    Exp::Map(Arc::new(MapExp {
                        kind: m.kind,
                        entries: mapped,
                    }))
                }
            }
            Exp::Disabled(d) => {
                let value = f(&d.value);
                if value.same(&d.value) {
                    self.clone()
                } else {
                    Exp::Disabled(Arc::new(DisabledExp {
                        value,
                        disabled: d.disabled.clone(),
                    }))
                }
            }
            _ => self.clone(),
        }
    }

    /// First reference forked on `owner`, skipping `exclude`.
    ///
    /// Fork nodes already recorded on nested merges are not consulted. A
    /// split by `owner` over a merge also accepts a reference forked on the
    /// merge's owner.
    pub fn fork_ref_for(&self, owner: NodeId, exclude: &str) -> Option<Arc<RefExp>> {
        match self {
            Exp::Ref(r) if r.forks.contains_key(&owner) && r.id != exclude => Some(r.clone()),
            Exp::Array(items) => items.iter().find_map(|e| e.fork_ref_for(owner, exclude)),
            Exp::Map(m) => m
                .entries
                .values()
                .find_map(|e| e.fork_ref_for(owner, exclude)),
            Exp::Disabled(d) => d
                .value
                .fork_ref_for(owner, exclude)
                .or_else(|| Exp::Ref(d.disabled.clone()).fork_ref_for(owner, exclude)),
            Exp::Split(s) => s.value.fork_ref_for(owner, exclude).or_else(|| match &s.value {
                Exp::Merge(inner) if s.owner == owner => inner.value.fork_ref_for(inner.owner, exclude),
                _ => None,
            }),
            Exp::Merge(m) => m.value.fork_ref_for(owner, exclude),
            _ => None,
        }
    }
}

fn unknown_forks(r: &RefExp, owners: &mut BTreeSet<NodeId>) {
    for (n, i) in &r.forks {
        if i.is_unknown() {
            owners.insert(*n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(id: &str, forks: &[(u32, CollectionIndex)]) -> Exp {
        let mut re = RefExp::new(id, "out");
        for (n, i) in forks {
            re.forks.insert(NodeId(*n), i.clone());
        }
        Exp::reference(re)
    }

    fn split(owner: u32, value: Exp, line: u32) -> Exp {
        Exp::Split(Arc::new(SplitExp {
            value,
            owner: NodeId(owner),
            source: SourceId(9),
            loc: SourceLoc::new("p.mro", line),
        }))
    }

    #[test]
    fn same_is_identity_for_composites() {
        let a = Exp::array(vec![Exp::Int(1)]);
        let b = Exp::array(vec![Exp::Int(1)]);
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
        assert_eq!(a, b);
        assert!(Exp::Int(3).same(&Exp::Int(3)));
    }

    #[test]
    fn split_owners_respects_merges() {
        let unknown = CollectionIndex::Unknown(SourceId(2));
        let inner = r("top.A", &[(1, unknown.clone()), (2, unknown)]);
        let merged = Exp::Merge(Arc::new(MergeExp {
            value: inner,
            owner: NodeId(2),
            merge_over: SourceId(2),
            fork_node: None,
        }));
        let mut owners = BTreeSet::new();
        merged.split_owners(&mut owners);
        assert_eq!(owners.into_iter().collect::<Vec<_>>(), vec![NodeId(1)]);

        let both = Exp::array(vec![split(2, Exp::array(vec![]), 1), merged]);
        let mut owners = BTreeSet::new();
        both.split_owners(&mut owners);
        assert_eq!(owners.len(), 2);
    }

    #[test]
    fn split_sources_rewritten_copy_on_write() {
        let s = split(1, Exp::array(vec![Exp::Int(1)]), 4);
        let other = split(2, Exp::array(vec![]), 5);
        let e = Exp::structure(
            [("a".to_string(), s), ("b".to_string(), other.clone())]
                .into_iter()
                .collect(),
        );
        let mut found = Vec::new();
        e.splits_owned_by(NodeId(1), &mut found);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.line, 4);

        let rewritten = e.with_split_source(NodeId(1), SourceId(40));
        assert!(!rewritten.same(&e));
        let Exp::Map(m) = &rewritten else { panic!() };
        let Exp::Split(a) = &m.entries["a"] else { panic!() };
        assert_eq!(a.source, SourceId(40));
        assert!(m.entries["b"].same(&other));
        assert!(e.with_split_source(NodeId(7), SourceId(40)).same(&e));
    }

    #[test]
    fn literal_json_conversion() {
        let e = Exp::dict(
            [("k".to_string(), Exp::array(vec![Exp::Int(1), Exp::Null]))]
                .into_iter()
                .collect(),
        );
        assert_eq!(
            e.to_literal_json(),
            Some(serde_json::json!({"k": [1, null]}))
        );
        assert_eq!(r("top.A", &[]).to_literal_json(), None);
        assert!(e.is_literal());
    }

    #[test]
    fn fork_ref_excludes_owner_fqid() {
        let unknown = CollectionIndex::Unknown(SourceId(0));
        let e = Exp::array(vec![
            r("top.P", &[(3, unknown.clone())]),
            r("top.P.S", &[(3, unknown)]),
        ]);
        let found = e.fork_ref_for(NodeId(3), "top.P").unwrap();
        assert_eq!(found.id, "top.P.S");
        assert!(e.fork_ref_for(NodeId(4), "").is_none());
    }

    #[test]
    fn fork_ref_hops_from_split_into_merged_value() {
        let unknown = CollectionIndex::Unknown(SourceId(0));
        let inner = r("top.P.INNER.S", &[(2, unknown)]);
        let merged = Exp::Merge(Arc::new(MergeExp {
            value: inner,
            owner: NodeId(2),
            merge_over: SourceId(0),
            fork_node: Some(Arc::new(RefExp::new("top.P.ELSEWHERE", "out"))),
        }));
        // A merge's recorded fork node is never returned.
        assert!(merged.fork_ref_for(NodeId(2), "").is_some_and(|f| f.id == "top.P.INNER.S"));
        assert!(merged.fork_ref_for(NodeId(5), "").is_none());

        let split = split(5, merged, 3);
        let found = split.fork_ref_for(NodeId(5), "top.P.AFTER").unwrap();
        assert_eq!(found.id, "top.P.INNER.S");
        assert!(split.fork_ref_for(NodeId(6), "").is_none());
    }

    #[test]
    fn disabled_wrapper_exposes_its_control() {
        let unknown = CollectionIndex::Unknown(SourceId(1));
        let control = Arc::new({
            let mut c = RefExp::new("top.F", "flag");
            c.forks.insert(NodeId(4), unknown);
            c
        });
        let d = Exp::Disabled(Arc::new(DisabledExp {
            value: r("top.S", &[]),
            disabled: control.clone(),
        }));
        let refs = d.refs();
        assert_eq!(refs.len(), 2);
        assert!(Arc::ptr_eq(&refs[1], &control));

        let mut owners = BTreeSet::new();
        d.split_owners(&mut owners);
        assert!(owners.contains(&NodeId(4)));
        assert_eq!(d.fork_ref_for(NodeId(4), "").unwrap().id, "top.F");
        assert!(!d.is_literal());
        assert_eq!(d.kind_name(), "reference");
        assert!(d.map_children(|e| e.clone()).same(&d));
    }

    #[test]
    fn ref_keys_distinguish_forks() {
        let a = RefExp::new("top.A", "out");
        let mut b = a.clone();
        b.forks.insert(NodeId(1), CollectionIndex::Array(0));
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), "top.A.out");
    }
}
