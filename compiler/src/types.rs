// types.rs — Type identifiers and the type oracle consulted during resolution
//
// The engine never inspects a type beyond `Type` and `TypeLookup`. `TypeTable`
// is the concrete table the CLI builds from the input document: builtins,
// user file types, user structs, and one implicit struct per callable whose
// members are its output parameters.
//
// Preconditions: struct definitions reference only known type names.
// Postconditions: `TypeTable::get` answers for every well-formed `TypeId`.
// Failure modes: `ResolveError::UnknownType`, `ResolveError::NestedMap`.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ResolveError;

// ── Call modes ──────────────────────────────────────────────────────────────

/// How a call, source or type fans out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CallMode {
    Single,
    Array,
    Map,
    Unknown,
    Null,
}

impl CallMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CallMode::Single => "simple",
            CallMode::Array => "array",
            CallMode::Map => "map",
            CallMode::Unknown => "unknown",
            CallMode::Null => "null",
        }
    }

    /// Single and Unknown carry no shape information for unification.
    pub fn is_shapeless(self) -> bool {
        matches!(self, CallMode::Single | CallMode::Unknown)
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Type identifiers ────────────────────────────────────────────────────────

pub const NULL_TYPE: &str = "null";

/// A type name with array and typed-map dimensions.
///
/// `map_dim` counts the typed-map layer plus any array dimensions inside it,
/// so `map<int[]>[]` is `{ tname: "int", array_dim: 1, map_dim: 2 }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeId {
    pub tname: String,
    pub array_dim: u16,
    pub map_dim: u16,
}

impl TypeId {
    pub fn new(tname: impl Into<String>) -> Self {
        TypeId {
            tname: tname.into(),
            array_dim: 0,
            map_dim: 0,
        }
    }

    pub fn null() -> Self {
        TypeId::new(NULL_TYPE)
    }

    pub fn array_of(mut self, dims: u16) -> Self {
        self.array_dim += dims;
        self
    }

    pub fn is_null(&self) -> bool {
        self.tname == NULL_TYPE && self.array_dim == 0 && self.map_dim == 0
    }

    /// The outermost collection layer.
    pub fn call_mode(&self) -> CallMode {
        if self.array_dim > 0 {
            CallMode::Array
        } else if self.map_dim > 0 {
            CallMode::Map
        } else if self.tname == NULL_TYPE {
            CallMode::Null
        } else {
            CallMode::Single
        }
    }

    /// Type of one element of the outermost collection layer.
    pub fn element(&self) -> Option<TypeId> {
        let mut t = self.clone();
        if t.array_dim > 0 {
            t.array_dim -= 1;
        } else if t.map_dim > 0 {
            t.array_dim = t.map_dim - 1;
            t.map_dim = 0;
        } else {
            return None;
        }
        Some(t)
    }

    /// Type of a collection of `self` in the given mode.
    pub fn add_dim(&self, mode: CallMode) -> Result<TypeId, ResolveError> {
        let mut t = self.clone();
        match mode {
            CallMode::Array => t.array_dim += 1,
            CallMode::Map => {
                if t.map_dim > 0 {
                    return Err(ResolveError::NestedMap(self.clone()));
                }
                t.map_dim = t.array_dim + 1;
                t.array_dim = 0;
            }
            CallMode::Null => return Ok(TypeId::null()),
            CallMode::Single | CallMode::Unknown => {}
        }
        Ok(t)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.map_dim > 0 {
            write!(f, "map<{}", self.tname)?;
            for _ in 1..self.map_dim {
                f.write_str("[]")?;
            }
            f.write_str(">")?;
        } else {
            f.write_str(&self.tname)?;
        }
        for _ in 0..self.array_dim {
            f.write_str("[]")?;
        }
        Ok(())
    }
}

fn strip_dims(mut s: &str) -> (&str, u16) {
    let mut dims = 0;
    while let Some(rest) = s.strip_suffix("[]") {
        s = rest.trim_end();
        dims += 1;
    }
    (s, dims)
}

impl FromStr for TypeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, array_dim) = strip_dims(s.trim());
        if let Some(inner) = base.strip_prefix("map<").and_then(|b| b.strip_suffix('>')) {
            let (tname, inner_dim) = strip_dims(inner.trim());
            if tname.is_empty() || tname.contains(['<', '>']) {
                return Err(format!("invalid type {s:?}"));
            }
            return Ok(TypeId {
                tname: tname.to_string(),
                array_dim,
                map_dim: inner_dim + 1,
            });
        }
        let valid = !base.is_empty()
            && base
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(format!("invalid type {s:?}"));
        }
        Ok(TypeId {
            tname: base.to_string(),
            array_dim,
            map_dim: 0,
        })
    }
}

impl TryFrom<String> for TypeId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TypeId> for String {
    fn from(t: TypeId) -> String {
        t.to_string()
    }
}

// ── Oracle traits ───────────────────────────────────────────────────────────

/// Result of filtering a literal against a declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub value: Value,
    pub fatal: bool,
    pub error: Option<String>,
}

impl FilterOutcome {
    fn ok(value: Value) -> Self {
        FilterOutcome {
            value,
            fatal: false,
            error: None,
        }
    }

    fn fatal(value: Value, message: String) -> Self {
        FilterOutcome {
            value,
            fatal: true,
            error: Some(message),
        }
    }
}

/// One resolved type, opaque to the engine.
pub trait Type: fmt::Debug + Send + Sync {
    fn type_id(&self) -> TypeId;
    fn is_assignable_from(&self, other: &dyn Type, lookup: &dyn TypeLookup) -> bool;
    /// Reduce a JSON literal to what this type admits. Extra struct keys are
    /// dropped with a non-fatal error; anything inadmissible is fatal.
    fn filter_literal(&self, value: &Value, lookup: &dyn TypeLookup) -> FilterOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructMember {
    pub id: String,
    pub tname: TypeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructDecl {
    pub id: String,
    #[serde(default)]
    pub members: Vec<StructMember>,
}

impl StructDecl {
    pub fn member(&self, id: &str) -> Option<&StructMember> {
        self.members.iter().find(|m| m.id == id)
    }
}

pub trait TypeLookup {
    fn get(&self, id: &TypeId) -> Option<Arc<dyn Type>>;
    fn struct_decl(&self, tname: &str) -> Option<&StructDecl>;
}

// ── Path typing ─────────────────────────────────────────────────────────────

/// Type obtained by projecting `path` out of a value of type `tid`.
///
/// Projection distributes over arrays and typed maps, so the collection
/// dimensions of `tid` are kept and the member type is nested inside them.
pub fn binding_type(
    path: &str,
    tid: &TypeId,
    lookup: &dyn TypeLookup,
) -> Result<TypeId, ResolveError> {
    if path.is_empty() {
        return Ok(tid.clone());
    }
    let (head, rest) = match path.split_once('.') {
        Some((h, r)) => (h, r),
        None => (path, ""),
    };
    let Some(decl) = lookup.struct_decl(&tid.tname) else {
        if tid.tname == "map" {
            // Untyped maps admit any path; the result is untyped as well.
            return Ok(tid.clone());
        }
        return Err(ResolveError::PathThroughScalar(tid.clone()));
    };
    let member = decl.member(head).ok_or_else(|| ResolveError::NoMember {
        member: head.to_string(),
        ty: tid.to_string(),
    })?;
    let inner = binding_type(rest, &member.tname, lookup)?;
    let mut out = inner;
    if tid.map_dim > 0 {
        if out.map_dim > 0 {
            return Err(ResolveError::NestedMap(tid.clone()));
        }
        out.map_dim = out.array_dim + tid.map_dim;
        out.array_dim = tid.array_dim;
    } else {
        out.array_dim += tid.array_dim;
    }
    Ok(out)
}

// ── Concrete table ──────────────────────────────────────────────────────────

const BUILTINS: &[&str] = &["int", "float", "string", "bool", "map", "path", "file"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Base {
    Builtin(&'static str),
    FileType(String),
    Null,
    Struct(String),
}

/// A resolved type handed out by `TypeTable`.
#[derive(Debug, Clone)]
pub struct TableType {
    id: TypeId,
    base: Base,
}

impl TableType {
    fn is_stringish(&self) -> bool {
        match &self.base {
            Base::Builtin(name) => matches!(*name, "string" | "path" | "file"),
            Base::FileType(_) => true,
            _ => false,
        }
    }

    fn dims_match(&self, other: &TypeId) -> bool {
        self.id.array_dim == other.array_dim && self.id.map_dim == other.map_dim
    }

    fn filter_scalar(&self, value: &Value, lookup: &dyn TypeLookup) -> FilterOutcome {
        let ok = match (&self.base, value) {
            (_, Value::Null) => true,
            (Base::Null, _) => false,
            (Base::Builtin("int"), Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Base::Builtin("float"), Value::Number(_)) => true,
            (Base::Builtin("bool"), Value::Bool(_)) => true,
            (Base::Builtin("map"), Value::Object(_)) => true,
            (Base::Struct(name), Value::Object(obj)) => {
                return filter_struct(&self.id, name, obj, lookup);
            }
            (_, Value::String(_)) => self.is_stringish(),
            _ => false,
        };
        if ok {
            FilterOutcome::ok(value.clone())
        } else {
            FilterOutcome::fatal(
                value.clone(),
                format!("expected {}, found {}", self.id, json_kind(value)),
            )
        }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn filter_struct(
    tid: &TypeId,
    name: &str,
    obj: &serde_json::Map<String, Value>,
    lookup: &dyn TypeLookup,
) -> FilterOutcome {
    let Some(decl) = lookup.struct_decl(name) else {
        return FilterOutcome::fatal(Value::Object(obj.clone()), format!("unknown type {tid}"));
    };
    let mut out = serde_json::Map::new();
    let mut error = None;
    for member in &decl.members {
        let Some(v) = obj.get(&member.id) else {
            return FilterOutcome::fatal(
                Value::Object(obj.clone()),
                format!("missing member {}", member.id),
            );
        };
        let Some(mt) = lookup.get(&member.tname) else {
            return FilterOutcome::fatal(v.clone(), format!("unknown type {}", member.tname));
        };
        let inner = mt.filter_literal(v, lookup);
        if inner.fatal {
            return inner;
        }
        if inner.error.is_some() {
            error = inner.error;
        }
        out.insert(member.id.clone(), inner.value);
    }
    if let Some(extra) = obj.keys().find(|k| decl.member(k).is_none()) {
        error = Some(format!("unexpected member {extra} in {tid}"));
    }
    FilterOutcome {
        value: Value::Object(out),
        fatal: false,
        error,
    }
}

impl Type for TableType {
    fn type_id(&self) -> TypeId {
        self.id.clone()
    }

    fn is_assignable_from(&self, other: &dyn Type, lookup: &dyn TypeLookup) -> bool {
        let oid = other.type_id();
        if oid.is_null() || self.id == oid {
            return true;
        }
        // Untyped maps accept any typed map or struct.
        if self.id.tname == "map" && self.id.array_dim == oid.array_dim && self.id.map_dim == 0 {
            return oid.map_dim > 0 || lookup.struct_decl(&oid.tname).is_some() || oid.tname == "map";
        }
        if !self.dims_match(&oid) {
            return false;
        }
        let Some(base) = lookup.get(&TypeId::new(oid.tname.clone())) else {
            return false;
        };
        match &self.base {
            Base::Builtin("float") => oid.tname == "int",
            Base::Struct(name) => {
                // Structural: every member we need must be present and assignable.
                let (Some(want), Some(have)) =
                    (lookup.struct_decl(name), lookup.struct_decl(&oid.tname))
                else {
                    return false;
                };
                want.members.iter().all(|m| {
                    have.member(&m.id).is_some_and(|h| {
                        match (lookup.get(&m.tname), lookup.get(&h.tname)) {
                            (Some(mt), Some(ht)) => mt.is_assignable_from(ht.as_ref(), lookup),
                            _ => false,
                        }
                    })
                })
            }
            _ => {
                let scalar = TableType {
                    id: TypeId::new(self.id.tname.clone()),
                    base: self.base.clone(),
                };
                scalar.is_stringish() && base_is_stringish(base.as_ref(), lookup)
            }
        }
    }

    fn filter_literal(&self, value: &Value, lookup: &dyn TypeLookup) -> FilterOutcome {
        if self.id.array_dim > 0 || self.id.map_dim > 0 {
            let Some(elem_id) = self.id.element() else {
                return FilterOutcome::ok(value.clone());
            };
            let Some(elem) = lookup.get(&elem_id) else {
                return FilterOutcome::fatal(value.clone(), format!("unknown type {elem_id}"));
            };
            let mut error = None;
            return match (self.id.call_mode(), value) {
                (_, Value::Null) => FilterOutcome::ok(Value::Null),
                (CallMode::Array, Value::Array(items)) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        let r = elem.filter_literal(item, lookup);
                        if r.fatal {
                            return r;
                        }
                        error = error.or(r.error);
                        out.push(r.value);
                    }
                    FilterOutcome {
                        value: Value::Array(out),
                        fatal: false,
                        error,
                    }
                }
                (CallMode::Map, Value::Object(obj)) => {
                    let mut out = serde_json::Map::new();
                    for (k, v) in obj {
                        let r = elem.filter_literal(v, lookup);
                        if r.fatal {
                            return r;
                        }
                        error = error.or(r.error);
                        out.insert(k.clone(), r.value);
                    }
                    FilterOutcome {
                        value: Value::Object(out),
                        fatal: false,
                        error,
                    }
                }
                _ => FilterOutcome::fatal(
                    value.clone(),
                    format!("expected {}, found {}", self.id, json_kind(value)),
                ),
            };
        }
        self.filter_scalar(value, lookup)
    }
}

fn base_is_stringish(t: &dyn Type, lookup: &dyn TypeLookup) -> bool {
    let id = t.type_id();
    matches!(id.tname.as_str(), "string" | "path" | "file")
        || (lookup.struct_decl(&id.tname).is_none()
            && !BUILTINS.contains(&id.tname.as_str())
            && id.tname != NULL_TYPE)
}

/// Builtins, user file types and struct declarations.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    structs: BTreeMap<String, StructDecl>,
    file_types: BTreeSet<String>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_struct(&mut self, decl: StructDecl) {
        self.structs.insert(decl.id.clone(), decl);
    }

    pub fn add_file_type(&mut self, name: impl Into<String>) {
        self.file_types.insert(name.into());
    }

    /// Every member type of every struct must be known.
    pub fn check(&self) -> Result<(), ResolveError> {
        for decl in self.structs.values() {
            for m in &decl.members {
                if self.get(&m.tname).is_none() {
                    return Err(ResolveError::UnknownType(m.tname.to_string())
                        .context(format!("struct {}", decl.id)));
                }
            }
        }
        Ok(())
    }

    fn base(&self, tname: &str) -> Option<Base> {
        if tname == NULL_TYPE {
            return Some(Base::Null);
        }
        if let Some(b) = BUILTINS.iter().find(|b| **b == tname) {
            return Some(Base::Builtin(b));
        }
        if self.structs.contains_key(tname) {
            return Some(Base::Struct(tname.to_string()));
        }
        if self.file_types.contains(tname) {
            return Some(Base::FileType(tname.to_string()));
        }
        None
    }
}

impl TypeLookup for TypeTable {
    fn get(&self, id: &TypeId) -> Option<Arc<dyn Type>> {
        let base = self.base(&id.tname)?;
        Some(Arc::new(TableType {
            id: id.clone(),
            base,
        }))
    }

    fn struct_decl(&self, tname: &str) -> Option<&StructDecl> {
        self.structs.get(tname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> TypeTable {
        let mut t = TypeTable::new();
        t.add_file_type("bam");
        t.add_struct(StructDecl {
            id: "POINT".into(),
            members: vec![
                StructMember {
                    id: "x".into(),
                    tname: TypeId::new("int"),
                },
                StructMember {
                    id: "tags".into(),
                    tname: "map<string[]>".parse().unwrap(),
                },
            ],
        });
        t
    }

    fn tid(s: &str) -> TypeId {
        s.parse().unwrap()
    }

    #[test]
    fn type_ids_round_trip_through_text() {
        for s in ["int", "int[]", "map<int>", "map<int[]>[]", "POINT[][]"] {
            assert_eq!(tid(s).to_string(), s);
        }
        let t = tid("map<int[]>[]");
        assert_eq!((t.array_dim, t.map_dim), (1, 2));
        assert!("map<map<int>>".parse::<TypeId>().is_err());
        assert!("".parse::<TypeId>().is_err());
    }

    #[test]
    fn element_peels_outer_layer() {
        let t = tid("map<int[]>[]");
        let e1 = t.element().unwrap();
        assert_eq!(e1.to_string(), "map<int[]>");
        let e2 = e1.element().unwrap();
        assert_eq!(e2.to_string(), "int[]");
        assert_eq!(tid("int").element(), None);
    }

    #[test]
    fn add_dim_by_mode() {
        assert_eq!(tid("int[]").add_dim(CallMode::Map).unwrap().to_string(), "map<int[]>");
        assert_eq!(tid("int").add_dim(CallMode::Array).unwrap().to_string(), "int[]");
        assert!(tid("map<int>").add_dim(CallMode::Map).is_err());
        assert!(tid("int").add_dim(CallMode::Null).unwrap().is_null());
    }

    #[test]
    fn binding_type_distributes_over_collections() {
        let t = table();
        let out = binding_type("x", &tid("map<POINT>"), &t).unwrap();
        assert_eq!(out.to_string(), "map<int>");
        let out = binding_type("x", &tid("POINT[]"), &t).unwrap();
        assert_eq!(out.to_string(), "int[]");
        let out = binding_type("tags", &tid("POINT[]"), &t).unwrap();
        assert_eq!(out.to_string(), "map<string[]>[]");
        assert!(matches!(
            binding_type("tags", &tid("map<POINT>"), &t),
            Err(ResolveError::NestedMap(_))
        ));
        assert!(matches!(
            binding_type("y", &tid("POINT"), &t),
            Err(ResolveError::NoMember { .. })
        ));
        assert!(matches!(
            binding_type("y", &tid("int"), &t),
            Err(ResolveError::PathThroughScalar(_))
        ));
    }

    #[test]
    fn filter_drops_extra_members_and_rejects_missing() {
        let t = table();
        let ty = t.get(&tid("POINT")).unwrap();
        let r = ty.filter_literal(&json!({"x": 1, "tags": {}, "z": 3}), &t);
        assert!(!r.fatal);
        assert!(r.error.is_some());
        assert_eq!(r.value, json!({"x": 1, "tags": {}}));

        let r = ty.filter_literal(&json!({"x": 1}), &t);
        assert!(r.fatal);
        assert_eq!(r.error.as_deref(), Some("missing member tags"));
    }

    #[test]
    fn filter_checks_scalars_and_collections() {
        let t = table();
        let ints = t.get(&tid("int[]")).unwrap();
        assert!(!ints.filter_literal(&json!([1, 2, null]), &t).fatal);
        assert!(ints.filter_literal(&json!([1, "a"]), &t).fatal);
        let bam = t.get(&tid("bam")).unwrap();
        assert!(!bam.filter_literal(&json!("x.bam"), &t).fatal);
        let fl = t.get(&tid("float")).unwrap();
        assert!(!fl.filter_literal(&json!(3), &t).fatal);
    }

    #[test]
    fn assignability() {
        let t = table();
        let get = |s: &str| t.get(&tid(s)).unwrap();
        assert!(get("float").is_assignable_from(get("int").as_ref(), &t));
        assert!(!get("int").is_assignable_from(get("float").as_ref(), &t));
        assert!(get("map").is_assignable_from(get("POINT").as_ref(), &t));
        assert!(get("path").is_assignable_from(get("bam").as_ref(), &t));
        assert!(!get("int[]").is_assignable_from(get("int").as_ref(), &t));
        assert!(get("int").is_assignable_from(get("null").as_ref(), &t));
    }
}
