// source.rs — Map-call sources and their unification
//
// A source describes the collection a mapped call iterates over. Sources
// live in an arena and are compared by handle, so two literal arrays of the
// same length are still different sources. Unification groups sources that
// must agree into a `Set`, which is updated in place so every holder of the
// set's handle observes the union.
//
// Preconditions: handles passed in were allocated by the same arena.
// Postconditions: `merge` never changes the shape of a known-length source.
// Failure modes: `ShapeError` for mixed modes, lengths or key sets.
// Side effects: `merge` may allocate a set or mutate an existing one.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::trace;

use crate::error::ShapeError;
use crate::exp::{Exp, MapKind, RefExp};
use crate::id::SourceId;
use crate::types::CallMode;

// ── Sources ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum MapSource {
    /// Literal array of known length.
    Array { len: usize },
    /// Literal dictionary with known keys.
    Dict { keys: BTreeSet<String> },
    /// Mapping over null: zero forks.
    Null,
    /// Upstream stage output; shape known only at run time.
    Reference { reference: Arc<RefExp>, mode: CallMode },
    /// A split whose element shapes differ per outer fork.
    Nested { value: Exp, mode: CallMode },
    /// Stands in for a shape nobody has described yet.
    UnknownShape { mode: CallMode },
    /// Sources required to agree; `master` speaks for the set.
    Set {
        master: SourceId,
        members: BTreeSet<SourceId>,
    },
}

pub const EMPTY_ARRAY: SourceId = SourceId(0);
pub const EMPTY_MAP: SourceId = SourceId(1);

static NO_KEYS: BTreeSet<String> = BTreeSet::new();

#[derive(Debug, Clone)]
pub struct SourceArena {
    entries: Vec<MapSource>,
    references: HashMap<String, SourceId>,
}

impl Default for SourceArena {
    fn default() -> Self {
        SourceArena {
            entries: vec![
                MapSource::Array { len: 0 },
                MapSource::Dict {
                    keys: BTreeSet::new(),
                },
            ],
            references: HashMap::new(),
        }
    }
}

impl SourceArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn alloc(&mut self, source: MapSource) -> SourceId {
        let id = SourceId(self.entries.len() as u32);
        self.entries.push(source);
        id
    }

    /// The source for an upstream reference. Structurally equal references
    /// yield the same handle.
    pub fn reference(&mut self, reference: &Arc<RefExp>, mode: CallMode) -> SourceId {
        let key = reference.key();
        if let Some(id) = self.references.get(&key) {
            return *id;
        }
        let id = self.alloc(MapSource::Reference {
            reference: reference.clone(),
            mode,
        });
        self.references.insert(key, id);
        id
    }

    pub fn get(&self, id: SourceId) -> &MapSource {
        &self.entries[id.index()]
    }

    /// Follows set masters down to a concrete source.
    pub fn master(&self, mut id: SourceId) -> SourceId {
        while let MapSource::Set { master, .. } = self.get(id) {
            if *master == id {
                break;
            }
            id = *master;
        }
        id
    }

    pub fn call_mode(&self, id: SourceId) -> CallMode {
        match self.get(self.master(id)) {
            MapSource::Array { .. } => CallMode::Array,
            MapSource::Dict { .. } => CallMode::Map,
            MapSource::Null => CallMode::Null,
            MapSource::Reference { mode, .. }
            | MapSource::Nested { mode, .. }
            | MapSource::UnknownShape { mode } => *mode,
            MapSource::Set { .. } => CallMode::Unknown,
        }
    }

    pub fn known_length(&self, id: SourceId) -> bool {
        matches!(
            self.get(self.master(id)),
            MapSource::Array { .. } | MapSource::Dict { .. } | MapSource::Null
        )
    }

    /// Zero unless the master is a literal array.
    pub fn array_len(&self, id: SourceId) -> usize {
        match self.get(self.master(id)) {
            MapSource::Array { len } => *len,
            _ => 0,
        }
    }

    /// Empty unless the master is a literal dictionary.
    pub fn keys(&self, id: SourceId) -> &BTreeSet<String> {
        match self.get(self.master(id)) {
            MapSource::Dict { keys } => keys,
            _ => &NO_KEYS,
        }
    }

    /// Known to produce no forks.
    pub fn is_known_empty(&self, id: SourceId) -> bool {
        self.known_length(id)
            && match self.call_mode(id) {
                CallMode::Array => self.array_len(id) == 0,
                CallMode::Map => self.keys(id).is_empty(),
                CallMode::Null => true,
                _ => false,
            }
    }

    fn is_placeholder(&self, id: SourceId) -> bool {
        matches!(
            self.get(id),
            MapSource::UnknownShape {
                mode: CallMode::Array | CallMode::Map
            }
        )
    }

    fn as_reference(&self, id: SourceId) -> Option<&RefExp> {
        match self.get(id) {
            MapSource::Reference { reference, .. } => Some(reference),
            _ => None,
        }
    }

    fn is_set(&self, id: SourceId) -> bool {
        matches!(self.get(id), MapSource::Set { .. })
    }

    /// Same mode, and same length or keys where known.
    pub fn shape_eq(&self, a: SourceId, b: SourceId) -> bool {
        self.call_mode(a) == self.call_mode(b)
            && self.known_length(a) == self.known_length(b)
            && self.array_len(a) == self.array_len(b)
            && self.keys(a) == self.keys(b)
    }

    // ── Shape of expressions ────────────────────────────────────────────────

    /// The source describing the collection `value` evaluates to.
    ///
    /// `mode` is the collection mode implied by the value's type and is used
    /// where the value itself carries no shape.
    pub fn source_for_value(&mut self, value: &Exp, mode: CallMode) -> SourceId {
        match value {
            Exp::Array(items) => self.alloc(MapSource::Array { len: items.len() }),
            Exp::Map(m) if m.kind == MapKind::Dict => self.alloc(MapSource::Dict {
                keys: m.entries.keys().cloned().collect(),
            }),
            Exp::Null => self.alloc(MapSource::Null),
            Exp::Ref(r) => self.reference(r, mode),
            Exp::Merge(m) => m.merge_over,
            Exp::Split(s) => match self.uniform_shape(&s.value) {
                Some(shape) => self.alloc(shape),
                None => self.alloc(MapSource::Nested {
                    value: value.clone(),
                    mode,
                }),
            },
            _ => self.alloc(MapSource::UnknownShape { mode }),
        }
    }

    /// The shared shape of every element of a literal collection, if any.
    fn uniform_shape(&self, value: &Exp) -> Option<MapSource> {
        let elements: Vec<&Exp> = match value {
            Exp::Array(items) => items.iter().collect(),
            Exp::Map(m) if m.kind == MapKind::Dict => m.entries.values().collect(),
            _ => return None,
        };
        let mut shape = None;
        for e in elements {
            let this = match e {
                Exp::Array(items) => MapSource::Array { len: items.len() },
                Exp::Map(m) if m.kind == MapKind::Dict => MapSource::Dict {
                    keys: m.entries.keys().cloned().collect(),
                },
                Exp::Null => MapSource::Null,
                _ => return None,
            };
            match &shape {
                None => shape = Some(this),
                Some(s) if *s == this => {}
                Some(_) => return None,
            }
        }
        shape
    }

    // ── Unification ─────────────────────────────────────────────────────────

    /// Unify two sources that must describe the same fork dimension.
    pub fn merge(
        &mut self,
        a: Option<SourceId>,
        b: Option<SourceId>,
    ) -> Result<Option<SourceId>, ShapeError> {
        if a == b {
            return Ok(a);
        }
        let (a, b) = match (a, b) {
            (a, None) => return Ok(a),
            (None, b) => return Ok(b),
            (Some(a), Some(b)) => (a, b),
        };
        if self.call_mode(b).is_shapeless() {
            return Ok(Some(a));
        }
        if self.call_mode(a).is_shapeless() {
            return Ok(Some(b));
        }
        let (am, bm) = (self.call_mode(a), self.call_mode(b));
        if am != bm && am != CallMode::Null && bm != CallMode::Null {
            return Err(ShapeError::MixedModes);
        } else if bm == CallMode::Null {
            return Ok(Some(a));
        } else if am == CallMode::Null {
            return Ok(Some(b));
        }
        if self.is_placeholder(b) {
            return Ok(Some(a));
        }
        if self.is_placeholder(a) {
            return Ok(Some(b));
        }
        if self.known_length(a) && self.known_length(b) {
            self.check_lengths(a, b)?;
        }
        let merged = if self.is_set(a) {
            if self.is_set(b) {
                self.merge_sets(a, b)
            } else {
                self.add_to_set(a, b)
            }
        } else if self.is_set(b) {
            self.add_to_set(b, a)
        } else {
            self.new_set(a, b)
        };
        trace!(%a, %b, %merged, "unified map sources");
        Ok(Some(merged))
    }

    fn check_lengths(&self, a: SourceId, b: SourceId) -> Result<(), ShapeError> {
        match self.call_mode(a) {
            CallMode::Array => {
                let (la, lb) = (self.array_len(a), self.array_len(b));
                if la != lb {
                    return Err(ShapeError::ArrayLengthMismatch(la, lb));
                }
            }
            CallMode::Map => {
                let (ka, kb) = (self.keys(a), self.keys(b));
                if ka.len() != kb.len() {
                    return Err(ShapeError::MapLengthMismatch(ka.len(), kb.len()));
                }
                if let Some(k) = ka.iter().find(|k| !kb.contains(*k)) {
                    return Err(ShapeError::MapKeyMissing(k.clone()));
                }
            }
            CallMode::Null => match self.call_mode(b) {
                CallMode::Array if self.array_len(b) != 0 => {
                    return Err(ShapeError::NotEmpty(CallMode::Array));
                }
                CallMode::Map if !self.keys(b).is_empty() => {
                    return Err(ShapeError::NotEmpty(CallMode::Map));
                }
                _ => {}
            },
            _ => {}
        }
        Ok(())
    }

    fn set_parts(&mut self, id: SourceId) -> (&mut SourceId, &mut BTreeSet<SourceId>) {
        match &mut self.entries[id.index()] {
            MapSource::Set { master, members } => (master, members),
            _ => unreachable!("set_parts called on a non-set source"),
        }
    }

    fn merge_sets(&mut self, a: SourceId, b: SourceId) -> SourceId {
        let (into, from) = if self.known_length(a) || !self.known_length(b) {
            (a, b)
        } else {
            (b, a)
        };
        let (_, from_members) = self.set_parts(from);
        let moved = from_members.clone();
        let (_, into_members) = self.set_parts(into);
        into_members.extend(moved);
        into
    }

    /// The empty literal of the set's mode, standing in for a null member.
    fn empty_for(&self, mode: CallMode) -> Option<SourceId> {
        match mode {
            CallMode::Array => Some(EMPTY_ARRAY),
            CallMode::Map => Some(EMPTY_MAP),
            _ => None,
        }
    }

    fn add_to_set(&mut self, set: SourceId, other: SourceId) -> SourceId {
        let promote = !self.known_length(set) && self.known_length(other);
        let new_master = if !promote {
            None
        } else if self.call_mode(other) == CallMode::Null {
            Some(self.empty_for(self.call_mode(set)).unwrap_or(other))
        } else {
            Some(other)
        };
        let (master, members) = self.set_parts(set);
        members.insert(other);
        if let Some(m) = new_master {
            *master = m;
        }
        set
    }

    fn new_set(&mut self, a: SourceId, b: SourceId) -> SourceId {
        let (am, bm) = (self.call_mode(a), self.call_mode(b));
        let mut master = a;
        if am == CallMode::Null {
            if let Some(empty) = self.empty_for(bm) {
                master = empty;
            }
        }
        if !self.known_length(master) {
            if self.known_length(b) {
                master = if bm == CallMode::Null {
                    self.empty_for(am).unwrap_or(master)
                } else {
                    b
                };
            } else if let Some(ra) = self.as_reference(master) {
                // Fully-qualified ids win over bare ones.
                if !ra.id.contains('.') && self.as_reference(b).is_some_and(|rb| rb.id.contains('.')) {
                    master = b;
                }
            } else if self.as_reference(b).is_some() {
                master = b;
            }
        } else if self.known_length(b)
            && self.as_reference(master).is_none()
            && self.as_reference(b).is_some()
        {
            master = b;
        }
        self.alloc(MapSource::Set {
            master,
            members: [a, b].into_iter().collect(),
        })
    }

    /// Short human-readable description, for logs and messages.
    pub fn describe(&self, id: SourceId) -> String {
        match self.get(self.master(id)) {
            MapSource::Array { len } => format!("array[{len}]"),
            MapSource::Dict { keys } => format!("map{keys:?}"),
            MapSource::Null => "null".to_string(),
            MapSource::Reference { reference, mode } => format!("{} ({mode})", reference.target()),
            MapSource::Nested { mode, .. } => format!("nested {mode}"),
            MapSource::UnknownShape { mode } => format!("unknown {mode}"),
            MapSource::Set { .. } => "set".to_string(),
        }
    }
}
