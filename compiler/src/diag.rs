// diag.rs — Coded diagnostics for resolution errors
//
// Flattens a `ResolveError` tree into one diagnostic per leaf cause, each
// with a stable code, the innermost known source location and the chain of
// nodes and bindings it was reported through.
//
// Preconditions: none.
// Postconditions: every leaf error yields exactly one diagnostic.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ast::SourceLoc;
use crate::error::{ResolveError, ShapeError};

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0202`).
///
/// Once assigned, a code keeps its meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    // E01xx: names
    pub const UNKNOWN_CALLABLE: DiagCode = DiagCode("E0101");
    pub const UNKNOWN_PARAMETER: DiagCode = DiagCode("E0102");
    pub const UNKNOWN_CALL: DiagCode = DiagCode("E0103");
    pub const UNKNOWN_TYPE: DiagCode = DiagCode("E0104");
    pub const DUPLICATE_CALLABLE: DiagCode = DiagCode("E0105");
    // E02xx: shapes
    pub const MIXED_MODES: DiagCode = DiagCode("E0201");
    pub const ARRAY_LENGTH: DiagCode = DiagCode("E0202");
    pub const MAP_KEYS: DiagCode = DiagCode("E0203");
    pub const NOT_EMPTY: DiagCode = DiagCode("E0204");
    pub const MAPPING_MODE: DiagCode = DiagCode("E0205");
    // E03xx: indices
    pub const INDEX_MODE: DiagCode = DiagCode("E0301");
    pub const INDEX_RANGE: DiagCode = DiagCode("E0302");
    pub const KEY_NOT_FOUND: DiagCode = DiagCode("E0303");
    pub const INCONSISTENT_INDEX: DiagCode = DiagCode("E0304");
    // E04xx: types
    pub const DISABLE_NOT_BOOL: DiagCode = DiagCode("E0401");
    pub const DISABLE_NULL: DiagCode = DiagCode("E0402");
    pub const BAD_PATH: DiagCode = DiagCode("E0403");
    pub const NOT_ASSIGNABLE: DiagCode = DiagCode("E0404");
    pub const LITERAL_TYPE: DiagCode = DiagCode("E0405");
    pub const NESTED_MAP: DiagCode = DiagCode("E0406");
    pub const DISABLE_MAYBE_NULL: DiagCode = DiagCode("E0407");
    // E05xx: limits
    pub const FQID_TOO_LONG: DiagCode = DiagCode("E0501");
    // E09xx: defects
    pub const INTERNAL: DiagCode = DiagCode("E0900");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Cause record ─────────────────────────────────────────────────────────

/// One frame on the way from the root call to the failing binding.
#[derive(Debug, Clone, PartialEq)]
pub struct CauseRecord {
    pub message: String,
    pub loc: Option<SourceLoc>,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub loc: Option<SourceLoc>,
    pub message: String,
    pub hint: Option<String>,
    pub cause_chain: Vec<CauseRecord>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            loc: None,
            message: message.into(),
            hint: None,
            cause_chain: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_loc(mut self, loc: SourceLoc) -> Self {
        self.loc = Some(loc);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a cause record to the chain.
    pub fn with_cause(mut self, message: impl Into<String>, loc: Option<SourceLoc>) -> Self {
        self.cause_chain.push(CauseRecord {
            message: message.into(),
            loc,
        });
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(loc) = &self.loc {
            write!(f, "\n  --> {}", loc)?;
        }
        for cause in &self.cause_chain {
            write!(f, "\n   = in {}", cause.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

// ── Conversion ───────────────────────────────────────────────────────────

/// One diagnostic per leaf of `err`.
pub fn diagnostics(err: &ResolveError) -> Vec<Diagnostic> {
    err.leaf_contexts()
        .into_iter()
        .map(|(frames, leaf)| {
            let mut d = Diagnostic::new(DiagLevel::Error, leaf.to_string()).with_code(code_of(leaf));
            if let Some(loc) = frames
                .iter()
                .rev()
                .find_map(|(_, loc)| loc.filter(|l| !l.is_unknown()))
            {
                d = d.with_loc(loc.clone());
            }
            for (context, loc) in frames {
                d = d.with_cause(context, loc.cloned());
            }
            if let Some(hint) = hint_of(leaf) {
                d = d.with_hint(hint);
            }
            d
        })
        .collect()
}

pub fn code_of(err: &ResolveError) -> DiagCode {
    use ResolveError as E;
    match err {
        E::UnknownCallable(_) => codes::UNKNOWN_CALLABLE,
        E::UnknownParameter(_) => codes::UNKNOWN_PARAMETER,
        E::UnknownCall(_) => codes::UNKNOWN_CALL,
        E::UnknownType(_) => codes::UNKNOWN_TYPE,
        E::DuplicateCallable(_) => codes::DUPLICATE_CALLABLE,
        E::Shape(ShapeError::MixedModes) => codes::MIXED_MODES,
        E::Shape(ShapeError::ArrayLengthMismatch(..)) => codes::ARRAY_LENGTH,
        E::Shape(ShapeError::MapLengthMismatch(..) | ShapeError::MapKeyMissing(_)) => codes::MAP_KEYS,
        E::Shape(ShapeError::NotEmpty(_)) => codes::NOT_EMPTY,
        E::InvalidMappingMode(_) => codes::MAPPING_MODE,
        E::IndexMode { .. } => codes::INDEX_MODE,
        E::IndexOutOfRange { .. } => codes::INDEX_RANGE,
        E::KeyNotFound(_) => codes::KEY_NOT_FOUND,
        E::InconsistentIndex(..) => codes::INCONSISTENT_INDEX,
        E::DisableNotBoolean => codes::DISABLE_NOT_BOOL,
        E::DisableNull => codes::DISABLE_NULL,
        E::DisableMaybeNull { .. } => codes::DISABLE_MAYBE_NULL,
        E::NoMember { .. }
        | E::NoElement(_)
        | E::BindingWithinScalar(_)
        | E::PathThroughScalar(_)
        | E::MissingMember(_) => codes::BAD_PATH,
        E::NotAssignable { .. } => codes::NOT_ASSIGNABLE,
        E::LiteralType { .. } => codes::LITERAL_TYPE,
        E::NestedMap(_) => codes::NESTED_MAP,
        E::FqidTooLong { .. } => codes::FQID_TOO_LONG,
        E::Internal(_) => codes::INTERNAL,
        E::Context { source, .. } => code_of(source),
        E::Multiple(list) => list.first().map_or(codes::INTERNAL, code_of),
    }
}

fn hint_of(err: &ResolveError) -> Option<&'static str> {
    match err {
        ResolveError::Shape(ShapeError::MixedModes) => {
            Some("all splits of one mapped call must be over arrays, or all over maps")
        }
        ResolveError::Shape(_) => Some("every split of one mapped call must have the same length or keys"),
        ResolveError::FqidTooLong { .. } => Some("use shorter call aliases or a shallower pipeline nesting"),
        ResolveError::DisableNull => Some("bind `disabled` to a boolean or a reference to one"),
        ResolveError::DisableMaybeNull { .. } => {
            Some("disable the call on the same condition as the call that produced the value")
        }
        ResolveError::Internal(_) => Some("this is a bug in the resolver, not in the input"),
        _ => None,
    }
}
