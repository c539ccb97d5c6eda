// error.rs — Resolution error taxonomy and per-subtree accumulation
//
// Preconditions: none (types only).
// Postconditions: every failure the engine can report is a `ResolveError`.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use thiserror::Error;

use crate::ast::SourceLoc;
use crate::types::{CallMode, TypeId};

// ── Shape errors ────────────────────────────────────────────────────────────

/// Disagreement between two map-call sources that must share one shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("cannot split over both arrays and maps")]
    MixedModes,
    #[error("array length mismatch {0} vs {1}")]
    ArrayLengthMismatch(usize, usize),
    #[error("map length mismatch {0} vs {1}")]
    MapLengthMismatch(usize, usize),
    #[error("map key missing {0:?}")]
    MapKeyMissing(String),
    #[error("{0} was not empty")]
    NotEmpty(CallMode),
}

impl ShapeError {
    /// True for the two ways dictionary key sets can disagree.
    pub fn is_key_mismatch(&self) -> bool {
        matches!(
            self,
            ShapeError::MapLengthMismatch(..) | ShapeError::MapKeyMissing(_)
        )
    }
}

// ── Resolution errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ResolveError {
    // Unresolved names
    #[error("no callable object named {0}")]
    UnknownCallable(String),
    #[error("unknown parameter {0}")]
    UnknownParameter(String),
    #[error("unknown call name {0}")]
    UnknownCall(String),
    #[error("unknown type {0}")]
    UnknownType(String),
    #[error("duplicate callable {0}")]
    DuplicateCallable(String),

    // Shapes and indices
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("cannot use {index} key to index {collection}")]
    IndexMode {
        index: CallMode,
        collection: &'static str,
    },
    #[error("array index {index} out of range for array of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("key {0} not in map")]
    KeyNotFound(String),
    #[error("inconsistent index {0} vs {1}")]
    InconsistentIndex(String, String),

    // Types
    #[error("disabled control binding was not boolean")]
    DisableNotBoolean,
    #[error("disabled cannot be bound to a null value")]
    DisableNull,
    #[error("disabled was bound to a value which would be null at run time if {control} is true")]
    DisableMaybeNull { control: String },
    #[error("no member {member} in {ty}")]
    NoMember { member: String, ty: String },
    #[error("no element {0}")]
    NoElement(String),
    #[error("binding within a {0}")]
    BindingWithinScalar(&'static str),
    #[error("can't resolve path through {0}")]
    PathThroughScalar(TypeId),
    #[error("missing member {0}")]
    MissingMember(String),
    #[error("cannot assign {found} to {expected}")]
    NotAssignable { expected: TypeId, found: TypeId },
    #[error("invalid value for {ty}: {message}")]
    LiteralType { ty: TypeId, message: String },
    #[error("typed maps cannot be nested in {0}")]
    NestedMap(TypeId),
    #[error("invalid mapping mode {0}")]
    InvalidMappingMode(CallMode),

    // Resource limits
    #[error("fully-qualified id {fqid} is {len} bytes, exceeding the limit of {limit}")]
    FqidTooLong {
        fqid: String,
        len: usize,
        limit: usize,
    },

    // Defects
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{context}{}: {source}", at(.loc))]
    Context {
        context: String,
        loc: Option<SourceLoc>,
        #[source]
        source: Box<ResolveError>,
    },
    #[error("{}", DisplayList(.0))]
    Multiple(Vec<ResolveError>),
}

fn at(loc: &Option<SourceLoc>) -> String {
    match loc {
        Some(loc) if !loc.is_unknown() => format!(" (at {loc})"),
        _ => String::new(),
    }
}

struct DisplayList<'a>(&'a [ResolveError]);

impl fmt::Display for DisplayList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl ResolveError {
    pub fn internal(message: impl Into<String>) -> Self {
        ResolveError::Internal(message.into())
    }

    /// Wrap with the fqid or phrase naming where the error was discovered.
    pub fn context(self, context: impl Into<String>) -> Self {
        ResolveError::Context {
            context: context.into(),
            loc: None,
            source: Box::new(self),
        }
    }

    pub fn context_at(self, context: impl Into<String>, loc: &SourceLoc) -> Self {
        ResolveError::Context {
            context: context.into(),
            loc: Some(loc.clone()),
            source: Box::new(self),
        }
    }

    /// Internal-consistency failures abort resolution instead of accumulating.
    pub fn is_internal(&self) -> bool {
        match self {
            ResolveError::Internal(_) => true,
            ResolveError::Context { source, .. } => source.is_internal(),
            ResolveError::Multiple(list) => list.iter().any(ResolveError::is_internal),
            _ => false,
        }
    }

    /// The individual causes, with context wrappers and lists removed.
    pub fn leaves(&self) -> Vec<&ResolveError> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a ResolveError>) {
        match self {
            ResolveError::Context { source, .. } => source.collect_leaves(out),
            ResolveError::Multiple(list) => {
                for e in list {
                    e.collect_leaves(out);
                }
            }
            leaf => out.push(leaf),
        }
    }

    /// Context frames from outermost to innermost on the way to each leaf.
    pub fn leaf_contexts(&self) -> Vec<(Vec<(&str, Option<&SourceLoc>)>, &ResolveError)> {
        let mut out = Vec::new();
        self.collect_contexts(&mut Vec::new(), &mut out);
        out
    }

    fn collect_contexts<'a>(
        &'a self,
        stack: &mut Vec<(&'a str, Option<&'a SourceLoc>)>,
        out: &mut Vec<(Vec<(&'a str, Option<&'a SourceLoc>)>, &'a ResolveError)>,
    ) {
        match self {
            ResolveError::Context {
                context,
                loc,
                source,
            } => {
                stack.push((context.as_str(), loc.as_ref()));
                source.collect_contexts(stack, out);
                stack.pop();
            }
            ResolveError::Multiple(list) => {
                for e in list {
                    e.collect_contexts(stack, out);
                }
            }
            leaf => out.push((stack.clone(), leaf)),
        }
    }
}

// ── Accumulation ────────────────────────────────────────────────────────────

/// Errors collected while resolving one subtree.
///
/// `push` hands internal errors straight back so the caller can abort with `?`.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<ResolveError>);

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: ResolveError) -> Result<(), ResolveError> {
        if err.is_internal() {
            return Err(err);
        }
        self.0.push(err);
        Ok(())
    }

    /// Record the error of `result`, if any, and pass its value through.
    pub fn take<T>(&mut self, result: Result<T, ResolveError>) -> Result<Option<T>, ResolveError> {
        match result {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                self.push(e)?;
                Ok(None)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn into_result(mut self) -> Result<(), ResolveError> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(ResolveError::Multiple(self.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_display_includes_location() {
        let loc = SourceLoc::new("p.mro", 12);
        let e = ResolveError::UnknownParameter("x".into()).context_at("top.A", &loc);
        assert_eq!(e.to_string(), "top.A (at p.mro:12): unknown parameter x");
    }

    #[test]
    fn internal_errors_bypass_accumulation() {
        let mut errs = ErrorList::new();
        assert!(errs.push(ResolveError::DisableNull).is_ok());
        let r = errs.push(ResolveError::internal("no source").context("top"));
        assert!(r.is_err());
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn multiple_errors_accumulated_and_flattened() {
        let mut errs = ErrorList::new();
        errs.push(ResolveError::UnknownCall("A".into()).context("top.B"))
            .unwrap();
        errs.push(ResolveError::Shape(ShapeError::MixedModes))
            .unwrap();
        let err = errs.into_result().unwrap_err();
        let leaves = err.leaves();
        assert_eq!(leaves.len(), 2);
        assert!(matches!(leaves[0], ResolveError::UnknownCall(_)));
        assert!(matches!(
            leaves[1],
            ResolveError::Shape(ShapeError::MixedModes)
        ));
        let contexts = err.leaf_contexts();
        assert_eq!(contexts[0].0[0].0, "top.B");
        assert!(contexts[1].0.is_empty());
    }

    #[test]
    fn key_mismatch_classification() {
        assert!(ShapeError::MapKeyMissing("b".into()).is_key_mismatch());
        assert!(ShapeError::MapLengthMismatch(1, 2).is_key_mismatch());
        assert!(!ShapeError::ArrayLengthMismatch(1, 2).is_key_mismatch());
    }
}
