// disable.rs — Disable-condition propagation
//
// A node's disable list is the ordered set of conditions under which it is
// skipped. It starts from the parent's list, short-circuits on a literal
// true, and appends the call's own `using(disabled = ...)` binding unless
// that binding is statically decided. A condition a call adds also wraps
// its outputs, so consumers see null wherever the call would not run.
//
// Preconditions: the parent's list has already been computed.
// Postconditions: a literal true, when present, is the only element.
// Failure modes: `ResolveError::DisableNull`, `ResolveError::DisableNotBoolean`,
//   `ResolveError::DisableMaybeNull`.
// Side effects: none beyond source allocation during binding resolution.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ast::CallSite;
use crate::binding::{Projector, Scope};
use crate::error::ResolveError;
use crate::exp::{CollectionIndex, DisabledExp, Exp, ForkMap, MapKind, MergeExp, SplitExp};
use crate::id::NodeId;
use crate::types::TypeId;

/// Reserved name of the disable binding in `using(...)`.
pub const DISABLED_BINDING: &str = "disabled";

pub fn is_always_disabled(list: &[Exp]) -> bool {
    matches!(list.first(), Some(Exp::Bool(true)))
}

/// The list of a node that never runs.
pub fn always_disable(parent: &[Exp]) -> Vec<Exp> {
    match parent.first() {
        Some(first @ Exp::Bool(true)) => vec![first.clone()],
        _ => vec![Exp::Bool(true)],
    }
}

/// Compute a call's disable list from its parent's.
///
/// `mapped_empty` is true when the call maps over a statically empty
/// collection.
pub fn resolve_disable(
    projector: &mut Projector<'_>,
    parent: &[Exp],
    call: &CallSite,
    owner: NodeId,
    mapped_empty: bool,
    scope: Scope<'_>,
) -> Result<Vec<Exp>, ResolveError> {
    let mut disable: &[Exp] = parent;
    while let Some(Exp::Bool(b)) = disable.first() {
        if *b {
            return Ok(disable[..1].to_vec());
        }
        disable = &disable[1..];
    }
    let disable = disable.to_vec();
    if mapped_empty {
        return Ok(vec![Exp::Bool(true)]);
    }
    let Some(ast) = &call.modifiers.disabled else {
        return Ok(disable);
    };
    let binding = projector
        .resolve_binding(ast, &TypeId::new("bool"), owner, scope)
        .map_err(|e| e.context(DISABLED_BINDING))?;
    resolve_disable_exp(binding.exp, disable)
}

fn resolve_disable_exp(r: Exp, mut disable: Vec<Exp>) -> Result<Vec<Exp>, ResolveError> {
    match &r {
        Exp::Ref(_) => {
            if !disable.iter().any(|d| d.same(&r)) {
                disable.push(r);
            }
            Ok(disable)
        }
        // Only usable when the wrapper's control already disables this call.
        Exp::Disabled(d) => {
            let covered = disable
                .iter()
                .any(|e| matches!(e, Exp::Ref(c) if **c == *d.disabled));
            if covered {
                resolve_disable_exp(d.value.clone(), disable)
            } else {
                Err(ResolveError::DisableMaybeNull {
                    control: d.disabled.target(),
                })
            }
        }
        Exp::Null => Err(ResolveError::DisableNull),
        Exp::Bool(true) => Ok(vec![r]),
        Exp::Bool(false) => Ok(disable),
        Exp::Split(s) => match &s.value {
            Exp::Array(items) => {
                let items: Vec<&Exp> = items.iter().collect();
                disable_split(&r, &items, disable)
            }
            Exp::Map(m) if m.kind == MapKind::Dict => {
                let items: Vec<&Exp> = m.entries.values().collect();
                disable_split(&r, &items, disable)
            }
            Exp::Map(_) => Err(ResolveError::DisableNotBoolean),
            Exp::Merge(m) => resolve_disable_exp(m.value.clone(), disable),
            other => resolve_disable_exp(other.clone(), disable),
        },
        _ => Err(ResolveError::DisableNotBoolean),
    }
}

/// A split of conditions is only kept when its elements disagree.
fn disable_split(r: &Exp, items: &[&Exp], disable: Vec<Exp>) -> Result<Vec<Exp>, ResolveError> {
    match items {
        [] => return Ok(disable),
        [only] => return resolve_disable_exp((*only).clone(), disable),
        _ => {}
    }
    let (mut any_true, mut any_false, mut dynamic) = (false, false, false);
    for item in items {
        match item {
            Exp::Bool(true) => any_true = true,
            Exp::Bool(false) => any_false = true,
            Exp::Ref(_) | Exp::Null => dynamic = true,
            _ => return Err(ResolveError::DisableNotBoolean),
        }
    }
    if !dynamic && !any_true {
        return Ok(disable);
    }
    if !dynamic && !any_false {
        return Ok(vec![items[0].clone()]);
    }
    let mut disable = disable;
    disable.push(r.clone());
    Ok(disable)
}

// ── Output wrapping ─────────────────────────────────────────────────────────

/// `inner`, or null whenever `control` is true.
///
/// `current` is handed back unchanged when it already wraps `inner` on
/// `control`. A split control stays a split of per-fork results unless all
/// its conditions agree.
pub fn make_disabled(
    control: &Exp,
    inner: Exp,
    current: Option<&Arc<DisabledExp>>,
) -> Result<Exp, ResolveError> {
    if inner.is_null() {
        return Ok(inner);
    }
    match control {
        Exp::Bool(true) => Ok(Exp::Null),
        Exp::Bool(false) => Ok(inner),
        Exp::Ref(r) => {
            if let Some(d) = current {
                if inner.same(&d.value) && Arc::ptr_eq(r, &d.disabled) {
                    return Ok(Exp::Disabled(d.clone()));
                }
            }
            if let Exp::Disabled(d) = &inner {
                if *d.disabled == **r {
                    return Ok(inner);
                }
            }
            Ok(Exp::Disabled(Arc::new(DisabledExp {
                value: inner,
                disabled: r.clone(),
            })))
        }
        Exp::Disabled(d) => Err(ResolveError::DisableMaybeNull {
            control: d.disabled.target(),
        }),
        Exp::Split(s) => match &s.value {
            Exp::Array(items) => {
                let Some(first) = items.first() else {
                    return Ok(Exp::Null);
                };
                if items.iter().all(|c| c == first) {
                    return make_disabled(first, inner, current);
                }
                let items = items
                    .iter()
                    .map(|c| make_disabled(c, inner.clone(), None))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(resplit(s, Exp::array(items)))
            }
            Exp::Map(m) if m.kind == MapKind::Dict => {
                let Some(first) = m.entries.values().next() else {
                    return Ok(Exp::Null);
                };
                if m.entries.values().all(|c| c == first) {
                    return make_disabled(first, inner, current);
                }
                let mut entries = BTreeMap::new();
                for (k, c) in &m.entries {
                    entries.insert(k.clone(), make_disabled(c, inner.clone(), None)?);
                }
                Ok(resplit(s, Exp::dict(entries)))
            }
            Exp::Null => Ok(Exp::Null),
            _ => Err(ResolveError::DisableNotBoolean),
        },
        Exp::Null => Err(ResolveError::DisableNull),
        _ => Err(ResolveError::DisableNotBoolean),
    }
}

/// Wrap a stage's outputs in one of the conditions the stage added.
///
/// Each condition of a split over a literal is applied to the fork it
/// belongs to. When the outputs are merged over the split's owner the
/// per-fork results go inside the merge, so expanding it yields null for
/// the disabled forks.
pub fn wrap_disabled(projector: &mut Projector<'_>, control: &Exp, exp: Exp) -> Result<Exp, ResolveError> {
    if exp.is_null() {
        return Ok(exp);
    }
    let s = match control {
        Exp::Split(s) => s,
        Exp::Ref(_) | Exp::Bool(_) => return make_disabled(control, exp, None),
        _ => return Ok(exp),
    };
    if let Exp::Merge(m) = &exp {
        if m.owner == s.owner {
            let value = wrap_disabled(projector, control, m.value.clone())?;
            return Ok(Exp::Merge(Arc::new(MergeExp {
                value,
                owner: m.owner,
                merge_over: m.merge_over,
                fork_node: m.fork_node.clone(),
            })));
        }
    }
    match &s.value {
        Exp::Ref(r) => Ok(Exp::Disabled(Arc::new(DisabledExp {
            value: exp,
            disabled: r.clone(),
        }))),
        Exp::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, c) in items.iter().enumerate() {
                let fork = ForkMap::from([(s.owner, CollectionIndex::Array(i))]);
                let wrapped = wrap_disabled(projector, c, exp.clone())?;
                out.push(projector.project(&wrapped, "", &fork)?);
            }
            Ok(resplit(s, Exp::array(out)))
        }
        Exp::Map(m) if m.kind == MapKind::Dict => {
            let mut entries = BTreeMap::new();
            for (k, c) in &m.entries {
                let fork = ForkMap::from([(s.owner, CollectionIndex::Key(k.clone()))]);
                let wrapped = wrap_disabled(projector, c, exp.clone())?;
                entries.insert(k.clone(), projector.project(&wrapped, "", &fork)?);
            }
            Ok(resplit(s, Exp::dict(entries)))
        }
        _ => Err(ResolveError::DisableNotBoolean),
    }
}

fn resplit(s: &SplitExp, value: Exp) -> Exp {
    Exp::Split(Arc::new(SplitExp {
        value,
        owner: s.owner,
        source: s.source,
        loc: s.loc.clone(),
    }))
}
