// resolve.rs — Call graph resolution
//
// Resolves a constructed call graph top-down (inputs, disable lists, map
// sources, fork roots, outputs) and then collapses statically known fan-out
// bottom-up in the unsplit pass.
//
// Preconditions: the graph was built from `ast` by `GraphBuilder`.
// Postconditions: every node carries resolved inputs, outputs, a disable list
//   and its fork roots; merges over statically known sources are expanded.
// Failure modes: user-facing errors accumulate per subtree and are wrapped
//   with the fqid and call location of the node that reported them.
//   `ResolveError::Internal` aborts immediately.
// Side effects: none.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, instrument, trace};

use crate::ast::{Ast, CallSite, Callable};
use crate::binding::{BindingMap, Projector, ResolvedBinding, Scope};
use crate::disable::{always_disable, make_disabled, resolve_disable, wrap_disabled};
use crate::error::{ErrorList, ResolveError};
use crate::exp::{CollectionIndex, Exp, ForkMap, MergeExp, RefExp, SplitExp};
use crate::graph::{CallGraph, CallGraphNode, GraphBuilder, NodeKind};
use crate::id::{NodeId, SourceId};
use crate::source::SourceArena;
use crate::types::{CallMode, TypeId};

// ── Entry points ────────────────────────────────────────────────────────────

/// Build and resolve the call graph of `call`.
///
/// The graph is returned even when resolution fails, for diagnostics; it
/// should not be treated as valid in that case.
#[instrument(level = "debug", skip(ast, call), fields(call = %call.id))]
pub fn build_call_graph(ast: &Ast, prefix: &str, call: &CallSite) -> (CallGraph, Result<(), ResolveError>) {
    build(ast, prefix, call, false)
}

/// Like `build_call_graph`, but a top-level stage call is first wrapped in a
/// single-call pipeline so the root is always a pipeline.
#[instrument(level = "debug", skip(ast, call), fields(call = %call.id))]
pub fn build_pipeline_call_graph(
    ast: &Ast,
    prefix: &str,
    call: &CallSite,
) -> (CallGraph, Result<(), ResolveError>) {
    build(ast, prefix, call, true)
}

fn build(ast: &Ast, prefix: &str, call: &CallSite, wrap: bool) -> (CallGraph, Result<(), ResolveError>) {
    let (mut graph, built) = GraphBuilder::new(ast, prefix).build(call, wrap);
    if let Err(e) = built {
        return (graph, Err(e));
    }
    let Some(root) = graph.root else {
        return (graph, Err(ResolveError::internal("graph has no root")));
    };
    let CallGraph { nodes, sources, .. } = &mut graph;
    let mut resolver = Resolver { ast, nodes, sources };
    let result = resolver
        .resolve(root, &BindingMap::new(), &[])
        .and_then(|()| resolver.unsplit(root))
        .map(|()| resolver.fill_fork_nodes());
    debug!(nodes = graph.len(), sources = graph.sources.len(), ok = result.is_ok(), "resolved");
    (graph, result)
}

// ── Resolver ────────────────────────────────────────────────────────────────

struct Resolver<'a> {
    ast: &'a Ast,
    nodes: &'a mut Vec<CallGraphNode>,
    sources: &'a mut SourceArena,
}

/// What a node needs from its parent while resolving its own bindings.
struct ParentView {
    inputs: Option<BindingMap>,
    disable: Vec<Exp>,
}

impl<'a> Resolver<'a> {
    fn node(&self, id: NodeId) -> &CallGraphNode {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut CallGraphNode {
        &mut self.nodes[id.index()]
    }

    fn projector(&mut self) -> Projector<'_> {
        Projector::new(self.sources, self.ast.types())
    }

    /// Conditions `id` added to its parent's disable list.
    fn added_disable(&self, id: NodeId) -> Vec<Exp> {
        let inherited = self.node(id).parent.map_or(0, |p| self.node(p).disable.len());
        self.node(id).disable.get(inherited..).unwrap_or_default().to_vec()
    }

    fn parent_view(&self, id: NodeId) -> ParentView {
        match self.node(id).parent {
            Some(p) => ParentView {
                inputs: self.node(p).inputs.clone(),
                disable: self.node(p).disable.clone(),
            },
            None => ParentView {
                inputs: None,
                disable: Vec::new(),
            },
        }
    }

    /// The unified source of a fork root.
    fn fork_source(&self, root: NodeId) -> Result<SourceId, ResolveError> {
        self.node(root).source.ok_or_else(|| {
            ResolveError::internal(format!("fork root {} has no map source", self.node(root).fqid))
        })
    }

    fn resolve(&mut self, id: NodeId, siblings: &BindingMap, mapped: &[NodeId]) -> Result<(), ResolveError> {
        trace!(fqid = %self.node(id).fqid, "resolving");
        let result = match self.node(id).kind {
            NodeKind::Stage => self.resolve_stage(id, siblings, mapped),
            NodeKind::Pipeline => self.resolve_pipeline(id, siblings, mapped),
        };
        result.map_err(|e| {
            let node = self.node(id);
            e.context_at(node.fqid.clone(), &node.call.loc)
        })
    }

    // ── Inputs ──────────────────────────────────────────────────────────────

    /// Resolve bindings and the disable list, unify the node's map source
    /// and compute its fork roots.
    fn resolve_inputs(&mut self, id: NodeId, siblings: &BindingMap, mapped: &[NodeId]) -> Result<(), ResolveError> {
        let parent = self.parent_view(id);
        let call = self.node(id).call.clone();
        let callable = self.node(id).callable.clone();
        let scope = Scope {
            inputs: parent.inputs.as_ref(),
            calls: siblings,
        };
        let mut errs = ErrorList::new();

        let inputs = if call.bindings.is_empty() {
            None
        } else {
            let mut resolved = BindingMap::new();
            for b in &call.bindings {
                let Some(param) = callable.in_param(&b.id) else {
                    errs.push(ResolveError::UnknownParameter(b.id.clone()).context_at("input parameter", &b.loc))?;
                    continue;
                };
                match self.projector().resolve_binding(&b.exp, &param.tname, id, scope) {
                    Ok(r) => {
                        resolved.insert(b.id.clone(), r);
                    }
                    Err(e) => errs.push(e.context(format!("input parameter {}", b.id)))?,
                }
            }
            Some(resolved)
        };

        let mapped_empty = self.is_empty_mapping(id, inputs.as_ref());
        let disable = match resolve_disable(
            &mut self.projector(),
            &parent.disable,
            &call,
            id,
            mapped_empty,
            scope,
        ) {
            Ok(d) => d,
            Err(e) => {
                errs.push(e.context_at("disable", &call.loc))?;
                parent.disable.clone()
            }
        };

        let (mut inputs, mut disable) = (inputs, disable);
        let source = match self.unify_sources(id, inputs.as_ref(), &disable) {
            Ok(source) => source,
            Err(e) => {
                errs.push(e)?;
                None
            }
        };
        if let Some(root) = source {
            trace!(fqid = %self.node(id).fqid, source = %self.sources.describe(root), "unified map source");
            if let Some(ins) = inputs.as_mut() {
                for b in ins.values_mut() {
                    b.exp = b.exp.with_split_source(id, root);
                }
            }
            for d in disable.iter_mut() {
                *d = d.with_split_source(id, root);
            }
        }
        let forks = fork_roots(id, inputs.as_ref(), &disable, mapped, source.is_some());

        let node = self.node_mut(id);
        node.inputs = inputs;
        node.disable = disable;
        node.source = source;
        node.forks = forks;
        errs.into_result()
    }

    /// True when a top-level split the node owns is statically empty.
    fn is_empty_mapping(&self, id: NodeId, inputs: Option<&BindingMap>) -> bool {
        inputs.is_some_and(|ins| {
            ins.values().any(|b| match &b.exp {
                Exp::Split(s) if s.owner == id => {
                    is_empty_collection(&s.value) || self.sources.is_known_empty(s.source)
                }
                _ => false,
            })
        })
    }

    /// Fold the sources of every split owned by `id`, in location order.
    fn unify_sources(
        &mut self,
        id: NodeId,
        inputs: Option<&BindingMap>,
        disable: &[Exp],
    ) -> Result<Option<SourceId>, ResolveError> {
        let mut splits = Vec::new();
        for b in inputs.into_iter().flat_map(|m| m.values()) {
            b.exp.splits_owned_by(id, &mut splits);
        }
        for d in disable {
            d.splits_owned_by(id, &mut splits);
        }
        splits.sort_by(|a, b| a.0.cmp(&b.0));

        let mut errs = ErrorList::new();
        let mut root: Option<SourceId> = None;
        for (loc, value, source) in &splits {
            let value_source = match value {
                Exp::Array(_) | Exp::Map(_) | Exp::Null => None,
                other => {
                    let mode = self.sources.call_mode(*source);
                    Some(self.sources.source_for_value(other, mode))
                }
            };
            let merged = self
                .sources
                .merge(root, value_source)
                .and_then(|r| self.sources.merge(r, Some(*source)));
            match merged {
                Ok(r) => root = r,
                Err(e) => errs.push(ResolveError::from(e).context_at("split", loc))?,
            }
        }
        errs.into_result().map(|()| root)
    }

    // ── Stages ──────────────────────────────────────────────────────────────

    fn resolve_stage(&mut self, id: NodeId, siblings: &BindingMap, mapped: &[NodeId]) -> Result<(), ResolveError> {
        let mut errs = ErrorList::new();
        errs.take(self.resolve_inputs(id, siblings, mapped))?;

        let Callable::Stage(stage) = self.node(id).callable.clone() else {
            return Err(ResolveError::internal("stage node without a stage declaration"));
        };
        if stage.out_params.is_empty() {
            return errs.into_result();
        }
        if self.node(id).is_always_disabled() {
            let node = self.node_mut(id);
            node.outputs = Some(ResolvedBinding::new(Exp::Null, TypeId::new(stage.id.clone())));
            node.disable = always_disable(&node.disable);
            return errs.into_result();
        }

        let mut tid = TypeId::new(stage.id.clone());
        let mut reference = RefExp::new(self.node(id).fqid.clone(), "");
        for f in self.node(id).forks.iter().rev() {
            if *f != id {
                reference.forks.insert(*f, CollectionIndex::Unknown(self.fork_source(*f)?));
            }
        }
        let mut exp = match self.node(id).source {
            None => Exp::reference(reference),
            Some(src) => match self.sources.call_mode(src) {
                CallMode::Null => Exp::Null,
                mode => {
                    match mode {
                        CallMode::Array => tid.array_dim += 1,
                        CallMode::Map => {
                            tid.map_dim = tid.array_dim + 1;
                            tid.array_dim = 0;
                        }
                        _ => {}
                    }
                    reference.forks.insert(id, CollectionIndex::Unknown(src));
                    Exp::Merge(Arc::new(MergeExp {
                        value: Exp::reference(reference),
                        owner: id,
                        merge_over: src,
                        fork_node: None,
                    }))
                }
            },
        };
        for d in self.added_disable(id) {
            match wrap_disabled(&mut self.projector(), &d, exp.clone()) {
                Ok(e) => exp = e,
                Err(e) => errs.push(e.context("disable"))?,
            }
        }
        self.node_mut(id).outputs = Some(ResolvedBinding::new(exp, tid));
        errs.into_result()
    }

    /// Drop the provisional per-fork wrapping of a stage's outputs.
    fn unsplit_stage(&mut self, id: NodeId) -> Result<(), ResolveError> {
        if self.node(id).is_always_disabled() {
            if let Some(inputs) = self.node_mut(id).inputs.as_mut() {
                for b in inputs.values_mut() {
                    if matches!(b.exp, Exp::Split(_)) {
                        b.exp = Exp::Null;
                    }
                }
            }
        }
        let Some(outputs) = self.node(id).outputs.clone() else {
            return Ok(());
        };
        let exp = self
            .projector()
            .project(&outputs.exp, "", &ForkMap::new())
            .map_err(|e| e.context("outputs"))?;
        if let Some(out) = self.node_mut(id).outputs.as_mut() {
            out.exp = exp;
        }
        Ok(())
    }

    // ── Pipelines ───────────────────────────────────────────────────────────

    fn resolve_pipeline(&mut self, id: NodeId, siblings: &BindingMap, mapped: &[NodeId]) -> Result<(), ResolveError> {
        self.resolve_inputs(id, siblings, mapped)?;
        if self.node(id).is_always_disabled() {
            debug!(fqid = %self.node(id).fqid, "pipeline always disabled, trimming children");
            let node = self.node_mut(id);
            node.children = None;
            node.outputs = Some(ResolvedBinding::null());
            node.disable = always_disable(&node.disable);
            return Ok(());
        }

        let mut mapped = mapped.to_vec();
        if self.node(id).call.mapped && self.node(id).source.is_none() {
            return Err(ResolveError::internal(format!(
                "no map source for mapped call {}",
                self.node(id).fqid
            )));
        }
        if self.node(id).source.is_some() && !mapped.contains(&id) {
            mapped.push(id);
        }

        let children = self.node(id).children.clone().unwrap_or_default();
        let mut errs = ErrorList::new();
        let mut child_map = BindingMap::new();
        for child in &children {
            errs.take(self.resolve(*child, &child_map, &mapped))?;
            self.record_child(*child, &mut child_map);
            for f in &self.node(*child).forks {
                if !mapped.contains(f) {
                    mapped.push(*f);
                }
            }
        }
        for child in &children {
            if self.node(*child).kind == NodeKind::Stage {
                let result = self.unsplit_stage(*child).map_err(|e| {
                    let node = self.node(*child);
                    e.context_at(node.fqid.clone(), &node.call.loc)
                });
                errs.take(result)?;
                self.record_child(*child, &mut child_map);
            }
        }
        if !errs.is_empty() {
            return errs.into_result();
        }

        errs.take(self.resolve_pipeline_outs(id, &child_map))?;
        errs.take(self.resolve_retained(id, &child_map))?;
        errs.into_result()
    }

    fn record_child(&self, child: NodeId, child_map: &mut BindingMap) {
        let node = self.node(child);
        let out = node.outputs.clone().unwrap_or_else(ResolvedBinding::null);
        child_map.insert(node.call.id.clone(), out);
    }

    fn resolve_pipeline_outs(&mut self, id: NodeId, child_map: &BindingMap) -> Result<(), ResolveError> {
        let Callable::Pipeline(pipeline) = self.node(id).callable.clone() else {
            return Err(ResolveError::internal("pipeline node without a pipeline declaration"));
        };
        if pipeline.returns.is_empty() {
            self.node_mut(id).outputs = Some(ResolvedBinding::null());
            return Ok(());
        }
        let inputs = self.node(id).inputs.clone();
        let scope = Scope {
            inputs: inputs.as_ref(),
            calls: child_map,
        };
        let mut errs = ErrorList::new();
        let mut fields = std::collections::BTreeMap::new();
        for ret in &pipeline.returns {
            let Some(param) = pipeline.out_params.iter().find(|p| p.id == ret.id) else {
                errs.push(ResolveError::UnknownParameter(ret.id.clone()).context_at("output parameter", &ret.loc))?;
                continue;
            };
            match self.projector().resolve_binding(&ret.exp, &param.tname, id, scope) {
                Ok(r) => {
                    fields.insert(ret.id.clone(), r.exp);
                }
                Err(e) => errs.push(e.context_at(format!("output parameter {}", ret.id), &ret.loc))?,
            }
        }

        let mut tid = TypeId::new(pipeline.id.clone());
        let mut exp = Exp::structure(fields);
        // Conditions inherited from the parent already wrap the parent's outputs.
        if let Some(control) = self.added_disable(id).last() {
            match make_disabled(control, exp.clone(), None) {
                Ok(e) => exp = e,
                Err(e) => errs.push(e.context("disable"))?,
            }
        }
        if let Some(src) = self.node(id).source {
            let mode = self.sources.call_mode(src);
            match mode {
                CallMode::Array | CallMode::Map => tid = tid.add_dim(mode)?,
                other => errs.push(ResolveError::InvalidMappingMode(other))?,
            }
            exp = Exp::Merge(Arc::new(MergeExp {
                value: exp,
                owner: id,
                merge_over: src,
                fork_node: None,
            }));
        }
        self.node_mut(id).outputs = Some(ResolvedBinding::new(exp, tid));
        errs.into_result()
    }

    /// Substitute the pipeline's retained expressions and keep the stage
    /// references they contain.
    fn resolve_retained(&mut self, id: NodeId, child_map: &BindingMap) -> Result<(), ResolveError> {
        let Callable::Pipeline(pipeline) = self.node(id).callable.clone() else {
            return Ok(());
        };
        if pipeline.retain.is_empty() {
            return Ok(());
        }
        let inputs = self.node(id).inputs.clone();
        let scope = Scope {
            inputs: inputs.as_ref(),
            calls: child_map,
        };
        let mut errs = ErrorList::new();
        let mut retained: Vec<Arc<RefExp>> = Vec::new();
        for ast in &pipeline.retain {
            match self.projector().resolve_exp(ast, &TypeId::new("map"), id, scope) {
                Ok((exp, _)) => {
                    for r in exp.refs() {
                        if !retained.contains(&r) {
                            retained.push(r);
                        }
                    }
                }
                Err(e) => errs.push(e.context("retain"))?,
            }
        }
        self.node_mut(id).retained = retained;
        errs.into_result()
    }

    // ── Unsplit ─────────────────────────────────────────────────────────────

    fn unsplit(&mut self, id: NodeId) -> Result<(), ResolveError> {
        let result = match self.node(id).kind {
            NodeKind::Stage => self.unsplit_stage(id),
            NodeKind::Pipeline => self.unsplit_pipeline(id),
        };
        result.map_err(|e| {
            let node = self.node(id);
            e.context_at(node.fqid.clone(), &node.call.loc)
        })
    }

    /// Re-merge the pipeline's outputs over its remaining fork roots,
    /// collapsing those with statically known shape, then make per-fork
    /// inputs explicit.
    fn unsplit_pipeline(&mut self, id: NodeId) -> Result<(), ResolveError> {
        let mut errs = ErrorList::new();
        for child in self.node(id).children.clone().unwrap_or_default() {
            errs.take(self.unsplit(child))?;
        }

        if let Some(outputs) = self.node(id).outputs.clone() {
            let (mut exp, mut tid) = (outputs.exp, outputs.tid);
            let forks = self.node(id).forks.clone();
            for f in forks.iter().rev() {
                if *f == id {
                    continue;
                }
                if self.node(*f).is_always_disabled() {
                    exp = Exp::Null;
                    tid = TypeId::null();
                    continue;
                }
                let src = self.fork_source(*f)?;
                exp = Exp::Merge(Arc::new(MergeExp {
                    value: exp,
                    owner: *f,
                    merge_over: src,
                    fork_node: None,
                }));
                if let Some(t) = errs.take(tid.add_dim(self.sources.call_mode(src)))? {
                    tid = t;
                }
            }
            let projected = self
                .projector()
                .project(&exp, "", &ForkMap::new())
                .map_err(|e| e.context("outputs"));
            if let Some(e) = errs.take(projected)? {
                exp = e;
            }
            let (exp, tid, forks) = unmerge(exp, tid);
            trace!(fqid = %self.node(id).fqid, remaining = forks.len(), "unsplit outputs");
            let node = self.node_mut(id);
            node.outputs = Some(ResolvedBinding::new(exp, tid));
            node.forks = forks;
        }

        if let Some(inputs) = self.node(id).inputs.clone() {
            let own: BTreeSet<NodeId> = self.node(id).forks.iter().copied().collect();
            let mut rewritten = BindingMap::new();
            for (k, b) in inputs {
                let mut split_nodes: BTreeSet<NodeId> = b
                    .exp
                    .refs()
                    .iter()
                    .flat_map(|r| r.forks.iter())
                    .filter(|(_, i)| i.is_unknown())
                    .map(|(n, _)| *n)
                    .collect();
                split_nodes.retain(|n| !own.contains(n));
                let mut exp = b.exp;
                let mut cursor = Some(id);
                while let Some(n) = cursor {
                    if split_nodes.contains(&n) {
                        let src = self.fork_source(n)?;
                        let split = Exp::Split(Arc::new(SplitExp {
                            value: Exp::Merge(Arc::new(MergeExp {
                                value: exp.clone(),
                                owner: n,
                                merge_over: src,
                                fork_node: None,
                            })),
                            owner: n,
                            source: src,
                            loc: self.node(n).call.loc.clone(),
                        }));
                        let projected = self
                            .projector()
                            .project(&split, "", &ForkMap::new())
                            .map_err(|e| e.context(format!("input parameter {k}")));
                        if let Some(e) = errs.take(projected)? {
                            exp = e;
                        }
                    }
                    cursor = self.node(n).parent;
                }
                rewritten.insert(k, ResolvedBinding::new(exp, b.tid));
            }
            self.node_mut(id).inputs = Some(rewritten);
        }
        errs.into_result()
    }

    // ── Fork nodes ──────────────────────────────────────────────────────────

    /// Record a forking stage reference on every merge left symbolic.
    ///
    /// Every node is annotated from the same unannotated graph before any
    /// result is written back.
    fn fill_fork_nodes(&mut self) {
        let annotated: Vec<_> = self
            .nodes
            .iter()
            .map(|node| {
                let outputs = node.outputs.as_ref().map(|o| self.with_fork_nodes(&o.exp));
                let inputs: Option<Vec<(String, Exp)>> = node.inputs.as_ref().map(|ins| {
                    ins.iter()
                        .map(|(k, b)| (k.clone(), self.with_fork_nodes(&b.exp)))
                        .collect()
                });
                (outputs, inputs)
            })
            .collect();
        for (node, (outputs, inputs)) in self.nodes.iter_mut().zip(annotated) {
            if let (Some(exp), Some(out)) = (outputs, node.outputs.as_mut()) {
                out.exp = exp;
            }
            if let (Some(new), Some(ins)) = (inputs, node.inputs.as_mut()) {
                for (k, exp) in new {
                    if let Some(b) = ins.get_mut(&k) {
                        b.exp = exp;
                    }
                }
            }
        }
    }

    fn with_fork_nodes(&self, exp: &Exp) -> Exp {
        match exp {
            Exp::Merge(m) => {
                let value = self.with_fork_nodes(&m.value);
                let fork_node = m
                    .fork_node
                    .clone()
                    .or_else(|| self.find_fork_node(&value, m.owner));
                if value.same(&m.value) && fork_node == m.fork_node {
                    return exp.clone();
                }
                Exp::Merge(Arc::new(MergeExp {
                    value,
                    fork_node,
                    ..(**m).clone()
                }))
            }
            Exp::Split(s) => {
                let value = self.with_fork_nodes(&s.value);
                if value.same(&s.value) {
                    return exp.clone();
                }
                Exp::Split(Arc::new(SplitExp {
                    value,
                    ..(**s).clone()
                }))
            }
            _ => exp.map_children(|e| self.with_fork_nodes(e)),
        }
    }

    /// A stage reference forking on `owner`: from the merged value, then the
    /// owner's disable list, then its inputs in key order.
    fn find_fork_node(&self, value: &Exp, owner: NodeId) -> Option<Arc<RefExp>> {
        let node = self.node(owner);
        let exclude = node.fqid.as_str();
        value
            .fork_ref_for(owner, exclude)
            .or_else(|| node.disable.iter().find_map(|d| d.fork_ref_for(owner, exclude)))
            .or_else(|| {
                node.inputs
                    .iter()
                    .flat_map(|ins| ins.values())
                    .find_map(|b| b.exp.fork_ref_for(owner, exclude))
            })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn is_empty_collection(exp: &Exp) -> bool {
    match exp {
        Exp::Null => true,
        Exp::Array(items) => items.is_empty(),
        Exp::Map(m) => m.entries.is_empty(),
        _ => false,
    }
}

/// Mapped ancestors and siblings the node's bindings are split over, in the
/// order they were introduced, followed by the node itself.
fn fork_roots(
    id: NodeId,
    inputs: Option<&BindingMap>,
    disable: &[Exp],
    mapped: &[NodeId],
    has_source: bool,
) -> Vec<NodeId> {
    let mut owners = BTreeSet::new();
    for b in inputs.into_iter().flat_map(|m| m.values()) {
        b.exp.split_owners(&mut owners);
    }
    for d in disable {
        d.split_owners(&mut owners);
    }
    let mut forks: Vec<NodeId> = mapped
        .iter()
        .copied()
        .filter(|m| *m != id && owners.contains(m))
        .collect();
    if has_source && owners.contains(&id) {
        forks.push(id);
    }
    forks
}

/// Peel top-level merges into fork roots, reducing the type to match.
fn unmerge(mut exp: Exp, mut tid: TypeId) -> (Exp, TypeId, Vec<NodeId>) {
    let mut forks = Vec::new();
    while let Exp::Merge(m) = &exp {
        forks.push(m.owner);
        if let Some(t) = tid.element() {
            tid = t;
        }
        let value = m.value.clone();
        exp = value;
    }
    (exp, tid, forks)
}
