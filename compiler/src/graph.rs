// graph.rs — Call graph nodes and their construction
//
// Builds the tree of stage and pipeline nodes mirroring the call tree of a
// top-level call. Nodes live in one arena owned by `CallGraph` and refer to
// their parent and children by `NodeId`. Resolution (resolve.rs) fills in
// inputs, outputs, disable lists and fork roots afterwards.
//
// Preconditions: `ast` has passed type checking.
// Postconditions: node ids are assigned in pre-order; a pipeline's fqid is
//   its first child's fqid minus the child's own segment.
// Failure modes: `ResolveError::UnknownCallable`, `ResolveError::FqidTooLong`.
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::ast::{Ast, CallSite, Callable, PipelineDecl};
use crate::binding::{BindingMap, ResolvedBinding};
use crate::disable::is_always_disabled;
use crate::error::{ErrorList, ResolveError};
use crate::exp::{Exp, RefExp};
use crate::id::{NodeId, SourceId};
use crate::source::SourceArena;
use crate::types::CallMode;

/// Longest fqid, past the prefix, that leaves room for per-fork and
/// per-chunk path suffixes under a 255-byte file name limit.
pub const MAX_FQID_SUFFIX_LEN: usize = 222;

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Stage,
    Pipeline,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Stage => "stage",
            NodeKind::Pipeline => "pipeline",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallGraphNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub fqid: String,
    pub parent: Option<NodeId>,
    pub call: Arc<CallSite>,
    pub callable: Callable,
    pub(crate) inputs: Option<BindingMap>,
    pub(crate) outputs: Option<ResolvedBinding>,
    pub(crate) disable: Vec<Exp>,
    pub(crate) forks: Vec<NodeId>,
    pub(crate) source: Option<SourceId>,
    pub(crate) children: Option<Vec<NodeId>>,
    pub(crate) retained: Vec<Arc<RefExp>>,
}

impl CallGraphNode {
    /// `None` when the call has no bindings.
    pub fn resolved_inputs(&self) -> Option<&BindingMap> {
        self.inputs.as_ref()
    }

    /// `None` for stages without outputs.
    pub fn resolved_outputs(&self) -> Option<&ResolvedBinding> {
        self.outputs.as_ref()
    }

    pub fn disabled(&self) -> &[Exp] {
        &self.disable
    }

    pub fn is_always_disabled(&self) -> bool {
        is_always_disabled(&self.disable)
    }

    pub fn fork_roots(&self) -> &[NodeId] {
        &self.forks
    }

    /// The unified source this node is mapped over.
    pub fn map_source(&self) -> Option<SourceId> {
        self.source
    }

    /// Child ids in declaration order; `None` for stages and trimmed pipelines.
    pub fn children(&self) -> Option<&[NodeId]> {
        self.children.as_deref()
    }

    /// Outputs kept after the pipeline completes.
    pub fn retained(&self) -> Vec<Arc<RefExp>> {
        match &self.callable {
            Callable::Stage(stage) => stage
                .retain
                .iter()
                .map(|p| Arc::new(RefExp::new(self.fqid.clone(), p.clone())))
                .collect(),
            Callable::Pipeline(_) => self.retained.clone(),
        }
    }

    fn new(id: NodeId, call: Arc<CallSite>, callable: Callable, parent: Option<NodeId>, fqid: String) -> Self {
        let kind = match callable {
            Callable::Stage(_) => NodeKind::Stage,
            Callable::Pipeline(_) => NodeKind::Pipeline,
        };
        CallGraphNode {
            id,
            kind,
            fqid,
            parent,
            call,
            callable,
            inputs: None,
            outputs: None,
            disable: Vec::new(),
            forks: Vec::new(),
            source: None,
            children: match kind {
                NodeKind::Stage => None,
                NodeKind::Pipeline => Some(Vec::new()),
            },
            retained: Vec::new(),
        }
    }
}

/// A resolved call graph: the node arena, the source arena and the root.
#[derive(Debug, Clone)]
pub struct CallGraph {
    pub(crate) nodes: Vec<CallGraphNode>,
    pub(crate) sources: SourceArena,
    pub(crate) root: Option<NodeId>,
    prefix: String,
}

impl CallGraph {
    pub fn root(&self) -> Option<&CallGraphNode> {
        self.root.map(|id| self.node(id))
    }

    pub fn node(&self, id: NodeId) -> &CallGraphNode {
        &self.nodes[id.index()]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &CallGraphNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn sources(&self) -> &SourceArena {
        &self.sources
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &CallGraphNode> {
        self.node(id)
            .children()
            .unwrap_or_default()
            .iter()
            .map(|c| self.node(*c))
    }

    pub fn call_mode(&self, id: NodeId) -> CallMode {
        match self.node(id).source {
            Some(src) => self.sources.call_mode(src),
            None => CallMode::Single,
        }
    }

    /// Every reachable node by fqid.
    pub fn node_closure(&self) -> BTreeMap<String, NodeId> {
        let mut out = BTreeMap::new();
        if let Some(root) = self.root {
            self.collect_closure(root, &mut out);
        }
        out
    }

    fn collect_closure(&self, id: NodeId, out: &mut BTreeMap<String, NodeId>) {
        out.insert(self.node(id).fqid.clone(), id);
        for child in self.node(id).children().unwrap_or_default() {
            self.collect_closure(*child, out);
        }
    }

    pub fn find(&self, fqid: &str) -> Option<&CallGraphNode> {
        self.nodes.iter().find(|n| n.fqid == fqid)
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for CallGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(root) = self.root else {
            return writeln!(f, "CallGraph (empty)");
        };
        writeln!(f, "CallGraph ({} nodes)", self.nodes.len())?;
        self.fmt_node(f, root, 1)
    }
}

impl CallGraph {
    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, id: NodeId, depth: usize) -> fmt::Result {
        let node = self.node(id);
        write!(
            f,
            "{:indent$}{} {} [{}]",
            "",
            node.kind.as_str(),
            node.fqid,
            self.call_mode(id),
            indent = depth * 2
        )?;
        if !node.forks.is_empty() {
            let roots: Vec<&str> = node.forks.iter().map(|r| self.node(*r).fqid.as_str()).collect();
            write!(f, " forks={}", roots.join(","))?;
        }
        if node.is_always_disabled() {
            f.write_str(" disabled")?;
        }
        writeln!(f)?;
        for child in node.children().unwrap_or_default() {
            self.fmt_node(f, *child, depth + 1)?;
        }
        Ok(())
    }
}

// ── Construction ────────────────────────────────────────────────────────────

/// `prefix` plus the call ids from the root down to `call_id`.
pub fn make_fqid(prefix: &str, ancestors: &[&str], call_id: &str) -> String {
    let len = prefix.len() + call_id.len() + ancestors.iter().map(|a| a.len() + 1).sum::<usize>();
    let mut fqid = String::with_capacity(len);
    fqid.push_str(prefix);
    for a in ancestors {
        fqid.push_str(a);
        fqid.push('.');
    }
    fqid.push_str(call_id);
    fqid
}

pub(crate) struct GraphBuilder<'a> {
    ast: &'a Ast,
    prefix: &'a str,
    nodes: Vec<CallGraphNode>,
    errors: ErrorList,
}

impl<'a> GraphBuilder<'a> {
    pub(crate) fn new(ast: &'a Ast, prefix: &'a str) -> Self {
        GraphBuilder {
            ast,
            prefix,
            nodes: Vec::new(),
            errors: ErrorList::new(),
        }
    }

    /// Build the root node and its subtree. With `wrap`, a root stage call
    /// becomes a single-call pipeline.
    pub(crate) fn build(mut self, call: &CallSite, wrap: bool) -> (CallGraph, Result<(), ResolveError>) {
        let root = match self.make_node(Arc::new(call.clone()), None, &[], wrap) {
            Ok(root) => root,
            Err(e) => return (self.into_graph(None), Err(e)),
        };
        let errors = std::mem::take(&mut self.errors);
        (self.into_graph(root), errors.into_result())
    }

    fn into_graph(self, root: Option<NodeId>) -> CallGraph {
        CallGraph {
            nodes: self.nodes,
            sources: SourceArena::new(),
            root,
            prefix: self.prefix.to_string(),
        }
    }

    fn make_node(
        &mut self,
        call: Arc<CallSite>,
        parent: Option<NodeId>,
        ancestors: &[&str],
        wrap: bool,
    ) -> Result<Option<NodeId>, ResolveError> {
        let Some(callable) = self.ast.callable(&call.dec_id).cloned() else {
            self.errors.push(
                ResolveError::UnknownCallable(call.dec_id.clone()).context_at(call.id.clone(), &call.loc),
            )?;
            return Ok(None);
        };
        let callable = match callable {
            Callable::Stage(stage) if wrap => Callable::Pipeline(Arc::new(PipelineDecl::wrapping(&stage, &call))),
            other => other,
        };
        let fqid = make_fqid(self.prefix, ancestors, &call.id);
        let id = NodeId(self.nodes.len() as u32);
        self.nodes
            .push(CallGraphNode::new(id, call.clone(), callable.clone(), parent, fqid.clone()));

        match &callable {
            Callable::Stage(_) => {
                let len = fqid.len() - self.prefix.len();
                if len > MAX_FQID_SUFFIX_LEN {
                    self.errors.push(
                        ResolveError::FqidTooLong {
                            fqid: fqid.clone(),
                            len,
                            limit: MAX_FQID_SUFFIX_LEN,
                        }
                        .context_at(call.id.clone(), &call.loc),
                    )?;
                }
                debug!(%fqid, "stage node");
            }
            Callable::Pipeline(pipeline) => {
                let mut path: Vec<&str> = ancestors.to_vec();
                path.push(&call.id);
                let mut children = Vec::with_capacity(pipeline.calls.len());
                for child in &pipeline.calls {
                    if let Some(c) = self.make_node(Arc::new(child.clone()), Some(id), &path, false)? {
                        children.push(c);
                    }
                }
                if let Some(first) = children.first() {
                    let child = &self.nodes[first.index()];
                    let suffix = format!(".{}", child.call.id);
                    if let Some(derived) = child.fqid.strip_suffix(&suffix) {
                        self.nodes[id.index()].fqid = derived.to_string();
                    }
                }
                debug!(fqid = %self.nodes[id.index()].fqid, children = children.len(), "pipeline node");
                self.nodes[id.index()].children = Some(children);
            }
        }
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstExp, Decl, StageDecl};
    use crate::types::TypeTable;

    fn ast() -> Ast {
        Ast::new(
            TypeTable::new(),
            [
                Decl::Stage(StageDecl::new("S").input("x", "int").output("y", "int")),
                Decl::Pipeline(
                    PipelineDecl::new("INNER")
                        .call(CallSite::new("S").bind("x", AstExp::int(1)))
                        .call(CallSite::new("S").alias("S2").bind("x", AstExp::int(2))),
                ),
                Decl::Pipeline(PipelineDecl::new("OUTER").call(CallSite::new("INNER"))),
                Decl::Pipeline(PipelineDecl::new("EMPTY")),
                Decl::Pipeline(PipelineDecl::new("BROKEN").call(CallSite::new("NOPE"))),
            ],
        )
        .unwrap()
    }

    #[test]
    fn fqids_follow_call_aliases() {
        let ast = ast();
        let (g, r) = GraphBuilder::new(&ast, "ID.p.").build(&CallSite::new("OUTER"), false);
        r.unwrap();
        let closure = g.node_closure();
        let ids: Vec<&str> = closure.keys().map(String::as_str).collect();
        assert_eq!(
            ids,
            vec!["ID.p.OUTER", "ID.p.OUTER.INNER", "ID.p.OUTER.INNER.S", "ID.p.OUTER.INNER.S2"]
        );
        let root = g.root().unwrap();
        assert_eq!(root.kind, NodeKind::Pipeline);
        assert_eq!(root.id, NodeId(0));
        assert_eq!(g.children(root.id).count(), 1);
        assert_eq!(g.find("ID.p.OUTER.INNER.S2").unwrap().parent, Some(NodeId(1)));
    }

    #[test]
    fn empty_pipeline_uses_own_path() {
        let ast = ast();
        let (g, r) = GraphBuilder::new(&ast, "").build(&CallSite::new("EMPTY"), false);
        r.unwrap();
        let root = g.root().unwrap();
        assert_eq!(root.fqid, "EMPTY");
        assert_eq!(root.children().map(<[NodeId]>::len), Some(0));
    }

    #[test]
    fn unknown_callable_reported() {
        let ast = ast();
        let (g, r) = GraphBuilder::new(&ast, "").build(&CallSite::new("BROKEN"), false);
        let err = r.unwrap_err();
        assert!(matches!(err.leaves()[0], ResolveError::UnknownCallable(name) if name == "NOPE"));
        assert_eq!(g.root().unwrap().children().map(<[NodeId]>::len), Some(0));

        let (g, r) = GraphBuilder::new(&ast, "").build(&CallSite::new("MISSING"), false);
        assert!(r.is_err());
        assert!(g.root().is_none());
    }

    #[test]
    fn wrapped_stage_becomes_pipeline() {
        let ast = ast();
        let call = CallSite::new("S").bind("x", AstExp::int(3));
        let (g, r) = GraphBuilder::new(&ast, "").build(&call, true);
        r.unwrap();
        let root = g.root().unwrap();
        assert_eq!(root.kind, NodeKind::Pipeline);
        assert_eq!(root.fqid, "S");
        let child = g.children(root.id).next().unwrap();
        assert_eq!(child.kind, NodeKind::Stage);
        assert_eq!(child.fqid, "S.S");
    }

    #[test]
    fn fqid_length_limit() {
        let long = "A".repeat(MAX_FQID_SUFFIX_LEN);
        let ast = ast();
        let call = CallSite::new("S").alias(long.clone());
        let (_, r) = GraphBuilder::new(&ast, "prefix.").build(&call, false);
        r.unwrap();
        let call = CallSite::new("S").alias(format!("{long}B"));
        let (_, r) = GraphBuilder::new(&ast, "prefix.").build(&call, false);
        assert!(matches!(
            r.unwrap_err().leaves()[0],
            ResolveError::FqidTooLong { len, .. } if *len == MAX_FQID_SUFFIX_LEN + 1
        ));
    }
}
