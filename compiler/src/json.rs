// json.rs — JSON projection of a resolved call graph
//
// Serializes nodes, bindings and expressions for debugging and golden-file
// interchange. Field presence matters: `inputs` is null for calls without
// bindings, `children` is null for trimmed or empty pipelines, and empty
// `disabled`, `fork_roots` and `retained` lists are omitted.
//
// Preconditions: `graph` came out of `build_call_graph` or
//   `build_pipeline_call_graph`.
// Postconditions: output is deterministic; maps are emitted in key order.
// Failure modes: only those of the underlying `serde_json` serializer.
// Side effects: none.

use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::Serialize;

use crate::binding::{BindingMap, ResolvedBinding};
use crate::exp::{CollectionIndex, Exp, MapKind, RefExp};
use crate::graph::{CallGraph, NodeKind};
use crate::id::{NodeId, SourceId};
use crate::source::MapSource;

/// Serialize the graph from its root; `null` when there is no root.
pub fn to_json_string(graph: &CallGraph, pretty: bool) -> Result<String, serde_json::Error> {
    let view = graph.root.map(|id| NodeJson { graph, id });
    if pretty {
        serde_json::to_string_pretty(&view)
    } else {
        serde_json::to_string(&view)
    }
}

pub fn to_value(graph: &CallGraph) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(graph.root.map(|id| NodeJson { graph, id }))
}

/// Serialize one expression in the context of `graph`.
pub fn exp_to_value(graph: &CallGraph, exp: &Exp) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(ExpJson { graph, exp })
}

// ── Views ───────────────────────────────────────────────────────────────────

struct NodeJson<'a> {
    graph: &'a CallGraph,
    id: NodeId,
}

impl Serialize for NodeJson<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let graph = self.graph;
        let node = graph.node(self.id);
        let mut map = s.serialize_map(None)?;
        map.serialize_entry("fqid", &node.fqid)?;
        map.serialize_entry(
            "inputs",
            &node.resolved_inputs().map(|bindings| BindingsJson { graph, bindings }),
        )?;
        map.serialize_entry(
            "outputs",
            &node.resolved_outputs().map(|binding| BindingJson { graph, binding }),
        )?;
        if !node.disabled().is_empty() {
            map.serialize_entry("disabled", &ExpList { graph, exps: node.disabled() })?;
        }
        if !node.fork_roots().is_empty() {
            let roots: Vec<&str> = node
                .fork_roots()
                .iter()
                .map(|r| graph.node(*r).fqid.as_str())
                .collect();
            map.serialize_entry("fork_roots", &roots)?;
        }
        if node.kind == NodeKind::Pipeline {
            let children: Option<Vec<NodeJson<'_>>> = node
                .children()
                .filter(|c| !c.is_empty())
                .map(|c| c.iter().map(|id| NodeJson { graph, id: *id }).collect());
            map.serialize_entry("children", &children)?;
            let retained = node.retained();
            if !retained.is_empty() {
                let refs: Vec<RefJson<'_>> = retained.iter().map(|r| RefJson { graph, r }).collect();
                map.serialize_entry("retained", &refs)?;
            }
        }
        map.end()
    }
}

struct BindingsJson<'a> {
    graph: &'a CallGraph,
    bindings: &'a BindingMap,
}

impl Serialize for BindingsJson<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(self.bindings.len()))?;
        for (k, binding) in self.bindings {
            map.serialize_entry(k, &BindingJson { graph: self.graph, binding })?;
        }
        map.end()
    }
}

struct BindingJson<'a> {
    graph: &'a CallGraph,
    binding: &'a ResolvedBinding,
}

impl Serialize for BindingJson<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(2))?;
        map.serialize_entry("expression", &ExpJson { graph: self.graph, exp: &self.binding.exp })?;
        map.serialize_entry("type", &self.binding.tid.to_string())?;
        map.end()
    }
}

struct ExpList<'a> {
    graph: &'a CallGraph,
    exps: &'a [Exp],
}

impl Serialize for ExpList<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(self.exps.len()))?;
        for exp in self.exps {
            seq.serialize_element(&ExpJson { graph: self.graph, exp })?;
        }
        seq.end()
    }
}

struct ExpJson<'a> {
    graph: &'a CallGraph,
    exp: &'a Exp,
}

impl Serialize for ExpJson<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let graph = self.graph;
        match self.exp {
            Exp::Null => s.serialize_unit(),
            Exp::Bool(b) => s.serialize_bool(*b),
            Exp::Int(i) => s.serialize_i64(*i),
            Exp::Float(f) => s.serialize_f64(*f),
            Exp::String(v) => s.serialize_str(v),
            Exp::Array(items) => ExpList { graph, exps: items }.serialize(s),
            Exp::Map(m) => {
                let mut map = s.serialize_map(Some(m.entries.len()))?;
                for (k, v) in &m.entries {
                    map.serialize_entry(k, &ExpJson { graph, exp: v })?;
                }
                map.end()
            }
            Exp::Ref(r) => RefJson { graph, r }.serialize(s),
            Exp::Split(sp) => {
                let mut map = s.serialize_map(None)?;
                map.serialize_entry("call", &graph.node(sp.owner).call.id)?;
                let mode = graph.sources.call_mode(sp.source);
                if !matches!(mode, crate::types::CallMode::Unknown) {
                    map.serialize_entry("mode", mode.as_str())?;
                }
                map.serialize_entry("split", &ExpJson { graph, exp: &sp.value })?;
                let literal = match &sp.value {
                    Exp::Array(_) => true,
                    Exp::Map(m) => m.kind == MapKind::Dict,
                    _ => false,
                };
                if !literal {
                    map.serialize_entry("source", &SourceJson { graph, id: sp.source })?;
                }
                map.end()
            }
            Exp::Merge(m) => {
                let mut map = s.serialize_map(None)?;
                map.serialize_entry("merge_value", &ExpJson { graph, exp: &m.value })?;
                map.serialize_entry("merge_over", &SourceJson { graph, id: m.merge_over })?;
                if let Some(r) = &m.fork_node {
                    map.serialize_entry("fork_node", &RefJson { graph, r })?;
                }
                map.end()
            }
            Exp::Disabled(d) => {
                let mut map = s.serialize_map(Some(2))?;
                map.serialize_entry("__disabled__", &RefJson { graph, r: &d.disabled })?;
                map.serialize_entry("value", &ExpJson { graph, exp: &d.value })?;
                map.end()
            }
        }
    }
}

struct RefJson<'a> {
    graph: &'a CallGraph,
    r: &'a RefExp,
}

impl Serialize for RefJson<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let graph = self.graph;
        let mut map = s.serialize_map(None)?;
        map.serialize_entry("__reference__", &self.r.target())?;
        if !self.r.index.is_empty() {
            let index: Vec<IndexJson<'_>> = self.r.index.iter().map(|i| IndexJson { graph, i }).collect();
            map.serialize_entry("index", &index)?;
        }
        if !self.r.forks.is_empty() {
            let forks: Vec<ForkJson<'_>> = self
                .r
                .forks
                .iter()
                .map(|(node, i)| ForkJson {
                    graph,
                    node: *node,
                    i,
                })
                .collect();
            map.serialize_entry("fork", &forks)?;
        }
        map.end()
    }
}

struct ForkJson<'a> {
    graph: &'a CallGraph,
    node: NodeId,
    i: &'a CollectionIndex,
}

impl Serialize for ForkJson<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(2))?;
        map.serialize_entry("source", &self.graph.node(self.node).fqid)?;
        map.serialize_entry("index", &IndexJson { graph: self.graph, i: self.i })?;
        map.end()
    }
}

struct IndexJson<'a> {
    graph: &'a CallGraph,
    i: &'a CollectionIndex,
}

impl Serialize for IndexJson<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self.i {
            CollectionIndex::Array(n) => s.serialize_u64(*n as u64),
            CollectionIndex::Key(k) => s.serialize_str(k),
            CollectionIndex::Unknown(src) => {
                let mode = self.graph.sources.call_mode(*src);
                s.serialize_str(&format!("unknown {}", mode.as_str()))
            }
        }
    }
}

struct SourceJson<'a> {
    graph: &'a CallGraph,
    id: SourceId,
}

impl Serialize for SourceJson<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let graph = self.graph;
        match graph.sources.get(self.id) {
            MapSource::Set { master, .. } => SourceJson { graph, id: *master }.serialize(s),
            MapSource::Array { len } => {
                let mut map = s.serialize_map(Some(2))?;
                map.serialize_entry("type", "array")?;
                map.serialize_entry("len", len)?;
                map.end()
            }
            MapSource::Dict { keys } => {
                let mut map = s.serialize_map(Some(2))?;
                map.serialize_entry("type", "map")?;
                map.serialize_entry("keys", keys)?;
                map.end()
            }
            MapSource::Reference { reference, .. } => RefJson { graph, r: reference }.serialize(s),
            MapSource::Null => s.serialize_str("null"),
            MapSource::Nested { mode, .. } | MapSource::UnknownShape { mode } => s.serialize_str(mode.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Ast, AstExp, CallSite, Decl, PipelineDecl, SourceLoc, StageDecl};
    use crate::resolve::build_call_graph;
    use crate::types::TypeTable;
    use serde_json::json;

    fn graph(decls: Vec<Decl>, call: CallSite) -> CallGraph {
        let ast = Ast::new(TypeTable::new(), decls).unwrap();
        let (g, r) = build_call_graph(&ast, "", &call);
        r.unwrap();
        g
    }

    #[test]
    fn stage_node_fields() {
        let g = graph(
            vec![Decl::Stage(StageDecl::new("S").input("x", "int").output("y", "int"))],
            CallSite::new("S").bind("x", AstExp::int(1)),
        );
        assert_eq!(
            to_value(&g).unwrap(),
            json!({
                "fqid": "S",
                "inputs": {"x": {"expression": 1, "type": "int"}},
                "outputs": {"expression": {"__reference__": "S"}, "type": "S"},
            })
        );
    }

    #[test]
    fn unbound_call_has_null_inputs_and_children() {
        let g = graph(vec![Decl::Pipeline(PipelineDecl::new("EMPTY"))], CallSite::new("EMPTY"));
        assert_eq!(
            to_value(&g).unwrap(),
            json!({
                "fqid": "EMPTY",
                "inputs": null,
                "outputs": {"expression": null, "type": "null"},
                "children": null,
            })
        );
    }

    #[test]
    fn symbolic_merge_and_split_shapes() {
        let g = graph(
            vec![
                Decl::Stage(StageDecl::new("GEN").output("xs", "int[]")),
                Decl::Stage(StageDecl::new("S").input("x", "int").output("y", "int")),
                Decl::Pipeline(
                    PipelineDecl::new("P")
                        .output("ys", "int[]")
                        .call(CallSite::new("GEN"))
                        .call(
                            CallSite::new("S")
                                .mapped()
                                .bind("x", AstExp::split(AstExp::call_ref("GEN", "xs"), SourceLoc::new("p.mro", 4))),
                        )
                        .ret("ys", AstExp::call_ref("S", "y")),
                ),
            ],
            CallSite::new("P"),
        );
        let v = to_value(&g).unwrap();
        let stage = &v["children"][1];
        assert_eq!(stage["fqid"], "P.S");
        assert_eq!(stage["fork_roots"], json!(["P.S"]));
        assert_eq!(
            stage["inputs"]["x"]["expression"],
            json!({
                "call": "S",
                "mode": "array",
                "split": {"__reference__": "P.GEN.xs"},
                "source": {"__reference__": "P.GEN.xs"},
            })
        );
        assert_eq!(
            v["outputs"]["expression"]["ys"],
            json!({
                "merge_value": {
                    "__reference__": "P.S.y",
                    "fork": [{"source": "P.S", "index": "unknown array"}],
                },
                "merge_over": {"__reference__": "P.GEN.xs"},
            })
        );
    }

    #[test]
    fn disabled_wrapper_shape() {
        let g = graph(
            vec![
                Decl::Stage(StageDecl::new("F").output("flag", "bool")),
                Decl::Stage(StageDecl::new("S").output("y", "int")),
                Decl::Pipeline(
                    PipelineDecl::new("P")
                        .output("y", "int")
                        .call(CallSite::new("F"))
                        .call(CallSite::new("S").disabled(AstExp::call_ref("F", "flag")))
                        .ret("y", AstExp::call_ref("S", "y")),
                ),
            ],
            CallSite::new("P"),
        );
        let v = to_value(&g).unwrap();
        assert_eq!(v["children"][1]["disabled"], json!([{"__reference__": "P.F.flag"}]));
        assert_eq!(
            v["outputs"]["expression"]["y"],
            json!({
                "__disabled__": {"__reference__": "P.F.flag"},
                "value": {"__reference__": "P.S.y"},
            })
        );
    }
}
