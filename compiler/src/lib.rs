// mcg — Mapped call graph resolver
//
// Library root. Turns a checked .mro AST and a top-level call into a
// resolved, fork-aware call graph.

pub mod ast;
pub mod binding;
pub mod diag;
pub mod disable;
pub mod error;
pub mod exp;
pub mod graph;
pub mod id;
pub mod json;
pub mod pipeline;
pub mod resolve;
pub mod source;
pub mod types;

pub use error::ResolveError;
pub use graph::{CallGraph, CallGraphNode, NodeKind};
pub use resolve::{build_call_graph, build_pipeline_call_graph};
