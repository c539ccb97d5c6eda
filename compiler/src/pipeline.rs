// pipeline.rs — End-to-end driver: document → call graph → JSON
//
// Parses an AST document, builds and resolves the call graph of its
// top-level call, renders the canonical JSON projection and records build
// provenance.
//
// Preconditions: `input` is the raw bytes of a JSON AST document.
// Postconditions: on success, `Compiled::canonical` is the compact JSON of
//   the resolved graph and `provenance.graph_fingerprint` hashes exactly it.
// Failure modes: malformed document → `CompileError::Parse`; invalid
//   declarations → `CompileError::Ast`; resolution errors →
//   `CompileError::Resolve`, which keeps the partial graph.
// Side effects: none.

use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::ast::Document;
use crate::diag::{self, Diagnostic};
use crate::error::ResolveError;
use crate::graph::CallGraph;
use crate::json;
use crate::resolve::{build_call_graph, build_pipeline_call_graph};

// ── Options and errors ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Prepended to every fully-qualified id.
    pub prefix: String,
    /// Wrap a top-level stage call in a single-call pipeline.
    pub wrap: bool,
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("invalid input document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid declarations: {0}")]
    Ast(ResolveError),
    #[error("call graph resolution failed: {error}")]
    Resolve {
        graph: Box<CallGraph>,
        error: ResolveError,
    },
}

impl CompileError {
    /// Coded diagnostics for declaration and resolution failures.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            CompileError::Parse(_) => Vec::new(),
            CompileError::Ast(e) | CompileError::Resolve { error: e, .. } => diag::diagnostics(e),
        }
    }
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for reproducible builds and cache keys.
///
/// `input_hash`: SHA-256 of the raw input document.
/// `graph_fingerprint`: SHA-256 of the canonical compact graph JSON.
/// `tool_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub input_hash: [u8; 32],
    pub graph_fingerprint: [u8; 32],
    pub tool_version: &'static str,
}

impl Provenance {
    /// Hex string of the input hash (64 characters).
    pub fn input_hash_hex(&self) -> String {
        bytes_to_hex(&self.input_hash)
    }

    /// Hex string of the graph fingerprint (64 characters).
    pub fn graph_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.graph_fingerprint)
    }

    /// Serialize provenance as a JSON string for `--emit build-info`.
    pub fn to_json(&self) -> String {
        format!(
            "{{\n  \"input_hash\": \"{}\",\n  \"graph_fingerprint\": \"{}\",\n  \"version\": \"{}\"\n}}\n",
            self.input_hash_hex(),
            self.graph_fingerprint_hex(),
            self.tool_version,
        )
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compute provenance from the input bytes and the canonical graph JSON.
pub fn compute_provenance(input: &[u8], canonical_graph: &str) -> Provenance {
    Provenance {
        input_hash: sha256(input),
        graph_fingerprint: sha256(canonical_graph.as_bytes()),
        tool_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Driver ─────────────────────────────────────────────────────────────────

/// A resolved graph with its canonical rendering.
#[derive(Debug)]
pub struct Compiled {
    pub graph: CallGraph,
    pub canonical: String,
    pub provenance: Provenance,
}

impl Compiled {
    pub fn render(&self, pretty: bool) -> Result<String, serde_json::Error> {
        if pretty {
            json::to_json_string(&self.graph, true)
        } else {
            Ok(self.canonical.clone())
        }
    }
}

pub fn compile(input: &[u8], options: &CompileOptions) -> Result<Compiled, CompileError> {
    let t = Instant::now();
    let doc: Document = serde_json::from_slice(input)?;
    let (ast, call) = doc.into_ast().map_err(CompileError::Ast)?;
    debug!(
        callables = ast.callables().count(),
        elapsed_ms = t.elapsed().as_secs_f64() * 1000.0,
        "document loaded"
    );

    let t = Instant::now();
    let (graph, result) = if options.wrap {
        build_pipeline_call_graph(&ast, &options.prefix, &call)
    } else {
        build_call_graph(&ast, &options.prefix, &call)
    };
    debug!(
        nodes = graph.len(),
        elapsed_ms = t.elapsed().as_secs_f64() * 1000.0,
        "call graph built"
    );
    if let Err(error) = result {
        return Err(CompileError::Resolve {
            graph: Box::new(graph),
            error,
        });
    }

    let canonical = json::to_json_string(&graph, false)?;
    let provenance = compute_provenance(input, &canonical);
    Ok(Compiled {
        graph,
        canonical,
        provenance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "callables": [
            {"kind": "stage", "id": "S",
             "in_params": [{"id": "x", "tname": "int"}],
             "out_params": [{"id": "y", "tname": "int"}]}
        ],
        "call": {"dec_id": "S", "bindings": [{"id": "x", "exp": {"kind": "int", "value": 2}}]}
    }"#;

    #[test]
    fn hex_is_lowercase_and_full_width() {
        let p = compute_provenance(b"abc", "{}");
        let hex = p.input_hash_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        assert!(p.to_json().contains("\"version\""));
    }

    #[test]
    fn fingerprint_hashes_canonical_json() {
        let compiled = compile(DOC.as_bytes(), &CompileOptions::default()).unwrap();
        assert_eq!(
            compiled.provenance.graph_fingerprint,
            sha256(compiled.canonical.as_bytes())
        );
        assert!(!compiled.canonical.contains('\n'));
        assert!(compiled.render(true).unwrap().contains('\n'));
    }

    #[test]
    fn wrap_option_makes_pipeline_root() {
        let options = CompileOptions {
            prefix: "ID.".into(),
            wrap: true,
        };
        let compiled = compile(DOC.as_bytes(), &options).unwrap();
        let root = compiled.graph.root().unwrap();
        assert_eq!(root.fqid, "ID.S");
        assert_eq!(compiled.graph.len(), 2);
    }

    #[test]
    fn failures_are_classified() {
        assert!(matches!(
            compile(b"not json", &CompileOptions::default()),
            Err(CompileError::Parse(_))
        ));
        let doc = r#"{"call": {"dec_id": "NOPE"}}"#;
        let err = compile(doc.as_bytes(), &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::Resolve { .. }));
        assert_eq!(err.diagnostics()[0].code, Some(diag::codes::UNKNOWN_CALLABLE));
    }
}
