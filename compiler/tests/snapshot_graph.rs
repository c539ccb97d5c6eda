// Snapshot tests: lock the JSON projection and the tree rendering of resolved
// call graphs to detect unintended structural changes.
//
// Uses the library API (compile) on documents under `compiler/tests/fixtures/`.
// Snapshots are managed by `insta` and stored under `compiler/tests/snapshots/`.
//
// Run `cargo insta review` after intentional output changes to update baselines.

use std::path::{Path, PathBuf};

use mcg::pipeline::{compile, CompileOptions, Compiled};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn compile_fixture(name: &str) -> Compiled {
    let path = fixture(name);
    let input = std::fs::read(&path).unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e));
    compile(&input, &CompileOptions::default())
        .unwrap_or_else(|e| panic!("failed to resolve {}: {}", path.display(), e))
}

#[test]
fn snapshot_single_stage_json() {
    let json = compile_fixture("single_stage.json").render(true).unwrap();
    insta::assert_snapshot!("single_stage_json", json);
}

#[test]
fn snapshot_unknown_length_json() {
    let json = compile_fixture("unknown_length.json").render(true).unwrap();
    insta::assert_snapshot!("unknown_length_json", json);
}

#[test]
fn snapshot_nested_static_tree() {
    let tree = compile_fixture("nested_static.json").graph.to_string();
    insta::assert_snapshot!("nested_static_tree", tree);
}
