// Property-based tests for resolver invariants.
//
// Three categories:
// 1. Source unification: merge(a, b) and merge(b, a) agree on shape
// 2. Literal projection: concrete values project to themselves or their members
// 3. Disable propagation: reachable descendants inherit their parent's conditions
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use std::collections::BTreeSet;
use std::sync::Arc;

use mcg::ast::{Ast, AstExp, CallSite, Decl, PipelineDecl, StageDecl};
use mcg::binding::Projector;
use mcg::build_call_graph;
use mcg::exp::{Exp, ForkMap, RefExp};
use mcg::id::SourceId;
use mcg::source::{MapSource, SourceArena};
use mcg::types::{CallMode, TypeTable};
use proptest::prelude::*;

// ── Source generator ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum SourceShape {
    Array(usize),
    Dict(BTreeSet<String>),
    Null,
    Reference { upstream: u8, map: bool },
    Placeholder { map: bool },
}

fn arb_source() -> impl Strategy<Value = SourceShape> {
    prop_oneof![
        (0usize..4).prop_map(SourceShape::Array),
        prop::collection::btree_set("[a-c]", 0..3).prop_map(SourceShape::Dict),
        Just(SourceShape::Null),
        (0u8..3, any::<bool>()).prop_map(|(upstream, map)| SourceShape::Reference { upstream, map }),
        any::<bool>().prop_map(|map| SourceShape::Placeholder { map }),
    ]
}

fn mode(map: bool) -> CallMode {
    if map {
        CallMode::Map
    } else {
        CallMode::Array
    }
}

fn alloc(arena: &mut SourceArena, shape: &SourceShape) -> SourceId {
    match shape {
        SourceShape::Array(len) => arena.alloc(MapSource::Array { len: *len }),
        SourceShape::Dict(keys) => arena.alloc(MapSource::Dict { keys: keys.clone() }),
        SourceShape::Null => arena.alloc(MapSource::Null),
        SourceShape::Reference { upstream, map } => {
            let r = Arc::new(RefExp::new(format!("P.GEN{upstream}"), "out"));
            arena.reference(&r, mode(*map))
        }
        SourceShape::Placeholder { map } => arena.alloc(MapSource::UnknownShape { mode: mode(*map) }),
    }
}

fn shape(arena: &SourceArena, id: SourceId) -> (CallMode, bool, usize, BTreeSet<String>) {
    (
        arena.call_mode(id),
        arena.known_length(id),
        arena.array_len(id),
        arena.keys(id).clone(),
    )
}

// ── Literal generator ───────────────────────────────────────────────────────

fn arb_literal() -> impl Strategy<Value = Exp> {
    let leaf = prop_oneof![
        Just(Exp::Null),
        any::<bool>().prop_map(Exp::Bool),
        (-1000i64..1000).prop_map(Exp::Int),
        "[a-z]{0,8}".prop_map(|s| Exp::string(&s)),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Exp::array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4).prop_map(Exp::dict),
        ]
    })
}

fn project(exp: &Exp, path: &str) -> Result<Exp, mcg::ResolveError> {
    let mut arena = SourceArena::new();
    let types = TypeTable::new();
    Projector::new(&mut arena, &types).project(exp, path, &ForkMap::new())
}

// ── Pipeline chain generator ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Disable {
    Unset,
    Literal(bool),
    Upstream,
}

fn arb_disable() -> impl Strategy<Value = Disable> {
    prop_oneof![
        Just(Disable::Unset),
        any::<bool>().prop_map(Disable::Literal),
        Just(Disable::Upstream),
    ]
}

/// `L0 → L1 → … → S`, each level also calling `FLAG` whose boolean output
/// may drive the next call's disable binding.
fn chain(levels: &[Disable]) -> (Ast, CallSite) {
    let depth = levels.len();
    let mut decls = vec![
        Decl::Stage(StageDecl::new("FLAG").output("b", "bool")),
        Decl::Stage(StageDecl::new("S")),
    ];
    for (i, d) in levels.iter().enumerate() {
        let callee = if i + 1 == depth {
            "S".to_string()
        } else {
            format!("L{}", i + 1)
        };
        let mut call = CallSite::new(callee);
        match d {
            Disable::Unset => {}
            Disable::Literal(b) => call = call.disabled(AstExp::bool(*b)),
            Disable::Upstream => call = call.disabled(AstExp::call_ref("FLAG", "b")),
        }
        decls.push(Decl::Pipeline(
            PipelineDecl::new(format!("L{i}")).call(CallSite::new("FLAG")).call(call),
        ));
    }
    let ast = Ast::new(TypeTable::new(), decls).expect("chain declarations are valid");
    (ast, CallSite::new("L0"))
}

// ── 1. Unification symmetry ────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn merge_is_shape_symmetric(a in arb_source(), b in arb_source()) {
        let mut arena = SourceArena::new();
        let ia = alloc(&mut arena, &a);
        let ib = alloc(&mut arena, &b);
        let mut forward = arena.clone();
        let mut backward = arena;

        let ab = forward.merge(Some(ia), Some(ib));
        let ba = backward.merge(Some(ib), Some(ia));
        prop_assert_eq!(ab.is_ok(), ba.is_ok(), "{:?} vs {:?}", ab, ba);
        if let (Ok(Some(x)), Ok(Some(y))) = (ab, ba) {
            prop_assert_eq!(shape(&forward, x), shape(&backward, y));
            prop_assert!(forward.shape_eq(x, ia) || forward.shape_eq(x, ib));
        }
    }
}

// ── 2. Idempotent projection ───────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn literal_projects_to_itself(e in arb_literal()) {
        let before = e.clone();
        let projected = project(&e, "").unwrap();
        prop_assert_eq!(&projected, &e);
        prop_assert_eq!(&e, &before);
    }

    #[test]
    fn member_projection_distributes_over_arrays(
        values in prop::collection::vec(arb_literal(), 0..4),
        name in "[a-z]{1,6}",
    ) {
        let structs: Vec<Exp> = values
            .iter()
            .map(|v| Exp::structure([(name.clone(), v.clone())].into_iter().collect()))
            .collect();
        let projected = project(&Exp::array(structs), &name).unwrap();
        prop_assert_eq!(projected, Exp::array(values));
    }

    #[test]
    fn path_into_scalar_is_an_error(n in any::<i64>(), name in "[a-z]{1,6}") {
        prop_assert!(project(&Exp::Int(n), &name).is_err());
    }
}

// ── 3. Disable monotonicity ────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn disable_lists_only_grow_downward(levels in prop::collection::vec(arb_disable(), 1..5)) {
        let (ast, call) = chain(&levels);
        let (g, r) = build_call_graph(&ast, "", &call);
        prop_assert!(r.is_ok(), "{:?}", r);

        for id in g.node_closure().values() {
            let node = g.node(*id);
            let Some(parent) = node.parent.map(|p| g.node(p)) else {
                continue;
            };
            prop_assert!(!parent.is_always_disabled(), "{} reachable under disabled parent", node.fqid);
            if node.is_always_disabled() {
                prop_assert_eq!(node.disabled(), &[Exp::Bool(true)][..]);
                continue;
            }
            for cond in parent.disabled() {
                prop_assert!(node.disabled().contains(cond), "{} dropped {:?}", node.fqid, cond);
            }
        }

        // Nothing below the first literal-true binding is reachable.
        let first_true = levels.iter().position(|d| matches!(d, Disable::Literal(true)));
        if let Some(i) = first_true {
            let deepest = g.node_closure().keys().map(|k| k.matches('.').count()).max().unwrap_or(0);
            prop_assert!(deepest <= i + 1);
        }
    }
}
