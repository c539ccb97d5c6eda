// id.rs — Arena handles for call graph nodes and map-call sources
//
// Identity matters more than structure in call graph resolution: two calls
// mapping over "the same" collection must share one source object, and a
// split or merge belongs to exactly one node. Both are modelled as small
// integer handles into arenas owned by `CallGraph`, compared by value.
// Handles are allocated in construction order, so assignment is deterministic
// for a given AST.

use std::fmt;

/// Handle of a node in `CallGraph::nodes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Handle of a map-call source in `SourceArena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl SourceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_order_by_allocation() {
        assert!(NodeId(0) < NodeId(1));
        assert_eq!(SourceId(7).index(), 7);
        assert_eq!(format!("{} {}", NodeId(3), SourceId(4)), "n3 s4");
    }
}
