//! Dominator tree over the auxiliary block graph.
//!
//! The graph is mirrored into a scratch petgraph structure and handed to the
//! stock simple-fast algorithm. Latch redirection has already made input
//! flow acyclic at every node, so the result captures dominance as seen
//! before entering any loop.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::dominators::simple_fast;
use petgraph::graph::{Graph, NodeIndex};

use crate::apeg::BBEdgeSet;
use crate::errors::{LiftError, Result};
use crate::peg::{PegFunction, PegNodeId};

pub struct PegDominatorTree {
    idom: BTreeMap<PegNodeId, PegNodeId>,
    root: PegNodeId,
}

impl PegDominatorTree {
    pub fn compute(func: &PegFunction, entry: PegNodeId) -> Self {
        let mut scratch = Graph::<PegNodeId, ()>::new();
        let mut index = BTreeMap::<PegNodeId, NodeIndex>::new();
        for block in func.blocks() {
            index.insert(block, scratch.add_node(block));
        }
        for block in func.blocks() {
            for &(succ, _) in &func.block(block).succs {
                scratch.add_edge(index[&block], index[&succ], ());
            }
        }

        let doms = simple_fast(&scratch, index[&entry]);
        let mut idom = BTreeMap::new();
        for block in func.blocks() {
            if let Some(i) = doms.immediate_dominator(index[&block]) {
                idom.insert(block, scratch[i]);
            }
        }
        Self { idom, root: entry }
    }

    pub fn root(&self) -> PegNodeId {
        self.root
    }

    pub fn immediate_dominator(&self, block: PegNodeId) -> Option<PegNodeId> {
        self.idom.get(&block).copied()
    }

    /// Lowest common ancestor of `a` and `b` in the tree. `None` when either
    /// node is unreachable from the root.
    pub fn nearest_common_dominator(&self, a: PegNodeId, b: PegNodeId) -> Option<PegNodeId> {
        if a != self.root && !self.idom.contains_key(&a) {
            return None;
        }
        let mut ancestors = BTreeSet::new();
        let mut cur = a;
        loop {
            ancestors.insert(cur);
            match self.idom.get(&cur) {
                Some(&p) => cur = p,
                None => break,
            }
        }

        let mut cur = b;
        loop {
            if ancestors.contains(&cur) {
                return Some(cur);
            }
            match self.idom.get(&cur) {
                Some(&p) => cur = p,
                None => return None,
            }
        }
    }
}

/// Fold the nearest-common-dominator query over the sources of an edge set.
/// The root edge contributes its destination.
pub fn find_common_dominator(dt: &PegDominatorTree, edges: &BBEdgeSet) -> Result<PegNodeId> {
    let mut dom: Option<PegNodeId> = None;
    for e in edges {
        let src = e.value_source();
        dom = Some(match dom {
            None => src,
            Some(d) => dt
                .nearest_common_dominator(d, src)
                .ok_or(LiftError::MissingDominator)?,
        });
    }
    dom.ok_or(LiftError::MissingDominator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apeg::{build_apeg, Apeg};
    use crate::cfg::build_cfg;
    use crate::cfg_analysis::CfgAnalysis;
    use crate::parser::parse_cfg_text;

    fn setup(src: &str) -> (Apeg, PegDominatorTree) {
        let g = build_cfg(&parse_cfg_text(src).unwrap()).unwrap();
        let a = CfgAnalysis::new(&g);
        let apeg = build_apeg(&g, &a, "t").unwrap();
        let entry = apeg.root_edge.dest();
        let dt = PegDominatorTree::compute(&apeg.func, entry);
        (apeg, dt)
    }

    fn block(apeg: &Apeg, name: &str) -> PegNodeId {
        apeg.func
            .blocks()
            .find(|&b| apeg.func.node(b).name == name)
            .unwrap()
    }

    #[test]
    fn diamond_join_is_dominated_by_the_fork() {
        let (apeg, dt) = setup("a: br b c\nb: jmp d\nc: jmp d\nd: ret\n");
        let a = block(&apeg, "a");
        let b = block(&apeg, "b");
        let c = block(&apeg, "c");
        let d = block(&apeg, "d");
        assert_eq!(dt.immediate_dominator(d), Some(a));
        assert_eq!(dt.nearest_common_dominator(b, c), Some(a));
        assert_eq!(dt.nearest_common_dominator(b, d), Some(a));
        assert_eq!(dt.nearest_common_dominator(b, b), Some(b));
        assert_eq!(dt.nearest_common_dominator(a, d), Some(a));
    }

    #[test]
    fn virtual_twin_is_reachable_through_the_loop_body() {
        let (apeg, dt) = setup("a: jmp h\nh: br b x\nb: jmp h\nx: ret\n");
        let b = block(&apeg, "b");
        let twin = block(&apeg, "h-virtual");
        assert_eq!(dt.immediate_dominator(twin), Some(b));
    }

    #[test]
    fn common_dominator_of_in_edges() {
        let (apeg, dt) = setup("a: br b c\nb: jmp d\nc: jmp d\nd: ret\n");
        let a = block(&apeg, "a");
        let d = block(&apeg, "d");
        assert_eq!(find_common_dominator(&dt, &apeg.in_edges(d)).unwrap(), a);
        // The root edge stands in for its destination.
        let root_only: BBEdgeSet = [apeg.root_edge].into();
        assert_eq!(find_common_dominator(&dt, &root_only).unwrap(), a);
        assert_eq!(
            find_common_dominator(&dt, &BBEdgeSet::new()).unwrap_err(),
            LiftError::MissingDominator
        );
    }
}
