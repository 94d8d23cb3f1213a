//! Static CFG analysis.
//! 1. Immediate dominators of the source graph.
//! 2. Back edges, natural loops, loop nesting, latches and exits.
//!
//! This is the analysis surface the lifter consumes: it never looks at the
//! source graph directly for loop questions, only through `CfgAnalysis`.

use std::collections::{BTreeMap, BTreeSet};

use crate::cfg::{entry_block, ControlFlowGraph};
use petgraph::{algo::dominators::simple_fast, graph::NodeIndex, Direction};

/// Handle into [`CfgAnalysis::loops`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoopId(pub usize);

/// A single natural loop. Back edges sharing a header are merged, so there
/// is exactly one entry per header.
#[derive(Debug, Clone)]
pub struct NaturalLoop {
    pub header: NodeIndex,
    /// Sources of the back edges into `header`.
    pub latches: BTreeSet<NodeIndex>,
    /// All blocks of the loop, `header` and latches included.
    pub body: BTreeSet<NodeIndex>,
    /// Blocks outside the body that body blocks branch to.
    pub exits: BTreeSet<NodeIndex>,
    /// Innermost strictly-enclosing loop.
    pub parent: Option<LoopId>,
    /// 0 for outermost loops, parent depth + 1 below.
    pub depth: usize,
}

#[derive(Debug, Clone)]
pub struct CfgAnalysis {
    pub idom: BTreeMap<NodeIndex, NodeIndex>,
    pub loops: Vec<NaturalLoop>,
    headers: BTreeMap<NodeIndex, LoopId>,
    innermost: BTreeMap<NodeIndex, LoopId>,
}

impl CfgAnalysis {
    pub fn new(cfg: &ControlFlowGraph) -> Self {
        let idom = Self::compute_idom(cfg);
        let loops = Self::compute_loops(cfg, &idom);

        let mut headers = BTreeMap::new();
        let mut innermost = BTreeMap::<NodeIndex, LoopId>::new();
        for (i, lp) in loops.iter().enumerate() {
            headers.insert(lp.header, LoopId(i));
            for &b in &lp.body {
                match innermost.get(&b) {
                    Some(&prev) if loops[prev.0].body.len() <= lp.body.len() => {}
                    _ => {
                        innermost.insert(b, LoopId(i));
                    }
                }
            }
        }

        Self { idom, loops, headers, innermost }
    }

    /* ---------- base algorithms ---------- */

    fn compute_idom(cfg: &ControlFlowGraph) -> BTreeMap<NodeIndex, NodeIndex> {
        let entry = entry_block(cfg);
        let doms = simple_fast(cfg, entry);
        let mut out = BTreeMap::new();
        for n in cfg.node_indices() {
            if let Some(i) = doms.immediate_dominator(n) {
                out.insert(n, i);
            }
        }
        out
    }

    /// Does `y` dominate `x`?
    fn dom(idom: &BTreeMap<NodeIndex, NodeIndex>, mut x: NodeIndex, y: NodeIndex) -> bool {
        if x == y {
            return true;
        }
        while let Some(&p) = idom.get(&x) {
            if p == y {
                return true;
            }
            if p == x {
                break;
            }
            x = p;
        }
        false
    }

    /* ---------- back edges & loops ---------- */

    fn compute_loops(
        cfg: &ControlFlowGraph,
        idom: &BTreeMap<NodeIndex, NodeIndex>,
    ) -> Vec<NaturalLoop> {
        // One loop per header; a second back edge into the same header joins
        // the existing loop.
        let mut by_header = BTreeMap::<NodeIndex, (BTreeSet<NodeIndex>, BTreeSet<NodeIndex>)>::new();

        for tail in cfg.node_indices() {
            for head in cfg.neighbors_directed(tail, Direction::Outgoing) {
                if !Self::dom(idom, tail, head) {
                    continue;
                }
                // (tail, head) is a back edge; walk predecessors from the
                // tail until the header stops the search.
                let (latches, body) = by_header.entry(head).or_default();
                latches.insert(tail);
                body.insert(head);
                body.insert(tail);
                let mut work = vec![tail];
                while let Some(n) = work.pop() {
                    if n == head {
                        continue;
                    }
                    for pred in cfg.neighbors_directed(n, Direction::Incoming) {
                        if body.insert(pred) {
                            work.push(pred);
                        }
                    }
                }
            }
        }

        let mut loops: Vec<NaturalLoop> = by_header
            .into_iter()
            .map(|(header, (latches, body))| {
                let mut exits = BTreeSet::new();
                for &n in &body {
                    for succ in cfg.neighbors_directed(n, Direction::Outgoing) {
                        if !body.contains(&succ) {
                            exits.insert(succ);
                        }
                    }
                }
                NaturalLoop { header, latches, body, exits, parent: None, depth: 0 }
            })
            .collect();

        // Nesting: the parent is the smallest strict superset body.
        for i in 0..loops.len() {
            let mut parent: Option<usize> = None;
            for j in 0..loops.len() {
                if i == j || loops[j].body.len() <= loops[i].body.len() {
                    continue;
                }
                if loops[i].body.is_subset(&loops[j].body) {
                    match parent {
                        Some(p) if loops[p].body.len() <= loops[j].body.len() => {}
                        _ => parent = Some(j),
                    }
                }
            }
            loops[i].parent = parent.map(LoopId);
        }
        for i in 0..loops.len() {
            let mut depth = 0;
            let mut cur = loops[i].parent;
            while let Some(LoopId(p)) = cur {
                depth += 1;
                cur = loops[p].parent;
            }
            loops[i].depth = depth;
        }
        loops
    }

    /* ---------- query helpers ---------- */

    pub fn is_loop_header(&self, block: NodeIndex) -> bool {
        self.headers.contains_key(&block)
    }

    /// The loop headed by `block`, if any.
    pub fn header_loop(&self, block: NodeIndex) -> Option<LoopId> {
        self.headers.get(&block).copied()
    }

    /// Innermost loop containing `block`.
    pub fn loop_for(&self, block: NodeIndex) -> Option<LoopId> {
        self.innermost.get(&block).copied()
    }

    pub fn parent_loop(&self, l: LoopId) -> Option<LoopId> {
        self.loops[l.0].parent
    }

    pub fn loop_header(&self, l: LoopId) -> NodeIndex {
        self.loops[l.0].header
    }

    pub fn loop_depth(&self, l: LoopId) -> usize {
        self.loops[l.0].depth
    }

    pub fn exit_blocks(&self, l: LoopId) -> &BTreeSet<NodeIndex> {
        &self.loops[l.0].exits
    }

    /// Is `block` a back-edge source of `l`? Only blocks whose innermost
    /// loop is `l` itself qualify.
    pub fn is_loop_latch(&self, l: LoopId, block: NodeIndex) -> bool {
        self.loop_for(block) == Some(l) && self.loops[l.0].latches.contains(&block)
    }

    /// Chain of loops around `block`, innermost first, without the
    /// outermost one (the loop whose parent is absent).
    pub fn loop_set(&self, block: NodeIndex) -> BTreeSet<LoopId> {
        self.loop_set_of(self.loop_for(block))
    }

    /// Same chain, starting from an explicit innermost loop.
    pub fn loop_set_of(&self, innermost: Option<LoopId>) -> BTreeSet<LoopId> {
        let mut set = BTreeSet::new();
        let mut cur = innermost;
        while let Some(l) = cur {
            let parent = self.parent_loop(l);
            if parent.is_none() {
                break;
            }
            set.insert(l);
            cur = parent;
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_cfg;
    use crate::parser::parse_cfg_text;

    fn analyze(src: &str) -> (ControlFlowGraph, CfgAnalysis) {
        let g = build_cfg(&parse_cfg_text(src).unwrap()).unwrap();
        let a = CfgAnalysis::new(&g);
        (g, a)
    }

    fn by_name(g: &ControlFlowGraph, name: &str) -> NodeIndex {
        g.node_indices().find(|&i| g[i].name == name).unwrap()
    }

    #[test]
    fn diamond_has_no_loops() {
        let (_, a) = analyze("a: br b c\nb: jmp d\nc: jmp d\nd: ret\n");
        assert!(a.loops.is_empty());
    }

    #[test]
    fn simple_loop() {
        let (g, a) = analyze("a: jmp h\nh: br b x\nb: jmp h\nx: ret\n");
        let h = by_name(&g, "h");
        let b = by_name(&g, "b");
        let x = by_name(&g, "x");
        assert!(a.is_loop_header(h));
        let l = a.header_loop(h).unwrap();
        assert!(a.is_loop_latch(l, b));
        assert!(!a.is_loop_latch(l, h));
        assert_eq!(a.exit_blocks(l).iter().copied().collect::<Vec<_>>(), vec![x]);
        assert_eq!(a.loop_for(x), None);
        // A single un-nested loop contributes nothing to the loop chain.
        assert!(a.loop_set(b).is_empty());
    }

    #[test]
    fn nested_loops() {
        let (g, a) = analyze(
            "a: jmp h1\nh1: br h2 x\nh2: br b l1\nb: jmp h2\nl1: jmp h1\nx: ret\n",
        );
        let h1 = by_name(&g, "h1");
        let h2 = by_name(&g, "h2");
        let b = by_name(&g, "b");
        let l1 = by_name(&g, "l1");
        let outer = a.header_loop(h1).unwrap();
        let inner = a.header_loop(h2).unwrap();
        assert_eq!(a.parent_loop(inner), Some(outer));
        assert_eq!(a.parent_loop(outer), None);
        assert_eq!(a.loop_depth(inner), 1);
        assert_eq!(a.loop_for(b), Some(inner));
        assert_eq!(a.loop_for(l1), Some(outer));
        // The chain stops short of the outermost loop.
        assert_eq!(a.loop_set(b).into_iter().collect::<Vec<_>>(), vec![inner]);
        assert!(a.loop_set(l1).is_empty());
        assert!(a.is_loop_latch(outer, l1));
        assert!(a.is_loop_latch(inner, b));
        assert!(!a.is_loop_latch(outer, b));
    }

    #[test]
    fn self_loop() {
        let (g, a) = analyze("a: jmp h\nh: br h x\nx: ret\n");
        let h = by_name(&g, "h");
        assert!(a.is_loop_header(h));
        let l = a.header_loop(h).unwrap();
        assert!(a.is_loop_latch(l, h));
        assert_eq!(a.loops[l.0].body.len(), 1);
    }
}
