//! Auxiliary block graph.
//!
//! Every loop header is split in two: the concrete node keeps the edges that
//! enter the loop from outside, a virtual forward twin absorbs the back
//! edges from the latches. Input flow into any node is then acyclic, which
//! is what lets a stock dominator algorithm run over the graph.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::cfg::{entry_block, ControlFlowGraph, EdgeKind};
use crate::cfg_analysis::{CfgAnalysis, LoopId};
use crate::debug_log;
use crate::errors::{LiftError, Result};
use crate::peg::{PegFunction, PegNodeId};

/// Directed edge between two block nodes. The sole edge without a source is
/// the root edge, whose destination is the entry block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBEdge {
    source: Option<PegNodeId>,
    dest: PegNodeId,
}

impl BBEdge {
    pub fn new(source: PegNodeId, dest: PegNodeId) -> Self {
        Self { source: Some(source), dest }
    }

    /// The root edge. There is exactly one per function.
    pub fn entry(dest: PegNodeId) -> Self {
        Self { source: None, dest }
    }

    pub fn source(&self) -> Option<PegNodeId> {
        self.source
    }

    pub fn dest(&self) -> PegNodeId {
        self.dest
    }

    /// The node whose value stands for this edge's origin: the source, or
    /// the destination for the root edge.
    pub fn value_source(&self) -> PegNodeId {
        self.source.unwrap_or(self.dest)
    }

    pub fn render(&self, func: &PegFunction) -> String {
        let src = match self.source {
            Some(s) => func.node(s).name.clone(),
            None => "<entry>".to_string(),
        };
        format!("{} --> {}", src, func.node(self.dest).name)
    }
}

// Structural order over the (dest, source) pair, so edge sets iterate
// deterministically.
impl Ord for BBEdge {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.dest, self.source).cmp(&(other.dest, other.source))
    }
}

impl PartialOrd for BBEdge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub type BBEdgeSet = BTreeSet<BBEdge>;

/// The auxiliary graph plus the lookup tables populated while building it.
/// All three maps are read-only after construction.
pub struct Apeg {
    pub func: PegFunction,
    /// Source basic block → concrete block node.
    pub bb_map: BTreeMap<NodeIndex, PegNodeId>,
    /// Concrete block node → its condition node.
    pub cond_map: BTreeMap<PegNodeId, PegNodeId>,
    pub root_edge: BBEdge,
}

impl Apeg {
    pub fn condition_for(&self, block: PegNodeId) -> Result<PegNodeId> {
        self.cond_map.get(&block).copied().ok_or_else(|| LiftError::MissingCondition {
            block: self.func.node(block).name.clone(),
        })
    }

    /// Edges converging on `block`: the root edge for the entry block, the
    /// auxiliary predecessor edges otherwise.
    pub fn in_edges(&self, block: PegNodeId) -> BBEdgeSet {
        let data = self.func.block(block);
        if data.is_entry {
            return [self.root_edge].into();
        }
        data.preds.iter().map(|&p| BBEdge::new(p, block)).collect()
    }

    /// True and false successors of a conditional block in the auxiliary
    /// graph. A block without both legs cannot steer a selection.
    pub fn true_false_successors(&self, block: PegNodeId) -> Result<(PegNodeId, PegNodeId)> {
        let data = self.func.block(block);
        let mut on_true = None;
        let mut on_false = None;
        for &(succ, kind) in &data.succs {
            match kind {
                EdgeKind::True => on_true = Some(succ),
                EdgeKind::False => on_false = Some(succ),
                EdgeKind::Uncond => {}
            }
        }
        match (on_true, on_false) {
            (Some(t), Some(f)) => Ok((t, f)),
            _ => Err(LiftError::UnsupportedTerminator {
                block: self.func.node(block).name.clone(),
            }),
        }
    }

    /// Edges from the exit blocks of `l` back to its header, the set a
    /// loop-escape selection would be built over.
    pub fn break_edges(&self, l: LoopId, analysis: &CfgAnalysis) -> BBEdgeSet {
        let header = self.bb_map[&analysis.loop_header(l)];
        analysis
            .exit_blocks(l)
            .iter()
            .map(|exit| BBEdge::new(self.bb_map[exit], header))
            .collect()
    }
}

fn block_name(name: &str, has_twin: bool, is_virtual: bool) -> String {
    if is_virtual {
        format!("{name}-virtual")
    } else if has_twin {
        format!("{name}-concrete")
    } else {
        name.to_string()
    }
}

/// Populate the auxiliary graph for one function: a concrete node per source
/// block, a virtual forward twin per loop header, a condition per concrete
/// node, and the redirected edge set.
pub fn build_apeg(cfg: &ControlFlowGraph, analysis: &CfgAnalysis, name: &str) -> Result<Apeg> {
    let mut func = PegFunction::new(name);
    let mut bb_map = BTreeMap::new();
    let mut cond_map = BTreeMap::new();
    // Concrete header → twin; consulted while wiring latch edges.
    let mut virtual_map = BTreeMap::<PegNodeId, PegNodeId>::new();
    let mut root_edge = None;

    let entry = entry_block(cfg);
    for bb in cfg.node_indices() {
        let is_entry = bb == entry;
        let twin = if analysis.is_loop_header(bb) {
            Some(func.add_block(
                block_name(&cfg[bb].name, false, true),
                bb,
                None,
                false,
                true,
                None,
            ))
        } else {
            None
        };
        let concrete = func.add_block(
            block_name(&cfg[bb].name, twin.is_some(), false),
            bb,
            analysis.loop_for(bb),
            is_entry,
            false,
            twin,
        );
        if let Some(v) = twin {
            debug_log!(
                "apeg",
                "virtual forward twin {} for {}",
                func.node(v).name,
                func.node(concrete).name
            );
            virtual_map.insert(concrete, v);
        }
        bb_map.insert(bb, concrete);
        let cond = func.add_condition(concrete);
        cond_map.insert(concrete, cond);
        if is_entry {
            root_edge = Some(BBEdge::entry(concrete));
        }
    }
    let root_edge = root_edge.expect("function has no entry block");

    for (&bb, &concrete) in &bb_map {
        let header_loop = analysis.header_loop(bb);
        for e in cfg.edges_directed(bb, Direction::Incoming) {
            let pred = bb_map[&e.source()];
            // Latches are forwarded to the twin; everything else lands on
            // the concrete node.
            let dest = match header_loop {
                Some(l) if analysis.is_loop_latch(l, e.source()) => virtual_map[&concrete],
                _ => concrete,
            };
            func.add_edge(pred, dest, *e.weight());
        }
    }

    Ok(Apeg { func, bb_map, cond_map, root_edge })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_cfg;
    use crate::parser::parse_cfg_text;

    fn apeg(src: &str) -> (ControlFlowGraph, CfgAnalysis, Apeg) {
        let g = build_cfg(&parse_cfg_text(src).unwrap()).unwrap();
        let a = CfgAnalysis::new(&g);
        let apeg = build_apeg(&g, &a, "t").unwrap();
        (g, a, apeg)
    }

    fn peg_block<'p>(apeg: &'p Apeg, name: &str) -> PegNodeId {
        apeg.func
            .blocks()
            .find(|&b| apeg.func.node(b).name == name)
            .unwrap_or_else(|| panic!("no block named {name}"))
    }

    #[test]
    fn loop_header_is_split() {
        let (_, _, apeg) = apeg("a: jmp h\nh: br b x\nb: jmp h\nx: ret\n");
        let concrete = peg_block(&apeg, "h-concrete");
        let twin = peg_block(&apeg, "h-virtual");
        let a = peg_block(&apeg, "a");
        let b = peg_block(&apeg, "b");

        assert_eq!(apeg.func.block(concrete).peer, Some(twin));
        assert!(apeg.func.block(twin).is_virtual_forward);
        assert_eq!(apeg.func.block(twin).peer, None);
        // Only the outside edge reaches the concrete header; the latch edge
        // lands on the twin.
        assert_eq!(apeg.func.block(concrete).preds, vec![a]);
        assert_eq!(apeg.func.block(twin).preds, vec![b]);
    }

    #[test]
    fn root_edge_targets_entry() {
        let (_, _, apeg) = apeg("a: jmp b\nb: ret\n");
        let a = peg_block(&apeg, "a");
        assert_eq!(apeg.root_edge.source(), None);
        assert_eq!(apeg.root_edge.dest(), a);
        assert_eq!(apeg.root_edge.value_source(), a);
        assert_eq!(apeg.in_edges(a), [apeg.root_edge].into());
    }

    #[test]
    fn true_false_successors_of_header() {
        let (_, _, apeg) = apeg("a: jmp h\nh: br b x\nb: jmp h\nx: ret\n");
        let h = peg_block(&apeg, "h-concrete");
        let b = peg_block(&apeg, "b");
        let x = peg_block(&apeg, "x");
        assert_eq!(apeg.true_false_successors(h).unwrap(), (b, x));
        assert!(apeg.true_false_successors(b).is_err());
    }

    #[test]
    fn break_edges_point_at_the_header() {
        let (g, a, apeg) = apeg("a: jmp h\nh: br b x\nb: jmp h\nx: ret\n");
        let h_bb = g.node_indices().find(|&i| g[i].name == "h").unwrap();
        let l = a.header_loop(h_bb).unwrap();
        let edges = apeg.break_edges(l, &a);
        let h = peg_block(&apeg, "h-concrete");
        let x = peg_block(&apeg, "x");
        assert_eq!(edges, [BBEdge::new(x, h)].into());
    }

    #[test]
    fn edge_order_is_structural() {
        let a = BBEdge::new(PegNodeId(1), PegNodeId(2));
        let b = BBEdge::new(PegNodeId(0), PegNodeId(3));
        let c = BBEdge::entry(PegNodeId(2));
        assert!(a < b);
        assert!(c < a);
        let set: BBEdgeSet = [a, b, c, a].into();
        assert_eq!(set.len(), 3);
    }
}
