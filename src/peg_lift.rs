//! CFG → PEG lift.
//!
//! The lifter walks every block of the auxiliary graph and synthesizes a
//! value expression answering "which incoming edge delivers control here".
//! Straight-line flow collapses to the predecessor block, joins become phi
//! trees over the branch conditions of their dominators, and loop headers
//! become thetas whose recurrence is the same question asked of the virtual
//! forward twin.

use std::collections::{BTreeSet, VecDeque};
use std::fs;

use crate::apeg::{build_apeg, Apeg, BBEdge, BBEdgeSet};
use crate::cfg::ControlFlowGraph;
use crate::cfg_analysis::{CfgAnalysis, LoopId};
use crate::debug_log;
use crate::dot::{apeg_to_dot, peg_to_dot};
use crate::errors::{LiftError, Result};
use crate::peg::{PegFunction, PegNodeId};
use crate::peg_dominators::{find_common_dominator, PegDominatorTree};

/// Output toggles of the lift. The lift itself is not configurable.
#[derive(Clone, Debug, Default)]
pub struct LiftConfig {
    /// Write `pegbbs.<fn>.dot` and `peg.<fn>.dot` after a successful lift.
    pub emit_dot: bool,
    /// Also draw condition nodes that nothing selects on.
    pub draw_all_nodes: bool,
}

type ValueFn<'f> = &'f dyn Fn(&BBEdge) -> PegNodeId;

pub struct PegLifter<'a> {
    cfg: &'a ControlFlowGraph,
    analysis: &'a CfgAnalysis,
    apeg: Apeg,
    dt: PegDominatorTree,
}

impl<'a> PegLifter<'a> {
    pub fn new(cfg: &'a ControlFlowGraph, analysis: &'a CfgAnalysis, name: &str) -> Result<Self> {
        let apeg = build_apeg(cfg, analysis, name)?;
        let dt = PegDominatorTree::compute(&apeg.func, apeg.root_edge.dest());
        Ok(Self { cfg, analysis, apeg, dt })
    }

    /// Attach a child expression to every concrete block and hand the
    /// finished function over. A plain entry block has no inputs to explain
    /// and keeps `child = None`; an entry block heading a loop still gets
    /// its theta, fed by the root edge.
    pub fn lift(mut self) -> Result<PegFunction> {
        let blocks: Vec<PegNodeId> = self.apeg.bb_map.values().copied().collect();
        for block in blocks {
            let is_entry = self.apeg.func.block(block).is_entry;
            if is_entry && !self.is_loop_header(block) {
                continue;
            }
            let child = self.compute_inputs(block)?;
            self.apeg.func.set_child(block, child);
        }
        Ok(self.apeg.func)
    }

    /// Concrete loop headers only; a virtual twin never counts as one.
    fn is_loop_header(&self, block: PegNodeId) -> bool {
        let data = self.apeg.func.block(block);
        !data.is_virtual_forward && self.analysis.is_loop_header(data.source)
    }

    fn compute_inputs(&mut self, block: PegNodeId) -> Result<PegNodeId> {
        debug_log!("lift", "computing inputs of {}", self.apeg.func.node(block).name);
        let in_edges = self.apeg.in_edges(block);
        let root = self.apeg.root_edge;
        let value_fn = move |e: &BBEdge| -> PegNodeId {
            if *e == root {
                e.dest()
            } else {
                e.value_source()
            }
        };
        let outer = self
            .analysis
            .loop_set_of(self.apeg.func.block(block).surrounding_loop);
        let decider = self.make_decide(root, &in_edges, &value_fn, outer)?;

        if self.is_loop_header(block) {
            // The twin sees exactly the latch edges, so its inputs are the
            // value produced by the next iteration. The twin itself is never
            // a header, which bounds this recursion at depth one.
            let twin = self
                .apeg
                .func
                .block(block)
                .peer
                .expect("loop header without a virtual forward twin");
            let recurrence = self.compute_inputs(twin)?;
            Ok(self.apeg.func.add_theta(decider, recurrence))
        } else {
            Ok(decider)
        }
    }

    /// Build the expression selecting which edge of `in_edges` carries
    /// control, descending from `source`.
    fn make_decide(
        &mut self,
        source: BBEdge,
        in_edges: &BBEdgeSet,
        value_fn: ValueFn<'_>,
        outer: BTreeSet<LoopId>,
    ) -> Result<PegNodeId> {
        debug_log!(
            "decide",
            "from {} over {} in-edge(s)",
            source.render(&self.apeg.func),
            in_edges.len()
        );
        let dom = find_common_dominator(&self.dt, in_edges)?;
        let dom_loops = self
            .analysis
            .loop_set_of(self.apeg.func.block(dom).surrounding_loop);

        if dom_loops.is_subset(&outer) {
            // All edges mapping to one value means there is nothing left to
            // decide.
            if let Some(common) = common_mapped_node(in_edges, value_fn) {
                return Ok(common);
            }
            debug_assert!(in_edges.len() > 1);

            let (true_succ, false_succ) = self.apeg.true_false_successors(dom)?;
            let true_edge = BBEdge::new(dom, true_succ);
            let false_edge = BBEdge::new(dom, false_succ);

            let true_edges: BBEdgeSet = in_edges
                .iter()
                .filter(|e| self.is_reachable_from_edge(&true_edge, e))
                .copied()
                .collect();
            let false_edges: BBEdgeSet = in_edges
                .iter()
                .filter(|e| self.is_reachable_from_edge(&false_edge, e))
                .copied()
                .collect();
            debug_log!(
                "decide",
                "dominator {}: {} true / {} false",
                self.apeg.func.node(dom).name,
                true_edges.len(),
                false_edges.len()
            );

            let on_true = self.make_decide(true_edge, &true_edges, value_fn, outer.clone())?;
            let on_false = self.make_decide(false_edge, &false_edges, value_fn, outer)?;
            let cond = self.apeg.condition_for(dom)?;
            Ok(self.apeg.func.add_phi(cond, on_true, on_false))
        } else {
            // The dominator sits inside a loop this selection has not
            // entered. Ascend into the outermost unentered loop and resolve
            // the edges there; selecting that value from outside would then
            // need an evaluation of the loop under its break condition, and
            // those nodes are not synthesized here. Reject instead of
            // producing a value with the wrong iteration semantics.
            let ascend = dom_loops
                .iter()
                .copied()
                .filter(|l| !outer.contains(l))
                .min_by_key(|&l| self.analysis.loop_depth(l))
                .expect("failed subset check implies an unentered loop");
            let mut wider = outer;
            wider.insert(ascend);
            let _value = self.make_decide(source, in_edges, value_fn, wider)?;

            let breaks = self.apeg.break_edges(ascend, self.analysis);
            debug_log!("decide", "escape from loop would pass through:");
            for e in &breaks {
                debug_log!("decide", "  {}", e.render(&self.apeg.func));
            }
            let header = self.analysis.loop_header(ascend);
            Err(LiftError::LoopEscape { header: self.cfg[header].name.clone() })
        }
    }

    /// Can control that leaves along `src` later traverse `dst`? True when
    /// the edges coincide, when `src` flows directly into `dst`'s source,
    /// or when a forward walk from `src`'s destination reaches it.
    fn is_reachable_from_edge(&self, src: &BBEdge, dst: &BBEdge) -> bool {
        if src == dst {
            return true;
        }
        let Some(dst_src) = dst.source() else {
            // Only the root edge lacks a source; nothing flows into it.
            return false;
        };
        if src.dest() == dst_src {
            return true;
        }
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([src.dest()]);
        while let Some(n) = queue.pop_front() {
            if !visited.insert(n) {
                continue;
            }
            for &(succ, _) in &self.apeg.func.block(n).succs {
                queue.push_back(succ);
            }
        }
        visited.contains(&dst_src)
    }
}

fn common_mapped_node(in_edges: &BBEdgeSet, value_fn: ValueFn<'_>) -> Option<PegNodeId> {
    let mut common = None;
    for e in in_edges {
        let v = value_fn(e);
        match common {
            None => common = Some(v),
            Some(c) if c != v => return None,
            Some(_) => {}
        }
    }
    common
}

/// Run the whole lift for one function: analysis consumption, auxiliary
/// graph, dominators, per-block children.
pub fn lift_function(cfg: &ControlFlowGraph, name: &str, config: &LiftConfig) -> Result<PegFunction> {
    let analysis = CfgAnalysis::new(cfg);
    let func = PegLifter::new(cfg, &analysis, name)?.lift()?;
    if config.emit_dot {
        write_dot_files(&func, config);
    }
    Ok(func)
}

/// Best-effort DOT output. I/O failures are reported on stderr and do not
/// fail the lift.
pub fn write_dot_files(func: &PegFunction, config: &LiftConfig) {
    let jobs = [
        (format!("pegbbs.{}.dot", func.name()), apeg_to_dot(func)),
        (format!("peg.{}.dot", func.name()), peg_to_dot(func, config.draw_all_nodes)),
    ];
    for (path, contents) in jobs {
        if let Err(err) = fs::write(&path, contents) {
            eprintln!("error writing '{path}': {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_cfg;
    use crate::parser::parse_cfg_text;

    fn lifter<'a>(cfg: &'a ControlFlowGraph, analysis: &'a CfgAnalysis) -> PegLifter<'a> {
        PegLifter::new(cfg, analysis, "t").unwrap()
    }

    fn graph(src: &str) -> ControlFlowGraph {
        build_cfg(&parse_cfg_text(src).unwrap()).unwrap()
    }

    fn block(l: &PegLifter<'_>, name: &str) -> PegNodeId {
        l.apeg
            .func
            .blocks()
            .find(|&b| l.apeg.func.node(b).name == name)
            .unwrap()
    }

    #[test]
    fn collapse_rule_ignores_dominator_structure() {
        let cfg = graph("a: br b c\nb: jmp d\nc: jmp d\nd: ret\n");
        let analysis = CfgAnalysis::new(&cfg);
        let mut l = lifter(&cfg, &analysis);
        let d = block(&l, "d");
        let a = block(&l, "a");
        let in_edges = l.apeg.in_edges(d);
        assert_eq!(in_edges.len(), 2);
        // Constant mapping: no phi may be built.
        let constant = move |_: &BBEdge| a;
        let root = l.apeg.root_edge;
        let got = l.make_decide(root, &in_edges, &constant, BTreeSet::new()).unwrap();
        assert_eq!(got, a);
    }

    #[test]
    fn partition_covers_every_edge() {
        let cfg = graph("a: br b c\nb: jmp d\nc: jmp d\nd: ret\n");
        let analysis = CfgAnalysis::new(&cfg);
        let l = lifter(&cfg, &analysis);
        let (a, b, c, d) = (block(&l, "a"), block(&l, "b"), block(&l, "c"), block(&l, "d"));
        let true_edge = BBEdge::new(a, b);
        let false_edge = BBEdge::new(a, c);
        let in_edges = l.apeg.in_edges(d);
        for e in &in_edges {
            let in_true = l.is_reachable_from_edge(&true_edge, e);
            let in_false = l.is_reachable_from_edge(&false_edge, e);
            assert!(in_true || in_false, "edge {} unreachable from both legs", e.render(&l.apeg.func));
        }
        // And the split is exact here: each leg owns exactly one edge.
        assert_eq!(
            in_edges.iter().filter(|e| l.is_reachable_from_edge(&true_edge, e)).count(),
            1
        );
        assert_eq!(
            in_edges.iter().filter(|e| l.is_reachable_from_edge(&false_edge, e)).count(),
            1
        );
    }

    #[test]
    fn edge_reachability_cases() {
        let cfg = graph("a: br b c\nb: jmp d\nc: jmp d\nd: jmp e\ne: ret\n");
        let analysis = CfgAnalysis::new(&cfg);
        let l = lifter(&cfg, &analysis);
        let (a, b, c, d, e) =
            (block(&l, "a"), block(&l, "b"), block(&l, "c"), block(&l, "d"), block(&l, "e"));
        let ab = BBEdge::new(a, b);
        // An edge reaches itself.
        assert!(l.is_reachable_from_edge(&ab, &ab));
        // Adjacency: a->b feeds b->d.
        assert!(l.is_reachable_from_edge(&ab, &BBEdge::new(b, d)));
        // Transitive: a->b reaches d->e through the walk.
        assert!(l.is_reachable_from_edge(&ab, &BBEdge::new(d, e)));
        // The other branch leg is not reachable.
        assert!(!l.is_reachable_from_edge(&ab, &BBEdge::new(c, d)));
        // Nothing flows into the root edge.
        let root = l.apeg.root_edge;
        assert!(!l.is_reachable_from_edge(&ab, &root));
    }

    #[test]
    fn empty_edge_set_is_a_contract_violation() {
        let cfg = graph("a: jmp b\nb: ret\n");
        let analysis = CfgAnalysis::new(&cfg);
        let mut l = lifter(&cfg, &analysis);
        let root = l.apeg.root_edge;
        let a = block(&l, "a");
        let constant = move |_: &BBEdge| a;
        let got = l.make_decide(root, &BBEdgeSet::new(), &constant, BTreeSet::new());
        assert_eq!(got.unwrap_err(), LiftError::MissingDominator);
    }
}
