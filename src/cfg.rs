//! Source control-flow graph.
//! * One function at a time; blocks carry only a name.
//! * Uses petgraph::Graph, entry block is the first node added.

use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;

use crate::errors::{LiftError, Result};
use crate::parser::{FunctionAst, TerminatorAst};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub name: String,
}

/// Which leg of the terminator an edge belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    True,
    False,
    Uncond,
}

pub type ControlFlowGraph = Graph<BasicBlock, EdgeKind>;

/// Entry block of a function graph. Always the first node added.
pub fn entry_block(_cfg: &ControlFlowGraph) -> NodeIndex {
    NodeIndex::new(0)
}

/// Terminator of a block, reconstructed from its outgoing edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    Cond { on_true: NodeIndex, on_false: NodeIndex },
    Jmp(NodeIndex),
    Ret,
}

/// Classify a block's outgoing edges. Anything other than `{}`, `{Uncond}`
/// or `{True, False}` is unsupported.
pub fn terminator(cfg: &ControlFlowGraph, block: NodeIndex) -> Result<Terminator> {
    let mut on_true = None;
    let mut on_false = None;
    let mut uncond = None;
    let mut count = 0usize;

    for e in cfg.edges_directed(block, Direction::Outgoing) {
        count += 1;
        match e.weight() {
            EdgeKind::True if on_true.is_none() => on_true = Some(e.target()),
            EdgeKind::False if on_false.is_none() => on_false = Some(e.target()),
            EdgeKind::Uncond if uncond.is_none() => uncond = Some(e.target()),
            _ => {
                return Err(LiftError::UnsupportedTerminator {
                    block: cfg[block].name.clone(),
                })
            }
        }
    }

    match (count, on_true, on_false, uncond) {
        (0, ..) => Ok(Terminator::Ret),
        (1, None, None, Some(t)) => Ok(Terminator::Jmp(t)),
        (2, Some(t), Some(f), None) => Ok(Terminator::Cond { on_true: t, on_false: f }),
        _ => Err(LiftError::UnsupportedTerminator {
            block: cfg[block].name.clone(),
        }),
    }
}

/// Materialize the graph for a parsed function. Blocks are added in textual
/// order, so the entry block is node 0. Switch terminators and dangling
/// target names are rejected here.
pub fn build_cfg(ast: &FunctionAst) -> Result<ControlFlowGraph> {
    let mut g: ControlFlowGraph = Graph::new();
    let mut by_name = HashMap::<&str, NodeIndex>::new();

    for (name, _) in &ast.blocks {
        if by_name.contains_key(name.as_str()) {
            return Err(LiftError::Parse(format!("duplicate block `{name}`")));
        }
        let idx = g.add_node(BasicBlock { name: name.clone() });
        by_name.insert(name, idx);
    }

    let resolve = |name: &str| -> Result<NodeIndex> {
        by_name
            .get(name)
            .copied()
            .ok_or_else(|| LiftError::Parse(format!("unknown branch target `{name}`")))
    };

    for (name, term) in &ast.blocks {
        let src = by_name[name.as_str()];
        match term {
            TerminatorAst::Br { on_true, on_false } => {
                let t = resolve(on_true)?;
                let f = resolve(on_false)?;
                g.add_edge(src, t, EdgeKind::True);
                g.add_edge(src, f, EdgeKind::False);
            }
            TerminatorAst::Jmp(target) => {
                let t = resolve(target)?;
                g.add_edge(src, t, EdgeKind::Uncond);
            }
            TerminatorAst::Ret => {}
            TerminatorAst::Switch(_) => {
                return Err(LiftError::UnsupportedTerminator { block: name.clone() });
            }
        }
    }
    Ok(g)
}

pub fn graph_to_dot(cfg: &ControlFlowGraph) -> String {
    use std::fmt::Write;
    let mut s = String::from("digraph CFG {\n");
    for idx in cfg.node_indices() {
        let _ = writeln!(s, "  {} [label=\"{}\"];", idx.index(), cfg[idx].name);
    }
    for e in cfg.edge_indices() {
        let (sidx, didx) = cfg.edge_endpoints(e).unwrap();
        let label = match cfg[e] {
            EdgeKind::True => "T",
            EdgeKind::False => "F",
            EdgeKind::Uncond => "",
        };
        let _ = writeln!(
            s,
            "  {} -> {} [label=\"{}\"];",
            sidx.index(),
            didx.index(),
            label
        );
    }
    s.push('}');
    s
}
