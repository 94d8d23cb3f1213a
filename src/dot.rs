//! DOT export for the auxiliary block graph and the value graph.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::cfg::EdgeKind;
use crate::peg::{PegFunction, PegNodeId, PegNodeKind};

/// Block-level view: the auxiliary graph with its redirected edges.
pub fn apeg_to_dot(func: &PegFunction) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "digraph \"pegbbs.{}\" {{", func.name());
    for block in func.blocks() {
        let _ = writeln!(
            s,
            "  n{} [label=\"{}\",fontname=menlo];",
            block.0,
            func.node(block).name
        );
    }
    for block in func.blocks() {
        for &(succ, kind) in &func.block(block).succs {
            let label = match kind {
                EdgeKind::True => "T",
                EdgeKind::False => "F",
                EdgeKind::Uncond => "",
            };
            let _ = writeln!(
                s,
                "  n{} -> n{} [label=\"{}\",splines=true,color=\"#707070\"];",
                block.0, succ.0, label
            );
        }
    }
    s.push('}');
    s
}

/// Value-level view: every node with its operand edges. Condition nodes
/// exist for every block; the ones nothing selects on are noise and stay
/// hidden unless `draw_all_nodes` is set.
pub fn peg_to_dot(func: &PegFunction, draw_all_nodes: bool) -> String {
    let mut users = BTreeMap::<PegNodeId, usize>::new();
    for (id, _) in func.nodes() {
        for op in func.operands(id) {
            *users.entry(op).or_default() += 1;
        }
    }
    let hidden = |id: PegNodeId| -> bool {
        matches!(func.node(id).kind, PegNodeKind::Condition { .. })
            && users.get(&id).copied().unwrap_or(0) == 0
            && !draw_all_nodes
    };

    let mut s = String::new();
    let _ = writeln!(s, "digraph \"peg.{}\" {{", func.name());
    for (id, node) in func.nodes() {
        if hidden(id) {
            continue;
        }
        let mut opts = String::from("fontname=menlo,color=\"#707070\"");
        match node.kind {
            PegNodeKind::Condition { .. } => opts.push_str(",shape=ellipse"),
            PegNodeKind::Theta { .. } => opts.push_str(",shape=doublecircle"),
            _ => {}
        }
        let _ = writeln!(s, "  n{} [label=\"{}\",{}];", id.0, node.name, opts);
    }
    for (id, node) in func.nodes() {
        if hidden(id) {
            continue;
        }
        // Short leash for condition edges, open arrowheads elsewhere.
        let arrow = if matches!(node.kind, PegNodeKind::Condition { .. }) {
            "arrowhead=none,weight=2"
        } else {
            "arrowhead=empty"
        };
        for op in func.operands(id) {
            if hidden(op) {
                continue;
            }
            let _ = writeln!(
                s,
                "  n{} -> n{} [splines=true,color=\"#707070\",{}];",
                id.0, op.0, arrow
            );
        }
    }
    s.push('}');
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use petgraph::graph::NodeIndex;

    fn sample() -> PegFunction {
        let mut f = PegFunction::new("s");
        let a = f.add_block("a", NodeIndex::new(0), None, true, false, None);
        let b = f.add_block("b", NodeIndex::new(1), None, false, false, None);
        f.add_edge(a, b, EdgeKind::Uncond);
        let used = f.add_condition(a);
        let _unused = f.add_condition(b);
        let phi = f.add_phi(used, a, b);
        f.set_child(b, phi);
        f
    }

    #[test]
    fn unused_conditions_are_hidden_by_default() {
        let f = sample();
        let dot = peg_to_dot(&f, false);
        assert!(dot.contains("cond.a"));
        assert!(!dot.contains("cond.b"));
        assert!(dot.contains("shape=ellipse"));
    }

    #[test]
    fn draw_all_nodes_disables_the_filter() {
        let f = sample();
        let dot = peg_to_dot(&f, true);
        assert!(dot.contains("cond.b"));
    }

    #[test]
    fn apeg_dot_lists_blocks_and_edges() {
        let f = sample();
        let dot = apeg_to_dot(&f);
        assert!(dot.starts_with("digraph \"pegbbs.s\""));
        assert!(dot.contains("label=\"a\""));
        assert!(dot.contains("n0 -> n1"));
    }
}
