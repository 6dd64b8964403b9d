//! Structural checks over a [Prog].
//!
//! [check_well_formed] is run on input programs: everything the later passes assume about the
//! shape of the DAG is checked here, so that they can treat a violation as an internal error.
//! [check_schedule] checks the bundles a program was scheduled into against every placement and
//! distance rule.

use super::{
    CompilationError,
    node::{BlockIdx, Loc, NodeIdx, NodeKind, Prog},
    op::{File, Op, OpKind, Port},
    sched::{max_dist, min_dist},
};
use index_vec::IndexVec;
use vob::Vob;

/// The number of sources an ALU operation takes.
fn arity(op: Op) -> usize {
    match op {
        Op::Mul | Op::Add | Op::Sub | Op::Ge | Op::Lt | Op::Min | Op::Max => 2,
        Op::Select | Op::Complex1 => 3,
        _ => 1,
    }
}

fn malformed(idx: NodeIdx, msg: &str) -> CompilationError {
    CompilationError::Malformed(format!("%{}: {msg}", idx.index()))
}

/// Check that `prog` is a well-formed input program.
pub(crate) fn check_well_formed(prog: &Prog) -> Result<(), CompilationError> {
    let mut seen = Vob::from_elem(false, prog.nodes.len());
    for (bidx, block) in prog.blocks.iter_enumerated() {
        for x in &block.nodes {
            match prog.try_node(*x) {
                Some(n) if n.block == bidx && seen.get(x.index()) == Some(false) => {
                    seen.set(x.index(), true)
                }
                _ => {
                    return Err(malformed(*x, "is not sequenced exactly once in its block"));
                }
            };
        }
    }

    for (idx, node) in prog.iter_nodes() {
        if seen.get(idx.index()) != Some(true) {
            return Err(malformed(idx, "is not sequenced"));
        }
        check_edges(prog, idx)?;
        check_payload(prog, idx)?;
        if node.op.is_slotless() && (node.succs.len() != 1 || node.data_succs().count() != 1) {
            return Err(malformed(idx, "must have exactly one successor"));
        }
    }

    for (bidx, block) in prog.blocks.iter_enumerated() {
        if block
            .nodes
            .iter()
            .filter(|x| prog.node(**x).op.kind() == OpKind::Branch)
            .count()
            > 1
        {
            return Err(CompilationError::Malformed(format!(
                "block{} has more than one branch",
                bidx.index()
            )));
        }
        check_acyclic(prog, bidx)?;
    }
    Ok(())
}

fn check_edges(prog: &Prog, idx: NodeIdx) -> Result<(), CompilationError> {
    let node = prog.node(idx);
    for (x, k) in &node.succs {
        let Some(s) = prog.try_node(*x) else {
            return Err(malformed(idx, &format!("successor %{} does not exist", x.index())));
        };
        if s.preds.get(&idx) != Some(k) {
            return Err(malformed(idx, &format!("edge to %{} is asymmetric", x.index())));
        }
        if s.block != node.block {
            return Err(malformed(idx, &format!("edge to %{} crosses blocks", x.index())));
        }
    }
    for (x, k) in &node.preds {
        let Some(p) = prog.try_node(*x) else {
            return Err(malformed(idx, &format!("predecessor %{} does not exist", x.index())));
        };
        if p.succs.get(&idx) != Some(k) {
            return Err(malformed(idx, &format!("edge from %{} is asymmetric", x.index())));
        }
    }

    // Data edges and the operands the payload names must agree.
    let children = node.kind.children();
    for (x, _) in &children {
        if node.preds.get(x).is_none_or(|y| !y.is_data()) {
            return Err(malformed(idx, &format!("operand %{} has no data edge", x.index())));
        }
    }
    for x in node.data_preds() {
        if !children.iter().any(|(y, _)| *y == x) {
            return Err(malformed(idx, &format!("data edge from %{} is not an operand", x.index())));
        }
    }
    Ok(())
}

fn check_payload(prog: &Prog, idx: NodeIdx) -> Result<(), CompilationError> {
    let node = prog.node(idx);
    let info = node.op.info();
    if node.op.kind() != node.kind.op_kind() {
        return Err(malformed(idx, &format!("payload does not match {}", node.op)));
    }
    match &node.kind {
        NodeKind::Alu { srcs, dest_neg } => {
            if srcs.len() != arity(node.op) {
                return Err(malformed(
                    idx,
                    &format!("{} takes {} operands", node.op, arity(node.op)),
                ));
            }
            if *dest_neg && !info.dest_neg {
                return Err(malformed(idx, "cannot negate its result"));
            }
            if srcs.iter().enumerate().any(|(i, x)| x.neg && !info.src_neg[i]) {
                return Err(malformed(idx, "cannot negate that operand"));
            }
        }
        NodeKind::Const { .. } => (),
        NodeKind::Load { loc, offset } => {
            check_loc(prog, idx, *loc, node.op.file())?;
            if *offset && !matches!(node.op.file(), Some(File::Uniform | File::Temp)) {
                return Err(malformed(idx, "cannot be indexed"));
            }
        }
        NodeKind::Store { loc, offset, .. } => {
            check_loc(prog, idx, *loc, node.op.file())?;
            if offset.is_some() && node.op != Op::StoreTemp {
                return Err(malformed(idx, "cannot be indexed"));
            }
        }
        NodeKind::Branch { cond } => {
            if cond.is_some() != (node.op == Op::BranchCond) {
                return Err(malformed(idx, "has the wrong number of operands"));
            }
        }
    }
    Ok(())
}

fn check_loc(
    prog: &Prog,
    idx: NodeIdx,
    loc: Loc,
    file: Option<File>,
) -> Result<(), CompilationError> {
    match loc {
        Loc::Fixed { component, .. } if component > 3 => {
            Err(malformed(idx, &format!("component {component} is out of range")))
        }
        Loc::Fixed { .. } => Ok(()),
        Loc::Virtual(v) => {
            if file != Some(File::Reg) {
                Err(malformed(idx, "only registers can be virtual"))
            } else if prog.vregs.get(v).is_none() {
                Err(malformed(idx, &format!("v{} does not exist", v.index())))
            } else {
                Ok(())
            }
        }
    }
}

/// Check that the edges of `bidx` form no cycle.
fn check_acyclic(prog: &Prog, bidx: BlockIdx) -> Result<(), CompilationError> {
    let nodes = &prog.blocks[bidx].nodes;
    let mut indegree: IndexVec<NodeIdx, usize> =
        IndexVec::from_vec(vec![0; prog.nodes.len()]);
    for x in nodes {
        indegree[*x] = prog.node(*x).preds.len();
    }
    let mut done = Vob::from_elem(false, prog.nodes.len());
    let mut stack = nodes
        .iter()
        .copied()
        .filter(|x| indegree[*x] == 0)
        .collect::<Vec<_>>();
    let mut count = 0;
    while let Some(x) = stack.pop() {
        done.set(x.index(), true);
        count += 1;
        for s in prog.node(x).succs.keys() {
            indegree[*s] -= 1;
            if indegree[*s] == 0 {
                stack.push(*s);
            }
        }
    }
    if count != nodes.len() {
        let x = nodes
            .iter()
            .find(|x| done.get(x.index()) == Some(false))
            .copied()
            .unwrap_or_else(|| NodeIdx::new(0));
        return Err(CompilationError::Malformed(format!(
            "block{} contains a cycle through %{}",
            bidx.index(),
            x.index()
        )));
    }
    Ok(())
}

/// Check that every operation in `prog` can be scheduled, i.e. that lowering removed every
/// operation the hardware has no encoding for.
pub(crate) fn check_supported(prog: &Prog) -> Result<(), CompilationError> {
    for (idx, node) in prog.iter_nodes() {
        if node.op.latency().is_none() {
            return Err(CompilationError::General(format!(
                "%{}: {} is not supported",
                idx.index(),
                node.op
            )));
        }
    }
    Ok(())
}

fn illegal(msg: String) -> CompilationError {
    CompilationError::InternalError(msg)
}

/// The address a load port or store pair is bound to. Every user of a port in a bundle must agree
/// on it.
#[derive(Debug, PartialEq)]
struct Binding {
    file: Option<File>,
    loc: Loc,
    offset: Option<Option<NodeIdx>>,
}

/// Check that every block of `prog` is scheduled legally.
pub(crate) fn check_schedule(prog: &Prog) -> Result<(), CompilationError> {
    for bidx in prog.blocks.indices() {
        check_bundles(prog, bidx)?;
        check_distances(prog, bidx)?;
    }
    Ok(())
}

fn check_bundles(prog: &Prog, bidx: BlockIdx) -> Result<(), CompilationError> {
    let mut placed = Vob::from_elem(false, prog.nodes.len());
    for (i, instr) in prog.instrs(bidx).iter().enumerate() {
        let mut loads: [Option<Binding>; 3] = [None, None, None];
        let mut stores: [Option<Binding>; 2] = [None, None];
        for (slot, x) in instr.iter() {
            let node = prog
                .try_node(x)
                .ok_or_else(|| illegal(format!("[{i}] {slot}: %{} is deleted", x.index())))?;
            if node.block != bidx
                || node.sched.instr != Some(i)
                || node.sched.slot != Some(slot)
                || !node.op.info().slots.contains(&slot)
            {
                return Err(illegal(format!(
                    "[{i}] {slot}: %{} is misplaced",
                    x.index()
                )));
            }
            if placed.get(x.index()) == Some(true) {
                return Err(illegal(format!("%{} is placed twice", x.index())));
            }
            placed.set(x.index(), true);

            let Some((port, component)) = slot.port() else {
                continue;
            };
            let (loc, offset) = match node.kind {
                NodeKind::Load { loc, offset } => (loc, if offset { Some(None) } else { None }),
                NodeKind::Store { loc, offset, .. } => (loc, offset.map(Some)),
                _ => return Err(illegal(format!("%{} cannot use {slot}", x.index()))),
            };
            // Components of one address share a binding.
            let (loc, actual) = match loc {
                Loc::Fixed { index, component: c } => (Loc::Fixed { index, component: 0 }, Some(c)),
                Loc::Virtual(v) => (loc, prog.vregs[v].component),
            };
            if actual != Some(component) {
                return Err(illegal(format!(
                    "[{i}] {slot}: %{} uses the wrong component",
                    x.index()
                )));
            }
            let binding = Binding {
                file: node.op.file(),
                loc,
                offset,
            };
            let entry = match port {
                Port::Reg0 => &mut loads[0],
                Port::Reg1 => &mut loads[1],
                Port::Mem => &mut loads[2],
                Port::Store => &mut stores[usize::from(component / 2)],
            };
            match entry {
                Some(b) if *b != binding => {
                    return Err(illegal(format!(
                        "[{i}] {slot}: %{} conflicts with the port's address",
                        x.index()
                    )));
                }
                Some(_) => (),
                None => *entry = Some(binding),
            }
        }
    }

    for x in &prog.blocks[bidx].nodes {
        let node = prog.node(*x);
        let ok = if node.op.is_slotless() {
            node.sched.instr.is_some() && node.sched.slot.is_none()
        } else {
            placed.get(x.index()) == Some(true)
        };
        if !ok {
            return Err(illegal(format!("%{} is not scheduled", x.index())));
        }
    }
    Ok(())
}

fn check_distances(prog: &Prog, bidx: BlockIdx) -> Result<(), CompilationError> {
    for x in &prog.blocks[bidx].nodes {
        let node = prog.node(*x);
        let Some(si) = node.sched.instr else {
            return Err(illegal(format!("%{} is not scheduled", x.index())));
        };
        for (p, k) in &node.preds {
            let Some(pi) = prog.node(*p).sched.instr else {
                return Err(illegal(format!("%{} is not scheduled", p.index())));
            };
            let min = min_dist(prog, *p, *x, *k);
            if si < pi + min {
                return Err(illegal(format!(
                    "%{} -> %{} ({k:?}): {} bundles apart, at least {min} needed",
                    p.index(),
                    x.index(),
                    si.saturating_sub(pi)
                )));
            }
            if let Some(max) = max_dist(prog, *p, *x, *k) {
                if si - pi > max {
                    return Err(illegal(format!(
                        "%{} -> %{} ({k:?}): {} bundles apart, at most {max} allowed",
                        p.index(),
                        x.index(),
                        si - pi
                    )));
                }
            }
            if k.is_data()
                && node.op.kind() == OpKind::Store
                && !prog.node(*p).sched.slot.is_some_and(|s| s.is_alu())
            {
                return Err(illegal(format!(
                    "%{} stores %{}, which is not an ALU result",
                    x.index(),
                    p.index()
                )));
            }
        }
    }
    Ok(())
}
