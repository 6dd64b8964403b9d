//! The physical register allocator.
//!
//! Spilling creates virtual registers in the physical register file. Once every block is
//! scheduled, each virtual register is live from its first store to its last load and has a
//! component fixed by the scheduler. This pass maps virtual registers to register indices with a
//! linear scan over those intervals, sharing an index between virtual registers using different
//! components, and then rewrites every virtual location to a fixed one.
//!
//! Register indices which the input program addresses directly are never handed out.

use super::{
    CompilationError,
    node::{Loc, NodeKind, Prog, VRegIdx},
    op::{Op, Slot},
};
use index_vec::IndexVec;
use strum::EnumCount;
use vob::Vob;

#[derive(Clone, Copy, Debug)]
struct Interval {
    vreg: VRegIdx,
    component: u8,
    start: usize,
    end: usize,
}

/// Assign a register index to every virtual register of `prog` and rewrite all virtual locations.
/// Returns the number of register indices used.
pub(super) fn alloc(prog: &mut Prog, phys_regs: u32) -> Result<usize, CompilationError> {
    let phys_regs = usize::try_from(phys_regs)
        .map_err(|_| CompilationError::LimitExceeded("Too many physical registers".into()))?;
    let intervals = intervals(prog)?;

    // `free` has a bit per (index, component), set when that component is free.
    let mut free = Vob::from_elem(true, phys_regs * 4);
    for (_, node) in prog.iter_nodes() {
        if !matches!(node.op, Op::LoadReg | Op::StoreReg) {
            continue;
        }
        if let Some(Loc::Fixed { index, .. }) = node.kind.loc() {
            if let Ok(i) = usize::try_from(index) {
                for c in 0..4 {
                    if i < phys_regs {
                        free.set(i * 4 + c, false);
                    }
                }
            }
        }
    }

    let mut assigned: IndexVec<VRegIdx, Option<u32>> =
        IndexVec::from_vec(vec![None; prog.vregs.len()]);
    let mut active: Vec<(usize, usize)> = Vec::new();
    let mut used = Vob::from_elem(false, phys_regs);
    for iv in intervals {
        active.retain(|(end, bit)| {
            if *end <= iv.start {
                free.set(*bit, true);
                false
            } else {
                true
            }
        });
        let c = usize::from(iv.component);
        let Some(i) = (0..phys_regs).find(|i| free.get(i * 4 + c) == Some(true)) else {
            return Err(CompilationError::ResourceExhausted(format!(
                "No physical register for v{}",
                iv.vreg.index()
            )));
        };
        free.set(i * 4 + c, false);
        used.set(i, true);
        active.push((iv.end, i * 4 + c));
        assigned[iv.vreg] = Some(
            u32::try_from(i)
                .map_err(|_| CompilationError::LimitExceeded("Register index too large".into()))?,
        );
    }

    let virt = prog
        .iter_nodes()
        .filter_map(|(i, n)| match n.kind.loc() {
            Some(Loc::Virtual(v)) => Some((i, v)),
            _ => None,
        })
        .collect::<Vec<_>>();
    for (idx, v) in virt {
        let (Some(index), Some(component)) = (assigned[v], prog.vregs[v].component) else {
            return Err(CompilationError::InternalError(format!(
                "v{} was never allocated",
                v.index()
            )));
        };
        prog.node_mut(idx)
            .kind
            .set_loc(Loc::Fixed { index, component });
    }
    Ok(used.iter_set_bits(..).count())
}

/// Compute the live interval of every accessed virtual register, sorted by start. Positions are
/// dense over the bundles of every block and the slots within each bundle.
fn intervals(prog: &Prog) -> Result<Vec<Interval>, CompilationError> {
    let mut bases = Vec::with_capacity(prog.blocks.len());
    let mut base = 0;
    for b in &prog.blocks {
        bases.push(base);
        base += b.instrs.len();
    }

    let mut bounds: IndexVec<VRegIdx, Option<(usize, usize)>> =
        IndexVec::from_vec(vec![None; prog.vregs.len()]);
    for (idx, node) in prog.iter_nodes() {
        let v = match node.kind {
            NodeKind::Load {
                loc: Loc::Virtual(v),
                ..
            }
            | NodeKind::Store {
                loc: Loc::Virtual(v),
                ..
            } => v,
            _ => continue,
        };
        let (Some(instr), Some(slot)) = (node.sched.instr, node.sched.slot) else {
            return Err(CompilationError::InternalError(format!(
                "%{} is not scheduled",
                idx.index()
            )));
        };
        let pos = (bases[node.block.index()] + instr) * Slot::COUNT + slot as usize;
        bounds[v] = Some(match bounds[v] {
            Some((s, e)) => (s.min(pos), e.max(pos)),
            None => (pos, pos),
        });
    }

    let mut intervals = Vec::new();
    for (vreg, b) in bounds.iter_enumerated() {
        let Some((start, end)) = *b else {
            continue;
        };
        let Some(component) = prog.vregs[vreg].component else {
            return Err(CompilationError::InternalError(format!(
                "v{} has no component",
                vreg.index()
            )));
        };
        intervals.push(Interval {
            vreg,
            component,
            start,
            end,
        });
    }
    intervals.sort_by_key(|x| (x.start, x.vreg));
    Ok(intervals)
}
