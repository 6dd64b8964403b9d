//! The value register allocator.
//!
//! ALU results live in a small pool of value registers from the bundle that produces them until
//! their last reader. This pass allocates those registers with a linear scan over each block's
//! sequence, before scheduling. When the pool is exhausted the live value whose last use is
//! farthest away is spilled to a virtual register of the physical register file.
//!
//! Reusing a register adds [DepKind::VRegWriteAfterRead] edges from every reader of the register's
//! previous value to its new owner, which keeps the scheduler from reordering the two. Some readers
//! are issued in another node's bundle (a slotless node in its consumer's, a store's value
//! producer in the store's): such edges are attached to that node instead, its "anchor".

use super::{
    CompilationError,
    node::{BlockIdx, DepKind, Loc, NodeIdx, NodeKind, Prog},
    op::{Op, OpKind},
};
use index_vec::IndexVec;

/// Is `idx` an ALU node whose only successor is a store it must be issued with?
pub(crate) fn is_store_feed(prog: &Prog, idx: NodeIdx) -> bool {
    let node = prog.node(idx);
    node.op.kind() == OpKind::Alu
        && node.succs.len() == 1
        && node
            .data_succs()
            .all(|x| prog.node(x).op.kind() == OpKind::Store)
}

/// Return the node in whose bundle `idx` is issued.
pub(crate) fn anchor(prog: &Prog, mut idx: NodeIdx) -> NodeIdx {
    loop {
        let node = prog.node(idx);
        let next = if node.op.is_slotless() || is_store_feed(prog, idx) {
            node.data_succs().next()
        } else {
            None
        };
        match next {
            Some(x) => idx = x,
            None => return idx,
        }
    }
}

/// Does `idx` need a value register? Loads are read in their own bundle, slotless nodes alias
/// their operand, and a store's value producer is read by the store in its own bundle.
pub(crate) fn needs_reg(prog: &Prog, idx: NodeIdx) -> bool {
    let node = prog.node(idx);
    node.op.is_alu_slotted() && node.data_succs().next().is_some() && !is_store_feed(prog, idx)
}

/// The anchors of `idx`'s readers, without duplicates.
fn anchored_readers(prog: &Prog, idx: NodeIdx) -> Vec<NodeIdx> {
    let mut readers = Vec::new();
    for x in prog.node(idx).data_succs() {
        let a = anchor(prog, x);
        if !readers.contains(&a) {
            readers.push(a);
        }
    }
    readers
}

/// Allocate value registers for every block of `prog`, returning the number of values spilled.
pub(super) fn alloc(prog: &mut Prog, num_regs: usize) -> Result<usize, CompilationError> {
    if num_regs == 0 || num_regs > usize::from(u8::MAX) + 1 {
        return Err(CompilationError::LimitExceeded(format!(
            "{num_regs} value registers cannot be allocated"
        )));
    }
    let mut spills = 0;
    for bidx in prog.blocks.indices() {
        cluster(prog, bidx);
        spills += BlockAlloc::new(prog, bidx, num_regs).run()?;
    }
    Ok(spills)
}

/// Move every node issued in another node's bundle to immediately before that node, so that
/// anchors never come later in the sequence than the readers they stand for.
fn cluster(prog: &mut Prog, bidx: BlockIdx) {
    let seq = prog.blocks[bidx].nodes.clone();
    for idx in seq.into_iter().rev() {
        let node = prog.node(idx);
        if !(node.op.is_slotless() || is_store_feed(prog, idx)) {
            continue;
        }
        let Some(succ) = node.data_succs().next() else {
            continue;
        };
        let nodes = &mut prog.blocks[bidx].nodes;
        if let Some(from) = nodes.iter().position(|x| *x == idx) {
            nodes.remove(from);
            let to = nodes.iter().position(|x| *x == succ).unwrap_or(nodes.len());
            nodes.insert(to, idx);
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Active {
    node: NodeIdx,
    /// The anchor of the last reader of `node`.
    last: NodeIdx,
}

struct BlockAlloc<'a> {
    prog: &'a mut Prog,
    bidx: BlockIdx,
    regs: Vec<Option<Active>>,
    /// For each free register, the anchored readers of its previous owner.
    readers: Vec<Vec<NodeIdx>>,
    /// The register to start searching from.
    next: usize,
    pos: IndexVec<NodeIdx, Option<usize>>,
}

impl<'a> BlockAlloc<'a> {
    fn new(prog: &'a mut Prog, bidx: BlockIdx, num_regs: usize) -> Self {
        let pos = prog.seq_positions(bidx);
        Self {
            prog,
            bidx,
            regs: vec![None; num_regs],
            readers: vec![Vec::new(); num_regs],
            next: 0,
            pos,
        }
    }

    fn pos(&self, idx: NodeIdx) -> usize {
        self.pos.get(idx).copied().flatten().unwrap_or(usize::MAX)
    }

    fn last_use(&self, idx: NodeIdx) -> NodeIdx {
        self.prog
            .node(idx)
            .data_succs()
            .map(|x| anchor(self.prog, x))
            .max_by_key(|x| self.pos(*x))
            .unwrap_or(idx)
    }

    fn run(mut self) -> Result<usize, CompilationError> {
        let mut spills = 0;
        let mut i = 0;
        while i < self.prog.blocks[self.bidx].nodes.len() {
            let idx = self.prog.blocks[self.bidx].nodes[i];
            for r in 0..self.regs.len() {
                if let Some(a) = self.regs[r].filter(|a| a.last == idx) {
                    self.regs[r] = None;
                    self.readers[r] = anchored_readers(self.prog, a.node);
                }
            }

            if needs_reg(self.prog, idx) {
                let n = self.regs.len();
                let r = match (0..n)
                    .map(|x| (self.next + x) % n)
                    .find(|x| self.regs[*x].is_none())
                {
                    Some(r) => r,
                    None => {
                        spills += 1;
                        self.spill_farthest(idx)?
                    }
                };
                self.next = (r + 1) % n;
                for x in std::mem::take(&mut self.readers[r]) {
                    if x != idx {
                        self.prog.add_dep(x, idx, DepKind::VRegWriteAfterRead);
                    }
                }
                self.prog.node_mut(idx).value_reg = Some(u8::try_from(r).map_err(|_| {
                    CompilationError::LimitExceeded("Value register out of range".into())
                })?);
                self.regs[r] = Some(Active {
                    node: idx,
                    last: self.last_use(idx),
                });
            }
            i = self.pos(idx) + 1;
        }
        Ok(spills)
    }

    /// Free a register for `cur` by spilling the active value read farthest in the future,
    /// returning the freed register.
    fn spill_farthest(&mut self, cur: NodeIdx) -> Result<usize, CompilationError> {
        let Some((r, victim)) = self
            .regs
            .iter()
            .enumerate()
            .filter_map(|(r, a)| a.map(|a| (r, a)))
            .max_by_key(|(_, a)| self.pos(a.last))
            .map(|(r, a)| (r, a.node))
        else {
            return Err(CompilationError::InternalError(
                "No value register to spill".into(),
            ));
        };
        self.regs[r] = None;

        let cur_pos = self.pos(cur);
        let later = self
            .prog
            .node(victim)
            .data_succs()
            .filter(|x| self.pos(anchor(self.prog, *x)) > cur_pos)
            .collect::<Vec<_>>();

        let vreg = self.prog.new_vreg()?;
        let mov = self
            .prog
            .insert_after(victim, Op::Mov, NodeKind::alu(&[victim]))?;
        let store = self.prog.insert_after(
            mov,
            Op::StoreReg,
            NodeKind::Store {
                loc: Loc::Virtual(vreg),
                value: mov,
                offset: None,
            },
        )?;
        for x in later {
            let ld = self.prog.insert_before(
                x,
                Op::LoadReg,
                NodeKind::Load {
                    loc: Loc::Virtual(vreg),
                    offset: false,
                },
            )?;
            self.prog.replace_child(x, victim, ld)?;
            self.prog.add_dep(store, ld, DepKind::ReadAfterWrite);
        }

        self.pos = self.prog.seq_positions(self.bidx);
        self.readers[r] = anchored_readers(self.prog, victim);
        Ok(r)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::{
        lower::lower,
        node::test::{assert_mirrored, fixed},
    };

    /// Check that no two values sharing a register are live at the same time.
    fn assert_disjoint(prog: &Prog) {
        for bidx in prog.blocks.indices() {
            let pos = prog.seq_positions(bidx);
            let mut live = Vec::new();
            for x in &prog.blocks[bidx].nodes {
                let node = prog.node(*x);
                if let Some(r) = node.value_reg {
                    let end = node
                        .data_succs()
                        .map(|y| pos[anchor(prog, y)].unwrap())
                        .max()
                        .unwrap();
                    live.push((r, pos[*x].unwrap(), end));
                } else {
                    assert!(!needs_reg(prog, *x), "%{} has no register", x.index());
                }
            }
            for (i, (r0, s0, e0)) in live.iter().enumerate() {
                for (r1, s1, e1) in &live[i + 1..] {
                    if r0 == r1 {
                        assert!(e0 <= s1 || e1 <= s0);
                    }
                }
            }
        }
    }

    #[test]
    fn round_robin() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let x = prog.push_alu(b, Op::Floor, &[a]).unwrap();
        let y = prog.push_alu(b, Op::Floor, &[x]).unwrap();
        let z = prog.push_alu(b, Op::Floor, &[y]).unwrap();
        prog.push_store(b, Op::StoreVarying, fixed(0, 0), z).unwrap();
        lower(&mut prog).unwrap();
        assert_eq!(alloc(&mut prog, 4).unwrap(), 0);
        assert_eq!(
            [x, y, z].map(|n| prog.node(n).value_reg),
            [Some(0), Some(1), None]
        );
        // `y` takes over no register, so nothing has to be ordered.
        assert!(
            prog.iter_nodes()
                .all(|(_, n)| n.succs.values().all(|k| *k != DepKind::VRegWriteAfterRead))
        );
        assert_disjoint(&prog);
    }

    #[test]
    fn reuse_orders_readers() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let x = prog.push_alu(b, Op::Floor, &[a]).unwrap();
        let y = prog.push_alu(b, Op::Sign, &[x]).unwrap();
        let u = prog.push_alu(b, Op::Add, &[x, a]).unwrap();
        let z = prog.push_alu(b, Op::Add, &[y, u]).unwrap();
        prog.push_store(b, Op::StoreVarying, fixed(0, 0), z).unwrap();
        lower(&mut prog).unwrap();
        // `y` and `u` are both read by `z`, so each evicts its predecessor.
        assert_eq!(alloc(&mut prog, 1).unwrap(), 2);
        assert_eq!(
            [x, y, u, z].map(|n| prog.node(n).value_reg),
            [Some(0), Some(0), Some(0), None]
        );
        assert_disjoint(&prog);
        assert_mirrored(&prog);
    }

    #[test]
    fn spill_one_of_three() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let l0 = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let a = prog.push_alu(b, Op::Floor, &[l0]).unwrap();
        let l1 = prog.push_load(b, Op::LoadAttribute, fixed(1, 0)).unwrap();
        let x = prog.push_alu(b, Op::Floor, &[l1]).unwrap();
        let c = prog.push_alu(b, Op::Floor, &[x]).unwrap();
        let e = prog.push_alu(b, Op::Add, &[a, c]).unwrap();
        let st = prog.push_store(b, Op::StoreVarying, fixed(0, 0), e).unwrap();
        lower(&mut prog).unwrap();
        assert_eq!(alloc(&mut prog, 1).unwrap(), 1);
        assert_eq!(
            [a, x, c, e].map(|n| prog.node(n).value_reg),
            [Some(0), Some(0), Some(0), None]
        );
        let stores = prog
            .iter_nodes()
            .filter(|(_, n)| n.op == Op::StoreReg)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        let loads = prog
            .iter_nodes()
            .filter(|(_, n)| n.op == Op::LoadReg)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        assert_eq!((stores.len(), loads.len()), (1, 1));
        assert_eq!(
            prog.node(stores[0]).succs.get(&loads[0]),
            Some(&DepKind::ReadAfterWrite)
        );
        // The spill store has read `a` before `x` overwrites its register.
        assert_eq!(
            prog.node(stores[0]).succs.get(&x),
            Some(&DepKind::VRegWriteAfterRead)
        );
        assert_eq!(
            prog.node(e).data_preds().collect::<Vec<_>>(),
            vec![c, loads[0]]
        );
        assert!(prog.node(st).preds.contains_key(&e));
        assert_disjoint(&prog);
        assert_mirrored(&prog);
    }

    #[test]
    fn copy_anchor() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let x = prog.push_alu(b, Op::Floor, &[a]).unwrap();
        let k = prog.push_alu(b, Op::Copy, &[x]).unwrap();
        let y = prog.push_alu(b, Op::Floor, &[a]).unwrap();
        let z = prog.push_alu(b, Op::Add, &[k, y]).unwrap();
        let st = prog.push_store(b, Op::StoreVarying, fixed(0, 0), z).unwrap();
        lower(&mut prog).unwrap();
        alloc(&mut prog, 2).unwrap();
        // The copy is issued with `z`, which is issued with the store.
        assert_eq!(anchor(&prog, k), st);
        // The copy is moved next to its consumer.
        let seq = &prog.blocks[b].nodes;
        let kp = seq.iter().position(|n| *n == k).unwrap();
        assert_eq!(seq[kp + 1], z);
        assert_eq!(prog.node(x).value_reg, Some(0));
        assert_eq!(prog.node(y).value_reg, Some(1));
        assert_disjoint(&prog);
    }
}
