//! The list scheduler.
//!
//! Each block is scheduled independently and backwards: roots are placed first, and a node is
//! only considered once every one of its successors has been placed. While a block is being
//! scheduled bundle 0 is the *last* bundle of the block; the bundle sequence is reversed into
//! program order when the block is finalised.
//!
//! Every edge constrains how far apart (in bundles) its endpoints may be: the producer must be at
//! least [min_dist] and, for data edges, at most [max_dist] bundles before the consumer. When a
//! node cannot be placed such that every consumer is within reach, the graph is changed:
//!
//!   * a load is duplicated for the consumers it cannot reach;
//!   * an ALU value is forwarded through a `mov` copy if the distance can be bridged by a couple of
//!     copies;
//!   * otherwise the value is spilled: a `store_reg` to a fresh virtual register is placed
//!     alongside the producer and each unreachable consumer reads a `load_reg` instead. A load
//!     reaches the `store_reg` through a `mov` issued in its own bundle.
//!
//! The nodes such rewrites create are scheduled immediately through an explicit work stack which
//! takes priority over the ready list. A new node inherits the copy count of the node it replaces
//! and is one rewrite deeper, so chains of rewrites are bounded by `MAX_RETRIES` and `MAX_DEPTH`.

use super::{
    CompilationError,
    instr::Instr,
    node::{BlockIdx, DepKind, Loc, NodeIdx, NodeKind, Prog, VRegIdx},
    op::{Op, OpKind, Slot},
};
use crate::log::{Log, Verbosity};
use std::{cmp::Ordering, collections::BTreeSet};

/// How many bundles after issue an ALU result can still be read.
pub(crate) const ALU_MAX_DIST: usize = 2;
/// The most copies used to forward one value before spilling it instead.
const MAX_COPY_HOPS: usize = 2;
/// How many times a node may be retried through copies before it is spilled.
const MAX_RETRIES: u32 = 4;
/// The longest chain of rewrites allowed before a node is deemed impossible to place.
const MAX_DEPTH: u32 = 16;
/// The number of scheduling steps allowed for each node a block starts with.
const STEPS_PER_NODE: usize = 256;
/// The windows searched, in turn, for a bundle which can hold a spilled value and its store.
const SPILL_WINDOWS: [usize; 5] = [4, 8, 16, 32, 64];

/// The minimum number of bundles between `pred` and `succ` for an edge of kind `kind`.
pub(crate) fn min_dist(prog: &Prog, pred: NodeIdx, succ: NodeIdx, kind: DepKind) -> usize {
    let (p, s) = (prog.node(pred), prog.node(succ));
    match kind {
        DepKind::Input | DepKind::Offset => {
            if s.op.kind() == OpKind::Store {
                0
            } else {
                p.op.latency().map(|x| x as usize).unwrap_or(0)
            }
        }
        DepKind::ReadAfterWrite => match (p.op, s.op) {
            (Op::StoreTemp, Op::LoadTemp) => 4,
            (
                Op::StoreTempLoadOff0 | Op::StoreTempLoadOff1 | Op::StoreTempLoadOff2,
                Op::LoadUniform,
            ) => 4,
            (Op::StoreReg, Op::LoadReg) => 3,
            _ => 1,
        },
        DepKind::WriteAfterRead | DepKind::VRegWriteAfterRead => 0,
    }
}

/// The maximum number of bundles between `pred` and `succ` for an edge of kind `kind`, or `None`
/// if the edge imposes no maximum.
pub(crate) fn max_dist(prog: &Prog, pred: NodeIdx, succ: NodeIdx, kind: DepKind) -> Option<usize> {
    if !kind.is_data() {
        return None;
    }
    let (p, s) = (prog.node(pred), prog.node(succ));
    if s.op.kind() == OpKind::Store || p.op.kind() == OpKind::Load || p.op.is_slotless() {
        Some(0)
    } else {
        Some(ALU_MAX_DIST)
    }
}

/// Counts of the rewrites the scheduler made.
#[derive(Debug, Default)]
pub(super) struct SchedStats {
    pub copies: usize,
    pub spills: usize,
    pub dup_loads: usize,
}

/// Schedule every block of `prog`.
pub(super) fn schedule(prog: &mut Prog, log: &Log) -> Result<SchedStats, CompilationError> {
    schedule_with_retries(prog, log, MAX_RETRIES)
}

fn schedule_with_retries(
    prog: &mut Prog,
    log: &Log,
    max_retries: u32,
) -> Result<SchedStats, CompilationError> {
    let mut stats = SchedStats::default();
    for bidx in prog.blocks.indices() {
        Scheduler::new(prog, log, bidx, &mut stats, max_retries).run()?;
    }
    Ok(stats)
}

/// An entry in the ready list.
#[derive(Debug, Eq, PartialEq)]
struct Ready {
    first: bool,
    dist: u32,
    /// The order in which nodes became ready: every entry has a distinct `seq`.
    seq: u64,
    node: NodeIdx,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .first
            .cmp(&self.first)
            .then(other.dist.cmp(&self.dist))
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
enum Work {
    /// Try to place a node.
    Node(NodeIdx),
    /// Place a spilled value and its store in the same bundle. If the value is a `mov` of a
    /// spilled load, that load joins them.
    Spill {
        node: NodeIdx,
        store: NodeIdx,
        load: Option<NodeIdx>,
    },
}

struct Scheduler<'a> {
    prog: &'a mut Prog,
    log: &'a Log,
    bidx: BlockIdx,
    /// This block's bundles, last bundle first.
    instrs: Vec<Instr>,
    ready: BTreeSet<Ready>,
    work: Vec<Work>,
    seq: u64,
    stats: &'a mut SchedStats,
    max_retries: u32,
}

impl<'a> Scheduler<'a> {
    fn new(
        prog: &'a mut Prog,
        log: &'a Log,
        bidx: BlockIdx,
        stats: &'a mut SchedStats,
        max_retries: u32,
    ) -> Self {
        Self {
            prog,
            log,
            bidx,
            instrs: Vec::new(),
            ready: BTreeSet::new(),
            work: Vec::new(),
            seq: 0,
            stats,
            max_retries,
        }
    }

    fn run(mut self) -> Result<(), CompilationError> {
        self.compute_dists();
        let roots = self.prog.blocks[self.bidx]
            .nodes
            .iter()
            .copied()
            .filter(|x| self.prog.node(*x).is_root())
            .collect::<Vec<_>>();
        for x in roots {
            self.push_ready(x);
        }

        let limit = (self.prog.blocks[self.bidx].nodes.len() + 1) * STEPS_PER_NODE;
        for step in 0.. {
            if step > limit {
                return Err(CompilationError::InternalError(format!(
                    "block{} did not converge after {limit} scheduling steps",
                    self.bidx.index()
                )));
            }
            let work = match self.work.pop() {
                Some(x) => x,
                None => match self.ready.pop_first() {
                    Some(x) => Work::Node(x.node),
                    None => break,
                },
            };
            match work {
                Work::Node(x) => self.schedule_node(x)?,
                Work::Spill { node, store, load } => self.place_spill(node, store, load)?,
            }
        }

        if let Some(x) = self.prog.blocks[self.bidx]
            .nodes
            .iter()
            .find(|x| !self.prog.node(**x).sched.scheduled)
        {
            return Err(CompilationError::InternalError(format!(
                "%{} was never scheduled",
                x.index()
            )));
        }
        self.finalise();
        Ok(())
    }

    /// Reset every node's scheduling state and compute its priority: the longest path, in minimum
    /// distances, from a leaf.
    fn compute_dists(&mut self) {
        for x in self.prog.blocks[self.bidx].nodes.clone() {
            let dist = self
                .prog
                .node(x)
                .preds
                .iter()
                .map(|(p, k)| {
                    self.prog.node(*p).sched.dist + min_dist(self.prog, *p, x, *k) as u32
                })
                .max()
                .unwrap_or(0);
            let node = self.prog.node_mut(x);
            node.sched = Default::default();
            node.sched.dist = dist;
        }
    }

    fn push_ready(&mut self, idx: NodeIdx) {
        let node = self.prog.node(idx);
        self.ready.insert(Ready {
            first: node.op.info().schedule_first,
            dist: node.sched.dist,
            seq: self.seq,
            node: idx,
        });
        self.seq += 1;
    }

    fn ensure_instr(&mut self, i: usize) {
        while self.instrs.len() <= i {
            self.instrs.push(Instr::new());
        }
    }

    /// Return the range of bundles `idx` may be placed in as determined by its (already placed)
    /// successors, ignoring `skip`. The upper bound is `None` if no successor imposes one.
    fn bounds(
        &self,
        idx: NodeIdx,
        skip: Option<NodeIdx>,
    ) -> Result<(usize, Option<usize>), CompilationError> {
        let mut lo = 0;
        let mut hi: Option<usize> = None;
        for (s, k) in &self.prog.node(idx).succs {
            if Some(*s) == skip {
                continue;
            }
            let i = self.prog.node(*s).sched.instr.ok_or_else(|| {
                CompilationError::InternalError(format!(
                    "%{} is ready but its successor %{} is not placed",
                    idx.index(),
                    s.index()
                ))
            })?;
            lo = lo.max(i + min_dist(self.prog, idx, *s, *k));
            if let Some(m) = max_dist(self.prog, idx, *s, *k) {
                hi = Some(hi.map_or(i + m, |h| h.min(i + m)));
            }
        }
        Ok((lo, hi))
    }

    /// Record that `idx` has been placed in bundle `i` and make ready those predecessors whose
    /// successors are now all placed.
    fn place(&mut self, idx: NodeIdx, i: usize, slot: Option<Slot>) {
        let node = self.prog.node_mut(idx);
        node.sched.instr = Some(i);
        node.sched.slot = slot;
        node.sched.scheduled = true;
        if self.log.enabled(Verbosity::Sched) {
            let slot = slot.map(|x| x.to_string()).unwrap_or_else(|| "-".to_owned());
            self.log.log(
                Verbosity::Sched,
                &format!("place %{} in [{i}] {slot}", idx.index()),
            );
        }

        let preds = self.prog.node(idx).preds.keys().copied().collect::<Vec<_>>();
        for p in preds {
            let pred = self.prog.node(p);
            if pred.sched.scheduled || pred.sched.inserted {
                continue;
            }
            if pred
                .succs
                .keys()
                .all(|x| self.prog.node(*x).sched.scheduled)
            {
                self.push_ready(p);
            }
        }
    }

    fn schedule_node(&mut self, idx: NodeIdx) -> Result<(), CompilationError> {
        let node = self.prog.node(idx);
        if node.sched.scheduled {
            return Ok(());
        }

        if node.op.is_slotless() {
            // A slotless node is expressed by its consumer and shares its bundle.
            let i = node
                .data_succs()
                .next()
                .and_then(|x| self.prog.node(x).sched.instr)
                .ok_or_else(|| {
                    CompilationError::InternalError(format!(
                        "%{} has no placed consumer",
                        idx.index()
                    ))
                })?;
            self.place(idx, i, None);
            return Ok(());
        }

        let (lo, hi) = self.bounds(idx, None)?;
        let mut i = lo;
        let slot = loop {
            self.ensure_instr(i);
            let fresh = self.instrs[i].is_empty();
            if let Some(x) = self.instrs[i].try_place(self.prog, idx) {
                break x;
            }
            if fresh {
                return Err(CompilationError::InternalError(format!(
                    "%{} does not fit in an empty bundle",
                    idx.index()
                )));
            }
            i += 1;
        };
        if hi.is_none_or(|h| i <= h) {
            self.place(idx, i, Some(slot));
            return Ok(());
        }
        self.instrs[i].remove(self.prog, idx);
        self.defer(idx, i)
    }

    /// `idx` can be placed no earlier than bundle `i`, which some of its consumers cannot reach.
    fn defer(&mut self, idx: NodeIdx, i: usize) -> Result<(), CompilationError> {
        let mut deferred = Vec::new();
        for (s, k) in &self.prog.node(idx).succs {
            if let (Some(m), Some(si)) = (
                max_dist(self.prog, idx, *s, *k),
                self.prog.node(*s).sched.instr,
            ) {
                if si + m < i {
                    deferred.push((*s, si + m));
                }
            }
        }
        let Some(reach) = deferred.iter().map(|(_, x)| *x).min() else {
            return Err(CompilationError::InternalError(format!(
                "%{} deferred without an unreachable consumer",
                idx.index()
            )));
        };
        if let Some((s, _)) = deferred
            .iter()
            .find(|(s, _)| self.prog.node(*s).op.kind() == OpKind::Store)
        {
            return Err(CompilationError::InternalError(format!(
                "%{} cannot be issued with its store %{}",
                idx.index(),
                s.index()
            )));
        }
        let deferred = deferred.into_iter().map(|(s, _)| s).collect::<Vec<_>>();

        let node = self.prog.node(idx);
        if node.sched.depth >= MAX_DEPTH {
            return Err(CompilationError::ResourceExhausted(format!(
                "Unable to place %{}",
                idx.index()
            )));
        }
        let all = deferred.len() == node.data_succs().count();
        let retries = node.sched.retries;
        if node.op.kind() == OpKind::Load {
            if !all {
                return self.duplicate_load(idx, &deferred);
            }
            // The load is held back by an ordering constraint or by busy ports: forward its
            // value through a copy which inherits those constraints.
            if retries < self.max_retries {
                return self.copy(idx, &deferred, true);
            }
            // A register load spilled to another register would meet the same busy ports.
            if node.op == Op::LoadReg {
                return Err(CompilationError::ResourceExhausted(format!(
                    "Unable to place %{}",
                    idx.index()
                )));
            }
            return self.spill_load(idx, &deferred);
        }

        if retries >= self.max_retries || i - reach > MAX_COPY_HOPS * ALU_MAX_DIST {
            self.spill(idx, &deferred)
        } else {
            self.copy(idx, &deferred, false)
        }
    }

    /// Mark `new` as created by the scheduler in place of `like`, with `retries` copies already
    /// made along the way.
    fn mark_inserted(&mut self, new: NodeIdx, like: NodeIdx, retries: u32) {
        let like = &self.prog.node(like).sched;
        let (dist, depth) = (like.dist, like.depth + 1);
        let sched = &mut self.prog.node_mut(new).sched;
        sched.inserted = true;
        sched.dist = dist;
        sched.retries = retries;
        sched.depth = depth;
    }

    /// Forward `idx`'s value to `deferred` through a new `mov`.
    fn copy(
        &mut self,
        idx: NodeIdx,
        deferred: &[NodeIdx],
        inherit_order: bool,
    ) -> Result<(), CompilationError> {
        let retries = {
            let sched = &mut self.prog.node_mut(idx).sched;
            sched.retries += 1;
            sched.retries
        };
        let mov = self
            .prog
            .insert_after(idx, Op::Mov, NodeKind::alu(&[idx]))?;
        self.mark_inserted(mov, idx, retries);
        for x in deferred {
            self.prog.replace_child(*x, idx, mov)?;
        }
        if inherit_order {
            let order = self
                .prog
                .node(idx)
                .succs
                .iter()
                .filter(|(_, k)| !k.is_data())
                .map(|(s, k)| (*s, *k))
                .collect::<Vec<_>>();
            for (s, k) in order {
                self.prog.add_dep(mov, s, k);
            }
        }
        self.stats.copies += 1;
        self.log.log(
            Verbosity::Sched,
            &format!("copy %{} through %{}", idx.index(), mov.index()),
        );
        self.work.push(Work::Node(idx));
        self.work.push(Work::Node(mov));
        Ok(())
    }

    /// Give `deferred` their own copy of the load `idx`.
    fn duplicate_load(
        &mut self,
        idx: NodeIdx,
        deferred: &[NodeIdx],
    ) -> Result<(), CompilationError> {
        let node = self.prog.node(idx);
        let (op, kind, retries) = (node.op, node.kind.clone(), node.sched.retries);
        let order = node
            .preds
            .iter()
            .chain(node.succs.iter())
            .filter(|(_, k)| !k.is_data())
            .map(|(x, k)| (*x, *k, node.preds.contains_key(x)))
            .collect::<Vec<_>>();
        let dup = self.prog.insert_before(idx, op, kind)?;
        self.mark_inserted(dup, idx, retries);
        for (x, k, is_pred) in order {
            if is_pred {
                self.prog.add_dep(x, dup, k);
            } else {
                self.prog.add_dep(dup, x, k);
            }
        }
        for x in deferred {
            self.prog.replace_child(*x, idx, dup)?;
        }
        self.stats.dup_loads += 1;
        self.log.log(
            Verbosity::Sched,
            &format!("duplicate %{} as %{}", idx.index(), dup.index()),
        );
        self.work.push(Work::Node(idx));
        self.work.push(Work::Node(dup));
        Ok(())
    }

    /// Spill `idx` to a fresh virtual register, making `deferred` read it back.
    fn spill(&mut self, idx: NodeIdx, deferred: &[NodeIdx]) -> Result<(), CompilationError> {
        let vreg = self.prog.new_vreg()?;
        let store = self.prog.insert_after(
            idx,
            Op::StoreReg,
            NodeKind::Store {
                loc: Loc::Virtual(vreg),
                value: idx,
                offset: None,
            },
        )?;
        self.mark_inserted(store, idx, 0);
        self.stats.spills += 1;
        self.log.log(
            Verbosity::Sched,
            &format!("spill %{} to v{}", idx.index(), vreg.index()),
        );
        self.work.push(Work::Spill {
            node: idx,
            store,
            load: None,
        });
        self.push_spill_loads(idx, store, vreg, deferred)
    }

    /// Spill the load `idx`, which none of `deferred` (all its consumers) can read directly, to a
    /// fresh virtual register. A store can only take its value from an ALU slot, so the load is
    /// stored through a `mov`.
    fn spill_load(&mut self, idx: NodeIdx, deferred: &[NodeIdx]) -> Result<(), CompilationError> {
        let vreg = self.prog.new_vreg()?;
        let mov = self
            .prog
            .insert_after(idx, Op::Mov, NodeKind::alu(&[idx]))?;
        self.mark_inserted(mov, idx, 0);
        let store = self.prog.insert_after(
            mov,
            Op::StoreReg,
            NodeKind::Store {
                loc: Loc::Virtual(vreg),
                value: mov,
                offset: None,
            },
        )?;
        self.mark_inserted(store, idx, 0);
        self.stats.spills += 1;
        self.log.log(
            Verbosity::Sched,
            &format!(
                "spill %{} through %{} to v{}",
                idx.index(),
                mov.index(),
                vreg.index()
            ),
        );
        self.work.push(Work::Spill {
            node: mov,
            store,
            load: Some(idx),
        });
        self.push_spill_loads(idx, store, vreg, deferred)
    }

    /// Make each of `consumers` read `vreg` (written by `store`) instead of `idx`, scheduling the
    /// new loads before anything else.
    fn push_spill_loads(
        &mut self,
        idx: NodeIdx,
        store: NodeIdx,
        vreg: VRegIdx,
        consumers: &[NodeIdx],
    ) -> Result<(), CompilationError> {
        for x in consumers {
            let ld = self.prog.insert_before(
                *x,
                Op::LoadReg,
                NodeKind::Load {
                    loc: Loc::Virtual(vreg),
                    offset: false,
                },
            )?;
            self.mark_inserted(ld, idx, 0);
            self.prog.replace_child(*x, idx, ld)?;
            self.prog.add_dep(store, ld, DepKind::ReadAfterWrite);
            self.work.push(Work::Node(ld));
        }
        Ok(())
    }

    /// Place the spilled value `idx` and its `store` (and the spilled `load` `idx` copies, if
    /// any) in the same bundle.
    fn place_spill(
        &mut self,
        idx: NodeIdx,
        store: NodeIdx,
        load: Option<NodeIdx>,
    ) -> Result<(), CompilationError> {
        let (lo, mut hi) = self.bounds(idx, Some(store))?;
        let (store_lo, _) = self.bounds(store, None)?;
        let mut start = lo.max(store_lo);
        if let Some(ld) = load {
            let (ld_lo, ld_hi) = self.bounds(ld, Some(idx))?;
            start = start.max(ld_lo);
            if let Some(h) = ld_hi {
                hi = Some(hi.map_or(h, |x| x.min(h)));
            }
        }
        let mut from = start;
        for w in SPILL_WINDOWS {
            let to = hi.map_or(start + w, |h| (start + w).min(h + 1));
            for i in from..to {
                self.ensure_instr(i);
                if self.try_place_spill(i, idx, store, load) {
                    return Ok(());
                }
            }
            from = from.max(to);
        }

        // The remaining consumers bound the search too tightly: make them read the spill as well.
        let rest = self
            .prog
            .node(idx)
            .data_succs()
            .filter(|x| *x != store)
            .collect::<Vec<_>>();
        let vreg = match self.prog.node(store).kind.loc() {
            Some(Loc::Virtual(x)) => x,
            _ => {
                return Err(CompilationError::InternalError(format!(
                    "spill store %{} has no virtual register",
                    store.index()
                )));
            }
        };
        if rest.is_empty() {
            return Err(CompilationError::ResourceExhausted(format!(
                "No bundle can hold the spill of %{}",
                idx.index()
            )));
        }
        self.work.push(Work::Spill {
            node: idx,
            store,
            load,
        });
        self.push_spill_loads(idx, store, vreg, &rest)
    }

    /// Try to place `idx`, `store` and `load` together in bundle `i`, leaving the bundle untouched
    /// on failure.
    fn try_place_spill(
        &mut self,
        i: usize,
        idx: NodeIdx,
        store: NodeIdx,
        load: Option<NodeIdx>,
    ) -> bool {
        let instr = &mut self.instrs[i];
        let Some(store_slot) = instr.try_place(self.prog, store) else {
            return false;
        };
        let Some(slot) = instr.try_place(self.prog, idx) else {
            instr.remove(self.prog, store);
            return false;
        };
        let load_slot = match load {
            Some(ld) => match instr.try_place(self.prog, ld) {
                Some(x) => Some((ld, x)),
                None => {
                    instr.remove(self.prog, idx);
                    instr.remove(self.prog, store);
                    return false;
                }
            },
            None => None,
        };
        self.place(idx, i, Some(slot));
        self.place(store, i, Some(store_slot));
        if let Some((ld, x)) = load_slot {
            self.place(ld, i, Some(x));
        }
        true
    }

    /// Reverse the bundles into program order and hand them to the block.
    fn finalise(&mut self) {
        while self.instrs.last().is_some_and(|x| x.is_empty()) {
            self.instrs.pop();
        }
        let len = self.instrs.len();
        for x in self.prog.blocks[self.bidx].nodes.clone() {
            let sched = &mut self.prog.node_mut(x).sched;
            sched.instr = sched.instr.map(|i| len - 1 - i);
        }
        let mut instrs = std::mem::take(&mut self.instrs);
        instrs.reverse();
        self.prog.blocks[self.bidx].instrs = instrs;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::{
        lower::lower,
        node::test::{assert_mirrored, fixed},
        well_formed::check_schedule,
    };

    fn sched(prog: &mut Prog) -> SchedStats {
        sched_with(prog, MAX_RETRIES)
    }

    fn sched_with(prog: &mut Prog, max_retries: u32) -> SchedStats {
        let stats = schedule_with_retries(prog, &Log::disabled(), max_retries).unwrap();
        check_schedule(prog).unwrap();
        assert_mirrored(prog);
        stats
    }

    fn find_op(prog: &Prog, op: Op) -> NodeIdx {
        prog.iter_nodes()
            .find(|(_, x)| x.op == op)
            .map(|(i, _)| i)
            .unwrap()
    }

    fn instr_of(prog: &Prog, idx: NodeIdx) -> usize {
        prog.node(idx).sched.instr.unwrap()
    }

    #[test]
    fn alu_chain() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let x = prog.push_alu(b, Op::Floor, &[a]).unwrap();
        let y = prog.push_alu(b, Op::Floor, &[x]).unwrap();
        let z = prog.push_alu(b, Op::Floor, &[y]).unwrap();
        let stats = sched(&mut prog);
        assert_eq!(prog.instrs(b).len(), 3);
        assert_eq!(
            [a, x, y, z].map(|n| instr_of(&prog, n)),
            [0, 0, 1, 2]
        );
        assert_eq!((stats.copies, stats.spills), (0, 0));
    }

    #[test]
    fn single_slot_chain() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let pre = prog.push_alu(b, Op::PreExp2, &[a]).unwrap();
        let imp = prog.push_alu(b, Op::Exp2Impl, &[pre]).unwrap();
        let post = prog.push_alu(b, Op::PostLog2, &[imp]).unwrap();
        let st = prog
            .push_store(b, Op::StoreVarying, fixed(0, 0), post)
            .unwrap();
        lower(&mut prog).unwrap();
        let stats = sched(&mut prog);
        assert_eq!(prog.instrs(b).len(), 3);
        assert_eq!(
            [a, pre, imp, post, st].map(|n| instr_of(&prog, n)),
            [0, 0, 1, 2, 2]
        );
        assert_eq!(prog.instrs(b)[2].get(Slot::Pass), Some(post));
        assert_eq!(prog.instrs(b)[2].get(Slot::Store0), Some(st));
        assert_eq!((stats.copies, stats.spills), (0, 0));
    }

    #[test]
    fn copies() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let p = prog.push_alu(b, Op::Floor, &[a]).unwrap();
        let u = prog.push_load(b, Op::LoadUniform, fixed(0, 0)).unwrap();
        let mut c = prog.push_alu(b, Op::Add, &[p, u]).unwrap();
        for _ in 0..4 {
            c = prog.push_alu(b, Op::Add, &[p, c]).unwrap();
        }
        prog.push_store(b, Op::StoreVarying, fixed(0, 0), c).unwrap();
        lower(&mut prog).unwrap();
        let stats = sched(&mut prog);
        assert_eq!((stats.copies, stats.spills), (2, 0));
        assert_eq!(prog.instrs(b).len(), 6);
        assert_eq!(instr_of(&prog, p), 0);
        // The value of `p` is available from the floor and from two movs.
        let movs = prog
            .iter_nodes()
            .filter(|(_, x)| x.op == Op::Mov)
            .map(|(_, x)| x.sched.instr.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(movs, vec![2, 4]);
    }

    #[test]
    fn spill() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let p = prog.push_alu(b, Op::Floor, &[a]).unwrap();
        let u = prog.push_load(b, Op::LoadUniform, fixed(0, 0)).unwrap();
        let mut c = prog.push_alu(b, Op::Add, &[p, u]).unwrap();
        for _ in 0..8 {
            c = prog.push_alu(b, Op::Floor, &[c]).unwrap();
        }
        let last = prog.push_alu(b, Op::Add, &[p, c]).unwrap();
        prog.push_store(b, Op::StoreVarying, fixed(0, 0), last)
            .unwrap();
        lower(&mut prog).unwrap();
        let stats = sched(&mut prog);
        assert_eq!((stats.copies, stats.spills), (0, 1));
        assert_eq!(prog.instrs(b).len(), 11);
        let store = prog
            .iter_nodes()
            .find(|(_, x)| x.op == Op::StoreReg)
            .map(|(i, _)| i)
            .unwrap();
        let load = prog
            .iter_nodes()
            .find(|(_, x)| x.op == Op::LoadReg)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(instr_of(&prog, store), instr_of(&prog, p));
        assert_eq!(instr_of(&prog, load), 10);
        assert_eq!(
            prog.node(last).data_preds().collect::<Vec<_>>(),
            vec![c, load]
        );
        assert_eq!(prog.node(store).succs[&load], DepKind::ReadAfterWrite);
        assert_eq!(prog.vregs.len(), 1);
        assert_eq!(prog.vregs[VRegIdx::new(0)].component, Some(0));
    }

    #[test]
    fn duplicate_load() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let x = prog.push_alu(b, Op::Floor, &[a]).unwrap();
        let y = prog.push_alu(b, Op::Add, &[x, a]).unwrap();
        prog.push_store(b, Op::StoreVarying, fixed(0, 0), y).unwrap();
        lower(&mut prog).unwrap();
        let stats = sched(&mut prog);
        assert_eq!(stats.dup_loads, 1);
        assert_eq!(prog.instrs(b).len(), 2);
        let loads = prog
            .iter_nodes()
            .filter(|(_, x)| x.op == Op::LoadAttribute)
            .map(|(_, x)| x.sched.instr.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(loads, vec![0, 1]);
    }

    #[test]
    fn temp_ordering() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let x = prog.push_alu(b, Op::Floor, &[a]).unwrap();
        let st = prog.push_store(b, Op::StoreTemp, fixed(3, 1), x).unwrap();
        let ld = prog.push_load(b, Op::LoadTemp, fixed(3, 1)).unwrap();
        prog.add_dep(st, ld, DepKind::ReadAfterWrite);
        let y = prog.push_alu(b, Op::Sign, &[ld]).unwrap();
        prog.push_store(b, Op::StoreVarying, fixed(0, 0), y).unwrap();
        lower(&mut prog).unwrap();
        sched(&mut prog);
        assert!(instr_of(&prog, ld) >= instr_of(&prog, st) + 4);
    }

    /// A multiply of two attributes which cannot share register bank 0.
    fn attribute_conflict() -> (Prog, [NodeIdx; 3]) {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a3 = prog.push_load(b, Op::LoadAttribute, fixed(3, 0)).unwrap();
        let a2 = prog.push_load(b, Op::LoadAttribute, fixed(2, 2)).unwrap();
        let m = prog.push_alu(b, Op::Mul, &[a3, a2]).unwrap();
        prog.push_store(b, Op::StoreVarying, fixed(0, 0), m).unwrap();
        lower(&mut prog).unwrap();
        (prog, [a3, a2, m])
    }

    #[test]
    fn load_copy() {
        let (mut prog, [a3, a2, m]) = attribute_conflict();
        let stats = sched(&mut prog);
        assert_eq!((stats.copies, stats.spills), (1, 0));
        assert_eq!(prog.instrs(BlockIdx::new(0)).len(), 2);
        let mov = find_op(&prog, Op::Mov);
        assert_eq!(
            prog.node(m).data_preds().collect::<Vec<_>>(),
            vec![a3, mov]
        );
        assert_eq!(
            [a2, mov, a3, m].map(|n| instr_of(&prog, n)),
            [0, 0, 1, 1]
        );
    }

    #[test]
    fn load_spill() {
        let (mut prog, [a3, a2, m]) = attribute_conflict();
        let stats = sched_with(&mut prog, 0);
        assert_eq!((stats.copies, stats.spills), (0, 1));
        assert_eq!(prog.instrs(BlockIdx::new(0)).len(), 4);
        let mov = find_op(&prog, Op::Mov);
        let store = find_op(&prog, Op::StoreReg);
        let load = find_op(&prog, Op::LoadReg);
        assert_eq!(prog.node(mov).data_preds().collect::<Vec<_>>(), vec![a2]);
        assert_eq!(
            prog.node(m).data_preds().collect::<Vec<_>>(),
            vec![a3, load]
        );
        // The attribute, its copy and the spill store share a bundle, three before the reload.
        assert_eq!(
            [a2, mov, store, load, m].map(|n| instr_of(&prog, n)),
            [0, 0, 0, 3, 3]
        );
        assert_eq!(prog.instrs(BlockIdx::new(0))[3].get(Slot::Reg1Load0), Some(load));
        assert_eq!(prog.node(mov).sched.depth, 1);
    }

    #[test]
    fn copies_share_a_budget() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let p = prog.push_alu(b, Op::Floor, &[a]).unwrap();
        let u = prog.push_load(b, Op::LoadUniform, fixed(0, 0)).unwrap();
        let mut c = prog.push_alu(b, Op::Add, &[p, u]).unwrap();
        for _ in 0..4 {
            c = prog.push_alu(b, Op::Add, &[p, c]).unwrap();
        }
        prog.push_store(b, Op::StoreVarying, fixed(0, 0), c).unwrap();
        lower(&mut prog).unwrap();
        // With one copy allowed, the copy of `p` may not be copied again and is spilled instead.
        let stats = sched_with(&mut prog, 1);
        assert_eq!((stats.copies, stats.spills), (1, 1));
        assert_eq!(prog.instrs(b).len(), 6);
        let mov = find_op(&prog, Op::Mov);
        let store = find_op(&prog, Op::StoreReg);
        let load = find_op(&prog, Op::LoadReg);
        assert_eq!(prog.node(store).data_preds().collect::<Vec<_>>(), vec![mov]);
        assert_eq!(instr_of(&prog, store), instr_of(&prog, mov));
        assert_eq!(instr_of(&prog, load), 5);
        assert_eq!(prog.node(p).sched.retries, 1);
        assert_eq!(
            (prog.node(mov).sched.retries, prog.node(mov).sched.depth),
            (1, 1)
        );
        assert_eq!(prog.node(load).sched.depth, 2);
    }

    #[test]
    fn ready_order() {
        let mut ready = BTreeSet::new();
        for (seq, (first, dist)) in [(false, 3), (true, 0), (false, 5), (false, 3)]
            .into_iter()
            .enumerate()
        {
            ready.insert(Ready {
                first,
                dist,
                seq: seq as u64,
                node: NodeIdx::new(seq),
            });
        }
        let order = std::iter::from_fn(|| ready.pop_first().map(|x| x.seq)).collect::<Vec<_>>();
        assert_eq!(order, vec![1, 2, 0, 3]);
    }

    #[test]
    fn indexed_store() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let i = prog.push_load(b, Op::LoadAttribute, fixed(0, 1)).unwrap();
        let v = prog.push_alu(b, Op::Floor, &[a]).unwrap();
        let o = prog.push_alu(b, Op::Floor, &[i]).unwrap();
        let st = prog
            .push_indexed_store(b, Op::StoreTemp, fixed(2, 0), v, o)
            .unwrap();
        assert_eq!(prog.node(st).preds[&o], DepKind::Offset);
        lower(&mut prog).unwrap();
        let stats = sched(&mut prog);
        assert_eq!((stats.copies, stats.spills), (0, 0));
        // The value and the offset are both produced in the store's bundle.
        assert_eq!(prog.instrs(b).len(), 1);
        let instr = &prog.instrs(b)[0];
        assert_eq!(instr.get(Slot::Store0), Some(st));
        assert_eq!(instr.get(Slot::Add0), Some(v));
        assert_eq!(instr.get(Slot::Add1), Some(o));
        assert_eq!(instr.get(Slot::Reg0Load1), Some(i));
    }

    #[test]
    fn indexed_load() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let o = prog.push_alu(b, Op::Floor, &[a]).unwrap();
        let off = prog
            .push_store(b, Op::StoreTempLoadOff0, fixed(0, 0), o)
            .unwrap();
        let ld = prog
            .push_indexed_load(b, Op::LoadUniform, fixed(4, 0))
            .unwrap();
        prog.add_dep(off, ld, DepKind::ReadAfterWrite);
        let y = prog.push_alu(b, Op::Floor, &[ld]).unwrap();
        prog.push_store(b, Op::StoreVarying, fixed(0, 0), y).unwrap();
        lower(&mut prog).unwrap();
        sched(&mut prog);
        // The offset register is written four bundles before the load which uses it.
        assert_eq!(prog.instrs(b).len(), 5);
        assert_eq!(
            [a, o, off, ld, y].map(|n| instr_of(&prog, n)),
            [0, 0, 0, 4, 4]
        );
        assert_eq!(prog.instrs(b)[4].get(Slot::MemLoad0), Some(ld));
    }
}
