//! The DAG node model.
//!
//! A [Prog] owns an arena of [Node]s and a list of [Block]s. Each block records its nodes in
//! sequence order (every node after its predecessors) and, once scheduled, its bundles. Nodes are
//! addressed by a stable [NodeIdx]: deleting a node leaves a hole in the arena rather than
//! renumbering.
//!
//! Edges are stored twice, once in the predecessor's `succs` and once in the successor's `preds`,
//! and both maps are always updated together. Data edges (see [DepKind::is_data]) mirror the
//! children named in a node's [NodeKind]; ordering edges carry no value.

use super::{
    CompilationError,
    instr::Instr,
    op::{MAX_SRCS, Op, OpKind, Slot},
};
use index_vec::IndexVec;
use indexmap::IndexMap;
use smallvec::{SmallVec, smallvec};
use std::{collections::BTreeSet, fmt};

index_vec::define_index_type! {
    pub struct NodeIdx = u32;
}

index_vec::define_index_type! {
    pub struct BlockIdx = u16;
}

index_vec::define_index_type! {
    /// A virtual register in the physical register file, created by spilling.
    pub struct VRegIdx = u32;
}

/// The printable names of components 0..=3.
pub(crate) const COMPONENTS: [char; 4] = ['x', 'y', 'z', 'w'];

/// The kind of a dependency edge.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DepKind {
    /// A true data dependency.
    Input,
    /// The address offset input of an indexed store.
    Offset,
    /// The successor reads storage the predecessor writes.
    ReadAfterWrite,
    /// The successor writes storage the predecessor reads.
    WriteAfterRead,
    /// The successor reuses the value register the predecessor reads.
    VRegWriteAfterRead,
}

impl DepKind {
    pub fn is_data(self) -> bool {
        matches!(self, DepKind::Input | DepKind::Offset)
    }

    /// When two edges join the same pair of nodes, the one with the higher rank survives.
    fn rank(self) -> u8 {
        match self {
            DepKind::Input => 4,
            DepKind::Offset => 3,
            DepKind::ReadAfterWrite => 2,
            DepKind::WriteAfterRead => 1,
            DepKind::VRegWriteAfterRead => 0,
        }
    }
}

/// An ALU source operand.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Src {
    pub node: NodeIdx,
    pub neg: bool,
}

impl Src {
    pub fn new(node: NodeIdx) -> Self {
        Self { node, neg: false }
    }

    pub fn negated(node: NodeIdx) -> Self {
        Self { node, neg: true }
    }
}

/// A load or store location.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Loc {
    /// A concrete index in a register file, and the component (0..=3) within it.
    Fixed { index: u32, component: u8 },
    /// A location in the physical register file yet to be resolved.
    Virtual(VRegIdx),
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Alu {
        srcs: SmallVec<[Src; MAX_SRCS]>,
        dest_neg: bool,
    },
    Const {
        value: f32,
    },
    Load {
        loc: Loc,
        /// Is the address offset by the load offset registers?
        offset: bool,
    },
    Store {
        loc: Loc,
        value: NodeIdx,
        offset: Option<NodeIdx>,
    },
    Branch {
        cond: Option<NodeIdx>,
    },
}

impl NodeKind {
    pub fn alu(srcs: &[NodeIdx]) -> Self {
        NodeKind::Alu {
            srcs: srcs.iter().map(|x| Src::new(*x)).collect(),
            dest_neg: false,
        }
    }

    pub fn op_kind(&self) -> OpKind {
        match self {
            NodeKind::Alu { .. } => OpKind::Alu,
            NodeKind::Const { .. } => OpKind::Const,
            NodeKind::Load { .. } => OpKind::Load,
            NodeKind::Store { .. } => OpKind::Store,
            NodeKind::Branch { .. } => OpKind::Branch,
        }
    }

    /// The children this payload references, with the kind of edge each implies. A child
    /// referenced more than once is reported more than once.
    pub fn children(&self) -> SmallVec<[(NodeIdx, DepKind); MAX_SRCS]> {
        match self {
            NodeKind::Alu { srcs, .. } => srcs.iter().map(|x| (x.node, DepKind::Input)).collect(),
            NodeKind::Const { .. } | NodeKind::Load { .. } => SmallVec::new(),
            NodeKind::Store { value, offset, .. } => {
                let mut v = smallvec![(*value, DepKind::Input)];
                if let Some(x) = offset {
                    v.push((*x, DepKind::Offset));
                }
                v
            }
            NodeKind::Branch { cond } => cond.iter().map(|x| (*x, DepKind::Input)).collect(),
        }
    }

    fn replace_child(&mut self, old: NodeIdx, new: NodeIdx) {
        let f = |x: &mut NodeIdx| {
            if *x == old {
                *x = new;
            }
        };
        match self {
            NodeKind::Alu { srcs, .. } => srcs.iter_mut().for_each(|x| f(&mut x.node)),
            NodeKind::Const { .. } | NodeKind::Load { .. } => (),
            NodeKind::Store { value, offset, .. } => {
                f(value);
                offset.iter_mut().for_each(f);
            }
            NodeKind::Branch { cond } => cond.iter_mut().for_each(f),
        }
    }

    pub fn loc(&self) -> Option<Loc> {
        match self {
            NodeKind::Load { loc, .. } | NodeKind::Store { loc, .. } => Some(*loc),
            _ => None,
        }
    }

    pub fn set_loc(&mut self, new: Loc) {
        if let NodeKind::Load { loc, .. } | NodeKind::Store { loc, .. } = self {
            *loc = new;
        }
    }
}

/// Per-node scheduler state.
#[derive(Clone, Debug, Default)]
pub struct SchedState {
    /// The bundle this node is placed in. While a block is being scheduled, bundle 0 is the last
    /// bundle of the block; after finalisation it is the first.
    pub instr: Option<usize>,
    pub slot: Option<Slot>,
    /// The scheduling priority: the longest latency path from a leaf to this node.
    pub dist: u32,
    pub scheduled: bool,
    /// Was this node created by the scheduler? Such nodes are scheduled explicitly by whoever
    /// created them, never through the ready list.
    pub inserted: bool,
    /// How many copies have been made for this node, counting those made for the node it copies
    /// or duplicates.
    pub retries: u32,
    /// How many scheduler rewrites separate this node from the input program.
    pub depth: u32,
}

#[derive(Clone, Debug)]
pub struct Node {
    pub op: Op,
    pub kind: NodeKind,
    pub block: BlockIdx,
    pub preds: IndexMap<NodeIdx, DepKind>,
    pub succs: IndexMap<NodeIdx, DepKind>,
    pub sched: SchedState,
    pub value_reg: Option<u8>,
}

impl Node {
    fn new(op: Op, kind: NodeKind, block: BlockIdx) -> Self {
        Self {
            op,
            kind,
            block,
            preds: IndexMap::new(),
            succs: IndexMap::new(),
            sched: SchedState::default(),
            value_reg: None,
        }
    }

    /// Iterate over the successors reached through data edges.
    pub fn data_succs(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        self.succs
            .iter()
            .filter(|(_, k)| k.is_data())
            .map(|(x, _)| *x)
    }

    pub fn data_preds(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        self.preds
            .iter()
            .filter(|(_, k)| k.is_data())
            .map(|(x, _)| *x)
    }

    /// Is this a final externally visible effect?
    pub fn is_root(&self) -> bool {
        self.succs.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Block {
    /// This block's nodes in sequence order.
    pub nodes: Vec<NodeIdx>,
    /// This block's bundles in program order. Empty until the block is scheduled.
    pub instrs: Vec<Instr>,
}

#[derive(Clone, Debug, Default)]
pub struct VReg {
    /// The component every access to this register uses, once one has been chosen.
    pub component: Option<u8>,
    /// The node whose placement chose `component`.
    pub fixed_by: Option<NodeIdx>,
}

#[derive(Debug)]
pub struct Prog {
    pub(crate) nodes: IndexVec<NodeIdx, Option<Node>>,
    pub blocks: IndexVec<BlockIdx, Block>,
    pub vregs: IndexVec<VRegIdx, VReg>,
    /// The uniform index at which the constant pool starts.
    pub constant_base: u32,
    /// The constant pool. Entry `k` lives at uniform `constant_base + k / 4`, component `k % 4`.
    pub constants: Vec<f32>,
}

impl Prog {
    pub fn new(constant_base: u32) -> Self {
        Self {
            nodes: IndexVec::new(),
            blocks: IndexVec::new(),
            vregs: IndexVec::new(),
            constant_base,
            constants: Vec::new(),
        }
    }

    pub fn push_block(&mut self) -> BlockIdx {
        self.blocks.push(Block::default())
    }

    pub fn push_alu(
        &mut self,
        block: BlockIdx,
        op: Op,
        srcs: &[NodeIdx],
    ) -> Result<NodeIdx, CompilationError> {
        self.push(block, op, NodeKind::alu(srcs))
    }

    pub fn push_alu_srcs(
        &mut self,
        block: BlockIdx,
        op: Op,
        srcs: &[Src],
        dest_neg: bool,
    ) -> Result<NodeIdx, CompilationError> {
        let kind = NodeKind::Alu {
            srcs: SmallVec::from_slice(srcs),
            dest_neg,
        };
        self.push(block, op, kind)
    }

    pub fn push_const(&mut self, block: BlockIdx, value: f32) -> Result<NodeIdx, CompilationError> {
        self.push(block, Op::Const, NodeKind::Const { value })
    }

    pub fn push_load(
        &mut self,
        block: BlockIdx,
        op: Op,
        loc: Loc,
    ) -> Result<NodeIdx, CompilationError> {
        self.push(block, op, NodeKind::Load { loc, offset: false })
    }

    /// Push a load whose address is offset by the load offset registers.
    pub fn push_indexed_load(
        &mut self,
        block: BlockIdx,
        op: Op,
        loc: Loc,
    ) -> Result<NodeIdx, CompilationError> {
        self.push(block, op, NodeKind::Load { loc, offset: true })
    }

    pub fn push_store(
        &mut self,
        block: BlockIdx,
        op: Op,
        loc: Loc,
        value: NodeIdx,
    ) -> Result<NodeIdx, CompilationError> {
        let kind = NodeKind::Store {
            loc,
            value,
            offset: None,
        };
        self.push(block, op, kind)
    }

    /// Push a store whose address is offset by the value of `offset`.
    pub fn push_indexed_store(
        &mut self,
        block: BlockIdx,
        op: Op,
        loc: Loc,
        value: NodeIdx,
        offset: NodeIdx,
    ) -> Result<NodeIdx, CompilationError> {
        let kind = NodeKind::Store {
            loc,
            value,
            offset: Some(offset),
        };
        self.push(block, op, kind)
    }

    pub fn push_branch(
        &mut self,
        block: BlockIdx,
        op: Op,
        cond: Option<NodeIdx>,
    ) -> Result<NodeIdx, CompilationError> {
        self.push(block, op, NodeKind::Branch { cond })
    }

    /// Append a new node to the end of `block`'s sequence.
    fn push(
        &mut self,
        block: BlockIdx,
        op: Op,
        kind: NodeKind,
    ) -> Result<NodeIdx, CompilationError> {
        if block.index() >= self.blocks.len() {
            return Err(CompilationError::Malformed(format!(
                "block{} does not exist",
                block.index()
            )));
        }
        let idx = self.create(block, op, kind)?;
        self.blocks[block].nodes.push(idx);
        Ok(idx)
    }

    /// Create a node without sequencing it, adding the data edges its payload implies.
    fn create(
        &mut self,
        block: BlockIdx,
        op: Op,
        kind: NodeKind,
    ) -> Result<NodeIdx, CompilationError> {
        if self.nodes.len() >= usize::try_from(u32::MAX).unwrap_or(usize::MAX) {
            return Err(CompilationError::LimitExceeded(
                "Too many nodes in a program".into(),
            ));
        }
        let children = kind.children();
        for (x, _) in &children {
            if self.try_node(*x).is_none() {
                return Err(CompilationError::Malformed(format!(
                    "%{} does not exist",
                    x.index()
                )));
            }
        }
        let idx = self.nodes.push(Some(Node::new(op, kind, block)));
        for (x, dep) in children {
            self.add_dep(x, idx, dep);
        }
        Ok(idx)
    }

    /// Create a new node sequenced immediately before `anchor` in `anchor`'s block.
    pub fn insert_before(
        &mut self,
        anchor: NodeIdx,
        op: Op,
        kind: NodeKind,
    ) -> Result<NodeIdx, CompilationError> {
        let block = self.node(anchor).block;
        let pos = self.seq_pos(anchor)?;
        let idx = self.create(block, op, kind)?;
        self.blocks[block].nodes.insert(pos, idx);
        Ok(idx)
    }

    /// Create a new node sequenced immediately after `anchor` in `anchor`'s block.
    pub fn insert_after(
        &mut self,
        anchor: NodeIdx,
        op: Op,
        kind: NodeKind,
    ) -> Result<NodeIdx, CompilationError> {
        let block = self.node(anchor).block;
        let pos = self.seq_pos(anchor)?;
        let idx = self.create(block, op, kind)?;
        self.blocks[block].nodes.insert(pos + 1, idx);
        Ok(idx)
    }

    fn seq_pos(&self, idx: NodeIdx) -> Result<usize, CompilationError> {
        self.blocks[self.node(idx).block]
            .nodes
            .iter()
            .position(|x| *x == idx)
            .ok_or_else(|| {
                CompilationError::InternalError(format!("%{} is not sequenced", idx.index()))
            })
    }

    /// Return the sequence position of every node in `block`, indexed by [NodeIdx].
    pub fn seq_positions(&self, block: BlockIdx) -> IndexVec<NodeIdx, Option<usize>> {
        let mut pos = IndexVec::from_vec(vec![None; self.nodes.len()]);
        for (i, x) in self.blocks[block].nodes.iter().enumerate() {
            pos[*x] = Some(i);
        }
        pos
    }

    /// Return a reference to the node `idx`.
    ///
    /// # Panics
    ///
    /// If `idx` has been deleted.
    pub fn node(&self, idx: NodeIdx) -> &Node {
        match &self.nodes[idx] {
            Some(x) => x,
            None => panic!("%{} has been deleted", idx.index()),
        }
    }

    /// Return a mutable reference to the node `idx`.
    ///
    /// # Panics
    ///
    /// If `idx` has been deleted.
    pub fn node_mut(&mut self, idx: NodeIdx) -> &mut Node {
        match &mut self.nodes[idx] {
            Some(x) => x,
            None => panic!("%{} has been deleted", idx.index()),
        }
    }

    /// Return the node `idx` if it exists and has not been deleted.
    pub fn try_node(&self, idx: NodeIdx) -> Option<&Node> {
        self.nodes.get(idx).and_then(|x| x.as_ref())
    }

    /// Iterate over every live node.
    pub fn iter_nodes(&self) -> impl Iterator<Item = (NodeIdx, &Node)> {
        self.nodes
            .iter_enumerated()
            .filter_map(|(i, x)| x.as_ref().map(|x| (i, x)))
    }

    /// The bundles of `block` in program order.
    pub fn instrs(&self, block: BlockIdx) -> &[Instr] {
        &self.blocks[block].instrs
    }

    /// Add an edge from `pred` to `succ`. If an edge already joins them, the stronger of the two
    /// kinds is kept.
    pub fn add_dep(&mut self, pred: NodeIdx, succ: NodeIdx, kind: DepKind) {
        let kind = match self.node(succ).preds.get(&pred) {
            Some(old) if old.rank() >= kind.rank() => *old,
            _ => kind,
        };
        self.node_mut(succ).preds.insert(pred, kind);
        self.node_mut(pred).succs.insert(succ, kind);
    }

    /// Remove the edge from `pred` to `succ`, returning its kind if there was one.
    pub fn remove_dep(&mut self, pred: NodeIdx, succ: NodeIdx) -> Option<DepKind> {
        self.node_mut(pred).succs.shift_remove(&succ);
        self.node_mut(succ).preds.shift_remove(&pred)
    }

    /// Make `succ` read `new` wherever it read `old`, moving the edge between them.
    pub fn replace_child(
        &mut self,
        succ: NodeIdx,
        old: NodeIdx,
        new: NodeIdx,
    ) -> Result<(), CompilationError> {
        let kind = self.remove_dep(old, succ).ok_or_else(|| {
            CompilationError::InternalError(format!(
                "%{} is not a predecessor of %{}",
                old.index(),
                succ.index()
            ))
        })?;
        self.node_mut(succ).kind.replace_child(old, new);
        self.add_dep(new, succ, kind);
        Ok(())
    }

    /// Make every data successor of `old`, other than `new` itself, read `new` instead.
    pub fn replace_uses(&mut self, old: NodeIdx, new: NodeIdx) -> Result<(), CompilationError> {
        let succs = self
            .node(old)
            .data_succs()
            .filter(|x| *x != new)
            .collect::<Vec<_>>();
        for x in succs {
            self.replace_child(x, old, new)?;
        }
        Ok(())
    }

    /// Change the operation and payload of `idx`, updating its data edges to match.
    pub fn set_kind(&mut self, idx: NodeIdx, op: Op, kind: NodeKind) {
        let new = kind.children();
        let old = self
            .node(idx)
            .preds
            .iter()
            .filter(|(_, k)| k.is_data())
            .map(|(x, _)| *x)
            .collect::<Vec<_>>();
        for x in old {
            if !new.iter().any(|(y, _)| *y == x) {
                self.remove_dep(x, idx);
            }
        }
        for (x, dep) in new {
            self.add_dep(x, idx, dep);
        }
        let node = self.node_mut(idx);
        node.op = op;
        node.kind = kind;
    }

    /// Delete `idx` and every edge touching it.
    pub fn delete(&mut self, idx: NodeIdx) -> Result<(), CompilationError> {
        if self.node(idx).data_succs().next().is_some() {
            return Err(CompilationError::InternalError(format!(
                "%{} is deleted while still being read",
                idx.index()
            )));
        }
        let pos = self.seq_pos(idx)?;
        let block = self.node(idx).block;
        self.blocks[block].nodes.remove(pos);
        let preds = self.node(idx).preds.keys().copied().collect::<Vec<_>>();
        for x in preds {
            self.node_mut(x).succs.shift_remove(&idx);
        }
        let succs = self.node(idx).succs.keys().copied().collect::<Vec<_>>();
        for x in succs {
            self.node_mut(x).preds.shift_remove(&idx);
        }
        self.nodes[idx] = None;
        Ok(())
    }

    /// Re-sequence `block` so that every node follows its predecessors, disturbing the existing
    /// order as little as possible.
    pub fn topo_sort(&mut self, block: BlockIdx) -> Result<(), CompilationError> {
        let pos = self.seq_positions(block);
        let order = &self.blocks[block].nodes;
        let mut indegree = order
            .iter()
            .map(|x| {
                self.node(*x)
                    .preds
                    .keys()
                    .filter(|y| pos.get(**y).copied().flatten().is_some())
                    .count()
            })
            .collect::<Vec<_>>();
        let mut ready = indegree
            .iter()
            .enumerate()
            .filter(|(_, x)| **x == 0)
            .map(|(i, _)| i)
            .collect::<BTreeSet<_>>();
        let mut sorted = Vec::with_capacity(order.len());
        while let Some(i) = ready.pop_first() {
            let idx = order[i];
            sorted.push(idx);
            for x in self.node(idx).succs.keys() {
                if let Some(j) = pos.get(*x).copied().flatten() {
                    indegree[j] -= 1;
                    if indegree[j] == 0 {
                        ready.insert(j);
                    }
                }
            }
        }
        if sorted.len() != order.len() {
            return Err(CompilationError::Malformed(format!(
                "block{} contains a cycle",
                block.index()
            )));
        }
        self.blocks[block].nodes = sorted;
        Ok(())
    }

    pub fn new_vreg(&mut self) -> Result<VRegIdx, CompilationError> {
        if self.vregs.len() >= usize::try_from(u32::MAX).unwrap_or(usize::MAX) {
            return Err(CompilationError::LimitExceeded(
                "Too many virtual registers".into(),
            ));
        }
        Ok(self.vregs.push(VReg::default()))
    }

    fn loc_to_string(&self, loc: Loc) -> String {
        match loc {
            Loc::Fixed { index, component } => {
                format!("{index}.{}", COMPONENTS[usize::from(component & 3)])
            }
            Loc::Virtual(x) => match self.vregs[x].component {
                Some(c) => format!("v{}.{}", x.index(), COMPONENTS[usize::from(c & 3)]),
                None => format!("v{}", x.index()),
            },
        }
    }

    pub fn node_to_string(&self, idx: NodeIdx) -> String {
        let node = self.node(idx);
        let mut s = node.op.to_string();
        match &node.kind {
            NodeKind::Alu { srcs, dest_neg } => {
                if *dest_neg {
                    s.push_str(".neg");
                }
                if !srcs.is_empty() {
                    let srcs = srcs
                        .iter()
                        .map(|x| format!("{}%{}", if x.neg { "-" } else { "" }, x.node.index()))
                        .collect::<Vec<_>>();
                    s.push(' ');
                    s.push_str(&srcs.join(", "));
                }
            }
            NodeKind::Const { value } => s.push_str(&format!(" {value}")),
            NodeKind::Load { loc, offset } => {
                s.push(' ');
                s.push_str(&self.loc_to_string(*loc));
                if *offset {
                    s.push_str("+off");
                }
            }
            NodeKind::Store { loc, value, offset } => {
                s.push(' ');
                s.push_str(&self.loc_to_string(*loc));
                if let Some(x) = offset {
                    s.push_str(&format!("+%{}", x.index()));
                }
                s.push_str(&format!(", %{}", value.index()));
            }
            NodeKind::Branch { cond } => {
                if let Some(x) = cond {
                    s.push_str(&format!(" %{}", x.index()));
                }
            }
        }
        if let Some(r) = node.value_reg {
            s.push_str(&format!(" ; value_reg={r}"));
        }
        s
    }
}

impl fmt::Display for Prog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bidx, block) in self.blocks.iter_enumerated() {
            writeln!(f, "block{}:", bidx.index())?;
            for x in &block.nodes {
                writeln!(f, "  %{}: {}", x.index(), self.node_to_string(*x))?;
            }
            for (i, instr) in block.instrs.iter().enumerate() {
                let slots = instr
                    .iter()
                    .map(|(slot, x)| format!("{slot}: %{}", x.index()))
                    .collect::<Vec<_>>();
                if slots.is_empty() {
                    writeln!(f, "  [{i}]")?;
                } else {
                    writeln!(f, "  [{i}] {}", slots.join(", "))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use fm::FMBuilder;
    use lazy_static::lazy_static;
    use regex::Regex;

    lazy_static! {
        static ref PTN_RE: Regex = Regex::new(r"\{\{.+?\}\}").unwrap();
        static ref TEXT_RE: Regex = Regex::new(r"[a-zA-Z0-9\._]+").unwrap();
    }

    /// Check that `prog`'s textual form matches the `fm` pattern `ptn`.
    pub(crate) fn assert_prog_matches(prog: &Prog, ptn: &str) {
        let s = prog.to_string();
        match FMBuilder::new(ptn)
            .unwrap()
            .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
            .build()
            .unwrap()
            .matches(&s)
        {
            Ok(()) => (),
            Err(e) => panic!("{e}"),
        }
    }

    pub(crate) fn fixed(index: u32, component: u8) -> Loc {
        Loc::Fixed { index, component }
    }

    /// Check that every edge is recorded at both of its endpoints.
    pub(crate) fn assert_mirrored(prog: &Prog) {
        for (i, node) in prog.iter_nodes() {
            for (s, k) in &node.succs {
                assert_eq!(prog.node(*s).preds.get(&i), Some(k));
            }
            for (p, k) in &node.preds {
                assert_eq!(prog.node(*p).succs.get(&i), Some(k));
            }
        }
    }

    #[test]
    fn push_and_display() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let l = prog
            .push_load(b, Op::LoadAttribute, fixed(0, 1))
            .unwrap();
        let c = prog.push_const(b, 1.5).unwrap();
        let m = prog
            .push_alu_srcs(b, Op::Mul, &[Src::new(l), Src::negated(c)], true)
            .unwrap();
        prog.push_store(b, Op::StoreVarying, fixed(2, 3), m).unwrap();
        assert_mirrored(&prog);
        assert_prog_matches(
            &prog,
            "block0:
  %0: load_attribute 0.y
  %1: const 1.5
  %2: mul.neg %0, -%1
  %3: store_varying 2.w, %2
",
        );
        assert_eq!(prog.node(l).succs.get(&m), Some(&DepKind::Input));
        assert!(prog.node(NodeIdx::new(3)).is_root());
    }

    #[test]
    fn missing_child() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        assert!(matches!(
            prog.push_alu(b, Op::Floor, &[NodeIdx::new(7)]),
            Err(CompilationError::Malformed(_))
        ));
    }

    #[test]
    fn dep_merging() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let l = prog.push_load(b, Op::LoadTemp, fixed(0, 0)).unwrap();
        let f = prog.push_alu(b, Op::Floor, &[l]).unwrap();
        prog.add_dep(l, f, DepKind::WriteAfterRead);
        assert_eq!(prog.node(f).preds[&l], DepKind::Input);
        let s = prog
            .push_store(b, Op::StoreTemp, fixed(0, 0), f)
            .unwrap();
        prog.add_dep(l, s, DepKind::WriteAfterRead);
        prog.add_dep(l, s, DepKind::VRegWriteAfterRead);
        assert_eq!(prog.node(s).preds[&l], DepKind::WriteAfterRead);
        assert_eq!(prog.remove_dep(l, s), Some(DepKind::WriteAfterRead));
        assert!(!prog.node(l).succs.contains_key(&s));
        assert_mirrored(&prog);
    }

    #[test]
    fn replace_and_delete() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let x = prog.push_alu(b, Op::Floor, &[a]).unwrap();
        let y = prog.push_alu(b, Op::Add, &[x, x]).unwrap();
        let z = prog.push_alu(b, Op::Sign, &[x]).unwrap();
        let mov = prog.insert_after(x, Op::Mov, NodeKind::alu(&[x])).unwrap();
        prog.replace_uses(x, mov).unwrap();
        assert_eq!(
            prog.node(x).data_succs().collect::<Vec<_>>(),
            vec![mov]
        );
        assert_eq!(prog.node(y).kind, NodeKind::alu(&[mov, mov]));
        assert_eq!(prog.node(z).kind, NodeKind::alu(&[mov]));
        assert_eq!(prog.blocks[b].nodes, vec![a, x, mov, y, z]);
        assert!(prog.delete(x).is_err());
        prog.set_kind(mov, Op::Mov, NodeKind::alu(&[a]));
        prog.delete(x).unwrap();
        assert!(prog.try_node(x).is_none());
        assert_eq!(prog.blocks[b].nodes, vec![a, mov, y, z]);
        assert_mirrored(&prog);
    }

    #[test]
    fn topo_sort() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let c = prog.push_load(b, Op::LoadAttribute, fixed(0, 1)).unwrap();
        let x = prog.push_alu(b, Op::Add, &[a, c]).unwrap();
        let y = prog.push_alu(b, Op::Floor, &[c]).unwrap();
        prog.blocks[b].nodes = vec![y, x, c, a];
        prog.topo_sort(b).unwrap();
        assert_eq!(prog.blocks[b].nodes, vec![c, y, a, x]);

        let w = prog.push_alu(b, Op::Floor, &[x]).unwrap();
        prog.add_dep(w, a, DepKind::ReadAfterWrite);
        assert!(matches!(
            prog.topo_sort(b),
            Err(CompilationError::Malformed(_))
        ));
    }
}
