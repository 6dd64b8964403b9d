//! The instruction bundle model.
//!
//! An [Instr] is one bundle: a fixed set of [Slot]s, each holding at most one node. Beyond slot
//! exclusivity, a bundle tracks the shared resources which constrain what can be co-located:
//!
//!   * each load port (register bank 0, register bank 1, memory) reads one address per bundle,
//!     so every load placed in a port must agree on that address;
//!   * the store unit has two pairs of components (0/1 and 2/3), each pair writing one address;
//!   * a store's value must be produced by an ALU slot of the same bundle. When a store is placed,
//!     its value producers become "pending": every later ALU placement in the bundle must leave
//!     enough ALU slots free for them.

use super::{
    node::{Loc, NodeIdx, NodeKind, Prog, VRegIdx},
    op::{File, Port, Slot},
};
use smallvec::SmallVec;
use strum::EnumCount;

/// The maximum number of store value producers a bundle can wait for.
const MAX_PENDING: usize = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Addr {
    Fixed(u32),
    Virtual(VRegIdx),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AddrOffset {
    Absent,
    /// Offset by the load offset registers.
    Registers,
    /// Offset by the value of a node.
    Value(NodeIdx),
}

/// The address a load port or store pair is bound to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct PortKey {
    file: Option<File>,
    addr: Addr,
    offset: AddrOffset,
}

#[derive(Clone, Copy, Debug, Default)]
struct PortUse {
    key: Option<PortKey>,
    /// How many slots currently use `key`.
    count: u8,
}

impl PortUse {
    fn try_bind(&mut self, key: PortKey) -> bool {
        match self.key {
            Some(x) if x != key => false,
            _ => {
                self.key = Some(key);
                self.count += 1;
                true
            }
        }
    }

    fn unbind(&mut self) {
        self.count = self.count.saturating_sub(1);
        if self.count == 0 {
            self.key = None;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Instr {
    slots: [Option<NodeIdx>; Slot::COUNT],
    /// Load ports, indexed by [Instr::load_port].
    loads: [PortUse; 3],
    /// Store pairs: components 0/1, then 2/3.
    stores: [PortUse; 2],
    /// Store value producers which must still be given an ALU slot in this bundle.
    pending: SmallVec<[NodeIdx; MAX_PENDING]>,
}

impl Default for Instr {
    fn default() -> Self {
        Self::new()
    }
}

impl Instr {
    pub fn new() -> Self {
        Self {
            slots: [None; Slot::COUNT],
            loads: [PortUse::default(); 3],
            stores: [PortUse::default(); 2],
            pending: SmallVec::new(),
        }
    }

    pub fn get(&self, slot: Slot) -> Option<NodeIdx> {
        self.slots[slot as usize]
    }

    /// Iterate over the occupied slots in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Slot, NodeIdx)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, x)| x.and_then(|x| Slot::from_repr(i as u8).map(|s| (s, x))))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|x| x.is_none())
    }

    pub fn slot_of(&self, idx: NodeIdx) -> Option<Slot> {
        self.iter().find(|(_, x)| *x == idx).map(|(s, _)| s)
    }

    /// Is `idx` a store value producer waiting for an ALU slot in this bundle?
    #[cfg(test)]
    fn is_pending(&self, idx: NodeIdx) -> bool {
        self.pending.contains(&idx)
    }

    fn load_port(port: Port) -> Option<usize> {
        match port {
            Port::Reg0 => Some(0),
            Port::Reg1 => Some(1),
            Port::Mem => Some(2),
            Port::Store => None,
        }
    }

    fn port_key(prog: &Prog, kind: &NodeKind, file: Option<File>) -> Option<(PortKey, Option<u8>)> {
        let (loc, offset) = match kind {
            NodeKind::Load { loc, offset } => (
                *loc,
                if *offset {
                    AddrOffset::Registers
                } else {
                    AddrOffset::Absent
                },
            ),
            NodeKind::Store { loc, offset, .. } => (
                *loc,
                offset.map(AddrOffset::Value).unwrap_or(AddrOffset::Absent),
            ),
            _ => return None,
        };
        let (addr, component) = match loc {
            Loc::Fixed { index, component } => (Addr::Fixed(index), Some(component)),
            Loc::Virtual(x) => (Addr::Virtual(x), prog.vregs[x].component),
        };
        Some((PortKey { file, addr, offset }, component))
    }

    /// Try placing the node `idx` in `slot`, returning `true` (and updating this bundle's state)
    /// if that is legal. On failure nothing is changed.
    pub fn try_insert(&mut self, prog: &mut Prog, idx: NodeIdx, slot: Slot) -> bool {
        let node = prog.node(idx);
        if self.slots[slot as usize].is_some() || !node.op.info().slots.contains(&slot) {
            return false;
        }

        if slot.is_alu() {
            self.slots[slot as usize] = Some(idx);
            let was_pending = self.pending.iter().position(|x| *x == idx);
            if let Some(i) = was_pending {
                self.pending.remove(i);
            }
            if !self.pending_fit(prog) {
                self.slots[slot as usize] = None;
                if was_pending.is_some() {
                    self.pending.push(idx);
                }
                return false;
            }
            return true;
        }

        if slot == Slot::Branch {
            self.slots[slot as usize] = Some(idx);
            return true;
        }

        let Some((port, component)) = slot.port() else {
            return false;
        };
        let Some((key, want)) = Self::port_key(prog, &node.kind, node.op.file()) else {
            return false;
        };
        if want.is_some_and(|x| x != component) {
            return false;
        }
        let bound = match Self::load_port(port) {
            Some(i) => self.loads[i].try_bind(key),
            None => self.stores[usize::from(component / 2)].try_bind(key),
        };
        if !bound {
            return false;
        }

        if port == Port::Store {
            let mut children = node
                .kind
                .children()
                .into_iter()
                .map(|(x, _)| x)
                .filter(|x| !self.pending.contains(x) && self.slot_of(*x).is_none())
                .collect::<SmallVec<[_; 2]>>();
            children.dedup();
            if self.pending.len() + children.len() > MAX_PENDING {
                self.stores[usize::from(component / 2)].unbind();
                return false;
            }
            let old_len = self.pending.len();
            self.pending.extend(children);
            self.slots[slot as usize] = Some(idx);
            if !self.pending_fit(prog) {
                self.pending.truncate(old_len);
                self.slots[slot as usize] = None;
                self.stores[usize::from(component / 2)].unbind();
                return false;
            }
        } else {
            self.slots[slot as usize] = Some(idx);
        }

        if let Some(Loc::Virtual(x)) = prog.node(idx).kind.loc() {
            let vreg = &mut prog.vregs[x];
            if vreg.component.is_none() {
                vreg.component = Some(component);
                vreg.fixed_by = Some(idx);
            }
        }
        true
    }

    /// Try every slot `idx`'s operation allows, in order of preference, returning the slot it was
    /// placed in.
    pub fn try_place(&mut self, prog: &mut Prog, idx: NodeIdx) -> Option<Slot> {
        let slots = prog.node(idx).op.info().slots;
        slots
            .iter()
            .copied()
            .find(|slot| self.try_insert(prog, idx, *slot))
    }

    /// Remove `idx` from this bundle, undoing everything [Self::try_insert] did for it.
    pub fn remove(&mut self, prog: &mut Prog, idx: NodeIdx) {
        let Some(slot) = self.slot_of(idx) else {
            return;
        };
        self.slots[slot as usize] = None;
        if slot.is_alu() {
            // A store value producer becomes pending again if its store stays behind.
            let feeds_store = prog.node(idx).data_succs().any(|x| {
                self.slot_of(x)
                    .and_then(|s| s.port())
                    .is_some_and(|(p, _)| p == Port::Store)
            });
            if feeds_store {
                self.pending.push(idx);
            }
            return;
        }
        let Some((port, component)) = slot.port() else {
            return;
        };
        match Self::load_port(port) {
            Some(i) => self.loads[i].unbind(),
            None => {
                self.stores[usize::from(component / 2)].unbind();
                let children = prog.node(idx).kind.children();
                self.pending
                    .retain(|x| !children.iter().any(|(y, _)| y == x));
            }
        }
        if let Some(Loc::Virtual(x)) = prog.node(idx).kind.loc() {
            let vreg = &mut prog.vregs[x];
            if vreg.fixed_by == Some(idx) {
                vreg.component = None;
                vreg.fixed_by = None;
            }
        }
    }

    /// Can every pending store value producer still be given a distinct free ALU slot?
    fn pending_fit(&self, prog: &Prog) -> bool {
        fn assign(
            prog: &Prog,
            pending: &[NodeIdx],
            free: &mut [bool; Slot::COUNT],
        ) -> bool {
            let Some((first, rest)) = pending.split_first() else {
                return true;
            };
            for slot in prog.node(*first).op.info().slots {
                if slot.is_alu() && free[*slot as usize] {
                    free[*slot as usize] = false;
                    let ok = assign(prog, rest, free);
                    free[*slot as usize] = true;
                    if ok {
                        return true;
                    }
                }
            }
            false
        }

        let mut free = [false; Slot::COUNT];
        for (i, x) in self.slots.iter().enumerate() {
            free[i] = x.is_none();
        }
        assign(prog, &self.pending, &mut free)
    }
}
