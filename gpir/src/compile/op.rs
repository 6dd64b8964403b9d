//! The operation catalog.
//!
//! Every [Op] has an immutable [OpInfo] record describing which bundle slots it may occupy (in
//! order of preference), its latency, and which of its operands the bundle encoding can negate
//! for free. The table is a `static` shared by every compilation: nothing in this module is ever
//! mutated.

use std::fmt;
use strum::{EnumCount, EnumIter, FromRepr};

/// The maximum number of sources an ALU operation can have.
pub const MAX_SRCS: usize = 3;

/// A slot within an instruction bundle.
///
/// The ALU slots come first; the load and store slots are grouped into ports of 4 consecutive
/// slots, one per component.
#[repr(u8)]
#[derive(
    Clone, Copy, Debug, EnumCount, EnumIter, Eq, FromRepr, Hash, Ord, PartialEq, PartialOrd,
)]
pub enum Slot {
    Mul0,
    Mul1,
    Add0,
    Add1,
    Complex,
    Pass,
    Branch,
    Reg0Load0,
    Reg0Load1,
    Reg0Load2,
    Reg0Load3,
    Reg1Load0,
    Reg1Load1,
    Reg1Load2,
    Reg1Load3,
    MemLoad0,
    MemLoad1,
    MemLoad2,
    MemLoad3,
    Store0,
    Store1,
    Store2,
    Store3,
}

/// A group of component-addressed slots sharing one address per bundle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Port {
    /// Register bank 0: attributes or registers.
    Reg0,
    /// Register bank 1: registers only.
    Reg1,
    /// Uniforms and temporaries.
    Mem,
    /// The store unit. Components 0/1 and 2/3 form pairs which each share one address.
    Store,
}

impl Slot {
    /// Every slot an ALU operation may occupy.
    pub const ALU: [Slot; 6] = [
        Slot::Mul0,
        Slot::Mul1,
        Slot::Add0,
        Slot::Add1,
        Slot::Complex,
        Slot::Pass,
    ];

    pub fn is_alu(self) -> bool {
        (self as u8) <= (Slot::Pass as u8)
    }

    /// If this is a load or store slot, return its [Port] and the component it addresses.
    pub fn port(self) -> Option<(Port, u8)> {
        let (port, base) = match self {
            Slot::Reg0Load0 | Slot::Reg0Load1 | Slot::Reg0Load2 | Slot::Reg0Load3 => {
                (Port::Reg0, Slot::Reg0Load0)
            }
            Slot::Reg1Load0 | Slot::Reg1Load1 | Slot::Reg1Load2 | Slot::Reg1Load3 => {
                (Port::Reg1, Slot::Reg1Load0)
            }
            Slot::MemLoad0 | Slot::MemLoad1 | Slot::MemLoad2 | Slot::MemLoad3 => {
                (Port::Mem, Slot::MemLoad0)
            }
            Slot::Store0 | Slot::Store1 | Slot::Store2 | Slot::Store3 => {
                (Port::Store, Slot::Store0)
            }
            _ => return None,
        };
        Some((port, self as u8 - base as u8))
    }

    fn name(self) -> &'static str {
        match self {
            Slot::Mul0 => "mul0",
            Slot::Mul1 => "mul1",
            Slot::Add0 => "add0",
            Slot::Add1 => "add1",
            Slot::Complex => "complex",
            Slot::Pass => "pass",
            Slot::Branch => "branch",
            Slot::Reg0Load0 => "reg0.x",
            Slot::Reg0Load1 => "reg0.y",
            Slot::Reg0Load2 => "reg0.z",
            Slot::Reg0Load3 => "reg0.w",
            Slot::Reg1Load0 => "reg1.x",
            Slot::Reg1Load1 => "reg1.y",
            Slot::Reg1Load2 => "reg1.z",
            Slot::Reg1Load3 => "reg1.w",
            Slot::MemLoad0 => "mem.x",
            Slot::MemLoad1 => "mem.y",
            Slot::MemLoad2 => "mem.z",
            Slot::MemLoad3 => "mem.w",
            Slot::Store0 => "store.x",
            Slot::Store1 => "store.y",
            Slot::Store2 => "store.z",
            Slot::Store3 => "store.w",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The functional category of an [Op].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    Alu,
    Const,
    Load,
    Store,
    Branch,
}

/// The storage a load or store operation addresses.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum File {
    Uniform,
    Temp,
    Attribute,
    Reg,
    Varying,
    /// The address offset registers used by dynamically indexed uniform loads.
    LoadOffset,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, EnumCount, EnumIter, Eq, FromRepr, Hash, PartialEq)]
pub enum Op {
    Mov,
    Mul,
    Select,
    Complex1,
    Complex2,
    Add,
    Sub,
    Floor,
    Sign,
    Ge,
    Lt,
    Min,
    Max,
    Abs,
    Neg,
    ClampConst,
    PreExp2,
    PostLog2,
    Exp2Impl,
    Log2Impl,
    RcpImpl,
    RsqrtImpl,
    LoadUniform,
    LoadTemp,
    LoadAttribute,
    LoadReg,
    StoreTemp,
    StoreReg,
    StoreVarying,
    StoreTempLoadOff0,
    StoreTempLoadOff1,
    StoreTempLoadOff2,
    BranchCond,
    Const,
    Copy,
    Exp2,
    Log2,
    Rcp,
    Rsqrt,
    Ceil,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    BranchUncond,
}

/// The static description of an [Op].
#[derive(Debug)]
pub struct OpInfo {
    /// The [Op] this record describes: `OP_INFOS[op as usize].op == op`.
    pub op: Op,
    pub name: &'static str,
    pub kind: OpKind,
    /// The slots this operation may be placed in, in order of preference. Empty for operations
    /// that must be lowered and for operations fully expressed by their consumer.
    pub slots: &'static [Slot],
    /// The number of bundles after issue before the result can be read, or `None` if this
    /// operation must be lowered before scheduling.
    pub latency: Option<u32>,
    /// Can the result be negated by the encoding?
    pub dest_neg: bool,
    /// Can source `i` be negated by the encoding?
    pub src_neg: [bool; MAX_SRCS],
    /// Helper operations which must be scheduled immediately after the node that made them ready,
    /// before something else takes the bundle resources they need.
    pub schedule_first: bool,
}

impl OpInfo {
    const fn new(
        op: Op,
        name: &'static str,
        kind: OpKind,
        slots: &'static [Slot],
        latency: Option<u32>,
    ) -> Self {
        Self {
            op,
            name,
            kind,
            slots,
            latency,
            dest_neg: false,
            src_neg: [false; MAX_SRCS],
            schedule_first: false,
        }
    }

    const fn alu(op: Op, name: &'static str, slots: &'static [Slot], latency: u32) -> Self {
        Self::new(op, name, OpKind::Alu, slots, Some(latency))
    }

    /// An operation the front-end may produce but which has no direct hardware equivalent.
    const fn unlowered(op: Op, name: &'static str, kind: OpKind) -> Self {
        Self::new(op, name, kind, &[], None)
    }

    const fn with_dest_neg(mut self) -> Self {
        self.dest_neg = true;
        self
    }

    const fn with_src_neg(mut self, src_neg: [bool; MAX_SRCS]) -> Self {
        self.src_neg = src_neg;
        self
    }

    const fn scheduled_first(mut self) -> Self {
        self.schedule_first = true;
        self
    }
}

const MOV_SLOTS: &[Slot] = &[
    Slot::Pass,
    Slot::Add0,
    Slot::Add1,
    Slot::Mul0,
    Slot::Mul1,
    Slot::Complex,
];
const MUL_SLOTS: &[Slot] = &[Slot::Mul0, Slot::Mul1];
const MUL0_SLOT: &[Slot] = &[Slot::Mul0];
const ADD_SLOTS: &[Slot] = &[Slot::Add0, Slot::Add1];
const NEG_SLOTS: &[Slot] = &[Slot::Add0, Slot::Add1, Slot::Mul0, Slot::Mul1];
const PASS_SLOT: &[Slot] = &[Slot::Pass];
const COMPLEX_SLOT: &[Slot] = &[Slot::Complex];
const BRANCH_SLOT: &[Slot] = &[Slot::Branch];
const MEM_LOAD_SLOTS: &[Slot] = &[
    Slot::MemLoad0,
    Slot::MemLoad1,
    Slot::MemLoad2,
    Slot::MemLoad3,
];
const REG0_LOAD_SLOTS: &[Slot] = &[
    Slot::Reg0Load0,
    Slot::Reg0Load1,
    Slot::Reg0Load2,
    Slot::Reg0Load3,
];
const REG_LOAD_SLOTS: &[Slot] = &[
    Slot::Reg1Load0,
    Slot::Reg1Load1,
    Slot::Reg1Load2,
    Slot::Reg1Load3,
    Slot::Reg0Load0,
    Slot::Reg0Load1,
    Slot::Reg0Load2,
    Slot::Reg0Load3,
];
const STORE_SLOTS: &[Slot] = &[Slot::Store0, Slot::Store1, Slot::Store2, Slot::Store3];

const SRC_NEG_01: [bool; MAX_SRCS] = [true, true, false];
const SRC_NEG_0: [bool; MAX_SRCS] = [true, false, false];

static OP_INFOS: [OpInfo; Op::COUNT] = [
    OpInfo::alu(Op::Mov, "mov", MOV_SLOTS, 1),
    OpInfo::alu(Op::Mul, "mul", MUL_SLOTS, 1).with_dest_neg(),
    OpInfo::alu(Op::Select, "select", MUL0_SLOT, 1).with_dest_neg(),
    OpInfo::alu(Op::Complex1, "complex1", MUL0_SLOT, 2),
    OpInfo::alu(Op::Complex2, "complex2", MUL0_SLOT, 1).scheduled_first(),
    OpInfo::alu(Op::Add, "add", ADD_SLOTS, 1).with_src_neg(SRC_NEG_01),
    OpInfo::alu(Op::Sub, "sub", ADD_SLOTS, 1).with_src_neg(SRC_NEG_01),
    OpInfo::alu(Op::Floor, "floor", ADD_SLOTS, 1).with_src_neg(SRC_NEG_0),
    OpInfo::alu(Op::Sign, "sign", ADD_SLOTS, 1).with_src_neg(SRC_NEG_0),
    OpInfo::alu(Op::Ge, "ge", ADD_SLOTS, 1).with_src_neg(SRC_NEG_01),
    OpInfo::alu(Op::Lt, "lt", ADD_SLOTS, 1).with_src_neg(SRC_NEG_01),
    OpInfo::alu(Op::Min, "min", ADD_SLOTS, 1).with_src_neg(SRC_NEG_01),
    OpInfo::alu(Op::Max, "max", ADD_SLOTS, 1).with_src_neg(SRC_NEG_01),
    OpInfo::alu(Op::Abs, "abs", ADD_SLOTS, 1).with_src_neg(SRC_NEG_01),
    OpInfo::alu(Op::Neg, "neg", NEG_SLOTS, 1),
    OpInfo::alu(Op::ClampConst, "clamp_const", PASS_SLOT, 1),
    OpInfo::alu(Op::PreExp2, "preexp2", PASS_SLOT, 1),
    OpInfo::alu(Op::PostLog2, "postlog2", PASS_SLOT, 1),
    OpInfo::alu(Op::Exp2Impl, "exp2_impl", COMPLEX_SLOT, 1),
    OpInfo::alu(Op::Log2Impl, "log2_impl", COMPLEX_SLOT, 1),
    OpInfo::alu(Op::RcpImpl, "rcp_impl", COMPLEX_SLOT, 1),
    OpInfo::alu(Op::RsqrtImpl, "rsqrt_impl", COMPLEX_SLOT, 1),
    OpInfo::new(
        Op::LoadUniform,
        "load_uniform",
        OpKind::Load,
        MEM_LOAD_SLOTS,
        Some(0),
    ),
    OpInfo::new(
        Op::LoadTemp,
        "load_temp",
        OpKind::Load,
        MEM_LOAD_SLOTS,
        Some(0),
    ),
    OpInfo::new(
        Op::LoadAttribute,
        "load_attribute",
        OpKind::Load,
        REG0_LOAD_SLOTS,
        Some(0),
    ),
    OpInfo::new(
        Op::LoadReg,
        "load_reg",
        OpKind::Load,
        REG_LOAD_SLOTS,
        Some(0),
    ),
    OpInfo::new(
        Op::StoreTemp,
        "store_temp",
        OpKind::Store,
        STORE_SLOTS,
        Some(4),
    ),
    OpInfo::new(
        Op::StoreReg,
        "store_reg",
        OpKind::Store,
        STORE_SLOTS,
        Some(3),
    ),
    OpInfo::new(
        Op::StoreVarying,
        "store_varying",
        OpKind::Store,
        STORE_SLOTS,
        Some(1),
    ),
    OpInfo::new(
        Op::StoreTempLoadOff0,
        "store_off0",
        OpKind::Store,
        STORE_SLOTS,
        Some(4),
    )
    .scheduled_first(),
    OpInfo::new(
        Op::StoreTempLoadOff1,
        "store_off1",
        OpKind::Store,
        STORE_SLOTS,
        Some(4),
    )
    .scheduled_first(),
    OpInfo::new(
        Op::StoreTempLoadOff2,
        "store_off2",
        OpKind::Store,
        STORE_SLOTS,
        Some(4),
    )
    .scheduled_first(),
    OpInfo::new(
        Op::BranchCond,
        "branch_cond",
        OpKind::Branch,
        BRANCH_SLOT,
        Some(1),
    ),
    OpInfo::unlowered(Op::Const, "const", OpKind::Const),
    OpInfo::new(Op::Copy, "copy", OpKind::Alu, &[], Some(0)),
    OpInfo::unlowered(Op::Exp2, "exp2", OpKind::Alu),
    OpInfo::unlowered(Op::Log2, "log2", OpKind::Alu),
    OpInfo::unlowered(Op::Rcp, "rcp", OpKind::Alu),
    OpInfo::unlowered(Op::Rsqrt, "rsqrt", OpKind::Alu),
    OpInfo::unlowered(Op::Ceil, "ceil", OpKind::Alu),
    OpInfo::unlowered(Op::Exp, "exp", OpKind::Alu),
    OpInfo::unlowered(Op::Log, "log", OpKind::Alu),
    OpInfo::unlowered(Op::Sin, "sin", OpKind::Alu),
    OpInfo::unlowered(Op::Cos, "cos", OpKind::Alu),
    OpInfo::unlowered(Op::Tan, "tan", OpKind::Alu),
    OpInfo::unlowered(Op::BranchUncond, "branch_uncond", OpKind::Branch),
];

impl Op {
    pub fn info(self) -> &'static OpInfo {
        &OP_INFOS[self as usize]
    }

    pub fn kind(self) -> OpKind {
        self.info().kind
    }

    pub fn latency(self) -> Option<u32> {
        self.info().latency
    }

    /// Can this operation occupy an ALU slot?
    pub fn is_alu_slotted(self) -> bool {
        self.info().slots.iter().any(|x| x.is_alu())
    }

    /// Is this a schedulable operation that occupies no slot, its value being expressed entirely
    /// by its (single) consumer?
    pub fn is_slotless(self) -> bool {
        let info = self.info();
        info.slots.is_empty() && info.latency.is_some()
    }

    /// The storage a load or store addresses, or `None` for other operations.
    pub fn file(self) -> Option<File> {
        match self {
            Op::LoadUniform => Some(File::Uniform),
            Op::LoadTemp | Op::StoreTemp => Some(File::Temp),
            Op::LoadAttribute => Some(File::Attribute),
            Op::LoadReg | Op::StoreReg => Some(File::Reg),
            Op::StoreVarying => Some(File::Varying),
            Op::StoreTempLoadOff0 | Op::StoreTempLoadOff1 | Op::StoreTempLoadOff2 => {
                Some(File::LoadOffset)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.info().name)
    }
}
