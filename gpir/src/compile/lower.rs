//! Lowering: rewrite a front-end DAG so that every node is an operation the bundle encoding can
//! express directly.
//!
//! Lowering runs, per block, in three sweeps over the sequence:
//!
//!   1. fold `neg` nodes into their producer or consumers and expand the transcendental operations
//!      into their `complex` unit helper sequences;
//!   2. replace every constant with a load from the constant pool;
//!   3. make sure every store reads an ALU result it can be co-issued with.
//!
//! Lowering a lowered program changes nothing.

use super::{
    CompilationError,
    node::{BlockIdx, Loc, NodeIdx, NodeKind, Prog},
    op::{Op, OpKind},
};

pub(super) fn lower(prog: &mut Prog) -> Result<(), CompilationError> {
    for bidx in prog.blocks.indices() {
        lower_ops(prog, bidx)?;
        lower_consts(prog, bidx)?;
        lower_store_feeds(prog, bidx)?;
    }
    Ok(())
}

fn lower_ops(prog: &mut Prog, bidx: BlockIdx) -> Result<(), CompilationError> {
    for idx in prog.blocks[bidx].nodes.clone() {
        if prog.try_node(idx).is_none() {
            continue;
        }
        match prog.node(idx).op {
            Op::Neg => fold_neg(prog, idx)?,
            Op::Rcp => expand_complex(prog, idx, Op::RcpImpl)?,
            Op::Rsqrt => expand_complex(prog, idx, Op::RsqrtImpl)?,
            Op::Exp2 => {
                let x = sole_src(prog, idx)?;
                let pre = prog.insert_before(idx, Op::PreExp2, NodeKind::alu(&[x]))?;
                prog.set_kind(idx, Op::Exp2, NodeKind::alu(&[pre]));
                expand_complex(prog, idx, Op::Exp2Impl)?;
            }
            Op::Log2 => {
                let x = sole_src(prog, idx)?;
                let imp = prog.insert_before(idx, Op::Log2Impl, NodeKind::alu(&[x]))?;
                let c2 = prog.insert_before(idx, Op::Complex2, NodeKind::alu(&[x]))?;
                let c1 = prog.insert_before(idx, Op::Complex1, NodeKind::alu(&[imp, c2, x]))?;
                prog.set_kind(idx, Op::PostLog2, NodeKind::alu(&[c1]));
            }
            _ => (),
        }
    }
    Ok(())
}

fn sole_src(prog: &Prog, idx: NodeIdx) -> Result<NodeIdx, CompilationError> {
    match &prog.node(idx).kind {
        NodeKind::Alu { srcs, .. } if srcs.len() == 1 => Ok(srcs[0].node),
        _ => Err(CompilationError::Malformed(format!(
            "%{}: {} takes exactly one operand",
            idx.index(),
            prog.node(idx).op
        ))),
    }
}

/// Turn `idx`, a single operand operation on `x`, into `complex1(imp(x), complex2(x), x)`.
fn expand_complex(prog: &mut Prog, idx: NodeIdx, imp: Op) -> Result<(), CompilationError> {
    let x = sole_src(prog, idx)?;
    let imp = prog.insert_before(idx, imp, NodeKind::alu(&[x]))?;
    let c2 = prog.insert_before(idx, Op::Complex2, NodeKind::alu(&[x]))?;
    prog.set_kind(idx, Op::Complex1, NodeKind::alu(&[imp, c2, x]));
    Ok(())
}

fn fold_neg(prog: &mut Prog, idx: NodeIdx) -> Result<(), CompilationError> {
    let child = sole_src(prog, idx)?;

    // Negate the child's result if it is ours alone and its encoding allows it.
    let c = prog.node(child);
    if c.op.info().dest_neg && c.succs.len() == 1 {
        if let NodeKind::Alu { dest_neg, .. } = &mut prog.node_mut(child).kind {
            *dest_neg = !*dest_neg;
        }
        prog.replace_uses(idx, child)?;
        return prog.delete(idx);
    }

    // Otherwise fold into each consumer which can negate every operand that reads us.
    for succ in prog.node(idx).data_succs().collect::<Vec<_>>() {
        let node = prog.node_mut(succ);
        let info = node.op.info();
        let NodeKind::Alu { srcs, .. } = &mut node.kind else {
            continue;
        };
        if srcs
            .iter()
            .enumerate()
            .all(|(i, x)| x.node != idx || info.src_neg[i])
        {
            for x in srcs.iter_mut().filter(|x| x.node == idx) {
                x.neg = !x.neg;
            }
            prog.replace_child(succ, idx, child)?;
        }
    }

    if prog.node(idx).data_succs().next().is_none() {
        prog.delete(idx)?;
    }
    Ok(())
}

/// Replace every constant with a `load_uniform` of a fresh constant pool entry. All consumers of a
/// constant share one load; unread constants are deleted.
fn lower_consts(prog: &mut Prog, bidx: BlockIdx) -> Result<(), CompilationError> {
    for idx in prog.blocks[bidx].nodes.clone() {
        let node = prog.node(idx);
        let NodeKind::Const { value } = node.kind else {
            continue;
        };
        if node.data_succs().next().is_some() {
            let k = prog.constants.len();
            let index = u32::try_from(k / 4)
                .ok()
                .and_then(|x| x.checked_add(prog.constant_base))
                .ok_or_else(|| {
                    CompilationError::LimitExceeded("Constant pool is too large".into())
                })?;
            prog.constants.push(value);
            let loc = Loc::Fixed {
                index,
                component: (k % 4) as u8,
            };
            let ld = prog.insert_before(
                idx,
                Op::LoadUniform,
                NodeKind::Load { loc, offset: false },
            )?;
            prog.replace_uses(idx, ld)?;
        }
        prog.delete(idx)?;
    }
    Ok(())
}

/// Make sure that every store's inputs are produced by an ALU slot dedicated to the store, since
/// the two must be issued in the same bundle.
fn lower_store_feeds(prog: &mut Prog, bidx: BlockIdx) -> Result<(), CompilationError> {
    for idx in prog.blocks[bidx].nodes.clone() {
        let node = prog.node(idx);
        if node.op.kind() != OpKind::Store {
            continue;
        }
        let mut children = node
            .kind
            .children()
            .into_iter()
            .map(|(x, _)| x)
            .collect::<Vec<_>>();
        children.dedup();
        for x in children {
            let c = prog.node(x);
            if !c.op.is_alu_slotted() || c.succs.len() != 1 {
                let mov = prog.insert_before(idx, Op::Mov, NodeKind::alu(&[x]))?;
                prog.replace_child(idx, x, mov)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::node::{
        Src,
        test::{assert_mirrored, assert_prog_matches, fixed},
    };

    #[test]
    fn shared_constant() {
        let mut prog = Prog::new(8);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let unused = prog.push_const(b, 3.0).unwrap();
        let c = prog.push_const(b, 2.5).unwrap();
        let m = prog.push_alu(b, Op::Mul, &[a, c]).unwrap();
        let x = prog.push_alu(b, Op::Add, &[m, c]).unwrap();
        prog.push_store(b, Op::StoreVarying, fixed(0, 0), x).unwrap();
        lower(&mut prog).unwrap();
        assert!(prog.try_node(unused).is_none());
        assert_eq!(prog.constants, vec![2.5]);
        assert_mirrored(&prog);
        assert_prog_matches(
            &prog,
            "block0:
  %0: load_attribute 0.x
  %{{ld}}: load_uniform 8.x
  %3: mul %0, %{{ld}}
  %4: add %3, %{{ld}}
  %5: store_varying 0.x, %4
",
        );
    }

    #[test]
    fn constant_pool_layout() {
        let mut prog = Prog::new(2);
        let b = prog.push_block();
        let mut prev = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        for i in 0..6 {
            let c = prog.push_const(b, i as f32).unwrap();
            prev = prog.push_alu(b, Op::Add, &[prev, c]).unwrap();
        }
        lower(&mut prog).unwrap();
        let locs = prog
            .iter_nodes()
            .filter(|(_, x)| x.op == Op::LoadUniform)
            .map(|(_, x)| x.kind.loc().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(
            locs,
            vec![
                fixed(2, 0),
                fixed(2, 1),
                fixed(2, 2),
                fixed(2, 3),
                fixed(3, 0),
                fixed(3, 1)
            ]
        );
    }

    #[test]
    fn neg_into_producer() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let m = prog.push_alu(b, Op::Mul, &[a, a]).unwrap();
        let n = prog.push_alu(b, Op::Neg, &[m]).unwrap();
        let f = prog.push_alu(b, Op::Floor, &[n]).unwrap();
        prog.push_alu(b, Op::Sign, &[f]).unwrap();
        lower(&mut prog).unwrap();
        assert!(prog.try_node(n).is_none());
        assert_mirrored(&prog);
        assert_prog_matches(
            &prog,
            "block0:
  %0: load_attribute 0.x
  %1: mul.neg %0, %0
  %3: floor %1
  %4: sign %3
",
        );
    }

    #[test]
    fn neg_into_consumers() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let f = prog.push_alu(b, Op::Floor, &[a]).unwrap();
        let n = prog.push_alu(b, Op::Neg, &[f]).unwrap();
        let x = prog
            .push_alu_srcs(b, Op::Add, &[Src::negated(n), Src::new(f)], false)
            .unwrap();
        let y = prog.push_alu(b, Op::Mul, &[n, x]).unwrap();
        prog.push_alu(b, Op::Max, &[y, n]).unwrap();
        lower(&mut prog).unwrap();
        // The multiply cannot negate its sources, so the neg survives for it alone.
        assert_eq!(
            prog.node(n).data_succs().collect::<Vec<_>>(),
            vec![y]
        );
        assert_mirrored(&prog);
        assert_prog_matches(
            &prog,
            "block0:
  %0: load_attribute 0.x
  %1: floor %0
  %2: neg %1
  %3: add %1, %1
  %4: mul %2, %3
  %5: max %4, -%1
",
        );
    }

    #[test]
    fn complex_expansion() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let r = prog.push_alu(b, Op::Rcp, &[a]).unwrap();
        let l = prog.push_alu(b, Op::Log2, &[r]).unwrap();
        prog.push_alu(b, Op::Exp2, &[l]).unwrap();
        lower(&mut prog).unwrap();
        assert_mirrored(&prog);
        assert_prog_matches(
            &prog,
            "block0:
  %0: load_attribute 0.x
  %{{ri}}: rcp_impl %0
  %{{rc}}: complex2 %0
  %1: complex1 %{{ri}}, %{{rc}}, %0
  %{{li}}: log2_impl %1
  %{{lc}}: complex2 %1
  %{{l1}}: complex1 %{{li}}, %{{lc}}, %1
  %2: postlog2 %{{l1}}
  %{{p}}: preexp2 %2
  %{{ei}}: exp2_impl %{{p}}
  %{{ec}}: complex2 %{{p}}
  %3: complex1 %{{ei}}, %{{ec}}, %{{p}}
",
        );
    }

    #[test]
    fn store_feeds() {
        let mut prog = Prog::new(0);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let m = prog.push_alu(b, Op::Mul, &[a, a]).unwrap();
        let x = prog.push_alu(b, Op::Add, &[m, a]).unwrap();
        prog.push_store(b, Op::StoreVarying, fixed(0, 0), a).unwrap();
        prog.push_store(b, Op::StoreVarying, fixed(0, 1), m).unwrap();
        prog.push_store(b, Op::StoreVarying, fixed(0, 2), x).unwrap();
        lower(&mut prog).unwrap();
        assert_mirrored(&prog);
        assert_prog_matches(
            &prog,
            "block0:
  %0: load_attribute 0.x
  %1: mul %0, %0
  %2: add %1, %0
  %{{m0}}: mov %0
  %3: store_varying 0.x, %{{m0}}
  %{{m1}}: mov %1
  %4: store_varying 0.y, %{{m1}}
  %5: store_varying 0.z, %2
",
        );
    }

    #[test]
    fn idempotent() {
        let mut prog = Prog::new(4);
        let b = prog.push_block();
        let a = prog.push_load(b, Op::LoadAttribute, fixed(0, 0)).unwrap();
        let c = prog.push_const(b, 0.5).unwrap();
        let n = prog.push_alu(b, Op::Neg, &[c]).unwrap();
        let x = prog.push_alu(b, Op::Add, &[a, n]).unwrap();
        let r = prog.push_alu(b, Op::Rsqrt, &[x]).unwrap();
        let n2 = prog.push_alu(b, Op::Neg, &[r]).unwrap();
        prog.push_store(b, Op::StoreVarying, fixed(0, 0), n2).unwrap();
        lower(&mut prog).unwrap();
        let once = prog.to_string();
        lower(&mut prog).unwrap();
        assert_eq!(once, prog.to_string());
        assert_eq!(prog.constants, vec![0.5]);
    }
}
