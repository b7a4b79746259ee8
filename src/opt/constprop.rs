//! Constant propagation and folding (§4.D pass 2): rewrites an arithmetic node whose inputs are
//! both already `Constant` nodes into a `Constant` node itself, truncated to the op's element
//! size the same way the arithmetic would have been at runtime.

use crate::ir::{IrBlock, Node, OpKind, Ref, NULL_REF};

fn const_value(block: &IrBlock, r: Ref) -> Option<u64> {
    if r == NULL_REF {
        return None;
    }
    let node = &block.nodes[r as usize];
    (node.op == OpKind::Constant).then(|| block.consts[node.imm as usize])
}

fn truncate_mask(size: u8) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size as u32 * 8)) - 1
    }
}

fn fold_binop(block: &IrBlock, node: &Node) -> Option<u64> {
    let lhs = const_value(block, node.operands[0])?;
    let rhs = const_value(block, node.operands[1])?;
    let result = match node.op {
        OpKind::Add => lhs.wrapping_add(rhs),
        OpKind::Sub => lhs.wrapping_sub(rhs),
        OpKind::And => lhs & rhs,
        OpKind::Or => lhs | rhs,
        OpKind::Xor => lhs ^ rhs,
        OpKind::Shl => lhs.wrapping_shl(rhs as u32),
        OpKind::Shr => lhs.wrapping_shr(rhs as u32),
        OpKind::Sar => ((lhs as i64).wrapping_shr(rhs as u32)) as u64,
        OpKind::Mul => lhs.wrapping_mul(rhs),
        _ => return None,
    };
    Some(result & truncate_mask(node.element_size))
}

fn fold_unop(block: &IrBlock, node: &Node) -> Option<u64> {
    let src = const_value(block, node.operands[0])?;
    let mask = truncate_mask(node.element_size);
    let result = match node.op {
        OpKind::Neg => (src as i64).wrapping_neg() as u64,
        OpKind::Not => !src,
        OpKind::Move => src,
        _ => return None,
    };
    Some(result & mask)
}

pub fn run(block: &mut IrBlock) {
    for i in 0..block.nodes.len() {
        let node = block.nodes[i];
        let folded = match node.op {
            OpKind::Add
            | OpKind::Sub
            | OpKind::And
            | OpKind::Or
            | OpKind::Xor
            | OpKind::Shl
            | OpKind::Shr
            | OpKind::Sar
            | OpKind::Mul => fold_binop(block, &node),
            OpKind::Neg | OpKind::Not | OpKind::Move => fold_unop(block, &node),
            _ => None,
        };

        if let Some(value) = folded {
            let const_idx = block.consts.len() as u32;
            block.consts.push(value);
            let n = &mut block.nodes[i];
            n.op = OpKind::Constant;
            n.imm = const_idx;
            n.operands = [NULL_REF; 3];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_constant_addition() {
        let mut block = IrBlock::default();
        let a = block.push_const(2);
        let b = block.push_const(3);
        let sum = block.push_binop(OpKind::Add, a, b, 8);

        run(&mut block);

        assert_eq!(block.nodes[sum as usize].op, OpKind::Constant);
        let idx = block.nodes[sum as usize].imm as usize;
        assert_eq!(block.consts[idx], 5);
    }

    #[test]
    fn does_not_fold_when_an_input_is_not_constant() {
        let mut block = IrBlock::default();
        let a = block.push_load_gpr(crate::arch::x86::Register::Rax, 8);
        let b = block.push_const(3);
        let sum = block.push_binop(OpKind::Add, a, b, 8);

        run(&mut block);

        assert_eq!(block.nodes[sum as usize].op, OpKind::Add);
    }
}
