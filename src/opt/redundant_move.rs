//! Redundant-move elimination (§4.D pass 3). The lifter's register-read cache (§4.C) emits a
//! full-width `LoadGpr` even for a narrow read, then truncates with a `Move`; when that `Move`
//! does not actually narrow anything (`element_size == 8`) it is a pure no-op copy, and every
//! reference to it is redirected straight to its source. The `Move` nodes themselves are left
//! behind for [`crate::opt::dce`] to sweep up on the next pass.

use crate::ir::{BlockExit, IrBlock, OpKind, Ref, NULL_REF};

pub fn run(block: &mut IrBlock) {
    let mut redirect = vec![NULL_REF; block.nodes.len()];
    for (i, node) in block.nodes.iter().enumerate() {
        if node.op == OpKind::Move && node.element_size == 8 {
            redirect[i] = node.operands[0];
        }
    }

    let resolve = |redirect: &[Ref], mut r: Ref| -> Ref {
        let mut steps = 0;
        while r != NULL_REF && redirect[r as usize] != NULL_REF && steps < redirect.len() {
            r = redirect[r as usize];
            steps += 1;
        }
        r
    };

    for node in &mut block.nodes {
        for operand in &mut node.operands {
            *operand = resolve(&redirect, *operand);
        }
    }

    for region in &mut block.regions {
        match &mut region.exit {
            BlockExit::Conditional { cond, .. } => *cond = resolve(&redirect, *cond),
            BlockExit::Indirect { target } => *target = resolve(&redirect, *target),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86::Register;

    #[test]
    fn redirects_through_a_full_width_move() {
        let mut block = IrBlock::default();
        let loaded = block.push_load_gpr(Register::Rax, 8);
        let moved = block.push_unop(OpKind::Move, loaded, 8);
        let stored = block.push_store_gpr(Register::Rbx, moved, 8);

        run(&mut block);

        assert_eq!(block.nodes[stored as usize].operands[0], loaded);
    }
}
