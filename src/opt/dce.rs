//! Dead-code elimination, including dead-flag elimination (§4.D pass 1): a `FlagsFromOp` record
//! that nothing ever materializes is removed exactly like any other unused pure value, since the
//! lifter (§4.C) never marks it live itself — only a `MaterializeFlag` read does.

use crate::ir::{BlockExit, IrBlock, OpKind, Ref, NULL_REF};

fn is_side_effecting(op: OpKind) -> bool {
    matches!(
        op,
        OpKind::StoreGpr | OpKind::StoreVector | OpKind::Store | OpKind::GuestCall | OpKind::VZeroUpper
    )
}

/// Computes, for each node index, whether it is transitively reachable from a side-effecting node
/// or a region's exit condition/target.
pub fn mark_live(block: &IrBlock) -> Vec<bool> {
    let mut live = vec![false; block.nodes.len()];
    let mut stack: Vec<Ref> = Vec::new();

    for (i, node) in block.nodes.iter().enumerate() {
        if is_side_effecting(node.op) {
            stack.push(i as Ref);
        }
    }
    for region in &block.regions {
        match region.exit {
            BlockExit::Conditional { cond, .. } => stack.push(cond),
            BlockExit::Indirect { target } => stack.push(target),
            _ => {}
        }
    }

    while let Some(r) = stack.pop() {
        if r == NULL_REF {
            continue;
        }
        let idx = r as usize;
        if live[idx] {
            continue;
        }
        live[idx] = true;
        for operand in block.nodes[idx].operands {
            if operand != NULL_REF {
                stack.push(operand);
            }
        }
    }

    live
}

/// Removes every node `mark_live` did not reach, compacting the arena and remapping every
/// surviving reference (including region node ranges and exit operands) to its new index.
pub fn run(block: &mut IrBlock) {
    let live = mark_live(block);
    let n = block.nodes.len();

    let mut prefix = vec![0u32; n + 1];
    for i in 0..n {
        prefix[i + 1] = prefix[i] + live[i] as u32;
    }
    let remap = |r: Ref| -> Ref {
        if r == NULL_REF {
            NULL_REF
        } else {
            prefix[r as usize]
        }
    };

    let mut new_nodes = Vec::with_capacity(prefix[n] as usize);
    for (i, node) in block.nodes.iter().enumerate() {
        if live[i] {
            let mut node = *node;
            for operand in &mut node.operands {
                *operand = remap(*operand);
            }
            new_nodes.push(node);
        }
    }

    for region in &mut block.regions {
        region.node_range =
            prefix[region.node_range.start as usize]..prefix[region.node_range.end as usize];
        match &mut region.exit {
            BlockExit::Conditional { cond, .. } => *cond = remap(*cond),
            BlockExit::Indirect { target } => *target = remap(*target),
            _ => {}
        }
    }

    block.nodes = new_nodes;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Node, RegClass, Region, VectorMode};

    fn leaf(op: OpKind) -> Node {
        Node {
            op,
            reg_class: RegClass::Gpr,
            element_size: 8,
            num_elements: 1,
            vector_mode: VectorMode::empty(),
            operands: [NULL_REF; 3],
            imm: 0,
        }
    }

    #[test]
    fn drops_an_unread_constant_and_keeps_a_stored_one() {
        let mut block = IrBlock::default();
        let dead = block.push(leaf(OpKind::Constant));
        let _ = dead;
        let kept = block.push_const(5);
        block.push_store_gpr(crate::arch::x86::Register::Rax, kept, 8);
        block.regions.push(Region {
            guest_rip: 0,
            node_range: 0..block.nodes.len() as u32,
            exit: BlockExit::Halt { next_rip: 0 },
        });

        run(&mut block);

        assert_eq!(block.nodes.len(), 2);
    }
}
