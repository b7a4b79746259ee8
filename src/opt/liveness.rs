//! Liveness analysis (§4.D pass 4). The node arena is treated as one linear instruction sequence
//! — a simplification for a multi-region (multiblock) translation unit, where the true control
//! flow between regions can diverge, but which never overestimates a live range's start and only
//! ever widens its end, so [`crate::opt::regalloc`] allocating against it is conservative rather
//! than unsound: a register kept live slightly longer than strictly necessary costs a missed reuse
//! opportunity, never a correctness bug.

use crate::ir::{BlockExit, IrBlock, Ref, NULL_REF};

#[derive(Clone, Copy, Debug)]
pub struct LiveRange {
    pub def: u32,
    pub last_use: u32,
}

pub fn compute(block: &IrBlock) -> Vec<LiveRange> {
    let n = block.nodes.len();
    let mut ranges: Vec<LiveRange> = (0..n as u32).map(|i| LiveRange { def: i, last_use: i }).collect();

    for (i, node) in block.nodes.iter().enumerate() {
        for operand in node.operands {
            if operand != NULL_REF {
                let r = &mut ranges[operand as usize];
                r.last_use = r.last_use.max(i as u32);
            }
        }
    }

    for region in &block.regions {
        let end = region.node_range.end;
        let extend = |ranges: &mut [LiveRange], r: Ref| {
            if r != NULL_REF {
                let lr = &mut ranges[r as usize];
                lr.last_use = lr.last_use.max(end);
            }
        };
        match region.exit {
            BlockExit::Conditional { cond, .. } => extend(&mut ranges, cond),
            BlockExit::Indirect { target } => extend(&mut ranges, target),
            _ => {}
        }
    }

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::OpKind;

    #[test]
    fn last_use_extends_to_the_farthest_reader() {
        let mut block = IrBlock::default();
        let a = block.push_const(1);
        let _b = block.push_const(2);
        let _ = block.push_binop(OpKind::Add, a, a, 8);

        let ranges = compute(&block);
        assert_eq!(ranges[a as usize].last_use, 2);
    }
}
