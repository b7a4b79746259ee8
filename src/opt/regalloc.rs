//! Linear-scan register allocation over two independent banks (§4.D pass 5): GPRs and vector
//! registers. Follows the classic Poletto & Sarkar scan — intervals sorted by start, expire
//! finished intervals on entry, and when the bank is full, evict whichever active interval (the
//! new one included) ends furthest in the future — adapted to run once per bank since the IR
//! already separates GPR- and FPR-class nodes via [`crate::ir::RegClass`].

use crate::ir::{IrBlock, RegClass};
use crate::opt::liveness::{self, LiveRange};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Location {
    Gpr(u8),
    Fpr(u8),
    /// An index into the per-thread scratch spill area at a fixed offset from the CPU state
    /// (§4.D "Spill slots live in a per-thread scratch area at a fixed offset from the CPU
    /// state").
    Spill(u32),
}

/// One [`Location`] per node index; nodes outside the two register classes this allocator knows
/// about (there are none currently — every [`crate::ir::RegClass`] variant is handled) would fall
/// back to `Spill(0)`, which is unreachable today.
#[derive(Clone)]
pub struct Allocation {
    pub locations: Vec<Location>,
}

impl Allocation {
    pub fn location(&self, node: crate::ir::Ref) -> Location {
        self.locations[node as usize]
    }
}

pub fn allocate(block: &IrBlock, num_gpr: u8, num_fpr: u8) -> Allocation {
    let ranges = liveness::compute(block);
    let mut locations = vec![Location::Spill(0); block.nodes.len()];

    allocate_bank(block, &ranges, RegClass::Gpr, num_gpr, &mut locations);
    allocate_bank(block, &ranges, RegClass::Fpr, num_fpr, &mut locations);

    Allocation { locations }
}

fn allocate_bank(
    block: &IrBlock,
    ranges: &[LiveRange],
    class: RegClass,
    num_regs: u8,
    locations: &mut [Location],
) {
    if num_regs == 0 {
        return;
    }

    let mut order: Vec<usize> = (0..block.nodes.len()).filter(|&i| block.nodes[i].reg_class == class).collect();
    order.sort_by_key(|&i| ranges[i].def);

    // (end, physreg, node_index), kept sorted by end ascending so the soonest-to-expire interval
    // is always at the front and the furthest-out one is always at the back.
    let mut active: Vec<(u32, u8, usize)> = Vec::new();
    let mut free: Vec<u8> = (0..num_regs).rev().collect();
    let mut next_spill = 0u32;

    let make_location = |class: RegClass, reg: u8| if class == RegClass::Gpr { Location::Gpr(reg) } else { Location::Fpr(reg) };

    for idx in order {
        let range = ranges[idx];

        let (expired, still_active): (Vec<_>, Vec<_>) = active.into_iter().partition(|&(end, _, _)| end < range.def);
        active = still_active;
        for (_, reg, _) in expired {
            free.push(reg);
        }

        if let Some(reg) = free.pop() {
            locations[idx] = make_location(class, reg);
            active.push((range.last_use, reg, idx));
            active.sort_by_key(|&(end, _, _)| end);
            continue;
        }

        // Bank is full: evict whichever interval (active or the new one) ends furthest away,
        // per the classic linear-scan spill heuristic.
        match active.last().copied() {
            Some((farthest_end, reg, farthest_idx)) if farthest_end > range.last_use => {
                active.pop();
                locations[farthest_idx] = Location::Spill(next_spill);
                next_spill += 1;
                locations[idx] = make_location(class, reg);
                active.push((range.last_use, reg, idx));
                active.sort_by_key(|&(end, _, _)| end);
            }
            _ => {
                locations[idx] = Location::Spill(next_spill);
                next_spill += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86::Register;
    use crate::ir::OpKind;

    #[test]
    fn assigns_disjoint_registers_when_the_bank_is_large_enough() {
        let mut block = IrBlock::default();
        let a = block.push_load_gpr(Register::Rax, 8);
        let b = block.push_load_gpr(Register::Rbx, 8);
        let _sum = block.push_binop(OpKind::Add, a, b, 8);

        let alloc = allocate(&block, 4, 2);
        assert_ne!(alloc.location(a), alloc.location(b));
        assert!(matches!(alloc.location(a), Location::Gpr(_)));
    }

    #[test]
    fn spills_when_the_bank_is_too_small() {
        let mut block = IrBlock::default();
        let a = block.push_load_gpr(Register::Rax, 8);
        let b = block.push_load_gpr(Register::Rbx, 8);
        let c = block.push_load_gpr(Register::Rcx, 8);
        let _sum = block.push_binop(OpKind::Add, a, b, 8);
        let _sum2 = block.push_binop(OpKind::Add, c, c, 8);

        let alloc = allocate(&block, 1, 1);
        let spilled = [a, b, c].iter().filter(|&&r| matches!(alloc.location(r), Location::Spill(_))).count();
        assert!(spilled >= 1);
    }
}
