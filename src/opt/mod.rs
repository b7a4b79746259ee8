//! The IR optimizer and linear-scan register allocator (§4.D), run once per translation unit
//! between the lifter and the code generator.
//!
//! Passes run in the order named by §4.D, with one addition: dead-code elimination runs both
//! before and after redundant-move elimination. Running DCE first lets constant-folding and
//! move-elimination see a smaller graph; running it again afterward sweeps up the `Move` nodes
//! that move elimination redirects around but does not itself delete.

pub mod constprop;
pub mod dce;
pub mod liveness;
pub mod redundant_move;
pub mod regalloc;

use crate::ir::IrBlock;
pub use regalloc::{Allocation, Location};

/// Runs every optimizer pass and the register allocator, returning the final physical-register/
/// spill-slot assignment (§4.D invariant: "every IR node post-allocation has an assigned physical
/// register or spill slot").
pub fn optimize(block: &mut IrBlock, num_gpr: u8, num_fpr: u8) -> Allocation {
    dce::run(block);
    constprop::run(block);
    redundant_move::run(block);
    dce::run(block);
    regalloc::allocate(block, num_gpr, num_fpr)
}
