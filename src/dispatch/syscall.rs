//! The scoped syscall-instruction retirement table (§2 supplement to §4.F: only enough of the
//! Linux x86-64 syscall surface to run the end-to-end scenarios in §8 — everything else traps).
//!
//! A guest `syscall`/`int 0x80` is not routed through the dispatcher's main loop at all: the
//! lifter emits a [`crate::ir::helper_ids::SYSCALL`] `GuestCall` node immediately before the
//! block's `BlockExit::Syscall` terminator, and [`crate::dispatch::helpers::syscall`] calls
//! straight into [`retire`] with the guest CPU state already in hand.

use crate::arch::x86::{GuestCpuState, Register};

const SYS_WRITE: u64 = 1;
const SYS_EXIT: u64 = 60;
const SYS_EXIT_GROUP: u64 = 231;

/// Executes the syscall named by `cpu.gprs[Rax]`, writing its result back into `Rax` per the x86-64
/// syscall ABI. Anything outside the scoped table returns `-ENOSYS` rather than panicking, so an
/// unimplemented syscall is observable to the guest instead of aborting the translator.
pub fn retire(cpu: &mut GuestCpuState) {
    let nr = cpu.gpr(Register::Rax);
    let result: i64 = match nr {
        SYS_WRITE => {
            let fd = cpu.gpr(Register::Rdi) as i32;
            let buf = cpu.gpr(Register::Rsi) as *const libc::c_void;
            let count = cpu.gpr(Register::Rdx) as usize;
            // SAFETY: guest virtual addresses are identity-mapped into this process
            // (`crate::memory::GuestMemoryManager`), so `buf` is a valid host pointer for `count`
            // bytes whenever the guest's own bounds are respected.
            unsafe { libc::write(fd, buf, count) as i64 }
        }
        SYS_EXIT | SYS_EXIT_GROUP => {
            let code = cpu.gpr(Register::Rdi) as i32;
            tracing::info!(code, "guest process exited");
            std::process::exit(code);
        }
        other => {
            tracing::warn!(syscall = other, "unimplemented syscall, returning -ENOSYS");
            -(libc::ENOSYS as i64)
        }
    };
    cpu.set_gpr(Register::Rax, result as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_syscall_returns_enosys() {
        let mut cpu = GuestCpuState::default();
        cpu.set_gpr(Register::Rax, 9999);
        retire(&mut cpu);
        assert_eq!(cpu.gpr(Register::Rax) as i64, -(libc::ENOSYS as i64));
    }
}
