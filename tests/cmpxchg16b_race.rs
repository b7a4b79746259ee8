//! §8 scenario 5: two guest threads racing `CMPXCHG16B` against the same 16-byte-aligned
//! location, run through two independent [`Dispatcher`]s on two real OS threads sharing one
//! [`GuestMemoryManager`]. Exactly one observes `ZF=1`; the other observes `ZF=0` with the
//! winner's new value in `RDX:RAX`.

use dbtx::arch::x86::{GuestCpuState, Register};
use dbtx::config::Config;
use dbtx::decoder::Mode;
use dbtx::dispatch::{helpers, BlockCache, CodePool, Dispatcher};
use dbtx::memory::{GuestMemoryManager, GuestProt, SmcMode};
use std::sync::atomic::AtomicI32;

const OLD_LO: u32 = 100;
const OLD_HI: u32 = 0;

/// `mov esi, hi32 ; shl rsi, 32 ; mov edi, lo32 ; or rsi, rdi` assembles `addr` into RSI across
/// two 32-bit halves, since this decoder's `MOV r64, imm32` form only ever sign/zero-extends a
/// 32-bit immediate rather than reading a full 64-bit one.
fn thread_code(addr: u64, new_lo: u32, new_hi: u32) -> Vec<u8> {
    let mut code = Vec::new();
    code.extend_from_slice(&[0xbe]);
    code.extend_from_slice(&((addr >> 32) as u32).to_le_bytes());
    code.extend_from_slice(&[0x48, 0xc1, 0xe6, 0x20]); // shl rsi, 32
    code.extend_from_slice(&[0xbf]);
    code.extend_from_slice(&(addr as u32).to_le_bytes());
    code.extend_from_slice(&[0x48, 0x09, 0xfe]); // or rsi, rdi
    code.extend_from_slice(&[0xb8]);
    code.extend_from_slice(&OLD_LO.to_le_bytes());
    code.extend_from_slice(&[0xba]);
    code.extend_from_slice(&OLD_HI.to_le_bytes());
    code.extend_from_slice(&[0xbb]);
    code.extend_from_slice(&new_lo.to_le_bytes());
    code.extend_from_slice(&[0xb9]);
    code.extend_from_slice(&new_hi.to_le_bytes());
    code.extend_from_slice(&[0x48, 0x0f, 0xc7, 0x0e]); // cmpxchg16b [rsi]
    code.push(0xf4); // hlt
    code
}

struct ThreadResult {
    new_lo: u32,
    zf: u8,
    rax: u64,
    rdx: u64,
}

fn run_thread(mem_addr: usize, entry_rip: u64, rsp: u64, new_lo: u32, new_hi: u32) -> ThreadResult {
    // SAFETY: the manager outlives every spawned thread (joined before this function's caller
    // returns), and no other code takes a `&mut GuestMemoryManager` while these threads run.
    let mem: &GuestMemoryManager = unsafe { &*(mem_addr as *const GuestMemoryManager) };

    let mut cpu = GuestCpuState::default();
    cpu.rip = entry_rip;
    cpu.set_gpr(Register::Rsp, rsp);

    let config = Config::default();
    let pool = CodePool::new();
    let mut cache = BlockCache::new();
    let helper_table = helpers::build_helper_table();
    let pending_signal = AtomicI32::new(0);

    let mut dispatcher = Dispatcher {
        mem,
        config: &config,
        pool: &pool,
        cache: &mut cache,
        helpers: &helper_table,
        mode: Mode::X86_64,
        pending_signal: &pending_signal,
        aot: None,
    };
    dispatcher.run_loop(&mut cpu).unwrap();

    ThreadResult { new_lo, zf: cpu.eflags.zf, rax: cpu.gpr(Register::Rax), rdx: cpu.gpr(Register::Rdx) }
}

#[test]
fn exactly_one_racing_cmpxchg16b_succeeds() {
    let placeholder = thread_code(0, 0, 0).len() as u64;
    let data_offset = 16u64;
    let code_a_offset = data_offset + 16;
    let code_b_offset = code_a_offset + placeholder;
    let total_size = code_b_offset + placeholder;

    let mut mem = GuestMemoryManager::new(SmcMode::Full, false);
    let guest_base = mem.allocate_guest_region(total_size).unwrap();
    mem.intercept_mmap(guest_base, total_size, GuestProt::READ | GuestProt::WRITE | GuestProt::EXECUTE).unwrap();

    let cas_addr = guest_base + data_offset;
    let code_a = thread_code(cas_addr, 111, 0);
    let code_b = thread_code(cas_addr, 222, 0);
    assert_eq!(code_a.len() as u64, placeholder);
    assert_eq!(code_b.len() as u64, placeholder);

    // SAFETY: `guest_base..guest_base + total_size` was just reserved above and is identity-mapped.
    unsafe {
        std::ptr::copy_nonoverlapping(OLD_LO.to_le_bytes().as_ptr(), (cas_addr) as *mut u8, 4);
        std::ptr::copy_nonoverlapping(OLD_HI.to_le_bytes().as_ptr(), (cas_addr + 4) as *mut u8, 4);
        std::ptr::write_bytes((cas_addr + 8) as *mut u8, 0, 8);
        std::ptr::copy_nonoverlapping(code_a.as_ptr(), (guest_base + code_a_offset) as *mut u8, code_a.len());
        std::ptr::copy_nonoverlapping(code_b.as_ptr(), (guest_base + code_b_offset) as *mut u8, code_b.len());
    }

    let stack_size = 64 * 1024;
    let stack_base = mem.allocate_guest_region(stack_size).unwrap();
    mem.intercept_mmap(stack_base, stack_size, GuestProt::READ | GuestProt::WRITE).unwrap();
    let rsp = (stack_base + stack_size - 16) & !0xf;

    let mem_addr = &mem as *const GuestMemoryManager as usize;
    let entry_a = guest_base + code_a_offset;
    let entry_b = guest_base + code_b_offset;

    let handle_a = std::thread::spawn(move || run_thread(mem_addr, entry_a, rsp, 111, 0));
    let handle_b = std::thread::spawn(move || run_thread(mem_addr, entry_b, rsp, 222, 0));
    let result_a = handle_a.join().unwrap();
    let result_b = handle_b.join().unwrap();

    let (winner, loser) = if result_a.zf == 1 { (&result_a, &result_b) } else { (&result_b, &result_a) };
    assert_eq!(winner.zf, 1);
    assert_eq!(loser.zf, 0);
    assert_eq!(loser.rax, winner.new_lo as u64);
    assert_eq!(loser.rdx, 0);

    let mut final_bytes = [0u8; 16];
    mem.read_guest_bytes(cas_addr, &mut final_bytes).unwrap();
    let final_lo = u32::from_le_bytes(final_bytes[0..4].try_into().unwrap());
    assert_eq!(final_lo, winner.new_lo);
}
