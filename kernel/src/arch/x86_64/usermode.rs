//! First transition to ring 3
//!
//! Later transitions happen on the tail of trap handling; this is only
//! for the very first process, entered from the boot path. User context
//! is installed by pushing `{ss, rsp, rflags, cs, rip}` and executing
//! `iretq`.

use crate::{kernel, process::ProcessState};

use super::gdt;

/// Enter the current process in ring 3. Returns (and idles) only when no
/// runnable user process exists.
pub fn enter_current() -> ! {
    let context = kernel::with_kernel(|k| {
        let p = k.processes.current()?;
        if p.state != ProcessState::Running {
            return None;
        }
        let space = p.address_space?;
        let regs = p.regs;
        k.vmm.switch_space(space.root);
        Some(regs)
    });

    let Some(regs) = context else {
        log::info!("no runnable user process, idling");
        super::idle_loop();
    };

    let selectors = gdt::selectors();
    let user_cs = selectors.user_code.0 as u64;
    let user_ss = selectors.user_data.0 as u64;

    // SAFETY: the entry point and stack were mapped user-accessible by
    // the loader, CR3 holds the process's address space, and the TSS
    // ring-0 stack is set for the next trap.
    unsafe {
        core::arch::asm!(
            "mov ds, {ss:x}",
            "mov es, {ss:x}",
            "push {ss}",
            "push {rsp}",
            "push {rflags}",
            "push {cs}",
            "push {rip}",
            "iretq",
            ss = in(reg) user_ss,
            rsp = in(reg) regs.rsp,
            rflags = in(reg) 0x202u64,
            cs = in(reg) user_cs,
            rip = in(reg) regs.rip,
            options(noreturn),
        );
    }
}
