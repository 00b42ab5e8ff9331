//! Global Descriptor Table and TSS
//!
//! Layout:
//! - 0x00: null descriptor
//! - 0x08: kernel code (ring 0)
//! - 0x10: kernel data (ring 0)
//! - 0x18: TSS (two entries)
//! - 0x28: user data (ring 3, selector 0x2B with RPL)
//! - 0x30: user code (ring 3, selector 0x33 with RPL)
//!
//! The TSS ring-0 stack pointer is retargeted to the running process's
//! kernel stack at every context switch.

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const BOOT_STACK_SIZE: usize = 4096 * 5;

#[repr(align(16))]
struct AlignedStack([u8; BOOT_STACK_SIZE]);

/// Ring-0 stack used until the first process provides its own.
static mut BOOT_KERNEL_STACK: AlignedStack = AlignedStack([0; BOOT_STACK_SIZE]);

/// Dedicated stack for double faults.
static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; BOOT_STACK_SIZE]);

/// The TSS lives in a static mut so the privilege-0 stack slot can be
/// rewritten at context switches after the GDT referencing it is loaded.
static mut TSS: TaskStateSegment = TaskStateSegment::new();

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub tss: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        // SAFETY: single-threaded boot path; the TSS is written once here
        // before the GDT referencing it is built, and later only through
        // set_kernel_stack with interrupts disabled.
        unsafe {
            let tss = &mut *core::ptr::addr_of_mut!(TSS);
            let boot_stack = core::ptr::addr_of!(BOOT_KERNEL_STACK);
            tss.privilege_stack_table[0] =
                VirtAddr::from_ptr(boot_stack) + BOOT_STACK_SIZE as u64;
            let df_stack = core::ptr::addr_of!(DOUBLE_FAULT_STACK);
            tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
                VirtAddr::from_ptr(df_stack) + BOOT_STACK_SIZE as u64;
        }

        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        // SAFETY: TSS is 'static; the reference never moves.
        let tss_ref = unsafe { &*core::ptr::addr_of!(TSS) };
        let tss = gdt.append(Descriptor::tss_segment(tss_ref));
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                tss,
                user_data,
                user_code,
            },
        )
    };
}

pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Point the TSS ring-0 stack at `stack_top` for the next ring
/// transition.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: the slot is only read by the CPU during a ring transition;
    // callers run with interrupts disabled so no transition races the
    // write.
    unsafe {
        (*core::ptr::addr_of_mut!(TSS)).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS, ES, SS},
        tables::load_tss,
    };

    GDT.0.load();
    // SAFETY: the selectors reference descriptors in the GDT loaded just
    // above.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
    log::info!("GDT and TSS loaded");
}
