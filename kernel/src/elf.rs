//! ELF64 program loading
//!
//! Validates an ELF64 `ET_EXEC` image, maps every `PT_LOAD` segment into
//! a freshly created user address space with permissions derived from the
//! segment flags, and places a 64 KiB user stack just below the top of
//! the user address range. Any `p_memsz` tail beyond `p_filesz` is zero
//! implicitly because freshly allocated frames are zeroed.

use crate::{
    error::{KernelError, KernelResult},
    mm::{
        AddressSpace, FrameAllocator, PageFlags, PhysicalAddress, VirtualAddress, Vmm, PAGE_SIZE,
        USER_STACK_SIZE, USER_STACK_TOP,
    },
};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ET_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;
const PF_W: u32 = 2;

/// ELF file header size.
pub const EHDR_SIZE: usize = 64;
/// Program header size.
pub const PHDR_SIZE: usize = 56;

/// The handful of ELF header fields the loader consumes.
#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

/// One program header.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

/// A loaded user image: entry point, address space, initial stack.
pub struct LoadedImage {
    pub entry: u64,
    pub stack_top: u64,
    pub space: AddressSpace,
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Validate the file header: magic, 64-bit class, executable type.
pub fn parse_header(image: &[u8]) -> KernelResult<ElfHeader> {
    if image.len() < EHDR_SIZE {
        return Err(KernelError::InvalidArgument {
            name: "image",
            value: "shorter than an ELF header",
        });
    }
    if image[0..4] != ELF_MAGIC {
        return Err(KernelError::InvalidArgument {
            name: "image",
            value: "bad ELF magic",
        });
    }
    if image[4] != ELF_CLASS_64 {
        return Err(KernelError::InvalidArgument {
            name: "image",
            value: "not a 64-bit ELF",
        });
    }
    if read_u16(image, 16) != ET_EXEC {
        return Err(KernelError::InvalidArgument {
            name: "image",
            value: "not an executable (ET_EXEC)",
        });
    }
    Ok(ElfHeader {
        entry: read_u64(image, 24),
        phoff: read_u64(image, 32),
        phentsize: read_u16(image, 54),
        phnum: read_u16(image, 56),
    })
}

/// Parse the program header at `offset`.
pub fn parse_program_header(image: &[u8], offset: usize) -> KernelResult<ProgramHeader> {
    if offset + PHDR_SIZE > image.len() {
        return Err(KernelError::InvalidArgument {
            name: "image",
            value: "program header out of bounds",
        });
    }
    Ok(ProgramHeader {
        p_type: read_u32(image, offset),
        p_flags: read_u32(image, offset + 4),
        p_offset: read_u64(image, offset + 8),
        p_vaddr: read_u64(image, offset + 16),
        p_filesz: read_u64(image, offset + 32),
        p_memsz: read_u64(image, offset + 40),
    })
}

/// Write bytes into a (possibly read-only) mapping of `space` through the
/// physical window, page by page.
fn write_to_space(
    vmm: &Vmm,
    space: &AddressSpace,
    mut vaddr: u64,
    mut data: &[u8],
) -> KernelResult<()> {
    while !data.is_empty() {
        let in_page = PAGE_SIZE - (vaddr as usize & (PAGE_SIZE - 1));
        let take = in_page.min(data.len());
        let phys: PhysicalAddress = vmm
            .translate_in(space.root, VirtualAddress::new(vaddr))
            .ok_or(KernelError::UnmappedMemory { addr: vaddr })?;
        // SAFETY: the page was just mapped by the loader and no other
        // reference into the frame exists yet.
        unsafe { vmm.window().bytes_mut(phys, take) }.copy_from_slice(&data[..take]);
        vaddr += take as u64;
        data = &data[take..];
    }
    Ok(())
}

/// Build a user address space from an ELF64 image.
///
/// On failure the partially built space is torn down and every frame
/// returned to the allocator.
pub fn load_image(
    vmm: &mut Vmm,
    pmm: &mut FrameAllocator,
    image: &[u8],
) -> KernelResult<LoadedImage> {
    let header = parse_header(image)?;
    let space = vmm.create_user_space(pmm)?;

    let result = (|| -> KernelResult<()> {
        for i in 0..header.phnum {
            let offset = header.phoff as usize + i as usize * header.phentsize as usize;
            let phdr = parse_program_header(image, offset)?;
            if phdr.p_type != PT_LOAD {
                continue;
            }
            if phdr.p_offset + phdr.p_filesz > image.len() as u64 {
                return Err(KernelError::InvalidArgument {
                    name: "image",
                    value: "segment data out of bounds",
                });
            }

            let mut flags = PageFlags::USER;
            if phdr.p_flags & PF_W != 0 {
                flags |= PageFlags::WRITABLE;
            }

            let vaddr_aligned = phdr.p_vaddr & !(PAGE_SIZE as u64 - 1);
            let span = (phdr.p_vaddr - vaddr_aligned) + phdr.p_memsz;
            let page_count = span.div_ceil(PAGE_SIZE as u64);
            for page in 0..page_count {
                let vaddr = vaddr_aligned + page * PAGE_SIZE as u64;
                vmm.alloc_user_page(&space, VirtualAddress::new(vaddr), flags, pmm)?;
            }

            let file_bytes =
                &image[phdr.p_offset as usize..(phdr.p_offset + phdr.p_filesz) as usize];
            write_to_space(vmm, &space, phdr.p_vaddr, file_bytes)?;
        }

        // 64 KiB stack directly below the top of the user range.
        let stack_bottom = USER_STACK_TOP - USER_STACK_SIZE;
        let mut vaddr = stack_bottom;
        while vaddr < USER_STACK_TOP {
            vmm.alloc_user_page(
                &space,
                VirtualAddress::new(vaddr),
                PageFlags::WRITABLE | PageFlags::USER,
                pmm,
            )?;
            vaddr += PAGE_SIZE as u64;
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(LoadedImage {
            entry: header.entry,
            stack_top: USER_STACK_TOP - 16,
            space,
        }),
        Err(e) => {
            vmm.destroy_user_space(&space, pmm);
            Err(e)
        }
    }
}
