//! Guest image loading: ELF PT_LOAD segments or a flat binary.

use crate::bus::Ram;
use goblin::elf::{Elf, program_header::PT_LOAD};

/// What a loaded image asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    /// ELF entry point, or the load address of a flat image
    pub entry: u64,
    /// Lowest and one-past-highest physical byte written
    pub start: u64,
    pub end: u64,
}

/// Copy `image` into `ram`. Flat images land at `load_addr`. ELF segments
/// land at their physical address (virtual when that is zero), truncated to
/// `phys_mask` so kernels linked into a direct-map window load correctly.
pub fn load_image(
    ram: &mut Ram,
    image: &[u8],
    load_addr: u64,
    phys_mask: u64,
) -> Result<LoadedImage, Box<dyn std::error::Error>> {
    if image.starts_with(b"\x7fELF") {
        load_elf_segments(ram, image, phys_mask)
    } else {
        ram.write_bytes(load_addr, image)?;
        log::info!("[LOAD] Raw image: {} bytes at {:#x}", image.len(), load_addr);
        Ok(LoadedImage {
            entry: load_addr,
            start: load_addr,
            end: load_addr + image.len() as u64,
        })
    }
}

fn load_elf_segments(
    ram: &mut Ram,
    image: &[u8],
    phys_mask: u64,
) -> Result<LoadedImage, Box<dyn std::error::Error>> {
    let elf = Elf::parse(image)?;
    if !elf.is_64 {
        return Err("not an ELF64 image".into());
    }

    let mut start = u64::MAX;
    let mut end = 0u64;
    for phdr in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
        let load_addr = if phdr.p_paddr != 0 {
            phdr.p_paddr
        } else {
            phdr.p_vaddr
        } & phys_mask;

        let offset = usize::try_from(phdr.p_offset)?;
        let size = usize::try_from(phdr.p_filesz)?;
        let segment = offset
            .checked_add(size)
            .and_then(|limit| image.get(offset..limit))
            .ok_or("ELF segment outside file")?;
        ram.write_bytes(load_addr, segment)?;

        if phdr.p_memsz > phdr.p_filesz {
            let zeros = vec![0u8; usize::try_from(phdr.p_memsz - phdr.p_filesz)?];
            ram.write_bytes(load_addr + phdr.p_filesz, &zeros)?;
        }
        log::debug!(
            "[LOAD] Segment {:#x}: {} bytes file, {} bytes memory",
            load_addr,
            phdr.p_filesz,
            phdr.p_memsz
        );
        start = start.min(load_addr);
        end = end.max(load_addr + phdr.p_memsz);
    }
    if start == u64::MAX {
        return Err("ELF file has no loadable segments".into());
    }

    log::info!("[LOAD] ELF image {:#x}..{:#x}, entry {:#x}", start, end, elf.entry);
    Ok(LoadedImage {
        entry: elf.entry,
        start,
        end,
    })
}
