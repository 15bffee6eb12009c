//! Physical memory service.
//!
//! The core only ever reaches memory through a physical address produced by
//! `CpuState::translate`. Everything behind that address (RAM, devices,
//! arbitration between cores) belongs to the system bus, so the core talks to
//! it through the `Bus` trait. `Ram` is the flat backing store used by the CLI
//! and by tests.

use crate::error::MemoryError;
use std::collections::HashMap;

pub const RAM_BASE: u64 = 0x0;
pub const DEFAULT_RAM_SIZE: u64 = 256 * 1024 * 1024;

pub trait Bus {
    /// Read `size` bytes (1, 2, 4 or 8) little-endian.
    fn load(&mut self, paddr: u64, size: u64) -> Result<u64, MemoryError>;

    /// Write the low `size` bytes of `value` little-endian.
    fn store(&mut self, paddr: u64, size: u64, value: u64) -> Result<(), MemoryError>;

    /// IOCSR space read (IOCSRRD.*).
    fn iocsr_read(&mut self, addr: u64, size: u64) -> Result<u64, MemoryError>;

    /// IOCSR space write (IOCSRWR.*).
    fn iocsr_write(&mut self, addr: u64, size: u64, value: u64) -> Result<(), MemoryError>;

    fn read_u32(&mut self, paddr: u64) -> Result<u32, MemoryError> {
        self.load(paddr, 4).map(|v| v as u32)
    }

    fn read_u64(&mut self, paddr: u64) -> Result<u64, MemoryError> {
        self.load(paddr, 8)
    }
}

fn check_size(addr: u64, size: u64) -> Result<(), MemoryError> {
    match size {
        1 | 2 | 4 | 8 => Ok(()),
        _ => Err(MemoryError::InvalidSize {
            addr,
            size: size as usize,
        }),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// IOCSR register block
// ═══════════════════════════════════════════════════════════════════════════

pub const IOCSR_FEATURES: u64 = 0x8;
pub const IOCSR_VENDOR: u64 = 0x10;
pub const IOCSR_CPUNAME: u64 = 0x20;

const IOCSRF_CSRIPI: u64 = 1 << 1;
const IOCSRF_EXTIOI: u64 = 1 << 3;
const IOCSRF_CONSTANT_TIMER: u64 = 1 << 7;

/// Minimal IOCSR space: identification words plus plain scratch storage for
/// everything else, so firmware probing the block reads back what it wrote.
#[derive(Debug, Default)]
pub struct IocsrBlock {
    regs: HashMap<u64, u64>,
}

impl IocsrBlock {
    pub fn new() -> Self {
        let mut regs = HashMap::new();
        regs.insert(
            IOCSR_FEATURES,
            IOCSRF_CSRIPI | IOCSRF_EXTIOI | IOCSRF_CONSTANT_TIMER,
        );
        regs.insert(IOCSR_VENDOR, u64::from_le_bytes(*b"Loongson"));
        regs.insert(IOCSR_CPUNAME, u64::from_le_bytes(*b"3A5000\0\0"));
        Self { regs }
    }

    pub fn read(&self, addr: u64, size: u64) -> Result<u64, MemoryError> {
        check_size(addr, size)?;
        let word = self.regs.get(&(addr & !7)).copied().unwrap_or(0);
        let shift = (addr & 7) * 8;
        Ok((word >> shift) & crate::bits::mask64((size * 8) as u32))
    }

    pub fn write(&mut self, addr: u64, size: u64, value: u64) -> Result<(), MemoryError> {
        check_size(addr, size)?;
        match addr & !7 {
            IOCSR_FEATURES | IOCSR_VENDOR | IOCSR_CPUNAME => {
                log::warn!("[BUS] Ignoring IOCSR write to read-only {:#x}", addr);
                Ok(())
            }
            base => {
                let shift = ((addr & 7) * 8) as u32;
                let word = self.regs.entry(base).or_insert(0);
                *word = crate::bits::deposit64(*word, shift, (size * 8) as u32, value);
                Ok(())
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RAM
// ═══════════════════════════════════════════════════════════════════════════

/// Flat little-endian RAM mapped at `base`.
pub struct Ram {
    base: u64,
    data: Vec<u8>,
    iocsr: IocsrBlock,
}

impl Ram {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            data: vec![0; size],
            iocsr: IocsrBlock::new(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn offset(&self, paddr: u64, len: u64) -> Result<usize, MemoryError> {
        let off = paddr
            .checked_sub(self.base)
            .ok_or(MemoryError::OutOfBounds(paddr))?;
        let end = off.checked_add(len).ok_or(MemoryError::OutOfBounds(paddr))?;
        if end > self.data.len() as u64 {
            return Err(MemoryError::OutOfBounds(paddr));
        }
        Ok(off as usize)
    }

    /// Copy an image into RAM (used for loading binaries).
    pub fn write_bytes(&mut self, paddr: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let off = self.offset(paddr, bytes.len() as u64)?;
        self.data[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_bytes(&self, paddr: u64, len: usize) -> Result<&[u8], MemoryError> {
        let off = self.offset(paddr, len as u64)?;
        Ok(&self.data[off..off + len])
    }
}

impl Bus for Ram {
    fn load(&mut self, paddr: u64, size: u64) -> Result<u64, MemoryError> {
        check_size(paddr, size)?;
        let off = self.offset(paddr, size)?;
        let mut value = 0u64;
        for (i, byte) in self.data[off..off + size as usize].iter().enumerate() {
            value |= (*byte as u64) << (i * 8);
        }
        Ok(value)
    }

    fn store(&mut self, paddr: u64, size: u64, value: u64) -> Result<(), MemoryError> {
        check_size(paddr, size)?;
        let off = self.offset(paddr, size)?;
        for (i, byte) in self.data[off..off + size as usize].iter_mut().enumerate() {
            *byte = (value >> (i * 8)) as u8;
        }
        Ok(())
    }

    fn iocsr_read(&mut self, addr: u64, size: u64) -> Result<u64, MemoryError> {
        self.iocsr.read(addr, size)
    }

    fn iocsr_write(&mut self, addr: u64, size: u64, value: u64) -> Result<(), MemoryError> {
        self.iocsr.write(addr, size, value)
    }
}
