//! The guest memory arena, with checked real-mode address translation.
//!
//! This module wraps `vm_memory::GuestMemoryMmap` to provide the 2 MiB
//! guest physical arena. The vm-memory crate is the standard abstraction
//! used across the rust-vmm ecosystem; the mmap'd region is handed to KVM
//! as the guest's physical memory and simultaneously accessed host-side
//! through this wrapper.
//!
//! # Translation
//!
//! Real-mode addresses are `segment:offset` pairs resolving to the 20-bit
//! linear address `segment * 16 + offset`. [`GuestMemory::translate`] is
//! the single point where such a pair plus an access length is checked
//! against the arena; every DOS service handler and every bootstrap write
//! goes through it, so there is no pointer arithmetic scattered across
//! handlers and a hostile guest cannot steer a transfer outside the arena.
//!
//! There is no concurrent access to fight over: the host only touches the
//! arena while the vCPU is parked in a VM exit.

use super::{layout, DosError};
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

/// The guest physical memory arena.
///
/// A single contiguous, page-aligned 2 MiB region starting at guest
/// physical address 0, allocated with mmap (private, anonymous).
pub struct GuestMemory {
    /// The underlying vm-memory guest memory.
    inner: GuestMemoryMmap,
}

impl GuestMemory {
    /// Allocate the arena.
    ///
    /// A freshly mapped anonymous region is zero-filled, which the
    /// bootstrap sequence relies on for everything it doesn't explicitly
    /// write.
    pub fn new() -> Result<Self, DosError> {
        let regions = vec![(GuestAddress(0), layout::ARENA_SIZE as usize)];

        let inner = GuestMemoryMmap::from_ranges(&regions)
            .map_err(|e| DosError::MemoryAllocation(e.to_string()))?;

        Ok(Self { inner })
    }

    /// Get raw parts for KVM memory slot registration.
    ///
    /// Returns (host_virtual_address, size).
    ///
    /// # Safety
    ///
    /// The returned pointer is valid only while this GuestMemory exists.
    /// Do not free or reallocate the memory.
    pub fn as_raw_parts(&self) -> (u64, u64) {
        // Get the first (and only) region
        let region = self.inner.iter().next().expect("memory has no regions");
        (region.as_ptr() as u64, layout::ARENA_SIZE)
    }

    /// Resolve `segment:offset` plus an access length to a guest physical
    /// address, or fail if any byte of the access would fall outside the
    /// arena.
    pub fn translate(&self, seg: u16, off: u16, len: usize) -> Result<GuestAddress, DosError> {
        let addr = u64::from(seg) * 16 + u64::from(off);
        if addr + len as u64 > layout::ARENA_SIZE {
            return Err(DosError::GuestBounds { seg, off, len });
        }
        Ok(GuestAddress(addr))
    }

    /// Read bytes from `segment:offset` into a buffer.
    pub fn read(&self, seg: u16, off: u16, buf: &mut [u8]) -> Result<(), DosError> {
        let addr = self.translate(seg, off, buf.len())?;
        self.inner
            .read_slice(buf, addr)
            .map_err(|e| DosError::GuestMemory(e.to_string()))
    }

    /// Write bytes at `segment:offset`.
    pub fn write(&self, seg: u16, off: u16, data: &[u8]) -> Result<(), DosError> {
        let addr = self.translate(seg, off, data.len())?;
        self.inner
            .write_slice(data, addr)
            .map_err(|e| DosError::GuestMemory(e.to_string()))
    }

    /// Read a single byte at `segment:offset`.
    pub fn read_u8(&self, seg: u16, off: u16) -> Result<u8, DosError> {
        let mut buf = [0u8; 1];
        self.read(seg, off, &mut buf)?;
        Ok(buf[0])
    }

    /// Read a 16-bit value at `segment:offset` (little-endian).
    pub fn read_u16(&self, seg: u16, off: u16) -> Result<u16, DosError> {
        let mut buf = [0u8; 2];
        self.read(seg, off, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Write a single byte at `segment:offset`.
    pub fn write_u8(&self, seg: u16, off: u16, value: u8) -> Result<(), DosError> {
        self.write(seg, off, &[value])
    }

    /// Write a 16-bit value at `segment:offset` (little-endian).
    pub fn write_u16(&self, seg: u16, off: u16, value: u16) -> Result<(), DosError> {
        self.write(seg, off, &value.to_le_bytes())
    }

    /// Write a 32-bit value at `segment:offset` (little-endian).
    pub fn write_u32(&self, seg: u16, off: u16, value: u32) -> Result<(), DosError> {
        self.write(seg, off, &value.to_le_bytes())
    }
}
