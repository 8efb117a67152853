//! DOS runtime emulation.
//!
//! This module implements just enough of the DOS environment that a flat
//! `.com` executable runs unmodified inside a KVM guest: the Program
//! Segment Prefix (PSP), real-mode segmentation, a magic interrupt vector
//! table that turns every software interrupt into a VM exit, and a small
//! subset of INT 21h / INT 10h / INT 20h / INT 29h services.
//!
//! # Guest Memory Layout
//!
//! The guest physical address space is a single 2 MiB arena:
//!
//! ```text
//! 0x0000_0000 ┌──────────────────┐
//!             │ magic IVT        │ 256 far pointers, all 0040:00nn
//! 0x0000_0400 ├──────────────────┤
//!             │ HLT trampoline   │ 256 × 0xF4
//! 0x0000_0500 ├──────────────────┤
//!             │ (padding)        │ to the read-only page boundary
//! 0x0000_1000 ├──────────────────┤
//!             │ PSP              │ INT 20h, top-of-memory, command tail
//! 0x0000_1100 ├──────────────────┤
//!             │ .com image       │ entry point at offset 0x100
//!             │ ...              │ free DOS memory up to 640 KiB
//! 0x000A_0000 ├──────────────────┤
//!             │ upper memory     │ mapped but unused; absorbs strays
//! 0x0020_0000 └──────────────────┘
//! ```
//!
//! # The Interrupt Trampoline
//!
//! Every IVT entry points into the trampoline page, one byte per vector:
//! `INT n` makes the CPU push FLAGS/CS/IP and jump to `0x0040:n`, where it
//! executes `HLT` and exits the VM with `CS = 0x0040`, `IP = n + 1`. That
//! (selector, IP) pair is the only signal the dispatcher uses to recognize
//! a DOS service call; no guest instruction decoding is ever needed.

mod boot;
mod console;
mod dispatch;
mod memory;
mod psp;
mod services;

pub use boot::{register_memory, setup_arena, setup_vcpu};
pub use console::Console;
pub use dispatch::run;
pub use memory::GuestMemory;

use crate::kvm::KvmError;
use thiserror::Error;

/// Guest physical memory layout constants.
///
/// These are design constants, not tunables: the IVT entries, the trampoline
/// selector, and the dispatcher's synthetic-interrupt check all have to
/// agree on them.
pub mod layout {
    /// Total guest physical memory (2 MiB).
    ///
    /// Far more than conventional DOS memory; everything above 640 KiB is
    /// mapped only so stray accesses stay inside the sandbox instead of
    /// becoming MMIO exits.
    pub const ARENA_SIZE: u64 = 0x0020_0000;

    /// Number of interrupt vectors in the real-mode IVT.
    pub const IVT_ENTRIES: usize = 256;

    /// Segment every IVT entry points at.
    ///
    /// A halt exit with this CS selector is a synthetic software interrupt,
    /// and `IP - 1` is the interrupt number.
    pub const TRAMPOLINE_SEGMENT: u16 = 0x0040;

    /// Physical address of the trampoline page (`TRAMPOLINE_SEGMENT << 4`).
    pub const TRAMPOLINE_BASE: u16 = 0x0400;

    /// The x86 `HLT` opcode; the trampoline page is 256 of these.
    pub const HLT_OPCODE: u8 = 0xF4;

    /// Size of the low memory slot holding the IVT and trampoline.
    ///
    /// Page-aligned so it can be registered as a separate read-only KVM
    /// slot, physically enforcing that the guest cannot retarget its own
    /// interrupt vectors.
    pub const LOW_SLOT_SIZE: u64 = 0x1000;

    /// Paragraph (16-byte unit) of the PSP; the program segment base is
    /// `PSP_PARA * 16`, directly above the read-only low slot.
    pub const PSP_PARA: u16 = 0x0100;

    /// Image load offset and entry IP within the program segment, per the
    /// `.com` format.
    pub const COM_ENTRY: u16 = 0x0100;

    /// First paragraph past conventional DOS memory (640 KiB).
    pub const TOP_OF_MEMORY_PARA: u16 = 0xA000;

    /// Largest loadable `.com` image: conventional memory minus the PSP
    /// segment base and the PSP itself.
    pub const MAX_IMAGE_SIZE: usize =
        0xA0000 - (PSP_PARA as usize) * 16 - COM_ENTRY as usize;

    /// Initial 16-bit stack pointer, at the top of the program segment.
    pub const INITIAL_SP: u16 = 0xFFFE;
}

/// Errors that can occur while setting up or running the DOS guest.
///
/// Every variant is fatal to the emulator (the binary maps them all to exit
/// code 252). Guest-visible service errors are *not* represented here; they
/// travel back to the guest as CF=1 plus a DOS error code in AX.
#[derive(Error, Debug)]
pub enum DosError {
    /// Failed to allocate the guest memory arena.
    #[error("Failed to allocate guest memory: {0}")]
    MemoryAllocation(String),

    /// A guest memory access failed inside vm-memory despite passing the
    /// arena bounds check.
    #[error("Guest memory access failed: {0}")]
    GuestMemory(String),

    /// The `.com` image does not fit below conventional-memory top.
    #[error("Program image too large: {size} bytes (max {max})")]
    ImageTooLarge { size: usize, max: usize },

    /// The encoded command tail does not fit in the PSP.
    #[error("Command line too long: {len} bytes (max {max})")]
    CommandLineTooLong { len: usize, max: usize },

    /// A segment:offset range fell outside the 2 MiB arena.
    #[error("Guest address {seg:#06x}:{off:#06x}+{len:#x} is out of bounds")]
    GuestBounds { seg: u16, off: u16, len: usize },

    /// An INT 21h/09h string scan wrapped the 16-bit offset without
    /// finding its `$` terminator.
    #[error("Unterminated $-string starting at {seg:#06x}:{off:#06x}")]
    StringUnterminated { seg: u16, off: u16 },

    /// The guest invoked a DOS/BIOS service outside the supported subset.
    #[error("Unhandled service: int {int:#04x}, ah={ah:#04x}")]
    UnhandledService { int: u8, ah: u8 },

    /// The guest executed a real `HLT` (outside the interrupt trampoline).
    #[error("Guest halted outside the interrupt trampoline at {cs:#06x}:{ip:#06x}")]
    UnexpectedHalt { cs: u16, ip: u64 },

    /// The guest touched unmapped memory or wrote to the read-only low page.
    #[error("Unmapped guest memory access at {addr:#x} (write: {is_write})")]
    UnmappedAccess { addr: u64, is_write: bool },

    /// A VM exit the dispatcher has no policy for.
    #[error("Unexpected VM exit: {0}")]
    UnexpectedExit(String),

    /// A KVM operation failed mid-run.
    #[error("KVM error: {0}")]
    Kvm(#[from] KvmError),
}
