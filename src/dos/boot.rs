//! Guest bootstrap: interrupt trampoline, program image, and initial CPU state.
//!
//! Order matters here. The arena starts zero-filled; the bootstrap then
//! lays down, in sequence:
//!
//! 1. The magic interrupt vector table: 256 far pointers, every one aimed
//!    at `0x0040:n` inside the trampoline page.
//! 2. The trampoline page itself: 256 `HLT` instructions. Any `INT n` the
//!    guest raises therefore halts one byte into the page, and the halt
//!    exit's `CS:IP` encodes the interrupt number.
//! 3. The `.com` image at offset 0x100 of the program segment.
//! 4. The PSP below the image (see `psp`).
//! 5. A zero word at the initial `SS:SP`, so a program that ends with a
//!    plain `RET` "returns" to PSP offset 0 and executes `INT 20h`.
//!
//! Register state mirrors DOS program entry: all segment registers equal
//! the PSP paragraph, SP at the top of the segment, IP at 0x100.

use super::memory::GuestMemory;
use super::{layout, psp, DosError};
use crate::kvm::{VcpuFd, VmFd};
use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs, KVM_MEM_READONLY};

/// The reserved, always-set bit 1 of FLAGS.
const RFLAGS_RESERVED: u64 = 0x2;

/// Write the magic IVT: entry `n` is the far pointer `0x0040:n`.
fn write_ivt(mem: &GuestMemory) -> Result<(), DosError> {
    for n in 0..layout::IVT_ENTRIES {
        let entry = (u32::from(layout::TRAMPOLINE_SEGMENT) << 16) | n as u32;
        mem.write_u32(0, (4 * n) as u16, entry)?;
    }
    Ok(())
}

/// Fill the trampoline page with `HLT`, one byte per interrupt vector.
fn write_trampoline(mem: &GuestMemory) -> Result<(), DosError> {
    mem.write(
        0,
        layout::TRAMPOLINE_BASE,
        &[layout::HLT_OPCODE; layout::IVT_ENTRIES],
    )
}

/// Copy the flat `.com` image to its canonical load address.
fn load_image(mem: &GuestMemory, image: &[u8]) -> Result<(), DosError> {
    if image.len() > layout::MAX_IMAGE_SIZE {
        return Err(DosError::ImageTooLarge {
            size: image.len(),
            max: layout::MAX_IMAGE_SIZE,
        });
    }
    mem.write(layout::PSP_PARA, layout::COM_ENTRY, image)
}

/// Populate the arena: IVT, trampoline, program image, PSP, stack sentinel.
pub fn setup_arena(mem: &GuestMemory, image: &[u8], args: &[String]) -> Result<(), DosError> {
    write_ivt(mem)?;
    write_trampoline(mem)?;
    load_image(mem, image)?;
    psp::build_psp(mem, args)?;

    // Return address for a final RET: PSP offset 0 holds INT 20h.
    mem.write_u16(layout::PSP_PARA, layout::INITIAL_SP, 0)?;

    Ok(())
}

/// Register the arena with KVM.
///
/// When the host supports read-only slots, the first page (IVT and
/// trampoline) is registered read-only so guest writes to it become MMIO
/// exits rather than silently corrupting the interrupt machinery; the rest
/// of the arena is a second, writable slot. Otherwise one writable slot
/// covers everything and the trampoline is only logically immutable.
pub fn register_memory(vm: &VmFd, mem: &GuestMemory) -> Result<(), DosError> {
    let (host_addr, size) = mem.as_raw_parts();

    if vm.readonly_mem_supported() {
        unsafe {
            vm.set_user_memory_region(0, 0, layout::LOW_SLOT_SIZE, host_addr, KVM_MEM_READONLY)?;
            vm.set_user_memory_region(
                1,
                layout::LOW_SLOT_SIZE,
                size - layout::LOW_SLOT_SIZE,
                host_addr + layout::LOW_SLOT_SIZE,
                0,
            )?;
        }
    } else {
        unsafe {
            vm.set_user_memory_region(0, 0, size, host_addr, 0)?;
        }
    }

    Ok(())
}

/// A real-mode segment: base is always `selector << 4`.
fn real_mode_segment(selector: u16, template: &kvm_segment) -> kvm_segment {
    kvm_segment {
        selector,
        base: u64::from(selector) << 4,
        limit: 0xFFFF,
        ..*template
    }
}

/// Initial general registers for `.com` entry.
fn initial_regs() -> kvm_regs {
    kvm_regs {
        rip: u64::from(layout::COM_ENTRY),
        rsp: u64::from(layout::INITIAL_SP),
        rflags: RFLAGS_RESERVED,
        ..Default::default()
    }
}

/// Initial segment registers: CS=DS=ES=FS=GS=SS at the PSP paragraph.
///
/// Starts from the vCPU's reset-state sregs so descriptor attributes KVM
/// expects for real mode are preserved; only selector, base, and limit
/// change.
fn initial_sregs(mut sregs: kvm_sregs) -> kvm_sregs {
    let seg = layout::PSP_PARA;
    sregs.cs = real_mode_segment(seg, &sregs.cs);
    sregs.ds = real_mode_segment(seg, &sregs.ds);
    sregs.es = real_mode_segment(seg, &sregs.es);
    sregs.fs = real_mode_segment(seg, &sregs.fs);
    sregs.gs = real_mode_segment(seg, &sregs.gs);
    sregs.ss = real_mode_segment(seg, &sregs.ss);
    sregs
}

/// Apply the initial register state to the vCPU.
pub fn setup_vcpu(vcpu: &VcpuFd) -> Result<(), DosError> {
    let sregs = vcpu.get_sregs()?;
    vcpu.set_sregs(&initial_sregs(sregs))?;
    vcpu.set_regs(&initial_regs())?;
    Ok(())
}
