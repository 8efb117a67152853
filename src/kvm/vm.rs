//! Virtual Machine creation and memory slot management.
//!
//! This module handles VM-level KVM operations: registering guest memory
//! regions and creating the vCPU.
//!
//! # Memory Regions
//!
//! Guest memory is managed through "memory slots". Each slot maps a range of
//! guest physical addresses to host virtual addresses:
//!
//! ```text
//! Guest Physical          Host Virtual
//! ┌──────────────┐       ┌──────────────┐
//! │ 0x00000000   │ ────► │ mmap'd region│
//! │              │       │              │
//! │ 0x001FFFFF   │       │              │
//! └──────────────┘       └──────────────┘
//!     2 MiB                  2 MiB
//! ```
//!
//! A slot registered with `KVM_MEM_READONLY` turns guest writes into MMIO
//! exits instead of silently landing in memory; the DOS layer uses this to
//! write-protect the interrupt vector table and trampoline page. Guest
//! accesses outside every registered slot also surface as MMIO exits, which
//! the dispatcher treats as fatal.

use super::{KvmError, VcpuFd};
use kvm_bindings::kvm_userspace_memory_region;

/// Wrapper around the KVM VM file descriptor.
///
/// This structure represents a virtual machine and provides methods for:
/// - Registering guest memory regions
/// - Creating the virtual CPU
pub struct VmFd {
    /// The underlying KVM VM file descriptor.
    vm: kvm_ioctls::VmFd,

    /// Whether the host kernel supports `KVM_MEM_READONLY` slots.
    readonly_mem: bool,
}

impl VmFd {
    /// Create a new VmFd wrapper.
    ///
    /// Sets the TSS address (0xfffbd000), which Intel VT-x requires before
    /// vCPUs are created. The address is in an unused region of the guest
    /// physical address space and doesn't need to point at valid memory.
    ///
    /// Note what is *not* set up here: no in-kernel IRQ chip and no PIT.
    /// The DOS dispatcher depends on `HLT` exiting to userspace, and an
    /// in-kernel interrupt controller would swallow those exits.
    pub fn new(vm: kvm_ioctls::VmFd, readonly_mem: bool) -> Result<Self, KvmError> {
        vm.set_tss_address(0xfffb_d000)
            .map_err(KvmError::SetTssAddress)?;

        Ok(Self { vm, readonly_mem })
    }

    /// Whether read-only memory slots can be registered on this host.
    pub fn readonly_mem_supported(&self) -> bool {
        self.readonly_mem
    }

    /// Register a guest memory region with KVM.
    ///
    /// This maps a range of guest physical addresses to a region of host
    /// virtual memory. After registration, guest accesses to these physical
    /// addresses transparently access the host memory.
    ///
    /// # Arguments
    ///
    /// * `slot` - Memory slot number
    /// * `guest_addr` - Starting guest physical address
    /// * `memory_size` - Size of the region in bytes
    /// * `userspace_addr` - Host virtual address of the memory (from mmap)
    /// * `flags` - Slot flags (`KVM_MEM_READONLY` or 0)
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - The host memory region remains valid for the lifetime of the VM
    /// - The memory is not freed while the VM is running
    /// - The region doesn't overlap with other registered regions
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
        flags: u32,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags,
        };

        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    /// Create the virtual CPU.
    ///
    /// The guest stays in real mode for its whole life, so no CPUID or MSR
    /// configuration is applied; KVM's reset state is already a 16-bit CPU.
    pub fn create_vcpu(&self, id: u64) -> Result<VcpuFd, KvmError> {
        let vcpu = self.vm.create_vcpu(id).map_err(KvmError::CreateVcpu)?;
        Ok(VcpuFd::new(vcpu))
    }
}
