//! KVM (Kernel-based Virtual Machine) wrapper module.
//!
//! This module provides a safe Rust interface to Linux KVM for running the
//! real-mode DOS guest. The VMM communicates with KVM through ioctls on:
//!
//! - `/dev/kvm` - System-level operations (check capabilities, create VMs)
//! - VM file descriptor - VM-level operations (create vCPUs, set memory)
//! - vCPU file descriptor - vCPU-level operations (run, get/set registers)
//!
//! # Execution Model
//!
//! The vCPU runs in a loop:
//!
//! 1. VMM calls `vcpu.run()` - control transfers to guest
//! 2. Guest executes until a "VM exit" occurs
//! 3. KVM returns control to VMM with exit reason
//! 4. VMM handles the exit (DOS service, I/O, etc.)
//! 5. VMM calls `vcpu.run()` again
//!
//! # Differences From a Full microVM
//!
//! Unlike a Linux-booting VMM, this VM deliberately creates neither an
//! in-kernel IRQ chip nor a PIT. Without an in-kernel interrupt controller
//! every `HLT` the guest executes exits straight to userspace as
//! `KVM_EXIT_HLT`, and that exit is the entire signaling mechanism between
//! the DOS guest and the host: software interrupts land on a page of `HLT`
//! instructions (see `dos::boot`), so each `INT n` becomes a halt exit the
//! dispatcher can decode. CPUID and MSR setup are likewise unnecessary for
//! a 16-bit guest that never leaves real mode.

mod vcpu;
mod vm;

pub use vcpu::{VcpuExit, VcpuFd};
pub use vm::VmFd;

use kvm_ioctls::{Cap, Kvm};
use thiserror::Error;

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open /dev/kvm device.
    ///
    /// This usually means:
    /// - KVM is not available (not running on Linux, or KVM module not loaded)
    /// - Insufficient permissions (user not in kvm group)
    /// - Running in a VM without nested virtualization enabled
    #[error("Failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    /// Failed to create a new VM.
    #[error("Failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    /// Failed to create a vCPU.
    #[error("Failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    /// Failed to register guest memory with KVM.
    #[error("Failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    /// Failed to set TSS address (required for Intel VT-x).
    #[error("Failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    /// Failed to get CPU registers.
    #[error("Failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    /// Failed to set CPU registers.
    #[error("Failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    /// Failed to run vCPU.
    #[error("Failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),
}

/// Open the KVM device and create a new virtual machine.
///
/// This function:
/// 1. Opens `/dev/kvm` to access KVM functionality
/// 2. Probes for `KVM_CAP_READONLY_MEM` (used to write-protect the
///    interrupt trampoline page when available)
/// 3. Creates a new VM and sets its TSS address
///
/// # Returns
///
/// A `VmFd` that can be used to configure memory and create the vCPU.
pub fn create_vm() -> Result<VmFd, KvmError> {
    // Open /dev/kvm
    let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;

    // Read-only memory slots physically enforce immutability of the
    // interrupt vector table; fall back to a single writable slot on
    // kernels without the capability.
    let readonly_mem = kvm.check_extension(Cap::ReadonlyMem);

    // Create the VM
    let vm = kvm.create_vm().map_err(KvmError::CreateVm)?;

    VmFd::new(vm, readonly_mem)
}
