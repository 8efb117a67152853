//! Virtual CPU management and exit classification.
//!
//! This module provides the vCPU abstraction for running guest code. Each
//! call to [`VcpuFd::run`] enters the guest and blocks until the next VM
//! exit, which is translated into the crate's own [`VcpuExit`] so the
//! dispatcher never touches the raw `kvm_run` structure.
//!
//! # Exit Classification
//!
//! The DOS dispatcher only cares about a handful of exit shapes:
//!
//! - **Hlt**: the load-bearing one. Software interrupts in the guest land on
//!   a page of `HLT` instructions, so every DOS service call arrives here.
//! - **IoIn / IoOut**: the guest probed an I/O port. There is no device
//!   model; the payload is consumed (reads filled with zeros) and only the
//!   port number is reported.
//! - **Mmio**: an access outside the registered memory slots, or a write to
//!   the read-only low page. Always a guest bug from our point of view.
//! - Everything else (shutdown, entry failure, internal error) is fatal.
//!
//! # CPU State
//!
//! Register access goes through `kvm_regs` / `kvm_sregs` value snapshots:
//! fetched after an exit, mutated host-side, written back before resume.
//! There is no process-wide register state.

use super::KvmError;
use kvm_bindings::{kvm_regs, kvm_sregs};
use kvm_ioctls::VcpuExit as KvmVcpuExit;

/// Wrapper around the KVM vCPU file descriptor.
pub struct VcpuFd {
    /// The underlying KVM vCPU file descriptor.
    vcpu: kvm_ioctls::VcpuFd,
}

/// Exit reasons from vCPU execution, reduced to what the dispatcher handles.
#[derive(Debug)]
pub enum VcpuExit {
    /// Guest executed HLT.
    ///
    /// Either a synthetic software interrupt (halt inside the trampoline
    /// page) or a genuine halt; the dispatcher tells them apart by CS:IP.
    Hlt,

    /// Guest read from an I/O port. The data buffer was filled with zeros.
    IoIn { port: u16 },

    /// Guest wrote to an I/O port. The data was discarded.
    IoOut { port: u16 },

    /// Guest accessed memory outside the registered slots (or wrote to a
    /// read-only slot).
    Mmio { addr: u64, is_write: bool },

    /// Guest requested shutdown (triple fault or explicit request).
    Shutdown,

    /// KVM internal error occurred.
    InternalError,

    /// Failed to enter guest mode.
    ///
    /// Contains the hardware-specific failure reason code.
    FailEntry(u64),

    /// System event (e.g., S3 sleep, reset).
    ///
    /// Contains the event type code.
    SystemEvent(u32),

    /// Unknown or unhandled exit reason.
    ///
    /// Contains a static description of the exit type.
    Unknown(&'static str),
}

impl VcpuFd {
    /// Create a new VcpuFd wrapper.
    pub fn new(vcpu: kvm_ioctls::VcpuFd) -> Self {
        Self { vcpu }
    }

    /// Get the current general-purpose registers.
    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu.get_regs().map_err(KvmError::GetRegisters)
    }

    /// Set the general-purpose registers.
    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    /// Get the special registers.
    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetRegisters)
    }

    /// Set the special registers.
    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    /// Run the vCPU until the next exit and classify it.
    ///
    /// This is the main execution loop entry point. It:
    /// 1. Enters guest mode (VMRESUME/VMRUN)
    /// 2. Executes guest code until a VM exit
    /// 3. Returns with the exit reason
    ///
    /// I/O port reads must hand *something* back to the guest, so their
    /// buffers are zero-filled here; everything else is reported untouched.
    pub fn run(&mut self) -> Result<VcpuExit, KvmError> {
        match self.vcpu.run().map_err(KvmError::Run)? {
            KvmVcpuExit::IoIn(port, data) => {
                data.fill(0);
                Ok(VcpuExit::IoIn { port })
            }

            KvmVcpuExit::IoOut(port, _) => Ok(VcpuExit::IoOut { port }),

            KvmVcpuExit::MmioRead(addr, data) => {
                data.fill(0);
                Ok(VcpuExit::Mmio {
                    addr,
                    is_write: false,
                })
            }

            KvmVcpuExit::MmioWrite(addr, _) => Ok(VcpuExit::Mmio {
                addr,
                is_write: true,
            }),

            KvmVcpuExit::Hlt => Ok(VcpuExit::Hlt),
            KvmVcpuExit::Shutdown => Ok(VcpuExit::Shutdown),
            KvmVcpuExit::InternalError => Ok(VcpuExit::InternalError),
            KvmVcpuExit::SystemEvent(event, _) => Ok(VcpuExit::SystemEvent(event)),
            KvmVcpuExit::FailEntry(reason, _) => Ok(VcpuExit::FailEntry(reason)),

            // Map known exits to static strings
            KvmVcpuExit::Hypercall(_) => Ok(VcpuExit::Unknown("Hypercall")),
            KvmVcpuExit::Debug(_) => Ok(VcpuExit::Unknown("Debug")),
            KvmVcpuExit::Exception => Ok(VcpuExit::Unknown("Exception")),
            KvmVcpuExit::IrqWindowOpen => Ok(VcpuExit::Unknown("IrqWindowOpen")),
            KvmVcpuExit::Nmi => Ok(VcpuExit::Unknown("Nmi")),
            KvmVcpuExit::Watchdog => Ok(VcpuExit::Unknown("Watchdog")),
            _ => Ok(VcpuExit::Unknown("Other")),
        }
    }
}
