//! The VM-exit dispatch loop.
//!
//! This is the host half of the guest-host protocol. Each iteration resumes
//! the vCPU, blocks until the next exit, and classifies it:
//!
//! - A halt inside the trampoline page is a synthetic software interrupt:
//!   the interrupt number is `IP - 1`, the hardware-pushed return frame
//!   (IP, CS, FLAGS) sits at `SS:SP`, and AH selects the DOS subfunction.
//!   After the service handler runs, the dispatcher synthesizes the `IRET`:
//!   CS:IP come back from the frame and SP advances past the three pushed
//!   words.
//! - A halt anywhere else is the guest genuinely stopping: fatal.
//! - I/O port accesses are absorbed with a one-second throttle; there is no
//!   device model, and the sleep keeps port-polling loops from spinning.
//! - MMIO (unmapped memory, or a write to the read-only vector page) and
//!   every remaining exit reason are fatal.
//!
//! FLAGS are deliberately *not* reloaded from the interrupt frame: the
//! carry flag a handler leaves behind is the error/success report the
//! guest inspects after `INT 21h`, and restoring the pushed FLAGS image
//! would erase it.

use std::thread;
use std::time::Duration;

use super::console::Console;
use super::memory::GuestMemory;
use super::services::{self, ServiceOutcome};
use super::{layout, DosError};
use crate::kvm::{VcpuExit, VcpuFd};
use kvm_bindings::{kvm_regs, kvm_sregs};

/// Throttle for I/O port probing; no device model is provided.
const IO_PORT_THROTTLE: Duration = Duration::from_secs(1);

/// Bytes popped by the synthesized IRET: IP, CS, and FLAGS.
const IRET_FRAME_SIZE: u16 = 6;

/// The hardware-pushed interrupt return frame at `SS:SP`.
struct ReturnFrame {
    ip: u16,
    cs: u16,
}

/// Run the guest to completion and return its DOS exit status.
pub fn run(
    vcpu: &mut VcpuFd,
    mem: &GuestMemory,
    console: &mut Console,
    trace: bool,
) -> Result<u8, DosError> {
    loop {
        match vcpu.run()? {
            VcpuExit::Hlt => {
                let mut regs = vcpu.get_regs()?;
                let mut sregs = vcpu.get_sregs()?;

                let int = synthetic_int(&regs, &sregs).ok_or(DosError::UnexpectedHalt {
                    cs: sregs.cs.selector,
                    ip: regs.rip,
                })?;

                let frame = read_return_frame(&regs, &sregs, mem)?;

                if trace {
                    eprintln!(
                        "[DOS] int {:#04x} ah={:#04x} from {:#06x}:{:#06x} sp={:#06x}",
                        int,
                        (regs.rax >> 8) as u8,
                        frame.cs,
                        frame.ip,
                        regs.rsp as u16,
                    );
                }

                match services::handle_interrupt(int, &mut regs, &sregs, mem, console)? {
                    ServiceOutcome::Exit(status) => return Ok(status),
                    ServiceOutcome::Continue => {}
                }

                apply_return_frame(&mut regs, &mut sregs, &frame);
                vcpu.set_regs(&regs)?;
                vcpu.set_sregs(&sregs)?;
            }

            VcpuExit::IoIn { port } | VcpuExit::IoOut { port } => {
                if trace {
                    eprintln!("[DOS] i/o port {port:#06x} access, throttling");
                }
                thread::sleep(IO_PORT_THROTTLE);
            }

            VcpuExit::Mmio { addr, is_write } => {
                return Err(DosError::UnmappedAccess { addr, is_write });
            }

            VcpuExit::Shutdown => {
                return Err(DosError::UnexpectedExit("guest shutdown".into()));
            }

            VcpuExit::InternalError => {
                return Err(DosError::UnexpectedExit("KVM internal error".into()));
            }

            VcpuExit::FailEntry(reason) => {
                return Err(DosError::UnexpectedExit(format!(
                    "failed VM entry (hardware reason {reason:#x})"
                )));
            }

            VcpuExit::SystemEvent(event) => {
                return Err(DosError::UnexpectedExit(format!(
                    "system event {event}"
                )));
            }

            VcpuExit::Unknown(what) => {
                return Err(DosError::UnexpectedExit(format!("unhandled exit: {what}")));
            }
        }
    }
}

/// Recognize a halt inside the trampoline page as `INT n`.
///
/// The halt exit leaves IP one past the `HLT` byte, so the interrupt
/// number is `IP - 1`; the selector check rejects programs that happen to
/// execute their own `HLT`.
fn synthetic_int(regs: &kvm_regs, sregs: &kvm_sregs) -> Option<u8> {
    if sregs.cs.selector != layout::TRAMPOLINE_SEGMENT {
        return None;
    }
    if regs.rip == 0 || regs.rip > layout::IVT_ENTRIES as u64 {
        return None;
    }
    Some((regs.rip - 1) as u8)
}

/// Read the interrupt return frame the CPU pushed at `SS:SP`.
fn read_return_frame(
    regs: &kvm_regs,
    sregs: &kvm_sregs,
    mem: &GuestMemory,
) -> Result<ReturnFrame, DosError> {
    let ss = sregs.ss.selector;
    let sp = regs.rsp as u16;
    Ok(ReturnFrame {
        ip: mem.read_u16(ss, sp)?,
        cs: mem.read_u16(ss, sp.wrapping_add(2))?,
    })
}

/// Synthesize the IRET: restore CS:IP from the frame and pop it.
///
/// The FLAGS word at `SP + 4` is left on the dead side of the stack and
/// not reloaded; see the module docs.
fn apply_return_frame(regs: &mut kvm_regs, sregs: &mut kvm_sregs, frame: &ReturnFrame) {
    regs.rip = u64::from(frame.ip);
    regs.rsp = u64::from((regs.rsp as u16).wrapping_add(IRET_FRAME_SIZE));
    sregs.cs.selector = frame.cs;
    sregs.cs.base = u64::from(frame.cs) << 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trampoline_state(ip: u64) -> (kvm_regs, kvm_sregs) {
        let mut sregs = kvm_sregs::default();
        sregs.cs.selector = layout::TRAMPOLINE_SEGMENT;
        let regs = kvm_regs {
            rip: ip,
            ..Default::default()
        };
        (regs, sregs)
    }

    #[test]
    fn test_synthetic_int_recognition() {
        let (regs, sregs) = trampoline_state(0x22);
        assert_eq!(synthetic_int(&regs, &sregs), Some(0x21));

        let (regs, sregs) = trampoline_state(0x100);
        assert_eq!(synthetic_int(&regs, &sregs), Some(0xFF));
    }

    #[test]
    fn test_halt_at_page_start_is_not_synthetic() {
        // IP = 0 would imply an interrupt number of -1.
        let (regs, sregs) = trampoline_state(0);
        assert_eq!(synthetic_int(&regs, &sregs), None);
    }

    #[test]
    fn test_halt_past_trampoline_is_not_synthetic() {
        let (regs, sregs) = trampoline_state(0x101);
        assert_eq!(synthetic_int(&regs, &sregs), None);
    }

    #[test]
    fn test_halt_outside_trampoline_segment_is_not_synthetic() {
        let (regs, mut sregs) = trampoline_state(0x22);
        sregs.cs.selector = layout::PSP_PARA;
        assert_eq!(synthetic_int(&regs, &sregs), None);
    }

    #[test]
    fn test_return_frame_roundtrip() {
        let mem = GuestMemory::new().unwrap();
        let mut sregs = kvm_sregs::default();
        sregs.ss.selector = layout::PSP_PARA;
        let mut regs = kvm_regs {
            // As after an INT from SP = 0xFFFE: three words pushed.
            rsp: 0xFFF8,
            rflags: 0x3, // handler left CF set
            ..Default::default()
        };

        mem.write_u16(layout::PSP_PARA, 0xFFF8, 0x0123).unwrap(); // IP
        mem.write_u16(layout::PSP_PARA, 0xFFFA, layout::PSP_PARA).unwrap(); // CS
        mem.write_u16(layout::PSP_PARA, 0xFFFC, 0x0202).unwrap(); // FLAGS

        let frame = read_return_frame(&regs, &sregs, &mem).unwrap();
        apply_return_frame(&mut regs, &mut sregs, &frame);

        assert_eq!(regs.rip, 0x0123);
        assert_eq!(regs.rsp, 0xFFFE);
        assert_eq!(sregs.cs.selector, layout::PSP_PARA);
        assert_eq!(sregs.cs.base, u64::from(layout::PSP_PARA) << 4);
        // The pushed FLAGS image is not restored; the handler's CF stands.
        assert_eq!(regs.rflags, 0x3);
    }
}
