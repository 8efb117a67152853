//! DOS and BIOS service handlers.
//!
//! The recognized subset, chosen so simple text-mode programs run:
//!
//! | INT  | AH   | service |
//! |-----:|-----:|---------|
//! | 0x20 | -    | terminate, status 0 |
//! | 0x29 | -    | fast console write (AL) |
//! | 0x10 | 0x0E | BIOS teletype output (AL) |
//! | 0x21 | 0x04 | STDAUX output (DL, to stderr) |
//! | 0x21 | 0x05 | STDPRN output (DL, to stdout) |
//! | 0x21 | 0x06 | direct console output (DL != 0xFF) |
//! | 0x21 | 0x09 | print $-terminated string at DS:DX |
//! | 0x21 | 0x30 | get DOS version (reports 5.0) |
//! | 0x21 | 0x3F | read via handle into DS:DX |
//! | 0x21 | 0x40 | write via handle from DS:DX |
//! | 0x21 | 0x4C | terminate with status AL |
//!
//! Anything else is fatal to the emulator rather than silently wrong: an
//! unrecognized service returns [`DosError::UnhandledService`] and the
//! process exits with the reserved status. Guest-visible failures (bad
//! handle, host I/O fault) instead set CF=1 with a DOS error code in AX
//! and resume the guest; successful INT 21h services always clear CF.
//!
//! Every guest pointer is resolved through the arena's checked translation,
//! including the full `DS:DX..+CX` range of handle transfers, before any
//! host I/O happens.

use super::console::{Console, HANDLE_LIMIT};
use super::memory::GuestMemory;
use super::DosError;
use kvm_bindings::{kvm_regs, kvm_sregs};

/// DOS error code: invalid handle.
const ERR_INVALID_HANDLE: u16 = 0x06;
/// DOS error code: write fault.
const ERR_WRITE_FAULT: u16 = 0x1D;
/// DOS error code: read fault.
const ERR_READ_FAULT: u16 = 0x1E;

/// AX reported by AH=30h: DOS 5.0.
const DOS_VERSION: u16 = 0x0005;
/// BX reported by AH=30h (OEM serial high byte convention).
const DOS_VERSION_BX: u16 = 0xFF00;

/// Carry flag, the guest-visible error indicator for INT 21h.
const FLAGS_CF: u64 = 0x1;

/// The string terminator of the AH=09h print service.
const STRING_TERMINATOR: u8 = b'$';

/// What the dispatcher should do after a service completes.
#[derive(Debug, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Resume the guest.
    Continue,
    /// Terminate the emulator with the given DOS exit status.
    Exit(u8),
}

// 16-bit views over the 64-bit KVM register file. Real-mode code only sees
// the low words; the upper bits are preserved on writes.

fn ah(regs: &kvm_regs) -> u8 {
    (regs.rax >> 8) as u8
}

fn al(regs: &kvm_regs) -> u8 {
    regs.rax as u8
}

fn bx(regs: &kvm_regs) -> u16 {
    regs.rbx as u16
}

fn cx(regs: &kvm_regs) -> u16 {
    regs.rcx as u16
}

fn dx(regs: &kvm_regs) -> u16 {
    regs.rdx as u16
}

fn dl(regs: &kvm_regs) -> u8 {
    regs.rdx as u8
}

fn set_ax(regs: &mut kvm_regs, value: u16) {
    regs.rax = (regs.rax & !0xFFFF) | u64::from(value);
}

fn set_bx(regs: &mut kvm_regs, value: u16) {
    regs.rbx = (regs.rbx & !0xFFFF) | u64::from(value);
}

fn set_cx(regs: &mut kvm_regs, value: u16) {
    regs.rcx = (regs.rcx & !0xFFFF) | u64::from(value);
}

fn set_carry(regs: &mut kvm_regs, carry: bool) {
    if carry {
        regs.rflags |= FLAGS_CF;
    } else {
        regs.rflags &= !FLAGS_CF;
    }
}

/// Route a synthetic interrupt to its handler.
pub fn handle_interrupt(
    int: u8,
    regs: &mut kvm_regs,
    sregs: &kvm_sregs,
    mem: &GuestMemory,
    console: &mut Console,
) -> Result<ServiceOutcome, DosError> {
    match int {
        0x20 => Ok(ServiceOutcome::Exit(0)),
        0x29 => {
            let _ = console.put_char(al(regs));
            Ok(ServiceOutcome::Continue)
        }
        0x10 => handle_int10(regs, console),
        0x21 => handle_int21(regs, sregs, mem, console),
        _ => Err(DosError::UnhandledService { int, ah: ah(regs) }),
    }
}

/// BIOS video services; only teletype output is provided.
fn handle_int10(regs: &mut kvm_regs, console: &mut Console) -> Result<ServiceOutcome, DosError> {
    match ah(regs) {
        0x0E => {
            let _ = console.put_char(al(regs));
            Ok(ServiceOutcome::Continue)
        }
        ah => Err(DosError::UnhandledService { int: 0x10, ah }),
    }
}

/// The DOS function dispatcher, AH-indexed.
fn handle_int21(
    regs: &mut kvm_regs,
    sregs: &kvm_sregs,
    mem: &GuestMemory,
    console: &mut Console,
) -> Result<ServiceOutcome, DosError> {
    let ds = sregs.ds.selector;

    match ah(regs) {
        // STDAUX output: DL to stderr.
        0x04 => {
            let _ = console.put_char_stderr(dl(regs));
            set_carry(regs, false);
            Ok(ServiceOutcome::Continue)
        }

        // STDPRN output: DL to stdout.
        0x05 => {
            let _ = console.put_char(dl(regs));
            set_carry(regs, false);
            Ok(ServiceOutcome::Continue)
        }

        // Direct console I/O; only the output form (DL != 0xFF) exists here.
        0x06 => {
            if dl(regs) == 0xFF {
                return Err(DosError::UnhandledService { int: 0x21, ah: 0x06 });
            }
            let _ = console.put_char(dl(regs));
            set_carry(regs, false);
            Ok(ServiceOutcome::Continue)
        }

        0x09 => print_string(regs, ds, mem, console),

        // Get DOS version.
        0x30 => {
            set_ax(regs, DOS_VERSION);
            set_bx(regs, DOS_VERSION_BX);
            set_cx(regs, 0);
            set_carry(regs, false);
            Ok(ServiceOutcome::Continue)
        }

        0x3F => read_from_handle(regs, ds, mem, console),
        0x40 => write_to_handle(regs, ds, mem, console),

        // Terminate with return code.
        0x4C => Ok(ServiceOutcome::Exit(al(regs))),

        ah => Err(DosError::UnhandledService { int: 0x21, ah }),
    }
}

/// AH=09h: print the `$`-terminated string at DS:DX.
///
/// The scan may reach offset 0xFFFF, but wrapping back to 0 inside the
/// same call is fatal; a missing terminator would otherwise walk the
/// segment forever.
fn print_string(
    regs: &mut kvm_regs,
    ds: u16,
    mem: &GuestMemory,
    console: &mut Console,
) -> Result<ServiceOutcome, DosError> {
    let start = dx(regs);
    let mut text = Vec::new();

    let mut off = u32::from(start);
    loop {
        if off > 0xFFFF {
            return Err(DosError::StringUnterminated {
                seg: ds,
                off: start,
            });
        }
        let byte = mem.read_u8(ds, off as u16)?;
        if byte == STRING_TERMINATOR {
            break;
        }
        text.push(byte);
        off += 1;
    }

    let _ = console.write_stdout(&text);
    set_carry(regs, false);
    Ok(ServiceOutcome::Continue)
}

/// AH=3Fh: read CX bytes from handle BX into DS:DX.
fn read_from_handle(
    regs: &mut kvm_regs,
    ds: u16,
    mem: &GuestMemory,
    console: &mut Console,
) -> Result<ServiceOutcome, DosError> {
    let handle = bx(regs);
    let count = usize::from(cx(regs));
    let off = dx(regs);

    if handle >= HANDLE_LIMIT {
        set_ax(regs, ERR_INVALID_HANDLE);
        set_carry(regs, true);
        return Ok(ServiceOutcome::Continue);
    }

    // The whole destination range must be inside the arena before any
    // host data is pulled.
    mem.translate(ds, off, count)?;

    let mut buf = vec![0u8; count];
    match console.read_handle(handle, &mut buf) {
        Ok(n) => {
            mem.write(ds, off, &buf[..n])?;
            set_ax(regs, n as u16);
            set_carry(regs, false);
        }
        Err(_) => {
            set_ax(regs, ERR_READ_FAULT);
            set_carry(regs, true);
        }
    }

    Ok(ServiceOutcome::Continue)
}

/// AH=40h: write CX bytes at DS:DX to handle BX.
fn write_to_handle(
    regs: &mut kvm_regs,
    ds: u16,
    mem: &GuestMemory,
    console: &mut Console,
) -> Result<ServiceOutcome, DosError> {
    let handle = bx(regs);
    let count = usize::from(cx(regs));
    let off = dx(regs);

    if handle >= HANDLE_LIMIT {
        set_ax(regs, ERR_INVALID_HANDLE);
        set_carry(regs, true);
        return Ok(ServiceOutcome::Continue);
    }

    let mut buf = vec![0u8; count];
    mem.read(ds, off, &mut buf)?;

    match console.write_handle(handle, &buf) {
        Ok(n) => {
            set_ax(regs, n as u16);
            set_carry(regs, false);
        }
        Err(_) => {
            set_ax(regs, ERR_WRITE_FAULT);
            set_carry(regs, true);
        }
    }

    Ok(ServiceOutcome::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dos::layout;
    use std::io::{Cursor, Write};
    use std::sync::{Arc, Mutex};

    /// A `Write` target whose contents stay inspectable after the console
    /// takes ownership of the box.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        mem: GuestMemory,
        regs: kvm_regs,
        sregs: kvm_sregs,
        console: Console,
        stdout: SharedBuf,
        stderr: SharedBuf,
    }

    fn fixture_with_stdin(input: &[u8]) -> Fixture {
        let stdout = SharedBuf::default();
        let stderr = SharedBuf::default();
        let console = Console::new(
            Box::new(Cursor::new(input.to_vec())),
            Box::new(stdout.clone()),
            Box::new(stderr.clone()),
        );

        let mut sregs = kvm_sregs::default();
        sregs.ds.selector = layout::PSP_PARA;

        Fixture {
            mem: GuestMemory::new().unwrap(),
            regs: kvm_regs::default(),
            sregs,
            console,
            stdout,
            stderr,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_stdin(&[])
    }

    fn dispatch(f: &mut Fixture, int: u8) -> Result<ServiceOutcome, DosError> {
        handle_interrupt(int, &mut f.regs, &f.sregs, &f.mem, &mut f.console)
    }

    fn carry(f: &Fixture) -> bool {
        f.regs.rflags & FLAGS_CF != 0
    }

    #[test]
    fn test_terminate() {
        let mut f = fixture();
        assert_eq!(dispatch(&mut f, 0x20).unwrap(), ServiceOutcome::Exit(0));
    }

    #[test]
    fn test_terminate_with_return_code() {
        let mut f = fixture();
        f.regs.rax = 0x4C2A;
        assert_eq!(dispatch(&mut f, 0x21).unwrap(), ServiceOutcome::Exit(0x2A));
        assert!(f.stdout.contents().is_empty());
    }

    #[test]
    fn test_fast_console_write() {
        let mut f = fixture();
        f.regs.rax = u64::from(b'A');
        assert_eq!(dispatch(&mut f, 0x29).unwrap(), ServiceOutcome::Continue);
        assert_eq!(f.stdout.contents(), b"A");
    }

    #[test]
    fn test_bios_teletype() {
        let mut f = fixture();
        f.regs.rax = 0x0E41;
        assert_eq!(dispatch(&mut f, 0x10).unwrap(), ServiceOutcome::Continue);
        assert_eq!(f.stdout.contents(), b"A");
    }

    #[test]
    fn test_bios_non_teletype_fatal() {
        let mut f = fixture();
        f.regs.rax = 0x0200;
        assert!(matches!(
            dispatch(&mut f, 0x10),
            Err(DosError::UnhandledService { int: 0x10, ah: 0x02 })
        ));
    }

    #[test]
    fn test_stdaux_output_goes_to_stderr() {
        let mut f = fixture();
        f.regs.rax = 0x0400;
        f.regs.rdx = u64::from(b'x');
        dispatch(&mut f, 0x21).unwrap();
        assert_eq!(f.stderr.contents(), b"x");
        assert!(f.stdout.contents().is_empty());
        assert!(!carry(&f));
    }

    #[test]
    fn test_stdprn_output_goes_to_stdout() {
        let mut f = fixture();
        f.regs.rax = 0x0500;
        f.regs.rdx = u64::from(b'y');
        dispatch(&mut f, 0x21).unwrap();
        assert_eq!(f.stdout.contents(), b"y");
        assert!(!carry(&f));
    }

    #[test]
    fn test_direct_console_output() {
        let mut f = fixture();
        f.regs.rax = 0x0600;
        f.regs.rdx = u64::from(b'z');
        dispatch(&mut f, 0x21).unwrap();
        assert_eq!(f.stdout.contents(), b"z");
    }

    #[test]
    fn test_direct_console_input_form_fatal() {
        let mut f = fixture();
        f.regs.rax = 0x0600;
        f.regs.rdx = 0xFF;
        assert!(matches!(
            dispatch(&mut f, 0x21),
            Err(DosError::UnhandledService { int: 0x21, ah: 0x06 })
        ));
    }

    #[test]
    fn test_print_string() {
        let mut f = fixture();
        f.mem.write(layout::PSP_PARA, 0x200, b"Hello$").unwrap();
        f.regs.rax = 0x0900;
        f.regs.rdx = 0x200;
        // A stale carry from earlier guest arithmetic must be cleared.
        f.regs.rflags = FLAGS_CF;
        dispatch(&mut f, 0x21).unwrap();
        assert_eq!(f.stdout.contents(), b"Hello");
        assert!(!carry(&f));
    }

    #[test]
    fn test_print_string_terminator_at_segment_end() {
        let mut f = fixture();
        f.mem.write(layout::PSP_PARA, 0xFFFD, b"AB$").unwrap();
        f.regs.rax = 0x0900;
        f.regs.rdx = 0xFFFD;
        dispatch(&mut f, 0x21).unwrap();
        assert_eq!(f.stdout.contents(), b"AB");
    }

    #[test]
    fn test_print_string_offset_wrap_fatal() {
        let mut f = fixture();
        f.mem.write_u8(layout::PSP_PARA, 0xFFFF, b'A').unwrap();
        f.regs.rax = 0x0900;
        f.regs.rdx = 0xFFFF;
        assert!(matches!(
            dispatch(&mut f, 0x21),
            Err(DosError::StringUnterminated { off: 0xFFFF, .. })
        ));
    }

    #[test]
    fn test_dos_version() {
        let mut f = fixture();
        f.regs.rax = 0x3000;
        f.regs.rbx = 0xDEAD;
        f.regs.rcx = 0xBEEF;
        dispatch(&mut f, 0x21).unwrap();
        assert_eq!(f.regs.rax as u16, 0x0005);
        assert_eq!(f.regs.rbx as u16, 0xFF00);
        assert_eq!(f.regs.rcx as u16, 0x0000);
        assert!(!carry(&f));
    }

    #[test]
    fn test_write_handle_stdout() {
        let mut f = fixture();
        f.mem.write(layout::PSP_PARA, 0x200, b"Hi").unwrap();
        f.regs.rax = 0x4000;
        f.regs.rbx = 1;
        f.regs.rcx = 2;
        f.regs.rdx = 0x200;
        dispatch(&mut f, 0x21).unwrap();
        assert_eq!(f.stdout.contents(), b"Hi");
        assert_eq!(f.regs.rax as u16, 2);
        assert!(!carry(&f));
    }

    #[test]
    fn test_write_handle_stdaux() {
        let mut f = fixture();
        f.mem.write(layout::PSP_PARA, 0x200, b"log").unwrap();
        f.regs.rax = 0x4000;
        f.regs.rbx = 3;
        f.regs.rcx = 3;
        f.regs.rdx = 0x200;
        dispatch(&mut f, 0x21).unwrap();
        assert_eq!(f.stderr.contents(), b"log");
        assert_eq!(f.regs.rax as u16, 3);
        assert!(!carry(&f));
    }

    #[test]
    fn test_write_zero_count() {
        let mut f = fixture();
        f.regs.rax = 0x4000;
        f.regs.rbx = 1;
        f.regs.rcx = 0;
        f.regs.rdx = 0x200;
        dispatch(&mut f, 0x21).unwrap();
        assert!(f.stdout.contents().is_empty());
        assert_eq!(f.regs.rax as u16, 0);
        assert!(!carry(&f));
    }

    #[test]
    fn test_write_invalid_handle() {
        let mut f = fixture();
        f.regs.rax = 0x4000;
        f.regs.rbx = 9;
        f.regs.rcx = 1;
        f.regs.rdx = 0x200;
        dispatch(&mut f, 0x21).unwrap();
        assert_eq!(f.regs.rax as u16, ERR_INVALID_HANDLE);
        assert!(carry(&f));
    }

    #[test]
    fn test_write_to_read_only_handle_faults() {
        let mut f = fixture();
        f.regs.rax = 0x4000;
        f.regs.rbx = 0;
        f.regs.rcx = 1;
        f.regs.rdx = 0x200;
        dispatch(&mut f, 0x21).unwrap();
        assert_eq!(f.regs.rax as u16, ERR_WRITE_FAULT);
        assert!(carry(&f));
    }

    #[test]
    fn test_read_handle_stdin() {
        let mut f = fixture_with_stdin(b"hello");
        f.regs.rax = 0x3F00;
        f.regs.rbx = 0;
        f.regs.rcx = 5;
        f.regs.rdx = 0x300;
        dispatch(&mut f, 0x21).unwrap();
        let mut buf = [0u8; 5];
        f.mem.read(layout::PSP_PARA, 0x300, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(f.regs.rax as u16, 5);
        assert!(!carry(&f));
    }

    #[test]
    fn test_read_handle_short_read() {
        let mut f = fixture_with_stdin(b"ab");
        f.regs.rax = 0x3F00;
        f.regs.rbx = 0;
        f.regs.rcx = 10;
        f.regs.rdx = 0x300;
        dispatch(&mut f, 0x21).unwrap();
        assert_eq!(f.regs.rax as u16, 2);
        assert!(!carry(&f));
    }

    #[test]
    fn test_read_invalid_handle() {
        let mut f = fixture();
        f.regs.rax = 0x3F00;
        f.regs.rbx = 7;
        f.regs.rcx = 1;
        f.regs.rdx = 0x300;
        dispatch(&mut f, 0x21).unwrap();
        assert_eq!(f.regs.rax as u16, ERR_INVALID_HANDLE);
        assert!(carry(&f));
    }

    #[test]
    fn test_read_from_write_only_handle_faults() {
        let mut f = fixture();
        f.regs.rax = 0x3F00;
        f.regs.rbx = 1;
        f.regs.rcx = 1;
        f.regs.rdx = 0x300;
        dispatch(&mut f, 0x21).unwrap();
        assert_eq!(f.regs.rax as u16, ERR_READ_FAULT);
        assert!(carry(&f));
    }

    #[test]
    fn test_stdprn_handle_reads_from_stdin() {
        let mut f = fixture_with_stdin(b"qq");
        f.regs.rax = 0x3F00;
        f.regs.rbx = 4;
        f.regs.rcx = 2;
        f.regs.rdx = 0x300;
        dispatch(&mut f, 0x21).unwrap();
        assert_eq!(f.regs.rax as u16, 2);
        assert!(!carry(&f));
    }

    #[test]
    fn test_unrecognized_dos_function_fatal() {
        let mut f = fixture();
        f.regs.rax = 0x0B00;
        assert!(matches!(
            dispatch(&mut f, 0x21),
            Err(DosError::UnhandledService { int: 0x21, ah: 0x0B })
        ));
    }

    #[test]
    fn test_unrecognized_interrupt_fatal() {
        let mut f = fixture();
        assert!(matches!(
            dispatch(&mut f, 0x13),
            Err(DosError::UnhandledService { int: 0x13, .. })
        ));
    }

    #[test]
    fn test_register_upper_bits_preserved() {
        let mut regs = kvm_regs {
            rax: 0xAAAA_0000,
            ..Default::default()
        };
        set_ax(&mut regs, 0x1234);
        assert_eq!(regs.rax, 0xAAAA_1234);
    }
}
