//! Program Segment Prefix construction.
//!
//! DOS places a 256-byte PSP at the base of every program's segment. Only
//! the fields simple `.com` programs actually consume are populated:
//!
//! - offset 0x00: the two-byte `INT 20h` opcode, so a program that `RET`s
//!   to offset 0 terminates cleanly;
//! - offset 0x02: the top-of-memory paragraph;
//! - offset 0x80: the command tail - a length byte, the tail characters,
//!   and a carriage-return terminator.
//!
//! The command tail follows the DOS convention of one leading space before
//! the first argument and single spaces between arguments.

use super::memory::GuestMemory;
use super::{layout, DosError};

/// PSP size in bytes.
pub const PSP_SIZE: usize = 0x100;

/// The `INT 20h` opcode placed at PSP offset 0.
const TERMINATE_OPCODE: [u8; 2] = [0xCD, 0x20];

/// Offset of the top-of-memory paragraph word.
const TOP_OF_MEMORY_OFFSET: u16 = 0x02;

/// Offset of the command-tail length byte; the tail text follows it.
const TAIL_OFFSET: u16 = 0x80;

/// Maximum encoded command-tail length.
pub const TAIL_MAX: usize = 127;

/// Carriage return terminating the command tail.
const TAIL_TERMINATOR: u8 = 0x0D;

/// Encode host arguments as a DOS command tail.
///
/// Each argument is preceded by a single space, which both separates the
/// arguments and provides the customary leading space. No arguments encode
/// as an empty tail.
pub fn encode_tail(args: &[String]) -> Result<Vec<u8>, DosError> {
    let mut tail = Vec::new();
    for arg in args {
        tail.push(b' ');
        tail.extend_from_slice(arg.as_bytes());
    }
    if tail.len() > TAIL_MAX {
        return Err(DosError::CommandLineTooLong {
            len: tail.len(),
            max: TAIL_MAX,
        });
    }
    Ok(tail)
}

/// Write the PSP into the program segment.
pub fn build_psp(mem: &GuestMemory, args: &[String]) -> Result<(), DosError> {
    let seg = layout::PSP_PARA;

    mem.write(seg, 0, &TERMINATE_OPCODE)?;
    mem.write_u16(seg, TOP_OF_MEMORY_OFFSET, layout::TOP_OF_MEMORY_PARA)?;

    let tail = encode_tail(args)?;
    mem.write_u8(seg, TAIL_OFFSET, tail.len() as u8)?;
    mem.write(seg, TAIL_OFFSET + 1, &tail)?;

    // A maximal 127-byte tail fills the PSP to its last byte; the length
    // byte alone delimits it then, and writing the CR would clobber the
    // first byte of the program image.
    if tail.len() + 1 < PSP_SIZE - TAIL_OFFSET as usize {
        mem.write_u8(seg, TAIL_OFFSET + 1 + tail.len() as u16, TAIL_TERMINATOR)?;
    }

    Ok(())
}
