//! DOS handle to host stream mapping.
//!
//! DOS programs inherit five pre-opened handles. This emulator backs them
//! with the process standard streams:
//!
//! | handle | DOS name | host stream |
//! |-------:|----------|-------------|
//! | 0 | STDIN  | stdin  |
//! | 1 | STDOUT | stdout |
//! | 2 | STDERR | stderr |
//! | 3 | STDAUX | stderr |
//! | 4 | STDPRN | stdin  |
//!
//! Handles 5 and up were never opened (there is no file layer), so the
//! service handlers report them as invalid. Reading a write-only handle or
//! writing a read-only one surfaces as a host I/O error, which the INT 21h
//! handlers translate into the matching DOS fault code.
//!
//! Output is flushed per operation so guest-visible ordering equals the
//! order of service calls.

use std::io::{self, Read, Write};

/// Pre-opened DOS standard handles.
pub const HANDLE_STDIN: u16 = 0;
pub const HANDLE_STDOUT: u16 = 1;
pub const HANDLE_STDERR: u16 = 2;
/// STDAUX, emulated by stderr.
pub const HANDLE_AUX: u16 = 3;
/// STDPRN; backed by stdin per the handle table.
pub const HANDLE_PRN: u16 = 4;
/// First handle number with nothing behind it.
pub const HANDLE_LIMIT: u16 = 5;

/// The host side of DOS console and handle I/O.
///
/// Built over boxed streams so tests can substitute in-memory pipes for
/// the process streams.
pub struct Console {
    stdin: Box<dyn Read>,
    stdout: Box<dyn Write>,
    stderr: Box<dyn Write>,
}

impl Console {
    /// Console backed by the process standard streams.
    pub fn host() -> Self {
        Self::new(
            Box::new(io::stdin()),
            Box::new(io::stdout()),
            Box::new(io::stderr()),
        )
    }

    /// Console over arbitrary streams.
    pub fn new(stdin: Box<dyn Read>, stdout: Box<dyn Write>, stderr: Box<dyn Write>) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
        }
    }

    /// Write one character to standard output (INT 29h, BIOS teletype,
    /// and the character-output INT 21h services).
    pub fn put_char(&mut self, byte: u8) -> io::Result<()> {
        self.write_stdout(&[byte])
    }

    /// Write one character to standard error (STDAUX output).
    pub fn put_char_stderr(&mut self, byte: u8) -> io::Result<()> {
        self.stderr.write_all(&[byte])?;
        self.stderr.flush()
    }

    /// Write bytes to standard output.
    pub fn write_stdout(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stdout.write_all(bytes)?;
        self.stdout.flush()
    }

    /// Handle-based write (INT 21h AH=40h).
    ///
    /// Returns the number of bytes written, or an error for handles that
    /// are not backed by a writable stream.
    pub fn write_handle(&mut self, handle: u16, data: &[u8]) -> io::Result<usize> {
        let stream: &mut dyn Write = match handle {
            HANDLE_STDOUT => &mut self.stdout,
            HANDLE_STDERR | HANDLE_AUX => &mut self.stderr,
            _ => return Err(io::Error::other("handle is not writable")),
        };
        stream.write_all(data)?;
        stream.flush()?;
        Ok(data.len())
    }

    /// Handle-based read (INT 21h AH=3Fh).
    ///
    /// A single host read; short reads are reported as-is, matching the
    /// DOS contract of returning the byte count in AX.
    pub fn read_handle(&mut self, handle: u16, buf: &mut [u8]) -> io::Result<usize> {
        match handle {
            HANDLE_STDIN | HANDLE_PRN => self.stdin.read(buf),
            _ => Err(io::Error::other("handle is not readable")),
        }
    }
}
