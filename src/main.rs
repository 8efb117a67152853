//! dosvm - a minimal KVM-backed emulator for real-mode DOS .com programs.
//!
//! Loads a flat `.com` image into a 2 MiB real-mode guest, points every
//! interrupt vector at a page of `HLT` instructions, and services the
//! resulting VM exits host-side: a small INT 21h / INT 10h / INT 20h /
//! INT 29h subset covering console I/O, handle I/O, and termination.
//!
//! This VMM requires Linux with KVM support. It will not run on other
//! platforms.

#[cfg(target_os = "linux")]
mod dos;
#[cfg(target_os = "linux")]
mod kvm;

use clap::Parser;
use std::process::ExitCode;

/// Exit status reserved for host-side failures, distinct from anything a
/// guest can return through INT 21h AH=4Ch (which tops out at 255 but is
/// conventionally small).
const EXIT_HOST_FAILURE: u8 = 252;

#[derive(Parser, Debug)]
#[command(name = "dosvm")]
#[command(about = "A minimal KVM-backed emulator for real-mode DOS .com programs")]
struct Args {
    /// Path to the flat .com program image
    image: String,

    /// Command-line arguments passed through to the DOS program
    #[arg(trailing_var_arg = true)]
    dos_args: Vec<String>,

    /// Trace VM exits and service dispatch on stderr (also: DEBUG env var)
    #[arg(long)]
    trace: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(args) {
        Ok(status) => ExitCode::from(status),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(EXIT_HOST_FAILURE)
        }
    }
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<u8, Box<dyn std::error::Error>> {
    use dos::{Console, GuestMemory};

    let trace = args.trace || std::env::var_os("DEBUG").is_some_and(|v| !v.is_empty());

    let image = std::fs::read(&args.image)
        .map_err(|e| format!("Failed to read image {}: {e}", args.image))?;

    let vm = kvm::create_vm()?;
    let memory = GuestMemory::new()?;

    dos::setup_arena(&memory, &image, &args.dos_args)?;
    dos::register_memory(&vm, &memory)?;

    let mut vcpu = vm.create_vcpu(0)?;
    dos::setup_vcpu(&vcpu)?;

    if trace {
        eprintln!(
            "[DOS] loaded {} ({} bytes), entry {:#06x}:{:#06x}",
            args.image,
            image.len(),
            dos::layout::PSP_PARA,
            dos::layout::COM_ENTRY
        );
    }

    let mut console = Console::host();
    let status = dos::run(&mut vcpu, &memory, &mut console, trace)?;
    Ok(status)
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<u8, Box<dyn std::error::Error>> {
    Err("dosvm requires Linux with KVM support. This platform is not supported.".into())
}
