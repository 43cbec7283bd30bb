//! snapdump: open a snapshot file, report which container shape matched,
//! and print the resolved pointer layout.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use snapshot_loader::{ReadOptions, Snapshot};

#[derive(Parser)]
#[command(name = "snapdump", about = "Inspect a snapshot file")]
struct Cli {
    /// Snapshot file to inspect.
    path: PathBuf,

    /// Copy contents into anonymous memory instead of mapping the file.
    #[arg(long)]
    force_in_memory: bool,

    /// Treat the file as a shared library and resolve with the OS
    /// dynamic loader instead of probing container shapes.
    #[arg(long)]
    dylib: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = if cli.dylib {
        Snapshot::try_read_dynamic_library(&cli.path).map(Some)
    } else {
        Snapshot::try_read(
            &cli.path,
            ReadOptions {
                force_in_memory: cli.force_in_memory,
            },
        )
    };

    match result {
        Ok(Some(snapshot)) => {
            println!("{}: {}", cli.path.display(), snapshot.shape());
            print_pointer("vm data", snapshot.vm_data());
            print_pointer("vm instructions", snapshot.vm_instructions());
            print_pointer("isolate data", snapshot.isolate_data());
            print_pointer("isolate instructions", snapshot.isolate_instructions());
            ExitCode::SUCCESS
        }
        Ok(None) => {
            eprintln!("{}: no such file", cli.path.display());
            ExitCode::from(2)
        }
        Err(error) => {
            eprintln!("{}: {}", cli.path.display(), error);
            ExitCode::FAILURE
        }
    }
}

fn print_pointer(name: &str, pointer: *const u8) {
    if pointer.is_null() {
        println!("  {name:<20} (absent)");
    } else {
        println!("  {name:<20} {pointer:p}");
    }
}
