//! relink - incremental-link inspector for Mach-O binaries.
//!
//! Opens a previously linked image, reconstructs the prior link's model
//! from its incremental sidecar, and reports what a relink would reuse.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use relink::{Arch, Incremental, InputFile, InputKind, Options};

/// Inspect the incremental-link state of a Mach-O binary.
#[derive(Parser, Debug)]
#[command(name = "relink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Architecture of the image ("arm64" or "x86_64")
    #[arg(short, long, default_value = "arm64", global = true)]
    arch: String,

    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, default_value = "1", global = true)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compare recorded inputs against the files on disk
    Status {
        /// The previously linked output image
        binary: PathBuf,
    },

    /// List the inputs the previous link recorded
    Inputs {
        /// The previously linked output image
        binary: PathBuf,
    },

    /// Show segment and section boundaries
    Segments {
        /// The previously linked output image
        binary: PathBuf,
    },

    /// List reconstructed stub atoms and dylib ordinals
    Stubs {
        /// The previously linked output image
        binary: PathBuf,
    },

    /// Dump the recorded rebase entries
    Rebase {
        /// The previously linked output image
        binary: PathBuf,
    },

    /// Dump the recorded binding entries
    Bindings {
        /// The previously linked output image
        binary: PathBuf,
    },

    /// Show per-section patch-space reservations
    PatchSpace {
        /// The previously linked output image
        binary: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);

    let Some(arch) = Arch::from_name(&cli.arch) else {
        bail!("unknown architecture '{}'", cli.arch);
    };

    match cli.command {
        Commands::Status { binary } => cmd_status(binary, arch),
        Commands::Inputs { binary } => cmd_inputs(binary, arch),
        Commands::Segments { binary } => cmd_segments(binary, arch),
        Commands::Stubs { binary } => cmd_stubs(binary, arch),
        Commands::Rebase { binary } => cmd_rebase(binary, arch),
        Commands::Bindings { binary } => cmd_bindings(binary, arch),
        Commands::PatchSpace { binary } => cmd_patch_space(binary, arch),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn open_session(binary: PathBuf, arch: Arch) -> Result<Incremental> {
    let options = Options {
        output_path: binary.clone(),
        arch,
        inputs: Vec::new(),
    };
    Incremental::open(&options)
        .with_context(|| format!("cannot reuse '{}' for an incremental link", binary.display()))
}

/// Builds the driver-style input list by stat'ing each recorded path.
fn declared_inputs(session: &Incremental) -> Vec<InputFile> {
    let sidecar = session.sidecar();
    let mut inputs = Vec::with_capacity(sidecar.inputs.len());
    for entry in &sidecar.inputs {
        let Ok(path) = sidecar.string(entry.path_index) else {
            continue;
        };
        let mod_time = fs::metadata(path).map(|m| m.mtime() as u64).unwrap_or(0);
        inputs.push(InputFile {
            path: path.to_owned(),
            mod_time,
            from_file_list: true,
        });
    }
    inputs
}

fn cmd_status(binary: PathBuf, arch: Arch) -> Result<()> {
    let mut session = open_session(binary, arch)?;
    let inputs = declared_inputs(&session);
    let decision = session.decide(&inputs)?;

    println!(
        "{} unchanged, {} changed, {} new",
        decision.unchanged.len(),
        decision.changed.len(),
        decision.new_files.len()
    );
    for path in &decision.changed {
        println!("  changed: {path}");
    }
    for path in &decision.new_files {
        println!("  new:     {path}");
    }
    if decision.is_noop() {
        println!("image is up to date; a relink would patch nothing");
    }
    if decision.suppress_entry_point {
        println!("entry point present; the driver would not regenerate it");
    }
    session.close()?;
    Ok(())
}

fn cmd_inputs(binary: PathBuf, arch: Arch) -> Result<()> {
    let session = open_session(binary, arch)?;
    let sidecar = session.sidecar();
    for entry in &sidecar.inputs {
        let path = sidecar.string(entry.path_index)?;
        let kind = match entry.kind {
            InputKind::Relocatable => "reloc",
            InputKind::Dylib => "dylib",
            InputKind::Archive => "archive",
            InputKind::Other => "other",
        };
        println!("{kind:<8} mtime={:<12} {path}", entry.mod_time);
        for atom in &entry.atoms {
            let name = sidecar.string(atom.name_index)?;
            println!(
                "         atom {name} at {:#x} ({} bytes)",
                atom.file_offset, atom.size
            );
        }
    }
    session.close()?;
    Ok(())
}

fn cmd_segments(binary: PathBuf, arch: Arch) -> Result<()> {
    let session = open_session(binary, arch)?;
    println!("base address {:#x}", session.base_address());
    for (index, seg) in session.segment_boundaries().iter().enumerate() {
        println!("segment {index}: {:#x} + {:#x}", seg.start, seg.size);
    }
    let mut names: Vec<&String> = session.parsed().section_boundaries.keys().collect();
    names.sort();
    for name in names {
        let boundary = session.section_boundary(name).unwrap();
        println!(
            "{name:<20} addr={:#x} off={:#x} size={:#x}",
            boundary.address, boundary.file_offset, boundary.size
        );
    }
    session.close()?;
    Ok(())
}

fn cmd_stubs(binary: PathBuf, arch: Arch) -> Result<()> {
    let session = open_session(binary, arch)?;
    for stub in session.stub_atoms() {
        println!(
            "{:#x} {} (ordinal {}{})",
            stub.address,
            stub.name,
            stub.ordinal,
            if stub.weak_import { ", weak" } else { "" }
        );
    }
    for dylib in session.dylib_files() {
        println!("dylib {} -> ordinal {}", dylib.install_name, dylib.ordinal);
    }
    session.close()?;
    Ok(())
}

fn cmd_rebase(binary: PathBuf, arch: Arch) -> Result<()> {
    let session = open_session(binary, arch)?;
    for rebase in session.rebase_info() {
        println!("type {} at {:#x}", rebase.kind, rebase.address);
    }
    session.close()?;
    Ok(())
}

fn cmd_bindings(binary: PathBuf, arch: Arch) -> Result<()> {
    let session = open_session(binary, arch)?;
    for bind in session.binding_info() {
        print_binding("bind", bind);
    }
    for bind in session.weak_binding_info() {
        print_binding("weak", bind);
    }
    for bind in session.lazy_binding_info() {
        print_binding("lazy", bind);
    }
    session.close()?;
    Ok(())
}

fn print_binding(kind: &str, bind: &relink::BindingEntry) {
    println!(
        "{kind:<5} {:#x} {} (ordinal {}, addend {}{})",
        bind.address,
        bind.symbol,
        bind.ordinal,
        bind.addend,
        if bind.weak_import { ", weak" } else { "" }
    );
}

fn cmd_patch_space(binary: PathBuf, arch: Arch) -> Result<()> {
    let session = open_session(binary, arch)?;
    let mut names: Vec<&String> = session.parsed().patch_space.keys().collect();
    names.sort();
    for name in names {
        let patch = session.patch_space(name).unwrap();
        println!(
            "{name:<20} offset={:#x} reserved={:#x}",
            patch.patch_offset, patch.patch_space
        );
    }
    session.close()?;
    Ok(())
}
