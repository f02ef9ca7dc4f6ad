//! Assembler command-line driver.
//!
//! Assembles a main source file, materializes the recorded save commands
//! (bin/sna/tap/trd) into the output directory, and verifies any expected
//! MD5 fingerprints.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};

use speccy::asm::save::{trd_add_file, SaveCommand, SaveKind};
use speccy::asm::{assemble, AssembleOptions};
use speccy::vfs::HostVfs;

#[derive(Parser)]
#[command(name = "speccy", about = "Z80 macro assembler for the ZX Spectrum family")]
struct Args {
    /// Main source file.
    source: PathBuf,

    /// Defines installed before pass 1, as NAME=VALUE.
    #[arg(short = 'D', value_name = "NAME=VALUE")]
    define: Vec<String>,

    /// Directory save commands write into (defaults to the source's).
    #[arg(short = 'o', long)]
    out_dir: Option<PathBuf>,

    /// Print the symbol table after assembly.
    #[arg(long)]
    list_symbols: bool,
}

fn parse_defines(raw: &[String]) -> Vec<(String, String)> {
    raw.iter()
        .map(|d| match d.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (d.clone(), "1".to_string()),
        })
        .collect()
}

/// Fold the ordered save commands into final per-file contents. TAP
/// commands append to an earlier tape of the same name; TRD commands
/// insert into the image created by EMPTYTRD.
fn materialize(commands: &[SaveCommand]) -> Result<HashMap<String, Vec<u8>>, String> {
    let mut files: HashMap<String, Vec<u8>> = HashMap::new();
    for cmd in commands {
        match cmd.kind {
            SaveKind::Bin | SaveKind::Sna | SaveKind::EmptyTrd => {
                files.insert(cmd.filename.clone(), cmd.data.clone());
            }
            SaveKind::EmptyTap => {
                files.insert(cmd.filename.clone(), Vec::new());
            }
            SaveKind::Tap => {
                files
                    .entry(cmd.filename.clone())
                    .or_default()
                    .extend_from_slice(&cmd.data);
            }
            SaveKind::Trd => {
                let img = files
                    .get_mut(&cmd.filename)
                    .ok_or_else(|| format!("SAVETRD without EMPTYTRD for {}", cmd.filename))?;
                let name = cmd.member.as_deref().unwrap_or("NONAME.C");
                if !trd_add_file(img, name, cmd.start, &cmd.data) {
                    return Err(format!("no room for {name} in {}", cmd.filename));
                }
            }
        }
    }
    Ok(files)
}

fn verify_md5(commands: &[SaveCommand], files: &HashMap<String, Vec<u8>>) -> bool {
    let mut ok = true;
    for cmd in commands {
        let Some(expected) = &cmd.expected_md5 else {
            continue;
        };
        let Some(bytes) = files.get(&cmd.filename) else {
            continue;
        };
        let actual = format!("{:x}", md5::compute(bytes));
        if &actual == expected {
            info!("{}: md5 ok", cmd.filename);
        } else {
            error!(
                "{}: md5 mismatch (expected {expected}, got {actual})",
                cmd.filename
            );
            ok = false;
        }
    }
    ok
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let source_dir = args
        .source
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let main_name = match args.source.file_name() {
        Some(n) => n.to_string_lossy().into_owned(),
        None => {
            error!("not a source file: {}", args.source.display());
            return ExitCode::FAILURE;
        }
    };

    let vfs = HostVfs::new(&source_dir);
    let options = AssembleOptions {
        defines: parse_defines(&args.define),
        ..Default::default()
    };
    let result = match assemble(&vfs, &main_name, options) {
        Ok(r) => r,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    for w in &result.warnings {
        warn!("{w}");
    }
    for e in &result.errors {
        error!("{e}");
    }
    info!(
        "{} bytes at {:#06x} after {} pass(es)",
        result.output.len(),
        result.output_start,
        result.passes
    );

    if args.list_symbols {
        for (name, value) in &result.symbols {
            println!("{name} = {value:#x}");
        }
    }

    let files = match materialize(&result.save_commands) {
        Ok(f) => f,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let out_dir = args.out_dir.unwrap_or(source_dir);
    for (name, bytes) in &files {
        let path = out_dir.join(name);
        if let Err(e) = fs::write(&path, bytes) {
            error!("cannot write {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
        info!("wrote {} ({} bytes)", path.display(), bytes.len());
    }

    let md5_ok = verify_md5(&result.save_commands, &files);
    if !result.errors.is_empty() || !md5_ok {
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
