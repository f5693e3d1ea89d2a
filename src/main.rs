//! amspatch CLI - patch a TI-68k AMS update file.
//!
//! Reads an OS update (`.89u`, `.9xu`, `.v2u`, `.89t`), applies the selected
//! patchset and writes the result to a new file.

use std::path::{Path, PathBuf};
use std::process;

use amspatch::{
    patch_file, Features, PatchConfig, Patchset, ProgressInfo, ProgressStage, StageOutcome,
};
use bytesize::ByteSize;
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

/// Exit status when the input file does not exist.
const EXIT_MISSING_INPUT: i32 = 2;
/// Exit status for command-line usage errors.
const EXIT_USAGE: i32 = 1;

/// Patch a TI-68k AMS operating system image.
#[derive(Parser)]
#[command(name = "amspatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Which set of patches to apply
    #[arg(long, value_enum, default_value_t = PatchsetArg::Full)]
    patchset: PatchsetArg,

    /// Keep the run-time font lookups in the drawing code
    #[arg(long)]
    no_hardcode_fonts: bool,

    /// Replace localized string lookups with the built-in English strings
    #[arg(long)]
    hardcode_english_language: bool,

    /// OS update file to patch
    input: PathBuf,

    /// Path of the patched file (must not exist)
    output: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum PatchsetArg {
    /// Unlock, optimize, fix, shrink and expand
    Full,
    /// Unlock and optimize only
    Fix,
}

impl From<PatchsetArg> for Patchset {
    fn from(arg: PatchsetArg) -> Self {
        match arg {
            PatchsetArg::Full => Patchset::Full,
            PatchsetArg::Fix => Patchset::Fix,
        }
    }
}

fn main() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            process::exit(if e.use_stderr() { EXIT_USAGE } else { 0 });
        }
    };

    if !cli.input.is_file() {
        eprintln!("Error: input file not found: {}", cli.input.display());
        process::exit(EXIT_MISSING_INPUT);
    }

    if let Err(err) = patch(&cli) {
        eprintln!("Error: {:#}", err);
        let code = err
            .downcast_ref::<amspatch::Error>()
            .map(amspatch::Error::exit_code)
            .unwrap_or(EXIT_USAGE);
        process::exit(code);
    }
}

fn patch(cli: &Cli) -> anyhow::Result<()> {
    let patchset = Patchset::from(cli.patchset);
    println!("Patching: {}", cli.input.display());
    println!("Output: {}", cli.output.display());
    println!("Patchset: {}", patchset.name());

    // Create progress bar
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    let pb_clone = pb.clone();
    let config = PatchConfig {
        patchset,
        features: Features {
            hardcode_fonts: !cli.no_hardcode_fonts,
            hardcode_english_language: cli.hardcode_english_language,
        },
        progress_callback: Some(Box::new(move |info: &ProgressInfo| {
            let pct = if info.total > 0 {
                (info.current as f64 / info.total as f64 * 100.0) as u64
            } else {
                0
            };

            let msg = match info.stage {
                ProgressStage::Patching => {
                    let item = info.current_item.as_deref().unwrap_or("");
                    format!(
                        "{} - {} ({} sites)",
                        info.stage.name(),
                        item,
                        info.sites_patched
                    )
                }
                ProgressStage::WritingFile => {
                    format!(
                        "{} - {}",
                        info.stage.name(),
                        ByteSize::b(info.total_bytes as u64)
                    )
                }
                _ => info.stage.name().to_string(),
            };

            pb_clone.set_position(pct);
            pb_clone.set_message(msg);
        })),
    };

    let report = match patch_file(&cli.input, &cli.output, &config) {
        Ok(report) => report,
        Err(e) => {
            pb.abandon_with_message("Failed");
            return Err(e.into());
        }
    };
    pb.finish_with_message("Complete");

    println!(
        "\n{} AMS {} (release code {})",
        report.firmware.model, report.firmware.os, report.firmware.version_code
    );
    for stage in &report.stages {
        match &stage.outcome {
            StageOutcome::Applied { sites } => {
                let sites: Vec<String> = sites.iter().map(|s| format!("0x{:06X}", s)).collect();
                println!("  {:<28} {}", stage.name, sites.join(" "));
            }
            StageOutcome::Skipped { reason } => {
                println!("  {:<28} skipped: {}", stage.name, reason);
            }
            StageOutcome::NotApplicable => {
                println!("  {:<28} not applicable", stage.name);
            }
        }
    }

    println!(
        "Checksum: 0x{:08X} -> 0x{:08X}",
        report.checksum_before.stored_value, report.checksum_after.stored_value
    );
    if report.shrunk_by > 0 {
        println!("Shrunk by {}", ByteSize::b(report.shrunk_by as u64));
    }
    print_done(&cli.output, report.final_len);

    Ok(())
}

fn print_done(output: &Path, len: usize) {
    println!(
        "\nPatch complete: {} ({})",
        output.display(),
        ByteSize::b(len as u64)
    );
}
