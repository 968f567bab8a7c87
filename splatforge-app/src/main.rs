//! Splatforge command line
//!
//! Inspect and export training runs written by `splatforge-train`, and print
//! the default training configuration.

use clap::{Parser, Subcommand, ValueEnum};
use splatforge_data::SplatRecord;
use splatforge_train::{CheckpointError, Reorient, RunReader, TrainConfig};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Scaling modifier must be positive, got {0}")]
    InvalidScalingModifier(f32),
}

/// Splatforge - adaptive Gaussian density control
#[derive(Parser, Debug)]
#[command(name = "splatforge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Summarize the latest (or given) checkpoint of a run
    Inspect {
        /// Run directory or `.ckpt` file
        model_path: PathBuf,
    },
    /// Write packed splat records for a viewer
    Export {
        /// Run directory or `.ckpt` file
        model_path: PathBuf,

        #[arg(short, long)]
        out: PathBuf,

        /// Multiplier applied to every Gaussian scale
        #[arg(long, default_value_t = 1.0)]
        scaling_modifier: f32,

        #[arg(long, value_enum, default_value_t = ReorientArg::Auto)]
        reorient: ReorientArg,
    },
    /// Print the default training configuration as JSON
    Config {
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ReorientArg {
    /// Reorient when cameras.json exists
    Auto,
    Enable,
    Disable,
}

impl From<ReorientArg> for Reorient {
    fn from(arg: ReorientArg) -> Self {
        match arg {
            ReorientArg::Auto => Reorient::Auto,
            ReorientArg::Enable => Reorient::Enable,
            ReorientArg::Disable => Reorient::Disable,
        }
    }
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .init();
}

/// Value at quantile `q` of an ascending slice.
fn quantile(sorted: &[f32], q: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * (sorted.len() - 1) as f32).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn inspect(model_path: PathBuf) -> Result<(), AppError> {
    let reader = RunReader::open(&model_path, Reorient::Disable)?;
    let store = reader.points();
    let mut opacities: Vec<f32> = (0..store.len()).map(|i| store.opacity(i)).collect();
    opacities.sort_by(f32::total_cmp);
    let counters = reader.counters();

    println!("Checkpoint:  {}", reader.checkpoint().display());
    println!("Iteration:   {}", reader.iteration());
    println!("Phase:       {}", reader.phase());
    println!("Points:      {}", store.len());
    println!("SH degree:   {} (max {})", reader.active_sh_degree(), store.max_sh_degree());
    println!(
        "Opacity:     p05 {:.4}  p50 {:.4}  p95 {:.4}",
        quantile(&opacities, 0.05),
        quantile(&opacities, 0.5),
        quantile(&opacities, 0.95)
    );
    println!(
        "Densify:     {} passes, +{} cloned, {} split, -{} pruned",
        counters.densify_passes, counters.points_cloned, counters.points_split, counters.points_pruned
    );
    println!(
        "Rejected:    {} clones, {} splits, {} edits",
        counters.rejected_clones, counters.rejected_splits, counters.rejected_edits
    );
    Ok(())
}

fn export(
    model_path: PathBuf,
    out: PathBuf,
    scaling_modifier: f32,
    reorient: ReorientArg,
) -> Result<(), AppError> {
    if !(scaling_modifier > 0.0) {
        return Err(AppError::InvalidScalingModifier(scaling_modifier));
    }
    let reader = RunReader::open(&model_path, reorient.into())?;
    let records: Vec<SplatRecord> = reader.records(scaling_modifier);
    let mut writer = BufWriter::new(File::create(&out)?);
    writer.write_all(bytemuck::cast_slice(&records))?;
    writer.flush()?;
    info!(
        "Exported {} splats ({} bytes each) to {}",
        records.len(),
        std::mem::size_of::<SplatRecord>(),
        out.display()
    );
    Ok(())
}

fn print_config(out: Option<PathBuf>) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(&TrainConfig::default())?;
    match out {
        Some(path) => {
            std::fs::write(&path, json)?;
            info!("Wrote default configuration to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);

    let result = match args.command {
        Command::Inspect { model_path } => inspect(model_path),
        Command::Export {
            model_path,
            out,
            scaling_modifier,
            reorient,
        } => export(model_path, out, scaling_modifier, reorient),
        Command::Config { out } => print_config(out),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
