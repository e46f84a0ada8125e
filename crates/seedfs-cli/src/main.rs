//! # seedfs CLI
//!
//! Command-line interface for the seedfs content-addressed filesystem.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;

use seedfs_config::Config;
use seedfs_meta::FsMeta;

mod context;
mod copy;
mod fix;
mod mount;

/// seedfs - remote-backed content-addressed read-only filesystem
#[derive(Parser)]
#[command(name = "seedfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to ./seedfs.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the filesystem and serve until SIGINT/SIGTERM
    Mount,

    /// Ingest a local tree under a virtual destination path
    Copy {
        /// Local source directory
        #[arg(value_name = "SRC")]
        src: PathBuf,

        /// Destination path inside the filesystem, e.g. /archive/2024
        #[arg(value_name = "DST")]
        dst: String,
    },

    /// Re-hash stored content against a local source and repair divergences
    Fix {
        /// Local source directory or file
        #[arg(value_name = "SRC")]
        src: PathBuf,

        /// Path inside the filesystem to verify
        #[arg(value_name = "DST")]
        dst: String,
    },

    /// Remote store management
    Drive {
        #[command(subcommand)]
        command: DriveCommands,
    },

    /// Print the upload state of all blocks
    Test,
}

#[derive(Subcommand)]
enum DriveCommands {
    /// Persist a new backend token, widening the upload/download pool
    Addtoken {
        /// Token for one store handle (for the directory store: its root)
        #[arg(value_name = "TOKEN")]
        token: String,
    },
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    seedfs_config::logging::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Mount => mount::run(&config),
        Commands::Copy { src, dst } => copy::run(&config, &src, &dst),
        Commands::Fix { src, dst } => fix::run(&config, &src, &dst),
        Commands::Drive {
            command: DriveCommands::Addtoken { token },
        } => {
            let backend = context::backend(&config);
            backend.add_token(&token)?;
            println!("{}", style("token added").green());
            Ok(())
        }
        Commands::Test => print_upload_state(&config),
    }
}

fn print_upload_state(config: &Config) -> Result<()> {
    let meta = FsMeta::load(&config.metadata_file)?;
    let refs = meta.block_ref_counts();
    println!("{} blocks", meta.blocks.len());
    let mut pending = 0usize;
    for (i, b) in meta.blocks.iter().enumerate() {
        if b.source.is_empty() {
            pending += 1;
            println!(
                "{} block {} size={} refs={}",
                style("pending").yellow(),
                i,
                b.size,
                refs[i]
            );
        }
    }
    if pending == 0 {
        println!("{}", style("all blocks uploaded").green());
    }
    Ok(())
}
