//! varzip CLI - columnar compressor for variant-record files.

mod commands;
mod text_format;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "varzip")]
#[command(author, version, about = "Columnar lossless compressor for genomic variant records")]
#[command(long_about = "
varzip compresses tab-separated variant-record files into a single
self-describing archive and recovers them bit-identically.

Examples:
  varzip compress records.vcf records.vz
  varzip compress -t 16 -n 20 records.vcf records.vz
  varzip decompress records.vz restored.vcf
  varzip info --json records.vz
")]
struct Cli {
    /// Print debug diagnostics.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a record file into an archive
    #[command(alias = "c")]
    Compress {
        /// Input record file
        input: PathBuf,

        /// Output archive
        archive: PathBuf,

        /// Ignore rare variants below this alternative-allele count when
        /// updating the genotype permutation
        #[arg(short = 'n', long, default_value_t = 10)]
        neglect_limit: u32,

        /// Maximum number of threads
        #[arg(short = 't', long, default_value_t = 8)]
        threads: u32,

        /// Compression level (1-3)
        #[arg(short = 'c', long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..=3))]
        level: u32,
    },

    /// Decompress an archive back into a record file
    #[command(alias = "d")]
    Decompress {
        /// Input archive
        archive: PathBuf,

        /// Output record file
        output: PathBuf,

        /// Maximum number of threads
        #[arg(short = 't', long, default_value_t = 8)]
        threads: u32,
    },

    /// Show the stream table of an archive
    #[command(alias = "i")]
    Info {
        /// Archive to inspect
        archive: PathBuf,

        /// Output as JSON (machine-readable)
        #[arg(short, long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    simple_logger::SimpleLogger::new()
        .with_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init()
        .ok();

    let result = match cli.command {
        Commands::Compress {
            input,
            archive,
            neglect_limit,
            threads,
            level,
        } => commands::compress(&input, &archive, neglect_limit, threads, level),
        Commands::Decompress {
            archive,
            output,
            threads,
        } => commands::decompress(&archive, &output, threads),
        Commands::Info { archive, json } => commands::info(&archive, json),
    };

    if let Err(e) = result {
        eprintln!("Critical error! {e}");
        std::process::exit(1);
    }
}
