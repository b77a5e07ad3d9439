//! oxz CLI - pure Rust xz compression.
//!
//! Compress, decompress, test and list `.xz` streams.

mod commands;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use commands::{CheckArg, cmd_compress, cmd_decompress, cmd_list, cmd_test};

#[derive(Parser)]
#[command(name = "oxz")]
#[command(
    author,
    version,
    about = "Pure Rust xz compression utility"
)]
#[command(long_about = "
oxz is a pure Rust implementation of the .xz format.

Examples:
  oxz compress file.txt
  oxz compress -9 --check sha256 file.txt -o file.txt.xz
  oxz decompress file.txt.xz
  oxz decompress --memlimit 100000000 big.xz
  oxz test archive.xz
  oxz list --json archive.xz
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a file into a .xz stream
    #[command(alias = "c")]
    Compress {
        /// File to compress (use "-" for stdin)
        input: String,

        /// Output file (defaults to INPUT.xz, or stdout for stdin input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Compression preset, 0 (fastest) to 9 (strongest)
        #[arg(short, long, default_value_t = 6, value_parser = clap::value_parser!(u32).range(0..=9))]
        preset: u32,

        /// Integrity check type
        #[arg(short, long, value_enum, default_value_t = CheckArg::Crc64)]
        check: CheckArg,

        /// Split the stream into blocks of this many uncompressed bytes
        #[arg(long)]
        block_size: Option<u64>,
    },

    /// Decompress a .xz stream
    #[command(alias = "d")]
    Decompress {
        /// File to decompress (use "-" for stdin)
        input: String,

        /// Output file (defaults to INPUT without .xz, or stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Decoder memory limit in bytes
        #[arg(short, long)]
        memlimit: Option<u64>,
    },

    /// Decode a .xz stream and report integrity without writing output
    #[command(alias = "t")]
    Test {
        /// File to test (use "-" for stdin)
        input: String,

        /// Decoder memory limit in bytes
        #[arg(short, long)]
        memlimit: Option<u64>,
    },

    /// Show the streams and blocks of a .xz file
    #[command(alias = "l")]
    List {
        /// File to list
        input: PathBuf,

        /// Machine-readable JSON output
        #[arg(short, long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Compress {
            input,
            output,
            preset,
            check,
            block_size,
        } => cmd_compress(&input, output, preset, check, block_size),
        Commands::Decompress {
            input,
            output,
            memlimit,
        } => cmd_decompress(&input, output, memlimit),
        Commands::Test { input, memlimit } => cmd_test(&input, memlimit),
        Commands::List { input, json } => cmd_list(&input, json),
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "oxz", &mut io::stdout());
            Ok(false)
        }
    };

    match result {
        // Exit 2: the operation succeeded but the data could not be fully
        // verified (unsupported check type).
        Ok(true) => {
            eprintln!("oxz: warning: data was not verified against its integrity check");
            ExitCode::from(2)
        }
        Ok(false) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("oxz: {err}");
            ExitCode::FAILURE
        }
    }
}
