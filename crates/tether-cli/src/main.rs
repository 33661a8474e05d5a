//! Tether command-line tool
//!
//! Builds binary metadata from a JSON declaration graph and prints the
//! contents of a metadata file.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether metadata toolchain", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serialize a JSON declaration graph into a metadata file
    Build {
        /// Declaration graph (JSON)
        #[arg(short, long)]
        input: PathBuf,
        /// Metadata file to write
        #[arg(short, long, default_value = "metadata.bin")]
        output: PathBuf,
        /// Keep variadic functions instead of dropping them
        #[arg(long)]
        keep_variadic: bool,
        /// Leave colliding script names as they are
        #[arg(long)]
        no_rename: bool,
        /// Keep members already declared by a base interface or protocol
        #[arg(long)]
        keep_duplicates: bool,
    },

    /// Print the declarations of a metadata file
    Dump {
        /// Metadata file
        file: PathBuf,
        /// Only the declaration with this script name
        #[arg(short, long)]
        name: Option<String>,
        /// List modules and their libraries instead of declarations
        #[arg(long)]
        modules: bool,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            input,
            output,
            keep_variadic,
            no_rename,
            keep_duplicates,
        } => commands::build::execute(
            &input,
            &output,
            commands::build::BuildFlags {
                keep_variadic,
                no_rename,
                keep_duplicates,
            },
        ),
        Commands::Dump { file, name, modules } => {
            if modules {
                commands::dump::modules(&file)
            } else {
                commands::dump::execute(&file, name.as_deref())
            }
        }
    }
}
