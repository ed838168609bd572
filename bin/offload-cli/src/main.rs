// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # offload-sim
//!
//! Command-line simulator for the offload runtime, running offload regions
//! against the in-process host plugin.
//!
//! ## Usage
//! ```bash
//! # Run a pointer-chasing workload with bulk transfers
//! offload-sim simulate --mode bulk --structs 64 --iterations 10
//!
//! # Compare immediate, bulk and address-table transfers
//! offload-sim compare --structs 64 --payload 4096
//!
//! # Print the effective configuration as TOML
//! offload-sim config
//! ```

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "offload-sim",
    about = "Simulate offload regions over an in-process device",
    version,
    author
)]
struct Cli {
    /// Path to a TOML runtime configuration file.
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Enable verbose logging (repeat for more: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one workload and print its metrics.
    Simulate {
        /// Transfer mode: immediate or bulk (overrides the config file).
        #[arg(short, long)]
        mode: Option<String>,

        /// Upload an address table instead of patching pointers.
        #[arg(long)]
        address_table: bool,

        #[command(flatten)]
        workload: commands::scenario::Workload,

        /// Print metrics as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run the same workload under every transfer strategy.
    Compare {
        #[command(flatten)]
        workload: commands::scenario::Workload,
    },

    /// Print the effective runtime configuration.
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    commands::init_tracing(cli.verbose);
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            mode,
            address_table,
            workload,
            json,
        } => commands::simulate::execute(config, mode, address_table, workload, json),
        Commands::Compare { workload } => commands::compare::execute(config, workload),
        Commands::Config => commands::config::execute(&config),
    }
}
