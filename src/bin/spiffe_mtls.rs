// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Companion CLI: construct SPIFFE IDs and validate configuration files
//! with exactly the loader the library uses.
//!
//! Exit codes: 0 success, 1 usage error, 2 validation error, 3 runtime
//! error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use spiffe_mtls::{Config, Error, SpiffeId, TrustDomain};

#[derive(Parser)]
#[command(name = "spiffe-mtls", version, about = "Workload-identity mTLS tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the crate version.
    Version,
    /// Construct and print a canonical SPIFFE ID.
    SpiffeId {
        /// Trust domain, e.g. example.org.
        #[arg(long)]
        trust_domain: String,
        /// Workload path, e.g. /ns/default/sa/web.
        #[arg(long, default_value = "/")]
        path: String,
    },
    /// Load and validate a configuration file.
    Validate {
        /// Path to the YAML configuration.
        #[arg(long, default_value = "config.yaml")]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    match cli.command {
        Command::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Command::SpiffeId { trust_domain, path } => {
            let id = TrustDomain::new(&trust_domain).and_then(|td| SpiffeId::new(td, &path));
            match id {
                Ok(id) => {
                    println!("{id}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::from(2)
                }
            }
        }
        Command::Validate { config } => match Config::load(&config) {
            Ok(loaded) => {
                println!("{} is valid", config.display());
                if let Some(server) = &loaded.server {
                    println!("  server: listen {} ({})", server.listen_addr, server.authorizer);
                }
                if loaded.client.is_some() {
                    println!("  client: configured");
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::from(exit_code_for(&e))
            }
        },
    }
}

fn exit_code_for(error: &Error) -> u8 {
    match error {
        Error::InvalidConfig(_)
        | Error::MissingRequiredField(_)
        | Error::InvalidSpiffeId(_)
        | Error::InvalidTrustDomain(_)
        | Error::InvalidPath(_)
        | Error::InvalidSocketPath(_) => 2,
        _ => 3,
    }
}
