//! xtask: Development tasks for lauberhorn
//!
//! Run with: `cargo xtask <command>`

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use xshell::{cmd, Shell};

/// Fuzz harnesses in `fuzz/tests`, with what each one drives.
const FUZZ_TARGETS: &[(&str, &str)] = &[
    ("handshake", "worker-control enter/exit/preempt"),
    ("exchange", "receive/transmit against the FPGA model"),
    ("control_codec", "control cacheline decode and round trip"),
];

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Development tasks for lauberhorn")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests (workspace + fuzz harnesses)
    Test,
    /// Run fuzz tests with bolero
    Fuzz {
        /// Target to fuzz (e.g., "handshake", "exchange", "control_codec").
        /// If not specified, runs all fuzz harnesses in test mode
        target: Option<String>,
    },
    /// Run the loopback example with debug logging
    Loopback,
    /// Run clippy on all code
    Clippy,
    /// Check formatting
    Fmt {
        /// Fix formatting issues instead of just checking
        #[arg(long)]
        fix: bool,
    },
}

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn workspace_root() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let manifest_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => std::env::current_dir()?,
    };
    manifest_dir
        .parent()
        .map(PathBuf::from)
        .ok_or_else(|| "xtask has no parent directory".into())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let sh = Shell::new()?;
    let root = workspace_root()?;
    sh.change_dir(&root);

    match cli.command {
        Commands::Test => {
            println!("=== Running workspace tests ===");

            if cmd!(sh, "cargo nextest --version").quiet().run().is_ok() {
                println!("Using cargo-nextest");
                cmd!(sh, "cargo nextest run").run()?;
            } else {
                println!("cargo-nextest not found, using cargo test");
                cmd!(sh, "cargo test").run()?;
            }

            println!("\n=== Running fuzz harnesses (test mode) ===");
            cmd!(sh, "cargo test -p lauberhorn-fuzz").run()?;

            println!("\n=== All tests passed ===");
        }
        Commands::Fuzz { target } => {
            sh.change_dir(root.join("fuzz"));

            if let Some(t) = target {
                if !FUZZ_TARGETS.iter().any(|(name, _)| *name == t) {
                    return Err(format!("unknown fuzz target {t:?}").into());
                }
                println!("=== Fuzzing target: {t} ===");
                println!("Press Ctrl+C to stop.\n");

                if cmd!(sh, "cargo bolero --version").quiet().run().is_err() {
                    eprintln!("cargo-bolero not found. Install with:");
                    eprintln!("  cargo install cargo-bolero");
                    return Err("cargo-bolero not installed".into());
                }

                cmd!(sh, "cargo bolero test {t}").run()?;
            } else {
                println!("=== Running all fuzz harnesses in test mode ===");
                println!("(For real fuzzing, specify a target: cargo xtask fuzz exchange)\n");
                println!("Available targets:");
                for (name, what) in FUZZ_TARGETS {
                    println!("  - {name:<14} ({what})");
                }
                println!();

                cmd!(sh, "cargo test -p lauberhorn-fuzz").run()?;
            }
        }
        Commands::Loopback => {
            cmd!(sh, "cargo run -p lauberhorn --example loopback")
                .env("RUST_LOG", "lauberhorn=debug,lauberhorn_transport_eci=debug")
                .run()?;
        }
        Commands::Clippy => {
            println!("=== Running clippy ===");
            cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
        }
        Commands::Fmt { fix } => {
            if fix {
                println!("=== Fixing formatting ===");
                cmd!(sh, "cargo fmt --all").run()?;
            } else {
                println!("=== Checking formatting ===");
                cmd!(sh, "cargo fmt --all -- --check").run()?;
            }
        }
    }

    Ok(())
}
