//! Developer tasks for the TETHER relay workspace
//!
//! Run with: cargo xtask <command>

use clap::{Parser, Subcommand, ValueEnum};
use std::process::Command;

/// Relay CLI package, run through cargo
const RELAY_PACKAGE: &str = "tether-cli";

/// Integration, hardening and property tests over loopback TCP
const TESTS_PACKAGE: &str = "tether-integration-tests";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Test, fuzz and run the TETHER relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run relay tests (pool, handshake and manager units, loopback sessions)
    Test {
        /// Which test suite to run
        #[arg(value_enum, default_value_t = Suite::All)]
        suite: Suite,
    },

    /// Lint the relay crates with clippy, warnings denied
    Lint,

    /// Check formatting of the relay crates
    Fmt,

    /// Formatting, lints and every test suite, as CI runs them
    Ci,

    /// Feed random input to the handshake decoder or identity matcher
    /// (requires cargo-fuzz and a nightly toolchain)
    Fuzz {
        /// Fuzz target
        #[arg(value_enum, default_value_t = FuzzTarget::Handshake)]
        target: FuzzTarget,

        /// Seconds to run for
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },

    /// Measure handshake parsing, pool checkout and loopback relay throughput
    Bench,

    /// Start a local relay for manual sessions with `tether-relay connect`
    Serve {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:8890")]
        bind: String,

        /// Resource pool size
        #[arg(long)]
        pool_size: Option<usize>,
    },

    /// Build the relay API documentation
    Doc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Suite {
    /// Unit tests of the relay library and CLI
    Unit,
    /// Loopback session tests
    Integration,
    /// Both
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum FuzzTarget {
    /// Length-prefixed handshake decoding
    Handshake,
    /// Identity comparison
    IdentityMatch,
}

impl FuzzTarget {
    fn binary(self) -> &'static str {
        match self {
            Self::Handshake => "fuzz_handshake",
            Self::IdentityMatch => "fuzz_identity_match",
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test { suite } => run_tests(suite)?,
        Commands::Lint => {
            run_command("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
        }
        Commands::Fmt => {
            run_command("cargo", &["fmt", "--all", "--check"])?;
        }
        Commands::Ci => {
            println!("Running relay CI checks...");
            run_command("cargo", &["fmt", "--all", "--check"])?;
            run_command("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
            run_tests(Suite::All)?;
            println!("All relay checks passed!");
        }
        Commands::Fuzz { target, seconds } => {
            let max_time = format!("-max_total_time={seconds}");
            run_command_in(
                "fuzz",
                "cargo",
                &["+nightly", "fuzz", "run", target.binary(), "--", &max_time],
            )?;
        }
        Commands::Bench => {
            run_command("cargo", &["bench", "-p", TESTS_PACKAGE])?;
        }
        Commands::Serve { bind, pool_size } => {
            let pool_size = pool_size.map(|n| n.to_string());
            let mut args = vec!["run", "-p", RELAY_PACKAGE, "--", "run", "--bind", bind.as_str()];
            if let Some(pool_size) = &pool_size {
                args.extend(["--pool-size", pool_size.as_str()]);
            }
            run_command("cargo", &args)?;
        }
        Commands::Doc => {
            run_command("cargo", &["doc", "-p", "tether-relay", "--no-deps", "--open"])?;
        }
    }

    Ok(())
}

fn run_tests(suite: Suite) -> anyhow::Result<()> {
    if matches!(suite, Suite::Unit | Suite::All) {
        run_command("cargo", &["test", "-p", "tether-relay", "-p", RELAY_PACKAGE])?;
    }
    if matches!(suite, Suite::Integration | Suite::All) {
        run_command("cargo", &["test", "-p", TESTS_PACKAGE])?;
    }
    Ok(())
}

fn run_command(program: &str, args: &[&str]) -> anyhow::Result<()> {
    run_command_in(".", program, args)
}

fn run_command_in(dir: &str, program: &str, args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new(program)
        .args(args)
        .current_dir(dir)
        .status()?;

    if !status.success() {
        anyhow::bail!("{} {:?} failed", program, args);
    }

    Ok(())
}
