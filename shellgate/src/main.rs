//! shellgate CLI entry point.
//!
//! `serve` starts the servers listed in a YAML file; `listen` starts a single
//! server from flags. Both run until SIGINT, SIGTERM or SIGQUIT.

use clap::{Parser, Subcommand};

use shellgate::cli::{ListenArgs, LogArgs, ServeArgs};
use shellgate::serve::{run_listen, run_serve};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Definitions
// ─────────────────────────────────────────────────────────────────────────────

/// shellgate: expose a shell over TCP, WebSocket or a named pipe.
#[derive(Parser)]
#[command(name = "shellgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every server in a servers file.
    Serve(ServeArgs),
    /// Start one server described by flags.
    Listen(ListenArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry Point
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (command, result) = match cli.command {
        Commands::Serve(args) => {
            init_tracing(&args.log);
            ("serve", run_serve(args).await)
        }
        Commands::Listen(args) => {
            init_tracing(&args.log);
            ("listen", run_listen(args).await)
        }
    };

    let code = match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "{command} failed");
            eprintln!("shellgate {command}: {e}");
            1
        }
    };

    std::process::exit(code);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracing Init
// ─────────────────────────────────────────────────────────────────────────────

/// Initialise tracing subscriber with stderr output.
///
/// `--verbose` forces the `debug` filter. Otherwise `RUST_LOG` applies,
/// defaulting to `info`. Stdout is reserved for status lines.
fn init_tracing(log: &LogArgs) {
    use tracing_subscriber::EnvFilter;

    let filter = if log.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if log.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}
