//! DynRpc CLI - inspect interface descriptors and exercise the marshaller.
//!
//! `serve-demo` reads one request per line from stdin and dispatches it
//! against a built-in calculator service, which makes it easy to try the wire
//! format by hand:
//!
//! ```text
//! $ echo '{"m":"add(DD)D","a":[2.0,3.0]}' | dynrpc serve-demo
//! {"r":5.0}
//! ```

mod commands;
mod demo;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "dynrpc")]
#[command(about = "Descriptor driven JSON remote invocation tool")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the header and methods of an interface descriptor
    Inspect {
        /// Path to the descriptor file
        descriptor: PathBuf,
    },
    /// Print the request envelope for a call
    Encode {
        /// Path to the descriptor file
        descriptor: PathBuf,
        /// Method signature, e.g. "add(DD)D"
        signature: String,
        /// STANDARD argument values as a JSON array
        #[arg(default_value = "[]")]
        args: String,
    },
    /// Dispatch requests from stdin against the built-in calculator
    ServeDemo,
}

/// `--debug` forces debug output; otherwise `RUST_LOG` directives apply,
/// falling back to info.
fn log_filter(debug: bool, directives: Option<&str>) -> EnvFilter {
    if debug {
        return EnvFilter::default().add_directive(LevelFilter::DEBUG.into());
    }
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::default().add_directive(LevelFilter::INFO.into()))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so replies on stdout stay machine readable
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    FmtSubscriber::builder()
        .with_env_filter(log_filter(args.debug, directives.as_deref()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Inspect { descriptor } => {
            print!("{}", commands::inspect(&descriptor)?);
        }
        Command::Encode {
            descriptor,
            signature,
            args,
        } => {
            println!("{}", commands::encode(&descriptor, &signature, &args)?);
        }
        Command::ServeDemo => {
            let interface = demo::interface()?;
            let service = demo::service();
            let stdin = std::io::stdin();
            let summary = commands::serve(&interface, &service, stdin.lock(), std::io::stdout())?;
            info!(
                "Input closed after {} replies and {} failed requests",
                summary.replies, summary.failures
            );
        }
    }

    Ok(())
}
