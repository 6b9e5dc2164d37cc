use clap::Parser;
use futures::future;
use ruuvitag_collector::app::{self, Options};
use ruuvitag_collector::cancel::CancelToken;
use ruuvitag_collector::scanner::SystemOpener;
use std::panic::{self, PanicHookInfo};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Log to stderr so stdout carries only measurements. `RUST_LOG` overrides
/// the level chosen by `--verbose`.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd, Telegraf execd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    let (cancel, guard) = CancelToken::none().child();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupted, shutting down");
                guard.cancel();
            }
            Err(error) => {
                warn!(%error, "cannot listen for Ctrl-C");
                // Keep the guard alive; dropping it would cancel the run.
                future::pending::<()>().await;
            }
        }
    });

    let out = Box::new(std::io::stdout());
    match app::run_with_io(options, &SystemOpener, out, cancel).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
