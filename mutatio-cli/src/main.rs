//! The `mutatio` command.
//!
//! Resolves the project settings and encrypted state, opens the selected target, brings its
//! tracking tables up to date and runs one subcommand against it. Exit code 1 means the
//! command failed, hit a lock conflict or could not revert.

use std::fs::OpenOptions;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use clap::Parser;
use mutatio::settings::LoggingSettings;
use mutatio::{CancelToken, Settings};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod context;
mod output;

use cli::Cli;
use context::{Context, CLOSE_TIMEOUT};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Cli { command, global } = Cli::parse();
    let json = global.json;

    let settings = Settings::load(&Context::settings_path(&global.project))?;
    init_logging(&settings.logging)?;

    let cancel = CancelToken::new();
    let closed_latch = ShutdownLatch::default();
    setup_signal_handlers(cancel.clone(), closed_latch.clone());

    let mut ctx = Context::new(global, settings, cancel)?;
    let result = commands::execute(&mut ctx, command);
    let closed = ctx.shutdown();
    closed_latch.release();
    if !closed.timed_out.is_empty() {
        tracing::warn!(configs = ?closed.timed_out, "Some connections did not close in time");
    }

    match result {
        Ok(report) => {
            report.print(json)?;
            if !report.ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            tracing::error!(error = %err, "Command failed");
            if json {
                println!("{}", serde_json::json!({ "error": err.to_string() }));
            } else {
                eprintln!("Error: {}", err);
            }
            std::process::exit(1);
        }
    }
}

/// `RUST_LOG` overrides the level from the settings file.
fn init_logging(logging: &LoggingSettings) -> Result<(), Box<dyn std::error::Error>> {
    let from_env = EnvFilter::try_from_default_env().ok();
    if !logging.enabled && from_env.is_none() {
        return Ok(());
    }
    let filter = match from_env {
        Some(filter) => filter,
        None => EnvFilter::try_new(&logging.level)?,
    };

    match &logging.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Released by the main thread once its connections are closed.
#[derive(Clone, Default)]
struct ShutdownLatch(Arc<(Mutex<bool>, Condvar)>);

impl ShutdownLatch {
    fn release(&self) {
        let (done, cvar) = &*self.0;
        *done.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cvar.notify_all();
    }

    /// Whether the latch was released within `timeout`.
    fn wait(&self, timeout: Duration) -> bool {
        let (done, cvar) = &*self.0;
        let guard = done.lock().unwrap_or_else(|e| e.into_inner());
        match cvar.wait_timeout_while(guard, timeout, |released| !*released) {
            Ok((guard, _)) => *guard,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }
}

/// The first SIGINT, SIGTERM or SIGHUP cancels at the next file boundary. A second one gives
/// the main thread `CLOSE_TIMEOUT` to close its connections, then exits with 130 and leaves any
/// held lock to expire.
fn setup_signal_handlers(cancel: CancelToken, closed: ShutdownLatch) {
    let mut signals = match Signals::new([SIGINT, SIGTERM, SIGHUP]) {
        Ok(signals) => signals,
        Err(err) => {
            tracing::warn!(error = %err, "Could not install signal handlers");
            return;
        }
    };

    std::thread::spawn(move || {
        for sig in signals.forever() {
            if cancel.is_cancelled() {
                tracing::error!(signal = sig, "Second signal received, closing connections");
                if !closed.wait(CLOSE_TIMEOUT) {
                    tracing::error!("Connections still busy, exiting");
                    std::process::exit(130);
                }
                continue;
            }
            tracing::warn!(signal = sig, "Signal received, stopping after the current file");
            cancel.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_times_out_while_main_is_busy() {
        let latch = ShutdownLatch::default();
        assert!(!latch.wait(Duration::from_millis(20)));
    }

    #[test]
    fn latch_wakes_the_signal_thread_after_shutdown() {
        let latch = ShutdownLatch::default();
        let waiter = latch.clone();
        let handle = std::thread::spawn(move || waiter.wait(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(20));
        latch.release();
        assert!(handle.join().unwrap());
        assert!(latch.wait(Duration::ZERO));
    }
}
