//! `tsp` — transport stream processor.
//!
//! Builds the plugin chain described on the command line, runs it to
//! completion and maps the outcome to the exit status: 0 for a clean
//! run, 1 when a stage aborted, 2 for configuration and startup errors.

mod args;

use pipeline::{Pipeline, PipelineHandle, PluginRegistry, Severity};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let invocation = match args::parse(&argv) {
        Ok(inv) => inv,
        Err(e) => {
            eprintln!("tsp: {e}");
            return ExitCode::from(2);
        }
    };

    // Logs go to stderr: stdout may carry the stream itself.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| invocation.log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut registry = PluginRegistry::with_builtins();
    let pipeline = match Pipeline::build(invocation.options, invocation.chain, &mut registry) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(2);
        }
    };
    install_signal_handlers(pipeline.handle());

    match pipeline.run() {
        Ok(summary) => {
            for stage in &summary.stages {
                tracing::debug!(
                    "stage {} ({} {}): {} packets",
                    stage.index,
                    stage.kind,
                    stage.name,
                    stage.packets
                );
            }
            if summary.success {
                ExitCode::SUCCESS
            } else {
                tracing::error!(
                    "pipeline terminated in error (worst severity: {})",
                    summary
                        .worst
                        .map_or("none", Severity::name)
                );
                ExitCode::from(1)
            }
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(2)
        }
    }
}

#[cfg(unix)]
fn install_signal_handlers(handle: PipelineHandle) {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    static INTERRUPTS: AtomicU32 = AtomicU32::new(0);

    extern "C" fn on_signal(_: nix::libc::c_int) {
        INTERRUPTS.fetch_add(1, Ordering::Relaxed);
    }

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Installing a handler is process-global state; the handler itself
    // only touches the atomic.
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
        let _ = sigaction(Signal::SIGTERM, &action);
    }

    std::thread::Builder::new()
        .name("tsp-signals".into())
        .spawn(move || {
            let mut seen = 0;
            loop {
                std::thread::sleep(Duration::from_millis(100));
                let count = INTERRUPTS.load(Ordering::Relaxed);
                if count == seen {
                    continue;
                }
                seen = count;
                if count == 1 {
                    tracing::info!("interrupted, stopping the chain");
                    handle.request_stop();
                } else {
                    tracing::warn!("interrupted again, aborting");
                    handle.force_abort();
                }
            }
        })
        .expect("cannot spawn signal watcher");
}

#[cfg(not(unix))]
fn install_signal_handlers(_handle: PipelineHandle) {}
