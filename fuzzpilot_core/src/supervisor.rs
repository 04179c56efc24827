use crate::executor::{RunError, Runner};
use crate::report_handler::ReportSink;
use log::{debug, warn};
use nix::sys::signal::Signal;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use thiserror::Error;

/// Shared, one-way cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The run was ended by an OS signal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("fuzzing was stopped by {name}")]
pub struct SignalError {
    pub signal: i32,
    pub name: String,
}

impl SignalError {
    pub fn new(signal: i32) -> Self {
        let name = Signal::try_from(signal)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| format!("signal {signal}"));
        Self { signal, name }
    }

    /// Shell convention for processes ended by a signal.
    pub fn exit_code(&self) -> i32 {
        128 + self.signal
    }
}

/// Runs `runner` while watching for SIGINT, SIGTERM and SIGQUIT.
///
/// A received signal cancels the run and tears down the engine. The signal
/// is then reported instead of whatever error the killed engine produced.
pub fn execute_runner(runner: &dyn Runner, handler: &mut dyn ReportSink) -> Result<(), RunError> {
    let ctx = CancellationToken::new();
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT]).map_err(|source| RunError::Io {
        context: "installing signal handlers",
        source,
    })?;
    let signals_handle = signals.handle();
    let terminal_signal: OnceLock<SignalError> = OnceLock::new();

    let result = thread::scope(|s| {
        let (ctx, slot) = (&ctx, &terminal_signal);
        let watcher = s.spawn(move || {
            if let Some(signal) = signals.forever().next() {
                let err = SignalError::new(signal);
                warn!("Received {}, stopping the fuzzer", err.name);
                let _ = slot.set(err);
                ctx.cancel();
                runner.cleanup(ctx);
            }
        });

        let result = runner.run(ctx, handler);
        ctx.cancel();
        signals_handle.close();
        if watcher.join().is_err() {
            warn!("Signal watcher panicked");
        }
        result
    });

    if let Some(err) = terminal_signal.into_inner() {
        if let Err(run_err) = &result {
            debug!("Ignoring run error after signal: {run_err}");
        }
        return Err(err.into());
    }
    result
}
