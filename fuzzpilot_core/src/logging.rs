use colored::Colorize;
use log::{Level, LevelFilter, SetLoggerError};
use std::io::Write;

/// Installs the global logger. `info` by default, `debug` with `verbose`;
/// `RUST_LOG` overrides both.
pub fn init(verbose: bool) -> Result<(), SetLoggerError> {
    env_logger::Builder::new()
        .filter_level(default_level(verbose))
        .parse_env(env_logger::Env::default().filter("RUST_LOG"))
        .format(|buf, record| {
            let message = record.args().to_string();
            let line = match record.level() {
                Level::Error => message.red().bold(),
                Level::Warn => message.yellow().bold(),
                Level::Info => message.normal(),
                Level::Debug | Level::Trace => message.dimmed(),
            };
            writeln!(buf, "{line}")
        })
        .try_init()
}

fn default_level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}
