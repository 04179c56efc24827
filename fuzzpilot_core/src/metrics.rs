use crate::report::FuzzingMetric;
use colored::{Color, Colorize};
use std::fmt::Display;
use std::io::{self, Write};
use std::time::{Duration, Instant};

/// Displays the running throughput of the engine.
pub trait MetricsPrinter: Send {
    fn print_metrics(&mut self, metric: &FuzzingMetric) -> io::Result<()>;

    /// Called once after the last metric.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn paint(value: impl Display, color: Color, colorize: bool) -> String {
    if colorize {
        value.to_string().color(color).to_string()
    } else {
        value.to_string()
    }
}

pub fn metrics_to_string(metric: &FuzzingMetric, colorize: bool) -> String {
    format!(
        "{} exec/s | {} edges | {} features | {} corpus entries | {} executions | last new feature {}s ago",
        paint(metric.executions_per_second, Color::Green, colorize),
        paint(metric.edges, Color::Cyan, colorize),
        paint(metric.features, Color::Cyan, colorize),
        paint(metric.corpus_size, Color::Blue, colorize),
        paint(metric.total_executions, Color::Magenta, colorize),
        metric.seconds_since_last_feature,
    )
}

/// Formats whole seconds as `1h2m3s`, dropping leading zero units.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs % 3600 / 60, secs % 60);
    match (hours, minutes) {
        (0, 0) => format!("{seconds}s"),
        (0, _) => format!("{minutes}m{seconds}s"),
        _ => format!("{hours}h{minutes}m{seconds}s"),
    }
}

/// Appends one line per metric. Used for log files and pipes.
pub struct LinePrinter<W: Write + Send> {
    out: W,
    colorize: bool,
}

impl<W: Write + Send> LinePrinter<W> {
    pub fn new(out: W, colorize: bool) -> Self {
        Self { out, colorize }
    }
}

impl<W: Write + Send> MetricsPrinter for LinePrinter<W> {
    fn print_metrics(&mut self, metric: &FuzzingMetric) -> io::Result<()> {
        writeln!(self.out, "{}", metrics_to_string(metric, self.colorize))
    }
}

/// Rewrites a single terminal line in place.
pub struct UpdatingPrinter<W: Write + Send> {
    out: W,
    colorize: bool,
    started_at: Instant,
    active: bool,
}

impl<W: Write + Send> UpdatingPrinter<W> {
    pub fn new(out: W, colorize: bool) -> Self {
        Self {
            out,
            colorize,
            started_at: Instant::now(),
            active: false,
        }
    }
}

impl<W: Write + Send> MetricsPrinter for UpdatingPrinter<W> {
    fn print_metrics(&mut self, metric: &FuzzingMetric) -> io::Result<()> {
        let elapsed = format_duration(self.started_at.elapsed());
        write!(
            self.out,
            "\r\x1b[2K{} ({})",
            metrics_to_string(metric, self.colorize),
            paint(elapsed, Color::BrightYellow, self.colorize)
        )?;
        self.active = true;
        self.out.flush()
    }

    fn finish(&mut self) -> io::Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        writeln!(self.out)
    }
}
