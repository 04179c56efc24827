use crate::finding::{Finding, FindingError};
use crate::metrics::{LinePrinter, MetricsPrinter, UpdatingPrinter, format_duration};
use crate::notify::{DesktopNotifier, SystemNotifier};
use crate::report::{FuzzingMetric, Report};
use chrono::Utc;
use colored::Colorize;
use log::debug;
use std::fmt::Display;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("finding before seed corpus directory was set")]
    SeedCorpusNotSet,

    #[error(transparent)]
    Finding(#[from] FindingError),

    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),

    #[error("failed to count corpus entries: {0}")]
    CorpusWalk(#[from] walkdir::Error),
}

/// Consumer of the report stream produced by a runner.
pub trait ReportSink {
    fn handle(&mut self, report: Report) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Default)]
pub struct ReportHandlerOptions {
    pub project_dir: PathBuf,
    pub fuzz_test: String,
    pub generated_corpus_dir: Option<PathBuf>,
    /// Where crashing inputs are copied. Required before the first finding.
    pub managed_seed_corpus_dir: Option<PathBuf>,
    pub user_seed_corpus_dirs: Vec<PathBuf>,
    pub print_json: bool,
}

/// Summary computed once the engine has exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalMetrics {
    pub duration: Duration,
    /// `None` when no usable metric was reported.
    pub average_execs: Option<u64>,
    pub findings: usize,
    pub corpus_entries: u64,
    pub new_corpus_entries: u64,
}

pub struct ReportHandler {
    opts: ReportHandlerOptions,
    ui: Box<dyn Write + Send>,
    json_out: Box<dyn Write + Send>,
    pretty_json: bool,
    printer: Box<dyn MetricsPrinter>,
    notifier: Box<dyn DesktopNotifier>,
    colorize: bool,

    started_at: Instant,
    init_started: bool,
    init_finished: bool,
    num_seeds_at_init: u64,
    first_metric: Option<FuzzingMetric>,
    last_metric: Option<FuzzingMetric>,
    findings: Vec<Finding>,
}

impl ReportHandler {
    /// Writes messages to stderr and JSON to stdout. Metrics go to stdout,
    /// or to stderr in JSON mode, and are updated in place on a terminal.
    pub fn new(opts: ReportHandlerOptions) -> Self {
        let colorize = !opts.print_json && io::stderr().is_terminal();
        let printer = if opts.print_json {
            metrics_printer(io::stderr(), false)
        } else {
            metrics_printer(io::stdout(), colorize)
        };

        Self {
            ui: Box::new(io::stderr()),
            json_out: Box::new(io::stdout()),
            pretty_json: io::stdout().is_terminal(),
            printer,
            notifier: Box::new(SystemNotifier),
            colorize,
            started_at: Instant::now(),
            init_started: false,
            init_finished: false,
            num_seeds_at_init: 0,
            first_metric: None,
            last_metric: None,
            findings: Vec::new(),
            opts,
        }
    }

    pub fn with_ui(mut self, ui: impl Write + Send + 'static) -> Self {
        self.ui = Box::new(ui);
        self.colorize = false;
        self
    }

    pub fn with_json_output(mut self, out: impl Write + Send + 'static, pretty: bool) -> Self {
        self.json_out = Box::new(out);
        self.pretty_json = pretty;
        self
    }

    pub fn with_printer(mut self, printer: impl MetricsPrinter + 'static) -> Self {
        self.printer = Box::new(printer);
        self
    }

    pub fn with_notifier(mut self, notifier: impl DesktopNotifier + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn init_finished(&self) -> bool {
        self.init_finished
    }

    pub fn managed_seed_corpus_dir(&self) -> Option<&Path> {
        self.opts.managed_seed_corpus_dir.as_deref()
    }

    pub fn generated_corpus_dir(&self) -> Option<&Path> {
        self.opts.generated_corpus_dir.as_deref()
    }

    fn say(&mut self, message: impl Display) -> io::Result<()> {
        let message = message.to_string();
        debug!("{message}");
        writeln!(self.ui, "{message}")
    }

    fn number(&self, value: impl Display) -> String {
        if self.colorize {
            value.to_string().bright_cyan().to_string()
        } else {
            value.to_string()
        }
    }

    fn handle_finding(&mut self, finding: &mut Finding) -> Result<(), HandlerError> {
        finding.created_at = Some(Utc::now());
        finding.name = finding.generate_name();

        if finding.input_file.is_some() {
            let seed_corpus = self
                .opts
                .managed_seed_corpus_dir
                .as_deref()
                .ok_or(HandlerError::SeedCorpusNotSet)?;
            finding.attach_crash_input(&self.opts.project_dir, seed_corpus)?;
        }
        finding.fuzz_test = self.opts.fuzz_test.clone();
        finding.save(&self.opts.project_dir)?;

        if self.opts.print_json {
            return Ok(());
        }
        let summary = finding.short_description_with_name();
        let line = if self.colorize {
            summary.red().bold().to_string()
        } else {
            summary.clone()
        };
        self.say(line)?;
        self.notifier.notify("fuzzpilot finding", &summary);
        Ok(())
    }

    fn write_json(&mut self, report: &Report) -> Result<(), HandlerError> {
        let json = if self.pretty_json {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };
        writeln!(self.json_out, "{json}")?;
        self.json_out.flush()?;
        Ok(())
    }

    pub fn print_finding_instruction(&mut self) -> io::Result<()> {
        self.say("\nUse 'fuzzpilot findings <finding name>' for details on a finding.\n")
    }

    /// Lists where reproducing inputs were added to the seed corpus.
    pub fn print_crashing_input_note(&mut self) -> io::Result<()> {
        let inputs: Vec<String> = self
            .findings
            .iter()
            .filter_map(|finding| finding.seed_path.as_deref())
            .map(|path| prettify_path(path, &self.opts.project_dir))
            .collect();
        if inputs.is_empty() {
            return Ok(());
        }

        self.say(format!(
            "\nNote: The reproducing inputs have been copied to the seed corpus at:\n\n    {}\n\n\
             They will now be used as seed inputs for all runs of the fuzz test,\n\
             including regression tests.\n",
            inputs.join("\n    ")
        ))
    }

    /// Counts non-empty files in all seed and generated corpus directories.
    /// Directories that do not exist count as empty.
    pub fn count_corpus_entries(&self) -> Result<u64, HandlerError> {
        let dirs = self
            .opts
            .user_seed_corpus_dirs
            .iter()
            .chain(self.opts.managed_seed_corpus_dir.iter())
            .chain(self.opts.generated_corpus_dir.iter());

        let mut total = 0;
        for dir in dirs {
            if !dir.exists() {
                continue;
            }
            for entry in WalkDir::new(dir) {
                let entry = entry?;
                if entry.file_type().is_dir() {
                    continue;
                }
                if entry.metadata()?.len() != 0 {
                    total += 1;
                }
            }
        }
        Ok(total)
    }

    pub fn final_metrics(&self) -> Result<FinalMetrics, HandlerError> {
        let corpus_entries = self.count_corpus_entries()?;
        // Runs bounded by -runs=N can end with fewer entries than at start.
        let new_corpus_entries = corpus_entries.saturating_sub(self.num_seeds_at_init);

        let elapsed = self.started_at.elapsed();
        let duration = Duration::from_secs(elapsed.as_secs() + 1);

        Ok(FinalMetrics {
            duration,
            average_execs: average_execs(self.first_metric.as_ref(), self.last_metric.as_ref()),
            findings: self.findings.len(),
            corpus_entries,
            new_corpus_entries,
        })
    }

    pub fn print_final_metrics(&mut self) -> Result<(), HandlerError> {
        self.printer.finish()?;
        let metrics = self.final_metrics()?;

        let average = match metrics.average_execs {
            Some(execs) => self.number(execs),
            None => self.number("n/a"),
        };
        let lines = [
            format!("{:<16}{}", "Execution time:", self.number(format_duration(metrics.duration))),
            format!("{:<16}{}", "Average exec/s:", average),
            format!("{:<16}{}", "Findings:", self.number(metrics.findings)),
            format!(
                "{:<16}{} (+{})",
                "Corpus entries:",
                self.number(metrics.corpus_entries),
                self.number(metrics.new_corpus_entries)
            ),
        ];
        for line in lines {
            self.say(line)?;
        }
        Ok(())
    }
}

impl ReportSink for ReportHandler {
    fn handle(&mut self, mut report: Report) -> Result<(), HandlerError> {
        match &mut report {
            Report::CorpusPaths {
                seed_corpus,
                generated_corpus,
            } => {
                if let Some(seed) = seed_corpus.take() {
                    self.opts.managed_seed_corpus_dir = Some(seed);
                }
                if let Some(generated) = generated_corpus.take() {
                    self.opts.generated_corpus_dir = Some(generated);
                }
                return Ok(());
            }
            Report::Initializing { num_seeds } => {
                if !self.init_started {
                    self.init_started = true;
                    self.num_seeds_at_init = *num_seeds;
                    if *num_seeds == 0 {
                        self.say("Starting from an empty corpus")?;
                        self.init_finished = true;
                    } else {
                        let seeds = self.number(num_seeds);
                        self.say(format!("Initializing fuzzer with {seeds} seed inputs"))?;
                    }
                }
            }
            Report::Running => {
                if !self.init_finished {
                    self.say("Successfully initialized fuzzer with seed inputs")?;
                    self.init_finished = true;
                }
            }
            Report::Metric(metric) => {
                if self.first_metric.is_none() {
                    self.first_metric = Some(metric.clone());
                }
                self.last_metric = Some(metric.clone());
                self.printer.print_metrics(metric)?;
            }
            Report::Finding(finding) => {
                if self.findings.is_empty() {
                    self.print_finding_instruction()?;
                }
                self.handle_finding(finding)?;
                self.findings.push((**finding).clone());
            }
        }

        if self.opts.print_json {
            self.write_json(&report)?;
        }
        Ok(())
    }
}

fn average_execs(first: Option<&FuzzingMetric>, last: Option<&FuzzingMetric>) -> Option<u64> {
    let (first, last) = (first?, last?);
    let millis = (last.timestamp - first.timestamp).num_milliseconds();
    let average = if millis <= 0 {
        last.executions_per_second
    } else {
        let execs = last.total_executions.saturating_sub(first.total_executions);
        (execs as f64 / (millis as f64 / 1000.0)) as u64
    };
    (average > 0).then_some(average)
}

fn metrics_printer<W>(out: W, colorize: bool) -> Box<dyn MetricsPrinter>
where
    W: Write + Send + IsTerminal + 'static,
{
    if out.is_terminal() {
        Box::new(UpdatingPrinter::new(out, colorize))
    } else {
        Box::new(LinePrinter::new(out, false))
    }
}

fn prettify_path(path: &Path, project_dir: &Path) -> String {
    path.strip_prefix(project_dir)
        .unwrap_or(path)
        .display()
        .to_string()
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::metrics::MetricsPrinter;
    use crate::notify::DesktopNotifier;
    use crate::report::FuzzingMetric;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    /// Cloneable in-memory writer for capturing handler output.
    #[derive(Clone, Default)]
    pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    pub struct RecordingNotifier(pub Arc<Mutex<Vec<String>>>);

    impl DesktopNotifier for RecordingNotifier {
        fn notify(&self, _title: &str, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    pub struct SilentPrinter;

    impl MetricsPrinter for SilentPrinter {
        fn print_metrics(&mut self, _metric: &FuzzingMetric) -> io::Result<()> {
            Ok(())
        }
    }
}
