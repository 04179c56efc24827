pub mod adapter;
pub mod config;
pub mod executor;
pub mod finding;
pub mod jazzer;
pub mod jazzer_js;
pub mod logging;
pub mod metrics;
pub mod names;
pub mod notify;
pub mod orchestrator;
pub mod output_parser;
pub mod report;
pub mod report_handler;
pub mod sandbox;
pub mod sourcemap;
pub mod stacktrace;
pub mod supervisor;
pub mod upload;

pub use adapter::{BuildError, BuildResult, BuildSystem};
pub use config::{ConfigError, ProjectConfig};
pub use executor::{ExecError, RunError, Runner, RunnerOptions};
pub use finding::{Finding, FindingError};
pub use orchestrator::{Orchestrator, OrchestratorError, RunOptions, RunOutcome};
pub use report::{FuzzingMetric, Report};
pub use report_handler::{ReportHandler, ReportSink};
pub use sandbox::ToolFinder;
pub use stacktrace::{EngineKind, StackFrame, StackTraceParser};
pub use supervisor::{CancellationToken, SignalError};
