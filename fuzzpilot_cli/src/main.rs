use fuzzpilot_core::adapter::BuildSystem;
use fuzzpilot_core::config::ProjectConfig;
use fuzzpilot_core::finding::{self, ErrorDetails, Finding};
use fuzzpilot_core::logging;
use fuzzpilot_core::orchestrator::{Orchestrator, OrchestratorError, RunOptions};
use fuzzpilot_core::sandbox::ToolFinder;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use log::{error, info};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Show build output and debug logs
    #[clap(short, long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build and run a fuzz test
    Run(RunArgs),
    /// List local findings or show one of them
    Findings(FindingsArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Fuzz test to run, e.g. `my_fuzz_test`, `com.example.FuzzTest::fuzz`
    /// or `fuzz/parser.fuzz.js:parses input`
    fuzz_test: String,
    /// Config file to use instead of `<project dir>/fuzzpilot.toml`
    #[clap(long, value_parser)]
    config: Option<PathBuf>,
    #[clap(long, value_parser)]
    project_dir: Option<PathBuf>,
    #[clap(long)]
    build_system: Option<BuildSystem>,
    #[clap(long)]
    build_command: Option<String>,
    #[clap(long)]
    clean_command: Option<String>,
    #[clap(long, value_parser)]
    dict: Option<PathBuf>,
    /// Extra engine argument, can be repeated
    #[clap(long = "engine-arg", allow_hyphen_values = true)]
    engine_args: Vec<String>,
    /// Additional seed corpus directory, can be repeated
    #[clap(long = "seed-corpus", value_parser)]
    seed_corpus_dirs: Vec<PathBuf>,
    /// Maximum fuzzing time, e.g. `30`, `30s`, `5m` or `1h`
    #[clap(long, value_parser = parse_duration)]
    timeout: Option<Duration>,
    #[clap(long)]
    use_sandbox: bool,
    /// Print reports as JSON
    #[clap(long)]
    json: bool,
    #[clap(long)]
    build_only: bool,
    /// Remote project to upload findings to
    #[clap(long)]
    project: Option<String>,
    #[clap(long)]
    interactive: Option<bool>,
    /// Arguments passed on to the build system
    #[clap(last = true)]
    build_args: Vec<String>,
}

#[derive(Args, Debug)]
struct FindingsArgs {
    /// Print this finding as JSON
    name: Option<String>,
    #[clap(long, value_parser)]
    project_dir: Option<PathBuf>,
    /// JSON file with error details to attach to findings
    #[clap(long, value_parser)]
    error_details: Option<PathBuf>,
}

/// Invalid configuration or usage.
#[derive(Debug)]
struct UsageError;

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid configuration")
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {value:?}"))?;
    let seconds = match unit {
        "" | "s" => number,
        "m" => number * 60,
        "h" => number * 60 * 60,
        _ => return Err(format!("invalid duration unit {unit:?}, use s, m or h")),
    };
    Ok(Duration::from_secs(seconds))
}

/// Flags win over the config file; lists from the command line replace
/// the configured ones.
fn run_options(args: RunArgs, config: ProjectConfig, project_dir: PathBuf, verbose: bool) -> RunOptions {
    let timeout = args.timeout.or(config.timeout()).unwrap_or_default();

    RunOptions {
        project_dir,
        fuzz_test: args.fuzz_test,
        build_system: args.build_system.or(config.build_system),
        build_command: args.build_command.or(config.build_command),
        clean_command: args.clean_command.or(config.clean_command),
        build_system_args: args.build_args,
        dictionary: args.dict.or(config.dict),
        engine_args: prefer(args.engine_args, config.engine_args),
        seed_corpus_dirs: prefer(args.seed_corpus_dirs, config.seed_corpus_dirs),
        timeout,
        use_sandbox: args.use_sandbox || config.use_sandbox.unwrap_or(false),
        print_json: args.json || config.print_json.unwrap_or(false),
        build_only: args.build_only,
        verbose,
        project: args.project.or(config.project),
        server: config.server,
        interactive: args.interactive.or(config.interactive).unwrap_or(true),
    }
}

fn prefer<T>(cli: Vec<T>, file: Vec<T>) -> Vec<T> {
    if cli.is_empty() { file } else { cli }
}

fn project_dir(dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to determine the working directory")?,
    };
    dir.canonicalize()
        .with_context(|| format!("Project directory {dir:?} does not exist"))
}

/// Bundled tools live in `<install dir>/bin` next to the executable.
fn install_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent()?.parent().map(Path::to_path_buf)
}

fn run(args: RunArgs, verbose: bool) -> anyhow::Result<()> {
    let project_dir = project_dir(args.project_dir.clone())?;
    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {path:?}");
            ProjectConfig::load_from_file(path)
        }
        None => ProjectConfig::find_in(&project_dir),
    }
    .context(UsageError)?;

    let opts = run_options(args, config, project_dir, verbose);
    let build_only = opts.build_only;
    let outcome = Orchestrator::new(opts, ToolFinder::from_env(install_dir())).run()?;

    if build_only {
        info!("Built {}", outcome.build.executable.display());
    } else if !outcome.findings.is_empty() && outcome.uploaded == 0 {
        info!(
            "{} finding(s) kept locally, see 'fuzzpilot findings'",
            outcome.findings.len()
        );
    }
    Ok(())
}

fn findings(args: FindingsArgs) -> anyhow::Result<()> {
    let project_dir = project_dir(args.project_dir)?;
    let error_details: Option<Vec<ErrorDetails>> = args
        .error_details
        .as_deref()
        .map(finding::load_error_details)
        .transpose()?;

    if let Some(name) = args.name {
        let finding = finding::load(&project_dir, &name, error_details.as_deref())?;
        println!("{}", serde_json::to_string_pretty(&finding)?);
        return Ok(());
    }

    let local = finding::list_local(&project_dir, error_details.as_deref())?;
    if local.is_empty() {
        println!("This project doesn't have any findings yet.");
        return Ok(());
    }
    for finding in &local {
        println!("{}", finding_row(finding));
    }
    Ok(())
}

fn finding_row(finding: &Finding) -> String {
    let created = finding
        .created_at
        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    let severity = finding
        .more_details
        .as_ref()
        .and_then(|details| details.severity.as_ref())
        .map(|severity| format!("{:.1}", severity.score))
        .unwrap_or_else(|| "n/a".to_string());
    format!(
        "{} {:<16} {:>4}  {}",
        format!("{:<28}", finding.name).bold(),
        created,
        severity,
        finding.short_description()
    )
}

fn exit_code(err: &anyhow::Error) -> u8 {
    let code = if let Some(err) = err.downcast_ref::<OrchestratorError>() {
        err.exit_code()
    } else if err.downcast_ref::<UsageError>().is_some() {
        2
    } else {
        1
    };
    u8::try_from(code).unwrap_or(1)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let result = match cli.command {
        Command::Run(args) => run(args, cli.verbose),
        Command::Findings(args) => findings(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use fuzzpilot_core::config::ConfigError;
    use fuzzpilot_core::executor::{ExecError, RunError};
    use fuzzpilot_core::supervisor::SignalError;

    fn run_args(argv: &[&str]) -> RunArgs {
        match Cli::parse_from(argv).command {
            Command::Run(args) => args,
            other => panic!("Expected the run command, got {other:?}"),
        }
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn durations_accept_units() {
        assert_eq!(parse_duration("30"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn run_flags_are_parsed() {
        let args = run_args(&[
            "fuzzpilot",
            "run",
            "parser_fuzzer",
            "--build-system",
            "CMake",
            "--engine-arg",
            "-runs=100",
            "--engine-arg",
            "-seed=1",
            "--timeout",
            "5m",
            "--interactive",
            "false",
            "--",
            "-DFOO=1",
        ]);

        assert_eq!(args.fuzz_test, "parser_fuzzer");
        assert_eq!(args.build_system, Some(BuildSystem::CMake));
        assert_eq!(args.engine_args, vec!["-runs=100", "-seed=1"]);
        assert_eq!(args.timeout, Some(Duration::from_secs(300)));
        assert_eq!(args.interactive, Some(false));
        assert_eq!(args.build_args, vec!["-DFOO=1"]);
    }

    #[test]
    fn flags_override_config_file() {
        let args = run_args(&["fuzzpilot", "run", "fuzz", "--engine-arg", "-runs=1", "--json"]);
        let config = ProjectConfig {
            build_system: Some(BuildSystem::Other),
            build_command: Some("make".to_string()),
            engine_args: vec!["-runs=1000".to_string()],
            seed_corpus_dirs: vec![PathBuf::from("/seeds")],
            timeout_secs: Some(60),
            interactive: Some(false),
            project: Some("projects/demo".to_string()),
            ..Default::default()
        };

        let opts = run_options(args, config, PathBuf::from("/work"), true);

        assert_eq!(opts.build_system, Some(BuildSystem::Other));
        assert_eq!(opts.engine_args, vec!["-runs=1"]);
        assert_eq!(opts.seed_corpus_dirs, vec![PathBuf::from("/seeds")]);
        assert_eq!(opts.timeout, Duration::from_secs(60));
        assert!(opts.print_json);
        assert!(!opts.interactive);
        assert!(opts.verbose);
        assert_eq!(opts.project.as_deref(), Some("projects/demo"));
    }

    #[test]
    fn interactive_defaults_to_true() {
        let opts = run_options(
            run_args(&["fuzzpilot", "run", "fuzz"]),
            ProjectConfig::default(),
            PathBuf::from("/work"),
            false,
        );
        assert!(opts.interactive);
        assert_eq!(opts.timeout, Duration::ZERO);
    }

    #[test]
    fn errors_map_to_exit_codes() {
        let signal = anyhow::Error::new(OrchestratorError::Run(RunError::Signal(SignalError::new(2))));
        assert_eq!(exit_code(&signal), 130);

        let engine = anyhow::Error::new(OrchestratorError::Run(RunError::Exec(ExecError {
            command: vec!["fuzzer".to_string()],
            exit_code: Some(77),
            signal: None,
        })));
        assert_eq!(exit_code(&engine), 77);

        let config = anyhow::Error::new(OrchestratorError::Config(ConfigError::MissingFuzzTest));
        assert_eq!(exit_code(&config), 2);

        let file = anyhow::anyhow!("Failed to parse TOML").context(UsageError);
        assert_eq!(exit_code(&file), 2);

        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }
}
