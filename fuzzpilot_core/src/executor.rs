use crate::output_parser::OutputParser;
use crate::report_handler::{HandlerError, ReportSink};
use crate::sandbox::{Binding, SandboxError, SandboxLauncher};
use crate::sourcemap::SourceMap;
use crate::stacktrace::{EngineKind, ParseError, ParserOptions, StackTraceParser};
use crate::supervisor::{CancellationToken, SignalError};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

const REAP_INTERVAL: Duration = Duration::from_millis(50);

/// The engine ran but exited unsuccessfully, usually because it found a bug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecError {
    pub command: Vec<String>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExecError {
    fn from_status(command: Vec<String>, status: ExitStatus) -> Self {
        Self {
            command,
            exit_code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let program = self.command.first().map(String::as_str).unwrap_or("fuzzer");
        match (self.exit_code, self.signal) {
            (Some(code), _) => write!(f, "{program} exited with unexpected exit code {code}"),
            (None, Some(signal)) => write!(f, "{program} was terminated by signal {signal}"),
            (None, None) => write!(f, "{program} exited abnormally"),
        }
    }
}

impl std::error::Error for ExecError {}

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error("failed to start {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("fuzzing run was cancelled before the engine started")]
    Cancelled,

    #[error("invalid runner options: {0}")]
    InvalidOptions(String),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("failed to parse engine output: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// A fuzzing engine that can be run once and torn down from another thread.
pub trait Runner: Send + Sync {
    fn run(&self, ctx: &CancellationToken, handler: &mut dyn ReportSink) -> Result<(), RunError>;

    /// Terminates the engine's whole process group. Best effort.
    fn cleanup(&self, ctx: &CancellationToken);
}

/// Inputs shared by every engine.
#[derive(Clone, Default)]
pub struct RunnerOptions {
    pub fuzz_target: PathBuf,
    pub dictionary: Option<PathBuf>,
    pub engine_args: Vec<String>,
    pub env_vars: Vec<(String, String)>,
    pub seed_corpus_dirs: Vec<PathBuf>,
    pub generated_corpus_dir: Option<PathBuf>,
    /// Zero means no time limit.
    pub timeout: Duration,
    pub use_sandbox: bool,
    pub sandbox: Option<Arc<dyn SandboxLauncher>>,
    pub verbose: bool,
    pub project_dir: PathBuf,
    pub read_only_bindings: Vec<PathBuf>,
    pub library_dirs: Vec<PathBuf>,
    pub source_map: Option<SourceMap>,
}

impl RunnerOptions {
    pub fn validate(&self) -> Result<(), RunError> {
        if self.use_sandbox && self.sandbox.is_none() {
            return Err(RunError::InvalidOptions(
                "sandboxing is enabled but no sandbox launcher was configured".to_string(),
            ));
        }
        if !self.timeout.is_zero() && self.timeout < Duration::from_secs(1) {
            return Err(RunError::InvalidOptions(format!(
                "timeout must be at least one second, got {:?}",
                self.timeout
            )));
        }
        Ok(())
    }
}

/// Sets `key` in an environment list, replacing an existing entry.
pub fn set_env(env: &mut Vec<(String, String)>, key: &str, value: impl Into<String>) {
    let value = value.into();
    match env.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value,
        None => env.push((key.to_string(), value)),
    }
}

pub fn env_value<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
    env.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// The libFuzzer command line surface. Runs native targets directly and is
/// composed by the JVM and Node runners.
pub struct LibFuzzerRunner {
    opts: RunnerOptions,
    engine: EngineKind,
    // Held while signalling so a reaped group id is never signalled.
    process_group: Mutex<Option<Pid>>,
}

impl LibFuzzerRunner {
    pub fn new(opts: RunnerOptions) -> Self {
        Self::for_engine(opts, EngineKind::LibFuzzer)
    }

    pub fn for_engine(opts: RunnerOptions, engine: EngineKind) -> Self {
        Self {
            opts,
            engine,
            process_group: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.opts
    }

    /// Appends the flags every libFuzzer based engine understands to the
    /// engine specific `target_args`.
    pub fn fuzzer_args(&self, mut args: Vec<String>, artifact_dir: &Path) -> Vec<String> {
        if !self.opts.timeout.is_zero() {
            args.push(format!("-max_total_time={}", self.opts.timeout.as_secs()));
        }
        if let Some(dict) = &self.opts.dictionary {
            args.push(format!("-dict={}", dict.display()));
        }
        args.extend(self.opts.engine_args.iter().cloned());
        if let Some(generated) = &self.opts.generated_corpus_dir {
            args.push(generated.display().to_string());
        }
        args.extend(
            self.opts
                .seed_corpus_dirs
                .iter()
                .map(|dir| dir.display().to_string()),
        );
        // Crash files must not end up in the working directory.
        args.push(format!("-artifact_prefix={}/", artifact_dir.display()));
        args
    }

    /// The current process environment overlaid with the caller's variables.
    pub fn base_environment(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        for (key, value) in &self.opts.env_vars {
            set_env(&mut env, key, value.clone());
        }
        env
    }

    fn native_environment(&self) -> Vec<(String, String)> {
        let mut env = self.base_environment();
        if !self.opts.library_dirs.is_empty() {
            let mut dirs: Vec<String> = self
                .opts
                .library_dirs
                .iter()
                .map(|dir| dir.display().to_string())
                .collect();
            if let Some(existing) = env_value(&env, "LD_LIBRARY_PATH").filter(|v| !v.is_empty()) {
                dirs.push(existing.to_string());
            }
            set_env(&mut env, "LD_LIBRARY_PATH", dirs.join(":"));
        }
        if env_value(&env, "UBSAN_OPTIONS").is_none() {
            set_env(&mut env, "UBSAN_OPTIONS", "print_stacktrace=1");
        }
        env
    }

    /// Paths the engine may touch when sandboxed.
    pub fn sandbox_bindings(&self, artifact_dir: &Path) -> Vec<Binding> {
        let opts = &self.opts;
        let mut bindings = vec![Binding::writable(artifact_dir)];
        if !opts.fuzz_target.as_os_str().is_empty() {
            bindings.push(Binding::read_only(&opts.fuzz_target));
        }
        if let Some(generated) = &opts.generated_corpus_dir {
            bindings.push(Binding::writable(generated));
        }
        if let Some(dict) = &opts.dictionary {
            bindings.push(Binding::read_only(dict));
        }
        bindings.extend(opts.seed_corpus_dirs.iter().map(Binding::read_only));
        bindings.extend(opts.read_only_bindings.iter().map(Binding::read_only));
        bindings.extend(opts.library_dirs.iter().map(Binding::read_only));
        bindings
    }

    /// Creates the private directory the engine writes crash files to.
    pub fn artifact_dir(prefix: &str) -> Result<tempfile::TempDir, RunError> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .map_err(|source| RunError::Io {
                context: "creating the artifact directory",
                source,
            })
    }

    /// Launches `args` and feeds its output through the report pipeline
    /// until the process exits.
    pub fn run_command(
        &self,
        ctx: &CancellationToken,
        args: Vec<String>,
        env: Vec<(String, String)>,
        bindings: Vec<Binding>,
        handler: &mut dyn ReportSink,
    ) -> Result<(), RunError> {
        self.opts.validate()?;

        let argv = match &self.opts.sandbox {
            Some(launcher) if self.opts.use_sandbox => launcher.wrap(&args, &bindings, &env)?,
            _ => args,
        };
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| RunError::InvalidOptions("empty command line".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(rest)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if !self.opts.project_dir.as_os_str().is_empty() {
            command.current_dir(&self.opts.project_dir);
        }
        debug!("Command: {}", argv.join(" "));

        if ctx.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        let mut child = command.spawn().map_err(|source| RunError::Spawn {
            program: program.clone(),
            source,
        })?;
        *self.group() = Some(Pid::from_raw(child.id() as i32));
        if ctx.is_cancelled() {
            self.terminate();
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, tx.clone()));
        }
        drop(tx);

        let streamed = self.stream_reports(&rx, handler);
        if streamed.is_err() {
            self.terminate();
        }

        let status = self.reap(&mut child);
        for reader in readers {
            if reader.join().is_err() {
                warn!("Output reader thread panicked");
            }
        }

        streamed?;
        let status = status?;
        if status.success() {
            return Ok(());
        }
        Err(ExecError::from_status(argv, status).into())
    }

    fn stream_reports(
        &self,
        rx: &Receiver<String>,
        handler: &mut dyn ReportSink,
    ) -> Result<(), RunError> {
        let mut parser = OutputParser::new(StackTraceParser::new(ParserOptions {
            project_dir: self.opts.project_dir.clone(),
            source_map: self.opts.source_map.clone(),
            engine: self.engine,
        }));

        for line in rx.iter() {
            if self.opts.verbose {
                eprintln!("{}", line.trim_end());
            }
            for report in parser.parse_line(&line)? {
                handler.handle(report)?;
            }
        }
        for report in parser.finish()? {
            handler.handle(report)?;
        }
        Ok(())
    }

    fn group(&self) -> MutexGuard<'_, Option<Pid>> {
        self.process_group
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // The group id is cleared under the same lock that reaps the child.
    fn reap(&self, child: &mut Child) -> Result<ExitStatus, RunError> {
        loop {
            let mut group = self.group();
            match child.try_wait() {
                Ok(Some(status)) => {
                    *group = None;
                    return Ok(status);
                }
                Ok(None) => {
                    drop(group);
                    thread::sleep(REAP_INTERVAL);
                }
                Err(source) => {
                    *group = None;
                    return Err(RunError::Io {
                        context: "waiting for the fuzzer",
                        source,
                    });
                }
            }
        }
    }

    /// Sends SIGTERM to the engine's process group if one is running.
    pub fn terminate(&self) {
        let group = self.group();
        let Some(pgid) = *group else {
            return;
        };
        debug!("Terminating process group {pgid}");
        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            debug!("Failed to terminate process group {pgid}: {e}");
        }
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.group().is_some()
    }
}

impl Runner for LibFuzzerRunner {
    fn run(&self, ctx: &CancellationToken, handler: &mut dyn ReportSink) -> Result<(), RunError> {
        let artifact_dir = Self::artifact_dir("libfuzzer-out-")?;
        let target = vec![self.opts.fuzz_target.display().to_string()];
        let args = self.fuzzer_args(target, artifact_dir.path());
        let bindings = self.sandbox_bindings(artifact_dir.path());
        self.run_command(ctx, args, self.native_environment(), bindings, handler)
    }

    fn cleanup(&self, _ctx: &CancellationToken) {
        self.terminate();
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(reader: R, tx: Sender<String>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Stopped reading engine output: {e}");
                    break;
                }
            }
        }
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::{RecordingSink, fake_engine};
    use super::*;
    use crate::report::Report;
    use std::time::Instant;
    use tempfile::tempdir;

    fn options(target: PathBuf, project: &Path) -> RunnerOptions {
        RunnerOptions {
            fuzz_target: target,
            project_dir: project.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn universal_flags_follow_target_flags() {
        let runner = LibFuzzerRunner::new(RunnerOptions {
            fuzz_target: PathBuf::from("/build/fuzzer"),
            dictionary: Some(PathBuf::from("/proj/dict.txt")),
            engine_args: vec!["-runs=100".to_string(), "-seed=1".to_string()],
            seed_corpus_dirs: vec![PathBuf::from("/proj/seeds_a"), PathBuf::from("/proj/seeds_b")],
            generated_corpus_dir: Some(PathBuf::from("/proj/.generated")),
            timeout: Duration::from_secs(30),
            ..Default::default()
        });

        let args = runner.fuzzer_args(vec!["/build/fuzzer".to_string()], Path::new("/tmp/out"));

        assert_eq!(
            args,
            vec![
                "/build/fuzzer",
                "-max_total_time=30",
                "-dict=/proj/dict.txt",
                "-runs=100",
                "-seed=1",
                "/proj/.generated",
                "/proj/seeds_a",
                "/proj/seeds_b",
                "-artifact_prefix=/tmp/out/",
            ]
        );
    }

    #[test]
    fn zero_timeout_adds_no_time_limit() {
        let runner = LibFuzzerRunner::new(RunnerOptions::default());
        let args = runner.fuzzer_args(Vec::new(), Path::new("/tmp/out"));
        assert_eq!(args, vec!["-artifact_prefix=/tmp/out/"]);
    }

    #[test]
    fn caller_variables_override_process_environment() {
        let runner = LibFuzzerRunner::new(RunnerOptions {
            env_vars: vec![("PATH".to_string(), "/custom/bin".to_string())],
            library_dirs: vec![PathBuf::from("/opt/lib")],
            ..Default::default()
        });

        let env = runner.native_environment();

        assert_eq!(env_value(&env, "PATH"), Some("/custom/bin"));
        assert!(env_value(&env, "LD_LIBRARY_PATH").unwrap().starts_with("/opt/lib"));
        assert_eq!(env.iter().filter(|(k, _)| k == "PATH").count(), 1);
    }

    #[test]
    fn sandbox_without_launcher_is_rejected() {
        let opts = RunnerOptions {
            use_sandbox: true,
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(RunError::InvalidOptions(_))));
    }

    #[test_log::test]
    fn clean_exit_streams_reports() {
        let project = tempdir().unwrap();
        let target = fake_engine(
            project.path(),
            "fuzzer",
            r##"echo "INFO: seed corpus: files: 2 min: 1b max: 1b total: 2b rss: 1Mb" >&2
echo "#3	INITED cov: 1 ft: 1 corp: 1/1b exec/s: 0 rss: 1Mb" >&2
exit 0"##,
        );
        let runner = LibFuzzerRunner::new(options(target, project.path()));
        let mut sink = RecordingSink::default();

        runner.run(&CancellationToken::new(), &mut sink).unwrap();

        assert_eq!(sink.reports.len(), 3, "Unexpected reports: {:?}", sink.reports);
        assert_eq!(sink.reports[0], Report::Initializing { num_seeds: 2 });
        assert_eq!(sink.reports[1], Report::Running);
    }

    #[test_log::test]
    fn crash_is_reported_and_exit_code_kept() {
        let project = tempdir().unwrap();
        let target = fake_engine(
            project.path(),
            "fuzzer",
            r#"for arg in "$@"; do
  case "$arg" in -artifact_prefix=*) prefix="${arg#-artifact_prefix=}";; esac
done
printf 'AAAA' > "${prefix}crash-1"
echo "==7==ERROR: AddressSanitizer: heap-use-after-free on address 0x1" >&2
echo "artifact_prefix='$prefix'; Test unit written to ${prefix}crash-1" >&2
exit 1"#,
        );
        let runner = LibFuzzerRunner::new(options(target, project.path()));
        let mut sink = RecordingSink::default();

        let result = runner.run(&CancellationToken::new(), &mut sink);

        match result {
            Err(RunError::Exec(err)) => {
                assert_eq!(err.exit_code, Some(1));
                assert!(err.command.iter().any(|arg| arg.starts_with("-artifact_prefix=")));
            }
            other => panic!("Expected an ExecError, got {other:?}"),
        }
        match sink.reports.as_slice() {
            [Report::Finding(finding)] => {
                assert_eq!(finding.input_data, b"AAAA");
                assert!(finding.details.starts_with("heap-use-after-free"));
            }
            other => panic!("Expected one finding, got {other:?}"),
        }
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let project = tempdir().unwrap();
        let runner = LibFuzzerRunner::new(options(project.path().join("missing"), project.path()));
        let mut sink = RecordingSink::default();

        match runner.run(&CancellationToken::new(), &mut sink) {
            Err(RunError::Spawn { program, .. }) => assert!(program.ends_with("missing")),
            other => panic!("Expected a spawn error, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_context_does_not_start_engine() {
        let project = tempdir().unwrap();
        let target = fake_engine(project.path(), "fuzzer", "touch started");
        let runner = LibFuzzerRunner::new(options(target, project.path()));
        let ctx = CancellationToken::new();
        ctx.cancel();

        let result = runner.run(&ctx, &mut RecordingSink::default());

        assert!(matches!(result, Err(RunError::Cancelled)), "got {result:?}");
        assert!(!project.path().join("started").exists());
    }

    #[test_log::test]
    fn reaped_engine_leaves_no_group_to_signal() {
        let project = tempdir().unwrap();
        let target = fake_engine(project.path(), "fuzzer", "exit 0");
        let runner = LibFuzzerRunner::new(options(target, project.path()));

        runner.run(&CancellationToken::new(), &mut RecordingSink::default()).unwrap();

        assert!(!runner.is_running());
        runner.cleanup(&CancellationToken::new());
    }

    #[test_log::test]
    fn cleanup_terminates_process_group() {
        let project = tempdir().unwrap();
        let target = fake_engine(project.path(), "fuzzer", "sleep 30 &\nwait");
        let runner = LibFuzzerRunner::new(options(target, project.path()));
        let ctx = CancellationToken::new();
        let started = Instant::now();

        let result = thread::scope(|s| {
            let handle = s.spawn(|| runner.run(&ctx, &mut RecordingSink::default()));
            while !runner.is_running() {
                assert!(started.elapsed() < Duration::from_secs(10), "engine never started");
                thread::sleep(Duration::from_millis(10));
            }
            runner.cleanup(&ctx);
            handle.join().unwrap()
        });

        assert!(started.elapsed() < Duration::from_secs(20));
        match result {
            Err(RunError::Exec(err)) => assert_eq!(err.signal, Some(Signal::SIGTERM as i32)),
            other => panic!("Expected termination by signal, got {other:?}"),
        }
    }
}
