use crate::adapter::{
    BuildAdapter, BuildError, BuildOptions, BuildOutput, BuildResult, BuildSystem, Spinner,
    jazzer_js_seed_corpus, jazzer_seed_corpus, new_adapter, split_fuzz_test,
};
use crate::config::ConfigError;
use crate::executor::{LibFuzzerRunner, RunError, Runner, RunnerOptions};
use crate::finding::Finding;
use crate::jazzer::{JazzerRunner, JazzerTarget};
use crate::jazzer_js::JazzerJsRunner;
use crate::report_handler::{HandlerError, ReportHandler, ReportHandlerOptions};
use crate::sandbox::{MinijailLauncher, SandboxError, SandboxLauncher, ToolFinder};
use crate::sourcemap::{SourceMap, SourceMapError};
use crate::supervisor::execute_runner;
use crate::upload::{
    ProjectPicker, PromptPicker, UploadClient, UploadError, token_from_env, upload_findings,
};
use log::{debug, error, info, warn};
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    SourceMap(#[from] SourceMapError),

    #[error("failed to prepare {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

impl OrchestratorError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Run(RunError::Signal(err)) => err.exit_code(),
            OrchestratorError::Run(RunError::Exec(err)) => err.exit_code.unwrap_or(1),
            OrchestratorError::Config(_)
            | OrchestratorError::Build(BuildError::UnknownBuildSystem(_))
            | OrchestratorError::Build(BuildError::MissingBuildCommand) => 2,
            _ => 1,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> OrchestratorError + '_ {
    move |source| OrchestratorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Everything one `run` invocation needs, after config and flags are merged.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub project_dir: PathBuf,
    pub fuzz_test: String,
    /// Detected from marker files when unset.
    pub build_system: Option<BuildSystem>,
    pub build_command: Option<String>,
    pub clean_command: Option<String>,
    pub build_system_args: Vec<String>,
    pub dictionary: Option<PathBuf>,
    pub engine_args: Vec<String>,
    pub seed_corpus_dirs: Vec<PathBuf>,
    pub timeout: Duration,
    pub use_sandbox: bool,
    pub print_json: bool,
    pub build_only: bool,
    pub verbose: bool,
    pub project: Option<String>,
    pub server: Option<String>,
    pub interactive: bool,
}

impl RunOptions {
    /// Checks the options and resolves the build system.
    pub fn validate(&mut self) -> Result<BuildSystem, ConfigError> {
        if self.fuzz_test.is_empty() {
            return Err(ConfigError::MissingFuzzTest);
        }
        if !self.timeout.is_zero() && self.timeout < Duration::from_secs(1) {
            return Err(ConfigError::InvalidTimeout(self.timeout));
        }

        let system = match self.build_system {
            Some(system) => system,
            None => BuildSystem::detect(&self.project_dir)
                .ok_or_else(|| ConfigError::UnknownBuildSystem(self.project_dir.clone()))?,
        };
        self.build_system = Some(system);
        if system == BuildSystem::Other && self.build_command.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingBuildCommand);
        }

        if let Some(dict) = &self.dictionary {
            if !dict.is_file() {
                return Err(ConfigError::DictionaryNotFound(dict.clone()));
            }
        }
        if let Some(missing) = self.seed_corpus_dirs.iter().find(|dir| !dir.is_dir()) {
            return Err(ConfigError::SeedCorpusNotFound(missing.clone()));
        }
        Ok(system)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    SelectAdapter,
    Build,
    PrepareCorpusDirs,
    ConstructReportHandler,
    ConstructRunner,
    Execute,
    PrintSummary,
    Upload,
}

/// Skip the upload when nobody could pick a project.
pub fn should_upload(project: Option<&str>, interactive: bool, is_terminal: bool) -> bool {
    if project.is_some_and(|p| !p.is_empty()) {
        return true;
    }
    if !interactive {
        info!("Skipping upload of findings, no project was specified and running non-interactively");
        return false;
    }
    if !is_terminal {
        info!("Skipping upload of findings, no project was specified and no terminal is attached");
        return false;
    }
    true
}

/// What a finished run produced.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub build: BuildResult,
    pub findings: Vec<Finding>,
    pub uploaded: usize,
}

type HandlerSetup<'a> = Box<dyn FnOnce(ReportHandler) -> ReportHandler + 'a>;

/// Drives a fuzz test from build to upload.
pub struct Orchestrator<'a> {
    opts: RunOptions,
    tools: ToolFinder,
    ui: Box<dyn Write + Send + 'a>,
    handler_setup: Option<HandlerSetup<'a>>,
    upload_client: Option<&'a dyn UploadClient>,
    picker: Option<Box<dyn ProjectPicker + 'a>>,
    token: Option<String>,
    is_terminal: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(opts: RunOptions, tools: ToolFinder) -> Self {
        Self {
            opts,
            tools,
            ui: Box::new(io::stderr()),
            handler_setup: None,
            upload_client: None,
            picker: None,
            token: token_from_env(),
            is_terminal: io::stdin().is_terminal() && io::stderr().is_terminal(),
        }
    }

    pub fn with_ui(mut self, ui: impl Write + Send + 'a) -> Self {
        self.ui = Box::new(ui);
        self
    }

    /// Adjusts the report handler before the run starts.
    pub fn with_handler_setup(mut self, setup: impl FnOnce(ReportHandler) -> ReportHandler + 'a) -> Self {
        self.handler_setup = Some(Box::new(setup));
        self
    }

    pub fn with_upload_client(mut self, client: &'a dyn UploadClient) -> Self {
        self.upload_client = Some(client);
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_picker(mut self, picker: impl ProjectPicker + 'a) -> Self {
        self.picker = Some(Box::new(picker));
        self
    }

    pub fn with_terminal(mut self, is_terminal: bool) -> Self {
        self.is_terminal = is_terminal;
        self
    }

    fn enter(&self, stage: RunStage) {
        debug!("Run stage: {stage:?}");
    }

    pub fn run(mut self) -> Result<RunOutcome, OrchestratorError> {
        self.enter(RunStage::SelectAdapter);
        let system = self.opts.validate()?;
        let adapter = new_adapter(
            system,
            BuildOptions {
                project_dir: self.opts.project_dir.clone(),
                build_command: self.opts.build_command.clone(),
                clean_command: self.opts.clean_command.clone(),
                args: self.opts.build_system_args.clone(),
                tools: self.tools.clone(),
            },
        )?;

        self.enter(RunStage::Build);
        let mut build = self.build(adapter.as_ref())?;
        if self.opts.build_only {
            return Ok(RunOutcome {
                build,
                ..Default::default()
            });
        }

        self.enter(RunStage::PrepareCorpusDirs);
        let seed_dirs = self.prepare_corpus_dirs(system, &mut build)?;

        self.enter(RunStage::ConstructReportHandler);
        let mut handler = ReportHandler::new(ReportHandlerOptions {
            project_dir: self.opts.project_dir.clone(),
            fuzz_test: self.opts.fuzz_test.clone(),
            generated_corpus_dir: build.generated_corpus.clone(),
            managed_seed_corpus_dir: build.seed_corpus.clone(),
            user_seed_corpus_dirs: self.opts.seed_corpus_dirs.clone(),
            print_json: self.opts.print_json,
        });
        if let Some(setup) = self.handler_setup.take() {
            handler = setup(handler);
        }

        self.enter(RunStage::ConstructRunner);
        // The chroot directory has to outlive the run.
        let (sandbox, _chroot) = self.sandbox()?;
        let runner = self.runner(system, &build, seed_dirs, sandbox)?;
        info!("Running {}", self.opts.fuzz_test);
        if !build.executable.as_os_str().is_empty() {
            debug!("Executable: {:?}", build.executable);
        }

        self.enter(RunStage::Execute);
        if let Err(err) = execute_runner(runner.as_ref(), &mut handler) {
            // The engine ran, so what it found is still summarized.
            if matches!(err, RunError::Exec(_) | RunError::Signal(_)) {
                self.enter(RunStage::PrintSummary);
                if let Err(summary_err) = print_summary(&mut handler) {
                    warn!("Failed to print the run summary: {summary_err}");
                }
            }
            return Err(self.run_failure(err));
        }

        self.enter(RunStage::PrintSummary);
        print_summary(&mut handler)?;

        let findings = handler.findings().to_vec();
        let uploaded = self.upload(&findings)?;
        Ok(RunOutcome {
            build,
            findings,
            uploaded,
        })
    }

    /// Without `verbose`, build output goes to a log file that is dumped
    /// only when the build fails.
    fn build(&mut self, adapter: &dyn BuildAdapter) -> Result<BuildResult, OrchestratorError> {
        let fuzz_test = &self.opts.fuzz_test;
        if self.opts.verbose {
            return Ok(adapter.build(fuzz_test, &BuildOutput::inherit())?);
        }

        let output = BuildOutput::to_log_file(&self.opts.project_dir, fuzz_test)?;
        let spinner = Spinner::start(&format!("Building {fuzz_test}"));
        match adapter.build(fuzz_test, &output) {
            Ok(result) => {
                spinner.stop(&format!("Built {fuzz_test}"));
                Ok(result)
            }
            Err(err) => {
                drop(spinner);
                if let Some(path) = output.log_path() {
                    error!("Build failed, full log at {path:?}");
                }
                output.dump(&mut self.ui)?;
                Err(err.into())
            }
        }
    }

    /// Creates the corpus directories the engine expects and returns the
    /// seed directories to pass to it.
    fn prepare_corpus_dirs(
        &mut self,
        system: BuildSystem,
        build: &mut BuildResult,
    ) -> Result<Vec<PathBuf>, OrchestratorError> {
        let project_dir = self.opts.project_dir.clone();

        if system.is_node() {
            let (test_path, test_name) = split_node_fuzz_test(&self.opts.fuzz_test);
            let seed = jazzer_js_seed_corpus(&project_dir, test_path, test_name);
            fs::create_dir_all(&seed).map_err(io_err(&seed))?;
            build.seed_corpus = Some(seed);
            return Ok(Vec::new());
        }

        // The sandbox binds real paths, so symlinks are resolved.
        for dir in &mut self.opts.seed_corpus_dirs {
            *dir = dir.canonicalize().map_err(io_err(dir))?;
        }
        let mut seeds = self.opts.seed_corpus_dirs.clone();

        if system.is_jvm() {
            // Jazzer creates the generated corpus and announces it.
            let (class, method) = split_fuzz_test(&self.opts.fuzz_test);
            let seed = jazzer_seed_corpus(class, method, &project_dir);
            fs::create_dir_all(&seed).map_err(io_err(&seed))?;
            build.seed_corpus = Some(seed.clone());
            seeds.push(seed);
            return Ok(seeds);
        }

        if let Some(generated) = build.generated_corpus.take() {
            fs::create_dir_all(&generated).map_err(io_err(&generated))?;
            info!("Storing generated corpus in {}", generated.display());
            build.generated_corpus = Some(generated.canonicalize().map_err(io_err(&generated))?);
        }
        if let Some(seed) = build.seed_corpus.take() {
            fs::create_dir_all(&seed).map_err(io_err(&seed))?;
            build.seed_corpus = Some(seed.canonicalize().map_err(io_err(&seed))?);
        }
        seeds.extend(build.seed_corpus.iter().cloned());
        Ok(seeds)
    }

    fn sandbox(&self) -> Result<(Option<Arc<dyn SandboxLauncher>>, Option<TempDir>), OrchestratorError> {
        if !self.opts.use_sandbox {
            return Ok((None, None));
        }
        let chroot = tempfile::Builder::new()
            .prefix("fuzzpilot-run-")
            .tempdir()
            .map_err(io_err(Path::new("<temp dir>")))?;
        let launcher = MinijailLauncher::new(&self.tools, chroot.path())?;
        Ok((Some(Arc::new(launcher)), Some(chroot)))
    }

    fn runner(
        &self,
        system: BuildSystem,
        build: &BuildResult,
        seed_corpus_dirs: Vec<PathBuf>,
        sandbox: Option<Arc<dyn SandboxLauncher>>,
    ) -> Result<Box<dyn Runner>, OrchestratorError> {
        let library_dirs = build
            .executable
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(|dir| vec![dir.to_path_buf()])
            .unwrap_or_default();

        let mut opts = RunnerOptions {
            fuzz_target: build.executable.clone(),
            dictionary: self.opts.dictionary.clone().or_else(|| build.dictionary.clone()),
            engine_args: self.opts.engine_args.clone(),
            env_vars: vec![("NO_FUZZPILOT".to_string(), "1".to_string())],
            seed_corpus_dirs,
            generated_corpus_dir: build.generated_corpus.clone(),
            timeout: self.opts.timeout,
            use_sandbox: self.opts.use_sandbox,
            sandbox,
            verbose: self.opts.verbose,
            project_dir: self.opts.project_dir.clone(),
            read_only_bindings: vec![build.build_dir.clone()],
            library_dirs,
            source_map: None,
        };

        Ok(match system {
            BuildSystem::CMake | BuildSystem::Bazel | BuildSystem::Other => {
                Box::new(LibFuzzerRunner::new(opts))
            }
            BuildSystem::Maven | BuildSystem::Gradle => {
                let source_dirs: Vec<PathBuf> = ["src/main/java", "src/test/java"]
                    .iter()
                    .map(|dir| self.opts.project_dir.join(dir))
                    .filter(|dir| dir.is_dir())
                    .collect();
                opts.source_map = Some(SourceMap::create(&self.opts.project_dir, &source_dirs)?);
                opts.library_dirs.clear();

                let (class, method) = split_fuzz_test(&self.opts.fuzz_test);
                let target = JazzerTarget::Class {
                    class: class.to_string(),
                    method: method.map(str::to_string),
                };
                Box::new(JazzerRunner::new(
                    opts,
                    target,
                    build.runtime_deps.clone(),
                    self.tools.clone(),
                ))
            }
            BuildSystem::NodeJs => {
                let (test_path, test_name) = split_node_fuzz_test(&self.opts.fuzz_test);
                opts.library_dirs.clear();
                // Jazzer.js adds new inputs to the fuzz test's own corpus directory.
                opts.generated_corpus_dir = build.seed_corpus.clone();
                Box::new(JazzerJsRunner::new(
                    opts,
                    test_path.to_string(),
                    test_name.to_string(),
                ))
            }
        })
    }

    fn run_failure(&self, err: RunError) -> OrchestratorError {
        if self.opts.use_sandbox && matches!(err, RunError::Exec(_)) {
            info!("The failure might be caused by the sandbox, try running without --use-sandbox");
        }
        err.into()
    }

    fn upload(&mut self, findings: &[Finding]) -> Result<usize, OrchestratorError> {
        self.enter(RunStage::Upload);
        if findings.is_empty()
            || !should_upload(self.opts.project.as_deref(), self.opts.interactive, self.is_terminal)
        {
            return Ok(0);
        }
        let Some(client) = self.upload_client else {
            info!("No upload service configured, findings are kept in the project directory");
            return Ok(0);
        };
        let Some(token) = self.token.clone() else {
            info!("Not authenticated, findings are kept in the project directory");
            return Ok(0);
        };

        let project = match self.opts.project.clone().filter(|p| !p.is_empty()) {
            Some(project) => project,
            None => {
                let projects = client.list_projects(&token)?;
                let picker = self.picker.get_or_insert_with(|| {
                    Box::new(PromptPicker::new(io::stdin().lock(), io::stderr()))
                });
                match picker.pick(&projects)? {
                    Some(project) => project,
                    None => {
                        info!("Upload cancelled by user");
                        return Ok(0);
                    }
                }
            }
        };

        let count = upload_findings(
            client,
            &self.opts.project_dir,
            &project,
            &self.opts.fuzz_test,
            findings,
            &token,
        )?;
        match &self.opts.server {
            Some(server) => info!("Uploaded {count} findings to {project} at {server}"),
            None => info!("Uploaded {count} findings to {project}"),
        }
        Ok(count)
    }
}

/// `path/to/test.fuzz.js:test name` split into path and name pattern.
fn split_node_fuzz_test(fuzz_test: &str) -> (&str, &str) {
    fuzz_test.split_once(':').unwrap_or((fuzz_test, ""))
}

fn print_summary(handler: &mut ReportHandler) -> Result<(), OrchestratorError> {
    handler.print_crashing_input_note()?;
    handler.print_final_metrics()?;
    Ok(())
}
