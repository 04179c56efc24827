use crate::executor::{LibFuzzerRunner, RunError, Runner, RunnerOptions, set_env};
use crate::report_handler::ReportSink;
use crate::sandbox::Binding;
use crate::stacktrace::EngineKind;
use crate::supervisor::CancellationToken;
use std::path::Path;

/// Exit code jest reports when a fuzz test fails, matching libFuzzer's.
pub const FUZZ_FAILURE_EXIT_CODE: i32 = 77;

/// Runs a Jazzer.js fuzz test through jest. Corpus handling is left to
/// Jazzer.js, so only the process handling of the base runner is used.
pub struct JazzerJsRunner {
    base: LibFuzzerRunner,
    test_path_pattern: String,
    test_name_pattern: String,
}

impl JazzerJsRunner {
    pub fn new(opts: RunnerOptions, test_path_pattern: String, test_name_pattern: String) -> Self {
        Self {
            base: LibFuzzerRunner::for_engine(opts, EngineKind::JazzerJs),
            test_path_pattern,
            test_name_pattern,
        }
    }

    pub fn command(&self) -> Vec<String> {
        vec![
            "npx".to_string(),
            "jest".to_string(),
            format!("--testPathPattern={}", self.test_path_pattern),
            format!("--testNamePattern={}", self.test_name_pattern),
            format!("--testFailureExitCode={FUZZ_FAILURE_EXIT_CODE}"),
            "--timeout=20000".to_string(),
        ]
    }

    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env = self.base.base_environment();
        set_env(&mut env, "JAZZER_FUZZ", "1");
        env
    }

    /// The project is only readable. Jest scratch files go to the private
    /// `scratch_dir` and new inputs to the fuzz test's corpus directory.
    pub fn sandbox_bindings(&self, scratch_dir: &Path) -> Vec<Binding> {
        let mut bindings = vec![Binding::read_only(&self.base.options().project_dir)];
        bindings.extend(self.base.sandbox_bindings(scratch_dir));
        bindings
    }
}

impl Runner for JazzerJsRunner {
    fn run(&self, ctx: &CancellationToken, handler: &mut dyn ReportSink) -> Result<(), RunError> {
        self.base.options().validate()?;
        if self.test_path_pattern.is_empty() {
            return Err(RunError::InvalidOptions(
                "a test path pattern must be specified".to_string(),
            ));
        }
        let scratch_dir = LibFuzzerRunner::artifact_dir("jazzer-js-")?;
        let mut env = self.environment();
        set_env(&mut env, "TMPDIR", scratch_dir.path().display().to_string());
        let bindings = self.sandbox_bindings(scratch_dir.path());
        self.base
            .run_command(ctx, self.command(), env, bindings, handler)
    }

    fn cleanup(&self, _ctx: &CancellationToken) {
        self.base.terminate();
    }
}
