use crate::executor::{LibFuzzerRunner, RunError, Runner, RunnerOptions, env_value, set_env};
use crate::report_handler::ReportSink;
use crate::sandbox::{Binding, ToolFinder};
use crate::stacktrace::EngineKind;
use crate::supervisor::CancellationToken;
use log::debug;
use std::env;
use std::path::{Path, PathBuf};

pub const JAZZER_MAIN_CLASS: &str = "com.code_intelligence.jazzer.Jazzer";

const JVM_ARGS: [&str; 5] = [
    // Keep stack traces on hot paths.
    "-XX:-OmitStackTraceInFastThrow",
    "-XX:+UseParallelGC",
    // CriticalJNINatives is gone since JDK 18.
    "-XX:+IgnoreUnrecognizedVMOptions",
    "-XX:+CriticalJNINatives",
    // Silences the agent warning on JDK 21+.
    "-XX:+EnableDynamicAgentLoading",
];

/// What Jazzer should fuzz.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JazzerTarget {
    Class {
        class: String,
        method: Option<String>,
    },
    /// A method reference fuzzed through Jazzer's autofuzz mode.
    Autofuzz(String),
}

impl JazzerTarget {
    fn flags(&self) -> Vec<String> {
        match self {
            JazzerTarget::Class { class, method } => {
                let mut flags = vec![format!("--target_class={class}")];
                if let Some(method) = method {
                    flags.push(format!("--target_method={method}"));
                }
                flags
            }
            JazzerTarget::Autofuzz(target) => vec![format!("--autofuzz={target}")],
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            JazzerTarget::Class { class, .. } => class.is_empty(),
            JazzerTarget::Autofuzz(target) => target.is_empty(),
        }
    }
}

/// Runs a JVM fuzz test through Jazzer. The libFuzzer flags and the process
/// handling come from the wrapped [`LibFuzzerRunner`].
pub struct JazzerRunner {
    base: LibFuzzerRunner,
    target: JazzerTarget,
    class_paths: Vec<PathBuf>,
    tools: ToolFinder,
}

impl JazzerRunner {
    pub fn new(
        opts: RunnerOptions,
        target: JazzerTarget,
        class_paths: Vec<PathBuf>,
        tools: ToolFinder,
    ) -> Self {
        Self {
            base: LibFuzzerRunner::for_engine(opts, EngineKind::Jazzer),
            target,
            class_paths,
            tools,
        }
    }

    fn validate(&self) -> Result<(), RunError> {
        self.base.options().validate()?;
        if self.target.is_empty() {
            return Err(RunError::InvalidOptions(
                "either a target class or an autofuzz target must be specified".to_string(),
            ));
        }
        if self.class_paths.is_empty() {
            return Err(RunError::InvalidOptions("the class path is empty".to_string()));
        }
        Ok(())
    }

    pub fn command(&self, artifact_dir: &Path) -> Result<Vec<String>, RunError> {
        let java = self.tools.java_path()?;
        let class_path = env::join_paths(&self.class_paths)
            .map_err(|e| RunError::InvalidOptions(format!("invalid class path entry: {e}")))?;

        let mut args = vec![
            java.display().to_string(),
            "-cp".to_string(),
            class_path.to_string_lossy().into_owned(),
        ];
        args.extend(JVM_ARGS.iter().map(|arg| arg.to_string()));
        args.push(JAZZER_MAIN_CLASS.to_string());
        args.extend(self.target.flags());
        Ok(self.base.fuzzer_args(args, artifact_dir))
    }

    pub fn environment(&self) -> Result<Vec<(String, String)>, RunError> {
        let mut env = self.base.base_environment();
        if env_value(&env, "JAVA_HOME").is_none() {
            let java_home = self.tools.java_home_path()?;
            set_env(&mut env, "JAVA_HOME", java_home.display().to_string());
        }
        // Verbose logging of the libjvm.so search.
        set_env(&mut env, "RULES_JNI_TRACE", "1");
        Ok(env)
    }

    fn bindings(&self, artifact_dir: &Path, env: &[(String, String)]) -> Vec<Binding> {
        let mut bindings = self.base.sandbox_bindings(artifact_dir);
        bindings.extend(self.class_paths.iter().map(Binding::read_only));
        if let Some(java_home) = env_value(env, "JAVA_HOME") {
            bindings.push(Binding::read_only(java_home));
        }
        bindings
    }
}

impl Runner for JazzerRunner {
    fn run(&self, ctx: &CancellationToken, handler: &mut dyn ReportSink) -> Result<(), RunError> {
        self.validate()?;
        debug!("Fuzzing {:?} with Jazzer", self.target);

        let artifact_dir = LibFuzzerRunner::artifact_dir("jazzer-out-")?;
        let args = self.command(artifact_dir.path())?;
        let env = self.environment()?;
        let bindings = self.bindings(artifact_dir.path(), &env);
        self.base.run_command(ctx, args, env, bindings, handler)
    }

    fn cleanup(&self, _ctx: &CancellationToken) {
        self.base.terminate();
    }
}
