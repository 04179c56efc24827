use crate::sandbox::{SandboxError, ToolFinder};
use crate::stacktrace::EngineKind;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use walkdir::WalkDir;

/// Directory below the project holding tool state such as build logs.
pub const STATE_DIR: &str = ".fuzzpilot";
/// Default generated corpus location for native targets.
pub const GENERATED_CORPUS_DIR: &str = ".fuzzpilot-corpus";

const CLASSPATH_MARKER: &str = "fuzzpilot.test.classpath=";

const GRADLE_INIT_SCRIPT: &str = r#"allprojects {
    tasks.register('fuzzpilotPrintTestClasspath') {
        doLast {
            println("fuzzpilot.test.classpath=" + sourceSets.test.runtimeClasspath.asPath)
        }
    }
}
"#;

const LIBFUZZER_CFLAGS: [&str; 5] = [
    "-g",
    "-fno-omit-frame-pointer",
    "-fsanitize=address,undefined",
    "-fsanitize=fuzzer-no-link",
    "-fno-sanitize-recover=all",
];

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("unsupported build system {0:?}")]
    UnknownBuildSystem(String),

    #[error("the 'other' build system requires a build command")]
    MissingBuildCommand,

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("build command {command} failed with {}", describe_exit(.exit_code))]
    Failed {
        command: String,
        exit_code: Option<i32>,
    },

    #[error("could not find an executable for fuzz test {0:?}")]
    ExecutableNotFound(String),

    #[error("build produced no class path for {0:?}")]
    NoClassPath(String),

    #[error("build I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Tool(#[from] SandboxError),

    #[error("failed to search the build tree: {0}")]
    Walk(#[from] walkdir::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BuildError + '_ {
    move |source| BuildError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSystem {
    CMake,
    Bazel,
    Maven,
    Gradle,
    NodeJs,
    Other,
}

impl BuildSystem {
    pub const ALL: [BuildSystem; 6] = [
        BuildSystem::CMake,
        BuildSystem::Bazel,
        BuildSystem::Maven,
        BuildSystem::Gradle,
        BuildSystem::NodeJs,
        BuildSystem::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BuildSystem::CMake => "cmake",
            BuildSystem::Bazel => "bazel",
            BuildSystem::Maven => "maven",
            BuildSystem::Gradle => "gradle",
            BuildSystem::NodeJs => "nodejs",
            BuildSystem::Other => "other",
        }
    }

    pub fn is_jvm(self) -> bool {
        matches!(self, BuildSystem::Maven | BuildSystem::Gradle)
    }

    pub fn is_node(self) -> bool {
        self == BuildSystem::NodeJs
    }

    pub fn engine(self) -> EngineKind {
        match self {
            BuildSystem::Maven | BuildSystem::Gradle => EngineKind::Jazzer,
            BuildSystem::NodeJs => EngineKind::JazzerJs,
            BuildSystem::CMake | BuildSystem::Bazel | BuildSystem::Other => EngineKind::LibFuzzer,
        }
    }

    /// Guesses the build system from marker files in `project_dir`.
    pub fn detect(project_dir: &Path) -> Option<BuildSystem> {
        let has = |name: &str| project_dir.join(name).is_file();
        if has("CMakeLists.txt") {
            Some(BuildSystem::CMake)
        } else if has("MODULE.bazel") || has("WORKSPACE") || has("WORKSPACE.bazel") {
            Some(BuildSystem::Bazel)
        } else if has("pom.xml") {
            Some(BuildSystem::Maven)
        } else if has("build.gradle") || has("build.gradle.kts") {
            Some(BuildSystem::Gradle)
        } else if has("package.json") {
            Some(BuildSystem::NodeJs)
        } else {
            None
        }
    }
}

impl fmt::Display for BuildSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildSystem {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuildSystem::ALL
            .into_iter()
            .find(|system| system.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| BuildError::UnknownBuildSystem(s.to_string()))
    }
}

/// What a build adapter hands to the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildResult {
    /// Native fuzz target. Empty for JVM and Node projects.
    pub executable: PathBuf,
    /// Class path entries for JVM projects.
    pub runtime_deps: Vec<PathBuf>,
    pub build_dir: PathBuf,
    pub seed_corpus: Option<PathBuf>,
    pub generated_corpus: Option<PathBuf>,
    /// `<fuzz test>.dict` shipped next to the fuzz test, if any.
    pub dictionary: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub project_dir: PathBuf,
    pub build_command: Option<String>,
    pub clean_command: Option<String>,
    /// Extra arguments passed to the underlying build tool.
    pub args: Vec<String>,
    pub tools: ToolFinder,
}

pub trait BuildAdapter {
    /// Builds `fuzz_test`. Every path in the result exists on success, except
    /// corpus directories, which the caller prepares.
    fn build(&self, fuzz_test: &str, output: &BuildOutput) -> Result<BuildResult, BuildError>;
}

pub fn new_adapter(
    system: BuildSystem,
    opts: BuildOptions,
) -> Result<Box<dyn BuildAdapter>, BuildError> {
    Ok(match system {
        BuildSystem::CMake => Box::new(CMakeAdapter { opts }),
        BuildSystem::Bazel => Box::new(BazelAdapter { opts }),
        BuildSystem::Maven | BuildSystem::Gradle => Box::new(JvmAdapter { system, opts }),
        BuildSystem::NodeJs => Box::new(NodeAdapter { opts }),
        BuildSystem::Other => {
            if opts.build_command.as_deref().is_none_or(str::is_empty) {
                return Err(BuildError::MissingBuildCommand);
            }
            Box::new(OtherAdapter { opts })
        }
    })
}

/// `com.example.FuzzTest::fuzz` split into class and method.
pub fn split_fuzz_test(fuzz_test: &str) -> (&str, Option<&str>) {
    match fuzz_test.split_once("::") {
        Some((class, method)) if !method.is_empty() => (class, Some(method)),
        Some((class, _)) => (class, None),
        None => (fuzz_test, None),
    }
}

/// `<project>/src/test/resources/<package path>/<Class>Inputs[/<method>]`
pub fn jazzer_seed_corpus(target_class: &str, method: Option<&str>, project_dir: &Path) -> PathBuf {
    let mut path = project_dir.join("src").join("test").join("resources");
    let inputs = format!("{target_class}Inputs");
    path.extend(inputs.split('.'));
    if let Some(method) = method {
        path.push(method);
    }
    path
}

/// `<project>/<test file without extension>/<test name>`, where Jazzer.js
/// keeps the inputs of a jest fuzz test.
pub fn jazzer_js_seed_corpus(project_dir: &Path, test_path: &str, test_name: &str) -> PathBuf {
    let test_file = Path::new(test_path);
    let mut path = project_dir.join(test_file.with_extension(""));
    if !test_name.is_empty() {
        path.push(test_name.replace(' ', "_"));
    }
    path
}

/// The dictionary that sits next to `<base>_inputs`, named `<base>.dict`.
pub fn default_dictionary(base: &Path) -> Option<PathBuf> {
    let dict = PathBuf::from(format!("{}.dict", base.display()));
    dict.is_file().then_some(dict)
}

pub fn generated_corpus_dir(project_dir: &Path, fuzz_test: &str) -> PathBuf {
    project_dir
        .join(GENERATED_CORPUS_DIR)
        .join(fuzz_test.replace(['/', ':'], "_"))
}

fn run_build_command(mut command: Command, output: &BuildOutput) -> Result<(), BuildError> {
    let (stdout, stderr) = output.stdio()?;
    let rendered = format!("{command:?}");
    debug!("Build command: {rendered}");
    let status = command
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .status()
        .map_err(|source| BuildError::Spawn {
            command: rendered.clone(),
            source,
        })?;
    if !status.success() {
        return Err(BuildError::Failed {
            command: rendered,
            exit_code: status.code(),
        });
    }
    Ok(())
}

/// Runs `command` and returns its stdout, which is also copied to the build
/// output.
fn capture_build_command(mut command: Command, output: &BuildOutput) -> Result<String, BuildError> {
    let (_, stderr) = output.stdio()?;
    let rendered = format!("{command:?}");
    debug!("Build command: {rendered}");
    let result = command
        .stdin(Stdio::null())
        .stderr(stderr)
        .output()
        .map_err(|source| BuildError::Spawn {
            command: rendered.clone(),
            source,
        })?;
    output.append(&result.stdout)?;
    if !result.status.success() {
        return Err(BuildError::Failed {
            command: rendered,
            exit_code: result.status.code(),
        });
    }
    Ok(String::from_utf8_lossy(&result.stdout).into_owned())
}

fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Looks for `name` directly below `root` first, then anywhere in the tree.
fn find_executable(root: &Path, name: &str) -> Result<PathBuf, BuildError> {
    let direct = root.join(name);
    if is_executable_file(&direct) {
        return direct.canonicalize().map_err(io_err(&direct));
    }
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry.file_name() == name
            && is_executable_file(entry.path())
        {
            debug!("Fuzz test executable found at {:?}", entry.path());
            return entry.path().canonicalize().map_err(io_err(entry.path()));
        }
    }
    Err(BuildError::ExecutableNotFound(name.to_string()))
}

/// Runs user supplied shell commands with libFuzzer compiler flags set.
struct OtherAdapter {
    opts: BuildOptions,
}

impl OtherAdapter {
    fn shell(&self, script: &str, fuzz_test: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(script)
            .current_dir(&self.opts.project_dir)
            .env("FUZZ_TEST", fuzz_test)
            .env("FUZZPILOT_BUILD_STEP", "fuzzing")
            .env("CFLAGS", LIBFUZZER_CFLAGS.join(" "))
            .env("CXXFLAGS", LIBFUZZER_CFLAGS.join(" "))
            .env("LDFLAGS", "-fsanitize=address,undefined")
            .env("FUZZ_TEST_LDFLAGS", "-fsanitize=fuzzer");
        command
    }
}

impl BuildAdapter for OtherAdapter {
    fn build(&self, fuzz_test: &str, output: &BuildOutput) -> Result<BuildResult, BuildError> {
        if let Some(clean) = self.opts.clean_command.as_deref().filter(|c| !c.is_empty()) {
            run_build_command(self.shell(clean, fuzz_test), output)?;
        }
        let build = self
            .opts
            .build_command
            .as_deref()
            .ok_or(BuildError::MissingBuildCommand)?;
        run_build_command(self.shell(build, fuzz_test), output)?;

        let executable = find_executable(&self.opts.project_dir, fuzz_test)?;
        let seed_corpus = PathBuf::from(format!("{}_inputs", executable.display()));
        Ok(BuildResult {
            seed_corpus: Some(seed_corpus),
            generated_corpus: Some(generated_corpus_dir(&self.opts.project_dir, fuzz_test)),
            dictionary: default_dictionary(&executable),
            build_dir: self.opts.project_dir.clone(),
            runtime_deps: Vec::new(),
            executable,
        })
    }
}

struct CMakeAdapter {
    opts: BuildOptions,
}

impl CMakeAdapter {
    fn build_dir(&self) -> PathBuf {
        self.opts
            .project_dir
            .join(STATE_DIR)
            .join("build")
            .join("libfuzzer")
            .join("address+undefined")
    }
}

impl BuildAdapter for CMakeAdapter {
    fn build(&self, fuzz_test: &str, output: &BuildOutput) -> Result<BuildResult, BuildError> {
        let cmake = self.opts.tools.look_path("cmake")?;
        let build_dir = self.build_dir();
        fs::create_dir_all(&build_dir).map_err(io_err(&build_dir))?;

        let mut configure = Command::new(&cmake);
        configure
            .arg("-S")
            .arg(&self.opts.project_dir)
            .arg("-B")
            .arg(&build_dir)
            .arg("-DFUZZPILOT_ENGINE=libfuzzer")
            .arg("-DFUZZPILOT_SANITIZERS=address;undefined")
            .arg("-DFUZZPILOT_TESTING:BOOL=ON")
            .arg("-DCMAKE_BUILD_RPATH_USE_ORIGIN:BOOL=ON")
            .args(&self.opts.args);
        run_build_command(configure, output)?;

        let mut build = Command::new(&cmake);
        build
            .arg("--build")
            .arg(&build_dir)
            .arg("--target")
            .arg(fuzz_test);
        run_build_command(build, output)?;

        let executable = find_executable(&build_dir, fuzz_test)?;
        Ok(BuildResult {
            executable,
            runtime_deps: Vec::new(),
            seed_corpus: Some(self.opts.project_dir.join(format!("{fuzz_test}_inputs"))),
            generated_corpus: Some(generated_corpus_dir(&self.opts.project_dir, fuzz_test)),
            dictionary: default_dictionary(&self.opts.project_dir.join(fuzz_test)),
            build_dir,
        })
    }
}

/// `//pkg/sub:name` relative to the `bazel-bin` convenience symlink.
pub fn bazel_bin_path(project_dir: &Path, label: &str) -> PathBuf {
    let label = label.trim_start_matches('@').trim_start_matches("//");
    let (package, name) = match label.split_once(':') {
        Some((package, name)) => (package, name),
        None => (label, label.rsplit('/').next().unwrap_or(label)),
    };
    project_dir.join("bazel-bin").join(package).join(name)
}

struct BazelAdapter {
    opts: BuildOptions,
}

impl BuildAdapter for BazelAdapter {
    fn build(&self, fuzz_test: &str, output: &BuildOutput) -> Result<BuildResult, BuildError> {
        let bazel = self.opts.tools.look_path("bazel")?;
        let mut build = Command::new(bazel);
        build
            .current_dir(&self.opts.project_dir)
            .arg("build")
            .arg("--config=fuzzpilot")
            .args(&self.opts.args)
            .arg(fuzz_test);
        run_build_command(build, output)?;

        let executable = bazel_bin_path(&self.opts.project_dir, fuzz_test);
        if !is_executable_file(&executable) {
            return Err(BuildError::ExecutableNotFound(fuzz_test.to_string()));
        }
        let executable = executable.canonicalize().map_err(io_err(&executable))?;
        let seed_corpus = PathBuf::from(format!("{}_inputs", executable.display()));
        Ok(BuildResult {
            seed_corpus: Some(seed_corpus),
            generated_corpus: Some(generated_corpus_dir(&self.opts.project_dir, fuzz_test)),
            dictionary: default_dictionary(&executable),
            build_dir: self.opts.project_dir.clone(),
            runtime_deps: Vec::new(),
            executable,
        })
    }
}

/// Compiles the tests and resolves the test runtime class path.
struct JvmAdapter {
    system: BuildSystem,
    opts: BuildOptions,
}

impl JvmAdapter {
    fn wrapper_or(&self, wrapper: &str, tool: &str) -> Result<PathBuf, BuildError> {
        let local = self.opts.project_dir.join(wrapper);
        if is_executable_file(&local) {
            return Ok(local);
        }
        Ok(self.opts.tools.look_path(tool)?)
    }

    fn maven_class_path(&self, output: &BuildOutput) -> Result<Vec<PathBuf>, BuildError> {
        let mvn = self.wrapper_or("mvnw", "mvn")?;
        let cp_file = tempfile::NamedTempFile::new().map_err(io_err(Path::new("classpath")))?;

        let mut command = Command::new(mvn);
        command
            .current_dir(&self.opts.project_dir)
            .arg("test-compile")
            .arg("dependency:build-classpath")
            .arg(format!("-Dmdep.outputFile={}", cp_file.path().display()))
            .arg("-Dmdep.includeScope=test")
            .args(&self.opts.args);
        run_build_command(command, output)?;

        let deps = fs::read_to_string(cp_file.path()).map_err(io_err(cp_file.path()))?;
        let target = self.opts.project_dir.join("target");
        let mut class_path = vec![target.join("test-classes"), target.join("classes")];
        class_path.extend(std::env::split_paths(deps.trim()).filter(|p| !p.as_os_str().is_empty()));
        Ok(class_path)
    }

    fn gradle_class_path(&self, output: &BuildOutput) -> Result<Vec<PathBuf>, BuildError> {
        let gradle = self.wrapper_or("gradlew", "gradle")?;
        let mut init_script = tempfile::Builder::new()
            .suffix(".gradle")
            .tempfile()
            .map_err(io_err(Path::new("init.gradle")))?;
        init_script
            .write_all(GRADLE_INIT_SCRIPT.as_bytes())
            .map_err(io_err(init_script.path()))?;

        let mut command = Command::new(gradle);
        command
            .current_dir(&self.opts.project_dir)
            .arg("--init-script")
            .arg(init_script.path())
            .arg("testClasses")
            .arg("fuzzpilotPrintTestClasspath")
            .args(&self.opts.args);
        let stdout = capture_build_command(command, output)?;
        Ok(parse_class_path_output(&stdout))
    }
}

fn parse_class_path_output(stdout: &str) -> Vec<PathBuf> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix(CLASSPATH_MARKER))
        .map(|cp| std::env::split_paths(cp).filter(|p| !p.as_os_str().is_empty()).collect())
        .unwrap_or_default()
}

impl BuildAdapter for JvmAdapter {
    fn build(&self, fuzz_test: &str, output: &BuildOutput) -> Result<BuildResult, BuildError> {
        let runtime_deps = match self.system {
            BuildSystem::Gradle => self.gradle_class_path(output)?,
            _ => self.maven_class_path(output)?,
        };
        if runtime_deps.is_empty() {
            return Err(BuildError::NoClassPath(fuzz_test.to_string()));
        }

        let (class, method) = split_fuzz_test(fuzz_test);
        Ok(BuildResult {
            executable: PathBuf::new(),
            runtime_deps,
            build_dir: self.opts.project_dir.clone(),
            seed_corpus: Some(jazzer_seed_corpus(class, method, &self.opts.project_dir)),
            // Jazzer picks and announces its own generated corpus.
            generated_corpus: None,
            dictionary: None,
        })
    }
}

/// Node projects run straight from source.
struct NodeAdapter {
    opts: BuildOptions,
}

impl BuildAdapter for NodeAdapter {
    fn build(&self, _fuzz_test: &str, _output: &BuildOutput) -> Result<BuildResult, BuildError> {
        Ok(BuildResult {
            build_dir: self.opts.project_dir.clone(),
            ..Default::default()
        })
    }
}

/// Where build tool output goes: the terminal, or a log file while a
/// spinner shows progress.
#[derive(Debug)]
pub struct BuildOutput {
    log_file: Option<(PathBuf, File)>,
}

impl BuildOutput {
    pub fn inherit() -> Self {
        Self { log_file: None }
    }

    /// Truncates `<project>/.fuzzpilot/logs/build-<fuzz test>.log`.
    pub fn to_log_file(project_dir: &Path, fuzz_test: &str) -> Result<Self, BuildError> {
        let dir = project_dir.join(STATE_DIR).join("logs");
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let path = dir.join(format!("build-{}.log", fuzz_test.replace(['/', ':'], "_")));
        let file = File::create(&path).map_err(io_err(&path))?;
        Ok(Self {
            log_file: Some((path, file)),
        })
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_file.as_ref().map(|(path, _)| path.as_path())
    }

    fn stdio(&self) -> Result<(Stdio, Stdio), BuildError> {
        match &self.log_file {
            None => Ok((Stdio::inherit(), Stdio::inherit())),
            Some((path, file)) => {
                let stdout = file.try_clone().map_err(io_err(path))?;
                let stderr = file.try_clone().map_err(io_err(path))?;
                Ok((stdout.into(), stderr.into()))
            }
        }
    }

    fn append(&self, bytes: &[u8]) -> Result<(), BuildError> {
        match &self.log_file {
            None => io::stdout().write_all(bytes).map_err(io_err(Path::new("<stdout>"))),
            Some((path, file)) => {
                let mut file: &File = file;
                file.write_all(bytes).map_err(io_err(path))
            }
        }
    }

    /// Copies the build log to `out`, used after a failed build.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        if let Some((path, _)) = &self.log_file {
            writeln!(out)?;
            io::copy(&mut File::open(path)?, out)?;
        }
        Ok(())
    }
}

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Progress indicator on stderr. Does nothing when stderr is not a terminal.
pub struct Spinner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Spinner {
    pub fn start(message: &str) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        if !io::stderr().is_terminal() {
            info!("{message}");
            return Self { stop, handle: None };
        }

        let flag = Arc::clone(&stop);
        let message = message.to_string();
        let handle = thread::spawn(move || {
            let mut stderr = io::stderr();
            for frame in SPINNER_FRAMES.iter().cycle() {
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                let _ = write!(stderr, "\r\x1b[2K{frame} {message}");
                let _ = stderr.flush();
                thread::sleep(Duration::from_millis(100));
            }
            let _ = write!(stderr, "\r\x1b[2K");
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self, message: &str) {
        self.halt();
        info!("{message}");
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.halt();
    }
}
