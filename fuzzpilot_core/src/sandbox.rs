use log::debug;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("{0} not found")]
    ToolNotFound(String),

    #[error("cannot sandbox an empty command line")]
    EmptyCommand,
}

/// A path made visible inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Binding {
    pub source: PathBuf,
    pub writable: bool,
}

impl Binding {
    pub fn read_only(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            writable: false,
        }
    }

    pub fn writable(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            writable: true,
        }
    }
}

/// Wraps a command line so it runs with filesystem access limited to the
/// given bindings. Argument order and environment are preserved.
pub trait SandboxLauncher: Send + Sync {
    fn wrap(
        &self,
        argv: &[String],
        bindings: &[Binding],
        env: &[(String, String)],
    ) -> Result<Vec<String>, SandboxError>;
}

const SYSTEM_BINDINGS: [&str; 7] = ["/bin", "/lib", "/lib64", "/usr", "/etc", "/dev", "/proc"];

pub struct MinijailLauncher {
    minijail: PathBuf,
    chroot_dir: PathBuf,
}

impl MinijailLauncher {
    /// `chroot_dir` must be an empty directory that outlives the wrapped
    /// process.
    pub fn new(finder: &ToolFinder, chroot_dir: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        Ok(Self {
            minijail: finder.minijail_path()?,
            chroot_dir: chroot_dir.into(),
        })
    }

    fn binding_args(&self, bindings: &[Binding]) -> Vec<String> {
        let mut all: Vec<Binding> = SYSTEM_BINDINGS.iter().map(|dir| Binding::read_only(*dir)).collect();
        all.push(Binding::writable(env::temp_dir()));
        all.extend(bindings.iter().cloned());
        all.sort();
        // A writable binding wins over a read-only one for the same path.
        all.dedup_by(|later, earlier| {
            if later.source == earlier.source {
                earlier.writable |= later.writable;
                true
            } else {
                false
            }
        });

        let mut args = Vec::new();
        for binding in all {
            if !binding.source.exists() {
                debug!("Skipping sandbox binding for missing path {:?}", binding.source);
                continue;
            }
            let source = binding.source.to_string_lossy();
            args.push("-b".to_string());
            args.push(format!("{source},{source},{}", u8::from(binding.writable)));
        }
        args
    }
}

impl SandboxLauncher for MinijailLauncher {
    fn wrap(
        &self,
        argv: &[String],
        bindings: &[Binding],
        _env: &[(String, String)],
    ) -> Result<Vec<String>, SandboxError> {
        if argv.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }

        let mut wrapped = vec![
            self.minijail.to_string_lossy().into_owned(),
            "--logging=stderr".to_string(),
            "-n".to_string(),
            "-v".to_string(),
            "-P".to_string(),
            self.chroot_dir.to_string_lossy().into_owned(),
        ];
        wrapped.extend(self.binding_args(bindings));
        wrapped.push("--".to_string());
        wrapped.extend(argv.iter().cloned());
        Ok(wrapped)
    }
}

/// Locates external tools. Passed explicitly to whatever needs a tool path.
#[derive(Debug, Clone, Default)]
pub struct ToolFinder {
    install_dir: Option<PathBuf>,
    search_path: Option<OsString>,
    java_home: Option<PathBuf>,
}

impl ToolFinder {
    pub fn new(
        install_dir: Option<PathBuf>,
        search_path: Option<OsString>,
        java_home: Option<PathBuf>,
    ) -> Self {
        Self {
            install_dir,
            search_path,
            java_home,
        }
    }

    /// Uses `PATH` and `JAVA_HOME` of the current process.
    pub fn from_env(install_dir: Option<PathBuf>) -> Self {
        Self::new(
            install_dir,
            env::var_os("PATH"),
            env::var_os("JAVA_HOME")
                .filter(|home| !home.is_empty())
                .map(PathBuf::from),
        )
    }

    pub fn look_path(&self, name: &str) -> Result<PathBuf, SandboxError> {
        let search_path = self.search_path.as_deref().unwrap_or_default();
        env::split_paths(search_path)
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
            .ok_or_else(|| SandboxError::ToolNotFound(name.to_string()))
    }

    /// Prefers the copy shipped in the install directory.
    pub fn minijail_path(&self) -> Result<PathBuf, SandboxError> {
        if let Some(install_dir) = &self.install_dir {
            let bundled = install_dir.join("bin").join("minijail0");
            if let Ok(resolved) = bundled.canonicalize() {
                return Ok(resolved);
            }
        }
        self.look_path("minijail0")
    }

    pub fn java_path(&self) -> Result<PathBuf, SandboxError> {
        if let Some(home) = &self.java_home {
            let java = home.join("bin").join("java");
            if is_executable(&java) {
                return Ok(java);
            }
        }
        self.look_path("java")
    }

    /// `JAVA_HOME` if set, else two levels above the resolved `java` binary.
    pub fn java_home_path(&self) -> Result<PathBuf, SandboxError> {
        if let Some(home) = &self.java_home {
            return Ok(home.clone());
        }
        let java = self.look_path("java")?;
        let resolved = java.canonicalize().unwrap_or(java);
        resolved
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .ok_or_else(|| SandboxError::ToolNotFound("JAVA_HOME".to_string()))
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn fake_tool(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn finder_searches_given_path_only() {
        let bin = tempdir().unwrap();
        let tool = fake_tool(bin.path(), "minijail0");
        fs::write(bin.path().join("java"), "not executable").unwrap();

        let finder = ToolFinder::new(None, Some(bin.path().as_os_str().to_owned()), None);

        assert_eq!(finder.minijail_path().unwrap(), tool);
        match finder.java_path() {
            Err(SandboxError::ToolNotFound(name)) => assert_eq!(name, "java"),
            other => panic!("Expected ToolNotFound, got {other:?}"),
        }
    }

    #[test]
    fn java_home_takes_precedence() {
        let home = tempdir().unwrap();
        fs::create_dir_all(home.path().join("bin")).unwrap();
        let java = fake_tool(&home.path().join("bin"), "java");

        let finder = ToolFinder::new(None, None, Some(home.path().to_path_buf()));

        assert_eq!(finder.java_path().unwrap(), java);
        assert_eq!(finder.java_home_path().unwrap(), home.path());
    }

    #[test]
    fn minijail_wraps_command_after_separator() {
        let bin = tempdir().unwrap();
        fake_tool(bin.path(), "minijail0");
        let corpus = tempdir().unwrap();
        let finder = ToolFinder::new(None, Some(bin.path().as_os_str().to_owned()), None);
        let launcher = MinijailLauncher::new(&finder, "/tmp/chroot").unwrap();
        let argv = vec!["./fuzzer".to_string(), "-runs=10".to_string(), "corpus".to_string()];

        let wrapped = launcher
            .wrap(
                &argv,
                &[
                    Binding::read_only(corpus.path()),
                    Binding::writable(corpus.path()),
                    Binding::read_only("/does/not/exist"),
                ],
                &[],
            )
            .unwrap();

        let separator = wrapped.iter().position(|arg| arg == "--").unwrap();
        assert_eq!(&wrapped[separator + 1..], argv.as_slice());
        let corpus = corpus.path().to_string_lossy();
        let expected = format!("{corpus},{corpus},1");
        assert_eq!(wrapped.iter().filter(|arg| **arg == expected).count(), 1);
        assert!(!wrapped.iter().any(|arg| arg.contains(&format!("{corpus},{corpus},0"))));
        assert!(!wrapped.iter().any(|arg| arg.contains("/does/not/exist")));
    }

    #[test]
    fn empty_command_is_rejected() {
        let launcher = MinijailLauncher {
            minijail: PathBuf::from("minijail0"),
            chroot_dir: PathBuf::from("/tmp/chroot"),
        };
        assert!(matches!(launcher.wrap(&[], &[], &[]), Err(SandboxError::EmptyCommand)));
    }
}
