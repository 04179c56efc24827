use crate::adapter::BuildSystem;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Project configuration file looked up in the project directory.
pub const CONFIG_FILE: &str = "fuzzpilot.toml";

/// Invalid combination of run settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no fuzz test specified")]
    MissingFuzzTest,

    #[error("timeout must be at least one second, got {0:?}")]
    InvalidTimeout(Duration),

    #[error("could not detect the build system of {0:?}, please set build-system")]
    UnknownBuildSystem(PathBuf),

    #[error("the 'other' build system requires a build command")]
    MissingBuildCommand,

    #[error("dictionary {0:?} does not exist")]
    DictionaryNotFound(PathBuf),

    #[error("seed corpus directory {0:?} does not exist")]
    SeedCorpusNotFound(PathBuf),
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub build_system: Option<BuildSystem>,
    pub build_command: Option<String>,
    pub clean_command: Option<String>,
    pub dict: Option<PathBuf>,
    #[serde(default)]
    pub engine_args: Vec<String>,
    #[serde(default)]
    pub seed_corpus_dirs: Vec<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub use_sandbox: Option<bool>,
    pub print_json: Option<bool>,
    /// Remote project findings are uploaded to.
    pub project: Option<String>,
    pub server: Option<String>,
    pub interactive: Option<bool>,
}

impl ProjectConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {path:?}"))?;
        let mut config: ProjectConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {path:?}"))?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Loads `fuzzpilot.toml` from `project_dir`, or the defaults when the
    /// project has none.
    pub fn find_in(project_dir: &Path) -> Result<Self, anyhow::Error> {
        let path = project_dir.join(CONFIG_FILE);
        if path.is_file() {
            Self::load_from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Relative paths in the file are relative to the file's directory.
    fn resolve_paths(&mut self, base: &Path) {
        if let Some(dict) = &mut self.dict {
            if dict.is_relative() {
                *dict = base.join(&*dict);
            }
        }
        for dir in &mut self.seed_corpus_dirs {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}
