use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum SourceMapError {
    #[error("source map not found at {0:?}")]
    NotFound(PathBuf),

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to walk source directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("invalid source map {path:?}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Maps JVM package names to the project-relative source files that
/// declare them. Used to turn the bare file names of JVM stack frames
/// back into real paths.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMap {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub java_packages: HashMap<String, Vec<String>>,
}

impl SourceMap {
    /// Scans every `*.java` and `*.kt` file below `source_dirs` and records
    /// it under the package it declares. Files without a package
    /// declaration are skipped.
    pub fn create(project_dir: &Path, source_dirs: &[PathBuf]) -> Result<Self, SourceMapError> {
        let mut source_map = SourceMap::default();

        for dir in source_dirs {
            for entry in WalkDir::new(dir).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() || !is_jvm_source(entry.path()) {
                    continue;
                }

                let file = File::open(entry.path()).map_err(|source| SourceMapError::Io {
                    path: entry.path().to_path_buf(),
                    source,
                })?;
                let Some(package) = package_from_source(BufReader::new(file)) else {
                    continue;
                };

                let relative = entry
                    .path()
                    .strip_prefix(project_dir)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                source_map
                    .java_packages
                    .entry(package)
                    .or_default()
                    .push(relative);
            }
        }

        Ok(source_map)
    }

    pub fn read_from_file(path: &Path) -> Result<Self, SourceMapError> {
        if !path.exists() {
            return Err(SourceMapError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read(path).map_err(|source| SourceMapError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&content).map_err(|source| SourceMapError::Format {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn files_in_package(&self, package: &str) -> &[String] {
        self.java_packages
            .get(package)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn is_jvm_source(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("java") | Some("kt")
    )
}

/// Returns the package declared by a JVM source file, skipping leading
/// blank lines and comments. Anything else before `package` means the
/// file lives in the default package.
pub fn package_from_source(reader: impl BufRead) -> Option<String> {
    let mut in_block_comment = false;

    for line in reader.lines() {
        let line = line.ok()?;
        let line = line.trim();

        if in_block_comment {
            if line.ends_with("*/") {
                in_block_comment = false;
            }
            continue;
        }
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        if line.starts_with("/*") {
            in_block_comment = !line.ends_with("*/") || line.len() < 4;
            continue;
        }

        let package = line.strip_prefix("package ")?;
        return Some(package.trim_end_matches(';').trim().to_string());
    }

    None
}
