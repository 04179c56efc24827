use crate::names::deterministic_name;
use crate::stacktrace::{StackFrame, encode_stack_trace};
use chrono::{DateTime, Utc};
use log::debug;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FINDINGS_DIR: &str = ".findings";
const FINDING_JSON: &str = "finding.json";
const CRASHING_INPUT: &str = "crashing-input";
const LOCK_FILE: &str = ".lock";

/// Errors raised while persisting or loading findings.
#[derive(Error, Debug)]
pub enum FindingError {
    #[error("finding {0:?} does not exist")]
    NotFound(String),

    /// The seed corpus must be created before the first finding arrives.
    #[error("seed corpus directory {0:?} does not exist")]
    SeedCorpusMissing(PathBuf),

    #[error("finding {0:?} has no crashing input to attach")]
    NoInputFile(String),

    #[error("failed to lock {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("finding I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid finding document {path:?}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> FindingError + '_ {
    move |source| FindingError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    #[default]
    UnknownError,
    CompilationError,
    Crash,
    Warning,
    RuntimeError,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeverityLevel {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Severity {
    #[serde(rename = "description", skip_serializing_if = "Option::is_none", default)]
    pub level: Option<SeverityLevel>,
    #[serde(default)]
    pub score: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ExternalDetail {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Link {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
}

/// Severity and classification data attached to a finding after the fact.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ErrorDetails {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mitigation: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owasp_details: Option<ExternalDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwe_details: Option<ExternalDetail>,
}

#[derive(Deserialize)]
struct ErrorDetailsFile {
    #[serde(default)]
    error_details: Vec<ErrorDetails>,
}

/// Reads an error details lookup table (`{"error_details": [...]}`).
pub fn load_error_details(path: &Path) -> Result<Vec<ErrorDetails>, FindingError> {
    let content = fs::read(path).map_err(io_err(path))?;
    let file: ErrorDetailsFile =
        serde_json::from_slice(&content).map_err(|source| FindingError::Format {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(file.error_details)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Origin {
    #[default]
    Local,
    Remote(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Finding {
    #[serde(skip)]
    pub origin: Origin,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "type", default)]
    pub error_type: ErrorType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more_details: Option<ErrorDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Relative to the project directory once the crash input is attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack_trace: Vec<StackFrame>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fuzz_test: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_path: Option<PathBuf>,
}

/// Name of the finding produced by `stack_trace` and `input`.
pub fn generate_name(stack_trace: &[StackFrame], input: &[u8]) -> String {
    let mut seed = encode_stack_trace(stack_trace);
    seed.extend_from_slice(input);
    deterministic_name(&seed)
}

pub fn findings_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(FINDINGS_DIR)
}

fn finding_dir(project_dir: &Path, name: &str) -> PathBuf {
    findings_dir(project_dir).join(name)
}

impl Finding {
    pub fn generate_name(&self) -> String {
        generate_name(&self.stack_trace, &self.input_data)
    }

    pub fn dir(&self, project_dir: &Path) -> PathBuf {
        finding_dir(project_dir, &self.name)
    }

    pub fn exists(&self, project_dir: &Path) -> bool {
        self.dir(project_dir).join(FINDING_JSON).is_file()
    }

    /// Writes `finding.json`, replacing any earlier finding with the same name.
    pub fn save(&self, project_dir: &Path) -> Result<(), FindingError> {
        let dir = self.dir(project_dir);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let path = dir.join(FINDING_JSON);
        let json = serde_json::to_vec_pretty(self).map_err(|source| FindingError::Format {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(io_err(&path))
    }

    pub fn remove(&self, project_dir: &Path) -> Result<(), FindingError> {
        let dir = self.dir(project_dir);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir)(e)),
        }
    }

    /// Moves the crashing input out of the engine's temporary artifact
    /// directory.
    ///
    /// The input is copied into the finding directory and into
    /// `seed_corpus_dir` as `<name>-<basename>`. `input_file` and every log
    /// line mentioning the old path are rewritten to the seed corpus copy.
    pub fn attach_crash_input(
        &mut self,
        project_dir: &Path,
        seed_corpus_dir: &Path,
    ) -> Result<(), FindingError> {
        if !seed_corpus_dir.is_dir() {
            return Err(FindingError::SeedCorpusMissing(seed_corpus_dir.to_path_buf()));
        }
        let input_file = self
            .input_file
            .clone()
            .ok_or_else(|| FindingError::NoInputFile(self.name.clone()))?;

        let dir = self.dir(project_dir);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let _lock = lock_dir(&dir)?;

        let finding_copy = dir.join(CRASHING_INPUT);
        fs::copy(&input_file, &finding_copy).map_err(io_err(&input_file))?;

        // Different inputs can end up as the same finding.
        let basename = input_file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| CRASHING_INPUT.to_string());
        let seed_path = seed_corpus_dir.join(format!("{}-{}", self.name, basename));
        fs::copy(&input_file, &seed_path).map_err(io_err(&seed_path))?;
        debug!("Copied input file from {input_file:?} to {seed_path:?}");

        let new_input = seed_path
            .strip_prefix(project_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| seed_path.clone());
        let old = input_file.to_string_lossy();
        let new = new_input.to_string_lossy();
        for line in &mut self.logs {
            if line.contains(old.as_ref()) {
                *line = line.replace(old.as_ref(), new.as_ref());
            }
        }

        self.input_file = Some(new_input);
        self.seed_path = Some(seed_path);
        Ok(())
    }

    pub fn source_location(&self) -> String {
        match self.stack_trace.first() {
            Some(frame) if frame.column != 0 => {
                format!("{}:{}:{}", frame.source_file, frame.line, frame.column)
            }
            Some(frame) => format!("{}:{}", frame.source_file, frame.line),
            None => "n/a".to_string(),
        }
    }

    fn error_kind(&self) -> String {
        match self.error_type {
            ErrorType::Crash
                if self.details == "detected memory leaks"
                    || self.details == "fuzz target exited"
                    || self.details.contains("Security Issue:") =>
            {
                self.details.clone()
            }
            ErrorType::Crash => self
                .details
                .split(' ')
                .next()
                .unwrap_or_default()
                .replace('-', " "),
            ErrorType::RuntimeError => self
                .details
                .split(':')
                .next()
                .unwrap_or_default()
                .to_string(),
            _ => self.details.clone(),
        }
    }

    /// One-line summary such as `heap buffer overflow in parse (src/a.c:3:7)`.
    pub fn short_description(&self) -> String {
        let kind = self.error_kind();
        match self.stack_trace.first() {
            Some(frame) if !frame.function.is_empty() => {
                format!("{kind} in {} ({})", frame.function, self.source_location())
            }
            Some(_) => format!("{kind} in {}", self.source_location()),
            None => kind,
        }
    }

    pub fn short_description_with_name(&self) -> String {
        format!("[{}] {}", self.name, self.short_description())
    }

    /// Attaches the first matching entry of `table`, keeping an already
    /// known id.
    pub fn enhance_with_error_details(&mut self, table: &[ErrorDetails]) {
        let kind = self.error_kind().to_lowercase();
        let current_id = self.more_details.as_ref().map(|d| d.id.clone());

        let found = table.iter().find(|details| {
            current_id.as_deref() == Some(details.id.as_str())
                || (!details.name.is_empty() && kind.contains(&details.name.to_lowercase()))
        });
        if let Some(details) = found {
            let mut details = details.clone();
            if let Some(id) = current_id {
                details.id = id;
            }
            self.more_details = Some(details);
        }
    }
}

fn lock_dir(dir: &Path) -> Result<Flock<File>, FindingError> {
    let path = dir.join(LOCK_FILE);
    let file = File::create(&path).map_err(io_err(&path))?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, source)| FindingError::Lock { path, source })
}

/// Loads one persisted finding. `error_details` is an optional lookup
/// table used to enrich it.
pub fn load(
    project_dir: &Path,
    name: &str,
    error_details: Option<&[ErrorDetails]>,
) -> Result<Finding, FindingError> {
    let path = finding_dir(project_dir, name).join(FINDING_JSON);
    let content = match fs::read(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(FindingError::NotFound(name.to_string()));
        }
        Err(e) => return Err(io_err(&path)(e)),
    };

    let mut finding: Finding =
        serde_json::from_slice(&content).map_err(|source| FindingError::Format { path, source })?;
    finding.origin = Origin::Local;
    if let Some(table) = error_details {
        finding.enhance_with_error_details(table);
    }
    Ok(finding)
}

/// All persisted findings of the project, newest first.
pub fn list_local(
    project_dir: &Path,
    error_details: Option<&[ErrorDetails]>,
) -> Result<Vec<Finding>, FindingError> {
    let dir = findings_dir(project_dir);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(&dir)(e)),
    };

    let mut findings = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err(&dir))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        findings.push(load(project_dir, &name, error_details)?);
    }

    findings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn sample_finding() -> Finding {
        let stack_trace = vec![StackFrame {
            source_file: "src/parser.c".to_string(),
            line: 42,
            column: 13,
            frame_number: 0,
            function: "parse_header".to_string(),
        }];
        let input_data = b"\x00\xffcrash".to_vec();
        Finding {
            name: generate_name(&stack_trace, &input_data),
            error_type: ErrorType::Crash,
            input_data,
            logs: vec!["==1==ERROR: AddressSanitizer: heap-buffer-overflow".to_string()],
            details: "heap-buffer-overflow on address 0x602000000011".to_string(),
            created_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
            stack_trace,
            fuzz_test: "parser_fuzzer".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let project = tempdir().unwrap();
        let finding = sample_finding();

        finding.save(project.path()).unwrap();
        let loaded = load(project.path(), &finding.name, None).unwrap();

        assert_eq!(loaded, finding);
        assert!(finding.exists(project.path()));
    }

    #[test]
    fn saving_same_name_overwrites() {
        let project = tempdir().unwrap();
        let first = sample_finding();
        let mut second = sample_finding();
        second.logs = vec!["second run".to_string()];
        assert_eq!(first.name, second.name);

        first.save(project.path()).unwrap();
        second.save(project.path()).unwrap();

        let all = list_local(project.path(), None).unwrap();
        assert_eq!(all.len(), 1, "Expected exactly one finding directory");
        assert_eq!(all[0].logs, vec!["second run".to_string()]);
    }

    #[test]
    fn load_missing_finding_is_not_found() {
        let project = tempdir().unwrap();
        match load(project.path(), "nope", None) {
            Err(FindingError::NotFound(name)) => assert_eq!(name, "nope"),
            other => panic!("Expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn list_local_without_findings_dir_is_empty() {
        let project = tempdir().unwrap();
        assert!(list_local(project.path(), None).unwrap().is_empty());
    }

    #[test]
    fn list_local_sorts_newest_first() {
        let project = tempdir().unwrap();
        let mut older = sample_finding();
        older.name = "older_one".to_string();
        older.created_at = Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
        let mut newer = sample_finding();
        newer.name = "newer_one".to_string();
        newer.created_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        older.save(project.path()).unwrap();
        newer.save(project.path()).unwrap();

        let names: Vec<String> = list_local(project.path(), None)
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["newer_one", "older_one"]);
    }

    #[test]
    fn remove_deletes_finding_dir() {
        let project = tempdir().unwrap();
        let finding = sample_finding();
        finding.save(project.path()).unwrap();

        finding.remove(project.path()).unwrap();

        assert!(!finding.dir(project.path()).exists());
        finding.remove(project.path()).unwrap();
    }

    #[test]
    fn attach_crash_input_copies_and_rewrites_paths() {
        let project = tempdir().unwrap();
        let artifacts = tempdir().unwrap();
        let seed_dir = project.path().join("parser_fuzzer_inputs");
        fs::create_dir_all(&seed_dir).unwrap();
        let crash = artifacts.path().join("crash-abc123");
        fs::write(&crash, b"boom").unwrap();

        let mut finding = sample_finding();
        finding.input_file = Some(crash.clone());
        finding.logs.push(format!(
            "artifact_prefix='{}/'; Test unit written to {}",
            artifacts.path().display(),
            crash.display()
        ));

        finding.attach_crash_input(project.path(), &seed_dir).unwrap();

        let expected_rel = PathBuf::from(format!("parser_fuzzer_inputs/{}-crash-abc123", finding.name));
        assert_eq!(finding.input_file, Some(expected_rel.clone()));
        assert_eq!(fs::read(project.path().join(&expected_rel)).unwrap(), b"boom");
        assert_eq!(
            fs::read(finding.dir(project.path()).join(CRASHING_INPUT)).unwrap(),
            b"boom"
        );
        let last = finding.logs.last().unwrap();
        assert!(
            last.ends_with(&format!("Test unit written to {}", expected_rel.display())),
            "Log line was not rewritten: {last}"
        );
        assert_eq!(finding.seed_path, Some(seed_dir.join(format!("{}-crash-abc123", finding.name))));
    }

    #[test]
    fn attach_crash_input_requires_seed_corpus() {
        let project = tempdir().unwrap();
        let mut finding = sample_finding();
        finding.input_file = Some(project.path().join("crash-1"));

        match finding.attach_crash_input(project.path(), &project.path().join("missing")) {
            Err(FindingError::SeedCorpusMissing(path)) => assert!(path.ends_with("missing")),
            other => panic!("Expected SeedCorpusMissing, got {other:?}"),
        }
    }

    #[test]
    fn short_description_variants() {
        let finding = sample_finding();
        assert_eq!(
            finding.short_description(),
            "heap buffer overflow in parse_header (src/parser.c:42:13)"
        );
        assert_eq!(finding.source_location(), "src/parser.c:42:13");

        let ubsan = Finding {
            error_type: ErrorType::RuntimeError,
            details: "undefined behavior: signed integer overflow".to_string(),
            stack_trace: vec![StackFrame {
                source_file: "src/math.cpp".to_string(),
                line: 5,
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(ubsan.short_description(), "undefined behavior in src/math.cpp:5");

        let leak = Finding {
            error_type: ErrorType::Crash,
            details: "detected memory leaks".to_string(),
            ..Default::default()
        };
        assert_eq!(leak.short_description(), "detected memory leaks");
        assert_eq!(leak.source_location(), "n/a");
    }

    #[test]
    fn error_details_matched_by_name() {
        let table = vec![
            ErrorDetails {
                id: "use_after_free".to_string(),
                name: "Use After Free".to_string(),
                ..Default::default()
            },
            ErrorDetails {
                id: "heap_buffer_overflow".to_string(),
                name: "Heap Buffer Overflow".to_string(),
                severity: Some(Severity {
                    level: Some(SeverityLevel::High),
                    score: 8.0,
                }),
                ..Default::default()
            },
        ];
        let mut finding = sample_finding();

        finding.enhance_with_error_details(&table);

        let details = finding.more_details.expect("details attached");
        assert_eq!(details.id, "heap_buffer_overflow");
        assert_eq!(details.severity.and_then(|s| s.level), Some(SeverityLevel::High));
    }

    #[test]
    fn error_details_file_is_parsed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("error-details.json");
        fs::write(
            &path,
            r#"{"version_schema":1,"error_details":[{"id":"x","name":"Stack Overflow","severity":{"description":"MEDIUM","score":5.5}}]}"#,
        )
        .unwrap();

        let table = load_error_details(&path).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table[0].severity.as_ref().and_then(|s| s.level), Some(SeverityLevel::Medium));
    }
}
