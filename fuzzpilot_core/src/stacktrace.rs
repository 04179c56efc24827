//! Extraction of project stack frames from engine crash reports.
//!
//! Each engine prints frames in its own format. The parser matches one
//! grammar per call, keeps only frames whose source file lives inside the
//! project, and stops at the fuzz entry point.

use crate::sourcemap::SourceMap;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::num::ParseIntError;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

static NATIVE_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"#(?P<frame_number>\d+)\s+0x[a-fA-F0-9]+\s+in\s+(?P<function>(\(anonymous namespace\))?[^(\s]+).*\s(?P<source_file>\S+?):(?P<line>\d+):?(?P<column>\d*)",
    )
    .expect("native frame pattern")
});

static JAVA_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*at\s+(?P<function>[^(]*)\((?P<source_file>[^:]*):(?P<line>\d+)\)\s*$")
        .expect("java frame pattern")
});

static NODE_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\s*at\s((?P<function>\S+)\s+(\[.*\])?\s*\()?(?P<source_file>\S+?):(?P<line>\d+):?(?P<column>\d*)\)?",
    )
    .expect("node frame pattern")
});

// UBSan does not always print a stack trace, only this one-liner.
static UBSAN_DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<source_file>\S+?):((?P<line>\d+):)?((?P<column>\d+):)? runtime error: (?P<message>.*)$",
    )
    .expect("ubsan diagnostic pattern")
});

const NATIVE_ENTRY_POINTS: [&str; 2] = ["LLVMFuzzerTestOneInputNoReturn", "LLVMFuzzerTestOneInput"];
const JVM_ENTRY_POINT_SUFFIX: &str = ".fuzzerTestOneInput";
const NODE_VENDOR_DIR: &str = "node_modules";

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed {field} {value:?} in stack frame line {line:?}")]
    MalformedNumber {
        field: &'static str,
        value: String,
        line: String,
        #[source]
        source: ParseIntError,
    },
}

/// The engine whose output is being parsed. Decides the frame grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    #[default]
    LibFuzzer,
    Jazzer,
    JazzerJs,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    pub source_file: String,
    pub line: u32,
    pub column: u32,
    pub frame_number: u32,
    pub function: String,
}

/// Stable byte encoding of a stack trace, used as part of a finding's name seed.
pub fn encode_stack_trace(stack_trace: &[StackFrame]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in stack_trace {
        out.extend_from_slice(
            format!(
                "#{}|{}|{}|{}|{}",
                frame.frame_number, frame.function, frame.source_file, frame.line, frame.column
            )
            .as_bytes(),
        );
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct ParserOptions {
    pub project_dir: PathBuf,
    pub source_map: Option<SourceMap>,
    pub engine: EngineKind,
}

#[derive(Debug, Clone)]
pub struct StackTraceParser {
    opts: ParserOptions,
    filter_jvm_frames: bool,
}

impl StackTraceParser {
    pub fn new(opts: ParserOptions) -> Self {
        Self {
            opts,
            filter_jvm_frames: true,
        }
    }

    pub fn engine(&self) -> EngineKind {
        self.opts.engine
    }

    /// Returns the project frames found in `logs`, root cause first.
    ///
    /// Falls back to a single frame taken from a UBSan `runtime error`
    /// line when no frame matched. An empty result means the logs held no
    /// recognizable crash location.
    pub fn parse<S: AsRef<str>>(&mut self, logs: &[S]) -> Result<Vec<StackFrame>, ParseError> {
        self.filter_jvm_frames = true;

        let trace = self.parse_stack_trace(logs)?;
        if !trace.is_empty() {
            return Ok(trace);
        }
        self.parse_source_location(logs)
    }

    fn parse_stack_trace<S: AsRef<str>>(&mut self, logs: &[S]) -> Result<Vec<StackFrame>, ParseError> {
        let mut frames: Vec<StackFrame> = Vec::new();

        for line in logs {
            let Some(frame) = self.frame_from_line(line.as_ref())? else {
                continue;
            };

            if self.opts.engine == EngineKind::LibFuzzer {
                if let Some(previous) = frames.last() {
                    if frame.frame_number <= previous.frame_number {
                        // Start of an unrelated dump.
                        break;
                    }
                }
            }

            let reached_entry_point = self.is_entry_point(&frame.function);
            frames.push(frame);
            if reached_entry_point {
                break;
            }
        }

        Ok(frames)
    }

    fn parse_source_location<S: AsRef<str>>(&mut self, logs: &[S]) -> Result<Vec<StackFrame>, ParseError> {
        for line in logs {
            let line = line.as_ref();
            let Some(caps) = UBSAN_DIAGNOSTIC.captures(line) else {
                continue;
            };
            let Some(source_file) = self.validate_source_file(&caps["source_file"], "") else {
                continue;
            };
            return Ok(vec![StackFrame {
                source_file,
                line: parse_field(&caps, "line", line)?,
                column: parse_field(&caps, "column", line)?,
                frame_number: 0,
                function: String::new(),
            }]);
        }
        Ok(Vec::new())
    }

    fn frame_from_line(&mut self, line: &str) -> Result<Option<StackFrame>, ParseError> {
        let pattern: &Regex = match self.opts.engine {
            EngineKind::LibFuzzer => &NATIVE_FRAME,
            EngineKind::Jazzer => &JAVA_FRAME,
            EngineKind::JazzerJs => &NODE_FRAME,
        };
        let Some(caps) = pattern.captures(line) else {
            return Ok(None);
        };

        let function = caps
            .name("function")
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        let Some(source_file) = self.validate_source_file(&caps["source_file"], &function) else {
            return Ok(None);
        };

        Ok(Some(StackFrame {
            source_file,
            line: parse_field(&caps, "line", line)?,
            column: parse_field(&caps, "column", line)?,
            frame_number: parse_field(&caps, "frame_number", line)?,
            function,
        }))
    }

    fn is_entry_point(&self, function: &str) -> bool {
        match self.opts.engine {
            EngineKind::LibFuzzer => NATIVE_ENTRY_POINTS.contains(&function),
            EngineKind::Jazzer => function.ends_with(JVM_ENTRY_POINT_SUFFIX),
            EngineKind::JazzerJs => false,
        }
    }

    /// Returns the slash-separated, project-relative path of `raw`, or
    /// `None` if the frame does not belong to project code.
    fn validate_source_file(&mut self, raw: &str, function: &str) -> Option<String> {
        let path = Path::new(raw);
        let relative = if path.is_absolute() {
            normalize(path)
                .strip_prefix(normalize(&self.opts.project_dir))
                .ok()?
                .to_path_buf()
        } else {
            normalize(path)
        };
        if matches!(relative.components().next(), Some(Component::ParentDir)) {
            return None;
        }
        let mut relative = relative.to_string_lossy().replace('\\', "/");

        match self.opts.engine {
            EngineKind::Jazzer => {
                let mapped = self.java_source_file_path(raw, function);
                if mapped != relative {
                    // Once inside project code, keep every following frame.
                    self.filter_jvm_frames = false;
                    relative = mapped;
                } else if self.filter_jvm_frames {
                    return None;
                }
            }
            EngineKind::JazzerJs if relative.contains(NODE_VENDOR_DIR) => return None,
            _ => {}
        }

        Some(relative)
    }

    /// Walks the dotted function name right to left looking for a package
    /// that declares a file called `source_file`.
    fn java_source_file_path(&self, source_file: &str, function: &str) -> String {
        let Some(source_map) = &self.opts.source_map else {
            return source_file.to_string();
        };

        // Drop method and class name.
        let mut package = remove_last_part(remove_last_part(function));
        while !package.is_empty() {
            let found = source_map.files_in_package(package).iter().find(|file| {
                Path::new(file.as_str()).file_name().and_then(|n| n.to_str()) == Some(source_file)
            });
            if let Some(file) = found {
                return file.clone();
            }
            package = remove_last_part(package);
        }

        source_file.to_string()
    }
}

fn remove_last_part(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => "",
    }
}

fn parse_field(caps: &Captures<'_>, field: &'static str, line: &str) -> Result<u32, ParseError> {
    match caps.name(field).map(|m| m.as_str()) {
        None | Some("") => Ok(0),
        Some(value) => value.parse().map_err(|source| ParseError::MalformedNumber {
            field,
            value: value.to_string(),
            line: line.to_string(),
            source,
        }),
    }
}

/// Lexically resolves `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other),
        }
    }
    out
}
