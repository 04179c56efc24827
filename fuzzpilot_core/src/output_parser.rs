//! Translation of raw engine output lines into [`Report`]s.

use crate::finding::{ErrorType, Finding};
use crate::report::{FuzzingMetric, Report};
use crate::stacktrace::{EngineKind, ParseError, StackTraceParser};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("ansi pattern"));

static SEED_CORPUS_FILES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^INFO: seed corpus: files: (?P<files>\d+)").expect("seed corpus pattern")
});

const EMPTY_CORPUS: &str = "INFO: A corpus is not provided, starting from an empty corpus";

static METRIC_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#(?P<execs>\d+)\s+(?P<event>INITED|NEW|REDUCE|pulse|DONE|RELOAD)\b")
        .expect("metric pattern")
});
static METRIC_COV: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bcov: (?P<value>\d+)").expect("cov pattern"));
static METRIC_FT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bft: (?P<value>\d+)").expect("ft pattern"));
static METRIC_CORP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bcorp: (?P<value>\d+)/").expect("corp pattern"));
static METRIC_EXEC_RATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bexec/s: (?P<value>\d+)").expect("exec/s pattern"));

static SANITIZER_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^==\d+==\s*(?:ERROR|WARNING): (?P<source>\w+): (?P<details>.+?)\s*$")
        .expect("sanitizer error pattern")
});
static UBSAN_RUNTIME_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\S+?:(?:\d+:)?(?:\d+:)? runtime error: (?P<message>.+)$")
        .expect("runtime error pattern")
});
static JAVA_EXCEPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^== Java Exception: (?P<exception>.+?)\s*$").expect("java exception pattern")
});
static NODE_EXCEPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:==\d+==\s*)?Uncaught Exception: (?P<message>.+?)\s*$")
        .expect("node exception pattern")
});
static TEST_UNIT_WRITTEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Test unit written to (?P<path>\S+)").expect("test unit pattern")
});
static JAZZER_CORPUS_DIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^INFO: Using (?P<kind>seed|generated) corpus(?: directory)?:?\s+(?P<path>\S+)\s*$")
        .expect("corpus directory pattern")
});

const SECURITY_ISSUE_MARKER: &str = "FuzzerSecurityIssue";

struct PendingFinding {
    error_type: ErrorType,
    details: String,
    logs: Vec<String>,
}

impl PendingFinding {
    // Crash file announced without a recognized error header.
    fn unknown() -> Self {
        Self {
            error_type: ErrorType::UnknownError,
            details: "unknown error".to_string(),
            logs: Vec::new(),
        }
    }
}

/// Line-by-line state machine over one engine run.
pub struct OutputParser {
    stack_parser: StackTraceParser,
    pending: Option<PendingFinding>,
    last_features: u64,
    last_edges: u64,
    last_feature_at: DateTime<Utc>,
    last_edge_at: DateTime<Utc>,
}

impl OutputParser {
    pub fn new(stack_parser: StackTraceParser) -> Self {
        let now = Utc::now();
        Self {
            stack_parser,
            pending: None,
            last_features: 0,
            last_edges: 0,
            last_feature_at: now,
            last_edge_at: now,
        }
    }

    fn engine(&self) -> EngineKind {
        self.stack_parser.engine()
    }

    /// Consumes one output line and returns the reports it completes.
    pub fn parse_line(&mut self, raw: &str) -> Result<Vec<Report>, ParseError> {
        let line = ANSI_ESCAPE.replace_all(raw.trim_end_matches(['\r', '\n']), "");
        let line = line.as_ref();

        if let Some(caps) = TEST_UNIT_WRITTEN.captures(line) {
            let path = PathBuf::from(&caps["path"]);
            self.pending_or_unknown().logs.push(line.to_string());
            let finding = self.take_finding(Some(path))?;
            return Ok(vec![Report::Finding(Box::new(finding))]);
        }

        let error_start = self.error_start(line);
        let mut reports = Vec::new();

        // A recovered error is followed by regular engine output. That output
        // or the next error header ends the pending finding.
        if self.pending.is_some() {
            if error_start.is_none() && !METRIC_LINE.is_match(line) {
                self.pending_or_unknown().logs.push(line.to_string());
                return Ok(reports);
            }
            let finding = self.take_finding(None)?;
            reports.push(Report::Finding(Box::new(finding)));
        }

        if let Some((error_type, details)) = error_start {
            debug!("Collecting finding: {details}");
            self.pending = Some(PendingFinding {
                error_type,
                details,
                logs: vec![line.to_string()],
            });
            return Ok(reports);
        }

        if let Some(caps) = SEED_CORPUS_FILES.captures(line) {
            let num_seeds = parse_count(&caps["files"]);
            reports.push(Report::Initializing { num_seeds });
            return Ok(reports);
        }
        if line.starts_with(EMPTY_CORPUS) {
            reports.push(Report::Initializing { num_seeds: 0 });
            return Ok(reports);
        }

        if let Some(caps) = METRIC_LINE.captures(line) {
            let metric = self.metric_from_line(line, parse_count(&caps["execs"]));
            if &caps["event"] == "INITED" {
                reports.push(Report::Running);
            }
            reports.push(Report::Metric(metric));
            return Ok(reports);
        }

        if self.engine() == EngineKind::Jazzer {
            if let Some(caps) = JAZZER_CORPUS_DIR.captures(line) {
                let path = Some(PathBuf::from(&caps["path"]));
                let report = if &caps["kind"] == "seed" {
                    Report::CorpusPaths {
                        seed_corpus: path,
                        generated_corpus: None,
                    }
                } else {
                    Report::CorpusPaths {
                        seed_corpus: None,
                        generated_corpus: path,
                    }
                };
                reports.push(report);
            }
        }

        Ok(reports)
    }

    /// Flushes a finding whose crash file was never announced.
    pub fn finish(&mut self) -> Result<Vec<Report>, ParseError> {
        if self.pending.is_none() {
            return Ok(Vec::new());
        }
        let finding = self.take_finding(None)?;
        Ok(vec![Report::Finding(Box::new(finding))])
    }

    fn error_start(&self, line: &str) -> Option<(ErrorType, String)> {
        if let Some(caps) = SANITIZER_ERROR.captures(line) {
            return Some((ErrorType::Crash, caps["details"].to_string()));
        }
        if let Some(caps) = UBSAN_RUNTIME_ERROR.captures(line) {
            return Some((
                ErrorType::RuntimeError,
                format!("undefined behavior: {}", &caps["message"]),
            ));
        }
        match self.engine() {
            EngineKind::Jazzer => JAVA_EXCEPTION
                .captures(line)
                .map(|caps| (ErrorType::Crash, java_details(&caps["exception"]))),
            EngineKind::JazzerJs => NODE_EXCEPTION
                .captures(line)
                .map(|caps| (ErrorType::Crash, caps["message"].to_string())),
            EngineKind::LibFuzzer => None,
        }
    }

    fn pending_or_unknown(&mut self) -> &mut PendingFinding {
        self.pending.get_or_insert_with(PendingFinding::unknown)
    }

    fn take_finding(&mut self, input_file: Option<PathBuf>) -> Result<Finding, ParseError> {
        let pending = self.pending.take().unwrap_or_else(PendingFinding::unknown);
        let stack_trace = self.stack_parser.parse(&pending.logs)?;

        let input_data = match &input_file {
            Some(path) => std::fs::read(path).unwrap_or_else(|e| {
                warn!("Failed to read crashing input {path:?}: {e}");
                Vec::new()
            }),
            None => Vec::new(),
        };

        Ok(Finding {
            error_type: pending.error_type,
            details: pending.details,
            logs: pending.logs,
            input_data,
            input_file,
            stack_trace,
            ..Default::default()
        })
    }

    fn metric_from_line(&mut self, line: &str, total_executions: u64) -> FuzzingMetric {
        let edges = capture_count(&METRIC_COV, line);
        let features = capture_count(&METRIC_FT, line);
        let now = Utc::now();

        if features > self.last_features {
            self.last_features = features;
            self.last_feature_at = now;
        }
        if edges > self.last_edges {
            self.last_edges = edges;
            self.last_edge_at = now;
        }

        FuzzingMetric {
            timestamp: now,
            executions_per_second: capture_count(&METRIC_EXEC_RATE, line),
            total_executions,
            features,
            edges,
            corpus_size: capture_count(&METRIC_CORP, line),
            seconds_since_last_feature: seconds_between(self.last_feature_at, now),
            seconds_since_last_edge: seconds_between(self.last_edge_at, now),
        }
    }
}

fn capture_count(pattern: &Regex, line: &str) -> u64 {
    pattern
        .captures(line)
        .map(|caps| parse_count(&caps["value"]))
        .unwrap_or_default()
}

// Digits only, so the sole failure is overflow.
fn parse_count(digits: &str) -> u64 {
    digits.parse().unwrap_or_else(|_| {
        warn!("Count {digits} out of range, using {}", u64::MAX);
        u64::MAX
    })
}

fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> u64 {
    u64::try_from((later - earlier).num_seconds()).unwrap_or_default()
}

fn java_details(exception: &str) -> String {
    let (class, message) = exception.split_once(": ").unwrap_or((exception, ""));
    if class.contains(SECURITY_ISSUE_MARKER) {
        format!("Security Issue: {message}")
    } else {
        class.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stacktrace::ParserOptions;
    use std::fs;
    use tempfile::tempdir;

    fn parser_for(engine: EngineKind) -> OutputParser {
        OutputParser::new(StackTraceParser::new(ParserOptions {
            project_dir: PathBuf::from("/home/dev/project"),
            engine,
            ..Default::default()
        }))
    }

    fn feed(parser: &mut OutputParser, lines: &[&str]) -> Vec<Report> {
        let mut reports = Vec::new();
        for line in lines {
            reports.extend(parser.parse_line(line).unwrap());
        }
        reports.extend(parser.finish().unwrap());
        reports
    }

    #[test]
    fn initialization_lines_become_status_reports() {
        let mut parser = parser_for(EngineKind::LibFuzzer);
        let reports = feed(
            &mut parser,
            &[
                "INFO: Seed: 3918206239",
                "INFO: seed corpus: files: 12 min: 1b max: 40b total: 200b rss: 31Mb",
                "#13\tINITED cov: 10 ft: 12 corp: 5/60b exec/s: 0 rss: 32Mb",
            ],
        );

        assert_eq!(reports.len(), 3, "Unexpected reports: {reports:?}");
        assert_eq!(reports[0], Report::Initializing { num_seeds: 12 });
        assert_eq!(reports[1], Report::Running);
        match &reports[2] {
            Report::Metric(metric) => {
                assert_eq!(metric.total_executions, 13);
                assert_eq!(metric.edges, 10);
                assert_eq!(metric.features, 12);
                assert_eq!(metric.corpus_size, 5);
            }
            other => panic!("Expected a metric, got {other:?}"),
        }
    }

    #[test]
    fn empty_corpus_line_reports_zero_seeds() {
        let mut parser = parser_for(EngineKind::LibFuzzer);
        let reports = feed(&mut parser, &[EMPTY_CORPUS]);
        assert_eq!(reports, vec![Report::Initializing { num_seeds: 0 }]);
    }

    #[test]
    fn pulse_line_reports_exec_rate() {
        let mut parser = parser_for(EngineKind::LibFuzzer);
        let reports = feed(
            &mut parser,
            &["#262144\tpulse  cov: 120 ft: 300 corp: 40/1200b lim: 4096 exec/s: 87381 rss: 50Mb"],
        );
        match reports.as_slice() {
            [Report::Metric(metric)] => {
                assert_eq!(metric.executions_per_second, 87381);
                assert_eq!(metric.total_executions, 262144);
            }
            other => panic!("Expected one metric, got {other:?}"),
        }
    }

    #[test]
    fn asan_crash_becomes_finding_with_input() {
        let artifacts = tempdir().unwrap();
        let crash = artifacts.path().join("crash-deadbeef");
        fs::write(&crash, b"AAAA").unwrap();
        let written = format!(
            "artifact_prefix='{}/'; Test unit written to {}",
            artifacts.path().display(),
            crash.display()
        );

        let mut parser = parser_for(EngineKind::LibFuzzer);
        let reports = feed(
            &mut parser,
            &[
                "#5\tNEW    cov: 4 ft: 4 corp: 2/3b lim: 4 exec/s: 0 rss: 30Mb L: 2/2 MS: 1 InsertByte-",
                "==4242==ERROR: AddressSanitizer: heap-buffer-overflow on address 0x602000000011 at pc 0x1",
                "    #0 0x55d1c3 in parse_header /home/dev/project/src/parser.c:42:13",
                "    #1 0x55d4c2 in LLVMFuzzerTestOneInput /home/dev/project/fuzz/fuzz_test.cpp:20:3",
                "SUMMARY: AddressSanitizer: heap-buffer-overflow /home/dev/project/src/parser.c:42:13 in parse_header",
                "MS: 1 ChangeByte-; base unit: 0000",
                &written,
            ],
        );

        assert_eq!(reports.len(), 2, "Unexpected reports: {reports:?}");
        let Report::Finding(finding) = &reports[1] else {
            panic!("Expected a finding, got {:?}", reports[1]);
        };
        assert_eq!(finding.error_type, ErrorType::Crash);
        assert!(finding.details.starts_with("heap-buffer-overflow"));
        assert_eq!(finding.input_file, Some(crash));
        assert_eq!(finding.input_data, b"AAAA");
        assert_eq!(finding.stack_trace.len(), 2);
        assert_eq!(finding.stack_trace[0].source_file, "src/parser.c");
        assert_eq!(finding.logs.len(), 6);
        assert_eq!(finding.logs.last(), Some(&written));
    }

    #[test]
    fn ubsan_error_without_crash_file_is_flushed() {
        let mut parser = parser_for(EngineKind::LibFuzzer);
        let reports = feed(
            &mut parser,
            &["/home/dev/project/src/math.cpp:5:10: runtime error: signed integer overflow: 1 + 2147483647"],
        );

        let [Report::Finding(finding)] = reports.as_slice() else {
            panic!("Expected one finding, got {reports:?}");
        };
        assert_eq!(finding.error_type, ErrorType::RuntimeError);
        assert_eq!(finding.short_description(), "undefined behavior in src/math.cpp:5:10");
        assert!(finding.input_file.is_none());
    }

    #[test]
    fn recovered_error_does_not_swallow_later_output() {
        let mut parser = parser_for(EngineKind::LibFuzzer);
        let reports = feed(
            &mut parser,
            &[
                "#2\tINITED cov: 3 ft: 3 corp: 1/1b exec/s: 0 rss: 30Mb",
                "/home/dev/project/src/math.cpp:5:10: runtime error: signed integer overflow: 1 + 2147483647",
                "SUMMARY: UndefinedBehaviorSanitizer: undefined-behavior /home/dev/project/src/math.cpp:5:10",
                "#1024\tpulse  cov: 4 ft: 5 corp: 2/2b lim: 4 exec/s: 512 rss: 31Mb",
                "#2048\tpulse  cov: 4 ft: 5 corp: 2/2b lim: 4 exec/s: 512 rss: 31Mb",
                "==9==ERROR: AddressSanitizer: stack-overflow on address 0x7ffd",
                "    #0 0x55d1c3 in recurse /home/dev/project/src/tree.c:8:3",
            ],
        );

        let metrics = reports
            .iter()
            .filter(|report| matches!(report, Report::Metric(_)))
            .count();
        assert_eq!(metrics, 3, "Unexpected reports: {reports:?}");
        let details: Vec<&str> = reports
            .iter()
            .filter_map(|report| match report {
                Report::Finding(finding) => Some(finding.details.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            details,
            vec![
                "undefined behavior: signed integer overflow: 1 + 2147483647",
                "stack-overflow on address 0x7ffd",
            ]
        );
        let Report::Finding(first) = &reports[2] else {
            panic!("Expected the recovered finding before the pulse, got {:?}", reports[2]);
        };
        assert_eq!(first.logs.len(), 2);
    }

    #[test]
    fn oversized_counts_saturate() {
        let mut parser = parser_for(EngineKind::LibFuzzer);
        let reports = feed(
            &mut parser,
            &["#99999999999999999999\tpulse  cov: 1 ft: 1 corp: 1/1b exec/s: 1 rss: 1Mb"],
        );
        match reports.as_slice() {
            [Report::Metric(metric)] => assert_eq!(metric.total_executions, u64::MAX),
            other => panic!("Expected one metric, got {other:?}"),
        }
    }

    #[test]
    fn jazzer_security_issue_details() {
        let mut parser = parser_for(EngineKind::Jazzer);
        let reports = feed(
            &mut parser,
            &[
                "== Java Exception: com.code_intelligence.jazzer.api.FuzzerSecurityIssueCritical: OS Command Injection",
                "\tat com.example.Exec.run(Exec.java:10)",
            ],
        );

        let [Report::Finding(finding)] = reports.as_slice() else {
            panic!("Expected one finding, got {reports:?}");
        };
        assert_eq!(finding.details, "Security Issue: OS Command Injection");
    }

    #[test]
    fn jazzer_announces_corpus_dirs() {
        let mut parser = parser_for(EngineKind::Jazzer);
        let reports = feed(
            &mut parser,
            &["INFO: Using generated corpus directory: /home/dev/project/.fuzzpilot-corpus/com.example.FuzzTest"],
        );
        assert_eq!(
            reports,
            vec![Report::CorpusPaths {
                seed_corpus: None,
                generated_corpus: Some(PathBuf::from(
                    "/home/dev/project/.fuzzpilot-corpus/com.example.FuzzTest"
                )),
            }]
        );
    }

    #[test]
    fn colored_node_exception_is_detected() {
        let mut parser = parser_for(EngineKind::JazzerJs);
        let reports = feed(
            &mut parser,
            &[
                "\x1b[31m==17== Uncaught Exception: Jazzer.js: boom\x1b[0m",
                "    at parse (/home/dev/project/lib/parse.js:3:9)",
            ],
        );

        let [Report::Finding(finding)] = reports.as_slice() else {
            panic!("Expected one finding, got {reports:?}");
        };
        assert_eq!(finding.details, "Jazzer.js: boom");
        assert_eq!(finding.stack_trace[0].source_file, "lib/parse.js");
    }

    #[test]
    fn java_exception_ignored_for_native_engine() {
        let mut parser = parser_for(EngineKind::LibFuzzer);
        assert!(feed(&mut parser, &["== Java Exception: java.lang.Error"]).is_empty());
    }
}
