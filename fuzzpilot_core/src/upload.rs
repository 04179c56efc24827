use crate::finding::{Finding, FindingError};
use log::info;
use std::io::{self, BufRead, Write};
use std::path::Path;
use thiserror::Error;

/// Environment variable holding the API token used for uploads.
pub const TOKEN_ENV: &str = "FUZZPILOT_API_TOKEN";

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("failed to create a campaign run in {project:?}: {message}")]
    CampaignRun { project: String, message: String },

    #[error("failed to upload finding {name:?}: {message}")]
    Finding { name: String, message: String },

    #[error("failed to list remote projects: {0}")]
    ListProjects(String),

    #[error(transparent)]
    Local(#[from] FindingError),

    #[error("failed to read project selection: {0}")]
    Prompt(#[from] io::Error),
}

pub fn token_from_env() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|token| !token.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignRun {
    pub name: String,
    pub fuzzing_run_name: String,
}

/// Remote service that stores findings.
pub trait UploadClient {
    fn create_campaign_run(
        &self,
        project: &str,
        fuzz_test: &str,
        token: &str,
    ) -> Result<CampaignRun, UploadError>;

    fn upload_finding(
        &self,
        project: &str,
        fuzz_test: &str,
        run: &CampaignRun,
        finding: &Finding,
        token: &str,
    ) -> Result<(), UploadError>;

    fn list_projects(&self, token: &str) -> Result<Vec<String>, UploadError>;
}

/// Uploads `findings` one at a time and deletes each local copy right after
/// the service accepted it. Stops at the first failed upload.
pub fn upload_findings(
    client: &dyn UploadClient,
    project_dir: &Path,
    project: &str,
    fuzz_test: &str,
    findings: &[Finding],
    token: &str,
) -> Result<usize, UploadError> {
    let run = client.create_campaign_run(project, fuzz_test, token)?;
    info!("Created campaign run {}", run.name);

    for finding in findings {
        client.upload_finding(project, fuzz_test, &run, finding, token)?;
        finding.remove(project_dir)?;
        info!("Uploaded finding {}", finding.name);
    }
    Ok(findings.len())
}

/// Chooses a remote project when none was configured.
pub trait ProjectPicker {
    fn pick(&mut self, projects: &[String]) -> Result<Option<String>, UploadError>;
}

/// Numbered menu on a reader/writer pair, usually stdin and stderr.
pub struct PromptPicker<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptPicker<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> ProjectPicker for PromptPicker<R, W> {
    fn pick(&mut self, projects: &[String]) -> Result<Option<String>, UploadError> {
        if projects.is_empty() {
            return Ok(None);
        }
        writeln!(self.output, "Select the project to upload findings to:")?;
        for (i, project) in projects.iter().enumerate() {
            writeln!(self.output, "  [{}] {project}", i + 1)?;
        }
        writeln!(self.output, "  [0] Skip upload")?;
        write!(self.output, "> ")?;
        self.output.flush()?;

        let mut answer = String::new();
        self.input.read_line(&mut answer)?;
        Ok(answer
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| projects.get(i))
            .cloned())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::cell::RefCell;

    /// In-memory service that can be told to reject one finding.
    #[derive(Default)]
    pub struct FakeClient {
        pub reject: Option<String>,
        pub projects: Vec<String>,
        pub uploaded: RefCell<Vec<String>>,
    }

    impl UploadClient for FakeClient {
        fn create_campaign_run(
            &self,
            project: &str,
            fuzz_test: &str,
            _token: &str,
        ) -> Result<CampaignRun, UploadError> {
            Ok(CampaignRun {
                name: format!("{project}/campaign_runs/1"),
                fuzzing_run_name: format!("{project}/fuzzing_runs/{fuzz_test}"),
            })
        }

        fn upload_finding(
            &self,
            _project: &str,
            _fuzz_test: &str,
            _run: &CampaignRun,
            finding: &Finding,
            _token: &str,
        ) -> Result<(), UploadError> {
            if self.reject.as_deref() == Some(finding.name.as_str()) {
                return Err(UploadError::Finding {
                    name: finding.name.clone(),
                    message: "503 Service Unavailable".to_string(),
                });
            }
            self.uploaded.borrow_mut().push(finding.name.clone());
            Ok(())
        }

        fn list_projects(&self, _token: &str) -> Result<Vec<String>, UploadError> {
            Ok(self.projects.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeClient;
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn saved(project_dir: &Path, name: &str) -> Finding {
        let finding = Finding {
            name: name.to_string(),
            details: "crash".to_string(),
            ..Default::default()
        };
        finding.save(project_dir).unwrap();
        finding
    }

    #[test]
    fn uploaded_findings_are_deleted() {
        let project = tempdir().unwrap();
        let findings = vec![saved(project.path(), "brave_otter"), saved(project.path(), "calm_yak")];
        let client = FakeClient::default();

        let count =
            upload_findings(&client, project.path(), "projects/demo", "fuzz", &findings, "t").unwrap();

        assert_eq!(count, 2);
        assert_eq!(*client.uploaded.borrow(), vec!["brave_otter", "calm_yak"]);
        assert!(findings.iter().all(|f| !f.exists(project.path())));
    }

    #[test]
    fn partial_failure_keeps_remaining_findings() {
        let project = tempdir().unwrap();
        let findings = vec![
            saved(project.path(), "brave_otter"),
            saved(project.path(), "calm_yak"),
            saved(project.path(), "eager_ibis"),
        ];
        let client = FakeClient {
            reject: Some("calm_yak".to_string()),
            ..Default::default()
        };

        let result = upload_findings(&client, project.path(), "projects/demo", "fuzz", &findings, "t");

        match result {
            Err(UploadError::Finding { name, .. }) => assert_eq!(name, "calm_yak"),
            other => panic!("Expected an upload error, got {other:?}"),
        }
        assert!(!findings[0].exists(project.path()));
        assert!(findings[1].exists(project.path()));
        assert!(findings[2].exists(project.path()));
    }

    #[test]
    fn prompt_picks_numbered_project() {
        let projects = vec!["projects/a".to_string(), "projects/b".to_string()];
        let mut shown = Vec::new();

        let picked = PromptPicker::new(Cursor::new("2\n"), &mut shown).pick(&projects).unwrap();

        assert_eq!(picked.as_deref(), Some("projects/b"));
        assert!(String::from_utf8(shown).unwrap().contains("[1] projects/a"));
    }

    #[test]
    fn prompt_zero_or_garbage_skips() {
        let projects = vec!["projects/a".to_string()];
        for answer in ["0\n", "x\n", "7\n"] {
            let picked = PromptPicker::new(Cursor::new(answer), Vec::new()).pick(&projects).unwrap();
            assert_eq!(picked, None, "answer {answer:?}");
        }
    }
}
