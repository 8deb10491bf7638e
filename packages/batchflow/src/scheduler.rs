//! Abstract contract over an external batch-queue CLI tool.
//!
//! The only portable guarantee from a real scheduler executable is exit
//! code 0 on success; stdout formats are tool-specific. Each backend
//! supplies command templating and the two output parsers; the client here
//! supplies subprocess invocation and error mapping, nothing else. Calls
//! are synchronous and blocking with no built-in timeout or retry — that
//! policy belongs to the calling loop.

use crate::error::{BatchflowError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// One row of a scheduler status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub scheduler_id: String,
    pub state: String,
    pub queue: Option<String>,
}

/// A real scheduler variant: command templating plus the two stdout parsers.
pub trait SchedulerBackend: Send + Sync {
    /// argv for submitting `script_path` to the queue.
    fn submit_args(&self, script_path: &Path) -> Vec<String>;

    /// argv for querying the status of all tracked jobs.
    fn status_args(&self) -> Vec<String>;

    /// Extract the scheduler-assigned id from submit output.
    fn parse_submit_output(&self, stdout: &str) -> Result<String>;

    /// Parse status output into scheduler id -> status record.
    fn parse_status_output(&self, stdout: &str) -> Result<HashMap<String, StatusRecord>>;
}

/// Shared skeleton: runs backend commands as subprocesses and maps failures
/// into the scheduler error taxonomy.
pub struct SchedulerClient<B: SchedulerBackend> {
    backend: B,
}

impl<B: SchedulerBackend> SchedulerClient<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Submit a job script; returns the scheduler-assigned id.
    pub fn submit(&self, script_path: &Path) -> Result<String> {
        let argv = self.backend.submit_args(script_path);
        let (code, output) = run(&argv)?;
        if code != 0 {
            return Err(BatchflowError::SubmitNonZeroReturnCode { code, output });
        }
        let scheduler_id = self.backend.parse_submit_output(&output)?;
        debug!("Submitted {} as scheduler id {}", script_path.display(), scheduler_id);
        Ok(scheduler_id)
    }

    /// Query the queue; returns scheduler id -> status record.
    pub fn status_dict(&self) -> Result<HashMap<String, StatusRecord>> {
        let argv = self.backend.status_args();
        let (code, output) = run(&argv)?;
        if code != 0 {
            return Err(BatchflowError::StatusNonZeroReturnCode { code, output });
        }
        self.backend.parse_status_output(&output)
    }

    /// Status of a single job. Absence from the queue is reported as
    /// NoQStatInformation: the job has probably completed or been evicted,
    /// which is not necessarily a hard error.
    pub fn get_status(&self, scheduler_id: &str) -> Result<StatusRecord> {
        let statuses = self.status_dict()?;
        statuses.get(scheduler_id).cloned().ok_or_else(|| {
            BatchflowError::NoQStatInformation(format!(
                "No status for {}: this might signal the job is over",
                scheduler_id
            ))
        })
    }
}

/// Run argv, folding stderr into the returned text the way the parsers
/// expect to see it.
fn run(argv: &[String]) -> Result<(i32, String)> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| BatchflowError::config("empty scheduler command"))?;
    let output = Command::new(program).args(args).output()?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok((output.status.code().unwrap_or(-1), text))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend whose commands are injected per test, with a qsub-like
    /// "last token of the first line is the id" submit parser and a
    /// whitespace-columns status parser.
    struct FakeBackend {
        submit: Vec<String>,
        status: Vec<String>,
    }

    impl FakeBackend {
        fn with_submit(cmd: &[&str]) -> Self {
            Self {
                submit: cmd.iter().map(|s| s.to_string()).collect(),
                status: vec!["true".to_string()],
            }
        }

        fn with_status(cmd: &[&str]) -> Self {
            Self {
                submit: vec!["true".to_string()],
                status: cmd.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl SchedulerBackend for FakeBackend {
        fn submit_args(&self, _script_path: &Path) -> Vec<String> {
            self.submit.clone()
        }

        fn status_args(&self) -> Vec<String> {
            self.status.clone()
        }

        fn parse_submit_output(&self, stdout: &str) -> Result<String> {
            stdout
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().last())
                .map(|id| id.to_string())
                .ok_or_else(|| BatchflowError::parse("no scheduler id in submit output"))
        }

        fn parse_status_output(&self, stdout: &str) -> Result<HashMap<String, StatusRecord>> {
            let mut records = HashMap::new();
            for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
                let mut cols = line.split_whitespace();
                let id = cols
                    .next()
                    .ok_or_else(|| BatchflowError::parse("missing id column"))?;
                let state = cols
                    .next()
                    .ok_or_else(|| BatchflowError::parse("missing state column"))?;
                records.insert(
                    id.to_string(),
                    StatusRecord {
                        scheduler_id: id.to_string(),
                        state: state.to_string(),
                        queue: cols.next().map(|q| q.to_string()),
                    },
                );
            }
            Ok(records)
        }
    }

    fn script() -> std::path::PathBuf {
        std::path::PathBuf::from("job.sh")
    }

    #[test]
    fn test_submit_parses_scheduler_id() {
        let client = SchedulerClient::new(FakeBackend::with_submit(&[
            "echo",
            "Submitted batch job 4242",
        ]));
        assert_eq!(client.submit(&script()).unwrap(), "4242");
    }

    #[test]
    fn test_submit_nonzero_exit() {
        let client =
            SchedulerClient::new(FakeBackend::with_submit(&["sh", "-c", "echo refused; exit 3"]));
        match client.submit(&script()).unwrap_err() {
            BatchflowError::SubmitNonZeroReturnCode { code, output } => {
                assert_eq!(code, 3);
                assert!(output.contains("refused"));
            }
            other => panic!("Expected SubmitNonZeroReturnCode, got {:?}", other),
        }
    }

    #[test]
    fn test_status_dict_parses_rows() {
        let client = SchedulerClient::new(FakeBackend::with_status(&[
            "printf",
            "101 RUNNING default\n102 QUEUED debug\n",
        ]));
        let statuses = client.status_dict().unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses["101"].state, "RUNNING");
        assert_eq!(statuses["102"].queue.as_deref(), Some("debug"));
    }

    #[test]
    fn test_status_nonzero_exit() {
        let client = SchedulerClient::new(FakeBackend::with_status(&["sh", "-c", "exit 1"]));
        assert!(matches!(
            client.status_dict().unwrap_err(),
            BatchflowError::StatusNonZeroReturnCode { code: 1, .. }
        ));
    }

    #[test]
    fn test_get_status_missing_id_is_noqstat() {
        let client = SchedulerClient::new(FakeBackend::with_status(&[
            "printf",
            "101 RUNNING default\n",
        ]));
        assert!(matches!(
            client.get_status("12345").unwrap_err(),
            BatchflowError::NoQStatInformation(_)
        ));
    }

    /// Backend that actually executes the submitted script through sh.
    struct ShellBackend;

    impl SchedulerBackend for ShellBackend {
        fn submit_args(&self, script_path: &Path) -> Vec<String> {
            vec![
                "sh".to_string(),
                script_path.to_string_lossy().into_owned(),
            ]
        }

        fn status_args(&self) -> Vec<String> {
            vec!["true".to_string()]
        }

        fn parse_submit_output(&self, stdout: &str) -> Result<String> {
            stdout
                .split_whitespace()
                .last()
                .map(|id| id.to_string())
                .ok_or_else(|| BatchflowError::parse("no scheduler id in submit output"))
        }

        fn parse_status_output(&self, _stdout: &str) -> Result<HashMap<String, StatusRecord>> {
            Ok(HashMap::new())
        }
    }

    #[test]
    fn test_submit_executes_script_file() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("job.sh");
        let mut file = std::fs::File::create(&script_path).unwrap();
        writeln!(file, "echo Submitted batch job 777").unwrap();
        drop(file);

        let client = SchedulerClient::new(ShellBackend);
        assert_eq!(client.submit(&script_path).unwrap(), "777");
    }

    #[test]
    fn test_missing_executable_is_io_error() {
        let client = SchedulerClient::new(FakeBackend::with_submit(&[
            "definitely-not-a-scheduler-cli",
        ]));
        assert!(matches!(
            client.submit(&script()).unwrap_err(),
            BatchflowError::Io(_)
        ));
    }
}
