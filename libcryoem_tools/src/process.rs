use std::path::PathBuf;
use std::sync::mpsc::Sender;

use super::error::{ProcessorError, ToolError, WrapperError};
use super::tool::ToolInvocation;
use super::worker_status::WorkerStatus;

/// One external command of a batch
#[derive(Debug, Clone)]
pub struct BatchTask {
    pub label: String,
    pub invocation: ToolInvocation,
    /// Where to save the captured stdout/stderr, if anywhere
    pub log_file: Option<PathBuf>,
}

/// A wrapper that turns its configuration into a list of external commands
pub trait BatchJob {
    /// Name used in logs and progress messages
    fn name(&self) -> &'static str;

    /// Resolve the tool, find unfinished inputs, and build one task per input
    fn prepare(&self) -> Result<Vec<BatchTask>, WrapperError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Only log the commands
    pub dry_run: bool,
    /// Continue with the next task after a failed one
    pub keep_going: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: Vec<String>,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

fn save_log(task: &BatchTask, stdout: &str, stderr: &str) -> Result<(), std::io::Error> {
    if let Some(path) = &task.log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{}\n{stdout}{stderr}", task.invocation))?;
    }
    Ok(())
}

/// Run a prepared list of tasks one after another, reporting progress through `tx`
pub fn run_batch(
    name: &str,
    tasks: &[BatchTask],
    options: BatchOptions,
    tx: &Sender<WorkerStatus>,
) -> Result<BatchSummary, ProcessorError> {
    let total = tasks.len();
    let mut summary = BatchSummary::default();
    tx.send(WorkerStatus::new(0, total, name))?;

    for (idx, task) in tasks.iter().enumerate() {
        log::info!("[{}/{}] {}", idx + 1, total, task.invocation);
        if options.dry_run {
            summary.succeeded += 1;
            tx.send(WorkerStatus::new(idx + 1, total, &task.label))?;
            continue;
        }

        match task.invocation.run() {
            Ok(output) => {
                if let Err(e) = save_log(task, &output.stdout, &output.stderr) {
                    log::warn!("Could not save log for {}: {e}", task.label);
                }
                summary.succeeded += 1;
            }
            Err(ToolError::Failed {
                program,
                code,
                stdout,
                stderr,
            }) => {
                if let Err(e) = save_log(task, &stdout, &stderr) {
                    log::warn!("Could not save log for {}: {e}", task.label);
                }
                if !options.keep_going {
                    return Err(ProcessorError::ToolError(ToolError::Failed {
                        program,
                        code,
                        stdout,
                        stderr,
                    }));
                }
                log::error!(
                    "{} failed with status {code:?}: {}",
                    task.label,
                    stderr.trim()
                );
                if let Some(path) = &task.log_file {
                    log::error!("Output of {} is in {}", program.display(), path.display());
                }
                summary.failed.push(task.label.clone());
            }
            Err(e) => return Err(ProcessorError::ToolError(e)),
        }
        tx.send(WorkerStatus::new(idx + 1, total, &task.label))?;
    }

    Ok(summary)
}

/// The function to be called by a separate thread (typically the UI).
///
/// Prepares the job and runs every task it produced.
pub fn process<J: BatchJob>(
    job: &J,
    options: BatchOptions,
    tx: Sender<WorkerStatus>,
) -> Result<BatchSummary, ProcessorError> {
    let tasks = job.prepare()?;
    if tasks.is_empty() {
        log::info!("{}: nothing to do, all outputs exist.", job.name());
        tx.send(WorkerStatus::new(0, 0, job.name()))?;
        return Ok(BatchSummary::default());
    }
    log::info!("{}: {} input(s) to process.", job.name(), tasks.len());
    let summary = run_batch(job.name(), &tasks, options, &tx)?;
    log::info!(
        "{}: finished {} task(s), {} failed.",
        job.name(),
        summary.succeeded,
        summary.failed.len()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ExternalTool;
    use rstest::rstest;
    use std::path::Path;
    use std::sync::mpsc::channel;

    struct Listing {
        tasks: Vec<BatchTask>,
    }

    impl BatchJob for Listing {
        fn name(&self) -> &'static str {
            "listing"
        }

        fn prepare(&self) -> Result<Vec<BatchTask>, WrapperError> {
            Ok(self.tasks.clone())
        }
    }

    fn task(label: &str, program: &Path) -> BatchTask {
        BatchTask {
            label: label.to_string(),
            invocation: ToolInvocation::new(program),
            log_file: None,
        }
    }

    #[test]
    fn dry_run_reports_progress_without_running() {
        let job = Listing {
            tasks: vec![
                task("a", Path::new("/nonexistent/a")),
                task("b", Path::new("/nonexistent/b")),
            ],
        };
        let (tx, rx) = channel();
        let options = BatchOptions {
            dry_run: true,
            keep_going: false,
        };
        let summary = process(&job, options, tx).unwrap();
        assert_eq!(summary.succeeded, 2);
        let statuses: Vec<WorkerStatus> = rx.iter().collect();
        assert_eq!(statuses.len(), 3);
        assert!(statuses[2].is_finished());
        assert_eq!(statuses[1].progress, 0.5);
    }

    #[cfg(unix)]
    #[rstest]
    #[case(false)]
    #[case(true)]
    fn failed_task_output_is_saved(#[case] keep_going: bool) {
        let Ok(sh) = ExternalTool::locate("sh") else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("logs").join("mic_01.log");
        let tasks = vec![BatchTask {
            label: String::from("mic_01"),
            invocation: ToolInvocation::new(sh.path())
                .arg("-c")
                .arg("echo ERROR: input is not an MRC file; exit 2"),
            log_file: Some(log_file.clone()),
        }];
        let (tx, _rx) = channel();
        let options = BatchOptions {
            dry_run: false,
            keep_going,
        };
        let result = run_batch("test", &tasks, options, &tx);
        assert_eq!(result.is_ok(), keep_going);

        let log = std::fs::read_to_string(&log_file).unwrap();
        assert!(log.starts_with(&tasks[0].invocation.to_string()));
        assert!(log.contains("ERROR: input is not an MRC file"));
    }

    #[cfg(unix)]
    #[test]
    fn keep_going_collects_failures() {
        let (Ok(yes), Ok(no)) = (ExternalTool::locate("true"), ExternalTool::locate("false"))
        else {
            return;
        };
        let tasks = vec![task("bad", no.path()), task("good", yes.path())];
        let (tx, _rx) = channel();
        let options = BatchOptions {
            dry_run: false,
            keep_going: true,
        };
        let summary = run_batch("test", &tasks, options, &tx).unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, vec![String::from("bad")]);

        let strict = BatchOptions {
            dry_run: false,
            keep_going: false,
        };
        assert!(run_batch("test", &tasks, strict, &tx).is_err());
    }
}
