use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::command::{CommandPaths, build_command};
use super::output::OutputLog;
use super::staging::ArtifactStager;
use crate::config::FlasherConfig;
use crate::error::FlashError;
use crate::executor::{Execution, Executor};
use crate::models::{CancelToken, FlashJob, FlashResult, FlashingStatus};
use crate::utils::manifest::{ArtifactInspector, ArtifactKind, FALLBACK_MODULE_NAME, ZipManifestInspector};
use crate::utils::tracker::InstallStatusTracker;

/// Receives the live output of a flash run.
///
/// Methods are called from the task driving the run, never concurrently.
pub trait FlashListener: Send + Sync {
    fn on_stdout(&self, _line: &str) {}

    fn on_stderr(&self, _line: &str) {}

    /// Called once per executed element (and once for an empty batch)
    fn on_finish(&self, _job: &FlashJob, _result: &FlashResult) {}
}

/// Listener that ignores everything
pub struct NoopListener;

impl FlashListener for NoopListener {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    Stdout(String),
    Stderr(String),
    Finished { job: FlashJob, result: FlashResult },
}

/// Forward everything to a foreground consumer
impl FlashListener for mpsc::UnboundedSender<FlashEvent> {
    fn on_stdout(&self, line: &str) {
        let _ = self.send(FlashEvent::Stdout(line.to_string()));
    }

    fn on_stderr(&self, line: &str) {
        let _ = self.send(FlashEvent::Stderr(line.to_string()));
    }

    fn on_finish(&self, job: &FlashJob, result: &FlashResult) {
        let _ = self.send(FlashEvent::Finished {
            job: job.clone(),
            result: *result,
        });
    }
}

/// Drives flash jobs through the privileged executor, one invocation at a time
pub struct FlashOrchestrator {
    executor: Arc<dyn Executor>,
    inspector: Arc<dyn ArtifactInspector>,
    stager: ArtifactStager,
    paths: CommandPaths,
    settle_delay: Duration,
    tracker: InstallStatusTracker,
    status: watch::Sender<FlashingStatus>,
    output: Mutex<OutputLog>,
    running: tokio::sync::Mutex<()>,
}

impl FlashOrchestrator {
    pub fn new(executor: Arc<dyn Executor>, config: &FlasherConfig) -> Self {
        let (status, _) = watch::channel(FlashingStatus::Flashing);
        Self {
            executor,
            inspector: Arc::new(ZipManifestInspector),
            stager: ArtifactStager::new(config.cache_dir()),
            paths: CommandPaths::from_config(config),
            settle_delay: config.flash.settle_delay(),
            tracker: InstallStatusTracker::new(),
            status,
            output: Mutex::new(OutputLog::new()),
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn ArtifactInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn tracker(&self) -> &InstallStatusTracker {
        &self.tracker
    }

    pub fn status(&self) -> watch::Receiver<FlashingStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> FlashingStatus {
        *self.status.borrow()
    }

    fn output(&self) -> MutexGuard<'_, OutputLog> {
        self.output.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Text as a terminal would show it right now
    pub fn display_text(&self) -> String {
        self.output().display().to_string()
    }

    /// Every stdout and stderr line of the current run
    pub fn raw_log(&self) -> String {
        self.output().raw().to_string()
    }

    pub fn save_log(&self, dir: &Path, product: &str) -> anyhow::Result<PathBuf> {
        self.output().save(dir, product)
    }

    /// Run a job to completion, including every remaining batch element
    pub async fn run(&self, job: FlashJob, listener: &dyn FlashListener) -> FlashResult {
        self.run_until_cancelled(job, listener, &CancelToken::new())
            .await
    }

    /// Like [`run`](Self::run), but stops scheduling further batch elements
    /// once `cancel` fires. An element that already started always finishes.
    pub async fn run_until_cancelled(
        &self,
        job: FlashJob,
        listener: &dyn FlashListener,
        cancel: &CancelToken,
    ) -> FlashResult {
        let _running = self.running.lock().await;
        self.prepare(&job);

        let mut job = job;
        loop {
            let result = self.run_element(&job, listener).await;

            let Some(next) = job.advance() else {
                self.log_batch_summary(&job);
                return result;
            };
            if cancel.is_cancelled() {
                info!("Leaving batch before element {}", next_ordinal(&next));
                return result;
            }
            tokio::time::sleep(self.settle_delay).await;
            if cancel.is_cancelled() {
                info!("Leaving batch before element {}", next_ordinal(&next));
                return result;
            }
            job = next;
        }
    }

    /// Execute only the job's current element.
    ///
    /// Returns the result plus the batch continuation to run next, if any.
    pub async fn run_once(
        &self,
        job: &FlashJob,
        listener: &dyn FlashListener,
    ) -> (FlashResult, Option<FlashJob>) {
        let _running = self.running.lock().await;
        self.prepare(job);
        let result = self.run_element(job, listener).await;
        let next = job.advance();
        if next.is_none() {
            self.log_batch_summary(job);
        }
        (result, next)
    }

    /// Fresh runs start with a clean log; a batch continuation keeps sharing it
    fn prepare(&self, job: &FlashJob) {
        match job {
            FlashJob::InstallModuleBatch {
                artifacts,
                current_index,
            } => {
                if *current_index == 0 {
                    self.tracker.reset(artifacts.len());
                    *self.output() = OutputLog::new();
                }
            }
            _ => *self.output() = OutputLog::new(),
        }
    }

    fn emit_stdout(&self, line: &str, listener: &dyn FlashListener) {
        debug!("stdout: {}", line);
        self.output().push_stdout(line);
        listener.on_stdout(line);
    }

    fn emit_stderr(&self, line: &str, listener: &dyn FlashListener) {
        debug!("stderr: {}", line);
        self.output().push_stderr(line);
        listener.on_stderr(line);
    }

    async fn run_element(&self, job: &FlashJob, listener: &dyn FlashListener) -> FlashResult {
        if job.is_exhausted() {
            warn!("Nothing left to run for {}", job);
            let result = FlashResult::not_started();
            listener.on_finish(job, &result);
            return result;
        }

        self.status.send_replace(FlashingStatus::Flashing);
        info!("Starting {}", job);

        if let FlashJob::InstallModuleBatch {
            artifacts,
            current_index,
        } = job
        {
            if *current_index > 0 {
                self.emit_stdout("", listener);
            }
            let name = match job.current_artifact() {
                Some(artifact) => self.module_name(artifact).await,
                None => FALLBACK_MODULE_NAME.to_string(),
            };
            self.tracker.begin_module(current_index + 1, &name);
            self.emit_stdout(
                &format!(
                    "Installing module {}/{}: {}",
                    current_index + 1,
                    artifacts.len(),
                    name
                ),
                listener,
            );
        }
        self.check_artifact_kind(job).await;

        let result = match self.invoke(job, listener).await {
            Ok(code) => FlashResult::from_exit_code(code, job.needs_reboot()),
            Err(e) => {
                error!("{} failed before completion: {}", job, e);
                self.emit_stderr(&e.to_string(), listener);
                FlashResult::not_started()
            }
        };

        if result.success {
            info!("{} succeeded", job);
            self.status.send_replace(FlashingStatus::Success);
        } else {
            warn!("{} failed with exit code {}", job, result.exit_code);
            if result.exit_code != 0 {
                self.output().push_exit_trailer(result.exit_code);
            }
            self.status.send_replace(FlashingStatus::Failed);
            if job.is_batch() {
                self.tracker.fail_current();
            }
        }

        listener.on_finish(job, &result);
        result
    }

    async fn invoke(&self, job: &FlashJob, listener: &dyn FlashListener) -> Result<i32, FlashError> {
        // Staged copies are removed when `staged` drops, on every path out
        let staged = self.stager.stage(job).await?;
        let command = build_command(job, &staged, &self.paths);
        info!("Running {}", command);

        let mut execution = self.executor.execute(&command)?;
        self.pump(&mut execution, listener).await;

        let code = (&mut execution.exit)
            .await
            .map_err(|_| FlashError::ExecutorIo(format!("{} ended without an exit code", command)))?;
        drop(staged);
        Ok(code)
    }

    async fn pump(&self, execution: &mut Execution, listener: &dyn FlashListener) {
        let mut stdout_open = true;
        let mut stderr_open = true;
        while stdout_open || stderr_open {
            tokio::select! {
                biased;
                line = execution.stdout.recv(), if stdout_open => match line {
                    Some(line) => self.emit_stdout(&line, listener),
                    None => stdout_open = false,
                },
                line = execution.stderr.recv(), if stderr_open => match line {
                    Some(line) => self.emit_stderr(&line, listener),
                    None => stderr_open = false,
                },
            }
        }
    }

    async fn module_name(&self, artifact: &Path) -> String {
        let inspector = self.inspector.clone();
        let path = artifact.to_path_buf();
        match tokio::task::spawn_blocking(move || inspector.module_name(&path)).await {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                warn!("Could not read module name from {:?}: {:#}", artifact, e);
                FALLBACK_MODULE_NAME.to_string()
            }
            Err(e) => {
                warn!("Module name lookup panicked: {}", e);
                FALLBACK_MODULE_NAME.to_string()
            }
        }
    }

    /// Advisory only: a surprising file type is logged and the job still runs
    async fn check_artifact_kind(&self, job: &FlashJob) {
        let expected = match job {
            FlashJob::InstallModule { .. }
            | FlashJob::UpdateModule { .. }
            | FlashJob::InstallModuleBatch { .. } => ArtifactKind::ModuleZip,
            _ => return,
        };
        let Some(path) = job.current_artifact().cloned() else {
            return;
        };
        let inspector = self.inspector.clone();
        let candidate = path.clone();
        if let Ok(kind) = tokio::task::spawn_blocking(move || inspector.classify(&candidate)).await {
            if kind != expected {
                warn!("{:?} looks like a {} rather than a {}", path, kind, expected);
            }
        }
    }

    fn log_batch_summary(&self, job: &FlashJob) {
        if !job.is_batch() {
            return;
        }
        let status = self.tracker.snapshot();
        if status.has_failures() {
            warn!(
                "Batch finished, {} of {} modules failed: {}",
                status.failed_modules.len(),
                status.total_modules,
                status.failed_modules.join(", ")
            );
        } else {
            info!("Batch finished, all {} modules installed", status.total_modules);
        }
    }
}

fn next_ordinal(job: &FlashJob) -> usize {
    match job {
        FlashJob::InstallModuleBatch { current_index, .. } => current_index + 1,
        _ => 0,
    }
}
