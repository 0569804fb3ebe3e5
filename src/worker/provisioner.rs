use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::retry::{ErrorKind, ErrorSignal};
use crate::scheduler::WorksetRequirements;

/// Everything the provisioner needs to run one workset on one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub workset_id: String,
    pub storage_location: String,
    pub cluster_name: String,
    pub requirements: WorksetRequirements,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub job_id: String,
    pub workset_id: String,
}

/// Terminal result of one provisioning attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionResult {
    Success,
    Failure {
        error: ErrorSignal,
        failed_step: Option<String>,
    },
}

impl ProvisionResult {
    pub fn failure(error: ErrorSignal) -> Self {
        ProvisionResult::Failure {
            error,
            failed_step: None,
        }
    }
}

/// The external system that actually runs a workset's pipeline.
///
/// `submit` may be called again for a workset whose earlier attempt has an
/// unknown outcome; implementations must tolerate that.
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    async fn submit(&self, request: &ProvisionRequest) -> Result<JobHandle, ErrorSignal>;

    /// Waits for the job behind `handle` to reach a terminal result.
    async fn wait(&self, handle: &JobHandle) -> ProvisionResult;
}

/// Runs a shell command per workset on the local host.
///
/// The command template may reference `{workset_id}`, `{storage_location}`
/// and `{cluster}`. Each is substituted as a single-quoted shell word, so the
/// placeholder must not itself sit inside quotes. The same values are
/// exported as `URSA_WORKSET_ID`, `URSA_STORAGE_LOCATION` and `URSA_CLUSTER`.
/// A non-zero exit is reported with stderr as the failure detail, which the
/// classifier then inspects.
pub struct CommandProvisioner {
    template: String,
    timeout: Option<Duration>,
    running: Mutex<HashMap<String, JoinHandle<ProvisionResult>>>,
}

impl CommandProvisioner {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            timeout: None,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn render(&self, request: &ProvisionRequest) -> String {
        self.template
            .replace("{workset_id}", &shell_quote(&request.workset_id))
            .replace("{storage_location}", &shell_quote(&request.storage_location))
            .replace("{cluster}", &shell_quote(&request.cluster_name))
    }

    async fn execute(
        mut command: Command,
        workset_id: String,
        timeout: Option<Duration>,
    ) -> ProvisionResult {
        let output = command.output();
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, output).await {
                Ok(result) => result,
                Err(_) => {
                    return ProvisionResult::failure(ErrorSignal::new(
                        ErrorKind::Timeout,
                        format!("command timed out after {}s", limit.as_secs()),
                    ))
                }
            },
            None => output.await,
        };
        Self::process_output(&workset_id, result)
    }

    fn process_output(
        workset_id: &str,
        result: Result<std::process::Output, std::io::Error>,
    ) -> ProvisionResult {
        match result {
            Ok(output) if output.status.success() => {
                tracing::info!(workset_id, "Provisioner command succeeded");
                ProvisionResult::Success
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let exit_code = output.status.code();
                tracing::warn!(workset_id, exit_code = ?exit_code, "Provisioner command failed");
                let detail = if stderr.is_empty() {
                    format!("Exit code: {:?}", exit_code)
                } else {
                    stderr
                };
                ProvisionResult::failure(ErrorSignal::from_message(detail))
            }
            Err(e) => {
                tracing::error!(workset_id, error = %e, "Provisioner command could not run");
                ProvisionResult::failure(ErrorSignal::new(ErrorKind::Internal, e.to_string()))
            }
        }
    }
}

#[async_trait]
impl ClusterProvisioner for CommandProvisioner {
    async fn submit(&self, request: &ProvisionRequest) -> Result<JobHandle, ErrorSignal> {
        let rendered = self.render(request);
        tracing::info!(
            workset_id = %request.workset_id,
            cluster = %request.cluster_name,
            command = %rendered,
            "Submitting workset"
        );

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&rendered)
            .env("URSA_WORKSET_ID", &request.workset_id)
            .env("URSA_STORAGE_LOCATION", &request.storage_location)
            .env("URSA_CLUSTER", &request.cluster_name)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let job_id = Uuid::new_v4().to_string();
        let task = tokio::spawn(Self::execute(
            command,
            request.workset_id.clone(),
            self.timeout,
        ));
        self.running
            .lock()
            .map_err(|_| ErrorSignal::new(ErrorKind::Internal, "provisioner state poisoned"))?
            .insert(job_id.clone(), task);

        Ok(JobHandle {
            job_id,
            workset_id: request.workset_id.clone(),
        })
    }

    async fn wait(&self, handle: &JobHandle) -> ProvisionResult {
        let task = match self.running.lock() {
            Ok(mut running) => running.remove(&handle.job_id),
            Err(_) => None,
        };
        let Some(task) = task else {
            return ProvisionResult::failure(ErrorSignal::new(
                ErrorKind::Internal,
                format!("unknown job handle {}", handle.job_id),
            ));
        };

        // If this future is dropped mid-wait, abort the runner so kill_on_drop
        // takes the child down with it. Aborting a finished task is a no-op.
        let _guard = AbortOnDrop(task.abort_handle());
        match task.await {
            Ok(result) => result,
            Err(e) => ProvisionResult::failure(ErrorSignal::new(ErrorKind::Cancelled, e.to_string())),
        }
    }
}

/// Wraps `value` in single quotes; embedded quotes become `'\''`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
