use std::time::Duration;

use ursa_lite::retry::{ErrorCategory, ErrorKind, RetryClassifier};
use ursa_lite::scheduler::WorksetRequirements;
use ursa_lite::worker::{
    ClusterProvisioner, CommandProvisioner, JobHandle, ProvisionRequest, ProvisionResult,
};

fn request(workset_id: &str) -> ProvisionRequest {
    ProvisionRequest {
        workset_id: workset_id.to_string(),
        storage_location: format!("s3://ursa-test/{workset_id}"),
        cluster_name: "c9".to_string(),
        requirements: WorksetRequirements::default(),
    }
}

async fn run(provisioner: &CommandProvisioner, workset_id: &str) -> ProvisionResult {
    let handle = provisioner.submit(&request(workset_id)).await.unwrap();
    assert_eq!(handle.workset_id, workset_id);
    provisioner.wait(&handle).await
}

#[tokio::test]
async fn test_command_success() {
    let provisioner = CommandProvisioner::new("true");
    assert_eq!(run(&provisioner, "ws-1").await, ProvisionResult::Success);
}

#[tokio::test]
async fn test_command_sees_workset_environment() {
    let provisioner = CommandProvisioner::new(
        "test \"$URSA_WORKSET_ID\" = ws-env && test \"$URSA_CLUSTER\" = c9 \
         && test \"$URSA_STORAGE_LOCATION\" = s3://ursa-test/ws-env \
         && test {workset_id} = ws-env",
    );
    assert_eq!(run(&provisioner, "ws-env").await, ProvisionResult::Success);
}

#[tokio::test]
async fn test_metacharacters_in_workset_id_stay_literal() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("injected");
    let workset_id = format!("x'; touch {}; echo '$(id) `id` && |", marker.display());

    let provisioner = CommandProvisioner::new(
        "test {workset_id} = \"$URSA_WORKSET_ID\" && test {cluster} = c9",
    );
    assert_eq!(run(&provisioner, &workset_id).await, ProvisionResult::Success);
    assert!(!marker.exists(), "workset id must not run as shell code");
}

#[tokio::test]
async fn test_command_failure_carries_stderr() {
    let provisioner = CommandProvisioner::new("echo 'bwa: Out of memory' >&2; exit 1");
    let result = run(&provisioner, "ws-1").await;

    let ProvisionResult::Failure { error, failed_step } = result else {
        panic!("expected failure");
    };
    assert_eq!(error.kind, ErrorKind::Unknown);
    assert_eq!(error.detail, "bwa: Out of memory");
    assert!(failed_step.is_none());

    let classification = RetryClassifier::new().classify(&error);
    assert_eq!(classification.category, ErrorCategory::Resource);
    assert!(classification.retryable);
}

#[tokio::test]
async fn test_command_failure_without_stderr_reports_exit_code() {
    let provisioner = CommandProvisioner::new("exit 3");
    let ProvisionResult::Failure { error, .. } = run(&provisioner, "ws-1").await else {
        panic!("expected failure");
    };
    assert!(error.detail.contains('3'));
    assert_eq!(
        RetryClassifier::new().classify(&error).category,
        ErrorCategory::Permanent
    );
}

#[tokio::test]
async fn test_command_timeout_is_transient() {
    let provisioner =
        CommandProvisioner::new("sleep 5").with_timeout(Duration::from_millis(100));
    let started = std::time::Instant::now();
    let ProvisionResult::Failure { error, .. } = run(&provisioner, "ws-1").await else {
        panic!("expected failure");
    };
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert!(RetryClassifier::new().classify(&error).retryable);
}

#[tokio::test]
async fn test_wait_on_unknown_handle_fails() {
    let provisioner = CommandProvisioner::new("true");
    let result = provisioner
        .wait(&JobHandle {
            job_id: "nope".into(),
            workset_id: "ws-1".into(),
        })
        .await;
    assert!(matches!(
        result,
        ProvisionResult::Failure { error, .. } if error.kind == ErrorKind::Internal
    ));
}
