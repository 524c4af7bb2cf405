//! Isolation boundary tests
//!
//! Process tests use `sh` scripts as stand-in hosts.

use super::*;
use chrono::Utc;
use std::time::Instant;

fn request() -> ExecutionRequest {
    ExecutionRequest {
        resource_ids: vec!["/subscriptions/s".to_string()],
        detector_id: "cpu".to_string(),
        cadence: Duration::from_secs(300),
        data_end_time: Utc::now(),
        alert_rule_resource_id: None,
    }
}

#[cfg(unix)]
fn script_runner(script: &str) -> IsolatedRunner {
    IsolatedRunner::new(IsolationConfig {
        host_executable: PathBuf::from("sh"),
        host_args: vec!["-c".to_string(), script.to_string()],
        run_timeout: Duration::from_secs(10),
    })
}

#[cfg(unix)]
#[tokio::test]
async fn test_ok_envelope() {
    let runner = script_runner(r#"cat > /dev/null; printf '%s' '{"status":"ok","alerts":[]}'"#);
    let alerts = runner.run(request(), CancellationToken::new()).await.unwrap();
    assert!(alerts.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_fault_envelope_preserves_variant() {
    let runner = script_runner(
        r#"cat > /dev/null
printf '%s' '{"status":"fault","fault":{"message":"boom","status":500,"error":{"kind":"module_fault","type_name":"acme::Boom","message":"boom"}}}'
exit 1"#,
    );
    let err = runner
        .run(request(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OrchestratorError::ModuleFault {
            type_name: "acme::Boom".to_string(),
            message: "boom".to_string(),
        }
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_crash_without_result_is_child_process_error() {
    let runner = script_runner("cat > /dev/null; echo 'stack overflow in module' >&2; exit 134");
    let err = runner
        .run(request(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OrchestratorError::Isolation(IsolationError::ChildProcess {
            exit_code: Some(134),
            stderr: "stack overflow in module".to_string(),
        })
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_unparseable_result_is_protocol_error() {
    let runner = script_runner("cat > /dev/null; echo 'not json'");
    let err = runner
        .run(request(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Isolation(IsolationError::Protocol { .. })
    ));
}

#[tokio::test]
async fn test_missing_host_is_setup_error() {
    let runner = IsolatedRunner::new(IsolationConfig {
        host_executable: PathBuf::from("/nonexistent/detector-engine-host"),
        host_args: Vec::new(),
        run_timeout: Duration::from_secs(10),
    });
    let err = runner
        .run(request(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Isolation(IsolationError::Setup { .. })
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_cancellation_kills_host() {
    let runner = script_runner("sleep 30");
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let start = Instant::now();
    let err = runner.run(request(), token).await.unwrap_err();
    assert!(err.is_canceled());
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_timeout() {
    let mut runner = script_runner("sleep 30");
    runner.config.run_timeout = Duration::from_millis(200);

    let err = runner
        .run(request(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OrchestratorError::Isolation(IsolationError::TimedOut { after_secs: 0 })
    );
}

struct CannedRunner(Result<Vec<CanonicalAlert>, OrchestratorError>);

#[async_trait]
impl AnalysisRunner for CannedRunner {
    async fn run(
        &self,
        request: ExecutionRequest,
        _token: CancellationToken,
    ) -> Result<Vec<CanonicalAlert>, OrchestratorError> {
        assert_eq!(request.detector_id, "cpu");
        self.0.clone()
    }
}

#[tokio::test]
async fn test_run_host_writes_ok_envelope() {
    let input = serde_json::to_vec(&request()).unwrap();
    let mut output = Vec::new();

    let succeeded = run_host(
        &CannedRunner(Ok(Vec::new())),
        input.as_slice(),
        &mut output,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(succeeded);
    let response: HostResponse = serde_json::from_slice(&output).unwrap();
    assert_eq!(response, HostResponse::Ok { alerts: Vec::new() });
}

#[tokio::test]
async fn test_run_host_reports_faults() {
    let input = serde_json::to_vec(&request()).unwrap();
    let mut output = Vec::new();

    let succeeded = run_host(
        &CannedRunner(Err(OrchestratorError::Canceled)),
        input.as_slice(),
        &mut output,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(!succeeded);
    let response: HostResponse = serde_json::from_slice(&output).unwrap();
    assert_eq!(response.into_result().unwrap_err(), OrchestratorError::Canceled);
}

#[tokio::test]
async fn test_run_host_rejects_malformed_request() {
    let mut output = Vec::new();
    run_host(
        &CannedRunner(Ok(Vec::new())),
        &b"{\"detectorId\": 7}"[..],
        &mut output,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let response: HostResponse = serde_json::from_slice(&output).unwrap();
    assert!(matches!(
        response.into_result(),
        Err(OrchestratorError::InvalidRequest { .. })
    ));
}
