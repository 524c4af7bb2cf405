//! Isolated runs through the real engine binary in host mode

use chrono::{TimeZone, Utc};
use detector_engine::{config::EngineConfig, runtime};
use engine_lib::{
    detector::high_cpu_package,
    models::{ExecutionRequest, ResourceIdentifier, ResourceType},
    observability::StructuredLogger,
    orchestrator::{AnalysisRunner, OrchestratorError},
};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const ENGINE_BIN: &str = env!("CARGO_BIN_EXE_detector-engine");

fn vm() -> ResourceIdentifier {
    ResourceIdentifier::resource(ResourceType::VirtualMachine, "sub1", "rg1", "vm1").unwrap()
}

fn write_package(root: &Path) {
    let package = high_cpu_package();
    let dir = root
        .join("packages")
        .join(&package.manifest.id)
        .join(package.manifest.version.to_string());
    std::fs::create_dir_all(&dir).unwrap();

    std::fs::write(
        dir.join("manifest.json"),
        serde_json::to_vec(&package.manifest).unwrap(),
    )
    .unwrap();
    for (module, bytes) in &package.content {
        std::fs::write(dir.join(format!("{}.json", module)), bytes).unwrap();
    }
    std::fs::write(
        root.join("inventory.json"),
        serde_json::to_vec(&vec![vm()]).unwrap(),
    )
    .unwrap();
}

fn write_config(dir: &Path, root: &Path) -> std::path::PathBuf {
    let path = dir.join("engine.toml");
    std::fs::write(
        &path,
        format!(
            "[execution]\nmode = \"isolated\"\nhost_executable = '{}'\nrun_timeout_secs = 60\n\n\
             [storage]\nroot = '{}'\n",
            ENGINE_BIN,
            root.display()
        ),
    )
    .unwrap();
    path
}

fn request(detector_id: &str) -> ExecutionRequest {
    ExecutionRequest {
        resource_ids: vec![vm().to_string()],
        detector_id: detector_id.to_string(),
        cadence: Duration::from_secs(5 * 60),
        data_end_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        alert_rule_resource_id: None,
    }
}

#[tokio::test]
async fn test_host_uses_storage_root_from_config_file() {
    let workspace = TempDir::new().unwrap();
    let root = workspace.path().join("engine-data");
    write_package(&root);
    let config_path = write_config(workspace.path(), &root);

    let config = EngineConfig::load(Some(&config_path)).unwrap();
    let runner = runtime::build_runner(&config, StructuredLogger::new("isolation-test"))
        .await
        .unwrap();

    // The package only exists under the configured root, not under ./data
    let alerts = runner
        .run(request("builtin-high-cpu"), CancellationToken::new())
        .await
        .unwrap();
    assert!(alerts.is_empty());

    let err = runner
        .run(request("missing"), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OrchestratorError::PackageNotFound {
            detector_id: "missing".to_string()
        }
    );
}
