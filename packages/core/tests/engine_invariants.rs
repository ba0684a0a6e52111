//! Engine-level invariants that hold without a live Docker daemon.

use dockerpilot_core::health::{HealthProbe, HealthResolver};
use dockerpilot_core::progress::{ProgressRegistry, Stage};
use dockerpilot_core::{ConfigLayout, DockerPilot, ErrorKind, MigrateRequest};

#[tokio::test]
async fn operation_keys_are_exclusive() {
    let registry = ProgressRegistry::new();
    let lease = registry.begin("myapp", "promoting").unwrap();

    let second = registry.begin("myapp", "again");
    assert_eq!(second.unwrap_err().kind(), ErrorKind::AlreadyRunning);

    // Other keys are unaffected.
    let other = registry.begin("other-app", "promoting").unwrap();
    other.complete("done");
    lease.complete("done");
}

#[tokio::test]
async fn progress_never_decreases_within_an_operation() {
    let registry = ProgressRegistry::new();
    let lease = registry.begin("myapp", "starting").unwrap();

    let stages = [
        (Stage::Starting, 0),
        (Stage::Building, 20),
        (Stage::Stopping, 50),
        (Stage::Creating, 70),
        (Stage::CleaningUp, 85),
        (Stage::Validating, 95),
    ];
    let mut last = 0;
    for (stage, pct) in stages {
        lease.update(stage, pct, "step");
        let current = registry.get("myapp").unwrap().progress;
        assert!(current >= last, "progress went backwards at {stage}");
        last = current;
    }
    lease.complete("done");
    assert_eq!(registry.get("myapp").unwrap().progress, 100);
}

#[tokio::test]
async fn cancel_is_a_one_shot_latch() {
    let registry = ProgressRegistry::new();
    let lease = registry.begin("myapp", "starting").unwrap();

    assert!(registry.cancel("myapp"));
    // A second cancel is accepted and changes nothing.
    assert!(registry.cancel("myapp"));
    assert!(lease.cancel_requested());

    lease.cancelled("cancelled at checkpoint");
    let record = registry.get("myapp").unwrap();
    assert_eq!(record.stage, Stage::Cancelled);
    assert!(record.cancel_requested);
}

#[tokio::test]
async fn migration_rejects_same_host_before_any_record() {
    let tmp = tempfile::tempdir().unwrap();
    let pilot = DockerPilot::new(ConfigLayout::rooted_at(tmp.path())).unwrap();

    let err = pilot
        .migrate(MigrateRequest {
            container_name: "nginx".to_string(),
            source_id: "local".to_string(),
            target_id: "local".to_string(),
            include_data: false,
            stop_source: false,
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SameHost);
    assert!(pilot.migration_progress(None).is_empty());
    assert!(pilot.migration_progress(Some("nginx")).is_empty());
}

#[test]
fn resolver_fallback_and_non_http_contract() {
    let resolver = HealthResolver::built_in();

    // Unknown image: generic endpoint.
    assert_eq!(
        resolver.resolve("my-random-app:1.0"),
        HealthProbe::Http("/health".to_string())
    );

    // ssh-family image: readiness via container state, no HTTP probe.
    assert_eq!(resolver.resolve("ssh-jump:2.3"), HealthProbe::ContainerState);
}

#[test]
fn resolver_is_most_specific_wins() {
    let mut resolver = HealthResolver::built_in();
    resolver.set_override("grafana", Some("/short".to_string()));
    resolver.set_override("grafana-oss", Some("/long".to_string()));

    assert_eq!(
        resolver.resolve("grafana-oss:9"),
        HealthProbe::Http("/long".to_string())
    );
    assert_eq!(
        resolver.resolve("grafana-enterprise:9"),
        HealthProbe::Http("/short".to_string())
    );
}

#[tokio::test]
async fn deployment_history_is_append_only_and_limited() {
    use dockerpilot_core::deploy::history::{
        DeploymentHistory, DeploymentHistoryEntry, HistoryStatus,
    };
    let tmp = tempfile::tempdir().unwrap();
    let history = DeploymentHistory::new(tmp.path().join("deployment_history.json"));

    for i in 0..10 {
        history
            .append(&DeploymentHistoryEntry::new(
                "rolling",
                "app:1",
                &format!("app-{i}"),
                if i % 2 == 0 {
                    HistoryStatus::Success
                } else {
                    HistoryStatus::Failed
                },
                100 + i,
                None,
            ))
            .unwrap();
    }

    let last_three = history.recent(3).unwrap();
    assert_eq!(last_three.len(), 3);
    assert_eq!(last_three[0].container_name, "app-9");
    assert_eq!(last_three[2].container_name, "app-7");
}
