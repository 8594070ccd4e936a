//! Schedule lifecycle against an in-memory store and a manually fired
//! trigger driver.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kinspect_core::config::InspectionConfig;
use kinspect_core::{
    CheckStatus, ClusterRef, RunStatus, Schedule, ScheduleId, ScriptDefinition, TriggerType,
    WebhookReceiver,
};
use kinspect_inspection::{
    AddOutcome, InspectionError, ManualDriver, Orchestrator, ScheduleManager, TriggerDriver,
    TriggerId,
};
use kinspect_notify::{MessagePusher, SendResult};
use kinspect_sandbox::StaticBackend;
use kinspect_store::{InspectionStore, MemoryStore, RunFilter};

// ── Fixture ───────────────────────────────────────────────────

#[derive(Default)]
struct RecordingPusher {
    pushed: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl MessagePusher for RecordingPusher {
    async fn push_message(&self, text: &str, receivers: &[WebhookReceiver]) -> Vec<SendResult> {
        let names: Vec<String> = receivers.iter().map(|r| r.name.clone()).collect();
        self.pushed
            .lock()
            .unwrap()
            .push((text.to_string(), names.clone()));
        names
            .into_iter()
            .map(|receiver| SendResult {
                receiver,
                success: true,
                error: None,
                duration_ms: 0,
            })
            .collect()
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    driver: Arc<ManualDriver>,
    pusher: Arc<RecordingPusher>,
    manager: ScheduleManager,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(StaticBackend::new());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            backend,
            InspectionConfig::default(),
        ));
        let driver = Arc::new(ManualDriver::new());
        let pusher = Arc::new(RecordingPusher::default());
        let manager = ScheduleManager::new(orchestrator, driver.clone(), pusher.clone());
        Self {
            store,
            driver,
            pusher,
            manager,
        }
    }

    async fn script(&self, name: &str, body: &str) -> ScriptDefinition {
        self.store
            .save_script(ScriptDefinition {
                id: 0,
                name: name.into(),
                description: String::new(),
                kind: "Service".into(),
                script_body: body.into(),
                created_by: "ops".into(),
            })
            .await
            .unwrap()
    }

    async fn schedule(&self, cron: &str, clusters: &[&str]) -> Schedule {
        self.store
            .save_schedule(Schedule {
                id: 0,
                name: "svc-check".into(),
                clusters: clusters.iter().map(|c| ClusterRef::from(*c)).collect(),
                cron_expression: cron.into(),
                enabled: true,
                script_ids: vec![],
                receivers: vec![],
                ai_enabled: false,
                ai_prompt: None,
            })
            .await
            .unwrap()
    }

    async fn update(&self, schedule: Schedule) -> Schedule {
        self.store.save_schedule(schedule).await.unwrap()
    }

    async fn runs(&self, schedule_id: ScheduleId) -> usize {
        let filter = RunFilter {
            schedule_id: Some(schedule_id),
            ..Default::default()
        };
        self.store.list_runs(&filter).await.unwrap().len()
    }
}

fn installed(outcome: AddOutcome) -> TriggerId {
    match outcome {
        AddOutcome::Installed { trigger_id, .. } => trigger_id,
        AddOutcome::Disabled => panic!("expected an installed trigger"),
    }
}

// ── Scenarios ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn failed_check_event_is_counted_on_manual_run() {
    let fx = Fixture::new();
    fx.script(
        "svc-endpoints",
        r#"check_event("failed", "no pods", {name = "svc-a", namespace = "default"})"#,
    )
    .await;
    let schedule = fx.schedule("* * * * *", &["demo"]).await;
    installed(fx.manager.add(schedule.id).await.unwrap());

    let run = fx
        .manager
        .run_by_cluster(Some(schedule.id), &ClusterRef::from("demo"), TriggerType::Manual)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.trigger_type, TriggerType::Manual);
    assert_eq!(run.error_count, 1);

    let events = fx.store.list_events(run.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, CheckStatus::Failed);
    assert_eq!(events[0].name.as_deref(), Some("svc-a"));
    assert_eq!(events[0].namespace.as_deref(), Some("default"));
    assert_eq!(events[0].extra["name"], "svc-a");
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_cron_installs_nothing() {
    let fx = Fixture::new();
    let schedule = fx.schedule("not-a-cron", &["demo"]).await;

    let err = fx.manager.add(schedule.id).await.unwrap_err();
    assert!(matches!(err, InspectionError::InvalidCron { .. }));
    assert_eq!(fx.manager.live_trigger_count(), 0);
    assert!(fx.manager.active_controls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_cron_replaces_a_live_trigger() {
    let fx = Fixture::new();
    let mut schedule = fx.schedule("* * * * *", &["demo"]).await;
    installed(fx.manager.add(schedule.id).await.unwrap());

    schedule.cron_expression = "every tuesday".into();
    let schedule = fx.update(schedule).await;
    assert!(fx.manager.add(schedule.id).await.is_err());
    assert_eq!(fx.manager.live_trigger_count(), 0);
    assert!(fx.manager.active_controls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn add_remove_add_issues_fresh_token() {
    let fx = Fixture::new();
    let schedule = fx.schedule("*/5 * * * *", &["demo"]).await;

    let first = fx.manager.add(schedule.id).await.unwrap();
    assert!(fx.manager.remove(schedule.id));
    let second = fx.manager.add(schedule.id).await.unwrap();

    let (AddOutcome::Installed { token: a, .. }, AddOutcome::Installed { token: b, .. }) =
        (first, second)
    else {
        panic!("expected both adds to install");
    };
    assert_ne!(a.to_string(), b.to_string());

    let active = fx.manager.active_controls();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].token, b);
    assert_eq!(fx.manager.live_trigger_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn add_twice_keeps_one_trigger() {
    let fx = Fixture::new();
    let schedule = fx.schedule("* * * * *", &["demo"]).await;

    let first = installed(fx.manager.add(schedule.id).await.unwrap());
    let stale_job = fx.driver.job(first).unwrap();
    let second = installed(fx.manager.add(schedule.id).await.unwrap());

    assert_ne!(first, second);
    assert_eq!(fx.manager.live_trigger_count(), 1);
    assert_eq!(fx.driver.ids(), vec![second]);
    assert_eq!(fx.manager.active_controls().len(), 1);

    // The replaced trigger's job must not run anymore.
    stale_job().await;
    assert_eq!(fx.runs(schedule.id).await, 0);

    assert!(fx.driver.fire(second).await);
    assert_eq!(fx.runs(schedule.id).await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_invalidates_dispatched_firing() {
    let fx = Fixture::new();
    fx.script("noop", "print('hi')").await;
    let schedule = fx.schedule("* * * * *", &["demo"]).await;
    let trigger = installed(fx.manager.add(schedule.id).await.unwrap());

    let in_flight = fx.driver.job(trigger).unwrap();
    assert!(fx.manager.remove(schedule.id));
    in_flight().await;

    assert_eq!(fx.runs(schedule.id).await, 0);
    assert_eq!(fx.manager.live_trigger_count(), 0);
    assert!(fx.manager.active_controls().is_empty());
    assert!(!fx.manager.remove(schedule.id));
}

#[tokio::test(flavor = "multi_thread")]
async fn firing_fans_out_over_clusters() {
    let fx = Fixture::new();
    fx.script("noop", "print('hi')").await;
    let schedule = fx.schedule("* * * * *", &["demo", "edge"]).await;
    let trigger = installed(fx.manager.add(schedule.id).await.unwrap());

    assert!(fx.driver.fire(trigger).await);

    let runs = fx
        .store
        .list_runs(&RunFilter {
            schedule_id: Some(schedule.id),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut clusters: Vec<&str> = runs.iter().map(|r| r.cluster.as_str()).collect();
    clusters.sort();
    assert_eq!(clusters, vec!["demo", "edge"]);
    assert!(runs.iter().all(|r| r.trigger_type == TriggerType::Cron));
    assert!(runs.iter().all(|r| r.status == RunStatus::Success));
}

#[tokio::test(flavor = "multi_thread")]
async fn one_failing_script_does_not_fail_the_run() {
    let fx = Fixture::new();
    fx.script("first", "print('first ok')").await;
    fx.script(
        "second",
        r#"
        check_event("failed", "found before crash", {name = "svc-b"})
        print("about to fail")
        error("boom")
        "#,
    )
    .await;
    fx.script("third", "check_event('ok', 'fine')").await;

    let run = fx
        .manager
        .run_by_cluster(None, &ClusterRef::from("demo"), TriggerType::Manual)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.error_count, 1);

    let results = fx.store.list_results(run.id).await.unwrap();
    assert_eq!(results.len(), 3);
    let failed: Vec<_> = results.iter().filter(|r| r.error_msg.is_some()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].script_name, "second");
    assert!(failed[0].error_msg.as_deref().unwrap().contains("boom"));
    assert_eq!(failed[0].std_output, "about to fail\n");

    let events = fx.store.list_events(run.id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .any(|e| e.script_name == "second" && e.name.as_deref() == Some("svc-b")));
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_schedule_has_no_trigger() {
    let fx = Fixture::new();
    let mut schedule = fx.schedule("* * * * *", &["demo"]).await;
    installed(fx.manager.add(schedule.id).await.unwrap());

    schedule.enabled = false;
    let schedule = fx.update(schedule).await;
    assert_eq!(fx.manager.add(schedule.id).await.unwrap(), AddOutcome::Disabled);
    assert_eq!(fx.manager.live_trigger_count(), 0);
    assert!(fx.manager.active_controls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_schedule_is_reported() {
    let fx = Fixture::new();
    assert!(matches!(
        fx.manager.add(404).await,
        Err(InspectionError::ScheduleNotFound(404))
    ));
    assert!(matches!(
        fx.manager
            .run_by_cluster(Some(404), &ClusterRef::from("demo"), TriggerType::Manual)
            .await,
        Err(InspectionError::ScheduleNotFound(404))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn update_config_reconciles_triggers() {
    let fx = Fixture::new();
    let a = fx.schedule("* * * * *", &["demo"]).await;
    let b = fx.schedule("0 3 * * *", &["demo"]).await;
    let mut c = fx.schedule("* * * * *", &["demo"]).await;
    c.enabled = false;
    let c = fx.update(c).await;
    let bad = fx.schedule("whenever", &["demo"]).await;

    let report = fx.manager.update_config().await.unwrap();
    assert_eq!(report.installed, vec![a.id, b.id]);
    assert!(report.removed.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, bad.id);
    assert_eq!(fx.manager.live_trigger_count(), 2);

    let mut b = b;
    b.enabled = false;
    fx.update(b.clone()).await;
    fx.store.delete_schedule(a.id).await.unwrap();

    let report = fx.manager.update_config().await.unwrap();
    assert!(report.installed.is_empty());
    let mut removed = report.removed.clone();
    removed.sort();
    assert_eq!(removed, vec![a.id, b.id]);
    assert_eq!(fx.manager.live_trigger_count(), 0);
    assert!(fx.manager.active_controls().is_empty());
    assert!(!fx.manager.remove(c.id));
}

#[tokio::test(flavor = "multi_thread")]
async fn run_report_is_pushed_to_receivers() {
    let fx = Fixture::new();
    fx.script(
        "svc-endpoints",
        r#"check_event("失败", "no endpoints", {name = "svc-a", namespace = "default"})"#,
    )
    .await;
    let mut schedule = fx.schedule("* * * * *", &["demo"]).await;
    schedule.receivers = vec![WebhookReceiver {
        name: "ops-channel".into(),
        url: "https://hooks.example.com/ops".into(),
        method: None,
        headers: None,
        body_template: None,
    }];
    let schedule = fx.update(schedule).await;

    fx.manager
        .run_by_cluster(Some(schedule.id), &ClusterRef::from("demo"), TriggerType::Manual)
        .await
        .unwrap();
    fx.manager.flush_deliveries().await;

    let pushed = fx.pusher.pushed.lock().unwrap();
    assert_eq!(pushed.len(), 1);
    let (text, receivers) = &pushed[0];
    assert_eq!(receivers, &vec!["ops-channel".to_string()]);
    assert!(text.contains("svc-check on demo"));
    assert!(text.contains("no endpoints (default/svc-a)"));
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_cancels_everything() {
    let fx = Fixture::new();
    for _ in 0..3 {
        let s = fx.schedule("* * * * *", &["demo"]).await;
        installed(fx.manager.add(s.id).await.unwrap());
    }
    assert_eq!(fx.manager.live_trigger_count(), 3);

    fx.manager.shutdown();
    assert_eq!(fx.manager.live_trigger_count(), 0);
    assert_eq!(fx.driver.live_count(), 0);
    assert!(fx.manager.active_controls().is_empty());
}
