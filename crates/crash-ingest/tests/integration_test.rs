// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::Utc;
use crash_ingest::context::CrashContext;
use crash_ingest::dedup::DedupIndex;
use crash_ingest::intake::IntakeClient;
use crash_ingest::processor::{ProcessorPool, ProcessorSettings};
use crash_ingest::queue::{LandingZoneQueue, QueueSettings, ReportQueue};
use crash_ingest::watcher::Watcher;
use crash_telemetry::{Alerter, CounterRegistry, LogSink};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn make_report(zone: &Path, id: &str) {
    let dir = zone.join(id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("session.log"), "log tail\n").unwrap();
    fs::write(dir.join("crash.dmp"), b"MDMP").unwrap();
    let context = CrashContext {
        report_dir: dir,
        report_id: id.to_string(),
        engine_version: "5.3.2".to_string(),
        platform: "Linux".to_string(),
        branch_name: "release".to_string(),
        changelist: "1000".to_string(),
        call_stack: vec![
            "app!Renderer::Submit()".to_string(),
            "app!Engine::Tick()".to_string(),
            "app!GuardedMain()".to_string(),
        ],
        error_message: "Segmentation fault".to_string(),
        allow_contact: true,
        crash_time: Utc::now(),
        ..CrashContext::default()
    };
    context.save().unwrap();
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

#[tokio::test]
async fn reports_flow_from_landing_zone_to_archive() {
    let tmp = TempDir::new().unwrap();
    let zone = tmp.path().join("landing");
    fs::create_dir(&zone).unwrap();
    for i in 0..3 {
        make_report(&zone, &format!("CR-{i:04}"));
    }

    let mut server = mockito::Server::new_async().await;
    let next_id = Arc::new(AtomicI64::new(10));
    let next_id_clone = next_id.clone();
    let _intake = server
        .mock("POST", "/reports")
        .with_status(200)
        .with_body_from_request(move |_| {
            let id = next_id_clone.fetch_add(1, Ordering::SeqCst) + 1;
            format!("{{\"id\":{id}}}").into_bytes()
        })
        .create_async()
        .await;

    let telemetry = Arc::new(CounterRegistry::new());
    let alerter = Arc::new(Alerter::new(Arc::new(LogSink), Duration::from_secs(3600)));
    let dedup = Arc::new(DedupIndex::new(tmp.path().join("reports.index"), 14));

    let queue: Arc<dyn ReportQueue> = Arc::new(LandingZoneQueue::new(
        "landing",
        &zone,
        QueueSettings::default(),
        dedup.clone(),
        telemetry.clone(),
    ));
    let watcher = Watcher::new(vec![queue], &dedup, telemetry.clone());
    let queues = watcher.queues();
    assert_eq!(queues[0].check_for_new_reports().await, 3);

    let archive = tmp.path().join("archive");
    let intake = Arc::new(
        IntakeClient::new(
            &format!("{}/reports", server.url()),
            Duration::from_secs(2),
            1,
            Duration::from_millis(10),
        )
        .unwrap(),
    );
    let pool = Arc::new(ProcessorPool::new(
        queues.clone(),
        ProcessorSettings {
            worker_count: 2,
            add_report_slots: 2,
            min_callstack_depth: 3,
            failure_alert_threshold: 10,
            invalid_reports_dir: tmp.path().join("invalid"),
            archive_dir: Some(archive.clone()),
            archive_bucket: None,
        },
        None,
        intake,
        None,
        telemetry.clone(),
        alerter,
    ));

    let cancel = CancellationToken::new();
    let handles = Arc::clone(&pool).start(&cancel);

    let drained = wait_until(Duration::from_secs(10), || {
        (0..3).all(|i| !zone.join(format!("CR-{i:04}")).exists())
    })
    .await;
    assert!(drained, "reports were not processed in time");

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
    pool.drain().await;

    // Each accepted report landed in a per-record-id archive directory.
    let archived: Vec<_> = fs::read_dir(&archive).unwrap().flatten().collect();
    assert_eq!(archived.len(), 3);
    for entry in archived {
        assert!(entry.path().join("session.log").is_file());
        assert!(entry.path().join("crash.dmp").is_file());
    }

    // The index remembers every processed report.
    for i in 0..3 {
        assert!(dedup.contains(&format!("CR-{i:04}")));
    }
    assert_eq!(
        telemetry.counter(crash_ingest::processor::COUNTER_PROCESSED),
        3
    );
}

#[tokio::test]
async fn buffered_reports_survive_restart_via_index_return() {
    let tmp = TempDir::new().unwrap();
    let zone = tmp.path().join("landing");
    fs::create_dir(&zone).unwrap();
    make_report(&zone, "CR-0001");
    make_report(&zone, "CR-0002");

    let telemetry = Arc::new(CounterRegistry::new());
    let index_path = tmp.path().join("reports.index");

    // First process lifetime: reports admitted but never dequeued.
    {
        let dedup = Arc::new(DedupIndex::new(&index_path, 14));
        dedup.load();
        let queue = LandingZoneQueue::new(
            "landing",
            &zone,
            QueueSettings::default(),
            dedup.clone(),
            telemetry.clone(),
        );
        queue.check_for_new_reports().await;
        assert_eq!(dedup.len(), 2);

        queue.shutdown().await;
        dedup.persist();
    }

    // Second lifetime: the keys were returned, so both reports re-admit.
    {
        let dedup = Arc::new(DedupIndex::new(&index_path, 14));
        dedup.load();
        assert!(dedup.is_empty());

        let queue = LandingZoneQueue::new(
            "landing",
            &zone,
            QueueSettings::default(),
            dedup.clone(),
            telemetry.clone(),
        );
        queue.check_for_new_reports().await;
        assert_eq!(queue.memory_len(), 2);
        assert!(dedup.contains("CR-0001"));
        assert!(dedup.contains("CR-0002"));
    }
}

#[tokio::test]
async fn failed_uploads_preserve_reports_for_inspection() {
    let tmp = TempDir::new().unwrap();
    let zone = tmp.path().join("landing");
    fs::create_dir(&zone).unwrap();
    make_report(&zone, "CR-0001");

    let mut server = mockito::Server::new_async().await;
    let intake_mock = server
        .mock("POST", "/reports")
        .with_status(200)
        .with_body(r#"{"id":0,"error":"database offline"}"#)
        .expect(2) // first attempt + one retry
        .create_async()
        .await;

    let telemetry = Arc::new(CounterRegistry::new());
    let alerter = Arc::new(Alerter::new(Arc::new(LogSink), Duration::from_secs(3600)));
    let dedup = Arc::new(DedupIndex::new(tmp.path().join("reports.index"), 14));

    let queue: Arc<dyn ReportQueue> = Arc::new(LandingZoneQueue::new(
        "landing",
        &zone,
        QueueSettings::default(),
        dedup.clone(),
        telemetry.clone(),
    ));
    queue.check_for_new_reports().await;

    let intake = Arc::new(
        IntakeClient::new(
            &format!("{}/reports", server.url()),
            Duration::from_secs(2),
            1,
            Duration::from_millis(10),
        )
        .unwrap(),
    );
    let invalid = tmp.path().join("invalid");
    let pool = Arc::new(ProcessorPool::new(
        vec![queue.clone()],
        ProcessorSettings {
            worker_count: 1,
            add_report_slots: 1,
            min_callstack_depth: 3,
            failure_alert_threshold: 100,
            invalid_reports_dir: invalid.clone(),
            archive_dir: None,
            archive_bucket: None,
        },
        None,
        intake,
        None,
        telemetry.clone(),
        alerter,
    ));

    let context = pool.next_report().await.unwrap();
    Arc::clone(&pool).process_report(context).await;
    pool.drain().await;

    intake_mock.assert_async().await;
    let relocated = invalid.join("CR-0001");
    assert!(relocated.is_dir());
    assert!(relocated
        .join(crash_ingest::processor::FAILED_PAYLOAD_FILE)
        .is_file());
    assert!(relocated.join("crash.dmp").is_file());
    assert!(!zone.join("CR-0001").exists());
}
