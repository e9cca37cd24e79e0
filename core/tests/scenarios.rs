// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! End-to-end scenarios spanning more than one component, using the
//! scripted operators and in-process backend from `supervisor_core::testutil`
//! instead of a real camera or HTTP socket.

use std::sync::Arc;

use jiff::{SignedDuration, Timestamp};

use base::clock::{Clocks, SimulatedClocks};
use supervisor_core::config::{PipelineConfig, ReporterConfig};
use supervisor_core::model::{
    AnalysisTask, BBox, LonLat, ParkingEvent, Priority, SessionEpoch, TrackId, ZoneType,
};
use supervisor_core::operators::{ClassifyOutput, OcrOutput, OperatorSet, PlateBox};
use supervisor_core::pipeline::Worker;
use supervisor_core::queue::TaskQueue;
use supervisor_core::reporter::Reporter;
use supervisor_core::testutil::{benign_operators, test_frame, FakeBackend, FakeErr, FakeIllegalClassifier, FakeOcr, FakePlateDetector, Script};

fn build_event(stream: &str, track: u32, now: Timestamp, duration_secs: i64) -> ParkingEvent {
    let frame = test_frame(stream, 1, now);
    ParkingEvent {
        stream_id: frame.stream_id.clone(),
        session_epoch: SessionEpoch(0),
        track_id: TrackId(track),
        bbox: BBox { x: 10.0, y: 10.0, w: 40.0, h: 20.0 },
        frame,
        location: LonLat { lon: 127.0, lat: 37.5 },
        location_name: "lot-a".into(),
        parking_start: now - SignedDuration::from_secs(duration_secs),
        duration: SignedDuration::from_secs(duration_secs),
    }
}

fn single_task_queue(task: AnalysisTask) -> Arc<TaskQueue> {
    let queue = Arc::new(TaskQueue::new(10));
    queue.push(task);
    queue.close();
    queue
}

/// Scenario 1: a confirmed violation with a readable plate reaches the
/// reporter channel with every field populated.
#[test]
fn single_violation_happy_path() {
    let clocks = SimulatedClocks::new(Timestamp::UNIX_EPOCH);
    let now = clocks.realtime();
    let event = build_event("cam-1", 1, now, 90);
    let task = AnalysisTask::new(event, Priority::High, now, SignedDuration::from_secs(120));
    let queue = single_task_queue(task);

    let operators = OperatorSet {
        vehicle_detector: benign_operators().vehicle_detector,
        illegal_classifier: Box::new(FakeIllegalClassifier(Script::new(
            vec![Ok(ClassifyOutput {
                is_illegal: true,
                severity: 0.9,
                zone_type: ZoneType::NoParking,
            })],
            Ok(ClassifyOutput { is_illegal: false, severity: 0.0, zone_type: ZoneType::Other }),
        ))),
        plate_detector: Box::new(FakePlateDetector(Script::new(
            vec![Ok(vec![PlateBox { bbox: BBox { x: 15.0, y: 25.0, w: 12.0, h: 6.0 }, confidence: 0.95 }])],
            Ok(vec![]),
        ))),
        ocr: Box::new(FakeOcr(Script::new(
            vec![Ok(OcrOutput { text: "12가3456".to_owned(), confidence: 0.92, valid_format: true })],
            Ok(OcrOutput { text: String::new(), confidence: 0.0, valid_format: false }),
        ))),
    };

    let (report_tx, mut report_rx) = tokio::sync::mpsc::channel(8);
    let (_shutdown_tx, shutdown_rx) = base::shutdown::channel();

    let worker = Worker {
        id: 0,
        queue,
        operators,
        report_tx,
        cfg: PipelineConfig::default(),
        clocks,
        shutdown_rx,
    };
    worker.run();

    let report = report_rx.try_recv().expect("a violation report should have been produced");
    assert_eq!(report.data.vehicle.track_id, 1);
    assert_eq!(
        report.data.license_plate.as_ref().unwrap().plate_text,
        "12가3456"
    );
    assert!(report.data.license_plate.as_ref().unwrap().is_valid_format);
}

/// Scenario: a low-severity classification is rejected before any backend
/// call would ever be made, and never reaches the reporter channel.
#[test]
fn low_severity_classification_is_rejected() {
    let clocks = SimulatedClocks::new(Timestamp::UNIX_EPOCH);
    let now = clocks.realtime();
    let event = build_event("cam-1", 2, now, 90);
    let task = AnalysisTask::new(event, Priority::Normal, now, SignedDuration::from_secs(120));
    let queue = single_task_queue(task);

    let mut operators = benign_operators();
    operators.illegal_classifier = Box::new(FakeIllegalClassifier(Script::new(
        vec![Ok(ClassifyOutput { is_illegal: true, severity: 0.2, zone_type: ZoneType::NoParking })],
        Ok(ClassifyOutput { is_illegal: false, severity: 0.0, zone_type: ZoneType::Other }),
    )));

    let (report_tx, mut report_rx) = tokio::sync::mpsc::channel(8);
    let (_shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let worker = Worker {
        id: 0,
        queue,
        operators,
        report_tx,
        cfg: PipelineConfig::default(),
        clocks,
        shutdown_rx,
    };
    worker.run();

    assert!(report_rx.try_recv().is_err(), "a rejected task must not reach the reporter");
}

/// Scenario: a transient model failure causes the task to be re-enqueued
/// rather than dropped, and it succeeds once popped again.
#[test]
fn transient_model_failure_retries_then_succeeds() {
    let clocks = SimulatedClocks::new(Timestamp::UNIX_EPOCH);
    let now = clocks.realtime();
    let event = build_event("cam-1", 3, now, 90);
    let task = AnalysisTask::new(event, Priority::Urgent, now, SignedDuration::from_secs(120));
    let queue = Arc::new(TaskQueue::new(10));
    queue.push(task);

    let mut operators = benign_operators();
    operators.illegal_classifier = Box::new(FakeIllegalClassifier(Script::new(
        vec![
            Err(FakeErr::Transient),
            Ok(ClassifyOutput { is_illegal: true, severity: 0.8, zone_type: ZoneType::FireLane }),
        ],
        Ok(ClassifyOutput { is_illegal: false, severity: 0.0, zone_type: ZoneType::Other }),
    )));

    let (report_tx, mut report_rx) = tokio::sync::mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();

    // Run the worker on its own thread since this time the queue isn't
    // pre-closed: the first pop fails and re-enqueues, the second pop (of
    // the same retried task) must succeed, after which we close the queue
    // to let the worker exit.
    let queue_for_worker = queue.clone();
    let worker = Worker {
        id: 0,
        queue: queue_for_worker,
        operators,
        report_tx,
        cfg: PipelineConfig::default(),
        clocks,
        shutdown_rx,
    };
    let handle = std::thread::spawn(move || worker.run());

    let report = loop {
        if let Ok(r) = report_rx.try_recv() {
            break r;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    };
    assert_eq!(report.data.violation.parking_zone_type, ZoneType::FireLane);

    queue.close();
    drop(shutdown_tx);
    handle.join().unwrap();
}

/// Scenario: under load, eviction makes sure a long-dwelling vehicle's
/// `Urgent` task always displaces older `Normal` tasks rather than waiting
/// behind them.
#[test]
fn priority_escalation_survives_queue_pressure() {
    let t_violation = SignedDuration::from_secs(60);
    let queue = TaskQueue::new(4);
    let now = Timestamp::UNIX_EPOCH;
    for i in 0..4 {
        let event = build_event("cam-1", i as u32, now, 65);
        let priority = Priority::from_duration(SignedDuration::from_secs(65), t_violation);
        let task = AnalysisTask::new(event, priority, now + SignedDuration::from_secs(i), SignedDuration::from_secs(300));
        assert_eq!(queue.push(task), supervisor_core::queue::PushResult::Accepted);
    }
    let long_dwell_event = build_event("cam-1", 99, now, 400);
    let urgent_priority = Priority::from_duration(SignedDuration::from_secs(400), t_violation);
    assert_eq!(urgent_priority, Priority::Urgent);
    let urgent_task = AnalysisTask::new(
        long_dwell_event,
        urgent_priority,
        now + SignedDuration::from_secs(10),
        SignedDuration::from_secs(300),
    );
    assert_eq!(queue.push(urgent_task), supervisor_core::queue::PushResult::Accepted);
    assert_eq!(queue.dropped_low(), 1);

    let far = now + SignedDuration::from_secs(1000);
    let supervisor_core::queue::PopResult::Task(first) = queue.pop(far, &|| now) else {
        panic!("expected a task")
    };
    assert_eq!(first.priority, Priority::Urgent);
}

/// Scenario: on shutdown, whatever the reporter couldn't deliver in time
/// is left spooled to disk rather than silently dropped.
#[tokio::test]
async fn shutdown_drains_reporter_backlog_to_spool() {
    let dir = tempfile::tempdir().unwrap();
    let spool_path = dir.path().join("spool.ndjson");
    let dead_letter_path = dir.path().join("dead-letter.ndjson");

    // Real wall-clock time here: the drain window is bounded by actual
    // elapsed time, which a frozen `SimulatedClocks` would never reach.
    let clocks = base::clock::RealClocks {};
    // Every delivery attempt fails, so the record must still be on disk
    // once the drain window expires.
    let backend = FakeBackend::new(vec![Err(FakeErr::Transient); 16]);

    let mut cfg = ReporterConfig::default();
    cfg.spool_path = spool_path.to_string_lossy().into_owned();
    cfg.dead_letter_path = dead_letter_path.to_string_lossy().into_owned();
    cfg.base_backoff_secs = 0.01;
    cfg.max_backoff_secs = 0.01;
    cfg.jitter = 0.0;
    cfg.max_attempts = 1000;

    let reporter = Reporter::new(backend, cfg, clocks.clone());
    let (report_tx, report_rx) = tokio::sync::mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();

    let event = build_event("cam-1", 7, clocks.realtime(), 90);
    let report = supervisor_core::model::ViolationReport {
        event_id: event.event_id(),
        event_type: "violation_detected".into(),
        priority: Priority::Urgent,
        timestamp: 0.0,
        timestamp_iso: "1970-01-01T00:00:00Z".into(),
        stream_id: event.stream_id.as_str().to_owned(),
        correlation_id: event.correlation_id(),
        data: supervisor_core::model::ViolationReportData {
            violation: supervisor_core::model::ViolationInfo {
                start_time: 0.0,
                duration: 90.0,
                violation_severity: 0.9,
                is_confirmed: true,
                vehicle_type: "vehicle".into(),
                parking_zone_type: ZoneType::NoParking,
            },
            vehicle: supervisor_core::model::VehicleInfo {
                track_id: 7,
                vehicle_type: "vehicle".into(),
                confidence: 1.0,
                bounding_box: event.bbox.as_array(),
                last_position: event.location,
            },
            license_plate: None,
            ocr_result: None,
            stream_info: supervisor_core::model::StreamInfo {
                stream_id: event.stream_id.as_str().to_owned(),
                location_name: event.location_name.clone(),
            },
            vehicle_image: event.frame.base64_data_uri(),
        },
    };

    report_tx.send(report).await.unwrap();

    let run_handle = tokio::spawn(reporter.run(report_rx, shutdown_rx, std::time::Duration::from_millis(300)));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    drop(shutdown_tx);
    run_handle.await.unwrap();

    let spooled = std::fs::read_to_string(&spool_path).unwrap();
    assert!(spooled.contains("cam-1"), "the undelivered report must be left on disk for the next process");
}
