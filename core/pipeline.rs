// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Analysis Pipeline (C4, §4.4). A pool of single-threaded workers, each
//! cooperatively owning its own model handles, running tasks popped from C3
//! through four stages and handing surviving reports to C5.

use std::sync::Arc;

use jiff::SignedDuration;
use tracing::{error, info, warn};

use base::clock::Clocks;
use base::ErrorKind;

use crate::config::PipelineConfig;
use crate::model::{
    AnalysisTask, LicensePlateInfo, OcrResultInfo, StreamInfo, VehicleInfo, ViolationInfo,
    ViolationReport, ViolationReportData,
};
use crate::operators::OperatorSet;
use crate::queue::{PopResult, PushResult, TaskQueue};

/// Outcome of running one task through the pipeline.
pub enum TaskResult {
    Accepted(Box<ViolationReport>),
    Rejected(&'static str),
    Retry(AnalysisTask),
    PermanentFailure(&'static str),
}

/// Plate regex from the glossary: optional two-Hangul-syllable region
/// prefix, 2-3 digits, one Hangul syllable, four digits.
pub fn plate_format_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^(?:\p{Hangul}{2})?\d{2,3}\p{Hangul}\d{4}$")
            .expect("plate regex is a compile-time constant")
    })
}

/// One worker's loop body, run on its own dedicated OS thread (§5). A panic
/// in any stage must not take down other workers or the process, and the
/// worker must keep serving later tasks rather than exiting (§4.4
/// Isolation): `run`'s loop catches a panic around each task individually
/// and keeps going. [`spawn_workers`] adds an outer `catch_unwind` as a
/// last-resort net for anything that panics outside task handling.
pub struct Worker<C: Clocks> {
    pub id: usize,
    pub queue: Arc<TaskQueue>,
    pub operators: OperatorSet,
    pub report_tx: tokio::sync::mpsc::Sender<ViolationReport>,
    pub cfg: PipelineConfig,
    pub clocks: C,
    pub shutdown_rx: base::shutdown::Receiver,
}

impl<C: Clocks> Worker<C> {
    pub fn run(mut self) {
        info!(worker_id = self.id, "worker starting");
        loop {
            if self.shutdown_rx.check().is_err() && self.queue.is_closed() {
                break;
            }
            let now = self.clocks.realtime();
            let deadline = now + SignedDuration::from_secs(1);
            let clocks = &self.clocks;
            match self.queue.pop(deadline, &|| clocks.realtime()) {
                PopResult::Task(task) => {
                    let worker_id = self.id;
                    let outcome =
                        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.handle_task(task)));
                    if outcome.is_err() {
                        error!(worker_id, "task panicked; releasing it and resuming the stage loop");
                    }
                }
                PopResult::Timeout => continue,
                PopResult::Closed => break,
            }
        }
        info!(worker_id = self.id, "worker stopped");
    }

    fn handle_task(&mut self, task: AnalysisTask) {
        let task_id = task.task_id;
        match self.process(&task) {
            TaskResult::Accepted(report) => {
                // Worker threads are plain OS threads, not tokio tasks, so
                // sending to the reporter's tokio channel must block rather
                // than await.
                if self.report_tx.blocking_send(*report).is_err() {
                    warn!(worker_id = self.id, "reporter channel closed, dropping report");
                }
            }
            TaskResult::Rejected(reason) => {
                info!(worker_id = self.id, %task_id, reason, "task rejected");
            }
            TaskResult::Retry(mut retried) => {
                retried.retry_count += 1;
                if retried.retry_count > self.cfg.max_retries {
                    error!(worker_id = self.id, %task_id, "permanent failure: exceeded max retries");
                    return;
                }
                match self.queue.push(retried) {
                    PushResult::Accepted => {}
                    PushResult::DroppedLow => {
                        warn!(worker_id = self.id, %task_id, "retry dropped: queue full of higher-priority work")
                    }
                    PushResult::Blocked => {
                        warn!(worker_id = self.id, %task_id, "retry dropped: queue closed or contended")
                    }
                }
            }
            TaskResult::PermanentFailure(reason) => {
                error!(worker_id = self.id, %task_id, reason, "permanent failure");
            }
        }
    }

    fn process(&mut self, task: &AnalysisTask) -> TaskResult {
        let frame = &task.parking_event.frame;

        let stage_a_deadline = self.clocks.realtime()
            + SignedDuration::from_millis(self.cfg.stage_a_deadline_ms as i64);
        let classify = match self.operators.illegal_classifier.classify(
            &frame.jpeg_bytes,
            stage_a_deadline,
            self.clocks.realtime(),
        ) {
            Ok(out) => out,
            Err(e) if e.kind() == ErrorKind::Transient => return TaskResult::Retry(task.clone()),
            Err(e) => {
                error!(task_id = %task.task_id, %e, "stage A failed permanently");
                return TaskResult::PermanentFailure("stage_a_failed");
            }
        };

        if !classify.is_illegal || classify.severity < self.cfg.severity_gate {
            return TaskResult::Rejected("legal_or_low_severity");
        }

        let stage_b_deadline = self.clocks.realtime()
            + SignedDuration::from_millis(self.cfg.stage_b_deadline_ms as i64);
        let plates = match self.operators.plate_detector.detect_plates(
            &frame.jpeg_bytes,
            stage_b_deadline,
            self.clocks.realtime(),
        ) {
            Ok(p) => p,
            Err(e) if e.kind() == ErrorKind::Transient => return TaskResult::Retry(task.clone()),
            // Stage B is advisory for the final report: no plate found is a
            // valid outcome, not a reason to drop the violation.
            Err(_) => Vec::new(),
        };

        let best_plate = plates
            .iter()
            .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap());

        let (license_plate, ocr_result) = match best_plate {
            None => (None, None),
            Some(plate) => {
                let stage_c_deadline = self.clocks.realtime()
                    + SignedDuration::from_millis(self.cfg.stage_c_deadline_ms as i64);
                match self
                    .operators
                    .ocr
                    .read(&frame.jpeg_bytes, stage_c_deadline, self.clocks.realtime())
                {
                    Ok(ocr) => {
                        let valid = ocr.valid_format && plate_format_regex().is_match(&ocr.text);
                        let plate_info = LicensePlateInfo {
                            plate_text: ocr.text.clone(),
                            confidence: plate.confidence,
                            bounding_box: plate.bbox.as_array(),
                            is_valid_format: valid,
                        };
                        let ocr_info = OcrResultInfo {
                            recognized_text: ocr.text,
                            confidence: ocr.confidence,
                            is_valid_format: valid,
                        };
                        (Some(plate_info), Some(ocr_info))
                    }
                    Err(e) if e.kind() == ErrorKind::Transient => return TaskResult::Retry(task.clone()),
                    Err(_) => (None, None),
                }
            }
        };

        let event = &task.parking_event;
        let now = self.clocks.realtime();
        let report = ViolationReport {
            event_id: event.event_id(),
            event_type: "violation_detected".to_owned(),
            priority: task.priority,
            timestamp: now.as_second() as f64 + (now.subsec_nanosecond() as f64 / 1e9),
            timestamp_iso: now.to_string(),
            stream_id: event.stream_id.as_str().to_owned(),
            correlation_id: event.correlation_id(),
            data: ViolationReportData {
                violation: ViolationInfo {
                    start_time: event.parking_start.as_second() as f64,
                    duration: event.duration.as_secs_f64(),
                    violation_severity: classify.severity,
                    is_confirmed: true,
                    vehicle_type: "vehicle".to_owned(),
                    parking_zone_type: classify.zone_type,
                },
                vehicle: VehicleInfo {
                    track_id: event.track_id.0,
                    vehicle_type: "vehicle".to_owned(),
                    confidence: 1.0,
                    bounding_box: event.bbox.as_array(),
                    last_position: event.location,
                },
                license_plate,
                ocr_result,
                stream_info: StreamInfo {
                    stream_id: event.stream_id.as_str().to_owned(),
                    location_name: event.location_name.clone(),
                },
                vehicle_image: frame.base64_data_uri(),
            },
        };

        TaskResult::Accepted(Box::new(report))
    }
}

/// Spawns `count` dedicated OS threads, each running a [`Worker`] built by
/// `make_worker`. `Worker::run` already recovers from a per-task panic on
/// its own; this outer `catch_unwind` only guards against something
/// panicking outside task handling, so a worker's thread never takes its
/// siblings or the process down with it (§4.4 Isolation) even then.
pub fn spawn_workers<F>(count: usize, mut make_worker: F) -> Vec<std::thread::JoinHandle<()>>
where
    F: FnMut(usize) -> Box<dyn FnOnce() + Send>,
{
    (0..count)
        .map(|id| {
            let body = make_worker(id);
            std::thread::Builder::new()
                .name(format!("pipeline-worker-{id}"))
                .spawn(move || {
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)).is_err() {
                        error!(worker_id = id, "worker exited via an unrecovered panic outside task handling");
                    }
                })
                .expect("spawning a worker thread should not fail")
        })
        .collect()
}
