// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Wires the five domain components (C1-C5) into a running process (C6):
//! loads config, resolves the stream list, spawns one producer thread per
//! stream, a pool of pipeline workers, the async reporter task, and a health
//! pulse, then waits for a shutdown signal before draining everything.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use jiff::{SignedDuration, Timestamp};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use base::clock::{Clocks, RealClocks};
use base::{format_err_t, Error};

use domain::backend::{ActiveStream, BackendClient, ReportBackend};
use domain::config::{ConfigFile, PipelineConfig, SourceKind, StreamConfig, TrackerConfig};
use domain::model::{AnalysisTask, Frame, ParkingEvent, SessionEpoch, StreamId};
use domain::model_client::Models;
use domain::operators::{Detection, VehicleDetector};
use domain::pipeline::{spawn_workers, Worker};
use domain::queue::{PushResult, TaskQueue};
use domain::reporter::Reporter;
use domain::source::{open_with_retry, DefaultOpener, PullOutcome};
use domain::tracker::{StationaryCrossing, Tracker};

mod config;

/// Per-call deadline for the vehicle detector. It's called from the stream
/// driver rather than a pipeline stage, so it isn't one of `PipelineConfig`'s
/// named stage deadlines.
const VEHICLE_DETECT_TIMEOUT: StdDuration = StdDuration::from_secs(2);

/// Timeout for the blocking HTTP client the `live_http` source polls with.
const SOURCE_HTTP_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// fps assumed for streams the backend hands us by URL, matching
/// `domain::config`'s own default for configured streams.
const DEFAULT_LIVE_FPS: f64 = 5.0;

pub fn run(config_path: &Path) -> Result<(), Error> {
    let config = config::load(config_path)?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format_err_t!(Internal, "building tokio runtime: {e}"))?;
    let r = rt.block_on(async_run(config));
    // tokio normally waits for all spawned tasks to complete, but inner()
    // already waits for the ones that matter with explicit logging; an
    // immediate (double-signal) shutdown deliberately doesn't wait further.
    rt.shutdown_background();
    r
}

async fn async_run(config: ConfigFile) -> Result<(), Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    let mut int = signal(SignalKind::interrupt())
        .map_err(|e| format_err_t!(Internal, "installing SIGINT handler: {e}"))?;
    let mut term = signal(SignalKind::terminate())
        .map_err(|e| format_err_t!(Internal, "installing SIGTERM handler: {e}"))?;

    tokio::pin! {
        let inner = inner(config, shutdown_rx);
    }

    tokio::select! {
        biased;
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully (send another signal to shut down immediately)");
            shutdown_tx.take();
        }
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully (send another signal to shut down immediately)");
            shutdown_tx.take();
        }
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => {
            error!("immediate shutdown due to a second signal (SIGINT)");
            Ok(())
        }
        _ = term.recv() => {
            error!("immediate shutdown due to a second signal (SIGTERM)");
            Ok(())
        }
        result = &mut inner => result,
    }
}

async fn inner(config: ConfigFile, shutdown_rx: base::shutdown::Receiver) -> Result<(), Error> {
    let ConfigFile {
        streams: configured_streams,
        backend: backend_cfg,
        models: models_cfg,
        queue: queue_cfg,
        pipeline: pipeline_cfg,
        reporter: reporter_cfg,
        tracker: tracker_cfg,
        supervisor: supervisor_cfg,
    } = config;

    let clocks = RealClocks {};
    let models = Models::new(&models_cfg)?;
    let backend = BackendClient::new(
        backend_cfg.base_url.clone(),
        StdDuration::from_secs(backend_cfg.http_timeout_secs),
    )?;

    let streams = resolve_streams(&backend, &configured_streams).await?;
    info!(count = streams.len(), "resolved stream list");

    let queue = Arc::new(TaskQueue::new(queue_cfg.capacity));
    let (report_tx, report_rx) = tokio::sync::mpsc::channel(queue_cfg.capacity.max(16));

    let drain_timeout = StdDuration::from_secs(supervisor_cfg.shutdown_drain_secs);
    let reporter = Reporter::new(backend, reporter_cfg, clocks);
    let reporter_handle = tokio::spawn(reporter.run(report_rx, shutdown_rx.clone(), drain_timeout));

    let workers = {
        let models = models.clone();
        let queue = queue.clone();
        let shutdown_rx = shutdown_rx.clone();
        spawn_workers(pipeline_cfg.workers, move |id| {
            let worker = Worker {
                id,
                queue: queue.clone(),
                operators: models.operator_set(),
                report_tx: report_tx.clone(),
                cfg: pipeline_cfg,
                clocks: RealClocks {},
                shutdown_rx: shutdown_rx.clone(),
            };
            Box::new(move || worker.run())
        })
    };

    let heartbeats: Arc<Vec<StreamHeartbeat>> =
        Arc::new(streams.iter().map(|s| StreamHeartbeat::new(s.stream_id.clone())).collect());

    let producers: Vec<std::thread::JoinHandle<()>> = streams
        .into_iter()
        .enumerate()
        .map(|(i, stream_cfg)| {
            let models = models.clone();
            let queue = queue.clone();
            let shutdown_rx = shutdown_rx.clone();
            let heartbeat = heartbeats[i].handle();
            std::thread::Builder::new()
                .name(format!("stream-{}", stream_cfg.stream_id))
                .spawn(move || {
                    run_stream(
                        stream_cfg,
                        models,
                        queue,
                        tracker_cfg,
                        pipeline_cfg,
                        RealClocks {},
                        shutdown_rx,
                        heartbeat,
                    )
                })
                .expect("spawning a stream thread should not fail")
        })
        .collect();

    let health_handle = tokio::spawn(health_pulse(
        queue.clone(),
        heartbeats,
        clocks,
        StdDuration::from_secs(supervisor_cfg.health_pulse_secs),
        StdDuration::from_secs(supervisor_cfg.unhealthy_after_secs),
        shutdown_rx.clone(),
    ));

    let _ = shutdown_rx.as_future().await;
    info!("shutdown requested: stopping stream producers and draining the pipeline");

    tokio::task::spawn_blocking(move || {
        for p in producers {
            let _ = p.join();
        }
    })
    .await
    .map_err(|e| format_err_t!(Internal, "joining stream producer threads: {e}"))?;

    // C1 inputs have stopped; close C3 so idle workers observe it and exit
    // once they've drained whatever was already queued.
    queue.close();
    tokio::task::spawn_blocking(move || {
        for w in workers {
            let _ = w.join();
        }
    })
    .await
    .map_err(|e| format_err_t!(Internal, "joining pipeline workers: {e}"))?;

    let _ = health_handle.await;
    reporter_handle
        .await
        .map_err(|e| format_err_t!(Internal, "reporter task panicked: {e}"))?;

    Ok(())
}

/// Prefers the backend's live view of which cameras are active (§6.3); falls
/// back to the statically configured list when the backend can't be reached
/// or reports none, so a backend blip doesn't stop an otherwise-healthy
/// deployment from watching its cameras.
async fn resolve_streams(
    backend: &BackendClient,
    configured: &[StreamConfig],
) -> Result<Vec<StreamConfig>, Error> {
    match backend.active_streams().await {
        Ok(active) if !active.is_empty() => Ok(active.into_iter().map(active_to_stream_config).collect()),
        Ok(_) => {
            warn!("backend returned an empty active-stream list; falling back to configured streams");
            fallback_to_configured(configured)
        }
        Err(e) => {
            warn!(%e, "could not reach backend for active stream list; falling back to configured streams");
            fallback_to_configured(configured)
        }
    }
}

fn active_to_stream_config(a: ActiveStream) -> StreamConfig {
    StreamConfig {
        stream_id: a.stream_id,
        source_type: SourceKind::LiveHttp,
        path: None,
        url: Some(a.url),
        lat: a.location.lat,
        lon: a.location.lon,
        location_name: a.location_name,
        fps: DEFAULT_LIVE_FPS,
        looping: false,
    }
}

fn fallback_to_configured(configured: &[StreamConfig]) -> Result<Vec<StreamConfig>, Error> {
    if configured.is_empty() {
        return Err(format_err_t!(
            DegradedExternal,
            "backend unreachable and no streams configured locally; nothing to do"
        ));
    }
    Ok(configured.to_vec())
}

/// Last-frame-received timestamp for one stream, shared between its producer
/// thread and the health pulse. Detection-only: a stream found stale here is
/// logged, not automatically restarted (its OS thread owns a blocking source
/// handle with no cancellation hook beyond the shutdown signal).
struct StreamHeartbeat {
    stream_id: String,
    last_frame_unix: Arc<AtomicI64>,
}

impl StreamHeartbeat {
    fn new(stream_id: String) -> Self {
        StreamHeartbeat {
            stream_id,
            last_frame_unix: Arc::new(AtomicI64::new(0)),
        }
    }

    fn handle(&self) -> Self {
        StreamHeartbeat {
            stream_id: self.stream_id.clone(),
            last_frame_unix: self.last_frame_unix.clone(),
        }
    }

    fn touch(&self, now: Timestamp) {
        self.last_frame_unix.store(now.as_second(), Ordering::Relaxed);
    }

    fn age_secs(&self, now: Timestamp) -> Option<i64> {
        let last = self.last_frame_unix.load(Ordering::Relaxed);
        (last != 0).then(|| (now.as_second() - last).max(0))
    }
}

async fn health_pulse(
    queue: Arc<TaskQueue>,
    heartbeats: Arc<Vec<StreamHeartbeat>>,
    clocks: RealClocks,
    interval: StdDuration,
    unhealthy_after: StdDuration,
    shutdown_rx: base::shutdown::Receiver,
) {
    let mut tick = tokio::time::interval(interval);
    let shutdown = shutdown_rx.future();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = tick.tick() => {
                let sizes = queue.size_by_priority();
                info!(
                    urgent = sizes.urgent,
                    high = sizes.high,
                    normal = sizes.normal,
                    low = sizes.low,
                    dropped_low = queue.dropped_low(),
                    "health pulse",
                );
                let now = clocks.realtime();
                for hb in heartbeats.iter() {
                    if let Some(age) = hb.age_secs(now) {
                        if age as u64 >= unhealthy_after.as_secs() {
                            warn!(stream_id = %hb.stream_id, age_secs = age, "stream unhealthy: no frames recently");
                        }
                    }
                }
            }
        }
    }
}

/// A task's time budget: enough for every stage to be attempted
/// `max_retries + 1` times at their configured deadlines.
fn task_sla(cfg: &PipelineConfig) -> SignedDuration {
    let stage_budget_ms = cfg.stage_a_deadline_ms + cfg.stage_b_deadline_ms + cfg.stage_c_deadline_ms;
    SignedDuration::from_millis(stage_budget_ms as i64 * (cfg.max_retries as i64 + 1))
}

/// One producer thread: C1 (source) fused with C2 (tracker), opened once and
/// run until the source ends, a shutdown is requested, or (for `live_http`)
/// indefinitely.
fn run_stream(
    stream_cfg: StreamConfig,
    models: Models,
    queue: Arc<TaskQueue>,
    tracker_cfg: TrackerConfig,
    pipeline_cfg: PipelineConfig,
    clocks: RealClocks,
    shutdown_rx: base::shutdown::Receiver,
    heartbeat: StreamHeartbeat,
) {
    let opener = DefaultOpener::new(SOURCE_HTTP_TIMEOUT);
    let epoch = SessionEpoch(0);
    let mut stream = match open_with_retry(&opener, &stream_cfg, epoch, &clocks, &shutdown_rx) {
        Ok(s) => s,
        Err(_) => {
            debug!(stream_id = %stream_cfg.stream_id, "stream driver exiting: shutdown requested during open");
            return;
        }
    };
    let vehicle_detector = models.vehicle_detector();
    let mut tracker = Tracker::new(StreamId(stream_cfg.stream_id.clone()), epoch, tracker_cfg);
    let sla = task_sla(&pipeline_cfg);

    loop {
        if shutdown_rx.check().is_err() {
            return;
        }
        let now = clocks.realtime();
        let pull_deadline = now + SignedDuration::from_secs(5);
        match stream.next_frame(pull_deadline, &|| clocks.realtime()) {
            PullOutcome::Frame(frame) => {
                heartbeat.touch(frame.captured_at);
                let drops = stream.frame_drops();
                if drops > 0 {
                    debug!(stream_id = %stream_cfg.stream_id, drops, "frames dropped since last pull");
                }
                handle_frame(
                    &frame,
                    vehicle_detector.as_ref(),
                    &mut tracker,
                    &queue,
                    &stream_cfg,
                    epoch,
                    pipeline_cfg.conf_min,
                    sla,
                    &clocks,
                );
            }
            PullOutcome::Ended => {
                info!(stream_id = %stream_cfg.stream_id, "stream ended, retiring");
                return;
            }
            PullOutcome::TransientError(e) => {
                warn!(stream_id = %stream_cfg.stream_id, %e, "frame pull failed, retrying after backoff");
                clocks.sleep(SignedDuration::from_secs(1));
            }
        }
    }
}

fn handle_frame(
    frame: &Frame,
    vehicle_detector: &dyn VehicleDetector,
    tracker: &mut Tracker,
    queue: &TaskQueue,
    stream_cfg: &StreamConfig,
    epoch: SessionEpoch,
    conf_min: f64,
    sla: SignedDuration,
    clocks: &RealClocks,
) {
    let now = clocks.realtime();
    let deadline = now + SignedDuration::try_from(VEHICLE_DETECT_TIMEOUT).unwrap_or(SignedDuration::ZERO);
    let crossings = match vehicle_detector.detect(&frame.jpeg_bytes, deadline, now) {
        Ok(detections) => {
            let filtered: Vec<Detection> = detections.into_iter().filter(|d| d.confidence >= conf_min).collect();
            tracker.update(&filtered, frame.captured_at)
        }
        Err(e) => {
            warn!(stream_id = %stream_cfg.stream_id, %e, "vehicle detector call failed");
            tracker.on_detector_failure(frame.captured_at)
        }
    };
    for crossing in crossings {
        emit_candidate(frame, stream_cfg, epoch, crossing, queue, sla);
    }
}

fn emit_candidate(
    frame: &Frame,
    stream_cfg: &StreamConfig,
    epoch: SessionEpoch,
    crossing: StationaryCrossing,
    queue: &TaskQueue,
    sla: SignedDuration,
) {
    let event = ParkingEvent {
        stream_id: StreamId(stream_cfg.stream_id.clone()),
        session_epoch: epoch,
        track_id: crossing.track_id,
        bbox: crossing.bbox,
        frame: frame.clone(),
        location: frame.location,
        location_name: frame.location_name.clone(),
        parking_start: crossing.parking_start,
        duration: crossing.duration,
    };
    let task = AnalysisTask::new(event, crossing.priority, frame.captured_at, sla);
    match queue.push(task) {
        PushResult::Accepted => {}
        PushResult::DroppedLow => {
            warn!(stream_id = %stream_cfg.stream_id, "candidate dropped: queue full of higher-priority work");
        }
        PushResult::Blocked => {
            warn!(stream_id = %stream_cfg.stream_id, "candidate dropped: queue closed or contended");
        }
    }
}
