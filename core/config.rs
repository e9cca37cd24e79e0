// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Stream descriptors and tunables (§4's defaults, §6.2, §6.4). Deserialized
//! from the binary's TOML config file; every field carries the default named
//! in the component design so a minimal config file is valid.

use serde::Deserialize;

fn default_source_fps() -> f64 {
    5.0
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ImageSequence,
    VideoFile,
    LiveHttp,
}

/// One configured stream (§6.2). `path` is used by `image_sequence`/
/// `video_file`; `url` by `live_http`.
#[derive(Clone, Debug, Deserialize)]
pub struct StreamConfig {
    pub stream_id: String,
    pub source_type: SourceKind,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub location_name: String,
    #[serde(default = "default_source_fps")]
    pub fps: f64,
    /// Test-mode only: restart from frame 0 with an incremented session
    /// epoch instead of retiring the stream on `ENDED`.
    #[serde(default)]
    pub looping: bool,
}

fn default_backend_poll_secs() -> u64 {
    300
}

#[derive(Clone, Debug, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default = "default_backend_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    100
}

#[derive(Copy, Clone, Debug, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            capacity: default_queue_capacity(),
        }
    }
}

fn default_workers() -> usize {
    3
}
fn default_stage_a_deadline_ms() -> u64 {
    500
}
fn default_stage_b_deadline_ms() -> u64 {
    300
}
fn default_stage_c_deadline_ms() -> u64 {
    800
}
fn default_max_retries() -> u32 {
    3
}
fn default_severity_gate() -> f64 {
    0.5
}
fn default_conf_min() -> f64 {
    0.3
}

#[derive(Copy, Clone, Debug, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_stage_a_deadline_ms")]
    pub stage_a_deadline_ms: u64,
    #[serde(default = "default_stage_b_deadline_ms")]
    pub stage_b_deadline_ms: u64,
    #[serde(default = "default_stage_c_deadline_ms")]
    pub stage_c_deadline_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Stage A gate: reject when `severity < severity_gate` (§4.4 step 2,
    /// Open Question: the 0.5/0.7 ambiguity is resolved here at 0.5; 0.7 is
    /// left entirely to the backend).
    #[serde(default = "default_severity_gate")]
    pub severity_gate: f64,
    /// Vehicle-detector confidence floor (§4.2).
    #[serde(default = "default_conf_min")]
    pub conf_min: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            workers: default_workers(),
            stage_a_deadline_ms: default_stage_a_deadline_ms(),
            stage_b_deadline_ms: default_stage_b_deadline_ms(),
            stage_c_deadline_ms: default_stage_c_deadline_ms(),
            max_retries: default_max_retries(),
            severity_gate: default_severity_gate(),
            conf_min: default_conf_min(),
        }
    }
}

fn default_base_backoff_secs() -> f64 {
    1.0
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_backoff_secs() -> f64 {
    60.0
}
fn default_reporter_max_attempts() -> u32 {
    5
}
fn default_jitter() -> f64 {
    0.2
}
fn default_spool_path() -> String {
    "reporter-spool.ndjson".to_owned()
}
fn default_dead_letter_path() -> String {
    "reporter-dead-letter.ndjson".to_owned()
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReporterConfig {
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: f64,
    #[serde(default = "default_reporter_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_spool_path")]
    pub spool_path: String,
    #[serde(default = "default_dead_letter_path")]
    pub dead_letter_path: String,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        ReporterConfig {
            base_backoff_secs: default_base_backoff_secs(),
            backoff_factor: default_backoff_factor(),
            max_backoff_secs: default_max_backoff_secs(),
            max_attempts: default_reporter_max_attempts(),
            jitter: default_jitter(),
            spool_path: default_spool_path(),
            dead_letter_path: default_dead_letter_path(),
        }
    }
}

fn default_t_stationary_secs() -> f64 {
    3.0
}
fn default_t_violation_secs() -> f64 {
    60.0
}
fn default_k_miss() -> u32 {
    5
}
fn default_w_reid_secs() -> f64 {
    2.0
}
fn default_eps_abs() -> f64 {
    4.0
}
fn default_eps_rel() -> f64 {
    0.02
}
fn default_reid_iou_min() -> f64 {
    0.3
}
fn default_degraded_after() -> u32 {
    3
}

#[derive(Copy, Clone, Debug, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_t_stationary_secs")]
    pub t_stationary_secs: f64,
    #[serde(default = "default_t_violation_secs")]
    pub t_violation_secs: f64,
    #[serde(default = "default_k_miss")]
    pub k_miss: u32,
    #[serde(default = "default_w_reid_secs")]
    pub w_reid_secs: f64,
    #[serde(default = "default_eps_abs")]
    pub eps_abs: f64,
    #[serde(default = "default_eps_rel")]
    pub eps_rel: f64,
    #[serde(default = "default_reid_iou_min")]
    pub reid_iou_min: f64,
    /// Consecutive detector failures before a stream is marked degraded
    /// (§4.2 Failure).
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            t_stationary_secs: default_t_stationary_secs(),
            t_violation_secs: default_t_violation_secs(),
            k_miss: default_k_miss(),
            w_reid_secs: default_w_reid_secs(),
            eps_abs: default_eps_abs(),
            eps_rel: default_eps_rel(),
            reid_iou_min: default_reid_iou_min(),
            degraded_after: default_degraded_after(),
        }
    }
}

fn default_models_timeout_secs() -> u64 {
    5
}

/// Where the four vision-model operators (§6.1) are reachable. They're an
/// external collaborator this process calls over HTTP, one POST per stage
/// with the crop/frame bytes as the body.
#[derive(Clone, Debug, Deserialize)]
pub struct ModelsConfig {
    pub base_url: String,
    #[serde(default = "default_models_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_health_pulse_secs() -> u64 {
    10
}
fn default_shutdown_drain_secs() -> u64 {
    30
}
fn default_max_restarts_per_hour() -> u32 {
    5
}
fn default_unhealthy_after_secs() -> u64 {
    60
}

#[derive(Copy, Clone, Debug, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_health_pulse_secs")]
    pub health_pulse_secs: u64,
    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,
    #[serde(default = "default_max_restarts_per_hour")]
    pub max_restarts_per_hour: u32,
    #[serde(default = "default_unhealthy_after_secs")]
    pub unhealthy_after_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            health_pulse_secs: default_health_pulse_secs(),
            shutdown_drain_secs: default_shutdown_drain_secs(),
            max_restarts_per_hour: default_max_restarts_per_hour(),
            unhealthy_after_secs: default_unhealthy_after_secs(),
        }
    }
}

/// Top-level config file shape, matching `[streams]`/`[backend]`/`[queue]`/
/// `[pipeline]`/`[reporter]`/`[tracker]`/`[supervisor]` TOML sections.
#[derive(Clone, Debug, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    pub backend: BackendConfig,
    pub models: ModelsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub reporter: ReporterConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}
