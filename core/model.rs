// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The data model shared by every component: frames, tracks, candidates,
//! tasks, and the reports that eventually leave the process.

use std::sync::Arc;

use derive_more::{Display, From};
use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stream identifier, as declared in configuration and echoed back by the
/// backend's `GET /api/cctvs/active` response.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub String);

impl StreamId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        StreamId(s.to_owned())
    }
}

/// Monotonic counter incremented each time a stream is reopened. Track ids
/// are unique only within `(StreamId, SessionEpoch)`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Display, From)]
pub struct SessionEpoch(pub u32);

/// A track identity, assigned from a per-stream [`slab::Slab`] arena. Never
/// reused within a session epoch once retired.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From)]
pub struct TrackId(pub u32);

/// `[longitude, latitude]`, in that order. A named struct rather than a bare
/// tuple so the order can't be silently swapped at a call site — the source
/// material disagreed with itself about this ordering.
#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
pub struct LonLat {
    pub lon: f64,
    pub lat: f64,
}

impl Serialize for LonLat {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        [self.lon, self.lat].serialize(s)
    }
}

/// Axis-aligned bounding box in pixel coordinates, `(x, y)` top-left.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl BBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn diagonal(&self) -> f64 {
        (self.w * self.w + self.h * self.h).sqrt()
    }

    pub fn area(&self) -> f64 {
        (self.w.max(0.0)) * (self.h.max(0.0))
    }

    /// Intersection-over-union with another box; `0.0` for disjoint boxes.
    pub fn iou(&self, other: &BBox) -> f64 {
        let ix1 = self.x.max(other.x);
        let iy1 = self.y.max(other.y);
        let ix2 = (self.x + self.w).min(other.x + other.w);
        let iy2 = (self.y + self.h).min(other.y + other.h);
        let iw = (ix2 - ix1).max(0.0);
        let ih = (iy2 - iy1).max(0.0);
        let intersection = iw * ih;
        if intersection <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.x, self.y, self.w, self.h]
    }
}

/// An image buffer plus everything C2 needs to attribute it. The JPEG bytes
/// are kept behind an `Arc` so cloning a frame into a [`ParkingEvent`] and
/// then into a [`ViolationReport`]'s base64 payload never re-encodes.
#[derive(Clone, Debug)]
pub struct Frame {
    pub stream_id: StreamId,
    pub seq: u64,
    pub captured_at: Timestamp,
    pub location: LonLat,
    pub location_name: String,
    pub width: u32,
    pub height: u32,
    pub jpeg_bytes: Arc<[u8]>,
}

impl Frame {
    pub fn base64_data_uri(&self) -> String {
        use base64::Engine as _;
        format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&self.jpeg_bytes[..])
        )
    }
}

/// Lifecycle state of a [`VehicleTrack`], per the dwell state machine in
/// `core::tracker`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrackState {
    Tracking,
    Stationary,
    CandidateEmitted,
    Lost,
}

/// Bound on the number of past boxes kept for a track; only used for
/// diagnostics/tests, not for the association cost itself (which only looks
/// at the most recent box).
pub const TRACK_HISTORY_LEN: usize = 16;

/// Per-stream tracker state for one vehicle. Owned exclusively by the
/// stream's producer thread; never shared.
#[derive(Clone, Debug)]
pub struct VehicleTrack {
    pub track_id: TrackId,
    pub bbox: BBox,
    pub history: std::collections::VecDeque<BBox>,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub last_motion_at: Timestamp,
    pub state: TrackState,
    pub miss_count: u32,
    pub parking_start: Option<Timestamp>,
    /// Set when a track enters `Lost`; cleared on retirement or reid.
    pub lost_since: Option<Timestamp>,
}

impl VehicleTrack {
    pub fn new(track_id: TrackId, bbox: BBox, now: Timestamp) -> Self {
        let mut history = std::collections::VecDeque::with_capacity(TRACK_HISTORY_LEN);
        history.push_back(bbox);
        VehicleTrack {
            track_id,
            bbox,
            history,
            first_seen: now,
            last_seen: now,
            last_motion_at: now,
            state: TrackState::Tracking,
            miss_count: 0,
            parking_start: None,
            lost_since: None,
        }
    }

    pub fn push_bbox(&mut self, bbox: BBox, now: Timestamp) {
        self.bbox = bbox;
        self.last_seen = now;
        if self.history.len() == TRACK_HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(bbox);
    }
}

/// Snapshot of a [`VehicleTrack`] at the moment its stationary duration
/// crosses `T_violation`. Immutable once constructed.
#[derive(Clone, Debug)]
pub struct ParkingEvent {
    pub stream_id: StreamId,
    pub session_epoch: SessionEpoch,
    pub track_id: TrackId,
    pub bbox: BBox,
    pub frame: Frame,
    pub location: LonLat,
    pub location_name: String,
    pub parking_start: Timestamp,
    pub duration: SignedDuration,
}

impl ParkingEvent {
    /// Deterministic idempotency key: stable across retries because it
    /// depends only on identity, never on timing or attempt count.
    pub fn event_id(&self) -> String {
        let namespace = Uuid::NAMESPACE_OID;
        let name = format!(
            "{}:{}:{}",
            self.stream_id.as_str(),
            self.track_id.0,
            self.session_epoch.0
        );
        Uuid::new_v5(&namespace, name.as_bytes())
            .hyphenated()
            .to_string()
    }

    pub fn correlation_id(&self) -> String {
        format!("{}@{}", self.track_id.0, self.session_epoch.0)
    }
}

/// Producer-assigned priority. Ordinal order (Low < Normal < High < Urgent)
/// matches the glossary's duration-based default mapping.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    /// Default mapping from dwell duration to priority (Glossary).
    pub fn from_duration(duration: SignedDuration, t_violation: SignedDuration) -> Priority {
        if duration >= t_violation.saturating_mul(5) {
            Priority::Urgent
        } else if duration >= t_violation.saturating_mul(2) {
            Priority::High
        } else {
            Priority::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Priority {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// A unit of work queued from C2 to C4.
#[derive(Clone, Debug)]
pub struct AnalysisTask {
    pub task_id: Uuid,
    pub parking_event: ParkingEvent,
    pub priority: Priority,
    pub created_at: Timestamp,
    pub retry_count: u32,
    pub deadline: Timestamp,
}

impl AnalysisTask {
    pub fn new(
        parking_event: ParkingEvent,
        priority: Priority,
        created_at: Timestamp,
        sla: SignedDuration,
    ) -> Self {
        AnalysisTask {
            task_id: Uuid::new_v7(uuid::Timestamp::from_unix(
                uuid::NoContext,
                created_at.as_second() as u64,
                created_at.subsec_nanosecond() as u32,
            )),
            parking_event,
            priority,
            created_at,
            retry_count: 0,
            deadline: created_at + sla,
        }
    }

    /// Ordering key: `(-priority, created_at)` — higher priority strictly
    /// precedes lower; within a priority, insertion order (FIFO) holds.
    pub fn order_key(&self) -> (std::cmp::Reverse<Priority>, Timestamp) {
        (std::cmp::Reverse(self.priority), self.created_at)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ZoneType {
    #[serde(rename = "crosswalk")]
    Crosswalk,
    #[serde(rename = "no_parking")]
    NoParking,
    #[serde(rename = "fire_lane")]
    FireLane,
    #[serde(rename = "other")]
    Other,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViolationInfo {
    pub start_time: f64,
    pub duration: f64,
    pub violation_severity: f64,
    pub is_confirmed: bool,
    pub vehicle_type: String,
    pub parking_zone_type: ZoneType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub track_id: u32,
    pub vehicle_type: String,
    pub confidence: f64,
    pub bounding_box: [f64; 4],
    pub last_position: LonLat,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LicensePlateInfo {
    pub plate_text: String,
    pub confidence: f64,
    pub bounding_box: [f64; 4],
    pub is_valid_format: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OcrResultInfo {
    pub recognized_text: String,
    pub confidence: f64,
    pub is_valid_format: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamInfo {
    pub stream_id: String,
    pub location_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViolationReportData {
    pub violation: ViolationInfo,
    pub vehicle: VehicleInfo,
    pub license_plate: Option<LicensePlateInfo>,
    pub ocr_result: Option<OcrResultInfo>,
    pub stream_info: StreamInfo,
    pub vehicle_image: String,
}

/// Outcome of C4 for a task that survives all stages. Immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViolationReport {
    pub event_id: String,
    pub event_type: String,
    pub priority: Priority,
    pub timestamp: f64,
    pub timestamp_iso: String,
    pub stream_id: String,
    pub correlation_id: String,
    pub data: ViolationReportData,
}

/// In-flight envelope wrapping a [`ViolationReport`] with retry bookkeeping.
/// Owned by C5; this is exactly what gets written to the NDJSON spool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReporterRecord {
    pub report: ViolationReport,
    pub attempt_count: u32,
    #[serde(with = "unix_seconds")]
    pub next_retry_at: Timestamp,
    #[serde(with = "unix_seconds_opt")]
    pub first_failure_at: Option<Timestamp>,
}

/// `Timestamp` as a fractional unix-seconds float, for NDJSON spool records.
mod unix_seconds {
    use jiff::Timestamp;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(ts: &Timestamp, s: S) -> Result<S::Ok, S::Error> {
        ts.as_second().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Timestamp, D::Error> {
        let secs = i64::deserialize(d)?;
        Timestamp::from_second(secs).map_err(serde::de::Error::custom)
    }
}

mod unix_seconds_opt {
    use jiff::Timestamp;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(ts: &Option<Timestamp>, s: S) -> Result<S::Ok, S::Error> {
        ts.map(|t| t.as_second()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Timestamp>, D::Error> {
        let secs = Option::<i64>::deserialize(d)?;
        secs.map(Timestamp::from_second)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

impl ReporterRecord {
    pub fn new(report: ViolationReport, now: Timestamp) -> Self {
        ReporterRecord {
            report,
            attempt_count: 0,
            next_retry_at: now,
            first_failure_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_identical_boxes_is_one() {
        let b = BBox { x: 0.0, y: 0.0, w: 10.0, h: 10.0 };
        assert!((b.iou(&b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn iou_disjoint_boxes_is_zero() {
        let a = BBox { x: 0.0, y: 0.0, w: 5.0, h: 5.0 };
        let b = BBox { x: 100.0, y: 100.0, w: 5.0, h: 5.0 };
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn event_id_stable_for_same_identity() {
        let frame = Frame {
            stream_id: StreamId::from("cam-1"),
            seq: 1,
            captured_at: Timestamp::UNIX_EPOCH,
            location: LonLat { lon: 127.0, lat: 37.5 },
            location_name: "lot-a".into(),
            width: 640,
            height: 480,
            jpeg_bytes: Arc::from(&b"fake"[..]),
        };
        let mk = |track: u32| ParkingEvent {
            stream_id: StreamId::from("cam-1"),
            session_epoch: SessionEpoch(2),
            track_id: TrackId(track),
            bbox: BBox { x: 0.0, y: 0.0, w: 1.0, h: 1.0 },
            frame: frame.clone(),
            location: frame.location,
            location_name: frame.location_name.clone(),
            parking_start: Timestamp::UNIX_EPOCH,
            duration: SignedDuration::from_secs(60),
        };
        assert_eq!(mk(5).event_id(), mk(5).event_id());
        assert_ne!(mk(5).event_id(), mk(6).event_id());
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }
}
