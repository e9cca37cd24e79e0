// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tracker + Dwell Monitor (C2, §4.2). One instance per stream, driven
//! single-threaded by that stream's producer thread so the track table needs
//! no locking (§5: "the track table is owned exclusively by its producer
//! thread").

use jiff::{SignedDuration, Timestamp};
use slab::Slab;
use tracing::{debug, warn};

use crate::config::TrackerConfig;
use crate::model::{BBox, Priority, SessionEpoch, StreamId, TrackId, TrackState, VehicleTrack};
use crate::operators::Detection;

/// A candidate raised when a track's stationary duration crosses
/// `T_violation`. The tracker hands this to the caller, which builds the
/// full [`crate::model::ParkingEvent`] (it needs the frame, which the
/// tracker doesn't keep a copy of).
pub struct StationaryCrossing {
    pub track_id: TrackId,
    pub bbox: BBox,
    pub parking_start: Timestamp,
    pub duration: SignedDuration,
    pub priority: Priority,
}

fn motion_epsilon(bbox: &BBox, cfg: &TrackerConfig) -> f64 {
    (cfg.eps_abs).max(cfg.eps_rel * bbox.diagonal())
}

fn displacement(a: (f64, f64), b: (f64, f64)) -> f64 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

struct SlotTrack {
    track: VehicleTrack,
    /// Cached bbox from the instant it went `Lost`, for the reid IoU test.
    lost_bbox: Option<BBox>,
}

/// Per-stream tracker state. Not `Send`/`Sync` on purpose: the type is meant
/// to live entirely on its owning thread.
pub struct Tracker {
    stream_id: StreamId,
    session_epoch: SessionEpoch,
    cfg: TrackerConfig,
    tracks: Slab<SlotTrack>,
    /// Monotonic, independent of `tracks`' slab keys: a slab key can be
    /// reused once freed, but a `TrackId` must never be (§3).
    next_track_id: u32,
    consecutive_detector_failures: u32,
    degraded: bool,
}

impl Tracker {
    pub fn new(stream_id: StreamId, session_epoch: SessionEpoch, cfg: TrackerConfig) -> Self {
        Tracker {
            stream_id,
            session_epoch,
            cfg,
            tracks: Slab::new(),
            next_track_id: 1,
            consecutive_detector_failures: 0,
            degraded: false,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn reset_session(&mut self, new_epoch: SessionEpoch) {
        self.session_epoch = new_epoch;
        self.tracks.clear();
        self.next_track_id = 1;
        self.consecutive_detector_failures = 0;
        self.degraded = false;
    }

    /// Call when the detector itself failed for this frame (§4.2 Failure):
    /// previous tracks are kept, `miss_count` increments, and after
    /// `degraded_after` consecutive failures the stream is marked degraded
    /// (candidates still emit from in-memory state; no new detections enter).
    pub fn on_detector_failure(&mut self, now: Timestamp) -> Vec<StationaryCrossing> {
        self.consecutive_detector_failures += 1;
        if self.consecutive_detector_failures >= self.cfg.degraded_after {
            if !self.degraded {
                warn!(stream_id = %self.stream_id, "stream marked degraded after repeated detector failures");
            }
            self.degraded = true;
        }
        self.advance(&[], now)
    }

    /// Advances every track by one frame given the detector's output
    /// (already filtered to `conf_min`, per §4.2). Returns any stationary
    /// crossings raised this frame. Call only after the detector call
    /// itself succeeded, even if it found nothing: that's what resets the
    /// *consecutive*-failure streak (§4.2 Failure), as opposed to
    /// `on_detector_failure`, which advances the same tracks without
    /// resetting it.
    pub fn update(&mut self, detections: &[Detection], now: Timestamp) -> Vec<StationaryCrossing> {
        self.consecutive_detector_failures = 0;
        self.degraded = false;
        self.advance(detections, now)
    }

    fn advance(&mut self, detections: &[Detection], now: Timestamp) -> Vec<StationaryCrossing> {
        let mut unmatched_dets: Vec<usize> = (0..detections.len()).collect();
        let mut matched_tracks = std::collections::HashSet::new();

        // Greedy highest-IoU-first assignment: repeatedly pick the best
        // remaining (detection, track) pair until no pair clears a minimal
        // IoU floor, ties broken by smaller detection index (§4.2).
        loop {
            // (index into unmatched_dets, track slab key, detection index, iou)
            let mut best: Option<(usize, usize, usize, f64)> = None;
            for (ui, &det_idx) in unmatched_dets.iter().enumerate() {
                for (key, slot) in self.tracks.iter() {
                    if matched_tracks.contains(&key) {
                        continue;
                    }
                    let iou = detections[det_idx].bbox.iou(&slot.track.bbox);
                    if iou <= 0.0 {
                        continue;
                    }
                    let better = match best {
                        None => true,
                        Some((_, _, best_det_idx, best_iou)) => {
                            iou > best_iou || (iou == best_iou && det_idx < best_det_idx)
                        }
                    };
                    if better {
                        best = Some((ui, key, det_idx, iou));
                    }
                }
            }
            let Some((ui, key, _, _)) = best else { break };
            let det_idx = unmatched_dets.remove(ui);
            matched_tracks.insert(key);
            self.apply_detection(key, &detections[det_idx], now);
        }

        // Unmatched tracks: increment miss_count, possibly transition to Lost.
        let keys: Vec<usize> = self.tracks.iter().map(|(k, _)| k).collect();
        for key in keys {
            if matched_tracks.contains(&key) {
                continue;
            }
            let slot = &mut self.tracks[key];
            slot.track.miss_count += 1;
            if slot.track.miss_count >= self.cfg.k_miss && slot.track.state != TrackState::Lost {
                slot.track.state = TrackState::Lost;
                slot.track.lost_since = Some(now);
                slot.lost_bbox = Some(slot.track.bbox);
                debug!(stream_id = %self.stream_id, track_id = slot.track.track_id.0, "track lost");
            }
        }

        // Unmatched detections: try reid against Lost tracks, else new track.
        let mut crossings = Vec::new();
        for det_idx in unmatched_dets {
            let det = &detections[det_idx];
            if let Some(key) = self.find_reid_match(det, now) {
                self.resurrect(key, det, now);
                continue;
            }
            let track_id = TrackId(self.next_track_id);
            self.next_track_id += 1;
            let track = VehicleTrack::new(track_id, det.bbox, now);
            self.tracks.insert(SlotTrack {
                track,
                lost_bbox: None,
            });
        }

        // Retire Lost tracks whose reid window has expired.
        let w_reid = SignedDuration::from_secs_f64(self.cfg.w_reid_secs);
        let expired: Vec<usize> = self
            .tracks
            .iter()
            .filter_map(|(k, s)| match s.track.lost_since {
                Some(since) if now.duration_since(since) >= w_reid => Some(k),
                _ => None,
            })
            .collect();
        for key in expired {
            self.tracks.remove(key);
        }

        // Dwell state machine for everything still matched (Lost tracks
        // don't advance dwell: they're not being observed).
        for key in matched_tracks {
            if let Some(crossing) = self.advance_dwell(key, now) {
                crossings.push(crossing);
            }
        }

        crossings
    }

    fn apply_detection(&mut self, key: usize, det: &Detection, now: Timestamp) {
        let slot = &mut self.tracks[key];
        let was_lost = slot.track.state == TrackState::Lost;
        let prev_center = slot.track.bbox.center();
        slot.track.miss_count = 0;
        slot.track.push_bbox(det.bbox, now);
        if was_lost {
            slot.track.state = TrackState::Tracking;
            slot.track.lost_since = None;
            slot.lost_bbox = None;
            slot.track.last_motion_at = now;
            return;
        }
        let eps = motion_epsilon(&det.bbox, &self.cfg);
        let moved = displacement(prev_center, det.bbox.center()) >= eps;
        if moved {
            slot.track.last_motion_at = now;
            match slot.track.state {
                TrackState::Stationary | TrackState::CandidateEmitted => {
                    slot.track.state = TrackState::Tracking;
                    slot.track.parking_start = None;
                }
                TrackState::Tracking => {}
                TrackState::Lost => unreachable!("handled above"),
            }
        }
        // displacement < eps: last_motion_at is left unchanged ("set
        // last_motion_at <- previous last_motion_at", §4.2 table).
    }

    fn advance_dwell(&mut self, key: usize, now: Timestamp) -> Option<StationaryCrossing> {
        let t_stationary = SignedDuration::from_secs_f64(self.cfg.t_stationary_secs);
        let t_violation = SignedDuration::from_secs_f64(self.cfg.t_violation_secs);
        let slot = &mut self.tracks[key];
        let dwell = now.duration_since(slot.track.last_motion_at);

        match slot.track.state {
            TrackState::Tracking if dwell >= t_stationary => {
                slot.track.state = TrackState::Stationary;
                slot.track.parking_start = Some(slot.track.last_motion_at);
                None
            }
            TrackState::Stationary => {
                let parking_start = slot.track.parking_start.unwrap_or(slot.track.last_motion_at);
                let duration = now.duration_since(parking_start);
                if duration >= t_violation {
                    slot.track.state = TrackState::CandidateEmitted;
                    let priority = Priority::from_duration(duration, t_violation);
                    Some(StationaryCrossing {
                        track_id: slot.track.track_id,
                        bbox: slot.track.bbox,
                        parking_start,
                        duration,
                        priority,
                    })
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn find_reid_match(&self, det: &Detection, now: Timestamp) -> Option<usize> {
        let w_reid = SignedDuration::from_secs_f64(self.cfg.w_reid_secs);
        self.tracks
            .iter()
            .filter(|(_, s)| s.track.state == TrackState::Lost)
            .filter(|(_, s)| match s.track.lost_since {
                Some(since) => now.duration_since(since) <= w_reid,
                None => false,
            })
            .filter_map(|(k, s)| {
                let lost_bbox = s.lost_bbox.unwrap_or(s.track.bbox);
                let iou = det.bbox.iou(&lost_bbox);
                (iou > self.cfg.reid_iou_min).then_some((k, iou))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .map(|(k, _)| k)
    }

    fn resurrect(&mut self, key: usize, det: &Detection, now: Timestamp) {
        let slot = &mut self.tracks[key];
        slot.track.state = TrackState::Tracking;
        slot.track.lost_since = None;
        slot.lost_bbox = None;
        slot.track.miss_count = 0;
        slot.track.last_motion_at = now;
        slot.track.push_bbox(det.bbox, now);
        debug!(track_id = slot.track.track_id.0, "track re-identified");
    }

    #[cfg(test)]
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    #[cfg(test)]
    pub fn track_state(&self, track_id: TrackId) -> Option<TrackState> {
        self.tracks
            .iter()
            .find(|(_, s)| s.track.track_id == track_id)
            .map(|(_, s)| s.track.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f64, y: f64) -> Detection {
        Detection {
            bbox: BBox { x, y, w: 10.0, h: 10.0 },
            confidence: 0.9,
        }
    }

    fn cfg() -> TrackerConfig {
        TrackerConfig {
            t_stationary_secs: 3.0,
            t_violation_secs: 60.0,
            k_miss: 5,
            w_reid_secs: 2.0,
            eps_abs: 4.0,
            eps_rel: 0.02,
            reid_iou_min: 0.3,
            degraded_after: 3,
        }
    }

    fn at(secs: i64) -> Timestamp {
        Timestamp::UNIX_EPOCH + SignedDuration::from_secs(secs)
    }

    #[test]
    fn empty_stream_produces_zero_candidates() {
        let mut t = Tracker::new(StreamId::from("cam-1"), SessionEpoch(0), cfg());
        for s in 0..200 {
            assert!(t.update(&[], at(s)).is_empty());
        }
    }

    #[test]
    fn stationary_vehicle_emits_exactly_one_candidate() {
        let mut t = Tracker::new(StreamId::from("cam-1"), SessionEpoch(0), cfg());
        let mut crossings = Vec::new();
        for s in 0..=70 {
            crossings.extend(t.update(&[det(0.0, 0.0)], at(s)));
        }
        assert_eq!(crossings.len(), 1);
        assert_eq!(crossings[0].duration, SignedDuration::from_secs(60));
    }

    #[test]
    fn remotion_resets_dwell_and_candidate_fires_later() {
        let mut t = Tracker::new(StreamId::from("cam-1"), SessionEpoch(0), cfg());
        let mut crossings = Vec::new();
        for s in 0..40 {
            crossings.extend(t.update(&[det(0.0, 0.0)], at(s)));
        }
        // Move by 10px (>= eps) at t=40, then sit still again.
        crossings.extend(t.update(&[det(10.0, 0.0)], at(40)));
        for s in 41..=(45 + 3 + 60) {
            crossings.extend(t.update(&[det(10.0, 0.0)], at(s)));
        }
        assert_eq!(crossings.len(), 1);
    }

    #[test]
    fn jitter_exactly_at_epsilon_is_not_stationary_break() {
        // eps = max(4, 0.02 * diag). diag of a 10x10 box = 14.14, so eps = 4.
        // A displacement of exactly 4 must count as motion (strict '<').
        let mut t = Tracker::new(StreamId::from("cam-1"), SessionEpoch(0), cfg());
        t.update(&[det(0.0, 0.0)], at(0));
        t.update(&[det(4.0, 0.0)], at(1));
        let crossings = t.update(&[det(4.0, 0.0)], at(10));
        assert!(crossings.is_empty(), "displacement == eps must count as motion");
    }

    #[test]
    fn lost_track_retires_after_reid_window() {
        let mut t = Tracker::new(StreamId::from("cam-1"), SessionEpoch(0), cfg());
        t.update(&[det(0.0, 0.0)], at(0));
        assert_eq!(t.track_count(), 1);
        for s in 1..=5 {
            t.update(&[], at(s));
        }
        // miss_count should have hit k_miss=5 by s=5, track now Lost.
        for s in 6..10 {
            t.update(&[], at(s));
        }
        assert_eq!(t.track_count(), 0, "track should retire once the reid window elapses");
    }

    #[test]
    fn reid_resurrects_within_window() {
        let mut t = Tracker::new(StreamId::from("cam-1"), SessionEpoch(0), cfg());
        t.update(&[det(0.0, 0.0)], at(0));
        for s in 1..=5 {
            t.update(&[], at(s));
        }
        assert_eq!(t.track_state(TrackId(1)), Some(TrackState::Lost));
        t.update(&[det(1.0, 1.0)], at(6));
        assert_eq!(t.track_count(), 1);
        assert_eq!(t.track_state(TrackId(1)), Some(TrackState::Tracking));
    }

    #[test]
    fn track_ids_unique_within_session() {
        let mut t = Tracker::new(StreamId::from("cam-1"), SessionEpoch(0), cfg());
        t.update(&[det(0.0, 0.0), det(100.0, 100.0)], at(0));
        assert_eq!(t.track_count(), 2);
    }

    #[test]
    fn degraded_after_repeated_detector_failures() {
        let mut t = Tracker::new(StreamId::from("cam-1"), SessionEpoch(0), cfg());
        assert!(!t.is_degraded());
        t.on_detector_failure(at(0));
        t.on_detector_failure(at(1));
        assert!(!t.is_degraded());
        t.on_detector_failure(at(2));
        assert!(t.is_degraded());
    }
}
