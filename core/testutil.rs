// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Fixtures for deterministic tests: scripted operators, an in-process
//! backend, and helpers for building frames/events without a real camera.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use jiff::Timestamp;

use base::Error;

use crate::backend::{ActiveStream, ReportBackend};
use crate::model::{BBox, Frame, LonLat, StreamId, ViolationReport};
use crate::operators::{
    ClassifyOutput, Detection, IllegalClassifier, Ocr, OcrOutput, OperatorSet, PlateBox,
    PlateDetector, VehicleDetector,
};

/// A scripted response queue: each call pops the front, or repeats the last
/// scripted value forever once the queue is exhausted (so a test can script
/// "fail twice, then succeed" without worrying about exact call counts
/// downstream).
pub struct Script<T> {
    queue: Mutex<VecDeque<T>>,
    fallback: T,
}

impl<T: Clone> Script<T> {
    pub fn new(values: Vec<T>, fallback: T) -> Self {
        Script {
            queue: Mutex::new(values.into()),
            fallback,
        }
    }

    pub fn next(&self) -> T {
        let mut q = self.queue.lock().unwrap();
        q.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

pub struct FakeVehicleDetector(pub Script<Result<Vec<Detection>, FakeErr>>);

impl VehicleDetector for FakeVehicleDetector {
    fn detect(&self, _frame_jpeg: &[u8], _deadline: Timestamp, _now: Timestamp) -> Result<Vec<Detection>, Error> {
        self.0.next().map_err(Into::into)
    }
}

pub struct FakeIllegalClassifier(pub Script<Result<ClassifyOutput, FakeErr>>);

impl IllegalClassifier for FakeIllegalClassifier {
    fn classify(
        &self,
        _vehicle_crop_jpeg: &[u8],
        _deadline: Timestamp,
        _now: Timestamp,
    ) -> Result<ClassifyOutput, Error> {
        self.0.next().map_err(Into::into)
    }
}

pub struct FakePlateDetector(pub Script<Result<Vec<PlateBox>, FakeErr>>);

impl PlateDetector for FakePlateDetector {
    fn detect_plates(
        &self,
        _vehicle_crop_jpeg: &[u8],
        _deadline: Timestamp,
        _now: Timestamp,
    ) -> Result<Vec<PlateBox>, Error> {
        self.0.next().map_err(Into::into)
    }
}

pub struct FakeOcr(pub Script<Result<OcrOutput, FakeErr>>);

impl Ocr for FakeOcr {
    fn read(&self, _plate_crop_jpeg: &[u8], _deadline: Timestamp, _now: Timestamp) -> Result<OcrOutput, Error> {
        self.0.next().map_err(Into::into)
    }
}

/// Minimal stand-in for [`base::Error`] that a test can construct without
/// going through the `failure` context machinery.
#[derive(Clone, Debug)]
pub enum FakeErr {
    Transient,
    Permanent,
}

impl From<FakeErr> for Error {
    fn from(e: FakeErr) -> Error {
        match e {
            FakeErr::Transient => base::format_err_t!(Transient, "scripted transient failure"),
            FakeErr::Permanent => base::format_err_t!(PermanentPayload, "scripted permanent failure"),
        }
    }
}

/// Builds an [`OperatorSet`] where every operator always returns "not
/// illegal" / no plates / no text, the safest default for tests that only
/// care about the tracker's behavior and never expect a report to reach C5.
pub fn benign_operators() -> OperatorSet {
    OperatorSet {
        vehicle_detector: Box::new(FakeVehicleDetector(Script::new(vec![], Ok(vec![])))),
        illegal_classifier: Box::new(FakeIllegalClassifier(Script::new(
            vec![],
            Ok(ClassifyOutput {
                is_illegal: false,
                severity: 0.0,
                zone_type: crate::model::ZoneType::Other,
            }),
        ))),
        plate_detector: Box::new(FakePlateDetector(Script::new(vec![], Ok(vec![])))),
        ocr: Box::new(FakeOcr(Script::new(
            vec![],
            Ok(OcrOutput {
                text: String::new(),
                confidence: 0.0,
                valid_format: false,
            }),
        ))),
    }
}

/// An in-process [`ReportBackend`] recording every report it receives,
/// replaying scripted outcomes so a test can exercise the retry/backoff path
/// without opening a socket.
pub struct FakeBackend {
    pub delivered: Arc<Mutex<Vec<ViolationReport>>>,
    outcomes: Script<Result<(), FakeErr>>,
    streams: Vec<ActiveStream>,
}

impl FakeBackend {
    pub fn new(outcomes: Vec<Result<(), FakeErr>>) -> Self {
        FakeBackend {
            delivered: Arc::new(Mutex::new(Vec::new())),
            outcomes: Script::new(outcomes, Ok(())),
            streams: Vec::new(),
        }
    }

    pub fn with_streams(mut self, streams: Vec<ActiveStream>) -> Self {
        self.streams = streams;
        self
    }
}

impl ReportBackend for FakeBackend {
    async fn active_streams(&self) -> Result<Vec<ActiveStream>, Error> {
        Ok(self.streams.clone())
    }

    async fn report_detection(&self, report: &ViolationReport) -> Result<(), Error> {
        let outcome = self.outcomes.next();
        if outcome.is_ok() {
            self.delivered.lock().unwrap().push(report.clone());
        }
        outcome.map_err(Into::into)
    }
}

pub fn test_frame(stream_id: &str, seq: u64, captured_at: Timestamp) -> Frame {
    Frame {
        stream_id: StreamId::from(stream_id),
        seq,
        captured_at,
        location: LonLat { lon: 127.0, lat: 37.5 },
        location_name: "lot-a".into(),
        width: 640,
        height: 480,
        jpeg_bytes: Arc::from(&b"\xff\xd8\xff\xd9"[..]),
    }
}

pub fn test_bbox(x: f64, y: f64) -> BBox {
    BBox { x, y, w: 40.0, h: 20.0 }
}
