// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! HTTP clients for the four vision-model operators (§6.1). The models
//! themselves are an external collaborator (§1 Non-goals: "vision models...
//! treated as black-box operators with declared input/output shapes"); this
//! just POSTs the crop/frame bytes to a configured endpoint and decodes the
//! declared response shape, mirroring `source::DefaultOpener`'s use of a
//! blocking client on the same thread that calls it — model calls in C4 are
//! synchronous and deadline-bounded (§5), so there is no async runtime to
//! hand these calls to anyway.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use jiff::Timestamp;
use serde::Deserialize;

use base::{format_err_t, Error};

use crate::config::ModelsConfig;
use crate::operators::{
    check_deadline, ClassifyOutput, Detection, IllegalClassifier, Ocr, OcrOutput, OperatorSet,
    PlateBox, PlateDetector, VehicleDetector,
};

fn remaining(deadline: Timestamp, now: Timestamp) -> StdDuration {
    StdDuration::try_from(deadline.duration_since(now)).unwrap_or(StdDuration::ZERO)
}

struct Inner {
    http: reqwest::blocking::Client,
    base_url: String,
}

impl Inner {
    fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &[u8],
        deadline: Timestamp,
        now: Timestamp,
        op: &'static str,
    ) -> Result<T, Error> {
        check_deadline(now, deadline, op)?;
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let resp = self
            .http
            .post(&url)
            .timeout(remaining(deadline, now))
            .header("content-type", "image/jpeg")
            .body(body.to_vec())
            .send()
            .map_err(|e| format_err_t!(Transient, "{op}: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(if status.is_server_error()
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                || status == reqwest::StatusCode::REQUEST_TIMEOUT
            {
                format_err_t!(Transient, "{op}: server returned {status}")
            } else {
                format_err_t!(PermanentPayload, "{op}: server returned {status}")
            });
        }
        resp.json()
            .map_err(|e| format_err_t!(Transient, "{op}: decoding response: {e}"))
    }
}

/// Handle to the four model endpoints, cheap to clone (an `Arc` around a
/// pooled `reqwest::blocking::Client`). Each producer thread (C1+C2) and each
/// pipeline worker (C4) builds its own operator handles from one `Models`, so
/// no handle is ever shared across threads (§4.4: "each handle is touched by
/// exactly one worker").
#[derive(Clone)]
pub struct Models(Arc<Inner>);

impl Models {
    pub fn new(cfg: &ModelsConfig) -> Result<Self, Error> {
        let http = reqwest::blocking::Client::builder()
            .timeout(StdDuration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| format_err_t!(Internal, "building model http client: {e}"))?;
        Ok(Models(Arc::new(Inner {
            http,
            base_url: cfg.base_url.clone(),
        })))
    }

    pub fn vehicle_detector(&self) -> Box<dyn VehicleDetector> {
        Box::new(VehicleDetectorClient(self.0.clone()))
    }

    /// Builds one of each operator, for a single C4 worker.
    pub fn operator_set(&self) -> OperatorSet {
        OperatorSet {
            vehicle_detector: self.vehicle_detector(),
            illegal_classifier: Box::new(IllegalClassifierClient(self.0.clone())),
            plate_detector: Box::new(PlateDetectorClient(self.0.clone())),
            ocr: Box::new(OcrClient(self.0.clone())),
        }
    }
}

#[derive(Deserialize)]
struct DetectionsResponse {
    detections: Vec<Detection>,
}

struct VehicleDetectorClient(Arc<Inner>);

impl VehicleDetector for VehicleDetectorClient {
    fn detect(
        &self,
        frame_jpeg: &[u8],
        deadline: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<Detection>, Error> {
        let body: DetectionsResponse =
            self.0
                .post("vehicle-detect", frame_jpeg, deadline, now, "vehicle_detect")?;
        Ok(body.detections)
    }
}

struct IllegalClassifierClient(Arc<Inner>);

impl IllegalClassifier for IllegalClassifierClient {
    fn classify(
        &self,
        vehicle_crop_jpeg: &[u8],
        deadline: Timestamp,
        now: Timestamp,
    ) -> Result<ClassifyOutput, Error> {
        self.0
            .post("classify", vehicle_crop_jpeg, deadline, now, "stage_a_classify")
    }
}

#[derive(Deserialize)]
struct PlatesResponse {
    plates: Vec<PlateBox>,
}

struct PlateDetectorClient(Arc<Inner>);

impl PlateDetector for PlateDetectorClient {
    fn detect_plates(
        &self,
        vehicle_crop_jpeg: &[u8],
        deadline: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<PlateBox>, Error> {
        let body: PlatesResponse = self.0.post(
            "detect-plates",
            vehicle_crop_jpeg,
            deadline,
            now,
            "stage_b_plate_detect",
        )?;
        Ok(body.plates)
    }
}

struct OcrClient(Arc<Inner>);

impl Ocr for OcrClient {
    fn read(
        &self,
        plate_crop_jpeg: &[u8],
        deadline: Timestamp,
        now: Timestamp,
    ) -> Result<OcrOutput, Error> {
        self.0.post("ocr", plate_crop_jpeg, deadline, now, "stage_c_ocr")
    }
}
