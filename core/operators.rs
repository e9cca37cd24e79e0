// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Trait contracts for the external vision models (§6.1). The supervisor core
//! treats these as black boxes with a declared input/output shape and a
//! deadline; it never decodes pixels or owns model weights itself.

use jiff::Timestamp;
use serde::Deserialize;

use crate::model::{BBox, ZoneType};
use base::Error;

/// A detected vehicle box with confidence, as returned by the vehicle
/// detector over a whole frame.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f64,
}

/// Output of the illegality classifier (stage A).
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ClassifyOutput {
    pub is_illegal: bool,
    pub severity: f64,
    pub zone_type: ZoneType,
}

/// One candidate plate box, as returned by the plate detector (stage B).
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PlateBox {
    pub bbox: BBox,
    pub confidence: f64,
}

/// Output of OCR over a cropped plate patch (stage C).
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct OcrOutput {
    pub text: String,
    pub confidence: f64,
    pub valid_format: bool,
}

/// Every operator call is deadline-bounded; breaching it (or any other
/// failure the model call surfaces) must raise [`base::ErrorKind::Transient`]
/// so the caller can retry or mark the stage unavailable per §4.4.
pub fn check_deadline(now: Timestamp, deadline: Timestamp, op: &'static str) -> Result<(), Error> {
    if now >= deadline {
        return Err(base::format_err_t!(Transient, "{op} exceeded its deadline"));
    }
    Ok(())
}

/// The vehicle detector: whole-frame boxes with confidence.
pub trait VehicleDetector: Send + Sync {
    fn detect(&self, frame_jpeg: &[u8], deadline: Timestamp, now: Timestamp) -> Result<Vec<Detection>, Error>;
}

/// The illegality classifier: operates on a vehicle crop.
pub trait IllegalClassifier: Send + Sync {
    fn classify(
        &self,
        vehicle_crop_jpeg: &[u8],
        deadline: Timestamp,
        now: Timestamp,
    ) -> Result<ClassifyOutput, Error>;
}

/// The plate detector: operates on a vehicle crop.
pub trait PlateDetector: Send + Sync {
    fn detect_plates(
        &self,
        vehicle_crop_jpeg: &[u8],
        deadline: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<PlateBox>, Error>;
}

/// OCR: operates on a plate crop.
pub trait Ocr: Send + Sync {
    fn read(&self, plate_crop_jpeg: &[u8], deadline: Timestamp, now: Timestamp) -> Result<OcrOutput, Error>;
}

/// Bundles one handle of each operator, touched by exactly one worker (§4.4:
/// "each handle is touched by exactly one worker").
pub struct OperatorSet {
    pub vehicle_detector: Box<dyn VehicleDetector>,
    pub illegal_classifier: Box<dyn IllegalClassifier>,
    pub plate_detector: Box<dyn PlateDetector>,
    pub ocr: Box<dyn Ocr>,
}

