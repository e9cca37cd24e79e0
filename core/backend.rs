// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Backend HTTP client (§6.3): `GET /api/cctvs/active` for stream discovery
//! (C6) and `POST /api/ai/v1/report-detection` for violation delivery (C5).
//! Both run on the async side (tokio tasks per §5's supplemented thread
//! mapping), so this uses `reqwest::Client`, not the blocking client C1
//! uses on its dedicated OS threads.

use std::time::Duration;

use serde::Deserialize;

use base::{format_err_t, Error};

use crate::model::{LonLat, ViolationReport};

/// One entry of `GET /api/cctvs/active`'s response body.
#[derive(Clone, Debug, Deserialize)]
pub struct ActiveStream {
    pub stream_id: String,
    pub url: String,
    pub location: LonLat,
    pub location_name: String,
}

#[derive(Deserialize)]
struct ActiveStreamsResponse {
    streams: Vec<ActiveStream>,
}

/// What C5 and C6 need from the backend. A trait so tests can substitute an
/// in-process fake instead of binding a real socket (§8 test-tooling
/// supplement).
pub trait ReportBackend: Send + Sync + 'static {
    fn active_streams(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ActiveStream>, Error>> + Send;

    fn report_detection(
        &self,
        report: &ViolationReport,
    ) -> impl std::future::Future<Output = Result<(), Error>> + Send;
}

/// Thin wrapper around a `reqwest::Client` pointed at a single base URL.
/// Every method classifies the failure per §7: a connection error or 5xx is
/// `Transient`; a 4xx is `PermanentPayload` (the backend rejected this exact
/// report and resending it unchanged would only repeat the rejection).
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format_err_t!(Internal, "building backend http client: {e}"))?;
        Ok(BackendClient { http, base_url })
    }
}

impl ReportBackend for BackendClient {
    async fn active_streams(&self) -> Result<Vec<ActiveStream>, Error> {
        let url = format!("{}/api/cctvs/active", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| format_err_t!(Transient, "GET {url}: {e}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(classify_status(status, "GET /api/cctvs/active"));
        }
        let body: ActiveStreamsResponse = resp
            .json()
            .await
            .map_err(|e| format_err_t!(Transient, "decoding active streams response: {e}"))?;
        Ok(body.streams)
    }

    async fn report_detection(&self, report: &ViolationReport) -> Result<(), Error> {
        let url = format!(
            "{}/api/ai/v1/report-detection",
            self.base_url.trim_end_matches('/')
        );
        let resp = self
            .http
            .post(&url)
            .json(report)
            .send()
            .await
            .map_err(|e| format_err_t!(Transient, "POST {url}: {e}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(classify_status(status, "POST /api/ai/v1/report-detection"));
        }
        Ok(())
    }
}

fn classify_status(status: reqwest::StatusCode, op: &str) -> Error {
    if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
        format_err_t!(Transient, "{op}: server returned {status}")
    } else if status.is_client_error() {
        format_err_t!(PermanentPayload, "{op}: server returned {status}")
    } else {
        format_err_t!(DegradedExternal, "{op}: unexpected status {status}")
    }
}
