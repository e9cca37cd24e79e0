// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Event Reporter (C5, §4.5). A single async task that accepts reports from
//! every pipeline worker, retries failed deliveries with exponential
//! backoff, and spools both in-flight and permanently-failed records to
//! disk so a crash never silently drops a violation.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use base::clock::Clocks;

use crate::backend::ReportBackend;
use crate::config::ReporterConfig;
use crate::model::{ReporterRecord, ViolationReport};

/// Loads whatever the previous process left spooled on disk. Each line is a
/// [`ReporterRecord`]; a line that fails to parse is logged and skipped
/// rather than aborting startup (§7: spool corruption is degraded, not
/// fatal).
fn load_spool(path: &Path) -> Vec<ReporterRecord> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), %e, "could not open spool, starting empty");
            return Vec::new();
        }
    };
    let mut records = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!(path = %path.display(), lineno, %e, "spool read error, stopping load");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ReporterRecord>(&line) {
            Ok(r) => records.push(r),
            Err(e) => warn!(path = %path.display(), lineno, %e, "skipping malformed spool record"),
        }
    }
    records
}

/// Rewrites the spool file from scratch with the current pending set. Called
/// after every state change; the pending set is bounded by queue/pipeline
/// backpressure, so a full rewrite stays cheap.
fn persist_spool(path: &Path, records: &[ReporterRecord]) {
    let tmp_path = path.with_extension("tmp");
    let result = (|| -> std::io::Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        for r in records {
            let line = serde_json::to_string(r).expect("ReporterRecord always serializes");
            writeln!(f, "{line}")?;
        }
        f.flush()?;
        std::fs::rename(&tmp_path, path)
    })();
    if let Err(e) = result {
        error!(path = %path.display(), %e, "failed to persist reporter spool");
    }
}

fn append_dead_letter(path: &Path, record: &ReporterRecord) {
    let result = (|| -> std::io::Result<()> {
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(record).expect("ReporterRecord always serializes");
        writeln!(f, "{line}")
    })();
    if let Err(e) = result {
        error!(path = %path.display(), %e, "failed to append dead-letter record");
    }
}

/// The C5 dispatcher. Owns the pending/in-flight record set exclusively;
/// nothing else touches the spool files while it runs.
pub struct Reporter<C: Clocks, B: ReportBackend> {
    backend: B,
    cfg: ReporterConfig,
    clocks: C,
    spool_path: PathBuf,
    dead_letter_path: PathBuf,
    pending: Vec<ReporterRecord>,
}

impl<C: Clocks, B: ReportBackend> Reporter<C, B> {
    pub fn new(backend: B, cfg: ReporterConfig, clocks: C) -> Self {
        let spool_path = PathBuf::from(&cfg.spool_path);
        let dead_letter_path = PathBuf::from(&cfg.dead_letter_path);
        let pending = load_spool(&spool_path);
        if !pending.is_empty() {
            info!(count = pending.len(), "reloaded spooled reports from disk");
        }
        Reporter {
            backend,
            cfg,
            clocks,
            spool_path,
            dead_letter_path,
            pending,
        }
    }

    fn persist(&self) {
        persist_spool(&self.spool_path, &self.pending);
    }

    fn enqueue(&mut self, report: ViolationReport) {
        let now = self.clocks.realtime();
        self.pending.push(ReporterRecord::new(report, now));
        self.persist();
    }

    /// Attempts delivery of every record whose `next_retry_at` has passed.
    /// Returns the number still pending afterward.
    async fn drain_due(&mut self) -> usize {
        let now = self.clocks.realtime();
        let mut still_pending = Vec::with_capacity(self.pending.len());
        let mut changed = false;
        for mut record in std::mem::take(&mut self.pending) {
            if record.next_retry_at > now {
                still_pending.push(record);
                continue;
            }
            changed = true;
            match self.backend.report_detection(&record.report).await {
                Ok(()) => {
                    info!(event_id = %record.report.event_id, "violation report delivered");
                }
                Err(e) if e.is_transient() => {
                    record.attempt_count += 1;
                    if record.first_failure_at.is_none() {
                        record.first_failure_at = Some(now);
                    }
                    if record.attempt_count >= self.cfg.max_attempts {
                        warn!(event_id = %record.report.event_id, attempts = record.attempt_count, "giving up, moving to dead letter");
                        append_dead_letter(&self.dead_letter_path, &record);
                    } else {
                        let delay = crate::backoff::delay(
                            record.attempt_count,
                            self.cfg.base_backoff_secs,
                            self.cfg.backoff_factor,
                            self.cfg.max_backoff_secs,
                            self.cfg.jitter,
                        );
                        record.next_retry_at = now
                            + jiff::SignedDuration::try_from(delay)
                                .unwrap_or(jiff::SignedDuration::ZERO);
                        warn!(event_id = %record.report.event_id, attempt = record.attempt_count, ?delay, %e, "delivery failed, will retry");
                        still_pending.push(record);
                    }
                }
                Err(e) => {
                    error!(event_id = %record.report.event_id, %e, "delivery permanently rejected, moving to dead letter");
                    append_dead_letter(&self.dead_letter_path, &record);
                }
            }
        }
        self.pending = still_pending;
        if changed {
            self.persist();
        }
        self.pending.len()
    }

    /// Runs until `shutdown_rx` fires, then keeps draining for up to
    /// `drain_timeout` before returning with whatever remains spooled on
    /// disk for the next process to pick up (§4.6 shutdown sequencing).
    pub async fn run(
        mut self,
        mut report_rx: tokio::sync::mpsc::Receiver<ViolationReport>,
        shutdown_rx: base::shutdown::Receiver,
        drain_timeout: std::time::Duration,
    ) {
        let mut tick = tokio::time::interval(std::time::Duration::from_millis(500));
        let shutdown = shutdown_rx.future();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                maybe_report = report_rx.recv() => {
                    match maybe_report {
                        Some(report) => self.enqueue(report),
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    self.drain_due().await;
                }
            }
        }
        info!("shutdown requested, draining reporter backlog");
        let deadline = self.clocks.realtime()
            + jiff::SignedDuration::try_from(drain_timeout).unwrap_or(jiff::SignedDuration::ZERO);
        while self.clocks.realtime() < deadline {
            // Drain whatever the channel still holds without blocking.
            while let Ok(report) = report_rx.try_recv() {
                self.enqueue(report);
            }
            let remaining = self.drain_due().await;
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        if !self.pending.is_empty() {
            warn!(count = self.pending.len(), "reporter shutting down with records still spooled");
        }
    }
}
