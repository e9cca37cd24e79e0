// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Stream Source Adapter (C1, §4.1). The vision models and the actual video
//! sources are external collaborators (§1 Non-goals); this module only
//! defines the pull interface C2 consumes and the handful of source kinds
//! that produce already-encoded JPEG frames for it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use jiff::Timestamp;
use tracing::warn;

use crate::config::{SourceKind, StreamConfig};
use crate::model::{Frame, LonLat, SessionEpoch, StreamId};
use base::{Error, ErrorKind};

/// Outcome of one `next_frame` pull.
pub enum PullOutcome {
    Frame(Frame),
    Ended,
    TransientError(Error),
}

/// Pull interface C2 drives. Implementations keep no more than one frame of
/// read-ahead; backpressure is the caller controlling its own pull rate.
pub trait Stream: Send {
    fn next_frame(&mut self, deadline: Timestamp, now_fn: &dyn Fn() -> Timestamp) -> PullOutcome;

    /// Frames dropped (overwritten before being pulled) since the last call.
    /// Always 0 for paced file-backed sources; meaningful for `live_http`.
    fn frame_drops(&mut self) -> u64;
}

/// Opens a [`Stream`] for a configured source. One instance per stream;
/// reopened (with an incremented [`SessionEpoch`]) on `ENDED` when looping or
/// after backoff when the open itself fails transiently.
pub trait Opener: Send + Sync {
    fn open(&self, cfg: &StreamConfig, epoch: SessionEpoch) -> Result<Box<dyn Stream>, Error>;
}

/// Default opener, dispatching on [`SourceKind`].
pub struct DefaultOpener {
    pub http_client: reqwest::blocking::Client,
}

impl DefaultOpener {
    pub fn new(http_timeout: StdDuration) -> Self {
        DefaultOpener {
            http_client: reqwest::blocking::Client::builder()
                .timeout(http_timeout)
                .build()
                .expect("building the blocking http client should not fail"),
        }
    }
}

impl Opener for DefaultOpener {
    fn open(&self, cfg: &StreamConfig, epoch: SessionEpoch) -> Result<Box<dyn Stream>, Error> {
        match cfg.source_type {
            SourceKind::ImageSequence | SourceKind::VideoFile => {
                let dir = cfg.path.as_deref().ok_or_else(|| {
                    base::format_err_t!(Config, "stream {}: missing path", cfg.stream_id)
                })?;
                Ok(Box::new(FrameDirStream::open(dir, cfg, epoch)?))
            }
            SourceKind::LiveHttp => {
                let url = cfg.url.clone().ok_or_else(|| {
                    base::format_err_t!(Config, "stream {}: missing url", cfg.stream_id)
                })?;
                Ok(Box::new(LiveHttpStream::new(
                    self.http_client.clone(),
                    url,
                    cfg,
                    epoch,
                )))
            }
        }
    }
}

/// `image_sequence` and `video_file` both read a directory of sequentially
/// numbered `NNNNNN.jpg` files at a configured pace. Real video-container
/// decoding lives outside this core, treated as a black box; `video_file`
/// streams are expected to have already been split into frame files the
/// same way `image_sequence` ones are hand-authored.
struct FrameDirStream {
    stream_id: StreamId,
    epoch: SessionEpoch,
    dir: PathBuf,
    location: LonLat,
    location_name: String,
    frame_interval: StdDuration,
    looping: bool,
    files: Vec<PathBuf>,
    next_index: usize,
    seq: u64,
    last_emit: Option<Timestamp>,
}

impl FrameDirStream {
    fn open(dir: &str, cfg: &StreamConfig, epoch: SessionEpoch) -> Result<Self, Error> {
        let dir = PathBuf::from(dir);
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|e| base::format_err_t!(Config, "reading {}: {}", dir.display(), e))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
            })
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(base::format_err_t!(
                Config,
                "stream {}: no jpeg frames in {}",
                cfg.stream_id,
                dir.display()
            ));
        }
        Ok(FrameDirStream {
            stream_id: StreamId(cfg.stream_id.clone()),
            epoch,
            dir,
            location: LonLat {
                lon: cfg.lon,
                lat: cfg.lat,
            },
            location_name: cfg.location_name.clone(),
            frame_interval: StdDuration::from_secs_f64(1.0 / cfg.fps.max(0.001)),
            looping: cfg.looping,
            files,
            next_index: 0,
            seq: 0,
            last_emit: None,
        })
    }
}

fn decode_jpeg_dims(bytes: &[u8]) -> (u32, u32) {
    // JPEG SOF0/SOF2 marker scan: good enough to report dimensions for
    // logging/crop math without pulling in an image-decoding dependency
    // `core` has no other use for (the model operators crop pixels, not us).
    let mut i = 2; // skip SOI
    while i + 9 < bytes.len() {
        if bytes[i] != 0xFF {
            i += 1;
            continue;
        }
        let marker = bytes[i + 1];
        if (0xC0..=0xCF).contains(&marker) && marker != 0xC4 && marker != 0xC8 && marker != 0xCC {
            let height = u16::from_be_bytes([bytes[i + 5], bytes[i + 6]]) as u32;
            let width = u16::from_be_bytes([bytes[i + 7], bytes[i + 8]]) as u32;
            return (width, height);
        }
        let len = u16::from_be_bytes([bytes[i + 2], bytes[i + 3]]) as usize;
        i += 2 + len;
    }
    (0, 0)
}

impl Stream for FrameDirStream {
    fn next_frame(&mut self, deadline: Timestamp, now_fn: &dyn Fn() -> Timestamp) -> PullOutcome {
        if self.next_index >= self.files.len() {
            if self.looping {
                self.next_index = 0;
                self.epoch = SessionEpoch(self.epoch.0 + 1);
                self.seq = 0;
            } else {
                return PullOutcome::Ended;
            }
        }
        if let Some(last_emit) = self.last_emit {
            let elapsed = now_fn().duration_since(last_emit);
            if let Ok(elapsed) = StdDuration::try_from(elapsed) {
                if let Some(remaining) = self.frame_interval.checked_sub(elapsed) {
                    std::thread::sleep(remaining);
                }
            }
        }
        let now = now_fn();
        if now >= deadline {
            return PullOutcome::TransientError(base::format_err_t!(
                Transient,
                "stream {}: pull deadline reached",
                self.stream_id
            ));
        }
        let path = &self.files[self.next_index];
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                return PullOutcome::TransientError(base::format_err_t!(
                    Transient,
                    "reading {}: {}",
                    path.display(),
                    e
                ))
            }
        };
        self.next_index += 1;
        self.seq += 1;
        self.last_emit = Some(now);
        let (width, height) = decode_jpeg_dims(&bytes);
        PullOutcome::Frame(Frame {
            stream_id: self.stream_id.clone(),
            seq: self.seq,
            captured_at: now,
            location: self.location,
            location_name: self.location_name.clone(),
            width,
            height,
            jpeg_bytes: std::sync::Arc::from(bytes.into_boxed_slice()),
        })
    }

    fn frame_drops(&mut self) -> u64 {
        0
    }
}

/// `live_http` polls a URL that returns one JPEG snapshot per GET. Only the
/// most recently fetched frame is kept; drops are the count of polls the
/// caller didn't have time to issue relative to the configured fps (an
/// honest proxy, since we don't control the remote encoder's actual rate).
struct LiveHttpStream {
    stream_id: StreamId,
    epoch: SessionEpoch,
    client: reqwest::blocking::Client,
    url: String,
    location: LonLat,
    location_name: String,
    seq: u64,
    drops: u64,
}

impl LiveHttpStream {
    fn new(
        client: reqwest::blocking::Client,
        url: String,
        cfg: &StreamConfig,
        epoch: SessionEpoch,
    ) -> Self {
        LiveHttpStream {
            stream_id: StreamId(cfg.stream_id.clone()),
            epoch,
            client,
            url,
            location: LonLat {
                lon: cfg.lon,
                lat: cfg.lat,
            },
            location_name: cfg.location_name.clone(),
            seq: 0,
            drops: 0,
        }
    }
}

impl Stream for LiveHttpStream {
    fn next_frame(&mut self, deadline: Timestamp, now_fn: &dyn Fn() -> Timestamp) -> PullOutcome {
        let now = now_fn();
        if now >= deadline {
            return PullOutcome::TransientError(base::format_err_t!(
                Transient,
                "stream {}: pull deadline reached",
                self.stream_id
            ));
        }
        let resp = match self.client.get(&self.url).send() {
            Ok(r) => r,
            Err(e) => {
                warn!(stream_id = %self.stream_id, %e, "live_http GET failed");
                return PullOutcome::TransientError(
                    base::format_err_t!(Transient, "GET {}: {}", self.url, e),
                );
            }
        };
        if !resp.status().is_success() {
            return PullOutcome::TransientError(base::format_err_t!(
                Transient,
                "GET {}: status {}",
                self.url,
                resp.status()
            ));
        }
        let bytes = match resp.bytes() {
            Ok(b) => b,
            Err(e) => {
                return PullOutcome::TransientError(base::format_err_t!(
                    Transient,
                    "reading response body: {}",
                    e
                ))
            }
        };
        self.seq += 1;
        let (width, height) = decode_jpeg_dims(&bytes);
        PullOutcome::Frame(Frame {
            stream_id: self.stream_id.clone(),
            seq: self.seq,
            captured_at: now_fn(),
            location: self.location,
            location_name: self.location_name.clone(),
            width,
            height,
            jpeg_bytes: std::sync::Arc::from(bytes.to_vec().into_boxed_slice()),
        })
    }

    fn frame_drops(&mut self) -> u64 {
        std::mem::take(&mut self.drops)
    }
}

/// Opens `cfg` with exponential backoff (base 1s, cap 30s, ±20% jitter) on
/// `TRANSIENT_ERROR` from the opener itself; returns `Err` only if shutdown
/// is requested mid-retry.
pub fn open_with_retry<C: base::clock::Clocks>(
    opener: &dyn Opener,
    cfg: &StreamConfig,
    epoch: SessionEpoch,
    clocks: &C,
    shutdown_rx: &base::shutdown::Receiver,
) -> Result<Box<dyn Stream>, base::shutdown::ShutdownError> {
    let mut attempt: u32 = 0;
    loop {
        match opener.open(cfg, epoch) {
            Ok(s) => return Ok(s),
            Err(e) if e.kind() == ErrorKind::Config => {
                // Not retryable; propagate by blocking until shutdown so the
                // caller's supervision loop can observe and log it once.
                warn!(stream_id = %cfg.stream_id, %e, "stream open failed with a config error");
                shutdown_rx.check()?;
                return Err(base::shutdown::ShutdownError);
            }
            Err(e) => {
                shutdown_rx.check()?;
                attempt += 1;
                let backoff = crate::backoff::delay(attempt, 1.0, 2.0, 30.0, 0.2);
                warn!(stream_id = %cfg.stream_id, %e, attempt, ?backoff, "stream open failed, retrying");
                clocks.sleep(jiff::SignedDuration::try_from(backoff).unwrap());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tiny_jpeg() -> Vec<u8> {
        // Minimal valid-enough JPEG: SOI, a baseline SOF0 claiming 2x1, EOI.
        vec![
            0xFF, 0xD8, // SOI
            0xFF, 0xC0, 0x00, 0x0B, 0x08, 0x00, 0x01, 0x00, 0x02, 0x01, 0x01, 0x11, 0x00,
            0xFF, 0xD9, // EOI
        ]
    }

    #[test]
    fn frame_dir_stream_reads_in_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            let path = dir.path().join(format!("{i:06}.jpg"));
            std::fs::File::create(&path)
                .unwrap()
                .write_all(&tiny_jpeg())
                .unwrap();
        }
        let cfg = StreamConfig {
            stream_id: "cam-1".into(),
            source_type: SourceKind::ImageSequence,
            path: Some(dir.path().to_str().unwrap().to_owned()),
            url: None,
            lat: 37.5,
            lon: 127.0,
            location_name: "lot".into(),
            fps: 5.0,
            looping: false,
        };
        let mut stream = FrameDirStream::open(cfg.path.as_deref().unwrap(), &cfg, SessionEpoch(0)).unwrap();
        let now = Timestamp::UNIX_EPOCH;
        let far_future = now + jiff::SignedDuration::from_secs(3600);
        let mut seqs = vec![];
        loop {
            match stream.next_frame(far_future, &|| now) {
                PullOutcome::Frame(f) => seqs.push(f.seq),
                PullOutcome::Ended => break,
                PullOutcome::TransientError(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn decode_jpeg_dims_reads_sof0() {
        assert_eq!(decode_jpeg_dims(&tiny_jpeg()), (2, 1));
    }
}
