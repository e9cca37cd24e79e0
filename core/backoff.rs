// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Exponential backoff with jitter, shared by C1's reopen loop (§4.1) and
//! C5's retry schedule (§4.5): `base × factor^attempt × (1 ± jitter)`.

use std::time::Duration;

use rand::Rng;

/// `attempt` is 1-based (the delay before the *first* retry uses
/// `attempt == 1`).
pub fn delay(attempt: u32, base_secs: f64, factor: f64, cap_secs: f64, jitter: f64) -> Duration {
    let raw = base_secs * factor.powi(attempt.saturating_sub(1) as i32);
    let capped = raw.min(cap_secs);
    let jittered = if jitter > 0.0 {
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        capped * (1.0 + spread)
    } else {
        capped
    };
    Duration::from_secs_f64(jittered.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_geometrically_until_capped() {
        let d1 = delay(1, 1.0, 2.0, 60.0, 0.0);
        let d2 = delay(2, 1.0, 2.0, 60.0, 0.0);
        let d3 = delay(3, 1.0, 2.0, 60.0, 0.0);
        assert_eq!(d1.as_secs_f64(), 1.0);
        assert_eq!(d2.as_secs_f64(), 2.0);
        assert_eq!(d3.as_secs_f64(), 4.0);
        let d_big = delay(20, 1.0, 2.0, 60.0, 0.0);
        assert_eq!(d_big.as_secs_f64(), 60.0);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for attempt in 1..10 {
            let d = delay(attempt, 1.0, 2.0, 60.0, 0.2);
            let nominal = (1.0 * 2f64.powi(attempt as i32 - 1)).min(60.0);
            assert!(d.as_secs_f64() >= nominal * 0.8 - 1e-9);
            assert!(d.as_secs_f64() <= nominal * 1.2 + 1e-9);
        }
    }
}
