// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Cache Sweeper
//!
//! Background task that periodically runs the pressure-triggered stale
//! sweep of the [`SecureCache`]. Writes already trigger a sweep
//! opportunistically; this covers caches that are read-heavy and rarely
//! written.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken` for graceful shutdown, like the
//! escalation dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SecureCache, SweepReport};

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct CacheSweeper {
    cache: Arc<SecureCache>,
    interval: Duration,
}

impl CacheSweeper {
    pub fn new(cache: Arc<SecureCache>) -> Self {
        Self {
            cache,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run the sweep loop until the cancellation token is triggered.
    ///
    /// Should be spawned as a background task:
    /// ```rust,ignore
    /// tokio::spawn(sweeper.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Cache sweeper starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Cache sweeper shutting down");
                return;
            }

            self.sweep_step().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Cache sweeper shutting down");
                    return;
                }
            }
        }
    }

    /// One sweep, run on the blocking pool since store access is synchronous.
    async fn sweep_step(&self) -> Option<SweepReport> {
        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || cache.sweep_if_pressured()).await {
            Ok(Ok(report)) => {
                if report != SweepReport::default() {
                    info!(
                        stale = report.stale_removed,
                        corrupt = report.corrupt_removed,
                        lru = report.lru_evicted,
                        "Cache sweep removed entries"
                    );
                } else {
                    debug!("Cache sweep: nothing to do");
                }
                Some(report)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Cache sweep failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "Cache sweep task panicked");
                None
            }
        }
    }
}
