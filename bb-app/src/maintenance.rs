//! Periodic housekeeping: idle admission state, stale follow-up buttons and
//! leftover cache files.

use crate::admission::AdmissionController;
use crate::followup::FollowUpRegistry;
use crate::storage;
use chrono::{DateTime, TimeDelta, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(600);
pub const INACTIVE_USER_HOURS: i64 = 24;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted_users: usize,
    pub pruned_follow_ups: usize,
    pub removed_files: usize,
}

pub struct Maintenance {
    admission: Arc<AdmissionController>,
    followups: Arc<FollowUpRegistry>,
    cache_dir: PathBuf,
    retention: Duration,
}

impl Maintenance {
    pub fn new(
        admission: Arc<AdmissionController>,
        followups: Arc<FollowUpRegistry>,
        cache_dir: PathBuf,
        retention: Duration,
    ) -> Self {
        Self {
            admission,
            followups,
            cache_dir,
            retention,
        }
    }

    pub fn start(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        tracing::info!("maintenance task stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.run_once(Utc::now()).await;
                    }
                }
            }
        })
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn run_once(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let threshold = now - TimeDelta::hours(INACTIVE_USER_HOURS);
        let evicted_users = self.admission.evict_inactive(threshold);
        let pruned_follow_ups = self.followups.prune(now);
        let removed_files = match storage::cleanup_cache(&self.cache_dir, self.retention).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(%e, dir = %self.cache_dir.display(), "cache cleanup failed");
                0
            }
        };
        let report = MaintenanceReport {
            evicted_users,
            pruned_follow_ups,
            removed_files,
        };
        tracing::debug!(?report, "maintenance pass finished");
        report
    }
}
