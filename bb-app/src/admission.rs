//! Sliding-window admission control keyed by (user, command).
//!
//! Each check appends the attempt before evicting and counting, so the call
//! that would make the window hold `limit + 1` entries is the first one
//! rejected. Rejected attempts stay in the window and count against later
//! checks until they age out.

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLimit {
    pub limit: u32,
    pub window_seconds: u64,
}

impl CommandLimit {
    pub fn window(&self) -> TimeDelta {
        let secs = i64::try_from(self.window_seconds).unwrap_or(i64::MAX);
        TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX)
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn expiry(&self, oldest: DateTime<Utc>) -> DateTime<Utc> {
        oldest
            .checked_add_signed(self.window())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Global default plus per-command overrides. Fixed after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitTable {
    pub default: CommandLimit,
    pub overrides: HashMap<String, CommandLimit>,
}

impl LimitTable {
    pub fn get(&self, command: &str) -> CommandLimit {
        self.overrides
            .get(command)
            .copied()
            .unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    pub accepted: bool,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
}

type CommandWindows = HashMap<String, VecDeque<DateTime<Utc>>>;

pub struct AdmissionController {
    limits: LimitTable,
    windows: DashMap<String, CommandWindows>,
}

fn evict(window: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while window.front().is_some_and(|ts| *ts < cutoff) {
        window.pop_front();
    }
}

impl AdmissionController {
    pub fn new(limits: LimitTable) -> Self {
        Self {
            limits,
            windows: DashMap::new(),
        }
    }

    pub fn limits(&self) -> &LimitTable {
        &self.limits
    }

    pub fn check(&self, user_id: &str, command: &str, now: DateTime<Utc>) -> bool {
        let limit = self.limits.get(command);
        let mut user = self.windows.entry(user_id.to_string()).or_default();
        let window = user.entry(command.to_string()).or_default();
        window.push_back(now);
        evict(window, limit.cutoff(now));
        let accepted = window.len() <= limit.limit as usize;
        if !accepted {
            tracing::info!(
                user_id,
                command,
                in_window = window.len(),
                limit = limit.limit,
                "admission rejected"
            );
        }
        accepted
    }

    /// `check` plus the derived queries, evaluated under one timestamp.
    pub fn check_admission(
        &self,
        user_id: &str,
        command: &str,
        now: DateTime<Utc>,
    ) -> AdmissionDecision {
        let accepted = self.check(user_id, command, now);
        let (remaining, reset_time) = self.status(user_id, command, now);
        AdmissionDecision {
            accepted,
            remaining,
            reset_time,
        }
    }

    /// `(remaining, reset_time)` without recording an attempt. Unknown users
    /// are not inserted.
    pub fn status(&self, user_id: &str, command: &str, now: DateTime<Utc>) -> (u32, DateTime<Utc>) {
        let limit = self.limits.get(command);
        let Some(mut user) = self.windows.get_mut(user_id) else {
            return (limit.limit, now);
        };
        let Some(window) = user.get_mut(command) else {
            return (limit.limit, now);
        };
        evict(window, limit.cutoff(now));
        let count = u32::try_from(window.len()).unwrap_or(u32::MAX);
        let remaining = limit.limit.saturating_sub(count);
        let reset_time = if count < limit.limit {
            now
        } else {
            window
                .front()
                .map(|oldest| limit.expiry(*oldest))
                .map_or(now, |reset| reset.max(now))
        };
        (remaining, reset_time)
    }

    pub fn remaining(&self, user_id: &str, command: &str, now: DateTime<Utc>) -> u32 {
        self.status(user_id, command, now).0
    }

    pub fn reset_time(&self, user_id: &str, command: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        self.status(user_id, command, now).1
    }

    /// Drops every user whose windows hold nothing newer than `threshold`.
    /// Maintenance only; never called from the admission path.
    pub fn evict_inactive(&self, threshold: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, commands| {
            commands
                .values()
                .any(|window| window.back().is_some_and(|ts| *ts > threshold))
        });
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            tracing::debug!(removed, "evicted inactive admission state");
        }
        removed
    }

    pub fn tracked_users(&self) -> usize {
        self.windows.len()
    }
}
