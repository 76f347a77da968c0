//! Run-wide operational counters.
//!
//! One `Statistics` instance is created per simulation run and shared by every
//! device task and every transport event loop through an `Arc`. All updates
//! and snapshots go through a single mutex so no update is lost and no
//! snapshot is torn.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Target used for statistics log lines, so they can be filtered on their own.
pub const STATS_TARGET: &str = "iotsim::stats";

/// Name of one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKey {
    TotalPublished,
    TotalReceived,
    ActivePublishers,
    ActiveSubscribers,
    Errors,
}

impl StatKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatKey::TotalPublished => "total_published",
            StatKey::TotalReceived => "total_received",
            StatKey::ActivePublishers => "active_publishers",
            StatKey::ActiveSubscribers => "active_subscribers",
            StatKey::Errors => "errors",
        }
    }
}

impl fmt::Display for StatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "total_published" => Ok(StatKey::TotalPublished),
            "total_received" => Ok(StatKey::TotalReceived),
            "active_publishers" => Ok(StatKey::ActivePublishers),
            "active_subscribers" => Ok(StatKey::ActiveSubscribers),
            "errors" => Ok(StatKey::Errors),
            other => Err(format!("unknown statistic '{}'", other)),
        }
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub total_published: u64,
    pub total_received: u64,
    pub active_publishers: u64,
    pub active_subscribers: u64,
    pub errors: u64,
}

impl StatisticsSnapshot {
    fn slot(&mut self, key: StatKey) -> &mut u64 {
        match key {
            StatKey::TotalPublished => &mut self.total_published,
            StatKey::TotalReceived => &mut self.total_received,
            StatKey::ActivePublishers => &mut self.active_publishers,
            StatKey::ActiveSubscribers => &mut self.active_subscribers,
            StatKey::Errors => &mut self.errors,
        }
    }

    pub fn get(&self, key: StatKey) -> u64 {
        match key {
            StatKey::TotalPublished => self.total_published,
            StatKey::TotalReceived => self.total_received,
            StatKey::ActivePublishers => self.active_publishers,
            StatKey::ActiveSubscribers => self.active_subscribers,
            StatKey::Errors => self.errors,
        }
    }
}

/// Thread-safe statistics aggregator.
#[derive(Debug, Default)]
pub struct Statistics {
    counters: Mutex<StatisticsSnapshot>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `delta` to one counter. Counters never go below zero.
    pub fn update_stats(&self, key: StatKey, delta: i64) {
        let mut counters = self.counters.lock();
        let slot = counters.slot(key);
        *slot = if delta >= 0 {
            slot.saturating_add(delta as u64)
        } else {
            slot.saturating_sub(delta.unsigned_abs())
        };
    }

    pub fn increment(&self, key: StatKey) {
        self.update_stats(key, 1);
    }

    pub fn decrement(&self, key: StatKey) {
        self.update_stats(key, -1);
    }

    /// Copy all counters under the lock.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        *self.counters.lock()
    }

    pub fn get(&self, key: StatKey) -> u64 {
        self.counters.lock().get(key)
    }

    /// Log the current counters as one block.
    pub fn log_snapshot(&self) {
        log_snapshot(&self.snapshot());
    }
}

pub fn log_snapshot(snapshot: &StatisticsSnapshot) {
    info!(target: STATS_TARGET, "{}", "=".repeat(70));
    info!(target: STATS_TARGET, "REAL-TIME STATISTICS");
    info!(target: STATS_TARGET, "Total messages published: {}", snapshot.total_published);
    info!(target: STATS_TARGET, "Total messages received:  {}", snapshot.total_received);
    info!(target: STATS_TARGET, "Active publishers:        {}", snapshot.active_publishers);
    info!(target: STATS_TARGET, "Active subscribers:       {}", snapshot.active_subscribers);
    info!(target: STATS_TARGET, "Errors:                   {}", snapshot.errors);
    info!(target: STATS_TARGET, "{}", "=".repeat(70));
}

/// Spawn a task that logs a snapshot every `interval` until `shutdown` turns true
/// or its sender is dropped.
pub fn spawn_reporter(
    stats: Arc<Statistics>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        // The first tick fires immediately.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => stats.log_snapshot(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
