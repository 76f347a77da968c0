//! Simulation orchestrator.
//!
//! Composes publishers and subscribers into the three run modes. Every device
//! runs on its own task; device failures only show up in the statistics.
//! Configuration errors are reported before any task is spawned.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{RunMode, SimulationConfig};
use crate::error::Result;
use crate::publisher::{DevicePublisher, PublishOutcome, PublisherOptions};
use crate::sensor::{Assignment, Clock, SystemClock};
use crate::stats::{self, StatKey, Statistics, StatisticsSnapshot};
use crate::subscriber::{DeviceSubscriber, SubscriberHandle};
use crate::transport::Transport;

/// Result of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    pub mode: RunMode,
    /// Counters after every device task has ended.
    pub statistics: StatisticsSnapshot,
    pub publishers_launched: usize,
    /// Receive counts of the first subscriber, sorted by device id.
    pub summary: Vec<(String, u64)>,
}

struct RunningSubscribers {
    handles: Vec<SubscriberHandle>,
    tasks: Vec<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl RunningSubscribers {
    fn first_summary(&self) -> Vec<(String, u64)> {
        self.handles
            .first()
            .map(|h| sort_summary(h.get_summary()))
            .unwrap_or_default()
    }
}

/// Runs simulations against one transport.
pub struct Simulation {
    config: SimulationConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
}

impl Simulation {
    pub fn new(config: SimulationConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for reading timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Run one simulation in `mode`.
    ///
    /// `shutdown` ends a subscribers-only run. In the other modes it is
    /// honored between phases: no new publisher is launched and pending
    /// delays are cut short once it fires.
    ///
    /// Only a `true` value cancels. Dropping the sender means no cancellation
    /// will come: phased runs take every delay in full, and a
    /// subscribers-only run lasts until its subscribers end on their own.
    pub async fn run(&self, mode: RunMode, shutdown: watch::Receiver<bool>) -> Result<SimulationReport> {
        self.config.validate(mode)?;
        info!(
            mode = %mode,
            transport = %self.transport.describe(),
            "Simulation starting"
        );

        let stats = Arc::new(Statistics::new());
        let report = match mode {
            RunMode::Full => self.run_full(stats, shutdown).await,
            RunMode::PublishersOnly => self.run_publishers_only(stats, shutdown).await,
            RunMode::SubscribersOnly => self.run_subscribers_only(stats, shutdown).await,
        };
        Ok(report)
    }

    async fn run_full(&self, stats: Arc<Statistics>, mut shutdown: watch::Receiver<bool>) -> SimulationReport {
        info!("RUNNING FULL SIMULATION");

        let subscribers = self.launch_subscribers(&stats);
        sleep_or_shutdown(self.config.settle_delay(), &mut shutdown).await;

        let (reporter_stop, reporter) = self.start_reporter(&stats);
        let outcomes = self.run_publishers(&stats, &mut shutdown).await;

        info!("Waiting for all messages to be received...");
        sleep_or_shutdown(self.config.drain_delay(), &mut shutdown).await;

        let summary = subscribers.first_summary();
        stop_subscribers(subscribers).await;
        stop_reporter(reporter_stop, reporter).await;

        let statistics = stats.snapshot();
        stats::log_snapshot(&statistics);
        log_summary(&summary);
        info!("Simulation complete!");

        SimulationReport {
            mode: RunMode::Full,
            statistics,
            publishers_launched: outcomes.len(),
            summary,
        }
    }

    async fn run_publishers_only(
        &self,
        stats: Arc<Statistics>,
        mut shutdown: watch::Receiver<bool>,
    ) -> SimulationReport {
        info!("RUNNING PUBLISHERS ONLY");

        let outcomes = self.run_publishers(&stats, &mut shutdown).await;
        let statistics = stats.snapshot();
        stats::log_snapshot(&statistics);

        SimulationReport {
            mode: RunMode::PublishersOnly,
            statistics,
            publishers_launched: outcomes.len(),
            summary: Vec::new(),
        }
    }

    async fn run_subscribers_only(
        &self,
        stats: Arc<Statistics>,
        mut shutdown: watch::Receiver<bool>,
    ) -> SimulationReport {
        info!("RUNNING SUBSCRIBERS ONLY");

        let RunningSubscribers {
            handles,
            tasks,
            stop,
        } = self.launch_subscribers(&stats);
        let (reporter_stop, reporter) = self.start_reporter(&stats);
        info!("Listening... (Press Ctrl+C to stop)");

        let all_done = join_all(tasks);
        tokio::pin!(all_done);

        let ended_on_their_own = tokio::select! {
            _ = &mut all_done => true,
            _ = wait_for_shutdown(&mut shutdown) => false,
        };
        if ended_on_their_own {
            warn!("All subscribers ended");
        } else {
            let _ = stop.send(true);
            for result in (&mut all_done).await {
                if let Err(e) = result {
                    error!(error = %e, "Subscriber task failed");
                }
            }
        }
        info!("Subscribers stopped");

        stop_reporter(reporter_stop, reporter).await;
        let summary = handles
            .first()
            .map(|h| sort_summary(h.get_summary()))
            .unwrap_or_default();

        let statistics = stats.snapshot();
        stats::log_snapshot(&statistics);
        log_summary(&summary);

        SimulationReport {
            mode: RunMode::SubscribersOnly,
            statistics,
            publishers_launched: 0,
            summary,
        }
    }

    fn launch_subscribers(&self, stats: &Arc<Statistics>) -> RunningSubscribers {
        let (stop, stop_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.config.num_subscribers);
        let mut tasks = Vec::with_capacity(self.config.num_subscribers);

        for i in 1..=self.config.num_subscribers {
            let subscriber = DeviceSubscriber::new(
                i.to_string(),
                self.transport.clone(),
                &self.config.topic_base,
                self.config.connect_timeout(),
                stats.clone(),
            );
            handles.push(subscriber.handle());
            tasks.push(tokio::spawn(subscriber.run(stop_rx.clone())));
        }
        info!(count = self.config.num_subscribers, "Started subscribers");

        RunningSubscribers {
            handles,
            tasks,
            stop,
        }
    }

    /// Launch all publishers, staggered, and wait for them to finish.
    async fn run_publishers(
        &self,
        stats: &Arc<Statistics>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Vec<PublishOutcome> {
        let config = &self.config;
        info!("Starting simulation for {} devices...", config.num_publishers);
        info!(
            "Each device sends {} messages, every {:?}",
            config.messages_per_device,
            config.interval()
        );
        info!(
            "Publishing to topics under: {}/{{location}}/{{sensor_type}}",
            config.topic_base
        );

        let plan = plan_assignments(config.num_publishers, config.assignments.as_deref());
        let base_options = PublisherOptions::from_config(config);
        let mut tasks = Vec::with_capacity(plan.len());

        for (index, assignment) in plan.into_iter().enumerate() {
            if *shutdown.borrow() {
                warn!(launched = tasks.len(), "Shutdown requested, not launching more publishers");
                break;
            }

            let device_id = (index + 1).to_string();
            let options = PublisherOptions {
                seed: config.seed.map(|s| s.wrapping_add(index as u64)),
                ..base_options.clone()
            };
            let publisher = DevicePublisher::new(
                device_id,
                self.transport.clone(),
                options,
                stats.clone(),
                assignment,
            )
            .with_clock(self.clock.clone());
            tasks.push(tokio::spawn(publisher.run()));

            if !config.launch_stagger().is_zero() {
                tokio::time::sleep(config.launch_stagger()).await;
            }
        }
        info!("Started {} publishers", tasks.len());

        let mut outcomes = Vec::with_capacity(tasks.len());
        for result in join_all(tasks).await {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(error = %e, "Publisher task failed");
                    stats.increment(StatKey::Errors);
                    outcomes.push(PublishOutcome::default());
                }
            }
        }
        info!("All publishers finished!");
        outcomes
    }

    fn start_reporter(&self, stats: &Arc<Statistics>) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (stop, stop_rx) = watch::channel(false);
        let handle = stats::spawn_reporter(stats.clone(), self.config.stats_interval(), stop_rx);
        (stop, handle)
    }
}

/// Device assignment for `num_publishers` devices.
///
/// With explicit pairs, each pair gets `ceil(num_publishers / pairs)` devices
/// in order until `num_publishers` is reached. Without, every device is left
/// to pick its own pair at random.
pub fn plan_assignments(
    num_publishers: usize,
    assignments: Option<&[Assignment]>,
) -> Vec<Option<Assignment>> {
    match assignments {
        Some(pairs) if !pairs.is_empty() => {
            let per_pair = num_publishers.div_ceil(pairs.len());
            pairs
                .iter()
                .flat_map(|a| std::iter::repeat(Some(*a)).take(per_pair))
                .take(num_publishers)
                .collect()
        }
        _ => vec![None; num_publishers],
    }
}

/// Sort a receive summary by device id: numeric ids numerically, ahead of
/// any other ids, which sort lexically.
pub fn sort_summary(summary: HashMap<String, u64>) -> Vec<(String, u64)> {
    let mut entries: Vec<_> = summary.into_iter().collect();
    entries.sort_by(|(a, _), (b, _)| compare_ids(a, b));
    entries
}

fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn log_summary(summary: &[(String, u64)]) {
    if summary.is_empty() {
        return;
    }
    info!("SUMMARY BY DEVICE (from first subscriber):");
    for (device_id, count) in summary {
        info!("  Device {:>3}: Received {:>3} messages", device_id, count);
    }
}

async fn stop_subscribers(subscribers: RunningSubscribers) {
    let _ = subscribers.stop.send(true);
    for result in join_all(subscribers.tasks).await {
        if let Err(e) = result {
            error!(error = %e, "Subscriber task failed");
        }
    }
}

async fn stop_reporter(stop: watch::Sender<bool>, handle: JoinHandle<()>) {
    let _ = stop.send(true);
    if let Err(e) = handle.await {
        error!(error = %e, "Statistics reporter failed");
    }
}

/// Resolves once `shutdown` is true. A dropped sender never cancels.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) {
    if *shutdown.borrow() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = wait_for_shutdown(shutdown) => info!("Shutdown requested, skipping wait"),
    }
}
