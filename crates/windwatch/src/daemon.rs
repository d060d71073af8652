//! The long-running service.
//!
//! Four workers share one database file, each through its own connection:
//!
//! - **ingest**: reads JSON-lines packets from stdin or a TCP listener and
//!   hands them over a bounded channel to a single buffer writer
//! - **aggregation**: every tick, starts a blocking pass for each device
//!   with pending readings and no pass still running
//! - **delivery**: drains the notification outbox, woken early whenever a
//!   tick queues new events
//! - **maintenance**: prunes the buffer and closes stale downtime windows
//!
//! Workers are stopped through [`WorkerHandle`]s collected in a
//! [`WorkerManager`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregate::{Aggregator, DeviceClaim, DeviceClaims, PassReport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ingest::{IngestCounts, Ingestor};
use crate::notify::delivery::{deliver_pending, DeliveryReport};
use crate::notify::DeliveryChannel;
use crate::retention;
use crate::storage::{self, readings, SharedStorage, Storage};

/// Most lines handed to the buffer writer in one blocking call.
const WRITE_BATCH: usize = 256;

/// Most outbox entries sent per delivery pass.
const DELIVERY_BATCH: usize = 100;

/// The daemon's workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// Packet readers and the buffer writer.
    Ingest,
    /// The aggregation scheduler.
    Aggregation,
    /// The outbox drain.
    Delivery,
    /// Retention and stale-window sweeps.
    Maintenance,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingest => write!(f, "ingest"),
            Self::Aggregation => write!(f, "aggregation"),
            Self::Delivery => write!(f, "delivery"),
            Self::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// A cloneable stop signal for one worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    kind: WorkerKind,
    stop_signal: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl WorkerHandle {
    /// Create a handle for a worker of the given kind.
    #[must_use]
    pub fn new(kind: WorkerKind) -> Self {
        Self {
            kind,
            stop_signal: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Worker kind.
    #[must_use]
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Signal the worker to stop.
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Check if the stop signal has been sent.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }

    /// Resolve once the stop signal has been sent.
    pub async fn stopped(&self) {
        loop {
            // registered before the check so a concurrent stop() is not missed
            let notified = self.wake.notified();
            if self.should_stop() {
                return;
            }
            notified.await;
        }
    }
}

/// Worker handles that are stopped together.
#[derive(Debug, Default)]
pub struct WorkerManager {
    handles: Vec<WorkerHandle>,
}

impl WorkerManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handle of the given kind, keep a copy, and return it.
    pub fn spawn_handle(&mut self, kind: WorkerKind) -> WorkerHandle {
        let handle = WorkerHandle::new(kind);
        self.handles.push(handle.clone());
        handle
    }

    /// Stop all workers.
    pub fn stop_all(&self) {
        for handle in &self.handles {
            debug!(worker = %handle.kind(), "Stopping worker");
            handle.stop();
        }
    }

    /// Number of managed workers.
    #[must_use]
    pub fn count(&self) -> usize {
        self.handles.len()
    }

    /// Check if any worker has not been signaled to stop.
    #[must_use]
    pub fn any_running(&self) -> bool {
        self.handles.iter().any(|h| !h.should_stop())
    }
}

/// Where the daemon reads packets from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestSource {
    /// Newline-delimited packets on stdin.
    Stdin,
    /// Newline-delimited packets on TCP connections to this address.
    Tcp(String),
    /// No packet input; only aggregation, delivery and maintenance run.
    Disabled,
}

impl IngestSource {
    /// TCP when `ingest.listen_addr` is set, stdin otherwise.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        config
            .ingest
            .listen_addr
            .clone()
            .map_or(Self::Stdin, Self::Tcp)
    }
}

/// Totals of the aggregation worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregationTotals {
    /// Device passes completed.
    pub passes: u64,
    /// Aggregates written.
    pub buckets_written: u64,
    /// Readings folded.
    pub readings_folded: u64,
    /// Late readings discarded.
    pub late_discarded: u64,
    /// Notification events queued.
    pub notifications: u64,
    /// Passes stopped by a failing bucket.
    pub failed_passes: u64,
}

impl AggregationTotals {
    fn add(&mut self, report: &PassReport) {
        self.passes += 1;
        self.buckets_written += report.buckets_written as u64;
        self.readings_folded += report.readings_folded as u64;
        self.late_discarded += report.late_discarded as u64;
        self.notifications += report.notifications as u64;
        if report.failure.is_some() {
            self.failed_passes += 1;
        }
    }
}

/// What the daemon did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DaemonSummary {
    /// Ingest counters.
    pub ingest: IngestCounts,
    /// Aggregation totals.
    pub aggregation: AggregationTotals,
    /// Delivery totals.
    pub delivery: DeliveryReport,
    /// Maintenance passes run, including the startup sweep.
    pub maintenance_passes: u64,
}

/// The windwatch service.
pub struct Daemon {
    config: Config,
    channel: Arc<dyn DeliveryChannel>,
}

impl fmt::Debug for Daemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemon")
            .field("database", &self.config.database_path())
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Create a daemon delivering through `channel`.
    #[must_use]
    pub fn new(config: Config, channel: Arc<dyn DeliveryChannel>) -> Self {
        Self { config, channel }
    }

    /// Run until `shutdown` resolves, then stop every worker and wait for
    /// them. Packets already queued for the buffer writer are flushed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened, the TCP listener
    /// cannot be bound, or the startup stale sweep fails. Errors inside a
    /// running worker are logged and the worker carries on.
    pub async fn run(
        self,
        source: IngestSource,
        shutdown: impl Future<Output = ()>,
    ) -> Result<DaemonSummary> {
        let config = self.config;
        let path = config.database_path();
        let busy = config.busy_timeout();
        let open = || -> Result<SharedStorage> {
            Ok(Storage::open_with_timeout(&path, busy)?.into_shared())
        };

        let maintenance_storage = open()?;
        {
            let guard = storage::lock(&maintenance_storage)?;
            let closed = retention::sweep_stale_windows(&guard, config.stale_window(), Utc::now())?;
            info!(stale_windows_closed = closed, "Startup sweep complete");
        }

        let mut manager = WorkerManager::new();
        let outbox = Arc::new(Notify::new());

        // ingest
        let ingest_handle = manager.spawn_handle(WorkerKind::Ingest);
        let ingestor = Arc::new(Ingestor::new(config.bucket_width()));
        let (tx, rx) = mpsc::channel(config.ingest.channel_capacity);
        match source {
            IngestSource::Stdin => spawn_stdin_reader(tx, ingest_handle.clone()),
            IngestSource::Tcp(addr) => {
                let listener = TcpListener::bind(&addr).await?;
                info!(addr = %addr, "Listening for telemetry");
                tokio::spawn(accept_loop(listener, tx, ingest_handle.clone()));
            }
            IngestSource::Disabled => drop(tx),
        }
        let writer = tokio::spawn(buffer_writer(
            open()?,
            Arc::clone(&ingestor),
            rx,
            ingest_handle,
        ));

        let aggregator = Aggregator::from_config(&config);
        let claims = aggregator.claims().clone();
        let pass_path = path.clone();
        let pass: PassRunner = Arc::new(move |claim: &DeviceClaim| {
            let storage = Storage::open_with_timeout(&pass_path, busy)?;
            aggregator.run_claimed(&storage, claim, Utc::now())
        });
        let aggregation = tokio::spawn(aggregation_loop(
            AggregationWorker {
                scheduler: open()?,
                claims,
                pass,
                period: config.tick_interval(),
                outbox: Arc::clone(&outbox),
            },
            manager.spawn_handle(WorkerKind::Aggregation),
        ));

        let delivery = tokio::spawn(delivery_loop(
            open()?,
            Arc::clone(&self.channel),
            config.notifications.delivery_max_attempts,
            config.delivery_retry_interval(),
            outbox,
            manager.spawn_handle(WorkerKind::Delivery),
        ));

        let maintenance = tokio::spawn(maintenance_loop(
            maintenance_storage,
            config.raw_retention(),
            config.stale_window(),
            config.maintenance_interval(),
            manager.spawn_handle(WorkerKind::Maintenance),
        ));

        info!(
            workers = manager.count(),
            database = %path.display(),
            "windwatch running"
        );
        shutdown.await;
        info!("Shutting down");
        manager.stop_all();

        joined(writer.await)?;
        let summary = DaemonSummary {
            ingest: ingestor.stats().snapshot(),
            aggregation: joined(aggregation.await)?,
            delivery: joined(delivery.await)?,
            maintenance_passes: joined(maintenance.await)? + 1,
        };
        info!(
            accepted = summary.ingest.accepted,
            rejected = summary.ingest.rejected(),
            buckets = summary.aggregation.buckets_written,
            delivered = summary.delivery.delivered,
            "windwatch stopped"
        );
        Ok(summary)
    }
}

fn joined<T>(result: std::result::Result<T, JoinError>) -> Result<T> {
    result.map_err(|e| Error::internal(format!("worker task failed: {e}")))
}

/// Read lines on a plain thread so a blocked stdin never holds up runtime
/// shutdown.
fn spawn_stdin_reader(tx: mpsc::Sender<String>, handle: WorkerHandle) {
    std::thread::spawn(move || {
        use std::io::BufRead;
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "Failed to read stdin");
                    break;
                }
            };
            if handle.should_stop() {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
        debug!("Stdin reader finished");
    });
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<String>, handle: WorkerHandle) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = handle.stopped() => break,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        debug!(%peer, "Telemetry connection opened");
        let tx = tx.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            match forward_lines(BufReader::new(stream), &tx, &handle).await {
                Ok(lines) => debug!(%peer, lines, "Telemetry connection closed"),
                Err(e) => warn!(%peer, error = %e, "Telemetry connection failed"),
            }
        });
    }
}

/// Forward non-blank lines from `reader` until EOF, a stop signal, or the
/// writer going away. Returns the number of lines forwarded.
async fn forward_lines<R>(
    reader: R,
    tx: &mpsc::Sender<String>,
    handle: &WorkerHandle,
) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            () = handle.stopped() => break,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        if tx.send(line).await.is_err() {
            break;
        }
        forwarded += 1;
    }
    Ok(forwarded)
}

/// The single buffer writer. Exits once every reader is gone, or on stop
/// after flushing what is already queued.
async fn buffer_writer(
    storage: SharedStorage,
    ingestor: Arc<Ingestor>,
    mut rx: mpsc::Receiver<String>,
    handle: WorkerHandle,
) {
    loop {
        let first = tokio::select! {
            line = rx.recv() => line,
            () = handle.stopped() => None,
        };
        let mut batch: Vec<String> = first.into_iter().collect();
        while batch.len() < WRITE_BATCH {
            match rx.try_recv() {
                Ok(line) => batch.push(line),
                Err(_) => break,
            }
        }
        if batch.is_empty() {
            break;
        }

        let storage = Arc::clone(&storage);
        let ingestor = Arc::clone(&ingestor);
        let written = tokio::task::spawn_blocking(move || -> Result<()> {
            let guard = storage::lock(&storage)?;
            for line in &batch {
                match ingestor.ingest_line(&guard, line) {
                    Ok(_) | Err(Error::Ingest(_)) => {}
                    Err(e) => error!(error = %e, "Failed to buffer reading"),
                }
            }
            Ok(())
        })
        .await;

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Buffer writer failed"),
            Err(e) => error!(error = %e, "Buffer writer task panicked"),
        }
    }
    debug!("Buffer writer finished");
}

/// Runs one pass for a claimed device on a blocking thread.
type PassRunner = Arc<dyn Fn(&DeviceClaim) -> Result<PassReport> + Send + Sync>;

struct AggregationWorker {
    scheduler: SharedStorage,
    claims: DeviceClaims,
    pass: PassRunner,
    period: Duration,
    outbox: Arc<Notify>,
}

impl AggregationWorker {
    /// Spawn a pass for every device with pending readings and no pass running.
    async fn schedule(&self, passes: &mut JoinSet<Result<PassReport>>) {
        let scheduler = Arc::clone(&self.scheduler);
        let devices = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let guard = storage::lock(&scheduler)?;
            readings::devices_with_pending(guard.connection())
        })
        .await;
        let devices = match devices {
            Ok(Ok(devices)) => devices,
            Ok(Err(e)) => {
                error!(error = %e, "Failed to list devices with pending readings");
                return;
            }
            Err(e) => {
                error!(error = %e, "Scheduler task panicked");
                return;
            }
        };

        for device_id in devices {
            let Some(claim) = self.claims.try_claim(&device_id) else {
                debug!(device_id, "Aggregation already running, skipping");
                continue;
            };
            let pass = Arc::clone(&self.pass);
            passes.spawn_blocking(move || pass(&claim));
        }
    }

    fn record(
        &self,
        totals: &mut AggregationTotals,
        outcome: std::result::Result<Result<PassReport>, JoinError>,
    ) {
        match outcome {
            Ok(Ok(report)) => {
                totals.add(&report);
                if report.notifications > 0 {
                    self.outbox.notify_one();
                }
            }
            Ok(Err(e)) => error!(error = %e, "Aggregation pass failed"),
            Err(e) => error!(error = %e, "Aggregation task panicked"),
        }
    }
}

async fn aggregation_loop(worker: AggregationWorker, handle: WorkerHandle) -> AggregationTotals {
    let mut ticker = tokio::time::interval(worker.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut totals = AggregationTotals::default();
    // passes outlive the tick that spawned them; claims keep a device to one
    let mut passes = JoinSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => worker.schedule(&mut passes).await,
            Some(outcome) = passes.join_next(), if !passes.is_empty() => {
                worker.record(&mut totals, outcome);
            }
            () = handle.stopped() => break,
        }
    }

    while let Some(outcome) = passes.join_next().await {
        worker.record(&mut totals, outcome);
    }
    totals
}

async fn delivery_loop(
    storage: SharedStorage,
    channel: Arc<dyn DeliveryChannel>,
    max_attempts: u32,
    period: Duration,
    outbox: Arc<Notify>,
    handle: WorkerHandle,
) -> DeliveryReport {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut totals = DeliveryReport::default();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = outbox.notified() => {}
            () = handle.stopped() => break,
        }
        match deliver_pending(&storage, channel.as_ref(), max_attempts, DELIVERY_BATCH).await {
            Ok(report) => {
                totals.delivered += report.delivered;
                totals.failed += report.failed;
                totals.abandoned += report.abandoned;
            }
            Err(e) => error!(error = %e, "Delivery pass failed"),
        }
    }
    totals
}

async fn maintenance_loop(
    storage: SharedStorage,
    raw_retention: chrono::Duration,
    stale_window: chrono::Duration,
    period: Duration,
    handle: WorkerHandle,
) -> u64 {
    // the startup sweep already covered t = 0
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut passes = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = handle.stopped() => break,
        }
        let storage = Arc::clone(&storage);
        let outcome = tokio::task::spawn_blocking(move || {
            let guard = storage::lock(&storage)?;
            retention::run_maintenance(&guard, raw_retention, stale_window, Utc::now())
        })
        .await;
        match outcome {
            Ok(Ok(_)) => passes += 1,
            Ok(Err(e)) => error!(error = %e, "Maintenance pass failed"),
            Err(e) => error!(error = %e, "Maintenance task panicked"),
        }
    }
    passes
}
