//! Run coordination: ramp-up, stop fan-out and final aggregation.
//!
//! A [`WorkController`] owns one run. Its state lives in a [`RunContext`]
//! shared by `Arc` with every connection worker, so several independent runs
//! can exist in one process.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, info, warn};

use crate::client::Dialer;
use crate::config::Config;
use crate::counter::ByteCounter;
use crate::errors::ConfigError;
use crate::queue::RunQueue;
use crate::report::{OutcomeCounts, RunReport};
use crate::resolve::AddressOverride;
use crate::worker::{run_connection_worker, ConnectionHandle};

/// Upper bound for sending one close frame during stop.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Number of ramp pauses that precede the `n`th (1-based) worker launch.
pub fn ramp_pauses_before(n: usize, rate: usize) -> usize {
    if n == 0 || rate == 0 {
        return 0;
    }
    (n - 1) / rate
}

/// Whether the controller pauses after `launched` workers have been started.
fn should_pause_after(launched: usize, rate: usize, total: usize) -> bool {
    rate > 0 && launched % rate == 0 && launched < total
}

/// State shared between the controller and its workers for one run.
pub struct RunContext {
    config: Config,
    dialer: Dialer,
    connections: RunQueue<ConnectionHandle>,
    counters: RunQueue<Arc<ByteCounter>>,
    stop_tx: mpsc::Sender<()>,
    stop_rx: Mutex<mpsc::Receiver<()>>,
    stop_signals_sent: AtomicUsize,
    stopping: AtomicBool,
    cancel: CancellationToken,
    connected: AtomicUsize,
    dial_failures: AtomicUsize,
    outcomes: Mutex<OutcomeCounts>,
    total_bytes: OnceCell<u64>,
    started_at: Mutex<Option<Instant>>,
    stopped_at: Mutex<Option<Instant>>,
}

impl RunContext {
    fn new(config: Config, dialer: Dialer) -> Self {
        let capacity = config.num_connections;
        let (stop_tx, stop_rx) = mpsc::channel(capacity.max(1));
        Self {
            config,
            dialer,
            connections: RunQueue::new(capacity),
            counters: RunQueue::new(capacity),
            stop_tx,
            stop_rx: Mutex::new(stop_rx),
            stop_signals_sent: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            connected: AtomicUsize::new(0),
            dial_failures: AtomicUsize::new(0),
            outcomes: Mutex::new(OutcomeCounts::default()),
            total_bytes: OnceCell::new(),
            started_at: Mutex::new(None),
            stopped_at: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Resolves once stop has finished closing connections.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Non-blocking check for a per-slot stop signal.
    pub fn take_stop_signal(&self) -> bool {
        match self.stop_rx.lock() {
            Ok(mut rx) => rx.try_recv().is_ok(),
            Err(_) => false,
        }
    }

    /// Publishes a live connection. Hands it back if stop already closed the queue.
    pub fn publish_connection(&self, handle: ConnectionHandle) -> Result<(), ConnectionHandle> {
        self.connections.push(handle)
    }

    /// Publishes a byte counter. Returns false if stop already closed the queue.
    pub fn publish_counter(&self, counter: Arc<ByteCounter>) -> bool {
        self.counters.push(counter).is_ok()
    }

    pub fn record_connected(&self) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn outcomes(&self) -> OutcomeCounts {
        self.outcomes
            .lock()
            .map(|counts| *counts)
            .unwrap_or_default()
    }

    fn mark(slot: &Mutex<Option<Instant>>) {
        if let Ok(mut at) = slot.lock() {
            at.get_or_insert_with(Instant::now);
        }
    }

    fn read(slot: &Mutex<Option<Instant>>) -> Option<Instant> {
        slot.lock().ok().and_then(|at| *at)
    }
}

/// Drives one load test run.
#[derive(Clone)]
pub struct WorkController {
    ctx: Arc<RunContext>,
}

impl WorkController {
    /// Validates `config` and builds the shared dialer, including the
    /// address override when one is configured.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let config = config.normalized()?;
        let dialer = Dialer::new(&config.target_url, config.to_dialer_config()?)?;
        Ok(Self {
            ctx: Arc::new(RunContext::new(config, dialer)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn address_override(&self) -> Option<&Arc<AddressOverride>> {
        self.ctx.dialer.address_override()
    }

    /// True once `stop` has run.
    pub fn is_stopped(&self) -> bool {
        self.ctx.is_stopping()
    }

    /// Stop notifications sent by the stop path.
    pub fn stop_signals_sent(&self) -> usize {
        self.ctx.stop_signals_sent.load(Ordering::SeqCst)
    }

    /// Launches every connection worker, pausing one ramp interval after each
    /// batch of `ramp_rate` launches, then waits for all of them to exit.
    ///
    /// Returns the number of workers launched.
    pub async fn start(&self) -> usize {
        let ctx = &self.ctx;
        let total = ctx.config.num_connections;
        let rate = ctx.config.ramp_rate;

        RunContext::mark(&ctx.started_at);
        ctx.config.log_summary();

        let mut workers = JoinSet::new();
        for index in 0..total {
            workers.spawn(run_connection_worker(Arc::clone(ctx), index));

            let launched = index + 1;
            if should_pause_after(launched, rate, total) {
                debug!(launched, "workers started");
                tokio::select! {
                    _ = time::sleep(ctx.config.ramp_interval) => {}
                    _ = ctx.cancel.cancelled() => {}
                }
            }
        }
        debug!(workers = total, "workers started");

        let mut outcomes = OutcomeCounts::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => outcomes.record(outcome),
                Err(e) => error!(error = %e, "Connection worker panicked"),
            }
        }
        if let Ok(mut shared) = ctx.outcomes.lock() {
            *shared = outcomes;
        }

        RunContext::mark(&ctx.stopped_at);
        debug!(
            connected = ctx.connected.load(Ordering::Relaxed),
            dial_failures = ctx.dial_failures.load(Ordering::Relaxed),
            not_started = outcomes.not_started,
            remote_closed = outcomes.remote_closed,
            read_failed = outcomes.read_failed,
            stopped = outcomes.stopped,
            "All workers finished"
        );
        total
    }

    /// Stops the run. Only the first call does anything; it returns true.
    ///
    /// Sends one stop notification per connection slot, closes the connection
    /// and counter queues, sends a normal-closure frame to every published
    /// connection and finally cancels reads still in flight.
    pub async fn stop(&self) -> bool {
        let ctx = &self.ctx;
        if ctx.stopping.swap(true, Ordering::AcqRel) {
            debug!("Stop already requested");
            return false;
        }
        debug!("stopping");

        let mut sent = 0;
        for _ in 0..ctx.config.num_connections {
            if ctx.stop_tx.try_send(()).is_ok() {
                sent += 1;
            }
        }
        ctx.stop_signals_sent.store(sent, Ordering::SeqCst);

        ctx.connections.close();
        ctx.counters.close();

        let open = ctx.connections.drain().await;
        let closes = open.iter().map(|handle| async move {
            match time::timeout(CLOSE_FRAME_TIMEOUT, handle.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(index = handle.index(), error = %e, "write close"),
                Err(_) => warn!(index = handle.index(), "Timed out sending close frame"),
            }
        });
        join_all(closes).await;

        ctx.cancel.cancel();
        debug!(closed = open.len(), "stopped");
        true
    }

    /// Spawns the duration trigger for `stop`.
    pub fn stop_after(&self, duration: Duration) -> JoinHandle<bool> {
        let controller = self.clone();
        tokio::spawn(async move {
            time::sleep(duration).await;
            debug!(duration = ?duration, "Run duration elapsed");
            controller.stop().await
        })
    }

    /// Spawns the Ctrl-C trigger for `stop`.
    pub fn stop_on_interrupt(&self) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received, stopping");
                    controller.stop().await;
                }
                Err(e) => error!(error = %e, "Failed to listen for interrupt"),
            }
        })
    }

    /// Waits for stop to close the counter queue, then sums every counter.
    pub async fn collect_report(&self) -> RunReport {
        let ctx = &self.ctx;
        let total_bytes = *ctx
            .total_bytes
            .get_or_init(|| async {
                ctx.counters
                    .drain()
                    .await
                    .iter()
                    .map(|counter| counter.total())
                    .sum()
            })
            .await;

        let now = Instant::now();
        let started = RunContext::read(&ctx.started_at).unwrap_or(now);
        let stopped = RunContext::read(&ctx.stopped_at).unwrap_or(now);

        RunReport {
            total_bytes,
            connections: ctx.config.num_connections,
            connected: ctx.connected.load(Ordering::Relaxed),
            dial_failures: ctx.dial_failures.load(Ordering::Relaxed),
            outcomes: ctx.outcomes(),
            elapsed: stopped.saturating_duration_since(started),
        }
    }

    /// Collects the report and prints it to stdout in the configured format.
    pub async fn print_report(&self) -> RunReport {
        let report = self.collect_report().await;
        println!("{}", report.render(self.ctx.config.report_format));
        report
    }
}
