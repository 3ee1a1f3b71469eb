//! Tether reconciler: fans in the push-based change stream and the periodic
//! resync into one deduplicated sequence of sink writes.
//!
//! A single task owns [`ReconcilerState`] and handles exactly one input at a
//! time (cancellation, notification, tick). Both sources go through the same
//! dedup gate, so the sink never sees the same content twice in a row
//! regardless of which source observed it.

#![forbid(unsafe_code)]

mod trigger;

use std::time::Duration;

use metrics::{counter, gauge};
use tether_core::{
    ChangeNotification, Fetcher, FieldSelector, Phase, ReconcilerState, RemovalPolicy, ResourceKey, ResyncResult,
    RetryPolicy, Sink, Source, SourceError, TetherError, TetherResult,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use trigger::ResyncTrigger;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Create the handoff queue between the change stream adapter and the reconciler.
/// Sends block while the queue is full; a capacity of one is the closest to an
/// unbuffered rendezvous.
pub fn handoff(cap: usize) -> (mpsc::Sender<ChangeNotification>, mpsc::Receiver<ChangeNotification>) {
    mpsc::channel(cap.max(1))
}

/// Immutable parameters, fixed at construction.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub key: ResourceKey,
    pub field: FieldSelector,
    pub fetch_timeout: Duration,
    pub removal: RemovalPolicy,
    pub retry: RetryPolicy,
}

impl ReconcilerConfig {
    pub fn new(key: ResourceKey, field: FieldSelector) -> Self {
        Self {
            key,
            field,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            removal: RemovalPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_removal(mut self, removal: RemovalPolicy) -> Self {
        self.removal = removal;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

enum Retry {
    Again,
    Cancelled,
}

pub struct Reconciler<F, S> {
    config: ReconcilerConfig,
    fetcher: F,
    sink: S,
    state: ReconcilerState,
    phase: Phase,
}

impl<F: Fetcher, S: Sink> Reconciler<F, S> {
    pub fn new(config: ReconcilerConfig, fetcher: F, sink: S) -> Self {
        Self { config, fetcher, sink, state: ReconcilerState::default(), phase: Phase::Running }
    }

    pub fn config(&self) -> &ReconcilerConfig { &self.config }
    pub fn state(&self) -> &ReconcilerState { &self.state }
    pub fn phase(&self) -> Phase { self.phase }
    pub fn sink(&self) -> &S { &self.sink }

    pub fn last_emitted(&self) -> Option<&str> { self.state.last_emitted.as_deref() }

    /// Wait-and-dispatch loop.
    ///
    /// Returns `Ok(())` after cancellation (phase becomes `Terminated`). Any
    /// fatal condition returns `Err` and leaves the phase untouched; the caller
    /// is expected to end the process. Both the queue receiver and the timer
    /// are released before returning.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
        mut notifications: mpsc::Receiver<ChangeNotification>,
        mut resync: ResyncTrigger,
    ) -> TetherResult<()> {
        info!(
            resource = %self.config.key,
            field = %self.config.field,
            destination = %self.sink.destination(),
            resync = ?resync.period(),
            "reconciler running"
        );
        let res = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                maybe = notifications.recv() => {
                    let step = match maybe {
                        Some(n) => self.handle_notification(n, &cancel).await,
                        None => Err(TetherError::StreamClosed),
                    };
                    if let Err(e) = step { break Err(e); }
                }
                _ = resync.tick() => {
                    if let Err(e) = self.handle_tick(&cancel).await { break Err(e); }
                }
            }
        };

        notifications.close();
        drop(notifications);
        resync.stop();

        match &res {
            Ok(()) => {
                self.phase = Phase::Terminated;
                info!(last_emitted_bytes = ?self.state.last_emitted.as_ref().map(|v| v.len()), "shutting down");
            }
            Err(e) => error!(error = %e, "reconciler failed"),
        }
        res
    }

    /// Handle one change stream notification.
    pub async fn handle_notification(&mut self, n: ChangeNotification, cancel: &CancellationToken) -> TetherResult<()> {
        match n {
            ChangeNotification::Created(data) | ChangeNotification::Updated(data) => {
                let value = self.config.field.extract(&data);
                self.observe(value, Source::Watch).await.map(|_| ())
            }
            ChangeNotification::Removed(_) => {
                counter!("tether_removed_total", 1u64);
                match self.config.removal {
                    RemovalPolicy::Ignore => debug!(resource = %self.config.key, "resource removed; ignoring"),
                    RemovalPolicy::Clear => {
                        info!(resource = %self.config.key, "resource removed; clearing last emitted value");
                        self.state.last_emitted = None;
                    }
                }
                Ok(())
            }
            ChangeNotification::TransportError(err) => self.on_failure(err, Source::Watch, cancel).await.map(|_| ()),
        }
    }

    /// Handle one resync tick: fetch, retrying transient failures within budget,
    /// then pass the content through the dedup gate.
    pub async fn handle_tick(&mut self, cancel: &CancellationToken) -> TetherResult<()> {
        info!(resource = %self.config.key, "tick");
        loop {
            match self.resync().await {
                ResyncResult::Content(value) => return self.observe(value, Source::Resync).await.map(|_| ()),
                ResyncResult::FetchError(err) => match self.on_failure(err, Source::Resync, cancel).await? {
                    Retry::Again => continue,
                    Retry::Cancelled => return Ok(()),
                },
            }
        }
    }

    /// Bounded-timeout fetch of the tracked field. The deadline is dropped
    /// together with the fetch future whichever finishes first.
    pub async fn resync(&self) -> ResyncResult {
        let timeout = self.config.fetch_timeout;
        match tokio::time::timeout(timeout, self.fetcher.fetch(&self.config.key)).await {
            Ok(Ok(data)) => ResyncResult::Content(self.config.field.extract(&data)),
            Ok(Err(e)) => ResyncResult::FetchError(e),
            Err(_) => ResyncResult::FetchError(SourceError::Transient(format!("fetch timed out after {:?}", timeout))),
        }
    }

    /// Dedup gate. Returns whether the sink was written.
    async fn observe(&mut self, value: String, source: Source) -> TetherResult<bool> {
        self.state.consecutive_failures = 0;
        counter!("tether_observations_total", 1u64, "source" => source.as_str());
        if self.state.last_emitted.as_deref() == Some(value.as_str()) {
            debug!(source = source.as_str(), "data unchanged");
            counter!("tether_unchanged_total", 1u64, "source" => source.as_str());
            return Ok(false);
        }
        self.sink.write(&value).await.map_err(TetherError::Sink)?;
        info!(destination = %self.sink.destination(), bytes = value.len(), source = source.as_str(), "writing file");
        counter!("tether_writes_total", 1u64, "source" => source.as_str());
        gauge!("tether_last_write_bytes", value.len() as f64);
        self.state.last_emitted = Some(value);
        Ok(true)
    }

    async fn on_failure(&mut self, err: SourceError, source: Source, cancel: &CancellationToken) -> TetherResult<Retry> {
        counter!("tether_failures_total", 1u64, "source" => source.as_str(), "class" => err.class());
        if !err.is_transient() {
            return Err(TetherError::Transport(err));
        }
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        let attempt = self.state.consecutive_failures;
        if !self.config.retry.allows(attempt) {
            warn!(attempt, max_retries = self.config.retry.max_retries, "retry budget exhausted");
            return Err(TetherError::Transport(err));
        }
        let delay = self.config.retry.backoff(attempt);
        warn!(error = %err, source = source.as_str(), attempt, delay_ms = delay.as_millis() as u64, "transient failure; backing off");
        tokio::select! {
            _ = cancel.cancelled() => Ok(Retry::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(Retry::Again),
        }
    }
}
