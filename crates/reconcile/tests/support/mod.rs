#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_core::{ChangeNotification, Data, Fetcher, FieldSelector, ResourceKey, Sink, SourceError, TetherResult};
use tether_reconcile::{handoff, Reconciler, ReconcilerConfig, ResyncTrigger};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const FIELD: &str = "rules.toml";

pub fn data(value: &str) -> Data {
    Data::from([(FIELD.to_string(), value.to_string()), ("unrelated".to_string(), "noise".to_string())])
}

pub fn config() -> ReconcilerConfig {
    ReconcilerConfig::new(
        ResourceKey::new("traefik-rules", "default").expect("key"),
        FieldSelector::new(FIELD).expect("field"),
    )
}

/// Sink double recording every write.
#[derive(Clone, Default)]
pub struct RecordingSink {
    writes: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self { Self { fail: true, ..Self::default() } }
    pub fn writes(&self) -> Vec<String> { self.writes.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl Sink for RecordingSink {
    fn destination(&self) -> &str { "memory" }

    async fn write(&self, content: &str) -> std::io::Result<()> {
        if self.fail {
            return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"));
        }
        self.writes.lock().unwrap().push(content.to_string());
        Ok(())
    }
}

/// Fetcher double replaying a script; an exhausted script is a permanent failure.
#[derive(Clone, Default)]
pub struct ScriptedFetcher {
    script: Arc<Mutex<VecDeque<Result<Data, SourceError>>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedFetcher {
    pub fn new(script: Vec<Result<Data, SourceError>>) -> Self {
        Self { script: Arc::new(Mutex::new(script.into())), calls: Arc::default() }
    }

    pub fn values(values: &[&str]) -> Self {
        Self::new(values.iter().map(|v| Ok(data(v))).collect())
    }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, _key: &ResourceKey) -> Result<Data, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SourceError::Permanent("script exhausted".into())))
    }
}

pub type Finished = (Reconciler<ScriptedFetcher, RecordingSink>, TetherResult<()>);

/// A reconciler running on its own task, fed through the handoff queue.
pub struct Harness {
    pub tx: mpsc::Sender<ChangeNotification>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Finished>,
}

impl Harness {
    pub fn start(config: ReconcilerConfig, fetcher: ScriptedFetcher, sink: RecordingSink, period: Duration) -> Self {
        let (tx, rx) = handoff(1);
        let cancel = CancellationToken::new();
        let trigger = ResyncTrigger::new(period).expect("trigger");
        let mut rec = Reconciler::new(config, fetcher, sink);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let res = rec.run(token, rx, trigger).await;
            (rec, res)
        });
        Self { tx, cancel, handle }
    }

    pub async fn send(&self, n: ChangeNotification) {
        self.tx.send(n).await.expect("reconciler alive");
    }

    /// Let the reconciler drain whatever is queued without advancing past a tick.
    pub async fn settle(&self) {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    pub async fn shutdown(self) -> Finished {
        self.cancel.cancel();
        self.handle.await.expect("reconciler task")
    }

    pub async fn finish(self) -> Finished {
        self.handle.await.expect("reconciler task")
    }
}
