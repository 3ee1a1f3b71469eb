//! Tether core types: the tracked resource, change notifications and the
//! narrow contracts the reconciler drives (sink, fetcher).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod duration;
pub mod policy;

pub use duration::parse_duration;
pub use policy::{RemovalPolicy, RetryPolicy};

/// Data map of the tracked resource (ConfigMap `.data`).
pub type Data = BTreeMap<String, String>;

/// Identifies the remote configuration object. Immutable for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub name: String,
    pub namespace: String,
}

impl ResourceKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Result<Self, TetherError> {
        let name = name.into();
        let namespace = namespace.into();
        if name.trim().is_empty() {
            return Err(TetherError::Configuration("resource name must not be empty".into()));
        }
        if namespace.trim().is_empty() {
            return Err(TetherError::Configuration("resource namespace must not be empty".into()));
        }
        Ok(Self { name, namespace })
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The single key within the resource's data map whose value is tracked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSelector(String);

impl FieldSelector {
    pub fn new(key: impl Into<String>) -> Result<Self, TetherError> {
        let key = key.into();
        if key.is_empty() {
            return Err(TetherError::Configuration("tracked field key must not be empty".into()));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Value of the tracked field; an absent key reads as the empty string.
    pub fn extract(&self, data: &Data) -> String {
        data.get(&self.0).cloned().unwrap_or_default()
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Normalized change notification delivered by the change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNotification {
    Created(Data),
    Updated(Data),
    Removed(Data),
    TransportError(SourceError),
}

impl ChangeNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
            Self::Removed(_) => "removed",
            Self::TransportError(_) => "transport_error",
        }
    }
}

/// Outcome of a bounded-timeout fetch performed on a resync tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncResult {
    Content(String),
    FetchError(SourceError),
}

/// Which source observed a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    Watch,
    Resync,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Watch => "watch",
            Source::Resync => "resync",
        }
    }
}

/// Reconciler lifecycle. `Running -> Terminated` happens only on cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Running,
    Terminated,
}

/// The only mutable state of the reconciler.
///
/// `last_emitted` always equals the content most recently handed to
/// [`Sink::write`] (or is `None` before the first write, or after a removal
/// under [`RemovalPolicy::Clear`]). `consecutive_failures` counts transient
/// transport failures since the last successful observation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerState {
    pub last_emitted: Option<String>,
    pub consecutive_failures: u32,
}

/// Transport or fetch failure, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool { matches!(self, SourceError::Transient(_)) }

    pub fn class(&self) -> &'static str {
        match self {
            SourceError::Transient(_) => "transient",
            SourceError::Permanent(_) => "permanent",
        }
    }
}

/// Fatal error taxonomy. Every variant ends the process.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("subscription setup: {0}")]
    SubscriptionSetup(String),
    #[error("transport: {0}")]
    Transport(SourceError),
    #[error("change stream closed unexpectedly")]
    StreamClosed,
    #[error("sink: {0}")]
    Sink(#[source] std::io::Error),
}

pub type TetherResult<T> = Result<T, TetherError>;

/// Idempotent full-content writer for a named destination.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Human-readable destination (for logs).
    fn destination(&self) -> &str;

    /// Replace the destination's content with `content`.
    async fn write(&self, content: &str) -> std::io::Result<()>;
}

/// Point-in-time read of the tracked resource. Callers bound it with a timeout.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &ResourceKey) -> Result<Data, SourceError>;
}

pub mod prelude {
    pub use super::{
        ChangeNotification, Data, FieldSelector, Fetcher, Phase, ReconcilerState, RemovalPolicy, ResourceKey,
        ResyncResult, RetryPolicy, Sink, Source, SourceError, TetherError, TetherResult,
    };
}
