use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::{self, Event};
use metrics::counter;
use tether_core::{ChangeNotification, ResourceKey};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify_watch;

/// Turns raw watcher events for one named ConfigMap into change notifications.
///
/// The watcher does not distinguish creation from modification, so the
/// normalizer remembers whether the object is currently known.
#[derive(Debug)]
pub struct Normalizer {
    name: String,
    known: bool,
}

impl Normalizer {
    pub fn new(key: &ResourceKey) -> Self {
        Self { name: key.name.clone(), known: false }
    }

    fn matches(&self, cm: &ConfigMap) -> bool {
        cm.metadata.name.as_deref() == Some(self.name.as_str())
    }

    fn applied(&mut self, cm: ConfigMap) -> ChangeNotification {
        let data = cm.data.unwrap_or_default();
        if std::mem::replace(&mut self.known, true) {
            ChangeNotification::Updated(data)
        } else {
            ChangeNotification::Created(data)
        }
    }

    pub fn apply(&mut self, event: Result<Event<ConfigMap>, watcher::Error>) -> Option<ChangeNotification> {
        match event {
            Ok(Event::Applied(cm)) => {
                if !self.matches(&cm) {
                    debug!(name = ?cm.metadata.name, "ignoring foreign object");
                    return None;
                }
                Some(self.applied(cm))
            }
            Ok(Event::Deleted(cm)) => {
                if !self.matches(&cm) {
                    return None;
                }
                self.known = false;
                Some(ChangeNotification::Removed(cm.data.unwrap_or_default()))
            }
            Ok(Event::Restarted(list)) => {
                debug!(count = list.len(), "watch restart");
                match list.into_iter().find(|cm| self.matches(cm)) {
                    Some(cm) => Some(self.applied(cm)),
                    None if self.known => {
                        self.known = false;
                        Some(ChangeNotification::Removed(Default::default()))
                    }
                    None => None,
                }
            }
            Err(e) => {
                let classified = classify_watch(&e);
                counter!("tether_transport_errors_total", 1u64, "class" => classified.class());
                warn!(error = %e, class = classified.class(), "watch error");
                Some(ChangeNotification::TransportError(classified))
            }
        }
    }
}

/// Forward normalized notifications into the handoff queue.
///
/// The send blocks while the queue is full. Stops on cancellation, when the
/// watch stream ends, or when the receiver is dropped.
pub async fn pump<S>(stream: S, key: ResourceKey, tx: mpsc::Sender<ChangeNotification>, cancel: CancellationToken)
where
    S: Stream<Item = Result<Event<ConfigMap>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    let mut normalizer = Normalizer::new(&key);
    info!(resource = %key, "change stream started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let Some(event) = next else {
            warn!(resource = %key, "watch stream ended");
            break;
        };
        let Some(notification) = normalizer.apply(event) else { continue };
        debug!(kind = notification.kind(), "forwarding notification");
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(notification) => {
                if sent.is_err() {
                    debug!("handoff receiver dropped");
                    break;
                }
            }
        }
    }
    info!(resource = %key, "change stream stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use kube::error::ErrorResponse;
    use tether_core::SourceError;

    fn key() -> ResourceKey { ResourceKey::new("rules", "default").expect("key") }

    fn cm(name: &str, value: &str) -> ConfigMap {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": name, "namespace": "default" },
            "data": { "rules.toml": value },
        }))
        .expect("configmap")
    }

    fn data(value: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("rules.toml".to_string(), value.to_string())])
    }

    #[test]
    fn first_apply_creates_then_updates() {
        let mut n = Normalizer::new(&key());
        assert_eq!(n.apply(Ok(Event::Applied(cm("rules", "a")))), Some(ChangeNotification::Created(data("a"))));
        assert_eq!(n.apply(Ok(Event::Applied(cm("rules", "b")))), Some(ChangeNotification::Updated(data("b"))));
        assert_eq!(n.apply(Ok(Event::Deleted(cm("rules", "b")))), Some(ChangeNotification::Removed(data("b"))));
        assert_eq!(n.apply(Ok(Event::Applied(cm("rules", "c")))), Some(ChangeNotification::Created(data("c"))));
    }

    #[test]
    fn foreign_objects_are_ignored() {
        let mut n = Normalizer::new(&key());
        assert_eq!(n.apply(Ok(Event::Applied(cm("other", "a")))), None);
        assert_eq!(n.apply(Ok(Event::Deleted(cm("other", "a")))), None);
    }

    #[test]
    fn restart_applies_or_removes() {
        let mut n = Normalizer::new(&key());
        assert_eq!(n.apply(Ok(Event::Restarted(vec![]))), None);
        assert_eq!(
            n.apply(Ok(Event::Restarted(vec![cm("other", "x"), cm("rules", "a")]))),
            Some(ChangeNotification::Created(data("a")))
        );
        assert_eq!(n.apply(Ok(Event::Restarted(vec![cm("rules", "a")]))), Some(ChangeNotification::Updated(data("a"))));
        assert_eq!(n.apply(Ok(Event::Restarted(vec![]))), Some(ChangeNotification::Removed(BTreeMap::new())));
    }

    #[test]
    fn configmap_without_data_yields_empty_map() {
        let mut n = Normalizer::new(&key());
        let bare: ConfigMap = serde_json::from_value(serde_json::json!({ "metadata": { "name": "rules" } })).expect("cm");
        assert_eq!(n.apply(Ok(Event::Applied(bare))), Some(ChangeNotification::Created(BTreeMap::new())));
    }

    #[test]
    fn watch_errors_become_transport_errors() {
        let mut n = Normalizer::new(&key());
        let gone = ErrorResponse { status: "Failure".into(), message: "too old".into(), reason: "Expired".into(), code: 410 };
        match n.apply(Err(watcher::Error::WatchError(gone))) {
            Some(ChangeNotification::TransportError(SourceError::Transient(_))) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn pump_forwards_in_order_until_stream_ends() {
        let (tx, mut rx) = mpsc::channel(1);
        let events = vec![
            Ok(Event::Applied(cm("rules", "a"))),
            Ok(Event::Applied(cm("rules", "b"))),
            Ok(Event::Deleted(cm("rules", "b"))),
        ];
        let handle = tokio::spawn(pump(futures::stream::iter(events), key(), tx, CancellationToken::new()));
        let mut out = Vec::new();
        while let Some(n) = rx.recv().await {
            out.push(n);
        }
        handle.await.expect("pump task");
        assert_eq!(
            out,
            vec![
                ChangeNotification::Created(data("a")),
                ChangeNotification::Updated(data("b")),
                ChangeNotification::Removed(data("b")),
            ]
        );
    }

    #[tokio::test]
    async fn pump_stops_on_cancel() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let stream = futures::stream::pending::<Result<Event<ConfigMap>, watcher::Error>>();
        let handle = tokio::spawn(pump(stream, key(), tx, cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.expect("pump did not stop").expect("join");
    }

    #[tokio::test]
    async fn pump_stops_when_blocked_send_is_cancelled() {
        // queue of one, never drained: the second send blocks
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let events = futures::stream::iter(vec![
            Ok(Event::Applied(cm("rules", "a"))),
            Ok(Event::Applied(cm("rules", "b"))),
        ])
        .chain(futures::stream::pending());
        let handle = tokio::spawn(pump(events, key(), tx, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.expect("pump did not stop").expect("join");
    }

    #[tokio::test]
    async fn pump_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let events = futures::stream::iter(vec![Ok(Event::Applied(cm("rules", "a")))]).chain(futures::stream::pending());
        let handle = tokio::spawn(pump(events, key(), tx, CancellationToken::new()));
        tokio::time::timeout(Duration::from_secs(1), handle).await.expect("pump did not stop").expect("join");
    }
}
