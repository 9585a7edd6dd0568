use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use crate::config::DiscoveryConfig;
use crate::mdns::txt::parse_advertisement;
use crate::mdns::{DiscoveryEvent, ServiceAdvertisement, ServiceResolver};
use crate::registry::{LiveRegistry, Upserted};

/// How hard to try resolving a discovered or updated instance.
#[derive(Debug, Clone, Copy)]
pub struct ResolvePolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl From<&DiscoveryConfig> for ResolvePolicy {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            attempts: config.resolve_attempts.max(1),
            backoff: config.resolve_backoff(),
            timeout: config.resolve_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Stored(Upserted),
    /// Resolution never succeeded; the event was dropped
    Unresolved,
    /// A removal or a newer resolution of the same name landed first
    Superseded,
    Removed,
    /// Removal of a name the registry never held
    UnknownRemoved,
}

/// A discovery or update waiting on resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingResolve {
    service_type: String,
    name: String,
    seq: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Begun {
    Resolve(PendingResolve),
    Finished(EventOutcome),
}

/// Per-name event ordering. Only kept while a resolution is in flight.
#[derive(Debug, Default)]
struct NameState {
    next_seq: u64,
    removed_at: u64,
    applied: u64,
    in_flight: usize,
}

/// Turns browse notifications into registry writes.
#[derive(Clone)]
pub struct Listener {
    registry: LiveRegistry,
    resolver: Arc<dyn ServiceResolver>,
    policy: ResolvePolicy,
    names: Arc<Mutex<HashMap<String, NameState>>>,
}

impl Listener {
    pub fn new(registry: LiveRegistry, resolver: Arc<dyn ServiceResolver>, policy: ResolvePolicy) -> Self {
        Self {
            registry,
            resolver,
            policy,
            names: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consume events until the channel closes or shutdown is requested.
    ///
    /// Resolutions run concurrently so one unresponsive instance cannot hold
    /// up the others. A resolution that finishes after a later removal or a
    /// later resolution of the same name is discarded.
    pub async fn run(&self, mut rx: mpsc::Receiver<DiscoveryEvent>, cancel: CancellationToken) {
        let mut inflight = JoinSet::new();

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Begun::Resolve(pending) = self.begin(event) {
                            let listener = self.clone();
                            inflight.spawn(async move { listener.complete(pending).await });
                        }
                    }
                    None => {
                        tracing::warn!("Discovery event channel closed");
                        while let Some(joined) = inflight.join_next().await {
                            log_join(joined);
                        }
                        break;
                    }
                },
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    log_join(joined);
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Listener shutting down");
                    inflight.abort_all();
                    break;
                }
            }
        }
    }

    /// Apply one event to completion.
    pub async fn handle_event(&self, event: DiscoveryEvent) -> EventOutcome {
        match self.begin(event) {
            Begun::Resolve(pending) => self.complete(pending).await,
            Begun::Finished(outcome) => outcome,
        }
    }

    /// Order the event against others for the same name. Removals take effect
    /// here; discoveries and updates come back as a pending resolution.
    pub fn begin(&self, event: DiscoveryEvent) -> Begun {
        let mut names = self.names();
        match event {
            DiscoveryEvent::Discovered { service_type, name }
            | DiscoveryEvent::Updated { service_type, name } => {
                let state = names.entry(name.clone()).or_default();
                state.next_seq += 1;
                state.in_flight += 1;
                Begun::Resolve(PendingResolve { service_type, name, seq: state.next_seq })
            }
            DiscoveryEvent::Removed { name, .. } => {
                if let Some(state) = names.get_mut(&name) {
                    state.next_seq += 1;
                    state.removed_at = state.next_seq;
                }
                let outcome = match self.registry.remove(&name) {
                    Some(_) => {
                        tracing::info!("Device removed: {}", name);
                        EventOutcome::Removed
                    }
                    None => EventOutcome::UnknownRemoved,
                };
                Begun::Finished(outcome)
            }
        }
    }

    /// Resolve a pending event and store it unless it was superseded meanwhile.
    pub async fn complete(&self, pending: PendingResolve) -> EventOutcome {
        // The registry lock is not held while resolving
        let resolved = self.resolve_with_retry(&pending.service_type, &pending.name).await;

        let mut names = self.names();
        let current = match names.get_mut(&pending.name) {
            Some(state) => {
                state.in_flight = state.in_flight.saturating_sub(1);
                let current = pending.seq > state.removed_at && pending.seq > state.applied;
                if current && resolved.is_some() {
                    state.applied = pending.seq;
                }
                if state.in_flight == 0 {
                    names.remove(&pending.name);
                }
                current
            }
            None => true,
        };

        let Some(adv) = resolved else {
            tracing::warn!(
                "Dropping {}: no service info after {} attempts",
                pending.name,
                self.policy.attempts
            );
            return EventOutcome::Unresolved;
        };
        if !current {
            tracing::debug!("Discarding stale resolution of {}", pending.name);
            return EventOutcome::Superseded;
        }

        // Still under the ordering lock so a removal cannot slip in between
        let desc = parse_advertisement(&adv, Utc::now());
        let ip = desc.ip.clone().unwrap_or_else(|| "-".to_string());
        let upserted = self.registry.upsert(desc);
        drop(names);

        match upserted {
            Upserted::Created => tracing::info!("Device discovered: {} at {}", pending.name, ip),
            Upserted::Replaced => tracing::debug!("Device updated: {} at {}", pending.name, ip),
        }
        tracing::debug!("Total devices in registry: {}", self.registry.len());
        EventOutcome::Stored(upserted)
    }

    fn names(&self) -> MutexGuard<'_, HashMap<String, NameState>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn resolve_with_retry(&self, service_type: &str, name: &str) -> Option<ServiceAdvertisement> {
        for attempt in 1..=self.policy.attempts {
            if let Some(adv) = self
                .resolver
                .resolve(service_type, name, self.policy.timeout)
                .await
            {
                return Some(adv);
            }
            tracing::debug!("Resolve attempt {}/{} for {} failed", attempt, self.policy.attempts, name);
            if attempt < self.policy.attempts {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }
        None
    }
}

fn log_join(joined: Result<EventOutcome, JoinError>) {
    if let Err(e) = joined {
        tracing::error!("Resolve task failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::fake::{advertisement, FakeResolver, SERVICE_TYPE};

    fn policy() -> ResolvePolicy {
        ResolvePolicy {
            attempts: 3,
            backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(3),
        }
    }

    fn discovered(name: &str) -> DiscoveryEvent {
        DiscoveryEvent::Discovered { service_type: SERVICE_TYPE.to_string(), name: name.to_string() }
    }

    fn updated(name: &str) -> DiscoveryEvent {
        DiscoveryEvent::Updated { service_type: SERVICE_TYPE.to_string(), name: name.to_string() }
    }

    fn removed(name: &str) -> DiscoveryEvent {
        DiscoveryEvent::Removed { service_type: SERVICE_TYPE.to_string(), name: name.to_string() }
    }

    #[tokio::test]
    async fn test_discover_parses_into_registry() {
        let resolver = Arc::new(FakeResolver::new());
        resolver.publish(advertisement("a", Some("111222333")));
        let registry = LiveRegistry::new();
        let listener = Listener::new(registry.clone(), resolver, policy());

        let outcome = listener.handle_event(discovered("a._cygnus._tcp.local.")).await;

        assert_eq!(outcome, EventOutcome::Stored(Upserted::Created));
        let desc = registry.get("a._cygnus._tcp.local.").unwrap();
        assert_eq!(desc.identity_key.as_deref(), Some("111222333"));
        assert_eq!(desc.services["modbus"].port, Some(502));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let resolver = Arc::new(FakeResolver::new());
        resolver.publish(advertisement("a", None));
        resolver.fail_next("a._cygnus._tcp.local.", 2);
        let registry = LiveRegistry::new();
        let listener = Listener::new(registry.clone(), resolver.clone(), policy());

        let outcome = listener.handle_event(discovered("a._cygnus._tcp.local.")).await;

        assert_eq!(outcome, EventOutcome::Stored(Upserted::Created));
        assert_eq!(resolver.calls("a._cygnus._tcp.local."), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_event_is_dropped() {
        let resolver = Arc::new(FakeResolver::new());
        let registry = LiveRegistry::new();
        let listener = Listener::new(registry.clone(), resolver.clone(), policy());

        let outcome = listener.handle_event(updated("ghost._cygnus._tcp.local.")).await;

        assert_eq!(outcome, EventOutcome::Unresolved);
        assert_eq!(resolver.calls("ghost._cygnus._tcp.local."), 3);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_is_noop() {
        let registry = LiveRegistry::new();
        let listener = Listener::new(registry.clone(), Arc::new(FakeResolver::new()), policy());

        assert_eq!(
            listener.handle_event(removed("nobody._cygnus._tcp.local.")).await,
            EventOutcome::UnknownRemoved
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_leaves_exactly_live_names() {
        let resolver = Arc::new(FakeResolver::new());
        for name in ["a", "b", "c"] {
            resolver.publish(advertisement(name, None));
        }
        let registry = LiveRegistry::new();
        let listener = Listener::new(registry.clone(), resolver, policy());

        let (tx, rx) = mpsc::channel(16);
        for event in [
            discovered("a._cygnus._tcp.local."),
            discovered("b._cygnus._tcp.local."),
            removed("a._cygnus._tcp.local."),
            discovered("c._cygnus._tcp.local."),
            updated("b._cygnus._tcp.local."),
            removed("c._cygnus._tcp.local."),
            discovered("a._cygnus._tcp.local."),
            discovered("missing._cygnus._tcp.local."),
        ] {
            tx.send(event).await.unwrap();
        }
        drop(tx);

        listener.run(rx, CancellationToken::new()).await;

        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["a._cygnus._tcp.local.", "b._cygnus._tcp.local."]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_instance_does_not_hold_up_others() {
        let resolver = Arc::new(FakeResolver::new());
        resolver.publish(advertisement("b", None));
        let registry = LiveRegistry::new();
        let listener = Listener::new(registry.clone(), resolver, policy());

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { listener.run(rx, cancel).await })
        };

        tx.send(discovered("ghost._cygnus._tcp.local.")).await.unwrap();
        tx.send(discovered("b._cygnus._tcp.local.")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The ghost is still on its first 3s attempt
        assert_eq!(registry.names(), vec!["b._cygnus._tcp.local."]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_wins_over_slower_resolution() {
        let resolver = Arc::new(FakeResolver::new());
        resolver.publish(advertisement("a", None));
        resolver.fail_next("a._cygnus._tcp.local.", 2);
        let registry = LiveRegistry::new();
        let listener = Listener::new(registry.clone(), resolver, policy());

        let (tx, rx) = mpsc::channel(16);
        tx.send(discovered("a._cygnus._tcp.local.")).await.unwrap();
        tx.send(removed("a._cygnus._tcp.local.")).await.unwrap();
        drop(tx);

        listener.run(rx, CancellationToken::new()).await;

        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_resolution_is_superseded() {
        let resolver = Arc::new(FakeResolver::new());
        resolver.publish(advertisement("a", Some("111")));
        let registry = LiveRegistry::new();
        let listener = Listener::new(registry.clone(), resolver.clone(), policy());

        let Begun::Resolve(older) = listener.begin(discovered("a._cygnus._tcp.local.")) else {
            panic!("discovery should wait on resolution");
        };
        let Begun::Resolve(newer) = listener.begin(updated("a._cygnus._tcp.local.")) else {
            panic!("update should wait on resolution");
        };

        assert_eq!(listener.complete(newer).await, EventOutcome::Stored(Upserted::Created));
        assert_eq!(listener.complete(older).await, EventOutcome::Superseded);

        let Begun::Resolve(before_removal) = listener.begin(updated("a._cygnus._tcp.local.")) else {
            panic!("update should wait on resolution");
        };
        assert_eq!(
            listener.begin(removed("a._cygnus._tcp.local.")),
            Begun::Finished(EventOutcome::Removed)
        );
        assert_eq!(listener.complete(before_removal).await, EventOutcome::Superseded);
        assert!(registry.is_empty());

        // Ordering state is dropped once nothing is in flight
        assert!(listener.names().is_empty());
    }
}
