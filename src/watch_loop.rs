//! Module C, watch loop.
//!
//! One instance per kind (`Secret`, `ConfigMap`, `Namespace`). Streams
//! events through a bounded channel into a serial consumer that dispatches
//! to registered handlers, and restarts the session on close/error with
//! exponential backoff (spec.md §4.C).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::GatewayResult;
use crate::gateway::{EventStream, Gateway, NamespaceGateway, ResourceEvent};
use crate::kind::MirrorKind;

/// Registered as a handler with a kind's watcher (spec.md §4.E).
#[async_trait]
pub trait ResourceHandler<K>: Send + Sync {
    async fn on_resource(&self, event: ResourceEvent<K>);
    /// Fired once per session close, before the next session opens, so
    /// handlers can clear whatever they cached for this kind.
    async fn on_session_closed(&self);
}

#[async_trait]
pub trait NamespaceHandler: Send + Sync {
    async fn on_namespace(&self, event: ResourceEvent<k8s_openapi::api::core::v1::Namespace>);
    async fn on_session_closed(&self);
}

/// Exponential backoff, 1s -> 30s, reset on a successful (orderly) session
/// close (spec.md §4.C parameters).
struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self { current: min, min, max }
    }

    fn reset(&mut self) {
        self.current = self.min;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

enum SessionOutcome {
    /// Stream ended in an orderly fashion or the session timer fired.
    Closed,
    /// Stream surfaced a transport/unrecoverable error.
    Error,
}

async fn drain_into_handlers<K: MirrorKind>(
    kind_name: &'static str,
    mut stream: EventStream<K>,
    tx: tokio::sync::mpsc::Sender<GatewayResult<ResourceEvent<K>>>,
) {
    // The channel has bounded capacity: `send` blocks (backpressures the
    // watch read) rather than dropping events (spec.md §4.C step 4).
    while let Some(item) = stream.next().await {
        if tx.send(item).await.is_err() {
            debug!(kind = kind_name, "consumer gone, stopping producer");
            break;
        }
    }
}

/// Watches one mirrored kind and hands events to its registered handlers.
pub struct ResourceWatchLoop<K: MirrorKind, G: Gateway<K>> {
    gateway: Arc<G>,
    handlers: Vec<Arc<dyn ResourceHandler<K>>>,
    session_timeout: Duration,
    queue_capacity: usize,
}

impl<K: MirrorKind, G: Gateway<K> + 'static> ResourceWatchLoop<K, G> {
    pub fn new(
        gateway: Arc<G>,
        handlers: Vec<Arc<dyn ResourceHandler<K>>>,
        session_timeout: Duration,
        queue_capacity: usize,
    ) -> Self {
        Self {
            gateway,
            handlers,
            session_timeout,
            queue_capacity,
        }
    }

    /// Runs sessions until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let outcome = self.run_one_session(&shutdown).await;

            for handler in &self.handlers {
                handler.on_session_closed().await;
            }

            match outcome {
                SessionOutcome::Closed => {
                    backoff.reset();
                    info!(kind = K::SPEC.name, "watch session closed, reconnecting");
                }
                SessionOutcome::Error => {
                    warn!(kind = K::SPEC.name, "watch session ended with an error, backing off");
                }
            }

            if shutdown.is_cancelled() {
                return;
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    async fn run_one_session(&self, shutdown: &CancellationToken) -> SessionOutcome {
        let session_scope = CancellationToken::new();
        let linked = shutdown.child_token();

        let timeout_secs = self.session_timeout.as_secs().min(u32::MAX as u64) as u32;
        let stream = self.gateway.watch(timeout_secs);

        let (tx, mut rx) = tokio::sync::mpsc::channel(self.queue_capacity);
        let producer = tokio::spawn(drain_into_handlers(K::SPEC.name, stream, tx));

        let mut outcome = SessionOutcome::Closed;
        let session_timer = tokio::time::sleep(self.session_timeout);
        tokio::pin!(session_timer);

        loop {
            tokio::select! {
                biased;
                _ = linked.cancelled() => {
                    session_scope.cancel();
                    break;
                }
                _ = &mut session_timer => {
                    debug!(kind = K::SPEC.name, "session timer expired");
                    session_scope.cancel();
                    break;
                }
                item = rx.recv() => {
                    match item {
                        Some(Ok(event)) => {
                            for handler in &self.handlers {
                                handler.on_resource(event.clone()).await;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(kind = K::SPEC.name, error = %e, "watch event error");
                            outcome = SessionOutcome::Error;
                            break;
                        }
                        None => break, // producer finished, channel drained
                    }
                }
            }
        }

        producer.abort();
        outcome
    }
}

/// The namespace watch loop; structurally identical to
/// [`ResourceWatchLoop`] but over `NamespaceGateway` since namespaces are
/// never mirrored themselves.
pub struct NamespaceWatchLoop<G: NamespaceGateway> {
    gateway: Arc<G>,
    handlers: Vec<Arc<dyn NamespaceHandler>>,
    session_timeout: Duration,
    queue_capacity: usize,
}

impl<G: NamespaceGateway + 'static> NamespaceWatchLoop<G> {
    pub fn new(
        gateway: Arc<G>,
        handlers: Vec<Arc<dyn NamespaceHandler>>,
        session_timeout: Duration,
        queue_capacity: usize,
    ) -> Self {
        Self {
            gateway,
            handlers,
            session_timeout,
            queue_capacity,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let outcome = self.run_one_session(&shutdown).await;

            for handler in &self.handlers {
                handler.on_session_closed().await;
            }

            match outcome {
                SessionOutcome::Closed => backoff.reset(),
                SessionOutcome::Error => {
                    warn!("namespace watch session ended with an error, backing off");
                }
            }

            if shutdown.is_cancelled() {
                return;
            }
            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    async fn run_one_session(&self, shutdown: &CancellationToken) -> SessionOutcome {
        let linked = shutdown.child_token();
        let timeout_secs = self.session_timeout.as_secs().min(u32::MAX as u64) as u32;
        let stream = self.gateway.watch_namespaces(timeout_secs);

        let (tx, mut rx) = tokio::sync::mpsc::channel(self.queue_capacity);
        let producer = tokio::spawn(drain_into_handlers("Namespace", stream, tx));

        let mut outcome = SessionOutcome::Closed;
        let session_timer = tokio::time::sleep(self.session_timeout);
        tokio::pin!(session_timer);

        loop {
            tokio::select! {
                biased;
                _ = linked.cancelled() => break,
                _ = &mut session_timer => break,
                item = rx.recv() => {
                    match item {
                        Some(Ok(event)) => {
                            for handler in &self.handlers {
                                handler.on_namespace(event.clone()).await;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "namespace watch event error");
                            outcome = SessionOutcome::Error;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        producer.abort();
        outcome
    }
}
