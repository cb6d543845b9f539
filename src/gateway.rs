//! Module B, cluster gateway.
//!
//! A thin, stateless wrapper over `kube::Api<K>` providing the exact
//! capability set from spec.md §4.B: `List`, `Watch`, `Get`, `Patch`,
//! `Create`, `Delete`, plus namespace list/watch. The gateway performs no
//! retries itself (spec.md §4.B), all backoff lives in the watch loop
//! (module C).

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ListParams, Patch as KubePatch, PatchParams, PostParams};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::ResourceExt;

use crate::errors::{GatewayError, GatewayResult};
use crate::kind::{qn_of, MirrorKind};
use crate::qn::Qn;

/// A single typed event out of a watch session (spec.md §4.B/§4.C).
/// `Added` and `Modified` are always handled identically by the reconciler
/// (spec.md §4.E keeps one branch for both); they are kept distinct here
/// only because the wire taxonomy names them separately.
#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

pub type EventStream<K> = Pin<Box<dyn Stream<Item = GatewayResult<ResourceEvent<K>>> + Send>>;

#[async_trait]
pub trait Gateway<K: MirrorKind>: Send + Sync {
    async fn list(&self, namespace: Option<&str>) -> GatewayResult<Vec<K>>;

    /// Opens a streaming watch session. The returned stream ends on orderly
    /// close, timeout, or error, never on its own initiative otherwise.
    fn watch(&self, timeout_secs: u32) -> EventStream<K>;

    async fn get(&self, qn: &Qn) -> GatewayResult<K>;

    async fn patch(&self, qn: &Qn, patch: &json_patch::Patch) -> GatewayResult<()>;

    async fn create(&self, resource: K) -> GatewayResult<()>;

    /// Idempotent: a `NotFound` response is treated as success.
    async fn delete(&self, qn: &Qn) -> GatewayResult<()>;
}

#[async_trait]
pub trait NamespaceGateway: Send + Sync {
    async fn list_namespaces(&self) -> GatewayResult<Vec<Namespace>>;
    fn watch_namespaces(&self, timeout_secs: u32) -> EventStream<Namespace>;
}

/// `kube`-backed implementation of [`Gateway`], used against a real cluster.
pub struct KubeGateway<K: MirrorKind> {
    api: Api<K>,
}

impl<K: MirrorKind> KubeGateway<K> {
    pub fn new(client: kube::Client) -> Self {
        Self { api: Api::all(client) }
    }
}

fn map_watcher_event<K: MirrorKind>(
    event: Result<watcher::Event<K>, watcher::Error>,
) -> Option<GatewayResult<ResourceEvent<K>>> {
    match event {
        Ok(watcher::Event::InitApply(obj)) if !obj.is_filtered_from_watch() => {
            Some(Ok(ResourceEvent::Added(obj)))
        }
        Ok(watcher::Event::Apply(obj)) if !obj.is_filtered_from_watch() => {
            Some(Ok(ResourceEvent::Modified(obj)))
        }
        Ok(watcher::Event::InitApply(_)) | Ok(watcher::Event::Apply(_)) => None,
        Ok(watcher::Event::Delete(obj)) if !obj.is_filtered_from_watch() => {
            Some(Ok(ResourceEvent::Deleted(obj)))
        }
        Ok(watcher::Event::Delete(_)) => None,
        Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
        Err(e) => Some(Err(GatewayError::Transport { message: e.to_string() })),
    }
}

#[async_trait]
impl<K: MirrorKind> Gateway<K> for KubeGateway<K> {
    async fn list(&self, namespace: Option<&str>) -> GatewayResult<Vec<K>> {
        let items = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| GatewayError::from_kube(K::SPEC.name, "*", e))?
            .items;
        Ok(match namespace {
            Some(ns) => items.into_iter().filter(|i| i.namespace().as_deref() == Some(ns)).collect(),
            None => items,
        })
    }

    fn watch(&self, timeout_secs: u32) -> EventStream<K> {
        let config = WatcherConfig::default().timeout(timeout_secs);
        let stream = watcher::watcher(self.api.clone(), config);
        Box::pin(stream.filter_map(|ev| async move { map_watcher_event(ev) }))
    }

    async fn get(&self, qn: &Qn) -> GatewayResult<K> {
        self.api
            .get(&qn.name)
            .await
            .map_err(|e| GatewayError::from_kube(K::SPEC.name, qn.to_string(), e))
    }

    async fn patch(&self, qn: &Qn, patch: &json_patch::Patch) -> GatewayResult<()> {
        self.api
            .patch(&qn.name, &PatchParams::default(), &KubePatch::Json::<K>(patch.clone()))
            .await
            .map(|_| ())
            .map_err(|e| GatewayError::from_kube(K::SPEC.name, qn.to_string(), e))
    }

    async fn create(&self, resource: K) -> GatewayResult<()> {
        let qn = qn_of(&resource).map(|q| q.to_string()).unwrap_or_default();
        self.api
            .create(&PostParams::default(), &resource)
            .await
            .map(|_| ())
            .map_err(|e| GatewayError::from_kube(K::SPEC.name, qn, e))
    }

    async fn delete(&self, qn: &Qn) -> GatewayResult<()> {
        match self.api.delete(&qn.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match GatewayError::from_kube(K::SPEC.name, qn.to_string(), e) {
                GatewayError::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }
}

pub struct KubeNamespaceGateway {
    api: Api<Namespace>,
}

impl KubeNamespaceGateway {
    pub fn new(client: kube::Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait]
impl NamespaceGateway for KubeNamespaceGateway {
    async fn list_namespaces(&self) -> GatewayResult<Vec<Namespace>> {
        Ok(self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| GatewayError::from_kube("Namespace", "*", e))?
            .items)
    }

    fn watch_namespaces(&self, timeout_secs: u32) -> EventStream<Namespace> {
        let config = WatcherConfig::default().timeout(timeout_secs);
        let stream = watcher::watcher(self.api.clone(), config);
        Box::pin(stream.filter_map(|ev| async move {
            match ev {
                Ok(watcher::Event::InitApply(obj)) => Some(Ok(ResourceEvent::Added(obj))),
                Ok(watcher::Event::Apply(obj)) => Some(Ok(ResourceEvent::Modified(obj))),
                Ok(watcher::Event::Delete(obj)) => Some(Ok(ResourceEvent::Deleted(obj))),
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                Err(e) => Some(Err(GatewayError::Transport { message: e.to_string() })),
            }
        }))
    }
}
