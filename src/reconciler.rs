//! Module E, reconciler.
//!
//! One instance per mirrored kind. Registered as a [`ResourceHandler<K>`]
//! with its own kind's watch loop and as a [`NamespaceHandler`] with the
//! namespace watch loop (spec.md §4.E).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::annotations::{full_key, ReflectionProperties, KEY_REFLECTED_AT, KEY_REFLECTED_VERSION};
use crate::errors::GatewayError;
use crate::gateway::{Gateway, ResourceEvent};
use crate::indices::ReflectionIndices;
use crate::kind::{qn_of, resource_version, MirrorKind};
use crate::qn::Qn;
use crate::watch_loop::{NamespaceHandler, ResourceHandler};

/// The set of namespaces currently known to exist, maintained from the
/// namespace watch session. Not one of the spec's four indices; it is
/// bookkeeping the auto fan-out computation needs and the namespace watch
/// is the only component positioned to supply it.
#[derive(Default)]
struct NamespaceSet(RwLock<HashSet<String>>);

impl NamespaceSet {
    fn insert(&self, ns: String) {
        self.0.write().unwrap().insert(ns);
    }

    fn remove(&self, ns: &str) {
        self.0.write().unwrap().remove(ns);
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.read().unwrap().iter().cloned().collect()
    }

    fn clear(&self) {
        self.0.write().unwrap().clear();
    }
}

/// Escapes a single token for use as a JSON Pointer reference segment
/// (RFC 6901 §3): `~` -> `~0`, `/` -> `~1`.
fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn annotation_pointer(suffix: &str) -> String {
    format!("/metadata/annotations/{}", escape_pointer_token(&full_key(suffix)))
}

fn add_op(pointer: &str, value: serde_json::Value) -> json_patch::PatchOperation {
    json_patch::PatchOperation::Add(json_patch::AddOperation {
        path: jsonptr::PointerBuf::parse(pointer).expect("pointer is statically valid"),
        value,
    })
}

/// Builds the RFC 6902 patch Sync applies to a mirror: payload fields plus
/// the two bookkeeping annotations (spec.md §4.E Sync step 1).
fn build_sync_patch<K: MirrorKind>(source: &K, source_rv: &str) -> serde_json::Result<json_patch::Patch> {
    let source_value = serde_json::to_value(source)?;
    let mut ops = Vec::with_capacity(K::SPEC.payload_pointers.len() + 2);
    for pointer in K::SPEC.payload_pointers {
        if let Some(value) = source_value.pointer(pointer) {
            ops.push(add_op(pointer, value.clone()));
        }
    }
    ops.push(add_op(&annotation_pointer(KEY_REFLECTED_VERSION), serde_json::Value::String(source_rv.to_string())));
    ops.push(add_op(&annotation_pointer(KEY_REFLECTED_AT), serde_json::Value::String(Utc::now().to_rfc3339())));
    Ok(json_patch::Patch(ops))
}

/// Builds a fresh auto-mirror object: the source's payload fields under new
/// metadata, with only the reflection bookkeeping annotations set (spec.md
/// §4.E AutoCreate step 1, "no other annotations or labels are copied").
fn build_auto_mirror<K: MirrorKind>(
    source: &K,
    source_qn: &Qn,
    mirror_qn: &Qn,
    source_rv: &str,
) -> serde_json::Result<K> {
    let mut value = serde_json::to_value(source)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
        obj.insert(
            "metadata".to_string(),
            serde_json::json!({
                "namespace": mirror_qn.namespace,
                "name": mirror_qn.name,
                "annotations": crate::annotations::mirror_bookkeeping_annotations(
                    source_qn,
                    source_rv,
                    Utc::now(),
                    true,
                ),
            }),
        );
    }
    serde_json::from_value(value)
}

pub struct Reconciler<K: MirrorKind, G: Gateway<K>> {
    gateway: Arc<G>,
    indices: Arc<ReflectionIndices>,
    namespaces: NamespaceSet,
    /// Last observed `resourceVersion` per source, keyed by QN. The spec's
    /// properties index holds annotation-derived RP only; resourceVersion
    /// lives outside annotations, so it needs its own small cache here.
    source_versions: RwLock<HashMap<Qn, String>>,
}

impl<K: MirrorKind, G: Gateway<K> + 'static> Reconciler<K, G> {
    pub fn new(gateway: Arc<G>, indices: Arc<ReflectionIndices>) -> Self {
        Self {
            gateway,
            indices,
            namespaces: NamespaceSet::default(),
            source_versions: RwLock::new(HashMap::new()),
        }
    }

    fn cached_source_version(&self, source_qn: &Qn) -> Option<String> {
        self.source_versions.read().unwrap().get(source_qn).cloned()
    }

    fn remember_source_version(&self, source_qn: &Qn, rv: String) {
        self.source_versions.write().unwrap().insert(source_qn.clone(), rv);
    }

    async fn resolve_source_version(&self, source_qn: &Qn) -> Option<String> {
        if self.indices.is_not_found(source_qn) {
            return None;
        }
        if let Some(rv) = self.cached_source_version(source_qn) {
            return Some(rv);
        }
        match self.gateway.get(source_qn).await {
            Ok(obj) => {
                let rv = resource_version(&obj);
                if let Some(rv) = &rv {
                    self.remember_source_version(source_qn, rv.clone());
                }
                rv
            }
            Err(GatewayError::NotFound { .. }) => {
                self.indices.mark_not_found(source_qn.clone());
                None
            }
            Err(e) => {
                warn!(source = %source_qn, error = %e, "failed to resolve source version");
                None
            }
        }
    }

    fn versions_differ(&self, source_qn: &Qn, mirror_qn: &Qn) -> bool {
        let mirror_rp = self.indices.properties(mirror_qn);
        let source_rv = self.cached_source_version(source_qn);
        match (mirror_rp, source_rv) {
            (Some(rp), Some(rv)) => rp.reflected_version.as_deref() != Some(rv.as_str()),
            _ => true,
        }
    }

    /// Applies Sync(source, mirror) (spec.md §4.E).
    async fn sync(&self, source_qn: &Qn, mirror_qn: &Qn) {
        let source = match self.gateway.get(source_qn).await {
            Ok(s) => s,
            Err(GatewayError::NotFound { .. }) => {
                self.indices.mark_not_found(source_qn.clone());
                self.unlink_mirror(source_qn, mirror_qn);
                return;
            }
            Err(e) => {
                warn!(source = %source_qn, error = %e, "sync: failed to fetch source");
                return;
            }
        };
        self.indices.clear_not_found(source_qn);
        let Some(rv) = resource_version(&source) else {
            return;
        };
        self.remember_source_version(source_qn, rv.clone());

        let patch = match build_sync_patch(&source, &rv) {
            Ok(p) => p,
            Err(e) => {
                warn!(source = %source_qn, error = %e, "sync: failed to build patch");
                return;
            }
        };

        match self.gateway.patch(mirror_qn, &patch).await {
            Ok(()) => debug!(source = %source_qn, mirror = %mirror_qn, "synced"),
            Err(GatewayError::NotFound { .. }) => self.unlink_mirror(source_qn, mirror_qn),
            Err(GatewayError::Conflict { .. }) => {
                debug!(mirror = %mirror_qn, "sync conflict, will reconcile on next event");
            }
            Err(e) => warn!(mirror = %mirror_qn, error = %e, "sync: patch failed"),
        }
    }

    /// AutoCreate(source, ns) (spec.md §4.E).
    async fn auto_create(&self, source_qn: &Qn, ns: &str) {
        let source = match self.gateway.get(source_qn).await {
            Ok(s) => s,
            Err(GatewayError::NotFound { .. }) => {
                self.indices.mark_not_found(source_qn.clone());
                return;
            }
            Err(e) => {
                warn!(source = %source_qn, error = %e, "auto-create: failed to fetch source");
                return;
            }
        };
        self.indices.clear_not_found(source_qn);
        let Some(rv) = resource_version(&source) else {
            return;
        };
        self.remember_source_version(source_qn, rv.clone());

        let mirror_qn = Qn::new(ns.to_string(), source_qn.name.clone());
        let mirror = match build_auto_mirror(&source, source_qn, &mirror_qn, &rv) {
            Ok(m) => m,
            Err(e) => {
                warn!(source = %source_qn, error = %e, "auto-create: failed to build mirror");
                return;
            }
        };

        match self.gateway.create(mirror).await {
            Ok(()) => {
                self.indices.link_auto(source_qn.clone(), mirror_qn);
            }
            Err(GatewayError::AlreadyExists { .. }) => self.reconcile_existing_auto_target(source_qn, &mirror_qn).await,
            Err(e) => warn!(mirror = %mirror_qn, error = %e, "auto-create: create failed"),
        }
    }

    /// AutoCreate step 2: an object with the target name already exists. If
    /// it is our own prior auto-mirror, adopt it and sync; otherwise it
    /// belongs to the user and is left untouched.
    async fn reconcile_existing_auto_target(&self, source_qn: &Qn, mirror_qn: &Qn) {
        match self.gateway.get(mirror_qn).await {
            Ok(existing) => {
                let rp = ReflectionProperties::parse(existing.meta().annotations.as_ref());
                if rp.auto_reflects && rp.reflects.as_ref() == Some(source_qn) {
                    self.indices.record_properties(mirror_qn.clone(), rp);
                    self.indices.link_auto(source_qn.clone(), mirror_qn.clone());
                    self.sync(source_qn, mirror_qn).await;
                }
            }
            Err(e) => warn!(mirror = %mirror_qn, error = %e, "auto-create: could not inspect existing object"),
        }
    }

    fn unlink_mirror(&self, source_qn: &Qn, mirror_qn: &Qn) {
        self.indices.unlink_direct(source_qn, mirror_qn);
        self.indices.unlink_auto(source_qn, mirror_qn);
        self.indices.remove_properties(mirror_qn);
    }

    async fn delete_auto_mirror(&self, source_qn: &Qn, mirror_qn: &Qn) {
        if let Err(e) = self.gateway.delete(mirror_qn).await {
            warn!(mirror = %mirror_qn, error = %e, "failed to delete auto mirror");
        }
        self.indices.unlink_auto(source_qn, mirror_qn);
        self.indices.remove_properties(mirror_qn);
    }

    async fn handle_mirror_upsert(&self, mirror_qn: Qn, rp: ReflectionProperties, source_qn: Qn) {
        self.indices.record_properties(mirror_qn.clone(), rp.clone());
        if rp.auto_reflects {
            self.indices.link_auto(source_qn.clone(), mirror_qn.clone());
        } else {
            self.indices.link_direct(source_qn.clone(), mirror_qn.clone());
        }

        if let Some(source_rv) = self.resolve_source_version(&source_qn).await {
            if rp.reflected_version.as_deref() != Some(source_rv.as_str()) {
                self.sync(&source_qn, &mirror_qn).await;
            }
        }
    }

    async fn handle_source_upsert(&self, qn: Qn, obj: K, rp: ReflectionProperties) {
        self.indices.record_properties(qn.clone(), rp.clone());
        self.indices.clear_not_found(&qn);
        if let Some(rv) = resource_version(&obj) {
            self.remember_source_version(&qn, rv);
        }

        // Direct fan-out: re-evaluate permission on every known direct mirror.
        for mirror in self.indices.direct_mirrors(&qn) {
            let permitted = rp.allowed && rp.allows_namespace(&qn.namespace, &mirror.namespace);
            if permitted && self.versions_differ(&qn, &mirror) {
                self.sync(&qn, &mirror).await;
            }
            // Not permitted: the mirror is left untouched (spec.md §9 open question).
        }

        // Auto fan-out.
        let auto_have: HashMap<String, Qn> = self
            .indices
            .auto_mirrors(&qn)
            .into_iter()
            .map(|m| (m.namespace.clone(), m))
            .collect();

        if rp.allowed && rp.auto_enabled {
            let targets: HashSet<String> = self
                .namespaces
                .snapshot()
                .into_iter()
                .filter(|ns| rp.auto_allows_namespace(&qn.namespace, ns))
                .collect();

            for ns in &targets {
                if !auto_have.contains_key(ns) {
                    self.auto_create(&qn, ns).await;
                }
            }
            for (ns, mirror) in &auto_have {
                if !targets.contains(ns) {
                    self.delete_auto_mirror(&qn, mirror).await;
                } else if self.versions_differ(&qn, mirror) {
                    self.sync(&qn, mirror).await;
                }
            }
        } else if !auto_have.is_empty() {
            for mirror in auto_have.values() {
                self.delete_auto_mirror(&qn, mirror).await;
            }
        }
    }

    async fn handle_source_deleted(&self, qn: Qn) {
        for mirror in self.indices.auto_mirrors(&qn) {
            self.delete_auto_mirror(&qn, &mirror).await;
        }
        // Direct mirrors are left in place; only the source's own index
        // entries and cached state are removed (spec.md §4.E).
        for mirror in self.indices.direct_mirrors(&qn) {
            self.indices.unlink_direct(&qn, &mirror);
        }
        self.indices.remove_properties(&qn);
        self.indices.clear_not_found(&qn);
        self.source_versions.write().unwrap().remove(&qn);
    }
}

#[async_trait]
impl<K: MirrorKind, G: Gateway<K> + 'static> ResourceHandler<K> for Reconciler<K, G> {
    async fn on_resource(&self, event: ResourceEvent<K>) {
        match event {
            ResourceEvent::Added(obj) | ResourceEvent::Modified(obj) => {
                let Some(qn) = qn_of(&obj) else { return };
                let rp = ReflectionProperties::parse(obj.meta().annotations.as_ref());
                match rp.reflects.clone() {
                    Some(source_qn) if source_qn != qn => self.handle_mirror_upsert(qn, rp, source_qn).await,
                    _ => self.handle_source_upsert(qn, obj, rp).await,
                }
            }
            ResourceEvent::Deleted(obj) => {
                let Some(qn) = qn_of(&obj) else { return };
                let rp = ReflectionProperties::parse(obj.meta().annotations.as_ref());
                match rp.reflects.clone() {
                    Some(source_qn) if source_qn != qn => {
                        self.unlink_mirror(&source_qn, &qn);
                    }
                    _ => self.handle_source_deleted(qn).await,
                }
            }
        }
    }

    async fn on_session_closed(&self) {
        self.indices.clear_all();
        self.source_versions.write().unwrap().clear();
    }
}

#[async_trait]
impl<K: MirrorKind, G: Gateway<K> + 'static> NamespaceHandler for Reconciler<K, G> {
    async fn on_namespace(&self, event: ResourceEvent<Namespace>) {
        match event {
            ResourceEvent::Added(ns) => {
                let name = ns.name_any();
                self.namespaces.insert(name.clone());
                for (source, rp) in self.indices.all_properties() {
                    if rp.allowed && rp.auto_enabled && rp.auto_allows_namespace(&source.namespace, &name) {
                        self.auto_create(&source, &name).await;
                    }
                }
            }
            ResourceEvent::Modified(_) => {}
            ResourceEvent::Deleted(ns) => {
                let name = ns.name_any();
                self.namespaces.remove(&name);
                self.indices.drop_auto_mirrors_in_namespace(&name);
            }
        }
    }

    async fn on_session_closed(&self) {
        // Namespace session closure invalidates auto fan-out decisions for
        // every source, so the full index set is wiped (spec.md §4.E).
        self.indices.clear_all();
        self.namespaces.clear();
        self.source_versions.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::EventStream;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// An in-memory `Gateway<ConfigMap>` double: no real cluster, just a
    /// map of QN to the stored JSON value, so `Sync`/`AutoCreate`/patches
    /// can be exercised end to end (spec.md §8's scenarios call for a test
    /// double rather than a real cluster).
    struct MockGateway {
        objects: RwLock<HashMap<Qn, serde_json::Value>>,
        rv_counter: AtomicU64,
    }

    impl MockGateway {
        fn new() -> Self {
            Self {
                objects: RwLock::new(HashMap::new()),
                rv_counter: AtomicU64::new(0),
            }
        }

        fn next_rv(&self) -> String {
            self.rv_counter.fetch_add(1, Ordering::SeqCst).to_string()
        }

        /// Seeds a configmap with the given data and annotations, stamping
        /// a fresh `resourceVersion`. Returns the assigned QN.
        fn seed(&self, namespace: &str, name: &str, data: &[(&str, &str)], annotations: &[(&str, &str)]) -> Qn {
            let rv = self.next_rv();
            let data_map: serde_json::Map<String, serde_json::Value> = data
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                .collect();
            let ann_map: serde_json::Map<String, serde_json::Value> = annotations
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                .collect();
            let value = serde_json::json!({
                "metadata": {
                    "namespace": namespace,
                    "name": name,
                    "resourceVersion": rv,
                    "annotations": ann_map,
                },
                "data": data_map,
            });
            let qn = Qn::new(namespace, name);
            self.objects.write().unwrap().insert(qn.clone(), value);
            qn
        }

        fn mutate_data(&self, qn: &Qn, data: &[(&str, &str)]) {
            let rv = self.next_rv();
            let mut guard = self.objects.write().unwrap();
            let value = guard.get_mut(qn).unwrap();
            let data_map: serde_json::Map<String, serde_json::Value> = data
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                .collect();
            value["data"] = serde_json::Value::Object(data_map);
            value["metadata"]["resourceVersion"] = serde_json::Value::String(rv);
        }

        fn annotation(&self, qn: &Qn, suffix: &str) -> Option<String> {
            let guard = self.objects.read().unwrap();
            let value = guard.get(qn)?;
            value
                .pointer(&format!("/metadata/annotations/{}", escape_pointer_token(&full_key(suffix))))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        }

        fn exists(&self, qn: &Qn) -> bool {
            self.objects.read().unwrap().contains_key(qn)
        }

        fn data_value(&self, qn: &Qn, key: &str) -> Option<String> {
            let guard = self.objects.read().unwrap();
            guard
                .get(qn)?
                .pointer(&format!("/data/{key}"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        }
    }

    #[async_trait]
    impl Gateway<ConfigMap> for MockGateway {
        async fn list(&self, _namespace: Option<&str>) -> crate::errors::GatewayResult<Vec<ConfigMap>> {
            Ok(self
                .objects
                .read()
                .unwrap()
                .values()
                .map(|v| serde_json::from_value(v.clone()).unwrap())
                .collect())
        }

        fn watch(&self, _timeout_secs: u32) -> EventStream<ConfigMap> {
            Box::pin(futures::stream::empty())
        }

        async fn get(&self, qn: &Qn) -> crate::errors::GatewayResult<ConfigMap> {
            self.objects
                .read()
                .unwrap()
                .get(qn)
                .cloned()
                .map(|v| serde_json::from_value(v).unwrap())
                .ok_or_else(|| GatewayError::NotFound { kind: "ConfigMap", qn: qn.to_string() })
        }

        async fn patch(&self, qn: &Qn, patch: &json_patch::Patch) -> crate::errors::GatewayResult<()> {
            let mut guard = self.objects.write().unwrap();
            let value = guard
                .get_mut(qn)
                .ok_or_else(|| GatewayError::NotFound { kind: "ConfigMap", qn: qn.to_string() })?;
            json_patch::patch(value, patch).map_err(|e| GatewayError::Transport { message: e.to_string() })?;
            Ok(())
        }

        async fn create(&self, resource: ConfigMap) -> crate::errors::GatewayResult<()> {
            let qn = qn_of(&resource).unwrap();
            let mut guard = self.objects.write().unwrap();
            if guard.contains_key(&qn) {
                return Err(GatewayError::AlreadyExists { kind: "ConfigMap", qn: qn.to_string() });
            }
            let mut value = serde_json::to_value(&resource).unwrap();
            value["metadata"]["resourceVersion"] = serde_json::Value::String(self.next_rv());
            guard.insert(qn, value);
            Ok(())
        }

        async fn delete(&self, qn: &Qn) -> crate::errors::GatewayResult<()> {
            self.objects.write().unwrap().remove(qn);
            Ok(())
        }
    }

    fn reconciler() -> (Arc<MockGateway>, Reconciler<ConfigMap, MockGateway>) {
        let gateway = Arc::new(MockGateway::new());
        let indices = Arc::new(ReflectionIndices::new());
        let reconciler = Reconciler::new(gateway.clone(), indices);
        (gateway, reconciler)
    }

    fn upsert_event(gateway: &MockGateway, qn: &Qn) -> ResourceEvent<ConfigMap> {
        let value = gateway.objects.read().unwrap().get(qn).unwrap().clone();
        ResourceEvent::Modified(serde_json::from_value(value).unwrap())
    }

    #[tokio::test]
    async fn scenario_1_direct_sync() {
        let (gateway, r) = reconciler();
        let source = gateway.seed("ns-src", "s", &[("a", "MQ==")], &[(crate::annotations::KEY_ALLOWED, "true")]);
        let mirror = gateway.seed(
            "ns-dst",
            "s",
            &[],
            &[(crate::annotations::KEY_REFLECTS, "ns-src/s")],
        );

        r.on_resource(upsert_event(&gateway, &source)).await;
        r.on_resource(upsert_event(&gateway, &mirror)).await;

        assert_eq!(gateway.data_value(&mirror, "a").as_deref(), Some("MQ=="));
        assert!(gateway.annotation(&mirror, KEY_REFLECTED_VERSION).is_some());
        assert!(gateway.annotation(&mirror, KEY_REFLECTED_AT).is_some());

        gateway.mutate_data(&source, &[("a", "Mg==")]);
        r.on_resource(upsert_event(&gateway, &source)).await;
        assert_eq!(gateway.data_value(&mirror, "a").as_deref(), Some("Mg=="));
    }

    #[tokio::test]
    async fn scenario_2_auto_fan_out_and_tighten() {
        let (gateway, r) = reconciler();
        r.on_namespace(ResourceEvent::Added(namespace_obj("a"))).await;
        r.on_namespace(ResourceEvent::Added(namespace_obj("b"))).await;
        r.on_namespace(ResourceEvent::Added(namespace_obj("c"))).await;

        let source = gateway.seed(
            "ns-src",
            "cm",
            &[("k", "v")],
            &[
                (crate::annotations::KEY_ALLOWED, "true"),
                (crate::annotations::KEY_AUTO_ENABLED, "true"),
                (crate::annotations::KEY_AUTO_NAMESPACES, "a,b"),
            ],
        );
        r.on_resource(upsert_event(&gateway, &source)).await;

        let mirror_a = Qn::new("a", "cm");
        let mirror_b = Qn::new("b", "cm");
        let mirror_c = Qn::new("c", "cm");
        assert!(gateway.exists(&mirror_a));
        assert!(gateway.exists(&mirror_b));
        assert!(!gateway.exists(&mirror_c));
        assert_eq!(gateway.annotation(&mirror_a, "auto-reflects").as_deref(), Some("true"));

        // tighten auto-namespaces to "a" only
        gateway.objects.write().unwrap().get_mut(&source).unwrap()["metadata"]["annotations"]
            [full_key(crate::annotations::KEY_AUTO_NAMESPACES)] = serde_json::Value::String("a".to_string());
        r.on_resource(upsert_event(&gateway, &source)).await;

        assert!(!gateway.exists(&mirror_b));
        assert!(gateway.exists(&mirror_a));
    }

    #[tokio::test]
    async fn scenario_4_source_deletion_cleans_up_auto_mirrors_only() {
        let (gateway, r) = reconciler();
        r.on_namespace(ResourceEvent::Added(namespace_obj("a"))).await;

        let source = gateway.seed(
            "ns-src",
            "cm",
            &[("k", "v")],
            &[
                (crate::annotations::KEY_ALLOWED, "true"),
                (crate::annotations::KEY_AUTO_ENABLED, "true"),
                (crate::annotations::KEY_AUTO_NAMESPACES, "a"),
            ],
        );
        r.on_resource(upsert_event(&gateway, &source)).await;
        let auto_mirror = Qn::new("a", "cm");
        assert!(gateway.exists(&auto_mirror));

        let direct_mirror = gateway.seed("ns-dst", "cm", &[], &[(crate::annotations::KEY_REFLECTS, "ns-src/cm")]);
        r.on_resource(upsert_event(&gateway, &direct_mirror)).await;

        let source_obj: ConfigMap =
            serde_json::from_value(gateway.objects.read().unwrap().get(&source).unwrap().clone()).unwrap();
        gateway.objects.write().unwrap().remove(&source);
        r.on_resource(ResourceEvent::Deleted(source_obj)).await;

        assert!(!gateway.exists(&auto_mirror));
        assert!(gateway.exists(&direct_mirror), "direct mirrors survive source deletion");
    }

    #[tokio::test]
    async fn p5_permission_revocation_leaves_existing_mirror_untouched_but_stops_sync() {
        let (gateway, r) = reconciler();
        let source = gateway.seed("ns-src", "s", &[("a", "MQ==")], &[(crate::annotations::KEY_ALLOWED, "true")]);
        let mirror = gateway.seed("ns-dst", "s", &[], &[(crate::annotations::KEY_REFLECTS, "ns-src/s")]);
        r.on_resource(upsert_event(&gateway, &source)).await;
        r.on_resource(upsert_event(&gateway, &mirror)).await;
        assert_eq!(gateway.data_value(&mirror, "a").as_deref(), Some("MQ=="));

        // revoke permission and change the source payload
        gateway.objects.write().unwrap().get_mut(&source).unwrap()["metadata"]["annotations"]
            [full_key(crate::annotations::KEY_ALLOWED)] = serde_json::Value::String("false".to_string());
        gateway.mutate_data(&source, &[("a", "Mg==")]);
        r.on_resource(upsert_event(&gateway, &source)).await;

        assert!(gateway.exists(&mirror), "existing mirror is left in place");
        assert_eq!(gateway.data_value(&mirror, "a").as_deref(), Some("MQ=="), "no sync occurs once permission is revoked");
    }

    #[tokio::test]
    async fn p6_session_wipe_empties_indices() {
        let (gateway, r) = reconciler();
        let source = gateway.seed("ns-src", "s", &[("a", "MQ==")], &[(crate::annotations::KEY_ALLOWED, "true")]);
        let mirror = gateway.seed("ns-dst", "s", &[], &[(crate::annotations::KEY_REFLECTS, "ns-src/s")]);
        r.on_resource(upsert_event(&gateway, &source)).await;
        r.on_resource(upsert_event(&gateway, &mirror)).await;
        assert!(!r.indices.all_properties().is_empty());

        r.on_session_closed().await;
        assert!(r.indices.all_properties().is_empty());
    }

    #[tokio::test]
    async fn scenario_3_regex_auto_namespaces() {
        let (gateway, r) = reconciler();
        r.on_namespace(ResourceEvent::Added(namespace_obj("team-red"))).await;
        r.on_namespace(ResourceEvent::Added(namespace_obj("team-blue"))).await;
        r.on_namespace(ResourceEvent::Added(namespace_obj("infra"))).await;

        let source = gateway.seed(
            "ns-src",
            "cm",
            &[("k", "v")],
            &[
                (crate::annotations::KEY_ALLOWED, "true"),
                (crate::annotations::KEY_ALLOWED_NAMESPACES, "team-.*"),
                (crate::annotations::KEY_AUTO_ENABLED, "true"),
                (crate::annotations::KEY_AUTO_NAMESPACES, "team-.*"),
            ],
        );
        r.on_resource(upsert_event(&gateway, &source)).await;

        assert!(gateway.exists(&Qn::new("team-red", "cm")));
        assert!(gateway.exists(&Qn::new("team-blue", "cm")));
        assert!(!gateway.exists(&Qn::new("infra", "cm")));
    }

    #[tokio::test]
    async fn p1_a_mirror_is_never_both_direct_and_auto() {
        let (gateway, r) = reconciler();
        r.on_namespace(ResourceEvent::Added(namespace_obj("a"))).await;
        let source = gateway.seed(
            "ns-src",
            "cm",
            &[("k", "v")],
            &[
                (crate::annotations::KEY_ALLOWED, "true"),
                (crate::annotations::KEY_AUTO_ENABLED, "true"),
                (crate::annotations::KEY_AUTO_NAMESPACES, "a"),
            ],
        );
        r.on_resource(upsert_event(&gateway, &source)).await;

        let auto_mirror = Qn::new("a", "cm");
        assert!(r.indices.auto_mirrors(&source).contains(&auto_mirror));
        assert!(!r.indices.direct_mirrors(&source).contains(&auto_mirror));
    }

    fn namespace_obj(name: &str) -> Namespace {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": name }
        }))
        .unwrap()
    }
}
