//! Module D, reflection indices.
//!
//! Four in-memory maps, live only for the lifetime of the process
//! (spec.md §3/§9). Concurrency primitives follow the teacher's
//! `k8s::shared_cache::SharedWatchCache` pattern: plain `RwLock`/`Mutex`
//! wrapped `HashMap`/`HashSet`, not a lock-free crate, that is what every
//! concurrent cache in the retrieval pack reaches for.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::annotations::ReflectionProperties;
use crate::qn::Qn;

/// The four indices bound to a single mirrored kind (spec.md §3). The
/// namespace watcher's reconciler shares the same `propertiesIndex` /
/// `autoReflectionIndex` through the `Arc` this struct is always held
/// behind (spec.md §5: "the namespace reconciler path touches the same
/// indices").
#[derive(Default)]
pub struct ReflectionIndices {
    direct: RwLock<HashMap<Qn, HashSet<Qn>>>,
    auto: RwLock<HashMap<Qn, HashSet<Qn>>>,
    properties: RwLock<HashMap<Qn, ReflectionProperties>>,
    not_found: RwLock<HashSet<Qn>>,
}

impl ReflectionIndices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_properties(&self, qn: Qn, rp: ReflectionProperties) {
        self.properties.write().unwrap().insert(qn, rp);
    }

    pub fn remove_properties(&self, qn: &Qn) {
        self.properties.write().unwrap().remove(qn);
    }

    pub fn properties(&self, qn: &Qn) -> Option<ReflectionProperties> {
        self.properties.read().unwrap().get(qn).cloned()
    }

    /// Snapshot of every `(source, RP)` pair currently known, used by the
    /// namespace-Added handler (spec.md §4.E) to find sources that should
    /// auto-create into a newly observed namespace.
    pub fn all_properties(&self) -> Vec<(Qn, ReflectionProperties)> {
        self.properties
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn link_direct(&self, source: Qn, mirror: Qn) {
        self.direct.write().unwrap().entry(source).or_default().insert(mirror);
    }

    pub fn unlink_direct(&self, source: &Qn, mirror: &Qn) {
        let mut guard = self.direct.write().unwrap();
        if let Some(set) = guard.get_mut(source) {
            set.remove(mirror);
            if set.is_empty() {
                guard.remove(source);
            }
        }
    }

    pub fn direct_mirrors(&self, source: &Qn) -> HashSet<Qn> {
        self.direct.read().unwrap().get(source).cloned().unwrap_or_default()
    }

    pub fn link_auto(&self, source: Qn, mirror: Qn) {
        self.auto.write().unwrap().entry(source).or_default().insert(mirror);
    }

    pub fn unlink_auto(&self, source: &Qn, mirror: &Qn) {
        let mut guard = self.auto.write().unwrap();
        if let Some(set) = guard.get_mut(source) {
            set.remove(mirror);
            if set.is_empty() {
                guard.remove(source);
            }
        }
    }

    pub fn auto_mirrors(&self, source: &Qn) -> HashSet<Qn> {
        self.auto.read().unwrap().get(source).cloned().unwrap_or_default()
    }

    /// Drops every auto-mirror record in the given namespace, across all
    /// sources (used on namespace-Deleted, spec.md §4.E).
    pub fn drop_auto_mirrors_in_namespace(&self, namespace: &str) {
        let mut guard = self.auto.write().unwrap();
        guard.retain(|_source, mirrors| {
            mirrors.retain(|m| m.namespace != namespace);
            !mirrors.is_empty()
        });
    }

    pub fn mark_not_found(&self, source: Qn) {
        self.not_found.write().unwrap().insert(source);
    }

    pub fn clear_not_found(&self, source: &Qn) {
        self.not_found.write().unwrap().remove(source);
    }

    pub fn is_not_found(&self, source: &Qn) -> bool {
        self.not_found.read().unwrap().contains(source)
    }

    /// Wipes all four indices atomically with respect to readers (spec.md
    /// §3 invariant, §4.E `OnSessionClosed`). A writer holding all four
    /// locks at once is the "atomic clear" the spec calls for in the
    /// absence of a language-level atomic-clear primitive (§9 design note).
    pub fn clear_all(&self) {
        let mut direct = self.direct.write().unwrap();
        let mut auto = self.auto.write().unwrap();
        let mut properties = self.properties.write().unwrap();
        let mut not_found = self.not_found.write().unwrap();
        direct.clear();
        auto.clear();
        properties.clear();
        not_found.clear();
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.direct.read().unwrap().is_empty()
            && self.auto.read().unwrap().is_empty()
            && self.properties.read().unwrap().is_empty()
            && self.not_found.read().unwrap().is_empty()
    }
}
