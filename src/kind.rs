//! Kind descriptor: the "abstract base class of mirrors in source" design
//! note from spec.md §9, reified as a trait implemented once per concrete
//! Kubernetes kind instead of a class hierarchy. `Reconciler<K>` and the
//! gateway are generic over `K: MirrorKind`; behavior is shared, only the
//! descriptor and a couple of per-kind hooks vary.

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Static facts about a mirrored kind: its name (for logs/errors) and the
/// JSON-pointer paths Sync is allowed to touch (spec.md §4.E Sync step 1).
/// `/type` is never listed for secrets, it is immutable after creation.
#[derive(Debug, Clone, Copy)]
pub struct KindSpec {
    pub name: &'static str,
    pub payload_pointers: &'static [&'static str],
}

pub trait MirrorKind:
    kube::Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const SPEC: KindSpec;

    /// The secret watcher drops any resource whose `type` starts with
    /// `helm.sh` before it is ever enqueued (spec.md §4.C/§6). ConfigMaps
    /// have no such filter.
    fn is_filtered_from_watch(&self) -> bool {
        false
    }
}

impl MirrorKind for Secret {
    const SPEC: KindSpec = KindSpec {
        name: "Secret",
        payload_pointers: &["/data", "/binaryData"],
    };

    fn is_filtered_from_watch(&self) -> bool {
        self.type_
            .as_deref()
            .is_some_and(|t| t.starts_with("helm.sh"))
    }
}

impl MirrorKind for ConfigMap {
    const SPEC: KindSpec = KindSpec {
        name: "ConfigMap",
        payload_pointers: &["/data", "/binaryData"],
    };
}

/// Extracts `resourceVersion` the way every reconciler code path needs it.
pub fn resource_version<K: kube::Resource>(obj: &K) -> Option<String> {
    obj.resource_version()
}

pub fn qn_of<K: kube::Resource>(obj: &K) -> Option<crate::qn::Qn> {
    let ns = obj.namespace()?;
    let name = obj.name_any();
    Some(crate::qn::Qn::new(ns, name))
}
