//! Drift detection for rendered DaemonSets
//!
//! The hash of the last applied DaemonSet is stored as an annotation on the
//! live object. A pass only writes the DaemonSet when the freshly rendered
//! hash differs from the stored one.

use k8s_openapi::api::apps::v1::DaemonSet;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Annotation holding the hash of the last applied DaemonSet
pub const HASH_ANNOTATION: &str = "xdxct.com/last-applied-hash";

/// Stable digest of a rendered DaemonSet.
///
/// The object is serialized to JSON with sorted object keys, so map
/// iteration order never changes the result. Container env lists are
/// compared by name, and the hash annotation itself is left out.
pub fn daemon_set_hash(ds: &DaemonSet) -> Result<String> {
    let mut canonical = ds.clone();

    if let Some(annotations) = canonical.metadata.annotations.as_mut() {
        annotations.remove(HASH_ANNOTATION);
    }
    if let Some(pod_spec) = canonical
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
    {
        let containers = pod_spec
            .containers
            .iter_mut()
            .chain(pod_spec.init_containers.iter_mut().flatten());
        for container in containers {
            if let Some(env) = container.env.as_mut() {
                env.sort_by(|a, b| a.name.cmp(&b.name));
            }
        }
    }

    // serde_json::Value keeps object keys in a BTreeMap
    let value = serde_json::to_value(&canonical)?;
    let bytes = serde_json::to_vec(&value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Hash stored on a live DaemonSet, if any
pub fn stored_hash(ds: &DaemonSet) -> Option<&str> {
    ds.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(HASH_ANNOTATION))
        .map(String::as_str)
}

/// Stamp `hash` onto the DaemonSet's annotations
pub fn set_hash(ds: &mut DaemonSet, hash: String) {
    ds.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(HASH_ANNOTATION.to_string(), hash);
}
