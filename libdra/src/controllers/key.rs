//! Typed work-queue keys: `kind:namespace/name`.

use anyhow::{Result, bail};

pub(crate) const CLAIM_KIND: &str = "claim";
pub(crate) const SCHEDULING_KIND: &str = "podscheduling";

/// A parsed work-queue key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ObjectKey {
    Claim { namespace: String, name: String },
    Scheduling { namespace: String, name: String },
}

pub(crate) fn claim_key(namespace: &str, name: &str) -> String {
    format!("{CLAIM_KIND}:{namespace}/{name}")
}

pub(crate) fn scheduling_key(namespace: &str, name: &str) -> String {
    format!("{SCHEDULING_KIND}:{namespace}/{name}")
}

/// Parse a queue key. Rejections carry everything after the first colon
/// (the whole key when there is none).
pub(crate) fn parse_key(key: &str) -> Result<ObjectKey> {
    let Some((kind, tail)) = key.split_once(':') else {
        bail!("unexpected key format: {key:?}");
    };
    let Some((namespace, name)) = tail.split_once('/') else {
        bail!("unexpected key format: {tail:?}");
    };
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        bail!("unexpected key format: {tail:?}");
    }
    match kind {
        CLAIM_KIND => Ok(ObjectKey::Claim {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }),
        SCHEDULING_KIND => Ok(ObjectKey::Scheduling {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }),
        _ => bail!("unexpected key format: {tail:?}"),
    }
}
