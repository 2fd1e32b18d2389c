use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label that marks a secret as carrying a license token.
pub const LICENSE_LABEL: &str = "licensing.grantline.io/license";

/// Data key under which a labeled secret stores the signed token.
pub const LICENSE_DATA_KEY: &str = "license";

/// Finalizer the secret reconciler holds so grant cleanup runs before removal.
pub const GRANT_CLEANUP_FINALIZER: &str = "licensing.grantline.io/grant-cleanup";

/// Finalizer the request reconciler holds so grants are released before removal.
pub const GRANT_RELEASE_FINALIZER: &str = "licensing.grantline.io/grant-release";

/// The three resource kinds the reconcilers cooperate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Opaque token carrier
    Secret,
    /// Aggregated grant pool
    Entitlement,
    /// Per-application usage intent
    Request,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Secret => write!(f, "secret"),
            ResourceKind::Entitlement => write!(f, "entitlement"),
            ResourceKind::Request => write!(f, "request"),
        }
    }
}

/// A namespaced reference to an object in the store
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Store-managed metadata carried by every object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Assigned by the store on create; distinguishes re-created objects with the same key
    #[serde(default)]
    pub uid: String,
    /// Opaque version token for optimistic concurrency
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// Tombstone marker, set when deletion was requested while finalizers were held
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains_key(label)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true if the finalizer was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true if the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }
}

/// An object kept in the versioned store.
///
/// `update` replaces everything except the status; `update_status` replaces
/// only the status. Both are version-checked.
pub trait Resource: Clone + std::fmt::Debug + Send + Sync + 'static {
    type Status: Clone + std::fmt::Debug + PartialEq + Send + Sync;

    const KIND: ResourceKind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn status(&self) -> &Self::Status;
    fn status_mut(&mut self) -> &mut Self::Status;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}
