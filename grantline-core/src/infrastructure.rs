use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::LicensingResult;
use crate::retry::{retry_on_conflict, RetryPolicy};
use crate::types::{Entitlement, ObjectKey, ObjectMeta, Request, Resource, Secret};

// The store is consumed, not owned: a production deployment plugs in its own
// versioned backend. Calls are synchronous; reconcilers run on blocking
// worker threads.

/// A change observed on the watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<R> {
    /// Created or updated, including a tombstone being set
    Applied(R),
    /// Physically removed
    Deleted(R),
}

impl<R: Resource> WatchEvent<R> {
    pub fn object(&self) -> &R {
        match self {
            WatchEvent::Applied(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, WatchEvent::Deleted(_))
    }
}

/// Namespace and label filter for `list`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub namespace: Option<String>,
    /// Only objects carrying this label key
    pub label: Option<String>,
}

impl Selector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        self.namespace.as_ref().is_none_or(|ns| *ns == meta.namespace)
            && self.label.as_ref().is_none_or(|label| meta.has_label(label))
    }
}

/// Defines the contract for versioned object storage backends.
pub trait ResourceStore<R: Resource>: Send + Sync {
    fn get(&self, key: &ObjectKey) -> LicensingResult<R>;

    fn list(&self, selector: &Selector) -> LicensingResult<Vec<R>>;

    /// Fails with `AlreadyExists` if the key is taken.
    fn create(&self, object: R) -> LicensingResult<R>;

    /// Replaces metadata and spec, keeping the stored status.
    /// Fails with `Conflict` if `object` carries a stale resource version.
    fn update(&self, object: R) -> LicensingResult<R>;

    /// Replaces only the status. Same version check as `update`.
    fn update_status(&self, object: R) -> LicensingResult<R>;

    /// Removes the object, or marks it with a tombstone while finalizers remain.
    fn delete(&self, key: &ObjectKey) -> LicensingResult<()>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent<R>>;
}

/// Handles to the three stores the reconcilers share.
#[derive(Clone)]
pub struct Stores {
    pub secrets: Arc<dyn ResourceStore<Secret>>,
    pub entitlements: Arc<dyn ResourceStore<Entitlement>>,
    pub requests: Arc<dyn ResourceStore<Request>>,
}

impl Stores {
    /// Uses one backend for all three kinds.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: ResourceStore<Secret> + ResourceStore<Entitlement> + ResourceStore<Request> + 'static,
    {
        Self {
            secrets: backend.clone(),
            entitlements: backend.clone(),
            requests: backend,
        }
    }
}

/// Read-modify-write of metadata/spec under the retry policy.
///
/// `mutate` runs on a fresh copy on every attempt and returns whether it
/// changed anything. Returns `None` when no write was needed.
pub fn update_with<R, F>(
    store: &dyn ResourceStore<R>,
    key: &ObjectKey,
    policy: &RetryPolicy,
    mut mutate: F,
) -> LicensingResult<Option<R>>
where
    R: Resource,
    F: FnMut(&mut R) -> LicensingResult<bool>,
{
    retry_on_conflict(policy, || {
        let mut object = store.get(key)?;
        if !mutate(&mut object)? {
            return Ok(None);
        }
        store.update(object).map(Some)
    })
}

/// Read-modify-write of the status under the retry policy. See [`update_with`].
pub fn update_status_with<R, F>(
    store: &dyn ResourceStore<R>,
    key: &ObjectKey,
    policy: &RetryPolicy,
    mut mutate: F,
) -> LicensingResult<Option<R>>
where
    R: Resource,
    F: FnMut(&mut R) -> LicensingResult<bool>,
{
    retry_on_conflict(policy, || {
        let mut object = store.get(key)?;
        if !mutate(&mut object)? {
            return Ok(None);
        }
        store.update_status(object).map(Some)
    })
}
