//! In-memory versioned store.
//!
//! Reference backend for tests and the local control-plane server. Honors
//! the full store contract: resource versions, tombstones held by
//! finalizers, label selectors and broadcast watches.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::error::{LicensingError, LicensingResult};
use crate::infrastructure::{ResourceStore, Selector, Stores, WatchEvent};
use crate::types::{Entitlement, ObjectKey, Request, Resource, Secret};

const WATCH_CAPACITY: usize = 1024;

pub struct Collection<R> {
    objects: RwLock<BTreeMap<ObjectKey, R>>,
    events: broadcast::Sender<WatchEvent<R>>,
}

impl<R: Resource> Collection<R> {
    fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    fn publish(&self, event: WatchEvent<R>) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn not_found(key: &ObjectKey) -> LicensingError {
        LicensingError::NotFound {
            kind: R::KIND,
            key: key.clone(),
        }
    }

    fn check_version(current: &R, incoming: &R) -> LicensingResult<()> {
        if current.meta().resource_version != incoming.meta().resource_version {
            return Err(LicensingError::Conflict {
                kind: R::KIND,
                key: incoming.key(),
            });
        }
        Ok(())
    }
}

/// Store for all three resource kinds, sharing one version counter.
pub struct InMemoryStore {
    secrets: Collection<Secret>,
    entitlements: Collection<Entitlement>,
    requests: Collection<Request>,
    versions: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            secrets: Collection::new(),
            entitlements: Collection::new(),
            requests: Collection::new(),
            versions: AtomicU64::new(0),
        }
    }

    /// Shared handle plus the `Stores` bundle reconcilers consume.
    pub fn shared() -> (Arc<Self>, Stores) {
        let store = Arc::new(Self::new());
        let stores = Stores::from_backend(store.clone());
        (store, stores)
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Kinds the in-memory store can hold.
pub trait InMemoryResource: Resource {
    fn collection(store: &InMemoryStore) -> &Collection<Self>;
}

impl InMemoryResource for Secret {
    fn collection(store: &InMemoryStore) -> &Collection<Self> {
        &store.secrets
    }
}

impl InMemoryResource for Entitlement {
    fn collection(store: &InMemoryStore) -> &Collection<Self> {
        &store.entitlements
    }
}

impl InMemoryResource for Request {
    fn collection(store: &InMemoryStore) -> &Collection<Self> {
        &store.requests
    }
}

impl<R: InMemoryResource> ResourceStore<R> for InMemoryStore {
    fn get(&self, key: &ObjectKey) -> LicensingResult<R> {
        let col = R::collection(self);
        let objects = col.objects.read().unwrap_or_else(|e| e.into_inner());
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| Collection::<R>::not_found(key))
    }

    fn list(&self, selector: &Selector) -> LicensingResult<Vec<R>> {
        let col = R::collection(self);
        let objects = col.objects.read().unwrap_or_else(|e| e.into_inner());
        Ok(objects
            .values()
            .filter(|obj| selector.matches(obj.meta()))
            .cloned()
            .collect())
    }

    fn create(&self, mut object: R) -> LicensingResult<R> {
        let col = R::collection(self);
        let mut objects = col.objects.write().unwrap_or_else(|e| e.into_inner());
        let key = object.key();
        if objects.contains_key(&key) {
            return Err(LicensingError::AlreadyExists { kind: R::KIND, key });
        }

        let meta = object.meta_mut();
        meta.uid = nanoid::nanoid!();
        meta.resource_version = self.next_version();
        meta.deletion_timestamp = None;

        objects.insert(key, object.clone());
        col.publish(WatchEvent::Applied(object.clone()));
        Ok(object)
    }

    fn update(&self, mut object: R) -> LicensingResult<R> {
        let col = R::collection(self);
        let mut objects = col.objects.write().unwrap_or_else(|e| e.into_inner());
        let key = object.key();
        let current = objects
            .get(&key)
            .ok_or_else(|| Collection::<R>::not_found(&key))?;
        Collection::check_version(current, &object)?;

        *object.status_mut() = current.status().clone();
        let deletion_timestamp = current.meta().deletion_timestamp;
        let uid = current.meta().uid.clone();
        let meta = object.meta_mut();
        meta.uid = uid;
        meta.deletion_timestamp = deletion_timestamp;
        meta.resource_version = self.next_version();

        if object.meta().is_deleting() && object.meta().finalizers.is_empty() {
            objects.remove(&key);
            col.publish(WatchEvent::Deleted(object.clone()));
        } else {
            objects.insert(key, object.clone());
            col.publish(WatchEvent::Applied(object.clone()));
        }
        Ok(object)
    }

    fn update_status(&self, object: R) -> LicensingResult<R> {
        let col = R::collection(self);
        let mut objects = col.objects.write().unwrap_or_else(|e| e.into_inner());
        let key = object.key();
        let current = objects
            .get(&key)
            .ok_or_else(|| Collection::<R>::not_found(&key))?;
        Collection::check_version(current, &object)?;

        let mut next = current.clone();
        *next.status_mut() = object.status().clone();
        next.meta_mut().resource_version = self.next_version();

        objects.insert(key, next.clone());
        col.publish(WatchEvent::Applied(next.clone()));
        Ok(next)
    }

    fn delete(&self, key: &ObjectKey) -> LicensingResult<()> {
        let col = R::collection(self);
        let mut objects = col.objects.write().unwrap_or_else(|e| e.into_inner());
        let current = objects
            .get_mut(key)
            .ok_or_else(|| Collection::<R>::not_found(key))?;
        if current.meta().is_deleting() {
            return Ok(());
        }

        let version = self.next_version();
        let meta = current.meta_mut();
        meta.deletion_timestamp = Some(Utc::now());
        meta.resource_version = version;

        if current.meta().finalizers.is_empty() {
            if let Some(removed) = objects.remove(key) {
                col.publish(WatchEvent::Deleted(removed));
            }
        } else {
            let tombstone = current.clone();
            col.publish(WatchEvent::Applied(tombstone));
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<R>> {
        R::collection(self).events.subscribe()
    }
}
